//! Structural optimizer.
//!
//! Every pass has the shape `fn(Ast, &mut Session) -> Result<Ast>`; the
//! driver in [`optimize`] runs them in order and repeats the simplifying
//! stages until the number of reachable nodes stops changing.

pub mod expansion;
pub mod links;
pub mod simplify;
pub mod terms;

use crate::ast::{Ast, LinkId, LinkTable};
use crate::backend::SearchBackend;
use crate::config::CompileOptions;
use crate::error::Result;
use crate::graph::RelationshipGraph;
use crate::metadata::MetadataProvider;
use std::collections::BTreeSet;
use tracing::debug;

/// State shared by every pass of one compilation
pub struct Session<'a> {
    pub options: &'a CompileOptions,
    pub metadata: MetadataProvider<'a>,
    /// Indices any part of the query touched
    pub used_indexes: BTreeSet<String>,
    /// Link the final query runs against; the own link unless re-rooted
    pub search_link: Option<LinkId>,
    graph: Option<RelationshipGraph>,
}

impl<'a> Session<'a> {
    pub fn new(backend: &'a dyn SearchBackend, options: &'a CompileOptions) -> Self {
        Self {
            options,
            metadata: MetadataProvider::new(backend, options.analysis_cache_size),
            used_indexes: BTreeSet::new(),
            search_link: None,
            graph: None,
        }
    }

    /// Relationship graph, built from `links` on first use
    pub fn graph(&mut self, links: &LinkTable) -> &mut RelationshipGraph {
        self.graph
            .get_or_insert_with(|| RelationshipGraph::from_links(links))
    }

    pub fn is_catch_all(&self, fieldname: &str) -> bool {
        fieldname == self.options.catch_all_field || fieldname == crate::query::CATCH_ALL_FIELD
    }
}

pub type Pass = fn(Ast, &mut Session<'_>) -> Result<Ast>;

/// Run one pass and log its effect
pub fn run_pass(name: &str, pass: Pass, ast: Ast, session: &mut Session<'_>) -> Result<Ast> {
    let before = ast.node_count();
    let ast = pass(ast, session)?;
    debug!(pass = name, before, after = ast.node_count(), "optimizer pass");
    Ok(ast)
}

/// Repeat a sequence of passes until the reachable node count is stable
pub fn fixed_point(
    name: &str,
    passes: &[(&str, Pass)],
    mut ast: Ast,
    session: &mut Session<'_>,
) -> Result<Ast> {
    for iteration in 0..session.options.max_fixed_point_iterations.max(1) {
        let before = ast.node_count();
        for &(pass_name, pass) in passes {
            ast = run_pass(pass_name, pass, ast, session)?;
        }
        let after = ast.node_count();
        if after == before {
            debug!(stage = name, iterations = iteration + 1, "fixed point reached");
            return Ok(ast);
        }
    }
    debug!(stage = name, "fixed point iteration limit reached");
    Ok(ast)
}

/// Run the full structural pipeline over a parsed query whose own link is
/// already installed
pub fn optimize(ast: Ast, session: &mut Session<'_>) -> Result<Ast> {
    let ast = run_pass("nested_group_fixup", links::nested_group_fixup, ast, session)?;
    let ast = run_pass("assign_links", links::expand_all_and_assign_links, ast, session)?;
    let ast = fixed_point("rollup", &[("rollup", simplify::rollup)], ast, session)?;
    let ast = run_pass("inject_expansions", expansion::inject_expansions, ast, session)?;
    let ast = fixed_point(
        "merge_expansions",
        &[
            ("merge_expansions", expansion::merge_expansions),
            ("rollup", simplify::rollup),
        ],
        ast,
        session,
    )?;
    let ast = run_pass("rewrite_indirect", links::rewrite_indirect_links, ast, session)?;
    let ast = run_pass("field_lists", links::expand_field_lists, ast, session)?;
    let ast = run_pass("validate_proximity", simplify::validate_proximity, ast, session)?;
    let ast = fixed_point(
        "simplify",
        &[
            ("merge_literals", simplify::merge_literals),
            ("merge_arrays", simplify::merge_arrays),
            ("reduce_single_children", simplify::reduce_single_children),
            ("rollup", simplify::rollup),
        ],
        ast,
        session,
    )?;
    run_pass("generated_to_or", expansion::generated_to_or, ast, session)
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::backend::MemoryBackend;
    use serde_json::json;

    /// Two indices: `main` (own) and `books`, joined on main.book_id = books.id
    pub fn library() -> MemoryBackend {
        MemoryBackend::from_json(json!({
            "indices": {
                "main": {
                    "mapping": {"primary_key": "id", "fields": {
                        "id": {"type": "long"},
                        "book_id": {"type": "long"},
                        "parent_id": {"type": "long"},
                        "name": {"type": "text", "analyzer": "standard"},
                        "body": {"type": "text", "analyzer": "english"},
                        "tag": {"type": "keyword"},
                        "comments": {"type": "nested"},
                        "comments.author": {"type": "keyword"},
                        "comments.text": {"type": "text"},
                        "outside": {"type": "object"},
                        "outside.inside": {"type": "keyword"}
                    }},
                    "documents": [
                        {"id": 1, "book_id": 10, "name": "Ann Smith", "body": "The dogs bark", "tag": "red",
                         "comments": [{"author": "bob", "text": "great read"}]},
                        {"id": 2, "book_id": 20, "parent_id": 1, "name": "Bob Jones", "body": "Cats sleep", "tag": "blue",
                         "comments": [{"author": "ann", "text": "dull"}]},
                        {"id": 3, "book_id": 10, "name": "Cy Young", "body": "A c-note found", "tag": "red"}
                    ]
                },
                "books": {
                    "mapping": {"primary_key": "id", "fields": {
                        "id": {"type": "long"},
                        "author_id": {"type": "long"},
                        "title": {"type": "text", "analyzer": "english"},
                        "isbn": {"type": "keyword"}
                    }},
                    "documents": [
                        {"id": 10, "author_id": 100, "title": "Rust in Action", "isbn": "A1"},
                        {"id": 20, "author_id": 200, "title": "Dogs of War", "isbn": "B2"}
                    ]
                },
                "authors": {
                    "mapping": {"primary_key": "id", "fields": {
                        "id": {"type": "long"},
                        "author_name": {"type": "text"}
                    }},
                    "documents": [
                        {"id": 100, "author_name": "Tim McNamara"},
                        {"id": 200, "author_name": "Frederick Forsyth"}
                    ]
                }
            }
        }))
        .unwrap()
    }
}
