//! Query compilation pipeline.
//!
//! ```text
//! text -> parse -> own link -> re-root -> optimize -> resolve -> analyze -> emit
//! ```
//!
//! A [`QueryCompiler`] owns nothing but its options; each call to
//! [`QueryCompiler::compile`] builds a fresh [`Session`] so metadata and the
//! relationship graph never leak between queries.

use crate::ast::{Ast, Limit};
use crate::backend::SearchBackend;
use crate::config::CompileOptions;
use crate::emit::{emit_aggregate, emit_query, emit_suggest};
use crate::error::Result;
use crate::optimizer::{self, run_pass, terms, Session};
use crate::query::parse_query;
use crate::resolver;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::debug;

/// Result of compiling one query
#[derive(Debug, Clone, Serialize)]
pub struct CompiledQuery {
    pub query: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggest: Option<Value>,
    /// Index the query document must run against
    pub search_index: String,
    /// Every index some part of the query touched
    pub used_indexes: BTreeSet<String>,
    /// The aggregation is wrapped in a nested scope
    pub nested_aggregate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<Limit>,
    #[serde(skip)]
    ast: Ast,
}

impl CompiledQuery {
    /// Final AST, one node per line
    pub fn dump(&self) -> String {
        self.ast.dump()
    }

    pub fn ast(&self) -> &Ast {
        &self.ast
    }
}

/// Compiles query text against a search backend
pub struct QueryCompiler<'b> {
    backend: &'b dyn SearchBackend,
    options: CompileOptions,
}

impl<'b> QueryCompiler<'b> {
    pub fn new(backend: &'b dyn SearchBackend) -> Self {
        Self::with_options(backend, CompileOptions::default())
    }

    pub fn with_options(backend: &'b dyn SearchBackend, options: CompileOptions) -> Self {
        Self { backend, options }
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Compile `query` for the index `index`
    pub fn compile(&self, query: &str, index: &str) -> Result<CompiledQuery> {
        let mut session = Session::new(self.backend, &self.options);
        let ast = self.prepare(query, index, &mut session)?;
        let ast = optimizer::optimize(ast, &mut session)?;
        let ast = run_pass("resolve", resolver::resolve, ast, &mut session)?;
        let ast = run_pass("analyze_terms", terms::analyze_terms, ast, &mut session)?;

        let query = emit_query(&ast, ast.root(), &mut session)?;
        let (aggregation, nested_aggregate) = match &ast.aggregate {
            Some(aggregate) => {
                let (document, nested) = emit_aggregate(&ast, aggregate, &mut session)?;
                (Some(document), nested)
            }
            None => (None, false),
        };
        let suggest = ast
            .suggest
            .as_ref()
            .map(|s| emit_suggest(&ast, s, &mut session))
            .transpose()?;

        let search_link = session.search_link.unwrap_or(ast.links.own());
        let search_index = ast.links.get(search_link).index_name.clone();
        debug!(
            search_index = %search_index,
            used = session.used_indexes.len(),
            "query compiled"
        );
        Ok(CompiledQuery {
            query,
            aggregation,
            suggest,
            search_index,
            used_indexes: session.used_indexes,
            nested_aggregate,
            limit: ast.limit.clone(),
            ast,
        })
    }

    /// Structurally optimized AST, before any join is executed
    pub fn optimize(&self, query: &str, index: &str) -> Result<Ast> {
        let mut session = Session::new(self.backend, &self.options);
        let ast = self.prepare(query, index, &mut session)?;
        optimizer::optimize(ast, &mut session)
    }

    /// Parse, install the own link, and pick the search index
    fn prepare(&self, query: &str, index: &str, session: &mut Session<'_>) -> Result<Ast> {
        let mut ast = parse_query(query)?;
        let metadata = session.metadata.metadata_for_index(index)?;
        let own = ast.links.set_own(index, metadata.primary_key());

        if let Some(aggregate) = &ast.aggregate {
            let owner = session
                .metadata
                .metadata_for_field(&ast.links, &aggregate.fieldname)?;
            if owner.link != own {
                debug!(
                    field = %aggregate.fieldname,
                    index = %owner.metadata.name(),
                    "aggregate field lives on a linked index, re-rooting"
                );
                session.search_link = Some(owner.link);
            }
        }
        Ok(ast)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::NodeKind;
    use crate::error::CompileError;
    use crate::optimizer::test_support::library;
    use serde_json::json;

    #[test]
    fn test_compile_own_index_query() {
        let backend = library();
        let compiler = QueryCompiler::new(&backend);
        let compiled = compiler.compile("id:1 or id:2", "main").unwrap();
        assert_eq!(
            compiled.query,
            json!({"constant_score": {"filter": {"terms": {"id": [1, 2]}}}})
        );
        assert_eq!(compiled.search_index, "main");
        assert!(compiled.aggregation.is_none());
        assert_eq!(compiled.used_indexes.iter().collect::<Vec<_>>(), vec!["main"]);
    }

    #[test]
    fn test_aggregate_on_linked_index_reroots() {
        let backend = library();
        let compiler = QueryCompiler::new(&backend);
        let compiled = compiler
            .compile(
                "#options(book:(book_id=<books>id)) #tally(isbn, '^.*', 0, term) name:ann",
                "main",
            )
            .unwrap();
        assert_eq!(compiled.search_index, "books");
        assert_eq!(
            compiled.query,
            json!({"constant_score": {"filter": {"terms": {"id": [10]}}}})
        );
        assert_eq!(
            compiled.aggregation,
            Some(json!({"isbn": {"terms": {
                "field": "isbn",
                "size": 2147483647,
                "order": {"_key": "asc"}
            }}}))
        );
        assert!(!compiled.nested_aggregate);
        assert_eq!(backend.calls(), vec!["terms main.book_id"]);
    }

    #[test]
    fn test_suggest_and_limit() {
        let backend = library();
        let compiler = QueryCompiler::new(&backend);
        let compiled = compiler
            .compile("#suggest(name, 'anm', 3) #limit('name desc', 10, 25) name:ann", "main")
            .unwrap();
        assert_eq!(
            compiled.suggest,
            Some(json!({"text": "anm", "term": {"field": "name", "size": 3}}))
        );
        let limit = compiled.limit.unwrap();
        assert_eq!(limit.sort_field.as_deref(), Some("name"));
        assert!(!limit.ascending);
        assert_eq!((limit.offset, limit.size), (10, 25));
    }

    #[test]
    fn test_dump_shows_resolved_tree() {
        let backend = library();
        let compiler = QueryCompiler::new(&backend);
        let compiled = compiler
            .compile("#options(book:(book_id=<books>id)) title:rust", "main")
            .unwrap();
        assert_eq!(compiled.dump(), "Array (book_id=[[10]]) index=main\n");
        assert!(matches!(compiled.ast().kind(compiled.ast().root()), NodeKind::Array { .. }));
    }

    #[test]
    fn test_optimize_keeps_expansions() {
        let backend = library();
        let compiler = QueryCompiler::new(&backend);
        let ast = compiler
            .optimize("#options(book:(book_id=<books>id)) title:rust", "main")
            .unwrap();
        assert!(ast.kind(ast.root()).is_expansion());
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_unknown_index_fails() {
        let backend = library();
        let compiler = QueryCompiler::new(&backend);
        assert!(matches!(
            compiler.compile("a:1", "nope"),
            Err(CompileError::UnknownIndex(_))
        ));
    }
}
