//! Expansion resolution.
//!
//! Every Expansion left after optimization is a join: its body runs against
//! the link's index and the matching join keys come back as an external
//! Array on the left field. Expansions are resolved children first, so a
//! body never reaches the backend while it still holds an unresolved join.
//!
//! The resolver carries an explicit [`Context`] (the link and index the
//! enclosing query runs against) down the recursion; nothing is mutated on
//! the way back up, so a failed sub-query leaves no state behind.

use crate::ast::{Ast, LinkId, Node, NodeId, NodeKind, Operator};
use crate::emit::{emit_query, match_all};
use crate::error::{CompileError, Result};
use crate::graph::{format_path, Hop};
use crate::optimizer::terms::analyze_subtree;
use crate::optimizer::Session;
use serde_json::{json, Value};
use tracing::{debug, trace};

/// Resolve every expansion in the tree against the search index
pub fn resolve(mut ast: Ast, session: &mut Session<'_>) -> Result<Ast> {
    let link = session.search_link.unwrap_or(ast.links.own());
    let ctx = Context {
        link,
        index: ast.links.get(link).index_name.clone(),
        in_generated: false,
    };
    let root = ast.root();
    Resolver {
        ast: &mut ast,
        session,
    }
    .resolve_node(root, &ctx)?;
    Ok(ast)
}

/// Where the enclosing query runs
#[derive(Debug, Clone)]
struct Context {
    link: LinkId,
    index: String,
    /// Inside an expansion the optimizer generated
    in_generated: bool,
}

/// One `left_index.left_field = right_index.right_field` hop
#[derive(Debug, Clone, PartialEq)]
struct JoinStep {
    left_index: String,
    left_field: String,
    right_index: String,
    right_field: String,
}

struct Resolver<'s, 'a> {
    ast: &'s mut Ast,
    session: &'s mut Session<'a>,
}

impl Resolver<'_, '_> {
    fn resolve_node(&mut self, id: NodeId, ctx: &Context) -> Result<()> {
        let Some(e) = self.ast.node(id).expansion() else {
            for child in self.ast.child_ids(id) {
                self.resolve_node(child, ctx)?;
            }
            return Ok(());
        };

        let inner = Context {
            link: e.link,
            index: self.ast.links.get(e.link).index_name.clone(),
            in_generated: e.generated,
        };
        let mut children = self.ast.child_ids(id);
        children.extend(self.ast.filter(id));
        for child in children {
            self.resolve_node(child, &inner)?;
        }
        self.resolve_expansion(id, ctx)
    }

    fn resolve_expansion(&mut self, id: NodeId, ctx: &Context) -> Result<()> {
        let Some(e) = self.ast.node(id).expansion() else {
            return Ok(());
        };
        let link = e.link;
        let target = self.ast.links.get(link).index_name.clone();
        let own = self.ast.links.own();

        if link == ctx.link || (link == own && target == ctx.index && !ctx.in_generated) {
            trace!(index = %target, "expansion runs on the enclosing index, unwrapped");
            self.unwrap(id);
            return Ok(());
        }

        let steps = self.join_steps(link, &ctx.index, &target)?;
        if steps.is_empty() {
            self.unwrap(id);
            return Ok(());
        }

        analyze_subtree(self.ast, id, self.session)?;

        if let [step] = steps.as_slice() {
            if self.is_primary_key_not_null(id, step)? {
                let not_null = self.ast.alloc(
                    Node::new(NodeKind::NotNull)
                        .with_field(step.left_field.clone(), Operator::Eq)
                        .with_owner(Some(ctx.link)),
                );
                self.ast.replace(id, not_null);
                debug!(field = %step.left_field, "join on primary key existence shortened");
                return Ok(());
            }
            if let Some(inverted) = self.maybe_invert_expansion(id, step, ctx)? {
                self.ast.replace(id, inverted);
                return Ok(());
            }
        }

        let mut query = self.body_query(id)?;
        let mut result = id;
        for (position, step) in steps.iter().enumerate().rev() {
            let keys = self.load_fielddata(&step.right_index, std::mem::take(&mut query), &step.right_field)?;
            let owner = if position == 0 {
                ctx.link
            } else {
                self.ast.links.for_index(&step.left_index).unwrap_or(ctx.link)
            };
            result = self.key_array(&step.left_field, keys, owner);
            if position > 0 {
                query = emit_query(self.ast, result, self.session)?;
            }
        }
        self.ast.replace(id, result);
        Ok(())
    }

    /// Replace an expansion with its body, and-ed with its filter
    fn unwrap(&mut self, id: NodeId) {
        let filter = self.ast.filter(id);
        if let Some(f) = filter {
            self.ast.detach(f);
        }
        let children = self.ast.child_ids(id);
        for &c in &children {
            self.ast.detach(c);
        }

        let body = match (children.as_slice(), filter) {
            ([single], None) => *single,
            _ => {
                let and = self.ast.new_node(NodeKind::And);
                for &c in &children {
                    self.ast.add_child(and, c);
                }
                if let Some(f) = filter {
                    self.ast.add_child(and, f);
                }
                and
            }
        };
        self.ast.replace(id, body);
    }

    /// Join hops from `from` to `target`, left to right
    fn join_steps(&mut self, link: LinkId, from: &str, target: &str) -> Result<Vec<JoinStep>> {
        let right_field = self.ast.links.get(link).right_field.clone();
        if self.ast.links.left_index_from(link, from) == from {
            return Ok(vec![JoinStep {
                left_index: from.to_string(),
                left_field: self.ast.links.left_field(link).to_string(),
                right_index: target.to_string(),
                right_field,
            }]);
        }

        let path = self.session.graph(&self.ast.links).shortest_path(from, target)?;
        if path.len() <= 2 {
            return Ok(Vec::new());
        }
        let inner = &path[1..path.len() - 1];
        let fields: Vec<(&str, &str)> = inner
            .iter()
            .filter_map(|hop| match hop {
                Hop::Field { index, field } => Some((index.as_str(), field.as_str())),
                Hop::Index(_) => None,
            })
            .collect();

        let steps = match inner.len() {
            0 | 1 => Vec::new(),
            2 | 3 => {
                let (Some(&first), Some(&last)) = (fields.first(), fields.last()) else {
                    return Ok(Vec::new());
                };
                if inner.len() == 3 && !fields.iter().all(|(_, f)| *f == first.1) {
                    return Err(CompileError::FieldEquivalencyUndetermined {
                        path: format_path(&path),
                    });
                }
                vec![step(first, last)]
            }
            _ => inner
                .windows(2)
                .filter_map(|pair| match pair {
                    [Hop::Field { index: li, field: lf }, Hop::Field { index: ri, field: rf }] => {
                        Some(step((li.as_str(), lf.as_str()), (ri.as_str(), rf.as_str())))
                    }
                    _ => None,
                })
                .collect(),
        };
        trace!(path = %format_path(&path), steps = steps.len(), "join path");
        Ok(steps)
    }

    /// Query document for an expansion's body and filter, as run on its own index
    fn body_query(&mut self, id: NodeId) -> Result<Value> {
        if self.ast.children(id).is_empty() && self.ast.filter(id).is_none() {
            return Ok(match_all());
        }
        emit_query(self.ast, id, self.session)
    }

    /// Distinct values of `field` over documents of `index` matching `query`
    fn load_fielddata(&mut self, index: &str, query: Value, field: &str) -> Result<Vec<String>> {
        let query = self.with_exclusions(index, query)?;
        let limit = self.session.options.fielddata_limit();
        let backend = self.session.metadata.backend();
        let keys = backend.execute_terms_aggregation(index, &query, field, limit)?;
        self.session.used_indexes.insert(index.to_string());
        debug!(index, field, keys = keys.len(), "field data loaded");
        Ok(keys)
    }

    /// Exclusion queries apply to indices that carry transaction metadata
    fn with_exclusions(&mut self, index: &str, query: Value) -> Result<Value> {
        let exclusions = &self.session.options.exclusions;
        if exclusions.is_empty() {
            return Ok(query);
        }
        if self.session.metadata.metadata_for_index(index)?.no_transaction_metadata() {
            return Ok(query);
        }
        let exclusions = exclusions.clone();
        Ok(json!({"bool": {"must": [query], "must_not": exclusions}}))
    }

    fn count(&mut self, index: &str, query: Value) -> Result<u64> {
        let query = self.with_exclusions(index, query)?;
        self.session.metadata.backend().execute_count(index, &query)
    }

    fn key_array(&mut self, field: &str, keys: Vec<String>, owner: LinkId) -> NodeId {
        self.ast.alloc(
            Node::new(NodeKind::Array {
                and: false,
                external: Some(keys),
            })
            .with_field(field, Operator::Eq)
            .with_owner(Some(owner)),
        )
    }

    /// A body that only asks for the target's primary key to exist
    fn is_primary_key_not_null(&mut self, id: NodeId, step: &JoinStep) -> Result<bool> {
        if self.ast.filter(id).is_some() {
            return Ok(false);
        }
        let [body] = self.ast.children(id) else {
            return Ok(false);
        };
        let node = self.ast.node(*body);
        if node.kind != NodeKind::NotNull {
            return Ok(false);
        }
        let field = node.field().to_string();
        let metadata = self.session.metadata.metadata_for_index(&step.right_index)?;
        Ok(field == metadata.primary_key() && field == step.right_field)
    }

    /// Materialize the complement when the body matches most of the target.
    ///
    /// `left IN keys(body)` and `left NOT IN keys(NOT body)` select the same
    /// documents as long as every left value refers to an existing target row.
    fn maybe_invert_expansion(&mut self, id: NodeId, step: &JoinStep, ctx: &Context) -> Result<Option<NodeId>> {
        let Some(e) = self.ast.node(id).expansion() else {
            return Ok(None);
        };
        if e.generated || !self.session.options.invert_expansions {
            return Ok(None);
        }
        let cached = e.hit_count;
        let metadata = self.session.metadata.metadata_for_index(&step.right_index)?;
        if step.right_field != metadata.primary_key() {
            return Ok(None);
        }

        let body = self.body_query(id)?;
        let hits = match cached {
            Some(hits) => hits,
            None => {
                let hits = self.count(&step.right_index, body.clone())?;
                if let Some(e) = self.ast.node_mut(id).expansion_mut() {
                    e.hit_count = Some(hits);
                }
                hits
            }
        };
        let total = self.count(&step.right_index, match_all())?;
        let misses = total.saturating_sub(hits);
        if hits <= misses {
            return Ok(None);
        }

        debug!(index = %step.right_index, hits, misses, "expansion inverted");
        let negated = json!({"bool": {"must_not": [body]}});
        let keys = self.load_fielddata(&step.right_index, negated, &step.right_field)?;

        let and = self.ast.alloc(Node::new(NodeKind::And).with_owner(Some(ctx.link)));
        let exists = self.ast.alloc(
            Node::new(NodeKind::NotNull)
                .with_field(step.left_field.clone(), Operator::Eq)
                .with_owner(Some(ctx.link)),
        );
        let not = self.ast.alloc(Node::new(NodeKind::Not).with_owner(Some(ctx.link)));
        let excluded = self.key_array(&step.left_field, keys, ctx.link);
        self.ast.add_child(not, excluded);
        self.ast.add_child(and, exists);
        self.ast.add_child(and, not);
        Ok(Some(and))
    }
}

fn step(left: (&str, &str), right: (&str, &str)) -> JoinStep {
    JoinStep {
        left_index: left.0.to_string(),
        left_field: left.1.to_string(),
        right_index: right.0.to_string(),
        right_field: right.1.to_string(),
    }
}
