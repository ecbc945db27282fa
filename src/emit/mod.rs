//! Rendering of the resolved AST into backend query documents.
//!
//! The emitter walks the tree with an explicit [`EmitCtx`] describing the
//! nested scope it is already inside. Leaves on nested fields are wrapped in
//! a `nested` query unless the surrounding scope covers them; a leaf that
//! belongs to neither the scope nor a deeper path is an error.

mod aggregate;
mod span;

use crate::ast::{Aggregate, Ast, NodeId, NodeKind, Operator, Suggest};
use crate::error::{CompileError, Result};
use crate::metadata::IndexMetadata;
use crate::optimizer::Session;
use serde_json::{json, Map, Value};
use std::rc::Rc;

/// Emit the query document for the subtree at `id`
pub fn emit_query(ast: &Ast, id: NodeId, session: &mut Session<'_>) -> Result<Value> {
    Emitter::new(ast, session).emit(id, &EmitCtx::default())
}

/// Emit an aggregation document, and whether it had to step into a nested path
pub fn emit_aggregate(ast: &Ast, aggregate: &Aggregate, session: &mut Session<'_>) -> Result<(Value, bool)> {
    Emitter::new(ast, session).emit_aggregate(aggregate)
}

/// Term-suggester specification
pub fn emit_suggest(ast: &Ast, suggest: &Suggest, session: &mut Session<'_>) -> Result<Value> {
    let owner = session.metadata.metadata_for_field(&ast.links, &suggest.fieldname)?;
    Ok(json!({
        "text": suggest.text,
        "term": {"field": owner.field, "size": suggest.size},
    }))
}

pub fn match_all() -> Value {
    json!({"match_all": {}})
}

/// Scope a subtree is emitted in
#[derive(Debug, Clone, Default)]
pub struct EmitCtx {
    /// Nested path the enclosing query already runs inside
    nested: Option<String>,
    /// Filter of a nested aggregation: negations and off-path leaves match everything
    aggregation: bool,
}

impl EmitCtx {
    fn scoped(&self, path: &str) -> Self {
        Self {
            nested: Some(path.to_string()),
            aggregation: self.aggregation,
        }
    }
}

pub(crate) struct Emitter<'s, 'a> {
    ast: &'s Ast,
    session: &'s mut Session<'a>,
}

impl<'s, 'a> Emitter<'s, 'a> {
    pub(crate) fn new(ast: &'s Ast, session: &'s mut Session<'a>) -> Self {
        Self { ast, session }
    }

    fn emit(&mut self, id: NodeId, ctx: &EmitCtx) -> Result<Value> {
        let node = self.ast.node(id);
        match &node.kind {
            NodeKind::And => self.bool_of("must", id, ctx),
            NodeKind::Or => self.bool_of("should", id, ctx),
            NodeKind::Not => {
                if ctx.aggregation {
                    return Ok(match_all());
                }
                let clauses = self.emit_children(id, ctx)?;
                if clauses.is_empty() {
                    return Ok(match_all());
                }
                Ok(json!({"bool": {"must_not": clauses}}))
            }
            NodeKind::With => {
                let path = self.common_nested_path(id)?;
                self.scoped(id, path, ctx)
            }
            NodeKind::NestedGroup { path } => self.scoped(id, Some(path.clone()), ctx),
            NodeKind::Expansion(e) => {
                let body = self.bool_of("must", id, ctx)?;
                match e.filter {
                    Some(filter) => {
                        let filter = self.emit(filter, ctx)?;
                        Ok(json!({"bool": {"must": [body, filter]}}))
                    }
                    None => Ok(body),
                }
            }
            NodeKind::Proximity { .. } => {
                let query = self.emit_span(id)?;
                self.wrap_nested(id, query, ctx)
            }
            NodeKind::Json(value) => Ok(value.clone()),
            NodeKind::Script(source) => Ok(json!({"script": {"script": {"source": source}}})),
            NodeKind::Array { .. } => {
                let query = self.emit_array(id)?;
                self.wrap_nested(id, query, ctx)
            }
            _ => {
                let query = self.emit_leaf(id)?;
                self.wrap_nested(id, query, ctx)
            }
        }
    }

    fn emit_children(&mut self, id: NodeId, ctx: &EmitCtx) -> Result<Vec<Value>> {
        self.ast
            .children(id)
            .iter()
            .map(|&c| self.emit(c, ctx))
            .collect()
    }

    fn bool_of(&mut self, occur: &str, id: NodeId, ctx: &EmitCtx) -> Result<Value> {
        let mut clauses = self.emit_children(id, ctx)?;
        Ok(match clauses.len() {
            0 => match_all(),
            1 => clauses.remove(0),
            _ => json!({"bool": {occur: clauses}}),
        })
    }

    /// Conjunction evaluated inside one nested document of `path`
    fn scoped(&mut self, id: NodeId, path: Option<String>, ctx: &EmitCtx) -> Result<Value> {
        let Some(path) = path else {
            return self.bool_of("must", id, ctx);
        };
        match &ctx.nested {
            Some(current) if *current == path => self.bool_of("must", id, ctx),
            _ if ctx.aggregation => Ok(match_all()),
            Some(current) if !is_sub_path(&path, current) => Err(CompileError::InconsistentNestedPath {
                expected: current.clone(),
                found: path,
            }),
            _ => {
                let inner = self.bool_of("must", id, &ctx.scoped(&path))?;
                Ok(json!({"nested": {"path": path, "query": inner}}))
            }
        }
    }

    /// Nested path shared by the leaves of a `with` group
    fn common_nested_path(&mut self, id: NodeId) -> Result<Option<String>> {
        match self.ast.leaves(id).first() {
            Some(&leaf) => {
                let field = self.ast.node(leaf).field().to_string();
                Ok(self.metadata_of(leaf)?.nested_path_for(&field))
            }
            None => Ok(None),
        }
    }

    fn wrap_nested(&mut self, id: NodeId, query: Value, ctx: &EmitCtx) -> Result<Value> {
        let leaf = self.ast.leaves(id).first().copied().unwrap_or(id);
        let field = self.ast.node(leaf).field().to_string();
        let path = self.metadata_of(leaf)?.nested_path_for(&field);

        match (path, &ctx.nested) {
            (None, None) => Ok(query),
            (Some(path), Some(current)) if path == *current => Ok(query),
            _ if ctx.aggregation => Ok(match_all()),
            (Some(path), None) => Ok(json!({"nested": {"path": path, "query": query}})),
            (Some(path), Some(current)) if is_sub_path(&path, current) => {
                Ok(json!({"nested": {"path": path, "query": query}}))
            }
            (found, Some(current)) => Err(CompileError::InconsistentNestedPath {
                expected: current.clone(),
                found: found.unwrap_or(field),
            }),
        }
    }

    /// Metadata of the index owning a node
    fn metadata_of(&mut self, id: NodeId) -> Result<Rc<IndexMetadata>> {
        let link = self.ast.node(id).owning_index.unwrap_or(self.ast.links.own());
        let index = self.ast.links.get(link).index_name.clone();
        self.session.metadata.metadata_for_index(&index)
    }

    fn emit_leaf(&mut self, id: NodeId) -> Result<Value> {
        let node = self.ast.node(id);
        let field = node.field();
        let op = node.operator;

        if op.is_range() {
            let value = match &node.kind {
                NodeKind::Word(s) => json!(s),
                NodeKind::Number(s) => number_value(s),
                NodeKind::Boolean(b) => json!(b),
                other => return Err(unsupported(op, other)),
            };
            let key = match op {
                Operator::Lt => "lt",
                Operator::Gt => "gt",
                Operator::Lte => "lte",
                _ => "gte",
            };
            let mut bounds = Map::new();
            bounds.insert(key.to_string(), value);
            if let Some(boost) = node.boost {
                bounds.insert("boost".to_string(), json!(boost));
            }
            return Ok(json!({"range": {field: bounds}}));
        }

        match op {
            Operator::Regex => {
                let pattern = node
                    .kind
                    .text()
                    .ok_or_else(|| unsupported(op, &node.kind))?;
                Ok(json!({"regexp": {field: boosted(json!(pattern), node.boost)}}))
            }
            Operator::Concept | Operator::FuzzyConcept => self.like_this(id),
            Operator::Ne => {
                let positive = self.positive_leaf(id)?;
                Ok(json!({"bool": {"must_not": [positive]}}))
            }
            _ => self.positive_leaf(id),
        }
    }

    /// Equality form of a leaf, ignoring `<>`
    fn positive_leaf(&mut self, id: NodeId) -> Result<Value> {
        let node = self.ast.node(id);
        let field = node.field();
        let boost = node.boost;
        let query = match &node.kind {
            NodeKind::Null => json!({"bool": {"must_not": [{"exists": {"field": field}}]}}),
            NodeKind::NotNull => json!({"exists": {"field": field}}),
            NodeKind::Word(s) => json!({"term": {field: boosted(json!(s), boost)}}),
            NodeKind::Number(s) => json!({"term": {field: boosted(number_value(s), boost)}}),
            NodeKind::Boolean(b) => json!({"term": {field: boosted(json!(b), boost)}}),
            NodeKind::Phrase(s) => {
                let spec = match boost {
                    Some(b) => json!({"query": s, "boost": b}),
                    None => json!(s),
                };
                json!({"match_phrase": {field: spec}})
            }
            NodeKind::Prefix(s) => json!({"prefix": {field: boosted(json!(s), boost)}}),
            NodeKind::Wildcard(s) => json!({"wildcard": {field: boosted(json!(s), boost)}}),
            NodeKind::Fuzzy { value, distance } => {
                let mut spec = json!({"value": value, "fuzziness": distance});
                if let Some(b) = boost {
                    spec["boost"] = json!(b);
                }
                json!({"fuzzy": {field: spec}})
            }
            other => return Err(unsupported(node.operator, other)),
        };
        Ok(query)
    }

    /// `more_like_this` / `fuzzy_like_this` for CONCEPT and FUZZY_CONCEPT
    fn like_this(&mut self, id: NodeId) -> Result<Value> {
        let node = self.ast.node(id);
        let field = node.field().to_string();
        let like = node
            .kind
            .text()
            .ok_or_else(|| unsupported(node.operator, &node.kind))?
            .to_string();
        let key = if node.operator == Operator::Concept {
            "more_like_this"
        } else {
            "fuzzy_like_this"
        };
        let full_text = self.metadata_of(id)?.is_full_text(&field);
        Ok(json!({key: {
            "fields": [field],
            "like": like,
            "stop_words": self.session.options.concept_stop_words,
            "min_term_freq": if full_text { 1 } else { 0 },
        }}))
    }

    fn emit_array(&mut self, id: NodeId) -> Result<Value> {
        let node = self.ast.node(id);
        let NodeKind::Array { and, external } = &node.kind else {
            return Err(unsupported(node.operator, &node.kind));
        };
        let and = *and;
        let field = node.field().to_string();
        let op = node.operator;
        let boost = node.boost;
        if op.is_range() {
            return Err(unsupported(op, &node.kind));
        }

        let mut values = Vec::new();
        let mut others = Vec::new();
        match external {
            Some(list) => {
                let numeric = self
                    .metadata_of(id)?
                    .field_type(&field)
                    .is_some_and(|t| t.is_numeric());
                values.extend(list.iter().map(|v| if numeric { number_value(v) } else { json!(v) }));
            }
            None => {
                for &child in self.ast.children(id) {
                    match &self.ast.node(child).kind {
                        NodeKind::Word(s) if !op.skips_analysis() => values.push(json!(s)),
                        NodeKind::Number(s) if !op.skips_analysis() => values.push(number_value(s)),
                        NodeKind::Boolean(b) => values.push(json!(b)),
                        _ if op.skips_analysis() => others.push(self.emit_leaf(child)?),
                        _ => others.push(self.positive_leaf(child)?),
                    }
                }
            }
        }

        let positive = if and {
            let mut clauses: Vec<Value> = values
                .into_iter()
                .map(|v| json!({"term": {field.as_str(): v}}))
                .collect();
            clauses.extend(others);
            let required = clauses.len();
            let mut query = json!({"bool": {"should": clauses, "minimum_should_match": required}});
            if let Some(b) = boost {
                query["bool"]["boost"] = json!(b);
            }
            query
        } else {
            let mut clauses = Vec::new();
            if !values.is_empty() || others.is_empty() {
                let mut terms = json!({"constant_score": {"filter": {"terms": {field.as_str(): values}}}});
                if let Some(b) = boost {
                    terms["constant_score"]["boost"] = json!(b);
                }
                clauses.push(terms);
            }
            clauses.extend(others);
            if clauses.len() == 1 {
                clauses.remove(0)
            } else {
                json!({"bool": {"should": clauses}})
            }
        };

        Ok(if op == Operator::Ne {
            json!({"bool": {"must_not": [positive]}})
        } else {
            positive
        })
    }
}

fn is_sub_path(path: &str, parent: &str) -> bool {
    path.strip_prefix(parent).is_some_and(|rest| rest.starts_with('.'))
}

fn unsupported(operator: Operator, kind: &NodeKind) -> CompileError {
    CompileError::UnsupportedOperator {
        operator,
        node: kind.name().to_string(),
    }
}

/// `value`, or `{"value": value, "boost": b}` when boosted
fn boosted(value: Value, boost: Option<f32>) -> Value {
    match boost {
        Some(b) => json!({"value": value, "boost": b}),
        None => value,
    }
}

/// Numeric literal as a JSON number, falling back to the string
fn number_value(s: &str) -> Value {
    if let Ok(i) = s.parse::<i64>() {
        return json!(i);
    }
    s.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| json!(s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompileOptions;
    use crate::optimizer::links::expand_all_and_assign_links;
    use crate::optimizer::terms::analyze_terms;
    use crate::optimizer::test_support::library;
    use crate::query::parse_query;

    fn emitted(query: &str) -> Result<Value> {
        let backend = library();
        let options = CompileOptions::default();
        let mut session = Session::new(&backend, &options);
        let mut ast = parse_query(query)?;
        ast.links.set_own("main", "id");
        let ast = expand_all_and_assign_links(ast, &mut session)?;
        let ast = analyze_terms(ast, &mut session)?;
        emit_query(&ast, ast.root(), &mut session)
    }

    #[test]
    fn test_equality_and_negation() {
        assert_eq!(
            emitted("tag:red and tag<>red").unwrap(),
            json!({"bool": {"must": [
                {"term": {"tag": "red"}},
                {"bool": {"must_not": [{"term": {"tag": "red"}}]}}
            ]}})
        );
    }

    #[test]
    fn test_ranges_and_nulls() {
        assert_eq!(
            emitted("id < 100 or id >= 7.5").unwrap(),
            json!({"bool": {"should": [
                {"range": {"id": {"lt": 100}}},
                {"range": {"id": {"gte": 7.5}}}
            ]}})
        );
        assert_eq!(
            emitted("tag:null").unwrap(),
            json!({"bool": {"must_not": [{"exists": {"field": "tag"}}]}})
        );
        assert_eq!(emitted("tag<>null").unwrap(), json!({"exists": {"field": "tag"}}));
    }

    #[test]
    fn test_range_on_pattern_is_unsupported() {
        assert!(matches!(
            emitted("name > ann*"),
            Err(CompileError::UnsupportedOperator { operator: Operator::Gt, .. })
        ));
    }

    #[test]
    fn test_patterns_and_boost() {
        assert_eq!(
            emitted("name:ann*^2").unwrap(),
            json!({"prefix": {"name": {"value": "ann", "boost": 2.0}}})
        );
        assert_eq!(
            emitted("tag:r?d").unwrap(),
            json!({"wildcard": {"tag": "r?d"}})
        );
        assert_eq!(
            emitted("name:ann~1").unwrap(),
            json!({"fuzzy": {"name": {"value": "ann", "fuzziness": 1}}})
        );
        assert_eq!(
            emitted("name:~'an+'").unwrap(),
            json!({"regexp": {"name": "an+"}})
        );
    }

    #[test]
    fn test_arrays() {
        assert_eq!(
            emitted("id:[[1, 2]]").unwrap(),
            json!({"constant_score": {"filter": {"terms": {"id": [1, 2]}}}})
        );
        assert_eq!(
            emitted("tag:&[red, blue]").unwrap(),
            json!({"bool": {
                "should": [{"term": {"tag": "red"}}, {"term": {"tag": "blue"}}],
                "minimum_should_match": 2
            }})
        );
        assert_eq!(
            emitted("tag<>[red, blue]").unwrap(),
            json!({"bool": {"must_not": [
                {"constant_score": {"filter": {"terms": {"tag": ["red", "blue"]}}}}
            ]}})
        );
    }

    #[test]
    fn test_concept_query() {
        let query = emitted("body:@'dogs barking'").unwrap();
        let mlt = &query["more_like_this"];
        assert_eq!(mlt["fields"], json!(["body"]));
        assert_eq!(mlt["like"], json!("dogs barking"));
        assert_eq!(mlt["min_term_freq"], json!(1));
        assert!(mlt["stop_words"].as_array().is_some_and(|a| !a.is_empty()));
    }

    #[test]
    fn test_nested_leaf_is_wrapped() {
        assert_eq!(
            emitted("comments.author:bob").unwrap(),
            json!({"nested": {"path": "comments", "query": {"term": {"comments.author": "bob"}}}})
        );
    }

    #[test]
    fn test_with_scopes_one_nested_document() {
        assert_eq!(
            emitted("comments.author:bob with comments.text:great").unwrap(),
            json!({"nested": {"path": "comments", "query": {"bool": {"must": [
                {"term": {"comments.author": "bob"}},
                {"term": {"comments.text": "great"}}
            ]}}}})
        );
        assert!(matches!(
            emitted("comments.author:bob with name:ann"),
            Err(CompileError::InconsistentNestedPath { .. })
        ));
    }

    #[test]
    fn test_aggregation_filter_context() {
        let backend = library();
        let options = CompileOptions::default();
        let mut session = Session::new(&backend, &options);
        let mut ast = parse_query("comments.author:bob and not tag:red and name:ann").unwrap();
        ast.links.set_own("main", "id");
        let ast = expand_all_and_assign_links(ast, &mut session).unwrap();
        let ctx = EmitCtx {
            nested: Some("comments".into()),
            aggregation: true,
        };
        let filter = Emitter::new(&ast, &mut session).emit(ast.root(), &ctx).unwrap();
        assert_eq!(
            filter,
            json!({"bool": {"must": [
                {"term": {"comments.author": "bob"}},
                {"match_all": {}},
                {"match_all": {}}
            ]}})
        );
    }

    #[test]
    fn test_empty_query_matches_all() {
        assert_eq!(emitted("").unwrap(), match_all());
        assert_eq!(emitted("body:'the'").unwrap(), match_all());
    }

    #[test]
    fn test_passthrough() {
        assert_eq!(
            emitted(r#"{"match": {"name": "ann"}}"#).unwrap(),
            json!({"match": {"name": "ann"}})
        );
    }
}
