//! Proximity chains as span queries.

use super::{unsupported, Emitter};
use crate::ast::{NodeId, NodeKind, Operator};
use crate::error::Result;
use serde_json::{json, Value};

impl Emitter<'_, '_> {
    pub(super) fn emit_span(&mut self, id: NodeId) -> Result<Value> {
        let node = self.ast.node(id);
        let field = node.field().to_string();

        let query = match &node.kind {
            NodeKind::Proximity { distance, ordered } => {
                let clauses = self.span_clauses(id)?;
                let mut near = json!({"clauses": clauses, "slop": distance, "in_order": ordered});
                if let Some(boost) = node.boost {
                    near["boost"] = json!(boost);
                }
                json!({"span_near": near})
            }
            NodeKind::Or | NodeKind::Array { external: None, .. } => {
                json!({"span_or": {"clauses": self.span_clauses(id)?}})
            }
            NodeKind::Array {
                external: Some(values),
                ..
            } => {
                let clauses: Vec<Value> = values
                    .iter()
                    .map(|v| json!({"span_term": {field.as_str(): v}}))
                    .collect();
                json!({"span_or": {"clauses": clauses}})
            }
            NodeKind::Word(value) | NodeKind::Number(value) if node.operator == Operator::Regex => {
                multi("regexp", &field, json!(value))
            }
            NodeKind::Word(value) | NodeKind::Number(value) => json!({"span_term": {field: value}}),
            NodeKind::Prefix(value) => multi("prefix", &field, json!(value)),
            NodeKind::Wildcard(value) => multi("wildcard", &field, json!(value)),
            NodeKind::Fuzzy { value, distance } => {
                multi("fuzzy", &field, json!({"value": value, "fuzziness": distance}))
            }
            NodeKind::Phrase(text) => self.phrase_span(id, &field, text)?,
            other => return Err(unsupported(node.operator, other)),
        };
        Ok(query)
    }

    fn span_clauses(&mut self, id: NodeId) -> Result<Vec<Value>> {
        self.ast
            .children(id)
            .iter()
            .map(|&c| self.emit_span(c))
            .collect()
    }

    /// A multi-word phrase inside a chain is an exact adjacency of its tokens
    fn phrase_span(&mut self, id: NodeId, field: &str, text: &str) -> Result<Value> {
        let link = self.ast.node(id).owning_index.unwrap_or(self.ast.links.own());
        let index = self.ast.links.get(link).index_name.clone();
        let tokens = self.session.metadata.analyze(&index, field, text)?;
        let mut clauses: Vec<Value> = tokens
            .iter()
            .map(|t| json!({"span_term": {field: t}}))
            .collect();
        Ok(match clauses.len() {
            1 => clauses.remove(0),
            _ => json!({"span_near": {"clauses": clauses, "slop": 0, "in_order": true}}),
        })
    }
}

fn multi(kind: &str, field: &str, value: Value) -> Value {
    json!({"span_multi": {"match": {kind: {field: value}}}})
}

#[cfg(test)]
mod tests {
    use crate::config::CompileOptions;
    use crate::emit::emit_query;
    use crate::error::CompileError;
    use crate::optimizer::links::expand_all_and_assign_links;
    use crate::optimizer::terms::analyze_terms;
    use crate::optimizer::test_support::library;
    use crate::optimizer::Session;
    use crate::query::parse_query;
    use serde_json::json;

    fn emitted(query: &str) -> crate::error::Result<serde_json::Value> {
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
    fn test_wildcard_phrase_span() {
        assert_eq!(
            emitted("body:'c-note*'").unwrap(),
            json!({"span_near": {
                "clauses": [
                    {"span_term": {"body": "c"}},
                    {"span_multi": {"match": {"prefix": {"body": "note"}}}}
                ],
                "slop": 0,
                "in_order": true
            }})
        );
    }

    #[test]
    fn test_proximity_with_or_and_phrase() {
        assert_eq!(
            emitted("name:((ann or bob) wo/3 'young cy')").unwrap(),
            json!({"span_near": {
                "clauses": [
                    {"span_or": {"clauses": [{"span_term": {"name": "ann"}}, {"span_term": {"name": "bob"}}]}},
                    {"span_near": {"clauses": [{"span_term": {"name": "young"}}, {"span_term": {"name": "cy"}}], "slop": 0, "in_order": true}}
                ],
                "slop": 3,
                "in_order": true
            }})
        );
    }

    #[test]
    fn test_negation_inside_proximity_is_unsupported() {
        assert!(matches!(
            emitted("name:(ann w/2 (not bob))"),
            Err(CompileError::UnsupportedOperator { .. })
        ));
    }
}
