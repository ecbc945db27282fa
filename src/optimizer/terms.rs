//! Analyzer-aware rewriting of leaf values.
//!
//! Each string leaf is run through its field's search analyzer. Verbatim
//! fields keep one token; full-text fields are split around separators, with
//! `*`/`?` pieces kept as patterns. A leaf that analyzes to nothing is
//! removed, one token stays a leaf, and several tokens become an adjacency
//! proximity chain.

use super::Session;
use crate::ast::{Ast, Node, NodeId, NodeKind, Operator};
use crate::backend::analyzer::is_separator;
use crate::error::Result;
use crate::metadata::FieldType;
use tracing::trace;

pub fn analyze_terms(mut ast: Ast, session: &mut Session<'_>) -> Result<Ast> {
    let root = ast.root();
    analyze_subtree(&mut ast, root, session)?;
    Ok(ast)
}

/// Rewrite every analyzable leaf under `id`, filters included
pub fn analyze_subtree(ast: &mut Ast, id: NodeId, session: &mut Session<'_>) -> Result<()> {
    for n in ast.subtree(id) {
        if !ast.is_ancestor(ast.root(), n) {
            continue;
        }
        if ast.parent(n).is_some_and(|p| matches!(ast.kind(p), NodeKind::Array { .. })) {
            continue;
        }
        match ast.kind(n) {
            NodeKind::Array { external: None, .. } => split_array(ast, n, session)?,
            kind if kind.is_field_leaf() => {
                rewrite_leaf(ast, n, session)?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Outcome of analyzing one leaf
enum Rewrite {
    Unchanged,
    Removed,
    /// Still a single literal or pattern leaf
    Simple,
    /// Replaced by a proximity chain (possibly negated)
    Complex(NodeId),
}

fn skips_analysis(node: &Node) -> bool {
    node.operator.skips_analysis()
        || node.operator.is_range()
        || !matches!(
            node.kind,
            NodeKind::Word(_)
                | NodeKind::Phrase(_)
                | NodeKind::Prefix(_)
                | NodeKind::Wildcard(_)
                | NodeKind::Fuzzy { .. }
        )
}

fn rewrite_leaf(ast: &mut Ast, id: NodeId, session: &mut Session<'_>) -> Result<Rewrite> {
    let node = ast.node(id).clone();
    if skips_analysis(&node) {
        return Ok(Rewrite::Unchanged);
    }
    let Some(field) = node.fieldname.clone() else {
        return Ok(Rewrite::Unchanged);
    };
    let owner = node.owning_index.unwrap_or(ast.links.own());
    let index = ast.links.get(owner).index_name.clone();
    let metadata = session.metadata.metadata_for_index(&index)?;
    if !matches!(
        metadata.field_type(&field),
        Some(FieldType::Text | FieldType::Keyword)
    ) {
        return Ok(Rewrite::Unchanged);
    }

    let mut units = if metadata.is_full_text(&field) {
        full_text_units(&node.kind, |piece| session.metadata.analyze(&index, &field, piece))?
    } else {
        let value = node.kind.text().unwrap_or_default();
        session
            .metadata
            .analyze(&index, &field, value)?
            .into_iter()
            .map(|token| with_value(&node.kind, token))
            .collect()
    };

    let rewrite = match units.len() {
        0 => {
            trace!(field = %field, "leaf analyzed to nothing, removed");
            ast.detach(id);
            Rewrite::Removed
        }
        1 => {
            ast.node_mut(id).kind = units.remove(0);
            Rewrite::Simple
        }
        _ if matches!(node.kind, NodeKind::Phrase(_)) && units.iter().all(|u| matches!(u, NodeKind::Word(_))) => {
            Rewrite::Unchanged
        }
        _ => {
            let chain = ast.alloc(
                Node::new(NodeKind::Proximity {
                    distance: 0,
                    ordered: true,
                })
                .with_field(field.clone(), Operator::Contains)
                .with_boost(node.boost)
                .with_owner(Some(owner)),
            );
            for unit in units {
                let leaf = ast.alloc(
                    Node::new(unit)
                        .with_field(field.clone(), Operator::Contains)
                        .with_owner(Some(owner)),
                );
                ast.add_child(chain, leaf);
            }
            let replacement = if node.operator == Operator::Ne {
                let not = ast.alloc(Node::new(NodeKind::Not).with_owner(Some(owner)));
                ast.add_child(not, chain);
                not
            } else {
                chain
            };
            ast.replace(id, replacement);
            trace!(field = %field, "leaf analyzed into proximity chain");
            Rewrite::Complex(replacement)
        }
    };
    Ok(rewrite)
}

/// Same leaf kind carrying a new value. Phrases on verbatim fields become words.
fn with_value(kind: &NodeKind, value: String) -> NodeKind {
    match kind {
        NodeKind::Prefix(_) => NodeKind::Prefix(value),
        NodeKind::Wildcard(_) => NodeKind::Wildcard(value),
        NodeKind::Fuzzy { distance, .. } => NodeKind::Fuzzy {
            value,
            distance: *distance,
        },
        _ => NodeKind::Word(value),
    }
}

/// Split a full-text value into token and pattern leaves
fn full_text_units(
    kind: &NodeKind,
    mut analyze: impl FnMut(&str) -> Result<Vec<String>>,
) -> Result<Vec<NodeKind>> {
    let text = match kind {
        NodeKind::Prefix(v) => format!("{}*", v),
        other => other.text().unwrap_or_default().to_string(),
    };

    let mut units = Vec::new();
    for piece in text.split(|c: char| is_separator(c) && c != '*' && c != '?') {
        if piece.is_empty() {
            continue;
        }
        if piece.contains(['*', '?']) {
            if let Some(unit) = pattern_unit(piece) {
                units.push(unit);
            }
            continue;
        }
        for token in analyze(piece)? {
            units.push(with_value(kind, token));
        }
    }
    Ok(units)
}

fn pattern_unit(piece: &str) -> Option<NodeKind> {
    let lower = piece.to_lowercase();
    if lower.chars().all(|c| c == '*' || c == '?') {
        return None;
    }
    match lower.strip_suffix('*') {
        Some(stem) if !stem.contains(['*', '?']) => Some(NodeKind::Prefix(stem.to_string())),
        _ => Some(NodeKind::Wildcard(lower)),
    }
}

/// Analyze array values; values that turn into chains move out of the array
/// into a combinator next to it
fn split_array(ast: &mut Ast, id: NodeId, session: &mut Session<'_>) -> Result<()> {
    let NodeKind::Array { and, .. } = *ast.kind(id) else {
        return Ok(());
    };
    let op = ast.node(id).operator;
    if op.skips_analysis() || op.is_range() {
        return Ok(());
    }

    let mut extracted = Vec::new();
    for child in ast.child_ids(id) {
        if let Rewrite::Complex(replacement) = rewrite_leaf(ast, child, session)? {
            ast.detach(replacement);
            extracted.push(replacement);
        }
    }
    if extracted.is_empty() {
        if ast.children(id).is_empty() {
            trace!(node = ?id, "array analyzed to nothing, removed");
            ast.detach(id);
        }
        return Ok(());
    }

    let combinator = if and || op == Operator::Ne {
        NodeKind::And
    } else {
        NodeKind::Or
    };
    let wrapper = ast.wrap(id, Node::new(combinator));
    for node in extracted {
        ast.add_child(wrapper, node);
    }
    if ast.children(id).is_empty() {
        ast.detach(id);
    }
    trace!(node = ?id, "complex values extracted from array");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompileOptions;
    use crate::optimizer::links::expand_all_and_assign_links;
    use crate::optimizer::test_support::library;
    use crate::query::parse_query;

    fn analyzed(query: &str) -> Ast {
        let backend = library();
        let options = CompileOptions::default();
        let mut session = Session::new(&backend, &options);
        let mut ast = parse_query(query).unwrap();
        ast.links.set_own("main", "id");
        let ast = expand_all_and_assign_links(ast, &mut session).unwrap();
        analyze_terms(ast, &mut session).unwrap()
    }

    #[test]
    fn test_wildcard_phrase_becomes_proximity() {
        let ast = analyzed("body:'c-note*'");
        let root = ast.root();
        assert_eq!(
            ast.kind(root),
            &NodeKind::Proximity { distance: 0, ordered: true }
        );
        let kinds: Vec<_> = ast.children(root).iter().map(|&c| ast.kind(c).clone()).collect();
        assert_eq!(
            kinds,
            vec![NodeKind::Word("c".into()), NodeKind::Prefix("note".into())]
        );
    }

    #[test]
    fn test_stop_word_phrase_is_removed() {
        let ast = analyzed("body:'the'");
        let root = ast.root();
        assert_eq!(ast.kind(root), &NodeKind::And);
        assert!(ast.children(root).is_empty());
    }

    #[test]
    fn test_stop_word_array_is_removed() {
        let ast = analyzed("body:[the, a] and tag:red");
        let root = ast.root();
        assert_eq!(ast.kind(root), &NodeKind::And);
        assert_eq!(ast.children(root).len(), 1);
        assert_eq!(ast.kind(ast.children(root)[0]), &NodeKind::Word("red".into()));

        let ast = analyzed("body:[the, a]");
        assert_eq!(ast.kind(ast.root()), &NodeKind::And);
        assert!(ast.children(ast.root()).is_empty());
    }

    #[test]
    fn test_single_token_is_normalized() {
        let ast = analyzed("body:Dogs and tag:RED and name:Ann~1");
        let kinds: Vec<_> = ast
            .children(ast.root())
            .iter()
            .map(|&c| ast.kind(c).clone())
            .collect();
        assert_eq!(
            kinds,
            vec![
                NodeKind::Word("dog".into()),
                NodeKind::Word("red".into()),
                NodeKind::Fuzzy { value: "ann".into(), distance: 1 },
            ]
        );
    }

    #[test]
    fn test_multi_word_phrase_stays_phrase() {
        let ast = analyzed("name:'Ann Smith'");
        assert_eq!(ast.kind(ast.root()), &NodeKind::Phrase("Ann Smith".into()));
    }

    #[test]
    fn test_not_equal_chain_is_negated() {
        let ast = analyzed("name<>ann-smith");
        let root = ast.root();
        assert_eq!(ast.kind(root), &NodeKind::Not);
        let chain = ast.children(root)[0];
        assert!(matches!(ast.kind(chain), NodeKind::Proximity { .. }));
        assert!(ast
            .children(chain)
            .iter()
            .all(|&c| ast.node(c).operator == Operator::Contains));
    }

    #[test]
    fn test_regex_and_ranges_untouched() {
        let ast = analyzed("name:~'A.*' and name > Bob");
        let kinds: Vec<_> = ast
            .children(ast.root())
            .iter()
            .map(|&c| ast.kind(c).clone())
            .collect();
        assert_eq!(kinds[1], NodeKind::Word("Bob".into()));
    }

    #[test]
    fn test_complex_array_values_are_extracted() {
        let ast = analyzed("name:[ann, bob-jones, cy]");
        let root = ast.root();
        assert_eq!(ast.kind(root), &NodeKind::Or);
        let children = ast.children(root);
        assert!(matches!(ast.kind(children[0]), NodeKind::Array { and: false, .. }));
        assert_eq!(ast.children(children[0]).len(), 2);
        assert!(matches!(ast.kind(children[1]), NodeKind::Proximity { .. }));
    }
}
