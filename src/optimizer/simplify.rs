//! Boolean simplification passes: flattening, literal and array merging,
//! single-child reduction.

use super::Session;
use crate::ast::{Ast, LinkId, Node, NodeId, NodeKind, Operator};
use crate::error::{CompileError, Result};
use tracing::trace;

/// Flatten And-in-And, Or-in-Or and With-in-With
pub fn rollup(mut ast: Ast, _session: &mut Session<'_>) -> Result<Ast> {
    for id in ast.subtree(ast.root()) {
        if !is_attached(&ast, id) {
            continue;
        }
        let Some(parent) = ast.parent(id) else {
            continue;
        };
        let same = matches!(
            (ast.kind(parent), ast.kind(id)),
            (NodeKind::And, NodeKind::And) | (NodeKind::Or, NodeKind::Or) | (NodeKind::With, NodeKind::With)
        );
        if same && ast.node(id).boost.is_none() {
            ast.splice_up(id);
        }
    }
    Ok(ast)
}

/// Every leaf of a proximity chain must search the same field
pub fn validate_proximity(ast: Ast, _session: &mut Session<'_>) -> Result<Ast> {
    for id in ast.subtree(ast.root()) {
        if !matches!(ast.kind(id), NodeKind::Proximity { .. }) {
            continue;
        }
        let mut fieldnames: Vec<String> = Vec::new();
        for leaf in ast.leaves(id) {
            let field = ast.node(leaf).field().to_string();
            if !fieldnames.contains(&field) {
                fieldnames.push(field);
            }
        }
        if fieldnames.len() > 1 {
            return Err(CompileError::MixedFieldnamesInProximity { fieldnames });
        }
    }
    Ok(ast)
}

#[derive(Debug, Clone, PartialEq)]
struct MergeKey {
    field: String,
    op: Operator,
    boost: Option<u32>,
    owner: Option<LinkId>,
    /// Arrays of the same polarity: OR for false, AND for true
    and: bool,
    external: bool,
}

/// Operators a container is allowed to fold into arrays, and the array
/// polarity they fold into. Loose equality literals never fold under And;
/// only existing AND arrays merge there.
fn polarity(parent: &NodeKind, op: Operator, array: bool) -> Option<bool> {
    match parent {
        NodeKind::Or if op.is_equality() => Some(false),
        NodeKind::And if op == Operator::Ne => Some(false),
        NodeKind::And if array && op.is_equality() => Some(true),
        _ => None,
    }
}

/// True when an And container has a child on a nested-document field.
/// Each conjunct there may match a different sub-document, so the
/// container is left unmerged.
fn and_over_nested(ast: &Ast, session: &mut Session<'_>, id: NodeId) -> Result<bool> {
    if ast.kind(id) != &NodeKind::And {
        return Ok(false);
    }
    for &child in ast.children(id) {
        let node = ast.node(child);
        if !node.kind.is_field_leaf() {
            continue;
        }
        let Some(field) = node.fieldname.as_deref() else {
            continue;
        };
        let link = ast.links.get(node.owning_index.unwrap_or(ast.links.own()));
        if link.is_this_index() {
            continue;
        }
        let index = link.index_name.clone();
        if session
            .metadata
            .metadata_for_index(&index)?
            .nested_path_for(field)
            .is_some()
        {
            return Ok(true);
        }
    }
    Ok(false)
}

fn literal_key(ast: &Ast, parent: &NodeKind, id: NodeId) -> Option<MergeKey> {
    let node = ast.node(id);
    let simple = match &node.kind {
        NodeKind::Word(w) => !w.chars().any(char::is_whitespace),
        NodeKind::Number(_) | NodeKind::Boolean(_) => true,
        _ => false,
    };
    if !simple {
        return None;
    }
    Some(MergeKey {
        field: node.fieldname.clone()?,
        op: node.operator,
        boost: node.boost.map(f32::to_bits),
        owner: node.owning_index,
        and: polarity(parent, node.operator, false)?,
        external: false,
    })
}

fn array_key(ast: &Ast, parent: &NodeKind, id: NodeId) -> Option<MergeKey> {
    let node = ast.node(id);
    let NodeKind::Array { and, external } = &node.kind else {
        return None;
    };
    if polarity(parent, node.operator, true)? != *and {
        return None;
    }
    Some(MergeKey {
        field: node.fieldname.clone()?,
        op: node.operator,
        boost: node.boost.map(f32::to_bits),
        owner: node.owning_index,
        and: *and,
        external: external.is_some(),
    })
}

/// Group siblings by key, keeping first-appearance order
fn group_by(children: &[NodeId], key: impl Fn(NodeId) -> Option<MergeKey>) -> Vec<(MergeKey, Vec<NodeId>)> {
    let mut groups: Vec<(MergeKey, Vec<NodeId>)> = Vec::new();
    for &c in children {
        let Some(k) = key(c) else {
            continue;
        };
        match groups.iter_mut().find(|(g, _)| *g == k) {
            Some((_, members)) => members.push(c),
            None => groups.push((k, vec![c])),
        }
    }
    groups
}

/// Fold sibling literals on the same field into one array: equality under
/// Or becomes an OR array and `<>` under And becomes a "none of" array
pub fn merge_literals(mut ast: Ast, session: &mut Session<'_>) -> Result<Ast> {
    for id in ast.subtree(ast.root()) {
        if !is_attached(&ast, id) {
            continue;
        }
        let parent = ast.kind(id).clone();
        if !matches!(parent, NodeKind::And | NodeKind::Or) || and_over_nested(&ast, session, id)? {
            continue;
        }
        let children = ast.child_ids(id);
        let groups = group_by(&children, |c| literal_key(&ast, &parent, c));

        for (key, members) in groups {
            if members.len() < 2 {
                continue;
            }
            let first = members[0];
            let boost = ast.node(first).boost;
            let array = Node::new(NodeKind::Array {
                and: key.and,
                external: None,
            })
            .with_field(key.field.clone(), key.op)
            .with_boost(boost)
            .with_owner(key.owner);
            let array = ast.alloc(array);
            ast.replace(first, array);
            ast.add_child(array, first);
            for &other in &members[1..] {
                ast.detach(other);
                ast.add_child(array, other);
            }
            trace!(field = %key.field, values = members.len(), "literals merged into array");
        }
    }
    Ok(ast)
}

/// Merge compatible sibling arrays, and fold matching literals into them.
/// Externally supplied arrays only merge with each other.
pub fn merge_arrays(mut ast: Ast, session: &mut Session<'_>) -> Result<Ast> {
    for id in ast.subtree(ast.root()) {
        if !is_attached(&ast, id) {
            continue;
        }
        let parent = ast.kind(id).clone();
        if !matches!(parent, NodeKind::And | NodeKind::Or) || and_over_nested(&ast, session, id)? {
            continue;
        }
        let children = ast.child_ids(id);
        let mut groups = group_by(&children, |c| array_key(&ast, &parent, c));
        for &c in &children {
            let Some(key) = literal_key(&ast, &parent, c) else {
                continue;
            };
            if let Some((_, members)) = groups.iter_mut().find(|(g, _)| *g == key) {
                members.push(c);
            }
        }

        for (key, members) in groups {
            if members.len() < 2 {
                continue;
            }
            let target = members[0];
            for &other in &members[1..] {
                ast.detach(other);
                if !ast.kind(other).is_literal() {
                    absorb_array(&mut ast, target, other);
                } else {
                    ast.add_child(target, other);
                }
            }
            trace!(field = %key.field, merged = members.len(), "arrays merged");
        }
    }
    Ok(ast)
}

fn absorb_array(ast: &mut Ast, target: NodeId, other: NodeId) {
    let values = match &mut ast.node_mut(other).kind {
        NodeKind::Array { external, .. } => external.take(),
        _ => None,
    };
    if let Some(values) = values {
        if let NodeKind::Array {
            external: Some(existing),
            ..
        } = &mut ast.node_mut(target).kind
        {
            existing.extend(values);
        }
    }
    ast.adopt_children(other, target);
}

/// Replace And/Or nodes and literal arrays that hold a single child with that child
pub fn reduce_single_children(mut ast: Ast, _session: &mut Session<'_>) -> Result<Ast> {
    for id in ast.subtree(ast.root()) {
        if !is_attached(&ast, id) || ast.children(id).len() != 1 {
            continue;
        }
        match ast.kind(id) {
            NodeKind::And | NodeKind::Or if ast.node(id).boost.is_none() => collapse(&mut ast, id),
            NodeKind::Array { external: None, .. } => {
                let child = ast.children(id)[0];
                let array = ast.node(id).clone();
                let node = ast.node_mut(child);
                node.fieldname = array.fieldname;
                node.operator = array.operator;
                node.owning_index = array.owning_index.or(node.owning_index);
                node.boost = node.boost.or(array.boost);
                collapse(&mut ast, id);
            }
            _ => {}
        }
    }
    Ok(ast)
}

fn collapse(ast: &mut Ast, id: NodeId) {
    let child = ast.children(id)[0];
    ast.detach(child);
    ast.replace(id, child);
}

fn is_attached(ast: &Ast, id: NodeId) -> bool {
    ast.is_ancestor(ast.root(), id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompileOptions;
    use crate::optimizer::links::expand_all_and_assign_links;
    use crate::optimizer::test_support::library;
    use crate::query::parse_query;

    fn run(query: &str, passes: &[super::super::Pass]) -> Result<Ast> {
        let backend = library();
        let options = CompileOptions::default();
        let mut session = Session::new(&backend, &options);
        let mut ast = parse_query(query)?;
        ast.links.set_own("main", "id");
        let mut ast = expand_all_and_assign_links(ast, &mut session)?;
        for pass in passes {
            ast = pass(ast, &mut session)?;
        }
        Ok(ast)
    }

    fn values(ast: &Ast, array: NodeId) -> Vec<String> {
        ast.children(array)
            .iter()
            .filter_map(|&c| ast.kind(c).text().map(str::to_string))
            .collect()
    }

    #[test]
    fn test_rollup_flattens_same_kind() {
        let ast = run("a:1 and (b:2 and (c:3 and d:4))", &[rollup]).unwrap();
        assert_eq!(ast.children(ast.root()).len(), 4);

        let ast = run("a:1 or (b:2 and c:3)", &[rollup]).unwrap();
        assert_eq!(ast.children(ast.root()).len(), 2);
    }

    #[test]
    fn test_equality_literals_merge_under_or() {
        let ast = run("id:1 or id:2 or tag:red or id:3", &[merge_literals]).unwrap();
        let root = ast.root();
        let children = ast.children(root);
        assert_eq!(children.len(), 2);
        assert_eq!(
            ast.kind(children[0]),
            &NodeKind::Array { and: false, external: None }
        );
        assert_eq!(values(&ast, children[0]), vec!["1", "2", "3"]);
    }

    #[test]
    fn test_not_equal_literals_merge_under_and() {
        let ast = run("tag<>red and tag<>blue and name:ann", &[merge_literals]).unwrap();
        let array = ast.children(ast.root())[0];
        assert_eq!(ast.node(array).operator, Operator::Ne);
        assert_eq!(values(&ast, array), vec!["red", "blue"]);
    }

    #[test]
    fn test_equality_literals_stay_loose_under_and() {
        let ast = run("tag:red and tag:blue", &[merge_literals, merge_arrays]).unwrap();
        let root = ast.root();
        assert_eq!(ast.kind(root), &NodeKind::And);
        assert!(ast.children(root).iter().all(|&c| !matches!(ast.kind(c), NodeKind::Array { .. })));
    }

    #[test]
    fn test_and_over_nested_fields_is_not_merged() {
        let ast = run(
            "comments.author<>bob and comments.author<>ann",
            &[merge_literals, merge_arrays],
        )
        .unwrap();
        let root = ast.root();
        assert_eq!(ast.kind(root), &NodeKind::And);
        assert_eq!(ast.children(root).len(), 2);

        let ast = run("comments.author:bob or comments.author:ann", &[merge_literals]).unwrap();
        let array = ast.children(ast.root())[0];
        assert!(matches!(ast.kind(array), NodeKind::Array { and: false, .. }));
    }

    #[test]
    fn test_different_boosts_do_not_merge() {
        let ast = run("tag:red^2 or tag:blue", &[merge_literals]).unwrap();
        assert_eq!(ast.kind(ast.root()), &NodeKind::Or);
        assert_eq!(ast.children(ast.root()).len(), 2);
    }

    #[test]
    fn test_arrays_merge_and_absorb_literals() {
        let ast = run(
            "tag:[red, blue] or tag:[green] or tag:pink",
            &[merge_arrays, reduce_single_children],
        )
        .unwrap();
        let root = ast.root();
        assert!(matches!(ast.kind(root), NodeKind::Array { and: false, .. }));
        assert_eq!(values(&ast, root), vec!["red", "blue", "green", "pink"]);
    }

    #[test]
    fn test_or_arrays_do_not_merge_under_and() {
        let ast = run("tag:[red, blue] and tag:[green, pink]", &[merge_arrays]).unwrap();
        assert_eq!(ast.children(ast.root()).len(), 2);
    }

    #[test]
    fn test_external_arrays_only_merge_with_external() {
        let ast = run("id:&[[1, 2]] and id:&[[3]] and id:4", &[merge_arrays]).unwrap();
        let root = ast.root();
        assert_eq!(ast.children(root).len(), 2);
        let NodeKind::Array { and, external } = ast.kind(ast.children(root)[0]) else {
            panic!("expected array");
        };
        assert!(*and);
        assert_eq!(external.as_deref(), Some(&["1".to_string(), "2".into(), "3".into()][..]));
    }

    #[test]
    fn test_single_child_reduction() {
        let ast = run("(name:ann)", &[reduce_single_children]).unwrap();
        assert_eq!(ast.kind(ast.root()), &NodeKind::Word("ann".into()));

        let ast = run("tag:[red]", &[reduce_single_children]).unwrap();
        let root = ast.root();
        assert_eq!(ast.kind(root), &NodeKind::Word("red".into()));
        assert_eq!(ast.node(root).field(), "tag");
        assert!(ast.node(root).owning_index.is_some());
    }

    #[test]
    fn test_mixed_proximity_fields_rejected() {
        let err = run("name:ann w/3 body:dogs", &[validate_proximity]).unwrap_err();
        assert!(matches!(
            err,
            CompileError::MixedFieldnamesInProximity { ref fieldnames } if fieldnames == &["name", "body"]
        ));
        assert!(run("body:(dogs w/2 bark)", &[validate_proximity]).is_ok());
    }
}
