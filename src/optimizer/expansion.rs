//! Expansion injection and merging.
//!
//! After ownership assignment every maximal subtree whose leaves share one
//! owning link is wrapped in a generated Expansion for that link; the
//! resolver later unwraps the ones that belong to the search index and
//! materializes the rest as joins.

use super::Session;
use crate::ast::{Ast, Expansion, LinkId, Node, NodeId, NodeKind};
use crate::error::Result;
use tracing::trace;

pub fn inject_expansions(mut ast: Ast, _session: &mut Session<'_>) -> Result<Ast> {
    let root = ast.root();
    inject(&mut ast, root, None);
    Ok(ast)
}

fn inject(ast: &mut Ast, id: NodeId, ctx: Option<LinkId>) {
    if let Some(e) = ast.node(id).expansion() {
        let link = e.link;
        let mut children = ast.child_ids(id);
        children.extend(ast.filter(id));
        for child in children {
            inject(ast, child, Some(link));
        }
        return;
    }

    let owners = owners(ast, id, ctx);
    let is_not = matches!(ast.kind(id), NodeKind::Not);
    match owners.as_slice() {
        [Some(owner)] if !is_not => {
            let owner = *owner;
            if ctx != Some(owner) {
                trace!(node = ?id, "injecting expansion");
                let wrapper = Node::new(NodeKind::Expansion(Expansion::new(owner, true)))
                    .with_owner(Some(owner));
                ast.wrap(id, wrapper);
            }
            inject_nested(ast, id);
        }
        _ => {
            for child in ast.child_ids(id) {
                inject(ast, child, ctx);
            }
        }
    }
}

/// Process user expansions sitting inside an already owned subtree
fn inject_nested(ast: &mut Ast, id: NodeId) {
    for child in ast.child_ids(id) {
        if ast.kind(child).is_expansion() {
            inject(ast, child, None);
        } else {
            inject_nested(ast, child);
        }
    }
}

/// Distinct owners of a subtree's leaves; an Expansion counts as `ctx`
fn owners(ast: &Ast, id: NodeId, ctx: Option<LinkId>) -> Vec<Option<LinkId>> {
    let mut out = Vec::new();
    let mut stack = vec![id];
    while let Some(n) = stack.pop() {
        let node = ast.node(n);
        let owner = if node.kind.is_expansion() {
            Some(ctx)
        } else if node.kind.is_leaf() {
            Some(node.owning_index.or(Some(ast.links.own())))
        } else {
            stack.extend(node.children().iter().rev());
            None
        };
        if let Some(owner) = owner {
            if !out.contains(&owner) {
                out.push(owner);
            }
        }
    }
    out
}

/// Merge sibling expansions of the same link, and unwrap expansions nested
/// inside another expansion of the same link
pub fn merge_expansions(mut ast: Ast, _session: &mut Session<'_>) -> Result<Ast> {
    for id in ast.subtree(ast.root()) {
        if !is_attached(&ast, id) {
            continue;
        }
        match ast.kind(id) {
            NodeKind::And | NodeKind::Or | NodeKind::Not => merge_siblings(&mut ast, id),
            NodeKind::Expansion(e) => {
                let link = e.link;
                unwrap_same_link(&mut ast, id, link);
            }
            _ => {}
        }
    }
    Ok(ast)
}

/// Bodies combine with the parent's kind; under Not, which excludes any of
/// its children, they combine with Or
fn merge_siblings(ast: &mut Ast, parent: NodeId) {
    let kind = match ast.kind(parent) {
        NodeKind::Not => NodeKind::Or,
        other => other.clone(),
    };
    let children = ast.child_ids(parent);
    let mut merged = vec![false; children.len()];

    for i in 0..children.len() {
        let Some(key) = merge_key(ast, children[i]) else {
            continue;
        };
        if merged[i] {
            continue;
        }
        let group: Vec<usize> = (i + 1..children.len())
            .filter(|&j| !merged[j] && merge_key(ast, children[j]) == Some(key))
            .collect();
        if group.is_empty() {
            continue;
        }

        let first = children[i];
        let combined = ast.new_node(kind.clone());
        let body = ast.children(first)[0];
        ast.detach(body);
        ast.add_child(combined, body);
        for j in group {
            merged[j] = true;
            let other = children[j];
            let other_body = ast.children(other)[0];
            ast.detach(other_body);
            ast.add_child(combined, other_body);
            ast.detach(other);
        }
        ast.add_child(first, combined);
        trace!(parent = ?parent, "merged sibling expansions");
    }
}

/// Expansions merge when they share a link, a kind, and carry no filter
fn merge_key(ast: &Ast, id: NodeId) -> Option<(LinkId, bool)> {
    let e = ast.node(id).expansion()?;
    (e.filter.is_none() && ast.children(id).len() == 1).then_some((e.link, e.generated))
}

fn unwrap_same_link(ast: &mut Ast, id: NodeId, link: LinkId) {
    let inner: Vec<NodeId> = ast
        .descendants(id)
        .into_iter()
        .skip(1)
        .filter(|&n| {
            ast.node(n)
                .expansion()
                .map(|e| e.link == link && e.filter.is_none())
                .unwrap_or(false)
        })
        .collect();
    for n in inner {
        if is_attached(ast, n) {
            ast.splice_up(n);
        }
    }
}

fn is_attached(ast: &Ast, id: NodeId) -> bool {
    ast.is_ancestor(ast.root(), id)
}

/// Give self-alias expansions an own-index alternative: `Or(body, E)`
pub fn generated_to_or(mut ast: Ast, session: &mut Session<'_>) -> Result<Ast> {
    let own = ast.links.own();
    let search_link = session.search_link.unwrap_or(own);
    let search_index = ast.links.get(search_link).index_name.clone();

    for id in ast.subtree(ast.root()) {
        let Some(e) = ast.node(id).expansion() else {
            continue;
        };
        let link = e.link;
        if !e.generated
            || e.paired
            || link == own
            || link == search_link
            || ast.links.get(link).index_name != search_index
            || ast.children(id).len() != 1
        {
            continue;
        }

        if let Some(e) = ast.node_mut(id).expansion_mut() {
            e.paired = true;
        }
        let body = ast.children(id)[0];
        let copy = ast.deep_copy(body);
        let or = ast.wrap(id, Node::new(NodeKind::Or));
        ast.insert_child(or, 0, copy);
        trace!(link = %ast.links.get(link), "self-alias expansion paired with own-index body");
    }
    Ok(ast)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompileOptions;
    use crate::optimizer::links::expand_all_and_assign_links;
    use crate::optimizer::test_support::library;
    use crate::query::parse_query;

    fn prepare(query: &str) -> Ast {
        let backend = library();
        let options = CompileOptions::default();
        let mut session = Session::new(&backend, &options);
        let mut ast = parse_query(query).unwrap();
        ast.links.set_own("main", "id");
        let ast = expand_all_and_assign_links(ast, &mut session).unwrap();
        let ast = inject_expansions(ast, &mut session).unwrap();
        merge_expansions(ast, &mut session).unwrap()
    }

    #[test]
    fn test_user_expansion_is_not_swallowed() {
        let ast = prepare("#options(book:(book_id=<books>id)) title:rust and #expand<tag=<this.index>tag>(name:ann)");
        let root = ast.root();
        assert_eq!(ast.kind(root), &NodeKind::And);
        let kinds: Vec<bool> = ast
            .children(root)
            .iter()
            .map(|&c| ast.node(c).expansion().unwrap().generated)
            .collect();
        assert_eq!(kinds, vec![true, false]);
    }

    #[test]
    fn test_same_link_siblings_merge_under_or() {
        let ast = prepare("#options(book:(book_id=<books>id)) title:rust or name:ann or isbn:a1");
        let root = ast.root();
        assert_eq!(ast.children(root).len(), 2);
        let books = ast.children(root)[0];
        let body = ast.children(books)[0];
        assert_eq!(ast.kind(body), &NodeKind::Or);
        assert_eq!(ast.children(body).len(), 2);
    }

    #[test]
    fn test_same_link_siblings_merge_under_not() {
        let mut ast = prepare("#options(book:(book_id=<books>id)) title:rust or title:war");
        let books = ast.root();
        let body = ast.children(books)[0];
        let (rust, war) = (ast.children(body)[0], ast.children(body)[1]);
        let link = ast.node(books).expansion().unwrap().link;

        let not = ast.new_node(NodeKind::Not);
        for leaf in [rust, war] {
            ast.detach(leaf);
            let expansion = ast.alloc(
                Node::new(NodeKind::Expansion(Expansion::new(link, true))).with_owner(Some(link)),
            );
            ast.add_child(expansion, leaf);
            ast.add_child(not, expansion);
        }
        ast.set_root(not);

        let backend = library();
        let options = CompileOptions::default();
        let mut session = Session::new(&backend, &options);
        let ast = merge_expansions(ast, &mut session).unwrap();
        let root = ast.root();
        assert_eq!(ast.children(root).len(), 1);
        let merged = ast.children(root)[0];
        assert_eq!(ast.node(merged).expansion().unwrap().link, link);
        let body = ast.children(merged)[0];
        assert_eq!(ast.kind(body), &NodeKind::Or);
        assert_eq!(ast.children(body), &[rust, war]);
    }

    #[test]
    fn test_nested_same_link_is_unwrapped() {
        let mut ast = Ast::new();
        let link = ast.links.set_own("main", "id");
        let leaf = ast.alloc(Node::new(NodeKind::Word("x".into())).with_field("name", crate::ast::Operator::Eq));
        let inner = ast.new_node(NodeKind::Expansion(Expansion::new(link, true)));
        ast.add_child(inner, leaf);
        let outer = ast.new_node(NodeKind::Expansion(Expansion::new(link, true)));
        ast.add_child(outer, inner);
        ast.set_root(outer);

        let backend = library();
        let options = CompileOptions::default();
        let mut session = Session::new(&backend, &options);
        let ast = merge_expansions(ast, &mut session).unwrap();
        assert_eq!(ast.children(ast.root()), &[leaf]);
    }

    #[test]
    fn test_self_alias_expansion_paired_with_or() {
        let backend = library();
        let options = CompileOptions::default();
        let mut session = Session::new(&backend, &options);
        let mut ast = parse_query("#options(parent:(parent_id=<main>id)) parent.name:ann").unwrap();
        ast.links.set_own("main", "id");
        let ast = expand_all_and_assign_links(ast, &mut session).unwrap();
        let ast = inject_expansions(ast, &mut session).unwrap();
        let ast = generated_to_or(ast, &mut session).unwrap();
        let root = ast.root();
        assert_eq!(ast.kind(root), &NodeKind::Or);
        assert!(ast.kind(ast.children(root)[0]).is_field_leaf());
        assert!(ast.node(ast.children(root)[1]).expansion().unwrap().paired);

        let count = ast.node_count();
        let ast = generated_to_or(ast, &mut session).unwrap();
        assert_eq!(ast.node_count(), count);
    }
}
