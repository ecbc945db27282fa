//! Passes that decide which index owns each part of the query.

use super::Session;
use crate::ast::{Ast, IndexLink, LinkId, NodeId, NodeKind};
use crate::error::Result;
use tracing::trace;

/// Resolve `path:(...)` groups.
///
/// A path naming a link only qualified the inner fields, so the group is
/// spliced away; a path that isn't a nested field is a plain conjunction.
pub fn nested_group_fixup(mut ast: Ast, session: &mut Session<'_>) -> Result<Ast> {
    for id in ast.subtree(ast.root()) {
        let NodeKind::NestedGroup { path } = ast.kind(id).clone() else {
            continue;
        };

        if ast.links.by_name(&path).is_some() && ast.splice_up(id) {
            trace!(path = %path, "group names a link, spliced");
            continue;
        }

        let owner = session.metadata.metadata_for_field(&ast.links, &path)?;
        if !owner.metadata.is_nested(&owner.field) {
            ast.node_mut(id).kind = NodeKind::And;
        }
    }
    Ok(ast)
}

/// Assign an owning link to every leaf, strip link qualifiers from
/// fieldnames, and replace catch-all leaves with one copy per eligible field
pub fn expand_all_and_assign_links(mut ast: Ast, session: &mut Session<'_>) -> Result<Ast> {
    let own = ast.links.own();
    session
        .used_indexes
        .insert(ast.links.get(own).index_name.clone());
    let root = ast.root();
    assign(&mut ast, session, root, None)?;
    Ok(ast)
}

/// What the ownership walk does at one node
enum Step {
    Expansion(LinkId),
    CatchAll,
    Passthrough,
    Leaf,
    Children,
}

fn assign(ast: &mut Ast, session: &mut Session<'_>, id: NodeId, enclosing: Option<LinkId>) -> Result<()> {
    let step = match ast.kind(id) {
        NodeKind::Expansion(e) => Step::Expansion(e.link),
        NodeKind::Proximity { .. } if all_leaves(ast, id, |f| session.is_catch_all(f)) => Step::CatchAll,
        NodeKind::Json(_) | NodeKind::Script(_) => Step::Passthrough,
        kind if kind.is_field_leaf() => {
            if session.is_catch_all(ast.node(id).field()) {
                Step::CatchAll
            } else {
                Step::Leaf
            }
        }
        _ => Step::Children,
    };

    match step {
        Step::Expansion(link) => {
            let inner = (!ast.links.get(link).is_this_index()).then_some(link);
            let mut children = ast.child_ids(id);
            children.extend(ast.filter(id));
            for child in children {
                assign(ast, session, child, inner)?;
            }
        }
        Step::CatchAll => expand_catch_all(ast, session, id)?,
        Step::Passthrough => {
            let owner = enclosing.unwrap_or(ast.links.own());
            ast.node_mut(id).owning_index = Some(owner);
        }
        Step::Leaf => assign_owner(ast, session, id, enclosing)?,
        Step::Children => {
            for child in ast.child_ids(id) {
                assign(ast, session, child, enclosing)?;
            }
        }
    }
    Ok(())
}

fn assign_owner(ast: &mut Ast, session: &mut Session<'_>, id: NodeId, enclosing: Option<LinkId>) -> Result<()> {
    let fieldname = ast.node(id).field().to_string();

    // field lists are owned by the index of their first field
    if let Some(first) = ast.field_lists.get(&fieldname).and_then(|l| l.first()).cloned() {
        let owner = session.metadata.metadata_for_field(&ast.links, &first)?;
        ast.force_owner(id, owner.link);
        return Ok(());
    }

    if let Some(link) = enclosing {
        let index = ast.links.get(link).index_name.clone();
        if session.metadata.metadata_for_index(&index)?.has_field(&fieldname) {
            ast.force_owner(id, link);
            session.used_indexes.insert(index);
            return Ok(());
        }
    }

    let owner = session.metadata.metadata_for_field(&ast.links, &fieldname)?;
    if owner.field != fieldname {
        ast.force_fieldname(id, &owner.field);
    }
    ast.force_owner(id, owner.link);
    session.used_indexes.insert(owner.metadata.name().to_string());
    Ok(())
}

fn expand_catch_all(ast: &mut Ast, session: &mut Session<'_>, id: NodeId) -> Result<()> {
    let mut fields = Vec::new();
    for link in ast.links.search_order() {
        if ast.links.get(link).is_this_index() {
            continue;
        }
        let index = ast.links.get(link).index_name.clone();
        let md = session.metadata.metadata_for_index(&index)?;
        fields.extend(md.catch_all_fields().into_iter().map(|f| (f, link)));
    }

    if fields.is_empty() {
        let own = ast.links.own();
        ast.force_owner(id, own);
        return Ok(());
    }

    for (_, link) in &fields {
        session
            .used_indexes
            .insert(ast.links.get(*link).index_name.clone());
    }
    expand_fields(ast, id, &fields);
    Ok(())
}

/// Replace `id` with an Or of copies, one per `(field, owner)`
fn expand_fields(ast: &mut Ast, id: NodeId, fields: &[(String, LinkId)]) {
    if let [(field, link)] = fields {
        set_field_and_owner(ast, id, field, *link);
        return;
    }

    let or = ast.new_node(NodeKind::Or);
    for (field, link) in fields {
        let copy = ast.deep_copy(id);
        set_field_and_owner(ast, copy, field, *link);
        ast.add_child(or, copy);
    }
    ast.replace(id, or);
}

fn set_field_and_owner(ast: &mut Ast, id: NodeId, field: &str, link: LinkId) {
    for n in ast.subtree(id) {
        let node = ast.node_mut(n);
        if node.fieldname.is_some() {
            node.fieldname = Some(field.to_string());
        }
        node.owning_index = Some(link);
    }
}

fn all_leaves(ast: &Ast, id: NodeId, pred: impl Fn(&str) -> bool) -> bool {
    let leaves = ast.leaves(id);
    !leaves.is_empty()
        && leaves
            .iter()
            .all(|&l| ast.node(l).fieldname.as_deref().map(&pred).unwrap_or(false))
}

/// Point `this.index` links at the index that owns their left field
pub fn rewrite_indirect_links(mut ast: Ast, session: &mut Session<'_>) -> Result<Ast> {
    for id in ast.links.ids() {
        let link = ast.links.get(id);
        if !link.is_this_index() {
            continue;
        }
        let index = ast.links.left_index(id).to_string();
        let rewritten = IndexLink::new(
            link.name.clone(),
            link.left_field.clone(),
            index.clone(),
            link.right_field.clone(),
        );
        trace!(from = %link, to = %rewritten, "indirect link rewritten");
        ast.links.replace(id, rewritten);
        session.used_indexes.insert(index);
    }
    Ok(ast)
}

/// Replace references to `#field_lists` names with an Or over the listed fields
pub fn expand_field_lists(mut ast: Ast, session: &mut Session<'_>) -> Result<Ast> {
    if ast.field_lists.is_empty() {
        return Ok(ast);
    }
    let root = ast.root();
    walk_field_lists(&mut ast, session, root)?;
    Ok(ast)
}

fn walk_field_lists(ast: &mut Ast, session: &mut Session<'_>, id: NodeId) -> Result<()> {
    let list_name = |ast: &Ast, n: NodeId| {
        ast.node(n)
            .fieldname
            .as_ref()
            .filter(|f| ast.field_lists.contains_key(f.as_str()))
            .cloned()
    };

    let kind = ast.kind(id);
    let target = if matches!(kind, NodeKind::Proximity { .. }) {
        let leaves = ast.leaves(id);
        let names: Vec<_> = leaves.iter().map(|&l| list_name(ast, l)).collect();
        match names.first() {
            Some(Some(first)) if names.iter().all(|n| n.as_ref() == Some(first)) => Some(first.clone()),
            _ => None,
        }
    } else if kind.is_field_leaf() {
        list_name(ast, id)
    } else {
        None
    };

    match target {
        Some(name) => {
            let mut fields = Vec::new();
            for field in ast.field_lists.get(&name).cloned().unwrap_or_default() {
                let owner = session.metadata.metadata_for_field(&ast.links, &field)?;
                session.used_indexes.insert(owner.metadata.name().to_string());
                fields.push((owner.field, owner.link));
            }
            expand_fields(ast, id, &fields);
        }
        None => {
            let mut children = ast.child_ids(id);
            children.extend(ast.filter(id));
            for child in children {
                walk_field_lists(ast, session, child)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompileOptions;
    use crate::optimizer::test_support::library;
    use crate::query::parse_query;

    fn run(query: &str, passes: &[super::super::Pass]) -> (Ast, Vec<String>) {
        let backend = library();
        let options = CompileOptions::default();
        let mut session = Session::new(&backend, &options);
        let mut ast = parse_query(query).unwrap();
        ast.links.set_own("main", "id");
        for pass in passes {
            ast = pass(ast, &mut session).unwrap();
        }
        (ast, session.used_indexes.into_iter().collect())
    }

    fn owner_index(ast: &Ast, id: NodeId) -> String {
        ast.links
            .get(ast.node(id).owning_index.unwrap())
            .index_name
            .clone()
    }

    #[test]
    fn test_alias_prefix_is_stripped() {
        let (ast, used) = run(
            "#options(book:(book_id=<books>id)) book.isbn:a1",
            &[expand_all_and_assign_links],
        );
        let root = ast.root();
        assert_eq!(ast.node(root).field(), "isbn");
        assert_eq!(owner_index(&ast, root), "books");
        assert_eq!(used, vec!["books", "main"]);
    }

    #[test]
    fn test_catch_all_expands_per_field() {
        let (ast, _) = run("#options(book:(book_id=<books>id)) rust", &[expand_all_and_assign_links]);
        let root = ast.root();
        assert_eq!(ast.kind(root), &NodeKind::Or);
        let fields: Vec<_> = ast
            .children(root)
            .iter()
            .map(|&c| (ast.node(c).field().to_string(), owner_index(&ast, c)))
            .collect();
        assert_eq!(
            fields,
            vec![
                ("name".to_string(), "main".to_string()),
                ("body".into(), "main".into()),
                ("title".into(), "books".into()),
            ]
        );
    }

    #[test]
    fn test_catch_all_proximity_is_replicated() {
        let (ast, _) = run("dogs w/2 bark", &[expand_all_and_assign_links]);
        let root = ast.root();
        assert_eq!(ast.kind(root), &NodeKind::Or);
        for &prox in ast.children(root) {
            assert!(matches!(ast.kind(prox), NodeKind::Proximity { .. }));
            let fields: Vec<_> = ast
                .children(prox)
                .iter()
                .map(|&l| ast.node(l).field().to_string())
                .collect();
            assert_eq!(fields[0], fields[1]);
        }
    }

    #[test]
    fn test_nested_group_fixup() {
        let (ast, _) = run("comments:(author:bob and text:great)", &[nested_group_fixup]);
        assert_eq!(
            ast.kind(ast.root()),
            &NodeKind::NestedGroup { path: "comments".into() }
        );

        let (ast, _) = run("outside:(inside:a)", &[nested_group_fixup]);
        assert_eq!(ast.kind(ast.root()), &NodeKind::And);

        let (ast, _) = run(
            "#options(book:(book_id=<books>id)) name:ann and book:(title:x and isbn:y)",
            &[nested_group_fixup, expand_all_and_assign_links],
        );
        let root = ast.root();
        assert!(ast.find_descendant(root, |k| matches!(k, NodeKind::NestedGroup { .. })).is_none());
        let isbn = ast
            .leaves(root)
            .into_iter()
            .find(|&l| ast.node(l).field() == "isbn")
            .unwrap();
        assert_eq!(owner_index(&ast, isbn), "books");
    }

    #[test]
    fn test_expansion_body_prefers_target_index() {
        let (ast, _) = run(
            "#expand<book_id=<books>id>(id:10)",
            &[expand_all_and_assign_links],
        );
        let body = ast.children(ast.root())[0];
        assert_eq!(owner_index(&ast, body), "books");
    }

    #[test]
    fn test_indirect_link_rewrite() {
        let (ast, _) = run(
            "#expand<tag=<this.index>tag>(name:ann)",
            &[rewrite_indirect_links],
        );
        let e = ast.node(ast.root()).expansion().unwrap();
        assert_eq!(ast.links.get(e.link).index_name, "main");
    }

    #[test]
    fn test_field_lists_expand() {
        let (ast, _) = run(
            "#field_lists(people=[name, comments.author]) people:ann",
            &[expand_all_and_assign_links, expand_field_lists],
        );
        let root = ast.root();
        assert_eq!(ast.kind(root), &NodeKind::Or);
        let fields: Vec<_> = ast
            .children(root)
            .iter()
            .map(|&c| ast.node(c).field().to_string())
            .collect();
        assert_eq!(fields, vec!["name", "comments.author"]);
    }
}
