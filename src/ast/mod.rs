//! Query AST.
//!
//! The tree lives in an arena: every node is addressed by a [`NodeId`] and
//! stores the id of its parent. All structural changes go through the arena
//! operations on [`Ast`], which refuse to create cycles or shared children,
//! so optimizer passes can hold ids across rewrites without dangling
//! references.
//!
//! Detached nodes stay allocated until the `Ast` is dropped; only nodes
//! reachable from the root (or from an expansion filter) count as part of
//! the query.

pub mod directives;
pub mod dump;
pub mod link;
pub mod node;

pub use directives::{Aggregate, AggregateKind, Limit, Suggest, TallyOrder};
pub use link::{IndexLink, LinkId, LinkTable, THIS_INDEX};
pub use node::{Expansion, Node, NodeId, NodeKind, Operator};

use indexmap::IndexMap;

/// A parsed query: the node arena plus its side tables
#[derive(Debug, Clone)]
pub struct Ast {
    nodes: Vec<Node>,
    root: NodeId,
    pub links: LinkTable,
    /// `#field_lists(name=[a, b])` macros
    pub field_lists: IndexMap<String, Vec<String>>,
    pub aggregate: Option<Aggregate>,
    pub suggest: Option<Suggest>,
    pub limit: Option<Limit>,
}

impl Default for Ast {
    fn default() -> Self {
        Self::new()
    }
}

impl Ast {
    /// Create an AST whose root is an empty And (matches everything)
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::new(NodeKind::And)],
            root: NodeId(0),
            links: LinkTable::new(),
            field_lists: IndexMap::new(),
            aggregate: None,
            suggest: None,
            limit: None,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Make a parentless node the new root
    pub fn set_root(&mut self, id: NodeId) {
        assert!(self.node(id).parent.is_none(), "root must be detached");
        self.root = id;
    }

    pub fn alloc(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn new_node(&mut self, kind: NodeKind) -> NodeId {
        self.alloc(Node::new(kind))
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.node(id).kind
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.node(id).children
    }

    /// Owned copy of the child list, for loops that mutate the tree
    pub fn child_ids(&self, id: NodeId) -> Vec<NodeId> {
        self.node(id).children.clone()
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    /// Filter subtree of an expansion node
    pub fn filter(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).expansion().and_then(|e| e.filter)
    }

    /// Is `ancestor` on the parent chain of `id` (or `id` itself)?
    pub fn is_ancestor(&self, ancestor: NodeId, id: NodeId) -> bool {
        let mut current = Some(id);
        while let Some(n) = current {
            if n == ancestor {
                return true;
            }
            current = self.node(n).parent;
        }
        false
    }

    fn assert_adoptable(&self, parent: NodeId, child: NodeId) {
        assert!(
            self.node(child).parent.is_none(),
            "node {:?} already has a parent",
            child
        );
        assert!(
            !self.is_ancestor(child, parent),
            "adopting {:?} under {:?} would create a cycle",
            child,
            parent
        );
        assert!(child != self.root, "the root cannot become a child");
    }

    pub fn add_child(&mut self, parent: NodeId, child: NodeId) {
        self.assert_adoptable(parent, child);
        self.node_mut(child).parent = Some(parent);
        self.node_mut(parent).children.push(child);
    }

    pub fn insert_child(&mut self, parent: NodeId, index: usize, child: NodeId) {
        self.assert_adoptable(parent, child);
        self.node_mut(child).parent = Some(parent);
        let children = &mut self.node_mut(parent).children;
        let index = index.min(children.len());
        children.insert(index, child);
    }

    /// Attach a filter subtree to an expansion node
    pub fn set_filter(&mut self, expansion: NodeId, filter: NodeId) {
        self.assert_adoptable(expansion, filter);
        self.node_mut(filter).parent = Some(expansion);
        let e = self
            .node_mut(expansion)
            .expansion_mut()
            .expect("filters attach to expansion nodes");
        assert!(e.filter.is_none(), "expansion already has a filter");
        e.filter = Some(filter);
    }

    /// Unlink a node from its parent. Detaching the root leaves an empty And in its place.
    pub fn detach(&mut self, id: NodeId) {
        if id == self.root {
            self.root = self.new_node(NodeKind::And);
            return;
        }
        let Some(parent) = self.node(id).parent else {
            return;
        };
        let parent_node = self.node_mut(parent);
        if let Some(e) = parent_node.expansion_mut() {
            if e.filter == Some(id) {
                e.filter = None;
            }
        }
        parent_node.children.retain(|&c| c != id);
        self.node_mut(id).parent = None;
    }

    /// Remove a direct child; the remaining children close the gap
    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) {
        assert_eq!(self.node(child).parent, Some(parent), "not a child");
        self.detach(child);
    }

    /// Put a detached node in the place `old` occupies; `old` ends up detached
    pub fn replace(&mut self, old: NodeId, new: NodeId) {
        if old == new {
            return;
        }
        assert!(self.node(new).parent.is_none(), "replacement must be detached");
        if old == self.root {
            self.root = new;
            return;
        }
        let Some(parent) = self.node(old).parent else {
            panic!("cannot replace detached node {:?}", old);
        };
        assert!(!self.is_ancestor(new, parent), "replacement would create a cycle");
        let parent_node = self.node_mut(parent);
        if let Some(e) = parent_node.expansion_mut() {
            if e.filter == Some(old) {
                e.filter = Some(new);
            }
        }
        for slot in parent_node.children.iter_mut() {
            if *slot == old {
                *slot = new;
            }
        }
        self.node_mut(new).parent = Some(parent);
        self.node_mut(old).parent = None;
    }

    pub fn replace_child(&mut self, parent: NodeId, old: NodeId, new: NodeId) {
        assert_eq!(self.node(old).parent, Some(parent), "not a child");
        self.replace(old, new);
    }

    /// Replace a node with its own children, in place.
    ///
    /// A root with exactly one child hands the root over to that child; a
    /// root with several children is left untouched and `false` returned.
    pub fn splice_up(&mut self, id: NodeId) -> bool {
        let children = std::mem::take(&mut self.node_mut(id).children);
        for &c in &children {
            self.node_mut(c).parent = None;
        }
        if id == self.root {
            if children.len() == 1 {
                self.root = children[0];
                return true;
            }
            for c in children {
                self.node_mut(c).parent = Some(id);
                self.node_mut(id).children.push(c);
            }
            return false;
        }
        let parent = self.node(id).parent.expect("non-root nodes have parents");
        let position = self
            .children(parent)
            .iter()
            .position(|&c| c == id)
            .expect("child is listed by its parent");
        self.node_mut(parent).children.remove(position);
        self.node_mut(id).parent = None;
        for (offset, c) in children.into_iter().enumerate() {
            self.node_mut(c).parent = Some(parent);
            self.node_mut(parent).children.insert(position + offset, c);
        }
        true
    }

    /// Move every child of `from` to the end of `to`
    pub fn adopt_children(&mut self, from: NodeId, to: NodeId) {
        for child in self.child_ids(from) {
            self.detach(child);
            self.add_child(to, child);
        }
    }

    /// Replace `id` with a new node built from `wrapper` and make `id` its only child
    pub fn wrap(&mut self, id: NodeId, wrapper: Node) -> NodeId {
        let new = self.alloc(wrapper);
        self.replace(id, new);
        self.add_child(new, id);
        new
    }

    /// Detached deep copy of a subtree, filters included
    pub fn deep_copy(&mut self, id: NodeId) -> NodeId {
        let mut node = self.node(id).clone();
        let children = std::mem::take(&mut node.children);
        let filter = node.expansion_mut().and_then(|e| e.filter.take());
        node.parent = None;
        let copy = self.alloc(node);
        for child in children {
            let child_copy = self.deep_copy(child);
            self.add_child(copy, child_copy);
        }
        if let Some(filter) = filter {
            let filter_copy = self.deep_copy(filter);
            self.set_filter(copy, filter_copy);
        }
        copy
    }

    /// Pre-order ids of a subtree, `id` included, expansion filters excluded
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        self.collect(id, false)
    }

    /// Pre-order ids of a subtree including expansion filters
    pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        self.collect(id, true)
    }

    fn collect(&self, id: NodeId, with_filters: bool) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            out.push(n);
            if with_filters {
                if let Some(f) = self.filter(n) {
                    stack.push(f);
                }
            }
            stack.extend(self.children(n).iter().rev());
        }
        out
    }

    /// Post-order ids of a subtree (children before parents), filters excluded
    pub fn post_order(&self, id: NodeId) -> Vec<NodeId> {
        let mut ordered = Vec::new();
        self.post_order_into(id, &mut ordered);
        ordered
    }

    fn post_order_into(&self, id: NodeId, out: &mut Vec<NodeId>) {
        for &c in self.children(id) {
            self.post_order_into(c, out);
        }
        out.push(id);
    }

    /// First node in the subtree (pre-order, `id` excluded) matching `pred`
    pub fn find_descendant(&self, id: NodeId, pred: impl Fn(&NodeKind) -> bool) -> Option<NodeId> {
        self.descendants(id)
            .into_iter()
            .skip(1)
            .find(|&n| pred(self.kind(n)))
    }

    /// Field-carrying leaves of a subtree; Array nodes count as one leaf
    pub fn leaves(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            let kind = self.kind(n);
            if kind.is_leaf() {
                out.push(n);
            } else {
                stack.extend(self.children(n).iter().rev());
            }
        }
        out
    }

    /// Overwrite the fieldname of every node in a subtree
    pub fn force_fieldname(&mut self, id: NodeId, fieldname: &str) {
        for n in self.descendants(id) {
            self.node_mut(n).fieldname = Some(fieldname.to_string());
        }
    }

    /// Overwrite the operator of every node in a subtree
    pub fn force_operator(&mut self, id: NodeId, operator: crate::ast::Operator) {
        for n in self.descendants(id) {
            self.node_mut(n).operator = operator;
        }
    }

    /// Overwrite the owning index of every node in a subtree, filters included
    pub fn force_owner(&mut self, id: NodeId, link: LinkId) {
        for n in self.subtree(id) {
            self.node_mut(n).owning_index = Some(link);
        }
    }

    /// Number of nodes reachable from the root, filters included
    pub fn node_count(&self) -> usize {
        self.subtree(self.root).len()
    }

    pub fn is_root(&self, id: NodeId) -> bool {
        id == self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(ast: &mut Ast, field: &str, value: &str) -> NodeId {
        ast.alloc(Node::new(NodeKind::Word(value.into())).with_field(field, Operator::Eq))
    }

    fn sample() -> (Ast, NodeId, NodeId, NodeId) {
        let mut ast = Ast::new();
        let or = ast.new_node(NodeKind::Or);
        let a = word(&mut ast, "title", "a");
        let b = word(&mut ast, "title", "b");
        ast.add_child(or, a);
        ast.add_child(or, b);
        let root = ast.root();
        ast.add_child(root, or);
        (ast, or, a, b)
    }

    #[test]
    fn test_remove_child_renumbers() {
        let (mut ast, or, a, b) = sample();
        ast.remove_child(or, a);
        assert_eq!(ast.children(or), &[b]);
        assert_eq!(ast.parent(a), None);
        assert_eq!(ast.node_count(), 3);
    }

    #[test]
    fn test_deep_copy_is_independent() {
        let (mut ast, or, a, _) = sample();
        let copy = ast.deep_copy(or);
        assert_eq!(ast.parent(copy), None);
        let copy_a = ast.children(copy)[0];
        assert_ne!(copy_a, a);
        ast.node_mut(copy_a).kind = NodeKind::Word("changed".into());
        assert_eq!(ast.kind(a), &NodeKind::Word("a".into()));
    }

    #[test]
    fn test_deep_copy_copies_filter() {
        let mut ast = Ast::new();
        let link = ast.links.add(IndexLink::new(None, "id", "other", "id"));
        let exp = ast.new_node(NodeKind::Expansion(Expansion::new(link, false)));
        let body = word(&mut ast, "x", "1");
        let filter = word(&mut ast, "y", "2");
        ast.add_child(exp, body);
        ast.set_filter(exp, filter);
        let copy = ast.deep_copy(exp);
        let copied_filter = ast.filter(copy).unwrap();
        assert_ne!(copied_filter, filter);
        assert_eq!(ast.parent(copied_filter), Some(copy));
        assert_eq!(ast.subtree(copy).len(), 3);
    }

    #[test]
    fn test_splice_up_keeps_position() {
        let (mut ast, or, a, b) = sample();
        let root = ast.root();
        let c = word(&mut ast, "title", "c");
        ast.add_child(root, c);
        ast.splice_up(or);
        assert_eq!(ast.children(root), &[a, b, c]);
        assert_eq!(ast.parent(a), Some(root));
    }

    #[test]
    fn test_wrap_and_replace() {
        let (mut ast, or, a, _) = sample();
        let not = ast.wrap(a, Node::new(NodeKind::Not));
        assert_eq!(ast.children(or)[0], not);
        assert_eq!(ast.children(not), &[a]);
        let z = word(&mut ast, "title", "z");
        ast.replace(not, z);
        assert_eq!(ast.children(or)[0], z);
        assert_eq!(ast.parent(not), None);
    }

    #[test]
    #[should_panic(expected = "cycle")]
    fn test_cycle_is_rejected() {
        let (mut ast, or, a, _) = sample();
        ast.detach(or);
        ast.detach(a);
        ast.add_child(a, or);
        // `or` now hangs under `a`; putting `a` under `or` closes a loop
        ast.add_child(or, a);
    }

    #[test]
    fn test_force_helpers() {
        let (mut ast, or, a, b) = sample();
        ast.force_fieldname(or, "body");
        ast.force_operator(or, Operator::Ne);
        assert_eq!(ast.node(a).field(), "body");
        assert_eq!(ast.node(b).operator, Operator::Ne);
    }

    #[test]
    fn test_find_descendant() {
        let (ast, or, _, _) = sample();
        let root = ast.root();
        assert_eq!(ast.find_descendant(root, |k| matches!(k, NodeKind::Or)), Some(or));
        assert!(ast.find_descendant(root, |k| k.is_expansion()).is_none());
    }
}
