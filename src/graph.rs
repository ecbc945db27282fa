//! Weighted graph of indices and their join fields.
//!
//! Vertices are bare indices and `index:field` pairs. Each declared link
//! connects its left index to the left join field, the two join fields to
//! each other, and the right join field to the right index, all with weight 1.
//! Paths therefore alternate between index and field hops, and a join step
//! shows up as two consecutive field hops.

use crate::ast::{LinkTable, THIS_INDEX};
use crate::error::{CompileError, Result};
use ahash::AHashMap;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use tracing::trace;

/// One step of a relationship path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Hop {
    Index(String),
    Field { index: String, field: String },
}

impl Hop {
    pub fn field(index: &str, field: &str) -> Self {
        Hop::Field {
            index: index.to_string(),
            field: field.to_string(),
        }
    }

    pub fn index(&self) -> &str {
        match self {
            Hop::Index(index) | Hop::Field { index, .. } => index,
        }
    }

    pub fn is_index(&self) -> bool {
        matches!(self, Hop::Index(_))
    }
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hop::Index(index) => write!(f, "{}", index),
            Hop::Field { index, field } => write!(f, "{}:{}", index, field),
        }
    }
}

/// Render a path as `a -> a:x -> b:y -> b`
pub fn format_path(path: &[Hop]) -> String {
    path.iter()
        .map(Hop::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[derive(Debug, Default)]
pub struct RelationshipGraph {
    vertices: Vec<Hop>,
    ids: AHashMap<Hop, usize>,
    edges: Vec<Vec<(usize, u32)>>,
    /// Set by the first path query; no edges may be added afterwards
    sealed: bool,
}

impl RelationshipGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Graph over the own index and every link whose left index is fixed:
    /// declared links first, then alias-qualified `#expand` links
    pub fn from_links(links: &LinkTable) -> Self {
        let mut graph = Self::new();
        let own = links.has_own().then(|| links.own());
        if let Some(own) = own {
            graph.vertex(Hop::Index(links.get(own).index_name.clone()));
        }
        let inline = links
            .ids()
            .into_iter()
            .filter(|id| Some(*id) != own && !links.declared().contains(id));
        for id in links.declared().iter().copied().chain(inline) {
            let link = links.get(id);
            if link.index_name == THIS_INDEX || !links.has_fixed_left_index(id) {
                continue;
            }
            graph.register_link(
                links.left_index(id),
                links.left_field(id),
                &link.index_name,
                &link.right_field,
            );
        }
        graph
    }

    fn vertex(&mut self, hop: Hop) -> usize {
        if let Some(&id) = self.ids.get(&hop) {
            return id;
        }
        let id = self.vertices.len();
        self.vertices.push(hop.clone());
        self.ids.insert(hop, id);
        self.edges.push(Vec::new());
        id
    }

    /// Add an undirected edge
    ///
    /// # Panics
    ///
    /// Panics once a path has been computed.
    pub fn add_edge(&mut self, a: Hop, b: Hop, weight: u32) {
        assert!(!self.sealed, "edges must be added before the first path query");
        let a = self.vertex(a);
        let b = self.vertex(b);
        if a == b || self.edges[a].iter().any(|&(n, _)| n == b) {
            return;
        }
        self.edges[a].push((b, weight));
        self.edges[b].push((a, weight));
    }

    /// Register `left_index.left_field = right_index.right_field`
    pub fn register_link(&mut self, left_index: &str, left_field: &str, right_index: &str, right_field: &str) {
        let left = Hop::field(left_index, left_field);
        let right = Hop::field(right_index, right_field);
        self.add_edge(Hop::Index(left_index.to_string()), left.clone(), 1);
        self.add_edge(left, right.clone(), 1);
        self.add_edge(right, Hop::Index(right_index.to_string()), 1);
    }

    pub fn contains_index(&self, index: &str) -> bool {
        self.ids.contains_key(&Hop::Index(index.to_string()))
    }

    /// Cheapest path between two indices, endpoints included.
    ///
    /// Among equal-cost routes the one discovered first (in edge insertion
    /// order) wins.
    pub fn shortest_path(&mut self, source: &str, dest: &str) -> Result<Vec<Hop>> {
        self.sealed = true;
        let no_path = || CompileError::NoRelationshipPath {
            from: source.to_string(),
            to: dest.to_string(),
        };

        let start = *self.ids.get(&Hop::Index(source.to_string())).ok_or_else(no_path)?;
        let goal = *self.ids.get(&Hop::Index(dest.to_string())).ok_or_else(no_path)?;
        if start == goal {
            return Ok(vec![self.vertices[start].clone()]);
        }

        let mut dist = vec![u32::MAX; self.vertices.len()];
        let mut prev: Vec<Option<usize>> = vec![None; self.vertices.len()];
        let mut heap = BinaryHeap::new();
        let mut seq = 0usize;

        dist[start] = 0;
        heap.push(Reverse((0u32, seq, start)));

        while let Some(Reverse((d, _, v))) = heap.pop() {
            if d > dist[v] {
                continue;
            }
            if v == goal {
                break;
            }
            for &(n, w) in &self.edges[v] {
                let nd = d + w;
                if nd < dist[n] {
                    dist[n] = nd;
                    prev[n] = Some(v);
                    seq += 1;
                    heap.push(Reverse((nd, seq, n)));
                }
            }
        }

        if dist[goal] == u32::MAX {
            return Err(no_path());
        }

        let mut path = vec![self.vertices[goal].clone()];
        let mut current = goal;
        while let Some(p) = prev[current] {
            path.push(self.vertices[p].clone());
            current = p;
        }
        path.reverse();
        trace!(path = %format_path(&path), "relationship path");
        Ok(path)
    }
}
