//! Directional dependency graph.
//!
//! A small adjacency-set graph used by the values container to order
//! disposal. Edges point from a dependent node to the node it depends on
//! (`to` = dependency), so [`DirectionalGraph::ordered_all`] yields
//! descendants before ancestors: a derived value is always torn down before
//! the source it was computed from.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// Adjacency sets for one node.
#[derive(Debug, Default, Clone)]
pub struct Links<T> {
    /// Nodes this node points at (its dependencies).
    pub to: HashSet<T>,
    /// Nodes pointing at this node (its dependents).
    pub from: HashSet<T>,
}

/// A directed graph over copyable node keys.
#[derive(Debug, Default)]
pub struct DirectionalGraph<T>
where
    T: Copy + Eq + Hash,
{
    nodes: HashMap<T, Links<T>>,
}

impl<T> DirectionalGraph<T>
where
    T: Copy + Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }

    /// Insert a node with no edges. Idempotent.
    pub fn add_node(&mut self, node: T) {
        self.nodes.entry(node).or_insert_with(|| Links {
            to: HashSet::new(),
            from: HashSet::new(),
        });
    }

    /// Add an edge `from -> to`, inserting both endpoints as needed.
    pub fn add(&mut self, from: T, to: T) {
        self.add_node(to);
        self.add_node(from);
        self.nodes.get_mut(&to).map(|l| l.from.insert(from));
        self.nodes.get_mut(&from).map(|l| l.to.insert(to));
    }

    /// Remove an edge without removing its endpoints.
    pub fn remove_edge(&mut self, from: T, to: T) {
        if let Some(l) = self.nodes.get_mut(&to) {
            l.from.remove(&from);
        }
        if let Some(l) = self.nodes.get_mut(&from) {
            l.to.remove(&to);
        }
    }

    /// Remove a node and every edge touching it.
    pub fn remove(&mut self, node: T) {
        let Some(links) = self.nodes.remove(&node) else {
            return;
        };
        for n in links.to {
            if let Some(l) = self.nodes.get_mut(&n) {
                l.from.remove(&node);
            }
        }
        for n in links.from {
            if let Some(l) = self.nodes.get_mut(&n) {
                l.to.remove(&node);
            }
        }
    }

    pub fn contains(&self, node: T) -> bool {
        self.nodes.contains_key(&node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    /// Longest outgoing-path length from `node`. A node with no
    /// dependencies has order 0.
    fn order(&self, node: T, memo: &mut HashMap<T, usize>) -> usize {
        if let Some(&cached) = memo.get(&node) {
            return cached;
        }
        let result = match self.nodes.get(&node) {
            None => 0,
            Some(links) if links.to.is_empty() => 0,
            Some(links) => {
                let deps: Vec<T> = links.to.iter().copied().collect();
                deps.into_iter()
                    .map(|n| self.order(n, memo))
                    .max()
                    .unwrap_or(0)
                    + 1
            }
        };
        memo.insert(node, result);
        result
    }

    /// All nodes, deepest dependents first. Since edges run dependent ->
    /// dependency, this yields every node before anything it depends on.
    pub fn ordered_all(&self) -> Vec<T> {
        let mut memo = HashMap::new();
        let mut all: Vec<T> = self.nodes.keys().copied().collect();
        for &n in &all {
            self.order(n, &mut memo);
        }
        all.sort_by(|l, r| memo[r].cmp(&memo[l]));
        all
    }

    /// Find one cycle, if any. Returns the nodes on the cycle path.
    pub fn find_cycle(&self) -> Option<Vec<T>> {
        #[derive(PartialEq, Clone, Copy)]
        enum Color {
            Gray,
            Black,
        }

        fn paint<T: Copy + Eq + Hash>(
            graph: &DirectionalGraph<T>,
            node: T,
            colors: &mut HashMap<T, Color>,
        ) -> Option<Vec<T>> {
            colors.insert(node, Color::Gray);
            if let Some(links) = graph.nodes.get(&node) {
                for &child in &links.to {
                    match colors.get(&child) {
                        None => {
                            if let Some(mut cycle) = paint(graph, child, colors) {
                                cycle.insert(0, child);
                                return Some(cycle);
                            }
                        }
                        Some(Color::Gray) => return Some(vec![child]),
                        Some(Color::Black) => {}
                    }
                }
            }
            colors.insert(node, Color::Black);
            None
        }

        let mut colors = HashMap::new();
        let nodes: Vec<T> = self.nodes.keys().copied().collect();
        for node in nodes {
            if colors.contains_key(&node) {
                continue;
            }
            if let Some(cycle) = paint(self, node, &mut colors) {
                return Some(cycle);
            }
        }
        None
    }
}
