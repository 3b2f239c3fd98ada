//! Wait-for graph derivation and cycle detection.

use crate::table::LockTable;
use concord_types::NodeId;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Directed graph of requester → holder edges over the lock table.
///
/// Always derived on demand from the table (plus any proposed edges); never
/// stored, so it cannot drift out of sync with the locks themselves.
#[derive(Debug, Default)]
pub struct WaitForGraph {
    edges: BTreeMap<NodeId, BTreeSet<NodeId>>,
}

impl WaitForGraph {
    /// Derive the graph from the current table: an edge `u → v` exists iff
    /// `u` waits on some lock held by `v`.
    pub fn from_table(table: &LockTable) -> Self {
        let mut graph = Self::default();
        for (waiter, holder) in table.wait_edges() {
            graph.add_edge(waiter.clone(), holder.clone());
        }
        graph
    }

    /// Add one edge; self-edges are meaningless here and ignored.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId) {
        if from == to {
            return;
        }
        self.edges.entry(from).or_default().insert(to);
    }

    /// Whether granting `requester` a wait on the current holders of `name`
    /// would close a cycle.
    pub fn would_deadlock(table: &LockTable, name: &str, requester: &NodeId) -> bool {
        let mut graph = Self::from_table(table);
        for holder in table.holders(name) {
            graph.add_edge(requester.clone(), holder);
        }
        graph.has_cycle()
    }

    /// Cycle detection by colored depth-first search: WHITE unvisited, GRAY
    /// on the current path, BLACK finished. A back-edge to GRAY is a cycle.
    pub fn has_cycle(&self) -> bool {
        let mut colors: HashMap<&NodeId, Color> = self
            .edges
            .keys()
            .chain(self.edges.values().flatten())
            .map(|n| (n, Color::White))
            .collect();

        let starts: Vec<&NodeId> = self.edges.keys().collect();
        for start in starts {
            if colors[start] == Color::White && self.visit(start, &mut colors) {
                return true;
            }
        }
        false
    }

    fn visit<'a>(&'a self, node: &'a NodeId, colors: &mut HashMap<&'a NodeId, Color>) -> bool {
        colors.insert(node, Color::Gray);
        if let Some(next) = self.edges.get(node) {
            for neighbor in next {
                match colors.get(neighbor).copied().unwrap_or(Color::White) {
                    Color::Gray => return true,
                    Color::White => {
                        if self.visit(neighbor, colors) {
                            return true;
                        }
                    }
                    Color::Black => {}
                }
            }
        }
        colors.insert(node, Color::Black);
        false
    }

    /// Adjacency snapshot for the `/locks` endpoint.
    pub fn snapshot(&self) -> BTreeMap<NodeId, Vec<NodeId>> {
        self.edges
            .iter()
            .map(|(from, to)| (from.clone(), to.iter().cloned().collect()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{LockCommand, LockMode};

    fn node(id: &str) -> NodeId {
        NodeId::new(id)
    }

    fn acquire(table: &mut LockTable, name: &str, mode: LockMode, requester: &str) {
        table
            .apply(&LockCommand::Acquire {
                name: name.into(),
                mode,
                requester: node(requester),
            })
            .unwrap();
    }

    #[test]
    fn empty_graph_has_no_cycle() {
        assert!(!WaitForGraph::default().has_cycle());
    }

    #[test]
    fn chain_is_acyclic() {
        let mut graph = WaitForGraph::default();
        graph.add_edge(node("a"), node("b"));
        graph.add_edge(node("b"), node("c"));
        assert!(!graph.has_cycle());
    }

    #[test]
    fn two_cycle_detected() {
        let mut graph = WaitForGraph::default();
        graph.add_edge(node("a"), node("b"));
        graph.add_edge(node("b"), node("a"));
        assert!(graph.has_cycle());
    }

    #[test]
    fn longer_cycle_detected() {
        let mut graph = WaitForGraph::default();
        graph.add_edge(node("a"), node("b"));
        graph.add_edge(node("b"), node("c"));
        graph.add_edge(node("c"), node("a"));
        graph.add_edge(node("d"), node("a"));
        assert!(graph.has_cycle());
    }

    #[test]
    fn diamond_is_acyclic() {
        // Shared structure without a back-edge must not be mistaken for a
        // cycle (the BLACK color exists exactly for this).
        let mut graph = WaitForGraph::default();
        graph.add_edge(node("a"), node("b"));
        graph.add_edge(node("a"), node("c"));
        graph.add_edge(node("b"), node("d"));
        graph.add_edge(node("c"), node("d"));
        assert!(!graph.has_cycle());
    }

    #[test]
    fn classic_two_lock_deadlock_refused() {
        // A holds x, B holds y, A waits on y. B asking for x closes the cycle.
        let mut table = LockTable::new();
        acquire(&mut table, "x", LockMode::Exclusive, "a");
        acquire(&mut table, "y", LockMode::Exclusive, "b");
        acquire(&mut table, "y", LockMode::Exclusive, "a"); // queued: a → b

        assert!(!WaitForGraph::from_table(&table).has_cycle());
        assert!(WaitForGraph::would_deadlock(&table, "x", &node("b")));
        // An uninvolved node is free to wait on x.
        assert!(!WaitForGraph::would_deadlock(&table, "x", &node("c")));
    }

    #[test]
    fn proposed_self_edge_is_ignored() {
        let mut table = LockTable::new();
        acquire(&mut table, "x", LockMode::Shared, "a");
        assert!(!WaitForGraph::would_deadlock(&table, "x", &node("a")));
    }

    #[test]
    fn snapshot_renders_adjacency() {
        let mut table = LockTable::new();
        acquire(&mut table, "x", LockMode::Exclusive, "a");
        acquire(&mut table, "x", LockMode::Exclusive, "b");
        let graph = WaitForGraph::from_table(&table);
        let snap = graph.snapshot();
        assert_eq!(snap[&node("b")], vec![node("a")]);
    }
}
