//! Inactive-node propagation
//!
//! A node marked inactive disables everything downstream of it. The
//! inherited set is recomputed from the explicit seeds every time; nothing
//! is cached on the nodes themselves, so reactivating a node only takes
//! effect on the next recomputation.

use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::types::{GraphEdge, NodeId, WorkflowGraph};

/// Breadth-first forward closure of `seeds` along `edges`
pub fn propagate_inactive<'a, I>(edges: &[GraphEdge], seeds: I) -> BTreeSet<NodeId>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges {
        adjacency
            .entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
    }

    let mut inactive: BTreeSet<NodeId> = BTreeSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    for seed in seeds {
        if inactive.insert(seed.to_string()) {
            queue.push_back(seed);
        }
    }

    while let Some(node_id) = queue.pop_front() {
        for &next in adjacency.get(node_id).map(Vec::as_slice).unwrap_or(&[]) {
            if inactive.insert(next.to_string()) {
                queue.push_back(next);
            }
        }
    }

    inactive
}

/// Explicitly inactive nodes of a graph
pub fn explicit_inactive(graph: &WorkflowGraph) -> BTreeSet<NodeId> {
    graph
        .nodes
        .iter()
        .filter(|n| !n.active)
        .map(|n| n.id.clone())
        .collect()
}

/// All inactive nodes of a graph, explicit or inherited
pub fn inactive_nodes(graph: &WorkflowGraph) -> BTreeSet<NodeId> {
    let seeds = explicit_inactive(graph);
    propagate_inactive(&graph.edges, seeds.iter().map(String::as_str))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::WorkflowBuilder;

    fn chain() -> WorkflowGraph {
        WorkflowBuilder::new()
            .add_text("a", "a")
            .add_text("b", "b")
            .add_text("c", "c")
            .add_text("d", "d")
            .connect("a", "b")
            .connect("b", "c")
            .build()
    }

    #[test]
    fn test_transitive_closure() {
        let mut graph = chain();
        graph.set_active("a", false).unwrap();

        let inactive = inactive_nodes(&graph);
        let expected: BTreeSet<NodeId> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        assert_eq!(inactive, expected);
    }

    #[test]
    fn test_reactivation_requires_recompute() {
        let mut graph = chain();
        graph.set_active("a", false).unwrap();
        graph.set_active("b", false).unwrap();
        let before = inactive_nodes(&graph);
        assert!(before.contains("c"));

        // Reactivating the root alone leaves b as a seed, so b and c stay off.
        graph.set_active("a", true).unwrap();
        let after = inactive_nodes(&graph);
        assert!(!after.contains("a"));
        assert!(after.contains("b"));
        assert!(after.contains("c"));

        graph.set_active("b", true).unwrap();
        assert!(inactive_nodes(&graph).is_empty());
    }

    #[test]
    fn test_cycle_terminates() {
        let graph = WorkflowBuilder::new()
            .add_text("a", "a")
            .add_text("b", "b")
            .connect("a", "b")
            .connect("b", "a")
            .build();
        let inactive = propagate_inactive(&graph.edges, ["a"]);
        assert_eq!(inactive.len(), 2);
    }

    #[test]
    fn test_unrelated_nodes_unaffected() {
        let mut graph = chain();
        graph.set_active("c", false).unwrap();
        let inactive = inactive_nodes(&graph);
        assert!(!inactive.contains("a"));
        assert!(!inactive.contains("d"));
    }
}
