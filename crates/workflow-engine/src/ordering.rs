//! Edge ordinals and positional template substitution
//!
//! Every incoming edge of a node gets a stable 1-based ordinal derived from
//! edge insertion order. Authors address upstream results positionally in a
//! node's template text with `${1}`, `${2}`, ... and the coordinator fills
//! them in when dispatching. Named placeholders (`${name}`) resolve against
//! the variable scope.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::types::{EdgeId, GraphEdge, NodeId};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{\s*([A-Za-z0-9_.\-]+)\s*\}").expect("placeholder pattern is valid"));

/// An incoming edge together with its ordinal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedInput {
    pub ordinal: usize,
    pub edge_id: EdgeId,
    pub source: NodeId,
}

/// Ordinals for all incoming edges of every node
///
/// Recomputation is pure: the same edge list always yields the same
/// ordinals, and the ordinals of one target only depend on the relative
/// order of that target's own incoming edges.
#[derive(Debug, Clone, Default)]
pub struct EdgeOrdinals {
    by_target: HashMap<NodeId, Vec<OrderedInput>>,
    by_edge: HashMap<EdgeId, usize>,
}

impl EdgeOrdinals {
    /// Compute ordinals from an edge list
    pub fn compute(edges: &[GraphEdge]) -> Self {
        let mut by_target: HashMap<NodeId, Vec<OrderedInput>> = HashMap::new();
        let mut by_edge = HashMap::new();

        for edge in edges {
            let inputs = by_target.entry(edge.target.clone()).or_default();
            let ordinal = inputs.len() + 1;
            inputs.push(OrderedInput {
                ordinal,
                edge_id: edge.id.clone(),
                source: edge.source.clone(),
            });
            by_edge.insert(edge.id.clone(), ordinal);
        }

        Self { by_target, by_edge }
    }

    /// Ordinal of the first edge from `source` into `target`
    pub fn ordinal(&self, source: &str, target: &str) -> Option<usize> {
        self.by_target
            .get(target)?
            .iter()
            .find(|input| input.source == source)
            .map(|input| input.ordinal)
    }

    /// Ordinal of a specific edge
    pub fn ordinal_of_edge(&self, edge_id: &str) -> Option<usize> {
        self.by_edge.get(edge_id).copied()
    }

    /// Incoming edges of a node ordered by ordinal
    pub fn inputs_of(&self, target: &str) -> &[OrderedInput] {
        self.by_target.get(target).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The `(source, target) -> ordinal` view
    ///
    /// When a source feeds the same target twice, the lower ordinal wins.
    pub fn pairs(&self) -> HashMap<(NodeId, NodeId), usize> {
        let mut pairs = HashMap::new();
        for (target, inputs) in &self.by_target {
            for input in inputs {
                pairs
                    .entry((input.source.clone(), target.clone()))
                    .or_insert(input.ordinal);
            }
        }
        pairs
    }
}

/// Substitute `${N}` with `inputs[N-1]` and `${name}` with a variable
///
/// Placeholders that resolve to nothing are left untouched so the author
/// can see what was not bound.
pub fn render_template(
    template: &str,
    inputs: &[String],
    variables: &HashMap<String, String>,
) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            let key = &caps[1];
            if let Ok(ordinal) = key.parse::<usize>() {
                if ordinal >= 1 {
                    if let Some(value) = inputs.get(ordinal - 1) {
                        return value.clone();
                    }
                }
            } else if let Some(value) = variables.get(key) {
                return value.clone();
            }
            caps[0].to_string()
        })
        .into_owned()
}

/// Whether a template references any placeholder
pub fn has_placeholders(template: &str) -> bool {
    PLACEHOLDER.is_match(template)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(id: &str, source: &str, target: &str) -> GraphEdge {
        GraphEdge::new(id, source, target)
    }

    #[test]
    fn test_ordinals_follow_insertion_order() {
        let edges = vec![
            edge("e1", "a", "c"),
            edge("e2", "b", "c"),
            edge("e3", "c", "d"),
        ];
        let ordinals = EdgeOrdinals::compute(&edges);

        assert_eq!(ordinals.ordinal("a", "c"), Some(1));
        assert_eq!(ordinals.ordinal("b", "c"), Some(2));
        assert_eq!(ordinals.ordinal("c", "d"), Some(1));
        assert_eq!(ordinals.ordinal("a", "d"), None);
        assert_eq!(ordinals.ordinal_of_edge("e2"), Some(2));
    }

    #[test]
    fn test_ordinals_are_contiguous() {
        let edges: Vec<GraphEdge> = (0..5)
            .map(|i| edge(&format!("e{}", i), &format!("s{}", i), "t"))
            .collect();
        let ordinals = EdgeOrdinals::compute(&edges);
        let assigned: Vec<usize> = ordinals.inputs_of("t").iter().map(|i| i.ordinal).collect();
        assert_eq!(assigned, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_unrelated_reordering_keeps_ordinals() {
        let edges = vec![
            edge("e1", "a", "t"),
            edge("x1", "p", "q"),
            edge("e2", "b", "t"),
            edge("x2", "r", "q"),
        ];
        let reordered = vec![
            edge("x2", "r", "q"),
            edge("e1", "a", "t"),
            edge("x1", "p", "q"),
            edge("e2", "b", "t"),
        ];
        let before = EdgeOrdinals::compute(&edges);
        let after = EdgeOrdinals::compute(&reordered);

        assert_eq!(before.inputs_of("t"), after.inputs_of("t"));
        assert_ne!(before.inputs_of("q"), after.inputs_of("q"));
    }

    #[test]
    fn test_recompute_is_idempotent() {
        let edges = vec![edge("e1", "a", "c"), edge("e2", "b", "c")];
        assert_eq!(
            EdgeOrdinals::compute(&edges).pairs(),
            EdgeOrdinals::compute(&edges).pairs()
        );
    }

    #[test]
    fn test_render_template() {
        let inputs = vec!["diff output".to_string(), "second".to_string()];
        let mut vars = HashMap::new();
        vars.insert("branch".to_string(), "main".to_string());

        assert_eq!(
            render_template("summarize ${1} on ${branch}", &inputs, &vars),
            "summarize diff output on main"
        );
        assert_eq!(render_template("${2}/${1}", &inputs, &vars), "second/diff output");
        assert_eq!(render_template("${3} ${0} ${nope}", &inputs, &vars), "${3} ${0} ${nope}");
        assert!(has_placeholders("echo ${1}"));
        assert!(!has_placeholders("echo $1"));
    }
}
