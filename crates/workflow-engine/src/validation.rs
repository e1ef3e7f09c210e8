//! Graph validation
//!
//! Validates graph structure, required node fields, fan-in handles, loop
//! pairing and cycles. All errors are collected, not just the first.
//! Inactive nodes are not checked for required fields since they never run.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::Serialize;

use crate::activity::inactive_nodes;
use crate::composer::unconnected_inputs;
use crate::planner::plan;
use crate::subflow::{resolve_definition, SubflowRepository};
use crate::types::{handles, EdgeId, GraphNode, NodeId, NodeKind, WorkflowGraph};

/// Validation error with location context
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ValidationError {
    /// A cycle that is not a LoopStart/LoopEnd back-edge
    #[serde(rename_all = "camelCase")]
    CycleDetected { node_ids: Vec<NodeId> },
    /// A node is missing a field it needs to run
    #[serde(rename_all = "camelCase")]
    MissingField { node_id: NodeId, field: String },
    /// An edge references a non-existent node
    #[serde(rename_all = "camelCase")]
    UnknownNode { edge_id: EdgeId, node_id: NodeId },
    /// Two nodes share an ID
    #[serde(rename_all = "camelCase")]
    DuplicateNodeId { node_id: NodeId },
    /// Two edges occupy the same target handle
    #[serde(rename_all = "camelCase")]
    DuplicateHandle { node_id: NodeId, handle: String },
    /// Fan-in handles are not filled contiguously from `input-0`
    #[serde(rename_all = "camelCase")]
    HandleGap { node_id: NodeId, missing: usize },
    /// A LoopStart or LoopEnd without a partner
    #[serde(rename_all = "camelCase")]
    UnpairedLoop { node_id: NodeId },
    /// A loop inside another loop's region
    #[serde(rename_all = "camelCase")]
    NestedLoop { node_id: NodeId },
    /// A Subflow node whose definition cannot be found
    #[serde(rename_all = "camelCase")]
    UnresolvedSubflow { node_id: NodeId },
    /// A Subflow input port that feeds inner nodes has no incoming edge
    #[serde(rename_all = "camelCase")]
    UnconnectedInput { node_id: NodeId, index: usize },
}

impl ValidationError {
    /// The node this error is attached to, if any
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::CycleDetected { node_ids } => node_ids.first().map(String::as_str),
            Self::MissingField { node_id, .. }
            | Self::UnknownNode { node_id, .. }
            | Self::DuplicateNodeId { node_id }
            | Self::DuplicateHandle { node_id, .. }
            | Self::HandleGap { node_id, .. }
            | Self::UnpairedLoop { node_id }
            | Self::NestedLoop { node_id }
            | Self::UnresolvedSubflow { node_id }
            | Self::UnconnectedInput { node_id, .. } => Some(node_id),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CycleDetected { node_ids } => {
                write!(f, "Cycle detected in graph involving: {}", node_ids.join(", "))
            }
            Self::MissingField { node_id, field } => {
                write!(f, "Node '{}' is missing required field '{}'", node_id, field)
            }
            Self::UnknownNode { edge_id, node_id } => {
                write!(f, "Edge '{}' references unknown node '{}'", edge_id, node_id)
            }
            Self::DuplicateNodeId { node_id } => write!(f, "Duplicate node ID '{}'", node_id),
            Self::DuplicateHandle { node_id, handle } => {
                write!(f, "Handle '{}' on node '{}' has more than one edge", handle, node_id)
            }
            Self::HandleGap { node_id, missing } => write!(
                f,
                "Inputs of node '{}' must be filled contiguously; '{}' is empty",
                node_id,
                handles::input(*missing)
            ),
            Self::UnpairedLoop { node_id } => {
                write!(f, "Loop node '{}' has no matching LoopStart/LoopEnd", node_id)
            }
            Self::NestedLoop { node_id } => {
                write!(f, "Loop '{}' is nested inside another loop", node_id)
            }
            Self::UnresolvedSubflow { node_id } => {
                write!(f, "Subflow node '{}' references an unknown definition", node_id)
            }
            Self::UnconnectedInput { node_id, index } => write!(
                f,
                "Input '{}' of subflow node '{}' is not connected",
                handles::input(*index),
                node_id
            ),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validate a workflow graph
///
/// Returns all validation errors found (not just the first). Pass a
/// repository to resolve Subflow nodes that reference stored definitions.
pub fn validate_workflow(
    graph: &WorkflowGraph,
    repository: Option<&dyn SubflowRepository>,
) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let inactive = inactive_nodes(graph);

    validate_unique_ids(graph, &mut errors);
    validate_edge_references(graph, &mut errors);
    validate_handles(graph, &mut errors);

    for node in graph.nodes.iter().filter(|n| !inactive.contains(&n.id)) {
        validate_required_fields(graph, node, repository, &mut errors);
    }

    match plan(graph, &inactive) {
        Ok(plan) => {
            for node in graph.nodes.iter().filter(|n| !inactive.contains(&n.id)) {
                let is_start = plan.loops.iter().any(|l| l.start == node.id);
                let is_end = plan.loops.iter().any(|l| l.end == node.id);
                let inside = plan.loop_of(&node.id).is_some();
                match node.kind {
                    NodeKind::LoopStart(_) if !is_start && inside => {
                        errors.push(ValidationError::NestedLoop {
                            node_id: node.id.clone(),
                        });
                    }
                    NodeKind::LoopStart(_) if !is_start => errors.push(ValidationError::UnpairedLoop {
                        node_id: node.id.clone(),
                    }),
                    NodeKind::LoopEnd if !is_end && !inside => errors.push(ValidationError::UnpairedLoop {
                        node_id: node.id.clone(),
                    }),
                    _ => {}
                }
            }
        }
        Err(cycle) => errors.push(cycle),
    }

    errors
}

fn validate_unique_ids(graph: &WorkflowGraph, errors: &mut Vec<ValidationError>) {
    let mut seen = HashSet::new();
    for node in &graph.nodes {
        if !seen.insert(node.id.as_str()) {
            errors.push(ValidationError::DuplicateNodeId {
                node_id: node.id.clone(),
            });
        }
    }
}

/// Check that all edge source/target nodes exist
fn validate_edge_references(graph: &WorkflowGraph, errors: &mut Vec<ValidationError>) {
    let node_ids: HashSet<&str> = graph.nodes.iter().map(|n| n.id.as_str()).collect();

    for edge in &graph.edges {
        for endpoint in [&edge.source, &edge.target] {
            if !node_ids.contains(endpoint.as_str()) {
                errors.push(ValidationError::UnknownNode {
                    edge_id: edge.id.clone(),
                    node_id: endpoint.clone(),
                });
            }
        }
    }
}

/// One edge per target handle; fan-in handles contiguous from `input-0`
fn validate_handles(graph: &WorkflowGraph, errors: &mut Vec<ValidationError>) {
    let mut occupied: BTreeMap<(&str, &str), usize> = BTreeMap::new();
    let mut fan_in: BTreeMap<&str, BTreeSet<usize>> = BTreeMap::new();

    for edge in &graph.edges {
        let Some(handle) = edge.target_handle.as_deref() else {
            continue;
        };
        *occupied.entry((edge.target.as_str(), handle)).or_default() += 1;
        if let Some(index) = handles::parse_input(handle) {
            fan_in.entry(edge.target.as_str()).or_default().insert(index);
        }
    }

    for ((node_id, handle), count) in occupied {
        if count > 1 {
            errors.push(ValidationError::DuplicateHandle {
                node_id: node_id.to_string(),
                handle: handle.to_string(),
            });
        }
    }

    for (node_id, indices) in fan_in {
        // Wrapper ports are checked against their definition instead.
        if graph
            .find_node(node_id)
            .map_or(true, |n| matches!(n.kind, NodeKind::Subflow(_)))
        {
            continue;
        }
        if let Some(missing) = (0..indices.len()).find(|i| !indices.contains(i)) {
            errors.push(ValidationError::HandleGap {
                node_id: node_id.to_string(),
                missing,
            });
        }
    }
}

fn validate_required_fields(
    graph: &WorkflowGraph,
    node: &GraphNode,
    repository: Option<&dyn SubflowRepository>,
    errors: &mut Vec<ValidationError>,
) {
    let missing = |field: &str| ValidationError::MissingField {
        node_id: node.id.clone(),
        field: field.to_string(),
    };

    match &node.kind {
        // A bypassed node is never dispatched, so its template may be empty.
        NodeKind::Shell(config) if !node.bypass && config.command.trim().is_empty() => {
            errors.push(missing("command"));
        }
        NodeKind::Agent(config) if !node.bypass && config.prompt.trim().is_empty() => {
            errors.push(missing("prompt"));
        }
        NodeKind::IfElse(config) if config.condition.trim().is_empty() => {
            errors.push(missing("condition"));
        }
        NodeKind::Variable(_) | NodeKind::Accumulator(_)
            if node.kind.variable_name().map_or(true, |n| n.trim().is_empty()) =>
        {
            errors.push(missing("name"));
        }
        NodeKind::LoopStart(config) if config.loop_variable.trim().is_empty() => {
            errors.push(missing("loopVariable"));
        }
        NodeKind::Subflow(_) => match resolve_definition(node, repository) {
            Ok(definition) => {
                for index in unconnected_inputs(graph, &node.id, &definition) {
                    errors.push(ValidationError::UnconnectedInput {
                        node_id: node.id.clone(),
                        index,
                    });
                }
            }
            Err(_) => errors.push(ValidationError::UnresolvedSubflow {
                node_id: node.id.clone(),
            }),
        },
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::WorkflowBuilder;
    use crate::composer::extract;
    use crate::types::{GraphEdge, SubflowNodeConfig};

    #[test]
    fn test_valid_graph() {
        let graph = WorkflowBuilder::new()
            .add_shell("diff", "git diff")
            .add_agent("summary", "summarize ${1}")
            .connect("diff", "summary")
            .build();
        assert!(validate_workflow(&graph, None).is_empty());
    }

    #[test]
    fn test_missing_content_reported_per_node() {
        let graph = WorkflowBuilder::new()
            .add_shell("s", "  ")
            .add_agent("a", "")
            .add_variable("v", "", "x")
            .build();

        let errors = validate_workflow(&graph, None);
        assert_eq!(errors.len(), 3);
        let nodes: Vec<&str> = errors.iter().filter_map(|e| e.node_id()).collect();
        assert_eq!(nodes, vec!["s", "a", "v"]);
        assert_eq!(
            errors[0].to_string(),
            "Node 's' is missing required field 'command'"
        );
    }

    #[test]
    fn test_inactive_nodes_skip_field_checks() {
        let graph = WorkflowBuilder::new()
            .add_shell("s", "")
            .inactive()
            .build();
        assert!(validate_workflow(&graph, None).is_empty());
    }

    #[test]
    fn test_unknown_edge_endpoint() {
        let mut graph = WorkflowBuilder::new().add_text("a", "a").build();
        graph.edges.push(GraphEdge::new("e1", "a", "ghost"));

        let errors = validate_workflow(&graph, None);
        assert!(errors.contains(&ValidationError::UnknownNode {
            edge_id: "e1".to_string(),
            node_id: "ghost".to_string(),
        }));
    }

    #[test]
    fn test_cycle_detected() {
        let graph = WorkflowBuilder::new()
            .add_text("a", "a")
            .add_text("b", "b")
            .connect("a", "b")
            .connect("b", "a")
            .build();
        let errors = validate_workflow(&graph, None);
        assert!(matches!(errors.as_slice(), [ValidationError::CycleDetected { .. }]));
    }

    #[test]
    fn test_fan_in_handles() {
        let graph = WorkflowBuilder::new()
            .add_text("a", "a")
            .add_text("b", "b")
            .add_text("c", "c")
            .add_preview("dup")
            .add_preview("gap")
            .connect_to("a", "dup", "input-0")
            .connect_to("b", "dup", "input-0")
            .connect_to("a", "gap", "input-0")
            .connect_to("c", "gap", "input-2")
            .build();

        let errors = validate_workflow(&graph, None);
        assert!(errors.contains(&ValidationError::DuplicateHandle {
            node_id: "dup".to_string(),
            handle: "input-0".to_string(),
        }));
        assert!(errors.contains(&ValidationError::HandleGap {
            node_id: "gap".to_string(),
            missing: 1,
        }));
    }

    #[test]
    fn test_loop_pairing() {
        let graph = WorkflowBuilder::new()
            .add_loop_start("lonely", 2, "i")
            .add_text("t", "x")
            .add_loop_end("stray")
            .connect("lonely", "t")
            .build();

        let errors = validate_workflow(&graph, None);
        assert!(errors.contains(&ValidationError::UnpairedLoop {
            node_id: "lonely".to_string()
        }));
        assert!(errors.contains(&ValidationError::UnpairedLoop {
            node_id: "stray".to_string()
        }));
    }

    #[test]
    fn test_nested_loop_rejected() {
        let graph = WorkflowBuilder::new()
            .add_loop_start("outer", 2, "i")
            .add_loop_start("inner", 2, "j")
            .add_text("body", "${i}${j}")
            .add_loop_end("inner_end")
            .add_loop_end("outer_end")
            .connect("outer", "inner")
            .connect("inner", "body")
            .connect("body", "inner_end")
            .connect("inner_end", "outer_end")
            .build();

        let errors = validate_workflow(&graph, None);
        assert!(errors.contains(&ValidationError::NestedLoop {
            node_id: "inner".to_string()
        }));
    }

    #[test]
    fn test_unresolved_subflow() {
        let graph = WorkflowBuilder::new()
            .add_node(
                "w",
                NodeKind::Subflow(SubflowNodeConfig {
                    subflow_id: Some("missing".to_string()),
                    ..Default::default()
                }),
            )
            .build();
        assert_eq!(
            validate_workflow(&graph, None),
            vec![ValidationError::UnresolvedSubflow {
                node_id: "w".to_string()
            }]
        );
    }

    #[test]
    fn test_unconnected_subflow_input() {
        let mut graph = WorkflowBuilder::new()
            .add_text("ext", "outside")
            .add_text("a", "inside")
            .add_shell("c", "echo first=${1} second=${2}")
            .connect("ext", "c")
            .connect("a", "c")
            .build();
        let wrapper = extract(&mut graph, &["a".to_string(), "c".to_string()], "Echo")
            .unwrap()
            .wrapper_id;
        assert!(validate_workflow(&graph, None).is_empty());

        graph.edges.retain(|e| e.target != wrapper);
        let errors = validate_workflow(&graph, None);
        assert_eq!(
            errors,
            vec![ValidationError::UnconnectedInput {
                node_id: wrapper.clone(),
                index: 0,
            }]
        );
        assert_eq!(
            errors[0].to_string(),
            format!("Input 'input-0' of subflow node '{}' is not connected", wrapper)
        );
    }

    #[test]
    fn test_serializes_with_kind_tag() {
        let err = ValidationError::MissingField {
            node_id: "n".to_string(),
            field: "command".to_string(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "missingField");
        assert_eq!(json["nodeId"], "n");
    }
}
