//! Sub-graph composition
//!
//! Extraction replaces a selected set of nodes with a single Subflow wrapper
//! whose ports are synthesized from the edges crossing the selection
//! boundary. Inlining is the inverse: the wrapper is replaced by its
//! definition's inner graph, with boundary markers turned back into direct
//! edges to the wrapper's former neighbours.
//!
//! Both directions walk edges in insertion order so every node keeps the
//! ordinals of its incoming edges.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use thiserror::Error;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::planner::loop_pairs;
use crate::subflow::{resolve_definition, SubflowDefinition, SubflowPort, SubflowRepository};
use crate::types::{
    handles, EdgeId, GraphEdge, GraphNode, NodeId, NodeKind, PortMarker, SubflowId,
    SubflowNodeConfig, WorkflowGraph,
};

/// Horizontal distance between boundary markers and the selection
const MARKER_OFFSET: f64 = 300.0;
/// Vertical distance between consecutive port markers
const PORT_SPACING: f64 = 100.0;

/// Errors raised while extracting or inlining a subflow
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompositionError {
    #[error("Select at least two nodes to create a subflow (got {0})")]
    SelectionTooSmall(usize),

    #[error("Selected node not found: {0}")]
    UnknownNode(NodeId),

    #[error("Selection contains subflow boundary marker '{0}'")]
    ContainsBoundaryMarker(NodeId),

    #[error("Selection splits the loop starting at '{0}'")]
    SplitsLoop(NodeId),

    #[error("Node '{0}' is not a subflow wrapper")]
    NotAWrapper(NodeId),

    #[error("Subflow definition for '{0}' could not be resolved")]
    UnresolvedDefinition(NodeId),

    #[error("Subflow definition '{0}' references itself")]
    SelfReference(SubflowId),

    #[error("Subflow nesting exceeds {max_depth} levels at '{node_id}'")]
    TooDeep { node_id: NodeId, max_depth: usize },

    #[error("Input port {index} of subflow node '{node_id}' is not connected")]
    UnconnectedInput { node_id: NodeId, index: usize },
}

/// Outcome of an extraction
#[derive(Debug, Clone)]
pub struct Extraction {
    /// The wrapper node now standing in for the selection
    pub wrapper_id: NodeId,
    /// The captured definition (also held by the wrapper as pending)
    pub definition: SubflowDefinition,
    /// Parent edges rewired onto the wrapper's ports
    pub rewired_edges: Vec<EdgeId>,
}

/// How inner IDs are mapped when splicing a definition into a graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InlineIds {
    /// Keep inner IDs, renaming only those that clash with the parent
    KeepUnlessTaken,
    /// Prefix every inner ID with `{wrapper}/`
    Scoped,
}

/// Outcome of an inlining
#[derive(Debug, Clone, Default)]
pub struct Inlined {
    /// IDs of the nodes spliced into the parent
    pub node_ids: Vec<NodeId>,
    /// IDs of the edges spliced into the parent
    pub edge_ids: Vec<EdgeId>,
}

fn generated_id(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

/// Canvas order: top to bottom, then left to right, then by ID
fn canvas_order(a: &GraphNode, b: &GraphNode) -> Ordering {
    a.position
        .1
        .total_cmp(&b.position.1)
        .then(a.position.0.total_cmp(&b.position.0))
        .then_with(|| a.id.cmp(&b.id))
}

fn centroid<'a>(nodes: impl IntoIterator<Item = &'a GraphNode>) -> (f64, f64) {
    let (mut sum_x, mut sum_y, mut count) = (0.0, 0.0, 0usize);
    for node in nodes {
        sum_x += node.position.0;
        sum_y += node.position.1;
        count += 1;
    }
    if count == 0 {
        return (0.0, 0.0);
    }
    (sum_x / count as f64, sum_y / count as f64)
}

/// A boundary port: the node a value leaves and the handle it leaves by
type PortKey = (NodeId, Option<String>);

fn port_key(edge: &GraphEdge) -> PortKey {
    (edge.source.clone(), edge.source_handle.clone())
}

/// Port name from a node title, qualified by the handle when there is one
fn port_name(title: String, handle: Option<&str>) -> String {
    match handle {
        Some(handle) => format!("{} ({})", title, handle),
        None => title,
    }
}

/// Owned data computed from the parent before it is mutated
struct ExtractionDraft {
    definition: SubflowDefinition,
    input_index: HashMap<PortKey, usize>,
    output_index: HashMap<PortKey, usize>,
    position: (f64, f64),
}

fn check_selection(
    graph: &WorkflowGraph,
    selection: &[NodeId],
    selected: &HashSet<&str>,
) -> std::result::Result<(), CompositionError> {
    if selected.len() <= 1 {
        return Err(CompositionError::SelectionTooSmall(selected.len()));
    }
    for id in selection {
        let node = graph
            .find_node(id)
            .ok_or_else(|| CompositionError::UnknownNode(id.clone()))?;
        if node.kind.is_boundary_marker() {
            return Err(CompositionError::ContainsBoundaryMarker(id.clone()));
        }
    }
    for (start, end) in loop_pairs(graph) {
        if selected.contains(start.as_str()) != selected.contains(end.as_str()) {
            return Err(CompositionError::SplitsLoop(start));
        }
    }
    Ok(())
}

/// Ports in canvas order of their node, then by handle
fn sort_ports(ports: &mut [(&GraphNode, Option<String>)]) {
    ports.sort_by(|(a, a_handle), (b, b_handle)| canvas_order(a, b).then_with(|| a_handle.cmp(b_handle)));
}

fn port_indices(ports: &[(&GraphNode, Option<String>)]) -> HashMap<PortKey, usize> {
    ports
        .iter()
        .enumerate()
        .map(|(i, (n, handle))| ((n.id.clone(), handle.clone()), i))
        .collect()
}

fn draft_extraction(graph: &WorkflowGraph, selected: &HashSet<&str>, title: &str) -> ExtractionDraft {
    let is_selected = |id: &str| selected.contains(id);
    let members: Vec<&GraphNode> = graph.nodes.iter().filter(|n| is_selected(&n.id)).collect();

    // One input port per external source handle, one output port per
    // internal source handle with an edge leaving the selection.
    let mut input_ports: Vec<(&GraphNode, Option<String>)> = Vec::new();
    let mut output_ports: Vec<(&GraphNode, Option<String>)> = Vec::new();
    let mut external_targets: HashMap<PortKey, HashSet<&str>> = HashMap::new();
    for edge in &graph.edges {
        let ports = match (is_selected(&edge.source), is_selected(&edge.target)) {
            (false, true) => &mut input_ports,
            (true, false) => {
                external_targets
                    .entry(port_key(edge))
                    .or_default()
                    .insert(edge.target.as_str());
                &mut output_ports
            }
            _ => continue,
        };
        let Some(source) = graph.find_node(&edge.source) else {
            continue;
        };
        if !ports
            .iter()
            .any(|(n, handle)| n.id == source.id && *handle == edge.source_handle)
        {
            ports.push((source, edge.source_handle.clone()));
        }
    }
    sort_ports(&mut input_ports);
    sort_ports(&mut output_ports);

    let min_x = members.iter().map(|n| n.position.0).fold(f64::INFINITY, f64::min);
    let max_x = members.iter().map(|n| n.position.0).fold(f64::NEG_INFINITY, f64::max);
    let min_y = members.iter().map(|n| n.position.1).fold(f64::INFINITY, f64::min);

    let mut inner = WorkflowGraph::new();
    let mut inputs = Vec::new();
    let mut feeders: HashMap<PortKey, NodeId> = HashMap::new();
    for (index, (source, handle)) in input_ports.iter().enumerate() {
        let marker_id = generated_id("subflow-input");
        let y = min_y + index as f64 * PORT_SPACING;
        let name = port_name(source.title(), handle.as_deref());
        inner.nodes.push(GraphNode::new(
            marker_id.clone(),
            NodeKind::SubflowInput(PortMarker {
                index,
                name: name.clone(),
            }),
            (min_x - MARKER_OFFSET, y),
        ));

        // Variable bindings are cloned inside so the inner graph still binds
        // the name in its own scope.
        let mut feeder = marker_id.clone();
        let mut binding_clone = None;
        if source.kind.is_variable_binding() {
            let mut clone = (*source).clone();
            clone.id = generated_id("binding");
            clone.position = (min_x - MARKER_OFFSET / 2.0, y);
            clone.result = None;
            inner
                .edges
                .push(GraphEdge::new(generated_id("edge"), marker_id.clone(), clone.id.clone()));
            feeder = clone.id.clone();
            binding_clone = Some(clone.id.clone());
            inner.nodes.push(clone);
        }

        feeders.insert((source.id.clone(), handle.clone()), feeder);
        inputs.push(SubflowPort {
            id: marker_id,
            name,
            index,
            binding_clone,
        });
    }

    inner.nodes.extend(members.iter().map(|n| (*n).clone()));

    let mut outputs = Vec::new();
    let mut output_markers: HashMap<PortKey, NodeId> = HashMap::new();
    for (index, (source, handle)) in output_ports.iter().enumerate() {
        let marker_id = generated_id("subflow-output");
        let key = (source.id.clone(), handle.clone());
        let name = match external_targets.get(&key) {
            Some(targets) if targets.len() == 1 => targets
                .iter()
                .next()
                .and_then(|t| graph.find_node(t))
                .map(GraphNode::title)
                .unwrap_or_else(|| source.title()),
            _ => port_name(source.title(), handle.as_deref()),
        };
        inner.nodes.push(GraphNode::new(
            marker_id.clone(),
            NodeKind::SubflowOutput(PortMarker {
                index,
                name: name.clone(),
            }),
            (max_x + MARKER_OFFSET, min_y + index as f64 * PORT_SPACING),
        ));
        output_markers.insert(key, marker_id.clone());
        outputs.push(SubflowPort {
            id: marker_id,
            name,
            index,
            binding_clone: None,
        });
    }

    let mut wired_outputs: HashSet<PortKey> = HashSet::new();
    for edge in &graph.edges {
        match (is_selected(&edge.source), is_selected(&edge.target)) {
            (true, true) => inner.edges.push(edge.clone()),
            (false, true) => {
                if let Some(feeder) = feeders.get(&port_key(edge)) {
                    inner.edges.push(GraphEdge {
                        id: generated_id("edge"),
                        source: feeder.clone(),
                        target: edge.target.clone(),
                        source_handle: None,
                        target_handle: edge.target_handle.clone(),
                    });
                }
            }
            (true, false) => {
                let key = port_key(edge);
                let Some(marker) = output_markers.get(&key) else {
                    continue;
                };
                if !wired_outputs.insert(key) {
                    continue;
                }
                inner.edges.push(GraphEdge {
                    id: generated_id("edge"),
                    source: edge.source.clone(),
                    target: marker.clone(),
                    source_handle: edge.source_handle.clone(),
                    target_handle: None,
                });
            }
            (false, false) => {}
        }
    }

    let mut definition = SubflowDefinition::new(title, inner);
    definition.inputs = inputs;
    definition.outputs = outputs;

    ExtractionDraft {
        definition,
        input_index: port_indices(&input_ports),
        output_index: port_indices(&output_ports),
        position: centroid(members.iter().copied()),
    }
}

/// Replace a selection with a Subflow wrapper holding a pending definition
///
/// The graph is left untouched when the selection is rejected.
pub fn extract(
    graph: &mut WorkflowGraph,
    selection: &[NodeId],
    title: &str,
) -> std::result::Result<Extraction, CompositionError> {
    let selected: HashSet<&str> = selection.iter().map(String::as_str).collect();
    check_selection(graph, selection, &selected)?;

    let draft = draft_extraction(graph, &selected, title);
    let wrapper_id = generated_id("subflow");
    let wrapper = GraphNode::new(
        wrapper_id.clone(),
        NodeKind::Subflow(SubflowNodeConfig {
            subflow_id: None,
            pending: Some(Box::new(draft.definition.clone())),
            input_count: draft.definition.inputs.len(),
            output_count: draft.definition.outputs.len(),
        }),
        draft.position,
    )
    .with_label(title);

    // Rewire boundary edges in place; an external source handle feeding
    // several selected nodes collapses onto a single wrapper edge.
    let mut rewired_edges = Vec::new();
    let mut fed_ports: HashSet<usize> = HashSet::new();
    for mut edge in std::mem::take(&mut graph.edges) {
        match (selected.contains(edge.source.as_str()), selected.contains(edge.target.as_str())) {
            (true, true) => continue,
            (false, true) => {
                let Some(&index) = draft.input_index.get(&port_key(&edge)) else {
                    continue;
                };
                if !fed_ports.insert(index) {
                    continue;
                }
                edge.target = wrapper_id.clone();
                edge.target_handle = Some(handles::input(index));
                rewired_edges.push(edge.id.clone());
            }
            (true, false) => {
                let Some(&index) = draft.output_index.get(&port_key(&edge)) else {
                    continue;
                };
                edge.source = wrapper_id.clone();
                edge.source_handle = Some(handles::output(index));
                rewired_edges.push(edge.id.clone());
            }
            (false, false) => {}
        }
        graph.edges.push(edge);
    }

    let insert_at = graph
        .nodes
        .iter()
        .position(|n| selected.contains(n.id.as_str()))
        .unwrap_or(graph.nodes.len());
    graph.nodes.retain(|n| !selected.contains(n.id.as_str()));
    graph.nodes.insert(insert_at.min(graph.nodes.len()), wrapper);

    log::debug!(
        "Extracted {} nodes into subflow '{}' ({} inputs, {} outputs)",
        selected.len(),
        wrapper_id,
        draft.definition.inputs.len(),
        draft.definition.outputs.len()
    );

    Ok(Extraction {
        wrapper_id,
        definition: draft.definition,
        rewired_edges,
    })
}

/// Splice a definition's inner graph into `graph` in place of a wrapper
pub fn inline(
    graph: &mut WorkflowGraph,
    wrapper_id: &str,
    definition: &SubflowDefinition,
    ids: InlineIds,
) -> std::result::Result<Inlined, CompositionError> {
    let wrapper = graph
        .find_node(wrapper_id)
        .filter(|n| matches!(n.kind, NodeKind::Subflow(_)))
        .ok_or_else(|| CompositionError::NotAWrapper(wrapper_id.to_string()))?;
    if definition.is_persisted() && definition.references(&definition.id) {
        return Err(CompositionError::SelfReference(definition.id.clone()));
    }
    let wrapper_position = wrapper.position;
    let wrapper_active = wrapper.active;

    let inner = &definition.graph;
    let mut input_markers: HashMap<&str, usize> = HashMap::new();
    let mut output_markers: HashMap<&str, usize> = HashMap::new();
    for node in &inner.nodes {
        match &node.kind {
            NodeKind::SubflowInput(marker) => {
                input_markers.insert(node.id.as_str(), marker.index);
            }
            NodeKind::SubflowOutput(marker) => {
                output_markers.insert(node.id.as_str(), marker.index);
            }
            _ => {}
        }
    }

    // Parent sources feeding each wrapper input port
    let mut feeders: HashMap<usize, (NodeId, Option<String>)> = HashMap::new();
    for edge in graph.incoming_edges(wrapper_id) {
        if let Some(index) = edge.target_handle.as_deref().and_then(handles::parse_input) {
            feeders
                .entry(index)
                .or_insert_with(|| (edge.source.clone(), edge.source_handle.clone()));
        }
    }

    // A binding clone collapses into the parent source it was cloned from.
    let mut collapsed: HashMap<&str, usize> = HashMap::new();
    for port in &definition.inputs {
        let Some(clone_id) = port.binding_clone.as_deref() else {
            continue;
        };
        let Some((source_id, _)) = feeders.get(&port.index) else {
            continue;
        };
        let same_binding = match (graph.find_node(source_id), inner.find_node(clone_id)) {
            (Some(source), Some(clone)) => source.kind == clone.kind,
            _ => false,
        };
        if same_binding {
            collapsed.insert(clone_id, port.index);
        }
    }

    let taken_nodes: HashSet<&str> = graph
        .nodes
        .iter()
        .filter(|n| n.id != wrapper_id)
        .map(|n| n.id.as_str())
        .collect();
    let taken_edges: HashSet<&str> = graph.edges.iter().map(|e| e.id.as_str()).collect();
    let map_id = |id: &str, taken: &HashSet<&str>| -> String {
        match ids {
            InlineIds::Scoped => format!("{}/{}", wrapper_id, id),
            InlineIds::KeepUnlessTaken if taken.contains(id) => format!("{}-{}", id, Uuid::new_v4()),
            InlineIds::KeepUnlessTaken => id.to_string(),
        }
    };

    let spliced: Vec<&GraphNode> = inner
        .nodes
        .iter()
        .filter(|n| !n.kind.is_boundary_marker() && !collapsed.contains_key(n.id.as_str()))
        .collect();
    let node_map: HashMap<&str, NodeId> = spliced
        .iter()
        .map(|n| (n.id.as_str(), map_id(&n.id, &taken_nodes)))
        .collect();

    let (cx, cy) = centroid(spliced.iter().copied());
    let offset = (wrapper_position.0 - cx, wrapper_position.1 - cy);
    let new_nodes: Vec<GraphNode> = spliced
        .iter()
        .map(|n| {
            let mut node = (*n).clone();
            node.id = node_map[n.id.as_str()].clone();
            node.position = (node.position.0 + offset.0, node.position.1 + offset.1);
            if !wrapper_active {
                node.active = false;
            }
            node
        })
        .collect();

    // Where a value enters: an inner node, or a parent source standing in
    // for an input marker or collapsed clone.
    let resolve_source = |id: &str, handle: &Option<String>| -> Option<(NodeId, Option<String>)> {
        match input_markers.get(id).or_else(|| collapsed.get(id)) {
            Some(index) => feeders.get(index).cloned(),
            None => node_map.get(id).map(|mapped| (mapped.clone(), handle.clone())),
        }
    };

    let mut new_edges = Vec::new();
    let mut producers: HashMap<usize, (NodeId, Option<String>)> = HashMap::new();
    for edge in &inner.edges {
        if let Some(&index) = output_markers.get(edge.target.as_str()) {
            if let Some(producer) = resolve_source(&edge.source, &edge.source_handle) {
                producers.entry(index).or_insert(producer);
            }
            continue;
        }
        let Some(target) = node_map.get(edge.target.as_str()) else {
            continue;
        };
        let Some((source, source_handle)) = resolve_source(&edge.source, &edge.source_handle) else {
            let Some(&index) = input_markers.get(edge.source.as_str()) else {
                continue;
            };
            // Dropping the edge would shift the consumer's later ordinals.
            if ids == InlineIds::Scoped {
                return Err(CompositionError::UnconnectedInput {
                    node_id: wrapper_id.to_string(),
                    index,
                });
            }
            log::warn!(
                "Input port {} of '{}' is not connected; '{}' loses that input",
                index,
                wrapper_id,
                edge.target
            );
            continue;
        };
        new_edges.push(GraphEdge {
            id: map_id(&edge.id, &taken_edges),
            source,
            target: target.clone(),
            source_handle,
            target_handle: edge.target_handle.clone(),
        });
    }

    let mut parent_edges = Vec::with_capacity(graph.edges.len() + new_edges.len());
    for mut edge in std::mem::take(&mut graph.edges) {
        if edge.target == wrapper_id {
            continue;
        }
        if edge.source == wrapper_id {
            let producer = edge
                .source_handle
                .as_deref()
                .and_then(handles::parse_output)
                .and_then(|index| producers.get(&index));
            let Some((source, source_handle)) = producer else {
                log::warn!("Dropping edge '{}' from unmapped port of '{}'", edge.id, wrapper_id);
                continue;
            };
            edge.source = source.clone();
            edge.source_handle = source_handle.clone();
        }
        parent_edges.push(edge);
    }

    let inlined = Inlined {
        node_ids: new_nodes.iter().map(|n| n.id.clone()).collect(),
        edge_ids: new_edges.iter().map(|e| e.id.clone()).collect(),
    };
    parent_edges.extend(new_edges);
    graph.edges = parent_edges;

    match graph.nodes.iter().position(|n| n.id == wrapper_id) {
        Some(index) => {
            let tail = graph.nodes.split_off(index + 1);
            graph.nodes.pop();
            graph.nodes.extend(new_nodes);
            graph.nodes.extend(tail);
        }
        None => graph.nodes.extend(new_nodes),
    }

    Ok(inlined)
}

/// Input ports of a wrapper that feed inner nodes but have no parent edge
pub fn unconnected_inputs(
    graph: &WorkflowGraph,
    wrapper_id: &str,
    definition: &SubflowDefinition,
) -> Vec<usize> {
    let connected: HashSet<usize> = graph
        .incoming_edges(wrapper_id)
        .filter_map(|e| e.target_handle.as_deref().and_then(handles::parse_input))
        .collect();
    definition
        .inputs
        .iter()
        .filter(|port| !connected.contains(&port.index))
        .filter(|port| definition.graph.outgoing_edges(&port.id).next().is_some())
        .map(|port| port.index)
        .collect()
}

/// Inline a wrapper using its pending definition or one from `repository`
pub fn inline_wrapper(
    graph: &mut WorkflowGraph,
    wrapper_id: &str,
    repository: Option<&dyn SubflowRepository>,
) -> Result<Inlined> {
    let wrapper = graph
        .find_node(wrapper_id)
        .ok_or_else(|| EngineError::NodeNotFound(wrapper_id.to_string()))?;
    let definition = resolve_definition(wrapper, repository)?;
    Ok(inline(graph, wrapper_id, &definition, InlineIds::KeepUnlessTaken)?)
}

/// Store a wrapper's pending definition and point the wrapper at it
///
/// Returns the existing ID when the wrapper already references a stored
/// definition.
pub fn persist_pending(
    graph: &mut WorkflowGraph,
    wrapper_id: &str,
    repository: &mut dyn SubflowRepository,
) -> Result<SubflowId> {
    let node = graph
        .find_node_mut(wrapper_id)
        .ok_or_else(|| EngineError::NodeNotFound(wrapper_id.to_string()))?;
    let NodeKind::Subflow(config) = &mut node.kind else {
        return Err(CompositionError::NotAWrapper(wrapper_id.to_string()).into());
    };

    let Some(pending) = config.pending.as_deref().cloned() else {
        return config
            .subflow_id
            .clone()
            .ok_or_else(|| CompositionError::UnresolvedDefinition(wrapper_id.to_string()).into());
    };
    let id = repository.create_subflow(pending)?;
    config.subflow_id = Some(id.clone());
    config.pending = None;
    log::debug!("Persisted subflow '{}' for wrapper '{}'", id, wrapper_id);
    Ok(id)
}

/// A wrapper expanded for execution and the nodes that replaced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandedWrapper {
    pub wrapper_id: NodeId,
    pub inner: Vec<NodeId>,
}

/// A graph with every Subflow wrapper expanded
#[derive(Debug, Clone)]
pub struct Expansion {
    pub graph: WorkflowGraph,
    /// Wrappers in expansion order; nested wrappers come after their parent
    pub wrappers: Vec<ExpandedWrapper>,
}

/// Expand every Subflow wrapper into scoped inner nodes (`{wrapper}/{inner}`)
pub fn expand_subflows(
    graph: &WorkflowGraph,
    repository: Option<&dyn SubflowRepository>,
    max_depth: usize,
) -> Result<Expansion> {
    let mut expanded = graph.clone();
    let mut wrappers = Vec::new();

    while let Some(wrapper) = expanded
        .nodes
        .iter()
        .find(|n| matches!(n.kind, NodeKind::Subflow(_)))
    {
        let wrapper_id = wrapper.id.clone();
        let depth = wrappers
            .iter()
            .filter(|w: &&ExpandedWrapper| wrapper_id.starts_with(&format!("{}/", w.wrapper_id)))
            .count()
            + 1;
        if depth > max_depth {
            return Err(CompositionError::TooDeep {
                node_id: wrapper_id,
                max_depth,
            }
            .into());
        }

        let definition = resolve_definition(wrapper, repository)?;
        let inlined = inline(&mut expanded, &wrapper_id, &definition, InlineIds::Scoped)?;
        log::debug!("Expanded subflow '{}' into {} nodes", wrapper_id, inlined.node_ids.len());
        wrappers.push(ExpandedWrapper {
            wrapper_id,
            inner: inlined.node_ids,
        });
    }

    Ok(Expansion {
        graph: expanded,
        wrappers,
    })
}
