//! Core types for workflow graphs
//!
//! These types define the structure of workflow graphs: nodes with a
//! per-kind configuration, edges with optional port handles, and the
//! graph container itself. The graph is pure data; behavior lives in the
//! ordering, planning, composition and coordination modules.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::subflow::SubflowDefinition;

/// Unique identifier for a node
pub type NodeId = String;

/// Unique identifier for an edge
pub type EdgeId = String;

/// Unique identifier for a persisted subflow definition
pub type SubflowId = String;

/// Version written into every serialized graph
pub const GRAPH_FORMAT_VERSION: &str = "1.0.0";

/// Port handle naming conventions shared by the engine and hosts
pub mod handles {
    /// Target handle of the edge that overrides a loop's iteration count
    pub const ITERATIONS_OVERRIDE: &str = "iterations-override";
    /// Source handle of an IfElse node's true branch
    pub const BRANCH_TRUE: &str = "true";
    /// Source handle of an IfElse node's false branch
    pub const BRANCH_FALSE: &str = "false";

    const INPUT_PREFIX: &str = "input-";
    const OUTPUT_PREFIX: &str = "output-";

    /// Build a positional input handle: `input-{index}`
    pub fn input(index: usize) -> String {
        format!("{}{}", INPUT_PREFIX, index)
    }

    /// Build a positional output handle: `output-{index}`
    pub fn output(index: usize) -> String {
        format!("{}{}", OUTPUT_PREFIX, index)
    }

    /// Parse the index out of an `input-{index}` handle
    pub fn parse_input(handle: &str) -> Option<usize> {
        handle.strip_prefix(INPUT_PREFIX)?.parse().ok()
    }

    /// Parse the index out of an `output-{index}` handle
    pub fn parse_output(handle: &str) -> Option<usize> {
        handle.strip_prefix(OUTPUT_PREFIX)?.parse().ok()
    }
}

fn default_true() -> bool {
    true
}

fn default_separator() -> String {
    "\n".to_string()
}

fn default_loop_variable() -> String {
    "i".to_string()
}

fn default_version() -> String {
    GRAPH_FORMAT_VERSION.to_string()
}

/// Configuration of a shell command node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellConfig {
    /// Command template; `${1}`-style placeholders receive upstream results
    pub command: String,
    /// Suspend before running until a human approves
    #[serde(default)]
    pub needs_user_approval: bool,
}

/// Configuration of an LLM agent call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Prompt template
    pub prompt: String,
    /// Model identifier, resolved by the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Configuration of a static text holder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextConfig {
    pub content: String,
}

/// Configuration of a preview node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewConfig {
    /// Optional template; when empty the node shows its inputs verbatim
    #[serde(default)]
    pub content: String,
}

/// Configuration of a variable binding node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableConfig {
    /// Variable name bound in the run scope
    pub name: String,
    /// Value template; when empty the node binds its joined inputs
    #[serde(default)]
    pub content: String,
}

/// Configuration of an accumulator node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccumulatorConfig {
    /// Variable name bound in the run scope
    pub name: String,
    /// Value the accumulator starts from at the first iteration
    #[serde(default)]
    pub initial_value: String,
    /// Inserted between appended values
    #[serde(default = "default_separator")]
    pub separator: String,
}

/// Configuration of a loop entry node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopStartConfig {
    /// Number of iterations, unless overridden by an input edge
    pub iterations: u32,
    /// Name bound to the zero-based iteration index
    #[serde(default = "default_loop_variable")]
    pub loop_variable: String,
}

/// Configuration of a conditional node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IfElseConfig {
    /// Condition template, evaluated after placeholder substitution
    pub condition: String,
}

/// Configuration of a subflow wrapper node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubflowNodeConfig {
    /// Persisted definition id, if the definition has been saved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subflow_id: Option<SubflowId>,
    /// Unsaved definition captured by an extraction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<Box<SubflowDefinition>>,
    pub input_count: usize,
    pub output_count: usize,
}

/// Boundary marker inside a subflow's inner graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMarker {
    /// Port position on the wrapper
    pub index: usize,
    /// Display name of the port
    pub name: String,
}

/// The kind of a node together with its kind-specific configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodeKind {
    Shell(ShellConfig),
    Agent(AgentConfig),
    Text(TextConfig),
    Preview(PreviewConfig),
    Variable(VariableConfig),
    Accumulator(AccumulatorConfig),
    LoopStart(LoopStartConfig),
    LoopEnd,
    IfElse(IfElseConfig),
    Subflow(SubflowNodeConfig),
    SubflowInput(PortMarker),
    SubflowOutput(PortMarker),
}

impl NodeKind {
    /// Human-readable kind name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Shell(_) => "Shell",
            Self::Agent(_) => "Agent",
            Self::Text(_) => "Text",
            Self::Preview(_) => "Preview",
            Self::Variable(_) => "Variable",
            Self::Accumulator(_) => "Accumulator",
            Self::LoopStart(_) => "LoopStart",
            Self::LoopEnd => "LoopEnd",
            Self::IfElse(_) => "IfElse",
            Self::Subflow(_) => "Subflow",
            Self::SubflowInput(_) => "SubflowInput",
            Self::SubflowOutput(_) => "SubflowOutput",
        }
    }

    /// Whether this kind is handed to the host's step executor
    pub fn is_external(&self) -> bool {
        matches!(self, Self::Shell(_) | Self::Agent(_))
    }

    /// Whether this kind binds a value into the variable scope
    pub fn is_variable_binding(&self) -> bool {
        matches!(self, Self::Variable(_) | Self::Accumulator(_))
    }

    /// Whether this kind marks a subflow boundary
    pub fn is_boundary_marker(&self) -> bool {
        matches!(self, Self::SubflowInput(_) | Self::SubflowOutput(_))
    }

    /// Whether this kind delimits a loop region
    pub fn is_loop_delimiter(&self) -> bool {
        matches!(self, Self::LoopStart(_) | Self::LoopEnd)
    }

    /// The template text this node renders, if any
    pub fn template(&self) -> Option<&str> {
        match self {
            Self::Shell(c) => Some(&c.command),
            Self::Agent(c) => Some(&c.prompt),
            Self::Text(c) => Some(&c.content),
            Self::Preview(c) => Some(&c.content),
            Self::Variable(c) => Some(&c.content),
            Self::IfElse(c) => Some(&c.condition),
            _ => None,
        }
    }

    /// Name of the variable bound by this node
    pub fn variable_name(&self) -> Option<&str> {
        match self {
            Self::Variable(c) => Some(&c.name),
            Self::Accumulator(c) => Some(&c.name),
            _ => None,
        }
    }

    /// Whether execution must wait for a human approval
    pub fn needs_user_approval(&self) -> bool {
        matches!(self, Self::Shell(c) if c.needs_user_approval)
    }
}

/// A node instance in a graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    /// Unique identifier for this node instance
    pub id: NodeId,
    /// Kind and kind-specific configuration
    pub kind: NodeKind,
    /// Optional display title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Position on the canvas (x, y)
    #[serde(default)]
    pub position: (f64, f64),
    /// Inactive nodes and everything downstream of them are not executed
    #[serde(default = "default_true")]
    pub active: bool,
    /// Skip execution and reuse the archived result
    #[serde(default)]
    pub bypass: bool,
    /// A failure of this node aborts the whole run
    #[serde(default)]
    pub abort_on_error: bool,
    /// Per-node timeout for external calls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Result archived from the last run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl GraphNode {
    /// Create an active node with default policy
    pub fn new(id: impl Into<String>, kind: NodeKind, position: (f64, f64)) -> Self {
        Self {
            id: id.into(),
            kind,
            label: None,
            position,
            active: true,
            bypass: false,
            abort_on_error: false,
            timeout_ms: None,
            result: None,
        }
    }

    /// Set the display title
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Title used for port naming and presentation
    pub fn title(&self) -> String {
        if let Some(label) = self.label.as_deref().filter(|l| !l.trim().is_empty()) {
            return label.to_string();
        }
        match self.kind.variable_name() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("{} {}", self.kind.name(), self.id),
        }
    }
}

/// An edge connecting two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    /// Unique identifier for this edge
    pub id: EdgeId,
    /// Source node ID
    pub source: NodeId,
    /// Target node ID
    pub target: NodeId,
    /// Source port, when the source exposes several
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    /// Target port, when the target exposes several
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
}

impl GraphEdge {
    /// Create an edge without port handles
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            source_handle: None,
            target_handle: None,
        }
    }

    /// Set the source port handle
    pub fn with_source_handle(mut self, handle: impl Into<String>) -> Self {
        self.source_handle = Some(handle.into());
        self
    }

    /// Set the target port handle
    pub fn with_target_handle(mut self, handle: impl Into<String>) -> Self {
        self.target_handle = Some(handle.into());
        self
    }

    /// Whether this edge feeds a loop's iteration override
    pub fn is_iterations_override(&self) -> bool {
        self.target_handle.as_deref() == Some(handles::ITERATIONS_OVERRIDE)
    }
}

/// A complete workflow graph
///
/// This is also the graph file format: `{ nodes, edges, version }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowGraph {
    /// Nodes in the graph
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    /// Edges in insertion order; the order determines input ordinals
    #[serde(default)]
    pub edges: Vec<GraphEdge>,
    /// File format version
    #[serde(default = "default_version")]
    pub version: String,
}

/// The graph file document `{ nodes, edges, version }`
pub type WorkflowDocument = WorkflowGraph;

impl Default for WorkflowGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowGraph {
    /// Create a new empty graph
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
            version: default_version(),
        }
    }

    /// Find a node by ID
    pub fn find_node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Find a node by ID (mutable)
    pub fn find_node_mut(&mut self, id: &str) -> Option<&mut GraphNode> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    /// Check whether a node exists
    pub fn contains_node(&self, id: &str) -> bool {
        self.nodes.iter().any(|n| n.id == id)
    }

    /// Get edges coming into a node, in insertion order
    pub fn incoming_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a GraphEdge> + 'a {
        self.edges.iter().filter(move |e| e.target == node_id)
    }

    /// Get edges going out of a node, in insertion order
    pub fn outgoing_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a GraphEdge> + 'a {
        self.edges.iter().filter(move |e| e.source == node_id)
    }

    /// Get the IDs of nodes that this node depends on (upstream nodes)
    pub fn get_dependencies(&self, node_id: &str) -> Vec<NodeId> {
        self.incoming_edges(node_id).map(|e| e.source.clone()).collect()
    }

    /// Get the IDs of nodes that depend on this node (downstream nodes)
    pub fn get_dependents(&self, node_id: &str) -> Vec<NodeId> {
        self.outgoing_edges(node_id).map(|e| e.target.clone()).collect()
    }

    /// Add a node, rejecting duplicate IDs
    pub fn add_node(&mut self, node: GraphNode) -> Result<()> {
        if self.contains_node(&node.id) {
            return Err(EngineError::DuplicateNode(node.id));
        }
        self.nodes.push(node);
        Ok(())
    }

    /// Add an edge, rejecting dangling endpoints
    pub fn add_edge(&mut self, edge: GraphEdge) -> Result<()> {
        for endpoint in [&edge.source, &edge.target] {
            if !self.contains_node(endpoint) {
                return Err(EngineError::NodeNotFound(endpoint.clone()));
            }
        }
        self.edges.push(edge);
        Ok(())
    }

    /// Remove a node and every edge touching it
    pub fn remove_node(&mut self, id: &str) -> Option<GraphNode> {
        let pos = self.nodes.iter().position(|n| n.id == id)?;
        self.edges.retain(|e| e.source != id && e.target != id);
        Some(self.nodes.remove(pos))
    }

    /// Remove an edge by ID
    pub fn remove_edge(&mut self, id: &str) -> Option<GraphEdge> {
        let pos = self.edges.iter().position(|e| e.id == id)?;
        Some(self.edges.remove(pos))
    }

    /// Mark a node active or inactive
    pub fn set_active(&mut self, id: &str, active: bool) -> Result<()> {
        let node = self
            .find_node_mut(id)
            .ok_or_else(|| EngineError::NodeNotFound(id.to_string()))?;
        node.active = active;
        Ok(())
    }

    /// A copy with nodes and edges sorted by ID
    pub fn canonical(&self) -> WorkflowGraph {
        let mut graph = self.clone();
        graph.nodes.sort_by(|a, b| a.id.cmp(&b.id));
        graph.edges.sort_by(|a, b| a.id.cmp(&b.id));
        graph
    }

    /// Serialize the canonical form
    ///
    /// Two graphs with the same content produce byte-identical snapshots
    /// regardless of the order their nodes and edges were inserted in.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.canonical())?)
    }

    /// Parse a graph document
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize as a pretty-printed graph document
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load a graph document from a file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Save as a graph document
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json_pretty()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(id: &str) -> GraphNode {
        GraphNode::new(
            id,
            NodeKind::Text(TextConfig {
                content: id.to_string(),
            }),
            (0.0, 0.0),
        )
    }

    #[test]
    fn test_graph_edges() {
        let mut graph = WorkflowGraph::new();
        graph.add_node(text("node1")).unwrap();
        graph.add_node(text("node2")).unwrap();
        graph.add_edge(GraphEdge::new("edge1", "node1", "node2")).unwrap();

        assert_eq!(graph.get_dependencies("node2"), vec!["node1"]);
        assert_eq!(graph.get_dependents("node1"), vec!["node2"]);
    }

    #[test]
    fn test_add_edge_rejects_dangling_endpoint() {
        let mut graph = WorkflowGraph::new();
        graph.add_node(text("a")).unwrap();
        let err = graph.add_edge(GraphEdge::new("e1", "a", "missing")).unwrap_err();
        assert!(matches!(err, EngineError::NodeNotFound(id) if id == "missing"));
    }

    #[test]
    fn test_add_node_rejects_duplicate() {
        let mut graph = WorkflowGraph::new();
        graph.add_node(text("a")).unwrap();
        assert!(matches!(
            graph.add_node(text("a")),
            Err(EngineError::DuplicateNode(_))
        ));
    }

    #[test]
    fn test_remove_node_drops_edges() {
        let mut graph = WorkflowGraph::new();
        graph.add_node(text("a")).unwrap();
        graph.add_node(text("b")).unwrap();
        graph.add_node(text("c")).unwrap();
        graph.add_edge(GraphEdge::new("e1", "a", "b")).unwrap();
        graph.add_edge(GraphEdge::new("e2", "b", "c")).unwrap();

        graph.remove_node("b");
        assert_eq!(graph.nodes.len(), 2);
        assert!(graph.edges.is_empty());
    }

    #[test]
    fn test_snapshot_ignores_insertion_order() {
        let mut first = WorkflowGraph::new();
        first.add_node(text("a")).unwrap();
        first.add_node(text("b")).unwrap();
        first.add_edge(GraphEdge::new("e1", "a", "b")).unwrap();

        let mut second = WorkflowGraph::new();
        second.add_node(text("b")).unwrap();
        second.add_node(text("a")).unwrap();
        second.add_edge(GraphEdge::new("e1", "a", "b")).unwrap();

        assert_eq!(first.snapshot().unwrap(), second.snapshot().unwrap());
    }

    #[test]
    fn test_node_kind_serialization_shape() {
        let node = GraphNode::new(
            "s1",
            NodeKind::Shell(ShellConfig {
                command: "git diff".to_string(),
                needs_user_approval: true,
            }),
            (10.0, 20.0),
        );
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["kind"]["type"], "shell");
        assert_eq!(json["kind"]["command"], "git diff");
        assert_eq!(json["kind"]["needsUserApproval"], true);

        let parsed: GraphNode = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, node);
    }

    #[test]
    fn test_document_defaults() {
        let graph = WorkflowGraph::from_json(
            r#"{"nodes":[{"id":"l","kind":{"type":"loopEnd"}}],"edges":[]}"#,
        )
        .unwrap();
        assert_eq!(graph.version, GRAPH_FORMAT_VERSION);
        let node = graph.find_node("l").unwrap();
        assert!(node.active);
        assert!(!node.bypass);
        assert_eq!(node.kind, NodeKind::LoopEnd);
    }

    #[test]
    fn test_handles() {
        assert_eq!(handles::input(2), "input-2");
        assert_eq!(handles::parse_input("input-2"), Some(2));
        assert_eq!(handles::parse_output("output-0"), Some(0));
        assert_eq!(handles::parse_input("output-0"), None);
    }

    #[test]
    fn test_title_fallbacks() {
        let labelled = text("t1").with_label("Intro");
        assert_eq!(labelled.title(), "Intro");
        let var = GraphNode::new(
            "v1",
            NodeKind::Variable(VariableConfig {
                name: "branch".to_string(),
                content: String::new(),
            }),
            (0.0, 0.0),
        );
        assert_eq!(var.title(), "branch");
        assert_eq!(text("t2").title(), "Text t2");
    }
}
