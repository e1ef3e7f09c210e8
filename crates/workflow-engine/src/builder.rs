//! Fluent builder for workflow graphs
//!
//! Provides a compact API for constructing graphs programmatically.
//! Node modifiers (`at`, `labelled`, `inactive`, ...) apply to the most
//! recently added node.

use crate::types::{
    AccumulatorConfig, AgentConfig, GraphEdge, GraphNode, IfElseConfig, LoopStartConfig, NodeKind,
    PreviewConfig, ShellConfig, TextConfig, VariableConfig, WorkflowGraph,
};

/// Fluent builder for constructing workflow graphs
///
/// # Example
///
/// ```ignore
/// let graph = WorkflowBuilder::new()
///     .add_shell("diff", "git diff")
///     .add_agent("summary", "summarize ${1}")
///     .connect("diff", "summary")
///     .build();
/// ```
#[derive(Default)]
pub struct WorkflowBuilder {
    nodes: Vec<GraphNode>,
    edges: Vec<GraphEdge>,
    edge_counter: usize,
}

impl WorkflowBuilder {
    /// Create a new workflow builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node of any kind; positioned left to right by insertion order
    pub fn add_node(mut self, id: impl Into<String>, kind: NodeKind) -> Self {
        let x = self.nodes.len() as f64 * 200.0;
        self.nodes.push(GraphNode::new(id, kind, (x, 0.0)));
        self
    }

    pub fn add_shell(self, id: impl Into<String>, command: impl Into<String>) -> Self {
        self.add_node(
            id,
            NodeKind::Shell(ShellConfig {
                command: command.into(),
                needs_user_approval: false,
            }),
        )
    }

    pub fn add_agent(self, id: impl Into<String>, prompt: impl Into<String>) -> Self {
        self.add_node(
            id,
            NodeKind::Agent(AgentConfig {
                prompt: prompt.into(),
                model: None,
            }),
        )
    }

    pub fn add_text(self, id: impl Into<String>, content: impl Into<String>) -> Self {
        self.add_node(
            id,
            NodeKind::Text(TextConfig {
                content: content.into(),
            }),
        )
    }

    pub fn add_preview(self, id: impl Into<String>) -> Self {
        self.add_node(id, NodeKind::Preview(PreviewConfig::default()))
    }

    pub fn add_variable(
        self,
        id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        self.add_node(
            id,
            NodeKind::Variable(VariableConfig {
                name: name.into(),
                content: content.into(),
            }),
        )
    }

    pub fn add_accumulator(
        self,
        id: impl Into<String>,
        name: impl Into<String>,
        initial_value: impl Into<String>,
    ) -> Self {
        self.add_node(
            id,
            NodeKind::Accumulator(AccumulatorConfig {
                name: name.into(),
                initial_value: initial_value.into(),
                separator: "\n".to_string(),
            }),
        )
    }

    pub fn add_loop_start(
        self,
        id: impl Into<String>,
        iterations: u32,
        loop_variable: impl Into<String>,
    ) -> Self {
        self.add_node(
            id,
            NodeKind::LoopStart(LoopStartConfig {
                iterations,
                loop_variable: loop_variable.into(),
            }),
        )
    }

    pub fn add_loop_end(self, id: impl Into<String>) -> Self {
        self.add_node(id, NodeKind::LoopEnd)
    }

    pub fn add_if_else(self, id: impl Into<String>, condition: impl Into<String>) -> Self {
        self.add_node(
            id,
            NodeKind::IfElse(IfElseConfig {
                condition: condition.into(),
            }),
        )
    }

    fn modify_last(mut self, f: impl FnOnce(&mut GraphNode)) -> Self {
        if let Some(node) = self.nodes.last_mut() {
            f(node);
        }
        self
    }

    /// Place the most recently added node
    pub fn at(self, x: f64, y: f64) -> Self {
        self.modify_last(|n| n.position = (x, y))
    }

    /// Set a title on the most recently added node
    pub fn labelled(self, label: impl Into<String>) -> Self {
        let label = label.into();
        self.modify_last(|n| n.label = Some(label))
    }

    /// Mark the most recently added node inactive
    pub fn inactive(self) -> Self {
        self.modify_last(|n| n.active = false)
    }

    /// Bypass the most recently added node, reusing `result`
    pub fn bypassed(self, result: Option<&str>) -> Self {
        let result = result.map(str::to_string);
        self.modify_last(|n| {
            n.bypass = true;
            n.result = result;
        })
    }

    /// Abort the whole run if the most recently added node fails
    pub fn abort_on_error(self) -> Self {
        self.modify_last(|n| n.abort_on_error = true)
    }

    /// Set a timeout on the most recently added node
    pub fn timeout_ms(self, timeout_ms: u64) -> Self {
        self.modify_last(|n| n.timeout_ms = Some(timeout_ms))
    }

    /// Require approval on the most recently added shell node
    pub fn needs_approval(self) -> Self {
        self.modify_last(|n| {
            if let NodeKind::Shell(config) = &mut n.kind {
                config.needs_user_approval = true;
            }
        })
    }

    /// Add an edge without handles (auto-generates edge ID)
    pub fn connect(self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.connect_edge(source, None, target, None)
    }

    /// Add an edge leaving a named source handle
    pub fn connect_from(
        self,
        source: impl Into<String>,
        source_handle: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        self.connect_edge(source, Some(source_handle.into()), target, None)
    }

    /// Add an edge entering a named target handle
    pub fn connect_to(
        self,
        source: impl Into<String>,
        target: impl Into<String>,
        target_handle: impl Into<String>,
    ) -> Self {
        self.connect_edge(source, None, target, Some(target_handle.into()))
    }

    fn connect_edge(
        mut self,
        source: impl Into<String>,
        source_handle: Option<String>,
        target: impl Into<String>,
        target_handle: Option<String>,
    ) -> Self {
        self.edge_counter += 1;
        self.edges.push(GraphEdge {
            id: format!("edge-{}", self.edge_counter),
            source: source.into(),
            target: target.into(),
            source_handle,
            target_handle,
        });
        self
    }

    /// Build the graph without validation
    pub fn build(self) -> WorkflowGraph {
        let mut graph = WorkflowGraph::new();
        graph.nodes = self.nodes;
        graph.edges = self.edges;
        graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_chain() {
        let graph = WorkflowBuilder::new()
            .add_shell("diff", "git diff")
            .add_agent("summary", "summarize ${1}")
            .labelled("Summary")
            .connect("diff", "summary")
            .build();

        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.edges[0].id, "edge-1");
        assert_eq!(graph.find_node("summary").unwrap().title(), "Summary");
        assert_eq!(graph.find_node("summary").unwrap().position, (200.0, 0.0));
    }

    #[test]
    fn test_modifiers_apply_to_last_node() {
        let graph = WorkflowBuilder::new()
            .add_shell("a", "ls")
            .add_shell("b", "rm -rf build")
            .needs_approval()
            .abort_on_error()
            .build();

        let a = graph.find_node("a").unwrap();
        let b = graph.find_node("b").unwrap();
        assert!(!a.kind.needs_user_approval());
        assert!(b.kind.needs_user_approval());
        assert!(b.abort_on_error);
    }
}
