//! The per-run aggregate
//!
//! A `Run` is created fresh for every execution and owned by the
//! coordinator for its whole lifetime; it is handed back to the caller when
//! the run finishes.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// Status of a node within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Error,
    Interrupted,
    PendingApproval,
    /// Not executed this run: unselected branch or zero-iteration loop
    Skipped,
}

impl NodeStatus {
    /// Whether the node is done for the current iteration
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Error | Self::Interrupted | Self::Skipped
        )
    }

    /// Whether the node failed to produce a result
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Error | Self::Interrupted)
    }
}

/// Global state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Aborted,
}

/// Variable bindings as a stack of frames
///
/// The root frame lives for the whole run; each loop iteration pushes a
/// fresh frame that is discarded when the iteration ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableScope {
    frames: Vec<HashMap<String, String>>,
}

impl Default for VariableScope {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableScope {
    pub fn new() -> Self {
        Self {
            frames: vec![HashMap::new()],
        }
    }

    pub fn push_frame(&mut self) {
        self.frames.push(HashMap::new());
    }

    /// Drop the innermost frame; the root frame is never dropped
    pub fn pop_frame(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Bind in the innermost frame
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name.into(), value.into());
        }
    }

    /// Bind in the root frame, visible for the rest of the run
    pub fn set_root(&mut self, name: impl Into<String>, value: impl Into<String>) {
        if let Some(frame) = self.frames.first_mut() {
            frame.insert(name.into(), value.into());
        }
    }

    /// Innermost binding of a name
    pub fn get(&self, name: &str) -> Option<&str> {
        self.frames
            .iter()
            .rev()
            .find_map(|frame| frame.get(name))
            .map(String::as_str)
    }

    /// Flattened view, inner frames shadowing outer ones
    pub fn snapshot(&self) -> HashMap<String, String> {
        let mut merged = HashMap::new();
        for frame in &self.frames {
            for (name, value) in frame {
                merged.insert(name.clone(), value.clone());
            }
        }
        merged
    }
}

/// Status, results and errors of one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub state: RunState,
    statuses: BTreeMap<NodeId, NodeStatus>,
    results: BTreeMap<NodeId, String>,
    errors: BTreeMap<NodeId, String>,
    pub scope: VariableScope,
    /// Accumulator values carried across loop iterations
    accumulators: BTreeMap<NodeId, String>,
}

impl Run {
    /// Create an idle run with every node pending
    pub fn new<I, S>(node_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        Self {
            id: format!("run-{}", uuid::Uuid::new_v4()),
            state: RunState::Idle,
            statuses: node_ids
                .into_iter()
                .map(|id| (id.into(), NodeStatus::Pending))
                .collect(),
            results: BTreeMap::new(),
            errors: BTreeMap::new(),
            scope: VariableScope::new(),
            accumulators: BTreeMap::new(),
        }
    }

    pub fn status(&self, node_id: &str) -> Option<NodeStatus> {
        self.statuses.get(node_id).copied()
    }

    pub fn set_status(&mut self, node_id: &str, status: NodeStatus) {
        self.statuses.insert(node_id.to_string(), status);
    }

    /// Record a result and mark the node completed
    pub fn complete(&mut self, node_id: &str, result: impl Into<String>) {
        self.results.insert(node_id.to_string(), result.into());
        self.errors.remove(node_id);
        self.set_status(node_id, NodeStatus::Completed);
    }

    /// Record a failure with the given status
    pub fn fail(&mut self, node_id: &str, status: NodeStatus, message: impl Into<String>) {
        self.results.remove(node_id);
        self.errors.insert(node_id.to_string(), message.into());
        self.set_status(node_id, status);
    }

    pub fn result(&self, node_id: &str) -> Option<&str> {
        self.results.get(node_id).map(String::as_str)
    }

    pub fn error(&self, node_id: &str) -> Option<&str> {
        self.errors.get(node_id).map(String::as_str)
    }

    pub fn statuses(&self) -> &BTreeMap<NodeId, NodeStatus> {
        &self.statuses
    }

    pub fn results(&self) -> &BTreeMap<NodeId, String> {
        &self.results
    }

    pub fn errors(&self) -> &BTreeMap<NodeId, String> {
        &self.errors
    }

    /// Nodes currently in a given status
    pub fn nodes_with(&self, status: NodeStatus) -> Vec<&str> {
        self.statuses
            .iter()
            .filter(|(_, s)| **s == status)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// Return nodes to pending for another loop iteration
    ///
    /// Accumulator values are kept.
    pub fn reset<'a, I: IntoIterator<Item = &'a NodeId>>(&mut self, node_ids: I) {
        for id in node_ids {
            self.results.remove(id);
            self.errors.remove(id);
            self.statuses.insert(id.clone(), NodeStatus::Pending);
        }
    }

    pub fn accumulator(&self, node_id: &str) -> Option<&str> {
        self.accumulators.get(node_id).map(String::as_str)
    }

    pub fn set_accumulator(&mut self, node_id: &str, value: impl Into<String>) {
        self.accumulators.insert(node_id.to_string(), value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_run_is_pending() {
        let run = Run::new(["a", "b"]);
        assert_eq!(run.state, RunState::Idle);
        assert_eq!(run.status("a"), Some(NodeStatus::Pending));
        assert_eq!(run.status("missing"), None);
        assert!(run.id.starts_with("run-"));
    }

    #[test]
    fn test_complete_and_fail() {
        let mut run = Run::new(["a", "b"]);
        run.complete("a", "out");
        run.fail("b", NodeStatus::Interrupted, "Upstream node 'x' did not complete");

        assert_eq!(run.result("a"), Some("out"));
        assert_eq!(run.status("b"), Some(NodeStatus::Interrupted));
        assert!(run.status("b").unwrap().is_failure());
        assert_eq!(run.nodes_with(NodeStatus::Completed), vec!["a"]);
    }

    #[test]
    fn test_reset_keeps_accumulators() {
        let mut run = Run::new(["acc"]);
        run.complete("acc", "1");
        run.set_accumulator("acc", "1");
        run.reset(&["acc".to_string()]);

        assert_eq!(run.status("acc"), Some(NodeStatus::Pending));
        assert_eq!(run.result("acc"), None);
        assert_eq!(run.accumulator("acc"), Some("1"));
    }

    #[test]
    fn test_scope_frames_shadow_and_drop() {
        let mut scope = VariableScope::new();
        scope.set("name", "root");
        scope.push_frame();
        scope.set("name", "inner");
        scope.set_root("total", "3");
        assert_eq!(scope.get("name"), Some("inner"));
        assert_eq!(scope.snapshot()["name"], "inner");

        scope.pop_frame();
        assert_eq!(scope.get("name"), Some("root"));
        assert_eq!(scope.get("total"), Some("3"));
        scope.pop_frame();
        assert_eq!(scope.depth(), 1);
    }
}
