//! Edit history over compressed graph snapshots
//!
//! Every edit pushes the canonical snapshot of the graph (nodes and edges
//! sorted by ID), zstd-compressed. A push whose canonical form equals the
//! current entry is dropped, so re-saving an unchanged graph or reordering
//! its node list does not grow the history.

use std::collections::VecDeque;

use crate::error::{EngineError, Result};
use crate::types::WorkflowGraph;

const COMPRESSION_LEVEL: i32 = 3;

/// Bounded undo/redo history of a workflow graph
pub struct UndoStack {
    snapshots: VecDeque<Vec<u8>>,
    current: usize,
    max_snapshots: usize,
}

impl UndoStack {
    /// Create a history keeping at most `max_snapshots` entries
    pub fn new(max_snapshots: usize) -> Self {
        Self {
            snapshots: VecDeque::new(),
            current: 0,
            max_snapshots: max_snapshots.max(1),
        }
    }

    /// Record the graph as the newest entry
    ///
    /// Drops any redo entries. Returns false when the graph is identical to
    /// the current entry and nothing was recorded.
    pub fn push(&mut self, graph: &WorkflowGraph) -> Result<bool> {
        let snapshot = graph.snapshot()?;
        if let Some(current) = self.snapshots.get(self.current) {
            if decode(current)? == snapshot {
                return Ok(false);
            }
        }

        let compressed = zstd::encode_all(&snapshot[..], COMPRESSION_LEVEL)
            .map_err(|e| EngineError::Compression(e.to_string()))?;

        if !self.snapshots.is_empty() {
            self.snapshots.truncate(self.current + 1);
        }
        self.snapshots.push_back(compressed);
        self.current = self.snapshots.len() - 1;

        while self.snapshots.len() > self.max_snapshots {
            self.snapshots.pop_front();
            self.current = self.current.saturating_sub(1);
        }
        Ok(true)
    }

    /// Step back; `None` at the oldest entry
    pub fn undo(&mut self) -> Option<Result<WorkflowGraph>> {
        if !self.can_undo() {
            return None;
        }
        self.current -= 1;
        Some(self.restore(self.current))
    }

    /// Step forward; `None` at the newest entry
    pub fn redo(&mut self) -> Option<Result<WorkflowGraph>> {
        if !self.can_redo() {
            return None;
        }
        self.current += 1;
        Some(self.restore(self.current))
    }

    /// The graph at the current position
    pub fn current(&self) -> Option<Result<WorkflowGraph>> {
        if self.snapshots.is_empty() {
            None
        } else {
            Some(self.restore(self.current))
        }
    }

    pub fn can_undo(&self) -> bool {
        self.current > 0
    }

    pub fn can_redo(&self) -> bool {
        self.current + 1 < self.snapshots.len()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
        self.current = 0;
    }

    /// Total compressed size of the history in bytes
    pub fn compressed_size(&self) -> usize {
        self.snapshots.iter().map(Vec::len).sum()
    }

    fn restore(&self, index: usize) -> Result<WorkflowGraph> {
        let json = decode(&self.snapshots[index])?;
        Ok(serde_json::from_slice(&json)?)
    }
}

impl Default for UndoStack {
    fn default() -> Self {
        Self::new(100)
    }
}

fn decode(compressed: &[u8]) -> Result<Vec<u8>> {
    zstd::decode_all(compressed).map_err(|e| EngineError::Compression(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::WorkflowBuilder;

    fn graph_with(content: &str) -> WorkflowGraph {
        WorkflowBuilder::new()
            .add_text("note", content)
            .add_preview("show")
            .connect("note", "show")
            .build()
    }

    fn content_of(graph: &WorkflowGraph) -> String {
        graph.find_node("note").unwrap().kind.template().unwrap().to_string()
    }

    #[test]
    fn test_push_undo_redo() {
        let mut stack = UndoStack::new(10);
        stack.push(&graph_with("first")).unwrap();
        stack.push(&graph_with("second")).unwrap();
        stack.push(&graph_with("third")).unwrap();

        assert_eq!(content_of(&stack.current().unwrap().unwrap()), "third");
        assert_eq!(content_of(&stack.undo().unwrap().unwrap()), "second");
        assert_eq!(content_of(&stack.undo().unwrap().unwrap()), "first");
        assert!(stack.undo().is_none());

        assert_eq!(content_of(&stack.redo().unwrap().unwrap()), "second");
        assert!(stack.can_redo());
    }

    #[test]
    fn test_identical_push_is_skipped() {
        let mut stack = UndoStack::new(10);
        let graph = graph_with("same");
        assert!(stack.push(&graph).unwrap());

        let mut reordered = graph.clone();
        reordered.nodes.reverse();
        assert!(!stack.push(&reordered).unwrap());
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn test_push_after_undo_drops_redo() {
        let mut stack = UndoStack::new(10);
        stack.push(&graph_with("first")).unwrap();
        stack.push(&graph_with("second")).unwrap();
        stack.undo();

        stack.push(&graph_with("third")).unwrap();

        assert!(!stack.can_redo());
        assert_eq!(stack.len(), 2);
        assert_eq!(content_of(&stack.current().unwrap().unwrap()), "third");
    }

    #[test]
    fn test_history_is_bounded() {
        let mut stack = UndoStack::new(3);
        for i in 0..5 {
            stack.push(&graph_with(&format!("edit {}", i))).unwrap();
        }

        assert_eq!(stack.len(), 3);
        assert_eq!(content_of(&stack.current().unwrap().unwrap()), "edit 4");
        stack.undo();
        stack.undo();
        assert!(!stack.can_undo());
        assert!(stack.compressed_size() > 0);
    }
}
