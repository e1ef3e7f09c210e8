//! Event types for streaming run progress
//!
//! Events are sent from the engine to the host (or any consumer) to report
//! run lifecycle, per-node status changes and intermediate progress.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::run::NodeStatus;
use crate::validation::ValidationError;

/// Trait for sending workflow events
///
/// This abstracts over the transport mechanism (host channel, mpsc, ...)
/// so the engine runs the same headless and embedded.
pub trait EventSink: Send + Sync {
    /// Send an event
    ///
    /// Returns an error if the event could not be sent (e.g., channel closed)
    fn send(&self, event: WorkflowEvent) -> Result<(), EventError>;
}

/// Error when sending events fails
#[derive(Debug, Clone)]
pub struct EventError {
    pub message: String,
}

impl std::fmt::Display for EventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Event error: {}", self.message)
    }
}

impl std::error::Error for EventError {}

impl EventError {
    pub fn channel_closed() -> Self {
        Self {
            message: "Channel closed".to_string(),
        }
    }
}

/// Events emitted during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkflowEvent {
    /// A run was accepted and is about to dispatch its first step
    #[serde(rename_all = "camelCase")]
    ExecutionStarted { run_id: String, node_count: usize },

    /// A planned step started
    #[serde(rename_all = "camelCase")]
    StepStarted {
        run_id: String,
        index: usize,
        nodes: Vec<String>,
    },

    /// A node changed status
    #[serde(rename_all = "camelCase")]
    NodeExecutionStatus {
        run_id: String,
        node_id: String,
        status: NodeStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Intermediate status streamed by a step executor
    #[serde(rename_all = "camelCase")]
    NodeProgress {
        run_id: String,
        node_id: String,
        message: String,
    },

    /// A loop region started an iteration (zero-based)
    #[serde(rename_all = "camelCase")]
    LoopIteration {
        run_id: String,
        loop_id: String,
        iteration: u32,
        total: u32,
    },

    /// An IfElse node selected a branch
    #[serde(rename_all = "camelCase")]
    BranchSelected {
        run_id: String,
        node_id: String,
        branch: bool,
    },

    /// Pre-run validation failed; no run was started
    #[serde(rename_all = "camelCase")]
    ValidationFailed { errors: Vec<ValidationReport> },

    /// Every reachable node resolved
    #[serde(rename_all = "camelCase")]
    ExecutionCompleted { run_id: String },

    /// The run was aborted
    #[serde(rename_all = "camelCase")]
    ExecutionAborted { run_id: String, reason: String },

    /// Result of a token count request
    #[serde(rename_all = "camelCase")]
    TokenCount { node_id: String, count: usize },
}

/// A validation error as reported to hosts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub message: String,
}

impl From<&ValidationError> for ValidationReport {
    fn from(err: &ValidationError) -> Self {
        Self {
            node_id: err.node_id().map(str::to_string),
            message: err.to_string(),
        }
    }
}

impl WorkflowEvent {
    /// Create a node status event
    pub fn node_status(run_id: &str, node_id: &str, status: NodeStatus) -> Self {
        Self::NodeExecutionStatus {
            run_id: run_id.to_string(),
            node_id: node_id.to_string(),
            status,
            result: None,
            error: None,
        }
    }

    /// Create a validation failure event
    pub fn validation_failed(errors: &[ValidationError]) -> Self {
        Self::ValidationFailed {
            errors: errors.iter().map(ValidationReport::from).collect(),
        }
    }

    /// The node this event is about, if any
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::NodeExecutionStatus { node_id, .. }
            | Self::NodeProgress { node_id, .. }
            | Self::BranchSelected { node_id, .. }
            | Self::TokenCount { node_id, .. } => Some(node_id),
            _ => None,
        }
    }
}

/// A no-op event sink that discards all events
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn send(&self, _event: WorkflowEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// A vector-based event sink that collects events
///
/// Useful for testing to verify events were emitted correctly.
#[derive(Default)]
pub struct VecEventSink {
    events: Mutex<Vec<WorkflowEvent>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all collected events
    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Statuses reported for one node, in order
    pub fn statuses_of(&self, node_id: &str) -> Vec<NodeStatus> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                WorkflowEvent::NodeExecutionStatus {
                    node_id: id, status, ..
                } if id == node_id => Some(status),
                _ => None,
            })
            .collect()
    }

    /// Clear all collected events
    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

impl EventSink for VecEventSink {
    fn send(&self, event: WorkflowEvent) -> Result<(), EventError> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
        Ok(())
    }
}

/// Forwards events into a tokio unbounded channel
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<WorkflowEvent>,
}

impl ChannelEventSink {
    pub fn new(tx: mpsc::UnboundedSender<WorkflowEvent>) -> Self {
        Self { tx }
    }

    /// Create a sink together with its receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WorkflowEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn send(&self, event: WorkflowEvent) -> Result<(), EventError> {
        self.tx.send(event).map_err(|_| EventError::channel_closed())
    }
}
