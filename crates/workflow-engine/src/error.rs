//! Error types for the workflow engine

use thiserror::Error;

use crate::composer::CompositionError;
use crate::validation::ValidationError;

/// Result type alias using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Message recorded on a gated node the user declined.
pub const REJECTED_BY_USER: &str = "Command execution rejected by user";

/// Errors that can occur in the workflow engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// One or more nodes failed pre-run validation
    #[error("Validation failed with {} error(s)", .0.len())]
    Validation(Vec<ValidationError>),

    /// The external step executor failed or returned a failure
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// The user declined a gated step
    #[error("Command execution rejected by user")]
    ApprovalRejected { node_id: String },

    /// A node exceeded its configured duration
    #[error("Node execution timed out after {timeout_ms} ms")]
    Timeout { node_id: String, timeout_ms: u64 },

    /// Invalid selection or definition for sub-graph composition
    #[error(transparent)]
    Composition(#[from] CompositionError),

    /// A run is already active
    #[error("A workflow run is already in progress")]
    RunInProgress,

    /// No run is active
    #[error("No workflow run is active")]
    NoActiveRun,

    /// Node lookup failed
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// A node with this ID already exists
    #[error("Duplicate node ID: {0}")]
    DuplicateNode(String),

    /// Subflow definition lookup failed
    #[error("Subflow definition not found: {0}")]
    SubflowNotFound(String),

    /// No tokenizer collaborator is configured
    #[error("No token counter configured")]
    NoTokenCounter,

    /// Run was aborted
    #[error("Workflow cancelled")]
    Cancelled,

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Compression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Create an execution failed error with a message
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::ExecutionFailed(msg.into())
    }

    /// Whether this error was produced by a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
