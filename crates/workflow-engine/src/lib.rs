//! Workflow Engine - graph workflows of shell, agent and built-in steps
//!
//! This crate turns a graph of heterogeneous work units into a deterministic
//! execution order and drives runs of it. It supports:
//!
//! - Positional multi-input addressing (`${1}`, `${2}`, ...) by edge ordinal
//! - Inactive-node propagation and bypass with archived results
//! - Bounded loops, conditional branches and variable scoping
//! - Extracting a selection into a reusable subflow and inlining it back
//! - Approval gating, per-node timeouts, abort and parallel steps
//! - Compressed snapshot-based undo/redo
//!
//! # Architecture
//!
//! - `planner`: graph to ordered steps, loop regions and branch partitions
//! - `composer`: subflow extraction, inlining and expansion for execution
//! - `coordinator`: the per-run state machine fed by a single event entry
//!   point
//! - `engine`: the host facade enforcing one active run
//! - `StepExecutor`: host-provided runtime for Shell and Agent nodes
//!
//! # Example
//!
//! ```ignore
//! use workflow_engine::{WorkflowBuilder, WorkflowEngine, NullEventSink};
//!
//! let graph = WorkflowBuilder::new()
//!     .add_shell("diff", "git diff")
//!     .add_agent("summary", "Summarize: ${1}")
//!     .connect("diff", "summary")
//!     .build();
//!
//! let engine = WorkflowEngine::new(executor, Arc::new(NullEventSink));
//! engine.execute(graph).await?;
//! let outcome = engine.wait().await?;
//! ```

pub mod activity;
pub mod builder;
pub mod composer;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod ordering;
pub mod planner;
pub mod run;
pub mod subflow;
pub mod types;
pub mod undo;
pub mod validation;

#[cfg(test)]
mod test_support;

// Re-export key types
pub use builder::WorkflowBuilder;
pub use composer::{extract, inline, inline_wrapper, persist_pending, CompositionError, Extraction};
pub use config::EngineConfig;
pub use coordinator::{Coordinator, RunEvent, RunHandle};
pub use engine::{HostMessage, HostReply, RunOutcome, TokenCounter, WorkflowEngine};
pub use error::{EngineError, Result};
pub use events::{ChannelEventSink, EventSink, NullEventSink, VecEventSink, WorkflowEvent};
pub use executor::{StepContext, StepExecutor, StepRequest};
pub use planner::{plan_graph, ExecutionPlan, Step, StepMode};
pub use run::{NodeStatus, Run, RunState};
pub use subflow::{SubflowDefinition, SubflowRepository, SubflowStore};
pub use types::{GraphEdge, GraphNode, NodeId, NodeKind, WorkflowDocument, WorkflowGraph};
pub use undo::UndoStack;
pub use validation::{validate_workflow, ValidationError};
