//! Host-facing engine facade
//!
//! `WorkflowEngine` is what a host talks to: it validates and expands a
//! graph, starts a coordinator for it, forwards approvals and aborts, and
//! archives results back into the graph once the run is over. Only one run
//! is active at a time.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::composer::expand_subflows;
use crate::config::EngineConfig;
use crate::coordinator::{join_run, Coordinator, RunHandle};
use crate::error::{EngineError, Result};
use crate::events::{EventSink, WorkflowEvent};
use crate::executor::StepExecutor;
use crate::planner::plan_graph;
use crate::run::Run;
use crate::subflow::{SubflowDefinition, SubflowMetadata, SubflowRepository, SubflowStore};
use crate::types::{GraphEdge, GraphNode, SubflowId, WorkflowGraph};
use crate::validation::{validate_workflow, ValidationError};

/// Tokenizer collaborator used by `calculate_tokens`
#[async_trait]
pub trait TokenCounter: Send + Sync {
    async fn count_tokens(&self, text: &str) -> Result<usize>;
}

/// Messages a host sends to the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostMessage {
    #[serde(rename_all = "camelCase")]
    ExecuteWorkflow {
        nodes: Vec<GraphNode>,
        edges: Vec<GraphEdge>,
    },
    AbortWorkflow,
    #[serde(rename_all = "camelCase")]
    NodeApproved {
        node_id: String,
        #[serde(default)]
        modified_command: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    NodeRejected { node_id: String },
    #[serde(rename_all = "camelCase")]
    CalculateTokens { text: String, node_id: String },
    #[serde(rename_all = "camelCase")]
    CreateSubflow { definition: SubflowDefinition },
    #[serde(rename_all = "camelCase")]
    GetSubflow { id: SubflowId },
}

/// Synchronous answer to a [`HostMessage`]
///
/// Run progress is reported separately through the event sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostReply {
    #[serde(rename_all = "camelCase")]
    RunStarted { run_id: String },
    Accepted,
    #[serde(rename_all = "camelCase")]
    TokenCount { count: usize },
    #[serde(rename_all = "camelCase")]
    SubflowCreated { id: SubflowId },
    #[serde(rename_all = "camelCase")]
    Subflow {
        definition: Option<SubflowDefinition>,
    },
}

/// A finished run together with the graph it ran on
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run: Run,
    /// The submitted graph with node results archived
    pub graph: WorkflowGraph,
}

struct ActiveRun {
    handle: RunHandle,
    graph: WorkflowGraph,
}

/// Entry point for hosts
pub struct WorkflowEngine {
    executor: Arc<dyn StepExecutor>,
    events: Arc<dyn EventSink>,
    config: EngineConfig,
    subflows: RwLock<Box<dyn SubflowRepository>>,
    token_counter: Option<Arc<dyn TokenCounter>>,
    active: Mutex<Option<ActiveRun>>,
}

impl WorkflowEngine {
    /// Create an engine with default configuration and an in-memory
    /// subflow store
    pub fn new(executor: Arc<dyn StepExecutor>, events: Arc<dyn EventSink>) -> Self {
        Self {
            executor,
            events,
            config: EngineConfig::default(),
            subflows: RwLock::new(Box::new(SubflowStore::new())),
            token_counter: None,
            active: Mutex::new(None),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_subflow_repository(mut self, repository: impl SubflowRepository + 'static) -> Self {
        self.subflows = RwLock::new(Box::new(repository));
        self
    }

    pub fn with_token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.token_counter = Some(counter);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate, expand and start a run; returns the run ID
    ///
    /// Nothing is dispatched when validation fails: the errors are reported
    /// through a `ValidationFailed` event and returned.
    pub async fn execute(&self, graph: WorkflowGraph) -> Result<String> {
        let mut active = self.active.lock().await;
        if active.as_ref().map_or(false, |a| !a.handle.is_finished()) {
            return Err(EngineError::RunInProgress);
        }

        let subflows = self.subflows.read().await;
        let repository: &dyn SubflowRepository = &**subflows;

        self.check(validate_workflow(&graph, Some(repository)))?;
        let expansion = expand_subflows(&graph, Some(repository), self.config.max_subflow_depth)?;
        if !expansion.wrappers.is_empty() {
            self.check(validate_workflow(&expansion.graph, Some(repository)))?;
        }
        let plan = plan_graph(&expansion.graph).map_err(|e| self.invalid(vec![e]))?;
        drop(subflows);

        let handle = Coordinator::start(
            expansion,
            plan,
            Arc::clone(&self.executor),
            Arc::clone(&self.events),
            self.config.clone(),
        );
        let run_id = handle.run_id().to_string();
        *active = Some(ActiveRun { handle, graph });
        Ok(run_id)
    }

    fn check(&self, errors: Vec<ValidationError>) -> Result<()> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(self.invalid(errors))
        }
    }

    fn invalid(&self, errors: Vec<ValidationError>) -> EngineError {
        log::warn!("Workflow rejected with {} validation error(s)", errors.len());
        for error in &errors {
            log::debug!("  {}", error);
        }
        if let Err(e) = self.events.send(WorkflowEvent::validation_failed(&errors)) {
            log::debug!("Event sink rejected event: {}", e);
        }
        EngineError::Validation(errors)
    }

    async fn with_active<T>(&self, f: impl FnOnce(&RunHandle) -> Result<T>) -> Result<T> {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(run) if !run.handle.is_finished() => f(&run.handle),
            _ => Err(EngineError::NoActiveRun),
        }
    }

    /// Whether a run is in progress
    pub async fn is_running(&self) -> bool {
        self.with_active(|_| Ok(())).await.is_ok()
    }

    /// Cancel the active run
    ///
    /// The abort is queued for the run; until it has been applied the run
    /// still counts as active and `execute` returns `RunInProgress`.
    pub async fn abort(&self) -> Result<()> {
        self.with_active(|h| h.abort("Aborted by user")).await
    }

    /// Approve a gated node, optionally replacing its command
    pub async fn approve(&self, node_id: &str, modified_command: Option<String>) -> Result<()> {
        self.with_active(|h| h.approve(node_id, modified_command)).await
    }

    /// Decline a gated node
    pub async fn reject(&self, node_id: &str) -> Result<()> {
        self.with_active(|h| h.reject(node_id)).await
    }

    /// Wait for the latest run to finish
    ///
    /// Results are archived into the `result` field of the submitted
    /// graph's nodes.
    pub async fn wait(&self) -> Result<RunOutcome> {
        let (task, mut graph) = {
            let mut active = self.active.lock().await;
            let current = active.as_mut().ok_or(EngineError::NoActiveRun)?;
            let task = current.handle.take_task().ok_or(EngineError::NoActiveRun)?;
            (task, current.graph.clone())
        };

        let run = join_run(task).await?;
        for node in &mut graph.nodes {
            if let Some(result) = run.result(&node.id) {
                node.result = Some(result.to_string());
            }
        }
        Ok(RunOutcome { run, graph })
    }

    /// Count tokens through the configured tokenizer
    pub async fn calculate_tokens(&self, text: &str, node_id: &str) -> Result<usize> {
        let counter = self
            .token_counter
            .as_ref()
            .ok_or(EngineError::NoTokenCounter)?;
        let count = counter.count_tokens(text).await?;
        if let Err(e) = self.events.send(WorkflowEvent::TokenCount {
            node_id: node_id.to_string(),
            count,
        }) {
            log::debug!("Event sink rejected event: {}", e);
        }
        Ok(count)
    }

    pub async fn create_subflow(&self, definition: SubflowDefinition) -> Result<SubflowId> {
        self.subflows.write().await.create_subflow(definition)
    }

    pub async fn get_subflow(&self, id: &str) -> Option<SubflowDefinition> {
        self.subflows.read().await.get_subflow(id)
    }

    pub async fn list_subflows(&self) -> Vec<SubflowMetadata> {
        self.subflows.read().await.list()
    }

    /// Dispatch a host message
    pub async fn handle(&self, message: HostMessage) -> Result<HostReply> {
        match message {
            HostMessage::ExecuteWorkflow { nodes, edges } => {
                let mut graph = WorkflowGraph::new();
                graph.nodes = nodes;
                graph.edges = edges;
                let run_id = self.execute(graph).await?;
                Ok(HostReply::RunStarted { run_id })
            }
            HostMessage::AbortWorkflow => {
                self.abort().await?;
                Ok(HostReply::Accepted)
            }
            HostMessage::NodeApproved {
                node_id,
                modified_command,
            } => {
                self.approve(&node_id, modified_command).await?;
                Ok(HostReply::Accepted)
            }
            HostMessage::NodeRejected { node_id } => {
                self.reject(&node_id).await?;
                Ok(HostReply::Accepted)
            }
            HostMessage::CalculateTokens { text, node_id } => {
                let count = self.calculate_tokens(&text, &node_id).await?;
                Ok(HostReply::TokenCount { count })
            }
            HostMessage::CreateSubflow { definition } => {
                let id = self.create_subflow(definition).await?;
                Ok(HostReply::SubflowCreated { id })
            }
            HostMessage::GetSubflow { id } => Ok(HostReply::Subflow {
                definition: self.get_subflow(&id).await,
            }),
        }
    }
}
