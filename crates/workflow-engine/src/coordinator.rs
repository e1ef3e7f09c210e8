//! Run coordination
//!
//! A [`Coordinator`] walks an [`ExecutionPlan`] one step at a time. Built-in
//! nodes are evaluated inline; Shell and Agent nodes are spawned onto the
//! runtime and report back through a channel. Everything that changes the
//! run, from executor results to approvals and aborts, arrives as a
//! [`RunEvent`] and goes through [`Coordinator::apply`], so the run state
//! has a single owner and needs no locking.
//!
//! Loop regions are replayed by resetting their members and rewinding the
//! step cursor. Every dispatch carries a generation number; results from a
//! superseded or aborted dispatch are dropped.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};

use crate::composer::{ExpandedWrapper, Expansion};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result, REJECTED_BY_USER};
use crate::events::{EventSink, WorkflowEvent};
use crate::executor::{evaluate_builtin, StepContext, StepExecutor, StepRequest};
use crate::ordering::{render_template, EdgeOrdinals};
use crate::planner::{is_loop_back_edge, ExecutionPlan};
use crate::run::{NodeStatus, Run, RunState};
use crate::types::{EdgeId, GraphNode, NodeId, NodeKind, WorkflowGraph};

/// Message recorded on a bypassed node with nothing to reuse
const NO_PREVIOUS_RESULT: &str = "Bypassed node has no previous result";

/// Message recorded on nodes cut off by an abort
const RUN_ABORTED: &str = "Run aborted";

/// Everything that can change a running workflow
#[derive(Debug)]
pub enum RunEvent {
    /// An external step returned
    Finished {
        node_id: NodeId,
        generation: u64,
        result: Result<String>,
    },
    /// An external step exceeded its timeout
    TimedOut {
        node_id: NodeId,
        generation: u64,
        timeout_ms: u64,
    },
    /// A gated node was approved, optionally with an edited command
    Approved {
        node_id: NodeId,
        command: Option<String>,
    },
    /// A gated node was declined
    Rejected { node_id: NodeId },
    /// Stop the run
    Abort { reason: String },
}

struct InFlight {
    generation: u64,
    task: AbortHandle,
}

/// Progress through a loop region
#[derive(Debug, Clone, Copy)]
struct LoopFrame {
    region: usize,
    iteration: u32,
    total: u32,
}

enum StepOutcome {
    Finished(Result<String>),
    TimedOut(u64),
}

/// Drives one run from the first step to completion or abort
pub struct Coordinator {
    run: Run,
    graph: WorkflowGraph,
    plan: ExecutionPlan,
    ordinals: EdgeOrdinals,
    back_edges: HashSet<EdgeId>,
    wrappers: Vec<ExpandedWrapper>,
    config: EngineConfig,
    executor: Arc<dyn StepExecutor>,
    events: Arc<dyn EventSink>,
    semaphore: Arc<Semaphore>,
    tx: mpsc::UnboundedSender<RunEvent>,
    step: usize,
    step_started: bool,
    frame: Option<LoopFrame>,
    in_flight: HashMap<NodeId, InFlight>,
    awaiting_approval: HashMap<NodeId, StepRequest>,
    next_generation: u64,
}

impl Coordinator {
    fn new(
        expansion: Expansion,
        plan: ExecutionPlan,
        executor: Arc<dyn StepExecutor>,
        events: Arc<dyn EventSink>,
        config: EngineConfig,
        tx: mpsc::UnboundedSender<RunEvent>,
    ) -> Self {
        let Expansion { graph, wrappers } = expansion;
        let ordinals = EdgeOrdinals::compute(&graph.edges);
        let back_edges = graph
            .edges
            .iter()
            .filter(|e| is_loop_back_edge(&graph, e))
            .map(|e| e.id.clone())
            .collect();
        let run = Run::new(plan.node_ids().cloned());
        let semaphore = Arc::new(Semaphore::new(config.max_parallel_nodes.max(1)));

        Self {
            run,
            graph,
            plan,
            ordinals,
            back_edges,
            wrappers,
            config,
            executor,
            events,
            semaphore,
            tx,
            step: 0,
            step_started: false,
            frame: None,
            in_flight: HashMap::new(),
            awaiting_approval: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Spawn a coordinator for an expanded, validated graph
    pub fn start(
        expansion: Expansion,
        plan: ExecutionPlan,
        executor: Arc<dyn StepExecutor>,
        events: Arc<dyn EventSink>,
        config: EngineConfig,
    ) -> RunHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Self::new(expansion, plan, executor, events, config, tx.clone());
        let run_id = coordinator.run.id.clone();
        let task = tokio::spawn(coordinator.drive(rx));
        RunHandle {
            run_id,
            tx,
            task: Some(task),
        }
    }

    async fn drive(mut self, mut rx: mpsc::UnboundedReceiver<RunEvent>) -> Run {
        self.begin();
        while self.run.state == RunState::Running {
            match rx.recv().await {
                Some(event) => self.apply(event),
                None => break,
            }
        }
        self.settle_wrappers();
        self.run
    }

    fn begin(&mut self) {
        self.run.state = RunState::Running;
        log::info!(
            "Starting run '{}': {} nodes in {} steps",
            self.run.id,
            self.run.statuses().len(),
            self.plan.steps.len()
        );
        self.emit(WorkflowEvent::ExecutionStarted {
            run_id: self.run.id.clone(),
            node_count: self.run.statuses().len(),
        });
        self.advance();
    }

    /// Apply one external event to the run
    pub fn apply(&mut self, event: RunEvent) {
        if self.run.state != RunState::Running {
            log::debug!("Ignoring {:?} for finished run '{}'", event, self.run.id);
            return;
        }

        match event {
            RunEvent::Finished {
                node_id,
                generation,
                result,
            } => {
                if !self.take_in_flight(&node_id, generation) {
                    return;
                }
                match result {
                    Ok(value) => self.complete_node(&node_id, value),
                    Err(e) => self.fail_node(&node_id, error_message(&e)),
                }
            }
            RunEvent::TimedOut {
                node_id,
                generation,
                timeout_ms,
            } => {
                if !self.take_in_flight(&node_id, generation) {
                    return;
                }
                let err = EngineError::Timeout {
                    node_id: node_id.clone(),
                    timeout_ms,
                };
                self.fail_node(&node_id, err.to_string());
            }
            RunEvent::Approved { node_id, command } => {
                let Some(mut request) = self.awaiting_approval.remove(&node_id) else {
                    log::warn!("Node '{}' is not awaiting approval", node_id);
                    return;
                };
                if let Some(command) = command {
                    if let NodeKind::Shell(config) = &mut request.kind {
                        config.command = command.clone();
                    }
                    request.text = command;
                }
                log::info!("Node '{}' approved", node_id);
                self.dispatch(request);
            }
            RunEvent::Rejected { node_id } => {
                if self.awaiting_approval.remove(&node_id).is_none() {
                    log::warn!("Node '{}' is not awaiting approval", node_id);
                    return;
                }
                log::info!("Node '{}' rejected", node_id);
                self.fail_node(&node_id, REJECTED_BY_USER.to_string());
            }
            RunEvent::Abort { reason } => {
                self.abort(reason);
                return;
            }
        }

        self.advance();
    }

    /// Move through steps until one has to wait on outside events
    fn advance(&mut self) {
        while self.run.state == RunState::Running {
            if self.step >= self.plan.steps.len() {
                self.complete_run();
                return;
            }
            if !self.step_started {
                if !self.enter_loop() {
                    continue;
                }
                self.step_started = true;
                self.start_step();
                continue;
            }
            if !self.step_settled() {
                return;
            }
            self.step_started = false;
            self.finish_step();
        }
    }

    /// Open a loop region starting at the current step
    ///
    /// Returns false when the region was skipped and the cursor moved past
    /// it.
    fn enter_loop(&mut self) -> bool {
        let Some(region_index) = self
            .plan
            .loops
            .iter()
            .position(|l| l.steps.start == self.step)
        else {
            return true;
        };
        if self.frame.map_or(false, |f| f.region == region_index) {
            return true;
        }

        let total = self.iteration_count(region_index);
        if total == 0 {
            let region = &self.plan.loops[region_index];
            let members = region.members.clone();
            self.step = region.steps.end;
            log::debug!("Loop '{}' has no iterations, skipping", region.start);
            for member in &members {
                self.skip_node(member);
            }
            return false;
        }

        self.frame = Some(LoopFrame {
            region: region_index,
            iteration: 0,
            total,
        });
        self.run.scope.push_frame();
        self.bind_iteration();
        true
    }

    /// Iteration count of a loop: override input, else configured, capped
    fn iteration_count(&self, region_index: usize) -> u32 {
        let start = &self.plan.loops[region_index].start;
        let configured = match self.graph.find_node(start).map(|n| &n.kind) {
            Some(NodeKind::LoopStart(config)) => config.iterations,
            _ => 1,
        };
        let overridden = self
            .graph
            .incoming_edges(start)
            .filter(|e| e.is_iterations_override())
            .find_map(|e| self.run.result(&e.source))
            .and_then(|value| match value.trim().parse::<u32>() {
                Ok(count) => Some(count),
                Err(_) => {
                    log::warn!(
                        "Loop '{}' ignores non-numeric iteration override '{}'",
                        start,
                        value.trim()
                    );
                    None
                }
            });

        let count = overridden.unwrap_or(configured);
        if count > self.config.max_loop_iterations {
            log::warn!(
                "Loop '{}' capped at {} iterations (requested {})",
                start,
                self.config.max_loop_iterations,
                count
            );
            self.config.max_loop_iterations
        } else {
            count
        }
    }

    fn bind_iteration(&mut self) {
        let Some(frame) = self.frame else {
            return;
        };
        let start = self.plan.loops[frame.region].start.clone();
        if let Some(NodeKind::LoopStart(config)) = self.graph.find_node(&start).map(|n| &n.kind) {
            if !config.loop_variable.is_empty() {
                self.run
                    .scope
                    .set(config.loop_variable.clone(), frame.iteration.to_string());
            }
        }
        self.emit(WorkflowEvent::LoopIteration {
            run_id: self.run.id.clone(),
            loop_id: start,
            iteration: frame.iteration,
            total: frame.total,
        });
    }

    fn start_step(&mut self) {
        let nodes = self.plan.steps[self.step].nodes.clone();
        log::debug!(
            "{} started: {:?}",
            self.plan.step_label(self.step).unwrap_or_default(),
            nodes
        );
        self.emit(WorkflowEvent::StepStarted {
            run_id: self.run.id.clone(),
            index: self.step,
            nodes: nodes.clone(),
        });
        for node_id in &nodes {
            if self.run.state != RunState::Running {
                return;
            }
            self.start_node(node_id);
        }
    }

    fn step_settled(&self) -> bool {
        self.plan.steps[self.step]
            .nodes
            .iter()
            .all(|id| self.run.status(id).map_or(true, NodeStatus::is_terminal))
    }

    fn finish_step(&mut self) {
        let finished = self.step;
        self.step += 1;

        let Some(frame) = self.frame else {
            return;
        };
        let region = &self.plan.loops[frame.region];
        if finished + 1 != region.steps.end {
            return;
        }

        let failed = region
            .members
            .iter()
            .any(|m| self.run.status(m).map_or(false, NodeStatus::is_failure));
        if !failed && frame.iteration + 1 < frame.total {
            let members = region.members.clone();
            self.step = region.steps.start;
            self.run.reset(&members);
            self.run.scope.pop_frame();
            self.run.scope.push_frame();
            self.frame = Some(LoopFrame {
                iteration: frame.iteration + 1,
                ..frame
            });
            self.bind_iteration();
        } else {
            log::debug!(
                "Loop '{}' finished after {} of {} iterations",
                region.start,
                frame.iteration + 1,
                frame.total
            );
            self.frame = None;
            self.run.scope.pop_frame();
        }
    }

    fn start_node(&mut self, node_id: &str) {
        if self.run.status(node_id) != Some(NodeStatus::Pending) {
            return;
        }
        let Some(node) = self.graph.find_node(node_id).cloned() else {
            return;
        };

        if node.bypass {
            match node.result {
                Some(result) => {
                    log::debug!("Node '{}' bypassed", node_id);
                    self.complete_node(node_id, result);
                }
                None => self.fail_node(node_id, NO_PREVIOUS_RESULT.to_string()),
            }
            return;
        }

        let inputs = match self.collect_inputs(&node) {
            Ok(inputs) => inputs,
            Err(upstream) => {
                self.interrupt(node_id, &upstream);
                return;
            }
        };
        let variables = self.run.scope.snapshot();

        if node.kind.is_external() {
            self.prepare_external(node, inputs, variables);
            return;
        }

        let accumulated = self.run.accumulator(node_id).map(str::to_string);
        match evaluate_builtin(&node.kind, &inputs, &variables, accumulated.as_deref()) {
            Ok(output) => {
                match &node.kind {
                    NodeKind::Variable(config) if !config.name.is_empty() => {
                        self.run.scope.set(config.name.clone(), output.value.clone());
                    }
                    NodeKind::Accumulator(config) => {
                        self.run.set_accumulator(node_id, output.value.clone());
                        if !config.name.is_empty() {
                            self.run
                                .scope
                                .set_root(config.name.clone(), output.value.clone());
                        }
                    }
                    _ => {}
                }
                self.complete_node(node_id, output.value);
                if let Some(condition) = output.condition {
                    self.select_branch(node_id, condition);
                }
            }
            Err(e) => self.fail_node(node_id, error_message(&e)),
        }
    }

    /// Upstream values ordered by edge ordinal
    ///
    /// Skipped upstream nodes contribute an empty string. Fails with the id
    /// of an upstream node that did not complete.
    fn collect_inputs(&self, node: &GraphNode) -> std::result::Result<Vec<String>, NodeId> {
        let data_only = matches!(node.kind, NodeKind::LoopStart(_));
        let mut inputs = Vec::new();

        for input in self.ordinals.inputs_of(&node.id) {
            let is_back_edge = self.back_edges.contains(&input.edge_id);
            if data_only {
                let is_override = self
                    .graph
                    .edges
                    .iter()
                    .any(|e| e.id == input.edge_id && e.is_iterations_override());
                if is_back_edge || is_override {
                    continue;
                }
            }
            if is_back_edge {
                inputs.push(String::new());
                continue;
            }

            let value = match self.run.status(&input.source) {
                Some(NodeStatus::Completed) => self
                    .run
                    .result(&input.source)
                    .unwrap_or_default()
                    .to_string(),
                Some(NodeStatus::Skipped) | None => String::new(),
                Some(_) => return Err(input.source.clone()),
            };
            inputs.push(value);
        }
        Ok(inputs)
    }

    fn prepare_external(
        &mut self,
        node: GraphNode,
        inputs: Vec<String>,
        variables: HashMap<String, String>,
    ) {
        let template = node.kind.template().unwrap_or_default();
        let request = StepRequest {
            run_id: self.run.id.clone(),
            node_id: node.id.clone(),
            text: render_template(template, &inputs, &variables),
            kind: node.kind,
            inputs,
            variables,
        };

        if request.kind.needs_user_approval() {
            log::info!("Node '{}' is waiting for approval", request.node_id);
            self.run
                .set_status(&request.node_id, NodeStatus::PendingApproval);
            self.emit_status(&request.node_id);
            self.awaiting_approval
                .insert(request.node_id.clone(), request);
        } else {
            self.dispatch(request);
        }
    }

    fn dispatch(&mut self, request: StepRequest) {
        let node_id = request.node_id.clone();
        let timeout = self
            .graph
            .find_node(&node_id)
            .and_then(|n| self.config.timeout_for(n.timeout_ms));
        self.next_generation += 1;
        let generation = self.next_generation;

        self.run.set_status(&node_id, NodeStatus::Running);
        self.emit_status(&node_id);

        let executor = Arc::clone(&self.executor);
        let semaphore = Arc::clone(&self.semaphore);
        let tx = self.tx.clone();
        let context = StepContext::new(self.run.id.clone(), node_id.clone(), Arc::clone(&self.events));
        let task_node = node_id.clone();

        let task = tokio::spawn(async move {
            let outcome = match semaphore.acquire_owned().await {
                Ok(_permit) => execute_step(executor, request, context, timeout).await,
                Err(_) => StepOutcome::Finished(Err(EngineError::Cancelled)),
            };
            let event = match outcome {
                StepOutcome::Finished(result) => RunEvent::Finished {
                    node_id: task_node,
                    generation,
                    result,
                },
                StepOutcome::TimedOut(timeout_ms) => RunEvent::TimedOut {
                    node_id: task_node,
                    generation,
                    timeout_ms,
                },
            };
            if tx.send(event).is_err() {
                log::debug!("Run finished before a step result arrived");
            }
        });

        self.in_flight.insert(
            node_id,
            InFlight {
                generation,
                task: task.abort_handle(),
            },
        );
    }

    fn take_in_flight(&mut self, node_id: &str, generation: u64) -> bool {
        match self.in_flight.get(node_id) {
            Some(flight) if flight.generation == generation => {
                self.in_flight.remove(node_id);
                true
            }
            _ => {
                log::debug!("Dropping stale result for node '{}'", node_id);
                false
            }
        }
    }

    fn complete_node(&mut self, node_id: &str, value: String) {
        self.run.complete(node_id, value);
        self.emit_status(node_id);
    }

    /// Record a failure, then abort or cut off the node's dependents
    fn fail_node(&mut self, node_id: &str, message: String) {
        log::warn!("Node '{}' failed: {}", node_id, message);
        self.run.fail(node_id, NodeStatus::Error, message.clone());
        self.emit_status(node_id);

        let abort_on_error = self
            .graph
            .find_node(node_id)
            .map_or(false, |n| n.abort_on_error);
        if abort_on_error {
            self.abort(format!("Node '{}' failed: {}", node_id, message));
            return;
        }

        for dependent in self.downstream_of(node_id) {
            if self.run.status(&dependent) == Some(NodeStatus::Pending) {
                self.interrupt(&dependent, node_id);
            }
        }
    }

    fn interrupt(&mut self, node_id: &str, upstream: &str) {
        self.run.fail(
            node_id,
            NodeStatus::Interrupted,
            format!("Upstream node '{}' did not complete", upstream),
        );
        self.emit_status(node_id);
    }

    fn skip_node(&mut self, node_id: &str) {
        if self.run.status(node_id) == Some(NodeStatus::Pending) {
            self.run.set_status(node_id, NodeStatus::Skipped);
            self.emit_status(node_id);
        }
    }

    /// Transitive dependents, not following loop back-edges
    fn downstream_of(&self, node_id: &str) -> BTreeSet<NodeId> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([node_id.to_string()]);
        while let Some(current) = queue.pop_front() {
            for edge in self.graph.outgoing_edges(&current) {
                if self.back_edges.contains(&edge.id) {
                    continue;
                }
                if seen.insert(edge.target.clone()) {
                    queue.push_back(edge.target.clone());
                }
            }
        }
        seen
    }

    fn select_branch(&mut self, node_id: &str, condition: bool) {
        log::debug!("IfElse '{}' selected the {} branch", node_id, condition);
        self.emit(WorkflowEvent::BranchSelected {
            run_id: self.run.id.clone(),
            node_id: node_id.to_string(),
            branch: condition,
        });
        let skipped: Vec<NodeId> = self
            .plan
            .branch(node_id)
            .map(|b| b.skipped_for(condition).iter().cloned().collect())
            .unwrap_or_default();
        for id in &skipped {
            self.skip_node(id);
        }
    }

    fn abort(&mut self, reason: String) {
        for (_, flight) in self.in_flight.drain() {
            flight.task.abort();
        }
        self.awaiting_approval.clear();

        let cut_off: Vec<NodeId> = self
            .run
            .statuses()
            .iter()
            .filter(|(_, s)| matches!(s, NodeStatus::Running | NodeStatus::PendingApproval))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &cut_off {
            self.run.fail(id, NodeStatus::Interrupted, RUN_ABORTED);
            self.emit_status(id);
        }

        log::info!("Run '{}' aborted: {}", self.run.id, reason);
        self.run.state = RunState::Aborted;
        self.emit(WorkflowEvent::ExecutionAborted {
            run_id: self.run.id.clone(),
            reason,
        });
    }

    fn complete_run(&mut self) {
        self.run.state = RunState::Completed;
        log::info!("Run '{}' completed", self.run.id);
        self.emit(WorkflowEvent::ExecutionCompleted {
            run_id: self.run.id.clone(),
        });
    }

    /// Derive wrapper statuses from their expanded nodes, innermost first
    fn settle_wrappers(&mut self) {
        let wrappers = std::mem::take(&mut self.wrappers);
        for wrapper in wrappers.iter().rev() {
            let statuses: Vec<NodeStatus> = wrapper
                .inner
                .iter()
                .filter_map(|id| self.run.status(id))
                .collect();
            if statuses.is_empty() {
                continue;
            }

            if statuses.iter().all(|s| *s == NodeStatus::Skipped) {
                self.run.set_status(&wrapper.wrapper_id, NodeStatus::Skipped);
            } else if statuses
                .iter()
                .all(|s| matches!(s, NodeStatus::Completed | NodeStatus::Skipped))
            {
                self.run.set_status(&wrapper.wrapper_id, NodeStatus::Completed);
            } else {
                let message = if statuses.contains(&NodeStatus::Error) {
                    "A node inside the subflow failed"
                } else {
                    "The subflow did not complete"
                };
                self.run.fail(&wrapper.wrapper_id, NodeStatus::Error, message);
            }
            self.emit_status(&wrapper.wrapper_id);
        }
    }

    fn emit(&self, event: WorkflowEvent) {
        if let Err(e) = self.events.send(event) {
            log::debug!("Event sink rejected event: {}", e);
        }
    }

    fn emit_status(&self, node_id: &str) {
        let Some(status) = self.run.status(node_id) else {
            return;
        };
        self.emit(WorkflowEvent::NodeExecutionStatus {
            run_id: self.run.id.clone(),
            node_id: node_id.to_string(),
            status,
            result: self.run.result(node_id).map(str::to_string),
            error: self.run.error(node_id).map(str::to_string),
        });
    }
}

async fn execute_step(
    executor: Arc<dyn StepExecutor>,
    request: StepRequest,
    context: StepContext,
    timeout: Option<Duration>,
) -> StepOutcome {
    let execution = executor.execute(request, context);
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, execution).await {
            Ok(result) => StepOutcome::Finished(result),
            Err(_) => StepOutcome::TimedOut(u64::try_from(limit.as_millis()).unwrap_or(u64::MAX)),
        },
        None => StepOutcome::Finished(execution.await),
    }
}

fn error_message(err: &EngineError) -> String {
    match err {
        EngineError::ExecutionFailed(message) => message.clone(),
        other => other.to_string(),
    }
}

/// Handle on a spawned run
pub struct RunHandle {
    run_id: String,
    tx: mpsc::UnboundedSender<RunEvent>,
    task: Option<JoinHandle<Run>>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Deliver an event to the coordinator
    pub fn send(&self, event: RunEvent) -> Result<()> {
        self.tx.send(event).map_err(|_| EngineError::NoActiveRun)
    }

    pub fn approve(&self, node_id: impl Into<String>, command: Option<String>) -> Result<()> {
        self.send(RunEvent::Approved {
            node_id: node_id.into(),
            command,
        })
    }

    pub fn reject(&self, node_id: impl Into<String>) -> Result<()> {
        self.send(RunEvent::Rejected {
            node_id: node_id.into(),
        })
    }

    pub fn abort(&self, reason: impl Into<String>) -> Result<()> {
        self.send(RunEvent::Abort {
            reason: reason.into(),
        })
    }

    /// Whether the run reached a final state
    ///
    /// Events are applied asynchronously: after [`RunHandle::abort`] this
    /// stays false until the coordinator has processed the abort.
    pub fn is_finished(&self) -> bool {
        self.tx.is_closed()
    }

    /// Take the task resolving to the final run; `None` once taken
    pub(crate) fn take_task(&mut self) -> Option<JoinHandle<Run>> {
        self.task.take()
    }

    /// Wait for the run to finish and take its final state
    pub async fn wait(mut self) -> Result<Run> {
        let task = self.take_task().ok_or(EngineError::NoActiveRun)?;
        join_run(task).await
    }
}

pub(crate) async fn join_run(task: JoinHandle<Run>) -> Result<Run> {
    task.await
        .map_err(|e| EngineError::failed(format!("Run task failed: {}", e)))
}
