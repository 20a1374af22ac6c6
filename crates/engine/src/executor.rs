//! Workflow execution engine.
//!
//! `WorkflowExecutor` is the central orchestrator:
//! 1. Validates the graph and picks the entry node.
//! 2. Walks the graph one node at a time, resolving each node's config
//!    against the accumulated context and dispatching it via `Instruction`.
//! 3. Records one job per node visit and follows the edge for the port the
//!    job settled on.
//! 4. Parks the execution when an instruction goes pending; the pending task
//!    reports back through the completion dispatcher, which re-enters
//!    [`WorkflowExecutor::complete_job`] for that execution only.
//! 5. Handles `NodeError::Retryable` (up to `max_retries`) and turns fatal
//!    errors and panics into failed jobs.

use std::any::Any;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, Mutex, OwnedMutexGuard};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use instructions::{
    Completion, ExecutionContext, Instruction, InstructionRegistry, NodeError, Outcome, PendingTask,
    Port,
};
use store::{
    ExecutionRow, ExecutionState, ExecutionStatus, JobRow, JobStatus, JobUpdate, NewJob, Store,
    StoreError, WorkflowRow,
};

use crate::context::RunContext;
use crate::graph::validate_graph;
use crate::models::{NodeDefinition, Workflow};
use crate::resolver;
use crate::EngineError;

/// Result codes recorded on jobs the engine fails on a node's behalf.
pub mod codes {
    pub const RESOLVE: &str = "ERESOLVE";
    pub const UNKNOWN_INSTRUCTION: &str = "EUNKNOWN_INSTRUCTION";
    pub const FATAL: &str = "EFATAL";
    pub const RETRY_EXHAUSTED: &str = "ERETRY_EXHAUSTED";
    pub const PANIC: &str = "EPANIC";
    pub const INTERRUPTED: &str = "EINTERRUPTED";
    pub const CANCELLED: &str = "ECANCELLED";
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the executor.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of times a retryable node failure will be retried.
    pub max_retries: u32,
    /// Base delay for exponential back-off between retries.
    pub retry_base_delay: Duration,
    /// Jobs one execution may create before it is failed. Bounds loops.
    pub max_steps: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
            max_steps: 1000,
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Broadcast after every persisted status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionEvent {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
}

/// A settled pending job on its way back to the engine.
struct JobCompletion {
    execution_id: Uuid,
    job_id: Uuid,
    completion: Completion,
}

/// What invoking a node produced.
enum Step {
    Settled(Completion),
    Pending(PendingTask),
    /// A failed job that fails the execution regardless of `ignoreFail`.
    Misconfigured(Completion),
}

/// Where the execution goes after a job settles.
enum Transition {
    Next(String),
    Finish(ExecutionStatus),
}

// ---------------------------------------------------------------------------
// WorkflowExecutor
// ---------------------------------------------------------------------------

struct Inner {
    store: Arc<dyn Store>,
    registry: InstructionRegistry,
    config: EngineConfig,
    /// Serialises processing within one execution.
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    /// Cancels the in-flight pending task of an execution.
    tokens: DashMap<Uuid, CancellationToken>,
    completions: mpsc::UnboundedSender<JobCompletion>,
    events: broadcast::Sender<ExecutionEvent>,
}

/// Cheap to clone; every clone drives the same executions.
///
/// Must be created inside a tokio runtime: construction spawns the
/// completion dispatcher, which lives as long as the executor.
#[derive(Clone)]
pub struct WorkflowExecutor {
    inner: Arc<Inner>,
}

impl WorkflowExecutor {
    /// Create a new executor.
    pub fn new(store: Arc<dyn Store>, registry: InstructionRegistry, config: EngineConfig) -> Self {
        let (completions, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);

        let inner = Arc::new(Inner {
            store,
            registry,
            config,
            locks: DashMap::new(),
            tokens: DashMap::new(),
            completions,
            events,
        });
        tokio::spawn(dispatch_completions(Arc::downgrade(&inner), rx));

        Self { inner }
    }

    pub fn registry(&self) -> &InstructionRegistry {
        &self.inner.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.inner.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Workflows
    // -----------------------------------------------------------------------

    /// Validate and persist a workflow definition.
    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.id))]
    pub async fn save_workflow(&self, workflow: &Workflow) -> Result<WorkflowRow, EngineError> {
        let entry = validate_graph(workflow, &self.inner.registry)?;
        let row = self.inner.store.insert_workflow(workflow.to_row()?).await?;
        info!(entry = %entry, nodes = workflow.nodes.len(), "workflow saved");
        Ok(row)
    }

    pub async fn load_workflow(&self, id: Uuid) -> Result<Workflow, EngineError> {
        match self.inner.store.get_workflow(id).await {
            Ok(row) => Workflow::try_from(row),
            Err(StoreError::NotFound) => Err(EngineError::WorkflowNotFound(id)),
            Err(err) => Err(err.into()),
        }
    }

    // -----------------------------------------------------------------------
    // Trigger entry point
    // -----------------------------------------------------------------------

    /// Create a fresh `queued` execution and start processing it in the
    /// background.
    ///
    /// # Errors
    /// [`EngineError::WorkflowNotFound`], [`EngineError::WorkflowDisabled`],
    /// or a store error.
    #[instrument(skip(self, payload))]
    pub async fn start_execution(&self, workflow_id: Uuid, payload: Value) -> Result<Uuid, EngineError> {
        let workflow = self.load_workflow(workflow_id).await?;
        if !workflow.enabled {
            return Err(EngineError::WorkflowDisabled(workflow_id));
        }

        let context = RunContext::new(payload).to_value();
        let row = self.inner.store.create_execution(workflow_id, context).await?;
        let execution_id = row.id;
        info!(%execution_id, "execution queued");
        self.emit(execution_id, row.status);

        let executor = self.clone();
        tokio::spawn(async move {
            if let Err(err) = executor.process(execution_id).await {
                error!(%execution_id, error = %err, "execution processing failed");
            }
        });

        Ok(execution_id)
    }

    // -----------------------------------------------------------------------
    // State machine
    // -----------------------------------------------------------------------

    /// Drive an execution until it is terminal or parked on a pending job.
    ///
    /// Terminal and parked executions are returned as they are.
    #[instrument(skip(self))]
    pub async fn process(&self, execution_id: Uuid) -> Result<ExecutionStatus, EngineError> {
        let _guard = self.lock(execution_id).await;

        let row = self.execution(execution_id).await?;
        if row.status.is_terminal() || row.is_awaiting() {
            debug!(status = %row.status, awaiting = row.is_awaiting(), "nothing to process");
            return Ok(row.status);
        }
        let ctx = match decode_context(&row) {
            Ok(ctx) => ctx,
            Err(err) => {
                error!(error = %err, "cannot process execution");
                return self.finish(execution_id, row.context, ExecutionStatus::Failed).await;
            }
        };

        let workflow = match self.load_workflow(row.workflow_id).await {
            Ok(workflow) => workflow,
            Err(err) if err.is_configuration() => {
                error!(error = %err, "cannot load workflow definition");
                return self.finish(execution_id, ctx.to_value(), ExecutionStatus::Failed).await;
            }
            Err(err) => return Err(err),
        };

        let entry = match validate_graph(&workflow, &self.inner.registry) {
            Ok(entry) => entry,
            Err(err) => {
                error!(error = %err, "workflow failed validation");
                return self.finish(execution_id, ctx.to_value(), ExecutionStatus::Failed).await;
            }
        };
        let current = row.current_node.unwrap_or(entry);

        let running = ExecutionState {
            status: ExecutionStatus::Running,
            context: ctx.to_value(),
            current_node: Some(current.clone()),
            pending_job: None,
        };
        if let Err(err) = self.save_state(execution_id, running).await {
            return self.on_conflict(execution_id, err).await;
        }

        self.run_from(&workflow, execution_id, ctx, current).await
    }

    /// Apply the completion of a pending job and continue the execution.
    ///
    /// Returns `false` when the completion was discarded: the execution is
    /// already terminal, the job is not the one the execution waits on, or
    /// another completion got there first.
    #[instrument(skip(self, completion))]
    pub async fn complete_job(
        &self,
        execution_id: Uuid,
        job_id: Uuid,
        completion: Completion,
    ) -> Result<bool, EngineError> {
        let _guard = self.lock(execution_id).await;

        let row = self.execution(execution_id).await?;
        if row.status.is_terminal() {
            warn!(status = %row.status, "completion discarded: execution already finished");
            return Ok(false);
        }
        if row.pending_job != Some(job_id) {
            warn!(pending_job = ?row.pending_job, "completion discarded: job is not pending");
            return Ok(false);
        }

        let job = self.inner.store.get_job(job_id).await?;
        let completion = if job.status.is_terminal() {
            // The job settled but the execution never moved past it; carry on
            // from the stored settlement.
            info!(node_id = %job.node_id, status = %job.status, "replaying settled job");
            stored_completion(&job)
        } else {
            match self.inner.store.update_job(job_id, job_update(&completion)).await {
                Ok(_) => {}
                Err(err) if err.is_conflict() => {
                    warn!(error = %err, "completion discarded");
                    return Ok(false);
                }
                Err(err) => return Err(err.into()),
            }
            info!(node_id = %job.node_id, failed = completion.is_failed(), "pending job settled");
            completion
        };

        let mut ctx = match decode_context(&row) {
            Ok(ctx) => ctx,
            Err(err) => {
                error!(error = %err, "cannot continue execution");
                self.finish(execution_id, row.context, ExecutionStatus::Failed).await?;
                return Ok(true);
            }
        };
        let workflow = self.load_workflow(row.workflow_id).await?;
        let Some(node) = workflow.node(&job.node_id) else {
            error!(node_id = %job.node_id, "settled job belongs to a node the workflow no longer has");
            self.finish(execution_id, ctx.to_value(), ExecutionStatus::Failed).await?;
            return Ok(true);
        };

        match advance(&workflow, node, completion, &mut ctx, false) {
            Transition::Next(next) => {
                let running = ExecutionState {
                    status: ExecutionStatus::Running,
                    context: ctx.to_value(),
                    current_node: Some(next.clone()),
                    pending_job: None,
                };
                if let Err(err) = self.save_state(execution_id, running).await {
                    self.on_conflict(execution_id, err).await?;
                    return Ok(true);
                }
                self.run_from(&workflow, execution_id, ctx, next).await?;
            }
            Transition::Finish(status) => {
                self.finish(execution_id, ctx.to_value(), status).await?;
            }
        }
        Ok(true)
    }

    /// Cancel an execution at any point, including while a job is pending.
    ///
    /// The in-flight task is aborted, pending jobs become `aborted`, and any
    /// completion arriving later is discarded. Returns `false` if the
    /// execution had already finished.
    #[instrument(skip(self))]
    pub async fn cancel(&self, execution_id: Uuid) -> Result<bool, EngineError> {
        let row = self.execution(execution_id).await?;
        if row.status.is_terminal() {
            return Ok(false);
        }

        let cancelled = ExecutionState {
            status: ExecutionStatus::Cancelled,
            context: row.context,
            current_node: row.current_node,
            pending_job: None,
        };
        match self.save_state(execution_id, cancelled).await {
            Ok(_) => {}
            Err(err) if err.is_conflict() => return Ok(false),
            Err(err) => return Err(err.into()),
        }
        if let Some((_, token)) = self.inner.tokens.remove(&execution_id) {
            token.cancel();
        }

        for job in self.inner.store.list_jobs(execution_id).await? {
            if job.status != JobStatus::Pending {
                continue;
            }
            let aborted = JobUpdate {
                status: JobStatus::Aborted,
                result: json!({ "code": codes::CANCELLED, "message": "execution cancelled" }),
                port: Port::Default.to_string(),
            };
            match self.inner.store.update_job(job.id, aborted).await {
                Ok(_) => info!(job_id = %job.id, node_id = %job.node_id, "pending job aborted"),
                Err(err) if err.is_conflict() => {}
                Err(err) => return Err(err.into()),
            }
        }

        info!("execution cancelled");
        Ok(true)
    }

    /// Boot-time sweep over unfinished executions.
    ///
    /// A pending job cannot survive a restart, so each one is settled as
    /// failed with `EINTERRUPTED` through the normal completion path (the
    /// node's `ignoreFail` applies). Queued and running executions without a
    /// pending job are processed again from their current node. Call once,
    /// before new executions are started. Returns how many executions were
    /// picked up; they continue in the background.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let unfinished = self.inner.store.list_unfinished_executions().await?;
        let count = unfinished.len();

        for row in unfinished {
            let executor = self.clone();
            let execution_id = row.id;
            match row.pending_job {
                Some(job_id) => {
                    info!(%execution_id, %job_id, "settling interrupted pending job");
                    let completion = Completion::failed(json!({
                        "code": codes::INTERRUPTED,
                        "message": "pending job interrupted by restart",
                    }));
                    tokio::spawn(async move {
                        if let Err(err) = executor.complete_job(execution_id, job_id, completion).await {
                            error!(%execution_id, error = %err, "recovery failed");
                        }
                    });
                }
                None => {
                    info!(%execution_id, status = %row.status, "resuming execution");
                    tokio::spawn(async move {
                        if let Err(err) = executor.process(execution_id).await {
                            error!(%execution_id, error = %err, "recovery failed");
                        }
                    });
                }
            }
        }

        info!(count, "recovery sweep scheduled");
        Ok(count)
    }

    /// Wait until the execution reaches a terminal status.
    pub async fn wait_until_finished(&self, execution_id: Uuid) -> Result<ExecutionRow, EngineError> {
        let mut events = self.subscribe();
        loop {
            let row = self.execution(execution_id).await?;
            if row.status.is_terminal() {
                return Ok(row);
            }
            loop {
                match events.recv().await {
                    Ok(event) if event.execution_id == execution_id && event.status.is_terminal() => break,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => return Ok(row),
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Read accessors
    // -----------------------------------------------------------------------

    pub async fn execution(&self, execution_id: Uuid) -> Result<ExecutionRow, EngineError> {
        match self.inner.store.load_execution(execution_id).await {
            Ok(row) => Ok(row),
            Err(StoreError::NotFound) => Err(EngineError::ExecutionNotFound(execution_id)),
            Err(err) => Err(err.into()),
        }
    }

    /// Jobs of one execution in creation order.
    pub async fn jobs(&self, execution_id: Uuid) -> Result<Vec<JobRow>, EngineError> {
        Ok(self.inner.store.list_jobs(execution_id).await?)
    }

    // -----------------------------------------------------------------------
    // Internal: the step loop
    // -----------------------------------------------------------------------

    /// Run nodes starting at `current` until the execution finishes or
    /// parks. The caller holds the execution lock.
    async fn run_from(
        &self,
        workflow: &Workflow,
        execution_id: Uuid,
        ctx: RunContext,
        current: String,
    ) -> Result<ExecutionStatus, EngineError> {
        let token = self.token_for(execution_id);
        let outcome = self.walk(workflow, execution_id, ctx, current, token).await;
        // Only a parked execution still needs its token.
        if !matches!(outcome, Ok(ExecutionStatus::Running)) {
            self.inner.tokens.remove(&execution_id);
        }
        outcome
    }

    async fn walk(
        &self,
        workflow: &Workflow,
        execution_id: Uuid,
        mut ctx: RunContext,
        mut current: String,
        token: CancellationToken,
    ) -> Result<ExecutionStatus, EngineError> {
        let mut steps = self.inner.store.list_jobs(execution_id).await?.len();

        loop {
            if token.is_cancelled() {
                return Ok(self.execution(execution_id).await?.status);
            }
            if steps >= self.inner.config.max_steps {
                let err = EngineError::StepLimitExceeded {
                    id: execution_id,
                    limit: self.inner.config.max_steps,
                };
                error!(error = %err, "stopping execution");
                return self.finish(execution_id, ctx.to_value(), ExecutionStatus::Failed).await;
            }
            let Some(node) = workflow.node(&current) else {
                error!(node_id = %current, "execution points at an undefined node");
                return self.finish(execution_id, ctx.to_value(), ExecutionStatus::Failed).await;
            };

            let step = self.invoke(workflow, execution_id, node, &ctx).await;
            steps += 1;
            let (completion, misconfigured) = match step {
                Step::Pending(task) => {
                    return self.park(execution_id, node, &ctx, task, token).await;
                }
                Step::Settled(completion) => (completion, false),
                Step::Misconfigured(completion) => (completion, true),
            };

            let job = NewJob {
                execution_id,
                node_id: node.id.clone(),
                status: job_status(&completion),
                result: completion.result().clone(),
                port: completion.port().to_string(),
            };
            let job = match self.inner.store.create_job(job).await {
                Ok(job) => job,
                Err(err) => return self.on_conflict(execution_id, err).await,
            };
            info!(node_id = %node.id, job_id = %job.id, status = %job.status, port = %job.port, "job settled");

            match advance(workflow, node, completion, &mut ctx, misconfigured) {
                Transition::Next(next) => {
                    let running = ExecutionState {
                        status: ExecutionStatus::Running,
                        context: ctx.to_value(),
                        current_node: Some(next.clone()),
                        pending_job: None,
                    };
                    if let Err(err) = self.save_state(execution_id, running).await {
                        return self.on_conflict(execution_id, err).await;
                    }
                    current = next;
                }
                Transition::Finish(status) => {
                    return self.finish(execution_id, ctx.to_value(), status).await;
                }
            }
        }
    }

    /// Resolve the node's config and run its instruction inside a failure
    /// boundary. Never fails: every problem becomes a failed completion.
    async fn invoke(
        &self,
        workflow: &Workflow,
        execution_id: Uuid,
        node: &NodeDefinition,
        ctx: &RunContext,
    ) -> Step {
        let scope = ctx.scope(execution_id, workflow.id);

        let config = match resolver::resolve(&node.config, &scope) {
            Ok(config) => config,
            Err(err) => {
                warn!(node_id = %node.id, path = %err.path, "config resolution failed");
                return Step::Settled(Completion::failed(json!({
                    "code": codes::RESOLVE,
                    "path": err.path,
                    "message": err.to_string(),
                })));
            }
        };

        let Some(instruction) = self.inner.registry.get(&node.node_type) else {
            let err = EngineError::UnknownInstruction {
                node_id: node.id.clone(),
                node_type: node.node_type.clone(),
            };
            error!(error = %err, "cannot dispatch node");
            return Step::Misconfigured(Completion::failed(json!({
                "code": codes::UNKNOWN_INSTRUCTION,
                "message": err.to_string(),
            })));
        };

        let node_ctx = ExecutionContext {
            workflow_id: workflow.id,
            execution_id,
            node_id: node.id.clone(),
            scope,
        };
        self.execute_with_retry(&node.id, instruction, config, node_ctx).await
    }

    // -----------------------------------------------------------------------
    // Internal: execute a single node with retry logic.
    // -----------------------------------------------------------------------

    async fn execute_with_retry(
        &self,
        node_id: &str,
        instruction: Arc<dyn Instruction>,
        config: Value,
        ctx: ExecutionContext,
    ) -> Step {
        let mut attempts = 0u32;

        loop {
            let (instruction, config, ctx) = (Arc::clone(&instruction), config.clone(), ctx.clone());
            let handle = tokio::spawn(async move { instruction.run(config, &ctx).await });

            match handle.await {
                Ok(Ok(Outcome::Settled(completion))) => return Step::Settled(completion),
                Ok(Ok(Outcome::Pending(task))) => return Step::Pending(task),

                Ok(Err(NodeError::Fatal(msg))) => {
                    let err = EngineError::NodeFatal { node_id: node_id.to_owned(), message: msg };
                    warn!(error = %err, "node failed");
                    return Step::Settled(Completion::failed(json!({
                        "code": codes::FATAL,
                        "message": err.to_string(),
                    })));
                }

                Ok(Err(NodeError::Retryable(msg))) => {
                    attempts += 1;
                    if attempts > self.inner.config.max_retries {
                        let err = EngineError::NodeRetryExhausted {
                            node_id: node_id.to_owned(),
                            message: msg,
                        };
                        warn!(error = %err, "node failed");
                        return Step::Settled(Completion::failed(json!({
                            "code": codes::RETRY_EXHAUSTED,
                            "message": err.to_string(),
                            "attempts": attempts,
                        })));
                    }

                    let delay = self.inner.config.retry_base_delay
                        * 2u32.pow(attempts.saturating_sub(1));

                    warn!(
                        "node '{}' retryable error (attempt {}/{}), retrying in {:?}: {}",
                        node_id, attempts, self.inner.config.max_retries, delay, msg
                    );

                    tokio::time::sleep(delay).await;
                }

                Err(join) => {
                    let message = panic_message(join);
                    error!(node_id, %message, "instruction panicked");
                    return Step::Settled(Completion::failed(json!({
                        "code": codes::PANIC,
                        "message": message,
                    })));
                }
            }
        }
    }

    /// Record a pending job, park the execution and hand the task to its own
    /// tokio task.
    async fn park(
        &self,
        execution_id: Uuid,
        node: &NodeDefinition,
        ctx: &RunContext,
        task: PendingTask,
        token: CancellationToken,
    ) -> Result<ExecutionStatus, EngineError> {
        let pending = NewJob {
            execution_id,
            node_id: node.id.clone(),
            status: JobStatus::Pending,
            result: Value::Null,
            port: Port::Default.to_string(),
        };
        let job = match self.inner.store.create_job(pending).await {
            Ok(job) => job,
            Err(err) => return self.on_conflict(execution_id, err).await,
        };

        let parked = ExecutionState {
            status: ExecutionStatus::Running,
            context: ctx.to_value(),
            current_node: Some(node.id.clone()),
            pending_job: Some(job.id),
        };
        if let Err(err) = self.save_state(execution_id, parked).await {
            // Cancelled between the two writes: the task never starts.
            let aborted = JobUpdate {
                status: JobStatus::Aborted,
                result: json!({ "code": codes::CANCELLED, "message": "execution cancelled" }),
                port: Port::Default.to_string(),
            };
            if let Err(abort_err) = self.inner.store.update_job(job.id, aborted).await {
                debug!(error = %abort_err, "pending job already settled");
            }
            return self.on_conflict(execution_id, err).await;
        }

        info!(node_id = %node.id, job_id = %job.id, "job pending; execution parked");
        self.spawn_pending(execution_id, job.id, task, token);
        Ok(ExecutionStatus::Running)
    }

    fn spawn_pending(&self, execution_id: Uuid, job_id: Uuid, task: PendingTask, token: CancellationToken) {
        let completions = self.inner.completions.clone();

        tokio::spawn(async move {
            let mut handle = tokio::spawn(task);
            let completion = tokio::select! {
                _ = token.cancelled() => {
                    handle.abort();
                    debug!(%execution_id, %job_id, "pending task aborted");
                    return;
                }
                joined = &mut handle => joined.unwrap_or_else(|join| {
                    let message = panic_message(join);
                    error!(%execution_id, %job_id, %message, "pending task panicked");
                    Completion::failed(json!({ "code": codes::PANIC, "message": message }))
                }),
            };

            let completion = JobCompletion { execution_id, job_id, completion };
            if completions.send(completion).is_err() {
                warn!(%execution_id, %job_id, "executor dropped; completion lost");
            }
        });
    }

    // -----------------------------------------------------------------------
    // Internal: persistence helpers
    // -----------------------------------------------------------------------

    async fn finish(
        &self,
        execution_id: Uuid,
        context: Value,
        status: ExecutionStatus,
    ) -> Result<ExecutionStatus, EngineError> {
        let state = ExecutionState {
            status,
            context,
            current_node: None,
            pending_job: None,
        };
        if let Err(err) = self.save_state(execution_id, state).await {
            return self.on_conflict(execution_id, err).await;
        }
        self.inner.tokens.remove(&execution_id);

        match status {
            ExecutionStatus::Failed => warn!(%execution_id, "execution failed"),
            _ => info!(%execution_id, %status, "execution finished"),
        }
        Ok(status)
    }

    async fn save_state(&self, execution_id: Uuid, state: ExecutionState) -> Result<ExecutionRow, StoreError> {
        let row = self.inner.store.save_execution_state(execution_id, state).await?;
        self.emit(execution_id, row.status);
        Ok(row)
    }

    /// A guard rejection means someone else (usually `cancel`) finished the
    /// execution first; stop quietly and report its status.
    async fn on_conflict(&self, execution_id: Uuid, err: StoreError) -> Result<ExecutionStatus, EngineError> {
        if !err.is_conflict() {
            return Err(err.into());
        }
        let status = self.execution(execution_id).await?.status;
        info!(%execution_id, %status, "execution finished concurrently; stopping");
        Ok(status)
    }

    fn emit(&self, execution_id: Uuid, status: ExecutionStatus) {
        // No subscribers is fine.
        let _ = self.inner.events.send(ExecutionEvent { execution_id, status });
    }

    /// Take the per-execution lock. The map entry is dropped with the last
    /// guard, so discarded calls leave nothing behind.
    async fn lock(&self, execution_id: Uuid) -> ExecutionLock<'_> {
        let mutex = Arc::clone(&self.inner.locks.entry(execution_id).or_default());
        ExecutionLock {
            guard: Some(mutex.lock_owned().await),
            locks: &self.inner.locks,
            execution_id,
        }
    }

    fn token_for(&self, execution_id: Uuid) -> CancellationToken {
        self.inner.tokens.entry(execution_id).or_insert_with(CancellationToken::new).clone()
    }
}

struct ExecutionLock<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    locks: &'a DashMap<Uuid, Arc<Mutex<()>>>,
    execution_id: Uuid,
}

impl Drop for ExecutionLock<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Anyone else holding the mutex keeps the entry alive.
        self.locks.remove_if(&self.execution_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Feeds settled pending jobs back into the engine. Stops once the executor
/// is dropped.
async fn dispatch_completions(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<JobCompletion>) {
    while let Some(JobCompletion { execution_id, job_id, completion }) = rx.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        let executor = WorkflowExecutor { inner };
        tokio::spawn(async move {
            if let Err(err) = executor.complete_job(execution_id, job_id, completion).await {
                error!(%execution_id, %job_id, error = %err, "applying completion failed");
            }
        });
    }
}

/// Merge the settled job into the context and pick the next node.
fn advance(
    workflow: &Workflow,
    node: &NodeDefinition,
    completion: Completion,
    ctx: &mut RunContext,
    misconfigured: bool,
) -> Transition {
    let failed = completion.is_failed();
    let port = completion.port();
    ctx.record(&node.id, completion.into_result());

    if misconfigured || (failed && !node.ignores_failure()) {
        return Transition::Finish(ExecutionStatus::Failed);
    }
    match workflow.next_node(&node.id, port) {
        Some(next) => Transition::Next(next.to_owned()),
        None => Transition::Finish(ExecutionStatus::Resolved),
    }
}

fn decode_context(row: &ExecutionRow) -> Result<RunContext, EngineError> {
    RunContext::from_value(&row.context).map_err(|err| EngineError::CorruptContext {
        id: row.id,
        reason: err.to_string(),
    })
}

/// Rebuild the completion a settled job was recorded with.
fn stored_completion(job: &JobRow) -> Completion {
    match job.status {
        JobStatus::Resolved => Completion::Resolved {
            result: job.result.clone(),
            port: job.port.parse().unwrap_or_default(),
        },
        _ => Completion::failed(job.result.clone()),
    }
}

fn job_status(completion: &Completion) -> JobStatus {
    if completion.is_failed() {
        JobStatus::Failed
    } else {
        JobStatus::Resolved
    }
}

fn job_update(completion: &Completion) -> JobUpdate {
    JobUpdate {
        status: job_status(completion),
        result: completion.result().clone(),
        port: completion.port().to_string(),
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload: Box<dyn Any + Send> = err.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "instruction panicked".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Trigger;
    use instructions::mock::MockInstruction;
    use store::MemoryStore;

    fn single_node(node_type: &str) -> Workflow {
        let only = NodeDefinition::new("only", node_type, json!({}));
        Workflow::new("single", Trigger::Manual, vec![only], vec![])
    }

    #[tokio::test]
    async fn discarded_calls_leave_no_per_execution_state_behind() {
        let mut registry = InstructionRegistry::new();
        registry.register("echo", Arc::new(MockInstruction::returning("echo", json!({}))));
        registry.register("wait", Arc::new(MockInstruction::parked("wait")));
        let executor = WorkflowExecutor::new(Arc::new(MemoryStore::new()), registry, EngineConfig::default());

        let done = single_node("echo");
        executor.save_workflow(&done).await.unwrap();
        let finished = executor.start_execution(done.id, json!({})).await.unwrap();
        executor.wait_until_finished(finished).await.unwrap();

        let parked = single_node("wait");
        executor.save_workflow(&parked).await.unwrap();
        let cancelled = executor.start_execution(parked.id, json!({})).await.unwrap();
        while executor.execution(cancelled).await.unwrap().pending_job.is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(executor.cancel(cancelled).await.unwrap());

        for _ in 0..200 {
            let stray = Completion::resolved(Value::Null);
            assert!(!executor.complete_job(finished, Uuid::new_v4(), stray.clone()).await.unwrap());
            assert!(!executor.complete_job(cancelled, Uuid::new_v4(), stray.clone()).await.unwrap());
            assert!(matches!(
                executor.complete_job(Uuid::new_v4(), Uuid::new_v4(), stray).await,
                Err(EngineError::ExecutionNotFound(_))
            ));
            executor.process(finished).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(executor.inner.locks.len(), 0);
        assert_eq!(executor.inner.tokens.len(), 0);
    }

    #[tokio::test]
    async fn waiting_callers_keep_the_lock_entry() {
        let executor = WorkflowExecutor::new(
            Arc::new(MemoryStore::new()),
            InstructionRegistry::new(),
            EngineConfig::default(),
        );
        let id = Uuid::new_v4();

        let first = executor.lock(id).await;
        let waiting = {
            let executor = executor.clone();
            tokio::spawn(async move {
                let _second = executor.lock(id).await;
            })
        };
        while executor.inner.locks.get(&id).map(|m| Arc::strong_count(&m)) != Some(3) {
            tokio::task::yield_now().await;
        }

        drop(first);
        assert!(executor.inner.locks.contains_key(&id));
        waiting.await.unwrap();
        assert!(!executor.inner.locks.contains_key(&id));
    }
}
