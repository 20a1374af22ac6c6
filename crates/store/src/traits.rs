//! The `Store` trait: the narrow persistence contract the engine consumes.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::models::{ExecutionRow, ExecutionState, JobRow, JobUpdate, NewJob, WorkflowRow};
use crate::StoreError;

/// Durable storage for workflow definitions, executions and jobs.
///
/// Implementations must make `save_execution_state`, `create_job` and
/// `update_job` atomic with respect to the guards they enforce: two callers
/// racing to settle the same job see exactly one success.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_workflow(&self, workflow: WorkflowRow) -> Result<WorkflowRow, StoreError>;

    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowRow, StoreError>;

    /// Create a fresh execution in `queued` status.
    async fn create_execution(
        &self,
        workflow_id: Uuid,
        context: Value,
    ) -> Result<ExecutionRow, StoreError>;

    async fn load_execution(&self, id: Uuid) -> Result<ExecutionRow, StoreError>;

    /// Executions of one workflow, oldest first.
    async fn list_executions(&self, workflow_id: Uuid) -> Result<Vec<ExecutionRow>, StoreError>;

    /// Every execution still `queued` or `running`, oldest first.
    async fn list_unfinished_executions(&self) -> Result<Vec<ExecutionRow>, StoreError>;

    /// Write back the mutable part of an execution.
    ///
    /// # Errors
    /// [`StoreError::InvalidExecutionTransition`] if the stored status cannot
    /// move to `state.status`.
    async fn save_execution_state(
        &self,
        id: Uuid,
        state: ExecutionState,
    ) -> Result<ExecutionRow, StoreError>;

    /// Append a job to an execution.
    ///
    /// # Errors
    /// [`StoreError::ExecutionFinished`] if the execution is terminal.
    async fn create_job(&self, job: NewJob) -> Result<JobRow, StoreError>;

    /// Settle a pending job.
    ///
    /// # Errors
    /// [`StoreError::InvalidJobTransition`] if the job is already terminal.
    async fn update_job(&self, job_id: Uuid, update: JobUpdate) -> Result<JobRow, StoreError>;

    async fn get_job(&self, job_id: Uuid) -> Result<JobRow, StoreError>;

    /// Jobs of one execution in creation order.
    async fn list_jobs(&self, execution_id: Uuid) -> Result<Vec<JobRow>, StoreError>;
}
