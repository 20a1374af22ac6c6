//! In-process `Store` used by tests and by one-shot CLI runs.
//!
//! All tables sit behind one mutex so every guard (terminal execution,
//! settled job) is checked and applied in a single critical section. The
//! lock is never held across an `.await`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::models::{
    ExecutionRow, ExecutionState, ExecutionStatus, JobRow, JobUpdate, NewJob, WorkflowRow,
};
use crate::{Store, StoreError};

#[derive(Default)]
struct Tables {
    workflows: HashMap<Uuid, WorkflowRow>,
    executions: HashMap<Uuid, ExecutionRow>,
    /// Insertion order, used for listing.
    execution_order: Vec<Uuid>,
    jobs: HashMap<Uuid, JobRow>,
    jobs_by_execution: HashMap<Uuid, Vec<Uuid>>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_workflow(&self, workflow: WorkflowRow) -> Result<WorkflowRow, StoreError> {
        self.lock().workflows.insert(workflow.id, workflow.clone());
        Ok(workflow)
    }

    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowRow, StoreError> {
        self.lock().workflows.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    async fn create_execution(
        &self,
        workflow_id: Uuid,
        context: Value,
    ) -> Result<ExecutionRow, StoreError> {
        let mut tables = self.lock();
        if !tables.workflows.contains_key(&workflow_id) {
            return Err(StoreError::NotFound);
        }

        let now = Utc::now();
        let row = ExecutionRow {
            id: Uuid::new_v4(),
            workflow_id,
            status: ExecutionStatus::Queued,
            context,
            current_node: None,
            pending_job: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        };
        tables.executions.insert(row.id, row.clone());
        tables.execution_order.push(row.id);
        Ok(row)
    }

    async fn load_execution(&self, id: Uuid) -> Result<ExecutionRow, StoreError> {
        self.lock().executions.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    async fn list_executions(&self, workflow_id: Uuid) -> Result<Vec<ExecutionRow>, StoreError> {
        let tables = self.lock();
        Ok(tables
            .execution_order
            .iter()
            .filter_map(|id| tables.executions.get(id))
            .filter(|row| row.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn list_unfinished_executions(&self) -> Result<Vec<ExecutionRow>, StoreError> {
        let tables = self.lock();
        Ok(tables
            .execution_order
            .iter()
            .filter_map(|id| tables.executions.get(id))
            .filter(|row| !row.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn save_execution_state(
        &self,
        id: Uuid,
        state: ExecutionState,
    ) -> Result<ExecutionRow, StoreError> {
        let mut tables = self.lock();
        let row = tables.executions.get_mut(&id).ok_or(StoreError::NotFound)?;

        if !row.status.can_transition_to(state.status) {
            return Err(StoreError::InvalidExecutionTransition {
                id,
                from: row.status,
                to: state.status,
            });
        }

        let now = Utc::now();
        row.status = state.status;
        row.context = state.context;
        row.current_node = state.current_node;
        row.pending_job = state.pending_job;
        row.updated_at = now;
        if state.status.is_terminal() {
            row.finished_at = Some(now);
        }
        Ok(row.clone())
    }

    async fn create_job(&self, job: NewJob) -> Result<JobRow, StoreError> {
        let mut tables = self.lock();
        let execution = tables
            .executions
            .get(&job.execution_id)
            .ok_or(StoreError::NotFound)?;
        if execution.status.is_terminal() {
            return Err(StoreError::ExecutionFinished {
                id: execution.id,
                status: execution.status,
            });
        }

        let now = Utc::now();
        let row = JobRow {
            id: Uuid::new_v4(),
            execution_id: job.execution_id,
            node_id: job.node_id,
            status: job.status,
            result: job.result,
            port: job.port,
            created_at: now,
            updated_at: now,
        };
        tables.jobs.insert(row.id, row.clone());
        tables
            .jobs_by_execution
            .entry(row.execution_id)
            .or_default()
            .push(row.id);
        Ok(row)
    }

    async fn update_job(&self, job_id: Uuid, update: JobUpdate) -> Result<JobRow, StoreError> {
        let mut tables = self.lock();
        let row = tables.jobs.get_mut(&job_id).ok_or(StoreError::NotFound)?;

        if row.status.is_terminal() {
            return Err(StoreError::InvalidJobTransition {
                id: job_id,
                from: row.status,
                to: update.status,
            });
        }

        row.status = update.status;
        row.result = update.result;
        row.port = update.port;
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<JobRow, StoreError> {
        self.lock().jobs.get(&job_id).cloned().ok_or(StoreError::NotFound)
    }

    async fn list_jobs(&self, execution_id: Uuid) -> Result<Vec<JobRow>, StoreError> {
        let tables = self.lock();
        Ok(tables
            .jobs_by_execution
            .get(&execution_id)
            .into_iter()
            .flatten()
            .filter_map(|id| tables.jobs.get(id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobStatus;
    use serde_json::json;

    async fn seeded() -> (MemoryStore, ExecutionRow) {
        let store = MemoryStore::new();
        let workflow = store
            .insert_workflow(WorkflowRow {
                id: Uuid::new_v4(),
                name: "wf".into(),
                enabled: true,
                definition: json!({}),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let execution = store.create_execution(workflow.id, json!({})).await.unwrap();
        (store, execution)
    }

    fn pending(execution_id: Uuid, node_id: &str) -> NewJob {
        NewJob {
            execution_id,
            node_id: node_id.into(),
            status: JobStatus::Pending,
            result: Value::Null,
            port: "default".into(),
        }
    }

    fn settle(status: JobStatus) -> JobUpdate {
        JobUpdate { status, result: json!({ "status": status.to_string() }), port: "default".into() }
    }

    #[tokio::test]
    async fn fresh_execution_is_queued() {
        let (_store, execution) = seeded().await;
        assert_eq!(execution.status, ExecutionStatus::Queued);
        assert!(execution.current_node.is_none());
        assert!(!execution.is_awaiting());
    }

    #[tokio::test]
    async fn unknown_workflow_has_no_executions() {
        let store = MemoryStore::new();
        let err = store.create_execution(Uuid::new_v4(), json!({})).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn pending_job_settles_exactly_once() {
        let (store, execution) = seeded().await;
        let job = store.create_job(pending(execution.id, "a")).await.unwrap();

        let first = store.update_job(job.id, settle(JobStatus::Resolved)).await.unwrap();
        assert_eq!(first.status, JobStatus::Resolved);

        let second = store.update_job(job.id, settle(JobStatus::Failed)).await.unwrap_err();
        assert!(second.is_conflict());
        assert_eq!(store.get_job(job.id).await.unwrap().status, JobStatus::Resolved);
    }

    #[tokio::test]
    async fn terminal_execution_rejects_new_jobs_and_saves() {
        let (store, execution) = seeded().await;
        let mut state = ExecutionState::from_row(&execution);
        state.status = ExecutionStatus::Cancelled;
        let saved = store.save_execution_state(execution.id, state.clone()).await.unwrap();
        assert!(saved.finished_at.is_some());

        let err = store.create_job(pending(execution.id, "a")).await.unwrap_err();
        assert!(matches!(err, StoreError::ExecutionFinished { .. }));

        state.status = ExecutionStatus::Running;
        let err = store.save_execution_state(execution.id, state).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidExecutionTransition { .. }));
    }

    #[tokio::test]
    async fn jobs_are_listed_in_creation_order() {
        let (store, execution) = seeded().await;
        for node in ["a", "b", "a"] {
            store.create_job(pending(execution.id, node)).await.unwrap();
        }
        let nodes: Vec<String> = store
            .list_jobs(execution.id)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.node_id)
            .collect();
        assert_eq!(nodes, vec!["a", "b", "a"]);
    }

    #[tokio::test]
    async fn unfinished_executions_exclude_terminal_ones() {
        let (store, execution) = seeded().await;
        let other = store.create_execution(execution.workflow_id, json!({})).await.unwrap();

        let mut state = ExecutionState::from_row(&other);
        state.status = ExecutionStatus::Resolved;
        store.save_execution_state(other.id, state).await.unwrap();

        let unfinished = store.list_unfinished_executions().await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].id, execution.id);
        assert_eq!(store.list_executions(execution.workflow_id).await.unwrap().len(), 2);
    }
}
