//! `Store` backed by Postgres through the repository functions.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::models::{ExecutionRow, ExecutionState, JobRow, JobUpdate, NewJob, WorkflowRow};
use crate::repository::{executions, jobs, workflows};
use crate::{DbPool, Store, StoreError};

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_workflow(&self, workflow: WorkflowRow) -> Result<WorkflowRow, StoreError> {
        workflows::upsert_workflow(&self.pool, &workflow).await
    }

    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowRow, StoreError> {
        workflows::get_workflow(&self.pool, id).await
    }

    async fn create_execution(
        &self,
        workflow_id: Uuid,
        context: Value,
    ) -> Result<ExecutionRow, StoreError> {
        executions::create_execution(&self.pool, workflow_id, context).await
    }

    async fn load_execution(&self, id: Uuid) -> Result<ExecutionRow, StoreError> {
        executions::get_execution(&self.pool, id).await
    }

    async fn list_executions(&self, workflow_id: Uuid) -> Result<Vec<ExecutionRow>, StoreError> {
        executions::list_executions(&self.pool, workflow_id).await
    }

    async fn list_unfinished_executions(&self) -> Result<Vec<ExecutionRow>, StoreError> {
        executions::list_unfinished(&self.pool).await
    }

    async fn save_execution_state(
        &self,
        id: Uuid,
        state: ExecutionState,
    ) -> Result<ExecutionRow, StoreError> {
        executions::save_execution_state(&self.pool, id, state).await
    }

    async fn create_job(&self, job: NewJob) -> Result<JobRow, StoreError> {
        jobs::create_job(&self.pool, job).await
    }

    async fn update_job(&self, job_id: Uuid, update: JobUpdate) -> Result<JobRow, StoreError> {
        jobs::update_job(&self.pool, job_id, update).await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<JobRow, StoreError> {
        jobs::get_job(&self.pool, job_id).await
    }

    async fn list_jobs(&self, execution_id: Uuid) -> Result<Vec<JobRow>, StoreError> {
        jobs::list_jobs(&self.pool, execution_id).await
    }
}

// Needs a reachable Postgres: `DATABASE_URL=... cargo test -p store -- --ignored`
#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExecutionStatus, JobStatus};
    use crate::pool::{create_pool, run_migrations};
    use chrono::Utc;
    use serde_json::json;

    #[tokio::test]
    #[ignore]
    async fn settles_jobs_once_against_postgres() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL");
        let pool = create_pool(&url, 2).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let store = PgStore::new(pool);

        let workflow = store
            .insert_workflow(WorkflowRow {
                id: Uuid::new_v4(),
                name: "pg".into(),
                enabled: true,
                definition: json!({}),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let execution = store.create_execution(workflow.id, json!({})).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Queued);

        let job = store
            .create_job(NewJob {
                execution_id: execution.id,
                node_id: "a".into(),
                status: JobStatus::Pending,
                result: Value::Null,
                port: "default".into(),
            })
            .await
            .unwrap();
        let update = JobUpdate { status: JobStatus::Resolved, result: json!(1), port: "default".into() };
        store.update_job(job.id, update.clone()).await.unwrap();
        assert!(store.update_job(job.id, update).await.unwrap_err().is_conflict());
    }
}
