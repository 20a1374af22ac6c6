//! Job rows.
//!
//! Creation locks the parent execution row and settlement locks the job
//! row, so the terminal-status guards are evaluated and applied atomically.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::{
    StoreError,
    models::{ExecutionStatus, JobRow, JobStatus, JobUpdate, NewJob},
};

const COLUMNS: &str = "id, execution_id, node_id, status, result, port, created_at, updated_at";

#[derive(FromRow)]
struct JobRecord {
    id: Uuid,
    execution_id: Uuid,
    node_id: String,
    status: String,
    result: serde_json::Value,
    port: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRecord> for JobRow {
    type Error = StoreError;

    fn try_from(r: JobRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            id: r.id,
            execution_id: r.execution_id,
            node_id: r.node_id,
            status: r.status.parse().map_err(StoreError::Decode)?,
            result: r.result,
            port: r.port,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

/// Append a job to a non-terminal execution.
pub async fn create_job(pool: &PgPool, job: NewJob) -> Result<JobRow, StoreError> {
    let mut tx = pool.begin().await?;

    let status: String = sqlx::query_scalar(
        "SELECT status FROM workflow_executions WHERE id = $1 FOR UPDATE",
    )
    .bind(job.execution_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(StoreError::NotFound)?;
    let status: ExecutionStatus = status.parse().map_err(StoreError::Decode)?;

    if status.is_terminal() {
        tx.rollback().await?;
        return Err(StoreError::ExecutionFinished { id: job.execution_id, status });
    }

    let now = Utc::now();
    let record = sqlx::query_as::<_, JobRecord>(&format!(
        r#"
        INSERT INTO jobs (id, execution_id, node_id, status, result, port, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
        RETURNING {COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(job.execution_id)
    .bind(job.node_id)
    .bind(job.status.to_string())
    .bind(job.result)
    .bind(job.port)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    record.try_into()
}

/// Settle a pending job. Rejects any transition out of a terminal status.
pub async fn update_job(pool: &PgPool, job_id: Uuid, update: JobUpdate) -> Result<JobRow, StoreError> {
    let mut tx = pool.begin().await?;

    let current: String = sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1 FOR UPDATE")
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound)?;
    let current: JobStatus = current.parse().map_err(StoreError::Decode)?;

    if current.is_terminal() {
        tx.rollback().await?;
        return Err(StoreError::InvalidJobTransition {
            id: job_id,
            from: current,
            to: update.status,
        });
    }

    let record = sqlx::query_as::<_, JobRecord>(&format!(
        r#"
        UPDATE jobs SET status = $2, result = $3, port = $4, updated_at = $5
        WHERE id = $1
        RETURNING {COLUMNS}
        "#
    ))
    .bind(job_id)
    .bind(update.status.to_string())
    .bind(update.result)
    .bind(update.port)
    .bind(Utc::now())
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    record.try_into()
}

pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<JobRow, StoreError> {
    sqlx::query_as::<_, JobRecord>(&format!("SELECT {COLUMNS} FROM jobs WHERE id = $1"))
        .bind(job_id)
        .fetch_optional(pool)
        .await?
        .ok_or(StoreError::NotFound)?
        .try_into()
}

/// Jobs of one execution in insertion order.
pub async fn list_jobs(pool: &PgPool, execution_id: Uuid) -> Result<Vec<JobRow>, StoreError> {
    let records = sqlx::query_as::<_, JobRecord>(&format!(
        "SELECT {COLUMNS} FROM jobs WHERE execution_id = $1 ORDER BY seq ASC"
    ))
    .bind(execution_id)
    .fetch_all(pool)
    .await?;

    records.into_iter().map(JobRow::try_from).collect()
}
