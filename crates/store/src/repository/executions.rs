//! Execution rows.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::{
    StoreError,
    models::{ExecutionRow, ExecutionState, ExecutionStatus},
};

const COLUMNS: &str =
    "id, workflow_id, status, context, current_node, pending_job, created_at, updated_at, finished_at";

/// `workflow_executions` as Postgres returns it; status is plain text.
#[derive(FromRow)]
struct ExecutionRecord {
    id: Uuid,
    workflow_id: Uuid,
    status: String,
    context: serde_json::Value,
    current_node: Option<String>,
    pending_job: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<ExecutionRecord> for ExecutionRow {
    type Error = StoreError;

    fn try_from(r: ExecutionRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            id: r.id,
            workflow_id: r.workflow_id,
            status: r.status.parse().map_err(StoreError::Decode)?,
            context: r.context,
            current_node: r.current_node,
            pending_job: r.pending_job,
            created_at: r.created_at,
            updated_at: r.updated_at,
            finished_at: r.finished_at,
        })
    }
}

fn collect(records: Vec<ExecutionRecord>) -> Result<Vec<ExecutionRow>, StoreError> {
    records.into_iter().map(ExecutionRow::try_from).collect()
}

/// Create a new execution record in `queued` status.
pub async fn create_execution(
    pool: &PgPool,
    workflow_id: Uuid,
    context: serde_json::Value,
) -> Result<ExecutionRow, StoreError> {
    let now = Utc::now();

    let record = sqlx::query_as::<_, ExecutionRecord>(&format!(
        r#"
        INSERT INTO workflow_executions
            (id, workflow_id, status, context, created_at, updated_at)
        VALUES ($1, $2, 'queued', $3, $4, $4)
        RETURNING {COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(workflow_id)
    .bind(context)
    .bind(now)
    .fetch_one(pool)
    .await?;

    record.try_into()
}

pub async fn get_execution(pool: &PgPool, id: Uuid) -> Result<ExecutionRow, StoreError> {
    sqlx::query_as::<_, ExecutionRecord>(&format!(
        "SELECT {COLUMNS} FROM workflow_executions WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(StoreError::NotFound)?
    .try_into()
}

pub async fn list_executions(pool: &PgPool, workflow_id: Uuid) -> Result<Vec<ExecutionRow>, StoreError> {
    let records = sqlx::query_as::<_, ExecutionRecord>(&format!(
        "SELECT {COLUMNS} FROM workflow_executions WHERE workflow_id = $1 ORDER BY created_at ASC"
    ))
    .bind(workflow_id)
    .fetch_all(pool)
    .await?;

    collect(records)
}

/// Executions still `queued` or `running`.
pub async fn list_unfinished(pool: &PgPool) -> Result<Vec<ExecutionRow>, StoreError> {
    let records = sqlx::query_as::<_, ExecutionRecord>(&format!(
        r#"
        SELECT {COLUMNS} FROM workflow_executions
        WHERE status IN ('queued', 'running')
        ORDER BY created_at ASC
        "#
    ))
    .fetch_all(pool)
    .await?;

    collect(records)
}

/// Write back the mutable part of an execution.
///
/// The current status is read under `FOR UPDATE` so the monotonicity check
/// and the write cannot interleave with a concurrent cancel.
pub async fn save_execution_state(
    pool: &PgPool,
    id: Uuid,
    state: ExecutionState,
) -> Result<ExecutionRow, StoreError> {
    let mut tx = pool.begin().await?;

    let current: String = sqlx::query_scalar(
        "SELECT status FROM workflow_executions WHERE id = $1 FOR UPDATE",
    )
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(StoreError::NotFound)?;
    let current: ExecutionStatus = current.parse().map_err(StoreError::Decode)?;

    if !current.can_transition_to(state.status) {
        tx.rollback().await?;
        return Err(StoreError::InvalidExecutionTransition {
            id,
            from: current,
            to: state.status,
        });
    }

    let now = Utc::now();
    let finished_at = state.status.is_terminal().then_some(now);

    let record = sqlx::query_as::<_, ExecutionRecord>(&format!(
        r#"
        UPDATE workflow_executions
        SET status = $2, context = $3, current_node = $4, pending_job = $5,
            updated_at = $6, finished_at = $7
        WHERE id = $1
        RETURNING {COLUMNS}
        "#
    ))
    .bind(id)
    .bind(state.status.to_string())
    .bind(state.context)
    .bind(state.current_node)
    .bind(state.pending_job)
    .bind(now)
    .bind(finished_at)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    record.try_into()
}
