//! Workflow definition rows.

use sqlx::PgPool;
use uuid::Uuid;

use crate::{StoreError, models::WorkflowRow};

/// Insert (or replace) a workflow definition.
///
/// `definition` must be a JSON object produced by serialising the domain
/// `Workflow` type from the `engine` crate.
pub async fn upsert_workflow(pool: &PgPool, workflow: &WorkflowRow) -> Result<WorkflowRow, StoreError> {
    let row = sqlx::query_as::<_, WorkflowRow>(
        r#"
        INSERT INTO workflows (id, name, enabled, definition, created_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name,
                enabled = EXCLUDED.enabled,
                definition = EXCLUDED.definition
        RETURNING id, name, enabled, definition, created_at
        "#,
    )
    .bind(workflow.id)
    .bind(&workflow.name)
    .bind(workflow.enabled)
    .bind(&workflow.definition)
    .bind(workflow.created_at)
    .fetch_one(pool)
    .await?;

    Ok(row)
}

/// Fetch a single workflow by its primary key.
pub async fn get_workflow(pool: &PgPool, id: Uuid) -> Result<WorkflowRow, StoreError> {
    sqlx::query_as::<_, WorkflowRow>(
        r#"SELECT id, name, enabled, definition, created_at FROM workflows WHERE id = $1"#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(StoreError::NotFound)
}
