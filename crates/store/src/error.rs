//! Typed error type for the store crate.

use thiserror::Error;
use uuid::Uuid;

use crate::models::{ExecutionStatus, JobStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("row not found")]
    NotFound,

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A stored column held a value the row type cannot represent.
    #[error("corrupt row: {0}")]
    Decode(String),

    /// The save would move an execution backwards or out of a terminal status.
    #[error("execution {id} cannot move from {from} to {to}")]
    InvalidExecutionTransition {
        id: Uuid,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    /// The job already settled; settlements are applied exactly once.
    #[error("job {id} cannot move from {from} to {to}")]
    InvalidJobTransition {
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    /// No new jobs may be recorded for a terminal execution.
    #[error("execution {id} is already {status}")]
    ExecutionFinished {
        id: Uuid,
        status: ExecutionStatus,
    },
}

impl StoreError {
    /// True for the rejections that guard state-machine invariants, as
    /// opposed to the backing store being unavailable.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::InvalidExecutionTransition { .. }
                | Self::InvalidJobTransition { .. }
                | Self::ExecutionFinished { .. }
        )
    }
}
