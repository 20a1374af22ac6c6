//! Row structs for the store's tables, plus the status enums both backends
//! persist as lowercase text.
//!
//! These are *persistence* models. Workflow graphs and the accumulated
//! execution context are opaque JSON here; their shape belongs to the
//! `engine` crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// workflows
// ---------------------------------------------------------------------------

/// A persisted workflow definition row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowRow {
    pub id: Uuid,
    pub name: String,
    pub enabled: bool,
    /// Full JSON workflow definition (trigger, nodes, edges, …)
    pub definition: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// workflow_executions
// ---------------------------------------------------------------------------

/// Lifecycle of one workflow run.
///
/// `Queued → Running → {Resolved, Failed, Cancelled}`. The last three are
/// terminal; a row never leaves a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Resolved,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Failed | Self::Cancelled)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Running => 1,
            Self::Resolved | Self::Failed | Self::Cancelled => 2,
        }
    }

    /// Whether a row in this status may be saved with `next`.
    ///
    /// Saving the same non-terminal status again is allowed (context
    /// updates while running); moving backwards or out of a terminal status
    /// is not.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Resolved => write!(f, "resolved"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "resolved" => Ok(Self::Resolved),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// A persisted workflow execution row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub status: ExecutionStatus,
    /// Accumulated context (trigger payload and job results).
    pub context: serde_json::Value,
    /// Node whose job runs next, or whose job is pending.
    pub current_node: Option<String>,
    /// Set while the execution is parked on an asynchronous job.
    pub pending_job: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionRow {
    pub fn is_awaiting(&self) -> bool {
        self.pending_job.is_some()
    }
}

/// The mutable part of an execution, written back after every step.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionState {
    pub status: ExecutionStatus,
    pub context: serde_json::Value,
    pub current_node: Option<String>,
    pub pending_job: Option<Uuid>,
}

impl ExecutionState {
    pub fn from_row(row: &ExecutionRow) -> Self {
        Self {
            status: row.status,
            context: row.context.clone(),
            current_node: row.current_node.clone(),
            pending_job: row.pending_job,
        }
    }
}

// ---------------------------------------------------------------------------
// jobs
// ---------------------------------------------------------------------------

/// Status of a single node invocation.
///
/// `Pending` is the only non-terminal status; it moves to a terminal one
/// exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Resolved,
    Failed,
    /// The owning execution was cancelled while the job was in flight.
    Aborted,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Resolved => write!(f, "resolved"),
            Self::Failed => write!(f, "failed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "resolved" => Ok(Self::Resolved),
            "failed" => Ok(Self::Failed),
            "aborted" => Ok(Self::Aborted),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A persisted job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRow {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
    pub status: JobStatus,
    /// Handler-defined result payload.
    pub result: serde_json::Value,
    /// Outcome label used to select the successor edge.
    pub port: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Values for a new job row.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub execution_id: Uuid,
    pub node_id: String,
    pub status: JobStatus,
    pub result: serde_json::Value,
    pub port: String,
}

/// Settlement written to a pending job.
#[derive(Debug, Clone)]
pub struct JobUpdate {
    pub status: JobStatus,
    pub result: serde_json::Value,
    pub port: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_status_is_monotonic() {
        use ExecutionStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Queued.can_transition_to(Failed));
        assert!(Running.can_transition_to(Running));
        assert!(Running.can_transition_to(Cancelled));
        assert!(!Running.can_transition_to(Queued));
        for terminal in [Resolved, Failed, Cancelled] {
            for next in [Queued, Running, Resolved, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn statuses_round_trip_through_text() {
        for status in ["queued", "running", "resolved", "failed", "cancelled"] {
            let parsed: ExecutionStatus = status.parse().unwrap();
            assert_eq!(parsed.to_string(), status);
        }
        assert!("done".parse::<ExecutionStatus>().is_err());
        assert_eq!(serde_json::to_value(JobStatus::Aborted).unwrap(), "aborted");
    }
}
