use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle status of a single unit of work.
///
/// `Pending → Running → {Complete, Failed, Cancelled}`. `Failed` and
/// `Cancelled` may be externally reset back to `Pending`; `Complete` is
/// permanently terminal. A unit observed `Running` outside an active attempt
/// loop is orphaned (the driving process died), not a valid steady state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    /// Waiting to be claimed by a pool worker
    Pending,
    /// An attempt loop holds this unit
    Running,
    /// Finished with a result payload
    Complete,
    /// Retry budget exhausted
    Failed,
    /// Cancelled at a checkpoint or before dispatch
    Cancelled,
}

impl UnitStatus {
    /// Whether no further automatic transition occurs from this status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UnitStatus::Complete | UnitStatus::Failed | UnitStatus::Cancelled
        )
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitStatus::Pending => write!(f, "pending"),
            UnitStatus::Running => write!(f, "running"),
            UnitStatus::Complete => write!(f, "complete"),
            UnitStatus::Failed => write!(f, "failed"),
            UnitStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One item of work in a batch: one lookup, one enrichment, one artifact
/// render.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitRecord {
    /// Unique unit id
    pub id: String,

    /// Owning batch
    pub batch_id: String,

    /// Current lifecycle status
    pub status: UnitStatus,

    /// Attempts consumed so far; never exceeds `max_attempts`
    pub attempt_count: u32,

    /// Retry budget for this unit
    pub max_attempts: u32,

    /// Opaque input handed to the agent (profile reference, record id, ...)
    pub input: Value,

    /// Result payload, present once the unit is `Complete`
    pub output: Option<Value>,

    /// Message of the most recent failure; cleared when a new attempt starts
    pub last_error: Option<String>,

    /// Most recent human-readable progress event from the agent
    pub last_progress: Option<String>,

    /// Partial progress persisted by completed sub-steps. Survives retries so
    /// a later attempt skips already-paid-for work.
    pub resumable_state: Option<Value>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last write timestamp; staleness detection keys off this
    pub updated_at: DateTime<Utc>,
}

impl UnitRecord {
    /// Remaining retry budget.
    pub fn attempts_left(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt_count)
    }
}
