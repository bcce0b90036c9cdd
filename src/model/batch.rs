use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which pipeline phase a batch belongs to.
///
/// The three phases are independently schedulable; a batch never mixes kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchKind {
    /// Resolve an external reference into candidate records
    Discovery,
    /// Deep-research a discovered record
    Enrichment,
    /// Produce a rendered artifact from enriched data
    Artifact,
}

impl fmt::Display for BatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchKind::Discovery => write!(f, "discovery"),
            BatchKind::Enrichment => write!(f, "enrichment"),
            BatchKind::Artifact => write!(f, "artifact"),
        }
    }
}

/// Aggregate status of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Created, not yet picked up
    Pending,
    /// A pool is (or was) driving its units
    Processing,
    /// Every unit completed
    Complete,
    /// At least one unit exhausted its retry budget
    Failed,
    /// Explicitly cancelled
    Cancelled,
}

impl BatchStatus {
    /// Whether no further automatic transition occurs from this status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Complete | BatchStatus::Failed | BatchStatus::Cancelled
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchStatus::Pending => write!(f, "pending"),
            BatchStatus::Processing => write!(f, "processing"),
            BatchStatus::Complete => write!(f, "complete"),
            BatchStatus::Failed => write!(f, "failed"),
            BatchStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A named collection of units created together and tracked to one aggregate
/// terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecord {
    /// Unique batch id
    pub id: String,

    /// Pipeline phase this batch belongs to
    pub kind: BatchKind,

    /// Aggregate status; terminal iff every unit is terminal
    pub status: BatchStatus,

    /// Set by the cancellation propagator. Feeds finalizer precedence: a
    /// cancelled unit only outranks a failed one when the batch itself was
    /// explicitly cancelled.
    pub cancel_requested: bool,

    /// Number of units created with this batch
    pub unit_count: usize,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last write timestamp
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!BatchStatus::Pending.is_terminal());
        assert!(!BatchStatus::Processing.is_terminal());
        assert!(BatchStatus::Complete.is_terminal());
        assert!(BatchStatus::Failed.is_terminal());
        assert!(BatchStatus::Cancelled.is_terminal());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&BatchStatus::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
    }
}
