//! Status store: the durable record of batches and units
//!
//! The store is the only synchronization point in the system. Every write
//! targets a single record by id and is atomic per record; no multi-record
//! transaction is assumed. Status writes that race other writers go through
//! [`StatusStore::transition_unit`] / [`StatusStore::transition_batch`],
//! guarded conditional updates that refuse to fire unless the record's current
//! status is in the allowed set. That guard is what keeps a concurrently
//! cancelled unit from being resurrected to running.

mod memory;

pub use memory::MemoryStatusStore;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::model::{BatchKind, BatchRecord, BatchStatus, UnitRecord, UnitStatus};

/// Errors raised by status store implementations
#[derive(Error, Debug)]
pub enum StoreError {
    /// No batch with the given id
    #[error("Batch not found: {0}")]
    BatchNotFound(String),

    /// No unit with the given id
    #[error("Unit not found: {0}")]
    UnitNotFound(String),

    /// Record could not be serialized or deserialized
    #[error("Invalid record data: {0}")]
    InvalidData(#[from] serde_json::Error),

    /// Backend-specific failure
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Outcome of a guarded status transition.
#[derive(Debug, Clone)]
pub enum Transition<T> {
    /// The guard matched and the write was applied
    Applied(T),
    /// The record's current status was outside the allowed set; nothing was
    /// written
    Rejected(T),
}

impl<T> Transition<T> {
    /// The fresh record, whether or not the write fired.
    pub fn into_record(self) -> T {
        match self {
            Transition::Applied(record) | Transition::Rejected(record) => record,
        }
    }

    /// Whether the write fired.
    pub fn was_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }
}

/// Partial update of a unit record.
///
/// `None` fields are left untouched. The `clear_*` flags erase fields that a
/// plain `Option` could not distinguish from "leave alone".
#[derive(Debug, Clone, Default)]
pub struct UnitPatch {
    /// New status
    pub status: Option<UnitStatus>,
    /// New attempt count
    pub attempt_count: Option<u32>,
    /// Result payload
    pub output: Option<Value>,
    /// Failure message
    pub last_error: Option<String>,
    /// Erase `last_error`
    pub clear_last_error: bool,
    /// Latest human-readable progress message
    pub last_progress: Option<String>,
    /// Checkpointed partial progress
    pub resumable_state: Option<Value>,
    /// Erase `resumable_state`
    pub clear_resumable_state: bool,
}

impl UnitPatch {
    /// Patch that only moves the status.
    pub fn status(status: UnitStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Set the attempt count.
    pub fn with_attempt_count(mut self, count: u32) -> Self {
        self.attempt_count = Some(count);
        self
    }

    /// Set the result payload.
    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    /// Set the failure message.
    pub fn with_last_error(mut self, message: impl Into<String>) -> Self {
        self.last_error = Some(message.into());
        self
    }

    /// Erase the failure message.
    pub fn clearing_last_error(mut self) -> Self {
        self.clear_last_error = true;
        self
    }

    /// Set the latest progress message.
    pub fn with_progress(mut self, message: impl Into<String>) -> Self {
        self.last_progress = Some(message.into());
        self
    }

    /// Set the checkpointed partial progress.
    pub fn with_resumable_state(mut self, state: Value) -> Self {
        self.resumable_state = Some(state);
        self
    }

    /// Erase the checkpointed partial progress.
    pub fn clearing_resumable_state(mut self) -> Self {
        self.clear_resumable_state = true;
        self
    }
}

/// Partial update of a batch record.
#[derive(Debug, Clone, Default)]
pub struct BatchPatch {
    /// New status
    pub status: Option<BatchStatus>,
    /// New cancel-requested flag
    pub cancel_requested: Option<bool>,
}

impl BatchPatch {
    /// Patch that only moves the status.
    pub fn status(status: BatchStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Set the cancel-requested flag.
    pub fn with_cancel_requested(mut self, requested: bool) -> Self {
        self.cancel_requested = Some(requested);
        self
    }
}

/// Query over unit records.
#[derive(Debug, Clone, Default)]
pub struct UnitFilter {
    /// Restrict to one batch
    pub batch_id: Option<String>,
    /// Restrict to these statuses
    pub statuses: Option<Vec<UnitStatus>>,
    /// Restrict to `Running` units whose last write is older than this.
    /// Implies `Running`; used for orphan detection.
    pub running_longer_than: Option<chrono::Duration>,
}

impl UnitFilter {
    /// Filter down to one batch.
    pub fn batch(batch_id: impl Into<String>) -> Self {
        Self {
            batch_id: Some(batch_id.into()),
            ..Self::default()
        }
    }

    /// Restrict to the given statuses.
    pub fn with_statuses(mut self, statuses: impl Into<Vec<UnitStatus>>) -> Self {
        self.statuses = Some(statuses.into());
        self
    }

    /// Restrict to running units stale for longer than `horizon`.
    pub fn running_longer_than(mut self, horizon: chrono::Duration) -> Self {
        self.running_longer_than = Some(horizon);
        self
    }

    /// Whether a record matches this filter at time `now`.
    pub fn matches(&self, unit: &UnitRecord, now: chrono::DateTime<chrono::Utc>) -> bool {
        if let Some(batch_id) = &self.batch_id {
            if &unit.batch_id != batch_id {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&unit.status) {
                return false;
            }
        }
        if let Some(horizon) = self.running_longer_than {
            if unit.status != UnitStatus::Running || now - unit.updated_at < horizon {
                return false;
            }
        }
        true
    }
}

/// Durable record of batch and unit entities.
///
/// Implementations must make `update_unit` and the `transition_*` methods
/// atomic per record; last write wins between unconditional updates.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Create a batch and its pending units in one logical operation.
    async fn create_batch(
        &self,
        kind: BatchKind,
        inputs: Vec<Value>,
        max_attempts: u32,
    ) -> Result<(BatchRecord, Vec<UnitRecord>), StoreError>;

    /// Fetch a batch by id.
    async fn batch(&self, batch_id: &str) -> Result<BatchRecord, StoreError>;

    /// Fetch a unit by id.
    async fn unit(&self, unit_id: &str) -> Result<UnitRecord, StoreError>;

    /// All units of a batch, in creation order.
    async fn units_in_batch(&self, batch_id: &str) -> Result<Vec<UnitRecord>, StoreError>;

    /// Units matching a filter.
    async fn find_units(&self, filter: &UnitFilter) -> Result<Vec<UnitRecord>, StoreError>;

    /// Number of units matching a filter.
    async fn count_units(&self, filter: &UnitFilter) -> Result<usize, StoreError>;

    /// Unconditional partial update of a unit record.
    async fn update_unit(&self, unit_id: &str, patch: UnitPatch) -> Result<UnitRecord, StoreError>;

    /// Guarded update: apply `patch` only if the unit's current status is in
    /// `allowed_from`. Returns the fresh record either way.
    async fn transition_unit(
        &self,
        unit_id: &str,
        allowed_from: &[UnitStatus],
        patch: UnitPatch,
    ) -> Result<Transition<UnitRecord>, StoreError>;

    /// Guarded update: apply `patch` only if the batch's current status is in
    /// `allowed_from`. Returns the fresh record either way.
    async fn transition_batch(
        &self,
        batch_id: &str,
        allowed_from: &[BatchStatus],
        patch: BatchPatch,
    ) -> Result<Transition<BatchRecord>, StoreError>;
}
