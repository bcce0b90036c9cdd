//! Unit execution
//!
//! A unit attempt is a walk through the ordered sub-steps ("stages") of its
//! batch kind. Stage boundaries are the cancellation checkpoints and the
//! granularity of resumable state: each completed stage is persisted before
//! the next one starts, so a retry after a failure never re-pays for work a
//! previous attempt already finished.

mod stages;

pub use stages::{stages_for, StagedRunner};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::model::UnitRecord;

/// Why a unit attempt did not complete.
#[derive(Error, Debug)]
pub enum AttemptError {
    /// Cooperative cancellation observed at a checkpoint. Distinct from
    /// failure; consumes no retry budget semantics.
    #[error("Attempt cancelled at a checkpoint")]
    Cancelled,

    /// The attempt failed and may be retried while budget remains.
    #[error("Attempt failed: {0}")]
    Failed(String),
}

/// Drives one attempt of one unit through the external agent operation.
#[async_trait]
pub trait UnitRunner: Send + Sync {
    /// Run a single attempt to completion, returning the unit's result
    /// payload.
    ///
    /// Implementations read partial progress off `unit.resumable_state`,
    /// persist new checkpoints through the store as sub-steps complete, and
    /// check `cancel` (plus the persisted batch status) at every checkpoint.
    async fn run_attempt(
        &self,
        unit: &UnitRecord,
        cancel: &CancellationToken,
    ) -> Result<Value, AttemptError>;
}
