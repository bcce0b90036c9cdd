use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::model::{BatchRecord, BatchStatus, UnitStatus};
use crate::store::{BatchPatch, StatusStore, Transition, UnitFilter, UnitPatch};
use crate::Result;

/// Cancel a batch: force its status to `Cancelled` immediately and sweep all
/// still-pending units, so nothing else is dispatched.
///
/// Running units are left untouched; they self-cancel the next time their
/// runner reaches a checkpoint and observes the batch status. Termination of
/// in-flight work is therefore eventual, bounded by the agent's next
/// checkpoint interval. A batch that is already terminal is a no-op.
#[instrument(skip(store))]
pub(crate) async fn propagate_cancel(
    store: &Arc<dyn StatusStore>,
    batch_id: &str,
) -> Result<BatchRecord> {
    let outcome = store
        .transition_batch(
            batch_id,
            &[BatchStatus::Pending, BatchStatus::Processing],
            BatchPatch::status(BatchStatus::Cancelled).with_cancel_requested(true),
        )
        .await?;

    let batch = match outcome {
        Transition::Applied(batch) => {
            info!("Batch cancelled");
            batch
        }
        Transition::Rejected(batch) => {
            debug!(status = %batch.status, "Batch already terminal, status untouched");
            batch
        }
    };

    // sweep even when the status write was a no-op; re-cancelling is
    // idempotent and a terminal batch has no pending units left anyway
    let swept = sweep_pending_units(store, batch_id).await?;
    if swept > 0 {
        info!(swept, "Pending units cancelled");
    }
    Ok(batch)
}

/// Mark every still-pending unit of a batch `Cancelled`.
///
/// Guarded per unit, so it is idempotent and safe to race with pool workers:
/// a unit a worker claimed first is simply skipped.
pub(crate) async fn sweep_pending_units(
    store: &Arc<dyn StatusStore>,
    batch_id: &str,
) -> Result<usize> {
    let pending = store
        .find_units(&UnitFilter::batch(batch_id).with_statuses(vec![UnitStatus::Pending]))
        .await?;

    let outcomes = futures::future::join_all(pending.iter().map(|unit| {
        store.transition_unit(
            &unit.id,
            &[UnitStatus::Pending],
            UnitPatch::status(UnitStatus::Cancelled),
        )
    }))
    .await;

    let mut swept = 0;
    for outcome in outcomes {
        if outcome?.was_applied() {
            swept += 1;
        }
    }
    Ok(swept)
}

/// Whether the batch has been cancelled in the store.
pub(crate) async fn batch_cancel_requested(
    store: &Arc<dyn StatusStore>,
    batch_id: &str,
) -> Result<bool> {
    let batch = store.batch(batch_id).await?;
    Ok(batch.status == BatchStatus::Cancelled || batch.cancel_requested)
}
