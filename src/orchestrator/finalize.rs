use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::model::{BatchRecord, BatchStatus, UnitStatus};
use crate::store::{BatchPatch, StatusStore};
use crate::Result;

/// Fold unit outcomes into the batch's aggregate status.
///
/// Idempotent and safe to invoke concurrently: the decision is taken over a
/// snapshot of unit statuses read immediately beforehand, and the write is a
/// guarded transition out of `{Pending, Processing}`: an already-terminal
/// batch (including a sticky `Cancelled`) is returned unchanged, and of two
/// racing finalizers only one write fires.
///
/// Precedence: `Cancelled` if the batch was explicitly cancelled and at least
/// one unit is cancelled; else `Failed` if any unit failed; else `Complete`.
/// While any unit is still `Pending` or `Running` nothing is written.
#[instrument(skip(store))]
pub(crate) async fn finalize_batch(
    store: &Arc<dyn StatusStore>,
    batch_id: &str,
) -> Result<BatchRecord> {
    let units = store.units_in_batch(batch_id).await?;

    if units.iter().any(|u| !u.status.is_terminal()) {
        debug!("Units still in flight, batch left as is");
        return Ok(store.batch(batch_id).await?);
    }

    let batch = store.batch(batch_id).await?;
    if batch.status.is_terminal() {
        debug!(status = %batch.status, "Batch already terminal");
        return Ok(batch);
    }

    let any_cancelled = units.iter().any(|u| u.status == UnitStatus::Cancelled);
    let any_failed = units.iter().any(|u| u.status == UnitStatus::Failed);

    let target = if batch.cancel_requested && any_cancelled {
        BatchStatus::Cancelled
    } else if any_failed {
        BatchStatus::Failed
    } else {
        BatchStatus::Complete
    };

    let outcome = store
        .transition_batch(
            batch_id,
            &[BatchStatus::Pending, BatchStatus::Processing],
            BatchPatch::status(target),
        )
        .await?;
    if outcome.was_applied() {
        info!(status = %target, units = units.len(), "Batch finalized");
    }
    Ok(outcome.into_record())
}
