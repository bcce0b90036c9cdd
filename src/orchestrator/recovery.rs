use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::model::{UnitRecord, UnitStatus};
use crate::store::{StatusStore, Transition, UnitFilter, UnitPatch};
use crate::{PipelineError, Result};

/// Reset a batch's `Failed` and `Cancelled` units back to `Pending` so a new
/// pool run picks them up. `Complete` units are never touched. Attempt counts
/// are preserved unless `zero_attempts` is set, which grants a full fresh
/// budget.
#[instrument(skip(store))]
pub(crate) async fn reset_failed_units(
    store: &Arc<dyn StatusStore>,
    batch_id: &str,
    zero_attempts: bool,
) -> Result<Vec<UnitRecord>> {
    let candidates = store
        .find_units(
            &UnitFilter::batch(batch_id)
                .with_statuses(vec![UnitStatus::Failed, UnitStatus::Cancelled]),
        )
        .await?;

    let mut reset = Vec::with_capacity(candidates.len());
    for unit in candidates {
        let mut patch = UnitPatch::status(UnitStatus::Pending);
        if zero_attempts {
            patch = patch.with_attempt_count(0);
        }
        let outcome = store
            .transition_unit(
                &unit.id,
                &[UnitStatus::Failed, UnitStatus::Cancelled],
                patch,
            )
            .await?;
        if let Transition::Applied(fresh) = outcome {
            reset.push(fresh);
        }
    }

    info!(reset = reset.len(), zero_attempts, "Units reset for retry");
    Ok(reset)
}

/// Units stuck `Running` with no write for longer than `older_than`.
///
/// A unit in this state was orphaned by a process that died without writing a
/// terminal status. There is no lease or heartbeat self-healing; detection is
/// this query and recovery is an explicit [`reset_unit`].
pub(crate) async fn stale_units(
    store: &Arc<dyn StatusStore>,
    older_than: std::time::Duration,
) -> Result<Vec<UnitRecord>> {
    let horizon = chrono::Duration::from_std(older_than)
        .map_err(|e| PipelineError::Internal(format!("staleness horizon out of range: {e}")))?;
    store
        .find_units(&UnitFilter::default().running_longer_than(horizon))
        .await
        .map_err(Into::into)
}

/// Manual recovery: push a `Running` (orphaned), `Failed` or `Cancelled` unit
/// back to `Pending`. A `Complete` unit is never reset; the call is a no-op
/// returning the unchanged record.
#[instrument(skip(store))]
pub(crate) async fn reset_unit(
    store: &Arc<dyn StatusStore>,
    unit_id: &str,
    zero_attempts: bool,
) -> Result<UnitRecord> {
    let mut patch = UnitPatch::status(UnitStatus::Pending);
    if zero_attempts {
        patch = patch.with_attempt_count(0);
    }
    let outcome = store
        .transition_unit(
            unit_id,
            &[
                UnitStatus::Running,
                UnitStatus::Failed,
                UnitStatus::Cancelled,
            ],
            patch,
        )
        .await?;
    match &outcome {
        Transition::Applied(unit) => {
            info!(attempts = unit.attempt_count, "Unit reset to pending")
        }
        Transition::Rejected(unit) => {
            debug!(status = %unit.status, "Reset refused, unit not resettable")
        }
    }
    Ok(outcome.into_record())
}
