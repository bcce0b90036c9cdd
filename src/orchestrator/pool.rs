use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::model::{BatchRecord, UnitStatus};
use crate::orchestrator::{cancel, finalize, PipelineConfig, RetryController};
use crate::store::{StatusStore, UnitFilter};
use crate::Result;

/// Run every pending unit of a batch to a terminal status, then finalize.
///
/// `min(ceiling, pending)` workers claim unit ids from a shared cursor; there
/// is no work-stealing and no cross-worker state beyond the cursor and the
/// store. All-settled semantics: a unit's failure never halts its siblings,
/// and the pool waits for every worker before finalizing exactly once.
#[instrument(skip(store, controller, config, cancel_token))]
pub(crate) async fn run_pool(
    store: Arc<dyn StatusStore>,
    controller: Arc<RetryController>,
    config: &PipelineConfig,
    batch_id: &str,
    cancel_token: CancellationToken,
) -> Result<BatchRecord> {
    let pending = store
        .find_units(&UnitFilter::batch(batch_id).with_statuses(vec![UnitStatus::Pending]))
        .await?;
    let queue: Arc<Vec<String>> = Arc::new(pending.into_iter().map(|u| u.id).collect());

    let worker_count = config.concurrency_ceiling.max(1).min(queue.len());
    info!(
        pending = queue.len(),
        workers = worker_count,
        "Pool starting"
    );

    let cursor = Arc::new(AtomicUsize::new(0));
    let mut workers = JoinSet::new();

    for worker in 0..worker_count {
        let store = store.clone();
        let controller = controller.clone();
        let queue = queue.clone();
        let cursor = cursor.clone();
        let cancel_token = cancel_token.clone();
        let batch_id = batch_id.to_string();

        workers.spawn(async move {
            loop {
                let index = cursor.fetch_add(1, Ordering::SeqCst);
                if index >= queue.len() {
                    break;
                }
                let unit_id = &queue[index];

                // re-check batch-level cancellation before paying for a
                // dispatch; remaining pending units are swept, never run.
                // routed through the propagator so a token-only cancel is
                // also persisted before the finalizer reads the batch
                match batch_cancelled(&store, &batch_id, &cancel_token).await {
                    Ok(true) => {
                        if let Err(error) = cancel::propagate_cancel(&store, &batch_id).await {
                            warn!(error = %error, "Cancel propagation failed");
                        }
                        debug!(worker, "Batch cancelled, worker standing down");
                        break;
                    }
                    Ok(false) => {}
                    Err(error) => {
                        warn!(error = %error, "Cancellation re-check failed, dispatching anyway");
                    }
                }

                if let Err(error) = controller.run_unit(unit_id, &cancel_token).await {
                    error!(unit_id = %unit_id, error = %error, "Unit driver error");
                }
            }
        });
    }

    // all-settled: wait for every worker regardless of individual outcomes
    while let Some(joined) = workers.join_next().await {
        if let Err(error) = joined {
            error!(error = %error, "Pool worker panicked");
        }
    }

    let batch = finalize::finalize_batch(&store, batch_id).await?;
    info!(status = %batch.status, "Pool finished");
    Ok(batch)
}

async fn batch_cancelled(
    store: &Arc<dyn StatusStore>,
    batch_id: &str,
    cancel_token: &CancellationToken,
) -> Result<bool> {
    if cancel_token.is_cancelled() {
        return Ok(true);
    }
    cancel::batch_cancel_requested(store, batch_id).await
}
