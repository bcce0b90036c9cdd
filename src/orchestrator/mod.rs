//! Batch orchestration
//!
//! This module provides the engine that drives batches: the bounded
//! concurrency pool, the retry controller, the batch finalizer, the
//! cancellation propagator and the recovery helpers, fronted by the
//! [`Pipeline`] facade.
//!
//! Every entry point is safe to call while a previous invocation is logically
//! still in flight: double-dispatch is prevented by status gating, and all
//! racing status writes are guarded transitions.

mod cancel;
mod config;
mod finalize;
mod pool;
mod recovery;
mod retry;

pub use config::PipelineConfig;
pub use retry::RetryController;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::agent::AgentRunner;
use crate::model::{BatchKind, BatchRecord, BatchStatus, UnitRecord, UnitStatus};
use crate::runner::{StagedRunner, UnitRunner};
use crate::store::{BatchPatch, StatusStore, Transition};
use crate::Result;

/// A spawned, independently-cancellable task driving one batch's pool.
///
/// The work reports progress solely through the status store, so the task
/// survives its handle: dropping a `BatchTask` detaches the work rather than
/// aborting it (the calling scope may not live to see completion).
pub struct BatchTask {
    batch_id: String,
    cancel: CancellationToken,
    handle: JoinHandle<Result<BatchRecord>>,
}

impl BatchTask {
    /// The batch this task is driving.
    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    /// Request cooperative cancellation of the in-process workers. The pool
    /// persists batch-level cancellation when it observes the token, so this
    /// is equivalent to [`Pipeline::cancel_batch`] minus the immediate store
    /// write.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the pool has finished.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the pool to finish and return the finalized batch.
    pub async fn join(self) -> Result<BatchRecord> {
        self.handle.await?
    }
}

/// A spawned task driving a single unit.
pub struct UnitTask {
    unit_id: String,
    handle: JoinHandle<Result<UnitRecord>>,
}

impl UnitTask {
    /// The unit this task is driving.
    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    /// Wait for the unit to reach a terminal status.
    pub async fn join(self) -> Result<UnitRecord> {
        self.handle.await?
    }
}

/// Facade over the whole engine: create, start, cancel, retry, recover.
pub struct Pipeline {
    store: Arc<dyn StatusStore>,
    controller: Arc<RetryController>,
    config: PipelineConfig,
    tasks: Arc<DashMap<String, CancellationToken>>,
}

impl Pipeline {
    /// Wire a pipeline over a store and an agent, using the staged unit
    /// runner.
    pub fn new(
        store: Arc<dyn StatusStore>,
        agent: Arc<dyn AgentRunner>,
        config: PipelineConfig,
    ) -> Self {
        let runner: Arc<dyn UnitRunner> = Arc::new(StagedRunner::new(store.clone(), agent));
        Self::with_runner(store, runner, config)
    }

    /// Wire a pipeline with a custom unit runner.
    pub fn with_runner(
        store: Arc<dyn StatusStore>,
        runner: Arc<dyn UnitRunner>,
        config: PipelineConfig,
    ) -> Self {
        let controller = Arc::new(RetryController::new(
            store.clone(),
            runner,
            config.clone(),
        ));
        Self {
            store,
            controller,
            config,
            tasks: Arc::new(DashMap::new()),
        }
    }

    /// The store this pipeline writes through.
    pub fn store(&self) -> &Arc<dyn StatusStore> {
        &self.store
    }

    /// Create a batch and its pending units in one logical operation.
    pub async fn create_batch(
        &self,
        kind: BatchKind,
        inputs: Vec<Value>,
    ) -> Result<(BatchRecord, Vec<UnitRecord>)> {
        let (batch, units) = self
            .store
            .create_batch(kind, inputs, self.config.max_attempts)
            .await?;
        info!(batch_id = %batch.id, kind = %batch.kind, units = units.len(), "Batch created");
        Ok((batch, units))
    }

    /// Start driving a batch's pending units in the background.
    ///
    /// Returns `None` without dispatching anything when the batch is already
    /// terminal or a pool task for it is still live.
    #[instrument(skip(self))]
    pub async fn start_batch(&self, batch_id: &str) -> Result<Option<BatchTask>> {
        let outcome = self
            .store
            .transition_batch(
                batch_id,
                &[BatchStatus::Pending, BatchStatus::Processing],
                BatchPatch::status(BatchStatus::Processing),
            )
            .await?;
        match outcome {
            Transition::Applied(batch) => Ok(self.spawn_pool_task(batch.id)),
            Transition::Rejected(batch) => {
                debug!(status = %batch.status, "Start on a terminal batch, no-op");
                Ok(None)
            }
        }
    }

    /// Cancel a batch: persisted status first (the source of truth), then the
    /// in-process token of its live pool task, if any.
    #[instrument(skip(self))]
    pub async fn cancel_batch(&self, batch_id: &str) -> Result<BatchRecord> {
        let batch = cancel::propagate_cancel(&self.store, batch_id).await?;
        if let Some(entry) = self.tasks.get(batch_id) {
            entry.value().cancel();
        }
        Ok(batch)
    }

    /// Reset a batch's `Failed` and `Cancelled` units to `Pending` and resume
    /// pooled execution. `Complete` units are untouched; attempt counts are
    /// preserved unless `zero_attempts`. Retrying a `Complete` batch is a
    /// no-op.
    #[instrument(skip(self))]
    pub async fn retry_failed(
        &self,
        batch_id: &str,
        zero_attempts: bool,
    ) -> Result<Option<BatchTask>> {
        let reset = recovery::reset_failed_units(&self.store, batch_id, zero_attempts).await?;

        // the explicit external reset of the batch state machine; a revived
        // batch also sheds its cancel flag
        let outcome = self
            .store
            .transition_batch(
                batch_id,
                &[
                    BatchStatus::Pending,
                    BatchStatus::Processing,
                    BatchStatus::Failed,
                    BatchStatus::Cancelled,
                ],
                BatchPatch::status(BatchStatus::Processing).with_cancel_requested(false),
            )
            .await?;
        match outcome {
            Transition::Applied(batch) => {
                info!(reset = reset.len(), "Retrying batch");
                Ok(self.spawn_pool_task(batch.id))
            }
            Transition::Rejected(batch) => {
                debug!(status = %batch.status, "Retry on a complete batch, no-op");
                Ok(None)
            }
        }
    }

    /// Drive a single unit in the background. A unit that is not `Pending` is
    /// a no-op returning `None`.
    #[instrument(skip(self))]
    pub async fn run_unit(&self, unit_id: &str) -> Result<Option<UnitTask>> {
        let unit = self.store.unit(unit_id).await?;
        if unit.status != UnitStatus::Pending {
            debug!(status = %unit.status, "Unit not pending, run is a no-op");
            return Ok(None);
        }

        let store = self.store.clone();
        let controller = self.controller.clone();
        let id = unit.id.clone();
        let batch_id = unit.batch_id.clone();
        let handle = tokio::spawn(async move {
            // no in-process token is registered here; cancellation reaches
            // the unit through the persisted batch status checkpoints
            let cancel = CancellationToken::new();
            let result = controller.run_unit(&id, &cancel).await;
            if let Err(error) = finalize::finalize_batch(&store, &batch_id).await {
                error!(batch_id = %batch_id, error = %error, "Finalize after unit run failed");
            }
            result
        });

        Ok(Some(UnitTask {
            unit_id: unit.id,
            handle,
        }))
    }

    /// Fold unit outcomes into the batch status (exposed for recovery
    /// tooling; the pool calls this itself).
    pub async fn finalize_batch(&self, batch_id: &str) -> Result<BatchRecord> {
        finalize::finalize_batch(&self.store, batch_id).await
    }

    /// Units stuck `Running` with no write for longer than `older_than`
    /// (default: the configured staleness horizon). These are orphans of a
    /// dead process; recover them with [`Pipeline::reset_unit`].
    pub async fn stale_units(&self, older_than: Option<Duration>) -> Result<Vec<UnitRecord>> {
        recovery::stale_units(&self.store, older_than.unwrap_or(self.config.stale_after)).await
    }

    /// Manual recovery: push a `Running` (orphaned), `Failed` or `Cancelled`
    /// unit back to `Pending`.
    pub async fn reset_unit(&self, unit_id: &str, zero_attempts: bool) -> Result<UnitRecord> {
        recovery::reset_unit(&self.store, unit_id, zero_attempts).await
    }

    /// Spawn the pool as a detached task, registered so `cancel_batch` can
    /// reach its token. Returns `None` if a pool for this batch is already
    /// live.
    fn spawn_pool_task(&self, batch_id: String) -> Option<BatchTask> {
        use dashmap::mapref::entry::Entry;

        let token = CancellationToken::new();
        match self.tasks.entry(batch_id.clone()) {
            Entry::Occupied(_) => {
                debug!(batch_id = %batch_id, "Pool already live, start is a no-op");
                return None;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(token.clone());
            }
        }

        let store = self.store.clone();
        let controller = self.controller.clone();
        let config = self.config.clone();
        let tasks = self.tasks.clone();
        let task_token = token.clone();
        let id = batch_id.clone();

        let handle = tokio::spawn(async move {
            let result = pool::run_pool(store, controller, &config, &id, task_token).await;
            tasks.remove(&id);
            if let Err(error) = &result {
                error!(batch_id = %id, error = %error, "Batch task ended with error");
            }
            result
        });

        Some(BatchTask {
            batch_id,
            cancel: token,
            handle,
        })
    }
}
