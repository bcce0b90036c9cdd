use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::model::{BatchStatus, UnitRecord, UnitStatus};
use crate::orchestrator::PipelineConfig;
use crate::runner::{AttemptError, UnitRunner};
use crate::store::{StatusStore, Transition, UnitPatch};
use crate::Result;

/// Drives one unit through its retry budget.
///
/// Attempts are strictly sequential. Every status write is a guarded
/// transition, so a cancellation landing from another writer between reads is
/// never overwritten: the controller observes the rejection and stands down.
pub struct RetryController {
    store: Arc<dyn StatusStore>,
    runner: Arc<dyn UnitRunner>,
    config: PipelineConfig,
}

impl RetryController {
    /// Wire a controller over a store, a unit runner and a config.
    pub fn new(
        store: Arc<dyn StatusStore>,
        runner: Arc<dyn UnitRunner>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            runner,
            config,
        }
    }

    /// Run a unit until it reaches a terminal status or an external write
    /// takes it away. Returns the fresh record.
    #[instrument(skip(self, cancel))]
    pub async fn run_unit(
        &self,
        unit_id: &str,
        cancel: &CancellationToken,
    ) -> Result<UnitRecord> {
        let mut unit = self.store.unit(unit_id).await?;

        loop {
            if unit.status.is_terminal() {
                debug!(status = %unit.status, "Unit already terminal");
                return Ok(unit);
            }

            // checkpoint at the attempt-loop boundary
            if cancel.is_cancelled() || self.batch_cancelled(&unit.batch_id).await? {
                return self.mark_cancelled(&unit).await;
            }

            if unit.attempt_count >= unit.max_attempts {
                // dispatched with an already-exhausted budget
                return self
                    .mark_failed(&unit, Some("retry budget exhausted".to_string()))
                    .await;
            }

            // claim from exactly the status we last read; a rejection means
            // another writer (usually the propagator) won the race
            let claim = self
                .store
                .transition_unit(
                    &unit.id,
                    &[unit.status],
                    UnitPatch::status(UnitStatus::Running)
                        .with_attempt_count(unit.attempt_count + 1)
                        .clearing_last_error(),
                )
                .await?;
            unit = match claim {
                Transition::Applied(fresh) => fresh,
                Transition::Rejected(fresh) => {
                    debug!(status = %fresh.status, "Claim rejected, leaving unit untouched");
                    return Ok(fresh);
                }
            };

            info!(
                attempt = unit.attempt_count,
                max_attempts = unit.max_attempts,
                "Attempt started"
            );

            match self.runner.run_attempt(&unit, cancel).await {
                Ok(output) => {
                    let done = self
                        .store
                        .transition_unit(
                            &unit.id,
                            &[UnitStatus::Running],
                            UnitPatch::status(UnitStatus::Complete)
                                .with_output(output)
                                .clearing_resumable_state(),
                        )
                        .await?;
                    info!(attempt = unit.attempt_count, "Unit complete");
                    return Ok(done.into_record());
                }
                Err(AttemptError::Cancelled) => {
                    return self.mark_cancelled(&unit).await;
                }
                Err(AttemptError::Failed(message)) => {
                    warn!(
                        attempt = unit.attempt_count,
                        max_attempts = unit.max_attempts,
                        error = %message,
                        "Attempt failed"
                    );
                    unit = self
                        .store
                        .update_unit(&unit.id, UnitPatch::default().with_last_error(&*message))
                        .await?;

                    if unit.attempt_count >= unit.max_attempts {
                        return self.mark_failed(&unit, None).await;
                    }

                    let delay = self.backoff_delay(unit.attempt_count);
                    debug!(delay_ms = delay.as_millis() as u64, "Backing off");
                    // the sleep races cancellation so a cancelled batch does
                    // not wait out its backoff
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return self.mark_cancelled(&unit).await;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn batch_cancelled(&self, batch_id: &str) -> Result<bool> {
        let batch = self.store.batch(batch_id).await?;
        Ok(batch.status == BatchStatus::Cancelled || batch.cancel_requested)
    }

    /// Guarded terminal write; a unit already moved by another writer is
    /// returned unchanged.
    async fn mark_cancelled(&self, unit: &UnitRecord) -> Result<UnitRecord> {
        let outcome = self
            .store
            .transition_unit(
                &unit.id,
                &[UnitStatus::Pending, UnitStatus::Running],
                UnitPatch::status(UnitStatus::Cancelled),
            )
            .await?;
        if outcome.was_applied() {
            info!(unit_id = %unit.id, "Unit cancelled");
        }
        Ok(outcome.into_record())
    }

    async fn mark_failed(&self, unit: &UnitRecord, message: Option<String>) -> Result<UnitRecord> {
        let mut patch = UnitPatch::status(UnitStatus::Failed);
        if let Some(message) = message {
            patch = patch.with_last_error(message);
        }
        let outcome = self
            .store
            .transition_unit(
                &unit.id,
                &[UnitStatus::Pending, UnitStatus::Running],
                patch,
            )
            .await?;
        if outcome.was_applied() {
            warn!(
                unit_id = %unit.id,
                attempts = unit.attempt_count,
                "Unit failed, retry budget exhausted"
            );
        }
        Ok(outcome.into_record())
    }

    /// Exponential backoff: `base ^ attempt` seconds, capped, with optional
    /// jitter of up to 10%.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_base_seconds.max(1);
        let seconds = base.checked_pow(attempt).unwrap_or(u64::MAX);
        let mut delay = Duration::from_secs(seconds).min(self.config.max_backoff);
        if self.config.jitter {
            let jitter_ms = (delay.as_millis() as f64 * rand::random::<f64>() * 0.1) as u64;
            delay += Duration::from_millis(jitter_ms);
        }
        delay
    }
}
