use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::agent::{AgentInput, AgentRunner, ProgressEvent};
use crate::model::{BatchKind, BatchStatus, UnitRecord};
use crate::runner::{AttemptError, UnitRunner};
use crate::store::{StatusStore, UnitPatch};

/// Ordered sub-steps for each pipeline phase.
pub fn stages_for(kind: BatchKind) -> &'static [&'static str] {
    match kind {
        BatchKind::Discovery => &["locate", "profile"],
        BatchKind::Enrichment => &["research", "synthesize"],
        BatchKind::Artifact => &["compose", "render"],
    }
}

/// Unit runner that executes the kind's stages through the agent, one call
/// per stage, checkpointing after each.
pub struct StagedRunner {
    store: Arc<dyn StatusStore>,
    agent: Arc<dyn AgentRunner>,
}

impl StagedRunner {
    /// Wire a runner over a store and an agent.
    pub fn new(store: Arc<dyn StatusStore>, agent: Arc<dyn AgentRunner>) -> Self {
        Self { store, agent }
    }

    /// Checkpoint gate: raises `Cancelled` if the token tripped or the batch
    /// was cancelled in the store by another writer.
    async fn check_cancelled(
        &self,
        batch_id: &str,
        cancel: &CancellationToken,
    ) -> Result<BatchKind, AttemptError> {
        if cancel.is_cancelled() {
            return Err(AttemptError::Cancelled);
        }
        let batch = self
            .store
            .batch(batch_id)
            .await
            .map_err(|e| AttemptError::Failed(e.to_string()))?;
        if batch.status == BatchStatus::Cancelled || batch.cancel_requested {
            return Err(AttemptError::Cancelled);
        }
        Ok(batch.kind)
    }
}

#[async_trait]
impl UnitRunner for StagedRunner {
    #[instrument(skip(self, unit, cancel), fields(unit_id = %unit.id, batch_id = %unit.batch_id))]
    async fn run_attempt(
        &self,
        unit: &UnitRecord,
        cancel: &CancellationToken,
    ) -> Result<Value, AttemptError> {
        let kind = self.check_cancelled(&unit.batch_id, cancel).await?;
        let stages = stages_for(kind);

        let mut completed: Map<String, Value> = match &unit.resumable_state {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };

        for (index, stage) in stages.iter().enumerate() {
            // checkpoint between sub-steps; the first stage was gated above
            if index > 0 {
                self.check_cancelled(&unit.batch_id, cancel).await?;
            }

            if completed.contains_key(*stage) {
                debug!(stage, "Skipping sub-step already paid for");
                continue;
            }

            let input = AgentInput {
                kind,
                stage: stage.to_string(),
                payload: unit.input.clone(),
                prior: Value::Object(completed.clone()),
            };

            // the sink is synchronous; buffer events and persist the latest
            // with the stage checkpoint
            let events: Mutex<Vec<ProgressEvent>> = Mutex::new(Vec::new());
            let sink = |event: ProgressEvent| {
                events.lock().expect("progress buffer poisoned").push(event);
            };

            debug!(stage, attempt = unit.attempt_count, "Running sub-step");
            let output = self
                .agent
                .run(input, &sink)
                .await
                .map_err(|e| AttemptError::Failed(e.to_string()))?;

            completed.insert(stage.to_string(), output);

            let mut patch =
                UnitPatch::default().with_resumable_state(Value::Object(completed.clone()));
            if let Some(event) = events.lock().expect("progress buffer poisoned").last() {
                patch = patch.with_progress(event.message.clone());
            }
            self.store
                .update_unit(&unit.id, patch)
                .await
                .map_err(|e| AttemptError::Failed(e.to_string()))?;
            debug!(stage, "Sub-step checkpoint persisted");
        }

        let last_stage = stages.last().expect("every kind has at least one stage");
        Ok(completed
            .get(*last_stage)
            .cloned()
            .unwrap_or(Value::Null))
    }
}
