use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use crate::model::{BatchKind, BatchRecord, BatchStatus, UnitRecord, UnitStatus};
use crate::store::{
    BatchPatch, StatusStore, StoreError, Transition, UnitFilter, UnitPatch,
};

/// In-memory status store.
///
/// Suitable for tests and single-process embedding. Per-record atomicity
/// comes from the dashmap entry lock held across each read-modify-write.
#[derive(Clone, Default)]
pub struct MemoryStatusStore {
    batches: DashMap<String, BatchRecord>,
    units: DashMap<String, UnitRecord>,
    batch_index: DashMap<String, Vec<String>>,
}

impl MemoryStatusStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn apply_unit_patch(unit: &mut UnitRecord, patch: UnitPatch) {
        if let Some(status) = patch.status {
            unit.status = status;
        }
        if let Some(count) = patch.attempt_count {
            unit.attempt_count = count;
        }
        if let Some(output) = patch.output {
            unit.output = Some(output);
        }
        if patch.clear_last_error {
            unit.last_error = None;
        }
        if let Some(message) = patch.last_error {
            unit.last_error = Some(message);
        }
        if let Some(message) = patch.last_progress {
            unit.last_progress = Some(message);
        }
        if patch.clear_resumable_state {
            unit.resumable_state = None;
        }
        if let Some(state) = patch.resumable_state {
            unit.resumable_state = Some(state);
        }
        unit.updated_at = Utc::now();
    }

    fn apply_batch_patch(batch: &mut BatchRecord, patch: BatchPatch) {
        if let Some(status) = patch.status {
            batch.status = status;
        }
        if let Some(requested) = patch.cancel_requested {
            batch.cancel_requested = requested;
        }
        batch.updated_at = Utc::now();
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn create_batch(
        &self,
        kind: BatchKind,
        inputs: Vec<Value>,
        max_attempts: u32,
    ) -> Result<(BatchRecord, Vec<UnitRecord>), StoreError> {
        let now = Utc::now();
        let batch = BatchRecord {
            id: Uuid::new_v4().to_string(),
            kind,
            status: BatchStatus::Pending,
            cancel_requested: false,
            unit_count: inputs.len(),
            created_at: now,
            updated_at: now,
        };

        let units: Vec<UnitRecord> = inputs
            .into_iter()
            .map(|input| UnitRecord {
                id: Uuid::new_v4().to_string(),
                batch_id: batch.id.clone(),
                status: UnitStatus::Pending,
                attempt_count: 0,
                max_attempts,
                input,
                output: None,
                last_error: None,
                last_progress: None,
                resumable_state: None,
                created_at: now,
                updated_at: now,
            })
            .collect();

        let unit_ids: Vec<String> = units.iter().map(|u| u.id.clone()).collect();
        self.batches.insert(batch.id.clone(), batch.clone());
        for unit in &units {
            self.units.insert(unit.id.clone(), unit.clone());
        }
        self.batch_index.insert(batch.id.clone(), unit_ids);

        Ok((batch, units))
    }

    async fn batch(&self, batch_id: &str) -> Result<BatchRecord, StoreError> {
        self.batches
            .get(batch_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::BatchNotFound(batch_id.to_string()))
    }

    async fn unit(&self, unit_id: &str) -> Result<UnitRecord, StoreError> {
        self.units
            .get(unit_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::UnitNotFound(unit_id.to_string()))
    }

    async fn units_in_batch(&self, batch_id: &str) -> Result<Vec<UnitRecord>, StoreError> {
        let ids = self
            .batch_index
            .get(batch_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::BatchNotFound(batch_id.to_string()))?;

        let mut units = Vec::with_capacity(ids.len());
        for id in ids {
            units.push(self.unit(&id).await?);
        }
        Ok(units)
    }

    async fn find_units(&self, filter: &UnitFilter) -> Result<Vec<UnitRecord>, StoreError> {
        let now = Utc::now();
        let mut units: Vec<UnitRecord> = self
            .units
            .iter()
            .filter(|entry| filter.matches(entry.value(), now))
            .map(|entry| entry.value().clone())
            .collect();
        units.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(units)
    }

    async fn count_units(&self, filter: &UnitFilter) -> Result<usize, StoreError> {
        let now = Utc::now();
        Ok(self
            .units
            .iter()
            .filter(|entry| filter.matches(entry.value(), now))
            .count())
    }

    async fn update_unit(&self, unit_id: &str, patch: UnitPatch) -> Result<UnitRecord, StoreError> {
        let mut entry = self
            .units
            .get_mut(unit_id)
            .ok_or_else(|| StoreError::UnitNotFound(unit_id.to_string()))?;
        Self::apply_unit_patch(entry.value_mut(), patch);
        Ok(entry.value().clone())
    }

    async fn transition_unit(
        &self,
        unit_id: &str,
        allowed_from: &[UnitStatus],
        patch: UnitPatch,
    ) -> Result<Transition<UnitRecord>, StoreError> {
        let mut entry = self
            .units
            .get_mut(unit_id)
            .ok_or_else(|| StoreError::UnitNotFound(unit_id.to_string()))?;
        if !allowed_from.contains(&entry.value().status) {
            return Ok(Transition::Rejected(entry.value().clone()));
        }
        Self::apply_unit_patch(entry.value_mut(), patch);
        Ok(Transition::Applied(entry.value().clone()))
    }

    async fn transition_batch(
        &self,
        batch_id: &str,
        allowed_from: &[BatchStatus],
        patch: BatchPatch,
    ) -> Result<Transition<BatchRecord>, StoreError> {
        let mut entry = self
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| StoreError::BatchNotFound(batch_id.to_string()))?;
        if !allowed_from.contains(&entry.value().status) {
            return Ok(Transition::Rejected(entry.value().clone()));
        }
        Self::apply_batch_patch(entry.value_mut(), patch);
        Ok(Transition::Applied(entry.value().clone()))
    }
}
