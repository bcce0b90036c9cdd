//! Batch finalizer tests
//!
//! The finalizer folds a fresh snapshot of unit statuses into the batch:
//! no-op while anything is in flight, cancelled before failed before
//! complete, idempotent, and safe when invoked concurrently.

use std::sync::Arc;

use dossier::agent::ScriptedAgent;
use dossier::model::{BatchKind, BatchStatus, UnitStatus};
use dossier::orchestrator::{Pipeline, PipelineConfig};
use dossier::store::{BatchPatch, MemoryStatusStore, UnitPatch};
use pretty_assertions::assert_eq;
use serde_json::json;

#[tokio::test]
async fn no_op_while_units_in_flight() {
    let (pipeline, batch_id, unit_ids) = seeded_batch(2).await;
    mark(&pipeline, &unit_ids[0], UnitStatus::Complete).await;
    mark(&pipeline, &unit_ids[1], UnitStatus::Running).await;

    let batch = pipeline.finalize_batch(&batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Processing);
}

#[tokio::test]
async fn all_complete_finalizes_complete() {
    let (pipeline, batch_id, unit_ids) = seeded_batch(2).await;
    for id in &unit_ids {
        mark(&pipeline, id, UnitStatus::Complete).await;
    }

    let batch = pipeline.finalize_batch(&batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Complete);
}

#[tokio::test]
async fn any_failure_beats_complete() {
    let (pipeline, batch_id, unit_ids) = seeded_batch(3).await;
    mark(&pipeline, &unit_ids[0], UnitStatus::Complete).await;
    mark(&pipeline, &unit_ids[1], UnitStatus::Failed).await;
    mark(&pipeline, &unit_ids[2], UnitStatus::Complete).await;

    let batch = pipeline.finalize_batch(&batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Failed);
}

#[tokio::test]
async fn cancelled_units_without_batch_cancel_do_not_outrank() {
    // cancellation outranks failure only when the batch itself was
    // explicitly cancelled
    let (pipeline, batch_id, unit_ids) = seeded_batch(2).await;
    mark(&pipeline, &unit_ids[0], UnitStatus::Complete).await;
    mark(&pipeline, &unit_ids[1], UnitStatus::Cancelled).await;

    let batch = pipeline.finalize_batch(&batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Complete);
}

#[tokio::test]
async fn propagated_cancel_outranks_failure() {
    // the precedence scenario: {complete, failed, pending}, then the
    // propagator cancels the batch while one unit is still pending
    let (pipeline, batch_id, unit_ids) = seeded_batch(3).await;
    mark(&pipeline, &unit_ids[0], UnitStatus::Complete).await;
    mark(&pipeline, &unit_ids[1], UnitStatus::Failed).await;

    let batch = pipeline.cancel_batch(&batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Cancelled);

    let pending_now = pipeline.store().unit(&unit_ids[2]).await.unwrap();
    assert_eq!(pending_now.status, UnitStatus::Cancelled);

    // the failed unit does not drag the batch to failed
    let batch = pipeline.finalize_batch(&batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Cancelled);
}

#[tokio::test]
async fn finalize_is_idempotent_on_terminal_batches() {
    let (pipeline, batch_id, unit_ids) = seeded_batch(2).await;
    mark(&pipeline, &unit_ids[0], UnitStatus::Complete).await;
    mark(&pipeline, &unit_ids[1], UnitStatus::Failed).await;

    let first = pipeline.finalize_batch(&batch_id).await.unwrap();
    let second = pipeline.finalize_batch(&batch_id).await.unwrap();
    assert_eq!(first.status, second.status);
    assert_eq!(second.status, BatchStatus::Failed);
}

#[tokio::test]
async fn concurrent_finalizers_agree() {
    // any worker may be "the last one"; racing finalizers must settle on the
    // same terminal status
    let (pipeline, batch_id, unit_ids) = seeded_batch(4).await;
    for id in &unit_ids {
        mark(&pipeline, id, UnitStatus::Complete).await;
    }

    let pipeline = Arc::new(pipeline);
    let mut handles = Vec::new();
    for _ in 0..4 {
        let pipeline = pipeline.clone();
        let batch_id = batch_id.clone();
        handles.push(tokio::spawn(async move {
            pipeline.finalize_batch(&batch_id).await.unwrap().status
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), BatchStatus::Complete);
    }
}

/// A batch of `n` pending units already moved to `Processing`, as if a pool
/// had picked it up.
async fn seeded_batch(n: usize) -> (Pipeline, String, Vec<String>) {
    dossier::telemetry::init();
    let pipeline = Pipeline::new(
        Arc::new(MemoryStatusStore::new()),
        Arc::new(ScriptedAgent::new()),
        PipelineConfig::default(),
    );
    let inputs = (0..n).map(|i| json!({"ref": format!("unit-{i}")})).collect();
    let (batch, units) = pipeline
        .create_batch(BatchKind::Enrichment, inputs)
        .await
        .unwrap();
    pipeline
        .store()
        .transition_batch(
            &batch.id,
            &[BatchStatus::Pending],
            BatchPatch::status(BatchStatus::Processing),
        )
        .await
        .unwrap();
    let unit_ids = units.into_iter().map(|u| u.id).collect();
    (pipeline, batch.id, unit_ids)
}

async fn mark(pipeline: &Pipeline, unit_id: &str, status: UnitStatus) {
    pipeline
        .store()
        .update_unit(unit_id, UnitPatch::status(status))
        .await
        .unwrap();
}
