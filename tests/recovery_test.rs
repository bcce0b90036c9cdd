//! Orphan detection and manual recovery
//!
//! A unit left `Running` by a dead process has no lease or heartbeat to heal
//! it; the staleness query surfaces it and an explicit reset puts it back
//! into the pool.

use std::sync::Arc;
use std::time::Duration;

use dossier::agent::ScriptedAgent;
use dossier::model::{BatchKind, BatchStatus, UnitStatus};
use dossier::orchestrator::{Pipeline, PipelineConfig};
use dossier::store::{MemoryStatusStore, UnitPatch};
use serde_json::json;

#[tokio::test]
async fn stale_query_surfaces_orphaned_units() {
    let (pipeline, unit_id) = seeded().await;

    // a driver died mid-attempt without writing a terminal status
    pipeline
        .store()
        .update_unit(
            &unit_id,
            UnitPatch::status(UnitStatus::Running).with_attempt_count(1),
        )
        .await
        .unwrap();

    // a generous horizon does not flag a freshly written record
    let stale = pipeline
        .stale_units(Some(Duration::from_secs(30 * 60)))
        .await
        .unwrap();
    assert!(stale.is_empty());

    // a zero horizon flags anything running
    let stale = pipeline.stale_units(Some(Duration::ZERO)).await.unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].id, unit_id);
}

#[tokio::test]
async fn stale_query_ignores_terminal_units() {
    let (pipeline, unit_id) = seeded().await;
    pipeline
        .store()
        .update_unit(&unit_id, UnitPatch::status(UnitStatus::Failed))
        .await
        .unwrap();

    let stale = pipeline.stale_units(Some(Duration::ZERO)).await.unwrap();
    assert!(stale.is_empty());
}

#[tokio::test(start_paused = true)]
async fn reset_orphan_re_enters_the_pool() {
    let (pipeline, unit_id) = seeded().await;
    pipeline
        .store()
        .update_unit(
            &unit_id,
            UnitPatch::status(UnitStatus::Running).with_attempt_count(1),
        )
        .await
        .unwrap();

    let unit = pipeline.reset_unit(&unit_id, false).await.unwrap();
    assert_eq!(unit.status, UnitStatus::Pending);
    // attempts are preserved unless explicitly zeroed
    assert_eq!(unit.attempt_count, 1);

    let task = pipeline
        .start_batch(&unit.batch_id)
        .await
        .unwrap()
        .expect("recovered batch resumes");
    let finished = task.join().await.unwrap();
    assert_eq!(finished.status, BatchStatus::Complete);

    let unit = pipeline.store().unit(&unit_id).await.unwrap();
    assert_eq!(unit.status, UnitStatus::Complete);
    assert_eq!(unit.attempt_count, 2);
}

#[tokio::test]
async fn reset_zeroes_attempts_on_request() {
    let (pipeline, unit_id) = seeded().await;
    pipeline
        .store()
        .update_unit(
            &unit_id,
            UnitPatch::status(UnitStatus::Failed).with_attempt_count(3),
        )
        .await
        .unwrap();

    let unit = pipeline.reset_unit(&unit_id, true).await.unwrap();
    assert_eq!(unit.status, UnitStatus::Pending);
    assert_eq!(unit.attempt_count, 0);
}

#[tokio::test]
async fn complete_units_are_never_reset() {
    let (pipeline, unit_id) = seeded().await;
    pipeline
        .store()
        .update_unit(&unit_id, UnitPatch::status(UnitStatus::Complete))
        .await
        .unwrap();

    let unit = pipeline.reset_unit(&unit_id, true).await.unwrap();
    assert_eq!(unit.status, UnitStatus::Complete);
}

async fn seeded() -> (Pipeline, String) {
    dossier::telemetry::init();
    let pipeline = Pipeline::new(
        Arc::new(MemoryStatusStore::new()),
        Arc::new(ScriptedAgent::new()),
        PipelineConfig::default(),
    );
    let (_, units) = pipeline
        .create_batch(BatchKind::Artifact, vec![json!({"ref": "orphan"})])
        .await
        .unwrap();
    (pipeline, units[0].id.clone())
}
