//! Cancellation tests
//!
//! The propagator cancels a batch and its pending units immediately, leaves
//! running units to self-cancel at their next checkpoint, and is sticky:
//! automatic logic never overwrites a cancelled status.

use std::sync::Arc;
use std::time::Duration;

use dossier::agent::{ScriptedAgent, ScriptedCall};
use dossier::model::{BatchKind, BatchStatus, UnitStatus};
use dossier::orchestrator::{Pipeline, PipelineConfig};
use dossier::store::MemoryStatusStore;
use serde_json::json;

#[tokio::test]
async fn pending_units_are_cancelled_immediately() {
    let agent = Arc::new(ScriptedAgent::new());
    let pipeline = pipeline_with(agent.clone(), PipelineConfig::default());
    let (batch, units) = pipeline
        .create_batch(
            BatchKind::Discovery,
            (1..=3).map(|i| json!({"ref": format!("unit-{i}")})).collect(),
        )
        .await
        .unwrap();

    let cancelled = pipeline.cancel_batch(&batch.id).await.unwrap();
    assert_eq!(cancelled.status, BatchStatus::Cancelled);
    assert!(cancelled.cancel_requested);

    for unit in &units {
        let fresh = pipeline.store().unit(&unit.id).await.unwrap();
        assert_eq!(fresh.status, UnitStatus::Cancelled);
    }
    // nothing was ever dispatched
    assert_eq!(agent.call_count("unit-1", "locate"), 0);
}

#[tokio::test(start_paused = true)]
async fn running_units_self_cancel_at_next_checkpoint() {
    let agent = Arc::new(ScriptedAgent::new().with_latency(Duration::from_secs(10)));
    let pipeline = pipeline_with(
        agent.clone(),
        PipelineConfig {
            concurrency_ceiling: 1,
            ..PipelineConfig::default()
        },
    );
    let (batch, units) = pipeline
        .create_batch(
            BatchKind::Discovery,
            vec![json!({"ref": "in-flight"}), json!({"ref": "queued"})],
        )
        .await
        .unwrap();

    let task = pipeline.start_batch(&batch.id).await.unwrap().unwrap();

    // let the single worker claim the first unit and enter the agent call
    tokio::time::sleep(Duration::from_secs(1)).await;
    let first = pipeline.store().unit(&units[0].id).await.unwrap();
    assert_eq!(first.status, UnitStatus::Running);

    let cancelled = pipeline.cancel_batch(&batch.id).await.unwrap();
    assert_eq!(cancelled.status, BatchStatus::Cancelled);

    // the queued unit is swept at once; the running one is left untouched
    assert_eq!(
        pipeline.store().unit(&units[1].id).await.unwrap().status,
        UnitStatus::Cancelled
    );
    assert_eq!(
        pipeline.store().unit(&units[0].id).await.unwrap().status,
        UnitStatus::Running
    );

    let finished = task.join().await.unwrap();
    assert_eq!(finished.status, BatchStatus::Cancelled);

    // the in-flight agent call was allowed to finish; its sub-step result is
    // checkpointed but the unit ends cancelled, not complete
    let first = pipeline.store().unit(&units[0].id).await.unwrap();
    assert_eq!(first.status, UnitStatus::Cancelled);
    assert!(first.resumable_state.unwrap().get("locate").is_some());
    assert_eq!(agent.call_count("in-flight", "profile"), 0);
}

#[tokio::test(start_paused = true)]
async fn task_token_cancel_is_persisted() {
    let agent = Arc::new(ScriptedAgent::new().with_latency(Duration::from_millis(50)));
    let pipeline = pipeline_with(agent.clone(), PipelineConfig::default());
    let (batch, units) = pipeline
        .create_batch(
            BatchKind::Enrichment,
            (1..=4).map(|i| json!({"ref": format!("unit-{i}")})).collect(),
        )
        .await
        .unwrap();

    let task = pipeline.start_batch(&batch.id).await.unwrap().unwrap();
    // cancel before the pool ever gets to run
    task.cancel();
    let finished = task.join().await.unwrap();

    assert_eq!(finished.status, BatchStatus::Cancelled);
    for unit in &units {
        let fresh = pipeline.store().unit(&unit.id).await.unwrap();
        assert_eq!(fresh.status, UnitStatus::Cancelled);
    }
    assert_eq!(agent.call_count("unit-1", "research"), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_interrupts_a_backoff_sleep() {
    let agent = Arc::new(ScriptedAgent::new());
    agent.script(
        "acme",
        "locate",
        vec![ScriptedCall::Fail("flaky".to_string())],
    );
    let pipeline = pipeline_with(agent.clone(), PipelineConfig::default());
    let (batch, units) = pipeline
        .create_batch(BatchKind::Discovery, vec![json!({"ref": "acme"})])
        .await
        .unwrap();

    let task = pipeline.start_batch(&batch.id).await.unwrap().unwrap();

    // first attempt fails almost immediately, then the 2s backoff starts
    tokio::time::sleep(Duration::from_millis(500)).await;
    pipeline.cancel_batch(&batch.id).await.unwrap();

    let finished = task.join().await.unwrap();
    assert_eq!(finished.status, BatchStatus::Cancelled);
    let unit = pipeline.store().unit(&units[0].id).await.unwrap();
    assert_eq!(unit.status, UnitStatus::Cancelled);
    // no second attempt was paid for
    assert_eq!(agent.call_count("acme", "locate"), 1);
}

#[tokio::test]
async fn cancelled_is_sticky() {
    let agent = Arc::new(ScriptedAgent::new());
    let pipeline = pipeline_with(agent, PipelineConfig::default());
    let (batch, _) = pipeline
        .create_batch(BatchKind::Artifact, vec![json!({"ref": "acme"})])
        .await
        .unwrap();

    pipeline.cancel_batch(&batch.id).await.unwrap();

    // neither a repeat cancel nor a start nor a finalize moves it
    let again = pipeline.cancel_batch(&batch.id).await.unwrap();
    assert_eq!(again.status, BatchStatus::Cancelled);
    assert!(pipeline.start_batch(&batch.id).await.unwrap().is_none());
    let finalized = pipeline.finalize_batch(&batch.id).await.unwrap();
    assert_eq!(finalized.status, BatchStatus::Cancelled);
}

fn pipeline_with(agent: Arc<ScriptedAgent>, config: PipelineConfig) -> Pipeline {
    dossier::telemetry::init();
    Pipeline::new(Arc::new(MemoryStatusStore::new()), agent, config)
}
