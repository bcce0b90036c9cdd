//! # Dossier Pipeline
//!
//! A batch orchestration engine for agent-driven research pipelines. A profile
//! identifier goes in; verified outputs come out through three independently
//! schedulable phases (discovery, enrichment, artifact production), each made
//! of many independent units of work executed by an external, unreliable,
//! long-running agent operation.
//!
//! ## Overview
//!
//! The engine drives many slow agent calls with bounded concurrency, retries
//! them with exponential backoff, cancels them cooperatively at checkpoints,
//! and aggregates unit outcomes into a deterministic batch status. Partial
//! work a unit has already paid for is persisted as resumable state and
//! survives retries. All progress is reported through the status store, so a
//! process that is torn down mid-batch loses nothing but its in-flight
//! attempts.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dossier::model::BatchKind;
//! use dossier::orchestrator::{Pipeline, PipelineConfig};
//! use dossier::store::MemoryStatusStore;
//! use dossier::agent::ScriptedAgent;
//! use serde_json::json;
//!
//! # async fn example() -> dossier::Result<()> {
//! let store = Arc::new(MemoryStatusStore::new());
//! let agent = Arc::new(ScriptedAgent::new());
//! let pipeline = Pipeline::new(store, agent, PipelineConfig::default());
//!
//! let (batch, _units) = pipeline
//!     .create_batch(BatchKind::Discovery, vec![json!({"profile": "acme-corp"})])
//!     .await?;
//!
//! let task = pipeline.start_batch(&batch.id).await?.expect("batch starts");
//! let finished = task.join().await?;
//! println!("batch finished as {}", finished.status);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`model`]: persisted batch and unit records with their status machines
//! - [`store`]: the status store contract and an in-memory implementation
//! - [`agent`]: the external agent operation seam
//! - [`runner`]: staged unit execution with resumable checkpoints
//! - [`orchestrator`]: pool, retry, finalization, cancellation, recovery

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Main error type for pipeline operations
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Status store error
    #[error("Store error: {0}")]
    Store(#[from] store::StoreError),

    /// Failure raised by the external agent operation
    #[error("Agent error: {0}")]
    Agent(#[from] agent::AgentError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Join error from async tasks
    #[error("Async join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Persisted batch and unit entities
pub mod model;

/// Status store contract and implementations
pub mod store;

/// External agent operation seam
pub mod agent;

/// Unit execution with resumable sub-steps
pub mod runner;

/// Batch orchestration: pool, retry, finalization, cancellation
pub mod orchestrator;

/// Tracing bootstrap
pub mod telemetry;
