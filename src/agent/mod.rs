//! The external agent operation
//!
//! The agent is the long-running collaborator that does the actual research
//! and generation for a unit: latency ranges from seconds to minutes and the
//! failure rate is non-trivial. Its internal decision logic is out of scope;
//! this module only fixes the seam the pipeline drives it through. An agent
//! must tolerate being invoked repeatedly with the same input (safe to retry)
//! and must call the progress sink synchronously at its checkpoints.

mod scripted;

pub use scripted::{ScriptedAgent, ScriptedCall};

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model::BatchKind;

/// Errors raised by the agent operation
#[derive(Error, Debug)]
pub enum AgentError {
    /// The operation failed outright
    #[error("Agent call failed: {0}")]
    Call(String),

    /// The operation returned output the caller could not use
    #[error("Agent returned malformed output: {0}")]
    Malformed(String),

    /// The operation exceeded its deadline
    #[error("Agent operation timed out after {0:?}")]
    Timeout(Duration),
}

/// A human-readable checkpoint event emitted by the agent mid-operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Sub-step the agent is working on
    pub stage: String,
    /// Human-readable progress message
    pub message: String,
}

/// Input for one agent invocation: one sub-step of one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInput {
    /// Pipeline phase of the owning batch
    pub kind: BatchKind,
    /// Named sub-step being executed
    pub stage: String,
    /// The unit's opaque input payload
    pub payload: Value,
    /// Outputs of sub-steps already completed in earlier attempts or earlier
    /// stages, keyed by stage name
    pub prior: Value,
}

/// Synchronous sink for agent progress events.
pub type ProgressSink<'a> = &'a (dyn Fn(ProgressEvent) + Send + Sync);

/// The external long-running operation performing the actual work for a unit.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run one sub-step to completion, emitting progress at checkpoints.
    ///
    /// Implementations must be safe to invoke repeatedly with the same input;
    /// the retry controller will do exactly that after transient failures.
    async fn run(&self, input: AgentInput, on_progress: ProgressSink<'_>)
        -> Result<Value, AgentError>;
}
