use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};

use crate::agent::{AgentError, AgentInput, AgentRunner, ProgressEvent, ProgressSink};

/// One scripted outcome for a `(subject, stage)` pair.
#[derive(Debug, Clone)]
pub enum ScriptedCall {
    /// Return this value
    Succeed(Value),
    /// Raise a call failure with this message
    Fail(String),
}

/// Deterministic agent double for tests and local embedding.
///
/// Outcomes are scripted per `(subject, stage)` and consumed in order; once a
/// script runs dry (or none was registered) every further call succeeds with a
/// synthesized payload. The subject of a call is the `"ref"` field of the unit
/// input, falling back to the whole payload rendered as a string.
///
/// The double also keeps per-stage invocation counters and an in-flight peak
/// gauge, which is what the concurrency-ceiling and resumable-state tests
/// observe.
#[derive(Default)]
pub struct ScriptedAgent {
    scripts: DashMap<(String, String), VecDeque<ScriptedCall>>,
    calls: DashMap<(String, String), usize>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedAgent {
    /// Create an agent with no scripts: every call succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every call, so calls overlap in time.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queue outcomes for a `(subject, stage)` pair, consumed in order.
    pub fn script(
        &self,
        subject: impl Into<String>,
        stage: impl Into<String>,
        outcomes: Vec<ScriptedCall>,
    ) {
        self.scripts
            .entry((subject.into(), stage.into()))
            .or_default()
            .extend(outcomes);
    }

    /// How many times `(subject, stage)` has been invoked.
    pub fn call_count(&self, subject: &str, stage: &str) -> usize {
        self.calls
            .get(&(subject.to_string(), stage.to_string()))
            .map(|entry| *entry.value())
            .unwrap_or(0)
    }

    /// Highest number of calls that were in flight at the same instant.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Subject key for a payload.
    pub fn subject_of(payload: &Value) -> String {
        payload
            .get("ref")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| payload.to_string())
    }

    fn next_outcome(&self, subject: &str, stage: &str) -> Option<ScriptedCall> {
        self.scripts
            .get_mut(&(subject.to_string(), stage.to_string()))
            .and_then(|mut entry| entry.value_mut().pop_front())
    }
}

#[async_trait]
impl AgentRunner for ScriptedAgent {
    async fn run(
        &self,
        input: AgentInput,
        on_progress: ProgressSink<'_>,
    ) -> Result<Value, AgentError> {
        let subject = Self::subject_of(&input.payload);
        *self
            .calls
            .entry((subject.clone(), input.stage.clone()))
            .or_insert(0) += 1;

        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight
            .fetch_max(now_in_flight, Ordering::SeqCst);

        on_progress(ProgressEvent {
            stage: input.stage.clone(),
            message: format!("{} started for {}", input.stage, subject),
        });

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let outcome = self.next_outcome(&subject, &input.stage);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        on_progress(ProgressEvent {
            stage: input.stage.clone(),
            message: format!("{} finished for {}", input.stage, subject),
        });

        match outcome {
            Some(ScriptedCall::Succeed(value)) => Ok(value),
            Some(ScriptedCall::Fail(message)) => Err(AgentError::Call(message)),
            None => Ok(json!({
                "stage": input.stage,
                "subject": subject,
            })),
        }
    }
}
