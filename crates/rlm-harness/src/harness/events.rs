//! Runtime events and the sink they are delivered to.
//!
//! Every state change in a run is emitted as a [`RunEvent`] with a per-run,
//! strictly increasing sequence number starting at 1. Sequence numbers are
//! assigned synchronously at the point of emission and the sink is awaited
//! in emission order, so an external observer sees a total order.
//!
//! Delivery is best-effort: sink errors are swallowed (logged when the run
//! is verbose) and never affect the run outcome.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

/// Ceiling on the serialized size of an event payload. Oversized payloads
/// are replaced with `{truncated, originalLength, preview}`.
pub const MAX_EVENT_PAYLOAD_CHARS: usize = 16_384;

const PAYLOAD_PREVIEW_CHARS: usize = 512;

/// Closed vocabulary of event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    #[serde(rename = "run.started")]
    RunStarted,
    #[serde(rename = "run.initialized")]
    RunInitialized,
    #[serde(rename = "run.finalized")]
    RunFinalized,
    #[serde(rename = "run.failed")]
    RunFailed,
    #[serde(rename = "run.ended_completed")]
    RunEndedCompleted,
    #[serde(rename = "run.ended_failed")]
    RunEndedFailed,
    #[serde(rename = "root.iteration.started")]
    RootIterationStarted,
    #[serde(rename = "root.iteration.completed")]
    RootIterationCompleted,
    #[serde(rename = "repl.execution.started")]
    ReplExecutionStarted,
    #[serde(rename = "repl.execution.completed")]
    ReplExecutionCompleted,
    #[serde(rename = "subcall.started")]
    SubcallStarted,
    #[serde(rename = "subcall.completed")]
    SubcallCompleted,
    #[serde(rename = "subcall.failed")]
    SubcallFailed,
    #[serde(rename = "subcall.rejected")]
    SubcallRejected,
    #[serde(rename = "subcall.batch_started")]
    SubcallBatchStarted,
    #[serde(rename = "subcall.batch_completed")]
    SubcallBatchCompleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RunStarted => "run.started",
            EventKind::RunInitialized => "run.initialized",
            EventKind::RunFinalized => "run.finalized",
            EventKind::RunFailed => "run.failed",
            EventKind::RunEndedCompleted => "run.ended_completed",
            EventKind::RunEndedFailed => "run.ended_failed",
            EventKind::RootIterationStarted => "root.iteration.started",
            EventKind::RootIterationCompleted => "root.iteration.completed",
            EventKind::ReplExecutionStarted => "repl.execution.started",
            EventKind::ReplExecutionCompleted => "repl.execution.completed",
            EventKind::SubcallStarted => "subcall.started",
            EventKind::SubcallCompleted => "subcall.completed",
            EventKind::SubcallFailed => "subcall.failed",
            EventKind::SubcallRejected => "subcall.rejected",
            EventKind::SubcallBatchStarted => "subcall.batch_started",
            EventKind::SubcallBatchCompleted => "subcall.batch_completed",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in the totally ordered event stream of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunEvent {
    /// Unix milliseconds at emission.
    pub ts: u64,
    /// Per-run sequence number, starting at 1, strictly increasing.
    pub seq: u64,
    pub kind: EventKind,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Enforce [`MAX_EVENT_PAYLOAD_CHARS`] on a payload mapping.
pub(crate) fn bound_payload(payload: Map<String, Value>) -> Value {
    let value = Value::Object(payload);
    let serialized = value.to_string();
    if serialized.chars().count() <= MAX_EVENT_PAYLOAD_CHARS {
        return value;
    }

    let preview: String = serialized.chars().take(PAYLOAD_PREVIEW_CHARS).collect();
    serde_json::json!({
        "truncated": true,
        "originalLength": serialized.chars().count(),
        "preview": preview,
    })
}

/// Destination for the event stream.
///
/// The callback may suspend; the harness awaits each delivery before
/// emitting the next event. Returning `Err` never fails the run.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, event: &RunEvent) -> Result<(), String>;
}

#[async_trait]
impl<T: EventSink + ?Sized> EventSink for std::sync::Arc<T> {
    async fn deliver(&self, event: &RunEvent) -> Result<(), String> {
        (**self).deliver(event).await
    }
}

/// Sink that drops every event. Useful in tests and for runs that only
/// need the trace.
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn deliver(&self, _event: &RunEvent) -> Result<(), String> {
        Ok(())
    }
}

/// Sink that logs each event through `tracing` at `info`.
pub struct LoggingSink;

#[async_trait]
impl EventSink for LoggingSink {
    async fn deliver(&self, event: &RunEvent) -> Result<(), String> {
        info!(seq = event.seq, kind = %event.kind, "{}", event.summary);
        Ok(())
    }
}

/// Sink that collects events in memory, for tests and demos.
#[derive(Default)]
pub struct MemorySink {
    events: std::sync::Mutex<Vec<RunEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn deliver(&self, event: &RunEvent) -> Result<(), String> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }
}
