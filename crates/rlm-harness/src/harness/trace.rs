//! Post-hoc run traces.
//!
//! When a [`TraceCollector`](TraceCollector) is configured, the harness
//! accumulates a structured record of the whole run (config snapshot,
//! context metadata, per-iteration REPL executions, a flat subcall list,
//! and the finalization outcome) and hands it to the collector exactly
//! once at the end of the run, whether it completed or failed.
//!
//! Large texts (prompts, responses, REPL output) are stored through the
//! run's redaction policy.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::harness::context::ContextMetadata;
use crate::redact::{redact, RedactionPolicy};

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
}

/// How the run produced its answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FinalOutcome {
    /// `FINAL(<value>)` directive.
    Final { value: String },
    /// `FINAL_VAR(<name>)` directive, resolved through the worker.
    FinalVar { name: String, value: String },
    /// No directive after the fallback call; the raw response is the answer.
    FallbackText { value: String },
    /// The run failed before finalizing.
    None,
}

/// Serializable snapshot of the run configuration.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSnapshot {
    pub root_model: String,
    pub sub_model: String,
    pub iteration_limit: u32,
    pub subcall_limit: u32,
    pub request_timeout_ms: u64,
    pub max_execution_output_chars: usize,
    pub redaction: RedactionPolicy,
}

/// One REPL execution inside an iteration.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplExecutionTrace {
    pub id: String,
    pub code: String,
    pub stdout: String,
    pub stderr: String,
    pub variables: Vec<String>,
    pub execution_time_ms: u64,
}

/// One root iteration: the model response plus its executions.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationTrace {
    pub index: u32,
    pub response: String,
    pub executions: Vec<ReplExecutionTrace>,
}

/// Kind of a subcall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubcallKind {
    Single,
    Batched,
}

/// One subcall, cross-referenced to its originating iteration/execution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubcallTrace {
    pub id: String,
    pub iteration_index: Option<u32>,
    pub repl_execution_id: Option<String>,
    pub kind: SubcallKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_index: Option<usize>,
    pub model: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_ms: u64,
}

/// The complete structured record of one run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTrace {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub config: ConfigSnapshot,
    pub context: ContextMetadata,
    pub iterations: Vec<IterationTrace>,
    pub subcalls: Vec<SubcallTrace>,
    pub finalization: FinalOutcome,
    pub fallback_used: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_response: Option<String>,
}

/// Receives the finished trace, exactly once per run.
#[async_trait]
pub trait TraceCollector: Send + Sync {
    async fn on_run_end(&self, trace: RunTrace);
}

/// In-memory accumulation for a run in flight.
///
/// Iteration records come from the main task; subcall records come from
/// bridge handlers while an `exec` is outstanding. Appends are independent,
/// so a plain mutex (never held across `.await`) is enough.
pub(crate) struct TraceBuilder {
    run_id: String,
    started_at: DateTime<Utc>,
    config: ConfigSnapshot,
    context: ContextMetadata,
    policy: RedactionPolicy,
    inner: Mutex<TraceAcc>,
}

#[derive(Default)]
struct TraceAcc {
    iterations: Vec<IterationTrace>,
    subcalls: Vec<SubcallTrace>,
    fallback_used: bool,
    fallback_response: Option<String>,
}

impl TraceBuilder {
    pub fn new(run_id: String, config: ConfigSnapshot, context: ContextMetadata) -> Self {
        let policy = config.redaction.clone();
        Self {
            run_id,
            started_at: Utc::now(),
            config,
            context,
            policy,
            inner: Mutex::new(TraceAcc::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TraceAcc> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_iteration(&self, index: u32, response: &str, executions: Vec<ReplExecutionTrace>) {
        let (response, _) = redact(&self.policy, response, self.policy.max_prompt_chars);
        self.lock().iterations.push(IterationTrace {
            index,
            response,
            executions,
        });
    }

    pub fn record_subcall(&self, mut subcall: SubcallTrace) {
        let (prompt, _) = redact(&self.policy, &subcall.prompt, self.policy.max_prompt_chars);
        subcall.prompt = prompt;
        if let Some(response) = subcall.response.take() {
            let (response, _) = redact(&self.policy, &response, self.policy.max_prompt_chars);
            subcall.response = Some(response);
        }
        self.lock().subcalls.push(subcall);
    }

    /// Build a redacted execution record from raw worker output.
    pub fn execution_trace(
        &self,
        id: &str,
        code: &str,
        result: &crate::worker::ExecResult,
    ) -> ReplExecutionTrace {
        let (stdout, _) = redact(&self.policy, &result.stdout, self.policy.max_repl_output_chars);
        let (stderr, _) = redact(&self.policy, &result.stderr, self.policy.max_repl_output_chars);
        ReplExecutionTrace {
            id: id.to_string(),
            code: code.to_string(),
            stdout,
            stderr,
            variables: result.variable_names(),
            execution_time_ms: result.execution_time_ms(),
        }
    }

    pub fn mark_fallback(&self, raw_response: &str) {
        let mut acc = self.lock();
        acc.fallback_used = true;
        acc.fallback_response = Some(raw_response.to_string());
    }

    /// Consume the accumulator into the final record.
    pub fn finish(
        &self,
        status: RunStatus,
        error: Option<String>,
        finalization: FinalOutcome,
    ) -> RunTrace {
        let mut acc = self.lock();
        RunTrace {
            run_id: self.run_id.clone(),
            started_at: self.started_at,
            ended_at: Utc::now(),
            status,
            error,
            config: self.config.clone(),
            context: self.context.clone(),
            iterations: std::mem::take(&mut acc.iterations),
            subcalls: std::mem::take(&mut acc.subcalls),
            finalization,
            fallback_used: acc.fallback_used,
            fallback_response: acc.fallback_response.take(),
        }
    }
}

/// Collector that stores traces in memory, for tests and demos.
#[derive(Default)]
pub struct MemoryCollector {
    traces: Mutex<Vec<RunTrace>>,
}

impl MemoryCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn traces(&self) -> Vec<RunTrace> {
        self.traces.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl TraceCollector for MemoryCollector {
    async fn on_run_end(&self, trace: RunTrace) {
        self.traces
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(trace);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::context::ContextInput;

    fn snapshot() -> ConfigSnapshot {
        ConfigSnapshot {
            root_model: "root".into(),
            sub_model: "sub".into(),
            iteration_limit: 16,
            subcall_limit: 200,
            request_timeout_ms: 120_000,
            max_execution_output_chars: 20_000,
            redaction: RedactionPolicy::default(),
        }
    }

    fn builder() -> TraceBuilder {
        let context = ContextInput::Text("ctx".into());
        let meta = context.metadata(&RedactionPolicy::default());
        TraceBuilder::new("run-test".into(), snapshot(), meta)
    }

    #[test]
    fn finish_collects_iterations_and_subcalls() {
        let tb = builder();
        tb.record_iteration(1, "FINAL(42)", vec![]);
        tb.record_subcall(SubcallTrace {
            id: "sub-1".into(),
            iteration_index: Some(1),
            repl_execution_id: Some("repl-1".into()),
            kind: SubcallKind::Single,
            batch_index: None,
            model: "sub".into(),
            prompt: "hi".into(),
            response: Some("hello".into()),
            error: None,
            latency_ms: 12,
        });

        let trace = tb.finish(
            RunStatus::Completed,
            None,
            FinalOutcome::Final { value: "42".into() },
        );
        assert_eq!(trace.iterations.len(), 1);
        assert_eq!(trace.subcalls.len(), 1);
        assert!(!trace.fallback_used);
        assert_eq!(trace.status, RunStatus::Completed);
    }

    #[test]
    fn long_subcall_prompt_is_redacted() {
        let tb = builder();
        tb.record_subcall(SubcallTrace {
            id: "sub-1".into(),
            iteration_index: None,
            repl_execution_id: None,
            kind: SubcallKind::Single,
            batch_index: None,
            model: "sub".into(),
            prompt: "p".repeat(100_000),
            response: None,
            error: Some("boom".into()),
            latency_ms: 1,
        });
        let trace = tb.finish(RunStatus::Failed, Some("boom".into()), FinalOutcome::None);
        assert!(trace.subcalls[0].prompt.len() < 100_000);
        assert!(trace.subcalls[0].prompt.contains("chars omitted"));
    }

    #[test]
    fn fallback_preserves_raw_response() {
        let tb = builder();
        tb.mark_fallback("no directive, just text");
        let trace = tb.finish(
            RunStatus::Completed,
            None,
            FinalOutcome::FallbackText {
                value: "no directive, just text".into(),
            },
        );
        assert!(trace.fallback_used);
        assert_eq!(
            trace.fallback_response.as_deref(),
            Some("no directive, just text")
        );
    }

    #[test]
    fn trace_serializes_camel_case() {
        let tb = builder();
        let trace = tb.finish(RunStatus::Completed, None, FinalOutcome::None);
        let json = serde_json::to_value(&trace).unwrap();
        assert!(json.get("runId").is_some());
        assert!(json.get("fallbackUsed").is_some());
        assert_eq!(json["status"], "completed");
    }
}
