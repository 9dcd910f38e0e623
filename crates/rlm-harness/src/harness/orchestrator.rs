//! The harness orchestrator: the root iteration loop, budgets, finalization,
//! and the scoped acquisition/release of the worker and bridge.
//!
//! A run moves through `Starting → Initializing → Iterating(i) →
//! CheckingDirective(i) → Finalizing → Ending`, with `Failing` reachable
//! from anywhere. Whatever happens inside the loop, the bridge is stopped,
//! the worker is closed, exactly one of `run.ended_completed` /
//! `run.ended_failed` is emitted, and the trace collector (if any) is
//! notified exactly once.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Map;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api::LmClient;
use crate::bridge::BridgeServer;
use crate::error::RlmError;
use crate::harness::config::RlmConfig;
use crate::harness::context::{ContextInput, ContextMetadata};
use crate::harness::events::{EventKind, EventSink};
use crate::harness::prompt::{
    context_preamble, execution_feedback, turn_message, FALLBACK_PROMPT, SYSTEM_PROMPT,
};
use crate::harness::state::Shared;
use crate::harness::subcall::SubcallRouter;
use crate::harness::trace::{FinalOutcome, RunStatus, RunTrace, TraceBuilder, TraceCollector};
use crate::parse::{extract_repl_blocks, parse_directive, truncate, Directive};
use crate::worker::{InitParams, Interpreter, WorkerClient};
use crate::Message;

/// Characters of stdout/stderr carried in `repl.execution.completed`
/// payloads.
const EVENT_OUTPUT_PREVIEW_CHARS: usize = 256;

/// Input to one `completion` run.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    /// The context payload installed into the interpreter.
    pub context: ContextInput,
    /// Optional path to a file holding the canonical context serialization;
    /// passed through to the worker so huge contexts need not travel over
    /// stdin.
    pub context_file_path: Option<String>,
    /// The user question, seeded as the `question` variable.
    pub question: Option<String>,
    /// Per-run override of the configured iteration limit.
    pub max_iterations: Option<u32>,
}

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct Completion {
    pub answer: String,
    /// Root iterations used (1-based count; the fallback call is not an
    /// iteration).
    pub iterations: u32,
    pub subcall_count: u32,
    pub execution_time_ms: u64,
    /// The structured trace, present when a collector is configured.
    pub trace: Option<RunTrace>,
}

/// What the iteration loop hands to finalization.
enum Pending {
    Directive(Directive),
    Raw(String),
}

struct RunOutput {
    answer: String,
    iterations: u32,
    finalization: FinalOutcome,
}

/// The recursive language model harness.
///
/// Holds the LM client and fixed configuration; each call to
/// [`completion`](Rlm::completion) is an independent run with its own
/// worker, bridge, counters, and event stream.
pub struct Rlm {
    client: Arc<dyn LmClient>,
    config: RlmConfig,
    sink: Option<Arc<dyn EventSink>>,
    collector: Option<Arc<dyn TraceCollector>>,
    cancellation: CancellationToken,
}

impl Rlm {
    /// Create a harness. `RLM_*` environment overrides are resolved here.
    pub fn new(client: impl LmClient + 'static, config: RlmConfig) -> Self {
        Self {
            client: Arc::new(client),
            config: config.resolved(),
            sink: None,
            collector: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Attach an event sink receiving the totally ordered event stream.
    pub fn with_event_sink(mut self, sink: impl EventSink + 'static) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    /// Attach a trace collector, notified exactly once per run.
    pub fn with_trace_collector(mut self, collector: impl TraceCollector + 'static) -> Self {
        self.collector = Some(Arc::new(collector));
        self
    }

    /// Attach a cancellation token. When it fires, in-flight I/O is
    /// abandoned and the run unwinds through the scoped release with a
    /// `Cancelled` error.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn config(&self) -> &RlmConfig {
        &self.config
    }

    /// Run to a final answer, spawning the interpreter from
    /// `config.interpreter_command`.
    pub async fn completion(&self, request: CompletionRequest) -> Result<Completion, RlmError> {
        let worker = WorkerClient::spawn(&self.config.interpreter_command).await?;
        self.completion_with_interpreter(request, Arc::new(worker))
            .await
    }

    /// Run to a final answer against a caller-supplied interpreter.
    ///
    /// The interpreter is closed on every exit path, so ownership of its
    /// child process (if any) effectively transfers here.
    pub async fn completion_with_interpreter(
        &self,
        request: CompletionRequest,
        interpreter: Arc<dyn Interpreter>,
    ) -> Result<Completion, RlmError> {
        let started = Instant::now();
        let run_id = format!("run-{}", Uuid::new_v4());
        let iteration_limit = request
            .max_iterations
            .unwrap_or(self.config.max_iterations)
            .max(1);

        let shared = Arc::new(Shared::new(self.sink.clone(), self.config.verbose));
        let context_meta = request.context.metadata(&self.config.redaction);
        let trace = self
            .collector
            .is_some()
            .then(|| {
                Arc::new(TraceBuilder::new(
                    run_id.clone(),
                    self.config.snapshot(),
                    context_meta.clone(),
                ))
            });

        let mut payload = Map::new();
        payload.insert("runId".into(), run_id.clone().into());
        payload.insert("rootModel".into(), self.config.root_model.clone().into());
        payload.insert("subModel".into(), self.config.sub_model.clone().into());
        payload.insert("iterationLimit".into(), iteration_limit.into());
        payload.insert("subcallLimit".into(), self.config.max_total_subcalls.into());
        shared
            .emit(
                EventKind::RunStarted,
                format!("run {run_id} started"),
                Some(payload),
            )
            .await;

        let router = Arc::new(SubcallRouter {
            client: self.client.clone(),
            sub_model: self.config.sub_model.clone(),
            subcall_limit: self.config.max_total_subcalls,
            request_timeout: self.config.request_timeout,
            shared: shared.clone(),
            trace: trace.clone(),
        });

        // Scoped acquisition: worker first (done by the caller), then the
        // bridge. Release happens below in reverse order on every path.
        let result = match BridgeServer::start(router).await {
            Err(err) => Err(err),
            Ok(bridge) => {
                let inner = self.run_loop(
                    &request,
                    interpreter.as_ref(),
                    &shared,
                    trace.as_deref(),
                    &context_meta,
                    bridge.url(),
                    iteration_limit,
                );
                let outcome = tokio::select! {
                    _ = self.cancellation.cancelled() => Err(RlmError::Cancelled),
                    outcome = inner => outcome,
                };
                bridge.stop().await;
                outcome
            }
        };
        interpreter.close().await;

        let subcall_count = shared.subcall_count().await;
        let execution_time_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                let mut payload = Map::new();
                payload.insert("durationMs".into(), execution_time_ms.into());
                payload.insert("iterations".into(), output.iterations.into());
                payload.insert("subcallCount".into(), subcall_count.into());
                shared
                    .emit(
                        EventKind::RunEndedCompleted,
                        format!("run {run_id} ended after {} iteration(s)", output.iterations),
                        Some(payload),
                    )
                    .await;

                let trace = self
                    .deliver_trace(trace, RunStatus::Completed, None, output.finalization)
                    .await;

                Ok(Completion {
                    answer: output.answer,
                    iterations: output.iterations,
                    subcall_count,
                    execution_time_ms,
                    trace,
                })
            }
            Err(err) => {
                let mut payload = Map::new();
                payload.insert("error".into(), err.to_string().into());
                shared
                    .emit(
                        EventKind::RunFailed,
                        format!("run {run_id} failed: {err}"),
                        Some(payload),
                    )
                    .await;

                let mut payload = Map::new();
                payload.insert("durationMs".into(), execution_time_ms.into());
                payload.insert("subcallCount".into(), subcall_count.into());
                shared
                    .emit(
                        EventKind::RunEndedFailed,
                        format!("run {run_id} released after failure"),
                        Some(payload),
                    )
                    .await;

                self.deliver_trace(
                    trace,
                    RunStatus::Failed,
                    Some(err.to_string()),
                    FinalOutcome::None,
                )
                .await;

                Err(err)
            }
        }
    }

    /// Finish the trace and notify the collector, exactly once per run.
    async fn deliver_trace(
        &self,
        trace: Option<Arc<TraceBuilder>>,
        status: RunStatus,
        error: Option<String>,
        finalization: FinalOutcome,
    ) -> Option<RunTrace> {
        let trace = trace?.finish(status, error, finalization);
        if let Some(ref collector) = self.collector {
            collector.on_run_end(trace.clone()).await;
        }
        Some(trace)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_loop(
        &self,
        request: &CompletionRequest,
        interpreter: &dyn Interpreter,
        shared: &Shared,
        trace: Option<&TraceBuilder>,
        context_meta: &ContextMetadata,
        bridge_url: &str,
        iteration_limit: u32,
    ) -> Result<RunOutput, RlmError> {
        // ── Initializing ──
        interpreter
            .init(InitParams {
                context: Some(request.context.to_value()),
                context_file_path: request.context_file_path.clone(),
                bridge_url: bridge_url.to_string(),
                question: request.question.clone(),
            })
            .await?;

        let mut payload = Map::new();
        payload.insert("contextType".into(), context_meta.context_type.clone().into());
        payload.insert("totalChars".into(), context_meta.total_chars.into());
        payload.insert("itemCount".into(), context_meta.item_count.into());
        shared
            .emit(
                EventKind::RunInitialized,
                "worker initialized with context".to_string(),
                Some(payload),
            )
            .await;

        let mut messages = vec![
            Message::system(SYSTEM_PROMPT),
            Message::assistant(context_preamble(context_meta)),
        ];
        let mut directive: Option<Directive> = None;
        let mut iterations_used = 0;

        // ── Iterating ──
        for iteration in 1..=iteration_limit {
            iterations_used = iteration;
            messages.push(Message::user(turn_message(iteration)));

            let mut payload = Map::new();
            payload.insert("iteration".into(), iteration.into());
            shared
                .emit(
                    EventKind::RootIterationStarted,
                    format!("root iteration {iteration}/{iteration_limit}"),
                    Some(payload),
                )
                .await;

            let reply = self
                .client
                .call(
                    &self.config.root_model,
                    messages.clone().into(),
                    self.config.request_timeout,
                )
                .await?;
            let blocks = extract_repl_blocks(&reply.text);

            let mut payload = Map::new();
            payload.insert("iteration".into(), iteration.into());
            payload.insert("codeBlocks".into(), blocks.len().into());
            payload.insert("responseChars".into(), reply.text.chars().count().into());
            payload.insert("latencyMs".into(), reply.latency_ms.into());
            if let Some(ref usage) = reply.usage {
                payload.insert(
                    "promptTokens".into(),
                    usage.prompt_tokens.unwrap_or(0).into(),
                );
                payload.insert(
                    "completionTokens".into(),
                    usage.completion_tokens.unwrap_or(0).into(),
                );
            }
            if let Some(ref reason) = reply.finish_reason {
                payload.insert("finishReason".into(), reason.clone().into());
            }
            shared
                .emit(
                    EventKind::RootIterationCompleted,
                    format!(
                        "root iteration {iteration} completed ({} block(s))",
                        blocks.len()
                    ),
                    Some(payload),
                )
                .await;

            let mut executions = Vec::new();
            let mut feedback = Vec::new();
            for code in &blocks {
                let repl_id = shared.begin_repl_execution(iteration).await;
                let result = match interpreter.exec(code).await {
                    Ok(result) => result,
                    Err(err) => {
                        // Worker failures are fatal; clear the binding
                        // window before unwinding.
                        shared.end_repl_execution(&repl_id, None).await;
                        return Err(err.into());
                    }
                };

                let mut payload = Map::new();
                payload.insert("replExecutionId".into(), repl_id.clone().into());
                payload.insert("iteration".into(), iteration.into());
                payload.insert(
                    "stdoutPreview".into(),
                    truncate(&result.stdout, EVENT_OUTPUT_PREVIEW_CHARS).into(),
                );
                payload.insert(
                    "stderrPreview".into(),
                    truncate(&result.stderr, EVENT_OUTPUT_PREVIEW_CHARS).into(),
                );
                payload.insert("variables".into(), result.variable_names().len().into());
                payload.insert("executionTimeMs".into(), result.execution_time_ms().into());
                shared.end_repl_execution(&repl_id, Some(payload)).await;

                if let Some(tb) = trace {
                    executions.push(tb.execution_trace(&repl_id, code, &result));
                }
                feedback.push(execution_feedback(
                    code,
                    &result,
                    self.config.max_execution_output_chars,
                ));
            }

            if let Some(tb) = trace {
                tb.record_iteration(iteration, &reply.text, executions);
            }

            // ── CheckingDirective ──
            directive = parse_directive(&reply.text);
            if directive.is_some() {
                break;
            }

            messages.push(Message::assistant(reply.text));
            for message in feedback {
                messages.push(Message::user(message));
            }
        }

        // ── Fallback path ──
        let pending = match directive {
            Some(directive) => Pending::Directive(directive),
            None => {
                messages.push(Message::user(FALLBACK_PROMPT));
                let reply = self
                    .client
                    .call(
                        &self.config.root_model,
                        messages.into(),
                        self.config.request_timeout,
                    )
                    .await?;
                if let Some(tb) = trace {
                    tb.mark_fallback(&reply.text);
                }
                match parse_directive(&reply.text) {
                    Some(directive) => Pending::Directive(directive),
                    None => Pending::Raw(reply.text),
                }
            }
        };

        // ── Finalizing ──
        let (answer, finalization) = match pending {
            Pending::Directive(Directive::Final(value)) => {
                (value.clone(), FinalOutcome::Final { value })
            }
            Pending::Directive(Directive::FinalVar(name)) => {
                let value = interpreter.final_var(&name).await?;
                (value.clone(), FinalOutcome::FinalVar { name, value })
            }
            Pending::Raw(text) => (text.clone(), FinalOutcome::FallbackText { value: text }),
        };

        let mut payload = Map::new();
        payload.insert("kind".into(), finalization_kind(&finalization).into());
        payload.insert("answerChars".into(), answer.chars().count().into());
        shared
            .emit(
                EventKind::RunFinalized,
                format!("run finalized via {}", finalization_kind(&finalization)),
                Some(payload),
            )
            .await;

        Ok(RunOutput {
            answer,
            iterations: iterations_used,
            finalization,
        })
    }
}

fn finalization_kind(outcome: &FinalOutcome) -> &'static str {
    match outcome {
        FinalOutcome::Final { .. } => "final",
        FinalOutcome::FinalVar { .. } => "final_var",
        FinalOutcome::FallbackText { .. } => "fallback_text",
        FinalOutcome::None => "none",
    }
}
