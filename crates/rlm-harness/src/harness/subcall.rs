//! The orchestrator's subcall path, exposed to the bridge.
//!
//! Bridge handlers re-enter here while the main task is awaiting a worker
//! `exec`. Admission (id assignment, binding snapshot, budget check) happens
//! in one critical section on the shared run state; the LM call itself runs
//! outside any lock. Business failures never propagate: the interpreter
//! always receives a string, possibly `"Error: ..."`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Map;

use crate::api::{LmClient, LmInput};
use crate::bridge::SubcallGateway;
use crate::harness::events::EventKind;
use crate::harness::state::{json_opt_u32, Shared, SubcallTicket};
use crate::harness::trace::{SubcallKind, SubcallTrace, TraceBuilder};

pub(crate) struct SubcallRouter {
    pub client: Arc<dyn LmClient>,
    pub sub_model: String,
    pub subcall_limit: u32,
    pub request_timeout: Duration,
    pub shared: Arc<Shared>,
    pub trace: Option<Arc<TraceBuilder>>,
}

impl SubcallRouter {
    fn ticket_payload(&self, ticket: &SubcallTicket, model: &str) -> Map<String, serde_json::Value> {
        let mut payload = Map::new();
        payload.insert("subcallId".into(), ticket.id.clone().into());
        payload.insert("iterationIndex".into(), json_opt_u32(ticket.iteration));
        payload.insert(
            "replExecutionId".into(),
            ticket
                .repl_execution_id
                .clone()
                .map_or(serde_json::Value::Null, serde_json::Value::String),
        );
        payload.insert("model".into(), model.into());
        payload
    }

    /// Process one prompt under subcall accounting. Infallible by design.
    async fn run_one(
        &self,
        prompt: String,
        model_override: Option<&str>,
        kind: SubcallKind,
        batch_index: Option<usize>,
    ) -> String {
        let model = model_override.unwrap_or(&self.sub_model).to_string();
        let ticket = self
            .shared
            .admit_subcall(self.subcall_limit, &model, batch_index)
            .await;

        if !ticket.admitted {
            let reply = format!("Error: sub-call limit reached ({})", self.subcall_limit);
            self.record(&ticket, kind, batch_index, &model, &prompt, Err(&reply), 0);
            return reply;
        }

        match self
            .client
            .call(&model, LmInput::Prompt(prompt.clone()), self.request_timeout)
            .await
        {
            Ok(reply) => {
                let mut payload = self.ticket_payload(&ticket, &model);
                payload.insert("latencyMs".into(), reply.latency_ms.into());
                payload.insert("responseChars".into(), reply.text.chars().count().into());
                if let Some(total) = reply.usage.as_ref().and_then(|u| u.total_tokens) {
                    payload.insert("totalTokens".into(), total.into());
                }
                self.shared
                    .emit(
                        EventKind::SubcallCompleted,
                        format!("subcall {} completed in {}ms", ticket.id, reply.latency_ms),
                        Some(payload),
                    )
                    .await;
                self.record(
                    &ticket,
                    kind,
                    batch_index,
                    &model,
                    &prompt,
                    Ok(&reply.text),
                    reply.latency_ms,
                );
                reply.text
            }
            Err(err) => {
                let message = err.to_string();
                let mut payload = self.ticket_payload(&ticket, &model);
                payload.insert("error".into(), message.clone().into());
                self.shared
                    .emit(
                        EventKind::SubcallFailed,
                        format!("subcall {} failed: {message}", ticket.id),
                        Some(payload),
                    )
                    .await;
                let reply = format!("Error: LM query failed - {message}");
                self.record(&ticket, kind, batch_index, &model, &prompt, Err(&message), 0);
                reply
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        ticket: &SubcallTicket,
        kind: SubcallKind,
        batch_index: Option<usize>,
        model: &str,
        prompt: &str,
        result: Result<&str, &str>,
        latency_ms: u64,
    ) {
        let Some(ref trace) = self.trace else { return };
        trace.record_subcall(SubcallTrace {
            id: ticket.id.clone(),
            iteration_index: ticket.iteration,
            repl_execution_id: ticket.repl_execution_id.clone(),
            kind,
            batch_index,
            model: model.to_string(),
            prompt: prompt.to_string(),
            response: result.ok().map(str::to_string),
            error: result.err().map(str::to_string),
            latency_ms,
        });
    }
}

#[async_trait]
impl SubcallGateway for SubcallRouter {
    async fn query(&self, prompt: String, model: Option<String>) -> String {
        self.run_one(prompt, model.as_deref(), SubcallKind::Single, None)
            .await
    }

    async fn query_batched(&self, prompts: Vec<String>, model: Option<String>) -> Vec<String> {
        let batch_model = model.as_deref().unwrap_or(&self.sub_model).to_string();
        let size = prompts.len();

        let mut payload = Map::new();
        payload.insert("size".into(), size.into());
        payload.insert("model".into(), batch_model.clone().into());
        self.shared
            .emit(
                EventKind::SubcallBatchStarted,
                format!("subcall batch of {size} started (model {batch_model})"),
                Some(payload),
            )
            .await;

        // Prompts are processed sequentially and answered in input order:
        // determinism over parallelism for interpreter-visible results.
        let mut responses = Vec::with_capacity(size);
        for (index, prompt) in prompts.into_iter().enumerate() {
            responses.push(
                self.run_one(prompt, model.as_deref(), SubcallKind::Batched, Some(index))
                    .await,
            );
        }

        let mut payload = Map::new();
        payload.insert("size".into(), size.into());
        self.shared
            .emit(
                EventKind::SubcallBatchCompleted,
                format!("subcall batch of {size} completed"),
                Some(payload),
            )
            .await;

        responses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::LmReply;
    use crate::error::LmCallError;
    use crate::harness::events::MemorySink;

    /// Fake client answering `"re:<prompt>"`, or failing on prompts that
    /// start with `fail`.
    struct EchoLm;

    #[async_trait]
    impl LmClient for EchoLm {
        async fn call(
            &self,
            _model: &str,
            input: LmInput,
            _deadline: Duration,
        ) -> Result<LmReply, LmCallError> {
            let LmInput::Prompt(prompt) = input else {
                return Err(LmCallError::Transport("expected prompt".into()));
            };
            if prompt.starts_with("fail") {
                return Err(LmCallError::Remote("model overloaded".into()));
            }
            Ok(LmReply {
                text: format!("re:{prompt}"),
                usage: None,
                finish_reason: None,
                latency_ms: 1,
            })
        }
    }

    fn router(limit: u32, sink: Arc<MemorySink>) -> SubcallRouter {
        SubcallRouter {
            client: Arc::new(EchoLm),
            sub_model: "sub-model".into(),
            subcall_limit: limit,
            request_timeout: Duration::from_secs(1),
            shared: Arc::new(Shared::new(Some(sink), false)),
            trace: None,
        }
    }

    #[tokio::test]
    async fn single_query_completes() {
        let sink = Arc::new(MemorySink::new());
        let router = router(10, sink.clone());
        let response = router.query("hi".into(), None).await;
        assert_eq!(response, "re:hi");

        let kinds: Vec<_> = sink.events().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::SubcallStarted, EventKind::SubcallCompleted]);
    }

    #[tokio::test]
    async fn failure_becomes_error_string() {
        let sink = Arc::new(MemorySink::new());
        let router = router(10, sink.clone());
        let response = router.query("fail please".into(), None).await;
        assert!(response.starts_with("Error: LM query failed - "));
        assert!(response.contains("model overloaded"));

        let kinds: Vec<_> = sink.events().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::SubcallStarted, EventKind::SubcallFailed]);
    }

    #[tokio::test]
    async fn budget_exhaustion_returns_exact_string() {
        let sink = Arc::new(MemorySink::new());
        let router = router(1, sink.clone());

        assert_eq!(router.query("a".into(), None).await, "re:a");
        assert_eq!(
            router.query("b".into(), None).await,
            "Error: sub-call limit reached (1)"
        );
        // Rejection is sticky: the next one is rejected too.
        assert_eq!(
            router.query("c".into(), None).await,
            "Error: sub-call limit reached (1)"
        );
        assert_eq!(router.shared.subcall_count().await, 1);
    }

    #[tokio::test]
    async fn batch_preserves_order_and_brackets_events() {
        let sink = Arc::new(MemorySink::new());
        let router = router(10, sink.clone());

        let responses = router
            .query_batched(vec!["a".into(), "fail b".into(), "c".into()], None)
            .await;
        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0], "re:a");
        assert!(responses[1].starts_with("Error: LM query failed"));
        assert_eq!(responses[2], "re:c");

        let kinds: Vec<_> = sink.events().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds.first(), Some(&EventKind::SubcallBatchStarted));
        assert_eq!(kinds.last(), Some(&EventKind::SubcallBatchCompleted));
        assert_eq!(
            kinds
                .iter()
                .filter(|k| **k == EventKind::SubcallStarted)
                .count(),
            3
        );
    }

    #[tokio::test]
    async fn batch_budget_checked_per_prompt() {
        let sink = Arc::new(MemorySink::new());
        let router = router(2, sink.clone());

        let responses = router
            .query_batched(vec!["a".into(), "b".into(), "c".into()], None)
            .await;
        assert_eq!(responses[0], "re:a");
        assert_eq!(responses[1], "re:b");
        assert_eq!(responses[2], "Error: sub-call limit reached (2)");
        assert_eq!(router.shared.subcall_count().await, 2);
    }

    #[tokio::test]
    async fn model_override_wins() {
        let sink = Arc::new(MemorySink::new());
        let router = router(10, sink.clone());
        router.query("hi".into(), Some("other-model".into())).await;

        let events = sink.events();
        let started = events
            .iter()
            .find(|e| e.kind == EventKind::SubcallStarted)
            .unwrap();
        assert_eq!(
            started.payload.as_ref().unwrap()["model"],
            "other-model"
        );
    }
}
