//! Shared mutable run state: counters, active bindings, and the event
//! emitter.
//!
//! The sequence counter, subcall accounting, and the active
//! iteration/execution bindings are touched both by the main iteration task
//! and by bridge handlers running concurrently with an in-flight `exec`.
//! Every mutation happens inside the same critical section that assigns the
//! event's sequence number and awaits the sink, so the counters and the
//! observed event order can never disagree. The sink is expected to be
//! cheap; nothing else is awaited while the guard is held.

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::warn;

use crate::harness::events::{bound_payload, EventKind, EventSink, RunEvent};

#[derive(Debug, Default)]
struct RunState {
    seq: u64,
    subcall_count: u32,
    subcall_sequence: u32,
    repl_sequence: u32,
    active_iteration: Option<u32>,
    active_repl_execution: Option<String>,
}

/// Outcome of subcall admission: the assigned id, the bindings snapshotted
/// at arrival, and whether the budget admitted the call.
#[derive(Debug, Clone)]
pub(crate) struct SubcallTicket {
    pub id: String,
    pub iteration: Option<u32>,
    pub repl_execution_id: Option<String>,
    pub admitted: bool,
}

/// Run-scoped shared state and event emitter.
pub(crate) struct Shared {
    state: Mutex<RunState>,
    sink: Option<Arc<dyn EventSink>>,
    verbose: bool,
}

impl Shared {
    pub fn new(sink: Option<Arc<dyn EventSink>>, verbose: bool) -> Self {
        Self {
            state: Mutex::new(RunState::default()),
            sink,
            verbose,
        }
    }

    fn now_ms() -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }

    /// Build the event, assign its sequence number, and deliver it, all
    /// under the state guard so emission order equals sequence order.
    async fn emit_locked(
        &self,
        state: &mut RunState,
        kind: EventKind,
        summary: String,
        payload: Option<Map<String, Value>>,
    ) {
        state.seq += 1;
        let event = RunEvent {
            ts: Self::now_ms(),
            seq: state.seq,
            kind,
            summary,
            payload: payload.map(bound_payload),
        };
        if let Some(ref sink) = self.sink
            && let Err(e) = sink.deliver(&event).await
            && self.verbose
        {
            warn!("event sink failed for seq {}: {e}", event.seq);
        }
    }

    /// Emit an event with no associated state mutation.
    pub async fn emit(
        &self,
        kind: EventKind,
        summary: impl Into<String>,
        payload: Option<Map<String, Value>>,
    ) {
        let mut state = self.state.lock().await;
        self.emit_locked(&mut state, kind, summary.into(), payload)
            .await;
    }

    /// Assign the next `repl-<N>` id, bind it as the active execution, and
    /// emit `repl.execution.started`.
    pub async fn begin_repl_execution(&self, iteration: u32) -> String {
        let mut state = self.state.lock().await;
        state.repl_sequence += 1;
        let id = format!("repl-{}", state.repl_sequence);
        state.active_iteration = Some(iteration);
        state.active_repl_execution = Some(id.clone());

        let mut payload = Map::new();
        payload.insert("replExecutionId".into(), id.clone().into());
        payload.insert("iteration".into(), iteration.into());
        self.emit_locked(
            &mut state,
            EventKind::ReplExecutionStarted,
            format!("executing REPL block {id} (iteration {iteration})"),
            Some(payload),
        )
        .await;
        id
    }

    /// Clear the active bindings and emit `repl.execution.completed` with
    /// the caller-supplied payload. Also used on the failure path, where
    /// `completed` is not emitted but the bindings must still be cleared.
    pub async fn end_repl_execution(
        &self,
        id: &str,
        completed_payload: Option<Map<String, Value>>,
    ) {
        let mut state = self.state.lock().await;
        state.active_iteration = None;
        state.active_repl_execution = None;
        if let Some(payload) = completed_payload {
            self.emit_locked(
                &mut state,
                EventKind::ReplExecutionCompleted,
                format!("REPL block {id} completed"),
                Some(payload),
            )
            .await;
        }
    }

    /// Subcall admission: assign `sub-<N>`, snapshot the active bindings,
    /// check the budget, and emit `subcall.started` or `subcall.rejected`
    /// in one critical section, so the counter and the stream agree.
    pub async fn admit_subcall(
        &self,
        limit: u32,
        model: &str,
        batch_index: Option<usize>,
    ) -> SubcallTicket {
        let mut state = self.state.lock().await;
        state.subcall_sequence += 1;
        let id = format!("sub-{}", state.subcall_sequence);
        let iteration = state.active_iteration;
        let repl_execution_id = state.active_repl_execution.clone();

        if repl_execution_id.is_none() {
            // Nothing should be calling the bridge outside an exec window;
            // the subcall is still processed with null bindings.
            warn!("subcall {id} arrived with no active REPL execution");
        }

        let mut payload = Map::new();
        payload.insert("subcallId".into(), id.clone().into());
        payload.insert("iterationIndex".into(), json_opt_u32(iteration));
        payload.insert(
            "replExecutionId".into(),
            repl_execution_id.clone().map_or(Value::Null, Value::String),
        );
        payload.insert("model".into(), model.into());
        if let Some(index) = batch_index {
            payload.insert("batchIndex".into(), index.into());
        }

        let admitted = state.subcall_count < limit;
        if admitted {
            state.subcall_count += 1;
            self.emit_locked(
                &mut state,
                EventKind::SubcallStarted,
                format!("subcall {id} started (model {model})"),
                Some(payload),
            )
            .await;
        } else {
            payload.insert("limit".into(), limit.into());
            self.emit_locked(
                &mut state,
                EventKind::SubcallRejected,
                format!("subcall {id} rejected: budget of {limit} exhausted"),
                Some(payload),
            )
            .await;
        }

        SubcallTicket {
            id,
            iteration,
            repl_execution_id,
            admitted,
        }
    }

    pub async fn subcall_count(&self) -> u32 {
        self.state.lock().await.subcall_count
    }
}

pub(crate) fn json_opt_u32(value: Option<u32>) -> Value {
    value.map_or(Value::Null, |v| v.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::events::MemorySink;

    #[tokio::test]
    async fn sequence_is_monotonic_from_one() {
        let sink = Arc::new(MemorySink::new());
        let shared = Shared::new(Some(sink.clone()), false);

        shared.emit(EventKind::RunStarted, "start", None).await;
        let id = shared.begin_repl_execution(1).await;
        shared.end_repl_execution(&id, Some(Map::new())).await;
        shared.emit(EventKind::RunEndedCompleted, "end", None).await;

        let events = sink.events();
        assert_eq!(events.first().unwrap().seq, 1);
        for pair in events.windows(2) {
            assert!(pair[1].seq > pair[0].seq);
        }
    }

    #[tokio::test]
    async fn repl_ids_increment_and_bind() {
        let sink = Arc::new(MemorySink::new());
        let shared = Shared::new(Some(sink.clone()), false);

        let first = shared.begin_repl_execution(1).await;
        assert_eq!(first, "repl-1");
        let ticket = shared.admit_subcall(10, "m", None).await;
        assert_eq!(ticket.repl_execution_id.as_deref(), Some("repl-1"));
        assert_eq!(ticket.iteration, Some(1));
        shared.end_repl_execution(&first, Some(Map::new())).await;

        let second = shared.begin_repl_execution(2).await;
        assert_eq!(second, "repl-2");
        shared.end_repl_execution(&second, Some(Map::new())).await;

        // Outside the execution window the bindings are null.
        let ticket = shared.admit_subcall(10, "m", None).await;
        assert!(ticket.repl_execution_id.is_none());
        assert!(ticket.iteration.is_none());
    }

    #[tokio::test]
    async fn budget_rejects_at_limit_without_counting() {
        let sink = Arc::new(MemorySink::new());
        let shared = Shared::new(Some(sink.clone()), false);

        let first = shared.admit_subcall(1, "m", None).await;
        assert!(first.admitted);
        assert_eq!(first.id, "sub-1");

        let second = shared.admit_subcall(1, "m", None).await;
        assert!(!second.admitted);
        assert_eq!(second.id, "sub-2");
        assert_eq!(shared.subcall_count().await, 1);

        // The one after is rejected too; ids keep advancing.
        let third = shared.admit_subcall(1, "m", None).await;
        assert!(!third.admitted);
        assert_eq!(third.id, "sub-3");
        assert_eq!(shared.subcall_count().await, 1);

        let kinds: Vec<_> = sink.events().into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::SubcallStarted,
                EventKind::SubcallRejected,
                EventKind::SubcallRejected,
            ]
        );
    }
}
