//! The orchestration core: run configuration, the iteration state machine,
//! event emission, subcall accounting, and post-hoc traces.
//!
//! | Piece | Role |
//! |-------|------|
//! | [`Rlm`] | The harness itself; one [`completion`](Rlm::completion) call is one run |
//! | [`config`] | [`RlmConfig`](config::RlmConfig) with resolved defaults and `RLM_*` overrides |
//! | [`context`] | Context payloads and the metadata retained about them |
//! | [`events`] | [`RunEvent`](events::RunEvent) stream and [`EventSink`](events::EventSink) |
//! | [`trace`] | Structured run records and [`TraceCollector`](trace::TraceCollector) |

pub mod config;
pub mod context;
pub mod events;
mod orchestrator;
pub mod prompt;
mod state;
mod subcall;
pub mod trace;

pub use config::RlmConfig;
pub use context::{ContextInput, ContextMetadata};
pub use orchestrator::{Completion, CompletionRequest, Rlm};
