//! Recursive language model (RLM) harness.
//!
//! `rlm-harness` turns a user question plus an arbitrary context payload into
//! a final answer by driving an iterative loop between a *root* LLM and a
//! stateful code-interpreter subprocess. Code the model writes into fenced
//! ```` ```repl ```` blocks runs in the interpreter, and interpreter-side
//! code can recursively call back into the LLM (*subcalls*) through an
//! in-process loopback HTTP bridge. The run ends when the model emits a
//! `FINAL(...)` or `FINAL_VAR(...)` directive, or when the iteration budget
//! forces the fallback path.
//!
//! The entry point is [`Rlm`](harness::Rlm):
//!
//! ```ignore
//! use rlm_harness::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), RlmError> {
//!     let api_key = std::env::var("OPENROUTER_KEY").expect("OPENROUTER_KEY");
//!     let client = OpenRouterClient::new(api_key)?;
//!
//!     let config = RlmConfig::new("anthropic/claude-sonnet-4", "openai/gpt-5-mini")
//!         .with_interpreter_command(["python3", "-u", "worker.py"])
//!         .with_max_iterations(8);
//!
//!     let result = Rlm::new(client, config)
//!         .with_event_sink(LoggingSink)
//!         .completion(CompletionRequest {
//!             context: ContextInput::Text("...huge document...".into()),
//!             question: Some("What changed between v1 and v2?".into()),
//!             ..Default::default()
//!         })
//!         .await?;
//!
//!     println!("{}", result.answer);
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`harness`] | [`Rlm`](harness::Rlm) orchestrator, config, events, trace, context metadata |
//! | [`api`] | [`LmClient`](api::LmClient) trait and the OpenRouter-backed implementation |
//! | [`worker`] | Interpreter subprocess client and its line-delimited JSON protocol |
//! | [`bridge`] | Loopback HTTP server that routes interpreter subcalls back into the LM |
//! | [`parse`] | REPL block / directive extraction and truncation |
//! | [`redact`] | Head/tail redaction with SHA-256 digests for logging |
//!
//! # Design principles
//!
//! 1. **One run, one scope.** All run state is born when `completion` is
//!    entered and destroyed when it exits; the worker and bridge are released
//!    on every exit path, success or failure.
//! 2. **A total order of events.** Every state change is emitted through the
//!    event sink with a per-run, strictly increasing sequence number assigned
//!    at the point of emission.
//! 3. **Budgets are hard.** Iteration and subcall limits are enforced inside
//!    the same critical section that emits the accounting events, so the
//!    counters and the stream can never disagree.
//! 4. **Subcall failures are absorbed.** Interpreter code always receives a
//!    string (a response or an `"Error: ..."` message), so a failed subcall
//!    never wedges the REPL mid-execution.

pub mod api;
pub mod bridge;
pub mod error;
pub mod harness;
pub mod parse;
pub mod prelude;
pub mod redact;
pub mod worker;

use serde::{Deserialize, Serialize};

// ── Constants ──────────────────────────────────────────────────────

pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Default model driving the iteration loop.
pub const DEFAULT_ROOT_MODEL: &str = "anthropic/claude-sonnet-4";

/// Default model answering recursive subcalls from interpreter code.
pub const DEFAULT_SUB_MODEL: &str = "openai/gpt-5-mini";

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the root conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// A message in the root conversation.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}
