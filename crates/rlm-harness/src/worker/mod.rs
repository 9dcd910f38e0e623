//! Interpreter worker: a long-lived child process executing REPL code with
//! persistent globals, driven over a line-delimited JSON protocol.
//!
//! The wire protocol is one JSON request per line on the child's stdin and
//! one JSON response per line on its stdout, strictly in request order. The
//! protocol has no request ids, so ordering *is* the correlation. Standard
//! error from the child is forwarded to `tracing` for operator diagnosis and
//! never gates requests.
//!
//! [`Interpreter`] is the seam the orchestrator talks to;
//! [`WorkerClient`](client::WorkerClient) is the process-backed
//! implementation.

mod client;
pub mod protocol;

pub use client::WorkerClient;
pub use protocol::{ExecResult, InitParams};

use async_trait::async_trait;

use crate::error::WorkerError;

/// The operations the harness needs from an interpreter.
///
/// Implementations must preserve FIFO request/response ordering and keep
/// interpreter globals alive across `exec` calls for the lifetime of one
/// run.
#[async_trait]
pub trait Interpreter: Send + Sync {
    /// Install the context payload and helper callables into the
    /// interpreter namespace. Must be called exactly once, before any other
    /// request.
    async fn init(&self, params: InitParams) -> Result<(), WorkerError>;

    /// Execute a code block against the persistent namespace.
    async fn exec(&self, code: &str) -> Result<ExecResult, WorkerError>;

    /// Resolve the string representation of a named variable.
    async fn final_var(&self, name: &str) -> Result<String, WorkerError>;

    /// Human-readable summary of the variables currently defined.
    async fn show_vars(&self) -> Result<String, WorkerError>;

    /// Best-effort graceful shutdown. Must be safe to call on a worker that
    /// has already died, and must leave no child process behind.
    async fn close(&self);
}
