//! Error taxonomy for the harness.
//!
//! Failures fall into three families with different blast radii:
//!
//! - [`LmCallError`]: a single LM call failed. Fatal at the root call site,
//!   absorbed into an `"Error: ..."` string at a subcall site so interpreter
//!   code keeps running deterministically.
//! - [`WorkerError`]: the interpreter subprocess misbehaved. Always fatal to
//!   the current run.
//! - [`RlmError`]: the run-level error returned from
//!   [`completion`](crate::harness::Rlm::completion), wrapping the above plus
//!   bridge and cancellation failures.
//!
//! No layer retries. A failed run unwinds through the scoped release of the
//! worker and bridge, and the event stream plus trace carry the diagnosis.

use std::time::Duration;

use thiserror::Error;

/// A single LM call failed.
#[derive(Debug, Error)]
pub enum LmCallError {
    /// The per-call deadline fired before the provider answered. The
    /// underlying transport is aborted when this is returned.
    #[error("LM call timed out after {0:?}")]
    Timeout(Duration),

    /// The request never produced a well-formed provider response
    /// (connection refused, reset, DNS, malformed body).
    #[error("LM transport failure: {0}")]
    Transport(String),

    /// The provider answered with an error (non-2xx status or an error
    /// object in the response body).
    #[error("LM provider error: {0}")]
    Remote(String),
}

/// The interpreter worker subprocess failed.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker could not be spawned at all.
    #[error("failed to spawn interpreter `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The worker answered `{ok: false, error}` for a request.
    #[error("worker command failed: {0}")]
    Command(String),

    /// The child process exited while requests were outstanding. All queued
    /// and subsequent requests fail with this error.
    #[error("worker exited unexpectedly (code {code:?}, signal {signal:?})")]
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },

    /// A response line was not valid protocol JSON. Fails the single request
    /// that consumed the line; the channel itself stays usable.
    #[error("invalid response from worker: {0}")]
    Protocol(String),

    /// Reading or writing the child's pipes failed.
    #[error("worker i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Run-level failure returned by `completion`.
#[derive(Debug, Error)]
pub enum RlmError {
    #[error(transparent)]
    Lm(#[from] LmCallError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    /// The loopback bridge could not be started.
    #[error("bridge server failed: {0}")]
    Bridge(String),

    /// The caller's cancellation signal fired while the run was in flight.
    #[error("run cancelled")]
    Cancelled,
}

impl RlmError {
    /// Whether this error was caused by a deadline or cancellation rather
    /// than a hard component failure.
    pub fn is_timeout_or_cancel(&self) -> bool {
        matches!(
            self,
            RlmError::Cancelled | RlmError::Lm(LmCallError::Timeout(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lm_error_display() {
        let err = LmCallError::Remote("HTTP 500: upstream".into());
        assert!(err.to_string().contains("HTTP 500"));

        let err = LmCallError::Timeout(Duration::from_secs(120));
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn worker_exited_display_carries_code() {
        let err = WorkerError::Exited {
            code: Some(1),
            signal: None,
        };
        assert!(err.to_string().contains("code Some(1)"));
    }

    #[test]
    fn rlm_error_classification() {
        assert!(RlmError::Cancelled.is_timeout_or_cancel());
        assert!(RlmError::Lm(LmCallError::Timeout(Duration::from_secs(1))).is_timeout_or_cancel());
        assert!(!RlmError::Bridge("bind failed".into()).is_timeout_or_cancel());
    }
}
