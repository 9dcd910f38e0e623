//! Run configuration with resolved defaults.
//!
//! Construct with [`RlmConfig::new`], adjust through the `with_*` builders,
//! and let [`Rlm::new`](crate::harness::Rlm::new) resolve `RLM_*`
//! environment overrides on top. Invalid override values are ignored.

use std::time::Duration;

use crate::harness::trace::ConfigSnapshot;
use crate::redact::RedactionPolicy;
use crate::{DEFAULT_ROOT_MODEL, DEFAULT_SUB_MODEL};

pub const DEFAULT_MAX_ITERATIONS: u32 = 16;
pub const DEFAULT_MAX_TOTAL_SUBCALLS: u32 = 200;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_MAX_EXECUTION_OUTPUT_CHARS: usize = 20_000;

const MAX_ITERATIONS_ENV: &str = "RLM_MAX_ITERATIONS";
const MAX_TOTAL_SUBCALLS_ENV: &str = "RLM_MAX_TOTAL_SUBCALLS";
const REQUEST_TIMEOUT_MS_ENV: &str = "RLM_REQUEST_TIMEOUT_MS";
const MAX_EXECUTION_OUTPUT_CHARS_ENV: &str = "RLM_MAX_EXECUTION_OUTPUT_CHARS";
const VERBOSE_ENV: &str = "RLM_VERBOSE";

/// Configuration for a harness instance.
#[derive(Debug, Clone)]
pub struct RlmConfig {
    /// Model driving the iteration loop.
    pub root_model: String,
    /// Model answering interpreter subcalls (unless the request overrides).
    pub sub_model: String,
    /// Root iterations before the fallback path.
    pub max_iterations: u32,
    /// Total subcall budget for the run.
    pub max_total_subcalls: u32,
    /// Per-LM-call deadline, root and subcall alike.
    pub request_timeout: Duration,
    /// Truncation limit for stdout/stderr fed back into the conversation.
    pub max_execution_output_chars: usize,
    /// Interpreter launch argv, e.g. `["python3", "-u", "worker.py"]`.
    pub interpreter_command: Vec<String>,
    /// Log sink failures and other recoverable oddities.
    pub verbose: bool,
    /// Redaction thresholds for traces and previews.
    pub redaction: RedactionPolicy,
}

impl Default for RlmConfig {
    fn default() -> Self {
        Self {
            root_model: DEFAULT_ROOT_MODEL.to_string(),
            sub_model: DEFAULT_SUB_MODEL.to_string(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_total_subcalls: DEFAULT_MAX_TOTAL_SUBCALLS,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            max_execution_output_chars: DEFAULT_MAX_EXECUTION_OUTPUT_CHARS,
            interpreter_command: Vec::new(),
            verbose: false,
            redaction: RedactionPolicy::default(),
        }
    }
}

impl RlmConfig {
    pub fn new(root_model: impl Into<String>, sub_model: impl Into<String>) -> Self {
        Self {
            root_model: root_model.into(),
            sub_model: sub_model.into(),
            ..Default::default()
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_max_total_subcalls(mut self, max_total_subcalls: u32) -> Self {
        self.max_total_subcalls = max_total_subcalls;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_execution_output_chars(mut self, chars: usize) -> Self {
        self.max_execution_output_chars = chars.max(1);
        self
    }

    pub fn with_interpreter_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interpreter_command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// The policy is clamped so its head/tail windows fit inside its
    /// thresholds; a policy that would make redaction overflow its own
    /// limit is coerced, not honored.
    pub fn with_redaction(mut self, policy: RedactionPolicy) -> Self {
        self.redaction = policy.clamped();
        self
    }

    /// Apply `RLM_*` environment overrides and return the resolved config.
    /// Also clamps the redaction policy, covering configs built by struct
    /// literal rather than through [`with_redaction`](Self::with_redaction).
    pub fn resolved(mut self) -> Self {
        self.redaction = self.redaction.clamped();
        self.with_raw_overrides(
            std::env::var(MAX_ITERATIONS_ENV).ok().as_deref(),
            std::env::var(MAX_TOTAL_SUBCALLS_ENV).ok().as_deref(),
            std::env::var(REQUEST_TIMEOUT_MS_ENV).ok().as_deref(),
            std::env::var(MAX_EXECUTION_OUTPUT_CHARS_ENV).ok().as_deref(),
            std::env::var(VERBOSE_ENV).ok().as_deref(),
        )
    }

    fn with_raw_overrides(
        mut self,
        max_iterations: Option<&str>,
        max_total_subcalls: Option<&str>,
        request_timeout_ms: Option<&str>,
        max_execution_output_chars: Option<&str>,
        verbose: Option<&str>,
    ) -> Self {
        if let Some(value) = parse_positive::<u32>(max_iterations) {
            self.max_iterations = value;
        }
        if let Some(value) = parse_positive::<u32>(max_total_subcalls) {
            self.max_total_subcalls = value;
        }
        if let Some(value) = parse_positive::<u64>(request_timeout_ms) {
            self.request_timeout = Duration::from_millis(value);
        }
        if let Some(value) = parse_positive::<usize>(max_execution_output_chars) {
            self.max_execution_output_chars = value;
        }
        if let Some(value) = parse_bool(verbose) {
            self.verbose = value;
        }
        self
    }

    pub(crate) fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            root_model: self.root_model.clone(),
            sub_model: self.sub_model.clone(),
            iteration_limit: self.max_iterations,
            subcall_limit: self.max_total_subcalls,
            request_timeout_ms: self.request_timeout.as_millis() as u64,
            max_execution_output_chars: self.max_execution_output_chars,
            redaction: self.redaction.clone(),
        }
    }
}

fn parse_positive<T>(raw: Option<&str>) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    raw.and_then(|v| v.trim().parse::<T>().ok())
        .filter(|v| *v > T::default())
}

fn parse_bool(raw: Option<&str>) -> Option<bool> {
    match raw.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        Some("1") | Some("true") | Some("yes") | Some("on") => Some(true),
        Some("0") | Some("false") | Some("no") | Some("off") => Some(false),
        _ => None,
    }
}
