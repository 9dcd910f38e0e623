//! One-stop imports for harness users.
//!
//! ```ignore
//! use rlm_harness::prelude::*;
//! ```

pub use crate::api::{LmClient, LmInput, LmReply, OpenRouterClient};
pub use crate::error::{LmCallError, RlmError, WorkerError};
pub use crate::harness::events::{EventSink, LoggingSink, MemorySink, NullSink, RunEvent};
pub use crate::harness::trace::{MemoryCollector, RunTrace, TraceCollector};
pub use crate::harness::{Completion, CompletionRequest, ContextInput, Rlm, RlmConfig};
pub use crate::redact::RedactionPolicy;
pub use crate::worker::{Interpreter, WorkerClient};
pub use crate::{Message, MessageRole};
