//! LM access: the [`LmClient`] trait and the OpenRouter-backed
//! implementation.
//!
//! The harness only ever needs a text-in/text-out primitive with a model
//! name, a per-call deadline, and error classification. Everything else
//! (provider routing, auth headers, response envelopes) stays behind the
//! trait so the orchestrator and the bridge can be driven by scripted fakes
//! in tests.

mod client;

pub use client::{LmClient, LmInput, LmReply, OpenRouterClient, UsageInfo};
