//! OpenRouter chat-completions client with per-call deadlines.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::LmCallError;
use crate::{Message, OPENROUTER_URL};

// ── Call types ─────────────────────────────────────────────────────

/// Input to a single LM call: a flat prompt or an ordered message history.
#[derive(Debug, Clone)]
pub enum LmInput {
    Prompt(String),
    Messages(Vec<Message>),
}

impl LmInput {
    /// Flatten into the message list the chat API expects.
    pub fn into_messages(self) -> Vec<Message> {
        match self {
            LmInput::Prompt(text) => vec![Message::user(text)],
            LmInput::Messages(messages) => messages,
        }
    }

    /// Total character count across the input, for logging.
    pub fn total_chars(&self) -> usize {
        match self {
            LmInput::Prompt(text) => text.chars().count(),
            LmInput::Messages(messages) => {
                messages.iter().map(|m| m.content.chars().count()).sum()
            }
        }
    }
}

impl From<&str> for LmInput {
    fn from(text: &str) -> Self {
        LmInput::Prompt(text.to_string())
    }
}

impl From<String> for LmInput {
    fn from(text: String) -> Self {
        LmInput::Prompt(text)
    }
}

impl From<Vec<Message>> for LmInput {
    fn from(messages: Vec<Message>) -> Self {
        LmInput::Messages(messages)
    }
}

/// Token usage statistics, when the provider reports them.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UsageInfo {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

/// The result of a successful LM call.
#[derive(Debug, Clone)]
pub struct LmReply {
    pub text: String,
    pub usage: Option<UsageInfo>,
    pub finish_reason: Option<String>,
    pub latency_ms: u64,
}

/// Text-in/text-out LM primitive.
///
/// Implementations must honor `deadline` by aborting the underlying
/// transport, classify failures into [`LmCallError`], and never retry.
/// Retry policy belongs to callers, and the harness core deliberately has
/// none.
#[async_trait]
pub trait LmClient: Send + Sync {
    async fn call(
        &self,
        model: &str,
        input: LmInput,
        deadline: Duration,
    ) -> Result<LmReply, LmCallError>;
}

// ── OpenRouter implementation ──────────────────────────────────────

#[derive(Serialize, Debug)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
}

#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
}

/// Async HTTP client for the OpenRouter chat completions API.
pub struct OpenRouterClient {
    client: reqwest::Client,
    api_key: String,
    referer: String,
    title: String,
}

impl OpenRouterClient {
    /// Create a new client with the given API key and default headers.
    pub fn new(api_key: impl Into<String>) -> Result<Self, LmCallError> {
        Self::with_headers(api_key, "https://github.com/rlm-harness", "rlm-harness")
    }

    /// Create a new client with custom Referer and X-Title headers.
    pub fn with_headers(
        api_key: impl Into<String>,
        referer: impl Into<String>,
        title: impl Into<String>,
    ) -> Result<Self, LmCallError> {
        let client = reqwest::Client::builder()
            .user_agent("rlm-harness/0.1")
            .build()
            .map_err(|e| LmCallError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            referer: referer.into(),
            title: title.into(),
        })
    }

    async fn send(
        &self,
        model: &str,
        messages: &[Message],
        deadline: Duration,
    ) -> Result<(String, Option<UsageInfo>, Option<String>), LmCallError> {
        let body = ChatRequest { model, messages };

        let resp = self
            .client
            .post(OPENROUTER_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.title)
            .timeout(deadline)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(e, deadline))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| classify_reqwest_error(e, deadline))?;

        if !status.is_success() {
            return Err(LmCallError::Remote(format!("HTTP {status}: {text}")));
        }

        let parsed: RawChatResponse = serde_json::from_str(&text)
            .map_err(|e| LmCallError::Transport(format!("failed to parse response: {e}")))?;

        if let Some(err) = parsed.error {
            return Err(LmCallError::Remote(err.message));
        }

        let choice = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| LmCallError::Remote("empty response (no choices)".into()))?;

        Ok((
            choice.message.content.unwrap_or_default(),
            parsed.usage,
            choice.finish_reason,
        ))
    }
}

fn classify_reqwest_error(err: reqwest::Error, deadline: Duration) -> LmCallError {
    if err.is_timeout() {
        LmCallError::Timeout(deadline)
    } else {
        LmCallError::Transport(err.to_string())
    }
}

#[async_trait]
impl LmClient for OpenRouterClient {
    async fn call(
        &self,
        model: &str,
        input: LmInput,
        deadline: Duration,
    ) -> Result<LmReply, LmCallError> {
        let messages = input.into_messages();
        debug!(
            "LM request: model={}, messages={}, deadline={:?}",
            model,
            messages.len(),
            deadline,
        );

        let start = Instant::now();
        // The reqwest per-request timeout aborts the transfer in flight;
        // the outer timeout covers time not attributed to the request
        // itself (connection pool waits and the like).
        let (text, usage, finish_reason) =
            match tokio::time::timeout(deadline, self.send(model, &messages, deadline)).await {
                Ok(result) => result?,
                Err(_) => return Err(LmCallError::Timeout(deadline)),
            };

        let latency_ms = start.elapsed().as_millis() as u64;
        debug!(
            "LM response: model={}, {} chars in {}ms",
            model,
            text.len(),
            latency_ms,
        );

        Ok(LmReply {
            text,
            usage,
            finish_reason,
            latency_ms,
        })
    }
}
