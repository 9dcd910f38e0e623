//! Loopback HTTP bridge: the path by which interpreter-side code reaches
//! the LM.
//!
//! The worker's injected `llm_query` / `llm_query_batched` callables POST
//! against this server. Both endpoints delegate to a [`SubcallGateway`]
//! (implemented by the orchestrator's subcall path) and always answer with
//! `{response}` / `{responses}` bodies; subcall-business failures (budget
//! exhausted, LM errors) are serialized into `"Error: ..."` strings the
//! interpreter already knows how to handle. HTTP 5xx is reserved for
//! unexpected infrastructure failures; 404/405 fall out of the router for
//! unknown paths and verbs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::RlmError;

/// How long `stop` waits for in-flight handlers before the server task is
/// aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The subcall path the bridge delegates to.
///
/// Implementations never fail: every prompt maps to a response string,
/// which may be an `"Error: ..."` message.
#[async_trait]
pub trait SubcallGateway: Send + Sync {
    async fn query(&self, prompt: String, model: Option<String>) -> String;

    async fn query_batched(&self, prompts: Vec<String>, model: Option<String>) -> Vec<String>;
}

#[derive(Deserialize)]
struct QueryBody {
    prompt: String,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Serialize)]
struct QueryReply {
    response: String,
}

#[derive(Deserialize)]
struct BatchBody {
    prompts: Vec<String>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Serialize)]
struct BatchReply {
    responses: Vec<String>,
}

async fn llm_query(
    State(gateway): State<Arc<dyn SubcallGateway>>,
    Json(body): Json<QueryBody>,
) -> Json<QueryReply> {
    let response = gateway.query(body.prompt, body.model).await;
    Json(QueryReply { response })
}

async fn llm_query_batched(
    State(gateway): State<Arc<dyn SubcallGateway>>,
    Json(body): Json<BatchBody>,
) -> Json<BatchReply> {
    let responses = gateway.query_batched(body.prompts, body.model).await;
    Json(BatchReply { responses })
}

fn build_router(gateway: Arc<dyn SubcallGateway>) -> Router {
    Router::new()
        .route("/llm_query", post(llm_query))
        .route("/llm_query_batched", post(llm_query_batched))
        .with_state(gateway)
}

/// A running bridge server bound to an ephemeral loopback port.
pub struct BridgeServer {
    url: String,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl BridgeServer {
    /// Bind `127.0.0.1:0` and start serving.
    pub async fn start(gateway: Arc<dyn SubcallGateway>) -> Result<Self, RlmError> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| RlmError::Bridge(format!("failed to bind loopback listener: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| RlmError::Bridge(format!("failed to read bound address: {e}")))?;

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let router = build_router(gateway);
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { signal.cancelled().await });
            if let Err(e) = serve.await {
                debug!("bridge server ended with error: {e}");
            }
        });

        let url = format!("http://{addr}");
        debug!("bridge listening on {url}");
        Ok(Self {
            url,
            shutdown,
            task,
        })
    }

    /// The base URL handed to the worker in `init`.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Stop accepting connections and wait briefly for in-flight handlers;
    /// handlers still running after the grace period are aborted.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut self.task)
            .await
            .is_err()
        {
            debug!("bridge shutdown grace expired, aborting");
            self.task.abort();
        }
    }
}
