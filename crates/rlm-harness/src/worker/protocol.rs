//! Wire types for the interpreter protocol.
//!
//! Requests serialize to `{"cmd": "...", ...}` objects; responses share an
//! `{ok: bool}` envelope with per-command payload fields. On `ok: false` the
//! `error` field is surfaced to the caller.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WorkerError;

/// Parameters for the `init` request.
#[derive(Debug, Clone, Default)]
pub struct InitParams {
    /// Inline context payload, installed as the `context` variable.
    pub context: Option<Value>,
    /// Path to a file holding the canonical context serialization; when
    /// set, the worker reads the file instead of (or on top of) the inline
    /// payload.
    pub context_file_path: Option<String>,
    /// Base URL of the loopback bridge the injected `llm_query` /
    /// `llm_query_batched` callables POST against.
    pub bridge_url: String,
    /// The user question, seeded as the `question` variable.
    pub question: Option<String>,
}

/// A request line, tagged by command.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum WorkerRequest {
    Init {
        #[serde(skip_serializing_if = "Option::is_none")]
        context: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        context_file_path: Option<String>,
        bridge_url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        question: Option<String>,
    },
    Exec {
        code: String,
    },
    FinalVar {
        name: String,
    },
    ShowVars,
    Close,
}

impl From<InitParams> for WorkerRequest {
    fn from(params: InitParams) -> Self {
        WorkerRequest::Init {
            context: params.context,
            context_file_path: params.context_file_path,
            bridge_url: params.bridge_url,
            question: params.question,
        }
    }
}

/// Shared response envelope. Per-command payload fields are flattened in
/// and extracted by the typed accessors below.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerResponse {
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

impl WorkerResponse {
    /// Decode a raw response line, mapping `{ok: false}` to
    /// [`WorkerError::Command`] and malformed JSON to
    /// [`WorkerError::Protocol`].
    pub fn decode(line: &str) -> Result<Self, WorkerError> {
        let response: WorkerResponse = serde_json::from_str(line.trim())
            .map_err(|e| WorkerError::Protocol(format!("{e}; raw={}", line.trim())))?;
        if !response.ok {
            return Err(WorkerError::Command(
                response
                    .error
                    .unwrap_or_else(|| "worker reported failure without detail".to_string()),
            ));
        }
        Ok(response)
    }

    /// Extract the `value` field of `final_var` / `show_vars` responses.
    pub fn into_value(self) -> Result<String, WorkerError> {
        match self.fields.get("value") {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Ok(other.to_string()),
            None => Err(WorkerError::Protocol("response missing `value` field".into())),
        }
    }

    /// Extract the payload of an `exec` response.
    pub fn into_exec_result(self) -> Result<ExecResult, WorkerError> {
        serde_json::from_value(Value::Object(self.fields))
            .map_err(|e| WorkerError::Protocol(format!("malformed exec response: {e}")))
    }
}

/// Result of one `exec` request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecResult {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// Variable name → type-tagged repr, as serialized by the worker.
    #[serde(default)]
    pub locals: serde_json::Map<String, Value>,
    /// Wall-clock execution time in seconds.
    #[serde(default)]
    pub execution_time: f64,
}

impl ExecResult {
    /// Variable names defined in the namespace, in the worker's
    /// serialization order.
    pub fn variable_names(&self) -> Vec<String> {
        self.locals.keys().cloned().collect()
    }

    pub fn execution_time_ms(&self) -> u64 {
        (self.execution_time * 1000.0).round() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_serialize_with_cmd_tag() {
        let req = WorkerRequest::Exec {
            code: "x = 1".into(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["cmd"], "exec");
        assert_eq!(json["code"], "x = 1");

        let req = WorkerRequest::FinalVar { name: "x".into() };
        assert_eq!(serde_json::to_value(&req).unwrap()["cmd"], "final_var");

        let req = WorkerRequest::Close;
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            serde_json::json!({"cmd": "close"})
        );
    }

    #[test]
    fn init_omits_absent_fields() {
        let req = WorkerRequest::from(InitParams {
            context: Some(serde_json::json!("payload")),
            bridge_url: "http://127.0.0.1:9999".into(),
            ..Default::default()
        });
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["cmd"], "init");
        assert_eq!(json["context"], "payload");
        assert!(json.get("context_file_path").is_none());
        assert!(json.get("question").is_none());
    }

    #[test]
    fn decode_ok_response() {
        let resp = WorkerResponse::decode(r#"{"ok": true, "value": "42"}"#).unwrap();
        assert_eq!(resp.into_value().unwrap(), "42");
    }

    #[test]
    fn decode_error_response() {
        let err = WorkerResponse::decode(r#"{"ok": false, "error": "Worker not initialized"}"#)
            .unwrap_err();
        assert!(matches!(err, WorkerError::Command(msg) if msg.contains("not initialized")));
    }

    #[test]
    fn decode_malformed_line_is_protocol_error() {
        let err = WorkerResponse::decode("not json at all").unwrap_err();
        assert!(matches!(err, WorkerError::Protocol(_)));
    }

    #[test]
    fn exec_result_extracts_fields() {
        let line = r#"{"ok": true, "stdout": "42\n", "stderr": "", "locals": {"x": "int: 42"}, "execution_time": 0.25}"#;
        let result = WorkerResponse::decode(line)
            .unwrap()
            .into_exec_result()
            .unwrap();
        assert_eq!(result.stdout, "42\n");
        assert_eq!(result.variable_names(), vec!["x".to_string()]);
        assert_eq!(result.execution_time_ms(), 250);
    }
}
