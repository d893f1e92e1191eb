/// Native Google GenAI backend.
pub mod gemini;
/// Chat-completions backend.
pub mod openai;

use crate::stream::{ChatCompletionResult, StreamChunk};
use async_trait::async_trait;
use celeste_core::{CelesteError, CelesteResult, ChatMessage, SkillDefinition};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Which wire protocol a backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Chat-completions compatible REST (OpenAI, Grok, Venice, OpenRouter, ...).
    OpenAi,
    /// Native Google GenAI protocol (Gemini API, Vertex AI).
    Gemini,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::OpenAi => f.write_str("openai"),
            BackendKind::Gemini => f.write_str("gemini"),
        }
    }
}

const GOOGLE_HOST_MARKERS: &[&str] = &[
    "generativelanguage.googleapis.com",
    "aiplatform.googleapis.com",
    "vertexai",
];

/// Picks the protocol for an endpoint. Anything not recognisably Google is
/// treated as chat-completions compatible.
pub fn detect_backend_kind(base_url: &str) -> BackendKind {
    if GOOGLE_HOST_MARKERS.iter().any(|m| base_url.contains(m)) {
        BackendKind::Gemini
    } else {
        BackendKind::OpenAi
    }
}

/// Trait for LLM provider backends.
///
/// A backend runs one exchange at a time and normalizes its provider's
/// stream into [`StreamChunk`]s and a [`ChatCompletionResult`].
///
/// To add a provider:
/// 1. Create a module in `backends/`
/// 2. Implement `LlmBackend` for it
/// 3. Teach [`detect_backend_kind`] and `LlmClient::build_backend` about it
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Streams one exchange.
    ///
    /// `callback` sees chunks in arrival order, ending with exactly one
    /// `is_final` chunk. Upstream error payloads produce a terminal chunk
    /// with finish reason `"error"` and an `Upstream` error. On cancellation
    /// the callback is not invoked again and `Cancelled` is returned.
    async fn send_stream(
        &self,
        cancel: &CancellationToken,
        messages: &[ChatMessage],
        tools: &[SkillDefinition],
        callback: &mut (dyn FnMut(StreamChunk) + Send),
    ) -> CelesteResult<ChatCompletionResult>;

    /// Non-streaming exchange. Drives [`send_stream`](Self::send_stream)
    /// to completion unless the backend has a native call.
    async fn send_sync(
        &self,
        cancel: &CancellationToken,
        messages: &[ChatMessage],
        tools: &[SkillDefinition],
    ) -> CelesteResult<ChatCompletionResult> {
        let mut ignore = |_: StreamChunk| {};
        self.send_stream(cancel, messages, tools, &mut ignore).await
    }

    /// Replaces the persona prompt sent with every exchange.
    fn set_system_prompt(&mut self, prompt: String);

    /// Releases held resources. The backend is not used afterwards.
    fn close(&mut self) {}

    /// Protocol this backend speaks.
    fn kind(&self) -> BackendKind;
}

/// Sends a prepared request, racing it against `cancel`. Non-success
/// statuses become `Http` errors carrying the response body.
pub(crate) async fn send_request(
    cancel: &CancellationToken,
    request: reqwest::RequestBuilder,
) -> CelesteResult<reqwest::Response> {
    let resp = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(CelesteError::Cancelled),
        resp = request.send() => resp.map_err(|e| CelesteError::Http(e.to_string()))?,
    };

    let status = resp.status();
    if !status.is_success() {
        let body = resp
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        return Err(CelesteError::Http(format!("API error {status}: {body}")));
    }
    Ok(resp)
}

/// Extracts the message of an in-band `{"error": ...}` payload.
pub(crate) fn upstream_error(event: &serde_json::Value) -> Option<String> {
    let error = event.get("error")?;
    if error.is_null() {
        return None;
    }
    Some(
        error["message"]
            .as_str()
            .or_else(|| error.as_str())
            .map_or_else(|| error.to_string(), str::to_string),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_backend_kind() {
        assert_eq!(
            detect_backend_kind("https://generativelanguage.googleapis.com/v1beta"),
            BackendKind::Gemini
        );
        assert_eq!(
            detect_backend_kind("https://us-central1-aiplatform.googleapis.com/v1/projects/p"),
            BackendKind::Gemini
        );
        assert_eq!(
            detect_backend_kind("https://proxy.example.com/vertexai"),
            BackendKind::Gemini
        );
        assert_eq!(detect_backend_kind("https://api.x.ai/v1"), BackendKind::OpenAi);
        assert_eq!(detect_backend_kind(""), BackendKind::OpenAi);
    }

    #[test]
    fn test_upstream_error_extraction() {
        let event = serde_json::json!({"error": {"message": "quota exceeded", "code": 429}});
        assert_eq!(upstream_error(&event).as_deref(), Some("quota exceeded"));

        let bare = serde_json::json!({"error": "boom"});
        assert_eq!(upstream_error(&bare).as_deref(), Some("boom"));

        assert!(upstream_error(&serde_json::json!({"choices": []})).is_none());
        assert!(upstream_error(&serde_json::json!({"error": null})).is_none());
    }
}
