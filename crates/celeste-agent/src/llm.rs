use crate::backends::gemini::GeminiBackend;
use crate::backends::openai::OpenAiBackend;
use crate::backends::{detect_backend_kind, BackendKind, LlmBackend};
use crate::config::ClientConfig;
use crate::stream::{ChatCompletionResult, StreamChunk};
use celeste_core::{CelesteResult, ChatMessage, SkillDefinition};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// LLM client that dispatches to the backend matching the configured endpoint.
///
/// Uses the `LlmBackend` trait to abstract away provider-specific API differences.
/// To add a new provider: implement `LlmBackend` in `backends/` and wire it
/// into [`build_backend`](Self::build_backend).
pub struct LlmClient {
    backend: Box<dyn LlmBackend>,
    config: ClientConfig,
    system_prompt: String,
}

impl LlmClient {
    /// Builds the backend matching `config`.
    pub fn new(config: ClientConfig) -> Self {
        let backend = Self::build_backend(&config);
        Self {
            backend,
            config,
            system_prompt: String::new(),
        }
    }

    /// Create from a pre-built backend (for custom providers and tests).
    pub fn from_backend(backend: Box<dyn LlmBackend>, config: ClientConfig) -> Self {
        Self {
            backend,
            config,
            system_prompt: String::new(),
        }
    }

    fn build_backend(config: &ClientConfig) -> Box<dyn LlmBackend> {
        match detect_backend_kind(config.base_url()) {
            BackendKind::Gemini => match GeminiBackend::new(config.clone()) {
                Ok(backend) => Box::new(backend),
                Err(e) => {
                    warn!(
                        base_url = %config.base_url(),
                        error = %e,
                        "Gemini backend unavailable, falling back to chat completions"
                    );
                    Box::new(OpenAiBackend::new(config.clone()))
                }
            },
            BackendKind::OpenAi => Box::new(OpenAiBackend::new(config.clone())),
        }
    }

    /// Streaming chat completion.
    ///
    /// `callback` runs on the calling task for every chunk, in arrival order.
    pub async fn send_stream<F>(
        &self,
        cancel: &CancellationToken,
        messages: &[ChatMessage],
        tools: &[SkillDefinition],
        mut callback: F,
    ) -> CelesteResult<ChatCompletionResult>
    where
        F: FnMut(StreamChunk) + Send,
    {
        self.backend
            .send_stream(cancel, messages, tools, &mut callback)
            .await
    }

    /// Non-streaming chat completion.
    pub async fn send_sync(
        &self,
        cancel: &CancellationToken,
        messages: &[ChatMessage],
        tools: &[SkillDefinition],
    ) -> CelesteResult<ChatCompletionResult> {
        self.backend.send_sync(cancel, messages, tools).await
    }

    /// Sets the persona prompt; it survives backend swaps.
    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system_prompt = prompt.into();
        self.backend.set_system_prompt(self.system_prompt.clone());
    }

    /// Applies a new configuration, rebuilding the backend for it.
    pub fn update_config(&mut self, config: ClientConfig) {
        let previous = self.backend.kind();
        let mut backend = Self::build_backend(&config);
        backend.set_system_prompt(self.system_prompt.clone());

        if backend.kind() != previous {
            info!(
                from = %previous,
                to = %backend.kind(),
                model = %config.model,
                "Switching LLM backend"
            );
        }

        let mut old = std::mem::replace(&mut self.backend, backend);
        old.close();
        self.config = config;
    }

    /// Active configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Protocol of the active backend.
    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Releases the backend.
    pub fn close(&mut self) {
        self.backend.close();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const GEMINI_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

    #[test]
    fn test_rest_endpoint_builds_openai_backend() {
        let client = LlmClient::new(ClientConfig::new("gpt-4o", "sk-test"));
        assert_eq!(client.backend_kind(), BackendKind::OpenAi);
    }

    #[test]
    fn test_gemini_endpoint_builds_gemini_backend() {
        let config = ClientConfig::new("gemini-1.5-flash", "AIza-test").with_base_url(GEMINI_URL);
        let client = LlmClient::new(config);
        assert_eq!(client.backend_kind(), BackendKind::Gemini);
    }

    #[test]
    fn test_gemini_without_credentials_falls_back() {
        let config = ClientConfig::new("gemini-1.5-flash", "").with_base_url(GEMINI_URL);
        let client = LlmClient::new(config);
        assert_eq!(client.backend_kind(), BackendKind::OpenAi);
    }

    #[test]
    fn test_update_config_switches_kind() {
        let mut client = LlmClient::new(ClientConfig::new("gpt-4o", "sk-test"));
        client.set_system_prompt("You are Celeste.");

        let config = ClientConfig::new("gemini-1.5-pro", "AIza-test").with_base_url(GEMINI_URL);
        client.update_config(config.clone());
        assert_eq!(client.backend_kind(), BackendKind::Gemini);
        assert_eq!(client.config(), &config);

        client.update_config(ClientConfig::new("gpt-4o-mini", "sk-test"));
        assert_eq!(client.backend_kind(), BackendKind::OpenAi);
        assert_eq!(client.config().model, "gpt-4o-mini");
    }
}
