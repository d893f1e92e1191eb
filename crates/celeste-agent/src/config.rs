use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Endpoint used when no base URL is configured.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Connection and presentation settings for an [`LlmClient`](crate::LlmClient).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// API key or access token; may be empty for local servers.
    #[serde(default)]
    pub api_key: String,
    /// API root including its version segment, e.g. `https://api.x.ai/v1`.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Model name sent with each request.
    pub model: String,
    /// Whole-exchange timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Send conversations without the persona system prompt.
    #[serde(default)]
    pub skip_persona_prompt: bool,
    /// Replay dumped responses at typing speed.
    #[serde(default)]
    pub simulate_typing: bool,
    /// Characters per second used when replaying dumped responses.
    #[serde(default = "default_typing_speed")]
    pub typing_speed: u32,
    /// Upper bound on completion tokens.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Overrides the model's context window when set.
    #[serde(default)]
    pub context_limit: Option<usize>,
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_typing_speed() -> u32 {
    40
}

fn default_max_tokens() -> u32 {
    4096
}

impl ClientConfig {
    /// Defaults for everything but the model and key.
    pub fn new(model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            model: model.into(),
            timeout_secs: default_timeout_secs(),
            skip_persona_prompt: false,
            simulate_typing: false,
            typing_speed: default_typing_speed(),
            max_tokens: default_max_tokens(),
            context_limit: None,
        }
    }

    /// Sets the API root.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Overlays `CELESTE_API_KEY`, `CELESTE_BASE_URL` and `CELESTE_MODEL`
    /// when they are set and non-empty.
    pub fn with_env_overrides(mut self) -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        if let Some(key) = var("CELESTE_API_KEY") {
            self.api_key = key;
        }
        if let Some(url) = var("CELESTE_BASE_URL") {
            self.base_url = Some(url);
        }
        if let Some(model) = var("CELESTE_MODEL") {
            self.model = model;
        }
        self
    }

    /// Configured base URL without a trailing slash, or the OpenAI default.
    pub fn base_url(&self) -> &str {
        match &self.base_url {
            Some(url) if !url.is_empty() => url.trim_end_matches('/'),
            _ => DEFAULT_BASE_URL,
        }
    }

    /// Request timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Builds the shared HTTP client with the configured timeout.
pub(crate) fn http_client(config: &ClientConfig) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(config.timeout())
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Falling back to default HTTP client");
            reqwest::Client::new()
        })
}
