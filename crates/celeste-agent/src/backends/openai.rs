use super::{send_request, upstream_error, BackendKind, LlmBackend};
use crate::config::{http_client, ClientConfig};
use crate::sse::{SseEvent, SseStream};
use crate::stream::{
    ChatCompletionResult, StreamAccumulator, StreamChunk, TokenUsage, ToolCallFragment,
};
use async_trait::async_trait;
use celeste_core::{CelesteError, CelesteResult, ChatMessage, Role, SkillDefinition};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Chat-completions compatible backend.
///
/// Works with OpenAI, xAI Grok, Venice, OpenRouter, Anthropic's compat
/// endpoint and anything else that speaks `POST {base}/chat/completions`
/// with SSE streaming.
pub struct OpenAiBackend {
    config: ClientConfig,
    http: reqwest::Client,
    system_prompt: String,
}

impl OpenAiBackend {
    /// Creates a backend with its own HTTP client.
    pub fn new(config: ClientConfig) -> Self {
        let http = http_client(&config);
        Self {
            config,
            http,
            system_prompt: String::new(),
        }
    }

    fn build_messages(&self, messages: &[ChatMessage]) -> Vec<serde_json::Value> {
        let mut api_messages: Vec<serde_json::Value> = Vec::with_capacity(messages.len() + 1);

        if !self.system_prompt.is_empty() && !self.config.skip_persona_prompt {
            api_messages.push(serde_json::json!({
                "role": "system",
                "content": self.system_prompt,
            }));
        }

        for m in messages {
            // Some providers reject messages without content.
            if m.is_blank() {
                continue;
            }
            let value = match m.role {
                Role::Tool => serde_json::json!({
                    "role": "tool",
                    "content": m.content,
                    "tool_call_id": m.tool_call_id.as_deref().unwrap_or_default(),
                }),
                Role::Assistant if !m.tool_calls.is_empty() => {
                    let tool_calls: Vec<serde_json::Value> = m
                        .tool_calls
                        .iter()
                        .map(|tc| {
                            serde_json::json!({
                                "id": tc.id,
                                "type": "function",
                                "function": {
                                    "name": tc.name,
                                    "arguments": tc.arguments,
                                }
                            })
                        })
                        .collect();
                    serde_json::json!({
                        "role": "assistant",
                        "content": m.content,
                        "tool_calls": tool_calls,
                    })
                }
                _ => serde_json::json!({
                    "role": m.role.as_str(),
                    "content": m.content,
                }),
            };
            api_messages.push(value);
        }

        api_messages
    }

    fn build_tools(&self, tools: &[SkillDefinition]) -> Vec<serde_json::Value> {
        tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect()
    }

    fn build_body(
        &self,
        messages: &[ChatMessage],
        tools: &[SkillDefinition],
    ) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "messages": self.build_messages(messages),
            "stream": true,
            "stream_options": { "include_usage": true },
        });

        if !tools.is_empty() {
            body["tools"] = serde_json::json!(self.build_tools(tools));
        }
        body
    }

    fn add_provider_headers(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header("Content-Type", "application/json");
        let request = if self.config.api_key.is_empty() {
            request
        } else {
            request.header("Authorization", format!("Bearer {}", self.config.api_key))
        };

        // OpenRouter wants attribution headers
        if self.config.base_url().contains("openrouter.ai") {
            request
                .header("HTTP-Referer", "https://github.com/whykusanagi/celeste")
                .header("X-Title", "Celeste")
        } else {
            request
        }
    }
}

/// Applies one decoded `chat.completion.chunk` to the accumulator, returning
/// the chunk to deliver when the event carried choices.
fn apply_event(acc: &mut StreamAccumulator, event: &serde_json::Value) -> Option<StreamChunk> {
    if let Some(usage) = parse_usage(&event["usage"]) {
        acc.set_usage(usage);
    }

    let choices = event["choices"].as_array().filter(|c| !c.is_empty())?;
    let mut content = String::new();

    for choice in choices {
        let delta = &choice["delta"];
        if let Some(text) = delta["content"].as_str() {
            content.push_str(text);
        }
        if let Some(calls) = delta["tool_calls"].as_array() {
            for tc in calls {
                acc.push_tool_call(parse_fragment(tc));
            }
        }
        if let Some(reason) = choice["finish_reason"].as_str() {
            acc.set_finish_reason(reason);
        }
    }

    Some(acc.delta(&content))
}

fn parse_fragment(tc: &serde_json::Value) -> ToolCallFragment {
    let field = |v: &serde_json::Value| v.as_str().unwrap_or_default().to_string();
    let id = field(&tc["id"]);
    let kind = field(&tc["type"]);
    let name = field(&tc["function"]["name"]);
    let arguments = field(&tc["function"]["arguments"]);

    match tc["index"].as_u64() {
        Some(index) => ToolCallFragment::Indexed {
            index: usize::try_from(index).unwrap_or(usize::MAX),
            id,
            kind,
            name,
            arguments,
        },
        None => ToolCallFragment::Atomic {
            id,
            kind,
            name,
            arguments,
        },
    }
}

fn parse_usage(value: &serde_json::Value) -> Option<TokenUsage> {
    if !value.is_object() {
        return None;
    }
    let count = |key: &str| value[key].as_u64().unwrap_or_default() as usize;
    Some(TokenUsage {
        prompt_tokens: count("prompt_tokens"),
        completion_tokens: count("completion_tokens"),
        total_tokens: count("total_tokens"),
    })
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    async fn send_stream(
        &self,
        cancel: &CancellationToken,
        messages: &[ChatMessage],
        tools: &[SkillDefinition],
        callback: &mut (dyn FnMut(StreamChunk) + Send),
    ) -> CelesteResult<ChatCompletionResult> {
        let url = format!("{}/chat/completions", self.config.base_url());
        let body = self.build_body(messages, tools);
        debug!(
            model = %self.config.model,
            messages = messages.len(),
            tools = tools.len(),
            "Sending chat completion stream"
        );

        let request = self.add_provider_headers(self.http.post(&url)).json(&body);
        let resp = send_request(cancel, request).await?;

        let mut events = SseStream::new(resp.bytes_stream());
        let mut acc = StreamAccumulator::new();

        while let Some(event) = events.next_event(cancel).await? {
            let data = match event {
                SseEvent::Done => break,
                SseEvent::Data(data) => data,
            };
            let value: serde_json::Value = match serde_json::from_str(&data) {
                Ok(v) => v,
                Err(e) => {
                    debug!(error = %e, "Skipping undecodable stream event");
                    continue;
                }
            };

            if let Some(message) = upstream_error(&value) {
                warn!(model = %self.config.model, error = %message, "Upstream error in stream");
                callback(acc.fail());
                return Err(CelesteError::Upstream(message));
            }

            if let Some(chunk) = apply_event(&mut acc, &value) {
                callback(chunk);
            }
        }

        let (chunk, result) = acc.finish();
        callback(chunk);
        Ok(result)
    }

    fn set_system_prompt(&mut self, prompt: String) {
        self.system_prompt = prompt;
    }

    fn kind(&self) -> BackendKind {
        BackendKind::OpenAi
    }
}
