use super::{send_request, upstream_error, BackendKind, LlmBackend};
use crate::config::{http_client, ClientConfig};
use crate::sse::{SseEvent, SseStream};
use crate::stream::{
    ChatCompletionResult, StreamAccumulator, StreamChunk, TokenUsage, ToolCallFragment,
};
use async_trait::async_trait;
use celeste_core::{CelesteError, CelesteResult, ChatMessage, Role, SkillDefinition};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const GEMINI_API_ROOT: &str = "https://generativelanguage.googleapis.com/v1beta";
const GEMINI_HOST: &str = "generativelanguage.googleapis.com";
/// Prefix of Google OAuth2 access tokens, sent as bearer credentials.
const OAUTH_TOKEN_PREFIX: &str = "ya29.";

/// Native Google GenAI backend for the Gemini API and Vertex AI.
///
/// Gemini has no assistant role or tool role: assistant turns go out as
/// `model`, tool results as `functionResponse` parts in a `user` turn. The
/// persona prompt and any inline system messages (compaction summaries
/// included) share `systemInstruction`. Function calls come back whole
/// and without ids, so ids are synthesized as `call_<name>`.
pub struct GeminiBackend {
    config: ClientConfig,
    http: reqwest::Client,
    api_root: String,
    system_prompt: String,
}

impl GeminiBackend {
    /// Fails when no credential is configured.
    pub fn new(config: ClientConfig) -> CelesteResult<Self> {
        if config.api_key.trim().is_empty() {
            return Err(CelesteError::Config(
                "Gemini backend needs an API key or OAuth access token".into(),
            ));
        }

        let base = config.base_url();
        let api_root = if base.contains(GEMINI_HOST) {
            GEMINI_API_ROOT.to_string()
        } else {
            base.to_string()
        };

        let http = http_client(&config);
        Ok(Self {
            config,
            http,
            api_root,
            system_prompt: String::new(),
        })
    }

    fn endpoint(&self, method: &str) -> String {
        let model = self
            .config
            .model
            .strip_prefix("models/")
            .unwrap_or(&self.config.model);
        format!("{}/models/{model}:{method}", self.api_root)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let key = &self.config.api_key;
        if key.starts_with(OAUTH_TOKEN_PREFIX) {
            request.bearer_auth(key)
        } else {
            request.header("x-goog-api-key", key)
        }
    }

    fn build_contents(&self, messages: &[ChatMessage]) -> Vec<serde_json::Value> {
        let mut contents = Vec::with_capacity(messages.len());
        let mut call_names: HashMap<&str, &str> = HashMap::new();

        for m in messages {
            match m.role {
                // Carried in systemInstruction.
                Role::System => continue,
                Role::Tool => {
                    let id = m.tool_call_id.as_deref().unwrap_or_default();
                    let name = call_names.get(id).copied().unwrap_or(id);
                    contents.push(serde_json::json!({
                        "role": "user",
                        "parts": [{
                            "functionResponse": {
                                "name": name,
                                "response": { "result": m.content },
                            }
                        }]
                    }));
                }
                Role::Assistant if !m.tool_calls.is_empty() => {
                    let mut parts = Vec::with_capacity(m.tool_calls.len() + 1);
                    if !m.content.is_empty() {
                        parts.push(serde_json::json!({ "text": m.content }));
                    }
                    for tc in &m.tool_calls {
                        call_names.insert(tc.id.as_str(), tc.name.as_str());
                        parts.push(serde_json::json!({
                            "functionCall": {
                                "name": tc.name,
                                "args": tc.parsed_arguments(),
                            }
                        }));
                    }
                    contents.push(serde_json::json!({ "role": "model", "parts": parts }));
                }
                Role::User | Role::Assistant => {
                    if m.content.is_empty() {
                        continue;
                    }
                    let role = if m.role == Role::Assistant { "model" } else { "user" };
                    contents.push(serde_json::json!({
                        "role": role,
                        "parts": [{ "text": m.content }],
                    }));
                }
            }
        }

        contents
    }

    /// Persona first, then inline system messages in conversation order.
    fn system_parts(&self, messages: &[ChatMessage]) -> Vec<serde_json::Value> {
        let persona = (!self.system_prompt.is_empty() && !self.config.skip_persona_prompt)
            .then_some(self.system_prompt.as_str());
        persona
            .into_iter()
            .chain(
                messages
                    .iter()
                    .filter(|m| m.role == Role::System && !m.content.is_empty())
                    .map(|m| m.content.as_str()),
            )
            .map(|text| serde_json::json!({ "text": text }))
            .collect()
    }

    fn build_body(
        &self,
        messages: &[ChatMessage],
        tools: &[SkillDefinition],
    ) -> serde_json::Value {
        let mut body = serde_json::json!({
            "contents": self.build_contents(messages),
            "generationConfig": { "maxOutputTokens": self.config.max_tokens },
        });

        let system = self.system_parts(messages);
        if !system.is_empty() {
            body["systemInstruction"] = serde_json::json!({ "parts": system });
        }

        if !tools.is_empty() {
            let declarations: Vec<serde_json::Value> = tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": convert_schema(&t.parameters),
                    })
                })
                .collect();
            body["tools"] = serde_json::json!([{ "functionDeclarations": declarations }]);
        }

        body
    }
}

/// Translates a JSON-schema object into Gemini's schema dialect.
pub fn convert_schema(params: &serde_json::Value) -> serde_json::Value {
    let mut schema = serde_json::json!({ "type": "OBJECT" });

    if let Some(props) = params["properties"].as_object() {
        let properties: serde_json::Map<String, serde_json::Value> = props
            .iter()
            .filter(|(_, v)| v.is_object())
            .map(|(name, prop)| (name.clone(), convert_property(prop)))
            .collect();
        schema["properties"] = serde_json::Value::Object(properties);
    }
    if let Some(required) = params["required"].as_array() {
        let names: Vec<&str> = required.iter().filter_map(serde_json::Value::as_str).collect();
        schema["required"] = serde_json::json!(names);
    }

    schema
}

fn convert_property(prop: &serde_json::Value) -> serde_json::Value {
    let kind = gemini_type(prop["type"].as_str().unwrap_or_default());
    if kind == "OBJECT" {
        let mut nested = convert_schema(prop);
        if let Some(desc) = prop["description"].as_str() {
            nested["description"] = serde_json::json!(desc);
        }
        return nested;
    }

    let mut schema = serde_json::json!({ "type": kind });
    if let Some(desc) = prop["description"].as_str() {
        schema["description"] = serde_json::json!(desc);
    }
    if let Some(values) = prop["enum"].as_array() {
        let values: Vec<&str> = values.iter().filter_map(serde_json::Value::as_str).collect();
        schema["enum"] = serde_json::json!(values);
    }
    if kind == "ARRAY" && prop["items"].is_object() {
        schema["items"] = convert_property(&prop["items"]);
    }
    schema
}

fn gemini_type(json_type: &str) -> &'static str {
    match json_type {
        "number" => "NUMBER",
        "integer" => "INTEGER",
        "boolean" => "BOOLEAN",
        "array" => "ARRAY",
        "object" => "OBJECT",
        _ => "STRING",
    }
}

/// Applies one `GenerateContentResponse` to the accumulator, returning the
/// chunk to deliver when it carried candidates.
fn apply_response(acc: &mut StreamAccumulator, response: &serde_json::Value) -> Option<StreamChunk> {
    let meta = &response["usageMetadata"];
    if meta.is_object() {
        let count = |key: &str| meta[key].as_u64().unwrap_or_default() as usize;
        acc.set_usage(TokenUsage {
            prompt_tokens: count("promptTokenCount"),
            completion_tokens: count("candidatesTokenCount"),
            total_tokens: count("totalTokenCount"),
        });
    }

    let candidates = response["candidates"]
        .as_array()
        .filter(|c| !c.is_empty())?;
    let mut text = String::new();

    for candidate in candidates {
        if let Some(parts) = candidate["content"]["parts"].as_array() {
            for part in parts {
                if let Some(t) = part["text"].as_str() {
                    text.push_str(t);
                }
                if part["functionCall"].is_object() {
                    acc.push_tool_call(function_call_fragment(&part["functionCall"]));
                }
            }
        }
        if let Some(reason) = candidate["finishReason"].as_str() {
            acc.set_finish_reason(reason);
        }
    }

    Some(acc.delta(&text))
}

fn function_call_fragment(call: &serde_json::Value) -> ToolCallFragment {
    let name = call["name"].as_str().unwrap_or_default().to_string();
    let arguments = match &call["args"] {
        serde_json::Value::Null => "{}".to_string(),
        args => serde_json::to_string(args).unwrap_or_else(|_| "{}".to_string()),
    };
    ToolCallFragment::Atomic {
        id: format!("call_{name}"),
        kind: "function".to_string(),
        name,
        arguments,
    }
}

#[async_trait]
impl LlmBackend for GeminiBackend {
    async fn send_stream(
        &self,
        cancel: &CancellationToken,
        messages: &[ChatMessage],
        tools: &[SkillDefinition],
        callback: &mut (dyn FnMut(StreamChunk) + Send),
    ) -> CelesteResult<ChatCompletionResult> {
        let url = format!("{}?alt=sse", self.endpoint("streamGenerateContent"));
        let body = self.build_body(messages, tools);
        debug!(
            model = %self.config.model,
            messages = messages.len(),
            tools = tools.len(),
            "Sending Gemini stream"
        );

        let request = self.authorize(self.http.post(&url)).json(&body);
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
                    debug!(error = %e, "Skipping undecodable Gemini event");
                    continue;
                }
            };

            if let Some(message) = upstream_error(&value) {
                warn!(model = %self.config.model, error = %message, "Gemini error in stream");
                callback(acc.fail());
                return Err(CelesteError::Upstream(message));
            }

            if let Some(chunk) = apply_response(&mut acc, &value) {
                callback(chunk);
            }
        }

        let (chunk, result) = acc.finish();
        callback(chunk);
        Ok(result)
    }

    async fn send_sync(
        &self,
        cancel: &CancellationToken,
        messages: &[ChatMessage],
        tools: &[SkillDefinition],
    ) -> CelesteResult<ChatCompletionResult> {
        let body = self.build_body(messages, tools);
        let request = self
            .authorize(self.http.post(self.endpoint("generateContent")))
            .json(&body);
        let resp = send_request(cancel, request).await?;

        let value: serde_json::Value = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CelesteError::Cancelled),
            value = resp.json::<serde_json::Value>() => {
                value.map_err(|e| CelesteError::Http(e.to_string()))?
            }
        };

        if let Some(message) = upstream_error(&value) {
            return Err(CelesteError::Upstream(message));
        }

        let mut acc = StreamAccumulator::new();
        apply_response(&mut acc, &value);
        let (_, result) = acc.finish();
        Ok(result)
    }

    fn set_system_prompt(&mut self, prompt: String) {
        self.system_prompt = prompt;
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Gemini
    }
}
