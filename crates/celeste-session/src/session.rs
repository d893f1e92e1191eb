use crate::context::ContextCounters;
use crate::usage::UsageMetrics;
use celeste_core::ChatMessage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// One conversation: its history plus the accounting attached to it.
///
/// Storage is up to the caller; every optional field deserializes from
/// records written before it existed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier.
    pub id: Uuid,
    /// Optional display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last change to the history.
    pub updated_at: DateTime<Utc>,
    /// Conversation history, oldest first.
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    /// Last known token count of the history.
    #[serde(default)]
    pub token_count: usize,
    /// Model used for pricing and window lookups.
    #[serde(default)]
    pub model: String,
    /// Provider name, informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Overrides the model's context window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_context: Option<usize>,
    /// Created on the first recorded message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_metrics: Option<UsageMetrics>,
    /// Saved tracker counters; absent on sessions from older versions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextCounters>,
    /// Free-form key-value data.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Session {
    /// An empty session with a fresh id.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: None,
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
            token_count: 0,
            model: String::new(),
            provider: None,
            max_context: None,
            usage_metrics: None,
            context: None,
            metadata: HashMap::new(),
        }
    }

    /// Sets the model used for pricing and window lookups.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Appends a message without touching the metrics.
    pub fn add_message(&mut self, message: ChatMessage) {
        self.updated_at = Utc::now();
        self.messages.push(message);
    }

    /// Appends a message and folds its exchange's token usage into the
    /// metrics, creating them on first use.
    pub fn add_message_with_tokens(
        &mut self,
        message: ChatMessage,
        input_tokens: usize,
        output_tokens: usize,
    ) {
        self.add_message(message);
        let model = self.model.clone();
        let metrics = self.usage_metrics.get_or_insert_with(UsageMetrics::new);
        if input_tokens > 0 || output_tokens > 0 {
            metrics.update(input_tokens, output_tokens, &model);
        }
        metrics.increment_message_count();
    }

    /// Folds token usage into the metrics without adding a message.
    pub fn update_usage_metrics(&mut self, input_tokens: usize, output_tokens: usize) {
        let model = self.model.clone();
        self.usage_metrics
            .get_or_insert_with(UsageMetrics::new)
            .update(input_tokens, output_tokens, &model);
    }

    /// Drops the history and every counter derived from it.
    pub fn clear_messages(&mut self) {
        self.messages.clear();
        self.token_count = 0;
        self.usage_metrics = None;
        self.context = None;
        self.updated_at = Utc::now();
    }

    /// Number of messages in the history.
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
