use crate::error::{CelesteError, CelesteResult};
use crate::tool::ToolCall;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Metadata key marking a message produced by context compaction.
pub const SUMMARY_METADATA_KEY: &str = "summary";

/// The role of the participant that authored a [`ChatMessage`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A system-level instruction, persona, or compaction summary.
    System,
    /// A human end-user.
    User,
    /// The AI assistant.
    Assistant,
    /// Output produced by a tool invocation.
    Tool,
}

impl Role {
    /// Wire name used by chat-completion style APIs.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single message exchanged within a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The role of the message author.
    pub role: Role,
    /// The textual content of the message. May be empty for assistant turns
    /// that only carry tool calls.
    #[serde(default)]
    pub content: String,
    /// UTC timestamp of when the message was created.
    pub timestamp: DateTime<Utc>,
    /// For `tool` messages: the id of the call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// For `assistant` messages: the tool calls requested in this turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Arbitrary key-value metadata attached to the message.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ChatMessage {
    /// Creates a new message with the given role and content, stamped now.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            tool_call_id: None,
            tool_calls: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Creates a new message with [`Role::User`].
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Creates a new message with [`Role::Assistant`].
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Creates a new message with [`Role::System`].
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Creates an assistant turn that requests the given tool calls.
    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::new(Role::Assistant, content)
        }
    }

    /// Creates a tool result answering the call with `tool_call_id`.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }

    /// Replaces the timestamp, keeping everything else.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Whether this message is a compaction summary.
    pub fn is_summary(&self) -> bool {
        self.role == Role::System
            && self
                .metadata
                .get(SUMMARY_METADATA_KEY)
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false)
    }

    /// Whether the message has nothing a provider could render: no text,
    /// no tool calls, and not a tool result.
    pub fn is_blank(&self) -> bool {
        self.content.is_empty() && self.tool_calls.is_empty() && self.role != Role::Tool
    }

    /// Checks the pairing invariants over an ordered message list.
    ///
    /// - every `tool` message references a call id issued by an earlier
    ///   `assistant` message;
    /// - an `assistant` message has non-empty content or at least one tool call.
    pub fn validate_sequence(messages: &[ChatMessage]) -> CelesteResult<()> {
        let mut issued: HashSet<&str> = HashSet::new();

        for (index, msg) in messages.iter().enumerate() {
            match msg.role {
                Role::Assistant => {
                    if msg.content.is_empty() && msg.tool_calls.is_empty() {
                        return Err(CelesteError::Session(format!(
                            "assistant message {index} has neither content nor tool calls"
                        )));
                    }
                    issued.extend(msg.tool_calls.iter().map(|tc| tc.id.as_str()));
                }
                Role::Tool => {
                    let id = msg.tool_call_id.as_deref().unwrap_or_default();
                    if !issued.contains(id) {
                        return Err(CelesteError::Session(format!(
                            "tool message {index} references unknown call id '{id}'"
                        )));
                    }
                }
                Role::System | Role::User => {}
            }
        }

        Ok(())
    }
}
