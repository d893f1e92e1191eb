//! Provider-agnostic stream types and the accumulator that rebuilds one
//! assistant turn from partial events.

use celeste_core::ToolCall;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Finish reason used when the upstream never reports one.
pub const DEFAULT_FINISH_REASON: &str = "stop";

/// Finish reason carried by the terminal chunk of a failed exchange.
pub const ERROR_FINISH_REASON: &str = "error";

/// Largest gap allowed between an indexed fragment and the calls seen so far.
/// Fragments further out are dropped instead of growing the slot table.
const MAX_TOOL_INDEX_GAP: usize = 64;

/// Token counts as reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the request.
    pub prompt_tokens: usize,
    /// Tokens in the reply.
    pub completion_tokens: usize,
    /// Prompt plus completion, as reported.
    pub total_tokens: usize,
}

/// One unit of streamed output delivered to the caller's callback.
///
/// Only the terminal chunk (`is_final`) carries `usage` and the reconciled
/// `tool_calls`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Text added by this chunk; empty on the terminal chunk.
    pub content_delta: String,
    /// Set on the first chunk of the exchange.
    pub is_first: bool,
    /// Set on exactly one chunk, the last.
    pub is_final: bool,
    /// Why the model stopped; terminal chunk only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    /// Reconciled tool calls; terminal chunk only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Token usage, when the provider reported it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

/// A complete assistant turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionResult {
    /// Full reply text.
    pub content: String,
    /// Tool calls requested by the model, in order.
    pub tool_calls: Vec<ToolCall>,
    /// Why the model stopped, `stop` when unreported.
    pub finish_reason: String,
    /// Token usage, when the provider reported it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl ChatCompletionResult {
    /// Whether the model asked for tools.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// A piece of a tool call as it arrives on the wire.
///
/// Chat-completion providers stream calls as `Indexed` fragments that must be
/// merged by position. Gemini and some compat gateways deliver each call
/// whole in one event, with no index: those are `Atomic`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCallFragment {
    /// Partial call merged into slot `index`.
    Indexed {
        /// Position of the call in the reply.
        index: usize,
        /// Call id; usually only on the first fragment.
        id: String,
        /// Call type, normally `function`.
        kind: String,
        /// Function name; usually only on the first fragment.
        name: String,
        /// Slice of the JSON arguments to append.
        arguments: String,
    },
    /// Whole call appended in arrival order.
    Atomic {
        /// Call id; calls without one are dropped.
        id: String,
        /// Call type, normally `function`.
        kind: String,
        /// Function name.
        name: String,
        /// Complete JSON arguments.
        arguments: String,
    },
}

#[derive(Debug, Clone, Default)]
struct PendingToolCall {
    id: String,
    kind: String,
    name: String,
    arguments: String,
}

impl PendingToolCall {
    /// A slot skipped over by a higher index and never written.
    fn is_unfilled(&self) -> bool {
        self.id.is_empty() && self.name.is_empty() && self.arguments.is_empty()
    }

    fn into_tool_call(self) -> ToolCall {
        if !self.kind.is_empty() && self.kind != "function" {
            debug!(id = %self.id, kind = %self.kind, "Tool call with non-function kind");
        }
        ToolCall::new(self.id, self.name, self.arguments)
    }
}

/// Reconciles the events of one exchange into a [`ChatCompletionResult`].
///
/// Scoped to a single in-flight request; [`finish`](Self::finish) consumes it.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    content: String,
    tool_calls: Vec<PendingToolCall>,
    finish_reason: Option<String>,
    usage: Option<TokenUsage>,
    emitted: bool,
}

impl StreamAccumulator {
    /// An empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends text and returns the non-final chunk to deliver for it.
    pub fn delta(&mut self, content: &str) -> StreamChunk {
        self.content.push_str(content);
        StreamChunk {
            content_delta: content.to_string(),
            is_first: self.take_first(),
            ..StreamChunk::default()
        }
    }

    /// Merges or appends a tool-call fragment.
    pub fn push_tool_call(&mut self, fragment: ToolCallFragment) {
        match fragment {
            ToolCallFragment::Indexed {
                index,
                id,
                kind,
                name,
                arguments,
            } => self.merge_indexed(index, id, kind, name, arguments),
            ToolCallFragment::Atomic {
                id,
                kind,
                name,
                arguments,
            } => self.append_atomic(id, kind, name, arguments),
        }
    }

    fn merge_indexed(
        &mut self,
        index: usize,
        id: String,
        kind: String,
        name: String,
        arguments: String,
    ) {
        let limit = self.tool_calls.len().saturating_add(MAX_TOOL_INDEX_GAP);
        let Some(needed) = index.checked_add(1).filter(|_| index <= limit) else {
            warn!(
                index,
                known = self.tool_calls.len(),
                "Dropping tool-call fragment with out-of-range index"
            );
            return;
        };
        if self.tool_calls.len() < needed {
            self.tool_calls.resize_with(needed, PendingToolCall::default);
        }
        let slot = &mut self.tool_calls[index];
        if !id.is_empty() {
            slot.id = id;
        }
        if !kind.is_empty() {
            slot.kind = kind;
        }
        if !name.is_empty() {
            slot.name = name;
        }
        slot.arguments.push_str(&arguments);
    }

    fn append_atomic(&mut self, id: String, kind: String, name: String, arguments: String) {
        // Nothing could ever answer a call without an id.
        if id.is_empty() {
            return;
        }
        self.tool_calls.push(PendingToolCall {
            id,
            kind,
            name,
            arguments,
        });
    }

    /// Records the finish reason; empty values are ignored.
    pub fn set_finish_reason(&mut self, reason: &str) {
        if !reason.is_empty() {
            self.finish_reason = Some(reason.to_string());
        }
    }

    /// Records usage; a later report replaces an earlier one.
    pub fn set_usage(&mut self, usage: TokenUsage) {
        self.usage = Some(usage);
    }

    /// Text accumulated so far.
    pub fn content(&self) -> &str {
        &self.content
    }

    fn take_first(&mut self) -> bool {
        !std::mem::replace(&mut self.emitted, true)
    }

    /// Freezes the turn: returns the terminal chunk and the complete result.
    pub fn finish(mut self) -> (StreamChunk, ChatCompletionResult) {
        let is_first = self.take_first();
        let tool_calls: Vec<ToolCall> = self
            .tool_calls
            .into_iter()
            .filter(|c| !c.is_unfilled())
            .map(PendingToolCall::into_tool_call)
            .collect();
        let finish_reason = self
            .finish_reason
            .unwrap_or_else(|| DEFAULT_FINISH_REASON.to_string());

        let chunk = StreamChunk {
            content_delta: String::new(),
            is_first,
            is_final: true,
            finish_reason: Some(finish_reason.clone()),
            tool_calls: tool_calls.clone(),
            usage: self.usage,
        };
        let result = ChatCompletionResult {
            content: self.content,
            tool_calls,
            finish_reason,
            usage: self.usage,
        };
        (chunk, result)
    }

    /// Terminal chunk for an exchange aborted by an upstream error payload.
    /// Partial tool calls are discarded.
    pub fn fail(mut self) -> StreamChunk {
        StreamChunk {
            is_first: self.take_first(),
            is_final: true,
            finish_reason: Some(ERROR_FINISH_REASON.to_string()),
            usage: self.usage,
            ..StreamChunk::default()
        }
    }
}
