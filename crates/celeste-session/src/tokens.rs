//! Character-based token estimation and per-model context windows.
//!
//! Exact tokenization is out of reach without a provider tokenizer, so every
//! estimate here uses the ~4 characters per token rule of thumb.

use celeste_core::{ChatMessage, Role};

/// Context window used for models missing from the table.
pub const DEFAULT_CONTEXT_LIMIT: usize = 8192;

/// Fixed per-message overhead for role and framing.
const MESSAGE_OVERHEAD: usize = 4;

/// Share of the model window that [`truncate_to_limit`] fills.
const TRUNCATE_RATIO: f64 = 0.85;

const MODEL_LIMITS: &[(&str, usize)] = &[
    ("gpt-4", 8192),
    ("gpt-4-turbo", 128_000),
    ("gpt-4o", 128_000),
    ("gpt-4o-mini", 128_000),
    ("gpt-3.5-turbo", 16_385),
    ("claude-3-opus", 200_000),
    ("claude-3-sonnet", 200_000),
    ("claude-3-haiku", 200_000),
    ("claude-sonnet-4", 200_000),
    ("claude-opus-4.5", 200_000),
    ("venice-uncensored", 8192),
    ("llama-3.3-70b", 8192),
    ("grok-4-1", 128_000),
    ("grok-4-1-fast", 128_000),
];

/// Estimated tokens split by who produced them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenBreakdown {
    /// Tokens the model reads: system, user and tool messages.
    pub prompt: usize,
    /// Tokens the model wrote: assistant messages.
    pub completion: usize,
    /// `prompt + completion`.
    pub total: usize,
}

/// Approximates the token count of `text`.
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

/// Approximates the tokens a single message occupies, including any tool
/// call names and arguments it carries.
pub fn estimate_message_tokens(msg: &ChatMessage) -> usize {
    let tool_tokens: usize = msg
        .tool_calls
        .iter()
        .map(|tc| estimate_tokens(&tc.name) + estimate_tokens(&tc.arguments))
        .sum();
    MESSAGE_OVERHEAD + estimate_tokens(&msg.content) + tool_tokens
}

/// Sum of [`estimate_message_tokens`] over a history.
pub fn estimate_session_tokens(messages: &[ChatMessage]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Splits the estimate of a history into prompt and completion tokens.
pub fn estimate_tokens_by_role(messages: &[ChatMessage]) -> TokenBreakdown {
    let mut breakdown = TokenBreakdown::default();
    for msg in messages {
        let tokens = estimate_message_tokens(msg);
        match msg.role {
            Role::Assistant => breakdown.completion += tokens,
            Role::System | Role::User | Role::Tool => breakdown.prompt += tokens,
        }
    }
    breakdown.total = breakdown.prompt + breakdown.completion;
    breakdown
}

/// Context window for `model`, or [`DEFAULT_CONTEXT_LIMIT`] when unknown.
pub fn model_limit(model: &str) -> usize {
    MODEL_LIMITS
        .iter()
        .find(|(name, _)| *name == model)
        .map_or(DEFAULT_CONTEXT_LIMIT, |(_, limit)| *limit)
}

/// Like [`model_limit`], but a positive configured override wins.
pub fn model_limit_with_override(model: &str, override_limit: Option<usize>) -> usize {
    match override_limit {
        Some(limit) if limit > 0 => limit,
        _ => model_limit(model),
    }
}

/// Keeps the newest messages that fit within 85% of the model window after
/// reserving `system_prompt_tokens`.
///
/// Leading tool results whose assistant call was cut off are dropped too, so
/// the returned slice never opens with an orphaned result.
pub fn truncate_to_limit(
    messages: &[ChatMessage],
    model: &str,
    system_prompt_tokens: usize,
) -> Vec<ChatMessage> {
    let target = (model_limit(model) as f64 * TRUNCATE_RATIO) as usize;
    let available = target.saturating_sub(system_prompt_tokens);

    let mut cumulative = 0;
    let mut first_kept = messages.len();
    for (index, msg) in messages.iter().enumerate().rev() {
        let tokens = estimate_message_tokens(msg);
        if cumulative + tokens > available {
            break;
        }
        cumulative += tokens;
        first_kept = index;
    }

    while first_kept < messages.len() && messages[first_kept].role == Role::Tool {
        first_kept += 1;
    }

    messages[first_kept..].to_vec()
}

/// Renders a token count with a `K`/`M` suffix: `1500` → `"1.5K"`.
pub fn format_token_count(tokens: usize) -> String {
    if tokens >= 1_000_000 {
        format!("{:.1}M", tokens as f64 / 1_000_000.0)
    } else if tokens >= 1000 {
        format!("{:.1}K", tokens as f64 / 1000.0)
    } else {
        tokens.to_string()
    }
}
