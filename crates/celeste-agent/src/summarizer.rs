//! Context compaction: replaces the oldest part of a conversation with an
//! LLM-written summary.

use crate::llm::LlmClient;
use celeste_core::{CelesteError, CelesteResult, ChatMessage, Role, SUMMARY_METADATA_KEY};
use celeste_session::{
    estimate_session_tokens, estimate_tokens, format_token_count, model_limit_with_override,
    Session,
};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SUMMARY_SYSTEM_PROMPT: &str = "You are a conversation summarizer. Create a concise summary of the following conversation that preserves:
1. Key topics discussed
2. Important decisions or conclusions reached
3. Any action items or next steps
4. Essential context needed to continue the conversation
5. Technical details or specific information mentioned

The summary should be 150-250 words and written in a clear, factual style.";

/// Fraction of the window at which compaction triggers.
pub const COMPACTION_TRIGGER_RATIO: f64 = 0.80;
/// Minimum share of tokens a compaction must save to be worthwhile.
pub const MIN_SAVINGS_RATIO: f64 = 0.20;

/// Fallback per-message estimate when the session is too small to average.
const DEFAULT_TOKENS_PER_MESSAGE: usize = 500;
/// Summary body plus formatting overhead.
const ESTIMATED_SUMMARY_TOKENS: usize = 250 + 50;
/// Messages always kept after the summarized window.
const RETAINED_TAIL: usize = 2;
const MIN_WINDOW: usize = 2;

/// Outcome of a successful (or no-op) compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionReport {
    /// Messages before compaction.
    pub messages_before: usize,
    /// Messages after compaction.
    pub messages_after: usize,
    /// Estimated tokens before compaction.
    pub tokens_before: usize,
    /// Estimated tokens after compaction.
    pub tokens_after: usize,
}

impl CompactionReport {
    /// True when the session was already under target.
    pub fn is_noop(&self) -> bool {
        self.messages_before == self.messages_after && self.tokens_before == self.tokens_after
    }

    /// One-line description for the user.
    pub fn summary_line(&self) -> String {
        format_compaction_result(
            self.messages_before,
            self.messages_after,
            self.tokens_before,
            self.tokens_after,
        )
    }
}

/// A failed compaction. The session was left exactly as it was.
#[derive(Debug, thiserror::Error)]
#[error("compaction failed ({messages} messages unchanged): {source}")]
pub struct CompactionError {
    /// Message count of the untouched session.
    pub messages: usize,
    /// What went wrong.
    pub source: CelesteError,
}

/// Summarizes conversation history through an [`LlmClient`].
pub struct Summarizer<'a> {
    client: &'a LlmClient,
}

impl<'a> Summarizer<'a> {
    /// Summarizer using `client` for its requests.
    pub fn new(client: &'a LlmClient) -> Self {
        Self { client }
    }

    /// Asks the model for a 150-250 word digest of `messages`.
    pub async fn summarize_messages(
        &self,
        cancel: &CancellationToken,
        messages: &[ChatMessage],
    ) -> CelesteResult<String> {
        if messages.is_empty() {
            return Err(CelesteError::Compaction("no messages to summarize".into()));
        }

        let transcript: String = messages
            .iter()
            .map(|m| format!("{}: {}\n\n", m.role, m.content))
            .collect();
        let request = [
            ChatMessage::system(SUMMARY_SYSTEM_PROMPT),
            ChatMessage::user(format!(
                "Please summarize the following conversation:\n\n{transcript}"
            )),
        ];

        let result = self.client.send_sync(cancel, &request, &[]).await?;
        if result.content.trim().is_empty() {
            return Err(CelesteError::Compaction("empty summary returned".into()));
        }
        Ok(result.content)
    }

    /// Compacts `session` toward `target_tokens`.
    ///
    /// A leading system message and the last two messages are always kept.
    /// Already under target is a no-op. On any failure the session is not
    /// touched.
    pub async fn compact(
        &self,
        cancel: &CancellationToken,
        session: &mut Session,
        target_tokens: usize,
    ) -> Result<CompactionReport, CompactionError> {
        let messages_before = session.messages.len();
        let tokens_before = session.token_count;
        let fail = |source: CelesteError| CompactionError {
            messages: messages_before,
            source,
        };

        if messages_before == 0 {
            return Err(fail(CelesteError::Compaction("no messages to compact".into())));
        }
        if tokens_before <= target_tokens {
            debug!(tokens = tokens_before, target = target_tokens, "Compaction not needed");
            return Ok(CompactionReport {
                messages_before,
                messages_after: messages_before,
                tokens_before,
                tokens_after: tokens_before,
            });
        }

        let (start, end) = compaction_window(&session.messages, tokens_before, target_tokens)
            .ok_or_else(|| {
                fail(CelesteError::Compaction(
                    "insufficient messages for compaction".into(),
                ))
            })?;

        let summary = match self
            .summarize_messages(cancel, &session.messages[start..end])
            .await
        {
            Ok(summary) => summary,
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "Summarization failed");
                return Err(fail(e));
            }
        };

        let mut summary_msg = ChatMessage::system(format!(
            "📋 Conversation Summary (messages 1-{}):\n\n{summary}",
            end - start
        ))
        .at(session.messages[start].timestamp);
        summary_msg
            .metadata
            .insert(SUMMARY_METADATA_KEY.to_string(), serde_json::Value::Bool(true));

        let tail = session.messages.split_off(end);
        session.messages.truncate(start);
        session.messages.push(summary_msg);
        session.messages.extend(tail);

        session.token_count = estimate_session_tokens(&session.messages);
        session.updated_at = Utc::now();
        if let Some(metrics) = session.usage_metrics.as_mut() {
            metrics.compaction_count += 1;
        }

        let report = CompactionReport {
            messages_before,
            messages_after: session.messages.len(),
            tokens_before,
            tokens_after: session.token_count,
        };
        info!(
            session_id = %session.id,
            summarized = end - start,
            messages_before = report.messages_before,
            messages_after = report.messages_after,
            tokens_before = report.tokens_before,
            tokens_after = report.tokens_after,
            "Compacted conversation"
        );
        Ok(report)
    }
}

/// Picks the `[start, end)` range of messages to summarize.
///
/// The heuristic sizes the window from the average message cost, which
/// overshoots when a few messages dominate the total. Worth revisiting.
fn compaction_window(
    messages: &[ChatMessage],
    current_tokens: usize,
    target_tokens: usize,
) -> Option<(usize, usize)> {
    let start = usize::from(messages.first().is_some_and(|m| m.role == Role::System));
    let max_window = messages.len().checked_sub(start + RETAINED_TAIL)?;
    if max_window < MIN_WINDOW {
        return None;
    }

    let tokens_to_save = current_tokens.saturating_sub(target_tokens);
    let avg = match current_tokens / messages.len() {
        0 => DEFAULT_TOKENS_PER_MESSAGE,
        avg => avg,
    };
    let size = (tokens_to_save / avg).clamp(MIN_WINDOW, max_window);

    // A tool result must stay with the assistant message that called it.
    let mut end = start + size;
    while end > start && messages[end].role == Role::Tool {
        end -= 1;
    }

    (end - start >= MIN_WINDOW).then_some((start, end))
}

/// True when going from `current` to `target` saves at least 20%.
pub fn validate_compaction_savings(current_tokens: usize, target_tokens: usize) -> bool {
    if current_tokens <= target_tokens {
        return false;
    }
    let savings = (current_tokens - target_tokens) as f64 / current_tokens as f64;
    savings >= MIN_SAVINGS_RATIO
}

/// Estimated tokens of the first `count` messages and of a summary replacing
/// them.
pub fn estimate_summary_savings(messages: &[ChatMessage], count: usize) -> (usize, usize) {
    if messages.is_empty() || count == 0 {
        return (0, 0);
    }
    let count = count.min(messages.len());
    let content: String = messages[..count].iter().map(|m| m.content.as_str()).collect();
    (estimate_tokens(&content), ESTIMATED_SUMMARY_TOKENS)
}

fn savings_percent(tokens_before: usize, tokens_after: usize) -> f64 {
    if tokens_before == 0 {
        return 0.0;
    }
    (tokens_before as f64 - tokens_after as f64) / tokens_before as f64 * 100.0
}

/// One-line user-facing description of a compaction.
pub fn format_compaction_result(
    messages_before: usize,
    messages_after: usize,
    tokens_before: usize,
    tokens_after: usize,
) -> String {
    format!(
        "✓ Auto-compacted: {messages_before} msgs → {messages_after} msgs (saved {} tokens, {:.1}% reduction)",
        format_token_count(tokens_before.saturating_sub(tokens_after)),
        savings_percent(tokens_before, tokens_after),
    )
}

/// Pretty JSON describing a compaction, for logs and debugging.
pub fn compaction_metadata(
    messages_before: usize,
    messages_after: usize,
    tokens_before: usize,
    tokens_after: usize,
) -> CelesteResult<String> {
    let metadata = serde_json::json!({
        "messages_before": messages_before,
        "messages_after": messages_after,
        "tokens_before": tokens_before,
        "tokens_after": tokens_after,
        "messages_saved": messages_before.saturating_sub(messages_after),
        "tokens_saved": tokens_before.saturating_sub(tokens_after),
        "savings_percent": savings_percent(tokens_before, tokens_after),
    });
    Ok(serde_json::to_string_pretty(&metadata)?)
}

/// Token count compaction aims for: 70% of the window.
pub fn calculate_target_tokens(max_tokens: usize) -> usize {
    max_tokens * 7 / 10
}

/// True once the session fills 80% of the model's window.
pub fn should_trigger_compaction(session: &Session, model: &str) -> bool {
    let max = model_limit_with_override(model, session.max_context);
    if max == 0 {
        return false;
    }
    session.token_count as f64 / max as f64 >= COMPACTION_TRIGGER_RATIO
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use celeste_core::ToolCall;

    fn conversation(n: usize) -> Vec<ChatMessage> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    ChatMessage::user(format!("question {i}"))
                } else {
                    ChatMessage::assistant(format!("answer {i}"))
                }
            })
            .collect()
    }

    #[test]
    fn test_window_keeps_system_and_tail() {
        let mut msgs = vec![ChatMessage::system("persona")];
        msgs.extend(conversation(10));
        // 11 messages, 1000 tokens each on average, 4000 to save.
        let (start, end) = compaction_window(&msgs, 11_000, 7_000).unwrap();
        assert_eq!(start, 1);
        assert_eq!(end, 5);

        let (_, end) = compaction_window(&msgs, 110_000, 1_000).unwrap();
        assert_eq!(end, msgs.len() - 2);
    }

    #[test]
    fn test_window_minimum_and_insufficient() {
        let msgs = conversation(4);
        assert_eq!(compaction_window(&msgs, 4_000, 3_900), Some((0, 2)));

        let short = conversation(3);
        assert!(compaction_window(&short, 10_000, 1).is_none());

        let mut with_system = vec![ChatMessage::system("persona")];
        with_system.extend(conversation(3));
        assert!(compaction_window(&with_system, 10_000, 1).is_none());
    }

    #[test]
    fn test_window_does_not_orphan_tool_results() {
        let msgs = vec![
            ChatMessage::user("a"),
            ChatMessage::assistant("b"),
            ChatMessage::assistant_with_tools("", vec![ToolCall::new("call_1", "f", "{}")]),
            ChatMessage::tool_result("call_1", "42"),
            ChatMessage::assistant("done"),
            ChatMessage::user("thanks"),
        ];
        // Size 3 would end the window on the tool result.
        let (start, end) = compaction_window(&msgs, 6_000, 3_000).unwrap();
        assert_eq!((start, end), (0, 2));
    }

    #[test]
    fn test_validate_compaction_savings() {
        assert!(validate_compaction_savings(100_000, 70_000));
        assert!(validate_compaction_savings(100_000, 80_000));
        assert!(!validate_compaction_savings(100_000, 85_000));
        assert!(!validate_compaction_savings(50_000, 60_000));
    }

    #[test]
    fn test_estimate_summary_savings() {
        let msgs = vec![ChatMessage::user("x".repeat(4_000)), ChatMessage::user("y")];
        assert_eq!(estimate_summary_savings(&msgs, 1), (1_000, 300));
        assert_eq!(estimate_summary_savings(&msgs, 0), (0, 0));
        assert_eq!(estimate_summary_savings(&[], 3), (0, 0));
    }

    #[test]
    fn test_format_compaction_result() {
        assert_eq!(
            format_compaction_result(40, 12, 100_000, 60_000),
            "✓ Auto-compacted: 40 msgs → 12 msgs (saved 40.0K tokens, 40.0% reduction)"
        );
    }

    #[test]
    fn test_compaction_metadata_json() {
        let json = compaction_metadata(10, 4, 2_000, 500).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["messages_saved"], 6);
        assert_eq!(value["tokens_saved"], 1_500);
        assert_eq!(value["savings_percent"], 75.0);
    }

    #[test]
    fn test_target_and_trigger() {
        assert_eq!(calculate_target_tokens(128_000), 89_600);

        let mut session = Session::new().with_model("gpt-4o");
        session.token_count = 102_400;
        assert!(should_trigger_compaction(&session, "gpt-4o"));
        session.token_count = 102_399;
        assert!(!should_trigger_compaction(&session, "gpt-4o"));

        session.max_context = Some(10_000);
        session.token_count = 8_000;
        assert!(should_trigger_compaction(&session, "gpt-4o"));
    }
}
