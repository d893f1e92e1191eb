//! Client and summarizer behavior over a scripted in-memory backend.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use celeste_agent::{
    calculate_target_tokens, BackendKind, ChatCompletionResult, ClientConfig, LlmBackend,
    LlmClient, StreamAccumulator, StreamChunk, StreamState, Summarizer,
};
use celeste_core::{CelesteError, CelesteResult, ChatMessage, Role, SkillDefinition};
use celeste_session::{estimate_session_tokens, ContextTracker, Session, UsageMetrics, WarningLevel};
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

type Calls = Arc<Mutex<Vec<Vec<ChatMessage>>>>;

/// Replies with queued outcomes and records every conversation it was sent.
struct ScriptedBackend {
    replies: Mutex<VecDeque<CelesteResult<String>>>,
    calls: Calls,
    prompt: Arc<Mutex<String>>,
}

impl ScriptedBackend {
    fn new(replies: Vec<CelesteResult<String>>) -> (Self, Calls, Arc<Mutex<String>>) {
        let calls = Calls::default();
        let prompt = Arc::new(Mutex::new(String::new()));
        let backend = Self {
            replies: Mutex::new(replies.into()),
            calls: Arc::clone(&calls),
            prompt: Arc::clone(&prompt),
        };
        (backend, calls, prompt)
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    async fn send_stream(
        &self,
        _cancel: &CancellationToken,
        messages: &[ChatMessage],
        _tools: &[SkillDefinition],
        callback: &mut (dyn FnMut(StreamChunk) + Send),
    ) -> CelesteResult<ChatCompletionResult> {
        self.calls.lock().push(messages.to_vec());
        let reply = self
            .replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(CelesteError::Http("script exhausted".into())))?;

        let mut acc = StreamAccumulator::new();
        callback(acc.delta(&reply));
        let (chunk, result) = acc.finish();
        callback(chunk);
        Ok(result)
    }

    fn set_system_prompt(&mut self, prompt: String) {
        *self.prompt.lock() = prompt;
    }

    fn kind(&self) -> BackendKind {
        BackendKind::OpenAi
    }
}

fn scripted_client(replies: Vec<CelesteResult<String>>) -> (LlmClient, Calls, Arc<Mutex<String>>) {
    let (backend, calls, prompt) = ScriptedBackend::new(replies);
    let client = LlmClient::from_backend(Box::new(backend), ClientConfig::new("gpt-4o", "sk-test"));
    (client, calls, prompt)
}

/// System persona followed by `turns` user/assistant messages, one minute apart.
fn long_session(turns: usize) -> Session {
    let mut session = Session::new().with_model("gpt-4o");
    session.usage_metrics = Some(UsageMetrics::new());
    let start = Utc::now() - Duration::hours(1);
    session.add_message(ChatMessage::system("You are Celeste.").at(start));
    for i in 0..turns {
        let at = start + Duration::minutes(i as i64 + 1);
        let msg = if i % 2 == 0 {
            ChatMessage::user(format!("question {i}: {}", "x".repeat(400)))
        } else {
            ChatMessage::assistant(format!("answer {i}: {}", "y".repeat(400)))
        };
        session.add_message(msg.at(at));
    }
    session
}

// --- LlmClient ---

#[tokio::test]
async fn test_client_forwards_stream_and_prompt() {
    let (mut client, calls, prompt) = scripted_client(vec![Ok("The stars say yes.".into())]);
    client.set_system_prompt("You are Celeste.");
    assert_eq!(*prompt.lock(), "You are Celeste.");

    let state = StreamState::new();
    let result = client
        .send_stream(
            &CancellationToken::new(),
            &[ChatMessage::user("will it work?")],
            &[],
            |chunk| state.observe(&chunk),
        )
        .await
        .unwrap();

    assert_eq!(result.content, "The stars say yes.");
    assert_eq!(calls.lock().len(), 1);
    assert!(state.is_complete());
    assert!(state.is_dump());
    assert_eq!(state.content(), "The stars say yes.");
}

#[tokio::test]
async fn test_client_propagates_backend_errors() {
    let (client, _, _) = scripted_client(vec![Err(CelesteError::Http("connection reset".into()))]);
    let err = client
        .send_sync(&CancellationToken::new(), &[ChatMessage::user("hi")], &[])
        .await
        .unwrap_err();
    assert!(matches!(err, CelesteError::Http(m) if m == "connection reset"));
}

#[test]
fn test_update_config_replaces_custom_backend() {
    let (mut client, _, old_prompt) = scripted_client(vec![]);
    client.set_system_prompt("You are Celeste.");

    let config = ClientConfig::new("grok-4-1", "xai-key").with_base_url("https://api.x.ai/v1");
    client.update_config(config);
    assert_eq!(client.backend_kind(), BackendKind::OpenAi);
    assert_eq!(client.config().model, "grok-4-1");
    assert_eq!(client.config().base_url(), "https://api.x.ai/v1");
    assert_eq!(*old_prompt.lock(), "You are Celeste.");
}

// --- Summarizer ---

#[tokio::test]
async fn test_compaction_replaces_window_with_summary() {
    let (client, calls, _) = scripted_client(vec![Ok("They discussed tarot and weather.".into())]);
    let mut session = long_session(20);
    let original = session.messages.clone();
    session.token_count = 20_000;

    let report = Summarizer::new(&client)
        .compact(&CancellationToken::new(), &mut session, 12_000)
        .await
        .unwrap();

    assert_eq!(report.messages_before, 21);
    assert!(report.messages_after < report.messages_before);
    assert_eq!(report.messages_after, session.messages.len());
    assert!(!report.is_noop());

    // Persona stays first, then the summary dated like the first summarized message.
    assert_eq!(session.messages[0], original[0]);
    let summary = &session.messages[1];
    assert_eq!(summary.role, Role::System);
    assert!(summary.is_summary());
    assert!(summary.content.contains("They discussed tarot and weather."));
    assert_eq!(summary.timestamp, original[1].timestamp);

    // The tail is untouched.
    let n = session.messages.len();
    assert_eq!(session.messages[n - 2..], original[original.len() - 2..]);
    assert_eq!(session.token_count, estimate_session_tokens(&session.messages));
    assert_eq!(session.usage_metrics.as_ref().unwrap().compaction_count, 1);

    let sent = calls.lock();
    assert_eq!(sent[0][0].role, Role::System);
    assert!(sent[0][0].content.starts_with("You are a conversation summarizer."));
    assert!(sent[0][1]
        .content
        .starts_with("Please summarize the following conversation:\n\nuser: question 0"));
}

#[tokio::test]
async fn test_compaction_below_target_is_noop() {
    let (client, calls, _) = scripted_client(vec![]);
    let mut session = long_session(6);
    session.token_count = 5_000;
    let before = session.messages.clone();

    let summarizer = Summarizer::new(&client);
    for _ in 0..2 {
        let report = summarizer
            .compact(&CancellationToken::new(), &mut session, 8_000)
            .await
            .unwrap();
        assert!(report.is_noop());
        assert_eq!(report.messages_after, 7);
    }
    assert_eq!(session.messages, before);
    assert!(calls.lock().is_empty());
}

#[tokio::test]
async fn test_failed_summary_leaves_session_untouched() {
    let (client, _, _) = scripted_client(vec![Err(CelesteError::Http("API error 500".into()))]);
    let mut session = long_session(12);
    session.token_count = 30_000;
    let before = session.clone();

    let err = Summarizer::new(&client)
        .compact(&CancellationToken::new(), &mut session, 10_000)
        .await
        .unwrap_err();

    assert_eq!(err.messages, 13);
    assert!(matches!(err.source, CelesteError::Http(_)));
    assert_eq!(session.messages, before.messages);
    assert_eq!(session.token_count, before.token_count);
    assert_eq!(session.usage_metrics.as_ref().unwrap().compaction_count, 0);
}

#[tokio::test]
async fn test_empty_summary_is_an_error() {
    let (client, _, _) = scripted_client(vec![Ok("   ".into())]);
    let mut session = long_session(12);
    session.token_count = 30_000;

    let err = Summarizer::new(&client)
        .compact(&CancellationToken::new(), &mut session, 10_000)
        .await
        .unwrap_err();
    assert!(matches!(err.source, CelesteError::Compaction(_)));
    assert_eq!(session.messages.len(), 13);
}

#[tokio::test]
async fn test_too_few_messages_to_compact() {
    let (client, calls, _) = scripted_client(vec![Ok("unused".into())]);
    let mut session = long_session(3);
    session.token_count = 50_000;

    let err = Summarizer::new(&client)
        .compact(&CancellationToken::new(), &mut session, 1_000)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("insufficient messages"));
    assert!(calls.lock().is_empty());
}

#[tokio::test]
async fn test_tracker_resets_after_auto_compaction() {
    let (client, _, _) = scripted_client(vec![Ok("Summary of the reading.".into())]);
    let mut session = long_session(40);
    session.max_context = Some(10_000);
    session.token_count = 9_000;

    let mut tracker = ContextTracker::for_session(&session, "gpt-4o", None);
    tracker.update_tokens(0, 0, session.token_count);
    assert!(tracker.should_compact());
    assert!(tracker.should_warn());
    tracker.mark_warning_shown();

    let target = calculate_target_tokens(tracker.max_tokens);
    Summarizer::new(&client)
        .compact(&CancellationToken::new(), &mut session, target)
        .await
        .unwrap();
    tracker.record_compaction(&session.messages);
    tracker.persist(&mut session);

    assert_eq!(tracker.current_tokens, session.token_count);
    assert!(!tracker.should_compact());
    assert_eq!(tracker.warning_level(), WarningLevel::Ok);
    assert_eq!(session.context.as_ref().unwrap().compaction_count, 1);
}
