#![allow(clippy::unwrap_used, clippy::expect_used)]

use celeste_core::ChatMessage;
use celeste_session::{ContextTracker, Session, WarningLevel};

fn long_history(turns: usize, chars: usize) -> Vec<ChatMessage> {
    (0..turns)
        .map(|i| {
            if i % 2 == 0 {
                ChatMessage::user("u".repeat(chars))
            } else {
                ChatMessage::assistant("a".repeat(chars))
            }
        })
        .collect()
}

#[test]
fn test_tracker_rebuilt_from_history_for_legacy_session() {
    let mut session = Session::new().with_model("gpt-4");
    for msg in long_history(4, 400) {
        session.add_message(msg);
    }

    let tracker = ContextTracker::for_session(&session, "gpt-4", None);
    // 4 messages x (4 + 100)
    assert_eq!(tracker.current_tokens, 416);
    assert_eq!(tracker.prompt_tokens, 208);
    assert_eq!(tracker.completion_tokens, 208);
    assert_eq!(tracker.max_tokens, 8192);
}

#[test]
fn test_stored_token_count_wins_over_estimate() {
    let mut session = Session::new();
    session.add_message(ChatMessage::user("short"));
    session.token_count = 5000;

    let tracker = ContextTracker::for_session(&session, "gpt-4", None);
    assert_eq!(tracker.current_tokens, 5000);
}

#[test]
fn test_tracker_persist_and_restore_roundtrip() {
    let mut session = Session::new().with_model("gpt-4o");
    session.add_message(ChatMessage::user("hello"));

    let mut tracker = ContextTracker::for_session(&session, "gpt-4o", Some(10_000));
    tracker.update_tokens(7000, 900, 7900);
    tracker.mark_warning_shown();
    tracker.persist(&mut session);

    let json = serde_json::to_string(&session).unwrap();
    let loaded: Session = serde_json::from_str(&json).unwrap();
    assert_eq!(loaded.token_count, 7900);

    let restored = ContextTracker::for_session(&loaded, "gpt-4o", None);
    assert_eq!(restored.max_tokens, 10_000);
    assert_eq!(restored.current_tokens, 7900);
    assert_eq!(restored.completion_tokens, 900);
    assert_eq!(restored.last_warning_level, WarningLevel::Warn);
    assert!(!restored.should_warn());
    assert!(!restored.should_compact());
}

#[test]
fn test_context_limit_override_beats_session_and_table() {
    let mut session = Session::new();
    session.max_context = Some(50_000);

    assert_eq!(
        ContextTracker::for_session(&session, "gpt-4o", Some(20_000)).max_tokens,
        20_000
    );
    assert_eq!(
        ContextTracker::for_session(&session, "gpt-4o", None).max_tokens,
        50_000
    );
    session.max_context = None;
    assert_eq!(
        ContextTracker::for_session(&session, "gpt-4o", None).max_tokens,
        128_000
    );
}

#[test]
fn test_usage_accumulates_across_turns() {
    let mut session = Session::new().with_model("claude-sonnet-4");
    session.add_message_with_tokens(ChatMessage::user("q1"), 0, 0);
    session.add_message_with_tokens(ChatMessage::assistant("a1"), 1_000_000, 0);
    session.add_message_with_tokens(ChatMessage::assistant("a2"), 0, 1_000_000);

    let metrics = session.usage_metrics.as_ref().unwrap();
    assert_eq!(metrics.message_count, 3);
    assert_eq!(metrics.total_tokens, 2_000_000);
    assert!((metrics.estimated_cost - 18.0).abs() < 1e-9);
}
