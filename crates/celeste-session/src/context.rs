//! Context-window budget for one conversation.
//!
//! A [`ContextTracker`] follows the token count of a single session, grades it
//! against staged thresholds and decides when compaction should run. It holds
//! no reference to the session; callers write its state back with
//! [`ContextTracker::persist`].

use crate::session::Session;
use crate::tokens::{
    estimate_session_tokens, estimate_tokens_by_role, format_token_count,
    model_limit_with_override,
};
use celeste_core::ChatMessage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const WARN_THRESHOLD: f64 = 0.75;
const CAUTION_THRESHOLD: f64 = 0.85;
const CRITICAL_THRESHOLD: f64 = 0.95;
const COMPACT_THRESHOLD: f64 = 0.80;
const DEFAULT_TOKENS_PER_MESSAGE: usize = 500;

/// Severity of context usage. Ordered `Ok < Warn < Caution < Critical`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum WarningLevel {
    /// Below the warn threshold.
    #[default]
    Ok,
    /// Past the warn threshold.
    Warn,
    /// Past the caution threshold.
    Caution,
    /// Past the critical threshold.
    Critical,
}

impl WarningLevel {
    /// Lowercase name, as serialized.
    pub fn as_str(self) -> &'static str {
        match self {
            WarningLevel::Ok => "ok",
            WarningLevel::Warn => "warn",
            WarningLevel::Caution => "caution",
            WarningLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for WarningLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracker state saved alongside a session so it can be restored without
/// re-estimating the history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextCounters {
    /// Tokens currently in the window.
    pub current_tokens: usize,
    /// Prompt tokens of the last exchange.
    pub prompt_tokens: usize,
    /// Completion tokens of the last exchange.
    pub completion_tokens: usize,
    /// Compactions run so far.
    #[serde(default)]
    pub compaction_count: usize,
    /// Truncations applied so far.
    #[serde(default)]
    pub truncation_count: usize,
    /// Highest warning level already shown.
    #[serde(default)]
    pub last_warning_level: WarningLevel,
}

/// Running token budget and warning ladder for one conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextTracker {
    /// Model the window size was looked up for.
    pub model: String,
    /// Context window size in tokens.
    pub max_tokens: usize,
    /// Tokens currently in the window.
    pub current_tokens: usize,
    /// Prompt tokens of the last exchange.
    pub prompt_tokens: usize,
    /// Completion tokens of the last exchange.
    pub completion_tokens: usize,
    /// Usage ratio for [`WarningLevel::Warn`].
    pub warn_threshold: f64,
    /// Usage ratio for [`WarningLevel::Caution`].
    pub caution_threshold: f64,
    /// Usage ratio for [`WarningLevel::Critical`].
    pub critical_threshold: f64,
    /// Usage ratio that triggers auto-compaction.
    pub compact_threshold: f64,
    /// Compactions run so far.
    pub compaction_count: usize,
    /// Truncations applied so far.
    pub truncation_count: usize,
    /// Highest warning level already shown.
    pub last_warning_level: WarningLevel,
}

impl ContextTracker {
    /// Creates an empty tracker for `model` with a window of `max_tokens`.
    pub fn new(model: impl Into<String>, max_tokens: usize) -> Self {
        Self {
            model: model.into(),
            max_tokens,
            current_tokens: 0,
            prompt_tokens: 0,
            completion_tokens: 0,
            warn_threshold: WARN_THRESHOLD,
            caution_threshold: CAUTION_THRESHOLD,
            critical_threshold: CRITICAL_THRESHOLD,
            compact_threshold: COMPACT_THRESHOLD,
            compaction_count: 0,
            truncation_count: 0,
            last_warning_level: WarningLevel::Ok,
        }
    }

    /// Rebuilds a tracker for a loaded session.
    ///
    /// Sessions that carry saved [`ContextCounters`] are restored from them.
    /// Older sessions without counters are re-derived by estimating the
    /// history by role; a positive stored `token_count` still wins over the
    /// estimate for the running total.
    ///
    /// The window comes from `context_limit`, then `session.max_context`,
    /// then the model table.
    pub fn for_session(session: &Session, model: &str, context_limit: Option<usize>) -> Self {
        let max_tokens = model_limit_with_override(model, context_limit.or(session.max_context));
        let mut tracker = Self::new(model, max_tokens);

        match &session.context {
            Some(counters) => tracker.restore(counters),
            None => {
                let breakdown = estimate_tokens_by_role(&session.messages);
                tracker.prompt_tokens = breakdown.prompt;
                tracker.completion_tokens = breakdown.completion;
                tracker.current_tokens = if session.token_count > 0 {
                    session.token_count
                } else {
                    breakdown.total
                };
                debug!(
                    session_id = %session.id,
                    current_tokens = tracker.current_tokens,
                    "Context counters re-derived from history"
                );
            }
        }

        tracker
    }

    fn restore(&mut self, counters: &ContextCounters) {
        self.current_tokens = counters.current_tokens;
        self.prompt_tokens = counters.prompt_tokens;
        self.completion_tokens = counters.completion_tokens;
        self.compaction_count = counters.compaction_count;
        self.truncation_count = counters.truncation_count;
        self.last_warning_level = counters.last_warning_level;
    }

    /// Snapshot of the state worth persisting.
    pub fn counters(&self) -> ContextCounters {
        ContextCounters {
            current_tokens: self.current_tokens,
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            compaction_count: self.compaction_count,
            truncation_count: self.truncation_count,
            last_warning_level: self.last_warning_level,
        }
    }

    /// Writes the token count and counters back onto the session.
    pub fn persist(&self, session: &mut Session) {
        session.token_count = self.current_tokens;
        session.max_context = Some(self.max_tokens);
        session.context = Some(self.counters());
    }

    /// Applies upstream usage. Zero values leave the matching counter alone.
    pub fn update_tokens(&mut self, prompt: usize, completion: usize, total: usize) {
        if total > 0 {
            self.current_tokens = total;
        }
        if prompt > 0 {
            self.prompt_tokens = prompt;
        }
        if completion > 0 {
            self.completion_tokens = completion;
        }
    }

    /// Replaces the running total with a character-based estimate.
    pub fn update_from_estimate(&mut self, messages: &[ChatMessage]) {
        self.current_tokens = estimate_session_tokens(messages);
    }

    /// `current / max`, or 0 for a zero-sized window.
    pub fn usage_ratio(&self) -> f64 {
        if self.max_tokens == 0 {
            return 0.0;
        }
        self.current_tokens as f64 / self.max_tokens as f64
    }

    /// Level for the current usage ratio.
    pub fn warning_level(&self) -> WarningLevel {
        let ratio = self.usage_ratio();
        if ratio >= self.critical_threshold {
            WarningLevel::Critical
        } else if ratio >= self.caution_threshold {
            WarningLevel::Caution
        } else if ratio >= self.warn_threshold {
            WarningLevel::Warn
        } else {
            WarningLevel::Ok
        }
    }

    /// True once per level: only when usage has climbed above the last level
    /// that was shown.
    pub fn should_warn(&self) -> bool {
        self.warning_level() > self.last_warning_level
    }

    /// Records that the current level was shown. Never lowers the mark.
    pub fn mark_warning_shown(&mut self) {
        self.last_warning_level = self.last_warning_level.max(self.warning_level());
    }

    /// Whether auto-compaction should run, regardless of warnings shown.
    pub fn should_compact(&self) -> bool {
        self.usage_ratio() >= self.compact_threshold
    }

    /// Tokens left before the window is full.
    pub fn remaining_tokens(&self) -> usize {
        self.max_tokens.saturating_sub(self.current_tokens)
    }

    /// How many more messages of `avg_tokens_per_message` fit before the warn
    /// threshold. A zero average uses 500.
    pub fn estimate_messages_until_limit(&self, avg_tokens_per_message: usize) -> usize {
        let avg = if avg_tokens_per_message == 0 {
            DEFAULT_TOKENS_PER_MESSAGE
        } else {
            avg_tokens_per_message
        };
        let warn_at = (self.max_tokens as f64 * self.warn_threshold) as usize;
        warn_at.saturating_sub(self.current_tokens) / avg
    }

    /// Colored dot for the current level.
    pub fn status_indicator(&self) -> &'static str {
        match self.warning_level() {
            WarningLevel::Critical => "🔴",
            WarningLevel::Caution => "🟠",
            WarningLevel::Warn => "🟡",
            WarningLevel::Ok => "🟢",
        }
    }

    /// User-facing text for the current level; `None` while usage is ok.
    pub fn warning_message(&self) -> Option<String> {
        let pct = (self.usage_ratio() * 100.0) as u32;
        match self.warning_level() {
            WarningLevel::Critical => Some(format!(
                "Context at {pct}% - will auto-compact on next message"
            )),
            WarningLevel::Caution => Some(format!("Context at {pct}% - compaction recommended")),
            WarningLevel::Warn => Some(format!("Context at {pct}% - consider compaction soon")),
            WarningLevel::Ok => None,
        }
    }

    /// `"96.0K/128.0K (75.0%)"`.
    pub fn context_summary(&self) -> String {
        format!(
            "{}/{} ({:.1}%)",
            format_token_count(self.current_tokens),
            format_token_count(self.max_tokens),
            self.usage_ratio() * 100.0
        )
    }

    /// Accounts for a finished compaction over the revised history.
    pub fn record_compaction(&mut self, messages: &[ChatMessage]) {
        self.compaction_count += 1;
        self.update_from_estimate(messages);
        self.reset_warning_if_relieved();
        info!(
            compactions = self.compaction_count,
            current_tokens = self.current_tokens,
            level = %self.warning_level(),
            "Context compacted"
        );
    }

    /// Accounts for a finished truncation over the revised history.
    pub fn record_truncation(&mut self, messages: &[ChatMessage]) {
        self.truncation_count += 1;
        self.update_from_estimate(messages);
        self.reset_warning_if_relieved();
        info!(
            truncations = self.truncation_count,
            current_tokens = self.current_tokens,
            "Context truncated"
        );
    }

    fn reset_warning_if_relieved(&mut self) {
        if self.usage_ratio() < self.warn_threshold {
            self.last_warning_level = WarningLevel::Ok;
        }
    }
}
