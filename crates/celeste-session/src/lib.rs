//! Conversation state and token accounting for Celeste.
//!
//! - [`Session`]: serializable conversation record.
//! - [`ContextTracker`]: token budget, warning ladder and compaction trigger.
//! - [`UsageMetrics`]: cumulative tokens and estimated cost.
//! - [`tokens`]: character-based estimation and model window tables.

/// Context window tracking and the warning ladder.
pub mod context;
/// The serializable conversation record.
pub mod session;
/// Token estimation, model windows and truncation.
pub mod tokens;
/// Pricing tables and cumulative usage metrics.
pub mod usage;

pub use context::{ContextCounters, ContextTracker, WarningLevel};
pub use session::Session;
pub use tokens::{
    estimate_message_tokens, estimate_session_tokens, estimate_tokens, estimate_tokens_by_role,
    format_token_count, model_limit, model_limit_with_override, truncate_to_limit, TokenBreakdown,
    DEFAULT_CONTEXT_LIMIT,
};
pub use usage::{
    calculate_cost, format_cost, format_number, model_pricing, normalize_model_name,
    PricingTier, UsageMetrics,
};
