//! Cumulative usage and cost accounting.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Cost per million tokens for one model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricingTier {
    /// USD per million prompt tokens.
    pub input_cost_per_million: f64,
    /// USD per million completion tokens.
    pub output_cost_per_million: f64,
}

const fn tier(input: f64, output: f64) -> PricingTier {
    PricingTier {
        input_cost_per_million: input,
        output_cost_per_million: output,
    }
}

const MODEL_PRICING: &[(&str, PricingTier)] = &[
    // OpenAI
    ("gpt-4o", tier(2.50, 10.00)),
    ("gpt-4o-mini", tier(0.15, 0.60)),
    ("gpt-4o-2024-11-20", tier(2.50, 10.00)),
    ("gpt-4-turbo", tier(10.00, 30.00)),
    ("gpt-4", tier(30.00, 60.00)),
    ("gpt-3.5-turbo", tier(0.50, 1.50)),
    ("gpt-3.5-turbo-16k", tier(3.00, 4.00)),
    // Anthropic
    ("claude-opus-4.5", tier(15.00, 75.00)),
    ("claude-sonnet-4", tier(3.00, 15.00)),
    ("claude-3-5-sonnet-20241022", tier(3.00, 15.00)),
    ("claude-3-opus-20240229", tier(15.00, 75.00)),
    ("claude-haiku", tier(0.80, 4.00)),
    // xAI
    ("grok-4-1-fast", tier(5.00, 25.00)),
    ("grok-4-1", tier(3.00, 15.00)),
    ("grok-4", tier(3.00, 15.00)),
    ("grok-3", tier(2.00, 10.00)),
    ("grok-2", tier(1.00, 5.00)),
    // Google
    ("gemini-2.0-flash-exp", tier(0.0, 0.0)),
    ("gemini-1.5-pro", tier(1.25, 5.00)),
    ("gemini-1.5-flash", tier(0.075, 0.30)),
    ("gemini-1.0-pro", tier(0.50, 1.50)),
    // Venice
    ("venice-uncensored", tier(0.0, 0.0)),
    ("llama-3.3-70b", tier(0.50, 0.50)),
    // OpenRouter
    ("meta-llama/llama-3.3-70b-instruct", tier(0.60, 0.60)),
    ("anthropic/claude-3-opus", tier(15.00, 75.00)),
    ("anthropic/claude-3-sonnet", tier(3.00, 15.00)),
    ("openai/gpt-4o", tier(2.50, 10.00)),
];

/// Maps provider-specific model ids onto a pricing table key.
///
/// Rules are substring matches checked in order; ids that match nothing are
/// returned lower-cased.
pub fn normalize_model_name(model: &str) -> String {
    let m = model.to_lowercase();
    let has = |needle: &str| m.contains(needle);

    let key = if has("gpt-4o-mini") || has("gpt-4o mini") {
        "gpt-4o-mini"
    } else if has("gpt-4o") {
        "gpt-4o"
    } else if has("gpt-4-turbo") {
        "gpt-4-turbo"
    } else if has("gpt-4") && !has("turbo") {
        "gpt-4"
    } else if has("gpt-3.5-turbo-16k") {
        "gpt-3.5-turbo-16k"
    } else if has("gpt-3.5") {
        "gpt-3.5-turbo"
    } else if has("claude-3-5-sonnet") || has("claude-sonnet-4") {
        "claude-sonnet-4"
    } else if has("claude-3-opus") || has("claude-opus") {
        "claude-opus-4.5"
    } else if has("claude-3-haiku") || has("claude-haiku") {
        "claude-haiku"
    } else if has("grok-4-1-fast") || has("grok-4.1-fast") {
        "grok-4-1-fast"
    } else if has("grok-4-1") || has("grok-4.1") {
        "grok-4-1"
    } else if has("grok-4") {
        "grok-4"
    } else if has("grok-3") {
        "grok-3"
    } else if has("gemini-2.0-flash") {
        "gemini-2.0-flash-exp"
    } else if has("gemini-1.5-pro") {
        "gemini-1.5-pro"
    } else if has("gemini-1.5-flash") {
        "gemini-1.5-flash"
    } else if has("gemini-1.0") {
        "gemini-1.0-pro"
    } else if has("venice") {
        "venice-uncensored"
    } else if has("llama-3.3-70b") || has("llama-3-70b") {
        "llama-3.3-70b"
    } else {
        return m;
    };
    key.to_string()
}

fn lookup(key: &str) -> Option<PricingTier> {
    MODEL_PRICING
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, tier)| *tier)
}

/// Pricing for `model`, trying the normalized name before the exact id.
pub fn model_pricing(model: &str) -> Option<PricingTier> {
    lookup(&normalize_model_name(model)).or_else(|| lookup(model))
}

/// Estimated USD cost of a token volume. Unknown models cost nothing.
pub fn calculate_cost(model: &str, input_tokens: usize, output_tokens: usize) -> f64 {
    let Some(pricing) = model_pricing(model) else {
        return 0.0;
    };
    let input = input_tokens as f64 / 1_000_000.0 * pricing.input_cost_per_million;
    let output = output_tokens as f64 / 1_000_000.0 * pricing.output_cost_per_million;
    input + output
}

/// `$0.000` below a tenth of a cent, three decimals below a dollar, two above.
pub fn format_cost(cost: f64) -> String {
    if cost < 0.001 {
        "$0.000".to_string()
    } else if cost < 1.0 {
        format!("${cost:.3}")
    } else {
        format!("${cost:.2}")
    }
}

/// Formats an integer with comma thousands separators.
pub fn format_number(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Token and cost totals for a whole conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageMetrics {
    /// Prompt tokens across all exchanges.
    pub total_input_tokens: usize,
    /// Completion tokens across all exchanges.
    pub total_output_tokens: usize,
    /// Input plus output.
    pub total_tokens: usize,
    /// Estimated cost in USD at the model's list price.
    pub estimated_cost: f64,
    /// Compactions run in this conversation.
    #[serde(default)]
    pub compaction_count: usize,
    /// Truncations applied in this conversation.
    #[serde(default)]
    pub truncation_count: usize,
    /// Messages recorded through the session.
    #[serde(default)]
    pub message_count: usize,
    /// When the metrics were created.
    pub conversation_start: DateTime<Utc>,
    /// Time of the last update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_end: Option<DateTime<Utc>>,
}

impl UsageMetrics {
    /// Zeroed metrics starting now.
    pub fn new() -> Self {
        Self {
            total_input_tokens: 0,
            total_output_tokens: 0,
            total_tokens: 0,
            estimated_cost: 0.0,
            compaction_count: 0,
            truncation_count: 0,
            message_count: 0,
            conversation_start: Utc::now(),
            conversation_end: None,
        }
    }

    /// Adds one exchange worth of tokens and reprices the running totals.
    pub fn update(&mut self, input_tokens: usize, output_tokens: usize, model: &str) {
        self.total_input_tokens += input_tokens;
        self.total_output_tokens += output_tokens;
        self.total_tokens = self.total_input_tokens + self.total_output_tokens;
        self.conversation_end = Some(Utc::now());
        self.estimated_cost =
            calculate_cost(model, self.total_input_tokens, self.total_output_tokens);
    }

    /// Counts one more message.
    pub fn increment_message_count(&mut self) {
        self.message_count += 1;
    }

    /// Elapsed time from start to the last update, or to now if none yet.
    pub fn duration(&self) -> Duration {
        self.conversation_end.unwrap_or_else(Utc::now) - self.conversation_start
    }

    /// Zero when no messages were recorded.
    pub fn average_tokens_per_message(&self) -> f64 {
        if self.message_count == 0 {
            return 0.0;
        }
        self.total_tokens as f64 / self.message_count as f64
    }

    /// Zero when no messages were recorded.
    pub fn cost_per_message(&self) -> f64 {
        if self.message_count == 0 {
            return 0.0;
        }
        self.estimated_cost / self.message_count as f64
    }
}

impl Default for UsageMetrics {
    fn default() -> Self {
        Self::new()
    }
}
