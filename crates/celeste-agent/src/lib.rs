//! LLM backends, stream reconciliation and context compaction for Celeste.

/// Provider backends behind [`LlmBackend`].
pub mod backends;
/// Client configuration.
pub mod config;
/// Dump detection and typing replay.
pub mod dump;
/// The backend-agnostic [`LlmClient`].
pub mod llm;
/// Server-sent events decoding.
pub mod sse;
/// Stream chunks and tool-call reconciliation.
pub mod stream;
/// History compaction through the model.
pub mod summarizer;

pub use backends::{detect_backend_kind, BackendKind, LlmBackend};
pub use config::{ClientConfig, DEFAULT_BASE_URL};
pub use dump::{SimulatedStream, SimulatedStreamConfig, SimulatedTick, StreamState};
pub use llm::LlmClient;
pub use stream::{
    ChatCompletionResult, StreamAccumulator, StreamChunk, TokenUsage, ToolCallFragment,
};
pub use summarizer::{
    calculate_target_tokens, compaction_metadata, estimate_summary_savings,
    format_compaction_result, should_trigger_compaction, validate_compaction_savings,
    CompactionError, CompactionReport, Summarizer,
};
