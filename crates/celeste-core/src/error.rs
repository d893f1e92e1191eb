use thiserror::Error;

/// A convenience `Result` alias using [`CelesteError`].
pub type CelesteResult<T> = Result<T, CelesteError>;

/// Top-level error type shared by every Celeste crate.
///
/// Each variant corresponds to a subsystem that can fail.
#[derive(Error, Debug)]
pub enum CelesteError {
    /// Transport or setup failure talking to an LLM endpoint.
    #[error("HTTP error: {0}")]
    Http(String),

    /// An `error` payload delivered inside an otherwise healthy response.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Invalid or incomplete configuration (missing credentials, bad URL).
    #[error("Config error: {0}")]
    Config(String),

    /// Session state could not be used for the requested operation.
    #[error("Session error: {0}")]
    Session(String),

    /// Summarization or splice failure during context compaction.
    #[error("Compaction error: {0}")]
    Compaction(String),

    /// The exchange was cancelled by the caller before completing.
    #[error("Request cancelled")]
    Cancelled,

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CelesteError {
    /// Returns `true` when the error came from caller-side cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CelesteError::Cancelled)
    }
}
