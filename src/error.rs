//! Public error taxonomy for the engine boundary.
//!
//! Internals use `anyhow::Result` + `.context()` throughout, the same as the
//! rest of this crate; `EngineError` exists only at component edges where a
//! caller needs to match on a stable kind instead of a message string.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("parsing failed: {0}")]
    ParsingFailed(String),

    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),

    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("no results for query")]
    NoResults,

    #[error("provider error: {message} (retryable={retryable})")]
    ProviderError { message: String, retryable: bool },

    #[error("operation cancelled")]
    Cancelled,

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::ProviderError { retryable: true, .. })
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
