//! LLM-related error types.

use thiserror::Error;

/// Errors that can occur with model providers.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The provider rejected or failed the request.
    #[error("Provider request failed: {0}")]
    RequestFailed(String),

    /// The stream broke mid-generation.
    #[error("Streaming error: {0}")]
    StreamingError(String),

    /// Response could not be interpreted.
    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for provider operations.
pub type LlmResult<T> = Result<T, LlmError>;
