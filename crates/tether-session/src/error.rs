//! Session-layer error types.

use thiserror::Error;

/// Errors that can occur in the session coordinator.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A store record was not found.
    #[error("Not found: {what} {id}")]
    NotFound {
        /// Record kind (round, turn, session).
        what: &'static str,
        /// Record id.
        id: String,
    },

    /// The injected store failed.
    #[error("Session store error: {0}")]
    Store(String),

    /// MCP runtime error.
    #[error("MCP error: {0}")]
    Mcp(#[from] tether_mcp::McpError),

    /// Provider error.
    #[error("LLM error: {0}")]
    Llm(#[from] tether_llm::LlmError),

    /// The turn loop exhausted its retry budget.
    #[error("Round failed after {attempts} attempts: {reason}")]
    RoundFailed {
        /// Consecutive failed iterations.
        attempts: u32,
        /// Final failure description.
        reason: String,
    },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;
