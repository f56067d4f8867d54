//! MCP runtime error types.

use thiserror::Error;

/// Errors that can occur in the MCP runtime.
#[derive(Debug, Error)]
pub enum McpError {
    /// Server not found in the registry.
    #[error("MCP server not found: {server}")]
    ServerNotFound {
        /// The server id that was not found.
        server: String,
    },

    /// Server id already taken.
    #[error("MCP server already exists: {server}")]
    ServerAlreadyExists {
        /// The server id.
        server: String,
    },

    /// Server is disabled by configuration.
    #[error("MCP server is disabled: {server}")]
    ServerDisabled {
        /// The server id.
        server: String,
    },

    /// Server has no live client session.
    #[error("MCP server not connected: {server}")]
    ServerNotConnected {
        /// The server id.
        server: String,
    },

    /// All start attempts were exhausted.
    #[error("Failed to start MCP server {server}: {reason}")]
    ServerStartFailed {
        /// The server id.
        server: String,
        /// Reason for failure.
        reason: String,
        /// Underlying cause, if any.
        #[source]
        source: Option<Box<McpError>>,
    },

    /// Stopping the server failed.
    #[error("Failed to stop MCP server {server}: {reason}")]
    ServerStopFailed {
        /// The server id.
        server: String,
        /// Reason for failure.
        reason: String,
    },

    /// The transport could not be created or spawned.
    #[error("Failed to create transport for {server}: {reason}")]
    TransportCreationFailed {
        /// The server id.
        server: String,
        /// Reason for failure.
        reason: String,
        /// Underlying cause, if any.
        #[source]
        source: Option<std::io::Error>,
    },

    /// The transport opened but the protocol handshake failed.
    #[error("Failed to connect to {server}: {reason}")]
    TransportConnectionFailed {
        /// The server id.
        server: String,
        /// Reason for failure.
        reason: String,
    },

    /// The transport was used after close.
    #[error("Transport closed for {server}")]
    TransportClosed {
        /// The server id.
        server: String,
    },

    /// Sending a frame over a live transport failed.
    #[error("Failed to send over transport for {server}: {reason}")]
    TransportSendFailed {
        /// The server id.
        server: String,
        /// Reason for failure.
        reason: String,
    },

    /// Proxy splice error.
    #[error("Proxy error: {reason}")]
    Proxy {
        /// Reason for failure.
        reason: String,
    },

    /// Tool is not exposed by the server.
    #[error("Tool not found on {server}: {tool}")]
    ToolNotFound {
        /// The server id.
        server: String,
        /// The tool name.
        tool: String,
    },

    /// The tool ran and reported an error result.
    #[error("Tool invocation failed on {server}:{tool}: {reason}")]
    ToolInvocationFailed {
        /// The server id.
        server: String,
        /// The tool name.
        tool: String,
        /// Error text returned by the tool.
        reason: String,
    },

    /// The peer answered a request with a JSON-RPC error object.
    #[error("Error response from {server} for {method}: {message} (code {code})")]
    ToolResponseError {
        /// The server id.
        server: String,
        /// The request method.
        method: String,
        /// JSON-RPC error code.
        code: i64,
        /// JSON-RPC error message.
        message: String,
    },

    /// The peer does not implement `completion/complete`.
    #[error("Completions not supported by {server}")]
    CompletionsNotSupported {
        /// The server id.
        server: String,
    },

    /// The completion request failed.
    #[error("Completions failed on {server}: {reason}")]
    CompletionsFailed {
        /// The server id.
        server: String,
        /// Reason for failure.
        reason: String,
    },

    /// Configuration record is invalid.
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Reason the record was rejected.
        reason: String,
    },

    /// A request did not complete within its deadline.
    #[error("Operation timed out after {timeout_ms}ms: {operation}")]
    OperationTimeout {
        /// What timed out.
        operation: String,
        /// The deadline that elapsed.
        timeout_ms: u64,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Anything that does not fit the taxonomy.
    #[error("{reason}")]
    Unknown {
        /// Description of the failure.
        reason: String,
    },
}

impl McpError {
    /// The server id this error is about, if it carries one.
    #[must_use]
    pub fn server(&self) -> Option<&str> {
        match self {
            Self::ServerNotFound { server }
            | Self::ServerAlreadyExists { server }
            | Self::ServerDisabled { server }
            | Self::ServerNotConnected { server }
            | Self::ServerStartFailed { server, .. }
            | Self::ServerStopFailed { server, .. }
            | Self::TransportCreationFailed { server, .. }
            | Self::TransportConnectionFailed { server, .. }
            | Self::TransportClosed { server }
            | Self::TransportSendFailed { server, .. }
            | Self::ToolNotFound { server, .. }
            | Self::ToolInvocationFailed { server, .. }
            | Self::ToolResponseError { server, .. }
            | Self::CompletionsNotSupported { server }
            | Self::CompletionsFailed { server, .. } => Some(server),
            _ => None,
        }
    }

    /// The tool name this error is about, if it carries one.
    #[must_use]
    pub fn tool(&self) -> Option<&str> {
        match self {
            Self::ToolNotFound { tool, .. } | Self::ToolInvocationFailed { tool, .. } => Some(tool),
            _ => None,
        }
    }

    /// Whether the error is a JSON-RPC "method not found" response.
    #[must_use]
    pub fn is_method_not_found(&self) -> bool {
        matches!(
            self,
            Self::ToolResponseError {
                code: crate::protocol::METHOD_NOT_FOUND,
                ..
            }
        )
    }
}

/// Result type for MCP runtime operations.
pub type McpResult<T> = Result<T, McpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_carries_server_and_tool() {
        let err = McpError::ToolInvocationFailed {
            server: "s1".to_string(),
            tool: "ping".to_string(),
            reason: "bad arg".to_string(),
        };
        assert_eq!(err.server(), Some("s1"));
        assert_eq!(err.tool(), Some("ping"));
        assert!(err.to_string().contains("bad arg"));
    }

    #[test]
    fn test_start_failed_preserves_cause() {
        let cause = McpError::TransportCreationFailed {
            server: "s1".to_string(),
            reason: "no such binary".to_string(),
            source: None,
        };
        let err = McpError::ServerStartFailed {
            server: "s1".to_string(),
            reason: "retries exhausted".to_string(),
            source: Some(Box::new(cause)),
        };
        let source = std::error::Error::source(&err).expect("cause preserved");
        assert!(source.to_string().contains("no such binary"));
    }

    #[test]
    fn test_method_not_found_detection() {
        let err = McpError::ToolResponseError {
            server: "s1".to_string(),
            method: "completion/complete".to_string(),
            code: crate::protocol::METHOD_NOT_FOUND,
            message: "method not found".to_string(),
        };
        assert!(err.is_method_not_found());
    }
}
