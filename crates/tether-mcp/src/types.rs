//! Tool, result, and server-state types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::health::HealthState;
use crate::logbuf::LogRecord;

/// Definition of a tool exposed by an MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    /// Tool name.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
    /// JSON Schema for input parameters.
    #[serde(rename = "inputSchema", default = "default_schema")]
    pub input_schema: Value,
}

fn default_schema() -> Value {
    serde_json::json!({"type": "object"})
}

impl Tool {
    /// Create a new tool definition with an empty object schema.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema: default_schema(),
        }
    }

    /// Set description.
    #[must_use]
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// Set input schema.
    #[must_use]
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }
}

/// A tool definition tagged with the server that exposes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolWithServer {
    /// Server this tool belongs to.
    pub server_name: String,
    /// The tool definition.
    #[serde(flatten)]
    pub tool: Tool,
}

impl ToolWithServer {
    /// Create from a tool and server name.
    #[must_use]
    pub fn new(server_name: impl Into<String>, tool: Tool) -> Self {
        Self {
            server_name: server_name.into(),
            tool,
        }
    }

    /// Full `server.tool` identifier, as embedded in model output.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.server_name, self.tool.name)
    }
}

/// Content block returned by a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolContent {
    /// Text content.
    Text {
        /// The text.
        text: String,
    },
    /// Image content.
    Image {
        /// Base64-encoded image data.
        data: String,
        /// MIME type.
        mime_type: String,
    },
    /// Resource reference.
    Resource {
        /// Resource URI.
        uri: String,
        /// Resource data, if inlined.
        data: Option<String>,
        /// MIME type.
        mime_type: Option<String>,
    },
}

/// Result of calling a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether the tool reported an error.
    #[serde(rename = "isError", default)]
    pub is_error: bool,
    /// Content blocks returned by the tool.
    #[serde(default)]
    pub content: Vec<ToolContent>,
}

impl ToolResult {
    /// Create a successful result with a single text block.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            is_error: false,
            content: vec![ToolContent::Text {
                text: content.into(),
            }],
        }
    }

    /// Create an error result with a single text block.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            is_error: true,
            content: vec![ToolContent::Text {
                text: message.into(),
            }],
        }
    }

    /// All text blocks joined with newlines.
    #[must_use]
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                ToolContent::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Lifecycle status of a supervised server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    /// Constructed, never started.
    Uninitialized,
    /// Start in progress (including retry backoff).
    Starting,
    /// Handshake complete, client live.
    Connected,
    /// Stopped or transport lost; no client, no transport.
    Disconnected,
    /// Start retries exhausted.
    Error,
    /// Disabled by configuration; never opens a transport.
    Disabled,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Starting => "starting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
            Self::Disabled => "disabled",
        };
        f.write_str(s)
    }
}

/// Point-in-time snapshot of a supervised server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStateSnapshot {
    /// Current lifecycle status.
    pub status: ServerStatus,
    /// Latest error message, if any.
    pub error: Option<String>,
    /// Connect attempt index within the current backoff window.
    pub retry_count: u32,
    /// When the last retry was scheduled.
    pub last_retry: Option<chrono::DateTime<chrono::Utc>>,
    /// Recent log lines.
    pub logs: Vec<LogRecord>,
    /// Health snapshot.
    pub health: HealthState,
}
