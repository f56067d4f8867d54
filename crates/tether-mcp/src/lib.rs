//! Tether MCP - server runtime for external tool processes.
//!
//! This crate provides:
//! - Transports framing JSON-RPC over child-process stdio or an HTTP
//!   event stream
//! - A JSON-RPC client session with handshake, tool listing, tool
//!   invocation, and completions
//! - Per-server lifecycle supervision with retry backoff and health
//!   monitoring
//! - A manager that owns many supervisors and fans out discovery and
//!   invocation
//! - A proxy that splices two transports bidirectionally
//!
//! # Example
//!
//! ```rust,no_run
//! use tether_mcp::{ServerConfig, ServerManager};
//!
//! # async fn example() -> Result<(), tether_mcp::McpError> {
//! let manager = ServerManager::new();
//!
//! manager
//!     .start_server(
//!         "filesystem",
//!         ServerConfig::stdio("npx").with_args(["-y", "@anthropics/mcp-server-filesystem"]),
//!     )
//!     .await?;
//!
//! for tool in manager.list_all_tools().await {
//!     println!("{}: {}", tool.full_name(), tool.tool.description.as_deref().unwrap_or(""));
//! }
//!
//! let result = manager
//!     .invoke_tool("filesystem", "read_file", serde_json::json!({"path": "/tmp/x"}))
//!     .await?;
//! println!("{}", result.text_content());
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod prelude;

mod client;
mod config;
mod error;
mod health;
mod logbuf;
mod manager;
pub mod protocol;
mod proxy;
mod supervisor;
pub mod transport;
mod types;

pub use client::{
    ClientInfo, ClientOptions, ClientSession, DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT,
    PROTOCOL_VERSION, PeerInfo, ServerHandshake,
};
pub use config::{
    CRITICAL_ENV_VARS, DEFAULT_HEALTH_INTERVAL_MS, DEFAULT_HEALTH_RETRIES,
    DEFAULT_HEALTH_TIMEOUT_MS, HealthCheckConfig, HealthStrategy, ServerConfig, ServersConfig,
    SpecificToolCheck, TransportKind, merge_update,
};
pub use error::{McpError, McpResult};
pub use health::{
    CHECK_HISTORY_CAP, HealthCheck, HealthCheckRecord, HealthMonitor, HealthState, HealthTarget,
};
pub use logbuf::{DEFAULT_MAX_ENTRIES, DEFAULT_MAX_MESSAGE_LEN, LogBuffer, LogLevel, LogRecord};
pub use manager::ServerManager;
pub use proxy::{
    ProxyErrorRecord, ProxyMetrics, ProxyOptions, ProxySide, ProxyState, SharedTransport,
    TransportProxy,
};
pub use supervisor::{MAX_START_RETRIES, RETRY_BASE_DELAY_MS, ServerSupervisor};
pub use types::{
    ServerStateSnapshot, ServerStatus, Tool, ToolContent, ToolResult, ToolWithServer,
};
