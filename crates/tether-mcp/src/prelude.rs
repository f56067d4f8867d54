//! Commonly used types, re-exported for glob import.

pub use crate::client::{ClientOptions, ClientSession};
pub use crate::config::{HealthCheckConfig, HealthStrategy, ServerConfig, ServersConfig};
pub use crate::error::{McpError, McpResult};
pub use crate::health::{HealthCheck, HealthState};
pub use crate::logbuf::{LogBuffer, LogLevel};
pub use crate::manager::ServerManager;
pub use crate::proxy::{ProxyOptions, ProxyState, SharedTransport, TransportProxy};
pub use crate::supervisor::ServerSupervisor;
pub use crate::transport::{Transport, TransportEvent, TransportFactory};
pub use crate::types::{ServerStatus, Tool, ToolResult, ToolWithServer};
