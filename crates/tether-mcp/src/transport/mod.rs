//! Transport abstraction: framed JSON-RPC messages over a byte-stream
//! carrier.
//!
//! Two carriers exist: a child process speaking newline-delimited JSON over
//! stdio, and an HTTP event stream. Implementations surface inbound traffic
//! as [`TransportEvent`]s on a channel returned from `start` rather than
//! user-assignable callback fields, so each consumer owns a single reader.

mod eventstream;
mod stdio;

pub use eventstream::EventStreamTransport;
pub use stdio::StdioTransport;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::{ServerConfig, TransportKind};
use crate::error::{McpError, McpResult};
use crate::logbuf::LogBuffer;

/// Capacity of the inbound event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Inbound traffic and lifecycle notifications from a transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// A decoded JSON-RPC message.
    Message(Value),
    /// The underlying stream ended.
    Closed,
    /// The transport failed.
    Error(McpError),
}

/// A byte-stream carrier for framed JSON-RPC messages.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the carrier and return the inbound event channel.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::TransportCreationFailed`] when the child cannot
    /// be spawned or the URL cannot be opened, and when called twice.
    async fn start(&self) -> McpResult<mpsc::Receiver<TransportEvent>>;

    /// Send one message as a frame.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::TransportClosed`] after `close`, otherwise
    /// [`McpError::TransportSendFailed`] when the write fails.
    async fn send(&self, message: &Value) -> McpResult<()>;

    /// Close the carrier. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error only when releasing the carrier fails in a way the
    /// caller can act on; double-close is a no-op.
    async fn close(&self) -> McpResult<()>;

    /// Name of the server this transport belongs to, for diagnostics.
    fn server_name(&self) -> &str;
}

/// Builds transports from validated configs.
///
/// The default factory picks the carrier from the config's `command`;
/// embedders and tests inject their own to substitute in-process
/// transports.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Build a transport for the given server.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::TransportCreationFailed`] when the carrier
    /// cannot be constructed.
    async fn build(
        &self,
        server_name: &str,
        config: &ServerConfig,
        logs: Arc<LogBuffer>,
    ) -> McpResult<Arc<dyn Transport>>;
}

/// Factory selecting stdio or event-stream from the config.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTransportFactory;

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn build(
        &self,
        server_name: &str,
        config: &ServerConfig,
        logs: Arc<LogBuffer>,
    ) -> McpResult<Arc<dyn Transport>> {
        match config.transport_kind() {
            TransportKind::Stdio => Ok(Arc::new(StdioTransport::new(server_name, config, logs))),
            TransportKind::EventStream => {
                Ok(Arc::new(EventStreamTransport::new(server_name, config)?))
            },
        }
    }
}
