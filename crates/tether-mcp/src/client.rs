//! JSON-RPC client session over a transport.
//!
//! Requests carry monotonic numeric ids; responses are matched back to
//! their request by id, so requests complete in arbitrary order.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, METHOD_NOT_FOUND};
use crate::transport::{Transport, TransportEvent};
use crate::types::{Tool, ToolResult};

/// Protocol revision advertised during the handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Default per-request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default handshake deadline.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client identity advertised during the handshake.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// Client name.
    pub name: String,
    /// Client version.
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Options for a client session.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Identity advertised during the handshake.
    pub client_info: ClientInfo,
    /// Deadline for ordinary requests.
    pub request_timeout: Duration,
    /// Deadline for the handshake.
    pub connect_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_info: ClientInfo::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Peer identity from the handshake result.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PeerInfo {
    /// Server name.
    #[serde(default)]
    pub name: String,
    /// Server version.
    #[serde(default)]
    pub version: String,
}

/// Negotiated handshake result.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerHandshake {
    /// Protocol revision the peer speaks.
    #[serde(rename = "protocolVersion", default)]
    pub protocol_version: String,
    /// Peer identity.
    #[serde(rename = "serverInfo", default)]
    pub server_info: PeerInfo,
    /// Capability map, kept as-is.
    #[serde(default)]
    pub capabilities: Value,
    /// Usage instructions the peer wants surfaced to the model.
    #[serde(default)]
    pub instructions: Option<String>,
}

type PendingMap = Mutex<HashMap<i64, PendingRequest>>;

struct PendingRequest {
    method: String,
    respond: oneshot::Sender<McpResult<Value>>,
}

/// A connected JSON-RPC session with one server.
pub struct ClientSession {
    server_name: String,
    transport: Arc<dyn Transport>,
    pending: Arc<PendingMap>,
    next_id: AtomicI64,
    options: ClientOptions,
    handshake: ServerHandshake,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl ClientSession {
    /// Start the transport, perform the handshake, and return a live
    /// session.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::TransportCreationFailed`] when the transport
    /// cannot start and [`McpError::TransportConnectionFailed`] when the
    /// handshake fails or times out.
    pub async fn connect(
        server_name: impl Into<String>,
        transport: Arc<dyn Transport>,
        options: ClientOptions,
    ) -> McpResult<Self> {
        let server_name = server_name.into();
        let events = transport.start().await?;

        let pending: Arc<PendingMap> = Arc::new(Mutex::new(HashMap::new()));
        let (closed_tx, _) = watch::channel(false);

        let reader = Self::spawn_reader(
            server_name.clone(),
            Arc::clone(&transport),
            Arc::clone(&pending),
            closed_tx.clone(),
            events,
        );

        let mut session = Self {
            server_name: server_name.clone(),
            transport,
            pending,
            next_id: AtomicI64::new(1),
            options,
            handshake: ServerHandshake::default(),
            reader: Mutex::new(Some(reader)),
            closed: AtomicBool::new(false),
            closed_tx,
        };

        match session.perform_handshake().await {
            Ok(handshake) => {
                info!(
                    server = %server_name,
                    peer = %handshake.server_info.name,
                    protocol = %handshake.protocol_version,
                    "MCP handshake complete"
                );
                session.handshake = handshake;
                Ok(session)
            },
            Err(e) => {
                let _ = session.close().await;
                Err(McpError::TransportConnectionFailed {
                    server: server_name,
                    reason: e.to_string(),
                })
            },
        }
    }

    fn spawn_reader(
        server_name: String,
        transport: Arc<dyn Transport>,
        pending: Arc<PendingMap>,
        closed_tx: watch::Sender<bool>,
        mut events: mpsc::Receiver<TransportEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::Message(message) => {
                        Self::route_message(&server_name, &transport, &pending, message).await;
                    },
                    TransportEvent::Error(e) => {
                        warn!(server = %server_name, error = %e, "transport error");
                    },
                    TransportEvent::Closed => break,
                }
            }

            // Unexpected or expected end of stream: cancel everything
            // still inflight and flag the session closed.
            let stranded: Vec<PendingRequest> = {
                let mut map = pending
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                map.drain().map(|(_, p)| p).collect()
            };
            for request in stranded {
                let _ = request.respond.send(Err(McpError::TransportClosed {
                    server: server_name.clone(),
                }));
            }
            let _ = closed_tx.send(true);
        })
    }

    async fn route_message(
        server_name: &str,
        transport: &Arc<dyn Transport>,
        pending: &Arc<PendingMap>,
        message: Value,
    ) {
        let id = message.get("id").and_then(Value::as_i64);
        let is_response = message.get("result").is_some() || message.get("error").is_some();

        match (id, is_response) {
            (Some(id), true) => {
                let slot = {
                    let mut map = pending
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    map.remove(&id)
                };
                let Some(request) = slot else {
                    debug!(server = server_name, id, "response for unknown request id");
                    return;
                };

                let response: JsonRpcResponse = match serde_json::from_value(message) {
                    Ok(r) => r,
                    Err(e) => {
                        let _ = request.respond.send(Err(McpError::Serialization(e)));
                        return;
                    },
                };

                let outcome = match (response.result, response.error) {
                    (_, Some(error)) => Err(McpError::ToolResponseError {
                        server: server_name.to_string(),
                        method: request.method,
                        code: error.code,
                        message: error.message,
                    }),
                    (Some(result), None) => Ok(result),
                    (None, None) => Ok(Value::Null),
                };
                let _ = request.respond.send(outcome);
            },
            (Some(id), false) => {
                // Server-initiated request; this client exposes no
                // server-facing capabilities.
                let reply = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": METHOD_NOT_FOUND, "message": "method not supported"},
                });
                if let Err(e) = transport.send(&reply).await {
                    debug!(server = server_name, error = %e, "failed to answer peer request");
                }
            },
            (None, _) => {
                debug!(
                    server = server_name,
                    method = message.get("method").and_then(serde_json::Value::as_str).unwrap_or(""),
                    "ignoring notification"
                );
            },
        }
    }

    async fn perform_handshake(&self) -> McpResult<ServerHandshake> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": self.options.client_info.name,
                "version": self.options.client_info.version,
            },
        });
        let result = self
            .request_with_timeout("initialize", Some(params), self.options.connect_timeout)
            .await?;
        let handshake: ServerHandshake = serde_json::from_value(result)?;

        let initialized = JsonRpcRequest::notification("notifications/initialized", None);
        self.transport
            .send(&serde_json::to_value(&initialized)?)
            .await?;
        Ok(handshake)
    }

    /// The negotiated handshake result.
    #[must_use]
    pub fn handshake(&self) -> &ServerHandshake {
        &self.handshake
    }

    /// Watch channel that flips to `true` when the session closes.
    #[must_use]
    pub fn closed_watch(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Issue a generic request and return the raw result value.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::TransportClosed`] after close,
    /// [`McpError::OperationTimeout`] when no response arrives in time, and
    /// [`McpError::ToolResponseError`] when the peer answers with a
    /// JSON-RPC error object.
    pub async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        self.request_with_timeout(method, params, self.options.request_timeout)
            .await
    }

    /// Issue a generic request under an explicit deadline.
    ///
    /// The peer is not cancelled on timeout; only the local slot is
    /// released.
    ///
    /// # Errors
    ///
    /// As [`ClientSession::request`].
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> McpResult<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::TransportClosed {
                server: self.server_name.clone(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (respond, receive) = oneshot::channel();
        {
            let mut map = self
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            map.insert(
                id,
                PendingRequest {
                    method: method.to_string(),
                    respond,
                },
            );
        }

        let request = JsonRpcRequest::new(id, method, params);
        if let Err(e) = self.transport.send(&serde_json::to_value(&request)?).await {
            let mut map = self
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            map.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, receive).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(McpError::TransportClosed {
                server: self.server_name.clone(),
            }),
            Err(_) => {
                let mut map = self
                    .pending
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                map.remove(&id);
                Err(McpError::OperationTimeout {
                    operation: method.to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            },
        }
    }

    /// List the tools the peer exposes. May be empty.
    ///
    /// # Errors
    ///
    /// As [`ClientSession::request`].
    pub async fn list_tools(&self) -> McpResult<Vec<Tool>> {
        #[derive(Deserialize)]
        struct ToolList {
            #[serde(default)]
            tools: Vec<Tool>,
        }

        let result = self.request("tools/list", None).await?;
        let list: ToolList = serde_json::from_value(result)?;
        Ok(list.tools)
    }

    /// Call a tool; a peer-reported error result becomes
    /// [`McpError::ToolInvocationFailed`].
    ///
    /// # Errors
    ///
    /// As [`ClientSession::request`], plus
    /// [`McpError::ToolInvocationFailed`] when the result has
    /// `isError = true`.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> McpResult<ToolResult> {
        let params = serde_json::json!({"name": name, "arguments": arguments});
        let deadline = timeout.unwrap_or(self.options.request_timeout);
        let result = self
            .request_with_timeout("tools/call", Some(params), deadline)
            .await?;
        let result: ToolResult = serde_json::from_value(result)?;

        if result.is_error {
            let reason = result.text_content();
            return Err(McpError::ToolInvocationFailed {
                server: self.server_name.clone(),
                tool: name.to_string(),
                reason: if reason.is_empty() {
                    "tool reported an error".to_string()
                } else {
                    reason
                },
            });
        }
        Ok(result)
    }

    /// Lightweight liveness probe.
    ///
    /// # Errors
    ///
    /// As [`ClientSession::request`].
    pub async fn ping(&self) -> McpResult<()> {
        self.request("ping", None).await.map(|_| ())
    }

    /// Close the session: cancel inflight requests with
    /// [`McpError::TransportClosed`] and release the transport. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error when the transport refuses to close.
    pub async fn close(&self) -> McpResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let stranded: Vec<PendingRequest> = {
            let mut map = self
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            map.drain().map(|(_, p)| p).collect()
        };
        for request in stranded {
            let _ = request.respond.send(Err(McpError::TransportClosed {
                server: self.server_name.clone(),
            }));
        }

        let reader = {
            let mut guard = self
                .reader
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.take()
        };
        if let Some(reader) = reader {
            reader.abort();
        }

        let _ = self.closed_tx.send(true);
        self.transport.close().await
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("server", &self.server_name)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
