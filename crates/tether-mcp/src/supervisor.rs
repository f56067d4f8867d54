//! Per-server lifecycle supervision.
//!
//! A supervisor owns one server's config, transport, client session,
//! health monitor, and log buffer, and drives the status machine
//! uninitialized → starting → connected → disconnected (or error /
//! disabled). Start attempts back off exponentially; stop releases the
//! client before the transport and always reaches `disconnected`.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{ClientOptions, ClientSession, ServerHandshake};
use crate::config::ServerConfig;
use crate::error::{McpError, McpResult};
use crate::health::{HealthCheck, HealthMonitor, HealthState, HealthTarget};
use crate::logbuf::{LogBuffer, LogLevel};
use crate::transport::{DefaultTransportFactory, Transport, TransportFactory};
use crate::types::{ServerStateSnapshot, ServerStatus, Tool, ToolResult};

/// Maximum retries after the first failed start attempt (4 attempts
/// total).
pub const MAX_START_RETRIES: u32 = 3;

/// Base backoff unit; attempt `n` waits `2^n` times this.
pub const RETRY_BASE_DELAY_MS: u64 = 1000;

struct Lifecycle {
    status: ServerStatus,
    error: Option<String>,
    retry_count: u32,
    last_retry: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct RuntimeSlots {
    transport: Option<Arc<dyn Transport>>,
    client: Option<Arc<ClientSession>>,
    monitor: Option<Arc<HealthMonitor>>,
    disconnect_watcher: Option<JoinHandle<()>>,
}

/// Supervises the lifecycle of one MCP server.
pub struct ServerSupervisor {
    name: String,
    config: RwLock<ServerConfig>,
    lifecycle: Mutex<Lifecycle>,
    logs: Arc<LogBuffer>,
    slots: tokio::sync::Mutex<RuntimeSlots>,
    tools: Mutex<Vec<Tool>>,
    factory: Arc<dyn TransportFactory>,
    client_options: ClientOptions,
    custom_check: Option<Arc<dyn HealthCheck>>,
}

impl ServerSupervisor {
    /// Create a supervisor for a validated config. Nothing is spawned
    /// until [`ServerSupervisor::start`].
    ///
    /// # Errors
    ///
    /// Returns [`McpError::InvalidConfiguration`] when the config fails
    /// validation.
    pub fn new(name: impl Into<String>, config: ServerConfig) -> McpResult<Self> {
        config.validate()?;
        let status = if config.disabled {
            ServerStatus::Disabled
        } else {
            ServerStatus::Uninitialized
        };

        Ok(Self {
            name: name.into(),
            config: RwLock::new(config),
            lifecycle: Mutex::new(Lifecycle {
                status,
                error: None,
                retry_count: 0,
                last_retry: None,
            }),
            logs: Arc::new(LogBuffer::new()),
            slots: tokio::sync::Mutex::new(RuntimeSlots::default()),
            tools: Mutex::new(Vec::new()),
            factory: Arc::new(DefaultTransportFactory),
            client_options: ClientOptions::default(),
            custom_check: None,
        })
    }

    /// Substitute the transport factory (tests, embedders).
    #[must_use]
    pub fn with_transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Set client session options.
    #[must_use]
    pub fn with_client_options(mut self, options: ClientOptions) -> Self {
        self.client_options = options;
        self
    }

    /// Inject the capability used by the `custom` health strategy.
    #[must_use]
    pub fn with_custom_health_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.custom_check = Some(check);
        self
    }

    /// Server id.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the config marks this server disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.read_config().disabled
    }

    /// Whether a method is exempt from external approval gates.
    #[must_use]
    pub fn is_auto_approved(&self, method: &str) -> bool {
        self.read_config().auto_approve.contains(method)
    }

    fn read_config(&self) -> ServerConfig {
        self.config
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn set_lifecycle(
        &self,
        status: ServerStatus,
        error: Option<String>,
        retry_count: u32,
        last_retry: Option<DateTime<Utc>>,
    ) {
        let mut lifecycle = self
            .lifecycle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        lifecycle.status = status;
        lifecycle.error = error;
        lifecycle.retry_count = retry_count;
        if last_retry.is_some() {
            lifecycle.last_retry = last_retry;
        }
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> ServerStatus {
        self.lifecycle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .status
    }

    /// Start the server, retrying with exponential backoff.
    ///
    /// A disabled config transitions straight to `disabled` and opens no
    /// transport. Starting while already connected is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::ServerStartFailed`] carrying the final
    /// attempt's cause after the retry budget is exhausted.
    pub async fn start(self: &Arc<Self>) -> McpResult<()> {
        let config = self.read_config();
        if config.disabled {
            self.set_lifecycle(ServerStatus::Disabled, None, 0, None);
            self.logs
                .append(LogLevel::Info, "server is disabled; not starting", None);
            info!(server = %self.name, "server disabled, skipping start");
            return Ok(());
        }

        let mut slots = self.slots.lock().await;
        if self.status() == ServerStatus::Connected {
            return Ok(());
        }

        let mut last_error: Option<McpError> = None;
        for attempt in 0..=MAX_START_RETRIES {
            self.set_lifecycle(ServerStatus::Starting, None, attempt, None);

            match self.try_start(&config).await {
                Ok((transport, client)) => {
                    let monitor = Arc::new(HealthMonitor::new(
                        self.name.clone(),
                        config.health_check.clone(),
                        Arc::new(SupervisorTarget(Arc::downgrade(self))),
                        self.custom_check.clone(),
                    ));
                    monitor.start_monitoring();

                    slots.disconnect_watcher =
                        Some(self.spawn_disconnect_watcher(client.closed_watch()));
                    slots.transport = Some(transport);
                    slots.client = Some(Arc::clone(&client));
                    slots.monitor = Some(monitor);
                    drop(slots);

                    self.set_lifecycle(ServerStatus::Connected, None, 0, None);
                    self.logs.append(LogLevel::Info, "connected", None);
                    info!(server = %self.name, attempt, "server connected");

                    // Prime the tool index; failures here are not fatal.
                    if let Ok(tools) = client.list_tools().await {
                        let mut cache = self
                            .tools
                            .lock()
                            .unwrap_or_else(std::sync::PoisonError::into_inner);
                        *cache = tools;
                    }
                    return Ok(());
                },
                Err(e) => {
                    warn!(server = %self.name, attempt, error = %e, "start attempt failed");
                    self.logs.append(
                        LogLevel::Error,
                        format!("start attempt {attempt} failed: {e}"),
                        None,
                    );
                    last_error = Some(e);

                    if attempt < MAX_START_RETRIES {
                        let delay = RETRY_BASE_DELAY_MS
                            .saturating_mul(2u64.saturating_pow(attempt));
                        self.set_lifecycle(
                            ServerStatus::Starting,
                            last_error.as_ref().map(ToString::to_string),
                            attempt.saturating_add(1),
                            Some(Utc::now()),
                        );
                        debug!(server = %self.name, delay_ms = delay, "backing off before retry");
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                },
            }
        }

        let reason = last_error
            .as_ref()
            .map_or_else(|| "unknown start failure".to_string(), ToString::to_string);
        self.set_lifecycle(
            ServerStatus::Error,
            Some(reason.clone()),
            MAX_START_RETRIES,
            None,
        );
        Err(McpError::ServerStartFailed {
            server: self.name.clone(),
            reason,
            source: last_error.map(Box::new),
        })
    }

    async fn try_start(
        &self,
        config: &ServerConfig,
    ) -> McpResult<(Arc<dyn Transport>, Arc<ClientSession>)> {
        let transport = self
            .factory
            .build(&self.name, config, Arc::clone(&self.logs))
            .await?;

        match ClientSession::connect(
            self.name.clone(),
            Arc::clone(&transport),
            self.client_options.clone(),
        )
        .await
        {
            Ok(client) => Ok((transport, Arc::new(client))),
            Err(e) => {
                // Release the partially opened carrier before backing off.
                let _ = transport.close().await;
                Err(e)
            },
        }
    }

    fn spawn_disconnect_watcher(
        self: &Arc<Self>,
        mut closed: tokio::sync::watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                if *closed.borrow_and_update() {
                    break;
                }
                if closed.changed().await.is_err() {
                    break;
                }
            }
            let Some(supervisor) = weak.upgrade() else {
                return;
            };
            if supervisor.status() == ServerStatus::Connected {
                warn!(server = %supervisor.name, "transport closed unexpectedly");
                supervisor
                    .logs
                    .append(LogLevel::Warning, "transport closed unexpectedly", None);
                let _ = supervisor.teardown(false).await;
            }
        })
    }

    /// Stop the server: health monitor first, then client (cancelling
    /// inflight requests), then transport. Idempotent; cleanup errors are
    /// logged and do not prevent the transition to `disconnected`.
    ///
    /// # Errors
    ///
    /// Currently infallible; the signature leaves room for stop-path
    /// failures callers must see.
    pub async fn stop(&self) -> McpResult<()> {
        self.teardown(true).await
    }

    async fn teardown(&self, abort_watcher: bool) -> McpResult<()> {
        let mut slots = self.slots.lock().await;

        if let Some(monitor) = slots.monitor.take() {
            monitor.stop_monitoring();
        }
        if abort_watcher && let Some(watcher) = slots.disconnect_watcher.take() {
            watcher.abort();
        }
        if let Some(client) = slots.client.take()
            && let Err(e) = client.close().await
        {
            debug!(server = %self.name, error = %e, "client close failed");
            self.logs
                .append(LogLevel::Warning, format!("client close failed: {e}"), None);
        }
        if let Some(transport) = slots.transport.take()
            && let Err(e) = transport.close().await
        {
            debug!(server = %self.name, error = %e, "transport close failed");
            self.logs.append(
                LogLevel::Warning,
                format!("transport close failed: {e}"),
                None,
            );
        }
        drop(slots);

        if self.status() != ServerStatus::Disabled {
            self.set_lifecycle(ServerStatus::Disconnected, None, 0, None);
        }
        info!(server = %self.name, "server stopped");
        Ok(())
    }

    async fn client(&self) -> Option<Arc<ClientSession>> {
        self.slots.lock().await.client.clone()
    }

    /// Invoke a tool on the server.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::ServerDisabled`] for disabled servers,
    /// [`McpError::ServerNotConnected`] without a live client, and the
    /// client's errors otherwise.
    pub async fn invoke_tool(&self, method: &str, args: Value) -> McpResult<ToolResult> {
        if self.is_disabled() {
            return Err(McpError::ServerDisabled {
                server: self.name.clone(),
            });
        }
        let client = self.client().await.ok_or_else(|| McpError::ServerNotConnected {
            server: self.name.clone(),
        })?;
        client.call_tool(method, args, None).await
    }

    /// List the server's tools; disabled or disconnected servers yield an
    /// empty list rather than an error.
    ///
    /// # Errors
    ///
    /// Returns the client's errors when connected and the listing fails.
    pub async fn list_tools(&self) -> McpResult<Vec<Tool>> {
        if self.is_disabled() {
            return Ok(Vec::new());
        }
        let Some(client) = self.client().await else {
            return Ok(Vec::new());
        };

        let tools = client.list_tools().await?;
        {
            let mut cache = self
                .tools
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *cache = tools.clone();
        }
        Ok(tools)
    }

    /// Ask the peer for argument completions via `completion/complete`.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::ToolNotFound`] when `method` is not in the
    /// server's tool list, [`McpError::CompletionsNotSupported`] when the
    /// peer answers MethodNotFound, and
    /// [`McpError::CompletionsFailed`] for other failures.
    pub async fn get_completions(
        &self,
        method: &str,
        arg_name: &str,
        value: &str,
    ) -> McpResult<Vec<String>> {
        if self.is_disabled() {
            return Err(McpError::ServerDisabled {
                server: self.name.clone(),
            });
        }
        let client = self.client().await.ok_or_else(|| McpError::ServerNotConnected {
            server: self.name.clone(),
        })?;

        let cached_empty = {
            let cache = self
                .tools
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            cache.is_empty()
        };
        if cached_empty {
            let _ = self.list_tools().await;
        }
        let known = {
            let cache = self
                .tools
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            cache.iter().any(|t| t.name == method)
        };
        if !known {
            return Err(McpError::ToolNotFound {
                server: self.name.clone(),
                tool: method.to_string(),
            });
        }

        let params = serde_json::json!({
            "argument": {"name": arg_name, "value": value},
            "ref": {"type": "ref/tool", "id": method},
        });
        let result = match client.request("completion/complete", Some(params)).await {
            Ok(result) => result,
            Err(e) if e.is_method_not_found() => {
                return Err(McpError::CompletionsNotSupported {
                    server: self.name.clone(),
                });
            },
            Err(e) => {
                return Err(McpError::CompletionsFailed {
                    server: self.name.clone(),
                    reason: e.to_string(),
                });
            },
        };

        // Pass-through schema: only `completion.values` is relied upon.
        let values = result
            .get("completion")
            .and_then(|c| c.get("values"))
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(values)
    }

    /// Run one health probe now.
    pub async fn check_health(&self) -> HealthState {
        let monitor = self.slots.lock().await.monitor.clone();
        match monitor {
            Some(monitor) => monitor.perform_check().await,
            None => self.offline_health(),
        }
    }

    /// Latest health metrics without probing.
    pub async fn health_snapshot(&self) -> HealthState {
        let monitor = self.slots.lock().await.monitor.clone();
        match monitor {
            Some(monitor) => monitor.snapshot(),
            None => self.offline_health(),
        }
    }

    fn offline_health(&self) -> HealthState {
        let reason = if self.is_disabled() {
            "server is disabled"
        } else {
            "server is not connected"
        };
        HealthState {
            is_healthy: false,
            last_error: Some(reason.to_string()),
            ..HealthState::default()
        }
    }

    /// Full state snapshot: status, error, retries, logs, and health.
    pub async fn get_state(&self) -> ServerStateSnapshot {
        let health = self.health_snapshot().await;
        let lifecycle = self
            .lifecycle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        ServerStateSnapshot {
            status: lifecycle.status,
            error: lifecycle.error.clone(),
            retry_count: lifecycle.retry_count,
            last_retry: lifecycle.last_retry,
            logs: self.logs.snapshot(),
            health,
        }
    }

    /// Negotiated handshake with the peer, when connected.
    pub async fn server_handshake(&self) -> Option<ServerHandshake> {
        self.client().await.map(|c| c.handshake().clone())
    }

    /// Current configuration.
    #[must_use]
    pub fn get_config(&self) -> ServerConfig {
        self.read_config()
    }

    /// Deep-merge a patch into the config. Transport fields
    /// (`command`/`args`/`env`) take effect on the next restart.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::InvalidConfiguration`] when the merged record
    /// is invalid.
    pub fn update_config(&self, patch: &Value) -> McpResult<ServerConfig> {
        let merged = self.read_config().merged(patch)?;
        {
            let mut config = self
                .config
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *config = merged.clone();
        }
        self.logs.append(
            LogLevel::Info,
            "configuration updated; restart required for transport changes",
            None,
        );
        Ok(merged)
    }

    /// The supervisor's log buffer.
    #[must_use]
    pub fn logs(&self) -> &Arc<LogBuffer> {
        &self.logs
    }
}

impl std::fmt::Debug for ServerSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSupervisor")
            .field("name", &self.name)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Health-monitor view of a supervisor, held weakly to avoid a cycle.
struct SupervisorTarget(Weak<ServerSupervisor>);

impl SupervisorTarget {
    fn supervisor(&self) -> McpResult<Arc<ServerSupervisor>> {
        self.0.upgrade().ok_or_else(|| McpError::Unknown {
            reason: "supervisor dropped".to_string(),
        })
    }
}

#[async_trait::async_trait]
impl HealthTarget for SupervisorTarget {
    async fn list_tools(&self) -> McpResult<Vec<Tool>> {
        self.supervisor()?.list_tools().await
    }

    async fn invoke_tool(&self, method: &str, args: Value) -> McpResult<ToolResult> {
        self.supervisor()?.invoke_tool(method, args).await
    }

    async fn ping(&self) -> McpResult<()> {
        let supervisor = self.supervisor()?;
        let client = supervisor
            .client()
            .await
            .ok_or_else(|| McpError::ServerNotConnected {
                server: supervisor.name.clone(),
            })?;
        client.ping().await
    }

    fn is_disabled(&self) -> bool {
        self.0.upgrade().is_some_and(|s| s.is_disabled())
    }
}
