//! Bidirectional splice between two transports.
//!
//! Messages arriving on one side are forwarded to the other, with per-side
//! counters. When both sides are the same transport object the proxy only
//! observes close/error; forwarding a message back to its own source would
//! echo it.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{McpError, McpResult};
use crate::transport::{Transport, TransportEvent};

/// Lifecycle state of a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyState {
    /// Constructed, not yet spliced.
    Disconnected,
    /// Both sides live, pumps running.
    Connected,
    /// Close in progress.
    Closing,
    /// Fully torn down.
    Closed,
    /// An unhandled error stopped the proxy.
    Error,
}

/// Which side an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxySide {
    /// The client-facing transport.
    Client,
    /// The server-facing transport.
    Server,
    /// The proxy itself.
    Proxy,
}

/// Last recorded proxy error.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyErrorRecord {
    /// When it happened.
    pub time: chrono::DateTime<chrono::Utc>,
    /// Error text.
    pub message: String,
    /// Originating side.
    pub source: ProxySide,
}

/// Message and error counters for a proxy.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProxyMetrics {
    /// Messages forwarded to the client side.
    pub to_client: u64,
    /// Messages forwarded to the server side.
    pub to_server: u64,
    /// Messages received from the client side.
    pub from_client: u64,
    /// Messages received from the server side.
    pub from_server: u64,
    /// Errors observed on the client side.
    pub client_errors: u64,
    /// Errors observed on the server side.
    pub server_errors: u64,
    /// Whether the proxy is healthy (no unhandled error).
    pub is_healthy: bool,
    /// Last recorded error.
    pub last_error: Option<ProxyErrorRecord>,
}

/// Options for a proxy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProxyOptions {
    /// Close the peer when one side closes.
    pub auto_close_on_disconnect: bool,
}

/// A transport handle with wrap tracking, the identity unit for proxies.
///
/// Clone the handle to share it; at most one live proxy may wrap a given
/// handle's transport at a time.
#[derive(Clone)]
pub struct SharedTransport {
    inner: Arc<dyn Transport>,
    wrapped: Arc<AtomicBool>,
}

impl SharedTransport {
    /// Wrap a transport in a shared handle.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: transport,
            wrapped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether two handles refer to the same transport object.
    #[must_use]
    pub fn same_transport(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The underlying transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner
    }

    fn try_wrap(&self) -> bool {
        !self.wrapped.swap(true, Ordering::SeqCst)
    }

    fn unwrap_handle(&self) {
        self.wrapped.store(false, Ordering::SeqCst);
    }
}

struct ProxyShared {
    state: Mutex<ProxyState>,
    metrics: Mutex<ProxyMetrics>,
    state_tx: watch::Sender<ProxyState>,
}

impl ProxyShared {
    fn set_state(&self, next: ProxyState) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *state = next;
        let _ = self.state_tx.send(next);
    }

    fn record_error(&self, source: ProxySide, message: String) {
        let mut metrics = self
            .metrics
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match source {
            ProxySide::Client => {
                metrics.client_errors = metrics.client_errors.saturating_add(1);
            },
            ProxySide::Server => {
                metrics.server_errors = metrics.server_errors.saturating_add(1);
            },
            ProxySide::Proxy => {},
        }
        metrics.is_healthy = false;
        metrics.last_error = Some(ProxyErrorRecord {
            time: chrono::Utc::now(),
            message,
            source,
        });
    }
}

/// Splices two transports bidirectionally.
pub struct TransportProxy {
    client: SharedTransport,
    server: SharedTransport,
    shared_endpoint: bool,
    options: ProxyOptions,
    shared: Arc<ProxyShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closing: AtomicBool,
}

impl TransportProxy {
    /// Create a proxy over two transport handles.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::Proxy`] when either handle's transport is
    /// already wrapped by a live proxy.
    pub fn new(
        client: SharedTransport,
        server: SharedTransport,
        options: ProxyOptions,
    ) -> McpResult<Self> {
        let shared_endpoint = client.same_transport(&server);

        if !client.try_wrap() {
            return Err(McpError::Proxy {
                reason: "client transport is already wrapped by a proxy".to_string(),
            });
        }
        if !shared_endpoint && !server.try_wrap() {
            client.unwrap_handle();
            return Err(McpError::Proxy {
                reason: "server transport is already wrapped by a proxy".to_string(),
            });
        }

        let (state_tx, _) = watch::channel(ProxyState::Disconnected);
        Ok(Self {
            client,
            server,
            shared_endpoint,
            options,
            shared: Arc::new(ProxyShared {
                state: Mutex::new(ProxyState::Disconnected),
                metrics: Mutex::new(ProxyMetrics {
                    is_healthy: true,
                    ..ProxyMetrics::default()
                }),
                state_tx,
            }),
            tasks: Mutex::new(Vec::new()),
            closing: AtomicBool::new(false),
        })
    }

    /// Start both sides and begin forwarding.
    ///
    /// With a shared endpoint the single transport is started once and
    /// only close/error are observed.
    ///
    /// # Errors
    ///
    /// Returns the underlying transport start error; the proxy moves to
    /// [`ProxyState::Error`].
    pub async fn start(&self) -> McpResult<()> {
        let client_events = match self.client.transport().start().await {
            Ok(events) => events,
            Err(e) => {
                self.shared.record_error(ProxySide::Client, e.to_string());
                self.shared.set_state(ProxyState::Error);
                return Err(e);
            },
        };

        let mut tasks = Vec::new();

        if self.shared_endpoint {
            debug!("shared-endpoint proxy: forwarding disabled");
            tasks.push(self.spawn_observer(client_events));
        } else {
            let server_events = match self.server.transport().start().await {
                Ok(events) => events,
                Err(e) => {
                    self.shared.record_error(ProxySide::Server, e.to_string());
                    self.shared.set_state(ProxyState::Error);
                    return Err(e);
                },
            };

            tasks.push(self.spawn_pump(ProxySide::Client, client_events));
            tasks.push(self.spawn_pump(ProxySide::Server, server_events));
        }

        {
            let mut guard = self
                .tasks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.extend(tasks);
        }

        self.shared.set_state(ProxyState::Connected);
        info!(shared = self.shared_endpoint, "proxy connected");
        Ok(())
    }

    fn spawn_pump(
        &self,
        from: ProxySide,
        mut events: tokio::sync::mpsc::Receiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let destination = match from {
            ProxySide::Client => self.server.clone(),
            _ => self.client.clone(),
        };
        let shared = Arc::clone(&self.shared);
        let auto_close = self.options.auto_close_on_disconnect;

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::Message(message) => {
                        {
                            let mut metrics = shared
                                .metrics
                                .lock()
                                .unwrap_or_else(std::sync::PoisonError::into_inner);
                            match from {
                                ProxySide::Client => {
                                    metrics.from_client = metrics.from_client.saturating_add(1);
                                },
                                _ => {
                                    metrics.from_server = metrics.from_server.saturating_add(1);
                                },
                            }
                        }
                        match destination.transport().send(&message).await {
                            Ok(()) => {
                                let mut metrics = shared
                                    .metrics
                                    .lock()
                                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                                match from {
                                    ProxySide::Client => {
                                        metrics.to_server = metrics.to_server.saturating_add(1);
                                    },
                                    _ => {
                                        metrics.to_client = metrics.to_client.saturating_add(1);
                                    },
                                }
                            },
                            Err(e) => {
                                let destination_side = match from {
                                    ProxySide::Client => ProxySide::Server,
                                    _ => ProxySide::Client,
                                };
                                warn!(error = %e, "proxy forward failed");
                                shared.record_error(destination_side, e.to_string());
                            },
                        }
                    },
                    TransportEvent::Error(e) => {
                        shared.record_error(from, e.to_string());
                    },
                    TransportEvent::Closed => {
                        debug!(side = ?from, "proxy side closed");
                        if auto_close {
                            let _ = destination.transport().close().await;
                        }
                        break;
                    },
                }
            }
        })
    }

    fn spawn_observer(
        &self,
        mut events: tokio::sync::mpsc::Receiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::Message(_) => {
                        // Shared endpoint: forwarding would echo.
                    },
                    TransportEvent::Error(e) => {
                        shared.record_error(ProxySide::Proxy, e.to_string());
                    },
                    TransportEvent::Closed => break,
                }
            }
        })
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ProxyState {
        *self
            .shared
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Watch channel of state transitions.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ProxyState> {
        self.shared.state_tx.subscribe()
    }

    /// Current metrics snapshot.
    #[must_use]
    pub fn metrics(&self) -> ProxyMetrics {
        self.shared
            .metrics
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Tear down both sides. Idempotent; a second call (or a call racing
    /// the first) is a no-op.
    ///
    /// # Errors
    ///
    /// Close errors from the transports are recorded in metrics, not
    /// returned; the state still reaches [`ProxyState::Closed`].
    pub async fn close(&self) -> McpResult<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.shared.set_state(ProxyState::Closing);

        if let Err(e) = self.client.transport().close().await {
            self.shared.record_error(ProxySide::Client, e.to_string());
        }
        if !self.shared_endpoint
            && let Err(e) = self.server.transport().close().await
        {
            self.shared.record_error(ProxySide::Server, e.to_string());
        }

        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self
                .tasks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }

        self.client.unwrap_handle();
        if !self.shared_endpoint {
            self.server.unwrap_handle();
        }

        self.shared.set_state(ProxyState::Closed);
        info!("proxy closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;

    /// Transport whose sent messages are captured, and whose inbound side
    /// is driven by the test.
    struct PipeTransport {
        name: String,
        sent: Mutex<VecDeque<Value>>,
        inbound: Mutex<Option<mpsc::Sender<TransportEvent>>>,
        closed: AtomicBool,
    }

    impl PipeTransport {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                sent: Mutex::new(VecDeque::new()),
                inbound: Mutex::new(None),
                closed: AtomicBool::new(false),
            }
        }

        async fn inject(&self, event: TransportEvent) {
            let sender = {
                let guard = self
                    .inbound
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                guard.clone()
            };
            if let Some(sender) = sender {
                let _ = sender.send(event).await;
            }
        }

        fn sent_count(&self) -> usize {
            self.sent
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .len()
        }
    }

    #[async_trait::async_trait]
    impl Transport for PipeTransport {
        async fn start(&self) -> McpResult<mpsc::Receiver<TransportEvent>> {
            let (tx, rx) = mpsc::channel(64);
            *self
                .inbound
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(tx);
            Ok(rx)
        }

        async fn send(&self, message: &Value) -> McpResult<()> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(McpError::TransportClosed {
                    server: self.name.clone(),
                });
            }
            self.sent
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push_back(message.clone());
            Ok(())
        }

        async fn close(&self) -> McpResult<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn server_name(&self) -> &str {
            &self.name
        }
    }

    async fn settle() {
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn test_forwarding_and_counters() {
        let a = Arc::new(PipeTransport::new("a"));
        let b = Arc::new(PipeTransport::new("b"));
        let proxy = TransportProxy::new(
            SharedTransport::new(a.clone()),
            SharedTransport::new(b.clone()),
            ProxyOptions::default(),
        )
        .unwrap();
        proxy.start().await.unwrap();
        assert_eq!(proxy.state(), ProxyState::Connected);

        a.inject(TransportEvent::Message(serde_json::json!({"id": 1})))
            .await;
        b.inject(TransportEvent::Message(serde_json::json!({"id": 2})))
            .await;
        settle().await;

        assert_eq!(b.sent_count(), 1);
        assert_eq!(a.sent_count(), 1);

        let metrics = proxy.metrics();
        assert_eq!(metrics.from_client, 1);
        assert_eq!(metrics.to_server, 1);
        assert_eq!(metrics.from_server, 1);
        assert_eq!(metrics.to_client, 1);
        assert!(metrics.is_healthy);

        proxy.close().await.unwrap();
        assert_eq!(proxy.state(), ProxyState::Closed);
    }

    #[tokio::test]
    async fn test_shared_endpoint_does_not_echo() {
        let a = Arc::new(PipeTransport::new("a"));
        let handle = SharedTransport::new(a.clone());
        let proxy =
            TransportProxy::new(handle.clone(), handle, ProxyOptions::default()).unwrap();
        proxy.start().await.unwrap();

        a.inject(TransportEvent::Message(serde_json::json!({"id": 1})))
            .await;
        settle().await;

        assert_eq!(a.sent_count(), 0);
        proxy.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_double_close_is_single_teardown() {
        let a = Arc::new(PipeTransport::new("a"));
        let b = Arc::new(PipeTransport::new("b"));
        let proxy = TransportProxy::new(
            SharedTransport::new(a),
            SharedTransport::new(b),
            ProxyOptions::default(),
        )
        .unwrap();
        proxy.start().await.unwrap();

        let mut transitions = proxy.state_changes();
        proxy.close().await.unwrap();
        proxy.close().await.unwrap();

        assert_eq!(proxy.state(), ProxyState::Closed);
        // The watch holds the final state; only one Closed was published.
        assert_eq!(*transitions.borrow_and_update(), ProxyState::Closed);
    }

    #[tokio::test]
    async fn test_second_wrap_rejected() {
        let a = Arc::new(PipeTransport::new("a"));
        let b = Arc::new(PipeTransport::new("b"));
        let c = Arc::new(PipeTransport::new("c"));
        let handle_a = SharedTransport::new(a);

        let proxy = TransportProxy::new(
            handle_a.clone(),
            SharedTransport::new(b),
            ProxyOptions::default(),
        )
        .unwrap();

        let second = TransportProxy::new(
            handle_a.clone(),
            SharedTransport::new(c),
            ProxyOptions::default(),
        );
        assert!(matches!(second, Err(McpError::Proxy { .. })));

        // After close the handle may be wrapped again.
        proxy.close().await.unwrap();
        let c2 = Arc::new(PipeTransport::new("c2"));
        assert!(
            TransportProxy::new(handle_a, SharedTransport::new(c2), ProxyOptions::default())
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_auto_close_on_disconnect() {
        let a = Arc::new(PipeTransport::new("a"));
        let b = Arc::new(PipeTransport::new("b"));
        let proxy = TransportProxy::new(
            SharedTransport::new(a.clone()),
            SharedTransport::new(b.clone()),
            ProxyOptions {
                auto_close_on_disconnect: true,
            },
        )
        .unwrap();
        proxy.start().await.unwrap();

        a.inject(TransportEvent::Closed).await;
        settle().await;

        assert!(b.closed.load(Ordering::SeqCst));
        proxy.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_error_event_updates_metrics() {
        let a = Arc::new(PipeTransport::new("a"));
        let b = Arc::new(PipeTransport::new("b"));
        let proxy = TransportProxy::new(
            SharedTransport::new(a.clone()),
            SharedTransport::new(b),
            ProxyOptions::default(),
        )
        .unwrap();
        proxy.start().await.unwrap();

        a.inject(TransportEvent::Error(McpError::Unknown {
            reason: "stream hiccup".to_string(),
        }))
        .await;
        settle().await;

        let metrics = proxy.metrics();
        assert_eq!(metrics.client_errors, 1);
        assert!(!metrics.is_healthy);
        let last = metrics.last_error.unwrap();
        assert_eq!(last.source, ProxySide::Client);
        assert!(last.message.contains("stream hiccup"));

        proxy.close().await.unwrap();
    }
}
