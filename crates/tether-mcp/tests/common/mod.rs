//! Shared test doubles: an in-process JSON-RPC peer and a transport
//! factory that can be scripted to fail.

use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::{Mutex, mpsc};

use tether_mcp::transport::{Transport, TransportEvent, TransportFactory};
use tether_mcp::{LogBuffer, McpError, McpResult, ServerConfig};

/// Response script: maps a request method + full message to a result
/// value, or `None` to leave the request unanswered.
pub type Script = Arc<dyn Fn(&str, &Value) -> Option<Value> + Send + Sync>;

/// Script answering the standard handshake plus a single `ping` tool that
/// returns `"pong"`.
#[must_use]
pub fn stub_script() -> Script {
    Arc::new(|method, _message| match method {
        "initialize" => Some(serde_json::json!({
            "protocolVersion": "2024-11-05",
            "serverInfo": {"name": "stub", "version": "0.0.1"},
            "capabilities": {"tools": {}},
        })),
        "tools/list" => Some(serde_json::json!({
            "tools": [{
                "name": "ping",
                "description": "",
                "inputSchema": {"type": "object", "properties": {}},
            }],
        })),
        "tools/call" => Some(serde_json::json!({
            "isError": false,
            "content": [{"type": "text", "text": "pong"}],
        })),
        "ping" => Some(serde_json::json!({})),
        _ => None,
    })
}

/// In-process peer that answers requests via a [`Script`].
pub struct ScriptedTransport {
    script: Script,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    closed: AtomicBool,
}

impl ScriptedTransport {
    #[must_use]
    pub fn new(script: Script) -> Self {
        Self {
            script,
            events: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn start(&self) -> McpResult<mpsc::Receiver<TransportEvent>> {
        let (tx, rx) = mpsc::channel(64);
        *self.events.lock().await = Some(tx);
        Ok(rx)
    }

    async fn send(&self, message: &Value) -> McpResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::TransportClosed {
                server: "scripted".to_string(),
            });
        }
        let method = message.get("method").and_then(Value::as_str).unwrap_or("");
        let Some(id) = message.get("id").and_then(Value::as_i64) else {
            return Ok(()); // notification
        };
        if let Some(result) = (self.script)(method, message) {
            let reply = serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result});
            let sender = { self.events.lock().await.clone() };
            if let Some(sender) = sender {
                let _ = sender.send(TransportEvent::Message(reply)).await;
            }
        }
        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        let sender = { self.events.lock().await.take() };
        if let Some(sender) = sender {
            let _ = sender.send(TransportEvent::Closed).await;
        }
        Ok(())
    }

    fn server_name(&self) -> &str {
        "scripted"
    }
}

/// Factory producing scripted transports; the first `failures` builds
/// return a creation error, counting attempts.
pub struct ScriptedFactory {
    script: Script,
    failures: u32,
    pub attempts: AtomicU32,
}

impl ScriptedFactory {
    #[must_use]
    pub fn new(script: Script) -> Self {
        Self {
            script,
            failures: 0,
            attempts: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn failing_first(script: Script, failures: u32) -> Self {
        Self {
            script,
            failures,
            attempts: AtomicU32::new(0),
        }
    }
}

#[async_trait::async_trait]
impl TransportFactory for ScriptedFactory {
    async fn build(
        &self,
        server_name: &str,
        _config: &ServerConfig,
        _logs: Arc<LogBuffer>,
    ) -> McpResult<Arc<dyn Transport>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(McpError::TransportCreationFailed {
                server: server_name.to_string(),
                reason: "scripted spawn failure".to_string(),
                source: None,
            });
        }
        Ok(Arc::new(ScriptedTransport::new(Arc::clone(&self.script))))
    }
}
