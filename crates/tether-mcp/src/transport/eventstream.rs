//! HTTP event-stream transport.

use futures::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::config::ServerConfig;
use crate::error::{McpError, McpResult};

use super::{EVENT_CHANNEL_CAPACITY, Transport, TransportEvent};

/// Env key whose value becomes an `Authorization: Bearer …` header.
pub const AUTH_TOKEN_VAR: &str = "MCP_AUTH_TOKEN";

/// Env keys with this prefix contribute the remainder as a header name.
pub const HEADER_VAR_PREFIX: &str = "HEADER_";

/// Streams inbound messages from an HTTP endpoint (`text/event-stream`
/// `data:` events or plain newline-delimited JSON) and POSTs outbound
/// frames back to the same URL. Headers are derived from the config's env
/// map: `MCP_AUTH_TOKEN` and `HEADER_*` keys.
#[derive(Debug)]
pub struct EventStreamTransport {
    server_name: String,
    url: Url,
    headers: HeaderMap,
    client: reqwest::Client,
    started: AtomicBool,
    closed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventStreamTransport {
    /// Create a transport from a validated config whose `command` is a URL.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::TransportCreationFailed`] when the URL or a
    /// derived header is malformed.
    pub fn new(server_name: impl Into<String>, config: &ServerConfig) -> McpResult<Self> {
        let server_name = server_name.into();
        let url = Url::parse(&config.command).map_err(|e| McpError::TransportCreationFailed {
            server: server_name.clone(),
            reason: format!("invalid URL {}: {e}", config.command),
            source: None,
        })?;
        let headers = Self::headers_from_env(&server_name, &config.env)?;

        Ok(Self {
            server_name,
            url,
            headers,
            client: reqwest::Client::new(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            task: Mutex::new(None),
        })
    }

    fn headers_from_env(
        server_name: &str,
        env: &HashMap<String, String>,
    ) -> McpResult<HeaderMap> {
        let bad_header = |reason: String| McpError::TransportCreationFailed {
            server: server_name.to_string(),
            reason,
            source: None,
        };

        let mut headers = HeaderMap::new();
        for (key, value) in env {
            if key == AUTH_TOKEN_VAR {
                let header = HeaderValue::from_str(&format!("Bearer {value}"))
                    .map_err(|e| bad_header(format!("invalid auth token: {e}")))?;
                headers.insert(AUTHORIZATION, header);
            } else if let Some(name) = key.strip_prefix(HEADER_VAR_PREFIX) {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| bad_header(format!("invalid header name {name}: {e}")))?;
                let header = HeaderValue::from_str(value)
                    .map_err(|e| bad_header(format!("invalid header value for {key}: {e}")))?;
                headers.insert(name, header);
            }
        }
        Ok(headers)
    }

    fn parse_event_data(data: &str, server_name: &str) -> Option<TransportEvent> {
        let data = data.trim();
        if data.is_empty() {
            return None;
        }
        match serde_json::from_str::<Value>(data) {
            Ok(message) => Some(TransportEvent::Message(message)),
            Err(e) => {
                debug!(server = server_name, error = %e, "Non-JSON event data");
                None
            },
        }
    }
}

#[async_trait::async_trait]
impl Transport for EventStreamTransport {
    async fn start(&self) -> McpResult<mpsc::Receiver<TransportEvent>> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(McpError::TransportCreationFailed {
                server: self.server_name.clone(),
                reason: "transport already started".to_string(),
                source: None,
            });
        }

        let creation_failed = |reason: String| McpError::TransportCreationFailed {
            server: self.server_name.clone(),
            reason,
            source: None,
        };

        let response = self
            .client
            .get(self.url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| creation_failed(format!("failed to open {}: {e}", self.url)))?
            .error_for_status()
            .map_err(|e| creation_failed(format!("event stream rejected: {e}")))?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let server_name = self.server_name.clone();

        let task = tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut event_data = String::new();

            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        while let Some(newline) = buffer.find('\n') {
                            let line: String = buffer.drain(..=newline).collect();
                            let line = line.trim_end_matches(['\n', '\r']);

                            if let Some(data) = line.strip_prefix("data:") {
                                if !event_data.is_empty() {
                                    event_data.push('\n');
                                }
                                event_data.push_str(data.trim_start());
                            } else if line.is_empty() {
                                let data = std::mem::take(&mut event_data);
                                if let Some(event) = Self::parse_event_data(&data, &server_name)
                                    && tx.send(event).await.is_err()
                                {
                                    return;
                                }
                            } else if line.starts_with('{') {
                                // Plain newline-delimited JSON endpoint.
                                if let Some(event) = Self::parse_event_data(line, &server_name)
                                    && tx.send(event).await.is_err()
                                {
                                    return;
                                }
                            }
                        }
                    },
                    Err(e) => {
                        warn!(server = %server_name, error = %e, "event stream read failed");
                        let _ = tx
                            .send(TransportEvent::Error(McpError::TransportSendFailed {
                                server: server_name.clone(),
                                reason: e.to_string(),
                            }))
                            .await;
                        break;
                    },
                }
            }

            // Flush a final event not terminated by a blank line.
            let data = std::mem::take(&mut event_data);
            if let Some(event) = Self::parse_event_data(&data, &server_name) {
                let _ = tx.send(event).await;
            }
            let _ = tx.send(TransportEvent::Closed).await;
        });

        *self.task.lock().await = Some(task);
        Ok(rx)
    }

    async fn send(&self, message: &Value) -> McpResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::TransportClosed {
                server: self.server_name.clone(),
            });
        }

        let send_failed = |reason: String| McpError::TransportSendFailed {
            server: self.server_name.clone(),
            reason,
        };

        self.client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .json(message)
            .send()
            .await
            .map_err(|e| send_failed(e.to_string()))?
            .error_for_status()
            .map_err(|e| send_failed(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
        Ok(())
    }

    fn server_name(&self) -> &str {
        &self.server_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_from_env() {
        let mut env = HashMap::new();
        env.insert(AUTH_TOKEN_VAR.to_string(), "tok-123".to_string());
        env.insert("HEADER_X-Org".to_string(), "tether".to_string());
        env.insert("UNRELATED".to_string(), "ignored".to_string());

        let headers = EventStreamTransport::headers_from_env("s1", &env).unwrap();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer tok-123");
        assert_eq!(headers.get("x-org").unwrap(), "tether");
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn test_invalid_url_rejected() {
        let config = ServerConfig::event_stream("http://[malformed");
        let err = EventStreamTransport::new("s1", &config).unwrap_err();
        assert!(matches!(err, McpError::TransportCreationFailed { .. }));
    }

    #[test]
    fn test_parse_event_data() {
        assert!(matches!(
            EventStreamTransport::parse_event_data("{\"id\":1}", "s1"),
            Some(TransportEvent::Message(_))
        ));
        assert!(EventStreamTransport::parse_event_data("  ", "s1").is_none());
        assert!(EventStreamTransport::parse_event_data("not json", "s1").is_none());
    }
}
