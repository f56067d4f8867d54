//! Child-process stdio transport.

use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::error::{McpError, McpResult};
use crate::logbuf::{LogBuffer, LogLevel};
use crate::protocol::{StreamDecoder, StreamLine, StreamSource, encode_frame};

use super::{EVENT_CHANNEL_CAPACITY, Transport, TransportEvent};

/// Spawns the configured command and frames newline-delimited JSON over its
/// stdin/stdout. Stderr is drained into the owning supervisor's log buffer
/// with substring level classification; container-runtime multiplexed
/// stdout is demultiplexed before JSON parsing.
pub struct StdioTransport {
    server_name: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    logs: Arc<LogBuffer>,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    started: AtomicBool,
    closed: AtomicBool,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl StdioTransport {
    /// Create a transport from a validated config; nothing is spawned until
    /// `start`.
    #[must_use]
    pub fn new(server_name: impl Into<String>, config: &ServerConfig, logs: Arc<LogBuffer>) -> Self {
        Self {
            server_name: server_name.into(),
            command: config.command.clone(),
            args: config.args.clone(),
            env: config.effective_env(),
            logs,
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn creation_failed(&self, reason: String, source: Option<std::io::Error>) -> McpError {
        McpError::TransportCreationFailed {
            server: self.server_name.clone(),
            reason,
            source,
        }
    }

    fn handle_line(
        line: StreamLine,
        server_name: &str,
        logs: &LogBuffer,
    ) -> Option<TransportEvent> {
        match line.source {
            StreamSource::Stdout => {
                let text = line.text.trim();
                if text.is_empty() {
                    return None;
                }
                match serde_json::from_str::<Value>(text) {
                    Ok(message) => Some(TransportEvent::Message(message)),
                    Err(e) => {
                        debug!(server = server_name, error = %e, "Non-JSON stdout line");
                        logs.append(LogLevel::Info, text, None);
                        None
                    },
                }
            },
            StreamSource::Stderr => {
                logs.append(LogLevel::classify(&line.text), line.text, None);
                None
            },
            StreamSource::Other(id) => {
                logs.append(
                    LogLevel::Debug,
                    line.text,
                    Some(serde_json::json!({"stream": id})),
                );
                None
            },
        }
    }
}

#[async_trait::async_trait]
impl Transport for StdioTransport {
    async fn start(&self) -> McpResult<mpsc::Receiver<TransportEvent>> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(self.creation_failed("transport already started".to_string(), None));
        }

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .env_clear()
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.creation_failed(format!("failed to spawn {}: {e}", self.command), Some(e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.creation_failed("child has no stdout".to_string(), None))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| self.creation_failed("child has no stderr".to_string(), None))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.creation_failed("child has no stdin".to_string(), None))?;

        *self.child.lock().await = Some(child);
        *self.stdin.lock().await = Some(stdin);

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let server_name = self.server_name.clone();
        let logs = Arc::clone(&self.logs);
        let stdout_task = tokio::spawn(async move {
            let mut stdout = stdout;
            let mut decoder = StreamDecoder::new();
            let mut buf = [0u8; 8192];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => {
                        for line in decoder.finish() {
                            if let Some(event) = Self::handle_line(line, &server_name, &logs)
                                && tx.send(event).await.is_err()
                            {
                                return;
                            }
                        }
                        let _ = tx.send(TransportEvent::Closed).await;
                        return;
                    },
                    Ok(n) => {
                        for line in decoder.push(&buf[..n]) {
                            if let Some(event) = Self::handle_line(line, &server_name, &logs)
                                && tx.send(event).await.is_err()
                            {
                                return;
                            }
                        }
                    },
                    Err(e) => {
                        warn!(server = %server_name, error = %e, "stdout read failed");
                        let _ = tx
                            .send(TransportEvent::Error(McpError::Io(e)))
                            .await;
                        let _ = tx.send(TransportEvent::Closed).await;
                        return;
                    },
                }
            }
        });

        let server_name = self.server_name.clone();
        let logs = Arc::clone(&self.logs);
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let level = LogLevel::classify(&line);
                match level {
                    LogLevel::Error => warn!(server = %server_name, "{line}"),
                    _ => debug!(server = %server_name, "{line}"),
                }
                logs.append(level, line, None);
            }
        });

        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        tasks.push(stdout_task);
        tasks.push(stderr_task);

        Ok(rx)
    }

    async fn send(&self, message: &Value) -> McpResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::TransportClosed {
                server: self.server_name.clone(),
            });
        }

        let frame = encode_frame(message)?;
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or_else(|| McpError::TransportClosed {
            server: self.server_name.clone(),
        })?;

        let write = async {
            stdin.write_all(frame.as_bytes()).await?;
            stdin.flush().await
        };
        write.await.map_err(|e| McpError::TransportSendFailed {
            server: self.server_name.clone(),
            reason: e.to_string(),
        })
    }

    async fn close(&self) -> McpResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Dropping stdin signals EOF before the kill below.
        self.stdin.lock().await.take();

        if let Some(mut child) = self.child.lock().await.take()
            && let Err(e) = child.kill().await
        {
            debug!(server = %self.server_name, error = %e, "child kill failed");
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

        Ok(())
    }

    fn server_name(&self) -> &str {
        &self.server_name
    }
}
