//! Periodic liveness probes with pluggable strategies.
//!
//! The monitor owns no transport; it calls back into the owning supervisor
//! through [`HealthTarget`]. Strategies are tagged variants, with the
//! custom case carried as a capability injected at construction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{HealthCheckConfig, HealthStrategy};
use crate::error::{McpError, McpResult};

/// Maximum retained check-history entries, newest first.
pub const CHECK_HISTORY_CAP: usize = 10;

/// Injected capability for the `custom` strategy.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Probe once; `Ok` means healthy.
    async fn check(&self) -> McpResult<()>;
}

/// What the monitor can ask of its owning supervisor.
#[async_trait]
pub trait HealthTarget: Send + Sync {
    /// List tools on the server.
    async fn list_tools(&self) -> McpResult<Vec<crate::types::Tool>>;

    /// Invoke a tool on the server.
    async fn invoke_tool(&self, method: &str, args: Value) -> McpResult<crate::types::ToolResult>;

    /// Protocol-level ping.
    async fn ping(&self) -> McpResult<()>;

    /// Whether the server is disabled by configuration.
    fn is_disabled(&self) -> bool;
}

/// One recorded probe outcome.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckRecord {
    /// When the probe ran.
    pub timestamp: DateTime<Utc>,
    /// Whether the probe succeeded.
    pub success: bool,
    /// Probe duration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    /// Failure description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Health metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct HealthState {
    /// Whether the server is currently considered healthy.
    pub is_healthy: bool,
    /// When the last probe ran.
    pub last_check_time: Option<DateTime<Utc>>,
    /// Duration of the last probe.
    pub response_time_ms: Option<u64>,
    /// Total probes run.
    pub check_count: u64,
    /// Total failed probes.
    pub failure_count: u64,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Latest failure description.
    pub last_error: Option<String>,
    /// Recent probe outcomes, newest first, capped at
    /// [`CHECK_HISTORY_CAP`].
    pub check_history: Vec<HealthCheckRecord>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            is_healthy: true,
            last_check_time: None,
            response_time_ms: None,
            check_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            last_error: None,
            check_history: Vec::new(),
        }
    }
}

struct MonitorInner {
    state: HealthState,
    history: VecDeque<HealthCheckRecord>,
}

/// Periodic health monitor for one supervised server.
pub struct HealthMonitor {
    server_name: String,
    config: HealthCheckConfig,
    target: Arc<dyn HealthTarget>,
    custom_check: Option<Arc<dyn HealthCheck>>,
    inner: Arc<Mutex<MonitorInner>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    /// Create a monitor; nothing is scheduled until
    /// [`HealthMonitor::start_monitoring`].
    #[must_use]
    pub fn new(
        server_name: impl Into<String>,
        config: HealthCheckConfig,
        target: Arc<dyn HealthTarget>,
        custom_check: Option<Arc<dyn HealthCheck>>,
    ) -> Self {
        Self {
            server_name: server_name.into(),
            config,
            target,
            custom_check,
            inner: Arc::new(Mutex::new(MonitorInner {
                state: HealthState::default(),
                history: VecDeque::with_capacity(CHECK_HISTORY_CAP),
            })),
            task: Mutex::new(None),
        }
    }

    /// Schedule [`HealthMonitor::perform_check`] every `intervalMs`.
    /// Replaces any previous schedule.
    pub fn start_monitoring(self: &Arc<Self>) {
        self.stop_monitoring();

        let monitor = Arc::clone(self);
        let interval = Duration::from_millis(monitor.config.interval_ms);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so the initial
            // probe happens one interval after connect.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let _ = monitor.perform_check().await;
            }
        });

        let mut guard = self
            .task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = Some(task);
    }

    /// Cancel the schedule. Idempotent.
    pub fn stop_monitoring(&self) {
        let task = {
            let mut guard = self
                .task
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.take()
        };
        if let Some(task) = task {
            task.abort();
        }
    }

    /// Run one probe under the configured deadline and fold the outcome
    /// into the metrics.
    pub async fn perform_check(&self) -> HealthState {
        if self.target.is_disabled() {
            // Disabled servers always report unhealthy, regardless of the
            // retry budget.
            return self.record(Err("server is disabled".to_string()), None, true);
        }

        let started = Instant::now();
        let deadline = Duration::from_millis(self.config.timeout_ms);
        let outcome = match tokio::time::timeout(deadline, self.run_strategy()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(McpError::OperationTimeout {
                operation: "health check".to_string(),
                timeout_ms: self.config.timeout_ms,
            }
            .to_string()),
        };
        let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        self.record(outcome, Some(elapsed), false)
    }

    async fn run_strategy(&self) -> McpResult<()> {
        match self.config.strategy {
            HealthStrategy::ToolListing => self.target.list_tools().await.map(|_| ()),
            HealthStrategy::Ping => match self.target.ping().await {
                Ok(()) => Ok(()),
                Err(e) if e.is_method_not_found() => {
                    debug!(
                        server = %self.server_name,
                        "ping not supported, falling back to tool listing"
                    );
                    self.target.list_tools().await.map(|_| ())
                },
                Err(e) => Err(e),
            },
            HealthStrategy::SpecificTool => {
                let check = self.config.specific_tool.as_ref().ok_or_else(|| {
                    McpError::InvalidConfiguration {
                        reason: "specific-tool strategy without a tool".to_string(),
                    }
                })?;
                self.target
                    .invoke_tool(&check.name, check.args.clone())
                    .await
                    .map(|_| ())
            },
            HealthStrategy::Custom => match &self.custom_check {
                Some(check) => check.check().await,
                None => Err(McpError::InvalidConfiguration {
                    reason: "custom strategy without an injected check".to_string(),
                }),
            },
        }
    }

    fn record(
        &self,
        outcome: Result<(), String>,
        response_time_ms: Option<u64>,
        force_unhealthy: bool,
    ) -> HealthState {
        let now = Utc::now();
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        inner.state.last_check_time = Some(now);
        inner.state.response_time_ms = response_time_ms;
        inner.state.check_count = inner.state.check_count.saturating_add(1);

        let record = match outcome {
            Ok(()) => {
                inner.state.consecutive_failures = 0;
                inner.state.is_healthy = true;
                HealthCheckRecord {
                    timestamp: now,
                    success: true,
                    response_time_ms,
                    error: None,
                }
            },
            Err(error) => {
                inner.state.failure_count = inner.state.failure_count.saturating_add(1);
                inner.state.consecutive_failures =
                    inner.state.consecutive_failures.saturating_add(1);
                if force_unhealthy || inner.state.consecutive_failures > self.config.retries {
                    inner.state.is_healthy = false;
                }
                inner.state.last_error = Some(error.clone());
                warn!(
                    server = %self.server_name,
                    consecutive = inner.state.consecutive_failures,
                    error = %error,
                    "health check failed"
                );
                HealthCheckRecord {
                    timestamp: now,
                    success: false,
                    response_time_ms,
                    error: Some(error),
                }
            },
        };

        if inner.history.len() >= CHECK_HISTORY_CAP {
            inner.history.pop_back();
        }
        inner.history.push_front(record);
        inner.state.check_history = inner.history.iter().cloned().collect();

        inner.state.clone()
    }

    /// Current metrics snapshot.
    #[must_use]
    pub fn snapshot(&self) -> HealthState {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.state.clone()
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}
