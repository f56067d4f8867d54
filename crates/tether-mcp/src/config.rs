//! Server configuration: validation, defaults, and deep-merge updates.
//!
//! Config records arrive untyped (JSON from a host application or a TOML
//! file) and are validated into [`ServerConfig`]. The `command` field picks
//! the transport: an `http://`/`https://` prefix selects the event-stream
//! transport, anything else is spawned as a child process over stdio.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use crate::error::{McpError, McpResult};

/// Host environment variables forwarded to every spawned server.
///
/// The caller's `env` values win on conflict.
pub const CRITICAL_ENV_VARS: &[&str] = &[
    "PATH",
    "DOCKER_HOST",
    "DOCKER_CONFIG",
    "DOCKER_CERT_PATH",
    "HOME",
    "USER",
    "TERM",
    "SHELL",
];

/// Default health-check interval in milliseconds.
pub const DEFAULT_HEALTH_INTERVAL_MS: u64 = 30_000;

/// Default health-check timeout in milliseconds.
pub const DEFAULT_HEALTH_TIMEOUT_MS: u64 = 5_000;

/// Default number of tolerated consecutive failures before unhealthy.
pub const DEFAULT_HEALTH_RETRIES: u32 = 1;

/// Which byte-stream carrier a config selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Child process over stdio.
    Stdio,
    /// HTTP event stream.
    EventStream,
}

/// Liveness probe strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealthStrategy {
    /// `tools/list` succeeds.
    #[default]
    ToolListing,
    /// Protocol ping; falls back to tool listing when unsupported.
    Ping,
    /// A named tool invocation returns a non-error result.
    SpecificTool,
    /// Capability injected at supervisor construction.
    Custom,
}

/// Tool invocation used by the `specific-tool` strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SpecificToolCheck {
    /// Tool name.
    pub name: String,
    /// Arguments passed on each probe.
    #[serde(default = "empty_object")]
    pub args: Value,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Health-check configuration embedded in a [`ServerConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HealthCheckConfig {
    /// Probe strategy.
    #[serde(default)]
    pub strategy: HealthStrategy,
    /// Interval between probes.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Deadline for a single probe.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Consecutive failures tolerated before the server is unhealthy;
    /// unhealthy only after `retries + 1` consecutive failures.
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Required iff `strategy` is `specific-tool`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specific_tool: Option<SpecificToolCheck>,
}

fn default_interval_ms() -> u64 {
    DEFAULT_HEALTH_INTERVAL_MS
}

fn default_timeout_ms() -> u64 {
    DEFAULT_HEALTH_TIMEOUT_MS
}

fn default_retries() -> u32 {
    DEFAULT_HEALTH_RETRIES
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            strategy: HealthStrategy::default(),
            interval_ms: DEFAULT_HEALTH_INTERVAL_MS,
            timeout_ms: DEFAULT_HEALTH_TIMEOUT_MS,
            retries: DEFAULT_HEALTH_RETRIES,
            specific_tool: None,
        }
    }
}

impl HealthCheckConfig {
    /// Validate interval/timeout positivity and strategy coherence.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::InvalidConfiguration`] when a numeric field is
    /// zero or `specific-tool` is selected without a tool.
    pub fn validate(&self) -> McpResult<()> {
        if self.interval_ms == 0 {
            return Err(McpError::InvalidConfiguration {
                reason: "healthCheck.intervalMs must be a positive integer".to_string(),
            });
        }
        if self.timeout_ms == 0 {
            return Err(McpError::InvalidConfiguration {
                reason: "healthCheck.timeoutMs must be a positive integer".to_string(),
            });
        }
        match (&self.strategy, &self.specific_tool) {
            (HealthStrategy::SpecificTool, None) => Err(McpError::InvalidConfiguration {
                reason: "healthCheck.specificTool is required for the specific-tool strategy"
                    .to_string(),
            }),
            (HealthStrategy::SpecificTool, Some(tool)) if tool.name.is_empty() => {
                Err(McpError::InvalidConfiguration {
                    reason: "healthCheck.specificTool.name must not be empty".to_string(),
                })
            },
            _ => Ok(()),
        }
    }
}

/// Configuration for one supervised server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServerConfig {
    /// Command to run, or an `http://`/`https://` URL for the
    /// event-stream transport.
    pub command: String,
    /// Arguments for the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables, merged over [`CRITICAL_ENV_VARS`].
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Method names exempt from external approval gates.
    #[serde(default)]
    pub auto_approve: BTreeSet<String>,
    /// A disabled server never opens a transport.
    #[serde(default)]
    pub disabled: bool,
    /// Liveness probe configuration.
    #[serde(default)]
    pub health_check: HealthCheckConfig,
}

impl ServerConfig {
    /// Create a stdio server config.
    #[must_use]
    pub fn stdio(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            auto_approve: BTreeSet::new(),
            disabled: false,
            health_check: HealthCheckConfig::default(),
        }
    }

    /// Create an event-stream server config from a URL.
    #[must_use]
    pub fn event_stream(url: impl Into<String>) -> Self {
        Self::stdio(url)
    }

    /// Add arguments.
    #[must_use]
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Add an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Exempt a method from approval gates.
    #[must_use]
    pub fn auto_approve(mut self, method: impl Into<String>) -> Self {
        self.auto_approve.insert(method.into());
        self
    }

    /// Mark the server disabled.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    /// Set the health-check configuration.
    #[must_use]
    pub fn with_health_check(mut self, health_check: HealthCheckConfig) -> Self {
        self.health_check = health_check;
        self
    }

    /// Which transport this config selects.
    #[must_use]
    pub fn transport_kind(&self) -> TransportKind {
        if self.command.starts_with("http://") || self.command.starts_with("https://") {
            TransportKind::EventStream
        } else {
            TransportKind::Stdio
        }
    }

    /// Parse and validate an untyped config record.
    ///
    /// Unknown keys are rejected.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::InvalidConfiguration`] when the record does not
    /// deserialize or fails validation.
    pub fn from_value(value: Value) -> McpResult<Self> {
        let config: Self =
            serde_json::from_value(value).map_err(|e| McpError::InvalidConfiguration {
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the record.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::InvalidConfiguration`] when `command` is empty or
    /// the embedded health-check config is invalid.
    pub fn validate(&self) -> McpResult<()> {
        if self.command.trim().is_empty() {
            return Err(McpError::InvalidConfiguration {
                reason: "command must not be empty".to_string(),
            });
        }
        self.health_check.validate()
    }

    /// Compute the effective child environment: the caller's `env` merged
    /// over the critical-variable allow-list from the host environment.
    #[must_use]
    pub fn effective_env(&self) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = CRITICAL_ENV_VARS
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|v| ((*key).to_string(), v)))
            .collect();
        for (key, value) in &self.env {
            env.insert(key.clone(), value.clone());
        }
        env
    }

    /// Apply a deep-merge patch and validate the result.
    ///
    /// Objects merge recursively, arrays are replaced wholesale, scalars
    /// overwrite, and absent keys preserve the existing value. Transport
    /// fields (`command`, `args`, `env`) only take effect after a restart.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::InvalidConfiguration`] when the merged record is
    /// invalid.
    pub fn merged(&self, patch: &Value) -> McpResult<Self> {
        let existing = serde_json::to_value(self)?;
        Self::from_value(merge_update(&existing, patch))
    }
}

/// Deep-merge `patch` into `existing`.
///
/// Objects merge recursively; arrays and scalars in the patch replace the
/// existing value; keys absent from the patch are preserved.
#[must_use]
pub fn merge_update(existing: &Value, patch: &Value) -> Value {
    match (existing, patch) {
        (Value::Object(base), Value::Object(overlay)) => {
            let mut merged = base.clone();
            for (key, patch_value) in overlay {
                let entry = match merged.get(key) {
                    Some(existing_value) => merge_update(existing_value, patch_value),
                    None => patch_value.clone(),
                };
                merged.insert(key.clone(), entry);
            }
            Value::Object(merged)
        },
        _ => patch.clone(),
    }
}

/// Named server configurations, loadable from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServersConfig {
    /// Server configurations keyed by id.
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
}

impl ServersConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> McpResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&content).map_err(|e| McpError::InvalidConfiguration {
            reason: format!("invalid servers config: {e}"),
        })?;
        for (name, server) in &config.servers {
            server.validate().map_err(|e| McpError::InvalidConfiguration {
                reason: format!("server {name}: {e}"),
            })?;
        }
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be serialized or written.
    pub fn save(&self, path: impl AsRef<Path>) -> McpResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| McpError::Unknown {
            reason: format!("failed to serialize servers config: {e}"),
        })?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get a server config by id.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.get(name)
    }

    /// Add a server config under an id.
    pub fn add(&mut self, name: impl Into<String>, config: ServerConfig) {
        self.servers.insert(name.into(), config);
    }

    /// All server ids.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.servers.keys().map(String::as_str).collect()
    }
}
