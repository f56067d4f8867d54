//! Registry of supervisors with fan-out discovery and invocation.

use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::{ServerConfig, ServersConfig};
use crate::error::{McpError, McpResult};
use crate::health::HealthState;
use crate::supervisor::ServerSupervisor;
use crate::transport::TransportFactory;
use crate::types::{ServerStateSnapshot, ToolResult, ToolWithServer};

/// Owns all supervisors, keyed by server id. Id uniqueness is enforced at
/// insert time; fan-out operations degrade per-server failures instead of
/// failing the aggregate.
pub struct ServerManager {
    servers: RwLock<HashMap<String, Arc<ServerSupervisor>>>,
    factory: Option<Arc<dyn TransportFactory>>,
}

impl ServerManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            factory: None,
        }
    }

    /// Create a manager whose supervisors use the given transport factory.
    #[must_use]
    pub fn with_transport_factory(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            factory: Some(factory),
        }
    }

    /// Validate the config, register a supervisor under `id`, and start
    /// it. On start failure the supervisor is not retained.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::ServerAlreadyExists`] when the id is taken,
    /// [`McpError::InvalidConfiguration`] for a bad config, and the
    /// supervisor's start error otherwise.
    pub async fn start_server(&self, id: &str, config: ServerConfig) -> McpResult<()> {
        let mut supervisor = ServerSupervisor::new(id, config)?;
        if let Some(factory) = &self.factory {
            supervisor = supervisor.with_transport_factory(Arc::clone(factory));
        }
        let supervisor = Arc::new(supervisor);

        // Reserve the id before the (slow) start so concurrent starts of
        // the same id serialize on the uniqueness check.
        {
            let mut servers = self.servers.write().await;
            if servers.contains_key(id) {
                return Err(McpError::ServerAlreadyExists {
                    server: id.to_string(),
                });
            }
            servers.insert(id.to_string(), Arc::clone(&supervisor));
        }

        match supervisor.start().await {
            Ok(()) => {
                info!(server = id, "server registered and started");
                Ok(())
            },
            Err(e) => {
                let mut servers = self.servers.write().await;
                servers.remove(id);
                Err(e)
            },
        }
    }

    /// Start every non-disabled server in a config, logging and skipping
    /// per-server failures. Returns the ids that started.
    pub async fn start_from_config(&self, config: &ServersConfig) -> Vec<String> {
        let mut started = Vec::new();
        for (id, server_config) in &config.servers {
            if server_config.disabled {
                continue;
            }
            match self.start_server(id, server_config.clone()).await {
                Ok(()) => started.push(id.clone()),
                Err(e) => {
                    warn!(server = %id, error = %e, "failed to start configured server");
                },
            }
        }
        started
    }

    /// Stop a server and remove it from the registry.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::ServerNotFound`] when the id is absent.
    pub async fn stop_server(&self, id: &str) -> McpResult<()> {
        let supervisor = {
            let mut servers = self.servers.write().await;
            servers.remove(id).ok_or_else(|| McpError::ServerNotFound {
                server: id.to_string(),
            })?
        };
        supervisor.stop().await
    }

    /// Replace a server's config: stop, then start with the new config.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::ServerNotFound`] when the id is absent, or the
    /// start error for the new config.
    pub async fn update_server(&self, id: &str, config: ServerConfig) -> McpResult<()> {
        self.stop_server(id).await?;
        self.start_server(id, config).await
    }

    /// Restart a server with its retained config.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::ServerNotFound`] when the id is absent, or the
    /// start error.
    pub async fn restart_server(&self, id: &str) -> McpResult<()> {
        let config = self.get(id).await?.get_config();
        self.update_server(id, config).await
    }

    async fn get(&self, id: &str) -> McpResult<Arc<ServerSupervisor>> {
        let servers = self.servers.read().await;
        servers
            .get(id)
            .cloned()
            .ok_or_else(|| McpError::ServerNotFound {
                server: id.to_string(),
            })
    }

    async fn all(&self) -> Vec<(String, Arc<ServerSupervisor>)> {
        let servers = self.servers.read().await;
        servers
            .iter()
            .map(|(id, s)| (id.clone(), Arc::clone(s)))
            .collect()
    }

    /// Registered server ids.
    pub async fn server_ids(&self) -> Vec<String> {
        let servers = self.servers.read().await;
        servers.keys().cloned().collect()
    }

    /// Concurrently list tools on every supervisor, flattened and tagged
    /// with the server id. A failing supervisor contributes zero tools.
    pub async fn list_all_tools(&self) -> Vec<ToolWithServer> {
        let supervisors = self.all().await;
        let results = join_all(supervisors.into_iter().map(|(id, supervisor)| async move {
            match supervisor.list_tools().await {
                Ok(tools) => (id, tools),
                Err(e) => {
                    warn!(server = %id, error = %e, "tool listing failed, contributing zero tools");
                    (id, Vec::new())
                },
            }
        }))
        .await;

        let mut all: Vec<ToolWithServer> = results
            .into_iter()
            .flat_map(|(id, tools)| {
                tools
                    .into_iter()
                    .map(move |tool| ToolWithServer::new(id.clone(), tool))
            })
            .collect();
        all.sort_by(|a, b| {
            (a.server_name.as_str(), a.tool.name.as_str())
                .cmp(&(b.server_name.as_str(), b.tool.name.as_str()))
        });
        all
    }

    /// Route a tool invocation to the named supervisor.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::ServerNotFound`] when the id is absent;
    /// propagates the supervisor's errors otherwise.
    pub async fn invoke_tool(&self, id: &str, method: &str, args: Value) -> McpResult<ToolResult> {
        let supervisor = self.get(id).await?;
        supervisor.invoke_tool(method, args).await
    }

    /// Ask a server for argument completions.
    ///
    /// # Errors
    ///
    /// As [`ServerSupervisor::get_completions`], plus
    /// [`McpError::ServerNotFound`].
    pub async fn get_completions(
        &self,
        id: &str,
        method: &str,
        arg_name: &str,
        value: &str,
    ) -> McpResult<Vec<String>> {
        let supervisor = self.get(id).await?;
        supervisor.get_completions(method, arg_name, value).await
    }

    /// One server's state snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::ServerNotFound`] when the id is absent.
    pub async fn get_server_state(&self, id: &str) -> McpResult<ServerStateSnapshot> {
        let supervisor = self.get(id).await?;
        Ok(supervisor.get_state().await)
    }

    /// State snapshots for every server.
    pub async fn get_all_server_states(&self) -> HashMap<String, ServerStateSnapshot> {
        let supervisors = self.all().await;
        let states = join_all(
            supervisors
                .into_iter()
                .map(|(id, s)| async move { (id, s.get_state().await) }),
        )
        .await;
        states.into_iter().collect()
    }

    /// Probe every server now.
    pub async fn check_server_health(&self) -> HashMap<String, HealthState> {
        let supervisors = self.all().await;
        let states = join_all(
            supervisors
                .into_iter()
                .map(|(id, s)| async move { (id, s.check_health().await) }),
        )
        .await;
        states.into_iter().collect()
    }

    /// Latest health metrics without probing.
    pub async fn get_health_metrics(&self) -> HashMap<String, HealthState> {
        let supervisors = self.all().await;
        let states = join_all(
            supervisors
                .into_iter()
                .map(|(id, s)| async move { (id, s.health_snapshot().await) }),
        )
        .await;
        states.into_iter().collect()
    }

    /// Stop all supervisors in parallel and clear the registry. Per-server
    /// stop errors are logged and swallowed.
    pub async fn cleanup(&self) {
        let supervisors: Vec<(String, Arc<ServerSupervisor>)> = {
            let mut servers = self.servers.write().await;
            servers.drain().collect()
        };

        join_all(supervisors.into_iter().map(|(id, supervisor)| async move {
            if let Err(e) = supervisor.stop().await {
                warn!(server = %id, error = %e, "stop failed during cleanup");
            }
        }))
        .await;
        info!("manager cleanup complete");
    }
}

impl Default for ServerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ServerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_server_is_not_found() {
        let manager = ServerManager::new();
        let err = manager
            .invoke_tool("ghost", "ping", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ServerNotFound { .. }));

        let err = manager.stop_server("ghost").await.unwrap_err();
        assert!(matches!(err, McpError::ServerNotFound { .. }));
    }

    #[tokio::test]
    async fn test_empty_manager_aggregates() {
        let manager = ServerManager::new();
        assert!(manager.list_all_tools().await.is_empty());
        assert!(manager.get_all_server_states().await.is_empty());
        manager.cleanup().await;
    }

    #[tokio::test]
    async fn test_disabled_server_registers_without_transport() {
        let manager = ServerManager::new();
        manager
            .start_server("off", ServerConfig::stdio("whatever").disabled())
            .await
            .unwrap();

        let state = manager.get_server_state("off").await.unwrap();
        assert_eq!(state.status, crate::types::ServerStatus::Disabled);

        // Disabled servers contribute zero tools and reject invocations.
        assert!(manager.list_all_tools().await.is_empty());
        let err = manager
            .invoke_tool("off", "ping", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ServerDisabled { .. }));

        manager.stop_server("off").await.unwrap();
        assert!(manager.server_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let manager = ServerManager::new();
        manager
            .start_server("a", ServerConfig::stdio("x").disabled())
            .await
            .unwrap();
        let err = manager
            .start_server("a", ServerConfig::stdio("y").disabled())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ServerAlreadyExists { .. }));
    }
}
