//! Remote tool servers.
//!
//! Transport plumbing (stdio, SSE, HTTP) lives behind the
//! `ToolServerConnection` interface; this module handles lifecycle and
//! registration: connect, discover tools, register them with the unified
//! manager, reconnect on failures.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::UnifiedToolManager;
use crate::Result;

/// One tool advertised by a server.
#[derive(Debug, Clone)]
pub struct RemoteToolSpec {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

/// Connection to a single tool server.
#[async_trait]
pub trait ToolServerConnection: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    async fn list_tools(&self) -> Result<Vec<RemoteToolSpec>>;

    async fn call_tool(&self, name: &str, args: Value) -> Result<Value>;
}

/// Manages tool server connections and their registrations.
pub struct ToolServerManager {
    connections: Arc<RwLock<HashMap<String, Arc<dyn ToolServerConnection>>>>,
    manager: Arc<UnifiedToolManager>,
}

impl ToolServerManager {
    pub fn new(manager: Arc<UnifiedToolManager>) -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            manager,
        }
    }

    /// Connect to a server, discover its tools, and register them.
    pub async fn add_server(&self, connection: Arc<dyn ToolServerConnection>) -> Result<usize> {
        let server_name = connection.name().to_string();
        info!(target: "tool_servers", server = %server_name, "Adding tool server");

        {
            let connections = self.connections.read().await;
            if connections.contains_key(&server_name) {
                warn!(target: "tool_servers", server = %server_name, "Server already connected");
                return Ok(0);
            }
        }

        connection.connect().await?;

        let count = match self.register_tools(&connection).await {
            Ok(count) => count,
            Err(e) => {
                error!(target: "tool_servers", server = %server_name, error = %e, "Failed to register tools");
                let _ = connection.disconnect().await;
                return Err(e);
            }
        };

        self.manager.track_server(Arc::clone(&connection));
        self.connections
            .write()
            .await
            .insert(server_name.clone(), connection);

        info!(target: "tool_servers", server = %server_name, tool_count = count, "Tool server added");
        Ok(count)
    }

    pub async fn remove_server(&self, server_name: &str) -> Result<()> {
        let connection = self.connections.write().await.remove(server_name);
        if let Some(connection) = connection {
            self.manager.untrack_server(server_name);
            connection.disconnect().await?;
            info!(target: "tool_servers", server = %server_name, "Tool server removed");
        } else {
            warn!(target: "tool_servers", server = %server_name, "Server not found");
        }
        Ok(())
    }

    /// Reconnect and re-register (error recovery).
    pub async fn reconnect_server(&self, server_name: &str) -> Result<()> {
        let connection = {
            let connections = self.connections.read().await;
            connections.get(server_name).cloned().ok_or_else(|| {
                crate::MatrixError::ToolExecution(format!("server not found: {server_name}"))
            })?
        };

        info!(target: "tool_servers", server = %server_name, "Reconnecting tool server");
        let _ = connection.disconnect().await;
        connection.connect().await?;
        self.register_tools(&connection).await?;
        Ok(())
    }

    pub async fn list_servers(&self) -> Vec<String> {
        self.connections.read().await.keys().cloned().collect()
    }

    pub async fn shutdown(&self) {
        let mut connections = self.connections.write().await;
        for (name, connection) in connections.drain() {
            self.manager.untrack_server(&name);
            if let Err(e) = connection.disconnect().await {
                warn!(target: "tool_servers", server = %name, error = %e, "Disconnect failed");
            }
        }
    }

    async fn register_tools(&self, connection: &Arc<dyn ToolServerConnection>) -> Result<usize> {
        let tools = connection.list_tools().await?;
        debug!(target: "tool_servers", server = %connection.name(), count = tools.len(), "Discovered tools");

        let mut registered = 0;
        for spec in tools {
            self.manager.register_remote(Arc::clone(connection), spec);
            registered += 1;
        }
        Ok(registered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;
    use crate::tools::{ConflictResolution, ServerMode};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// In-process server double.
    pub(crate) struct StaticServer {
        name: String,
        tools: Vec<RemoteToolSpec>,
        connected: AtomicBool,
    }

    impl StaticServer {
        pub(crate) fn new(name: &str, tools: Vec<RemoteToolSpec>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                tools,
                connected: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl ToolServerConnection for StaticServer {
        fn name(&self) -> &str {
            &self.name
        }

        async fn connect(&self) -> Result<()> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn list_tools(&self) -> Result<Vec<RemoteToolSpec>> {
            Ok(self.tools.clone())
        }

        async fn call_tool(&self, name: &str, args: Value) -> Result<Value> {
            Ok(json!({"server": self.name, "tool": name, "args": args}))
        }
    }

    fn spec(name: &str) -> RemoteToolSpec {
        RemoteToolSpec {
            name: name.to_string(),
            description: Some(format!("{name} tool")),
            input_schema: json!({"type": "object"}),
        }
    }

    fn tool_manager() -> Arc<UnifiedToolManager> {
        Arc::new(UnifiedToolManager::new(
            Arc::new(EventBus::new()),
            Duration::from_secs(5),
            ConflictResolution::FirstWins,
            ServerMode::Default,
        ))
    }

    #[tokio::test]
    async fn add_server_registers_tools() {
        let manager = tool_manager();
        let servers = ToolServerManager::new(Arc::clone(&manager));
        let count = servers
            .add_server(StaticServer::new("files", vec![spec("read"), spec("write")]))
            .await
            .unwrap();

        assert_eq!(count, 2);
        assert!(manager.has_tool("read"));
        assert!(manager.has_tool("files:read"));

        let out = manager
            .execute_tool("read", json!({"path": "/tmp/x"}), None)
            .await
            .unwrap();
        assert_eq!(out["server"], "files");
    }

    #[tokio::test]
    async fn remove_server_unregisters() {
        let manager = tool_manager();
        let servers = ToolServerManager::new(Arc::clone(&manager));
        servers
            .add_server(StaticServer::new("files", vec![spec("read")]))
            .await
            .unwrap();
        servers.remove_server("files").await.unwrap();
        assert!(!manager.has_tool("read"));
    }

    #[tokio::test]
    async fn duplicate_names_keep_first_server() {
        let manager = tool_manager();
        let servers = ToolServerManager::new(Arc::clone(&manager));
        servers
            .add_server(StaticServer::new("alpha", vec![spec("search")]))
            .await
            .unwrap();
        servers
            .add_server(StaticServer::new("beta", vec![spec("search")]))
            .await
            .unwrap();

        let out = manager.execute_tool("search", json!({}), None).await.unwrap();
        assert_eq!(out["server"], "alpha");
        // The qualified alias still reaches the second server.
        let out = manager
            .execute_tool("beta:search", json!({}), None)
            .await
            .unwrap();
        assert_eq!(out["server"], "beta");
    }
}
