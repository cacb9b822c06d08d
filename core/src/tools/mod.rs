//! Unified tool registry and execution.
//!
//! Two tool sources feed one registry: internal tools (memory, reasoning,
//! utilities) and remote tools discovered from tool servers. Execution is
//! routed by name with a configurable timeout and collision strategy.

pub mod ask;
pub mod remote;

pub use ask::AskMatrixTool;
pub use remote::{RemoteToolSpec, ToolServerConnection, ToolServerManager};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::event::{Event, EventBus};
use crate::{config, MatrixError, Result};

// OpenTelemetry imports
use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
    KeyValue,
};

pub const DEFAULT_TOOL_TIMEOUT_MS: u64 = 60_000;

/// Where a registered tool lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolSource {
    Internal,
    Remote { server: String },
}

/// Static descriptor for discovery and provider schema shaping.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub source: ToolSource,
    /// Internal-only utilities set this false and stay hidden from
    /// `get_all_tools`.
    pub agent_accessible: bool,
}

/// Per-invocation context handed to tools.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub session_id: Option<String>,
}

/// Trait implemented by in-process tools.
#[async_trait]
pub trait InternalTool: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;

    async fn invoke(&self, args: Value, ctx: ToolContext) -> Result<Value>;
}

/// How a name registered by both sources resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Remote wins the bare name; the internal tool stays reachable under
    /// `internal:<name>`.
    PrefixInternal,
    PreferRemote,
    FirstWins,
    Error,
}

impl ConflictResolution {
    fn from_env() -> Self {
        match std::env::var("AGGREGATOR_CONFLICT_RESOLUTION")
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str()
        {
            "prefix-internal" => Self::PrefixInternal,
            "prefer-mcp" | "prefer-remote" => Self::PreferRemote,
            "error" => Self::Error,
            _ => Self::FirstWins,
        }
    }
}

/// Tool surface exposed when running as a tool server ourselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    Default,
    Aggregator,
}

impl ServerMode {
    fn from_env() -> Self {
        match std::env::var("MCP_SERVER_MODE")
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str()
        {
            "aggregator" => Self::Aggregator,
            _ => Self::Default,
        }
    }
}

struct InternalEntry {
    tool: Arc<dyn InternalTool>,
    seq: u64,
}

struct RemoteEntry {
    server: Arc<dyn ToolServerConnection>,
    spec: RemoteToolSpec,
    seq: u64,
}

enum Resolved {
    Internal(Arc<dyn InternalTool>),
    Remote {
        server: Arc<dyn ToolServerConnection>,
        tool_name: String,
    },
}

/// Unified registry over internal and remote tools.
pub struct UnifiedToolManager {
    internal: DashMap<String, InternalEntry>,
    remote: DashMap<String, RemoteEntry>,
    servers: DashMap<String, Arc<dyn ToolServerConnection>>,
    registration_seq: AtomicU64,
    warmed: AtomicBool,
    execution_timeout: Duration,
    conflict: ConflictResolution,
    server_mode: ServerMode,
    bus: Arc<EventBus>,

    // OpenTelemetry metrics
    tool_calls_counter: Counter<u64>,
    tool_errors_counter: Counter<u64>,
    tool_latency: Histogram<f64>,
}

impl UnifiedToolManager {
    pub fn from_env(bus: Arc<EventBus>) -> Self {
        Self::new(
            bus,
            Duration::from_millis(config::env_u64(
                "AGGREGATOR_TIMEOUT",
                DEFAULT_TOOL_TIMEOUT_MS,
            )),
            ConflictResolution::from_env(),
            ServerMode::from_env(),
        )
    }

    pub fn new(
        bus: Arc<EventBus>,
        execution_timeout: Duration,
        conflict: ConflictResolution,
        server_mode: ServerMode,
    ) -> Self {
        let meter = global::meter("matrix.tool_manager");

        let tool_calls_counter = meter
            .u64_counter("matrix.tools.calls_total")
            .with_description("Total number of tool calls")
            .init();

        let tool_errors_counter = meter
            .u64_counter("matrix.tools.errors_total")
            .with_description("Total number of tool errors")
            .init();

        let tool_latency = meter
            .f64_histogram("matrix.tools.latency_ms")
            .with_description("Tool invocation latency in milliseconds")
            .init();

        Self {
            internal: DashMap::new(),
            remote: DashMap::new(),
            servers: DashMap::new(),
            registration_seq: AtomicU64::new(0),
            warmed: AtomicBool::new(false),
            execution_timeout,
            conflict,
            server_mode,
            bus,
            tool_calls_counter,
            tool_errors_counter,
            tool_latency,
        }
    }

    // ----- registration ----------------------------------------------------

    pub fn register_internal(&self, tool: Arc<dyn InternalTool>) {
        let desc = tool.descriptor();
        info!(target: "tools", tool = %desc.name, "Registering internal tool");
        let seq = self.registration_seq.fetch_add(1, Ordering::SeqCst);
        self.internal.insert(desc.name, InternalEntry { tool, seq });
    }

    /// Register one remote tool. The bare name is routed through the
    /// collision strategy; the qualified `server:name` alias always wins.
    pub fn register_remote(&self, server: Arc<dyn ToolServerConnection>, spec: RemoteToolSpec) {
        let seq = self.registration_seq.fetch_add(1, Ordering::SeqCst);
        let qualified = format!("{}:{}", server.name(), spec.name);
        debug!(target: "tools", tool = %qualified, "Registering remote tool");

        let existing_server = self
            .remote
            .get(&spec.name)
            .map(|e| e.server.name().to_string());
        match existing_server {
            Some(first) if first != server.name() => {
                warn!(
                    target: "tools",
                    tool = %spec.name,
                    first = %first,
                    second = %server.name(),
                    "Two servers expose the same tool name; first registration keeps the bare name"
                );
            }
            Some(_) => {}
            None => {
                self.remote.insert(
                    spec.name.clone(),
                    RemoteEntry {
                        server: Arc::clone(&server),
                        spec: spec.clone(),
                        seq,
                    },
                );
            }
        }
        self.remote
            .insert(qualified, RemoteEntry { server, spec, seq });
    }

    /// Track a server connection for warm-up refreshes.
    pub fn track_server(&self, server: Arc<dyn ToolServerConnection>) {
        self.servers.insert(server.name().to_string(), server);
    }

    pub fn untrack_server(&self, server_name: &str) {
        self.servers.remove(server_name);
        self.remote.retain(|_, entry| entry.server.name() != server_name);
    }

    // ----- discovery -------------------------------------------------------

    /// Agent-accessible tools only. Aggregator mode widens the surface to
    /// the internal-only utilities so they can be re-exported.
    pub fn get_all_tools(&self) -> Vec<ToolDescriptor> {
        let mut tools: Vec<ToolDescriptor> = self
            .internal
            .iter()
            .map(|e| e.value().tool.descriptor())
            .filter(|d| d.agent_accessible || self.server_mode == ServerMode::Aggregator)
            .collect();
        for entry in self.remote.iter() {
            // Skip qualified aliases; the bare name is the public surface.
            if entry.key().contains(':') {
                continue;
            }
            tools.push(ToolDescriptor {
                name: entry.value().spec.name.clone(),
                description: entry.value().spec.description.clone().unwrap_or_default(),
                input_schema: entry.value().spec.input_schema.clone(),
                source: ToolSource::Remote {
                    server: entry.value().server.name().to_string(),
                },
                agent_accessible: true,
            });
        }
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Shape the tool list for a provider schema.
    pub fn get_tools_for_provider(&self, provider: &str) -> Vec<Value> {
        let tools = self.get_all_tools();
        match provider.to_ascii_lowercase().as_str() {
            "anthropic" | "aws" => tools
                .into_iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema,
                    })
                })
                .collect(),
            "openrouter" | "qwen" => tools
                .into_iter()
                .map(|t| {
                    // These gateways reject null/missing parameter schemas.
                    let parameters = if t.input_schema.is_object() {
                        t.input_schema
                    } else {
                        json!({"type": "object", "properties": {}})
                    };
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": parameters,
                        }
                    })
                })
                .collect(),
            _ => tools
                .into_iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.input_schema,
                        }
                    })
                })
                .collect(),
        }
    }

    // ----- execution -------------------------------------------------------

    /// Execute with the populate-all-tools warm-up (refreshes remote
    /// listings once per process).
    pub async fn execute_tool(
        &self,
        name: &str,
        args: Value,
        session_id: Option<&str>,
    ) -> Result<Value> {
        self.warm_up().await;
        self.execute_resolved(name, args, session_id).await
    }

    /// Skip the warm-up; used by background memory jobs so they don't pay
    /// the tool-enumeration cost on every turn.
    pub async fn execute_tool_without_loading(&self, name: &str, args: Value) -> Result<Value> {
        self.execute_resolved(name, args, None).await
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.internal.contains_key(name) || self.remote.contains_key(name)
    }

    async fn warm_up(&self) {
        if self.warmed.swap(true, Ordering::SeqCst) {
            return;
        }
        let servers: Vec<Arc<dyn ToolServerConnection>> = self
            .servers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for server in servers {
            match server.list_tools().await {
                Ok(specs) => {
                    for spec in specs {
                        self.register_remote(Arc::clone(&server), spec);
                    }
                }
                Err(e) => {
                    warn!(target: "tools", server = %server.name(), error = %e, "Tool listing refresh failed")
                }
            }
        }
    }

    fn resolve(&self, name: &str) -> Result<Resolved> {
        if let Some(stripped) = name.strip_prefix("internal:") {
            return self
                .internal
                .get(stripped)
                .map(|e| Resolved::Internal(Arc::clone(&e.value().tool)))
                .ok_or_else(|| MatrixError::ToolNotFound(name.to_string()));
        }

        let internal = self.internal.get(name);
        let remote = self.remote.get(name);

        match (internal, remote) {
            (Some(i), Some(r)) => match self.conflict {
                ConflictResolution::PrefixInternal | ConflictResolution::PreferRemote => {
                    Ok(Resolved::Remote {
                        server: Arc::clone(&r.value().server),
                        tool_name: r.value().spec.name.clone(),
                    })
                }
                ConflictResolution::FirstWins => {
                    if i.value().seq <= r.value().seq {
                        Ok(Resolved::Internal(Arc::clone(&i.value().tool)))
                    } else {
                        Ok(Resolved::Remote {
                            server: Arc::clone(&r.value().server),
                            tool_name: r.value().spec.name.clone(),
                        })
                    }
                }
                ConflictResolution::Error => Err(MatrixError::ToolExecution(format!(
                    "tool name collision for {name}"
                ))),
            },
            (Some(i), None) => Ok(Resolved::Internal(Arc::clone(&i.value().tool))),
            (None, Some(r)) => Ok(Resolved::Remote {
                server: Arc::clone(&r.value().server),
                tool_name: r.value().spec.name.clone(),
            }),
            (None, None) => Err(MatrixError::ToolNotFound(name.to_string())),
        }
    }

    async fn execute_resolved(
        &self,
        name: &str,
        args: Value,
        session_id: Option<&str>,
    ) -> Result<Value> {
        let resolved = self.resolve(name)?;
        let started = Instant::now();

        self.tool_calls_counter
            .add(1, &[KeyValue::new("tool_name", name.to_string())]);

        let fut = async {
            match resolved {
                Resolved::Internal(tool) => {
                    tool.invoke(
                        args,
                        ToolContext {
                            session_id: session_id.map(|s| s.to_string()),
                        },
                    )
                    .await
                }
                Resolved::Remote { server, tool_name } => {
                    server.call_tool(&tool_name, args).await
                }
            }
        };

        let outcome = match timeout(self.execution_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(MatrixError::ToolTimeout(format!(
                "{name} exceeded {} ms",
                self.execution_timeout.as_millis()
            ))),
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.tool_latency
            .record(elapsed_ms, &[KeyValue::new("tool_name", name.to_string())]);

        match &outcome {
            Ok(_) => {
                let mut event = Event::new(
                    "tool:executed",
                    json!({"name": name, "duration_ms": elapsed_ms}),
                );
                if let Some(session) = session_id {
                    event = event.for_session(session);
                }
                self.bus.publish(event);
            }
            Err(e) => {
                self.tool_errors_counter.add(
                    1,
                    &[
                        KeyValue::new("tool_name", name.to_string()),
                        KeyValue::new(
                            "kind",
                            if matches!(e, MatrixError::ToolTimeout(_)) {
                                "timeout"
                            } else {
                                "error"
                            },
                        ),
                    ],
                );
                let mut event = Event::new(
                    "tool:failed",
                    json!({"name": name, "error": e.to_string(), "duration_ms": elapsed_ms}),
                );
                if let Some(session) = session_id {
                    event = event.for_session(session);
                }
                self.bus.publish(event);
            }
        }

        outcome
    }
}
