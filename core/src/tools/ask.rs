//! Umbrella `ask_matrix` tool.
//!
//! Exposed when `USE_ASK_MATRIX` is set: a single entry point that routes
//! `{tool, args}` to any registered tool, so constrained clients can reach
//! the whole surface through one schema.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{InternalTool, ToolContext, ToolDescriptor, ToolSource, UnifiedToolManager};
use crate::{MatrixError, Result};

pub struct AskMatrixTool {
    manager: Arc<UnifiedToolManager>,
}

impl AskMatrixTool {
    pub fn new(manager: Arc<UnifiedToolManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl InternalTool for AskMatrixTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "ask_matrix".to_string(),
            description: "Route a request to any registered Matrix tool".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "tool": {"type": "string", "description": "Target tool name"},
                    "args": {"type": "object", "description": "Arguments for the target tool"}
                },
                "required": ["tool"]
            }),
            source: ToolSource::Internal,
            agent_accessible: true,
        }
    }

    async fn invoke(&self, args: Value, _ctx: ToolContext) -> Result<Value> {
        let tool = args
            .get("tool")
            .and_then(|v| v.as_str())
            .ok_or_else(|| MatrixError::ToolExecution("ask_matrix requires a tool name".to_string()))?
            .to_string();
        if tool == "ask_matrix" {
            return Err(MatrixError::ToolExecution(
                "ask_matrix cannot call itself".to_string(),
            ));
        }
        let inner_args = args.get("args").cloned().unwrap_or_else(|| json!({}));
        self.manager
            .execute_tool_without_loading(&tool, inner_args)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;
    use crate::tools::{ConflictResolution, ServerMode};
    use std::time::Duration;

    struct PingTool;

    #[async_trait]
    impl InternalTool for PingTool {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor {
                name: "ping".to_string(),
                description: "pong".to_string(),
                input_schema: json!({"type": "object"}),
                source: ToolSource::Internal,
                agent_accessible: true,
            }
        }

        async fn invoke(&self, _args: Value, _ctx: ToolContext) -> Result<Value> {
            Ok(json!("pong"))
        }
    }

    #[tokio::test]
    async fn routes_to_target_tool() {
        let manager = Arc::new(UnifiedToolManager::new(
            Arc::new(EventBus::new()),
            Duration::from_secs(1),
            ConflictResolution::FirstWins,
            ServerMode::Default,
        ));
        manager.register_internal(Arc::new(PingTool));
        let ask = AskMatrixTool::new(Arc::clone(&manager));

        let out = ask
            .invoke(json!({"tool": "ping", "args": {}}), ToolContext::default())
            .await
            .unwrap();
        assert_eq!(out, json!("pong"));
    }

    #[tokio::test]
    async fn refuses_recursion() {
        let manager = Arc::new(UnifiedToolManager::new(
            Arc::new(EventBus::new()),
            Duration::from_secs(1),
            ConflictResolution::FirstWins,
            ServerMode::Default,
        ));
        let ask = AskMatrixTool::new(manager);
        assert!(ask
            .invoke(json!({"tool": "ask_matrix"}), ToolContext::default())
            .await
            .is_err());
    }
}
