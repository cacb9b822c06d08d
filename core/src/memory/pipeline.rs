//! Background knowledge-memory pipeline.
//!
//! Collects comprehensive interaction data from the finished turn and
//! drives the memory tools through the unified tool manager. Every failure
//! is swallowed into logs and events; nothing here can affect the
//! foreground response.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::embedding::{embeddings_enabled, EmbeddingManager};
use super::tool::{KNOWLEDGE_TOOL_NAME, WORKSPACE_TOOL_NAME};
use crate::context::{Message, ToolCall};
use crate::event::{Event, EventBus};
use crate::config;
use crate::tools::UnifiedToolManager;

/// Validation hook for merged session memory metadata. Supplied by the
/// embedding application; never serialized.
pub type MetadataSchema = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Ordered interaction lines for one turn.
#[derive(Debug, Clone, Default)]
pub struct InteractionData {
    pub lines: Vec<String>,
    pub user_text: String,
    pub assistant_text: String,
}

impl InteractionData {
    /// Collect user text, one line per tool call, one line per tool
    /// result, and the assistant text, in that order.
    pub fn collect(
        user_text: &str,
        tool_exchanges: &[(ToolCall, Value)],
        assistant_text: &str,
    ) -> Self {
        let mut lines = Vec::with_capacity(tool_exchanges.len() * 2 + 2);
        lines.push(user_text.to_string());
        for (call, result) in tool_exchanges {
            lines.push(summarize_tool_call(call));
            lines.push(summarize_tool_result(&call.function.name, result));
        }
        lines.push(assistant_text.to_string());
        Self {
            lines,
            user_text: user_text.to_string(),
            assistant_text: assistant_text.to_string(),
        }
    }

    /// Rebuild interaction data from the tail of a transcript (the last
    /// user turn onward).
    pub fn from_transcript_tail(messages: &[Message]) -> Self {
        let start = messages
            .iter()
            .rposition(|m| m.role == crate::context::MessageRole::User && m.tool_call_id.is_none())
            .unwrap_or(0);
        let tail = &messages[start..];

        let user_text = tail
            .first()
            .map(|m| m.text())
            .unwrap_or_default();
        let assistant_text = tail
            .iter()
            .rev()
            .find(|m| m.role == crate::context::MessageRole::Assistant && !m.has_tool_calls())
            .map(|m| m.text())
            .unwrap_or_default();

        let mut exchanges: Vec<(ToolCall, Value)> = Vec::new();
        for message in tail {
            for call in &message.tool_calls {
                exchanges.push((call.clone(), Value::Null));
            }
            if let Some(ref call_id) = message.tool_call_id {
                if let Some(slot) = exchanges.iter_mut().find(|(c, v)| &c.id == call_id && v.is_null())
                {
                    slot.1 = Value::String(message.text());
                }
            }
        }

        Self::collect(&user_text, &exchanges, &assistant_text)
    }
}

/// One line per tool call: `name with key=value, key=value`.
fn summarize_tool_call(call: &ToolCall) -> String {
    let args: Value = serde_json::from_str(&call.function.arguments).unwrap_or(Value::Null);
    match args.as_object() {
        Some(map) if !map.is_empty() => {
            let pairs: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{k}={}", compact_value(v)))
                .collect();
            format!("{} with {}", call.function.name, pairs.join(", "))
        }
        _ => call.function.name.clone(),
    }
}

/// Compact result summary: line counts for file reads, result counts for
/// searches, character counts otherwise.
fn summarize_tool_result(tool_name: &str, result: &Value) -> String {
    if result.is_null() {
        return format!("{tool_name} returned no result");
    }
    let text = match result {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    let lower = tool_name.to_ascii_lowercase();
    if lower.contains("read") || lower.contains("file") {
        let line_count = text.lines().count();
        return format!("{tool_name} returned {line_count} lines");
    }
    if lower.contains("search") || lower.contains("find") || lower.contains("list") {
        if let Some(items) = result.as_array() {
            return format!("{tool_name} returned {} results", items.len());
        }
        if let Some(items) = result.get("results").and_then(|v| v.as_array()) {
            return format!("{tool_name} returned {} results", items.len());
        }
    }
    format!("{tool_name} returned {} chars", text.len())
}

fn compact_value(value: &Value) -> String {
    match value {
        Value::String(s) => {
            if s.len() > 48 {
                format!("{}…", &s[..s.char_indices().take(47).last().map(|(i, c)| i + c.len_utf8()).unwrap_or(0)])
            } else {
                s.clone()
            }
        }
        other => other.to_string(),
    }
}

/// Per-run overrides handed to `run`.
#[derive(Debug, Clone, Default)]
pub struct MemoryRunOverrides {
    pub context_overrides: Option<Value>,
    pub metadata_overrides: Option<Value>,
    pub conversation_topic: Option<String>,
}

/// Drives the memory tools after each foreground turn.
pub struct KnowledgeMemoryPipeline {
    tools: Arc<UnifiedToolManager>,
    embeddings: Arc<EmbeddingManager>,
    bus: Arc<EventBus>,
}

impl KnowledgeMemoryPipeline {
    pub fn new(
        tools: Arc<UnifiedToolManager>,
        embeddings: Arc<EmbeddingManager>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            tools,
            embeddings,
            bus,
        }
    }

    /// Run the pipeline for one turn. Errors are logged and emitted, never
    /// returned to the caller.
    pub async fn run(
        &self,
        session_id: &str,
        interaction: &InteractionData,
        session_metadata: Option<&Value>,
        metadata_schema: Option<&MetadataSchema>,
        overrides: &MemoryRunOverrides,
    ) {
        if !embeddings_enabled() || !self.embeddings.has_active_embedders() {
            debug!(target: "memory", session = %session_id, "Embeddings unavailable; skipping memory pipeline");
            return;
        }

        let context = self.merged_context(session_id, interaction, overrides);
        let metadata = self.merged_metadata(session_metadata, metadata_schema, overrides);
        let args = json!({
            "interaction": interaction.lines,
            "context": context,
            "metadata": metadata,
            "options": {},
        });

        if config::env_flag("USE_WORKSPACE_MEMORY") {
            self.execute_tool(session_id, WORKSPACE_TOOL_NAME, args.clone())
                .await;
        }
        if !config::env_flag("DISABLE_DEFAULT_MEMORY") {
            self.execute_tool(session_id, KNOWLEDGE_TOOL_NAME, args).await;
        }
    }

    async fn execute_tool(&self, session_id: &str, tool_name: &str, args: Value) {
        if !self.tools.has_tool(tool_name) {
            debug!(target: "memory", tool = %tool_name, "Memory tool not registered; skipping");
            return;
        }
        match self.tools.execute_tool_without_loading(tool_name, args).await {
            Ok(result) => {
                let count = result
                    .get("actions")
                    .and_then(|v| v.as_array())
                    .map(|a| a.len())
                    .unwrap_or(0);
                debug!(target: "memory", session = %session_id, tool = %tool_name, actions = count, "Memory tool finished");
            }
            Err(e) => {
                warn!(target: "memory", session = %session_id, tool = %tool_name, error = %e, "Memory tool failed");
                self.bus.publish(
                    Event::new(
                        "memory:operationFailed",
                        json!({"stage": "tool", "tool": tool_name, "error": e.to_string()}),
                    )
                    .for_session(session_id),
                );
            }
        }
    }

    /// Base context (`sessionId`, `conversationTopic`, `recentMessages`)
    /// overlaid with the per-run overrides.
    fn merged_context(
        &self,
        session_id: &str,
        interaction: &InteractionData,
        overrides: &MemoryRunOverrides,
    ) -> Value {
        let topic = overrides
            .conversation_topic
            .clone()
            .unwrap_or_else(|| head_words(&interaction.user_text, 8));
        let mut context = Map::new();
        context.insert("sessionId".to_string(), json!(session_id));
        context.insert("conversationTopic".to_string(), json!(topic));
        context.insert(
            "recentMessages".to_string(),
            json!([interaction.user_text, interaction.assistant_text]),
        );
        if let Some(Value::Object(extra)) = &overrides.context_overrides {
            for (k, v) in extra {
                context.insert(k.clone(), v.clone());
            }
        }
        Value::Object(context)
    }

    /// Session defaults overlaid with per-run overrides, then validated.
    /// On validation failure the overrides are dropped with a warning.
    fn merged_metadata(
        &self,
        session_metadata: Option<&Value>,
        schema: Option<&MetadataSchema>,
        overrides: &MemoryRunOverrides,
    ) -> Value {
        let mut merged = match session_metadata {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };
        if let Some(Value::Object(extra)) = &overrides.metadata_overrides {
            for (k, v) in extra {
                merged.insert(k.clone(), v.clone());
            }
        }
        let candidate = Value::Object(merged);

        if let Some(validate) = schema {
            if !validate(&candidate) {
                warn!(target: "memory", "Merged memory metadata failed schema validation; dropping per-run overrides");
                return match session_metadata {
                    Some(v) => v.clone(),
                    None => json!({}),
                };
            }
        }
        candidate
    }
}

fn head_words(text: &str, count: usize) -> String {
    text.split_whitespace()
        .take(count)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_summary_shape() {
        let call = ToolCall::new("read_file", "read_file", r#"{"path": "/tmp/a.txt", "limit": 10}"#);
        let line = summarize_tool_call(&call);
        assert!(line.starts_with("read_file with "));
        assert!(line.contains("path=/tmp/a.txt"));
        assert!(line.contains("limit=10"));
    }

    #[test]
    fn result_summaries_by_kind() {
        assert_eq!(
            summarize_tool_result("read_file", &json!("a\nb\nc")),
            "read_file returned 3 lines"
        );
        assert_eq!(
            summarize_tool_result("search_code", &json!([1, 2, 3, 4])),
            "search_code returned 4 results"
        );
        assert_eq!(
            summarize_tool_result("compute", &json!("12345")),
            "compute returned 5 chars"
        );
    }

    #[test]
    fn collect_orders_lines() {
        let call = ToolCall::new("c1", "search", r#"{"q": "rust"}"#);
        let data = InteractionData::collect(
            "find rust docs",
            &[(call, json!(["hit"]))],
            "here you go",
        );
        assert_eq!(data.lines.len(), 4);
        assert_eq!(data.lines[0], "find rust docs");
        assert!(data.lines[1].starts_with("search with"));
        assert!(data.lines[2].contains("1 results"));
        assert_eq!(data.lines[3], "here you go");
    }

    #[test]
    fn transcript_tail_reconstruction() {
        let messages = vec![
            Message::user("old turn"),
            Message::assistant("old answer"),
            Message::user("In Python, def defines a function."),
            Message::assistant_with_tool_calls(
                "",
                vec![ToolCall::new("c9", "search", r#"{"q": "def"}"#)],
            ),
            Message::tool_result("c9", "search", &json!(["a", "b"])),
            Message::assistant("Right, def starts a function definition."),
        ];
        let data = InteractionData::from_transcript_tail(&messages);
        assert_eq!(data.user_text, "In Python, def defines a function.");
        assert_eq!(
            data.assistant_text,
            "Right, def starts a function definition."
        );
        assert!(data.lines.iter().any(|l| l.starts_with("search with")));
    }

    #[test]
    fn metadata_merge_drops_overrides_on_schema_failure() {
        let pipeline = KnowledgeMemoryPipeline::new(
            Arc::new(UnifiedToolManager::new(
                Arc::new(EventBus::new()),
                std::time::Duration::from_secs(1),
                crate::tools::ConflictResolution::FirstWins,
                crate::tools::ServerMode::Default,
            )),
            Arc::new(EmbeddingManager::new(Vec::new())),
            Arc::new(EventBus::new()),
        );

        let session_meta = json!({"team": "core"});
        let overrides = MemoryRunOverrides {
            metadata_overrides: Some(json!({"forbidden": true})),
            ..Default::default()
        };
        let schema: MetadataSchema = Arc::new(|v: &Value| v.get("forbidden").is_none());

        let merged = pipeline.merged_metadata(Some(&session_meta), Some(&schema), &overrides);
        assert_eq!(merged, session_meta);

        let no_schema = pipeline.merged_metadata(Some(&session_meta), None, &overrides);
        assert_eq!(no_schema["forbidden"], true);
        assert_eq!(no_schema["team"], "core");
    }

    #[test]
    fn context_merge_applies_overrides() {
        let pipeline = KnowledgeMemoryPipeline::new(
            Arc::new(UnifiedToolManager::new(
                Arc::new(EventBus::new()),
                std::time::Duration::from_secs(1),
                crate::tools::ConflictResolution::FirstWins,
                crate::tools::ServerMode::Default,
            )),
            Arc::new(EmbeddingManager::new(Vec::new())),
            Arc::new(EventBus::new()),
        );
        let data = InteractionData::collect("the user text here", &[], "answer");
        let overrides = MemoryRunOverrides {
            context_overrides: Some(json!({"conversationTopic": "custom"})),
            ..Default::default()
        };
        let context = pipeline.merged_context("s1", &data, &overrides);
        assert_eq!(context["sessionId"], "s1");
        assert_eq!(context["conversationTopic"], "custom");
    }
}
