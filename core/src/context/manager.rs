//! Ordered transcript with durable appends.
//!
//! Every append is saved to the bound history provider before the call
//! returns; write failures are logged and the in-memory transcript stays
//! authoritative for the rest of the turn.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::formatter::{FormattedRequest, MessageFormatter};
use super::types::{Message, MessageRole, ToolCall};
use crate::history::HistoryProvider;
use crate::Result;

/// Character budget applied to the transcript before formatting. Oldest
/// turns fall off first; the budget is generous enough that only long
/// sessions are trimmed.
const DEFAULT_HISTORY_CHAR_BUDGET: usize = 48_000;

pub struct ContextManager {
    session_id: String,
    formatter: Arc<dyn MessageFormatter>,
    system_prompt: RwLock<Option<String>>,
    messages: RwLock<Vec<Message>>,
    history: RwLock<Option<Arc<dyn HistoryProvider>>>,
    history_char_budget: usize,
}

impl ContextManager {
    pub fn new(session_id: impl Into<String>, formatter: Arc<dyn MessageFormatter>) -> Self {
        Self {
            session_id: session_id.into(),
            formatter,
            system_prompt: RwLock::new(None),
            messages: RwLock::new(Vec::new()),
            history: RwLock::new(None),
            history_char_budget: DEFAULT_HISTORY_CHAR_BUDGET,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn formatter(&self) -> &Arc<dyn MessageFormatter> {
        &self.formatter
    }

    pub async fn set_system_prompt(&self, prompt: Option<String>) {
        *self.system_prompt.write().await = prompt;
    }

    /// Bind (or replace) the history provider backing this transcript.
    pub async fn bind_history_provider(&self, provider: Arc<dyn HistoryProvider>) {
        *self.history.write().await = Some(provider);
    }

    pub async fn has_history_provider(&self) -> bool {
        self.history.read().await.is_some()
    }

    pub async fn history_provider(&self) -> Option<Arc<dyn HistoryProvider>> {
        self.history.read().await.clone()
    }

    // ----- appends ---------------------------------------------------------

    pub async fn add_user_message(&self, message: Message) {
        debug_assert_eq!(message.role, MessageRole::User);
        self.append(message).await;
    }

    pub async fn add_assistant_message(&self, text: impl Into<String>) {
        self.append(Message::assistant(text)).await;
    }

    pub async fn add_assistant_message_with_tool_calls(
        &self,
        text: impl Into<String>,
        tool_calls: Vec<ToolCall>,
    ) {
        self.append(Message::assistant_with_tool_calls(text, tool_calls))
            .await;
    }

    pub async fn add_tool_result(
        &self,
        call_id: impl Into<String>,
        name: impl Into<String>,
        payload: &serde_json::Value,
    ) {
        self.append(Message::tool_result(call_id, name, payload)).await;
    }

    /// Append and persist. The save completes before this returns; a write
    /// failure is logged and the append stands.
    async fn append(&self, message: Message) {
        let provider = {
            let mut messages = self.messages.write().await;
            messages.push(message.clone());
            self.history.read().await.clone()
        };
        if let Some(provider) = provider {
            if let Err(e) = provider.save_message(&self.session_id, &message).await {
                warn!(target: "context", session = %self.session_id, error = %e, "History write failed; continuing with in-memory transcript");
            }
        }
    }

    // ----- reads -----------------------------------------------------------

    pub async fn get_raw_messages(&self) -> Vec<Message> {
        self.messages.read().await.clone()
    }

    pub async fn message_count(&self) -> usize {
        self.messages.read().await.len()
    }

    /// Provider-ready request: windowed transcript plus the system prompt,
    /// shaped by this session's formatter.
    pub async fn get_formatted_messages(&self) -> FormattedRequest {
        let messages = self.messages.read().await;
        let window = Self::window(&messages, self.history_char_budget);
        let system = self.system_prompt.read().await.clone();
        self.formatter.format(system.as_deref(), window)
    }

    /// Trim old turns to the character budget. The window never starts on
    /// a tool-result message: a result without its assistant tool call
    /// would be rejected by every provider.
    fn window(messages: &[Message], budget: usize) -> &[Message] {
        let mut used = 0usize;
        let mut start = messages.len();
        for (i, message) in messages.iter().enumerate().rev() {
            let cost = message.text().len() + 64;
            if used + cost > budget && start < messages.len() {
                break;
            }
            used += cost;
            start = i;
        }
        while start < messages.len() && messages[start].role == MessageRole::Tool {
            start += 1;
        }
        &messages[start..]
    }

    // ----- restoration strategies ------------------------------------------

    /// Strategy (a): provider-driven restore. Replaces the in-memory
    /// transcript with whatever the provider holds.
    pub async fn restore_history(&self) -> Result<usize> {
        let provider = self
            .history
            .read()
            .await
            .clone()
            .ok_or_else(|| crate::MatrixError::HistoryProvider("no provider bound".to_string()))?;
        let restored = provider.load_messages(&self.session_id).await?;
        let count = restored.len();
        *self.messages.write().await = restored;
        debug!(target: "context", session = %self.session_id, count, "Restored history from provider");
        Ok(count)
    }

    /// Strategy (b): bulk replacement of the in-memory transcript.
    pub async fn set_messages(&self, messages: Vec<Message>) {
        *self.messages.write().await = messages;
    }

    /// Strategy (c): append one already-persisted message without writing
    /// it back to the provider.
    pub async fn append_restored_message(&self, message: Message) {
        self.messages.write().await.push(message);
    }

    pub async fn clear_messages(&self) {
        self.messages.write().await.clear();
    }
}
