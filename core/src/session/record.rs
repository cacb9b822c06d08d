//! Persisted session records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::Message;

/// Version stamp written into every serialized session. Mismatched
/// versions restore best-effort with a warning.
pub const SESSION_RECORD_VERSION: &str = "3.0";

/// Serialized session: transcript plus metadata. Functions (merge hooks,
/// metadata schemas) are never serialized and must be re-supplied on
/// restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub session_id: String,
    pub conversation_history: Vec<Message>,
    pub metadata: RecordMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
    pub version: String,
    pub serialized_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMetadata {
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub history_enabled: bool,
    pub history_backend: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_memory_metadata: Option<Value>,
    /// Deployment environment tag captured at serialization time.
    pub environment: String,
}
