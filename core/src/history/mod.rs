//! Durable transcript storage.
//!
//! Three providers back the context manager:
//! - `DatabaseHistoryProvider` (primary): rows keyed `(session_id, seq)`
//!   over Postgres or SQLite.
//! - `WalHistoryProvider`: in-memory append log flushed to a sink on a
//!   timer.
//! - `MultiBackendHistoryProvider`: WAL in front of a primary and a backup,
//!   with read fallback.

pub mod database;
pub mod multi;
pub mod wal;

pub use database::{DatabaseHistoryProvider, StorageBackend, StorageManager};
pub use multi::MultiBackendHistoryProvider;
pub use wal::{WalHistoryProvider, WalSink};

use async_trait::async_trait;

use crate::context::Message;
use crate::Result;

/// Durable backing store for session transcripts.
///
/// Implementations must be internally thread-safe: the same provider may
/// be shared by every session using one storage backend.
#[async_trait]
pub trait HistoryProvider: Send + Sync {
    /// Append one message to the session's transcript. The message must be
    /// durable when this returns.
    async fn save_message(&self, session_id: &str, message: &Message) -> Result<()>;

    /// Load the full transcript in append order.
    async fn load_messages(&self, session_id: &str) -> Result<Vec<Message>>;

    /// Replace the session's transcript wholesale (restore path).
    async fn replace_messages(&self, session_id: &str, messages: &[Message]) -> Result<()>;

    /// Drop the session's transcript.
    async fn clear_session(&self, session_id: &str) -> Result<()>;

    /// Release underlying connections. Providers shared across sessions
    /// ignore this; exclusively owned ones tear down.
    async fn close(&self) -> Result<()>;

    fn backend_name(&self) -> &'static str;
}
