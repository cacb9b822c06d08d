//! Multi-backend history provider.
//!
//! Owns a primary, a backup, and a WAL. Writes land in the WAL
//! synchronously and are fanned out to primary and backup on the flush
//! tick. Reads prefer the primary inside a 250 ms budget, fall back to the
//! backup, and finally surface the WAL tail.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::wal::{WalEntry, WalHistoryProvider, WalSink};
use super::HistoryProvider;
use crate::context::Message;
use crate::Result;

const PRIMARY_READ_BUDGET: Duration = Duration::from_millis(250);

/// Flush sink that replays WAL entries into primary and backup.
struct FanOutSink {
    primary: Arc<dyn HistoryProvider>,
    backup: Arc<dyn HistoryProvider>,
}

#[async_trait]
impl WalSink for FanOutSink {
    async fn flush(&self, entries: &[WalEntry]) -> Result<()> {
        for entry in entries {
            self.primary
                .save_message(&entry.session_id, &entry.message)
                .await?;
            if let Err(e) = self
                .backup
                .save_message(&entry.session_id, &entry.message)
                .await
            {
                // The backup is best-effort; the primary write already
                // succeeded, so losing it only narrows the fallback path.
                warn!(target: "history", error = %e, "Backup write failed");
            }
        }
        Ok(())
    }
}

/// Composite provider: WAL in front, primary + backup behind.
pub struct MultiBackendHistoryProvider {
    primary: Arc<dyn HistoryProvider>,
    backup: Arc<dyn HistoryProvider>,
    wal: Arc<WalHistoryProvider>,
}

impl MultiBackendHistoryProvider {
    pub fn new(primary: Arc<dyn HistoryProvider>, backup: Arc<dyn HistoryProvider>) -> Self {
        let sink = Arc::new(FanOutSink {
            primary: Arc::clone(&primary),
            backup: Arc::clone(&backup),
        });
        Self {
            primary,
            backup,
            wal: WalHistoryProvider::new(sink),
        }
    }

    pub fn with_flush_interval(
        primary: Arc<dyn HistoryProvider>,
        backup: Arc<dyn HistoryProvider>,
        flush_interval: Duration,
    ) -> Self {
        let sink = Arc::new(FanOutSink {
            primary: Arc::clone(&primary),
            backup: Arc::clone(&backup),
        });
        Self {
            primary,
            backup,
            wal: WalHistoryProvider::with_limits(
                sink,
                flush_interval,
                super::wal::DEFAULT_MAX_ENTRIES,
            ),
        }
    }

    /// Push buffered writes through to primary and backup immediately.
    pub async fn flush(&self) -> Result<()> {
        self.wal.flush_now().await
    }
}

#[async_trait]
impl HistoryProvider for MultiBackendHistoryProvider {
    async fn save_message(&self, session_id: &str, message: &Message) -> Result<()> {
        self.wal.save_message(session_id, message).await
    }

    async fn load_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        match timeout(PRIMARY_READ_BUDGET, self.primary.load_messages(session_id)).await {
            Ok(Ok(mut messages)) => {
                // Writes still sitting in the WAL have not reached the
                // primary yet; append the tail so readers see the full
                // transcript.
                messages.extend(self.wal.tail(session_id).await);
                return Ok(messages);
            }
            Ok(Err(e)) => {
                warn!(target: "history", error = %e, "Primary read failed; trying backup")
            }
            Err(_) => {
                warn!(target: "history", budget_ms = PRIMARY_READ_BUDGET.as_millis() as u64, "Primary read over budget; trying backup")
            }
        }

        match self.backup.load_messages(session_id).await {
            Ok(mut messages) => {
                messages.extend(self.wal.tail(session_id).await);
                Ok(messages)
            }
            Err(e) => {
                warn!(target: "history", error = %e, "Backup read failed; surfacing WAL tail");
                Ok(self.wal.tail(session_id).await)
            }
        }
    }

    async fn replace_messages(&self, session_id: &str, messages: &[Message]) -> Result<()> {
        self.wal.clear_session(session_id).await?;
        self.primary.replace_messages(session_id, messages).await?;
        if let Err(e) = self.backup.replace_messages(session_id, messages).await {
            warn!(target: "history", error = %e, "Backup replace failed");
        }
        Ok(())
    }

    async fn clear_session(&self, session_id: &str) -> Result<()> {
        self.wal.clear_session(session_id).await?;
        self.primary.clear_session(session_id).await?;
        if let Err(e) = self.backup.clear_session(session_id).await {
            warn!(target: "history", error = %e, "Backup clear failed");
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        debug!(target: "history", "Closing multi-backend provider");
        self.wal.close().await?;
        self.primary.close().await?;
        self.backup.close().await
    }

    fn backend_name(&self) -> &'static str {
        "multi"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MatrixError, Result};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex;

    /// Test double with switchable failure and latency.
    struct FlakyProvider {
        messages: Mutex<Vec<(String, Message)>>,
        failing: AtomicBool,
        slow: AtomicBool,
    }

    impl FlakyProvider {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                messages: Mutex::new(Vec::new()),
                failing: AtomicBool::new(false),
                slow: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl HistoryProvider for FlakyProvider {
        async fn save_message(&self, session_id: &str, message: &Message) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(MatrixError::HistoryProvider("down".to_string()));
            }
            self.messages
                .lock()
                .await
                .push((session_id.to_string(), message.clone()));
            Ok(())
        }

        async fn load_messages(&self, session_id: &str) -> Result<Vec<Message>> {
            if self.slow.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(MatrixError::HistoryProvider("down".to_string()));
            }
            Ok(self
                .messages
                .lock()
                .await
                .iter()
                .filter(|(s, _)| s == session_id)
                .map(|(_, m)| m.clone())
                .collect())
        }

        async fn replace_messages(&self, session_id: &str, messages: &[Message]) -> Result<()> {
            let mut store = self.messages.lock().await;
            store.retain(|(s, _)| s != session_id);
            for m in messages {
                store.push((session_id.to_string(), m.clone()));
            }
            Ok(())
        }

        async fn clear_session(&self, session_id: &str) -> Result<()> {
            self.messages.lock().await.retain(|(s, _)| s != session_id);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }

        fn backend_name(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn writes_fan_out_on_flush() {
        let primary = FlakyProvider::new();
        let backup = FlakyProvider::new();
        let multi = MultiBackendHistoryProvider::with_flush_interval(
            primary.clone(),
            backup.clone(),
            Duration::from_secs(3600),
        );

        multi.save_message("s", &Message::user("hello")).await.unwrap();
        assert!(primary.load_messages("s").await.unwrap().is_empty());

        multi.flush().await.unwrap();
        assert_eq!(primary.load_messages("s").await.unwrap().len(), 1);
        assert_eq!(backup.load_messages("s").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unflushed_tail_is_visible_to_reads() {
        let primary = FlakyProvider::new();
        let backup = FlakyProvider::new();
        let multi = MultiBackendHistoryProvider::with_flush_interval(
            primary,
            backup,
            Duration::from_secs(3600),
        );

        multi.save_message("s", &Message::user("buffered")).await.unwrap();
        let messages = multi.load_messages("s").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text(), "buffered");
    }

    #[tokio::test]
    async fn slow_primary_falls_back_to_backup() {
        let primary = FlakyProvider::new();
        let backup = FlakyProvider::new();
        backup
            .save_message("s", &Message::user("from backup"))
            .await
            .unwrap();
        primary.slow.store(true, Ordering::SeqCst);

        let multi = MultiBackendHistoryProvider::with_flush_interval(
            primary,
            backup,
            Duration::from_secs(3600),
        );
        let messages = multi.load_messages("s").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text(), "from backup");
    }

    #[tokio::test]
    async fn both_backends_down_surfaces_wal_tail() {
        let primary = FlakyProvider::new();
        let backup = FlakyProvider::new();
        primary.failing.store(true, Ordering::SeqCst);
        backup.failing.store(true, Ordering::SeqCst);

        let multi = MultiBackendHistoryProvider::with_flush_interval(
            primary,
            backup,
            Duration::from_secs(3600),
        );
        multi.save_message("s", &Message::user("tail only")).await.unwrap();

        let messages = multi.load_messages("s").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text(), "tail only");
    }
}
