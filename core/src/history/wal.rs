//! Write-ahead log history provider.
//!
//! Appends land in memory and are flushed to a sink on a timer
//! (`WAL_FLUSH_INTERVAL`, default 5000 ms). The flush drops no records;
//! if the sink is slow the log grows until `max_entries`, at which point
//! writes fail loudly rather than discarding silently.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::HistoryProvider;
use crate::context::Message;
use crate::{config, MatrixError, Result};

pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5000;
pub const DEFAULT_MAX_ENTRIES: usize = 100_000;

/// One buffered append.
#[derive(Debug, Clone)]
pub struct WalEntry {
    pub session_id: String,
    pub message: Message,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
}

/// Destination of a WAL flush.
#[async_trait]
pub trait WalSink: Send + Sync {
    async fn flush(&self, entries: &[WalEntry]) -> Result<()>;
}

/// In-memory append log flushed to a sink on a timer.
pub struct WalHistoryProvider {
    log: Arc<Mutex<VecDeque<WalEntry>>>,
    sink: Arc<dyn WalSink>,
    max_entries: usize,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl WalHistoryProvider {
    pub fn new(sink: Arc<dyn WalSink>) -> Arc<Self> {
        Self::with_limits(
            sink,
            Duration::from_millis(config::env_u64(
                "WAL_FLUSH_INTERVAL",
                DEFAULT_FLUSH_INTERVAL_MS,
            )),
            DEFAULT_MAX_ENTRIES,
        )
    }

    pub fn with_limits(
        sink: Arc<dyn WalSink>,
        flush_interval: Duration,
        max_entries: usize,
    ) -> Arc<Self> {
        let provider = Arc::new(Self {
            log: Arc::new(Mutex::new(VecDeque::new())),
            sink,
            max_entries,
            flush_task: Mutex::new(None),
        });
        Self::spawn_flush_task(&provider, flush_interval);
        provider
    }

    fn spawn_flush_task(provider: &Arc<Self>, flush_interval: Duration) {
        let weak = Arc::downgrade(provider);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(provider) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = provider.flush_now().await {
                    warn!(target: "history", error = %e, "WAL flush failed; entries retained");
                }
            }
        });
        if let Ok(mut slot) = provider.flush_task.try_lock() {
            *slot = Some(handle);
        }
    }

    /// Drain the log into the sink. Entries are re-queued in order if the
    /// sink fails, so nothing is lost.
    pub async fn flush_now(&self) -> Result<()> {
        let drained: Vec<WalEntry> = {
            let mut log = self.log.lock().await;
            log.drain(..).collect()
        };
        if drained.is_empty() {
            return Ok(());
        }

        debug!(target: "history", count = drained.len(), "Flushing WAL");
        if let Err(e) = self.sink.flush(&drained).await {
            let mut log = self.log.lock().await;
            for (i, entry) in drained.into_iter().enumerate() {
                log.insert(i, entry);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Number of buffered entries.
    pub async fn pending(&self) -> usize {
        self.log.lock().await.len()
    }

    /// Unflushed tail for one session, in append order.
    pub async fn tail(&self, session_id: &str) -> Vec<Message> {
        self.log
            .lock()
            .await
            .iter()
            .filter(|e| e.session_id == session_id)
            .map(|e| e.message.clone())
            .collect()
    }

    pub async fn shutdown(&self) {
        if let Some(handle) = self.flush_task.lock().await.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl HistoryProvider for WalHistoryProvider {
    async fn save_message(&self, session_id: &str, message: &Message) -> Result<()> {
        let mut log = self.log.lock().await;
        if log.len() >= self.max_entries {
            return Err(MatrixError::HistoryProvider(format!(
                "WAL overflow: {} entries buffered and the sink is not keeping up",
                log.len()
            )));
        }
        log.push_back(WalEntry {
            session_id: session_id.to_string(),
            message: message.clone(),
            enqueued_at: chrono::Utc::now(),
        });
        Ok(())
    }

    async fn load_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        Ok(self.tail(session_id).await)
    }

    async fn replace_messages(&self, session_id: &str, messages: &[Message]) -> Result<()> {
        let mut log = self.log.lock().await;
        log.retain(|e| e.session_id != session_id);
        for message in messages {
            log.push_back(WalEntry {
                session_id: session_id.to_string(),
                message: message.clone(),
                enqueued_at: chrono::Utc::now(),
            });
        }
        Ok(())
    }

    async fn clear_session(&self, session_id: &str) -> Result<()> {
        self.log.lock().await.retain(|e| e.session_id != session_id);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // Best-effort final flush before releasing the timer.
        let _ = self.flush_now().await;
        self.shutdown().await;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "wal"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct CountingSink {
        flushed: AtomicUsize,
        fail: AtomicBool,
    }

    impl CountingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                flushed: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl WalSink for CountingSink {
        async fn flush(&self, entries: &[WalEntry]) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(MatrixError::HistoryProvider("sink down".to_string()));
            }
            self.flushed.fetch_add(entries.len(), Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn flush_drains_the_log() {
        let sink = CountingSink::new();
        let wal = WalHistoryProvider::with_limits(
            sink.clone(),
            Duration::from_secs(3600),
            DEFAULT_MAX_ENTRIES,
        );

        wal.save_message("s", &Message::user("a")).await.unwrap();
        wal.save_message("s", &Message::assistant("b")).await.unwrap();
        assert_eq!(wal.pending().await, 2);

        wal.flush_now().await.unwrap();
        assert_eq!(wal.pending().await, 0);
        assert_eq!(sink.flushed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_flush_requeues_in_order() {
        let sink = CountingSink::new();
        sink.fail.store(true, Ordering::SeqCst);
        let wal = WalHistoryProvider::with_limits(
            sink.clone(),
            Duration::from_secs(3600),
            DEFAULT_MAX_ENTRIES,
        );

        wal.save_message("s", &Message::user("a")).await.unwrap();
        wal.save_message("s", &Message::user("b")).await.unwrap();
        assert!(wal.flush_now().await.is_err());

        let tail = wal.tail("s").await;
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].text(), "a");

        sink.fail.store(false, Ordering::SeqCst);
        wal.flush_now().await.unwrap();
        assert_eq!(sink.flushed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn overflow_fails_loudly() {
        let sink = CountingSink::new();
        let wal = WalHistoryProvider::with_limits(sink, Duration::from_secs(3600), 2);

        wal.save_message("s", &Message::user("1")).await.unwrap();
        wal.save_message("s", &Message::user("2")).await.unwrap();
        let err = wal.save_message("s", &Message::user("3")).await.unwrap_err();
        assert!(matches!(err, MatrixError::HistoryProvider(_)));
    }

    #[tokio::test]
    async fn timer_flushes_in_background() {
        let sink = CountingSink::new();
        let wal = WalHistoryProvider::with_limits(
            sink.clone(),
            Duration::from_millis(20),
            DEFAULT_MAX_ENTRIES,
        );
        wal.save_message("s", &Message::user("tick")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(sink.flushed.load(Ordering::SeqCst), 1);
        wal.shutdown().await;
    }
}
