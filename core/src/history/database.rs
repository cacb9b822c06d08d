//! Database-backed history provider over Postgres or SQLite.
//!
//! Backend choice: Postgres when `PG_URL` or a host+database pair is
//! configured, SQLite otherwise. The choice is resolved once per process
//! and cached.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use super::HistoryProvider;
use crate::context::Message;
use crate::{MatrixError, Result};

/// Which engine backs the storage manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres { url: String },
    Sqlite { path: PathBuf },
}

impl StorageBackend {
    /// Resolve the backend from the environment.
    ///
    /// Returns `None` when nothing is configured; callers treat that as
    /// history disabled.
    pub fn from_env() -> Option<StorageBackend> {
        if let Ok(url) = std::env::var("PG_URL") {
            if !url.trim().is_empty() {
                return Some(StorageBackend::Postgres { url });
            }
        }

        let host = std::env::var("STORAGE_DATABASE_HOST").ok().filter(|s| !s.is_empty());
        let name = std::env::var("STORAGE_DATABASE_NAME").ok().filter(|s| !s.is_empty());
        if let (Some(host), Some(name)) = (host.clone(), name.clone()) {
            let port = std::env::var("STORAGE_DATABASE_PORT").unwrap_or_else(|_| "5432".to_string());
            let user = std::env::var("STORAGE_DATABASE_USER").unwrap_or_else(|_| "postgres".to_string());
            let password = std::env::var("STORAGE_DATABASE_PASSWORD").unwrap_or_default();
            let ssl = crate::config::env_flag("STORAGE_DATABASE_SSL");
            let ssl_mode = if ssl { "require" } else { "prefer" };
            let auth = if password.is_empty() {
                user
            } else {
                format!("{user}:{password}")
            };
            return Some(StorageBackend::Postgres {
                url: format!("postgres://{auth}@{host}:{port}/{name}?sslmode={ssl_mode}"),
            });
        }

        if let Ok(dir) = std::env::var("STORAGE_DATABASE_PATH") {
            if !dir.trim().is_empty() {
                let file = name.unwrap_or_else(|| "matrix.db".to_string());
                return Some(StorageBackend::Sqlite {
                    path: PathBuf::from(dir).join(file),
                });
            }
        }

        None
    }
}

/// Connection pool wrapper; one per process per backend.
pub enum DatabasePool {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

/// Owns the connection pool and the resolved backend choice.
pub struct StorageManager {
    pool: DatabasePool,
    backend: StorageBackend,
}

static STORAGE_CACHE: OnceCell<Option<Arc<StorageManager>>> = OnceCell::const_new();

impl StorageManager {
    /// Connect to the given backend and bootstrap the schema.
    pub async fn connect(backend: StorageBackend) -> Result<Arc<Self>> {
        let pool = match &backend {
            StorageBackend::Postgres { url } => {
                info!(target: "history", "Connecting Postgres history storage");
                let pool = PgPoolOptions::new()
                    .max_connections(5)
                    .connect(url)
                    .await
                    .map_err(|e| MatrixError::HistoryProvider(e.to_string()))?;
                sqlx::query(
                    "CREATE TABLE IF NOT EXISTS matrix_history (
                        session_id TEXT NOT NULL,
                        seq BIGINT NOT NULL,
                        role TEXT NOT NULL,
                        payload TEXT NOT NULL,
                        created_at BIGINT NOT NULL,
                        PRIMARY KEY (session_id, seq)
                    )",
                )
                .execute(&pool)
                .await
                .map_err(|e| MatrixError::HistoryProvider(e.to_string()))?;
                DatabasePool::Postgres(pool)
            }
            StorageBackend::Sqlite { path } => {
                info!(target: "history", path = %path.display(), "Opening SQLite history storage");
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let options = SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true);
                let pool = SqlitePoolOptions::new()
                    .max_connections(1)
                    .connect_with(options)
                    .await
                    .map_err(|e| MatrixError::HistoryProvider(e.to_string()))?;
                sqlx::query(
                    "CREATE TABLE IF NOT EXISTS matrix_history (
                        session_id TEXT NOT NULL,
                        seq INTEGER NOT NULL,
                        role TEXT NOT NULL,
                        payload TEXT NOT NULL,
                        created_at INTEGER NOT NULL,
                        PRIMARY KEY (session_id, seq)
                    )",
                )
                .execute(&pool)
                .await
                .map_err(|e| MatrixError::HistoryProvider(e.to_string()))?;
                DatabasePool::Sqlite(pool)
            }
        };

        Ok(Arc::new(Self { pool, backend }))
    }

    /// Process-wide cached storage manager resolved from the environment.
    ///
    /// `Ok(None)` means no backend is configured (history disabled). A
    /// connection failure is returned without latching the cache, so a
    /// later call retries.
    pub async fn from_env_cached() -> Result<Option<Arc<Self>>> {
        STORAGE_CACHE
            .get_or_try_init(|| async {
                match StorageBackend::from_env() {
                    None => {
                        debug!(target: "history", "No storage backend configured; history disabled");
                        Ok(None)
                    }
                    Some(backend) => Self::connect(backend).await.map(Some),
                }
            })
            .await
            .map(|cached| cached.clone())
    }

    pub fn backend(&self) -> &StorageBackend {
        &self.backend
    }

    pub fn backend_label(&self) -> &'static str {
        match self.backend {
            StorageBackend::Postgres { .. } => "postgres",
            StorageBackend::Sqlite { .. } => "sqlite",
        }
    }

    pub async fn close(&self) {
        match &self.pool {
            DatabasePool::Postgres(pool) => pool.close().await,
            DatabasePool::Sqlite(pool) => pool.close().await,
        }
    }
}

/// History provider persisting messages as rows keyed `(session_id, seq)`.
pub struct DatabaseHistoryProvider {
    storage: Arc<StorageManager>,
    // Serializes seq allocation per provider; appends within a session are
    // already ordered by the session turn lock.
    write_lock: Mutex<()>,
}

impl DatabaseHistoryProvider {
    pub fn new(storage: Arc<StorageManager>) -> Self {
        Self {
            storage,
            write_lock: Mutex::new(()),
        }
    }

    async fn next_seq(&self, session_id: &str) -> Result<i64> {
        let max: i64 = match &self.storage.pool {
            DatabasePool::Postgres(pool) => {
                sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) FROM matrix_history WHERE session_id = $1")
                    .bind(session_id)
                    .fetch_one(pool)
                    .await
                    .map_err(|e| MatrixError::HistoryProvider(e.to_string()))?
            }
            DatabasePool::Sqlite(pool) => {
                sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) FROM matrix_history WHERE session_id = ?")
                    .bind(session_id)
                    .fetch_one(pool)
                    .await
                    .map_err(|e| MatrixError::HistoryProvider(e.to_string()))?
            }
        };
        Ok(max + 1)
    }

    async fn insert(&self, session_id: &str, seq: i64, message: &Message) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        let role = serde_json::to_value(message.role)?
            .as_str()
            .unwrap_or("user")
            .to_string();
        let created_at = chrono::Utc::now().timestamp_millis();

        match &self.storage.pool {
            DatabasePool::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO matrix_history (session_id, seq, role, payload, created_at)
                     VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(session_id)
                .bind(seq)
                .bind(role)
                .bind(payload)
                .bind(created_at)
                .execute(pool)
                .await
                .map_err(|e| MatrixError::HistoryProvider(e.to_string()))?;
            }
            DatabasePool::Sqlite(pool) => {
                sqlx::query(
                    "INSERT INTO matrix_history (session_id, seq, role, payload, created_at)
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(session_id)
                .bind(seq)
                .bind(role)
                .bind(payload)
                .bind(created_at)
                .execute(pool)
                .await
                .map_err(|e| MatrixError::HistoryProvider(e.to_string()))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl HistoryProvider for DatabaseHistoryProvider {
    async fn save_message(&self, session_id: &str, message: &Message) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let seq = self.next_seq(session_id).await?;
        self.insert(session_id, seq, message).await
    }

    async fn load_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let payloads: Vec<String> = match &self.storage.pool {
            DatabasePool::Postgres(pool) => {
                sqlx::query_scalar(
                    "SELECT payload FROM matrix_history WHERE session_id = $1 ORDER BY seq ASC",
                )
                .bind(session_id)
                .fetch_all(pool)
                .await
                .map_err(|e| MatrixError::HistoryProvider(e.to_string()))?
            }
            DatabasePool::Sqlite(pool) => {
                sqlx::query_scalar(
                    "SELECT payload FROM matrix_history WHERE session_id = ? ORDER BY seq ASC",
                )
                .bind(session_id)
                .fetch_all(pool)
                .await
                .map_err(|e| MatrixError::HistoryProvider(e.to_string()))?
            }
        };

        let mut messages = Vec::with_capacity(payloads.len());
        for payload in payloads {
            match serde_json::from_str::<Message>(&payload) {
                Ok(m) => messages.push(m),
                // A single corrupt row should not lose the whole transcript.
                Err(e) => warn!(target: "history", session = %session_id, error = %e, "Skipping unreadable history row"),
            }
        }
        Ok(messages)
    }

    async fn replace_messages(&self, session_id: &str, messages: &[Message]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.clear_rows(session_id).await?;
        for (i, message) in messages.iter().enumerate() {
            self.insert(session_id, (i + 1) as i64, message).await?;
        }
        Ok(())
    }

    async fn clear_session(&self, session_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.clear_rows(session_id).await
    }

    async fn close(&self) -> Result<()> {
        self.storage.close().await;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        self.storage.backend_label()
    }
}

impl DatabaseHistoryProvider {
    async fn clear_rows(&self, session_id: &str) -> Result<()> {
        match &self.storage.pool {
            DatabasePool::Postgres(pool) => {
                sqlx::query("DELETE FROM matrix_history WHERE session_id = $1")
                    .bind(session_id)
                    .execute(pool)
                    .await
                    .map_err(|e| MatrixError::HistoryProvider(e.to_string()))?;
            }
            DatabasePool::Sqlite(pool) => {
                sqlx::query("DELETE FROM matrix_history WHERE session_id = ?")
                    .bind(session_id)
                    .execute(pool)
                    .await
                    .map_err(|e| MatrixError::HistoryProvider(e.to_string()))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    async fn sqlite_provider(dir: &tempfile::TempDir) -> DatabaseHistoryProvider {
        let storage = StorageManager::connect(StorageBackend::Sqlite {
            path: dir.path().join("history.db"),
        })
        .await
        .unwrap();
        DatabaseHistoryProvider::new(storage)
    }

    #[tokio::test]
    async fn save_and_load_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let provider = sqlite_provider(&dir).await;

        provider.save_message("s1", &Message::user("first")).await.unwrap();
        provider
            .save_message("s1", &Message::assistant("second"))
            .await
            .unwrap();
        provider.save_message("s1", &Message::user("third")).await.unwrap();

        let messages = provider.load_messages("s1").await.unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].text(), "first");
        assert_eq!(messages[2].text(), "third");
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let provider = sqlite_provider(&dir).await;

        provider.save_message("a", &Message::user("for a")).await.unwrap();
        provider.save_message("b", &Message::user("for b")).await.unwrap();

        let a = provider.load_messages("a").await.unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].text(), "for a");
    }

    #[tokio::test]
    async fn replace_then_clear() {
        let dir = tempfile::tempdir().unwrap();
        let provider = sqlite_provider(&dir).await;

        provider.save_message("s", &Message::user("old")).await.unwrap();
        provider
            .replace_messages("s", &[Message::user("new 1"), Message::assistant("new 2")])
            .await
            .unwrap();

        let messages = provider.load_messages("s").await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text(), "new 1");

        provider.clear_session("s").await.unwrap();
        assert!(provider.load_messages("s").await.unwrap().is_empty());
    }

    #[test]
    #[serial]
    fn backend_resolution_prefers_pg_url() {
        std::env::set_var("PG_URL", "postgres://localhost/matrix");
        let backend = StorageBackend::from_env().unwrap();
        assert!(matches!(backend, StorageBackend::Postgres { .. }));
        std::env::remove_var("PG_URL");
    }

    #[test]
    #[serial]
    fn backend_resolution_builds_pg_from_parts() {
        std::env::remove_var("PG_URL");
        std::env::set_var("STORAGE_DATABASE_HOST", "db.internal");
        std::env::set_var("STORAGE_DATABASE_NAME", "matrix");
        std::env::set_var("STORAGE_DATABASE_USER", "svc");
        match StorageBackend::from_env().unwrap() {
            StorageBackend::Postgres { url } => {
                assert!(url.starts_with("postgres://svc@db.internal:5432/matrix"));
            }
            other => panic!("expected postgres, got {other:?}"),
        }
        std::env::remove_var("STORAGE_DATABASE_HOST");
        std::env::remove_var("STORAGE_DATABASE_NAME");
        std::env::remove_var("STORAGE_DATABASE_USER");
    }

    #[test]
    #[serial]
    fn backend_resolution_falls_back_to_sqlite() {
        std::env::remove_var("PG_URL");
        std::env::remove_var("STORAGE_DATABASE_HOST");
        std::env::set_var("STORAGE_DATABASE_PATH", "/tmp/matrix-test");
        std::env::set_var("STORAGE_DATABASE_NAME", "hist.db");
        match StorageBackend::from_env().unwrap() {
            StorageBackend::Sqlite { path } => {
                assert_eq!(path, PathBuf::from("/tmp/matrix-test/hist.db"));
            }
            other => panic!("expected sqlite, got {other:?}"),
        }
        std::env::remove_var("STORAGE_DATABASE_PATH");
        std::env::remove_var("STORAGE_DATABASE_NAME");
    }

    #[test]
    #[serial]
    fn backend_resolution_none_when_unconfigured() {
        for var in [
            "PG_URL",
            "STORAGE_DATABASE_HOST",
            "STORAGE_DATABASE_NAME",
            "STORAGE_DATABASE_PATH",
        ] {
            std::env::remove_var(var);
        }
        assert!(StorageBackend::from_env().is_none());
    }
}
