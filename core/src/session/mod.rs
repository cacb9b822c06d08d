//! Session runtime.
//!
//! A session is one logical conversation: it owns its context manager and
//! (unless one was injected) its storage manager, shares everything else,
//! and interleaves foreground response generation with the background
//! memory pipelines. Heavy dependencies are built lazily behind
//! once-guards that do not latch on failure.

pub mod record;

pub use record::{HistoryRecord, RecordMetadata, SESSION_RECORD_VERSION};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{self, LlmConfig};
use crate::context::formatter::formatter_for_provider;
use crate::context::{ContextManager, ImageData};
use crate::event::{Event, EventBus};
use crate::history::{
    DatabaseHistoryProvider, HistoryProvider, MultiBackendHistoryProvider, StorageBackend,
    StorageManager,
};
use crate::llm::service::ChatBackend;
use crate::llm::{CompletionModel, LlmService, ProviderClient};
use crate::memory::{
    EmbeddingManager, InteractionData, KnowledgeMemoryPipeline, MemoryRunOverrides,
    MetadataSchema, VectorStore,
};
use crate::prompt::PromptManager;
use crate::reflection::ReflectionPipeline;
use crate::tools::UnifiedToolManager;
use crate::{MatrixError, Result};

/// Cooperative backoff before the first storage construction, so several
/// sessions starting at once do not race to build identical connections.
const STORAGE_CREATION_BACKOFF: Duration = Duration::from_millis(25);

/// Process-wide managers shared by every session.
#[derive(Clone)]
pub struct SharedServices {
    pub event_bus: Arc<EventBus>,
    pub tool_manager: Arc<UnifiedToolManager>,
    pub embedding_manager: Arc<EmbeddingManager>,
    pub vector_store: Arc<dyn VectorStore>,
    pub prompt_manager: Arc<PromptManager>,
    /// Config for the distinct reasoning-evaluation model.
    pub evaluation_llm: Option<LlmConfig>,
}

/// Storage ownership: an exclusive session builds and disconnects its
/// storage manager; a borrowed one only uses it.
enum StorageOwnership {
    Exclusive(OnceCell<Option<Arc<StorageManager>>>),
    Borrowed(Arc<StorageManager>),
}

/// Per-run options for one `run` call.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub context_overrides: Option<Value>,
    pub metadata_overrides: Option<Value>,
    pub conversation_topic: Option<String>,
}

/// Handle on the background memory work for one turn. Await it before
/// shutdown, or drop it for fire-and-forget.
#[derive(Debug)]
pub struct BackgroundOperations {
    handle: Option<JoinHandle<()>>,
}

impl BackgroundOperations {
    fn noop() -> Self {
        Self { handle: None }
    }

    /// Wait for the memory and reflection pipelines to finish. Errors are
    /// already swallowed inside the job.
    pub async fn wait(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    pub fn is_active(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }
}

/// Result of one foreground turn.
#[derive(Debug)]
pub struct RunOutcome {
    pub response: String,
    pub background_operations: BackgroundOperations,
}

pub struct Session {
    id: String,
    llm_config: LlmConfig,
    services: SharedServices,
    storage: StorageOwnership,

    // Lazily wired subsystems. OnceCell guards do not latch on failure:
    // an error leaves the cell empty and a later call retries.
    ctx: OnceCell<Arc<ContextManager>>,
    llm: OnceCell<Arc<LlmService>>,
    history_restored: AtomicBool,

    // At most one foreground run per session id.
    turn_lock: Mutex<()>,

    memory_metadata: RwLock<Option<Value>>,
    metadata_schema: RwLock<Option<MetadataSchema>>,
    chat_backend: RwLock<Option<Arc<dyn ChatBackend>>>,

    created_at: DateTime<Utc>,
    last_activity: RwLock<DateTime<Utc>>,
}

impl Session {
    pub fn new(id: String, llm_config: LlmConfig, services: SharedServices) -> Self {
        Self::build(id, llm_config, services, StorageOwnership::Exclusive(OnceCell::new()))
    }

    pub fn with_storage(
        id: String,
        llm_config: LlmConfig,
        services: SharedServices,
        storage: Arc<StorageManager>,
    ) -> Self {
        Self::build(id, llm_config, services, StorageOwnership::Borrowed(storage))
    }

    fn build(
        id: String,
        llm_config: LlmConfig,
        services: SharedServices,
        storage: StorageOwnership,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            llm_config,
            services,
            storage,
            ctx: OnceCell::new(),
            llm: OnceCell::new(),
            history_restored: AtomicBool::new(false),
            turn_lock: Mutex::new(()),
            memory_metadata: RwLock::new(None),
            metadata_schema: RwLock::new(None),
            chat_backend: RwLock::new(None),
            created_at: now,
            last_activity: RwLock::new(now),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Default per-session memory metadata merged under every run's
    /// overrides.
    pub async fn set_memory_metadata(&self, metadata: Option<Value>) {
        *self.memory_metadata.write().await = metadata;
    }

    /// Validation hook for merged memory metadata. Not serialized; must be
    /// re-supplied after restore.
    pub async fn set_metadata_schema(&self, schema: Option<MetadataSchema>) {
        *self.metadata_schema.write().await = schema;
    }

    /// Replace the provider transport (tests and embedding applications).
    pub async fn set_chat_backend(&self, backend: Arc<dyn ChatBackend>) {
        *self.chat_backend.write().await = Some(backend);
    }

    // ----- lifecycle -------------------------------------------------------

    /// Set up the context manager with the provider formatter. Idempotent;
    /// fails with `UnsupportedProvider` on an unknown provider string.
    pub async fn init(&self) -> Result<()> {
        self.ctx
            .get_or_try_init(|| async {
                let formatter = formatter_for_provider(&self.llm_config.provider)?;
                let ctx = Arc::new(ContextManager::new(self.id.clone(), formatter));
                ctx.set_system_prompt(
                    self.services.prompt_manager.system_prompt().map(|s| s.to_string()),
                )
                .await;

                // A borrowed storage manager binds its provider up front;
                // exclusive storage stays lazy until the first turn.
                if let StorageOwnership::Borrowed(ref storage) = self.storage {
                    ctx.bind_history_provider(Arc::new(DatabaseHistoryProvider::new(Arc::clone(
                        storage,
                    ))))
                    .await;
                }

                info!(target: "session", session = %self.id, provider = %self.llm_config.provider, "Session initialized");
                Ok::<_, MatrixError>(ctx)
            })
            .await?;
        Ok(())
    }

    fn context(&self) -> Result<Arc<ContextManager>> {
        self.ctx
            .get()
            .cloned()
            .ok_or_else(|| MatrixError::NotInitialized(self.id.clone()))
    }

    /// One foreground turn. Returns the response and a handle on the
    /// background memory job.
    pub async fn run(
        &self,
        input: &str,
        image_data: Option<&ImageData>,
        stream: bool,
        options: Option<SessionOptions>,
    ) -> Result<RunOutcome> {
        if input.trim().is_empty() {
            return Err(MatrixError::UserInputInvalid(
                "input must be a non-empty string".to_string(),
            ));
        }
        if let Some(image) = image_data {
            image.validate()?;
        }
        let ctx = self.context()?;

        let _turn = self.turn_lock.lock().await;

        let llm = self.get_llm_lazy(&ctx).await?;
        self.ensure_history(&ctx).await;

        self.services.event_bus.publish(
            Event::new("llm:thinking", serde_json::json!({"phase": "turnStarted"}))
                .for_session(self.id.clone()),
        );

        let response = llm.generate(input, image_data, stream).await?;
        *self.last_activity.write().await = Utc::now();

        let background_operations = self.spawn_background(&ctx, options.unwrap_or_default()).await;

        Ok(RunOutcome {
            response,
            background_operations,
        })
    }

    /// Tear down the history provider connection when this session owns
    /// its storage exclusively. In-flight background jobs are not
    /// cancelled; they finish on their own.
    pub async fn disconnect(&self) -> Result<()> {
        if let StorageOwnership::Exclusive(ref cell) = self.storage {
            if let Some(Some(_storage)) = cell.get() {
                if let Some(ctx) = self.ctx.get() {
                    if let Some(provider) = ctx.history_provider().await {
                        provider.close().await?;
                    }
                }
            }
        }
        self.services.event_bus.remove_session(&self.id);
        info!(target: "session", session = %self.id, "Session disconnected");
        Ok(())
    }

    // ----- lazy wiring -----------------------------------------------------

    async fn get_llm_lazy(&self, ctx: &Arc<ContextManager>) -> Result<Arc<LlmService>> {
        self.llm
            .get_or_try_init(|| async {
                let backend: Arc<dyn ChatBackend> = match self.chat_backend.read().await.clone() {
                    Some(backend) => backend,
                    None => Arc::new(ProviderClient::new(self.llm_config.clone())?),
                };
                Ok::<_, MatrixError>(Arc::new(LlmService::new(
                    backend,
                    Arc::clone(ctx),
                    Arc::clone(&self.services.tool_manager),
                    Arc::clone(&self.services.event_bus),
                    self.id.clone(),
                    self.llm_config.max_iterations,
                )))
            })
            .await
            .cloned()
    }

    async fn get_storage_lazy(&self) -> Option<Arc<StorageManager>> {
        match &self.storage {
            StorageOwnership::Borrowed(storage) => Some(Arc::clone(storage)),
            // An error leaves the guard empty so the next turn retries;
            // only a resolved backend (or resolved absence) latches.
            StorageOwnership::Exclusive(cell) => {
                let built = cell
                    .get_or_try_init(|| async {
                        tokio::time::sleep(STORAGE_CREATION_BACKOFF).await;
                        StorageManager::from_env_cached().await
                    })
                    .await;
                match built {
                    Ok(storage) => storage.clone(),
                    Err(e) => {
                        warn!(target: "session", session = %self.id, error = %e, "Storage construction failed; history disabled for this turn");
                        None
                    }
                }
            }
        }
    }

    /// Bind the history provider (per the selection policy) and restore
    /// the transcript on the first turn.
    async fn ensure_history(&self, ctx: &Arc<ContextManager>) {
        if !ctx.has_history_provider().await {
            if let Some(provider) = self.build_history_provider().await {
                ctx.bind_history_provider(provider).await;
            }
        }

        if ctx.has_history_provider().await && !self.history_restored.swap(true, Ordering::SeqCst)
        {
            match ctx.restore_history().await {
                Ok(count) => {
                    debug!(target: "session", session = %self.id, count, "History restored")
                }
                Err(e) => {
                    // Leave the flag set; refresh_conversation_history is
                    // the recovery path with full fallbacks.
                    warn!(target: "session", session = %self.id, error = %e, "History restore failed")
                }
            }
        }
    }

    /// Selection policy: multi-backend when `MULTI_BACKEND` is set, a
    /// plain database provider when storage is configured, otherwise
    /// history stays disabled and the context is ephemeral.
    async fn build_history_provider(&self) -> Option<Arc<dyn HistoryProvider>> {
        let storage = self.get_storage_lazy().await?;
        let primary: Arc<dyn HistoryProvider> =
            Arc::new(DatabaseHistoryProvider::new(Arc::clone(&storage)));

        if config::env_flag("MULTI_BACKEND") {
            match self.build_backup_provider(&storage).await {
                Some(backup) => {
                    return Some(Arc::new(MultiBackendHistoryProvider::new(primary, backup)));
                }
                None => {
                    warn!(target: "session", session = %self.id, "Backup storage unavailable; using single backend");
                }
            }
        }
        Some(primary)
    }

    /// The backup side of the multi-backend composite: a sibling SQLite
    /// database, regardless of the primary backend.
    async fn build_backup_provider(
        &self,
        storage: &Arc<StorageManager>,
    ) -> Option<Arc<dyn HistoryProvider>> {
        let path = match storage.backend() {
            StorageBackend::Sqlite { path } => path.with_extension("backup.db"),
            StorageBackend::Postgres { .. } => {
                let dir = std::env::var("STORAGE_DATABASE_PATH")
                    .unwrap_or_else(|_| ".matrix".to_string());
                std::path::PathBuf::from(dir).join("backup.db")
            }
        };
        match StorageManager::connect(StorageBackend::Sqlite { path }).await {
            Ok(backup) => Some(Arc::new(DatabaseHistoryProvider::new(backup))),
            Err(e) => {
                warn!(target: "session", error = %e, "Failed to open backup storage");
                None
            }
        }
    }

    // ----- background pipeline ---------------------------------------------

    /// Start the memory job for the turn that just finished. The job
    /// yields first so the response reaches the caller before any memory
    /// work runs.
    async fn spawn_background(
        &self,
        ctx: &Arc<ContextManager>,
        options: SessionOptions,
    ) -> BackgroundOperations {
        let messages = ctx.get_raw_messages().await;
        if messages.is_empty() {
            return BackgroundOperations::noop();
        }
        let interaction = InteractionData::from_transcript_tail(&messages);

        let session_id = self.id.clone();
        let services = self.services.clone();
        let session_metadata = self.memory_metadata.read().await.clone();
        let metadata_schema = self.metadata_schema.read().await.clone();
        let overrides = MemoryRunOverrides {
            context_overrides: options.context_overrides,
            metadata_overrides: options.metadata_overrides,
            conversation_topic: options.conversation_topic,
        };
        let user_input = interaction.user_text.clone();

        let handle = tokio::spawn(async move {
            // Hand the response back before doing any memory work.
            tokio::task::yield_now().await;

            let knowledge = KnowledgeMemoryPipeline::new(
                Arc::clone(&services.tool_manager),
                Arc::clone(&services.embedding_manager),
                Arc::clone(&services.event_bus),
            );
            knowledge
                .run(
                    &session_id,
                    &interaction,
                    session_metadata.as_ref(),
                    metadata_schema.as_ref(),
                    &overrides,
                )
                .await;

            let evaluator: Option<Arc<dyn CompletionModel>> = services
                .evaluation_llm
                .clone()
                .and_then(|cfg| match ProviderClient::new(cfg) {
                    Ok(client) => Some(Arc::new(client) as Arc<dyn CompletionModel>),
                    Err(e) => {
                        warn!(target: "session", error = %e, "Evaluation model unavailable");
                        None
                    }
                });
            let reflection = ReflectionPipeline::new(
                Arc::clone(&services.tool_manager),
                Arc::clone(&services.embedding_manager),
                Arc::clone(&services.prompt_manager),
                Arc::clone(&services.event_bus),
                evaluator,
            );
            reflection.run(&session_id, &user_input).await;
        });

        BackgroundOperations {
            handle: Some(handle),
        }
    }

    // ----- persistence -----------------------------------------------------

    /// Capture the session as a version-stamped record. Prefers the
    /// history provider's view of the transcript; falls back to the
    /// context manager.
    pub async fn serialize(&self) -> Result<HistoryRecord> {
        let ctx = self.context().map_err(|e| self.persistence_error("serialize", e))?;

        let provider = ctx.history_provider().await;
        let (conversation_history, history_backend) = match &provider {
            Some(provider) => match provider.load_messages(&self.id).await {
                Ok(messages) => (messages, provider.backend_name().to_string()),
                Err(e) => {
                    warn!(target: "session", session = %self.id, error = %e, "Provider read failed during serialize; using context manager");
                    (ctx.get_raw_messages().await, "context".to_string())
                }
            },
            None => (ctx.get_raw_messages().await, "none".to_string()),
        };

        Ok(HistoryRecord {
            session_id: self.id.clone(),
            conversation_history,
            metadata: RecordMetadata {
                created_at: self.created_at,
                last_activity: *self.last_activity.read().await,
                history_enabled: provider.is_some(),
                history_backend,
                session_memory_metadata: self.memory_metadata.read().await.clone(),
                environment: config::environment_tag(),
            },
            options: Some(serde_json::to_value(&self.llm_config)?),
            version: SESSION_RECORD_VERSION.to_string(),
            serialized_at: Utc::now(),
        })
    }

    /// Rebuild a session from a record. The provider history is cleared
    /// and every message re-saved in order before the context manager is
    /// restored, so store and memory agree afterwards.
    pub async fn deserialize(
        record: HistoryRecord,
        services: SharedServices,
        fallback_config: LlmConfig,
    ) -> Result<Session> {
        if record.version != SESSION_RECORD_VERSION {
            warn!(
                target: "session",
                session = %record.session_id,
                found = %record.version,
                expected = %SESSION_RECORD_VERSION,
                "Session record version mismatch; restoring best-effort"
            );
        }

        let llm_config = record
            .options
            .clone()
            .and_then(|v| serde_json::from_value::<LlmConfig>(v).ok())
            .unwrap_or(fallback_config);

        let session = Session::new(record.session_id.clone(), llm_config, services);
        session.init().await?;
        let ctx = session.context()?;

        session
            .set_memory_metadata(record.metadata.session_memory_metadata.clone())
            .await;

        if let Some(provider) = session.bind_provider_for_restore(&ctx).await {
            provider
                .clear_session(&record.session_id)
                .await
                .map_err(|e| persistence_error_for(&record.session_id, "deserialize", e))?;
            for message in &record.conversation_history {
                provider
                    .save_message(&record.session_id, message)
                    .await
                    .map_err(|e| persistence_error_for(&record.session_id, "deserialize", e))?;
            }
        }

        ctx.set_messages(record.conversation_history).await;
        session.history_restored.store(true, Ordering::SeqCst);

        Ok(session)
    }

    async fn bind_provider_for_restore(
        &self,
        ctx: &Arc<ContextManager>,
    ) -> Option<Arc<dyn HistoryProvider>> {
        if let Some(provider) = ctx.history_provider().await {
            return Some(provider);
        }
        let provider = self.build_history_provider().await?;
        ctx.bind_history_provider(Arc::clone(&provider)).await;
        Some(provider)
    }

    /// Clear and re-load the transcript, trying the three restoration
    /// strategies in order: provider-driven restore, bulk set, manual
    /// append loop.
    pub async fn refresh_conversation_history(&self) -> Result<usize> {
        let ctx = self.context()?;
        ctx.clear_messages().await;

        let provider = match self.bind_provider_for_restore(&ctx).await {
            Some(provider) => provider,
            None => {
                debug!(target: "session", session = %self.id, "No history provider; nothing to refresh");
                return Ok(0);
            }
        };

        // (a) provider-driven restore
        match ctx.restore_history().await {
            Ok(count) => return Ok(count),
            Err(e) => {
                warn!(target: "session", session = %self.id, error = %e, "Provider-driven restore failed; trying bulk set")
            }
        }

        // (b) bulk set
        match provider.load_messages(&self.id).await {
            Ok(messages) => {
                let count = messages.len();
                ctx.set_messages(messages).await;
                return Ok(count);
            }
            Err(e) => {
                warn!(target: "session", session = %self.id, error = %e, "Bulk restore failed; trying per-message append")
            }
        }

        // (c) manual append loop; tolerate individual failures
        let messages = provider
            .load_messages(&self.id)
            .await
            .map_err(|e| self.persistence_error("refresh", e))?;
        let mut appended = 0;
        for message in messages {
            ctx.append_restored_message(message).await;
            appended += 1;
        }
        Ok(appended)
    }

    fn persistence_error(&self, operation: &str, source: MatrixError) -> MatrixError {
        persistence_error_for(&self.id, operation, source)
    }
}

fn persistence_error_for(session_id: &str, operation: &str, source: MatrixError) -> MatrixError {
    MatrixError::SessionPersistence {
        operation: operation.to_string(),
        session_id: session_id.to_string(),
        message: source.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;
    use crate::memory::InMemoryVectorStore;
    use crate::tools::{ConflictResolution, ServerMode};

    fn shared_services() -> SharedServices {
        let bus = Arc::new(EventBus::new());
        SharedServices {
            event_bus: Arc::clone(&bus),
            tool_manager: Arc::new(UnifiedToolManager::new(
                bus,
                Duration::from_secs(5),
                ConflictResolution::FirstWins,
                ServerMode::Default,
            )),
            embedding_manager: Arc::new(EmbeddingManager::new(Vec::new())),
            vector_store: Arc::new(InMemoryVectorStore::new()),
            prompt_manager: Arc::new(PromptManager::new(None)),
            evaluation_llm: None,
        }
    }

    #[tokio::test]
    async fn run_before_init_fails() {
        let session = Session::new("s1".to_string(), LlmConfig::default(), shared_services());
        let err = session.run("hello", None, false, None).await.unwrap_err();
        assert!(matches!(err, MatrixError::NotInitialized(_)));
    }

    #[tokio::test]
    async fn empty_input_is_rejected() {
        let session = Session::new("s1".to_string(), LlmConfig::default(), shared_services());
        session.init().await.unwrap();
        let err = session.run("   ", None, false, None).await.unwrap_err();
        assert!(matches!(err, MatrixError::UserInputInvalid(_)));
    }

    #[tokio::test]
    async fn malformed_image_is_rejected() {
        let session = Session::new("s1".to_string(), LlmConfig::default(), shared_services());
        session.init().await.unwrap();
        let image = ImageData {
            image: String::new(),
            mime_type: "image/png".to_string(),
        };
        let err = session
            .run("look at this", Some(&image), false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, MatrixError::UserInputInvalid(_)));
    }

    #[tokio::test]
    async fn unsupported_provider_fails_at_init() {
        let config = LlmConfig {
            provider: "mystery".to_string(),
            ..Default::default()
        };
        let session = Session::new("s1".to_string(), config, shared_services());
        assert!(matches!(
            session.init().await,
            Err(MatrixError::UnsupportedProvider(_))
        ));
        // The guard did not latch; a later init with the same config fails
        // the same way instead of reporting success.
        assert!(session.init().await.is_err());
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let session = Session::new("s1".to_string(), LlmConfig::default(), shared_services());
        session.init().await.unwrap();
        session.init().await.unwrap();
    }
}
