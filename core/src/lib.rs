// Matrix Core Library
// Memory-augmented conversational agent runtime

pub mod config;
pub mod context;
pub mod event;
pub mod history;
pub mod llm;
pub mod memory;
pub mod prompt;
pub mod reflection;
pub mod session;
pub mod telemetry;
pub mod tools;

// Export core types
pub use config::{Config, EmbeddingConfig, LlmConfig, SystemPromptConfig, ToolServerConfig};
pub use context::{ContentBlock, ContextManager, ImageData, Message, MessageRole, ToolCall};
pub use event::{Event, EventBus, EventHandler, EventPriority};
pub use history::{HistoryProvider, MultiBackendHistoryProvider, StorageManager};
pub use llm::{CompletionModel, LlmService, ProviderClient};
pub use memory::{
    EmbeddingManager, EmbeddingProvider, InMemoryVectorStore, KnowledgeMemoryPipeline,
    MemoryEvent, VectorStore,
};
pub use prompt::PromptManager;
pub use reflection::ReflectionPipeline;
pub use session::{RunOutcome, Session, SessionOptions};
pub use telemetry::MetricsCollector;
pub use tools::{InternalTool, ToolServerConnection, UnifiedToolManager};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MatrixError {
    #[error("Invalid user input: {0}")]
    UserInputInvalid(String),

    #[error("Session not initialized: {0}")]
    NotInitialized(String),

    #[error("Unsupported LLM provider: {0}")]
    UnsupportedProvider(String),

    #[error("Provider transport error: {0}")]
    ProviderTransport(String),

    #[error("Tool loop did not converge within {0} iterations")]
    IterationLimitExceeded(usize),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool timed out: {0}")]
    ToolTimeout(String),

    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    #[error("Embedding system unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Memory pipeline error: {0}")]
    MemoryPipeline(String),

    #[error("Reflection pipeline error: {0}")]
    ReflectionPipeline(String),

    #[error("History provider error: {0}")]
    HistoryProvider(String),

    #[error("Session persistence error during {operation} for session {session_id}: {message}")]
    SessionPersistence {
        operation: String,
        session_id: String,
        message: String,
    },

    #[error("Event bus error: {0}")]
    EventBus(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MatrixError>;

use std::sync::Arc;

use memory::KnowledgeMemoryTool;
use reflection::{ExtractReasoningStepsTool, StoreReasoningMemoryTool};
use tools::{AskMatrixTool, ToolServerManager};

/// Process-wide runtime: shared managers plus a session factory.
///
/// Sessions created from the same `Matrix` share the tool registry, event
/// bus, embedding system, vector store, and prompt manager by reference;
/// each session owns its own context manager and (unless one is injected)
/// its own storage manager.
pub struct Matrix {
    pub config: Config,
    pub event_bus: Arc<EventBus>,
    pub tool_manager: Arc<UnifiedToolManager>,
    pub tool_servers: ToolServerManager,
    pub embedding_manager: Arc<EmbeddingManager>,
    pub vector_store: Arc<dyn VectorStore>,
    pub prompt_manager: Arc<PromptManager>,
    pub metrics: Arc<MetricsCollector>,
}

impl Matrix {
    /// Build a runtime with no embedding drivers: foreground turns work,
    /// memory pipelines stay dormant until drivers are supplied.
    pub async fn new(config: Config) -> Result<Self> {
        Self::with_embedders(config, Vec::new()).await
    }

    /// Build a runtime with concrete embedding drivers (driver internals
    /// live behind `EmbeddingProvider`).
    pub async fn with_embedders(
        config: Config,
        embedders: Vec<Arc<dyn EmbeddingProvider>>,
    ) -> Result<Self> {
        let event_bus = Arc::new(EventBus::new());
        let tool_manager = Arc::new(UnifiedToolManager::from_env(Arc::clone(&event_bus)));
        let tool_servers = ToolServerManager::new(Arc::clone(&tool_manager));
        let embedding_manager = Arc::new(EmbeddingManager::new(embedders));
        let vector_store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
        let prompt_manager = Arc::new(PromptManager::new(config.system_prompt.clone()));

        let metrics = Arc::new(MetricsCollector::new());
        MetricsCollector::attach(&metrics, &event_bus);

        let runtime = Self {
            config,
            event_bus,
            tool_manager,
            tool_servers,
            embedding_manager,
            vector_store,
            prompt_manager,
            metrics,
        };
        runtime.register_builtin_tools();
        Ok(runtime)
    }

    /// Register the internal tool set: knowledge memory (default and
    /// workspace variants), the reflection pair, and the optional
    /// `ask_matrix` umbrella.
    fn register_builtin_tools(&self) {
        let knowledge = KnowledgeMemoryTool::new(
            memory::KNOWLEDGE_TOOL_NAME,
            Arc::clone(&self.embedding_manager),
            Arc::clone(&self.vector_store),
            Arc::clone(&self.prompt_manager),
            Arc::clone(&self.event_bus),
            None,
        );
        self.tool_manager.register_internal(Arc::new(knowledge));

        let workspace = KnowledgeMemoryTool::new(
            memory::WORKSPACE_TOOL_NAME,
            Arc::clone(&self.embedding_manager),
            Arc::clone(&self.vector_store),
            Arc::clone(&self.prompt_manager),
            Arc::clone(&self.event_bus),
            None,
        );
        self.tool_manager.register_internal(Arc::new(workspace));

        self.tool_manager
            .register_internal(Arc::new(ExtractReasoningStepsTool::new()));
        self.tool_manager
            .register_internal(Arc::new(StoreReasoningMemoryTool::new(
                Arc::clone(&self.embedding_manager),
                Arc::clone(&self.vector_store),
            )));

        if config::env_flag("USE_ASK_MATRIX") {
            self.tool_manager
                .register_internal(Arc::new(AskMatrixTool::new(Arc::clone(&self.tool_manager))));
        }
    }

    /// Create a session bound to the shared managers. The session builds
    /// its own storage manager lazily on first use.
    pub fn session(&self, id: impl Into<String>) -> Session {
        Session::new(id.into(), self.config.llm.clone(), self.shared())
    }

    /// Create a session over an injected, shared storage manager. The
    /// session never disconnects a borrowed storage manager.
    pub fn session_with_storage(
        &self,
        id: impl Into<String>,
        storage: Arc<StorageManager>,
    ) -> Session {
        Session::with_storage(id.into(), self.config.llm.clone(), self.shared(), storage)
    }

    fn shared(&self) -> session::SharedServices {
        session::SharedServices {
            event_bus: Arc::clone(&self.event_bus),
            tool_manager: Arc::clone(&self.tool_manager),
            embedding_manager: Arc::clone(&self.embedding_manager),
            vector_store: Arc::clone(&self.vector_store),
            prompt_manager: Arc::clone(&self.prompt_manager),
            evaluation_llm: self.config.evaluation_llm.clone(),
        }
    }

    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!(target: "matrix", "Shutting down Matrix runtime");
        self.tool_servers.shutdown().await;
        self.event_bus.shutdown();
        Ok(())
    }
}
