/// Integration tests for the session lifecycle: turns against a scripted
/// provider, durable history, serialize/deserialize round-trips, and
/// cross-session isolation.
use async_trait::async_trait;
use matrix_core::context::MessageRole;
use matrix_core::event::EventBus;
use matrix_core::history::{StorageBackend, StorageManager};
use matrix_core::llm::{ChatBackend, ProviderRequest, ProviderResponse};
use matrix_core::memory::{EmbeddingManager, InMemoryVectorStore};
use matrix_core::prompt::PromptManager;
use matrix_core::session::{Session, SharedServices};
use matrix_core::tools::UnifiedToolManager;
use matrix_core::{LlmConfig, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Backend that answers `reply #N` for the N-th call.
struct CountingBackend {
    calls: AtomicUsize,
}

impl CountingBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ChatBackend for CountingBackend {
    fn provider(&self) -> &str {
        "openai"
    }

    async fn chat(&self, _request: &ProviderRequest) -> Result<ProviderResponse> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ProviderResponse {
            text: format!("reply #{n}"),
            ..Default::default()
        })
    }

    async fn direct(&self, _prompt: &str, _system: Option<&str>) -> Result<String> {
        Ok("direct".to_string())
    }
}

fn shared_services() -> SharedServices {
    let bus = Arc::new(EventBus::new());
    SharedServices {
        event_bus: Arc::clone(&bus),
        tool_manager: Arc::new(UnifiedToolManager::from_env(bus)),
        embedding_manager: Arc::new(EmbeddingManager::new(Vec::new())),
        vector_store: Arc::new(InMemoryVectorStore::new()),
        prompt_manager: Arc::new(PromptManager::new(None)),
        evaluation_llm: None,
    }
}

async fn storage_in(dir: &tempfile::TempDir) -> Arc<StorageManager> {
    StorageManager::connect(StorageBackend::Sqlite {
        path: dir.path().join("sessions.db"),
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn turn_appends_user_then_assistant() {
    let session = Session::new("turn-order".to_string(), LlmConfig::default(), shared_services());
    session.init().await.unwrap();
    session.set_chat_backend(CountingBackend::new()).await;

    let outcome = session.run("hello there", None, false, None).await.unwrap();
    assert_eq!(outcome.response, "reply #1");
    outcome.background_operations.wait().await;

    let record = session.serialize().await.unwrap();
    let roles: Vec<MessageRole> = record
        .conversation_history
        .iter()
        .map(|m| m.role)
        .collect();
    assert_eq!(roles, vec![MessageRole::User, MessageRole::Assistant]);
    assert_eq!(record.conversation_history[0].text(), "hello there");
}

#[tokio::test]
async fn serialize_restore_roundtrip_with_storage() {
    let dir = tempfile::tempdir().unwrap();
    let storage = storage_in(&dir).await;
    let services = shared_services();

    let session = Session::with_storage(
        "roundtrip".to_string(),
        LlmConfig::default(),
        services.clone(),
        Arc::clone(&storage),
    );
    session.init().await.unwrap();
    session.set_chat_backend(CountingBackend::new()).await;

    for input in ["first turn", "second turn", "third turn"] {
        let outcome = session.run(input, None, false, None).await.unwrap();
        outcome.background_operations.wait().await;
    }

    let record = session.serialize().await.unwrap();
    assert_eq!(record.conversation_history.len(), 6);
    assert_eq!(record.version, matrix_core::session::SESSION_RECORD_VERSION);
    assert!(record.metadata.history_enabled);
    assert_eq!(record.metadata.history_backend, "sqlite");

    let before: Vec<_> = record.conversation_history.clone();

    // Restore into a fresh session and compare transcripts.
    let restored = Session::deserialize(record, services, LlmConfig::default())
        .await
        .unwrap();
    let after = restored.serialize().await.unwrap().conversation_history;
    assert_eq!(before, after);

    // A new turn appends after the restored tail.
    restored.set_chat_backend(CountingBackend::new()).await;
    let outcome = restored.run("fourth turn", None, false, None).await.unwrap();
    outcome.background_operations.wait().await;

    let final_record = restored.serialize().await.unwrap();
    assert_eq!(final_record.conversation_history.len(), 8);
    assert_eq!(final_record.conversation_history[6].text(), "fourth turn");
}

#[tokio::test]
async fn concurrent_sessions_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let storage = storage_in(&dir).await;
    let services = shared_services();

    let a = Arc::new(Session::with_storage(
        "iso-a".to_string(),
        LlmConfig::default(),
        services.clone(),
        Arc::clone(&storage),
    ));
    let b = Arc::new(Session::with_storage(
        "iso-b".to_string(),
        LlmConfig::default(),
        services,
        storage,
    ));
    a.init().await.unwrap();
    b.init().await.unwrap();
    a.set_chat_backend(CountingBackend::new()).await;
    b.set_chat_backend(CountingBackend::new()).await;

    let (ra, rb) = tokio::join!(
        a.run("message for a", None, false, None),
        b.run("message for b", None, false, None),
    );
    ra.unwrap().background_operations.wait().await;
    rb.unwrap().background_operations.wait().await;

    let record_a = a.serialize().await.unwrap();
    let record_b = b.serialize().await.unwrap();
    assert_eq!(record_a.conversation_history.len(), 2);
    assert_eq!(record_b.conversation_history.len(), 2);
    assert_eq!(record_a.conversation_history[0].text(), "message for a");
    assert_eq!(record_b.conversation_history[0].text(), "message for b");
}

#[tokio::test]
async fn refresh_reloads_from_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let storage = storage_in(&dir).await;
    let services = shared_services();

    let session = Session::with_storage(
        "refresh".to_string(),
        LlmConfig::default(),
        services,
        storage,
    );
    session.init().await.unwrap();
    session.set_chat_backend(CountingBackend::new()).await;

    let outcome = session.run("remember this", None, false, None).await.unwrap();
    outcome.background_operations.wait().await;

    let count = session.refresh_conversation_history().await.unwrap();
    assert_eq!(count, 2);

    let record = session.serialize().await.unwrap();
    assert_eq!(record.conversation_history[0].text(), "remember this");
}

#[tokio::test]
async fn version_mismatch_restores_best_effort() {
    let services = shared_services();
    let session = Session::new("vmm".to_string(), LlmConfig::default(), services.clone());
    session.init().await.unwrap();
    session.set_chat_backend(CountingBackend::new()).await;
    let outcome = session.run("hi", None, false, None).await.unwrap();
    outcome.background_operations.wait().await;

    let mut record = session.serialize().await.unwrap();
    record.version = "0.1".to_string();

    let restored = Session::deserialize(record, services, LlmConfig::default())
        .await
        .unwrap();
    let transcript = restored.serialize().await.unwrap().conversation_history;
    assert_eq!(transcript.len(), 2);
}
