/// Property-style checks: random append interleavings preserve order and
/// the save-before-return invariant; tool-name collisions resolve
/// deterministically under a fixed strategy.
use async_trait::async_trait;
use matrix_core::context::formatter::OpenAiFormatter;
use matrix_core::context::{ContextManager, Message, MessageRole, ToolCall};
use matrix_core::event::EventBus;
use matrix_core::history::{
    DatabaseHistoryProvider, HistoryProvider, StorageBackend, StorageManager,
};
use matrix_core::tools::{
    ConflictResolution, InternalTool, RemoteToolSpec, ServerMode, ToolContext, ToolDescriptor,
    ToolServerConnection, ToolSource, UnifiedToolManager,
};
use matrix_core::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn random_interleavings_preserve_order_and_durability() {
    let dir = tempfile::tempdir().unwrap();
    let storage = StorageManager::connect(StorageBackend::Sqlite {
        path: dir.path().join("props.db"),
    })
    .await
    .unwrap();
    let provider: Arc<DatabaseHistoryProvider> =
        Arc::new(DatabaseHistoryProvider::new(storage));

    let mut rng = StdRng::seed_from_u64(0x5eed);

    for round in 0..8 {
        let session_id = format!("prop-{round}");
        let ctx = ContextManager::new(session_id.clone(), Arc::new(OpenAiFormatter));
        ctx.bind_history_provider(Arc::clone(&provider) as Arc<dyn HistoryProvider>)
            .await;

        let mut expected: Vec<Message> = Vec::new();
        let ops = rng.gen_range(4..16);
        for i in 0..ops {
            match rng.gen_range(0..3u8) {
                0 => {
                    let msg = Message::user(format!("user {round}-{i}"));
                    expected.push(msg.clone());
                    ctx.add_user_message(msg).await;
                }
                1 => {
                    let text = format!("assistant {round}-{i}");
                    expected.push(Message::assistant(text.clone()));
                    ctx.add_assistant_message(text).await;
                }
                _ => {
                    let call_id = format!("call-{round}-{i}");
                    let payload = json!(format!("result {i}"));
                    expected.push(Message::tool_result(call_id.clone(), "probe", &payload));
                    ctx.add_tool_result(call_id, "probe", &payload).await;
                }
            }

            // Save-before-return: the store already holds everything
            // appended so far.
            let persisted = provider.load_messages(&session_id).await.unwrap();
            assert_eq!(persisted.len(), expected.len());
        }

        assert_eq!(ctx.get_raw_messages().await, expected);
        assert_eq!(provider.load_messages(&session_id).await.unwrap(), expected);
    }
}

#[tokio::test]
async fn tool_roles_survive_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let storage = StorageManager::connect(StorageBackend::Sqlite {
        path: dir.path().join("roles.db"),
    })
    .await
    .unwrap();
    let provider = DatabaseHistoryProvider::new(storage);

    let assistant = Message::assistant_with_tool_calls(
        "calling",
        vec![ToolCall::new("c1", "probe", r#"{"x":1}"#)],
    );
    provider.save_message("roles", &assistant).await.unwrap();
    provider
        .save_message("roles", &Message::tool_result("c1", "probe", &json!("ok")))
        .await
        .unwrap();

    let loaded = provider.load_messages("roles").await.unwrap();
    assert_eq!(loaded[0].role, MessageRole::Assistant);
    assert_eq!(loaded[0].tool_calls[0].id, "c1");
    assert_eq!(loaded[1].role, MessageRole::Tool);
    assert_eq!(loaded[1].tool_call_id.as_deref(), Some("c1"));
}

// ----- collision determinism ------------------------------------------------

struct NamedTool(&'static str);

#[async_trait]
impl InternalTool for NamedTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.0.to_string(),
            description: "internal".to_string(),
            input_schema: json!({"type": "object"}),
            source: ToolSource::Internal,
            agent_accessible: true,
        }
    }

    async fn invoke(&self, _args: Value, _ctx: ToolContext) -> Result<Value> {
        Ok(json!("internal"))
    }
}

struct OneToolServer(&'static str);

#[async_trait]
impl ToolServerConnection for OneToolServer {
    fn name(&self) -> &str {
        self.0
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<RemoteToolSpec>> {
        Ok(vec![RemoteToolSpec {
            name: "probe".to_string(),
            description: None,
            input_schema: json!({"type": "object"}),
        }])
    }

    async fn call_tool(&self, _name: &str, _args: Value) -> Result<Value> {
        Ok(json!("remote"))
    }
}

fn manager_with_collision(strategy: ConflictResolution) -> Arc<UnifiedToolManager> {
    let manager = Arc::new(UnifiedToolManager::new(
        Arc::new(EventBus::new()),
        Duration::from_secs(1),
        strategy,
        ServerMode::Default,
    ));
    manager.register_internal(Arc::new(NamedTool("probe")));
    let server = Arc::new(OneToolServer("srv"));
    manager.register_remote(
        server,
        RemoteToolSpec {
            name: "probe".to_string(),
            description: None,
            input_schema: json!({"type": "object"}),
        },
    );
    manager
}

#[tokio::test]
async fn collisions_resolve_deterministically() {
    // first-wins: the internal tool registered first keeps the name, on
    // every call.
    let manager = manager_with_collision(ConflictResolution::FirstWins);
    for _ in 0..10 {
        let out = manager
            .execute_tool_without_loading("probe", json!({}))
            .await
            .unwrap();
        assert_eq!(out, json!("internal"));
    }

    // prefer-remote: the remote side wins the bare name.
    let manager = manager_with_collision(ConflictResolution::PreferRemote);
    let out = manager
        .execute_tool_without_loading("probe", json!({}))
        .await
        .unwrap();
    assert_eq!(out, json!("remote"));

    // prefix-internal: remote wins the bare name, the internal tool stays
    // reachable under the prefix.
    let manager = manager_with_collision(ConflictResolution::PrefixInternal);
    let bare = manager
        .execute_tool_without_loading("probe", json!({}))
        .await
        .unwrap();
    assert_eq!(bare, json!("remote"));
    let prefixed = manager
        .execute_tool_without_loading("internal:probe", json!({}))
        .await
        .unwrap();
    assert_eq!(prefixed, json!("internal"));

    // error: ambiguous names refuse to execute.
    let manager = manager_with_collision(ConflictResolution::Error);
    assert!(manager
        .execute_tool_without_loading("probe", json!({}))
        .await
        .is_err());
}
