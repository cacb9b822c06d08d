//! Internal knowledge-memory tool.
//!
//! Runs the extract → decide → persist sequence for one interaction. Two
//! instances are registered (default knowledge and workspace memory); both
//! share the embedding system and the vector store.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::decision::{DecisionEngine, MemoryAction, MemoryEvent, MemoryOptions};
use super::embedding::{embeddings_enabled, EmbeddingManager};
use super::extraction::{ExtractedFact, FactExtractor};
use super::store::{allocate_knowledge_id, SearchHit, VectorStore, KNOWLEDGE_COLLECTION};
use crate::event::{Event, EventBus};
use crate::llm::CompletionModel;
use crate::prompt::PromptManager;
use crate::tools::{InternalTool, ToolContext, ToolDescriptor, ToolSource};
use crate::Result;

pub const KNOWLEDGE_TOOL_NAME: &str = "knowledge_memory";
pub const WORKSPACE_TOOL_NAME: &str = "workspace_memory";

pub struct KnowledgeMemoryTool {
    name: &'static str,
    embeddings: Arc<EmbeddingManager>,
    store: Arc<dyn VectorStore>,
    prompts: Arc<PromptManager>,
    bus: Arc<EventBus>,
    decision_model: Option<Arc<dyn CompletionModel>>,
    extractor: FactExtractor,
}

impl KnowledgeMemoryTool {
    pub fn new(
        name: &'static str,
        embeddings: Arc<EmbeddingManager>,
        store: Arc<dyn VectorStore>,
        prompts: Arc<PromptManager>,
        bus: Arc<EventBus>,
        decision_model: Option<Arc<dyn CompletionModel>>,
    ) -> Self {
        Self {
            name,
            embeddings,
            store,
            prompts,
            bus,
            decision_model,
            extractor: FactExtractor::new(),
        }
    }

    async fn process_fact(
        &self,
        fact: &ExtractedFact,
        context: &Value,
        session_id: Option<&str>,
        engine: &DecisionEngine,
    ) -> Result<Value> {
        let options = engine.options().clone();

        // Embed the fact. A failure has already flipped the global latch;
        // record the fallback ADD and move on without persistence.
        let vector = match self.embeddings.embed(&fact.text).await {
            Ok(v) => v,
            Err(e) => {
                let mut event = Event::new(
                    "memory:operationFailed",
                    json!({"stage": "embed", "error": e.to_string()}),
                );
                if let Some(session) = session_id {
                    event = event.for_session(session);
                }
                self.bus.publish(event);
                return Ok(Self::action_json(
                    fact,
                    &MemoryAction {
                        event: MemoryEvent::Add,
                        confidence: 0.6,
                        quality_source: super::decision::QualitySource::Heuristic,
                        target_memory_id: None,
                        old_memory: None,
                    },
                    None,
                ));
            }
        };

        let search_started = Instant::now();
        let hits = self
            .store
            .search(KNOWLEDGE_COLLECTION, &vector, options.max_similar_results)
            .await?;
        let search_ms = search_started.elapsed().as_secs_f64() * 1000.0;
        let mut event = Event::new(
            "memory:searchCompleted",
            json!({"duration_ms": search_ms, "hits": hits.len()}),
        );
        if let Some(session) = session_id {
            event = event.for_session(session);
        }
        self.bus.publish(event);

        let relevant: Vec<SearchHit> = hits
            .into_iter()
            .filter(|h| h.score >= options.similarity_threshold)
            .collect();

        let action = engine.decide(&fact.text, &relevant, context).await;

        // Latch re-read before touching the store: a concurrent embedding
        // failure mid-run must stop persistence too.
        if embeddings_enabled() {
            self.persist(fact, &action, vector).await?;
        }

        Ok(Self::action_json(fact, &action, action.target_memory_id))
    }

    async fn persist(
        &self,
        fact: &ExtractedFact,
        action: &MemoryAction,
        vector: Vec<f32>,
    ) -> Result<()> {
        match action.event {
            MemoryEvent::Add => {
                let id = allocate_knowledge_id(self.store.as_ref()).await?;
                let payload = Self::payload(fact, action, id);
                self.store
                    .insert(KNOWLEDGE_COLLECTION, id, vector, payload)
                    .await?;
                debug!(target: "memory", id, "Inserted knowledge memory");
            }
            MemoryEvent::Update => {
                if let Some(id) = action.target_memory_id {
                    let payload = Self::payload(fact, action, id);
                    self.store
                        .update(KNOWLEDGE_COLLECTION, id, vector, payload)
                        .await?;
                    debug!(target: "memory", id, "Updated knowledge memory");
                } else {
                    warn!(target: "memory", "UPDATE decision without a target; skipping");
                }
            }
            MemoryEvent::Delete => {
                if let Some(id) = action.target_memory_id {
                    self.store.delete(KNOWLEDGE_COLLECTION, id).await?;
                    debug!(target: "memory", id, "Deleted knowledge memory");
                }
            }
            MemoryEvent::None => {}
        }
        Ok(())
    }

    fn payload(fact: &ExtractedFact, action: &MemoryAction, id: u64) -> Value {
        let mut payload = json!({
            "id": id,
            "text": fact.text,
            "tags": fact.tags,
            "confidence": action.confidence,
            "event": action.event,
            "qualitySource": action.quality_source,
        });
        if let Some(ref pattern) = fact.code_pattern {
            payload["codePattern"] = json!(pattern);
        }
        if let Some(ref old) = action.old_memory {
            payload["oldMemory"] = json!(old);
        }
        payload
    }

    fn action_json(fact: &ExtractedFact, action: &MemoryAction, id: Option<u64>) -> Value {
        let mut value = json!({
            "text": fact.text,
            "tags": fact.tags,
            "event": action.event,
            "confidence": action.confidence,
            "qualitySource": action.quality_source,
        });
        if let Some(id) = id {
            value["targetMemoryId"] = json!(id);
        }
        if let Some(ref old) = action.old_memory {
            value["oldMemory"] = json!(old);
        }
        value
    }
}

#[async_trait]
impl InternalTool for KnowledgeMemoryTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name.to_string(),
            description: "Extract facts from an interaction and reconcile them with stored memories"
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "interaction": {"type": "array", "items": {"type": "string"}},
                    "context": {"type": "object"},
                    "metadata": {"type": "object"},
                    "options": {"type": "object"}
                },
                "required": ["interaction"]
            }),
            source: ToolSource::Internal,
            // Driven by the background pipeline, not by the agent.
            agent_accessible: false,
        }
    }

    async fn invoke(&self, args: Value, ctx: ToolContext) -> Result<Value> {
        if !embeddings_enabled() {
            return Ok(json!({"actions": [], "skipped": "embeddings disabled"}));
        }

        let lines: Vec<String> = args
            .get("interaction")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        let context = args.get("context").cloned().unwrap_or(Value::Null);
        // Background jobs skip the warm-up path and carry the session id
        // inside the merged context instead of the tool context.
        let session_id = ctx.session_id.clone().or_else(|| {
            context
                .get("sessionId")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        });
        let options: MemoryOptions = args
            .get("options")
            .cloned()
            .map(|v| serde_json::from_value(v).unwrap_or_default())
            .unwrap_or_default();

        let engine = DecisionEngine::new(
            self.decision_model.clone(),
            Arc::clone(&self.prompts),
            options,
        );

        let facts = self.extractor.extract(&lines);
        debug!(target: "memory", count = facts.len(), tool = %self.name, "Extracted facts");

        // Facts are processed in extraction order; later decisions see the
        // effects of earlier ones through vector-store state.
        let mut actions = Vec::with_capacity(facts.len());
        for fact in &facts {
            match self
                .process_fact(fact, &context, session_id.as_deref(), &engine)
                .await
            {
                Ok(action) => actions.push(action),
                Err(e) => {
                    warn!(target: "memory", error = %e, "Fact processing failed");
                    let mut event = Event::new(
                        "memory:operationFailed",
                        json!({"stage": "process", "error": e.to_string()}),
                    );
                    if let Some(ref session) = session_id {
                        event = event.for_session(session.clone());
                    }
                    self.bus.publish(event);
                }
            }
        }

        Ok(json!({"actions": actions}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::embedding::{reset_embeddings_latch, EmbeddingProvider};
    use crate::memory::store::InMemoryVectorStore;
    use crate::{MatrixError, Result};
    use serial_test::serial;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Deterministic embedder: maps text to a token-count direction.
    struct StubEmbedder {
        fail: AtomicBool,
    }

    #[async_trait]
    impl EmbeddingProvider for StubEmbedder {
        fn id(&self) -> &str {
            "stub"
        }

        fn dimensions(&self) -> usize {
            4
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(MatrixError::EmbeddingUnavailable("stub offline".to_string()));
            }
            // Character-frequency direction; similar texts land close.
            let mut v = vec![0.0f32; 4];
            for (i, b) in text.bytes().enumerate() {
                v[i % 4] += (b % 17) as f32;
            }
            let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                v.iter_mut().for_each(|x| *x /= norm);
            }
            Ok(v)
        }
    }

    fn tool(
        store: Arc<dyn VectorStore>,
        fail: bool,
    ) -> (KnowledgeMemoryTool, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let embedder = Arc::new(StubEmbedder {
            fail: AtomicBool::new(fail),
        });
        let tool = KnowledgeMemoryTool::new(
            KNOWLEDGE_TOOL_NAME,
            Arc::new(EmbeddingManager::new(vec![embedder])),
            store,
            Arc::new(PromptManager::new(None)),
            Arc::clone(&bus),
            None,
        );
        (tool, bus)
    }

    fn interaction_args(lines: &[&str]) -> Value {
        json!({"interaction": lines, "context": {"sessionId": "s1"}})
    }

    #[tokio::test]
    #[serial]
    async fn fresh_fact_is_added() {
        reset_embeddings_latch();
        let store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
        let (tool, _bus) = tool(Arc::clone(&store), false);

        let out = tool
            .invoke(
                interaction_args(&["In Python, def defines a function."]),
                ToolContext::default(),
            )
            .await
            .unwrap();

        let actions = out["actions"].as_array().unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0]["event"], "ADD");
        assert!(actions[0]["confidence"].as_f64().unwrap() >= 0.7);
        assert!(actions[0]["tags"]
            .as_array()
            .unwrap()
            .iter()
            .any(|t| t == "python"));
        assert_eq!(store.count(KNOWLEDGE_COLLECTION).await.unwrap(), 1);
    }

    #[tokio::test]
    #[serial]
    async fn duplicate_fact_is_skipped() {
        reset_embeddings_latch();
        let store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
        let (tool, _bus) = tool(Arc::clone(&store), false);
        let args = interaction_args(&["In Python, def defines a function."]);

        tool.invoke(args.clone(), ToolContext::default()).await.unwrap();
        let out = tool.invoke(args, ToolContext::default()).await.unwrap();

        let actions = out["actions"].as_array().unwrap();
        assert_eq!(actions[0]["event"], "NONE");
        assert!(actions[0]["confidence"].as_f64().unwrap() >= 0.9);
        assert_eq!(store.count(KNOWLEDGE_COLLECTION).await.unwrap(), 1);
    }

    #[tokio::test]
    #[serial]
    async fn embedding_failure_falls_back_without_persisting() {
        reset_embeddings_latch();
        let store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
        let (tool, bus) = tool(Arc::clone(&store), true);
        let (_, mut rx) = bus.subscribe(vec!["memory:operationFailed".to_string()]);

        let out = tool
            .invoke(
                interaction_args(&["In Python, def defines a function."]),
                ToolContext::default(),
            )
            .await
            .unwrap();

        let actions = out["actions"].as_array().unwrap();
        assert_eq!(actions[0]["event"], "ADD");
        assert!((actions[0]["confidence"].as_f64().unwrap() - 0.6).abs() < 1e-6);
        assert_eq!(actions[0]["qualitySource"], "heuristic");
        assert_eq!(store.count(KNOWLEDGE_COLLECTION).await.unwrap(), 0);
        assert!(rx.try_recv().is_ok());

        // The latch is now set: the next run is a no-op.
        let out = tool
            .invoke(
                interaction_args(&["In Rust, match arms must be exhaustive."]),
                ToolContext::default(),
            )
            .await
            .unwrap();
        assert!(out["actions"].as_array().unwrap().is_empty());
        reset_embeddings_latch();
    }

    #[tokio::test]
    #[serial]
    async fn low_signal_interaction_produces_nothing() {
        reset_embeddings_latch();
        let store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
        let (tool, _bus) = tool(Arc::clone(&store), false);

        let out = tool
            .invoke(interaction_args(&["thanks"]), ToolContext::default())
            .await
            .unwrap();
        assert!(out["actions"].as_array().unwrap().is_empty());
        assert_eq!(store.count(KNOWLEDGE_COLLECTION).await.unwrap(), 0);
    }
}
