//! Reflection pipeline: detect → extract → evaluate → store.
//!
//! Runs after the knowledge pipeline on the same turn. Every step is
//! independently wrapped; a failure in one never reaches the caller and
//! never blocks the others that can still run.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use super::detector::ReasoningDetector;
use super::tools::{EXTRACT_TOOL_NAME, STORE_TOOL_NAME};
use super::types::TraceEvaluation;
use crate::event::{Event, EventBus};
use crate::llm::CompletionModel;
use crate::memory::embedding::embeddings_enabled;
use crate::memory::{EmbeddingManager, QualitySource};
use crate::prompt::PromptManager;
use crate::tools::UnifiedToolManager;
use crate::{config, MatrixError, Result};

pub struct ReflectionPipeline {
    tools: Arc<UnifiedToolManager>,
    embeddings: Arc<EmbeddingManager>,
    prompts: Arc<PromptManager>,
    bus: Arc<EventBus>,
    /// Distinct LLM service built from the evaluation config. Without it
    /// the evaluate step fails and no traces are stored.
    evaluator: Option<Arc<dyn CompletionModel>>,
    detector: ReasoningDetector,
}

impl ReflectionPipeline {
    pub fn new(
        tools: Arc<UnifiedToolManager>,
        embeddings: Arc<EmbeddingManager>,
        prompts: Arc<PromptManager>,
        bus: Arc<EventBus>,
        evaluator: Option<Arc<dyn CompletionModel>>,
    ) -> Self {
        Self {
            tools,
            embeddings,
            prompts,
            bus,
            evaluator,
            detector: ReasoningDetector::new(),
        }
    }

    /// All gates must pass before any reflection work starts.
    fn gates_open(&self, user_input: &str) -> bool {
        if !embeddings_enabled() || !self.embeddings.has_active_embedders() {
            return false;
        }
        if !self.tools.has_tool(EXTRACT_TOOL_NAME) || !self.tools.has_tool(STORE_TOOL_NAME) {
            return false;
        }
        if config::env_flag("DISABLE_REFLECTION_MEMORY") {
            return false;
        }
        let detection = self.detector.detect(user_input);
        detection.contains_reasoning && detection.confidence >= self.detector.threshold()
    }

    /// Run the pipeline for one turn. Never returns an error to the
    /// caller; everything is logged and emitted.
    pub async fn run(&self, session_id: &str, user_input: &str) {
        if !self.gates_open(user_input) {
            debug!(target: "reflection", session = %session_id, "Reflection gates closed; skipping");
            return;
        }

        // Step 1: extract. A failure here ends the pipeline; there is
        // nothing to evaluate or store without a trace.
        let steps = match self.extract(user_input).await {
            Ok(steps) => steps,
            Err(e) => {
                warn!(target: "reflection", session = %session_id, error = %e, "Trace extraction failed");
                self.emit_failure(session_id, "extract", &e);
                return;
            }
        };
        if steps.is_empty() {
            debug!(target: "reflection", session = %session_id, "No reasoning steps extracted");
            return;
        }

        // Step 2: evaluate. A failure (including a missing evaluation
        // model) ends this turn's reflection work; traces are only stored
        // once the evaluator has vetted them.
        let evaluation = match self.evaluate(&steps).await {
            Ok(evaluation) => evaluation,
            Err(e) => {
                warn!(target: "reflection", session = %session_id, error = %e, "Trace evaluation failed");
                self.emit_failure(session_id, "evaluate", &e);
                return;
            }
        };

        if !evaluation.should_store {
            debug!(
                target: "reflection",
                session = %session_id,
                quality = evaluation.quality_score,
                "Trace not worth storing"
            );
            return;
        }

        // Step 3: store.
        if let Err(e) = self.store(&steps, &evaluation).await {
            warn!(target: "reflection", session = %session_id, error = %e, "Trace store failed");
            self.emit_failure(session_id, "store", &e);
            return;
        }

        self.bus.publish(
            Event::new(
                "reflection:stored",
                json!({"steps": steps.len(), "qualityScore": evaluation.quality_score}),
            )
            .for_session(session_id),
        );
    }

    async fn extract(&self, user_input: &str) -> Result<Vec<Value>> {
        let out = self
            .tools
            .execute_tool_without_loading(EXTRACT_TOOL_NAME, json!({"input": user_input}))
            .await?;
        Ok(out
            .get("steps")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }

    async fn evaluate(&self, steps: &[Value]) -> Result<TraceEvaluation> {
        let evaluator = self
            .evaluator
            .as_ref()
            .ok_or_else(|| MatrixError::ReflectionPipeline("no evaluator configured".to_string()))?;

        let step_texts: Vec<String> = steps
            .iter()
            .map(|s| {
                s.get("content")
                    .and_then(|c| c.as_str())
                    .unwrap_or_default()
                    .to_string()
            })
            .collect();
        let prompt = self.prompts.reasoning_evaluation_prompt(&step_texts);
        let raw = evaluator.complete(None, &prompt).await?;
        let mut evaluation = parse_evaluation(&raw)?;
        evaluation.quality_source = QualitySource::Llm;
        Ok(evaluation)
    }

    async fn store(&self, steps: &[Value], evaluation: &TraceEvaluation) -> Result<()> {
        self.tools
            .execute_tool_without_loading(
                STORE_TOOL_NAME,
                json!({
                    "trace": {"steps": steps, "source": "user_input"},
                    "evaluation": evaluation,
                }),
            )
            .await?;
        Ok(())
    }

    fn emit_failure(&self, session_id: &str, stage: &str, error: &MatrixError) {
        self.bus.publish(
            Event::new(
                "reflection:failed",
                json!({"stage": stage, "error": error.to_string()}),
            )
            .for_session(session_id),
        );
    }
}

/// Parse the evaluator response: direct JSON or an embedded object.
fn parse_evaluation(raw: &str) -> Result<TraceEvaluation> {
    if let Ok(evaluation) = serde_json::from_str::<TraceEvaluation>(raw.trim()) {
        return Ok(evaluation);
    }
    if let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) {
        if start < end {
            if let Ok(evaluation) = serde_json::from_str::<TraceEvaluation>(&raw[start..=end]) {
                return Ok(evaluation);
            }
        }
    }
    Err(MatrixError::ReflectionPipeline(format!(
        "unparseable evaluation: {raw}"
    )))
}
