//! Reflection tool pair.
//!
//! `extract_reasoning_steps` turns user input into a structured trace;
//! `store_reasoning_memory` persists the unified (trace, evaluation) entry
//! in the reflection collection. Both are internal-only.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;

use super::detector::ReasoningDetector;
use super::types::{ReasoningStep, ReasoningTrace, TraceEvaluation};
use crate::memory::embedding::EmbeddingManager;
use crate::memory::store::{VectorStore, REFLECTION_COLLECTION, REFLECTION_ID_BASE};
use crate::tools::{InternalTool, ToolContext, ToolDescriptor, ToolSource};
use crate::{MatrixError, Result};

pub const EXTRACT_TOOL_NAME: &str = "extract_reasoning_steps";
pub const STORE_TOOL_NAME: &str = "store_reasoning_memory";

/// Splits user input into classified reasoning steps.
pub struct ExtractReasoningStepsTool {
    detector: ReasoningDetector,
    sentence_split: Regex,
}

impl ExtractReasoningStepsTool {
    pub fn new() -> Self {
        Self {
            detector: ReasoningDetector::new(),
            sentence_split: Regex::new(r"(?m)(?:[.;!?]\s+|\n+|^\s*\d+[.)]\s*)").expect("static regex"),
        }
    }

    fn classify(fragment: &str, index: usize, total: usize) -> ReasoningStep {
        let lower = fragment.to_lowercase();
        let step_type = if lower.contains("if ") || lower.starts_with("when ") {
            "condition"
        } else if lower.contains("therefore")
            || lower.contains("thus")
            || lower.contains("hence")
            || lower.contains("so ")
        {
            "inference"
        } else if index + 1 == total || lower.contains("conclu") {
            "conclusion"
        } else {
            "premise"
        };
        ReasoningStep::new(step_type, fragment.trim())
    }

    fn extract(&self, input: &str) -> Vec<ReasoningStep> {
        let fragments: Vec<&str> = self
            .sentence_split
            .split(input)
            .map(|s| s.trim())
            .filter(|s| s.len() >= 8)
            .collect();
        let total = fragments.len();
        fragments
            .into_iter()
            .enumerate()
            .map(|(i, fragment)| Self::classify(fragment, i, total))
            .collect()
    }
}

impl Default for ExtractReasoningStepsTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InternalTool for ExtractReasoningStepsTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: EXTRACT_TOOL_NAME.to_string(),
            description: "Extract structured reasoning steps from text".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {"input": {"type": "string"}},
                "required": ["input"]
            }),
            source: ToolSource::Internal,
            agent_accessible: false,
        }
    }

    async fn invoke(&self, args: Value, _ctx: ToolContext) -> Result<Value> {
        let input = args
            .get("input")
            .and_then(|v| v.as_str())
            .ok_or_else(|| MatrixError::ToolExecution("input is required".to_string()))?;

        let detection = self.detector.detect(input);
        let steps = if detection.contains_reasoning {
            self.extract(input)
        } else {
            Vec::new()
        };

        Ok(json!({
            "containsReasoning": detection.contains_reasoning,
            "confidence": detection.confidence,
            "steps": steps,
        }))
    }
}

/// Persists a (trace, evaluation) pair in the reflection collection.
pub struct StoreReasoningMemoryTool {
    embeddings: Arc<EmbeddingManager>,
    store: Arc<dyn VectorStore>,
    next_id: AtomicU64,
}

impl StoreReasoningMemoryTool {
    pub fn new(embeddings: Arc<EmbeddingManager>, store: Arc<dyn VectorStore>) -> Self {
        Self {
            embeddings,
            store,
            next_id: AtomicU64::new(REFLECTION_ID_BASE),
        }
    }
}

#[async_trait]
impl InternalTool for StoreReasoningMemoryTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: STORE_TOOL_NAME.to_string(),
            description: "Persist an evaluated reasoning trace".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "trace": {"type": "object"},
                    "evaluation": {"type": "object"}
                },
                "required": ["trace", "evaluation"]
            }),
            source: ToolSource::Internal,
            agent_accessible: false,
        }
    }

    async fn invoke(&self, args: Value, _ctx: ToolContext) -> Result<Value> {
        let steps: Vec<ReasoningStep> = args
            .get("trace")
            .and_then(|t| t.get("steps"))
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        if steps.is_empty() {
            return Err(MatrixError::ReflectionPipeline(
                "cannot store an empty trace".to_string(),
            ));
        }
        let evaluation: TraceEvaluation = serde_json::from_value(
            args.get("evaluation")
                .cloned()
                .ok_or_else(|| MatrixError::ReflectionPipeline("evaluation is required".to_string()))?,
        )?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let trace = ReasoningTrace {
            id,
            steps,
            source: args
                .get("trace")
                .and_then(|t| t.get("source"))
                .and_then(|v| v.as_str())
                .unwrap_or("user_input")
                .to_string(),
        };

        let text = trace.step_texts().join("\n");
        let vector = self.embeddings.embed(&text).await?;
        let payload = json!({
            "id": id,
            "text": text,
            "steps": trace.steps,
            "source": trace.source,
            "qualityScore": evaluation.quality_score,
            "qualitySource": evaluation.quality_source,
            "issues": evaluation.issues,
            "suggestions": evaluation.suggestions,
        });
        self.store
            .insert(REFLECTION_COLLECTION, id, vector, payload)
            .await?;

        debug!(target: "reflection", id, quality = evaluation.quality_score, "Stored reasoning trace");
        Ok(json!({"id": id}))
    }
}
