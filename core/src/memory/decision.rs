//! Memory decision engine.
//!
//! Strategy chain per fact: try the LLM decision service, fall back to
//! similarity-only rules, finalize with the confidence gate. The
//! `quality_source` on the resulting action records which strategy
//! actually decided.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::store::SearchHit;
use crate::llm::CompletionModel;
use crate::prompt::PromptManager;
use crate::{MatrixError, Result};

/// Memory operation chosen for one fact.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum MemoryEvent {
    Add,
    Update,
    Delete,
    None,
}

/// Which strategy produced the decision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QualitySource {
    Similarity,
    Llm,
    Heuristic,
}

/// Finalized action for one fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryAction {
    pub event: MemoryEvent,
    pub confidence: f32,
    pub quality_source: QualitySource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_memory_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_memory: Option<String>,
}

/// Options controlling the per-fact decision sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryOptions {
    pub similarity_threshold: f32,
    pub max_similar_results: usize,
    pub use_llm_decisions: bool,
    pub confidence_threshold: f32,
    pub enable_delete_operations: bool,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.7,
            max_similar_results: 5,
            use_llm_decisions: true,
            confidence_threshold: 0.4,
            enable_delete_operations: true,
        }
    }
}

/// Raw LLM decision payload.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LlmDecision {
    operation: String,
    confidence: f32,
    #[serde(default)]
    target_memory_id: Option<u64>,
}

pub struct DecisionEngine {
    model: Option<Arc<dyn CompletionModel>>,
    prompts: Arc<PromptManager>,
    options: MemoryOptions,
}

impl DecisionEngine {
    pub fn new(
        model: Option<Arc<dyn CompletionModel>>,
        prompts: Arc<PromptManager>,
        options: MemoryOptions,
    ) -> Self {
        Self {
            model,
            prompts,
            options,
        }
    }

    pub fn options(&self) -> &MemoryOptions {
        &self.options
    }

    /// Decide what to do with one fact given its similarity hits
    /// (pre-filtered to `score >= similarity_threshold`).
    pub async fn decide(&self, fact: &str, hits: &[SearchHit], context: &Value) -> MemoryAction {
        let decided = if self.options.use_llm_decisions {
            if let Some(model) = &self.model {
                match self.llm_decide(model.as_ref(), fact, hits, context).await {
                    Ok(action) => Some(action),
                    Err(e) => {
                        debug!(target: "memory", error = %e, "LLM decision failed; using similarity fallback");
                        None
                    }
                }
            } else {
                None
            }
        } else {
            None
        };

        let action = decided.unwrap_or_else(|| self.similarity_decide(hits));
        self.finalize(action)
    }

    /// Similarity-only decision table.
    pub fn similarity_decide(&self, hits: &[SearchHit]) -> MemoryAction {
        match hits.first() {
            None => MemoryAction {
                event: MemoryEvent::Add,
                confidence: 0.8,
                quality_source: QualitySource::Similarity,
                target_memory_id: None,
                old_memory: None,
            },
            Some(top) if top.score > 0.9 => MemoryAction {
                event: MemoryEvent::None,
                confidence: 0.9,
                quality_source: QualitySource::Similarity,
                target_memory_id: Some(top.id),
                old_memory: None,
            },
            Some(top) if top.score > self.options.similarity_threshold => MemoryAction {
                event: MemoryEvent::Update,
                confidence: 0.75,
                quality_source: QualitySource::Similarity,
                target_memory_id: Some(top.id),
                old_memory: Some(top.text.clone()),
            },
            Some(_) => MemoryAction {
                event: MemoryEvent::Add,
                confidence: 0.7,
                quality_source: QualitySource::Similarity,
                target_memory_id: None,
                old_memory: None,
            },
        }
    }

    async fn llm_decide(
        &self,
        model: &dyn CompletionModel,
        fact: &str,
        hits: &[SearchHit],
        context: &Value,
    ) -> Result<MemoryAction> {
        let top: Vec<&SearchHit> = hits.iter().take(3).collect();
        let prompt = self.prompts.memory_decision_prompt(fact, &top, context);
        let raw = model.complete(None, &prompt).await?;
        let decision = parse_decision(&raw)?;

        let event = match decision.operation.to_ascii_uppercase().as_str() {
            "ADD" => MemoryEvent::Add,
            "UPDATE" => MemoryEvent::Update,
            "DELETE" => MemoryEvent::Delete,
            "NONE" => MemoryEvent::None,
            other => {
                return Err(MatrixError::MemoryPipeline(format!(
                    "unknown operation in LLM decision: {other}"
                )))
            }
        };

        let target = decision
            .target_memory_id
            .or_else(|| hits.first().map(|h| h.id));
        let old_memory = match event {
            MemoryEvent::Update => target
                .and_then(|id| hits.iter().find(|h| h.id == id))
                .map(|h| h.text.clone()),
            _ => None,
        };

        Ok(MemoryAction {
            event,
            confidence: decision.confidence.clamp(0.0, 1.0),
            quality_source: QualitySource::Llm,
            target_memory_id: match event {
                MemoryEvent::Update | MemoryEvent::Delete | MemoryEvent::None => target,
                MemoryEvent::Add => None,
            },
            old_memory,
        })
    }

    /// Confidence gate: a low-confidence action is demoted to NONE.
    fn finalize(&self, mut action: MemoryAction) -> MemoryAction {
        if action.confidence < self.options.confidence_threshold {
            debug!(
                target: "memory",
                confidence = action.confidence,
                threshold = self.options.confidence_threshold,
                "Demoting low-confidence action to NONE"
            );
            action.event = MemoryEvent::None;
        }
        if action.event == MemoryEvent::Delete && !self.options.enable_delete_operations {
            warn!(target: "memory", "DELETE decision demoted to NONE: delete operations disabled");
            action.event = MemoryEvent::None;
        }
        action
    }
}

/// Tolerant parse of the LLM decision response: direct JSON, then a JSON
/// object embedded in prose, then a bare operation keyword.
fn parse_decision(raw: &str) -> Result<LlmDecision> {
    if let Ok(decision) = serde_json::from_str::<LlmDecision>(raw.trim()) {
        return Ok(decision);
    }

    let object_re = Regex::new(r"\{[^{}]*\}").expect("static regex");
    if let Some(m) = object_re.find(raw) {
        if let Ok(decision) = serde_json::from_str::<LlmDecision>(m.as_str()) {
            return Ok(decision);
        }
    }

    let upper = raw.to_ascii_uppercase();
    for op in ["UPDATE", "DELETE", "NONE", "ADD"] {
        if upper.contains(op) {
            return Ok(LlmDecision {
                operation: op.to_string(),
                confidence: 0.5,
                target_memory_id: None,
            });
        }
    }

    Err(MatrixError::MemoryPipeline(format!(
        "unparseable LLM decision: {raw}"
    )))
}
