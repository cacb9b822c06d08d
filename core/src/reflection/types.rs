//! Reasoning trace structures.

use serde::{Deserialize, Serialize};

use crate::memory::QualitySource;

/// A single step in a reasoning trace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReasoningStep {
    /// Step kind: `premise`, `condition`, `inference`, or `conclusion`.
    #[serde(rename = "type")]
    pub step_type: String,
    pub content: String,
}

impl ReasoningStep {
    pub fn new(step_type: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            step_type: step_type.into(),
            content: content.into(),
        }
    }
}

/// An extracted reasoning trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningTrace {
    pub id: u64,
    pub steps: Vec<ReasoningStep>,
    /// Where the trace came from (currently always the user input).
    pub source: String,
}

impl ReasoningTrace {
    /// Flatten the steps for embedding and prompts.
    pub fn step_texts(&self) -> Vec<String> {
        self.steps
            .iter()
            .map(|s| format!("[{}] {}", s.step_type, s.content))
            .collect()
    }
}

/// Evaluator verdict for one trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEvaluation {
    pub quality_score: f32,
    pub should_store: bool,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    /// Which strategy produced this verdict. Persisted with the trace so
    /// downstream readers can filter by provenance, mirroring the
    /// knowledge pipeline's `quality_source`.
    #[serde(default = "default_quality_source")]
    pub quality_source: QualitySource,
}

fn default_quality_source() -> QualitySource {
    QualitySource::Llm
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluation_deserializes_camel_case() {
        let raw = r#"{"qualityScore": 0.8, "shouldStore": true, "issues": ["vague"]}"#;
        let eval: TraceEvaluation = serde_json::from_str(raw).unwrap();
        assert!((eval.quality_score - 0.8).abs() < f32::EPSILON);
        assert!(eval.should_store);
        assert_eq!(eval.issues, vec!["vague"]);
        assert!(eval.suggestions.is_empty());
        // Evaluator responses carry no provenance field; it defaults to
        // the LLM path that produced them.
        assert_eq!(eval.quality_source, QualitySource::Llm);
    }

    #[test]
    fn evaluation_serializes_provenance() {
        let eval = TraceEvaluation {
            quality_score: 0.9,
            should_store: true,
            issues: Vec::new(),
            suggestions: Vec::new(),
            quality_source: QualitySource::Llm,
        };
        let value = serde_json::to_value(&eval).unwrap();
        assert_eq!(value["qualitySource"], "llm");
    }

    #[test]
    fn step_serde_uses_type_key() {
        let step = ReasoningStep::new("inference", "therefore it holds");
        let value = serde_json::to_value(&step).unwrap();
        assert_eq!(value["type"], "inference");
    }
}
