//! Process-wide prompt manager.
//!
//! Holds the configured system prompt and builds the internal prompts used
//! by the memory decision service and the reasoning evaluator. The
//! concrete wording is deliberately compact; callers treat the output as
//! opaque.

use serde_json::Value;

use crate::config::SystemPromptConfig;
use crate::memory::store::SearchHit;

pub struct PromptManager {
    system_prompt: Option<String>,
}

impl PromptManager {
    pub fn new(config: Option<SystemPromptConfig>) -> Self {
        let system_prompt = config.and_then(|c| {
            if c.enabled && !c.content.is_empty() {
                Some(c.content)
            } else {
                None
            }
        });
        Self { system_prompt }
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    /// Prompt for the memory decision LLM. The response contract is a JSON
    /// object `{"operation", "confidence", "targetMemoryId"}`.
    pub fn memory_decision_prompt(
        &self,
        fact: &str,
        similar: &[&SearchHit],
        context: &Value,
    ) -> String {
        let mut prompt = String::from(
            "Decide how to store a new fact relative to existing memories.\n\
             Respond with JSON only: {\"operation\": \"ADD|UPDATE|DELETE|NONE\", \
             \"confidence\": 0.0-1.0, \"targetMemoryId\": <id or null>}.\n\n",
        );
        prompt.push_str(&format!("New fact: {fact}\n"));
        if similar.is_empty() {
            prompt.push_str("Existing similar memories: none\n");
        } else {
            prompt.push_str("Existing similar memories:\n");
            for hit in similar {
                prompt.push_str(&format!(
                    "- id={} score={:.2} text={}\n",
                    hit.id, hit.score, hit.text
                ));
            }
        }
        if !context.is_null() {
            prompt.push_str(&format!("Context: {context}\n"));
        }
        prompt
    }

    /// Prompt for the reasoning trace evaluator. The response contract is
    /// `{"qualityScore", "shouldStore", "issues", "suggestions"}`.
    pub fn reasoning_evaluation_prompt(&self, steps: &[String]) -> String {
        let mut prompt = String::from(
            "Evaluate the following reasoning trace for reuse value.\n\
             Respond with JSON only: {\"qualityScore\": 0.0-1.0, \"shouldStore\": bool, \
             \"issues\": [..], \"suggestions\": [..]}.\n\nSteps:\n",
        );
        for (i, step) in steps.iter().enumerate() {
            prompt.push_str(&format!("{}. {}\n", i + 1, step));
        }
        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn disabled_system_prompt_is_dropped() {
        let manager = PromptManager::new(Some(SystemPromptConfig {
            enabled: false,
            content: "hidden".to_string(),
        }));
        assert!(manager.system_prompt().is_none());
    }

    #[test]
    fn decision_prompt_lists_similar_memories() {
        let manager = PromptManager::new(None);
        let hit = SearchHit {
            id: 12,
            score: 0.88,
            text: "old fact".to_string(),
            payload: json!({}),
        };
        let prompt = manager.memory_decision_prompt("new fact", &[&hit], &json!({"topic": "x"}));
        assert!(prompt.contains("id=12"));
        assert!(prompt.contains("new fact"));
        assert!(prompt.contains("topic"));
    }
}
