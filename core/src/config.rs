//! Typed runtime configuration.
//!
//! Mirrors the `matrix.yml` shape: LLM provider block, optional embedding
//! block, optional system prompt, and remote tool servers. Parsing the file
//! itself is the caller's concern; this module only defines the types and
//! the environment-variable helpers the core relies on.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{MatrixError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub tool_servers: HashMap<String, ToolServerConfig>,
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: Option<EmbeddingConfig>,
    #[serde(default)]
    pub system_prompt: Option<SystemPromptConfig>,
    /// Separate model used by the reasoning evaluator (typically a
    /// non-thinking model). Falls back to `llm` when absent.
    #[serde(default)]
    pub evaluation_llm: Option<LlmConfig>,
}

/// Configuration for one remote tool server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolServerConfig {
    #[serde(rename = "type", default)]
    pub server_type: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Configuration for the language model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_max_iterations() -> usize {
    5
}

fn default_temperature() -> f32 {
    0.7
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            base_url: None,
            max_iterations: default_max_iterations(),
            temperature: default_temperature(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl LlmConfig {
    /// Resolve the api key, expanding a `${VAR}` placeholder from the
    /// environment. A missing placeholder variable is a config error so the
    /// failure surfaces at client build time, not on the first request.
    pub fn resolved_api_key(&self) -> Result<Option<String>> {
        match &self.api_key {
            None => Ok(None),
            Some(raw) => {
                let trimmed = raw.trim();
                if let Some(var) = trimmed
                    .strip_prefix("${")
                    .and_then(|rest| rest.strip_suffix('}'))
                {
                    match std::env::var(var) {
                        Ok(v) if !v.is_empty() => Ok(Some(v)),
                        _ => Err(MatrixError::Config(format!(
                            "api key placeholder ${{{var}}} is not set in the environment"
                        ))),
                    }
                } else if trimmed.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(trimmed.to_string()))
                }
            }
        }
    }
}

/// Configuration for the embedding model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingConfig {
    #[serde(rename = "type", default)]
    pub embedding_type: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Configuration for the system prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemPromptConfig {
    pub enabled: bool,
    pub content: String,
}

/// Truthy check for boolean-ish environment flags ("1", "true", "yes").
pub fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| {
            let v = v.trim().to_ascii_lowercase();
            v == "1" || v == "true" || v == "yes"
        })
        .unwrap_or(false)
}

/// Read a u64 env var, falling back to the default on absence or parse
/// failure.
pub fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

/// Environment tag written into persisted session metadata.
pub fn environment_tag() -> String {
    std::env::var("MATRIX_ENV")
        .or_else(|_| std::env::var("NODE_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}
