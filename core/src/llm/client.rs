//! Provider HTTP client.
//!
//! OpenAI-compatible providers (including Azure deployments) speak
//! chat.completions; the Anthropic family speaks the messages API. The
//! client normalizes both into `ProviderResponse` so the service loop
//! never branches on provider.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error};

use super::CompletionModel;
use crate::config::LlmConfig;
use crate::context::formatter::ProviderFamily;
use crate::context::ToolCall;
use crate::{MatrixError, Result};

const DEFAULT_MAX_TOKENS: u32 = 4096;

/// One provider request, already shaped by the formatter.
#[derive(Debug, Clone, Default)]
pub struct ProviderRequest {
    pub system: Option<String>,
    pub messages: Vec<Value>,
    pub tools: Vec<Value>,
    /// Set on retry attempts to break pathological tool loops.
    pub suppress_tools: bool,
}

/// Normalized provider response.
#[derive(Debug, Clone, Default)]
pub struct ProviderResponse {
    pub text: String,
    pub thinking: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub raw: Option<Value>,
}

/// HTTP client for one configured provider.
pub struct ProviderClient {
    http: Client,
    cfg: LlmConfig,
    family: ProviderFamily,
    base_url: String,
    api_key: Option<String>,
}

impl ProviderClient {
    pub fn new(cfg: LlmConfig) -> Result<Self> {
        let family = match cfg.provider.to_ascii_lowercase().as_str() {
            "openai" | "openrouter" | "ollama" | "lmstudio" | "qwen" | "gemini" => {
                ProviderFamily::OpenAi
            }
            "azure" => ProviderFamily::Azure,
            "anthropic" | "aws" => ProviderFamily::Anthropic,
            other => return Err(MatrixError::UnsupportedProvider(other.to_string())),
        };
        let base_url = cfg
            .base_url
            .clone()
            .unwrap_or_else(|| default_base_url(&cfg.provider).to_string());
        let api_key = cfg.resolved_api_key()?;

        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()
            .map_err(|e| MatrixError::ProviderTransport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            cfg,
            family,
            base_url,
            api_key,
        })
    }

    pub fn provider(&self) -> &str {
        &self.cfg.provider
    }

    pub fn max_iterations(&self) -> usize {
        self.cfg.max_iterations
    }

    /// Send one chat request and normalize the response.
    pub async fn chat(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        match self.family {
            ProviderFamily::OpenAi | ProviderFamily::Azure => self.chat_openai(request).await,
            ProviderFamily::Anthropic => self.chat_anthropic(request).await,
        }
    }

    async fn chat_openai(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        debug!(target: "llm_client", %url, model = %self.cfg.model, "POST chat.completions");

        let mut body = json!({
            "model": self.cfg.model,
            "messages": request.messages,
            "temperature": self.cfg.temperature,
            "max_tokens": DEFAULT_MAX_TOKENS,
        });
        if !request.tools.is_empty() && !request.suppress_tools {
            body["tools"] = json!(request.tools);
            body["tool_choice"] = json!("auto");
        } else if request.suppress_tools {
            body["tool_choice"] = json!("none");
        }

        let mut req = self.http.post(&url).header("content-type", "application/json");
        if let Some(key) = &self.api_key {
            if self.family == ProviderFamily::Azure {
                req = req.header("api-key", key);
            } else {
                req = req.bearer_auth(key);
            }
        }

        let resp = req
            .json(&body)
            .send()
            .await
            .map_err(|e| MatrixError::ProviderTransport(format!("chat request failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            error!(target: "llm_client", %status, body = %text, "chat.completions error");
            return Err(MatrixError::ProviderTransport(format!(
                "chat.completions error: status={status} body={text}"
            )));
        }

        let val: Value = resp
            .json()
            .await
            .map_err(|e| MatrixError::ProviderTransport(format!("failed to parse chat JSON: {e}")))?;
        Ok(parse_openai_response(&val))
    }

    async fn chat_anthropic(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        let url = format!("{}/messages", self.base_url.trim_end_matches('/'));
        debug!(target: "llm_client", %url, model = %self.cfg.model, "POST messages");

        let mut body = json!({
            "model": self.cfg.model,
            "messages": request.messages,
            "temperature": self.cfg.temperature,
            "max_tokens": DEFAULT_MAX_TOKENS,
        });
        if let Some(ref system) = request.system {
            body["system"] = json!(system);
        }
        if !request.tools.is_empty() && !request.suppress_tools {
            body["tools"] = json!(request.tools);
        }

        let mut req = self
            .http
            .post(&url)
            .header("content-type", "application/json")
            .header("anthropic-version", "2023-06-01");
        if let Some(key) = &self.api_key {
            req = req.header("x-api-key", key);
        }

        let resp = req
            .json(&body)
            .send()
            .await
            .map_err(|e| MatrixError::ProviderTransport(format!("messages request failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            error!(target: "llm_client", %status, body = %text, "messages error");
            return Err(MatrixError::ProviderTransport(format!(
                "messages error: status={status} body={text}"
            )));
        }

        let val: Value = resp
            .json()
            .await
            .map_err(|e| MatrixError::ProviderTransport(format!("failed to parse messages JSON: {e}")))?;
        Ok(parse_anthropic_response(&val))
    }

    /// Bare completion without context or tools; reserved for internal
    /// subsystems.
    pub async fn direct_generate(&self, prompt: &str, system: Option<&str>) -> Result<String> {
        let request = match self.family {
            ProviderFamily::OpenAi | ProviderFamily::Azure => {
                let mut messages = Vec::new();
                if let Some(system) = system {
                    messages.push(json!({"role": "system", "content": system}));
                }
                messages.push(json!({"role": "user", "content": prompt}));
                ProviderRequest {
                    system: None,
                    messages,
                    tools: Vec::new(),
                    suppress_tools: true,
                }
            }
            ProviderFamily::Anthropic => ProviderRequest {
                system: system.map(|s| s.to_string()),
                messages: vec![json!({"role": "user", "content": [{"type": "text", "text": prompt}]})],
                tools: Vec::new(),
                suppress_tools: true,
            },
        };
        Ok(self.chat(&request).await?.text)
    }
}

#[async_trait]
impl CompletionModel for ProviderClient {
    async fn complete(&self, system: Option<&str>, prompt: &str) -> Result<String> {
        self.direct_generate(prompt, system).await
    }
}

fn default_base_url(provider: &str) -> &'static str {
    match provider.to_ascii_lowercase().as_str() {
        "openai" => "https://api.openai.com/v1",
        "openrouter" => "https://openrouter.ai/api/v1",
        "ollama" => "http://localhost:11434/v1",
        "lmstudio" => "http://localhost:1234/v1",
        "qwen" => "https://dashscope.aliyuncs.com/compatible-mode/v1",
        "gemini" => "https://generativelanguage.googleapis.com/v1beta/openai",
        "anthropic" | "aws" => "https://api.anthropic.com/v1",
        _ => "http://localhost:8000/v1",
    }
}

/// Parse a chat.completions response into the normalized shape.
pub fn parse_openai_response(val: &Value) -> ProviderResponse {
    let message = val
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"));

    let text = message
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();

    let mut tool_calls = Vec::new();
    if let Some(calls) = message
        .and_then(|m| m.get("tool_calls"))
        .and_then(|c| c.as_array())
    {
        for call in calls {
            let id = call.get("id").and_then(|v| v.as_str()).unwrap_or_default();
            let Some(function) = call.get("function") else {
                continue;
            };
            let name = function
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let arguments = match function.get("arguments") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => "{}".to_string(),
            };
            if !name.is_empty() {
                tool_calls.push(ToolCall::new(id, name, arguments));
            }
        }
    }

    ProviderResponse {
        text,
        thinking: None,
        tool_calls,
        raw: Some(val.clone()),
    }
}

/// Parse an Anthropic messages response into the normalized shape.
pub fn parse_anthropic_response(val: &Value) -> ProviderResponse {
    let mut text = String::new();
    let mut thinking: Option<String> = None;
    let mut tool_calls = Vec::new();

    if let Some(blocks) = val.get("content").and_then(|c| c.as_array()) {
        for block in blocks {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    if let Some(t) = block.get("text").and_then(|v| v.as_str()) {
                        text.push_str(t);
                    }
                }
                Some("thinking") => {
                    if let Some(t) = block.get("thinking").and_then(|v| v.as_str()) {
                        thinking = Some(t.to_string());
                    }
                }
                Some("tool_use") => {
                    let id = block.get("id").and_then(|v| v.as_str()).unwrap_or_default();
                    let name = block.get("name").and_then(|v| v.as_str()).unwrap_or_default();
                    let input = block.get("input").cloned().unwrap_or_else(|| json!({}));
                    if !name.is_empty() {
                        tool_calls.push(ToolCall::new(id, name, input.to_string()));
                    }
                }
                _ => {}
            }
        }
    }

    ProviderResponse {
        text,
        thinking,
        tool_calls,
        raw: Some(val.clone()),
    }
}
