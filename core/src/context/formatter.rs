//! Per-provider message shaping.
//!
//! The formatter owns every provider wire difference: the LLM service and
//! session never inspect content blocks directly. OpenAI-compatible
//! providers get flat content strings and `tool_calls`; the Anthropic
//! family gets structured content arrays with `tool_use`/`tool_result`
//! blocks and a separate system field.

use std::sync::Arc;

use serde_json::{json, Value};

use super::types::{ContentBlock, Message, MessageContent, MessageRole};
use crate::{MatrixError, Result};

/// Provider family a formatter emits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderFamily {
    OpenAi,
    Azure,
    Anthropic,
}

/// Provider-ready request parts.
#[derive(Debug, Clone, Default)]
pub struct FormattedRequest {
    /// Separate system field (Anthropic family); OpenAI-family formatters
    /// fold the system prompt into the message array instead.
    pub system: Option<String>,
    pub messages: Vec<Value>,
}

/// Shapes the transcript for one provider family.
pub trait MessageFormatter: Send + Sync {
    fn family(&self) -> ProviderFamily;

    fn format(&self, system_prompt: Option<&str>, messages: &[Message]) -> FormattedRequest;
}

/// Case-insensitive provider string to formatter lookup.
pub fn formatter_for_provider(provider: &str) -> Result<Arc<dyn MessageFormatter>> {
    match provider.to_ascii_lowercase().as_str() {
        "openai" | "openrouter" | "ollama" | "lmstudio" | "qwen" | "gemini" => {
            Ok(Arc::new(OpenAiFormatter))
        }
        "azure" => Ok(Arc::new(AzureFormatter)),
        "anthropic" | "aws" => Ok(Arc::new(AnthropicFormatter)),
        other => Err(MatrixError::UnsupportedProvider(other.to_string())),
    }
}

/// OpenAI-compatible chat.completions shaping.
pub struct OpenAiFormatter;

impl OpenAiFormatter {
    fn content_value(content: &MessageContent) -> Value {
        match content {
            MessageContent::Text(s) => json!(s),
            MessageContent::Blocks(blocks) => {
                let has_image = blocks
                    .iter()
                    .any(|b| matches!(b, ContentBlock::Image { .. }));
                if !has_image {
                    return json!(content.as_text());
                }
                let parts: Vec<Value> = blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text { text } => {
                            Some(json!({"type": "text", "text": text}))
                        }
                        ContentBlock::Image { image, mime_type } => Some(json!({
                            "type": "image_url",
                            "image_url": {"url": format!("data:{mime_type};base64,{image}")}
                        })),
                        // Thinking blocks are not part of the OpenAI wire shape.
                        ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. } => {
                            None
                        }
                    })
                    .collect();
                json!(parts)
            }
        }
    }

    fn format_message(message: &Message) -> Value {
        match message.role {
            MessageRole::System => json!({
                "role": "system",
                "content": message.text(),
            }),
            MessageRole::User => json!({
                "role": "user",
                "content": Self::content_value(&message.content),
            }),
            MessageRole::Assistant => {
                let mut value = json!({"role": "assistant"});
                let text = message.text();
                value["content"] = if text.is_empty() { Value::Null } else { json!(text) };
                if message.has_tool_calls() {
                    let calls: Vec<Value> = message
                        .tool_calls
                        .iter()
                        .map(|call| {
                            json!({
                                "id": call.id,
                                "type": "function",
                                "function": {
                                    "name": call.function.name,
                                    "arguments": call.function.arguments,
                                }
                            })
                        })
                        .collect();
                    value["tool_calls"] = json!(calls);
                }
                value
            }
            MessageRole::Tool => {
                let mut value = json!({
                    "role": "tool",
                    "content": message.text(),
                });
                if let Some(ref id) = message.tool_call_id {
                    value["tool_call_id"] = json!(id);
                }
                if let Some(ref name) = message.name {
                    value["name"] = json!(name);
                }
                value
            }
        }
    }
}

impl MessageFormatter for OpenAiFormatter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::OpenAi
    }

    fn format(&self, system_prompt: Option<&str>, messages: &[Message]) -> FormattedRequest {
        let mut out = Vec::with_capacity(messages.len() + 1);
        if let Some(system) = system_prompt {
            if !system.is_empty() {
                out.push(json!({"role": "system", "content": system}));
            }
        }
        out.extend(messages.iter().map(Self::format_message));
        FormattedRequest {
            system: None,
            messages: out,
        }
    }
}

/// Azure OpenAI: the chat.completions wire schema over a deployment URL.
pub struct AzureFormatter;

impl MessageFormatter for AzureFormatter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Azure
    }

    fn format(&self, system_prompt: Option<&str>, messages: &[Message]) -> FormattedRequest {
        OpenAiFormatter.format(system_prompt, messages)
    }
}

/// Anthropic messages-API shaping (also used for AWS Bedrock).
pub struct AnthropicFormatter;

impl AnthropicFormatter {
    fn content_blocks(content: &MessageContent) -> Vec<Value> {
        match content {
            MessageContent::Text(s) => {
                if s.is_empty() {
                    Vec::new()
                } else {
                    vec![json!({"type": "text", "text": s})]
                }
            }
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => json!({"type": "text", "text": text}),
                    ContentBlock::Image { image, mime_type } => json!({
                        "type": "image",
                        "source": {"type": "base64", "media_type": mime_type, "data": image}
                    }),
                    ContentBlock::Thinking { thinking } => {
                        json!({"type": "thinking", "thinking": thinking})
                    }
                    ContentBlock::RedactedThinking { data } => {
                        json!({"type": "redacted_thinking", "data": data})
                    }
                })
                .collect(),
        }
    }
}

impl MessageFormatter for AnthropicFormatter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Anthropic
    }

    fn format(&self, system_prompt: Option<&str>, messages: &[Message]) -> FormattedRequest {
        let mut system_parts: Vec<String> = Vec::new();
        if let Some(system) = system_prompt {
            if !system.is_empty() {
                system_parts.push(system.to_string());
            }
        }

        let mut out: Vec<Value> = Vec::with_capacity(messages.len());
        for message in messages {
            match message.role {
                // Transcript-embedded system messages join the system field.
                MessageRole::System => system_parts.push(message.text()),
                MessageRole::User => {
                    out.push(json!({
                        "role": "user",
                        "content": Self::content_blocks(&message.content),
                    }));
                }
                MessageRole::Assistant => {
                    let mut blocks = Self::content_blocks(&message.content);
                    for call in &message.tool_calls {
                        let input: Value = serde_json::from_str(&call.function.arguments)
                            .unwrap_or_else(|_| json!(call.function.arguments));
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.function.name,
                            "input": input,
                        }));
                    }
                    out.push(json!({"role": "assistant", "content": blocks}));
                }
                MessageRole::Tool => {
                    out.push(json!({
                        "role": "user",
                        "content": [{
                            "type": "tool_result",
                            "tool_use_id": message.tool_call_id.clone().unwrap_or_default(),
                            "content": message.text(),
                        }],
                    }));
                }
            }
        }

        FormattedRequest {
            system: if system_parts.is_empty() {
                None
            } else {
                Some(system_parts.join("\n\n"))
            },
            messages: out,
        }
    }
}
