//! Core transcript types.
//!
//! A `Message` is the atomic transcript unit: role, plain or multipart
//! content, and (for assistant messages) the tool calls it requested.
//! Messages are never re-ordered after append.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{MatrixError, Result};

/// Roles for messages in conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One block of multipart message content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { image: String, mime_type: String },
    Thinking { thinking: String },
    RedactedThinking { data: String },
}

/// Message content: plain text or structured blocks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Flatten to display text (text and thinking blocks only).
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    ContentBlock::Thinking { thinking } => Some(thinking.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// The function half of a tool call. Arguments stay JSON-encoded text;
/// only the tool implementation interprets them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolFunction {
    pub name: String,
    pub arguments: String,
}

/// A tool call requested by the assistant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub function: ToolFunction,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            function: ToolFunction {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// Single message in the transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: MessageContent::Text(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn user_with_image(text: impl Into<String>, image: &ImageData) -> Self {
        Self {
            role: MessageRole::User,
            content: MessageContent::Blocks(vec![
                ContentBlock::Text { text: text.into() },
                ContentBlock::Image {
                    image: image.image.clone(),
                    mime_type: image.mime_type.clone(),
                },
            ]),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: MessageContent::Text(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: MessageContent::Text(content.into()),
            tool_calls,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: MessageContent::Text(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    /// A tool-result message satisfying the call with the given id.
    pub fn tool_result(call_id: impl Into<String>, name: impl Into<String>, payload: &Value) -> Self {
        let content = match payload {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Self {
            role: MessageRole::Tool,
            content: MessageContent::Text(content),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
            name: Some(name.into()),
        }
    }

    pub fn text(&self) -> String {
        self.content.as_text()
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Image attachment accompanying a user turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageData {
    /// Base64-encoded image bytes.
    pub image: String,
    pub mime_type: String,
}

impl ImageData {
    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(MatrixError::UserInputInvalid(
                "image data must not be empty".to_string(),
            ));
        }
        if self.mime_type.trim().is_empty() {
            return Err(MatrixError::UserInputInvalid(
                "image mime type must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_roundtrips_through_serde() {
        let msg = Message::assistant_with_tool_calls(
            "checking",
            vec![ToolCall::new("call_1", "search", r#"{"query":"rust"}"#)],
        );
        let raw = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.tool_calls[0].function.name, "search");
    }

    #[test]
    fn tool_result_carries_call_association() {
        let msg = Message::tool_result("call_9", "search", &json!({"count": 3}));
        assert_eq!(msg.role, MessageRole::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_9"));
        assert_eq!(msg.name.as_deref(), Some("search"));
    }

    #[test]
    fn multipart_content_flattens_to_text() {
        let image = ImageData {
            image: "aGk=".to_string(),
            mime_type: "image/png".to_string(),
        };
        let msg = Message::user_with_image("what is this?", &image);
        assert_eq!(msg.text(), "what is this?");
    }

    #[test]
    fn image_validation_rejects_blanks() {
        assert!(ImageData {
            image: "".to_string(),
            mime_type: "image/png".to_string()
        }
        .validate()
        .is_err());
        assert!(ImageData {
            image: "aGk=".to_string(),
            mime_type: " ".to_string()
        }
        .validate()
        .is_err());
        assert!(ImageData {
            image: "aGk=".to_string(),
            mime_type: "image/png".to_string()
        }
        .validate()
        .is_ok());
    }
}
