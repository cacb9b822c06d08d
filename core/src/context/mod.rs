//! Per-session transcript management.
//!
//! - **Types**: message, content block, and tool call shapes
//! - **Formatter**: per-provider wire shaping (OpenAI / Azure / Anthropic)
//! - **Manager**: the ordered transcript, history-store mediation, and
//!   restoration strategies

pub mod formatter;
pub mod manager;
pub mod types;

pub use formatter::{
    formatter_for_provider, FormattedRequest, MessageFormatter, ProviderFamily,
};
pub use manager::ContextManager;
pub use types::{ContentBlock, ImageData, Message, MessageContent, MessageRole, ToolCall};
