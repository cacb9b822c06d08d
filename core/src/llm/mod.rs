//! LLM layer: per-provider HTTP client and the tool-calling loop service.
//!
//! - `ProviderClient` talks to OpenAI-compatible, Azure, and Anthropic
//!   endpoints and normalizes responses
//! - `LlmService` owns the tool-calling loop over the context manager
//! - `CompletionModel` is the bare completion seam used by internal
//!   subsystems (memory decisions, reasoning evaluation)

pub mod client;
pub mod service;

pub use client::{ProviderClient, ProviderRequest, ProviderResponse};
pub use service::{ChatBackend, LlmService};

use async_trait::async_trait;

use crate::Result;

/// Bare completion interface: one prompt in, one text out, no context
/// manager and no tools.
#[async_trait]
pub trait CompletionModel: Send + Sync {
    async fn complete(&self, system: Option<&str>, prompt: &str) -> Result<String>;
}
