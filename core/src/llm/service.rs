//! Tool-calling loop.
//!
//! One `generate` call is one turn: append the user message, loop the
//! provider with tools until it answers in plain text, executing tool
//! calls through the unified manager along the way. Transport errors are
//! retried with linear backoff; retry attempts drop tools to break out of
//! pathological loops.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::client::{ProviderClient, ProviderRequest, ProviderResponse};
use crate::context::{ContextManager, ImageData, Message};
use crate::event::{Event, EventBus};
use crate::tools::UnifiedToolManager;
use crate::{MatrixError, Result};

// OpenTelemetry imports
use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
    KeyValue,
};

const RETRY_ATTEMPTS: usize = 3;
const RETRY_BACKOFF_MS: u64 = 500;

/// Chat seam so the loop can be driven without a live provider.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn provider(&self) -> &str;

    async fn chat(&self, request: &ProviderRequest) -> Result<ProviderResponse>;

    async fn direct(&self, prompt: &str, system: Option<&str>) -> Result<String>;
}

#[async_trait]
impl ChatBackend for ProviderClient {
    fn provider(&self) -> &str {
        ProviderClient::provider(self)
    }

    async fn chat(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        ProviderClient::chat(self, request).await
    }

    async fn direct(&self, prompt: &str, system: Option<&str>) -> Result<String> {
        self.direct_generate(prompt, system).await
    }
}

/// Per-session LLM service.
pub struct LlmService {
    backend: Arc<dyn ChatBackend>,
    ctx: Arc<ContextManager>,
    tools: Arc<UnifiedToolManager>,
    bus: Arc<EventBus>,
    session_id: String,
    max_iterations: usize,

    // OpenTelemetry metrics
    llm_calls_counter: Counter<u64>,
    llm_errors_counter: Counter<u64>,
    llm_latency: Histogram<f64>,
}

impl LlmService {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        ctx: Arc<ContextManager>,
        tools: Arc<UnifiedToolManager>,
        bus: Arc<EventBus>,
        session_id: impl Into<String>,
        max_iterations: usize,
    ) -> Self {
        let meter = global::meter("matrix.llm");

        let llm_calls_counter = meter
            .u64_counter("matrix.llm.calls_total")
            .with_description("Total number of provider calls")
            .init();

        let llm_errors_counter = meter
            .u64_counter("matrix.llm.errors_total")
            .with_description("Total number of provider call failures")
            .init();

        let llm_latency = meter
            .f64_histogram("matrix.llm.latency_ms")
            .with_description("Provider call latency in milliseconds")
            .init();

        Self {
            backend,
            ctx,
            tools,
            bus,
            session_id: session_id.into(),
            max_iterations,
            llm_calls_counter,
            llm_errors_counter,
            llm_latency,
        }
    }

    /// Run one turn. Returns the final assistant text.
    pub async fn generate(
        &self,
        input: &str,
        image_data: Option<&ImageData>,
        stream: bool,
    ) -> Result<String> {
        if stream {
            // Streaming transport is an outer-surface concern; the loop
            // always resolves whole responses.
            debug!(target: "llm_service", "stream requested; responding whole");
        }

        let user_message = match image_data {
            Some(image) => Message::user_with_image(input, image),
            None => Message::user(input),
        };
        self.ctx.add_user_message(user_message).await;

        let message_id = uuid::Uuid::new_v4().to_string();
        self.bus.publish(
            Event::new("llm:responseStarted", json!({"messageId": message_id}))
                .for_session(self.session_id.clone()),
        );

        let tools = self.tools.get_tools_for_provider(self.backend.provider());

        for iteration in 1..=self.max_iterations {
            let formatted = self.ctx.get_formatted_messages().await;
            let request = ProviderRequest {
                system: formatted.system,
                messages: formatted.messages,
                tools: tools.clone(),
                suppress_tools: false,
            };

            let response = match self.call_with_retry(request).await {
                Ok(r) => r,
                Err(e) => {
                    self.bus.publish(
                        Event::new("llm:responseError", json!({"error": e.to_string()}))
                            .for_session(self.session_id.clone()),
                    );
                    return Err(e);
                }
            };

            if response.tool_calls.is_empty() {
                self.ctx.add_assistant_message(response.text.clone()).await;
                self.bus.publish(
                    Event::new(
                        "llm:responseCompleted",
                        json!({"messageId": message_id, "iterations": iteration}),
                    )
                    .for_session(self.session_id.clone()),
                );
                return Ok(response.text);
            }

            // Content ahead of tool calls is the model thinking out loud.
            let preface = response
                .thinking
                .clone()
                .filter(|t| !t.is_empty())
                .or_else(|| Some(response.text.clone()).filter(|t| !t.is_empty()));
            if let Some(text) = preface {
                info!(target: "llm_service", session = %self.session_id, "model thinking: {text}");
                self.bus.publish(
                    Event::new("llm:thinking", json!({"text": text}))
                        .for_session(self.session_id.clone()),
                );
            }

            self.ctx
                .add_assistant_message_with_tool_calls(
                    response.text.clone(),
                    response.tool_calls.clone(),
                )
                .await;

            for call in &response.tool_calls {
                let name = call.function.name.clone();
                let args: Value = match serde_json::from_str(&call.function.arguments) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(target: "llm_service", tool = %name, error = %e, "Tool arguments failed to parse");
                        self.ctx
                            .add_tool_result(
                                call.id.clone(),
                                name,
                                &json!({"error": format!("invalid tool arguments: {e}")}),
                            )
                            .await;
                        continue;
                    }
                };

                let payload = match self
                    .tools
                    .execute_tool(&name, args, Some(&self.session_id))
                    .await
                {
                    Ok(result) => result,
                    Err(e) => json!({"error": e.to_string()}),
                };
                self.ctx
                    .add_tool_result(call.id.clone(), name, &payload)
                    .await;
            }
        }

        self.bus.publish(
            Event::new(
                "llm:responseError",
                json!({"error": "iteration limit exceeded"}),
            )
            .for_session(self.session_id.clone()),
        );
        Err(MatrixError::IterationLimitExceeded(self.max_iterations))
    }

    /// Bypass the context manager entirely; no tools. Reserved for
    /// internal subsystems.
    pub async fn direct_generate(&self, prompt: &str, system: Option<&str>) -> Result<String> {
        self.backend.direct(prompt, system).await
    }

    /// Up to three attempts with linear backoff; the second and third
    /// attempts omit tools and pin tool-choice to none.
    async fn call_with_retry(&self, mut request: ProviderRequest) -> Result<ProviderResponse> {
        let mut last_error: Option<MatrixError> = None;
        for attempt in 1..=RETRY_ATTEMPTS {
            if attempt > 1 {
                tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS * attempt as u64)).await;
                request.suppress_tools = true;
            }

            let started = Instant::now();
            self.llm_calls_counter.add(
                1,
                &[KeyValue::new("provider", self.backend.provider().to_string())],
            );
            match self.backend.chat(&request).await {
                Ok(response) => {
                    self.llm_latency.record(
                        started.elapsed().as_secs_f64() * 1000.0,
                        &[KeyValue::new("provider", self.backend.provider().to_string())],
                    );
                    return Ok(response);
                }
                Err(e) => {
                    self.llm_errors_counter.add(
                        1,
                        &[KeyValue::new("provider", self.backend.provider().to_string())],
                    );
                    warn!(target: "llm_service", attempt, error = %e, "Provider call failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| MatrixError::ProviderTransport("retry budget exhausted".to_string())))
    }
}
