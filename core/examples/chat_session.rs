//! Minimal chat session against a configured provider.
//!
//! ```bash
//! OPENAI_API_KEY=sk-... cargo run --example chat_session -- "hello there"
//! ```

use matrix_core::{telemetry, Config, LlmConfig, Matrix};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    telemetry::init_telemetry();

    let config = Config {
        llm: LlmConfig {
            provider: std::env::var("MATRIX_PROVIDER").unwrap_or_else(|_| "openai".to_string()),
            model: std::env::var("MATRIX_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            api_key: Some("${OPENAI_API_KEY}".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };

    let matrix = Matrix::new(config).await?;
    let session = matrix.session("example-session");
    session.init().await?;

    let input = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "What did we talk about last time?".to_string());

    let outcome = session.run(&input, None, false, None).await?;
    println!("{}", outcome.response);

    // Let the memory pipelines finish before the process exits.
    outcome.background_operations.wait().await;

    session.disconnect().await?;
    matrix.shutdown().await?;
    Ok(())
}
