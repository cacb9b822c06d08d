//! Embedding system with a process-global disable latch.
//!
//! Any embedding failure flips the latch; all memory work becomes a no-op
//! until the process restarts. Readers must go through the accessors and
//! re-check on every use.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::{config, MatrixError, Result};

static EMBEDDINGS_DISABLED: AtomicBool = AtomicBool::new(false);

/// True when memory work should run: the latch is clear and no disable
/// flag is set in the environment.
pub fn embeddings_enabled() -> bool {
    if EMBEDDINGS_DISABLED.load(Ordering::SeqCst) {
        return false;
    }
    !(config::env_flag("DISABLE_EMBEDDINGS") || config::env_flag("EMBEDDING_DISABLED"))
}

/// Flip the latch. Idempotent; the first caller logs the reason.
pub fn disable_embeddings(reason: &str) {
    if !EMBEDDINGS_DISABLED.swap(true, Ordering::SeqCst) {
        warn!(target: "memory", reason = %reason, "Embeddings disabled for the rest of the process");
    }
}

/// Clear the latch. Test-only escape hatch.
#[doc(hidden)]
pub fn reset_embeddings_latch() {
    EMBEDDINGS_DISABLED.store(false, Ordering::SeqCst);
}

/// One embedding backend. Driver internals (HTTP, local models) live
/// behind this interface.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn id(&self) -> &str;

    fn dimensions(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Process-wide embedding manager. Holds the registered providers and
/// funnels every failure into the global latch.
pub struct EmbeddingManager {
    providers: Vec<Arc<dyn EmbeddingProvider>>,
}

impl EmbeddingManager {
    pub fn new(providers: Vec<Arc<dyn EmbeddingProvider>>) -> Self {
        Self { providers }
    }

    pub fn register(&mut self, provider: Arc<dyn EmbeddingProvider>) {
        self.providers.push(provider);
    }

    pub fn has_active_embedders(&self) -> bool {
        !self.providers.is_empty()
    }

    /// Embed with the first registered provider. A failure disables
    /// embeddings globally before surfacing.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let provider = self.providers.first().ok_or_else(|| {
            MatrixError::EmbeddingUnavailable("no embedding providers registered".to_string())
        })?;
        match provider.embed(text).await {
            Ok(vector) => Ok(vector),
            Err(e) => {
                disable_embeddings(&e.to_string());
                Err(MatrixError::EmbeddingUnavailable(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    struct FixedEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FixedEmbedder {
        fn id(&self) -> &str {
            "fixed"
        }

        fn dimensions(&self) -> usize {
            3
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![1.0, 0.0, 0.0])
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedder {
        fn id(&self) -> &str {
            "failing"
        }

        fn dimensions(&self) -> usize {
            3
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Err(MatrixError::EmbeddingUnavailable("backend offline".to_string()))
        }
    }

    #[tokio::test]
    #[serial]
    async fn failure_flips_the_global_latch() {
        reset_embeddings_latch();
        assert!(embeddings_enabled());

        let manager = EmbeddingManager::new(vec![Arc::new(FailingEmbedder)]);
        assert!(manager.embed("anything").await.is_err());
        assert!(!embeddings_enabled());

        reset_embeddings_latch();
    }

    #[tokio::test]
    #[serial]
    async fn successful_embed_leaves_latch_alone() {
        reset_embeddings_latch();
        let manager = EmbeddingManager::new(vec![Arc::new(FixedEmbedder)]);
        assert_eq!(manager.embed("hi").await.unwrap(), vec![1.0, 0.0, 0.0]);
        assert!(embeddings_enabled());
    }

    #[test]
    #[serial]
    fn env_flag_disables_without_latching() {
        reset_embeddings_latch();
        std::env::set_var("DISABLE_EMBEDDINGS", "1");
        assert!(!embeddings_enabled());
        std::env::remove_var("DISABLE_EMBEDDINGS");
        assert!(embeddings_enabled());
    }
}
