//! Knowledge memory system.
//!
//! # Architecture
//!
//! - **Embedding**: provider seam + process-global disable latch
//! - **Store**: vector store seam + in-memory cosine implementation
//! - **Extraction**: high-signal fact extraction from interaction text
//! - **Decision**: ADD/UPDATE/DELETE/NONE engine with LLM and
//!   similarity-only strategies
//! - **Tool**: the internal memory tool driving extract → decide → persist
//! - **Pipeline**: background orchestration after each foreground turn

pub mod decision;
pub mod embedding;
pub mod extraction;
pub mod pipeline;
pub mod store;
pub mod tool;

pub use decision::{
    DecisionEngine, MemoryAction, MemoryEvent, MemoryOptions, QualitySource,
};
pub use embedding::{
    disable_embeddings, embeddings_enabled, EmbeddingManager, EmbeddingProvider,
};
pub use extraction::{ExtractedFact, FactExtractor};
pub use pipeline::{
    InteractionData, KnowledgeMemoryPipeline, MemoryRunOverrides, MetadataSchema,
};
pub use store::{
    allocate_knowledge_id, InMemoryVectorStore, SearchHit, VectorStore, KNOWLEDGE_COLLECTION,
    KNOWLEDGE_ID_MAX, REFLECTION_COLLECTION, REFLECTION_ID_BASE,
};
pub use tool::{KnowledgeMemoryTool, KNOWLEDGE_TOOL_NAME, WORKSPACE_TOOL_NAME};
