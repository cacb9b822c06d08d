//! Reflection memory system.
//!
//! # Architecture
//!
//! - **Detector**: reasoning-content gate over the user input
//! - **Types**: trace, step, and evaluation structures
//! - **Tools**: the `extract_reasoning_steps` / `store_reasoning_memory`
//!   pair
//! - **Pipeline**: detect → extract → evaluate → store orchestration

pub mod detector;
pub mod pipeline;
pub mod tools;
pub mod types;

pub use detector::{Detection, ReasoningDetector, DEFAULT_DETECTOR_THRESHOLD};
pub use pipeline::ReflectionPipeline;
pub use tools::{
    ExtractReasoningStepsTool, StoreReasoningMemoryTool, EXTRACT_TOOL_NAME, STORE_TOOL_NAME,
};
pub use types::{ReasoningStep, ReasoningTrace, TraceEvaluation};
