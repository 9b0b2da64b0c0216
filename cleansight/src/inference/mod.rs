//! Per-frame inference execution.

mod orchestrator;
mod pool;

pub use orchestrator::InferenceOrchestrator;
pub use pool::InferencePool;
