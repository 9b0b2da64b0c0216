//! Inference tasks and the task registry.
//!
//! A task is the unit of per-frame AI work: it declares its name and the
//! names of tasks it depends on, infers over the frame plus prior results,
//! and may draw its annotations onto the shared canvas. The registry computes
//! the per-frame execution plan: a parallel batch of independent tasks, then
//! a topological ordering of the dependent remainder.

mod builtin;
mod registry;

pub use builtin::{BubbleTask, DetectTask, MotionTask};
pub use registry::{ExecutionPlan, RegistryError, TaskDescriptor, TaskRegistry};

use crate::frame::{Canvas, FrameContext, FrameImage, TaskResult};

/// The inference task capability.
///
/// Implementations must be re-entrant: `infer` may run concurrently for
/// different frames and clients, and must not retain the frame beyond the
/// call. A task whose declared dependency failed upstream receives a context
/// with `success: false` for it and must handle that itself; the orchestrator
/// runs the task regardless.
pub trait InferenceTask: Send + Sync + 'static {
    /// Unique task name; also the key of its result in the frame context.
    fn name(&self) -> &str;

    /// Names of tasks that must complete before this one. Empty means
    /// independent (eligible for the parallel batch).
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Run inference for one frame. Failures are returned as
    /// `TaskResult { success: false, .. }`, never panics.
    fn infer(&self, image: &FrameImage, context: &FrameContext) -> TaskResult;

    /// Overlay this task's annotations onto the shared canvas.
    ///
    /// Called in registration order after all tasks ran; `result` is this
    /// task's own result for the frame.
    fn visualize(&self, canvas: &mut Canvas, result: &TaskResult);
}
