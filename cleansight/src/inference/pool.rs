//! Cross-client inference worker pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::warn;

use crate::frame::{FrameContext, FrameImage, TaskResult};
use crate::tasks::InferenceTask;

/// Bounded worker pool shared by every client session.
///
/// Concurrency is capped by a semaphore sized to the configured worker
/// count; task bodies run on the blocking thread pool. Each execution is
/// bound by the per-task timeout so one stuck model cannot starve the pool
/// across clients: on timeout the caller gets a failed [`TaskResult`]
/// immediately, and the permit is released when the blocking body actually
/// returns, keeping the concurrency bound honest.
pub struct InferencePool {
    semaphore: Arc<Semaphore>,
    task_timeout: Duration,
}

impl InferencePool {
    pub fn new(max_workers: usize, task_timeout: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_workers)),
            task_timeout,
        }
    }

    /// Execute one task for one frame.
    ///
    /// Panics, errors, and timeouts inside the task all come back as
    /// `TaskResult { success: false, error }`; nothing escapes into pipeline
    /// control flow.
    pub async fn execute(
        &self,
        task: Arc<dyn InferenceTask>,
        image: FrameImage,
        context: Arc<FrameContext>,
    ) -> TaskResult {
        let name = task.name().to_string();

        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return TaskResult::failed("inference pool is shut down"),
        };

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            task.infer(&image, &context)
        });

        match tokio::time::timeout(self.task_timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                warn!(task = %name, error = %join_error, "inference task panicked");
                TaskResult::failed(format!("task panicked: {join_error}"))
            }
            Err(_) => {
                warn!(task = %name, timeout = ?self.task_timeout, "inference task timed out");
                TaskResult::failed(format!(
                    "task timed out after {}ms",
                    self.task_timeout.as_millis()
                ))
            }
        }
    }
}
