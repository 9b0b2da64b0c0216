//! Per-frame inference orchestration.

use std::sync::Arc;

use frame_queue::BoundedQueue;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::frame::{Canvas, Frame, FrameContext, ProcessedFrame};
use crate::queues::ClientQueueSet;
use crate::status::StatusBoard;
use crate::tasks::TaskRegistry;

use super::InferencePool;

/// Executes the task plan for every raw frame of one client.
///
/// Per frame: the parallel batch runs concurrently on the shared pool, the
/// dependent remainder runs sequentially in topological order over a frozen
/// context snapshot, then visualizations merge onto one canvas in
/// registration order. A failing task marks its own result and nothing else;
/// the frame always reaches the `processed` queue.
pub struct InferenceOrchestrator {
    client_id: Arc<str>,
    registry: Arc<TaskRegistry>,
    pool: Arc<InferencePool>,
    queues: Arc<ClientQueueSet>,
    /// The segment recorder's independent cursor on the processed stream.
    recording: Arc<BoundedQueue<Arc<ProcessedFrame>>>,
    status: Arc<StatusBoard>,
    token: CancellationToken,
}

impl InferenceOrchestrator {
    pub fn new(
        client_id: Arc<str>,
        registry: Arc<TaskRegistry>,
        pool: Arc<InferencePool>,
        queues: Arc<ClientQueueSet>,
        recording: Arc<BoundedQueue<Arc<ProcessedFrame>>>,
        status: Arc<StatusBoard>,
        token: CancellationToken,
    ) -> Self {
        Self {
            client_id,
            registry,
            pool,
            queues,
            recording,
            status,
            token,
        }
    }

    /// Run until cancellation or queue teardown.
    pub async fn run(self) {
        loop {
            let frame = tokio::select! {
                _ = self.token.cancelled() => break,
                frame = self.queues.raw.pop() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            let processed = self.process_frame(frame).await;
            if self.queues.processed.push(processed.clone()).is_err() {
                break;
            }
            if self.recording.push(processed).is_err() {
                debug!(client_id = %self.client_id, "recording cursor closed");
            }
        }
        debug!(client_id = %self.client_id, "inference orchestrator stopped");
    }

    async fn process_frame(&self, frame: Frame) -> Arc<ProcessedFrame> {
        let plan = self.registry.plan();
        let mut context = FrameContext::new();

        // Independent tasks run concurrently; each sees an empty context.
        if !plan.parallel.is_empty() {
            let empty = Arc::new(FrameContext::new());
            let mut batch = JoinSet::new();
            for task in plan.parallel.iter().cloned() {
                let pool = self.pool.clone();
                let image = frame.image.clone();
                let snapshot = empty.clone();
                let name = task.name().to_string();
                batch.spawn(async move { (name, pool.execute(task, image, snapshot).await) });
            }
            while let Some(joined) = batch.join_next().await {
                match joined {
                    Ok((name, result)) => {
                        if !result.success {
                            trace!(
                                client_id = %self.client_id,
                                task = %name,
                                sequence = frame.sequence,
                                "task failed"
                            );
                        }
                        context.insert(name, result);
                    }
                    Err(join_error) => {
                        warn!(client_id = %self.client_id, error = %join_error, "batch task join failed");
                    }
                }
            }
        }

        // Dependent tasks run sequentially; each reads a frozen snapshot of
        // everything stored so far.
        for task in plan.ordered.iter().cloned() {
            let snapshot = Arc::new(context.clone());
            let name = task.name().to_string();
            let result = self
                .pool
                .execute(task, frame.image.clone(), snapshot)
                .await;
            context.insert(name, result);
        }

        // Merge visualizations in registration order onto one canvas.
        let mut canvas = Canvas::from_image(&frame.image);
        for task in &plan.draw_order {
            if let Some(result) = context.result(task.name()) {
                task.visualize(&mut canvas, result);
            }
        }

        let context = Arc::new(context);
        self.status.apply_results(&self.client_id, &context);

        Arc::new(ProcessedFrame {
            frame,
            annotated: canvas.into_image(),
            context,
        })
    }
}
