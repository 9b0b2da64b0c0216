//! Client sessions and the pipeline manager.
//!
//! A [`Pipeline`] owns the shared pieces of the system: the task registry,
//! the inference pool, the status board, and the segment storage backend.
//! Each `start_session` wires one client's worker chain (capture →
//! inference → delivery and recording) around a fresh queue set and
//! cancellation token; `stop_session` tears it down cooperatively within a
//! grace period.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use frame_queue::BoundedQueue;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::{CaptureWorker, IngestState};
use crate::config::PipelineConfig;
use crate::delivery::{DeliveryWorker, FrameSink, SubscriberId, SubscriberSet};
use crate::error::{Error, Result};
use crate::frame::ProcessedFrame;
use crate::inference::{InferenceOrchestrator, InferencePool};
use crate::queues::{ClientQueueSet, QueueSetStats};
use crate::recorder::{SegmentRecorder, SegmentStorage};
use crate::source::FrameSource;
use crate::status::{CleaningStep, StatusBoard, TaskPhase, TaskStatus};
use crate::tasks::TaskRegistry;

/// Externally visible lifecycle of one client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Worker chain is up, first connect still in progress.
    Starting,
    Running,
    /// Mid-stream connection loss; the session and its queues survive.
    Reconnecting,
    Stopped,
    /// Connect retry ceiling exceeded; the session tore itself down.
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Stopped => "stopped",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One client's live worker chain.
pub struct ClientSession {
    client_id: Arc<str>,
    queues: Arc<ClientQueueSet>,
    recording: Arc<BoundedQueue<Arc<ProcessedFrame>>>,
    subscribers: Arc<SubscriberSet>,
    state_rx: watch::Receiver<SessionState>,
    token: CancellationToken,
    workers: Mutex<JoinSet<()>>,
}

impl ClientSession {
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn stats(&self) -> QueueSetStats {
        self.queues.stats()
    }
}

type SessionMap = DashMap<String, Arc<ClientSession>>;

/// The explicitly constructed pipeline manager.
pub struct Pipeline {
    config: PipelineConfig,
    registry: Arc<TaskRegistry>,
    pool: Arc<InferencePool>,
    status: Arc<StatusBoard>,
    storage: Arc<dyn SegmentStorage>,
    sessions: Arc<SessionMap>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, storage: Arc<dyn SegmentStorage>) -> Result<Self> {
        config.validate()?;
        let pool = Arc::new(InferencePool::new(
            config.inference_workers,
            config.task_timeout(),
        ));
        Ok(Self {
            config,
            registry: Arc::new(TaskRegistry::new()),
            pool,
            status: Arc::new(StatusBoard::new()),
            storage,
            sessions: Arc::new(DashMap::new()),
        })
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Start the worker chain for a client. At most one session per client.
    pub fn start_session(&self, client_id: &str, source: Box<dyn FrameSource>) -> Result<()> {
        if self.sessions.contains_key(client_id) {
            return Err(Error::SessionAlreadyActive {
                client_id: client_id.to_string(),
            });
        }

        let id: Arc<str> = Arc::from(client_id);
        let queues = Arc::new(ClientQueueSet::new(self.config.queue_capacity)?);
        let recording = Arc::new(BoundedQueue::new(self.config.queue_capacity)?);
        let subscribers = Arc::new(SubscriberSet::new(id.clone(), self.config.queue_capacity));
        let token = CancellationToken::new();

        // A stale machine from a previous failed session starts over.
        self.status.remove(client_id);
        self.status.register(client_id);

        let (capture, ingest_rx) = CaptureWorker::new(
            id.clone(),
            source,
            queues.clone(),
            &self.config,
            token.clone(),
        );
        let orchestrator = InferenceOrchestrator::new(
            id.clone(),
            self.registry.clone(),
            self.pool.clone(),
            queues.clone(),
            recording.clone(),
            self.status.clone(),
            token.clone(),
        );
        let delivery = DeliveryWorker::new(
            id.clone(),
            queues.clone(),
            subscribers.clone(),
            token.clone(),
        );
        let recorder = SegmentRecorder::new(
            id.clone(),
            recording.clone(),
            self.storage.clone(),
            self.config.segment_rollover(),
            token.clone(),
        );

        let (state_tx, state_rx) = watch::channel(SessionState::Starting);

        let mut workers = JoinSet::new();
        workers.spawn(async move {
            let _ = capture.run().await;
        });
        workers.spawn(orchestrator.run());
        workers.spawn(delivery.run());
        workers.spawn(recorder.run());
        workers.spawn(monitor(
            id.clone(),
            ingest_rx,
            state_tx,
            self.status.clone(),
            queues.clone(),
            recording.clone(),
            token.clone(),
            Arc::downgrade(&self.sessions),
        ));

        let session = Arc::new(ClientSession {
            client_id: id.clone(),
            queues,
            recording,
            subscribers,
            state_rx,
            token,
            workers: Mutex::new(workers),
        });
        self.sessions.insert(client_id.to_string(), session);
        info!(client_id = %id, "session started");
        Ok(())
    }

    /// Stop a client's session. Idempotent: stopping an absent session is a
    /// no-op.
    pub async fn stop_session(&self, client_id: &str) -> Result<()> {
        let Some((_, session)) = self.sessions.remove(client_id) else {
            debug!(client_id, "stop requested for inactive session");
            return Ok(());
        };

        session.token.cancel();
        session.queues.close_all();
        session.recording.close();
        session.subscribers.shutdown();

        let mut workers = std::mem::take(&mut *session.workers.lock());
        let drained = tokio::time::timeout(self.config.stop_grace(), async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                client_id = %session.client_id,
                grace_ms = self.config.stop_grace_ms,
                "workers still running after grace period, force-closing"
            );
            workers.abort_all();
        }

        let _ = self.status.transition(client_id, TaskPhase::Terminated);
        self.status.remove(client_id);
        info!(client_id = %session.client_id, "session stopped");
        Ok(())
    }

    /// Attach a delivery sink to a running session.
    pub fn subscribe(&self, client_id: &str, sink: Arc<dyn FrameSink>) -> Result<SubscriberId> {
        let session = self.session(client_id)?;
        session.subscribers.subscribe(sink)
    }

    /// Detach a subscriber. The session keeps running.
    pub fn unsubscribe(&self, client_id: &str, id: SubscriberId) -> Result<bool> {
        let session = self.session(client_id)?;
        Ok(session.subscribers.unsubscribe(id))
    }

    pub fn session_state(&self, client_id: &str) -> Option<SessionState> {
        self.sessions.get(client_id).map(|session| session.state())
    }

    /// Queue depth and drop counters for a running session.
    pub fn session_stats(&self, client_id: &str) -> Option<QueueSetStats> {
        self.sessions.get(client_id).map(|session| session.stats())
    }

    /// Always answers; idle when the client has no session.
    pub fn get_status(&self, client_id: &str) -> TaskStatus {
        self.status.get_status(client_id)
    }

    pub fn set_cleaning_step(&self, client_id: &str, step: CleaningStep) {
        self.status.set_step(client_id, step);
    }

    pub fn transition(&self, client_id: &str, phase: TaskPhase) -> Result<()> {
        self.status.transition(client_id, phase)
    }

    /// Stop every session, tearing them down concurrently.
    pub async fn shutdown(&self) -> Result<()> {
        let client_ids: Vec<String> = self
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let stops = client_ids.iter().map(|client_id| self.stop_session(client_id));
        for outcome in futures::future::join_all(stops).await {
            outcome?;
        }
        Ok(())
    }

    fn session(&self, client_id: &str) -> Result<Arc<ClientSession>> {
        self.sessions
            .get(client_id)
            .map(|session| session.clone())
            .ok_or_else(|| Error::SessionNotFound {
                client_id: client_id.to_string(),
            })
    }
}

/// Maps ingest state onto session state and the status board, and tears the
/// session down when ingestion fails terminally.
#[allow(clippy::too_many_arguments)]
async fn monitor(
    client_id: Arc<str>,
    mut ingest_rx: watch::Receiver<IngestState>,
    state_tx: watch::Sender<SessionState>,
    status: Arc<StatusBoard>,
    queues: Arc<ClientQueueSet>,
    recording: Arc<BoundedQueue<Arc<ProcessedFrame>>>,
    token: CancellationToken,
    sessions: Weak<SessionMap>,
) {
    let mut streamed = false;
    loop {
        let changed = tokio::select! {
            _ = token.cancelled() => break,
            changed = ingest_rx.changed() => changed,
        };
        if changed.is_err() {
            break;
        }
        let ingest = *ingest_rx.borrow_and_update();

        let next = match ingest {
            IngestState::Disconnected | IngestState::Connecting => {
                if streamed {
                    SessionState::Reconnecting
                } else {
                    SessionState::Starting
                }
            }
            IngestState::Streaming => {
                streamed = true;
                SessionState::Running
            }
            IngestState::Stopped => SessionState::Stopped,
            IngestState::Failed => SessionState::Failed,
        };
        let _ = state_tx.send(next);

        match ingest {
            IngestState::Streaming => {
                let _ = status.transition(&client_id, TaskPhase::Running);
            }
            IngestState::Stopped => {
                // Source EOF: the task ran to completion.
                let _ = status.transition(&client_id, TaskPhase::Completed);
                break;
            }
            IngestState::Failed => {
                warn!(client_id = %client_id, "ingestion failed, tearing session down");
                let _ = status.transition(&client_id, TaskPhase::Error);
                token.cancel();
                queues.close_all();
                recording.close();
                if let Some(sessions) = sessions.upgrade() {
                    sessions.remove(client_id.as_ref());
                }
                break;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::recorder::MemorySegmentStorage;
    use crate::sim::{CollectingSink, SyntheticSource};
    use crate::source::SourceKind;
    use crate::tasks::DetectTask;

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            target_fps: 1000,
            connect_backoff_ms: 5,
            stop_grace_ms: 500,
            ..PipelineConfig::default()
        }
    }

    fn pipeline() -> Pipeline {
        Pipeline::new(test_config(), Arc::new(MemorySegmentStorage::new())).unwrap()
    }

    fn kind() -> SourceKind {
        SourceKind::Camera(0)
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn duplicate_start_is_rejected() {
        let pipeline = pipeline();
        let source = SyntheticSource::new(kind()).with_frames(1000);
        pipeline.start_session("cam1", Box::new(source)).unwrap();

        let another = SyntheticSource::new(kind()).with_frames(1);
        let result = pipeline.start_session("cam1", Box::new(another));
        assert!(matches!(result, Err(Error::SessionAlreadyActive { .. })));

        pipeline.stop_session("cam1").await.unwrap();
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_resets_status() {
        let pipeline = pipeline();
        pipeline.registry().register(Arc::new(DetectTask)).unwrap();
        let source = SyntheticSource::new(kind()).with_frames(1000);
        pipeline.start_session("cam1", Box::new(source)).unwrap();
        wait_for(|| pipeline.session_state("cam1") == Some(SessionState::Running)).await;

        pipeline.stop_session("cam1").await.unwrap();
        assert!(pipeline.session_state("cam1").is_none());
        assert_eq!(pipeline.get_status("cam1").status.code, "idle");

        // Second stop is a no-op.
        pipeline.stop_session("cam1").await.unwrap();
    }

    #[tokio::test]
    async fn eof_completes_the_session() {
        let pipeline = pipeline();
        let source = SyntheticSource::new(kind()).with_frames(3);
        pipeline.start_session("cam1", Box::new(source)).unwrap();

        wait_for(|| pipeline.session_state("cam1") == Some(SessionState::Stopped)).await;
        assert_eq!(pipeline.get_status("cam1").status.code, "completed");

        pipeline.stop_session("cam1").await.unwrap();
    }

    #[tokio::test]
    async fn connect_failure_tears_the_session_down() {
        let pipeline = pipeline();
        let source = SyntheticSource::new(kind())
            .with_frames(1)
            .with_open_failures(100);
        pipeline.start_session("cam1", Box::new(source)).unwrap();

        wait_for(|| pipeline.session_state("cam1").is_none()).await;
        assert_eq!(pipeline.get_status("cam1").status.code, "error");

        // The failed client can start again with a healthy source.
        let source = SyntheticSource::new(kind()).with_frames(1000);
        pipeline.start_session("cam1", Box::new(source)).unwrap();
        wait_for(|| pipeline.session_state("cam1") == Some(SessionState::Running)).await;
        pipeline.stop_session("cam1").await.unwrap();
    }

    #[tokio::test]
    async fn subscribers_receive_annotated_frames() {
        let pipeline = pipeline();
        pipeline.registry().register(Arc::new(DetectTask)).unwrap();
        let source = SyntheticSource::new(kind()).with_frames(1000);
        pipeline.start_session("cam1", Box::new(source)).unwrap();

        let sink = Arc::new(CollectingSink::new());
        let id = pipeline.subscribe("cam1", sink.clone()).unwrap();
        wait_for(|| sink.collected().len() >= 3).await;

        assert!(pipeline.unsubscribe("cam1", id).unwrap());
        assert!(!pipeline.unsubscribe("cam1", id).unwrap());
        pipeline.stop_session("cam1").await.unwrap();
    }

    #[tokio::test]
    async fn stats_expose_queue_counters() {
        let pipeline = pipeline();
        let source = SyntheticSource::new(kind()).with_frames(1000);
        pipeline.start_session("cam1", Box::new(source)).unwrap();
        wait_for(|| {
            pipeline
                .session_stats("cam1")
                .map(|stats| stats.raw.pushed > 0)
                .unwrap_or(false)
        })
        .await;
        assert!(pipeline.session_stats("missing").is_none());
        pipeline.shutdown().await.unwrap();
    }
}
