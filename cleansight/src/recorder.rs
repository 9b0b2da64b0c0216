//! Segment recording: annotated frames and keypoint traceback.
//!
//! The recorder drains its own cursor on the processed stream and appends
//! each frame to the current segment, rolling to a new one once the
//! configured duration has elapsed. Segments are contiguous: a new segment
//! starts exactly where the previous one ended, and an interval with no
//! frames extends the current segment instead of producing empty ones.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use frame_queue::BoundedQueue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::frame::ProcessedFrame;
use crate::tasks::DetectTask;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("unknown segment handle {0}")]
    UnknownSegment(Uuid),
    #[error("segment storage io: {0}")]
    Io(#[from] std::io::Error),
    #[error("segment metadata: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// An open, in-progress segment. Plain data; the storage backend keys its
/// internal state off `id`.
#[derive(Debug, Clone)]
pub struct SegmentHandle {
    pub id: Uuid,
    pub client_id: Arc<str>,
    /// Per-session monotonic index, starting at 0.
    pub index: u64,
    pub start_time: DateTime<Utc>,
}

/// Keypoints of one frame, recorded for post-session traceback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeypointRecord {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub keypoints: Vec<Value>,
}

/// A finalized segment's metadata.
#[derive(Debug, Clone, Serialize)]
pub struct Segment {
    pub segment_id: Uuid,
    pub client_id: String,
    pub index: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub frame_count: u64,
    /// Frames that contributed a keypoint record to the traceback log.
    pub keypoint_count: u64,
    /// Where the frame data landed, for backends with a filesystem footprint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keypoints_path: Option<PathBuf>,
}

/// Storage backend for recorded segments.
#[async_trait]
pub trait SegmentStorage: Send + Sync {
    async fn open_segment(
        &self,
        client_id: &Arc<str>,
        index: u64,
        start_time: DateTime<Utc>,
    ) -> Result<SegmentHandle, StorageError>;

    async fn append_frame(
        &self,
        handle: &SegmentHandle,
        frame: &ProcessedFrame,
    ) -> Result<(), StorageError>;

    async fn append_keypoints(
        &self,
        handle: &SegmentHandle,
        record: &KeypointRecord,
    ) -> Result<(), StorageError>;

    async fn finalize_segment(
        &self,
        handle: &SegmentHandle,
        end_time: DateTime<Utc>,
    ) -> Result<Segment, StorageError>;

    /// Finalized segments for one client, in index order.
    async fn segments(&self, client_id: &str) -> Result<Vec<Segment>, StorageError>;
}

#[derive(Default)]
struct OpenCounters {
    frame_count: u64,
    keypoint_count: u64,
}

/// In-memory backend for tests and ephemeral deployments. Frame pixels are
/// counted, not retained.
#[derive(Default)]
pub struct MemorySegmentStorage {
    open: DashMap<Uuid, OpenCounters>,
    finalized: Mutex<Vec<Segment>>,
}

impl MemorySegmentStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SegmentStorage for MemorySegmentStorage {
    async fn open_segment(
        &self,
        client_id: &Arc<str>,
        index: u64,
        start_time: DateTime<Utc>,
    ) -> Result<SegmentHandle, StorageError> {
        let handle = SegmentHandle {
            id: Uuid::new_v4(),
            client_id: client_id.clone(),
            index,
            start_time,
        };
        self.open.insert(handle.id, OpenCounters::default());
        Ok(handle)
    }

    async fn append_frame(
        &self,
        handle: &SegmentHandle,
        _frame: &ProcessedFrame,
    ) -> Result<(), StorageError> {
        let mut counters = self
            .open
            .get_mut(&handle.id)
            .ok_or(StorageError::UnknownSegment(handle.id))?;
        counters.frame_count += 1;
        Ok(())
    }

    async fn append_keypoints(
        &self,
        handle: &SegmentHandle,
        _record: &KeypointRecord,
    ) -> Result<(), StorageError> {
        let mut counters = self
            .open
            .get_mut(&handle.id)
            .ok_or(StorageError::UnknownSegment(handle.id))?;
        counters.keypoint_count += 1;
        Ok(())
    }

    async fn finalize_segment(
        &self,
        handle: &SegmentHandle,
        end_time: DateTime<Utc>,
    ) -> Result<Segment, StorageError> {
        let (_, counters) = self
            .open
            .remove(&handle.id)
            .ok_or(StorageError::UnknownSegment(handle.id))?;
        let segment = Segment {
            segment_id: handle.id,
            client_id: handle.client_id.to_string(),
            index: handle.index,
            start_time: handle.start_time,
            end_time,
            frame_count: counters.frame_count,
            keypoint_count: counters.keypoint_count,
            path: None,
            keypoints_path: None,
        };
        self.finalized.lock().push(segment.clone());
        Ok(segment)
    }

    async fn segments(&self, client_id: &str) -> Result<Vec<Segment>, StorageError> {
        let mut segments: Vec<Segment> = self
            .finalized
            .lock()
            .iter()
            .filter(|segment| segment.client_id == client_id)
            .cloned()
            .collect();
        segments.sort_by_key(|segment| segment.index);
        Ok(segments)
    }
}

struct FsOpenSegment {
    dir: PathBuf,
    frame_count: u64,
    keypoint_count: u64,
}

/// Filesystem backend. Layout under the root:
///
/// ```text
/// <root>/<client_id>/segment_00000/frames.rgb24
///                                  keypoints.jsonl
///                                  meta.json
/// ```
///
/// Frame data is the annotated RGB24 pixels appended back to back;
/// keypoints are JSON lines. `meta.json` is written at finalize.
pub struct FsSegmentStorage {
    root: PathBuf,
    open: DashMap<Uuid, FsOpenSegment>,
    finalized: Mutex<Vec<Segment>>,
}

impl FsSegmentStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            open: DashMap::new(),
            finalized: Mutex::new(Vec::new()),
        }
    }

    fn segment_dir(&self, client_id: &str, index: u64) -> PathBuf {
        self.root.join(client_id).join(format!("segment_{index:05}"))
    }

    async fn append(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl SegmentStorage for FsSegmentStorage {
    async fn open_segment(
        &self,
        client_id: &Arc<str>,
        index: u64,
        start_time: DateTime<Utc>,
    ) -> Result<SegmentHandle, StorageError> {
        let dir = self.segment_dir(client_id, index);
        tokio::fs::create_dir_all(&dir).await?;
        let handle = SegmentHandle {
            id: Uuid::new_v4(),
            client_id: client_id.clone(),
            index,
            start_time,
        };
        self.open.insert(
            handle.id,
            FsOpenSegment {
                dir,
                frame_count: 0,
                keypoint_count: 0,
            },
        );
        Ok(handle)
    }

    async fn append_frame(
        &self,
        handle: &SegmentHandle,
        frame: &ProcessedFrame,
    ) -> Result<(), StorageError> {
        let dir = {
            let open = self
                .open
                .get(&handle.id)
                .ok_or(StorageError::UnknownSegment(handle.id))?;
            open.dir.clone()
        };
        Self::append(&dir.join("frames.rgb24"), &frame.annotated.data).await?;
        let mut open = self
            .open
            .get_mut(&handle.id)
            .ok_or(StorageError::UnknownSegment(handle.id))?;
        open.frame_count += 1;
        Ok(())
    }

    async fn append_keypoints(
        &self,
        handle: &SegmentHandle,
        record: &KeypointRecord,
    ) -> Result<(), StorageError> {
        let dir = {
            let open = self
                .open
                .get(&handle.id)
                .ok_or(StorageError::UnknownSegment(handle.id))?;
            open.dir.clone()
        };
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        Self::append(&dir.join("keypoints.jsonl"), &line).await?;
        let mut open = self
            .open
            .get_mut(&handle.id)
            .ok_or(StorageError::UnknownSegment(handle.id))?;
        open.keypoint_count += 1;
        Ok(())
    }

    async fn finalize_segment(
        &self,
        handle: &SegmentHandle,
        end_time: DateTime<Utc>,
    ) -> Result<Segment, StorageError> {
        let (_, open) = self
            .open
            .remove(&handle.id)
            .ok_or(StorageError::UnknownSegment(handle.id))?;
        let keypoints_path = open.dir.join("keypoints.jsonl");
        let segment = Segment {
            segment_id: handle.id,
            client_id: handle.client_id.to_string(),
            index: handle.index,
            start_time: handle.start_time,
            end_time,
            frame_count: open.frame_count,
            keypoint_count: open.keypoint_count,
            path: Some(open.dir.join("frames.rgb24")),
            keypoints_path: keypoints_path
                .exists()
                .then_some(keypoints_path),
        };
        let meta = serde_json::to_vec_pretty(&segment)?;
        tokio::fs::write(open.dir.join("meta.json"), meta).await?;
        self.finalized.lock().push(segment.clone());
        Ok(segment)
    }

    async fn segments(&self, client_id: &str) -> Result<Vec<Segment>, StorageError> {
        let mut segments: Vec<Segment> = self
            .finalized
            .lock()
            .iter()
            .filter(|segment| segment.client_id == client_id)
            .cloned()
            .collect();
        segments.sort_by_key(|segment| segment.index);
        Ok(segments)
    }
}

struct OpenState {
    handle: SegmentHandle,
    opened: tokio::time::Instant,
    last_captured_at: DateTime<Utc>,
}

/// Drains the recording cursor into rolling segments.
pub struct SegmentRecorder {
    client_id: Arc<str>,
    source: Arc<BoundedQueue<Arc<ProcessedFrame>>>,
    storage: Arc<dyn SegmentStorage>,
    rollover: Duration,
    token: CancellationToken,
}

impl SegmentRecorder {
    pub fn new(
        client_id: Arc<str>,
        source: Arc<BoundedQueue<Arc<ProcessedFrame>>>,
        storage: Arc<dyn SegmentStorage>,
        rollover: Duration,
        token: CancellationToken,
    ) -> Self {
        Self {
            client_id,
            source,
            storage,
            rollover,
            token,
        }
    }

    /// Run until cancellation, upstream teardown, or a storage failure.
    ///
    /// A storage error disables recording for the session; the pipeline
    /// keeps running without it.
    pub async fn run(self) {
        let mut current: Option<OpenState> = None;
        let mut next_index: u64 = 0;

        loop {
            let frame = tokio::select! {
                _ = self.token.cancelled() => break,
                frame = self.source.pop() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            // Roll on frame arrival only, so idle intervals extend the
            // current segment instead of creating empty ones.
            let should_roll = current
                .as_ref()
                .is_some_and(|open| open.opened.elapsed() >= self.rollover);
            if should_roll && let Some(open) = current.take() {
                match self
                    .storage
                    .finalize_segment(&open.handle, frame.frame.captured_at)
                    .await
                {
                    Ok(segment) => {
                        info!(
                            client_id = %self.client_id,
                            index = segment.index,
                            frames = segment.frame_count,
                            "segment finalized"
                        );
                    }
                    Err(error) => {
                        warn!(client_id = %self.client_id, error = %error, "segment finalize failed, recording disabled");
                        return;
                    }
                }
            }

            if current.is_none() {
                // Contiguity: the new segment starts where the last ended,
                // which for a roll is the triggering frame's capture time.
                let start_time = frame.frame.captured_at;
                match self
                    .storage
                    .open_segment(&self.client_id, next_index, start_time)
                    .await
                {
                    Ok(handle) => {
                        debug!(client_id = %self.client_id, index = next_index, "segment opened");
                        current = Some(OpenState {
                            handle,
                            opened: tokio::time::Instant::now(),
                            last_captured_at: start_time,
                        });
                        next_index += 1;
                    }
                    Err(error) => {
                        warn!(client_id = %self.client_id, error = %error, "segment open failed, recording disabled");
                        return;
                    }
                }
            }

            let open = match current.as_mut() {
                Some(open) => open,
                None => continue,
            };
            open.last_captured_at = frame.frame.captured_at;

            if let Err(error) = self.storage.append_frame(&open.handle, &frame).await {
                warn!(client_id = %self.client_id, error = %error, "frame append failed, recording disabled");
                return;
            }
            if let Some(record) = keypoints_of(&frame)
                && let Err(error) = self.storage.append_keypoints(&open.handle, &record).await
            {
                warn!(client_id = %self.client_id, error = %error, "keypoint append failed, recording disabled");
                return;
            }
        }

        if let Some(open) = current {
            match self
                .storage
                .finalize_segment(&open.handle, open.last_captured_at)
                .await
            {
                Ok(segment) => {
                    info!(
                        client_id = %self.client_id,
                        index = segment.index,
                        frames = segment.frame_count,
                        "final segment closed"
                    );
                }
                Err(error) => {
                    warn!(client_id = %self.client_id, error = %error, "final segment close failed");
                }
            }
        }
        debug!(client_id = %self.client_id, "segment recorder stopped");
    }
}

/// Extract the detect keypoints of one frame, if detection succeeded.
fn keypoints_of(frame: &ProcessedFrame) -> Option<KeypointRecord> {
    let detect = frame.context.result(DetectTask::NAME)?;
    if !detect.success {
        return None;
    }
    let keypoints = detect.payload.get("keypoints")?.as_array()?.clone();
    Some(KeypointRecord {
        sequence: frame.frame.sequence,
        timestamp: frame.frame.captured_at,
        keypoints,
    })
}
