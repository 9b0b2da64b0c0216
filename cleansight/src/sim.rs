//! Synthetic sources and sinks.
//!
//! Deterministic stand-ins for the real capture and transport
//! collaborators, used by the test suite and by demos that run the pipeline
//! without cameras or sockets. Failure injection is explicit: open failures,
//! a one-shot mid-stream read error, a sink that dies after N sends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::delivery::{FrameSink, SinkError, WireFrame};
use crate::frame::{FrameImage, ProcessedFrame};
use crate::recorder::{
    KeypointRecord, MemorySegmentStorage, Segment, SegmentHandle, SegmentStorage, StorageError,
};
use crate::source::{FrameSource, SourceError, SourceEvent, SourceKind};

/// A source that synthesizes solid-color frames on a fixed interval.
pub struct SyntheticSource {
    kind: SourceKind,
    image: FrameImage,
    interval: Duration,
    total_frames: u64,
    emitted: u64,
    open_failures: u32,
    read_error_after: Option<u64>,
    read_error_fired: bool,
    opened: bool,
}

impl SyntheticSource {
    pub fn new(kind: SourceKind) -> Self {
        Self {
            kind,
            image: FrameImage::solid(32, 32, [64, 64, 64]),
            interval: Duration::from_millis(1),
            total_frames: u64::MAX,
            emitted: 0,
            open_failures: 0,
            read_error_after: None,
            read_error_fired: false,
            opened: false,
        }
    }

    /// Emit exactly `n` frames, then EOF.
    pub fn with_frames(mut self, n: u64) -> Self {
        self.total_frames = n;
        self
    }

    /// Fail the first `n` open attempts.
    pub fn with_open_failures(mut self, n: u32) -> Self {
        self.open_failures = n;
        self
    }

    /// Fail one read after `n` frames were emitted; reads succeed again
    /// after the source is reopened.
    pub fn with_read_error_after(mut self, n: u64) -> Self {
        self.read_error_after = Some(n);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_image(mut self, image: FrameImage) -> Self {
        self.image = image;
        self
    }
}

#[async_trait]
impl FrameSource for SyntheticSource {
    fn kind(&self) -> &SourceKind {
        &self.kind
    }

    async fn open(&mut self) -> Result<(), SourceError> {
        if self.open_failures > 0 {
            self.open_failures -= 1;
            return Err(SourceError::Open("synthetic open failure".to_string()));
        }
        self.opened = true;
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<SourceEvent, SourceError> {
        if !self.opened {
            return Err(SourceError::NotOpen);
        }
        if let Some(after) = self.read_error_after
            && !self.read_error_fired
            && self.emitted >= after
        {
            self.read_error_fired = true;
            return Err(SourceError::Read("synthetic read failure".to_string()));
        }
        if self.emitted >= self.total_frames {
            return Ok(SourceEvent::Eof);
        }
        tokio::time::sleep(self.interval).await;
        self.emitted += 1;
        Ok(SourceEvent::Frame(self.image.clone()))
    }

    async fn close(&mut self) {
        self.opened = false;
    }
}

/// A sink that collects every delivered frame, with optional failure after
/// a send budget.
#[derive(Default)]
pub struct CollectingSink {
    frames: Mutex<Vec<WireFrame>>,
    fail_after: Option<usize>,
    delay: Option<Duration>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return [`SinkError::Disconnected`] once `n` frames were accepted.
    pub fn fail_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Sleep before accepting each frame, simulating a slow consumer.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn collected(&self) -> Vec<WireFrame> {
        self.frames.lock().clone()
    }
}

#[async_trait]
impl FrameSink for CollectingSink {
    async fn send(&self, frame: WireFrame) -> Result<(), SinkError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut frames = self.frames.lock();
        if let Some(limit) = self.fail_after
            && frames.len() >= limit
        {
            return Err(SinkError::Disconnected);
        }
        frames.push(frame);
        Ok(())
    }
}

/// Storage that retains every appended frame, exposing the processed stream
/// for inspection. Segment bookkeeping is delegated to
/// [`MemorySegmentStorage`].
#[derive(Default)]
pub struct CapturingStorage {
    inner: MemorySegmentStorage,
    frames: Mutex<Vec<ProcessedFrame>>,
}

impl CapturingStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every frame appended so far, in arrival order.
    pub fn frames(&self) -> Vec<ProcessedFrame> {
        self.frames.lock().clone()
    }
}

#[async_trait]
impl SegmentStorage for CapturingStorage {
    async fn open_segment(
        &self,
        client_id: &Arc<str>,
        index: u64,
        start_time: DateTime<Utc>,
    ) -> Result<SegmentHandle, StorageError> {
        self.inner.open_segment(client_id, index, start_time).await
    }

    async fn append_frame(
        &self,
        handle: &SegmentHandle,
        frame: &ProcessedFrame,
    ) -> Result<(), StorageError> {
        self.frames.lock().push(frame.clone());
        self.inner.append_frame(handle, frame).await
    }

    async fn append_keypoints(
        &self,
        handle: &SegmentHandle,
        record: &KeypointRecord,
    ) -> Result<(), StorageError> {
        self.inner.append_keypoints(handle, record).await
    }

    async fn finalize_segment(
        &self,
        handle: &SegmentHandle,
        end_time: DateTime<Utc>,
    ) -> Result<Segment, StorageError> {
        self.inner.finalize_segment(handle, end_time).await
    }

    async fn segments(&self, client_id: &str) -> Result<Vec<Segment>, StorageError> {
        self.inner.segments(client_id).await
    }
}
