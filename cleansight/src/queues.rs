//! Per-client stage queues.

use std::sync::Arc;

use frame_queue::{BoundedQueue, QueueStats};
use serde::Serialize;

use crate::Result;
use crate::delivery::WireFrame;
use crate::frame::{Frame, ProcessedFrame};

/// The four bounded queues mediating one client's pipeline stages.
///
/// All four share one fixed capacity and the drop-oldest policy. Stage
/// mapping:
///
/// - `ready` — tap of the most recent raw frames, for ingest-side consumers
///   (raw traceback, diagnostics). The capture worker writes it alongside
///   `raw`; nothing in the core pipeline depends on it being drained.
/// - `raw` — capture worker → inference orchestrator.
/// - `processed` — inference orchestrator → delivery worker. The segment
///   recorder keeps its own cursor (a separate bounded queue) so a slow
///   recorder never competes with live delivery.
/// - `delivered` — serialized wire frames, drained by the delivery fan-out
///   into per-subscriber buffers.
///
/// No ordering is guaranteed across queues; within each queue FIFO holds, and
/// the `sequence` carried on every frame lets downstream stages detect gaps.
pub struct ClientQueueSet {
    pub ready: BoundedQueue<Frame>,
    pub raw: BoundedQueue<Frame>,
    pub processed: BoundedQueue<Arc<ProcessedFrame>>,
    pub delivered: BoundedQueue<WireFrame>,
}

/// Queue depth and drop counters for one client, as exposed by status
/// introspection.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueSetStats {
    pub ready: StageStats,
    pub raw: StageStats,
    pub processed: StageStats,
    pub delivered: StageStats,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StageStats {
    pub depth: usize,
    pub pushed: u64,
    pub evicted: u64,
}

impl From<QueueStats> for StageStats {
    fn from(stats: QueueStats) -> Self {
        Self {
            depth: stats.depth,
            pushed: stats.pushed,
            evicted: stats.evicted,
        }
    }
}

impl ClientQueueSet {
    /// Create the four queues, each bounded to `capacity`.
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Self {
            ready: BoundedQueue::new(capacity)?,
            raw: BoundedQueue::new(capacity)?,
            processed: BoundedQueue::new(capacity)?,
            delivered: BoundedQueue::new(capacity)?,
        })
    }

    /// Close every queue, waking all blocked consumers.
    pub fn close_all(&self) {
        self.ready.close();
        self.raw.close();
        self.processed.close();
        self.delivered.close();
    }

    /// Drop all buffered items without blocking any caller.
    pub fn drain_all(&self) {
        self.ready.drain();
        self.raw.drain();
        self.processed.drain();
        self.delivered.drain();
    }

    pub fn stats(&self) -> QueueSetStats {
        QueueSetStats {
            ready: self.ready.stats().into(),
            raw: self.raw.stats().into(),
            processed: self.processed.stats().into(),
            delivered: self.delivered.stats().into(),
        }
    }
}
