//! # Frame Queue
//!
//! Bounded drop-oldest queues for real-time frame pipelines.
//!
//! A [`BoundedQueue`] is a concurrent FIFO with a fixed capacity. When a push
//! would exceed the capacity, the *oldest* buffered item is evicted to make
//! room, so the queue always holds the most recent items. This favors
//! freshness over completeness, which is what a live video pipeline wants:
//! a stalled consumer sees the newest frames, never an ever-growing backlog.
//!
//! Consumers pop asynchronously with a bounded wait; a pop that times out
//! yields `None` rather than failing the caller.

mod queue;

pub use queue::{BoundedQueue, QueueStats};

use thiserror::Error;

/// Errors surfaced by queue construction and closed-queue pushes.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue capacity must be non-zero")]
    ZeroCapacity,

    #[error("queue is closed")]
    Closed,
}
