//! Bounded drop-oldest FIFO queue.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use crate::QueueError;

/// Counters describing the lifetime of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Items currently buffered.
    pub depth: usize,
    /// Total items accepted by `push`.
    pub pushed: u64,
    /// Total items evicted because the queue was full.
    pub evicted: u64,
}

struct Inner<T> {
    items: VecDeque<T>,
    pushed: u64,
    evicted: u64,
    closed: bool,
}

/// A concurrent bounded FIFO that evicts its oldest item when full.
///
/// Multiple producers and consumers may share the queue through a reference
/// or an `Arc`. Per-queue FIFO order is guaranteed; a full push removes the
/// head before inserting the new item, so capacity is never exceeded and the
/// newest items always survive.
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Result<Self, QueueError> {
        if capacity == 0 {
            return Err(QueueError::ZeroCapacity);
        }
        Ok(Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                pushed: 0,
                evicted: 0,
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        })
    }

    /// Push an item, evicting the oldest buffered item if the queue is full.
    ///
    /// Returns the evicted item, if any. Pushing to a closed queue fails.
    pub fn push(&self, item: T) -> Result<Option<T>, QueueError> {
        let evicted = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(QueueError::Closed);
            }
            let evicted = if inner.items.len() == self.capacity {
                inner.evicted += 1;
                inner.items.pop_front()
            } else {
                None
            };
            inner.items.push_back(item);
            inner.pushed += 1;
            evicted
        };
        if evicted.is_some() {
            trace!(capacity = self.capacity, "queue full, evicted oldest item");
        }
        self.notify.notify_waiters();
        Ok(evicted)
    }

    /// Remove and return the oldest item without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().items.pop_front()
    }

    /// Remove and return the oldest item, waiting until one is available.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        loop {
            // Join the waiter list before checking state; a merely-created
            // `Notified` is not registered yet, so a push landing between the
            // empty-check and the await would otherwise be missed.
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.as_mut().await;
            notified.set(self.notify.notified());
        }
    }

    /// Like [`pop`](Self::pop), but gives up after `timeout`.
    ///
    /// A timeout signals "no data right now" and is not an error.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, self.pop()).await.ok().flatten()
    }

    /// Close the queue, waking all waiting consumers.
    ///
    /// Buffered items remain poppable; further pushes fail.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Remove and return all buffered items.
    pub fn drain(&self) -> Vec<T> {
        self.inner.lock().items.drain(..).collect()
    }

    /// Items currently buffered.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// The fixed capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot of the queue counters.
    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        QueueStats {
            depth: inner.items.len(),
            pushed: inner.pushed,
            evicted: inner.evicted,
        }
    }
}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("BoundedQueue")
            .field("capacity", &self.capacity)
            .field("depth", &stats.depth)
            .field("evicted", &stats.evicted)
            .finish()
    }
}
