//! Live delivery: wire serialization and per-subscriber fan-out.
//!
//! The delivery worker turns processed frames into [`WireFrame`]s and fans
//! them out to every subscriber of the session. Each subscriber owns a
//! bounded drop-oldest buffer and a forwarder task, so one slow or stuck
//! sink only loses its own frames and never stalls the pipeline or its
//! sibling subscribers.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use frame_queue::BoundedQueue;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::Result;
use crate::frame::ProcessedFrame;
use crate::queues::ClientQueueSet;

/// Media type carried in the data URL. Raw interleaved RGB24; subscribers
/// get dimensions alongside to reconstruct the image.
const WIRE_MEDIA_TYPE: &str = "image/x-raw-rgb";

/// One annotated frame in wire form, ready to push to a subscriber.
#[derive(Debug, Clone, Serialize)]
pub struct WireFrame {
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    /// `data:image/x-raw-rgb;base64,...` over the annotated pixels.
    pub data_url: String,
}

impl WireFrame {
    pub fn from_processed(processed: &ProcessedFrame) -> Self {
        let encoded = STANDARD.encode(&processed.annotated.data);
        Self {
            sequence: processed.frame.sequence,
            captured_at: processed.frame.captured_at,
            width: processed.annotated.width,
            height: processed.annotated.height,
            data_url: format!("data:{WIRE_MEDIA_TYPE};base64,{encoded}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    /// The subscriber's transport is gone; it will be unsubscribed.
    #[error("subscriber disconnected")]
    Disconnected,
    #[error("send failed: {0}")]
    Send(String),
}

/// Outbound transport for one subscriber (a websocket, a test collector).
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send(&self, frame: WireFrame) -> std::result::Result<(), SinkError>;
}

pub type SubscriberId = Uuid;

struct Subscriber {
    buffer: Arc<BoundedQueue<WireFrame>>,
    token: CancellationToken,
    forwarder: tokio::task::JoinHandle<()>,
}

/// The live subscribers of one client session.
///
/// Shared between the session handle (subscribe/unsubscribe) and the
/// delivery worker (fan-out). Dropping a subscriber here cancels its
/// forwarder and drops its buffered frames.
pub struct SubscriberSet {
    client_id: Arc<str>,
    inner: DashMap<SubscriberId, Subscriber>,
    buffer_capacity: usize,
}

impl SubscriberSet {
    pub fn new(client_id: Arc<str>, buffer_capacity: usize) -> Self {
        Self {
            client_id,
            inner: DashMap::new(),
            buffer_capacity,
        }
    }

    /// Attach a sink and start its forwarder. Returns the id used to
    /// unsubscribe later.
    pub fn subscribe(self: &Arc<Self>, sink: Arc<dyn FrameSink>) -> Result<SubscriberId> {
        let id = Uuid::new_v4();
        let buffer = Arc::new(BoundedQueue::new(self.buffer_capacity)?);
        let token = CancellationToken::new();
        let forwarder = tokio::spawn(forward(
            Arc::downgrade(self),
            id,
            buffer.clone(),
            sink,
            token.clone(),
        ));
        self.inner.insert(
            id,
            Subscriber {
                buffer,
                token,
                forwarder,
            },
        );
        debug!(client_id = %self.client_id, subscriber_id = %id, "subscriber attached");
        Ok(id)
    }

    /// Detach a subscriber. Returns `false` when the id is unknown (already
    /// detached, or never existed).
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        match self.inner.remove(&id) {
            Some((_, subscriber)) => {
                subscriber.token.cancel();
                subscriber.buffer.close();
                debug!(client_id = %self.client_id, subscriber_id = %id, "subscriber detached");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Queue one wire frame to every subscriber's buffer.
    fn fanout(&self, frame: &WireFrame) {
        for entry in self.inner.iter() {
            if let Ok(Some(_evicted)) = entry.value().buffer.push(frame.clone()) {
                debug!(
                    client_id = %self.client_id,
                    subscriber_id = %entry.key(),
                    sequence = frame.sequence,
                    "subscriber lagging, dropped oldest buffered frame"
                );
            }
        }
    }

    /// Cancel every forwarder and clear the set.
    pub fn shutdown(&self) {
        self.inner.retain(|_, subscriber| {
            subscriber.token.cancel();
            subscriber.buffer.close();
            false
        });
    }
}

impl Drop for SubscriberSet {
    fn drop(&mut self) {
        for entry in self.inner.iter() {
            entry.value().token.cancel();
            entry.value().forwarder.abort();
        }
    }
}

/// Per-subscriber forwarder: drains the buffer into the sink until the
/// subscriber detaches or the sink errors.
async fn forward(
    set: Weak<SubscriberSet>,
    id: SubscriberId,
    buffer: Arc<BoundedQueue<WireFrame>>,
    sink: Arc<dyn FrameSink>,
    token: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            frame = buffer.pop() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(error) = sink.send(frame).await {
            warn!(subscriber_id = %id, error = %error, "sink failed, detaching subscriber");
            if let Some(set) = set.upgrade() {
                set.inner.remove(&id);
            }
            break;
        }
    }
}

/// Serializes processed frames and fans them out to subscribers.
pub struct DeliveryWorker {
    client_id: Arc<str>,
    queues: Arc<ClientQueueSet>,
    subscribers: Arc<SubscriberSet>,
    token: CancellationToken,
}

impl DeliveryWorker {
    pub fn new(
        client_id: Arc<str>,
        queues: Arc<ClientQueueSet>,
        subscribers: Arc<SubscriberSet>,
        token: CancellationToken,
    ) -> Self {
        Self {
            client_id,
            queues,
            subscribers,
            token,
        }
    }

    /// Run until cancellation or upstream teardown.
    pub async fn run(self) {
        tokio::join!(self.serialize_loop(), self.fanout_loop());
        debug!(client_id = %self.client_id, "delivery worker stopped");
    }

    /// `processed` → [`WireFrame`] → `delivered`.
    async fn serialize_loop(&self) {
        loop {
            let processed = tokio::select! {
                _ = self.token.cancelled() => break,
                processed = self.queues.processed.pop() => match processed {
                    Some(processed) => processed,
                    None => break,
                },
            };
            let wire = WireFrame::from_processed(&processed);
            if self.queues.delivered.push(wire).is_err() {
                break;
            }
        }
        // Upstream is gone; unblock the fan-out side.
        self.queues.delivered.close();
    }

    /// `delivered` → every subscriber buffer.
    async fn fanout_loop(&self) {
        loop {
            let wire = tokio::select! {
                _ = self.token.cancelled() => break,
                wire = self.queues.delivered.pop() => match wire {
                    Some(wire) => wire,
                    None => break,
                },
            };
            self.subscribers.fanout(&wire);
        }
    }
}
