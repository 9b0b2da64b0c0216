//! Capture worker and stream-ingestion state machine.
//!
//! One capture worker drains one [`FrameSource`] into the client's `ready`
//! and `raw` queues. It owns all connection resilience: open retries with a
//! fixed backoff up to an attempt ceiling, mid-stream reconnection that keeps
//! the session and its queues intact, and pacing that drops frames to the
//! target rate instead of buffering unboundedly.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::PipelineConfig;
use crate::frame::Frame;
use crate::queues::ClientQueueSet;
use crate::source::{FrameSource, SourceEvent};
use crate::{Error, Result};

/// Connection state of one client's ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IngestState {
    Disconnected,
    Connecting,
    Streaming,
    /// Retry ceiling exceeded; terminal, surfaced to the session owner.
    Failed,
    /// Explicit stop; terminal.
    Stopped,
}

impl std::fmt::Display for IngestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IngestState::Disconnected => "disconnected",
            IngestState::Connecting => "connecting",
            IngestState::Streaming => "streaming",
            IngestState::Failed => "failed",
            IngestState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Retry behavior for source connection attempts.
///
/// The backoff is a fixed delay; jitter (up to 25%) can be enabled to spread
/// reconnect storms across clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempt ceiling, including the first attempt.
    pub max_attempts: u32,
    /// Delay between attempts in milliseconds.
    pub backoff_ms: u64,
    pub use_jitter: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.connect_max_attempts,
            backoff_ms: config.connect_backoff_ms,
            use_jitter: config.connect_backoff_jitter,
        }
    }

    /// Whether another attempt is allowed after `attempt` attempts were made.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        let base = self.backoff_ms;
        let delay_ms = if self.use_jitter {
            base + (base as f64 * 0.25 * rand::random::<f64>()) as u64
        } else {
            base
        };
        Duration::from_millis(delay_ms)
    }
}

enum StreamOutcome {
    Eof,
    Cancelled,
    ReadError,
}

/// Drains one frame source into the client queues, at the target rate.
pub struct CaptureWorker {
    client_id: Arc<str>,
    source: Box<dyn FrameSource>,
    queues: Arc<ClientQueueSet>,
    retry: RetryPolicy,
    frame_interval: Duration,
    token: CancellationToken,
    state_tx: watch::Sender<IngestState>,
    sequence: u64,
    dropped_to_rate: u64,
}

impl CaptureWorker {
    pub fn new(
        client_id: Arc<str>,
        source: Box<dyn FrameSource>,
        queues: Arc<ClientQueueSet>,
        config: &PipelineConfig,
        token: CancellationToken,
    ) -> (Self, watch::Receiver<IngestState>) {
        let (state_tx, state_rx) = watch::channel(IngestState::Disconnected);
        (
            Self {
                client_id,
                source,
                queues,
                retry: RetryPolicy::from_config(config),
                frame_interval: config.frame_interval(),
                token,
                state_tx,
                sequence: 0,
                dropped_to_rate: 0,
            },
            state_rx,
        )
    }

    fn set_state(&self, state: IngestState) {
        trace!(client_id = %self.client_id, state = %state, "ingest state");
        let _ = self.state_tx.send(state);
    }

    /// Run until EOF, unrecoverable failure, or cancellation.
    ///
    /// The source is always closed before returning, whatever the path out.
    pub async fn run(mut self) -> Result<()> {
        let outcome = self.run_inner().await;
        self.source.close().await;
        outcome
    }

    async fn run_inner(&mut self) -> Result<()> {
        let mut attempt: u32 = 0;
        loop {
            if self.token.is_cancelled() {
                self.set_state(IngestState::Stopped);
                return Ok(());
            }

            self.set_state(IngestState::Connecting);
            attempt += 1;

            let opened = tokio::select! {
                _ = self.token.cancelled() => {
                    self.set_state(IngestState::Stopped);
                    return Ok(());
                }
                result = self.source.open() => result,
            };

            if let Err(e) = opened {
                warn!(
                    client_id = %self.client_id,
                    attempt,
                    max_attempts = self.retry.max_attempts,
                    error = %e,
                    "failed to open source"
                );
                if !self.retry.should_retry(attempt) {
                    error!(
                        client_id = %self.client_id,
                        attempts = attempt,
                        "connect attempt ceiling exceeded"
                    );
                    self.set_state(IngestState::Failed);
                    return Err(Error::Source(e));
                }
                let delay = self.retry.delay();
                tokio::select! {
                    _ = self.token.cancelled() => {
                        self.set_state(IngestState::Stopped);
                        return Ok(());
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }

            info!(
                client_id = %self.client_id,
                source = %self.source.kind(),
                "source connected"
            );
            attempt = 0;
            self.set_state(IngestState::Streaming);

            match self.stream().await {
                StreamOutcome::Eof => {
                    info!(
                        client_id = %self.client_id,
                        frames = self.sequence,
                        dropped_to_rate = self.dropped_to_rate,
                        "source ended"
                    );
                    self.set_state(IngestState::Stopped);
                    return Ok(());
                }
                StreamOutcome::Cancelled => {
                    self.set_state(IngestState::Stopped);
                    return Ok(());
                }
                StreamOutcome::ReadError => {
                    // Reconnect without destroying the session or its queues;
                    // frames already queued remain valid.
                    self.source.close().await;
                    self.set_state(IngestState::Disconnected);
                }
            }
        }
    }

    async fn stream(&mut self) -> StreamOutcome {
        let mut next_due = tokio::time::Instant::now();
        loop {
            let event = tokio::select! {
                _ = self.token.cancelled() => return StreamOutcome::Cancelled,
                event = self.source.next_frame() => event,
            };

            match event {
                Ok(SourceEvent::Frame(image)) => {
                    // Source outpacing the target rate: drop instead of buffering.
                    let now = tokio::time::Instant::now();
                    if now < next_due {
                        self.dropped_to_rate += 1;
                        trace!(client_id = %self.client_id, "dropped frame to match target rate");
                        continue;
                    }
                    next_due = now + self.frame_interval;

                    self.sequence += 1;
                    let frame = Frame {
                        sequence: self.sequence,
                        captured_at: Utc::now(),
                        image,
                    };

                    if self.queues.ready.push(frame.clone()).is_err()
                        || self.queues.raw.push(frame).is_err()
                    {
                        // Queues are closed only during session teardown.
                        debug!(client_id = %self.client_id, "queues closed, stopping capture");
                        return StreamOutcome::Cancelled;
                    }
                }
                Ok(SourceEvent::Eof) => return StreamOutcome::Eof,
                Err(e) => {
                    warn!(
                        client_id = %self.client_id,
                        error = %e,
                        "read failed mid-stream, reconnecting"
                    );
                    return StreamOutcome::ReadError;
                }
            }
        }
    }
}
