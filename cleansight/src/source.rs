//! Video source abstraction.
//!
//! A [`FrameSource`] is one video origin: an RTMP stream, a local camera, or
//! a file. Sources are pull-style and deliberately dumb: `open`, `next_frame`,
//! `close`. Reconnection, retry, and pacing are the capture worker's job, not
//! the source's.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::frame::FrameImage;

/// Where a client's video comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// A live RTMP ingest URL.
    Rtmp(String),
    /// A local camera, by device index.
    Camera(u32),
    /// A video file on disk.
    File(PathBuf),
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Rtmp(url) => write!(f, "rtmp:{url}"),
            SourceKind::Camera(index) => write!(f, "camera:{index}"),
            SourceKind::File(path) => write!(f, "file:{}", path.display()),
        }
    }
}

/// Errors surfaced by a frame source.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to open source: {0}")]
    Open(String),

    #[error("read failed: {0}")]
    Read(String),

    #[error("source is not open")]
    NotOpen,
}

/// One pull from an open source.
#[derive(Debug)]
pub enum SourceEvent {
    Frame(FrameImage),
    /// The source ended cleanly (file playback finished, publisher stopped).
    Eof,
}

/// A single video origin with an explicit open/close lifecycle.
///
/// `next_frame` blocks until a frame is available, the stream ends, or a read
/// error occurs. Implementations must not buffer unboundedly and must return
/// promptly after `close`.
#[async_trait]
pub trait FrameSource: Send {
    /// The origin this source reads from.
    fn kind(&self) -> &SourceKind;

    async fn open(&mut self) -> Result<(), SourceError>;

    async fn next_frame(&mut self) -> Result<SourceEvent, SourceError>;

    async fn close(&mut self);
}
