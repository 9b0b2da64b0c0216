//! Frame and inference result data model.
//!
//! A [`Frame`] owns one captured image plus its capture metadata. Frames move
//! through the pipeline stage by stage; each stage either drops its frame or
//! hands it to the next queue, never retaining it. The per-frame inference
//! output is collected into a [`FrameContext`], which is frozen before
//! dependent tasks read it and is never mutated after a task's result is
//! stored.
//!
//! Images are raw interleaved RGB24 on a [`Bytes`] buffer. Codec work is a
//! collaborator concern; annotation happens directly on the pixel buffer
//! through [`Canvas`].

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// Bytes per RGB24 pixel.
const PIXEL_STRIDE: usize = 3;

/// A raw RGB24 image. Cloning is cheap (shared buffer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameImage {
    pub width: u32,
    pub height: u32,
    /// Interleaved RGB bytes, row-major, `width * height * 3` long.
    pub data: Bytes,
}

impl FrameImage {
    /// Build an image from raw RGB bytes.
    ///
    /// Returns `None` when the buffer length does not match the dimensions.
    pub fn from_rgb(width: u32, height: u32, data: Bytes) -> Option<Self> {
        if data.len() != width as usize * height as usize * PIXEL_STRIDE {
            return None;
        }
        Some(Self { width, height, data })
    }

    /// A single-color image, handy for synthetic sources and tests.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let mut data = Vec::with_capacity(width as usize * height as usize * PIXEL_STRIDE);
        for _ in 0..(width as usize * height as usize) {
            data.extend_from_slice(&rgb);
        }
        Self {
            width,
            height,
            data: Bytes::from(data),
        }
    }

    /// Mean luma of the image in `0.0..=255.0`, using Rec. 601 weights.
    pub fn mean_luma(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        let mut total = 0.0;
        for px in self.data.chunks_exact(PIXEL_STRIDE) {
            total += 0.299 * px[0] as f64 + 0.587 * px[1] as f64 + 0.114 * px[2] as f64;
        }
        total / (self.data.len() / PIXEL_STRIDE) as f64
    }

    /// Fraction of pixels brighter than `threshold` luma.
    pub fn bright_fraction(&self, threshold: u8) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        let mut bright = 0usize;
        let mut total = 0usize;
        for px in self.data.chunks_exact(PIXEL_STRIDE) {
            let luma = 0.299 * px[0] as f64 + 0.587 * px[1] as f64 + 0.114 * px[2] as f64;
            if luma > threshold as f64 {
                bright += 1;
            }
            total += 1;
        }
        bright as f64 / total as f64
    }
}

/// Mutable pixel surface for merging task visualizations.
///
/// Tasks draw in registration order, each overlaying the previous tasks'
/// annotations on the same canvas; calls are inherently serialized.
#[derive(Debug)]
pub struct Canvas {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Canvas {
    pub fn from_image(image: &FrameImage) -> Self {
        Self {
            width: image.width,
            height: image.height,
            pixels: image.data.to_vec(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Set one pixel. Out-of-bounds coordinates are ignored.
    pub fn put_pixel(&mut self, x: u32, y: u32, rgb: [u8; 3]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let offset = (y as usize * self.width as usize + x as usize) * PIXEL_STRIDE;
        self.pixels[offset..offset + PIXEL_STRIDE].copy_from_slice(&rgb);
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * PIXEL_STRIDE;
        Some([
            self.pixels[offset],
            self.pixels[offset + 1],
            self.pixels[offset + 2],
        ])
    }

    /// Draw an axis-aligned rectangle outline, clamped to the canvas.
    pub fn draw_rect(&mut self, x1: u32, y1: u32, x2: u32, y2: u32, rgb: [u8; 3]) {
        for x in x1..=x2 {
            self.put_pixel(x, y1, rgb);
            self.put_pixel(x, y2, rgb);
        }
        for y in y1..=y2 {
            self.put_pixel(x1, y, rgb);
            self.put_pixel(x2, y, rgb);
        }
    }

    /// Draw a small cross marker centered on a point.
    pub fn draw_marker(&mut self, cx: u32, cy: u32, rgb: [u8; 3]) {
        for d in 0..3u32 {
            self.put_pixel(cx.saturating_add(d), cy, rgb);
            self.put_pixel(cx.saturating_sub(d), cy, rgb);
            self.put_pixel(cx, cy.saturating_add(d), rgb);
            self.put_pixel(cx, cy.saturating_sub(d), rgb);
        }
    }

    pub fn into_image(self) -> FrameImage {
        FrameImage {
            width: self.width,
            height: self.height,
            data: Bytes::from(self.pixels),
        }
    }
}

/// One captured frame, owned by exactly one pipeline stage at a time.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonically increasing per client, starting at 1.
    pub sequence: u64,
    /// Wall-clock capture time.
    pub captured_at: DateTime<Utc>,
    pub image: FrameImage,
}

/// Result of one inference task on one frame.
///
/// Task failures are values, never control flow: a task that errors or times
/// out yields `success: false` with an error message, and the frame continues
/// through the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub payload: Map<String, Value>,
}

impl TaskResult {
    pub fn ok(payload: Map<String, Value>) -> Self {
        Self {
            success: true,
            error: None,
            payload,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            payload: Map::new(),
        }
    }

    /// Read a boolean payload field, defaulting to `false`.
    pub fn flag(&self, key: &str) -> bool {
        self.payload.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Read a numeric payload field.
    pub fn number(&self, key: &str) -> Option<f64> {
        self.payload.get(key).and_then(Value::as_f64)
    }
}

/// Read-only aggregate of all task results produced so far for one frame.
///
/// Dependent tasks receive a frozen snapshot; a stored result is never
/// mutated or replaced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FrameContext {
    results: HashMap<String, TaskResult>,
}

impl FrameContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, task: impl Into<String>, result: TaskResult) {
        self.results.insert(task.into(), result);
    }

    pub fn result(&self, task: &str) -> Option<&TaskResult> {
        self.results.get(task)
    }

    /// Whether the named task ran and succeeded on this frame.
    pub fn succeeded(&self, task: &str) -> bool {
        self.results.get(task).map(|r| r.success).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TaskResult)> {
        self.results.iter()
    }
}

/// A frame after inference: the original frame, the merged annotated image,
/// and the complete result set. Shared by delivery and recording cursors.
#[derive(Debug, Clone)]
pub struct ProcessedFrame {
    pub frame: Frame,
    pub annotated: FrameImage,
    pub context: Arc<FrameContext>,
}
