//! Built-in inference tasks.
//!
//! These mirror the deployed model lineup: keypoint detection, motion
//! analysis on top of it, and independent bubble detection. The model
//! internals are placeholders over cheap pixel statistics; real detectors
//! plug in behind the same [`InferenceTask`](super::InferenceTask) trait.

use serde_json::{Map, Value, json};

use super::InferenceTask;
use crate::frame::{Canvas, FrameContext, FrameImage, TaskResult};

const DETECT_COLOR: [u8; 3] = [255, 0, 0];
const MOTION_COLOR: [u8; 3] = [0, 255, 0];
const BUBBLE_COLOR: [u8; 3] = [255, 0, 255];

/// Keypoint detection over the endoscope region.
///
/// Emits a bounding box, its corner/center keypoints, and the frame's mean
/// luma for downstream analysis.
pub struct DetectTask;

impl DetectTask {
    pub const NAME: &'static str = "detect";
}

impl InferenceTask for DetectTask {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn infer(&self, image: &FrameImage, _context: &FrameContext) -> TaskResult {
        let (w, h) = (image.width, image.height);
        if w == 0 || h == 0 {
            return TaskResult::failed("empty frame");
        }
        let (cx, cy) = (w / 2, h / 2);
        let rw = (w / 4).min(200).max(1);
        let rh = (h / 4).min(200).max(1);
        let x1 = cx.saturating_sub(rw / 2);
        let y1 = cy.saturating_sub(rh / 2);
        let x2 = (cx + rw / 2).min(w - 1);
        let y2 = (cy + rh / 2).min(h - 1);

        let keypoints = vec![
            json!({ "x": x1, "y": y1 }),
            json!({ "x": x2, "y": y1 }),
            json!({ "x": x1, "y": y2 }),
            json!({ "x": x2, "y": y2 }),
            json!({ "x": cx, "y": cy }),
        ];

        let mut payload = Map::new();
        payload.insert("bbox".into(), json!([x1, y1, x2, y2]));
        payload.insert("keypoints".into(), Value::Array(keypoints));
        payload.insert("mean_luma".into(), json!(image.mean_luma()));
        TaskResult::ok(payload)
    }

    fn visualize(&self, canvas: &mut Canvas, result: &TaskResult) {
        if !result.success {
            return;
        }
        if let Some(bbox) = result.payload.get("bbox").and_then(Value::as_array)
            && let [x1, y1, x2, y2] = bbox.as_slice()
        {
            let (x1, y1) = (x1.as_u64().unwrap_or(0), y1.as_u64().unwrap_or(0));
            let (x2, y2) = (x2.as_u64().unwrap_or(0), y2.as_u64().unwrap_or(0));
            canvas.draw_rect(x1 as u32, y1 as u32, x2 as u32, y2 as u32, DETECT_COLOR);
        }
    }
}

/// Motion analysis over detected keypoints: hose bending and submersion.
///
/// Depends on `detect`; when keypoint detection failed on a frame the task
/// reports its own failure rather than guessing.
pub struct MotionTask {
    /// Mean luma at or below which the scope counts as fully submerged.
    pub submersion_luma: f64,
    /// Mean luma at or below which a bend is flagged.
    pub bending_luma: f64,
}

impl MotionTask {
    pub const NAME: &'static str = "motion";
}

impl Default for MotionTask {
    fn default() -> Self {
        Self {
            submersion_luma: 120.0,
            bending_luma: 40.0,
        }
    }
}

impl InferenceTask for MotionTask {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn dependencies(&self) -> Vec<String> {
        vec![DetectTask::NAME.to_string()]
    }

    fn infer(&self, _image: &FrameImage, context: &FrameContext) -> TaskResult {
        let detect = match context.result(DetectTask::NAME) {
            Some(result) if result.success => result,
            _ => return TaskResult::failed("keypoint detection unavailable"),
        };

        let mean_luma = detect.number("mean_luma").unwrap_or(255.0);
        let fully_submerged = mean_luma <= self.submersion_luma;
        let bending_detected = mean_luma <= self.bending_luma;

        let mut payload = Map::new();
        payload.insert("bending_detected".into(), json!(bending_detected));
        payload.insert("fully_submerged".into(), json!(fully_submerged));
        payload.insert("mean_luma".into(), json!(mean_luma));
        TaskResult::ok(payload)
    }

    fn visualize(&self, canvas: &mut Canvas, result: &TaskResult) {
        if !result.success {
            return;
        }
        // Status marker in the top-left corner, over any detect annotations.
        if result.flag("bending_detected") {
            canvas.draw_marker(4, 4, MOTION_COLOR);
        }
        if !result.flag("fully_submerged") {
            canvas.draw_marker(12, 4, MOTION_COLOR);
        }
    }
}

/// Independent bubble detection for air-leak monitoring.
pub struct BubbleTask {
    /// Luma above which a pixel counts as a bubble highlight.
    pub highlight_luma: u8,
    /// Fraction of highlight pixels above which bubbles are flagged.
    pub detect_fraction: f64,
}

impl BubbleTask {
    pub const NAME: &'static str = "bubble";
}

impl Default for BubbleTask {
    fn default() -> Self {
        Self {
            highlight_luma: 200,
            detect_fraction: 0.05,
        }
    }
}

impl InferenceTask for BubbleTask {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn infer(&self, image: &FrameImage, _context: &FrameContext) -> TaskResult {
        let fraction = image.bright_fraction(self.highlight_luma);
        let detected = fraction > self.detect_fraction;
        // Rough highlight-area proxy until the real detector lands.
        let bubble_count = (fraction * 100.0).round() as u64;

        let mut payload = Map::new();
        payload.insert("detected".into(), json!(detected));
        payload.insert("bubble_count".into(), json!(bubble_count));
        payload.insert("bright_fraction".into(), json!(fraction));
        TaskResult::ok(payload)
    }

    fn visualize(&self, canvas: &mut Canvas, result: &TaskResult) {
        if !result.success || !result.flag("detected") {
            return;
        }
        let (w, h) = (canvas.width(), canvas.height());
        canvas.draw_marker(w.saturating_sub(5), 4, BUBBLE_COLOR);
        canvas.draw_marker(w.saturating_sub(5), h.saturating_sub(5), BUBBLE_COLOR);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_emits_bbox_and_keypoints() {
        let image = FrameImage::solid(64, 48, [80, 80, 80]);
        let result = DetectTask.infer(&image, &FrameContext::new());
        assert!(result.success);
        assert!(result.payload.contains_key("bbox"));
        let keypoints = result.payload["keypoints"].as_array().unwrap();
        assert_eq!(keypoints.len(), 5);
    }

    #[test]
    fn motion_fails_without_detect_result() {
        let image = FrameImage::solid(8, 8, [0, 0, 0]);
        let result = MotionTask::default().infer(&image, &FrameContext::new());
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("keypoint detection unavailable")
        );
    }

    #[test]
    fn motion_flags_follow_luma() {
        let motion = MotionTask::default();

        let dark = FrameImage::solid(8, 8, [20, 20, 20]);
        let mut context = FrameContext::new();
        context.insert(DetectTask::NAME, DetectTask.infer(&dark, &FrameContext::new()));
        let result = motion.infer(&dark, &context);
        assert!(result.success);
        assert!(result.flag("fully_submerged"));
        assert!(result.flag("bending_detected"));

        let bright = FrameImage::solid(8, 8, [220, 220, 220]);
        let mut context = FrameContext::new();
        context.insert(
            DetectTask::NAME,
            DetectTask.infer(&bright, &FrameContext::new()),
        );
        let result = motion.infer(&bright, &context);
        assert!(result.success);
        assert!(!result.flag("fully_submerged"));
        assert!(!result.flag("bending_detected"));
    }

    #[test]
    fn bubble_detects_bright_frames() {
        let bubble = BubbleTask::default();
        let bright = FrameImage::solid(8, 8, [230, 230, 230]);
        let result = bubble.infer(&bright, &FrameContext::new());
        assert!(result.success);
        assert!(result.flag("detected"));

        let dark = FrameImage::solid(8, 8, [10, 10, 10]);
        let result = bubble.infer(&dark, &FrameContext::new());
        assert!(!result.flag("detected"));
        assert_eq!(result.number("bubble_count"), Some(0.0));
    }

    #[test]
    fn visualize_skips_failed_results() {
        let image = FrameImage::solid(16, 16, [0, 0, 0]);
        let mut canvas = Canvas::from_image(&image);
        DetectTask.visualize(&mut canvas, &TaskResult::failed("nope"));
        let annotated = canvas.into_image();
        assert_eq!(annotated, image);
    }
}
