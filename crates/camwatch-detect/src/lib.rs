//! Object detection: a YOLO-family ONNX engine plus per-camera workers that
//! sample ring buffers and cache their latest results.

pub mod engine;
pub mod worker;

use std::time::Instant;

use camwatch_ingest::FrameData;
use serde::Serialize;

pub use engine::DetectionEngine;
pub use worker::{DetectionWorker, WorkerStatsSnapshot};

/// One detected object in original-frame pixel coordinates (`x1 < x2`,
/// `y1 < y2`, confidence in `[0, 1]`).
#[derive(Clone, Debug, Serialize)]
pub struct Detection {
    pub class_id: usize,
    pub class_name: String,
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// Result of one inference pass over a single frame.
#[derive(Clone, Debug)]
pub struct DetectionResult {
    pub detections: Vec<Detection>,
    /// Capture timestamp of the originating frame.
    pub timestamp: Instant,
    /// Identifies the originating frame so callers can detect "no new frame".
    pub frame_number: u64,
}

/// Capability contract for object detectors.
///
/// Workers and the event pipeline depend on this trait rather than on the
/// inference runtime, so tests can substitute scripted detectors.
pub trait Detector: Send + Sync {
    /// False when model loading failed; `detect` then returns empty.
    fn is_loaded(&self) -> bool;

    /// Run detection on a BGR24 frame. `filter_classes` restricts results to
    /// the named classes when non-empty.
    fn detect(
        &self,
        frame: &FrameData,
        conf_threshold: f32,
        iou_threshold: f32,
        filter_classes: &[String],
    ) -> Vec<Detection>;
}
