//! ONNX detection engine: letterbox preprocessing, session inference, and
//! box decoding with per-class non-max suppression.
//!
//! The engine is stateless across calls and shareable; one instance serves
//! every worker and event task. Model outputs are expected in the YOLO
//! layout `[1, 4 + num_classes, num_candidates]` with the candidate axis
//! last.

use std::{collections::HashSet, path::Path, sync::Mutex};

use anyhow::{Context, Result};
use camwatch_ingest::FrameData;
use ort::session::Session;
use ort::value::Tensor;
use tracing::{info, warn};

use crate::{Detection, Detector};

/// Gray letterbox fill, normalized.
const PAD_FILL: f32 = 114.0 / 255.0;

/// COCO class table used when the model itself carries no names.
const COCO_NAMES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

/// Forward letterbox mapping parameters, needed to undo the transform.
#[derive(Clone, Copy, Debug)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

/// Shared YOLO ONNX engine.
pub struct DetectionEngine {
    session: Mutex<Session>,
    input_width: i32,
    input_height: i32,
    num_classes: usize,
    class_names: Vec<String>,
}

impl DetectionEngine {
    /// Load a model. `input_size` is the square model input edge (640 for
    /// stock YOLOv8 exports); `num_classes` pads the COCO table with
    /// `classN` entries when larger than 80.
    pub fn load(model_path: &Path, input_size: i32, num_classes: usize) -> Result<Self> {
        let session = Session::builder()
            .context("failed to create ONNX session builder")?
            .with_intra_threads(2)
            .context("failed to set ONNX intra-op threads")?
            .commit_from_file(model_path)
            .with_context(|| format!("failed to load ONNX model {}", model_path.display()))?;

        info!(
            model = %model_path.display(),
            input = input_size,
            classes = num_classes,
            "ONNX model loaded"
        );

        Ok(Self {
            session: Mutex::new(session),
            input_width: input_size,
            input_height: input_size,
            num_classes,
            class_names: class_name_table(num_classes),
        })
    }

    pub fn input_size(&self) -> (i32, i32) {
        (self.input_width, self.input_height)
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }
}

impl Detector for DetectionEngine {
    fn is_loaded(&self) -> bool {
        true
    }

    fn detect(
        &self,
        frame: &FrameData,
        conf_threshold: f32,
        iou_threshold: f32,
        filter_classes: &[String],
    ) -> Vec<Detection> {
        if frame.pixels.is_empty() || frame.width <= 0 || frame.height <= 0 {
            return Vec::new();
        }

        let (tensor_data, letterbox) =
            letterbox_tensor(frame, self.input_width, self.input_height);
        let shape = [
            1usize,
            3,
            self.input_height as usize,
            self.input_width as usize,
        ];
        let input = match Tensor::from_array((shape, tensor_data.into_boxed_slice())) {
            Ok(tensor) => tensor.into_dyn(),
            Err(err) => {
                warn!(error = %err, "failed to build input tensor");
                return Vec::new();
            }
        };

        let mut session = match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let outputs = match session.run(ort::inputs!["images" => input]) {
            Ok(outputs) => outputs,
            Err(err) => {
                warn!(error = %err, "inference failed");
                return Vec::new();
            }
        };

        let Some((_, value)) = outputs.iter().next() else {
            warn!("model produced no outputs");
            return Vec::new();
        };
        let (shape, data) = match value.try_extract_tensor::<f32>() {
            Ok(extracted) => extracted,
            Err(err) => {
                warn!(error = %err, "failed to extract output tensor");
                return Vec::new();
            }
        };

        // [1, 4+nc, candidates] normally; a 2-D export drops the batch axis.
        let num_candidates = match shape.len() {
            3 => shape[2] as usize,
            2 => shape[1] as usize,
            _ => return Vec::new(),
        };
        if num_candidates == 0 {
            return Vec::new();
        }
        if data.len() < (4 + self.num_classes) * num_candidates {
            warn!(
                len = data.len(),
                candidates = num_candidates,
                classes = self.num_classes,
                "output tensor smaller than configured class count"
            );
            return Vec::new();
        }

        let decoded = decode_candidates(
            data,
            num_candidates,
            self.num_classes,
            conf_threshold,
            letterbox,
            frame.width as f32,
            frame.height as f32,
            &self.class_names,
            filter_classes,
        );
        let mut kept = nms_per_class(decoded, iou_threshold);
        kept.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        kept
    }
}

fn class_name_table(num_classes: usize) -> Vec<String> {
    let mut names: Vec<String> = COCO_NAMES
        .iter()
        .take(num_classes)
        .map(|s| s.to_string())
        .collect();
    for i in names.len()..num_classes {
        names.push(format!("class{i}"));
    }
    names
}

/// Letterbox a BGR24 frame into a normalized NCHW RGB tensor.
///
/// The source is scaled by `min(W/w, H/h)` preserving aspect ratio,
/// nearest-neighbor resampled into the centered unpadded region, and the
/// remainder filled with gray. Returns the flat tensor plus the mapping
/// needed to reverse it.
pub fn letterbox_tensor(frame: &FrameData, input_w: i32, input_h: i32) -> (Vec<f32>, Letterbox) {
    let img_w = frame.width;
    let img_h = frame.height;

    let scale = (input_w as f32 / img_w as f32).min(input_h as f32 / img_h as f32);
    let new_w = (img_w as f32 * scale).round() as i32;
    let new_h = (img_h as f32 * scale).round() as i32;
    let pad_x = (input_w - new_w) as f32 / 2.0;
    let pad_y = (input_h - new_h) as f32 / 2.0;
    let pad_left = pad_x.round() as i32;
    let pad_top = pad_y.round() as i32;

    let plane = input_w as usize * input_h as usize;
    let mut tensor = vec![PAD_FILL; 3 * plane];

    for dst_y in 0..new_h {
        let src_y = ((dst_y as f32 / scale) as i32).min(img_h - 1);
        let out_y = dst_y + pad_top;
        if out_y < 0 || out_y >= input_h {
            continue;
        }
        let src_row = src_y as usize * frame.stride as usize;
        for dst_x in 0..new_w {
            let src_x = ((dst_x as f32 / scale) as i32).min(img_w - 1);
            let out_x = dst_x + pad_left;
            if out_x < 0 || out_x >= input_w {
                continue;
            }

            let px = src_row + src_x as usize * 3;
            let b = frame.pixels[px] as f32;
            let g = frame.pixels[px + 1] as f32;
            let r = frame.pixels[px + 2] as f32;

            let offset = out_y as usize * input_w as usize + out_x as usize;
            tensor[offset] = r / 255.0;
            tensor[plane + offset] = g / 255.0;
            tensor[2 * plane + offset] = b / 255.0;
        }
    }

    (
        tensor,
        Letterbox {
            scale,
            pad_x,
            pad_y,
        },
    )
}

/// Decode raw model output columns into detections in source coordinates.
#[allow(clippy::too_many_arguments)]
pub fn decode_candidates(
    output: &[f32],
    num_candidates: usize,
    num_classes: usize,
    conf_threshold: f32,
    letterbox: Letterbox,
    orig_width: f32,
    orig_height: f32,
    class_names: &[String],
    filter_classes: &[String],
) -> Vec<Detection> {
    let filter: HashSet<&str> = filter_classes.iter().map(|s| s.as_str()).collect();
    let mut detections = Vec::new();

    for i in 0..num_candidates {
        let cx = output[i];
        let cy = output[num_candidates + i];
        let w = output[2 * num_candidates + i];
        let h = output[3 * num_candidates + i];

        let mut best_class = 0usize;
        let mut best_score = 0.0f32;
        for c in 0..num_classes {
            let score = output[(4 + c) * num_candidates + i];
            if score > best_score {
                best_score = score;
                best_class = c;
            }
        }

        if best_score < conf_threshold {
            continue;
        }

        let class_name = class_names
            .get(best_class)
            .map(|s| s.as_str())
            .unwrap_or("unknown");
        if !filter.is_empty() && !filter.contains(class_name) {
            continue;
        }

        // Center/size to corners, then undo the letterbox.
        let x1 = ((cx - w / 2.0 - letterbox.pad_x) / letterbox.scale).clamp(0.0, orig_width);
        let y1 = ((cy - h / 2.0 - letterbox.pad_y) / letterbox.scale).clamp(0.0, orig_height);
        let x2 = ((cx + w / 2.0 - letterbox.pad_x) / letterbox.scale).clamp(0.0, orig_width);
        let y2 = ((cy + h / 2.0 - letterbox.pad_y) / letterbox.scale).clamp(0.0, orig_height);

        if x2 - x1 < 1.0 || y2 - y1 < 1.0 {
            continue;
        }

        detections.push(Detection {
            class_id: best_class,
            class_name: class_name.to_string(),
            confidence: best_score,
            x1,
            y1,
            x2,
            y2,
        });
    }

    detections
}

/// Box IoU; 0 when the union is non-positive.
pub fn iou(a: &Detection, b: &Detection) -> f32 {
    let inter_w = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let inter_h = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = inter_w * inter_h;

    let area_a = (a.x2 - a.x1) * (a.y2 - a.y1);
    let area_b = (b.x2 - b.x1) * (b.y2 - b.y1);
    let union = area_a + area_b - inter;

    if union <= 0.0 { 0.0 } else { inter / union }
}

/// Greedy NMS within each class; boxes never suppress across classes.
pub fn nms_per_class(detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    if detections.is_empty() {
        return detections;
    }

    let mut order: Vec<usize> = (0..detections.len()).collect();
    order.sort_by(|&a, &b| detections[b].confidence.total_cmp(&detections[a].confidence));

    let mut suppressed = vec![false; detections.len()];
    let mut keep = Vec::new();

    for (rank, &i) in order.iter().enumerate() {
        if suppressed[i] {
            continue;
        }
        keep.push(i);
        for &j in &order[rank + 1..] {
            if suppressed[j] || detections[j].class_id != detections[i].class_id {
                continue;
            }
            if iou(&detections[i], &detections[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    let mut keep_flags = vec![false; detections.len()];
    for &i in &keep {
        keep_flags[i] = true;
    }
    detections
        .into_iter()
        .zip(keep_flags)
        .filter_map(|(det, kept)| kept.then_some(det))
        .collect()
}

#[cfg(test)]
mod tests {
    use camwatch_ingest::FramePool;

    use super::*;

    fn det(class_id: usize, confidence: f32, x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection {
            class_id,
            class_name: format!("class{class_id}"),
            confidence,
            x1,
            y1,
            x2,
            y2,
        }
    }

    fn solid_frame(width: i32, height: i32, bgr: [u8; 3]) -> FrameData {
        let pool = FramePool::new(1);
        let mut frame = pool.acquire().unwrap();
        frame.resize(width, height);
        for px in frame.pixels.chunks_exact_mut(3) {
            px.copy_from_slice(&bgr);
        }
        frame.deep_copy()
    }

    #[test]
    fn letterbox_fills_pad_with_gray() {
        // 2:1 source into a square input leaves bands above and below.
        let frame = solid_frame(64, 32, [0, 0, 255]);
        let (tensor, lb) = letterbox_tensor(&frame, 64, 64);

        assert!((lb.scale - 1.0).abs() < 1e-6);
        assert!((lb.pad_y - 16.0).abs() < 1e-6);

        let plane = 64 * 64;
        // Top pad row is pure gray on all channels.
        for x in 0..64 {
            for c in 0..3 {
                assert!((tensor[c * plane + x] - PAD_FILL).abs() < 1e-6);
            }
        }
        // Center row carries the red source (R=1, G=0, B=0 after BGR swap).
        let mid = 32 * 64;
        assert!((tensor[mid] - 1.0).abs() < 1e-6);
        assert!(tensor[plane + mid].abs() < 1e-6);
        assert!(tensor[2 * plane + mid].abs() < 1e-6);
    }

    #[test]
    fn letterbox_pad_area_matches_geometry() {
        let frame = solid_frame(100, 60, [10, 20, 30]);
        let (tensor, lb) = letterbox_tensor(&frame, 64, 64);
        let plane = 64 * 64;

        let pad_pixels = tensor[..plane]
            .iter()
            .filter(|&&v| (v - PAD_FILL).abs() < 1e-6)
            .count();
        let content = ((100.0 * lb.scale).round() * (60.0 * lb.scale).round()) as usize;
        // The fill value could coincide with content pixels, but this source
        // color cannot produce exactly 114/255 on the red channel.
        assert_eq!(pad_pixels, plane - content);
    }

    #[test]
    fn reverse_letterbox_round_trips_within_one_pixel() {
        let lb = Letterbox {
            scale: (640.0f32 / 1920.0).min(640.0 / 1080.0),
            pad_x: 0.0,
            pad_y: (640.0 - 1080.0 * (640.0 / 1920.0)) / 2.0,
        };

        // A box at (300, 500)-(700, 900) in source space, forward-mapped.
        let (sx1, sy1, sx2, sy2) = (300.0f32, 500.0, 700.0, 900.0);
        let fx1 = sx1 * lb.scale + lb.pad_x;
        let fy1 = sy1 * lb.scale + lb.pad_y;
        let fx2 = sx2 * lb.scale + lb.pad_x;
        let fy2 = sy2 * lb.scale + lb.pad_y;

        let cx = (fx1 + fx2) / 2.0;
        let cy = (fy1 + fy2) / 2.0;
        let w = fx2 - fx1;
        let h = fy2 - fy1;

        // One candidate, one class, column-major layout.
        let output = vec![cx, cy, w, h, 0.9];
        let names = vec!["person".to_string()];
        let dets = decode_candidates(&output, 1, 1, 0.5, lb, 1920.0, 1080.0, &names, &[]);
        assert_eq!(dets.len(), 1);
        assert!((dets[0].x1 - sx1).abs() <= 1.0);
        assert!((dets[0].y1 - sy1).abs() <= 1.0);
        assert!((dets[0].x2 - sx2).abs() <= 1.0);
        assert!((dets[0].y2 - sy2).abs() <= 1.0);
    }

    #[test]
    fn decode_applies_confidence_and_class_filter() {
        let lb = Letterbox {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
        };
        // Two candidates, two classes. Candidate 0 scores class 0 at 0.8,
        // candidate 1 scores class 1 at 0.3.
        let output = vec![
            50.0, 50.0, // cx
            50.0, 50.0, // cy
            20.0, 20.0, // w
            20.0, 20.0, // h
            0.8, 0.1, // class 0 scores
            0.1, 0.3, // class 1 scores
        ];
        let names = vec!["person".to_string(), "car".to_string()];

        let dets = decode_candidates(&output, 2, 2, 0.5, lb, 100.0, 100.0, &names, &[]);
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].class_name, "person");

        let filter = vec!["car".to_string()];
        let dets = decode_candidates(&output, 2, 2, 0.2, lb, 100.0, 100.0, &names, &filter);
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].class_name, "car");
    }

    #[test]
    fn iou_zero_for_disjoint_and_degenerate() {
        let a = det(0, 0.9, 0.0, 0.0, 10.0, 10.0);
        let b = det(0, 0.8, 20.0, 20.0, 30.0, 30.0);
        assert_eq!(iou(&a, &b), 0.0);

        let degenerate = det(0, 0.5, 5.0, 5.0, 5.0, 5.0);
        assert_eq!(iou(&degenerate, &degenerate), 0.0);
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let a = det(0, 0.9, 0.0, 0.0, 10.0, 10.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn nms_suppresses_within_class_only() {
        let dets = vec![
            det(0, 0.9, 0.0, 0.0, 10.0, 10.0),
            det(0, 0.8, 1.0, 1.0, 11.0, 11.0), // overlaps the first, same class
            det(1, 0.7, 0.0, 0.0, 10.0, 10.0), // overlaps but different class
        ];
        let kept = nms_per_class(dets, 0.45);
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().any(|d| d.class_id == 0 && d.confidence == 0.9));
        assert!(kept.iter().any(|d| d.class_id == 1));
    }

    #[test]
    fn nms_is_idempotent() {
        let dets = vec![
            det(0, 0.9, 0.0, 0.0, 10.0, 10.0),
            det(0, 0.8, 1.0, 1.0, 11.0, 11.0),
            det(0, 0.6, 40.0, 40.0, 50.0, 50.0),
            det(2, 0.5, 2.0, 2.0, 12.0, 12.0),
        ];
        let once = nms_per_class(dets, 0.45);
        let twice = nms_per_class(once.clone(), 0.45);
        assert_eq!(once.len(), twice.len());
        for (a, b) in once.iter().zip(twice.iter()) {
            assert_eq!(a.class_id, b.class_id);
            assert_eq!(a.confidence, b.confidence);
        }
    }

    #[test]
    fn class_table_pads_past_coco() {
        let names = class_name_table(82);
        assert_eq!(names[0], "person");
        assert_eq!(names[79], "toothbrush");
        assert_eq!(names[80], "class80");
        assert_eq!(names[81], "class81");
    }
}
