//! Annotated JPEG snapshots.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use camwatch_detect::Detection;
use camwatch_ingest::FrameData;
use chrono::Local;
use image::{ImageBuffer, Rgb, codecs::jpeg::JpegEncoder};
use tracing::info;

/// Bounding-box palette in BGR, indexed by `class_id % 6`.
const BOX_PALETTE: [[u8; 3]; 6] = [
    [0, 255, 0],   // green
    [0, 0, 255],   // red
    [255, 0, 0],   // blue
    [0, 255, 255], // yellow
    [255, 0, 255], // magenta
    [255, 255, 0], // cyan
];

const BOX_THICKNESS: i32 = 2;
const JPEG_QUALITY: u8 = 85;

/// Draw boxes on a copy of the frame, encode to JPEG, and write
/// `<camera_id>_YYYYMMDD_HHMMSS.jpg` into `dir`. Returns the file path.
pub fn save_snapshot(
    frame: &FrameData,
    detections: &[Detection],
    camera_id: &str,
    dir: &Path,
) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("creating snapshot directory {}", dir.display()))?;

    let mut pixels = frame.pixels.clone();
    if !detections.is_empty() {
        draw_boxes(&mut pixels, frame.width, frame.height, frame.stride, detections);
    }

    let jpeg = encode_jpeg(&pixels, frame.width, frame.height)?;
    let file_path = dir.join(format!("{}_{}.jpg", camera_id, timestamp_slug()));
    fs::write(&file_path, &jpeg)
        .with_context(|| format!("writing snapshot {}", file_path.display()))?;

    info!(
        path = %file_path.display(),
        bytes = jpeg.len(),
        detections = detections.len(),
        "snapshot saved"
    );
    Ok(file_path)
}

/// Local-time filename component, second resolution.
pub fn timestamp_slug() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Encode a BGR24 buffer to JPEG.
pub fn encode_jpeg(pixels: &[u8], width: i32, height: i32) -> Result<Vec<u8>> {
    let mut rgb = Vec::with_capacity(pixels.len());
    for px in pixels.chunks_exact(3) {
        rgb.push(px[2]);
        rgb.push(px[1]);
        rgb.push(px[0]);
    }
    let image = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_vec(width as u32, height as u32, rgb)
        .ok_or_else(|| anyhow!("pixel buffer does not match {width}x{height}"))?;

    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY)
        .encode_image(&image)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}

/// Rectangle outlines at [`BOX_THICKNESS`], clamped to the image bounds.
pub fn draw_boxes(
    pixels: &mut [u8],
    width: i32,
    height: i32,
    stride: i32,
    detections: &[Detection],
) {
    for det in detections {
        let x1 = (det.x1 as i32).clamp(0, width - 1);
        let y1 = (det.y1 as i32).clamp(0, height - 1);
        let x2 = (det.x2 as i32).clamp(0, width - 1);
        let y2 = (det.y2 as i32).clamp(0, height - 1);
        let color = BOX_PALETTE[det.class_id % BOX_PALETTE.len()];

        for t in 0..BOX_THICKNESS {
            let top = y1 + t;
            let bottom = y2 - t;
            if (0..height).contains(&top) {
                fill_row(pixels, stride, top, x1, x2, color);
            }
            if (0..height).contains(&bottom) && bottom != top {
                fill_row(pixels, stride, bottom, x1, x2, color);
            }

            let left = x1 + t;
            let right = x2 - t;
            if (0..width).contains(&left) {
                fill_column(pixels, stride, left, y1, y2, color);
            }
            if (0..width).contains(&right) && right != left {
                fill_column(pixels, stride, right, y1, y2, color);
            }
        }
    }
}

fn fill_row(pixels: &mut [u8], stride: i32, y: i32, x1: i32, x2: i32, color: [u8; 3]) {
    for x in x1..=x2 {
        let offset = (y * stride + x * 3) as usize;
        pixels[offset..offset + 3].copy_from_slice(&color);
    }
}

fn fill_column(pixels: &mut [u8], stride: i32, x: i32, y1: i32, y2: i32, color: [u8; 3]) {
    for y in y1..=y2 {
        let offset = (y * stride + x * 3) as usize;
        pixels[offset..offset + 3].copy_from_slice(&color);
    }
}
