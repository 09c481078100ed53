//! MP4 event recorder.
//!
//! Frames are piped as raw BGR24 into an FFmpeg child that encodes H.264
//! (ultrafast, CRF 28, GOP = fps) into an MP4 with the moov atom at the
//! head. The recorder tracks the post-roll window after a stop request and
//! enforces a hard 30 s duration cap.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    process::{Child, ChildStdin, Command, Stdio},
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow};
use camwatch_ingest::FrameData;
use tracing::{debug, info, warn};

use crate::snapshot::timestamp_slug;

/// Hard cap on any single recording.
pub const MAX_DURATION_SECONDS: u64 = 30;

/// Stop-request bookkeeping, separated from the encoder so the timing rules
/// stay testable without spawning FFmpeg.
#[derive(Debug)]
struct RollState {
    fps: u32,
    frames_written: u64,
    stop_requested_at: Option<Instant>,
    post_roll: Duration,
}

impl RollState {
    fn new(fps: u32) -> Self {
        Self {
            fps,
            frames_written: 0,
            stop_requested_at: None,
            post_roll: Duration::ZERO,
        }
    }

    fn request_stop(&mut self, post_roll_seconds: u64) {
        if self.stop_requested_at.is_none() {
            self.stop_requested_at = Some(Instant::now());
            self.post_roll = Duration::from_secs(post_roll_seconds);
        }
    }

    fn post_roll_complete(&self) -> bool {
        match self.stop_requested_at {
            Some(at) => at.elapsed() >= self.post_roll,
            None => false,
        }
    }

    fn max_duration_reached(&self) -> bool {
        self.frames_written >= self.fps as u64 * MAX_DURATION_SECONDS
    }
}

pub struct EventRecorder {
    camera_id: String,
    width: i32,
    height: i32,
    file_path: PathBuf,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    roll: RollState,
    finalized: bool,
}

impl EventRecorder {
    /// Open the encoder and write all preroll frames of matching dimensions.
    pub fn start(
        camera_id: &str,
        preroll_frames: &[FrameData],
        width: i32,
        height: i32,
        fps: u32,
        output_dir: &Path,
    ) -> Result<Self> {
        let fps = if fps > 0 { fps } else { 10 };
        fs::create_dir_all(output_dir)
            .with_context(|| format!("creating events directory {}", output_dir.display()))?;
        let file_path = output_dir.join(format!("{}_{}.mp4", camera_id, timestamp_slug()));

        let mut child = Command::new("ffmpeg")
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-f")
            .arg("rawvideo")
            .arg("-pixel_format")
            .arg("bgr24")
            .arg("-video_size")
            .arg(format!("{width}x{height}"))
            .arg("-framerate")
            .arg(fps.to_string())
            .arg("-i")
            .arg("-")
            .arg("-an")
            .arg("-c:v")
            .arg("libx264")
            .arg("-preset")
            .arg("ultrafast")
            .arg("-crf")
            .arg("28")
            .arg("-g")
            .arg(fps.to_string())
            .arg("-pix_fmt")
            .arg("yuv420p")
            .arg("-movflags")
            .arg("+faststart")
            .arg("-y")
            .arg(&file_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("spawning ffmpeg encoder for {}", file_path.display()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to open encoder stdin"))?;

        let mut recorder = Self {
            camera_id: camera_id.to_string(),
            width,
            height,
            file_path,
            child: Some(child),
            stdin: Some(stdin),
            roll: RollState::new(fps),
            finalized: false,
        };

        info!(
            camera = camera_id,
            path = %recorder.file_path.display(),
            width,
            height,
            fps,
            preroll = preroll_frames.len(),
            "recording started"
        );

        for frame in preroll_frames {
            if frame.width == width && frame.height == height {
                recorder.write_frame(frame);
            }
        }

        Ok(recorder)
    }

    /// Encode one frame. Returns false when the frame was refused (cap
    /// reached, dimension mismatch, or encoder gone).
    pub fn write_frame(&mut self, frame: &FrameData) -> bool {
        if self.finalized || self.roll.max_duration_reached() {
            return false;
        }
        if frame.width != self.width || frame.height != self.height {
            return false;
        }
        let Some(stdin) = self.stdin.as_mut() else {
            return false;
        };
        if let Err(err) = stdin.write_all(&frame.pixels) {
            warn!(camera = %self.camera_id, error = %err, "encoder rejected frame");
            return false;
        }
        self.roll.frames_written += 1;
        true
    }

    /// Begin the post-roll window; only the first call counts.
    pub fn request_stop(&mut self, post_roll_seconds: u64) {
        debug!(
            camera = %self.camera_id,
            post_roll_seconds,
            "recorder stop requested"
        );
        self.roll.request_stop(post_roll_seconds);
    }

    pub fn post_roll_complete(&self) -> bool {
        self.roll.post_roll_complete()
    }

    pub fn max_duration_reached(&self) -> bool {
        self.roll.max_duration_reached()
    }

    pub fn frames_written(&self) -> u64 {
        self.roll.frames_written
    }

    pub fn fps(&self) -> u32 {
        self.roll.fps
    }

    /// Recording file name (no directory).
    pub fn file_name(&self) -> String {
        self.file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Close the encoder input and wait for the container to be written.
    /// Idempotent.
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;

        // Dropping stdin signals EOF so the encoder can flush and write the
        // trailer.
        self.stdin.take();
        if let Some(mut child) = self.child.take() {
            let status = child.wait().context("waiting for encoder")?;
            if !status.success() {
                warn!(
                    camera = %self.camera_id,
                    status = %status,
                    "encoder exited abnormally"
                );
            }
        }

        let duration = self.roll.frames_written as f64 / self.roll.fps as f64;
        info!(
            camera = %self.camera_id,
            path = %self.file_path.display(),
            frames = self.roll.frames_written,
            seconds = format!("{duration:.1}"),
            "recording finalized"
        );
        Ok(())
    }
}

impl Drop for EventRecorder {
    fn drop(&mut self) {
        if !self.finalized {
            let _ = self.finalize();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn post_roll_window_opens_only_after_stop() {
        let mut roll = RollState::new(10);
        assert!(!roll.post_roll_complete());

        roll.request_stop(0);
        assert!(roll.post_roll_complete());
    }

    #[test]
    fn post_roll_waits_out_the_requested_seconds() {
        let mut roll = RollState::new(10);
        roll.request_stop(1);
        assert!(!roll.post_roll_complete());
        // Only the first request counts; a shorter retry must not override.
        roll.request_stop(0);
        assert!(!roll.post_roll_complete());
        thread::sleep(Duration::from_millis(1100));
        assert!(roll.post_roll_complete());
    }

    #[test]
    fn max_duration_counts_frames_against_fps() {
        let mut roll = RollState::new(2);
        assert!(!roll.max_duration_reached());
        roll.frames_written = 2 * MAX_DURATION_SECONDS - 1;
        assert!(!roll.max_duration_reached());
        roll.frames_written = 2 * MAX_DURATION_SECONDS;
        assert!(roll.max_duration_reached());
    }
}
