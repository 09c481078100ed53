//! RTSP capture pipeline: one thread per camera, FFmpeg child process for
//! demux + decode, reconnect with exponential backoff.
//!
//! The child is started with TCP transport, a 5 s connect timeout, and
//! low-delay flags, and emits raw BGR24 frames on stdout. Stopping the
//! capture kills the child so a blocked read unblocks promptly.

use std::{
    io::Read,
    process::{Child, ChildStdout, Command, Stdio},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{frame::FramePool, ring::FrameRing};

/// Initial reconnect delay in seconds.
const BACKOFF_FLOOR_SECS: u64 = 5;
/// Reconnect delay ceiling in seconds.
const BACKOFF_CEIL_SECS: u64 = 60;
/// Stop-flag poll interval while waiting out a backoff.
const BACKOFF_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to probe stream {uri:?}: {reason}")]
    Probe { uri: String, reason: String },
    #[error("decoder exited: {0}")]
    StreamEnded(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Lock-free counters readable from any thread without touching the decoder.
#[derive(Default)]
pub struct CaptureStats {
    frames_captured: AtomicU64,
    dropped_frames: AtomicU64,
    reconnect_count: AtomicU64,
    consecutive_failures: AtomicU64,
    connected: AtomicBool,
    /// Wall-clock millis of the last decoded frame; 0 = never.
    last_frame_millis: AtomicU64,
    frame_width: AtomicI32,
    frame_height: AtomicI32,
}

/// Point-in-time copy of [`CaptureStats`].
#[derive(Clone, Debug, Default)]
pub struct CaptureStatsSnapshot {
    pub frames_captured: u64,
    pub dropped_frames: u64,
    pub reconnect_count: u64,
    pub consecutive_failures: u64,
    pub is_connected: bool,
    pub last_frame_millis: u64,
    pub frame_width: i32,
    pub frame_height: i32,
}

impl CaptureStats {
    pub fn snapshot(&self) -> CaptureStatsSnapshot {
        CaptureStatsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
            reconnect_count: self.reconnect_count.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            is_connected: self.connected.load(Ordering::Relaxed),
            last_frame_millis: self.last_frame_millis.load(Ordering::Relaxed),
            frame_width: self.frame_width.load(Ordering::Relaxed),
            frame_height: self.frame_height.load(Ordering::Relaxed),
        }
    }
}

/// Per-camera capture pipeline.
pub struct RtspCapture {
    camera_id: String,
    rtsp_url: String,
    pool: FramePool,
    ring: Arc<FrameRing>,
    running: Arc<AtomicBool>,
    stats: Arc<CaptureStats>,
    child: Arc<Mutex<Option<Child>>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl RtspCapture {
    pub fn new(
        camera_id: impl Into<String>,
        rtsp_url: impl Into<String>,
        pool: FramePool,
        ring: Arc<FrameRing>,
    ) -> Self {
        Self {
            camera_id: camera_id.into(),
            rtsp_url: rtsp_url.into(),
            pool,
            ring,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(CaptureStats::default()),
            child: Arc::new(Mutex::new(None)),
            handle: None,
        }
    }

    pub fn stats(&self) -> CaptureStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Spawn the capture thread. Idempotent while running.
    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let worker = CaptureWorker {
            camera_id: self.camera_id.clone(),
            rtsp_url: self.rtsp_url.clone(),
            pool: self.pool.clone(),
            ring: Arc::clone(&self.ring),
            running: Arc::clone(&self.running),
            stats: Arc::clone(&self.stats),
            child: Arc::clone(&self.child),
        };
        let name = format!("capture-{}", self.camera_id);
        self.handle = Some(
            thread::Builder::new()
                .name(name)
                .spawn(move || worker.run())
                .expect("failed to spawn capture thread"),
        );
        info!(camera = %self.camera_id, "capture thread started");
    }

    /// Signal stop, unblock any in-flight read, and join the thread.
    pub fn stop(&mut self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        kill_child(&self.child);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        if was_running {
            info!(camera = %self.camera_id, "capture thread stopped");
        }
    }
}

impl Drop for RtspCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn kill_child(slot: &Arc<Mutex<Option<Child>>>) {
    let mut guard = match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Some(child) = guard.as_mut() {
        let _ = child.kill();
        let _ = child.wait();
    }
    *guard = None;
}

struct CaptureWorker {
    camera_id: String,
    rtsp_url: String,
    pool: FramePool,
    ring: Arc<FrameRing>,
    running: Arc<AtomicBool>,
    stats: Arc<CaptureStats>,
    child: Arc<Mutex<Option<Child>>>,
}

struct OpenStream {
    stdout: ChildStdout,
    width: i32,
    height: i32,
}

impl CaptureWorker {
    fn run(self) {
        let mut backoff = BACKOFF_FLOOR_SECS;
        let mut frame_counter: u64 = 0;

        while self.running.load(Ordering::Relaxed) {
            info!(camera = %self.camera_id, "connecting to RTSP stream");
            match self.open_stream() {
                Ok(stream) => {
                    self.stats.connected.store(true, Ordering::Relaxed);
                    self.stats.consecutive_failures.store(0, Ordering::Relaxed);
                    backoff = BACKOFF_FLOOR_SECS;
                    info!(
                        camera = %self.camera_id,
                        width = stream.width,
                        height = stream.height,
                        "connected"
                    );

                    if let Err(err) = self.read_frames(stream, &mut frame_counter) {
                        if self.running.load(Ordering::Relaxed) {
                            warn!(camera = %self.camera_id, error = %err, "stream ended, reconnecting");
                        }
                    }
                    kill_child(&self.child);
                    self.stats.connected.store(false, Ordering::Relaxed);
                    if self.running.load(Ordering::Relaxed) {
                        self.stats.reconnect_count.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(err) => {
                    let failures = self
                        .stats
                        .consecutive_failures
                        .fetch_add(1, Ordering::Relaxed)
                        + 1;
                    self.stats.reconnect_count.fetch_add(1, Ordering::Relaxed);
                    self.stats.connected.store(false, Ordering::Relaxed);
                    warn!(
                        camera = %self.camera_id,
                        error = %err,
                        backoff_secs = backoff,
                        attempt = failures,
                        "failed to open stream"
                    );
                    self.sleep_backoff(backoff);
                    backoff = next_backoff(backoff);
                }
            }
        }
        kill_child(&self.child);
        self.stats.connected.store(false, Ordering::Relaxed);
    }

    /// Probe stream dimensions, then spawn the decoding child.
    fn open_stream(&self) -> Result<OpenStream, CaptureError> {
        let (width, height, codec) = probe_stream(&self.rtsp_url)?;
        debug!(camera = %self.camera_id, width, height, codec = %codec, "probed stream");

        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-rtsp_transport")
            .arg("tcp")
            .arg("-stimeout")
            .arg("5000000")
            .arg("-fflags")
            .arg("nobuffer")
            .arg("-flags")
            .arg("low_delay")
            .arg("-i")
            .arg(&self.rtsp_url)
            .arg("-an")
            .arg("-pix_fmt")
            .arg("bgr24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning ffmpeg for {}", self.rtsp_url))
            .map_err(CaptureError::Other)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")))?;

        {
            let mut guard = match self.child.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            // stop() may have raced us; kill immediately rather than leak.
            if !self.running.load(Ordering::Relaxed) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CaptureError::StreamEnded("stopping".into()));
            }
            *guard = Some(child);
        }

        self.stats.frame_width.store(width, Ordering::Relaxed);
        self.stats.frame_height.store(height, Ordering::Relaxed);

        Ok(OpenStream {
            stdout,
            width,
            height,
        })
    }

    /// Pull raw frames off the child's stdout until error or stop.
    fn read_frames(
        &self,
        mut stream: OpenStream,
        frame_counter: &mut u64,
    ) -> Result<(), CaptureError> {
        let frame_bytes = stream.width as usize * stream.height as usize * 3;
        // Used to drain the pipe when the pool has nothing to lend.
        let mut discard = vec![0u8; frame_bytes];

        while self.running.load(Ordering::Relaxed) {
            let Some(mut frame) = self.pool.acquire() else {
                stream
                    .stdout
                    .read_exact(&mut discard)
                    .map_err(|err| CaptureError::StreamEnded(err.to_string()))?;
                self.stats.dropped_frames.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("camwatch_capture_dropped_frames_total").increment(1);
                warn!(camera = %self.camera_id, "frame pool exhausted, dropping frame");
                continue;
            };

            if frame.width != stream.width || frame.height != stream.height {
                frame.resize(stream.width, stream.height);
            }
            stream
                .stdout
                .read_exact(&mut frame.pixels)
                .map_err(|err| CaptureError::StreamEnded(err.to_string()))?;

            *frame_counter += 1;
            frame.timestamp = Instant::now();
            frame.frame_number = *frame_counter;

            self.stats.frames_captured.fetch_add(1, Ordering::Relaxed);
            self.stats
                .last_frame_millis
                .store(current_millis(), Ordering::Relaxed);
            metrics::counter!("camwatch_capture_frames_total").increment(1);

            self.ring.push(Arc::new(frame));
        }
        Ok(())
    }

    fn sleep_backoff(&self, backoff_secs: u64) {
        let deadline = Instant::now() + Duration::from_secs(backoff_secs);
        while self.running.load(Ordering::Relaxed) && Instant::now() < deadline {
            thread::sleep(BACKOFF_POLL);
        }
    }
}

/// Next reconnect delay: double, capped at the ceiling.
fn next_backoff(current_secs: u64) -> u64 {
    (current_secs * 2).min(BACKOFF_CEIL_SECS)
}

fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeStream {
    width: Option<i32>,
    height: Option<i32>,
    codec_name: Option<String>,
}

/// Query the first video substream's dimensions and codec via ffprobe.
fn probe_stream(uri: &str) -> Result<(i32, i32, String), CaptureError> {
    let output = Command::new("ffprobe")
        .arg("-v")
        .arg("error")
        .arg("-rtsp_transport")
        .arg("tcp")
        .arg("-select_streams")
        .arg("v:0")
        .arg("-show_entries")
        .arg("stream=width,height,codec_name")
        .arg("-of")
        .arg("json")
        .arg(uri)
        .stdin(Stdio::null())
        .output()
        .map_err(|err| CaptureError::Probe {
            uri: uri.to_string(),
            reason: err.to_string(),
        })?;

    if !output.status.success() {
        return Err(CaptureError::Probe {
            uri: uri.to_string(),
            reason: format!("ffprobe exited with {}", output.status),
        });
    }

    let parsed: ProbeOutput =
        serde_json::from_slice(&output.stdout).map_err(|err| CaptureError::Probe {
            uri: uri.to_string(),
            reason: format!("unparseable ffprobe output: {err}"),
        })?;

    let stream = parsed
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| CaptureError::Probe {
            uri: uri.to_string(),
            reason: "no video stream found".into(),
        })?;

    match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => Ok((
            w,
            h,
            stream.codec_name.unwrap_or_else(|| "unknown".into()),
        )),
        _ => Err(CaptureError::Probe {
            uri: uri.to_string(),
            reason: "video stream reports no dimensions".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_ceiling() {
        let mut backoff = BACKOFF_FLOOR_SECS;
        let mut observed = vec![backoff];
        for _ in 0..5 {
            backoff = next_backoff(backoff);
            observed.push(backoff);
        }
        assert_eq!(observed, vec![5, 10, 20, 40, 60, 60]);
    }

    #[test]
    fn stats_snapshot_defaults() {
        let stats = CaptureStats::default();
        let snap = stats.snapshot();
        assert_eq!(snap.frames_captured, 0);
        assert!(!snap.is_connected);
        assert_eq!(snap.last_frame_millis, 0);
    }

    #[test]
    fn probe_output_parses_ffprobe_json() {
        let raw = r#"{"programs": [], "streams": [{"width": 1920, "height": 1080, "codec_name": "h264"}]}"#;
        let parsed: ProbeOutput = serde_json::from_str(raw).unwrap();
        let stream = &parsed.streams[0];
        assert_eq!(stream.width, Some(1920));
        assert_eq!(stream.height, Some(1080));
        assert_eq!(stream.codec_name.as_deref(), Some("h264"));
    }

    #[test]
    fn capture_can_start_and_stop_without_source() {
        let pool = FramePool::new(4);
        let ring = Arc::new(FrameRing::new(4));
        let mut capture = RtspCapture::new("cam", "rtsp://127.0.0.1:1/none", pool, ring);
        capture.start();
        assert!(capture.is_running());
        capture.stop();
        assert!(!capture.is_running());
        assert!(!capture.stats().is_connected);
    }
}
