//! Continuous detection worker: samples a camera's ring buffer at a fixed
//! interval and caches the latest result.

use std::{
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use camwatch_ingest::FrameRing;
use tracing::{debug, info};

use crate::{DetectionResult, Detector};

/// Default sampling cadence (~3 Hz).
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(333);

#[derive(Default)]
struct WorkerStats {
    frames_processed: AtomicU64,
    detections_found: AtomicU64,
    /// Running mean inference time, stored as f64 bits.
    avg_inference_ms: AtomicU64,
}

/// Point-in-time copy of a worker's counters.
#[derive(Clone, Debug, Default)]
pub struct WorkerStatsSnapshot {
    pub frames_processed: u64,
    pub detections_found: u64,
    pub avg_inference_ms: f64,
    pub is_running: bool,
}

/// Per-camera sampling thread over a shared [`Detector`].
pub struct DetectionWorker {
    camera_id: String,
    ring: Arc<FrameRing>,
    engine: Arc<dyn Detector>,
    conf_threshold: f32,
    iou_threshold: f32,
    filter_classes: Vec<String>,
    sample_interval: Duration,
    running: Arc<AtomicBool>,
    latest_result: Arc<RwLock<Option<DetectionResult>>>,
    stats: Arc<WorkerStats>,
    handle: Option<thread::JoinHandle<()>>,
}

impl DetectionWorker {
    pub fn new(
        camera_id: impl Into<String>,
        ring: Arc<FrameRing>,
        engine: Arc<dyn Detector>,
        conf_threshold: f32,
        iou_threshold: f32,
        filter_classes: Vec<String>,
    ) -> Self {
        Self {
            camera_id: camera_id.into(),
            ring,
            engine,
            conf_threshold,
            iou_threshold,
            filter_classes,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            running: Arc::new(AtomicBool::new(false)),
            latest_result: Arc::new(RwLock::new(None)),
            stats: Arc::new(WorkerStats::default()),
            handle: None,
        }
    }

    /// Override the sampling cadence (tests use short intervals).
    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let loop_state = SampleLoop {
            camera_id: self.camera_id.clone(),
            ring: Arc::clone(&self.ring),
            engine: Arc::clone(&self.engine),
            conf_threshold: self.conf_threshold,
            iou_threshold: self.iou_threshold,
            filter_classes: self.filter_classes.clone(),
            sample_interval: self.sample_interval,
            running: Arc::clone(&self.running),
            latest_result: Arc::clone(&self.latest_result),
            stats: Arc::clone(&self.stats),
        };
        self.handle = Some(
            thread::Builder::new()
                .name(format!("detect-{}", self.camera_id))
                .spawn(move || loop_state.run())
                .expect("failed to spawn detection worker"),
        );
        info!(
            camera = %self.camera_id,
            conf = self.conf_threshold,
            iou = self.iou_threshold,
            interval_ms = self.sample_interval.as_millis() as u64,
            "detection worker started"
        );
    }

    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        info!(camera = %self.camera_id, "detection worker stopped");
    }

    pub fn latest_result(&self) -> Option<DetectionResult> {
        self.latest_result
            .read()
            .expect("worker result lock poisoned")
            .clone()
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            frames_processed: self.stats.frames_processed.load(Ordering::Relaxed),
            detections_found: self.stats.detections_found.load(Ordering::Relaxed),
            avg_inference_ms: f64::from_bits(self.stats.avg_inference_ms.load(Ordering::Relaxed)),
            is_running: self.running.load(Ordering::Relaxed),
        }
    }
}

impl Drop for DetectionWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

struct SampleLoop {
    camera_id: String,
    ring: Arc<FrameRing>,
    engine: Arc<dyn Detector>,
    conf_threshold: f32,
    iou_threshold: f32,
    filter_classes: Vec<String>,
    sample_interval: Duration,
    running: Arc<AtomicBool>,
    latest_result: Arc<RwLock<Option<DetectionResult>>>,
    stats: Arc<WorkerStats>,
}

impl SampleLoop {
    fn run(self) {
        let mut last_seen: u64 = 0;
        let mut total_inference_ms: f64 = 0.0;

        while self.running.load(Ordering::Relaxed) {
            let Some(frame) = self.ring.latest() else {
                thread::sleep(self.sample_interval);
                continue;
            };
            if frame.frame_number == last_seen {
                drop(frame);
                thread::sleep(self.sample_interval);
                continue;
            }
            last_seen = frame.frame_number;

            let started = Instant::now();
            let detections = self.engine.detect(
                &frame,
                self.conf_threshold,
                self.iou_threshold,
                &self.filter_classes,
            );
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            metrics::histogram!("camwatch_inference_seconds").record(elapsed_ms / 1000.0);

            let found = detections.len() as u64;
            if found > 0 {
                debug!(camera = %self.camera_id, count = found, "detections");
            }

            {
                let mut guard = self
                    .latest_result
                    .write()
                    .expect("worker result lock poisoned");
                *guard = Some(DetectionResult {
                    detections,
                    timestamp: frame.timestamp,
                    frame_number: frame.frame_number,
                });
            }
            // Release the ring handle before sleeping out the interval.
            drop(frame);

            let count = self.stats.frames_processed.fetch_add(1, Ordering::Relaxed) + 1;
            self.stats.detections_found.fetch_add(found, Ordering::Relaxed);
            total_inference_ms += elapsed_ms;
            self.stats
                .avg_inference_ms
                .store((total_inference_ms / count as f64).to_bits(), Ordering::Relaxed);

            let elapsed = started.elapsed();
            if let Some(remaining) = self.sample_interval.checked_sub(elapsed) {
                thread::sleep(remaining);
            }
        }
    }
}
