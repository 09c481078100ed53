//! Fleet-level composition: one pool + ring + capture per enabled camera,
//! plus the shared detection engine and its per-camera workers.

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex, RwLock},
};

use camwatch_detect::{
    DetectionEngine, DetectionResult, DetectionWorker, Detector, WorkerStatsSnapshot,
};
use camwatch_ingest::{FramePool, FrameRing, RtspCapture, SharedFrame};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::AppConfig;

/// Ring capacity floor when `preroll_seconds * fps` is zero.
const RING_CAPACITY_FLOOR: usize = 75;
/// Extra pool buffers beyond ring residency for in-flight frames.
const POOL_HEADROOM: usize = 15;

/// Aggregated per-camera capture view used by the health surface.
#[derive(Clone, Debug, Serialize)]
pub struct CameraStats {
    pub camera_id: String,
    pub camera_name: String,
    pub buffer_size: usize,
    pub max_frames: usize,
    pub frames_captured: u64,
    pub dropped_frames: u64,
    pub reconnect_count: u64,
    pub consecutive_failures: u64,
    pub is_connected: bool,
    pub is_healthy: bool,
    pub frame_width: i32,
    pub frame_height: i32,
    pub last_frame_millis: u64,
}

struct CameraState {
    name: String,
    pool: FramePool,
    ring: Arc<FrameRing>,
    capture: Mutex<RtspCapture>,
}

/// Owns every pool, ring buffer, and capture pipeline in the process.
pub struct BufferService {
    config: Arc<AppConfig>,
    cameras: HashMap<String, CameraState>,
    engine: RwLock<Option<Arc<dyn Detector>>>,
    workers: Mutex<HashMap<String, DetectionWorker>>,
}

impl BufferService {
    pub fn new(config: Arc<AppConfig>) -> Self {
        let mut cameras = HashMap::new();
        let mut ring_capacity =
            (config.buffer.preroll_seconds as usize) * (config.buffer.fps as usize);
        if ring_capacity == 0 {
            ring_capacity = RING_CAPACITY_FLOOR;
        }
        let pool_capacity = ring_capacity + POOL_HEADROOM;

        for (id, cam) in &config.cameras {
            if !cam.enabled {
                info!(camera = %id, "camera disabled, skipping");
                continue;
            }
            let pool = FramePool::new(pool_capacity);
            let ring = Arc::new(FrameRing::new(ring_capacity));
            let capture =
                RtspCapture::new(id.clone(), cam.rtsp_url.clone(), pool.clone(), Arc::clone(&ring));
            cameras.insert(
                id.clone(),
                CameraState {
                    name: cam.name.clone(),
                    pool,
                    ring,
                    capture: Mutex::new(capture),
                },
            );
            info!(
                camera = %id,
                pool = pool_capacity,
                ring = ring_capacity,
                "camera configured"
            );
        }

        Self {
            config,
            cameras,
            engine: RwLock::new(None),
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn start_all(&self) {
        info!(count = self.cameras.len(), "starting captures");
        for state in self.cameras.values() {
            state.capture.lock().expect("capture lock poisoned").start();
        }
    }

    pub fn stop_all(&self) {
        info!("stopping captures");
        for state in self.cameras.values() {
            state.capture.lock().expect("capture lock poisoned").stop();
        }
    }

    /// Load the ONNX model. On failure detection stays disabled and
    /// buffering continues.
    pub fn load_detection_model(&self) {
        let model_path = &self.config.detection.model_path;
        if model_path.is_empty() || !Path::new(model_path).exists() {
            warn!(path = %model_path, "detection model not found, detection disabled");
            return;
        }
        match DetectionEngine::load(
            Path::new(model_path),
            self.config.detection.input_size,
            self.config.detection.num_classes,
        ) {
            Ok(engine) => self.install_engine(Arc::new(engine)),
            Err(err) => {
                warn!(error = %err, "failed to load detection model, detection disabled");
            }
        }
    }

    /// Install a detector shared by workers and the event pipeline.
    pub fn install_engine(&self, engine: Arc<dyn Detector>) {
        *self.engine.write().expect("engine lock poisoned") = Some(engine);
    }

    /// Start one continuous worker per camera. No-op without a loaded model.
    pub fn start_detection(&self) {
        let Some(engine) = self.detection_engine() else {
            return;
        };
        let mut workers = self.workers.lock().expect("workers lock poisoned");
        for (id, state) in &self.cameras {
            let mut worker = DetectionWorker::new(
                id.clone(),
                Arc::clone(&state.ring),
                Arc::clone(&engine),
                self.config.confidence_for(id),
                self.config.detection.iou_threshold,
                self.config.classes_for(id),
            );
            worker.start();
            workers.insert(id.clone(), worker);
        }
        info!(count = workers.len(), "detection workers started");
    }

    pub fn stop_detection(&self) {
        let mut workers = self.workers.lock().expect("workers lock poisoned");
        if workers.is_empty() {
            return;
        }
        info!("stopping detection workers");
        for worker in workers.values_mut() {
            worker.stop();
        }
        workers.clear();
        *self.engine.write().expect("engine lock poisoned") = None;
    }

    pub fn detection_engine(&self) -> Option<Arc<dyn Detector>> {
        self.engine.read().expect("engine lock poisoned").clone()
    }

    pub fn detection_result(&self, camera_id: &str) -> Option<DetectionResult> {
        self.workers
            .lock()
            .expect("workers lock poisoned")
            .get(camera_id)
            .and_then(|worker| worker.latest_result())
    }

    pub fn detection_stats(&self) -> HashMap<String, WorkerStatsSnapshot> {
        self.workers
            .lock()
            .expect("workers lock poisoned")
            .iter()
            .map(|(id, worker)| (id.clone(), worker.stats()))
            .collect()
    }

    pub fn latest_frame(&self, camera_id: &str) -> Option<SharedFrame> {
        self.cameras.get(camera_id).and_then(|state| state.ring.latest())
    }

    pub fn camera_buffer(&self, camera_id: &str) -> Option<Arc<FrameRing>> {
        self.cameras.get(camera_id).map(|state| Arc::clone(&state.ring))
    }

    pub fn camera_name(&self, camera_id: &str) -> Option<String> {
        self.cameras.get(camera_id).map(|state| state.name.clone())
    }

    pub fn camera_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.cameras.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn all_stats(&self) -> Vec<CameraStats> {
        let mut stats: Vec<CameraStats> = self
            .cameras
            .iter()
            .map(|(id, state)| {
                let capture = state
                    .capture
                    .lock()
                    .expect("capture lock poisoned")
                    .stats();
                let buffer_size = state.ring.len();
                CameraStats {
                    camera_id: id.clone(),
                    camera_name: state.name.clone(),
                    buffer_size,
                    max_frames: state.ring.capacity(),
                    frames_captured: capture.frames_captured,
                    dropped_frames: capture.dropped_frames,
                    reconnect_count: capture.reconnect_count,
                    consecutive_failures: capture.consecutive_failures,
                    is_connected: capture.is_connected,
                    is_healthy: capture.is_connected && buffer_size > 0,
                    frame_width: capture.frame_width,
                    frame_height: capture.frame_height,
                    last_frame_millis: capture.last_frame_millis,
                }
            })
            .collect();
        stats.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));
        stats
    }

    /// True when at least one camera is connected with buffered frames.
    pub fn is_healthy(&self) -> bool {
        self.cameras.values().any(|state| {
            let capture = state
                .capture
                .lock()
                .expect("capture lock poisoned")
                .stats();
            capture.is_connected && !state.ring.is_empty()
        })
    }

    /// Pool occupancy for a camera, mainly for diagnostics.
    pub fn pool_stats(&self, camera_id: &str) -> Option<(usize, usize)> {
        self.cameras
            .get(camera_id)
            .map(|state| (state.pool.available(), state.pool.in_use()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, CameraConfig};

    fn two_camera_config() -> Arc<AppConfig> {
        let mut config = AppConfig::default();
        config.buffer.preroll_seconds = 2;
        config.buffer.fps = 10;
        for (id, enabled) in [("front", true), ("yard", true), ("garage", false)] {
            config.cameras.insert(
                id.to_string(),
                CameraConfig {
                    name: id.to_uppercase(),
                    rtsp_url: format!("rtsp://127.0.0.1:1/{id}"),
                    enabled,
                    ..CameraConfig::default()
                },
            );
        }
        Arc::new(config)
    }

    #[test]
    fn builds_only_enabled_cameras() {
        let service = BufferService::new(two_camera_config());
        assert_eq!(service.camera_ids(), vec!["front", "yard"]);
        assert!(service.camera_buffer("front").is_some());
        assert!(service.camera_buffer("garage").is_none());
    }

    #[test]
    fn ring_capacity_follows_preroll_times_fps() {
        let service = BufferService::new(two_camera_config());
        let ring = service.camera_buffer("front").unwrap();
        assert_eq!(ring.capacity(), 20);
        let (available, in_use) = service.pool_stats("front").unwrap();
        assert_eq!(available, 20 + POOL_HEADROOM);
        assert_eq!(in_use, 0);
    }

    #[test]
    fn ring_capacity_floor_applies_when_product_is_zero() {
        let mut config = AppConfig::default();
        config.buffer.preroll_seconds = 0;
        config.buffer.fps = 0;
        config.cameras.insert(
            "solo".into(),
            CameraConfig {
                rtsp_url: "rtsp://127.0.0.1:1/solo".into(),
                ..CameraConfig::default()
            },
        );
        let service = BufferService::new(Arc::new(config));
        assert_eq!(
            service.camera_buffer("solo").unwrap().capacity(),
            RING_CAPACITY_FLOOR
        );
    }

    #[test]
    fn unconnected_fleet_reports_unhealthy() {
        let service = BufferService::new(two_camera_config());
        assert!(!service.is_healthy());
        let stats = service.all_stats();
        assert_eq!(stats.len(), 2);
        assert!(stats.iter().all(|s| !s.is_connected && !s.is_healthy));
        assert!(stats.iter().all(|s| s.buffer_size == 0));
    }

    #[test]
    fn detection_disabled_without_model() {
        let service = BufferService::new(two_camera_config());
        service.load_detection_model();
        assert!(service.detection_engine().is_none());
        service.start_detection();
        assert!(service.detection_stats().is_empty());
        assert!(service.detection_result("front").is_none());
    }
}
