//! Motion-event orchestration.
//!
//! Listens for motion start/stop signals on the event bus and drives one
//! recording pipeline per camera: ring-buffer preroll, live + post-roll
//! encoding with sampled detection, early notification on the first hit,
//! a parallel captioning call, final publication, and persistence.
//!
//! Single-flight per camera: a start for a camera with an event in flight
//! is ignored. Finished task handles land on a graveyard list that is
//! drained opportunistically and on `stop()`, so shutdown always joins
//! every event thread before the owning services go away.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::{Result, bail};
use camwatch_detect::{Detection, Detector};
use camwatch_ingest::{FrameData, FrameRing};
use chrono::{SecondsFormat, Utc};
use rumqttc::QoS;
use serde_json::json;
use tracing::{error, info, warn};

use crate::{
    bus::{EventBus, MqttBus},
    config::AppConfig,
    fleet::BufferService,
    recorder::EventRecorder,
    snapshot::save_snapshot,
    store::{AiContextRecord, EventStore},
    vision::{CaptionResult, VisionClient, select_primary_class},
};

/// Run detection on every Nth written frame.
const DETECTION_SAMPLE_INTERVAL: u32 = 3;
/// Wait between polls when the ring has nothing new for us.
const FRAME_POLL_WAIT: Duration = Duration::from_millis(30);
/// Delay before resetting the binary sensor after an event with detections.
const SENSOR_RESET_DELAY: Duration = Duration::from_secs(2);

/// Motion start topic the orchestrator subscribes to.
pub const MOTION_START_TOPIC: &str = "camera/event/motion/start";
/// Motion stop topic the orchestrator subscribes to.
pub const MOTION_STOP_TOPIC: &str = "camera/event/motion/stop";

/// Shared flag block for one in-flight event.
struct EventState {
    event_id: String,
    /// Set by motion/stop; ends the live phase but not the post-roll.
    stop_requested: AtomicBool,
    running: AtomicBool,
}

struct ActiveEvent {
    state: Arc<EventState>,
    handle: Option<thread::JoinHandle<()>>,
}

pub struct EventOrchestrator {
    /// Self-handle so event threads can reach the shared tables.
    me: Weak<EventOrchestrator>,
    buffers: Arc<BufferService>,
    bus: Arc<dyn EventBus>,
    store: Option<Arc<EventStore>>,
    config: Arc<AppConfig>,
    active: Mutex<HashMap<String, ActiveEvent>>,
    graveyard: Mutex<Vec<thread::JoinHandle<()>>>,
    /// Cleared on shutdown; aborts live and post-roll loops alike.
    running: AtomicBool,
}

impl EventOrchestrator {
    pub fn new(
        buffers: Arc<BufferService>,
        bus: Arc<dyn EventBus>,
        store: Option<Arc<EventStore>>,
        config: Arc<AppConfig>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            buffers,
            bus,
            store,
            config,
            active: Mutex::new(HashMap::new()),
            graveyard: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
        })
    }

    /// Subscribe to the motion topics. The bus callback only parses JSON and
    /// hands off; event work happens on dedicated threads.
    pub fn attach(&self, bus: &MqttBus) {
        let Some(orchestrator) = self.me.upgrade() else {
            return;
        };
        bus.subscribe(
            &[MOTION_START_TOPIC, MOTION_STOP_TOPIC],
            QoS::AtLeastOnce,
            move |topic, payload| {
                orchestrator.handle_bus_message(topic, payload);
            },
        );
        info!("listening for motion events");
    }

    fn handle_bus_message(&self, topic: &str, payload: &str) {
        if !self.running.load(Ordering::Relaxed) {
            return;
        }
        let parsed: serde_json::Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(err) => {
                error!(topic, error = %err, "unparseable motion payload");
                return;
            }
        };
        let Some(camera_id) = parsed.get("camera_id").and_then(|v| v.as_str()) else {
            warn!(topic, "motion message without camera_id");
            return;
        };

        if topic == MOTION_START_TOPIC {
            let post_roll = parsed
                .get("post_roll_seconds")
                .and_then(|v| v.as_u64())
                .unwrap_or(5);
            self.on_motion_start(camera_id, post_roll);
        } else if topic == MOTION_STOP_TOPIC {
            self.on_motion_stop(camera_id);
        }
    }

    /// Begin an event for a camera unless one is already in flight.
    pub fn on_motion_start(&self, camera_id: &str, post_roll_seconds: u64) {
        self.reap_graveyard();

        let mut active = self.active.lock().expect("active events poisoned");
        if let Some(existing) = active.get(camera_id) {
            info!(
                camera = camera_id,
                event = %existing.state.event_id,
                "ignoring motion start, event already active"
            );
            return;
        }

        let state = Arc::new(EventState {
            event_id: generate_event_id(),
            stop_requested: AtomicBool::new(false),
            running: AtomicBool::new(true),
        });

        let Some(orchestrator) = self.me.upgrade() else {
            return;
        };
        let camera = camera_id.to_string();
        let task_state = Arc::clone(&state);
        let handle = thread::Builder::new()
            .name(format!("event-{camera_id}"))
            .spawn(move || {
                orchestrator.process_event(&camera, post_roll_seconds, &task_state);
            })
            .expect("failed to spawn event thread");

        info!(camera = camera_id, event = %state.event_id, "motion start");
        metrics::counter!("camwatch_events_total").increment(1);
        active.insert(
            camera_id.to_string(),
            ActiveEvent {
                state,
                handle: Some(handle),
            },
        );
    }

    /// Flag the camera's active event to stop; preroll already written keeps
    /// going into the post-roll.
    pub fn on_motion_stop(&self, camera_id: &str) {
        let active = self.active.lock().expect("active events poisoned");
        if let Some(event) = active.get(camera_id) {
            event.state.stop_requested.store(true, Ordering::SeqCst);
            info!(camera = camera_id, event = %event.state.event_id, "motion stop");
        }
    }

    pub fn active_event_count(&self) -> usize {
        self.active.lock().expect("active events poisoned").len()
    }

    /// Signal every event to wind down, then join all task threads.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);

        let mut handles = Vec::new();
        {
            let mut active = self.active.lock().expect("active events poisoned");
            for event in active.values_mut() {
                event.state.stop_requested.store(true, Ordering::SeqCst);
                if let Some(handle) = event.handle.take() {
                    handles.push(handle);
                }
            }
            active.clear();
        }
        handles.append(&mut self.graveyard.lock().expect("graveyard poisoned"));

        for handle in handles {
            let _ = handle.join();
        }
        info!("event orchestrator stopped");
    }

    /// Join any finished task handles without blocking on live ones.
    fn reap_graveyard(&self) {
        let mut graveyard = self.graveyard.lock().expect("graveyard poisoned");
        let mut remaining = Vec::new();
        for handle in graveyard.drain(..) {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                remaining.push(handle);
            }
        }
        *graveyard = remaining;
    }

    fn process_event(&self, camera_id: &str, post_roll_seconds: u64, state: &EventState) {
        let started = Instant::now();
        if let Err(err) = self.run_event_pipeline(camera_id, post_roll_seconds, state, started) {
            warn!(
                camera = camera_id,
                event = %state.event_id,
                error = %err,
                "event aborted"
            );
        }
        state.running.store(false, Ordering::SeqCst);
        self.finish_event(camera_id, &state.event_id);
        metrics::histogram!("camwatch_event_seconds").record(started.elapsed().as_secs_f64());
    }

    fn run_event_pipeline(
        &self,
        camera_id: &str,
        post_roll_seconds: u64,
        state: &EventState,
        started: Instant,
    ) -> Result<()> {
        let prefix = self.bus.topic_prefix().to_string();
        info!(camera = camera_id, event = %state.event_id, "processing event");

        self.bus.publish(
            &format!("{prefix}/{camera_id}/detection"),
            &json!({
                "status": "started",
                "timestamp": now_iso8601(),
                "camera_id": camera_id,
            })
            .to_string(),
        );

        let Some(ring) = self.buffers.camera_buffer(camera_id) else {
            bail!("no buffer for camera");
        };
        let engine = self.buffers.detection_engine();

        // Deep-copy the preroll and release the pool handles immediately so
        // the capture pipeline is never starved while this task runs.
        let preroll: Vec<FrameData> = {
            let held = ring.snapshot();
            held.iter().map(|frame| frame.deep_copy()).collect()
        };
        info!(
            camera = camera_id,
            frames = preroll.len(),
            "preroll captured"
        );

        let (width, height) = preroll
            .iter()
            .find(|f| f.width > 0)
            .map(|f| (f.width, f.height))
            .or_else(|| self.buffers.latest_frame(camera_id).map(|f| (f.width, f.height)))
            .filter(|&(w, _)| w > 0)
            .ok_or_else(|| anyhow::anyhow!("no frames available"))?;

        let fps = self.config.buffer.fps.max(1);
        let recorder = EventRecorder::start(
            camera_id,
            &preroll,
            width,
            height,
            fps,
            Path::new(&self.config.timeline.events_dir),
        )?;
        drop(preroll);

        let mut task = EventTask {
            orchestrator: self,
            camera_id,
            state,
            prefix: &prefix,
            ring,
            engine,
            recorder,
            width,
            conf_threshold: self.config.confidence_for(camera_id),
            iou_threshold: self.config.detection.iou_threshold,
            filter_classes: self.config.classes_for(camera_id),
            frame_interval: Duration::from_millis(1000 / fps as u64),
            started,
            all_detections: Vec::new(),
            best_frame: None,
            best_confidence: 0.0,
            best_detections: Vec::new(),
            early_sent: false,
            early_snapshot_path: None,
            caption_task: None,
            last_written_frame: 0,
            frames_since_detection: 0,
            inference_count: 0,
        };

        info!(camera = camera_id, "live phase started");
        task.pump(Phase::Live);

        info!(
            camera = camera_id,
            post_roll_seconds,
            inferences = task.inference_count,
            detections = task.all_detections.len(),
            "post-roll started"
        );
        task.recorder.request_stop(post_roll_seconds);
        task.pump(Phase::PostRoll);

        if let Err(err) = task.recorder.finalize() {
            warn!(camera = camera_id, error = %err, "finalize failed");
        }

        self.publish_and_persist(camera_id, state, task);
        Ok(())
    }

    /// Steps 9-14: snapshot, dedup, final publishes, sensor reset,
    /// persistence, and the captioning join.
    fn publish_and_persist(&self, camera_id: &str, state: &EventState, mut task: EventTask<'_>) {
        let prefix = self.bus.topic_prefix().to_string();
        let snapshots_dir = PathBuf::from(&self.config.timeline.snapshots_dir);

        // Snapshot: the early branch usually saved one already.
        let snapshot_path = match task.early_snapshot_path.take() {
            Some(path) => Some(path),
            None => match (&task.best_frame, task.best_detections.is_empty()) {
                (Some(frame), false) => {
                    save_snapshot(frame, &task.best_detections, camera_id, &snapshots_dir)
                        .map_err(|err| warn!(camera = camera_id, error = %err, "snapshot failed"))
                        .ok()
                }
                _ => None,
            },
        };

        let deduped = dedup_by_class(&task.all_detections);
        let unique_classes = unique_classes_in_order(&task.all_detections);
        let counts = class_counts(&task.all_detections);
        let message = detection_message(&unique_classes);

        let duration_seconds = task.started.elapsed().as_secs_f64();
        let base_url = self.config.public_base_url();
        let recording_filename = task.recorder.file_name();
        let snapshot_filename = snapshot_path
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned());

        let dets_json: Vec<serde_json::Value> = deduped
            .iter()
            .map(|d| {
                json!({
                    "class": d.class_name,
                    "class_id": d.class_id,
                    "confidence": round3(d.confidence),
                    "bbox": {
                        "x1": d.x1 as i64,
                        "y1": d.y1 as i64,
                        "x2": d.x2 as i64,
                        "y2": d.y2 as i64,
                    },
                })
            })
            .collect();

        let snapshot_url = snapshot_filename
            .as_ref()
            .map(|name| json!(format!("{base_url}/snapshots/{name}")))
            .unwrap_or(serde_json::Value::Null);
        let recording_url = if recording_filename.is_empty() {
            serde_json::Value::Null
        } else {
            json!(format!("{base_url}/events/{recording_filename}"))
        };

        self.bus.publish(
            &format!("{prefix}/{camera_id}/result"),
            &json!({
                "camera_id": camera_id,
                "timestamp": now_iso8601(),
                "detections": dets_json,
                "detection_count": task.all_detections.len(),
                "unique_classes": unique_classes,
                "class_counts": counts,
                "detected_objects": message,
                "detection_message": message,
                "frames_processed": task.recorder.frames_written(),
                "processing_time_seconds": round2(duration_seconds),
                "snapshot_url": snapshot_url,
                "recording_url": recording_url,
                "recording_filename": recording_filename,
                "phase": "final",
            })
            .to_string(),
        );

        if !task.early_sent {
            self.bus.publish(
                &format!("{prefix}/{camera_id}/detected"),
                if task.all_detections.is_empty() { "OFF" } else { "ON" },
            );
        }

        self.bus.publish(
            &format!("{prefix}/{camera_id}/detection"),
            &json!({
                "status": "completed",
                "timestamp": now_iso8601(),
                "camera_id": camera_id,
            })
            .to_string(),
        );

        info!(
            camera = camera_id,
            event = %state.event_id,
            seconds = format!("{duration_seconds:.1}"),
            frames = task.recorder.frames_written(),
            detections = task.all_detections.len(),
            "final result published"
        );

        // Reset the binary sensor once the event produced any detection.
        if !task.all_detections.is_empty() {
            let deadline = Instant::now() + SENSOR_RESET_DELAY;
            while self.running.load(Ordering::Relaxed) && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(100));
            }
            if self.running.load(Ordering::Relaxed) {
                self.bus
                    .publish(&format!("{prefix}/{camera_id}/detected"), "OFF");
            }
        }

        if let Some(store) = &self.store {
            let camera_name = self
                .buffers
                .camera_name(camera_id)
                .unwrap_or_else(|| camera_id.to_string());
            if let Err(err) = store.create_event(
                &state.event_id,
                camera_id,
                &camera_name,
                &recording_filename,
                snapshot_filename.as_deref().unwrap_or(""),
            ) {
                error!(camera = camera_id, error = %err, "event insert failed");
            }
            if let Err(err) = store.log_detections(&state.event_id, &deduped) {
                error!(camera = camera_id, error = %err, "detection insert failed");
            }
            if let Err(err) = store.complete_event(
                &state.event_id,
                duration_seconds,
                task.recorder.frames_written(),
                task.all_detections.len(),
            ) {
                error!(camera = camera_id, error = %err, "event completion failed");
            }
        }

        self.finish_captioning(
            camera_id,
            state,
            &mut task,
            snapshot_path.as_deref(),
            &snapshot_filename,
            &recording_filename,
            &unique_classes,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_captioning(
        &self,
        camera_id: &str,
        state: &EventState,
        task: &mut EventTask<'_>,
        snapshot_path: Option<&Path>,
        snapshot_filename: &Option<String>,
        recording_filename: &str,
        unique_classes: &[String],
    ) {
        let outcome = if let Some(handle) = task.caption_task.take() {
            info!(camera = camera_id, "waiting for captioning task");
            match handle.join() {
                Ok(Ok(result)) => Some(result),
                Ok(Err(err)) => {
                    error!(camera = camera_id, error = %err, "captioning failed");
                    None
                }
                Err(_) => {
                    error!(camera = camera_id, "captioning thread panicked");
                    None
                }
            }
        } else if self.config.captioning.enabled
            && !task.early_sent
            && !task.best_detections.is_empty()
            && snapshot_path.is_some()
            && task.best_confidence >= self.config.notification_gate_for(camera_id)
        {
            // No detection fired during the live phase, so captioning never
            // launched; run it synchronously as a fallback.
            let primary = select_primary_class(unique_classes);
            match VisionClient::new(self.config.captioning.clone()).and_then(|client| {
                client.analyze(snapshot_path.expect("checked above"), camera_id, &primary)
            }) {
                Ok(result) => Some(result),
                Err(err) => {
                    error!(camera = camera_id, error = %err, "captioning fallback failed");
                    None
                }
            }
        } else {
            None
        };

        let Some(result) = outcome else {
            return;
        };
        if !result.is_valid {
            return;
        }

        let prefix = self.bus.topic_prefix();
        let base_url = self.config.public_base_url();
        let snapshot_url = snapshot_filename
            .as_ref()
            .map(|name| json!(format!("{base_url}/snapshots/{name}")))
            .unwrap_or(serde_json::Value::Null);
        let recording_url = if recording_filename.is_empty() {
            serde_json::Value::Null
        } else {
            json!(format!("{base_url}/events/{recording_filename}"))
        };

        self.bus.publish(
            &format!("{prefix}/{camera_id}/context"),
            &json!({
                "camera_id": camera_id,
                "timestamp": now_iso8601(),
                "context": result.context,
                "recording_url": recording_url,
                "recording_filename": recording_filename,
                "snapshot_url": snapshot_url,
                "source": "llava",
            })
            .to_string(),
        );
        info!(camera = camera_id, caption = %result.context, "caption published");

        if let Some(store) = &self.store {
            if let Err(err) = store.log_ai_context(
                &state.event_id,
                camera_id,
                &AiContextRecord {
                    context_text: result.context.clone(),
                    detected_classes: unique_classes.to_vec(),
                    source_model: self.config.captioning.model.clone(),
                    prompt_used: result.prompt_used.clone(),
                    response_time_seconds: result.response_time_seconds,
                    is_valid: result.is_valid,
                },
            ) {
                error!(camera = camera_id, error = %err, "caption insert failed");
            }
        }
    }

    /// Remove this event from the active table and park its handle on the
    /// graveyard for a later join.
    fn finish_event(&self, camera_id: &str, event_id: &str) {
        let mut active = self.active.lock().expect("active events poisoned");
        let matches = active
            .get(camera_id)
            .map(|event| {
                event.state.event_id == event_id && !event.state.running.load(Ordering::SeqCst)
            })
            .unwrap_or(false);
        if matches {
            if let Some(mut event) = active.remove(camera_id) {
                if let Some(handle) = event.handle.take() {
                    self.graveyard
                        .lock()
                        .expect("graveyard poisoned")
                        .push(handle);
                }
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Phase {
    Live,
    PostRoll,
}

/// Mutable state for one running event pipeline.
struct EventTask<'a> {
    orchestrator: &'a EventOrchestrator,
    camera_id: &'a str,
    state: &'a EventState,
    prefix: &'a str,
    ring: Arc<FrameRing>,
    engine: Option<Arc<dyn Detector>>,
    recorder: EventRecorder,
    width: i32,
    conf_threshold: f32,
    iou_threshold: f32,
    filter_classes: Vec<String>,
    frame_interval: Duration,
    started: Instant,
    all_detections: Vec<Detection>,
    best_frame: Option<FrameData>,
    best_confidence: f32,
    best_detections: Vec<Detection>,
    early_sent: bool,
    early_snapshot_path: Option<PathBuf>,
    caption_task: Option<thread::JoinHandle<Result<CaptionResult>>>,
    last_written_frame: u64,
    frames_since_detection: u32,
    inference_count: u64,
}

impl EventTask<'_> {
    /// Write + sample loop shared by the live and post-roll phases.
    fn pump(&mut self, phase: Phase) {
        loop {
            if !self.orchestrator.running.load(Ordering::Relaxed) {
                break;
            }
            if self.recorder.max_duration_reached() {
                break;
            }
            match phase {
                Phase::Live => {
                    if self.state.stop_requested.load(Ordering::Relaxed) {
                        break;
                    }
                }
                Phase::PostRoll => {
                    if self.recorder.post_roll_complete() {
                        break;
                    }
                }
            }

            let Some(frame) = self.ring.latest() else {
                thread::sleep(FRAME_POLL_WAIT);
                continue;
            };
            // A stale or mismatched frame (camera reconnecting) is skipped,
            // not re-written.
            if frame.width != self.width || frame.frame_number == self.last_written_frame {
                drop(frame);
                thread::sleep(FRAME_POLL_WAIT);
                continue;
            }

            self.recorder.write_frame(&frame);
            self.last_written_frame = frame.frame_number;
            self.frames_since_detection += 1;

            if self.frames_since_detection >= DETECTION_SAMPLE_INTERVAL {
                self.frames_since_detection = 0;
                self.sample_detection(&frame);
            }

            // Return the pool handle before pacing the loop.
            drop(frame);
            thread::sleep(self.frame_interval);
        }
    }

    fn sample_detection(&mut self, frame: &FrameData) {
        let Some(engine) = self.engine.as_ref().filter(|e| e.is_loaded()) else {
            return;
        };

        let inference_start = Instant::now();
        let detections = engine.detect(
            frame,
            self.conf_threshold,
            self.iou_threshold,
            &self.filter_classes,
        );
        self.inference_count += 1;

        if self.inference_count <= 3 || !detections.is_empty() {
            info!(
                camera = self.camera_id,
                inference = self.inference_count,
                ms = inference_start.elapsed().as_millis() as u64,
                count = detections.len(),
                "event inference"
            );
        }

        for det in &detections {
            if det.confidence > self.best_confidence {
                self.best_confidence = det.confidence;
                self.best_frame = Some(frame.deep_copy());
                self.best_detections = detections.clone();
            }
        }
        self.all_detections.extend(detections.iter().cloned());

        if !detections.is_empty() && !self.early_sent {
            self.early_notify(&detections);
        }
    }

    /// First-detection branch: early result, sensor ON, early snapshot, and
    /// the parallel captioning launch.
    fn early_notify(&mut self, detections: &[Detection]) {
        let first_det_ms = self.started.elapsed().as_millis() as u64;
        let early_dets: Vec<serde_json::Value> = detections
            .iter()
            .map(|d| json!({"class": d.class_name, "confidence": round3(d.confidence)}))
            .collect();

        let bus = &self.orchestrator.bus;
        bus.publish(
            &format!("{}/{}/result", self.prefix, self.camera_id),
            &json!({
                "camera_id": self.camera_id,
                "timestamp": now_iso8601(),
                "detections": early_dets,
                "detection_count": detections.len(),
                "detected_objects": detections[0].class_name,
                "phase": "early",
            })
            .to_string(),
        );
        bus.publish(&format!("{}/{}/detected", self.prefix, self.camera_id), "ON");
        info!(
            camera = self.camera_id,
            at_ms = first_det_ms,
            class = %detections[0].class_name,
            confidence = detections[0].confidence,
            "early notification sent"
        );
        self.early_sent = true;

        let Some(best_frame) = &self.best_frame else {
            return;
        };
        let snapshots_dir = PathBuf::from(&self.orchestrator.config.timeline.snapshots_dir);
        match save_snapshot(best_frame, &self.best_detections, self.camera_id, &snapshots_dir) {
            Ok(path) => {
                self.early_snapshot_path = Some(path);
                self.maybe_launch_captioning(detections);
            }
            Err(err) => warn!(camera = self.camera_id, error = %err, "early snapshot failed"),
        }
    }

    /// Launch the captioning call in parallel with recording when enabled
    /// and the best detection clears the camera's notification gate.
    fn maybe_launch_captioning(&mut self, detections: &[Detection]) {
        let config = &self.orchestrator.config;
        if !config.captioning.enabled || self.caption_task.is_some() {
            return;
        }
        let gate = config.notification_gate_for(self.camera_id);
        if self.best_confidence < gate {
            return;
        }
        let Some(snapshot_path) = self.early_snapshot_path.clone() else {
            return;
        };

        let classes: Vec<String> = detections.iter().map(|d| d.class_name.clone()).collect();
        let primary = select_primary_class(&classes);
        let captioning = config.captioning.clone();
        let camera = self.camera_id.to_string();
        let primary_for_thread = primary.clone();

        let handle = thread::Builder::new()
            .name(format!("caption-{camera}"))
            .spawn(move || -> Result<CaptionResult> {
                let client = VisionClient::new(captioning)?;
                client.analyze(&snapshot_path, &camera, &primary_for_thread)
            })
            .expect("failed to spawn captioning thread");
        self.caption_task = Some(handle);
        info!(camera = self.camera_id, class = %primary, "captioning launched");
    }
}

/// Time-ordered event id: epoch millis in hex plus a random suffix.
pub fn generate_event_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    format!("{:x}-{:08x}", millis, rand::random::<u32>())
}

fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn round3(value: f32) -> f64 {
    (value as f64 * 1000.0).round() / 1000.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Highest-confidence instance per class, ordered by first appearance.
pub fn dedup_by_class(detections: &[Detection]) -> Vec<Detection> {
    let mut best: Vec<Detection> = Vec::new();
    for det in detections {
        match best.iter_mut().find(|d| d.class_name == det.class_name) {
            Some(existing) => {
                if det.confidence > existing.confidence {
                    *existing = det.clone();
                }
            }
            None => best.push(det.clone()),
        }
    }
    best
}

/// Class names in order of first appearance.
pub fn unique_classes_in_order(detections: &[Detection]) -> Vec<String> {
    let mut classes = Vec::new();
    for det in detections {
        if !classes.contains(&det.class_name) {
            classes.push(det.class_name.clone());
        }
    }
    classes
}

/// Detections per class.
pub fn class_counts(detections: &[Detection]) -> HashMap<String, u64> {
    let mut counts = HashMap::new();
    for det in detections {
        *counts.entry(det.class_name.clone()).or_insert(0) += 1;
    }
    counts
}

/// Human-readable summary: `"Detected a person, a dog and an orange"`.
/// Indefinite article by leading vowel; at most five classes listed.
pub fn detection_message(unique_classes: &[String]) -> String {
    if unique_classes.is_empty() {
        return "No objects detected".to_string();
    }

    let items: Vec<String> = unique_classes
        .iter()
        .take(5)
        .map(|class| {
            let article = match class.chars().next() {
                Some('a' | 'e' | 'i' | 'o' | 'u') => "an",
                _ => "a",
            };
            format!("{article} {class}")
        })
        .collect();

    let mut message = String::from("Detected ");
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            message.push_str(if i == items.len() - 1 { " and " } else { ", " });
        }
        message.push_str(item);
    }
    message
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use camwatch_ingest::FramePool;

    use super::*;
    use crate::config::{AppConfig, CameraConfig};

    /// Bus double that records every publish.
    struct RecordingBus {
        prefix: String,
        messages: StdMutex<Vec<(String, String)>>,
    }

    impl RecordingBus {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                prefix: "test".into(),
                messages: StdMutex::new(Vec::new()),
            })
        }

        fn topics(&self) -> Vec<String> {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .map(|(topic, _)| topic.clone())
                .collect()
        }

        fn payloads_for(&self, topic: &str) -> Vec<String> {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .filter(|(t, _)| t == topic)
                .map(|(_, payload)| payload.clone())
                .collect()
        }
    }

    impl EventBus for RecordingBus {
        fn publish(&self, topic: &str, payload: &str) {
            self.messages
                .lock()
                .unwrap()
                .push((topic.to_string(), payload.to_string()));
        }

        fn topic_prefix(&self) -> &str {
            &self.prefix
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    fn det(class: &str, class_id: usize, confidence: f32) -> Detection {
        Detection {
            class_id,
            class_name: class.into(),
            confidence,
            x1: 1.0,
            y1: 2.0,
            x2: 30.0,
            y2: 40.0,
        }
    }

    fn test_config(camera_ids: &[&str]) -> Arc<AppConfig> {
        let mut config = AppConfig::default();
        config.buffer.preroll_seconds = 1;
        config.buffer.fps = 5;
        for id in camera_ids {
            config.cameras.insert(
                id.to_string(),
                CameraConfig {
                    name: id.to_string(),
                    rtsp_url: format!("rtsp://127.0.0.1:1/{id}"),
                    ..CameraConfig::default()
                },
            );
        }
        config.timeline.events_dir = "/tmp/camwatch-test-events".into();
        config.timeline.snapshots_dir = "/tmp/camwatch-test-snapshots".into();
        Arc::new(config)
    }

    fn orchestrator_for(
        camera_ids: &[&str],
        bus: Arc<RecordingBus>,
    ) -> (Arc<EventOrchestrator>, Arc<BufferService>) {
        let config = test_config(camera_ids);
        let buffers = Arc::new(BufferService::new(Arc::clone(&config)));
        let orchestrator =
            EventOrchestrator::new(Arc::clone(&buffers), bus, None, config);
        (orchestrator, buffers)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(condition(), "condition not reached before timeout");
    }

    #[test]
    fn message_uses_indefinite_articles() {
        let classes: Vec<String> = vec!["person".into(), "orange".into(), "dog".into()];
        assert_eq!(
            detection_message(&classes),
            "Detected a person, an orange and a dog"
        );
    }

    #[test]
    fn message_single_class_has_no_joiner() {
        assert_eq!(
            detection_message(&["elephant".to_string()]),
            "Detected an elephant"
        );
    }

    #[test]
    fn message_caps_at_five_classes() {
        let classes: Vec<String> = ["person", "dog", "cat", "car", "bench", "boat", "kite"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let message = detection_message(&classes);
        assert!(message.contains("bench"));
        assert!(!message.contains("boat"));
        assert!(!message.contains("kite"));
        assert_eq!(message.matches(", ").count(), 3);
        assert_eq!(message.matches(" and ").count(), 1);
    }

    #[test]
    fn message_empty_reports_nothing_detected() {
        assert_eq!(detection_message(&[]), "No objects detected");
    }

    #[test]
    fn dedup_keeps_highest_confidence_per_class() {
        let dets = vec![
            det("person", 0, 0.6),
            det("dog", 16, 0.9),
            det("person", 0, 0.8),
            det("person", 0, 0.7),
        ];
        let deduped = dedup_by_class(&dets);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].class_name, "person");
        assert!((deduped[0].confidence - 0.8).abs() < 1e-6);
        assert_eq!(deduped[1].class_name, "dog");
    }

    #[test]
    fn class_counts_and_unique_order() {
        let dets = vec![
            det("dog", 16, 0.9),
            det("person", 0, 0.6),
            det("dog", 16, 0.8),
        ];
        assert_eq!(unique_classes_in_order(&dets), vec!["dog", "person"]);
        let counts = class_counts(&dets);
        assert_eq!(counts["dog"], 2);
        assert_eq!(counts["person"], 1);
    }

    #[test]
    fn event_id_is_time_ordered_hex() {
        let id = generate_event_id();
        let (millis, suffix) = id.split_once('-').expect("missing separator");
        assert!(u64::from_str_radix(millis, 16).is_ok());
        assert_eq!(suffix.len(), 8);
        assert!(u32::from_str_radix(suffix, 16).is_ok());
    }

    #[test]
    fn duplicate_start_is_ignored_while_active() {
        let bus = RecordingBus::new();
        let (orchestrator, _buffers) = orchestrator_for(&["front"], Arc::clone(&bus));

        // Pin an active entry so the dispatch decision is deterministic.
        orchestrator.active.lock().unwrap().insert(
            "front".into(),
            ActiveEvent {
                state: Arc::new(EventState {
                    event_id: "pinned".into(),
                    stop_requested: AtomicBool::new(false),
                    running: AtomicBool::new(true),
                }),
                handle: None,
            },
        );

        orchestrator.on_motion_start("front", 5);
        assert_eq!(orchestrator.active_event_count(), 1);
        // The ignored start publishes nothing.
        assert!(bus.topics().is_empty());

        orchestrator.active.lock().unwrap().clear();
    }

    #[test]
    fn motion_stop_sets_the_flag_for_the_active_event() {
        let bus = RecordingBus::new();
        let (orchestrator, _buffers) = orchestrator_for(&["front"], bus);

        let state = Arc::new(EventState {
            event_id: "pinned".into(),
            stop_requested: AtomicBool::new(false),
            running: AtomicBool::new(true),
        });
        orchestrator.active.lock().unwrap().insert(
            "front".into(),
            ActiveEvent {
                state: Arc::clone(&state),
                handle: None,
            },
        );

        orchestrator.on_motion_stop("front");
        assert!(state.stop_requested.load(Ordering::SeqCst));
        // Stop for an unknown camera is a no-op.
        orchestrator.on_motion_stop("elsewhere");

        orchestrator.active.lock().unwrap().clear();
    }

    #[test]
    fn event_without_frames_aborts_after_announcing() {
        let bus = RecordingBus::new();
        let (orchestrator, _buffers) = orchestrator_for(&["front"], Arc::clone(&bus));

        orchestrator.on_motion_start("front", 1);
        wait_until(|| orchestrator.active_event_count() == 0);

        let topics = bus.topics();
        assert_eq!(topics, vec!["test/front/detection".to_string()]);
        let payloads = bus.payloads_for("test/front/detection");
        assert!(payloads[0].contains("\"started\""));
        // No completion message for an aborted event.
        assert!(!payloads.iter().any(|p| p.contains("completed")));

        orchestrator.stop();
    }

    #[test]
    fn event_for_unknown_camera_aborts() {
        let bus = RecordingBus::new();
        let (orchestrator, _buffers) = orchestrator_for(&["front"], Arc::clone(&bus));

        orchestrator.on_motion_start("ghost", 1);
        wait_until(|| orchestrator.active_event_count() == 0);
        orchestrator.stop();

        // Announced, then aborted at the buffer lookup.
        assert_eq!(bus.topics(), vec!["test/ghost/detection".to_string()]);
    }

    #[test]
    fn distinct_cameras_run_concurrent_events() {
        let bus = RecordingBus::new();
        let (orchestrator, _buffers) = orchestrator_for(&["a", "b"], Arc::clone(&bus));

        orchestrator.on_motion_start("a", 1);
        orchestrator.on_motion_start("b", 1);
        wait_until(|| orchestrator.active_event_count() == 0);
        orchestrator.stop();

        let topics = bus.topics();
        assert!(topics.contains(&"test/a/detection".to_string()));
        assert!(topics.contains(&"test/b/detection".to_string()));
    }

    #[test]
    fn stop_joins_graveyard_handles() {
        let bus = RecordingBus::new();
        let (orchestrator, _buffers) = orchestrator_for(&["front"], bus);

        orchestrator.on_motion_start("front", 1);
        wait_until(|| orchestrator.active_event_count() == 0);
        orchestrator.stop();
        assert!(orchestrator.graveyard.lock().unwrap().is_empty());
    }

    #[test]
    fn bus_dispatch_parses_motion_payloads() {
        let bus = RecordingBus::new();
        let (orchestrator, _buffers) = orchestrator_for(&["front"], Arc::clone(&bus));

        orchestrator.handle_bus_message(MOTION_START_TOPIC, r#"{"camera_id":"front"}"#);
        wait_until(|| orchestrator.active_event_count() == 0);
        orchestrator.stop();
        assert!(bus.topics().contains(&"test/front/detection".to_string()));
    }

    #[test]
    fn bus_dispatch_rejects_garbage() {
        let bus = RecordingBus::new();
        let (orchestrator, _buffers) = orchestrator_for(&["front"], Arc::clone(&bus));

        orchestrator.handle_bus_message(MOTION_START_TOPIC, "not json");
        orchestrator.handle_bus_message(MOTION_START_TOPIC, r#"{"post_roll_seconds": 5}"#);
        assert_eq!(orchestrator.active_event_count(), 0);
        assert!(bus.topics().is_empty());
    }

    #[test]
    fn preroll_deep_copy_releases_pool_handles() {
        // Mirrors the event task's preroll copy: after the copy the pool
        // must be fully recovered.
        let pool = FramePool::new(4);
        let ring = FrameRing::new(4);
        for n in 1..=4 {
            let mut frame = pool.acquire().unwrap();
            frame.resize(4, 4);
            frame.frame_number = n;
            ring.push(Arc::new(frame));
        }

        let copies: Vec<FrameData> = {
            let held = ring.snapshot();
            held.iter().map(|f| f.deep_copy()).collect()
        };
        assert_eq!(copies.len(), 4);
        ring.clear();
        assert_eq!(pool.available(), 4);
        assert_eq!(copies[0].frame_number, 1);
    }
}
