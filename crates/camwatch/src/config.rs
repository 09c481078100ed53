//! YAML configuration for the service.
//!
//! The configuration is loaded once at startup and treated as read-only for
//! the lifetime of the process; hot reload is deliberately unsupported.

use std::{collections::HashMap, fs, path::Path};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Camera id → camera settings.
    pub cameras: HashMap<String, CameraConfig>,
    pub buffer: BufferConfig,
    pub detection: DetectionConfig,
    pub timeline: TimelineConfig,
    pub mqtt: MqttConfig,
    pub database: DatabaseConfig,
    pub captioning: CaptioningConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub name: String,
    pub rtsp_url: String,
    pub enabled: bool,
    /// Per-camera class filter; empty falls back to the global filter.
    pub classes: Vec<String>,
    /// Per-camera confidence override; 0 falls back to the global threshold.
    pub confidence_threshold: f32,
    /// Gate for launching captioning from the early-notification branch.
    pub immediate_notification_confidence: f32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            rtsp_url: String::new(),
            enabled: true,
            classes: Vec::new(),
            confidence_threshold: 0.0,
            immediate_notification_confidence: 0.70,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Seconds of pre-roll retained per camera.
    pub preroll_seconds: u32,
    /// Nominal stream rate used to size rings and pace recordings.
    pub fps: u32,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            preroll_seconds: 5,
            fps: 15,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub model_path: String,
    /// Square model input edge.
    pub input_size: i32,
    pub num_classes: usize,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    /// Global class filter; empty means all classes.
    pub classes: Vec<String>,
    /// Run continuous per-camera workers in addition to event sampling.
    pub continuous: bool,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            model_path: String::new(),
            input_size: 640,
            num_classes: 80,
            confidence_threshold: 0.5,
            iou_threshold: 0.45,
            classes: Vec::new(),
            continuous: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TimelineConfig {
    pub events_dir: String,
    pub snapshots_dir: String,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            events_dir: "data/events".into(),
            snapshots_dir: "data/snapshots".into(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub topic_prefix: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "localhost".into(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            topic_prefix: "camwatch".into(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub enabled: bool,
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "data/camwatch.db".into(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CaptioningConfig {
    pub enabled: bool,
    /// Base URL of the captioning service, e.g. `http://localhost:11434`.
    pub endpoint: String,
    pub model: String,
    pub timeout_seconds: u64,
    pub max_words: u32,
    pub default_prompt: String,
    /// Camera id (or `default`) → prompt template. Templates may use
    /// `{max_words}` and `{class}` placeholders.
    pub prompts: HashMap<String, String>,
}

impl Default for CaptioningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "http://localhost:11434".into(),
            model: "llava".into(),
            timeout_seconds: 30,
            max_words: 25,
            default_prompt: "Describe the {class} in this camera image in at most {max_words} words.".into(),
            prompts: HashMap::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: AppConfig = serde_yaml::from_str(raw)?;
        Ok(config)
    }

    /// Effective confidence threshold for a camera.
    pub fn confidence_for(&self, camera_id: &str) -> f32 {
        match self.cameras.get(camera_id) {
            Some(cam) if cam.confidence_threshold > 0.0 => cam.confidence_threshold,
            _ => self.detection.confidence_threshold,
        }
    }

    /// Effective class filter for a camera.
    pub fn classes_for(&self, camera_id: &str) -> Vec<String> {
        match self.cameras.get(camera_id) {
            Some(cam) if !cam.classes.is_empty() => cam.classes.clone(),
            _ => self.detection.classes.clone(),
        }
    }

    /// Captioning launch gate for a camera (default 0.70).
    pub fn notification_gate_for(&self, camera_id: &str) -> f32 {
        self.cameras
            .get(camera_id)
            .map(|cam| cam.immediate_notification_confidence)
            .unwrap_or(0.70)
    }

    /// Base URL under which recordings and snapshots are served.
    pub fn public_base_url(&self) -> String {
        format!("http://{}:{}", self.api.host, self.api.port)
    }
}
