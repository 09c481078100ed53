//! Client for the external vision-language captioning service.
//!
//! Sends an annotated snapshot to the service's `/api/generate` endpoint and
//! extracts a short natural-language caption. Responses shorter than 15
//! characters or without a space are treated as invalid.

use std::{fs, path::Path, time::Instant};

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::json;
use tracing::{info, warn};

use crate::config::CaptioningConfig;

/// Connect timeout for the captioning endpoint.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Classes we prefer to name in the caption prompt, most interesting first.
const CLASS_PRIORITY: [&str; 5] = ["person", "dog", "cat", "package", "car"];

#[derive(Clone, Debug)]
pub struct CaptionResult {
    pub context: String,
    pub is_valid: bool,
    pub response_time_seconds: f64,
    pub prompt_used: String,
}

pub struct VisionClient {
    config: CaptioningConfig,
    client: reqwest::blocking::Client,
}

impl VisionClient {
    pub fn new(config: CaptioningConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .connect_timeout(std::time::Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .context("building captioning HTTP client")?;
        Ok(Self { config, client })
    }

    /// Caption a snapshot. Transport and decode failures surface as errors;
    /// a reachable service returning junk yields `is_valid = false`.
    pub fn analyze(
        &self,
        snapshot_path: &Path,
        camera_id: &str,
        detected_class: &str,
    ) -> Result<CaptionResult> {
        let started = Instant::now();
        let image = fs::read(snapshot_path)
            .with_context(|| format!("reading snapshot {}", snapshot_path.display()))?;

        let prompt = self.build_prompt(camera_id, detected_class);
        let body = json!({
            "model": self.config.model,
            "prompt": prompt,
            "images": [BASE64.encode(&image)],
            "stream": false,
        });

        let url = format!("{}/api/generate", self.config.endpoint);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .with_context(|| format!("captioning request to {url}"))?;
        let response_time_seconds = started.elapsed().as_secs_f64();

        if !response.status().is_success() {
            anyhow::bail!(
                "captioning service returned HTTP {} after {:.1}s",
                response.status(),
                response_time_seconds
            );
        }

        let raw = response.text().context("reading captioning response")?;
        let (context, is_valid) = parse_caption(&raw);

        if is_valid {
            info!(
                camera = camera_id,
                model = %self.config.model,
                seconds = format!("{response_time_seconds:.1}"),
                caption = %context,
                "caption received"
            );
        } else {
            warn!(
                camera = camera_id,
                len = context.len(),
                "captioning service returned an invalid caption"
            );
        }

        Ok(CaptionResult {
            context,
            is_valid,
            response_time_seconds,
            prompt_used: prompt,
        })
    }

    /// Resolve the prompt template for a camera and fill its placeholders.
    /// Lookup order: camera key, then `default` key, then the built-in.
    pub fn build_prompt(&self, camera_id: &str, detected_class: &str) -> String {
        let template = self
            .config
            .prompts
            .get(camera_id)
            .or_else(|| self.config.prompts.get("default"))
            .unwrap_or(&self.config.default_prompt);

        template
            .replace("{max_words}", &self.config.max_words.to_string())
            .replace("{class}", detected_class)
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }
}

/// Pick the class to name in the prompt: priority order, then the first
/// detected class, then a generic fallback.
pub fn select_primary_class(classes: &[String]) -> String {
    for preferred in CLASS_PRIORITY {
        if classes.iter().any(|c| c == preferred) {
            return preferred.to_string();
        }
    }
    classes
        .first()
        .cloned()
        .unwrap_or_else(|| "object".to_string())
}

/// Extract and validate the caption from a raw service response.
pub fn parse_caption(raw: &str) -> (String, bool) {
    let context = serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|v| v.get("response").and_then(|r| r.as_str()).map(str::to_string))
        .unwrap_or_default();
    let context = context.trim().to_string();
    let is_valid = context.len() >= 15 && context.contains(' ');
    (context, is_valid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptioningConfig;

    fn client_with(prompts: &[(&str, &str)]) -> VisionClient {
        let mut config = CaptioningConfig {
            max_words: 20,
            ..CaptioningConfig::default()
        };
        for (key, value) in prompts {
            config.prompts.insert(key.to_string(), value.to_string());
        }
        VisionClient::new(config).unwrap()
    }

    #[test]
    fn prompt_lookup_prefers_camera_then_default() {
        let client = client_with(&[
            ("front", "Front sees a {class}, {max_words} words max."),
            ("default", "Default: {class}"),
        ]);
        assert_eq!(
            client.build_prompt("front", "person"),
            "Front sees a person, 20 words max."
        );
        assert_eq!(client.build_prompt("yard", "dog"), "Default: dog");
    }

    #[test]
    fn prompt_falls_back_to_builtin() {
        let client = client_with(&[]);
        let prompt = client.build_prompt("anything", "cat");
        assert!(prompt.contains("cat"));
        assert!(prompt.contains("20"));
        assert!(!prompt.contains("{class}"));
        assert!(!prompt.contains("{max_words}"));
    }

    #[test]
    fn primary_class_follows_priority() {
        let classes = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(
            select_primary_class(&classes(&["car", "dog", "person"])),
            "person"
        );
        assert_eq!(select_primary_class(&classes(&["car", "cat"])), "cat");
        assert_eq!(select_primary_class(&classes(&["bench", "boat"])), "bench");
        assert_eq!(select_primary_class(&[]), "object");
    }

    #[test]
    fn caption_validity_gate() {
        let (text, valid) = parse_caption(r#"{"response": "  A person stands by the door.  "}"#);
        assert_eq!(text, "A person stands by the door.");
        assert!(valid);

        // Too short.
        let (_, valid) = parse_caption(r#"{"response": "A person."}"#);
        assert!(!valid);

        // Long enough but no space.
        let (_, valid) = parse_caption(r#"{"response": "aaaaaaaaaaaaaaaaaaaa"}"#);
        assert!(!valid);

        // Missing field / junk payload.
        let (text, valid) = parse_caption("not json");
        assert!(text.is_empty());
        assert!(!valid);
    }
}
