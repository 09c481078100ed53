//! SQLite persistence for events, detections, and captioning context.
//!
//! Every write is best-effort from the caller's perspective: the event
//! pipeline logs failures and moves on.

use std::{path::Path, sync::Mutex};

use anyhow::{Context, Result};
use camwatch_detect::Detection;
use rusqlite::{Connection, params};
use tracing::debug;

/// Captioning outcome persisted alongside an event.
pub struct AiContextRecord {
    pub context_text: String,
    pub detected_classes: Vec<String>,
    pub source_model: String,
    pub prompt_used: String,
    pub response_time_seconds: f64,
    pub is_valid: bool,
}

pub struct EventStore {
    conn: Mutex<Connection>,
}

impl EventStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("creating database directory {}", dir.display()))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening database {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS detection_events (
                event_id TEXT PRIMARY KEY,
                camera_id TEXT NOT NULL,
                camera_name TEXT NOT NULL,
                started_at TEXT NOT NULL DEFAULT (datetime('now')),
                ended_at TEXT,
                status TEXT NOT NULL,
                duration_seconds REAL,
                frames_processed INTEGER,
                total_detections INTEGER,
                recording_filename TEXT,
                snapshot_filename TEXT
            );
            CREATE TABLE IF NOT EXISTS detections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT NOT NULL REFERENCES detection_events(event_id),
                class_name TEXT NOT NULL,
                confidence REAL NOT NULL,
                bbox_x1 INTEGER NOT NULL,
                bbox_y1 INTEGER NOT NULL,
                bbox_x2 INTEGER NOT NULL,
                bbox_y2 INTEGER NOT NULL,
                detected_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE TABLE IF NOT EXISTS ai_vision_context (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT NOT NULL,
                camera_id TEXT NOT NULL,
                context_text TEXT NOT NULL,
                source_model TEXT NOT NULL,
                prompt_used TEXT NOT NULL,
                detected_classes TEXT NOT NULL,
                response_time_seconds REAL NOT NULL,
                is_valid INTEGER NOT NULL,
                analyzed_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            "#,
        )
        .context("creating schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a new event row with status `recording`.
    pub fn create_event(
        &self,
        event_id: &str,
        camera_id: &str,
        camera_name: &str,
        recording_filename: &str,
        snapshot_filename: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO detection_events
                 (event_id, camera_id, camera_name, status, recording_filename, snapshot_filename)
             VALUES (?1, ?2, ?3, 'recording', ?4, ?5)",
            params![event_id, camera_id, camera_name, recording_filename, snapshot_filename],
        )?;
        debug!(event = event_id, camera = camera_id, "event row created");
        Ok(())
    }

    /// One row per deduplicated detection.
    pub fn log_detections(&self, event_id: &str, detections: &[Detection]) -> Result<()> {
        if detections.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;
        for det in detections {
            tx.execute(
                "INSERT INTO detections
                     (event_id, class_name, confidence, bbox_x1, bbox_y1, bbox_x2, bbox_y2)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    event_id,
                    det.class_name,
                    det.confidence as f64,
                    det.x1 as i64,
                    det.y1 as i64,
                    det.x2 as i64,
                    det.y2 as i64,
                ],
            )?;
        }
        tx.commit()?;
        debug!(event = event_id, count = detections.len(), "detections logged");
        Ok(())
    }

    /// Mark an event completed with its final numbers.
    pub fn complete_event(
        &self,
        event_id: &str,
        duration_seconds: f64,
        frames_processed: u64,
        detections_count: usize,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "UPDATE detection_events
             SET ended_at = datetime('now'),
                 duration_seconds = ?2,
                 frames_processed = ?3,
                 total_detections = ?4,
                 status = 'completed'
             WHERE event_id = ?1",
            params![
                event_id,
                duration_seconds,
                frames_processed as i64,
                detections_count as i64
            ],
        )?;
        Ok(())
    }

    pub fn log_ai_context(
        &self,
        event_id: &str,
        camera_id: &str,
        record: &AiContextRecord,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO ai_vision_context
                 (event_id, camera_id, context_text, source_model, prompt_used,
                  detected_classes, response_time_seconds, is_valid)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event_id,
                camera_id,
                record.context_text,
                record.source_model,
                record.prompt_used,
                record.detected_classes.join(","),
                record.response_time_seconds,
                record.is_valid,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person() -> Detection {
        Detection {
            class_id: 0,
            class_name: "person".into(),
            confidence: 0.91,
            x1: 10.0,
            y1: 20.0,
            x2: 110.0,
            y2: 220.0,
        }
    }

    #[test]
    fn event_lifecycle_roundtrip() {
        let store = EventStore::open_in_memory().unwrap();
        store
            .create_event("ev-1", "front", "Front Door", "front_x.mp4", "front_x.jpg")
            .unwrap();
        store.log_detections("ev-1", &[person()]).unwrap();
        store.complete_event("ev-1", 12.5, 180, 7).unwrap();

        let conn = store.conn.lock().unwrap();
        let (status, duration, total): (String, f64, i64) = conn
            .query_row(
                "SELECT status, duration_seconds, total_detections
                 FROM detection_events WHERE event_id = 'ev-1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(status, "completed");
        assert!((duration - 12.5).abs() < 1e-9);
        assert_eq!(total, 7);

        let det_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM detections WHERE event_id = 'ev-1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(det_count, 1);
    }

    #[test]
    fn empty_detection_batch_is_a_noop() {
        let store = EventStore::open_in_memory().unwrap();
        store.log_detections("ev-none", &[]).unwrap();
        let conn = store.conn.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM detections", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn ai_context_row_persists_classes() {
        let store = EventStore::open_in_memory().unwrap();
        store
            .log_ai_context(
                "ev-2",
                "front",
                &AiContextRecord {
                    context_text: "A person is standing at the door.".into(),
                    detected_classes: vec!["person".into(), "package".into()],
                    source_model: "llava".into(),
                    prompt_used: "Describe...".into(),
                    response_time_seconds: 3.2,
                    is_valid: true,
                },
            )
            .unwrap();

        let conn = store.conn.lock().unwrap();
        let (classes, valid): (String, bool) = conn
            .query_row(
                "SELECT detected_classes, is_valid FROM ai_vision_context WHERE event_id = 'ev-2'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(classes, "person,package");
        assert!(valid);
    }
}
