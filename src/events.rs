//! Security-event collaborator.
//!
//! The monitor hands every throttled intrusion to an `EventSink`. The SQLite
//! log is the on-box record; the in-memory log backs tests and dry runs.

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::geometry::{BoundingBox, Point};

pub const EVENT_TYPE_INTRUSION: &str = "intrusion";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub camera_id: String,
    pub event_type: String,
    pub description: String,
    pub zone_id: String,
    pub label: String,
    pub confidence: f64,
    pub bounding_box: BoundingBox,
    pub center: Point,
    pub timestamp_ms: u64,
}

impl SecurityEvent {
    pub fn intrusion(
        camera_id: &str,
        zone_id: &str,
        zone_name: &str,
        label: &str,
        confidence: f64,
        bounding_box: BoundingBox,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            event_type: EVENT_TYPE_INTRUSION.to_string(),
            description: format!("Intrusion detected in zone \"{}\" ({})", zone_name, label),
            zone_id: zone_id.to_string(),
            label: label.to_string(),
            confidence,
            center: bounding_box.center(),
            bounding_box,
            timestamp_ms,
        }
    }
}

pub trait EventSink {
    fn create_event(&mut self, event: &SecurityEvent) -> Result<()>;
}

pub struct SqliteEventLog {
    conn: Connection,
}

impl SqliteEventLog {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let mut log = Self { conn };
        log.ensure_schema()?;
        Ok(log)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS security_events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              created_at INTEGER NOT NULL,
              camera_id TEXT NOT NULL,
              event_type TEXT NOT NULL,
              payload_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_security_events_camera
              ON security_events(camera_id, created_at);
            "#,
        )?;
        Ok(())
    }

    /// Most recent events for `camera_id`, newest first.
    pub fn recent(&mut self, camera_id: &str, limit: usize) -> Result<Vec<SecurityEvent>> {
        let limit = i64::try_from(limit).map_err(|_| anyhow!("limit exceeds i64 range"))?;
        let mut stmt = self.conn.prepare(
            "SELECT payload_json FROM security_events WHERE camera_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![camera_id, limit], |row| row.get::<_, String>(0))?;
        let mut events = Vec::new();
        for payload in rows {
            events.push(serde_json::from_str(&payload?)?);
        }
        Ok(events)
    }
}

impl EventSink for SqliteEventLog {
    fn create_event(&mut self, event: &SecurityEvent) -> Result<()> {
        let created_at = i64::try_from(event.timestamp_ms)
            .map_err(|_| anyhow!("event timestamp exceeds i64 range"))?;
        let payload_json = serde_json::to_string(event)?;
        self.conn.execute(
            r#"
            INSERT INTO security_events(created_at, camera_id, event_type, payload_json)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![created_at, event.camera_id, event.event_type, payload_json],
        )?;
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryEventLog {
    pub events: Vec<SecurityEvent>,
    /// When set, every `create_event` fails with this message.
    pub fail_with: Option<String>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventSink for InMemoryEventLog {
    fn create_event(&mut self, event: &SecurityEvent) -> Result<()> {
        if let Some(reason) = &self.fail_with {
            return Err(anyhow!("event log unavailable: {}", reason));
        }
        self.events.push(event.clone());
        Ok(())
    }
}
