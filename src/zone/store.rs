use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;

use super::payload::{StoredZone, ZonePayload};
use super::{Zone, ZoneError};
use crate::geometry::FrameSize;

/// Zone persistence collaborator. Payloads are kept as raw JSON so that
/// whatever historical shape is on disk reaches `StoredZone::parse` intact.
pub trait ZoneStore {
    fn save(&mut self, camera_id: &str, payload: &ZonePayload) -> Result<()>;

    fn load(&mut self, camera_id: &str) -> Result<Option<Value>>;

    fn delete(&mut self, camera_id: &str) -> Result<bool>;
}

/// Validate and persist `zone` as it appears on `surface` now.
///
/// A zone below `min_area_px2` (measured on `surface`) is refused with
/// `ZoneError::ValidationFailed`; nothing is written in that case.
pub fn save_zone(
    store: &mut dyn ZoneStore,
    camera_id: &str,
    zone: &Zone,
    surface: FrameSize,
    min_area_px2: f64,
) -> Result<ZonePayload> {
    crate::validate_camera_id(camera_id)?;
    if !surface.is_usable() {
        return Err(anyhow!(
            "cannot save zone {}: surface size {}x{} is not usable",
            zone.id(),
            surface.width,
            surface.height
        ));
    }
    let validation = zone.validate_area(Some(surface), min_area_px2);
    if !validation.valid {
        return Err(ZoneError::ValidationFailed(validation.message).into());
    }
    let payload = ZonePayload::capture(zone, surface);
    store.save(camera_id, &payload)?;
    log::info!(
        "zone {} saved for {} ({} points, reference {}x{})",
        zone.id(),
        camera_id,
        payload.points.len(),
        surface.width,
        surface.height
    );
    Ok(payload)
}

/// Load the configured zone for `camera_id`, if any.
pub fn load_zone(store: &mut dyn ZoneStore, camera_id: &str) -> Result<Option<Zone>> {
    crate::validate_camera_id(camera_id)?;
    let Some(value) = store.load(camera_id)? else {
        return Ok(None);
    };
    let Some(stored) = StoredZone::parse(&value) else {
        return Ok(None);
    };
    Ok(Some(stored.into_zone(&fallback_zone_id(camera_id))?))
}

/// `camera:front_door` -> `zone:front_door`.
pub fn fallback_zone_id(camera_id: &str) -> String {
    let suffix = camera_id.strip_prefix("camera:").unwrap_or(camera_id);
    format!("zone:{}", suffix)
}

pub struct SqliteZoneStore {
    conn: Connection,
}

impl SqliteZoneStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS camera_zones (
              camera_id TEXT PRIMARY KEY,
              updated_at INTEGER NOT NULL,
              payload_json TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

impl ZoneStore for SqliteZoneStore {
    fn save(&mut self, camera_id: &str, payload: &ZonePayload) -> Result<()> {
        let payload_json = serde_json::to_string(payload)?;
        let updated_at = i64::try_from(crate::now_ms()?)
            .map_err(|_| anyhow!("timestamp exceeds i64 range"))?;
        self.conn.execute(
            r#"
            INSERT INTO camera_zones(camera_id, updated_at, payload_json)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(camera_id) DO UPDATE SET
              updated_at = excluded.updated_at,
              payload_json = excluded.payload_json
            "#,
            params![camera_id, updated_at, payload_json],
        )?;
        Ok(())
    }

    fn load(&mut self, camera_id: &str) -> Result<Option<Value>> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload_json FROM camera_zones WHERE camera_id = ?1",
                params![camera_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(json) = payload else {
            return Ok(None);
        };
        match serde_json::from_str(&json) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                log::warn!(
                    "zone payload for {} is not valid JSON ({}); treating as unconfigured",
                    camera_id,
                    err
                );
                Ok(None)
            }
        }
    }

    fn delete(&mut self, camera_id: &str) -> Result<bool> {
        let removed = self.conn.execute(
            "DELETE FROM camera_zones WHERE camera_id = ?1",
            params![camera_id],
        )?;
        Ok(removed > 0)
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryZoneStore {
    payloads: HashMap<String, Value>,
}

impl InMemoryZoneStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a raw payload, e.g. one of the legacy encodings.
    pub fn insert_raw(&mut self, camera_id: &str, value: Value) {
        self.payloads.insert(camera_id.to_string(), value);
    }
}

impl ZoneStore for InMemoryZoneStore {
    fn save(&mut self, camera_id: &str, payload: &ZonePayload) -> Result<()> {
        self.payloads
            .insert(camera_id.to_string(), serde_json::to_value(payload)?);
        Ok(())
    }

    fn load(&mut self, camera_id: &str) -> Result<Option<Value>> {
        Ok(self.payloads.get(camera_id).cloned())
    }

    fn delete(&mut self, camera_id: &str) -> Result<bool> {
        Ok(self.payloads.remove(camera_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Point;
    use serde_json::json;

    fn zone() -> Zone {
        Zone::new(
            "zone:gate",
            "Gate",
            vec![
                Point::new(10.0, 10.0),
                Point::new(10.0, 100.0),
                Point::new(100.0, 100.0),
                Point::new(100.0, 10.0),
            ],
            Some(FrameSize::new(800.0, 600.0)),
        )
        .unwrap()
    }

    #[test]
    fn save_then_load_round_trips() -> Result<()> {
        let mut store = InMemoryZoneStore::new();
        let surface = FrameSize::new(800.0, 600.0);
        save_zone(&mut store, "camera:front", &zone(), surface, 1000.0)?;
        let loaded = load_zone(&mut store, "camera:front")?.unwrap();
        assert_eq!(loaded.points(), zone().points());
        assert_eq!(loaded.reference(), Some(surface));
        Ok(())
    }

    #[test]
    fn undersized_zone_is_refused_with_reason() {
        let mut store = InMemoryZoneStore::new();
        let err = save_zone(
            &mut store,
            "camera:front",
            &zone(),
            FrameSize::new(80.0, 60.0),
            1000.0,
        )
        .unwrap_err();
        let zone_err = err.downcast_ref::<ZoneError>().unwrap();
        assert!(matches!(zone_err, ZoneError::ValidationFailed(msg) if msg.contains("81")));
        assert!(store.load("camera:front").unwrap().is_none());
    }

    #[test]
    fn legacy_multi_zone_payload_loads_with_fallback_id() -> Result<()> {
        let mut store = InMemoryZoneStore::new();
        store.insert_raw(
            "camera:lobby",
            json!({
                "zones": [{"points": [{"x": 0, "y": 0}, {"x": 0, "y": 40}, {"x": 40, "y": 0}]}],
                "referenceWidth": 640,
                "referenceHeight": 480
            }),
        );
        let loaded = load_zone(&mut store, "camera:lobby")?.unwrap();
        assert_eq!(loaded.id(), "zone:lobby");
        assert_eq!(loaded.reference(), Some(FrameSize::new(640.0, 480.0)));
        Ok(())
    }

    #[test]
    fn unknown_camera_has_no_zone() -> Result<()> {
        let mut store = InMemoryZoneStore::new();
        assert!(load_zone(&mut store, "camera:none")?.is_none());
        Ok(())
    }

    #[test]
    fn sqlite_store_upserts_and_deletes() -> Result<()> {
        let mut store = SqliteZoneStore::open(":memory:")?;
        let surface = FrameSize::new(800.0, 600.0);
        save_zone(&mut store, "camera:front", &zone(), surface, 1000.0)?;
        save_zone(
            &mut store,
            "camera:front",
            &zone(),
            FrameSize::new(400.0, 300.0),
            1000.0,
        )?;
        let loaded = load_zone(&mut store, "camera:front")?.unwrap();
        assert_eq!(loaded.reference(), Some(FrameSize::new(400.0, 300.0)));
        assert_eq!(loaded.points()[2], Point::new(50.0, 50.0));
        assert!(store.delete("camera:front")?);
        assert!(load_zone(&mut store, "camera:front")?.is_none());
        Ok(())
    }

    #[test]
    fn corrupt_sqlite_payload_reads_as_unconfigured() -> Result<()> {
        let mut store = SqliteZoneStore::open(":memory:")?;
        store.conn.execute(
            "INSERT INTO camera_zones(camera_id, updated_at, payload_json) VALUES (?1, 0, ?2)",
            params!["camera:front", "{\"points\": [{\"x\": 1,"],
        )?;
        assert!(store.load("camera:front")?.is_none());
        assert!(load_zone(&mut store, "camera:front")?.is_none());

        // A fresh save replaces the broken row.
        save_zone(
            &mut store,
            "camera:front",
            &zone(),
            FrameSize::new(800.0, 600.0),
            1000.0,
        )?;
        assert!(load_zone(&mut store, "camera:front")?.is_some());
        Ok(())
    }
}
