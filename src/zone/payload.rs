//! Zone payloads as exchanged with the persistence collaborator.
//!
//! Writes always use the single-zone shape:
//!
//! ```json
//! {"id": "zone:gate", "name": "Gate", "points": [{"x": 1, "y": 2}, ...],
//!  "referenceWidth": 800, "referenceHeight": 600, "active": true,
//!  "color": "#ef4444", "fillColor": "rgba(239, 68, 68, 0.2)"}
//! ```
//!
//! Reads also accept the historical multi-zone container
//! `{"zones": [{"points": [...]}, ...], "referenceWidth": .., "referenceHeight": ..}`.
//! Both shapes collapse into one `StoredZone` here, at the boundary, so the
//! rest of the crate only ever sees `Zone`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Zone, ZoneError, DEFAULT_ZONE_COLOR, DEFAULT_ZONE_FILL, MIN_ZONE_POINTS};
use crate::geometry::{FrameSize, Point};

const DEFAULT_ZONE_NAME: &str = "Protected area";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZonePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub points: Vec<Point>,
    #[serde(default, alias = "reference_width")]
    pub reference_width: Option<f64>,
    #[serde(default, alias = "reference_height")]
    pub reference_height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, alias = "fill_color", skip_serializing_if = "Option::is_none")]
    pub fill_color: Option<String>,
}

impl ZonePayload {
    /// Serialise `zone` as it appears on `surface` right now.
    ///
    /// The points are normalised onto `surface` and `surface` becomes the
    /// reference size, so the saved polygon always agrees with the size saved
    /// next to it.
    pub fn capture(zone: &Zone, surface: FrameSize) -> Self {
        Self {
            id: Some(zone.id().to_string()),
            name: Some(zone.name().to_string()),
            points: zone.normalize(surface),
            reference_width: Some(surface.width),
            reference_height: Some(surface.height),
            active: Some(zone.is_active()),
            color: Some(zone.color().to_string()),
            fill_color: Some(zone.fill_color().to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MultiZonePayload {
    zones: Vec<LegacyZoneEntry>,
    #[serde(default, alias = "reference_width")]
    reference_width: Option<f64>,
    #[serde(default, alias = "reference_height")]
    reference_height: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyZoneEntry {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    points: Vec<Point>,
    #[serde(default, alias = "reference_width")]
    reference_width: Option<f64>,
    #[serde(default, alias = "reference_height")]
    reference_height: Option<f64>,
    #[serde(default)]
    active: Option<bool>,
    #[serde(default)]
    color: Option<String>,
    #[serde(default, alias = "fill_color")]
    fill_color: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WirePayload {
    Multi(MultiZonePayload),
    Single(ZonePayload),
}

/// Canonical shape of one persisted zone after parsing either encoding.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredZone {
    pub id: Option<String>,
    pub name: Option<String>,
    pub points: Vec<Point>,
    pub reference: Option<FrameSize>,
    pub active: bool,
    pub color: Option<String>,
    pub fill_color: Option<String>,
}

impl StoredZone {
    /// Parse a stored payload. Returns `None` when neither historical shape
    /// yields a usable point list; that means "no zone configured".
    pub fn parse(value: &Value) -> Option<Self> {
        let wire: WirePayload = match serde_json::from_value(value.clone()) {
            Ok(wire) => wire,
            Err(err) => {
                log::warn!("zone payload matches no known shape: {}", err);
                return None;
            }
        };
        let stored = match wire {
            WirePayload::Single(single) => StoredZone {
                id: single.id,
                name: single.name,
                points: single.points,
                reference: reference_size(single.reference_width, single.reference_height),
                active: single.active.unwrap_or(true),
                color: single.color,
                fill_color: single.fill_color,
            },
            WirePayload::Multi(multi) => {
                let container_ref = reference_size(multi.reference_width, multi.reference_height);
                let entry = multi
                    .zones
                    .into_iter()
                    .find(|entry| entry.points.len() >= MIN_ZONE_POINTS)?;
                StoredZone {
                    id: entry.id,
                    name: entry.name,
                    reference: container_ref
                        .or_else(|| reference_size(entry.reference_width, entry.reference_height)),
                    points: entry.points,
                    active: entry.active.unwrap_or(true),
                    color: entry.color,
                    fill_color: entry.fill_color,
                }
            }
        };
        if stored.points.len() < MIN_ZONE_POINTS {
            log::warn!(
                "stored zone has {} points; treating camera as unconfigured",
                stored.points.len()
            );
            return None;
        }
        Some(stored)
    }

    /// Turn the parsed payload into a `Zone`, using `fallback_id` when the
    /// payload predates zone ids or carries one outside the allowlist.
    pub fn into_zone(self, fallback_id: &str) -> Result<Zone, ZoneError> {
        let id = match self.id {
            Some(id) if crate::validate_zone_id(&id).is_ok() => id,
            _ => fallback_id.to_string(),
        };
        let name = self.name.unwrap_or_else(|| DEFAULT_ZONE_NAME.to_string());
        Ok(Zone::new(id, name, self.points, self.reference)?
            .with_active(self.active)
            .with_colors(
                self.color.unwrap_or_else(|| DEFAULT_ZONE_COLOR.to_string()),
                self.fill_color
                    .unwrap_or_else(|| DEFAULT_ZONE_FILL.to_string()),
            ))
    }
}

fn reference_size(width: Option<f64>, height: Option<f64>) -> Option<FrameSize> {
    match (width, height) {
        (Some(width), Some(height)) => Some(FrameSize::new(width, height)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_single_zone_shape() {
        let value = json!({
            "points": [{"x": 0, "y": 0}, {"x": 0, "y": 100}, {"x": 100, "y": 0}],
            "referenceWidth": 640,
            "referenceHeight": 480
        });
        let stored = StoredZone::parse(&value).unwrap();
        assert_eq!(stored.points.len(), 3);
        assert_eq!(stored.reference, Some(FrameSize::new(640.0, 480.0)));
        assert!(stored.active);
    }

    #[test]
    fn parses_multi_zone_container() {
        let value = json!({
            "zones": [
                {"points": [{"x": 1, "y": 1}]},
                {"points": [{"x": 0, "y": 0}, {"x": 0, "y": 50}, {"x": 50, "y": 50}, {"x": 50, "y": 0}]}
            ],
            "referenceWidth": 800,
            "referenceHeight": 600
        });
        let stored = StoredZone::parse(&value).unwrap();
        assert_eq!(stored.points.len(), 4);
        assert_eq!(stored.reference, Some(FrameSize::new(800.0, 600.0)));
    }

    #[test]
    fn legacy_snake_case_keys_are_accepted() {
        let value = json!({
            "points": [{"x": 0, "y": 0}, {"x": 0, "y": 100}, {"x": 100, "y": 0}],
            "reference_width": 320,
            "reference_height": 240,
            "fill_color": "#ff000020"
        });
        let stored = StoredZone::parse(&value).unwrap();
        assert_eq!(stored.reference, Some(FrameSize::new(320.0, 240.0)));
        assert_eq!(stored.fill_color.as_deref(), Some("#ff000020"));
    }

    #[test]
    fn payload_without_points_means_unconfigured() {
        assert!(StoredZone::parse(&json!({})).is_none());
        assert!(StoredZone::parse(&json!({"zones": []})).is_none());
        assert!(StoredZone::parse(&json!({"points": [{"x": 1, "y": 1}]})).is_none());
        assert!(StoredZone::parse(&Value::Null).is_none());
    }

    #[test]
    fn missing_reference_is_tolerated() {
        let value = json!({
            "points": [{"x": 0, "y": 0}, {"x": 0, "y": 100}, {"x": 100, "y": 0}]
        });
        let zone = StoredZone::parse(&value)
            .unwrap()
            .into_zone("zone:front_door")
            .unwrap();
        assert_eq!(zone.id(), "zone:front_door");
        assert_eq!(zone.reference(), None);
    }

    #[test]
    fn capture_uses_surface_size_at_save_time() {
        let zone = Zone::new(
            "zone:gate",
            "Gate",
            vec![
                Point::new(10.0, 10.0),
                Point::new(10.0, 100.0),
                Point::new(100.0, 100.0),
            ],
            Some(FrameSize::new(400.0, 300.0)),
        )
        .unwrap();
        let payload = ZonePayload::capture(&zone, FrameSize::new(800.0, 600.0));
        assert_eq!(payload.reference_width, Some(800.0));
        assert_eq!(payload.reference_height, Some(600.0));
        assert_eq!(payload.points[1], Point::new(20.0, 200.0));

        let value = serde_json::to_value(&payload).unwrap();
        assert!(value.get("referenceWidth").is_some());
        assert!(value.get("fillColor").is_some());
        let reloaded = StoredZone::parse(&value)
            .unwrap()
            .into_zone("zone:other")
            .unwrap();
        assert_eq!(reloaded.id(), "zone:gate");
        assert_eq!(
            reloaded.normalize(FrameSize::new(400.0, 300.0)),
            zone.points()
        );
    }
}
