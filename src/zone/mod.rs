//! Zone model and frame normaliser.
//!
//! A `Zone` is a completed polygon (three or more points) bound to the size of
//! the surface it was authored on. Drafts never become a `Zone` until the
//! editor finishes them, so nothing downstream has to re-check the count.
//!
//! Placing a zone on a surface of a different size always goes through
//! `Zone::normalize`, which yields a derived point list and leaves the stored
//! reference untouched.

use thiserror::Error;

use crate::geometry::{polygon_area, validate_zone_area, AreaValidation, FrameSize, Point};

pub mod payload;
pub mod store;

pub use payload::{StoredZone, ZonePayload};
pub use store::{load_zone, save_zone, InMemoryZoneStore, SqliteZoneStore, ZoneStore};

pub const MIN_ZONE_POINTS: usize = 3;
pub const DEFAULT_ZONE_COLOR: &str = "#ef4444";
pub const DEFAULT_ZONE_FILL: &str = "rgba(239, 68, 68, 0.2)";

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ZoneError {
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    #[error("invalid zone id '{0}'")]
    InvalidId(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Zone {
    id: String,
    name: String,
    points: Vec<Point>,
    reference: Option<FrameSize>,
    active: bool,
    color: String,
    fill_color: String,
}

impl Zone {
    /// Build a completed zone. Rejects fewer than three points, non-finite
    /// coordinates and ids outside the zone id allowlist.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        points: Vec<Point>,
        reference: Option<FrameSize>,
    ) -> Result<Self, ZoneError> {
        let id = id.into();
        if crate::validate_zone_id(&id).is_err() {
            return Err(ZoneError::InvalidId(id));
        }
        check_points(&points)?;
        Ok(Self {
            id,
            name: name.into(),
            points,
            reference,
            active: true,
            color: DEFAULT_ZONE_COLOR.to_string(),
            fill_color: DEFAULT_ZONE_FILL.to_string(),
        })
    }

    pub fn with_colors(mut self, color: impl Into<String>, fill_color: impl Into<String>) -> Self {
        self.color = color.into();
        self.fill_color = fill_color.into();
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// Size of the surface the stored points were authored (or last saved) on.
    pub fn reference(&self) -> Option<FrameSize> {
        self.reference
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn color(&self) -> &str {
        &self.color
    }

    pub fn fill_color(&self) -> &str {
        &self.fill_color
    }

    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Re-edit: replace the whole point list and its reference size together.
    pub fn replace_points(
        &mut self,
        points: Vec<Point>,
        reference: Option<FrameSize>,
    ) -> Result<(), ZoneError> {
        check_points(&points)?;
        self.points = points;
        self.reference = reference;
        Ok(())
    }

    /// Area of the stored polygon in reference-frame square pixels.
    pub fn area(&self) -> f64 {
        polygon_area(&self.points)
    }

    /// Area check against `min_area_px2`, measured on `surface` when given.
    pub fn validate_area(&self, surface: Option<FrameSize>, min_area_px2: f64) -> AreaValidation {
        match surface {
            Some(surface) => validate_zone_area(&self.normalize(surface), min_area_px2),
            None => validate_zone_area(&self.points, min_area_px2),
        }
    }

    /// Points scaled from the reference frame onto `current`.
    ///
    /// A missing or zero reference size yields the stored points unchanged and
    /// a warning; legacy payloads saved without a size still render.
    pub fn normalize(&self, current: FrameSize) -> Vec<Point> {
        match self.reference.and_then(|reference| reference.scale_to(current)) {
            Some((sx, sy)) => self.points.iter().map(|p| p.scaled(sx, sy)).collect(),
            None => {
                log::warn!(
                    "zone {}: reference size {:?} unusable; placing points unscaled",
                    self.id,
                    self.reference
                );
                self.points.clone()
            }
        }
    }
}

fn check_points(points: &[Point]) -> Result<(), ZoneError> {
    if points.len() < MIN_ZONE_POINTS {
        return Err(ZoneError::ValidationFailed(format!(
            "a zone needs at least {} points (got {})",
            MIN_ZONE_POINTS,
            points.len()
        )));
    }
    if points.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
        return Err(ZoneError::ValidationFailed(
            "zone points must be finite numbers".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_zone(reference: Option<FrameSize>) -> Zone {
        Zone::new(
            "zone:test",
            "Gate",
            vec![
                Point::new(10.0, 10.0),
                Point::new(10.0, 100.0),
                Point::new(100.0, 100.0),
                Point::new(100.0, 10.0),
            ],
            reference,
        )
        .unwrap()
    }

    #[test]
    fn normalize_at_reference_size_is_identity() {
        let zone = square_zone(Some(FrameSize::new(640.0, 480.0)));
        assert_eq!(zone.normalize(FrameSize::new(640.0, 480.0)), zone.points());
    }

    #[test]
    fn normalize_scales_each_axis_independently() {
        let zone = square_zone(Some(FrameSize::new(640.0, 480.0)));
        let scaled = zone.normalize(FrameSize::new(1280.0, 240.0));
        assert_eq!(scaled[2], Point::new(200.0, 50.0));
        // Stored reference never changes implicitly.
        assert_eq!(zone.reference(), Some(FrameSize::new(640.0, 480.0)));
    }

    #[test]
    fn normalize_without_reference_returns_points_unchanged() {
        let zone = square_zone(None);
        assert_eq!(zone.normalize(FrameSize::new(1920.0, 1080.0)), zone.points());
        let zone = square_zone(Some(FrameSize::new(0.0, 480.0)));
        assert_eq!(zone.normalize(FrameSize::new(1920.0, 1080.0)), zone.points());
    }

    #[test]
    fn rejects_drafts() {
        let err = Zone::new(
            "zone:test",
            "Draft",
            vec![Point::new(0.0, 0.0), Point::new(1.0, 1.0)],
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ZoneError::ValidationFailed(_)));
    }

    #[test]
    fn rejects_bad_ids() {
        let err = Zone::new(
            "Front Door",
            "Gate",
            vec![Point::new(0.0, 0.0), Point::new(0.0, 1.0), Point::new(1.0, 0.0)],
            None,
        )
        .unwrap_err();
        assert_eq!(err, ZoneError::InvalidId("Front Door".to_string()));
    }

    #[test]
    fn replace_points_keeps_identity() {
        let mut zone = square_zone(Some(FrameSize::new(640.0, 480.0)));
        zone.replace_points(
            vec![Point::new(0.0, 0.0), Point::new(0.0, 50.0), Point::new(50.0, 0.0)],
            Some(FrameSize::new(320.0, 240.0)),
        )
        .unwrap();
        assert_eq!(zone.id(), "zone:test");
        assert_eq!(zone.points().len(), 3);
        assert_eq!(zone.reference(), Some(FrameSize::new(320.0, 240.0)));
        assert!(zone.replace_points(vec![], None).is_err());
        assert_eq!(zone.points().len(), 3);
    }

    #[test]
    fn validate_area_measures_on_surface() {
        let zone = square_zone(Some(FrameSize::new(640.0, 480.0)));
        assert_eq!(zone.area(), 8100.0);
        let shrunk = zone.validate_area(Some(FrameSize::new(64.0, 48.0)), 1000.0);
        assert!(!shrunk.valid);
        assert!((shrunk.area - 81.0).abs() < 1e-9);
    }
}
