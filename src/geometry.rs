//! Geometry kernel.
//!
//! Pure functions over polygons, points and bounding boxes. No I/O, no state.
//! Every coordinate is expressed in the pixel units of some reference frame;
//! callers are responsible for bringing polygons and boxes into the same frame
//! (see `zone::Zone::normalize` and `FrameSize::scale_to`) before testing them.

use serde::{Deserialize, Serialize};

/// Minimum zone area in square pixels accepted at save time.
pub const DEFAULT_MIN_AREA_PX2: f64 = 1000.0;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_to(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    pub fn scaled(&self, sx: f64, sy: f64) -> Point {
        Point::new(self.x * sx, self.y * sy)
    }
}

/// Pixel size of a viewing surface or a detector input frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameSize {
    pub width: f64,
    pub height: f64,
}

impl FrameSize {
    pub const fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// A frame size is usable as a scale reference only when both sides are
    /// finite and strictly positive.
    pub fn is_usable(&self) -> bool {
        self.width.is_finite() && self.height.is_finite() && self.width > 0.0 && self.height > 0.0
    }

    /// Scale factors that map coordinates in `self` onto `target`.
    ///
    /// Returns `None` when `self` cannot serve as a reference.
    pub fn scale_to(&self, target: FrameSize) -> Option<(f64, f64)> {
        if !self.is_usable() {
            return None;
        }
        Some((target.width / self.width, target.height / self.height))
    }

    /// Clamp a point into `[0, width] x [0, height]`.
    pub fn clamp(&self, point: Point) -> Point {
        Point::new(
            point.x.clamp(0.0, self.width.max(0.0)),
            point.y.clamp(0.0, self.height.max(0.0)),
        )
    }
}

/// Axis-aligned box `[x1, y1, x2, y2]` with `x1 <= x2`, `y1 <= y2` expected.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BoundingBox {
    pub const fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Build from an origin plus extent, the layout most detectors emit.
    pub fn from_xywh(x: f64, y: f64, w: f64, h: f64) -> Self {
        Self::new(x, y, x + w, y + h)
    }

    pub fn width(&self) -> f64 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f64 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn center(&self) -> Point {
        Point::new(
            self.x1 + (self.x2 - self.x1) / 2.0,
            self.y1 + (self.y2 - self.y1) / 2.0,
        )
    }

    pub fn scaled(&self, sx: f64, sy: f64) -> BoundingBox {
        BoundingBox::new(self.x1 * sx, self.y1 * sy, self.x2 * sx, self.y2 * sy)
    }

    pub fn as_array(&self) -> [f64; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

impl From<[f64; 4]> for BoundingBox {
    fn from(v: [f64; 4]) -> Self {
        BoundingBox::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BoundingBox> for [f64; 4] {
    fn from(b: BoundingBox) -> Self {
        b.as_array()
    }
}

/// Sampling resolution for `bbox_inside_ratio`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleGrid {
    pub cols: u32,
    pub rows: u32,
}

impl SampleGrid {
    pub const fn new(cols: u32, rows: u32) -> Self {
        Self { cols, rows }
    }

    pub fn total(&self) -> u32 {
        self.cols.saturating_mul(self.rows)
    }
}

impl Default for SampleGrid {
    /// 6 x 4 = 24 samples per box.
    fn default() -> Self {
        Self::new(6, 4)
    }
}

/// Shoelace sum divided by two. Positive for counter-clockwise winding in a
/// y-up frame (clockwise on screen), negative for the reverse order.
pub fn signed_polygon_area(points: &[Point]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut sum = 0.0;
    for (i, p) in points.iter().enumerate() {
        let q = &points[(i + 1) % points.len()];
        sum += p.x * q.y - q.x * p.y;
    }
    sum / 2.0
}

/// Unsigned polygon area; `0` for fewer than three points.
pub fn polygon_area(points: &[Point]) -> f64 {
    signed_polygon_area(points).abs()
}

/// Ray-casting parity test. The polygon is implicitly closed.
pub fn is_point_in_polygon(point: Point, polygon: &[Point]) -> bool {
    if polygon.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (pi, pj) = (polygon[i], polygon[j]);
        if (pi.y > point.y) != (pj.y > point.y)
            && point.x < (pj.x - pi.x) * (point.y - pi.y) / (pj.y - pi.y) + pi.x
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Approximate fraction of `bbox` that lies inside `polygon`.
///
/// Samples the centre of each cell of a `grid.cols x grid.rows` lattice laid
/// over the box and counts how many fall inside. Not exact polygon clipping.
/// A box with zero width or height yields `0`.
pub fn bbox_inside_ratio(bbox: &BoundingBox, polygon: &[Point], grid: SampleGrid) -> f64 {
    let (width, height) = (bbox.width(), bbox.height());
    if width == 0.0 || height == 0.0 || grid.total() == 0 {
        return 0.0;
    }
    let step_x = width / grid.cols as f64;
    let step_y = height / grid.rows as f64;
    let mut inside = 0u32;
    for i in 0..grid.cols {
        for j in 0..grid.rows {
            let sample = Point::new(
                bbox.x1 + (i as f64 + 0.5) * step_x,
                bbox.y1 + (j as f64 + 0.5) * step_y,
            );
            if is_point_in_polygon(sample, polygon) {
                inside += 1;
            }
        }
    }
    inside as f64 / grid.total() as f64
}

#[derive(Clone, Debug, PartialEq)]
pub struct AreaValidation {
    pub valid: bool,
    pub area: f64,
    pub message: String,
}

/// Check that a polygon is closed (>= 3 points) and encloses at least
/// `min_area_px2` square pixels. The message is meant to be shown verbatim.
pub fn validate_zone_area(points: &[Point], min_area_px2: f64) -> AreaValidation {
    if points.len() < 3 {
        return AreaValidation {
            valid: false,
            area: 0.0,
            message: format!(
                "zone needs at least 3 points (got {}); area 0 px² is below the minimum of {:.0} px²",
                points.len(),
                min_area_px2
            ),
        };
    }
    let area = polygon_area(points);
    if area < min_area_px2 {
        return AreaValidation {
            valid: false,
            area,
            message: format!(
                "zone area {:.0} px² is below the minimum of {:.0} px²",
                area, min_area_px2
            ),
        };
    }
    AreaValidation {
        valid: true,
        area,
        message: format!(
            "zone area {:.0} px² meets the minimum of {:.0} px²",
            area, min_area_px2
        ),
    }
}
