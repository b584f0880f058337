//! Interactive polygon editor.
//!
//! Pointer positions arrive in surface pixels. Every accepted position is
//! clamped to the surface, so a finished zone never has points off-screen.
//!
//! Drag and append are mutually exclusive: pressing on an existing vertex
//! starts a drag, and the click event that follows the release of that drag
//! is swallowed instead of appending a point.

use crate::geometry::{FrameSize, Point};
use crate::zone::{Zone, ZoneError, MIN_ZONE_POINTS};

/// Distance in surface pixels within which the pointer grabs a vertex.
pub const VERTEX_HIT_RADIUS: f64 = 10.0;

#[derive(Clone, Debug)]
pub struct PolygonEditor {
    surface: FrameSize,
    drawing_active: bool,
    draft_points: Vec<Point>,
    dragged_index: Option<usize>,
    hovered_index: Option<usize>,
    pointer: Option<Point>,
    swallow_next_click: bool,
    name: String,
    editing_id: Option<String>,
}

/// How the draft outline should be drawn.
#[derive(Clone, Debug, PartialEq)]
pub enum DraftShape {
    Empty,
    /// Fewer than three points: open polyline.
    Polyline(Vec<Point>),
    /// Three or more points: closed, filled polygon.
    Polygon(Vec<Point>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarkerEmphasis {
    Normal,
    Hovered,
    Dragged,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VertexMarker {
    /// 1-based label drawn next to the vertex.
    pub ordinal: usize,
    pub position: Point,
    pub emphasis: MarkerEmphasis,
}

/// Everything an external renderer needs to draw the editor state.
#[derive(Clone, Debug, PartialEq)]
pub struct EditorScene {
    pub shape: DraftShape,
    pub markers: Vec<VertexMarker>,
    /// Rubber-band segment from the last vertex to the pointer.
    pub preview: Option<(Point, Point)>,
}

impl PolygonEditor {
    pub fn new(surface: FrameSize) -> Self {
        Self {
            surface,
            drawing_active: false,
            draft_points: Vec::new(),
            dragged_index: None,
            hovered_index: None,
            pointer: None,
            swallow_next_click: false,
            name: String::new(),
            editing_id: None,
        }
    }

    /// Begin drawing a new zone called `name`.
    pub fn start(&mut self, name: impl Into<String>) {
        self.reset();
        self.name = name.into();
        self.drawing_active = true;
    }

    /// Begin re-editing `zone`; its points are placed on the current surface.
    pub fn edit(&mut self, zone: &Zone) {
        self.reset();
        self.name = zone.name().to_string();
        self.editing_id = Some(zone.id().to_string());
        self.draft_points = zone.normalize(self.surface);
        self.drawing_active = true;
    }

    pub fn is_drawing(&self) -> bool {
        self.drawing_active
    }

    pub fn draft_points(&self) -> &[Point] {
        &self.draft_points
    }

    pub fn dragged_index(&self) -> Option<usize> {
        self.dragged_index
    }

    pub fn hovered_index(&self) -> Option<usize> {
        self.hovered_index
    }

    pub fn surface(&self) -> FrameSize {
        self.surface
    }

    /// The viewing surface was resized; rescale the draft with it.
    pub fn resize_surface(&mut self, surface: FrameSize) {
        if let Some((sx, sy)) = self.surface.scale_to(surface) {
            for point in &mut self.draft_points {
                *point = point.scaled(sx, sy);
            }
        }
        self.surface = surface;
    }

    /// Append a vertex, unless a drag is in progress or just ended.
    pub fn click(&mut self, pointer: Point) -> bool {
        if self.swallow_next_click {
            self.swallow_next_click = false;
            return false;
        }
        if !self.drawing_active || self.dragged_index.is_some() {
            return false;
        }
        self.draft_points.push(self.surface.clamp(pointer));
        true
    }

    /// Track the pointer for hover highlighting, live preview and dragging.
    pub fn pointer_move(&mut self, pointer: Point) {
        let clamped = self.surface.clamp(pointer);
        self.pointer = Some(clamped);
        if self.dragged_index.is_some() {
            self.update_drag(clamped);
        } else {
            self.hovered_index = self.vertex_at(clamped);
        }
    }

    pub fn pointer_leave(&mut self) {
        self.pointer = None;
        self.hovered_index = None;
        self.swallow_next_click = false;
    }

    /// Pointer pressed: grab the vertex under it, if any. A press starts a
    /// new gesture, so a click still pending from an earlier drag is dropped.
    pub fn pointer_down(&mut self, pointer: Point) -> bool {
        self.swallow_next_click = false;
        match self.vertex_at(self.surface.clamp(pointer)) {
            Some(index) => self.begin_drag(index),
            None => false,
        }
    }

    pub fn begin_drag(&mut self, index: usize) -> bool {
        if !self.drawing_active || index >= self.draft_points.len() {
            return false;
        }
        self.dragged_index = Some(index);
        self.hovered_index = Some(index);
        true
    }

    pub fn update_drag(&mut self, pointer: Point) {
        if let Some(index) = self.dragged_index {
            if let Some(point) = self.draft_points.get_mut(index) {
                *point = self.surface.clamp(pointer);
            }
        }
    }

    pub fn end_drag(&mut self) {
        if self.dragged_index.take().is_some() {
            self.swallow_next_click = true;
        }
    }

    /// Complete the draft. Fewer than three points is a validation error and
    /// leaves the draft untouched.
    pub fn finish(&mut self) -> Result<Zone, ZoneError> {
        if self.draft_points.len() < MIN_ZONE_POINTS {
            return Err(ZoneError::ValidationFailed(format!(
                "draw at least {} points to form a zone (got {})",
                MIN_ZONE_POINTS,
                self.draft_points.len()
            )));
        }
        let id = self
            .editing_id
            .clone()
            .unwrap_or_else(crate::generate_zone_id);
        let name = if self.name.trim().is_empty() {
            "Protected area".to_string()
        } else {
            self.name.trim().to_string()
        };
        let zone = Zone::new(id, name, self.draft_points.clone(), Some(self.surface))?;
        log::debug!(
            "editor finished zone {} with {} points",
            zone.id(),
            zone.points().len()
        );
        self.reset();
        Ok(zone)
    }

    /// Abandon the draft without producing a zone.
    pub fn cancel(&mut self) {
        self.reset();
    }

    /// Drop all draft points but keep drawing.
    pub fn clear(&mut self) {
        self.draft_points.clear();
        self.dragged_index = None;
        self.hovered_index = None;
        self.swallow_next_click = false;
    }

    pub fn scene(&self) -> EditorScene {
        let shape = match self.draft_points.len() {
            0 => DraftShape::Empty,
            n if n < MIN_ZONE_POINTS => DraftShape::Polyline(self.draft_points.clone()),
            _ => DraftShape::Polygon(self.draft_points.clone()),
        };
        let markers = self
            .draft_points
            .iter()
            .enumerate()
            .map(|(index, position)| VertexMarker {
                ordinal: index + 1,
                position: *position,
                emphasis: if self.dragged_index == Some(index) {
                    MarkerEmphasis::Dragged
                } else if self.hovered_index == Some(index) {
                    MarkerEmphasis::Hovered
                } else {
                    MarkerEmphasis::Normal
                },
            })
            .collect();
        let preview = match (self.drawing_active, self.dragged_index, self.pointer) {
            (true, None, Some(pointer)) => self.draft_points.last().map(|last| (*last, pointer)),
            _ => None,
        };
        EditorScene {
            shape,
            markers,
            preview,
        }
    }

    fn vertex_at(&self, pointer: Point) -> Option<usize> {
        self.draft_points
            .iter()
            .enumerate()
            .filter(|(_, p)| p.distance_to(&pointer) <= VERTEX_HIT_RADIUS)
            .min_by(|(_, a), (_, b)| {
                a.distance_to(&pointer)
                    .total_cmp(&b.distance_to(&pointer))
            })
            .map(|(index, _)| index)
    }

    fn reset(&mut self) {
        self.drawing_active = false;
        self.draft_points.clear();
        self.dragged_index = None;
        self.hovered_index = None;
        self.pointer = None;
        self.swallow_next_click = false;
        self.name.clear();
        self.editing_id = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::polygon_area;

    fn editor() -> PolygonEditor {
        let mut editor = PolygonEditor::new(FrameSize::new(640.0, 480.0));
        editor.start("Gate");
        editor
    }

    #[test]
    fn four_clicks_finish_into_square_zone() {
        let mut editor = editor();
        for (x, y) in [(10.0, 10.0), (10.0, 100.0), (100.0, 100.0), (100.0, 10.0)] {
            assert!(editor.click(Point::new(x, y)));
        }
        let zone = editor.finish().unwrap();
        assert_eq!(zone.points().len(), 4);
        assert_eq!(polygon_area(zone.points()), 8100.0);
        assert_eq!(zone.name(), "Gate");
        assert_eq!(zone.reference(), Some(FrameSize::new(640.0, 480.0)));
        assert!(!editor.is_drawing());
        assert!(editor.draft_points().is_empty());
    }

    #[test]
    fn finish_with_two_points_is_refused_and_keeps_draft() {
        let mut editor = editor();
        editor.click(Point::new(10.0, 10.0));
        editor.click(Point::new(50.0, 50.0));
        assert!(matches!(
            editor.finish(),
            Err(ZoneError::ValidationFailed(_))
        ));
        assert!(editor.is_drawing());
        assert_eq!(editor.draft_points().len(), 2);
    }

    #[test]
    fn clicks_are_clamped_to_surface() {
        let mut editor = editor();
        editor.click(Point::new(-20.0, 900.0));
        assert_eq!(editor.draft_points()[0], Point::new(0.0, 480.0));
    }

    #[test]
    fn drag_moves_vertex_and_suppresses_click() {
        let mut editor = editor();
        editor.click(Point::new(10.0, 10.0));
        editor.click(Point::new(100.0, 10.0));
        editor.click(Point::new(100.0, 100.0));

        assert!(editor.pointer_down(Point::new(12.0, 12.0)));
        assert_eq!(editor.dragged_index(), Some(0));
        assert!(!editor.click(Point::new(12.0, 12.0)));
        editor.pointer_move(Point::new(30.0, 40.0));
        editor.pointer_move(Point::new(700.0, 40.0));
        editor.end_drag();
        // The click the platform fires after releasing the drag is swallowed.
        assert!(!editor.click(Point::new(640.0, 40.0)));
        assert_eq!(editor.draft_points().len(), 3);
        assert_eq!(editor.draft_points()[0], Point::new(640.0, 40.0));
        // Subsequent clicks append again.
        assert!(editor.click(Point::new(20.0, 200.0)));
        assert_eq!(editor.draft_points().len(), 4);
    }

    #[test]
    fn drag_released_off_surface_does_not_eat_next_click() {
        let mut editor = editor();
        editor.click(Point::new(10.0, 10.0));
        editor.click(Point::new(100.0, 10.0));

        assert!(editor.pointer_down(Point::new(10.0, 10.0)));
        editor.pointer_move(Point::new(50.0, 60.0));
        editor.pointer_leave();
        editor.end_drag();
        // No click follows a release outside the surface.
        assert!(!editor.pointer_down(Point::new(300.0, 300.0)));
        assert!(editor.click(Point::new(300.0, 300.0)));
        assert_eq!(editor.draft_points().len(), 3);

        assert!(editor.pointer_down(Point::new(300.0, 300.0)));
        editor.end_drag();
        editor.pointer_leave();
        assert!(editor.click(Point::new(200.0, 200.0)));
        assert_eq!(editor.draft_points().len(), 4);
    }

    #[test]
    fn pointer_down_away_from_vertices_does_not_drag() {
        let mut editor = editor();
        editor.click(Point::new(10.0, 10.0));
        assert!(!editor.pointer_down(Point::new(200.0, 200.0)));
        assert!(editor.click(Point::new(200.0, 200.0)));
    }

    #[test]
    fn scene_switches_from_polyline_to_polygon() {
        let mut editor = editor();
        assert_eq!(editor.scene().shape, DraftShape::Empty);
        editor.click(Point::new(10.0, 10.0));
        editor.click(Point::new(100.0, 10.0));
        assert!(matches!(editor.scene().shape, DraftShape::Polyline(ref p) if p.len() == 2));
        editor.click(Point::new(100.0, 100.0));
        assert!(matches!(editor.scene().shape, DraftShape::Polygon(ref p) if p.len() == 3));

        editor.pointer_move(Point::new(101.0, 99.0));
        let scene = editor.scene();
        let ordinals: Vec<usize> = scene.markers.iter().map(|m| m.ordinal).collect();
        assert_eq!(ordinals, vec![1, 2, 3]);
        assert_eq!(scene.markers[2].emphasis, MarkerEmphasis::Hovered);
        assert_eq!(scene.markers[0].emphasis, MarkerEmphasis::Normal);
        assert_eq!(
            scene.preview,
            Some((Point::new(100.0, 100.0), Point::new(101.0, 99.0)))
        );
    }

    #[test]
    fn cancel_discards_without_zone() {
        let mut editor = editor();
        editor.click(Point::new(10.0, 10.0));
        editor.cancel();
        assert!(!editor.is_drawing());
        assert!(editor.draft_points().is_empty());
        assert!(!editor.click(Point::new(10.0, 10.0)));
    }

    #[test]
    fn edit_keeps_zone_id_and_rescales() {
        let original = Zone::new(
            "zone:gate",
            "Gate",
            vec![
                Point::new(10.0, 10.0),
                Point::new(10.0, 100.0),
                Point::new(100.0, 100.0),
            ],
            Some(FrameSize::new(320.0, 240.0)),
        )
        .unwrap();
        let mut editor = PolygonEditor::new(FrameSize::new(640.0, 480.0));
        editor.edit(&original);
        assert_eq!(editor.draft_points()[2], Point::new(200.0, 200.0));
        editor.click(Point::new(300.0, 20.0));
        let edited = editor.finish().unwrap();
        assert_eq!(edited.id(), "zone:gate");
        assert_eq!(edited.points().len(), 4);
        assert_eq!(edited.reference(), Some(FrameSize::new(640.0, 480.0)));
    }
}
