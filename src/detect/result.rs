use serde::{Deserialize, Serialize};

use crate::geometry::{BoundingBox, FrameSize, Point};

/// One detector output in the detector's native pixel space.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    #[serde(alias = "class")]
    pub label: String,
    #[serde(alias = "score")]
    pub confidence: f64,
    pub bbox: BoundingBox,
}

impl RawDetection {
    pub fn new(label: impl Into<String>, confidence: f64, bbox: BoundingBox) -> Self {
        Self {
            label: label.into(),
            confidence,
            bbox,
        }
    }
}

/// Everything a detector reports for one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Detections {
    /// Size of the frame the boxes are expressed in.
    pub frame_size: FrameSize,
    pub objects: Vec<RawDetection>,
}

impl Detections {
    pub fn new(frame_size: FrameSize, objects: Vec<RawDetection>) -> Self {
        Self {
            frame_size,
            objects,
        }
    }

    pub fn empty(frame_size: FrameSize) -> Self {
        Self::new(frame_size, Vec::new())
    }
}

/// A detection after label filtering and rescaling onto the rendering surface.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectedObject {
    pub bbox: BoundingBox,
    pub label: String,
    pub confidence: f64,
    pub center: Point,
}

impl DetectedObject {
    /// Rescale `raw` by `(sx, sy)` and derive its centre.
    pub fn from_raw(raw: &RawDetection, sx: f64, sy: f64) -> Self {
        let bbox = raw.bbox.scaled(sx, sy);
        Self {
            center: bbox.center(),
            bbox,
            label: raw.label.clone(),
            confidence: raw.confidence,
        }
    }
}
