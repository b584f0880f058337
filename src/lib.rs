//! Perimeter Kernel
//!
//! This crate implements the detection-zone geometry and live intrusion
//! monitoring core of the surveillance console.
//!
//! # Architecture
//!
//! The kernel keeps four guarantees:
//!
//! 1. **Frame-independent zones**: a zone is stored together with the size of
//!    the surface it was authored on, and every placement rescales it first.
//! 2. **No draft evaluation**: a polygon with fewer than three points can only
//!    exist inside the editor; `Zone` cannot be built from it.
//! 3. **One source at a time**: the source controller holds at most one handle
//!    and discards any acquisition that resolves after the operator moved on.
//! 4. **Throttled persistence**: intrusion events reach the event log at most
//!    once per throttle window, no matter how many objects intrude.
//!
//! # Module Structure
//!
//! - `geometry`: polygon area, point-in-polygon, box overlap sampling
//! - `zone`: zone model, normalisation, payload parsing, persistence
//! - `editor`: interactive polygon construction
//! - `source`: video source acquisition state machine
//! - `detect`: detector contract and detection results
//! - `monitor`: per-tick intrusion evaluation, alerts, throttling
//! - `events`, `evidence`: collaborators that record what the monitor found
//! - `config`: console configuration file and environment overrides

use anyhow::{anyhow, Result};
use rand::RngCore;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod detect;
pub mod editor;
pub mod events;
pub mod evidence;
pub mod frame;
pub mod geometry;
pub mod monitor;
pub mod source;
pub mod zone;

pub use detect::{DetectedObject, Detections, ObjectDetector, RawDetection};
pub use editor::{EditorScene, PolygonEditor};
pub use events::{EventSink, InMemoryEventLog, SecurityEvent, SqliteEventLog};
pub use evidence::{
    EvidenceMetadata, EvidenceSink, EvidenceWriter, FilesystemEvidenceStore, InMemoryEvidence,
};
pub use frame::{FrameSource, VideoFrame};
pub use geometry::{
    bbox_inside_ratio, is_point_in_polygon, polygon_area, validate_zone_area, AreaValidation,
    BoundingBox, FrameSize, Point, SampleGrid,
};
pub use monitor::{
    Alert, AlertKind, DetectionResult, Intrusion, IntrusionMonitor, MonitorConfig, TickSinks,
    TickStatus, ZoneStats,
};
pub use source::{
    AcquireSettings, Acquisition, AcquisitionTask, SourceAcquirer, SourceController, SourceError,
    SourceHandle, SourceKind, SourceState, VideoSourceKind,
};
pub use zone::{Zone, ZoneError};

// -------------------- Identifier Discipline --------------------

/// Zone ids are local identifiers: `zone:` followed by 1..64 of `[a-z0-9_-]`.
pub fn validate_zone_id(zone_id: &str) -> Result<()> {
    static ZONE_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = ZONE_ID_RE.get_or_init(|| regex::Regex::new(r"^zone:[a-z0-9_-]{1,64}$").unwrap());

    if !re.is_match(zone_id) {
        return Err(anyhow!("zone_id must match ^zone:[a-z0-9_-]{{1,64}}$"));
    }
    Ok(())
}

/// Camera ids follow the same shape under the `camera:` prefix.
pub fn validate_camera_id(camera_id: &str) -> Result<()> {
    static CAMERA_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = CAMERA_ID_RE
        .get_or_init(|| regex::Regex::new(r"^camera:[a-z0-9_-]{1,64}$").unwrap());

    if !re.is_match(camera_id) {
        return Err(anyhow!("camera_id must match ^camera:[a-z0-9_-]{{1,64}}$"));
    }
    Ok(())
}

/// Fresh random zone id (`zone:` + 16 hex chars).
pub fn generate_zone_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("zone:{}", hex::encode(bytes))
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> Result<u64> {
    let elapsed = SystemTime::now().duration_since(UNIX_EPOCH)?;
    u64::try_from(elapsed.as_millis()).map_err(|_| anyhow!("clock exceeds u64 milliseconds"))
}
