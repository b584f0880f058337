use anyhow::Result;

use crate::detect::result::Detections;
use crate::frame::VideoFrame;

/// Object detector collaborator.
///
/// The kernel never implements detection itself. A backend receives a frame
/// and reports `{label, confidence, bbox}` tuples in the frame's native pixel
/// space, together with that native size so the monitor can rescale boxes
/// onto the rendering surface.
///
/// An `Err` is a transient failure: the monitor logs it and skips the tick.
pub trait ObjectDetector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn detect(&mut self, frame: &VideoFrame) -> Result<Detections>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
