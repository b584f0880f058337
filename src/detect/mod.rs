mod backend;
mod backends;
mod result;

pub use backend::ObjectDetector;
pub use backends::{JsonLinesDetector, ScriptedDetector};
pub use result::{DetectedObject, Detections, RawDetection};
