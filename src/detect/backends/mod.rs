pub mod replay;
pub mod scripted;

pub use replay::JsonLinesDetector;
pub use scripted::ScriptedDetector;
