use anyhow::{anyhow, Result};
use std::collections::VecDeque;

use crate::detect::backend::ObjectDetector;
use crate::detect::result::Detections;
use crate::frame::VideoFrame;

/// Detector that replays a fixed script of per-frame outcomes.
///
/// Each call to `detect` consumes one scripted step. An exhausted script
/// yields no objects at the frame's own size.
pub struct ScriptedDetector {
    steps: VecDeque<Result<Detections, String>>,
    calls: usize,
}

impl ScriptedDetector {
    pub fn new() -> Self {
        Self {
            steps: VecDeque::new(),
            calls: 0,
        }
    }

    pub fn then(mut self, detections: Detections) -> Self {
        self.steps.push_back(Ok(detections));
        self
    }

    /// Script a transient failure for the next unscripted step.
    pub fn then_fail(mut self, reason: impl Into<String>) -> Self {
        self.steps.push_back(Err(reason.into()));
        self
    }

    pub fn push(&mut self, detections: Detections) {
        self.steps.push_back(Ok(detections));
    }

    pub fn calls(&self) -> usize {
        self.calls
    }
}

impl Default for ScriptedDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectDetector for ScriptedDetector {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, frame: &VideoFrame) -> Result<Detections> {
        self.calls += 1;
        match self.steps.pop_front() {
            Some(Ok(detections)) => Ok(detections),
            Some(Err(reason)) => Err(anyhow!("scripted detector failure: {}", reason)),
            None => Ok(Detections::empty(frame.size())),
        }
    }
}
