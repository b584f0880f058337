use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::detect::backend::ObjectDetector;
use crate::detect::result::{Detections, RawDetection};
use crate::frame::VideoFrame;
use crate::geometry::{BoundingBox, FrameSize};

/// Detector fed by an external model process, one JSON object per frame:
///
/// ```json
/// {"width": 640, "height": 480,
///  "predictions": [{"class": "person", "score": 0.82, "bbox": [x, y, w, h]}]}
/// ```
///
/// Boxes use the origin-plus-extent layout common to browser and Python
/// detectors. Blank lines are skipped. Once the feed is exhausted every frame
/// reports no objects.
pub struct JsonLinesDetector {
    reader: Box<dyn BufRead + Send>,
    line: String,
    exhausted: bool,
}

#[derive(Debug, Deserialize)]
struct FrameLine {
    width: f64,
    height: f64,
    #[serde(default, alias = "detections")]
    predictions: Vec<Prediction>,
}

#[derive(Debug, Deserialize)]
struct Prediction {
    #[serde(alias = "label")]
    class: String,
    #[serde(alias = "confidence")]
    score: f64,
    bbox: [f64; 4],
}

impl JsonLinesDetector {
    pub fn new(reader: Box<dyn BufRead + Send>) -> Self {
        Self {
            reader,
            line: String::new(),
            exhausted: false,
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("open detection feed {}", path.display()))?;
        Ok(Self::new(Box::new(BufReader::new(file))))
    }

    fn next_line(&mut self) -> Result<Option<FrameLine>> {
        loop {
            self.line.clear();
            let read = self.reader.read_line(&mut self.line)?;
            if read == 0 {
                return Ok(None);
            }
            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let parsed = serde_json::from_str(trimmed)
                .map_err(|err| anyhow!("malformed detection line: {}", err))?;
            return Ok(Some(parsed));
        }
    }
}

impl ObjectDetector for JsonLinesDetector {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    fn detect(&mut self, frame: &VideoFrame) -> Result<Detections> {
        if self.exhausted {
            return Ok(Detections::empty(frame.size()));
        }
        let Some(line) = self.next_line()? else {
            log::info!("detection feed exhausted; further frames report no objects");
            self.exhausted = true;
            return Ok(Detections::empty(frame.size()));
        };
        let objects = line
            .predictions
            .into_iter()
            .map(|p| {
                let [x, y, w, h] = p.bbox;
                RawDetection::new(p.class, p.score, BoundingBox::from_xywh(x, y, w, h))
            })
            .collect();
        Ok(Detections::new(
            FrameSize::new(line.width, line.height),
            objects,
        ))
    }
}
