//! V4L2 capture devices (`ingest-v4l2`).
//!
//! Each constraint resolves to one or more device nodes. A node is opened,
//! asked for packed RGB (or MJPEG when RGB is not offered) at the requested
//! size, and streamed through memory-mapped buffers. Open and negotiation
//! failures carry the platform failure names so the constraint chain in
//! `device` treats them like any other backend's.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::device::{
    failure_from_io, node_for_id, node_for_index, Constraints, DeviceBackend, DeviceFailure,
    DeviceStream, MediaTrack,
};
use super::mjpeg::{decode_jpeg, find_jpeg_bounds};
use crate::frame::{FrameSource, VideoFrame};

const PREFERRED_WIDTH: u32 = 1280;
const PREFERRED_HEIGHT: u32 = 720;
const TARGET_FPS: u32 = 10;
const BUFFER_COUNT: u32 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PixelLayout {
    Rgb24,
    Mjpeg,
}

#[self_referencing]
struct CaptureState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this>,
}

type SharedCapture = Arc<Mutex<Option<CaptureState>>>;

pub struct V4l2DeviceBackend {
    target_fps: u32,
}

impl V4l2DeviceBackend {
    pub fn new() -> Self {
        Self {
            target_fps: TARGET_FPS,
        }
    }

    fn candidates(&self, constraints: &Constraints) -> Result<Vec<PathBuf>, DeviceFailure> {
        match constraints {
            Constraints::ExactId(id) => {
                let node = node_for_id(id);
                if node.exists() {
                    Ok(vec![node])
                } else {
                    Err(DeviceFailure::new(
                        "OverconstrainedError",
                        format!("device {} not present", node.display()),
                    ))
                }
            }
            Constraints::IdealId(id) => {
                let node = node_for_id(id);
                if node.exists() {
                    Ok(vec![node])
                } else {
                    enumerate_nodes()
                }
            }
            Constraints::Index(index) => {
                let node = node_for_index(*index);
                if node.exists() {
                    Ok(vec![node])
                } else {
                    Err(DeviceFailure::new(
                        "NotFoundError",
                        format!("no device at index {}", index),
                    ))
                }
            }
            Constraints::AnyCamera | Constraints::LowResolution { .. } => enumerate_nodes(),
        }
    }

    fn open_node(
        &self,
        node: &Path,
        width: u32,
        height: u32,
    ) -> Result<DeviceStream, DeviceFailure> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let label = node.display().to_string();
        let device = v4l::Device::with_path(node)
            .map_err(|err| failure_from_io(&err, &format!("open {}", label)))?;
        let (layout, width, height) = negotiate(&device, &label, width, height)?;

        if self.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("v4l2: failed to set fps on {}: {}", label, err);
            }
        }

        let state = CaptureState::try_new(device, |device| {
            v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, BUFFER_COUNT)
        })
        .map_err(|err| failure_from_io(&err, &format!("start stream on {}", label)))?;
        let capture: SharedCapture = Arc::new(Mutex::new(Some(state)));

        log::info!("v4l2: streaming {} ({}x{}, {:?})", label, width, height, layout);
        Ok(DeviceStream {
            tracks: vec![Box::new(V4l2Track {
                label: label.clone(),
                capture: Arc::clone(&capture),
            })],
            frames: Box::new(V4l2Frames {
                label,
                capture,
                layout,
                width,
                height,
            }),
        })
    }
}

impl Default for V4l2DeviceBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBackend for V4l2DeviceBackend {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    fn open(&self, constraints: &Constraints) -> Result<DeviceStream, DeviceFailure> {
        let (width, height) = match constraints {
            Constraints::LowResolution { width, height } => (*width, *height),
            _ => (PREFERRED_WIDTH, PREFERRED_HEIGHT),
        };
        let mut last = DeviceFailure::new("NotFoundError", "no capture devices");
        for node in self.candidates(constraints)? {
            match self.open_node(&node, width, height) {
                Ok(stream) => return Ok(stream),
                Err(failure) => {
                    log::debug!(
                        "v4l2: {} refused ({}): {}",
                        node.display(),
                        failure.name,
                        failure.message
                    );
                    last = failure;
                }
            }
        }
        Err(last)
    }
}

fn enumerate_nodes() -> Result<Vec<PathBuf>, DeviceFailure> {
    let mut nodes = v4l::context::enum_devices();
    nodes.sort_by_key(|node| node.index());
    let paths: Vec<PathBuf> = nodes.iter().map(|node| node.path().to_path_buf()).collect();
    if paths.is_empty() {
        return Err(DeviceFailure::new("NotFoundError", "no capture devices"));
    }
    Ok(paths)
}

/// Ask for packed RGB first, then MJPEG. Anything else cannot be turned into
/// frames here.
fn negotiate(
    device: &v4l::Device,
    label: &str,
    width: u32,
    height: u32,
) -> Result<(PixelLayout, u32, u32), DeviceFailure> {
    use v4l::video::Capture;

    let mut offered = None;
    for (fourcc, layout) in [(b"RGB3", PixelLayout::Rgb24), (b"MJPG", PixelLayout::Mjpeg)] {
        let mut wanted = device
            .format()
            .map_err(|err| failure_from_io(&err, &format!("read format of {}", label)))?;
        wanted.width = width;
        wanted.height = height;
        wanted.fourcc = v4l::FourCC::new(fourcc);
        match device.set_format(&wanted) {
            Ok(actual) if actual.fourcc == wanted.fourcc => {
                return Ok((layout, actual.width, actual.height));
            }
            Ok(actual) => offered = Some(actual.fourcc.to_string()),
            Err(err) => log::warn!("v4l2: failed to set format on {}: {}", label, err),
        }
    }
    Err(DeviceFailure::new(
        "OverconstrainedError",
        format!(
            "{} offers neither RGB3 nor MJPG (got {})",
            label,
            offered.unwrap_or_else(|| "no format".to_string())
        ),
    ))
}

struct V4l2Track {
    label: String,
    capture: SharedCapture,
}

impl MediaTrack for V4l2Track {
    fn label(&self) -> &str {
        &self.label
    }

    /// Drops the stream and then the device, which closes the node.
    fn stop(&mut self) -> Result<()> {
        let mut guard = self
            .capture
            .lock()
            .map_err(|_| anyhow!("v4l2 capture lock poisoned for {}", self.label))?;
        guard.take();
        Ok(())
    }

    fn is_live(&self) -> bool {
        self.capture
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }
}

struct V4l2Frames {
    label: String,
    capture: SharedCapture,
    layout: PixelLayout,
    width: u32,
    height: u32,
}

impl FrameSource for V4l2Frames {
    fn next_frame(&mut self) -> Result<Option<VideoFrame>> {
        use v4l::io::traits::CaptureStream;

        let mut buffer = {
            let mut guard = self
                .capture
                .lock()
                .map_err(|_| anyhow!("v4l2 capture lock poisoned for {}", self.label))?;
            let state = guard
                .as_mut()
                .ok_or_else(|| anyhow!("v4l2 track {} stopped", self.label))?;
            state
                .with_stream_mut(|stream| stream.next().map(|(buf, _meta)| buf.to_vec()))
                .with_context(|| format!("capture v4l2 frame from {}", self.label))?
        };

        let (pixels, width, height) = match self.layout {
            PixelLayout::Rgb24 => {
                let expected = (self.width as usize) * (self.height as usize) * 3;
                if buffer.len() < expected {
                    return Err(anyhow!(
                        "short v4l2 frame from {}: {} bytes, expected {}",
                        self.label,
                        buffer.len(),
                        expected
                    ));
                }
                buffer.truncate(expected);
                (buffer, self.width, self.height)
            }
            PixelLayout::Mjpeg => {
                let (start, end) = find_jpeg_bounds(&buffer)
                    .ok_or_else(|| anyhow!("v4l2 buffer from {} holds no jpeg", self.label))?;
                decode_jpeg(&buffer[start..end])?
            }
        };
        Ok(Some(VideoFrame::new(pixels, width, height, crate::now_ms()?)?))
    }
}
