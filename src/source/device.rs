//! Live capture devices.
//!
//! Acquisition walks a chain of progressively looser constraints and stops at
//! the first one the device backend accepts. Permission, not-found, busy and
//! over-constrained failures advance the chain; anything else ends it.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use super::{CancelToken, SourceError};
use crate::frame::{FrameSource, VideoFrame};

pub const LOW_RES_WIDTH: u32 = 640;
pub const LOW_RES_HEIGHT: u32 = 480;

/// Which device the operator picked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceSelector {
    Default,
    Id(String),
    Index(u32),
}

impl DeviceSelector {
    /// `webcam://<token>`, `stub://<token>` or a bare token. A numeric token is
    /// a device index; empty or `default` picks the default device.
    pub fn parse(raw: &str) -> Self {
        let token = raw
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(raw)
            .trim();
        if token.is_empty() || token == "default" {
            DeviceSelector::Default
        } else if let Ok(index) = token.parse::<u32>() {
            DeviceSelector::Index(index)
        } else {
            DeviceSelector::Id(token.to_string())
        }
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelector::Default => write!(f, "default"),
            DeviceSelector::Id(id) => write!(f, "id:{}", id),
            DeviceSelector::Index(index) => write!(f, "#{}", index),
        }
    }
}

/// One capability request in the fallback chain.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Constraints {
    ExactId(String),
    IdealId(String),
    Index(u32),
    AnyCamera,
    LowResolution { width: u32, height: u32 },
}

impl fmt::Display for Constraints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraints::ExactId(id) => write!(f, "exact device {}", id),
            Constraints::IdealId(id) => write!(f, "ideal device {}", id),
            Constraints::Index(index) => write!(f, "device index {}", index),
            Constraints::AnyCamera => write!(f, "any camera"),
            Constraints::LowResolution { width, height } => {
                write!(f, "any camera at {}x{}", width, height)
            }
        }
    }
}

pub fn constraint_chain(selector: &DeviceSelector) -> Vec<Constraints> {
    let low_res = Constraints::LowResolution {
        width: LOW_RES_WIDTH,
        height: LOW_RES_HEIGHT,
    };
    match selector {
        DeviceSelector::Id(id) => vec![
            Constraints::ExactId(id.clone()),
            Constraints::IdealId(id.clone()),
            Constraints::AnyCamera,
            low_res,
        ],
        DeviceSelector::Index(index) => {
            vec![Constraints::Index(*index), Constraints::AnyCamera, low_res]
        }
        DeviceSelector::Default => vec![Constraints::AnyCamera, low_res],
    }
}

/// Failure reported by a device backend, named the way the platform names it
/// (`NotAllowedError`, `NotReadableError`, ...).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceFailure {
    pub name: String,
    pub message: String,
}

impl DeviceFailure {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// A live track that must be stopped explicitly to free the device.
pub trait MediaTrack: Send {
    fn label(&self) -> &str;

    fn stop(&mut self) -> Result<()>;

    fn is_live(&self) -> bool;
}

pub struct DeviceStream {
    pub tracks: Vec<Box<dyn MediaTrack>>,
    pub frames: Box<dyn FrameSource>,
}

pub trait DeviceBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn open(&self, constraints: &Constraints) -> Result<DeviceStream, DeviceFailure>;
}

/// Which backend serves live-device requests. `stub://` selectors get the
/// synthetic camera; every other selector needs capture hardware.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceBackendChoice {
    Synthetic,
    V4l2,
}

impl DeviceBackendChoice {
    pub fn for_selector(raw: &str) -> Self {
        if raw.trim().starts_with("stub://") {
            DeviceBackendChoice::Synthetic
        } else {
            DeviceBackendChoice::V4l2
        }
    }
}

/// Build the backend for `choice`. Without the `ingest-v4l2` feature a
/// hardware selector is refused instead of being served synthetic frames.
pub fn device_backend(choice: DeviceBackendChoice) -> Result<Arc<dyn DeviceBackend>> {
    match choice {
        DeviceBackendChoice::Synthetic => Ok(Arc::new(SyntheticDeviceBackend::new())),
        #[cfg(feature = "ingest-v4l2")]
        DeviceBackendChoice::V4l2 => Ok(Arc::new(super::v4l2::V4l2DeviceBackend::new())),
        #[cfg(not(feature = "ingest-v4l2"))]
        DeviceBackendChoice::V4l2 => Err(anyhow!(
            "capture devices need a build with --features ingest-v4l2; \
             use a stub:// selector for the synthetic camera"
        )),
    }
}

const ENXIO: i32 = 6;
const EBUSY: i32 = 16;
const ENODEV: i32 = 19;
const EINVAL: i32 = 22;

/// Name an OS-level capture failure the way the platform names device
/// failures, so it walks the same fallback chain.
#[cfg_attr(not(feature = "ingest-v4l2"), allow(dead_code))]
pub(crate) fn failure_from_io(err: &io::Error, context: &str) -> DeviceFailure {
    let name = match err.raw_os_error() {
        Some(EBUSY) => "NotReadableError",
        Some(ENODEV) | Some(ENXIO) => "NotFoundError",
        Some(EINVAL) => "OverconstrainedError",
        _ => match err.kind() {
            io::ErrorKind::NotFound => "NotFoundError",
            io::ErrorKind::PermissionDenied => "NotAllowedError",
            io::ErrorKind::InvalidInput | io::ErrorKind::Unsupported => "OverconstrainedError",
            _ => "NotReadableError",
        },
    };
    DeviceFailure::new(name, format!("{}: {}", context, err))
}

/// Device node for a selector id: absolute paths as given, anything else
/// under `/dev`.
#[cfg_attr(not(feature = "ingest-v4l2"), allow(dead_code))]
pub(crate) fn node_for_id(id: &str) -> PathBuf {
    if id.starts_with('/') {
        PathBuf::from(id)
    } else {
        PathBuf::from("/dev").join(id)
    }
}

#[cfg_attr(not(feature = "ingest-v4l2"), allow(dead_code))]
pub(crate) fn node_for_index(index: u32) -> PathBuf {
    PathBuf::from(format!("/dev/video{}", index))
}

/// Walk the constraint chain for `selector` until one attempt succeeds.
///
/// When every attempt fails the last classified error is returned.
pub fn acquire_live_device(
    backend: &dyn DeviceBackend,
    selector: &DeviceSelector,
    cancel: &CancelToken,
) -> Result<DeviceStream, SourceError> {
    let chain = constraint_chain(selector);
    let mut last_error = SourceError::DeviceNotFound(format!("no device for {}", selector));
    for (attempt, constraints) in chain.iter().enumerate() {
        cancel.check()?;
        log::debug!(
            "{}: attempt {}/{} with {}",
            backend.name(),
            attempt + 1,
            chain.len(),
            constraints
        );
        match backend.open(constraints) {
            Ok(stream) => {
                if cancel.is_cancelled() {
                    drop_stream(stream);
                    return Err(SourceError::Aborted);
                }
                log::info!("{}: opened {} with {}", backend.name(), selector, constraints);
                return Ok(stream);
            }
            Err(failure) => {
                let error = SourceError::classify(&failure.name, failure.message);
                log::warn!(
                    "{}: {} refused ({}): {}",
                    backend.name(),
                    constraints,
                    failure.name,
                    error
                );
                if !error.is_recoverable() {
                    return Err(error);
                }
                last_error = error;
            }
        }
    }
    Err(last_error)
}

fn drop_stream(mut stream: DeviceStream) {
    for track in &mut stream.tracks {
        if let Err(err) = track.stop() {
            log::warn!("stop track {} after abort: {:#}", track.label(), err);
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic backend (stub://) for tests and headless runs
// ----------------------------------------------------------------------------

/// In-process camera that produces a moving gradient.
///
/// Failures can be scripted per constraint so fallback behaviour is
/// observable, and the number of live tracks is tracked so leaks are too.
pub struct SyntheticDeviceBackend {
    devices: Vec<String>,
    width: u32,
    height: u32,
    refusals: HashMap<Constraints, String>,
    live_tracks: Arc<AtomicUsize>,
    opened: AtomicUsize,
}

impl SyntheticDeviceBackend {
    pub fn new() -> Self {
        Self {
            devices: vec!["synthetic-0".to_string()],
            width: 1280,
            height: 720,
            refusals: HashMap::new(),
            live_tracks: Arc::new(AtomicUsize::new(0)),
            opened: AtomicUsize::new(0),
        }
    }

    pub fn with_devices(mut self, devices: &[&str]) -> Self {
        self.devices = devices.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Make `constraints` fail with the platform failure `name`.
    pub fn refuse(mut self, constraints: Constraints, name: &str) -> Self {
        self.refusals.insert(constraints, name.to_string());
        self
    }

    pub fn live_tracks(&self) -> usize {
        self.live_tracks.load(Ordering::SeqCst)
    }

    /// Number of successful opens.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    fn resolve(&self, constraints: &Constraints) -> Result<(String, u32, u32), DeviceFailure> {
        let first = || {
            self.devices
                .first()
                .cloned()
                .ok_or_else(|| DeviceFailure::new("NotFoundError", "no capture devices"))
        };
        match constraints {
            Constraints::ExactId(id) => {
                if self.devices.contains(id) {
                    Ok((id.clone(), self.width, self.height))
                } else {
                    Err(DeviceFailure::new(
                        "OverconstrainedError",
                        format!("device {} not present", id),
                    ))
                }
            }
            Constraints::IdealId(id) => {
                let device = if self.devices.contains(id) {
                    id.clone()
                } else {
                    first()?
                };
                Ok((device, self.width, self.height))
            }
            Constraints::Index(index) => self
                .devices
                .get(*index as usize)
                .cloned()
                .map(|d| (d, self.width, self.height))
                .ok_or_else(|| {
                    DeviceFailure::new("NotFoundError", format!("no device at index {}", index))
                }),
            Constraints::AnyCamera => Ok((first()?, self.width, self.height)),
            Constraints::LowResolution { width, height } => Ok((first()?, *width, *height)),
        }
    }
}

impl Default for SyntheticDeviceBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBackend for SyntheticDeviceBackend {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn open(&self, constraints: &Constraints) -> Result<DeviceStream, DeviceFailure> {
        if let Some(name) = self.refusals.get(constraints) {
            return Err(DeviceFailure::new(
                name.clone(),
                format!("scripted refusal of {}", constraints),
            ));
        }
        let (device, width, height) = self.resolve(constraints)?;
        let live = Arc::new(AtomicBool::new(true));
        self.live_tracks.fetch_add(1, Ordering::SeqCst);
        self.opened.fetch_add(1, Ordering::SeqCst);
        let track = SyntheticTrack {
            label: device,
            live: Arc::clone(&live),
            counter: Arc::clone(&self.live_tracks),
        };
        Ok(DeviceStream {
            tracks: vec![Box::new(track)],
            frames: Box::new(SyntheticFrames {
                width,
                height,
                frame_count: 0,
                live,
            }),
        })
    }
}

struct SyntheticTrack {
    label: String,
    live: Arc<AtomicBool>,
    counter: Arc<AtomicUsize>,
}

impl MediaTrack for SyntheticTrack {
    fn label(&self) -> &str {
        &self.label
    }

    fn stop(&mut self) -> Result<()> {
        if self.live.swap(false, Ordering::SeqCst) {
            self.counter.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

struct SyntheticFrames {
    width: u32,
    height: u32,
    frame_count: u64,
    live: Arc<AtomicBool>,
}

impl FrameSource for SyntheticFrames {
    fn next_frame(&mut self) -> Result<Option<VideoFrame>> {
        if !self.live.load(Ordering::SeqCst) {
            return Err(anyhow!("synthetic track stopped"));
        }
        self.frame_count += 1;
        let pixel_count = (self.width as usize) * (self.height as usize) * 3;
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count) % 256) as u8;
        }
        Ok(Some(VideoFrame::new(
            pixels,
            self.width,
            self.height,
            crate::now_ms()?,
        )?))
    }
}
