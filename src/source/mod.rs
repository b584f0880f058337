//! Video source controller.
//!
//! Exactly one video source is active at a time. The controller is a small
//! state machine:
//!
//! ```text
//! Idle -> Acquiring(kind, generation) -> Streaming(kind, handle) -> Idle
//!                    \-> Failed(kind, error) -> Idle
//! ```
//!
//! Acquisition runs off the tick thread (see `task`). Every request bumps a
//! generation counter and records the operator's intended kind; a result is
//! only committed when both still match at completion time. Anything else is
//! a stale acquisition: its handle is released on the spot and nothing is
//! committed.
//!
//! Leaving `Streaming` always runs the full release sequence (stop device
//! tracks, cancel the snapshot poller, detach the render target, remove any
//! downloaded temp file). A failing step is logged and the next step still
//! runs.

use anyhow::Result;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::frame::{FrameSource, VideoFrame};

pub mod device;
#[cfg(feature = "ingest-file-ffmpeg")]
mod ffmpeg;
pub mod file;
pub mod mjpeg;
pub mod remote;
pub mod task;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

pub use device::{
    acquire_live_device, constraint_chain, device_backend, Constraints, DeviceBackend,
    DeviceBackendChoice, DeviceFailure, DeviceSelector, DeviceStream, MediaTrack,
    SyntheticDeviceBackend,
};
pub use file::{open_local_file, LocalFileSource};
pub use remote::{
    acquire_remote_proxied_video, FramePoller, HttpFetcher, ProbeReport, RemoteFetcher,
};
pub use task::{AcquisitionTask, TaskOutcome};

// ----------------------------------------------------------------------------
// Kinds
// ----------------------------------------------------------------------------

/// Which of the three origins a source comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VideoSourceKind {
    LiveDevice,
    LocalFile,
    RemoteProxiedVideo,
}

/// A concrete source request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceKind {
    LiveDevice(DeviceSelector),
    LocalFile(PathBuf),
    RemoteProxiedVideo(String),
}

impl SourceKind {
    pub fn tag(&self) -> VideoSourceKind {
        match self {
            SourceKind::LiveDevice(_) => VideoSourceKind::LiveDevice,
            SourceKind::LocalFile(_) => VideoSourceKind::LocalFile,
            SourceKind::RemoteProxiedVideo(_) => VideoSourceKind::RemoteProxiedVideo,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::LiveDevice(selector) => write!(f, "device {}", selector),
            SourceKind::LocalFile(path) => write!(f, "file {}", path.display()),
            SourceKind::RemoteProxiedVideo(url) => write!(f, "remote {}", url),
        }
    }
}

// ----------------------------------------------------------------------------
// Errors
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("unsupported constraints: {0}")]
    UnsupportedConstraints(String),
    #[error("probe failed: {0}")]
    ProbeFailed(String),
    #[error("playback failed: {0}")]
    PlaybackFailed(String),
    #[error("acquisition timed out after {0} ms")]
    TimedOut(u64),
    #[error("acquisition aborted")]
    Aborted,
    #[error("i/o error: {0}")]
    Io(String),
}

impl SourceError {
    /// Map a platform failure name onto an error kind.
    pub fn classify(name: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match name {
            "NotAllowedError" | "SecurityError" | "PermissionDeniedError" => {
                SourceError::PermissionDenied(message)
            }
            "NotFoundError" | "DevicesNotFoundError" => SourceError::DeviceNotFound(message),
            "NotReadableError" | "TrackStartError" => SourceError::DeviceBusy(message),
            "OverconstrainedError" | "ConstraintNotSatisfiedError" => {
                SourceError::UnsupportedConstraints(message)
            }
            _ => SourceError::PlaybackFailed(format!("{}: {}", name, message)),
        }
    }

    /// Device failures that advance the constraint fallback chain instead of
    /// failing the acquisition.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SourceError::PermissionDenied(_)
                | SourceError::DeviceNotFound(_)
                | SourceError::DeviceBusy(_)
                | SourceError::UnsupportedConstraints(_)
        )
    }

    /// Text suitable for showing to the operator.
    pub fn operator_message(&self) -> String {
        match self {
            SourceError::PermissionDenied(_) => {
                "Camera access was denied. Grant camera permission and retry.".to_string()
            }
            SourceError::DeviceNotFound(_) => {
                "No camera was found. Check that a camera is connected.".to_string()
            }
            SourceError::DeviceBusy(_) => {
                "The camera is in use by another application.".to_string()
            }
            SourceError::UnsupportedConstraints(_) => {
                "The camera does not support the requested settings.".to_string()
            }
            SourceError::ProbeFailed(reason) => {
                format!("The remote video is not reachable ({}).", reason)
            }
            SourceError::PlaybackFailed(reason) => {
                format!("The video could not be played ({}).", reason)
            }
            SourceError::TimedOut(ms) => {
                format!("The video source did not respond within {} ms.", ms)
            }
            SourceError::Aborted => "The video source request was cancelled.".to_string(),
            SourceError::Io(reason) => format!("The video could not be read ({}).", reason),
        }
    }
}

// ----------------------------------------------------------------------------
// Cancellation
// ----------------------------------------------------------------------------

/// Cooperative cancellation flag shared with acquisition workers and pollers.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), SourceError> {
        if self.is_cancelled() {
            Err(SourceError::Aborted)
        } else {
            Ok(())
        }
    }
}

// ----------------------------------------------------------------------------
// Handles and release
// ----------------------------------------------------------------------------

/// Whatever presents the active source (a video element, a preview window,
/// the daemon's frame pump).
pub trait RenderTarget: Send {
    fn attach(&mut self, kind: &SourceKind) -> Result<()>;

    /// Clear the target's source reference.
    fn detach(&mut self) -> Result<()>;
}

/// Render target that only remembers what it is showing.
#[derive(Debug, Default)]
pub struct HeadlessTarget {
    attached: Option<SourceKind>,
}

impl HeadlessTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attached(&self) -> Option<&SourceKind> {
        self.attached.as_ref()
    }
}

impl RenderTarget for HeadlessTarget {
    fn attach(&mut self, kind: &SourceKind) -> Result<()> {
        self.attached = Some(kind.clone());
        Ok(())
    }

    fn detach(&mut self) -> Result<()> {
        self.attached = None;
        Ok(())
    }
}

/// Resources held by one acquired source.
pub struct SourceHandle {
    kind: SourceKind,
    frames: Box<dyn FrameSource>,
    tracks: Vec<Box<dyn MediaTrack>>,
    poller: Option<FramePoller>,
    temp_file: Option<tempfile::TempPath>,
}

impl SourceHandle {
    pub fn new(kind: SourceKind, frames: Box<dyn FrameSource>) -> Self {
        Self {
            kind,
            frames,
            tracks: Vec::new(),
            poller: None,
            temp_file: None,
        }
    }

    pub fn with_tracks(mut self, tracks: Vec<Box<dyn MediaTrack>>) -> Self {
        self.tracks = tracks;
        self
    }

    pub fn with_poller(mut self, poller: FramePoller) -> Self {
        self.poller = Some(poller);
        self
    }

    pub fn with_temp_file(mut self, path: tempfile::TempPath) -> Self {
        self.temp_file = Some(path);
        self
    }

    pub fn kind(&self) -> &SourceKind {
        &self.kind
    }

    pub fn live_track_count(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_live()).count()
    }

    pub fn has_poller(&self) -> bool {
        self.poller.is_some()
    }

    /// Local copy backing a downloaded remote source.
    pub fn temp_file_path(&self) -> Option<&std::path::Path> {
        self.temp_file.as_deref()
    }

    pub fn next_frame(&mut self) -> Result<Option<VideoFrame>> {
        self.frames.next_frame()
    }

    /// Run the release sequence. Every step runs even when an earlier one
    /// fails; failures are logged and counted.
    pub fn release(&mut self, target: Option<&mut dyn RenderTarget>) -> ReleaseReport {
        let mut report = ReleaseReport::default();

        for mut track in self.tracks.drain(..) {
            if let Err(err) = track.stop() {
                log::warn!("release {}: stop track {}: {:#}", self.kind, track.label(), err);
                report.failures.push(format!("track {}: {}", track.label(), err));
            } else {
                report.tracks_stopped += 1;
            }
        }

        if let Some(mut poller) = self.poller.take() {
            poller.cancel();
            report.poller_cancelled = true;
        }

        if let Some(target) = target {
            if let Err(err) = target.detach() {
                log::warn!("release {}: detach render target: {:#}", self.kind, err);
                report.failures.push(format!("detach: {}", err));
            }
        }

        if let Some(path) = self.temp_file.take() {
            let display = path.display().to_string();
            if let Err(err) = path.close() {
                log::warn!("release {}: remove temp file {}: {}", self.kind, display, err);
                report.failures.push(format!("temp file {}: {}", display, err));
            }
        }

        report
    }
}

impl Drop for SourceHandle {
    fn drop(&mut self) {
        if !self.tracks.is_empty() || self.poller.is_some() || self.temp_file.is_some() {
            log::debug!("source handle for {} dropped without release", self.kind);
            self.release(None);
        }
    }
}

impl fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceHandle")
            .field("kind", &self.kind)
            .field("tracks", &self.tracks.len())
            .field("poller", &self.poller.is_some())
            .field("temp_file", &self.temp_file.is_some())
            .finish()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    pub tracks_stopped: usize,
    pub poller_cancelled: bool,
    pub failures: Vec<String>,
}

// ----------------------------------------------------------------------------
// Acquisition
// ----------------------------------------------------------------------------

/// Ticket for one in-flight acquisition.
#[derive(Clone, Debug)]
pub struct Acquisition {
    generation: u64,
    kind: SourceKind,
    cancel: CancelToken,
}

impl Acquisition {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn kind(&self) -> &SourceKind {
        &self.kind
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

#[derive(Clone, Debug)]
pub struct AcquireSettings {
    /// Snapshot polling period for `image/jpeg` remote feeds.
    pub poll_interval: Duration,
    /// Upper bound on a remote download used by the local-file fallback.
    pub max_download_bytes: usize,
    /// Playback rate for local files.
    pub file_fps: u32,
}

impl Default for AcquireSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            max_download_bytes: 64 * 1024 * 1024,
            file_fps: 10,
        }
    }
}

/// Performs the blocking work for each source kind.
#[derive(Clone)]
pub struct SourceAcquirer {
    devices: Arc<dyn DeviceBackend>,
    fetcher: Arc<dyn RemoteFetcher>,
    settings: AcquireSettings,
}

impl SourceAcquirer {
    pub fn new(
        devices: Arc<dyn DeviceBackend>,
        fetcher: Arc<dyn RemoteFetcher>,
        settings: AcquireSettings,
    ) -> Self {
        Self {
            devices,
            fetcher,
            settings,
        }
    }

    pub fn acquire(
        &self,
        kind: &SourceKind,
        cancel: &CancelToken,
    ) -> Result<SourceHandle, SourceError> {
        cancel.check()?;
        match kind {
            SourceKind::LiveDevice(selector) => {
                let stream = acquire_live_device(self.devices.as_ref(), selector, cancel)?;
                Ok(SourceHandle::new(kind.clone(), stream.frames).with_tracks(stream.tracks))
            }
            SourceKind::LocalFile(path) => {
                let source = open_local_file(path, self.settings.file_fps)?;
                Ok(SourceHandle::new(kind.clone(), Box::new(source)))
            }
            SourceKind::RemoteProxiedVideo(url) => acquire_remote_proxied_video(
                Arc::clone(&self.fetcher),
                url,
                &self.settings,
                cancel,
            ),
        }
    }
}

// ----------------------------------------------------------------------------
// Controller
// ----------------------------------------------------------------------------

pub enum SourceState {
    Idle,
    Acquiring {
        kind: SourceKind,
        generation: u64,
    },
    Streaming {
        kind: SourceKind,
        handle: SourceHandle,
    },
    Failed {
        kind: SourceKind,
        error: SourceError,
    },
}

impl SourceState {
    pub fn name(&self) -> &'static str {
        match self {
            SourceState::Idle => "idle",
            SourceState::Acquiring { .. } => "acquiring",
            SourceState::Streaming { .. } => "streaming",
            SourceState::Failed { .. } => "failed",
        }
    }
}

impl fmt::Debug for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceState::Idle => write!(f, "Idle"),
            SourceState::Acquiring { kind, generation } => {
                write!(f, "Acquiring({}, #{})", kind, generation)
            }
            SourceState::Streaming { kind, .. } => write!(f, "Streaming({})", kind),
            SourceState::Failed { kind, error } => write!(f, "Failed({}, {})", kind, error),
        }
    }
}

/// What `complete` did with a finished acquisition.
#[derive(Debug, PartialEq, Eq)]
pub enum Commit {
    Committed,
    /// The operator moved on; any handle was released.
    Discarded,
    Failed(SourceError),
}

pub struct SourceController {
    state: SourceState,
    intended: Option<SourceKind>,
    generation: u64,
    in_flight: Option<CancelToken>,
    target: Box<dyn RenderTarget>,
}

impl SourceController {
    pub fn new(target: Box<dyn RenderTarget>) -> Self {
        Self {
            state: SourceState::Idle,
            intended: None,
            generation: 0,
            in_flight: None,
            target,
        }
    }

    pub fn state(&self) -> &SourceState {
        &self.state
    }

    /// Kind the operator most recently asked for.
    pub fn intended(&self) -> Option<&SourceKind> {
        self.intended.as_ref()
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.state, SourceState::Streaming { .. })
    }

    /// Switch to `kind`. Any held handle is released and any in-flight
    /// acquisition is cancelled before the new ticket is issued.
    pub fn request(&mut self, kind: SourceKind) -> Acquisition {
        self.intended = Some(kind.clone());
        self.release_current();
        self.generation += 1;
        let cancel = CancelToken::new();
        self.in_flight = Some(cancel.clone());
        log::info!("acquiring {} (#{})", kind, self.generation);
        self.state = SourceState::Acquiring {
            kind: kind.clone(),
            generation: self.generation,
        };
        Acquisition {
            generation: self.generation,
            kind,
            cancel,
        }
    }

    /// Settle a finished acquisition.
    pub fn complete(
        &mut self,
        acquisition: &Acquisition,
        outcome: Result<SourceHandle, SourceError>,
    ) -> Commit {
        let current = matches!(
            &self.state,
            SourceState::Acquiring { generation, .. } if *generation == acquisition.generation
        ) && self.intended.as_ref() == Some(&acquisition.kind);

        if !current {
            match outcome {
                Ok(mut handle) => {
                    let report = handle.release(None);
                    log::warn!(
                        "discarding stale acquisition of {} (#{}); stopped {} track(s)",
                        acquisition.kind,
                        acquisition.generation,
                        report.tracks_stopped
                    );
                }
                Err(err) => {
                    log::debug!(
                        "stale acquisition of {} (#{}) failed: {}",
                        acquisition.kind,
                        acquisition.generation,
                        err
                    );
                }
            }
            return Commit::Discarded;
        }

        self.in_flight = None;
        match outcome {
            Ok(mut handle) => {
                if let Err(err) = self.target.attach(&acquisition.kind) {
                    handle.release(Some(self.target.as_mut()));
                    let error = SourceError::PlaybackFailed(format!("attach: {:#}", err));
                    return self.fail(acquisition.kind.clone(), error);
                }
                log::info!("streaming {}", acquisition.kind);
                self.state = SourceState::Streaming {
                    kind: acquisition.kind.clone(),
                    handle,
                };
                Commit::Committed
            }
            Err(error) => self.fail(acquisition.kind.clone(), error),
        }
    }

    /// Explicit stop: release everything and return to `Idle`.
    pub fn stop(&mut self) {
        self.intended = None;
        self.release_current();
        self.state = SourceState::Idle;
    }

    /// Operator dismissed a failure.
    pub fn acknowledge_failure(&mut self) {
        if matches!(self.state, SourceState::Failed { .. }) {
            self.intended = None;
            self.state = SourceState::Idle;
        }
    }

    /// Next frame from the streaming source, if any.
    ///
    /// `Ok(None)` means no frame is due yet. A read error means the source
    /// ended: the handle is released and the controller moves to `Failed`
    /// with `PlaybackFailed`, which the operator has to retry explicitly.
    pub fn next_frame(&mut self) -> Result<Option<VideoFrame>, SourceError> {
        let SourceState::Streaming { handle, .. } = &mut self.state else {
            return Ok(None);
        };
        match handle.next_frame() {
            Ok(frame) => Ok(frame),
            Err(err) => {
                let previous = std::mem::replace(&mut self.state, SourceState::Idle);
                let SourceState::Streaming { kind, mut handle } = previous else {
                    return Ok(None);
                };
                let report = handle.release(Some(self.target.as_mut()));
                log::info!(
                    "released {} after read error ({} track(s) stopped, {} failure(s))",
                    kind,
                    report.tracks_stopped,
                    report.failures.len()
                );
                let error = SourceError::PlaybackFailed(format!("{}: {:#}", kind, err));
                self.fail(kind, error.clone());
                Err(error)
            }
        }
    }

    fn fail(&mut self, kind: SourceKind, error: SourceError) -> Commit {
        log::warn!("source {} failed: {}", kind, error);
        self.state = SourceState::Failed {
            kind,
            error: error.clone(),
        };
        Commit::Failed(error)
    }

    fn release_current(&mut self) {
        if let Some(cancel) = self.in_flight.take() {
            cancel.cancel();
        }
        let previous = std::mem::replace(&mut self.state, SourceState::Idle);
        if let SourceState::Streaming { kind, mut handle } = previous {
            let report = handle.release(Some(self.target.as_mut()));
            log::info!(
                "released {} ({} track(s) stopped, {} failure(s))",
                kind,
                report.tracks_stopped,
                report.failures.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct NoFrames;

    impl FrameSource for NoFrames {
        fn next_frame(&mut self) -> Result<Option<VideoFrame>> {
            Ok(None)
        }
    }

    struct FailingTrack;

    impl MediaTrack for FailingTrack {
        fn label(&self) -> &str {
            "broken"
        }

        fn stop(&mut self) -> Result<()> {
            Err(anyhow!("track refused to stop"))
        }

        fn is_live(&self) -> bool {
            true
        }
    }

    #[derive(Clone, Default)]
    struct RecordingTarget {
        detaches: Arc<AtomicUsize>,
        attached: Arc<Mutex<Vec<SourceKind>>>,
    }

    impl RenderTarget for RecordingTarget {
        fn attach(&mut self, kind: &SourceKind) -> Result<()> {
            self.attached.lock().unwrap().push(kind.clone());
            Ok(())
        }

        fn detach(&mut self) -> Result<()> {
            self.detaches.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn device_kind() -> SourceKind {
        SourceKind::LiveDevice(DeviceSelector::Default)
    }

    fn file_kind() -> SourceKind {
        SourceKind::LocalFile(PathBuf::from("/tmp/clip.mjpeg"))
    }

    fn device_handle(backend: &SyntheticDeviceBackend) -> SourceHandle {
        let stream = acquire_live_device(backend, &DeviceSelector::Default, &CancelToken::new())
            .unwrap();
        SourceHandle::new(device_kind(), stream.frames).with_tracks(stream.tracks)
    }

    #[test]
    fn classify_maps_platform_names() {
        assert!(matches!(
            SourceError::classify("NotAllowedError", "x"),
            SourceError::PermissionDenied(_)
        ));
        assert!(matches!(
            SourceError::classify("NotReadableError", "x"),
            SourceError::DeviceBusy(_)
        ));
        assert!(matches!(
            SourceError::classify("OverconstrainedError", "x"),
            SourceError::UnsupportedConstraints(_)
        ));
        let other = SourceError::classify("AbortError", "x");
        assert!(matches!(other, SourceError::PlaybackFailed(_)));
        assert!(!other.is_recoverable());
    }

    #[test]
    fn commit_then_stop_releases_everything() {
        let backend = SyntheticDeviceBackend::new();
        let target = RecordingTarget::default();
        let mut controller = SourceController::new(Box::new(target.clone()));

        let ticket = controller.request(device_kind());
        assert_eq!(controller.state().name(), "acquiring");
        let handle = device_handle(&backend);
        assert_eq!(backend.live_tracks(), 1);
        assert_eq!(controller.complete(&ticket, Ok(handle)), Commit::Committed);
        assert!(controller.is_streaming());
        assert_eq!(target.attached.lock().unwrap().len(), 1);

        controller.stop();
        assert_eq!(controller.state().name(), "idle");
        assert_eq!(backend.live_tracks(), 0);
        assert_eq!(target.detaches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn switch_during_pending_device_acquisition_leaves_no_live_tracks() {
        let backend = SyntheticDeviceBackend::new();
        let mut controller = SourceController::new(Box::new(HeadlessTarget::new()));

        let device_ticket = controller.request(device_kind());
        let file_ticket = controller.request(file_kind());
        assert!(device_ticket.cancel_token().is_cancelled());
        assert_eq!(controller.intended(), Some(&file_kind()));

        let file_handle = SourceHandle::new(file_kind(), Box::new(NoFrames));
        assert_eq!(
            controller.complete(&file_ticket, Ok(file_handle)),
            Commit::Committed
        );

        // The slow device request resolves after the switch.
        let late = device_handle(&backend);
        assert_eq!(backend.live_tracks(), 1);
        assert_eq!(controller.complete(&device_ticket, Ok(late)), Commit::Discarded);
        assert_eq!(backend.live_tracks(), 0);
        assert!(matches!(
            controller.state(),
            SourceState::Streaming { kind, .. } if *kind == file_kind()
        ));
    }

    #[test]
    fn same_kind_requested_twice_only_commits_latest() {
        let backend = SyntheticDeviceBackend::new();
        let mut controller = SourceController::new(Box::new(HeadlessTarget::new()));
        let first = controller.request(device_kind());
        let second = controller.request(device_kind());
        assert_eq!(
            controller.complete(&first, Ok(device_handle(&backend))),
            Commit::Discarded
        );
        assert_eq!(
            controller.complete(&second, Ok(device_handle(&backend))),
            Commit::Committed
        );
        assert_eq!(backend.live_tracks(), 1);
    }

    #[test]
    fn failure_then_acknowledge_returns_to_idle() {
        let mut controller = SourceController::new(Box::new(HeadlessTarget::new()));
        let ticket = controller.request(file_kind());
        let err = SourceError::PlaybackFailed("unsupported container".into());
        assert_eq!(
            controller.complete(&ticket, Err(err.clone())),
            Commit::Failed(err)
        );
        assert_eq!(controller.state().name(), "failed");
        controller.acknowledge_failure();
        assert_eq!(controller.state().name(), "idle");
    }

    #[test]
    fn release_continues_after_failing_step() {
        let backend = SyntheticDeviceBackend::new();
        let stream =
            acquire_live_device(&backend, &DeviceSelector::Default, &CancelToken::new()).unwrap();
        let mut tracks: Vec<Box<dyn MediaTrack>> = vec![Box::new(FailingTrack)];
        tracks.extend(stream.tracks);
        let mut handle = SourceHandle::new(device_kind(), stream.frames).with_tracks(tracks);
        let mut target = RecordingTarget::default();

        let report = handle.release(Some(&mut target));
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.tracks_stopped, 1);
        assert_eq!(backend.live_tracks(), 0);
        assert_eq!(target.detaches.load(Ordering::SeqCst), 1);
    }

    struct EndingFrames {
        remaining: usize,
    }

    impl FrameSource for EndingFrames {
        fn next_frame(&mut self) -> Result<Option<VideoFrame>> {
            if self.remaining == 0 {
                return Err(anyhow!("stream ended"));
            }
            self.remaining -= 1;
            Ok(Some(VideoFrame::filled(4, 4, [0, 0, 0], 0)?))
        }
    }

    #[test]
    fn ended_stream_fails_and_releases() {
        let backend = SyntheticDeviceBackend::new();
        let stream =
            acquire_live_device(&backend, &DeviceSelector::Default, &CancelToken::new()).unwrap();
        let target = RecordingTarget::default();
        let mut controller = SourceController::new(Box::new(target.clone()));
        let ticket = controller.request(device_kind());
        let handle = SourceHandle::new(device_kind(), Box::new(EndingFrames { remaining: 1 }))
            .with_tracks(stream.tracks);
        assert_eq!(controller.complete(&ticket, Ok(handle)), Commit::Committed);

        assert!(controller.next_frame().unwrap().is_some());
        let err = controller.next_frame().unwrap_err();
        assert!(matches!(err, SourceError::PlaybackFailed(_)));
        assert!(!err.is_recoverable());
        assert!(matches!(
            controller.state(),
            SourceState::Failed { kind, error } if *kind == device_kind() && *error == err
        ));
        assert_eq!(backend.live_tracks(), 0);
        assert_eq!(target.detaches.load(Ordering::SeqCst), 1);

        // Stays failed until the operator acknowledges it.
        assert!(controller.next_frame().unwrap().is_none());
        assert_eq!(controller.state().name(), "failed");
        controller.acknowledge_failure();
        assert_eq!(controller.state().name(), "idle");
    }

    #[test]
    fn idle_read_is_not_a_failure() {
        let mut controller = SourceController::new(Box::new(HeadlessTarget::new()));
        let ticket = controller.request(file_kind());
        let handle = SourceHandle::new(file_kind(), Box::new(NoFrames));
        controller.complete(&ticket, Ok(handle));
        for _ in 0..3 {
            assert!(controller.next_frame().unwrap().is_none());
        }
        assert!(controller.is_streaming());
    }
}
