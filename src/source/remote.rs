//! Remote proxied video.
//!
//! Acquisition always starts with a lightweight existence probe; a probe
//! failure ends the attempt before any playback is tried. The probe's content
//! type then picks the playback path:
//!
//! - `multipart/x-mixed-replace`: MJPEG stream read in place.
//! - `image/*`: snapshot endpoint, refreshed by a background `FramePoller`.
//! - other `video/*` containers: downloaded and decoded through FFmpeg
//!   (`ingest-file-ffmpeg`); refused up front without it.
//! - anything else: opened as a JPEG stream directly.
//!
//! When direct playback fails the resource is downloaded once into a temp
//! file and opened as a local file. The temp file lives in the handle and is
//! removed on release.

use anyhow::{anyhow, Context, Result};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use url::Url;

use super::file::open_local_file;
use super::mjpeg::{decode_jpeg, MjpegStream};
use super::{AcquireSettings, CancelToken, SourceError, SourceHandle, SourceKind};
use crate::frame::{FrameSource, VideoFrame};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeReport {
    pub status: u16,
    pub content_type: String,
}

/// HTTP side of remote acquisition.
pub trait RemoteFetcher: Send + Sync {
    /// Cheap existence check (no body transfer).
    fn probe(&self, url: &str) -> Result<ProbeReport, SourceError>;

    /// Open the resource as a byte stream.
    fn open_stream(&self, url: &str) -> Result<Box<dyn Read + Send>, SourceError>;

    /// Download the whole resource, bounded in size.
    fn fetch(&self, url: &str) -> Result<Vec<u8>, SourceError>;
}

pub struct HttpFetcher {
    agent: ureq::Agent,
    max_bytes: usize,
}

impl HttpFetcher {
    /// `timeout` bounds connecting and each read, so a live stream is never
    /// cut off while it keeps delivering data.
    pub fn new(timeout: Duration, max_bytes: usize) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .build();
        Self { agent, max_bytes }
    }

    fn get(&self, url: &str) -> Result<ureq::Response, SourceError> {
        self.agent.get(url).call().map_err(|err| match err {
            ureq::Error::Status(code, _) => {
                SourceError::PlaybackFailed(format!("GET {} returned {}", url, code))
            }
            ureq::Error::Transport(transport) => {
                SourceError::PlaybackFailed(format!("GET {}: {}", url, transport))
            }
        })
    }
}

impl RemoteFetcher for HttpFetcher {
    fn probe(&self, url: &str) -> Result<ProbeReport, SourceError> {
        let response = match self.agent.head(url).call() {
            Ok(response) => response,
            // Some camera proxies only implement GET.
            Err(ureq::Error::Status(405 | 501, _)) => self
                .agent
                .get(url)
                .call()
                .map_err(|err| probe_error(url, err))?,
            Err(err) => return Err(probe_error(url, err)),
        };
        Ok(ProbeReport {
            status: response.status(),
            content_type: response.content_type().to_ascii_lowercase(),
        })
    }

    fn open_stream(&self, url: &str) -> Result<Box<dyn Read + Send>, SourceError> {
        let reader: Box<dyn Read + Send> = self.get(url)?.into_reader();
        Ok(reader)
    }

    fn fetch(&self, url: &str) -> Result<Vec<u8>, SourceError> {
        let mut bytes = Vec::new();
        self.get(url)?
            .into_reader()
            .take(self.max_bytes as u64 + 1)
            .read_to_end(&mut bytes)
            .map_err(|err| SourceError::Io(format!("read {}: {}", url, err)))?;
        if bytes.len() > self.max_bytes {
            return Err(SourceError::PlaybackFailed(format!(
                "{} exceeds the {} byte download limit",
                url, self.max_bytes
            )));
        }
        if bytes.is_empty() {
            return Err(SourceError::PlaybackFailed(format!("{} returned no data", url)));
        }
        Ok(bytes)
    }
}

fn probe_error(url: &str, err: ureq::Error) -> SourceError {
    match err {
        ureq::Error::Status(401 | 403, _) => {
            SourceError::ProbeFailed(format!("{}: access forbidden", url))
        }
        ureq::Error::Status(404 | 410, _) => SourceError::ProbeFailed(format!("{}: not found", url)),
        ureq::Error::Status(code, _) => {
            SourceError::ProbeFailed(format!("{}: server answered {}", url, code))
        }
        ureq::Error::Transport(transport) => {
            SourceError::ProbeFailed(format!("{}: {}", url, transport))
        }
    }
}

/// Probe `url`, then play it directly, falling back once to a local download.
pub fn acquire_remote_proxied_video(
    fetcher: Arc<dyn RemoteFetcher>,
    url: &str,
    settings: &AcquireSettings,
    cancel: &CancelToken,
) -> Result<SourceHandle, SourceError> {
    let parsed = Url::parse(url)
        .map_err(|err| SourceError::ProbeFailed(format!("invalid url {}: {}", url, err)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(SourceError::ProbeFailed(format!(
            "unsupported scheme '{}'; expected http(s)",
            parsed.scheme()
        )));
    }

    let probe = fetcher.probe(url)?;
    log::debug!(
        "probe {}: status {} content-type {}",
        url,
        probe.status,
        probe.content_type
    );
    cancel.check()?;

    let kind = SourceKind::RemoteProxiedVideo(url.to_string());
    if needs_container_decoder(&probe.content_type) {
        if !cfg!(feature = "ingest-file-ffmpeg") {
            return Err(SourceError::PlaybackFailed(format!(
                "{}: {} needs a build with --features ingest-file-ffmpeg",
                url, probe.content_type
            )));
        }
        return open_downloaded(fetcher.as_ref(), url, settings, kind);
    }
    match open_direct(&fetcher, url, &probe, settings, kind.clone()) {
        Ok(handle) => Ok(handle),
        Err(err) => {
            log::warn!(
                "direct playback of {} failed ({}); retrying via download",
                url,
                err
            );
            cancel.check()?;
            open_downloaded(fetcher.as_ref(), url, settings, kind)
        }
    }
}

/// `video/*` other than motion JPEG cannot be split into JPEG frames.
fn needs_container_decoder(content_type: &str) -> bool {
    let media_type = content_type.split(';').next().unwrap_or("").trim();
    media_type.starts_with("video/")
        && !matches!(
            media_type,
            "video/mjpeg" | "video/x-mjpeg" | "video/x-motion-jpeg"
        )
}

fn open_direct(
    fetcher: &Arc<dyn RemoteFetcher>,
    url: &str,
    probe: &ProbeReport,
    settings: &AcquireSettings,
    kind: SourceKind,
) -> Result<SourceHandle, SourceError> {
    if probe.content_type.starts_with("image/") {
        let first = fetcher.fetch(url)?;
        verify_jpeg(url, &first)?;
        let latest = Arc::new(Mutex::new(Some(first)));
        let poller = FramePoller::spawn(
            Arc::clone(fetcher),
            url.to_string(),
            settings.poll_interval,
            Arc::clone(&latest),
        )?;
        return Ok(
            SourceHandle::new(kind, Box::new(PolledFrames { latest })).with_poller(poller)
        );
    }

    let reader = fetcher.open_stream(url)?;
    let reader: Box<dyn Read + Send> = if probe.content_type.starts_with("multipart/") {
        reader
    } else {
        Box::new(reader.take(settings.max_download_bytes as u64))
    };
    let mut stream = MjpegStream::new(reader);
    let first = stream
        .read_next_jpeg()
        .map_err(|err| SourceError::PlaybackFailed(format!("{}: {:#}", url, err)))?;
    verify_jpeg(url, &first)?;
    Ok(SourceHandle::new(
        kind,
        Box::new(StreamFrames {
            stream,
            pending: Some(first),
        }),
    ))
}

fn open_downloaded(
    fetcher: &dyn RemoteFetcher,
    url: &str,
    settings: &AcquireSettings,
    kind: SourceKind,
) -> Result<SourceHandle, SourceError> {
    let bytes = fetcher.fetch(url)?;
    let io_err = |err: std::io::Error| SourceError::Io(format!("download {}: {}", url, err));
    let mut file = tempfile::Builder::new()
        .prefix("perimeter-remote-")
        .suffix(".video")
        .tempfile()
        .map_err(io_err)?;
    file.write_all(&bytes).map_err(io_err)?;
    file.as_file().sync_all().map_err(io_err)?;
    let path = file.into_temp_path();
    let source = open_local_file(&path, settings.file_fps)?;
    log::info!("playing {} from local copy {}", url, path.display());
    Ok(SourceHandle::new(kind, Box::new(source)).with_temp_file(path))
}

fn verify_jpeg(url: &str, bytes: &[u8]) -> Result<(), SourceError> {
    decode_jpeg(bytes)
        .map(|_| ())
        .map_err(|err| SourceError::PlaybackFailed(format!("{}: {:#}", url, err)))
}

struct StreamFrames {
    stream: MjpegStream,
    pending: Option<Vec<u8>>,
}

impl FrameSource for StreamFrames {
    fn next_frame(&mut self) -> Result<Option<VideoFrame>> {
        let jpeg = match self.pending.take() {
            Some(jpeg) => jpeg,
            None => self.stream.read_next_jpeg()?,
        };
        let (pixels, width, height) = decode_jpeg(&jpeg)?;
        Ok(Some(VideoFrame::new(pixels, width, height, crate::now_ms()?)?))
    }
}

struct PolledFrames {
    latest: Arc<Mutex<Option<Vec<u8>>>>,
}

impl FrameSource for PolledFrames {
    fn next_frame(&mut self) -> Result<Option<VideoFrame>> {
        let jpeg = self
            .latest
            .lock()
            .map_err(|_| anyhow!("snapshot slot poisoned"))?
            .take();
        let Some(jpeg) = jpeg else {
            return Ok(None);
        };
        let (pixels, width, height) = decode_jpeg(&jpeg).context("decode polled snapshot")?;
        Ok(Some(VideoFrame::new(pixels, width, height, crate::now_ms()?)?))
    }
}

/// Background snapshot poller. Cancelling it is the "clear the polling
/// interval" step of the release sequence.
pub struct FramePoller {
    cancel: CancelToken,
    worker: Option<JoinHandle<()>>,
}

impl FramePoller {
    pub fn spawn(
        fetcher: Arc<dyn RemoteFetcher>,
        url: String,
        interval: Duration,
        latest: Arc<Mutex<Option<Vec<u8>>>>,
    ) -> Result<Self, SourceError> {
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let worker = std::thread::Builder::new()
            .name("frame-poller".to_string())
            .spawn(move || poll_loop(fetcher.as_ref(), &url, interval, &latest, &token))
            .map_err(|err| SourceError::Io(format!("spawn poller: {}", err)))?;
        Ok(Self {
            cancel,
            worker: Some(worker),
        })
    }

    pub fn cancel(&mut self) {
        self.cancel.cancel();
        // The worker notices within one sleep slice; no need to wait for it.
        self.worker.take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for FramePoller {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn poll_loop(
    fetcher: &dyn RemoteFetcher,
    url: &str,
    interval: Duration,
    latest: &Mutex<Option<Vec<u8>>>,
    cancel: &CancelToken,
) {
    let slice = Duration::from_millis(20).min(interval.max(Duration::from_millis(1)));
    while !cancel.is_cancelled() {
        let mut waited = Duration::ZERO;
        while waited < interval && !cancel.is_cancelled() {
            std::thread::sleep(slice);
            waited += slice;
        }
        if cancel.is_cancelled() {
            break;
        }
        match fetcher.fetch(url) {
            Ok(bytes) => {
                if let Ok(mut slot) = latest.lock() {
                    *slot = Some(bytes);
                }
            }
            Err(err) => log::debug!("snapshot poll of {} failed: {}", url, err),
        }
    }
    log::debug!("snapshot poller for {} stopped", url);
}
