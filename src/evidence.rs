//! Evidence capture collaborator.
//!
//! On every intrusion the monitor asks an `EvidenceSink` to keep a snapshot
//! of the frame it evaluated. The filesystem store writes a JPEG plus a JSON
//! sidecar next to it:
//!
//! ```text
//! <dir>/<timestamp_ms>-<zone>-<label>.jpg
//! <dir>/<timestamp_ms>-<zone>-<label>.json
//! ```
//!
//! Both files are written atomically (temp file, fsync, rename). The daemon
//! wraps the store in an `EvidenceWriter` so that work happens on a writer
//! thread instead of the tick thread.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::thread::JoinHandle;

use crate::frame::VideoFrame;

pub const DEFAULT_EVIDENCE_QUEUE: usize = 16;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvidenceMetadata {
    pub camera_id: String,
    pub zone_id: String,
    pub zone_name: String,
    pub object_label: String,
    pub confidence: f64,
    pub timestamp_ms: u64,
}

pub trait EvidenceSink {
    fn capture(&mut self, frame: &VideoFrame, metadata: &EvidenceMetadata) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    #[serde(flatten)]
    metadata: EvidenceMetadata,
    image_file: String,
    image_sha256: String,
    width: u32,
    height: u32,
}

pub struct FilesystemEvidenceStore {
    dir: PathBuf,
}

impl FilesystemEvidenceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("create evidence dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write the snapshot and sidecar; returns the image path.
    pub fn store(&self, frame: &VideoFrame, metadata: &EvidenceMetadata) -> Result<PathBuf> {
        let jpeg = encode_jpeg(frame)?;
        let digest = hex::encode(Sha256::digest(&jpeg));
        let stem = format!(
            "{}-{}-{}",
            metadata.timestamp_ms,
            sanitize_component(&metadata.zone_name),
            sanitize_component(&metadata.object_label)
        );
        let image_path = self.unused_path(&stem, "jpg");
        let sidecar_path = image_path.with_extension("json");
        let image_file = image_path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| anyhow!("evidence path has no file name"))?
            .to_string();

        write_atomic(&image_path, &jpeg)?;
        let sidecar = Sidecar {
            metadata: metadata.clone(),
            image_file,
            image_sha256: digest,
            width: frame.width,
            height: frame.height,
        };
        write_atomic(&sidecar_path, &serde_json::to_vec_pretty(&sidecar)?)?;
        log::info!(
            "evidence stored: {} ({} in {})",
            image_path.display(),
            metadata.object_label,
            metadata.zone_name
        );
        Ok(image_path)
    }

    fn unused_path(&self, stem: &str, extension: &str) -> PathBuf {
        let mut candidate = self.dir.join(format!("{}.{}", stem, extension));
        let mut n = 1;
        while candidate.exists() {
            candidate = self.dir.join(format!("{}-{}.{}", stem, n, extension));
            n += 1;
        }
        candidate
    }
}

impl EvidenceSink for FilesystemEvidenceStore {
    fn capture(&mut self, frame: &VideoFrame, metadata: &EvidenceMetadata) -> Result<()> {
        self.store(frame, metadata).map(|_| ())
    }
}

/// Queues snapshots for a `FilesystemEvidenceStore` running on its own
/// thread. When the queue is full the snapshot is dropped with a warning.
pub struct EvidenceWriter {
    sender: Option<SyncSender<(VideoFrame, EvidenceMetadata)>>,
    join: Option<JoinHandle<()>>,
    dropped: u64,
}

impl EvidenceWriter {
    pub fn spawn(store: FilesystemEvidenceStore, queue_depth: usize) -> Result<Self> {
        let (sender, receiver) = mpsc::sync_channel(queue_depth);
        let join = std::thread::Builder::new()
            .name("evidence-writer".to_string())
            .spawn(move || {
                for (frame, metadata) in receiver {
                    if let Err(err) = store.store(&frame, &metadata) {
                        log::error!(
                            "evidence for {} in {} not stored: {:#}",
                            metadata.object_label,
                            metadata.zone_name,
                            err
                        );
                    }
                }
                log::debug!("evidence writer for {} stopped", store.dir().display());
            })
            .context("spawn evidence writer")?;
        Ok(Self {
            sender: Some(sender),
            join: Some(join),
            dropped: 0,
        })
    }

    /// Snapshots discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Write out everything queued and wait for the writer thread.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.sender.take();
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("evidence writer thread panicked"))?;
        }
        Ok(())
    }
}

impl EvidenceSink for EvidenceWriter {
    fn capture(&mut self, frame: &VideoFrame, metadata: &EvidenceMetadata) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| anyhow!("evidence writer stopped"))?;
        match sender.try_send((frame.clone(), metadata.clone())) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                log::warn!(
                    "evidence queue full; dropped snapshot of {} in {} ({} dropped)",
                    metadata.object_label,
                    metadata.zone_name,
                    self.dropped
                );
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(anyhow!("evidence writer thread exited")),
        }
    }
}

impl Drop for EvidenceWriter {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::error!("{:#}", err);
        }
    }
}

/// Keeps metadata only; for tests and dry runs.
#[derive(Clone, Debug, Default)]
pub struct InMemoryEvidence {
    pub captured: Vec<EvidenceMetadata>,
}

impl InMemoryEvidence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EvidenceSink for InMemoryEvidence {
    fn capture(&mut self, _frame: &VideoFrame, metadata: &EvidenceMetadata) -> Result<()> {
        self.captured.push(metadata.clone());
        Ok(())
    }
}

fn encode_jpeg(frame: &VideoFrame) -> Result<Vec<u8>> {
    let image = image::RgbImage::from_raw(frame.width, frame.height, frame.pixels().to_vec())
        .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", frame.width, frame.height))?;
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, image::ImageFormat::Jpeg)
        .context("encode evidence jpeg")?;
    Ok(out.into_inner())
}

/// Lowercase `[a-z0-9_-]`, other characters folded to `_`, at most 48 chars.
fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .take(48)
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)?;
    Ok(())
}
