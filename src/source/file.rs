//! Local file source.
//!
//! JPEG stills (shown as a static feed) and MJPEG, i.e. concatenated JPEG
//! images, decode in-process. Other containers (MP4, WebM, ...) go through
//! FFmpeg when built with `ingest-file-ffmpeg`, and are a `PlaybackFailed`
//! otherwise. Playback loops at the configured rate.

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::mjpeg::{decode_jpeg, frame_interval, split_jpegs};
use super::SourceError;
use crate::frame::{FrameSource, VideoFrame};

const MAX_FILE_BYTES: u64 = 512 * 1024 * 1024;

pub struct LocalFileSource {
    path: PathBuf,
    playback: Playback,
    target_fps: u32,
    last_frame_at: Option<Instant>,
    frames_played: u64,
}

enum Playback {
    Jpeg {
        frames: Vec<Vec<u8>>,
        position: usize,
    },
    #[cfg(feature = "ingest-file-ffmpeg")]
    Container(super::ffmpeg::ContainerPlayback),
}

/// Open `path` and verify its first frame decodes.
pub fn open_local_file(path: &Path, target_fps: u32) -> Result<LocalFileSource, SourceError> {
    let metadata = std::fs::metadata(path)
        .map_err(|err| SourceError::Io(format!("{}: {}", path.display(), err)))?;
    if !metadata.is_file() {
        return Err(SourceError::Io(format!("{} is not a file", path.display())));
    }
    if metadata.len() > MAX_FILE_BYTES {
        return Err(SourceError::PlaybackFailed(format!(
            "{} is {} bytes; limit is {}",
            path.display(),
            metadata.len(),
            MAX_FILE_BYTES
        )));
    }
    let bytes = std::fs::read(path)
        .map_err(|err| SourceError::Io(format!("{}: {}", path.display(), err)))?;
    let frames = split_jpegs(&bytes);
    let playback = match frames.first() {
        Some(first) => {
            decode_jpeg(first).map_err(|err| {
                SourceError::PlaybackFailed(format!("{}: {:#}", path.display(), err))
            })?;
            log::info!(
                "opened {} ({} frame(s) at {} fps)",
                path.display(),
                frames.len(),
                target_fps
            );
            Playback::Jpeg {
                frames,
                position: 0,
            }
        }
        None => open_container(path)?,
    };
    Ok(LocalFileSource {
        path: path.to_path_buf(),
        playback,
        target_fps,
        last_frame_at: None,
        frames_played: 0,
    })
}

#[cfg(feature = "ingest-file-ffmpeg")]
fn open_container(path: &Path) -> Result<Playback, SourceError> {
    super::ffmpeg::ContainerPlayback::open(path)
        .map(Playback::Container)
        .map_err(|err| SourceError::PlaybackFailed(format!("{}: {:#}", path.display(), err)))
}

#[cfg(not(feature = "ingest-file-ffmpeg"))]
fn open_container(path: &Path) -> Result<Playback, SourceError> {
    Err(SourceError::PlaybackFailed(format!(
        "{}: not JPEG or MJPEG; other containers need a build with --features ingest-file-ffmpeg",
        path.display()
    )))
}

impl LocalFileSource {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Frames per loop, when known up front (JPEG and MJPEG files).
    pub fn frame_count(&self) -> Option<usize> {
        match &self.playback {
            Playback::Jpeg { frames, .. } => Some(frames.len()),
            #[cfg(feature = "ingest-file-ffmpeg")]
            Playback::Container(_) => None,
        }
    }

    pub fn frames_played(&self) -> u64 {
        self.frames_played
    }
}

impl FrameSource for LocalFileSource {
    fn next_frame(&mut self) -> Result<Option<VideoFrame>> {
        let now = Instant::now();
        if let Some(last) = self.last_frame_at {
            if now.duration_since(last) < frame_interval(self.target_fps) {
                return Ok(None);
            }
        }
        let (pixels, width, height) = match &mut self.playback {
            Playback::Jpeg { frames, position } => {
                let jpeg = frames
                    .get(*position)
                    .ok_or_else(|| anyhow!("{} has no frames", self.path.display()))?;
                let decoded = decode_jpeg(jpeg)?;
                *position = (*position + 1) % frames.len();
                decoded
            }
            #[cfg(feature = "ingest-file-ffmpeg")]
            Playback::Container(playback) => match playback.next_decoded()? {
                Some(decoded) => decoded,
                None => return Ok(None),
            },
        };
        self.last_frame_at = Some(now);
        self.frames_played += 1;
        Ok(Some(VideoFrame::new(pixels, width, height, crate::now_ms()?)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::mjpeg::{encode_test_jpeg, with_exif_thumbnail};
    use std::io::Write;

    #[test]
    fn mjpeg_file_loops() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(&encode_test_jpeg(16, 8, [0, 0, 255]))?;
        file.write_all(&encode_test_jpeg(16, 8, [0, 255, 0]))?;
        file.flush()?;

        let mut source = open_local_file(file.path(), 0).map_err(|e| anyhow!("{}", e))?;
        assert_eq!(source.frame_count(), Some(2));
        for _ in 0..3 {
            let frame = source.next_frame()?.unwrap();
            assert_eq!((frame.width, frame.height), (16, 8));
        }
        assert_eq!(source.frames_played(), 3);
        Ok(())
    }

    #[test]
    fn paces_to_target_fps() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(&encode_test_jpeg(4, 4, [10, 10, 10]))?;
        file.flush()?;
        let mut source = open_local_file(file.path(), 1).map_err(|e| anyhow!("{}", e))?;
        assert!(source.next_frame()?.is_some());
        assert!(source.next_frame()?.is_none());
        Ok(())
    }

    #[test]
    fn unsupported_container_fails_playback() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(b"\x00\x00\x00\x18ftypmp42 not decodable here")?;
        file.flush()?;
        let err = open_local_file(file.path(), 10).err().unwrap();
        assert!(matches!(err, SourceError::PlaybackFailed(_)));
        Ok(())
    }

    #[cfg(not(feature = "ingest-file-ffmpeg"))]
    #[test]
    fn container_without_decoder_names_the_feature() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(b"\x1aE\xdf\xa3webm cluster")?;
        file.flush()?;
        match open_local_file(file.path(), 10) {
            Err(SourceError::PlaybackFailed(msg)) => assert!(msg.contains("ingest-file-ffmpeg")),
            other => panic!("expected PlaybackFailed, got {:?}", other.err()),
        }
        Ok(())
    }

    #[test]
    fn camera_still_with_exif_thumbnail_opens() -> Result<()> {
        let thumbnail = encode_test_jpeg(4, 4, [255, 255, 255]);
        let still = with_exif_thumbnail(&encode_test_jpeg(32, 24, [30, 60, 90]), &thumbnail);
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(&still)?;
        file.flush()?;

        let mut source = open_local_file(file.path(), 0).map_err(|e| anyhow!("{}", e))?;
        assert_eq!(source.frame_count(), Some(1));
        let frame = source.next_frame()?.unwrap();
        assert_eq!((frame.width, frame.height), (32, 24));
        Ok(())
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = open_local_file(Path::new("/nonexistent/clip.mjpeg"), 10)
            .err()
            .unwrap();
        assert!(matches!(err, SourceError::Io(_)));
    }
}
