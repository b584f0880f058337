//! Container playback through FFmpeg (`ingest-file-ffmpeg`).
//!
//! The FFmpeg contexts stay on a dedicated decode thread; decoded RGB frames
//! come back over a small bounded channel. The file rewinds at its end so a
//! clip plays on a loop, like the JPEG path.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Packed RGB pixels with their width and height.
pub(crate) type DecodedFrame = (Vec<u8>, u32, u32);

const QUEUE_DEPTH: usize = 2;

pub(crate) struct ContainerPlayback {
    path: PathBuf,
    frames: Option<Receiver<Result<DecodedFrame>>>,
    pending: Option<DecodedFrame>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl ContainerPlayback {
    /// Open `path` and wait for its first frame, so an undecodable file fails
    /// here rather than during playback.
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let (sender, receiver) = mpsc::sync_channel(QUEUE_DEPTH);
        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let path = path.to_path_buf();
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("ffmpeg-decode".to_string())
                .spawn(move || {
                    let mut decoder = match ContainerDecoder::open(&path) {
                        Ok(decoder) => decoder,
                        Err(err) => {
                            let _ = sender.send(Err(err));
                            return;
                        }
                    };
                    while !stop.load(Ordering::SeqCst) {
                        let frame = decoder.decode_next();
                        let failed = frame.is_err();
                        if sender.send(frame).is_err() || failed {
                            break;
                        }
                    }
                    log::debug!("ffmpeg decoder for {} stopped", path.display());
                })
                .context("spawn ffmpeg decode thread")?
        };

        let mut playback = Self {
            path: path.to_path_buf(),
            frames: Some(receiver),
            pending: None,
            stop,
            worker: Some(worker),
        };
        let first = playback
            .frames
            .as_ref()
            .ok_or_else(|| anyhow!("ffmpeg decoder for {} is gone", path.display()))?
            .recv()
            .map_err(|_| anyhow!("ffmpeg decoder for {} exited", path.display()))??;
        log::info!(
            "opened {} with ffmpeg ({}x{})",
            path.display(),
            first.1,
            first.2
        );
        playback.pending = Some(first);
        Ok(playback)
    }

    /// `Ok(None)` while the decoder has not caught up.
    pub(crate) fn next_decoded(&mut self) -> Result<Option<DecodedFrame>> {
        if let Some(frame) = self.pending.take() {
            return Ok(Some(frame));
        }
        let frames = self
            .frames
            .as_ref()
            .ok_or_else(|| anyhow!("ffmpeg playback of {} closed", self.path.display()))?;
        match frames.try_recv() {
            Ok(frame) => frame.map(Some),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(anyhow!(
                "ffmpeg decoder for {} exited",
                self.path.display()
            )),
        }
    }
}

impl Drop for ContainerPlayback {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // Unblocks a decoder waiting on a full queue.
        self.frames.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::warn!("ffmpeg decoder for {} panicked", self.path.display());
            }
        }
    }
}

struct ContainerDecoder {
    path: PathBuf,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    draining: bool,
    frames_decoded: u64,
}

impl ContainerDecoder {
    fn open(path: &Path) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&path)
            .with_context(|| format!("open {} with ffmpeg", path.display()))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("{} has no video track", path.display()))?;
        let stream_index = input_stream.index();
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        Ok(Self {
            path: path.to_path_buf(),
            input,
            stream_index,
            decoder,
            scaler,
            draining: false,
            frames_decoded: 0,
        })
    }

    fn decode_next(&mut self) -> Result<DecodedFrame> {
        let mut decoded = ffmpeg::frame::Video::empty();
        let mut rewound = false;
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                let mut rgb = ffmpeg::frame::Video::empty();
                self.scaler
                    .run(&decoded, &mut rgb)
                    .context("scale frame to RGB")?;
                self.frames_decoded += 1;
                return frame_to_pixels(&rgb);
            }
            if self.draining {
                if rewound || self.frames_decoded == 0 {
                    return Err(anyhow!("{} ended without frames", self.path.display()));
                }
                self.input
                    .seek(0, ..)
                    .with_context(|| format!("rewind {}", self.path.display()))?;
                self.decoder.flush();
                self.draining = false;
                rewound = true;
                continue;
            }
            match self.next_packet() {
                Some(packet) => self
                    .decoder
                    .send_packet(&packet)
                    .context("send packet to ffmpeg decoder")?,
                None => {
                    self.decoder.send_eof().context("drain ffmpeg decoder")?;
                    self.draining = true;
                }
            }
        }
    }

    fn next_packet(&mut self) -> Option<ffmpeg::Packet> {
        let stream_index = self.stream_index;
        self.input
            .packets()
            .find(|(stream, _)| stream.index() == stream_index)
            .map(|(_, packet)| packet)
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<DecodedFrame> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        let len = row_bytes * height as usize;
        let pixels = data
            .get(..len)
            .context("ffmpeg frame is shorter than its size")?;
        return Ok((pixels.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }
    Ok((pixels, width, height))
}
