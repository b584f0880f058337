//! Decoded video frames.
//!
//! - `VideoFrame`: RGB8 pixels plus dimensions and capture time.
//! - `FrameSource`: anything the monitor loop can pull frames from.
//!
//! Pixels stay private; callers read them through `pixels()` so a frame can
//! be handed to the detector without being copied.

use anyhow::{anyhow, Result};

use crate::geometry::FrameSize;

#[derive(Clone)]
pub struct VideoFrame {
    /// Packed RGB8, row-major, `width * height * 3` bytes.
    data: Vec<u8>,

    pub width: u32,
    pub height: u32,

    /// Wall-clock capture time in milliseconds since the Unix epoch.
    pub captured_at_ms: u64,
}

impl VideoFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, captured_at_ms: u64) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions {}x{} overflow", width, height))?;
        if width == 0 || height == 0 {
            return Err(anyhow!("frame dimensions must be non-zero"));
        }
        if data.len() != expected {
            return Err(anyhow!(
                "frame buffer is {} bytes, expected {} for {}x{} RGB",
                data.len(),
                expected,
                width,
                height
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            captured_at_ms,
        })
    }

    /// Solid-colour frame; used by synthetic sources.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3], captured_at_ms: u64) -> Result<Self> {
        let pixels = (width as usize) * (height as usize);
        let mut data = Vec::with_capacity(pixels * 3);
        for _ in 0..pixels {
            data.extend_from_slice(&rgb);
        }
        Self::new(data, width, height, captured_at_ms)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// Native detector frame size.
    pub fn size(&self) -> FrameSize {
        FrameSize::new(f64::from(self.width), f64::from(self.height))
    }
}

impl std::fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("captured_at_ms", &self.captured_at_ms)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Pull-based frame producer.
///
/// `Ok(None)` means no new frame is ready yet; the caller retries on its next
/// tick. Errors are reported to the caller, which decides whether the source
/// is still healthy.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Option<VideoFrame>>;
}
