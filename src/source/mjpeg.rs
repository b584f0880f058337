//! JPEG framing and decoding shared by the file and remote sources.

use anyhow::{anyhow, Context, Result};
use image::GenericImageView;
use std::io::Read;
use std::time::Duration;

pub const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

/// Splits a byte stream of concatenated (or multipart-wrapped) JPEGs into
/// individual images by walking their marker segments.
pub struct MjpegStream {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    pub fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    pub fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

/// Every complete JPEG in `bytes`, in order.
pub fn split_jpegs(bytes: &[u8]) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    let mut offset = 0;
    while let Some((start, end)) = find_jpeg_bounds(&bytes[offset..]) {
        frames.push(bytes[offset + start..offset + end].to_vec());
        offset += end;
    }
    frames
}

pub fn decode_jpeg(bytes: &[u8]) -> Result<(Vec<u8>, u32, u32)> {
    let image = image::load_from_memory(bytes).context("decode jpeg")?;
    let (width, height) = image.dimensions();
    let rgb = image.into_rgb8();
    Ok((rgb.into_raw(), width, height))
}

/// Bounds of the first complete JPEG in `buffer`.
///
/// Walks the marker segments after SOI so that an EOI inside an APPn payload
/// (an EXIF thumbnail) does not end the image. Entropy-coded data is scanned
/// for the next real marker, skipping `FF 00` stuffing and restart markers.
pub fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let mut i = start + 2;
    loop {
        if i >= buffer.len() {
            return None;
        }
        if buffer[i] != 0xFF {
            // Not on a marker: damaged header, fall back to the first EOI.
            return scan_for_eoi(buffer, i).map(|end| (start, end));
        }
        while i + 1 < buffer.len() && buffer[i + 1] == 0xFF {
            i += 1;
        }
        let marker = *buffer.get(i + 1)?;
        match marker {
            0xD9 => return Some((start, i + 2)),
            0x01 | 0xD0..=0xD7 => i += 2,
            _ => {
                let length = u16::from_be_bytes([*buffer.get(i + 2)?, *buffer.get(i + 3)?]);
                if length < 2 {
                    return scan_for_eoi(buffer, i + 2).map(|end| (start, end));
                }
                i += 2 + length as usize;
                if marker == 0xDA {
                    i = next_marker_after_scan(buffer, i)?;
                }
            }
        }
    }
}

/// Position of the first marker that ends entropy-coded data at `from`.
fn next_marker_after_scan(buffer: &[u8], from: usize) -> Option<usize> {
    let mut j = from;
    while j + 1 < buffer.len() {
        if buffer[j] == 0xFF {
            match buffer[j + 1] {
                0x00 | 0xD0..=0xD7 | 0xFF => {}
                _ => return Some(j),
            }
        }
        j += 1;
    }
    None
}

fn scan_for_eoi(buffer: &[u8], from: usize) -> Option<usize> {
    let mut j = from;
    while j + 1 < buffer.len() {
        if buffer[j] == 0xFF && buffer[j + 1] == 0xD9 {
            return Some(j + 2);
        }
        j += 1;
    }
    None
}

pub fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::from_millis(0)
    } else {
        Duration::from_millis((1000 / target_fps).max(1) as u64)
    }
}

#[cfg(test)]
pub(crate) fn encode_test_jpeg(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
    let mut image = image::RgbImage::new(width, height);
    for pixel in image.pixels_mut() {
        *pixel = image::Rgb(rgb);
    }
    let mut out = std::io::Cursor::new(Vec::new());
    image
        .write_to(&mut out, image::ImageFormat::Jpeg)
        .unwrap();
    out.into_inner()
}

/// `jpeg` with `thumbnail` embedded in an EXIF APP1 segment right after SOI,
/// the layout camera and phone stills use.
#[cfg(test)]
pub(crate) fn with_exif_thumbnail(jpeg: &[u8], thumbnail: &[u8]) -> Vec<u8> {
    let mut payload = b"Exif\0\0II*\0\x08\0\0\0\0\0\0\0\0\0".to_vec();
    payload.extend_from_slice(thumbnail);
    let length = u16::try_from(payload.len() + 2).unwrap();
    let mut out = jpeg[..2].to_vec();
    out.extend_from_slice(&[0xFF, 0xE1]);
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&jpeg[2..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn finds_frames_inside_multipart_noise() -> Result<()> {
        let jpeg = encode_test_jpeg(8, 6, [200, 10, 10]);
        let mut body = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        body.extend_from_slice(&jpeg);
        body.extend_from_slice(b"\r\n--frame\r\n\r\n");
        body.extend_from_slice(&jpeg);

        let mut stream = MjpegStream::new(Box::new(Cursor::new(body.clone())));
        let first = stream.read_next_jpeg()?;
        let (pixels, width, height) = decode_jpeg(&first)?;
        assert_eq!((width, height), (8, 6));
        assert_eq!(pixels.len(), 8 * 6 * 3);
        assert!(stream.read_next_jpeg().is_ok());
        assert!(stream.read_next_jpeg().is_err());

        assert_eq!(split_jpegs(&body).len(), 2);
        Ok(())
    }

    #[test]
    fn no_markers_means_no_frames() {
        assert!(find_jpeg_bounds(b"plain text").is_none());
        assert!(split_jpegs(&[0xFF, 0xD8, 0x00]).is_empty());
    }

    #[test]
    fn exif_thumbnail_does_not_end_the_frame() -> Result<()> {
        let thumbnail = encode_test_jpeg(4, 4, [0, 0, 0]);
        let still = with_exif_thumbnail(&encode_test_jpeg(32, 24, [90, 90, 200]), &thumbnail);

        let frames = split_jpegs(&still);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), still.len());
        let (_, width, height) = decode_jpeg(&frames[0])?;
        assert_eq!((width, height), (32, 24));

        let mut doubled = still.clone();
        doubled.extend_from_slice(&still);
        let mut stream = MjpegStream::new(Box::new(Cursor::new(doubled)));
        assert_eq!(stream.read_next_jpeg()?.len(), still.len());
        assert_eq!(stream.read_next_jpeg()?.len(), still.len());
        Ok(())
    }

    #[test]
    fn truncated_frame_waits_for_more_bytes() {
        let jpeg = encode_test_jpeg(8, 8, [1, 2, 3]);
        assert!(find_jpeg_bounds(&jpeg[..jpeg.len() - 1]).is_none());
        assert_eq!(find_jpeg_bounds(&jpeg), Some((0, jpeg.len())));
    }
}
