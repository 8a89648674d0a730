//! "NO SIGNAL" placeholder frame
//!
//! Rendered into RGB24 and encoded on first use, then shared read-only.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use tracing::info;

use super::encoder::EncoderFactory;
use super::format::{PixelFormat, Resolution};
use super::frame::{EncodedFrame, RawFrame};
use crate::error::EncodeError;

const TEXT: &str = "NO SIGNAL";
const GLYPH_W: usize = 5;
const GLYPH_H: usize = 7;

/// 5x7 glyph rows, most significant of the low five bits is the leftmost pixel
fn glyph(c: char) -> [u8; GLYPH_H] {
    match c {
        'A' => [0x0e, 0x11, 0x11, 0x1f, 0x11, 0x11, 0x11],
        'G' => [0x0e, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0f],
        'I' => [0x0e, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0e],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1f],
        'N' => [0x11, 0x19, 0x15, 0x13, 0x11, 0x11, 0x11],
        'O' => [0x0e, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0e],
        'S' => [0x0f, 0x10, 0x10, 0x0e, 0x01, 0x01, 0x1e],
        _ => [0; GLYPH_H],
    }
}

/// Render the placeholder picture as tightly packed RGB24
pub fn render_no_signal(resolution: Resolution) -> Vec<u8> {
    let width = resolution.width as usize;
    let height = resolution.height as usize;
    let mut rgb = vec![0u8; width * height * 3];

    let chars = TEXT.chars().count();
    let text_w = chars * (GLYPH_W + 1) - 1;
    let scale = (width / 2 / text_w).min(height / 3 / GLYPH_H).max(1);
    let left = width.saturating_sub(text_w * scale) / 2;
    let top = height.saturating_sub(GLYPH_H * scale) / 2;

    for (n, c) in TEXT.chars().enumerate() {
        let rows = glyph(c);
        for (gy, bits) in rows.iter().enumerate() {
            for gx in 0..GLYPH_W {
                if bits & (0x10 >> gx) == 0 {
                    continue;
                }
                let x0 = left + (n * (GLYPH_W + 1) + gx) * scale;
                let y0 = top + gy * scale;
                for y in y0..(y0 + scale).min(height) {
                    for x in x0..(x0 + scale).min(width) {
                        let at = (y * width + x) * 3;
                        rgb[at..at + 3].copy_from_slice(&[0xff, 0xff, 0xff]);
                    }
                }
            }
        }
    }
    rgb
}

/// Lazily built, cached placeholder frame
#[derive(Debug)]
pub struct BlankFrame {
    resolution: Resolution,
    cell: OnceLock<Arc<EncodedFrame>>,
}

impl BlankFrame {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            resolution: resolution.clamped(),
            cell: OnceLock::new(),
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// The cached frame, built with an encoder from `factory` on first call
    ///
    /// Concurrent first calls may each encode, exactly one result is kept.
    pub fn frame(&self, factory: &dyn EncoderFactory) -> Result<Arc<EncodedFrame>, EncodeError> {
        if let Some(frame) = self.cell.get() {
            return Ok(frame.clone());
        }
        let built = Arc::new(self.build(factory)?);
        Ok(self.cell.get_or_init(|| built).clone())
    }

    /// The cached frame if it was built already
    pub fn get(&self) -> Option<Arc<EncodedFrame>> {
        self.cell.get().cloned()
    }

    fn build(&self, factory: &dyn EncoderFactory) -> Result<EncodedFrame, EncodeError> {
        let rgb = render_no_signal(self.resolution);
        let mut raw = RawFrame::new(
            Bytes::from(rgb),
            self.resolution,
            PixelFormat::Rgb24,
            self.resolution.width * 3,
            0,
        );
        raw.online = false;
        let mut encoder = factory.create()?;
        let frame = encoder.encode(&raw)?;
        info!(
            "Built blank frame {} ({} bytes, {})",
            self.resolution,
            frame.len(),
            encoder.name()
        );
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::encoder::JpegEncoderFactory;

    #[test]
    fn test_render_has_text_pixels() {
        let res = Resolution::new(640, 480);
        let rgb = render_no_signal(res);
        assert_eq!(rgb.len(), 640 * 480 * 3);
        let lit = rgb.chunks_exact(3).filter(|p| p[0] == 0xff).count();
        assert!(lit > 0);
        assert!(lit < 640 * 480 / 4);
    }

    #[test]
    fn test_built_once() {
        let blank = BlankFrame::new(Resolution::new(320, 240));
        assert!(blank.get().is_none());

        let factory = JpegEncoderFactory::new(80);
        let a = blank.frame(&factory).unwrap();
        let b = blank.frame(&factory).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!a.online);
        assert!(a.is_valid_jpeg());
        assert_eq!(a.resolution, Resolution::new(320, 240));
    }

    #[test]
    fn test_concurrent_access() {
        let blank = Arc::new(BlankFrame::new(Resolution::new(160, 120)));
        let factory = Arc::new(JpegEncoderFactory::new(80));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let blank = blank.clone();
                let factory = factory.clone();
                std::thread::spawn(move || blank.frame(factory.as_ref()).unwrap())
            })
            .collect();
        let frames: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(frames.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }
}
