//! JPEG encoder implementation
//!
//! Packed YUV is converted to I420 and compressed with turbojpeg's YUV path
//! (no internal color conversion). RGB input goes through turbojpeg's pixel
//! path with the source stride as pitch. MJPEG/JPEG captures are passed
//! through untouched.
//!
//! ```text
//! YUYV/YVYU/UYVY ──convert──> I420 ──turbojpeg──> JPEG
//! RGB565 ──convert──> RGB24 ──turbojpeg──> JPEG
//! RGB24/BGR24 ──turbojpeg──> JPEG
//! MJPEG/JPEG ──────────────────────────────> JPEG
//! ```

use std::sync::Arc;

use bytes::Bytes;

use super::convert::{packed422_to_i420, rgb565_to_rgb24, Packed422};
use super::traits::{validate_raw, EncoderFactory, FrameEncoder};
use crate::error::EncodeError;
use crate::utils::now_monotonic;
use crate::video::format::PixelFormat;
use crate::video::frame::{EncodedFormat, EncodedFrame, RawFrame};

/// Software JPEG encoder (turbojpeg)
///
/// Note: NOT thread-safe due to turbojpeg limitations, one per worker.
pub struct JpegEncoder {
    quality: u32,
    compressor: turbojpeg::Compressor,
    /// I420 scratch (Y + U + V planes)
    i420_buffer: Vec<u8>,
    /// RGB24 scratch for RGB565 input
    rgb_buffer: Vec<u8>,
}

impl JpegEncoder {
    /// Create a new JPEG encoder with quality 1..=100
    pub fn new(quality: u32) -> Result<Self, EncodeError> {
        let mut compressor = turbojpeg::Compressor::new().map_err(|e| {
            EncodeError::Backend(format!("Failed to create turbojpeg compressor: {}", e))
        })?;
        let quality = quality.clamp(1, 100);
        compressor
            .set_quality(quality as i32)
            .map_err(|e| EncodeError::Backend(format!("Failed to set JPEG quality: {}", e)))?;
        compressor
            .set_subsamp(turbojpeg::Subsamp::Sub2x2)
            .map_err(|e| EncodeError::Backend(format!("Failed to set subsampling: {}", e)))?;

        Ok(Self {
            quality,
            compressor,
            i420_buffer: Vec::new(),
            rgb_buffer: Vec::new(),
        })
    }

    pub fn quality(&self) -> u32 {
        self.quality
    }

    fn encode_packed422(&mut self, frame: &RawFrame, order: Packed422) -> Result<Vec<u8>, EncodeError> {
        let width = frame.width() as usize;
        let height = frame.height() as usize;
        packed422_to_i420(
            frame.data(),
            frame.stride as usize,
            width,
            height,
            order,
            &mut self.i420_buffer,
        );
        let yuv_image = turbojpeg::YuvImage {
            pixels: self.i420_buffer.as_slice(),
            width,
            height,
            align: 1,
            subsamp: turbojpeg::Subsamp::Sub2x2,
        };
        self.compressor
            .compress_yuv_to_vec(yuv_image)
            .map_err(|e| EncodeError::Backend(format!("JPEG compression failed: {}", e)))
    }

    fn encode_rgb(
        &mut self,
        pixels: &[u8],
        pitch: usize,
        width: usize,
        height: usize,
        format: turbojpeg::PixelFormat,
    ) -> Result<Vec<u8>, EncodeError> {
        let image = turbojpeg::Image {
            pixels,
            width,
            pitch,
            height,
            format,
        };
        self.compressor
            .compress_to_vec(image)
            .map_err(|e| EncodeError::Backend(format!("JPEG compression failed: {}", e)))
    }

    fn encode_rgb565(&mut self, frame: &RawFrame) -> Result<Vec<u8>, EncodeError> {
        let width = frame.width() as usize;
        let height = frame.height() as usize;
        let mut rgb = std::mem::take(&mut self.rgb_buffer);
        rgb565_to_rgb24(frame.data(), frame.stride as usize, width, height, &mut rgb);
        let result = self.encode_rgb(&rgb, width * 3, width, height, turbojpeg::PixelFormat::RGB);
        self.rgb_buffer = rgb;
        result
    }

    fn passthrough(&self, frame: &RawFrame) -> Result<Bytes, EncodeError> {
        let data = frame.data();
        if !data.starts_with(&[0xFF, 0xD8]) {
            return Err(EncodeError::Backend(
                "captured frame has no JPEG start marker".to_string(),
            ));
        }
        Ok(Bytes::copy_from_slice(data))
    }
}

impl FrameEncoder for JpegEncoder {
    fn name(&self) -> &str {
        "JPEG (turbojpeg)"
    }

    fn output_format(&self) -> EncodedFormat {
        EncodedFormat::Jpeg
    }

    fn encode(&mut self, frame: &RawFrame) -> Result<EncodedFrame, EncodeError> {
        validate_raw(frame)?;
        let begin = now_monotonic();
        let width = frame.width() as usize;
        let height = frame.height() as usize;
        let stride = frame.stride as usize;

        let data = match frame.format {
            PixelFormat::Yuyv => Bytes::from(self.encode_packed422(frame, Packed422::Yuyv)?),
            PixelFormat::Yvyu => Bytes::from(self.encode_packed422(frame, Packed422::Yvyu)?),
            PixelFormat::Uyvy => Bytes::from(self.encode_packed422(frame, Packed422::Uyvy)?),
            PixelFormat::Rgb565 => Bytes::from(self.encode_rgb565(frame)?),
            PixelFormat::Rgb24 => Bytes::from(self.encode_rgb(
                frame.data(),
                stride,
                width,
                height,
                turbojpeg::PixelFormat::RGB,
            )?),
            PixelFormat::Bgr24 => Bytes::from(self.encode_rgb(
                frame.data(),
                stride,
                width,
                height,
                turbojpeg::PixelFormat::BGR,
            )?),
            PixelFormat::Mjpeg | PixelFormat::Jpeg => self.passthrough(frame)?,
        };

        let mut encoded =
            EncodedFrame::new(data, EncodedFormat::Jpeg, frame.resolution).with_source(frame);
        encoded.encode_begin_ts = begin;
        encoded.encode_end_ts = now_monotonic();
        Ok(encoded)
    }
}

/// Builds [`JpegEncoder`]s with a fixed quality
#[derive(Debug, Clone)]
pub struct JpegEncoderFactory {
    quality: u32,
}

impl JpegEncoderFactory {
    pub fn new(quality: u32) -> Self {
        Self { quality }
    }

    pub fn shared(quality: u32) -> Arc<dyn EncoderFactory> {
        Arc::new(Self::new(quality))
    }
}

impl EncoderFactory for JpegEncoderFactory {
    fn create(&self) -> Result<Box<dyn FrameEncoder>, EncodeError> {
        Ok(Box::new(JpegEncoder::new(self.quality)?))
    }

    fn encoder_type(&self) -> &str {
        "JPEG (turbojpeg)"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::format::Resolution;

    fn gradient(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn raw(format: PixelFormat, width: u32, height: u32, stride: u32) -> RawFrame {
        let data = gradient(stride as usize * height as usize);
        RawFrame::new(Bytes::from(data), Resolution::new(width, height), format, stride, 7)
    }

    fn assert_jpeg(frame: &EncodedFrame, width: u32, height: u32) {
        assert!(frame.is_valid_jpeg());
        let header = turbojpeg::read_header(frame.data()).unwrap();
        assert_eq!(header.width, width as usize);
        assert_eq!(header.height, height as usize);
    }

    #[test]
    fn test_encode_packed_formats() {
        let mut encoder = JpegEncoder::new(80).unwrap();
        for format in [PixelFormat::Yuyv, PixelFormat::Yvyu, PixelFormat::Uyvy] {
            let frame = encoder.encode(&raw(format, 160, 120, 320)).unwrap();
            assert_jpeg(&frame, 160, 120);
            assert_eq!(frame.sequence, 7);
            assert_eq!(frame.stride, 320);
            assert!(frame.encode_end_ts >= frame.encode_begin_ts);
        }
    }

    #[test]
    fn test_encode_padded_stride_and_odd_height() {
        let mut encoder = JpegEncoder::new(50).unwrap();
        let frame = encoder.encode(&raw(PixelFormat::Yuyv, 160, 121, 384)).unwrap();
        assert_jpeg(&frame, 160, 121);
    }

    #[test]
    fn test_encode_rgb_formats() {
        let mut encoder = JpegEncoder::new(90).unwrap();
        let frame = encoder.encode(&raw(PixelFormat::Rgb24, 160, 120, 480)).unwrap();
        assert_jpeg(&frame, 160, 120);
        let frame = encoder.encode(&raw(PixelFormat::Bgr24, 160, 120, 512)).unwrap();
        assert_jpeg(&frame, 160, 120);
        let frame = encoder.encode(&raw(PixelFormat::Rgb565, 160, 120, 320)).unwrap();
        assert_jpeg(&frame, 160, 120);
    }

    #[test]
    fn test_passthrough() {
        let mut encoder = JpegEncoder::new(80).unwrap();
        let source = encoder.encode(&raw(PixelFormat::Yuyv, 160, 120, 320)).unwrap();

        let mjpeg = RawFrame::new(
            source.data_bytes(),
            Resolution::new(160, 120),
            PixelFormat::Mjpeg,
            0,
            3,
        );
        let frame = encoder.encode(&mjpeg).unwrap();
        assert_eq!(frame.data(), source.data());

        let junk = RawFrame::new(
            Bytes::from_static(&[1, 2, 3]),
            Resolution::new(160, 120),
            PixelFormat::Jpeg,
            0,
            4,
        );
        assert!(matches!(encoder.encode(&junk), Err(EncodeError::Backend(_))));
    }

    #[test]
    fn test_malformed_input() {
        let mut encoder = JpegEncoder::new(80).unwrap();
        let empty = RawFrame::new(Bytes::new(), Resolution::new(160, 120), PixelFormat::Yuyv, 320, 1);
        assert_eq!(encoder.encode(&empty).unwrap_err(), EncodeError::Empty);

        let mut short = raw(PixelFormat::Yuyv, 160, 120, 320);
        short.resolution = Resolution::new(160, 240);
        assert!(matches!(
            encoder.encode(&short),
            Err(EncodeError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_factory() {
        let factory = JpegEncoderFactory::shared(200);
        let encoder = factory.create().unwrap();
        assert_eq!(encoder.output_format(), EncodedFormat::Jpeg);
        assert_eq!(JpegEncoder::new(200).unwrap().quality(), 100);
    }
}
