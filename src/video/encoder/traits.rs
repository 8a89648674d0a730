//! Encoder traits

use std::sync::Arc;

use crate::error::EncodeError;
use crate::video::frame::{EncodedFormat, EncodedFrame, RawFrame};

/// Transform of one raw frame into one encoded frame
///
/// Implementations may keep scratch buffers between calls but no state that
/// changes the output, so any instance gives the same result for the same
/// input. Not `Sync`: turbojpeg handles are not thread-safe, every worker
/// owns its own encoder.
pub trait FrameEncoder: Send {
    fn name(&self) -> &str;

    fn output_format(&self) -> EncodedFormat;

    fn encode(&mut self, frame: &RawFrame) -> Result<EncodedFrame, EncodeError>;
}

/// Creates one encoder per worker
pub trait EncoderFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn FrameEncoder>, EncodeError>;

    /// Encoder type name, for logs
    fn encoder_type(&self) -> &str;
}

pub type SharedEncoderFactory = Arc<dyn EncoderFactory>;

/// Encoder for the H264 path
///
/// Publishing follows the same sink contract as JPEG; only the codec
/// differs, so the stream takes any implementation of this trait.
pub trait H264Backend: Send {
    fn name(&self) -> &str;

    /// Encode one frame, forcing an IDR frame when `force_key` is set
    fn encode(&mut self, frame: &RawFrame, force_key: bool) -> Result<EncodedFrame, EncodeError>;
}

/// Check that an uncompressed frame carries as many bytes as its geometry says
pub fn validate_raw(frame: &RawFrame) -> Result<(), EncodeError> {
    if frame.is_empty() {
        return Err(EncodeError::Empty);
    }
    let Some(min_stride) = frame.format.min_stride(frame.width()) else {
        return Ok(());
    };
    if frame.stride < min_stride {
        return Err(EncodeError::StrideMismatch {
            stride: frame.stride,
            width: frame.width(),
            format: frame.format.to_string(),
        });
    }
    let needed = frame.stride as usize * frame.height() as usize;
    if frame.len() < needed {
        return Err(EncodeError::SizeMismatch {
            used: frame.len(),
            stride: frame.stride,
            height: frame.height(),
        });
    }
    Ok(())
}
