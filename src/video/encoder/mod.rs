//! Frame encoders
//!
//! - JPEG encoding for raw frames (YUYV, YVYU, UYVY, RGB565, RGB24, BGR24)
//! - MJPEG/JPEG pass-through
//! - H264 backend contract

pub mod convert;
pub mod jpeg;
pub mod traits;

pub use jpeg::{JpegEncoder, JpegEncoderFactory};
pub use traits::{validate_raw, EncoderFactory, FrameEncoder, H264Backend, SharedEncoderFactory};
