//! Video capture and encoding
//!
//! V4L2 device handling, frame types, encoders, the encoder worker pool and
//! the "no signal" placeholder.

pub mod blank;
pub mod controls;
pub mod device;
pub mod driver;
pub mod encoder;
pub mod format;
pub mod frame;
pub mod mock;
pub mod v4l2;
pub mod workers;

pub use blank::BlankFrame;
pub use controls::{ControlId, ControlMode, Controls};
pub use device::{Device, DeviceConfig, DeviceRuntime, GrabbedBuffer, SelectFlags};
pub use driver::CaptureDriver;
pub use encoder::{EncoderFactory, FrameEncoder, JpegEncoder, JpegEncoderFactory};
pub use format::{IoMethod, PixelFormat, Resolution, VideoStandard};
pub use frame::{EncodedFormat, EncodedFrame, RawFrame};
pub use workers::{Reorderer, WorkerPool, WorkerResult};
