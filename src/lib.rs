//! vcap-streamer - V4L2 capture and frame distribution
//!
//! Captures frames from a V4L2 device, encodes them to JPEG on a pool of
//! worker threads and hands them to HTTP clients through a bounded ring and
//! to other processes through shared memory sinks. When the device is gone
//! or silent a "no signal" frame is served instead.

pub mod config;
pub mod error;
pub mod stream;
pub mod utils;
pub mod video;
pub mod web;

pub use error::{AppError, Result};
