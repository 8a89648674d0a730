use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::stream::memsink::MemsinkConfig;

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Capture device settings
    pub device: DeviceSection,
    /// JPEG encoding settings
    pub encoder: EncoderSection,
    /// Capture loop policy
    pub stream: StreamSection,
    /// Shared memory sinks
    pub sinks: SinksSection,
    /// HTTP server settings
    pub http: HttpConfig,
}

/// Capture device configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSection {
    /// Device path (e.g., /dev/video0)
    pub path: String,
    /// Input index
    pub input: u32,
    pub width: u32,
    pub height: u32,
    /// Pixel format (YUYV, YVYU, UYVY, RGB565, RGB24, BGR24, MJPEG, JPEG)
    pub format: String,
    /// Frame rate, 0 keeps the driver default
    pub fps: u32,
    /// PAL, NTSC, SECAM or empty to leave the standard alone
    pub standard: String,
    /// MMAP or USERPTR
    pub io_method: String,
    /// Hardware buffers, 0 means one per worker plus one
    pub buffers: u32,
    /// Take the resolution from the source's DV timings
    pub dv_timings: bool,
    pub dma_export: bool,
    pub dma_required: bool,
    /// Smaller frames are treated as broken
    pub min_frame_size: usize,
    /// Keep the device open on timeouts
    pub persistent: bool,
    /// Readiness wait timeout (seconds)
    pub timeout_secs: f64,
    /// Control name to mode (`auto`, `default`, or a number)
    pub controls: BTreeMap<String, String>,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            path: "/dev/video0".to_string(),
            input: 0,
            width: 640,
            height: 480,
            format: "YUYV".to_string(),
            fps: 0,
            standard: String::new(),
            io_method: "MMAP".to_string(),
            buffers: 0,
            dv_timings: false,
            dma_export: false,
            dma_required: false,
            min_frame_size: crate::video::device::DEFAULT_MIN_FRAME_SIZE,
            persistent: false,
            timeout_secs: 1.0,
            controls: BTreeMap::new(),
        }
    }
}

/// JPEG encoder configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSection {
    /// JPEG quality (1-100)
    pub quality: u32,
    /// Encoder threads, 0 means one per CPU
    pub workers: usize,
    /// Encode straight from hardware buffers
    pub zero_copy: bool,
}

impl Default for EncoderSection {
    fn default() -> Self {
        Self {
            quality: 80,
            workers: 0,
            zero_copy: false,
        }
    }
}

/// Capture loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSection {
    /// Frames kept for HTTP clients
    pub ring_capacity: usize,
    /// Delay before reopening a failed device (seconds)
    pub error_delay_secs: f64,
    /// Offline time before blank frames start (seconds)
    pub offline_threshold_secs: f64,
    /// Minimum interval between blank frames (seconds)
    pub blank_interval_secs: f64,
    /// Serve the last good frame while offline: negative disables, 0 forever
    pub last_as_blank_secs: f64,
    /// Capture at about one frame per second while nobody reads
    pub slowdown: bool,
    /// Max identical frames in a row to skip, 0 disables
    pub drop_same_frames: u32,
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            ring_capacity: crate::stream::ring::DEFAULT_CAPACITY,
            error_delay_secs: 1.0,
            offline_threshold_secs: 1.0,
            blank_interval_secs: 1.0,
            last_as_blank_secs: -1.0,
            slowdown: false,
            drop_same_frames: 0,
        }
    }
}

/// Shared memory sinks, each disabled when absent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinksSection {
    pub raw: Option<MemsinkConfig>,
    pub jpeg: Option<MemsinkConfig>,
    pub h264: Option<MemsinkConfig>,
}

/// HTTP server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    /// Bind address
    pub bind_address: String,
    /// HTTP port
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}
