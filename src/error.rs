use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Configuration errors, fatal to startup
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Unknown pixel format: {0} (available: YUYV, YVYU, UYVY, RGB565, RGB24, BGR24, MJPEG, JPEG)")]
    UnknownFormat(String),

    #[error("Unknown video standard: {0} (available: PAL, NTSC, SECAM)")]
    UnknownStandard(String),

    #[error("Unknown IO method: {0} (available: MMAP, USERPTR)")]
    UnknownIoMethod(String),

    #[error("Resolution {width}x{height} is out of bounds [160x120 .. 15360x8640]")]
    ResolutionOutOfBounds { width: u32, height: u32 },

    #[error("FPS {0} is out of bounds [0 .. 120]")]
    FpsOutOfBounds(u32),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Can't read config {path}: {reason}")]
    File { path: String, reason: String },
}

/// Capture device errors
///
/// Everything except [`DeviceError::is_fatal`] ones is recovered by the
/// stream loop: close, wait `error_delay`, open again.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Can't open device {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Device capability error: {0}")]
    Capability(String),

    #[error("Can't negotiate format: {0}")]
    Negotiate(String),

    #[error("Can't allocate device buffers: {reason}")]
    Allocate { reason: String, fatal: bool },

    #[error("Can't export DMA buffer {index}: {source}")]
    DmaExport {
        index: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Streaming error: {0}")]
    Stream(String),

    #[error("Device select timeout")]
    Timeout,

    #[error("Persistent device timeout (no new frames)")]
    PersistentTimeout,

    #[error("Can't grab buffer: {0}")]
    Grab(String),

    #[error("Broken frame in buffer {index} ({used} bytes)")]
    BrokenFrame { index: u32, used: usize },

    #[error("Buffer {index} is not grabbed by this handle")]
    NotGrabbed { index: u32 },

    #[error("Can't release buffer {index}: {source}")]
    Release {
        index: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Device disconnected: {0}")]
    Disconnected(String),

    #[error("Can't consume device event: {0}")]
    Event(String),

    #[error("Source changed, device must be reopened")]
    SourceChanged,

    #[error("Device is not open")]
    NotOpen,
}

impl DeviceError {
    /// Errors which must stop the pipeline instead of being retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DeviceError::Config(_) | DeviceError::Allocate { fatal: true, .. }
        )
    }

    /// Errors meaning the device node went away
    pub fn is_disconnect(&self) -> bool {
        matches!(self, DeviceError::Disconnected(_))
    }
}

/// Map an ioctl/poll errno to a disconnect when it means the device is gone
pub(crate) fn is_device_lost(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENXIO)
            | Some(libc::ENODEV)
            | Some(libc::EIO)
            | Some(libc::EPIPE)
            | Some(libc::ESHUTDOWN)
    )
}

/// Frame encoding errors, the frame is dropped
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("Empty frame")]
    Empty,

    #[error("Frame size mismatch: {used} bytes < stride {stride} * height {height}")]
    SizeMismatch { used: usize, stride: u32, height: u32 },

    #[error("Stride {stride} is too small for width {width} of {format}")]
    StrideMismatch {
        stride: u32,
        width: u32,
        format: String,
    },

    #[error("Encoder failure: {0}")]
    Backend(String),
}

/// Memory sink errors
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("{0}-sink: timed out waiting for shared memory lock")]
    Timeout(String),

    #[error("{sink}-sink: frame is too big ({size} > {max})")]
    TooBig { sink: String, size: usize, max: usize },

    #[error("{sink}-sink: protocol version mismatch (sink={found}, required={required})")]
    ProtocolMismatch {
        sink: String,
        found: u32,
        required: u32,
    },

    #[error("{sink}-sink: {reason}")]
    Io { sink: String, reason: String },
}

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

/// Error response body
#[derive(Serialize)]
pub struct ErrorResponse {
    pub ok: bool,
    pub message: String,
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            ok: false,
            message: self.to_string(),
        };

        tracing::error!(
            error_type = std::any::type_name_of_val(&self),
            error_message = %body.message,
            "Request failed"
        );

        (status, Json(body)).into_response()
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;
