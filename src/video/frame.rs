//! Video frame data structures

use std::fmt;
use std::os::fd::RawFd;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use serde::Serialize;

use super::driver::BufferRegion;
use super::format::{PixelFormat, Resolution};

/// Payload of a raw frame
#[derive(Clone)]
pub enum RawData {
    /// Copied out of the hardware buffer
    Owned(Bytes),
    /// Read-only view of a hardware buffer, valid until the buffer is released
    Mapped {
        region: Arc<dyn BufferRegion>,
        len: usize,
    },
}

impl fmt::Debug for RawData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawData::Owned(data) => write!(f, "Owned({} bytes)", data.len()),
            RawData::Mapped { len, .. } => write!(f, "Mapped({} bytes)", len),
        }
    }
}

/// A captured, not yet encoded frame
#[derive(Debug, Clone)]
pub struct RawFrame {
    data: RawData,
    pub resolution: Resolution,
    pub format: PixelFormat,
    /// Bytes per line
    pub stride: u32,
    /// Capture sequence number, monotonic per stream
    pub sequence: u64,
    /// Signal present
    pub online: bool,
    /// Monotonic seconds when the buffer was dequeued
    pub grab_ts: f64,
    /// DMA-BUF descriptor of the hardware buffer, if exported
    pub dma_fd: Option<RawFd>,
}

impl RawFrame {
    pub fn new(
        data: Bytes,
        resolution: Resolution,
        format: PixelFormat,
        stride: u32,
        sequence: u64,
    ) -> Self {
        Self {
            data: RawData::Owned(data),
            resolution,
            format,
            stride,
            sequence,
            online: true,
            grab_ts: crate::utils::now_monotonic(),
            dma_fd: None,
        }
    }

    /// View a hardware buffer without copying
    pub fn mapped(
        region: Arc<dyn BufferRegion>,
        len: usize,
        resolution: Resolution,
        format: PixelFormat,
        stride: u32,
        sequence: u64,
    ) -> Self {
        let len = len.min(region.as_slice().len());
        Self {
            data: RawData::Mapped { region, len },
            ..Self::new(Bytes::new(), resolution, format, stride, sequence)
        }
    }

    /// Get frame data as bytes slice
    pub fn data(&self) -> &[u8] {
        match &self.data {
            RawData::Owned(data) => data,
            RawData::Mapped { region, len } => &region.as_slice()[..*len],
        }
    }

    /// Frame data as `Bytes`, copying only when mapped
    pub fn to_bytes(&self) -> Bytes {
        match &self.data {
            RawData::Owned(data) => data.clone(),
            RawData::Mapped { .. } => Bytes::copy_from_slice(self.data()),
        }
    }

    /// Detach from the hardware buffer
    pub fn into_owned(self) -> Self {
        match self.data {
            RawData::Owned(_) => self,
            RawData::Mapped { .. } => Self {
                data: RawData::Owned(self.to_bytes()),
                ..self
            },
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.data, RawData::Mapped { .. })
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }
}

/// Encoded payload format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodedFormat {
    Jpeg,
    H264,
}

impl EncodedFormat {
    /// FourCC code carried in shared memory headers
    pub fn fourcc_code(&self) -> u32 {
        match self {
            EncodedFormat::Jpeg => u32::from_le_bytes(*b"JPEG"),
            EncodedFormat::H264 => u32::from_le_bytes(*b"H264"),
        }
    }
}

impl fmt::Display for EncodedFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodedFormat::Jpeg => write!(f, "JPEG"),
            EncodedFormat::H264 => write!(f, "H264"),
        }
    }
}

/// An encoded frame, immutable once built
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    data: Bytes,
    /// Cached xxHash64 of payload and geometry (for deduplication)
    hash: Arc<OnceLock<u64>>,
    pub format: EncodedFormat,
    pub resolution: Resolution,
    /// Stride of the source frame
    pub stride: u32,
    /// Live picture (false for blank and stale frames)
    pub online: bool,
    pub key_frame: bool,
    /// Sequence of the raw frame this was built from
    pub sequence: u64,
    /// Monotonic seconds when the source buffer was dequeued
    pub grab_ts: f64,
    pub encode_begin_ts: f64,
    pub encode_end_ts: f64,
}

impl EncodedFrame {
    pub fn new(data: Bytes, format: EncodedFormat, resolution: Resolution) -> Self {
        let now = crate::utils::now_monotonic();
        Self {
            data,
            hash: Arc::new(OnceLock::new()),
            format,
            resolution,
            stride: 0,
            online: true,
            key_frame: true,
            sequence: 0,
            grab_ts: now,
            encode_begin_ts: now,
            encode_end_ts: now,
        }
    }

    /// Copy capture metadata from the raw source
    pub fn with_source(mut self, raw: &RawFrame) -> Self {
        self.stride = raw.stride;
        self.online = raw.online;
        self.sequence = raw.sequence;
        self.grab_ts = raw.grab_ts;
        self
    }

    /// Same payload flagged as offline, with fresh timestamps
    pub fn as_offline(&self) -> Self {
        let now = crate::utils::now_monotonic();
        Self {
            online: false,
            grab_ts: now,
            encode_begin_ts: now,
            encode_end_ts: now,
            ..self.clone()
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Payload as `Bytes` (cheap clone)
    pub fn data_bytes(&self) -> Bytes {
        self.data.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Hash of payload and geometry (computed once, cached)
    pub fn get_hash(&self) -> u64 {
        *self.hash.get_or_init(|| {
            let seed = ((self.resolution.width as u64) << 32) | self.resolution.height as u64;
            xxhash_rust::xxh64::xxh64(self.data.as_ref(), seed)
        })
    }

    /// Same content and geometry
    pub fn same_content(&self, other: &EncodedFrame) -> bool {
        self.resolution == other.resolution
            && self.format == other.format
            && self.online == other.online
            && self.len() == other.len()
            && self.get_hash() == other.get_hash()
    }

    /// Check the JPEG start-of-image marker
    pub fn is_valid_jpeg(&self) -> bool {
        self.format == EncodedFormat::Jpeg && self.data.starts_with(&[0xFF, 0xD8])
    }
}
