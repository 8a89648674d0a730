//! Pixel formats, resolutions, analog standards and I/O methods

use serde::{Deserialize, Serialize};
use std::fmt;
use v4l::format::fourcc;

/// Smallest accepted capture resolution
pub const MIN_RESOLUTION: Resolution = Resolution {
    width: 160,
    height: 120,
};

/// Largest accepted capture resolution
pub const MAX_RESOLUTION: Resolution = Resolution {
    width: 15360,
    height: 8640,
};

/// Highest accepted capture frame rate (0 means "driver default")
pub const MAX_FPS: u32 = 120;

/// Supported capture pixel formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed format
    Yuyv,
    /// YVYU 4:2:2 packed format
    Yvyu,
    /// UYVY 4:2:2 packed format
    Uyvy,
    /// RGB565 format
    Rgb565,
    /// RGB24 format (3 bytes per pixel)
    Rgb24,
    /// BGR24 format (3 bytes per pixel)
    Bgr24,
    /// MJPEG compressed format (preferred for capture cards)
    Mjpeg,
    /// JPEG compressed format
    Jpeg,
}

impl PixelFormat {
    fn fourcc_bytes(&self) -> &'static [u8; 4] {
        match self {
            PixelFormat::Yuyv => b"YUYV",
            PixelFormat::Yvyu => b"YVYU",
            PixelFormat::Uyvy => b"UYVY",
            PixelFormat::Rgb565 => b"RGBP",
            PixelFormat::Rgb24 => b"RGB3",
            PixelFormat::Bgr24 => b"BGR3",
            PixelFormat::Mjpeg => b"MJPG",
            PixelFormat::Jpeg => b"JPEG",
        }
    }

    /// FourCC as the little-endian u32 the kernel uses
    pub fn fourcc_code(&self) -> u32 {
        u32::from_le_bytes(*self.fourcc_bytes())
    }

    /// Try to convert from V4L2 FourCC
    pub fn from_fourcc(fourcc: fourcc::FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"YVYU" => Some(PixelFormat::Yvyu),
            b"UYVY" => Some(PixelFormat::Uyvy),
            b"RGBP" => Some(PixelFormat::Rgb565),
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"BGR3" => Some(PixelFormat::Bgr24),
            b"MJPG" => Some(PixelFormat::Mjpeg),
            b"JPEG" => Some(PixelFormat::Jpeg),
            _ => None,
        }
    }

    /// Same as [`PixelFormat::from_fourcc`], for the raw kernel value
    pub fn from_fourcc_code(code: u32) -> Option<Self> {
        Self::from_fourcc(fourcc::FourCC::new(&code.to_le_bytes()))
    }

    /// Check if format is compressed (JPEG/MJPEG)
    pub fn is_compressed(&self) -> bool {
        matches!(self, PixelFormat::Mjpeg | PixelFormat::Jpeg)
    }

    /// Get bytes per pixel for uncompressed formats
    /// Returns None for compressed formats
    pub fn bytes_per_pixel(&self) -> Option<usize> {
        match self {
            PixelFormat::Mjpeg | PixelFormat::Jpeg => None,
            PixelFormat::Yuyv | PixelFormat::Yvyu | PixelFormat::Uyvy => Some(2),
            PixelFormat::Rgb565 => Some(2),
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(3),
        }
    }

    /// Minimal stride (bytes per line) for a given width
    pub fn min_stride(&self, width: u32) -> Option<u32> {
        self.bytes_per_pixel().map(|bpp| width * bpp as u32)
    }

    /// Expected frame size for a given resolution and stride
    /// Returns None for compressed formats (variable size)
    pub fn frame_size(&self, resolution: Resolution, stride: u32) -> Option<usize> {
        self.bytes_per_pixel()
            .map(|_| stride as usize * resolution.height as usize)
    }

    /// Get all supported formats
    pub fn all() -> &'static [PixelFormat] {
        &[
            PixelFormat::Yuyv,
            PixelFormat::Yvyu,
            PixelFormat::Uyvy,
            PixelFormat::Rgb565,
            PixelFormat::Rgb24,
            PixelFormat::Bgr24,
            PixelFormat::Mjpeg,
            PixelFormat::Jpeg,
        ]
    }

    /// Case-insensitive name lookup, `None` on no match
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "YUYV" => Some(PixelFormat::Yuyv),
            "YVYU" => Some(PixelFormat::Yvyu),
            "UYVY" => Some(PixelFormat::Uyvy),
            "RGB565" => Some(PixelFormat::Rgb565),
            "RGB24" => Some(PixelFormat::Rgb24),
            "BGR24" => Some(PixelFormat::Bgr24),
            "MJPEG" | "MJPG" => Some(PixelFormat::Mjpeg),
            "JPEG" => Some(PixelFormat::Jpeg),
            _ => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Yvyu => "YVYU",
            PixelFormat::Uyvy => "UYVY",
            PixelFormat::Rgb565 => "RGB565",
            PixelFormat::Rgb24 => "RGB24",
            PixelFormat::Bgr24 => "BGR24",
            PixelFormat::Mjpeg => "MJPEG",
            PixelFormat::Jpeg => "JPEG",
        };
        write!(f, "{}", name)
    }
}

/// Resolution (width x height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Check if resolution is within capture bounds
    pub fn is_valid(&self) -> bool {
        self.width >= MIN_RESOLUTION.width
            && self.width <= MAX_RESOLUTION.width
            && self.height >= MIN_RESOLUTION.height
            && self.height <= MAX_RESOLUTION.height
    }

    /// Clamp into capture bounds
    pub fn clamped(&self) -> Self {
        Self {
            width: self.width.clamp(MIN_RESOLUTION.width, MAX_RESOLUTION.width),
            height: self.height.clamp(MIN_RESOLUTION.height, MAX_RESOLUTION.height),
        }
    }

    pub const VGA: Resolution = Resolution {
        width: 640,
        height: 480,
    };
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

impl std::str::FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("Invalid resolution: {}", s))?;
        let width = w
            .trim()
            .parse()
            .map_err(|_| format!("Invalid width: {}", w))?;
        let height = h
            .trim()
            .parse()
            .map_err(|_| format!("Invalid height: {}", h))?;
        Ok(Self { width, height })
    }
}

/// Analog video standard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VideoStandard {
    /// Not set, leave the driver alone
    #[default]
    Unknown,
    Pal,
    Ntsc,
    Secam,
}

impl VideoStandard {
    // v4l2_std_id masks from videodev2.h
    const STD_PAL: u64 = 0x0000_00ff;
    const STD_NTSC: u64 = 0x0000_b000;
    const STD_SECAM: u64 = 0x00ff_0000;

    /// `v4l2_std_id` bitmask, zero for `Unknown`
    pub fn std_id(&self) -> u64 {
        match self {
            VideoStandard::Unknown => 0,
            VideoStandard::Pal => Self::STD_PAL,
            VideoStandard::Ntsc => Self::STD_NTSC,
            VideoStandard::Secam => Self::STD_SECAM,
        }
    }

    /// Case-insensitive lookup, `Unknown` on no match
    pub fn parse(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "PAL" => VideoStandard::Pal,
            "NTSC" => VideoStandard::Ntsc,
            "SECAM" => VideoStandard::Secam,
            _ => VideoStandard::Unknown,
        }
    }
}

impl fmt::Display for VideoStandard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VideoStandard::Unknown => "UNKNOWN",
            VideoStandard::Pal => "PAL",
            VideoStandard::Ntsc => "NTSC",
            VideoStandard::Secam => "SECAM",
        };
        write!(f, "{}", name)
    }
}

/// Buffer I/O method used with the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IoMethod {
    /// Driver-allocated buffers mapped into our address space
    #[default]
    Mmap,
    /// Buffers allocated by us and handed to the driver by pointer
    UserPtr,
}

impl IoMethod {
    /// Case-insensitive lookup, `None` on no match
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "MMAP" => Some(IoMethod::Mmap),
            "USERPTR" => Some(IoMethod::UserPtr),
            _ => None,
        }
    }

    /// `enum v4l2_memory` value
    pub fn memory_type(&self) -> u32 {
        match self {
            IoMethod::Mmap => 1,
            IoMethod::UserPtr => 2,
        }
    }
}

impl fmt::Display for IoMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoMethod::Mmap => write!(f, "MMAP"),
            IoMethod::UserPtr => write!(f, "USERPTR"),
        }
    }
}
