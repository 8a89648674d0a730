//! Camera controls applied once after the device is opened
//!
//! A control is set to one of four modes. `None` leaves the driver value
//! untouched, which is what every control starts as.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::driver::CaptureDriver;
use crate::error::ConfigError;

// ===== V4L2 control IDs (videodev2.h / v4l2-controls.h) =====
const V4L2_CTRL_CLASS_USER: u32 = 0x0098_0000;
const V4L2_CTRL_CLASS_JPEG: u32 = 0x009d_0000;
const V4L2_CID_BASE: u32 = V4L2_CTRL_CLASS_USER | 0x900;
const V4L2_CID_JPEG_CLASS_BASE: u32 = V4L2_CTRL_CLASS_JPEG | 0x900;

pub const V4L2_CID_BRIGHTNESS: u32 = V4L2_CID_BASE;
pub const V4L2_CID_CONTRAST: u32 = V4L2_CID_BASE + 1;
pub const V4L2_CID_SATURATION: u32 = V4L2_CID_BASE + 2;
pub const V4L2_CID_HUE: u32 = V4L2_CID_BASE + 3;
pub const V4L2_CID_AUTO_WHITE_BALANCE: u32 = V4L2_CID_BASE + 12;
pub const V4L2_CID_GAMMA: u32 = V4L2_CID_BASE + 16;
pub const V4L2_CID_AUTOGAIN: u32 = V4L2_CID_BASE + 18;
pub const V4L2_CID_GAIN: u32 = V4L2_CID_BASE + 19;
pub const V4L2_CID_HFLIP: u32 = V4L2_CID_BASE + 20;
pub const V4L2_CID_VFLIP: u32 = V4L2_CID_BASE + 21;
pub const V4L2_CID_HUE_AUTO: u32 = V4L2_CID_BASE + 25;
pub const V4L2_CID_WHITE_BALANCE_TEMPERATURE: u32 = V4L2_CID_BASE + 26;
pub const V4L2_CID_SHARPNESS: u32 = V4L2_CID_BASE + 27;
pub const V4L2_CID_BACKLIGHT_COMPENSATION: u32 = V4L2_CID_BASE + 28;
pub const V4L2_CID_COLORFX: u32 = V4L2_CID_BASE + 31;
pub const V4L2_CID_AUTOBRIGHTNESS: u32 = V4L2_CID_BASE + 32;
pub const V4L2_CID_ROTATE: u32 = V4L2_CID_BASE + 34;

/// Compression quality of hardware JPEG/MJPEG encoders
pub const V4L2_CID_JPEG_COMPRESSION_QUALITY: u32 = V4L2_CID_JPEG_CLASS_BASE + 3;

/// Closed set of controls the device can be configured with
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlId {
    Brightness,
    Contrast,
    Saturation,
    Hue,
    Gamma,
    Sharpness,
    BacklightCompensation,
    WhiteBalance,
    Gain,
    ColorEffect,
    Rotate,
    FlipVertical,
    FlipHorizontal,
}

impl ControlId {
    pub fn all() -> &'static [ControlId] {
        &[
            ControlId::Brightness,
            ControlId::Contrast,
            ControlId::Saturation,
            ControlId::Hue,
            ControlId::Gamma,
            ControlId::Sharpness,
            ControlId::BacklightCompensation,
            ControlId::WhiteBalance,
            ControlId::Gain,
            ControlId::ColorEffect,
            ControlId::Rotate,
            ControlId::FlipVertical,
            ControlId::FlipHorizontal,
        ]
    }

    /// Control carrying the manual value
    pub fn cid(&self) -> u32 {
        match self {
            ControlId::Brightness => V4L2_CID_BRIGHTNESS,
            ControlId::Contrast => V4L2_CID_CONTRAST,
            ControlId::Saturation => V4L2_CID_SATURATION,
            ControlId::Hue => V4L2_CID_HUE,
            ControlId::Gamma => V4L2_CID_GAMMA,
            ControlId::Sharpness => V4L2_CID_SHARPNESS,
            ControlId::BacklightCompensation => V4L2_CID_BACKLIGHT_COMPENSATION,
            ControlId::WhiteBalance => V4L2_CID_WHITE_BALANCE_TEMPERATURE,
            ControlId::Gain => V4L2_CID_GAIN,
            ControlId::ColorEffect => V4L2_CID_COLORFX,
            ControlId::Rotate => V4L2_CID_ROTATE,
            ControlId::FlipVertical => V4L2_CID_VFLIP,
            ControlId::FlipHorizontal => V4L2_CID_HFLIP,
        }
    }

    /// Companion boolean control switching automatic mode, if any
    pub fn auto_cid(&self) -> Option<u32> {
        match self {
            ControlId::Brightness => Some(V4L2_CID_AUTOBRIGHTNESS),
            ControlId::Hue => Some(V4L2_CID_HUE_AUTO),
            ControlId::WhiteBalance => Some(V4L2_CID_AUTO_WHITE_BALANCE),
            ControlId::Gain => Some(V4L2_CID_AUTOGAIN),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ControlId::Brightness => "brightness",
            ControlId::Contrast => "contrast",
            ControlId::Saturation => "saturation",
            ControlId::Hue => "hue",
            ControlId::Gamma => "gamma",
            ControlId::Sharpness => "sharpness",
            ControlId::BacklightCompensation => "backlight_compensation",
            ControlId::WhiteBalance => "white_balance",
            ControlId::Gain => "gain",
            ControlId::ColorEffect => "color_effect",
            ControlId::Rotate => "rotate",
            ControlId::FlipVertical => "flip_vertical",
            ControlId::FlipHorizontal => "flip_horizontal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_lowercase().replace('-', "_");
        Self::all().iter().copied().find(|c| c.name() == s)
    }
}

impl fmt::Display for ControlId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a control is configured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlMode {
    /// Do not touch
    #[default]
    None,
    Value(i32),
    Auto,
    /// Reset to the driver default
    Default,
}

impl ControlMode {
    /// Parse `auto`, `default`, `none` or an integer
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" => Some(ControlMode::None),
            "auto" => Some(ControlMode::Auto),
            "default" => Some(ControlMode::Default),
            other => other.parse().ok().map(ControlMode::Value),
        }
    }
}

/// Mapping from control to its configured mode
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Controls {
    modes: BTreeMap<ControlId, ControlMode>,
}

impl Controls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, id: ControlId, mode: ControlMode) {
        if mode == ControlMode::None {
            self.modes.remove(&id);
        } else {
            self.modes.insert(id, mode);
        }
    }

    pub fn get(&self, id: ControlId) -> ControlMode {
        self.modes.get(&id).copied().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }

    /// Build from `name -> mode` string pairs, as found in config files
    pub fn from_pairs<'a>(
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, ConfigError> {
        let mut controls = Self::new();
        for (name, value) in pairs {
            let id = ControlId::parse(name).ok_or_else(|| ConfigError::Invalid {
                field: "device.controls",
                reason: format!("unknown control {}", name),
            })?;
            let mode = ControlMode::parse(value).ok_or_else(|| ConfigError::Invalid {
                field: "device.controls",
                reason: format!("bad value {:?} for {}", value, name),
            })?;
            controls.set(id, mode);
        }
        Ok(controls)
    }

    /// Apply every configured control. Failures only warn, an unsupported
    /// control must not keep the device from streaming.
    pub fn apply(&self, driver: &mut dyn CaptureDriver) {
        for (id, mode) in &self.modes {
            match mode {
                ControlMode::None => {}
                ControlMode::Auto => match id.auto_cid() {
                    Some(auto) => set_checked(driver, *id, auto, 1),
                    None => warn!("Control {} has no automatic mode", id),
                },
                ControlMode::Value(value) => {
                    if let Some(auto) = id.auto_cid() {
                        set_checked(driver, *id, auto, 0);
                    }
                    set_checked(driver, *id, id.cid(), *value);
                }
                ControlMode::Default => match driver.query_control(id.cid()) {
                    Ok(Some(info)) => set_checked(driver, *id, id.cid(), info.default),
                    Ok(None) => debug!("Control {} is not supported", id),
                    Err(e) => warn!("Can't query control {}: {}", id, e),
                },
            }
        }
    }
}

/// Set a control after checking it exists and the value is in range
fn set_checked(driver: &mut dyn CaptureDriver, id: ControlId, cid: u32, value: i32) {
    let info = match driver.query_control(cid) {
        Ok(Some(info)) => info,
        Ok(None) => {
            debug!("Control {} (0x{:08x}) is not supported", id, cid);
            return;
        }
        Err(e) => {
            warn!("Can't query control {}: {}", id, e);
            return;
        }
    };
    if info.disabled {
        debug!("Control {} is disabled", id);
        return;
    }
    if value < info.minimum || value > info.maximum {
        warn!(
            "Invalid value {} for control {}: min={}, max={}",
            value, id, info.minimum, info.maximum
        );
        return;
    }
    match driver.set_control(cid, value) {
        Ok(()) => info!("Applied control {} = {}", id, value),
        Err(e) => warn!("Can't set control {} = {}: {}", id, value, e),
    }
}
