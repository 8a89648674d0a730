//! Configuration loading
//!
//! The configuration is a single JSON file, every field optional. Command
//! line flags override it after loading, then [`AppConfig::validate`] checks
//! the result once before anything is opened.

mod schema;

pub use schema::*;

use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::stream::streamer::{default_workers, StreamConfig};
use crate::video::device::MAX_BUFFERS;
use crate::video::{Controls, DeviceConfig, IoMethod, PixelFormat, Resolution, VideoStandard};

impl AppConfig {
    /// Read a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file_error = |reason: String| ConfigError::File {
            path: path.display().to_string(),
            reason,
        };
        let text = std::fs::read_to_string(path).map_err(|e| file_error(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| file_error(e.to_string()))
    }

    /// Check every section, returns the first problem found
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.device_config()?.validate()?;
        self.stream_config()?;

        for (name, sink) in [
            ("sinks.raw", &self.sinks.raw),
            ("sinks.jpeg", &self.sinks.jpeg),
            ("sinks.h264", &self.sinks.h264),
        ] {
            if let Some(sink) = sink {
                crate::stream::memsink::validate_object(&sink.object).map_err(|e| {
                    ConfigError::Invalid {
                        field: name,
                        reason: e.to_string(),
                    }
                })?;
            }
        }

        if self.http.enabled && self.http.port == 0 {
            return Err(ConfigError::Invalid {
                field: "http.port",
                reason: "must not be 0".to_string(),
            });
        }
        Ok(())
    }

    /// Worker count with `0` resolved to one per CPU
    pub fn workers(&self) -> usize {
        match self.encoder.workers {
            0 => default_workers(),
            n => n,
        }
    }

    /// Device settings in their typed form
    pub fn device_config(&self) -> Result<DeviceConfig, ConfigError> {
        let d = &self.device;

        let format = PixelFormat::parse(&d.format)
            .ok_or_else(|| ConfigError::UnknownFormat(d.format.clone()))?;

        let standard = VideoStandard::parse(&d.standard);
        if !d.standard.trim().is_empty() && standard == VideoStandard::Unknown {
            return Err(ConfigError::UnknownStandard(d.standard.clone()));
        }

        let io_method = IoMethod::parse(&d.io_method)
            .ok_or_else(|| ConfigError::UnknownIoMethod(d.io_method.clone()))?;

        let n_bufs = match d.buffers {
            0 => (self.workers() as u32 + 1).min(MAX_BUFFERS),
            n => n,
        };

        let controls = Controls::from_pairs(
            d.controls
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str())),
        )?;

        Ok(DeviceConfig {
            path: d.path.clone().into(),
            input: d.input,
            resolution: Resolution::new(d.width, d.height),
            format,
            fps: d.fps,
            standard,
            io_method,
            n_bufs,
            dv_timings: d.dv_timings,
            dma_export: d.dma_export,
            dma_required: d.dma_required,
            min_frame_size: d.min_frame_size,
            persistent: d.persistent,
            timeout: seconds("device.timeout_secs", d.timeout_secs)?,
            jpeg_quality: self.encoder.quality,
            controls,
        })
    }

    /// Capture loop settings in their typed form
    pub fn stream_config(&self) -> Result<StreamConfig, ConfigError> {
        let s = &self.stream;

        if self.encoder.quality == 0 || self.encoder.quality > 100 {
            return Err(ConfigError::Invalid {
                field: "encoder.quality",
                reason: format!("{} is not in [1 .. 100]", self.encoder.quality),
            });
        }
        if s.ring_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "stream.ring_capacity",
                reason: "must be positive".to_string(),
            });
        }

        let last_as_blank = if s.last_as_blank_secs < 0.0 {
            None
        } else {
            Some(seconds("stream.last_as_blank_secs", s.last_as_blank_secs)?)
        };

        Ok(StreamConfig {
            workers: self.workers(),
            zero_copy: self.encoder.zero_copy,
            ring_capacity: s.ring_capacity,
            error_delay: seconds("stream.error_delay_secs", s.error_delay_secs)?,
            offline_threshold: seconds("stream.offline_threshold_secs", s.offline_threshold_secs)?,
            blank_interval: seconds("stream.blank_interval_secs", s.blank_interval_secs)?,
            last_as_blank,
            slowdown: s.slowdown,
            drop_same_frames: s.drop_same_frames,
        })
    }
}

fn seconds(field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::Invalid {
        field,
        reason: format!("{} is not a valid number of seconds", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::SinkKind;
    use std::io::Write;

    fn write_config(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();

        let device = config.device_config().unwrap();
        assert_eq!(device.resolution, Resolution::new(640, 480));
        assert_eq!(device.format, PixelFormat::Yuyv);
        assert_eq!(device.standard, VideoStandard::Unknown);
        assert_eq!(device.n_bufs, (config.workers() as u32 + 1).min(MAX_BUFFERS));

        let stream = config.stream_config().unwrap();
        assert_eq!(stream.last_as_blank, None);
        assert!(stream.workers >= 1);
    }

    #[test]
    fn test_load_partial_file() {
        let file = write_config(
            r#"{
                "device": { "path": "/dev/video2", "format": "mjpeg", "standard": "pal",
                            "controls": { "brightness": "auto", "contrast": "40" } },
                "encoder": { "workers": 3, "quality": 95 },
                "stream": { "last_as_blank_secs": 0 },
                "sinks": { "jpeg": { "object": "/vcap-jpeg" } }
            }"#,
        );
        let config = AppConfig::load(file.path()).unwrap();
        config.validate().unwrap();

        let device = config.device_config().unwrap();
        assert_eq!(device.path, std::path::PathBuf::from("/dev/video2"));
        assert_eq!(device.format, PixelFormat::Mjpeg);
        assert_eq!(device.standard, VideoStandard::Pal);
        assert_eq!(device.n_bufs, 4);
        assert_eq!(device.jpeg_quality, 95);
        assert!(!device.controls.is_empty());

        let stream = config.stream_config().unwrap();
        assert_eq!(stream.workers, 3);
        assert_eq!(stream.last_as_blank, Some(Duration::ZERO));

        let sink = config.sinks.jpeg.as_ref().unwrap();
        assert_eq!(sink.object, "/vcap-jpeg");
        assert!(config.sinks.raw.is_none());
        assert_eq!(SinkKind::Jpeg.name(), "JPEG");
    }

    #[test]
    fn test_unknown_names_rejected() {
        let mut config = AppConfig::default();
        config.device.format = "H265".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::UnknownFormat("H265".to_string()))
        );

        let mut config = AppConfig::default();
        config.device.standard = "MESECAM".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::UnknownStandard("MESECAM".to_string()))
        );

        let mut config = AppConfig::default();
        config.device.io_method = "DMABUF".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::UnknownIoMethod("DMABUF".to_string()))
        );
    }

    #[test]
    fn test_out_of_range_values() {
        let mut config = AppConfig::default();
        config.device.buffers = 33;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "device.buffers", .. })
        ));

        let mut config = AppConfig::default();
        config.encoder.quality = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.device.width = 100;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ResolutionOutOfBounds { .. })
        ));

        let mut config = AppConfig::default();
        config.stream.error_delay_secs = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.device.controls.insert("warp".to_string(), "1".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_sink_object() {
        let mut config = AppConfig::default();
        config.sinks.raw = Some(crate::stream::MemsinkConfig {
            object: "no-slash".to_string(),
            ..Default::default()
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "sinks.raw", .. })
        ));
    }

    #[test]
    fn test_load_errors() {
        let err = AppConfig::load("/nonexistent/vcap.json").unwrap_err();
        assert!(matches!(err, ConfigError::File { .. }));

        let file = write_config("{ not json");
        assert!(matches!(
            AppConfig::load(file.path()),
            Err(ConfigError::File { .. })
        ));
    }
}
