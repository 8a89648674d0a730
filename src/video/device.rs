//! Capture device: format negotiation, buffer pool and the grab/release cycle
//!
//! Each hardware buffer is a slot in a fixed arena. A slot is either owned by
//! the driver (queued) or held by exactly one consumer (grabbed). Grabbing
//! hands out a [`GrabbedBuffer`] carrying the slot index and a generation
//! number; releasing checks both, so a stale or repeated release is refused
//! instead of requeueing memory somebody else is reading.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::controls::{Controls, V4L2_CID_JPEG_COMPRESSION_QUALITY};
use super::driver::{CaptureDriver, DriverEvent};
use super::format::{IoMethod, PixelFormat, Resolution, VideoStandard, MAX_FPS};
use super::frame::RawFrame;
use super::v4l2::V4l2Driver;
use crate::error::{is_device_lost, ConfigError, DeviceError};
use crate::utils::{now_monotonic, StopToken};

/// Default number of hardware buffers
pub const DEFAULT_BUFFERS: u32 = 4;
/// Upper limit of hardware buffers
pub const MAX_BUFFERS: u32 = 32;
/// Frames smaller than this are treated as broken
pub const DEFAULT_MIN_FRAME_SIZE: usize = 128;

/// Device configuration
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub path: PathBuf,
    /// Input index (VIDIOC_S_INPUT)
    pub input: u32,
    pub resolution: Resolution,
    pub format: PixelFormat,
    /// Requested frame rate, 0 keeps the driver default
    pub fps: u32,
    pub standard: VideoStandard,
    pub io_method: IoMethod,
    pub n_bufs: u32,
    /// Take the resolution from the detected DV timings
    pub dv_timings: bool,
    /// Export buffers as DMA-BUF descriptors
    pub dma_export: bool,
    /// Fail to open when DMA export fails
    pub dma_required: bool,
    pub min_frame_size: usize,
    /// Don't reopen on select timeouts, serve blank frames instead
    pub persistent: bool,
    /// Readiness wait timeout
    pub timeout: Duration,
    /// Quality for devices with hardware JPEG compression
    pub jpeg_quality: u32,
    pub controls: Controls,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/dev/video0"),
            input: 0,
            resolution: Resolution::VGA,
            format: PixelFormat::Yuyv,
            fps: 0,
            standard: VideoStandard::Unknown,
            io_method: IoMethod::Mmap,
            n_bufs: DEFAULT_BUFFERS,
            dv_timings: false,
            dma_export: false,
            dma_required: false,
            min_frame_size: DEFAULT_MIN_FRAME_SIZE,
            persistent: false,
            timeout: Duration::from_secs(1),
            jpeg_quality: 80,
            controls: Controls::new(),
        }
    }
}

impl DeviceConfig {
    /// Check bounds before touching the hardware
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.resolution.is_valid() {
            return Err(ConfigError::ResolutionOutOfBounds {
                width: self.resolution.width,
                height: self.resolution.height,
            });
        }
        if self.fps > MAX_FPS {
            return Err(ConfigError::FpsOutOfBounds(self.fps));
        }
        if self.n_bufs == 0 || self.n_bufs > MAX_BUFFERS {
            return Err(ConfigError::Invalid {
                field: "device.buffers",
                reason: format!("{} is not in [1 .. {}]", self.n_bufs, MAX_BUFFERS),
            });
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "device.timeout",
                reason: "must be positive".to_string(),
            });
        }
        if self.jpeg_quality == 0 || self.jpeg_quality > 100 {
            return Err(ConfigError::Invalid {
                field: "device.jpeg_quality",
                reason: format!("{} is not in [1 .. 100]", self.jpeg_quality),
            });
        }
        Ok(())
    }
}

/// State negotiated with the driver, present only while the device is open
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceRuntime {
    pub resolution: Resolution,
    pub format: PixelFormat,
    pub stride: u32,
    /// Actual frame rate, 0 when unknown
    pub hz: u32,
    pub size_image: u32,
    pub n_bufs: u32,
    pub capture_mplane: bool,
    /// Buffers are exported as DMA-BUF
    pub dma: bool,
}

/// Outcome of [`Device::select`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectFlags {
    /// A buffer can be grabbed
    pub readable: bool,
    /// An event is waiting for [`Device::consume_event`]
    pub has_event: bool,
    /// The stop token fired
    pub stopped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Owned by the driver
    Queued,
    /// Held by a consumer
    Grabbed,
    /// Requeue failed, out of circulation until reopen
    Lost,
}

#[derive(Debug)]
struct Slot {
    state: SlotState,
    generation: u64,
    used: usize,
    dma_fd: Option<OwnedFd>,
}

/// Handle to a grabbed hardware buffer
///
/// Deliberately not `Clone`: the handle is the proof of ownership.
#[derive(Debug, PartialEq)]
pub struct GrabbedBuffer {
    index: u32,
    generation: u64,
    used: usize,
    sequence: u64,
    grab_ts: f64,
}

impl GrabbedBuffer {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Payload size
    pub fn used(&self) -> usize {
        self.used
    }

    /// Capture sequence number
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn grab_ts(&self) -> f64 {
        self.grab_ts
    }
}

/// One capture device
pub struct Device {
    config: DeviceConfig,
    driver: Box<dyn CaptureDriver>,
    runtime: Option<DeviceRuntime>,
    slots: Vec<Slot>,
    streaming: bool,
    sequence: u64,
    generation: u64,
    persistent_timeout_reported: bool,
}

impl Device {
    /// Device backed by the V4L2 driver
    pub fn new(config: DeviceConfig) -> Self {
        Self::with_driver(config, Box::new(V4l2Driver::new()))
    }

    pub fn with_driver(config: DeviceConfig, driver: Box<dyn CaptureDriver>) -> Self {
        Self {
            config,
            driver,
            runtime: None,
            slots: Vec::new(),
            streaming: false,
            sequence: 0,
            generation: 0,
            persistent_timeout_reported: false,
        }
    }

    pub fn parse_format(s: &str) -> Option<PixelFormat> {
        PixelFormat::parse(s)
    }

    pub fn parse_standard(s: &str) -> VideoStandard {
        VideoStandard::parse(s)
    }

    pub fn parse_io_method(s: &str) -> Option<IoMethod> {
        IoMethod::parse(s)
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Negotiated state, `None` while closed
    pub fn runtime(&self) -> Option<&DeviceRuntime> {
        self.runtime.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.runtime.is_some()
    }

    /// Number of buffers currently held by consumers
    pub fn grabbed_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::Grabbed)
            .count()
    }

    /// Open, negotiate, allocate and start streaming
    ///
    /// On failure everything allocated so far is torn down again.
    pub fn open(&mut self) -> Result<(), DeviceError> {
        self.close();
        self.config.validate()?;

        if let Err(e) = self.driver.open(&self.config.path) {
            return Err(DeviceError::Open {
                path: self.config.path.display().to_string(),
                source: e,
            });
        }
        match self.open_inner() {
            Ok(runtime) => {
                info!(
                    "Capture format: {} {} stride={} hz={} buffers={} dma={}",
                    runtime.resolution,
                    runtime.format,
                    runtime.stride,
                    runtime.hz,
                    runtime.n_bufs,
                    runtime.dma
                );
                self.runtime = Some(runtime);
                self.persistent_timeout_reported = false;
                Ok(())
            }
            Err(e) => {
                self.teardown();
                Err(e)
            }
        }
    }

    fn open_inner(&mut self) -> Result<DeviceRuntime, DeviceError> {
        let caps = self
            .driver
            .capabilities()
            .map_err(|e| DeviceError::Capability(format!("query failed: {}", e)))?;
        if !caps.capture && !caps.capture_mplane {
            return Err(DeviceError::Capability(format!(
                "{} is not a video capture device",
                caps.card
            )));
        }
        if !caps.streaming {
            return Err(DeviceError::Capability(format!(
                "{} doesn't support streaming I/O",
                caps.card
            )));
        }
        info!(
            "Using device {} (driver={}, card={}, bus={}{})",
            self.config.path.display(),
            caps.driver,
            caps.card,
            caps.bus,
            if caps.capture { "" } else { ", multi-planar" }
        );

        self.driver
            .set_input(self.config.input)
            .map_err(|e| DeviceError::Negotiate(format!("can't set input {}: {}", self.config.input, e)))?;

        if self.config.standard != VideoStandard::Unknown {
            self.driver.set_standard(self.config.standard).map_err(|e| {
                DeviceError::Negotiate(format!(
                    "can't set standard {}: {}",
                    self.config.standard, e
                ))
            })?;
        }

        let mut resolution = self.config.resolution;
        let mut hz = 0u32;
        if self.config.dv_timings {
            match self.driver.apply_dv_timings() {
                Ok(timings) => {
                    if !timings.resolution.is_valid() {
                        return Err(DeviceError::Negotiate(format!(
                            "detected DV timings {} are out of bounds",
                            timings.resolution
                        )));
                    }
                    info!(
                        "Using DV timings: {} @ {:.2} Hz",
                        timings.resolution, timings.hz
                    );
                    resolution = timings.resolution;
                    hz = timings.hz.round() as u32;
                }
                Err(e) => warn!("Can't apply DV timings, using {}: {}", resolution, e),
            }
        }

        let negotiated = self
            .driver
            .set_format(resolution, self.config.format)
            .map_err(|e| DeviceError::Negotiate(format!("can't set format: {}", e)))?;
        if negotiated.format != self.config.format {
            return Err(DeviceError::Negotiate(format!(
                "could not obtain {}, driver offers {}",
                self.config.format, negotiated.format
            )));
        }
        if !negotiated.resolution.is_valid() {
            return Err(DeviceError::Negotiate(format!(
                "driver offers {} which is out of bounds",
                negotiated.resolution
            )));
        }
        if negotiated.resolution != resolution {
            warn!(
                "Requested resolution {} is not available, using {}",
                resolution, negotiated.resolution
            );
        }
        let mut stride = negotiated.stride;
        if let Some(min) = self.config.format.min_stride(negotiated.resolution.width) {
            if stride == 0 {
                stride = min;
            } else if stride < min {
                return Err(DeviceError::Negotiate(format!(
                    "driver stride {} is too small for {} {}",
                    stride, negotiated.resolution, negotiated.format
                )));
            }
        }

        if self.config.fps > 0 {
            match self.driver.set_frame_rate(self.config.fps) {
                Ok(actual) if actual > 0 => {
                    if actual != self.config.fps {
                        warn!("Requested {} fps, driver gives {}", self.config.fps, actual);
                    }
                    hz = actual;
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to set hardware FPS: {}", e),
            }
        }

        if self.config.format.is_compressed() {
            self.apply_jpeg_quality();
        }

        let n_bufs = self
            .driver
            .request_buffers(
                self.config.n_bufs,
                self.config.io_method,
                negotiated.size_image as usize,
            )
            .map_err(|e| DeviceError::Allocate {
                fatal: e.raw_os_error() == Some(libc::ENOMEM),
                reason: format!("{} x {}: {}", self.config.n_bufs, self.config.io_method, e),
            })?;
        if n_bufs != self.config.n_bufs {
            info!("Requested {} buffers, got {}", self.config.n_bufs, n_bufs);
        }

        self.slots = (0..n_bufs)
            .map(|_| Slot {
                state: SlotState::Queued,
                generation: 0,
                used: 0,
                dma_fd: None,
            })
            .collect();
        let dma = self.export_buffers()?;

        self.config.controls.apply(self.driver.as_mut());

        for index in 0..n_bufs {
            self.driver
                .queue_buffer(index)
                .map_err(|e| DeviceError::Stream(format!("can't queue buffer {}: {}", index, e)))?;
        }
        self.driver
            .stream_on()
            .map_err(|e| DeviceError::Stream(format!("can't start streaming: {}", e)))?;
        self.streaming = true;

        if let Err(e) = self.driver.subscribe_events() {
            debug!("Can't subscribe to source change events: {}", e);
        }

        Ok(DeviceRuntime {
            resolution: negotiated.resolution,
            format: negotiated.format,
            stride,
            hz,
            size_image: negotiated.size_image,
            n_bufs,
            capture_mplane: !caps.capture,
            dma,
        })
    }

    fn apply_jpeg_quality(&mut self) {
        let quality = self.config.jpeg_quality as i32;
        match self.driver.query_control(V4L2_CID_JPEG_COMPRESSION_QUALITY) {
            Ok(Some(_)) => {
                match self
                    .driver
                    .set_control(V4L2_CID_JPEG_COMPRESSION_QUALITY, quality)
                {
                    Ok(()) => info!("Using hardware JPEG quality {}", quality),
                    Err(e) => warn!("Can't set hardware JPEG quality: {}", e),
                }
            }
            Ok(None) => debug!("Device has no JPEG quality control"),
            Err(e) => warn!("Can't query hardware JPEG quality: {}", e),
        }
    }

    /// Export all buffers when configured, returns whether DMA is in use
    fn export_buffers(&mut self) -> Result<bool, DeviceError> {
        if !self.config.dma_export {
            return Ok(false);
        }
        if self.config.io_method != IoMethod::Mmap {
            if self.config.dma_required {
                return Err(DeviceError::Capability(
                    "DMA export requires MMAP I/O".to_string(),
                ));
            }
            warn!("DMA export requires MMAP I/O, disabled");
            return Ok(false);
        }
        for index in 0..self.slots.len() as u32 {
            match self.driver.export_buffer(index) {
                Ok(fd) => self.slots[index as usize].dma_fd = Some(fd),
                Err(e) if self.config.dma_required => {
                    return Err(DeviceError::DmaExport { index, source: e })
                }
                Err(e) => {
                    warn!("Can't export buffer {} as DMA-BUF, DMA disabled: {}", index, e);
                    for slot in &mut self.slots {
                        slot.dma_fd = None;
                    }
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Stop streaming and free everything. Safe to call any time.
    pub fn close(&mut self) {
        if self.runtime.is_none() && self.slots.is_empty() && !self.streaming {
            return;
        }
        let grabbed = self.grabbed_count();
        if grabbed > 0 {
            warn!("Closing device with {} buffers still grabbed", grabbed);
        }
        self.teardown();
        info!("Device {} closed", self.config.path.display());
    }

    fn teardown(&mut self) {
        if self.streaming {
            if let Err(e) = self.driver.stream_off() {
                debug!("Failed to stop capture stream: {}", e);
            }
            self.streaming = false;
        }
        self.slots.clear();
        self.driver.release_buffers();
        self.driver.close();
        self.runtime = None;
    }

    /// Wait until a buffer is ready, an event is pending or `stop` fires
    ///
    /// A timeout is an error: [`DeviceError::Timeout`] normally, or
    /// [`DeviceError::PersistentTimeout`] for persistent devices, which is
    /// logged only the first time in a row.
    pub fn select(&mut self, stop: Option<&StopToken>) -> Result<SelectFlags, DeviceError> {
        if self.runtime.is_none() {
            return Err(DeviceError::NotOpen);
        }
        if stop.is_some_and(|s| s.is_stopped()) {
            return Ok(SelectFlags {
                stopped: true,
                ..Default::default()
            });
        }

        let ready = self
            .driver
            .poll(self.config.timeout, stop.map(|s| s.wake_fd()))
            .map_err(|e| self.classify(e, "poll"))?;

        if ready.woken || stop.is_some_and(|s| s.is_stopped()) {
            return Ok(SelectFlags {
                stopped: true,
                ..Default::default()
            });
        }
        if ready.has_error && !ready.readable && !ready.has_event {
            return Err(DeviceError::Disconnected(
                "device reported an error condition".to_string(),
            ));
        }
        if !ready.readable && !ready.has_event {
            if self.config.persistent {
                if !self.persistent_timeout_reported {
                    warn!("Persistent device timeout (unplugged?)");
                    self.persistent_timeout_reported = true;
                }
                return Err(DeviceError::PersistentTimeout);
            }
            return Err(DeviceError::Timeout);
        }
        if self.persistent_timeout_reported && ready.readable {
            info!("Device is alive again after persistent timeout");
            self.persistent_timeout_reported = false;
        }
        Ok(SelectFlags {
            readable: ready.readable,
            has_event: ready.has_event,
            stopped: false,
        })
    }

    fn classify(&self, err: io::Error, op: &str) -> DeviceError {
        if is_device_lost(&err) {
            DeviceError::Disconnected(format!("{}: {}", op, err))
        } else {
            DeviceError::Grab(format!("{}: {}", op, err))
        }
    }

    /// Dequeue one filled buffer and mark its slot grabbed
    pub fn grab_buffer(&mut self) -> Result<GrabbedBuffer, DeviceError> {
        if self.runtime.is_none() {
            return Err(DeviceError::NotOpen);
        }
        let buf = self
            .driver
            .dequeue_buffer()
            .map_err(|e| self.classify(e, "dequeue"))?;

        let Some(slot) = self.slots.get_mut(buf.index as usize) else {
            return Err(DeviceError::Grab(format!(
                "driver returned unknown buffer {}",
                buf.index
            )));
        };
        if slot.state != SlotState::Queued {
            return Err(DeviceError::Grab(format!(
                "driver returned buffer {} which is not queued",
                buf.index
            )));
        }

        if buf.error || buf.used < self.config.min_frame_size {
            debug!(
                "Dropping broken frame: buffer={} bytes={} error_flag={}",
                buf.index, buf.used, buf.error
            );
            self.driver
                .queue_buffer(buf.index)
                .map_err(|e| self.classify(e, "requeue"))?;
            return Err(DeviceError::BrokenFrame {
                index: buf.index,
                used: buf.used,
            });
        }

        self.generation += 1;
        self.sequence += 1;
        let slot = &mut self.slots[buf.index as usize];
        slot.state = SlotState::Grabbed;
        slot.generation = self.generation;
        slot.used = buf.used;

        Ok(GrabbedBuffer {
            index: buf.index,
            generation: self.generation,
            used: buf.used,
            sequence: self.sequence,
            grab_ts: now_monotonic(),
        })
    }

    fn grabbed_slot(&self, buffer: &GrabbedBuffer) -> Result<&Slot, DeviceError> {
        self.slots
            .get(buffer.index as usize)
            .filter(|s| s.state == SlotState::Grabbed && s.generation == buffer.generation)
            .ok_or(DeviceError::NotGrabbed {
                index: buffer.index,
            })
    }

    /// Give a grabbed buffer back to the driver
    ///
    /// Must be called once per grab, after every consumer is done with the
    /// data. A second call with the same handle fails with
    /// [`DeviceError::NotGrabbed`] and changes nothing.
    pub fn release_buffer(&mut self, buffer: &GrabbedBuffer) -> Result<(), DeviceError> {
        self.grabbed_slot(buffer)?;
        let index = buffer.index;
        match self.driver.queue_buffer(index) {
            Ok(()) => {
                self.slots[index as usize].state = SlotState::Queued;
                Ok(())
            }
            Err(e) => {
                self.slots[index as usize].state = SlotState::Lost;
                if is_device_lost(&e) {
                    Err(DeviceError::Disconnected(format!("requeue: {}", e)))
                } else {
                    error!("Can't requeue buffer {}: {}", index, e);
                    Err(DeviceError::Release { index, source: e })
                }
            }
        }
    }

    /// Raw frame for a grabbed buffer
    ///
    /// With `copy` the payload is copied out and the buffer may be released
    /// right away. Without it the frame is a read-only view and the buffer
    /// must stay grabbed until the frame is dropped.
    pub fn frame(&self, buffer: &GrabbedBuffer, copy: bool) -> Result<RawFrame, DeviceError> {
        let slot = self.grabbed_slot(buffer)?;
        let runtime = self.runtime.as_ref().ok_or(DeviceError::NotOpen)?;
        let region = self.driver.region(buffer.index).ok_or_else(|| {
            DeviceError::Grab(format!("no memory behind buffer {}", buffer.index))
        })?;
        let mut frame = RawFrame::mapped(
            region,
            slot.used,
            runtime.resolution,
            runtime.format,
            runtime.stride,
            buffer.sequence,
        );
        frame.grab_ts = buffer.grab_ts;
        frame.dma_fd = slot.dma_fd.as_ref().map(|fd| fd.as_raw_fd());
        Ok(if copy { frame.into_owned() } else { frame })
    }

    /// Drain pending driver events
    ///
    /// Returns [`DeviceError::SourceChanged`] when the source changed and the
    /// device must be reopened.
    pub fn consume_event(&mut self) -> Result<(), DeviceError> {
        if self.runtime.is_none() {
            return Err(DeviceError::NotOpen);
        }
        let mut changed = false;
        loop {
            match self.driver.dequeue_event() {
                Ok(Some(DriverEvent::SourceChange)) => {
                    info!("Got V4L2_EVENT_SOURCE_CHANGE: source changed");
                    changed = true;
                }
                Ok(Some(DriverEvent::Eos)) => {
                    info!("Got V4L2_EVENT_EOS: end of stream");
                    return Err(DeviceError::Event("end of stream".to_string()));
                }
                Ok(Some(DriverEvent::Other(kind))) => debug!("Ignoring V4L2 event {}", kind),
                Ok(None) => break,
                Err(e) if is_device_lost(&e) => {
                    return Err(DeviceError::Disconnected(format!("dqevent: {}", e)))
                }
                Err(e) => return Err(DeviceError::Event(e.to_string())),
            }
        }
        if changed {
            Err(DeviceError::SourceChanged)
        } else {
            Ok(())
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::controls::{ControlId, ControlMode, V4L2_CID_BRIGHTNESS};
    use crate::video::driver::{DriverCapabilities, DvTimings};
    use crate::video::mock::{Idle, MockDriver, MockHandle, MockStep};

    fn mock_device(config: DeviceConfig) -> (Device, MockHandle) {
        let (driver, handle) = MockDriver::new();
        (Device::with_driver(config, Box::new(driver)), handle)
    }

    fn small_config() -> DeviceConfig {
        DeviceConfig {
            resolution: Resolution::new(160, 120),
            timeout: Duration::from_millis(20),
            ..Default::default()
        }
    }

    #[test]
    fn test_open_negotiates_and_streams() {
        let (mut device, handle) = mock_device(small_config());
        assert!(device.runtime().is_none());

        device.open().unwrap();
        let runtime = device.runtime().unwrap().clone();
        assert_eq!(runtime.resolution, Resolution::new(160, 120));
        assert_eq!(runtime.format, PixelFormat::Yuyv);
        assert_eq!(runtime.stride, 320);
        assert_eq!(runtime.n_bufs, DEFAULT_BUFFERS);
        assert!(handle.is_streaming());
        assert_eq!(handle.queued(), DEFAULT_BUFFERS as usize);
        assert!(handle.subscribed());
        assert_eq!(handle.input(), Some(0));
        assert_eq!(handle.standard(), None);

        device.close();
        assert!(device.runtime().is_none());
        assert!(!handle.is_open());
        device.close();
    }

    #[test]
    fn test_config_errors_are_fatal() {
        let (mut device, handle) = mock_device(DeviceConfig {
            resolution: Resolution::new(100, 100),
            ..Default::default()
        });
        let err = device.open().unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(
            err,
            DeviceError::Config(ConfigError::ResolutionOutOfBounds { .. })
        ));
        assert_eq!(handle.opens(), 0);

        let (mut device, _) = mock_device(DeviceConfig {
            fps: 121,
            ..Default::default()
        });
        assert!(matches!(
            device.open(),
            Err(DeviceError::Config(ConfigError::FpsOutOfBounds(121)))
        ));
    }

    #[test]
    fn test_negotiated_out_of_bounds_undoes_open() {
        let (mut device, handle) = mock_device(small_config());
        handle.set_max_resolution(Resolution::new(100, 100));
        let err = device.open().unwrap_err();
        assert!(matches!(err, DeviceError::Negotiate(_)));
        assert!(!err.is_fatal());
        assert!(!handle.is_open());
        assert!(device.runtime().is_none());
    }

    #[test]
    fn test_driver_adjusted_resolution_within_bounds() {
        let (mut device, handle) = mock_device(DeviceConfig {
            resolution: Resolution::new(1920, 1080),
            ..small_config()
        });
        handle.set_max_resolution(Resolution::new(1280, 720));
        device.open().unwrap();
        assert_eq!(device.runtime().unwrap().resolution, Resolution::new(1280, 720));
    }

    #[test]
    fn test_capability_checks() {
        let (mut device, handle) = mock_device(small_config());
        handle.set_capabilities(DriverCapabilities {
            capture: false,
            capture_mplane: false,
            streaming: true,
            ..Default::default()
        });
        assert!(matches!(device.open(), Err(DeviceError::Capability(_))));

        handle.set_capabilities(DriverCapabilities {
            capture: false,
            capture_mplane: true,
            streaming: true,
            ..Default::default()
        });
        device.open().unwrap();
        assert!(device.runtime().unwrap().capture_mplane);
    }

    #[test]
    fn test_grab_release_invariant() {
        let (mut device, handle) = mock_device(small_config());
        device.open().unwrap();

        let a = device.grab_buffer().unwrap();
        let b = device.grab_buffer().unwrap();
        assert_ne!(a.index(), b.index());
        assert_eq!(b.sequence(), a.sequence() + 1);
        assert_eq!(device.grabbed_count(), 2);
        assert_eq!(handle.queued(), 2);

        device.release_buffer(&a).unwrap();
        assert!(matches!(
            device.release_buffer(&a),
            Err(DeviceError::NotGrabbed { .. })
        ));
        assert_eq!(handle.queued(), 3);
        assert_eq!(device.grabbed_count(), 1);

        device.release_buffer(&b).unwrap();
        assert_eq!(handle.queued(), 4);
    }

    #[test]
    fn test_stale_handle_after_regrab() {
        let (mut device, _) = mock_device(DeviceConfig {
            n_bufs: 1,
            ..small_config()
        });
        device.open().unwrap();

        let first = device.grab_buffer().unwrap();
        device.release_buffer(&first).unwrap();
        let second = device.grab_buffer().unwrap();
        assert_eq!(first.index(), second.index());

        assert!(device.release_buffer(&first).is_err());
        assert!(device.frame(&first, true).is_err());
        device.release_buffer(&second).unwrap();
    }

    #[test]
    fn test_broken_frames_are_requeued() {
        let (mut device, handle) = mock_device(small_config());
        device.open().unwrap();
        handle.push([MockStep::Data(vec![0; 10]), MockStep::Corrupted]);

        assert!(matches!(
            device.grab_buffer(),
            Err(DeviceError::BrokenFrame { used: 10, .. })
        ));
        assert!(matches!(
            device.grab_buffer(),
            Err(DeviceError::BrokenFrame { .. })
        ));
        assert_eq!(handle.queued(), DEFAULT_BUFFERS as usize);
        assert_eq!(device.grabbed_count(), 0);
    }

    #[test]
    fn test_frame_copy_and_view() {
        let (mut device, handle) = mock_device(small_config());
        device.open().unwrap();
        let payload: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        handle.push([MockStep::Data(payload.clone())]);

        let buf = device.grab_buffer().unwrap();
        let view = device.frame(&buf, false).unwrap();
        let copy = device.frame(&buf, true).unwrap();
        assert!(view.is_mapped());
        assert!(!copy.is_mapped());
        assert_eq!(view.data(), payload.as_slice());
        assert_eq!(copy.data(), payload.as_slice());
        assert_eq!(copy.stride, 320);
        assert_eq!(copy.sequence, buf.sequence());
        device.release_buffer(&buf).unwrap();
    }

    #[test]
    fn test_select_timeouts() {
        let (mut device, handle) = mock_device(small_config());
        handle.set_idle(Idle::Timeout);
        device.open().unwrap();
        assert!(matches!(device.select(None), Err(DeviceError::Timeout)));

        let (mut device, handle) = mock_device(DeviceConfig {
            persistent: true,
            ..small_config()
        });
        handle.set_idle(Idle::Timeout);
        device.open().unwrap();
        assert!(matches!(
            device.select(None),
            Err(DeviceError::PersistentTimeout)
        ));
        assert!(device.persistent_timeout_reported);
        handle.set_idle(Idle::Frames);
        assert!(device.select(None).unwrap().readable);
        assert!(!device.persistent_timeout_reported);
    }

    #[test]
    fn test_select_stop_token() {
        let (mut device, handle) = mock_device(DeviceConfig {
            timeout: Duration::from_secs(5),
            ..small_config()
        });
        handle.set_idle(Idle::Timeout);
        device.open().unwrap();

        let stop = std::sync::Arc::new(StopToken::new().unwrap());
        let stopper = stop.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            stopper.stop();
        });
        let started = std::time::Instant::now();
        let flags = device.select(Some(&stop)).unwrap();
        assert!(flags.stopped);
        assert!(started.elapsed() < Duration::from_secs(2));
        t.join().unwrap();
    }

    #[test]
    fn test_disconnect() {
        let (mut device, handle) = mock_device(small_config());
        device.open().unwrap();
        handle.push([MockStep::Disconnect]);
        let err = device.select(None).unwrap_err();
        assert!(err.is_disconnect());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_source_change_event() {
        let (mut device, handle) = mock_device(small_config());
        device.open().unwrap();
        handle.push([MockStep::Event(DriverEvent::Other(1)), MockStep::Event(DriverEvent::SourceChange)]);
        let flags = device.select(None).unwrap();
        assert!(flags.has_event);
        assert!(matches!(
            device.consume_event(),
            Err(DeviceError::SourceChanged)
        ));
        assert!(device.consume_event().is_ok());
    }

    #[test]
    fn test_controls_and_hw_quality() {
        let mut controls = Controls::new();
        controls.set(ControlId::Brightness, ControlMode::Value(70));
        controls.set(ControlId::Contrast, ControlMode::Default);
        controls.set(ControlId::Saturation, ControlMode::Value(500));
        let (mut device, handle) = mock_device(DeviceConfig {
            format: PixelFormat::Mjpeg,
            jpeg_quality: 60,
            controls,
            ..small_config()
        });
        device.open().unwrap();
        assert_eq!(handle.control_value(V4L2_CID_BRIGHTNESS), Some(70));
        assert_eq!(handle.control_value(ControlId::Contrast.cid()), Some(50));
        // Out of range values are skipped
        assert_eq!(handle.control_value(ControlId::Saturation.cid()), None);
        assert_eq!(
            handle.control_value(V4L2_CID_JPEG_COMPRESSION_QUALITY),
            Some(60)
        );
        assert_eq!(device.runtime().unwrap().stride, 0);
    }

    #[test]
    fn test_allocation_failures() {
        let (mut device, handle) = mock_device(small_config());
        handle.set_reqbufs_error(Some(libc::ENOMEM));
        let err = device.open().unwrap_err();
        assert!(err.is_fatal());
        assert!(!handle.is_open());

        handle.set_reqbufs_error(Some(libc::EBUSY));
        let err = device.open().unwrap_err();
        assert!(matches!(err, DeviceError::Allocate { fatal: false, .. }));
    }

    #[test]
    fn test_driver_grants_fewer_buffers() {
        let (mut device, handle) = mock_device(small_config());
        handle.set_max_buffers(2);
        device.open().unwrap();
        assert_eq!(device.runtime().unwrap().n_bufs, 2);
        assert_eq!(handle.buffer_count(), 2);
        assert_eq!(handle.queued(), 2);
    }

    #[test]
    fn test_dma_export() {
        let (mut device, handle) = mock_device(DeviceConfig {
            dma_export: true,
            ..small_config()
        });
        device.open().unwrap();
        assert!(device.runtime().unwrap().dma);
        let buf = device.grab_buffer().unwrap();
        assert!(device.frame(&buf, true).unwrap().dma_fd.is_some());
        device.release_buffer(&buf).unwrap();

        handle.set_export_error(Some(libc::ENOTTY));
        device.open().unwrap();
        assert!(!device.runtime().unwrap().dma);

        let (mut device, handle) = mock_device(DeviceConfig {
            dma_export: true,
            dma_required: true,
            ..small_config()
        });
        handle.set_export_error(Some(libc::ENOTTY));
        assert!(matches!(device.open(), Err(DeviceError::DmaExport { .. })));
        assert!(!handle.is_open());
    }

    #[test]
    fn test_dv_timings_and_standard() {
        let (mut device, handle) = mock_device(DeviceConfig {
            dv_timings: true,
            standard: VideoStandard::Pal,
            input: 2,
            ..small_config()
        });
        handle.set_dv_timings(DvTimings {
            resolution: Resolution::new(1280, 720),
            hz: 59.94,
        });
        device.open().unwrap();
        let runtime = device.runtime().unwrap();
        assert_eq!(runtime.resolution, Resolution::new(1280, 720));
        assert_eq!(runtime.hz, 60);
        assert_eq!(handle.standard(), Some(VideoStandard::Pal));
        assert_eq!(handle.input(), Some(2));
    }

    #[test]
    fn test_parsers() {
        assert_eq!(Device::parse_format("uyvy"), Some(PixelFormat::Uyvy));
        assert_eq!(Device::parse_format("h264"), None);
        assert_eq!(Device::parse_standard("ntsc"), VideoStandard::Ntsc);
        assert_eq!(Device::parse_standard("hdmi"), VideoStandard::Unknown);
        assert_eq!(Device::parse_io_method("mmap"), Some(IoMethod::Mmap));
        assert_eq!(Device::parse_io_method("read"), None);
    }

    #[test]
    fn test_not_open() {
        let (mut device, _) = mock_device(small_config());
        assert!(matches!(device.select(None), Err(DeviceError::NotOpen)));
        assert!(matches!(device.grab_buffer(), Err(DeviceError::NotOpen)));
        assert!(matches!(device.consume_event(), Err(DeviceError::NotOpen)));
    }
}
