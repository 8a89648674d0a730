//! Scripted capture driver for testing without hardware.
//!
//! The driver is moved into a [`Device`](super::device::Device); tests keep a
//! [`MockHandle`] to script what the "hardware" does next and to inspect the
//! buffer queue from the outside.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use parking_lot::Mutex;

use super::controls::V4L2_CID_JPEG_COMPRESSION_QUALITY;
use super::driver::{
    BufferRegion, CaptureDriver, ControlInfo, DequeuedBuffer, DriverCapabilities, DriverEvent,
    DvTimings, HeapRegion, NegotiatedFormat, Readiness,
};
use super::format::{IoMethod, PixelFormat, Resolution, VideoStandard};

/// What the device does on the next readiness wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockStep {
    /// Deliver a generated test pattern of full size
    Frame,
    /// Deliver these bytes
    Data(Vec<u8>),
    /// Deliver a buffer flagged with `V4L2_BUF_FLAG_ERROR`
    Corrupted,
    /// Nothing happens until the wait times out
    Timeout,
    /// Raise an event
    Event(DriverEvent),
    /// The device vanishes (ENODEV from now on)
    Disconnect,
}

/// Behaviour once the script is exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Idle {
    Frames,
    Timeout,
}

#[derive(Debug)]
struct MockState {
    capabilities: DriverCapabilities,
    script: VecDeque<MockStep>,
    idle: Idle,
    frame_interval: Duration,
    max_resolution: Option<Resolution>,
    dv_timings: Option<DvTimings>,
    max_buffers: u32,
    open_error: Option<i32>,
    reqbufs_error: Option<i32>,
    export_error: Option<i32>,
    controls: HashMap<u32, ControlInfo>,

    open: bool,
    gone: bool,
    streaming: bool,
    negotiated: Option<NegotiatedFormat>,
    fps: u32,
    input: Option<u32>,
    standard: Option<VideoStandard>,
    regions: Vec<Arc<HeapRegion>>,
    queued: VecDeque<u32>,
    subscribed: bool,
    values: HashMap<u32, i32>,
    opens: u32,
    sequence: u32,
}

impl Default for MockState {
    fn default() -> Self {
        let mut controls = HashMap::new();
        for cid in (0x0098_0900..=0x0098_0922).chain([V4L2_CID_JPEG_COMPRESSION_QUALITY]) {
            controls.insert(
                cid,
                ControlInfo {
                    minimum: 0,
                    maximum: 100,
                    step: 1,
                    default: 50,
                    disabled: false,
                },
            );
        }
        Self {
            capabilities: DriverCapabilities {
                driver: "mock".to_owned(),
                card: "Mock Camera".to_owned(),
                bus: "mock:0".to_owned(),
                capture: true,
                capture_mplane: false,
                streaming: true,
            },
            script: VecDeque::new(),
            idle: Idle::Frames,
            frame_interval: Duration::ZERO,
            max_resolution: None,
            dv_timings: None,
            max_buffers: 32,
            open_error: None,
            reqbufs_error: None,
            export_error: None,
            controls,
            open: false,
            gone: false,
            streaming: false,
            negotiated: None,
            fps: 0,
            input: None,
            standard: None,
            regions: Vec::new(),
            queued: VecDeque::new(),
            subscribed: false,
            values: HashMap::new(),
            opens: 0,
            sequence: 0,
        }
    }
}

/// Mock driver for testing without hardware.
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
}

/// Scripting and inspection side of a [`MockDriver`]
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockDriver {
    pub fn new() -> (Self, MockHandle) {
        let state = Arc::new(Mutex::new(MockState::default()));
        (
            Self {
                state: state.clone(),
            },
            MockHandle { state },
        )
    }
}

impl MockHandle {
    /// Append steps to the script
    pub fn push(&self, steps: impl IntoIterator<Item = MockStep>) {
        self.state.lock().script.extend(steps);
    }

    pub fn set_idle(&self, idle: Idle) {
        self.state.lock().idle = idle;
    }

    /// Delay before each frame becomes readable
    pub fn set_frame_interval(&self, interval: Duration) {
        self.state.lock().frame_interval = interval;
    }

    /// Make the driver clamp formats like real hardware would
    pub fn set_max_resolution(&self, resolution: Resolution) {
        self.state.lock().max_resolution = Some(resolution);
    }

    pub fn set_dv_timings(&self, timings: DvTimings) {
        self.state.lock().dv_timings = Some(timings);
    }

    pub fn set_max_buffers(&self, count: u32) {
        self.state.lock().max_buffers = count;
    }

    pub fn set_capabilities(&self, capabilities: DriverCapabilities) {
        self.state.lock().capabilities = capabilities;
    }

    /// errno returned by the next opens (`None` to succeed)
    pub fn set_open_error(&self, errno: Option<i32>) {
        self.state.lock().open_error = errno;
    }

    pub fn set_reqbufs_error(&self, errno: Option<i32>) {
        self.state.lock().reqbufs_error = errno;
    }

    pub fn set_export_error(&self, errno: Option<i32>) {
        self.state.lock().export_error = errno;
    }

    /// Bring a disconnected device back
    pub fn reconnect(&self) {
        self.state.lock().gone = false;
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn is_streaming(&self) -> bool {
        self.state.lock().streaming
    }

    pub fn opens(&self) -> u32 {
        self.state.lock().opens
    }

    /// Buffers currently owned by the driver
    pub fn queued(&self) -> usize {
        self.state.lock().queued.len()
    }

    pub fn buffer_count(&self) -> usize {
        self.state.lock().regions.len()
    }

    pub fn control_value(&self, cid: u32) -> Option<i32> {
        self.state.lock().values.get(&cid).copied()
    }

    pub fn input(&self) -> Option<u32> {
        self.state.lock().input
    }

    pub fn standard(&self) -> Option<VideoStandard> {
        self.state.lock().standard
    }

    pub fn subscribed(&self) -> bool {
        self.state.lock().subscribed
    }

    pub fn script_len(&self) -> usize {
        self.state.lock().script.len()
    }
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

/// Sleep, returning early (true) if `wake` becomes readable
fn wait(timeout: Duration, wake: Option<BorrowedFd<'_>>) -> bool {
    match wake {
        Some(fd) => {
            let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
            let ms = timeout.as_millis().min(u16::MAX as u128) as u16;
            matches!(poll(&mut fds, PollTimeout::from(ms)), Ok(n) if n > 0)
        }
        None => {
            std::thread::sleep(timeout);
            false
        }
    }
}

/// Gradient of `size` bytes, shifted by the sequence number
fn pattern(size: usize, sequence: u32) -> Vec<u8> {
    (0..size)
        .map(|i| (i as u32).wrapping_add(sequence) as u8)
        .collect()
}

impl MockState {
    fn check_open(&self) -> io::Result<()> {
        if self.gone {
            return Err(errno(libc::ENODEV));
        }
        if !self.open {
            return Err(errno(libc::EBADF));
        }
        Ok(())
    }

    fn next_step(&self) -> MockStep {
        match self.script.front() {
            Some(step) => step.clone(),
            None => match self.idle {
                Idle::Frames => MockStep::Frame,
                Idle::Timeout => MockStep::Timeout,
            },
        }
    }
}

impl CaptureDriver for MockDriver {
    fn open(&mut self, _path: &Path) -> io::Result<()> {
        let mut s = self.state.lock();
        if s.gone {
            return Err(errno(libc::ENOENT));
        }
        if let Some(code) = s.open_error {
            return Err(errno(code));
        }
        s.open = true;
        s.opens += 1;
        Ok(())
    }

    fn close(&mut self) {
        let mut s = self.state.lock();
        s.open = false;
        s.streaming = false;
        s.subscribed = false;
        s.queued.clear();
        s.regions.clear();
        s.negotiated = None;
    }

    fn capabilities(&mut self) -> io::Result<DriverCapabilities> {
        let s = self.state.lock();
        s.check_open()?;
        Ok(s.capabilities.clone())
    }

    fn set_input(&mut self, input: u32) -> io::Result<()> {
        let mut s = self.state.lock();
        s.check_open()?;
        s.input = Some(input);
        Ok(())
    }

    fn set_standard(&mut self, standard: VideoStandard) -> io::Result<()> {
        let mut s = self.state.lock();
        s.check_open()?;
        s.standard = Some(standard);
        Ok(())
    }

    fn apply_dv_timings(&mut self) -> io::Result<DvTimings> {
        let s = self.state.lock();
        s.check_open()?;
        s.dv_timings.ok_or_else(|| errno(libc::ENOLINK))
    }

    fn set_format(
        &mut self,
        resolution: Resolution,
        format: PixelFormat,
    ) -> io::Result<NegotiatedFormat> {
        let mut s = self.state.lock();
        s.check_open()?;
        let resolution = match s.max_resolution {
            Some(max) => Resolution::new(
                resolution.width.min(max.width),
                resolution.height.min(max.height),
            ),
            None => resolution,
        };
        let stride = format.min_stride(resolution.width).unwrap_or(0);
        let size_image = match format.bytes_per_pixel() {
            Some(_) => stride * resolution.height,
            None => resolution.width * resolution.height,
        };
        let negotiated = NegotiatedFormat {
            resolution,
            format,
            stride,
            size_image,
        };
        s.negotiated = Some(negotiated);
        Ok(negotiated)
    }

    fn set_frame_rate(&mut self, fps: u32) -> io::Result<u32> {
        let mut s = self.state.lock();
        s.check_open()?;
        s.fps = fps;
        Ok(fps)
    }

    fn request_buffers(&mut self, count: u32, _io_method: IoMethod, size: usize) -> io::Result<u32> {
        let mut s = self.state.lock();
        s.check_open()?;
        if let Some(code) = s.reqbufs_error {
            return Err(errno(code));
        }
        let size = size.max(s.negotiated.map(|n| n.size_image as usize).unwrap_or(0));
        let count = count.min(s.max_buffers);
        s.regions = (0..count)
            .map(|_| HeapRegion::new(size).map(Arc::new))
            .collect::<io::Result<_>>()?;
        Ok(count)
    }

    fn export_buffer(&mut self, index: u32) -> io::Result<OwnedFd> {
        let s = self.state.lock();
        s.check_open()?;
        if let Some(code) = s.export_error {
            return Err(errno(code));
        }
        if index as usize >= s.regions.len() {
            return Err(errno(libc::EINVAL));
        }
        // Any descriptor stands in for a DMA-BUF
        Ok(OwnedFd::from(std::fs::File::open("/dev/null")?))
    }

    fn region(&self, index: u32) -> Option<Arc<dyn BufferRegion>> {
        let s = self.state.lock();
        s.regions
            .get(index as usize)
            .map(|r| r.clone() as Arc<dyn BufferRegion>)
    }

    fn queue_buffer(&mut self, index: u32) -> io::Result<()> {
        let mut s = self.state.lock();
        s.check_open()?;
        if index as usize >= s.regions.len() || s.queued.contains(&index) {
            return Err(errno(libc::EINVAL));
        }
        s.queued.push_back(index);
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> io::Result<DequeuedBuffer> {
        let mut s = self.state.lock();
        s.check_open()?;
        if !s.streaming {
            return Err(errno(libc::EINVAL));
        }
        let step = s.next_step();
        let payload = match &step {
            MockStep::Frame | MockStep::Corrupted => None,
            MockStep::Data(data) => Some(data.clone()),
            MockStep::Disconnect => {
                s.script.pop_front();
                s.gone = true;
                return Err(errno(libc::ENODEV));
            }
            MockStep::Timeout | MockStep::Event(_) => return Err(errno(libc::EAGAIN)),
        };
        let Some(index) = s.queued.pop_front() else {
            return Err(errno(libc::EAGAIN));
        };
        s.script.pop_front();

        let sequence = s.sequence;
        s.sequence = s.sequence.wrapping_add(1);
        let size = s.negotiated.map(|n| n.size_image as usize).unwrap_or(0);
        let data = payload.unwrap_or_else(|| pattern(size, sequence));
        let region = s.regions[index as usize].clone();
        // SAFETY: the index was just taken off the driver queue, nobody reads it
        let used = unsafe { region.write(&data) };
        Ok(DequeuedBuffer {
            index,
            used,
            error: step == MockStep::Corrupted,
            sequence,
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        let mut s = self.state.lock();
        s.check_open()?;
        s.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        let mut s = self.state.lock();
        s.check_open()?;
        s.streaming = false;
        s.queued.clear();
        Ok(())
    }

    fn release_buffers(&mut self) {
        let mut s = self.state.lock();
        s.queued.clear();
        s.regions.clear();
    }

    fn poll(&mut self, timeout: Duration, wake: Option<BorrowedFd<'_>>) -> io::Result<Readiness> {
        let (step, interval, has_queued) = {
            let s = self.state.lock();
            s.check_open()?;
            (s.next_step(), s.frame_interval, !s.queued.is_empty())
        };
        match step {
            MockStep::Disconnect => {
                let mut s = self.state.lock();
                s.script.pop_front();
                s.gone = true;
                Err(errno(libc::ENODEV))
            }
            MockStep::Event(_) => Ok(Readiness {
                has_event: true,
                ..Default::default()
            }),
            MockStep::Timeout => {
                let woken = wait(timeout, wake);
                if !woken {
                    let mut s = self.state.lock();
                    if s.script.front() == Some(&MockStep::Timeout) {
                        s.script.pop_front();
                    }
                }
                Ok(Readiness {
                    woken,
                    ..Default::default()
                })
            }
            _ if !has_queued => Ok(Readiness {
                woken: wait(timeout, wake),
                ..Default::default()
            }),
            _ => {
                let woken = !interval.is_zero() && wait(interval.min(timeout), wake);
                Ok(Readiness {
                    readable: !woken,
                    woken,
                    ..Default::default()
                })
            }
        }
    }

    fn subscribe_events(&mut self) -> io::Result<()> {
        let mut s = self.state.lock();
        s.check_open()?;
        s.subscribed = true;
        Ok(())
    }

    fn dequeue_event(&mut self) -> io::Result<Option<DriverEvent>> {
        let mut s = self.state.lock();
        s.check_open()?;
        match s.script.front() {
            Some(MockStep::Event(event)) => {
                let event = *event;
                s.script.pop_front();
                Ok(Some(event))
            }
            _ => Ok(None),
        }
    }

    fn query_control(&mut self, id: u32) -> io::Result<Option<ControlInfo>> {
        let s = self.state.lock();
        s.check_open()?;
        Ok(s.controls.get(&id).copied())
    }

    fn set_control(&mut self, id: u32, value: i32) -> io::Result<()> {
        let mut s = self.state.lock();
        s.check_open()?;
        if !s.controls.contains_key(&id) {
            return Err(errno(libc::EINVAL));
        }
        s.values.insert(id, value);
        Ok(())
    }
}
