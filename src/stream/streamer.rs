//! Capture loop
//!
//! One thread runs [`Stream::run`]: wait for the device, grab a buffer, feed
//! the raw and H264 sinks, hand the frame to a JPEG worker, release the
//! buffer, publish whatever the workers finished. Device failures close the
//! device and retry after `error_delay`; while the device is offline the
//! "no signal" frame is published at a throttled cadence.
//!
//! ```text
//! Device ──grab──> RawFrame ──┬──> raw sink
//!                             ├──> H264 backend ──> h264 sink
//!                             └──> WorkerPool ──> Reorderer ──┬──> FrameRing
//!                                                             └──> jpeg sink
//! ```

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, trace};

use super::memsink::{Memsink, SinkFrame, SinkKind};
use super::ring::FrameRing;
use crate::error::{AppError, DeviceError, SinkError};
use crate::utils::{FpsWindow, LogThrottler, StopToken};
use crate::video::blank::BlankFrame;
use crate::video::device::{Device, DeviceRuntime, GrabbedBuffer};
use crate::video::encoder::{H264Backend, SharedEncoderFactory};
use crate::video::frame::{EncodedFrame, RawFrame};
use crate::video::workers::{Reorderer, WorkerPool, WorkerResult, MAX_WORKERS};
use crate::{error_throttled, warn_throttled};

/// Identical frames are republished at least this often
const MAX_SAME_FRAME_INTERVAL: Duration = Duration::from_secs(1);
/// How long to wait for busy workers when the device closes
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
/// Wait step while offline, bounds blank cadence jitter
const OFFLINE_STEP: Duration = Duration::from_millis(100);
/// Fallback frame interval when the device reports no rate
const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(33);
/// Capture pace while slowed down
const SLOWDOWN_INTERVAL: Duration = Duration::from_secs(1);

/// One worker per CPU, within pool limits
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, MAX_WORKERS)
}

/// Loop policy
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub workers: usize,
    /// Workers read hardware buffers in place instead of a copy
    pub zero_copy: bool,
    pub ring_capacity: usize,
    /// Pause between a device failure and the next open
    pub error_delay: Duration,
    /// Offline time before the first blank frame
    pub offline_threshold: Duration,
    /// Minimum interval between blank frames
    pub blank_interval: Duration,
    /// Re-serve the last good frame for this long when offline, zero forever
    pub last_as_blank: Option<Duration>,
    /// Hold capture to about one frame per second while nobody reads
    pub slowdown: bool,
    /// Max identical frames in a row to skip, 0 disables
    pub drop_same_frames: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            zero_copy: false,
            ring_capacity: super::ring::DEFAULT_CAPACITY,
            error_delay: Duration::from_secs(1),
            offline_threshold: Duration::from_secs(1),
            blank_interval: Duration::from_secs(1),
            last_as_blank: None,
            slowdown: false,
            drop_same_frames: 0,
        }
    }
}

/// Stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Stopped,
    /// Opening the device
    Opening,
    Streaming,
    /// Device open but no frames, or failing to open
    NoSignal,
    /// Device node went away
    DeviceLost,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    blank: AtomicU64,
    dropped_busy: AtomicU64,
    dropped_same: AtomicU64,
    encode_errors: AtomicU64,
    late: AtomicU64,
    broken: AtomicU64,
}

impl Counters {
    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StreamCounters {
        StreamCounters {
            published: self.published.load(Ordering::Relaxed),
            blank: self.blank.load(Ordering::Relaxed),
            dropped_busy: self.dropped_busy.load(Ordering::Relaxed),
            dropped_same: self.dropped_same.load(Ordering::Relaxed),
            encode_errors: self.encode_errors.load(Ordering::Relaxed),
            late: self.late.load(Ordering::Relaxed),
            broken: self.broken.load(Ordering::Relaxed),
        }
    }
}

/// Frame counters since start
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamCounters {
    /// JPEG frames published, blank ones included
    pub published: u64,
    pub blank: u64,
    /// Dropped because every worker was busy
    pub dropped_busy: u64,
    pub dropped_same: u64,
    pub encode_errors: u64,
    /// Worker results that arrived after a newer frame
    pub late: u64,
    /// Broken buffers skipped by the device
    pub broken: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SinkStatus {
    pub kind: SinkKind,
    pub has_clients: bool,
}

/// Snapshot for the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub state: StreamState,
    pub online: bool,
    pub captured_fps: u32,
    pub http_clients: usize,
    pub sinks: Vec<SinkStatus>,
    pub device: Option<DeviceRuntime>,
    pub ring_capacity: usize,
    pub counters: StreamCounters,
}

/// State shared between the loop thread and handles
struct StreamShared {
    stop: StopToken,
    ring: Arc<FrameRing>,
    captured_fps: Arc<AtomicU32>,
    online: AtomicBool,
    state: Mutex<StreamState>,
    runtime: Mutex<Option<DeviceRuntime>>,
    sinks: Mutex<Vec<(SinkKind, Arc<AtomicBool>)>>,
    counters: Counters,
}

/// Cheap cloneable control and status handle
#[derive(Clone)]
pub struct StreamHandle {
    shared: Arc<StreamShared>,
}

impl StreamHandle {
    /// Ask the loop to stop; wakes a blocked device wait
    pub fn loop_break(&self) {
        if !self.shared.stop.is_stopped() {
            info!("Stopping stream loop");
        }
        self.shared.stop.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stop.is_stopped()
    }

    /// Anybody reading: HTTP clients or any sink client
    pub fn has_clients(&self) -> bool {
        self.http_clients() > 0
            || self
                .shared
                .sinks
                .lock()
                .iter()
                .any(|(_, flag)| flag.load(Ordering::Relaxed))
    }

    pub fn http_clients(&self) -> usize {
        self.shared.ring.reader_count()
    }

    /// Frames grabbed and released during the last full second
    pub fn captured_fps(&self) -> u32 {
        self.shared.captured_fps.load(Ordering::Relaxed)
    }

    pub fn is_online(&self) -> bool {
        self.shared.online.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> StreamState {
        *self.shared.state.lock()
    }

    pub fn ring(&self) -> Arc<FrameRing> {
        self.shared.ring.clone()
    }

    pub fn status(&self) -> StreamStatus {
        let sinks = self
            .shared
            .sinks
            .lock()
            .iter()
            .map(|(kind, flag)| SinkStatus {
                kind: *kind,
                has_clients: flag.load(Ordering::Relaxed),
            })
            .collect();
        StreamStatus {
            state: self.state(),
            online: self.is_online(),
            captured_fps: self.captured_fps(),
            http_clients: self.http_clients(),
            sinks,
            device: self.shared.runtime.lock().clone(),
            ring_capacity: self.shared.ring.capacity(),
            counters: self.shared.counters.snapshot(),
        }
    }
}

/// Per-run bookkeeping owned by the loop thread
struct LoopState {
    fps: FpsWindow,
    reorderer: Reorderer,
    /// Zero-copy buffers lent to a worker, by frame sequence
    held: HashMap<u64, GrabbedBuffer>,
    offline_since: Option<Instant>,
    last_blank: Option<Instant>,
    last_good: Option<Arc<EncodedFrame>>,
    last_jpeg: Option<Arc<EncodedFrame>>,
    last_publish: Option<Instant>,
    same_count: u32,
    h264_key_requested: bool,
}

impl LoopState {
    fn new(captured_fps: Arc<AtomicU32>) -> Self {
        Self {
            fps: FpsWindow::new(captured_fps),
            reorderer: Reorderer::new(),
            held: HashMap::new(),
            offline_since: None,
            last_blank: None,
            last_good: None,
            last_jpeg: None,
            last_publish: None,
            same_count: 0,
            h264_key_requested: true,
        }
    }
}

/// The capture pipeline
pub struct Stream {
    config: StreamConfig,
    device: Device,
    factory: SharedEncoderFactory,
    blank: BlankFrame,
    raw_sink: Option<Memsink>,
    jpeg_sink: Option<Memsink>,
    h264_sink: Option<Memsink>,
    h264: Option<Box<dyn H264Backend>>,
    shared: Arc<StreamShared>,
    throttler: LogThrottler,
}

impl Stream {
    pub fn new(config: StreamConfig, device: Device, factory: SharedEncoderFactory) -> io::Result<Self> {
        let blank = BlankFrame::new(device.config().resolution);
        let shared = Arc::new(StreamShared {
            stop: StopToken::new()?,
            ring: FrameRing::new(config.ring_capacity),
            captured_fps: Arc::new(AtomicU32::new(0)),
            online: AtomicBool::new(false),
            state: Mutex::new(StreamState::Stopped),
            runtime: Mutex::new(None),
            sinks: Mutex::new(Vec::new()),
            counters: Counters::default(),
        });
        Ok(Self {
            config,
            device,
            factory,
            blank,
            raw_sink: None,
            jpeg_sink: None,
            h264_sink: None,
            h264: None,
            shared,
            throttler: LogThrottler::default(),
        })
    }

    /// Attach a memory sink, replacing one of the same kind
    pub fn with_sink(mut self, sink: Memsink) -> Self {
        let kind = sink.kind();
        {
            let mut sinks = self.shared.sinks.lock();
            sinks.retain(|(k, _)| *k != kind);
            sinks.push((kind, sink.client_flag()));
        }
        match kind {
            SinkKind::Raw => self.raw_sink = Some(sink),
            SinkKind::Jpeg => self.jpeg_sink = Some(sink),
            SinkKind::H264 => self.h264_sink = Some(sink),
        }
        self
    }

    /// Attach the H264 encoder; used only together with an H264 sink
    pub fn with_h264(mut self, backend: Box<dyn H264Backend>) -> Self {
        self.h264 = Some(backend);
        self
    }

    pub fn handle(&self) -> StreamHandle {
        StreamHandle {
            shared: self.shared.clone(),
        }
    }

    fn stopped(&self) -> bool {
        self.shared.stop.is_stopped()
    }

    fn set_state(&self, state: StreamState) {
        *self.shared.state.lock() = state;
    }

    /// Run until [`StreamHandle::loop_break`]
    ///
    /// Only configuration errors and a buffer pool that can't be allocated
    /// at all end the loop with an error.
    pub fn run(&mut self) -> Result<(), AppError> {
        let mut pool = WorkerPool::new("jpeg", self.config.workers, self.factory.clone())?;
        let mut st = LoopState::new(self.shared.captured_fps.clone());
        info!(
            "Stream loop started: device={} workers={} zero_copy={}",
            self.device.config().path.display(),
            pool.size(),
            self.config.zero_copy
        );

        let result = self.run_loop(&mut pool, &mut st);

        pool.shutdown();
        self.device.close();
        *self.shared.runtime.lock() = None;
        self.shared.online.store(false, Ordering::Relaxed);
        self.shared.captured_fps.store(0, Ordering::Relaxed);
        self.set_state(StreamState::Stopped);
        info!("Stream loop stopped");
        result
    }

    fn run_loop(&mut self, pool: &mut WorkerPool, st: &mut LoopState) -> Result<(), AppError> {
        while !self.stopped() {
            self.set_state(StreamState::Opening);
            match self.device.open() {
                Ok(()) => {
                    self.throttler.clear("open");
                    *self.shared.runtime.lock() = self.device.runtime().cloned();
                    self.set_state(StreamState::Streaming);

                    let result = self.capture(pool, st);
                    self.finish_capture(pool, st);
                    self.device.close();
                    *self.shared.runtime.lock() = None;

                    match result {
                        Ok(()) => {}
                        Err(DeviceError::SourceChanged) => {
                            info!("Source changed, reopening device");
                            continue;
                        }
                        Err(e) if e.is_fatal() => return Err(e.into()),
                        Err(e) if e.is_disconnect() => {
                            if self.stopped() {
                                break;
                            }
                            self.set_state(StreamState::DeviceLost);
                            error_throttled!(self.throttler, "capture", "Device lost: {}", e);
                        }
                        Err(e) => {
                            self.set_state(StreamState::NoSignal);
                            warn_throttled!(self.throttler, "capture", "Capture error: {}", e);
                        }
                    }
                }
                Err(e) if e.is_fatal() => {
                    error!("Can't open device: {}", e);
                    return Err(e.into());
                }
                Err(e) => {
                    let state = if matches!(e, DeviceError::Open { .. }) {
                        StreamState::DeviceLost
                    } else {
                        StreamState::NoSignal
                    };
                    self.set_state(state);
                    error_throttled!(self.throttler, "open", "Can't open device: {}", e);
                }
            }
            if self.stopped() {
                break;
            }
            self.wait_offline(st, self.config.error_delay);
        }
        Ok(())
    }

    /// Sleep `delay` while keeping offline clients fed
    fn wait_offline(&mut self, st: &mut LoopState, delay: Duration) {
        let deadline = Instant::now() + delay;
        loop {
            self.offline_tick(st);
            st.fps.refresh();
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() || self.shared.stop.wait_timeout(left.min(OFFLINE_STEP)) {
                break;
            }
        }
    }

    fn capture(&mut self, pool: &mut WorkerPool, st: &mut LoopState) -> Result<(), DeviceError> {
        loop {
            let ready = pool.try_collect();
            self.publish_results(ready, st)?;
            st.fps.refresh();

            let flags = match self.device.select(Some(&self.shared.stop)) {
                Ok(flags) => flags,
                Err(DeviceError::PersistentTimeout) => {
                    self.set_state(StreamState::NoSignal);
                    self.offline_tick(st);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if flags.stopped {
                return Ok(());
            }
            if flags.has_event {
                self.device.consume_event()?;
            }
            if !flags.readable {
                continue;
            }

            let buffer = match self.device.grab_buffer() {
                Ok(buffer) => buffer,
                Err(DeviceError::BrokenFrame { .. }) => {
                    Counters::inc(&self.shared.counters.broken);
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.set_online(st);
            self.process(buffer, pool, st)?;
            if self.config.slowdown {
                self.slow_down();
            }
        }
    }

    fn process(
        &mut self,
        buffer: GrabbedBuffer,
        pool: &mut WorkerPool,
        st: &mut LoopState,
    ) -> Result<(), DeviceError> {
        let wanted = self.has_jpeg_consumers();
        let lend = wanted && self.config.zero_copy && self.can_lend(st);
        let frame = match self.device.frame(&buffer, wanted && !lend) {
            Ok(frame) => frame,
            Err(e) => {
                if let Err(release) = self.release(buffer, st) {
                    debug!("Can't release buffer after frame error: {}", release);
                }
                return Err(e);
            }
        };

        self.publish_raw(&frame);
        self.encode_h264(&frame, st);

        if !wanted {
            trace!("No JPEG consumers, skipping seq={}", frame.sequence);
            drop(frame);
            return self.release(buffer, st);
        }

        let mut pending = if lend {
            Some(buffer)
        } else {
            self.release(buffer, st)?;
            None
        };

        if !pool.has_free() {
            let results = pool.wait_free(self.frame_interval());
            self.publish_results(results, st)?;
        }

        let sequence = frame.sequence;
        match pool.dispatch(frame) {
            Ok(_) => {
                if let Some(buffer) = pending.take() {
                    st.held.insert(sequence, buffer);
                }
            }
            Err(frame) => {
                drop(frame);
                Counters::inc(&self.shared.counters.dropped_busy);
                debug!("All workers are busy, frame seq={} dropped", sequence);
                if let Some(buffer) = pending.take() {
                    self.release(buffer, st)?;
                }
            }
        }
        Ok(())
    }

    /// A worker may keep this buffer only while another one stays queued,
    /// otherwise the device starves until the workers finish
    fn can_lend(&self, st: &LoopState) -> bool {
        let n_bufs = self.device.runtime().map_or(0, |r| r.n_bufs as usize);
        st.held.len() + 1 < n_bufs
    }

    fn release(&mut self, buffer: GrabbedBuffer, st: &mut LoopState) -> Result<(), DeviceError> {
        self.device.release_buffer(&buffer)?;
        st.fps.tick();
        Ok(())
    }

    fn frame_interval(&self) -> Duration {
        let hz = self
            .device
            .runtime()
            .map(|r| r.hz)
            .filter(|hz| *hz > 0)
            .unwrap_or(self.device.config().fps);
        if hz == 0 {
            DEFAULT_FRAME_INTERVAL
        } else {
            Duration::from_secs_f64(1.0 / hz as f64)
        }
    }

    /// HTTP readers (snapshots included) or a JPEG sink reader
    fn has_jpeg_consumers(&self) -> bool {
        self.shared.ring.reader_count() > 0
            || self.jpeg_sink.as_ref().is_some_and(|sink| sink.wants_frames())
    }

    fn has_consumers(&self) -> bool {
        self.has_jpeg_consumers()
            || [&self.raw_sink, &self.h264_sink]
                .into_iter()
                .flatten()
                .any(|sink| sink.wants_frames())
    }

    /// Wait out the rest of a second unless somebody connects
    fn slow_down(&self) {
        let deadline = Instant::now() + SLOWDOWN_INTERVAL;
        while !self.has_consumers() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() || self.shared.stop.wait_timeout(left.min(OFFLINE_STEP)) {
                break;
            }
        }
    }

    /// Release lent buffers and publish finished frames in order
    fn publish_results(
        &mut self,
        results: Vec<WorkerResult>,
        st: &mut LoopState,
    ) -> Result<(), DeviceError> {
        if results.is_empty() {
            return Ok(());
        }
        let mut released = Ok(());
        let mut frames = Vec::with_capacity(results.len());
        for result in results {
            if let Some(buffer) = st.held.remove(&result.sequence) {
                if let Err(e) = self.release(buffer, st) {
                    released = released.and(Err(e));
                }
            }
            match result.result {
                Ok(frame) => {
                    trace!(
                        "Worker {} encoded seq={} in {:?}",
                        result.worker,
                        result.sequence,
                        result.elapsed
                    );
                    frames.push(frame);
                }
                Err(e) => {
                    Counters::inc(&self.shared.counters.encode_errors);
                    warn_throttled!(
                        self.throttler,
                        "encode",
                        "Dropped frame seq={}: {}",
                        result.sequence,
                        e
                    );
                }
            }
        }

        let late_before = st.reorderer.dropped();
        for frame in st.reorderer.accept(frames) {
            self.publish_jpeg(Arc::new(frame), st);
        }
        let late = st.reorderer.dropped() - late_before;
        if late > 0 {
            self.shared.counters.late.fetch_add(late, Ordering::Relaxed);
        }
        released
    }

    fn publish_raw(&mut self, frame: &RawFrame) {
        let Some(sink) = self.raw_sink.as_mut() else {
            return;
        };
        let sink_frame = SinkFrame::from(frame);
        if !sink.server_check(&sink_frame) {
            return;
        }
        let timeout = sink.config().timeout;
        if let Err(e) = sink.publish(&sink_frame, timeout) {
            report_sink_error(&self.throttler, e);
        }
    }

    fn encode_h264(&mut self, frame: &RawFrame, st: &mut LoopState) {
        let (Some(backend), Some(sink)) = (self.h264.as_mut(), self.h264_sink.as_mut()) else {
            return;
        };
        if !sink.wants_frames() {
            st.h264_key_requested = true;
            return;
        }
        match backend.encode(frame, st.h264_key_requested) {
            Ok(encoded) => {
                let timeout = sink.config().timeout;
                match sink.publish(&SinkFrame::from(&encoded), timeout) {
                    Ok(key_requested) => st.h264_key_requested = key_requested,
                    Err(e) => report_sink_error(&self.throttler, e),
                }
            }
            Err(e) => {
                Counters::inc(&self.shared.counters.encode_errors);
                warn_throttled!(self.throttler, "h264", "H264 encode failed: {}", e);
            }
        }
    }

    fn publish_jpeg(&mut self, frame: Arc<EncodedFrame>, st: &mut LoopState) {
        if self.config.drop_same_frames > 0 && frame.online {
            if let (Some(prev), Some(last)) = (&st.last_jpeg, st.last_publish) {
                if st.same_count < self.config.drop_same_frames
                    && last.elapsed() < MAX_SAME_FRAME_INTERVAL
                    && prev.online
                    && prev.same_content(&frame)
                {
                    st.same_count += 1;
                    Counters::inc(&self.shared.counters.dropped_same);
                    return;
                }
            }
        }
        st.same_count = 0;

        self.shared.ring.publish(frame.clone());
        if let Some(sink) = self.jpeg_sink.as_mut() {
            let sink_frame = SinkFrame::from(frame.as_ref());
            if sink.server_check(&sink_frame) {
                let timeout = sink.config().timeout;
                if let Err(e) = sink.publish(&sink_frame, timeout) {
                    report_sink_error(&self.throttler, e);
                }
            }
        }
        Counters::inc(&self.shared.counters.published);

        if frame.online {
            st.last_good = Some(frame.clone());
        }
        st.last_publish = Some(Instant::now());
        st.last_jpeg = Some(frame);
    }

    fn set_online(&mut self, st: &mut LoopState) {
        st.offline_since = None;
        st.last_blank = None;
        if !self.shared.online.swap(true, Ordering::Relaxed) {
            info!("Device is online");
        }
        self.set_state(StreamState::Streaming);
    }

    /// Called whenever a wait ends without a frame
    fn offline_tick(&mut self, st: &mut LoopState) {
        let now = Instant::now();
        let since = *st.offline_since.get_or_insert(now);
        if self.shared.online.swap(false, Ordering::Relaxed) {
            info!("Device went offline");
        }

        let offline_for = now.duration_since(since);
        if offline_for < self.config.offline_threshold {
            return;
        }
        if st
            .last_blank
            .is_some_and(|t| now.duration_since(t) < self.config.blank_interval)
        {
            return;
        }
        let Some(frame) = self.offline_frame(offline_for, st) else {
            return;
        };
        st.last_blank = Some(now);
        Counters::inc(&self.shared.counters.blank);
        self.publish_jpeg(frame, st);
    }

    fn offline_frame(&mut self, offline_for: Duration, st: &LoopState) -> Option<Arc<EncodedFrame>> {
        if let (Some(keep), Some(last)) = (self.config.last_as_blank, &st.last_good) {
            if keep.is_zero() || offline_for < keep {
                return Some(Arc::new(last.as_offline()));
            }
        }
        match self.blank.frame(self.factory.as_ref()) {
            Ok(blank) => Some(Arc::new(blank.as_offline())),
            Err(e) => {
                error_throttled!(self.throttler, "blank", "Can't build blank frame: {}", e);
                None
            }
        }
    }

    /// Collect in-flight work and give every lent buffer back
    fn finish_capture(&mut self, pool: &mut WorkerPool, st: &mut LoopState) {
        let results = pool.drain(DRAIN_TIMEOUT);
        if let Err(e) = self.publish_results(results, st) {
            debug!("Release failed while draining workers: {}", e);
        }
        for (_, buffer) in st.held.drain() {
            if let Err(e) = self.device.release_buffer(&buffer) {
                debug!("Can't release buffer {}: {}", buffer.index(), e);
            }
        }
    }
}

fn report_sink_error(throttler: &LogThrottler, err: SinkError) {
    match err {
        SinkError::Timeout(sink) => trace!("{}-sink is busy, frame skipped", sink),
        e => warn_throttled!(throttler, "sink", "Sink error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::device::DeviceConfig;
    use crate::video::encoder::{EncoderFactory, FrameEncoder, JpegEncoderFactory};
    use crate::video::format::Resolution;
    use crate::stream::ring::RingRead;
    use crate::video::mock::{Idle, MockDriver, MockHandle, MockStep};

    fn device_config() -> DeviceConfig {
        DeviceConfig {
            resolution: Resolution::new(160, 120),
            timeout: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn stream(config: StreamConfig, device: DeviceConfig) -> (Stream, MockHandle) {
        stream_with(config, device, JpegEncoderFactory::shared(80))
    }

    fn stream_with(
        config: StreamConfig,
        device: DeviceConfig,
        factory: SharedEncoderFactory,
    ) -> (Stream, MockHandle) {
        let (driver, handle) = MockDriver::new();
        let device = Device::with_driver(device, Box::new(driver));
        let stream = Stream::new(config, device, factory).unwrap();
        (stream, handle)
    }

    /// JPEG encoder that takes `delay` per frame, like a large real frame
    struct SlowEncoder {
        inner: Box<dyn FrameEncoder>,
        delay: Duration,
    }

    impl FrameEncoder for SlowEncoder {
        fn name(&self) -> &str {
            "slow"
        }

        fn output_format(&self) -> crate::video::frame::EncodedFormat {
            self.inner.output_format()
        }

        fn encode(&mut self, frame: &RawFrame) -> Result<EncodedFrame, crate::error::EncodeError> {
            std::thread::sleep(self.delay);
            self.inner.encode(frame)
        }
    }

    struct SlowFactory {
        delay: Duration,
    }

    impl EncoderFactory for SlowFactory {
        fn create(&self) -> Result<Box<dyn FrameEncoder>, crate::error::EncodeError> {
            Ok(Box::new(SlowEncoder {
                inner: JpegEncoderFactory::shared(80).create()?,
                delay: self.delay,
            }))
        }

        fn encoder_type(&self) -> &str {
            "slow"
        }
    }

    fn fast_config() -> StreamConfig {
        StreamConfig {
            workers: 2,
            error_delay: Duration::from_millis(50),
            offline_threshold: Duration::from_millis(50),
            blank_interval: Duration::from_millis(100),
            ..Default::default()
        }
    }

    fn spawn(mut stream: Stream) -> (StreamHandle, std::thread::JoinHandle<Result<(), AppError>>) {
        let handle = stream.handle();
        let thread = std::thread::spawn(move || stream.run());
        (handle, thread)
    }

    fn wait_for(what: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if what() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_frames_reach_the_ring() {
        let (stream, mock) = stream(fast_config(), device_config());
        mock.set_frame_interval(Duration::from_millis(5));
        let (handle, thread) = spawn(stream);
        let ring = handle.ring();
        let _reader = ring.reader();

        assert!(wait_for(|| ring.published() >= 5));
        let frame = ring.latest().unwrap();
        assert!(frame.online);
        assert!(frame.is_valid_jpeg());
        assert!(handle.is_online());
        assert_eq!(handle.state(), StreamState::Streaming);

        handle.loop_break();
        thread.join().unwrap().unwrap();
        assert_eq!(handle.state(), StreamState::Stopped);
        assert!(!mock.is_open());
    }

    #[test]
    fn test_published_in_order() {
        let (stream, mock) = stream(fast_config(), device_config());
        mock.set_frame_interval(Duration::from_millis(2));
        let (handle, thread) = spawn(stream);
        let ring = handle.ring();
        let mut reader = ring.reader();

        let mut last = 0;
        let mut seen = 0;
        let deadline = Instant::now() + Duration::from_secs(5);
        while seen < 20 && Instant::now() < deadline {
            match reader.try_next() {
                Some(RingRead::Frame(frame)) => {
                    assert!(frame.sequence > last);
                    last = frame.sequence;
                    seen += 1;
                }
                _ => std::thread::sleep(Duration::from_millis(1)),
            }
        }
        assert!(seen >= 20);
        handle.loop_break();
        thread.join().unwrap().unwrap();
    }

    #[test]
    fn test_zero_copy_releases_every_buffer() {
        let config = StreamConfig {
            zero_copy: true,
            ..fast_config()
        };
        let (stream, mock) = stream(config, device_config());
        mock.set_frame_interval(Duration::from_millis(5));
        let (handle, thread) = spawn(stream);
        let ring = handle.ring();
        let _reader = ring.reader();

        assert!(wait_for(|| ring.published() >= 10));
        handle.loop_break();
        thread.join().unwrap().unwrap();
        assert!(!mock.is_open());
        assert!(handle.status().counters.published >= 10);
    }

    #[test]
    fn test_zero_copy_keeps_a_buffer_queued() {
        // As many workers as buffers, with encoding slower than capture
        let config = StreamConfig {
            zero_copy: true,
            ..fast_config()
        };
        let device = DeviceConfig {
            n_bufs: 2,
            timeout: Duration::from_secs(1),
            ..device_config()
        };
        let factory = Arc::new(SlowFactory {
            delay: Duration::from_millis(10),
        });
        let (stream, mock) = stream_with(config, device, factory);
        mock.set_frame_interval(Duration::from_millis(5));
        let (handle, thread) = spawn(stream);
        let ring = handle.ring();
        let _reader = ring.reader();

        let started = Instant::now();
        assert!(wait_for(|| ring.published() >= 30));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(mock.opens(), 1);

        handle.loop_break();
        thread.join().unwrap().unwrap();
    }

    #[test]
    fn test_jpeg_skipped_without_consumers() {
        let (stream, mock) = stream(fast_config(), device_config());
        mock.set_frame_interval(Duration::from_millis(5));
        let (handle, thread) = spawn(stream);
        let ring = handle.ring();

        assert!(wait_for(|| handle.is_online()));
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(ring.published(), 0);
        assert_eq!(handle.status().counters.published, 0);

        let _reader = ring.reader();
        assert!(wait_for(|| ring.published() >= 3));

        handle.loop_break();
        thread.join().unwrap().unwrap();
    }

    #[test]
    fn test_slowdown_without_clients() {
        let config = StreamConfig {
            slowdown: true,
            ..fast_config()
        };
        let (stream, mock) = stream(config, device_config());
        mock.set_frame_interval(Duration::from_millis(5));
        let (handle, thread) = spawn(stream);

        std::thread::sleep(Duration::from_millis(2200));
        assert!(handle.captured_fps() <= 2, "fps {}", handle.captured_fps());

        // A reader ends the slowdown at the next wait step
        let ring = handle.ring();
        let _reader = ring.reader();
        assert!(wait_for(|| ring.published() >= 20));

        handle.loop_break();
        thread.join().unwrap().unwrap();
    }

    #[test]
    fn test_blank_frames_while_device_missing() {
        let (stream, mock) = stream(fast_config(), device_config());
        mock.set_open_error(Some(libc::ENOENT));
        let (handle, thread) = spawn(stream);
        let ring = handle.ring();
        let _reader = ring.reader();

        assert!(wait_for(|| ring.published() >= 2));
        let frame = ring.latest().unwrap();
        assert!(!frame.online);
        assert!(frame.is_valid_jpeg());
        assert!(!handle.is_online());
        assert!(wait_for(|| handle.state() == StreamState::DeviceLost));

        mock.set_open_error(None);
        assert!(wait_for(|| ring.latest().is_some_and(|f| f.online)));

        handle.loop_break();
        thread.join().unwrap().unwrap();
    }

    #[test]
    fn test_recovers_after_disconnect() {
        let (stream, mock) = stream(fast_config(), device_config());
        mock.set_frame_interval(Duration::from_millis(5));
        mock.push([MockStep::Frame, MockStep::Frame, MockStep::Disconnect]);
        let (handle, thread) = spawn(stream);

        assert!(wait_for(|| handle.state() == StreamState::DeviceLost));
        mock.reconnect();
        assert!(wait_for(|| mock.opens() >= 2 && handle.is_online()));

        handle.loop_break();
        thread.join().unwrap().unwrap();
    }

    #[test]
    fn test_persistent_timeout_serves_blank() {
        let device = DeviceConfig {
            persistent: true,
            ..device_config()
        };
        let (stream, mock) = stream(fast_config(), device);
        mock.set_idle(Idle::Timeout);
        let (handle, thread) = spawn(stream);
        let ring = handle.ring();

        assert!(wait_for(|| handle.status().counters.blank >= 2));
        assert!(ring.latest().is_some_and(|f| !f.online));
        // Persistent devices stay open
        assert_eq!(mock.opens(), 1);
        assert_eq!(handle.state(), StreamState::NoSignal);

        handle.loop_break();
        thread.join().unwrap().unwrap();
    }

    #[test]
    fn test_fatal_open_error_ends_loop() {
        let device = DeviceConfig {
            n_bufs: 0,
            ..device_config()
        };
        let (mut stream, _mock) = stream(fast_config(), device);
        assert!(matches!(
            stream.run(),
            Err(AppError::Device(DeviceError::Config(_)))
        ));
    }

    struct FakeH264 {
        forced: Arc<Mutex<Vec<bool>>>,
    }

    impl H264Backend for FakeH264 {
        fn name(&self) -> &str {
            "fake"
        }

        fn encode(
            &mut self,
            frame: &RawFrame,
            force_key: bool,
        ) -> Result<EncodedFrame, crate::error::EncodeError> {
            self.forced.lock().push(force_key);
            let mut encoded = EncodedFrame::new(
                bytes::Bytes::from_static(&[0, 0, 0, 1, 0x65]),
                crate::video::frame::EncodedFormat::H264,
                frame.resolution,
            )
            .with_source(frame);
            encoded.key_frame = force_key;
            Ok(encoded)
        }
    }

    #[test]
    fn test_h264_sink_gets_key_frame_first() {
        use crate::stream::memsink::{MemsinkClient, MemsinkConfig};

        let object = format!("/vcap-h264-{}", uuid::Uuid::new_v4().simple());
        let sink = Memsink::open_server(
            SinkKind::H264,
            MemsinkConfig {
                object: object.clone(),
                remove: true,
                ..Default::default()
            },
        )
        .unwrap();
        let forced = Arc::new(Mutex::new(Vec::new()));
        let (stream, mock) = stream(fast_config(), device_config());
        mock.set_frame_interval(Duration::from_millis(5));
        let stream = stream.with_sink(sink).with_h264(Box::new(FakeH264 {
            forced: forced.clone(),
        }));
        let (handle, thread) = spawn(stream);

        let mut client = MemsinkClient::open(&object, Duration::from_millis(500)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut first = None;
        while first.is_none() && Instant::now() < deadline {
            match client.get(false) {
                Ok(Some(frame)) => first = Some(frame),
                _ => std::thread::sleep(Duration::from_millis(2)),
            }
        }
        let first = first.unwrap();
        assert!(first.key);
        assert_eq!(first.data, vec![0, 0, 0, 1, 0x65]);
        assert_eq!(forced.lock().first(), Some(&true));
        // Once the key frame is out, the next ones are not forced
        assert!(wait_for(|| forced.lock().iter().filter(|k| !**k).count() >= 2));

        handle.loop_break();
        thread.join().unwrap().unwrap();
    }

    #[test]
    fn test_loop_break_while_waiting() {
        let (stream, mock) = stream(fast_config(), device_config());
        mock.set_idle(Idle::Timeout);
        let (handle, thread) = spawn(stream);
        std::thread::sleep(Duration::from_millis(30));
        let started = Instant::now();
        handle.loop_break();
        thread.join().unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
