//! Capture driver contract
//!
//! [`CaptureDriver`] is the thin ioctl-shaped surface the Device Manager
//! drives. Every call is fallible and returns `io::Result` so errno values
//! survive up to the classification in [`crate::error`]. The real
//! implementation lives in [`super::v4l2`], a scripted one in [`super::mock`].

use std::alloc::{self, Layout};
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

use super::format::{IoMethod, PixelFormat, Resolution, VideoStandard};

/// What the driver reports about itself after open
#[derive(Debug, Clone, Default)]
pub struct DriverCapabilities {
    pub driver: String,
    pub card: String,
    pub bus: String,
    /// Single-planar capture
    pub capture: bool,
    /// Multi-planar capture (used only when single-planar is missing)
    pub capture_mplane: bool,
    /// Streaming I/O (queue/dequeue)
    pub streaming: bool,
}

/// Digital video timings detected on the input
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DvTimings {
    pub resolution: Resolution,
    /// Refresh rate computed from the pixel clock, 0.0 if unknown
    pub hz: f64,
}

/// Format after the driver adjusted the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedFormat {
    pub resolution: Resolution,
    pub format: PixelFormat,
    /// Bytes per line
    pub stride: u32,
    /// Driver-reported buffer size
    pub size_image: u32,
}

/// One filled buffer handed back by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    /// Payload size
    pub used: usize,
    /// `V4L2_BUF_FLAG_ERROR` set by the driver
    pub error: bool,
    /// Driver sequence counter
    pub sequence: u32,
}

/// Result of one readiness wait
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// A filled buffer can be dequeued
    pub readable: bool,
    /// An event is pending
    pub has_event: bool,
    /// POLLERR/POLLHUP on the device
    pub has_error: bool,
    /// The wake descriptor fired
    pub woken: bool,
}

/// Asynchronous driver event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverEvent {
    /// Input source or resolution changed
    SourceChange,
    /// End of stream
    Eos,
    /// Anything else, by `V4L2_EVENT_*` type
    Other(u32),
}

/// Range and default of a control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlInfo {
    pub minimum: i32,
    pub maximum: i32,
    pub step: i32,
    pub default: i32,
    pub disabled: bool,
}

/// Memory backing one capture buffer
///
/// The driver writes into a region only while the owning slot is queued.
/// Between dequeue and requeue the region is read-only for everyone.
pub trait BufferRegion: Send + Sync {
    fn as_slice(&self) -> &[u8];
}

/// Driver-layer operations used by the Device Manager
pub trait CaptureDriver: Send {
    /// Open the device node
    fn open(&mut self, path: &Path) -> io::Result<()>;

    /// Close the node. Must be safe to call on a closed driver.
    fn close(&mut self);

    fn capabilities(&mut self) -> io::Result<DriverCapabilities>;

    fn set_input(&mut self, input: u32) -> io::Result<()>;

    fn set_standard(&mut self, standard: VideoStandard) -> io::Result<()>;

    /// Query the DV timings of the source and apply them
    fn apply_dv_timings(&mut self) -> io::Result<DvTimings>;

    fn set_format(
        &mut self,
        resolution: Resolution,
        format: PixelFormat,
    ) -> io::Result<NegotiatedFormat>;

    /// Request a frame rate, returns the rate the driver settled on
    /// (0 when it can't tell)
    fn set_frame_rate(&mut self, fps: u32) -> io::Result<u32>;

    /// Allocate and map `count` buffers of at least `size` bytes,
    /// returns how many the driver actually gave
    fn request_buffers(&mut self, count: u32, io_method: IoMethod, size: usize) -> io::Result<u32>;

    /// Export a buffer as a DMA-BUF descriptor
    fn export_buffer(&mut self, index: u32) -> io::Result<OwnedFd>;

    /// Memory backing buffer `index`
    fn region(&self, index: u32) -> Option<Arc<dyn BufferRegion>>;

    fn queue_buffer(&mut self, index: u32) -> io::Result<()>;

    fn dequeue_buffer(&mut self) -> io::Result<DequeuedBuffer>;

    fn stream_on(&mut self) -> io::Result<()>;

    fn stream_off(&mut self) -> io::Result<()>;

    /// Unmap and free all buffers
    fn release_buffers(&mut self);

    /// Wait for readiness, also returning when `wake` becomes readable
    fn poll(&mut self, timeout: Duration, wake: Option<BorrowedFd<'_>>) -> io::Result<Readiness>;

    fn subscribe_events(&mut self) -> io::Result<()>;

    /// Pop one pending event, `None` when the queue is empty
    fn dequeue_event(&mut self) -> io::Result<Option<DriverEvent>>;

    /// `None` when the driver doesn't know the control
    fn query_control(&mut self, id: u32) -> io::Result<Option<ControlInfo>>;

    fn set_control(&mut self, id: u32, value: i32) -> io::Result<()>;
}

/// Page-aligned heap buffer, used for USERPTR I/O and by the mock driver
pub struct HeapRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

// The memory is plain bytes, shared access is governed by slot ownership.
unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

impl HeapRegion {
    const ALIGN: usize = 4096;

    pub fn new(size: usize) -> io::Result<Self> {
        let size = size.max(1).next_multiple_of(Self::ALIGN);
        let layout = Layout::from_size_align(size, Self::ALIGN)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: layout has non-zero size
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;
        Ok(Self { ptr, layout })
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    /// Address handed to the driver
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Fill the region the way the hardware would
    ///
    /// # Safety
    /// The caller must own the slot (queued to the driver), so no reader
    /// holds a slice of this region.
    pub unsafe fn write(&self, data: &[u8]) -> usize {
        let n = data.len().min(self.len());
        std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr(), n);
        n
    }
}

impl BufferRegion for HeapRegion {
    fn as_slice(&self) -> &[u8] {
        // SAFETY: allocation is alive for &self and len() bytes long
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len()) }
    }
}

impl std::fmt::Debug for HeapRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapRegion")
            .field("ptr", &self.ptr)
            .field("len", &self.len())
            .finish()
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        // SAFETY: allocated in new() with the same layout
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}
