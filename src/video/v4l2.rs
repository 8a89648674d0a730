//! V4L2 capture driver
//!
//! Talks to the kernel through the `v4l` crate's raw ioctl layer, so that
//! buffer ownership stays in our hands: the Device Manager decides when a
//! buffer is queued back, not a stream iterator.

use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, warn};
use v4l::v4l2;
use v4l::v4l2::vidioc;
use v4l::v4l_sys::{
    v4l2_buffer, v4l2_capability, v4l2_control, v4l2_dv_timings, v4l2_event,
    v4l2_event_subscription, v4l2_exportbuffer, v4l2_format, v4l2_plane, v4l2_queryctrl,
    v4l2_requestbuffers, v4l2_streamparm,
};

use super::driver::{
    BufferRegion, CaptureDriver, ControlInfo, DequeuedBuffer, DriverCapabilities, DriverEvent,
    DvTimings, HeapRegion, NegotiatedFormat, Readiness,
};
use super::format::{IoMethod, PixelFormat, Resolution, VideoStandard};

// ===== videodev2.h constants =====
const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
const V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE: u32 = 9;
const V4L2_MEMORY_MMAP: u32 = 1;
const V4L2_CAP_VIDEO_CAPTURE: u32 = 0x0000_0001;
const V4L2_CAP_VIDEO_CAPTURE_MPLANE: u32 = 0x0000_1000;
const V4L2_CAP_STREAMING: u32 = 0x0400_0000;
const V4L2_CAP_DEVICE_CAPS: u32 = 0x8000_0000;
const V4L2_CAP_TIMEPERFRAME: u32 = 0x1000;
const V4L2_BUF_FLAG_ERROR: u32 = 0x0000_0040;
const V4L2_FIELD_ANY: u32 = 0;
const V4L2_EVENT_EOS: u32 = 2;
const V4L2_EVENT_SOURCE_CHANGE: u32 = 5;
const V4L2_CTRL_FLAG_DISABLED: u32 = 0x0001;

/// Driver-mapped buffer, unmapped when the last view goes away
struct MmapRegion {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

impl BufferRegion for MmapRegion {
    fn as_slice(&self) -> &[u8] {
        // SAFETY: mapping is alive until drop
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY: mapped in request_buffers() with this length
        if let Err(e) = unsafe { v4l2::munmap(self.ptr.as_ptr() as *mut c_void, self.len) } {
            warn!("Can't unmap device buffer: {}", e);
        }
    }
}

enum Region {
    Mmap(Arc<MmapRegion>),
    User(Arc<HeapRegion>),
}

impl Region {
    fn shared(&self) -> Arc<dyn BufferRegion> {
        match self {
            Region::Mmap(r) => r.clone(),
            Region::User(r) => r.clone(),
        }
    }
}

/// Real V4L2 device
pub struct V4l2Driver {
    file: Option<File>,
    buf_type: u32,
    memory: u32,
    size_image: u32,
    regions: Vec<Region>,
}

impl V4l2Driver {
    pub fn new() -> Self {
        Self {
            file: None,
            buf_type: V4L2_BUF_TYPE_VIDEO_CAPTURE,
            memory: V4L2_MEMORY_MMAP,
            size_image: 0,
            regions: Vec::new(),
        }
    }

    fn fd(&self) -> io::Result<i32> {
        self.file
            .as_ref()
            .map(|f| f.as_raw_fd())
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }

    fn is_mplane(&self) -> bool {
        self.buf_type == V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE
    }

    /// Issue an ioctl, retrying on EINTR
    fn xioctl<T>(&self, request: vidioc::_IOC_TYPE, arg: &mut T) -> io::Result<()> {
        let fd = self.fd()?;
        loop {
            // SAFETY: arg is a valid, exclusively borrowed struct of the type
            // the request expects
            match unsafe { v4l2::ioctl(fd, request, arg as *mut T as *mut c_void) } {
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                other => return other,
            }
        }
    }

    fn new_buffer(&self, index: u32, plane: &mut v4l2_plane) -> v4l2_buffer {
        let mut buf = v4l2_buffer {
            index,
            type_: self.buf_type,
            memory: self.memory,
            ..unsafe { mem::zeroed() }
        };
        if self.is_mplane() {
            buf.m.planes = plane as *mut v4l2_plane;
            buf.length = 1;
        }
        buf
    }
}

impl Default for V4l2Driver {
    fn default() -> Self {
        Self::new()
    }
}

fn c_string(raw: &[u8]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

impl CaptureDriver for V4l2Driver {
    fn open(&mut self, path: &Path) -> io::Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(path)?;
        self.file = Some(file);
        self.buf_type = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        Ok(())
    }

    fn close(&mut self) {
        self.regions.clear();
        self.file = None;
    }

    fn capabilities(&mut self) -> io::Result<DriverCapabilities> {
        let mut caps: v4l2_capability = unsafe { mem::zeroed() };
        self.xioctl(vidioc::VIDIOC_QUERYCAP, &mut caps)?;

        let flags = if caps.capabilities & V4L2_CAP_DEVICE_CAPS != 0 {
            caps.device_caps
        } else {
            caps.capabilities
        };
        let result = DriverCapabilities {
            driver: c_string(&caps.driver),
            card: c_string(&caps.card),
            bus: c_string(&caps.bus_info),
            capture: flags & V4L2_CAP_VIDEO_CAPTURE != 0,
            capture_mplane: flags & V4L2_CAP_VIDEO_CAPTURE_MPLANE != 0,
            streaming: flags & V4L2_CAP_STREAMING != 0,
        };
        if !result.capture && result.capture_mplane {
            self.buf_type = V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE;
        }
        Ok(result)
    }

    fn set_input(&mut self, input: u32) -> io::Result<()> {
        let mut index = input as libc::c_int;
        self.xioctl(vidioc::VIDIOC_S_INPUT, &mut index)
    }

    fn set_standard(&mut self, standard: VideoStandard) -> io::Result<()> {
        let mut std_id = standard.std_id();
        self.xioctl(vidioc::VIDIOC_S_STD, &mut std_id)
    }

    fn apply_dv_timings(&mut self) -> io::Result<DvTimings> {
        let mut timings: v4l2_dv_timings = unsafe { mem::zeroed() };
        self.xioctl(vidioc::VIDIOC_QUERY_DV_TIMINGS, &mut timings)?;
        self.xioctl(vidioc::VIDIOC_S_DV_TIMINGS, &mut timings)?;

        // SAFETY: BT.656/1120 is the only timing type the kernel reports
        let bt = unsafe { timings.__bindgen_anon_1.bt };
        let (width, height, pixelclock) = ({ bt.width }, { bt.height }, { bt.pixelclock });
        let total_w = width + { bt.hfrontporch } + { bt.hsync } + { bt.hbackporch };
        let mut total_h = height + { bt.vfrontporch } + { bt.vsync } + { bt.vbackporch };
        if { bt.interlaced } != 0 {
            total_h += { bt.il_vfrontporch } + { bt.il_vsync } + { bt.il_vbackporch };
        }
        let hz = if total_w > 0 && total_h > 0 {
            pixelclock as f64 / (total_w as f64 * total_h as f64)
        } else {
            0.0
        };
        Ok(DvTimings {
            resolution: Resolution::new(width, height),
            hz,
        })
    }

    fn set_format(
        &mut self,
        resolution: Resolution,
        format: PixelFormat,
    ) -> io::Result<NegotiatedFormat> {
        let mut fmt: v4l2_format = unsafe { mem::zeroed() };
        fmt.type_ = self.buf_type;
        if self.is_mplane() {
            fmt.fmt.pix_mp.width = resolution.width;
            fmt.fmt.pix_mp.height = resolution.height;
            fmt.fmt.pix_mp.pixelformat = format.fourcc_code();
            fmt.fmt.pix_mp.field = V4L2_FIELD_ANY;
            fmt.fmt.pix_mp.num_planes = 1;
        } else {
            fmt.fmt.pix.width = resolution.width;
            fmt.fmt.pix.height = resolution.height;
            fmt.fmt.pix.pixelformat = format.fourcc_code();
            fmt.fmt.pix.field = V4L2_FIELD_ANY;
        }
        self.xioctl(vidioc::VIDIOC_S_FMT, &mut fmt)?;

        // SAFETY: the kernel filled the member matching buf_type
        let (width, height, fourcc, stride, size_image) = unsafe {
            if self.is_mplane() {
                let pix = fmt.fmt.pix_mp;
                (
                    pix.width,
                    pix.height,
                    pix.pixelformat,
                    pix.plane_fmt[0].bytesperline,
                    pix.plane_fmt[0].sizeimage,
                )
            } else {
                let pix = fmt.fmt.pix;
                (pix.width, pix.height, pix.pixelformat, pix.bytesperline, pix.sizeimage)
            }
        };
        let format = PixelFormat::from_fourcc_code(fourcc).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Unsupported,
                format!("driver switched to unsupported format 0x{:08x}", fourcc),
            )
        })?;
        self.size_image = size_image;
        Ok(NegotiatedFormat {
            resolution: Resolution::new(width, height),
            format,
            stride,
            size_image,
        })
    }

    fn set_frame_rate(&mut self, fps: u32) -> io::Result<u32> {
        let mut parm: v4l2_streamparm = unsafe { mem::zeroed() };
        parm.type_ = self.buf_type;
        self.xioctl(vidioc::VIDIOC_G_PARM, &mut parm)?;

        // SAFETY: capture member for capture buffer types
        let capability = unsafe { parm.parm.capture.capability };
        if capability & V4L2_CAP_TIMEPERFRAME == 0 {
            debug!("Driver doesn't support setting the frame rate");
            return Ok(0);
        }
        parm.parm.capture.timeperframe.numerator = 1;
        parm.parm.capture.timeperframe.denominator = fps;
        self.xioctl(vidioc::VIDIOC_S_PARM, &mut parm)?;

        let tpf = unsafe { parm.parm.capture.timeperframe };
        if tpf.numerator == 0 {
            return Ok(0);
        }
        Ok(tpf.denominator / tpf.numerator)
    }

    fn request_buffers(&mut self, count: u32, io_method: IoMethod, size: usize) -> io::Result<u32> {
        self.memory = io_method.memory_type();
        let mut req = v4l2_requestbuffers {
            count,
            type_: self.buf_type,
            memory: self.memory,
            ..unsafe { mem::zeroed() }
        };
        self.xioctl(vidioc::VIDIOC_REQBUFS, &mut req)?;
        if req.count == 0 {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }

        self.regions.clear();
        for index in 0..req.count {
            let region = match io_method {
                IoMethod::Mmap => {
                    let mut plane: v4l2_plane = unsafe { mem::zeroed() };
                    let mut buf = self.new_buffer(index, &mut plane);
                    self.xioctl(vidioc::VIDIOC_QUERYBUF, &mut buf)?;
                    // SAFETY: offset/length members are the MMAP ones here
                    let (offset, len) = unsafe {
                        if self.is_mplane() {
                            (plane.m.mem_offset, plane.length)
                        } else {
                            (buf.m.offset, buf.length)
                        }
                    };
                    let ptr = unsafe {
                        v4l2::mmap(
                            ptr::null_mut(),
                            len as usize,
                            libc::PROT_READ | libc::PROT_WRITE,
                            libc::MAP_SHARED,
                            self.fd()?,
                            offset as libc::off_t,
                        )?
                    };
                    let ptr = NonNull::new(ptr as *mut u8)
                        .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;
                    Region::Mmap(Arc::new(MmapRegion {
                        ptr,
                        len: len as usize,
                    }))
                }
                IoMethod::UserPtr => {
                    let len = size.max(self.size_image as usize);
                    Region::User(Arc::new(HeapRegion::new(len)?))
                }
            };
            self.regions.push(region);
        }
        Ok(req.count)
    }

    fn export_buffer(&mut self, index: u32) -> io::Result<OwnedFd> {
        let mut exp = v4l2_exportbuffer {
            type_: self.buf_type,
            index,
            plane: 0,
            flags: (libc::O_RDWR | libc::O_CLOEXEC) as u32,
            ..unsafe { mem::zeroed() }
        };
        self.xioctl(vidioc::VIDIOC_EXPBUF, &mut exp)?;
        // SAFETY: the kernel handed us a fresh descriptor
        Ok(unsafe { OwnedFd::from_raw_fd(exp.fd) })
    }

    fn region(&self, index: u32) -> Option<Arc<dyn BufferRegion>> {
        self.regions.get(index as usize).map(Region::shared)
    }

    fn queue_buffer(&mut self, index: u32) -> io::Result<()> {
        let user = match self.regions.get(index as usize) {
            Some(Region::User(region)) => {
                Some((region.as_mut_ptr() as libc::c_ulong, region.len() as u32))
            }
            _ => None,
        };
        let mut plane: v4l2_plane = unsafe { mem::zeroed() };
        if let Some((addr, len)) = user {
            plane.m.userptr = addr;
            plane.length = len;
        }
        let mut buf = self.new_buffer(index, &mut plane);
        if let (Some((addr, len)), false) = (user, self.is_mplane()) {
            buf.m.userptr = addr;
            buf.length = len;
        }
        self.xioctl(vidioc::VIDIOC_QBUF, &mut buf)
    }

    fn dequeue_buffer(&mut self) -> io::Result<DequeuedBuffer> {
        let mut plane: v4l2_plane = unsafe { mem::zeroed() };
        let mut buf = self.new_buffer(0, &mut plane);
        self.xioctl(vidioc::VIDIOC_DQBUF, &mut buf)?;
        let used = if self.is_mplane() {
            plane.bytesused
        } else {
            buf.bytesused
        };
        Ok(DequeuedBuffer {
            index: buf.index,
            used: used as usize,
            error: buf.flags & V4L2_BUF_FLAG_ERROR != 0,
            sequence: buf.sequence,
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        let mut buf_type = self.buf_type as libc::c_int;
        self.xioctl(vidioc::VIDIOC_STREAMON, &mut buf_type)
    }

    fn stream_off(&mut self) -> io::Result<()> {
        let mut buf_type = self.buf_type as libc::c_int;
        self.xioctl(vidioc::VIDIOC_STREAMOFF, &mut buf_type)
    }

    fn release_buffers(&mut self) {
        self.regions.clear();
        if self.file.is_none() {
            return;
        }
        let mut req = v4l2_requestbuffers {
            count: 0,
            type_: self.buf_type,
            memory: self.memory,
            ..unsafe { mem::zeroed() }
        };
        if let Err(e) = self.xioctl(vidioc::VIDIOC_REQBUFS, &mut req) {
            debug!("Can't free device buffers: {}", e);
        }
    }

    fn poll(&mut self, timeout: Duration, wake: Option<BorrowedFd<'_>>) -> io::Result<Readiness> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
        let mut fds = vec![PollFd::new(
            file.as_fd(),
            PollFlags::POLLIN | PollFlags::POLLPRI,
        )];
        if let Some(wake) = wake {
            fds.push(PollFd::new(wake, PollFlags::POLLIN));
        }
        let ms = timeout.as_millis().min(u16::MAX as u128) as u16;
        match poll(&mut fds, PollTimeout::from(ms)) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(Readiness::default()),
            Err(e) => return Err(e.into()),
        }

        let dev = fds[0].revents().unwrap_or(PollFlags::empty());
        let woken = fds
            .get(1)
            .and_then(|fd| fd.revents())
            .is_some_and(|r| r.contains(PollFlags::POLLIN));
        Ok(Readiness {
            readable: dev.contains(PollFlags::POLLIN),
            has_event: dev.contains(PollFlags::POLLPRI),
            has_error: dev.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL),
            woken,
        })
    }

    fn subscribe_events(&mut self) -> io::Result<()> {
        let mut sub = v4l2_event_subscription {
            type_: V4L2_EVENT_SOURCE_CHANGE,
            ..unsafe { mem::zeroed() }
        };
        self.xioctl(vidioc::VIDIOC_SUBSCRIBE_EVENT, &mut sub)
    }

    fn dequeue_event(&mut self) -> io::Result<Option<DriverEvent>> {
        let mut event: v4l2_event = unsafe { mem::zeroed() };
        match self.xioctl(vidioc::VIDIOC_DQEVENT, &mut event) {
            Ok(()) => Ok(Some(match event.type_ {
                V4L2_EVENT_SOURCE_CHANGE => DriverEvent::SourceChange,
                V4L2_EVENT_EOS => DriverEvent::Eos,
                other => DriverEvent::Other(other),
            })),
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn query_control(&mut self, id: u32) -> io::Result<Option<ControlInfo>> {
        let mut query = v4l2_queryctrl {
            id,
            ..unsafe { mem::zeroed() }
        };
        match self.xioctl(vidioc::VIDIOC_QUERYCTRL, &mut query) {
            Ok(()) => Ok(Some(ControlInfo {
                minimum: query.minimum,
                maximum: query.maximum,
                step: query.step,
                default: query.default_value,
                disabled: query.flags & V4L2_CTRL_FLAG_DISABLED != 0,
            })),
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn set_control(&mut self, id: u32, value: i32) -> io::Result<()> {
        let mut ctrl = v4l2_control { id, value };
        self.xioctl(vidioc::VIDIOC_S_CTRL, &mut ctrl)
    }
}
