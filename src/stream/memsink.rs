//! Shared-memory frame sink
//!
//! One POSIX shared memory object per stream kind holding a fixed header
//! followed by the payload of the last frame. Access is serialized with
//! `flock()` on the object's descriptor: the server takes the lock to write,
//! clients take it to copy the frame out and to leave a heartbeat
//! (`last_client_ts`) so the server knows somebody is reading.
//!
//! ```text
//! +------------------+---------------------------+
//! | SinkHeader (88B) | data[max_data]            |
//! +------------------+---------------------------+
//! ```

use std::fs::File;
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytemuck::{Pod, Zeroable};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::{umask, Mode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace};

use crate::error::SinkError;
use crate::utils::now_monotonic;
use crate::video::format::Resolution;
use crate::video::frame::{EncodedFrame, RawFrame};

/// "MEMSINK\0" read as a little-endian integer
pub const MEMSINK_MAGIC: u64 = 0x004b_4e49_534d_454d;
pub const MEMSINK_VERSION: u32 = 4;
/// Default payload capacity
pub const DEFAULT_MAX_DATA: usize = 32 * 1024 * 1024;

const LOCK_POLL: Duration = Duration::from_millis(1);

/// Header at the start of the shared object
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct SinkHeader {
    pub magic: u64,
    pub version: u32,
    _pad0: u32,
    /// Changes on every published frame
    pub id: u64,
    pub used: u64,
    pub width: u32,
    pub height: u32,
    /// FourCC
    pub format: u32,
    pub stride: u32,
    pub online: u8,
    pub key: u8,
    pub key_requested: u8,
    _pad1: [u8; 5],
    pub grab_ts: f64,
    pub encode_begin_ts: f64,
    pub encode_end_ts: f64,
    /// Written by clients on every read
    pub last_client_ts: f64,
}

const HEADER_SIZE: usize = std::mem::size_of::<SinkHeader>();

/// Stream a sink carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Raw,
    Jpeg,
    H264,
}

impl SinkKind {
    pub fn name(&self) -> &'static str {
        match self {
            SinkKind::Raw => "RAW",
            SinkKind::Jpeg => "JPEG",
            SinkKind::H264 => "H264",
        }
    }
}

impl std::fmt::Display for SinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Sink settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemsinkConfig {
    /// Shared memory object name, e.g. `/vcap::jpeg`
    pub object: String,
    /// Permissions for a newly created object
    pub mode: u32,
    /// Unlink the object when the server closes
    pub remove: bool,
    /// A client counts as present this long after its last read
    #[serde(with = "secs_f64")]
    pub client_ttl: Duration,
    /// Lock wait for publish and get
    #[serde(with = "secs_f64")]
    pub timeout: Duration,
    pub max_data: usize,
}

impl Default for MemsinkConfig {
    fn default() -> Self {
        Self {
            object: String::new(),
            mode: 0o660,
            remove: false,
            client_ttl: Duration::from_secs(10),
            timeout: Duration::from_secs(1),
            max_data: DEFAULT_MAX_DATA,
        }
    }
}

mod secs_f64 {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Frame payload and metadata as stored in a sink
#[derive(Debug, Clone, Copy)]
pub struct SinkFrame<'a> {
    pub data: &'a [u8],
    pub resolution: Resolution,
    pub format: u32,
    pub stride: u32,
    pub online: bool,
    pub key: bool,
    pub grab_ts: f64,
    pub encode_begin_ts: f64,
    pub encode_end_ts: f64,
}

impl<'a> From<&'a EncodedFrame> for SinkFrame<'a> {
    fn from(frame: &'a EncodedFrame) -> Self {
        Self {
            data: frame.data(),
            resolution: frame.resolution,
            format: frame.format.fourcc_code(),
            stride: frame.stride,
            online: frame.online,
            key: frame.key_frame,
            grab_ts: frame.grab_ts,
            encode_begin_ts: frame.encode_begin_ts,
            encode_end_ts: frame.encode_end_ts,
        }
    }
}

impl<'a> From<&'a RawFrame> for SinkFrame<'a> {
    fn from(frame: &'a RawFrame) -> Self {
        Self {
            data: frame.data(),
            resolution: frame.resolution,
            format: frame.format.fourcc_code(),
            stride: frame.stride,
            online: frame.online,
            key: false,
            grab_ts: frame.grab_ts,
            encode_begin_ts: 0.0,
            encode_end_ts: 0.0,
        }
    }
}

impl SinkFrame<'_> {
    fn same_geometry(&self, header: &SinkHeader) -> bool {
        header.used == self.data.len() as u64
            && header.width == self.resolution.width
            && header.height == self.resolution.height
            && header.format == self.format
            && header.stride == self.stride
            && (header.online != 0) == self.online
            && (header.key != 0) == self.key
    }
}

/// Frame copied out by a client
#[derive(Debug, Clone)]
pub struct ClientFrame {
    pub data: Vec<u8>,
    pub id: u64,
    pub resolution: Resolution,
    pub format: u32,
    pub stride: u32,
    pub online: bool,
    pub key: bool,
    /// The server still waits for a key frame
    pub key_requested: bool,
    pub grab_ts: f64,
    pub encode_begin_ts: f64,
    pub encode_end_ts: f64,
}

/// Mapped shared object
struct SharedMap {
    ptr: NonNull<libc::c_void>,
    len: usize,
}

// The mapping is only touched while holding the flock
unsafe impl Send for SharedMap {}

impl SharedMap {
    fn new(file: &File, len: usize) -> Result<Self, Errno> {
        let length = NonZeroUsize::new(len).ok_or(Errno::EINVAL)?;
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file,
                0,
            )?
        };
        Ok(Self { ptr, len })
    }

    fn header(&self) -> &SinkHeader {
        bytemuck::from_bytes(&self.bytes()[..HEADER_SIZE])
    }

    fn header_mut(&mut self) -> &mut SinkHeader {
        bytemuck::from_bytes_mut(&mut self.bytes_mut()[..HEADER_SIZE])
    }

    fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const u8, self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr() as *mut u8, self.len) }
    }

    fn data(&self) -> &[u8] {
        &self.bytes()[HEADER_SIZE..]
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.bytes_mut()[HEADER_SIZE..]
    }
}

impl Drop for SharedMap {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            error!("Can't unmap shared memory: {}", e);
        }
    }
}

enum Lock {
    Acquired,
    Busy,
}

fn flock(file: &File, op: libc::c_int) -> Result<(), Errno> {
    Errno::result(unsafe { libc::flock(file.as_raw_fd(), op) }).map(drop)
}

fn try_lock(file: &File) -> Result<Lock, Errno> {
    match flock(file, libc::LOCK_EX | libc::LOCK_NB) {
        Ok(()) => Ok(Lock::Acquired),
        Err(Errno::EWOULDBLOCK) => Ok(Lock::Busy),
        Err(e) => Err(e),
    }
}

fn lock_timed(file: &File, timeout: Duration) -> Result<Lock, Errno> {
    let deadline = Instant::now() + timeout;
    loop {
        match try_lock(file)? {
            Lock::Acquired => return Ok(Lock::Acquired),
            Lock::Busy if Instant::now() >= deadline => return Ok(Lock::Busy),
            Lock::Busy => std::thread::sleep(LOCK_POLL),
        }
    }
}

fn unlock(file: &File) -> Result<(), Errno> {
    flock(file, libc::LOCK_UN)
}

pub fn validate_object(object: &str) -> Result<(), SinkError> {
    if object.len() < 2 || !object.starts_with('/') || object[1..].contains('/') {
        return Err(SinkError::Io {
            sink: object.to_string(),
            reason: "object name must look like /name".to_string(),
        });
    }
    Ok(())
}

/// Server side of a sink
pub struct Memsink {
    kind: SinkKind,
    config: MemsinkConfig,
    file: File,
    map: SharedMap,
    last_id: u64,
    has_clients: Arc<AtomicBool>,
}

impl Memsink {
    /// Create (or reuse) the shared object and map it
    pub fn open_server(kind: SinkKind, config: MemsinkConfig) -> Result<Self, SinkError> {
        validate_object(&config.object)?;
        let io = |reason: String| SinkError::Io {
            sink: kind.to_string(),
            reason,
        };
        info!("Using {}-sink: {}", kind, config.object);

        let mask = umask(Mode::empty());
        let fd = shm_open(
            config.object.as_str(),
            OFlag::O_RDWR | OFlag::O_CREAT,
            Mode::from_bits_truncate(config.mode as libc::mode_t),
        );
        umask(mask);
        let fd: OwnedFd = fd.map_err(|e| io(format!("can't open shared memory: {}", e)))?;
        let file = File::from(fd);

        let len = HEADER_SIZE + config.max_data;
        file.set_len(len as u64)
            .map_err(|e| io(format!("can't truncate shared memory: {}", e)))?;
        let map = SharedMap::new(&file, len).map_err(|e| io(format!("can't mmap: {}", e)))?;

        Ok(Self {
            kind,
            config,
            file,
            map,
            last_id: 0,
            has_clients: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn kind(&self) -> SinkKind {
        self.kind
    }

    pub fn config(&self) -> &MemsinkConfig {
        &self.config
    }

    /// Whether a client read recently, as of the last check or publish
    pub fn has_clients(&self) -> bool {
        self.has_clients.load(Ordering::Relaxed)
    }

    /// Shared flag for other threads
    pub fn client_flag(&self) -> Arc<AtomicBool> {
        self.has_clients.clone()
    }

    fn refresh_clients(&self, header: &SinkHeader) -> bool {
        let active = header.last_client_ts + self.config.client_ttl.as_secs_f64() > now_monotonic();
        self.has_clients.store(active, Ordering::Relaxed);
        active
    }

    /// Whether encoding for this sink is worth it: the object was never
    /// written or a client read within the TTL
    ///
    /// Looks at the heartbeat only, so it can run before a frame exists.
    pub fn wants_frames(&self) -> bool {
        self.inspect(|header| {
            header.magic != MEMSINK_MAGIC
                || header.version != MEMSINK_VERSION
                || self.refresh_clients(header)
        })
    }

    /// Whether `frame` is worth publishing
    ///
    /// True when a client holds the lock right now, the object was never
    /// written, a client read within the TTL, or the frame's geometry
    /// differs from what is stored.
    pub fn server_check(&self, frame: &SinkFrame<'_>) -> bool {
        self.inspect(|header| {
            if header.magic != MEMSINK_MAGIC || header.version != MEMSINK_VERSION {
                return true;
            }
            self.refresh_clients(header) || !frame.same_geometry(header)
        })
    }

    /// Run `f` on the header under the lock; a lock held by a client counts
    /// as an active client
    fn inspect(&self, f: impl FnOnce(&SinkHeader) -> bool) -> bool {
        match try_lock(&self.file) {
            Ok(Lock::Busy) => {
                self.has_clients.store(true, Ordering::Relaxed);
                return true;
            }
            Ok(Lock::Acquired) => {}
            Err(e) => {
                error!("{}-sink: Can't lock memory: {}", self.kind, e);
                return false;
            }
        }

        let header = *self.map.header();
        let result = f(&header);

        if let Err(e) = unlock(&self.file) {
            error!("{}-sink: Can't unlock memory: {}", self.kind, e);
            return false;
        }
        result
    }

    fn next_id(&mut self) -> u64 {
        let now = (now_monotonic() * 1_000_000.0) as u64;
        self.last_id = now.max(self.last_id + 1);
        self.last_id
    }

    /// Write a frame into the shared slot
    ///
    /// Returns whether a client asked for a key frame. Fails with
    /// [`SinkError::Timeout`] when clients hold the lock for longer than
    /// `timeout`; that only means the frame was skipped.
    pub fn publish(&mut self, frame: &SinkFrame<'_>, timeout: Duration) -> Result<bool, SinkError> {
        if frame.data.len() > self.config.max_data {
            return Err(SinkError::TooBig {
                sink: self.kind.to_string(),
                size: frame.data.len(),
                max: self.config.max_data,
            });
        }
        let started = now_monotonic();

        match lock_timed(&self.file, timeout) {
            Ok(Lock::Acquired) => {}
            Ok(Lock::Busy) => {
                trace!("{}-sink: Shared memory is busy now; frame skipped", self.kind);
                return Err(SinkError::Timeout(self.kind.to_string()));
            }
            Err(e) => {
                return Err(SinkError::Io {
                    sink: self.kind.to_string(),
                    reason: format!("can't lock memory: {}", e),
                })
            }
        }

        let id = self.next_id();
        let used = frame.data.len();
        self.map.data_mut()[..used].copy_from_slice(frame.data);

        let header = self.map.header_mut();
        header.id = id;
        if header.key_requested != 0 && frame.key {
            header.key_requested = 0;
        }
        let key_requested = header.key_requested != 0;
        header.used = used as u64;
        header.width = frame.resolution.width;
        header.height = frame.resolution.height;
        header.format = frame.format;
        header.stride = frame.stride;
        header.online = frame.online as u8;
        header.key = frame.key as u8;
        header.grab_ts = frame.grab_ts;
        header.encode_begin_ts = frame.encode_begin_ts;
        header.encode_end_ts = frame.encode_end_ts;
        header.magic = MEMSINK_MAGIC;
        header.version = MEMSINK_VERSION;
        let header = *header;
        self.refresh_clients(&header);

        unlock(&self.file).map_err(|e| SinkError::Io {
            sink: self.kind.to_string(),
            reason: format!("can't unlock memory: {}", e),
        })?;
        trace!(
            "{}-sink: Exposed new frame; full exposition time = {:.3}",
            self.kind,
            now_monotonic() - started
        );
        Ok(key_requested)
    }
}

impl Drop for Memsink {
    fn drop(&mut self) {
        if self.config.remove {
            match shm_unlink(self.config.object.as_str()) {
                Ok(()) | Err(Errno::ENOENT) => {}
                Err(e) => error!("{}-sink: Can't remove shared memory: {}", self.kind, e),
            }
        }
        debug!("{}-sink closed", self.kind);
    }
}

/// Client side of a sink
pub struct MemsinkClient {
    name: String,
    file: File,
    map: SharedMap,
    last_id: u64,
    timeout: Duration,
}

impl MemsinkClient {
    /// Attach to an existing object created by a server
    pub fn open(object: &str, timeout: Duration) -> Result<Self, SinkError> {
        validate_object(object)?;
        let io = |reason: String| SinkError::Io {
            sink: object.to_string(),
            reason,
        };
        let fd: OwnedFd = shm_open(object, OFlag::O_RDWR, Mode::empty())
            .map_err(|e| io(format!("can't open shared memory: {}", e)))?;
        let file = File::from(fd);
        let len = file
            .metadata()
            .map_err(|e| io(format!("can't stat shared memory: {}", e)))?
            .len() as usize;
        if len < HEADER_SIZE {
            return Err(io(format!("object is too small ({} bytes)", len)));
        }
        let map = SharedMap::new(&file, len).map_err(|e| io(format!("can't mmap: {}", e)))?;
        Ok(Self {
            name: object.to_string(),
            file,
            map,
            last_id: 0,
            timeout,
        })
    }

    /// Copy out the frame if it changed since the last call
    ///
    /// Every successful lock refreshes the heartbeat. `key_required` asks the
    /// server for a key frame.
    pub fn get(&mut self, key_required: bool) -> Result<Option<ClientFrame>, SinkError> {
        match lock_timed(&self.file, self.timeout) {
            Ok(Lock::Acquired) => {}
            Ok(Lock::Busy) => return Err(SinkError::Timeout(self.name.clone())),
            Err(e) => {
                return Err(SinkError::Io {
                    sink: self.name.clone(),
                    reason: format!("can't lock memory: {}", e),
                })
            }
        }

        let result = self.read_locked(key_required);

        if let Err(e) = unlock(&self.file) {
            return Err(SinkError::Io {
                sink: self.name.clone(),
                reason: format!("can't unlock memory: {}", e),
            });
        }
        result
    }

    fn read_locked(&mut self, key_required: bool) -> Result<Option<ClientFrame>, SinkError> {
        let header = *self.map.header();
        if header.magic != MEMSINK_MAGIC {
            return Ok(None);
        }
        if header.version != MEMSINK_VERSION {
            return Err(SinkError::ProtocolMismatch {
                sink: self.name.clone(),
                found: header.version,
                required: MEMSINK_VERSION,
            });
        }

        let mut frame = None;
        if header.id != self.last_id {
            self.last_id = header.id;
            let used = (header.used as usize).min(self.map.data().len());
            frame = Some(ClientFrame {
                data: self.map.data()[..used].to_vec(),
                id: header.id,
                resolution: Resolution::new(header.width, header.height),
                format: header.format,
                stride: header.stride,
                online: header.online != 0,
                key: header.key != 0,
                key_requested: header.key_requested != 0,
                grab_ts: header.grab_ts,
                encode_begin_ts: header.encode_begin_ts,
                encode_end_ts: header.encode_end_ts,
            });
        }

        let header = self.map.header_mut();
        header.last_client_ts = now_monotonic();
        if key_required {
            header.key_requested = 1;
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::format::PixelFormat;
    use crate::video::frame::EncodedFormat;
    use bytes::Bytes;

    fn config(object: &str) -> MemsinkConfig {
        MemsinkConfig {
            object: object.to_string(),
            remove: true,
            max_data: 64 * 1024,
            timeout: Duration::from_millis(100),
            ..Default::default()
        }
    }

    fn object(tag: &str) -> String {
        format!("/vcap-test-{}-{}", tag, uuid::Uuid::new_v4().simple())
    }

    fn jpeg(sequence: u64, len: usize) -> EncodedFrame {
        let mut data = vec![0x55; len];
        data[0] = 0xFF;
        data[1] = 0xD8;
        let mut frame = EncodedFrame::new(Bytes::from(data), EncodedFormat::Jpeg, Resolution::VGA);
        frame.sequence = sequence;
        frame
    }

    #[test]
    fn test_header_layout() {
        assert_eq!(HEADER_SIZE, 88);
        assert_eq!(&MEMSINK_MAGIC.to_le_bytes(), b"MEMSINK\0");
    }

    #[test]
    fn test_publish_and_get() {
        let name = object("roundtrip");
        let mut server = Memsink::open_server(SinkKind::Jpeg, config(&name)).unwrap();
        let mut client = MemsinkClient::open(&name, Duration::from_millis(100)).unwrap();

        assert!(client.get(false).unwrap().is_none());

        let frame = jpeg(1, 1000);
        server
            .publish(&SinkFrame::from(&frame), Duration::from_millis(100))
            .unwrap();

        let got = client.get(false).unwrap().unwrap();
        assert_eq!(got.data, frame.data());
        assert_eq!(got.resolution, Resolution::VGA);
        assert_eq!(got.format, EncodedFormat::Jpeg.fourcc_code());
        assert!(got.online);

        // Same id is not returned twice
        assert!(client.get(false).unwrap().is_none());
    }

    #[test]
    fn test_clients_tracked_by_heartbeat() {
        let name = object("clients");
        let mut server = Memsink::open_server(SinkKind::Jpeg, config(&name)).unwrap();
        let frame = jpeg(1, 256);
        let sink_frame = SinkFrame::from(&frame);

        // Never written: always worth publishing
        assert!(server.wants_frames());
        assert!(server.server_check(&sink_frame));
        server.publish(&sink_frame, Duration::from_millis(100)).unwrap();
        assert!(!server.has_clients());
        assert!(!server.server_check(&sink_frame));

        assert!(!server.wants_frames());

        let mut client = MemsinkClient::open(&name, Duration::from_millis(100)).unwrap();
        client.get(false).unwrap();
        assert!(server.server_check(&sink_frame));
        assert!(server.has_clients());
        assert!(server.wants_frames());
    }

    #[test]
    fn test_geometry_change_is_wanted() {
        let name = object("geometry");
        let mut server = Memsink::open_server(SinkKind::Jpeg, config(&name)).unwrap();
        let small = jpeg(1, 256);
        server
            .publish(&SinkFrame::from(&small), Duration::from_millis(100))
            .unwrap();
        let bigger = jpeg(2, 512);
        assert!(server.server_check(&SinkFrame::from(&bigger)));
    }

    #[test]
    fn test_too_big() {
        let name = object("big");
        let mut server = Memsink::open_server(SinkKind::Raw, config(&name)).unwrap();
        let raw = RawFrame::new(
            Bytes::from(vec![0u8; 128 * 1024]),
            Resolution::VGA,
            PixelFormat::Yuyv,
            1280,
            1,
        );
        let err = server
            .publish(&SinkFrame::from(&raw), Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, SinkError::TooBig { .. }));
    }

    #[test]
    fn test_publish_times_out_while_locked() {
        let name = object("busy");
        let mut server = Memsink::open_server(SinkKind::Jpeg, config(&name)).unwrap();
        let client = MemsinkClient::open(&name, Duration::from_millis(100)).unwrap();
        assert!(matches!(
            lock_timed(&client.file, Duration::ZERO),
            Ok(Lock::Acquired)
        ));

        let frame = jpeg(1, 256);
        let err = server
            .publish(&SinkFrame::from(&frame), Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, SinkError::Timeout(_)));
        assert!(server.server_check(&SinkFrame::from(&frame)));

        unlock(&client.file).unwrap();
        server
            .publish(&SinkFrame::from(&frame), Duration::from_millis(20))
            .unwrap();
    }

    #[test]
    fn test_key_request() {
        let name = object("key");
        let mut server = Memsink::open_server(SinkKind::H264, config(&name)).unwrap();
        let mut client = MemsinkClient::open(&name, Duration::from_millis(100)).unwrap();

        let mut frame = jpeg(1, 256);
        frame.format = EncodedFormat::H264;
        frame.key_frame = false;
        server.publish(&SinkFrame::from(&frame), Duration::from_millis(100)).unwrap();
        client.get(true).unwrap();

        assert!(server.publish(&SinkFrame::from(&frame), Duration::from_millis(100)).unwrap());
        frame.key_frame = true;
        assert!(!server.publish(&SinkFrame::from(&frame), Duration::from_millis(100)).unwrap());
    }

    #[test]
    fn test_bad_object_name() {
        assert!(Memsink::open_server(SinkKind::Jpeg, config("no-slash")).is_err());
        assert!(MemsinkClient::open("/a/b", Duration::ZERO).is_err());
    }
}
