//! Frame distribution
//!
//! # Components
//!
//! - `Stream` - capture loop feeding workers, ring and sinks
//! - `FrameRing` - bounded frame buffer read by HTTP clients
//! - `Memsink` / `MemsinkClient` - shared memory sinks for other processes
//! - `ClientRegistry` - connected MJPEG clients

pub mod memsink;
pub mod mjpeg;
pub mod ring;
pub mod streamer;

pub use memsink::{Memsink, MemsinkClient, MemsinkConfig, SinkFrame, SinkKind};
pub use mjpeg::{ClientGuard, ClientRegistry, ClientStats};
pub use ring::{FrameRing, RingRead, RingReader};
pub use streamer::{Stream, StreamConfig, StreamHandle, StreamState, StreamStatus};
