//! Bounded frame ring between the capture thread and HTTP clients
//!
//! One writer, any number of readers, each with its own cursor. The writer
//! never waits: when the ring is full the oldest slot is overwritten. Every
//! slot carries the sequence number it was written with, so a reader can
//! tell a fresh slot from one that was already recycled and never returns
//! overwritten data.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::video::frame::EncodedFrame;

/// Default number of slots
pub const DEFAULT_CAPACITY: usize = 4;

#[derive(Debug)]
struct RingEntry {
    seq: u64,
    frame: Arc<EncodedFrame>,
}

/// Result of a ring read
#[derive(Debug, Clone)]
pub enum RingRead {
    Frame(Arc<EncodedFrame>),
    /// The reader fell behind and was moved to the newest frame
    Gap { skipped: u64 },
}

/// Bounded, drop-oldest frame ring
pub struct FrameRing {
    slots: Box<[ArcSwapOption<RingEntry>]>,
    /// Sequence of the newest published frame, 0 before the first
    write_seq: AtomicU64,
    readers: AtomicUsize,
    write_lock: Mutex<()>,
    notify: watch::Sender<u64>,
}

impl FrameRing {
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        let slots = (0..capacity)
            .map(|_| ArcSwapOption::empty())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let (notify, _) = watch::channel(0);
        Arc::new(Self {
            slots,
            write_seq: AtomicU64::new(0),
            readers: AtomicUsize::new(0),
            write_lock: Mutex::new(()),
            notify,
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of frames published so far
    pub fn published(&self) -> u64 {
        self.write_seq.load(Ordering::Acquire)
    }

    fn slot(&self, seq: u64) -> &ArcSwapOption<RingEntry> {
        &self.slots[(seq % self.slots.len() as u64) as usize]
    }

    /// Publish a frame, overwriting the oldest one when full
    pub fn publish(&self, frame: Arc<EncodedFrame>) -> u64 {
        let _guard = self.write_lock.lock();
        let seq = self.write_seq.load(Ordering::Relaxed) + 1;
        self.slot(seq).store(Some(Arc::new(RingEntry { seq, frame })));
        self.write_seq.store(seq, Ordering::Release);
        self.notify.send_replace(seq);
        seq
    }

    /// The newest frame
    pub fn latest(&self) -> Option<Arc<EncodedFrame>> {
        let seq = self.published();
        if seq == 0 {
            return None;
        }
        self.slot(seq)
            .load_full()
            .filter(|entry| entry.seq == seq)
            .map(|entry| entry.frame.clone())
    }

    /// New reader positioned at the newest frame
    pub fn reader(self: &Arc<Self>) -> RingReader {
        self.readers.fetch_add(1, Ordering::SeqCst);
        RingReader {
            cursor: self.published().max(1),
            changes: self.notify.subscribe(),
            ring: self.clone(),
        }
    }

    /// New reader that only sees frames published from now on
    pub fn fresh_reader(self: &Arc<Self>) -> RingReader {
        let mut reader = self.reader();
        reader.cursor = self.published() + 1;
        reader
    }

    pub fn reader_count(&self) -> usize {
        self.readers.load(Ordering::SeqCst)
    }
}

/// A reader's cursor into a [`FrameRing`]
pub struct RingReader {
    ring: Arc<FrameRing>,
    /// Sequence of the next frame to read
    cursor: u64,
    changes: watch::Receiver<u64>,
}

impl RingReader {
    /// Next frame if one is ready
    pub fn try_next(&mut self) -> Option<RingRead> {
        let written = self.ring.published();
        if written == 0 || self.cursor > written {
            return None;
        }
        if written - self.cursor >= self.ring.capacity() as u64 {
            return Some(self.resync(written));
        }

        let entry = self.ring.slot(self.cursor).load_full()?;
        if entry.seq == self.cursor {
            self.cursor += 1;
            Some(RingRead::Frame(entry.frame.clone()))
        } else if entry.seq > self.cursor {
            // Lapped between the check and the load
            Some(self.resync(self.ring.published()))
        } else {
            None
        }
    }

    fn resync(&mut self, newest: u64) -> RingRead {
        let skipped = newest.saturating_sub(self.cursor);
        self.cursor = newest;
        RingRead::Gap { skipped }
    }

    /// Wait up to `timeout` for the next read
    pub async fn next(&mut self, timeout: Duration) -> Option<RingRead> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.changes.borrow_and_update();
            if let Some(read) = self.try_next() {
                return Some(read);
            }
            match tokio::time::timeout_at(deadline, self.changes.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => return None,
            }
        }
    }

    /// Next frame, skipping gap notices
    pub async fn next_frame(&mut self, timeout: Duration) -> Option<Arc<EncodedFrame>> {
        loop {
            match self.next(timeout).await? {
                RingRead::Frame(frame) => return Some(frame),
                RingRead::Gap { .. } => continue,
            }
        }
    }
}

impl Drop for RingReader {
    fn drop(&mut self) {
        self.ring.readers.fetch_sub(1, Ordering::SeqCst);
    }
}
