//! Parallel frame encoding
//!
//! A fixed set of long-lived threads, each owning one encoder. The capture
//! thread hands a frame to a free worker and later collects results; there is
//! no job queue, so at most one frame per worker is in flight.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::encoder::{EncoderFactory, FrameEncoder};
use super::frame::{EncodedFrame, RawFrame};
use crate::error::EncodeError;

/// Upper limit of encoder threads
pub const MAX_WORKERS: usize = 32;

/// What a worker sends back
#[derive(Debug)]
pub struct WorkerResult {
    pub worker: usize,
    /// Sequence of the raw frame
    pub sequence: u64,
    pub result: Result<EncodedFrame, EncodeError>,
    pub elapsed: Duration,
}

struct WorkerSlot {
    tx: Option<Sender<RawFrame>>,
    busy: bool,
    handle: Option<JoinHandle<()>>,
}

/// Fixed pool of encoder threads
pub struct WorkerPool {
    name: String,
    workers: Vec<WorkerSlot>,
    results: Receiver<WorkerResult>,
}

impl WorkerPool {
    /// Spawn `n` workers (clamped to 1..=32), each with an encoder from
    /// `factory`. Encoders are created up front so a broken backend fails
    /// here and not inside a thread.
    pub fn new(name: &str, n: usize, factory: Arc<dyn EncoderFactory>) -> Result<Self, EncodeError> {
        let n = n.clamp(1, MAX_WORKERS);
        let encoders = (0..n)
            .map(|_| factory.create())
            .collect::<Result<Vec<_>, _>>()?;

        let (results_tx, results) = mpsc::channel();
        let mut workers = Vec::with_capacity(n);
        for (index, encoder) in encoders.into_iter().enumerate() {
            let (tx, rx) = mpsc::channel();
            let results_tx = results_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || worker_loop(index, encoder, rx, results_tx))
                .map_err(|e| EncodeError::Backend(format!("can't spawn worker: {}", e)))?;
            workers.push(WorkerSlot {
                tx: Some(tx),
                busy: false,
                handle: Some(handle),
            });
        }
        info!(
            "Started {} {} workers ({})",
            n,
            name,
            factory.encoder_type()
        );
        Ok(Self {
            name: name.to_string(),
            workers,
            results,
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn busy_count(&self) -> usize {
        self.workers.iter().filter(|w| w.busy).count()
    }

    pub fn has_free(&self) -> bool {
        self.workers.iter().any(|w| !w.busy && w.tx.is_some())
    }

    /// Hand a frame to a free worker, giving it back when all are busy
    pub fn dispatch(&mut self, frame: RawFrame) -> Result<usize, RawFrame> {
        let Some(index) = self.workers.iter().position(|w| !w.busy && w.tx.is_some()) else {
            return Err(frame);
        };
        let slot = &mut self.workers[index];
        let Some(tx) = slot.tx.as_ref() else {
            return Err(frame);
        };
        match tx.send(frame) {
            Ok(()) => {
                slot.busy = true;
                Ok(index)
            }
            Err(mpsc::SendError(frame)) => {
                warn!("{} worker {} is gone", self.name, index);
                slot.tx = None;
                Err(frame)
            }
        }
    }

    /// Wait up to `timeout` for a result, then take whatever else is ready
    pub fn collect(&mut self, timeout: Duration) -> Vec<WorkerResult> {
        let mut out = Vec::new();
        if self.busy_count() == 0 {
            return out;
        }
        match self.results.recv_timeout(timeout) {
            Ok(result) => out.push(result),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return out,
        }
        out.extend(self.results.try_iter());
        for result in &out {
            if let Some(slot) = self.workers.get_mut(result.worker) {
                slot.busy = false;
            }
        }
        out
    }

    /// Results that are ready now, without waiting
    pub fn try_collect(&mut self) -> Vec<WorkerResult> {
        self.collect(Duration::ZERO)
    }

    /// Block up to `timeout` until a worker is free, returning the results
    /// that freed it
    pub fn wait_free(&mut self, timeout: Duration) -> Vec<WorkerResult> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::new();
        while !self.has_free() {
            let now = Instant::now();
            if now >= deadline || self.busy_count() == 0 {
                break;
            }
            out.extend(self.collect(deadline - now));
        }
        out
    }

    /// Wait for every busy worker to finish, up to `timeout`
    pub fn drain(&mut self, timeout: Duration) -> Vec<WorkerResult> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::new();
        while self.busy_count() > 0 {
            let now = Instant::now();
            if now >= deadline {
                warn!("{} workers still busy after drain timeout", self.name);
                break;
            }
            out.extend(self.collect(deadline - now));
        }
        out
    }

    /// Stop all workers and join them
    pub fn shutdown(&mut self) {
        for slot in &mut self.workers {
            slot.tx = None;
        }
        for (index, slot) in self.workers.iter_mut().enumerate() {
            if let Some(handle) = slot.handle.take() {
                if handle.join().is_err() {
                    warn!("{} worker {} panicked", self.name, index);
                }
            }
            slot.busy = false;
        }
        debug!("{} workers stopped", self.name);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    index: usize,
    mut encoder: Box<dyn FrameEncoder>,
    jobs: Receiver<RawFrame>,
    results: Sender<WorkerResult>,
) {
    while let Ok(frame) = jobs.recv() {
        let started = Instant::now();
        let sequence = frame.sequence;
        let result = encoder.encode(&frame);
        // The hardware buffer may be requeued as soon as the result arrives
        drop(frame);
        let sent = results.send(WorkerResult {
            worker: index,
            sequence,
            result,
            elapsed: started.elapsed(),
        });
        if sent.is_err() {
            break;
        }
    }
}

/// Puts worker results back into capture order
///
/// Results come back in completion order. Within a batch they are sorted by
/// sequence; anything not newer than the last published frame is dropped
/// instead of waiting for stragglers.
#[derive(Debug, Default)]
pub struct Reorderer {
    last_published: Option<u64>,
    dropped: u64,
}

impl Reorderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ordered frames that may be published
    pub fn accept(&mut self, mut frames: Vec<EncodedFrame>) -> Vec<EncodedFrame> {
        frames.sort_by_key(|f| f.sequence);
        frames.retain(|frame| {
            if self.last_published.is_some_and(|last| frame.sequence <= last) {
                debug!(
                    "Dropping late frame seq={} (published {:?})",
                    frame.sequence, self.last_published
                );
                self.dropped += 1;
                false
            } else {
                self.last_published = Some(frame.sequence);
                true
            }
        });
        frames
    }

    pub fn last_published(&self) -> Option<u64> {
        self.last_published
    }

    /// Late results dropped so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
