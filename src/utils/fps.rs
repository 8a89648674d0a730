//! Rolling one-second frame counter

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Counts events and publishes the count of the last full window
///
/// Owned by the single thread that calls [`FpsWindow::tick`]; the published
/// value is an atomic readable from anywhere.
#[derive(Debug)]
pub struct FpsWindow {
    window: Duration,
    started: Instant,
    count: u32,
    published: Arc<AtomicU32>,
}

impl FpsWindow {
    pub fn new(published: Arc<AtomicU32>) -> Self {
        Self::with_window(published, Duration::from_secs(1))
    }

    pub fn with_window(published: Arc<AtomicU32>, window: Duration) -> Self {
        Self {
            window,
            started: Instant::now(),
            count: 0,
            published,
        }
    }

    /// Count one event
    pub fn tick(&mut self) {
        self.roll(Instant::now());
        self.count += 1;
    }

    /// Close the window if it ran out, without counting anything
    pub fn refresh(&mut self) {
        self.roll(Instant::now());
    }

    fn roll(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.started);
        if elapsed < self.window {
            return;
        }
        // A gap of more than one window means nothing happened in between
        let value = if elapsed >= self.window * 2 { 0 } else { self.count };
        self.published.store(value, Ordering::Relaxed);
        self.started = now;
        self.count = 0;
    }

    pub fn current(&self) -> u32 {
        self.published.load(Ordering::Relaxed)
    }
}
