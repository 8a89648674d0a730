//! Cancellation token observable from inside a blocking `poll`

use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};

/// Stop flag plus an eventfd that wakes whoever is polling on it
#[derive(Debug)]
pub struct StopToken {
    stopped: AtomicBool,
    wake: EventFd,
}

impl StopToken {
    pub fn new() -> io::Result<Self> {
        let wake = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
            .map_err(io::Error::from)?;
        Ok(Self {
            stopped: AtomicBool::new(false),
            wake,
        })
    }

    /// Set the flag and wake the waiter. Idempotent.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            // EAGAIN only if the counter is saturated, already readable then
            let _ = self.wake.write(1);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Descriptor that becomes readable once `stop` was called
    pub fn wake_fd(&self) -> BorrowedFd<'_> {
        self.wake.as_fd()
    }

    /// Sleep up to `timeout`, returning early with `true` once stopped
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_stopped() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            let ms = left.as_millis().clamp(1, u16::MAX as u128) as u16;
            let mut fds = [PollFd::new(self.wake_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(ms)) {
                Ok(_) | Err(Errno::EINTR) => {}
                Err(_) => std::thread::sleep(left.min(Duration::from_millis(10))),
            }
        }
        self.is_stopped()
    }
}
