//! Monotonic timestamps in seconds, comparable across processes

use std::time::Duration;

use nix::sys::time::TimeValLike;
use nix::time::{clock_gettime, ClockId};

/// `CLOCK_MONOTONIC` as fractional seconds
///
/// Shared memory sinks carry these, so readers in other processes can
/// compare them with their own clock.
pub fn now_monotonic() -> f64 {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => ts.num_nanoseconds() as f64 / 1_000_000_000.0,
        Err(_) => 0.0,
    }
}

/// Seconds elapsed since a timestamp taken with [`now_monotonic`]
pub fn elapsed_since(ts: f64) -> Duration {
    Duration::from_secs_f64((now_monotonic() - ts).max(0.0))
}
