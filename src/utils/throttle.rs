//! Log throttling utility
//!
//! Limits how often the same message is recorded while an error repeats,
//! such as a missing device being reopened every second.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug)]
struct Entry {
    last: Instant,
    suppressed: u64,
}

/// Log throttler that limits how often the same message is logged
///
/// Suppressed repeats are counted and handed back by the next call that is
/// allowed through, so the log still tells how often something happened.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use vcap_streamer::utils::LogThrottler;
///
/// let throttler = LogThrottler::new(Duration::from_secs(5));
/// assert_eq!(throttler.check("device_error"), Some(0));
/// assert_eq!(throttler.check("device_error"), None);
/// ```
#[derive(Debug)]
pub struct LogThrottler {
    entries: Mutex<HashMap<String, Entry>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// `Some(suppressed)` if the message should be logged now, where
    /// `suppressed` is the number of repeats swallowed since the last one
    pub fn check(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.last) < self.interval => {
                entry.suppressed += 1;
                None
            }
            Some(entry) => {
                entry.last = now;
                Some(std::mem::take(&mut entry.suppressed))
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        last: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    /// Check if a message should be logged (not throttled)
    pub fn should_log(&self, key: &str) -> bool {
        self.check(key).is_some()
    }

    /// Forget a key, so the next occurrence is logged immediately.
    /// Called when the error condition recovers.
    pub fn clear(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    pub fn clear_all(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for LogThrottler {
    /// 5 second interval
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Macro for throttled warning logging
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.check($key) {
            if suppressed > 0 {
                tracing::warn!(suppressed, $($arg)*);
            } else {
                tracing::warn!($($arg)*);
            }
        }
    };
}

/// Macro for throttled error logging
#[macro_export]
macro_rules! error_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.check($key) {
            if suppressed > 0 {
                tracing::error!(suppressed, $($arg)*);
            } else {
                tracing::error!($($arg)*);
            }
        }
    };
}

/// Macro for throttled info logging
#[macro_export]
macro_rules! info_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.check($key) {
            if suppressed > 0 {
                tracing::info!(suppressed, $($arg)*);
            } else {
                tracing::info!($($arg)*);
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_throttling() {
        let throttler = LogThrottler::new(Duration::from_millis(100));

        assert!(throttler.should_log("test_key"));
        assert!(!throttler.should_log("test_key"));

        thread::sleep(Duration::from_millis(150));
        assert!(throttler.should_log("test_key"));
    }

    #[test]
    fn test_suppressed_count() {
        let throttler = LogThrottler::new(Duration::from_millis(50));

        assert_eq!(throttler.check("open"), Some(0));
        assert_eq!(throttler.check("open"), None);
        assert_eq!(throttler.check("open"), None);

        thread::sleep(Duration::from_millis(80));
        assert_eq!(throttler.check("open"), Some(2));
        assert_eq!(throttler.check("open"), None);
    }

    #[test]
    fn test_different_keys() {
        let throttler = LogThrottler::with_secs(10);

        assert!(throttler.should_log("key1"));
        assert!(throttler.should_log("key2"));
        assert!(!throttler.should_log("key1"));
        assert!(!throttler.should_log("key2"));
        assert_eq!(throttler.len(), 2);
    }

    #[test]
    fn test_clear() {
        let throttler = LogThrottler::with_secs(10);

        assert!(throttler.should_log("test_key"));
        assert!(!throttler.should_log("test_key"));

        throttler.clear("test_key");
        assert!(throttler.should_log("test_key"));

        throttler.clear_all();
        assert!(throttler.is_empty());
    }

    #[test]
    fn test_macros_compile() {
        let throttler = LogThrottler::default();
        crate::warn_throttled!(throttler, "warn", "Warning: {}", 1);
        crate::error_throttled!(throttler, "error", "Error: {}", 2);
        crate::info_throttled!(throttler, "info", "Info");
    }
}
