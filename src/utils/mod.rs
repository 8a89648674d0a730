//! Utility modules shared by the capture pipeline

pub mod clock;
pub mod fps;
pub mod stop;
pub mod throttle;

pub use clock::now_monotonic;
pub use fps::FpsWindow;
pub use stop::StopToken;
pub use throttle::LogThrottler;
