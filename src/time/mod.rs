//! Transmit window timing
//!
//! The modem exposes no window boundaries directly. The most reliable
//! signal is the transmit frame event, reported just after a frame goes out
//! at the start of a transmit window. Received messages are reported about
//! a second before their window ends. [`WindowClock`] anchors to the most
//! recent of either and steps forward in whole window durations:
//!
//! 1. No prediction exists until a frame or a receive is observed
//! 2. Each frame, and the first receive of each cycle, re-anchors the
//!    prediction, correcting any drift
//! 3. Speed changes apply on the next recomputation, never retroactively
//!
//! # Examples
//!
//! ```no_run
//! use slotwise::core::{Clock, Speed};
//! use slotwise::time::WindowClock;
//! use std::time::{Duration, SystemTime};
//!
//! #[tokio::main]
//! async fn main() {
//!     let windows = WindowClock::new(Clock::new(), Speed::Normal);
//!     windows.observe_frame(SystemTime::now());
//!
//!     // wake a quarter second before the next window
//!     windows.sleep_until(Duration::from_millis(250)).await;
//! }
//! ```

mod window;

pub use self::window::{TransmitWindow, WindowBoundary, WindowClock};

/// Utility functions for time handling
pub mod util {
    use chrono::{DateTime, Utc};
    use std::time::{Duration, SystemTime};

    /// Absolute difference between two timestamps
    pub fn time_diff(a: SystemTime, b: SystemTime) -> Duration {
        a.duration_since(b).unwrap_or_else(|e| e.duration())
    }

    /// Renders a timestamp for log output
    pub fn fmt_time(time: SystemTime) -> String {
        DateTime::<Utc>::from(time).format("%H:%M:%S%.3f").to_string()
    }
}
