//! Core types shared by every slotwise component
//!
//! This module contains the error taxonomy, the modem speed table,
//! configuration, and the clock used for all window arithmetic.

pub mod clock;
pub mod error;
pub mod types;
pub mod serde;

pub use self::clock::Clock;
pub use self::error::{Error, Result};
pub use self::types::{
    BeaconConfig,
    Config,
    OffsetRange,
    OutgoingConfig,
    SpectrumConfig,
    Speed,
};

/// End-of-message marker terminating a logical message
pub const EOM: char = '\u{2662}';

/// Destination used for beacon messages
pub const BEACON_DESTINATION: &str = "@HB";

/// Grace period added to a window when judging fragment adjacency
pub const ADJACENCY_GRACE: std::time::Duration = std::time::Duration::from_secs(1);
