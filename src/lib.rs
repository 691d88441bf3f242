//! slotwise: client-side control for a time-slotted radio modem
//!
//! The modem exchanges JSON records with this crate but never tells it when
//! a transmit window starts, whether a message went out, or who else is
//! using the offset frequency. This library infers all three:
//!
//! - [`time`] predicts window boundaries from transmit frame events
//! - [`spectrum`] keeps our signal clear of recently heard stations
//! - [`outgoing`] follows messages through the transmit text field
//! - [`beacon`] sends periodic beacons from a reserved sub-band
//! - [`rx`] rebuilds messages spanning several windows
//!
//! [`client::Client`] wires them together.
pub mod beacon;
pub mod client;
pub mod core;
pub mod outgoing;
pub mod protocol;
pub mod rx;
pub mod spectrum;
pub mod time;
pub mod util;

// Re-export commonly used items
pub use crate::client::{Client, ClientChannels};
pub use crate::core::{Config, Error, Result, Speed};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
