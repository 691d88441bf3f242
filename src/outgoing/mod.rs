//! Outgoing message lifecycle
//!
//! Messages are handed to the modem as text and then followed through the
//! transmit text field until they have been transmitted or have aged out.

mod message;
mod tracker;

pub use self::message::{normalize_tx_text, MessageHandle, MessageStatus, OutgoingMessage, StatusChange};
pub use self::tracker::OutgoingMessageTracker;
