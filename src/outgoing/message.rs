use serde::Serialize;
use std::fmt;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;

use crate::core::{Error, Result, EOM};

/// Commands whose transmitted form carries a trailing checksum token
const CHECKSUM_COMMANDS: [&str; 3] = ["MSG", "QUERY", "CMD"];

/// Lifecycle of an outgoing message
///
/// Statuses only move forward: Queued, Sending, then Sent or Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Handed to the modem, not yet seen in the transmit text
    Queued,
    /// Showing in the transmit text
    Sending,
    /// Left the transmit text after showing in it
    Sent,
    /// Never transmitted within the maximum age
    Failed,
}

impl MessageStatus {
    /// Whether the message has left the tracker
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Sent | MessageStatus::Failed)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageStatus::Queued => "queued",
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A message handed to the modem for transmission
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingMessage {
    /// Tracker-assigned identifier
    pub id: u64,
    /// Destination callsign or group
    pub destination: String,
    /// Message body
    pub body: String,
    /// When the message was handed to the modem
    #[serde(serialize_with = "crate::core::serde::serialize_time")]
    pub enqueued_at: SystemTime,
    /// Current status
    pub status: MessageStatus,
    /// When the status last changed
    #[serde(serialize_with = "crate::core::serde::serialize_time")]
    pub last_status_change_at: SystemTime,
}

impl OutgoingMessage {
    /// Creates a queued message
    pub fn new(id: u64, destination: impl Into<String>, body: impl Into<String>, now: SystemTime) -> Self {
        OutgoingMessage {
            id,
            destination: destination.into().trim().to_uppercase(),
            body: body.into().trim().to_string(),
            enqueued_at: now,
            status: MessageStatus::Queued,
            last_status_change_at: now,
        }
    }

    /// Text handed to the modem, destination then body
    pub fn render(&self) -> String {
        if self.body.is_empty() {
            self.destination.clone()
        } else {
            format!("{} {}", self.destination, self.body)
        }
    }

    /// Whether the modem appends a checksum token when transmitting this message
    pub fn carries_checksum(&self) -> bool {
        let relayed = self.destination.contains('>');
        let command = self.body.split_whitespace().next().unwrap_or_default();
        relayed || CHECKSUM_COMMANDS.contains(&command)
    }

    /// Whether normalized transmit text shows this message
    ///
    /// The match is exact. Text that merely starts with the message does not
    /// count, except for a single trailing checksum token on messages that
    /// carry one.
    pub fn matches(&self, tx_text: &str) -> bool {
        let rendered = self.render();
        if tx_text == rendered {
            return true;
        }
        if !self.carries_checksum() {
            return false;
        }

        match tx_text.rsplit_once(' ') {
            Some((head, checksum)) => !checksum.is_empty() && head.trim_end() == rendered,
            None => false,
        }
    }

    /// Time since the message was enqueued
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.enqueued_at).unwrap_or(Duration::ZERO)
    }

    /// Moves to `status` if that is a forward transition
    ///
    /// Returns the previous status when the status changed.
    pub fn advance(&mut self, status: MessageStatus, now: SystemTime) -> Option<MessageStatus> {
        if status <= self.status || self.status.is_terminal() {
            return None;
        }
        let previous = self.status;
        self.status = status;
        self.last_status_change_at = now;
        Some(previous)
    }
}

/// Strips the transmit text down to what the modem will send
///
/// The modem prefixes the text with the local callsign and a colon and may
/// end it with the end-of-message marker.
pub fn normalize_tx_text(tx_text: &str) -> String {
    let text = tx_text.trim();
    let text = match text.split_once(':') {
        Some((call, rest)) if !call.trim().is_empty() && !call.trim().contains(' ') => rest,
        _ => text,
    };
    text.trim_matches(|c: char| c == ' ' || c == EOM).to_string()
}

/// A status transition reported by the tracker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusChange {
    /// The message after the transition
    pub message: OutgoingMessage,
    /// Status before the transition
    pub previous: MessageStatus,
}

impl StatusChange {
    /// Status after the transition
    pub fn status(&self) -> MessageStatus {
        self.message.status
    }
}

/// Caller-side view of a tracked message
#[derive(Debug, Clone)]
pub struct MessageHandle {
    id: u64,
    status: watch::Receiver<MessageStatus>,
}

impl MessageHandle {
    pub(crate) fn new(id: u64, status: watch::Receiver<MessageStatus>) -> Self {
        MessageHandle { id, status }
    }

    /// Tracker-assigned identifier
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Latest known status
    pub fn status(&self) -> MessageStatus {
        *self.status.borrow()
    }

    /// Waits until the message is Sent or Failed
    pub async fn wait_terminal(&mut self, timeout: Duration) -> Result<MessageStatus> {
        let waited = tokio::time::timeout(timeout, self.status.wait_for(|s| s.is_terminal())).await;
        match waited {
            Ok(Ok(status)) => Ok(*status),
            Ok(Err(_)) => Err(Error::closed(format!("message {} dropped before completion", self.id))),
            Err(_) => Err(Error::timeout(format!("message {}", self.id), timeout)),
        }
    }
}
