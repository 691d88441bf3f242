//! Modem record interface
//!
//! This module defines the structured records exchanged with the modem
//! application, the last-known-state store fed by incoming records, and a
//! handle for sending requests.

pub mod message;
pub mod state;

pub use self::message::{Record, RecordType};
pub use self::state::{StateKey, StateStore, StateValue};

use futures::Stream;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::{Error, Result, Speed};

/// Handle for sending records to the modem and reading its state
#[derive(Clone)]
pub struct ModemHandle {
    record_tx: mpsc::Sender<Record>,
    state: Arc<StateStore>,
}

impl ModemHandle {
    /// Creates a handle over a send primitive and a state store
    pub fn new(record_tx: mpsc::Sender<Record>, state: Arc<StateStore>) -> Self {
        ModemHandle { record_tx, state }
    }

    /// Last-known modem state
    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    /// Sends a record to the modem
    pub async fn send(&self, record: Record) -> Result<()> {
        self.record_tx.send(record).await
            .map_err(|e| Error::closed(format!("Failed to send record: {}", e)))
    }

    /// Moves the offset frequency
    ///
    /// The local state is updated right away so the next reader sees the new
    /// offset before the modem echoes it back.
    pub async fn set_offset(&self, offset: f64) -> Result<()> {
        let offset = offset.round();
        self.send(Record::set_offset(offset)).await?;
        self.state.set(StateKey::Offset, StateValue::Number(offset));
        debug!(offset, "offset set");
        Ok(())
    }

    /// Requests a fresh copy of the transmit text without waiting for channel space
    pub fn request_tx_text(&self) -> Result<()> {
        self.record_tx.try_send(Record::get_tx_text())
            .map_err(|e| Error::closed(format!("Failed to request tx text: {}", e)))
    }

    /// Transmits free text
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Record::send_message(text)).await
    }

    /// Current speed, falling back to `default` until the modem reports one
    pub fn speed_or(&self, default: Speed) -> Speed {
        self.state.speed().unwrap_or(default)
    }
}

/// Decodes newline-delimited JSON records from a modem connection
///
/// Blank lines are skipped. A read error is yielded once and ends the stream;
/// a malformed line is yielded as an error and decoding continues.
pub fn decode_lines<R>(reader: R) -> impl Stream<Item = Result<Record>>
where
    R: AsyncBufRead + Unpin,
{
    futures::stream::unfold(Some(reader.lines()), |lines| async move {
        let mut lines = lines?;
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => return Some((Record::from_json(line.trim()), Some(lines))),
                Ok(None) => return None,
                Err(e) => return Some((Err(Error::from(e)), None)),
            }
        }
    })
}
