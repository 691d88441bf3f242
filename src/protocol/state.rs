use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use crate::core::{Error, Result, Speed};
use super::message::{Record, RecordType};

/// Named pieces of last-known modem state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKey {
    /// Offset frequency in Hz
    Offset,
    /// Dial frequency in Hz
    Dial,
    /// Modem speed code
    Speed,
    /// Transmit text field contents
    TxText,
    /// Local callsign
    Callsign,
    /// Local grid square
    Grid,
}

impl StateKey {
    const ALL: [StateKey; 6] = [
        StateKey::Offset,
        StateKey::Dial,
        StateKey::Speed,
        StateKey::TxText,
        StateKey::Callsign,
        StateKey::Grid,
    ];
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StateKey::Offset => "offset",
            StateKey::Dial => "dial",
            StateKey::Speed => "speed",
            StateKey::TxText => "tx_text",
            StateKey::Callsign => "callsign",
            StateKey::Grid => "grid",
        };
        f.write_str(name)
    }
}

/// A stored state value
#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
    /// Numeric value
    Number(f64),
    /// Text value
    Text(String),
}

impl StateValue {
    /// Numeric view of the value
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StateValue::Number(n) => Some(*n),
            StateValue::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Text view of the value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            StateValue::Text(s) => Some(s),
            StateValue::Number(_) => None,
        }
    }
}

/// Last-known modem state, updated asynchronously from incoming records
///
/// Every key is backed by a watch channel, so readers either take the
/// current value or wait for one with a bounded timeout.
pub struct StateStore {
    slots: HashMap<StateKey, watch::Sender<Option<StateValue>>>,
}

impl StateStore {
    /// Creates an empty store
    pub fn new() -> Self {
        let slots = StateKey::ALL
            .iter()
            .map(|key| (*key, watch::channel(None).0))
            .collect();
        StateStore { slots }
    }

    fn slot(&self, key: StateKey) -> &watch::Sender<Option<StateValue>> {
        // every key is inserted in new()
        &self.slots[&key]
    }

    /// Current value, if one has been seen
    pub fn get(&self, key: StateKey) -> Option<StateValue> {
        self.slot(key).borrow().clone()
    }

    /// Stores a value, returning whether it differed from the previous one
    pub fn set(&self, key: StateKey, value: StateValue) -> bool {
        self.slot(key).send_if_modified(|current| {
            if current.as_ref() == Some(&value) {
                false
            } else {
                *current = Some(value);
                true
            }
        })
    }

    /// Forgets a value
    pub fn clear(&self, key: StateKey) {
        self.slot(key).send_replace(None);
    }

    /// Waits up to `timeout` for the key to hold a value
    pub async fn wait_for(&self, key: StateKey, timeout: Duration) -> Result<StateValue> {
        let mut rx = self.slot(key).subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|value| value.is_some())).await;

        match waited {
            Ok(Ok(value)) => value
                .clone()
                .ok_or_else(|| Error::invalid_state(format!("{} vanished while waiting", key))),
            Ok(Err(_)) => Err(Error::closed(format!("{} state channel", key))),
            Err(_) => Err(Error::timeout(key.to_string(), timeout)),
        }
    }

    /// Subscribes to changes of a key
    pub fn watch(&self, key: StateKey) -> watch::Receiver<Option<StateValue>> {
        self.slot(key).subscribe()
    }

    /// Offset frequency in Hz
    pub fn offset(&self) -> Option<f64> {
        self.get(StateKey::Offset).and_then(|v| v.as_f64())
    }

    /// Dial frequency in Hz
    pub fn dial(&self) -> Option<f64> {
        self.get(StateKey::Dial).and_then(|v| v.as_f64())
    }

    /// Modem speed
    pub fn speed(&self) -> Option<Speed> {
        self.get(StateKey::Speed)
            .and_then(|v| v.as_f64())
            .and_then(Speed::from_param)
    }

    /// Transmit text field contents
    pub fn tx_text(&self) -> Option<String> {
        self.get(StateKey::TxText).and_then(|v| v.as_str().map(str::to_string))
    }

    /// Local callsign
    pub fn callsign(&self) -> Option<String> {
        self.get(StateKey::Callsign).and_then(|v| v.as_str().map(str::to_string))
    }

    /// Local grid square
    pub fn grid(&self) -> Option<String> {
        self.get(StateKey::Grid).and_then(|v| v.as_str().map(str::to_string))
    }

    /// Updates the store from an incoming record
    ///
    /// Returns the keys whose value changed.
    pub fn apply(&self, record: &Record) -> Vec<StateKey> {
        let mut changed = Vec::new();
        let mut update = |key: StateKey, value: StateValue| {
            if self.set(key, value) {
                changed.push(key);
            }
        };

        match record.record_type() {
            Some(RecordType::RigFreq) => {
                if let Some(offset) = record.offset() {
                    update(StateKey::Offset, StateValue::Number(offset));
                }
                if let Some(dial) = record.dial() {
                    update(StateKey::Dial, StateValue::Number(dial));
                }
            }
            Some(RecordType::ModeSpeed) => {
                if let Some(speed) = record.speed() {
                    update(StateKey::Speed, StateValue::Number(speed.code() as f64));
                }
            }
            Some(RecordType::TxText) => {
                update(StateKey::TxText, StateValue::Text(record.text().to_string()));
            }
            Some(RecordType::StationCallsign) if !record.value.is_empty() => {
                update(StateKey::Callsign, StateValue::Text(record.value.trim().to_uppercase()));
            }
            Some(RecordType::StationGrid) if !record.value.is_empty() => {
                update(StateKey::Grid, StateValue::Text(record.value.trim().to_string()));
            }
            _ => {}
        }

        if !changed.is_empty() {
            debug!(kind = %record.kind, ?changed, "state updated");
        }
        changed
    }
}

impl Default for StateStore {
    fn default() -> Self {
        StateStore::new()
    }
}
