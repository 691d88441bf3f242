use serde::{Serialize, Deserialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::SystemTime;

use crate::core::{Error, Result, Speed};

/// Record types exchanged with the modem application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    /// A transmit frame was sent; marks the start of a transmit window
    TxFrame,
    /// Current contents of the transmit text field
    TxText,
    /// Request to transmit a message
    TxSendMessage,
    /// Request for the transmit text field
    TxGetText,
    /// Dial and offset frequency report
    RigFreq,
    /// Request to change dial or offset frequency
    RigSetFreq,
    /// Modem speed report
    ModeSpeed,
    /// Request to change modem speed
    ModeSetSpeed,
    /// Station heard
    RxSpot,
    /// Directed message received
    RxDirected,
    /// Band activity decoded
    RxActivity,
    /// Local callsign report
    StationCallsign,
    /// Local grid square report
    StationGrid,
}

impl RecordType {
    /// Wire name of the record type
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::TxFrame => "TX.FRAME",
            RecordType::TxText => "TX.TEXT",
            RecordType::TxSendMessage => "TX.SEND_MESSAGE",
            RecordType::TxGetText => "TX.GET_TEXT",
            RecordType::RigFreq => "RIG.FREQ",
            RecordType::RigSetFreq => "RIG.SET_FREQ",
            RecordType::ModeSpeed => "MODE.SPEED",
            RecordType::ModeSetSpeed => "MODE.SET_SPEED",
            RecordType::RxSpot => "RX.SPOT",
            RecordType::RxDirected => "RX.DIRECTED",
            RecordType::RxActivity => "RX.ACTIVITY",
            RecordType::StationCallsign => "STATION.CALLSIGN",
            RecordType::StationGrid => "STATION.GRID",
        }
    }

    /// Parses a wire name, returning `None` for types this crate ignores
    pub fn parse(name: &str) -> Option<Self> {
        let kind = match name {
            "TX.FRAME" => RecordType::TxFrame,
            "TX.TEXT" => RecordType::TxText,
            "TX.SEND_MESSAGE" => RecordType::TxSendMessage,
            "TX.GET_TEXT" => RecordType::TxGetText,
            "RIG.FREQ" => RecordType::RigFreq,
            "RIG.SET_FREQ" => RecordType::RigSetFreq,
            "MODE.SPEED" => RecordType::ModeSpeed,
            "MODE.SET_SPEED" => RecordType::ModeSetSpeed,
            "RX.SPOT" => RecordType::RxSpot,
            "RX.DIRECTED" => RecordType::RxDirected,
            "RX.ACTIVITY" => RecordType::RxActivity,
            "STATION.CALLSIGN" => RecordType::StationCallsign,
            "STATION.GRID" => RecordType::StationGrid,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured record as carried on the modem's line-oriented JSON interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Record type discriminator
    #[serde(rename = "type")]
    pub kind: String,
    /// Primary value (text, callsign, grid, ...)
    #[serde(default)]
    pub value: String,
    /// Protocol specific parameters
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl Record {
    /// Creates a record with no parameters
    pub fn new(kind: RecordType, value: impl Into<String>) -> Self {
        Record {
            kind: kind.as_str().to_string(),
            value: value.into(),
            params: Map::new(),
        }
    }

    /// Adds a parameter
    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// Decodes a record from one line of JSON
    pub fn from_json(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }

    /// Encodes the record as one line of JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Request to transmit free text
    pub fn send_message(text: impl Into<String>) -> Self {
        Record::new(RecordType::TxSendMessage, text)
    }

    /// Request to move the offset frequency
    pub fn set_offset(offset: f64) -> Self {
        Record::new(RecordType::RigSetFreq, "").with_param("OFFSET", offset.round() as i64)
    }

    /// Request for the current transmit text
    pub fn get_tx_text() -> Self {
        Record::new(RecordType::TxGetText, "")
    }

    /// Request to change modem speed
    pub fn set_speed(speed: Speed) -> Self {
        Record::new(RecordType::ModeSetSpeed, "").with_param("SPEED", speed.code())
    }

    /// Parsed record type
    pub fn record_type(&self) -> Option<RecordType> {
        RecordType::parse(&self.kind)
    }

    /// Numeric parameter, accepting numbers or numeric strings
    pub fn param_f64(&self, key: &str) -> Option<f64> {
        match self.params.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// String parameter, ignoring empty strings
    pub fn param_str(&self, key: &str) -> Option<&str> {
        match self.params.get(key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim()),
            _ => None,
        }
    }

    /// Offset frequency in Hz
    pub fn offset(&self) -> Option<f64> {
        self.param_f64("OFFSET")
    }

    /// Dial frequency in Hz
    pub fn dial(&self) -> Option<f64> {
        self.param_f64("DIAL")
    }

    /// Modem speed, from either the SPEED or SUBMODE parameter
    pub fn speed(&self) -> Option<Speed> {
        self.param_f64("SPEED")
            .or_else(|| self.param_f64("SUBMODE"))
            .and_then(Speed::from_param)
    }

    /// Origin callsign
    pub fn origin(&self) -> Option<&str> {
        self.param_str("FROM").or_else(|| self.param_str("CALL"))
    }

    /// Destination callsign
    pub fn destination(&self) -> Option<&str> {
        self.param_str("TO")
    }

    /// Signal-to-noise ratio in dB
    pub fn snr(&self) -> Option<f64> {
        self.param_f64("SNR")
    }

    /// Grid square
    pub fn grid(&self) -> Option<&str> {
        self.param_str("GRID")
    }

    /// Text carried by the record, preferring the TEXT parameter
    pub fn text(&self) -> &str {
        self.param_str("TEXT").unwrap_or(&self.value)
    }

    /// Modem timestamp (UTC parameter, epoch milliseconds)
    pub fn timestamp(&self) -> Option<SystemTime> {
        let millis = self.param_f64("UTC")? as i64;
        chrono::DateTime::from_timestamp_millis(millis).map(SystemTime::from)
    }
}

impl TryFrom<&str> for Record {
    type Error = Error;

    fn try_from(line: &str) -> Result<Self> {
        Record::from_json(line)
    }
}
