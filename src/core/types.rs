use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Serialize, Deserialize};

use super::{Error, Result};

/// Modem speed setting
///
/// Each speed has a fixed transmit window duration and a fixed signal
/// bandwidth. The numeric codes are the ones the modem uses on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speed {
    /// 30 second windows, 25 Hz
    Slow,
    /// 15 second windows, 50 Hz
    Normal,
    /// 10 second windows, 80 Hz
    Fast,
    /// 6 second windows, 160 Hz
    Turbo,
    /// 4 second windows, 250 Hz
    Ultra,
}

impl Speed {
    /// All speeds from slowest to fastest
    pub const ALL: [Speed; 5] = [Speed::Slow, Speed::Normal, Speed::Fast, Speed::Turbo, Speed::Ultra];

    /// Bandwidth assumed for a heard signal whose speed is unknown
    pub const WORST_CASE_BANDWIDTH: f64 = 160.0;

    /// Transmit window duration
    pub fn window_duration(&self) -> Duration {
        match self {
            Speed::Slow => Duration::from_secs(30),
            Speed::Normal => Duration::from_secs(15),
            Speed::Fast => Duration::from_secs(10),
            Speed::Turbo => Duration::from_secs(6),
            Speed::Ultra => Duration::from_secs(4),
        }
    }

    /// Signal bandwidth in Hz
    pub fn bandwidth(&self) -> f64 {
        match self {
            Speed::Slow => 25.0,
            Speed::Normal => 50.0,
            Speed::Fast => 80.0,
            Speed::Turbo => 160.0,
            Speed::Ultra => 250.0,
        }
    }

    /// Modem submode code
    pub fn code(&self) -> u8 {
        match self {
            Speed::Slow => 4,
            Speed::Normal => 0,
            Speed::Fast => 1,
            Speed::Turbo => 2,
            Speed::Ultra => 8,
        }
    }

    /// Maps a modem submode code to a speed
    pub fn from_code(code: u8) -> Option<Self> {
        Speed::ALL.iter().copied().find(|speed| speed.code() == code)
    }

    /// Maps a numeric record parameter to a speed
    ///
    /// Values that are not a whole submode code are rejected rather than
    /// truncated.
    pub fn from_param(value: f64) -> Option<Self> {
        if value.fract() != 0.0 || !(0.0..=f64::from(u8::MAX)).contains(&value) {
            return None;
        }
        Speed::from_code(value as u8)
    }

    /// Whether automatic beacons may be sent at this speed
    pub fn allows_beacons(&self) -> bool {
        *self < Speed::Turbo
    }
}

impl Default for Speed {
    fn default() -> Self {
        Speed::Normal
    }
}

impl fmt::Display for Speed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Speed::Slow => "slow",
            Speed::Normal => "normal",
            Speed::Fast => "fast",
            Speed::Turbo => "turbo",
            Speed::Ultra => "ultra",
        };
        f.write_str(name)
    }
}

impl FromStr for Speed {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "slow" => Ok(Speed::Slow),
            "normal" => Ok(Speed::Normal),
            "fast" => Ok(Speed::Fast),
            "turbo" => Ok(Speed::Turbo),
            "ultra" => Ok(Speed::Ultra),
            other => Err(Error::config(format!("Unknown speed: {}", other))),
        }
    }
}

/// Usable offset range in Hz
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OffsetRange {
    /// Lowest usable offset
    pub min: f64,
    /// Highest usable offset
    pub max: f64,
}

impl OffsetRange {
    /// Creates a new range
    pub fn new(min: f64, max: f64) -> Self {
        OffsetRange { min, max }
    }

    /// Whether the offset lies inside the range
    pub fn contains(&self, offset: f64) -> bool {
        offset >= self.min && offset <= self.max
    }

    /// Width of the range
    pub fn width(&self) -> f64 {
        self.max - self.min
    }
}

/// Offset allocation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpectrumConfig {
    /// Range the allocator may move the offset within
    pub range: OffsetRange,
    /// Maximum age of a heard signal to count as occupancy
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub max_age: Duration,
    /// Multiplier applied to own bandwidth when sizing a free gap
    pub safety_factor: f64,
    /// How long before a window boundary the allocator re-evaluates
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub before_boundary: Duration,
}

impl Default for SpectrumConfig {
    fn default() -> Self {
        SpectrumConfig {
            range: OffsetRange::new(1000.0, 2500.0),
            max_age: Duration::from_secs(180),
            safety_factor: 1.25,
            before_boundary: Duration::from_millis(500),
        }
    }
}

impl SpectrumConfig {
    /// Settings for the reserved beacon sub-band
    pub fn beacon_band() -> Self {
        SpectrumConfig {
            range: OffsetRange::new(500.0, 1000.0),
            safety_factor: 1.1,
            ..SpectrumConfig::default()
        }
    }
}

/// Outgoing message tracking settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingConfig {
    /// Interval between transmit text polls
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub poll_interval: Duration,
    /// Number of transmit windows before an unsent message fails
    pub max_age_windows: u32,
}

impl Default for OutgoingConfig {
    fn default() -> Self {
        OutgoingConfig {
            poll_interval: Duration::from_millis(500),
            max_age_windows: 30,
        }
    }
}

impl OutgoingConfig {
    /// Age at which an unsent message fails for the given speed
    pub fn max_age(&self, speed: Speed) -> Duration {
        speed.window_duration() * self.max_age_windows
    }
}

/// Beacon scheduling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeaconConfig {
    /// Start sending beacons when the client starts
    #[serde(default)]
    pub enabled: bool,
    /// Minimum time between beacons
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub interval: Duration,
    /// How long before the boundary the reserved-band offset is applied
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub lead_time: Duration,
    /// Skip beacons while a two-way exchange is in progress
    pub defer_during_exchange: bool,
    /// Number of windows an exchange stays active after the last message
    pub exchange_windows: u32,
    /// Allocation settings inside the reserved sub-band
    pub band: SpectrumConfig,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        BeaconConfig {
            enabled: false,
            interval: Duration::from_secs(10 * 60),
            lead_time: Duration::from_millis(250),
            defer_during_exchange: true,
            exchange_windows: 4,
            band: SpectrumConfig::beacon_band(),
        }
    }
}

/// Configuration for a slotwise client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Speed assumed until the modem reports one
    pub speed: Speed,
    /// Local station callsign, if known ahead of the modem reporting it
    pub callsign: Option<String>,
    /// Capacity of internal record channels
    pub channel_capacity: usize,
    /// Primary offset allocation
    pub spectrum: SpectrumConfig,
    /// Outgoing message tracking
    pub outgoing: OutgoingConfig,
    /// Beacon scheduling
    pub beacon: BeaconConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            speed: Speed::Normal,
            callsign: None,
            channel_capacity: 100,
            spectrum: SpectrumConfig::default(),
            outgoing: OutgoingConfig::default(),
            beacon: BeaconConfig::default(),
        }
    }
}

impl Config {
    /// Parses a JSON configuration document, filling omitted sections with defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)
            .map_err(|e| Error::config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that the configuration is consistent
    pub fn validate(&self) -> Result<()> {
        for (name, spectrum) in [("spectrum", &self.spectrum), ("beacon.band", &self.beacon.band)] {
            if spectrum.range.width() <= 0.0 {
                return Err(Error::config(format!("{}: empty offset range", name)));
            }
            if spectrum.safety_factor < 1.0 {
                return Err(Error::config(format!("{}: safety factor below 1.0", name)));
            }
        }

        let primary = self.spectrum.range;
        let reserved = self.beacon.band.range;
        if reserved.max > primary.min && reserved.min < primary.max {
            return Err(Error::config("Beacon band overlaps the primary offset range"));
        }

        if self.outgoing.poll_interval < Duration::from_millis(10) {
            return Err(Error::config("Poll interval too small"));
        }
        if self.outgoing.max_age_windows == 0 {
            return Err(Error::config("Outgoing max age must span at least one window"));
        }
        if self.channel_capacity == 0 {
            return Err(Error::config("Channel capacity must be non-zero"));
        }

        Ok(())
    }
}
