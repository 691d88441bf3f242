use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tracing::trace;

use crate::core::Speed;
use crate::protocol::{Record, RecordType};
use super::allocator::SignalObservation;

/// Upper bound on held observations; the oldest go first
pub const MAX_SPOTS: usize = 5000;

/// Default retention, matching the allocator's default observation age
const DEFAULT_RETENTION: Duration = Duration::from_secs(180);

/// Recently heard signals, fed from spot, activity and directed records
#[derive(Debug)]
pub struct SpotLog {
    spots: Mutex<Vec<SignalObservation>>,
    retention: Duration,
}

impl Default for SpotLog {
    fn default() -> Self {
        SpotLog::with_retention(DEFAULT_RETENTION)
    }
}

impl SpotLog {
    /// Creates an empty log
    pub fn new() -> Self {
        SpotLog::default()
    }

    /// Creates an empty log that forgets observations older than `retention`
    pub fn with_retention(retention: Duration) -> Self {
        SpotLog {
            spots: Mutex::new(Vec::new()),
            retention,
        }
    }

    /// How long observations are held
    pub fn retention(&self) -> Duration {
        self.retention
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<SignalObservation>> {
        self.spots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds an observation, or refreshes the held one with the same
    /// (origin, offset, snr)
    ///
    /// A station that keeps transmitting stays recent for as long as it is
    /// heard. Expired observations are dropped on the way in and the log
    /// never holds more than [`MAX_SPOTS`]. Returns whether the observation
    /// was added as new.
    pub fn record(&self, observation: SignalObservation) -> bool {
        let mut spots = self.lock();
        let heard_at = observation.heard_at;
        spots.retain(|s| is_fresh(s, heard_at, self.retention));

        let held = spots.iter_mut().find(|s| {
            s.origin == observation.origin
                && s.offset_hz == observation.offset_hz
                && s.snr == observation.snr
        });
        if let Some(held) = held {
            held.heard_at = held.heard_at.max(heard_at);
            return false;
        }

        trace!(
            origin = %observation.origin,
            offset = observation.offset_hz,
            bandwidth = observation.bandwidth_hz,
            "signal heard"
        );
        spots.push(observation);
        if spots.len() > MAX_SPOTS {
            let excess = spots.len() - MAX_SPOTS;
            spots.drain(..excess);
        }
        true
    }

    /// Extracts an observation from an incoming record
    ///
    /// Only RX.SPOT, RX.ACTIVITY and RX.DIRECTED records with an origin and
    /// an offset count. A signal heard without a speed is assumed to occupy
    /// the widest bandwidth that still carries beacons.
    pub fn observation_from(record: &Record, heard_at: SystemTime) -> Option<SignalObservation> {
        match record.record_type()? {
            RecordType::RxSpot | RecordType::RxActivity | RecordType::RxDirected => {}
            _ => return None,
        }

        let origin = record.origin()?.to_uppercase();
        let offset_hz = record.offset()?;
        let bandwidth_hz = record
            .speed()
            .map(|speed| speed.bandwidth())
            .unwrap_or(Speed::WORST_CASE_BANDWIDTH);

        Some(SignalObservation {
            origin,
            offset_hz,
            bandwidth_hz,
            snr: record.snr(),
            heard_at,
        })
    }

    /// Records the signal carried by `record`, if any
    pub fn record_from(&self, record: &Record, heard_at: SystemTime) -> bool {
        match SpotLog::observation_from(record, heard_at) {
            Some(observation) => self.record(observation),
            None => false,
        }
    }

    /// Observations no older than `max_age`
    pub fn recent(&self, now: SystemTime, max_age: Duration) -> Vec<SignalObservation> {
        self.lock()
            .iter()
            .filter(|s| is_fresh(s, now, max_age))
            .cloned()
            .collect()
    }

    /// Drops observations older than `max_age`, returning how many were dropped
    pub fn prune(&self, now: SystemTime, max_age: Duration) -> usize {
        let mut spots = self.lock();
        let before = spots.len();
        spots.retain(|s| is_fresh(s, now, max_age));
        before - spots.len()
    }

    /// Number of held observations
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

fn is_fresh(spot: &SignalObservation, now: SystemTime, max_age: Duration) -> bool {
    now.duration_since(spot.heard_at).map_or(true, |age| age <= max_age)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn spot(from: &str, offset: i64, snr: i64) -> Record {
        Record::new(RecordType::RxSpot, "")
            .with_param("FROM", from)
            .with_param("OFFSET", offset)
            .with_param("SNR", snr)
    }

    #[test]
    fn test_duplicates_are_merged() {
        let log = SpotLog::new();
        assert!(log.record_from(&spot("kc3kvt", 1500, -12), at(100)));
        assert!(!log.record_from(&spot("KC3KVT", 1500, -12), at(110)));
        assert!(log.record_from(&spot("KC3KVT", 1500, -8), at(120)));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_repeated_report_stays_recent() {
        let log = SpotLog::new();
        log.record_from(&spot("W1AW", 1510, -10), at(0));
        log.record_from(&spot("W1AW", 1510, -10), at(180));

        let recent = log.recent(at(200), Duration::from_secs(180));
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].heard_at, at(180));

        // a late, out-of-order report never moves the time back
        log.record_from(&spot("W1AW", 1510, -10), at(50));
        assert_eq!(log.recent(at(200), Duration::from_secs(180))[0].heard_at, at(180));
    }

    #[test]
    fn test_record_drops_expired_spots() {
        let log = SpotLog::with_retention(Duration::from_secs(60));
        log.record_from(&spot("A1A", 1100, 0), at(0));
        log.record_from(&spot("B2B", 1300, 0), at(30));
        assert_eq!(log.len(), 2);

        log.record_from(&spot("C3C", 1700, 0), at(80));
        assert_eq!(log.len(), 2);
        let origins: Vec<String> = log.recent(at(80), log.retention()).into_iter().map(|s| s.origin).collect();
        assert_eq!(origins, vec!["B2B", "C3C"]);
    }

    #[test]
    fn test_size_is_capped() {
        let log = SpotLog::new();
        for i in 0..MAX_SPOTS + 10 {
            log.record_from(&spot(&format!("N{}", i), 1000, 0), at(100));
        }
        assert_eq!(log.len(), MAX_SPOTS);
        let oldest = &log.recent(at(100), log.retention())[0];
        assert_eq!(oldest.origin, "N10");
    }

    #[test]
    fn test_unknown_speed_uses_worst_case_bandwidth() {
        let observation = SpotLog::observation_from(&spot("N0CALL", 1200, 0), at(0)).unwrap();
        assert_eq!(observation.bandwidth_hz, Speed::WORST_CASE_BANDWIDTH);

        let slow = spot("N0CALL", 1200, 0).with_param("SPEED", 4);
        let observation = SpotLog::observation_from(&slow, at(0)).unwrap();
        assert_eq!(observation.bandwidth_hz, 25.0);
    }

    #[test]
    fn test_irrelevant_records_are_skipped() {
        let log = SpotLog::new();
        let freq = Record::new(RecordType::RigFreq, "").with_param("OFFSET", 1500);
        assert!(!log.record_from(&freq, at(0)));

        let no_origin = Record::new(RecordType::RxActivity, "").with_param("OFFSET", 1500);
        assert!(!log.record_from(&no_origin, at(0)));
        assert!(log.is_empty());
    }

    #[test]
    fn test_recent_and_prune() {
        let log = SpotLog::new();
        log.record_from(&spot("A1A", 1100, 0), at(0));
        log.record_from(&spot("B2B", 1300, 0), at(100));

        let max_age = Duration::from_secs(180);
        assert_eq!(log.recent(at(150), max_age).len(), 2);
        assert_eq!(log.recent(at(200), max_age).len(), 1);

        assert_eq!(log.prune(at(200), max_age), 1);
        assert_eq!(log.len(), 1);
    }
}
