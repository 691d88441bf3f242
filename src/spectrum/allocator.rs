use rand::Rng;
use std::cmp::Ordering;
use std::time::SystemTime;

use crate::core::SpectrumConfig;

/// A recently heard signal
#[derive(Debug, Clone, PartialEq)]
pub struct SignalObservation {
    /// Callsign of the station heard
    pub origin: String,
    /// Offset frequency in Hz
    pub offset_hz: f64,
    /// Signal bandwidth in Hz
    pub bandwidth_hz: f64,
    /// Signal-to-noise ratio, when reported
    pub snr: Option<f64>,
    /// When the signal was heard
    pub heard_at: SystemTime,
}

impl SignalObservation {
    /// The occupied part of the pass band
    pub fn signal(&self) -> Signal {
        Signal::new(self.offset_hz, self.bandwidth_hz)
    }
}

/// A signal's position in the pass band, centred on its offset
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Signal {
    /// Offset frequency in Hz
    pub offset_hz: f64,
    /// Bandwidth in Hz
    pub bandwidth_hz: f64,
}

impl Signal {
    /// Creates a signal
    pub fn new(offset_hz: f64, bandwidth_hz: f64) -> Self {
        Signal { offset_hz, bandwidth_hz }
    }

    /// Lower occupied edge
    pub fn low(&self) -> f64 {
        self.offset_hz - self.bandwidth_hz / 2.0
    }

    /// Upper occupied edge
    pub fn high(&self) -> f64 {
        self.offset_hz + self.bandwidth_hz / 2.0
    }

    /// Whether the occupied intervals share more than an edge
    pub fn overlaps(&self, other: &Signal) -> bool {
        self.low() < other.high() && other.low() < self.high()
    }
}

/// An unoccupied section of the pass band
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gap {
    /// Lower edge in Hz
    pub low: f64,
    /// Upper edge in Hz
    pub high: f64,
}

impl Gap {
    /// Width in Hz
    pub fn width(&self) -> f64 {
        self.high - self.low
    }

    /// Distance from an offset to the nearer edge, zero when inside
    pub fn edge_distance(&self, offset: f64) -> f64 {
        if offset < self.low {
            self.low - offset
        } else if offset > self.high {
            offset - self.high
        } else {
            0.0
        }
    }
}

/// Outcome of one allocation pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// The current offset is clear
    Keep,
    /// Move into the nearest free gap
    Move {
        /// New offset in Hz
        offset: f64,
        /// Gap the offset was placed in
        gap: Gap,
    },
    /// No gap is wide enough; random offset inside the usable range
    Fallback {
        /// New offset in Hz
        offset: f64,
    },
}

impl Decision {
    /// New offset, if the decision moves the signal
    pub fn new_offset(&self) -> Option<f64> {
        match self {
            Decision::Keep => None,
            Decision::Move { offset, .. } | Decision::Fallback { offset } => Some(*offset),
        }
    }
}

/// Decides whether the local signal collides with heard signals and where to move it
#[derive(Debug, Clone)]
pub struct SpectrumAllocator {
    config: SpectrumConfig,
}

impl SpectrumAllocator {
    /// Creates an allocator for the configured offset range
    pub fn new(config: SpectrumConfig) -> Self {
        SpectrumAllocator { config }
    }

    /// Allocation settings
    pub fn config(&self) -> &SpectrumConfig {
        &self.config
    }

    /// Observations young enough to count as occupancy, sorted by lower edge
    pub fn recent(&self, observations: &[SignalObservation], now: SystemTime) -> Vec<Signal> {
        let mut signals: Vec<Signal> = observations
            .iter()
            .filter(|obs| {
                now.duration_since(obs.heard_at)
                    .map_or(true, |age| age <= self.config.max_age)
            })
            .map(SignalObservation::signal)
            .collect();
        signals.sort_by(|a, b| a.low().total_cmp(&b.low()));
        signals
    }

    /// Whether any signal overlaps our own
    pub fn overlapping(&self, own: &Signal, signals: &[Signal]) -> bool {
        signals.iter().any(|signal| own.overlaps(signal))
    }

    /// Free gaps inside the usable range wide enough for `bandwidth`
    ///
    /// `signals` must be sorted by lower edge.
    pub fn free_gaps(&self, bandwidth: f64, signals: &[Signal]) -> Vec<Gap> {
        let range = self.config.range;
        let required = bandwidth * self.config.safety_factor;

        let mut gaps = Vec::new();
        let mut cursor = range.min;
        for signal in signals {
            if signal.high() <= range.min || signal.low() >= range.max {
                continue;
            }
            if signal.low() > cursor {
                gaps.push(Gap { low: cursor, high: signal.low() });
            }
            cursor = cursor.max(signal.high());
        }
        if range.max > cursor {
            gaps.push(Gap { low: cursor, high: range.max });
        }

        gaps.retain(|gap| gap.width() >= required);
        gaps
    }

    /// Picks the gap nearest to `offset` and the offset to use inside it
    ///
    /// Equal distances prefer moving down in frequency.
    pub fn choose(&self, offset: f64, bandwidth: f64, gaps: &[Gap]) -> Option<(Gap, f64)> {
        let half = bandwidth * self.config.safety_factor / 2.0;

        gaps.iter()
            .map(|gap| {
                let (low, high) = (gap.low + half, gap.high - half);
                let placed = if low < high { offset.clamp(low, high) } else { (gap.low + gap.high) / 2.0 };
                (*gap, placed)
            })
            .min_by(|(a, a_offset), (b, b_offset)| {
                a.edge_distance(offset)
                    .total_cmp(&b.edge_distance(offset))
                    .then_with(|| match (*a_offset <= offset, *b_offset <= offset) {
                        (true, false) => Ordering::Less,
                        (false, true) => Ordering::Greater,
                        _ => a.low.total_cmp(&b.low),
                    })
            })
    }

    /// Uniformly random offset keeping the signal inside the usable range
    pub fn random_offset<R: Rng + ?Sized>(&self, bandwidth: f64, rng: &mut R) -> f64 {
        let range = self.config.range;
        let low = range.min + bandwidth / 2.0;
        let high = range.max - bandwidth / 2.0;
        if low >= high {
            return ((range.min + range.max) / 2.0).round();
        }
        rng.gen_range(low..=high).round()
    }

    /// Runs one allocation pass for our signal
    ///
    /// An offset inside the usable range is only moved when a heard signal
    /// overlaps it. An offset outside the range is always relocated, falling
    /// back to a random pick when nothing has been heard in the range.
    pub fn decide<R: Rng + ?Sized>(
        &self,
        own: Signal,
        observations: &[SignalObservation],
        now: SystemTime,
        rng: &mut R,
    ) -> Decision {
        let signals = self.recent(observations, now);
        let range = self.config.range;

        if range.contains(own.offset_hz) {
            if !self.overlapping(&own, &signals) {
                return Decision::Keep;
            }
        } else {
            let heard_in_range = signals
                .iter()
                .any(|s| s.high() > range.min && s.low() < range.max);
            if !heard_in_range {
                return Decision::Fallback { offset: self.random_offset(own.bandwidth_hz, rng) };
            }
        }

        let gaps = self.free_gaps(own.bandwidth_hz, &signals);
        match self.choose(own.offset_hz, own.bandwidth_hz, &gaps) {
            Some((gap, offset)) => Decision::Move { offset, gap },
            None => Decision::Fallback { offset: self.random_offset(own.bandwidth_hz, rng) },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::OffsetRange;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::time::{Duration, UNIX_EPOCH};

    fn now() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(10_000)
    }

    fn heard(offset: f64, bandwidth: f64) -> SignalObservation {
        SignalObservation {
            origin: format!("K{}", offset as u32),
            offset_hz: offset,
            bandwidth_hz: bandwidth,
            snr: Some(-10.0),
            heard_at: now() - Duration::from_secs(30),
        }
    }

    fn allocator(min: f64, max: f64) -> SpectrumAllocator {
        SpectrumAllocator::new(SpectrumConfig {
            range: OffsetRange::new(min, max),
            ..SpectrumConfig::default()
        })
    }

    #[test]
    fn test_overlap_detection() {
        let own = Signal::new(1500.0, 50.0);
        assert!(own.overlaps(&Signal::new(1510.0, 50.0)));
        assert!(!own.overlaps(&Signal::new(1600.0, 50.0)));
        // touching edges share no spectrum
        assert!(!own.overlaps(&Signal::new(1550.0, 50.0)));
    }

    #[test]
    fn test_no_observations_keeps_offset() {
        let alloc = allocator(1000.0, 2500.0);
        let mut rng = StdRng::seed_from_u64(1);
        let decision = alloc.decide(Signal::new(1500.0, 50.0), &[], now(), &mut rng);
        assert_eq!(decision, Decision::Keep);
    }

    #[test]
    fn test_stale_observations_ignored() {
        let alloc = allocator(1000.0, 2500.0);
        let mut rng = StdRng::seed_from_u64(1);
        let mut old = heard(1510.0, 50.0);
        old.heard_at = now() - Duration::from_secs(181);

        let decision = alloc.decide(Signal::new(1500.0, 50.0), &[old], now(), &mut rng);
        assert_eq!(decision, Decision::Keep);
    }

    #[test]
    fn test_moves_to_nearest_gap() {
        let alloc = allocator(1000.0, 2500.0);
        let mut rng = StdRng::seed_from_u64(1);
        let observations = vec![
            heard(1510.0, 50.0),
            heard(1300.0, 400.0),
        ];

        // free spectrum above 1535 is the closest edge
        let decision = alloc.decide(Signal::new(1500.0, 50.0), &observations, now(), &mut rng);
        match decision {
            Decision::Move { offset, gap } => {
                assert_eq!(gap.low, 1535.0);
                assert_eq!(offset, 1535.0 + 31.25);
            }
            other => panic!("expected move, got {:?}", other),
        }
    }

    #[test]
    fn test_tie_prefers_lower_frequency() {
        let alloc = allocator(1300.0, 1700.0);
        let mut rng = StdRng::seed_from_u64(1);
        let observations = vec![
            heard(1350.0, 100.0),
            heard(1500.0, 60.0),
            heard(1650.0, 100.0),
        ];

        let decision = alloc.decide(Signal::new(1500.0, 50.0), &observations, now(), &mut rng);
        match decision {
            Decision::Move { offset, gap } => {
                assert_eq!(gap, Gap { low: 1400.0, high: 1470.0 });
                assert_eq!(offset, 1470.0 - 31.25);
            }
            other => panic!("expected move, got {:?}", other),
        }
    }

    #[test]
    fn test_exact_width_gap_has_margins() {
        let alloc = allocator(1000.0, 2500.0);
        let mut rng = StdRng::seed_from_u64(1);
        // occupied [1000, 1600] and [1662.5, 2500]
        let observations = vec![
            heard(1300.0, 600.0),
            heard(2081.25, 837.5),
        ];

        let decision = alloc.decide(Signal::new(1500.0, 50.0), &observations, now(), &mut rng);
        let Decision::Move { offset, gap } = decision else {
            panic!("expected move, got {:?}", decision);
        };
        assert_eq!(gap.width(), 62.5);

        let placed = Signal::new(offset, 50.0);
        assert!(placed.low() > gap.low);
        assert!(placed.high() < gap.high);
    }

    #[test]
    fn test_overlapping_observations_merge() {
        let alloc = allocator(1000.0, 2500.0);
        let signals = alloc.recent(&[heard(1000.0, 20.0), heard(1005.0, 200.0)], now());
        let gaps = alloc.free_gaps(50.0, &signals);
        // the wide signal covers everything up to 1105
        assert_eq!(gaps, vec![Gap { low: 1105.0, high: 2500.0 }]);
    }

    #[test]
    fn test_full_band_falls_back_to_random() {
        let alloc = allocator(1000.0, 1200.0);
        let mut rng = StdRng::seed_from_u64(3);
        let observations = vec![heard(1050.0, 100.0), heard(1150.0, 100.0)];

        for _ in 0..50 {
            let decision = alloc.decide(Signal::new(1100.0, 50.0), &observations, now(), &mut rng);
            let Decision::Fallback { offset } = decision else {
                panic!("expected fallback, got {:?}", decision);
            };
            assert!((1025.0..=1175.0).contains(&offset));
        }
    }

    #[test]
    fn test_out_of_range_offset_relocates() {
        let alloc = allocator(500.0, 1000.0);
        let mut rng = StdRng::seed_from_u64(5);

        // nothing heard in the band: random pick
        let decision = alloc.decide(Signal::new(1500.0, 50.0), &[heard(1500.0, 50.0)], now(), &mut rng);
        let Decision::Fallback { offset } = decision else {
            panic!("expected fallback, got {:?}", decision);
        };
        assert!((525.0..=975.0).contains(&offset));

        // activity in the band: nearest gap to the current offset
        let decision = alloc.decide(Signal::new(1500.0, 50.0), &[heard(600.0, 50.0)], now(), &mut rng);
        match decision {
            Decision::Move { offset, gap } => {
                assert_eq!(gap, Gap { low: 625.0, high: 1000.0 });
                assert_eq!(offset, 1000.0 - 31.25);
            }
            other => panic!("expected move, got {:?}", other),
        }
    }
}
