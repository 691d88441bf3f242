use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::core::Result;
use crate::protocol::ModemHandle;
use crate::time::WindowClock;
use super::allocator::{Decision, Signal, SpectrumAllocator};
use super::gate::AllocatorGate;
use super::spots::SpotLog;

/// Poll interval while no window boundary is known
const UNANCHORED_POLL: Duration = Duration::from_secs(1);

/// Drives one allocator once per transmit window
///
/// Shortly before each predicted boundary the monitor checks whether our
/// signal collides with anything heard recently and, if so, moves the offset
/// through its gate.
pub struct OffsetMonitor {
    allocator: SpectrumAllocator,
    gate: AllocatorGate,
    modem: ModemHandle,
    spots: Arc<SpotLog>,
    windows: Arc<WindowClock>,
    enabled: AtomicBool,
    rng: Mutex<StdRng>,
}

impl OffsetMonitor {
    /// Creates an enabled monitor
    pub fn new(
        allocator: SpectrumAllocator,
        gate: AllocatorGate,
        modem: ModemHandle,
        spots: Arc<SpotLog>,
        windows: Arc<WindowClock>,
    ) -> Self {
        OffsetMonitor {
            allocator,
            gate,
            modem,
            spots,
            windows,
            enabled: AtomicBool::new(true),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Replaces the random source used for fallback picks
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = Mutex::new(rng);
        self
    }

    /// The pause gate controlling this monitor
    pub fn gate(&self) -> &AllocatorGate {
        &self.gate
    }

    /// Allocation rules
    pub fn allocator(&self) -> &SpectrumAllocator {
        &self.allocator
    }

    /// Resumes per-window evaluation
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Stops per-window evaluation
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    /// Whether per-window evaluation runs
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Runs one allocation pass
    ///
    /// Nothing moves while the gate is inactive, while text is waiting to be
    /// transmitted, or before the modem has reported an offset.
    pub async fn evaluate(&self) -> Result<Decision> {
        self.allocate(true).await
    }

    /// Runs one allocation pass even if text is waiting to be transmitted
    ///
    /// Used when the offset must be placed inside the allocator's range
    /// before a transmission of our own.
    pub async fn relocate(&self) -> Result<Decision> {
        self.allocate(false).await
    }

    async fn allocate(&self, defer_to_tx_text: bool) -> Result<Decision> {
        if !self.gate.is_active().await {
            return Ok(Decision::Keep);
        }

        let state = self.modem.state();
        if defer_to_tx_text && state.tx_text().map_or(false, |text| !text.trim().is_empty()) {
            debug!(allocator = %self.gate.role(), "transmit text pending, offset left alone");
            return Ok(Decision::Keep);
        }

        let Some(offset) = state.offset() else {
            debug!(allocator = %self.gate.role(), "offset unknown");
            return Ok(Decision::Keep);
        };

        let speed = self.modem.speed_or(self.windows.speed());
        let own = Signal::new(offset, speed.bandwidth());
        let now = self.windows.clock().now();
        let observations = self.spots.recent(now, self.allocator.config().max_age);

        let decision = {
            let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            self.allocator.decide(own, &observations, now, &mut *rng)
        };

        let Some(new_offset) = decision.new_offset() else {
            return Ok(Decision::Keep);
        };

        // the gate may have closed while deciding; the lease settles it
        let Some(_lease) = self.gate.try_commit().await else {
            debug!(allocator = %self.gate.role(), "gate closed before commit");
            return Ok(Decision::Keep);
        };
        self.modem.set_offset(new_offset).await?;

        info!(
            allocator = %self.gate.role(),
            from = offset,
            to = new_offset,
            heard = observations.len(),
            "offset moved"
        );
        Ok(decision)
    }

    /// Per-window evaluation task
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let before = self.allocator.config().before_boundary;
        let clock = *self.windows.clock();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let Some(next) = self.windows.next_boundary(0) else {
                tokio::select! {
                    _ = tokio::time::sleep(UNANCHORED_POLL) => {}
                    _ = shutdown.changed() => break,
                }
                continue;
            };

            let target = next.checked_sub(before).unwrap_or(next);
            tokio::select! {
                _ = clock.sleep_until(target) => {}
                _ = shutdown.changed() => break,
            }

            if self.is_enabled() {
                if let Err(e) = self.evaluate().await {
                    warn!(allocator = %self.gate.role(), "Offset change failed: {}", e);
                }
            }

            // let the boundary pass so one window gets one evaluation
            tokio::select! {
                _ = clock.sleep_until(next) => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!(allocator = %self.gate.role(), "offset monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Clock, SpectrumConfig, Speed};
    use crate::protocol::{Record, RecordType, StateKey, StateStore, StateValue};
    use crate::spectrum::OffsetArbiter;
    use std::time::{SystemTime, UNIX_EPOCH};
    use tokio::sync::mpsc;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    struct Fixture {
        monitor: Arc<OffsetMonitor>,
        records: mpsc::Receiver<Record>,
        state: Arc<StateStore>,
        spots: Arc<SpotLog>,
        windows: Arc<WindowClock>,
    }

    fn fixture() -> Fixture {
        let (tx, records) = mpsc::channel(16);
        let state = Arc::new(StateStore::new());
        let modem = ModemHandle::new(tx, Arc::clone(&state));
        let spots = Arc::new(SpotLog::new());
        let windows = Arc::new(WindowClock::new(Clock::starting_at(at(1_000)), Speed::Normal));
        let (_arbiter, primary, _beacon) = OffsetArbiter::new();

        let monitor = OffsetMonitor::new(
            SpectrumAllocator::new(SpectrumConfig::default()),
            primary,
            modem,
            Arc::clone(&spots),
            Arc::clone(&windows),
        )
        .with_rng(StdRng::seed_from_u64(7));

        state.set(StateKey::Offset, StateValue::Number(1500.0));
        Fixture { monitor: Arc::new(monitor), records, state, spots, windows }
    }

    fn hear(spots: &SpotLog, offset: i64, heard_at: SystemTime) {
        let spot = Record::new(RecordType::RxSpot, "")
            .with_param("FROM", "W1AW")
            .with_param("OFFSET", offset)
            .with_param("SPEED", 0);
        spots.record_from(&spot, heard_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_moves_off_collision() {
        let mut f = fixture();
        hear(&f.spots, 1510, at(990));

        let decision = f.monitor.evaluate().await.unwrap();
        let new_offset = decision.new_offset().unwrap();
        assert!((new_offset - 1510.0).abs() >= 50.0);

        let record = f.records.recv().await.unwrap();
        assert_eq!(record.record_type(), Some(RecordType::RigSetFreq));
        assert_eq!(f.state.offset(), Some(new_offset.round()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_offset_is_kept() {
        let mut f = fixture();
        hear(&f.spots, 2000, at(990));

        assert_eq!(f.monitor.evaluate().await.unwrap(), Decision::Keep);
        assert!(f.records.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_text_defers_evaluation() {
        let mut f = fixture();
        hear(&f.spots, 1510, at(990));
        f.state.set(StateKey::TxText, StateValue::Text("W1AW HELLO".into()));

        assert_eq!(f.monitor.evaluate().await.unwrap(), Decision::Keep);
        assert!(f.records.try_recv().is_err());

        assert!(f.monitor.relocate().await.unwrap().new_offset().is_some());
        assert!(f.records.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_gate_never_commits() {
        let mut f = fixture();
        hear(&f.spots, 1510, at(990));
        f.monitor.gate().pause().await;

        assert_eq!(f.monitor.evaluate().await.unwrap(), Decision::Keep);
        assert!(f.records.try_recv().is_err());
        assert_eq!(f.state.offset(), Some(1500.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_evaluates_before_boundary() {
        let mut f = fixture();
        f.windows.observe_frame(at(1_000));
        hear(&f.spots, 1510, at(1_000));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = {
            let monitor = Arc::clone(&f.monitor);
            tokio::spawn(async move { monitor.run(shutdown_rx).await })
        };

        // boundary at 1015, evaluation half a second earlier
        tokio::time::sleep(Duration::from_millis(14_400)).await;
        assert!(f.records.try_recv().is_err());
        tokio::time::sleep(Duration::from_millis(200)).await;
        let record = f.records.try_recv().unwrap();
        assert_eq!(record.record_type(), Some(RecordType::RigSetFreq));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
