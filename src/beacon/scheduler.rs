use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, trace, warn};

use crate::core::{BeaconConfig, Error, Result, Speed, BEACON_DESTINATION};
use crate::outgoing::{MessageStatus, OutgoingMessageTracker};
use crate::protocol::ModemHandle;
use crate::spectrum::{AllocatorGate, OffsetHolder, OffsetMonitor};
use crate::time::WindowClock;
use super::activity::{within, ActivityLog};

/// Scheduler state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconState {
    /// Not sending beacons
    Disabled,
    /// Sending beacons when due
    Enabled,
    /// Temporarily holding beacons back
    Paused,
}

/// Why a window boundary did not produce a beacon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Scheduler disabled
    Disabled,
    /// Scheduler paused
    Paused,
    /// Speed too fast for beacons
    SpeedTooFast,
    /// No window boundary known yet
    WindowUnknown,
    /// Two-way exchange in progress
    InExchange,
    /// Local traffic went out within the interval
    RecentActivity,
    /// Interval not elapsed since the last beacon or frequency change
    IntervalNotElapsed,
}

/// Everything the skip decision looks at
#[derive(Debug, Clone)]
pub struct BeaconContext {
    /// Scheduler state
    pub state: BeaconState,
    /// Current modem speed
    pub speed: Speed,
    /// Current window duration, `None` while window timing is unknown
    pub window: Option<Duration>,
    /// Decision time
    pub now: SystemTime,
    /// Last local outgoing traffic
    pub last_outgoing: Option<SystemTime>,
    /// Last directed message to or from the local station
    pub last_exchange: Option<SystemTime>,
    /// Latest of the last beacon, the last dial change and the last enable
    pub last_reference: Option<SystemTime>,
}

/// Decides whether a window boundary should be skipped
pub fn should_skip(ctx: &BeaconContext, config: &BeaconConfig) -> Option<SkipReason> {
    match ctx.state {
        BeaconState::Disabled => return Some(SkipReason::Disabled),
        BeaconState::Paused => return Some(SkipReason::Paused),
        BeaconState::Enabled => {}
    }
    if !ctx.speed.allows_beacons() {
        return Some(SkipReason::SpeedTooFast);
    }
    let Some(window) = ctx.window else {
        return Some(SkipReason::WindowUnknown);
    };

    if config.defer_during_exchange
        && within(ctx.last_exchange, ctx.now, window * config.exchange_windows)
    {
        return Some(SkipReason::InExchange);
    }
    if within(ctx.last_outgoing, ctx.now, config.interval) {
        return Some(SkipReason::RecentActivity);
    }
    if within(ctx.last_reference, ctx.now, config.interval) {
        return Some(SkipReason::IntervalNotElapsed);
    }
    None
}

#[derive(Debug)]
struct SchedulerState {
    state: BeaconState,
    enabled_at: Option<SystemTime>,
    last_beacon: Option<SystemTime>,
    last_dial_change: Option<SystemTime>,
}

/// Sends periodic beacons from the reserved sub-band
///
/// A beacon borrows the offset frequency: the primary allocator is paused,
/// the beacon allocator places the offset in the reserved band, the beacon
/// goes out, and the previous offset is restored.
pub struct BeaconScheduler {
    config: BeaconConfig,
    modem: ModemHandle,
    windows: Arc<WindowClock>,
    tracker: Arc<OutgoingMessageTracker>,
    primary: AllocatorGate,
    monitor: Arc<OffsetMonitor>,
    activity: Arc<ActivityLog>,
    inner: Mutex<SchedulerState>,
}

impl BeaconScheduler {
    /// Creates a disabled scheduler
    ///
    /// `monitor` must be the beacon-band monitor and `primary` the gate of
    /// the primary allocator sharing the same arbiter.
    pub fn new(
        config: BeaconConfig,
        modem: ModemHandle,
        windows: Arc<WindowClock>,
        tracker: Arc<OutgoingMessageTracker>,
        primary: AllocatorGate,
        monitor: Arc<OffsetMonitor>,
        activity: Arc<ActivityLog>,
    ) -> Self {
        BeaconScheduler {
            config,
            modem,
            windows,
            tracker,
            primary,
            monitor,
            activity,
            inner: Mutex::new(SchedulerState {
                state: BeaconState::Disabled,
                enabled_at: None,
                last_beacon: None,
                last_dial_change: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn now(&self) -> SystemTime {
        self.windows.clock().now()
    }

    /// Current state
    pub fn state(&self) -> BeaconState {
        self.lock().state
    }

    /// Starts sending beacons, the first one an interval from now
    pub fn enable(&self) {
        let now = self.now();
        let mut inner = self.lock();
        if inner.state == BeaconState::Disabled {
            inner.state = BeaconState::Enabled;
            inner.enabled_at = Some(now);
            info!(interval = ?self.config.interval, "beacons enabled");
        }
    }

    /// Stops sending beacons
    pub fn disable(&self) {
        let mut inner = self.lock();
        if inner.state != BeaconState::Disabled {
            inner.state = BeaconState::Disabled;
            info!("beacons disabled");
        }
    }

    /// Holds beacons back until resumed
    pub fn pause(&self) {
        let mut inner = self.lock();
        if inner.state == BeaconState::Enabled {
            inner.state = BeaconState::Paused;
            debug!("beacons paused");
        }
    }

    /// Lifts a pause, restarting the interval
    pub fn resume(&self) {
        let now = self.now();
        let mut inner = self.lock();
        if inner.state == BeaconState::Paused {
            inner.state = BeaconState::Enabled;
            inner.enabled_at = Some(now);
            debug!("beacons resumed");
        }
    }

    /// Records a dial frequency change, restarting the interval
    pub fn note_frequency_change(&self, at: SystemTime) {
        let mut inner = self.lock();
        inner.last_dial_change = inner.last_dial_change.max(Some(at));
    }

    /// When the last beacon cycle finished
    pub fn last_beacon(&self) -> Option<SystemTime> {
        self.lock().last_beacon
    }

    /// Snapshot of the inputs to the skip decision
    pub fn context(&self) -> BeaconContext {
        let now = self.now();
        let window = self.windows.window().map(|w| w.duration);
        let inner = self.lock();
        BeaconContext {
            state: inner.state,
            speed: self.modem.speed_or(self.windows.speed()),
            window,
            now,
            last_outgoing: self.activity.last_outgoing(),
            last_exchange: self.activity.last_exchange(),
            last_reference: inner.enabled_at.max(inner.last_beacon).max(inner.last_dial_change),
        }
    }

    /// Runs one beacon cycle
    ///
    /// The previous offset and the primary allocator are restored whatever
    /// happens to the beacon itself.
    pub async fn cycle(&self, mut shutdown: watch::Receiver<bool>) -> Result<MessageStatus> {
        let beacon_gate = self.monitor.gate();
        let arbiter = beacon_gate.arbiter();

        self.primary.pause().await;
        let last_offset = self.modem.state().offset();
        arbiter.hand_to(OffsetHolder::Beacon).await;
        beacon_gate.resume().await;

        let result = self.transmit(&mut shutdown).await;

        beacon_gate.pause().await;
        {
            let mut lease = arbiter.lease().await;
            lease.hand_to(OffsetHolder::Primary);
            if let Some(offset) = last_offset {
                if let Err(e) = self.modem.set_offset(offset).await {
                    warn!("Failed to restore offset {}: {}", offset, e);
                }
            }
        }
        self.primary.resume().await;

        self.lock().last_beacon = Some(self.now());
        result
    }

    async fn transmit(&self, shutdown: &mut watch::Receiver<bool>) -> Result<MessageStatus> {
        self.monitor.relocate().await?;

        tokio::select! {
            _ = self.windows.sleep_until(self.config.lead_time) => {}
            _ = shutdown.changed() => return Err(Error::closed("beacon cancelled by shutdown")),
        }

        let body = match self.modem.state().grid() {
            Some(grid) => format!("HEARTBEAT {}", grid),
            None => "HEARTBEAT".to_string(),
        };
        let mut handle = self.tracker.enqueue(BEACON_DESTINATION, &body).await?;

        let max_age = self.tracker.max_age();
        tokio::select! {
            status = handle.wait_terminal(max_age) => status,
            _ = shutdown.changed() => Err(Error::closed("beacon cancelled by shutdown")),
        }
    }

    /// Beacon task, driven by window boundaries
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut boundaries = self.windows.subscribe();

        loop {
            let boundary = tokio::select! {
                boundary = boundaries.recv() => boundary,
                _ = shutdown.changed() => break,
            };
            match boundary {
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "beacon scheduler fell behind window boundaries");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
            if *shutdown.borrow() {
                break;
            }

            if let Some(reason) = should_skip(&self.context(), &self.config) {
                trace!(?reason, "beacon skipped");
                continue;
            }

            info!("sending beacon");
            match self.cycle(shutdown.clone()).await {
                Ok(status) => info!(%status, "beacon finished"),
                Err(e) => warn!("Beacon failed: {}", e),
            }
            // boundaries that passed during the cycle are stale
            boundaries = boundaries.resubscribe();
        }
        debug!("beacon scheduler stopped");
    }
}
