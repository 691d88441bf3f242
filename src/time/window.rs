use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, trace};

use crate::core::{Clock, Speed};
use super::util::fmt_time;

/// A window boundary published by the boundary watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowBoundary {
    /// When the window started
    pub at: SystemTime,
    /// Duration of the window that started
    pub duration: Duration,
}

/// Predicted transmit window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmitWindow {
    /// Next window start
    pub predicted_start: SystemTime,
    /// Window duration
    pub duration: Duration,
}

#[derive(Debug)]
struct WindowState {
    /// Timestamp of the last observed transmit frame
    anchor: Option<SystemTime>,
    /// Next predicted boundary, present once anchored
    predicted_start: Option<SystemTime>,
    /// Timestamp of the last receive that re-anchored the prediction
    last_receive: Option<SystemTime>,
    /// Duration used for the current prediction
    duration: Duration,
    /// Most recent speed setting, applied on the next recomputation
    speed: Speed,
}

impl WindowState {
    /// Steps the prediction forward past `now`, picking up speed changes
    fn advance(&mut self, now: SystemTime) -> bool {
        let Some(mut start) = self.predicted_start else {
            return false;
        };
        if start > now {
            return false;
        }

        self.duration = self.speed.window_duration();
        while start <= now {
            start += self.duration;
        }
        self.predicted_start = Some(start);
        true
    }

    /// Re-anchors on `start`, the first boundary at or after it that follows `now`
    fn anchor_at(&mut self, mut start: SystemTime, now: SystemTime) {
        self.duration = self.speed.window_duration();
        let duration = self.duration;
        // a timestamp ahead of local time steps back to the first boundary after now
        while start > now && start.checked_sub(duration).map_or(false, |prev| prev > now) {
            start -= duration;
        }
        self.predicted_start = Some(start);
        self.advance(now);
    }
}

/// Received messages are reported this long before their window ends
const RECEIVE_LEAD: Duration = Duration::from_secs(1);

/// Predicts transmit window boundaries from observed transmit frames and receives
///
/// The modem only reports a transmit frame after it has been sent, so the
/// frame timestamp is the one hard fact about window alignment. Every
/// prediction is that timestamp plus a whole number of window durations.
pub struct WindowClock {
    clock: Clock,
    state: Mutex<WindowState>,
    boundary_tx: broadcast::Sender<WindowBoundary>,
    reanchored: Notify,
}

impl WindowClock {
    /// Creates a window clock with no anchor
    pub fn new(clock: Clock, speed: Speed) -> Self {
        let (boundary_tx, _) = broadcast::channel(16);
        WindowClock {
            clock,
            state: Mutex::new(WindowState {
                anchor: None,
                predicted_start: None,
                last_receive: None,
                duration: speed.window_duration(),
                speed,
            }),
            boundary_tx,
            reanchored: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WindowState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The clock used for predictions
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Records a completed transmit frame at `timestamp`
    pub fn observe_frame(&self, timestamp: SystemTime) {
        self.observe_frame_at(timestamp, self.clock.now());
        self.reanchored.notify_waiters();
    }

    pub(crate) fn observe_frame_at(&self, timestamp: SystemTime, now: SystemTime) {
        let mut state = self.lock();
        state.anchor = Some(timestamp);
        state.anchor_at(timestamp, now);

        debug!(
            frame = %fmt_time(timestamp),
            next = %state.predicted_start.map(fmt_time).unwrap_or_default(),
            "window re-anchored"
        );
    }

    /// Records a received message stamped `timestamp`
    ///
    /// The modem decodes a window about a second before it ends, so the
    /// first receive of each window cycle anchors the next boundary, even
    /// before we have transmitted. Returns whether the prediction moved.
    pub fn observe_receive(&self, timestamp: SystemTime) -> bool {
        let reanchored = self.observe_receive_at(timestamp, self.clock.now());
        if reanchored {
            self.reanchored.notify_waiters();
        }
        reanchored
    }

    pub(crate) fn observe_receive_at(&self, timestamp: SystemTime, now: SystemTime) -> bool {
        let mut state = self.lock();
        let half_window = state.speed.window_duration() / 2;
        if let Some(last) = state.last_receive {
            // later receives of the same cycle carry no new timing
            if timestamp.duration_since(last).map_or(true, |since| since <= half_window) {
                return false;
            }
        }

        state.last_receive = Some(timestamp);
        state.anchor_at(timestamp + RECEIVE_LEAD, now);

        debug!(
            received = %fmt_time(timestamp),
            next = %state.predicted_start.map(fmt_time).unwrap_or_default(),
            "window re-anchored from receive"
        );
        true
    }

    /// Records a speed change; it takes effect on the next recomputation
    pub fn set_speed(&self, speed: Speed) {
        let mut state = self.lock();
        if state.speed != speed {
            debug!(from = %state.speed, to = %speed, "window speed changed");
            state.speed = speed;
        }
    }

    /// Current speed setting
    pub fn speed(&self) -> Speed {
        self.lock().speed
    }

    /// Duration of the current window prediction
    pub fn window_duration(&self) -> Duration {
        self.lock().duration
    }

    /// Whether window timing is known from a transmit frame or a receive
    pub fn is_anchored(&self) -> bool {
        self.lock().predicted_start.is_some()
    }

    /// Timestamp of the last observed transmit frame
    pub fn anchor(&self) -> Option<SystemTime> {
        self.lock().anchor
    }

    /// Current window prediction
    pub fn window(&self) -> Option<TransmitWindow> {
        let now = self.clock.now();
        let mut state = self.lock();
        state.advance(now);
        state.predicted_start.map(|predicted_start| TransmitWindow {
            predicted_start,
            duration: state.duration,
        })
    }

    /// Timestamp of the boundary `count` windows after the next one
    ///
    /// `count` 0 is the next boundary. Returns `None` until a transmit
    /// frame has been observed.
    pub fn next_boundary(&self, count: u32) -> Option<SystemTime> {
        self.next_boundary_at(self.clock.now(), count)
    }

    pub(crate) fn next_boundary_at(&self, now: SystemTime, count: u32) -> Option<SystemTime> {
        let mut state = self.lock();
        state.advance(now);
        state.predicted_start.map(|start| start + state.duration * count)
    }

    /// Time remaining until the next boundary
    pub fn until_boundary(&self) -> Option<Duration> {
        let now = self.clock.now();
        self.next_boundary_at(now, 0)
            .map(|next| next.duration_since(now).unwrap_or(Duration::ZERO))
    }

    /// Sleeps until `before` ahead of the next boundary
    ///
    /// Returns immediately when no boundary is known or when the target time
    /// has already passed.
    pub async fn sleep_until(&self, before: Duration) {
        let Some(next) = self.next_boundary(0) else {
            return;
        };
        let target = next.checked_sub(before).unwrap_or(next);
        self.clock.sleep_until(target).await;
    }

    /// Subscribes to boundary events published by [`WindowClock::run`]
    pub fn subscribe(&self) -> broadcast::Receiver<WindowBoundary> {
        self.boundary_tx.subscribe()
    }

    /// Boundary watcher task
    ///
    /// Publishes a [`WindowBoundary`] each time a predicted boundary elapses,
    /// until the shutdown signal flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = self.next_boundary(0);
            let reanchored = self.reanchored.notified();

            match next {
                None => {
                    tokio::select! {
                        _ = reanchored => {}
                        _ = shutdown.changed() => break,
                    }
                }
                Some(at) => {
                    tokio::select! {
                        _ = self.clock.sleep_until(at) => {
                            let duration = self.window_duration();
                            trace!(at = %fmt_time(at), "window boundary");
                            // no subscribers is fine
                            let _ = self.boundary_tx.send(WindowBoundary { at, duration });
                        }
                        _ = reanchored => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        debug!("window watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand::rngs::StdRng;
    use std::sync::Arc;
    use std::time::UNIX_EPOCH;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn window_clock(speed: Speed) -> WindowClock {
        WindowClock::new(Clock::starting_at(at(1_000)), speed)
    }

    #[test]
    fn test_unknown_before_first_frame() {
        let clock = window_clock(Speed::Normal);
        assert!(!clock.is_anchored());
        assert_eq!(clock.next_boundary_at(at(1_000), 0), None);
    }

    #[test]
    fn test_prediction_from_frame() {
        let clock = window_clock(Speed::Normal);
        clock.observe_frame_at(at(1_000), at(1_001));

        assert_eq!(clock.next_boundary_at(at(1_001), 0), Some(at(1_015)));
        assert_eq!(clock.next_boundary_at(at(1_001), 2), Some(at(1_045)));
        // missed frames are skipped over
        assert_eq!(clock.next_boundary_at(at(1_050), 0), Some(at(1_060)));
    }

    #[test]
    fn test_boundary_exactly_now_moves_on() {
        let clock = window_clock(Speed::Normal);
        clock.observe_frame_at(at(1_000), at(1_000));
        assert_eq!(clock.next_boundary_at(at(1_000), 0), Some(at(1_015)));
        assert_eq!(clock.next_boundary_at(at(1_015), 0), Some(at(1_030)));
    }

    #[test]
    fn test_frame_ahead_of_local_time() {
        let clock = window_clock(Speed::Normal);
        clock.observe_frame_at(at(1_040), at(1_001));
        assert_eq!(clock.next_boundary_at(at(1_001), 0), Some(at(1_010)));
    }

    #[test]
    fn test_speed_change_is_not_retroactive() {
        let clock = window_clock(Speed::Normal);
        clock.observe_frame_at(at(1_000), at(1_001));
        assert_eq!(clock.next_boundary_at(at(1_001), 0), Some(at(1_015)));

        clock.set_speed(Speed::Slow);
        // the pending boundary keeps its prediction
        assert_eq!(clock.next_boundary_at(at(1_002), 0), Some(at(1_015)));
        assert_eq!(clock.window_duration(), Duration::from_secs(15));

        // once it elapses the new duration applies
        assert_eq!(clock.next_boundary_at(at(1_016), 0), Some(at(1_045)));
        assert_eq!(clock.window_duration(), Duration::from_secs(30));
    }

    #[test]
    fn test_bounded_drift_under_speed_changes() {
        let mut rng = StdRng::seed_from_u64(7);
        let clock = window_clock(Speed::Normal);

        // true schedule
        let mut anchor = at(1_000);
        let mut duration = Speed::Normal.window_duration();
        let mut now = at(1_000);
        clock.observe_frame_at(anchor, now);

        let mut bound = duration;
        let mut synced = true;

        let last_boundary = |anchor: SystemTime, duration: Duration, now: SystemTime| {
            let elapsed = now.duration_since(anchor).unwrap();
            let windows = (elapsed.as_millis() / duration.as_millis()) as u32;
            anchor + duration * windows
        };

        for _ in 0..2_000 {
            now += Duration::from_millis(rng.gen_range(0..40_000));

            if rng.gen_bool(0.2) {
                let speed = Speed::ALL[rng.gen_range(0..Speed::ALL.len())];
                anchor = last_boundary(anchor, duration, now);
                duration = speed.window_duration();
                clock.set_speed(speed);
                bound = bound.max(duration);
                synced = false;
            }

            if rng.gen_bool(0.4) {
                let frame = last_boundary(anchor, duration, now);
                clock.observe_frame_at(frame, now);
                bound = duration;
                synced = true;
            }

            let truth = last_boundary(anchor, duration, now) + duration;
            let predicted = clock.next_boundary_at(now, 0).unwrap();
            assert!(predicted >= now);

            let drift = predicted
                .duration_since(truth)
                .unwrap_or_else(|e| e.duration());
            if synced {
                assert_eq!(drift, Duration::ZERO);
            } else {
                assert!(drift <= bound, "drift {:?} exceeds {:?}", drift, bound);
            }
        }
    }

    #[test]
    fn test_receive_anchors_next_boundary() {
        let clock = window_clock(Speed::Normal);
        assert!(clock.observe_receive_at(at(1_014), at(1_014)));
        assert!(clock.is_anchored());
        assert_eq!(clock.anchor(), None);
        assert_eq!(clock.next_boundary_at(at(1_014), 0), Some(at(1_015)));

        // a second decode from the same cycle is ignored
        assert!(!clock.observe_receive_at(at(1_014) + Duration::from_millis(900), at(1_015)));
        assert_eq!(clock.next_boundary_at(at(1_015), 0), Some(at(1_030)));

        // the next cycle re-anchors, correcting drift
        assert!(clock.observe_receive_at(at(1_030), at(1_030)));
        assert_eq!(clock.next_boundary_at(at(1_030), 0), Some(at(1_031)));
    }

    #[test]
    fn test_frame_and_receive_share_the_prediction() {
        let clock = window_clock(Speed::Normal);
        clock.observe_frame_at(at(1_000), at(1_001));
        assert!(clock.observe_receive_at(at(1_013), at(1_013)));
        assert_eq!(clock.next_boundary_at(at(1_013), 0), Some(at(1_014)));

        clock.observe_frame_at(at(1_029), at(1_030));
        assert_eq!(clock.next_boundary_at(at(1_030), 0), Some(at(1_044)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_until_before_boundary() {
        let clock = window_clock(Speed::Normal);
        // returns at once when unanchored
        clock.sleep_until(Duration::from_millis(250)).await;
        assert_eq!(clock.clock().now(), at(1_000));

        clock.observe_frame(at(1_000));
        clock.sleep_until(Duration::from_millis(250)).await;
        assert_eq!(
            clock.clock().now(),
            at(1_015) - Duration::from_millis(250)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_publishes_boundaries() {
        let clock = Arc::new(window_clock(Speed::Fast));
        let mut boundaries = clock.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let watcher = {
            let clock = Arc::clone(&clock);
            tokio::spawn(async move { clock.run(shutdown_rx).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        clock.observe_frame(at(1_001));

        let first = boundaries.recv().await.unwrap();
        assert_eq!(first.at, at(1_011));
        assert_eq!(first.duration, Duration::from_secs(10));
        let second = boundaries.recv().await.unwrap();
        assert_eq!(second.at, at(1_021));

        shutdown_tx.send(true).unwrap();
        watcher.await.unwrap();
    }
}
