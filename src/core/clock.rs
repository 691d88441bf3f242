use std::time::{Duration, SystemTime};
use tokio::time::Instant;

/// Wall-clock source shared by every timing computation
///
/// Wall time is derived from a tokio `Instant` measured against a fixed
/// epoch, so pausing or advancing the tokio clock moves `now()` with it.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch: SystemTime,
    origin: Instant,
}

impl Clock {
    /// Creates a clock anchored at the current system time
    pub fn new() -> Self {
        Clock::starting_at(SystemTime::now())
    }

    /// Creates a clock whose `now()` starts at `epoch`
    pub fn starting_at(epoch: SystemTime) -> Self {
        Clock {
            epoch,
            origin: Instant::now(),
        }
    }

    /// Current wall time
    pub fn now(&self) -> SystemTime {
        self.epoch + self.origin.elapsed()
    }

    /// The tokio instant corresponding to a wall time
    ///
    /// Times before the clock's epoch map to the epoch.
    pub fn instant_at(&self, time: SystemTime) -> Instant {
        let offset = time.duration_since(self.epoch).unwrap_or(Duration::ZERO);
        self.origin + offset
    }

    /// Sleeps until the given wall time, returning at once if it has passed
    pub async fn sleep_until(&self, time: SystemTime) {
        tokio::time::sleep_until(self.instant_at(time)).await;
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_paused_time() {
        let epoch = UNIX_EPOCH + Duration::from_secs(1_000);
        let clock = Clock::starting_at(epoch);
        assert_eq!(clock.now(), epoch);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(clock.now(), epoch + Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_until() {
        let epoch = UNIX_EPOCH + Duration::from_secs(1_000);
        let clock = Clock::starting_at(epoch);

        clock.sleep_until(epoch + Duration::from_secs(3)).await;
        assert_eq!(clock.now(), epoch + Duration::from_secs(3));

        // already passed
        clock.sleep_until(epoch).await;
        assert_eq!(clock.now(), epoch + Duration::from_secs(3));
    }
}
