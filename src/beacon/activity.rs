use std::sync::Mutex;
use std::time::{Duration, SystemTime};

#[derive(Debug, Default)]
struct Activity {
    last_outgoing: Option<SystemTime>,
    last_exchange: Option<SystemTime>,
}

/// Recent traffic that should hold back a beacon
#[derive(Debug, Default)]
pub struct ActivityLog {
    inner: Mutex<Activity>,
}

/// Whether `last` falls within `span` before `now`
pub(crate) fn within(last: Option<SystemTime>, now: SystemTime, span: Duration) -> bool {
    match last {
        // a timestamp ahead of now counts as recent
        Some(at) => now.duration_since(at).map_or(true, |age| age < span),
        None => false,
    }
}

impl ActivityLog {
    /// Creates an empty log
    pub fn new() -> Self {
        ActivityLog::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Activity> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records local outgoing traffic
    pub fn note_outgoing(&self, at: SystemTime) {
        let mut inner = self.lock();
        inner.last_outgoing = inner.last_outgoing.max(Some(at));
    }

    /// Records a directed message to or from the local station
    pub fn note_exchange(&self, at: SystemTime) {
        let mut inner = self.lock();
        inner.last_exchange = inner.last_exchange.max(Some(at));
    }

    /// Last local outgoing traffic
    pub fn last_outgoing(&self) -> Option<SystemTime> {
        self.lock().last_outgoing
    }

    /// Last directed message to or from the local station
    pub fn last_exchange(&self) -> Option<SystemTime> {
        self.lock().last_exchange
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn test_latest_timestamp_wins() {
        let log = ActivityLog::new();
        assert_eq!(log.last_outgoing(), None);

        log.note_outgoing(at(200));
        log.note_outgoing(at(100));
        assert_eq!(log.last_outgoing(), Some(at(200)));
    }

    #[test]
    fn test_within() {
        let span = Duration::from_secs(60);
        assert!(!within(None, at(100), span));
        assert!(within(Some(at(100)), at(159), span));
        assert!(!within(Some(at(100)), at(160), span));
        // ahead of now counts as recent
        assert!(within(Some(at(100)), at(50), span));
    }
}
