use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// The two consumers that compete for the offset frequency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OffsetHolder {
    /// Normal operating-range allocator
    Primary,
    /// Reserved beacon sub-band allocator
    Beacon,
}

impl OffsetHolder {
    fn index(&self) -> usize {
        match self {
            OffsetHolder::Primary => 0,
            OffsetHolder::Beacon => 1,
        }
    }
}

impl fmt::Display for OffsetHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OffsetHolder::Primary => f.write_str("primary"),
            OffsetHolder::Beacon => f.write_str("beacon"),
        }
    }
}

#[derive(Debug)]
struct ArbiterState {
    holder: OffsetHolder,
    pauses: [u32; 2],
}

impl ArbiterState {
    fn is_active(&self, role: OffsetHolder) -> bool {
        self.holder == role && self.pauses[role.index()] == 0
    }
}

/// Arbitrates the single offset frequency between two allocators
///
/// Exactly one holder owns the offset at a time. An allocator is active only
/// while it is the holder and nobody has it paused, and every commit happens
/// under the arbiter lock, so two allocators can never both commit.
#[derive(Debug)]
pub struct OffsetArbiter {
    state: Arc<Mutex<ArbiterState>>,
}

impl OffsetArbiter {
    /// Creates an arbiter and the gates for both allocators
    ///
    /// The primary allocator holds the offset. The beacon gate starts with
    /// one pause outstanding.
    pub fn new() -> (Arc<OffsetArbiter>, AllocatorGate, AllocatorGate) {
        let arbiter = Arc::new(OffsetArbiter {
            state: Arc::new(Mutex::new(ArbiterState {
                holder: OffsetHolder::Primary,
                pauses: [0, 1],
            })),
        });
        let primary = AllocatorGate { arbiter: Arc::clone(&arbiter), role: OffsetHolder::Primary };
        let beacon = AllocatorGate { arbiter: Arc::clone(&arbiter), role: OffsetHolder::Beacon };
        (arbiter, primary, beacon)
    }

    /// Takes exclusive control of the offset resource
    ///
    /// No allocator can commit while the lease is held.
    pub async fn lease(&self) -> OffsetLease {
        OffsetLease { state: Arc::clone(&self.state).lock_owned().await }
    }

    /// Current holder
    pub async fn holder(&self) -> OffsetHolder {
        self.state.lock().await.holder
    }

    /// Hands the offset resource to `holder`
    pub async fn hand_to(&self, holder: OffsetHolder) {
        self.lease().await.hand_to(holder);
    }

    /// Number of allocators currently able to commit
    pub async fn active_count(&self) -> usize {
        let state = self.state.lock().await;
        [OffsetHolder::Primary, OffsetHolder::Beacon]
            .iter()
            .filter(|role| state.is_active(**role))
            .count()
    }
}

/// Exclusive access to the offset resource
pub struct OffsetLease {
    state: OwnedMutexGuard<ArbiterState>,
}

impl OffsetLease {
    /// Current holder
    pub fn holder(&self) -> OffsetHolder {
        self.state.holder
    }

    /// Hands the offset resource to `holder`
    pub fn hand_to(&mut self, holder: OffsetHolder) {
        if self.state.holder != holder {
            debug!(from = %self.state.holder, to = %holder, "offset resource handed over");
            self.state.holder = holder;
        }
    }

    /// Whether `role` could commit if this lease were its own
    pub fn is_active(&self, role: OffsetHolder) -> bool {
        self.state.is_active(role)
    }
}

/// Reference-counted pause gate for one allocator
#[derive(Debug, Clone)]
pub struct AllocatorGate {
    arbiter: Arc<OffsetArbiter>,
    role: OffsetHolder,
}

impl AllocatorGate {
    /// Which allocator this gate controls
    pub fn role(&self) -> OffsetHolder {
        self.role
    }

    /// The shared arbiter
    pub fn arbiter(&self) -> &Arc<OffsetArbiter> {
        &self.arbiter
    }

    /// Adds a pause, returning the new pause count
    pub async fn pause(&self) -> u32 {
        let mut state = self.arbiter.state.lock().await;
        let count = &mut state.pauses[self.role.index()];
        *count += 1;
        debug!(allocator = %self.role, pauses = *count, "allocator paused");
        *count
    }

    /// Releases a pause, returning the new pause count
    ///
    /// Resuming an allocator with no outstanding pauses does nothing.
    pub async fn resume(&self) -> u32 {
        let mut state = self.arbiter.state.lock().await;
        let count = &mut state.pauses[self.role.index()];
        if *count > 0 {
            *count -= 1;
            debug!(allocator = %self.role, pauses = *count, "allocator resumed");
        }
        *count
    }

    /// Outstanding pauses
    pub async fn pause_count(&self) -> u32 {
        self.arbiter.state.lock().await.pauses[self.role.index()]
    }

    /// Whether any pause is outstanding
    pub async fn is_paused(&self) -> bool {
        self.pause_count().await > 0
    }

    /// Whether the allocator may commit right now
    pub async fn is_active(&self) -> bool {
        self.arbiter.state.lock().await.is_active(self.role)
    }

    /// Acquires the right to commit a new offset
    ///
    /// Returns `None` when the allocator is paused or does not hold the
    /// offset. Pauses and hand-overs wait until the returned lease is dropped.
    pub async fn try_commit(&self) -> Option<OffsetLease> {
        let lease = self.arbiter.lease().await;
        if lease.is_active(self.role) {
            Some(lease)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::time::Duration;

    #[tokio::test]
    async fn test_initial_state() {
        let (arbiter, primary, beacon) = OffsetArbiter::new();
        assert_eq!(arbiter.holder().await, OffsetHolder::Primary);
        assert!(primary.is_active().await);
        assert!(beacon.is_paused().await);
        assert!(!beacon.is_active().await);
    }

    #[tokio::test]
    async fn test_resume_is_idempotent() {
        let (_arbiter, primary, _beacon) = OffsetArbiter::new();
        assert_eq!(primary.resume().await, 0);
        assert_eq!(primary.resume().await, 0);
        assert!(primary.is_active().await);

        assert_eq!(primary.pause().await, 1);
        assert_eq!(primary.resume().await, 0);
        assert_eq!(primary.resume().await, 0);
        assert_eq!(primary.pause_count().await, 0);
    }

    #[tokio::test]
    async fn test_independent_pauses_are_kept() {
        let (_arbiter, primary, _beacon) = OffsetArbiter::new();
        // caller pauses, then a beacon cycle pauses and resumes
        primary.pause().await;
        primary.pause().await;
        primary.resume().await;
        assert!(primary.is_paused().await);
        assert!(primary.try_commit().await.is_none());
    }

    #[tokio::test]
    async fn test_only_holder_commits() {
        let (arbiter, primary, beacon) = OffsetArbiter::new();
        beacon.resume().await;
        assert!(beacon.try_commit().await.is_none());

        arbiter.hand_to(OffsetHolder::Beacon).await;
        assert!(beacon.try_commit().await.is_some());
        assert!(primary.try_commit().await.is_none());
    }

    #[tokio::test]
    async fn test_pause_waits_for_commit() {
        let (_arbiter, primary, _beacon) = OffsetArbiter::new();
        let lease = primary.try_commit().await.unwrap();

        let pausing = {
            let primary = primary.clone();
            tokio::spawn(async move { primary.pause().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pausing.is_finished());

        drop(lease);
        assert_eq!(pausing.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_random_interleaving_never_two_active() {
        let (arbiter, primary, beacon) = OffsetArbiter::new();
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..5_000 {
            match rng.gen_range(0..6) {
                0 => { primary.pause().await; }
                1 => { primary.resume().await; }
                2 => { beacon.pause().await; }
                3 => { beacon.resume().await; }
                4 => arbiter.hand_to(OffsetHolder::Beacon).await,
                _ => arbiter.hand_to(OffsetHolder::Primary).await,
            }
            assert!(!(primary.is_active().await && beacon.is_active().await));
            assert!(arbiter.active_count().await <= 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_interleaving_never_two_active() {
        let (arbiter, primary, beacon) = OffsetArbiter::new();

        let mut workers = Vec::new();
        for seed in 0..4u64 {
            let arbiter = Arc::clone(&arbiter);
            let gates = [primary.clone(), beacon.clone()];
            workers.push(tokio::spawn(async move {
                let mut rng = StdRng::seed_from_u64(seed);
                for _ in 0..1_000 {
                    let gate = &gates[rng.gen_range(0..2)];
                    match rng.gen_range(0..5) {
                        0 => { gate.pause().await; }
                        1 => { gate.resume().await; }
                        2 => arbiter.hand_to(gate.role()).await,
                        _ => {
                            if let Some(lease) = gate.try_commit().await {
                                assert!(lease.is_active(gate.role()));
                                tokio::task::yield_now().await;
                            }
                        }
                    }
                }
            }));
        }

        let observer = {
            let arbiter = Arc::clone(&arbiter);
            tokio::spawn(async move {
                for _ in 0..2_000 {
                    assert!(arbiter.active_count().await <= 1);
                    tokio::task::yield_now().await;
                }
            })
        };

        for worker in workers {
            worker.await.unwrap();
        }
        observer.await.unwrap();
    }
}
