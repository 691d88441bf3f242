//! Spectrum occupancy and offset selection
//!
//! The allocator decides where our signal should sit given what has been
//! heard recently. Two allocators share the single offset frequency: the
//! primary one working the normal range and the beacon one working the
//! reserved sub-band. The [`OffsetArbiter`] makes sure only one of them can
//! commit at a time.

mod allocator;
mod gate;
mod monitor;
mod spots;

pub use self::allocator::{Decision, Gap, Signal, SignalObservation, SpectrumAllocator};
pub use self::gate::{AllocatorGate, OffsetArbiter, OffsetHolder, OffsetLease};
pub use self::monitor::OffsetMonitor;
pub use self::spots::{SpotLog, MAX_SPOTS};
