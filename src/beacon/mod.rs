//! Periodic beacons from the reserved sub-band
//!
//! Beacons are only sent when the band has been quiet for us: no recent
//! outgoing traffic, no exchange in progress, and a full interval since the
//! last beacon or dial change.

mod activity;
mod scheduler;

pub use self::activity::ActivityLog;
pub use self::scheduler::{should_skip, BeaconContext, BeaconScheduler, BeaconState, SkipReason};
