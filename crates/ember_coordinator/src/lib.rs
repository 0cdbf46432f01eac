//! Coordinator-side master recovery for the emberstore cluster.
//!
//! Data in an emberstore cluster is partitioned into tablets owned by master
//! servers. When a master crashes, the coordinator reconstructs its tablets
//! onto surviving recovery masters. This crate holds the machinery that
//! drives that process end to end:
//! - a serialized task queue and worker thread ([`task_queue`])
//! - the authoritative server list and tablet map ([`server_list`],
//!   [`tablet_map`])
//! - a membership tracker that ties cluster events to in-flight recoveries
//!   ([`tracker`])
//! - the per-crash recovery state machine ([`recovery`])
//! - the recovery manager that admits, supervises, and finalizes recoveries
//!   ([`recovery_manager`])

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod recovery;
pub mod recovery_manager;
pub mod server_list;
pub mod tablet_map;
pub mod task_queue;
pub mod tracker;

pub use recovery::{LoggingStarter, RecoveryMasterStart, RecoveryMasterStarter};
pub use recovery_manager::{MasterRecoveryManager, RecoveryManagerConfig};
pub use server_list::{
    CoordinatorServerList, LoggingBroadcaster, MembershipBroadcaster, MembershipUpdate,
    ServerChangeEvent, ServerDetails, ServerStatus,
};
pub use tablet_map::{RecoveredTablet, Tablet, TabletKey, TabletMap, TabletStatus, Will, WillEntry};
pub use tracker::RecoveryTracker;

/// Identifies one server for the lifetime of the cluster. Ids are never
/// reused, so a restarted process comes back under a fresh id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId(pub u64);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one recovery attempt. Unique within a coordinator lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecoveryId(pub u64);

impl fmt::Display for RecoveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A position in a master's replicated log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPosition {
    pub segment_id: u64,
    pub offset: u32,
}

impl LogPosition {
    pub const fn new(segment_id: u64, offset: u32) -> Self {
        Self { segment_id, offset }
    }
}
