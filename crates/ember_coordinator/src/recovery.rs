//! One master crash recovery, at its boundary with the recovery manager.
//!
//! A `Recovery` owns the crashed master's partition plan, hands each
//! recoverable partition to a surviving master, and collects one verdict per
//! partition. It never talks to backups or recovery masters itself; dispatch
//! goes through the [`RecoveryMasterStarter`] seam and verdicts arrive
//! through the manager's task queue.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::seq::SliceRandom;

use crate::tablet_map::{TabletKey, Will};
use crate::tracker::RecoveryTracker;
use crate::{RecoveryId, ServerId};

static NEXT_RECOVERY_ID: AtomicU64 = AtomicU64::new(1);

/// Everything a recovery master needs to start reconstructing one partition.
#[derive(Clone, Debug)]
pub struct RecoveryMasterStart {
    pub recovery_id: RecoveryId,
    pub recovery_master: ServerId,
    pub crashed_server: ServerId,
    pub partition: u32,
    pub tablets: Vec<TabletKey>,
    pub min_open_segment_id: u64,
}

/// Dispatch seam for partition hand-off. The production implementation
/// issues the recover-partition RPC to the chosen master.
pub trait RecoveryMasterStarter: Send + Sync {
    fn start_partition(&self, start: &RecoveryMasterStart) -> anyhow::Result<()>;
}

/// Default starter: records the hand-off in the log and nothing else.
pub struct LoggingStarter;

impl RecoveryMasterStarter for LoggingStarter {
    fn start_partition(&self, start: &RecoveryMasterStart) -> anyhow::Result<()> {
        tracing::info!(
            recovery_id = start.recovery_id.0,
            recovery_master = start.recovery_master.0,
            partition = start.partition,
            tablet_count = start.tablets.len(),
            "partition handed to recovery master"
        );
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
struct PartitionAssignment {
    partition: u32,
    recovery_master: ServerId,
    outcome: Option<bool>,
}

/// State of one recovery attempt for a crashed master.
pub struct Recovery {
    recovery_id: RecoveryId,
    crashed_server_id: ServerId,
    will: Will,
    min_open_segment_id: u64,
    started: bool,
    assignments: Vec<PartitionAssignment>,
}

impl Recovery {
    /// Allocate a recovery with a fresh id. Ids are never reused within a
    /// coordinator lifetime.
    pub fn new(crashed_server_id: ServerId, will: Will, min_open_segment_id: u64) -> Self {
        Self {
            recovery_id: RecoveryId(NEXT_RECOVERY_ID.fetch_add(1, Ordering::Relaxed)),
            crashed_server_id,
            will,
            min_open_segment_id,
            started: false,
            assignments: Vec::new(),
        }
    }

    pub fn id(&self) -> RecoveryId {
        self.recovery_id
    }

    pub fn crashed_server_id(&self) -> ServerId {
        self.crashed_server_id
    }

    pub fn will(&self) -> &Will {
        &self.will
    }

    pub fn min_open_segment_id(&self) -> u64 {
        self.min_open_segment_id
    }

    pub fn started(&self) -> bool {
        self.started
    }

    /// Partitions with no verdict yet.
    pub fn outstanding(&self) -> usize {
        self.assignments
            .iter()
            .filter(|a| a.outcome.is_none())
            .count()
    }

    /// True once every partition has a verdict (or nothing could be
    /// dispatched at all).
    pub fn is_done(&self) -> bool {
        self.started && self.assignments.iter().all(|a| a.outcome.is_some())
    }

    /// True iff every partition completed successfully.
    pub fn was_completely_successful(&self) -> bool {
        self.started
            && !self.assignments.is_empty()
            && self.assignments.iter().all(|a| a.outcome == Some(true))
    }

    /// Assign each recoverable partition a recovery master and hand the
    /// partitions out. Masters come from the tracker's claimable set (up,
    /// not the crashed server, not claimed by another recovery), shuffled so
    /// load spreads across the cluster; one master serves several partitions
    /// only when partitions outnumber claimable masters. With no claimable
    /// master the recovery is immediately done and unsuccessful.
    pub fn start(&mut self, tracker: &RecoveryTracker, starter: &dyn RecoveryMasterStarter) {
        self.started = true;
        let partitions = self.will.recoverable_partitions();
        if partitions == 0 {
            tracing::warn!(
                recovery_id = self.recovery_id.0,
                server_id = self.crashed_server_id.0,
                "partition plan has no recoverable partitions"
            );
            return;
        }
        let mut masters = tracker.claimable_masters(self.crashed_server_id, self.recovery_id);
        if masters.is_empty() {
            tracing::warn!(
                recovery_id = self.recovery_id.0,
                server_id = self.crashed_server_id.0,
                "no claimable recovery masters available"
            );
            return;
        }
        masters.shuffle(&mut rand::thread_rng());

        for partition in 0..partitions {
            let recovery_master = masters[partition as usize % masters.len()];
            tracker.set_recovery(recovery_master, self.recovery_id);
            let start = RecoveryMasterStart {
                recovery_id: self.recovery_id,
                recovery_master,
                crashed_server: self.crashed_server_id,
                partition,
                tablets: self
                    .will
                    .partition_entries(partition)
                    .map(|e| e.tablet)
                    .collect(),
                min_open_segment_id: self.min_open_segment_id,
            };
            let mut assignment = PartitionAssignment {
                partition,
                recovery_master,
                outcome: None,
            };
            tracing::info!(
                recovery_id = self.recovery_id.0,
                recovery_master = recovery_master.0,
                partition,
                "dispatching partition to recovery master"
            );
            if let Err(err) = starter.start_partition(&start) {
                tracing::warn!(
                    error = ?err,
                    recovery_id = self.recovery_id.0,
                    recovery_master = recovery_master.0,
                    partition,
                    "failed to hand partition to recovery master"
                );
                assignment.outcome = Some(false);
            }
            self.assignments.push(assignment);
        }

        for master in masters {
            if !self.has_unresolved(master) {
                tracker.clear_recovery(master);
            }
        }
    }

    /// Record a recovery master's verdict against its oldest unresolved
    /// partition, releasing the tracker slot with the master's last one.
    /// Returns true when this verdict completed the recovery. A verdict from
    /// a master with nothing unresolved is dropped.
    pub fn recovery_master_finished(
        &mut self,
        recovery_master: ServerId,
        successful: bool,
        tracker: &RecoveryTracker,
    ) -> bool {
        let Some(assignment) = self
            .assignments
            .iter_mut()
            .find(|a| a.recovery_master == recovery_master && a.outcome.is_none())
        else {
            tracing::warn!(
                recovery_id = self.recovery_id.0,
                recovery_master = recovery_master.0,
                "verdict from a recovery master with no unresolved partition; dropping"
            );
            return false;
        };
        assignment.outcome = Some(successful);
        let partition = assignment.partition;
        tracing::info!(
            recovery_id = self.recovery_id.0,
            recovery_master = recovery_master.0,
            partition,
            successful,
            "recovery master finished partition"
        );
        if !self.has_unresolved(recovery_master) {
            tracker.clear_recovery(recovery_master);
        }
        self.is_done()
    }

    fn has_unresolved(&self, recovery_master: ServerId) -> bool {
        self.assignments
            .iter()
            .any(|a| a.recovery_master == recovery_master && a.outcome.is_none())
    }
}
