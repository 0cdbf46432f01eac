//! The serialized engine that turns master crashes into completed
//! recoveries.
//!
//! All manager state is mutated inside task executions on a single worker
//! thread, so the waiting queue, the active set, and every in-flight
//! recovery form one cooperative system with no locking beyond the queue
//! itself. External callers (the coordinator's crash handler, the completion
//! RPC from recovery masters, the membership tracker) only enqueue tasks.
//!
//! Lifecycle of one crash:
//! 1. `start_master_recovery` marks the crashed master's tablets recovering
//!    and queues an enqueue task carrying a fresh [`Recovery`].
//! 2. An admission pass (`MaybeStartRecovery`) moves recoveries from the
//!    waiting queue into the active set, up to the configured cap and never
//!    two at once for the same crashed server.
//! 3. The recovery hands partitions to recovery masters and collects
//!    verdicts; completion reports finalize tablet ownership.
//! 4. A completely successful recovery removes the crashed server from the
//!    membership and broadcasts the update; anything less requeues the same
//!    recovery parameters for another attempt.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::Context as _;

use crate::recovery::{Recovery, RecoveryMasterStarter};
use crate::server_list::{CoordinatorServerList, MembershipUpdate, ServerChangeEvent};
use crate::tablet_map::{RecoveredTablet, TabletMap, TabletStatus};
use crate::task_queue::TaskQueue;
use crate::tracker::RecoveryTracker;
use crate::{RecoveryId, ServerId};

/// Configuration for the recovery manager.
#[derive(Clone, Copy, Debug)]
pub struct RecoveryManagerConfig {
    /// Upper bound on concurrently running recoveries. Values below 1 are
    /// treated as 1.
    pub max_active_recoveries: usize,
}

impl Default for RecoveryManagerConfig {
    fn default() -> Self {
        Self {
            max_active_recoveries: 1,
        }
    }
}

enum ManagerTask {
    EnqueueRecovery(Recovery),
    MaybeStartRecovery,
    ApplyTrackerChanges,
    RecoveryMasterFinished {
        recovery_id: RecoveryId,
        recovery_master_id: ServerId,
        recovered_tablets: Vec<RecoveredTablet>,
        successful: bool,
    },
    DriveRecovery(RecoveryId),
}

struct ManagerState {
    queue: TaskQueue<ManagerTask>,
    server_list: Arc<CoordinatorServerList>,
    tablet_map: Arc<TabletMap>,
    tracker: Arc<RecoveryTracker>,
    starter: Arc<dyn RecoveryMasterStarter>,
    waiting: VecDeque<Recovery>,
    active: HashMap<RecoveryId, Recovery>,
    max_active_recoveries: usize,
}

/// Orchestrates master crash recoveries on the coordinator.
pub struct MasterRecoveryManager {
    queue: TaskQueue<ManagerTask>,
    state: Arc<Mutex<ManagerState>>,
    server_list: Arc<CoordinatorServerList>,
    tablet_map: Arc<TabletMap>,
    do_not_start_recoveries: AtomicBool,
    worker: Option<thread::JoinHandle<()>>,
}

impl MasterRecoveryManager {
    pub fn new(
        config: RecoveryManagerConfig,
        server_list: Arc<CoordinatorServerList>,
        tablet_map: Arc<TabletMap>,
        starter: Arc<dyn RecoveryMasterStarter>,
    ) -> Self {
        let queue = TaskQueue::new();
        let tracker = Arc::new(RecoveryTracker::new());
        {
            // Installed before registration so the replay of current
            // membership is not missed.
            let queue = queue.clone();
            tracker.set_change_hook(Box::new(move || {
                queue.schedule(ManagerTask::ApplyTrackerChanges);
            }));
        }
        let subscriber: Arc<dyn crate::server_list::MembershipSubscriber> = tracker.clone();
        server_list.register_tracker(subscriber);

        let state = Arc::new(Mutex::new(ManagerState {
            queue: queue.clone(),
            server_list: Arc::clone(&server_list),
            tablet_map: Arc::clone(&tablet_map),
            tracker,
            starter,
            waiting: VecDeque::new(),
            active: HashMap::new(),
            max_active_recoveries: config.max_active_recoveries.max(1),
        }));

        Self {
            queue,
            state,
            server_list,
            tablet_map,
            do_not_start_recoveries: AtomicBool::new(false),
            worker: None,
        }
    }

    /// Launch the worker thread. Must be called before recoveries make
    /// progress; tasks enqueued earlier are performed once it runs. Calling
    /// `start` on a running manager has no effect. `start` and `halt` are
    /// not safe to race against each other.
    pub fn start(&mut self) -> anyhow::Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let queue = self.queue.clone();
        let state = Arc::clone(&self.state);
        let handle = thread::Builder::new()
            .name("master-recovery".to_string())
            .spawn(move || {
                queue.perform_tasks_until_halt(|task| {
                    let mut state = state.lock().unwrap();
                    if let Err(err) = state.perform_task(task) {
                        tracing::warn!(error = ?err, "recovery task failed");
                    }
                });
            })
            .context("spawn master recovery worker")?;
        self.worker = Some(handle);
        Ok(())
    }

    /// Stop dispatching tasks and join the worker. The task being performed
    /// when the flag is raised runs to completion. Idempotent.
    pub fn halt(&mut self) {
        self.queue.halt();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("master recovery worker panicked");
            }
        }
    }

    /// Mark every tablet of the crashed master recovering and enqueue its
    /// recovery. A master that owned no tablets needs no recovery.
    pub fn start_master_recovery(&self, crashed_server_id: ServerId) -> anyhow::Result<()> {
        let tablets = self
            .tablet_map
            .set_status_for_server(crashed_server_id, TabletStatus::Recovering);
        if tablets.is_empty() {
            tracing::info!(
                server_id = crashed_server_id.0,
                "server crashed, but it had no tablets"
            );
            return Ok(());
        }
        tracing::info!(
            server_id = crashed_server_id.0,
            tablet_count = tablets.len(),
            "marked tablets of crashed master as recovering"
        );
        self.restart_master_recovery(crashed_server_id)
    }

    /// Enqueue recovery of a crashed master from the plan stored in the
    /// server list. Does not touch tablet statuses; see
    /// [`Self::start_master_recovery`] for that.
    pub fn restart_master_recovery(&self, crashed_server_id: ServerId) -> anyhow::Result<()> {
        let details = self
            .server_list
            .details(crashed_server_id)
            .context("crashed master must be in the server list")?;
        tracing::info!(
            server_id = crashed_server_id.0,
            "scheduling recovery of master"
        );
        if self.do_not_start_recoveries.load(Ordering::Relaxed) {
            tracing::info!(
                target: "testlog",
                server_id = crashed_server_id.0,
                will_entries = details.will.entries().len(),
                min_open_segment_id = details.min_open_segment_id,
                "recovery start suppressed"
            );
            return Ok(());
        }
        let recovery = Recovery::new(crashed_server_id, details.will, details.min_open_segment_id);
        self.queue.schedule(ManagerTask::EnqueueRecovery(recovery));
        Ok(())
    }

    /// Record a recovery master's completion report. Called by the inbound
    /// RPC handler; safe from any thread, and does nothing but schedule.
    pub fn recovery_master_finished(
        &self,
        recovery_id: RecoveryId,
        recovery_master_id: ServerId,
        recovered_tablets: Vec<RecoveredTablet>,
        successful: bool,
    ) {
        tracing::info!(
            recovery_id = recovery_id.0,
            recovery_master = recovery_master_id.0,
            tablet_count = recovered_tablets.len(),
            successful,
            "recovery master reported completion"
        );
        self.queue.schedule(ManagerTask::RecoveryMasterFinished {
            recovery_id,
            recovery_master_id,
            recovered_tablets,
            successful,
        });
    }

    /// Suppress (or re-allow) enqueuing of new recoveries. Crash handling
    /// still marks tablets; only the enqueue is gated.
    pub fn set_do_not_start_recoveries(&self, suppress: bool) {
        self.do_not_start_recoveries
            .store(suppress, Ordering::Relaxed);
    }

    pub fn do_not_start_recoveries(&self) -> bool {
        self.do_not_start_recoveries.load(Ordering::Relaxed)
    }

    pub fn active_recovery_count(&self) -> usize {
        self.state.lock().unwrap().active.len()
    }

    pub fn waiting_recovery_count(&self) -> usize {
        self.state.lock().unwrap().waiting.len()
    }

    pub fn queued_tasks(&self) -> usize {
        self.queue.len()
    }
}

impl Drop for MasterRecoveryManager {
    fn drop(&mut self) {
        self.halt();
    }
}

impl ManagerState {
    fn perform_task(&mut self, task: ManagerTask) -> anyhow::Result<()> {
        match task {
            ManagerTask::EnqueueRecovery(recovery) => self.enqueue_recovery(recovery),
            ManagerTask::MaybeStartRecovery => self.maybe_start_recoveries(),
            ManagerTask::ApplyTrackerChanges => self.apply_tracker_changes(),
            ManagerTask::RecoveryMasterFinished {
                recovery_id,
                recovery_master_id,
                recovered_tablets,
                successful,
            } => self.finish_recovery_master(
                recovery_id,
                recovery_master_id,
                recovered_tablets,
                successful,
            ),
            ManagerTask::DriveRecovery(recovery_id) => self.drive_recovery(recovery_id),
        }
    }

    fn enqueue_recovery(&mut self, recovery: Recovery) -> anyhow::Result<()> {
        tracing::info!(
            server_id = recovery.crashed_server_id().0,
            recovery_id = recovery.id().0,
            "recovery queued"
        );
        self.waiting.push_back(recovery);
        self.queue.schedule(ManagerTask::MaybeStartRecovery);
        Ok(())
    }

    /// Admit waiting recoveries into the active set, oldest first, up to the
    /// cap. A recovery for a server that already has an active recovery is
    /// deferred, never dropped: it goes back on the queue and is retried on
    /// the admission pass scheduled when the active one completes.
    fn maybe_start_recoveries(&mut self) -> anyhow::Result<()> {
        let mut deferred = Vec::new();
        while !self.waiting.is_empty() && self.active.len() < self.max_active_recoveries {
            let Some(recovery) = self.waiting.pop_front() else {
                break;
            };
            let server_already_recovering = self
                .active
                .values()
                .any(|r| r.crashed_server_id() == recovery.crashed_server_id());
            if server_already_recovering {
                tracing::info!(
                    server_id = recovery.crashed_server_id().0,
                    "delaying start of recovery; another recovery is active for the same server"
                );
                deferred.push(recovery);
            } else {
                let recovery_id = recovery.id();
                tracing::info!(
                    server_id = recovery.crashed_server_id().0,
                    recovery_id = recovery_id.0,
                    active_recoveries = self.active.len() + 1,
                    "starting recovery of server"
                );
                self.active.insert(recovery_id, recovery);
                self.queue.schedule(ManagerTask::DriveRecovery(recovery_id));
            }
        }
        for recovery in deferred {
            self.waiting.push_back(recovery);
        }
        if !self.waiting.is_empty() {
            tracing::info!(
                blocked = self.waiting.len(),
                "recoveries blocked waiting for other recoveries"
            );
        }
        Ok(())
    }

    /// Drain the tracker's buffered membership changes. A crashed or removed
    /// server with a recovery slot set is a lost recovery master; its
    /// recovery gets a failure verdict for it.
    fn apply_tracker_changes(&mut self) -> anyhow::Result<()> {
        while let Some((details, event)) = self.tracker.get_change() {
            match event {
                ServerChangeEvent::Added => {}
                ServerChangeEvent::Crashed | ServerChangeEvent::Removed => {
                    let Some(recovery_id) = self.tracker.recovery_for(details.server_id) else {
                        // Unclaimed server: stop here. The rest of the
                        // buffer is drained by the next scheduled pass.
                        break;
                    };
                    let Some(recovery) = self.active.get_mut(&recovery_id) else {
                        // Slot left behind by a freed recovery.
                        self.tracker.clear_recovery(details.server_id);
                        continue;
                    };
                    let done =
                        recovery.recovery_master_finished(details.server_id, false, &self.tracker);
                    if done {
                        self.queue.schedule(ManagerTask::DriveRecovery(recovery_id));
                    }
                }
            }
        }
        Ok(())
    }

    /// Apply one completion report: finalize tablet ownership on success,
    /// then deliver the verdict to the recovery.
    fn finish_recovery_master(
        &mut self,
        recovery_id: RecoveryId,
        recovery_master_id: ServerId,
        recovered_tablets: Vec<RecoveredTablet>,
        successful: bool,
    ) -> anyhow::Result<()> {
        if !self.active.contains_key(&recovery_id) {
            tracing::error!(
                recovery_id = recovery_id.0,
                recovery_master = recovery_master_id.0,
                "recovery master reported completing a recovery but there is no ongoing recovery with that id"
            );
            return Ok(());
        }

        if successful {
            for tablet in &recovered_tablets {
                if let Err(err) = self.tablet_map.modify_tablet(
                    tablet.key,
                    tablet.recovery_master,
                    TabletStatus::Normal,
                    tablet.head,
                ) {
                    // The tablet map and the active recovery disagree about
                    // authoritative state; ownership can no longer be
                    // trusted.
                    tracing::error!(
                        error = ?err,
                        recovery_id = recovery_id.0,
                        table_id = tablet.key.table_id,
                        "recovered tablet is missing from the tablet map"
                    );
                    std::process::abort();
                }
            }
        } else {
            tracing::warn!(
                recovery_id = recovery_id.0,
                recovery_master = recovery_master_id.0,
                "a recovery master failed to recover its partition"
            );
        }

        let Some(recovery) = self.active.get_mut(&recovery_id) else {
            return Ok(());
        };
        let done = recovery.recovery_master_finished(recovery_master_id, successful, &self.tracker);
        if done {
            self.queue.schedule(ManagerTask::DriveRecovery(recovery_id));
        }
        Ok(())
    }

    /// Run one step of a recovery: the first drive hands out partitions, the
    /// final drive (once every verdict is in) settles the outcome and frees
    /// the recovery.
    fn drive_recovery(&mut self, recovery_id: RecoveryId) -> anyhow::Result<()> {
        let Some(recovery) = self.active.get_mut(&recovery_id) else {
            tracing::debug!(
                recovery_id = recovery_id.0,
                "drive for a recovery that is no longer active"
            );
            return Ok(());
        };
        if !recovery.started() {
            recovery.start(&self.tracker, self.starter.as_ref());
        }
        if recovery.is_done() {
            self.recovery_finished(recovery_id);
            self.destroy_and_free_recovery(recovery_id);
        }
        Ok(())
    }

    /// Settle a finished recovery: on complete success remove the crashed
    /// server from the membership and broadcast the change; otherwise
    /// requeue the same recovery parameters for another attempt. The next
    /// admission pass is scheduled on every success path, broadcast outcome
    /// notwithstanding.
    fn recovery_finished(&mut self, recovery_id: RecoveryId) {
        let Some(recovery) = self.active.get(&recovery_id) else {
            return;
        };
        let crashed = recovery.crashed_server_id();
        tracing::info!(
            server_id = crashed.0,
            recovery_id = recovery_id.0,
            "recovery completed for master"
        );
        if recovery.was_completely_successful() {
            let mut update = MembershipUpdate::default();
            match self.server_list.remove_for_update(crashed, &mut update) {
                Ok(()) => {
                    self.server_list.increment_version(&mut update);
                    if let Err(err) = self
                        .server_list
                        .send_membership_update(&update, &HashSet::new())
                    {
                        tracing::warn!(
                            error = ?err,
                            server_id = crashed.0,
                            version = update.version,
                            "membership update broadcast failed"
                        );
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        error = ?err,
                        server_id = crashed.0,
                        "crashed server already absent from server list; skipping membership update"
                    );
                }
            }
            self.queue.schedule(ManagerTask::MaybeStartRecovery);
        } else {
            tracing::info!(
                server_id = crashed.0,
                "recovery failed to recover some tablets, rescheduling another recovery"
            );
            let retry = Recovery::new(
                crashed,
                recovery.will().clone(),
                recovery.min_open_segment_id(),
            );
            // The enqueue task schedules the next admission pass itself.
            self.queue.schedule(ManagerTask::EnqueueRecovery(retry));
        }
    }

    /// Erase a settled recovery from the active set. Deferring this to after
    /// [`Self::recovery_finished`] keeps the slot occupied until the
    /// end-of-recovery broadcast has gone out, so a second recovery for the
    /// same server cannot start before it.
    fn destroy_and_free_recovery(&mut self, recovery_id: RecoveryId) {
        if let Some(recovery) = self.active.remove(&recovery_id) {
            tracing::info!(
                server_id = recovery.crashed_server_id().0,
                active_recoveries = self.active.len(),
                "recovery of server done"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::RecoveryMasterStart;
    use crate::server_list::MembershipBroadcaster;
    use crate::tablet_map::{TabletKey, Will, WillEntry};
    use crate::LogPosition;

    const MAX_STEPS: usize = 64;

    #[derive(Default)]
    struct RecordingStarter {
        starts: Mutex<Vec<RecoveryMasterStart>>,
    }

    impl RecoveryMasterStarter for RecordingStarter {
        fn start_partition(&self, start: &RecoveryMasterStart) -> anyhow::Result<()> {
            self.starts.lock().unwrap().push(start.clone());
            Ok(())
        }
    }

    impl RecordingStarter {
        fn starts(&self) -> Vec<RecoveryMasterStart> {
            self.starts.lock().unwrap().clone()
        }
    }

    #[derive(Clone, Default)]
    struct RecordingBroadcaster {
        updates: Arc<Mutex<Vec<MembershipUpdate>>>,
    }

    impl MembershipBroadcaster for RecordingBroadcaster {
        fn broadcast(
            &self,
            update: &MembershipUpdate,
            _exclude: &HashSet<ServerId>,
        ) -> anyhow::Result<()> {
            self.updates.lock().unwrap().push(update.clone());
            Ok(())
        }
    }

    struct Harness {
        manager: MasterRecoveryManager,
        server_list: Arc<CoordinatorServerList>,
        tablet_map: Arc<TabletMap>,
        starter: Arc<RecordingStarter>,
        broadcaster: RecordingBroadcaster,
    }

    fn harness(max_active_recoveries: usize) -> Harness {
        let broadcaster = RecordingBroadcaster::default();
        let server_list = Arc::new(CoordinatorServerList::with_broadcaster(Box::new(
            broadcaster.clone(),
        )));
        let tablet_map = Arc::new(TabletMap::new());
        let starter = Arc::new(RecordingStarter::default());
        let starter_seam: Arc<dyn RecoveryMasterStarter> = starter.clone();
        let manager = MasterRecoveryManager::new(
            RecoveryManagerConfig {
                max_active_recoveries,
            },
            Arc::clone(&server_list),
            Arc::clone(&tablet_map),
            starter_seam,
        );
        Harness {
            manager,
            server_list,
            tablet_map,
            starter,
            broadcaster,
        }
    }

    /// Perform queued tasks inline, without the worker thread, so tests are
    /// deterministic. Stops at quiescence or after `MAX_STEPS` tasks (a
    /// failed recovery with no masters left requeues itself forever).
    fn run_tasks(manager: &MasterRecoveryManager) -> usize {
        let mut steps = 0;
        while steps < MAX_STEPS {
            let Some(task) = manager.queue.try_next() else {
                break;
            };
            let mut state = manager.state.lock().unwrap();
            if let Err(err) = state.perform_task(task) {
                panic!("task failed: {err:#}");
            }
            steps += 1;
        }
        steps
    }

    fn tablet_key(table_id: u64) -> TabletKey {
        TabletKey::new(table_id, 0, u64::MAX)
    }

    fn will_for_tables(tables: &[(u64, u32)]) -> Will {
        Will::new(
            tables
                .iter()
                .map(|(table_id, partition)| WillEntry {
                    tablet: tablet_key(*table_id),
                    partition: *partition,
                })
                .collect(),
        )
    }

    /// Enlist a master owning one tablet per listed table, with the given
    /// partition plan.
    fn add_master_with_tablets(
        harness: &Harness,
        tables: &[(u64, u32)],
        min_open_segment_id: u64,
    ) -> ServerId {
        let server_id = harness
            .server_list
            .add_master(will_for_tables(tables), min_open_segment_id);
        for (table_id, _) in tables {
            harness
                .tablet_map
                .add_tablet(tablet_key(*table_id), server_id, LogPosition::default())
                .unwrap();
        }
        server_id
    }

    fn crash(harness: &Harness, server_id: ServerId) {
        harness.server_list.mark_crashed(server_id).unwrap();
        harness.manager.start_master_recovery(server_id).unwrap();
    }

    #[test]
    fn crash_of_tabletless_server_starts_no_recovery() {
        let harness = harness(1);
        let idle = harness.server_list.add_master(Will::default(), 0);
        add_master_with_tablets(&harness, &[(1, 0)], 0);

        harness.server_list.mark_crashed(idle).unwrap();
        harness.manager.start_master_recovery(idle).unwrap();
        run_tasks(&harness.manager);

        assert_eq!(harness.manager.waiting_recovery_count(), 0);
        assert_eq!(harness.manager.active_recovery_count(), 0);
        assert!(harness.starter.starts().is_empty());
        assert_eq!(
            harness.tablet_map.get(tablet_key(1)).unwrap().status,
            TabletStatus::Normal
        );
    }

    #[test]
    fn single_recovery_end_to_end_success() {
        let harness = harness(1);
        let crashed = add_master_with_tablets(&harness, &[(1, 0), (2, 0)], 5);
        let master = harness.server_list.add_master(Will::default(), 0);

        crash(&harness, crashed);
        run_tasks(&harness.manager);

        assert_eq!(harness.manager.active_recovery_count(), 1);
        let starts = harness.starter.starts();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].recovery_master, master);
        assert_eq!(starts[0].crashed_server, crashed);
        assert_eq!(starts[0].min_open_segment_id, 5);
        assert_eq!(starts[0].tablets.len(), 2);

        let head = LogPosition::new(3, 64);
        harness.manager.recovery_master_finished(
            starts[0].recovery_id,
            master,
            vec![
                RecoveredTablet {
                    key: tablet_key(1),
                    recovery_master: master,
                    head,
                },
                RecoveredTablet {
                    key: tablet_key(2),
                    recovery_master: master,
                    head,
                },
            ],
            true,
        );
        run_tasks(&harness.manager);

        for table_id in [1, 2] {
            let tablet = harness.tablet_map.get(tablet_key(table_id)).unwrap();
            assert_eq!(tablet.owner, master);
            assert_eq!(tablet.status, TabletStatus::Normal);
            assert_eq!(tablet.head, head);
        }
        assert!(!harness.server_list.contains(crashed));
        assert_eq!(harness.manager.active_recovery_count(), 0);
        assert_eq!(harness.manager.waiting_recovery_count(), 0);

        let updates = harness.broadcaster.updates.lock().unwrap().clone();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].removed, vec![crashed]);
        assert_eq!(updates[0].version, 1);
    }

    #[test]
    fn admission_respects_the_active_cap() {
        let harness = harness(1);
        let first = add_master_with_tablets(&harness, &[(1, 0)], 0);
        let second = add_master_with_tablets(&harness, &[(2, 0)], 0);
        let master = harness.server_list.add_master(Will::default(), 0);

        crash(&harness, first);
        crash(&harness, second);
        run_tasks(&harness.manager);

        assert_eq!(harness.manager.active_recovery_count(), 1);
        assert_eq!(harness.manager.waiting_recovery_count(), 1);
        let starts = harness.starter.starts();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].crashed_server, first);

        harness.manager.recovery_master_finished(
            starts[0].recovery_id,
            master,
            vec![RecoveredTablet {
                key: tablet_key(1),
                recovery_master: master,
                head: LogPosition::default(),
            }],
            true,
        );
        run_tasks(&harness.manager);

        // The completion broadcast freed the slot and admitted the second.
        assert_eq!(harness.manager.active_recovery_count(), 1);
        assert_eq!(harness.manager.waiting_recovery_count(), 0);
        let starts = harness.starter.starts();
        assert_eq!(starts.len(), 2);
        assert_eq!(starts[1].crashed_server, second);
    }

    #[test]
    fn failed_broadcast_does_not_block_waiting_recoveries() {
        struct FailingBroadcaster;

        impl MembershipBroadcaster for FailingBroadcaster {
            fn broadcast(
                &self,
                _update: &MembershipUpdate,
                _exclude: &HashSet<ServerId>,
            ) -> anyhow::Result<()> {
                anyhow::bail!("membership fan-out unreachable")
            }
        }

        let server_list = Arc::new(CoordinatorServerList::with_broadcaster(Box::new(
            FailingBroadcaster,
        )));
        let tablet_map = Arc::new(TabletMap::new());
        let starter = Arc::new(RecordingStarter::default());
        let starter_seam: Arc<dyn RecoveryMasterStarter> = starter.clone();
        let manager = MasterRecoveryManager::new(
            RecoveryManagerConfig {
                max_active_recoveries: 1,
            },
            Arc::clone(&server_list),
            Arc::clone(&tablet_map),
            starter_seam,
        );

        let first = server_list.add_master(will_for_tables(&[(1, 0)]), 0);
        tablet_map
            .add_tablet(tablet_key(1), first, LogPosition::default())
            .unwrap();
        let second = server_list.add_master(will_for_tables(&[(2, 0)]), 0);
        tablet_map
            .add_tablet(tablet_key(2), second, LogPosition::default())
            .unwrap();
        let master = server_list.add_master(Will::default(), 0);

        server_list.mark_crashed(first).unwrap();
        manager.start_master_recovery(first).unwrap();
        server_list.mark_crashed(second).unwrap();
        manager.start_master_recovery(second).unwrap();
        run_tasks(&manager);
        assert_eq!(manager.active_recovery_count(), 1);
        assert_eq!(manager.waiting_recovery_count(), 1);

        let starts = starter.starts();
        assert_eq!(starts.len(), 1);
        manager.recovery_master_finished(
            starts[0].recovery_id,
            master,
            vec![RecoveredTablet {
                key: tablet_key(1),
                recovery_master: master,
                head: LogPosition::default(),
            }],
            true,
        );
        run_tasks(&manager);

        // The broadcast failed, but the first recovery was still settled and
        // the admission pass still ran: the waiting recovery is now active.
        assert!(!server_list.contains(first));
        assert_eq!(manager.active_recovery_count(), 1);
        assert_eq!(manager.waiting_recovery_count(), 0);
        let starts = starter.starts();
        assert_eq!(starts.len(), 2);
        assert_eq!(starts[1].crashed_server, second);
    }

    #[test]
    fn duplicate_recovery_for_same_server_is_deferred() {
        let harness = harness(2);
        let crashed = add_master_with_tablets(&harness, &[(1, 0)], 0);
        let master = harness.server_list.add_master(Will::default(), 0);

        crash(&harness, crashed);
        run_tasks(&harness.manager);
        assert_eq!(harness.manager.active_recovery_count(), 1);

        // A second report of the same crash while the first recovery runs.
        harness.manager.start_master_recovery(crashed).unwrap();
        run_tasks(&harness.manager);
        assert_eq!(harness.manager.active_recovery_count(), 1);
        assert_eq!(harness.manager.waiting_recovery_count(), 1);

        let starts = harness.starter.starts();
        harness.manager.recovery_master_finished(
            starts[0].recovery_id,
            master,
            vec![RecoveredTablet {
                key: tablet_key(1),
                recovery_master: master,
                head: LogPosition::default(),
            }],
            true,
        );
        run_tasks(&harness.manager);

        // First freed, duplicate admitted.
        assert_eq!(harness.manager.active_recovery_count(), 1);
        assert_eq!(harness.manager.waiting_recovery_count(), 0);
        let starts = harness.starter.starts();
        assert_eq!(starts.len(), 2);
        assert_eq!(starts[1].crashed_server, crashed);
        assert_ne!(starts[1].recovery_id, starts[0].recovery_id);
    }

    #[test]
    fn crashed_recovery_master_fails_the_recovery_and_requeues() {
        let harness = harness(1);
        let crashed = add_master_with_tablets(&harness, &[(1, 0)], 9);
        let master = harness.server_list.add_master(Will::default(), 0);

        crash(&harness, crashed);
        run_tasks(&harness.manager);
        let starts = harness.starter.starts();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].recovery_master, master);

        // The recovery master crashes mid-recovery; a replacement joins.
        harness.server_list.mark_crashed(master).unwrap();
        let replacement = harness.server_list.add_master(Will::default(), 0);
        run_tasks(&harness.manager);

        // The failure verdict finished the recovery unsuccessfully and a
        // fresh attempt took its place on the replacement master.
        let starts = harness.starter.starts();
        assert_eq!(starts.len(), 2);
        assert_eq!(starts[1].crashed_server, crashed);
        assert_eq!(starts[1].recovery_master, replacement);
        assert_ne!(starts[1].recovery_id, starts[0].recovery_id);
        assert_eq!(starts[1].min_open_segment_id, 9);
        assert_eq!(harness.manager.active_recovery_count(), 1);
        assert!(harness.server_list.contains(crashed));
    }

    #[test]
    fn late_completion_report_is_logged_and_dropped() {
        let harness = harness(1);
        let crashed = add_master_with_tablets(&harness, &[(1, 0)], 0);
        let master = harness.server_list.add_master(Will::default(), 0);

        crash(&harness, crashed);
        run_tasks(&harness.manager);
        let starts = harness.starter.starts();
        let head = LogPosition::new(2, 16);
        let report = vec![RecoveredTablet {
            key: tablet_key(1),
            recovery_master: master,
            head,
        }];
        harness
            .manager
            .recovery_master_finished(starts[0].recovery_id, master, report.clone(), true);
        run_tasks(&harness.manager);
        assert_eq!(harness.manager.active_recovery_count(), 0);

        // The same report arrives again after the recovery was freed.
        harness
            .manager
            .recovery_master_finished(starts[0].recovery_id, master, report, true);
        run_tasks(&harness.manager);

        assert_eq!(harness.manager.active_recovery_count(), 0);
        assert_eq!(harness.manager.waiting_recovery_count(), 0);
        let tablet = harness.tablet_map.get(tablet_key(1)).unwrap();
        assert_eq!(tablet.owner, master);
        assert_eq!(tablet.head, head);
    }

    #[test]
    fn partial_failure_requeues_identical_parameters() {
        let harness = harness(1);
        let crashed = add_master_with_tablets(&harness, &[(1, 0), (2, 1)], 7);
        harness.server_list.add_master(Will::default(), 0);

        crash(&harness, crashed);
        run_tasks(&harness.manager);
        let starts = harness.starter.starts();
        assert_eq!(starts.len(), 2);
        let recovery_id = starts[0].recovery_id;

        // One partition fails, one succeeds: not completely successful.
        harness
            .manager
            .recovery_master_finished(recovery_id, starts[0].recovery_master, vec![], false);
        harness.manager.recovery_master_finished(
            recovery_id,
            starts[1].recovery_master,
            vec![RecoveredTablet {
                key: tablet_key(2),
                recovery_master: starts[1].recovery_master,
                head: LogPosition::default(),
            }],
            true,
        );
        run_tasks(&harness.manager);

        // A fresh attempt with the same parameters is running again.
        let state = harness.manager.state.lock().unwrap();
        assert_eq!(state.active.len(), 1);
        let retry = state.active.values().next().unwrap();
        assert_ne!(retry.id(), recovery_id);
        assert_eq!(retry.crashed_server_id(), crashed);
        assert_eq!(retry.will(), &will_for_tables(&[(1, 0), (2, 1)]));
        assert_eq!(retry.min_open_segment_id(), 7);
        assert!(harness.server_list.contains(crashed));
    }

    #[test]
    fn do_not_start_recoveries_gates_the_enqueue() {
        let harness = harness(1);
        let crashed = add_master_with_tablets(&harness, &[(1, 0)], 0);
        harness.server_list.add_master(Will::default(), 0);

        harness.manager.set_do_not_start_recoveries(true);
        crash(&harness, crashed);
        run_tasks(&harness.manager);
        assert_eq!(harness.manager.waiting_recovery_count(), 0);
        assert_eq!(harness.manager.active_recovery_count(), 0);
        // Tablets were still marked for recovery.
        assert_eq!(
            harness.tablet_map.get(tablet_key(1)).unwrap().status,
            TabletStatus::Recovering
        );

        harness.manager.set_do_not_start_recoveries(false);
        harness.manager.restart_master_recovery(crashed).unwrap();
        run_tasks(&harness.manager);
        assert_eq!(harness.manager.active_recovery_count(), 1);
    }

    #[test]
    fn active_recoveries_never_exceed_the_cap() {
        let harness = harness(2);
        let mut crashed = Vec::new();
        for table_id in 1..=4 {
            crashed.push(add_master_with_tablets(&harness, &[(table_id, 0)], 0));
        }
        harness.server_list.add_master(Will::default(), 0);
        harness.server_list.add_master(Will::default(), 0);

        for server_id in &crashed {
            crash(&harness, *server_id);
        }
        run_tasks(&harness.manager);

        assert_eq!(harness.manager.active_recovery_count(), 2);
        assert_eq!(harness.manager.waiting_recovery_count(), 2);
        // Each active recovery claimed its own recovery master.
        let starts = harness.starter.starts();
        assert_eq!(starts.len(), 2);
        assert_ne!(starts[0].recovery_master, starts[1].recovery_master);
    }

    #[test]
    fn start_and_halt_are_idempotent() {
        let mut harness = harness(1);
        harness.manager.start().unwrap();
        harness.manager.start().unwrap();
        harness.manager.halt();
        harness.manager.halt();
    }
}
