//! Local mirror of cluster membership used to drive recoveries.
//!
//! The tracker buffers the server list's change stream for the recovery
//! manager to drain from its own task context, and keeps one writable slot
//! per server: the id of the recovery (if any) currently using that server
//! as a recovery master. Slots hold ids rather than references, so a slot
//! left behind by a freed recovery is harmless.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use crate::server_list::{MembershipSubscriber, ServerChangeEvent, ServerDetails, ServerStatus};
use crate::{RecoveryId, ServerId};

struct TrackedServer {
    details: ServerDetails,
    recovery: Option<RecoveryId>,
}

struct TrackerState {
    servers: BTreeMap<ServerId, TrackedServer>,
    changes: VecDeque<(ServerDetails, ServerChangeEvent)>,
    /// Server whose removal was delivered by the previous `get_change` call.
    /// The mirror entry stays readable until the next call so the caller can
    /// still consult the slot of the server it was just told about.
    pending_removal: Option<ServerId>,
}

type ChangeHook = Box<dyn Fn() + Send + Sync>;

pub struct RecoveryTracker {
    state: Mutex<TrackerState>,
    hook: Mutex<Option<ChangeHook>>,
}

impl Default for RecoveryTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState {
                servers: BTreeMap::new(),
                changes: VecDeque::new(),
                pending_removal: None,
            }),
            hook: Mutex::new(None),
        }
    }

    /// Install the callable fired after changes are buffered. The recovery
    /// manager points this at its task queue; the hook must do nothing but
    /// schedule.
    pub fn set_change_hook(&self, hook: ChangeHook) {
        *self.hook.lock().unwrap() = Some(hook);
    }

    /// Drain one buffered change, updating the local mirror. Changes come
    /// out in the order the server list emitted them.
    pub fn get_change(&self) -> Option<(ServerDetails, ServerChangeEvent)> {
        let mut state = self.state.lock().unwrap();
        if let Some(server_id) = state.pending_removal.take() {
            state.servers.remove(&server_id);
        }
        let (details, event) = state.changes.pop_front()?;
        match event {
            ServerChangeEvent::Added => {
                state.servers.insert(
                    details.server_id,
                    TrackedServer {
                        details: details.clone(),
                        recovery: None,
                    },
                );
            }
            ServerChangeEvent::Crashed => {
                if let Some(tracked) = state.servers.get_mut(&details.server_id) {
                    tracked.details.status = ServerStatus::Crashed;
                }
            }
            ServerChangeEvent::Removed => {
                if let Some(tracked) = state.servers.get_mut(&details.server_id) {
                    tracked.details.status = ServerStatus::Removed;
                }
                state.pending_removal = Some(details.server_id);
            }
        }
        Some((details, event))
    }

    pub fn pending_changes(&self) -> usize {
        self.state.lock().unwrap().changes.len()
    }

    /// The recovery currently using `server` as a recovery master.
    pub fn recovery_for(&self, server: ServerId) -> Option<RecoveryId> {
        let state = self.state.lock().unwrap();
        state.servers.get(&server).and_then(|t| t.recovery)
    }

    pub fn set_recovery(&self, server: ServerId, recovery: RecoveryId) {
        let mut state = self.state.lock().unwrap();
        if let Some(tracked) = state.servers.get_mut(&server) {
            tracked.recovery = Some(recovery);
        }
    }

    pub fn clear_recovery(&self, server: ServerId) {
        let mut state = self.state.lock().unwrap();
        if let Some(tracked) = state.servers.get_mut(&server) {
            tracked.recovery = None;
        }
    }

    /// Servers `recovery` may use as recovery masters: up, not the crashed
    /// server being recovered, and not claimed by a different recovery. A
    /// slot already held by `recovery` itself stays claimable.
    pub fn claimable_masters(&self, exclude: ServerId, recovery: RecoveryId) -> Vec<ServerId> {
        let state = self.state.lock().unwrap();
        state
            .servers
            .values()
            .filter(|t| {
                t.details.status == ServerStatus::Up
                    && t.details.server_id != exclude
                    && t.recovery.map_or(true, |r| r == recovery)
            })
            .map(|t| t.details.server_id)
            .collect()
    }
}

impl MembershipSubscriber for RecoveryTracker {
    fn enqueue_change(&self, details: ServerDetails, event: ServerChangeEvent) {
        let mut state = self.state.lock().unwrap();
        state.changes.push_back((details, event));
    }

    fn changes_enqueued(&self) {
        let hook = self.hook.lock().unwrap();
        if let Some(hook) = hook.as_ref() {
            hook();
        }
    }
}
