//! Authoritative cluster membership and the membership-update broadcast path.
//!
//! The list assigns server ids, records per-master recovery metadata (the
//! partition plan and the minimum open segment bound), and fans every change
//! out to registered trackers in emission order. Membership deltas are
//! composed with [`CoordinatorServerList::remove_for_update`] and
//! [`CoordinatorServerList::increment_version`], then pushed to the cluster
//! through the [`MembershipBroadcaster`] seam.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::tablet_map::Will;
use crate::ServerId;

/// Membership state of a server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerStatus {
    Up,
    Crashed,
    Removed,
}

/// One server list entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerDetails {
    pub server_id: ServerId,
    pub status: ServerStatus,
    /// Partition plan used to reconstruct this master's tablets.
    pub will: Will,
    /// Replicas of log segments older than this are ignored during recovery.
    pub min_open_segment_id: u64,
}

/// Kinds of change delivered to registered trackers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerChangeEvent {
    Added,
    Crashed,
    Removed,
}

/// A versioned membership delta broadcast to the cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipUpdate {
    pub version: u64,
    pub removed: Vec<ServerId>,
}

/// Fan-out seam for membership updates. The production implementation pushes
/// the update to every cluster member over RPC; this crate only composes the
/// delta.
pub trait MembershipBroadcaster: Send + Sync {
    fn broadcast(
        &self,
        update: &MembershipUpdate,
        exclude: &HashSet<ServerId>,
    ) -> anyhow::Result<()>;
}

/// Default broadcaster: records the update in the log and nothing else.
pub struct LoggingBroadcaster;

impl MembershipBroadcaster for LoggingBroadcaster {
    fn broadcast(
        &self,
        update: &MembershipUpdate,
        exclude: &HashSet<ServerId>,
    ) -> anyhow::Result<()> {
        tracing::info!(
            version = update.version,
            removed = ?update.removed,
            excluded = exclude.len(),
            "broadcasting membership update"
        );
        Ok(())
    }
}

/// Receives the server list's change stream. Implemented by trackers.
pub trait MembershipSubscriber: Send + Sync {
    /// Buffer one change. Called in emission order.
    fn enqueue_change(&self, details: ServerDetails, event: ServerChangeEvent);
    /// Fired after one or more changes have been buffered.
    fn changes_enqueued(&self);
}

struct ListState {
    servers: BTreeMap<ServerId, ServerDetails>,
    version: u64,
    next_id: u64,
    subscribers: Vec<Arc<dyn MembershipSubscriber>>,
}

/// The coordinator's authoritative server list.
pub struct CoordinatorServerList {
    state: Mutex<ListState>,
    broadcaster: Box<dyn MembershipBroadcaster>,
}

impl Default for CoordinatorServerList {
    fn default() -> Self {
        Self::new()
    }
}

impl CoordinatorServerList {
    pub fn new() -> Self {
        Self::with_broadcaster(Box::new(LoggingBroadcaster))
    }

    pub fn with_broadcaster(broadcaster: Box<dyn MembershipBroadcaster>) -> Self {
        Self {
            state: Mutex::new(ListState {
                servers: BTreeMap::new(),
                version: 0,
                next_id: 1,
                subscribers: Vec::new(),
            }),
            broadcaster,
        }
    }

    /// Register a change subscriber and replay the current membership to it
    /// as `Added` changes, so its mirror starts in sync.
    pub fn register_tracker(&self, subscriber: Arc<dyn MembershipSubscriber>) {
        let existing: Vec<ServerDetails> = {
            let mut state = self.state.lock().unwrap();
            state.subscribers.push(Arc::clone(&subscriber));
            state.servers.values().cloned().collect()
        };
        if existing.is_empty() {
            return;
        }
        for details in existing {
            subscriber.enqueue_change(details, ServerChangeEvent::Added);
        }
        subscriber.changes_enqueued();
    }

    /// Enlist a new master with its recovery metadata. Returns the assigned
    /// id.
    pub fn add_master(&self, will: Will, min_open_segment_id: u64) -> ServerId {
        let (details, subscribers) = {
            let mut state = self.state.lock().unwrap();
            let server_id = ServerId(state.next_id);
            state.next_id += 1;
            let details = ServerDetails {
                server_id,
                status: ServerStatus::Up,
                will,
                min_open_segment_id,
            };
            state.servers.insert(server_id, details.clone());
            (details, state.subscribers.clone())
        };
        tracing::info!(server_id = details.server_id.0, "master added to server list");
        notify(&subscribers, details.clone(), ServerChangeEvent::Added);
        details.server_id
    }

    /// Replace a master's partition plan and segment bound.
    pub fn update_recovery_info(
        &self,
        server_id: ServerId,
        will: Will,
        min_open_segment_id: u64,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(details) = state.servers.get_mut(&server_id) else {
            anyhow::bail!("server {server_id} is not in the server list");
        };
        details.will = will;
        details.min_open_segment_id = min_open_segment_id;
        Ok(())
    }

    /// Look up a server's entry.
    pub fn details(&self, server_id: ServerId) -> anyhow::Result<ServerDetails> {
        let state = self.state.lock().unwrap();
        state
            .servers
            .get(&server_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("server {server_id} is not in the server list"))
    }

    pub fn contains(&self, server_id: ServerId) -> bool {
        self.state.lock().unwrap().servers.contains_key(&server_id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn version(&self) -> u64 {
        self.state.lock().unwrap().version
    }

    /// Mark a server crashed and deliver the change to trackers.
    pub fn mark_crashed(&self, server_id: ServerId) -> anyhow::Result<()> {
        let (details, subscribers) = {
            let mut state = self.state.lock().unwrap();
            let Some(details) = state.servers.get_mut(&server_id) else {
                anyhow::bail!("server {server_id} is not in the server list");
            };
            details.status = ServerStatus::Crashed;
            (details.clone(), state.subscribers.clone())
        };
        tracing::info!(server_id = server_id.0, "server marked crashed");
        notify(&subscribers, details, ServerChangeEvent::Crashed);
        Ok(())
    }

    /// Drop a server from the list, record it in `update`, and deliver the
    /// change to trackers. The version is bumped separately by
    /// [`Self::increment_version`].
    pub fn remove_for_update(
        &self,
        server_id: ServerId,
        update: &mut MembershipUpdate,
    ) -> anyhow::Result<()> {
        let (mut details, subscribers) = {
            let mut state = self.state.lock().unwrap();
            let Some(details) = state.servers.remove(&server_id) else {
                anyhow::bail!("server {server_id} is not in the server list");
            };
            (details, state.subscribers.clone())
        };
        details.status = ServerStatus::Removed;
        update.removed.push(server_id);
        tracing::info!(server_id = server_id.0, "server removed from server list");
        notify(&subscribers, details, ServerChangeEvent::Removed);
        Ok(())
    }

    /// Bump the list version and stamp it on `update`.
    pub fn increment_version(&self, update: &mut MembershipUpdate) {
        let mut state = self.state.lock().unwrap();
        state.version += 1;
        update.version = state.version;
    }

    /// Push a composed membership delta to the cluster.
    pub fn send_membership_update(
        &self,
        update: &MembershipUpdate,
        exclude: &HashSet<ServerId>,
    ) -> anyhow::Result<()> {
        self.broadcaster.broadcast(update, exclude)
    }

    /// Snapshot of every entry, for operator debugging.
    pub fn to_json(&self) -> anyhow::Result<String> {
        let state = self.state.lock().unwrap();
        let snapshot: Vec<&ServerDetails> = state.servers.values().collect();
        Ok(serde_json::to_string(&snapshot)?)
    }
}

fn notify(
    subscribers: &[Arc<dyn MembershipSubscriber>],
    details: ServerDetails,
    event: ServerChangeEvent,
) {
    for subscriber in subscribers {
        subscriber.enqueue_change(details.clone(), event);
        subscriber.changes_enqueued();
    }
}
