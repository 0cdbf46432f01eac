//! Authoritative tablet ownership for the cluster.
//!
//! Tablets are contiguous key-hash ranges within a table, each owned by one
//! master at a time. The map is internally synchronized; callers compose
//! multi-tablet changes out of the atomic operations below.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::{LogPosition, ServerId};

/// Serving state of a tablet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TabletStatus {
    /// Owned and served normally.
    Normal,
    /// The owner crashed; the tablet is being reconstructed.
    Recovering,
}

/// The exact triple that keys the tablet map.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TabletKey {
    pub table_id: u64,
    pub start_key_hash: u64,
    pub end_key_hash: u64,
}

impl TabletKey {
    pub const fn new(table_id: u64, start_key_hash: u64, end_key_hash: u64) -> Self {
        Self {
            table_id,
            start_key_hash,
            end_key_hash,
        }
    }
}

/// One tablet: a key-hash range, its owner, and the log-head position the
/// owner was assigned the range at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tablet {
    pub key: TabletKey,
    pub owner: ServerId,
    pub status: TabletStatus,
    pub head: LogPosition,
}

/// One entry of a recovery master's completion report. The recovery master
/// fills in its own id; `head` is the log-head position recorded by the
/// coordinator at the start of the recovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveredTablet {
    pub key: TabletKey,
    pub recovery_master: ServerId,
    pub head: LogPosition,
}

/// One slot of a partition plan: a tablet tagged with the partition it is
/// reconstructed under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WillEntry {
    pub tablet: TabletKey,
    pub partition: u32,
}

/// A master's partition plan: the ordered list of its tablets, each tagged
/// with a partition index. Partition indices start at 0 and are consecutive;
/// recovery covers partitions up to but excluding the first empty one.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Will {
    entries: Vec<WillEntry>,
}

impl Will {
    pub fn new(entries: Vec<WillEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[WillEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of partitions in the leading non-empty prefix.
    pub fn recoverable_partitions(&self) -> u32 {
        let mut partition = 0;
        while self.entries.iter().any(|e| e.partition == partition) {
            partition += 1;
        }
        partition
    }

    pub fn partition_entries(&self, partition: u32) -> impl Iterator<Item = &WillEntry> {
        self.entries.iter().filter(move |e| e.partition == partition)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct TabletRecord {
    owner: ServerId,
    status: TabletStatus,
    head: LogPosition,
}

/// In-memory tablet map held by the coordinator.
pub struct TabletMap {
    tablets: Mutex<BTreeMap<TabletKey, TabletRecord>>,
}

impl Default for TabletMap {
    fn default() -> Self {
        Self::new()
    }
}

impl TabletMap {
    pub fn new() -> Self {
        Self {
            tablets: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register a new tablet under `owner`. Refuses to clobber an existing
    /// assignment for the same key range.
    pub fn add_tablet(
        &self,
        key: TabletKey,
        owner: ServerId,
        head: LogPosition,
    ) -> anyhow::Result<()> {
        let mut tablets = self.tablets.lock().unwrap();
        if tablets.contains_key(&key) {
            anyhow::bail!(
                "tablet already exists: table {} [{:#x}, {:#x}]",
                key.table_id,
                key.start_key_hash,
                key.end_key_hash
            );
        }
        tablets.insert(
            key,
            TabletRecord {
                owner,
                status: TabletStatus::Normal,
                head,
            },
        );
        Ok(())
    }

    pub fn get(&self, key: TabletKey) -> Option<Tablet> {
        let tablets = self.tablets.lock().unwrap();
        tablets.get(&key).map(|record| Tablet {
            key,
            owner: record.owner,
            status: record.status,
            head: record.head,
        })
    }

    /// Atomically mark every tablet owned by `server` with `status` and
    /// return the affected tablets in key order. The list is empty when the
    /// server owned nothing.
    pub fn set_status_for_server(&self, server: ServerId, status: TabletStatus) -> Vec<Tablet> {
        let mut tablets = self.tablets.lock().unwrap();
        let mut affected = Vec::new();
        for (key, record) in tablets.iter_mut() {
            if record.owner != server {
                continue;
            }
            record.status = status;
            affected.push(Tablet {
                key: *key,
                owner: record.owner,
                status: record.status,
                head: record.head,
            });
        }
        affected
    }

    /// Reassign one tablet. Fails if the exact key triple is absent.
    pub fn modify_tablet(
        &self,
        key: TabletKey,
        new_owner: ServerId,
        status: TabletStatus,
        head: LogPosition,
    ) -> anyhow::Result<()> {
        let mut tablets = self.tablets.lock().unwrap();
        let Some(record) = tablets.get_mut(&key) else {
            anyhow::bail!(
                "no tablet for table {} [{:#x}, {:#x}]",
                key.table_id,
                key.start_key_hash,
                key.end_key_hash
            );
        };
        record.owner = new_owner;
        record.status = status;
        record.head = head;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tablets.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every tablet, for operator debugging.
    pub fn to_json(&self) -> anyhow::Result<String> {
        let tablets = self.tablets.lock().unwrap();
        let snapshot: Vec<Tablet> = tablets
            .iter()
            .map(|(key, record)| Tablet {
                key: *key,
                owner: record.owner,
                status: record.status,
                head: record.head,
            })
            .collect();
        Ok(serde_json::to_string(&snapshot)?)
    }
}
