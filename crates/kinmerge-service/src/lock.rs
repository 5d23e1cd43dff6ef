//! Per-aggregate async locks.
//!
//! [`AggregateLocks`] hands out one `tokio::sync::Mutex` per aggregate key,
//! so at most one mutation per merge request, link request, or family tree
//! is in flight. A holder of several keys takes `Family` and `LinkGraph`
//! last.
//! Entries are created on demand in a `DashMap` and pruned once unused.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use kinmerge_core::{FamilyCode, NodeRef};
use kinmerge_storage::{MergeRequestId, TreeLinkRequestId};

/// Identifies one lockable aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AggregateKey {
    Merge(MergeRequestId),
    Link(TreeLinkRequestId),
    /// The unordered node pair of a link request, held while creating one.
    LinkPair(NodeRef, NodeRef),
    /// A family's stored tree, held while a merge rewrites it.
    Family(FamilyCode),
    /// The set of executed links, held while one more is executed.
    LinkGraph,
}

impl AggregateKey {
    /// Key for a node pair regardless of direction.
    pub fn link_pair(a: &NodeRef, b: &NodeRef) -> Self {
        if a <= b {
            AggregateKey::LinkPair(a.clone(), b.clone())
        } else {
            AggregateKey::LinkPair(b.clone(), a.clone())
        }
    }
}

#[derive(Debug, Default)]
pub struct AggregateLocks {
    locks: DashMap<AggregateKey, Arc<Mutex<()>>>,
}

impl AggregateLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`.
    pub async fn acquire(&self, key: AggregateKey) -> OwnedMutexGuard<()> {
        // Clone the mutex out so the map shard is not held across the await.
        let mutex = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Drops entries nobody holds or waits on.
    pub fn prune(&self) {
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
