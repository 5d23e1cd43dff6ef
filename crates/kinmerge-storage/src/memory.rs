//! In-memory implementation of [`MergeStore`].
//!
//! [`InMemoryStore`] is a first-class backend for tests and offline runs. It
//! keeps everything in maps with the same semantics as the SQLite backend:
//! ids are assigned from 1, version checks happen before any write, and a
//! failed commit leaves nothing behind.

use std::collections::{BTreeMap, HashMap};

use kinmerge_core::{FamilyCode, NodeRef, TreeSnapshot};

use crate::error::StorageError;
use crate::hash::hash_snapshot;
use crate::link::{LinkStatus, TreeLinkRequest};
use crate::merge::{HistoryEntry, MergeRequest};
use crate::traits::MergeStore;
use crate::types::{HistoryDraft, MergeRequestId, TreeLinkRequestId, UserRecord};

#[derive(Debug, Default)]
pub struct InMemoryStore {
    trees: HashMap<FamilyCode, TreeSnapshot>,
    users: HashMap<String, UserRecord>,
    merge_requests: BTreeMap<MergeRequestId, MergeRequest>,
    history: BTreeMap<MergeRequestId, Vec<HistoryEntry>>,
    links: BTreeMap<TreeLinkRequestId, TreeLinkRequest>,
    next_merge_id: i64,
    next_link_id: i64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_version(
        &self,
        id: MergeRequestId,
        expected_version: u64,
    ) -> Result<(), StorageError> {
        let current = self
            .merge_requests
            .get(&id)
            .ok_or(StorageError::MergeRequestNotFound(id.0))?;
        if current.version != expected_version {
            return Err(StorageError::VersionConflict {
                expected: expected_version,
                actual: current.version,
            });
        }
        Ok(())
    }

    fn write_merge(&mut self, request: &MergeRequest, entry: HistoryDraft) -> HistoryEntry {
        let entry = HistoryEntry::from_draft(entry, request);
        self.merge_requests.insert(request.id, request.clone());
        self.history
            .entry(request.id)
            .or_default()
            .push(entry.clone());
        entry
    }
}

impl MergeStore for InMemoryStore {
    fn save_tree(&mut self, family: &FamilyCode, tree: &TreeSnapshot) -> Result<(), StorageError> {
        self.trees.insert(family.clone(), tree.clone());
        Ok(())
    }

    fn load_tree(&self, family: &FamilyCode) -> Result<TreeSnapshot, StorageError> {
        self.trees
            .get(family)
            .cloned()
            .ok_or_else(|| StorageError::FamilyNotFound(family.to_string()))
    }

    fn register_user(&mut self, user: &UserRecord) -> Result<(), StorageError> {
        self.users.retain(|_, u| u.user_id != user.user_id);
        self.users.insert(user.phone_digits.clone(), user.clone());
        Ok(())
    }

    fn find_by_phone(&self, phone_digits: &str) -> Result<Option<UserRecord>, StorageError> {
        Ok(self.users.get(phone_digits).cloned())
    }

    fn create_merge_request(
        &mut self,
        mut request: MergeRequest,
        entry: HistoryDraft,
    ) -> Result<MergeRequest, StorageError> {
        self.next_merge_id += 1;
        request.id = MergeRequestId(self.next_merge_id);
        self.write_merge(&request, entry);
        Ok(request)
    }

    fn load_merge_request(&self, id: MergeRequestId) -> Result<MergeRequest, StorageError> {
        self.merge_requests
            .get(&id)
            .cloned()
            .ok_or(StorageError::MergeRequestNotFound(id.0))
    }

    fn commit_merge_request(
        &mut self,
        request: &MergeRequest,
        expected_version: u64,
        entry: HistoryDraft,
    ) -> Result<HistoryEntry, StorageError> {
        self.check_version(request.id, expected_version)?;
        Ok(self.write_merge(request, entry))
    }

    fn commit_merge_execution(
        &mut self,
        request: &MergeRequest,
        expected_version: u64,
        base_tree_hash: &str,
        entry: HistoryDraft,
        merged_tree: &TreeSnapshot,
    ) -> Result<HistoryEntry, StorageError> {
        self.check_version(request.id, expected_version)?;
        let current = self.load_tree(&request.primary_family_code)?;
        if hash_snapshot(&current)? != base_tree_hash {
            return Err(StorageError::TreeChanged {
                family: request.primary_family_code.to_string(),
            });
        }
        self.trees
            .insert(request.primary_family_code.clone(), merged_tree.clone());
        Ok(self.write_merge(request, entry))
    }

    fn list_history(&self, id: MergeRequestId) -> Result<Vec<HistoryEntry>, StorageError> {
        if !self.merge_requests.contains_key(&id) {
            return Err(StorageError::MergeRequestNotFound(id.0));
        }
        Ok(self.history.get(&id).cloned().unwrap_or_default())
    }

    fn history_entry(
        &self,
        id: MergeRequestId,
        version: u64,
    ) -> Result<HistoryEntry, StorageError> {
        self.list_history(id)?
            .into_iter()
            .find(|e| e.version == version)
            .ok_or(StorageError::HistoryEntryNotFound {
                merge_request: id.0,
                version,
            })
    }

    fn insert_link(&mut self, mut request: TreeLinkRequest) -> Result<TreeLinkRequest, StorageError> {
        self.next_link_id += 1;
        request.id = TreeLinkRequestId(self.next_link_id);
        self.links.insert(request.id, request.clone());
        Ok(request)
    }

    fn load_link(&self, id: TreeLinkRequestId) -> Result<TreeLinkRequest, StorageError> {
        self.links
            .get(&id)
            .cloned()
            .ok_or(StorageError::LinkRequestNotFound(id.0))
    }

    fn update_link(
        &mut self,
        request: &TreeLinkRequest,
        expected_version: u64,
    ) -> Result<(), StorageError> {
        let current = self
            .links
            .get_mut(&request.id)
            .ok_or(StorageError::LinkRequestNotFound(request.id.0))?;
        if current.version != expected_version {
            return Err(StorageError::VersionConflict {
                expected: expected_version,
                actual: current.version,
            });
        }
        *current = request.clone();
        Ok(())
    }

    fn find_pending_link(
        &self,
        a: &NodeRef,
        b: &NodeRef,
    ) -> Result<Option<TreeLinkRequest>, StorageError> {
        Ok(self
            .links
            .values()
            .find(|l| l.status == LinkStatus::Pending && l.same_pair(a, b))
            .cloned())
    }

    fn list_executed_links(
        &self,
        family: &FamilyCode,
    ) -> Result<Vec<TreeLinkRequest>, StorageError> {
        Ok(self
            .links
            .values()
            .filter(|l| l.status == LinkStatus::Executed && l.touches(family.as_str()))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kinmerge_core::{Person, PersonId, RelationshipType, SourceTree};
    use serde_json::json;

    fn family(code: &str) -> FamilyCode {
        FamilyCode::new(code)
    }

    fn draft() -> MergeRequest {
        MergeRequest::draft(family("PRI"), family("SEC"), "alice", Utc::now())
    }

    fn link(sender: u32, receiver: u32) -> TreeLinkRequest {
        let now = Utc::now();
        TreeLinkRequest {
            id: TreeLinkRequestId(0),
            sender: NodeRef::new(family("A"), PersonId(sender)),
            receiver: NodeRef::new(family("B"), PersonId(receiver)),
            relationship: RelationshipType::Sibling,
            parent_role: None,
            status: LinkStatus::Pending,
            created_by: "alice".into(),
            confirm_override: false,
            execution_error: None,
            executed: None,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    #[test]
    fn tree_round_trip() {
        let mut store = InMemoryStore::new();
        let snapshot = TreeSnapshot {
            people: vec![Person::new(PersonId(1), "Root", 0, SourceTree::Primary)],
            edges: vec![],
        };
        store.save_tree(&family("PRI"), &snapshot).unwrap();
        assert_eq!(store.load_tree(&family("PRI")).unwrap(), snapshot);
        assert!(matches!(
            store.load_tree(&family("NOPE")),
            Err(StorageError::FamilyNotFound(_))
        ));
    }

    #[test]
    fn create_assigns_ids_and_first_history_entry() {
        let mut store = InMemoryStore::new();
        let first = store
            .create_merge_request(draft(), HistoryDraft::new("alice", "initiated", json!({})))
            .unwrap();
        let second = store
            .create_merge_request(draft(), HistoryDraft::new("alice", "initiated", json!({})))
            .unwrap();
        assert_eq!(first.id, MergeRequestId(1));
        assert_eq!(second.id, MergeRequestId(2));

        let history = store.list_history(first.id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].version, 1);
        assert_eq!(history[0].snapshot, first);
    }

    #[test]
    fn stale_commit_is_rejected_without_writing() {
        let mut store = InMemoryStore::new();
        let created = store
            .create_merge_request(draft(), HistoryDraft::new("alice", "initiated", json!({})))
            .unwrap();

        let mut next = created.clone();
        next.touch("bob", Utc::now());
        store
            .commit_merge_request(&next, 1, HistoryDraft::new("bob", "edit", json!({})))
            .unwrap();

        let mut stale = created.clone();
        stale.touch("carol", Utc::now());
        let err = store
            .commit_merge_request(&stale, 1, HistoryDraft::new("carol", "edit", json!({})))
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::VersionConflict {
                expected: 1,
                actual: 2
            }
        ));
        assert_eq!(store.list_history(created.id).unwrap().len(), 2);
        assert_eq!(
            store.load_merge_request(created.id).unwrap().meta.last_updated_by,
            "bob"
        );
    }

    #[test]
    fn execution_replaces_primary_tree() {
        let mut store = InMemoryStore::new();
        let created = store
            .create_merge_request(draft(), HistoryDraft::new("alice", "initiated", json!({})))
            .unwrap();
        store.save_tree(&family("PRI"), &TreeSnapshot::default()).unwrap();
        let base = hash_snapshot(&TreeSnapshot::default()).unwrap();
        let merged = TreeSnapshot {
            people: vec![Person::new(PersonId(7), "Merged", 0, SourceTree::Primary)],
            edges: vec![],
        };
        let mut next = created.clone();
        next.touch("alice", Utc::now());
        store
            .commit_merge_execution(
                &next,
                1,
                &base,
                HistoryDraft::new("alice", "execute", json!({})),
                &merged,
            )
            .unwrap();
        assert_eq!(store.load_tree(&family("PRI")).unwrap(), merged);
    }

    #[test]
    fn execution_over_a_changed_tree_is_refused() {
        let mut store = InMemoryStore::new();
        let created = store
            .create_merge_request(draft(), HistoryDraft::new("alice", "initiated", json!({})))
            .unwrap();
        store.save_tree(&family("PRI"), &TreeSnapshot::default()).unwrap();
        let base = hash_snapshot(&TreeSnapshot::default()).unwrap();

        // Another writer replaces the tree after `base` was taken.
        let concurrent = TreeSnapshot {
            people: vec![Person::new(PersonId(3), "Other", 0, SourceTree::Primary)],
            edges: vec![],
        };
        store.save_tree(&family("PRI"), &concurrent).unwrap();

        let mut next = created.clone();
        next.touch("alice", Utc::now());
        let err = store
            .commit_merge_execution(
                &next,
                1,
                &base,
                HistoryDraft::new("alice", "execute", json!({})),
                &TreeSnapshot::default(),
            )
            .unwrap_err();
        assert!(matches!(err, StorageError::TreeChanged { ref family } if family == "PRI"));
        assert_eq!(store.load_tree(&family("PRI")).unwrap(), concurrent);
        assert_eq!(store.load_merge_request(created.id).unwrap().version, 1);
    }

    #[test]
    fn pending_link_lookup_ignores_direction_and_status() {
        let mut store = InMemoryStore::new();
        let inserted = store.insert_link(link(1, 2)).unwrap();
        let a = NodeRef::new(family("A"), PersonId(1));
        let b = NodeRef::new(family("B"), PersonId(2));

        assert_eq!(
            store.find_pending_link(&b, &a).unwrap().map(|l| l.id),
            Some(inserted.id)
        );

        let mut revoked = inserted.clone();
        revoked.status = LinkStatus::Revoked;
        revoked.version = 2;
        store.update_link(&revoked, 1).unwrap();
        assert!(store.find_pending_link(&a, &b).unwrap().is_none());
        assert!(matches!(
            store.update_link(&revoked, 1),
            Err(StorageError::VersionConflict { .. })
        ));
    }

    #[test]
    fn phone_index_replaces_previous_number() {
        let mut store = InMemoryStore::new();
        let mut user = UserRecord {
            user_id: "u1".into(),
            name: "Asha".into(),
            phone_digits: "9876543210".into(),
            family_code: Some(family("PRI")),
        };
        store.register_user(&user).unwrap();
        user.phone_digits = "9000000000".into();
        store.register_user(&user).unwrap();

        assert!(store.find_by_phone("9876543210").unwrap().is_none());
        assert_eq!(store.find_by_phone("9000000000").unwrap(), Some(user));
    }
}
