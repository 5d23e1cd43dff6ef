//! The [`MergeStore`] trait defining the persistence contract.
//!
//! Both backends implement it with identical semantics, so the service layer
//! can swap them without changing its logic. The trait is synchronous; the
//! service serializes access and bounds each call with a timeout.
//!
//! Every method that changes an aggregate takes the version the change was
//! based on and fails with [`StorageError::VersionConflict`] if the stored
//! version moved. State and history are written together or not at all.

use kinmerge_core::{FamilyCode, NodeRef, TreeSnapshot};

use crate::error::StorageError;
use crate::link::TreeLinkRequest;
use crate::merge::{HistoryEntry, MergeRequest};
use crate::types::{HistoryDraft, MergeRequestId, TreeLinkRequestId, UserRecord};

pub trait MergeStore {
    // -------------------------------------------------------------------
    // Family trees
    // -------------------------------------------------------------------

    /// Stores (or replaces) the tree of a family.
    fn save_tree(&mut self, family: &FamilyCode, tree: &TreeSnapshot) -> Result<(), StorageError>;

    /// Loads the tree of a family.
    fn load_tree(&self, family: &FamilyCode) -> Result<TreeSnapshot, StorageError>;

    // -------------------------------------------------------------------
    // Users
    // -------------------------------------------------------------------

    /// Registers (or replaces) a user in the phone index.
    fn register_user(&mut self, user: &UserRecord) -> Result<(), StorageError>;

    /// Finds the user registered under `phone_digits`.
    fn find_by_phone(&self, phone_digits: &str) -> Result<Option<UserRecord>, StorageError>;

    // -------------------------------------------------------------------
    // Merge requests
    // -------------------------------------------------------------------

    /// Persists a new request together with its first history entry.
    ///
    /// The store assigns the id; the returned request carries it.
    fn create_merge_request(
        &mut self,
        request: MergeRequest,
        entry: HistoryDraft,
    ) -> Result<MergeRequest, StorageError>;

    fn load_merge_request(&self, id: MergeRequestId) -> Result<MergeRequest, StorageError>;

    /// Replaces the stored request if its version is still
    /// `expected_version`, appending one history entry in the same commit.
    fn commit_merge_request(
        &mut self,
        request: &MergeRequest,
        expected_version: u64,
        entry: HistoryDraft,
    ) -> Result<HistoryEntry, StorageError>;

    /// Like [`MergeStore::commit_merge_request`], and additionally replaces
    /// the primary family's tree with `merged_tree` in the same commit.
    ///
    /// The stored primary tree must still hash to `base_tree_hash`
    /// ([`hash_snapshot`](crate::hash_snapshot)); otherwise nothing is
    /// written and [`StorageError::TreeChanged`] is returned.
    fn commit_merge_execution(
        &mut self,
        request: &MergeRequest,
        expected_version: u64,
        base_tree_hash: &str,
        entry: HistoryDraft,
        merged_tree: &TreeSnapshot,
    ) -> Result<HistoryEntry, StorageError>;

    /// All history entries of a request, oldest first.
    fn list_history(&self, id: MergeRequestId) -> Result<Vec<HistoryEntry>, StorageError>;

    fn history_entry(
        &self,
        id: MergeRequestId,
        version: u64,
    ) -> Result<HistoryEntry, StorageError>;

    // -------------------------------------------------------------------
    // Tree-link requests
    // -------------------------------------------------------------------

    /// Persists a new link request. The store assigns the id.
    fn insert_link(&mut self, request: TreeLinkRequest) -> Result<TreeLinkRequest, StorageError>;

    fn load_link(&self, id: TreeLinkRequestId) -> Result<TreeLinkRequest, StorageError>;

    /// Replaces the stored request if its version is still
    /// `expected_version`.
    fn update_link(
        &mut self,
        request: &TreeLinkRequest,
        expected_version: u64,
    ) -> Result<(), StorageError>;

    /// The pending request between two nodes, in either direction.
    fn find_pending_link(
        &self,
        a: &NodeRef,
        b: &NodeRef,
    ) -> Result<Option<TreeLinkRequest>, StorageError>;

    /// Executed requests with either end in `family`, ordered by id.
    fn list_executed_links(
        &self,
        family: &FamilyCode,
    ) -> Result<Vec<TreeLinkRequest>, StorageError>;
}
