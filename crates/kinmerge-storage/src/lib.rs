//! Persistence for kinmerge: family trees, merge requests with their audit
//! history, tree-link requests, and the user phone index.
//!
//! [`MergeStore`] is the storage contract. [`InMemoryStore`] and
//! [`SqliteStore`] implement it with the same optimistic-concurrency
//! semantics: every aggregate carries a version, and a write based on a stale
//! version fails with [`StorageError::VersionConflict`] without side effects.
//!
//! # Modules
//!
//! - [`error`]: StorageError enum with all failure modes
//! - [`types`]: ids, user records, history drafts
//! - [`merge`]: the merge request aggregate and its history entries
//! - [`link`]: the tree-link request aggregate
//! - [`traits`]: MergeStore trait definition
//! - [`hash`]: blake3 content hashes of final trees and stored snapshots
//! - [`memory`]: InMemoryStore implementation
//! - [`schema`]: connection setup and migrations
//! - [`sqlite`]: SqliteStore implementation

pub mod error;
pub mod hash;
pub mod link;
pub mod memory;
pub mod merge;
pub mod schema;
pub mod sqlite;
pub mod traits;
pub mod types;

pub use error::StorageError;
pub use hash::{hash_final_tree, hash_snapshot};
pub use link::{LinkStatus, TreeLinkRequest};
pub use memory::InMemoryStore;
pub use merge::{
    HistoryEntry, MergeDecisions, MergeMeta, MergeRequest, PrimaryStatus, SecondaryStatus,
};
pub use sqlite::SqliteStore;
pub use traits::MergeStore;
pub use types::{HistoryDraft, MergeRequestId, TreeLinkRequestId, UserRecord};
