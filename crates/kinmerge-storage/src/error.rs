//! Storage error types for kinmerge-storage.
//!
//! [`StorageError`] covers serialization, SQLite and migration failures,
//! missing aggregates, and optimistic-concurrency conflicts.

use thiserror::Error;

/// Errors produced by storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The SQLite backend reported an error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Applying schema migrations failed.
    #[error("migration error: {0}")]
    Migration(String),

    /// No tree is stored for the family code.
    #[error("family tree not found: {0}")]
    FamilyNotFound(String),

    /// A merge request with the given id was not found.
    #[error("merge request not found: {0}")]
    MergeRequestNotFound(i64),

    /// The merge request has no history entry at that version.
    #[error("history entry not found: merge_request={merge_request}, version={version}")]
    HistoryEntryNotFound { merge_request: i64, version: u64 },

    /// A tree-link request with the given id was not found.
    #[error("tree link request not found: {0}")]
    LinkRequestNotFound(i64),

    /// The stored version differs from the one the write was based on.
    #[error("version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    /// The family's tree changed after the write was planned against it.
    #[error("tree of family {family} changed since it was loaded")]
    TreeChanged { family: String },

    /// A data integrity violation was detected.
    #[error("integrity error: {reason}")]
    IntegrityError { reason: String },
}
