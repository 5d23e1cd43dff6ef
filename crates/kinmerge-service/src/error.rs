//! Service error taxonomy.
//!
//! [`ServiceError`] is the unified error type of every service operation.
//! [`ServiceError::category`] maps each variant onto the category a caller
//! branches on; transport failures are reported, never retried.

use serde::Serialize;

use kinmerge_core::CoreError;
use kinmerge_engine::{Conflict, Crisis, EngineError};
use kinmerge_storage::{StorageError, TreeLinkRequestId};

/// Coarse classification of a [`ServiceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Validation,
    StructuralConflict,
    StaleState,
    DomainRule,
    NotFound,
    Forbidden,
    Transport,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The request itself is malformed or inconsistent.
    #[error("validation error: {0}")]
    Validation(String),

    /// A pending link request already connects the same two nodes.
    #[error("a pending link request already exists: {existing}")]
    DuplicateLinkRequest { existing: TreeLinkRequestId },

    /// Hard conflicts or critical crises block the operation.
    #[error("merge blocked by {} hard conflict(s) and {} critical crisis(es)", conflicts.len(), crises.len())]
    StructuralConflict {
        conflicts: Vec<Conflict>,
        crises: Vec<Crisis>,
    },

    /// The aggregate changed since the caller read it.
    #[error("stale state: expected version {expected}, current version is {actual}")]
    StaleState { expected: u64, actual: u64 },

    /// A family tree changed between planning and committing a merge.
    #[error("stale state: the tree of family {family} changed during the merge")]
    StaleTree { family: String },

    /// A graph-model rule was violated.
    #[error(transparent)]
    DomainRule(CoreError),

    /// The aggregate is in a state that does not allow the operation.
    #[error("cannot {action} while {state}")]
    InvalidTransition { state: String, action: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A store call did not finish within the configured timeout.
    #[error("store call timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },

    /// The store failed.
    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl ServiceError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ServiceError::Validation(_) | ServiceError::DuplicateLinkRequest { .. } => {
                ErrorCategory::Validation
            }
            ServiceError::StructuralConflict { .. } => ErrorCategory::StructuralConflict,
            ServiceError::StaleState { .. } | ServiceError::StaleTree { .. } => {
                ErrorCategory::StaleState
            }
            ServiceError::DomainRule(_) | ServiceError::InvalidTransition { .. } => {
                ErrorCategory::DomainRule
            }
            ServiceError::NotFound(_) => ErrorCategory::NotFound,
            ServiceError::Forbidden(_) => ErrorCategory::Forbidden,
            ServiceError::Timeout { .. } | ServiceError::Storage(_) => ErrorCategory::Transport,
        }
    }

    pub(crate) fn transition(state: impl ToString, action: &str) -> Self {
        ServiceError::InvalidTransition {
            state: state.to_string(),
            action: action.to_string(),
        }
    }
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::VersionConflict { expected, actual } => {
                ServiceError::StaleState { expected, actual }
            }
            StorageError::TreeChanged { family } => ServiceError::StaleTree { family },
            StorageError::FamilyNotFound(_)
            | StorageError::MergeRequestNotFound(_)
            | StorageError::HistoryEntryNotFound { .. }
            | StorageError::LinkRequestNotFound(_) => ServiceError::NotFound(err.to_string()),
            other => ServiceError::Storage(other),
        }
    }
}

impl From<CoreError> for ServiceError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::PersonNotFound { .. } => ServiceError::NotFound(err.to_string()),
            CoreError::MalformedGraph { .. } | CoreError::OutOfRange { .. } => {
                ServiceError::Validation(err.to_string())
            }
            other => ServiceError::DomainRule(other),
        }
    }
}

impl From<EngineError> for ServiceError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Validation(msg) => ServiceError::Validation(msg),
            EngineError::StructuralConflict { conflicts } => ServiceError::StructuralConflict {
                conflicts,
                crises: Vec::new(),
            },
            EngineError::Core(core) => core.into(),
        }
    }
}
