//! Storage-layer identifiers and records.
//!
//! Aggregate ids live here rather than in kinmerge-core because they only
//! exist once something is persisted. The inner `i64` matches SQLite's
//! `INTEGER PRIMARY KEY`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use kinmerge_core::FamilyCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MergeRequestId(pub i64);

impl fmt::Display for MergeRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MergeRequestId({})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TreeLinkRequestId(pub i64);

impl fmt::Display for TreeLinkRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TreeLinkRequestId({})", self.0)
    }
}

/// A registered app user, indexed by phone digits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: String,
    pub name: String,
    /// Phone number reduced to digits.
    pub phone_digits: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_code: Option<FamilyCode>,
}

/// The caller-provided part of a history entry. The store adds the version
/// and the state snapshot when it commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryDraft {
    pub entry_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub description: String,
    /// Structured description of what changed.
    pub changes: serde_json::Value,
}

impl HistoryDraft {
    pub fn new(
        actor: impl Into<String>,
        description: impl Into<String>,
        changes: serde_json::Value,
    ) -> Self {
        HistoryDraft {
            entry_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            actor: actor.into(),
            description: description.into(),
            changes,
        }
    }
}
