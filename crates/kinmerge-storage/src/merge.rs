//! The merge request aggregate and its audit history.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use kinmerge_core::{FamilyCode, PersonId};
use kinmerge_engine::{AcceptedMatch, AppliedOffset, FinalTree};

use crate::types::{HistoryDraft, MergeRequestId};

/// Primary-side lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrimaryStatus {
    Initiated,
    Analyzed,
    InReview,
    MergedCompleted,
    RejectedByPrimary,
}

impl PrimaryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PrimaryStatus::MergedCompleted | PrimaryStatus::RejectedByPrimary
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PrimaryStatus::Initiated => "INITIATED",
            PrimaryStatus::Analyzed => "ANALYZED",
            PrimaryStatus::InReview => "IN_REVIEW",
            PrimaryStatus::MergedCompleted => "MERGED_COMPLETED",
            PrimaryStatus::RejectedByPrimary => "REJECTED_BY_PRIMARY",
        }
    }
}

impl std::fmt::Display for PrimaryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Secondary-side lifecycle. Mirrors the primary outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecondaryStatus {
    AwaitingPrimary,
    MergedCompleted,
    RejectedByPrimary,
}

/// Reviewer decisions accumulated through edits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeDecisions {
    #[serde(default)]
    pub matches: Vec<AcceptedMatch>,
    #[serde(default)]
    pub new_persons: Vec<PersonId>,
    #[serde(default)]
    pub admin_promotions: Vec<PersonId>,
    /// Final-tree members a reviewer has approved.
    #[serde(default)]
    pub approved_members: BTreeSet<PersonId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeMeta {
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub last_updated_at: DateTime<Utc>,
    pub last_updated_by: String,
}

/// Aggregate root of one merge between two families.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRequest {
    pub id: MergeRequestId,
    pub primary_family_code: FamilyCode,
    pub secondary_family_code: FamilyCode,
    pub primary_status: PrimaryStatus,
    pub secondary_status: SecondaryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_offset: Option<AppliedOffset>,
    #[serde(default)]
    pub decisions: MergeDecisions,
    #[serde(default)]
    pub final_tree: FinalTree,
    /// blake3 hex digest of the serialized final tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_tree_hash: Option<String>,
    /// Why the last replan failed, if it did. The final tree above is then
    /// the last one that planned successfully.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_error: Option<String>,
    pub meta: MergeMeta,
    /// Bumped by every committed change. Starts at 1.
    pub version: u64,
}

impl MergeRequest {
    /// A fresh request. The store assigns the real id on create.
    pub fn draft(
        primary: FamilyCode,
        secondary: FamilyCode,
        actor: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let actor = actor.into();
        MergeRequest {
            id: MergeRequestId(0),
            primary_family_code: primary,
            secondary_family_code: secondary,
            primary_status: PrimaryStatus::Initiated,
            secondary_status: SecondaryStatus::AwaitingPrimary,
            generation_offset: None,
            decisions: MergeDecisions::default(),
            final_tree: FinalTree::default(),
            final_tree_hash: None,
            plan_error: None,
            meta: MergeMeta {
                created_at: now,
                created_by: actor.clone(),
                last_updated_at: now,
                last_updated_by: actor,
            },
            version: 1,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.primary_status.is_terminal()
    }

    /// Stamps the next version and the editing actor.
    pub fn touch(&mut self, actor: &str, now: DateTime<Utc>) {
        self.version += 1;
        self.meta.last_updated_at = now;
        self.meta.last_updated_by = actor.to_string();
    }
}

/// One append-only audit record. `snapshot` is the full request state as of
/// `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub entry_id: Uuid,
    pub merge_request: MergeRequestId,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub description: String,
    pub changes: serde_json::Value,
    pub snapshot: MergeRequest,
}

impl HistoryEntry {
    pub fn from_draft(draft: HistoryDraft, snapshot: &MergeRequest) -> Self {
        HistoryEntry {
            entry_id: draft.entry_id,
            merge_request: snapshot.id,
            version: snapshot.version,
            timestamp: draft.timestamp,
            actor: draft.actor,
            description: draft.description,
            changes: draft.changes,
            snapshot: snapshot.clone(),
        }
    }
}
