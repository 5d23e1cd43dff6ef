//! The tree-link request aggregate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use kinmerge_core::{NodeRef, ParentRole, RelationshipType};
use kinmerge_engine::LinkPlan;

use crate::types::TreeLinkRequestId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Pending,
    /// Accepted by the receiver but not yet executed.
    Accepted,
    Rejected,
    Revoked,
    Executed,
}

impl LinkStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LinkStatus::Rejected | LinkStatus::Revoked | LinkStatus::Executed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Pending => "pending",
            LinkStatus::Accepted => "accepted",
            LinkStatus::Rejected => "rejected",
            LinkStatus::Revoked => "revoked",
            LinkStatus::Executed => "executed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeLinkRequest {
    pub id: TreeLinkRequestId,
    pub sender: NodeRef,
    pub receiver: NodeRef,
    pub relationship: RelationshipType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_role: Option<ParentRole>,
    pub status: LinkStatus,
    pub created_by: String,
    #[serde(default)]
    pub confirm_override: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_error: Option<String>,
    /// The edge recorded when the request executed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed: Option<LinkPlan>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl TreeLinkRequest {
    /// True if this request connects the same two nodes, in either direction.
    pub fn same_pair(&self, a: &NodeRef, b: &NodeRef) -> bool {
        (&self.sender == a && &self.receiver == b) || (&self.sender == b && &self.receiver == a)
    }

    pub fn touches(&self, family_code: &str) -> bool {
        self.sender.family_code.as_str() == family_code
            || self.receiver.family_code.as_str() == family_code
    }
}
