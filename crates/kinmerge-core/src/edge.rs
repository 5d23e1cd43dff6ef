//! Relationship edge types.
//!
//! A family graph stores three relation kinds: [`Relation::Parent`] (directed,
//! parent to child), [`Relation::Spouse`] and [`Relation::Sibling`] (stored
//! once, symmetric on query). "Child" is never stored; it is the inverse of a
//! parent edge.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::PersonId;

/// Role a parent plays for a specific child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParentRole {
    Father,
    Mother,
}

impl fmt::Display for ParentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParentRole::Father => f.write_str("father"),
            ParentRole::Mother => f.write_str("mother"),
        }
    }
}

/// Edge weight in the family graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Relation {
    /// Source is a parent of target. `role` is `None` when the source tree
    /// did not record father/mother.
    Parent { role: Option<ParentRole> },
    Spouse,
    Sibling,
}

impl Relation {
    pub fn is_parent(&self) -> bool {
        matches!(self, Relation::Parent { .. })
    }

    /// Spouse and sibling edges have no direction.
    pub fn is_symmetric(&self) -> bool {
        matches!(self, Relation::Spouse | Relation::Sibling)
    }

    /// Returns the recorded parent role, if this is a parent edge with one.
    pub fn parent_role(&self) -> Option<ParentRole> {
        match self {
            Relation::Parent { role } => *role,
            _ => None,
        }
    }
}

/// A relationship as it appears in tree snapshots and merge plans.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub from: PersonId,
    pub to: PersonId,
    pub relation: Relation,
}

impl EdgeRecord {
    pub fn parent(parent: PersonId, child: PersonId, role: Option<ParentRole>) -> Self {
        EdgeRecord {
            from: parent,
            to: child,
            relation: Relation::Parent { role },
        }
    }

    pub fn spouse(a: PersonId, b: PersonId) -> Self {
        EdgeRecord {
            from: a,
            to: b,
            relation: Relation::Spouse,
        }
    }

    pub fn sibling(a: PersonId, b: PersonId) -> Self {
        EdgeRecord {
            from: a,
            to: b,
            relation: Relation::Sibling,
        }
    }

    /// Canonical form used for deduplication: symmetric edges are ordered
    /// by endpoint id, and parent roles are ignored.
    pub fn dedup_key(&self) -> (PersonId, PersonId, u8) {
        match self.relation {
            Relation::Parent { .. } => (self.from, self.to, 0),
            Relation::Spouse => (self.from.min(self.to), self.from.max(self.to), 1),
            Relation::Sibling => (self.from.min(self.to), self.from.max(self.to), 2),
        }
    }
}

/// Relationship requested by a cross-tree link, read from the sender's
/// point of view: `Parent` means the receiver becomes the sender's parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationshipType {
    Parent,
    Child,
    Sibling,
}

impl fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelationshipType::Parent => f.write_str("parent"),
            RelationshipType::Child => f.write_str("child"),
            RelationshipType::Sibling => f.write_str("sibling"),
        }
    }
}
