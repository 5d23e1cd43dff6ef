//! Core error types for kinmerge-core.
//!
//! Uses `thiserror` for structured, matchable error variants covering the
//! structural and domain-rule failures of the family graph model.

use crate::edge::ParentRole;
use crate::id::PersonId;
use thiserror::Error;

/// Core errors produced by the kinmerge-core crate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Input data does not describe a well-formed graph (unknown edge
    /// endpoint, duplicated person id, self edge).
    #[error("malformed graph: {reason}")]
    MalformedGraph { reason: String },

    /// A person id was not found in the graph.
    #[error("person not found: PersonId({id})", id = id.0)]
    PersonNotFound { id: PersonId },

    /// The child already has a parent recorded in this role.
    #[error("person {child} already has a {role} recorded")]
    DuplicateParentRole { child: PersonId, role: ParentRole },

    /// The child already has two parents; a third is never allowed.
    #[error("person {child} already has two parents")]
    ParentAlreadyExists { child: PersonId },

    /// A parent role was requested for a person whose gender is unset.
    #[error("cannot derive parent role for person {person}: gender is unset")]
    UnresolvedParentRole { person: PersonId },

    /// A generation shift or id allocation left the `i32`/`u32` range.
    #[error("{what} is out of range")]
    OutOfRange { what: String },

    /// The parent sub-graph contains a cycle.
    #[error("circular parent relationship: {}", format_path(path))]
    CircularRelationship { path: Vec<PersonId> },
}

fn format_path(path: &[PersonId]) -> String {
    path.iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circular_relationship_message_lists_path() {
        let err = CoreError::CircularRelationship {
            path: vec![PersonId(1), PersonId(2)],
        };
        assert_eq!(err.to_string(), "circular parent relationship: 1 -> 2");
    }

    #[test]
    fn duplicate_role_message() {
        let err = CoreError::DuplicateParentRole {
            child: PersonId(3),
            role: ParentRole::Mother,
        };
        assert_eq!(err.to_string(), "person 3 already has a mother recorded");
    }
}
