//! Core family-graph data model for kinmerge.
//!
//! Persons are nodes, typed relationships are edges. [`FamilyGraph`] is the
//! single entry point for loading, querying, and validating one family tree.

pub mod edge;
pub mod error;
pub mod graph;
pub mod id;
pub mod person;

// Re-export commonly used types
pub use edge::{EdgeRecord, ParentRole, Relation, RelationshipType};
pub use error::CoreError;
pub use graph::{FamilyGraph, TreeSnapshot};
pub use id::{FamilyCode, NodeRef, PersonId};
pub use person::{derive_parent_role, Contact, Gender, Person, PersonRef, SourceTree};
