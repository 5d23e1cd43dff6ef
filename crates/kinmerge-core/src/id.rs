//! Stable identifiers for persons and trees.
//!
//! [`PersonId`] is unique only within its source tree. A person node in a
//! specific tree is addressed with [`NodeRef`], which pairs the id with the
//! owning [`FamilyCode`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Person identifier, unique within one family tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PersonId(pub u32);

/// Identifier of an independently owned family tree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FamilyCode(pub String);

impl FamilyCode {
    pub fn new(code: impl Into<String>) -> Self {
        FamilyCode(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A person node inside a specific family tree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    pub family_code: FamilyCode,
    pub person: PersonId,
}

impl NodeRef {
    pub fn new(family_code: FamilyCode, person: PersonId) -> Self {
        NodeRef {
            family_code,
            person,
        }
    }
}

impl fmt::Display for PersonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FamilyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.family_code, self.person)
    }
}
