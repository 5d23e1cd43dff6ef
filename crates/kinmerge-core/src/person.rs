//! Person nodes and the helpers that read identity fields off them.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::edge::ParentRole;
use crate::error::CoreError;
use crate::id::PersonId;

/// Which input tree a person was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTree {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

/// Optional contact identifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// A node in a family graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub id: PersonId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dob: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
    /// Depth level; root ancestors sit near 0 and descendants increase.
    pub generation: i32,
    #[serde(default)]
    pub is_app_user: bool,
    #[serde(default)]
    pub contact: Contact,
    pub source: SourceTree,
    /// Non-identity fields (address, caste, occupation, ...). A `BTreeMap`
    /// keeps serialization order stable.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl Person {
    /// Creates a person with only the required fields set.
    pub fn new(id: PersonId, name: impl Into<String>, generation: i32, source: SourceTree) -> Self {
        Person {
            id,
            name: name.into(),
            age: None,
            dob: None,
            gender: None,
            generation,
            is_app_user: false,
            contact: Contact::default(),
            source,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_gender(mut self, gender: Gender) -> Self {
        self.gender = Some(gender);
        self
    }

    pub fn with_age(mut self, age: u32) -> Self {
        self.age = Some(age);
        self
    }

    pub fn with_dob(mut self, dob: NaiveDate) -> Self {
        self.dob = Some(dob);
        self
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.contact.phone = Some(phone.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Name normalized for comparison: lowercase, whitespace collapsed.
    pub fn normalized_name(&self) -> String {
        normalize_name(&self.name)
    }

    /// Birth year from `dob`, or estimated from `age` when a reference year
    /// is supplied.
    pub fn birth_year(&self, reference_year: Option<i32>) -> Option<i32> {
        match (self.dob, self.age, reference_year) {
            (Some(dob), _, _) => Some(dob.year()),
            (None, Some(age), Some(reference)) => {
                reference.checked_sub(i32::try_from(age).ok()?)
            }
            _ => None,
        }
    }

    /// Phone number reduced to its digits, if one is recorded.
    pub fn phone_digits(&self) -> Option<String> {
        self.contact
            .phone
            .as_deref()
            .map(normalize_phone)
            .filter(|digits| !digits.is_empty())
    }

    pub fn person_ref(&self) -> PersonRef {
        PersonRef {
            tree: self.source,
            id: self.id,
        }
    }
}

/// A person reference qualified by the tree it belongs to. Needed wherever
/// primary and secondary ids appear side by side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PersonRef {
    pub tree: SourceTree,
    pub id: PersonId,
}

impl PersonRef {
    pub fn primary(id: PersonId) -> Self {
        PersonRef {
            tree: SourceTree::Primary,
            id,
        }
    }

    pub fn secondary(id: PersonId) -> Self {
        PersonRef {
            tree: SourceTree::Secondary,
            id,
        }
    }
}

/// Years by which `older` was born before `younger`.
///
/// Compares dob years when both carry one, raw ages when both carry one, and
/// falls back to estimated birth years otherwise. `None` when the data does
/// not allow a comparison.
pub fn age_gap(older: &Person, younger: &Person, reference_year: Option<i32>) -> Option<i32> {
    match (older.dob, younger.dob, older.age, younger.age) {
        (Some(a), Some(b), _, _) => Some(b.year() - a.year()),
        (_, _, Some(a), Some(b)) => i32::try_from(i64::from(a) - i64::from(b)).ok(),
        _ => {
            let a = older.birth_year(reference_year)?;
            let b = younger.birth_year(reference_year)?;
            b.checked_sub(a)
        }
    }
}

/// Derives the role a person takes when linked as a parent.
///
/// The role comes strictly from gender; an unset gender is an error rather
/// than a guess.
pub fn derive_parent_role(person: &Person) -> Result<ParentRole, CoreError> {
    match person.gender {
        Some(Gender::Male) => Ok(ParentRole::Father),
        Some(Gender::Female) => Ok(ParentRole::Mother),
        None => Err(CoreError::UnresolvedParentRole { person: person.id }),
    }
}

pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .map(|part| part.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn normalize_phone(phone: &str) -> String {
    phone.chars().filter(|c| c.is_ascii_digit()).collect()
}
