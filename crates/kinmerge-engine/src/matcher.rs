//! Candidate identity matching between a primary and a secondary tree.
//!
//! Every (primary, secondary) pair is scored on four fields: normalized
//! name, birth (dob year or age), gender, and generation. A field only
//! counts as matching or differing when both persons carry a value; missing
//! data simply contributes no weight. Confidence is the weighted share of
//! agreeing fields out of the full weight total, so sparse records score low.
//!
//! Selection is deterministic:
//! 1. Pairs below the threshold are dropped.
//! 2. Each secondary keeps its best primary (ties: lowest primary id); the
//!    rest become rejected alternatives.
//! 3. If two secondaries keep the same primary, the better one wins (ties:
//!    lowest secondary id) and the other is rejected, leaving that secondary
//!    unmatched.
//!
//! Persons on either side left unclaimed are reported as new persons.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use kinmerge_core::person::age_gap;
use kinmerge_core::{FamilyGraph, Person, PersonId};

use crate::config::MatcherConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchField {
    Name,
    Birth,
    Gender,
    Generation,
}

/// Confidence bucket shown to reviewers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchLevel {
    High,
    Medium,
    Low,
}

impl MatchLevel {
    pub fn from_confidence(confidence: u8) -> Self {
        match confidence {
            80..=u8::MAX => MatchLevel::High,
            65..=79 => MatchLevel::Medium,
            _ => MatchLevel::Low,
        }
    }
}

/// A proposed identity correspondence. Never applied without approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    pub primary: PersonId,
    pub secondary: PersonId,
    pub confidence: u8,
    pub level: MatchLevel,
    pub matching_fields: BTreeSet<MatchField>,
    pub differing_fields: BTreeSet<MatchField>,
}

impl Match {
    /// `(primary, secondary)` id pair.
    pub fn pair(&self) -> (PersonId, PersonId) {
        (self.primary, self.secondary)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPersons {
    pub primary: Vec<PersonId>,
    pub secondary: Vec<PersonId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchOutcome {
    /// Surfaced matches, ordered by secondary id.
    pub matches: Vec<Match>,
    /// Qualifying candidates that lost a tie-break. Not shown to reviewers.
    pub rejected_alternatives: Vec<Match>,
    pub new_persons: NewPersons,
}

impl MatchOutcome {
    pub fn pairs(&self) -> Vec<(PersonId, PersonId)> {
        self.matches.iter().map(Match::pair).collect()
    }
}

/// Scores one pair. Always returns a [`Match`]; callers apply the threshold.
pub fn score_pair(primary: &Person, secondary: &Person, config: &MatcherConfig) -> Match {
    let weights = &config.weights;
    let mut matching = BTreeSet::new();
    let mut differing = BTreeSet::new();
    let mut agree_weight = 0u64;

    let mut record = |field: MatchField, agrees: Option<bool>, weight: u32| match agrees {
        Some(true) => {
            matching.insert(field);
            agree_weight += u64::from(weight);
        }
        Some(false) => {
            differing.insert(field);
        }
        None => {}
    };

    let (p_name, s_name) = (primary.normalized_name(), secondary.normalized_name());
    let name = (!p_name.is_empty() && !s_name.is_empty()).then(|| p_name == s_name);
    record(MatchField::Name, name, weights.name);

    let birth = age_gap(primary, secondary, config.reference_year)
        .map(|gap| gap.unsigned_abs() <= config.birth_tolerance_years);
    record(MatchField::Birth, birth, weights.birth);

    let gender = match (primary.gender, secondary.gender) {
        (Some(a), Some(b)) => Some(a == b),
        _ => None,
    };
    record(MatchField::Gender, gender, weights.gender);

    record(
        MatchField::Generation,
        Some(primary.generation == secondary.generation),
        weights.generation,
    );

    let total = weights.total().max(1);
    // Deserialized weights skip validation.
    let confidence = ((agree_weight * 100 + total / 2) / total).min(100) as u8;

    Match {
        primary: primary.id,
        secondary: secondary.id,
        confidence,
        level: MatchLevel::from_confidence(confidence),
        matching_fields: matching,
        differing_fields: differing,
    }
}

/// Proposes matches between `primary` and an offset-applied `secondary`.
///
/// Output depends only on the inputs; calling it twice yields identical
/// results.
pub fn match_graphs(
    primary: &FamilyGraph,
    secondary: &FamilyGraph,
    config: &MatcherConfig,
) -> MatchOutcome {
    let mut primaries: Vec<&Person> = primary.people().collect();
    primaries.sort_by_key(|p| p.id);
    let mut secondaries: Vec<&Person> = secondary.people().collect();
    secondaries.sort_by_key(|p| p.id);

    let mut rejected = Vec::new();

    // Best primary per secondary.
    let mut best_for_secondary: BTreeMap<PersonId, Match> = BTreeMap::new();
    for s in &secondaries {
        let mut candidates: Vec<Match> = primaries
            .iter()
            .map(|p| score_pair(p, s, config))
            .filter(|m| m.confidence >= config.threshold)
            .collect();
        candidates.sort_by(|a, b| {
            b.confidence
                .cmp(&a.confidence)
                .then(a.primary.cmp(&b.primary))
        });
        let mut candidates = candidates.into_iter();
        if let Some(best) = candidates.next() {
            best_for_secondary.insert(s.id, best);
        }
        rejected.extend(candidates);
    }

    // One secondary per primary.
    let mut claimed: BTreeMap<PersonId, Match> = BTreeMap::new();
    for candidate in best_for_secondary.into_values() {
        match claimed.get(&candidate.primary) {
            Some(current) if current.confidence >= candidate.confidence => {
                // Iteration is in secondary-id order, so on equal confidence
                // the earlier (lower) secondary keeps the claim.
                rejected.push(candidate);
            }
            Some(_) => {
                if let Some(previous) = claimed.insert(candidate.primary, candidate) {
                    rejected.push(previous);
                }
            }
            None => {
                claimed.insert(candidate.primary, candidate);
            }
        }
    }

    let mut matches: Vec<Match> = claimed.into_values().collect();
    matches.sort_by_key(|m| m.secondary);
    rejected.sort_by(|a, b| {
        a.secondary
            .cmp(&b.secondary)
            .then(b.confidence.cmp(&a.confidence))
            .then(a.primary.cmp(&b.primary))
    });

    let matched_primary: BTreeSet<PersonId> = matches.iter().map(|m| m.primary).collect();
    let matched_secondary: BTreeSet<PersonId> = matches.iter().map(|m| m.secondary).collect();

    MatchOutcome {
        new_persons: NewPersons {
            primary: primaries
                .iter()
                .map(|p| p.id)
                .filter(|id| !matched_primary.contains(id))
                .collect(),
            secondary: secondaries
                .iter()
                .map(|p| p.id)
                .filter(|id| !matched_secondary.contains(id))
                .collect(),
        },
        matches,
        rejected_alternatives: rejected,
    }
}
