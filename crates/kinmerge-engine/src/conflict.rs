//! Per-pair and structural conflicts.

use serde::{Deserialize, Serialize};

use kinmerge_core::person::age_gap;
use kinmerge_core::{CoreError, FamilyGraph, Person, PersonId, PersonRef, SourceTree};

use crate::config::MatcherConfig;
use crate::union::UnionGraph;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictSeverity {
    /// Blocks merge execution.
    Hard,
    /// Advisory only.
    Soft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    CircularRelationship,
    ParentRoleClash,
    GenderMismatch,
    AgeMismatch,
    AttributeMismatch,
}

impl ConflictKind {
    pub fn severity(&self) -> ConflictSeverity {
        match self {
            ConflictKind::CircularRelationship
            | ConflictKind::ParentRoleClash
            | ConflictKind::GenderMismatch => ConflictSeverity::Hard,
            ConflictKind::AgeMismatch | ConflictKind::AttributeMismatch => ConflictSeverity::Soft,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub severity: ConflictSeverity,
    pub description: String,
    pub affected: Vec<PersonRef>,
    /// Field a soft conflict is about (`age`, `dob`, or an attribute key).
    /// Reviewers resolve soft conflicts per field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl Conflict {
    pub fn new(kind: ConflictKind, description: impl Into<String>, affected: Vec<PersonRef>) -> Self {
        Conflict {
            kind,
            severity: kind.severity(),
            description: description.into(),
            affected,
            field: None,
        }
    }

    fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn is_hard(&self) -> bool {
        self.severity == ConflictSeverity::Hard
    }
}

/// Conflicts between one matched pair.
pub fn pair_conflicts(primary: &Person, secondary: &Person, config: &MatcherConfig) -> Vec<Conflict> {
    let affected = vec![primary.person_ref(), secondary.person_ref()];
    let mut conflicts = Vec::new();

    if let (Some(a), Some(b)) = (primary.gender, secondary.gender) {
        if a != b {
            conflicts.push(Conflict::new(
                ConflictKind::GenderMismatch,
                format!(
                    "{} and {} are matched but recorded with different genders",
                    primary.name, secondary.name
                ),
                affected.clone(),
            ));
        }
    }

    if let Some(gap) = age_gap(primary, secondary, config.reference_year) {
        if gap.unsigned_abs() > config.birth_tolerance_years {
            let field = if primary.dob.is_some() && secondary.dob.is_some() {
                "dob"
            } else {
                "age"
            };
            conflicts.push(
                Conflict::new(
                    ConflictKind::AgeMismatch,
                    format!(
                        "{} and {} differ by {} years in {}",
                        primary.name,
                        secondary.name,
                        gap.abs(),
                        field
                    ),
                    affected.clone(),
                )
                .with_field(field),
            );
        }
    }

    for (key, value) in &primary.attributes {
        match secondary.attributes.get(key) {
            Some(other) if other.trim() != value.trim() => conflicts.push(
                Conflict::new(
                    ConflictKind::AttributeMismatch,
                    format!("{} differs: '{}' vs '{}'", key, value, other),
                    affected.clone(),
                )
                .with_field(key.clone()),
            ),
            _ => {}
        }
    }

    conflicts
}

/// One hard conflict per parent cycle in `graph`.
pub fn cycle_conflicts(graph: &FamilyGraph, tree: SourceTree) -> Vec<Conflict> {
    graph
        .detect_cycles()
        .into_iter()
        .map(|path| {
            let affected = path.iter().map(|id| PersonRef { tree, id: *id }).collect();
            Conflict::new(
                ConflictKind::CircularRelationship,
                CoreError::CircularRelationship { path }.to_string(),
                affected,
            )
        })
        .collect()
}

/// Hard conflicts introduced by combining the trees: secondary parent
/// edges the union refused and cycles that neither input tree had.
pub fn union_conflicts(union: &UnionGraph, known_cycles: &[Vec<PersonId>]) -> Vec<Conflict> {
    let mut conflicts = Vec::new();

    for rejected in &union.rejected_edges {
        if !rejected.translated.relation.is_parent() {
            continue;
        }
        let child = union.origin_ref(rejected.translated.to);
        let affected = vec![
            PersonRef::secondary(rejected.source.from),
            PersonRef::secondary(rejected.source.to),
            child,
        ];
        conflicts.push(Conflict::new(
            ConflictKind::ParentRoleClash,
            format!(
                "secondary parent link {} -> {} cannot be merged: {}",
                rejected.source.from, rejected.source.to, rejected.error
            ),
            affected,
        ));
    }

    for path in union.graph.detect_cycles() {
        if is_known_cycle(&path, known_cycles) {
            continue;
        }
        let affected = path.iter().map(|id| union.origin_ref(*id)).collect();
        conflicts.push(Conflict::new(
            ConflictKind::CircularRelationship,
            format!(
                "merging creates a {}",
                CoreError::CircularRelationship { path }
            ),
            affected,
        ));
    }

    conflicts
}

pub(crate) fn is_known_cycle(path: &[PersonId], known: &[Vec<PersonId>]) -> bool {
    let mut members = path.to_vec();
    members.sort();
    known.iter().any(|cycle| {
        let mut other = cycle.clone();
        other.sort();
        other == members
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kinmerge_core::{EdgeRecord, Gender};

    fn pair() -> (Person, Person) {
        (
            Person::new(PersonId(1), "Gita", 1, SourceTree::Primary),
            Person::new(PersonId(2), "Gita", 1, SourceTree::Secondary),
        )
    }

    #[test]
    fn gender_disagreement_is_hard() {
        let (p, s) = pair();
        let conflicts = pair_conflicts(
            &p.with_gender(Gender::Female),
            &s.with_gender(Gender::Male),
            &MatcherConfig::default(),
        );
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::GenderMismatch);
        assert!(conflicts[0].is_hard());
    }

    #[test]
    fn age_and_attribute_differences_are_soft() {
        let (p, s) = pair();
        let p = p.with_age(50).with_attribute("village", "Udupi");
        let s = s.with_age(55).with_attribute("village", "Manipal");
        let conflicts = pair_conflicts(&p, &s, &MatcherConfig::default());

        assert_eq!(conflicts.len(), 2);
        assert!(conflicts.iter().all(|c| c.severity == ConflictSeverity::Soft));
        assert_eq!(conflicts[0].field.as_deref(), Some("age"));
        assert_eq!(conflicts[1].field.as_deref(), Some("village"));
    }

    #[test]
    fn attributes_missing_on_one_side_are_not_conflicts() {
        let (p, s) = pair();
        let conflicts = pair_conflicts(
            &p.with_attribute("caste", "x"),
            &s,
            &MatcherConfig::default(),
        );
        assert!(conflicts.is_empty());
    }

    #[test]
    fn cycles_become_hard_conflicts() {
        let a = Person::new(PersonId(1), "A", 0, SourceTree::Secondary);
        let b = Person::new(PersonId(2), "B", 1, SourceTree::Secondary);
        let graph = FamilyGraph::load_tree_allow_cycles(
            vec![a, b],
            vec![
                EdgeRecord::parent(PersonId(1), PersonId(2), None),
                EdgeRecord::parent(PersonId(2), PersonId(1), None),
            ],
        )
        .unwrap();
        let conflicts = cycle_conflicts(&graph, SourceTree::Secondary);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::CircularRelationship);
        assert_eq!(
            conflicts[0].affected,
            vec![
                PersonRef::secondary(PersonId(1)),
                PersonRef::secondary(PersonId(2))
            ]
        );
    }

    #[test]
    fn known_cycle_matching_ignores_rotation() {
        let known = vec![vec![PersonId(1), PersonId(2), PersonId(3)]];
        assert!(is_known_cycle(&[PersonId(2), PersonId(3), PersonId(1)], &known));
        assert!(!is_known_cycle(&[PersonId(1), PersonId(2)], &known));
    }
}
