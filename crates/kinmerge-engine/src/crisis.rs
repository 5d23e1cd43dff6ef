//! Whole-graph crisis detection and the combined classification report.
//!
//! [`classify`] runs after the generation offset has been applied to the
//! secondary tree. It collects per-pair conflicts, structural conflicts from
//! both trees and from their provisional union, and the six crisis kinds.
//! At most one crisis of each kind is reported; its `affected` list carries
//! every person involved.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use kinmerge_core::person::age_gap;
use kinmerge_core::{
    EdgeRecord, FamilyGraph, Gender, ParentRole, PersonId, PersonRef, Relation, SourceTree,
};

use crate::config::EngineConfig;
use crate::conflict::{
    cycle_conflicts, is_known_cycle, pair_conflicts, union_conflicts, Conflict, ConflictKind,
};
use crate::error::EngineError;
use crate::union::UnionGraph;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CrisisKind {
    NoMatchMerge,
    GenerationMismatch,
    OrphanedPersons,
    CircularRelationships,
    RelationshipIssues,
    AgeInconsistency,
}

impl CrisisKind {
    pub fn severity(&self) -> CrisisSeverity {
        match self {
            CrisisKind::CircularRelationships => CrisisSeverity::Critical,
            CrisisKind::GenerationMismatch | CrisisKind::AgeInconsistency => CrisisSeverity::High,
            CrisisKind::NoMatchMerge | CrisisKind::RelationshipIssues => CrisisSeverity::Medium,
            CrisisKind::OrphanedPersons => CrisisSeverity::Low,
        }
    }

    fn recommendations(&self) -> Vec<String> {
        let lines: &[&str] = match self {
            CrisisKind::NoMatchMerge => &[
                "Confirm that the two families really share no members",
                "Search by mobile number to find a common relative before merging",
            ],
            CrisisKind::GenerationMismatch => &[
                "Review the suggested generation offset",
                "Check the generation recorded for the listed persons",
            ],
            CrisisKind::OrphanedPersons => &[
                "Link the listed persons to a parent or spouse",
                "Remove entries that were added by mistake",
            ],
            CrisisKind::CircularRelationships => &[
                "Remove one of the parent links in each listed cycle",
                "Check whether a match pairs an ancestor with a descendant",
            ],
            CrisisKind::RelationshipIssues => &[
                "Correct the gender or the parent role of the listed persons",
                "Unmatch persons whose parents cannot be combined",
            ],
            CrisisKind::AgeInconsistency => &[
                "Verify the age or date of birth of the listed parents and children",
            ],
        };
        lines.iter().map(|line| line.to_string()).collect()
    }
}

/// Ordered most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CrisisSeverity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Crisis {
    pub kind: CrisisKind,
    pub severity: CrisisSeverity,
    pub description: String,
    pub affected: Vec<PersonRef>,
    pub recommendations: Vec<String>,
}

impl Crisis {
    fn new(kind: CrisisKind, description: String, affected: BTreeSet<PersonRef>) -> Self {
        Crisis {
            kind,
            severity: kind.severity(),
            description,
            affected: affected.into_iter().collect(),
            recommendations: kind.recommendations(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub conflicts: Vec<Conflict>,
    /// Ordered by severity, most severe first.
    pub crises: Vec<Crisis>,
}

impl ClassificationReport {
    /// Any hard conflict or critical crisis blocks execution.
    pub fn is_blocking(&self) -> bool {
        self.conflicts.iter().any(Conflict::is_hard)
            || self
                .crises
                .iter()
                .any(|c| c.severity == CrisisSeverity::Critical)
    }

    pub fn requires_confirmation(&self) -> bool {
        self.has_crisis(CrisisKind::NoMatchMerge)
    }

    pub fn has_crisis(&self, kind: CrisisKind) -> bool {
        self.crises.iter().any(|c| c.kind == kind)
    }

    pub fn hard_conflicts(&self) -> Vec<Conflict> {
        self.conflicts.iter().filter(|c| c.is_hard()).cloned().collect()
    }
}

/// Classifies a prospective merge.
///
/// `secondary` must already carry the applied generation offset. `pairs`
/// are `(primary, secondary)` ids of the matches under consideration.
pub fn classify(
    primary: &FamilyGraph,
    secondary: &FamilyGraph,
    pairs: &[(PersonId, PersonId)],
    config: &EngineConfig,
) -> Result<ClassificationReport, EngineError> {
    let union = UnionGraph::build(primary, secondary, pairs)?;
    let mut conflicts = Vec::new();
    let mut crises = Vec::new();

    for &(p, s) in pairs {
        if let (Some(a), Some(b)) = (primary.person(p), secondary.person(s)) {
            conflicts.extend(pair_conflicts(a, b, &config.matcher));
        }
    }

    // Cycles
    let primary_cycles = primary.detect_cycles();
    let secondary_cycles = secondary.detect_cycles();
    let translated: Vec<Vec<PersonId>> = secondary_cycles
        .iter()
        .map(|path| path.iter().filter_map(|id| union.mapping.merged(*id)).collect())
        .collect();
    let known: Vec<Vec<PersonId>> = primary_cycles.iter().chain(&translated).cloned().collect();

    let mut cycle_conflict_list = cycle_conflicts(primary, SourceTree::Primary);
    cycle_conflict_list.extend(cycle_conflicts(secondary, SourceTree::Secondary));
    let union_found = union_conflicts(&union, &known);
    conflicts.extend(cycle_conflict_list.iter().cloned());
    conflicts.extend(union_found.iter().cloned());

    let union_cycles: Vec<Vec<PersonId>> = union
        .graph
        .detect_cycles()
        .into_iter()
        .filter(|path| !is_known_cycle(path, &known))
        .collect();
    let cycle_count = primary_cycles.len() + secondary_cycles.len() + union_cycles.len();
    if cycle_count > 0 {
        let mut affected = BTreeSet::new();
        for c in cycle_conflict_list.iter().chain(
            union_found
                .iter()
                .filter(|c| c.kind == ConflictKind::CircularRelationship),
        ) {
            affected.extend(c.affected.iter().copied());
        }
        crises.push(Crisis::new(
            CrisisKind::CircularRelationships,
            format!(
                "{} parent cycle(s) found (primary {}, secondary {}, created by merge {})",
                cycle_count,
                primary_cycles.len(),
                secondary_cycles.len(),
                union_cycles.len()
            ),
            affected,
        ));
    }

    if let Some(crisis) = generation_mismatch(primary, secondary, pairs) {
        crises.push(crisis);
    }
    if let Some(crisis) = age_inconsistency(primary, secondary, &union, config) {
        crises.push(crisis);
    }
    if let Some(crisis) = relationship_issues(primary, secondary, &union) {
        crises.push(crisis);
    }
    if pairs.is_empty() {
        let affected = primary
            .people()
            .chain(secondary.people())
            .map(|p| p.person_ref())
            .collect();
        crises.push(Crisis::new(
            CrisisKind::NoMatchMerge,
            format!(
                "no matches between the trees; all {} persons would be added as new",
                primary.person_count() + secondary.person_count()
            ),
            affected,
        ));
    }
    if let Some(crisis) = orphans(primary, secondary) {
        crises.push(crisis);
    }

    crises.sort_by_key(|c| (c.severity, c.kind));
    Ok(ClassificationReport { conflicts, crises })
}

/// Secondary edges touching an unmatched person whose merged generations do
/// not line up: a parent one generation above its child, siblings level.
fn generation_mismatch(
    primary: &FamilyGraph,
    secondary: &FamilyGraph,
    pairs: &[(PersonId, PersonId)],
) -> Option<Crisis> {
    let matched: BTreeMap<PersonId, PersonId> = pairs.iter().map(|&(p, s)| (s, p)).collect();
    let merged_generation = |id: PersonId| -> Option<i32> {
        match matched.get(&id) {
            Some(p) => primary.person(*p).map(|person| person.generation),
            None => secondary.person(id).map(|person| person.generation),
        }
    };

    let mut affected = BTreeSet::new();
    let mut count = 0usize;
    for edge in secondary.edges() {
        if matched.contains_key(&edge.from) && matched.contains_key(&edge.to) {
            continue;
        }
        let (Some(from), Some(to)) = (merged_generation(edge.from), merged_generation(edge.to))
        else {
            continue;
        };
        let consistent = match edge.relation {
            Relation::Parent { .. } => to.checked_sub(1) == Some(from),
            Relation::Sibling => from == to,
            Relation::Spouse => true,
        };
        if !consistent {
            count += 1;
            for id in [edge.from, edge.to] {
                affected.insert(match matched.get(&id) {
                    Some(p) => PersonRef::primary(*p),
                    None => PersonRef::secondary(id),
                });
            }
        }
    }

    (count > 0).then(|| {
        Crisis::new(
            CrisisKind::GenerationMismatch,
            format!(
                "{} relationship(s) of unmatched persons disagree with their generations",
                count
            ),
            affected,
        )
    })
}

/// Parent edges where the parent is younger than, or implausibly close in
/// age to, the child. Checked in both trees and on edges the union adds.
fn age_inconsistency(
    primary: &FamilyGraph,
    secondary: &FamilyGraph,
    union: &UnionGraph,
    config: &EngineConfig,
) -> Option<Crisis> {
    let reference_year = config.matcher.reference_year;
    let min_gap = config.min_parent_gap_years;
    let mut affected = BTreeSet::new();
    let mut count = 0usize;

    for (parent, child) in implausible_parents(primary, &primary.edges(), min_gap, reference_year) {
        count += 1;
        affected.insert(PersonRef::primary(parent));
        affected.insert(PersonRef::primary(child));
    }
    for (parent, child) in implausible_parents(secondary, &secondary.edges(), min_gap, reference_year)
    {
        count += 1;
        affected.insert(PersonRef::secondary(parent));
        affected.insert(PersonRef::secondary(child));
    }
    for (parent, child) in
        implausible_parents(&union.graph, &union.added_edges, min_gap, reference_year)
    {
        count += 1;
        affected.insert(union.origin_ref(parent));
        affected.insert(union.origin_ref(child));
    }

    (count > 0).then(|| {
        Crisis::new(
            CrisisKind::AgeInconsistency,
            format!(
                "{} parent link(s) with a parent less than {} years older than the child",
                count, min_gap
            ),
            affected,
        )
    })
}

fn implausible_parents(
    graph: &FamilyGraph,
    edges: &[EdgeRecord],
    min_gap: i32,
    reference_year: Option<i32>,
) -> Vec<(PersonId, PersonId)> {
    edges
        .iter()
        .filter(|e| e.relation.is_parent())
        .filter(|e| {
            match (graph.person(e.from), graph.person(e.to)) {
                (Some(parent), Some(child)) => {
                    age_gap(parent, child, reference_year).is_some_and(|gap| gap < min_gap)
                }
                _ => false,
            }
        })
        .map(|e| (e.from, e.to))
        .collect()
}

/// Recorded parent roles that contradict gender, and parent links the union
/// could not accept.
fn relationship_issues(
    primary: &FamilyGraph,
    secondary: &FamilyGraph,
    union: &UnionGraph,
) -> Option<Crisis> {
    let mut affected = BTreeSet::new();
    let mut count = 0usize;

    for (graph, tree) in [(primary, SourceTree::Primary), (secondary, SourceTree::Secondary)] {
        for edge in graph.edges() {
            let Some(role) = edge.relation.parent_role() else {
                continue;
            };
            let gender = graph.person(edge.from).and_then(|p| p.gender);
            let contradicts = matches!(
                (role, gender),
                (ParentRole::Father, Some(Gender::Female)) | (ParentRole::Mother, Some(Gender::Male))
            );
            if contradicts {
                count += 1;
                affected.insert(PersonRef { tree, id: edge.from });
            }
        }
    }

    for rejected in &union.rejected_edges {
        count += 1;
        affected.insert(PersonRef::secondary(rejected.source.from));
        affected.insert(PersonRef::secondary(rejected.source.to));
    }

    (count > 0).then(|| {
        Crisis::new(
            CrisisKind::RelationshipIssues,
            format!("{} inconsistent relationship record(s)", count),
            affected,
        )
    })
}

fn orphans(primary: &FamilyGraph, secondary: &FamilyGraph) -> Option<Crisis> {
    let affected: BTreeSet<PersonRef> = primary
        .detect_orphans()
        .into_iter()
        .map(PersonRef::primary)
        .chain(secondary.detect_orphans().into_iter().map(PersonRef::secondary))
        .collect();
    (!affected.is_empty()).then(|| {
        Crisis::new(
            CrisisKind::OrphanedPersons,
            format!("{} person(s) below the root generation have no relatives", affected.len()),
            affected,
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kinmerge_core::Person;

    fn p(id: u32, name: &str, generation: i32) -> Person {
        Person::new(PersonId(id), name, generation, SourceTree::Primary)
    }

    fn s(id: u32, name: &str, generation: i32) -> Person {
        Person::new(PersonId(id), name, generation, SourceTree::Secondary)
    }

    #[test]
    fn parent_cycle_is_critical() {
        let primary = FamilyGraph::load_tree(vec![p(1, "Root", 0)], vec![]).unwrap();
        let secondary = FamilyGraph::load_tree_allow_cycles(
            vec![s(1, "A", 0), s(2, "B", 1)],
            vec![
                EdgeRecord::parent(PersonId(1), PersonId(2), None),
                EdgeRecord::parent(PersonId(2), PersonId(1), None),
            ],
        )
        .unwrap();
        assert!(!secondary.detect_cycles().is_empty());

        let report = classify(&primary, &secondary, &[], &EngineConfig::default()).unwrap();
        let crisis = report
            .crises
            .iter()
            .find(|c| c.kind == CrisisKind::CircularRelationships)
            .unwrap();
        assert_eq!(crisis.severity, CrisisSeverity::Critical);
        assert!(!crisis.recommendations.is_empty());
        assert!(report.is_blocking());
        // Critical sorts first.
        assert_eq!(report.crises[0].kind, CrisisKind::CircularRelationships);
    }

    #[test]
    fn no_matches_raise_medium_crisis() {
        let primary = FamilyGraph::load_tree(vec![p(1, "A", 0), p(2, "B", 0)], vec![]).unwrap();
        let secondary = FamilyGraph::load_tree(vec![s(1, "C", 0)], vec![]).unwrap();
        let report = classify(&primary, &secondary, &[], &EngineConfig::default()).unwrap();

        let crisis = report
            .crises
            .iter()
            .find(|c| c.kind == CrisisKind::NoMatchMerge)
            .unwrap();
        assert_eq!(crisis.severity, CrisisSeverity::Medium);
        assert_eq!(crisis.affected.len(), 3);
        assert!(report.requires_confirmation());
        assert!(!report.is_blocking());
    }

    #[test]
    fn unmatched_child_at_wrong_generation_is_flagged() {
        let primary = FamilyGraph::load_tree(vec![p(1, "Father", 0)], vec![]).unwrap();
        let secondary = FamilyGraph::load_tree(
            vec![s(1, "Father", 0), s(2, "Son", 3)],
            vec![EdgeRecord::parent(PersonId(1), PersonId(2), None)],
        )
        .unwrap();
        let report = classify(
            &primary,
            &secondary,
            &[(PersonId(1), PersonId(1))],
            &EngineConfig::default(),
        )
        .unwrap();
        let crisis = report
            .crises
            .iter()
            .find(|c| c.kind == CrisisKind::GenerationMismatch)
            .unwrap();
        assert_eq!(crisis.severity, CrisisSeverity::High);
        assert_eq!(
            crisis.affected,
            vec![PersonRef::primary(PersonId(1)), PersonRef::secondary(PersonId(2))]
        );
    }

    #[test]
    fn parent_too_close_in_age_is_flagged() {
        let primary = FamilyGraph::load_tree(
            vec![p(1, "Mother", 0).with_age(30), p(2, "Daughter", 1).with_age(22)],
            vec![EdgeRecord::parent(PersonId(1), PersonId(2), None)],
        )
        .unwrap();
        let secondary = FamilyGraph::new();
        let report = classify(&primary, &secondary, &[], &EngineConfig::default()).unwrap();
        let crisis = report
            .crises
            .iter()
            .find(|c| c.kind == CrisisKind::AgeInconsistency)
            .unwrap();
        assert_eq!(crisis.severity, CrisisSeverity::High);
        assert_eq!(crisis.affected.len(), 2);
    }

    #[test]
    fn role_contradicting_gender_is_a_relationship_issue() {
        let primary = FamilyGraph::load_tree(
            vec![p(1, "Uma", 0).with_gender(Gender::Female), p(2, "Kid", 1)],
            vec![EdgeRecord::parent(PersonId(1), PersonId(2), Some(ParentRole::Father))],
        )
        .unwrap();
        let report = classify(&primary, &FamilyGraph::new(), &[], &EngineConfig::default()).unwrap();
        let crisis = report
            .crises
            .iter()
            .find(|c| c.kind == CrisisKind::RelationshipIssues)
            .unwrap();
        assert_eq!(crisis.severity, CrisisSeverity::Medium);
        assert_eq!(crisis.affected, vec![PersonRef::primary(PersonId(1))]);
    }

    #[test]
    fn orphans_are_low_severity() {
        let primary = FamilyGraph::load_tree(vec![p(1, "Root", 0), p(2, "Lost", 2)], vec![]).unwrap();
        let report = classify(&primary, &FamilyGraph::new(), &[], &EngineConfig::default()).unwrap();
        let crisis = report
            .crises
            .iter()
            .find(|c| c.kind == CrisisKind::OrphanedPersons)
            .unwrap();
        assert_eq!(crisis.severity, CrisisSeverity::Low);
        assert_eq!(crisis.affected, vec![PersonRef::primary(PersonId(2))]);
    }

    #[test]
    fn merge_created_cycle_is_detected_on_union() {
        // Primary: 1 parent of 2. Secondary: 2' parent of 1'. Matching both
        // pairs closes a loop only the union can see.
        let primary = FamilyGraph::load_tree(
            vec![p(1, "A", 0), p(2, "B", 1)],
            vec![EdgeRecord::parent(PersonId(1), PersonId(2), None)],
        )
        .unwrap();
        let secondary = FamilyGraph::load_tree(
            vec![s(1, "A", 0), s(2, "B", 1)],
            vec![EdgeRecord::parent(PersonId(2), PersonId(1), None)],
        )
        .unwrap();
        let pairs = [(PersonId(1), PersonId(1)), (PersonId(2), PersonId(2))];
        let report = classify(&primary, &secondary, &pairs, &EngineConfig::default()).unwrap();

        assert!(report.has_crisis(CrisisKind::CircularRelationships));
        assert!(report
            .hard_conflicts()
            .iter()
            .any(|c| c.kind == ConflictKind::CircularRelationship));
    }
}
