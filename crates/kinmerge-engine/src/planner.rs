//! Deterministic merge planning.
//!
//! [`plan_merge`] turns reviewer decisions into a [`MergePlan`]: the
//! materialized final tree plus the ordered list of steps that produce it.
//! Matched persons keep their primary record (with any soft-conflict
//! resolutions applied) and are tagged with the secondary id they absorbed.
//! Every unmatched secondary person is appended through [`UnionGraph`], so id
//! assignment and edge translation follow the same rules the classifier
//! sees.
//!
//! Output is a pure function of the inputs: members are ordered by merged
//! id, edges are sorted, and actions follow a fixed order, so serializing
//! the same plan twice gives identical bytes.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use kinmerge_core::{EdgeRecord, FamilyGraph, Person, PersonId, SourceTree, TreeSnapshot};

use crate::conflict::union_conflicts;
use crate::error::EngineError;
use crate::union::UnionGraph;

/// Which value wins for a field in soft conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionChoice {
    KeepPrimary,
    TakeSecondary,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolvedField {
    Age,
    Dob,
    Attribute(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldResolution {
    pub field: ResolvedField,
    pub choice: ResolutionChoice,
}

/// A match a reviewer accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedMatch {
    pub primary: PersonId,
    pub secondary: PersonId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolutions: Vec<FieldResolution>,
}

impl AcceptedMatch {
    pub fn new(primary: PersonId, secondary: PersonId) -> Self {
        AcceptedMatch {
            primary,
            secondary,
            resolutions: Vec::new(),
        }
    }

    pub fn pair(&self) -> (PersonId, PersonId) {
        (self.primary, self.secondary)
    }
}

pub struct MergeInputs<'a> {
    pub primary: &'a FamilyGraph,
    /// Secondary tree with the generation offset already applied.
    pub secondary: &'a FamilyGraph,
    pub matches: &'a [AcceptedMatch],
    /// Secondary persons the reviewer confirmed as new.
    pub new_persons: &'a [PersonId],
    /// Secondary persons granted admin rights in the merged family.
    pub admin_promotions: &'a [PersonId],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberOrigin {
    /// Primary person with no secondary counterpart.
    Primary,
    /// Primary person that absorbed a matched secondary person.
    Matched,
    /// Secondary person appended with a fresh id.
    Added,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeMember {
    pub person: Person,
    pub origin: MemberOrigin,
    /// Secondary id this member came from or absorbed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_from: Option<PersonId>,
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalTree {
    pub members: Vec<TreeMember>,
    pub edges: Vec<EdgeRecord>,
}

impl FinalTree {
    pub fn contains(&self, id: PersonId) -> bool {
        self.members.iter().any(|m| m.person.id == id)
    }

    pub fn member(&self, id: PersonId) -> Option<&TreeMember> {
        self.members.iter().find(|m| m.person.id == id)
    }

    /// The tree as it will be stored for the primary family. Every person is
    /// re-tagged as primary.
    pub fn to_snapshot(&self) -> TreeSnapshot {
        TreeSnapshot {
            people: self
                .members
                .iter()
                .map(|m| {
                    let mut person = m.person.clone();
                    person.source = SourceTree::Primary;
                    person
                })
                .collect(),
            edges: self.edges.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlanAction {
    Keep {
        primary: PersonId,
    },
    Annotate {
        primary: PersonId,
        secondary: PersonId,
        resolved: Vec<ResolvedField>,
    },
    Add {
        secondary: PersonId,
        merged: PersonId,
    },
    Relink {
        edge: EdgeRecord,
    },
    PromoteAdmin {
        secondary: PersonId,
        merged: PersonId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergePlan {
    pub final_tree: FinalTree,
    pub added_edges: Vec<EdgeRecord>,
    pub actions: Vec<PlanAction>,
}

/// Plans a merge from accepted decisions.
///
/// Fails with [`EngineError::Validation`] when the decisions reference
/// unknown persons or contradict each other, and with
/// [`EngineError::StructuralConflict`] when the merged tree would violate
/// the parent invariant or contain a parent cycle.
pub fn plan_merge(inputs: &MergeInputs<'_>) -> Result<MergePlan, EngineError> {
    validate(inputs)?;

    let pairs: Vec<(PersonId, PersonId)> = inputs.matches.iter().map(AcceptedMatch::pair).collect();
    let union = UnionGraph::build(inputs.primary, inputs.secondary, &pairs)?;

    // Any cycle in the merged tree blocks, including one inherited from a
    // source tree.
    let blocking = union_conflicts(&union, &[]);
    if !blocking.is_empty() {
        return Err(EngineError::StructuralConflict {
            conflicts: blocking,
        });
    }

    let by_primary: BTreeMap<PersonId, &AcceptedMatch> =
        inputs.matches.iter().map(|m| (m.primary, m)).collect();
    let admins: BTreeSet<PersonId> = inputs.admin_promotions.iter().copied().collect();

    let mut members = Vec::new();
    let mut actions = Vec::new();
    let mut ids = union.graph.person_ids();
    ids.sort();
    for id in ids {
        let Some(person) = union.graph.person(id) else {
            continue;
        };
        let member = if let Some(accepted) = by_primary.get(&id) {
            let mut person = person.clone();
            let resolved = apply_resolutions(&mut person, accepted, inputs.secondary)?;
            actions.push(PlanAction::Annotate {
                primary: id,
                secondary: accepted.secondary,
                resolved,
            });
            TreeMember {
                person,
                origin: MemberOrigin::Matched,
                merged_from: Some(accepted.secondary),
                is_admin: admins.contains(&accepted.secondary),
            }
        } else if let Some(origin) = union
            .mapping
            .origin(id)
            .filter(|o| o.tree == SourceTree::Secondary)
        {
            actions.push(PlanAction::Add {
                secondary: origin.id,
                merged: id,
            });
            TreeMember {
                person: person.clone(),
                origin: MemberOrigin::Added,
                merged_from: Some(origin.id),
                is_admin: admins.contains(&origin.id),
            }
        } else {
            actions.push(PlanAction::Keep { primary: id });
            TreeMember {
                person: person.clone(),
                origin: MemberOrigin::Primary,
                merged_from: None,
                is_admin: false,
            }
        };
        members.push(member);
    }

    actions.extend(
        union
            .added_edges
            .iter()
            .map(|edge| PlanAction::Relink { edge: edge.clone() }),
    );
    for secondary in &admins {
        if let Some(merged) = union.mapping.merged(*secondary) {
            actions.push(PlanAction::PromoteAdmin {
                secondary: *secondary,
                merged,
            });
        }
    }

    Ok(MergePlan {
        final_tree: FinalTree {
            members,
            edges: union.graph.edges(),
        },
        added_edges: union.added_edges,
        actions,
    })
}

fn validate(inputs: &MergeInputs<'_>) -> Result<(), EngineError> {
    let mut primaries = BTreeSet::new();
    let mut secondaries = BTreeSet::new();
    for m in inputs.matches {
        if !inputs.primary.contains(m.primary) {
            return Err(EngineError::Validation(format!(
                "accepted match references unknown primary person {}",
                m.primary
            )));
        }
        if !inputs.secondary.contains(m.secondary) {
            return Err(EngineError::Validation(format!(
                "accepted match references unknown secondary person {}",
                m.secondary
            )));
        }
        if !primaries.insert(m.primary) {
            return Err(EngineError::Validation(format!(
                "primary person {} is matched more than once",
                m.primary
            )));
        }
        if !secondaries.insert(m.secondary) {
            return Err(EngineError::Validation(format!(
                "secondary person {} is matched more than once",
                m.secondary
            )));
        }
    }

    for id in inputs.new_persons {
        if !inputs.secondary.contains(*id) {
            return Err(EngineError::Validation(format!(
                "new person {} is not in the secondary tree",
                id
            )));
        }
        if secondaries.contains(id) {
            return Err(EngineError::Validation(format!(
                "person {} is both matched and listed as new",
                id
            )));
        }
    }

    for id in inputs.admin_promotions {
        if !inputs.secondary.contains(*id) {
            return Err(EngineError::Validation(format!(
                "admin promotion references unknown secondary person {}",
                id
            )));
        }
    }
    Ok(())
}

fn apply_resolutions(
    person: &mut Person,
    accepted: &AcceptedMatch,
    secondary: &FamilyGraph,
) -> Result<Vec<ResolvedField>, EngineError> {
    let Some(source) = secondary.person(accepted.secondary) else {
        return Err(EngineError::Validation(format!(
            "accepted match references unknown secondary person {}",
            accepted.secondary
        )));
    };
    let missing = |field: &ResolvedField| {
        EngineError::Validation(format!(
            "cannot take {:?} from secondary person {}: no value recorded",
            field, accepted.secondary
        ))
    };

    let mut resolved = Vec::new();
    for resolution in &accepted.resolutions {
        if resolution.choice == ResolutionChoice::KeepPrimary {
            continue;
        }
        match &resolution.field {
            ResolvedField::Age => {
                person.age = Some(source.age.ok_or_else(|| missing(&resolution.field))?);
            }
            ResolvedField::Dob => {
                person.dob = Some(source.dob.ok_or_else(|| missing(&resolution.field))?);
            }
            ResolvedField::Attribute(key) => {
                let value = source
                    .attributes
                    .get(key)
                    .ok_or_else(|| missing(&resolution.field))?;
                person.attributes.insert(key.clone(), value.clone());
            }
        }
        resolved.push(resolution.field.clone());
    }
    resolved.sort();
    resolved.dedup();
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictKind;
    use kinmerge_core::{Gender, ParentRole};

    fn p(id: u32, name: &str, generation: i32) -> Person {
        Person::new(PersonId(id), name, generation, SourceTree::Primary)
    }

    fn s(id: u32, name: &str, generation: i32) -> Person {
        Person::new(PersonId(id), name, generation, SourceTree::Secondary)
    }

    fn family() -> (FamilyGraph, FamilyGraph) {
        let primary = FamilyGraph::load_tree(
            vec![
                p(1, "Ramesh", 0).with_gender(Gender::Male).with_age(70),
                p(2, "Sunil", 1).with_gender(Gender::Male).with_age(45),
            ],
            vec![EdgeRecord::parent(PersonId(1), PersonId(2), Some(ParentRole::Father))],
        )
        .unwrap();
        let secondary = FamilyGraph::load_tree(
            vec![
                s(1, "Sunil", 1)
                    .with_gender(Gender::Male)
                    .with_age(46)
                    .with_attribute("city", "Pune"),
                s(2, "Kavya", 1).with_gender(Gender::Female).with_age(43),
                s(3, "Arjun", 2).with_gender(Gender::Male).with_age(15),
            ],
            vec![
                EdgeRecord::spouse(PersonId(1), PersonId(2)),
                EdgeRecord::parent(PersonId(1), PersonId(3), Some(ParentRole::Father)),
                EdgeRecord::parent(PersonId(2), PersonId(3), Some(ParentRole::Mother)),
            ],
        )
        .unwrap();
        (primary, secondary)
    }

    #[test]
    fn matched_person_is_annotated_and_new_persons_appended() {
        let (primary, secondary) = family();
        let matches = vec![AcceptedMatch::new(PersonId(2), PersonId(1))];
        let plan = plan_merge(&MergeInputs {
            primary: &primary,
            secondary: &secondary,
            matches: &matches,
            new_persons: &[PersonId(2), PersonId(3)],
            admin_promotions: &[PersonId(2)],
        })
        .unwrap();

        let tree = &plan.final_tree;
        assert_eq!(tree.members.len(), 4);
        let sunil = tree.member(PersonId(2)).unwrap();
        assert_eq!(sunil.origin, MemberOrigin::Matched);
        assert_eq!(sunil.merged_from, Some(PersonId(1)));
        assert_eq!(sunil.person.age, Some(45));

        let kavya = tree.member(PersonId(3)).unwrap();
        assert_eq!(kavya.origin, MemberOrigin::Added);
        assert!(kavya.is_admin);
        assert_eq!(tree.member(PersonId(4)).unwrap().person.name, "Arjun");

        assert_eq!(
            plan.added_edges,
            vec![
                EdgeRecord::spouse(PersonId(2), PersonId(3)),
                EdgeRecord::parent(PersonId(2), PersonId(4), Some(ParentRole::Father)),
                EdgeRecord::parent(PersonId(3), PersonId(4), Some(ParentRole::Mother)),
            ]
        );
        assert_eq!(
            plan.actions.last(),
            Some(&PlanAction::PromoteAdmin {
                secondary: PersonId(2),
                merged: PersonId(3)
            })
        );
    }

    #[test]
    fn resolutions_take_secondary_values() {
        let (primary, secondary) = family();
        let matches = vec![AcceptedMatch {
            primary: PersonId(2),
            secondary: PersonId(1),
            resolutions: vec![
                FieldResolution {
                    field: ResolvedField::Age,
                    choice: ResolutionChoice::TakeSecondary,
                },
                FieldResolution {
                    field: ResolvedField::Attribute("city".into()),
                    choice: ResolutionChoice::TakeSecondary,
                },
            ],
        }];
        let plan = plan_merge(&MergeInputs {
            primary: &primary,
            secondary: &secondary,
            matches: &matches,
            new_persons: &[],
            admin_promotions: &[],
        })
        .unwrap();
        let sunil = &plan.final_tree.member(PersonId(2)).unwrap().person;
        assert_eq!(sunil.age, Some(46));
        assert_eq!(sunil.attributes.get("city").map(String::as_str), Some("Pune"));
        // Source graphs are never mutated.
        assert_eq!(primary.person(PersonId(2)).unwrap().age, Some(45));
    }

    #[test]
    fn taking_a_missing_value_is_rejected() {
        let (primary, secondary) = family();
        let matches = vec![AcceptedMatch {
            primary: PersonId(2),
            secondary: PersonId(1),
            resolutions: vec![FieldResolution {
                field: ResolvedField::Dob,
                choice: ResolutionChoice::TakeSecondary,
            }],
        }];
        let err = plan_merge(&MergeInputs {
            primary: &primary,
            secondary: &secondary,
            matches: &matches,
            new_persons: &[],
            admin_promotions: &[],
        })
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn no_match_plan_keeps_every_person() {
        let (primary, secondary) = family();
        let plan = plan_merge(&MergeInputs {
            primary: &primary,
            secondary: &secondary,
            matches: &[],
            new_persons: &[PersonId(1), PersonId(2), PersonId(3)],
            admin_promotions: &[],
        })
        .unwrap();
        assert_eq!(
            plan.final_tree.members.len(),
            primary.person_count() + secondary.person_count()
        );
    }

    #[test]
    fn planning_is_byte_identical_across_runs() {
        let (primary, secondary) = family();
        let matches = vec![AcceptedMatch::new(PersonId(2), PersonId(1))];
        let inputs = MergeInputs {
            primary: &primary,
            secondary: &secondary,
            matches: &matches,
            new_persons: &[],
            admin_promotions: &[],
        };
        let first = serde_json::to_vec(&plan_merge(&inputs).unwrap().final_tree).unwrap();
        let second = serde_json::to_vec(&plan_merge(&inputs).unwrap().final_tree).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn contradictory_decisions_fail_validation() {
        let (primary, secondary) = family();
        let matches = vec![AcceptedMatch::new(PersonId(2), PersonId(1))];
        let both = plan_merge(&MergeInputs {
            primary: &primary,
            secondary: &secondary,
            matches: &matches,
            new_persons: &[PersonId(1)],
            admin_promotions: &[],
        });
        assert!(matches!(both, Err(EngineError::Validation(_))));

        let twice = vec![
            AcceptedMatch::new(PersonId(2), PersonId(1)),
            AcceptedMatch::new(PersonId(2), PersonId(2)),
        ];
        let dup = plan_merge(&MergeInputs {
            primary: &primary,
            secondary: &secondary,
            matches: &twice,
            new_persons: &[],
            admin_promotions: &[],
        });
        assert!(matches!(dup, Err(EngineError::Validation(_))));

        let unknown_admin = plan_merge(&MergeInputs {
            primary: &primary,
            secondary: &secondary,
            matches: &[],
            new_persons: &[],
            admin_promotions: &[PersonId(99)],
        });
        assert!(matches!(unknown_admin, Err(EngineError::Validation(_))));
    }

    #[test]
    fn third_parent_is_a_structural_conflict() {
        let primary = FamilyGraph::load_tree(
            vec![
                p(1, "Dad", 0).with_gender(Gender::Male),
                p(2, "Mom", 0).with_gender(Gender::Female),
                p(3, "Kid", 1),
            ],
            vec![
                EdgeRecord::parent(PersonId(1), PersonId(3), Some(ParentRole::Father)),
                EdgeRecord::parent(PersonId(2), PersonId(3), Some(ParentRole::Mother)),
            ],
        )
        .unwrap();
        let secondary = FamilyGraph::load_tree(
            vec![s(1, "Stranger", 0), s(2, "Kid", 1)],
            vec![EdgeRecord::parent(PersonId(1), PersonId(2), None)],
        )
        .unwrap();
        let matches = vec![AcceptedMatch::new(PersonId(3), PersonId(2))];
        let err = plan_merge(&MergeInputs {
            primary: &primary,
            secondary: &secondary,
            matches: &matches,
            new_persons: &[],
            admin_promotions: &[],
        })
        .unwrap_err();
        match err {
            EngineError::StructuralConflict { conflicts } => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].kind, ConflictKind::ParentRoleClash);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
