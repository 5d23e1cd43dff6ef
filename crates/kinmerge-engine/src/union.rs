//! Provisional union of a primary and a secondary tree.
//!
//! The union starts from a copy of the primary graph. Matched secondary
//! persons collapse onto their primary counterpart; unmatched ones are
//! appended with fresh ids (max primary id + 1, ascending secondary id
//! order). Secondary edges are then translated to merged ids and replayed
//! through the graph builder, which enforces the parent invariant but not
//! acyclicity. Edges the builder refuses are kept with their error so the
//! classifier and planner can report them.

use std::collections::{BTreeMap, BTreeSet};

use kinmerge_core::{CoreError, EdgeRecord, FamilyGraph, PersonId, PersonRef, SourceTree};

use crate::error::EngineError;

/// Translation between secondary ids and merged ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdMapping {
    secondary_to_merged: BTreeMap<PersonId, PersonId>,
    origins: BTreeMap<PersonId, PersonRef>,
}

impl IdMapping {
    /// Merged id a secondary person ends up with.
    pub fn merged(&self, secondary: PersonId) -> Option<PersonId> {
        self.secondary_to_merged.get(&secondary).copied()
    }

    /// Where a merged id came from. Matched persons report their primary
    /// origin.
    pub fn origin(&self, merged: PersonId) -> Option<PersonRef> {
        self.origins.get(&merged).copied()
    }

    /// Secondary persons that were appended rather than matched, as
    /// `(secondary id, merged id)` pairs in secondary-id order.
    pub fn added(&self) -> impl Iterator<Item = (PersonId, PersonId)> + '_ {
        self.secondary_to_merged
            .iter()
            .filter(|(_, merged)| {
                self.origins
                    .get(merged)
                    .is_some_and(|origin| origin.tree == SourceTree::Secondary)
            })
            .map(|(s, m)| (*s, *m))
    }
}

/// A translated secondary edge the builder refused.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedEdge {
    /// The edge as it appeared in the secondary tree.
    pub source: EdgeRecord,
    /// The same edge in merged ids.
    pub translated: EdgeRecord,
    pub error: CoreError,
}

#[derive(Debug, Clone)]
pub struct UnionGraph {
    pub graph: FamilyGraph,
    pub mapping: IdMapping,
    /// Translated edges that were new to the primary tree, in the order they
    /// were applied.
    pub added_edges: Vec<EdgeRecord>,
    pub rejected_edges: Vec<RejectedEdge>,
}

impl UnionGraph {
    /// Builds the union. `pairs` maps primary id to secondary id and must be
    /// one-to-one over persons that exist in their trees.
    pub fn build(
        primary: &FamilyGraph,
        secondary: &FamilyGraph,
        pairs: &[(PersonId, PersonId)],
    ) -> Result<Self, EngineError> {
        let mut graph = primary.clone();
        let mut mapping = IdMapping::default();

        for id in primary.person_ids() {
            mapping.origins.insert(id, PersonRef::primary(id));
        }

        let mut matched: BTreeMap<PersonId, PersonId> = BTreeMap::new();
        let mut claimed: BTreeSet<PersonId> = BTreeSet::new();
        for &(p, s) in pairs {
            if !primary.contains(p) {
                return Err(EngineError::Validation(format!(
                    "match references unknown primary person {}",
                    p
                )));
            }
            if !secondary.contains(s) {
                return Err(EngineError::Validation(format!(
                    "match references unknown secondary person {}",
                    s
                )));
            }
            if matched.insert(s, p).is_some() || !claimed.insert(p) {
                return Err(EngineError::Validation(format!(
                    "matches are not one-to-one around primary {} / secondary {}",
                    p, s
                )));
            }
        }

        // `None` once the id space is exhausted; only an actual allocation fails.
        let mut next_id = primary.max_person_id().map_or(Some(1), |id| id.0.checked_add(1));
        let mut secondary_ids = secondary.person_ids();
        secondary_ids.sort();
        for s in secondary_ids {
            if let Some(p) = matched.get(&s) {
                mapping.secondary_to_merged.insert(s, *p);
                continue;
            }
            let Some(person) = secondary.person(s) else {
                continue;
            };
            let merged = next_id.map(PersonId).ok_or_else(|| CoreError::OutOfRange {
                what: format!("merged id for secondary person {}", s),
            })?;
            next_id = merged.0.checked_add(1);
            let mut copy = person.clone();
            copy.id = merged;
            graph.add_person(copy)?;
            mapping.secondary_to_merged.insert(s, merged);
            mapping.origins.insert(merged, PersonRef::secondary(s));
        }

        let mut added_edges = Vec::new();
        let mut rejected_edges = Vec::new();
        for edge in secondary.edges() {
            let (Some(from), Some(to)) = (mapping.merged(edge.from), mapping.merged(edge.to))
            else {
                continue;
            };
            let translated = EdgeRecord {
                from,
                to,
                relation: edge.relation,
            };
            if graph.has_edge(&translated) {
                continue;
            }
            match graph.add_edge(&translated) {
                Ok(true) => added_edges.push(translated),
                Ok(false) => {}
                Err(error) => rejected_edges.push(RejectedEdge {
                    source: edge,
                    translated,
                    error,
                }),
            }
        }

        Ok(UnionGraph {
            graph,
            mapping,
            added_edges,
            rejected_edges,
        })
    }

    /// Maps a merged id back to the reference reviewers know it by.
    pub fn origin_ref(&self, merged: PersonId) -> PersonRef {
        self.mapping
            .origin(merged)
            .unwrap_or(PersonRef::primary(merged))
    }
}
