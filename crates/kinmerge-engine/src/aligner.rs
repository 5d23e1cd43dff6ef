//! Generation offset suggestion and reversible application.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use kinmerge_core::{CoreError, FamilyGraph, PersonId};

/// An offset in effect for the secondary tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedOffset {
    pub offset: i32,
    pub reason: String,
    pub applied_at: DateTime<Utc>,
}

/// Suggests the offset that aligns `secondary` with `primary`.
///
/// Takes the most frequent `primary.generation - secondary.generation` over
/// the matched pairs. Ties go to the smallest magnitude, then to the smaller
/// value. Pairs whose difference overflows are skipped. With no usable pairs
/// the suggestion is 0.
pub fn suggest_offset(
    primary: &FamilyGraph,
    secondary: &FamilyGraph,
    pairs: &[(PersonId, PersonId)],
) -> i32 {
    let mut counts: BTreeMap<i32, usize> = BTreeMap::new();
    for &(p, s) in pairs {
        let diff = primary
            .person(p)
            .zip(secondary.person(s))
            .and_then(|(a, b)| a.generation.checked_sub(b.generation));
        if let Some(diff) = diff {
            *counts.entry(diff).or_default() += 1;
        }
    }
    counts
        .into_iter()
        .min_by_key(|(diff, count)| (std::cmp::Reverse(*count), diff.unsigned_abs(), *diff))
        .map_or(0, |(diff, _)| diff)
}

/// Returns a copy of `graph` with every generation shifted by `offset`.
pub fn apply_offset(graph: &FamilyGraph, offset: i32) -> Result<FamilyGraph, CoreError> {
    graph.shift_generations(offset)
}

/// Holds the unshifted secondary tree and the offset currently applied.
///
/// Offsets are absolute: each call to [`GenerationAlignment::set_offset`]
/// shifts from the baseline, so offsets never compound.
#[derive(Debug, Clone)]
pub struct GenerationAlignment {
    baseline: FamilyGraph,
    current: FamilyGraph,
    applied: Option<AppliedOffset>,
}

impl GenerationAlignment {
    pub fn new(baseline: FamilyGraph) -> Self {
        GenerationAlignment {
            current: baseline.clone(),
            baseline,
            applied: None,
        }
    }

    /// Restores a previously recorded offset over `baseline`.
    pub fn with_applied(
        baseline: FamilyGraph,
        applied: Option<AppliedOffset>,
    ) -> Result<Self, CoreError> {
        let mut alignment = GenerationAlignment::new(baseline);
        if let Some(applied) = applied {
            alignment.current = apply_offset(&alignment.baseline, applied.offset)?;
            alignment.applied = Some(applied);
        }
        Ok(alignment)
    }

    pub fn set_offset(
        &mut self,
        offset: i32,
        reason: impl Into<String>,
        applied_at: DateTime<Utc>,
    ) -> Result<&AppliedOffset, CoreError> {
        // A failed shift keeps the previous offset in effect.
        self.current = apply_offset(&self.baseline, offset)?;
        Ok(self.applied.insert(AppliedOffset {
            offset,
            reason: reason.into(),
            applied_at,
        }))
    }

    /// Drops the applied offset and returns the baseline view.
    pub fn revert(&mut self) -> Option<AppliedOffset> {
        self.current = self.baseline.clone();
        self.applied.take()
    }

    pub fn baseline(&self) -> &FamilyGraph {
        &self.baseline
    }

    pub fn current(&self) -> &FamilyGraph {
        &self.current
    }

    pub fn applied(&self) -> Option<&AppliedOffset> {
        self.applied.as_ref()
    }

    pub fn offset(&self) -> i32 {
        self.applied.as_ref().map_or(0, |a| a.offset)
    }
}
