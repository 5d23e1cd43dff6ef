//! Tunable engine parameters.
//!
//! Defaults follow the reconciliation contract: name and birth together
//! carry at least 60% of the match weight, the surfacing threshold is 50,
//! birth data agrees within one year, and a parent must be at least 12
//! years older than a child.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Largest weight a single field may carry.
pub const MAX_FIELD_WEIGHT: u32 = 10_000;

/// Relative weight of each compared field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchWeights {
    pub name: u32,
    pub birth: u32,
    pub gender: u32,
    pub generation: u32,
}

impl MatchWeights {
    /// Builds a weight set, rejecting sets where name and birth carry less
    /// than 60% of the total or any field exceeds [`MAX_FIELD_WEIGHT`].
    pub fn new(name: u32, birth: u32, gender: u32, generation: u32) -> Result<Self, EngineError> {
        let weights = MatchWeights {
            name,
            birth,
            gender,
            generation,
        };
        weights.validate()?;
        Ok(weights)
    }

    pub fn total(&self) -> u64 {
        [self.name, self.birth, self.gender, self.generation]
            .iter()
            .map(|w| u64::from(*w))
            .sum()
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let fields = [
            ("name", self.name),
            ("birth", self.birth),
            ("gender", self.gender),
            ("generation", self.generation),
        ];
        if let Some((field, weight)) = fields.iter().find(|(_, w)| *w > MAX_FIELD_WEIGHT) {
            return Err(EngineError::Validation(format!(
                "{} weight {} is above the maximum of {}",
                field, weight, MAX_FIELD_WEIGHT
            )));
        }
        let total = self.total();
        if total == 0 {
            return Err(EngineError::Validation(
                "match weights must not all be zero".to_string(),
            ));
        }
        let identity = u64::from(self.name) + u64::from(self.birth);
        if identity * 100 < total * 60 {
            return Err(EngineError::Validation(format!(
                "name + birth weight ({}) must be at least 60% of the total ({})",
                identity, total
            )));
        }
        Ok(())
    }
}

impl Default for MatchWeights {
    fn default() -> Self {
        MatchWeights {
            name: 40,
            birth: 25,
            gender: 15,
            generation: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatcherConfig {
    pub weights: MatchWeights,
    /// Minimum confidence (0-100) for a pair to be surfaced.
    pub threshold: u8,
    /// Birth years (or ages) within this many years agree.
    pub birth_tolerance_years: u32,
    /// Year used to compare a dob on one side with an age on the other.
    /// Without it such pairs are treated as not comparable.
    #[serde(default)]
    pub reference_year: Option<i32>,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        MatcherConfig {
            weights: MatchWeights::default(),
            threshold: 50,
            birth_tolerance_years: 1,
            reference_year: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub matcher: MatcherConfig,
    /// Smallest plausible age gap between a parent and a child.
    pub min_parent_gap_years: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            matcher: MatcherConfig::default(),
            min_parent_gap_years: 12,
        }
    }
}
