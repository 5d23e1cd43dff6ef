//! Engine error types.

use kinmerge_core::CoreError;
use thiserror::Error;

use crate::conflict::Conflict;

/// Errors produced by the engine's planning functions.
///
/// Matching, classification, and alignment never fail; only the planners
/// reject inputs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// Inputs are inconsistent (unknown ids, contradictory decisions).
    #[error("validation error: {0}")]
    Validation(String),

    /// The decisions would produce a structurally invalid tree. Carries the
    /// hard conflicts that must be resolved first.
    #[error("{} hard conflict(s) block the merge", conflicts.len())]
    StructuralConflict { conflicts: Vec<Conflict> },

    /// A graph-model domain rule was violated.
    #[error(transparent)]
    Core(#[from] CoreError),
}
