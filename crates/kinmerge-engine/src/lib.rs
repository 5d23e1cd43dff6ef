//! Reconciliation engine for two family trees.
//!
//! Everything in this crate is a pure function over immutable
//! [`FamilyGraph`](kinmerge_core::FamilyGraph) snapshots:
//!
//! - [`matcher`]: candidate person-to-person matches with confidence scores
//! - [`conflict`] and [`crisis`]: hard/soft conflicts and whole-graph crises
//! - [`aligner`]: generation offset suggestion and reversible application
//! - [`planner`]: deterministic final-tree materialization
//! - [`link`]: single-edge link planning between two owned trees
//! - [`union`]: the provisional union graph shared by classifier and planner
//!
//! None of these perform I/O or keep state between calls.

pub mod aligner;
pub mod config;
pub mod conflict;
pub mod crisis;
pub mod error;
pub mod link;
pub mod matcher;
pub mod planner;
pub mod union;

pub use aligner::{apply_offset, suggest_offset, AppliedOffset, GenerationAlignment};
pub use config::{EngineConfig, MatchWeights, MatcherConfig};
pub use conflict::{Conflict, ConflictKind, ConflictSeverity};
pub use crisis::{classify, ClassificationReport, Crisis, CrisisKind, CrisisSeverity};
pub use error::EngineError;
pub use link::{plan_link, CrossLink, LinkContext, LinkPlan, LinkedFamilies};
pub use matcher::{match_graphs, Match, MatchField, MatchLevel, MatchOutcome, NewPersons};
pub use planner::{
    plan_merge, AcceptedMatch, FieldResolution, FinalTree, MemberOrigin, MergeInputs, MergePlan,
    PlanAction, ResolutionChoice, ResolvedField, TreeMember,
};
pub use union::{IdMapping, RejectedEdge, UnionGraph};
