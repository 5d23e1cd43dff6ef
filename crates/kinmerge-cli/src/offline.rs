//! Analysis and planning of two tree files without a store.
//!
//! Uses the same engine calls as the merge service, so a file-based dry run
//! agrees with what the service would report for the same trees.

use std::path::Path;

use serde::Serialize;

use kinmerge_core::{FamilyGraph, SourceTree, TreeSnapshot};
use kinmerge_engine::{
    apply_offset, classify, match_graphs, plan_merge, suggest_offset, AcceptedMatch,
    ClassificationReport, EngineConfig, EngineError, Match, MergeInputs, MergePlan, NewPersons,
};

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Service(#[from] kinmerge_service::ServiceError),
}

impl CliError {
    /// Process exit code: 1 for rejected input, 2 for blocked merges,
    /// 3 for I/O and store failures.
    pub fn exit_code(&self) -> i32 {
        use kinmerge_service::ErrorCategory;
        match self {
            CliError::Io { .. } => 3,
            CliError::Parse { .. } => 1,
            CliError::Engine(EngineError::StructuralConflict { .. }) => 2,
            CliError::Engine(_) => 1,
            CliError::Service(e) => match e.category() {
                ErrorCategory::StructuralConflict => 2,
                ErrorCategory::Transport => 3,
                _ => 1,
            },
        }
    }
}

/// Reads a tree file and tags every person with `source`.
pub fn read_tree(path: &Path, source: SourceTree) -> Result<FamilyGraph, CliError> {
    let mut snapshot = read_snapshot(path)?;
    for person in &mut snapshot.people {
        person.source = source;
    }
    // Cycles are reported as crises, not refused at load.
    let graph = FamilyGraph::load_tree_allow_cycles(snapshot.people, snapshot.edges)
        .map_err(EngineError::from)?;
    Ok(graph)
}

pub fn read_snapshot(path: &Path) -> Result<TreeSnapshot, CliError> {
    let raw = std::fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| CliError::Parse {
        path: path.display().to_string(),
        source,
    })
}

#[derive(Debug, Serialize)]
pub struct OfflineAnalysis {
    pub matches: Vec<Match>,
    pub new_persons: NewPersons,
    pub classification: ClassificationReport,
    pub suggested_offset: i32,
    pub applied_offset: i32,
    pub blocking: bool,
}

pub fn analyze(
    primary: &FamilyGraph,
    secondary: &FamilyGraph,
    offset: i32,
    config: &EngineConfig,
) -> Result<OfflineAnalysis, CliError> {
    let shifted = apply_offset(secondary, offset).map_err(EngineError::from)?;
    let outcome = match_graphs(primary, &shifted, &config.matcher);
    let pairs = outcome.pairs();
    let classification = classify(primary, &shifted, &pairs, config)?;
    Ok(OfflineAnalysis {
        suggested_offset: suggest_offset(primary, secondary, &pairs),
        applied_offset: offset,
        blocking: classification.is_blocking(),
        matches: outcome.matches,
        new_persons: outcome.new_persons,
        classification,
    })
}

#[derive(Debug, Serialize)]
pub struct OfflinePlan {
    pub analysis: OfflineAnalysis,
    pub plan: MergePlan,
}

/// Accepts every surfaced match and plans the merge.
///
/// A blocking classification fails with
/// [`EngineError::StructuralConflict`] unless `force` is set.
pub fn plan(
    primary: &FamilyGraph,
    secondary: &FamilyGraph,
    offset: i32,
    config: &EngineConfig,
    force: bool,
) -> Result<OfflinePlan, CliError> {
    let analysis = analyze(primary, secondary, offset, config)?;
    if analysis.blocking && !force {
        return Err(EngineError::StructuralConflict {
            conflicts: analysis.classification.hard_conflicts(),
        }
        .into());
    }

    let shifted = apply_offset(secondary, offset).map_err(EngineError::from)?;
    let matches: Vec<AcceptedMatch> = analysis
        .matches
        .iter()
        .map(|m| {
            let (p, s) = m.pair();
            AcceptedMatch::new(p, s)
        })
        .collect();
    let plan = plan_merge(&MergeInputs {
        primary,
        secondary: &shifted,
        matches: &matches,
        new_persons: &analysis.new_persons.secondary,
        admin_promotions: &[],
    })?;
    tracing::debug!(
        "planned {} member(s) from {} accepted match(es)",
        plan.final_tree.members.len(),
        matches.len()
    );
    Ok(OfflinePlan { analysis, plan })
}
