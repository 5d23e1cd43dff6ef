//! The merge request lifecycle.
//!
//! [`MergeService`] drives a [`MergeRequest`] from initiation through
//! analysis and review to execution or rejection. Every change goes through
//! the same steps:
//!
//! 1. take the per-aggregate lock
//! 2. load the request and check it is mutable and at the caller's version
//! 3. apply the change and replan the final tree
//! 4. commit state and one history entry together, guarded by the version
//!
//! A replan that fails leaves the previous final tree in place and records
//! the failure in `plan_error`.

use std::collections::BTreeSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use kinmerge_core::{FamilyCode, FamilyGraph, PersonId, TreeSnapshot};
use kinmerge_engine::{
    classify, match_graphs, plan_merge, suggest_offset, AcceptedMatch, ClassificationReport,
    CrisisSeverity, FieldResolution, GenerationAlignment, Match, MergeInputs, NewPersons,
    ResolutionChoice, ResolvedField,
};
use kinmerge_storage::{
    hash_final_tree, hash_snapshot, HistoryDraft, HistoryEntry, MergeRequest, MergeRequestId,
    MergeStore, PrimaryStatus, SecondaryStatus, StorageError,
};

use crate::error::ServiceError;
use crate::identity::Actor;
use crate::lock::AggregateKey;
use crate::notifier::ParticipantEvent;
use crate::state::AppState;

/// One reviewer decision inside an edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DecisionChange {
    /// Accepts a match, replacing any match of either person.
    AcceptMatch {
        primary: PersonId,
        secondary: PersonId,
    },
    RemoveMatch {
        secondary: PersonId,
    },
    /// Picks the winning value of a field for an accepted match.
    ResolveField {
        secondary: PersonId,
        field: ResolvedField,
        choice: ResolutionChoice,
    },
    MarkNew {
        secondary: PersonId,
    },
    UnmarkNew {
        secondary: PersonId,
    },
    PromoteAdmin {
        secondary: PersonId,
    },
    DemoteAdmin {
        secondary: PersonId,
    },
    SetOffset {
        offset: i32,
        reason: String,
    },
    ClearOffset,
}

/// A partial patch; committed as exactly one history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeEdit {
    pub changes: Vec<DecisionChange>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub merge_request: MergeRequestId,
    /// Version of the request after the analysis was recorded.
    pub version: u64,
    pub matches: Vec<Match>,
    pub new_persons: NewPersons,
    pub classification: ClassificationReport,
    /// Offset the matched generations point to, relative to the unshifted
    /// secondary tree.
    pub suggested_offset: i32,
    pub applied_offset: i32,
}

pub struct MergeService<S> {
    state: AppState<S>,
}

impl<S> Clone for MergeService<S> {
    fn clone(&self) -> Self {
        MergeService {
            state: self.state.clone(),
        }
    }
}

impl<S: MergeStore + Send> MergeService<S> {
    pub fn new(state: AppState<S>) -> Self {
        MergeService { state }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Opens a merge of `secondary` into `primary`. Only an admin of the
    /// primary family may start one.
    pub async fn initiate(
        &self,
        primary: FamilyCode,
        secondary: FamilyCode,
        actor: &Actor,
    ) -> Result<MergeRequest, ServiceError> {
        if primary == secondary {
            return Err(ServiceError::Validation(format!(
                "cannot merge family {} into itself",
                primary
            )));
        }
        require_admin(actor, &primary)?;

        let request = MergeRequest::draft(primary.clone(), secondary.clone(), &actor.user_id, Utc::now());
        let draft = HistoryDraft::new(
            &actor.user_id,
            "merge initiated",
            json!({ "primary": primary.as_str(), "secondary": secondary.as_str() }),
        );
        let request = self
            .state
            .with_store(move |store| {
                store.load_tree(&primary)?;
                store.load_tree(&secondary)?;
                store.create_merge_request(request, draft)
            })
            .await?;

        tracing::info!(
            "merge {} initiated: {} <- {}",
            request.id,
            request.primary_family_code,
            request.secondary_family_code
        );
        self.state.notifier.notify(ParticipantEvent::MergeInitiated {
            merge_request: request.id,
            primary: request.primary_family_code.clone(),
            secondary: request.secondary_family_code.clone(),
        });
        Ok(request)
    }

    /// Matches and classifies the two trees under the stored offset and
    /// records that the request has been analyzed.
    pub async fn analyze(
        &self,
        id: MergeRequestId,
        actor: &Actor,
    ) -> Result<AnalysisReport, ServiceError> {
        let _guard = self.state.lock(AggregateKey::Merge(id)).await;
        let mut request = self.load(id).await?;
        ensure_mutable(&request, "analyze")?;
        require_member(actor, &request)?;

        let (primary, baseline) = self.load_trees(&request).await?;
        let alignment =
            GenerationAlignment::with_applied(baseline, request.generation_offset.clone())?;
        let engine = &self.state.config.engine;

        let outcome = match_graphs(&primary, alignment.current(), &engine.matcher);
        let pairs = outcome.pairs();
        let classification = classify(&primary, alignment.current(), &pairs, engine)?;
        let suggested_offset = suggest_offset(&primary, alignment.baseline(), &pairs);

        let expected = request.version;
        if request.primary_status == PrimaryStatus::Initiated {
            request.primary_status = PrimaryStatus::Analyzed;
        }
        replan(&mut request, &primary, alignment.current())?;
        request.touch(&actor.user_id, Utc::now());

        let crises: Vec<Value> = classification
            .crises
            .iter()
            .map(|c| to_json(&c.kind))
            .collect::<Result<_, _>>()?;
        let draft = HistoryDraft::new(
            &actor.user_id,
            "analysis run",
            json!({
                "matches": outcome.matches.len(),
                "conflicts": classification.conflicts.len(),
                "crises": crises,
                "suggested_offset": suggested_offset,
            }),
        );
        let version = request.version;
        self.commit(request, expected, draft).await?;

        tracing::info!(
            "merge {} analyzed: {} match(es), {} crisis(es), suggested offset {}",
            id,
            outcome.matches.len(),
            classification.crises.len(),
            suggested_offset
        );
        Ok(AnalysisReport {
            merge_request: id,
            version,
            matches: outcome.matches,
            new_persons: outcome.new_persons,
            classification,
            suggested_offset,
            applied_offset: alignment.offset(),
        })
    }

    pub async fn get_state(&self, id: MergeRequestId) -> Result<MergeRequest, ServiceError> {
        self.load(id).await
    }

    /// All history entries, oldest first.
    pub async fn get_history(&self, id: MergeRequestId) -> Result<Vec<HistoryEntry>, ServiceError> {
        self.state.with_store(move |store| store.list_history(id)).await
    }

    /// Overwrites the reviewer-controlled state with `payload`.
    ///
    /// The families, id, creation metadata and version come from the stored
    /// request; terminal statuses can only be reached through
    /// [`MergeService::execute`] and [`MergeService::reject`].
    pub async fn save_state(
        &self,
        id: MergeRequestId,
        payload: MergeRequest,
        expected_version: u64,
        actor: &Actor,
    ) -> Result<MergeRequest, ServiceError> {
        let _guard = self.state.lock(AggregateKey::Merge(id)).await;
        let current = self.load(id).await?;
        ensure_mutable(&current, "save state")?;
        require_member(actor, &current)?;
        check_version(&current, expected_version)?;

        if payload.primary_family_code != current.primary_family_code
            || payload.secondary_family_code != current.secondary_family_code
        {
            return Err(ServiceError::Validation(
                "the families of a merge request cannot change".to_string(),
            ));
        }
        if payload.primary_status.is_terminal()
            || payload.secondary_status != SecondaryStatus::AwaitingPrimary
        {
            return Err(ServiceError::Validation(format!(
                "status {} cannot be set directly",
                payload.primary_status
            )));
        }

        let mut request = MergeRequest {
            id: current.id,
            meta: current.meta.clone(),
            version: current.version,
            ..payload
        };
        let (primary, baseline) = self.load_trees(&request).await?;
        let alignment =
            GenerationAlignment::with_applied(baseline, request.generation_offset.clone())?;
        let changed = replan(&mut request, &primary, alignment.current())?;
        request.touch(&actor.user_id, Utc::now());

        let draft = HistoryDraft::new(
            &actor.user_id,
            "state saved",
            json!({ "final_tree_changed": changed }),
        );
        self.commit(request.clone(), expected_version, draft).await?;
        Ok(request)
    }

    /// Applies a batch of decision changes as one versioned edit.
    pub async fn apply_edit(
        &self,
        id: MergeRequestId,
        edit: MergeEdit,
        expected_version: u64,
        actor: &Actor,
    ) -> Result<MergeRequest, ServiceError> {
        if edit.changes.is_empty() {
            return Err(ServiceError::Validation("an edit needs at least one change".to_string()));
        }

        let _guard = self.state.lock(AggregateKey::Merge(id)).await;
        let mut request = self.load(id).await?;
        ensure_mutable(&request, "edit")?;
        require_member(actor, &request)?;
        if request.primary_status == PrimaryStatus::Initiated {
            return Err(ServiceError::transition(request.primary_status, "edit before analysis"));
        }
        check_version(&request, expected_version)?;

        let (primary, baseline) = self.load_trees(&request).await?;
        let mut alignment =
            GenerationAlignment::with_applied(baseline, request.generation_offset.clone())?;
        let now = Utc::now();
        for change in &edit.changes {
            apply_change(&mut request, &mut alignment, &primary, change, now)?;
        }
        request.generation_offset = alignment.applied().cloned();
        request.primary_status = PrimaryStatus::InReview;

        let changed = replan(&mut request, &primary, alignment.current())?;
        request.touch(&actor.user_id, now);

        let description = if edit.description.trim().is_empty() {
            "edit".to_string()
        } else {
            edit.description.clone()
        };
        let draft = HistoryDraft::new(
            &actor.user_id,
            description,
            json!({
                "changes": to_json(&edit.changes)?,
                "final_tree_changed": changed,
                "plan_error": request.plan_error,
            }),
        );
        self.commit(request.clone(), expected_version, draft).await?;
        tracing::debug!("merge {} edited to version {}", id, request.version);
        Ok(request)
    }

    /// Restores the state recorded at `version` as a new forward edit.
    pub async fn revert_to_version(
        &self,
        id: MergeRequestId,
        version: u64,
        expected_version: u64,
        actor: &Actor,
    ) -> Result<MergeRequest, ServiceError> {
        let _guard = self.state.lock(AggregateKey::Merge(id)).await;
        let current = self.load(id).await?;
        ensure_mutable(&current, "revert")?;
        require_member(actor, &current)?;
        check_version(&current, expected_version)?;

        let entry = self
            .state
            .with_store(move |store| store.history_entry(id, version))
            .await?;
        if entry.snapshot.is_terminal() {
            return Err(ServiceError::Validation(format!(
                "version {} is terminal and cannot be restored",
                version
            )));
        }

        let mut request = MergeRequest {
            id: current.id,
            meta: current.meta.clone(),
            version: current.version,
            ..entry.snapshot
        };
        request.touch(&actor.user_id, Utc::now());
        let draft = HistoryDraft::new(
            &actor.user_id,
            format!("reverted to version {}", version),
            json!({ "reverted_to": version }),
        );
        self.commit(request.clone(), expected_version, draft).await?;
        tracing::info!("merge {} reverted to version {}", id, version);
        Ok(request)
    }

    /// Marks final-tree members as approved. One unknown id fails the batch.
    pub async fn bulk_approve(
        &self,
        id: MergeRequestId,
        member_ids: &[PersonId],
        approver: &Actor,
        expected_version: u64,
    ) -> Result<MergeRequest, ServiceError> {
        if member_ids.is_empty() {
            return Err(ServiceError::Validation("no members to approve".to_string()));
        }

        let _guard = self.state.lock(AggregateKey::Merge(id)).await;
        let mut request = self.load(id).await?;
        ensure_mutable(&request, "approve members")?;
        require_member(approver, &request)?;
        check_version(&request, expected_version)?;

        let invalid: BTreeSet<PersonId> = member_ids
            .iter()
            .copied()
            .filter(|m| !request.final_tree.contains(*m))
            .collect();
        if !invalid.is_empty() {
            let ids: Vec<String> = invalid.iter().map(|m| m.to_string()).collect();
            return Err(ServiceError::Validation(format!(
                "not in the final tree: {}",
                ids.join(", ")
            )));
        }

        request.decisions.approved_members.extend(member_ids.iter().copied());
        request.touch(&approver.user_id, Utc::now());
        let draft = HistoryDraft::new(
            &approver.user_id,
            format!("approved {} member(s)", member_ids.len()),
            json!({ "approved": to_json(&member_ids)? }),
        );
        self.commit(request.clone(), expected_version, draft).await?;
        Ok(request)
    }

    /// Materializes the final tree into the primary family and completes the
    /// merge.
    ///
    /// Blocking classifications fail with
    /// [`ServiceError::StructuralConflict`]. A merge without any accepted
    /// match needs `confirm_no_match`.
    pub async fn execute(
        &self,
        id: MergeRequestId,
        actor: &Actor,
        confirm_no_match: bool,
    ) -> Result<MergeRequest, ServiceError> {
        let _guard = self.state.lock(AggregateKey::Merge(id)).await;
        let mut request = self.load(id).await?;
        ensure_mutable(&request, "execute")?;
        require_admin(actor, &request.primary_family_code)?;
        if request.primary_status == PrimaryStatus::Initiated {
            return Err(ServiceError::transition(request.primary_status, "execute before analysis"));
        }

        // Other merges into the same family wait here and then plan against
        // the tree this one writes.
        let _tree_guard = self
            .state
            .lock(AggregateKey::Family(request.primary_family_code.clone()))
            .await;
        let (primary, baseline) = self.load_snapshots(&request).await?;
        let base_tree_hash = hash_snapshot(&primary)?;
        let (primary, baseline) = (to_graph(primary)?, to_graph(baseline)?);
        let alignment =
            GenerationAlignment::with_applied(baseline, request.generation_offset.clone())?;
        let pairs: Vec<(PersonId, PersonId)> =
            request.decisions.matches.iter().map(AcceptedMatch::pair).collect();
        let report = classify(&primary, alignment.current(), &pairs, &self.state.config.engine)?;

        if report.is_blocking() {
            let crises = report
                .crises
                .iter()
                .filter(|c| c.severity == CrisisSeverity::Critical)
                .cloned()
                .collect();
            return Err(ServiceError::StructuralConflict {
                conflicts: report.hard_conflicts(),
                crises,
            });
        }
        if report.requires_confirmation() && !confirm_no_match {
            return Err(ServiceError::Validation(
                "no match was accepted; confirm to merge the trees as disjoint families".to_string(),
            ));
        }

        let plan = plan_merge(&MergeInputs {
            primary: &primary,
            secondary: alignment.current(),
            matches: &request.decisions.matches,
            new_persons: &request.decisions.new_persons,
            admin_promotions: &request.decisions.admin_promotions,
        })?;

        let expected = request.version;
        request.final_tree_hash = Some(hash_final_tree(&plan.final_tree)?);
        request.final_tree = plan.final_tree;
        request.plan_error = None;
        request.primary_status = PrimaryStatus::MergedCompleted;
        request.secondary_status = SecondaryStatus::MergedCompleted;
        request.touch(&actor.user_id, Utc::now());

        let merged: TreeSnapshot = request.final_tree.to_snapshot();
        let draft = HistoryDraft::new(
            &actor.user_id,
            "merge executed",
            json!({
                "members": merged.people.len(),
                "edges": merged.edges.len(),
                "actions": plan.actions.len(),
                "final_tree_hash": request.final_tree_hash,
            }),
        );
        let committed = request.clone();
        self.state
            .with_store(move |store| {
                store.commit_merge_execution(
                    &committed,
                    expected,
                    &base_tree_hash,
                    draft,
                    &merged,
                )
            })
            .await?;

        tracing::info!(
            "merge {} executed into {} ({} members)",
            id,
            request.primary_family_code,
            request.final_tree.members.len()
        );
        self.state.notifier.notify(ParticipantEvent::MergeCompleted {
            merge_request: id,
            primary: request.primary_family_code.clone(),
            secondary: request.secondary_family_code.clone(),
        });
        Ok(request)
    }

    pub async fn reject(
        &self,
        id: MergeRequestId,
        actor: &Actor,
        reason: &str,
    ) -> Result<MergeRequest, ServiceError> {
        let _guard = self.state.lock(AggregateKey::Merge(id)).await;
        let mut request = self.load(id).await?;
        ensure_mutable(&request, "reject")?;
        require_admin(actor, &request.primary_family_code)?;

        let expected = request.version;
        request.primary_status = PrimaryStatus::RejectedByPrimary;
        request.secondary_status = SecondaryStatus::RejectedByPrimary;
        request.touch(&actor.user_id, Utc::now());
        let draft = HistoryDraft::new(
            &actor.user_id,
            format!("merge rejected: {}", reason),
            json!({ "reason": reason }),
        );
        self.commit(request.clone(), expected, draft).await?;

        tracing::info!("merge {} rejected by {}", id, actor.user_id);
        self.state.notifier.notify(ParticipantEvent::MergeRejected {
            merge_request: id,
            primary: request.primary_family_code.clone(),
            secondary: request.secondary_family_code.clone(),
            reason: reason.to_string(),
        });
        Ok(request)
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    async fn load(&self, id: MergeRequestId) -> Result<MergeRequest, ServiceError> {
        self.state.with_store(move |store| store.load_merge_request(id)).await
    }

    /// Loads the primary tree and the unshifted secondary tree. Stored trees
    /// may contain cycles; classification reports them.
    async fn load_trees(
        &self,
        request: &MergeRequest,
    ) -> Result<(FamilyGraph, FamilyGraph), ServiceError> {
        let (p, s) = self.load_snapshots(request).await?;
        Ok((to_graph(p)?, to_graph(s)?))
    }

    async fn load_snapshots(
        &self,
        request: &MergeRequest,
    ) -> Result<(TreeSnapshot, TreeSnapshot), ServiceError> {
        let primary = request.primary_family_code.clone();
        let secondary = request.secondary_family_code.clone();
        self.state
            .with_store(move |store| Ok((store.load_tree(&primary)?, store.load_tree(&secondary)?)))
            .await
    }

    async fn commit(
        &self,
        request: MergeRequest,
        expected_version: u64,
        draft: HistoryDraft,
    ) -> Result<HistoryEntry, ServiceError> {
        self.state
            .with_store(move |store| store.commit_merge_request(&request, expected_version, draft))
            .await
    }
}

pub(crate) fn to_graph(snapshot: TreeSnapshot) -> Result<FamilyGraph, ServiceError> {
    Ok(FamilyGraph::load_tree_allow_cycles(
        snapshot.people,
        snapshot.edges,
    )?)
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<Value, ServiceError> {
    serde_json::to_value(value).map_err(|e| StorageError::from(e).into())
}

fn ensure_mutable(request: &MergeRequest, action: &str) -> Result<(), ServiceError> {
    if request.is_terminal() {
        return Err(ServiceError::transition(request.primary_status, action));
    }
    Ok(())
}

fn check_version(request: &MergeRequest, expected: u64) -> Result<(), ServiceError> {
    if request.version != expected {
        return Err(ServiceError::StaleState {
            expected,
            actual: request.version,
        });
    }
    Ok(())
}

fn require_member(actor: &Actor, request: &MergeRequest) -> Result<(), ServiceError> {
    if !actor.belongs_to(&request.primary_family_code) {
        return Err(ServiceError::Forbidden(format!(
            "{} is not a member of family {}",
            actor.user_id, request.primary_family_code
        )));
    }
    Ok(())
}

fn require_admin(actor: &Actor, family: &FamilyCode) -> Result<(), ServiceError> {
    if !actor.is_admin_of(family) {
        return Err(ServiceError::Forbidden(format!(
            "{} is not an admin of family {}",
            actor.user_id, family
        )));
    }
    Ok(())
}

/// Recomputes the final tree from the current decisions. Returns whether the
/// tree changed. Planning failures are recorded, not returned.
fn replan(
    request: &mut MergeRequest,
    primary: &FamilyGraph,
    secondary: &FamilyGraph,
) -> Result<bool, ServiceError> {
    let planned = plan_merge(&MergeInputs {
        primary,
        secondary,
        matches: &request.decisions.matches,
        new_persons: &request.decisions.new_persons,
        admin_promotions: &request.decisions.admin_promotions,
    });
    match planned {
        Ok(plan) => {
            let hash = hash_final_tree(&plan.final_tree)?;
            let changed = request.final_tree_hash.as_deref() != Some(hash.as_str());
            request.final_tree = plan.final_tree;
            request.final_tree_hash = Some(hash);
            request.plan_error = None;
            let tree = &request.final_tree;
            request
                .decisions
                .approved_members
                .retain(|m| tree.contains(*m));
            Ok(changed)
        }
        Err(e) => {
            tracing::warn!("merge {} replan failed: {}", request.id, e);
            request.plan_error = Some(e.to_string());
            Ok(false)
        }
    }
}

fn apply_change(
    request: &mut MergeRequest,
    alignment: &mut GenerationAlignment,
    primary: &FamilyGraph,
    change: &DecisionChange,
    now: chrono::DateTime<Utc>,
) -> Result<(), ServiceError> {
    let secondary = alignment.baseline();
    let require_secondary = |id: PersonId| {
        if secondary.contains(id) {
            Ok(())
        } else {
            Err(ServiceError::Validation(format!(
                "person {} is not in the secondary tree",
                id
            )))
        }
    };
    let decisions = &mut request.decisions;

    match change {
        DecisionChange::AcceptMatch {
            primary: p,
            secondary: s,
        } => {
            if !primary.contains(*p) {
                return Err(ServiceError::Validation(format!(
                    "person {} is not in the primary tree",
                    p
                )));
            }
            require_secondary(*s)?;
            decisions
                .matches
                .retain(|m| m.primary != *p && m.secondary != *s);
            decisions.matches.push(AcceptedMatch::new(*p, *s));
            decisions.matches.sort_by_key(|m| m.secondary);
            decisions.new_persons.retain(|n| n != s);
        }
        DecisionChange::RemoveMatch { secondary: s } => {
            let before = decisions.matches.len();
            decisions.matches.retain(|m| m.secondary != *s);
            if decisions.matches.len() == before {
                return Err(ServiceError::Validation(format!(
                    "person {} has no accepted match",
                    s
                )));
            }
        }
        DecisionChange::ResolveField {
            secondary: s,
            field,
            choice,
        } => {
            let accepted = decisions
                .matches
                .iter_mut()
                .find(|m| m.secondary == *s)
                .ok_or_else(|| {
                    ServiceError::Validation(format!("person {} has no accepted match", s))
                })?;
            accepted.resolutions.retain(|r| r.field != *field);
            accepted.resolutions.push(FieldResolution {
                field: field.clone(),
                choice: *choice,
            });
            accepted.resolutions.sort_by(|a, b| a.field.cmp(&b.field));
        }
        DecisionChange::MarkNew { secondary: s } => {
            require_secondary(*s)?;
            if decisions.matches.iter().any(|m| m.secondary == *s) {
                return Err(ServiceError::Validation(format!(
                    "person {} is matched; remove the match first",
                    s
                )));
            }
            if !decisions.new_persons.contains(s) {
                decisions.new_persons.push(*s);
                decisions.new_persons.sort();
            }
        }
        DecisionChange::UnmarkNew { secondary: s } => {
            decisions.new_persons.retain(|n| n != s);
        }
        DecisionChange::PromoteAdmin { secondary: s } => {
            require_secondary(*s)?;
            if !decisions.admin_promotions.contains(s) {
                decisions.admin_promotions.push(*s);
                decisions.admin_promotions.sort();
            }
        }
        DecisionChange::DemoteAdmin { secondary: s } => {
            decisions.admin_promotions.retain(|n| n != s);
        }
        DecisionChange::SetOffset { offset, reason } => {
            alignment.set_offset(*offset, reason.clone(), now)?;
        }
        DecisionChange::ClearOffset => {
            alignment.revert();
        }
    }
    Ok(())
}
