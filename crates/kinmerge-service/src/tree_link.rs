//! Single-edge link requests between independently owned trees.
//!
//! A request moves `Pending -> Accepted -> Executed`, or ends as `Rejected`
//! or `Revoked` while pending. Acceptance and execution are separate steps:
//! an accepted request whose execution fails stays accepted with the error
//! recorded and can be retried.
//!
//! Executed links are kept on the request and never written into either
//! tree. Planning therefore loads every family reachable through executed
//! links, so linked parents count toward the parent rules and a new parent
//! edge cannot close a cycle across families.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use kinmerge_core::{FamilyCode, NodeRef, ParentRole, RelationshipType};
use kinmerge_engine::{plan_link, CrossLink, LinkContext, LinkPlan, LinkedFamilies};
use kinmerge_storage::{LinkStatus, MergeStore, TreeLinkRequest, TreeLinkRequestId};

use crate::error::{ErrorCategory, ServiceError};
use crate::identity::Actor;
use crate::lock::AggregateKey;
use crate::notifier::ParticipantEvent;
use crate::state::AppState;
use crate::state_store::to_graph;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateLink {
    pub sender: NodeRef,
    pub receiver: NodeRef,
    /// Relationship of the receiver to the sender.
    pub relationship: RelationshipType,
    #[serde(default)]
    pub parent_role: Option<ParentRole>,
    #[serde(default)]
    pub confirm_override: bool,
}

pub struct TreeLinkService<S> {
    state: AppState<S>,
}

impl<S> Clone for TreeLinkService<S> {
    fn clone(&self) -> Self {
        TreeLinkService {
            state: self.state.clone(),
        }
    }
}

impl<S: MergeStore + Send> TreeLinkService<S> {
    pub fn new(state: AppState<S>) -> Self {
        TreeLinkService { state }
    }

    /// Files a link request from a member of the sender's family.
    pub async fn create(
        &self,
        actor: &Actor,
        request: CreateLink,
    ) -> Result<TreeLinkRequest, ServiceError> {
        if !actor.belongs_to(&request.sender.family_code) {
            return Err(ServiceError::Forbidden(format!(
                "{} is not a member of family {}",
                actor.user_id, request.sender.family_code
            )));
        }

        let _guard = self
            .state
            .lock(AggregateKey::link_pair(&request.sender, &request.receiver))
            .await;

        let (a, b) = (request.sender.clone(), request.receiver.clone());
        if let Some(existing) = self
            .state
            .with_store(move |store| store.find_pending_link(&a, &b))
            .await?
        {
            return Err(ServiceError::DuplicateLinkRequest {
                existing: existing.id,
            });
        }

        let plan = self
            .plan(
                &request.sender,
                &request.receiver,
                request.relationship,
                request.parent_role,
                request.confirm_override,
            )
            .await?;

        let now = Utc::now();
        let link = TreeLinkRequest {
            id: TreeLinkRequestId(0),
            sender: request.sender,
            receiver: request.receiver,
            relationship: request.relationship,
            parent_role: plan.parent_role(),
            status: LinkStatus::Pending,
            created_by: actor.user_id.clone(),
            confirm_override: request.confirm_override,
            execution_error: None,
            executed: None,
            created_at: now,
            updated_at: now,
            version: 1,
        };
        let link = self.state.with_store(move |store| store.insert_link(link)).await?;

        tracing::info!("link {} requested: {} -> {}", link.id, link.sender, link.receiver);
        self.state.notifier.notify(ParticipantEvent::LinkRequested {
            link: link.id,
            receiver_family: link.receiver.family_code.clone(),
        });
        Ok(link)
    }

    /// Withdraws a pending request. Only its creator may revoke it.
    pub async fn revoke(
        &self,
        id: TreeLinkRequestId,
        actor: &Actor,
    ) -> Result<TreeLinkRequest, ServiceError> {
        let _guard = self.state.lock(AggregateKey::Link(id)).await;
        let mut link = self.load(id).await?;
        ensure_status(&link, LinkStatus::Pending, "revoke")?;
        if link.created_by != actor.user_id {
            return Err(ServiceError::Forbidden(format!(
                "only {} may revoke link {}",
                link.created_by, id
            )));
        }

        link.status = LinkStatus::Revoked;
        let link = self.update(link).await?;
        self.state.notifier.notify(ParticipantEvent::LinkRevoked {
            link: id,
            receiver_family: link.receiver.family_code.clone(),
        });
        Ok(link)
    }

    /// Accepts a pending request and executes it against the current trees.
    pub async fn accept(
        &self,
        id: TreeLinkRequestId,
        actor: &Actor,
    ) -> Result<TreeLinkRequest, ServiceError> {
        let _guard = self.state.lock(AggregateKey::Link(id)).await;
        let mut link = self.load(id).await?;
        ensure_status(&link, LinkStatus::Pending, "accept")?;
        require_receiver_admin(actor, &link)?;

        link.status = LinkStatus::Accepted;
        let link = self.update(link).await?;
        tracing::info!("link {} accepted by {}", id, actor.user_id);
        self.execute(link).await
    }

    pub async fn reject(
        &self,
        id: TreeLinkRequestId,
        actor: &Actor,
    ) -> Result<TreeLinkRequest, ServiceError> {
        let _guard = self.state.lock(AggregateKey::Link(id)).await;
        let mut link = self.load(id).await?;
        ensure_status(&link, LinkStatus::Pending, "reject")?;
        require_receiver_admin(actor, &link)?;

        link.status = LinkStatus::Rejected;
        let link = self.update(link).await?;
        self.state.notifier.notify(ParticipantEvent::LinkRejected {
            link: id,
            sender_family: link.sender.family_code.clone(),
        });
        Ok(link)
    }

    /// Re-runs execution of an accepted request whose last attempt failed.
    pub async fn retry_execution(
        &self,
        id: TreeLinkRequestId,
        actor: &Actor,
    ) -> Result<TreeLinkRequest, ServiceError> {
        let _guard = self.state.lock(AggregateKey::Link(id)).await;
        let link = self.load(id).await?;
        ensure_status(&link, LinkStatus::Accepted, "retry execution")?;
        require_receiver_admin(actor, &link)?;
        self.execute(link).await
    }

    pub async fn get(&self, id: TreeLinkRequestId) -> Result<TreeLinkRequest, ServiceError> {
        self.load(id).await
    }

    /// Executed cross-tree edges with either end in `family`, oldest first.
    pub async fn links_for_family(&self, family: &FamilyCode) -> Result<Vec<CrossLink>, ServiceError> {
        let family = family.clone();
        let links = self
            .state
            .with_store(move |store| store.list_executed_links(&family))
            .await?;
        Ok(links
            .into_iter()
            .filter_map(|l| l.executed.map(|plan| plan.link))
            .collect())
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    /// Plans `link` against fresh trees. Rule violations are recorded on the
    /// request; store failures propagate and leave it untouched.
    async fn execute(&self, mut link: TreeLinkRequest) -> Result<TreeLinkRequest, ServiceError> {
        // Two links that are each acyclic alone can close a cycle together.
        let _graph_guard = self.state.lock(AggregateKey::LinkGraph).await;
        let planned = self
            .plan(
                &link.sender,
                &link.receiver,
                link.relationship,
                link.parent_role,
                link.confirm_override,
            )
            .await;

        match planned {
            Ok(plan) => {
                link.status = LinkStatus::Executed;
                link.execution_error = None;
                link.executed = Some(plan);
                let link = self.update(link).await?;
                tracing::info!("link {} executed", link.id);
                self.state.notifier.notify(ParticipantEvent::LinkExecuted {
                    link: link.id,
                    sender_family: link.sender.family_code.clone(),
                    receiver_family: link.receiver.family_code.clone(),
                });
                Ok(link)
            }
            Err(e) if e.category() == ErrorCategory::Transport => Err(e),
            Err(e) => {
                tracing::warn!("link {} execution failed: {}", link.id, e);
                link.execution_error = Some(e.to_string());
                let link = self.update(link).await?;
                self.state.notifier.notify(ParticipantEvent::LinkExecutionFailed {
                    link: link.id,
                    error: e.to_string(),
                });
                Ok(link)
            }
        }
    }

    async fn plan(
        &self,
        sender: &NodeRef,
        receiver: &NodeRef,
        relationship: RelationshipType,
        parent_role: Option<ParentRole>,
        confirm_override: bool,
    ) -> Result<LinkPlan, ServiceError> {
        let linked = self.linked_families(sender, receiver).await?;
        let tree_of = |node: &NodeRef| {
            linked.tree(&node.family_code).ok_or_else(|| {
                ServiceError::NotFound(format!("family {} not found", node.family_code))
            })
        };
        let plan = plan_link(&LinkContext {
            sender_tree: tree_of(sender)?,
            sender,
            receiver_tree: tree_of(receiver)?,
            receiver,
            relationship,
            parent_role,
            confirm_override,
            linked: &linked,
        })?;
        Ok(plan)
    }

    /// Loads the trees of both ends and of every family connected to them
    /// through executed links, together with those links.
    async fn linked_families(
        &self,
        sender: &NodeRef,
        receiver: &NodeRef,
    ) -> Result<LinkedFamilies, ServiceError> {
        let mut queue = vec![sender.family_code.clone(), receiver.family_code.clone()];
        let (trees, links) = self
            .state
            .with_store(move |store| {
                let mut seen = BTreeSet::new();
                let mut links = BTreeMap::new();
                while let Some(family) = queue.pop() {
                    if !seen.insert(family.clone()) {
                        continue;
                    }
                    for request in store.list_executed_links(&family)? {
                        let Some(plan) = request.executed else {
                            continue;
                        };
                        for end in [&plan.link.from, &plan.link.to] {
                            if !seen.contains(&end.family_code) {
                                queue.push(end.family_code.clone());
                            }
                        }
                        links.insert(request.id, plan.link);
                    }
                }
                let mut trees = Vec::with_capacity(seen.len());
                for family in seen {
                    let tree = store.load_tree(&family)?;
                    trees.push((family, tree));
                }
                Ok((trees, links))
            })
            .await?;

        let mut linked = LinkedFamilies::new();
        for (family, tree) in trees {
            linked.add_tree(family, to_graph(tree)?);
        }
        for link in links.into_values() {
            linked.add_link(link);
        }
        Ok(linked)
    }

    async fn load(&self, id: TreeLinkRequestId) -> Result<TreeLinkRequest, ServiceError> {
        self.state.with_store(move |store| store.load_link(id)).await
    }

    /// Bumps the version and writes `link` over the stored request.
    async fn update(&self, mut link: TreeLinkRequest) -> Result<TreeLinkRequest, ServiceError> {
        let expected = link.version;
        link.version += 1;
        link.updated_at = Utc::now();
        let stored = link.clone();
        self.state
            .with_store(move |store| store.update_link(&stored, expected))
            .await?;
        Ok(link)
    }
}

fn ensure_status(
    link: &TreeLinkRequest,
    required: LinkStatus,
    action: &str,
) -> Result<(), ServiceError> {
    if link.status != required {
        return Err(ServiceError::transition(link.status.as_str(), action));
    }
    Ok(())
}

fn require_receiver_admin(actor: &Actor, link: &TreeLinkRequest) -> Result<(), ServiceError> {
    if !actor.is_admin_of(&link.receiver.family_code) {
        return Err(ServiceError::Forbidden(format!(
            "{} is not an admin of family {}",
            actor.user_id, link.receiver.family_code
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kinmerge_core::{CoreError, EdgeRecord, Gender, Person, PersonId, SourceTree, TreeSnapshot};
    use kinmerge_storage::InMemoryStore;

    fn node(family: &str, id: u32) -> NodeRef {
        NodeRef::new(FamilyCode::new(family), PersonId(id))
    }

    async fn service() -> TreeLinkService<InMemoryStore> {
        let state = AppState::in_memory();
        let a = TreeSnapshot {
            people: vec![
                Person::new(PersonId(1), "Kiran", 1, SourceTree::Primary).with_gender(Gender::Male),
                Person::new(PersonId(2), "Lata", 0, SourceTree::Primary).with_gender(Gender::Female),
                Person::new(PersonId(3), "Ravi", 1, SourceTree::Primary).with_gender(Gender::Male),
            ],
            edges: vec![EdgeRecord::parent(PersonId(2), PersonId(1), Some(ParentRole::Mother))],
        };
        let b = TreeSnapshot {
            people: vec![
                Person::new(PersonId(5), "Suresh", 0, SourceTree::Primary).with_gender(Gender::Male),
                Person::new(PersonId(6), "Mohan", 0, SourceTree::Primary).with_gender(Gender::Male),
            ],
            edges: vec![],
        };
        state
            .with_store(|store| {
                store.save_tree(&FamilyCode::new("A"), &a)?;
                store.save_tree(&FamilyCode::new("B"), &b)
            })
            .await
            .unwrap();
        TreeLinkService::new(state)
    }

    fn father_request(receiver: u32) -> CreateLink {
        CreateLink {
            sender: node("A", 1),
            receiver: node("B", receiver),
            relationship: RelationshipType::Parent,
            parent_role: None,
            confirm_override: false,
        }
    }

    fn request(
        sender: NodeRef,
        receiver: NodeRef,
        relationship: RelationshipType,
    ) -> CreateLink {
        CreateLink {
            sender,
            receiver,
            relationship,
            parent_role: None,
            confirm_override: false,
        }
    }

    fn b_member() -> Actor {
        Actor::member("suresh", FamilyCode::new("B"))
    }

    /// Creates and accepts a link, asserting it executed.
    async fn executed(svc: &TreeLinkService<InMemoryStore>, actor: &Actor, link: CreateLink) {
        let created = svc.create(actor, link).await.unwrap();
        let done = svc.accept(created.id, &receiver_admin()).await.unwrap();
        assert_eq!(done.status, LinkStatus::Executed, "{:?}", done.execution_error);
    }

    fn sender() -> Actor {
        Actor::member("kiran", FamilyCode::new("A"))
    }

    fn receiver_admin() -> Actor {
        Actor::admin("suresh", FamilyCode::new("B"))
    }

    #[tokio::test]
    async fn create_derives_the_parent_role() {
        let svc = service().await;
        let link = svc.create(&sender(), father_request(5)).await.unwrap();
        assert_eq!(link.status, LinkStatus::Pending);
        assert_eq!(link.parent_role, Some(ParentRole::Father));
        assert_eq!(link.version, 1);
    }

    #[tokio::test]
    async fn duplicate_pending_request_carries_the_existing_id() {
        let svc = service().await;
        let first = svc.create(&sender(), father_request(5)).await.unwrap();

        let reverse = CreateLink {
            sender: node("B", 5),
            receiver: node("A", 1),
            relationship: RelationshipType::Child,
            parent_role: None,
            confirm_override: false,
        };
        let err = svc
            .create(&Actor::member("suresh", FamilyCode::new("B")), reverse)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::DuplicateLinkRequest { existing } if existing == first.id));
    }

    #[tokio::test]
    async fn only_the_sender_may_revoke() {
        let svc = service().await;
        let link = svc.create(&sender(), father_request(5)).await.unwrap();

        let err = svc.revoke(link.id, &receiver_admin()).await.unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));

        let revoked = svc.revoke(link.id, &sender()).await.unwrap();
        assert_eq!(revoked.status, LinkStatus::Revoked);
        assert_eq!(revoked.version, 2);

        let err = svc.accept(link.id, &receiver_admin()).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn accept_executes_and_lists_the_link() {
        let svc = service().await;
        let link = svc.create(&sender(), father_request(5)).await.unwrap();

        let err = svc
            .accept(link.id, &Actor::member("mohan", FamilyCode::new("B")))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));

        let executed = svc.accept(link.id, &receiver_admin()).await.unwrap();
        assert_eq!(executed.status, LinkStatus::Executed);
        assert_eq!(executed.version, 3);
        let plan = executed.executed.unwrap();
        assert_eq!(plan.link.from, node("B", 5));
        assert_eq!(plan.link.to, node("A", 1));

        assert_eq!(svc.links_for_family(&FamilyCode::new("A")).await.unwrap().len(), 1);
        assert_eq!(svc.links_for_family(&FamilyCode::new("B")).await.unwrap().len(), 1);
        assert!(svc.links_for_family(&FamilyCode::new("C")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn linked_father_fills_the_second_parent_slot() {
        let svc = service().await;
        let first = svc.create(&sender(), father_request(5)).await.unwrap();
        svc.accept(first.id, &receiver_admin()).await.unwrap();

        // Kiran already has Lata in the tree and Suresh through the link.
        let err = svc.create(&sender(), father_request(6)).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::DomainRule(CoreError::ParentAlreadyExists { child: PersonId(1) })
        ));
    }

    #[tokio::test]
    async fn second_father_through_links_is_refused() {
        let svc = service().await;
        let ravi = node("A", 3);
        executed(&svc, &sender(), request(ravi.clone(), node("B", 5), RelationshipType::Parent))
            .await;

        let err = svc
            .create(&sender(), request(ravi, node("B", 6), RelationshipType::Parent))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::DomainRule(CoreError::DuplicateParentRole {
                role: ParentRole::Father,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn descendant_cannot_become_a_parent() {
        let svc = service().await;
        // Lata is Kiran's mother; making Kiran her father closes a cycle.
        let err = svc
            .create(&sender(), request(node("A", 2), node("A", 1), RelationshipType::Parent))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(ref m) if m.contains("cycle")));
        assert_eq!(err.category(), ErrorCategory::Validation);
    }

    #[tokio::test]
    async fn parent_cycle_across_two_families_is_refused() {
        let svc = service().await;
        // Suresh becomes Lata's father, so Kiran descends from Suresh.
        executed(&svc, &sender(), request(node("A", 2), node("B", 5), RelationshipType::Parent))
            .await;

        let err = svc
            .create(&b_member(), request(node("B", 5), node("A", 1), RelationshipType::Parent))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(ref m) if m.contains("cycle")));

        // Mohan has no such ancestry.
        let link = svc
            .create(&sender(), request(node("A", 1), node("B", 6), RelationshipType::Parent))
            .await
            .unwrap();
        assert_eq!(link.status, LinkStatus::Pending);
    }

    #[tokio::test]
    async fn executed_pair_cannot_be_linked_again() {
        let svc = service().await;
        executed(&svc, &sender(), father_request(5)).await;

        let err = svc.create(&sender(), father_request(5)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(ref m) if m.contains("already linked")));

        // Reversing the direction does not get around it.
        let err = svc
            .create(&b_member(), request(node("B", 5), node("A", 1), RelationshipType::Parent))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(ref m) if m.contains("already linked")));
        assert_eq!(svc.links_for_family(&FamilyCode::new("A")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn linked_parent_counts_for_sibling_eligibility() {
        let svc = service().await;
        let ravi = node("A", 3);
        let sibling = request(ravi.clone(), node("A", 1), RelationshipType::Sibling);

        let err = svc.create(&sender(), sibling.clone()).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(ref m) if m.contains("no recorded parent")));

        executed(&svc, &sender(), request(ravi, node("B", 5), RelationshipType::Parent)).await;
        let link = svc.create(&sender(), sibling).await.unwrap();
        assert_eq!(link.status, LinkStatus::Pending);
    }

    #[tokio::test]
    async fn failed_execution_stays_accepted_and_can_be_retried() {
        let svc = service().await;
        let to_suresh = svc.create(&sender(), father_request(5)).await.unwrap();
        let to_mohan = svc.create(&sender(), father_request(6)).await.unwrap();

        svc.accept(to_suresh.id, &receiver_admin()).await.unwrap();
        let accepted = svc.accept(to_mohan.id, &receiver_admin()).await.unwrap();
        assert_eq!(accepted.status, LinkStatus::Accepted);
        assert!(accepted.execution_error.is_some());

        let retried = svc.retry_execution(to_mohan.id, &receiver_admin()).await.unwrap();
        assert_eq!(retried.status, LinkStatus::Accepted);
        assert_eq!(retried.version, accepted.version + 1);
    }

    #[tokio::test]
    async fn reject_notifies_and_ends_the_request() {
        let svc = service().await;
        let link = svc.create(&sender(), father_request(5)).await.unwrap();
        let rejected = svc.reject(link.id, &receiver_admin()).await.unwrap();
        assert_eq!(rejected.status, LinkStatus::Rejected);

        let err = svc.retry_execution(link.id, &receiver_admin()).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn sibling_link_needs_parents_on_both_sides() {
        let svc = service().await;
        let err = svc
            .create(
                &sender(),
                CreateLink {
                    sender: node("A", 1),
                    receiver: node("B", 5),
                    relationship: RelationshipType::Sibling,
                    parent_role: None,
                    confirm_override: false,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn outsiders_cannot_create_links() {
        let svc = service().await;
        let err = svc
            .create(&Actor::member("x", FamilyCode::new("B")), father_request(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
    }
}
