//! Single-edge link planning between two independently owned trees.
//!
//! A link request names a sender node, a receiver node in another (or the
//! same) family, and the relationship read from the sender's side. Planning
//! checks the relationship rules against the current trees and produces the
//! one cross-tree edge to record, plus any receiver parents it supersedes.
//!
//! Executed links are never written into the trees, so planning also
//! consults [`LinkedFamilies`]: a parent granted by a link counts like a
//! recorded one, and a new parent edge must not close a cycle through any
//! mix of tree edges and links.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use kinmerge_core::{
    derive_parent_role, CoreError, FamilyCode, FamilyGraph, NodeRef, ParentRole, Person,
    Relation, RelationshipType,
};

use crate::error::EngineError;

pub struct LinkContext<'a> {
    pub sender_tree: &'a FamilyGraph,
    pub sender: &'a NodeRef,
    pub receiver_tree: &'a FamilyGraph,
    pub receiver: &'a NodeRef,
    pub relationship: RelationshipType,
    /// Role supplied by the caller. Only checked, never trusted.
    pub parent_role: Option<ParentRole>,
    /// Caller confirmed that a child link may supersede existing parents.
    pub confirm_override: bool,
    pub linked: &'a LinkedFamilies,
}

impl LinkContext<'_> {
    fn tree(&self, family: &FamilyCode) -> Option<&FamilyGraph> {
        if *family == self.sender.family_code {
            Some(self.sender_tree)
        } else if *family == self.receiver.family_code {
            Some(self.receiver_tree)
        } else {
            self.linked.tree(family)
        }
    }

    /// Whether `target` is `start` or one of its descendants, following
    /// tree parent edges and executed parent links.
    fn reaches_down(&self, start: &NodeRef, target: &NodeRef) -> bool {
        let mut seen = BTreeSet::new();
        let mut stack = vec![start.clone()];
        while let Some(node) = stack.pop() {
            if node == *target {
                return true;
            }
            if !seen.insert(node.clone()) {
                continue;
            }
            if let Some(tree) = self.tree(&node.family_code) {
                stack.extend(
                    tree.children_of(node.person)
                        .into_iter()
                        .map(|child| NodeRef::new(node.family_code.clone(), child.id)),
                );
            }
            stack.extend(
                self.linked
                    .links()
                    .iter()
                    .filter(|l| l.from == node && l.relation.is_parent())
                    .map(|l| l.to.clone()),
            );
        }
        false
    }

    /// Refuses a parent edge `parent -> child` that would make `parent`
    /// its own ancestor.
    fn check_acyclic(&self, parent: &NodeRef, child: &NodeRef) -> Result<(), EngineError> {
        if self.reaches_down(child, parent) {
            return Err(EngineError::Validation(format!(
                "{} descends from {}; linking them as parent and child would form a cycle",
                parent, child
            )));
        }
        Ok(())
    }
}

/// Executed cross-tree links and the trees of the families they reach.
#[derive(Debug, Clone, Default)]
pub struct LinkedFamilies {
    links: Vec<CrossLink>,
    trees: BTreeMap<FamilyCode, FamilyGraph>,
}

impl LinkedFamilies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_link(&mut self, link: CrossLink) {
        self.links.push(link);
    }

    pub fn add_tree(&mut self, family: FamilyCode, tree: FamilyGraph) {
        self.trees.insert(family, tree);
    }

    pub fn links(&self) -> &[CrossLink] {
        &self.links
    }

    pub fn tree(&self, family: &FamilyCode) -> Option<&FamilyGraph> {
        self.trees.get(family)
    }

    /// Parents granted to `child` by links, with their roles.
    pub fn parents_of(&self, child: &NodeRef) -> Vec<(&NodeRef, Option<ParentRole>)> {
        self.links
            .iter()
            .filter(|l| l.to == *child && l.relation.is_parent())
            .map(|l| (&l.from, l.relation.parent_role()))
            .collect()
    }

    /// The link already joining `a` and `b`, in either direction.
    pub fn between(&self, a: &NodeRef, b: &NodeRef) -> Option<&CrossLink> {
        self.links
            .iter()
            .find(|l| (l.from == *a && l.to == *b) || (l.from == *b && l.to == *a))
    }
}

/// An edge between nodes of two trees. For parent relations `from` is the
/// parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossLink {
    pub from: NodeRef,
    pub to: NodeRef,
    pub relation: Relation,
}

impl CrossLink {
    pub fn touches(&self, family_code: &str) -> bool {
        self.from.family_code.as_str() == family_code || self.to.family_code.as_str() == family_code
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkPlan {
    pub link: CrossLink,
    /// Receiver parents replaced by a confirmed child link.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub superseded: Vec<NodeRef>,
}

impl LinkPlan {
    pub fn parent_role(&self) -> Option<ParentRole> {
        self.link.relation.parent_role()
    }
}

pub fn plan_link(ctx: &LinkContext<'_>) -> Result<LinkPlan, EngineError> {
    if ctx.sender == ctx.receiver {
        return Err(EngineError::Validation(format!(
            "cannot link {} to itself",
            ctx.sender
        )));
    }
    let sender = lookup(ctx.sender_tree, ctx.sender)?;
    let receiver = lookup(ctx.receiver_tree, ctx.receiver)?;
    if let Some(existing) = ctx.linked.between(ctx.sender, ctx.receiver) {
        return Err(EngineError::Validation(format!(
            "{} and {} are already linked ({} -> {})",
            ctx.sender, ctx.receiver, existing.from, existing.to
        )));
    }

    match ctx.relationship {
        RelationshipType::Parent => plan_parent(ctx, sender, receiver),
        RelationshipType::Child => plan_child(ctx, sender, receiver),
        RelationshipType::Sibling => plan_sibling(ctx),
    }
}

fn lookup<'g>(tree: &'g FamilyGraph, node: &NodeRef) -> Result<&'g Person, EngineError> {
    tree.person(node.person)
        .ok_or_else(|| CoreError::PersonNotFound { id: node.person }.into())
}

fn checked_role(parent: &Person, supplied: Option<ParentRole>) -> Result<ParentRole, EngineError> {
    let role = derive_parent_role(parent)?;
    match supplied {
        Some(supplied) if supplied != role => Err(EngineError::Validation(format!(
            "parent role {} does not match the recorded gender of person {} ({})",
            supplied, parent.id, role
        ))),
        _ => Ok(role),
    }
}

/// Receiver becomes the sender's parent.
fn plan_parent(
    ctx: &LinkContext<'_>,
    sender: &Person,
    receiver: &Person,
) -> Result<LinkPlan, EngineError> {
    let role = checked_role(receiver, ctx.parent_role)?;
    let existing = ctx.sender_tree.parent_links(sender.id);
    let linked = ctx.linked.parents_of(ctx.sender);
    if existing.len() + linked.len() >= 2 {
        return Err(CoreError::ParentAlreadyExists { child: sender.id }.into());
    }
    let mut roles = existing.iter().map(|(_, r)| *r).chain(linked.iter().map(|(_, r)| *r));
    if roles.any(|r| r == Some(role)) {
        return Err(CoreError::DuplicateParentRole {
            child: sender.id,
            role,
        }
        .into());
    }
    ctx.check_acyclic(ctx.receiver, ctx.sender)?;
    Ok(LinkPlan {
        link: CrossLink {
            from: ctx.receiver.clone(),
            to: ctx.sender.clone(),
            relation: Relation::Parent { role: Some(role) },
        },
        superseded: Vec::new(),
    })
}

/// Receiver becomes the sender's child.
fn plan_child(
    ctx: &LinkContext<'_>,
    sender: &Person,
    receiver: &Person,
) -> Result<LinkPlan, EngineError> {
    let role = checked_role(sender, ctx.parent_role)?;
    let existing = ctx.receiver_tree.parent_links(receiver.id);
    // Linked parents live outside the receiver's tree and are never
    // superseded.
    let linked = ctx.linked.parents_of(ctx.receiver);
    if linked.iter().any(|(_, r)| *r == Some(role)) {
        return Err(CoreError::DuplicateParentRole {
            child: receiver.id,
            role,
        }
        .into());
    }
    if linked.len() >= 2 {
        return Err(CoreError::ParentAlreadyExists { child: receiver.id }.into());
    }
    ctx.check_acyclic(ctx.sender, ctx.receiver)?;

    let mut superseded = Vec::new();
    if !existing.is_empty() {
        let ids: Vec<String> = existing.iter().map(|(id, _)| id.to_string()).collect();
        if !ctx.confirm_override {
            return Err(EngineError::Validation(format!(
                "person {} already has parent(s) {}; confirm the override to replace them",
                receiver.id,
                ids.join(", ")
            )));
        }
        let mut remaining: Vec<_> = existing.to_vec();
        remaining.retain(|(id, r)| {
            if *r == Some(role) {
                superseded.push(*id);
                false
            } else {
                true
            }
        });
        // Make room for the new parent; unknown roles go first.
        while remaining.len() + linked.len() >= 2 {
            let pos = remaining
                .iter()
                .position(|(_, r)| r.is_none())
                .unwrap_or(0);
            superseded.push(remaining.remove(pos).0);
        }
    }
    superseded.sort();

    Ok(LinkPlan {
        link: CrossLink {
            from: ctx.sender.clone(),
            to: ctx.receiver.clone(),
            relation: Relation::Parent { role: Some(role) },
        },
        superseded: superseded
            .into_iter()
            .map(|id| NodeRef::new(ctx.receiver.family_code.clone(), id))
            .collect(),
    })
}

/// Siblinghood follows shared parentage, so both ends need a parent, either
/// recorded or linked.
fn plan_sibling(ctx: &LinkContext<'_>) -> Result<LinkPlan, EngineError> {
    for (tree, node) in [(ctx.sender_tree, ctx.sender), (ctx.receiver_tree, ctx.receiver)] {
        if tree.parent_links(node.person).is_empty() && ctx.linked.parents_of(node).is_empty() {
            return Err(EngineError::Validation(format!(
                "{} has no recorded parent; sibling links need a parent on both sides",
                node
            )));
        }
    }
    Ok(LinkPlan {
        link: CrossLink {
            from: ctx.sender.clone(),
            to: ctx.receiver.clone(),
            relation: Relation::Sibling,
        },
        superseded: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kinmerge_core::{EdgeRecord, FamilyCode, Gender, PersonId, SourceTree};

    fn person(id: u32, gender: Option<Gender>) -> Person {
        let p = Person::new(PersonId(id), format!("M{}", id), 1, SourceTree::Primary);
        match gender {
            Some(g) => p.with_gender(g),
            None => p,
        }
    }

    /// 1 (male) and 2 (female) are parents of 3; 4 has no parents.
    fn tree() -> FamilyGraph {
        FamilyGraph::load_tree(
            vec![
                person(1, Some(Gender::Male)),
                person(2, Some(Gender::Female)),
                person(3, Some(Gender::Male)),
                person(4, None),
            ],
            vec![
                EdgeRecord::parent(PersonId(1), PersonId(3), Some(ParentRole::Father)),
                EdgeRecord::parent(PersonId(2), PersonId(3), Some(ParentRole::Mother)),
            ],
        )
        .unwrap()
    }

    /// 10 (male, no parents), 11 (female, no parents), 12 (female) child of 13.
    fn other_tree() -> FamilyGraph {
        FamilyGraph::load_tree(
            vec![
                person(10, Some(Gender::Male)),
                person(11, Some(Gender::Female)),
                person(12, Some(Gender::Female)),
                person(13, Some(Gender::Male)),
            ],
            vec![EdgeRecord::parent(PersonId(13), PersonId(12), Some(ParentRole::Father))],
        )
        .unwrap()
    }

    fn node(code: &str, id: u32) -> NodeRef {
        NodeRef::new(FamilyCode::new(code), PersonId(id))
    }

    fn plan(
        sender: (&FamilyGraph, NodeRef),
        receiver: (&FamilyGraph, NodeRef),
        relationship: RelationshipType,
        confirm_override: bool,
    ) -> Result<LinkPlan, EngineError> {
        plan_with(&LinkedFamilies::new(), sender, receiver, relationship, confirm_override)
    }

    fn plan_with(
        linked: &LinkedFamilies,
        sender: (&FamilyGraph, NodeRef),
        receiver: (&FamilyGraph, NodeRef),
        relationship: RelationshipType,
        confirm_override: bool,
    ) -> Result<LinkPlan, EngineError> {
        plan_link(&LinkContext {
            sender_tree: sender.0,
            sender: &sender.1,
            receiver_tree: receiver.0,
            receiver: &receiver.1,
            relationship,
            parent_role: None,
            confirm_override,
            linked,
        })
    }

    fn linked(links: &[(NodeRef, NodeRef, Relation)]) -> LinkedFamilies {
        let mut linked = LinkedFamilies::new();
        for (from, to, relation) in links {
            linked.add_link(CrossLink {
                from: from.clone(),
                to: to.clone(),
                relation: *relation,
            });
        }
        linked
    }

    fn father() -> Relation {
        Relation::Parent {
            role: Some(ParentRole::Father),
        }
    }

    #[test]
    fn male_receiver_becomes_father() {
        let (a, b) = (tree(), other_tree());
        let plan = plan(
            (&a, node("A", 4)),
            (&b, node("B", 10)),
            RelationshipType::Parent,
            false,
        )
        .unwrap();
        assert_eq!(plan.parent_role(), Some(ParentRole::Father));
        assert_eq!(plan.link.from, node("B", 10));
        assert_eq!(plan.link.to, node("A", 4));
    }

    #[test]
    fn female_receiver_becomes_mother() {
        let (a, b) = (tree(), other_tree());
        let plan = plan(
            (&a, node("A", 4)),
            (&b, node("B", 11)),
            RelationshipType::Parent,
            false,
        )
        .unwrap();
        assert_eq!(plan.parent_role(), Some(ParentRole::Mother));
    }

    #[test]
    fn receiver_without_gender_cannot_be_parent() {
        let (a, b) = (tree(), other_tree());
        let err = plan(
            (&b, node("B", 10)),
            (&a, node("A", 4)),
            RelationshipType::Parent,
            false,
        )
        .unwrap_err();
        assert_eq!(
            err,
            EngineError::Core(CoreError::UnresolvedParentRole { person: PersonId(4) })
        );
    }

    #[test]
    fn supplied_role_must_agree_with_gender() {
        let (a, b) = (tree(), other_tree());
        let err = plan_link(&LinkContext {
            sender_tree: &a,
            sender: &node("A", 4),
            receiver_tree: &b,
            receiver: &node("B", 11),
            relationship: RelationshipType::Parent,
            parent_role: Some(ParentRole::Father),
            confirm_override: false,
            linked: &LinkedFamilies::new(),
        })
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn third_parent_is_refused() {
        let (a, b) = (tree(), other_tree());
        let err = plan(
            (&a, node("A", 3)),
            (&b, node("B", 10)),
            RelationshipType::Parent,
            false,
        )
        .unwrap_err();
        assert_eq!(
            err,
            EngineError::Core(CoreError::ParentAlreadyExists { child: PersonId(3) })
        );
    }

    #[test]
    fn occupied_role_is_refused() {
        let b = other_tree();
        let err = plan(
            (&b, node("B", 12)),
            (&b, node("B", 10)),
            RelationshipType::Parent,
            false,
        )
        .unwrap_err();
        assert_eq!(
            err,
            EngineError::Core(CoreError::DuplicateParentRole {
                child: PersonId(12),
                role: ParentRole::Father
            })
        );
    }

    #[test]
    fn child_link_over_existing_parents_needs_confirmation() {
        let (a, b) = (tree(), other_tree());
        let err = plan(
            (&b, node("B", 10)),
            (&a, node("A", 3)),
            RelationshipType::Child,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let confirmed = plan(
            (&b, node("B", 10)),
            (&a, node("A", 3)),
            RelationshipType::Child,
            true,
        )
        .unwrap();
        assert_eq!(confirmed.superseded, vec![node("A", 1)]);
        assert_eq!(confirmed.link.from, node("B", 10));
        assert_eq!(confirmed.parent_role(), Some(ParentRole::Father));
    }

    #[test]
    fn child_link_to_parentless_receiver_needs_no_confirmation() {
        let (a, b) = (tree(), other_tree());
        let plan = plan(
            (&b, node("B", 11)),
            (&a, node("A", 4)),
            RelationshipType::Child,
            false,
        )
        .unwrap();
        assert!(plan.superseded.is_empty());
        assert_eq!(plan.parent_role(), Some(ParentRole::Mother));
    }

    #[test]
    fn sibling_sender_without_parents_is_refused() {
        let (a, b) = (tree(), other_tree());
        // Receiver 3 has both parents; the sender has none.
        let err = plan(
            (&b, node("B", 10)),
            (&a, node("A", 3)),
            RelationshipType::Sibling,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        // Neither side has parents.
        let err = plan(
            (&b, node("B", 10)),
            (&a, node("A", 4)),
            RelationshipType::Sibling,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn sibling_link_between_parented_nodes() {
        let (a, b) = (tree(), other_tree());
        let plan = plan(
            (&b, node("B", 12)),
            (&a, node("A", 3)),
            RelationshipType::Sibling,
            false,
        )
        .unwrap();
        assert_eq!(plan.link.relation, Relation::Sibling);
    }

    #[test]
    fn descendant_cannot_become_parent_in_the_same_tree() {
        let a = tree();
        // 3 is the child of 1.
        let err = plan(
            (&a, node("A", 1)),
            (&a, node("A", 3)),
            RelationshipType::Parent,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation(ref m) if m.contains("cycle")));

        let err = plan(
            (&a, node("A", 3)),
            (&a, node("A", 1)),
            RelationshipType::Child,
            true,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation(ref m) if m.contains("cycle")));
    }

    #[test]
    fn cycle_through_an_executed_link_is_refused() {
        let (a, b) = (tree(), other_tree());
        // B10 is already the father of A1, who is the father of A3.
        let links = linked(&[(node("B", 10), node("A", 1), father())]);
        let err = plan_with(
            &links,
            (&b, node("B", 10)),
            (&a, node("A", 3)),
            RelationshipType::Parent,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation(ref m) if m.contains("cycle")));

        // An unrelated parent for B10 is still fine.
        let ok = plan_with(
            &links,
            (&b, node("B", 10)),
            (&b, node("B", 13)),
            RelationshipType::Parent,
            false,
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn linked_parents_count_toward_the_limit_and_roles() {
        let (a, b) = (tree(), other_tree());
        let links = linked(&[(node("B", 13), node("A", 4), father())]);

        let err = plan_with(
            &links,
            (&a, node("A", 4)),
            (&b, node("B", 10)),
            RelationshipType::Parent,
            false,
        )
        .unwrap_err();
        assert_eq!(
            err,
            EngineError::Core(CoreError::DuplicateParentRole {
                child: PersonId(4),
                role: ParentRole::Father
            })
        );

        let err = plan_with(
            &links,
            (&b, node("B", 10)),
            (&a, node("A", 4)),
            RelationshipType::Child,
            true,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Core(CoreError::DuplicateParentRole { .. })
        ));

        let mut both = links.clone();
        both.add_link(CrossLink {
            from: node("B", 11),
            to: node("A", 4),
            relation: Relation::Parent {
                role: Some(ParentRole::Mother),
            },
        });
        let err = plan_with(
            &both,
            (&a, node("A", 4)),
            (&b, node("B", 12)),
            RelationshipType::Parent,
            false,
        )
        .unwrap_err();
        assert_eq!(
            err,
            EngineError::Core(CoreError::ParentAlreadyExists { child: PersonId(4) })
        );
    }

    #[test]
    fn linked_parent_makes_a_sibling_link_possible() {
        let (a, b) = (tree(), other_tree());
        let links = linked(&[(node("B", 13), node("A", 4), father())]);
        let plan = plan_with(
            &links,
            (&a, node("A", 4)),
            (&b, node("B", 12)),
            RelationshipType::Sibling,
            false,
        )
        .unwrap();
        assert_eq!(plan.link.relation, Relation::Sibling);
    }

    #[test]
    fn already_linked_pair_is_refused_in_either_direction() {
        let (a, b) = (tree(), other_tree());
        let links = linked(&[(node("B", 10), node("A", 4), father())]);
        for (sender, receiver, relationship) in [
            ((&a, node("A", 4)), (&b, node("B", 10)), RelationshipType::Parent),
            ((&b, node("B", 10)), (&a, node("A", 4)), RelationshipType::Child),
            ((&a, node("A", 4)), (&b, node("B", 10)), RelationshipType::Sibling),
        ] {
            let err = plan_with(&links, sender, receiver, relationship, false).unwrap_err();
            assert!(matches!(err, EngineError::Validation(ref m) if m.contains("already linked")));
        }
    }

    #[test]
    fn unknown_node_is_reported() {
        let (a, b) = (tree(), other_tree());
        let err = plan(
            (&a, node("A", 99)),
            (&b, node("B", 10)),
            RelationshipType::Sibling,
            false,
        )
        .unwrap_err();
        assert_eq!(
            err,
            EngineError::Core(CoreError::PersonNotFound { id: PersonId(99) })
        );
    }
}
