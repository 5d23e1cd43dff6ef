//! FamilyGraph: the in-memory representation of one family tree.
//!
//! [`FamilyGraph`] wraps a petgraph `StableGraph` whose nodes are
//! [`Person`]s and whose edges are [`Relation`]s. Person ids from the source
//! tree are mapped to node indices through an `IndexMap`, which also fixes
//! iteration order to insertion order so every query is deterministic.
//!
//! # Invariants
//!
//! - Every edge endpoint is a known person; no self edges.
//! - A person has at most two parents, and at most one per known role.
//! - Graphs produced by [`FamilyGraph::load_tree`] have an acyclic parent
//!   sub-graph. The builder methods do not check acyclicity so callers can
//!   load raw data and report cycles through [`FamilyGraph::detect_cycles`].
//!
//! All mutations go through `FamilyGraph` methods; both inner structures are
//! private.

use std::collections::HashSet;

use indexmap::IndexMap;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::stable_graph::StableGraph;
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use petgraph::{Directed, Direction};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::edge::{EdgeRecord, ParentRole, Relation};
use crate::error::CoreError;
use crate::id::PersonId;
use crate::person::Person;

/// Parent ids of one child with their recorded roles. Never longer than two.
pub type ParentLinks = SmallVec<[(PersonId, Option<ParentRole>); 2]>;

/// Flat, serializable form of a family tree (the `fetchTree` shape).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub people: Vec<Person>,
    #[serde(default)]
    pub edges: Vec<EdgeRecord>,
}

impl TreeSnapshot {
    /// Validates and loads the snapshot. See [`FamilyGraph::load_tree`].
    pub fn into_graph(self) -> Result<FamilyGraph, CoreError> {
        FamilyGraph::load_tree(self.people, self.edges)
    }
}

/// One family tree.
#[derive(Debug, Clone)]
pub struct FamilyGraph {
    graph: StableGraph<Person, Relation, Directed, u32>,
    index: IndexMap<PersonId, NodeIndex<u32>>,
}

impl Default for FamilyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl FamilyGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        FamilyGraph {
            graph: StableGraph::new(),
            index: IndexMap::new(),
        }
    }

    /// Loads a tree from its person and edge lists.
    ///
    /// Fails with [`CoreError::MalformedGraph`] if an edge references an
    /// unknown person or an id repeats, with the parent-invariant errors if
    /// a child is given conflicting parents, and with
    /// [`CoreError::CircularRelationship`] if the parent edges form a cycle.
    pub fn load_tree(people: Vec<Person>, edges: Vec<EdgeRecord>) -> Result<Self, CoreError> {
        let graph = Self::load_tree_allow_cycles(people, edges)?;
        if let Some(path) = graph.detect_cycles().into_iter().next() {
            return Err(CoreError::CircularRelationship { path });
        }
        Ok(graph)
    }

    /// Like [`FamilyGraph::load_tree`] but accepts a cyclic parent
    /// sub-graph. Used when the data must be analyzed rather than trusted.
    pub fn load_tree_allow_cycles(
        people: Vec<Person>,
        edges: Vec<EdgeRecord>,
    ) -> Result<Self, CoreError> {
        let mut graph = FamilyGraph::new();
        for person in people {
            graph.add_person(person)?;
        }
        for edge in &edges {
            graph.add_edge(edge)?;
        }
        Ok(graph)
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Adds a person. Ids must be unique within the graph.
    pub fn add_person(&mut self, person: Person) -> Result<(), CoreError> {
        if self.index.contains_key(&person.id) {
            return Err(CoreError::MalformedGraph {
                reason: format!("duplicate person id {}", person.id),
            });
        }
        let id = person.id;
        let idx = self.graph.add_node(person);
        self.index.insert(id, idx);
        Ok(())
    }

    /// Adds any edge record. Returns `false` if an equivalent edge already
    /// existed and nothing changed.
    pub fn add_edge(&mut self, edge: &EdgeRecord) -> Result<bool, CoreError> {
        match edge.relation {
            Relation::Parent { role } => self.add_parent(edge.from, edge.to, role),
            Relation::Spouse => self.add_spouse(edge.from, edge.to),
            Relation::Sibling => self.add_sibling(edge.from, edge.to),
        }
    }

    /// Records `parent` as a parent of `child`.
    ///
    /// A child that already has two parents rejects a third with
    /// [`CoreError::ParentAlreadyExists`]; a second parent in an already
    /// taken role fails with [`CoreError::DuplicateParentRole`]. On error the
    /// graph is left untouched. Re-adding an existing parent edge is a no-op.
    pub fn add_parent(
        &mut self,
        parent: PersonId,
        child: PersonId,
        role: Option<ParentRole>,
    ) -> Result<bool, CoreError> {
        let (parent_idx, child_idx) = self.endpoints(parent, child)?;

        let existing = self.parent_links(child);
        if existing.iter().any(|(id, _)| *id == parent) {
            return Ok(false);
        }
        if existing.len() >= 2 {
            return Err(CoreError::ParentAlreadyExists { child });
        }
        if let Some(role) = role {
            if existing.iter().any(|(_, r)| *r == Some(role)) {
                return Err(CoreError::DuplicateParentRole { child, role });
            }
        }

        self.graph
            .add_edge(parent_idx, child_idx, Relation::Parent { role });
        Ok(true)
    }

    /// Records a spouse relationship between `a` and `b`.
    pub fn add_spouse(&mut self, a: PersonId, b: PersonId) -> Result<bool, CoreError> {
        self.add_symmetric(a, b, Relation::Spouse)
    }

    /// Records a sibling relationship between `a` and `b`.
    pub fn add_sibling(&mut self, a: PersonId, b: PersonId) -> Result<bool, CoreError> {
        self.add_symmetric(a, b, Relation::Sibling)
    }

    fn add_symmetric(
        &mut self,
        a: PersonId,
        b: PersonId,
        relation: Relation,
    ) -> Result<bool, CoreError> {
        let (a_idx, b_idx) = self.endpoints(a, b)?;
        if self.symmetric_neighbors(a, relation).contains(&b) {
            return Ok(false);
        }
        self.graph.add_edge(a_idx, b_idx, relation);
        Ok(true)
    }

    fn endpoints(
        &self,
        a: PersonId,
        b: PersonId,
    ) -> Result<(NodeIndex<u32>, NodeIndex<u32>), CoreError> {
        if a == b {
            return Err(CoreError::MalformedGraph {
                reason: format!("self relationship on person {}", a),
            });
        }
        let a_idx = self.node_index(a).ok_or_else(|| CoreError::MalformedGraph {
            reason: format!("edge references unknown person {}", a),
        })?;
        let b_idx = self.node_index(b).ok_or_else(|| CoreError::MalformedGraph {
            reason: format!("edge references unknown person {}", b),
        })?;
        Ok((a_idx, b_idx))
    }

    /// Returns a copy of this graph with every generation shifted by
    /// `offset`. The receiver is not modified.
    ///
    /// Fails with [`CoreError::OutOfRange`] if any shifted generation would
    /// overflow.
    pub fn shift_generations(&self, offset: i32) -> Result<FamilyGraph, CoreError> {
        let mut shifted = self.clone();
        for idx in shifted.index.values() {
            if let Some(person) = shifted.graph.node_weight_mut(*idx) {
                person.generation =
                    person
                        .generation
                        .checked_add(offset)
                        .ok_or_else(|| CoreError::OutOfRange {
                            what: format!(
                                "generation {} of person {} shifted by {}",
                                person.generation, person.id, offset
                            ),
                        })?;
            }
        }
        Ok(shifted)
    }

    // -----------------------------------------------------------------------
    // Read-only accessors
    // -----------------------------------------------------------------------

    fn node_index(&self, id: PersonId) -> Option<NodeIndex<u32>> {
        self.index.get(&id).copied()
    }

    pub fn person(&self, id: PersonId) -> Option<&Person> {
        self.node_index(id)
            .and_then(|idx| self.graph.node_weight(idx))
    }

    pub fn contains(&self, id: PersonId) -> bool {
        self.index.contains_key(&id)
    }

    /// All persons in insertion order.
    pub fn people(&self) -> impl Iterator<Item = &Person> + '_ {
        self.index
            .values()
            .filter_map(move |idx| self.graph.node_weight(*idx))
    }

    pub fn person_ids(&self) -> Vec<PersonId> {
        self.index.keys().copied().collect()
    }

    pub fn person_count(&self) -> usize {
        self.index.len()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Largest person id in the graph, if any.
    pub fn max_person_id(&self) -> Option<PersonId> {
        self.index.keys().max().copied()
    }

    /// Minimum generation across all persons.
    pub fn root_generation(&self) -> Option<i32> {
        self.people().map(|p| p.generation).min()
    }

    /// Parent ids of `child` with their recorded roles, ordered by id.
    pub fn parent_links(&self, child: PersonId) -> ParentLinks {
        let mut links: ParentLinks = SmallVec::new();
        if let Some(idx) = self.node_index(child) {
            for edge in self.graph.edges_directed(idx, Direction::Incoming) {
                if let Relation::Parent { role } = edge.weight() {
                    links.push((self.graph[edge.source()].id, *role));
                }
            }
        }
        links.sort_by_key(|(id, _)| *id);
        links
    }

    pub fn parents_of(&self, id: PersonId) -> Vec<&Person> {
        self.parent_links(id)
            .iter()
            .filter_map(|(pid, _)| self.person(*pid))
            .collect()
    }

    pub fn children_of(&self, id: PersonId) -> Vec<&Person> {
        let Some(idx) = self.node_index(id) else {
            return Vec::new();
        };
        let mut children: Vec<&Person> = self
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .filter(|e| e.weight().is_parent())
            .map(|e| &self.graph[e.target()])
            .collect();
        children.sort_by_key(|p| p.id);
        children
    }

    pub fn spouses_of(&self, id: PersonId) -> Vec<&Person> {
        self.symmetric_neighbors(id, Relation::Spouse)
            .into_iter()
            .filter_map(|pid| self.person(pid))
            .collect()
    }

    pub fn siblings_of(&self, id: PersonId) -> Vec<&Person> {
        self.symmetric_neighbors(id, Relation::Sibling)
            .into_iter()
            .filter_map(|pid| self.person(pid))
            .collect()
    }

    fn symmetric_neighbors(&self, id: PersonId, relation: Relation) -> Vec<PersonId> {
        let Some(idx) = self.node_index(id) else {
            return Vec::new();
        };
        let mut out: Vec<PersonId> = self
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .filter(|e| *e.weight() == relation)
            .map(|e| self.graph[e.target()].id)
            .chain(
                self.graph
                    .edges_directed(idx, Direction::Incoming)
                    .filter(|e| *e.weight() == relation)
                    .map(|e| self.graph[e.source()].id),
            )
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// All edges as records, sorted so output does not depend on insertion
    /// history.
    pub fn edges(&self) -> Vec<EdgeRecord> {
        let mut edges: Vec<EdgeRecord> = self
            .graph
            .edge_references()
            .map(|e| EdgeRecord {
                from: self.graph[e.source()].id,
                to: self.graph[e.target()].id,
                relation: *e.weight(),
            })
            .collect();
        edges.sort();
        edges
    }

    /// Whether an equivalent edge (same dedup key) is present.
    pub fn has_edge(&self, edge: &EdgeRecord) -> bool {
        match edge.relation {
            Relation::Parent { .. } => self
                .parent_links(edge.to)
                .iter()
                .any(|(id, _)| *id == edge.from),
            relation => self.symmetric_neighbors(edge.from, relation).contains(&edge.to),
        }
    }

    /// Flattens the graph into its serializable form.
    pub fn snapshot(&self) -> TreeSnapshot {
        TreeSnapshot {
            people: self.people().cloned().collect(),
            edges: self.edges(),
        }
    }

    // -----------------------------------------------------------------------
    // Structural checks
    // -----------------------------------------------------------------------

    /// Finds cycles among parent edges.
    ///
    /// Runs Tarjan's SCC over the parent sub-graph. Each returned path starts
    /// at the smallest id in its component and follows parent-to-child edges
    /// back to it. Results are ordered by that starting id.
    pub fn detect_cycles(&self) -> Vec<Vec<PersonId>> {
        let mut lineage: DiGraph<PersonId, ()> = DiGraph::new();
        let mut positions = IndexMap::new();
        for id in self.index.keys() {
            positions.insert(*id, lineage.add_node(*id));
        }
        for edge in self.graph.edge_references() {
            if edge.weight().is_parent() {
                let from = positions[&self.graph[edge.source()].id];
                let to = positions[&self.graph[edge.target()].id];
                lineage.add_edge(from, to, ());
            }
        }

        let mut cycles: Vec<Vec<PersonId>> = tarjan_scc(&lineage)
            .into_iter()
            .filter(|component| component.len() > 1)
            .filter_map(|component| {
                let members: HashSet<PersonId> =
                    component.iter().map(|idx| lineage[*idx]).collect();
                self.cycle_path(&members)
            })
            .collect();
        cycles.sort();
        cycles
    }

    /// Walks parent edges inside one strongly connected component from its
    /// smallest member until it returns to the start.
    fn cycle_path(&self, members: &HashSet<PersonId>) -> Option<Vec<PersonId>> {
        let start = *members.iter().min()?;
        let mut stack = vec![(start, vec![start])];
        let mut visited = HashSet::new();
        while let Some((current, path)) = stack.pop() {
            for child in self.children_of(current).into_iter().rev() {
                if child.id == start {
                    return Some(path);
                }
                if members.contains(&child.id) && visited.insert(child.id) {
                    let mut next = path.clone();
                    next.push(child.id);
                    stack.push((child.id, next));
                }
            }
        }
        None
    }

    /// Persons with no parent, child, or spouse edge whose generation lies
    /// below the root generation. Ordered by id.
    pub fn detect_orphans(&self) -> Vec<PersonId> {
        let Some(root) = self.root_generation() else {
            return Vec::new();
        };
        let mut orphans: Vec<PersonId> = self
            .people()
            .filter(|p| p.generation > root)
            .filter(|p| {
                self.parent_links(p.id).is_empty()
                    && self.children_of(p.id).is_empty()
                    && self.spouses_of(p.id).is_empty()
            })
            .map(|p| p.id)
            .collect();
        orphans.sort();
        orphans
    }
}
