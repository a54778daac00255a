//! Dependency graph between entities or epics.
//!
//! # Data Model
//!
//! Every declared [`Dependency`] is kept as an edge of `declared`
//! (source → target, labelled with its [`DependencyType`]). Types that imply
//! ordering are additionally projected into `ordering`, where an edge always
//! points from the prerequisite to the dependent:
//!
//! | declared                 | ordering edge |
//! |--------------------------|---------------|
//! | `A blocks B`             | A → B         |
//! | `A is_dependency_of B`   | A → B         |
//! | `A is_blocked_by B`      | B → A         |
//! | `A depends_on B`         | B → A         |
//! | `relates_to`, duplicates | none          |
//!
//! Both graphs add nodes in lockstep, so a `NodeIndex` is valid in either.

use std::collections::HashMap;
use std::{fmt, str::FromStr};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};

use super::cycles::{self, Cycle};

/// Relation kinds between two entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    Blocks,
    IsBlockedBy,
    DependsOn,
    IsDependencyOf,
    RelatesTo,
    Duplicates,
    IsDuplicatedBy,
}

impl DependencyType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Blocks => "blocks",
            Self::IsBlockedBy => "is_blocked_by",
            Self::DependsOn => "depends_on",
            Self::IsDependencyOf => "is_dependency_of",
            Self::RelatesTo => "relates_to",
            Self::Duplicates => "duplicates",
            Self::IsDuplicatedBy => "is_duplicated_by",
        }
    }

    /// The same relation seen from the other end.
    #[must_use]
    pub const fn inverse(self) -> Self {
        match self {
            Self::Blocks => Self::IsBlockedBy,
            Self::IsBlockedBy => Self::Blocks,
            Self::DependsOn => Self::IsDependencyOf,
            Self::IsDependencyOf => Self::DependsOn,
            Self::RelatesTo => Self::RelatesTo,
            Self::Duplicates => Self::IsDuplicatedBy,
            Self::IsDuplicatedBy => Self::Duplicates,
        }
    }

    /// Whether the relation constrains sync order.
    #[must_use]
    pub const fn is_ordering(self) -> bool {
        matches!(
            self,
            Self::Blocks | Self::IsBlockedBy | Self::DependsOn | Self::IsDependencyOf
        )
    }
}

impl fmt::Display for DependencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown dependency type '{0}'")]
pub struct UnknownDependencyType(pub String);

impl FromStr for DependencyType {
    type Err = UnknownDependencyType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "blocks" => Ok(Self::Blocks),
            "is_blocked_by" | "blocked_by" => Ok(Self::IsBlockedBy),
            "depends_on" => Ok(Self::DependsOn),
            "is_dependency_of" => Ok(Self::IsDependencyOf),
            "relates_to" | "relates" => Ok(Self::RelatesTo),
            "duplicates" => Ok(Self::Duplicates),
            "is_duplicated_by" => Ok(Self::IsDuplicatedBy),
            _ => Err(UnknownDependencyType(s.to_string())),
        }
    }
}

/// A directed relation `source --kind--> target`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    pub source: String,
    pub target: String,
    pub kind: DependencyType,
}

impl Dependency {
    #[must_use]
    pub fn new(source: impl Into<String>, target: impl Into<String>, kind: DependencyType) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            kind,
        }
    }

    /// The same relation declared from the target's side.
    #[must_use]
    pub fn inverse(&self) -> Self {
        Self {
            source: self.target.clone(),
            target: self.source.clone(),
            kind: self.kind.inverse(),
        }
    }

    /// `(prerequisite, dependent)` if this relation constrains order.
    #[must_use]
    pub fn ordering(&self) -> Option<(&str, &str)> {
        match self.kind {
            DependencyType::Blocks | DependencyType::IsDependencyOf => {
                Some((self.source.as_str(), self.target.as_str()))
            }
            DependencyType::IsBlockedBy | DependencyType::DependsOn => {
                Some((self.target.as_str(), self.source.as_str()))
            }
            DependencyType::RelatesTo | DependencyType::Duplicates | DependencyType::IsDuplicatedBy => {
                None
            }
        }
    }
}

/// Errors from graph ordering.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// The graph is not a DAG; `cycle` is one offending loop.
    #[error("{cycle}")]
    Cycle { cycle: Cycle },
}

impl GraphError {
    #[must_use]
    pub const fn code(&self) -> crate::error::ErrorCode {
        crate::error::ErrorCode::CycleDetected
    }
}

/// Directed graph of dependencies with cycle detection and topological
/// ordering.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    declared: DiGraph<String, DependencyType>,
    ordering: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from a node list and a set of dependencies. Nodes are
    /// added first so isolated ones still appear in the topological order.
    pub fn build<'a, N, D>(nodes: N, deps: D) -> Self
    where
        N: IntoIterator<Item = &'a str>,
        D: IntoIterator<Item = Dependency>,
    {
        let mut graph = Self::new();
        for node in nodes {
            graph.add_node(node);
        }
        for dep in deps {
            graph.add(dep);
        }
        graph
    }

    /// Ensure a node exists and return its index.
    pub fn add_node(&mut self, id: &str) -> NodeIndex {
        if let Some(idx) = self.index.get(id) {
            return *idx;
        }
        let idx = self.declared.add_node(id.to_string());
        let ordering_idx = self.ordering.add_node(id.to_string());
        debug_assert_eq!(idx, ordering_idx);
        self.index.insert(id.to_string(), idx);
        idx
    }

    /// Add a dependency. Duplicate declarations are ignored.
    pub fn add(&mut self, dep: Dependency) {
        let source = self.add_node(&dep.source);
        let target = self.add_node(&dep.target);

        let duplicate = self
            .declared
            .edges_connecting(source, target)
            .any(|edge| *edge.weight() == dep.kind);
        if duplicate {
            return;
        }
        self.declared.add_edge(source, target, dep.kind);

        if let Some((prereq, dependent)) = dep.ordering() {
            let (a, b) = (self.index[prereq], self.index[dependent]);
            if self.ordering.find_edge(a, b).is_none() {
                self.ordering.add_edge(a, b, ());
            }
        }
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.index.len()
    }

    /// All node ids in insertion order.
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.declared.node_indices().map(|idx| self.declared[idx].as_str())
    }

    /// Ids that cannot sync before `id` has (the ids `id` blocks).
    #[must_use]
    pub fn get_blocking(&self, id: &str) -> Vec<String> {
        self.ordering_neighbors(id, Direction::Outgoing)
    }

    /// Ids that must sync before `id`.
    #[must_use]
    pub fn get_blocked_by(&self, id: &str) -> Vec<String> {
        self.ordering_neighbors(id, Direction::Incoming)
    }

    /// Every declared relation touching `id`, expressed with `id` as the
    /// source (relations declared by the other end are inverted).
    #[must_use]
    pub fn get_all_for(&self, id: &str) -> Vec<Dependency> {
        let Some(&idx) = self.index.get(id) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for edge in self.declared.edges_directed(idx, Direction::Outgoing) {
            let target = &self.declared[edge.target()];
            out.push(Dependency::new(id, target.as_str(), *edge.weight()));
        }
        for edge in self.declared.edges_directed(idx, Direction::Incoming) {
            let source = &self.declared[edge.source()];
            out.push(Dependency::new(source.as_str(), id, *edge.weight()).inverse());
        }
        out.sort_by(|a, b| a.target.cmp(&b.target).then_with(|| a.kind.as_str().cmp(b.kind.as_str())));
        out
    }

    fn ordering_neighbors(&self, id: &str, dir: Direction) -> Vec<String> {
        let Some(&idx) = self.index.get(id) else {
            return Vec::new();
        };
        let mut out: Vec<String> = self
            .ordering
            .neighbors_directed(idx, dir)
            .map(|n| self.ordering[n].clone())
            .collect();
        out.sort();
        out
    }

    /// Successor ids of `idx` in the ordering graph, in insertion order.
    pub(crate) fn successors(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        let mut out: Vec<NodeIndex> = self
            .ordering
            .neighbors_directed(idx, Direction::Outgoing)
            .collect();
        out.sort();
        out
    }

    pub(crate) fn name(&self, idx: NodeIndex) -> &str {
        &self.ordering[idx]
    }

    pub(crate) fn indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.ordering.node_indices()
    }

    /// All cycles found by a three-color DFS over the ordering edges.
    #[must_use]
    pub fn detect_cycles(&self) -> Vec<Cycle> {
        cycles::find_all_cycles(self)
    }

    /// Whether any cycle exists, without collecting them.
    #[must_use]
    pub fn has_cycles(&self) -> bool {
        cycles::has_cycles(self)
    }

    /// Ids in an order where every prerequisite precedes its dependents.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Cycle`] with one offending cycle when the
    /// ordering edges do not form a DAG. No partial order is returned.
    pub fn topological_sort(&self) -> Result<Vec<String>, GraphError> {
        match petgraph::algo::toposort(&self.ordering, None) {
            Ok(order) => Ok(order.into_iter().map(|idx| self.ordering[idx].clone()).collect()),
            Err(cycle) => {
                let found = self.detect_cycles().into_iter().next().unwrap_or_else(|| Cycle {
                    nodes: vec![self.ordering[cycle.node_id()].clone()],
                });
                Err(GraphError::Cycle { cycle: found })
            }
        }
    }
}
