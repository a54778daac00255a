//! Cycle detection for the dependency graph.
//!
//! # Design
//!
//! - **Three-color DFS**: every node starts White (unvisited), turns Gray
//!   while it is on the DFS stack and Black once all its successors are
//!   done. An edge into a Gray node is a back edge and closes a cycle.
//! - **Full path**: the cycle is reconstructed from the DFS parent map, so
//!   the report lists every node of the loop, not only the back edge.
//! - **O(V+E)**: each node and ordering edge is visited at most once.

#![allow(clippy::must_use_candidate)]

use std::collections::HashMap;
use std::fmt;

use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};

use super::dependency::DependencyGraph;

// ---------------------------------------------------------------------------
// Cycle
// ---------------------------------------------------------------------------

/// A loop in the ordering graph.
///
/// `nodes` lists each member once, in edge order: `[A, B, C]` means
/// `A → B → C → A`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cycle {
    pub nodes: Vec<String>,
}

impl Cycle {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.iter().any(|n| n == id)
    }

    /// Returns `true` for a node that depends on itself.
    pub fn is_self_loop(&self) -> bool {
        self.nodes.len() == 1
    }
}

impl fmt::Display for Cycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.nodes.as_slice() {
            [] => write!(f, "dependency cycle detected"),
            [only] => write!(f, "dependency cycle detected: self-loop on '{only}'"),
            nodes => {
                let mut path = nodes.join(" → ");
                path.push_str(" → ");
                path.push_str(&nodes[0]);
                write!(f, "dependency cycle detected ({} items): {path}", nodes.len())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// DFS colors for cycle detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    /// Not yet visited.
    White,
    /// Currently on the DFS stack (in progress).
    Gray,
    /// Fully processed (all descendants visited).
    Black,
}

/// Find every cycle closed by a back edge.
///
/// Each back edge yields one [`Cycle`]; a graph with no back edge returns an
/// empty list.
pub fn find_all_cycles(graph: &DependencyGraph) -> Vec<Cycle> {
    let mut color: HashMap<NodeIndex, Color> =
        graph.indices().map(|idx| (idx, Color::White)).collect();
    let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut cycles = Vec::new();

    let roots: Vec<NodeIndex> = graph.indices().collect();
    for root in roots {
        if color.get(&root) == Some(&Color::White) {
            dfs(graph, root, &mut color, &mut parent, &mut cycles);
        }
    }

    cycles
}

/// Check whether the graph has any cycle. Short-circuits on the first back
/// edge.
pub fn has_cycles(graph: &DependencyGraph) -> bool {
    let mut color: HashMap<NodeIndex, Color> =
        graph.indices().map(|idx| (idx, Color::White)).collect();
    let roots: Vec<NodeIndex> = graph.indices().collect();
    roots.into_iter().any(|root| {
        color.get(&root) == Some(&Color::White) && dfs_has_cycle(graph, root, &mut color)
    })
}

fn dfs(
    graph: &DependencyGraph,
    node: NodeIndex,
    color: &mut HashMap<NodeIndex, Color>,
    parent: &mut HashMap<NodeIndex, NodeIndex>,
    cycles: &mut Vec<Cycle>,
) {
    color.insert(node, Color::Gray);

    for next in graph.successors(node) {
        match color.get(&next) {
            Some(Color::White) => {
                parent.insert(next, node);
                dfs(graph, next, color, parent, cycles);
            }
            Some(Color::Gray) => {
                // Back edge node → next: walk parents from node up to next.
                let mut path = vec![graph.name(node).to_string()];
                let mut cur = node;
                while cur != next {
                    match parent.get(&cur) {
                        Some(p) => {
                            cur = *p;
                            path.push(graph.name(cur).to_string());
                        }
                        None => break,
                    }
                }
                path.reverse();
                cycles.push(Cycle { nodes: path });
            }
            _ => {}
        }
    }

    color.insert(node, Color::Black);
}

fn dfs_has_cycle(
    graph: &DependencyGraph,
    node: NodeIndex,
    color: &mut HashMap<NodeIndex, Color>,
) -> bool {
    color.insert(node, Color::Gray);

    for next in graph.successors(node) {
        match color.get(&next) {
            Some(Color::White) => {
                if dfs_has_cycle(graph, next, color) {
                    return true;
                }
            }
            Some(Color::Gray) => return true,
            _ => {}
        }
    }

    color.insert(node, Color::Black);
    false
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::dependency::{Dependency, DependencyType};

    fn blocks(pairs: &[(&str, &str)]) -> DependencyGraph {
        let mut g = DependencyGraph::new();
        for (a, b) in pairs {
            g.add(Dependency::new(*a, *b, DependencyType::Blocks));
        }
        g
    }

    #[test]
    fn acyclic_graph_has_no_cycles() {
        let g = blocks(&[("A", "B"), ("B", "C"), ("A", "C")]);
        assert!(find_all_cycles(&g).is_empty());
        assert!(!has_cycles(&g));
    }

    #[test]
    fn self_loop_detected() {
        let g = blocks(&[("A", "A")]);
        let cycles = find_all_cycles(&g);
        assert_eq!(cycles.len(), 1);
        assert!(cycles[0].is_self_loop());
        assert!(cycles[0].to_string().contains("self-loop"));
    }

    #[test]
    fn three_node_cycle_reports_full_path_in_edge_order() {
        let g = blocks(&[("A", "B"), ("B", "C"), ("C", "A")]);
        let cycles = find_all_cycles(&g);
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].nodes, vec!["A", "B", "C"]);
        assert_eq!(
            cycles[0].to_string(),
            "dependency cycle detected (3 items): A → B → C → A"
        );
    }

    #[test]
    fn mutual_block_detected() {
        let g = blocks(&[("X", "Y"), ("Y", "X")]);
        assert!(has_cycles(&g));
        let cycles = find_all_cycles(&g);
        assert_eq!(cycles[0].len(), 2);
    }

    #[test]
    fn cycle_off_the_root_path() {
        let g = blocks(&[("root", "A"), ("A", "B"), ("B", "C"), ("C", "A")]);
        let cycles = find_all_cycles(&g);
        assert_eq!(cycles.len(), 1);
        assert!(!cycles[0].contains("root"));
        assert_eq!(cycles[0].len(), 3);
    }

    #[test]
    fn relates_to_never_forms_cycles() {
        let mut g = DependencyGraph::new();
        g.add(Dependency::new("A", "B", DependencyType::RelatesTo));
        g.add(Dependency::new("B", "A", DependencyType::RelatesTo));
        assert!(!has_cycles(&g));
    }
}
