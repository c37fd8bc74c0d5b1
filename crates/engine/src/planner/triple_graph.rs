//! The triple graph: bitset-indexed nodes of a group graph pattern.
//!
//! Nodes are the triples of a basic graph pattern plus any child patterns
//! planned into the same group; edges connect nodes that share a variable.
//! Node count is capped at 64 so that any node subset is one `u64` mask —
//! exceeding the cap is a user-visible error, never a silent fallback.

use ahash::AHashSet;

use crate::error::{EngineResult, QueryError};
use crate::variable::Variable;

/// Hard cap on nodes (and filters, and text limits) per group.
pub const MAX_NODES: usize = 64;

#[derive(Debug)]
pub struct TripleGraph {
    /// The variables of each node.
    node_vars: Vec<Vec<Variable>>,
    /// Adjacency by shared variable.
    adjacency: Vec<Vec<usize>>,
}

impl TripleGraph {
    pub fn new(node_vars: Vec<Vec<Variable>>) -> EngineResult<TripleGraph> {
        if node_vars.len() > MAX_NODES {
            return Err(QueryError::UnsupportedFeature(format!(
                "Group graph patterns with more than {MAX_NODES} elements are not supported \
                 (got {})",
                node_vars.len()
            )));
        }
        let adjacency = (0..node_vars.len())
            .map(|i| {
                (0..node_vars.len())
                    .filter(|&k| {
                        k != i && node_vars[i].iter().any(|v| node_vars[k].contains(v))
                    })
                    .collect()
            })
            .collect();
        Ok(TripleGraph {
            node_vars,
            adjacency,
        })
    }

    pub fn num_nodes(&self) -> usize {
        self.node_vars.len()
    }

    pub fn vars_of(&self, node: usize) -> &[Variable] {
        &self.node_vars[node]
    }

    pub fn neighbors(&self, node: usize) -> &[usize] {
        &self.adjacency[node]
    }

    /// Connected-component id per node (union-find over shared variables).
    pub fn connected_components(&self) -> Vec<usize> {
        let mut parent: Vec<usize> = (0..self.num_nodes()).collect();
        fn find(parent: &mut Vec<usize>, node: usize) -> usize {
            let mut root = node;
            while parent[root] != root {
                root = parent[root];
            }
            let mut current = node;
            while parent[current] != root {
                let next = parent[current];
                parent[current] = root;
                current = next;
            }
            root
        }
        for node in 0..self.num_nodes() {
            for &neighbor in &self.adjacency[node] {
                let a = find(&mut parent, node);
                let b = find(&mut parent, neighbor);
                if a != b {
                    parent[a] = b;
                }
            }
        }
        // Normalize roots to dense component indices.
        let mut component_of_root = std::collections::HashMap::new();
        (0..self.num_nodes())
            .map(|node| {
                let root = find(&mut parent, node);
                let next = component_of_root.len();
                *component_of_root.entry(root).or_insert(next)
            })
            .collect()
    }
}

/// A node of the join graph used for subgraph counting: a bitmask of its
/// neighbors.
#[derive(Debug, Clone, Copy)]
pub struct CountGraphNode {
    pub neighbors: u64,
}

/// Count the connected subgraphs of `graph`, stopping (and returning
/// `budget + 1`) as soon as the count exceeds `budget`. This drives the DP
/// versus greedy decision: the count approximates the number of subproblems
/// the DP planner would enumerate.
pub fn count_connected_subgraphs(graph: &[CountGraphNode], budget: u64) -> u64 {
    // Standard enumeration: each connected subgraph is counted once via its
    // lowest-numbered node; extend by neighbors not smaller than the anchor.
    let mut count = 0u64;
    for anchor in 0..graph.len() {
        let forbidden = (1u64 << anchor) | ((1u64 << anchor) - 1);
        count = extend_subgraph(
            graph,
            1u64 << anchor,
            forbidden,
            count,
            budget,
        );
        if count > budget {
            return count;
        }
    }
    count
}

fn extend_subgraph(
    graph: &[CountGraphNode],
    subgraph: u64,
    forbidden: u64,
    mut count: u64,
    budget: u64,
) -> u64 {
    count += 1;
    if count > budget {
        return count;
    }
    // All neighbors of the current subgraph that are still allowed.
    let mut frontier = 0u64;
    let mut remaining = subgraph;
    while remaining != 0 {
        let node = remaining.trailing_zeros() as usize;
        remaining &= remaining - 1;
        frontier |= graph[node].neighbors;
    }
    frontier &= !forbidden & !subgraph;

    // Enumerate all non-empty subsets of the frontier without duplicates:
    // each frontier node, once skipped, becomes forbidden for the branch.
    let mut new_forbidden = forbidden | frontier;
    let mut nodes = frontier;
    while nodes != 0 {
        let node = nodes.trailing_zeros() as usize;
        nodes &= nodes - 1;
        let bit = 1u64 << node;
        new_forbidden &= !bit;
        count = extend_subgraph(graph, subgraph | bit, new_forbidden | bit, count, budget);
        if count > budget {
            return count;
        }
    }
    count
}

/// Deduplicate a variable list while preserving order.
pub fn dedup_vars(vars: Vec<Variable>) -> Vec<Variable> {
    let mut seen = AHashSet::new();
    vars.into_iter().filter(|v| seen.insert(v.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str) -> Variable {
        Variable::new(name)
    }

    #[test]
    fn adjacency_by_shared_variable() {
        let graph = TripleGraph::new(vec![
            vec![var("x"), var("y")],
            vec![var("y"), var("z")],
            vec![var("a")],
        ])
        .unwrap();
        assert_eq!(graph.neighbors(0), &[1]);
        assert_eq!(graph.neighbors(1), &[0]);
        assert!(graph.neighbors(2).is_empty());
        let components = graph.connected_components();
        assert_eq!(components[0], components[1]);
        assert_ne!(components[0], components[2]);
    }

    #[test]
    fn more_than_64_nodes_is_an_error() {
        let vars: Vec<Vec<Variable>> = (0..65).map(|i| vec![var(&format!("v{i}"))]).collect();
        assert!(matches!(
            TripleGraph::new(vars),
            Err(QueryError::UnsupportedFeature(_))
        ));
    }

    #[test]
    fn subgraph_count_of_a_path() {
        // A path a-b-c has 6 connected subgraphs: {a},{b},{c},{ab},{bc},{abc}.
        let graph = [
            CountGraphNode { neighbors: 0b010 },
            CountGraphNode { neighbors: 0b101 },
            CountGraphNode { neighbors: 0b010 },
        ];
        assert_eq!(count_connected_subgraphs(&graph, 100), 6);
    }

    #[test]
    fn subgraph_count_respects_budget() {
        let graph = [
            CountGraphNode { neighbors: 0b110 },
            CountGraphNode { neighbors: 0b101 },
            CountGraphNode { neighbors: 0b011 },
        ];
        assert!(count_connected_subgraphs(&graph, 2) > 2);
    }
}
