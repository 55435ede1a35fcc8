//! Dependency ordering with cycle detection.
//!
//! An edge `(x, y)` means `x` depends on `y`, so `y` is placed before `x`.
//! Nodes that sit on a cycle, or depend on one directly or transitively, can
//! never be ordered; they are reported in [`Toposorted::cyclic`] instead.

use std::fmt::Display;
use std::hash::Hash;

use indexmap::{IndexMap, IndexSet};

use crate::error::ToposortError;

/// Result of [`toposort`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toposorted<N: Hash + Eq> {
    /// Every orderable node; dependencies come before their dependents.
    pub sorted: Vec<N>,
    /// Nodes in, or downstream of, a cycle, in input order.
    pub cyclic: IndexSet<N>,
}

/// Order `nodes` so that every node follows the nodes it depends on.
///
/// Uses Kahn's algorithm. Among nodes that are ready at the same time, input
/// order is kept, so the result is deterministic.
///
/// # Example
///
/// ```
/// use graft_flow::toposort::toposort;
///
/// let result = toposort(["a", "b", "c"], [("a", "b"), ("b", "c")]).unwrap();
/// assert_eq!(result.sorted, vec!["c", "b", "a"]);
/// assert!(result.cyclic.is_empty());
/// ```
pub fn toposort<N>(
    nodes: impl IntoIterator<Item = N>,
    edges: impl IntoIterator<Item = (N, N)>,
) -> Result<Toposorted<N>, ToposortError>
where
    N: Hash + Eq + Clone + Display,
{
    // node -> (number of unmet dependencies, dependents)
    let mut graph: IndexMap<N, (usize, IndexSet<N>)> = nodes
        .into_iter()
        .map(|node| (node, (0, IndexSet::new())))
        .collect();

    let mut seen_edges = IndexSet::new();
    for (dependent, dependency) in edges {
        for node in [&dependent, &dependency] {
            if !graph.contains_key(node) {
                return Err(ToposortError::UnknownNode {
                    node: node.to_string(),
                });
            }
        }
        if seen_edges.insert((dependent.clone(), dependency.clone())) {
            graph[&dependent].0 += 1;
            graph[&dependency].1.insert(dependent);
        }
    }

    let mut ready: std::collections::VecDeque<N> = graph
        .iter()
        .filter(|(_, (unmet, _))| *unmet == 0)
        .map(|(node, _)| node.clone())
        .collect();
    let mut sorted = Vec::with_capacity(graph.len());

    while let Some(node) = ready.pop_front() {
        let dependents = graph[&node].1.clone();
        for dependent in dependents {
            let unmet = &mut graph[&dependent].0;
            *unmet -= 1;
            if *unmet == 0 {
                ready.push_back(dependent);
            }
        }
        sorted.push(node);
    }

    let cyclic = graph
        .into_iter()
        .filter(|(_, (unmet, _))| *unmet > 0)
        .map(|(node, _)| node)
        .collect();

    Ok(Toposorted { sorted, cyclic })
}
