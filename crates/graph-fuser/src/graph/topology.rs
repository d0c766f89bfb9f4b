use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use super::adapter::{GraphAdapter, GraphError};
use super::node::{ControlKind, NodeId};

/// Topological order over data and control edges. Ties are broken by the smallest node id so the
/// order is deterministic and does not depend on insertion history.
pub fn execution_order<G: GraphAdapter + ?Sized>(graph: &G) -> Result<Vec<NodeId>, GraphError> {
    let ids = graph.node_ids();
    let mut indegree: HashMap<NodeId, usize> = ids.iter().map(|id| (*id, 0)).collect();
    let mut edges: HashMap<NodeId, Vec<NodeId>> = HashMap::new();

    let mut add_edge = |from: NodeId, to: NodeId, edges: &mut HashMap<NodeId, Vec<NodeId>>| {
        let out = edges.entry(from).or_default();
        if !out.contains(&to) {
            out.push(to);
            *indegree.entry(to).or_default() += 1;
        }
    };

    for id in &ids {
        for succ in graph.successors(*id) {
            add_edge(*id, succ, &mut edges);
        }
    }
    for (blocking, blocked, _) in graph.control_dependencies() {
        add_edge(blocking, blocked, &mut edges);
    }

    let mut ready: BinaryHeap<Reverse<NodeId>> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| Reverse(*id))
        .collect();
    let mut order = Vec::with_capacity(ids.len());
    while let Some(Reverse(id)) = ready.pop() {
        order.push(id);
        if let Some(out) = edges.get(&id) {
            for next in out {
                if let Some(degree) = indegree.get_mut(next) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse(*next));
                    }
                }
            }
        }
    }

    if order.len() != ids.len() {
        return Err(GraphError::Cycle {
            remaining: ids.len() - order.len(),
        });
    }
    Ok(order)
}

/// Returns `true` when `to` is reachable from `from` through data edges only.
pub fn data_path_exists<G: GraphAdapter + ?Sized>(graph: &G, from: NodeId, to: NodeId) -> bool {
    let mut stack = vec![from];
    let mut seen = HashSet::new();
    while let Some(node) = stack.pop() {
        if !seen.insert(node) {
            continue;
        }
        for succ in graph.successors(node) {
            if succ == to {
                return true;
            }
            stack.push(succ);
        }
    }
    false
}

/// Memory control edges that run parallel to a data path between the same two nodes.
///
/// All candidates are collected before anything is removed, so removing one edge never changes
/// the verdict for another.
pub fn redundant_control_edges<G: GraphAdapter + ?Sized>(graph: &G) -> Vec<(NodeId, NodeId)> {
    graph
        .control_dependencies()
        .into_iter()
        .filter(|(_, _, kind)| *kind == ControlKind::Memory)
        .filter(|(blocking, blocked, _)| data_path_exists(graph, *blocking, *blocked))
        .map(|(blocking, blocked, _)| (blocking, blocked))
        .collect()
}
