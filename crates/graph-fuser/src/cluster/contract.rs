use std::collections::{BTreeSet, HashSet, VecDeque};

use crate::graph::{GraphAdapter, NodeId};

use super::partition::{Partition, Vertex};

/// Outcome of checking whether joining two clusters closes a cycle in the contracted graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CycleVerdict {
    Acyclic,
    /// Every vertex on the closed cycles is a view; the views are returned so ordering edges can
    /// be added when the fused result is spliced in.
    ThroughViews(BTreeSet<NodeId>),
    /// A real computation sits on the cycle.
    ThroughNode(NodeId),
}

#[derive(Clone, Copy)]
enum Direction {
    Forward,
    Backward,
}

fn neighbours<G: GraphAdapter + ?Sized>(graph: &G, node: NodeId, dir: Direction) -> Vec<NodeId> {
    match dir {
        Direction::Forward => {
            let mut out: Vec<NodeId> = graph.successors(node).into_vec();
            out.extend(graph.blocked_nodes(node));
            out
        }
        Direction::Backward => {
            let mut out: Vec<NodeId> = graph.predecessors(node).into_vec();
            out.extend(graph.blocking_nodes(node));
            out
        }
    }
}

/// Vertices outside `merged` reachable from it in `dir`, and whether the walk re-entered it.
fn reach<G: GraphAdapter + ?Sized>(
    graph: &G,
    partition: &Partition,
    merged: &HashSet<NodeId>,
    dir: Direction,
) -> (HashSet<Vertex>, bool) {
    let mut visited: HashSet<Vertex> = HashSet::new();
    let mut queue: VecDeque<Vertex> = VecDeque::new();
    let mut reentered = false;

    for member in merged {
        for next in neighbours(graph, *member, dir) {
            if !merged.contains(&next) {
                let vertex = partition.vertex(next);
                if visited.insert(vertex) {
                    queue.push_back(vertex);
                }
            }
        }
    }

    while let Some(vertex) = queue.pop_front() {
        for member in partition.members(vertex) {
            for next in neighbours(graph, member, dir) {
                if merged.contains(&next) {
                    reentered = true;
                    continue;
                }
                let next_vertex = partition.vertex(next);
                if visited.insert(next_vertex) {
                    queue.push_back(next_vertex);
                }
            }
        }
    }
    (visited, reentered)
}

fn is_transparent<G: GraphAdapter + ?Sized>(
    graph: &G,
    partition: &Partition,
    vertex: Vertex,
) -> bool {
    partition
        .members(vertex)
        .iter()
        .all(|n| graph.node(*n).is_some_and(|node| node.is_view))
}

/// Checks whether joining clusters `a` and `b` creates a cycle once clusters are contracted.
pub(crate) fn merge_cycle_verdict<G: GraphAdapter + ?Sized>(
    graph: &G,
    partition: &Partition,
    a: u32,
    b: u32,
) -> CycleVerdict {
    let merged: HashSet<NodeId> = partition
        .members(Vertex::Cluster(a))
        .into_iter()
        .chain(partition.members(Vertex::Cluster(b)))
        .collect();

    let (forward, reentered) = reach(graph, partition, &merged, Direction::Forward);
    if !reentered {
        return CycleVerdict::Acyclic;
    }
    let (backward, _) = reach(graph, partition, &merged, Direction::Backward);

    let mut on_cycle: Vec<Vertex> = forward.intersection(&backward).copied().collect();
    on_cycle.sort();

    let mut views = BTreeSet::new();
    for vertex in on_cycle {
        if !is_transparent(graph, partition, vertex) {
            let witness = partition
                .members(vertex)
                .into_iter()
                .min()
                .unwrap_or(NodeId(u32::MAX));
            return CycleVerdict::ThroughNode(witness);
        }
        views.extend(partition.members(vertex));
    }
    if views.is_empty() {
        return CycleVerdict::Acyclic;
    }
    CycleVerdict::ThroughViews(views)
}
