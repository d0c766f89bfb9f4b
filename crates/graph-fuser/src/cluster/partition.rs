use std::collections::{BTreeSet, HashMap};

use crate::graph::{GraphAdapter, NodeId};

use super::footprint::PersistentFootprint;
use super::union_find::UnionFind;

/// Derived state of one cluster, keyed by its union-find representative.
#[derive(Debug, Clone, Default)]
pub(crate) struct ClusterState {
    pub members: Vec<NodeId>,
    pub footprint: PersistentFootprint,
    pub fanouts: BTreeSet<NodeId>,
    pub locked: bool,
    pub complex_origin: Option<u32>,
    /// View nodes outside the cluster that sit on a cycle closed by this cluster.
    pub deferred_views: BTreeSet<NodeId>,
}

/// Vertex of the contracted graph: a cluster of eligible nodes or a single ineligible node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub(crate) enum Vertex {
    Cluster(u32),
    Node(NodeId),
}

/// Union-find partition of the eligible nodes plus per-cluster bookkeeping.
#[derive(Debug, Clone, Default)]
pub(crate) struct Partition {
    nodes: Vec<NodeId>,
    index_of: HashMap<NodeId, u32>,
    uf: UnionFind,
    states: HashMap<u32, ClusterState>,
}

impl Partition {
    /// Creates one singleton cluster per eligible node.
    pub fn new<G: GraphAdapter + ?Sized>(graph: &G, eligible: &[NodeId]) -> Self {
        let mut index_of = HashMap::with_capacity(eligible.len());
        let mut states = HashMap::with_capacity(eligible.len());
        for (index, node) in eligible.iter().enumerate() {
            let index = index as u32;
            index_of.insert(*node, index);
            let mut state = ClusterState {
                members: vec![*node],
                footprint: PersistentFootprint::of_node(graph, *node),
                ..ClusterState::default()
            };
            if is_fanout(graph, *node) {
                state.fanouts.insert(*node);
            }
            states.insert(index, state);
        }
        Self {
            nodes: eligible.to_vec(),
            index_of,
            uf: UnionFind::new(eligible.len()),
            states,
        }
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.index_of.contains_key(&node)
    }

    /// Eligible nodes in the order the partition was created with.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Representative of the cluster containing `node`, `None` for ineligible nodes.
    pub fn root_of(&mut self, node: NodeId) -> Option<u32> {
        let index = *self.index_of.get(&node)?;
        Some(self.uf.find(index))
    }

    /// Read-only representative lookup, without path compression.
    pub fn peek_root(&self, node: NodeId) -> Option<u32> {
        let index = *self.index_of.get(&node)?;
        Some(self.uf.root(index))
    }

    pub fn vertex(&self, node: NodeId) -> Vertex {
        match self.peek_root(node) {
            Some(root) => Vertex::Cluster(root),
            None => Vertex::Node(node),
        }
    }

    pub fn state(&self, root: u32) -> Option<&ClusterState> {
        self.states.get(&root)
    }

    pub fn state_mut(&mut self, root: u32) -> Option<&mut ClusterState> {
        self.states.get_mut(&root)
    }

    pub fn members(&self, vertex: Vertex) -> Vec<NodeId> {
        match vertex {
            Vertex::Cluster(root) => self
                .states
                .get(&root)
                .map(|s| s.members.clone())
                .unwrap_or_default(),
            Vertex::Node(node) => vec![node],
        }
    }

    /// Joins two clusters and folds their bookkeeping into the surviving representative.
    pub fn union(&mut self, a: u32, b: u32) -> u32 {
        if a == b {
            return a;
        }
        let first = self.states.remove(&a).unwrap_or_default();
        let second = self.states.remove(&b).unwrap_or_default();
        let root = self.uf.union(a, b);

        let mut merged = first;
        merged.members.extend(second.members);
        merged.footprint.merge(second.footprint);
        merged.fanouts.extend(second.fanouts);
        merged.locked |= second.locked;
        merged.complex_origin = merged.complex_origin.or(second.complex_origin);
        merged.deferred_views.extend(second.deferred_views);
        self.states.insert(root, merged);
        root
    }

    /// Current clusters as `(representative, state)` pairs.
    pub fn clusters(&self) -> impl Iterator<Item = (u32, &ClusterState)> {
        self.states.iter().map(|(root, state)| (*root, state))
    }
}

/// A node is a fan-out node when one output feeds several distinct consumers or it has several
/// outputs.
pub(crate) fn is_fanout<G: GraphAdapter + ?Sized>(graph: &G, node: NodeId) -> bool {
    let Some(n) = graph.node(node) else {
        return false;
    };
    n.outputs.len() > 1 || n.outputs.iter().any(|t| graph.consumers(*t).len() > 1)
}
