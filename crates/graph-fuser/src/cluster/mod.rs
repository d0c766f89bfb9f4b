//! Partitioning of eligible nodes into fusable clusters.
//!
//! Nodes are visited in execution order and every data edge between two eligible nodes is offered
//! to [`ClusterConstructor`], which joins the two clusters when the lock, control-dependency,
//! fan-out, cycle and persistent-overlap rules all allow it.

mod constructor;
mod contract;
mod footprint;
mod partition;
mod union_find;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use thiserror::Error;

use crate::graph::{EngineClass, GraphAdapter, GraphError, Node, NodeId};

pub use constructor::ClusterConstructor;
pub use footprint::{persistent_range, OverlapConflict, PersistentFootprint, Role};
pub use union_find::UnionFind;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("Cluster from complex guid Id {id} has overlapping persistent tensors")]
    ComplexOverlap { id: u32 },
    #[error("Cluster from complex guid Id {id} is not connected")]
    ComplexDisconnected { id: u32 },
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Externally supplied eligibility predicate.
pub trait Clusterable: Send + Sync {
    fn can_cluster(&self, graph: &dyn GraphAdapter, node: &Node) -> bool;
}

/// Accepts nodes running on one engine class whose operands are all narrower than 64 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineClassPredicate {
    pub engine: EngineClass,
}

impl Default for EngineClassPredicate {
    fn default() -> Self {
        Self {
            engine: EngineClass::Vector,
        }
    }
}

impl Clusterable for EngineClassPredicate {
    fn can_cluster(&self, graph: &dyn GraphAdapter, node: &Node) -> bool {
        node.engine == self.engine
            && !node
                .operands()
                .filter_map(|t| graph.tensor(t))
                .any(|t| t.dtype.is_64bit())
    }
}

/// Why a candidate merge was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeReject {
    Locked,
    WorkspaceOutput,
    ControlDependency { blocking: NodeId, blocked: NodeId },
    FanOutBudget { count: usize, budget: u32 },
    Cycle { through: NodeId },
    PersistentOverlap(OverlapConflict),
}

impl fmt::Display for MergeReject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeReject::Locked => write!(f, "cluster is locked"),
            MergeReject::WorkspaceOutput => write!(f, "producer output lives in workspace memory"),
            MergeReject::ControlDependency { blocking, blocked } => write!(
                f,
                "control dependency {blocking:?} -> {blocked:?} between the clusters"
            ),
            MergeReject::FanOutBudget { count, budget } => {
                write!(f, "{count} fan-out nodes exceed budget {budget}")
            }
            MergeReject::Cycle { through } => {
                write!(f, "merge would create a cycle through {through:?}")
            }
            MergeReject::PersistentOverlap(conflict) => write!(f, "{conflict}"),
        }
    }
}

/// A refused merge attempt, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRejection {
    pub producer: NodeId,
    pub consumer: NodeId,
    pub reason: MergeReject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct ClusterId(pub u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub id: ClusterId,
    /// Members in execution order.
    pub nodes: Vec<NodeId>,
    pub locked: bool,
    /// Composite node the cluster was extracted from, for locked clusters.
    pub complex_origin: Option<u32>,
    pub fanout_nodes: Vec<NodeId>,
    /// Views outside the cluster that need ordering edges once the cluster is fused.
    pub deferred_views: Vec<NodeId>,
}

impl Cluster {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains(&node)
    }
}

/// Final partition produced by the cluster constructor.
#[derive(Debug, Clone, Default)]
pub struct Clustering {
    clusters: Vec<Cluster>,
    cluster_of: HashMap<NodeId, ClusterId>,
    rejections: Vec<MergeRejection>,
}

impl Clustering {
    pub(crate) fn new(clusters: Vec<Cluster>, rejections: Vec<MergeRejection>) -> Self {
        let cluster_of = clusters
            .iter()
            .flat_map(|c| c.nodes.iter().map(move |n| (*n, c.id)))
            .collect();
        Self {
            clusters,
            cluster_of,
            rejections,
        }
    }

    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn cluster(&self, id: ClusterId) -> Option<&Cluster> {
        self.clusters.get(id.0 as usize)
    }

    pub fn cluster_of(&self, node: NodeId) -> Option<ClusterId> {
        self.cluster_of.get(&node).copied()
    }

    pub fn rejections(&self) -> &[MergeRejection] {
        &self.rejections
    }

    /// Partition as a set of member sets, independent of cluster numbering.
    pub fn partition(&self) -> BTreeSet<BTreeSet<NodeId>> {
        self.clusters
            .iter()
            .map(|c| c.nodes.iter().copied().collect())
            .collect()
    }

    /// Returns `true` when contracting every cluster to one vertex leaves the graph acyclic.
    ///
    /// Views recorded as deferred are elided: their ordering is restored by control edges after
    /// splicing rather than by the contracted graph.
    pub fn is_contracted_acyclic<G: GraphAdapter + ?Sized>(&self, graph: &G) -> bool {
        let elided: HashSet<NodeId> = self
            .clusters
            .iter()
            .flat_map(|c| c.deferred_views.iter().copied())
            .collect();
        let vertex = |node: NodeId| -> u64 {
            match self.cluster_of(node) {
                Some(id) => u64::from(id.0),
                None => (1u64 << 32) | u64::from(node.0),
            }
        };

        let mut edges: HashMap<u64, HashSet<u64>> = HashMap::new();
        let mut indegree: HashMap<u64, usize> = HashMap::new();
        for node in graph.node_ids() {
            if elided.contains(&node) {
                continue;
            }
            indegree.entry(vertex(node)).or_default();
            let mut next: Vec<NodeId> = graph.successors(node).into_vec();
            next.extend(graph.blocked_nodes(node));
            for succ in next {
                if elided.contains(&succ) {
                    continue;
                }
                let (from, to) = (vertex(node), vertex(succ));
                if from != to && edges.entry(from).or_default().insert(to) {
                    *indegree.entry(to).or_default() += 1;
                }
            }
        }

        let mut ready: Vec<u64> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(v, _)| *v)
            .collect();
        let mut seen = 0usize;
        while let Some(v) = ready.pop() {
            seen += 1;
            if let Some(out) = edges.get(&v) {
                for to in out {
                    if let Some(d) = indegree.get_mut(to) {
                        *d -= 1;
                        if *d == 0 {
                            ready.push(*to);
                        }
                    }
                }
            }
        }
        seen == indegree.len()
    }
}
