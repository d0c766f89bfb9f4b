use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use tracing::{debug, trace};

use crate::config::FusionConfig;
use crate::graph::{ComplexGroup, GraphAdapter, Node, NodeId};

use super::contract::{merge_cycle_verdict, CycleVerdict};
use super::partition::Partition;
use super::{
    Cluster, ClusterError, ClusterId, Clusterable, Clustering, MergeReject, MergeRejection,
};

/// Builds a [`Clustering`] from the eligible nodes of a graph.
pub struct ClusterConstructor<'g, G: GraphAdapter> {
    graph: &'g G,
    order: Vec<NodeId>,
    position: HashMap<NodeId, usize>,
    partition: Partition,
    budget: u32,
    complex_clustering: bool,
    defer_view_cycles: bool,
    rejections: Vec<MergeRejection>,
}

impl<'g, G: GraphAdapter> ClusterConstructor<'g, G> {
    pub fn new(
        graph: &'g G,
        config: &FusionConfig,
        predicate: &dyn Clusterable,
    ) -> Result<Self, ClusterError> {
        let order = graph.execution_order()?;
        let position = order
            .iter()
            .enumerate()
            .map(|(pos, node)| (*node, pos))
            .collect();
        let eligible: Vec<NodeId> = order
            .iter()
            .copied()
            .filter(|id| {
                graph.node(*id).is_some_and(|node| {
                    predicate.can_cluster(graph, node) && !is_unrooted_constant(graph, node)
                })
            })
            .collect();
        debug!(
            target: "graph_fuser",
            nodes = order.len(),
            eligible = eligible.len(),
            "clustering graph"
        );
        let partition = Partition::new(graph, &eligible);
        Ok(Self {
            graph,
            order,
            position,
            partition,
            budget: config.effective_max_multi_consumers(),
            complex_clustering: config.complex_clustering,
            defer_view_cycles: true,
            rejections: Vec::new(),
        })
    }

    /// Rejects merges that close a cycle through views instead of deferring the views.
    pub fn without_view_deferral(mut self) -> Self {
        self.defer_view_cycles = false;
        self
    }

    /// Runs complex extraction followed by edge-driven merging.
    pub fn compute(mut self) -> Result<Clustering, ClusterError> {
        let graph = self.graph;
        if self.complex_clustering {
            for group in graph.complex_groups() {
                self.add_complex_group(group)?;
            }
        }

        let eligible = self.partition.nodes().to_vec();
        for consumer in eligible {
            for producer in graph.predecessors(consumer) {
                if self.partition.contains(producer) {
                    self.try_merge(producer, consumer);
                }
            }
        }
        Ok(self.finish())
    }

    /// Joins the eligible members of a composite node into one locked cluster.
    fn add_complex_group(&mut self, group: &ComplexGroup) -> Result<(), ClusterError> {
        let mut members: Vec<NodeId> = group
            .nodes
            .iter()
            .copied()
            .filter(|n| self.partition.contains(*n))
            .collect();
        members.sort_by_key(|n| self.position.get(n).copied().unwrap_or(usize::MAX));
        members.dedup();
        let Some(&anchor) = members.last() else {
            return Ok(());
        };

        if !self.is_weakly_connected(&members) {
            return Err(ClusterError::ComplexDisconnected { id: group.id });
        }

        let mut root = self.root(anchor);
        for member in &members {
            let other = self.root(*member);
            if other == root {
                continue;
            }
            let conflict = match (self.partition.state(root), self.partition.state(other)) {
                (Some(a), Some(b)) => a.footprint.conflict_with(&b.footprint),
                _ => None,
            };
            if conflict.is_some() {
                return Err(ClusterError::ComplexOverlap { id: group.id });
            }
            root = self.partition.union(root, other);
        }
        if let Some(state) = self.partition.state_mut(root) {
            state.locked = true;
            state.complex_origin = Some(group.id);
        }
        debug!(
            target: "graph_fuser",
            complex = group.id,
            members = members.len(),
            "locked complex cluster"
        );
        Ok(())
    }

    fn is_weakly_connected(&self, members: &[NodeId]) -> bool {
        let set: HashSet<NodeId> = members.iter().copied().collect();
        let Some(&start) = members.first() else {
            return true;
        };
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            let adjacent = self
                .graph
                .successors(node)
                .into_iter()
                .chain(self.graph.predecessors(node));
            for next in adjacent {
                if set.contains(&next) && seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        seen.len() == set.len()
    }

    fn root(&mut self, node: NodeId) -> u32 {
        // Only called with eligible nodes.
        self.partition.root_of(node).unwrap_or(u32::MAX)
    }

    fn try_merge(&mut self, producer: NodeId, consumer: NodeId) {
        let a = self.root(producer);
        let b = self.root(consumer);
        if a == b {
            return;
        }
        match self.check_merge(producer, a, b) {
            Ok(views) => {
                let root = self.partition.union(a, b);
                if let Some(state) = self.partition.state_mut(root) {
                    state.deferred_views.extend(views);
                }
                trace!(target: "graph_fuser", ?producer, ?consumer, "merged");
            }
            Err(reason) => {
                debug!(target: "graph_fuser", ?producer, ?consumer, %reason, "merge rejected");
                self.rejections.push(MergeRejection {
                    producer,
                    consumer,
                    reason,
                });
            }
        }
    }

    /// Returns the view nodes to defer when the merge is allowed.
    fn check_merge(
        &self,
        producer: NodeId,
        a: u32,
        b: u32,
    ) -> Result<BTreeSet<NodeId>, MergeReject> {
        let (Some(first), Some(second)) = (self.partition.state(a), self.partition.state(b))
        else {
            return Err(MergeReject::Locked);
        };
        if first.locked || second.locked {
            return Err(MergeReject::Locked);
        }

        let workspace_output = self
            .graph
            .node(producer)
            .and_then(|n| n.outputs.first())
            .and_then(|t| self.graph.tensor(*t))
            .is_some_and(|t| t.is_workspace());
        if workspace_output {
            return Err(MergeReject::WorkspaceOutput);
        }

        let other: HashSet<NodeId> = second.members.iter().copied().collect();
        for member in &first.members {
            if let Some(blocked) = self
                .graph
                .blocked_nodes(*member)
                .into_iter()
                .find(|n| other.contains(n))
            {
                return Err(MergeReject::ControlDependency {
                    blocking: *member,
                    blocked,
                });
            }
            if let Some(blocking) = self
                .graph
                .blocking_nodes(*member)
                .into_iter()
                .find(|n| other.contains(n))
            {
                return Err(MergeReject::ControlDependency {
                    blocking,
                    blocked: *member,
                });
            }
        }

        let count = first.fanouts.union(&second.fanouts).count();
        if count > self.budget as usize {
            return Err(MergeReject::FanOutBudget {
                count,
                budget: self.budget,
            });
        }

        let views = match merge_cycle_verdict(self.graph, &self.partition, a, b) {
            CycleVerdict::Acyclic => BTreeSet::new(),
            CycleVerdict::ThroughViews(views) => match views.first().copied() {
                Some(through) if !self.defer_view_cycles => {
                    return Err(MergeReject::Cycle { through })
                }
                _ => views,
            },
            CycleVerdict::ThroughNode(through) => return Err(MergeReject::Cycle { through }),
        };

        if let Some(conflict) = first.footprint.conflict_with(&second.footprint) {
            return Err(MergeReject::PersistentOverlap(conflict));
        }
        Ok(views)
    }

    fn finish(self) -> Clustering {
        let position = |n: &NodeId| self.position.get(n).copied().unwrap_or(usize::MAX);
        let mut clusters: Vec<Cluster> = self
            .partition
            .clusters()
            .map(|(_, state)| {
                let mut nodes = state.members.clone();
                nodes.sort_by_key(position);
                let mut fanout_nodes: Vec<NodeId> = state.fanouts.iter().copied().collect();
                fanout_nodes.sort_by_key(position);
                Cluster {
                    id: ClusterId(0),
                    nodes,
                    locked: state.locked,
                    complex_origin: state.complex_origin,
                    fanout_nodes,
                    deferred_views: state.deferred_views.iter().copied().collect(),
                }
            })
            .collect();
        clusters.sort_by_key(|c| c.nodes.first().map(position).unwrap_or(usize::MAX));
        for (index, cluster) in clusters.iter_mut().enumerate() {
            cluster.id = ClusterId(index as u32);
        }
        debug!(
            target: "graph_fuser",
            clusters = clusters.len(),
            rejected = self.rejections.len(),
            total = self.order.len(),
            "clustering done"
        );
        Clustering::new(clusters, self.rejections)
    }
}

/// A node with no inputs whose only predecessors, if any, are views.
fn is_unrooted_constant<G: GraphAdapter>(graph: &G, node: &Node) -> bool {
    node.inputs.is_empty()
        && graph
            .blocking_nodes(node.id)
            .iter()
            .all(|n| graph.node(*n).map_or(true, |n| n.is_view))
}
