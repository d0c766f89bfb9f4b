//! Fuser wrapper: submits one cluster to the optimizer and turns the answer into a
//! [`ReplacementPlan`], or into a typed rejection when the answer cannot be trusted.

mod plan;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::cluster::{Cluster, Role};
use crate::exchange::{ClusterExchange, ExchangeGraph, ExchangeNode};
use crate::graph::{
    GraphAdapter, NodeAnnotation, NodeId, SectionBinding, SectionKind, TensorId,
};
use crate::optimizer::{FusedGraph, OptimizerModule};
use crate::splice::CommitStatus;

pub use plan::{
    PlannedNode, PlannedRole, PlannedSection, PlannedTensor, ReplacementPlan, TensorRef,
};

/// Why a cluster was left unfused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("cluster has {nodes} node(s), nothing to fuse")]
    TooFewNodes { nodes: usize },
    #[error("node {node:?} has no inputs and the optimizer requires one")]
    MissingInputs { node: NodeId },
    #[error("optimizer module is unavailable")]
    ModuleUnavailable,
    #[error("failed to translate cluster: {0}")]
    Translation(String),
    #[error("optimizer failed: {0}")]
    OptimizerFailed(String),
    #[error("external tensor {tensor:?} is missing from the optimized graph")]
    MissingExternalTensor { tensor: TensorId },
    #[error("external tensor {tensor:?} changed role, expected {expected:?}")]
    ExternalRoleMismatch { tensor: TensorId, expected: Role },
    #[error("invalid fused graph: {0}")]
    InvalidFusedGraph(String),
    #[error("no outputs: {0}")]
    NoOutputs(String),
    #[error("{0}")]
    GenericFail(String),
}

impl RejectReason {
    /// Commit status reported for a cluster rejected for this reason.
    pub fn status(&self) -> CommitStatus {
        match self {
            RejectReason::MissingExternalTensor { .. }
            | RejectReason::ExternalRoleMismatch { .. }
            | RejectReason::InvalidFusedGraph(_) => CommitStatus::InvalidFusedGraph,
            RejectReason::NoOutputs(_) => CommitStatus::NoOutputs,
            _ => CommitStatus::GenericFail,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FusionOutcome {
    Accepted(ReplacementPlan),
    Rejected(RejectReason),
}

impl FusionOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, FusionOutcome::Accepted(_))
    }
}

/// Outcome of one optimization plus the optimizer result that must be released after commit.
#[derive(Debug)]
pub struct ClusterFusion {
    pub outcome: FusionOutcome,
    pub fused: Option<FusedGraph>,
}

impl ClusterFusion {
    fn rejected(reason: RejectReason) -> Self {
        Self {
            outcome: FusionOutcome::Rejected(reason),
            fused: None,
        }
    }
}

/// Runs clusters through one optimizer module.
pub struct Fuser {
    module: Option<Arc<dyn OptimizerModule>>,
    clusters_optimized: u32,
}

impl Fuser {
    pub fn new(module: Option<Arc<dyn OptimizerModule>>) -> Self {
        Self {
            module,
            clusters_optimized: 0,
        }
    }

    pub fn module(&self) -> Option<&Arc<dyn OptimizerModule>> {
        self.module.as_ref()
    }

    /// Submits `cluster` to the optimizer and validates the answer. The graph is not modified.
    pub fn optimize_cluster<G: GraphAdapter + ?Sized>(
        &mut self,
        graph: &G,
        cluster: &Cluster,
    ) -> ClusterFusion {
        if cluster.len() < 2 {
            return ClusterFusion::rejected(RejectReason::TooFewNodes {
                nodes: cluster.len(),
            });
        }
        let Some(module) = self.module.clone() else {
            return ClusterFusion::rejected(RejectReason::ModuleUnavailable);
        };
        if module.requires_inputs() {
            let constant = cluster
                .nodes
                .iter()
                .find(|id| graph.node(**id).is_some_and(|n| n.inputs.is_empty()));
            if let Some(node) = constant {
                return ClusterFusion::rejected(RejectReason::MissingInputs { node: *node });
            }
        }

        let exchange = match ClusterExchange::build(graph, &cluster.nodes) {
            Ok(exchange) => exchange,
            Err(err) => return ClusterFusion::rejected(RejectReason::Translation(err.to_string())),
        };
        let cluster_index = self.clusters_optimized;
        self.clusters_optimized += 1;

        let fused = match module.fuse_graph(exchange.graph()) {
            Ok(fused) => fused,
            Err(err) => {
                warn!(
                    target: "graph_fuser",
                    cluster = cluster.id.0,
                    error = %err,
                    "optimizer failed on cluster"
                );
                return ClusterFusion::rejected(RejectReason::OptimizerFailed(err.to_string()));
            }
        };

        let mapper = Mapper {
            graph,
            module: module.as_ref(),
            exchange: &exchange,
            cluster,
            cluster_index,
        };
        let outcome = match mapper.plan(&fused.graph) {
            Ok(plan) => {
                debug!(
                    target: "graph_fuser",
                    cluster = cluster.id.0,
                    kernels = plan.kernels().count(),
                    nodes = plan.nodes.len(),
                    "optimized graph accepted"
                );
                FusionOutcome::Accepted(plan)
            }
            Err(reason) => {
                debug!(
                    target: "graph_fuser",
                    cluster = cluster.id.0,
                    %reason,
                    "optimized graph rejected"
                );
                FusionOutcome::Rejected(reason)
            }
        };
        ClusterFusion {
            outcome,
            fused: Some(fused),
        }
    }
}

/// Maps an optimized exchange graph back onto the compiled graph.
struct Mapper<'a, G: GraphAdapter + ?Sized> {
    graph: &'a G,
    module: &'a dyn OptimizerModule,
    exchange: &'a ClusterExchange,
    cluster: &'a Cluster,
    cluster_index: u32,
}

impl<G: GraphAdapter + ?Sized> Mapper<'_, G> {
    fn plan(&self, optimized: &ExchangeGraph) -> Result<ReplacementPlan, RejectReason> {
        self.check_tensors(optimized)?;

        let mut kernels: Vec<&ExchangeNode> = Vec::new();
        let mut existing: Vec<&ExchangeNode> = Vec::new();
        let mut created: Vec<&ExchangeNode> = Vec::new();
        for node in &optimized.nodes {
            if node.fused {
                kernels.push(node);
            } else if self.exchange.is_member(node.unique_id) {
                existing.push(node);
            } else {
                created.push(node);
            }
        }

        self.check_members(&kernels, &existing)?;
        let attached = attach_new_nodes(&kernels, &created)?;
        if kernels.is_empty() {
            return Ok(ReplacementPlan {
                kept: self.cluster.nodes.clone(),
                ..ReplacementPlan::default()
            });
        }

        let mut plan = ReplacementPlan::default();
        let mut new_index: HashMap<u32, usize> = HashMap::new();
        let external_sections = self.external_sections();
        for tensor in &optimized.tensors {
            if self.exchange.tensor(tensor.unique_id).is_some() {
                continue;
            }
            let section = tensor
                .section
                .map(|binding| remap_section(binding, &external_sections))
                .transpose()?;
            new_index.insert(tensor.unique_id, plan.tensors.len());
            plan.tensors.push(PlannedTensor {
                name: tensor.name.clone(),
                dtype: tensor.dtype,
                shape: tensor.shape.clone(),
                section,
            });
        }
        let resolve = |uid: u32| -> Result<TensorRef, RejectReason> {
            if let Some((id, _)) = self.exchange.tensor(uid) {
                return Ok(TensorRef::Existing(id));
            }
            new_index
                .get(&uid)
                .map(|index| TensorRef::New(*index))
                .ok_or_else(|| {
                    RejectReason::InvalidFusedGraph(format!("tensor {uid} is not declared"))
                })
        };

        let mut kernel_slots = Vec::with_capacity(kernels.len());
        for (counter, kernel) in kernels.iter().enumerate() {
            let mut originals: Vec<NodeId> = kernel
                .fused_identifiers
                .iter()
                .filter_map(|uid| self.exchange.node(*uid))
                .collect();
            originals.sort_by_key(|id| self.position(*id));
            let nodes: Vec<_> = originals
                .iter()
                .filter_map(|id| self.graph.node(*id))
                .collect();
            let deterministic = nodes.iter().all(|n| n.deterministic);
            let dynamic_shape = nodes.iter().any(|n| n.dynamic_shape);
            let engine = nodes.first().map(|n| n.engine).unwrap_or_default();

            let mut annotation = NodeAnnotation {
                fused_from: originals.clone(),
                sub_kernels: Vec::new(),
            };
            if dynamic_shape && kernel.params.is_empty() {
                annotation.sub_kernels = self.sub_kernels(kernel)?;
            }

            kernel_slots.push(plan.nodes.len());
            plan.nodes.push(PlannedNode {
                name: format!("fused_{}_{counter}", self.cluster_index),
                guid: kernel.guid.clone(),
                engine,
                role: PlannedRole::Kernel,
                inputs: kernel.input_tensors().map(resolve).collect::<Result<_, _>>()?,
                outputs: kernel.output_tensors().map(resolve).collect::<Result<_, _>>()?,
                params: kernel.params.clone(),
                deterministic,
                dynamic_shape,
                annotation,
            });
            plan.removed.extend(originals);
        }

        for node in created {
            let kernel = attached
                .get(&node.unique_id)
                .and_then(|k| kernel_slots.get(*k))
                .copied()
                .ok_or_else(|| {
                    RejectReason::InvalidFusedGraph(format!("node {} is unattached", node.name))
                })?;
            let engine = plan.nodes[kernel].engine;
            plan.nodes.push(PlannedNode {
                name: format!("{}_{}", node.name, node.unique_id),
                guid: node.guid.clone(),
                engine,
                role: PlannedRole::Adapter { kernel },
                inputs: node.input_tensors().map(resolve).collect::<Result<_, _>>()?,
                outputs: node.output_tensors().map(resolve).collect::<Result<_, _>>()?,
                params: node.params.clone(),
                deterministic: node.deterministic,
                dynamic_shape: node.dynamic_shape,
                annotation: NodeAnnotation::default(),
            });
        }

        plan.removed.sort_by_key(|id| self.position(*id));
        plan.kept = existing
            .iter()
            .filter_map(|n| self.exchange.node(n.unique_id))
            .collect();
        plan.kept.sort_by_key(|id| self.position(*id));
        plan.internal = self.exchange.internal_tensors().collect();
        plan.deferred_views = self.cluster.deferred_views.clone();
        Ok(plan)
    }

    fn position(&self, node: NodeId) -> usize {
        self.cluster
            .nodes
            .iter()
            .position(|n| *n == node)
            .unwrap_or(usize::MAX)
    }

    /// External tensors must come back with the same role, and every node must produce something.
    fn check_tensors(&self, optimized: &ExchangeGraph) -> Result<(), RejectReason> {
        let declared: HashSet<u32> = optimized.tensors.iter().map(|t| t.unique_id).collect();
        let produced: HashSet<u32> = optimized
            .nodes
            .iter()
            .flat_map(|n| n.output_tensors())
            .collect();

        let consumed: HashSet<u32> = optimized
            .nodes
            .iter()
            .flat_map(|n| n.input_tensors())
            .collect();

        // A declared tensor with no edge left is as good as missing.
        for (tensor, expected) in self.exchange.external_tensors() {
            let is_produced = produced.contains(&tensor.0);
            let is_consumed = consumed.contains(&tensor.0);
            if !declared.contains(&tensor.0) || (!is_produced && !is_consumed) {
                return Err(RejectReason::MissingExternalTensor { tensor });
            }
            let actual = if is_produced {
                Role::Output
            } else {
                Role::Input
            };
            if actual != expected {
                return Err(RejectReason::ExternalRoleMismatch { tensor, expected });
            }
        }

        if produced.is_empty() {
            return Err(RejectReason::NoOutputs(
                "optimized graph declares no outputs".to_string(),
            ));
        }
        if let Some(node) = optimized.nodes.iter().find(|n| n.outputs.is_empty()) {
            return Err(RejectReason::NoOutputs(format!(
                "node {} has no outputs",
                node.name
            )));
        }

        let undeclared = optimized
            .nodes
            .iter()
            .flat_map(|n| n.input_tensors().chain(n.output_tensors()))
            .find(|t| !declared.contains(t));
        if let Some(tensor) = undeclared {
            return Err(RejectReason::InvalidFusedGraph(format!(
                "edge references undeclared tensor {tensor}"
            )));
        }
        Ok(())
    }

    /// Every cluster member is fused into exactly one kernel or returned unchanged.
    fn check_members(
        &self,
        kernels: &[&ExchangeNode],
        existing: &[&ExchangeNode],
    ) -> Result<(), RejectReason> {
        let mut seen: HashMap<u32, usize> = HashMap::new();
        for kernel in kernels {
            if kernel.fused_identifiers.is_empty() {
                return Err(RejectReason::InvalidFusedGraph(format!(
                    "fused node {} lists no original nodes",
                    kernel.name
                )));
            }
            for uid in &kernel.fused_identifiers {
                if !self.exchange.is_member(*uid) {
                    return Err(RejectReason::InvalidFusedGraph(format!(
                        "fused node {} claims unknown node {uid}",
                        kernel.name
                    )));
                }
                *seen.entry(*uid).or_default() += 1;
            }
        }
        for node in existing {
            *seen.entry(node.unique_id).or_default() += 1;
        }
        for member in &self.cluster.nodes {
            match seen.get(&member.0).copied().unwrap_or(0) {
                1 => {}
                0 => {
                    return Err(RejectReason::InvalidFusedGraph(format!(
                        "original node {member:?} is missing"
                    )))
                }
                _ => {
                    return Err(RejectReason::InvalidFusedGraph(format!(
                        "original node {member:?} is used more than once"
                    )))
                }
            }
        }
        Ok(())
    }

    fn external_sections(&self) -> HashMap<u64, SectionKind> {
        self.exchange
            .external_tensors()
            .filter_map(|(tensor, _)| self.graph.tensor(tensor)?.section)
            .map(|binding| (binding.id, binding.kind))
            .collect()
    }

    fn sub_kernels(&self, kernel: &ExchangeNode) -> Result<Vec<String>, RejectReason> {
        match self.module.get_pre_graph(kernel) {
            None => Err(RejectReason::GenericFail(
                "optimizer module has no pre-graph entry point".to_string(),
            )),
            Some(Err(err)) => Err(RejectReason::NoOutputs(format!(
                "pre-graph query for {} failed: {err}",
                kernel.name
            ))),
            Some(Ok(pre)) => Ok(pre.nodes.into_iter().map(|n| n.guid).collect()),
        }
    }
}

/// Maps each new node to the index of the one kernel that lists it.
fn attach_new_nodes(
    kernels: &[&ExchangeNode],
    created: &[&ExchangeNode],
) -> Result<HashMap<u32, usize>, RejectReason> {
    let created_ids: HashSet<u32> = created.iter().map(|n| n.unique_id).collect();
    let mut attached = HashMap::new();
    for (index, kernel) in kernels.iter().enumerate() {
        for uid in &kernel.new_identifiers {
            if !created_ids.contains(uid) {
                return Err(RejectReason::GenericFail(format!(
                    "fused node {} references unknown new node {uid}",
                    kernel.name
                )));
            }
            if attached.insert(*uid, index).is_some() {
                return Err(RejectReason::GenericFail(format!(
                    "new node {uid} is attached to more than one fused node"
                )));
            }
        }
    }
    if let Some(node) = created.iter().find(|n| !attached.contains_key(&n.unique_id)) {
        return Err(RejectReason::InvalidFusedGraph(format!(
            "new node {} is not attached to a fused node",
            node.name
        )));
    }
    Ok(attached)
}

fn remap_section(
    binding: SectionBinding,
    external: &HashMap<u64, SectionKind>,
) -> Result<PlannedSection, RejectReason> {
    if let Some(kind) = external.get(&binding.id) {
        return Ok(PlannedSection::Fixed(SectionBinding {
            kind: *kind,
            ..binding
        }));
    }
    match binding.kind {
        SectionKind::Persistent => Err(RejectReason::GenericFail(format!(
            "optimizer created persistent section {}",
            binding.id
        ))),
        SectionKind::Rmw => Ok(PlannedSection::FreshRmw {
            key: binding.id,
            offset: binding.offset,
        }),
        SectionKind::Workspace => Ok(PlannedSection::Fixed(SectionBinding::workspace(
            binding.offset,
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel(uid: u32, new: &[u32]) -> ExchangeNode {
        let mut node = ExchangeNode::new(uid, "k", "fused_kernel");
        node.fused = true;
        node.new_identifiers = new.to_vec();
        node
    }

    #[test]
    fn new_nodes_attach_to_exactly_one_kernel() {
        let first = kernel(100, &[900]);
        let second = kernel(101, &[]);
        let reshape = ExchangeNode::new(900, "reshape", "reshape");
        let attached =
            attach_new_nodes(&[&first, &second], &[&reshape]).expect("attached adapter");
        assert_eq!(attached.get(&900), Some(&0));

        let twice = kernel(101, &[900]);
        assert!(matches!(
            attach_new_nodes(&[&first, &twice], &[&reshape]),
            Err(RejectReason::GenericFail(_))
        ));
        assert!(matches!(
            attach_new_nodes(&[&second], &[&reshape]),
            Err(RejectReason::InvalidFusedGraph(_))
        ));
    }

    #[test]
    fn sections_of_external_tensors_keep_their_kind() {
        let external = HashMap::from([(5, SectionKind::Persistent)]);
        let rmw_view = SectionBinding {
            kind: SectionKind::Rmw,
            id: 5,
            offset: 64,
        };
        assert_eq!(
            remap_section(rmw_view, &external),
            Ok(PlannedSection::Fixed(SectionBinding::persistent(5, 64)))
        );
        assert_eq!(
            remap_section(SectionBinding::workspace(8), &external),
            Ok(PlannedSection::Fixed(SectionBinding::workspace(8)))
        );
        assert!(matches!(
            remap_section(SectionBinding::persistent(6, 0), &external),
            Err(RejectReason::GenericFail(_))
        ));
    }
}
