//! Fusion pass driver over one compiled graph.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::cluster::{
    Cluster, ClusterConstructor, ClusterError, ClusterId, Clusterable, EngineClassPredicate,
    MergeRejection,
};
use crate::config::FusionConfig;
use crate::fuser::{ClusterFusion, FusionOutcome, Fuser};
use crate::graph::{topology, GraphAdapter, GraphError, Node, NodeId};
use crate::optimizer::{ModuleError, ModuleLease, OptimizerModule, SerializedModule, SharedModule};
use crate::splice::{self, CommitStatus};

#[derive(Debug, Error)]
pub enum FusionError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Module(#[from] ModuleError),
}

/// What one run of the pass did.
#[derive(Debug, Clone, Default)]
pub struct FusionSummary {
    pub clusters: Vec<Cluster>,
    pub rejections: Vec<MergeRejection>,
    pub removed_control_edges: usize,
    /// Clusters submitted to the optimizer.
    pub attempted: usize,
    /// Clusters replaced by fused kernels.
    pub fused: usize,
    /// Clusters left unchanged because of a rejection or failed commit.
    pub rejected: usize,
    pub statuses: Vec<(ClusterId, CommitStatus)>,
}

impl FusionSummary {
    pub fn status_count(&self, status: CommitStatus) -> usize {
        self.statuses.iter().filter(|(_, s)| *s == status).count()
    }
}

pub struct FusionPass {
    config: FusionConfig,
    predicate: Box<dyn Clusterable>,
    module: Option<Arc<dyn OptimizerModule>>,
}

impl FusionPass {
    /// Pass without an optimizer: clusters are computed but never submitted.
    pub fn new(config: FusionConfig) -> Self {
        let predicate = EngineClassPredicate {
            engine: config.fusing_engine,
        };
        Self {
            config,
            predicate: Box::new(predicate),
            module: None,
        }
    }

    /// Pass using the module `config.module_name` from `shared`.
    ///
    /// The returned lease keeps the module loaded; drop it once the pass is no longer needed.
    pub fn load(
        config: FusionConfig,
        shared: &SharedModule,
    ) -> Result<(Self, ModuleLease), FusionError> {
        let lease = shared.acquire(&config.module_name)?;
        let pass = Self::new(config).with_module(lease.module());
        Ok((pass, lease))
    }

    pub fn with_module(mut self, module: Arc<dyn OptimizerModule>) -> Self {
        let module = if self.config.serialize_module_calls {
            Arc::new(SerializedModule::new(module)) as Arc<dyn OptimizerModule>
        } else {
            module
        };
        self.module = Some(module);
        self
    }

    pub fn with_predicate(mut self, predicate: impl Clusterable + 'static) -> Self {
        self.predicate = Box::new(predicate);
        self
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn run<G: GraphAdapter>(&self, graph: &mut G) -> Result<FusionSummary, FusionError> {
        let mut summary = FusionSummary::default();
        if !self.config.enabled {
            info!(target: "graph_fuser", "fusion disabled");
            return Ok(summary);
        }

        if self.config.remove_redundant_control_edges {
            let redundant = topology::redundant_control_edges(graph);
            for (blocking, blocked) in &redundant {
                graph.remove_control_dependency(*blocking, *blocked)?;
            }
            if !redundant.is_empty() {
                debug!(
                    target: "graph_fuser",
                    removed = redundant.len(),
                    "removed redundant control edges"
                );
            }
            summary.removed_control_edges = redundant.len();
        }

        let clustering =
            ClusterConstructor::new(&*graph, &self.config, self.predicate.as_ref())?.compute()?;
        summary.clusters = clustering.clusters().to_vec();
        summary.rejections = clustering.rejections().to_vec();

        let Some(module) = &self.module else {
            info!(
                target: "graph_fuser",
                clusters = clustering.len(),
                "no optimizer module, clusters are not fused"
            );
            return Ok(summary);
        };

        let mut fuser = Fuser::new(Some(Arc::clone(module)));
        for cluster in clustering.clusters().iter().filter(|c| c.len() >= 2) {
            let status = fuse_cluster(graph, &mut fuser, module, cluster, cluster.id, &mut summary);
            if status == CommitStatus::GenericFail && !cluster.deferred_views.is_empty() {
                self.split_view_cycles(graph, &mut fuser, module, cluster, &mut summary)?;
            }
        }

        info!(
            target: "graph_fuser",
            clusters = summary.clusters.len(),
            attempted = summary.attempted,
            fused = summary.fused,
            rejected = summary.rejected,
            "fusion pass done"
        );
        Ok(summary)
    }

    /// Re-clusters the members of a cluster whose deferred views could not be ordered around the
    /// fused result, keeping both sides of every view cycle apart, and fuses the parts.
    fn split_view_cycles<G: GraphAdapter>(
        &self,
        graph: &mut G,
        fuser: &mut Fuser,
        module: &Arc<dyn OptimizerModule>,
        cluster: &Cluster,
        summary: &mut FusionSummary,
    ) -> Result<(), FusionError> {
        let within = Within {
            inner: self.predicate.as_ref(),
            nodes: cluster.nodes.iter().copied().collect(),
        };
        let config = FusionConfig {
            complex_clustering: false,
            ..self.config.clone()
        };
        let split = ClusterConstructor::new(&*graph, &config, &within)?
            .without_view_deferral()
            .compute()?;
        debug!(
            target: "graph_fuser",
            cluster = cluster.id.0,
            parts = split.len(),
            "splitting cluster at its view cycles"
        );
        for part in split.clusters().iter().filter(|c| c.len() >= 2) {
            fuse_cluster(graph, fuser, module, part, cluster.id, summary);
        }
        Ok(())
    }
}

/// Optimizes and commits one cluster, recording the status under `id`.
fn fuse_cluster<G: GraphAdapter>(
    graph: &mut G,
    fuser: &mut Fuser,
    module: &Arc<dyn OptimizerModule>,
    cluster: &Cluster,
    id: ClusterId,
    summary: &mut FusionSummary,
) -> CommitStatus {
    summary.attempted += 1;
    let ClusterFusion { outcome, fused } = fuser.optimize_cluster(&*graph, cluster);
    let status = splice::commit(graph, &outcome);
    if let Some(result) = fused {
        module.release(result);
    }

    let replaced = matches!(&outcome, FusionOutcome::Accepted(plan) if !plan.is_noop());
    if status.is_success() && replaced {
        summary.fused += 1;
    } else if !status.is_success() {
        summary.rejected += 1;
    }
    summary.statuses.push((id, status));
    status
}

/// Restricts another predicate to a fixed node set.
struct Within<'a> {
    inner: &'a dyn Clusterable,
    nodes: HashSet<NodeId>,
}

impl Clusterable for Within<'_> {
    fn can_cluster(&self, graph: &dyn GraphAdapter, node: &Node) -> bool {
        self.nodes.contains(&node.id) && self.inner.can_cluster(graph, node)
    }
}
