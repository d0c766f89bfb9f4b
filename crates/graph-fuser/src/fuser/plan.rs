use smallvec::SmallVec;

use crate::graph::{DType, EngineClass, NodeAnnotation, NodeId, SectionBinding, TensorId};

/// Tensor referenced by a planned node: one already in the graph or one the plan creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorRef {
    Existing(TensorId),
    /// Index into [`ReplacementPlan::tensors`].
    New(usize),
}

/// Memory placement of a tensor created by the optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedSection {
    Fixed(SectionBinding),
    /// A read-modify-write section that still needs an id; equal keys share one section.
    FreshRmw { key: u64, offset: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedTensor {
    pub name: String,
    pub dtype: DType,
    pub shape: SmallVec<[u64; 4]>,
    pub section: Option<PlannedSection>,
}

/// Role of a planned node in the replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedRole {
    /// Fused kernel standing in for several original nodes.
    Kernel,
    /// Node created by the optimizer next to the kernel at the given index in
    /// [`ReplacementPlan::nodes`].
    Adapter { kernel: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedNode {
    pub name: String,
    pub guid: String,
    pub engine: EngineClass,
    pub role: PlannedRole,
    pub inputs: Vec<TensorRef>,
    pub outputs: Vec<TensorRef>,
    pub params: Vec<u8>,
    pub deterministic: bool,
    pub dynamic_shape: bool,
    pub annotation: NodeAnnotation,
}

/// Graph edit produced by an accepted optimization, applied by the splicer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplacementPlan {
    /// Original nodes replaced by kernels, in execution order.
    pub removed: Vec<NodeId>,
    /// Cluster members the optimizer returned unchanged.
    pub kept: Vec<NodeId>,
    pub tensors: Vec<PlannedTensor>,
    pub nodes: Vec<PlannedNode>,
    /// Internal tensors of the cluster, dropped once nothing references them.
    pub internal: Vec<TensorId>,
    /// Views ordered around the cluster with control edges after splicing.
    pub deferred_views: Vec<NodeId>,
}

impl ReplacementPlan {
    /// Returns `true` when applying the plan would not change the graph.
    pub fn is_noop(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Index of the kernel that replaces `original`.
    pub fn kernel_of(&self, original: NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| {
            n.role == PlannedRole::Kernel && n.annotation.fused_from.contains(&original)
        })
    }

    pub fn kernels(&self) -> impl Iterator<Item = &PlannedNode> {
        self.nodes.iter().filter(|n| n.role == PlannedRole::Kernel)
    }
}
