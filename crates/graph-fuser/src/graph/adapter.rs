use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

use super::node::{ControlKind, Node, NodeId};
use super::tensor::{Tensor, TensorId};

/// Nodes produced by expanding one composite node into primitives before fusion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplexGroup {
    /// Identity of the composite node the group was extracted from.
    pub id: u32,
    pub nodes: Vec<NodeId>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("node {node:?} does not exist")]
    UnknownNode { node: NodeId },
    #[error("tensor {tensor:?} does not exist")]
    UnknownTensor { tensor: TensorId },
    #[error("no tensor is named `{name}`")]
    UnknownTensorName { name: String },
    #[error("node {node:?} is already part of the graph")]
    DuplicateNode { node: NodeId },
    #[error("tensor {tensor:?} is already part of the graph")]
    DuplicateTensor { tensor: TensorId },
    #[error("tensor {tensor:?} is produced by {existing:?}, cannot add second producer {new:?}")]
    MultipleProducers {
        tensor: TensorId,
        existing: NodeId,
        new: NodeId,
    },
    #[error("tensor {tensor:?} is still referenced by node {node:?}")]
    TensorInUse { tensor: TensorId, node: NodeId },
    #[error("control dependency {blocking:?} -> {blocked:?} does not exist")]
    UnknownControlDependency { blocking: NodeId, blocked: NodeId },
    #[error("graph contains a cycle through {remaining} node(s)")]
    Cycle { remaining: usize },
}

/// View of the compiled graph consumed and edited by the fusion pass.
///
/// Read accessors never allocate ids; all edits go through the `add_*`/`remove_*` methods so an
/// implementation can keep its producer/consumer indices consistent.
pub trait GraphAdapter {
    /// Nodes in a valid execution order (a topological order over data and control edges).
    fn execution_order(&self) -> Result<Vec<NodeId>, GraphError>;
    fn node(&self, id: NodeId) -> Option<&Node>;
    fn tensor(&self, id: TensorId) -> Option<&Tensor>;
    fn node_ids(&self) -> Vec<NodeId>;
    fn producer(&self, tensor: TensorId) -> Option<NodeId>;
    /// Distinct consumer nodes of `tensor`.
    fn consumers(&self, tensor: TensorId) -> &[NodeId];
    fn is_graph_input(&self, tensor: TensorId) -> bool;
    fn is_graph_output(&self, tensor: TensorId) -> bool;
    /// Nodes that must run before `node`.
    fn blocking_nodes(&self, node: NodeId) -> Vec<NodeId>;
    /// Nodes that must run after `node`.
    fn blocked_nodes(&self, node: NodeId) -> Vec<NodeId>;
    fn control_dependencies(&self) -> Vec<(NodeId, NodeId, ControlKind)>;
    fn complex_groups(&self) -> &[ComplexGroup];

    fn allocate_node_id(&mut self) -> NodeId;
    fn allocate_tensor_id(&mut self) -> TensorId;
    /// Fresh id for a compiler-allocated memory section.
    fn allocate_section_id(&mut self) -> u64;
    fn add_tensor(&mut self, tensor: Tensor) -> Result<(), GraphError>;
    /// Removes a tensor that no node references anymore.
    fn remove_tensor(&mut self, tensor: TensorId) -> Result<Tensor, GraphError>;
    fn add_node(&mut self, node: Node) -> Result<(), GraphError>;
    /// Removes a node together with every control dependency touching it.
    fn remove_node(&mut self, node: NodeId) -> Result<Node, GraphError>;
    fn add_control_dependency(
        &mut self,
        blocking: NodeId,
        blocked: NodeId,
        kind: ControlKind,
    ) -> Result<(), GraphError>;
    fn remove_control_dependency(
        &mut self,
        blocking: NodeId,
        blocked: NodeId,
    ) -> Result<ControlKind, GraphError>;

    /// Distinct data successors of `node`, in output order.
    fn successors(&self, node: NodeId) -> SmallVec<[NodeId; 4]> {
        let mut out: SmallVec<[NodeId; 4]> = SmallVec::new();
        if let Some(n) = self.node(node) {
            for tensor in &n.outputs {
                for consumer in self.consumers(*tensor) {
                    if !out.contains(consumer) {
                        out.push(*consumer);
                    }
                }
            }
        }
        out
    }

    /// Distinct data predecessors of `node`, in input order.
    fn predecessors(&self, node: NodeId) -> SmallVec<[NodeId; 4]> {
        let mut out: SmallVec<[NodeId; 4]> = SmallVec::new();
        if let Some(n) = self.node(node) {
            for tensor in &n.inputs {
                if let Some(producer) = self.producer(*tensor) {
                    if !out.contains(&producer) {
                        out.push(producer);
                    }
                }
            }
        }
        out
    }

    fn node_count(&self) -> usize {
        self.node_ids().len()
    }
}
