use std::collections::{BTreeMap, BTreeSet, HashMap};

use smallvec::SmallVec;

use super::adapter::{ComplexGroup, GraphAdapter, GraphError};
use super::node::{ControlKind, Node, NodeId};
use super::tensor::{Tensor, TensorId};
use super::topology;

/// In-memory compiled graph with producer/consumer indices.
#[derive(Debug, Clone, Default)]
pub struct CompiledGraph {
    nodes: BTreeMap<NodeId, Node>,
    tensors: BTreeMap<TensorId, Tensor>,
    producers: HashMap<TensorId, NodeId>,
    consumers: HashMap<TensorId, SmallVec<[NodeId; 4]>>,
    control: BTreeMap<(NodeId, NodeId), ControlKind>,
    graph_inputs: BTreeSet<TensorId>,
    graph_outputs: BTreeSet<TensorId>,
    complex_groups: Vec<ComplexGroup>,
    next_node: u32,
    next_tensor: u32,
    next_section: u64,
}

/// First section id handed out for compiler-allocated sections.
const FIRST_ALLOCATED_SECTION: u64 = 1 << 32;

impl CompiledGraph {
    pub fn new() -> Self {
        Self {
            next_section: FIRST_ALLOCATED_SECTION,
            ..Self::default()
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn tensors(&self) -> impl Iterator<Item = &Tensor> {
        self.tensors.values()
    }

    pub fn mark_graph_input(&mut self, tensor: TensorId) -> Result<(), GraphError> {
        self.require_tensor(tensor)?;
        self.graph_inputs.insert(tensor);
        Ok(())
    }

    pub fn mark_graph_output(&mut self, tensor: TensorId) -> Result<(), GraphError> {
        self.require_tensor(tensor)?;
        self.graph_outputs.insert(tensor);
        Ok(())
    }

    pub fn graph_outputs(&self) -> impl Iterator<Item = TensorId> + '_ {
        self.graph_outputs.iter().copied()
    }

    pub fn add_complex_group(&mut self, group: ComplexGroup) {
        self.complex_groups.push(group);
    }

    /// Returns the node named `name`, if any.
    pub fn find_node(&self, name: &str) -> Option<&Node> {
        self.nodes.values().find(|n| n.name == name)
    }

    pub fn find_tensor(&self, name: &str) -> Option<&Tensor> {
        self.tensors.values().find(|t| t.name == name)
    }

    fn require_tensor(&self, tensor: TensorId) -> Result<(), GraphError> {
        if self.tensors.contains_key(&tensor) {
            Ok(())
        } else {
            Err(GraphError::UnknownTensor { tensor })
        }
    }

    fn require_node(&self, node: NodeId) -> Result<(), GraphError> {
        if self.nodes.contains_key(&node) {
            Ok(())
        } else {
            Err(GraphError::UnknownNode { node })
        }
    }
}

impl GraphAdapter for CompiledGraph {
    fn execution_order(&self) -> Result<Vec<NodeId>, GraphError> {
        topology::execution_order(self)
    }

    fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    fn tensor(&self, id: TensorId) -> Option<&Tensor> {
        self.tensors.get(&id)
    }

    fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    fn producer(&self, tensor: TensorId) -> Option<NodeId> {
        self.producers.get(&tensor).copied()
    }

    fn consumers(&self, tensor: TensorId) -> &[NodeId] {
        self.consumers
            .get(&tensor)
            .map(|c| c.as_slice())
            .unwrap_or(&[])
    }

    fn is_graph_input(&self, tensor: TensorId) -> bool {
        self.graph_inputs.contains(&tensor)
    }

    fn is_graph_output(&self, tensor: TensorId) -> bool {
        self.graph_outputs.contains(&tensor)
    }

    fn blocking_nodes(&self, node: NodeId) -> Vec<NodeId> {
        self.control
            .keys()
            .filter(|(_, blocked)| *blocked == node)
            .map(|(blocking, _)| *blocking)
            .collect()
    }

    fn blocked_nodes(&self, node: NodeId) -> Vec<NodeId> {
        self.control
            .range((node, NodeId(0))..=(node, NodeId(u32::MAX)))
            .map(|((_, blocked), _)| *blocked)
            .collect()
    }

    fn control_dependencies(&self) -> Vec<(NodeId, NodeId, ControlKind)> {
        self.control
            .iter()
            .map(|((blocking, blocked), kind)| (*blocking, *blocked, *kind))
            .collect()
    }

    fn complex_groups(&self) -> &[ComplexGroup] {
        &self.complex_groups
    }

    fn allocate_node_id(&mut self) -> NodeId {
        let id = NodeId(self.next_node);
        self.next_node += 1;
        id
    }

    fn allocate_tensor_id(&mut self) -> TensorId {
        let id = TensorId(self.next_tensor);
        self.next_tensor += 1;
        id
    }

    fn allocate_section_id(&mut self) -> u64 {
        let id = self.next_section;
        self.next_section += 1;
        id
    }

    fn add_tensor(&mut self, tensor: Tensor) -> Result<(), GraphError> {
        if self.tensors.contains_key(&tensor.id) {
            return Err(GraphError::DuplicateTensor { tensor: tensor.id });
        }
        self.next_tensor = self.next_tensor.max(tensor.id.0 + 1);
        self.tensors.insert(tensor.id, tensor);
        Ok(())
    }

    fn remove_tensor(&mut self, tensor: TensorId) -> Result<Tensor, GraphError> {
        if let Some(node) = self.producers.get(&tensor) {
            return Err(GraphError::TensorInUse {
                tensor,
                node: *node,
            });
        }
        if let Some(node) = self.consumers(tensor).first() {
            return Err(GraphError::TensorInUse {
                tensor,
                node: *node,
            });
        }
        let removed = self
            .tensors
            .remove(&tensor)
            .ok_or(GraphError::UnknownTensor { tensor })?;
        self.consumers.remove(&tensor);
        self.graph_inputs.remove(&tensor);
        self.graph_outputs.remove(&tensor);
        Ok(removed)
    }

    fn add_node(&mut self, node: Node) -> Result<(), GraphError> {
        if self.nodes.contains_key(&node.id) {
            return Err(GraphError::DuplicateNode { node: node.id });
        }
        for tensor in node.operands() {
            self.require_tensor(tensor)?;
        }
        for tensor in &node.outputs {
            if let Some(existing) = self.producers.get(tensor) {
                return Err(GraphError::MultipleProducers {
                    tensor: *tensor,
                    existing: *existing,
                    new: node.id,
                });
            }
        }

        for tensor in &node.outputs {
            self.producers.insert(*tensor, node.id);
        }
        for tensor in &node.inputs {
            let users = self.consumers.entry(*tensor).or_default();
            if !users.contains(&node.id) {
                users.push(node.id);
            }
        }
        self.next_node = self.next_node.max(node.id.0 + 1);
        self.nodes.insert(node.id, node);
        Ok(())
    }

    fn remove_node(&mut self, node: NodeId) -> Result<Node, GraphError> {
        let removed = self
            .nodes
            .remove(&node)
            .ok_or(GraphError::UnknownNode { node })?;
        for tensor in &removed.outputs {
            self.producers.remove(tensor);
        }
        for tensor in &removed.inputs {
            if let Some(users) = self.consumers.get_mut(tensor) {
                users.retain(|user| *user != node);
            }
        }
        self.control
            .retain(|(blocking, blocked), _| *blocking != node && *blocked != node);
        Ok(removed)
    }

    fn add_control_dependency(
        &mut self,
        blocking: NodeId,
        blocked: NodeId,
        kind: ControlKind,
    ) -> Result<(), GraphError> {
        self.require_node(blocking)?;
        self.require_node(blocked)?;
        self.control.entry((blocking, blocked)).or_insert(kind);
        Ok(())
    }

    fn remove_control_dependency(
        &mut self,
        blocking: NodeId,
        blocked: NodeId,
    ) -> Result<ControlKind, GraphError> {
        self.control
            .remove(&(blocking, blocked))
            .ok_or(GraphError::UnknownControlDependency { blocking, blocked })
    }
}
