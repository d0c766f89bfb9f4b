use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::adapter::{ComplexGroup, GraphAdapter, GraphError};
use super::compiled::CompiledGraph;
use super::node::{ControlKind, EngineClass, Node, NodeId};
use super::tensor::{DType, SectionBinding, Tensor, TensorId};

/// Default tensor shape used by [`GraphBuilder::tensor`]: 16 f32 elements, 64 bytes.
const DEFAULT_SHAPE: [u64; 1] = [16];

/// Name-based helper for assembling a [`CompiledGraph`].
///
/// Tensors are referenced by name; nodes are added in call order and receive increasing ids.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    tensors: Vec<Tensor>,
    by_name: HashMap<String, TensorId>,
    nodes: Vec<Node>,
    control: Vec<(NodeId, NodeId, ControlKind)>,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    complex: Vec<ComplexGroup>,
    unknown: Vec<String>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares an f32 tensor of 16 elements.
    pub fn tensor(&mut self, name: &str) -> TensorId {
        self.tensor_with(name, DType::F32, &DEFAULT_SHAPE)
    }

    pub fn tensor_with(&mut self, name: &str, dtype: DType, shape: &[u64]) -> TensorId {
        if let Some(id) = self.by_name.get(name) {
            return *id;
        }
        let id = TensorId(self.tensors.len() as u32);
        self.tensors.push(Tensor::new(id, name, dtype, shape));
        self.by_name.insert(name.to_string(), id);
        id
    }

    /// Declares a default-shaped tensor bound to a persistent section.
    pub fn persistent(&mut self, name: &str, section: u64, offset: u64) -> TensorId {
        let id = self.tensor(name);
        self.bind(name, SectionBinding::persistent(section, offset));
        id
    }

    pub fn bind(&mut self, name: &str, binding: SectionBinding) {
        match self.by_name.get(name) {
            Some(id) => self.tensors[id.0 as usize].section = Some(binding),
            None => self.unknown.push(name.to_string()),
        }
    }

    pub fn alias(&mut self, name: &str, target: &str) {
        match (self.by_name.get(name), self.by_name.get(target)) {
            (Some(id), Some(target)) => self.tensors[id.0 as usize].alias_of = Some(*target),
            _ => self.unknown.push(format!("{name} -> {target}")),
        }
    }

    /// Adds a vector-engine node.
    pub fn node(&mut self, name: &str, guid: &str, inputs: &[&str], outputs: &[&str]) -> NodeId {
        self.node_on(EngineClass::Vector, name, guid, inputs, outputs)
    }

    pub fn node_on(
        &mut self,
        engine: EngineClass,
        name: &str,
        guid: &str,
        inputs: &[&str],
        outputs: &[&str],
    ) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        let inputs = self.resolve(inputs);
        let outputs = self.resolve(outputs);
        self.nodes
            .push(Node::new(id, name, guid, inputs, outputs).with_engine(engine));
        id
    }

    /// Adds a zero-cost view node (reshape-like) that does not run on the fusing engine.
    pub fn view(&mut self, name: &str, inputs: &[&str], outputs: &[&str]) -> NodeId {
        let id = self.node_on(EngineClass::Host, name, "reshape", inputs, outputs);
        self.nodes[id.0 as usize].is_view = true;
        id
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0 as usize)
    }

    pub fn control(&mut self, blocking: NodeId, blocked: NodeId, kind: ControlKind) {
        self.control.push((blocking, blocked, kind));
    }

    /// Marks `name` as a graph input, declaring it if needed.
    pub fn input(&mut self, name: &str) {
        let id = self.tensor(name);
        self.inputs.push(id);
    }

    /// Marks `name` as a graph output, declaring it if needed.
    pub fn output(&mut self, name: &str) {
        let id = self.tensor(name);
        self.outputs.push(id);
    }

    pub fn complex_group(&mut self, id: u32, nodes: &[NodeId]) {
        self.complex.push(ComplexGroup {
            id,
            nodes: nodes.to_vec(),
        });
    }

    fn resolve(&mut self, names: &[&str]) -> Vec<TensorId> {
        names.iter().map(|name| self.tensor(name)).collect()
    }

    pub fn finish(self) -> Result<CompiledGraph, GraphError> {
        if let Some(name) = self.unknown.into_iter().next() {
            return Err(GraphError::UnknownTensorName { name });
        }
        let description = GraphDescription {
            inputs: self.inputs,
            outputs: self.outputs,
            tensors: self.tensors,
            nodes: self.nodes,
            control: self
                .control
                .into_iter()
                .map(|(blocking, blocked, kind)| ControlEdge {
                    blocking,
                    blocked,
                    kind,
                })
                .collect(),
            complex_groups: self.complex,
        };
        description.build()
    }
}

/// Serializable control dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlEdge {
    pub blocking: NodeId,
    pub blocked: NodeId,
    #[serde(default)]
    pub kind: ControlKind,
}

/// Serializable snapshot of a compiled graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphDescription {
    pub tensors: Vec<Tensor>,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub control: Vec<ControlEdge>,
    #[serde(default)]
    pub inputs: Vec<TensorId>,
    #[serde(default)]
    pub outputs: Vec<TensorId>,
    #[serde(default)]
    pub complex_groups: Vec<ComplexGroup>,
}

impl GraphDescription {
    pub fn build(self) -> Result<CompiledGraph, GraphError> {
        let mut graph = CompiledGraph::new();
        for tensor in self.tensors {
            graph.add_tensor(tensor)?;
        }
        for node in self.nodes {
            graph.add_node(node)?;
        }
        for edge in self.control {
            graph.add_control_dependency(edge.blocking, edge.blocked, edge.kind)?;
        }
        for tensor in self.inputs {
            graph.mark_graph_input(tensor)?;
        }
        for tensor in self.outputs {
            graph.mark_graph_output(tensor)?;
        }
        for group in self.complex_groups {
            graph.add_complex_group(group);
        }
        Ok(graph)
    }

    /// Captures the current state of `graph`.
    pub fn capture(graph: &CompiledGraph) -> Self {
        Self {
            tensors: graph.tensors().cloned().collect(),
            nodes: graph.nodes().cloned().collect(),
            control: graph
                .control_dependencies()
                .into_iter()
                .map(|(blocking, blocked, kind)| ControlEdge {
                    blocking,
                    blocked,
                    kind,
                })
                .collect(),
            inputs: graph
                .tensors()
                .filter(|t| graph.is_graph_input(t.id))
                .map(|t| t.id)
                .collect(),
            outputs: graph.graph_outputs().collect(),
            complex_groups: graph.complex_groups().to_vec(),
        }
    }
}
