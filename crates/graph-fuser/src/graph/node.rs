use serde::{Deserialize, Serialize};

use super::tensor::TensorId;

/// Stable identifier of a node in the compiled graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// Hardware engine a node is scheduled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineClass {
    /// Programmable vector engine, the engine whose kernels can be fused.
    #[default]
    Vector,
    /// Matrix-multiply engine.
    Matrix,
    /// Copy/DMA engine.
    Dma,
    /// Runs on the host, never on the device.
    Host,
}

/// Kind of a control dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlKind {
    /// Protects coherent memory access; redundant when a data path already orders the nodes.
    #[default]
    Memory,
    /// Explicit ordering requested by the user or by a previous pass.
    Order,
}

/// Bookkeeping attached to nodes created by the fusion pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAnnotation {
    /// Original nodes a fused kernel replaced.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fused_from: Vec<NodeId>,
    /// Kernel guids of the pre-graph decomposition of a dynamic fused kernel.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_kernels: Vec<String>,
}

/// Unit of computation in the compiled graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    /// Operator kind, e.g. `relu_fwd_f32`.
    pub guid: String,
    #[serde(default)]
    pub engine: EngineClass,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
    /// Zero-cost reinterpretation of existing storage (reshape and friends).
    #[serde(default)]
    pub is_view: bool,
    #[serde(default = "default_true")]
    pub deterministic: bool,
    #[serde(default)]
    pub dynamic_shape: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<u8>,
    #[serde(default)]
    pub annotation: NodeAnnotation,
}

fn default_true() -> bool {
    true
}

impl Node {
    pub fn new(
        id: NodeId,
        name: impl Into<String>,
        guid: impl Into<String>,
        inputs: Vec<TensorId>,
        outputs: Vec<TensorId>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            guid: guid.into(),
            engine: EngineClass::Vector,
            inputs,
            outputs,
            is_view: false,
            deterministic: true,
            dynamic_shape: false,
            params: Vec::new(),
            annotation: NodeAnnotation::default(),
        }
    }

    pub fn with_engine(mut self, engine: EngineClass) -> Self {
        self.engine = engine;
        self
    }

    pub fn as_view(mut self) -> Self {
        self.is_view = true;
        self
    }

    /// Iterates over every tensor the node touches, inputs first.
    pub fn operands(&self) -> impl Iterator<Item = TensorId> + '_ {
        self.inputs.iter().chain(self.outputs.iter()).copied()
    }
}
