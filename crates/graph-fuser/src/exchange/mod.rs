//! Neutral graph representation handed across the optimizer boundary.
//!
//! Exchange graphs are plain serde data. Identities are the integer ids of the compiled graph, and
//! the lookup from an exchange id back to the compiled graph lives in [`ClusterExchange`], which the
//! fuser owns for the duration of one optimization.

mod translate;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::graph::{DType, SectionBinding};

pub use translate::{ClusterExchange, TensorClass};

/// One tensor reference of an exchange node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeEdge {
    pub tensor: u32,
    /// Producing exchange node of an input edge, when the producer is part of the same graph.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<u32>,
}

impl ExchangeEdge {
    pub fn new(tensor: u32) -> Self {
        Self {
            tensor,
            target: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeNode {
    pub unique_id: u32,
    pub name: String,
    pub guid: String,
    /// Set on kernels synthesized by the optimizer from several original nodes.
    #[serde(default)]
    pub fused: bool,
    #[serde(default)]
    pub inputs: Vec<ExchangeEdge>,
    #[serde(default)]
    pub outputs: Vec<ExchangeEdge>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<u8>,
    /// Exchange nodes that must run before this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub control_edges_to_node: Vec<u32>,
    /// Original nodes a fused kernel replaces.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fused_identifiers: Vec<u32>,
    /// Nodes the optimizer created around a fused kernel.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub new_identifiers: Vec<u32>,
    #[serde(default = "default_true")]
    pub deterministic: bool,
    #[serde(default)]
    pub dynamic_shape: bool,
}

fn default_true() -> bool {
    true
}

impl ExchangeNode {
    pub fn new(unique_id: u32, name: impl Into<String>, guid: impl Into<String>) -> Self {
        Self {
            unique_id,
            name: name.into(),
            guid: guid.into(),
            fused: false,
            inputs: Vec::new(),
            outputs: Vec::new(),
            params: Vec::new(),
            control_edges_to_node: Vec::new(),
            fused_identifiers: Vec::new(),
            new_identifiers: Vec::new(),
            deterministic: true,
            dynamic_shape: false,
        }
    }

    pub fn input_tensors(&self) -> impl Iterator<Item = u32> + '_ {
        self.inputs.iter().map(|e| e.tensor)
    }

    pub fn output_tensors(&self) -> impl Iterator<Item = u32> + '_ {
        self.outputs.iter().map(|e| e.tensor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeTensor {
    pub unique_id: u32,
    pub name: String,
    pub dtype: DType,
    pub shape: SmallVec<[u64; 4]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<SectionBinding>,
    /// Crosses the cluster boundary, so it must survive optimization unchanged.
    #[serde(default)]
    pub external: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeGraph {
    pub nodes: Vec<ExchangeNode>,
    pub tensors: Vec<ExchangeTensor>,
}

impl ExchangeGraph {
    pub fn node(&self, unique_id: u32) -> Option<&ExchangeNode> {
        self.nodes.iter().find(|n| n.unique_id == unique_id)
    }

    pub fn tensor(&self, unique_id: u32) -> Option<&ExchangeTensor> {
        self.tensors.iter().find(|t| t.unique_id == unique_id)
    }

    /// Exchange node producing `tensor`, if any.
    pub fn producer_of(&self, tensor: u32) -> Option<&ExchangeNode> {
        self.nodes
            .iter()
            .find(|n| n.outputs.iter().any(|e| e.tensor == tensor))
    }

    pub fn is_consumed(&self, tensor: u32) -> bool {
        self.nodes
            .iter()
            .any(|n| n.inputs.iter().any(|e| e.tensor == tensor))
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphBuilder, NodeId};

    #[test]
    fn cluster_graph_survives_the_json_boundary() {
        let mut b = GraphBuilder::new();
        b.input("in1");
        b.input("in2");
        let add1 = b.node("add1", "add_fwd_f32", &["in1", "in2"], &["out1"]);
        let add2 = b.node("add2", "add_fwd_f32", &["in2", "out1"], &["out2"]);
        b.output("out2");
        let graph = b.finish().expect("graph");

        let exchange = ClusterExchange::build(&graph, &[add1, add2]).expect("exchange");
        let bytes = exchange.graph().to_json().expect("encode");
        let text = String::from_utf8(bytes.clone()).expect("utf8");
        assert!(text.contains("\"unique_id\""));
        assert!(!text.contains("fused_identifiers"));

        let decoded = ExchangeGraph::from_json(&bytes).expect("decode");
        assert_eq!(&decoded, exchange.graph());
        let out1 = graph.find_tensor("out1").expect("out1").id.0;
        assert_eq!(
            decoded.producer_of(out1).map(|n| NodeId(n.unique_id)),
            Some(add1)
        );
        assert!(decoded.is_consumed(out1));
        let edge = decoded
            .node(add2.0)
            .and_then(|n| n.inputs.iter().find(|e| e.tensor == out1))
            .expect("add2 reads out1");
        assert_eq!(edge.target, Some(add1.0));
    }

    #[test]
    fn missing_optional_fields_take_defaults() {
        let node: ExchangeNode =
            serde_json::from_str(r#"{"unique_id": 4, "name": "k", "guid": "relu_fwd_f32"}"#)
                .expect("decode");
        assert!(node.deterministic);
        assert!(!node.fused);
        assert!(node.inputs.is_empty());
    }
}
