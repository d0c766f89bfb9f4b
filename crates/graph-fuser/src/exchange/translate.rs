use std::collections::{BTreeMap, HashSet};

use tracing::trace;

use crate::cluster::{persistent_range, Role};
use crate::graph::{GraphAdapter, GraphError, NodeId, TensorId};

use super::{ExchangeEdge, ExchangeGraph, ExchangeNode, ExchangeTensor};

/// Position of a tensor relative to the cluster boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorClass {
    /// Produced and consumed only by cluster members.
    Internal,
    /// Visible outside the cluster; the role says which side of the boundary produces it.
    External(Role),
}

impl TensorClass {
    pub fn is_external(self) -> bool {
        matches!(self, TensorClass::External(_))
    }
}

/// Exchange graph of one cluster plus the lookup tables back into the compiled graph.
#[derive(Debug, Clone)]
pub struct ClusterExchange {
    graph: ExchangeGraph,
    nodes: BTreeMap<u32, NodeId>,
    tensors: BTreeMap<u32, (TensorId, TensorClass)>,
}

impl ClusterExchange {
    /// Translates `members` (in execution order) into an exchange graph.
    pub fn build<G: GraphAdapter + ?Sized>(
        graph: &G,
        members: &[NodeId],
    ) -> Result<Self, GraphError> {
        let member_set: HashSet<NodeId> = members.iter().copied().collect();
        let mut exchange = ExchangeGraph::default();
        let mut nodes = BTreeMap::new();
        let mut tensors: BTreeMap<u32, (TensorId, TensorClass)> = BTreeMap::new();

        for id in members {
            let node = graph.node(*id).ok_or(GraphError::UnknownNode { node: *id })?;
            for tensor in node.operands() {
                if tensors.contains_key(&tensor.0) {
                    continue;
                }
                let class = classify(graph, &member_set, tensor);
                let t = graph
                    .tensor(tensor)
                    .ok_or(GraphError::UnknownTensor { tensor })?;
                exchange.tensors.push(ExchangeTensor {
                    unique_id: tensor.0,
                    name: t.name.clone(),
                    dtype: t.dtype,
                    shape: t.shape.clone(),
                    section: t.section,
                    external: class.is_external(),
                });
                tensors.insert(tensor.0, (tensor, class));
            }

            let inputs = node
                .inputs
                .iter()
                .map(|t| ExchangeEdge {
                    tensor: t.0,
                    target: graph
                        .producer(*t)
                        .filter(|p| member_set.contains(p))
                        .map(|p| p.0),
                })
                .collect();
            let outputs = node.outputs.iter().map(|t| ExchangeEdge::new(t.0)).collect();
            let control_edges_to_node = graph
                .blocking_nodes(*id)
                .into_iter()
                .filter(|n| member_set.contains(n))
                .map(|n| n.0)
                .collect();

            exchange.nodes.push(ExchangeNode {
                inputs,
                outputs,
                params: node.params.clone(),
                control_edges_to_node,
                deterministic: node.deterministic,
                dynamic_shape: node.dynamic_shape,
                ..ExchangeNode::new(id.0, node.name.clone(), node.guid.clone())
            });
            nodes.insert(id.0, *id);
        }

        trace!(
            target: "graph_fuser",
            nodes = exchange.nodes.len(),
            tensors = exchange.tensors.len(),
            "built exchange graph"
        );
        Ok(Self {
            graph: exchange,
            nodes,
            tensors,
        })
    }

    pub fn graph(&self) -> &ExchangeGraph {
        &self.graph
    }

    /// Compiled-graph node behind an exchange node id, for cluster members only.
    pub fn node(&self, unique_id: u32) -> Option<NodeId> {
        self.nodes.get(&unique_id).copied()
    }

    pub fn is_member(&self, unique_id: u32) -> bool {
        self.nodes.contains_key(&unique_id)
    }

    pub fn members(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.values().copied()
    }

    pub fn tensor(&self, unique_id: u32) -> Option<(TensorId, TensorClass)> {
        self.tensors.get(&unique_id).copied()
    }

    pub fn external_tensors(&self) -> impl Iterator<Item = (TensorId, Role)> + '_ {
        self.tensors.values().filter_map(|(id, class)| match class {
            TensorClass::External(role) => Some((*id, *role)),
            TensorClass::Internal => None,
        })
    }

    pub fn internal_tensors(&self) -> impl Iterator<Item = TensorId> + '_ {
        self.tensors
            .values()
            .filter(|(_, class)| *class == TensorClass::Internal)
            .map(|(id, _)| *id)
    }
}

/// Boundary classification of a tensor touched by the cluster.
///
/// Tensors produced outside the cluster (or by nobody) are external inputs. Tensors produced
/// inside are external outputs when anything outside can observe them: a consumer outside the
/// cluster, no consumer at all, a graph input/output marking, or persistent storage.
fn classify<G: GraphAdapter + ?Sized>(
    graph: &G,
    members: &HashSet<NodeId>,
    tensor: TensorId,
) -> TensorClass {
    let produced_inside = graph
        .producer(tensor)
        .is_some_and(|p| members.contains(&p));
    if !produced_inside {
        return TensorClass::External(Role::Input);
    }
    let consumers = graph.consumers(tensor);
    let visible = graph.is_graph_input(tensor)
        || graph.is_graph_output(tensor)
        || consumers.is_empty()
        || consumers.iter().any(|c| !members.contains(c))
        || persistent_range(graph, tensor).is_some();
    if visible {
        TensorClass::External(Role::Output)
    } else {
        TensorClass::Internal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;

    #[test]
    fn chain_tensors_are_classified() {
        let mut b = GraphBuilder::new();
        b.input("x");
        let relu = b.node("relu", "relu_f32", &["x"], &["a"]);
        let neg = b.node("neg", "neg_f32", &["a"], &["b"]);
        b.node("exp", "exp_f32", &["b"], &["y"]);
        b.output("y");
        let graph = b.finish().expect("graph");

        let exchange = ClusterExchange::build(&graph, &[relu, neg]).expect("exchange");
        let x = graph.find_tensor("x").expect("x").id;
        let a = graph.find_tensor("a").expect("a").id;
        let bt = graph.find_tensor("b").expect("b").id;

        let mut external: Vec<_> = exchange.external_tensors().collect();
        external.sort();
        assert_eq!(external, vec![(x, Role::Input), (bt, Role::Output)]);
        assert_eq!(exchange.internal_tensors().collect::<Vec<_>>(), vec![a]);

        let neg_node = exchange.graph().node(neg.0).expect("neg node");
        assert_eq!(neg_node.inputs[0].target, Some(relu.0));
        assert!(exchange.graph().tensor(a.0).is_some_and(|t| !t.external));
    }

    #[test]
    fn persistent_intermediate_stays_external() {
        let mut b = GraphBuilder::new();
        b.input("x");
        b.persistent("a", 3, 0);
        let relu = b.node("relu", "relu_f32", &["x"], &["a"]);
        let neg = b.node("neg", "neg_f32", &["a"], &["y"]);
        b.output("y");
        let graph = b.finish().expect("graph");

        let exchange = ClusterExchange::build(&graph, &[relu, neg]).expect("exchange");
        let a = graph.find_tensor("a").expect("a").id;
        assert_eq!(
            exchange.tensor(a.0),
            Some((a, TensorClass::External(Role::Output)))
        );
        assert_eq!(exchange.internal_tensors().count(), 0);
    }
}
