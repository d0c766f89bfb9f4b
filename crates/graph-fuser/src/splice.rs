//! Graph splicer: applies an accepted [`ReplacementPlan`] to the compiled graph.
//!
//! Every edit is recorded in an undo journal. When any step fails, or the edited graph no longer
//! has a valid execution order, the journal is replayed backwards and the graph is left exactly as
//! it was before the commit.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use tracing::{debug, error, info, warn};

use crate::fuser::{FusionOutcome, PlannedSection, ReplacementPlan, TensorRef};
use crate::graph::{
    ControlKind, GraphAdapter, GraphError, Node, NodeId, SectionBinding, SectionKind, Tensor,
    TensorId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommitStatus {
    Success,
    /// External tensor set mismatch; the original cluster is unchanged.
    InvalidFusedGraph,
    /// The optimized graph had no outputs; the original cluster is unchanged.
    NoOutputs,
    /// Any other validation or translation failure; the original cluster is unchanged.
    GenericFail,
}

impl CommitStatus {
    pub fn is_success(self) -> bool {
        self == CommitStatus::Success
    }
}

impl fmt::Display for CommitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommitStatus::Success => "success",
            CommitStatus::InvalidFusedGraph => "invalid-fused-graph",
            CommitStatus::NoOutputs => "no-outputs",
            CommitStatus::GenericFail => "generic-fail",
        };
        f.write_str(name)
    }
}

/// Applies `outcome` to `graph`. Rejected outcomes leave the graph untouched.
pub fn commit<G: GraphAdapter + ?Sized>(graph: &mut G, outcome: &FusionOutcome) -> CommitStatus {
    let plan = match outcome {
        FusionOutcome::Rejected(reason) => {
            let status = reason.status();
            debug!(target: "graph_fuser", %status, %reason, "commit skipped");
            return status;
        }
        FusionOutcome::Accepted(plan) => plan,
    };
    if plan.is_noop() {
        debug!(target: "graph_fuser", "optimizer kept the cluster unchanged");
        return CommitStatus::Success;
    }

    let view_edges = match deferred_view_edges(graph, plan) {
        Ok(edges) => edges,
        Err(view) => {
            warn!(
                target: "graph_fuser",
                ?view,
                "view is both produced and consumed by the same fused node"
            );
            return CommitStatus::GenericFail;
        }
    };

    let mut splice = Splice {
        journal: Vec::new(),
    };
    match splice.apply(graph, plan, &view_edges) {
        Ok(fused) => {
            info!(
                target: "graph_fuser",
                replaced = plan.removed.len(),
                inserted = fused.len(),
                "fused cluster committed"
            );
            CommitStatus::Success
        }
        Err(err) => {
            warn!(target: "graph_fuser", error = %err, "commit failed, restoring cluster");
            splice.rollback(graph);
            CommitStatus::GenericFail
        }
    }
}

/// Node that takes over one side of an edge after splicing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
enum Replacement {
    Planned(usize),
    Kept(NodeId),
}

fn replacement_of(plan: &ReplacementPlan, original: NodeId) -> Option<Replacement> {
    if let Some(index) = plan.kernel_of(original) {
        return Some(Replacement::Planned(index));
    }
    plan.kept
        .contains(&original)
        .then_some(Replacement::Kept(original))
}

/// Ordering edges `(before, after)` that keep deferred views between their fused neighbours.
///
/// Fails with the offending view when one replacement node sits on both sides of it.
fn deferred_view_edges<G: GraphAdapter + ?Sized>(
    graph: &G,
    plan: &ReplacementPlan,
) -> Result<Vec<(Endpoint, Endpoint)>, NodeId> {
    let mut edges = Vec::new();
    for view in &plan.deferred_views {
        let mut before: BTreeSet<Replacement> = BTreeSet::new();
        for node in graph
            .predecessors(*view)
            .into_iter()
            .chain(graph.blocking_nodes(*view))
        {
            before.extend(replacement_of(plan, node));
        }
        let mut after: BTreeSet<Replacement> = BTreeSet::new();
        for node in graph
            .successors(*view)
            .into_iter()
            .chain(graph.blocked_nodes(*view))
        {
            after.extend(replacement_of(plan, node));
        }
        if before.intersection(&after).next().is_some() {
            return Err(*view);
        }
        edges.extend(
            before
                .into_iter()
                .map(|r| (Endpoint::Replacement(r), Endpoint::Node(*view))),
        );
        edges.extend(
            after
                .into_iter()
                .map(|r| (Endpoint::Node(*view), Endpoint::Replacement(r))),
        );
    }
    Ok(edges)
}

#[derive(Debug, Clone, Copy)]
enum Endpoint {
    Node(NodeId),
    Replacement(Replacement),
}

#[derive(Debug)]
enum Edit {
    AddedTensor(TensorId),
    RemovedTensor(Tensor),
    AddedNode(NodeId),
    RemovedNode(Node),
    AddedControl(NodeId, NodeId),
    RemovedControl(NodeId, NodeId, ControlKind),
}

struct Splice {
    journal: Vec<Edit>,
}

impl Splice {
    /// Returns the ids of the inserted nodes.
    fn apply<G: GraphAdapter + ?Sized>(
        &mut self,
        graph: &mut G,
        plan: &ReplacementPlan,
        view_edges: &[(Endpoint, Endpoint)],
    ) -> Result<Vec<NodeId>, GraphError> {
        let new_tensors = self.add_tensors(graph, plan)?;

        let removed: HashSet<NodeId> = plan.removed.iter().copied().collect();
        let control: Vec<(NodeId, NodeId, ControlKind)> = graph
            .control_dependencies()
            .into_iter()
            .filter(|(blocking, blocked, _)| removed.contains(blocking) || removed.contains(blocked))
            .collect();
        for (blocking, blocked, kind) in &control {
            self.journal
                .push(Edit::RemovedControl(*blocking, *blocked, *kind));
        }
        for id in &plan.removed {
            let node = graph.remove_node(*id)?;
            self.journal.push(Edit::RemovedNode(node));
        }

        let mut inserted = Vec::with_capacity(plan.nodes.len());
        for planned in &plan.nodes {
            let id = graph.allocate_node_id();
            let resolve = |r: &TensorRef| match r {
                TensorRef::Existing(id) => *id,
                TensorRef::New(index) => new_tensors[*index],
            };
            let mut node = Node::new(
                id,
                planned.name.clone(),
                planned.guid.clone(),
                planned.inputs.iter().map(resolve).collect(),
                planned.outputs.iter().map(resolve).collect(),
            )
            .with_engine(planned.engine);
            node.params = planned.params.clone();
            node.deterministic = planned.deterministic;
            node.dynamic_shape = planned.dynamic_shape;
            node.annotation = planned.annotation.clone();
            graph.add_node(node)?;
            self.journal.push(Edit::AddedNode(id));
            inserted.push(id);
        }

        let kernel_node = |original: NodeId| -> NodeId {
            match plan.kernel_of(original) {
                Some(index) => inserted[index],
                None => original,
            }
        };
        for (blocking, blocked, kind) in control {
            let (blocking, blocked) = (kernel_node(blocking), kernel_node(blocked));
            if blocking != blocked {
                self.add_control(graph, blocking, blocked, kind)?;
            }
        }

        let endpoint = |e: Endpoint| -> NodeId {
            match e {
                Endpoint::Node(id) | Endpoint::Replacement(Replacement::Kept(id)) => id,
                Endpoint::Replacement(Replacement::Planned(index)) => inserted[index],
            }
        };
        for (before, after) in view_edges {
            self.add_control(graph, endpoint(*before), endpoint(*after), ControlKind::Order)?;
        }

        for tensor in &plan.internal {
            let orphaned = graph.producer(*tensor).is_none() && graph.consumers(*tensor).is_empty();
            if orphaned {
                let removed = graph.remove_tensor(*tensor)?;
                self.journal.push(Edit::RemovedTensor(removed));
            }
        }

        graph.execution_order()?;
        Ok(inserted)
    }

    fn add_tensors<G: GraphAdapter + ?Sized>(
        &mut self,
        graph: &mut G,
        plan: &ReplacementPlan,
    ) -> Result<Vec<TensorId>, GraphError> {
        let mut fresh_sections: HashMap<u64, u64> = HashMap::new();
        let mut ids = Vec::with_capacity(plan.tensors.len());
        for planned in &plan.tensors {
            let id = graph.allocate_tensor_id();
            let mut tensor = Tensor::new(id, planned.name.clone(), planned.dtype, &planned.shape);
            tensor.section = planned.section.map(|section| match section {
                PlannedSection::Fixed(binding) => binding,
                PlannedSection::FreshRmw { key, offset } => SectionBinding {
                    kind: SectionKind::Rmw,
                    id: *fresh_sections
                        .entry(key)
                        .or_insert_with(|| graph.allocate_section_id()),
                    offset,
                },
            });
            graph.add_tensor(tensor)?;
            self.journal.push(Edit::AddedTensor(id));
            ids.push(id);
        }
        Ok(ids)
    }

    fn add_control<G: GraphAdapter + ?Sized>(
        &mut self,
        graph: &mut G,
        blocking: NodeId,
        blocked: NodeId,
        kind: ControlKind,
    ) -> Result<(), GraphError> {
        if graph.blocked_nodes(blocking).contains(&blocked) {
            return Ok(());
        }
        graph.add_control_dependency(blocking, blocked, kind)?;
        self.journal.push(Edit::AddedControl(blocking, blocked));
        Ok(())
    }

    fn rollback<G: GraphAdapter + ?Sized>(self, graph: &mut G) {
        for edit in self.journal.into_iter().rev() {
            let result = match edit {
                Edit::AddedTensor(id) => graph.remove_tensor(id).map(drop),
                Edit::RemovedTensor(tensor) => graph.add_tensor(tensor),
                Edit::AddedNode(id) => graph.remove_node(id).map(drop),
                Edit::RemovedNode(node) => graph.add_node(node),
                Edit::AddedControl(blocking, blocked) => {
                    graph.remove_control_dependency(blocking, blocked).map(drop)
                }
                Edit::RemovedControl(blocking, blocked, kind) => {
                    graph.add_control_dependency(blocking, blocked, kind)
                }
            };
            if let Err(err) = result {
                error!(target: "graph_fuser", error = %err, "rollback step failed");
            }
        }
    }
}
