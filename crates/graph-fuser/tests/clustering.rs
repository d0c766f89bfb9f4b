use graph_fuser::cluster::{EngineClassPredicate, MergeReject};
use graph_fuser::graph::{ControlKind, DType, EngineClass, SectionBinding};
use graph_fuser::{
    ClusterConstructor, ClusterError, Clustering, CompiledGraph, FusionConfig, GraphBuilder,
    NodeId,
};

fn clusters_with(
    graph: &CompiledGraph,
    config: &FusionConfig,
) -> Result<Clustering, ClusterError> {
    ClusterConstructor::new(graph, config, &EngineClassPredicate::default())?.compute()
}

fn clusters(graph: &CompiledGraph, budget: u32) -> Clustering {
    let config = FusionConfig {
        max_multi_consumers: budget,
        ..FusionConfig::default()
    };
    clusters_with(graph, &config).expect("clustering")
}

fn same_cluster(clustering: &Clustering, a: NodeId, b: NodeId) -> bool {
    match (clustering.cluster_of(a), clustering.cluster_of(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// relu1 feeds relu2 and relu3; relu2 feeds relu4 and relu5.
fn two_fanouts() -> (CompiledGraph, Vec<NodeId>) {
    let mut b = GraphBuilder::new();
    b.input("in1");
    let relu1 = b.node("relu1", "relu_fwd_f32", &["in1"], &["out1"]);
    let relu2 = b.node("relu2", "relu_fwd_f32", &["out1"], &["out2"]);
    let relu3 = b.node("relu3", "relu_fwd_f32", &["out1"], &["out3"]);
    let relu4 = b.node("relu4", "relu_fwd_f32", &["out2"], &["out4"]);
    let relu5 = b.node("relu5", "relu_fwd_f32", &["out2"], &["out5"]);
    let graph = b.finish().expect("graph");
    (graph, vec![relu1, relu2, relu3, relu4, relu5])
}

#[test]
fn single_fanout_within_budget_is_one_cluster() {
    let mut b = GraphBuilder::new();
    b.input("in1");
    b.node("relu1", "relu_fwd_f32", &["in1"], &["out1"]);
    b.node("relu2", "relu_fwd_f32", &["out1"], &["out2"]);
    b.node("relu3", "relu_fwd_f32", &["out1"], &["out3"]);
    let graph = b.finish().expect("graph");

    let clustering = clusters(&graph, 1);
    assert_eq!(clustering.len(), 1);
    assert_eq!(clustering.clusters()[0].len(), 3);
    assert_eq!(clustering.clusters()[0].fanout_nodes.len(), 1);
}

#[test]
fn two_fanouts_fit_a_budget_of_two() {
    let (graph, _) = two_fanouts();
    let clustering = clusters(&graph, 2);
    assert_eq!(clustering.len(), 1);
    assert_eq!(clustering.clusters()[0].len(), 5);
}

#[test]
fn oversized_budget_falls_back_to_one_fanout() {
    let (graph, nodes) = two_fanouts();
    let clustering = clusters(&graph, 11);
    assert_eq!(clustering.len(), 2);
    assert!(same_cluster(&clustering, nodes[0], nodes[2]));
    assert!(same_cluster(&clustering, nodes[1], nodes[3]));
    assert!(same_cluster(&clustering, nodes[1], nodes[4]));
    assert!(!same_cluster(&clustering, nodes[0], nodes[1]));
    assert!(clustering.rejections().iter().any(|r| matches!(
        r.reason,
        MergeReject::FanOutBudget { count: 2, budget: 1 }
    )));
}

/// Three fan-out nodes: relu1 feeds relu2 and relu3, and both of those fan out again.
#[test]
fn three_fanouts_split_under_a_budget_of_two() {
    let mut b = GraphBuilder::new();
    b.input("in1");
    let relu1 = b.node("relu1", "relu_fwd_f32", &["in1"], &["out1"]);
    let relu2 = b.node("relu2", "relu_fwd_f32", &["out1"], &["out2"]);
    let relu3 = b.node("relu3", "relu_fwd_f32", &["out1"], &["out3"]);
    b.node("relu4", "relu_fwd_f32", &["out2"], &["out4"]);
    b.node("relu5", "relu_fwd_f32", &["out2"], &["out5"]);
    let relu6 = b.node("relu6", "relu_fwd_f32", &["out3"], &["out6"]);
    b.node("relu7", "relu_fwd_f32", &["out3"], &["out7"]);
    let graph = b.finish().expect("graph");

    let clustering = clusters(&graph, 2);
    assert_eq!(clustering.len(), 2);
    assert!(same_cluster(&clustering, relu1, relu2));
    assert!(same_cluster(&clustering, relu3, relu6));
    assert!(!same_cluster(&clustering, relu1, relu3));
    for cluster in clustering.clusters() {
        assert!(cluster.fanout_nodes.len() <= 2);
    }
}

/// Disjoint chains below one root hold a single fan-out node, so any budget of at least one keeps
/// them together; only further fan-out below the root splits a cluster.
#[test]
fn three_chains_from_one_fanout_fit_a_budget_of_two() {
    let mut b = GraphBuilder::new();
    b.input("in1");
    let root = b.node("root", "relu_fwd_f32", &["in1"], &["r"]);
    for chain in ["a", "b", "c"] {
        let mid = format!("{chain}_mid");
        let out = format!("{chain}_out");
        b.node(&format!("{chain}1"), "relu_fwd_f32", &["r"], &[mid.as_str()]);
        b.node(&format!("{chain}2"), "neg_fwd_f32", &[mid.as_str()], &[out.as_str()]);
    }
    let graph = b.finish().expect("graph");

    let clustering = clusters(&graph, 2);
    assert_eq!(clustering.len(), 1);
    let cluster = &clustering.clusters()[0];
    assert_eq!(cluster.len(), 7);
    assert_eq!(cluster.fanout_nodes, vec![root]);
}

#[test]
fn node_with_two_outputs_counts_as_fanout() {
    let mut b = GraphBuilder::new();
    b.input("in1");
    let relu1 = b.node("relu1", "relu_fwd_f32", &["in1"], &["out1"]);
    b.node("relu2", "relu_fwd_f32", &["out1"], &["out2"]);
    let relu3 = b.node("relu3", "relu_fwd_f32", &["out2"], &["out3"]);
    let split = b.node("split", "split_fwd_f32", &["out3"], &["out4", "out5"]);
    let relu5 = b.node("relu5", "relu_fwd_f32", &["out4"], &["out6"]);
    let relu6 = b.node("relu6", "relu_fwd_f32", &["out5"], &["out7"]);
    let graph = b.finish().expect("graph");

    let clustering = clusters(&graph, 10);
    assert_eq!(clustering.len(), 1);
    let cluster = &clustering.clusters()[0];
    assert_eq!(cluster.fanout_nodes, vec![split]);
    for node in [relu1, relu3, relu5, relu6] {
        assert!(cluster.contains(node));
    }
}

#[test]
fn external_inputs_do_not_split_clusters() {
    let mut b = GraphBuilder::new();
    b.input("in1");
    b.input("in2");
    b.input("in3");
    let relu1 = b.node("relu1", "relu_fwd_f32", &["in1"], &["out1"]);
    let add = b.node("add", "add_fwd_f32", &["out1", "in2"], &["out2"]);
    let mul = b.node("mul", "mult_fwd_f32", &["out2", "in3"], &["out3"]);
    b.output("out3");
    let graph = b.finish().expect("graph");

    let clustering = clusters(&graph, 10);
    assert_eq!(clustering.len(), 1);
    assert!(same_cluster(&clustering, relu1, add));
    assert!(same_cluster(&clustering, add, mul));
}

#[test]
fn duplicate_persistent_outputs_stay_apart() {
    let mut b = GraphBuilder::new();
    b.input("x");
    let producer = b.node("relu", "relu_fwd_f32", &["x"], &["t"]);
    let first = b.node("neg", "neg_fwd_f32", &["t"], &["o1"]);
    let second = b.node("abs", "abs_fwd_f32", &["t"], &["o2"]);
    b.bind("o1", SectionBinding::persistent(1, 0));
    b.bind("o2", SectionBinding::persistent(1, 0));
    b.output("o1");
    b.output("o2");
    let graph = b.finish().expect("graph");

    let clustering = clusters(&graph, 10);
    assert_eq!(clustering.len(), 2);
    assert!(same_cluster(&clustering, producer, first));
    assert!(!same_cluster(&clustering, first, second));
    let rejection = clustering
        .rejections()
        .iter()
        .find(|r| r.consumer == second)
        .expect("second consumer rejected");
    match &rejection.reason {
        MergeReject::PersistentOverlap(conflict) => {
            assert!(conflict.exact);
            assert!(conflict.same_role);
        }
        other => panic!("unexpected rejection {other}"),
    }
}

#[test]
fn in_place_chain_is_one_cluster() {
    let mut b = GraphBuilder::new();
    b.persistent("in", 1, 0);
    b.input("in");
    b.node("a", "relu_fwd_f32", &["in"], &["t1"]);
    b.node("b", "neg_fwd_f32", &["t1"], &["t2"]);
    b.node("c", "exp_fwd_f32", &["t2"], &["t3"]);
    b.node("d", "abs_fwd_f32", &["t3"], &["out"]);
    b.bind("out", SectionBinding::persistent(1, 0));
    b.output("out");
    let graph = b.finish().expect("graph");

    let clustering = clusters(&graph, 10);
    assert_eq!(clustering.len(), 1);
    assert_eq!(clustering.clusters()[0].len(), 4);
}

#[test]
fn partial_input_output_overlap_rejects_merge() {
    let mut b = GraphBuilder::new();
    b.persistent("in", 1, 0);
    b.input("in");
    let a = b.node("a", "relu_fwd_f32", &["in"], &["t1"]);
    let c = b.node("b", "neg_fwd_f32", &["t1"], &["out"]);
    // 64-byte tensors, shifted by half their size.
    b.bind("out", SectionBinding::persistent(1, 32));
    b.output("out");
    let graph = b.finish().expect("graph");

    let clustering = clusters(&graph, 10);
    assert_eq!(clustering.len(), 2);
    assert!(!same_cluster(&clustering, a, c));
}

#[test]
fn alias_of_persistent_tensor_joins_the_footprint() {
    let mut b = GraphBuilder::new();
    b.persistent("in", 1, 0);
    b.input("in");
    let a = b.node("a", "relu_fwd_f32", &["in"], &["t1"]);
    let c = b.node("b", "neg_fwd_f32", &["t1"], &["view_out"]);
    b.persistent("out", 1, 32);
    b.alias("view_out", "out");
    let graph = b.finish().expect("graph");

    let clustering = clusters(&graph, 10);
    assert!(!same_cluster(&clustering, a, c));
}

#[test]
fn cycle_through_real_node_is_rejected() {
    let mut b = GraphBuilder::new();
    b.input("in1");
    let relu1 = b.node("relu1", "relu_fwd_f32", &["in1"], &["out1"]);
    let relu3 = b.node("relu3", "relu_fwd_f32", &["out1"], &["out3"]);
    let host = b.node_on(EngineClass::Host, "copy", "memcpy", &["out3"], &["copy"]);
    let relu2 = b.node("relu2", "add_fwd_f32", &["out3", "copy"], &["out2"]);
    b.output("out2");
    let graph = b.finish().expect("graph");

    let clustering = clusters(&graph, 10);
    assert_eq!(clustering.len(), 2);
    assert!(same_cluster(&clustering, relu1, relu3));
    assert!(!same_cluster(&clustering, relu3, relu2));
    assert!(clustering
        .rejections()
        .iter()
        .any(|r| r.reason == MergeReject::Cycle { through: host }));
    assert!(clustering.is_contracted_acyclic(&graph));
}

#[test]
fn cycle_through_view_is_deferred() {
    let mut b = GraphBuilder::new();
    b.input("in1");
    let relu1 = b.node("relu1", "relu_fwd_f32", &["in1"], &["out1"]);
    let relu3 = b.node("relu3", "relu_fwd_f32", &["out1"], &["out3"]);
    let flatten = b.view("flatten", &["out3"], &["flat"]);
    let relu2 = b.node("relu2", "add_fwd_f32", &["out3", "flat"], &["out2"]);
    b.output("out2");
    let graph = b.finish().expect("graph");

    let clustering = clusters(&graph, 10);
    assert_eq!(clustering.len(), 1);
    let cluster = &clustering.clusters()[0];
    assert_eq!(cluster.nodes, vec![relu1, relu3, relu2]);
    assert_eq!(cluster.deferred_views, vec![flatten]);
    assert!(clustering.is_contracted_acyclic(&graph));
}

#[test]
fn view_cycle_without_deferral_keeps_both_sides_apart() {
    let mut b = GraphBuilder::new();
    b.input("in1");
    let relu1 = b.node("relu1", "relu_fwd_f32", &["in1"], &["out1"]);
    let relu3 = b.node("relu3", "relu_fwd_f32", &["out1"], &["out3"]);
    let flatten = b.view("flatten", &["out3"], &["flat"]);
    let relu2 = b.node("relu2", "add_fwd_f32", &["out3", "flat"], &["out2"]);
    b.output("out2");
    let graph = b.finish().expect("graph");

    let predicate = EngineClassPredicate::default();
    let clustering = ClusterConstructor::new(&graph, &FusionConfig::default(), &predicate)
        .expect("constructor")
        .without_view_deferral()
        .compute()
        .expect("clustering");
    assert_eq!(clustering.len(), 2);
    assert!(same_cluster(&clustering, relu1, relu3));
    assert!(!same_cluster(&clustering, relu3, relu2));
    assert!(clustering
        .clusters()
        .iter()
        .all(|c| c.deferred_views.is_empty()));
    assert!(clustering
        .rejections()
        .iter()
        .any(|r| r.reason == MergeReject::Cycle { through: flatten }));
}

#[test]
fn inner_cycle_between_members_stays_one_cluster() {
    let mut b = GraphBuilder::new();
    b.input("in1");
    b.node("relu1", "relu_fwd_f32", &["in1"], &["out1"]);
    b.node("relu3", "relu_fwd_f32", &["out1"], &["out3"]);
    b.node("relu4", "relu_fwd_f32", &["out3"], &["out4"]);
    b.node("relu2", "add_fwd_f32", &["out3", "out4"], &["out2"]);
    let graph = b.finish().expect("graph");

    let clustering = clusters(&graph, 2);
    assert_eq!(clustering.len(), 1);
    assert!(clustering.clusters()[0].deferred_views.is_empty());
}

#[test]
fn views_are_not_clustered() {
    let mut b = GraphBuilder::new();
    b.input("in1");
    let relu1 = b.node("relu1", "relu_fwd_f32", &["in1"], &["out1"]);
    let reshape = b.view("reshape", &["out1"], &["r"]);
    let relu2 = b.node("relu2", "relu_fwd_f32", &["r"], &["out2"]);
    let graph = b.finish().expect("graph");

    let clustering = clusters(&graph, 10);
    assert_eq!(clustering.len(), 2);
    assert_eq!(clustering.cluster_of(reshape), None);
    assert!(!same_cluster(&clustering, relu1, relu2));
}

#[test]
fn workspace_output_blocks_merge() {
    let mut b = GraphBuilder::new();
    b.input("x");
    let a = b.node("a", "relu_fwd_f32", &["x"], &["scratch"]);
    let c = b.node("b", "neg_fwd_f32", &["scratch"], &["y"]);
    b.bind("scratch", SectionBinding::workspace(0));
    let graph = b.finish().expect("graph");

    let clustering = clusters(&graph, 10);
    assert!(!same_cluster(&clustering, a, c));
    assert_eq!(clustering.rejections()[0].reason, MergeReject::WorkspaceOutput);
}

#[test]
fn control_dependency_from_host_node_does_not_block() {
    let mut b = GraphBuilder::new();
    b.input("x");
    b.input("z");
    let host = b.node_on(EngineClass::Host, "h", "memcpy", &["z"], &["w"]);
    let a = b.node("a", "relu_fwd_f32", &["x"], &["t"]);
    let c = b.node("b", "neg_fwd_f32", &["t"], &["y"]);
    b.control(host, c, ControlKind::Order);
    let graph = b.finish().expect("graph");

    let clustering = clusters(&graph, 10);
    assert!(same_cluster(&clustering, a, c));
}

#[test]
fn wide_operands_are_not_eligible() {
    let mut b = GraphBuilder::new();
    b.input("x");
    b.tensor_with("idx", DType::I64, &[16]);
    let a = b.node("a", "relu_fwd_f32", &["x"], &["t"]);
    let c = b.node("gather", "gather_fwd_f32", &["t", "idx"], &["y"]);
    let graph = b.finish().expect("graph");

    let clustering = clusters(&graph, 10);
    assert_eq!(clustering.cluster_of(c), None);
    assert!(clustering.cluster_of(a).is_some());
}

#[test]
fn complex_group_becomes_a_locked_cluster() {
    let mut b = GraphBuilder::new();
    b.input("x");
    let a = b.node("softmax_max", "reduce_max_f32", &["x"], &["m"]);
    let c = b.node("softmax_sub", "sub_fwd_f32", &["x", "m"], &["s"]);
    let tail = b.node("relu", "relu_fwd_f32", &["s"], &["y"]);
    b.complex_group(7, &[a, c]);
    let graph = b.finish().expect("graph");

    let clustering = clusters(&graph, 10);
    assert_eq!(clustering.len(), 2);
    let locked = clustering
        .cluster(clustering.cluster_of(a).expect("clustered"))
        .expect("cluster");
    assert!(locked.locked);
    assert_eq!(locked.complex_origin, Some(7));
    assert_eq!(locked.nodes, vec![a, c]);
    assert!(!same_cluster(&clustering, c, tail));
    assert!(clustering
        .rejections()
        .iter()
        .any(|r| r.consumer == tail && r.reason == MergeReject::Locked));
}

#[test]
fn complex_clustering_can_be_disabled() {
    let mut b = GraphBuilder::new();
    b.input("x");
    let a = b.node("softmax_max", "reduce_max_f32", &["x"], &["m"]);
    let c = b.node("softmax_sub", "sub_fwd_f32", &["x", "m"], &["s"]);
    b.node("relu", "relu_fwd_f32", &["s"], &["y"]);
    b.complex_group(7, &[a, c]);
    let graph = b.finish().expect("graph");

    let config = FusionConfig {
        complex_clustering: false,
        ..FusionConfig::default()
    };
    let clustering = clusters_with(&graph, &config).expect("clustering");
    assert_eq!(clustering.len(), 1);
    assert!(!clustering.clusters()[0].locked);
}

#[test]
fn disconnected_complex_group_is_an_error() {
    let mut b = GraphBuilder::new();
    b.input("x");
    b.input("y");
    let a = b.node("a", "relu_fwd_f32", &["x"], &["a_out"]);
    let c = b.node("b", "relu_fwd_f32", &["y"], &["b_out"]);
    b.complex_group(3, &[a, c]);
    let graph = b.finish().expect("graph");

    let err = clusters_with(&graph, &FusionConfig::default()).expect_err("disconnected");
    assert_eq!(err, ClusterError::ComplexDisconnected { id: 3 });
    assert_eq!(
        err.to_string(),
        "Cluster from complex guid Id 3 is not connected"
    );
}

#[test]
fn overlapping_complex_group_is_an_error() {
    let mut b = GraphBuilder::new();
    b.input("x");
    let a = b.node("a", "relu_fwd_f32", &["x"], &["t"]);
    let c = b.node("b", "neg_fwd_f32", &["t"], &["o"]);
    b.bind("t", SectionBinding::persistent(2, 0));
    b.bind("o", SectionBinding::persistent(2, 16));
    b.complex_group(4, &[a, c]);
    let graph = b.finish().expect("graph");

    let err = clusters_with(&graph, &FusionConfig::default()).expect_err("overlap");
    assert_eq!(err, ClusterError::ComplexOverlap { id: 4 });
    assert_eq!(
        err.to_string(),
        "Cluster from complex guid Id 4 has overlapping persistent tensors"
    );
}
