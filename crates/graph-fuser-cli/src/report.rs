use std::collections::BTreeMap;
use std::fmt::Write;

use graph_fuser::cluster::Cluster;
use graph_fuser::FusionSummary;
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClusterRow {
    pub id: u32,
    pub nodes: Vec<u32>,
    pub locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complex_origin: Option<u32>,
    pub fanout_nodes: usize,
    pub deferred_views: usize,
}

impl From<&Cluster> for ClusterRow {
    fn from(cluster: &Cluster) -> Self {
        Self {
            id: cluster.id.0,
            nodes: cluster.nodes.iter().map(|n| n.0).collect(),
            locked: cluster.locked,
            complex_origin: cluster.complex_origin,
            fanout_nodes: cluster.fanout_nodes.len(),
            deferred_views: cluster.deferred_views.len(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FusionReport {
    pub nodes_before: usize,
    pub nodes_after: usize,
    pub clusters: Vec<ClusterRow>,
    pub merge_rejections: Vec<String>,
    pub removed_control_edges: usize,
    pub attempted: usize,
    pub fused: usize,
    pub rejected: usize,
    pub statuses: BTreeMap<String, usize>,
}

impl FusionReport {
    pub fn new(summary: &FusionSummary, nodes_before: usize, nodes_after: usize) -> Self {
        let mut statuses = BTreeMap::new();
        for (_, status) in &summary.statuses {
            *statuses.entry(status.to_string()).or_insert(0) += 1;
        }
        Self {
            nodes_before,
            nodes_after,
            clusters: summary.clusters.iter().map(ClusterRow::from).collect(),
            merge_rejections: summary
                .rejections
                .iter()
                .map(|r| format!("{:?} -> {:?}: {}", r.producer, r.consumer, r.reason))
                .collect(),
            removed_control_edges: summary.removed_control_edges,
            attempted: summary.attempted,
            fused: summary.fused,
            rejected: summary.rejected,
            statuses,
        }
    }

    /// Clusters with more than one node.
    pub fn fusable_clusters(&self) -> usize {
        self.clusters.iter().filter(|c| c.nodes.len() > 1).count()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "clusters: {} ({} fusable)",
            self.clusters.len(),
            self.fusable_clusters()
        );
        for cluster in &self.clusters {
            let nodes: Vec<String> = cluster.nodes.iter().map(u32::to_string).collect();
            let _ = write!(out, "  #{:<3} [{}]", cluster.id, nodes.join(", "));
            if cluster.locked {
                match cluster.complex_origin {
                    Some(origin) => {
                        let _ = write!(out, " locked(complex {origin})");
                    }
                    None => out.push_str(" locked"),
                }
            }
            if cluster.deferred_views > 0 {
                let _ = write!(out, " deferred_views={}", cluster.deferred_views);
            }
            out.push('\n');
        }
        if !self.merge_rejections.is_empty() {
            let _ = writeln!(out, "merge rejections: {}", self.merge_rejections.len());
            for line in &self.merge_rejections {
                let _ = writeln!(out, "  {line}");
            }
        }
        if self.removed_control_edges > 0 {
            let _ = writeln!(
                out,
                "redundant control edges removed: {}",
                self.removed_control_edges
            );
        }
        let _ = writeln!(
            out,
            "fusion: attempted={} fused={} rejected={}",
            self.attempted, self.fused, self.rejected
        );
        for (status, count) in &self.statuses {
            let _ = writeln!(out, "  {status}: {count}");
        }
        let _ = writeln!(out, "nodes: {} -> {}", self.nodes_before, self.nodes_after);
        out
    }
}
