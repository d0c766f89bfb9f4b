//! Operator fusion for accelerator graph compilers.
//!
//! The pass partitions the fusable nodes of a compiled graph into clusters ([`cluster`]), hands
//! each cluster to an external optimizer as an [`exchange`] graph ([`fuser`], [`optimizer`]) and
//! splices accepted results back into the graph ([`splice`]). [`FusionPass`] runs the whole
//! pipeline.

pub mod cluster;
pub mod config;
mod env;
pub mod exchange;
pub mod fuser;
pub mod graph;
pub mod optimizer;
pub mod pass;
pub mod splice;

pub use cluster::{Cluster, ClusterConstructor, ClusterError, ClusterId, Clustering};
pub use config::FusionConfig;
pub use fuser::{FusionOutcome, Fuser, RejectReason, ReplacementPlan};
pub use graph::{CompiledGraph, GraphAdapter, GraphBuilder, GraphError, NodeId, TensorId};
pub use optimizer::{FnOptimizerModule, ModuleError, OptimizerModule, SharedModule};
pub use pass::{FusionError, FusionPass, FusionSummary};
pub use splice::{commit, CommitStatus};
