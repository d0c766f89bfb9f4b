//! Graph fusion front end.
//!
//! Loads a JSON graph description, clusters its fusable nodes and, when an optimizer module is
//! given, fuses every cluster and optionally writes the resulting graph back out.
//!
//! ```bash
//! # Show the clusters only
//! graph-fuser --graph model.json
//!
//! # Fuse with a native optimizer and keep the result
//! graph-fuser --graph model.json --module ./libgraph_fuser_optimizer.so --output fused.json
//! ```

mod report;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use graph_fuser::graph::GraphDescription;
use graph_fuser::{FusionConfig, FusionPass, GraphAdapter, SharedModule};
use serde::de::DeserializeOwned;

use report::FusionReport;

#[derive(Parser, Debug)]
#[command(name = "graph-fuser")]
#[command(about = "Cluster and fuse the operators of a compiled graph")]
#[command(version)]
struct Args {
    /// Graph description (JSON)
    #[arg(short, long)]
    graph: PathBuf,

    /// Fusion configuration (JSON); defaults with GRAPH_FUSER_* overrides when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Optimizer shared module; implies --fuse
    #[arg(short, long)]
    module: Option<String>,

    /// Submit clusters to the configured optimizer module
    #[arg(long)]
    fuse: bool,

    /// Override the fan-out budget per cluster
    #[arg(long)]
    max_multi_consumers: Option<u32>,

    /// Write the resulting graph description to this file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("failed to parse {}", path.display()))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let description: GraphDescription = read_json(&args.graph)?;
    let mut graph = description
        .build()
        .with_context(|| format!("invalid graph in {}", args.graph.display()))?;

    let mut config = match &args.config {
        Some(path) => read_json::<FusionConfig>(path)?,
        None => FusionConfig::from_env(),
    };
    if let Some(budget) = args.max_multi_consumers {
        config.max_multi_consumers = budget;
    }
    if let Some(module) = &args.module {
        config.module_name = module.clone();
    }

    let shared = SharedModule::global();
    let (pass, lease) = if args.fuse || args.module.is_some() {
        match FusionPass::load(config.clone(), shared) {
            Ok((pass, lease)) => (pass, Some(lease)),
            Err(err) => {
                tracing::warn!(
                    target: "graph_fuser",
                    "optimizer unavailable, reporting clusters only: {err}"
                );
                (FusionPass::new(config), None)
            }
        }
    } else {
        (FusionPass::new(config), None)
    };

    let nodes_before = graph.node_count();
    let summary = pass.run(&mut graph).context("fusion pass failed")?;
    let report = FusionReport::new(&summary, nodes_before, graph.node_count());

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render());
    }

    if let Some(path) = &args.output {
        let json = serde_json::to_vec_pretty(&GraphDescription::capture(&graph))?;
        fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
        tracing::info!(target: "graph_fuser", "Output: {}", path.display());
    }

    drop(pass);
    drop(lease);
    shared.shutdown();
    Ok(())
}
