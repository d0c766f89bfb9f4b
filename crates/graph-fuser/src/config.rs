use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::env;
use crate::graph::EngineClass;

/// Largest supported number of fan-out nodes in one cluster.
pub const MAX_MULTI_CONSUMERS_IN_CLUSTER: u32 = 10;

/// Budget used when the configured value is out of range.
const FALLBACK_MULTI_CONSUMERS: u32 = 1;

pub const DEFAULT_MODULE_NAME: &str = "libgraph_fuser_optimizer.so";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub enabled: bool,
    pub max_multi_consumers: u32,
    pub module_name: String,
    pub serialize_module_calls: bool,
    pub remove_redundant_control_edges: bool,
    pub complex_clustering: bool,
    /// Engine whose nodes are eligible for clustering.
    pub fusing_engine: EngineClass,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_multi_consumers: MAX_MULTI_CONSUMERS_IN_CLUSTER,
            module_name: DEFAULT_MODULE_NAME.to_string(),
            serialize_module_calls: false,
            remove_redundant_control_edges: true,
            complex_clustering: true,
            fusing_engine: EngineClass::Vector,
        }
    }
}

impl FusionConfig {
    /// Defaults overridden by `GRAPH_FUSER_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(enabled) = env::fuser_enabled() {
            config.enabled = enabled;
        }
        if let Some(max) = env::fuser_max_multi_consumers() {
            config.max_multi_consumers = max;
        }
        if let Some(name) = env::fuser_module_name() {
            config.module_name = name.to_string();
        }
        if let Some(serialize) = env::fuser_serialize_calls() {
            config.serialize_module_calls = serialize;
        }
        config
    }

    /// Fan-out budget actually applied by the cluster constructor.
    ///
    /// Values above [`MAX_MULTI_CONSUMERS_IN_CLUSTER`] are unsupported and fall back to 1.
    pub fn effective_max_multi_consumers(&self) -> u32 {
        if self.max_multi_consumers > MAX_MULTI_CONSUMERS_IN_CLUSTER {
            warn!(
                target: "graph_fuser",
                requested = self.max_multi_consumers,
                "unsupported number of multi consumers in cluster, using {FALLBACK_MULTI_CONSUMERS}"
            );
            FALLBACK_MULTI_CONSUMERS
        } else {
            info!(
                target: "graph_fuser",
                budget = self.max_multi_consumers,
                "max multi consumers in cluster"
            );
            self.max_multi_consumers
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_budget_falls_back_to_one() {
        let config = FusionConfig {
            max_multi_consumers: 11,
            ..FusionConfig::default()
        };
        assert_eq!(config.effective_max_multi_consumers(), 1);
        let config = FusionConfig {
            max_multi_consumers: 10,
            ..FusionConfig::default()
        };
        assert_eq!(config.effective_max_multi_consumers(), 10);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: FusionConfig =
            serde_json::from_str(r#"{"max_multi_consumers": 2}"#).expect("parse config");
        assert_eq!(config.max_multi_consumers, 2);
        assert!(config.enabled);
        assert_eq!(config.module_name, DEFAULT_MODULE_NAME);
    }
}
