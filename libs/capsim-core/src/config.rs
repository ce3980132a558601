//! Model configuration

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;
use crate::node::NODE_BASE_ADDR;

/// Tunable parameters of the simulated subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    /// Number of hardware threads, each with its own NCQ unit.
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Capacity of each per-thread node command queue.
    #[serde(default = "default_ncq_depth")]
    pub ncq_depth: usize,

    /// Backing-memory latency in ticks.
    #[serde(default = "default_mem_latency")]
    pub mem_latency: u64,

    /// Base physical address of the node region.
    #[serde(default = "default_node_base_addr")]
    pub node_base_addr: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            ncq_depth: default_ncq_depth(),
            mem_latency: default_mem_latency(),
            node_base_addr: default_node_base_addr(),
        }
    }
}

fn default_threads() -> usize {
    1
}

fn default_ncq_depth() -> usize {
    32
}

fn default_mem_latency() -> u64 {
    1
}

fn default_node_base_addr() -> u64 {
    NODE_BASE_ADDR
}

impl SimConfig {
    /// Load configuration from a YAML file, falling back to defaults when
    /// the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = serde_yaml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }
}
