//! Scenario file format
//!
//! A scenario is a YAML list of commit-level node operations, optionally
//! annotated with expected results. Operations run to completion one after
//! another, mirroring the serialized controller.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

use capsim_core::{NodeCommand, NodeId, NodeOp, RespPayload};

/// One operation of a scenario.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScenarioOp {
    Allocate {
        /// Parent node id; omit to create a new root.
        parent: Option<u32>,
        /// Expected id of the allocated node.
        expect: Option<u32>,
    },
    Revoke {
        node: u32,
    },
    RcUpdate {
        node: u32,
        delta: i32,
    },
    Query {
        node: u32,
    },
}

impl ScenarioOp {
    pub fn to_node_op(&self) -> NodeOp {
        match *self {
            ScenarioOp::Allocate { parent, .. } => NodeOp::Allocate {
                parent: parent.map(NodeId).unwrap_or(NodeId::INVALID),
            },
            ScenarioOp::Revoke { node } => NodeOp::Revoke { node: NodeId(node) },
            ScenarioOp::RcUpdate { node, delta } => NodeOp::RcUpdate {
                node: NodeId(node),
                delta,
            },
            ScenarioOp::Query { node } => NodeOp::Query { node: NodeId(node) },
        }
    }

    /// Check a completed command against the scenario's expectations.
    pub fn check(&self, done: &NodeCommand) -> Result<()> {
        if let Some(status) = done.error {
            bail!("operation failed: {:?}", status);
        }
        if let ScenarioOp::Allocate {
            expect: Some(want), ..
        } = self
        {
            match done.result {
                Some(RespPayload::NodeId(NodeId(got))) if got == *want => {}
                other => bail!("expected node {}, got {:?}", want, other),
            }
        }
        Ok(())
    }
}

/// A parsed scenario file.
#[derive(Debug, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub ops: Vec<ScenarioOp>,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Scenario> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading scenario {}", path.display()))?;
        let scenario: Scenario = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing scenario {}", path.display()))?;
        Ok(scenario)
    }
}
