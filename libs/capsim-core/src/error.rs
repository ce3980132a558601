//! Fault and error types

use thiserror::Error;

use crate::node::NodeId;

/// Capability fault surfaced by a node command.
///
/// These are precise architectural faults: the pipeline translates them into
/// a trap on the offending instruction at commit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CapFault {
    /// A reference-count update would drive the counter below zero.
    #[error("reference count underflow on node {0}")]
    CounterUnderflow(NodeId),

    /// A reference-count update targeted a node already on the free list.
    #[error("node {0} is already freed")]
    AlreadyFreed(NodeId),

    /// Revocation targeted a node that is no longer valid.
    #[error("revocation root {0} is stale")]
    StaleRoot(NodeId),

    /// Revocation targeted a node that was never initialized.
    #[error("node {0} carries an inconsistent depth")]
    BadDepth(NodeId),
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
}
