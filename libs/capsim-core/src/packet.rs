//! Packets exchanged between the pipeline, the node controller and memory
//!
//! Two packet families exist: node command packets travelling from the NCQ
//! to the controller's cpu-side port, and single-node read/write packets the
//! controller issues against backing memory. Every packet carries a unique
//! id; responses are matched to issuers by that id.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::CapFault;
use crate::inst::ThreadId;
use crate::node::{Node, NodeId};

/// Global packet id counter. Ids are never reused within a simulation.
static NEXT_PACKET_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of an in-flight packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketId(u64);

impl PacketId {
    /// Allocate a fresh id.
    pub fn fresh() -> PacketId {
        PacketId(NEXT_PACKET_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Memory operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemOp {
    Read,
    Write,
}

/// A memory-side packet carrying exactly one encoded node.
#[derive(Debug, Clone)]
pub struct MemPacket {
    pub id: PacketId,
    pub op: MemOp,
    pub addr: u64,
    /// Write payload on requests, read payload on responses.
    pub data: Vec<u8>,
    pub is_resp: bool,
}

impl MemPacket {
    /// Build a node load request.
    pub fn read(addr: u64) -> MemPacket {
        MemPacket {
            id: PacketId::fresh(),
            op: MemOp::Read,
            addr,
            data: Vec::new(),
            is_resp: false,
        }
    }

    /// Build a node store request.
    pub fn write(addr: u64, node: &Node) -> MemPacket {
        MemPacket {
            id: PacketId::fresh(),
            op: MemOp::Write,
            addr,
            data: node.to_bytes().to_vec(),
            is_resp: false,
        }
    }

    /// Turn this request into its response, replacing the payload.
    pub fn into_response(mut self, data: Vec<u8>) -> MemPacket {
        debug_assert!(!self.is_resp);
        self.is_resp = true;
        self.data = data;
        self
    }

    /// Decode the node payload carried by this packet.
    pub fn node(&self) -> Node {
        Node::from_bytes(&self.data)
    }
}

/// Node command request payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOp {
    /// Read one node record.
    Query { node: NodeId },
    /// Splice a new node behind `parent` (INVALID parent creates a new root).
    Allocate { parent: NodeId },
    /// Invalidate `node` and its whole descendant subtree.
    Revoke { node: NodeId },
    /// Adjust the reference count of `node` by `delta`.
    RcUpdate { node: NodeId, delta: i32 },
}

impl NodeOp {
    pub fn is_query(&self) -> bool {
        matches!(self, NodeOp::Query { .. })
    }

    pub fn is_rc_update(&self) -> bool {
        matches!(self, NodeOp::RcUpdate { .. })
    }

    /// The node this operation names, for diagnostics and fault reporting.
    pub fn target(&self) -> NodeId {
        match *self {
            NodeOp::Query { node } => node,
            NodeOp::Allocate { parent } => parent,
            NodeOp::Revoke { node } => node,
            NodeOp::RcUpdate { node, .. } => node,
        }
    }
}

/// A command packet on its way to the node controller.
#[derive(Debug, Clone)]
pub struct CommandPacket {
    pub id: PacketId,
    pub thread: ThreadId,
    pub op: NodeOp,
}

impl CommandPacket {
    pub fn new(thread: ThreadId, op: NodeOp) -> CommandPacket {
        CommandPacket {
            id: PacketId::fresh(),
            thread,
            op,
        }
    }
}

/// Completion status carried by a command response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespStatus {
    Ok,
    CounterUnderflow,
    AlreadyFreed,
    StaleRoot,
    BadDepth,
}

impl RespStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, RespStatus::Ok)
    }

    /// Map an error status onto the architectural fault it raises.
    pub fn fault(self, node: NodeId) -> Option<CapFault> {
        match self {
            RespStatus::Ok => None,
            RespStatus::CounterUnderflow => Some(CapFault::CounterUnderflow(node)),
            RespStatus::AlreadyFreed => Some(CapFault::AlreadyFreed(node)),
            RespStatus::StaleRoot => Some(CapFault::StaleRoot(node)),
            RespStatus::BadDepth => Some(CapFault::BadDepth(node)),
        }
    }
}

/// Response payloads, per command variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespPayload {
    /// Query result: the node record.
    Node(Node),
    /// Allocate result: the newly allocated id.
    NodeId(NodeId),
    /// Revoke and RcUpdate carry no payload.
    Empty,
}

/// A command response returning to the issuing NCQ.
#[derive(Debug, Clone)]
pub struct RespPacket {
    pub id: PacketId,
    pub thread: ThreadId,
    pub status: RespStatus,
    pub payload: RespPayload,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeState, NODE_BASE_ADDR};

    #[test]
    fn test_packet_ids_are_unique() {
        let a = PacketId::fresh();
        let b = PacketId::fresh();
        assert_ne!(a, b);
    }

    #[test]
    fn test_mem_packet_carries_node() {
        let node = Node {
            state: NodeState::Valid,
            depth: 2,
            counter: 1,
            prev: NodeId::INVALID,
            next: NodeId(5),
        };
        let addr = NodeId(5).addr(NODE_BASE_ADDR);
        let pkt = MemPacket::write(addr, &node);
        assert_eq!(pkt.node(), node);

        let req = MemPacket::read(addr);
        let resp = req.into_response(node.to_bytes().to_vec());
        assert!(resp.is_resp);
        assert_eq!(resp.node(), node);
    }

    #[test]
    fn test_error_status_maps_to_fault() {
        assert!(RespStatus::Ok.fault(NodeId(1)).is_none());
        assert!(matches!(
            RespStatus::AlreadyFreed.fault(NodeId(1)),
            Some(CapFault::AlreadyFreed(NodeId(1)))
        ));
    }
}
