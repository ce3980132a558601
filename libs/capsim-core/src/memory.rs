//! Backing memory model for the node region
//!
//! Owns the reserved physical range holding all node slots. Requests are one
//! node wide and node-aligned; each accepted request produces a response a
//! fixed number of ticks later. Never-written slots read as zeroes, which is
//! what a fresh bump-allocated node is expected to contain.

use std::collections::VecDeque;

use tracing::trace;

use crate::node::{Node, NodeId, NODE_COUNT};
use crate::packet::{MemOp, MemPacket};
use crate::port::PacketSink;

/// Simulated backing store behind the controller's mem-side port.
#[derive(Debug)]
pub struct NodeMemory {
    store: Vec<u8>,
    base: u64,
    latency: u64,
    now: u64,
    inflight: VecDeque<(u64, MemPacket)>,
    /// Remaining requests to refuse, for exercising the retry protocol.
    refuse_budget: usize,
    refused: bool,
    pub reads: u64,
    pub writes: u64,
}

impl NodeMemory {
    pub fn new(latency: u64, base: u64) -> NodeMemory {
        NodeMemory {
            store: vec![0; NODE_COUNT as usize * Node::SIZE],
            base,
            latency: latency.max(1),
            now: 0,
            inflight: VecDeque::new(),
            refuse_budget: 0,
            refused: false,
            reads: 0,
            writes: 0,
        }
    }

    /// Base physical address of the owned region.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Refuse the next `n` requests before accepting again.
    pub fn refuse_next(&mut self, n: usize) {
        self.refuse_budget = n;
    }

    /// Whether a refused requester should now be told to resend.
    pub fn take_retry_signal(&mut self) -> bool {
        let signal = self.refused && self.refuse_budget == 0;
        if signal {
            self.refused = false;
        }
        signal
    }

    pub fn is_idle(&self) -> bool {
        self.inflight.is_empty()
    }

    /// Advance time and collect the responses that became due.
    pub fn take_ready(&mut self, now: u64) -> Vec<MemPacket> {
        self.now = now;
        let mut ready = Vec::new();
        while self.inflight.front().is_some_and(|(due, _)| *due <= now) {
            if let Some((_, pkt)) = self.inflight.pop_front() {
                ready.push(pkt);
            }
        }
        ready
    }

    /// Functional read, bypassing timing. Used by the invariant checker.
    pub fn read_node(&self, id: NodeId) -> Node {
        let at = self.offset(id.addr(self.base));
        Node::from_bytes(&self.store[at..at + Node::SIZE])
    }

    /// Functional write, bypassing timing. Used to seed test states.
    pub fn write_node(&mut self, id: NodeId, node: &Node) {
        let at = self.offset(id.addr(self.base));
        self.store[at..at + Node::SIZE].copy_from_slice(&node.to_bytes());
    }

    fn offset(&self, addr: u64) -> usize {
        assert!(
            addr >= self.base
                && addr + Node::SIZE as u64 <= self.base + (NODE_COUNT as u64) * Node::SIZE as u64,
            "access outside the node region: {:#x}",
            addr
        );
        assert!(
            (addr - self.base) % Node::SIZE as u64 == 0,
            "unaligned node access: {:#x}",
            addr
        );
        (addr - self.base) as usize
    }

    fn service(&mut self, pkt: MemPacket) -> MemPacket {
        let at = self.offset(pkt.addr);
        match pkt.op {
            MemOp::Read => {
                self.reads += 1;
                let data = self.store[at..at + Node::SIZE].to_vec();
                trace!("mem read {:#x}", pkt.addr);
                pkt.into_response(data)
            }
            MemOp::Write => {
                self.writes += 1;
                self.store[at..at + Node::SIZE].copy_from_slice(&pkt.data);
                trace!("mem write {:#x}", pkt.addr);
                pkt.into_response(Vec::new())
            }
        }
    }
}

impl PacketSink<MemPacket> for NodeMemory {
    fn try_recv(&mut self, pkt: MemPacket) -> Result<(), MemPacket> {
        if self.refuse_budget > 0 {
            self.refuse_budget -= 1;
            self.refused = true;
            trace!("mem refused {:#x}", pkt.addr);
            return Err(pkt);
        }
        let resp = self.service(pkt);
        self.inflight.push_back((self.now + self.latency, resp));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeState, NODE_BASE_ADDR};

    #[test]
    fn test_write_then_read_round_trip() {
        let mut mem = NodeMemory::new(1, NODE_BASE_ADDR);
        let node = Node {
            state: NodeState::Valid,
            depth: 1,
            counter: 1,
            prev: NodeId::INVALID,
            next: NodeId::INVALID,
        };

        let addr = NodeId(4).addr(mem.base());
        assert!(mem.try_recv(MemPacket::write(addr, &node)).is_ok());
        assert!(mem.try_recv(MemPacket::read(addr)).is_ok());

        let ready = mem.take_ready(1);
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[1].node(), node);
    }

    #[test]
    fn test_latency_delays_responses() {
        let mut mem = NodeMemory::new(3, NODE_BASE_ADDR);
        let addr = NodeId(0).addr(mem.base());
        assert!(mem.try_recv(MemPacket::read(addr)).is_ok());
        assert!(mem.take_ready(1).is_empty());
        assert!(mem.take_ready(2).is_empty());
        assert_eq!(mem.take_ready(3).len(), 1);
    }

    #[test]
    fn test_refusal_and_retry_signal() {
        let mut mem = NodeMemory::new(1, NODE_BASE_ADDR);
        mem.refuse_next(1);

        let pkt = MemPacket::read(NodeId(0).addr(mem.base()));
        let refused = mem.try_recv(pkt);
        assert!(refused.is_err());
        assert!(mem.take_retry_signal());
        assert!(!mem.take_retry_signal());

        assert!(mem.try_recv(refused.unwrap_err()).is_ok());
    }

    #[test]
    fn test_fresh_slots_read_zero() {
        let mem = NodeMemory::new(1, NODE_BASE_ADDR);
        let node = mem.read_node(NodeId(123));
        assert!(!node.state.is_valid());
        assert_eq!(node.depth, 0);
    }

    #[test]
    fn test_relocated_region_serves_its_own_base() {
        let base = 0x2000_0000_0000;
        let mut mem = NodeMemory::new(1, base);
        let node = Node {
            state: NodeState::Valid,
            depth: 1,
            counter: 1,
            prev: NodeId::INVALID,
            next: NodeId::INVALID,
        };
        mem.write_node(NodeId(7), &node);
        assert_eq!(mem.read_node(NodeId(7)), node);

        assert!(mem.try_recv(MemPacket::read(NodeId(7).addr(base))).is_ok());
        assert_eq!(mem.take_ready(1)[0].node(), node);
    }

    #[test]
    #[should_panic(expected = "outside the node region")]
    fn test_out_of_region_access_is_fatal() {
        let mem = NodeMemory::new(1, NODE_BASE_ADDR);
        mem.offset(0x1000);
    }
}
