//! # Node Controller
//!
//! Memory-mapped coprocessor owning the global revocation-node pool. It
//! services one command at a time: a command packet accepted on the cpu-side
//! port is turned into a state machine that issues loads and stores against
//! backing memory, and the original packet is answered once the machine
//! finishes. A second request arriving while one is active is refused and
//! the requester is told to retry after the active command drains.
//!
//! The controller also hosts two auxiliary services consumed by the
//! pipeline: the capability-location map and the debug object-range table.

mod ops;

use tracing::{debug, trace};

use crate::captrack::{AddrRange, CapLoc, CapTrackMap, ObjectTable};
use crate::inst::ThreadId;
use crate::memory::NodeMemory;
use crate::node::{Node, NodeId, NODE_BASE_ADDR};
use crate::packet::{CommandPacket, MemPacket, NodeOp, PacketId, RespPacket};
use crate::port::{PacketSink, RequestPort, ResponsePort};
use crate::stats::ControllerStats;

use ops::ControllerCommand;

/// The command currently owning the controller.
#[derive(Debug)]
struct ActiveCommand {
    pkt_id: PacketId,
    thread: ThreadId,
    cmd: ControllerCommand,
}

/// The revocation-node pool controller.
#[derive(Debug)]
pub struct NodeController {
    current: Option<ActiveCommand>,

    /// Base physical address of the node region this controller owns.
    base: u64,

    // Pool registers. Only commands mutate these.
    pub(crate) free_head: NodeId,
    pub(crate) tree_root: NodeId,
    pub(crate) free_node_inited: u64,

    mem_side: RequestPort<MemPacket>,
    cpu_side: ResponsePort<RespPacket>,
    /// Next memory request staged by the active command.
    mem_outbox: Option<MemPacket>,

    captrack: CapTrackMap,
    objects: ObjectTable,
    stats: ControllerStats,
}

impl NodeController {
    pub fn new(base: u64) -> NodeController {
        NodeController {
            current: None,
            base,
            free_head: NodeId::INVALID,
            tree_root: NodeId::INVALID,
            free_node_inited: 0,
            mem_side: RequestPort::new("node_controller.mem_side"),
            cpu_side: ResponsePort::new("node_controller.cpu_side"),
            mem_outbox: None,
            captrack: CapTrackMap::new(),
            objects: ObjectTable::new(),
            stats: ControllerStats::default(),
        }
    }

    /// Base physical address of the owned node region.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Accept a command packet from the cpu side.
    ///
    /// Returns false when another command is active; the caller keeps the
    /// packet and will be notified to retry once the controller drains.
    pub fn handle_request(&mut self, pkt: &CommandPacket) -> bool {
        if self.current.is_some() {
            trace!("controller busy, refusing command {:?}", pkt.op);
            self.cpu_side.set_retry_req();
            self.stats.busy_rejects += 1;
            return false;
        }

        match pkt.op {
            NodeOp::Query { .. } => self.stats.queries += 1,
            NodeOp::Allocate { .. } => self.stats.allocates += 1,
            NodeOp::Revoke { .. } => self.stats.revokes += 1,
            NodeOp::RcUpdate { .. } => self.stats.rc_updates += 1,
        }

        let mut cmd = ControllerCommand::new(&pkt.op);
        cmd.setup(self);
        self.current = Some(ActiveCommand {
            pkt_id: pkt.id,
            thread: pkt.thread,
            cmd,
        });
        true
    }

    /// Deliver a memory response to the active command.
    ///
    /// Returns the command response once the state machine finishes.
    pub fn handle_mem_response(&mut self, resp: MemPacket) -> Option<RespPacket> {
        assert!(resp.is_resp, "request packet on the response path");
        let mut active = self
            .current
            .take()
            .expect("memory response with no active command");

        let outcome = active.cmd.transit(self, &resp);
        match outcome {
            Some((status, payload)) => {
                debug!("command complete: {:?}", status);
                Some(RespPacket {
                    id: active.pkt_id,
                    thread: active.thread,
                    status,
                    payload,
                })
            }
            None => {
                self.current = Some(active);
                None
            }
        }
    }

    /// Push a finished command response out through the cpu-side port.
    ///
    /// Returns true when a previously refused requester should resend.
    pub fn send_response(&mut self, resp: RespPacket, peer: &mut dyn PacketSink<RespPacket>) -> bool {
        self.cpu_side.try_send_resp(resp, peer)
    }

    /// The cpu-side peer became ready for a deferred response.
    pub fn recv_resp_retry(&mut self, peer: &mut dyn PacketSink<RespPacket>) -> bool {
        self.stats.retries += 1;
        self.cpu_side.recv_resp_retry(peer)
    }

    /// Forward the staged memory request, honouring the retry register.
    pub fn flush_mem(&mut self, mem: &mut NodeMemory) {
        if let Some(pkt) = self.mem_outbox.take() {
            self.mem_side.try_send(pkt, mem);
        }
    }

    /// Memory signalled readiness after a refusal.
    pub fn recv_mem_retry(&mut self, mem: &mut NodeMemory) {
        self.stats.retries += 1;
        self.mem_side.recv_retry(mem);
    }

    pub fn is_busy(&self) -> bool {
        self.current.is_some() || self.mem_outbox.is_some() || !self.mem_side.can_send()
    }

    pub fn tree_root(&self) -> NodeId {
        self.tree_root
    }

    pub fn free_head(&self) -> NodeId {
        self.free_head
    }

    pub fn free_node_inited(&self) -> u64 {
        self.free_node_inited
    }

    pub fn stats(&self) -> &ControllerStats {
        &self.stats
    }

    // ------------------------------------------------------------------
    // Memory traffic, used by the command state machines
    // ------------------------------------------------------------------

    pub(crate) fn send_load(&mut self, node: NodeId) {
        let addr = node.addr(self.base);
        trace!("send load {:#x}", addr);
        assert!(self.mem_outbox.is_none(), "overlapping memory requests");
        self.stats.loads += 1;
        self.mem_outbox = Some(MemPacket::read(addr));
    }

    pub(crate) fn send_store(&mut self, node_id: NodeId, node: &Node) {
        let addr = node_id.addr(self.base);
        trace!("send store {:#x}", addr);
        assert!(self.mem_outbox.is_none(), "overlapping memory requests");
        self.stats.stores += 1;
        self.mem_outbox = Some(MemPacket::write(addr, node));
    }

    /// Prepend a node to the free list. The caller stores the record.
    pub(crate) fn free_node(&mut self, node: &mut Node, node_id: NodeId) {
        debug!("free node {}", node_id);
        node.next = self.free_head;
        self.free_head = node_id;
    }

    // ------------------------------------------------------------------
    // Capability tracking and object-range services
    // ------------------------------------------------------------------

    pub fn add_cap_track(&mut self, loc: CapLoc, node: NodeId) {
        self.captrack.add(loc, node);
    }

    pub fn query_cap_track(&self, loc: &CapLoc) -> NodeId {
        self.captrack.query(loc)
    }

    pub fn remove_cap_track(&mut self, loc: &CapLoc) {
        self.captrack.remove(loc);
    }

    pub fn alloc_object(&mut self, range: AddrRange) {
        self.objects.alloc(range);
    }

    pub fn free_object(&mut self, addr: u64) {
        self.objects.free(addr);
    }

    pub fn lookup_addr(&self, addr: u64) -> Option<usize> {
        self.objects.lookup(addr)
    }
}

impl Default for NodeController {
    fn default() -> Self {
        Self::new(NODE_BASE_ADDR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{NodeOp, RespPayload, RespStatus};

    /// Drive the controller against a memory model until the active command
    /// completes, returning its response.
    fn run_command(ctrl: &mut NodeController, mem: &mut NodeMemory, op: NodeOp) -> RespPacket {
        let pkt = CommandPacket::new(0, op);
        assert!(ctrl.handle_request(&pkt));
        let mut tick = 0u64;
        loop {
            ctrl.flush_mem(mem);
            tick += 1;
            for resp in mem.take_ready(tick) {
                if let Some(done) = ctrl.handle_mem_response(resp) {
                    return done;
                }
            }
            assert!(tick < 1_000, "command did not complete");
        }
    }

    #[test]
    fn test_allocate_into_empty_tree() {
        let mut ctrl = NodeController::new(NODE_BASE_ADDR);
        let mut mem = NodeMemory::new(1, NODE_BASE_ADDR);

        let resp = run_command(&mut ctrl, &mut mem, NodeOp::Allocate { parent: NodeId::INVALID });
        assert_eq!(resp.status, RespStatus::Ok);
        assert_eq!(resp.payload, RespPayload::NodeId(NodeId(0)));

        assert_eq!(ctrl.tree_root(), NodeId(0));
        assert_eq!(ctrl.free_node_inited(), 1);
        let node = mem.read_node(NodeId(0));
        assert!(node.state.is_valid());
        assert_eq!(node.counter, 1);
        assert_eq!(node.depth, 1);
        assert_eq!(node.prev, NodeId::INVALID);
        assert_eq!(node.next, NodeId::INVALID);
    }

    #[test]
    fn test_allocate_into_middle_splices_linked_order() {
        let mut ctrl = NodeController::new(NODE_BASE_ADDR);
        let mut mem = NodeMemory::new(1, NODE_BASE_ADDR);

        run_command(&mut ctrl, &mut mem, NodeOp::Allocate { parent: NodeId::INVALID });
        run_command(&mut ctrl, &mut mem, NodeOp::Allocate { parent: NodeId(0) });
        let resp = run_command(&mut ctrl, &mut mem, NodeOp::Allocate { parent: NodeId(0) });
        assert_eq!(resp.payload, RespPayload::NodeId(NodeId(2)));

        // Linked order 0 -> 2 -> 1, depths 1, 2, 2.
        let n0 = mem.read_node(NodeId(0));
        let n1 = mem.read_node(NodeId(1));
        let n2 = mem.read_node(NodeId(2));
        assert_eq!(n0.next, NodeId(2));
        assert_eq!(n2.prev, NodeId(0));
        assert_eq!(n2.next, NodeId(1));
        assert_eq!(n1.prev, NodeId(2));
        assert_eq!((n0.depth, n2.depth, n1.depth), (1, 2, 2));
    }

    #[test]
    fn test_revoke_whole_tree_empties_root() {
        let mut ctrl = NodeController::new(NODE_BASE_ADDR);
        let mut mem = NodeMemory::new(1, NODE_BASE_ADDR);

        run_command(&mut ctrl, &mut mem, NodeOp::Allocate { parent: NodeId::INVALID });
        run_command(&mut ctrl, &mut mem, NodeOp::Allocate { parent: NodeId(0) });
        run_command(&mut ctrl, &mut mem, NodeOp::Allocate { parent: NodeId(0) });

        let resp = run_command(&mut ctrl, &mut mem, NodeOp::Revoke { node: NodeId(0) });
        assert_eq!(resp.status, RespStatus::Ok);
        assert_eq!(ctrl.tree_root(), NodeId::INVALID);
        // All counters were 1, so nothing is freed yet.
        assert_eq!(ctrl.free_head(), NodeId::INVALID);
        for id in 0..3 {
            assert!(!mem.read_node(NodeId(id)).state.is_valid());
        }
    }

    #[test]
    fn test_rc_zero_then_revoke_frees_and_reuses() {
        let mut ctrl = NodeController::new(NODE_BASE_ADDR);
        let mut mem = NodeMemory::new(1, NODE_BASE_ADDR);

        run_command(&mut ctrl, &mut mem, NodeOp::Allocate { parent: NodeId::INVALID });
        run_command(&mut ctrl, &mut mem, NodeOp::Allocate { parent: NodeId(0) });
        run_command(&mut ctrl, &mut mem, NodeOp::Allocate { parent: NodeId(0) });

        // Drop node 2's count to zero: still valid, so not freed.
        let resp = run_command(&mut ctrl, &mut mem, NodeOp::RcUpdate { node: NodeId(2), delta: -1 });
        assert_eq!(resp.status, RespStatus::Ok);
        assert_eq!(ctrl.free_head(), NodeId::INVALID);
        assert!(mem.read_node(NodeId(2)).state.is_valid());

        // Revocation invalidates it with a zero count: now it is freed.
        run_command(&mut ctrl, &mut mem, NodeOp::Revoke { node: NodeId(0) });
        assert_eq!(ctrl.free_head(), NodeId(2));

        // The next allocation must reuse the freed node.
        let resp = run_command(&mut ctrl, &mut mem, NodeOp::Allocate { parent: NodeId::INVALID });
        assert_eq!(resp.payload, RespPayload::NodeId(NodeId(2)));
        assert_eq!(ctrl.free_head(), NodeId::INVALID);
        assert_eq!(ctrl.free_node_inited(), 3);
    }

    #[test]
    fn test_query_is_a_pure_read() {
        let mut ctrl = NodeController::new(NODE_BASE_ADDR);
        let mut mem = NodeMemory::new(1, NODE_BASE_ADDR);

        run_command(&mut ctrl, &mut mem, NodeOp::Allocate { parent: NodeId::INVALID });
        let before = mem.read_node(NodeId(0));

        let resp = run_command(&mut ctrl, &mut mem, NodeOp::Query { node: NodeId(0) });
        assert_eq!(resp.payload, RespPayload::Node(before));
        assert_eq!(mem.read_node(NodeId(0)), before);
        assert_eq!(ctrl.tree_root(), NodeId(0));
    }

    #[test]
    fn test_rc_update_underflow_reports_error() {
        let mut ctrl = NodeController::new(NODE_BASE_ADDR);
        let mut mem = NodeMemory::new(1, NODE_BASE_ADDR);

        run_command(&mut ctrl, &mut mem, NodeOp::Allocate { parent: NodeId::INVALID });
        let resp = run_command(&mut ctrl, &mut mem, NodeOp::RcUpdate { node: NodeId(0), delta: -2 });
        assert_eq!(resp.status, RespStatus::CounterUnderflow);
        // The store was skipped: the counter is untouched.
        assert_eq!(mem.read_node(NodeId(0)).counter, 1);
    }

    #[test]
    fn test_revoke_stale_root_reports_error() {
        let mut ctrl = NodeController::new(NODE_BASE_ADDR);
        let mut mem = NodeMemory::new(1, NODE_BASE_ADDR);

        run_command(&mut ctrl, &mut mem, NodeOp::Allocate { parent: NodeId::INVALID });
        run_command(&mut ctrl, &mut mem, NodeOp::Revoke { node: NodeId(0) });

        let resp = run_command(&mut ctrl, &mut mem, NodeOp::Revoke { node: NodeId(0) });
        assert_eq!(resp.status, RespStatus::StaleRoot);
    }

    #[test]
    fn test_busy_controller_refuses_second_command() {
        let mut ctrl = NodeController::new(NODE_BASE_ADDR);
        let pkt = CommandPacket::new(0, NodeOp::Query { node: NodeId(0) });
        assert!(ctrl.handle_request(&pkt));

        let second = CommandPacket::new(0, NodeOp::Query { node: NodeId(1) });
        assert!(!ctrl.handle_request(&second));
        assert_eq!(ctrl.stats().busy_rejects, 1);
    }
}
