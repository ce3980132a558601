//! Dynamic-instruction surface consumed by the NCQ
//!
//! The full out-of-order pipeline lives outside this crate. What the queue
//! needs from an instruction is small: its sequence number, its squash and
//! writeback flags, the data-memory request it saved during execute, and a
//! back-index to its queue entry. The back link is an id, never a strong
//! reference; the queue owns entries and commands.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::CapFault;
use crate::ncq::{EntryId, NodeCommand};
use crate::packet::{NodeOp, RespPayload};

/// Instruction sequence number assigned at decode, monotone per thread.
pub type InstSeqNum = u64;

/// Hardware thread index.
pub type ThreadId = usize;

/// The data-memory request an instruction saved during execute.
///
/// Node commands may be gated on this request: a command that depends on the
/// address or tag of a capability-bearing access cannot start until the
/// access resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedRequest {
    /// Whether the access has finished translation and execution.
    pub complete: bool,
    /// Resolved physical address.
    pub paddr: u64,
    /// Whether the accessed location carries a capability tag.
    pub tag_set: bool,
}

/// Result of a completed node command, as seen by the instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAccResult {
    pub op: NodeOp,
    pub payload: RespPayload,
}

/// Model of an in-flight dynamic instruction.
#[derive(Debug)]
pub struct DynInst {
    pub seq_num: InstSeqNum,
    pub thread: ThreadId,
    /// Back-index into the NCQ; None once squashed or retired.
    pub ncq_entry: Option<EntryId>,
    /// The associated data-memory request, if any.
    pub saved_request: Option<SavedRequest>,
    /// Whether the instruction writes a node result back to a register.
    pub has_node_wb: bool,
    squashed: bool,
    node_executed: bool,
    has_node_op: bool,
    results: Vec<NodeAccResult>,
}

/// Shared handle to a dynamic instruction.
pub type DynInstRef = Rc<RefCell<DynInst>>;

impl DynInst {
    pub fn new(thread: ThreadId, seq_num: InstSeqNum) -> DynInstRef {
        Rc::new(RefCell::new(DynInst {
            seq_num,
            thread,
            ncq_entry: None,
            saved_request: None,
            has_node_wb: false,
            squashed: false,
            node_executed: false,
            has_node_op: false,
            results: Vec::new(),
        }))
    }

    pub fn is_squashed(&self) -> bool {
        self.squashed
    }

    pub fn set_squashed(&mut self) {
        self.squashed = true;
    }

    pub fn is_node_executed(&self) -> bool {
        self.node_executed
    }

    pub fn set_node_executed(&mut self) {
        self.node_executed = true;
    }

    pub fn has_node_op(&self) -> bool {
        self.has_node_op
    }

    pub(crate) fn mark_node_op(&mut self) {
        self.has_node_op = true;
    }

    /// Deliver a completed node command back to the instruction.
    ///
    /// Records the result for register writeback and surfaces any capability
    /// fault the command produced.
    pub fn complete_node_acc(&mut self, cmd: &NodeCommand) -> Option<CapFault> {
        if let Some(status) = cmd.error {
            return status.fault(cmd.op.target());
        }
        self.results.push(NodeAccResult {
            op: cmd.op,
            payload: cmd.result.unwrap_or(RespPayload::Empty),
        });
        None
    }

    /// Results accumulated so far, oldest first.
    pub fn node_results(&self) -> &[NodeAccResult] {
        &self.results
    }
}

/// Notifications the queue delivers back into the pipeline.
pub trait PipelineHooks {
    /// A node-dependent instruction finished all its queue work and may be
    /// considered for commit.
    fn inst_ready_to_commit(&mut self, inst: &DynInstRef);

    /// A command surfaced a capability fault; deliver a precise trap.
    fn trap(&mut self, fault: CapFault, thread: ThreadId, seq_num: InstSeqNum);
}

/// Hook implementation that records every notification, for harnesses and
/// tests standing in for the IEW stage and the CPU trap port.
#[derive(Debug, Default)]
pub struct RecordingHooks {
    pub ready: Vec<InstSeqNum>,
    pub traps: Vec<(ThreadId, InstSeqNum, CapFault)>,
}

impl PipelineHooks for RecordingHooks {
    fn inst_ready_to_commit(&mut self, inst: &DynInstRef) {
        self.ready.push(inst.borrow().seq_num);
    }

    fn trap(&mut self, fault: CapFault, thread: ThreadId, seq_num: InstSeqNum) {
        self.traps.push((thread, seq_num, fault));
    }
}
