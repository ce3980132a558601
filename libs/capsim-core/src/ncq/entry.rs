//! NCQ entries and node commands
//!
//! An entry is created per dispatched instruction (or per commit-originated
//! command) and owns the commands that instruction emitted during execute.
//! Commands are tiny state machines on the queue side: not started, waiting
//! on the controller, completed.

use crate::inst::{DynInstRef, InstSeqNum, SavedRequest, ThreadId};
use crate::packet::{CommandPacket, NodeOp, RespPacket, RespPayload, RespStatus};

/// Identifier of a queue entry. Ids grow monotonically and are never
/// reused, so a stale back-index can always be detected.
pub type EntryId = u64;

/// Scheduling state of a node command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    NotStarted,
    /// A packet is in flight toward the controller.
    AwaitCache,
    Completed,
}

/// Predicate gating a command on the instruction's saved memory request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCondition {
    /// The data access must have written a capability tag.
    TagSet,
    /// The data access must have cleared the tag at its target.
    TagCleared,
}

impl CommandCondition {
    pub fn satisfied(&self, req: &SavedRequest) -> bool {
        match self {
            CommandCondition::TagSet => req.tag_set,
            CommandCondition::TagCleared => !req.tag_set,
        }
    }
}

/// A node command queued on behalf of an instruction.
#[derive(Debug, Clone)]
pub struct NodeCommand {
    pub op: NodeOp,
    pub status: CommandStatus,
    /// Must complete before the owning instruction may retire.
    pub before_commit: bool,
    /// Optional gate over the instruction's saved memory request.
    pub condition: Option<CommandCondition>,
    /// Error status recorded at completion, if any.
    pub error: Option<RespStatus>,
    /// Response payload recorded at completion.
    pub result: Option<RespPayload>,
    /// Sequence number of the owning instruction or commit push.
    pub seq_num: InstSeqNum,
}

impl NodeCommand {
    pub fn new(op: NodeOp, seq_num: InstSeqNum) -> NodeCommand {
        NodeCommand {
            op,
            status: CommandStatus::NotStarted,
            before_commit: false,
            condition: None,
            error: None,
            result: None,
            seq_num,
        }
    }

    /// Require completion before commit.
    pub fn before_commit(mut self) -> NodeCommand {
        self.before_commit = true;
        self
    }

    /// Gate scheduling on the saved memory request.
    pub fn with_condition(mut self, cond: CommandCondition) -> NodeCommand {
        self.condition = Some(cond);
        self
    }

    pub fn is_completed(&self) -> bool {
        self.status == CommandStatus::Completed
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// One scheduling step: emit the packet carrying this command and move
    /// to the awaiting state.
    pub fn transition(&mut self, thread: ThreadId) -> Option<CommandPacket> {
        assert_eq!(
            self.status,
            CommandStatus::NotStarted,
            "transition on a started command"
        );
        self.status = CommandStatus::AwaitCache;
        Some(CommandPacket::new(thread, self.op))
    }

    /// Consume the controller's response.
    pub fn handle_resp(&mut self, resp: RespPacket) {
        assert_eq!(
            self.status,
            CommandStatus::AwaitCache,
            "response for a command that is not waiting"
        );
        self.status = CommandStatus::Completed;
        if !resp.status.is_ok() {
            self.error = Some(resp.status);
        }
        self.result = Some(resp.payload);
    }
}

/// One slot of the per-thread node command queue.
#[derive(Debug)]
pub struct NcqEntry {
    pub id: EntryId,
    /// Owning instruction; None for commit-originated entries.
    pub inst: Option<DynInstRef>,
    pub seq_num: InstSeqNum,
    pub commands: Vec<NodeCommand>,
    /// Set once commit released the instruction; sticky.
    pub can_wb: bool,
    pub completed_commands: usize,
}

impl NcqEntry {
    /// Entry for a dispatched instruction.
    pub fn for_inst(id: EntryId, inst: &DynInstRef) -> NcqEntry {
        let seq_num = inst.borrow().seq_num;
        NcqEntry {
            id,
            inst: Some(inst.clone()),
            seq_num,
            commands: Vec::new(),
            can_wb: false,
            completed_commands: 0,
        }
    }

    /// Entry for a command pushed at commit time: no instruction, already
    /// released for writeback.
    pub fn for_commit(id: EntryId, cmd: NodeCommand) -> NcqEntry {
        NcqEntry {
            id,
            inst: None,
            seq_num: cmd.seq_num,
            commands: vec![cmd],
            can_wb: true,
            completed_commands: 0,
        }
    }

    pub fn completed(&self) -> bool {
        self.completed_commands == self.commands.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inst::DynInst;
    use crate::node::NodeId;

    #[test]
    fn test_transition_emits_one_packet() {
        let mut cmd = NodeCommand::new(NodeOp::Query { node: NodeId(3) }, 1);
        let pkt = cmd.transition(0).unwrap();
        assert_eq!(pkt.op, NodeOp::Query { node: NodeId(3) });
        assert_eq!(cmd.status, CommandStatus::AwaitCache);
    }

    #[test]
    fn test_response_completes_and_records_error() {
        let mut cmd = NodeCommand::new(NodeOp::Revoke { node: NodeId(3) }, 1);
        let pkt = cmd.transition(0).unwrap();
        cmd.handle_resp(RespPacket {
            id: pkt.id,
            thread: 0,
            status: RespStatus::StaleRoot,
            payload: RespPayload::Empty,
        });
        assert!(cmd.is_completed());
        assert!(cmd.has_error());
    }

    #[test]
    fn test_condition_gates_on_tag() {
        let req = SavedRequest {
            complete: true,
            paddr: 0x1000,
            tag_set: true,
        };
        assert!(CommandCondition::TagSet.satisfied(&req));
        assert!(!CommandCondition::TagCleared.satisfied(&req));
    }

    #[test]
    fn test_entry_completion_tracking() {
        let inst = DynInst::new(0, 9);
        let mut entry = NcqEntry::for_inst(7, &inst);
        assert!(entry.completed());

        entry.commands.push(NodeCommand::new(NodeOp::Query { node: NodeId(0) }, 9));
        assert!(!entry.completed());
        entry.completed_commands = 1;
        assert!(entry.completed());
    }

    #[test]
    fn test_commit_entry_is_born_released() {
        let entry = NcqEntry::for_commit(1, NodeCommand::new(NodeOp::Revoke { node: NodeId(1) }, 5));
        assert!(entry.can_wb);
        assert!(entry.inst.is_none());
        assert_eq!(entry.seq_num, 5);
    }
}
