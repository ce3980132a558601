//! Per-thread node command queue unit
//!
//! Buffers the node commands emitted by in-flight instructions, orders them
//! against commit, schedules them onto the shared controller port, routes
//! responses back, and answers the commit stage's completion queries.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, trace};

use super::entry::{CommandStatus, EntryId, NcqEntry, NodeCommand};
use super::order;
use crate::inst::{DynInstRef, InstSeqNum, PipelineHooks, ThreadId};
use crate::packet::{CommandPacket, NodeOp, PacketId, RespPacket};
use crate::stats::NcqStats;

/// Shared sender toward the node controller.
pub(crate) trait CommandSender {
    fn can_send(&self) -> bool;
    fn send(&mut self, pkt: CommandPacket);
}

/// Commit-gating verdict for one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitCheck {
    /// Every before-commit command completed cleanly.
    Passed,
    /// Some before-commit command is still outstanding.
    Pending,
    /// A before-commit command completed with a capability error.
    Failed,
}

/// Record of which command issued an outstanding packet.
#[derive(Debug)]
struct Issuer {
    entry: EntryId,
    index: usize,
    inst: Option<DynInstRef>,
}

/// One hardware thread's node command queue.
#[derive(Debug)]
pub struct NcqUnit {
    thread: ThreadId,
    depth: usize,
    queue: VecDeque<NcqEntry>,
    issuers: HashMap<PacketId, Issuer>,
    next_entry_id: EntryId,
    /// Completed commit-originated commands, drained by the harness.
    retired_commits: Vec<NodeCommand>,
    stats: NcqStats,
}

impl NcqUnit {
    pub fn new(thread: ThreadId, depth: usize) -> NcqUnit {
        assert!(depth > 0, "ncq depth must be positive");
        NcqUnit {
            thread,
            depth,
            queue: VecDeque::with_capacity(depth),
            issuers: HashMap::new(),
            next_entry_id: 0,
            retired_commits: Vec::new(),
            stats: NcqStats::default(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.depth
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn stats(&self) -> &NcqStats {
        &self.stats
    }

    /// All queued commands have completed; nothing is runnable or in
    /// flight.
    pub fn is_drained(&self) -> bool {
        self.queue
            .iter()
            .all(|e| e.commands.iter().all(|c| c.is_completed()))
    }

    fn alloc_entry_id(&mut self) -> EntryId {
        let id = self.next_entry_id;
        self.next_entry_id += 1;
        id
    }

    /// Insert an entry for a dispatched instruction.
    ///
    /// The caller must check `is_full` first; dispatching into a full queue
    /// stalls the pipeline instead.
    pub fn insert_instruction(&mut self, inst: &DynInstRef) {
        assert!(!self.is_full(), "insert into a full ncq");
        assert!(
            inst.borrow().ncq_entry.is_none(),
            "instruction already holds a queue entry"
        );
        let id = self.alloc_entry_id();
        self.queue.push_back(NcqEntry::for_inst(id, inst));
        inst.borrow_mut().ncq_entry = Some(id);
        self.stats.inserted += 1;
        trace!(
            "ncq[{}]: inserted sn {} as entry {}",
            self.thread,
            inst.borrow().seq_num,
            id
        );
    }

    /// Append a command to the entry of an already inserted instruction.
    pub fn push_command(&mut self, inst: &DynInstRef, mut cmd: NodeCommand) {
        let entry_id = inst
            .borrow()
            .ncq_entry
            .expect("push onto an instruction outside the queue");
        let entry = self
            .queue
            .iter_mut()
            .find(|e| e.id == entry_id)
            .expect("stale queue back-index");
        assert_eq!(
            entry.seq_num,
            inst.borrow().seq_num,
            "entry bound to a different instruction"
        );
        cmd.seq_num = entry.seq_num;
        entry.commands.push(cmd);
        inst.borrow_mut().mark_node_op();
        self.stats.commands_pushed += 1;
    }

    /// Allocate a commit-originated entry holding exactly one command.
    pub fn push_commit_command(&mut self, cmd: NodeCommand) {
        assert!(!self.is_full(), "commit push into a full ncq");
        let id = self.alloc_entry_id();
        debug!(
            "ncq[{}]: commit-originated {:?} sn {}",
            self.thread, cmd.op, cmd.seq_num
        );
        self.queue.push_back(NcqEntry::for_commit(id, cmd));
        self.stats.inserted += 1;
        self.stats.commands_pushed += 1;
    }

    /// Commit released all instructions up to and including `seq_num`.
    pub fn commit_before(&mut self, seq_num: InstSeqNum) {
        for entry in self.queue.iter_mut() {
            if entry.seq_num > seq_num {
                break;
            }
            entry.can_wb = true;
        }
    }

    /// Remove every entry younger than `squashed_seq`, marking the owning
    /// instructions squashed. Commit-originated entries survive.
    pub fn squash(&mut self, squashed_seq: InstSeqNum) {
        let mut idx = self.queue.len();
        while idx > 0 {
            idx -= 1;
            let doomed = match &self.queue[idx].inst {
                Some(inst) => inst.borrow().seq_num > squashed_seq,
                None => false,
            };
            if !doomed {
                continue;
            }
            let entry = self.queue.remove(idx).expect("squash index in range");
            if let Some(inst) = entry.inst {
                let mut inst = inst.borrow_mut();
                trace!("ncq[{}]: squashing sn {}", self.thread, inst.seq_num);
                inst.set_squashed();
                inst.ncq_entry = None;
            }
            self.stats.squashed_entries += 1;
        }
    }

    /// Pop finished entries off the front of the queue.
    pub fn cleanup_commands(&mut self) {
        while let Some(front) = self.queue.front() {
            if !(front.can_wb && front.completed()) {
                break;
            }
            let entry = self.queue.pop_front().expect("front exists");
            match entry.inst {
                Some(inst) => inst.borrow_mut().ncq_entry = None,
                None => self.retired_commits.extend(entry.commands),
            }
        }
    }

    /// Drain results of commit-originated commands that retired.
    pub fn take_retired_commits(&mut self) -> Vec<NodeCommand> {
        std::mem::take(&mut self.retired_commits)
    }

    /// Walk the queue and step every runnable command, issuing packets onto
    /// the shared sender until it refuses more work.
    pub(crate) fn writeback(&mut self, sender: &mut dyn CommandSender, hooks: &mut dyn PipelineHooks) {
        'entries: for ei in 0..self.queue.len() {
            if !sender.can_send() {
                break;
            }
            if self.queue[ei].completed() {
                continue;
            }
            for ci in 0..self.queue[ei].commands.len() {
                if !sender.can_send() {
                    break 'entries;
                }
                let cand = &self.queue[ei].commands[ci];
                if matches!(
                    cand.status,
                    CommandStatus::Completed | CommandStatus::AwaitCache
                ) {
                    continue;
                }

                // A conditioned command cannot start until the associated
                // data access resolved and the predicate holds over it.
                if let Some(cond) = cand.condition {
                    let satisfied = match &self.queue[ei].inst {
                        Some(inst) => match inst.borrow().saved_request {
                            Some(req) => req.complete && cond.satisfied(&req),
                            None => false,
                        },
                        None => false,
                    };
                    if !satisfied {
                        continue;
                    }
                }

                if self.blocked_by_older(ei, ci) {
                    continue;
                }

                let thread = self.thread;
                let entry_id = self.queue[ei].id;
                let inst = self.queue[ei].inst.clone();
                let cmd = &mut self.queue[ei].commands[ci];
                if let Some(pkt) = cmd.transition(thread) {
                    assert!(
                        !self.issuers.contains_key(&pkt.id),
                        "ncq[{}]: duplicate packet id",
                        thread
                    );
                    self.issuers.insert(
                        pkt.id,
                        Issuer {
                            entry: entry_id,
                            index: ci,
                            inst,
                        },
                    );
                    self.stats.packets_sent += 1;
                    sender.send(pkt);
                } else if cmd.status == CommandStatus::Completed {
                    // A command may finish without memory work.
                    self.complete_command(ei, ci, hooks);
                }
            }
        }
    }

    /// Is the command at (ei, ci) blocked by an older non-completed command
    /// it may not overtake?
    fn blocked_by_older(&self, ei: usize, ci: usize) -> bool {
        let cand_op: NodeOp = self.queue[ei].commands[ci].op;
        let cand_seq = self.queue[ei].seq_num;
        for ej in 0..=ei {
            let same_entry = ej == ei;
            if !same_entry && self.queue[ej].seq_num >= cand_seq {
                continue;
            }
            let limit = if same_entry {
                ci
            } else {
                self.queue[ej].commands.len()
            };
            for cj in 0..limit {
                let other = &self.queue[ej].commands[cj];
                if other.status != CommandStatus::Completed
                    && !order::reorder_allowed(&other.op, &cand_op)
                {
                    return true;
                }
            }
        }
        false
    }

    /// Route a controller response back to the issuing command.
    ///
    /// Responses for squashed instructions are discarded; the controller's
    /// pool mutation stands regardless.
    pub fn handle_cache_resp(&mut self, resp: RespPacket, hooks: &mut dyn PipelineHooks) {
        let issuer = self
            .issuers
            .remove(&resp.id)
            .unwrap_or_else(|| panic!("ncq[{}]: response for unknown packet", self.thread));

        if let Some(inst) = &issuer.inst {
            if inst.borrow().ncq_entry.is_none() {
                trace!(
                    "ncq[{}]: dropping response for squashed sn {}",
                    self.thread,
                    inst.borrow().seq_num
                );
                self.stats.responses_dropped += 1;
                return;
            }
        }
        let Some(pos) = self.queue.iter().position(|e| e.id == issuer.entry) else {
            self.stats.responses_dropped += 1;
            return;
        };

        self.queue[pos].commands[issuer.index].handle_resp(resp);
        if self.queue[pos].commands[issuer.index].is_completed() {
            self.complete_command(pos, issuer.index, hooks);
        }
    }

    /// Deliver a completed command to its instruction and bump the entry.
    fn complete_command(&mut self, pos: usize, index: usize, hooks: &mut dyn PipelineHooks) {
        let entry = &mut self.queue[pos];
        entry.completed_commands += 1;
        self.stats.completed += 1;

        if let Some(inst) = entry.inst.clone() {
            let fault = inst.borrow_mut().complete_node_acc(&entry.commands[index]);
            let finished = entry.completed();
            let (thread, seq_num, has_wb) = {
                let inst = inst.borrow();
                (inst.thread, inst.seq_num, inst.has_node_wb)
            };
            if let Some(fault) = fault {
                hooks.trap(fault, thread, seq_num);
            }
            if finished && has_wb {
                inst.borrow_mut().set_node_executed();
                hooks.inst_ready_to_commit(&inst);
            }
        }
    }

    /// Commit gating: may this instruction retire as far as the queue is
    /// concerned?
    pub fn passed_query(&self, inst: &DynInstRef) -> CommitCheck {
        let Some(entry_id) = inst.borrow().ncq_entry else {
            return CommitCheck::Passed;
        };
        let Some(entry) = self.queue.iter().find(|e| e.id == entry_id) else {
            return CommitCheck::Passed;
        };

        let mut failed = false;
        for cmd in &entry.commands {
            if !cmd.before_commit {
                continue;
            }
            if !cmd.is_completed() {
                return CommitCheck::Pending;
            }
            if cmd.has_error() {
                failed = true;
            }
        }
        if failed {
            CommitCheck::Failed
        } else {
            CommitCheck::Passed
        }
    }
}
