//! # Node Command Queue
//!
//! One queue unit per hardware thread plus the shared sender toward the
//! node controller. The shared side multiplexes command packets from all
//! units onto a single port with one retry slot, remembers which thread
//! issued each packet, and routes responses back to the issuing unit.

pub(crate) mod entry;
pub mod order;
mod unit;

pub use entry::{CommandCondition, CommandStatus, EntryId, NcqEntry, NodeCommand};
pub use unit::{CommitCheck, NcqUnit};

use std::collections::HashMap;

use crate::inst::{DynInstRef, InstSeqNum, PipelineHooks, ThreadId};
use crate::packet::{CommandPacket, PacketId, RespPacket};
use crate::port::{PacketSink, RequestPort};
use crate::stats::NcqStats;

use unit::CommandSender;

/// The queue complex shared by all hardware threads.
#[derive(Debug)]
pub struct Ncq {
    units: Vec<NcqUnit>,
    port: RequestPort<CommandPacket>,
    /// Which thread issued each outstanding packet.
    routes: HashMap<PacketId, ThreadId>,
    /// Refused packets retransmitted after a retry callback.
    retries: u64,
}

/// Borrow of the shared sending state handed to one unit during writeback.
struct SendChannel<'a> {
    port: &'a mut RequestPort<CommandPacket>,
    routes: &'a mut HashMap<PacketId, ThreadId>,
    sink: &'a mut dyn PacketSink<CommandPacket>,
}

impl CommandSender for SendChannel<'_> {
    fn can_send(&self) -> bool {
        self.port.can_send()
    }

    fn send(&mut self, pkt: CommandPacket) {
        self.routes.insert(pkt.id, pkt.thread);
        self.port.try_send(pkt, self.sink);
    }
}

impl Ncq {
    pub fn new(threads: usize, depth: usize) -> Ncq {
        assert!(threads > 0, "at least one hardware thread");
        Ncq {
            units: (0..threads).map(|t| NcqUnit::new(t, depth)).collect(),
            port: RequestPort::new("ncq.cmd_side"),
            routes: HashMap::new(),
            retries: 0,
        }
    }

    pub fn unit(&self, thread: ThreadId) -> &NcqUnit {
        &self.units[thread]
    }

    pub fn unit_mut(&mut self, thread: ThreadId) -> &mut NcqUnit {
        &mut self.units[thread]
    }

    pub fn is_full(&self, thread: ThreadId) -> bool {
        self.units[thread].is_full()
    }

    /// Whether the shared sender can take another packet this tick.
    pub fn can_send(&self) -> bool {
        self.port.can_send()
    }

    pub fn insert_instruction(&mut self, inst: &DynInstRef) {
        let thread = inst.borrow().thread;
        self.units[thread].insert_instruction(inst);
    }

    pub fn push_command(&mut self, inst: &DynInstRef, cmd: NodeCommand) {
        let thread = inst.borrow().thread;
        self.units[thread].push_command(inst, cmd);
    }

    pub fn push_commit_command(&mut self, thread: ThreadId, cmd: NodeCommand) {
        self.units[thread].push_commit_command(cmd);
    }

    pub fn commit_before(&mut self, thread: ThreadId, seq_num: InstSeqNum) {
        self.units[thread].commit_before(seq_num);
    }

    pub fn squash(&mut self, thread: ThreadId, squashed_seq: InstSeqNum) {
        self.units[thread].squash(squashed_seq);
    }

    pub fn passed_query(&self, inst: &DynInstRef) -> CommitCheck {
        let thread = inst.borrow().thread;
        self.units[thread].passed_query(inst)
    }

    /// Run the writeback walk of every unit against the shared sender.
    pub fn writeback(
        &mut self,
        sink: &mut dyn PacketSink<CommandPacket>,
        hooks: &mut dyn PipelineHooks,
    ) {
        for unit in self.units.iter_mut() {
            let mut channel = SendChannel {
                port: &mut self.port,
                routes: &mut self.routes,
                sink: &mut *sink,
            };
            unit.writeback(&mut channel, hooks);
        }
    }

    /// Pop finished entries on every unit.
    pub fn cleanup(&mut self) {
        for unit in self.units.iter_mut() {
            unit.cleanup_commands();
        }
    }

    /// The controller told us to resend a refused command packet.
    pub fn recv_req_retry(&mut self, sink: &mut dyn PacketSink<CommandPacket>) {
        self.retries += 1;
        self.port.recv_retry(sink);
    }

    /// Route a controller response to the unit that issued the packet.
    pub fn handle_cache_resp(&mut self, resp: RespPacket, hooks: &mut dyn PipelineHooks) {
        let thread = self
            .routes
            .remove(&resp.id)
            .unwrap_or_else(|| panic!("ncq: response for unrouted packet"));
        self.units[thread].handle_cache_resp(resp, hooks);
    }

    /// Every unit drained and nothing stuck in the shared retry slot.
    pub fn is_drained(&self) -> bool {
        self.port.can_send() && self.units.iter().all(|u| u.is_drained())
    }

    pub fn take_retired_commits(&mut self) -> Vec<NodeCommand> {
        let mut retired = Vec::new();
        for unit in self.units.iter_mut() {
            retired.extend(unit.take_retired_commits());
        }
        retired
    }

    /// Aggregate statistics across all units and the shared sender.
    pub fn stats(&self) -> NcqStats {
        let mut total = NcqStats::default();
        for unit in &self.units {
            total.merge(unit.stats());
        }
        total.retries += self.retries;
        total
    }
}
