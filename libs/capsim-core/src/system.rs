//! System wiring and the tick loop
//!
//! Owns the controller, the backing memory, the queue complex and the
//! pipeline hook sink, and plays the discrete-event fabric between them.
//! Within a tick the callback order is fixed: due memory responses first
//! (advancing the active controller command), then the NCQ writeback walk,
//! then port retries, then queue cleanup.

use tracing::debug;

use crate::config::SimConfig;
use crate::controller::NodeController;
use crate::inst::{DynInst, DynInstRef, InstSeqNum, RecordingHooks, ThreadId};
use crate::memory::NodeMemory;
use crate::ncq::{CommitCheck, Ncq, NodeCommand};
use crate::packet::{CommandPacket, NodeOp, RespPacket};
use crate::port::PacketSink;

/// Adapter presenting the controller's cpu side as a packet sink.
struct CtrlSink<'a> {
    controller: &'a mut NodeController,
}

impl PacketSink<CommandPacket> for CtrlSink<'_> {
    fn try_recv(&mut self, pkt: CommandPacket) -> Result<(), CommandPacket> {
        if self.controller.handle_request(&pkt) {
            Ok(())
        } else {
            Err(pkt)
        }
    }
}

/// Adapter delivering command responses into the queue complex.
struct NcqRespSink<'a> {
    ncq: &'a mut Ncq,
    hooks: &'a mut RecordingHooks,
}

impl PacketSink<RespPacket> for NcqRespSink<'_> {
    fn try_recv(&mut self, resp: RespPacket) -> Result<(), RespPacket> {
        self.ncq.handle_cache_resp(resp, self.hooks);
        Ok(())
    }
}

/// The assembled revocation subsystem.
#[derive(Debug)]
pub struct System {
    pub controller: NodeController,
    pub memory: NodeMemory,
    pub ncq: Ncq,
    pub hooks: RecordingHooks,
    now: u64,
    next_seq: InstSeqNum,
}

impl System {
    pub fn new(config: &SimConfig) -> System {
        System {
            controller: NodeController::new(config.node_base_addr),
            memory: NodeMemory::new(config.mem_latency, config.node_base_addr),
            ncq: Ncq::new(config.threads, config.ncq_depth),
            hooks: RecordingHooks::default(),
            now: 0,
            next_seq: 0,
        }
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    /// Advance the model by one cycle.
    pub fn tick(&mut self) {
        self.now += 1;

        // Due memory responses unwind the active controller command.
        for resp in self.memory.take_ready(self.now) {
            if let Some(cmd_resp) = self.controller.handle_mem_response(resp) {
                let retry_req = {
                    let mut sink = NcqRespSink {
                        ncq: &mut self.ncq,
                        hooks: &mut self.hooks,
                    };
                    self.controller.send_response(cmd_resp, &mut sink)
                };
                if retry_req {
                    // The controller drained; a refused command may resend.
                    let mut sink = CtrlSink {
                        controller: &mut self.controller,
                    };
                    self.ncq.recv_req_retry(&mut sink);
                }
            }
            self.controller.flush_mem(&mut self.memory);
        }

        // Schedule freshly runnable commands.
        {
            let mut sink = CtrlSink {
                controller: &mut self.controller,
            };
            self.ncq.writeback(&mut sink, &mut self.hooks);
        }
        self.controller.flush_mem(&mut self.memory);

        // Memory backpressure cleared: retransmit the stashed request.
        if self.memory.take_retry_signal() {
            self.controller.recv_mem_retry(&mut self.memory);
            self.controller.flush_mem(&mut self.memory);
        }

        self.ncq.cleanup();
    }

    /// Nothing in flight anywhere.
    pub fn is_quiet(&self) -> bool {
        !self.controller.is_busy() && self.memory.is_idle() && self.ncq.is_drained()
    }

    /// Tick until quiescent. Panics after `max_ticks`: the fabric always
    /// responds in bounded time, so a stuck command is a model bug.
    pub fn run_until_quiet(&mut self, max_ticks: u64) -> u64 {
        let start = self.now;
        while !self.is_quiet() {
            assert!(
                self.now - start < max_ticks,
                "no quiescence after {} ticks",
                max_ticks
            );
            self.tick();
        }
        self.now - start
    }

    // ------------------------------------------------------------------
    // Pipeline front-ends
    // ------------------------------------------------------------------

    /// Dispatch a new instruction into its thread's queue.
    pub fn dispatch(&mut self, thread: ThreadId, seq_num: InstSeqNum) -> DynInstRef {
        let inst = DynInst::new(thread, seq_num);
        self.ncq.insert_instruction(&inst);
        self.next_seq = self.next_seq.max(seq_num + 1);
        inst
    }

    /// Append a command to a dispatched instruction.
    pub fn push_command(&mut self, inst: &DynInstRef, cmd: NodeCommand) {
        self.ncq.push_command(inst, cmd);
    }

    /// Push a commit-originated command.
    pub fn push_commit_command(&mut self, thread: ThreadId, op: NodeOp) {
        let seq_num = self.next_seq;
        self.next_seq += 1;
        self.ncq.push_commit_command(thread, NodeCommand::new(op, seq_num));
    }

    pub fn commit_before(&mut self, thread: ThreadId, seq_num: InstSeqNum) {
        self.ncq.commit_before(thread, seq_num);
    }

    pub fn squash(&mut self, thread: ThreadId, squashed_seq: InstSeqNum) {
        debug!("squash everything younger than sn {}", squashed_seq);
        self.ncq.squash(thread, squashed_seq);
    }

    pub fn passed_query(&self, inst: &DynInstRef) -> CommitCheck {
        self.ncq.passed_query(inst)
    }

    /// Submit one commit-level command and run it to completion.
    pub fn submit_sync(&mut self, thread: ThreadId, op: NodeOp) -> NodeCommand {
        self.push_commit_command(thread, op);
        self.run_until_quiet(10_000);
        let mut retired = self.ncq.take_retired_commits();
        assert_eq!(retired.len(), 1, "expected exactly one retired command");
        retired.pop().expect("retired command present")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeId;
    use crate::packet::{RespPayload, RespStatus};

    fn system() -> System {
        System::new(&SimConfig::default())
    }

    #[test]
    fn test_commit_level_allocate_round_trip() {
        let mut sys = system();
        let done = sys.submit_sync(0, NodeOp::Allocate { parent: NodeId::INVALID });
        assert_eq!(done.error, None);
        assert_eq!(done.result, Some(RespPayload::NodeId(NodeId(0))));
        assert!(sys.is_quiet());
    }

    #[test]
    fn test_speculative_command_completes_through_the_stack() {
        let mut sys = system();
        let inst = sys.dispatch(0, 1);
        inst.borrow_mut().has_node_wb = true;
        sys.push_command(
            &inst,
            NodeCommand::new(NodeOp::Allocate { parent: NodeId::INVALID }, 0).before_commit(),
        );

        sys.run_until_quiet(1_000);

        assert_eq!(sys.passed_query(&inst), CommitCheck::Passed);
        assert_eq!(sys.hooks.ready, vec![1]);
        assert_eq!(
            inst.borrow().node_results()[0].payload,
            RespPayload::NodeId(NodeId(0))
        );

        // Commit releases the entry and cleanup retires it.
        sys.commit_before(0, 1);
        sys.tick();
        assert!(sys.ncq.unit(0).is_empty());
    }

    #[test]
    fn test_busy_controller_defers_second_packet() {
        let mut sys = system();
        // Two conflicting commands from different entries: the second packet
        // is only sent after the first completes, via the retry path.
        sys.push_commit_command(0, NodeOp::Allocate { parent: NodeId::INVALID });
        sys.push_commit_command(0, NodeOp::Allocate { parent: NodeId(0) });

        sys.run_until_quiet(1_000);

        let retired = sys.ncq.take_retired_commits();
        assert_eq!(retired.len(), 2);
        assert_eq!(retired[1].result, Some(RespPayload::NodeId(NodeId(1))));
        assert_eq!(sys.controller.stats().allocates, 2);
    }

    #[test]
    fn test_busy_reject_parks_packet_until_controller_drains() {
        let mut sys = system();
        sys.submit_sync(0, NodeOp::Allocate { parent: NodeId::INVALID });

        // Queries may reorder, so both issue in the same tick; the second
        // finds the controller busy and sits in the retry slot until the
        // first response drains.
        sys.push_commit_command(0, NodeOp::Query { node: NodeId(0) });
        sys.push_commit_command(0, NodeOp::Query { node: NodeId(0) });
        sys.run_until_quiet(1_000);

        assert!(sys.controller.stats().busy_rejects >= 1);
        assert_eq!(sys.controller.stats().queries, 2);
        assert!(sys.ncq.stats().retries >= 1);
        assert_eq!(sys.ncq.take_retired_commits().len(), 2);
    }

    #[test]
    fn test_memory_refusal_is_retried_transparently() {
        let mut sys = system();
        sys.memory.refuse_next(1);
        let done = sys.submit_sync(0, NodeOp::Allocate { parent: NodeId::INVALID });
        assert_eq!(done.error, None);
        assert_eq!(sys.controller.tree_root(), NodeId(0));
        assert!(sys.controller.stats().retries >= 1);
    }

    #[test]
    fn test_relocated_node_region() {
        let config = SimConfig {
            node_base_addr: 0x2000_0000_0000,
            ..SimConfig::default()
        };
        let mut sys = System::new(&config);
        assert_eq!(sys.controller.base(), 0x2000_0000_0000);
        assert_eq!(sys.memory.base(), 0x2000_0000_0000);

        let done = sys.submit_sync(0, NodeOp::Allocate { parent: NodeId::INVALID });
        assert_eq!(done.result, Some(RespPayload::NodeId(NodeId(0))));
        assert!(sys.memory.read_node(NodeId(0)).state.is_valid());
    }

    #[test]
    fn test_rc_update_error_surfaces_status() {
        let mut sys = system();
        sys.submit_sync(0, NodeOp::Allocate { parent: NodeId::INVALID });
        let done = sys.submit_sync(0, NodeOp::RcUpdate { node: NodeId(0), delta: -5 });
        assert_eq!(done.error, Some(RespStatus::CounterUnderflow));
    }
}
