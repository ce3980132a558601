//! # Capstone revocation-node model
//!
//! Cycle-level model of the capability-revocation subsystem of a
//! capability-extended RISC-V core:
//!
//! - A memory-mapped **node controller** owning the global pool of
//!   revocation nodes, serviced one command at a time through load/store
//!   traffic against backing memory
//! - Per-thread **node command queues** buffering the commands emitted by
//!   speculatively executed instructions, ordering them against commit and
//!   squash, and multiplexing them onto the controller port
//! - Timing **ports** with explicit single-slot retry on every link
//! - An **invariant auditor** that re-reads the pool at quiescent points
//!
//! The model is single-threaded and discrete-event: components expose
//! tick-grained entry points and advance on packet callbacks.

pub mod captrack;
pub mod check;
pub mod config;
pub mod controller;
pub mod error;
pub mod inst;
pub mod memory;
pub mod ncq;
pub mod node;
pub mod packet;
pub mod port;
pub mod stats;
pub mod system;

pub use captrack::{AddrRange, CapLoc};
pub use check::{audit, AuditError, PoolSnapshot};
pub use config::SimConfig;
pub use controller::NodeController;
pub use error::CapFault;
pub use inst::{DynInst, DynInstRef, InstSeqNum, PipelineHooks, RecordingHooks, ThreadId};
pub use memory::NodeMemory;
pub use ncq::{CommandCondition, CommandStatus, CommitCheck, Ncq, NcqUnit, NodeCommand};
pub use node::{Node, NodeId, NodeState, NODE_BASE_ADDR, NODE_COUNT};
pub use packet::{CommandPacket, MemPacket, NodeOp, PacketId, RespPacket, RespPayload, RespStatus};
pub use system::System;
