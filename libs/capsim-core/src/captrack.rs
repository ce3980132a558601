//! Capability-location tracking
//!
//! The pipeline needs to translate an architectural capability site (a
//! register slot, a memory word, a holding slot used during transfers) into
//! the revocation node backing it. The map is unique on locations; several
//! locations may share one node, which is exactly what the node's reference
//! counter accounts for.

use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use crate::inst::ThreadId;
use crate::node::NodeId;

/// An architectural location that can hold a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapLoc {
    /// An integer register slot.
    Reg { thread: ThreadId, index: u16 },
    /// A word of memory.
    Mem(u64),
    /// The per-thread holding slot used while a capability is in transit.
    Holding { thread: ThreadId },
}

impl fmt::Display for CapLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapLoc::Reg { thread, index } => write!(f, "reg {}.{}", thread, index),
            CapLoc::Mem(addr) => write!(f, "mem {:#x}", addr),
            CapLoc::Holding { thread } => write!(f, "holding {}", thread),
        }
    }
}

/// Map from capability locations to node ids.
#[derive(Debug, Default)]
pub struct CapTrackMap {
    map: HashMap<CapLoc, NodeId>,
}

impl CapTrackMap {
    pub fn new() -> CapTrackMap {
        CapTrackMap::default()
    }

    /// Insert or overwrite the node backing a location.
    pub fn add(&mut self, loc: CapLoc, node: NodeId) {
        debug!("cap track added with node {} at {}", node, loc);
        self.map.insert(loc, node);
    }

    /// Node currently backing a location; INVALID on a miss.
    pub fn query(&self, loc: &CapLoc) -> NodeId {
        self.map.get(loc).copied().unwrap_or(NodeId::INVALID)
    }

    /// Remove the entry for a location, if any.
    pub fn remove(&mut self, loc: &CapLoc) {
        debug!("cap track removed at {}", loc);
        self.map.remove(loc);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// A half-open address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrRange {
    pub start: u64,
    pub end: u64,
}

impl AddrRange {
    pub fn new(start: u64, end: u64) -> AddrRange {
        assert!(start < end, "empty address range");
        AddrRange { start, end }
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Debug registry of live object address ranges.
#[derive(Debug, Default)]
pub struct ObjectTable {
    ranges: Vec<AddrRange>,
}

impl ObjectTable {
    pub fn new() -> ObjectTable {
        ObjectTable::default()
    }

    /// Record a newly allocated object.
    pub fn alloc(&mut self, range: AddrRange) {
        self.ranges.push(range);
    }

    /// Drop every recorded object containing the address.
    pub fn free(&mut self, addr: u64) {
        self.ranges.retain(|r| !r.contains(addr));
    }

    /// Ordinal of the first recorded range containing the address.
    pub fn lookup(&self, addr: u64) -> Option<usize> {
        self.ranges.iter().position(|r| r.contains(addr))
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}
