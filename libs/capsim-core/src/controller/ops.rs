//! Controller command state machines
//!
//! Each command is a small state machine advanced once per memory response.
//! `setup` runs when the command packet is accepted and issues the first
//! load; `transit` consumes one response, issues the next load or store, and
//! reports completion together with the response status and payload.
//!
//! The machines never cache node contents across steps: every field they
//! depend on is re-read from the most recent store, so the model charges the
//! full memory cost of walking the structure.

use tracing::{debug, trace};

use super::NodeController;
use crate::node::{NodeId, NodeState, NODE_COUNT};
use crate::packet::{MemPacket, NodeOp, RespPayload, RespStatus};

/// Outcome of one transit step.
pub(crate) type StepOutcome = Option<(RespStatus, RespPayload)>;

/// The active command held by the controller.
#[derive(Debug)]
pub(crate) enum ControllerCommand {
    Query(QueryOp),
    Allocate(AllocateOp),
    Revoke(RevokeOp),
    RcUpdate(RcUpdateOp),
}

impl ControllerCommand {
    pub(crate) fn new(op: &NodeOp) -> ControllerCommand {
        match *op {
            NodeOp::Query { node } => ControllerCommand::Query(QueryOp { node }),
            NodeOp::Allocate { parent } => ControllerCommand::Allocate(AllocateOp::new(parent)),
            NodeOp::Revoke { node } => ControllerCommand::Revoke(RevokeOp::new(node)),
            NodeOp::RcUpdate { node, delta } => {
                ControllerCommand::RcUpdate(RcUpdateOp::new(node, delta))
            }
        }
    }

    pub(crate) fn setup(&mut self, ctrl: &mut NodeController) {
        match self {
            ControllerCommand::Query(op) => op.setup(ctrl),
            ControllerCommand::Allocate(op) => op.setup(ctrl),
            ControllerCommand::Revoke(op) => op.setup(ctrl),
            ControllerCommand::RcUpdate(op) => op.setup(ctrl),
        }
    }

    pub(crate) fn transit(&mut self, ctrl: &mut NodeController, resp: &MemPacket) -> StepOutcome {
        match self {
            ControllerCommand::Query(op) => op.transit(ctrl, resp),
            ControllerCommand::Allocate(op) => op.transit(ctrl, resp),
            ControllerCommand::Revoke(op) => op.transit(ctrl, resp),
            ControllerCommand::RcUpdate(op) => op.transit(ctrl, resp),
        }
    }
}

/// Query: one load, payload copied into the response.
#[derive(Debug)]
pub(crate) struct QueryOp {
    node: NodeId,
}

impl QueryOp {
    fn setup(&mut self, ctrl: &mut NodeController) {
        trace!("query node {}", self.node);
        ctrl.send_load(self.node);
    }

    fn transit(&mut self, _ctrl: &mut NodeController, resp: &MemPacket) -> StepOutcome {
        Some((RespStatus::Ok, RespPayload::Node(resp.node())))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AllocState {
    LoadParent,
    StoreParent,
    LoadRight,
    StoreRight,
    Load,
    Store,
}

/// Allocate: splice a new node as the immediate successor of the parent.
#[derive(Debug)]
pub(crate) struct AllocateOp {
    parent: NodeId,
    state: AllocState,
    to_alloc: NodeId,
    from_free_list: bool,
    parent_depth: u32,
    next_node: NodeId,
    next_free: NodeId,
}

impl AllocateOp {
    fn new(parent: NodeId) -> AllocateOp {
        AllocateOp {
            parent,
            state: AllocState::Load,
            to_alloc: NodeId::INVALID,
            from_free_list: false,
            parent_depth: 0,
            next_node: NodeId::INVALID,
            next_free: NodeId::INVALID,
        }
    }

    fn setup(&mut self, ctrl: &mut NodeController) {
        if ctrl.free_head.is_valid() {
            self.to_alloc = ctrl.free_head;
            self.from_free_list = true;
        } else {
            assert!(
                ctrl.free_node_inited < NODE_COUNT as u64,
                "node controller: no free node remaining"
            );
            self.to_alloc = NodeId(ctrl.free_node_inited as u32);
            self.from_free_list = false;
        }
        debug!(
            "allocate under parent {}: picked node {} (free list: {})",
            self.parent, self.to_alloc, self.from_free_list
        );

        if !self.parent.is_valid() {
            // No parent to touch: the new node becomes a root at depth 1 and
            // its right neighbour is the current tree root.
            self.next_node = ctrl.tree_root;
            self.parent_depth = 0;
            if self.next_node.is_valid() {
                self.state = AllocState::LoadRight;
                ctrl.send_load(self.next_node);
            } else {
                self.state = AllocState::Load;
                ctrl.send_load(self.to_alloc);
            }
        } else {
            // Load the parent first to learn its depth and right neighbour.
            self.state = AllocState::LoadParent;
            ctrl.send_load(self.parent);
        }
    }

    fn transit(&mut self, ctrl: &mut NodeController, resp: &MemPacket) -> StepOutcome {
        match self.state {
            AllocState::LoadParent => {
                let mut node = resp.node();
                self.parent_depth = node.depth;
                self.next_node = node.next;
                node.next = self.to_alloc;

                self.state = AllocState::StoreParent;
                ctrl.send_store(self.parent, &node);
                None
            }
            AllocState::StoreParent => {
                if self.next_node.is_valid() {
                    self.state = AllocState::LoadRight;
                    ctrl.send_load(self.next_node);
                } else {
                    self.state = AllocState::Load;
                    ctrl.send_load(self.to_alloc);
                }
                None
            }
            AllocState::LoadRight => {
                let mut node = resp.node();
                node.prev = self.to_alloc;
                self.state = AllocState::StoreRight;
                ctrl.send_store(self.next_node, &node);
                None
            }
            AllocState::StoreRight => {
                self.state = AllocState::Load;
                ctrl.send_load(self.to_alloc);
                None
            }
            AllocState::Load => {
                // The node's current `next` is its free-list link.
                let mut node = resp.node();
                self.next_free = node.next;
                node.prev = self.parent;
                node.next = self.next_node;
                if !self.parent.is_valid() {
                    ctrl.tree_root = self.to_alloc;
                }
                node.state = NodeState::Valid;
                node.counter = 1;
                node.depth = self.parent_depth + 1;
                ctrl.send_store(self.to_alloc, &node);

                self.state = AllocState::Store;
                None
            }
            AllocState::Store => {
                if self.from_free_list {
                    ctrl.free_head = self.next_free;
                } else {
                    ctrl.free_node_inited += 1;
                }
                Some((RespStatus::Ok, RespPayload::NodeId(self.to_alloc)))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RevokeState {
    LoadRoot,
    Store,
    Load,
    StoreRight,
    LoadLeft,
    StoreLeft,
}

/// Revoke: invalidate the maximal deeper-than-root prefix of successors,
/// then stitch the surviving neighbours together.
#[derive(Debug)]
pub(crate) struct RevokeOp {
    root: NodeId,
    state: RevokeState,
    root_depth: u32,
    cur: NodeId,
    prev: NodeId,
}

impl RevokeOp {
    fn new(root: NodeId) -> RevokeOp {
        assert!(root.is_valid(), "revoke on the invalid node id");
        RevokeOp {
            root,
            state: RevokeState::LoadRoot,
            root_depth: 0,
            cur: NodeId::INVALID,
            prev: NodeId::INVALID,
        }
    }

    fn setup(&mut self, ctrl: &mut NodeController) {
        debug!("revoke subtree rooted at {}", self.root);
        self.state = RevokeState::LoadRoot;
        ctrl.send_load(self.root);
    }

    fn transit(&mut self, ctrl: &mut NodeController, resp: &MemPacket) -> StepOutcome {
        match self.state {
            RevokeState::LoadRoot => {
                let mut node = resp.node();
                if !node.state.is_valid() {
                    return Some((RespStatus::StaleRoot, RespPayload::Empty));
                }
                if node.depth == 0 {
                    return Some((RespStatus::BadDepth, RespPayload::Empty));
                }
                self.root_depth = node.depth;
                self.cur = node.next;
                self.prev = node.prev;
                node.state = NodeState::Invalid;
                if node.counter == 0 {
                    // No location refers to the root anymore: free it now.
                    ctrl.free_node(&mut node, self.root);
                }
                ctrl.send_store(self.root, &node);

                self.state = RevokeState::Store;
                None
            }
            RevokeState::Load => {
                let mut node = resp.node();
                if node.depth > self.root_depth {
                    // Still inside the subtree.
                    node.state = NodeState::Invalid;
                    let old = self.cur;
                    self.cur = node.next;
                    if node.counter == 0 {
                        ctrl.free_node(&mut node, old);
                    }
                    ctrl.send_store(old, &node);

                    self.state = RevokeState::Store;
                } else {
                    // First survivor on the right: point it back at the
                    // left survivor.
                    node.prev = self.prev;
                    ctrl.send_store(self.cur, &node);
                    self.state = RevokeState::StoreRight;
                }
                None
            }
            RevokeState::Store => {
                if !self.cur.is_valid() {
                    if !self.prev.is_valid() {
                        // The whole tree is gone.
                        ctrl.tree_root = NodeId::INVALID;
                        return Some((RespStatus::Ok, RespPayload::Empty));
                    }
                    self.state = RevokeState::LoadLeft;
                    ctrl.send_load(self.prev);
                } else {
                    self.state = RevokeState::Load;
                    ctrl.send_load(self.cur);
                }
                None
            }
            RevokeState::StoreRight => {
                if !self.prev.is_valid() {
                    // The revoked root was the tree root.
                    ctrl.tree_root = self.cur;
                    return Some((RespStatus::Ok, RespPayload::Empty));
                }
                self.state = RevokeState::LoadLeft;
                ctrl.send_load(self.prev);
                None
            }
            RevokeState::LoadLeft => {
                let mut node = resp.node();
                node.next = self.cur;
                ctrl.send_store(self.prev, &node);
                self.state = RevokeState::StoreLeft;
                None
            }
            RevokeState::StoreLeft => Some((RespStatus::Ok, RespPayload::Empty)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RcUpdateState {
    Load,
    Store,
}

/// RcUpdate: read-modify-write of the reference counter, freeing the node
/// when the count reaches zero on an already invalidated node.
#[derive(Debug)]
pub(crate) struct RcUpdateOp {
    node: NodeId,
    delta: i32,
    state: RcUpdateState,
}

impl RcUpdateOp {
    fn new(node: NodeId, delta: i32) -> RcUpdateOp {
        assert!(node.is_valid(), "rc update on the invalid node id");
        assert!(delta != 0, "rc update with zero delta");
        RcUpdateOp {
            node,
            delta,
            state: RcUpdateState::Load,
        }
    }

    fn setup(&mut self, ctrl: &mut NodeController) {
        debug!("rc update: node {} delta {}", self.node, self.delta);
        self.state = RcUpdateState::Load;
        ctrl.send_load(self.node);
    }

    fn transit(&mut self, ctrl: &mut NodeController, resp: &MemPacket) -> StepOutcome {
        match self.state {
            RcUpdateState::Load => {
                let mut node = resp.node();
                if !node.state.is_valid() && node.counter == 0 {
                    // Already on the free list; nothing to adjust.
                    return Some((RespStatus::AlreadyFreed, RespPayload::Empty));
                }
                let updated = node.counter as i64 + self.delta as i64;
                if updated < 0 {
                    return Some((RespStatus::CounterUnderflow, RespPayload::Empty));
                }
                node.counter = updated as u32;
                if node.counter == 0 && !node.state.is_valid() {
                    // The last reference to an invalidated node is gone.
                    // Its prev/next carry no information anymore, so the
                    // free-list link may overwrite next.
                    ctrl.free_node(&mut node, self.node);
                }
                ctrl.send_store(self.node, &node);

                self.state = RcUpdateState::Store;
                None
            }
            RcUpdateState::Store => Some((RespStatus::Ok, RespPayload::Empty)),
        }
    }
}
