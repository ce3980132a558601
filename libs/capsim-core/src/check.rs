//! Node-pool invariant auditing
//!
//! Re-reads the pool from backing memory at a quiescent point and verifies
//! the structural invariants: the live list hanging off the tree root, the
//! free stack, link symmetry, the depth rule that keeps subtrees contiguous,
//! and the freeing discipline for dead nodes.

use std::collections::HashSet;

use thiserror::Error;

use crate::controller::NodeController;
use crate::memory::NodeMemory;
use crate::node::{NodeId, NODE_COUNT};

/// A partition of the handed-out node ids, as observed in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSnapshot {
    /// Ids reachable from the tree root, in linked order.
    pub live: Vec<NodeId>,
    /// Ids on the free stack, head first.
    pub free: Vec<NodeId>,
    /// First id never handed out by the bump allocator.
    pub first_fresh: u64,
}

/// An invariant violation found while auditing the pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuditError {
    #[error("live walk exceeded pool capacity at node {0}")]
    LiveCycle(NodeId),

    #[error("free walk exceeded pool capacity at node {0}")]
    FreeCycle(NodeId),

    #[error("node {0} revisited in the linked order")]
    Revisited(NodeId),

    #[error("invalid node {0} reachable from the tree root")]
    DeadOnTree(NodeId),

    #[error("valid node {0} on the free list")]
    LiveOnFreeList(NodeId),

    #[error("free node {0} still carries references")]
    FreeWithRefs(NodeId),

    #[error("node {0} linked but never handed out")]
    NeverAllocated(NodeId),

    #[error("asymmetric link between {0} and {1}")]
    LinkAsymmetry(NodeId, NodeId),

    #[error("live node {0} has zero depth")]
    ZeroDepth(NodeId),

    #[error("depth jump from node {0} to its successor")]
    DepthJump(NodeId),

    #[error("node {0} appears on both the tree and the free list")]
    Overlap(NodeId),

    #[error("valid node {0} unreachable from the tree root")]
    Unreachable(NodeId),

    #[error("dead node {0} with zero count missing from the free list")]
    MissingFromFreeList(NodeId),
}

/// Audit the pool and return its partition.
pub fn audit(ctrl: &NodeController, mem: &NodeMemory) -> Result<PoolSnapshot, AuditError> {
    let first_fresh = ctrl.free_node_inited();

    // Walk the live list off the tree root.
    let mut live = Vec::new();
    let mut live_set = HashSet::new();
    let mut cur = ctrl.tree_root();
    let mut prev = NodeId::INVALID;
    while cur.is_valid() {
        if live.len() > NODE_COUNT as usize {
            return Err(AuditError::LiveCycle(cur));
        }
        if (cur.0 as u64) >= first_fresh {
            return Err(AuditError::NeverAllocated(cur));
        }
        let node = mem.read_node(cur);
        if !node.state.is_valid() {
            return Err(AuditError::DeadOnTree(cur));
        }
        if node.depth == 0 {
            return Err(AuditError::ZeroDepth(cur));
        }
        if node.prev != prev {
            return Err(AuditError::LinkAsymmetry(cur, node.prev));
        }
        if !live_set.insert(cur) {
            return Err(AuditError::Revisited(cur));
        }
        if node.next.is_valid() {
            let next = mem.read_node(node.next);
            if next.depth > node.depth + 1 {
                return Err(AuditError::DepthJump(cur));
            }
        }
        live.push(cur);
        prev = cur;
        cur = node.next;
    }

    // Walk the free stack.
    let mut free = Vec::new();
    let mut free_set = HashSet::new();
    let mut cur = ctrl.free_head();
    while cur.is_valid() {
        if free.len() > NODE_COUNT as usize {
            return Err(AuditError::FreeCycle(cur));
        }
        if (cur.0 as u64) >= first_fresh {
            return Err(AuditError::NeverAllocated(cur));
        }
        if live_set.contains(&cur) {
            return Err(AuditError::Overlap(cur));
        }
        let node = mem.read_node(cur);
        if node.state.is_valid() {
            return Err(AuditError::LiveOnFreeList(cur));
        }
        if node.counter != 0 {
            return Err(AuditError::FreeWithRefs(cur));
        }
        if !free_set.insert(cur) {
            return Err(AuditError::Revisited(cur));
        }
        free.push(cur);
        cur = node.next;
    }

    // Every handed-out id is on the tree, on the free stack, or dead with
    // outstanding references awaiting its last rc decrement.
    for raw in 0..first_fresh {
        let id = NodeId(raw as u32);
        if live_set.contains(&id) || free_set.contains(&id) {
            continue;
        }
        let node = mem.read_node(id);
        if node.state.is_valid() {
            return Err(AuditError::Unreachable(id));
        }
        if node.counter == 0 {
            return Err(AuditError::MissingFromFreeList(id));
        }
    }

    Ok(PoolSnapshot {
        live,
        free,
        first_fresh,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Node, NodeState, NODE_BASE_ADDR};

    fn valid_node(depth: u32, counter: u32, prev: NodeId, next: NodeId) -> Node {
        Node {
            state: NodeState::Valid,
            depth,
            counter,
            prev,
            next,
        }
    }

    #[test]
    fn test_empty_pool_audits_clean() {
        let ctrl = NodeController::new(NODE_BASE_ADDR);
        let mem = NodeMemory::new(1, NODE_BASE_ADDR);
        let snap = audit(&ctrl, &mem).unwrap();
        assert!(snap.live.is_empty());
        assert!(snap.free.is_empty());
        assert_eq!(snap.first_fresh, 0);
    }

    #[test]
    fn test_clean_two_node_tree() {
        let mut ctrl = NodeController::new(NODE_BASE_ADDR);
        let mut mem = NodeMemory::new(1, NODE_BASE_ADDR);
        ctrl.tree_root = NodeId(0);
        ctrl.free_node_inited = 2;
        mem.write_node(NodeId(0), &valid_node(1, 1, NodeId::INVALID, NodeId(1)));
        mem.write_node(NodeId(1), &valid_node(2, 1, NodeId(0), NodeId::INVALID));

        let snap = audit(&ctrl, &mem).unwrap();
        assert_eq!(snap.live, vec![NodeId(0), NodeId(1)]);
    }

    #[test]
    fn test_broken_back_link_is_reported() {
        let mut ctrl = NodeController::new(NODE_BASE_ADDR);
        let mut mem = NodeMemory::new(1, NODE_BASE_ADDR);
        ctrl.tree_root = NodeId(0);
        ctrl.free_node_inited = 2;
        mem.write_node(NodeId(0), &valid_node(1, 1, NodeId::INVALID, NodeId(1)));
        // Wrong prev: points at itself instead of node 0.
        mem.write_node(NodeId(1), &valid_node(2, 1, NodeId(1), NodeId::INVALID));

        assert_eq!(
            audit(&ctrl, &mem),
            Err(AuditError::LinkAsymmetry(NodeId(1), NodeId(1)))
        );
    }

    #[test]
    fn test_depth_jump_is_reported() {
        let mut ctrl = NodeController::new(NODE_BASE_ADDR);
        let mut mem = NodeMemory::new(1, NODE_BASE_ADDR);
        ctrl.tree_root = NodeId(0);
        ctrl.free_node_inited = 2;
        mem.write_node(NodeId(0), &valid_node(1, 1, NodeId::INVALID, NodeId(1)));
        // Depth 3 directly under depth 1 breaks subtree contiguity.
        mem.write_node(NodeId(1), &valid_node(3, 1, NodeId(0), NodeId::INVALID));

        assert_eq!(audit(&ctrl, &mem), Err(AuditError::DepthJump(NodeId(0))));
    }

    #[test]
    fn test_zero_count_dead_node_must_be_freed() {
        let mut ctrl = NodeController::new(NODE_BASE_ADDR);
        let mut mem = NodeMemory::new(1, NODE_BASE_ADDR);
        ctrl.free_node_inited = 1;
        let dead = Node {
            state: NodeState::Invalid,
            depth: 1,
            counter: 0,
            prev: NodeId::INVALID,
            next: NodeId::INVALID,
        };
        mem.write_node(NodeId(0), &dead);

        assert_eq!(
            audit(&ctrl, &mem),
            Err(AuditError::MissingFromFreeList(NodeId(0)))
        );
    }

    #[test]
    fn test_live_node_on_free_list_is_reported() {
        let mut ctrl = NodeController::new(NODE_BASE_ADDR);
        let mut mem = NodeMemory::new(1, NODE_BASE_ADDR);
        ctrl.free_node_inited = 1;
        ctrl.free_head = NodeId(0);
        mem.write_node(NodeId(0), &valid_node(1, 0, NodeId::INVALID, NodeId::INVALID));

        assert_eq!(audit(&ctrl, &mem), Err(AuditError::LiveOnFreeList(NodeId(0))));
    }
}
