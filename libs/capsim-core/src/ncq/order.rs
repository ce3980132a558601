//! Reorder oracle
//!
//! Decides whether a younger node command may step ahead of an older one
//! that has not completed. The policy is conservative: everything conflicts
//! unless both sides are reference-count updates or both are queries.
//! Rc updates commute with each other, and queries do not mutate the pool.

use crate::packet::NodeOp;

/// May `later` overtake the non-completed `earlier`?
pub fn reorder_allowed(earlier: &NodeOp, later: &NodeOp) -> bool {
    (earlier.is_rc_update() && later.is_rc_update()) || (earlier.is_query() && later.is_query())
}
