//! Basic blocks.

use std::collections::BTreeSet;

use crate::entity::{BlockId, StmtId};
use crate::records::ActiveInOut;
use crate::tree::BlockEdge;

/// A basic block: a starting source index, a position in the default
/// (forward) traversal order, a statement list, and, once the relevant
/// pass has run, liveness and register-allocation summaries.
#[derive(Debug, Clone)]
pub struct BlockData {
    pub src_idx: u32,
    pub prev: Option<BlockId>,
    pub next: Option<BlockId>,
    pub first_stmt: Option<StmtId>,
    pub last_stmt: Option<StmtId>,

    /// Filled in by [`crate::ir::Ir::recompute_predecessors`].
    pub predecessors: Vec<BlockEdge>,

    /// Filled in by [`crate::ir::Ir::recompute_alive_sets`].
    pub alive_in: Option<BTreeSet<u32>>,
    pub alive_out: Option<BTreeSet<u32>>,

    /// Filled in by whichever allocator runs. `None` means "not yet
    /// allocated"; the sentinel the allocators use to decide whether a
    /// block is ready to be queued.
    pub active_in_set: Option<Vec<ActiveInOut>>,
    pub active_out_set: Option<Vec<ActiveInOut>>,
}

impl BlockData {
    pub fn new(src_idx: u32) -> Self {
        BlockData {
            src_idx,
            prev: None,
            next: None,
            first_stmt: None,
            last_stmt: None,
            predecessors: Vec::new(),
            alive_in: None,
            alive_out: None,
            active_in_set: None,
            active_out_set: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.first_stmt.is_none()
    }
}
