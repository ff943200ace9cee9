//! Allocation records and the physical-register tracking types shared by
//! both linear-scan allocators.
//!
//! These types are defined in `bc-ir` (rather than in `bc-regalloc`) because
//! [`crate::tree::TreeData`] carries `Vec<RegSpill>` etc. directly; the
//! records are part of the annotated-IR data model, not allocator-private
//! bookkeeping.

use crate::entity::{BlockId, TreeId};

/// The identity an allocator `Value` stands for: either a local variable
/// slot or the anonymous result of a non-statement-root tree (a "tree
/// temporary", consumed by its parent).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueOf {
    Local(u32),
    Tree(TreeId),
}

impl ValueOf {
    pub fn as_local(self) -> Option<u32> {
        match self {
            ValueOf::Local(i) => Some(i),
            ValueOf::Tree(_) => None,
        }
    }
}

/// Where a value is next read from the current point of view of whichever
/// scan direction is running. A local whose next read escapes the current
/// block is anchored to the block that reads it rather than to a tree,
/// which keeps it alive across the block boundary instead of being freed
/// mid-block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastUse {
    Tree(TreeId),
    Block(BlockId),
}

impl LastUse {
    /// Ordering key used by the spill heuristics: a tree-anchored last use
    /// compares by `ir_idx`; a block-anchored one has no `ir_idx` and is
    /// always treated as "furthest away" by forward LSRA (see
    /// `bc-regalloc::lsra::spill_victim`).
    pub fn ir_idx(self, trees: &crate::entity::PrimaryMap<TreeId, crate::tree::TreeData>) -> Option<u32> {
        match self {
            LastUse::Tree(t) => Some(trees[t].ir_idx),
            LastUse::Block(_) => None,
        }
    }
}

/// Store a register into the value's spill slot. Keyed by [`ValueOf`]
/// rather than the allocator-private [`ValueId`]; the allocator's value
/// arena is gone by the time the interpreter walks these records, so the
/// record must carry its own identity (which spill map to use and under
/// what key) rather than a handle into a table that no longer exists.
#[derive(Debug, Clone, Copy)]
pub struct RegSpill {
    pub value: ValueOf,
    pub reg: u32,
}

/// Load the value's spill slot into a register.
#[derive(Debug, Clone, Copy)]
pub struct RegRestore {
    pub value: ValueOf,
    pub reg: u32,
}

/// Copy one register into another; the destination register takes on the
/// identity of a new value.
#[derive(Debug, Clone, Copy)]
pub struct RegMove {
    pub val_from: ValueOf,
    pub reg_from: u32,
    pub val_to: ValueOf,
    pub reg_to: u32,
}

/// A `(value, register)` pair serializing the cross-block physical mapping
/// for one value, as stored in [`crate::block::BlockData::active_in_set`]
/// / `active_out_set`. Always a local (tree temporaries never escape a
/// block), but carries the general [`ValueOf`] shape for uniformity with
/// the other records.
#[derive(Debug, Clone, Copy)]
pub struct ActiveInOut {
    pub value: ValueOf,
    pub reg: u32,
}

/// Arena index for allocator [`Value`]s. Values compare by identity: two
/// `ValueId`s are equal iff they name the same arena slot, matching the
/// reference implementation's `Value.__eq__` (`self is value`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValueId(u32);

impl crate::entity::EntityRef for ValueId {
    fn index(self) -> usize {
        self.0 as usize
    }

    fn from_index(index: usize) -> Self {
        ValueId(index as u32)
    }
}

impl std::fmt::Display for ValueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// One unit of register occupancy tracked by an allocator: a local variable
/// or a tree temporary, its current register (if active), and where it is
/// next read.
#[derive(Debug, Clone)]
pub struct Value {
    pub of: ValueOf,
    pub active_in: Option<u32>,
    pub last_use: Option<LastUse>,
}

impl Value {
    pub fn new(of: ValueOf) -> Self {
        Value {
            of,
            active_in: None,
            last_use: None,
        }
    }
}

/// One physical register slot; holds at most one active value. Invariant:
/// `registers[r] == Some(v) iff v.active_in == Some(r)`, maintained by the
/// allocators.
#[derive(Debug, Clone, Copy)]
pub struct Register {
    pub active_val: Option<ValueId>,
}

impl Register {
    pub fn free() -> Self {
        Register { active_val: None }
    }
}
