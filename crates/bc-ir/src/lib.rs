//! Tree IR data model and CFG analyses.
//!
//! `bc-ir` owns the arena types ([`entity`]), the tree/statement/block data
//! ([`tree`], [`block`]), the allocator-facing value/record types
//! ([`records`]) and the [`ir::Ir`] container that ties them together with
//! the structural analyses (`reindex`, `recompute_predecessors`,
//! `recompute_alive_sets`). Everything downstream (lowering, both
//! allocators, the interpreter) builds on this crate alone.

pub mod block;
pub mod entity;
pub mod ir;
pub mod records;
pub mod tree;

pub use block::BlockData;
pub use entity::{BlockId, EntityRef, PrimaryMap, StmtId, TreeId};
pub use ir::Ir;
pub use records::{ActiveInOut, LastUse, RegMove, RegRestore, RegSpill, Register, Value, ValueId, ValueOf};
pub use tree::{BlockEdge, Operand, Operator, StatementData, TreeData, TreeKind};
