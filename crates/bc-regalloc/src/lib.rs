//! Forward and reverse linear-scan register allocators over `bc-ir`.
//!
//! Both passes annotate the `Ir` in place (registers, spill/restore/move
//! records, per-block active sets); neither rewrites the tree shape.
//! [`lsra::allocate`] requires [`bc_ir::Ir::recompute_alive_sets`] to have
//! run first; [`rlsra::allocate`] only needs `recompute_predecessors` and
//! `reindex`.

pub mod error;
pub mod lsra;
pub mod rlsra;

pub use error::AllocError;
