//! Lowers flat stack bytecode into `bc-ir`'s tree IR.

pub mod error;
pub mod lower;
pub mod stack;

pub use error::LowerError;
pub use lower::lower;
pub use stack::{StackFunction, StackInstruction};
