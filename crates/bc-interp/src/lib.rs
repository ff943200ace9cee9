//! Tree-walking interpreter that validates a register allocator's output
//! by executing the annotated IR directly.

pub mod error;
pub mod interp;

pub use error::InterpError;
pub use interp::{interpret, Interpreter};
