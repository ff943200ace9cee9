//! The stack bytecode `bc-lower` consumes.

/// One stack-machine instruction. Operands are typed by position rather
/// than carried as a loose operand list, since each kind has a fixed shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackInstruction {
    LdLocal(u32),
    StLocal(u32),
    Push(i64),
    Pop,
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    /// Target is a bytecode instruction index, not a block id; lowering
    /// resolves it to a block via `Ir::get_or_insert_block_at`.
    Jmp(u32),
    /// `(if_target, else_target)`, both bytecode instruction indices.
    Branch(u32, u32),
    Ret,
}

/// A whole function: its local variable count and its instruction stream.
#[derive(Debug, Clone)]
pub struct StackFunction {
    pub local_vars: u32,
    pub instructions: Vec<StackInstruction>,
}

impl StackFunction {
    pub fn new(local_vars: u32, instructions: Vec<StackInstruction>) -> Self {
        StackFunction {
            local_vars,
            instructions,
        }
    }
}
