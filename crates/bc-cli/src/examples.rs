//! The bundled example programs, one per end-to-end scenario named in the
//! design spec: written directly in the stack bytecode `bc-lower` consumes,
//! the same way the reference implementation's `main.py` hard-codes a single
//! Fibonacci program rather than reading one from a file (lexing/parsing a
//! bytecode text format is out of scope).

use bc_lower::{StackFunction, StackInstruction::*};
use clap::ValueEnum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Program {
    /// a=0; b=1; i=n; while i != 0 { c=a+b; a=b; b=c; i-=1 }; return a
    Fib,
    /// ((0+0)+(0+0))+((0+0)+(0+0)), no locals at all.
    Sum,
    /// a=0; b=0; return a+a+b+b+a+b
    CopyChain,
    /// a=5; if a==5 then return 1 else return 0
    Branch,
    /// a=0; i=5; while i != 0 { a=a+1; i-=1 }; return a
    LoopDeadStore,
}

impl Program {
    /// Builds the bundled bytecode. `n` only affects [`Program::Fib`] (the
    /// loop bound); every other program ignores it.
    pub fn build(self, n: i64) -> StackFunction {
        match self {
            Program::Fib => fib(n),
            Program::Sum => sum(),
            Program::CopyChain => copy_chain(),
            Program::Branch => branch_taken(),
            Program::LoopDeadStore => loop_dead_store(),
        }
    }
}

/// locals: 0=a, 1=b, 2=c (scratch), 3=i
fn fib(n: i64) -> StackFunction {
    StackFunction::new(
        4,
        vec![
            Push(0), StLocal(0),
            Push(1), StLocal(1),
            Push(n), StLocal(3),
            // 6: loop header
            LdLocal(3), Push(0), Eq, Branch(23, 10),
            // 10: loop body
            LdLocal(0), LdLocal(1), Add, StLocal(2),
            LdLocal(1), StLocal(0),
            LdLocal(2), StLocal(1),
            LdLocal(3), Push(1), Sub, StLocal(3),
            Jmp(6),
            // 23: exit
            LdLocal(0), Ret,
        ],
    )
}

fn sum() -> StackFunction {
    StackFunction::new(
        0,
        vec![
            Push(0), Push(0), Add,
            Push(0), Push(0), Add,
            Add,
            Push(0), Push(0), Add,
            Push(0), Push(0), Add,
            Add,
            Add,
            Ret,
        ],
    )
}

/// locals: 0=a, 1=b
fn copy_chain() -> StackFunction {
    StackFunction::new(
        2,
        vec![
            Push(0), StLocal(0),
            Push(0), StLocal(1),
            LdLocal(0), LdLocal(0), Add,
            LdLocal(1), Add,
            LdLocal(1), Add,
            LdLocal(0), Add,
            LdLocal(1), Add,
            Ret,
        ],
    )
}

/// locals: 0=a
fn branch_taken() -> StackFunction {
    StackFunction::new(
        1,
        vec![
            Push(5), StLocal(0),
            LdLocal(0), Push(5), Eq,
            Branch(6, 8),
            // 6: true branch
            Push(1), Ret,
            // 8: false branch
            Push(0), Ret,
        ],
    )
}

/// locals: 0=a, 1=i
fn loop_dead_store() -> StackFunction {
    StackFunction::new(
        2,
        vec![
            Push(0), StLocal(0),
            Push(5), StLocal(1),
            // 4: loop header
            LdLocal(1), Push(0), Eq, Branch(17, 8),
            // 8: loop body
            LdLocal(0), Push(1), Add, StLocal(0),
            LdLocal(1), Push(1), Sub, StLocal(1),
            Jmp(4),
            // 17: exit
            LdLocal(0), Ret,
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_bundled_program_lowers_cleanly() {
        for program in [Program::Fib, Program::Sum, Program::CopyChain, Program::Branch, Program::LoopDeadStore] {
            let func = program.build(10);
            bc_lower::lower(&func).unwrap_or_else(|e| panic!("{program:?} failed to lower: {e}"));
        }
    }
}
