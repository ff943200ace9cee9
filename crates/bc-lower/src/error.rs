use std::fmt;

/// Why a bytecode function failed to lower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowerError {
    /// A function with no instructions at all.
    EmptyFunction,
    /// A tree-folding instruction needed more stack operands than were
    /// available at that point in the stream.
    NotEnoughOperands { ins_idx: u32 },
    /// A statement-ending instruction left values on the fold stack;
    /// every statement must consume the whole expression it opened.
    LeftoverOperands { ins_idx: u32, remaining: usize },
    /// A jump or branch target that doesn't land on a statement boundary
    /// (into the middle of a folded expression).
    SplitMidStatement { target_idx: u32 },
    /// The last instruction of the function isn't a `Jmp`, `Branch` or
    /// `Ret`; every block must end in one.
    IllegalTerminator { ins_idx: u32 },
}

impl fmt::Display for LowerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LowerError::EmptyFunction => write!(f, "function has no instructions"),
            LowerError::NotEnoughOperands { ins_idx } => {
                write!(f, "instruction {ins_idx} needs more stack operands than are available")
            }
            LowerError::LeftoverOperands { ins_idx, remaining } => write!(
                f,
                "{remaining} value(s) left on the fold stack after instruction {ins_idx}"
            ),
            LowerError::SplitMidStatement { target_idx } => {
                write!(f, "jump target {target_idx} does not land on a statement boundary")
            }
            LowerError::IllegalTerminator { ins_idx } => {
                write!(f, "instruction {ins_idx} is the last in its function but is not a terminator")
            }
        }
    }
}

impl std::error::Error for LowerError {}
