//! Folds a flat stack-bytecode stream into the tree IR, one basic block
//! at a time.
//!
//! The core trick (`fold`) is the same one a Pratt parser uses to build an
//! expression tree from a postfix stream: each instruction pops however
//! many operands its tree kind needs off a stack of pending subtrees and
//! pushes back the tree it just built. A statement boundary is reached
//! whenever that stack is supposed to be empty again (`StLocal`, `Pop`,
//! and every terminator); if it isn't, the bytecode was malformed.

use bc_ir::{BlockEdge, BlockId, Ir, Operand, Operator, TreeId, TreeKind};

use crate::error::LowerError;
use crate::stack::{StackFunction, StackInstruction};

/// Lower a whole function into fresh [`Ir`].
pub fn lower(func: &StackFunction) -> Result<Ir, LowerError> {
    if func.instructions.is_empty() {
        return Err(LowerError::EmptyFunction);
    }

    let mut ir = Ir::new(func.local_vars);
    let mut current_block = ir.first_block;
    let mut tree_stack: Vec<TreeId> = Vec::new();
    let last_i_ins = func.instructions.len() - 1;
    let mut i_stmt_start: u32 = 0;

    for i_ins in 0..func.instructions.len() {
        let ins = func.instructions[i_ins];
        let ins_idx = i_ins as u32;

        match ins {
            StackInstruction::LdLocal(i) => {
                fold(&mut ir, &mut tree_stack, current_block, TreeKind::LdLocal, 0, vec![Operand::Local(i)], ins_idx)?;
            }
            StackInstruction::StLocal(i) => {
                fold(&mut ir, &mut tree_stack, current_block, TreeKind::StLocal, 1, vec![Operand::Local(i)], ins_idx)?;
                close_statement(&mut ir, &mut tree_stack, current_block, &mut i_stmt_start, ins_idx)?;
            }
            StackInstruction::Push(v) => {
                fold(&mut ir, &mut tree_stack, current_block, TreeKind::Const, 0, vec![Operand::Imm(v)], ins_idx)?;
            }
            StackInstruction::Pop => {
                fold(&mut ir, &mut tree_stack, current_block, TreeKind::Discard, 1, Vec::new(), ins_idx)?;
                close_statement(&mut ir, &mut tree_stack, current_block, &mut i_stmt_start, ins_idx)?;
            }
            StackInstruction::Add => {
                fold(&mut ir, &mut tree_stack, current_block, TreeKind::BinOp, 2, vec![Operand::Op(Operator::Add)], ins_idx)?;
            }
            StackInstruction::Sub => {
                fold(&mut ir, &mut tree_stack, current_block, TreeKind::BinOp, 2, vec![Operand::Op(Operator::Sub)], ins_idx)?;
            }
            StackInstruction::Mul => {
                fold(&mut ir, &mut tree_stack, current_block, TreeKind::BinOp, 2, vec![Operand::Op(Operator::Mul)], ins_idx)?;
            }
            StackInstruction::Div => {
                fold(&mut ir, &mut tree_stack, current_block, TreeKind::BinOp, 2, vec![Operand::Op(Operator::Div)], ins_idx)?;
            }
            StackInstruction::Eq => {
                fold(&mut ir, &mut tree_stack, current_block, TreeKind::BinOp, 2, vec![Operand::Op(Operator::Eq)], ins_idx)?;
            }
            StackInstruction::Jmp(target) => {
                let target_block = resolve_target(&mut ir, target)?;
                fold(
                    &mut ir,
                    &mut tree_stack,
                    current_block,
                    TreeKind::Jmp,
                    0,
                    vec![Operand::Edge(BlockEdge::to(target_block))],
                    ins_idx,
                )?;
                close_statement(&mut ir, &mut tree_stack, current_block, &mut i_stmt_start, ins_idx)?;
                if i_ins == last_i_ins {
                    break;
                }
                current_block = resolve_target(&mut ir, ins_idx + 1)?;
            }
            StackInstruction::Branch(if_target, else_target) => {
                let if_block = resolve_target(&mut ir, if_target)?;
                let else_block = resolve_target(&mut ir, else_target)?;
                fold(
                    &mut ir,
                    &mut tree_stack,
                    current_block,
                    TreeKind::Branch,
                    1,
                    vec![Operand::Edge(BlockEdge::to(if_block)), Operand::Edge(BlockEdge::to(else_block))],
                    ins_idx,
                )?;
                close_statement(&mut ir, &mut tree_stack, current_block, &mut i_stmt_start, ins_idx)?;
                if i_ins == last_i_ins {
                    break;
                }
                current_block = resolve_target(&mut ir, ins_idx + 1)?;
            }
            StackInstruction::Ret => {
                fold(&mut ir, &mut tree_stack, current_block, TreeKind::Ret, 1, Vec::new(), ins_idx)?;
                let tree = tree_stack.pop().expect("fold always leaves exactly one tree");
                ir.append_tree(current_block, i_stmt_start, tree);
                i_stmt_start = ins_idx + 1;
                if i_ins == last_i_ins {
                    break;
                }
                current_block = resolve_target(&mut ir, ins_idx + 1)?;
            }
        }

        if i_ins == last_i_ins {
            return Err(LowerError::IllegalTerminator { ins_idx });
        }
    }

    ir.recompute_predecessors();
    ir.reindex();
    Ok(ir)
}

fn resolve_target(ir: &mut Ir, idx: u32) -> Result<BlockId, LowerError> {
    ir.get_or_insert_block_at(idx).ok_or(LowerError::SplitMidStatement { target_idx: idx })
}

fn fold(
    ir: &mut Ir,
    stack: &mut Vec<TreeId>,
    block: BlockId,
    kind: TreeKind,
    n: usize,
    operands: Vec<Operand>,
    ins_idx: u32,
) -> Result<(), LowerError> {
    if n > stack.len() {
        return Err(LowerError::NotEnoughOperands { ins_idx });
    }
    let split = stack.len() - n;
    let children = stack.split_off(split);
    let tree = ir.new_tree(kind, children, operands, block);
    stack.push(tree);
    Ok(())
}

/// Pop the tree the instruction just finished building, append it as the
/// current block's next statement, and check the fold stack emptied out;
/// every `StLocal`/`Pop`/terminator must consume everything it opened.
fn close_statement(
    ir: &mut Ir,
    stack: &mut Vec<TreeId>,
    block: BlockId,
    i_stmt_start: &mut u32,
    ins_idx: u32,
) -> Result<(), LowerError> {
    let tree = stack.pop().expect("fold always leaves exactly one tree");
    ir.append_tree(block, *i_stmt_start, tree);
    *i_stmt_start = ins_idx + 1;
    if !stack.is_empty() {
        return Err(LowerError::LeftoverOperands { ins_idx, remaining: stack.len() });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fib(n: i64) -> StackFunction {
        use StackInstruction::*;
        StackFunction::new(
            4,
            vec![
                Push(0), StLocal(0),
                Push(1), StLocal(1),
                Push(n), StLocal(3),
                // 6:
                LdLocal(3), Push(0), Eq, Branch(23, 10),
                // 10:
                LdLocal(0), LdLocal(1), Add, StLocal(2),
                LdLocal(1), StLocal(0),
                LdLocal(2), StLocal(1),
                LdLocal(3), Push(1), Sub, StLocal(3),
                Jmp(6),
                // 23:
                LdLocal(0), Ret,
            ],
        )
    }

    #[test]
    fn lowers_fibonacci_into_three_blocks() {
        let ir = lower(&fib(10)).unwrap();
        assert_eq!(ir.block_ids().len(), 3);
    }

    #[test]
    fn straight_line_function_lowers_to_one_block() {
        use StackInstruction::*;
        let func = StackFunction::new(1, vec![Push(1), Push(2), Add, StLocal(0), LdLocal(0), Ret]);
        let ir = lower(&func).unwrap();
        assert_eq!(ir.block_ids().len(), 1);
        assert_eq!(ir.terminator_kind(ir.first_block), TreeKind::Ret);
    }

    #[test]
    fn backward_jump_splits_the_target_block() {
        let ir = lower(&fib(3)).unwrap();
        let blocks = ir.block_ids();
        assert_eq!(blocks.len(), 3);
        // the block holding the loop header's Branch ends in Branch, not Jmp,
        // meaning the backward `Jmp(6)` landed inside it and split it.
        assert_eq!(ir.terminator_kind(blocks[0]), TreeKind::Branch);
    }

    #[test]
    fn empty_function_is_rejected() {
        let func = StackFunction::new(0, Vec::new());
        assert_eq!(lower(&func), Err(LowerError::EmptyFunction));
    }

    #[test]
    fn non_terminator_as_last_instruction_is_rejected() {
        use StackInstruction::*;
        let func = StackFunction::new(1, vec![Push(1), StLocal(0), Push(2)]);
        assert_eq!(lower(&func), Err(LowerError::IllegalTerminator { ins_idx: 2 }));
    }

    #[test]
    fn stlocal_with_no_pending_value_is_rejected() {
        use StackInstruction::*;
        let func = StackFunction::new(1, vec![StLocal(0), Ret]);
        assert_eq!(lower(&func), Err(LowerError::NotEnoughOperands { ins_idx: 0 }));
    }

    #[test]
    fn push_without_consuming_store_leaves_operands() {
        use StackInstruction::*;
        let func = StackFunction::new(1, vec![Push(1), Push(2), Ret]);
        // Ret only consumes 1 value, leaving 1 behind.
        assert_eq!(lower(&func), Err(LowerError::LeftoverOperands { ins_idx: 2, remaining: 1 }));
    }
}
