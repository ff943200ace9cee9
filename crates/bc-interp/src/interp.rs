//! Tree-walking interpreter over the annotated IR.
//!
//! Walks one block's statements in execution order, applying each tree's
//! `pre_*` records, the tree's own semantic effect, then its `post_*`
//! records; on a terminator it reconciles the physical register mapping
//! across the edge (`jump`) before continuing in the target block. This is
//! the thing allocation exists to be checked against: the return value
//! must not depend on how many registers were available, only on whether
//! allocation succeeded at all.

use std::collections::HashMap;

use bc_ir::{BlockId, Ir, Operator, RegMove, RegRestore, RegSpill, TreeId, TreeKind, ValueOf};

use crate::error::InterpError;

enum Control {
    Return(i64),
    Jump(BlockId),
}

/// Executes an allocated `Ir` and reports the number of allocation records
/// it had to act on, alongside the returned value.
pub struct Interpreter {
    registers: Vec<i64>,
    local_spill: HashMap<u32, i64>,
    tree_spill: HashMap<u32, i64>,
    pub spill_count: u64,
    pub restore_count: u64,
    pub move_count: u64,
}

impl Interpreter {
    pub fn new(num_regs: u32) -> Self {
        Interpreter {
            registers: vec![0; num_regs as usize],
            local_spill: HashMap::new(),
            tree_spill: HashMap::new(),
            spill_count: 0,
            restore_count: 0,
            move_count: 0,
        }
    }

    fn check_reg(&self, reg: u32) -> Result<(), InterpError> {
        if reg as usize >= self.registers.len() {
            return Err(InterpError::RegisterOutOfRange { reg, num_regs: self.registers.len() as u32 });
        }
        Ok(())
    }

    fn spill_key(ir: &Ir, value: ValueOf) -> SpillKey {
        match value {
            ValueOf::Local(i) => SpillKey::Local(i),
            ValueOf::Tree(t) => SpillKey::Tree(ir.trees[t].ir_idx),
        }
    }

    fn do_spill(&mut self, ir: &Ir, value: ValueOf, reg: u32) {
        let v = self.registers[reg as usize];
        match Self::spill_key(ir, value) {
            SpillKey::Local(i) => {
                self.local_spill.insert(i, v);
            }
            SpillKey::Tree(idx) => {
                self.tree_spill.insert(idx, v);
            }
        }
        self.spill_count += 1;
    }

    fn do_restore(&mut self, ir: &Ir, value: ValueOf, reg: u32) {
        let v = match Self::spill_key(ir, value) {
            SpillKey::Local(i) => *self.local_spill.get(&i).expect("a local is only restored after being spilled"),
            SpillKey::Tree(idx) => *self.tree_spill.get(&idx).expect("a tree temporary is only restored after being spilled"),
        };
        self.registers[reg as usize] = v;
        self.restore_count += 1;
    }

    fn do_move(&mut self, reg_from: u32, reg_to: u32) {
        self.registers[reg_to as usize] = self.registers[reg_from as usize];
        self.move_count += 1;
    }

    fn apply_spill(&mut self, ir: &Ir, r: RegSpill) -> Result<(), InterpError> {
        self.check_reg(r.reg)?;
        self.do_spill(ir, r.value, r.reg);
        Ok(())
    }

    fn apply_restore(&mut self, ir: &Ir, r: RegRestore) -> Result<(), InterpError> {
        self.check_reg(r.reg)?;
        self.do_restore(ir, r.value, r.reg);
        Ok(())
    }

    fn apply_move(&mut self, r: RegMove) -> Result<(), InterpError> {
        self.check_reg(r.reg_from)?;
        self.check_reg(r.reg_to)?;
        self.do_move(r.reg_from, r.reg_to);
        Ok(())
    }

    fn exec(&mut self, ir: &Ir, tree: TreeId) -> Result<Option<Control>, InterpError> {
        let data = &ir.trees[tree];
        match data.kind {
            TreeKind::Const => {
                let n = data.operands[0].as_imm().expect("Const carries an Imm operand");
                let reg = data.reg.expect("Const always has a parent and is allocated a register");
                self.check_reg(reg)?;
                self.registers[reg as usize] = n;
                Ok(None)
            }
            TreeKind::BinOp => {
                let op = data.operands[0].as_op().expect("BinOp carries an Operator operand");
                let a_reg = ir.trees[data.children[0]].reg.expect("BinOp operand is allocated a register");
                let b_reg = ir.trees[data.children[1]].reg.expect("BinOp operand is allocated a register");
                self.check_reg(a_reg)?;
                self.check_reg(b_reg)?;
                let a = self.registers[a_reg as usize];
                let b = self.registers[b_reg as usize];
                let result = match op {
                    Operator::Add => a + b,
                    Operator::Sub => a - b,
                    Operator::Mul => a * b,
                    Operator::Div => floor_div(a, b),
                    Operator::Eq => {
                        if a == b {
                            1
                        } else {
                            0
                        }
                    }
                };
                let reg = data.reg.expect("BinOp always has a parent and is allocated a register");
                self.check_reg(reg)?;
                self.registers[reg as usize] = result;
                Ok(None)
            }
            TreeKind::LdLocal | TreeKind::StLocal | TreeKind::Discard => Ok(None),
            TreeKind::Ret => {
                let reg = ir.trees[data.children[0]].reg.expect("Ret operand is allocated a register");
                self.check_reg(reg)?;
                Ok(Some(Control::Return(self.registers[reg as usize])))
            }
            TreeKind::Branch => {
                let cond_reg = ir.trees[data.children[0]].reg.expect("Branch condition is allocated a register");
                self.check_reg(cond_reg)?;
                let taken = self.registers[cond_reg as usize] == 1;
                let t = data.operands[0].as_edge().expect("Branch carries two Edge operands").target;
                let e = data.operands[1].as_edge().expect("Branch carries two Edge operands").target;
                Ok(Some(Control::Jump(if taken { t } else { e })))
            }
            TreeKind::Jmp => {
                let t = data.operands[0].as_edge().expect("Jmp carries an Edge operand").target;
                Ok(Some(Control::Jump(t)))
            }
        }
    }

    /// Runs one tree's `pre_*` records, its semantic effect, then its
    /// `post_*` records. For a `Jmp`/`Branch` terminator, `jump()` *is* the
    /// semantic effect (matching the reference `interpreter.py`), so it
    /// runs before the terminator's `post_*` records, not after: a
    /// terminator's post-spill/restore/move targets the register file as it
    /// stands once the edge has already been reconciled.
    fn step(&mut self, ir: &Ir, block: BlockId, tree: TreeId) -> Result<Option<Control>, InterpError> {
        log::trace!("interp: executing tree t{} ({:?})", ir.trees[tree].ir_idx, ir.trees[tree].kind);

        for r in ir.trees[tree].pre_spills.clone() {
            self.apply_spill(ir, r)?;
        }
        for r in ir.trees[tree].pre_restores.clone() {
            self.apply_restore(ir, r)?;
        }
        for r in ir.trees[tree].pre_moves.clone() {
            self.apply_move(r)?;
        }

        let control = self.exec(ir, tree)?;

        if let Some(Control::Jump(target)) = control {
            self.jump(ir, block, target)?;
        }

        for r in ir.trees[tree].post_spills.clone() {
            self.apply_spill(ir, r)?;
        }
        for r in ir.trees[tree].post_restores.clone() {
            self.apply_restore(ir, r)?;
        }
        for r in ir.trees[tree].post_moves.clone() {
            self.apply_move(r)?;
        }

        Ok(control)
    }

    /// Cross-edge reconciliation: spill values the source block carried
    /// but the target doesn't expect, restore values the target expects
    /// but the source didn't carry, and move registers for values both
    /// sides carry but in different registers.
    fn jump(&mut self, ir: &Ir, from: BlockId, to: BlockId) -> Result<(), InterpError> {
        log::trace!("interp: jump {:?} -> {:?}", from, to);

        let a = ir.blocks[from].active_out_set.clone().expect("source block has been allocated");
        let b = ir.blocks[to].active_in_set.clone().expect("target block has been allocated");

        for entry in &a {
            if !b.iter().any(|e| e.value == entry.value) {
                self.check_reg(entry.reg)?;
                self.do_spill(ir, entry.value, entry.reg);
            }
        }
        for entry in &b {
            if !a.iter().any(|e| e.value == entry.value) {
                self.check_reg(entry.reg)?;
                self.do_restore(ir, entry.value, entry.reg);
            }
        }
        for entry_b in &b {
            if let Some(entry_a) = a.iter().find(|e| e.value == entry_b.value) {
                self.check_reg(entry_a.reg)?;
                self.check_reg(entry_b.reg)?;
                if entry_a.reg != entry_b.reg {
                    self.do_move(entry_a.reg, entry_b.reg);
                }
            }
        }
        Ok(())
    }

    /// Run the interpreter from the IR's entry block to a `Ret`. Leaves
    /// `self` intact afterwards so callers can inspect the spill/restore/move
    /// counters as a cost metric (see `bc-cli`, which prints them).
    pub fn run(&mut self, ir: &Ir) -> Result<i64, InterpError> {
        let mut block = ir.first_block;
        loop {
            let mut control = None;
            for tree in ir.block_tree_execution_order(block) {
                if let Some(c) = self.step(ir, block, tree)? {
                    control = Some(c);
                    break;
                }
            }
            match control.expect("a block always ends in a terminator") {
                Control::Return(v) => return Ok(v),
                Control::Jump(target) => block = target,
            }
        }
    }
}

enum SpillKey {
    Local(u32),
    Tree(u32),
}

fn floor_div(a: i64, b: i64) -> i64 {
    let q = a / b;
    let r = a % b;
    if r != 0 && (r < 0) != (b < 0) {
        q - 1
    } else {
        q
    }
}

/// Convenience entry point: allocate a fresh interpreter and run it.
pub fn interpret(ir: &Ir, num_regs: u32) -> Result<i64, InterpError> {
    Interpreter::new(num_regs).run(ir)
}
