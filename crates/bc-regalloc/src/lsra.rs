//! Forward linear-scan register allocation.
//!
//! Processes blocks breadth-first from the entry, adopting a predecessor's
//! active-out set as the block's active-in set so that register choices
//! stay consistent across an edge without the allocator ever rewriting a
//! register at the edge itself; that reconciliation is the interpreter's
//! job (`bc-interp::jump`).

use std::collections::{HashMap, HashSet, VecDeque};

use bc_ir::{
    ActiveInOut, BlockId, Ir, LastUse, Operand, PrimaryMap, RegMove, RegRestore, RegSpill, Register, TreeId, TreeKind,
    Value, ValueId, ValueOf,
};

use crate::error::AllocError;

/// Run forward LSRA over `ir` with `num_regs` physical registers.
pub fn allocate(ir: &mut Ir, num_regs: u32) -> Result<(), AllocError> {
    Lsra::new(num_regs).run(ir)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FirstWrite {
    /// The local is already defined on entry to the block (live-in from a
    /// predecessor), so the first `StLocal` to it still needs a restore of
    /// whatever register state is expected on the incoming edge.
    External,
    /// This tree is the literal first write to the local within the block;
    /// its activation must not emit a restore (there is nothing meaningful
    /// to restore yet).
    Tree(TreeId),
}

struct Lsra {
    registers: Vec<Register>,
    values: PrimaryMap<ValueId, Value>,
    var_ids: Vec<ValueId>,
    var_first_writes: HashMap<u32, FirstWrite>,
    active_vals: Vec<ValueId>,
    tree_vals: Vec<ValueId>,
    blocks_to_process: VecDeque<BlockId>,
    queued: HashSet<BlockId>,
    current_tree: Option<TreeId>,
}

impl Lsra {
    fn new(num_regs: u32) -> Self {
        Lsra {
            registers: vec![Register::free(); num_regs as usize],
            values: PrimaryMap::new(),
            var_ids: Vec::new(),
            var_first_writes: HashMap::new(),
            active_vals: Vec::new(),
            tree_vals: Vec::new(),
            blocks_to_process: VecDeque::new(),
            queued: HashSet::new(),
            current_tree: None,
        }
    }

    fn cur(&self) -> TreeId {
        self.current_tree.expect("current_tree is set for the duration of the main scan")
    }

    fn free_active_vals(&mut self, ir: &Ir) {
        let cur_idx = ir.trees[self.cur()].ir_idx;
        let mut kept = Vec::with_capacity(self.active_vals.len());
        for v in self.active_vals.drain(..) {
            let expire = match self.values[v].last_use {
                Some(LastUse::Block(_)) => false,
                None => true,
                Some(LastUse::Tree(t)) => ir.trees[t].ir_idx <= cur_idx,
            };
            if expire {
                let r = self.values[v].active_in.take().expect("active value has a register");
                self.registers[r as usize].active_val = None;
            } else {
                kept.push(v);
            }
        }
        self.active_vals = kept;
    }

    fn free_tree_vals(&mut self, ir: &Ir) {
        let cur_idx = ir.trees[self.cur()].ir_idx;
        self.tree_vals.retain(|&v| match self.values[v].of {
            ValueOf::Tree(t) => ir.trees[t].ir_idx >= cur_idx,
            ValueOf::Local(_) => true,
        });
    }

    fn get_tree_val(&self, ir: &Ir, tree: TreeId) -> ValueId {
        if ir.trees[tree].kind == TreeKind::LdLocal {
            let local = ir.trees[tree].operands[0].as_local().expect("LdLocal carries a local operand");
            return self.var_ids[local as usize];
        }
        self.tree_vals
            .iter()
            .copied()
            .find(|&v| matches!(self.values[v].of, ValueOf::Tree(t) if t == tree))
            .expect("a tree's value must still be tracked when its consumer runs")
    }

    /// Bring `val` into a register. If none is free, spills the active
    /// value whose next use is furthest away (block-anchored uses rank
    /// last among eviction candidates; see `DESIGN.md`).
    fn activate(&mut self, ir: &mut Ir, val: ValueId, restore: bool, forbid_restores: &[u32]) -> Result<(), AllocError> {
        debug_assert!(self.values[val].active_in.is_none());

        for reg_i in 0..self.registers.len() as u32 {
            if restore && forbid_restores.contains(&reg_i) {
                continue;
            }
            if self.registers[reg_i as usize].active_val.is_none() {
                self.values[val].active_in = Some(reg_i);
                self.registers[reg_i as usize].active_val = Some(val);
                self.active_vals.push(val);
                if restore {
                    ir.trees[self.cur()].pre_restores.push(RegRestore { value: self.values[val].of, reg: reg_i });
                }
                return Ok(());
            }
        }

        let mut best: Option<ValueId> = None;
        for &cand in &self.active_vals {
            let cand_reg = self.values[cand].active_in.expect("active value has a register");
            if restore && forbid_restores.contains(&cand_reg) {
                continue;
            }
            best = Some(match best {
                None => cand,
                Some(b) => {
                    let cand_is_block = matches!(self.values[cand].last_use, Some(LastUse::Block(_)));
                    if cand_is_block {
                        b
                    } else if matches!(self.values[b].last_use, Some(LastUse::Block(_))) {
                        cand
                    } else {
                        let b_idx = self.values[b].last_use.unwrap().ir_idx(&ir.trees).unwrap();
                        let c_idx = self.values[cand].last_use.unwrap().ir_idx(&ir.trees).unwrap();
                        if c_idx > b_idx {
                            cand
                        } else {
                            b
                        }
                    }
                }
            });
        }
        let best = best.ok_or(AllocError::NoSpillCandidate { ir_idx: ir.trees[self.cur()].ir_idx })?;
        let best_reg = self.values[best].active_in.expect("active value has a register");

        ir.trees[self.cur()].pre_spills.push(RegSpill { value: self.values[best].of, reg: best_reg });

        self.values[val].active_in = Some(best_reg);
        self.registers[best_reg as usize].active_val = Some(val);
        self.active_vals.push(val);

        if restore {
            ir.trees[self.cur()].pre_restores.push(RegRestore { value: self.values[val].of, reg: best_reg });
        }

        self.values[best].active_in = None;
        self.active_vals.retain(|&v| v != best);
        Ok(())
    }

    fn reset_var_vals_and_regs(&mut self) {
        debug_assert!(self.tree_vals.is_empty(), "tree temporaries never escape a block");
        for i in 0..self.var_ids.len() {
            let v = self.var_ids[i];
            if let Some(r) = self.values[v].active_in.take() {
                self.registers[r as usize].active_val = None;
                self.active_vals.retain(|&x| x != v);
            }
            self.values[v].last_use = None;
        }
        self.var_first_writes.clear();
        debug_assert!(self.active_vals.is_empty());
        debug_assert!(self.registers.iter().all(|r| r.active_val.is_none()));
    }

    fn scan_st_local(&mut self, ir: &mut Ir, tree: TreeId) -> Result<(), AllocError> {
        let child = ir.trees[tree].children[0];
        let src_val = self.get_tree_val(ir, child);
        let local = ir.trees[tree].operands[0].as_local().expect("StLocal carries a local operand");
        let dst_val = self.var_ids[local as usize];

        self.var_first_writes.entry(local).or_insert(FirstWrite::Tree(tree));

        let src_reg = ir.trees[child].reg.expect("operand is materialized into a register before its consumer runs");

        if self.values[dst_val].active_in.is_none() {
            let restore = self.var_first_writes[&local] != FirstWrite::Tree(tree);
            self.activate(ir, dst_val, restore, &[src_reg])?;
        }
        let dst_reg = self.values[dst_val].active_in.expect("activate always assigns a register");
        ir.trees[tree].operands.push(Operand::Reg(dst_reg));

        if src_reg != dst_reg {
            ir.trees[tree].post_moves.push(RegMove {
                val_from: self.values[src_val].of,
                reg_from: src_reg,
                val_to: self.values[dst_val].of,
                reg_to: dst_reg,
            });
        }
        Ok(())
    }

    fn run(mut self, ir: &mut Ir) -> Result<(), AllocError> {
        for i in 0..ir.local_vars {
            let id = self.values.push(Value::new(ValueOf::Local(i)));
            self.var_ids.push(id);
        }

        self.blocks_to_process.push_back(ir.first_block);
        self.queued.insert(ir.first_block);

        while let Some(block) = self.blocks_to_process.pop_front() {
            self.reset_var_vals_and_regs();

            let preds = ir.blocks[block].predecessors.clone();
            let mut selected_predecessor = None;
            for pred in &preds {
                let src = pred.source.expect("recompute_predecessors fills in every edge's source");
                if ir.blocks[src].active_out_set.is_some() {
                    selected_predecessor = Some(*pred);
                    break;
                }
            }

            for pred in &preds {
                let src = pred.source.unwrap();
                if let Some(alive_in) = ir.blocks[src].alive_in.clone() {
                    for local in alive_in {
                        self.var_first_writes.insert(local, FirstWrite::External);
                    }
                }
            }

            let out_edges = ir.outgoing_edges(block);
            for edge in &out_edges {
                if let Some(alive_in) = ir.blocks[edge.target].alive_in.clone() {
                    for local in alive_in {
                        self.values[self.var_ids[local as usize]].last_use = Some(LastUse::Block(edge.target));
                    }
                }
            }

            for tree in ir.block_tree_reverse_execution_order(block) {
                if ir.trees[tree].kind == TreeKind::LdLocal {
                    let local = ir.trees[tree].operands[0].as_local().unwrap();
                    let vid = self.var_ids[local as usize];
                    if self.values[vid].last_use.is_none() {
                        let parent = ir.trees[tree].parent.expect("LdLocal is always consumed by a parent tree");
                        self.values[vid].last_use = Some(LastUse::Tree(parent));
                    }
                }
            }

            if let Some(pred) = selected_predecessor {
                let src = pred.source.unwrap();
                let out_set = ir.blocks[src].active_out_set.clone().expect("selected predecessor has an active-out set");
                for entry in &out_set {
                    let local = entry.value.as_local().expect("active-out entries are always locals");
                    let vid = self.var_ids[local as usize];
                    self.values[vid].active_in = Some(entry.reg);
                    self.registers[entry.reg as usize].active_val = Some(vid);
                    self.active_vals.push(vid);
                }
                ir.blocks[block].active_in_set = Some(out_set);
            } else {
                ir.blocks[block].active_in_set = Some(Vec::new());
            }

            for tree in ir.block_tree_execution_order(block) {
                self.current_tree = Some(tree);
                log::trace!("lsra: scanning tree t{} ({:?})", ir.trees[tree].ir_idx, ir.trees[tree].kind);

                let children = ir.trees[tree].children.clone();
                for child in &children {
                    let tv = self.get_tree_val(ir, *child);
                    if self.values[tv].active_in.is_none() {
                        self.activate(ir, tv, true, &[])?;
                    }
                }

                self.free_active_vals(ir);

                match ir.trees[tree].kind {
                    TreeKind::StLocal => self.scan_st_local(ir, tree)?,
                    TreeKind::LdLocal => {
                        let local = ir.trees[tree].operands[0].as_local().unwrap();
                        let vid = self.var_ids[local as usize];
                        if self.values[vid].active_in.is_none() {
                            self.activate(ir, vid, true, &[])?;
                        }
                        ir.trees[tree].reg = self.values[vid].active_in;
                    }
                    _ => {
                        if let Some(parent) = ir.trees[tree].parent {
                            let vid = self.values.push(Value {
                                of: ValueOf::Tree(tree),
                                active_in: None,
                                last_use: Some(LastUse::Tree(parent)),
                            });
                            self.activate(ir, vid, false, &[])?;
                            ir.trees[tree].reg = self.values[vid].active_in;
                            self.tree_vals.push(vid);
                        }
                    }
                }

                self.free_tree_vals(ir);
            }

            let mut active_out = Vec::new();
            for &v in &self.active_vals {
                debug_assert!(matches!(self.values[v].of, ValueOf::Local(_)), "tree temporaries never escape a block");
                active_out.push(ActiveInOut { value: self.values[v].of, reg: self.values[v].active_in.unwrap() });
            }
            ir.blocks[block].active_out_set = Some(active_out);

            for edge in ir.outgoing_edges(block) {
                if ir.blocks[edge.target].active_in_set.is_none() && self.queued.insert(edge.target) {
                    self.blocks_to_process.push_back(edge.target);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bc_ir::{BlockEdge, Operator};

    use super::*;

    fn konst(ir: &mut Ir, block: BlockId, n: i64) -> TreeId {
        ir.new_tree(TreeKind::Const, Vec::new(), vec![Operand::Imm(n)], block)
    }

    fn straight_line_ir(num_locals: u32) -> Ir {
        // local0 = 1; local1 = local0; ret local1
        let mut ir = Ir::new(num_locals);
        let b = ir.first_block;
        let c1 = konst(&mut ir, b, 1);
        let st0 = ir.new_tree(TreeKind::StLocal, vec![c1], vec![Operand::Local(0)], b);
        ir.append_tree(b, 0, st0);

        let ld0 = ir.new_tree(TreeKind::LdLocal, Vec::new(), vec![Operand::Local(0)], b);
        let st1 = ir.new_tree(TreeKind::StLocal, vec![ld0], vec![Operand::Local(1)], b);
        ir.append_tree(b, 2, st1);

        let ld1 = ir.new_tree(TreeKind::LdLocal, Vec::new(), vec![Operand::Local(1)], b);
        let ret = ir.new_tree(TreeKind::Ret, vec![ld1], Vec::new(), b);
        ir.append_tree(b, 4, ret);

        ir.recompute_predecessors();
        ir.reindex();
        ir
    }

    #[test]
    fn allocates_straight_line_function_without_spills() {
        let mut ir = straight_line_ir(2);
        allocate(&mut ir, 4).unwrap();
        let b = ir.first_block;
        assert!(ir.blocks[b].active_in_set.as_ref().unwrap().is_empty());
    }

    #[test]
    fn first_write_suppresses_restore() {
        let mut ir = straight_line_ir(2);
        allocate(&mut ir, 4).unwrap();
        let b = ir.first_block;
        let first_stmt = ir.blocks[b].first_stmt.unwrap();
        let st0 = ir.stmts[first_stmt].tree;
        assert_eq!(ir.trees[st0].kind, TreeKind::StLocal);
        // local0 is never live-in here (no predecessors at all), so its
        // very first write must not carry a pre-restore.
        assert!(ir.trees[st0].pre_restores.is_empty());
    }

    #[test]
    fn too_few_registers_reports_no_spill_candidate() {
        let mut ir = Ir::new(1);
        let b = ir.first_block;
        let c1 = konst(&mut ir, b, 1);
        let c2 = konst(&mut ir, b, 2);
        let add = ir.new_tree(TreeKind::BinOp, vec![c1, c2], vec![Operand::Op(Operator::Add)], b);
        let c3 = konst(&mut ir, b, 3);
        let add2 = ir.new_tree(TreeKind::BinOp, vec![add, c3], vec![Operand::Op(Operator::Add)], b);
        let ret = ir.new_tree(TreeKind::Ret, vec![add2], Vec::new(), b);
        ir.append_tree(b, 0, ret);
        ir.recompute_predecessors();
        ir.reindex();

        // one register can't even hold both operands of the inner Add.
        let result = allocate(&mut ir, 1);
        assert!(result.is_err());
    }

    #[test]
    fn branch_joins_reuse_predecessor_register_assignment() {
        let mut ir = Ir::new(1);
        let entry = ir.first_block;
        let c0 = konst(&mut ir, entry, 1);
        let if_target = ir.get_or_insert_block_at(100).unwrap();
        let else_target = ir.get_or_insert_block_at(200).unwrap();
        let branch = ir.new_tree(
            TreeKind::Branch,
            vec![c0],
            vec![Operand::Edge(BlockEdge::to(if_target)), Operand::Edge(BlockEdge::to(else_target))],
            entry,
        );
        ir.append_tree(entry, 0, branch);

        let ld_if = ir.new_tree(TreeKind::LdLocal, Vec::new(), vec![Operand::Local(0)], if_target);
        let ret_if = ir.new_tree(TreeKind::Ret, vec![ld_if], Vec::new(), if_target);
        ir.append_tree(if_target, 100, ret_if);

        let ld_else = ir.new_tree(TreeKind::LdLocal, Vec::new(), vec![Operand::Local(0)], else_target);
        let ret_else = ir.new_tree(TreeKind::Ret, vec![ld_else], Vec::new(), else_target);
        ir.append_tree(else_target, 200, ret_else);

        ir.recompute_predecessors();
        ir.recompute_alive_sets();
        ir.reindex();

        allocate(&mut ir, 4).unwrap();
        assert!(ir.blocks[if_target].active_in_set.is_some());
        assert!(ir.blocks[else_target].active_in_set.is_some());
    }
}
