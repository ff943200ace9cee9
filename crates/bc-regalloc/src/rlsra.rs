//! Reverse linear-scan register allocation.
//!
//! Runs backward from every block with no successors, scanning each
//! block's trees in reverse execution order. Every "spill" of the forward
//! scan becomes a restore here and vice versa; physically the same
//! memory traffic, just discovered walking the other direction (see
//! `DESIGN.md` for why this direction can produce a tighter allocation in
//! loop-heavy code than the forward scan).

use std::collections::{BTreeSet, HashSet, VecDeque};

use bc_ir::{ActiveInOut, BlockId, Ir, LastUse, Operand, PrimaryMap, RegMove, RegRestore, RegSpill, Register, TreeId, TreeKind, Value, ValueId, ValueOf};

use crate::error::AllocError;

/// Run reverse LSRA over `ir` with `num_regs` physical registers.
pub fn allocate(ir: &mut Ir, num_regs: u32) -> Result<(), AllocError> {
    Rlsra::new(num_regs).run(ir)
}

struct Rlsra {
    registers: Vec<Register>,
    values: PrimaryMap<ValueId, Value>,
    var_ids: Vec<ValueId>,
    active_vals: Vec<ValueId>,
    tree_vals: Vec<ValueId>,
    blocks_to_process: VecDeque<BlockId>,
    queued: HashSet<BlockId>,
    current_tree: Option<TreeId>,
}

impl Rlsra {
    fn new(num_regs: u32) -> Self {
        Rlsra {
            registers: vec![Register::free(); num_regs as usize],
            values: PrimaryMap::new(),
            var_ids: Vec::new(),
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

    /// Spill `val` (in reverse-scan terms, this appends a *restore*: see
    /// the module doc).
    fn spill(&mut self, ir: &mut Ir, val: ValueId) {
        let reg = self.values[val].active_in.expect("spilled value is active");
        ir.trees[self.cur()].post_restores.push(RegRestore { value: self.values[val].of, reg });
        self.registers[reg as usize].active_val = None;
        self.values[val].active_in = None;
        self.active_vals.retain(|&v| v != val);
    }

    fn activate(&mut self, ir: &mut Ir, val: ValueId) -> Result<(), AllocError> {
        for reg_i in 0..self.registers.len() as u32 {
            if self.registers[reg_i as usize].active_val.is_none() {
                self.values[val].active_in = Some(reg_i);
                self.registers[reg_i as usize].active_val = Some(val);
                self.active_vals.push(val);
                return Ok(());
            }
        }

        let val_idx = self.values[val]
            .last_use
            .expect("value being activated always has a last use")
            .ir_idx(&ir.trees)
            .expect("activation targets in RLSRA are always tree-anchored");

        let mut best: Option<ValueId> = None;
        for &cand in &self.active_vals {
            let cand_idx = self.values[cand]
                .last_use
                .expect("active values always have a last use")
                .ir_idx(&ir.trees)
                .expect("active values in RLSRA are always tree-anchored");
            if cand_idx <= val_idx {
                continue;
            }
            best = Some(match best {
                None => cand,
                Some(b) => {
                    let b_idx = self.values[b].last_use.unwrap().ir_idx(&ir.trees).unwrap();
                    if cand_idx > b_idx { cand } else { b }
                }
            });
        }
        let best = best.ok_or(AllocError::NoSpillCandidate { ir_idx: ir.trees[self.cur()].ir_idx })?;
        let reg = self.values[best].active_in.expect("spill candidate is active");
        self.spill(ir, best);

        self.values[val].active_in = Some(reg);
        self.registers[reg as usize].active_val = Some(val);
        self.active_vals.push(val);
        Ok(())
    }

    /// Activate a local variable read (an `LdLocal` child subtree), wiring
    /// its result straight to the local's own tracked value rather than a
    /// disposable tree temporary.
    fn use_local(&mut self, ir: &mut Ir, local: u32, subtree: TreeId) -> Result<(), AllocError> {
        let vid = self.var_ids[local as usize];
        let had_prior_use = self.values[vid].last_use.is_some();
        if self.values[vid].active_in.is_none() {
            let saved = self.current_tree;
            self.current_tree = Some(subtree);
            let result = self.activate(ir, vid);
            self.current_tree = saved;
            result?;
            if had_prior_use {
                let reg = self.values[vid].active_in.expect("activate always assigns a register");
                ir.trees[subtree].post_spills.push(RegSpill { value: self.values[vid].of, reg });
            }
        }
        ir.trees[subtree].reg = self.values[vid].active_in;
        self.values[vid].last_use = Some(LastUse::Tree(subtree));
        Ok(())
    }

    fn get_current_tree_val(&self) -> Option<ValueId> {
        let cur = self.cur();
        self.tree_vals.iter().copied().find(|&v| matches!(self.values[v].of, ValueOf::Tree(t) if t == cur))
    }

    fn scan_st_local(&mut self, ir: &mut Ir, tree: TreeId) -> Result<(), AllocError> {
        let local = ir.trees[tree].operands[0].as_local().expect("StLocal carries a local operand");
        let dst = self.var_ids[local as usize];
        let child = ir.trees[tree].children[0];

        if ir.trees[child].kind == TreeKind::LdLocal {
            let src_local = ir.trees[child].operands[0].as_local().expect("LdLocal carries a local operand");
            self.use_local(ir, src_local, child)?;
            let src_val = self.var_ids[src_local as usize];
            let src_reg = ir.trees[child].reg.expect("use_local always assigns a register");

            if let Some(dst_reg) = self.values[dst].active_in {
                ir.trees[tree].post_moves.push(RegMove {
                    val_from: self.values[src_val].of,
                    reg_from: src_reg,
                    val_to: self.values[dst].of,
                    reg_to: dst_reg,
                });
                self.registers[dst_reg as usize].active_val = None;
                self.values[dst].active_in = None;
                self.active_vals.retain(|&v| v != dst);
            } else if self.values[dst].last_use.is_some() {
                ir.trees[tree].post_spills.push(RegSpill { value: self.values[dst].of, reg: src_reg });
            }
        } else if let Some(dst_reg) = self.values[dst].active_in {
            let tv = self.values.push(Value { of: ValueOf::Tree(child), active_in: Some(dst_reg), last_use: Some(LastUse::Tree(tree)) });
            self.registers[dst_reg as usize].active_val = Some(tv);
            ir.trees[tree].operands.push(Operand::Reg(dst_reg));
            self.active_vals.push(tv);
            self.tree_vals.push(tv);

            self.values[dst].active_in = None;
            self.active_vals.retain(|&v| v != dst);
        } else {
            let tv = self.values.push(Value { of: ValueOf::Tree(child), active_in: None, last_use: Some(LastUse::Tree(tree)) });
            self.activate(ir, tv)?;
            self.tree_vals.push(tv);
            let reg = self.values[tv].active_in.expect("activate always assigns a register");
            ir.trees[tree].operands.push(Operand::Reg(reg));
            ir.trees[tree].post_spills.push(RegSpill { value: self.values[tv].of, reg });
        }
        Ok(())
    }

    fn scan_generic(&mut self, ir: &mut Ir, tree: TreeId) -> Result<(), AllocError> {
        if let Some(tv) = self.get_current_tree_val() {
            match self.values[tv].active_in {
                Some(reg) => {
                    ir.trees[tree].reg = Some(reg);
                    self.registers[reg as usize].active_val = None;
                    self.values[tv].active_in = None;
                }
                None => {
                    self.activate(ir, tv)?;
                    let reg = self.values[tv].active_in.expect("activate always assigns a register");
                    ir.trees[tree].reg = Some(reg);
                    ir.trees[tree].post_spills.push(RegSpill { value: self.values[tv].of, reg });
                    self.registers[reg as usize].active_val = None;
                    self.values[tv].active_in = None;
                }
            }
            self.active_vals.retain(|&v| v != tv);
            self.tree_vals.retain(|&v| v != tv);
        }

        let children = ir.trees[tree].children.clone();
        for child in children {
            if ir.trees[child].kind == TreeKind::LdLocal {
                let local = ir.trees[child].operands[0].as_local().expect("LdLocal carries a local operand");
                self.use_local(ir, local, child)?;
            } else {
                let vid = self.values.push(Value { of: ValueOf::Tree(child), active_in: None, last_use: Some(LastUse::Tree(tree)) });
                self.activate(ir, vid)?;
                self.tree_vals.push(vid);
            }
        }
        Ok(())
    }

    fn run(mut self, ir: &mut Ir) -> Result<(), AllocError> {
        for i in 0..ir.local_vars {
            let id = self.values.push(Value::new(ValueOf::Local(i)));
            self.var_ids.push(id);
        }

        for block in ir.block_ids() {
            if ir.terminator_kind(block) == TreeKind::Ret && self.queued.insert(block) {
                self.blocks_to_process.push_back(block);
            }
        }

        while let Some(block) = self.blocks_to_process.pop_front() {
            for i in 0..ir.local_vars {
                let vid = self.var_ids[i as usize];
                self.values[vid].active_in = None;
                self.values[vid].last_use = None;
            }
            for r in &mut self.registers {
                r.active_val = None;
            }
            self.active_vals.clear();
            debug_assert!(self.tree_vals.is_empty(), "tree temporaries never escape a block");

            let out_edges = ir.outgoing_edges(block);
            let mut selected_successor = None;
            for edge in &out_edges {
                if ir.blocks[edge.target].active_in_set.is_some() {
                    selected_successor = Some(edge.target);
                    break;
                }
            }

            for edge in &out_edges {
                match ir.blocks[edge.target].alive_in.clone() {
                    Some(alive_in) => {
                        for local in alive_in {
                            self.values[self.var_ids[local as usize]].last_use = Some(LastUse::Block(edge.target));
                        }
                    }
                    None => {
                        for i in 0..ir.local_vars {
                            self.values[self.var_ids[i as usize]].last_use = Some(LastUse::Block(edge.target));
                        }
                    }
                }
            }

            if let Some(succ) = selected_successor {
                let active_out = ir.blocks[succ].active_in_set.clone().expect("selected successor has an active-in set");
                for entry in &active_out {
                    let local = entry.value.as_local().expect("active-in entries are always locals");
                    let vid = self.var_ids[local as usize];
                    self.values[vid].active_in = Some(entry.reg);
                    self.registers[entry.reg as usize].active_val = Some(vid);
                    self.active_vals.push(vid);
                }
                ir.blocks[block].active_out_set = Some(active_out);
            } else {
                ir.blocks[block].active_out_set = Some(Vec::new());
            }

            for tree in ir.block_tree_reverse_execution_order(block) {
                self.current_tree = Some(tree);
                log::trace!("rlsra: scanning tree t{} ({:?})", ir.trees[tree].ir_idx, ir.trees[tree].kind);
                match ir.trees[tree].kind {
                    TreeKind::LdLocal => {}
                    TreeKind::StLocal => self.scan_st_local(ir, tree)?,
                    _ => self.scan_generic(ir, tree)?,
                }
            }

            let mut active_in = Vec::new();
            for &v in &self.active_vals {
                debug_assert!(matches!(self.values[v].of, ValueOf::Local(_)), "tree temporaries never escape a block");
                active_in.push(ActiveInOut { value: self.values[v].of, reg: self.values[v].active_in.expect("active value has a register") });
            }
            ir.blocks[block].active_in_set = Some(active_in);

            let alive_in: BTreeSet<u32> =
                (0..ir.local_vars).filter(|&i| self.values[self.var_ids[i as usize]].last_use.is_some()).collect();
            ir.blocks[block].alive_in = Some(alive_in);

            for pred in ir.blocks[block].predecessors.clone() {
                let src = pred.source.expect("recompute_predecessors fills in every edge's source");
                if ir.blocks[src].active_in_set.is_none() && self.queued.insert(src) {
                    self.blocks_to_process.push_back(src);
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

    fn konst(ir: &mut Ir, block: bc_ir::BlockId, n: i64) -> TreeId {
        ir.new_tree(TreeKind::Const, Vec::new(), vec![Operand::Imm(n)], block)
    }

    #[test]
    fn allocates_straight_line_function() {
        let mut ir = Ir::new(2);
        let b = ir.first_block;
        let c1 = konst(&mut ir, b, 1);
        let st0 = ir.new_tree(TreeKind::StLocal, vec![c1], vec![Operand::Local(0)], b);
        ir.append_tree(b, 0, st0);

        let ld0 = ir.new_tree(TreeKind::LdLocal, Vec::new(), vec![Operand::Local(0)], b);
        let ret = ir.new_tree(TreeKind::Ret, vec![ld0], Vec::new(), b);
        ir.append_tree(b, 2, ret);

        ir.recompute_predecessors();
        ir.reindex();
        allocate(&mut ir, 4).unwrap();

        assert!(ir.trees[ld0].reg.is_some());
    }

    #[test]
    fn local_to_local_move_emits_a_post_move_not_a_tree_temp() {
        let mut ir = Ir::new(2);
        let b = ir.first_block;
        let c1 = konst(&mut ir, b, 1);
        let st0 = ir.new_tree(TreeKind::StLocal, vec![c1], vec![Operand::Local(0)], b);
        ir.append_tree(b, 0, st0);

        // local1 = local0
        let ld0 = ir.new_tree(TreeKind::LdLocal, Vec::new(), vec![Operand::Local(0)], b);
        let st1 = ir.new_tree(TreeKind::StLocal, vec![ld0], vec![Operand::Local(1)], b);
        ir.append_tree(b, 2, st1);

        let ld1 = ir.new_tree(TreeKind::LdLocal, Vec::new(), vec![Operand::Local(1)], b);
        let ret = ir.new_tree(TreeKind::Ret, vec![ld1], Vec::new(), b);
        ir.append_tree(b, 4, ret);

        ir.recompute_predecessors();
        ir.reindex();
        allocate(&mut ir, 4).unwrap();

        assert_eq!(ir.trees[st1].operands.len(), 1, "local-to-local StLocal should not grow an extra Reg operand");
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

        assert!(allocate(&mut ir, 1).is_err());
    }

    #[test]
    fn branch_join_adopts_a_ready_successor_active_in_set() {
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
        ir.reindex();
        allocate(&mut ir, 4).unwrap();

        assert!(ir.blocks[entry].active_out_set.is_some());
    }
}
