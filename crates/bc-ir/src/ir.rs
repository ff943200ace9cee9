//! The IR root container: block/tree/statement arenas plus the CFG
//! analyses that run over them (predecessor recomputation, `ir_idx`
//! reindexing, liveness).

use crate::entity::{BlockId, EntityRef, PrimaryMap, StmtId, TreeId};
use crate::block::BlockData;
use crate::tree::{BlockEdge, Operand, TreeData, TreeKind, StatementData};

use std::collections::BTreeSet;
use std::fmt;

/// A lowered program: one arena each for blocks, statements and trees, plus
/// the fixed count of local variable slots the bytecode declared.
///
/// Blocks and statements form two independent doubly-linked lists (via
/// `prev`/`next`); trees form a forest rooted at each statement. None of
/// these links are pointers; they are [`crate::entity::EntityRef`] indices
/// into the arenas below, so the whole structure is trivially `Clone` and
/// has no aliasing to reason about.
#[derive(Debug, Clone)]
pub struct Ir {
    pub trees: PrimaryMap<TreeId, TreeData>,
    pub stmts: PrimaryMap<StmtId, StatementData>,
    pub blocks: PrimaryMap<BlockId, BlockData>,
    pub first_block: BlockId,
    pub local_vars: u32,
    pub ir_idx_count: u32,
}

impl Ir {
    /// Create an empty program with one empty entry block at source index 0.
    pub fn new(local_vars: u32) -> Self {
        let mut blocks = PrimaryMap::new();
        let first_block = blocks.push(BlockData::new(0));
        Ir {
            trees: PrimaryMap::new(),
            stmts: PrimaryMap::new(),
            blocks,
            first_block,
            local_vars,
            ir_idx_count: 0,
        }
    }

    // ---- construction, used by bc-lower while folding bytecode ----------

    /// Create a tree, wiring `parent` on each of its children.
    pub fn new_tree(&mut self, kind: TreeKind, children: Vec<TreeId>, operands: Vec<Operand>, block: BlockId) -> TreeId {
        let id = self.trees.push(TreeData::new(kind, children.clone(), operands, block));
        for c in children {
            self.trees[c].parent = Some(id);
        }
        id
    }

    /// Append `tree` as a new statement at the end of `block`, with the
    /// given source bytecode index.
    pub fn append_tree(&mut self, block: BlockId, src_idx: u32, tree: TreeId) -> StmtId {
        let stmt = self.stmts.push(StatementData {
            src_idx,
            prev: self.blocks[block].last_stmt,
            next: None,
            tree,
        });
        if let Some(last) = self.blocks[block].last_stmt {
            self.stmts[last].next = Some(stmt);
        } else {
            self.blocks[block].first_stmt = Some(stmt);
        }
        self.blocks[block].last_stmt = Some(stmt);
        stmt
    }

    /// Find the block starting exactly at `idx`, creating it if necessary.
    ///
    /// Three cases, mirroring the reference lowering's block-splitting
    /// behavior:
    /// - a block already starts at `idx`: return it directly;
    /// - `idx` falls after every statement of the block that would contain
    ///   it: append a new empty block right after that block;
    /// - `idx` falls exactly on a statement boundary in the middle of a
    ///   block: split the block there, inserting a synthetic `Jmp` at the
    ///   end of the prefix that falls through to the new suffix block.
    ///
    /// Returns `None` if `idx` does not land on any statement boundary at
    /// all (a malformed jump target into the middle of a folded tree).
    pub fn get_or_insert_block_at(&mut self, idx: u32) -> Option<BlockId> {
        let mut block = self.first_block;
        loop {
            if self.blocks[block].src_idx >= idx {
                break;
            }
            match self.blocks[block].next {
                Some(next) if self.blocks[next].src_idx <= idx => block = next,
                _ => break,
            }
        }
        if self.blocks[block].src_idx == idx {
            return Some(block);
        }

        let mut stmt = self.blocks[block].first_stmt;
        loop {
            let s = stmt?;
            let s_idx = self.stmts[s].src_idx;
            if s_idx >= idx {
                if s_idx > idx {
                    return None;
                }
                return Some(self.split_block_at_statement(block, s, idx));
            }
            match self.stmts[s].next {
                Some(n) => stmt = Some(n),
                None => return Some(self.insert_empty_block_after(block, idx)),
            }
        }
    }

    fn insert_empty_block_after(&mut self, block: BlockId, idx: u32) -> BlockId {
        let mut new_block = BlockData::new(idx);
        let old_next = self.blocks[block].next;
        new_block.next = old_next;
        new_block.prev = Some(block);
        let new_id = self.blocks.push(new_block);
        if let Some(n) = old_next {
            self.blocks[n].prev = Some(new_id);
        }
        self.blocks[block].next = Some(new_id);
        new_id
    }

    fn split_block_at_statement(&mut self, block: BlockId, split_stmt: StmtId, idx: u32) -> BlockId {
        let old_next = self.blocks[block].next;
        let old_last = self.blocks[block].last_stmt;

        let mut new_block = BlockData::new(idx);
        new_block.first_stmt = Some(split_stmt);
        new_block.last_stmt = old_last;
        new_block.next = old_next;
        new_block.prev = Some(block);
        let new_id = self.blocks.push(new_block);
        if let Some(n) = old_next {
            self.blocks[n].prev = Some(new_id);
        }
        self.blocks[block].next = Some(new_id);

        let prefix_prev = self.stmts[split_stmt].prev;
        let jmp_src_idx = match prefix_prev {
            Some(p) => self.stmts[p].src_idx,
            None => self.blocks[block].src_idx,
        };
        let jmp_tree = self.new_tree(TreeKind::Jmp, Vec::new(), vec![Operand::Edge(BlockEdge::to(new_id))], block);
        let jmp_stmt = self.stmts.push(StatementData {
            src_idx: jmp_src_idx,
            prev: prefix_prev,
            next: None,
            tree: jmp_tree,
        });
        if let Some(p) = prefix_prev {
            self.stmts[p].next = Some(jmp_stmt);
        }
        if self.blocks[block].first_stmt == Some(split_stmt) {
            self.blocks[block].first_stmt = Some(jmp_stmt);
        }
        self.blocks[block].last_stmt = Some(jmp_stmt);
        self.stmts[split_stmt].prev = None;

        let mut cursor = Some(split_stmt);
        while let Some(s) = cursor {
            let tree = self.stmts[s].tree;
            self.rehome_block(tree, new_id);
            cursor = self.stmts[s].next;
        }

        new_id
    }

    fn rehome_block(&mut self, tree: TreeId, block: BlockId) {
        self.trees[tree].block = block;
        let children = self.trees[tree].children.clone();
        for c in children {
            self.rehome_block(c, block);
        }
    }

    // ---- traversal --------------------------------------------------

    /// Blocks in default forward order, starting at [`Ir::first_block`].
    pub fn block_ids(&self) -> Vec<BlockId> {
        let mut out = Vec::new();
        let mut cur = Some(self.first_block);
        while let Some(b) = cur {
            out.push(b);
            cur = self.blocks[b].next;
        }
        out
    }

    pub fn terminator_tree(&self, block: BlockId) -> TreeId {
        self.blocks[block]
            .last_stmt
            .map(|s| self.stmts[s].tree)
            .expect("block has no statements; every reachable block ends in a terminator")
    }

    pub fn terminator_kind(&self, block: BlockId) -> TreeKind {
        self.trees[self.terminator_tree(block)].kind
    }

    /// The outgoing edges of a block's terminator tree, in operand order
    /// (for `Branch`: true-target first, then false-target).
    pub fn outgoing_edges(&self, block: BlockId) -> Vec<BlockEdge> {
        let term = self.terminator_tree(block);
        debug_assert!(self.trees[term].kind.is_terminator());
        self.trees[term].operands.iter().filter_map(|o| o.as_edge()).collect()
    }

    /// Post-order traversal of one tree (children before parent).
    pub fn tree_execution_order(&self, root: TreeId) -> Vec<TreeId> {
        let mut out = Vec::new();
        self.push_execution_order(root, &mut out);
        out
    }

    fn push_execution_order(&self, t: TreeId, out: &mut Vec<TreeId>) {
        for &c in &self.trees[t].children {
            self.push_execution_order(c, out);
        }
        out.push(t);
    }

    /// The exact reverse of [`Ir::tree_execution_order`]: parent before
    /// children, children visited back-to-front.
    pub fn tree_reverse_execution_order(&self, root: TreeId) -> Vec<TreeId> {
        let mut out = Vec::new();
        self.push_reverse_execution_order(root, &mut out);
        out
    }

    fn push_reverse_execution_order(&self, t: TreeId, out: &mut Vec<TreeId>) {
        out.push(t);
        for &c in self.trees[t].children.iter().rev() {
            self.push_reverse_execution_order(c, out);
        }
    }

    /// All trees of a block, statements in forward order, each tree in
    /// post-order.
    pub fn block_tree_execution_order(&self, block: BlockId) -> Vec<TreeId> {
        let mut out = Vec::new();
        let mut stmt = self.blocks[block].first_stmt;
        while let Some(s) = stmt {
            self.push_execution_order(self.stmts[s].tree, &mut out);
            stmt = self.stmts[s].next;
        }
        out
    }

    /// All trees of a block, statements in reverse order, each tree in
    /// reverse execution order.
    pub fn block_tree_reverse_execution_order(&self, block: BlockId) -> Vec<TreeId> {
        let mut out = Vec::new();
        let mut stmt = self.blocks[block].last_stmt;
        while let Some(s) = stmt {
            self.push_reverse_execution_order(self.stmts[s].tree, &mut out);
            stmt = self.stmts[s].prev;
        }
        out
    }

    /// All trees of the whole program, blocks in forward order.
    pub fn tree_execution_order_all(&self) -> Vec<TreeId> {
        let mut out = Vec::new();
        for block in self.block_ids() {
            out.extend(self.block_tree_execution_order(block));
        }
        out
    }

    // ---- analyses -----------------------------------------------------

    /// Reassign every tree's `ir_idx` to its position in the whole-program
    /// execution order. Both allocators require this to have run (and to
    /// stay current; call again after any lowering change).
    pub fn reindex(&mut self) {
        let order = self.tree_execution_order_all();
        for (i, t) in order.iter().enumerate() {
            self.trees[*t].ir_idx = i as u32;
        }
        self.ir_idx_count = order.len() as u32;
    }

    /// Recompute every block's `predecessors` list from scratch by walking
    /// each block's outgoing edges and filling in their `source`. Idempotent:
    /// safe to call again after the CFG changes.
    pub fn recompute_predecessors(&mut self) {
        for id in self.blocks.iter_keys() {
            self.blocks[id].predecessors.clear();
        }
        for block in self.block_ids() {
            let term = self.terminator_tree(block);
            let n = self.trees[term].operands.len();
            for i in 0..n {
                if let Operand::Edge(mut edge) = self.trees[term].operands[i] {
                    edge.source = Some(block);
                    self.trees[term].operands[i] = Operand::Edge(edge);
                    self.blocks[edge.target].predecessors.push(edge);
                }
            }
        }
    }

    /// Fixed-point backward liveness: `alive_in`/`alive_out` hold the set of
    /// local variable indices live at block entry/exit. Requires
    /// [`Ir::recompute_predecessors`] to have already run, since it is
    /// driven purely by successor edges (it never consults `predecessors`
    /// directly, but a correct CFG is assumed).
    pub fn recompute_alive_sets(&mut self) {
        let blocks = self.block_ids();
        loop {
            let mut changed = false;
            for &block in &blocks {
                let mut alive: BTreeSet<u32> = BTreeSet::new();
                for edge in self.outgoing_edges(block) {
                    if let Some(set) = &self.blocks[edge.target].alive_in {
                        alive.extend(set.iter().copied());
                    }
                }
                for tree in self.block_tree_reverse_execution_order(block) {
                    match self.trees[tree].kind {
                        TreeKind::LdLocal => {
                            let i = self.trees[tree].operands[0].as_local().unwrap();
                            alive.insert(i);
                        }
                        TreeKind::StLocal => {
                            let i = self.trees[tree].operands[0].as_local().unwrap();
                            alive.remove(&i);
                        }
                        _ => {}
                    }
                }
                if self.blocks[block].alive_in.as_ref() != Some(&alive) {
                    changed = true;
                }
                self.blocks[block].alive_in = Some(alive);
            }
            if !changed {
                break;
            }
        }
        for &block in &blocks {
            let mut out = BTreeSet::new();
            for edge in self.outgoing_edges(block) {
                if let Some(set) = &self.blocks[edge.target].alive_in {
                    out.extend(set.iter().copied());
                }
            }
            self.blocks[block].alive_out = Some(out);
        }
    }
}

impl fmt::Display for Ir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for block in self.block_ids() {
            writeln!(f, "{}: ; src={}", block, self.blocks[block].src_idx)?;
            let mut stmt = self.blocks[block].first_stmt;
            while let Some(s) = stmt {
                writeln!(f, "    {}", self.dump_tree(self.stmts[s].tree))?;
                stmt = self.stmts[s].next;
            }
        }
        Ok(())
    }
}

impl Ir {
    fn dump_tree(&self, tree: TreeId) -> String {
        let data = &self.trees[tree];
        let mut operands: Vec<String> = data
            .operands
            .iter()
            .map(|o| match o {
                Operand::Local(i) => format!("local{i}"),
                Operand::Imm(n) => n.to_string(),
                Operand::Op(op) => format!("{op:?}"),
                Operand::Edge(e) => format!("-> {}", e.target),
                Operand::Reg(r) => format!("r{r}"),
            })
            .collect();
        if let Some(r) = data.reg {
            operands.push(format!("@r{r}"));
        }
        let children: Vec<String> = data.children.iter().map(|&c| self.dump_tree(c)).collect();
        let mut parts = vec![format!("{:?}", data.kind)];
        parts.extend(operands);
        if children.is_empty() {
            parts.join(" ")
        } else {
            format!("{}({})", parts.join(" "), children.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stl(i: u32, child: TreeId, ir: &mut Ir, block: BlockId) -> TreeId {
        ir.new_tree(TreeKind::StLocal, vec![child], vec![Operand::Local(i)], block)
    }

    fn konst(n: i64, ir: &mut Ir, block: BlockId) -> TreeId {
        ir.new_tree(TreeKind::Const, Vec::new(), vec![Operand::Imm(n)], block)
    }

    #[test]
    fn append_tree_links_statements_in_order() {
        let mut ir = Ir::new(1);
        let b = ir.first_block;
        let c0 = konst(1, &mut ir, b);
        let s0 = stl(0, c0, &mut ir, b);
        ir.append_tree(b, 0, s0);
        let c1 = konst(2, &mut ir, b);
        let s1 = stl(0, c1, &mut ir, b);
        ir.append_tree(b, 2, s1);

        assert_eq!(ir.blocks[b].first_stmt.map(|s| ir.stmts[s].tree), Some(s0));
        assert_eq!(ir.blocks[b].last_stmt.map(|s| ir.stmts[s].tree), Some(s1));
    }

    #[test]
    fn get_or_insert_block_at_existing_start_returns_same_block() {
        let mut ir = Ir::new(1);
        let b = ir.first_block;
        assert_eq!(ir.get_or_insert_block_at(0), Some(b));
    }

    #[test]
    fn get_or_insert_block_at_past_end_creates_new_block() {
        let mut ir = Ir::new(1);
        let b = ir.first_block;
        let c0 = konst(1, &mut ir, b);
        let s0 = stl(0, c0, &mut ir, b);
        ir.append_tree(b, 0, s0);
        let ret = ir.new_tree(TreeKind::Ret, Vec::new(), Vec::new(), b);
        ir.append_tree(b, 2, ret);

        let new_block = ir.get_or_insert_block_at(3).unwrap();
        assert_ne!(new_block, b);
        assert_eq!(ir.blocks[b].next, Some(new_block));
        assert_eq!(ir.blocks[new_block].src_idx, 3);
        assert!(ir.blocks[new_block].is_empty());
    }

    #[test]
    fn get_or_insert_block_at_mid_block_splits_and_inserts_jmp() {
        let mut ir = Ir::new(1);
        let b = ir.first_block;
        let c0 = konst(1, &mut ir, b);
        let s0 = stl(0, c0, &mut ir, b);
        ir.append_tree(b, 0, s0);
        let c1 = konst(2, &mut ir, b);
        let s1 = stl(0, c1, &mut ir, b);
        ir.append_tree(b, 2, s1);
        let ret = ir.new_tree(TreeKind::Ret, Vec::new(), Vec::new(), b);
        ir.append_tree(b, 4, ret);

        let suffix = ir.get_or_insert_block_at(2).unwrap();
        assert_ne!(suffix, b);
        assert_eq!(ir.blocks[b].next, Some(suffix));

        // `b` now holds only the original first statement plus a synthetic Jmp.
        let first = ir.blocks[b].first_stmt.unwrap();
        assert_eq!(ir.stmts[first].tree, s0);
        let jmp_stmt = ir.stmts[first].next.unwrap();
        assert_eq!(ir.blocks[b].last_stmt, Some(jmp_stmt));
        let jmp_tree = ir.stmts[jmp_stmt].tree;
        assert_eq!(ir.trees[jmp_tree].kind, TreeKind::Jmp);
        assert_eq!(ir.trees[jmp_tree].operands[0].as_edge().unwrap().target, suffix);

        // the suffix block owns the rest, and its trees were rehomed.
        assert_eq!(ir.blocks[suffix].first_stmt.map(|s| ir.stmts[s].tree), Some(s1));
        assert_eq!(ir.trees[s1].block, suffix);
        assert_eq!(ir.trees[c1].block, suffix);
    }

    #[test]
    fn get_or_insert_block_at_non_boundary_returns_none() {
        let mut ir = Ir::new(1);
        let b = ir.first_block;
        let c0 = konst(1, &mut ir, b);
        let s0 = stl(0, c0, &mut ir, b);
        ir.append_tree(b, 0, s0);
        let ret = ir.new_tree(TreeKind::Ret, Vec::new(), Vec::new(), b);
        ir.append_tree(b, 3, ret);
        assert_eq!(ir.get_or_insert_block_at(1), None);
    }

    #[test]
    fn reindex_assigns_post_order_positions() {
        let mut ir = Ir::new(1);
        let b = ir.first_block;
        let c0 = konst(1, &mut ir, b);
        let s0 = stl(0, c0, &mut ir, b);
        ir.append_tree(b, 0, s0);
        let ret = ir.new_tree(TreeKind::Ret, Vec::new(), Vec::new(), b);
        ir.append_tree(b, 2, ret);

        ir.reindex();
        assert_eq!(ir.trees[c0].ir_idx, 0);
        assert_eq!(ir.trees[s0].ir_idx, 1);
        assert_eq!(ir.trees[ret].ir_idx, 2);
        assert_eq!(ir.ir_idx_count, 3);
    }

    #[test]
    fn recompute_predecessors_fills_in_edge_sources() {
        let mut ir = Ir::new(1);
        let b0 = ir.first_block;
        let b1 = ir.get_or_insert_block_at(1).unwrap();
        let jmp = ir.new_tree(TreeKind::Jmp, Vec::new(), vec![Operand::Edge(BlockEdge::to(b1))], b0);
        ir.append_tree(b0, 0, jmp);
        let ret = ir.new_tree(TreeKind::Ret, Vec::new(), Vec::new(), b1);
        ir.append_tree(b1, 1, ret);

        ir.recompute_predecessors();
        assert_eq!(ir.blocks[b1].predecessors.len(), 1);
        assert_eq!(ir.blocks[b1].predecessors[0].source, Some(b0));
    }

    #[test]
    fn recompute_alive_sets_tracks_locals_across_a_jump() {
        let mut ir = Ir::new(1);
        let b0 = ir.first_block;
        let b1 = ir.get_or_insert_block_at(1).unwrap();

        let jmp = ir.new_tree(TreeKind::Jmp, Vec::new(), vec![Operand::Edge(BlockEdge::to(b1))], b0);
        ir.append_tree(b0, 0, jmp);

        let ld = ir.new_tree(TreeKind::LdLocal, Vec::new(), vec![Operand::Local(0)], b1);
        let discard = ir.new_tree(TreeKind::Discard, vec![ld], Vec::new(), b1);
        ir.append_tree(b1, 1, discard);
        let ret = ir.new_tree(TreeKind::Ret, Vec::new(), Vec::new(), b1);
        ir.append_tree(b1, 2, ret);

        ir.recompute_predecessors();
        ir.recompute_alive_sets();

        assert!(ir.blocks[b1].alive_in.as_ref().unwrap().contains(&0));
        assert!(ir.blocks[b0].alive_out.as_ref().unwrap().contains(&0));
        assert!(ir.blocks[b0].alive_in.as_ref().unwrap().contains(&0));
    }
}
