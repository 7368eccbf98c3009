//! Sub-section (basic block) analysis
//!
//! A section splits into sub-sections at labels and control transfers.
//! Each block records the virtual registers it needs live on entry and,
//! per outbound edge, the registers it has defined by the time the edge
//! is taken.  Intersecting an edge's definitions with the inputs of
//! everything reachable through it yields the edge's must-save set: the
//! registers the allocator has to store across the seam so the target
//! block can reload them.

use basil_common::{assertion_failed, BasilResult, Bitset};
use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::core::{
    BranchTarget, JumpTarget, OpPool, RvInstrKind, RvOp, RvOperands, RvSection,
    INT_VIRT_START, REAL_VIRT_START, REG_ZERO,
};
use crate::dist::{regs_read_before_write, regs_written_in_range, RegClassKind};

/// One outbound edge of a sub-section.
#[derive(Debug, Default)]
pub struct SsLink {
    /// Target label.
    pub label: usize,
    /// The op the edge leaves from: the branch itself, or the label the
    /// block falls through to.
    pub op: usize,
    pub int_outputs: Bitset,
    pub real_outputs: Bitset,
    pub int_save: Bitset,
    pub real_save: Bitset,
}

/// A maximal straight-line run of ops with one entry and at most two
/// exits.
#[derive(Debug)]
pub struct SubSection {
    /// First op of the block (its label, except for the first block).
    pub start: usize,
    /// Last op of the block, inclusive.
    pub end: usize,
    /// Number of ops in the block.
    pub size: usize,
    pub int_inputs: Bitset,
    pub real_inputs: Bitset,
    /// At most two: the taken edge and the fall-through edge.
    pub links: SmallVec<[SsLink; 2]>,
}

#[derive(Debug, Default)]
pub struct SubSections {
    pub sub_sections: Vec<SubSection>,
    link_map: HashMap<usize, usize>,
    /// Union of every edge's must-save set; sizes the pre-spill frame.
    pub int_save: Bitset,
    pub real_save: Bitset,
}

/// The label a control transfer targets, when it ends a block.  The
/// flag is true for conditional branches, which drag a reserved NOP
/// behind them for long-branch expansion.
fn transfer_label(op: &RvOp) -> Option<(usize, bool)> {
    let RvOp::Instr(instr) = op else {
        return None;
    };
    match instr.operands {
        RvOperands::B {
            target: BranchTarget::Label(label),
            ..
        } => Some((label, true)),
        RvOperands::J {
            rd: REG_ZERO,
            target: JumpTarget::Label(label),
        } => Some((label, false)),
        _ => None,
    }
}

/// The reserved `addi x0, x0, 0` the encoder may turn into a `jal`.
fn is_reserved_nop(op: &RvOp) -> bool {
    matches!(
        op,
        RvOp::Instr(instr)
            if instr.kind == RvInstrKind::Addi
                && instr.operands
                    == RvOperands::I {
                        rd: REG_ZERO,
                        rs1: REG_ZERO,
                        imm: 0,
                    }
    )
}

/// True when the op never falls through to its successor.
fn is_unconditional_transfer(op: &RvOp) -> bool {
    let RvOp::Instr(instr) = op else {
        return false;
    };
    match instr.operands {
        RvOperands::J { rd, .. } => {
            instr.kind == RvInstrKind::Jal && rd == REG_ZERO
        }
        RvOperands::I { rd, .. } => {
            instr.kind == RvInstrKind::Jalr && rd == REG_ZERO
        }
        _ => false,
    }
}

impl SubSections {
    /// The sub-section starting at `label`.
    pub fn block_of_label(&self, label: usize) -> Option<usize> {
        self.link_map.get(&label).copied()
    }

    fn add_link(
        &mut self,
        pool: &mut OpPool,
        s: &mut RvSection,
        block: usize,
        ptr: usize,
        label: usize,
    ) -> BasilResult<()> {
        let ss = &self.sub_sections[block];
        if ss.links.len() >= 2 {
            return Err(assertion_failed!());
        }

        let mut link = SsLink {
            label,
            op: ptr,
            ..Default::default()
        };

        // A block with two edges ends in a conditional branch followed
        // by the fall-through label; the label defines nothing, so both
        // edges carry identical outputs and they are computed once.
        if ss.links.is_empty() {
            let start = ss.start;
            let (max_int, max_real) = s.max_regs();
            regs_written_in_range(
                pool,
                s,
                RegClassKind::Int,
                start,
                Some(ptr),
                max_int,
                &mut link.int_outputs,
            )?;
            regs_written_in_range(
                pool,
                s,
                RegClassKind::Real,
                start,
                Some(ptr),
                max_real,
                &mut link.real_outputs,
            )?;
        } else {
            link.int_outputs = ss.links[0].int_outputs.clone();
            link.real_outputs = ss.links[0].real_outputs.clone();
        }

        self.sub_sections[block].links.push(link);
        Ok(())
    }

    fn finalize(
        &mut self,
        pool: &mut OpPool,
        s: &mut RvSection,
        block: usize,
        end: usize,
        size: usize,
    ) -> BasilResult<()> {
        let start = self.sub_sections[block].start;
        let (max_int, max_real) = s.max_regs();

        let mut int_inputs = Bitset::new();
        let mut real_inputs = Bitset::new();
        regs_read_before_write(
            pool,
            s,
            RegClassKind::Int,
            start,
            Some(end),
            max_int,
            &mut int_inputs,
        )?;
        regs_read_before_write(
            pool,
            s,
            RegClassKind::Real,
            start,
            Some(end),
            max_real,
            &mut real_inputs,
        )?;

        {
            let ss = &mut self.sub_sections[block];
            ss.end = end;
            ss.size = size;
            ss.int_inputs = int_inputs;
            ss.real_inputs = real_inputs;
        }

        // Fall-through edge into the label that follows the block.
        let terminator = pool.op(end).clone();
        if !is_unconditional_transfer(&terminator) {
            if let Some(next) = pool.node(end).next {
                if let RvOp::Label(label) = *pool.op(next) {
                    self.add_link(pool, s, block, next, label)?;
                }
            }
        }
        Ok(())
    }

    fn new_block(&mut self, start: usize) -> usize {
        self.sub_sections.push(SubSection {
            start,
            end: start,
            size: 0,
            int_inputs: Bitset::new(),
            real_inputs: Bitset::new(),
            links: SmallVec::new(),
        });
        self.sub_sections.len() - 1
    }

    /// The first block holds the function arguments in the ABI
    /// registers, which the allocator pre-assigns to the first virtuals
    /// of each class.  They count as outputs of every edge out of it.
    fn add_args(&mut self, s: &RvSection) -> BasilResult<()> {
        let Some(first) = self.sub_sections.first_mut() else {
            return Err(assertion_failed!());
        };
        for link in &mut first.links {
            for i in 0..s.stype.int_args {
                link.int_outputs.set(INT_VIRT_START + i)?;
            }
            for i in 0..s.stype.real_args {
                link.real_outputs.set(REAL_VIRT_START + i)?;
            }
        }
        Ok(())
    }

    fn link_must_save(&mut self, block: usize, link: usize) -> BasilResult<()> {
        let (start_label, int_outputs, real_outputs) = {
            let l = &self.sub_sections[block].links[link];
            (l.label, l.int_outputs.clone(), l.real_outputs.clone())
        };

        let mut visited = Bitset::new();
        visited.set(start_label)?;
        let mut work = vec![start_label];
        let mut int_save = Bitset::new();
        let mut real_save = Bitset::new();

        while let Some(label) = work.pop() {
            let target = self
                .link_map
                .get(&label)
                .copied()
                .ok_or_else(|| assertion_failed!())?;
            let ss = &self.sub_sections[target];

            let mut scratch = int_outputs.clone();
            scratch.and(&ss.int_inputs);
            int_save.or(&scratch)?;

            let mut scratch = real_outputs.clone();
            scratch.and(&ss.real_inputs);
            real_save.or(&scratch)?;

            for l in &ss.links {
                if !visited.contains(l.label) {
                    visited.set(l.label)?;
                    work.push(l.label);
                }
            }
        }

        self.int_save.or(&int_save)?;
        self.real_save.or(&real_save)?;
        let l = &mut self.sub_sections[block].links[link];
        l.int_save = int_save;
        l.real_save = real_save;
        Ok(())
    }

    fn compute_must_save(&mut self) -> BasilResult<()> {
        for block in 0..self.sub_sections.len() {
            for link in 0..self.sub_sections[block].links.len() {
                self.link_must_save(block, link)?;
            }
        }
        Ok(())
    }

    /// Partitions the section and computes the live/save sets.
    ///
    /// Conditional transfers without a following label get one
    /// synthesised so the fall-through target is addressable.
    pub fn calculate(pool: &mut OpPool, s: &mut RvSection) -> BasilResult<Self> {
        let (Some(first), Some(last)) = (s.first_op, s.last_op) else {
            return Err(assertion_failed!());
        };
        if first == last {
            return Err(assertion_failed!());
        }

        let mut sss = Self::default();
        let mut block = sss.new_block(first);
        let mut count = 0usize;
        let mut ptr = Some(first);

        while let Some(p) = ptr {
            let node_prev = pool.node(p).prev;
            let op = pool.op(p).clone();

            if let RvOp::Label(label) = op {
                let end = node_prev.ok_or_else(|| assertion_failed!())?;
                sss.finalize(pool, s, block, end, count)?;
                count = 0;
                block = sss.new_block(p);
                if label >= s.label_counter {
                    return Err(assertion_failed!());
                }
                sss.link_map.insert(label, block);
            } else if let Some((label, conditional)) = transfer_label(&op) {
                sss.add_link(pool, s, block, p, label)?;
                // The fall-through target needs a label.  A conditional
                // branch keeps its reserved NOP glued behind it, so the
                // label goes after the NOP.
                let mut next = pool.node(p).next;
                if conditional {
                    if let Some(n) = next {
                        if is_reserved_nop(pool.op(n)) {
                            next = pool.node(n).next;
                        }
                    }
                }
                if let Some(next) = next {
                    if !matches!(pool.op(next), RvOp::Label(_)) {
                        let fresh = s.new_label();
                        s.insert_label_before(pool, next, fresh)?;
                    }
                }
            }

            count += 1;
            if Some(p) == s.last_op {
                break;
            }
            ptr = pool.node(p).next;
        }

        if count > 0 {
            let end = s.last_op.ok_or_else(|| assertion_failed!())?;
            sss.finalize(pool, s, block, end, count)?;
        }

        sss.add_args(s)?;
        sss.compute_must_save()?;
        Ok(sss)
    }

    pub fn dump(&self, pool: &OpPool) {
        log::trace!("combined must-save int: {}", self.int_save);
        log::trace!("combined must-save real: {}", self.real_save);
        for (i, ss) in self.sub_sections.iter().enumerate() {
            log::trace!("sub-section {i} ({} ops):", ss.size);
            log::trace!("  int inputs: {}", ss.int_inputs);
            log::trace!("  real inputs: {}", ss.real_inputs);
            for link in &ss.links {
                log::trace!("  -> label_{}", link.label);
                log::trace!("     int outputs: {}", link.int_outputs);
                log::trace!("     int save: {}", link.int_save);
                log::trace!("     real save: {}", link.real_save);
            }
            let mut ptr = Some(ss.start);
            while let Some(p) = ptr {
                log::trace!("    {}", pool.op(p));
                if p == ss.end {
                    break;
                }
                ptr = pool.node(p).next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{RvInstrKind, INT_VIRT_START, REG_LOCAL};
    use basil_common::Settings;
    use basil_ir::TypeSection;

    fn section(int_args: usize) -> (OpPool, RvSection) {
        let pool = OpPool::new();
        let s = RvSection::new(
            TypeSection::proc(int_args, 0),
            16,
            0,
            10,
            0,
            &Settings::default(),
        );
        (pool, s)
    }

    /// entry:  li v0, 1; li v1, 2; beq v0, v1, L1
    ///         (fall through) sw v0 -> jump L2
    /// L1:     sw v1
    /// L2:     sw v0
    fn diamond() -> (OpPool, RvSection) {
        let (mut pool, mut s) = section(0);
        let v0 = INT_VIRT_START;
        let v1 = INT_VIRT_START + 1;
        s.add_li(&mut pool, v0, 1).unwrap();
        s.add_li(&mut pool, v1, 2).unwrap();
        s.add_btype(&mut pool, RvInstrKind::Beq, v0, v1, 1).unwrap();
        s.add_sw(&mut pool, v0, REG_LOCAL, 0).unwrap();
        s.add_jump(&mut pool, 2).unwrap();
        s.add_label(&mut pool, 1).unwrap();
        s.add_sw(&mut pool, v1, REG_LOCAL, 4).unwrap();
        s.add_label(&mut pool, 2).unwrap();
        s.add_sw(&mut pool, v0, REG_LOCAL, 8).unwrap();
        (pool, s)
    }

    #[test]
    fn test_blocks_split_at_labels_and_branches() {
        let (mut pool, mut s) = diamond();
        let sss = SubSections::calculate(&mut pool, &mut s).unwrap();
        // entry, fall-through, L1, L2
        assert_eq!(sss.sub_sections.len(), 4);
        assert!(sss.block_of_label(1).is_some());
        assert!(sss.block_of_label(2).is_some());
    }

    #[test]
    fn test_branch_block_has_two_edges_with_equal_outputs() {
        let (mut pool, mut s) = diamond();
        let sss = SubSections::calculate(&mut pool, &mut s).unwrap();
        let entry = &sss.sub_sections[0];
        assert_eq!(entry.links.len(), 2);
        assert_eq!(
            entry.links[0].int_outputs.values(),
            entry.links[1].int_outputs.values()
        );
        // both v0 and v1 are defined before the branch
        assert!(entry.links[0].int_outputs.contains(INT_VIRT_START));
        assert!(entry.links[0].int_outputs.contains(INT_VIRT_START + 1));
    }

    #[test]
    fn test_fall_through_gets_synthesised_label() {
        let (mut pool, mut s) = section(0);
        let v0 = INT_VIRT_START;
        let labels_before = s.label_counter;
        s.add_li(&mut pool, v0, 1).unwrap();
        s.add_btype(&mut pool, RvInstrKind::Beq, v0, v0, 1).unwrap();
        s.add_sw(&mut pool, v0, REG_LOCAL, 0).unwrap();
        s.add_label(&mut pool, 1).unwrap();
        s.add_nop(&mut pool).unwrap();

        let sss = SubSections::calculate(&mut pool, &mut s).unwrap();
        assert!(s.label_counter > labels_before);
        // the synthesised label starts its own block
        assert_eq!(sss.sub_sections.len(), 3);
    }

    #[test]
    fn test_must_save_is_outputs_intersect_reachable_inputs() {
        let (mut pool, mut s) = diamond();
        let sss = SubSections::calculate(&mut pool, &mut s).unwrap();

        let entry = &sss.sub_sections[0];
        // Taken edge to L1: L1 reads v1, L2 (reachable) reads v0.
        let taken = entry.links.iter().find(|l| l.label == 1).unwrap();
        assert!(taken.int_save.contains(INT_VIRT_START));
        assert!(taken.int_save.contains(INT_VIRT_START + 1));

        // Global union covers everything any edge must save.
        assert!(sss.int_save.contains(INT_VIRT_START));
        assert!(sss.int_save.contains(INT_VIRT_START + 1));
        assert!(sss.real_save.is_empty());
    }

    #[test]
    fn test_args_are_outputs_of_first_block() {
        let (mut pool, mut s) = section(2);
        let v0 = INT_VIRT_START;
        s.add_nop(&mut pool).unwrap();
        s.add_jump(&mut pool, 0).unwrap();
        s.add_label(&mut pool, 0).unwrap();
        s.add_sw(&mut pool, v0, REG_LOCAL, 0).unwrap();

        let sss = SubSections::calculate(&mut pool, &mut s).unwrap();
        let entry = &sss.sub_sections[0];
        assert_eq!(entry.links.len(), 1);
        assert!(entry.links[0].int_outputs.contains(INT_VIRT_START));
        assert!(entry.links[0].int_outputs.contains(INT_VIRT_START + 1));
        // v0 is an argument and L0 reads it, so it must be saved.
        assert!(entry.links[0].int_save.contains(INT_VIRT_START));
    }
}
