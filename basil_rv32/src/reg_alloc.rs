//! Register allocation
//!
//! A linear-scan style allocator parameterised over the register class.
//! The section is walked once; every operand is either renamed to the
//! physical register that currently holds its virtual, or a physical is
//! found for it.  When nothing is free, the physical whose owner's next
//! use lies furthest in the future is evicted.
//!
//! Spill code is not inserted while the walk runs, because inserted
//! instructions would skew the distance calculations.  Instead every
//! load and store is recorded as a spill point and materialised in one
//! pass after allocation completes, in recording order.
//!
//! Before the walk, seam code is synthesised at basic-block boundaries:
//! stores of each edge's must-save set at the block exits and loads of
//! each block's live-in set at its entry.  Seam code still references
//! virtual registers and is allocated like any other instruction.

use basil_common::{assertion_failed, BasilResult, Bitset};

use crate::core::{
    BranchTarget, JumpTarget, OpPool, RvInstrKind, RvOp, RvOperands, RvReg, RvSection,
    INT_FIRST_FREE, INT_VIRT_START, MAX_INT_REGS, MAX_OFFSET, MAX_REAL_REGS, MAX_REG_ARGS,
    MIN_OFFSET, REAL_FIRST_FREE, REAL_VIRT_START, REG_A0, REG_FA0, REG_LOCAL, REG_STACK,
};
use crate::dist::{next_use_distance, RegClassKind};
use crate::prespill::{compute_save_sets, PrespillOffsets};
use crate::sub_section::SubSections;
use crate::walker::{walk, RvVisitor, WalkFlow, WALK_ON};

/// Fallback scratch for far spill offsets when no physical is free; it
/// is parked in the slot just below the stack pointer meanwhile.
const REG_SPILL_FALLBACK: RvReg = 28;

const NO_OWNER: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpillPointKind {
    Load,
    Store,
}

#[derive(Debug, Clone, Copy)]
struct SpillPoint {
    kind: SpillPointKind,
    /// Op the access is inserted before.
    pos: usize,
    offset: i32,
    phys: RvReg,
}

/// Per-class allocator state.
struct RegClass {
    first_free: usize,
    max_regs: usize,
    reg_size: u32,
    /// Current owner of each physical register; [`NO_OWNER`] marks free.
    phys_to_virt: Vec<usize>,
    /// Distance to the owner's next use.
    next: Vec<i32>,
    /// Stack offset of each spilled register, indexed by register id.
    spilt: Vec<Option<i32>>,
    /// Free-slot stack: `Some(offset)` marks a slot available for reuse.
    slots: Vec<Option<i32>>,
    spill_top: usize,
    spill_max: usize,
    /// Arguments passed on the stack occupy the first slots.
    spilt_args: usize,
    spill_points: Vec<SpillPoint>,
}

impl RegClass {
    fn new(
        vr_reg_count: usize,
        max_regs: usize,
        first_free: usize,
        reg_size: u32,
        args: usize,
        virt_start: usize,
        arg_base: RvReg,
    ) -> Self {
        let reg_args = args.min(MAX_REG_ARGS);
        let vr_reg_count = vr_reg_count.max(virt_start + args);

        let mut phys_to_virt = vec![NO_OWNER; max_regs];
        // Reserved registers are pre-allocated to themselves; they are
        // excluded from allocation so the bogus distances never matter.
        for (i, slot) in phys_to_virt.iter_mut().enumerate().take(first_free) {
            *slot = i;
        }
        // Register-passed arguments arrive as the first virtuals.
        for k in 0..reg_args {
            phys_to_virt[arg_base + k] = virt_start + k;
        }

        let mut spilt = vec![None; vr_reg_count];
        let mut slots: Vec<Option<i32>> = (0..vr_reg_count)
            .map(|i| Some((i as u32 * reg_size) as i32))
            .collect();

        // Stack-passed arguments already live in the first slots.
        let spilt_args = args.saturating_sub(reg_args);
        for k in 0..spilt_args {
            spilt[virt_start + reg_args + k] = Some((k as u32 * reg_size) as i32);
            slots[k] = None;
        }

        Self {
            first_free,
            max_regs,
            reg_size,
            phys_to_virt,
            next: vec![-1; max_regs],
            spilt,
            slots,
            spill_top: spilt_args,
            spill_max: spilt_args,
            spilt_args,
            spill_points: Vec::new(),
        }
    }

    fn virt_to_phys(&self, virt: usize) -> Option<RvReg> {
        (self.first_free..self.max_regs).find(|i| self.phys_to_virt[*i] == virt)
    }

    fn add_spill_point(&mut self, kind: SpillPointKind, pos: usize, offset: i32, phys: RvReg) {
        self.spill_points.push(SpillPoint {
            kind,
            pos,
            offset,
            phys,
        });
    }

    /// Assigns a stack slot to `assigned` and records the store of the
    /// physical that held it.
    fn spill_reg(&mut self, pos: usize, assigned: usize, phys: RvReg) -> BasilResult<()> {
        if self.spill_top == self.slots.len() {
            return Err(assertion_failed!());
        }
        let mut slot = self.spill_top;
        for (i, entry) in self.slots.iter().enumerate().take(self.spill_top) {
            if entry.is_some() {
                slot = i;
                break;
            }
        }
        let offset = self.slots[slot].take().ok_or_else(|| assertion_failed!())?;
        if slot == self.spill_top {
            self.spill_top += 1;
            if self.spill_max < self.spill_top {
                self.spill_max = self.spill_top;
            }
        }
        if assigned >= self.spilt.len() {
            return Err(assertion_failed!());
        }
        self.spilt[assigned] = Some(offset);
        self.add_spill_point(SpillPointKind::Store, pos, offset, phys);
        Ok(())
    }

    /// Records the reload of `virt` into `phys` and releases its slot.
    fn load_spilled(&mut self, pos: usize, virt: usize, phys: RvReg) -> BasilResult<()> {
        let offset = self
            .spilt
            .get_mut(virt)
            .and_then(Option::take)
            .ok_or_else(|| assertion_failed!())?;
        if self.spill_top == 0 {
            return Err(assertion_failed!());
        }
        self.add_spill_point(SpillPointKind::Load, pos, offset, phys);
        self.phys_to_virt[phys] = virt;

        let slot = (offset / self.reg_size as i32) as usize;
        self.slots[slot] = Some(offset);
        if slot + 1 == self.spill_top {
            self.spill_top -= 1;
            while self.spill_top > 0 && self.slots[self.spill_top - 1].is_some() {
                self.spill_top -= 1;
            }
        }
        self.next[phys] = -1;
        Ok(())
    }

    /// Frees a named physical register, spilling its current owner.
    fn allocate_fixed(&mut self, pos: usize, reg: RvReg) -> BasilResult<()> {
        let assigned = self.phys_to_virt[reg];
        if assigned != NO_OWNER && assigned != reg {
            self.spill_reg(pos, assigned, reg)?;
        }
        Ok(())
    }

    /// Picks a physical register: the highest-numbered free one, or the
    /// one whose owner is used furthest in the future (ties go to the
    /// higher register number).
    fn allocate_floating(&mut self, pos: usize) -> BasilResult<RvReg> {
        for i in (self.first_free..self.max_regs).rev() {
            if self.phys_to_virt[i] == NO_OWNER {
                return Ok(i);
            }
        }

        let mut victim = None;
        let mut max_next = -1;
        for i in (self.first_free..self.max_regs).rev() {
            if self.next[i] > max_next {
                max_next = self.next[i];
                victim = Some(i);
            }
        }
        let victim = victim.ok_or_else(|| assertion_failed!())?;
        self.spill_reg(pos, self.phys_to_virt[victim], victim)?;
        Ok(victim)
    }

    /// Makes a read operand available.  Returns the physical plus
    /// whether the register is reserved (and so needs no distance
    /// bookkeeping).
    fn ensure(&mut self, pos: usize, reg: RvReg) -> BasilResult<(RvReg, bool)> {
        if reg < self.max_regs {
            // Fixed-use register; reserved ones have been allocated
            // since the dawn of time.
            if reg < self.first_free {
                return Ok((reg, true));
            }
            let assigned = self.phys_to_virt[reg];
            if assigned != reg {
                self.allocate_fixed(pos, reg)?;
                if self.spilt.get(reg).copied().flatten().is_some() {
                    // its own value was stashed when it was evicted
                    self.load_spilled(pos, reg, reg)?;
                } else {
                    // never held anything of ours; the machine put the
                    // value there, e.g. a call result
                    self.phys_to_virt[reg] = reg;
                }
            }
            Ok((reg, false))
        } else if let Some(phys) = self.virt_to_phys(reg) {
            Ok((phys, false))
        } else {
            let target = self.allocate_floating(pos)?;
            self.load_spilled(pos, reg, target)?;
            Ok((target, false))
        }
    }

    /// Claims a register for a write operand.
    fn alloc(&mut self, pos: usize, reg: RvReg) -> BasilResult<RvReg> {
        if reg < self.max_regs {
            self.allocate_fixed(pos, reg)?;
            self.phys_to_virt[reg] = reg;
            Ok(reg)
        } else if let Some(phys) = self.virt_to_phys(reg) {
            self.phys_to_virt[phys] = reg;
            Ok(phys)
        } else {
            let target = self.allocate_floating(pos)?;
            self.phys_to_virt[target] = reg;
            Ok(target)
        }
    }
}

/// Seam synthesis results the allocation walk needs.
struct Seams {
    /// Op starting each sub-section, in order.
    block_starts: Vec<usize>,
    /// Horizon op of each sub-section: the op past which a virtual's
    /// value no longer has to survive in a register.  This is the final
    /// link op, so the seam stores before it keep their operands alive.
    block_horizons: Vec<usize>,
    /// Bytes of pre-spill slots for block-crossing registers.
    basic_block_spill: u32,
}

fn insert_seam_stores(
    pool: &mut OpPool,
    s: &mut RvSection,
    which: RegClassKind,
    save: &Bitset,
    offsets: &PrespillOffsets,
    pos: usize,
) -> BasilResult<()> {
    for reg in save.values() {
        let offset = match which {
            RegClassKind::Int => offsets.int_offset(reg)?,
            RegClassKind::Real => offsets.real_offset(reg)?,
        } + s.locals as i32;
        let near = (MIN_OFFSET..=MAX_OFFSET).contains(&offset);
        match which {
            RegClassKind::Int if near => {
                s.insert_sw_before(pool, pos, reg, REG_LOCAL, offset)?;
            }
            RegClassKind::Int => {
                let tmp = s.acquire_new_reg();
                s.insert_sw_far_before(pool, pos, reg, REG_LOCAL, tmp, offset)?;
            }
            RegClassKind::Real if near => {
                s.insert_fsd_before(pool, pos, reg, REG_LOCAL, offset)?;
            }
            RegClassKind::Real => {
                let tmp = s.acquire_new_reg();
                s.insert_fsd_far_before(pool, pos, reg, REG_LOCAL, tmp, offset)?;
            }
        }
    }
    Ok(())
}

fn init_sub_section_links(
    pool: &mut OpPool,
    s: &mut RvSection,
    sss: &SubSections,
    block: usize,
    offsets: &PrespillOffsets,
) -> BasilResult<()> {
    let ss = &sss.sub_sections[block];
    match ss.links.len() {
        0 => Ok(()),
        1 => {
            let link = &ss.links[0];
            insert_seam_stores(pool, s, RegClassKind::Int, &link.int_save, offsets, link.op)?;
            insert_seam_stores(pool, s, RegClassKind::Real, &link.real_save, offsets, link.op)
        }
        2 => {
            let (op1, op2) = (ss.links[0].op, ss.links[1].op);
            let branch_ok = matches!(
                pool.op(op1),
                RvOp::Instr(i) if matches!(i.operands, RvOperands::B { .. })
            );
            if !branch_ok || !matches!(pool.op(op2), RvOp::Label(_)) {
                return Err(assertion_failed!());
            }

            // Registers both edges must save are stored once, before the
            // branch; edge-specific leftovers go on their own side.
            let (common, only1, only2) =
                compute_save_sets(&ss.links[0].int_save, &ss.links[1].int_save)?;
            insert_seam_stores(pool, s, RegClassKind::Int, &common, offsets, op1)?;
            insert_seam_stores(pool, s, RegClassKind::Int, &only1, offsets, op1)?;
            insert_seam_stores(pool, s, RegClassKind::Int, &only2, offsets, op2)?;

            let (common, only1, only2) =
                compute_save_sets(&ss.links[0].real_save, &ss.links[1].real_save)?;
            insert_seam_stores(pool, s, RegClassKind::Real, &common, offsets, op1)?;
            insert_seam_stores(pool, s, RegClassKind::Real, &only1, offsets, op1)?;
            insert_seam_stores(pool, s, RegClassKind::Real, &only2, offsets, op2)
        }
        _ => Err(assertion_failed!()),
    }
}

/// Reloads a block's live-in registers right after its label.
fn init_sub_section(
    pool: &mut OpPool,
    s: &mut RvSection,
    sss: &SubSections,
    block: usize,
    offsets: &PrespillOffsets,
) -> BasilResult<()> {
    let ss = &sss.sub_sections[block];
    let Some(pos) = pool.node(ss.start).next else {
        return Ok(());
    };
    let (int_inputs, real_inputs) = (ss.int_inputs.clone(), ss.real_inputs.clone());

    for reg in int_inputs.values() {
        let offset = offsets.int_offset(reg)? + s.locals as i32;
        s.insert_lw_far_before(pool, pos, reg, REG_LOCAL, offset)?;
    }
    for reg in real_inputs.values() {
        let offset = offsets.real_offset(reg)? + s.locals as i32;
        if (MIN_OFFSET..=MAX_OFFSET).contains(&offset) {
            s.insert_fld_before(pool, pos, reg, REG_LOCAL, offset)?;
        } else {
            let tmp = s.acquire_new_reg();
            s.insert_fld_far_before(pool, pos, reg, REG_LOCAL, tmp, offset)?;
        }
    }
    Ok(())
}

/// Computes the basic blocks and synthesises the seam code.  The unspill
/// half is implicit: block entries load their live-ins, and allocation
/// treats those loads as ordinary instructions.  The first block's seam
/// is the argument state set up by the register classes instead.
fn link_basic_blocks(pool: &mut OpPool, s: &mut RvSection) -> BasilResult<Seams> {
    let sss = SubSections::calculate(pool, s)?;
    sss.dump(pool);

    let block_starts = sss.sub_sections.iter().map(|ss| ss.start).collect();
    let block_horizons = sss
        .sub_sections
        .iter()
        .map(|ss| match ss.links.len() {
            0 => ss.end,
            n => ss.links[n - 1].op,
        })
        .collect();

    let (offsets, space) = PrespillOffsets::calculate(&sss.int_save, &sss.real_save);

    init_sub_section_links(pool, s, &sss, 0, &offsets)?;
    for block in 1..sss.sub_sections.len() {
        init_sub_section(pool, s, &sss, block, &offsets)?;
        init_sub_section_links(pool, s, &sss, block, &offsets)?;
    }

    Ok(Seams {
        block_starts,
        block_horizons,
        basic_block_spill: space,
    })
}

struct RegAlloc {
    int_regs: RegClass,
    real_regs: RegClass,
    instr_count: i32,
    seams: Seams,
    current_ss: usize,
}

impl RegAlloc {
    fn class(&mut self, which: RegClassKind) -> &mut RegClass {
        match which {
            RegClassKind::Int => &mut self.int_regs,
            RegClassKind::Real => &mut self.real_regs,
        }
    }

    /// Distance from `ptr` to the next use.  Virtual registers only
    /// matter to the end of their basic block; reserved and fixed-use
    /// registers are not reloaded across seams, so they are tracked to
    /// the end of the section.
    fn calc_dist(
        &mut self,
        pool: &mut OpPool,
        s: &mut RvSection,
        which: RegClassKind,
        reg: usize,
        ptr: usize,
    ) -> BasilResult<i32> {
        let max_regs = self.class(which).max_regs;
        let to = if reg >= max_regs {
            self.seams.block_horizons.get(self.current_ss).copied()
        } else {
            None
        };
        let base = self.instr_count + 1;
        next_use_distance(pool, s, which, reg, ptr, to, base)
    }

    /// Ensures a read operand and refreshes its next-use distance.  A
    /// dead value frees its physical immediately; the distance is only
    /// written back by the caller once the destination has been
    /// allocated, so eviction decisions at this instruction still see
    /// the old state.
    fn ensure_operand(
        &mut self,
        pool: &mut OpPool,
        s: &mut RvSection,
        which: RegClassKind,
        ptr: usize,
        reg: RvReg,
    ) -> BasilResult<(RvReg, Option<i32>)> {
        let vreg = reg;
        let (phys, reserved) = self.class(which).ensure(ptr, reg)?;
        if reserved {
            return Ok((phys, None));
        }
        let dist = self.calc_dist(pool, s, which, vreg, ptr)?;
        if dist == -1 {
            self.class(which).phys_to_virt[phys] = NO_OWNER;
        }
        Ok((phys, Some(dist)))
    }

    fn commit_dist(&mut self, which: RegClassKind, phys: RvReg, dist: Option<i32>) {
        if let Some(d) = dist {
            self.class(which).next[phys] = d;
        }
    }

    /// Allocates a write operand and primes its next-use distance.  A
    /// destination that is never read afterwards frees its physical on
    /// the spot.
    fn alloc_dest(
        &mut self,
        pool: &mut OpPool,
        s: &mut RvSection,
        which: RegClassKind,
        ptr: usize,
        reg: RvReg,
    ) -> BasilResult<RvReg> {
        let vreg = reg;
        if reg < self.class(which).first_free {
            return Ok(reg);
        }
        let phys = self.class(which).alloc(ptr, reg)?;
        let dist = self.calc_dist(pool, s, which, vreg, ptr)?;
        let class = self.class(which);
        if dist == -1 {
            class.phys_to_virt[phys] = NO_OWNER;
        }
        class.next[phys] = dist;
        Ok(phys)
    }

    fn step(&mut self) -> BasilResult<WalkFlow> {
        self.instr_count += 1;
        WALK_ON
    }

    /// Finds an integer scratch for a far spill access, avoiding the
    /// register being stored.
    fn far_scratch(&self, avoid: Option<RvReg>) -> Option<RvReg> {
        (self.int_regs.first_free..self.int_regs.max_regs)
            .find(|i| self.int_regs.phys_to_virt[*i] == NO_OWNER && Some(*i) != avoid)
    }

    fn insert_spill_access(
        &mut self,
        pool: &mut OpPool,
        s: &mut RvSection,
        which: RegClassKind,
        sp: SpillPoint,
        offset: i32,
    ) -> BasilResult<()> {
        let near = (MIN_OFFSET..=MAX_OFFSET).contains(&offset);
        match (which, sp.kind) {
            (RegClassKind::Int, SpillPointKind::Load) => {
                // the destination doubles as the offset scratch
                s.insert_lw_far_before(pool, sp.pos, sp.phys, REG_LOCAL, offset)
            }
            (RegClassKind::Int, SpillPointKind::Store) if near => {
                s.insert_sw_before(pool, sp.pos, sp.phys, REG_LOCAL, offset)?;
                Ok(())
            }
            (RegClassKind::Real, SpillPointKind::Load) if near => {
                s.insert_fld_before(pool, sp.pos, sp.phys, REG_LOCAL, offset)?;
                Ok(())
            }
            (RegClassKind::Real, SpillPointKind::Store) if near => {
                s.insert_fsd_before(pool, sp.pos, sp.phys, REG_LOCAL, offset)?;
                Ok(())
            }
            (_, kind) => {
                let avoid = match which {
                    RegClassKind::Int => Some(sp.phys),
                    RegClassKind::Real => None,
                };
                let (scratch, borrowed) = match self.far_scratch(avoid) {
                    Some(reg) => (reg, false),
                    None => (REG_SPILL_FALLBACK, true),
                };
                if borrowed {
                    s.insert_sw_before(pool, sp.pos, scratch, REG_STACK, -4)?;
                }
                match (which, kind) {
                    (RegClassKind::Int, _) => {
                        s.insert_sw_far_before(pool, sp.pos, sp.phys, REG_LOCAL, scratch, offset)?
                    }
                    (RegClassKind::Real, SpillPointKind::Load) => {
                        s.insert_fld_far_before(pool, sp.pos, sp.phys, REG_LOCAL, scratch, offset)?
                    }
                    (RegClassKind::Real, SpillPointKind::Store) => {
                        s.insert_fsd_far_before(pool, sp.pos, sp.phys, REG_LOCAL, scratch, offset)?
                    }
                }
                if borrowed {
                    s.insert_lw_before(pool, sp.pos, scratch, REG_STACK, -4)?;
                }
                Ok(())
            }
        }
    }

    /// Materialises the recorded spill points, in recording order.
    /// Spilled stack arguments live in their own region above the
    /// frame, hence the separate base offset.
    fn insert_spill_code(
        &mut self,
        pool: &mut OpPool,
        s: &mut RvSection,
        which: RegClassKind,
        offset: i32,
        arg_offset: i32,
    ) -> BasilResult<()> {
        let class = self.class(which);
        let arg_limit = (class.spilt_args as u32 * class.reg_size) as i32;
        let points = std::mem::take(&mut class.spill_points);
        for sp in points {
            let base = if sp.offset < arg_limit { arg_offset } else { offset };
            self.insert_spill_access(pool, s, which, sp, base + sp.offset)?;
        }
        Ok(())
    }
}

impl RvVisitor for RegAlloc {
    fn on_label(
        &mut self,
        _pool: &mut OpPool,
        _s: &mut RvSection,
        ptr: usize,
        _label: usize,
    ) -> BasilResult<WalkFlow> {
        if self.current_ss + 1 < self.seams.block_starts.len()
            && ptr == self.seams.block_starts[self.current_ss + 1]
        {
            self.current_ss += 1;
        }
        self.step()
    }

    fn on_directive(
        &mut self,
        _pool: &mut OpPool,
        _s: &mut RvSection,
        _ptr: usize,
    ) -> BasilResult<WalkFlow> {
        WALK_ON
    }

    fn on_rtype(
        &mut self,
        pool: &mut OpPool,
        s: &mut RvSection,
        ptr: usize,
        _kind: RvInstrKind,
        rd: RvReg,
        rs1: RvReg,
        rs2: RvReg,
    ) -> BasilResult<WalkFlow> {
        let (new_rs1, d1) = self.ensure_operand(pool, s, RegClassKind::Int, ptr, rs1)?;
        let (new_rs2, d2) = self.ensure_operand(pool, s, RegClassKind::Int, ptr, rs2)?;
        let new_rd = self.alloc_dest(pool, s, RegClassKind::Int, ptr, rd)?;
        self.commit_dist(RegClassKind::Int, new_rs1, d1);
        self.commit_dist(RegClassKind::Int, new_rs2, d2);

        if let RvOperands::R { rd, rs1, rs2 } = &mut pool.instr_mut(ptr)?.operands {
            (*rd, *rs1, *rs2) = (new_rd, new_rs1, new_rs2);
        }
        self.step()
    }

    fn on_itype(
        &mut self,
        pool: &mut OpPool,
        s: &mut RvSection,
        ptr: usize,
        _kind: RvInstrKind,
        rd: RvReg,
        rs1: RvReg,
        _imm: i32,
    ) -> BasilResult<WalkFlow> {
        let (new_rs1, d1) = self.ensure_operand(pool, s, RegClassKind::Int, ptr, rs1)?;
        let new_rd = self.alloc_dest(pool, s, RegClassKind::Int, ptr, rd)?;
        self.commit_dist(RegClassKind::Int, new_rs1, d1);

        if let RvOperands::I { rd, rs1, .. } = &mut pool.instr_mut(ptr)?.operands {
            (*rd, *rs1) = (new_rd, new_rs1);
        }
        self.step()
    }

    fn on_stype(
        &mut self,
        pool: &mut OpPool,
        s: &mut RvSection,
        ptr: usize,
        _kind: RvInstrKind,
        rs1: RvReg,
        rs2: RvReg,
        _imm: i32,
    ) -> BasilResult<WalkFlow> {
        let (new_rs1, d1) = self.ensure_operand(pool, s, RegClassKind::Int, ptr, rs1)?;
        let (new_rs2, d2) = self.ensure_operand(pool, s, RegClassKind::Int, ptr, rs2)?;
        self.commit_dist(RegClassKind::Int, new_rs1, d1);
        self.commit_dist(RegClassKind::Int, new_rs2, d2);

        if let RvOperands::S { rs1, rs2, .. } = &mut pool.instr_mut(ptr)?.operands {
            (*rs1, *rs2) = (new_rs1, new_rs2);
        }
        self.step()
    }

    fn on_btype(
        &mut self,
        pool: &mut OpPool,
        s: &mut RvSection,
        ptr: usize,
        _kind: RvInstrKind,
        rs1: RvReg,
        rs2: RvReg,
        _target: BranchTarget,
    ) -> BasilResult<WalkFlow> {
        let (new_rs1, d1) = self.ensure_operand(pool, s, RegClassKind::Int, ptr, rs1)?;
        let (new_rs2, d2) = self.ensure_operand(pool, s, RegClassKind::Int, ptr, rs2)?;
        self.commit_dist(RegClassKind::Int, new_rs1, d1);
        self.commit_dist(RegClassKind::Int, new_rs2, d2);

        if let RvOperands::B { rs1, rs2, .. } = &mut pool.instr_mut(ptr)?.operands {
            (*rs1, *rs2) = (new_rs1, new_rs2);
        }
        self.step()
    }

    fn on_utype(
        &mut self,
        pool: &mut OpPool,
        s: &mut RvSection,
        ptr: usize,
        _kind: RvInstrKind,
        rd: RvReg,
        _imm: u32,
    ) -> BasilResult<WalkFlow> {
        let new_rd = self.alloc_dest(pool, s, RegClassKind::Int, ptr, rd)?;
        if let RvOperands::U { rd, .. } = &mut pool.instr_mut(ptr)?.operands {
            *rd = new_rd;
        }
        self.step()
    }

    fn on_jtype(
        &mut self,
        pool: &mut OpPool,
        s: &mut RvSection,
        ptr: usize,
        _kind: RvInstrKind,
        rd: RvReg,
        _target: JumpTarget,
    ) -> BasilResult<WalkFlow> {
        let new_rd = self.alloc_dest(pool, s, RegClassKind::Int, ptr, rd)?;
        if let RvOperands::J { rd, .. } = &mut pool.instr_mut(ptr)?.operands {
            *rd = new_rd;
        }
        self.step()
    }

    fn on_real_r(
        &mut self,
        pool: &mut OpPool,
        s: &mut RvSection,
        ptr: usize,
        kind: RvInstrKind,
        rd: RvReg,
        rs1: RvReg,
        rs2: RvReg,
        _frm: u32,
    ) -> BasilResult<WalkFlow> {
        use RvInstrKind::*;
        let int_rd = matches!(kind, FcvtWD | FeqD | FltD | FleD | FclassD);
        let int_rs1 = matches!(kind, FcvtDW);
        let single_source = matches!(kind, FsqrtD | FcvtWD | FcvtDW | FclassD);

        let rs1_class = if int_rs1 {
            RegClassKind::Int
        } else {
            RegClassKind::Real
        };
        let (new_rs1, d1) = self.ensure_operand(pool, s, rs1_class, ptr, rs1)?;
        let (new_rs2, d2) = if single_source {
            (rs2, None)
        } else {
            self.ensure_operand(pool, s, RegClassKind::Real, ptr, rs2)?
        };
        let rd_class = if int_rd {
            RegClassKind::Int
        } else {
            RegClassKind::Real
        };
        let new_rd = self.alloc_dest(pool, s, rd_class, ptr, rd)?;
        self.commit_dist(rs1_class, new_rs1, d1);
        self.commit_dist(RegClassKind::Real, new_rs2, d2);

        if let RvOperands::RealR { rd, rs1, rs2, .. } = &mut pool.instr_mut(ptr)?.operands {
            (*rd, *rs1, *rs2) = (new_rd, new_rs1, new_rs2);
        }
        self.step()
    }

    fn on_real_r4(
        &mut self,
        pool: &mut OpPool,
        s: &mut RvSection,
        ptr: usize,
        _kind: RvInstrKind,
        rd: RvReg,
        rs1: RvReg,
        rs2: RvReg,
        rs3: RvReg,
        _frm: u32,
    ) -> BasilResult<WalkFlow> {
        let (new_rs1, d1) = self.ensure_operand(pool, s, RegClassKind::Real, ptr, rs1)?;
        let (new_rs2, d2) = self.ensure_operand(pool, s, RegClassKind::Real, ptr, rs2)?;
        let (new_rs3, d3) = self.ensure_operand(pool, s, RegClassKind::Real, ptr, rs3)?;
        let new_rd = self.alloc_dest(pool, s, RegClassKind::Real, ptr, rd)?;
        self.commit_dist(RegClassKind::Real, new_rs1, d1);
        self.commit_dist(RegClassKind::Real, new_rs2, d2);
        self.commit_dist(RegClassKind::Real, new_rs3, d3);

        if let RvOperands::RealR4 {
            rd, rs1, rs2, rs3, ..
        } = &mut pool.instr_mut(ptr)?.operands
        {
            (*rd, *rs1, *rs2, *rs3) = (new_rd, new_rs1, new_rs2, new_rs3);
        }
        self.step()
    }

    fn on_real_i(
        &mut self,
        pool: &mut OpPool,
        s: &mut RvSection,
        ptr: usize,
        _kind: RvInstrKind,
        rd: RvReg,
        rs1: RvReg,
        _imm: i32,
    ) -> BasilResult<WalkFlow> {
        let (new_rs1, d1) = self.ensure_operand(pool, s, RegClassKind::Int, ptr, rs1)?;
        let new_rd = self.alloc_dest(pool, s, RegClassKind::Real, ptr, rd)?;
        self.commit_dist(RegClassKind::Int, new_rs1, d1);

        if let RvOperands::RealI { rd, rs1, .. } = &mut pool.instr_mut(ptr)?.operands {
            (*rd, *rs1) = (new_rd, new_rs1);
        }
        self.step()
    }

    fn on_real_s(
        &mut self,
        pool: &mut OpPool,
        s: &mut RvSection,
        ptr: usize,
        _kind: RvInstrKind,
        rs1: RvReg,
        rs2: RvReg,
        _imm: i32,
    ) -> BasilResult<WalkFlow> {
        let (new_rs1, d1) = self.ensure_operand(pool, s, RegClassKind::Int, ptr, rs1)?;
        let (new_rs2, d2) = self.ensure_operand(pool, s, RegClassKind::Real, ptr, rs2)?;
        self.commit_dist(RegClassKind::Int, new_rs1, d1);
        self.commit_dist(RegClassKind::Real, new_rs2, d2);

        if let RvOperands::RealS { rs1, rs2, .. } = &mut pool.instr_mut(ptr)?.operands {
            (*rs1, *rs2) = (new_rs1, new_rs2);
        }
        self.step()
    }

    fn on_ldrc_f(
        &mut self,
        pool: &mut OpPool,
        s: &mut RvSection,
        ptr: usize,
        _kind: RvInstrKind,
        rd: RvReg,
        rd2: RvReg,
        _label: usize,
    ) -> BasilResult<WalkFlow> {
        let new_rd2 = self.alloc_dest(pool, s, RegClassKind::Int, ptr, rd2)?;
        let new_rd = self.alloc_dest(pool, s, RegClassKind::Real, ptr, rd)?;

        if let RvOperands::LdrcF { rd, rd2, .. } = &mut pool.instr_mut(ptr)?.operands {
            (*rd, *rd2) = (new_rd, new_rd2);
        }
        self.step()
    }

    fn on_fence(
        &mut self,
        _pool: &mut OpPool,
        _s: &mut RvSection,
        _ptr: usize,
    ) -> BasilResult<WalkFlow> {
        self.step()
    }
}

/// Runs allocation over a section.  Returns the stack bytes needed for
/// spill traffic plus basic-block seams; the caller folds this into the
/// prologue's frame reservation.
pub fn reg_alloc(pool: &mut OpPool, s: &mut RvSection) -> BasilResult<u32> {
    // Seam synthesis first: it acquires fresh virtuals for far offsets,
    // which must be inside the register space the classes are sized for.
    let seams = link_basic_blocks(pool, s)?;

    let (max_int, max_real) = s.max_regs();
    let mut ud = RegAlloc {
        int_regs: RegClass::new(
            max_int,
            MAX_INT_REGS,
            INT_FIRST_FREE,
            4,
            s.stype.int_args,
            INT_VIRT_START,
            REG_A0,
        ),
        real_regs: RegClass::new(
            max_real,
            MAX_REAL_REGS,
            REAL_FIRST_FREE,
            8,
            s.stype.real_args,
            REAL_VIRT_START,
            REG_FA0,
        ),
        instr_count: 0,
        seams,
        current_ss: 0,
    };

    walk(pool, s, &mut ud)?;

    // The allocators hand out offsets as if they owned the stack alone
    // and as if their stack-passed arguments came first, so both spill
    // regions and the argument area need rebasing before the recorded
    // spill points are materialised.
    let int_spill_space =
        ((ud.int_regs.spill_max - ud.int_regs.spilt_args) as u32 * ud.int_regs.reg_size) as i32;
    let real_spill_space =
        ((ud.real_regs.spill_max - ud.real_regs.spilt_args) as u32 * ud.real_regs.reg_size) as i32;

    let mut offset = (ud.seams.basic_block_spill + s.locals) as i32;
    let mut arg_offset = offset + real_spill_space + int_spill_space;

    let adjusted = offset - (ud.real_regs.spilt_args as u32 * ud.real_regs.reg_size) as i32;
    ud.insert_spill_code(pool, s, RegClassKind::Real, adjusted, arg_offset)?;

    offset += real_spill_space;
    let adjusted = offset - (ud.int_regs.spilt_args as u32 * ud.int_regs.reg_size) as i32;
    arg_offset += (ud.real_regs.spilt_args as u32 * ud.real_regs.reg_size) as i32;
    ud.insert_spill_code(pool, s, RegClassKind::Int, adjusted, arg_offset)?;

    // Every virtual is gone now.
    s.reg_counter = basil_ir::IR_REG_TEMP_START;
    s.freg_counter = 0;

    Ok(ud.int_regs.spill_max as u32 * ud.int_regs.reg_size
        + ud.real_regs.spill_max as u32 * ud.real_regs.reg_size
        + ud.seams.basic_block_spill)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{RvInstr, REG_ZERO};
    use basil_common::Settings;
    use basil_ir::TypeSection;

    fn section(int_args: usize, temps: u32) -> (OpPool, RvSection) {
        let pool = OpPool::new();
        let s = RvSection::new(
            TypeSection::proc(int_args, 0),
            basil_ir::IR_REG_TEMP_START + temps,
            0,
            0,
            0,
            &Settings::default(),
        );
        (pool, s)
    }

    fn instrs(pool: &OpPool, s: &RvSection) -> Vec<RvInstr> {
        let mut out = Vec::new();
        let mut ptr = s.first_op;
        while let Some(p) = ptr {
            if let RvOp::Instr(i) = pool.op(p) {
                out.push(*i);
            }
            ptr = pool.node(p).next;
        }
        out
    }

    fn assert_no_virtuals(pool: &OpPool, s: &RvSection) {
        for instr in instrs(pool, s) {
            let regs: Vec<RvReg> = match instr.operands {
                RvOperands::R { rd, rs1, rs2 } => vec![rd, rs1, rs2],
                RvOperands::I { rd, rs1, .. } => vec![rd, rs1],
                RvOperands::S { rs1, rs2, .. } => vec![rs1, rs2],
                RvOperands::B { rs1, rs2, .. } => vec![rs1, rs2],
                RvOperands::U { rd, .. } => vec![rd],
                RvOperands::J { rd, .. } => vec![rd],
                RvOperands::RealR { rd, rs1, rs2, .. } => vec![rd, rs1, rs2],
                RvOperands::RealR4 {
                    rd, rs1, rs2, rs3, ..
                } => vec![rd, rs1, rs2, rs3],
                RvOperands::RealI { rd, rs1, .. } => vec![rd, rs1],
                RvOperands::RealS { rs1, rs2, .. } => vec![rs1, rs2],
                RvOperands::LdrcF { rd, rd2, .. } => vec![rd, rd2],
                RvOperands::Fence => vec![],
            };
            for reg in regs {
                assert!(
                    reg < MAX_INT_REGS,
                    "virtual register {reg} survived allocation: {instr}"
                );
            }
        }
    }

    #[test]
    fn test_straight_line_allocation() {
        let (mut pool, mut s) = section(0, 3);
        let v0 = INT_VIRT_START;
        let v1 = INT_VIRT_START + 1;
        let v2 = INT_VIRT_START + 2;
        s.add_li(&mut pool, v0, 1).unwrap();
        s.add_li(&mut pool, v1, 2).unwrap();
        s.add_rtype(&mut pool, RvInstrKind::Add, v2, v0, v1).unwrap();
        s.add_mv(&mut pool, REG_A0, v2).unwrap();

        let spill = reg_alloc(&mut pool, &mut s).unwrap();
        assert_eq!(spill, 0);
        assert_no_virtuals(&pool, &s);

        // dataflow is preserved: the add reads the regs the lis wrote
        let ops = instrs(&pool, &s);
        let li0 = match ops[0].operands {
            RvOperands::I { rd, .. } => rd,
            _ => panic!(),
        };
        let li1 = match ops[1].operands {
            RvOperands::I { rd, .. } => rd,
            _ => panic!(),
        };
        match ops[2].operands {
            RvOperands::R { rs1, rs2, .. } => {
                assert_eq!(rs1, li0);
                assert_eq!(rs2, li1);
            }
            _ => panic!(),
        }
    }

    #[test]
    fn test_dead_value_reuses_register() {
        let (mut pool, mut s) = section(0, 2);
        let v0 = INT_VIRT_START;
        let v1 = INT_VIRT_START + 1;
        // v0 dies at the mv, so v1 may take its register
        s.add_li(&mut pool, v0, 1).unwrap();
        s.add_mv(&mut pool, REG_A0, v0).unwrap();
        s.add_li(&mut pool, v1, 2).unwrap();
        s.add_mv(&mut pool, REG_A0, v1).unwrap();

        reg_alloc(&mut pool, &mut s).unwrap();
        let ops = instrs(&pool, &s);
        let r0 = match ops[0].operands {
            RvOperands::I { rd, .. } => rd,
            _ => panic!(),
        };
        let r1 = match ops[2].operands {
            RvOperands::I { rd, .. } => rd,
            _ => panic!(),
        };
        assert_eq!(r0, r1);
    }

    #[test]
    fn test_arguments_arrive_in_abi_registers() {
        let (mut pool, mut s) = section(2, 2);
        let a = INT_VIRT_START; // argument 0
        let b = INT_VIRT_START + 1; // argument 1
        s.add_rtype(&mut pool, RvInstrKind::Add, a, a, b).unwrap();
        s.add_mv(&mut pool, REG_A0, a).unwrap();

        reg_alloc(&mut pool, &mut s).unwrap();
        let ops = instrs(&pool, &s);
        match ops[0].operands {
            RvOperands::R { rs1, rs2, .. } => {
                assert_eq!(rs1, REG_A0);
                assert_eq!(rs2, REG_A0 + 1);
            }
            _ => panic!(),
        }
    }

    #[test]
    fn test_pressure_forces_spill_and_reload() {
        // More live values than allocatable registers: everything is
        // kept live to the end by summing into an accumulator.
        let live = MAX_INT_REGS - INT_FIRST_FREE + 4;
        let (mut pool, mut s) = section(0, (live + 2) as u32);

        let acc = INT_VIRT_START + live;
        s.add_li(&mut pool, acc, 0).unwrap();
        for i in 0..live {
            s.add_li(&mut pool, INT_VIRT_START + i, i as i32).unwrap();
        }
        for i in 0..live {
            s.add_rtype(&mut pool, RvInstrKind::Add, acc, acc, INT_VIRT_START + i)
                .unwrap();
        }
        s.add_mv(&mut pool, REG_A0, acc).unwrap();

        let spill = reg_alloc(&mut pool, &mut s).unwrap();
        assert!(spill > 0, "register pressure must force spills");
        assert_no_virtuals(&pool, &s);

        // spill stores must precede the reload of the same slot
        let ops = instrs(&pool, &s);
        let mut stored = Vec::new();
        let mut loaded = Vec::new();
        for op in &ops {
            match op.operands {
                RvOperands::S {
                    rs1: REG_LOCAL,
                    imm,
                    ..
                } if op.kind == RvInstrKind::Sw => stored.push(imm),
                RvOperands::I {
                    rs1: REG_LOCAL,
                    imm,
                    ..
                } if op.kind == RvInstrKind::Lw => loaded.push(imm),
                _ => (),
            }
        }
        assert!(!stored.is_empty());
        for off in &loaded {
            assert!(stored.contains(off), "load of offset {off} without store");
        }
    }

    #[test]
    fn test_seam_spill_across_blocks() {
        // v0 is set in the entry block and read after a branch target,
        // so it must travel through its pre-spill slot.
        let (mut pool, mut s) = section(0, 2);
        let v0 = INT_VIRT_START;
        s.add_li(&mut pool, v0, 7).unwrap();
        s.add_btype(&mut pool, RvInstrKind::Beq, REG_ZERO, REG_ZERO, 1)
            .unwrap();
        s.add_nop(&mut pool).unwrap();
        s.add_label(&mut pool, 1).unwrap();
        s.add_mv(&mut pool, REG_A0, v0).unwrap();

        let spill = reg_alloc(&mut pool, &mut s).unwrap();
        assert!(spill >= 4);
        assert_no_virtuals(&pool, &s);

        let ops = instrs(&pool, &s);
        let has_store = ops.iter().any(|op| {
            op.kind == RvInstrKind::Sw
                && matches!(op.operands, RvOperands::S { rs1: REG_LOCAL, .. })
        });
        let has_load = ops.iter().any(|op| {
            op.kind == RvInstrKind::Lw
                && matches!(op.operands, RvOperands::I { rs1: REG_LOCAL, .. })
        });
        assert!(has_store, "seam store missing");
        assert!(has_load, "seam load missing");
    }

    #[test]
    fn test_fp_allocation_runs_alongside_int() {
        let mut pool = OpPool::new();
        let mut s = RvSection::new(
            TypeSection::proc(0, 0),
            basil_ir::IR_REG_TEMP_START + 1,
            2,
            0,
            0,
            &Settings::default(),
        );
        let f0 = REAL_VIRT_START;
        let f1 = REAL_VIRT_START + 1;
        let label = s.add_real_constant(2.5);
        let tmp = s.acquire_new_reg();
        s.add_ldrc_f(&mut pool, f0, tmp, label).unwrap();
        s.add_real_rtype(&mut pool, RvInstrKind::FaddD, f1, f0, f0)
            .unwrap();
        s.add_fsd(&mut pool, f1, REG_LOCAL, 0).unwrap();

        reg_alloc(&mut pool, &mut s).unwrap();
        assert_no_virtuals(&pool, &s);

        let ops = instrs(&pool, &s);
        match (ops[0].operands, ops[1].operands) {
            (RvOperands::LdrcF { rd, .. }, RvOperands::RealR { rs1, rs2, .. }) => {
                assert_eq!(rs1, rd);
                assert_eq!(rs2, rd);
            }
            other => panic!("unexpected shapes {other:?}"),
        }
    }
}
