//! Distance and liveness walkers
//!
//! Two questions drive both sub-section analysis and the allocator's
//! replacement policy:
//!
//! - distance: given a register and a starting op, how many instructions
//!   until its next read?  `-1` means the next reference is a write or
//!   there is no reference, i.e. the current value is dead.
//! - written: is the register defined anywhere in a range?
//!
//! Integer and FP classes need separate walkers because the per-kind
//! operand interpretation differs; `fcvt.w.d` reads an FP register and
//! writes an integer one.

use basil_common::{Bitset, BasilResult};

use crate::core::{
    BranchTarget, JumpTarget, OpPool, RvInstrKind, RvReg, RvSection, INT_VIRT_START,
    REAL_VIRT_START, REG_FA0, REG_RA,
};
use crate::walker::{walk_range, RvVisitor, WalkFlow, WALK_ON, WALK_STOP};

/// Which register class a walker interprets operands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegClassKind {
    Int,
    Real,
}

/// `RealR` kinds whose destination is an integer register.
fn real_r_int_rd(kind: RvInstrKind) -> bool {
    use RvInstrKind::*;
    matches!(kind, FcvtWD | FeqD | FltD | FleD | FclassD)
}

/// `RealR` kinds whose first source is an integer register.
fn real_r_int_rs1(kind: RvInstrKind) -> bool {
    matches!(kind, RvInstrKind::FcvtDW)
}

/// `RealR` kinds with a function selector instead of a second source.
fn real_r_single_source(kind: RvInstrKind) -> bool {
    use RvInstrKind::*;
    matches!(kind, FsqrtD | FcvtWD | FcvtDW | FclassD)
}

struct Scan {
    reg: usize,
    dist: i32,
}

impl Scan {
    fn read(&mut self, regs: &[RvReg]) -> Option<BasilResult<WalkFlow>> {
        if regs.contains(&self.reg) {
            return Some(WALK_STOP);
        }
        None
    }

    fn write(&mut self, regs: &[RvReg]) -> Option<BasilResult<WalkFlow>> {
        if regs.contains(&self.reg) {
            self.dist = -1;
            return Some(WALK_STOP);
        }
        None
    }

    fn step(&mut self) -> BasilResult<WalkFlow> {
        self.dist += 1;
        WALK_ON
    }
}

/// Finds the next reference of an integer register: reads win over
/// writes within one instruction.
struct IntDist(Scan);

impl RvVisitor for IntDist {
    fn on_label(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        _: usize,
    ) -> BasilResult<WalkFlow> {
        WALK_ON
    }

    fn on_directive(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
    ) -> BasilResult<WalkFlow> {
        WALK_ON
    }

    fn on_rtype(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        _: RvInstrKind,
        rd: RvReg,
        rs1: RvReg,
        rs2: RvReg,
    ) -> BasilResult<WalkFlow> {
        if let Some(flow) = self.0.read(&[rs1, rs2]) {
            return flow;
        }
        if let Some(flow) = self.0.write(&[rd]) {
            return flow;
        }
        self.0.step()
    }

    fn on_itype(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        _: RvInstrKind,
        rd: RvReg,
        rs1: RvReg,
        _: i32,
    ) -> BasilResult<WalkFlow> {
        if let Some(flow) = self.0.read(&[rs1]) {
            return flow;
        }
        if let Some(flow) = self.0.write(&[rd]) {
            return flow;
        }
        self.0.step()
    }

    fn on_stype(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        _: RvInstrKind,
        rs1: RvReg,
        rs2: RvReg,
        _: i32,
    ) -> BasilResult<WalkFlow> {
        if let Some(flow) = self.0.read(&[rs1, rs2]) {
            return flow;
        }
        self.0.step()
    }

    fn on_btype(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        _: RvInstrKind,
        rs1: RvReg,
        rs2: RvReg,
        _: BranchTarget,
    ) -> BasilResult<WalkFlow> {
        if let Some(flow) = self.0.read(&[rs1, rs2]) {
            return flow;
        }
        self.0.step()
    }

    fn on_utype(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        _: RvInstrKind,
        rd: RvReg,
        _: u32,
    ) -> BasilResult<WalkFlow> {
        if let Some(flow) = self.0.write(&[rd]) {
            return flow;
        }
        self.0.step()
    }

    fn on_jtype(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        _: RvInstrKind,
        rd: RvReg,
        _: JumpTarget,
    ) -> BasilResult<WalkFlow> {
        if let Some(flow) = self.0.write(&[rd]) {
            return flow;
        }
        self.0.step()
    }

    fn on_real_r(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        kind: RvInstrKind,
        rd: RvReg,
        rs1: RvReg,
        _: RvReg,
        _: u32,
    ) -> BasilResult<WalkFlow> {
        if real_r_int_rs1(kind) {
            if let Some(flow) = self.0.read(&[rs1]) {
                return flow;
            }
        }
        if real_r_int_rd(kind) {
            if let Some(flow) = self.0.write(&[rd]) {
                return flow;
            }
        }
        self.0.step()
    }

    fn on_real_r4(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        _: RvInstrKind,
        _: RvReg,
        _: RvReg,
        _: RvReg,
        _: RvReg,
        _: u32,
    ) -> BasilResult<WalkFlow> {
        self.0.step()
    }

    fn on_real_i(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        _: RvInstrKind,
        _: RvReg,
        rs1: RvReg,
        _: i32,
    ) -> BasilResult<WalkFlow> {
        if let Some(flow) = self.0.read(&[rs1]) {
            return flow;
        }
        self.0.step()
    }

    fn on_real_s(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        _: RvInstrKind,
        rs1: RvReg,
        _: RvReg,
        _: i32,
    ) -> BasilResult<WalkFlow> {
        if let Some(flow) = self.0.read(&[rs1]) {
            return flow;
        }
        self.0.step()
    }

    fn on_ldrc_f(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        _: RvInstrKind,
        _: RvReg,
        rd2: RvReg,
        _: usize,
    ) -> BasilResult<WalkFlow> {
        if let Some(flow) = self.0.write(&[rd2]) {
            return flow;
        }
        self.0.step()
    }

    fn on_fence(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
    ) -> BasilResult<WalkFlow> {
        self.0.step()
    }
}

/// Finds the next reference of an FP register.  Calls clobber `fa0`, the
/// FP return register.
struct RealDist(Scan);

impl RvVisitor for RealDist {
    fn on_label(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        _: usize,
    ) -> BasilResult<WalkFlow> {
        WALK_ON
    }

    fn on_directive(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
    ) -> BasilResult<WalkFlow> {
        WALK_ON
    }

    fn on_rtype(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        _: RvInstrKind,
        _: RvReg,
        _: RvReg,
        _: RvReg,
    ) -> BasilResult<WalkFlow> {
        self.0.step()
    }

    fn on_itype(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        kind: RvInstrKind,
        rd: RvReg,
        _: RvReg,
        _: i32,
    ) -> BasilResult<WalkFlow> {
        if kind == RvInstrKind::Jalr && rd == REG_RA && self.0.reg == REG_FA0 {
            self.0.dist = -1;
            return WALK_STOP;
        }
        self.0.step()
    }

    fn on_stype(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        _: RvInstrKind,
        _: RvReg,
        _: RvReg,
        _: i32,
    ) -> BasilResult<WalkFlow> {
        self.0.step()
    }

    fn on_btype(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        _: RvInstrKind,
        _: RvReg,
        _: RvReg,
        _: BranchTarget,
    ) -> BasilResult<WalkFlow> {
        self.0.step()
    }

    fn on_utype(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        _: RvInstrKind,
        _: RvReg,
        _: u32,
    ) -> BasilResult<WalkFlow> {
        self.0.step()
    }

    fn on_jtype(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        kind: RvInstrKind,
        rd: RvReg,
        _: JumpTarget,
    ) -> BasilResult<WalkFlow> {
        if kind == RvInstrKind::Jal && rd == REG_RA && self.0.reg == REG_FA0 {
            self.0.dist = -1;
            return WALK_STOP;
        }
        self.0.step()
    }

    fn on_real_r(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        kind: RvInstrKind,
        rd: RvReg,
        rs1: RvReg,
        rs2: RvReg,
        _: u32,
    ) -> BasilResult<WalkFlow> {
        let mut reads = [usize::MAX; 2];
        if !real_r_int_rs1(kind) {
            reads[0] = rs1;
        }
        if !real_r_single_source(kind) {
            reads[1] = rs2;
        }
        if let Some(flow) = self.0.read(&reads) {
            return flow;
        }
        if !real_r_int_rd(kind) {
            if let Some(flow) = self.0.write(&[rd]) {
                return flow;
            }
        }
        self.0.step()
    }

    fn on_real_r4(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        _: RvInstrKind,
        rd: RvReg,
        rs1: RvReg,
        rs2: RvReg,
        rs3: RvReg,
        _: u32,
    ) -> BasilResult<WalkFlow> {
        if let Some(flow) = self.0.read(&[rs1, rs2, rs3]) {
            return flow;
        }
        if let Some(flow) = self.0.write(&[rd]) {
            return flow;
        }
        self.0.step()
    }

    fn on_real_i(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        _: RvInstrKind,
        rd: RvReg,
        _: RvReg,
        _: i32,
    ) -> BasilResult<WalkFlow> {
        if let Some(flow) = self.0.write(&[rd]) {
            return flow;
        }
        self.0.step()
    }

    fn on_real_s(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        _: RvInstrKind,
        _: RvReg,
        rs2: RvReg,
        _: i32,
    ) -> BasilResult<WalkFlow> {
        if let Some(flow) = self.0.read(&[rs2]) {
            return flow;
        }
        self.0.step()
    }

    fn on_ldrc_f(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        _: RvInstrKind,
        rd: RvReg,
        _: RvReg,
        _: usize,
    ) -> BasilResult<WalkFlow> {
        if let Some(flow) = self.0.write(&[rd]) {
            return flow;
        }
        self.0.step()
    }

    fn on_fence(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
    ) -> BasilResult<WalkFlow> {
        self.0.step()
    }
}

fn scan_refs(
    pool: &mut OpPool,
    s: &mut RvSection,
    class: RegClassKind,
    reg: usize,
    first: Option<usize>,
    to: Option<usize>,
    base: i32,
) -> BasilResult<i32> {
    let scan = Scan { reg, dist: base };
    let (flow, dist) = match class {
        RegClassKind::Int => {
            let mut v = IntDist(scan);
            (walk_range(pool, s, &mut v, first, to)?, v.0.dist)
        }
        RegClassKind::Real => {
            let mut v = RealDist(scan);
            (walk_range(pool, s, &mut v, first, to)?, v.0.dist)
        }
    };
    if flow.is_break() {
        Ok(dist)
    } else {
        Ok(-1)
    }
}

/// Instructions until the next read of `reg`, starting after `after` and
/// bounded by `to` (inclusive).  Returns `base + n` for a read `n`
/// instructions on, `-1` when the next reference is a write or the
/// register is not referenced.
pub fn next_use_distance(
    pool: &mut OpPool,
    s: &mut RvSection,
    class: RegClassKind,
    reg: usize,
    after: usize,
    to: Option<usize>,
    base: i32,
) -> BasilResult<i32> {
    let Some(first) = pool.node(after).next else {
        return Ok(-1);
    };
    scan_refs(pool, s, class, reg, Some(first), to, base)
}

/// Is the first reference of `reg` in `[from, to]` a read?
pub fn first_ref_is_read(
    pool: &mut OpPool,
    s: &mut RvSection,
    class: RegClassKind,
    reg: usize,
    from: usize,
    to: Option<usize>,
) -> BasilResult<bool> {
    Ok(scan_refs(pool, s, class, reg, Some(from), to, 0)? != -1)
}

struct WriteFinder {
    class: RegClassKind,
    scan: Scan,
}

impl WriteFinder {
    fn check(&mut self, written: &[RvReg]) -> BasilResult<WalkFlow> {
        if let Some(flow) = self.scan.write(written) {
            return flow;
        }
        self.scan.step()
    }
}

impl RvVisitor for WriteFinder {
    fn on_label(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        _: usize,
    ) -> BasilResult<WalkFlow> {
        WALK_ON
    }

    fn on_directive(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
    ) -> BasilResult<WalkFlow> {
        WALK_ON
    }

    fn on_rtype(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        _: RvInstrKind,
        rd: RvReg,
        _: RvReg,
        _: RvReg,
    ) -> BasilResult<WalkFlow> {
        match self.class {
            RegClassKind::Int => self.check(&[rd]),
            RegClassKind::Real => self.check(&[]),
        }
    }

    fn on_itype(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        kind: RvInstrKind,
        rd: RvReg,
        _: RvReg,
        _: i32,
    ) -> BasilResult<WalkFlow> {
        match self.class {
            RegClassKind::Int => self.check(&[rd]),
            RegClassKind::Real => {
                if kind == RvInstrKind::Jalr && rd == REG_RA {
                    self.check(&[REG_FA0])
                } else {
                    self.check(&[])
                }
            }
        }
    }

    fn on_stype(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        _: RvInstrKind,
        _: RvReg,
        _: RvReg,
        _: i32,
    ) -> BasilResult<WalkFlow> {
        self.check(&[])
    }

    fn on_btype(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        _: RvInstrKind,
        _: RvReg,
        _: RvReg,
        _: BranchTarget,
    ) -> BasilResult<WalkFlow> {
        self.check(&[])
    }

    fn on_utype(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        _: RvInstrKind,
        rd: RvReg,
        _: u32,
    ) -> BasilResult<WalkFlow> {
        match self.class {
            RegClassKind::Int => self.check(&[rd]),
            RegClassKind::Real => self.check(&[]),
        }
    }

    fn on_jtype(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        kind: RvInstrKind,
        rd: RvReg,
        _: JumpTarget,
    ) -> BasilResult<WalkFlow> {
        match self.class {
            RegClassKind::Int => self.check(&[rd]),
            RegClassKind::Real => {
                if kind == RvInstrKind::Jal && rd == REG_RA {
                    self.check(&[REG_FA0])
                } else {
                    self.check(&[])
                }
            }
        }
    }

    fn on_real_r(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        kind: RvInstrKind,
        rd: RvReg,
        _: RvReg,
        _: RvReg,
        _: u32,
    ) -> BasilResult<WalkFlow> {
        let int_rd = real_r_int_rd(kind);
        match self.class {
            RegClassKind::Int if int_rd => self.check(&[rd]),
            RegClassKind::Real if !int_rd => self.check(&[rd]),
            _ => self.check(&[]),
        }
    }

    fn on_real_r4(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        _: RvInstrKind,
        rd: RvReg,
        _: RvReg,
        _: RvReg,
        _: RvReg,
        _: u32,
    ) -> BasilResult<WalkFlow> {
        match self.class {
            RegClassKind::Int => self.check(&[]),
            RegClassKind::Real => self.check(&[rd]),
        }
    }

    fn on_real_i(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        _: RvInstrKind,
        rd: RvReg,
        _: RvReg,
        _: i32,
    ) -> BasilResult<WalkFlow> {
        match self.class {
            RegClassKind::Int => self.check(&[]),
            RegClassKind::Real => self.check(&[rd]),
        }
    }

    fn on_real_s(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        _: RvInstrKind,
        _: RvReg,
        _: RvReg,
        _: i32,
    ) -> BasilResult<WalkFlow> {
        self.check(&[])
    }

    fn on_ldrc_f(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
        _: RvInstrKind,
        rd: RvReg,
        rd2: RvReg,
        _: usize,
    ) -> BasilResult<WalkFlow> {
        match self.class {
            RegClassKind::Int => self.check(&[rd2]),
            RegClassKind::Real => self.check(&[rd]),
        }
    }

    fn on_fence(
        &mut self,
        _: &mut OpPool,
        _: &mut RvSection,
        _: usize,
    ) -> BasilResult<WalkFlow> {
        self.check(&[])
    }
}

/// Is `reg` written anywhere in `[from, to]`?
pub fn is_written_in_range(
    pool: &mut OpPool,
    s: &mut RvSection,
    class: RegClassKind,
    reg: usize,
    from: usize,
    to: Option<usize>,
) -> BasilResult<bool> {
    let mut v = WriteFinder {
        class,
        scan: Scan { reg, dist: 0 },
    };
    Ok(walk_range(pool, s, &mut v, Some(from), to)?.is_break())
}

/// Adds every virtual register of `class` whose first reference in
/// `[from, to]` is a read.  These are the range's live-in registers.
pub fn regs_read_before_write(
    pool: &mut OpPool,
    s: &mut RvSection,
    class: RegClassKind,
    from: usize,
    to: Option<usize>,
    max_regs: usize,
    set: &mut Bitset,
) -> BasilResult<()> {
    let start = match class {
        RegClassKind::Int => INT_VIRT_START,
        RegClassKind::Real => REAL_VIRT_START,
    };
    for reg in start..max_regs {
        if first_ref_is_read(pool, s, class, reg, from, to)? {
            set.set(reg)?;
        }
    }
    Ok(())
}

/// Adds every virtual register of `class` written in `[from, to]`.
pub fn regs_written_in_range(
    pool: &mut OpPool,
    s: &mut RvSection,
    class: RegClassKind,
    from: usize,
    to: Option<usize>,
    max_regs: usize,
    set: &mut Bitset,
) -> BasilResult<()> {
    let start = match class {
        RegClassKind::Int => INT_VIRT_START,
        RegClassKind::Real => REAL_VIRT_START,
    };
    for reg in start..max_regs {
        if is_written_in_range(pool, s, class, reg, from, to)? {
            set.set(reg)?;
        }
    }
    Ok(())
}
