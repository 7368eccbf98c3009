//! Generic traversal over a section's instruction list
//!
//! Phases that need to look at every op implement [`RvVisitor`] and get a
//! callback per encoding kind.  Callbacks may mutate the section through
//! the pool; the walker re-reads the `next` link after every callback so
//! insertions behind the cursor stay consistent.
//!
//! A callback returns `ControlFlow::Break` to stop the walk early.  This
//! is ordinary control flow, not an error: the distance walkers use it to
//! mean "found my answer".

use basil_common::{assertion_failed, BasilResult};
use std::ops::ControlFlow;

use crate::core::{
    BranchTarget, JumpTarget, OpPool, RvInstr, RvInstrKind, RvOp, RvOperands, RvReg,
    RvSection,
};

pub type WalkFlow = ControlFlow<()>;

pub const WALK_ON: BasilResult<WalkFlow> = Ok(ControlFlow::Continue(()));
pub const WALK_STOP: BasilResult<WalkFlow> = Ok(ControlFlow::Break(()));

/// Per-kind callbacks.  Every default raises `AssertionFailed`: a phase
/// that meets an encoding it has no handler for is a compiler bug.
#[allow(unused_variables, clippy::too_many_arguments)]
pub trait RvVisitor {
    fn on_label(
        &mut self,
        pool: &mut OpPool,
        s: &mut RvSection,
        ptr: usize,
        label: usize,
    ) -> BasilResult<WalkFlow> {
        Err(assertion_failed!())
    }

    fn on_directive(
        &mut self,
        pool: &mut OpPool,
        s: &mut RvSection,
        ptr: usize,
    ) -> BasilResult<WalkFlow> {
        Err(assertion_failed!())
    }

    fn on_rtype(
        &mut self,
        pool: &mut OpPool,
        s: &mut RvSection,
        ptr: usize,
        kind: RvInstrKind,
        rd: RvReg,
        rs1: RvReg,
        rs2: RvReg,
    ) -> BasilResult<WalkFlow> {
        Err(assertion_failed!())
    }

    fn on_itype(
        &mut self,
        pool: &mut OpPool,
        s: &mut RvSection,
        ptr: usize,
        kind: RvInstrKind,
        rd: RvReg,
        rs1: RvReg,
        imm: i32,
    ) -> BasilResult<WalkFlow> {
        Err(assertion_failed!())
    }

    fn on_stype(
        &mut self,
        pool: &mut OpPool,
        s: &mut RvSection,
        ptr: usize,
        kind: RvInstrKind,
        rs1: RvReg,
        rs2: RvReg,
        imm: i32,
    ) -> BasilResult<WalkFlow> {
        Err(assertion_failed!())
    }

    fn on_btype(
        &mut self,
        pool: &mut OpPool,
        s: &mut RvSection,
        ptr: usize,
        kind: RvInstrKind,
        rs1: RvReg,
        rs2: RvReg,
        target: BranchTarget,
    ) -> BasilResult<WalkFlow> {
        Err(assertion_failed!())
    }

    fn on_utype(
        &mut self,
        pool: &mut OpPool,
        s: &mut RvSection,
        ptr: usize,
        kind: RvInstrKind,
        rd: RvReg,
        imm: u32,
    ) -> BasilResult<WalkFlow> {
        Err(assertion_failed!())
    }

    fn on_jtype(
        &mut self,
        pool: &mut OpPool,
        s: &mut RvSection,
        ptr: usize,
        kind: RvInstrKind,
        rd: RvReg,
        target: JumpTarget,
    ) -> BasilResult<WalkFlow> {
        Err(assertion_failed!())
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
        frm: u32,
    ) -> BasilResult<WalkFlow> {
        Err(assertion_failed!())
    }

    fn on_real_r4(
        &mut self,
        pool: &mut OpPool,
        s: &mut RvSection,
        ptr: usize,
        kind: RvInstrKind,
        rd: RvReg,
        rs1: RvReg,
        rs2: RvReg,
        rs3: RvReg,
        frm: u32,
    ) -> BasilResult<WalkFlow> {
        Err(assertion_failed!())
    }

    fn on_real_i(
        &mut self,
        pool: &mut OpPool,
        s: &mut RvSection,
        ptr: usize,
        kind: RvInstrKind,
        rd: RvReg,
        rs1: RvReg,
        imm: i32,
    ) -> BasilResult<WalkFlow> {
        Err(assertion_failed!())
    }

    fn on_real_s(
        &mut self,
        pool: &mut OpPool,
        s: &mut RvSection,
        ptr: usize,
        kind: RvInstrKind,
        rs1: RvReg,
        rs2: RvReg,
        imm: i32,
    ) -> BasilResult<WalkFlow> {
        Err(assertion_failed!())
    }

    fn on_ldrc_f(
        &mut self,
        pool: &mut OpPool,
        s: &mut RvSection,
        ptr: usize,
        kind: RvInstrKind,
        rd: RvReg,
        rd2: RvReg,
        label: usize,
    ) -> BasilResult<WalkFlow> {
        Err(assertion_failed!())
    }

    fn on_fence(
        &mut self,
        pool: &mut OpPool,
        s: &mut RvSection,
        ptr: usize,
    ) -> BasilResult<WalkFlow> {
        Err(assertion_failed!())
    }
}

fn dispatch_instr(
    v: &mut dyn RvVisitor,
    pool: &mut OpPool,
    s: &mut RvSection,
    ptr: usize,
    instr: RvInstr,
) -> BasilResult<WalkFlow> {
    let kind = instr.kind;
    match instr.operands {
        RvOperands::R { rd, rs1, rs2 } => v.on_rtype(pool, s, ptr, kind, rd, rs1, rs2),
        RvOperands::I { rd, rs1, imm } => v.on_itype(pool, s, ptr, kind, rd, rs1, imm),
        RvOperands::S { rs1, rs2, imm } => v.on_stype(pool, s, ptr, kind, rs1, rs2, imm),
        RvOperands::B { rs1, rs2, target } => {
            v.on_btype(pool, s, ptr, kind, rs1, rs2, target)
        }
        RvOperands::U { rd, imm } => v.on_utype(pool, s, ptr, kind, rd, imm),
        RvOperands::J { rd, target } => v.on_jtype(pool, s, ptr, kind, rd, target),
        RvOperands::RealR { rd, rs1, rs2, frm } => {
            v.on_real_r(pool, s, ptr, kind, rd, rs1, rs2, frm)
        }
        RvOperands::RealR4 {
            rd,
            rs1,
            rs2,
            rs3,
            frm,
        } => v.on_real_r4(pool, s, ptr, kind, rd, rs1, rs2, rs3, frm),
        RvOperands::RealI { rd, rs1, imm } => {
            v.on_real_i(pool, s, ptr, kind, rd, rs1, imm)
        }
        RvOperands::RealS { rs1, rs2, imm } => {
            v.on_real_s(pool, s, ptr, kind, rs1, rs2, imm)
        }
        RvOperands::LdrcF { rd, rd2, label } => {
            v.on_ldrc_f(pool, s, ptr, kind, rd, rd2, label)
        }
        RvOperands::Fence => v.on_fence(pool, s, ptr),
    }
}

/// Walks `[first, to]` inclusive (to the end when `to` is `None`).
pub(crate) fn walk_range(
    pool: &mut OpPool,
    s: &mut RvSection,
    v: &mut dyn RvVisitor,
    first: Option<usize>,
    to: Option<usize>,
) -> BasilResult<WalkFlow> {
    let mut ptr = first;
    while let Some(p) = ptr {
        let op = pool.op(p).clone();
        let flow = match op {
            RvOp::Label(label) => v.on_label(pool, s, p, label)?,
            RvOp::Instr(instr) => dispatch_instr(v, pool, s, p, instr)?,
            RvOp::Align(_)
            | RvOp::Byte(_)
            | RvOp::TwoByte(_)
            | RvOp::FourByte(_)
            | RvOp::Double(_)
            | RvOp::Float(_)
            | RvOp::StringZ(_) => v.on_directive(pool, s, p)?,
            RvOp::Phi => return Err(assertion_failed!()),
        };
        if flow.is_break() {
            return Ok(ControlFlow::Break(()));
        }
        if Some(p) == to {
            break;
        }
        ptr = pool.node(p).next;
    }
    Ok(ControlFlow::Continue(()))
}

/// Walks the whole section.
pub fn walk(
    pool: &mut OpPool,
    s: &mut RvSection,
    v: &mut dyn RvVisitor,
) -> BasilResult<WalkFlow> {
    let first = s.first_op;
    walk_range(pool, s, v, first, None)
}

/// Walks from `from` (exclusive) to the end of the section.
pub fn walk_from(
    pool: &mut OpPool,
    s: &mut RvSection,
    v: &mut dyn RvVisitor,
    from: usize,
) -> BasilResult<WalkFlow> {
    walk_from_to(pool, s, v, from, None)
}

/// Walks from `from` (exclusive) to `to` (inclusive).
pub fn walk_from_to(
    pool: &mut OpPool,
    s: &mut RvSection,
    v: &mut dyn RvVisitor,
    from: usize,
    to: Option<usize>,
) -> BasilResult<WalkFlow> {
    let first = pool.node(from).next;
    walk_range(pool, s, v, first, to)
}
