//! Lowering rule actions
//!
//! Each action rewrites one matched IR window into machine instructions
//! that still use virtual registers.  Conditional branches always drag a
//! reserved NOP behind them; the encoder rewrites it into a `jal` when
//! the target turns out to be further than the 4 KiB branch window.

use basil_common::{assertion_failed, BasilError, BasilResult};
use basil_ir::{CallTarget, IrArg, IrInst, IrOp, IrSection};

use crate::core::{
    ir_to_rv_freg, ir_to_rv_reg, OpPool, RvInstrKind, RvProg, RvReg, RvSection, MAX_OFFSET,
    MAX_REG_ARGS, MIN_OFFSET, REG_A0, REG_A7, REG_FA0, REG_FRAME, REG_RA, REG_STACK,
    REG_ZERO,
};

/// Everything the rule actions need: the op pool, the machine program
/// built so far and the index of the section being lowered.
pub struct GenContext {
    pub pool: OpPool,
    pub prog: RvProg,
    pub current: usize,
}

impl GenContext {
    pub fn section(&mut self) -> (&mut OpPool, &mut RvSection) {
        (&mut self.pool, &mut self.prog.sections[self.current])
    }
}

fn inst(s: &IrSection, start: usize) -> BasilResult<&IrInst> {
    match s.ops.get(start) {
        Some(IrOp::Instr(i)) => Ok(i),
        _ => Err(assertion_failed!()),
    }
}

fn reg(i: &IrInst, idx: usize) -> RvReg {
    ir_to_rv_reg(i.operands[idx].reg())
}

fn freg(i: &IrInst, idx: usize) -> RvReg {
    ir_to_rv_freg(i.operands[idx].reg())
}

fn imm(i: &IrInst, idx: usize) -> i32 {
    i.operands[idx].int()
}

fn label(i: &IrInst, idx: usize) -> usize {
    i.operands[idx].label()
}

fn fits_imm(v: i32) -> bool {
    (MIN_OFFSET..=MAX_OFFSET).contains(&v)
}

/// Loads an FP constant into a fresh virtual through the section pool.
fn load_real(ctx: &mut GenContext, value: f64) -> BasilResult<RvReg> {
    let (pool, rv_s) = ctx.section();
    let dest = rv_s.acquire_new_freg();
    let tmp = rv_s.acquire_new_reg();
    let lbl = rv_s.add_real_constant(value);
    rv_s.add_ldrc_f(pool, dest, tmp, lbl)?;
    Ok(dest)
}

// ---------------------------------------------------------------------
// moves

pub fn gen_mov(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    let i = inst(s, start)?;
    let (dest, src) = (reg(i, 0), reg(i, 1));
    let (pool, rv_s) = ctx.section();
    rv_s.add_mv(pool, dest, src)?;
    Ok(())
}

pub fn gen_movii32(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    let i = inst(s, start)?;
    let (dest, value) = (reg(i, 0), imm(i, 1));
    let (pool, rv_s) = ctx.section();
    rv_s.add_li(pool, dest, value)?;
    Ok(())
}

pub fn gen_movir(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    let i = inst(s, start)?;
    let dest = freg(i, 0);
    let value = i.operands[1].real();
    let (pool, rv_s) = ctx.section();
    let tmp = rv_s.acquire_new_reg();
    let lbl = rv_s.add_real_constant(value);
    rv_s.add_ldrc_f(pool, dest, tmp, lbl)?;
    Ok(())
}

pub fn gen_movfp(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    let i = inst(s, start)?;
    let (dest, src) = (freg(i, 0), freg(i, 1));
    let (pool, rv_s) = ctx.section();
    rv_s.add_fmv(pool, dest, src)?;
    Ok(())
}

pub fn gen_movi32fp(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    let i = inst(s, start)?;
    let (dest, src) = (freg(i, 0), reg(i, 1));
    let (pool, rv_s) = ctx.section();
    rv_s.add_real_rtype(pool, RvInstrKind::FcvtDW, dest, src, 0)?;
    Ok(())
}

pub fn gen_movfpi32(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    let i = inst(s, start)?;
    let (dest, src) = (reg(i, 0), freg(i, 1));
    let (pool, rv_s) = ctx.section();
    rv_s.add_real_rtype(pool, RvInstrKind::FcvtWD, dest, src, 0)?;
    Ok(())
}

// ---------------------------------------------------------------------
// integer arithmetic

fn gen_rrr(
    s: &IrSection,
    start: usize,
    ctx: &mut GenContext,
    kind: RvInstrKind,
) -> BasilResult<()> {
    let i = inst(s, start)?;
    let (dest, rs1, rs2) = (reg(i, 0), reg(i, 1), reg(i, 2));
    let (pool, rv_s) = ctx.section();
    rv_s.add_rtype(pool, kind, dest, rs1, rs2)?;
    Ok(())
}

macro_rules! rrr_action {
    ($name:ident, $kind:ident) => {
        pub fn $name(
            s: &IrSection,
            start: usize,
            ctx: &mut GenContext,
        ) -> BasilResult<()> {
            gen_rrr(s, start, ctx, RvInstrKind::$kind)
        }
    };
}

rrr_action!(gen_addi32, Add);
rrr_action!(gen_subi32, Sub);
rrr_action!(gen_muli32, Mul);
rrr_action!(gen_divi32, Div);
rrr_action!(gen_modi32, Rem);
rrr_action!(gen_andi32, And);
rrr_action!(gen_ori32, Or);
rrr_action!(gen_eori32, Xor);
rrr_action!(gen_lsli32, Sll);
rrr_action!(gen_lsri32, Srl);
rrr_action!(gen_asri32, Sra);

fn gen_rri(
    s: &IrSection,
    start: usize,
    ctx: &mut GenContext,
    itype: RvInstrKind,
    rtype: RvInstrKind,
) -> BasilResult<()> {
    let i = inst(s, start)?;
    let (dest, rs1, value) = (reg(i, 0), reg(i, 1), imm(i, 2));
    let (pool, rv_s) = ctx.section();
    if fits_imm(value) {
        rv_s.add_itype(pool, itype, dest, rs1, value)?;
    } else {
        let tmp = rv_s.acquire_new_reg();
        rv_s.add_li(pool, tmp, value)?;
        rv_s.add_rtype(pool, rtype, dest, rs1, tmp)?;
    }
    Ok(())
}

pub fn gen_addii32(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    gen_rri(s, start, ctx, RvInstrKind::Addi, RvInstrKind::Add)
}

pub fn gen_subii32(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    let i = inst(s, start)?;
    let (dest, rs1, value) = (reg(i, 0), reg(i, 1), imm(i, 2));
    let (pool, rv_s) = ctx.section();
    if value != i32::MIN && fits_imm(-value) {
        rv_s.add_itype(pool, RvInstrKind::Addi, dest, rs1, -value)?;
    } else {
        let tmp = rv_s.acquire_new_reg();
        rv_s.add_li(pool, tmp, value)?;
        rv_s.add_rtype(pool, RvInstrKind::Sub, dest, rs1, tmp)?;
    }
    Ok(())
}

/// `rd = imm - rs`
pub fn gen_rsubii32(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    let i = inst(s, start)?;
    let (dest, rs1, value) = (reg(i, 0), reg(i, 1), imm(i, 2));
    let (pool, rv_s) = ctx.section();
    let tmp = rv_s.acquire_new_reg();
    rv_s.add_li(pool, tmp, value)?;
    rv_s.add_rtype(pool, RvInstrKind::Sub, dest, tmp, rs1)?;
    Ok(())
}

pub fn gen_mulii32(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    let i = inst(s, start)?;
    let (dest, rs1, value) = (reg(i, 0), reg(i, 1), imm(i, 2));
    let (pool, rv_s) = ctx.section();
    let tmp = rv_s.acquire_new_reg();
    rv_s.add_li(pool, tmp, value)?;
    rv_s.add_rtype(pool, RvInstrKind::Mul, dest, rs1, tmp)?;
    Ok(())
}

pub fn gen_divii32(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    let i = inst(s, start)?;
    let (dest, rs1, value) = (reg(i, 0), reg(i, 1), imm(i, 2));
    if value == 0 {
        return Err(BasilError::DivideByZero);
    }
    let (pool, rv_s) = ctx.section();
    let tmp = rv_s.acquire_new_reg();
    rv_s.add_li(pool, tmp, value)?;
    rv_s.add_rtype(pool, RvInstrKind::Div, dest, rs1, tmp)?;
    Ok(())
}

pub fn gen_andii32(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    gen_rri(s, start, ctx, RvInstrKind::Andi, RvInstrKind::And)
}

pub fn gen_orii32(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    gen_rri(s, start, ctx, RvInstrKind::Ori, RvInstrKind::Or)
}

pub fn gen_eorii32(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    gen_rri(s, start, ctx, RvInstrKind::Xori, RvInstrKind::Xor)
}

pub fn gen_noti32(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    let i = inst(s, start)?;
    let (dest, src) = (reg(i, 0), reg(i, 1));
    let (pool, rv_s) = ctx.section();
    rv_s.add_itype(pool, RvInstrKind::Xori, dest, src, -1)?;
    Ok(())
}

fn gen_shift_imm(
    s: &IrSection,
    start: usize,
    ctx: &mut GenContext,
    kind: RvInstrKind,
) -> BasilResult<()> {
    let i = inst(s, start)?;
    let (dest, rs1, value) = (reg(i, 0), reg(i, 1), imm(i, 2));
    let (pool, rv_s) = ctx.section();
    rv_s.add_itype(pool, kind, dest, rs1, value & 0x1f)?;
    Ok(())
}

pub fn gen_lslii32(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    gen_shift_imm(s, start, ctx, RvInstrKind::Slli)
}

pub fn gen_lsrii32(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    gen_shift_imm(s, start, ctx, RvInstrKind::Srli)
}

pub fn gen_asrii32(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    gen_shift_imm(s, start, ctx, RvInstrKind::Srai)
}

// ---------------------------------------------------------------------
// FP arithmetic

fn gen_fff(
    s: &IrSection,
    start: usize,
    ctx: &mut GenContext,
    kind: RvInstrKind,
) -> BasilResult<()> {
    let i = inst(s, start)?;
    let (dest, rs1, rs2) = (freg(i, 0), freg(i, 1), freg(i, 2));
    let (pool, rv_s) = ctx.section();
    rv_s.add_real_rtype(pool, kind, dest, rs1, rs2)?;
    Ok(())
}

pub fn gen_addr(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    gen_fff(s, start, ctx, RvInstrKind::FaddD)
}

pub fn gen_subr(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    gen_fff(s, start, ctx, RvInstrKind::FsubD)
}

pub fn gen_mulr(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    gen_fff(s, start, ctx, RvInstrKind::FmulD)
}

pub fn gen_divr(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    gen_fff(s, start, ctx, RvInstrKind::FdivD)
}

fn gen_ffd(
    s: &IrSection,
    start: usize,
    ctx: &mut GenContext,
    kind: RvInstrKind,
) -> BasilResult<()> {
    let i = inst(s, start)?;
    let (dest, rs1) = (freg(i, 0), freg(i, 1));
    let value = i.operands[2].real();
    let rs2 = load_real(ctx, value)?;
    let (pool, rv_s) = ctx.section();
    rv_s.add_real_rtype(pool, kind, dest, rs1, rs2)?;
    Ok(())
}

pub fn gen_addir(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    gen_ffd(s, start, ctx, RvInstrKind::FaddD)
}

pub fn gen_subir(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    gen_ffd(s, start, ctx, RvInstrKind::FsubD)
}

pub fn gen_mulir(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    gen_ffd(s, start, ctx, RvInstrKind::FmulD)
}

pub fn gen_divir(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    gen_ffd(s, start, ctx, RvInstrKind::FdivD)
}

// ---------------------------------------------------------------------
// memory

fn gen_load(
    s: &IrSection,
    start: usize,
    ctx: &mut GenContext,
    kind: RvInstrKind,
) -> BasilResult<()> {
    let i = inst(s, start)?;
    let (dest, base, offset) = (reg(i, 0), reg(i, 1), imm(i, 2));
    let (pool, rv_s) = ctx.section();
    if fits_imm(offset) {
        rv_s.add_itype(pool, kind, dest, base, offset)?;
    } else {
        rv_s.add_li(pool, dest, offset)?;
        rv_s.add_rtype(pool, RvInstrKind::Add, dest, dest, base)?;
        rv_s.add_itype(pool, kind, dest, dest, 0)?;
    }
    Ok(())
}

pub fn gen_loadoi8(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    gen_load(s, start, ctx, RvInstrKind::Lbu)
}

pub fn gen_loadoi32(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    gen_load(s, start, ctx, RvInstrKind::Lw)
}

fn gen_store(
    s: &IrSection,
    start: usize,
    ctx: &mut GenContext,
    kind: RvInstrKind,
) -> BasilResult<()> {
    let i = inst(s, start)?;
    let (value, base, offset) = (reg(i, 0), reg(i, 1), imm(i, 2));
    let (pool, rv_s) = ctx.section();
    if fits_imm(offset) {
        rv_s.add_stype(pool, kind, value, base, offset)?;
    } else {
        let tmp = rv_s.acquire_new_reg();
        rv_s.add_li(pool, tmp, offset)?;
        rv_s.add_rtype(pool, RvInstrKind::Add, tmp, tmp, base)?;
        rv_s.add_stype(pool, kind, value, tmp, 0)?;
    }
    Ok(())
}

pub fn gen_storeoi8(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    gen_store(s, start, ctx, RvInstrKind::Sb)
}

pub fn gen_storeoi32(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    gen_store(s, start, ctx, RvInstrKind::Sw)
}

pub fn gen_loador(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    let i = inst(s, start)?;
    let (dest, base, offset) = (freg(i, 0), reg(i, 1), imm(i, 2));
    let (pool, rv_s) = ctx.section();
    if fits_imm(offset) {
        rv_s.add_fld(pool, dest, base, offset)?;
    } else {
        let tmp = rv_s.acquire_new_reg();
        rv_s.add_li(pool, tmp, offset)?;
        rv_s.add_rtype(pool, RvInstrKind::Add, tmp, tmp, base)?;
        rv_s.add_fld(pool, dest, tmp, 0)?;
    }
    Ok(())
}

pub fn gen_storeor(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    let i = inst(s, start)?;
    let (value, base, offset) = (freg(i, 0), reg(i, 1), imm(i, 2));
    let (pool, rv_s) = ctx.section();
    if fits_imm(offset) {
        rv_s.add_fsd(pool, value, base, offset)?;
    } else {
        let tmp = rv_s.acquire_new_reg();
        rv_s.add_li(pool, tmp, offset)?;
        rv_s.add_rtype(pool, RvInstrKind::Add, tmp, tmp, base)?;
        rv_s.add_fsd(pool, value, tmp, 0)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------
// comparisons

#[derive(Clone, Copy, PartialEq)]
enum Cmp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
}

fn emit_cmp(
    pool: &mut OpPool,
    rv_s: &mut RvSection,
    cmp: Cmp,
    dest: RvReg,
    rs1: RvReg,
    rs2: RvReg,
) -> BasilResult<()> {
    match cmp {
        Cmp::Lt => {
            rv_s.add_rtype(pool, RvInstrKind::Slt, dest, rs1, rs2)?;
        }
        Cmp::Gt => {
            rv_s.add_rtype(pool, RvInstrKind::Slt, dest, rs2, rs1)?;
        }
        Cmp::Gte => {
            rv_s.add_rtype(pool, RvInstrKind::Slt, dest, rs1, rs2)?;
            rv_s.add_itype(pool, RvInstrKind::Xori, dest, dest, 1)?;
        }
        Cmp::Lte => {
            rv_s.add_rtype(pool, RvInstrKind::Slt, dest, rs2, rs1)?;
            rv_s.add_itype(pool, RvInstrKind::Xori, dest, dest, 1)?;
        }
        Cmp::Eq => {
            rv_s.add_rtype(pool, RvInstrKind::Xor, dest, rs1, rs2)?;
            rv_s.add_itype(pool, RvInstrKind::Sltiu, dest, dest, 1)?;
        }
        Cmp::Neq => {
            rv_s.add_rtype(pool, RvInstrKind::Xor, dest, rs1, rs2)?;
            rv_s.add_rtype(pool, RvInstrKind::Sltu, dest, REG_ZERO, dest)?;
        }
    }
    Ok(())
}

fn gen_cmp(s: &IrSection, start: usize, ctx: &mut GenContext, cmp: Cmp) -> BasilResult<()> {
    let i = inst(s, start)?;
    let (dest, rs1, rs2) = (reg(i, 0), reg(i, 1), reg(i, 2));
    let (pool, rv_s) = ctx.section();
    emit_cmp(pool, rv_s, cmp, dest, rs1, rs2)
}

fn gen_cmp_imm(
    s: &IrSection,
    start: usize,
    ctx: &mut GenContext,
    cmp: Cmp,
) -> BasilResult<()> {
    let i = inst(s, start)?;
    let (dest, rs1, value) = (reg(i, 0), reg(i, 1), imm(i, 2));
    let (pool, rv_s) = ctx.section();
    if cmp == Cmp::Lt && fits_imm(value) {
        rv_s.add_itype(pool, RvInstrKind::Slti, dest, rs1, value)?;
        return Ok(());
    }
    let tmp = rv_s.acquire_new_reg();
    rv_s.add_li(pool, tmp, value)?;
    emit_cmp(pool, rv_s, cmp, dest, rs1, tmp)
}

macro_rules! cmp_actions {
    ($regfn:ident, $immfn:ident, $cmp:ident) => {
        pub fn $regfn(
            s: &IrSection,
            start: usize,
            ctx: &mut GenContext,
        ) -> BasilResult<()> {
            gen_cmp(s, start, ctx, Cmp::$cmp)
        }

        pub fn $immfn(
            s: &IrSection,
            start: usize,
            ctx: &mut GenContext,
        ) -> BasilResult<()> {
            gen_cmp_imm(s, start, ctx, Cmp::$cmp)
        }
    };
}

cmp_actions!(gen_eqi32, gen_eqii32, Eq);
cmp_actions!(gen_neqi32, gen_neqii32, Neq);
cmp_actions!(gen_lti32, gen_ltii32, Lt);
cmp_actions!(gen_ltei32, gen_lteii32, Lte);
cmp_actions!(gen_gti32, gen_gtii32, Gt);
cmp_actions!(gen_gtei32, gen_gteii32, Gte);

/// FP compares produce an integer truth value.
fn emit_fp_cmp(
    pool: &mut OpPool,
    rv_s: &mut RvSection,
    cmp: Cmp,
    dest: RvReg,
    rs1: RvReg,
    rs2: RvReg,
) -> BasilResult<()> {
    match cmp {
        Cmp::Eq => {
            rv_s.add_real_rtype(pool, RvInstrKind::FeqD, dest, rs1, rs2)?;
        }
        Cmp::Neq => {
            rv_s.add_real_rtype(pool, RvInstrKind::FeqD, dest, rs1, rs2)?;
            rv_s.add_itype(pool, RvInstrKind::Xori, dest, dest, 1)?;
        }
        Cmp::Lt => {
            rv_s.add_real_rtype(pool, RvInstrKind::FltD, dest, rs1, rs2)?;
        }
        Cmp::Lte => {
            rv_s.add_real_rtype(pool, RvInstrKind::FleD, dest, rs1, rs2)?;
        }
        Cmp::Gt => {
            rv_s.add_real_rtype(pool, RvInstrKind::FltD, dest, rs2, rs1)?;
        }
        Cmp::Gte => {
            rv_s.add_real_rtype(pool, RvInstrKind::FleD, dest, rs2, rs1)?;
        }
    }
    Ok(())
}

fn gen_fp_cmp(s: &IrSection, start: usize, ctx: &mut GenContext, cmp: Cmp) -> BasilResult<()> {
    let i = inst(s, start)?;
    let (dest, rs1, rs2) = (reg(i, 0), freg(i, 1), freg(i, 2));
    let (pool, rv_s) = ctx.section();
    emit_fp_cmp(pool, rv_s, cmp, dest, rs1, rs2)
}

macro_rules! fp_cmp_action {
    ($name:ident, $cmp:ident) => {
        pub fn $name(
            s: &IrSection,
            start: usize,
            ctx: &mut GenContext,
        ) -> BasilResult<()> {
            gen_fp_cmp(s, start, ctx, Cmp::$cmp)
        }
    };
}

fp_cmp_action!(gen_eqr, Eq);
fp_cmp_action!(gen_neqr, Neq);
fp_cmp_action!(gen_ltr, Lt);
fp_cmp_action!(gen_lter, Lte);
fp_cmp_action!(gen_gtr, Gt);
fp_cmp_action!(gen_gter, Gte);

// ---------------------------------------------------------------------
// branches
//
// jmpc cond, true_label, false_label: transfer to true_label when cond
// is non-zero.  The fused forms know true_label immediately follows, so
// they branch to false_label on the opposite condition and fall through.

fn add_branch(
    pool: &mut OpPool,
    rv_s: &mut RvSection,
    kind: RvInstrKind,
    rs1: RvReg,
    rs2: RvReg,
    target: usize,
) -> BasilResult<()> {
    rv_s.add_btype(pool, kind, rs1, rs2, target)?;
    // reserved slot for long-branch expansion
    rv_s.add_nop(pool)?;
    Ok(())
}

/// Branch kind and operand order that transfers when `cmp` is false.
fn inverse_branch(cmp: Cmp, rs1: RvReg, rs2: RvReg) -> (RvInstrKind, RvReg, RvReg) {
    match cmp {
        Cmp::Lt => (RvInstrKind::Bge, rs1, rs2),
        Cmp::Gte => (RvInstrKind::Blt, rs1, rs2),
        Cmp::Gt => (RvInstrKind::Bge, rs2, rs1),
        Cmp::Lte => (RvInstrKind::Blt, rs2, rs1),
        Cmp::Eq => (RvInstrKind::Bne, rs1, rs2),
        Cmp::Neq => (RvInstrKind::Beq, rs1, rs2),
    }
}

/// Fused `cmp; jmpc` where the true label follows the branch.  The
/// match window swallows the label, so the action re-emits it; other
/// jumps may target it.
fn gen_if_cmp(
    s: &IrSection,
    start: usize,
    ctx: &mut GenContext,
    cmp: Cmp,
    immediate: bool,
) -> BasilResult<()> {
    let cond = inst(s, start)?;
    let jmpc = inst(s, start + 1)?;
    let true_label = label(jmpc, 1);
    let false_label = label(jmpc, 2);

    let rs1 = reg(cond, 1);
    let (pool, rv_s) = ctx.section();
    let rs2 = if immediate {
        let tmp = rv_s.acquire_new_reg();
        rv_s.add_li(pool, tmp, cond.operands[2].int())?;
        tmp
    } else {
        reg(cond, 2)
    };

    let (kind, a, b) = inverse_branch(cmp, rs1, rs2);
    add_branch(pool, rv_s, kind, a, b, false_label)?;
    rv_s.add_label(pool, true_label)?;
    Ok(())
}

macro_rules! fused_actions {
    ($immfn:ident, $regfn:ident, $cmp:ident) => {
        pub fn $immfn(
            s: &IrSection,
            start: usize,
            ctx: &mut GenContext,
        ) -> BasilResult<()> {
            gen_if_cmp(s, start, ctx, Cmp::$cmp, true)
        }

        pub fn $regfn(
            s: &IrSection,
            start: usize,
            ctx: &mut GenContext,
        ) -> BasilResult<()> {
            gen_if_cmp(s, start, ctx, Cmp::$cmp, false)
        }
    };
}

fused_actions!(gen_if_lt_imm, gen_if_lt, Lt);
fused_actions!(gen_if_lte_imm, gen_if_lte, Lte);
fused_actions!(gen_if_gt_imm, gen_if_gt, Gt);
fused_actions!(gen_if_gte_imm, gen_if_gte, Gte);
fused_actions!(gen_if_eq_imm, gen_if_eq, Eq);
fused_actions!(gen_if_neq_imm, gen_if_neq, Neq);

/// Fused FP `cmp; jmpc`: materialise the compare, then branch on zero.
fn gen_if_fp_cmp(
    s: &IrSection,
    start: usize,
    ctx: &mut GenContext,
    cmp: Cmp,
) -> BasilResult<()> {
    let cond = inst(s, start)?;
    let jmpc = inst(s, start + 1)?;
    let true_label = label(jmpc, 1);
    let false_label = label(jmpc, 2);

    let (rs1, rs2) = (freg(cond, 1), freg(cond, 2));
    let (pool, rv_s) = ctx.section();
    let tmp = rv_s.acquire_new_reg();
    // a feq of a neq condition already reads as "branch when false", so
    // the branch sense flips instead of materialising the inversion
    match cmp {
        Cmp::Neq => {
            rv_s.add_real_rtype(pool, RvInstrKind::FeqD, tmp, rs1, rs2)?;
            add_branch(pool, rv_s, RvInstrKind::Bne, tmp, REG_ZERO, false_label)?;
        }
        _ => {
            emit_fp_cmp(pool, rv_s, cmp, tmp, rs1, rs2)?;
            add_branch(pool, rv_s, RvInstrKind::Beq, tmp, REG_ZERO, false_label)?;
        }
    }
    rv_s.add_label(pool, true_label)?;
    Ok(())
}

macro_rules! fused_fp_action {
    ($name:ident, $cmp:ident) => {
        pub fn $name(
            s: &IrSection,
            start: usize,
            ctx: &mut GenContext,
        ) -> BasilResult<()> {
            gen_if_fp_cmp(s, start, ctx, Cmp::$cmp)
        }
    };
}

fused_fp_action!(gen_if_ltr, Lt);
fused_fp_action!(gen_if_lter, Lte);
fused_fp_action!(gen_if_gtr, Gt);
fused_fp_action!(gen_if_gter, Gte);
fused_fp_action!(gen_if_eqr, Eq);
fused_fp_action!(gen_if_neqr, Neq);

/// `jmpc` whose true label follows: branch to the false label when the
/// condition register is zero.  The window swallows the label, so it is
/// re-emitted.
pub fn gen_jmpc(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    let i = inst(s, start)?;
    let (cond, true_label, false_label) = (reg(i, 0), label(i, 1), label(i, 2));
    let (pool, rv_s) = ctx.section();
    add_branch(pool, rv_s, RvInstrKind::Beq, cond, REG_ZERO, false_label)?;
    rv_s.add_label(pool, true_label)?;
    Ok(())
}

/// `jmpc` whose false label follows: branch to the true label when the
/// condition register is non-zero.
pub fn gen_jmpc_rev(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    let i = inst(s, start)?;
    let (cond, true_label, false_label) = (reg(i, 0), label(i, 1), label(i, 2));
    let (pool, rv_s) = ctx.section();
    add_branch(pool, rv_s, RvInstrKind::Bne, cond, REG_ZERO, true_label)?;
    rv_s.add_label(pool, false_label)?;
    Ok(())
}

/// `jmpc` with neither label adjacent.
pub fn gen_jmpc_no_label(
    s: &IrSection,
    start: usize,
    ctx: &mut GenContext,
) -> BasilResult<()> {
    let i = inst(s, start)?;
    let (cond, true_label, false_label) = (reg(i, 0), label(i, 1), label(i, 2));
    let (pool, rv_s) = ctx.section();
    add_branch(pool, rv_s, RvInstrKind::Bne, cond, REG_ZERO, true_label)?;
    rv_s.add_jump(pool, false_label)?;
    Ok(())
}

pub fn gen_jump(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    let i = inst(s, start)?;
    let target = label(i, 0);
    let (pool, rv_s) = ctx.section();
    rv_s.add_jump(pool, target)?;
    Ok(())
}

pub fn gen_label(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    let IrOp::Label(l) = s.ops[start] else {
        return Err(assertion_failed!());
    };
    let (pool, rv_s) = ctx.section();
    rv_s.add_label(pool, l)?;
    Ok(())
}

// ---------------------------------------------------------------------
// calls and returns

fn move_call_args(
    pool: &mut OpPool,
    rv_s: &mut RvSection,
    args: &[IrArg],
) -> BasilResult<()> {
    let mut ints = 0;
    let mut reals = 0;
    for arg in args {
        match arg {
            IrArg::Int(r) => {
                if ints == MAX_REG_ARGS {
                    return Err(assertion_failed!());
                }
                rv_s.add_mv(pool, REG_A0 + ints, ir_to_rv_reg(*r))?;
                ints += 1;
            }
            IrArg::Real(r) => {
                if reals == MAX_REG_ARGS {
                    return Err(assertion_failed!());
                }
                rv_s.add_fmv(pool, REG_FA0 + reals, ir_to_rv_freg(*r))?;
                reals += 1;
            }
        }
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq)]
enum CallResult {
    None,
    Int,
    Real,
}

fn gen_call_common(
    s: &IrSection,
    start: usize,
    ctx: &mut GenContext,
    result: CallResult,
) -> BasilResult<()> {
    let Some(IrOp::Call {
        target, args, dest, ..
    }) = s.ops.get(start)
    else {
        return Err(assertion_failed!());
    };

    let (pool, rv_s) = ctx.section();
    move_call_args(pool, rv_s, args)?;
    match target {
        CallTarget::Section(section) => {
            rv_s.add_call(pool, *section)?;
        }
        CallTarget::Ptr(ptr) => {
            let site = rv_s.add_jalr(pool, REG_RA, ir_to_rv_reg(*ptr), 0)?;
            rv_s.call_sites.push(site);
        }
    }

    match (result, dest) {
        (CallResult::None, _) => (),
        (CallResult::Int, Some(d)) => {
            rv_s.add_mv(pool, ir_to_rv_reg(*d), REG_A0)?;
        }
        (CallResult::Real, Some(d)) => {
            rv_s.add_fmv(pool, ir_to_rv_freg(*d), REG_FA0)?;
        }
        _ => return Err(assertion_failed!()),
    }
    Ok(())
}

pub fn gen_call(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    gen_call_common(s, start, ctx, CallResult::None)
}

pub fn gen_calli32(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    gen_call_common(s, start, ctx, CallResult::Int)
}

pub fn gen_callr(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    gen_call_common(s, start, ctx, CallResult::Real)
}

/// Stack restore plus return.  The frame size is unknown until the
/// allocator has run, so the restore immediates are placeholders patched
/// through the recorded ret site.
fn add_epilogue(pool: &mut OpPool, rv_s: &mut RvSection) -> BasilResult<()> {
    let lui = rv_s.add_instr(
        pool,
        RvInstrKind::Lui,
        crate::core::RvOperands::U {
            rd: REG_FRAME,
            imm: 0,
        },
    )?;
    rv_s.add_itype(pool, RvInstrKind::Addi, REG_FRAME, REG_FRAME, 0)?;
    rv_s.add_rtype(pool, RvInstrKind::Add, REG_STACK, REG_STACK, REG_FRAME)?;
    rv_s.ret_sites.push(lui);
    rv_s.add_jalr(pool, REG_ZERO, REG_RA, 0)?;
    Ok(())
}

pub fn gen_ret(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    let _ = inst(s, start)?;
    let (pool, rv_s) = ctx.section();
    add_epilogue(pool, rv_s)
}

pub fn gen_reti32(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    let i = inst(s, start)?;
    let value = reg(i, 0);
    let (pool, rv_s) = ctx.section();
    rv_s.add_mv(pool, REG_A0, value)?;
    add_epilogue(pool, rv_s)
}

pub fn gen_retii32(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    let i = inst(s, start)?;
    let value = imm(i, 0);
    let (pool, rv_s) = ctx.section();
    rv_s.add_li(pool, REG_A0, value)?;
    add_epilogue(pool, rv_s)
}

pub fn gen_retr(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    let i = inst(s, start)?;
    let value = freg(i, 0);
    let (pool, rv_s) = ctx.section();
    rv_s.add_fmv(pool, REG_FA0, value)?;
    add_epilogue(pool, rv_s)
}

// ---------------------------------------------------------------------
// addresses and program end

pub fn gen_lca(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    let i = inst(s, start)?;
    let (dest, index) = (reg(i, 0), imm(i, 1) as usize);
    let (pool, rv_s) = ctx.section();
    rv_s.add_lc(pool, dest, index)?;
    Ok(())
}

pub fn gen_get_proc_addr(
    s: &IrSection,
    start: usize,
    ctx: &mut GenContext,
) -> BasilResult<()> {
    let i = inst(s, start)?;
    let (dest, section) = (reg(i, 0), imm(i, 1) as usize);
    let (pool, rv_s) = ctx.section();
    rv_s.add_lp(pool, dest, section)?;
    Ok(())
}

/// Program exit: always status 0 through the exit syscall.
pub fn gen_end(s: &IrSection, start: usize, ctx: &mut GenContext) -> BasilResult<()> {
    let _ = inst(s, start)?;
    let (pool, rv_s) = ctx.section();
    let coda = rv_s.no_cleanup_label;
    rv_s.add_label(pool, coda)?;
    rv_s.add_mv(pool, REG_A0, REG_ZERO)?;
    rv_s.add_li(pool, REG_A7, 93)?;
    rv_s.add_ecall(pool)?;
    Ok(())
}
