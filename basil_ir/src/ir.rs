//! IR data model
//!
//! The IR is three-address and mostly RISC-like.  Integer and floating
//! point registers live in separate namespaces; a handful of low integer
//! register numbers are reserved for the globals pointer, the locals
//! pointer and the stack pointer, and temporaries start above them.

use basil_common::Settings;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::pools::{ConstantPool, StringPool};

/// Reserved IR register: base of the global variable area.
pub const IR_REG_GLOBAL: u32 = 0;
/// Reserved IR register: base of the local variable area.
pub const IR_REG_LOCAL: u32 = 1;
/// Reserved IR register: the stack pointer.
pub const IR_REG_STACK: u32 = 2;
/// First IR register number usable for temporaries.
pub const IR_REG_TEMP_START: u32 = 3;

/// Most instruction kinds take at most this many operands.
pub const IR_MAX_OP_ARGS: usize = 4;

/// Operand shape of an instruction kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandClass {
    Register,
    FRegister,
    I32,
    Real,
    Label,
}

/// Typed IR instruction kinds.
///
/// The `ii32` suffix marks an integer-immediate form, the `r` suffix a
/// double-precision form and `ir` a double-immediate form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IrOpKind {
    AddI32,
    AddR,
    SubI32,
    SubR,
    MulI32,
    MulR,
    DivI32,
    ModI32,
    DivR,
    AddII32,
    AddIR,
    SubII32,
    SubIR,
    MulII32,
    MulIR,
    DivII32,
    DivIR,
    RsubII32,
    LoadOI8,
    LoadOI32,
    LoadOR,
    StoreOI8,
    StoreOI32,
    StoreOR,
    MovII32,
    MovIR,
    Mov,
    MovFP,
    MovI32FP,
    MovFPI32,
    AndI32,
    AndII32,
    OrI32,
    OrII32,
    EorI32,
    EorII32,
    NotI32,
    EqI32,
    EqR,
    EqII32,
    NeqI32,
    NeqR,
    NeqII32,
    GtI32,
    GtR,
    GtII32,
    LteI32,
    LteR,
    LteII32,
    LtI32,
    LtR,
    LtII32,
    GteI32,
    GteR,
    GteII32,
    JmpC,
    JmpCNf,
    Jmp,
    Ret,
    RetI32,
    RetII32,
    RetR,
    LslI32,
    LslII32,
    LsrI32,
    LsrII32,
    AsrI32,
    AsrII32,
    Nop,
    End,
    Lca,
    GetProcAddr,
}

struct OpDesc {
    name: &'static str,
    classes: &'static [OperandClass],
}

use OperandClass::{FRegister as F, I32, Label as L, Real, Register as R};

const RRR: &[OperandClass] = &[R, R, R];
const FFF: &[OperandClass] = &[F, F, F];
const RRI: &[OperandClass] = &[R, R, I32];
const FRI: &[OperandClass] = &[F, R, I32];
const FFD: &[OperandClass] = &[F, F, Real];
const RLL: &[OperandClass] = &[R, L, L];
const RFF: &[OperandClass] = &[R, F, F];
const RI: &[OperandClass] = &[R, I32];
const FD: &[OperandClass] = &[F, Real];
const RR: &[OperandClass] = &[R, R];
const FF: &[OperandClass] = &[F, F];
const FR: &[OperandClass] = &[F, R];
const RF: &[OperandClass] = &[R, F];
const RO: &[OperandClass] = &[R];
const FO: &[OperandClass] = &[F];
const IO: &[OperandClass] = &[I32];
const LO: &[OperandClass] = &[L];
const NONE: &[OperandClass] = &[];

impl IrOpKind {
    fn desc(self) -> OpDesc {
        let (name, classes) = match self {
            Self::AddI32 => ("addi32", RRR),
            Self::AddR => ("addr", FFF),
            Self::SubI32 => ("subi32", RRR),
            Self::SubR => ("subr", FFF),
            Self::MulI32 => ("muli32", RRR),
            Self::MulR => ("mulr", FFF),
            Self::DivI32 => ("divi32", RRR),
            Self::ModI32 => ("modi32", RRR),
            Self::DivR => ("divr", FFF),
            Self::AddII32 => ("addii32", RRI),
            Self::AddIR => ("addir", FFD),
            Self::SubII32 => ("subii32", RRI),
            Self::SubIR => ("subir", FFD),
            Self::MulII32 => ("mulii32", RRI),
            Self::MulIR => ("mulir", FFD),
            Self::DivII32 => ("divii32", RRI),
            Self::DivIR => ("divir", FFD),
            Self::RsubII32 => ("rsubii32", RRI),
            Self::LoadOI8 => ("loadoi8", RRI),
            Self::LoadOI32 => ("loadoi32", RRI),
            Self::LoadOR => ("loador", FRI),
            Self::StoreOI8 => ("storeoi8", RRI),
            Self::StoreOI32 => ("storeoi32", RRI),
            Self::StoreOR => ("storeor", FRI),
            Self::MovII32 => ("movii32", RI),
            Self::MovIR => ("movir", FD),
            Self::Mov => ("mov", RR),
            Self::MovFP => ("movfp", FF),
            Self::MovI32FP => ("movi32fp", FR),
            Self::MovFPI32 => ("movfpi32", RF),
            Self::AndI32 => ("andi32", RRR),
            Self::AndII32 => ("andii32", RRI),
            Self::OrI32 => ("ori32", RRR),
            Self::OrII32 => ("orii32", RRI),
            Self::EorI32 => ("eori32", RRR),
            Self::EorII32 => ("eorii32", RRI),
            Self::NotI32 => ("noti32", RR),
            Self::EqI32 => ("eqi32", RRR),
            Self::EqR => ("eqr", RFF),
            Self::EqII32 => ("eqii32", RRI),
            Self::NeqI32 => ("neqi32", RRR),
            Self::NeqR => ("neqr", RFF),
            Self::NeqII32 => ("neqii32", RRI),
            Self::GtI32 => ("gti32", RRR),
            Self::GtR => ("gtr", RFF),
            Self::GtII32 => ("gtii32", RRI),
            Self::LteI32 => ("ltei32", RRR),
            Self::LteR => ("lter", RFF),
            Self::LteII32 => ("lteii32", RRI),
            Self::LtI32 => ("lti32", RRR),
            Self::LtR => ("ltr", RFF),
            Self::LtII32 => ("ltii32", RRI),
            Self::GteI32 => ("gtei32", RRR),
            Self::GteR => ("gter", RFF),
            Self::GteII32 => ("gteii32", RRI),
            Self::JmpC => ("jmpc", RLL),
            Self::JmpCNf => ("jmpcnf", RLL),
            Self::Jmp => ("jmp", LO),
            Self::Ret => ("ret", NONE),
            Self::RetI32 => ("reti32", RO),
            Self::RetII32 => ("retii32", IO),
            Self::RetR => ("retr", FO),
            Self::LslI32 => ("lsli32", RRR),
            Self::LslII32 => ("lslii32", RRI),
            Self::LsrI32 => ("lsri32", RRR),
            Self::LsrII32 => ("lsrii32", RRI),
            Self::AsrI32 => ("asri32", RRR),
            Self::AsrII32 => ("asrii32", RRI),
            Self::Nop => ("nop", NONE),
            Self::End => ("end", NONE),
            Self::Lca => ("lca", RI),
            Self::GetProcAddr => ("getprocaddr", RI),
        };
        OpDesc { name, classes }
    }

    pub fn name(self) -> &'static str {
        self.desc().name
    }

    pub fn operand_classes(self) -> &'static [OperandClass] {
        self.desc().classes
    }

    pub fn from_name(name: &str) -> Option<Self> {
        ALL_KINDS.iter().copied().find(|k| k.name() == name)
    }
}

const ALL_KINDS: &[IrOpKind] = &[
    IrOpKind::AddI32,
    IrOpKind::AddR,
    IrOpKind::SubI32,
    IrOpKind::SubR,
    IrOpKind::MulI32,
    IrOpKind::MulR,
    IrOpKind::DivI32,
    IrOpKind::ModI32,
    IrOpKind::DivR,
    IrOpKind::AddII32,
    IrOpKind::AddIR,
    IrOpKind::SubII32,
    IrOpKind::SubIR,
    IrOpKind::MulII32,
    IrOpKind::MulIR,
    IrOpKind::DivII32,
    IrOpKind::DivIR,
    IrOpKind::RsubII32,
    IrOpKind::LoadOI8,
    IrOpKind::LoadOI32,
    IrOpKind::LoadOR,
    IrOpKind::StoreOI8,
    IrOpKind::StoreOI32,
    IrOpKind::StoreOR,
    IrOpKind::MovII32,
    IrOpKind::MovIR,
    IrOpKind::Mov,
    IrOpKind::MovFP,
    IrOpKind::MovI32FP,
    IrOpKind::MovFPI32,
    IrOpKind::AndI32,
    IrOpKind::AndII32,
    IrOpKind::OrI32,
    IrOpKind::OrII32,
    IrOpKind::EorI32,
    IrOpKind::EorII32,
    IrOpKind::NotI32,
    IrOpKind::EqI32,
    IrOpKind::EqR,
    IrOpKind::EqII32,
    IrOpKind::NeqI32,
    IrOpKind::NeqR,
    IrOpKind::NeqII32,
    IrOpKind::GtI32,
    IrOpKind::GtR,
    IrOpKind::GtII32,
    IrOpKind::LteI32,
    IrOpKind::LteR,
    IrOpKind::LteII32,
    IrOpKind::LtI32,
    IrOpKind::LtR,
    IrOpKind::LtII32,
    IrOpKind::GteI32,
    IrOpKind::GteR,
    IrOpKind::GteII32,
    IrOpKind::JmpC,
    IrOpKind::JmpCNf,
    IrOpKind::Jmp,
    IrOpKind::Ret,
    IrOpKind::RetI32,
    IrOpKind::RetII32,
    IrOpKind::RetR,
    IrOpKind::LslI32,
    IrOpKind::LslII32,
    IrOpKind::LsrI32,
    IrOpKind::LsrII32,
    IrOpKind::AsrI32,
    IrOpKind::AsrII32,
    IrOpKind::Nop,
    IrOpKind::End,
    IrOpKind::Lca,
    IrOpKind::GetProcAddr,
];

/// A single operand of an IR instruction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum IrOperand {
    Reg(u32),
    FReg(u32),
    I32(i32),
    Real(f64),
    Label(usize),
}

impl IrOperand {
    pub fn reg(&self) -> u32 {
        match self {
            Self::Reg(r) | Self::FReg(r) => *r,
            _ => 0,
        }
    }

    pub fn int(&self) -> i32 {
        match self {
            Self::I32(v) => *v,
            _ => 0,
        }
    }

    pub fn real(&self) -> f64 {
        match self {
            Self::Real(v) => *v,
            _ => 0.0,
        }
    }

    pub fn label(&self) -> usize {
        match self {
            Self::Label(l) => *l,
            _ => 0,
        }
    }
}

impl fmt::Display for IrOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reg(r) => write!(f, "r{r}"),
            Self::FReg(r) => write!(f, "f{r}"),
            Self::I32(v) => write!(f, "{v}"),
            Self::Real(v) => write!(f, "{v}"),
            Self::Label(l) => write!(f, "label_{l}"),
        }
    }
}

/// A typed IR instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrInst {
    pub kind: IrOpKind,
    pub operands: Vec<IrOperand>,
}

impl fmt::Display for IrInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.name())?;
        for (i, op) in self.operands.iter().enumerate() {
            if i == 0 {
                write!(f, " {op}")?;
            } else {
                write!(f, ", {op}")?;
            }
        }
        Ok(())
    }
}

/// Function call flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallKind {
    /// Procedure call, no result.
    Proc,
    /// Function call returning an i32.
    I32,
    /// Function call returning a double.
    Real,
}

/// Where a call transfers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallTarget {
    /// Direct call to another section of the program.
    Section(usize),
    /// Indirect call through a function pointer held in an integer reg.
    Ptr(u32),
}

/// One call argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IrArg {
    Int(u32),
    Real(u32),
}

/// One entry of a section's instruction stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IrOp {
    Instr(IrInst),
    Label(usize),
    Call {
        kind: CallKind,
        target: CallTarget,
        args: Vec<IrArg>,
        /// Register receiving the result, for `I32`/`Real` kinds.
        dest: Option<u32>,
    },
}

impl IrOp {
    pub fn is_nop(&self) -> bool {
        matches!(self, IrOp::Instr(i) if i.kind == IrOpKind::Nop)
    }
}

impl fmt::Display for IrOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrOp::Instr(i) => i.fmt(f),
            IrOp::Label(l) => write!(f, "label_{l}"),
            IrOp::Call { kind, target, .. } => {
                let name = match (kind, target) {
                    (CallKind::Proc, CallTarget::Section(_)) => "call",
                    (CallKind::I32, CallTarget::Section(_)) => "calli32",
                    (CallKind::Real, CallTarget::Section(_)) => "callr",
                    (CallKind::Proc, CallTarget::Ptr(_)) => "callptr",
                    (CallKind::I32, CallTarget::Ptr(_)) => "calli32ptr",
                    (CallKind::Real, CallTarget::Ptr(_)) => "callrptr",
                };
                write!(f, "{name}")
            }
        }
    }
}

/// How a section reaches the back end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SectionKind {
    /// Normal IR, compiled through the pattern matcher.
    Ir,
    /// Runtime helper lowered directly by the back end.
    BackendBuiltin,
    /// Pre-compiled machine code registered with the driver.
    Asm,
}

/// Return-type tag of a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetType {
    Void,
    I32,
    Real,
}

/// Type signature of a section; the register allocator needs the argument
/// counts to reserve ABI registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeSection {
    pub int_args: usize,
    pub real_args: usize,
    pub ret: RetType,
}

impl TypeSection {
    pub fn proc(int_args: usize, real_args: usize) -> Self {
        Self {
            int_args,
            real_args,
            ret: RetType::Void,
        }
    }
}

/// One function's worth of IR.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrSection {
    pub kind: SectionKind,
    pub stype: TypeSection,
    pub ops: Vec<IrOp>,
    /// One past the highest IR integer register in use.
    pub reg_counter: u32,
    /// One past the highest IR float register in use.
    pub freg_counter: u32,
    /// One past the highest label in use.
    pub label_counter: usize,
    /// Local-variable frame size in bytes.
    pub locals: u32,
}

impl IrSection {
    pub fn new(kind: SectionKind, stype: TypeSection) -> Self {
        Self {
            kind,
            stype,
            ops: Vec::new(),
            reg_counter: IR_REG_TEMP_START,
            freg_counter: 0,
            label_counter: 0,
            locals: 0,
        }
    }

    pub fn add_instr(&mut self, kind: IrOpKind, operands: Vec<IrOperand>) {
        self.ops.push(IrOp::Instr(IrInst { kind, operands }));
    }

    pub fn add_label(&mut self, label: usize) {
        if label >= self.label_counter {
            self.label_counter = label + 1;
        }
        self.ops.push(IrOp::Label(label));
    }

    pub fn new_reg(&mut self) -> u32 {
        let reg = self.reg_counter;
        self.reg_counter += 1;
        reg
    }

    pub fn new_label(&mut self) -> usize {
        let label = self.label_counter;
        self.label_counter += 1;
        label
    }
}

/// A whole program, ready for a back end.
///
/// Section 0 is the program entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrProgram {
    pub sections: Vec<IrSection>,
    pub string_pool: StringPool,
    pub constant_pool: ConstantPool,
    pub settings: Settings,
}

impl IrProgram {
    pub fn new(settings: Settings) -> Self {
        Self {
            sections: Vec::new(),
            string_pool: StringPool::default(),
            constant_pool: ConstantPool::default(),
            settings,
        }
    }

    pub fn dump(&self) {
        for (i, s) in self.sections.iter().enumerate() {
            log::debug!(
                "section {} [{}]:",
                i,
                self.string_pool.name(i).unwrap_or("?")
            );
            for op in &s.ops {
                log::debug!("    {op}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trips_through_name() {
        for kind in ALL_KINDS {
            assert_eq!(IrOpKind::from_name(kind.name()), Some(*kind));
        }
    }

    #[test]
    fn test_operand_classes_match_arity() {
        assert_eq!(IrOpKind::MovII32.operand_classes().len(), 2);
        assert_eq!(IrOpKind::StoreOI32.operand_classes().len(), 3);
        assert_eq!(IrOpKind::End.operand_classes().len(), 0);
    }

    #[test]
    fn test_instr_display() {
        let inst = IrInst {
            kind: IrOpKind::AddII32,
            operands: vec![
                IrOperand::Reg(4),
                IrOperand::Reg(3),
                IrOperand::I32(7),
            ],
        };
        assert_eq!(inst.to_string(), "addii32 r4, r3, 7");
    }
}
