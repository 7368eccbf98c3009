//! Machine-code emission
//!
//! The encoder does four things, one section at a time:
//!
//! 1. assembles the instruction list into little-endian words
//! 2. resolves local jumps, growing short branches into a reversed
//!    branch plus `jal` when the target is out of the 4 KiB window
//! 3. records direct calls and address pseudo-ops for the linker
//! 4. flushes the per-section constant pool and patches the
//!    `auipc`+`fld` pairs that reference it
//!
//! Section N+1 starts strictly after section N (modulo alignment), and
//! a section's pool must be flushed before the next section begins or
//! the PC-relative offsets into it would be wrong.

use basil_common::{assertion_failed, BasilError, BasilResult};
use basil_ir::ConstantPool;
use hashbrown::HashMap;

use crate::core::{
    BranchTarget, JumpTarget, OpPool, RvInstrKind, RvOp, RvProg, RvReg, RvSection,
};
use crate::link::{encode_jal_offset, fixup_relative, PairSecond, RvLink, JAL_RANGE};
use crate::opcodes::{fixed_rs2, opcode_info};
use crate::walker::{walk, RvVisitor, WalkFlow, WALK_ON};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EncodeConstKind {
    LdrF,
}

#[derive(Debug, Clone, Copy)]
struct EncodeConst {
    label: usize,
    code_index: usize,
    kind: EncodeConstKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EncodeBpKind {
    Branch,
    Jal,
}

#[derive(Debug, Clone, Copy)]
struct EncodeBp {
    kind: EncodeBpKind,
    label: usize,
    code_index: usize,
}

/// Encoder state shared by every section of one program.
pub struct Encoder {
    code: Vec<u8>,
    label_offsets: HashMap<usize, usize>,
    constants: Vec<EncodeConst>,
    back_patches: Vec<EncodeBp>,
    pub link: RvLink,
}

/// Scatters a byte distance into the B-type immediate field
/// `[12|10:5|4:1|11]`.
fn encode_branch_offset(word: u32, dist: i32) -> u32 {
    let dist = (dist / 2) as u32 & 0xfff;
    let mut word = word;
    word |= (dist & 0xf) << 8;
    word |= (dist & 0x400) >> 3;
    word |= (dist & 0x3f0) << 21;
    word |= (dist & 0x800) << 20;
    word
}

/// Flips a branch's condition in place and points it just past the
/// following instruction.
fn reverse_branch_word(word: u32) -> BasilResult<u32> {
    let funct3 = (word >> 12) & 7;
    let reversed = match funct3 {
        0 => 1, // beq <-> bne
        1 => 0,
        4 => 5, // blt <-> bge
        5 => 4,
        6 => 7, // bltu <-> bgeu
        7 => 6,
        _ => return Err(assertion_failed!()),
    };
    // keep opcode and register fields, clear funct3 and the immediate
    let mut word = word & !(0xfe00_0f80 | 0x7000);
    word |= reversed << 12;
    // skip one instruction (offset 8 from the branch)
    word |= 4 << 8;
    Ok(word)
}

const NOP_WORD: u32 = 0x13;

impl Encoder {
    pub fn new(num_sections: usize) -> Self {
        Self {
            code: Vec::new(),
            label_offsets: HashMap::new(),
            constants: Vec::new(),
            back_patches: Vec::new(),
            link: RvLink::new(num_sections),
        }
    }

    pub fn bytes_written(&self) -> usize {
        self.code.len()
    }

    pub fn label_offset(&self, label: usize) -> Option<usize> {
        self.label_offsets.get(&label).copied()
    }

    fn add_word(&mut self, word: u32) -> BasilResult<()> {
        if self.code.len() & 3 != 0 {
            return Err(BasilError::BadAlignment(self.code.len()));
        }
        if self.code.len() + 4 > self.code.capacity() {
            self.code.try_reserve(4096).map_err(|_| BasilError::Oom)?;
        }
        self.code.extend_from_slice(&word.to_le_bytes());
        Ok(())
    }

    fn word_at(&self, index: usize) -> BasilResult<u32> {
        crate::link::read_word(&self.code, index)
    }

    fn set_word(&mut self, index: usize, word: u32) -> BasilResult<()> {
        crate::link::write_word(&mut self.code, index, word)
    }

    fn align_to(&mut self, alignment: usize) -> BasilResult<()> {
        while self.code.len() % alignment != 0 {
            self.code.push(0);
        }
        Ok(())
    }

    /// Emits an `auipc rd2` / second-instruction pair and returns the
    /// byte index of the `auipc`.
    fn encode_relative(
        &mut self,
        rd: RvReg,
        rd2: RvReg,
        second: RvInstrKind,
    ) -> BasilResult<usize> {
        let pos = self.code.len();
        let auipc = opcode_info(RvInstrKind::Auipc).opcode | ((rd2 as u32 & 0x1f) << 7);
        self.add_word(auipc)?;

        let info = opcode_info(second);
        let mut word = info.opcode | (info.funct3 << 12);
        word |= (rd as u32 & 0x1f) << 7;
        word |= (rd2 as u32 & 0x1f) << 15;
        self.add_word(word)?;
        Ok(pos)
    }

    /// Lays the double pool out at the end of the section and patches
    /// the pairs that reference it.  Doubles must land 8-byte aligned.
    fn flush_constants(&mut self, s: &RvSection) -> BasilResult<()> {
        for cnst in &s.constants.ui32 {
            self.label_offsets.insert(cnst.label, self.code.len());
            self.code.extend_from_slice(&cnst.value.to_le_bytes());
        }

        if !self.constants.is_empty() {
            self.align_to(8)?;
        }

        let deferred = std::mem::take(&mut self.constants);
        for cnst in &deferred {
            match cnst.kind {
                EncodeConstKind::LdrF => {
                    let real = s
                        .constants
                        .real
                        .iter()
                        .find(|r| r.label == cnst.label)
                        .ok_or_else(|| assertion_failed!())?;
                    self.label_offsets.insert(cnst.label, self.code.len());
                    self.code.extend_from_slice(&real.value.to_le_bytes());
                }
            }
        }

        for cnst in &deferred {
            let target = *self
                .label_offsets
                .get(&cnst.label)
                .ok_or_else(|| assertion_failed!())?;
            let dist = target as i64 - cnst.code_index as i64;
            match cnst.kind {
                EncodeConstKind::LdrF => fixup_relative(
                    &mut self.code,
                    cnst.code_index,
                    dist as i32,
                    PairSecond::Fld,
                )?,
            }
        }
        Ok(())
    }

    fn apply_back_patches(&mut self) -> BasilResult<()> {
        let patches = std::mem::take(&mut self.back_patches);
        for bp in &patches {
            let target = *self
                .label_offsets
                .get(&bp.label)
                .ok_or_else(|| assertion_failed!())?;
            let dist = target as i64 - bp.code_index as i64;
            match bp.kind {
                EncodeBpKind::Branch => {
                    if (-4096..=4095).contains(&dist) {
                        let word = self.word_at(bp.code_index)?;
                        self.set_word(
                            bp.code_index,
                            encode_branch_offset(word, dist as i32),
                        )?;
                    } else {
                        self.encode_long_branch(bp.code_index, dist)?;
                    }
                }
                EncodeBpKind::Jal => {
                    if !(-JAL_RANGE..JAL_RANGE).contains(&dist) {
                        return Err(BasilError::JumpTooFar(dist));
                    }
                    let word = self.word_at(bp.code_index)?;
                    self.set_word(
                        bp.code_index,
                        encode_jal_offset(word, dist as i32),
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Reverses the branch so it skips the next instruction and turns
    /// the reserved NOP behind it into an unconditional `jal`.
    fn encode_long_branch(&mut self, code_index: usize, dist: i64) -> BasilResult<()> {
        // the jump is encoded one instruction after the branch
        let dist = dist - 4;
        if !(-JAL_RANGE..JAL_RANGE).contains(&dist) {
            return Err(BasilError::JumpTooFar(dist));
        }

        // The branch, the reserved NOP, and at least one instruction to
        // fall through to must already be in the stream.
        if code_index + 12 > self.code.len() {
            return Err(assertion_failed!());
        }

        let branch = self.word_at(code_index)?;
        self.set_word(code_index, reverse_branch_word(branch)?)?;

        let nop = self.word_at(code_index + 4)?;
        if nop != NOP_WORD {
            return Err(assertion_failed!());
        }
        let jal = opcode_info(RvInstrKind::Jal).opcode;
        self.set_word(code_index + 4, encode_jal_offset(jal, dist as i32))?;
        Ok(())
    }

    /// Encodes one section: instructions, pool flush, back patches and
    /// the final 4-byte alignment.
    pub fn encode_section(
        &mut self,
        pool: &mut OpPool,
        s: &mut RvSection,
        index: usize,
    ) -> BasilResult<()> {
        self.link.set_section_offset(index, self.code.len());
        self.back_patches.clear();
        self.constants.clear();
        self.label_offsets.clear();

        let mut visitor = EncodeVisitor { enc: self };
        walk(pool, s, &mut visitor)?;

        self.flush_constants(s)?;
        self.apply_back_patches()?;
        self.align_to(4)
    }

    /// Appends the program constant pool and resolves every
    /// cross-section reference.
    pub fn finish(mut self, constant_pool: &ConstantPool) -> BasilResult<Vec<u8>> {
        let mut locations = Vec::with_capacity(constant_pool.len());
        for data in constant_pool.iter() {
            if data.dbl {
                self.align_to(8)?;
            }
            locations.push(self.code.len());
            self.code.extend_from_slice(&data.bytes);
            self.align_to(4)?;
        }

        self.link.link(&mut self.code, &locations)?;
        Ok(self.code)
    }
}

struct EncodeVisitor<'a> {
    enc: &'a mut Encoder,
}

impl RvVisitor for EncodeVisitor<'_> {
    fn on_label(
        &mut self,
        _pool: &mut OpPool,
        _s: &mut RvSection,
        _ptr: usize,
        label: usize,
    ) -> BasilResult<WalkFlow> {
        self.enc.label_offsets.insert(label, self.enc.code.len());
        WALK_ON
    }

    fn on_directive(
        &mut self,
        pool: &mut OpPool,
        _s: &mut RvSection,
        ptr: usize,
    ) -> BasilResult<WalkFlow> {
        let enc = &mut *self.enc;
        match pool.op(ptr) {
            RvOp::Align(n) => {
                let n = *n as usize;
                while enc.code.len() % n != 0 {
                    enc.code.push(0);
                }
            }
            RvOp::Byte(b) => enc.code.push(*b),
            RvOp::TwoByte(v) => enc.code.extend_from_slice(&v.to_le_bytes()),
            RvOp::FourByte(v) => enc.code.extend_from_slice(&v.to_le_bytes()),
            RvOp::Double(v) => enc.code.extend_from_slice(&v.to_le_bytes()),
            RvOp::Float(v) => enc.code.extend_from_slice(&v.to_le_bytes()),
            RvOp::StringZ(text) => {
                enc.code.extend_from_slice(text.as_bytes());
                enc.code.push(0);
            }
            _ => return Err(assertion_failed!()),
        }
        WALK_ON
    }

    fn on_rtype(
        &mut self,
        _pool: &mut OpPool,
        _s: &mut RvSection,
        _ptr: usize,
        kind: RvInstrKind,
        rd: RvReg,
        rs1: RvReg,
        rs2: RvReg,
    ) -> BasilResult<WalkFlow> {
        let info = opcode_info(kind);
        let mut word = info.opcode | (info.funct3 << 12) | (info.funct7 << 25);
        word |= (rd as u32 & 0x1f) << 7;
        word |= (rs1 as u32 & 0x1f) << 15;
        word |= (rs2 as u32 & 0x1f) << 20;
        self.enc.add_word(word)?;
        WALK_ON
    }

    fn on_itype(
        &mut self,
        _pool: &mut OpPool,
        _s: &mut RvSection,
        _ptr: usize,
        kind: RvInstrKind,
        rd: RvReg,
        rs1: RvReg,
        imm: i32,
    ) -> BasilResult<WalkFlow> {
        let info = opcode_info(kind);
        let mut word = info.opcode | (info.funct3 << 12);
        word |= (rd as u32 & 0x1f) << 7;
        word |= (rs1 as u32 & 0x1f) << 15;
        match kind {
            RvInstrKind::Ecall => (),
            RvInstrKind::Ebreak => word |= 1 << 20,
            // shift-immediates carry funct7 above the 5-bit shamt
            RvInstrKind::Slli | RvInstrKind::Srli | RvInstrKind::Srai => {
                word |= (imm as u32 & 0x1f) << 20;
                word |= info.funct7 << 25;
            }
            _ => word |= (imm as u32 & 0xfff) << 20,
        }
        self.enc.add_word(word)?;
        WALK_ON
    }

    fn on_stype(
        &mut self,
        _pool: &mut OpPool,
        _s: &mut RvSection,
        _ptr: usize,
        kind: RvInstrKind,
        rs1: RvReg,
        rs2: RvReg,
        imm: i32,
    ) -> BasilResult<WalkFlow> {
        let info = opcode_info(kind);
        let mut word = info.opcode | (info.funct3 << 12);
        let imm = imm as u32;
        word |= (imm & 0x1f) << 7;
        word |= (imm & 0xfe0) << 20;
        word |= (rs1 as u32 & 0x1f) << 15;
        word |= (rs2 as u32 & 0x1f) << 20;
        self.enc.add_word(word)?;
        WALK_ON
    }

    fn on_btype(
        &mut self,
        _pool: &mut OpPool,
        _s: &mut RvSection,
        _ptr: usize,
        kind: RvInstrKind,
        rs1: RvReg,
        rs2: RvReg,
        target: BranchTarget,
    ) -> BasilResult<WalkFlow> {
        let info = opcode_info(kind);
        let mut word = info.opcode | (info.funct3 << 12);
        word |= (rs1 as u32 & 0x1f) << 15;
        word |= (rs2 as u32 & 0x1f) << 20;
        match target {
            BranchTarget::Label(label) => {
                self.enc.back_patches.push(EncodeBp {
                    kind: EncodeBpKind::Branch,
                    label,
                    code_index: self.enc.code.len(),
                });
            }
            BranchTarget::Offset(dist) => word = encode_branch_offset(word, dist),
        }
        self.enc.add_word(word)?;
        WALK_ON
    }

    fn on_utype(
        &mut self,
        _pool: &mut OpPool,
        _s: &mut RvSection,
        _ptr: usize,
        kind: RvInstrKind,
        rd: RvReg,
        imm: u32,
    ) -> BasilResult<WalkFlow> {
        let info = opcode_info(kind);
        let mut word = info.opcode;
        word |= (rd as u32 & 0x1f) << 7;
        word |= imm << 12;
        self.enc.add_word(word)?;
        WALK_ON
    }

    fn on_jtype(
        &mut self,
        _pool: &mut OpPool,
        _s: &mut RvSection,
        _ptr: usize,
        kind: RvInstrKind,
        rd: RvReg,
        target: JumpTarget,
    ) -> BasilResult<WalkFlow> {
        let enc = &mut *self.enc;
        match (kind, target) {
            (RvInstrKind::Lc, JumpTarget::Constant(index)) => {
                let pos = enc.encode_relative(rd, rd, RvInstrKind::Addi)?;
                enc.link.add_constant(pos, index);
            }
            (RvInstrKind::Lp, JumpTarget::Section(index)) => {
                let pos = enc.encode_relative(rd, rd, RvInstrKind::Addi)?;
                enc.link.add_extref(pos, index);
            }
            (RvInstrKind::Jal, target) => {
                let info = opcode_info(kind);
                let mut word = info.opcode | ((rd as u32 & 0x1f) << 7);
                match target {
                    JumpTarget::Section(section) => {
                        // The target section number rides in the
                        // immediate field until link time.
                        enc.link.add_external(enc.code.len());
                        word |= (section as u32) << 12;
                    }
                    JumpTarget::Label(label) => {
                        enc.back_patches.push(EncodeBp {
                            kind: EncodeBpKind::Jal,
                            label,
                            code_index: enc.code.len(),
                        });
                    }
                    JumpTarget::Offset(offset) => {
                        word = encode_jal_offset(word, offset);
                    }
                    JumpTarget::Constant(_) => return Err(assertion_failed!()),
                }
                enc.add_word(word)?;
            }
            _ => return Err(assertion_failed!()),
        }
        WALK_ON
    }

    fn on_real_r(
        &mut self,
        _pool: &mut OpPool,
        _s: &mut RvSection,
        _ptr: usize,
        kind: RvInstrKind,
        rd: RvReg,
        rs1: RvReg,
        rs2: RvReg,
        frm: u32,
    ) -> BasilResult<WalkFlow> {
        let info = opcode_info(kind);
        let mut word = info.opcode;
        word |= (rd as u32 & 0x1f) << 7;
        word |= (rs1 as u32 & 0x1f) << 15;
        if info.use_frm {
            word |= (frm & 7) << 12;
        } else {
            word |= info.funct3 << 12;
        }
        let rs2 = fixed_rs2(kind).unwrap_or(rs2 as u32);
        word |= (rs2 & 0x1f) << 20;
        word |= info.funct7 << 25;
        self.enc.add_word(word)?;
        WALK_ON
    }

    fn on_real_r4(
        &mut self,
        _pool: &mut OpPool,
        _s: &mut RvSection,
        _ptr: usize,
        kind: RvInstrKind,
        rd: RvReg,
        rs1: RvReg,
        rs2: RvReg,
        rs3: RvReg,
        frm: u32,
    ) -> BasilResult<WalkFlow> {
        let info = opcode_info(kind);
        let mut word = info.opcode;
        word |= (rd as u32 & 0x1f) << 7;
        word |= (frm & 7) << 12;
        word |= (rs1 as u32 & 0x1f) << 15;
        word |= (rs2 as u32 & 0x1f) << 20;
        word |= (rs3 as u32 & 0x1f) << 27;
        // double-precision format selector
        word |= 1 << 25;
        self.enc.add_word(word)?;
        WALK_ON
    }

    fn on_real_i(
        &mut self,
        _pool: &mut OpPool,
        _s: &mut RvSection,
        _ptr: usize,
        kind: RvInstrKind,
        rd: RvReg,
        rs1: RvReg,
        imm: i32,
    ) -> BasilResult<WalkFlow> {
        let info = opcode_info(kind);
        let mut word = info.opcode | (info.funct3 << 12);
        word |= (rd as u32 & 0x1f) << 7;
        word |= (rs1 as u32 & 0x1f) << 15;
        word |= (imm as u32 & 0xfff) << 20;
        self.enc.add_word(word)?;
        WALK_ON
    }

    fn on_real_s(
        &mut self,
        _pool: &mut OpPool,
        _s: &mut RvSection,
        _ptr: usize,
        kind: RvInstrKind,
        rs1: RvReg,
        rs2: RvReg,
        imm: i32,
    ) -> BasilResult<WalkFlow> {
        let info = opcode_info(kind);
        let mut word = info.opcode | (info.funct3 << 12);
        let imm = imm as u32;
        word |= (imm & 0x1f) << 7;
        word |= (imm & 0xfe0) << 20;
        word |= (rs1 as u32 & 0x1f) << 15;
        word |= (rs2 as u32 & 0x1f) << 20;
        self.enc.add_word(word)?;
        WALK_ON
    }

    fn on_ldrc_f(
        &mut self,
        _pool: &mut OpPool,
        _s: &mut RvSection,
        _ptr: usize,
        _kind: RvInstrKind,
        rd: RvReg,
        rd2: RvReg,
        label: usize,
    ) -> BasilResult<WalkFlow> {
        let pos = self.enc.encode_relative(rd, rd2, RvInstrKind::Fld)?;
        self.enc.constants.push(EncodeConst {
            label,
            code_index: pos,
            kind: EncodeConstKind::LdrF,
        });
        WALK_ON
    }

    fn on_fence(
        &mut self,
        _pool: &mut OpPool,
        _s: &mut RvSection,
        _ptr: usize,
    ) -> BasilResult<WalkFlow> {
        // fence iorw, iorw
        self.enc.add_word(0x0ff0_000f)?;
        WALK_ON
    }
}

/// Encodes every section of a program in order, appends the program
/// constant pool and links the result into one flat image.
pub fn encode_program(
    pool: &mut OpPool,
    prog: &mut RvProg,
    constant_pool: &ConstantPool,
) -> BasilResult<Vec<u8>> {
    let mut enc = Encoder::new(prog.sections.len());
    for (index, s) in prog.sections.iter_mut().enumerate() {
        enc.encode_section(pool, s, index)?;
    }
    enc.finish(constant_pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{RvOperands, REG_A0, REG_A1, REG_LOCAL, REG_ZERO};
    use basil_common::Settings;
    use basil_ir::TypeSection;

    fn section() -> (OpPool, RvSection) {
        let pool = OpPool::new();
        let s = RvSection::new(
            TypeSection::proc(0, 0),
            3,
            0,
            0,
            0,
            &Settings::default(),
        );
        (pool, s)
    }

    fn encode(pool: &mut OpPool, s: &mut RvSection) -> Vec<u8> {
        let mut enc = Encoder::new(1);
        enc.encode_section(pool, s, 0).unwrap();
        enc.finish(&ConstantPool::default()).unwrap()
    }

    fn words(code: &[u8]) -> Vec<u32> {
        code.chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn test_addi_encoding() {
        let (mut pool, mut s) = section();
        s.add_itype(&mut pool, RvInstrKind::Addi, REG_A0, REG_ZERO, 42)
            .unwrap();
        let code = encode(&mut pool, &mut s);
        // addi a0, x0, 42
        assert_eq!(words(&code)[0], 0x02a0_0513);
    }

    #[test]
    fn test_li_expansion_bytes() {
        let (mut pool, mut s) = section();
        s.add_li(&mut pool, REG_A0, 0x12345).unwrap();
        let code = encode(&mut pool, &mut s);
        let w = words(&code);
        // lui a0, 0x12; addi a0, a0, 0x345
        assert_eq!(w[0], 0x0001_2537);
        assert_eq!(w[1], 0x3455_0513);
    }

    #[test]
    fn test_sw_immediate_split() {
        let (mut pool, mut s) = section();
        // sw a1, 4(a0)
        s.add_sw(&mut pool, REG_A1, REG_A0, 4).unwrap();
        let code = encode(&mut pool, &mut s);
        assert_eq!(words(&code)[0], 0x00b5_2223);

        // a large offset exercises both halves of the split
        let (mut pool, mut s) = section();
        s.add_sw(&mut pool, REG_A1, REG_A0, 0x7fc).unwrap();
        let code = encode(&mut pool, &mut s);
        let w = words(&code)[0];
        let imm = ((w >> 7) & 0x1f) | (((w >> 25) & 0x7f) << 5);
        assert_eq!(imm, 0x7fc);
    }

    #[test]
    fn test_mul_div_encodings() {
        let (mut pool, mut s) = section();
        s.add_rtype(&mut pool, RvInstrKind::Mul, REG_A0, REG_A0, REG_A1)
            .unwrap();
        s.add_rtype(&mut pool, RvInstrKind::Div, REG_A0, REG_A0, REG_A1)
            .unwrap();
        let code = encode(&mut pool, &mut s);
        let w = words(&code);
        assert_eq!(w[0], 0x02b5_0533); // mul a0, a0, a1
        assert_eq!(w[1], 0x02b5_4533); // div a0, a0, a1
    }

    #[test]
    fn test_srai_keeps_funct7() {
        let (mut pool, mut s) = section();
        s.add_itype(&mut pool, RvInstrKind::Srai, REG_A0, REG_A0, 3)
            .unwrap();
        let code = encode(&mut pool, &mut s);
        let w = words(&code)[0];
        assert_eq!(w >> 25, 0x20);
        assert_eq!((w >> 20) & 0x1f, 3);
    }

    #[test]
    fn test_short_forward_branch() {
        let (mut pool, mut s) = section();
        s.add_btype(&mut pool, RvInstrKind::Beq, REG_A0, REG_A1, 1)
            .unwrap();
        // padding before the target
        for _ in 0..24 {
            s.add_nop(&mut pool).unwrap();
        }
        s.add_label(&mut pool, 1).unwrap();
        s.add_nop(&mut pool).unwrap();

        let code = encode(&mut pool, &mut s);
        let w = words(&code)[0];
        // distance 100 bytes: imm[4:1|11] and [12|10:5] carry 100/2
        let dist = 100u32 / 2;
        assert_eq!((w >> 8) & 0xf, dist & 0xf);
        assert_eq!((w >> 25) & 0x3f, (dist >> 4) & 0x3f);
        assert_eq!(w & 0x7f, 0x63);
    }

    #[test]
    fn test_backward_branch_is_negative() {
        let (mut pool, mut s) = section();
        s.add_label(&mut pool, 0).unwrap();
        s.add_nop(&mut pool).unwrap();
        s.add_btype(&mut pool, RvInstrKind::Bne, REG_A0, REG_A1, 0)
            .unwrap();

        let code = encode(&mut pool, &mut s);
        let w = words(&code)[1];
        // sign bit of the immediate (imm[12]) must be set for -4
        assert!(w & 0x8000_0000 != 0);
    }

    #[test]
    fn test_long_branch_expansion() {
        let (mut pool, mut s) = section();
        s.add_btype(&mut pool, RvInstrKind::Beq, REG_A0, REG_A1, 1)
            .unwrap();
        // the reserved slot the expansion rewrites
        s.add_nop(&mut pool).unwrap();
        // > 4 KiB of padding
        for _ in 0..0x800 {
            s.add_itype(&mut pool, RvInstrKind::Addi, REG_A0, REG_A0, 1)
                .unwrap();
        }
        s.add_label(&mut pool, 1).unwrap();
        s.add_nop(&mut pool).unwrap();

        let code = encode(&mut pool, &mut s);
        let w = words(&code);
        // the branch must be reversed (bne) and skip one instruction
        assert_eq!(w[0] & 0x7f, 0x63);
        assert_eq!((w[0] >> 12) & 7, 1);
        assert_eq!((w[0] >> 8) & 0xf, 4);
        // the nop must have become a jal x0 landing on the target,
        // 0x2008 bytes from the branch and 0x2004 from the jal itself
        assert_eq!(w[1] & 0xfff, 0x6f);
        let expected = encode_jal_offset(0x6f, 0x2004);
        assert_eq!(w[1], expected);
    }

    #[test]
    fn test_unconditional_jump_backpatch() {
        let (mut pool, mut s) = section();
        s.add_jump(&mut pool, 1).unwrap();
        s.add_nop(&mut pool).unwrap();
        s.add_label(&mut pool, 1).unwrap();
        s.add_nop(&mut pool).unwrap();

        let code = encode(&mut pool, &mut s);
        let w = words(&code)[0];
        assert_eq!(w, encode_jal_offset(0x6f, 8));
    }

    #[test]
    fn test_label_offsets_point_at_following_instruction() {
        let (mut pool, mut s) = section();
        s.add_nop(&mut pool).unwrap();
        s.add_nop(&mut pool).unwrap();
        s.add_label(&mut pool, 3).unwrap();
        s.add_nop(&mut pool).unwrap();

        let mut enc = Encoder::new(1);
        enc.encode_section(&mut pool, &mut s, 0).unwrap();
        assert_eq!(enc.label_offset(3), Some(8));
    }

    #[test]
    fn test_real_constant_pool_is_8_aligned_and_patched() {
        let (mut pool, mut s) = section();
        let label = s.add_real_constant(1.5);
        s.add_ldrc_f(&mut pool, 4, REG_A0, label).unwrap();
        s.add_nop(&mut pool).unwrap();

        let mut enc = Encoder::new(1);
        enc.encode_section(&mut pool, &mut s, 0).unwrap();
        let pool_off = enc.label_offset(label).unwrap();
        assert_eq!(pool_off % 8, 0);

        let code = enc.finish(&ConstantPool::default()).unwrap();
        assert_eq!(
            f64::from_le_bytes(code[pool_off..pool_off + 8].try_into().unwrap()),
            1.5
        );

        // the auipc+fld pair reconstructs the pool offset
        let auipc = words(&code)[0];
        let fld = words(&code)[1];
        assert_eq!(auipc & 0x7f, 0x17);
        assert_eq!(fld & 0x7f, 0x07);
        let hi = (auipc >> 12) as i32;
        let lo = ((fld >> 20) as i32) << 20 >> 20;
        assert_eq!((hi << 12) + lo, pool_off as i32);
    }

    #[test]
    fn test_fld_pair_through_allocation() {
        // fcvt + fld shapes survive encode after the FP pool flush
        let (mut pool, mut s) = section();
        s.add_fld(&mut pool, 2, REG_LOCAL, 16).unwrap();
        s.add_fsd(&mut pool, 2, REG_LOCAL, 24).unwrap();
        let code = encode(&mut pool, &mut s);
        let w = words(&code);
        // fld f2, 16(x8)
        assert_eq!(w[0], 0x0104_3107);
        // fsd f2, 24(x8)
        assert_eq!(w[1], 0x0024_3c27);
    }

    #[test]
    fn test_sections_are_4_aligned_and_sequential() {
        let mut pool = OpPool::new();
        let mut a = section().1;
        let mut b = section().1;
        a.add_instr(
            &mut pool,
            RvInstrKind::Sb,
            RvOperands::S {
                rs1: REG_A0,
                rs2: REG_A1,
                imm: 0,
            },
        )
        .unwrap();
        b.add_nop(&mut pool).unwrap();

        let mut enc = Encoder::new(2);
        enc.encode_section(&mut pool, &mut a, 0).unwrap();
        let end_a = enc.bytes_written();
        assert_eq!(end_a % 4, 0);
        enc.encode_section(&mut pool, &mut b, 1).unwrap();
        assert!(enc.bytes_written() > end_a);
    }
}
