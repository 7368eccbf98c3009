//! Per-opcode encoding table
//!
//! Each instruction kind maps to its major opcode, `funct3`/`funct7`
//! fields and whether the `funct3` slot carries a rounding mode instead.
//! The pseudo-ops (`lc`, `lp`, `ldrc_f`) never reach this table; the
//! encoder expands them into `auipc` pairs first.

use crate::core::RvInstrKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RvOpcodeInfo {
    pub opcode: u32,
    pub funct3: u32,
    pub funct7: u32,
    /// The funct3 slot holds the FP rounding mode.
    pub use_frm: bool,
}

const fn op(opcode: u32, funct3: u32, funct7: u32) -> RvOpcodeInfo {
    RvOpcodeInfo {
        opcode,
        funct3,
        funct7,
        use_frm: false,
    }
}

const fn op_frm(opcode: u32, funct7: u32) -> RvOpcodeInfo {
    RvOpcodeInfo {
        opcode,
        funct3: 0,
        funct7,
        use_frm: true,
    }
}

pub fn opcode_info(kind: RvInstrKind) -> RvOpcodeInfo {
    use RvInstrKind::*;
    match kind {
        Addi => op(0x13, 0x0, 0x0),
        Slti => op(0x13, 0x2, 0x0),
        Sltiu => op(0x13, 0x3, 0x0),
        Andi => op(0x13, 0x7, 0x0),
        Ori => op(0x13, 0x6, 0x0),
        Xori => op(0x13, 0x4, 0x0),
        Slli => op(0x13, 0x1, 0x0),
        Srli => op(0x13, 0x5, 0x0),
        Srai => op(0x13, 0x5, 0x20),
        Lui => op(0x37, 0x0, 0x0),
        Auipc => op(0x17, 0x0, 0x0),
        Add => op(0x33, 0x0, 0x0),
        Slt => op(0x33, 0x2, 0x0),
        Sltu => op(0x33, 0x3, 0x0),
        And => op(0x33, 0x7, 0x0),
        Or => op(0x33, 0x6, 0x0),
        Xor => op(0x33, 0x4, 0x0),
        Sll => op(0x33, 0x1, 0x0),
        Srl => op(0x33, 0x5, 0x0),
        Sub => op(0x33, 0x0, 0x20),
        Sra => op(0x33, 0x5, 0x20),
        Jal => op(0x6f, 0x0, 0x0),
        Jalr => op(0x67, 0x0, 0x0),
        Beq => op(0x63, 0x0, 0x0),
        Bne => op(0x63, 0x1, 0x0),
        Blt => op(0x63, 0x4, 0x0),
        Bltu => op(0x63, 0x6, 0x0),
        Bge => op(0x63, 0x5, 0x0),
        Bgeu => op(0x63, 0x7, 0x0),
        Lw => op(0x03, 0x2, 0x0),
        Lh => op(0x03, 0x1, 0x0),
        Lhu => op(0x03, 0x5, 0x0),
        Lb => op(0x03, 0x0, 0x0),
        Lbu => op(0x03, 0x4, 0x0),
        Sw => op(0x23, 0x2, 0x0),
        Sh => op(0x23, 0x1, 0x0),
        Sb => op(0x23, 0x0, 0x0),
        Fence => op(0x0f, 0x0, 0x0),
        Ecall => op(0x73, 0x0, 0x0),
        Ebreak => op(0x73, 0x0, 0x0),
        Mul => op(0x33, 0x0, 0x1),
        Mulh => op(0x33, 0x1, 0x1),
        Mulhsu => op(0x33, 0x2, 0x1),
        Mulhu => op(0x33, 0x3, 0x1),
        Div => op(0x33, 0x4, 0x1),
        Divu => op(0x33, 0x5, 0x1),
        Rem => op(0x33, 0x6, 0x1),
        Remu => op(0x33, 0x7, 0x1),
        Fld => op(0x07, 0x3, 0x0),
        Fsd => op(0x27, 0x3, 0x0),
        FaddD => op_frm(0x53, 0x01),
        FsubD => op_frm(0x53, 0x05),
        FmulD => op_frm(0x53, 0x09),
        FdivD => op_frm(0x53, 0x0d),
        FsqrtD => op_frm(0x53, 0x2d),
        FsgnjD => op(0x53, 0x0, 0x11),
        FsgnjnD => op(0x53, 0x1, 0x11),
        FsgnjxD => op(0x53, 0x2, 0x11),
        FminD => op(0x53, 0x0, 0x15),
        FmaxD => op(0x53, 0x1, 0x15),
        FcvtWD => op_frm(0x53, 0x61),
        FcvtDW => op_frm(0x53, 0x69),
        FeqD => op(0x53, 0x2, 0x51),
        FltD => op(0x53, 0x1, 0x51),
        FleD => op(0x53, 0x0, 0x51),
        FclassD => op(0x53, 0x1, 0x71),
        FmaddD => op_frm(0x43, 0x0),
        FmsubD => op_frm(0x47, 0x0),
        FnmsubD => op_frm(0x4b, 0x0),
        FnmaddD => op_frm(0x4f, 0x0),
        // Pseudo-ops are expanded before encoding.
        Lc | Lp | LdrcF => op(0, 0, 0),
    }
}

/// Conversions and classifications encode a function selector in rs2.
pub fn fixed_rs2(kind: RvInstrKind) -> Option<u32> {
    use RvInstrKind::*;
    match kind {
        FsqrtD | FcvtWD | FcvtDW | FclassD => Some(0),
        _ => None,
    }
}

/// The branch condition a reversed branch needs, for long-branch
/// expansion.
pub fn reverse_branch_kind(kind: RvInstrKind) -> Option<RvInstrKind> {
    use RvInstrKind::*;
    match kind {
        Beq => Some(Bne),
        Bne => Some(Beq),
        Blt => Some(Bge),
        Bge => Some(Blt),
        Bltu => Some(Bgeu),
        Bgeu => Some(Bltu),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_funct3_pairs_reverse() {
        use RvInstrKind::*;
        for kind in [Beq, Bne, Blt, Bge, Bltu, Bgeu] {
            let rev = reverse_branch_kind(kind).unwrap();
            assert_eq!(reverse_branch_kind(rev), Some(kind));
            assert_ne!(opcode_info(kind).funct3, opcode_info(rev).funct3);
            assert_eq!(opcode_info(kind).opcode, opcode_info(rev).opcode);
        }
    }

    #[test]
    fn test_loads_and_stores_share_width_selectors() {
        assert_eq!(
            opcode_info(RvInstrKind::Lw).funct3,
            opcode_info(RvInstrKind::Sw).funct3
        );
        assert_eq!(
            opcode_info(RvInstrKind::Lh).funct3,
            opcode_info(RvInstrKind::Sh).funct3
        );
        assert_eq!(
            opcode_info(RvInstrKind::Lb).funct3,
            opcode_info(RvInstrKind::Sb).funct3
        );
    }
}
