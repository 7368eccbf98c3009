//! Peephole pass with a window size of one
//!
//! Allocation leaves behind moves whose source and destination collapsed
//! onto the same physical register.  `addi x0, x0, 0` is exempt: those
//! are the reserved slots the long-branch expansion rewrites into jumps.

use basil_common::BasilResult;

use crate::core::{OpPool, RvInstrKind, RvOp, RvOperands, RvSection, REG_ZERO};

fn is_noop(op: &RvOp) -> bool {
    let RvOp::Instr(instr) = op else {
        return false;
    };
    match instr.operands {
        RvOperands::I { rd, rs1, imm } => {
            instr.kind == RvInstrKind::Addi && rd == rs1 && imm == 0 && rd != REG_ZERO
        }
        RvOperands::RealR { rd, rs1, rs2, .. } => {
            instr.kind == RvInstrKind::FsgnjD && rd == rs1 && rd == rs2
        }
        _ => false,
    }
}

/// Removes no-op moves from the section.
pub fn peephole(pool: &mut OpPool, s: &mut RvSection) -> BasilResult<()> {
    let mut ptr = s.first_op;
    while let Some(p) = ptr {
        let next = pool.node(p).next;
        if is_noop(pool.op(p)) {
            s.unlink(pool, p);
        }
        ptr = next;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{REG_A0, REG_A1};
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

    fn count_ops(pool: &OpPool, s: &RvSection) -> usize {
        let mut n = 0;
        let mut ptr = s.first_op;
        while let Some(p) = ptr {
            n += 1;
            ptr = pool.node(p).next;
        }
        n
    }

    #[test]
    fn test_removes_self_moves() {
        let (mut pool, mut s) = section();
        s.add_mv(&mut pool, REG_A0, REG_A0).unwrap();
        s.add_mv(&mut pool, REG_A0, REG_A1).unwrap();
        s.add_fmv(&mut pool, 4, 4).unwrap();
        s.add_fmv(&mut pool, 4, 5).unwrap();

        peephole(&mut pool, &mut s).unwrap();
        assert_eq!(count_ops(&pool, &s), 2);
        assert_eq!(s.len, 2);
    }

    #[test]
    fn test_keeps_reserved_nops() {
        // addi x0, x0, 0 is the branch-expansion slot and must survive
        let (mut pool, mut s) = section();
        s.add_nop(&mut pool).unwrap();
        peephole(&mut pool, &mut s).unwrap();
        assert_eq!(count_ops(&pool, &s), 1);
    }

    #[test]
    fn test_removes_run_at_list_head_and_tail() {
        let (mut pool, mut s) = section();
        s.add_mv(&mut pool, REG_A0, REG_A0).unwrap();
        let keep = s.add_mv(&mut pool, REG_A0, REG_A1).unwrap();
        s.add_mv(&mut pool, REG_A1, REG_A1).unwrap();

        peephole(&mut pool, &mut s).unwrap();
        assert_eq!(s.first_op, Some(keep));
        assert_eq!(s.last_op, Some(keep));
        assert_eq!(count_ops(&pool, &s), 1);
    }
}
