//! Pre-spill stack slots
//!
//! Every virtual register that crosses a basic-block boundary gets a
//! stable stack slot so that seam stores and loads in different blocks
//! agree on where the value lives.  Integer slots pack 4-byte aligned
//! from offset 0; the double region follows, 8-byte aligned.

use basil_common::{assertion_failed, BasilResult, Bitset};

/// Slot assignment for the block-crossing registers of one section.
#[derive(Debug, Default)]
pub struct PrespillOffsets {
    int_regs: Vec<usize>,
    real_regs: Vec<usize>,
}

impl PrespillOffsets {
    /// Assigns slots to the members of the two global save sets and
    /// returns the assignment plus the bytes of stack it needs.
    pub fn calculate(int_save: &Bitset, real_save: &Bitset) -> (Self, u32) {
        let off = Self {
            int_regs: int_save.values(),
            real_regs: real_save.values(),
        };
        let mut space = (off.int_regs.len() * 4) as u32;
        if off.int_regs.len() % 2 != 0 {
            // keep the double region 8-byte aligned
            space += 4;
        }
        space += (off.real_regs.len() * 8) as u32;
        (off, space)
    }

    pub fn int_offset(&self, reg: usize) -> BasilResult<i32> {
        self.int_regs
            .iter()
            .position(|r| *r == reg)
            .map(|i| (i * 4) as i32)
            .ok_or_else(|| assertion_failed!())
    }

    pub fn real_offset(&self, reg: usize) -> BasilResult<i32> {
        let mut base = self.int_regs.len() * 4;
        if self.int_regs.len() % 2 != 0 {
            base += 4;
        }
        self.real_regs
            .iter()
            .position(|r| *r == reg)
            .map(|i| (base + i * 8) as i32)
            .ok_or_else(|| assertion_failed!())
    }
}

/// Splits the save sets of a two-edge block into the part common to both
/// edges (stored before the branch) and the parts specific to each edge.
pub fn compute_save_sets(
    link1_save: &Bitset,
    link2_save: &Bitset,
) -> BasilResult<(Bitset, Bitset, Bitset)> {
    let mut common = link1_save.clone();
    common.and(link2_save);

    let mut only1 = link1_save.clone();
    only1.sub(&common);

    let mut only2 = link2_save.clone();
    only2.sub(&common);

    Ok((common, only1, only2))
}
