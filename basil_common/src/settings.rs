//! Target settings for a compilation

use serde::{Deserialize, Serialize};

/// Capability bit: the target has the M extension (hardware mul/div).
pub const CAP_MUL_DIV: u32 = 1;
/// Capability bit: the target has double-precision floating point.
pub const CAP_DOUBLE_FP: u32 = 2;

/// Per-compilation target settings, owned by the caller and threaded by
/// reference through every back-end phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Address the first instruction of the program is linked at.
    pub start_address: i32,
    /// Size in bytes of the global variable area.
    pub globals: u32,
    /// Capability bit-mask describing the target.
    pub caps: u32,
    /// Dump each machine section after instruction selection.
    pub dump_sections: bool,
    /// Dump sub-section analysis (basic blocks, live sets, save sets).
    pub dump_sub_sections: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            start_address: 0,
            globals: 0,
            caps: CAP_MUL_DIV | CAP_DOUBLE_FP,
            dump_sections: false,
            dump_sub_sections: false,
        }
    }
}

impl Settings {
    pub fn has_cap(&self, cap: u32) -> bool {
        self.caps & cap != 0
    }
}
