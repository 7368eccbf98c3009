//! A small RV32IM interpreter for exercising generated code.
//!
//! Executes raw linked code (not the ELF wrapper) from offset 0 until
//! the exit syscall fires.  Just enough of the ISA is implemented to
//! run what the back end emits for integer programs; the `mmap` syscall
//! hands out a fixed heap address.

use std::collections::HashMap;

pub const HEAP_BASE: u32 = 0x0020_0000;
const STACK_TOP: u32 = 0x0008_0000;

pub struct Machine {
    pub regs: [i32; 32],
    pub mem: HashMap<u32, u8>,
    pub pc: u32,
    pub exit_code: Option<i32>,
    pub steps: usize,
}

impl Machine {
    fn new() -> Self {
        let mut m = Self {
            regs: [0; 32],
            mem: HashMap::new(),
            pc: 0,
            exit_code: None,
            steps: 0,
        };
        m.regs[2] = STACK_TOP as i32;
        m
    }

    pub fn read8(&self, addr: u32) -> u8 {
        *self.mem.get(&addr).unwrap_or(&0)
    }

    pub fn read32(&self, addr: u32) -> u32 {
        u32::from_le_bytes([
            self.read8(addr),
            self.read8(addr + 1),
            self.read8(addr + 2),
            self.read8(addr + 3),
        ])
    }

    fn write8(&mut self, addr: u32, value: u8) {
        self.mem.insert(addr, value);
    }

    fn write32(&mut self, addr: u32, value: u32) {
        for (i, b) in value.to_le_bytes().iter().enumerate() {
            self.write8(addr + i as u32, *b);
        }
    }

    fn set(&mut self, rd: usize, value: i32) {
        if rd != 0 {
            self.regs[rd] = value;
        }
    }

    fn branch_imm(word: u32) -> i32 {
        let imm = ((word >> 8) & 0xf) << 1
            | ((word >> 25) & 0x3f) << 5
            | ((word >> 7) & 1) << 11
            | ((word >> 31) & 1) << 12;
        ((imm as i32) << 19) >> 19
    }

    fn jal_imm(word: u32) -> i32 {
        let imm = ((word >> 21) & 0x3ff) << 1
            | ((word >> 20) & 1) << 11
            | ((word >> 12) & 0xff) << 12
            | ((word >> 31) & 1) << 20;
        ((imm as i32) << 11) >> 11
    }

    fn i_imm(word: u32) -> i32 {
        (word as i32) >> 20
    }

    fn s_imm(word: u32) -> i32 {
        let imm = ((word >> 7) & 0x1f) | ((word >> 25) & 0x7f) << 5;
        ((imm as i32) << 20) >> 20
    }

    fn step(&mut self, code: &[u8]) {
        let pc = self.pc as usize;
        let word = u32::from_le_bytes(code[pc..pc + 4].try_into().unwrap());
        let opcode = word & 0x7f;
        let rd = ((word >> 7) & 0x1f) as usize;
        let funct3 = (word >> 12) & 7;
        let funct7 = word >> 25;
        let rs1 = ((word >> 15) & 0x1f) as usize;
        let rs2 = ((word >> 20) & 0x1f) as usize;
        let a = self.regs[rs1];
        let b = self.regs[rs2];
        let mut next = self.pc.wrapping_add(4);

        match opcode {
            0x13 => {
                let imm = Self::i_imm(word);
                let value = match funct3 {
                    0 => a.wrapping_add(imm),
                    1 => a.wrapping_shl(rs2 as u32),
                    2 => (a < imm) as i32,
                    3 => ((a as u32) < imm as u32) as i32,
                    4 => a ^ imm,
                    5 if funct7 == 0x20 => a.wrapping_shr(rs2 as u32),
                    5 => ((a as u32).wrapping_shr(rs2 as u32)) as i32,
                    6 => a | imm,
                    7 => a & imm,
                    _ => panic!("itype funct3 {funct3}"),
                };
                self.set(rd, value);
            }
            0x33 => {
                let value = if funct7 == 1 {
                    match funct3 {
                        0 => a.wrapping_mul(b),
                        4 => {
                            if b == 0 {
                                -1
                            } else {
                                a.wrapping_div(b)
                            }
                        }
                        6 => {
                            if b == 0 {
                                a
                            } else {
                                a.wrapping_rem(b)
                            }
                        }
                        _ => panic!("m-ext funct3 {funct3}"),
                    }
                } else {
                    match funct3 {
                        0 if funct7 == 0x20 => a.wrapping_sub(b),
                        0 => a.wrapping_add(b),
                        1 => a.wrapping_shl(b as u32 & 0x1f),
                        2 => (a < b) as i32,
                        3 => ((a as u32) < b as u32) as i32,
                        4 => a ^ b,
                        5 if funct7 == 0x20 => a.wrapping_shr(b as u32 & 0x1f),
                        5 => ((a as u32).wrapping_shr(b as u32 & 0x1f)) as i32,
                        6 => a | b,
                        7 => a & b,
                        _ => panic!("rtype funct3 {funct3}"),
                    }
                };
                self.set(rd, value);
            }
            0x37 => self.set(rd, (word & 0xffff_f000) as i32),
            0x17 => self.set(rd, (self.pc as i32).wrapping_add((word & 0xffff_f000) as i32)),
            0x03 => {
                let addr = a.wrapping_add(Self::i_imm(word)) as u32;
                let value = match funct3 {
                    0 => self.read8(addr) as i8 as i32,
                    2 => self.read32(addr) as i32,
                    4 => self.read8(addr) as i32,
                    _ => panic!("load funct3 {funct3}"),
                };
                self.set(rd, value);
            }
            0x23 => {
                let addr = a.wrapping_add(Self::s_imm(word)) as u32;
                match funct3 {
                    0 => self.write8(addr, b as u8),
                    2 => self.write32(addr, b as u32),
                    _ => panic!("store funct3 {funct3}"),
                }
            }
            0x63 => {
                let taken = match funct3 {
                    0 => a == b,
                    1 => a != b,
                    4 => a < b,
                    5 => a >= b,
                    6 => (a as u32) < b as u32,
                    7 => (a as u32) >= b as u32,
                    _ => panic!("branch funct3 {funct3}"),
                };
                if taken {
                    next = self.pc.wrapping_add(Self::branch_imm(word) as u32);
                }
            }
            0x6f => {
                self.set(rd, next as i32);
                next = self.pc.wrapping_add(Self::jal_imm(word) as u32);
            }
            0x67 => {
                let target = (a.wrapping_add(Self::i_imm(word)) as u32) & !1;
                self.set(rd, next as i32);
                next = target;
            }
            0x73 => match self.regs[17] {
                93 => {
                    self.exit_code = Some(self.regs[10]);
                    return;
                }
                222 => self.regs[10] = HEAP_BASE as i32,
                nr => panic!("unexpected syscall {nr}"),
            },
            _ => panic!("opcode {opcode:#x} at pc {pc:#x}"),
        }

        self.pc = next;
    }

    /// Runs `code` from offset 0 until the program exits.  The code is
    /// also mapped at address 0 so PC-relative constant loads resolve.
    pub fn run(code: &[u8]) -> Machine {
        let mut m = Machine::new();
        for (i, b) in code.iter().enumerate() {
            m.mem.insert(i as u32, *b);
        }
        while m.exit_code.is_none() {
            m.step(code);
            m.steps += 1;
            assert!(m.steps < 1_000_000, "runaway program");
        }
        m
    }
}
