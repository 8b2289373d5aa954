//! A byte-addressed register file that executes the moves and swaps the
//! copy resolver emits, for one lane.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};

use simtc::ir::{InstrData, Instruction, Opcode, Operand, PhysReg, SdwaSel};

#[derive(Debug, Default)]
pub struct RegFile {
    bytes: BTreeMap<u16, u8>,
    /// Every byte address written so far.
    pub written: BTreeSet<u16>,
}

impl RegFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value a byte holds before anything is written: distinct for every
    /// byte of the first 256 registers of each bank.
    pub fn initial(reg_b: u16) -> u8 {
        (reg_b % 256) as u8 ^ ((reg_b / 256) as u8).wrapping_mul(0x55)
    }

    pub fn byte(&self, reg_b: u16) -> u8 {
        self.bytes
            .get(&reg_b)
            .copied()
            .unwrap_or_else(|| Self::initial(reg_b))
    }

    pub fn read(&self, reg_b: u16, bytes: u32) -> u64 {
        (0..bytes).fold(0u64, |acc, i| {
            acc | (self.byte(reg_b + i as u16) as u64) << (8 * i)
        })
    }

    pub fn write(&mut self, reg_b: u16, bytes: u32, value: u64) {
        for i in 0..bytes {
            let at = reg_b + i as u16;
            self.bytes.insert(at, (value >> (8 * i)) as u8);
            self.written.insert(at);
        }
    }

    pub fn set_scc(&mut self, value: bool) {
        self.write(PhysReg::SCC.reg_b(), 4, value as u64);
    }

    pub fn scc(&self) -> bool {
        self.read(PhysReg::SCC.reg_b(), 4) != 0
    }

    fn src(&self, op: &Operand, bytes: u32) -> u64 {
        match op.constant_value() {
            Some(value) => value,
            None => {
                let reg = op.reg.expect("operand without a register");
                self.read(reg.reg_b(), bytes)
            }
        }
    }

    /// The whole dword holding a register operand.
    fn dword(&self, op: &Operand) -> u64 {
        match op.constant_value() {
            Some(value) => value & 0xffff_ffff,
            None => {
                let reg = op.reg.expect("operand without a register");
                self.read(PhysReg::new(reg.reg()).reg_b(), 4)
            }
        }
    }

    fn sel(&self, op: &Operand, sel: SdwaSel) -> u64 {
        match op.constant_value() {
            Some(value) => value,
            None => {
                let reg = op.reg.expect("operand without a register");
                let base = PhysReg::new(reg.reg()).reg_b();
                self.read(base + sel.offset as u16, sel.size as u32)
            }
        }
    }

    fn def_reg(instr: &Instruction, idx: usize) -> PhysReg {
        instr.definitions[idx]
            .reg
            .unwrap_or_else(|| panic!("{instr}: definition without a register"))
    }

    fn write_dword(&mut self, reg: PhysReg, value: u64) {
        self.write(PhysReg::new(reg.reg()).reg_b(), 4, value);
    }

    pub fn run(&mut self, instrs: &[Instruction]) {
        for instr in instrs {
            self.exec(instr);
        }
    }

    pub fn exec(&mut self, instr: &Instruction) {
        let ops = &instr.operands;

        if let InstrData::Sdwa { dst_sel, src_sel } = instr.data {
            let a = self.sel(&ops[0], src_sel[0]);
            let value = match instr.opcode {
                Opcode::VMovB32 => a,
                Opcode::VXorB32 => a ^ self.sel(&ops[1], src_sel[1]),
                Opcode::VAndB32 => a & self.sel(&ops[1], src_sel[1]),
                Opcode::VOrB32 => a | self.sel(&ops[1], src_sel[1]),
                Opcode::VAddF16 => {
                    // only ever adds zero to an inline f16 constant
                    assert_eq!(self.sel(&ops[1], src_sel[1]) & 0xffff, 0, "{instr}");
                    a & 0xffff
                }
                other => panic!("no sdwa semantics for {other}"),
            };
            let base = PhysReg::new(Self::def_reg(instr, 0).reg()).reg_b();
            self.write(base + dst_sel.offset as u16, dst_sel.size as u32, value);
            return;
        }

        match instr.opcode {
            Opcode::SMovB32 | Opcode::SMovB64 => {
                let bytes = instr.definitions[0].bytes();
                let value = self.src(&ops[0], bytes);
                self.write(Self::def_reg(instr, 0).reg_b(), bytes, value);
            }
            Opcode::SMovkI32 => {
                let value = ops[0].constant_value().expect("s_movk without a constant");
                let value = value as u16 as i16 as i32 as u32 as u64;
                self.write(Self::def_reg(instr, 0).reg_b(), 4, value);
            }
            Opcode::SBrevB32 | Opcode::VBfrevB32 => {
                let value = (self.src(&ops[0], 4) as u32).reverse_bits() as u64;
                self.write(Self::def_reg(instr, 0).reg_b(), 4, value);
            }
            Opcode::SBfmB32 | Opcode::SBfmB64 => {
                let bytes = instr.definitions[0].bytes();
                let size = self.src(&ops[0], 4) as u32;
                let start = self.src(&ops[1], 4) as u32;
                let value = (((1u128 << size) - 1) << start) as u64;
                self.write(Self::def_reg(instr, 0).reg_b(), bytes, value);
            }
            Opcode::SPackLlB32B16 => {
                let value = (self.src(&ops[0], 4) & 0xffff) | (self.src(&ops[1], 4) & 0xffff) << 16;
                self.write(Self::def_reg(instr, 0).reg_b(), 4, value);
            }
            Opcode::SXorB32 | Opcode::SXorB64 => {
                let bytes = instr.definitions[0].bytes();
                let value = self.src(&ops[0], bytes) ^ self.src(&ops[1], bytes);
                self.write(Self::def_reg(instr, 0).reg_b(), bytes, value);
                self.set_scc(value != 0);
            }
            Opcode::SCmpLgU32 => {
                let value = self.src(&ops[0], 4) != self.src(&ops[1], 4);
                self.set_scc(value);
            }
            Opcode::VMovB32 => {
                let value = self.dword(&ops[0]);
                self.write_dword(Self::def_reg(instr, 0), value);
            }
            Opcode::VXorB32 | Opcode::VAndB32 | Opcode::VOrB32 => {
                let (a, b) = (self.dword(&ops[0]), self.dword(&ops[1]));
                let value = match instr.opcode {
                    Opcode::VXorB32 => a ^ b,
                    Opcode::VAndB32 => a & b,
                    _ => a | b,
                };
                self.write_dword(Self::def_reg(instr, 0), value);
            }
            Opcode::VLshlrevB32 => {
                let value = (self.dword(&ops[1]) << self.dword(&ops[0])) & 0xffff_ffff;
                self.write_dword(Self::def_reg(instr, 0), value);
            }
            Opcode::VLshrrevB32 => {
                let value = self.dword(&ops[1]) >> self.dword(&ops[0]);
                self.write_dword(Self::def_reg(instr, 0), value);
            }
            Opcode::VLshrrevB64 => {
                let value = self.src(&ops[1], 8) >> self.src(&ops[0], 4);
                self.write(Self::def_reg(instr, 0).reg_b(), 8, value);
            }
            Opcode::VSwapB32 => {
                let (a, b) = (self.dword(&ops[0]), self.dword(&ops[1]));
                self.write_dword(Self::def_reg(instr, 0), a);
                self.write_dword(Self::def_reg(instr, 1), b);
            }
            Opcode::VAlignbyteB32 => {
                let wide = self.dword(&ops[0]) << 32 | self.dword(&ops[1]);
                let value = (wide >> (8 * (self.dword(&ops[2]) & 3))) & 0xffff_ffff;
                self.write_dword(Self::def_reg(instr, 0), value);
            }
            Opcode::VPackB32F16 => {
                let opsel = match instr.data {
                    InstrData::Vop3 { opsel } => opsel,
                    _ => 0,
                };
                let half = |op: &Operand, high: bool| match op.constant_value() {
                    Some(value) => value & 0xffff,
                    None => (self.dword(op) >> if high { 16 } else { 0 }) & 0xffff,
                };
                let lo = half(&ops[0], opsel & 1 != 0);
                let hi = half(&ops[1], opsel & 2 != 0);
                self.write_dword(Self::def_reg(instr, 0), lo | hi << 16);
            }
            other => panic!("no simulator semantics for {other}"),
        }
    }
}
