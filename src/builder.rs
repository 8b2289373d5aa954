//! Instruction builder shared by the passes.
//!
//! A builder appends to (or inserts into) one instruction list and allocates
//! temps from the program's temp table. Lane-mask arithmetic goes through
//! [`WaveOp`], which picks the 32- or 64-bit scalar opcode for the wave size.

use crate::config::TargetConfig;
use crate::ir::{
    BlockId, Definition, InstrData, Instruction, Opcode, Operand, PhysReg, RegClass, Temp, Temps,
};

/// Scalar operations that exist in a 32-bit and a 64-bit flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveOp {
    Mov,
    Not,
    Wqm,
    And,
    Andn2,
    Or,
    Orn2,
    Xor,
    AndSaveexec,
    Ff1,
    Lshl,
    Cselect,
}

impl WaveOp {
    pub fn opcode(self, wave64: bool) -> Opcode {
        use Opcode::*;
        let (op32, op64) = match self {
            WaveOp::Mov => (SMovB32, SMovB64),
            WaveOp::Not => (SNotB32, SNotB64),
            WaveOp::Wqm => (SWqmB32, SWqmB64),
            WaveOp::And => (SAndB32, SAndB64),
            WaveOp::Andn2 => (SAndn2B32, SAndn2B64),
            WaveOp::Or => (SOrB32, SOrB64),
            WaveOp::Orn2 => (SOrn2B32, SOrn2B64),
            WaveOp::Xor => (SXorB32, SXorB64),
            WaveOp::AndSaveexec => (SAndSaveexecB32, SAndSaveexecB64),
            WaveOp::Ff1 => (SFf1I32B32, SFf1I32B64),
            WaveOp::Lshl => (SLshlB32, SLshlB64),
            WaveOp::Cselect => (SCselectB32, SCselectB64),
        };
        if wave64 { op64 } else { op32 }
    }

    /// Whether the scalar ALU writes SCC for this operation.
    pub fn writes_scc(self) -> bool {
        !matches!(self, WaveOp::Mov | WaveOp::Cselect)
    }
}

pub struct Builder<'a> {
    temps: &'a mut Temps,
    instrs: &'a mut Vec<Instruction>,
    /// Insertion index; `None` appends.
    cursor: Option<usize>,
    config: TargetConfig,
}

impl<'a> Builder<'a> {
    pub fn new(temps: &'a mut Temps, instrs: &'a mut Vec<Instruction>, config: TargetConfig) -> Self {
        Self {
            temps,
            instrs,
            cursor: None,
            config,
        }
    }

    /// A builder that inserts before `index` and keeps advancing past what it inserts.
    pub fn at(
        temps: &'a mut Temps,
        instrs: &'a mut Vec<Instruction>,
        config: TargetConfig,
        index: usize,
    ) -> Self {
        Self {
            temps,
            instrs,
            cursor: Some(index),
            config,
        }
    }

    pub fn set_cursor(&mut self, index: Option<usize>) {
        self.cursor = index;
    }

    /// Where the next instruction lands.
    pub fn position(&self) -> usize {
        self.cursor.unwrap_or(self.instrs.len())
    }

    pub fn config(&self) -> TargetConfig {
        self.config
    }

    pub fn lm(&self) -> RegClass {
        self.config.lane_mask()
    }

    pub fn wave64(&self) -> bool {
        self.config.wave64()
    }

    pub fn tmp(&mut self, rc: RegClass) -> Temp {
        self.temps.alloc(rc)
    }

    pub fn def(&mut self, rc: RegClass) -> Definition {
        Definition::temp(self.tmp(rc))
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instrs[..]
    }

    pub fn insert(&mut self, instr: Instruction) -> &mut Instruction {
        let index = match &mut self.cursor {
            Some(cursor) => {
                let index = *cursor;
                self.instrs.insert(index, instr);
                *cursor += 1;
                index
            }
            None => {
                self.instrs.push(instr);
                self.instrs.len() - 1
            }
        };
        &mut self.instrs[index]
    }

    pub fn emit(
        &mut self,
        opcode: Opcode,
        definitions: impl IntoIterator<Item = Definition>,
        operands: impl IntoIterator<Item = Operand>,
    ) -> &mut Instruction {
        self.insert(Instruction::new(opcode, definitions, operands))
    }

    /// A wave-size dependent scalar instruction.
    pub fn wave(
        &mut self,
        op: WaveOp,
        definitions: impl IntoIterator<Item = Definition>,
        operands: impl IntoIterator<Item = Operand>,
    ) -> &mut Instruction {
        let opcode = op.opcode(self.wave64());
        self.emit(opcode, definitions, operands)
    }

    /// `dst = op(operands)` on lane masks into a fresh temp; SCC is written and
    /// dropped where the ALU sets it.
    pub fn lane_op(&mut self, op: WaveOp, operands: impl IntoIterator<Item = Operand>) -> Temp {
        let dst = self.tmp(self.lm());
        if op.writes_scc() {
            self.wave(op, [Definition::temp(dst), Definition::scc()], operands);
        } else {
            self.wave(op, [Definition::temp(dst)], operands);
        }
        dst
    }

    /// `dst = op(operands)` into a fixed lane-mask destination such as `exec`,
    /// returning the SCC temp.
    pub fn lane_op_scc(
        &mut self,
        op: WaveOp,
        dst: Definition,
        operands: impl IntoIterator<Item = Operand>,
    ) -> Temp {
        let scc = self.tmp(RegClass::S1);
        self.wave(op, [dst, Definition::temp_fixed(scc, PhysReg::SCC)], operands);
        scc
    }

    pub fn copy(&mut self, def: Definition, op: Operand) -> &mut Instruction {
        self.emit(Opcode::PParallelcopy, [def], [op])
    }

    pub fn branch(
        &mut self,
        opcode: Opcode,
        operands: impl IntoIterator<Item = Operand>,
        targets: [BlockId; 2],
    ) -> &mut Instruction {
        let instr = self.emit(opcode, [], operands);
        instr.set_targets(targets);
        instr
    }

    pub fn sopp(&mut self, opcode: Opcode, block: Option<BlockId>, imm: u16) -> &mut Instruction {
        let instr = self.emit(opcode, [], []);
        instr.data = InstrData::Sopp { block, imm };
        instr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GfxLevel;

    #[test]
    fn wave_ops_follow_wave_size() {
        assert_eq!(WaveOp::And.opcode(true), Opcode::SAndB64);
        assert_eq!(WaveOp::And.opcode(false), Opcode::SAndB32);
        assert_eq!(WaveOp::AndSaveexec.opcode(true), Opcode::SAndSaveexecB64);
    }

    #[test]
    fn insert_mode_advances_cursor() {
        let mut temps = Temps::default();
        let mut instrs = vec![
            Instruction::new(Opcode::PLogicalStart, [], []),
            Instruction::new(Opcode::PLogicalEnd, [], []),
        ];
        let config = TargetConfig::new(GfxLevel::Gfx10, 32);
        let mut bld = Builder::at(&mut temps, &mut instrs, config, 1);
        let a = bld.lane_op(WaveOp::Mov, [Operand::exec(RegClass::S1)]);
        let b = bld.lane_op(WaveOp::Not, [Operand::temp(a)]);
        assert_eq!(bld.position(), 3);
        assert_eq!(b.rc(), RegClass::S1);

        let ops: Vec<Opcode> = instrs.iter().map(|i| i.opcode).collect();
        assert_eq!(
            ops,
            vec![
                Opcode::PLogicalStart,
                Opcode::SMovB32,
                Opcode::SNotB32,
                Opcode::PLogicalEnd
            ]
        );
        assert!(instrs[2].definitions[1].is_fixed_to(PhysReg::SCC));
        assert_eq!(temps.len(), 3);
    }
}
