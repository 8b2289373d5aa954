//! Out-of-SSA translation after register allocation.
//!
//! Every phi operand becomes an entry of a parallel copy at the end of the
//! predecessor it flows from: logical phis copy before `p_logical_end`, so
//! the copy runs with the predecessor's lanes, and linear phis copy right
//! before the branch.

use std::collections::BTreeMap;

use log::debug;

use crate::error::CompileError;
use crate::ir::{
    BlockId, Definition, InstrData, Instruction, Opcode, Operand, PhysReg, Program,
};

/// Copies collected for one predecessor end.
#[derive(Debug, Default)]
struct PhiCopies {
    definitions: Vec<Definition>,
    operands: Vec<Operand>,
    scratch_sgpr: Option<PhysReg>,
}

/// Where a copy lands in the predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Insertion {
    LogicalEnd,
    Branch,
}

fn collect_copies(
    program: &Program,
) -> Result<BTreeMap<(BlockId, Insertion), PhiCopies>, CompileError> {
    let mut copies: BTreeMap<(BlockId, Insertion), PhiCopies> = BTreeMap::new();

    for block in &program.blocks {
        for (idx, phi) in block.instructions.iter().enumerate() {
            if !phi.is_phi() {
                break;
            }
            let (preds, insertion) = match phi.opcode {
                Opcode::PPhi => (&block.logical_preds, Insertion::LogicalEnd),
                _ => (&block.linear_preds, Insertion::Branch),
            };
            if phi.operands.len() != preds.len() {
                return Err(CompileError::PhiOperandCount {
                    block: block.index,
                    instr: idx,
                    expected: preds.len(),
                    found: phi.operands.len(),
                });
            }
            let def = phi.definitions[0];
            let Some(def_reg) = def.reg else {
                return Err(CompileError::MissingPhysReg {
                    block: block.index,
                    instr: idx,
                });
            };

            for (op, &pred) in phi.operands.iter().zip(preds) {
                if op.is_undef() || op.reg == Some(def_reg) {
                    continue;
                }
                if !op.is_constant() && op.reg.is_none() {
                    return Err(CompileError::MissingPhysReg {
                        block: block.index,
                        instr: idx,
                    });
                }
                let entry = copies.entry((pred, insertion)).or_default();
                let mut op = *op;
                op.kill = false;
                op.first_kill = false;
                op.late_kill = false;
                entry.definitions.push(def);
                entry.operands.push(op);
                if entry.scratch_sgpr.is_none() {
                    entry.scratch_sgpr = phi.copy_scratch().0;
                }
            }
        }
    }
    Ok(copies)
}

/// Replace all phis with parallel copies in their predecessors.
pub fn ssa_elimination(program: &mut Program) -> Result<(), CompileError> {
    let copies = collect_copies(program)?;
    let num_copies = copies.len();

    for ((pred, insertion), phi_copies) in copies {
        let block = program.block_mut(pred);
        let (position, tmp_in_scc) = match insertion {
            Insertion::LogicalEnd => match block.logical_end() {
                Some(position) => (position, false),
                None => {
                    return Err(CompileError::InvalidCfg {
                        block: pred,
                        reason: "logical phi predecessor without p_logical_end".to_string(),
                    });
                }
            },
            Insertion::Branch => match block.instructions.last() {
                Some(branch) if branch.opcode.is_branch() => {
                    let reads_scc = branch.operands.iter().any(|op| op.is_fixed_to(PhysReg::SCC));
                    (block.instructions.len() - 1, reads_scc)
                }
                _ => (block.instructions.len(), false),
            },
        };

        let copy = Instruction::new(
            Opcode::PParallelcopy,
            phi_copies.definitions,
            phi_copies.operands,
        )
        .with_data(InstrData::Pseudo {
            scratch_sgpr: phi_copies.scratch_sgpr,
            tmp_in_scc,
        });
        block.instructions.insert(position, copy);
    }

    for block in &mut program.blocks {
        block.instructions.retain(|instr| !instr.is_phi());
    }

    debug!("ssa_elimination: {num_copies} parallel copies");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir_parse::parse_program;

    const DIAMOND: &str = r#"
program wave64 gfx10 compute {
  block b0 [top-level, branch] depth 0:
    preds: logical [] linear []
    p_logical_start
    %1:v1@v0 = v_mov_b32 #0x1:s1
    %2:s2@s4 = s_mov_b64 #0x0:s2
    p_logical_end
    p_cbranch_z %2:s2@s4 -> b2, b1
    succs: logical [b1, b2] linear [b1, b2]
  block b1 [uniform] depth 0:
    preds: logical [b0] linear [b0]
    p_logical_start
    %3:v1@v1 = v_mov_b32 #0x2:s1
    %4:s2@s6 = s_mov_b64 #0x1:s2
    p_logical_end
    p_branch -> b2
    succs: logical [b2] linear [b2]
  block b2 [top-level, merge] depth 0:
    preds: logical [b0, b1] linear [b0, b1]
    %5:v1@v0 = p_phi %1:v1@v0, %3:v1@v1(kill)
    %6:s2@s4 = p_linear_phi %2:s2@s4, %4:s2@s6 scratch:s10
    p_logical_start
    s_endpgm
    succs: logical [] linear []
}
"#;

    #[test]
    fn phis_become_predecessor_copies() {
        let mut program = parse_program(DIAMOND).unwrap();
        ssa_elimination(&mut program).unwrap();

        assert!(
            program
                .blocks
                .iter()
                .flat_map(|b| &b.instructions)
                .all(|i| !i.is_phi())
        );

        // identity copies from b0 are dropped
        assert!(
            program.blocks[0]
                .instructions
                .iter()
                .all(|i| i.opcode != Opcode::PParallelcopy)
        );

        let b1 = &program.blocks[1].instructions;
        let logical_end = program.blocks[1].logical_end().unwrap();
        let logical_copy = &b1[logical_end - 1];
        assert_eq!(logical_copy.opcode, Opcode::PParallelcopy);
        assert_eq!(logical_copy.definitions[0].reg, Some(PhysReg::vgpr(0)));
        assert_eq!(logical_copy.operands[0].reg, Some(PhysReg::vgpr(1)));
        assert!(!logical_copy.operands[0].kill);

        let linear_copy = &b1[b1.len() - 2];
        assert_eq!(linear_copy.opcode, Opcode::PParallelcopy);
        assert_eq!(linear_copy.definitions[0].reg, Some(PhysReg::sgpr(4)));
        assert_eq!(linear_copy.copy_scratch(), (Some(PhysReg::sgpr(10)), false));
        assert_eq!(b1.last().unwrap().opcode, Opcode::PBranch);
    }

    #[test]
    fn phi_without_register_is_reported() {
        let input = DIAMOND.replace("%5:v1@v0 = p_phi %1:v1@v0", "%5:v1 = p_phi %1:v1@v0");
        let mut program = parse_program(&input).unwrap();
        assert_eq!(
            ssa_elimination(&mut program),
            Err(CompileError::MissingPhysReg {
                block: BlockId(2),
                instr: 0
            })
        );
    }
}
