//! Final lowering of the pseudo-operations that survive register allocation.
//!
//! Copy-like pseudo-ops go through the parallel-copy resolver, pseudo
//! branches become SOPP branches (or disappear when jumping is slower than
//! running an empty block), and early exits share one exit block appended
//! to the program.

use log::{debug, trace};

use crate::config::GfxLevel;
use crate::copy_resolver::{CopyMap, CopyOperation, CopySite, handle_operands};
use crate::error::CompileError;
use crate::ir::{
    BlockId, BlockKind, Definition, Format, InstrData, Instruction, Opcode, Operand, PhysReg,
    Program, RegClass, RegType, Stage,
};

/// Export target that writes nothing.
const EXP_NULL: u8 = 9;

/// A removed divergent branch may skip at most this many estimated cycles.
const MAX_SKIPPED_CYCLES: u32 = 16;

fn reg_of(block: BlockId, instr: usize, reg: Option<PhysReg>) -> Result<PhysReg, CompileError> {
    reg.ok_or(CompileError::MissingPhysReg { block, instr })
}

fn push_copy(
    entries: &mut Vec<CopyOperation>,
    def: &Definition,
    op: &Operand,
    block: BlockId,
    instr: usize,
) -> Result<(), CompileError> {
    if let Some(copy) = CopyOperation::from_pair(def, op, block, instr)? {
        entries.push(copy);
    }
    Ok(())
}

/// Parallel-copy entries of a copy-like pseudo-op, or `None` for other instructions.
fn copy_entries(
    block: BlockId,
    idx: usize,
    instr: &Instruction,
) -> Result<Option<Vec<CopyOperation>>, CompileError> {
    let mut entries = Vec::new();
    match instr.opcode {
        Opcode::PParallelcopy => {
            for (def, op) in instr.definitions.iter().zip(&instr.operands) {
                assert_eq!(def.bytes(), op.bytes(), "{block}[{idx}]: copy size mismatch");
                push_copy(&mut entries, def, op, block, idx)?;
            }
        }
        Opcode::PCreateVector => {
            let dst = instr.definitions[0];
            let mut reg = reg_of(block, idx, dst.reg)?;
            for op in &instr.operands {
                if !op.is_undef() {
                    let rc = if op.rc.is_subdword() {
                        op.rc
                    } else {
                        dst.rc.resize(op.bytes())
                    };
                    push_copy(&mut entries, &Definition::fixed(reg, rc), op, block, idx)?;
                }
                reg = reg.advance(op.bytes() as i32);
            }
        }
        Opcode::PSplitVector => {
            let src = instr.operands[0];
            let mut reg = reg_of(block, idx, src.reg)?;
            for def in &instr.definitions {
                let rc = if def.rc.is_subdword() {
                    def.rc
                } else {
                    src.rc.resize(def.bytes())
                };
                push_copy(&mut entries, def, &Operand::fixed(reg, rc), block, idx)?;
                reg = reg.advance(def.bytes() as i32);
            }
        }
        Opcode::PExtractVector => {
            let def = instr.definitions[0];
            let index = instr.operands[1].constant_value().ok_or_else(|| {
                CompileError::NotImplemented {
                    block,
                    what: "p_extract_vector with a variable index".to_string(),
                }
            })?;
            let reg = reg_of(block, idx, instr.operands[0].reg)?
                .advance((index as u32 * def.bytes()) as i32);
            if def.reg != Some(reg) {
                let rc = if def.rc.is_subdword() {
                    def.rc
                } else {
                    instr.operands[0].rc.resize(def.bytes())
                };
                push_copy(&mut entries, &def, &Operand::fixed(reg, rc), block, idx)?;
            }
        }
        Opcode::PStartLinearVgpr => {
            if let Some(op) = instr.operands.first() {
                // only the active lanes are initialized
                let dst = reg_of(block, idx, instr.definitions[0].reg)?;
                let def = Definition::fixed(dst, RegClass::new(RegType::Vgpr, op.bytes() as u8));
                push_copy(&mut entries, &def, op, block, idx)?;
            }
        }
        Opcode::PAsUniform if instr.operands[0].rc.ty() != RegType::Vgpr => {
            push_copy(&mut entries, &instr.definitions[0], &instr.operands[0], block, idx)?;
        }
        Opcode::PCall => {
            let InstrData::Call { arg_regs } = &instr.data else {
                return Err(CompileError::NotImplemented {
                    block,
                    what: "p_call without argument registers".to_string(),
                });
            };
            for (op, &reg) in instr.operands[1..].iter().zip(arg_regs) {
                push_copy(&mut entries, &Definition::fixed(reg, op.rc), op, block, idx)?;
            }
        }
        _ => return Ok(None),
    }
    Ok(Some(entries))
}

/// Whether the early exit at `idx` sits right before the end of the program anyway.
fn early_exit_is_pointless(instrs: &[Instruction], idx: usize) -> bool {
    if instrs.len() - 1 - idx > 4 || instrs.last().map(|i| i.opcode) != Some(Opcode::SEndpgm) {
        return false;
    }
    instrs[idx + 1..].iter().all(|instr| match instr.opcode {
        Opcode::SEndpgm | Opcode::PLogicalEnd => true,
        Opcode::Exp => matches!(
            instr.data,
            InstrData::Export {
                target: EXP_NULL,
                enabled_mask: 0,
                ..
            }
        ),
        Opcode::PParallelcopy => instr
            .definitions
            .first()
            .is_some_and(|def| def.is_fixed_to(PhysReg::EXEC)),
        _ => false,
    })
}

/// Whether running the blocks a branch jumps over is cheaper than the branch.
fn can_remove_branch(program: &Program, block: BlockId, branch: &Instruction) -> bool {
    let Some([target, _]) = branch.targets() else {
        return false;
    };
    let divergent = branch.opcode != Opcode::PBranch
        && branch.operands.first().is_some_and(|op| op.is_fixed_to(PhysReg::EXEC));
    let prefer_remove = matches!(
        branch.data,
        InstrData::Branch {
            selection_remove: true,
            ..
        }
    ) && program.config.gfx_level >= GfxLevel::Gfx10;
    let gfx10 = program.config.gfx_level >= GfxLevel::Gfx10;

    if block >= target {
        return false;
    }
    let mut num_scalar = 0u32;
    let mut num_vector = 0u32;
    for skipped in &program.blocks[block.index() + 1..target.index()] {
        // uniform conditions never skip real work
        if !divergent && !skipped.instructions.is_empty() {
            return false;
        }
        for instr in &skipped.instructions {
            let format = instr.format();
            if format == Format::Sopp {
                let breaks = skipped
                    .kind
                    .contains(BlockKind::BREAK | BlockKind::CONTINUE);
                let early_exit = instr.sopp_block().is_some_and(|b| {
                    program.block(b).kind.contains(BlockKind::DISCARD_EARLY_EXIT)
                });
                if !matches!(instr.opcode, Opcode::SCbranchScc0 | Opcode::SCbranchScc1)
                    || (!early_exit && !breaks)
                {
                    return false;
                }
            } else if format.is_salu() {
                num_scalar += 1;
            } else if format.is_valu() {
                num_vector += 1;
                // VALU writing SGPRs always runs on gfx10
                if gfx10 {
                    num_scalar += instr
                        .definitions
                        .iter()
                        .filter(|d| d.rc.ty() == RegType::Sgpr)
                        .count() as u32;
                }
            } else if format.is_vmem() {
                if !prefer_remove {
                    return false;
                }
            } else {
                // exports with an empty mask can hang, pseudo-ops are gone by now
                return false;
            }

            if !prefer_remove {
                let cycles = if gfx10 {
                    num_scalar * 2 + num_vector
                } else {
                    num_scalar * 4 + num_vector * 4
                };
                if cycles > MAX_SKIPPED_CYCLES {
                    return false;
                }
            }
        }
    }
    true
}

fn lower_branch(block: BlockId, idx: usize, branch: &Instruction) -> Result<Instruction, CompileError> {
    let Some([target, _]) = branch.targets() else {
        return Err(CompileError::InvalidCfg {
            block,
            reason: format!("{} at {idx} has no branch targets", branch.opcode),
        });
    };
    let opcode = if branch.opcode == Opcode::PBranch {
        Opcode::SBranch
    } else {
        let cond = reg_of(block, idx, branch.operands.first().and_then(|op| op.reg))?;
        let nonzero = branch.opcode == Opcode::PCbranchNz;
        match cond {
            PhysReg::EXEC if nonzero => Opcode::SCbranchExecnz,
            PhysReg::EXEC => Opcode::SCbranchExecz,
            PhysReg::VCC if nonzero => Opcode::SCbranchVccnz,
            PhysReg::VCC => Opcode::SCbranchVccz,
            PhysReg::SCC if nonzero => Opcode::SCbranchScc1,
            PhysReg::SCC => Opcode::SCbranchScc0,
            other => {
                return Err(CompileError::NotImplemented {
                    block,
                    what: format!("branch on {other}"),
                });
            }
        }
    };
    Ok(Instruction::new(opcode, [], []).with_data(InstrData::Sopp {
        block: Some(target),
        imm: 0,
    }))
}

fn create_discard_exit_block(program: &mut Program) -> BlockId {
    let exit = program.create_and_insert_block();
    let fragment = program.stage == Stage::Fragment;
    let block = program.block_mut(exit);
    block.kind = BlockKind::DISCARD_EARLY_EXIT;
    if fragment {
        let null_export = Instruction::new(Opcode::Exp, [], [Operand::undef(RegClass::V1); 4])
            .with_data(InstrData::Export {
                target: EXP_NULL,
                enabled_mask: 0,
                done: true,
                valid_mask: true,
            });
        block.instructions.push(null_export);
    }
    block.instructions.push(
        Instruction::new(Opcode::SEndpgm, [], []).with_data(InstrData::Sopp { block: None, imm: 0 }),
    );
    exit
}

/// Lower every remaining pseudo-op to hardware instructions.
///
/// Expects physical registers on all operands and definitions, and no phis.
pub fn lower_to_hw_instr(program: &mut Program) -> Result<(), CompileError> {
    let config = program.config;
    let mut discard_exit: Option<BlockId> = None;
    let mut copies = 0usize;

    for block_idx in (0..program.blocks.len()).rev() {
        let block_id = BlockId(block_idx as u32);
        let old = std::mem::take(&mut program.blocks[block_idx].instructions);
        let mut out = Vec::with_capacity(old.len());

        for (idx, instr) in old.iter().enumerate() {
            if let Some(entries) = copy_entries(block_id, idx, instr)? {
                let map: CopyMap = entries.into_iter().map(|c| (c.def, c)).collect();
                let site = CopySite::for_instruction(block_id, instr);
                copies += handle_operands(map, config, site, &mut out)?;
                if instr.opcode == Opcode::PCall {
                    let callee = instr.operands[0];
                    reg_of(block_id, idx, callee.reg)?;
                    out.push(Instruction::new(
                        Opcode::SSwappcB64,
                        instr.definitions.iter().copied(),
                        [callee],
                    ));
                }
                continue;
            }

            match instr.opcode {
                Opcode::PLogicalStart
                | Opcode::PLogicalEnd
                | Opcode::PStartpgm
                | Opcode::PEndLinearVgpr => {}
                Opcode::PAsUniform => {
                    let dst = reg_of(block_id, idx, instr.definitions[0].reg)?;
                    let src = reg_of(block_id, idx, instr.operands[0].reg)?;
                    for i in 0..instr.definitions[0].size() as u16 {
                        out.push(Instruction::new(
                            Opcode::VReadfirstlaneB32,
                            [Definition::fixed(dst.offset(i), RegClass::S1)],
                            [Operand::fixed(src.offset(i), RegClass::V1)],
                        ));
                    }
                }
                Opcode::PExitEarlyIf => {
                    if early_exit_is_pointless(&old, idx) {
                        trace!("lower_to_hw: {block_id}[{idx}]: early exit right before the end");
                        continue;
                    }
                    let cond = instr.operands[0];
                    if !cond.is_fixed_to(PhysReg::SCC) {
                        return Err(CompileError::NotImplemented {
                            block: block_id,
                            what: format!("early exit on {cond}"),
                        });
                    }
                    let exit = *discard_exit.get_or_insert_with(|| create_discard_exit_block(program));
                    out.push(
                        Instruction::new(Opcode::SCbranchScc0, [], [cond]).with_data(InstrData::Sopp {
                            block: Some(exit),
                            imm: 0,
                        }),
                    );
                    program.add_linear_edge(block_id, exit);
                }
                op if op.is_branch() => {
                    if can_remove_branch(program, block_id, instr) {
                        trace!("lower_to_hw: {block_id}: removed {instr}");
                        continue;
                    }
                    out.push(lower_branch(block_id, idx, instr)?);
                }
                _ => out.push(instr.clone()),
            }
        }
        program.blocks[block_idx].instructions = out;
    }

    program.statistics.copies += copies as u32;
    debug!(
        "lower_to_hw: {} instructions, {copies} from copies",
        program.num_instructions()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir_parse::parse_program;

    fn opcodes(program: &Program, block: usize) -> Vec<Opcode> {
        program.blocks[block]
            .instructions
            .iter()
            .map(|i| i.opcode)
            .collect()
    }

    fn single_block(gfx: &str, stage: &str, body: &str) -> Program {
        let text = format!(
            "program wave64 {gfx} {stage} {{\n  block b0 [top-level] depth 0:\n    preds: logical [] linear []\n{body}    succs: logical [] linear []\n}}\n"
        );
        parse_program(&text).unwrap()
    }

    #[test]
    fn parallel_copy_swap_counts_statistics() {
        let mut program = single_block(
            "gfx10",
            "compute",
            "    v1@v0, v1@v1 = p_parallelcopy v1@v1, v1@v0\n    s_endpgm\n",
        );
        lower_to_hw_instr(&mut program).unwrap();
        assert_eq!(opcodes(&program, 0), vec![Opcode::VSwapB32, Opcode::SEndpgm]);
        assert_eq!(program.statistics.copies, 1);
    }

    #[test]
    fn vector_pseudo_ops_become_moves() {
        let mut program = single_block(
            "gfx9",
            "compute",
            concat!(
                "    v2@v4 = p_create_vector v1@v0, #0x7:s1\n",
                "    v1@v8, v1@v9 = p_split_vector v2@v2\n",
                "    v1@v10 = p_extract_vector v2@v6, #0x1:s1\n",
                "    v1@v7 = p_extract_vector v2@v6, #0x1:s1\n",
                "    s_endpgm\n",
            ),
        );
        lower_to_hw_instr(&mut program).unwrap();
        let instrs = &program.blocks[0].instructions;
        assert_eq!(instrs.len(), 6);
        assert!(instrs[..5].iter().all(|i| i.opcode == Opcode::VMovB32));
        assert!(instrs[1].operands[0].constant_equals(7));
        assert_eq!(instrs[4].operands[0].reg, Some(PhysReg::vgpr(7)));
    }

    #[test]
    fn as_uniform_from_vgpr_reads_the_first_lane() {
        let mut program = single_block(
            "gfx10",
            "compute",
            "    s2@s4 = p_as_uniform v2@v2\n    s1@s6 = p_as_uniform s1@s0\n    s_endpgm\n",
        );
        lower_to_hw_instr(&mut program).unwrap();
        assert_eq!(
            opcodes(&program, 0),
            vec![
                Opcode::VReadfirstlaneB32,
                Opcode::VReadfirstlaneB32,
                Opcode::SMovB32,
                Opcode::SEndpgm
            ]
        );
        let second = &program.blocks[0].instructions[1];
        assert_eq!(second.definitions[0].reg, Some(PhysReg::sgpr(5)));
        assert_eq!(second.operands[0].reg, Some(PhysReg::vgpr(3)));
    }

    #[test]
    fn call_moves_arguments_first() {
        let mut program = single_block(
            "gfx10",
            "compute",
            "    s2@s0 = p_call s2@s4, v1@v9, s1@s8 args(v0, s2)\n    s_endpgm\n",
        );
        lower_to_hw_instr(&mut program).unwrap();
        let instrs = &program.blocks[0].instructions;
        assert_eq!(instrs.len(), 4);
        assert_eq!(instrs[2].opcode, Opcode::SSwappcB64);
        assert_eq!(instrs[2].operands[0].reg, Some(PhysReg::sgpr(4)));
        assert_eq!(instrs[2].definitions[0].reg, Some(PhysReg::sgpr(0)));
    }

    #[test]
    fn early_exit_branches_to_a_shared_exit_block() {
        let body = concat!(
            "    p_exit_early_if s1@scc\n",
            "    v1@v0 = v_mov_b32 #0x1:s1\n",
            "    v1@v1 = v_mov_b32 #0x2:s1\n",
            "    v1@v2 = v_mov_b32 #0x3:s1\n",
            "    p_exit_early_if s1@scc\n",
            "    v1@v3 = v_mov_b32 #0x4:s1\n",
            "    exp v1@v0, v1@v1, v1@v2, v1@v3 target:0 en:15 done vm\n",
            "    s_endpgm\n",
        );
        let mut program = single_block("gfx10", "fragment", body);
        lower_to_hw_instr(&mut program).unwrap();

        assert_eq!(program.blocks.len(), 2);
        let exit = &program.blocks[1];
        assert!(exit.kind.contains(BlockKind::DISCARD_EARLY_EXIT));
        assert_eq!(
            exit.instructions.iter().map(|i| i.opcode).collect::<Vec<_>>(),
            vec![Opcode::Exp, Opcode::SEndpgm]
        );
        assert_eq!(exit.linear_preds, vec![BlockId(0), BlockId(0)]);

        let branches: Vec<_> = program.blocks[0]
            .instructions
            .iter()
            .filter(|i| i.opcode == Opcode::SCbranchScc0)
            .collect();
        assert_eq!(branches.len(), 2);
        assert!(branches.iter().all(|b| b.sopp_block() == Some(BlockId(1))));
    }

    #[test]
    fn early_exit_before_the_end_is_dropped() {
        let body = concat!(
            "    p_exit_early_if s1@scc\n",
            "    exp undef:v1, undef:v1, undef:v1, undef:v1 target:9 en:0 done vm\n",
            "    s_endpgm\n",
        );
        let mut program = single_block("gfx10", "fragment", body);
        lower_to_hw_instr(&mut program).unwrap();
        assert_eq!(program.blocks.len(), 1);
        assert_eq!(opcodes(&program, 0), vec![Opcode::Exp, Opcode::SEndpgm]);
    }

    const SKIP: &str = r#"
program wave64 gfx10 compute {
  block b0 [top-level, branch] depth 0:
    preds: logical [] linear []
    p_cbranch_z s2@exec -> b2, b1
    succs: logical [b1, b2] linear [b1, b2]
  block b1 [] depth 0:
    preds: logical [b0] linear [b0]
    v1@v0 = v_mov_b32 #0x1:s1
    p_branch -> b2
    succs: logical [b2] linear [b2]
  block b2 [top-level, merge] depth 0:
    preds: logical [b0, b1] linear [b0, b1]
    s_endpgm
    succs: logical [] linear []
}
"#;

    #[test]
    fn cheap_divergent_branches_are_removed() {
        let mut program = parse_program(SKIP).unwrap();
        lower_to_hw_instr(&mut program).unwrap();
        assert!(opcodes(&program, 0).is_empty());
        assert_eq!(opcodes(&program, 1), vec![Opcode::VMovB32]);
    }

    #[test]
    fn uniform_branches_over_code_are_kept() {
        let mut program = parse_program(&SKIP.replace("s2@exec", "s2@vcc")).unwrap();
        lower_to_hw_instr(&mut program).unwrap();
        let branch = &program.blocks[0].instructions[0];
        assert_eq!(branch.opcode, Opcode::SCbranchVccz);
        assert_eq!(branch.sopp_block(), Some(BlockId(2)));
    }

    #[test]
    fn expensive_divergent_branches_are_kept() {
        let movs = "    v1@v0 = v_mov_b32 #0x1:s1\n".repeat(17);
        let input = SKIP.replace("    v1@v0 = v_mov_b32 #0x1:s1\n", &movs);
        let mut program = parse_program(&input).unwrap();
        lower_to_hw_instr(&mut program).unwrap();
        assert_eq!(opcodes(&program, 0), vec![Opcode::SCbranchExecz]);
    }
}
