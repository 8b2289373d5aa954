mod common;

use simtc::cfg_builder::ShaderBuilder;
use simtc::config::{GfxLevel, TargetConfig};
use simtc::copy_resolver::{handle_operands, CopyMap, CopyOperation, CopySite, CopySource};
use simtc::ir::{
    BlockId, BlockKind, Definition, InstrData, Instruction, Opcode, Operand, PhysReg, Program,
    Stage,
};
use simtc::run_core;

use common::RegFile;

fn all_instructions(program: &Program) -> impl Iterator<Item = &Instruction> {
    program.blocks.iter().flat_map(|b| &b.instructions)
}

fn count(program: &Program, opcode: Opcode) -> usize {
    all_instructions(program)
        .filter(|i| i.opcode == opcode)
        .count()
}

fn writes_exec(instr: &Instruction) -> bool {
    instr
        .definitions
        .iter()
        .any(|def| def.is_fixed_to(PhysReg::EXEC))
}

// ─── Divergent if ───────────────────────────────────────────────────────────

#[test]
fn divergent_if_with_an_empty_side() {
    let mut sb = ShaderBuilder::new(TargetConfig::default(), Stage::Compute);
    let cond = sb.divergent_condition();
    sb.begin_divergent_if(cond);
    let v = sb.vgpr();
    sb.emit(Opcode::VMovB32, [Definition::temp(v)], [Operand::c32(7)]);
    sb.begin_else();
    sb.end_divergent_if();
    let mut program = sb.finish();

    run_core(&mut program).unwrap();

    // the AND-split and the AND-NOT that flips to the else side
    let mask_ops: Vec<&Instruction> = all_instructions(&program)
        .filter(|i| writes_exec(i))
        .filter(|i| matches!(i.opcode, Opcode::SAndSaveexecB64 | Opcode::SAndn2B64))
        .collect();
    assert_eq!(mask_ops.len(), 2);
    assert_eq!(mask_ops[0].opcode, Opcode::SAndSaveexecB64);
    assert_eq!(mask_ops[0].operands[0].temp_value(), Some(cond));
    assert_eq!(mask_ops[1].opcode, Opcode::SAndn2B64);
    let saved = mask_ops[0].definitions[0].temp;
    assert_eq!(mask_ops[1].operands[0].temp_value(), saved);

    assert_eq!(count(&program, Opcode::PPhi), 0);
    assert_eq!(count(&program, Opcode::PLinearPhi), 0);

    // the merge block puts the saved mask back
    let merge = program
        .blocks
        .iter()
        .find(|b| b.kind.contains(BlockKind::MERGE))
        .unwrap();
    let restore = merge.instructions.iter().find(|i| writes_exec(i)).unwrap();
    assert_eq!(restore.opcode, Opcode::PParallelcopy);
    assert_eq!(restore.operands[0].temp_value(), saved);
}

// ─── Loop with a discard ────────────────────────────────────────────────────

#[test]
fn loop_with_a_divergent_discard() {
    let mut sb = ShaderBuilder::new(TargetConfig::default(), Stage::Fragment);
    sb.begin_loop();
    let cond = sb.divergent_condition();
    sb.discard_if(cond);
    let scc = sb.uniform_condition();
    sb.begin_uniform_if(scc);
    sb.emit_break();
    sb.begin_uniform_else();
    sb.end_uniform_if();
    sb.end_loop();
    sb.export_null();
    let mut program = sb.finish();

    let out = run_core(&mut program).unwrap();
    let trace = &out.exec_mask.blocks;

    let preheader = 0;
    let header = 1;
    let exit = program
        .blocks
        .iter()
        .position(|b| b.kind.contains(BlockKind::LOOP_EXIT))
        .unwrap();
    assert_eq!(trace[header].loop_depth, trace[preheader].exit_depth);
    assert_eq!(trace[exit].entry_depth, trace[preheader].exit_depth);

    assert_eq!(count(&program, Opcode::PDiscardIf), 0);
    assert_eq!(count(&program, Opcode::PExitEarlyIf), 1);

    // a latch without active lanes falls through to the exit
    let latch = program
        .blocks
        .iter()
        .find(|b| b.kind.contains(BlockKind::CONTINUE_OR_BREAK))
        .unwrap();
    let branch = latch.instructions.last().unwrap();
    assert_eq!(branch.opcode, Opcode::PCbranchNz);
    assert!(branch.operands[0].is_fixed_to(PhysReg::EXEC));
    let [taken, fallthrough] = branch.targets().unwrap();
    assert_eq!(
        program.block(taken).linear_succs,
        vec![program.blocks[header].index]
    );
    assert_eq!(program.block(fallthrough).linear_succs, vec![BlockId(exit as u32)]);
}

#[test]
fn loop_with_a_divergent_break_restores_the_outer_mask() {
    let mut sb = ShaderBuilder::new(TargetConfig::default(), Stage::Compute);
    sb.begin_loop();
    let cond = sb.divergent_condition();
    sb.begin_divergent_if(cond);
    sb.emit_break();
    sb.begin_else();
    sb.end_divergent_if();
    sb.end_loop();
    let mut program = sb.finish();

    let out = run_core(&mut program).unwrap();
    let trace = &out.exec_mask.blocks;
    for (idx, block) in trace.iter().enumerate() {
        assert!(block.entry_depth >= block.loop_depth, "b{idx}: {block:?}");
    }

    // the preheader saves exec and pushes the loop-active mask
    assert_eq!(trace[0].exit_depth, trace[0].entry_depth + 1);
    let save = program.blocks[0]
        .instructions
        .iter()
        .find(|i| i.operands.first().is_some_and(|op| op.is_fixed_to(PhysReg::EXEC)))
        .unwrap();
    let saved = save.definitions[0].temp;

    let exit = program.blocks.len() - 1;
    assert!(program.blocks[exit].kind.contains(BlockKind::LOOP_EXIT));
    assert_eq!(trace[exit].entry_depth, trace[0].entry_depth);
    let restore = program.blocks[exit]
        .instructions
        .iter()
        .find(|i| writes_exec(i))
        .unwrap();
    assert_eq!(restore.operands[0].temp_value(), saved);
}

// ─── Overlapping sub-register cycle ─────────────────────────────────────────

fn resolve_and_run(level: GfxLevel, copies: &[CopyOperation]) -> (Vec<Instruction>, RegFile) {
    let map: CopyMap = copies.iter().map(|c| (c.def, *c)).collect();
    let mut instrs = Vec::new();
    handle_operands(
        map,
        TargetConfig::new(level, 64),
        CopySite::new(BlockId(0)),
        &mut instrs,
    )
    .unwrap();
    let mut file = RegFile::new();
    file.run(&instrs);
    (instrs, file)
}

fn assert_copied(file: &RegFile, copies: &[CopyOperation]) {
    for copy in copies {
        let CopySource::Reg(src) = copy.src else {
            unreachable!()
        };
        for i in 0..copy.bytes as u16 {
            assert_eq!(
                file.byte(copy.def.reg_b() + i),
                RegFile::initial(src.reg_b() + i),
                "byte {i} of {}",
                copy.def
            );
        }
    }
}

fn assert_untouched(file: &RegFile, regs: &[PhysReg]) {
    for reg in regs {
        assert!(!file.written.contains(&reg.reg_b()), "{reg} written");
    }
}

fn half(reg: u16, byte: i32) -> PhysReg {
    PhysReg::vgpr(reg).advance(byte)
}

#[test]
fn cyclic_copy_over_overlapping_halves() {
    // v0[0,2) <- v1[1,3) <- v2[0,2) <- v0[0,2)
    let copies = [
        CopyOperation::new(half(0, 0), CopySource::Reg(half(1, 1)), 2),
        CopyOperation::new(half(1, 1), CopySource::Reg(half(2, 0)), 2),
        CopyOperation::new(half(2, 0), CopySource::Reg(half(0, 0)), 2),
    ];
    let (instrs, file) = resolve_and_run(GfxLevel::Gfx10, &copies);

    // byte-wise xor swaps: no step writes a byte outside the copies
    assert!(instrs.iter().all(|i| {
        i.opcode == Opcode::VXorB32
            && matches!(i.data, InstrData::Sdwa { dst_sel, .. } if dst_sel.size == 1)
    }));
    assert_copied(&file, &copies);
    assert_untouched(
        &file,
        &[half(0, 2), half(0, 3), half(1, 0), half(1, 3), half(2, 2), half(2, 3)],
    );
}

#[test]
fn odd_half_next_to_a_packable_half() {
    // v0[0,2) <- v1[1,3) while v0[2,4) <- v2[0,2): both halves of v0 are
    // written, but the low one cannot be selected by a pack
    let copies = [
        CopyOperation::new(half(0, 0), CopySource::Reg(half(1, 1)), 2),
        CopyOperation::new(half(0, 2), CopySource::Reg(half(2, 0)), 2),
    ];
    for level in [GfxLevel::Gfx8, GfxLevel::Gfx9, GfxLevel::Gfx10] {
        let (instrs, file) = resolve_and_run(level, &copies);
        assert!(instrs.iter().all(|i| i.opcode != Opcode::VPackB32F16));
        assert_copied(&file, &copies);
        assert_untouched(&file, &[half(1, 0), half(1, 3), half(2, 2), half(2, 3)]);
    }
}

#[test]
fn odd_half_in_a_cycle_next_to_a_packable_half() {
    // v0[0,2) <- v1[1,3) <- v0[0,2), and v0[2,4) <- v2[0,2)
    let copies = [
        CopyOperation::new(half(0, 0), CopySource::Reg(half(1, 1)), 2),
        CopyOperation::new(half(0, 2), CopySource::Reg(half(2, 0)), 2),
        CopyOperation::new(half(1, 1), CopySource::Reg(half(0, 0)), 2),
    ];
    for level in [GfxLevel::Gfx8, GfxLevel::Gfx9, GfxLevel::Gfx10] {
        let (_, file) = resolve_and_run(level, &copies);
        assert_copied(&file, &copies);
        assert_untouched(&file, &[half(1, 0), half(1, 3), half(2, 2), half(2, 3)]);
    }
}
