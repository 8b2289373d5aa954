mod common;

use simtc::cfg_builder::ShaderBuilder;
use simtc::config::TargetConfig;
use simtc::ir::{Definition, Format, Opcode, Operand, PhysReg, Program, RegClass, Stage};
use simtc::ir_parse::parse_program;
use simtc::{lower_program, run_core, CompileError};

use common::RegFile;

const ALLOCATED_DIAMOND: &str = r#"
program wave64 gfx10 compute {
  block b0 [top-level, branch] depth 0:
    preds: logical [] linear []
    p_logical_start
    %1:v1@v0 = v_mov_b32 #0x1:s1
    %2:v1@v1 = v_mov_b32 #0x2:s1
    p_logical_end
    p_cbranch_z s2@exec -> b2, b1
    succs: logical [b1, b2] linear [b1, b2]
  block b1 [uniform] depth 0:
    preds: logical [b0] linear [b0]
    p_logical_start
    %3:v1@v2 = v_mov_b32 #0x3:s1
    p_logical_end
    p_branch -> b2
    succs: logical [b2] linear [b2]
  block b2 [top-level, merge] depth 0:
    preds: logical [b0, b1] linear [b0, b1]
    %4:v1@v0 = p_phi %1:v1@v0, %2:v1@v1
    %5:v1@v1 = p_phi %2:v1@v1, %1:v1@v0
    p_logical_start
    s_endpgm
    succs: logical [] linear []
}
"#;

#[test]
fn allocated_program_lowers_to_hardware_instructions() {
    let mut program = parse_program(ALLOCATED_DIAMOND).unwrap();
    lower_program(&mut program).unwrap();

    for instr in program.blocks.iter().flat_map(|b| &b.instructions) {
        assert!(
            !matches!(instr.format(), Format::Pseudo | Format::PseudoBranch),
            "{instr} left after lowering"
        );
    }

    // the phis exchange v0 and v1 on the path through b1
    let b1 = &program.blocks[1].instructions;
    assert!(b1.iter().any(|i| i.opcode == Opcode::VSwapB32));
    assert_eq!(program.statistics.copies, 1);

    let mut file = RegFile::new();
    file.run(
        &b1.iter()
            .filter(|i| i.format().is_valu())
            .cloned()
            .collect::<Vec<_>>(),
    );
    let initial = RegFile::new();
    let (v0, v1) = (PhysReg::vgpr(0).reg_b(), PhysReg::vgpr(1).reg_b());
    assert_eq!(file.read(v0, 4), initial.read(v1, 4));
    assert_eq!(file.read(v1, 4), initial.read(v0, 4));
}

#[test]
fn phi_without_register_is_rejected_before_lowering() {
    let input = ALLOCATED_DIAMOND.replace("%4:v1@v0 = p_phi", "%4:v1 = p_phi");
    let mut program = parse_program(&input).unwrap();
    assert!(matches!(
        lower_program(&mut program),
        Err(CompileError::MissingPhysReg { .. })
    ));
}

#[test]
fn use_before_def_is_reported() {
    let mut sb = ShaderBuilder::new(TargetConfig::default(), Stage::Compute);
    let ghost = sb.vgpr();
    let v = sb.vgpr();
    sb.emit(Opcode::VMovB32, [Definition::temp(v)], [Operand::temp(ghost)]);
    let mut program = sb.finish();
    assert_eq!(
        run_core(&mut program).unwrap_err(),
        CompileError::UseBeforeDef {
            temps: vec![ghost.id()]
        }
    );
}

fn if_else_with_phi() -> Program {
    let mut sb = ShaderBuilder::new(TargetConfig::default(), Stage::Compute);
    let base = sb.vgpr();
    sb.emit(Opcode::VMovB32, [Definition::temp(base)], [Operand::c32(5)]);
    let cond = sb.divergent_condition();
    sb.begin_divergent_if(cond);
    let then_value = sb.vgpr();
    sb.emit(
        Opcode::VAddF32,
        [Definition::temp(then_value)],
        [Operand::c32(1), Operand::temp(base)],
    );
    sb.begin_else();
    let else_value = sb.vgpr();
    sb.emit(
        Opcode::VAddF32,
        [Definition::temp(else_value)],
        [Operand::c32(2), Operand::temp(base)],
    );
    sb.end_divergent_if();
    let merged = sb.phi(
        Opcode::PPhi,
        RegClass::V1,
        [Operand::temp(then_value), Operand::temp(else_value)],
    );
    let out = sb.vgpr();
    sb.emit(Opcode::VMovB32, [Definition::temp(out)], [Operand::temp(merged)]);
    sb.finish()
}

#[test]
fn liveness_covers_every_upward_exposed_use() {
    let mut program = if_else_with_phi();
    let out = run_core(&mut program).unwrap();
    let liveness = &out.liveness;

    assert!(liveness.live_in[0].is_empty());
    for block in &program.blocks {
        let mut defined = Vec::new();
        for instr in block.instructions.iter().filter(|i| !i.is_phi()) {
            for op in &instr.operands {
                if let Some(temp) = op.temp_value()
                    && !defined.contains(&temp.id())
                {
                    assert!(
                        liveness.live_in[block.index.index()].contains(temp.id()),
                        "{}: %{} used in {instr} but not live-in",
                        block.index,
                        temp.id()
                    );
                }
            }
            defined.extend(instr.definitions.iter().filter_map(|d| d.temp).map(|t| t.id()));
        }
    }
    assert!(program.max_reg_demand.vgpr > 0);
}
