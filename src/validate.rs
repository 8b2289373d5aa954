//! Checks of the contracts at both ends of the core.
//!
//! [`validate_ir`] checks what the passes assume about their input;
//! [`validate_lowered`] checks what the encoder may assume about the output.

use log::debug;

use crate::error::CompileError;
use crate::ir::{BlockId, Format, Opcode, Program};

fn cfg_error(block: BlockId, reason: String) -> CompileError {
    CompileError::InvalidCfg { block, reason }
}

fn check_edges(program: &Program) -> Result<(), CompileError> {
    let num_blocks = program.blocks.len();
    for block in &program.blocks {
        let id = block.index;
        let edges = [
            ("logical", &block.logical_succs, &block.logical_preds),
            ("linear", &block.linear_succs, &block.linear_preds),
        ];
        for (kind, succs, preds) in edges {
            for &succ in succs {
                if succ.index() >= num_blocks {
                    return Err(cfg_error(id, format!("{kind} successor {succ} does not exist")));
                }
                let back = match kind {
                    "logical" => &program.block(succ).logical_preds,
                    _ => &program.block(succ).linear_preds,
                };
                if !back.contains(&id) {
                    return Err(cfg_error(
                        id,
                        format!("{kind} successor {succ} does not list it as a predecessor"),
                    ));
                }
            }
            for &pred in preds {
                if pred.index() >= num_blocks {
                    return Err(cfg_error(id, format!("{kind} predecessor {pred} does not exist")));
                }
                let forward = match kind {
                    "logical" => &program.block(pred).logical_succs,
                    _ => &program.block(pred).linear_succs,
                };
                if !forward.contains(&id) {
                    return Err(cfg_error(
                        id,
                        format!("{kind} predecessor {pred} does not list it as a successor"),
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Check the input contract: symmetric edges, well-formed phis and single
/// definitions of correctly-classed temps.
pub fn validate_ir(program: &Program) -> Result<(), CompileError> {
    check_edges(program)?;

    let mut defined = vec![false; program.temps.len()];
    for block in &program.blocks {
        let mut in_phis = true;
        for (idx, instr) in block.instructions.iter().enumerate() {
            if instr.is_phi() {
                if !in_phis {
                    return Err(cfg_error(block.index, format!("phi at {idx} after a non-phi")));
                }
                let preds = match instr.opcode {
                    Opcode::PPhi => &block.logical_preds,
                    _ => &block.linear_preds,
                };
                if instr.operands.len() != preds.len() {
                    return Err(CompileError::PhiOperandCount {
                        block: block.index,
                        instr: idx,
                        expected: preds.len(),
                        found: instr.operands.len(),
                    });
                }
            } else {
                in_phis = false;
            }

            for def in &instr.definitions {
                let Some(temp) = def.temp else {
                    continue;
                };
                let id = temp.id();
                if id == 0 || id as usize >= defined.len() {
                    return Err(cfg_error(block.index, format!("%{id} is not a declared temp")));
                }
                if std::mem::replace(&mut defined[id as usize], true) {
                    return Err(cfg_error(block.index, format!("%{id} is defined twice")));
                }
                let declared = program.temps.rc(id);
                if temp.rc() != declared {
                    return Err(cfg_error(
                        block.index,
                        format!("%{id} defined as {} but declared {declared}", temp.rc()),
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Check the output contract: hardware instructions only, every operand
/// and definition in a physical register.
pub fn validate_lowered(program: &Program) -> Result<(), CompileError> {
    for block in &program.blocks {
        for (idx, instr) in block.instructions.iter().enumerate() {
            if matches!(instr.format(), Format::Pseudo | Format::PseudoBranch) {
                return Err(CompileError::NotImplemented {
                    block: block.index,
                    what: format!("{} left after lowering", instr.opcode),
                });
            }
            let missing_op = instr
                .operands
                .iter()
                .any(|op| !op.is_constant() && !op.is_undef() && op.reg.is_none());
            let missing_def = instr.definitions.iter().any(|def| def.reg.is_none());
            if missing_op || missing_def {
                return Err(CompileError::MissingPhysReg {
                    block: block.index,
                    instr: idx,
                });
            }
        }
    }
    debug!("validate: lowered program is well-formed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir_parse::parse_program;

    const TWO_BLOCKS: &str = r#"
program wave64 gfx10 compute {
  block b0 [top-level] depth 0:
    preds: logical [] linear []
    p_logical_start
    %1:v1 = v_mov_b32 #0x1:s1
    p_logical_end
    p_branch -> b1
    succs: logical [b1] linear [b1]
  block b1 [top-level] depth 0:
    preds: logical [b0] linear [b0]
    %2:v1 = p_phi %1:v1
    p_logical_start
    s_endpgm
    succs: logical [] linear []
}
"#;

    #[test]
    fn accepts_a_well_formed_program() {
        validate_ir(&parse_program(TWO_BLOCKS).unwrap()).unwrap();
    }

    #[test]
    fn rejects_asymmetric_edges() {
        let mut program = parse_program(TWO_BLOCKS).unwrap();
        program.blocks[1].linear_preds.clear();
        let err = validate_ir(&program).unwrap_err();
        assert!(
            matches!(&err, CompileError::InvalidCfg { block: BlockId(0), reason } if reason.contains("linear successor")),
            "{err}"
        );
    }

    #[test]
    fn rejects_phi_operand_mismatch() {
        let input = TWO_BLOCKS.replace("p_phi %1:v1", "p_phi %1:v1, %1:v1");
        let err = validate_ir(&parse_program(&input).unwrap()).unwrap_err();
        assert_eq!(
            err,
            CompileError::PhiOperandCount {
                block: BlockId(1),
                instr: 0,
                expected: 1,
                found: 2
            }
        );
    }

    #[test]
    fn rejects_late_phis_and_redefinitions() {
        let input = TWO_BLOCKS.replace(
            "    %2:v1 = p_phi %1:v1\n    p_logical_start\n",
            "    p_logical_start\n    %2:v1 = p_phi %1:v1\n",
        );
        let err = validate_ir(&parse_program(&input).unwrap()).unwrap_err();
        assert!(err.to_string().contains("after a non-phi"), "{err}");

        let input = TWO_BLOCKS.replace("%2:v1 = p_phi", "%1:v1 = p_phi");
        let err = validate_ir(&parse_program(&input).unwrap()).unwrap_err();
        assert!(err.to_string().contains("defined twice"), "{err}");
    }

    #[test]
    fn lowered_programs_need_registers_and_no_pseudo_ops() {
        let program = parse_program(TWO_BLOCKS).unwrap();
        let err = validate_lowered(&program).unwrap_err();
        assert!(matches!(err, CompileError::NotImplemented { block: BlockId(0), .. }));

        let input = r#"
program wave64 gfx10 compute {
  block b0 [top-level] depth 0:
    preds: logical [] linear []
    v1@v0 = v_mov_b32 #0x1:s1
    %3:v1 = v_mov_b32 v1@v0
    s_endpgm
    succs: logical [] linear []
}
"#;
        let err = validate_lowered(&parse_program(input).unwrap()).unwrap_err();
        assert_eq!(
            err,
            CompileError::MissingPhysReg {
                block: BlockId(0),
                instr: 1
            }
        );
    }
}
