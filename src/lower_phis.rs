//! Lowering of divergent boolean phis and sub-dword phis.
//!
//! A lane-mask phi selects per lane, but after exec-mask synthesis both arms
//! of a divergent `if` run one after the other, so a plain linear phi would
//! pick one arm's mask for every lane. Each logical predecessor therefore
//! merges its lanes into a running mask (bits of inactive lanes are kept,
//! bits of active lanes replaced), and the running values are joined with
//! linear phis built by an on-demand SSA construction.

use std::ops::{BitOr, BitOrAssign};

use log::debug;

use crate::builder::{Builder, WaveOp};
use crate::error::CompileError;
use crate::ir::{
    BlockId, BlockKind, Definition, Instruction, Opcode, Operand, OperandValue, Program, RegClass,
    RegType, Temp,
};

/// What the predecessors of a block may have contributed to the phi.
///
/// The values form a small lattice under bitwise or: `CONST_1 | CONST_0`
/// is `TEMP`, and `ZERO` marks running values that are zero in every lane
/// outside the current mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Defined(u8);

impl Defined {
    const UNDEF: Defined = Defined(0);
    const CONST_1: Defined = Defined(1);
    const CONST_0: Defined = Defined(2);
    const TEMP: Defined = Defined(3);
    const ZERO: Defined = Defined(4);

    fn has_zero(self) -> bool {
        self.0 & Self::ZERO.0 != 0
    }
}

impl BitOr for Defined {
    type Output = Defined;
    fn bitor(self, rhs: Defined) -> Defined {
        Defined(self.0 | rhs.0)
    }
}

impl BitOrAssign for Defined {
    fn bitor_assign(&mut self, rhs: Defined) {
        self.0 |= rhs.0;
    }
}

#[derive(Default)]
struct SsaState {
    checked_preds_for_uniform: bool,
    all_preds_uniform: bool,
    loop_nest_depth: u32,
    any_pred_defined: Vec<Defined>,
    visited: Vec<bool>,
    outputs: Vec<Operand>,
}

impl SsaState {
    fn reset(&mut self, num_blocks: usize, lane_mask: RegClass) {
        self.any_pred_defined.clear();
        self.any_pred_defined.resize(num_blocks, Defined::UNDEF);
        self.visited.clear();
        self.visited.resize(num_blocks, false);
        self.outputs.clear();
        self.outputs.resize(num_blocks, Operand::undef(lane_mask));
    }

    /// Flow the lattice along linear successors over `start..end`.
    fn propagate(&mut self, program: &Program, start: usize, end: usize) {
        for j in start..end {
            let defined = self.any_pred_defined[j];
            if defined == Defined::UNDEF {
                continue;
            }
            for succ in &program.blocks[j].linear_succs {
                self.any_pred_defined[succ.index()] |= defined;
            }
        }
    }
}

/// The running mask at the end (`input == false`) or start of a block.
fn get_ssa(program: &mut Program, block_idx: usize, state: &mut SsaState, input: bool) -> Operand {
    let lm = program.lane_mask();
    if !input {
        if state.visited[block_idx] {
            return state.outputs[block_idx];
        }
        // nothing written here: output == input
        let output = get_ssa(program, block_idx, state, true);
        state.visited[block_idx] = true;
        state.outputs[block_idx] = output;
        return output;
    }

    if state.any_pred_defined[block_idx] == Defined::UNDEF {
        return Operand::undef(lm);
    }

    let block = &program.blocks[block_idx];
    let preds: Vec<usize> = block.linear_preds.iter().map(|b| b.index()).collect();
    let kind = block.kind;
    let depth = block.loop_nest_depth;

    if depth < state.loop_nest_depth {
        // loop-carried value seen from outside the loop
        return Operand::lane_mask_constant(false, lm);
    }
    if preds.is_empty() {
        return Operand::undef(lm);
    }
    if depth > state.loop_nest_depth || preds.len() == 1 || kind.contains(BlockKind::LOOP_EXIT) {
        return get_ssa(program, preds[0], state, false);
    }

    let mut previously_visited = state.visited[block_idx];
    if kind.contains(BlockKind::LOOP_HEADER) {
        // anchor the recursion around the back-edge
        previously_visited = true;
        state.visited[block_idx] = true;
        state.outputs[block_idx] = Operand::temp(program.allocate_tmp(lm));
    }

    let ops: Vec<Operand> = preds
        .iter()
        .map(|&pred| get_ssa(program, pred, state, false))
        .collect();

    if ops[1..].iter().all(|op| *op == ops[0]) {
        return ops[0];
    }

    // a recursive call through a loop header already built the phi
    if !previously_visited && state.visited[block_idx] {
        return state.outputs[block_idx];
    }

    let dst = if kind.contains(BlockKind::LOOP_HEADER) {
        match state.outputs[block_idx].temp_value() {
            Some(temp) => temp,
            None => panic!("b{block_idx}: loop header anchor is not a temp"),
        }
    } else {
        program.allocate_tmp(lm)
    };
    let phi = Instruction::new(Opcode::PLinearPhi, [Definition::temp(dst)], ops);
    program.blocks[block_idx].instructions.insert(0, phi);
    Operand::temp(dst)
}

fn logical_end_or_branch(program: &Program, block_idx: usize) -> Result<usize, CompileError> {
    let block = &program.blocks[block_idx];
    if let Some(at) = block.logical_end() {
        return Ok(at);
    }
    match block.instructions.last() {
        Some(last) if last.opcode.is_branch() => Ok(block.instructions.len() - 1),
        _ => Err(CompileError::InvalidCfg {
            block: BlockId(block_idx as u32),
            reason: "predecessor has neither p_logical_end nor a branch".into(),
        }),
    }
}

fn build_merge_code(
    program: &mut Program,
    state: &mut SsaState,
    block_idx: usize,
    cur: Operand,
) -> Result<(), CompileError> {
    let defined = state.any_pred_defined[block_idx];
    if defined == Defined::UNDEF {
        return Ok(());
    }
    let lm = program.lane_mask();
    let Some(dst) = state.outputs[block_idx].temp_value() else {
        panic!("b{block_idx}: merge destination is not a temp");
    };
    let dst = Definition::temp(dst);
    let prev = get_ssa(program, block_idx, state, true);
    let cur = if cur.is_undef() {
        Operand::lane_mask_constant(false, lm)
    } else {
        cur
    };

    let at = logical_end_or_branch(program, block_idx)?;
    let config = program.config;
    let mut bld = Builder::at(
        &mut program.temps,
        &mut program.blocks[block_idx].instructions,
        config,
        at,
    );
    let exec = Operand::exec(lm);

    if defined == Defined::CONST_0 {
        bld.wave(WaveOp::And, [dst, Definition::scc()], [cur, exec]);
        return Ok(());
    }
    if defined == Defined::CONST_1 {
        bld.wave(WaveOp::Orn2, [dst, Definition::scc()], [cur, exec]);
        return Ok(());
    }

    assert!(prev.is_temp(), "b{block_idx}: running mask {prev} is not a temp");
    if defined.has_zero() {
        // inactive lanes of prev are already zero
        let cur = match cur.constant_value() {
            Some(0) => {
                bld.copy(dst, prev);
                return Ok(());
            }
            Some(_) => exec,
            None => Operand::temp(bld.lane_op(WaveOp::And, [cur, exec])),
        };
        bld.wave(WaveOp::Or, [dst, Definition::scc()], [prev, cur]);
        return Ok(());
    }

    match cur.constant_value() {
        Some(0) => {
            bld.wave(WaveOp::Andn2, [dst, Definition::scc()], [prev, exec]);
        }
        Some(_) => {
            bld.wave(WaveOp::Or, [dst, Definition::scc()], [prev, exec]);
        }
        None => {
            let prev = bld.lane_op(WaveOp::Andn2, [prev, exec]);
            let cur = bld.lane_op(WaveOp::And, [cur, exec]);
            bld.wave(
                WaveOp::Or,
                [dst, Definition::scc()],
                [Operand::temp(prev), Operand::temp(cur)],
            );
        }
    }
    Ok(())
}

fn init_any_pred_defined(program: &Program, state: &mut SsaState, block_idx: usize, phi: &Instruction) {
    let block = &program.blocks[block_idx];
    for (op, pred) in phi.operands.iter().zip(&block.logical_preds) {
        let defined = match op.value {
            OperandValue::Undef => continue,
            OperandValue::Constant(0) => Defined::CONST_0,
            OperandValue::Constant(_) => Defined::CONST_1,
            _ => Defined::TEMP,
        };
        for succ in &program.blocks[pred.index()].linear_succs {
            state.any_pred_defined[succ.index()] |= defined;
        }
    }

    let mut start = block.logical_preds[0].index();
    let mut end = block_idx;

    if block.kind.contains(BlockKind::LOOP_EXIT) {
        // from the loop header on
        while start > 0 && program.blocks[start - 1].loop_nest_depth >= state.loop_nest_depth {
            start -= 1;
        }
        if program.blocks[start].linear_preds.len() > 1 {
            // the header needs a phi; the value entering the loop is zero
            state.any_pred_defined[start] = Defined::TEMP | Defined::ZERO;
            if start > 0 {
                state.any_pred_defined[start - 1] = Defined::CONST_0;
            }
        }
    }
    if block.kind.contains(BlockKind::LOOP_HEADER) {
        // up to the loop exit
        while end < program.blocks.len() && program.blocks[end].loop_nest_depth >= state.loop_nest_depth {
            end += 1;
        }
        state.any_pred_defined[block_idx] = Defined::UNDEF;
    }

    state.propagate(program, start, end);
    state.any_pred_defined[block_idx] = Defined::UNDEF;
}

/// Merge block of a divergent if/else whose phi has one constant and one temp operand.
///
/// Returns the branch block and the index of the temp operand.
fn fast_path(program: &Program, block_idx: usize, phi: &Instruction) -> Option<(usize, usize)> {
    let block = &program.blocks[block_idx];
    if !block.kind.contains(BlockKind::MERGE) || phi.operands.len() != 2 {
        return None;
    }
    let temp_idx = match (phi.operands[0].is_constant(), phi.operands[1].is_constant()) {
        (true, false) if phi.operands[1].is_temp() => 1,
        (false, true) if phi.operands[0].is_temp() => 0,
        _ => return None,
    };
    let branch = block.logical_idom?.index();
    let branch_block = &program.blocks[branch];
    if !branch_block.kind.contains(BlockKind::BRANCH)
        || branch_block.loop_nest_depth != block.loop_nest_depth
    {
        return None;
    }
    Some((branch, temp_idx))
}

fn lower_divergent_bool_phi(
    program: &mut Program,
    state: &mut SsaState,
    block_idx: usize,
    phi: &mut Instruction,
) -> Result<(), CompileError> {
    let lm = program.lane_mask();
    let block = &program.blocks[block_idx];

    if !state.checked_preds_for_uniform {
        state.all_preds_uniform = !block.kind.contains(BlockKind::MERGE)
            && block.linear_preds.len() == block.logical_preds.len()
            && block
                .logical_preds
                .iter()
                .all(|pred| program.blocks[pred.index()].kind.contains(BlockKind::UNIFORM));
        state.checked_preds_for_uniform = true;
    }
    if state.all_preds_uniform {
        phi.opcode = Opcode::PLinearPhi;
        return Ok(());
    }

    let logical_preds: Vec<usize> = block.logical_preds.iter().map(|b| b.index()).collect();
    let linear_preds: Vec<usize> = block.linear_preds.iter().map(|b| b.index()).collect();
    state.reset(program.blocks.len(), lm);
    state.loop_nest_depth = block.loop_nest_depth;
    if block.kind.contains(BlockKind::LOOP_EXIT) {
        state.loop_nest_depth += 1;
    }

    if let Some((branch, temp_idx)) = fast_path(program, block_idx, phi) {
        let constant_one = !phi.operands[1 - temp_idx].constant_equals(0);
        let at = logical_end_or_branch(program, branch)?;
        let config = program.config;
        let mut bld = Builder::at(
            &mut program.temps,
            &mut program.blocks[branch].instructions,
            config,
            at,
        );
        let init = if constant_one {
            bld.lane_op(WaveOp::Mov, [Operand::exec(lm)])
        } else {
            bld.lane_op(WaveOp::Mov, [Operand::lane_mask_constant(false, lm)])
        };

        state.any_pred_defined[branch] = if constant_one {
            Defined::TEMP
        } else {
            Defined::TEMP | Defined::ZERO
        };
        state.propagate(program, branch, block_idx);
        state.any_pred_defined[block_idx] = Defined::UNDEF;

        let arm = logical_preds[temp_idx];
        state.outputs[branch] = Operand::temp(init);
        state.visited[branch] = true;
        state.outputs[arm] = Operand::temp(program.allocate_tmp(lm));
        state.visited[arm] = true;
        build_merge_code(program, state, arm, phi.operands[temp_idx])?;
    } else {
        init_any_pred_defined(program, state, block_idx, phi);

        for (i, &pred) in logical_preds.iter().enumerate() {
            state.outputs[pred] = if state.any_pred_defined[pred] != Defined::UNDEF {
                Operand::temp(program.allocate_tmp(lm))
            } else {
                phi.operands[i]
            };
            state.visited[pred] = true;
        }
        for (i, &pred) in logical_preds.iter().enumerate() {
            build_merge_code(program, state, pred, phi.operands[i])?;
        }
    }

    phi.opcode = Opcode::PLinearPhi;
    phi.operands.clear();
    for pred in linear_preds {
        let op = get_ssa(program, pred, state, false);
        phi.operands.push(op);
    }
    Ok(())
}

fn lower_subdword_phi(program: &mut Program, block_idx: usize, phi: &mut Instruction) -> Result<(), CompileError> {
    let phi_rc = phi.definitions[0].rc;
    let config = program.config;
    for i in 0..phi.operands.len() {
        let Some(src) = phi.operands[i].temp_value() else {
            continue;
        };
        if src.ty() != RegType::Sgpr {
            continue;
        }
        let pred = program.blocks[block_idx].logical_preds[i].index();
        let at = logical_end_or_branch(program, pred)?;
        let mut bld = Builder::at(
            &mut program.temps,
            &mut program.blocks[pred].instructions,
            config,
            at,
        );
        let wide: Temp = bld.tmp(RegClass::dwords(RegType::Vgpr, src.size() as u8));
        bld.copy(Definition::temp(wide), Operand::temp(src));
        let narrow = bld.tmp(phi_rc);
        bld.emit(
            Opcode::PExtractVector,
            [Definition::temp(narrow)],
            [Operand::temp(wide), Operand::c32(0)],
        );
        phi.operands[i] = Operand::temp(narrow);
    }
    Ok(())
}

/// Rewrite lane-mask `p_phi`s into linear merge code and sub-dword phis into VGPR form.
pub fn lower_phis(program: &mut Program) -> Result<(), CompileError> {
    let lm = program.lane_mask();
    let mut state = SsaState::default();
    let mut bool_phis = 0usize;
    let mut subdword_phis = 0usize;

    for block_idx in 0..program.blocks.len() {
        state.checked_preds_for_uniform = false;
        let mut i = 0;
        while let Some(instr) = program.blocks[block_idx].instructions.get(i) {
            if !instr.is_phi() {
                break;
            }
            if instr.opcode != Opcode::PPhi {
                i += 1;
                continue;
            }
            let logical_preds = program.blocks[block_idx].logical_preds.len();
            if instr.operands.len() != logical_preds {
                return Err(CompileError::PhiOperandCount {
                    block: BlockId(block_idx as u32),
                    instr: i,
                    expected: logical_preds,
                    found: instr.operands.len(),
                });
            }

            let mut phi = instr.clone();
            let rc = phi.definitions[0].rc;
            if rc == lm {
                lower_divergent_bool_phi(program, &mut state, block_idx, &mut phi)?;
                bool_phis += 1;
            } else if rc.is_subdword() {
                lower_subdword_phi(program, block_idx, &mut phi)?;
                subdword_phis += 1;
            }

            let def = phi.definitions[0].temp;
            let instrs = &mut program.blocks[block_idx].instructions;
            let Some(at) = instrs
                .iter()
                .position(|instr| instr.is_phi() && instr.definitions[0].temp == def)
            else {
                return Err(CompileError::InvalidCfg {
                    block: BlockId(block_idx as u32),
                    reason: format!("phi at {i} disappeared while lowering it"),
                });
            };
            instrs[at] = phi;
            i = at + 1;
        }
    }

    debug!("lower_phis: {bool_phis} boolean phis, {subdword_phis} sub-dword phis");
    Ok(())
}
