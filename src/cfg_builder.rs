//! Structured program construction.
//!
//! [`ShaderBuilder`] lays out blocks the way an instruction selector does:
//! a divergent `if` gets separate logical and linear arms plus an invert
//! block, loops get a preheader, a header and an exit, and jumps out of
//! divergent regions go through helper blocks so that no linear edge is
//! critical. The passes rely on this layout.

use crate::config::TargetConfig;
use crate::ir::{
    BlockId, BlockKind, Definition, InstrData, Instruction, Opcode, Operand, PhysReg, Program,
    RegClass, Stage, Temp,
};

#[derive(Debug)]
enum IfFrame {
    Divergent {
        if_block: BlockId,
        endif_kind: BlockKind,
        outer_dead: bool,
        /// Filled once the else arm starts.
        then_end: Option<(BlockId, bool)>,
        invert: Option<BlockId>,
    },
    Uniform {
        if_block: BlockId,
        endif_kind: BlockKind,
        outer_dead: bool,
        /// Block ending the then arm and whether it still falls through to the endif.
        then_end: Option<(BlockId, bool, bool)>,
    },
}

#[derive(Debug)]
struct LoopFrame {
    header: BlockId,
    exit_kind: BlockKind,
    /// Number of open divergent ifs when the loop started.
    divergent_ifs: usize,
    has_divergent_continue: bool,
    has_discard: bool,
    outer_dead: bool,
    exit_logical_preds: Vec<BlockId>,
    exit_linear_preds: Vec<BlockId>,
}

/// Builder for a [`Program`] in the block layout the passes expect.
pub struct ShaderBuilder {
    program: Program,
    current: BlockId,
    loop_depth: u32,
    ifs: Vec<IfFrame>,
    divergent_ifs: usize,
    loops: Vec<LoopFrame>,
    /// The current block ends in a uniform jump.
    has_branch: bool,
    /// The current block has no logical predecessor path.
    logically_dead: bool,
}

impl ShaderBuilder {
    /// Create a builder whose entry block starts with `p_startpgm`.
    pub fn new(config: TargetConfig, stage: Stage) -> Self {
        let mut program = Program::new(config, stage);
        let entry = program.create_and_insert_block();
        program.block_mut(entry).kind = BlockKind::TOP_LEVEL;
        let mut builder = ShaderBuilder {
            program,
            current: entry,
            loop_depth: 0,
            ifs: Vec::new(),
            divergent_ifs: 0,
            loops: Vec::new(),
            has_branch: false,
            logically_dead: false,
        };
        builder.push(Instruction::new(Opcode::PStartpgm, [], []));
        builder.push(Instruction::new(Opcode::PLogicalStart, [], []));
        builder
    }

    pub fn set_needs(&mut self, wqm: bool, exact: bool) {
        self.program.needs_wqm = wqm;
        self.program.needs_exact = exact;
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn current(&self) -> BlockId {
        self.current
    }

    pub fn lm(&self) -> RegClass {
        self.program.lane_mask()
    }

    pub fn tmp(&mut self, rc: RegClass) -> Temp {
        self.program.allocate_tmp(rc)
    }

    pub fn vgpr(&mut self) -> Temp {
        self.tmp(RegClass::V1)
    }

    pub fn sgpr(&mut self) -> Temp {
        self.tmp(RegClass::S1)
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn push(&mut self, instr: Instruction) -> &mut Instruction {
        assert!(
            !self.has_branch,
            "{}: instruction after a loop jump",
            self.current
        );
        let instrs = &mut self.program.block_mut(self.current).instructions;
        instrs.push(instr);
        let last = instrs.len() - 1;
        &mut instrs[last]
    }

    fn new_block(&mut self, kind: BlockKind) -> BlockId {
        let id = self.program.create_and_insert_block();
        let block = self.program.block_mut(id);
        block.kind = kind;
        block.loop_nest_depth = self.loop_depth;
        id
    }

    fn append_to(&mut self, block: BlockId, opcode: Opcode) {
        self.program
            .block_mut(block)
            .instructions
            .push(Instruction::new(opcode, [], []));
    }

    fn start(&mut self, block: BlockId) {
        self.current = block;
        self.has_branch = false;
        self.append_to(block, Opcode::PLogicalStart);
    }

    /// Close the current block with `p_logical_end` and a plain branch.
    fn close_uniform(&mut self) -> BlockId {
        let block = self.current;
        self.append_to(block, Opcode::PLogicalEnd);
        self.append_to(block, Opcode::PBranch);
        self.program.block_mut(block).kind.insert(BlockKind::UNIFORM);
        block
    }

    /// A block holding nothing but a linear branch.
    fn linear_block(&mut self) -> BlockId {
        let block = self.new_block(BlockKind::UNIFORM);
        self.append_to(block, Opcode::PBranch);
        block
    }

    fn mark_discard(&mut self) {
        self.program
            .block_mut(self.current)
            .kind
            .insert(BlockKind::USES_DISCARD);
        self.program.needs_exact = true;
        for frame in &mut self.loops {
            frame.has_discard = true;
        }
    }

    // ── Instructions ────────────────────────────────────────────────

    /// Append an instruction to the current block.
    pub fn emit(
        &mut self,
        opcode: Opcode,
        definitions: impl IntoIterator<Item = Definition>,
        operands: impl IntoIterator<Item = Operand>,
    ) -> &mut Instruction {
        self.push(Instruction::new(opcode, definitions, operands))
    }

    /// A phi at the head of the current block.
    pub fn phi(&mut self, opcode: Opcode, rc: RegClass, operands: impl IntoIterator<Item = Operand>) -> Temp {
        assert!(opcode.is_phi(), "{opcode} is not a phi");
        let dst = self.tmp(rc);
        let block = self.program.block_mut(self.current);
        let at = block.first_non_phi();
        block
            .instructions
            .insert(at, Instruction::new(opcode, [Definition::temp(dst)], operands));
        dst
    }

    /// Patch operand `index` of the phi defining `phi` in `block`, for loop-carried values.
    pub fn set_phi_operand(&mut self, block: BlockId, phi: Temp, index: usize, op: Operand) {
        let instr = self
            .program
            .block_mut(block)
            .instructions
            .iter_mut()
            .find(|i| i.is_phi() && i.definitions[0].temp == Some(phi));
        match instr {
            Some(instr) => instr.operands[index] = op,
            None => panic!("{block}: no phi defines {phi:?}"),
        }
    }

    /// A per-lane boolean: a VGPR compare into a fresh lane mask.
    pub fn divergent_condition(&mut self) -> Temp {
        let value = self.vgpr();
        self.emit(Opcode::VMovB32, [Definition::temp(value)], [Operand::c32(0x3f80_0000)]);
        let cond = self.tmp(self.lm());
        self.emit(
            Opcode::VCmpLtF32,
            [Definition::temp(cond)],
            [Operand::c32(0), Operand::temp(value)],
        );
        cond
    }

    /// A wave-uniform boolean living in `scc`.
    pub fn uniform_condition(&mut self) -> Temp {
        let value = self.sgpr();
        self.emit(Opcode::SMovB32, [Definition::temp(value)], [Operand::c32(1)]);
        let cond = self.sgpr();
        self.emit(
            Opcode::SCmpLgU32,
            [Definition::temp_fixed(cond, PhysReg::SCC)],
            [Operand::temp(value), Operand::c32(0)],
        );
        cond
    }

    /// Export nothing, marking the end of a fragment shader's output.
    pub fn export_null(&mut self) {
        let data = InstrData::Export {
            target: 9,
            enabled_mask: 0,
            done: true,
            valid_mask: true,
        };
        self.emit(Opcode::Exp, [], [Operand::undef(RegClass::V1); 4]).data = data;
    }

    pub fn discard_if(&mut self, cond: Temp) {
        self.mark_discard();
        self.emit(Opcode::PDiscardIf, [], [Operand::temp(cond)]);
    }

    /// Discard every active lane.
    pub fn discard(&mut self) {
        self.mark_discard();
        let all = Operand::lane_mask_constant(true, self.lm());
        self.emit(Opcode::PDiscardIf, [], [all]);
    }

    pub fn demote_if(&mut self, cond: Temp) {
        self.mark_discard();
        self.emit(Opcode::PDemoteToHelper, [], [Operand::temp(cond)]);
    }

    /// Demote every active lane to a helper.
    pub fn demote(&mut self) {
        self.mark_discard();
        let all = Operand::lane_mask_constant(true, self.lm());
        self.emit(Opcode::PDemoteToHelper, [], [all]);
    }

    // ── Structured control flow ─────────────────────────────────────

    /// Start an `if` on a per-lane condition; the current block becomes the branch block.
    pub fn begin_divergent_if(&mut self, cond: Temp) {
        let if_block = self.current;
        self.append_to(if_block, Opcode::PLogicalEnd);
        self.push(Instruction::new(Opcode::PCbranchZ, [], [Operand::temp(cond)]));
        let kind = &mut self.program.block_mut(if_block).kind;
        kind.insert(BlockKind::BRANCH);
        let endif_kind = BlockKind::MERGE | (*kind & BlockKind::TOP_LEVEL);

        self.ifs.push(IfFrame::Divergent {
            if_block,
            endif_kind,
            outer_dead: self.logically_dead,
            then_end: None,
            invert: None,
        });
        self.divergent_ifs += 1;

        let then_logical = self.new_block(BlockKind::empty());
        self.program.add_edge(if_block, then_logical);
        self.start(then_logical);
    }

    pub fn begin_else(&mut self) {
        let (if_block, outer_dead) = match self.ifs.last() {
            Some(IfFrame::Divergent {
                if_block,
                outer_dead,
                ..
            }) => (*if_block, *outer_dead),
            _ => panic!("begin_else without an open divergent if"),
        };

        let then_logical = if self.has_branch {
            self.current
        } else {
            self.close_uniform()
        };
        let then_dead = self.logically_dead;

        let then_linear = self.linear_block();
        self.program.add_linear_edge(if_block, then_linear);

        let invert_block = self.new_block(BlockKind::INVERT);
        self.program.add_linear_edge(then_logical, invert_block);
        self.program.add_linear_edge(then_linear, invert_block);
        self.append_to(invert_block, Opcode::PBranch);

        if let Some(IfFrame::Divergent {
            then_end, invert, ..
        }) = self.ifs.last_mut()
        {
            *then_end = Some((then_logical, then_dead));
            *invert = Some(invert_block);
        }

        self.logically_dead = outer_dead;
        let else_logical = self.new_block(BlockKind::empty());
        self.program.add_logical_edge(if_block, else_logical);
        self.program.add_linear_edge(invert_block, else_logical);
        self.start(else_logical);
    }

    pub fn end_divergent_if(&mut self) {
        let Some(IfFrame::Divergent {
            endif_kind,
            outer_dead,
            then_end: Some((then_logical, then_dead)),
            invert: Some(invert),
            ..
        }) = self.ifs.pop()
        else {
            panic!("end_divergent_if without begin_else");
        };

        let else_logical = if self.has_branch {
            self.current
        } else {
            self.close_uniform()
        };
        let else_dead = self.logically_dead;

        let else_linear = self.linear_block();
        self.program.add_linear_edge(invert, else_linear);

        let endif = self.new_block(endif_kind);
        if !then_dead {
            self.program.add_logical_edge(then_logical, endif);
        }
        if !else_dead {
            self.program.add_logical_edge(else_logical, endif);
        }
        self.program.add_linear_edge(else_logical, endif);
        self.program.add_linear_edge(else_linear, endif);

        self.divergent_ifs -= 1;
        self.logically_dead = outer_dead;
        self.start(endif);
    }

    /// Start an `if` on a condition from [`uniform_condition`](Self::uniform_condition).
    pub fn begin_uniform_if(&mut self, cond: Temp) {
        let if_block = self.current;
        self.append_to(if_block, Opcode::PLogicalEnd);
        self.push(Instruction::new(
            Opcode::PCbranchZ,
            [],
            [Operand::temp_fixed(cond, PhysReg::SCC)],
        ));
        let kind = &mut self.program.block_mut(if_block).kind;
        kind.insert(BlockKind::UNIFORM);
        let endif_kind = BlockKind::UNIFORM | (*kind & BlockKind::TOP_LEVEL);

        self.ifs.push(IfFrame::Uniform {
            if_block,
            endif_kind,
            outer_dead: self.logically_dead,
            then_end: None,
        });

        let then_block = self.new_block(BlockKind::empty());
        self.program.add_edge(if_block, then_block);
        self.start(then_block);
    }

    pub fn begin_uniform_else(&mut self) {
        let (if_block, outer_dead) = match self.ifs.last() {
            Some(IfFrame::Uniform {
                if_block,
                outer_dead,
                ..
            }) => (*if_block, *outer_dead),
            _ => panic!("begin_uniform_else without an open uniform if"),
        };

        let falls_through = !self.has_branch;
        let then_block = if falls_through {
            self.close_uniform()
        } else {
            self.current
        };
        let then_dead = self.logically_dead;
        if let Some(IfFrame::Uniform { then_end, .. }) = self.ifs.last_mut() {
            *then_end = Some((then_block, falls_through, then_dead));
        }

        self.logically_dead = outer_dead;
        let else_block = self.new_block(BlockKind::empty());
        self.program.add_edge(if_block, else_block);
        self.start(else_block);
    }

    pub fn end_uniform_if(&mut self) {
        let Some(IfFrame::Uniform {
            endif_kind,
            outer_dead,
            then_end: Some((then_block, then_falls, then_dead)),
            ..
        }) = self.ifs.pop()
        else {
            panic!("end_uniform_if without begin_uniform_else");
        };

        let else_falls = !self.has_branch;
        let else_block = if else_falls {
            self.close_uniform()
        } else {
            self.current
        };
        let else_dead = self.logically_dead;

        let endif = self.new_block(endif_kind);
        for (block, falls, dead) in [
            (then_block, then_falls, then_dead),
            (else_block, else_falls, else_dead),
        ] {
            if !falls {
                continue;
            }
            self.program.add_linear_edge(block, endif);
            if !dead {
                self.program.add_logical_edge(block, endif);
            }
        }

        self.logically_dead = outer_dead;
        self.start(endif);
    }

    /// Start a loop; the current block becomes its preheader.
    pub fn begin_loop(&mut self) {
        let preheader = self.current;
        self.append_to(preheader, Opcode::PLogicalEnd);
        self.push(Instruction::new(Opcode::PBranch, [], []));
        let kind = &mut self.program.block_mut(preheader).kind;
        kind.insert(BlockKind::LOOP_PREHEADER | BlockKind::UNIFORM);
        let exit_kind = BlockKind::LOOP_EXIT | (*kind & BlockKind::TOP_LEVEL);

        self.loop_depth += 1;
        let header = self.new_block(BlockKind::LOOP_HEADER);
        self.program.add_edge(preheader, header);
        self.loops.push(LoopFrame {
            header,
            exit_kind,
            divergent_ifs: self.divergent_ifs,
            has_divergent_continue: false,
            has_discard: false,
            outer_dead: self.logically_dead,
            exit_logical_preds: Vec::new(),
            exit_linear_preds: Vec::new(),
        });
        self.start(header);
    }

    pub fn end_loop(&mut self) {
        let Some(frame) = self.loops.pop() else {
            panic!("end_loop without begin_loop");
        };

        if !self.has_branch {
            let latch = self.current;
            self.append_to(latch, Opcode::PLogicalEnd);
            let mut exit_linear_preds = frame.exit_linear_preds.clone();
            if frame.has_discard {
                // leave the loop once discards have emptied the loop mask
                self.program
                    .block_mut(latch)
                    .kind
                    .insert(BlockKind::CONTINUE_OR_BREAK | BlockKind::UNIFORM);
                let break_block = self.linear_block();
                self.program.add_linear_edge(latch, break_block);
                exit_linear_preds.push(break_block);
                let continue_block = self.linear_block();
                self.program.add_linear_edge(latch, continue_block);
                self.program.add_linear_edge(continue_block, frame.header);
                if !self.logically_dead {
                    self.program.add_logical_edge(latch, frame.header);
                }
            } else {
                self.program
                    .block_mut(latch)
                    .kind
                    .insert(BlockKind::CONTINUE | BlockKind::UNIFORM);
                if self.logically_dead {
                    self.program.add_linear_edge(latch, frame.header);
                } else {
                    self.program.add_edge(latch, frame.header);
                }
            }
            self.append_to(latch, Opcode::PBranch);
            self.finish_loop(&frame, &exit_linear_preds);
        } else {
            self.finish_loop(&frame, &frame.exit_linear_preds);
        }
        if let Some(outer) = self.loops.last_mut() {
            outer.has_discard |= frame.has_discard;
        }
    }

    fn finish_loop(&mut self, frame: &LoopFrame, linear: &[BlockId]) {
        self.loop_depth -= 1;
        let exit = self.new_block(frame.exit_kind);
        for &pred in &frame.exit_logical_preds {
            self.program.add_logical_edge(pred, exit);
        }
        for &pred in linear {
            self.program.add_linear_edge(pred, exit);
        }
        self.logically_dead = frame.outer_dead;
        self.start(exit);
    }

    pub fn emit_break(&mut self) {
        self.loop_jump(true);
    }

    pub fn emit_continue(&mut self) {
        self.loop_jump(false);
    }

    fn loop_jump(&mut self, is_break: bool) {
        let block = self.current;
        let Some(frame) = self.loops.last_mut() else {
            panic!("loop jump outside of a loop");
        };
        let in_divergent_if = self.divergent_ifs > frame.divergent_ifs;
        let header = frame.header;
        self.program
            .block_mut(block)
            .instructions
            .push(Instruction::new(Opcode::PLogicalEnd, [], []));

        let uniform = if is_break {
            !in_divergent_if && !frame.has_divergent_continue
        } else {
            !in_divergent_if
        };
        let kind = if is_break {
            BlockKind::BREAK
        } else {
            BlockKind::CONTINUE
        };
        self.program.block_mut(block).kind.insert(kind);

        if is_break {
            if !self.logically_dead {
                frame.exit_logical_preds.push(block);
            }
        } else if !self.logically_dead {
            self.program.add_logical_edge(block, header);
        }

        if uniform {
            self.program.block_mut(block).kind.insert(BlockKind::UNIFORM);
            self.append_to(block, Opcode::PBranch);
            if is_break {
                if let Some(frame) = self.loops.last_mut() {
                    frame.exit_linear_preds.push(block);
                }
            } else {
                self.program.add_linear_edge(block, header);
            }
            self.has_branch = true;
            return;
        }

        if !is_break {
            frame.has_divergent_continue = true;
        }
        self.append_to(block, Opcode::PBranch);

        // helper blocks keep the linear CFG free of critical edges
        let jump_block = self.linear_block();
        self.program.add_linear_edge(block, jump_block);
        if is_break {
            if let Some(frame) = self.loops.last_mut() {
                frame.exit_linear_preds.push(jump_block);
            }
        } else {
            self.program.add_linear_edge(jump_block, header);
        }

        let continue_block = self.new_block(BlockKind::empty());
        self.program.add_linear_edge(block, continue_block);
        self.logically_dead = true;
        self.start(continue_block);
    }

    /// Close the last block with `s_endpgm` and compute dominators.
    pub fn finish(mut self) -> Program {
        assert!(self.ifs.is_empty(), "unterminated if");
        assert!(self.loops.is_empty(), "unterminated loop");
        if !self.has_branch {
            self.append_to(self.current, Opcode::PLogicalEnd);
        }
        self.append_to(self.current, Opcode::SEndpgm);
        self.program.compute_dominators();
        self.program
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opcodes(program: &Program, block: usize) -> Vec<Opcode> {
        program.blocks[block]
            .instructions
            .iter()
            .map(|i| i.opcode)
            .collect()
    }

    #[test]
    fn divergent_if_layout() {
        let mut sb = ShaderBuilder::new(TargetConfig::default(), Stage::Compute);
        let cond = sb.divergent_condition();
        sb.begin_divergent_if(cond);
        sb.begin_else();
        sb.end_divergent_if();
        let program = sb.finish();

        assert_eq!(program.blocks.len(), 7);
        let kinds: Vec<BlockKind> = program.blocks.iter().map(|b| b.kind).collect();
        assert!(kinds[0].contains(BlockKind::BRANCH));
        assert!(kinds[1].contains(BlockKind::UNIFORM));
        assert!(kinds[3].contains(BlockKind::INVERT));
        assert!(kinds[6].contains(BlockKind::MERGE));
        assert!(kinds[6].contains(BlockKind::TOP_LEVEL));

        assert_eq!(program.blocks[0].linear_succs, vec![BlockId(1), BlockId(2)]);
        assert_eq!(program.blocks[0].logical_succs, vec![BlockId(1), BlockId(4)]);
        assert_eq!(program.blocks[3].linear_preds, vec![BlockId(1), BlockId(2)]);
        assert_eq!(program.blocks[3].linear_succs, vec![BlockId(4), BlockId(5)]);
        assert_eq!(program.blocks[6].logical_preds, vec![BlockId(1), BlockId(4)]);
        assert_eq!(program.blocks[6].linear_preds, vec![BlockId(4), BlockId(5)]);
        assert_eq!(program.blocks[6].logical_idom, Some(BlockId(0)));
        assert_eq!(
            opcodes(&program, 6),
            vec![Opcode::PLogicalStart, Opcode::PLogicalEnd, Opcode::SEndpgm]
        );
    }

    #[test]
    fn loop_with_divergent_break() {
        let mut sb = ShaderBuilder::new(TargetConfig::default(), Stage::Compute);
        sb.begin_loop();
        let cond = sb.divergent_condition();
        sb.begin_divergent_if(cond);
        sb.emit_break();
        sb.begin_else();
        sb.end_divergent_if();
        sb.end_loop();
        let program = sb.finish();

        // b0 preheader, b1 header, b2 break, b3 break helper, b4 dead continue,
        // b5 then linear, b6 invert, b7 else, b8 else linear, b9 endif/latch, b10 exit
        assert_eq!(program.blocks.len(), 11);
        let header = &program.blocks[1];
        assert!(header.kind.contains(BlockKind::LOOP_HEADER));
        assert_eq!(header.loop_nest_depth, 1);
        assert_eq!(header.linear_preds, vec![BlockId(0), BlockId(9)]);

        let brk = &program.blocks[2];
        assert!(brk.kind.contains(BlockKind::BREAK));
        assert!(!brk.kind.contains(BlockKind::UNIFORM));
        assert_eq!(brk.linear_succs, vec![BlockId(3), BlockId(4)]);
        assert!(program.blocks[4].logical_preds.is_empty());

        let exit = &program.blocks[10];
        assert!(exit.kind.contains(BlockKind::LOOP_EXIT));
        assert_eq!(exit.loop_nest_depth, 0);
        assert_eq!(exit.logical_preds, vec![BlockId(2)]);
        assert_eq!(exit.linear_preds, vec![BlockId(3)]);
        // only the else arm reaches the endif logically
        assert_eq!(program.blocks[9].logical_preds, vec![BlockId(7)]);
    }

    #[test]
    fn discard_in_loop_uses_continue_or_break() {
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
        let program = sb.finish();

        assert!(program.needs_exact);
        assert!(program.blocks[1].kind.contains(BlockKind::USES_DISCARD));
        let latch = program
            .blocks
            .iter()
            .find(|b| b.kind.contains(BlockKind::CONTINUE_OR_BREAK))
            .unwrap();
        assert_eq!(latch.linear_succs.len(), 2);
        let exit = program.blocks.last().unwrap();
        assert!(exit.kind.contains(BlockKind::LOOP_EXIT));
        assert_eq!(exit.linear_preds.len(), 2);
    }
}
