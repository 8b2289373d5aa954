//! Execution-mask synthesis.
//!
//! Structured control flow over divergent lanes is emulated by keeping the
//! hardware `exec` register equal to the set of lanes that should run the
//! current block. Every block carries a stack of masks: the bottom entry is
//! the shader's real (exact) mask, further entries are pushed for whole-quad
//! mode, loops and divergent branches, and popped again at merges.
//!
//! The top entry always describes the value currently in `exec`. Entries
//! below the top are saved copies (a temp, or the all-ones constant).

use std::collections::VecDeque;
use std::fmt;
use std::ops::{BitAnd, BitOr};

use log::{debug, trace};

use crate::builder::{Builder, WaveOp};
use crate::error::CompileError;
use crate::ir::{
    BlockId, BlockKind, Definition, Format, InstrData, Instruction, Opcode, Operand, OperandValue,
    PhysReg, Program, RegClass, Stage, Temp,
};

// ─── Mask stack ─────────────────────────────────────────────────────────────

/// Role tags of a mask stack entry.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct MaskKind(u8);

impl MaskKind {
    /// Defines the hardware mask for the enclosing structured region.
    pub const GLOBAL: MaskKind = MaskKind(1 << 0);
    pub const EXACT: MaskKind = MaskKind(1 << 1);
    pub const WQM: MaskKind = MaskKind(1 << 2);
    /// Lanes still active in the innermost loop.
    pub const LOOP: MaskKind = MaskKind(1 << 3);

    pub fn contains(self, other: MaskKind) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: MaskKind) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: MaskKind) {
        self.0 &= !other.0;
    }

    /// Just the mode bits.
    pub fn mode(self) -> MaskKind {
        self & (MaskKind::EXACT | MaskKind::WQM)
    }
}

impl BitOr for MaskKind {
    type Output = MaskKind;
    fn bitor(self, rhs: MaskKind) -> MaskKind {
        MaskKind(self.0 | rhs.0)
    }
}

impl BitAnd for MaskKind {
    type Output = MaskKind;
    fn bitand(self, rhs: MaskKind) -> MaskKind {
        MaskKind(self.0 & rhs.0)
    }
}

impl fmt::Debug for MaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (MaskKind::GLOBAL, "global"),
            (MaskKind::EXACT, "exact"),
            (MaskKind::WQM, "wqm"),
            (MaskKind::LOOP, "loop"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(kind, _)| self.contains(*kind))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", set.join("|"))
    }
}

/// Where a mask currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskValue {
    /// Only in the hardware register.
    Exec,
    Temp(Temp),
    AllOnes,
}

impl MaskValue {
    fn operand(self, lane_mask: RegClass) -> Operand {
        match self {
            MaskValue::Exec => Operand::exec(lane_mask),
            MaskValue::Temp(temp) => Operand::temp(temp),
            MaskValue::AllOnes => Operand::lane_mask_constant(true, lane_mask),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskEntry {
    pub value: MaskValue,
    pub kind: MaskKind,
}

impl MaskEntry {
    fn new(value: MaskValue, kind: MaskKind) -> Self {
        Self { value, kind }
    }
}

/// Per-block stack depths, for tests and debugging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockTrace {
    pub entry_depth: usize,
    pub exit_depth: usize,
    /// Recorded depth of the innermost enclosing loop, 0 outside loops.
    pub loop_depth: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ExecMaskTrace {
    pub blocks: Vec<BlockTrace>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Unspecified,
    Exact,
    Wqm,
}

#[derive(Debug, Clone, Copy)]
struct LoopInfo {
    header: BlockId,
    num_exec_masks: usize,
    has_divergent_break: bool,
    has_divergent_continue: bool,
    has_discard: bool,
}

struct ExecCtx {
    stacks: Vec<Vec<MaskEntry>>,
    loops: Vec<LoopInfo>,
    handle_wqm: bool,
    trace: ExecMaskTrace,
}

fn needs_exact(instr: &Instruction) -> bool {
    instr.disables_wqm() || instr.format() == Format::Exp
}

fn instr_needs(instr: &Instruction, handle_wqm: bool) -> Mode {
    if !handle_wqm {
        return Mode::Unspecified;
    }
    if needs_exact(instr) {
        Mode::Exact
    } else if instr.is_exec_predicated() || instr.opcode.is_branch() {
        Mode::Wqm
    } else {
        Mode::Unspecified
    }
}

fn top(stack: &mut [MaskEntry]) -> &mut MaskEntry {
    match stack.last_mut() {
        Some(entry) => entry,
        None => panic!("mask stack is empty"),
    }
}

fn restore_exec(bld: &mut Builder<'_>, value: MaskValue) {
    if value != MaskValue::Exec {
        let lm = bld.lm();
        bld.copy(Definition::exec(lm), value.operand(lm));
    }
}

fn transition_to_wqm(bld: &mut Builder<'_>, stack: &mut Vec<MaskEntry>) {
    let lm = bld.lm();
    let current = *top(stack);
    if current.kind.contains(MaskKind::WQM) {
        return;
    }
    if current.kind.contains(MaskKind::GLOBAL) {
        if current.value == MaskValue::Exec {
            let saved = bld.tmp(lm);
            bld.copy(Definition::temp(saved), Operand::exec(lm));
            top(stack).value = MaskValue::Temp(saved);
        }
        let source = top(stack).value.operand(lm);
        bld.lane_op_scc(WaveOp::Wqm, Definition::exec(lm), [source]);
        stack.push(MaskEntry::new(
            MaskValue::Exec,
            MaskKind::GLOBAL | MaskKind::WQM,
        ));
        return;
    }
    // The WholeMode mask sits right below an Exact one.
    stack.pop();
    let below = *top(stack);
    assert!(
        below.kind.contains(MaskKind::WQM) && below.value != MaskValue::Exec,
        "no saved wqm mask below an exact one: {below:?}"
    );
    restore_exec(bld, below.value);
}

fn transition_to_exact(bld: &mut Builder<'_>, stack: &mut Vec<MaskEntry>) {
    let lm = bld.lm();
    let current = *top(stack);
    if current.kind.contains(MaskKind::EXACT) {
        return;
    }
    // A loop mask stays, the stack must not shrink below the loop depth.
    if current.kind.contains(MaskKind::GLOBAL) && !current.kind.contains(MaskKind::LOOP) {
        stack.pop();
        let below = *top(stack);
        assert!(
            below.kind.contains(MaskKind::EXACT),
            "no exact mask below a global wqm one: {below:?}"
        );
        restore_exec(bld, below.value);
        return;
    }
    let exact = stack[0].value.operand(lm);
    if current.value == MaskValue::Exec {
        let saved = bld.tmp(lm);
        let scc = bld.tmp(RegClass::S1);
        bld.wave(
            WaveOp::AndSaveexec,
            [
                Definition::temp(saved),
                Definition::temp_fixed(scc, PhysReg::SCC),
                Definition::exec(lm),
            ],
            [exact, Operand::exec(lm)],
        );
        top(stack).value = MaskValue::Temp(saved);
    } else {
        bld.lane_op_scc(
            WaveOp::And,
            Definition::exec(lm),
            [exact, current.value.operand(lm)],
        );
    }
    stack.push(MaskEntry::new(MaskValue::Exec, MaskKind::EXACT));
}

fn linear_phi(bld: &mut Builder<'_>, operands: Vec<Operand>) -> Temp {
    let dst = bld.tmp(bld.lm());
    bld.emit(Opcode::PLinearPhi, [Definition::temp(dst)], operands);
    dst
}

fn mode_error(block: usize, instr: usize, opcode: Opcode, reason: &'static str) -> CompileError {
    CompileError::ModeUnsatisfiable {
        block: BlockId(block as u32),
        instr,
        opcode,
        reason,
    }
}

fn cfg_error(block: usize, reason: impl Into<String>) -> CompileError {
    CompileError::InvalidCfg {
        block: BlockId(block as u32),
        reason: reason.into(),
    }
}

// ─── Block entry ────────────────────────────────────────────────────────────

fn add_coupling_code(
    ctx: &mut ExecCtx,
    program: &mut Program,
    idx: usize,
    old: &mut VecDeque<Instruction>,
    instrs: &mut Vec<Instruction>,
) -> Result<Vec<MaskEntry>, CompileError> {
    let lm = program.lane_mask();
    let config = program.config;
    let kind = program.blocks[idx].kind;
    let preds: Vec<usize> = program.blocks[idx]
        .linear_preds
        .iter()
        .map(|b| b.index())
        .collect();
    let mut restore = false;

    // start block
    if preds.is_empty() {
        if old.front().is_some_and(|i| i.opcode == Opcode::PStartpgm)
            && let Some(startpgm) = old.pop_front()
        {
            instrs.push(startpgm);
        }
        let mut bld = Builder::new(&mut program.temps, instrs, config);
        let start = if program.stage.is_merged() {
            // merged stages do not get exec initialized by the hardware
            bld.copy(Definition::exec(lm), Operand::lane_mask_constant(true, lm));
            MaskValue::AllOnes
        } else {
            MaskValue::Exec
        };

        let mut stack;
        if ctx.handle_wqm {
            stack = vec![MaskEntry::new(start, MaskKind::GLOBAL | MaskKind::EXACT)];
            transition_to_wqm(&mut bld, &mut stack);
        } else if program.needs_wqm {
            bld.lane_op_scc(WaveOp::Wqm, Definition::exec(lm), [Operand::exec(lm)]);
            stack = vec![MaskEntry::new(start, MaskKind::GLOBAL | MaskKind::WQM)];
        } else {
            stack = vec![MaskEntry::new(start, MaskKind::GLOBAL | MaskKind::EXACT)];
        }
        return Ok(stack);
    }

    let mut stack: Vec<MaskEntry>;
    if kind.contains(BlockKind::LOOP_HEADER) {
        if preds[0] + 1 != idx {
            return Err(cfg_error(idx, "loop header does not follow its preheader"));
        }
        let Some(info) = ctx.loops.last().copied() else {
            return Err(cfg_error(idx, "loop header without a preheader"));
        };
        stack = ctx.stacks[idx - 1].clone();
        assert_eq!(stack.len(), info.num_exec_masks);

        let mut bld = Builder::new(&mut program.temps, instrs, config);
        // placeholders for the outer masks, filled in at the loop exit
        if info.has_discard && preds.len() > 1 {
            for entry in stack.iter_mut().take(info.num_exec_masks - 1) {
                let mut operands = vec![Operand::undef(lm); preds.len()];
                operands[0] = entry.value.operand(lm);
                entry.value = MaskValue::Temp(linear_phi(&mut bld, operands));
            }
        }

        top(&mut stack).kind.insert(MaskKind::LOOP);

        if info.has_divergent_continue {
            let mut operands = vec![Operand::undef(lm); preds.len()];
            operands[0] = top(&mut stack).value.operand(lm);
            let phi = linear_phi(&mut bld, operands);
            top(&mut stack).value = MaskValue::Temp(phi);
            restore = true;
            let mode = top(&mut stack).kind.mode();
            stack.push(MaskEntry::new(MaskValue::Temp(phi), mode));
        }
    } else if kind.contains(BlockKind::LOOP_EXIT) {
        let Some(info) = ctx.loops.pop() else {
            return Err(cfg_error(idx, "loop exit outside of a loop"));
        };
        for &pred in &preds {
            assert!(
                ctx.stacks[pred].len() >= info.num_exec_masks,
                "b{pred}: mask stack shallower than its loop"
            );
        }

        // fill the loop header phis
        let header = info.header.index();
        let header_preds: Vec<usize> = program.blocks[header]
            .linear_preds
            .iter()
            .map(|b| b.index())
            .collect();
        let mut phi_idx = 0;
        let fill = |phi_idx: usize, mask_idx: usize, program: &mut Program| {
            let phi = &mut program.blocks[header].instructions[phi_idx];
            assert_eq!(phi.opcode, Opcode::PLinearPhi);
            for (k, &pred) in header_preds.iter().enumerate().skip(1) {
                phi.operands[k] = ctx.stacks[pred][mask_idx].value.operand(lm);
            }
        };
        if info.has_discard && header_preds.len() > 1 {
            while phi_idx < info.num_exec_masks - 1 {
                fill(phi_idx, phi_idx, program);
                phi_idx += 1;
            }
        }
        if info.has_divergent_continue {
            fill(phi_idx, info.num_exec_masks - 1, program);
            restore = true;
        }

        // rebuild the masks, creating phis where the exits disagree
        let mut bld = Builder::new(&mut program.temps, instrs, config);
        stack = Vec::with_capacity(info.num_exec_masks);
        for mask_idx in 0..info.num_exec_masks {
            let same = ctx.stacks[preds[0]][mask_idx].value;
            let kind = ctx.stacks[header_preds[0]][mask_idx].kind;
            let trivial = preds
                .iter()
                .all(|&pred| ctx.stacks[pred][mask_idx].value == same);
            if trivial {
                stack.push(MaskEntry::new(same, kind));
            } else {
                let operands = preds
                    .iter()
                    .map(|&pred| ctx.stacks[pred][mask_idx].value.operand(lm))
                    .collect();
                let phi = linear_phi(&mut bld, operands);
                stack.push(MaskEntry::new(MaskValue::Temp(phi), kind));
            }
        }

        if info.has_divergent_break {
            // drop the loop-active mask
            stack.pop();
            restore = true;
        }
    } else if preds.len() == 1 {
        stack = ctx.stacks[preds[0]].clone();
    } else if preds.len() == 2 {
        let (a, b) = (&ctx.stacks[preds[0]], &ctx.stacks[preds[1]]);
        let mut num = a.len().min(b.len());
        if kind.contains(BlockKind::MERGE) {
            num = num.saturating_sub(1);
            restore = true;
        }
        if kind.contains(BlockKind::TOP_LEVEL) {
            num = num.min(2);
        }

        let mut bld = Builder::new(&mut program.temps, instrs, config);
        stack = Vec::with_capacity(num);
        for i in 0..num {
            let kind = a[i].kind & b[i].kind;
            if a[i].value == b[i].value {
                stack.push(MaskEntry::new(a[i].value, kind));
            } else {
                let phi = linear_phi(&mut bld, vec![a[i].value.operand(lm), b[i].value.operand(lm)]);
                stack.push(MaskEntry::new(MaskValue::Temp(phi), kind));
            }
        }
    } else {
        return Err(cfg_error(
            idx,
            format!("{} linear predecessors at a plain join", preds.len()),
        ));
    }

    if stack.is_empty() {
        return Err(cfg_error(idx, "empty mask stack at block entry"));
    }

    // the block's own phis stay at the top
    while old.front().is_some_and(|i| i.is_phi()) {
        if let Some(phi) = old.pop_front() {
            instrs.push(phi);
        }
    }

    let mut bld = Builder::new(&mut program.temps, instrs, config);
    if ctx.handle_wqm
        && kind.contains(BlockKind::TOP_LEVEL)
        && stack.len() == 2
        && old.front().is_some_and(|i| i.opcode == Opcode::PEndWqm)
    {
        old.pop_front();
        top(&mut stack).kind.insert(MaskKind::GLOBAL);
        transition_to_exact(&mut bld, &mut stack);
        ctx.handle_wqm = false;
        restore = false;
    }

    if restore {
        restore_exec(&mut bld, top(&mut stack).value);
    }
    Ok(stack)
}

// ─── Instructions ───────────────────────────────────────────────────────────

fn exit_early_if(scc: Temp) -> Instruction {
    Instruction::new(
        Opcode::PExitEarlyIf,
        [],
        [Operand::temp_fixed(scc, PhysReg::SCC)],
    )
}

fn process_instructions(
    ctx: &mut ExecCtx,
    program: &mut Program,
    idx: usize,
    old: &mut VecDeque<Instruction>,
    instrs: &mut Vec<Instruction>,
    stack: &mut Vec<MaskEntry>,
) -> Result<(), CompileError> {
    let lm = program.lane_mask();
    let config = program.config;
    let kind = program.blocks[idx].kind;
    let wqm_only = program.needs_wqm && !program.needs_exact;
    let stage = program.stage;
    let needs_wqm = program.needs_wqm;
    let mut bld = Builder::new(&mut program.temps, instrs, config);

    let mut state = if top(stack).kind.contains(MaskKind::WQM) {
        Mode::Wqm
    } else {
        Mode::Exact
    };

    let mut instr_idx = 0usize;
    while let Some(instr) = old.pop_front() {
        let here = instr_idx;
        instr_idx += 1;

        if !ctx.handle_wqm && wqm_only && needs_exact(&instr) {
            return Err(mode_error(
                idx,
                here,
                instr.opcode,
                "exact mode requested in a program that never declared needs_exact",
            ));
        }
        if instr.opcode == Opcode::ImageSample
            && stage == Stage::Fragment
            && !instr.disables_wqm()
            && !needs_wqm
        {
            return Err(mode_error(
                idx,
                here,
                instr.opcode,
                "implicit derivatives need whole quad mode",
            ));
        }

        match instr_needs(&instr, ctx.handle_wqm) {
            Mode::Wqm if state != Mode::Wqm => {
                transition_to_wqm(&mut bld, stack);
                state = Mode::Wqm;
            }
            Mode::Exact => {
                transition_to_exact(&mut bld, stack);
                state = Mode::Exact;
            }
            _ => {}
        }

        match instr.opcode {
            Opcode::PDiscardIf => {
                let mut current_exec = Operand::exec(lm);
                if old.front().is_some_and(|i| i.opcode == Opcode::PEndWqm) {
                    // transition to Exact without extra instructions
                    stack.truncate(1);
                    if !stack[0].kind.contains(MaskKind::EXACT | MaskKind::GLOBAL) {
                        return Err(mode_error(
                            idx,
                            here,
                            instr.opcode,
                            "the bottom mask is not the global exact mask",
                        ));
                    }
                    current_exec = stack[0].value.operand(lm);
                    stack[0].value = MaskValue::Exec;
                    state = Mode::Exact;
                } else if stack.len() >= 2 && ctx.handle_wqm {
                    // keep the wqm mask from being restored blindly
                    stack[1].kind.remove(MaskKind::GLOBAL);
                }

                let (cond, mut exit_cond) = match instr.operands.first().map(|op| op.value) {
                    Some(OperandValue::Constant(_)) => {
                        let saved = bld.tmp(lm);
                        let scc = bld.tmp(RegClass::S1);
                        bld.wave(
                            WaveOp::AndSaveexec,
                            [
                                Definition::temp(saved),
                                Definition::temp_fixed(scc, PhysReg::SCC),
                                Definition::exec(lm),
                            ],
                            [Operand::lane_mask_constant(false, lm), Operand::exec(lm)],
                        );
                        (Operand::temp(saved), scc)
                    }
                    Some(OperandValue::Temp(cond)) => {
                        let scc = bld.lane_op_scc(
                            WaveOp::Andn2,
                            Definition::exec(lm),
                            [current_exec, Operand::temp(cond)],
                        );
                        (Operand::temp(cond), scc)
                    }
                    _ => {
                        return Err(CompileError::NotImplemented {
                            block: BlockId(idx as u32),
                            what: format!("discard condition in {instr}"),
                        });
                    }
                };
                top(stack).value = MaskValue::Exec;

                // from inner to outer masks
                let outer = stack.len() - 1;
                for entry in stack[..outer].iter_mut().rev() {
                    let dst = bld.tmp(lm);
                    let scc = bld.tmp(RegClass::S1);
                    bld.wave(
                        WaveOp::Andn2,
                        [
                            Definition::temp(dst),
                            Definition::temp_fixed(scc, PhysReg::SCC),
                        ],
                        [entry.value.operand(lm), cond],
                    );
                    entry.value = MaskValue::Temp(dst);
                    exit_cond = scc;
                }
                bld.insert(exit_early_if(exit_cond));
            }
            Opcode::PDemoteToHelper => {
                if !stack[0].kind.contains(MaskKind::EXACT | MaskKind::GLOBAL) {
                    return Err(mode_error(
                        idx,
                        here,
                        instr.opcode,
                        "the bottom mask is not the global exact mask",
                    ));
                }

                let cond;
                let num;
                let mut exit_cond = None;
                match instr.operands.first().map(|op| op.value) {
                    Some(OperandValue::Constant(_)) => {
                        // set exec to zero, remembering who was active
                        let saved = bld.tmp(lm);
                        let scc = bld.tmp(RegClass::S1);
                        bld.wave(
                            WaveOp::AndSaveexec,
                            [
                                Definition::temp(saved),
                                Definition::temp_fixed(scc, PhysReg::SCC),
                                Definition::exec(lm),
                            ],
                            [Operand::lane_mask_constant(false, lm), Operand::exec(lm)],
                        );
                        exit_cond = Some(scc);
                        num = stack.len() as isize - 2;
                        if top(stack).kind.contains(MaskKind::EXACT) {
                            top(stack).value = MaskValue::Exec;
                        } else {
                            top(stack).value = MaskValue::Temp(saved);
                            stack.push(MaskEntry::new(MaskValue::Exec, MaskKind::EXACT));
                        }
                        cond = Operand::temp(saved);
                    }
                    Some(OperandValue::Temp(temp)) => {
                        if kind.contains(BlockKind::TOP_LEVEL)
                            && stack.len() == 2
                            && top(stack).kind.contains(MaskKind::GLOBAL)
                        {
                            // the AND-NOT below writes exec from the exact mask directly
                            stack.pop();
                        } else {
                            transition_to_exact(&mut bld, stack);
                        }
                        cond = Operand::temp(temp);
                        num = stack.len() as isize - 1;
                    }
                    _ => {
                        return Err(CompileError::NotImplemented {
                            block: BlockId(idx as u32),
                            what: format!("demote condition in {instr}"),
                        });
                    }
                }

                let innermost = stack.len() - 1;
                for i in (0..=num).rev() {
                    let i = i as usize;
                    if !stack[i].kind.contains(MaskKind::EXACT) {
                        continue;
                    }
                    let source = stack[i].value.operand(lm);
                    if i == innermost {
                        let scc =
                            bld.lane_op_scc(WaveOp::Andn2, Definition::exec(lm), [source, cond]);
                        stack[i].value = MaskValue::Exec;
                        exit_cond = Some(scc);
                    } else {
                        let dst = bld.tmp(lm);
                        let scc = bld.tmp(RegClass::S1);
                        bld.wave(
                            WaveOp::Andn2,
                            [
                                Definition::temp(dst),
                                Definition::temp_fixed(scc, PhysReg::SCC),
                            ],
                            [source, cond],
                        );
                        stack[i].value = MaskValue::Temp(dst);
                        exit_cond = Some(scc);
                    }
                }
                let Some(exit_cond) = exit_cond else {
                    return Err(mode_error(
                        idx,
                        here,
                        instr.opcode,
                        "no exact mask to demote from",
                    ));
                };
                bld.insert(exit_early_if(exit_cond));
                state = Mode::Exact;
            }
            Opcode::PIsHelper => {
                let dst = instr.definitions[0];
                if state == Mode::Exact {
                    bld.wave(WaveOp::Mov, [dst], [Operand::lane_mask_constant(false, lm)]);
                } else {
                    let exact = stack[0];
                    assert!(exact.kind.contains(MaskKind::EXACT));
                    bld.wave(
                        WaveOp::Andn2,
                        [dst, Definition::scc()],
                        [Operand::exec(lm), exact.value.operand(lm)],
                    );
                }
            }
            Opcode::PElect => {
                let dst = instr.definitions[0];
                let one = Operand::constant(1, dst.bytes());
                if top(stack).value == MaskValue::AllOnes {
                    bld.copy(dst, one);
                } else {
                    let first_lane = bld.tmp(RegClass::S1);
                    bld.wave(
                        WaveOp::Ff1,
                        [Definition::temp(first_lane)],
                        [Operand::exec(lm)],
                    );
                    bld.wave(
                        WaveOp::Lshl,
                        [dst, Definition::scc()],
                        [one, Operand::temp(first_lane)],
                    );
                }
            }
            Opcode::PEndWqm => {
                if !kind.contains(BlockKind::TOP_LEVEL) || stack.len() > 2 {
                    return Err(mode_error(
                        idx,
                        here,
                        instr.opcode,
                        "whole quad mode can only end at top level",
                    ));
                }
                if ctx.handle_wqm {
                    top(stack).kind.insert(MaskKind::GLOBAL);
                    transition_to_exact(&mut bld, stack);
                    ctx.handle_wqm = false;
                }
                state = Mode::Exact;
            }
            _ => {
                bld.insert(instr);
            }
        }
    }
    Ok(())
}

// ─── Block exit ─────────────────────────────────────────────────────────────

fn take_branch(instrs: &mut Vec<Instruction>, idx: usize) -> Result<Instruction, CompileError> {
    match instrs.pop() {
        Some(branch) if branch.opcode.is_branch() => Ok(branch),
        Some(other) => Err(cfg_error(idx, format!("block ends in {other} instead of a branch"))),
        None => Err(cfg_error(idx, "block with successors has no branch")),
    }
}

fn add_branch_code(
    ctx: &mut ExecCtx,
    program: &mut Program,
    idx: usize,
    instrs: &mut Vec<Instruction>,
    stack: &mut Vec<MaskEntry>,
) -> Result<(), CompileError> {
    let lm = program.lane_mask();
    let config = program.config;
    let block = &program.blocks[idx];
    let kind = block.kind;
    let succs = block.linear_succs.clone();
    if succs.is_empty() {
        return Ok(());
    }

    if kind.contains(BlockKind::LOOP_PREHEADER) {
        let Some(first) = program.blocks.get(idx + 1) else {
            return Err(cfg_error(idx, "loop preheader at the end of the program"));
        };
        let depth = first.loop_nest_depth;
        let mut has_divergent_break = false;
        let mut has_divergent_continue = false;
        let mut has_discard = false;
        for loop_block in program.blocks[idx + 1..]
            .iter()
            .take_while(|b| b.loop_nest_depth >= depth)
        {
            if loop_block.kind.contains(BlockKind::USES_DISCARD) {
                has_discard = true;
            }
            if loop_block.loop_nest_depth != depth || loop_block.kind.contains(BlockKind::UNIFORM) {
                continue;
            }
            if loop_block.kind.contains(BlockKind::BREAK) {
                has_divergent_break = true;
            } else if loop_block.kind.contains(BlockKind::CONTINUE) {
                has_divergent_continue = true;
            }
        }

        if has_divergent_break {
            // save the mask that is restored after the loop
            if top(stack).value == MaskValue::Exec {
                let at = instrs.len().saturating_sub(1);
                let mut bld = Builder::at(&mut program.temps, instrs, config, at);
                let saved = bld.tmp(lm);
                bld.copy(Definition::temp(saved), Operand::exec(lm));
                top(stack).value = MaskValue::Temp(saved);
            }
            let mode = top(stack).kind.mode();
            stack.push(MaskEntry::new(MaskValue::Exec, mode));
        }

        ctx.loops.push(LoopInfo {
            header: succs[0],
            num_exec_masks: stack.len(),
            has_divergent_break,
            has_divergent_continue,
            has_discard,
        });
        trace!(
            "exec_mask: b{idx} enters loop with {} masks (break {has_divergent_break}, continue {has_divergent_continue}, discard {has_discard})",
            stack.len()
        );
    }

    if kind.contains(BlockKind::CONTINUE_OR_BREAK) {
        if succs.len() != 2 {
            return Err(cfg_error(idx, "continue-or-break needs two successors"));
        }
        let branch = take_branch(instrs, idx)?;
        assert_eq!(branch.opcode, Opcode::PBranch);

        let mut popped = false;
        while !top(stack).kind.contains(MaskKind::LOOP) {
            stack.pop();
            popped = true;
            if stack.is_empty() {
                return Err(cfg_error(idx, "continue-or-break outside of a loop"));
            }
        }
        let mut bld = Builder::new(&mut program.temps, instrs, config);
        if popped {
            restore_exec(&mut bld, top(stack).value);
        }
        bld.branch(Opcode::PCbranchNz, [Operand::exec(lm)], [succs[1], succs[0]]);
        return Ok(());
    }

    if kind.contains(BlockKind::UNIFORM) {
        let Some(branch) = instrs.last_mut().filter(|i| i.opcode.is_branch()) else {
            return Err(cfg_error(idx, "uniform block with successors has no branch"));
        };
        if branch.opcode == Opcode::PBranch {
            branch.set_targets([succs[0], succs[0]]);
        } else {
            if succs.len() != 2 {
                return Err(cfg_error(idx, "conditional branch needs two successors"));
            }
            branch.set_targets([succs[1], succs[0]]);
        }
        return Ok(());
    }

    if succs.len() != 2 {
        return Err(cfg_error(
            idx,
            format!("divergent block [{kind}] needs two linear successors"),
        ));
    }

    if kind.contains(BlockKind::BRANCH) {
        let branch = take_branch(instrs, idx)?;
        let selection_remove = matches!(
            branch.data,
            InstrData::Branch {
                selection_remove: true,
                ..
            }
        );
        let Some(cond) = branch.operands.first().and_then(|op| op.temp_value()) else {
            return Err(cfg_error(idx, format!("divergent branch without a condition: {branch}")));
        };

        let mut bld = Builder::new(&mut program.temps, instrs, config);
        let current = *top(stack);
        match current.value {
            MaskValue::AllOnes => {
                bld.copy(Definition::exec(lm), Operand::temp(cond));
            }
            MaskValue::Temp(_) => {
                bld.lane_op_scc(
                    WaveOp::And,
                    Definition::exec(lm),
                    [Operand::temp(cond), Operand::exec(lm)],
                );
            }
            MaskValue::Exec => {
                let saved = bld.tmp(lm);
                let scc = bld.tmp(RegClass::S1);
                bld.wave(
                    WaveOp::AndSaveexec,
                    [
                        Definition::temp(saved),
                        Definition::temp_fixed(scc, PhysReg::SCC),
                        Definition::exec(lm),
                    ],
                    [Operand::temp(cond), Operand::exec(lm)],
                );
                top(stack).value = MaskValue::Temp(saved);
            }
        }
        stack.push(MaskEntry::new(MaskValue::Exec, current.kind.mode()));

        let new_branch = bld.branch(Opcode::PCbranchZ, [Operand::exec(lm)], [succs[1], succs[0]]);
        if let InstrData::Branch {
            selection_remove: remove,
            ..
        } = &mut new_branch.data
        {
            *remove = selection_remove;
        }
        return Ok(());
    }

    if kind.contains(BlockKind::INVERT) {
        take_branch(instrs, idx)?;
        if stack.len() < 2 {
            return Err(cfg_error(idx, "invert block without a saved mask"));
        }
        let orig = stack[stack.len() - 2].value.operand(lm);
        let mut bld = Builder::new(&mut program.temps, instrs, config);
        bld.lane_op_scc(
            WaveOp::Andn2,
            Definition::exec(lm),
            [orig, Operand::exec(lm)],
        );
        top(stack).value = MaskValue::Exec;
        bld.branch(Opcode::PCbranchZ, [Operand::exec(lm)], [succs[1], succs[0]]);
        return Ok(());
    }

    let is_break = kind.contains(BlockKind::BREAK);
    if is_break || kind.contains(BlockKind::CONTINUE) {
        take_branch(instrs, idx)?;
        let next = program.blocks[succs[1].index()]
            .linear_succs
            .first()
            .map(|b| program.blocks[b.index()].kind);

        let mut bld = Builder::new(&mut program.temps, instrs, config);
        let mut cond = None;
        for i in (0..stack.len().saturating_sub(1)).rev() {
            if !is_break && stack[i].kind.contains(MaskKind::LOOP) {
                break;
            }
            let dst = bld.tmp(lm);
            let scc = bld.tmp(RegClass::S1);
            bld.wave(
                WaveOp::Andn2,
                [
                    Definition::temp(dst),
                    Definition::temp_fixed(scc, PhysReg::SCC),
                ],
                [stack[i].value.operand(lm), Operand::exec(lm)],
            );
            stack[i].value = MaskValue::Temp(dst);
            cond = Some(scc);
            if stack[i].kind.contains(MaskKind::LOOP) {
                break;
            }
        }
        let Some(cond) = cond else {
            return Err(cfg_error(idx, "loop jump without an enclosing loop mask"));
        };

        // the lanes must not leak into a block that does not restore exec
        if !next.is_some_and(|k| k.contains(BlockKind::INVERT) || k.contains(BlockKind::MERGE)) {
            bld.copy(Definition::exec(lm), Operand::lane_mask_constant(false, lm));
            top(stack).value = MaskValue::Exec;
        }
        bld.branch(
            Opcode::PCbranchNz,
            [Operand::temp_fixed(cond, PhysReg::SCC)],
            [succs[1], succs[0]],
        );
        return Ok(());
    }

    Err(cfg_error(
        idx,
        format!("block kind [{kind}] does not say how to leave it"),
    ))
}

// ─── Driver ─────────────────────────────────────────────────────────────────

/// Materialize execution-mask code for the whole program.
///
/// Afterwards `exec` is explicit: divergent branches save and restore it,
/// loops keep their active-lane masks in linear phis, and the discard,
/// demote, elect, is-helper and end-wqm pseudo-ops are gone.
pub fn insert_exec_mask(program: &mut Program) -> Result<ExecMaskTrace, CompileError> {
    let num_blocks = program.blocks.len();
    let mut ctx = ExecCtx {
        stacks: vec![Vec::new(); num_blocks],
        loops: Vec::new(),
        handle_wqm: program.needs_wqm && program.needs_exact,
        trace: ExecMaskTrace {
            blocks: vec![BlockTrace::default(); num_blocks],
        },
    };

    for idx in 0..num_blocks {
        let mut old: VecDeque<Instruction> =
            std::mem::take(&mut program.blocks[idx].instructions).into();
        let mut instrs = Vec::with_capacity(old.len() + 4);

        let mut stack = add_coupling_code(&mut ctx, program, idx, &mut old, &mut instrs)?;
        let entry_depth = stack.len();
        let loop_depth = ctx.loops.last().map_or(0, |l| l.num_exec_masks);
        assert!(
            entry_depth >= loop_depth,
            "b{idx}: mask stack depth {entry_depth} below loop depth {loop_depth}"
        );

        process_instructions(&mut ctx, program, idx, &mut old, &mut instrs, &mut stack)?;
        add_branch_code(&mut ctx, program, idx, &mut instrs, &mut stack)?;

        trace!("exec_mask: b{idx} stack {stack:?}");
        ctx.trace.blocks[idx] = BlockTrace {
            entry_depth,
            exit_depth: stack.len(),
            loop_depth,
        };
        program.blocks[idx].instructions = instrs;
        ctx.stacks[idx] = stack;
    }

    if !ctx.loops.is_empty() {
        return Err(cfg_error(
            num_blocks.saturating_sub(1),
            "loop without an exit block",
        ));
    }
    debug!("exec_mask: done, {} instructions", program.num_instructions());
    Ok(ctx.trace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg_builder::ShaderBuilder;
    use crate::config::{GfxLevel, TargetConfig};

    fn count(program: &Program, opcode: Opcode) -> usize {
        program
            .blocks
            .iter()
            .flat_map(|b| &b.instructions)
            .filter(|i| i.opcode == opcode)
            .count()
    }

    #[test]
    fn straight_line_compute_needs_no_mask_code() {
        let mut sb = ShaderBuilder::new(TargetConfig::default(), Stage::Compute);
        let v = sb.vgpr();
        sb.emit(Opcode::VMovB32, [Definition::temp(v)], [Operand::c32(1)]);
        let mut program = sb.finish();
        let before = program.num_instructions();
        let trace = insert_exec_mask(&mut program).unwrap();
        assert_eq!(program.num_instructions(), before);
        assert_eq!(trace.blocks[0].entry_depth, 1);
    }

    #[test]
    fn wqm_entry_saves_exact_mask() {
        let mut sb = ShaderBuilder::new(TargetConfig::default(), Stage::Fragment);
        sb.set_needs(true, true);
        let v = sb.vgpr();
        sb.emit(Opcode::VMovB32, [Definition::temp(v)], [Operand::c32(1)]);
        let mut program = sb.finish();
        insert_exec_mask(&mut program).unwrap();

        let entry = &program.blocks[0].instructions;
        assert_eq!(entry[0].opcode, Opcode::PStartpgm);
        assert_eq!(entry[1].opcode, Opcode::PParallelcopy);
        assert_eq!(entry[2].opcode, Opcode::SWqmB64);
        assert!(entry[2].definitions[0].is_fixed_to(PhysReg::EXEC));
    }

    #[test]
    fn elect_with_unknown_exec_uses_ff1() {
        let mut sb = ShaderBuilder::new(TargetConfig::new(GfxLevel::Gfx10, 32), Stage::Compute);
        let lane = sb.tmp(RegClass::S1);
        sb.emit(Opcode::PElect, [Definition::temp(lane)], []);
        let mut program = sb.finish();
        insert_exec_mask(&mut program).unwrap();
        assert_eq!(count(&program, Opcode::PElect), 0);
        assert_eq!(count(&program, Opcode::SFf1I32B32), 1);
        assert_eq!(count(&program, Opcode::SLshlB32), 1);
    }

    #[test]
    fn elect_in_merged_shader_is_constant() {
        let mut sb = ShaderBuilder::new(TargetConfig::default(), Stage::VertexGeometry);
        let lane = sb.tmp(RegClass::S2);
        sb.emit(Opcode::PElect, [Definition::temp(lane)], []);
        let mut program = sb.finish();
        insert_exec_mask(&mut program).unwrap();
        assert_eq!(count(&program, Opcode::SFf1I32B64), 0);
        let copy = program.blocks[0]
            .instructions
            .iter()
            .find(|i| i.definitions.first().and_then(|d| d.temp) == Some(lane))
            .unwrap();
        assert_eq!(copy.opcode, Opcode::PParallelcopy);
        assert!(copy.operands[0].constant_equals(1));
    }

    #[test]
    fn is_helper_in_exact_mode_is_zero() {
        let mut sb = ShaderBuilder::new(TargetConfig::default(), Stage::Fragment);
        let helper = sb.tmp(RegClass::S2);
        sb.emit(Opcode::PIsHelper, [Definition::temp(helper)], []);
        let mut program = sb.finish();
        insert_exec_mask(&mut program).unwrap();
        let mov = program.blocks[0]
            .instructions
            .iter()
            .find(|i| i.opcode == Opcode::SMovB64)
            .unwrap();
        assert!(mov.operands[0].constant_equals(0));
    }

    #[test]
    fn end_wqm_inside_control_flow_is_rejected() {
        let mut sb = ShaderBuilder::new(TargetConfig::default(), Stage::Fragment);
        sb.set_needs(true, true);
        let cond = sb.divergent_condition();
        sb.begin_divergent_if(cond);
        sb.emit(Opcode::PEndWqm, [], []);
        sb.begin_else();
        sb.end_divergent_if();
        let mut program = sb.finish();
        let err = insert_exec_mask(&mut program).unwrap_err();
        assert!(
            matches!(
                err,
                CompileError::ModeUnsatisfiable {
                    opcode: Opcode::PEndWqm,
                    ..
                }
            ),
            "{err}"
        );
    }

    #[test]
    fn exact_request_in_wqm_only_program_is_rejected() {
        let mut sb = ShaderBuilder::new(TargetConfig::default(), Stage::Fragment);
        sb.set_needs(true, false);
        let v = sb.vgpr();
        sb.emit(Opcode::VMovB32, [Definition::temp(v)], [Operand::c32(0)]);
        sb.export_null();
        let mut program = sb.finish();
        let err = insert_exec_mask(&mut program).unwrap_err();
        assert!(matches!(err, CompileError::ModeUnsatisfiable { opcode: Opcode::Exp, .. }));
    }

    #[test]
    fn demote_removes_lanes_from_exact_masks() {
        let mut sb = ShaderBuilder::new(TargetConfig::default(), Stage::Fragment);
        sb.set_needs(true, true);
        let cond = sb.divergent_condition();
        sb.demote_if(cond);
        sb.export_null();
        let mut program = sb.finish();
        insert_exec_mask(&mut program).unwrap();

        assert_eq!(count(&program, Opcode::PDemoteToHelper), 0);
        assert_eq!(count(&program, Opcode::PExitEarlyIf), 1);
        let exit = program.blocks[0]
            .instructions
            .iter()
            .position(|i| i.opcode == Opcode::PExitEarlyIf)
            .unwrap();
        let andn2 = &program.blocks[0].instructions[exit - 1];
        assert_eq!(andn2.opcode, Opcode::SAndn2B64);
        assert!(andn2.definitions[0].is_fixed_to(PhysReg::EXEC));
        assert_eq!(andn2.operands[1].temp_value(), Some(cond));
    }
}
