//! Liveness and register-demand analysis.
//!
//! Backward dataflow over the linear and logical CFGs. SGPRs and linear
//! VGPRs are live along linear edges; ordinary VGPRs only along logical
//! edges, because a divergent arm writes its VGPRs in its own lanes only.
//!
//! Besides live-out sets the pass sets the kill flags on every operand and
//! definition and records per-instruction register demand.

use std::collections::BTreeMap;

use log::{debug, trace};

use crate::error::CompileError;
use crate::ir::{
    Format, Instruction, Opcode, OperandValue, PhysReg, Program, RegType, RegisterDemand,
};

// ─── IdSet ──────────────────────────────────────────────────────────────────

/// Sparse set of temp ids, stored as 64-bit words keyed by word index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdSet {
    words: BTreeMap<u32, u64>,
    len: usize,
}

impl IdSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `id` was not present.
    pub fn insert(&mut self, id: u32) -> bool {
        let word = self.words.entry(id / 64).or_insert(0);
        let bit = 1u64 << (id % 64);
        if *word & bit != 0 {
            return false;
        }
        *word |= bit;
        self.len += 1;
        true
    }

    /// Returns `true` if `id` was present.
    pub fn remove(&mut self, id: u32) -> bool {
        let Some(word) = self.words.get_mut(&(id / 64)) else {
            return false;
        };
        let bit = 1u64 << (id % 64);
        if *word & bit == 0 {
            return false;
        }
        *word &= !bit;
        if *word == 0 {
            self.words.remove(&(id / 64));
        }
        self.len -= 1;
        true
    }

    pub fn contains(&self, id: u32) -> bool {
        self.words
            .get(&(id / 64))
            .is_some_and(|word| word & (1u64 << (id % 64)) != 0)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().flat_map(|(&index, &word)| {
            (0..64u32)
                .filter(move |bit| word & (1u64 << bit) != 0)
                .map(move |bit| index * 64 + bit)
        })
    }

    /// Union `other` into `self`; returns `true` if anything was added.
    pub fn insert_all(&mut self, other: &IdSet) -> bool {
        let mut changed = false;
        for (&index, &bits) in &other.words {
            let word = self.words.entry(index).or_insert(0);
            let added = bits & !*word;
            if added != 0 {
                *word |= added;
                self.len += added.count_ones() as usize;
                changed = true;
            }
        }
        changed
    }
}

// ─── Results ────────────────────────────────────────────────────────────────

/// Per-block liveness information.
#[derive(Debug, Clone, Default)]
pub struct Liveness {
    pub live_out: Vec<IdSet>,
    pub live_in: Vec<IdSet>,
    /// Per instruction: values live across it plus its definitions and
    /// late-kill operands.
    pub demand_at: Vec<Vec<RegisterDemand>>,
    /// Per instruction: demand immediately before it executes.
    pub demand_before: Vec<Vec<RegisterDemand>>,
}

fn instr_needs_vcc(instr: &Instruction) -> bool {
    if instr.format() == Format::Vopc {
        return true;
    }
    instr.operands.iter().any(|op| op.is_fixed_to(PhysReg::VCC))
        || instr.definitions.iter().any(|def| def.is_fixed_to(PhysReg::VCC))
}

struct State<'a> {
    program: &'a mut Program,
    result: Liveness,
    /// SGPR phi operands whose copies land at each predecessor's logical end.
    phi_sgpr_ops: Vec<i16>,
    worklist: usize,
}

impl State<'_> {
    fn mark_live_out(&mut self, pred: usize, id: u32) -> bool {
        let inserted = self.result.live_out[pred].insert(id);
        if inserted {
            self.worklist = self.worklist.max(pred + 1);
        }
        inserted
    }

    fn process_block(&mut self, block_idx: usize) {
        let mut live = self.result.live_out[block_idx].clone();
        let count = self.program.blocks[block_idx].instructions.len();
        let mut demand_at = vec![RegisterDemand::default(); count];
        let mut demand_before = vec![RegisterDemand::default(); count];
        let mut needs_vcc = false;

        let mut new_demand = RegisterDemand::default();
        for id in live.iter() {
            new_demand += self.program.temps.get(id);
        }
        new_demand.sgpr -= self.phi_sgpr_ops[block_idx];
        let mut block_demand = RegisterDemand::default();

        let block = &mut self.program.blocks[block_idx];
        let mut idx = count;
        while idx > 0 {
            let instr = &mut block.instructions[idx - 1];
            if instr.is_phi() {
                break;
            }
            idx -= 1;
            needs_vcc |= instr_needs_vcc(instr);
            demand_at[idx] = new_demand;

            // kill
            for def in instr.definitions.iter_mut() {
                let Some(temp) = def.temp else {
                    continue;
                };
                if live.remove(temp.id()) {
                    new_demand -= temp;
                    def.kill = false;
                } else {
                    demand_at[idx] += temp;
                    def.kill = true;
                }
            }

            // gen
            if instr.opcode == Opcode::PLogicalEnd {
                new_demand.sgpr += self.phi_sgpr_ops[block_idx];
            } else {
                for op in instr.operands.iter_mut() {
                    op.kill = false;
                    op.first_kill = false;
                }
                for i in 0..instr.operands.len() {
                    let OperandValue::Temp(temp) = instr.operands[i].value else {
                        continue;
                    };
                    if !live.insert(temp.id()) {
                        continue;
                    }
                    instr.operands[i].kill = true;
                    instr.operands[i].first_kill = true;
                    for later in instr.operands[i + 1..].iter_mut() {
                        if later.temp_id() == Some(temp.id()) {
                            later.kill = true;
                            later.first_kill = false;
                        }
                    }
                    if instr.operands[i].late_kill {
                        demand_at[idx] += temp;
                    }
                    new_demand += temp;
                }
            }

            demand_before[idx] = new_demand;
            if let Some((def_idx, op_idx)) = instr.opcode.tied_operand()
                && let Some(op) = instr.operands.get(op_idx)
                && op.is_temp()
                && !op.kill
                && instr.definitions.get(def_idx).is_some_and(|d| d.temp.is_some())
            {
                demand_before[idx] += RegisterDemand::of_class(op.rc);
            }
            block_demand.update(demand_at[idx]);
            block_demand.update(demand_before[idx]);
        }
        block_demand.update(new_demand);
        block.register_demand = block_demand;

        // phi definitions
        let num_phis = idx;
        for phi_idx in (0..num_phis).rev() {
            demand_at[phi_idx] = new_demand;
            demand_before[phi_idx] = new_demand;
            let instr = &mut block.instructions[phi_idx];
            needs_vcc |= instr_needs_vcc(instr);
            for def in instr.definitions.iter_mut() {
                if let Some(temp) = def.temp {
                    def.kill = !live.remove(temp.id());
                }
            }
        }

        // live-ins flow into the predecessors' live-outs
        let logical_preds: Vec<usize> = block.logical_preds.iter().map(|b| b.index()).collect();
        let linear_preds: Vec<usize> = block.linear_preds.iter().map(|b| b.index()).collect();
        let fast_merge = logical_preds.is_empty() || logical_preds == linear_preds;
        let live_ids: Vec<u32> = live.iter().collect();
        for &id in &live_ids {
            let preds = if fast_merge || self.program.temps.rc(id).is_linear() {
                &linear_preds
            } else {
                &logical_preds
            };
            for &pred in preds {
                self.mark_live_out(pred, id);
            }
        }

        // phi operands go straight into the matching predecessor
        for phi_idx in 0..num_phis {
            let block = &self.program.blocks[block_idx];
            let instr = &block.instructions[phi_idx];
            let preds = if instr.opcode == Opcode::PPhi {
                &logical_preds
            } else {
                &linear_preds
            };
            let is_logical = instr.opcode == Opcode::PPhi;
            let mut updates = Vec::new();
            for (i, op) in instr.operands.iter().enumerate() {
                let Some(temp) = op.temp_value() else {
                    continue;
                };
                let Some(&pred) = preds.get(i) else {
                    continue;
                };
                updates.push((i, pred, temp));
            }
            for (i, pred, temp) in updates {
                if self.mark_live_out(pred, temp.id()) && is_logical && temp.ty() == RegType::Sgpr {
                    self.phi_sgpr_ops[pred] += temp.size() as i16;
                }
                let op = &mut self.program.blocks[block_idx].instructions[phi_idx].operands[i];
                op.kill = !live.contains(temp.id());
                op.first_kill = op.kill;
            }
        }

        self.program.needs_vcc |= needs_vcc;
        trace!(
            "liveness: b{block_idx} live-in {:?} demand {}",
            live_ids,
            self.program.blocks[block_idx].register_demand
        );
        self.result.live_in[block_idx] = live;
        self.result.demand_at[block_idx] = demand_at;
        self.result.demand_before[block_idx] = demand_before;
    }
}

/// Waves per SIMD that fit the given demand; 0 when it exceeds the register file.
pub fn compute_num_waves(program: &Program, demand: RegisterDemand) -> u16 {
    let config = &program.config;
    if demand.sgpr < 0
        || demand.vgpr < 0
        || demand.sgpr as u16 > config.sgpr_limit()
        || demand.vgpr as u16 > config.vgpr_limit()
    {
        return 0;
    }
    let sgprs = demand.sgpr as u16 + config.extra_sgprs(program.needs_vcc);
    let granule = config.sgpr_alloc_granule();
    let sgpr_alloc = sgprs.max(granule).div_ceil(granule) * granule;
    let granule = config.vgpr_alloc_granule();
    let vgpr_alloc = (demand.vgpr as u16).max(granule).div_ceil(granule) * granule;

    let sgpr_waves = config.physical_sgprs() / sgpr_alloc;
    let vgpr_waves = config.physical_vgprs() / vgpr_alloc;
    sgpr_waves.min(vgpr_waves).min(config.max_waves_per_simd())
}

/// Compute live-out sets, kill flags and register demand.
///
/// Also updates `needs_vcc`, each block's demand, the program's maximum
/// demand and its occupancy. A temp that is live into the entry block is
/// reported as [`CompileError::UseBeforeDef`].
pub fn live_var_analysis(program: &mut Program) -> Result<Liveness, CompileError> {
    let num_blocks = program.blocks.len();
    program.needs_vcc = false;
    let mut state = State {
        program,
        result: Liveness {
            live_out: vec![IdSet::new(); num_blocks],
            live_in: vec![IdSet::new(); num_blocks],
            demand_at: vec![Vec::new(); num_blocks],
            demand_before: vec![Vec::new(); num_blocks],
        },
        phi_sgpr_ops: vec![0; num_blocks],
        worklist: num_blocks,
    };

    while state.worklist > 0 {
        state.worklist -= 1;
        let block_idx = state.worklist;
        state.process_block(block_idx);
    }

    let State {
        program, result, ..
    } = state;

    if let Some(entry) = result.live_in.first()
        && !entry.is_empty()
    {
        return Err(CompileError::UseBeforeDef {
            temps: entry.iter().collect(),
        });
    }

    let mut max_demand = RegisterDemand::default();
    for block in &program.blocks {
        max_demand.update(block.register_demand);
    }
    program.max_reg_demand = max_demand;
    program.num_waves = compute_num_waves(program, max_demand);
    debug!(
        "liveness: max demand {} -> {} waves",
        program.max_reg_demand, program.num_waves
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GfxLevel, TargetConfig};
    use crate::ir::{BlockKind, Definition, Operand, RegClass, Stage, Temp};

    fn straight_line() -> (Program, Vec<Temp>) {
        let mut program = Program::new(TargetConfig::default(), Stage::Compute);
        let b0 = program.create_and_insert_block();
        program.block_mut(b0).kind = BlockKind::TOP_LEVEL;
        let a = program.allocate_tmp(RegClass::V1);
        let b = program.allocate_tmp(RegClass::V1);
        let c = program.allocate_tmp(RegClass::V1);
        let s = program.allocate_tmp(RegClass::S1);
        let instrs = vec![
            Instruction::new(Opcode::PStartpgm, [Definition::temp(s)], []),
            Instruction::new(Opcode::VMovB32, [Definition::temp(a)], [Operand::c32(1)]),
            Instruction::new(
                Opcode::VMovB32,
                [Definition::temp(b)],
                [Operand::temp(s)],
            ),
            Instruction::new(
                Opcode::VAddF32,
                [Definition::temp(c)],
                [Operand::temp(a), Operand::temp(a)],
            ),
            Instruction::new(
                Opcode::BufferStoreDword,
                [],
                [Operand::temp(c), Operand::temp(b)],
            ),
            Instruction::new(Opcode::SEndpgm, [], []),
        ];
        program.block_mut(b0).instructions = instrs;
        (program, vec![a, b, c, s])
    }

    #[test]
    fn id_set_basics() {
        let mut set = IdSet::new();
        assert!(set.insert(3));
        assert!(set.insert(130));
        assert!(!set.insert(3));
        assert_eq!(set.len(), 2);
        assert!(set.contains(130));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![3, 130]);
        assert!(set.remove(3));
        assert!(!set.remove(3));

        let mut other = IdSet::new();
        other.insert(130);
        other.insert(7);
        assert!(set.insert_all(&other));
        assert!(!set.insert_all(&other));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![7, 130]);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn duplicate_operands_get_one_first_kill() {
        let (mut program, _) = straight_line();
        live_var_analysis(&mut program).unwrap();
        let add = &program.blocks[0].instructions[3];
        assert!(add.operands[0].first_kill, "{add}");
        assert!(add.operands[0].kill);
        assert!(!add.operands[1].first_kill, "{add}");
        assert!(add.operands[1].kill);
    }

    #[test]
    fn demand_is_exactly_the_live_set() {
        let (mut program, temps) = straight_line();
        let liveness = live_var_analysis(&mut program).unwrap();
        let block = &program.blocks[0];

        let mut ranges = Vec::new();
        for &temp in &temps {
            let def = block
                .instructions
                .iter()
                .position(|i| i.definitions.iter().any(|d| d.temp == Some(temp)))
                .unwrap();
            let last_use = block
                .instructions
                .iter()
                .rposition(|i| i.operands.iter().any(|o| o.temp_value() == Some(temp)))
                .unwrap();
            assert!(block.instructions[last_use]
                .operands
                .iter()
                .any(|o| o.temp_value() == Some(temp) && o.kill));
            ranges.push((temp, def, last_use));
        }

        // after an instruction: defined at or before it, read after it;
        // before it: defined earlier, read by it or later
        for idx in 0..block.instructions.len() {
            let mut after = RegisterDemand::default();
            let mut before = RegisterDemand::default();
            for &(temp, def, last_use) in &ranges {
                if def <= idx && idx < last_use {
                    after += temp;
                }
                if def < idx && idx <= last_use {
                    before += temp;
                }
            }
            assert_eq!(liveness.demand_at[0][idx], after, "after {idx}");
            assert_eq!(liveness.demand_before[0][idx], before, "before {idx}");
        }

        let d = RegisterDemand::new;
        // a drops out at the add that kills it, s at the move that reads it
        assert_eq!(
            liveness.demand_at[0],
            vec![d(1, 0), d(1, 1), d(0, 2), d(0, 2), d(0, 0), d(0, 0)]
        );
        assert_eq!(
            liveness.demand_before[0],
            vec![d(0, 0), d(1, 0), d(1, 1), d(0, 2), d(0, 2), d(0, 0)]
        );
        assert_eq!(program.max_reg_demand, RegisterDemand::new(1, 2));
    }

    #[test]
    fn use_before_def_is_reported() {
        let mut program = Program::new(TargetConfig::default(), Stage::Compute);
        let b0 = program.create_and_insert_block();
        let ghost = program.allocate_tmp(RegClass::S1);
        program.block_mut(b0).instructions = vec![Instruction::new(
            Opcode::SMovB32,
            [Definition::fixed(PhysReg::M0, RegClass::S1)],
            [Operand::temp(ghost)],
        )];
        let err = live_var_analysis(&mut program).unwrap_err();
        assert_eq!(err, CompileError::UseBeforeDef { temps: vec![ghost.id()] });
    }

    #[test]
    fn tied_definition_counts_both_values() {
        let mut program = Program::new(TargetConfig::default(), Stage::Compute);
        let b0 = program.create_and_insert_block();
        let a = program.allocate_tmp(RegClass::V1);
        let acc = program.allocate_tmp(RegClass::V1);
        let d = program.allocate_tmp(RegClass::V1);
        program.block_mut(b0).instructions = vec![
            Instruction::new(Opcode::VMovB32, [Definition::temp(a)], [Operand::c32(0)]),
            Instruction::new(Opcode::VMovB32, [Definition::temp(acc)], [Operand::c32(0)]),
            Instruction::new(
                Opcode::VMacF32,
                [Definition::temp(d)],
                [Operand::temp(a), Operand::temp(a), Operand::temp(acc)],
            ),
            Instruction::new(
                Opcode::BufferStoreDword,
                [],
                [Operand::temp(d), Operand::temp(acc)],
            ),
        ];
        let liveness = live_var_analysis(&mut program).unwrap();
        // a and acc live in, plus the tied copy of acc.
        assert_eq!(liveness.demand_before[0][2], RegisterDemand::new(0, 3));
    }

    #[test]
    fn vcc_use_and_occupancy() {
        let mut program = Program::new(TargetConfig::new(GfxLevel::Gfx9, 64), Stage::Compute);
        let b0 = program.create_and_insert_block();
        let v = program.allocate_tmp(RegClass::V1);
        let cmp = program.allocate_tmp(RegClass::S2);
        program.block_mut(b0).instructions = vec![
            Instruction::new(Opcode::VMovB32, [Definition::temp(v)], [Operand::c32(0)]),
            Instruction::new(
                Opcode::VCmpLtF32,
                [Definition::temp_fixed(cmp, PhysReg::VCC)],
                [Operand::c32(0), Operand::temp(v)],
            ),
        ];
        live_var_analysis(&mut program).unwrap();
        assert!(program.needs_vcc);
        // 2 sgprs + 2 for vcc -> 16-granule: 800 / 16 = 50, capped at 10.
        assert_eq!(program.num_waves, 10);
        assert_eq!(
            compute_num_waves(&program, RegisterDemand::new(0, 300)),
            0,
            "over the vgpr limit is reported as zero occupancy"
        );
    }
}
