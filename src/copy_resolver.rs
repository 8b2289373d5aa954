//! Sequentialization of parallel copies between physical registers.
//!
//! A parallel copy is a set of byte ranges moved "at once". The resolver
//! first emits every copy whose destination no other entry still reads
//! (the paths of the location transfer graph), then breaks the remaining
//! cycles with swaps. Entries are keyed by destination in a [`BTreeMap`],
//! so the emitted sequence only depends on the copy set.

use std::collections::BTreeMap;
use std::ops::Bound;

use log::trace;

use crate::builder::WaveOp;
use crate::config::{GfxLevel, TargetConfig};
use crate::error::CompileError;
use crate::ir::{
    BlockId, Definition, InstrData, Instruction, Opcode, Operand, OperandValue, PhysReg, RegClass,
    RegType, SdwaSel,
};

// ─── Copy entries ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopySource {
    Reg(PhysReg),
    Constant(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyOperation {
    pub src: CopySource,
    pub def: PhysReg,
    pub bytes: u32,
    /// The destination is a linear VGPR and must be written in inactive lanes too.
    pub linear_vgpr: bool,
    /// Pending readers of each destination byte.
    pub uses: [u8; 8],
}

/// Pending copies keyed by destination.
pub type CopyMap = BTreeMap<PhysReg, CopyOperation>;

impl CopyOperation {
    pub fn new(def: PhysReg, src: CopySource, bytes: u32) -> Self {
        let src = match src {
            CopySource::Constant(value) => CopySource::Constant(value & byte_mask(bytes)),
            reg => reg,
        };
        Self {
            src,
            def,
            bytes,
            linear_vgpr: false,
            uses: [0; 8],
        }
    }

    pub fn linear(mut self) -> Self {
        self.linear_vgpr = true;
        self
    }

    /// The entry for one definition/operand pair of a copy-lowering site.
    ///
    /// Undefined operands produce no entry.
    pub fn from_pair(
        def: &Definition,
        op: &Operand,
        block: BlockId,
        instr: usize,
    ) -> Result<Option<Self>, CompileError> {
        let Some(def_reg) = def.reg else {
            return Err(CompileError::MissingPhysReg { block, instr });
        };
        let src = match op.value {
            OperandValue::Undef => return Ok(None),
            OperandValue::Constant(value) => CopySource::Constant(value),
            OperandValue::Temp(_) | OperandValue::Fixed => match op.reg {
                Some(reg) => CopySource::Reg(reg),
                None => return Err(CompileError::MissingPhysReg { block, instr }),
            },
        };
        let copy = Self::new(def_reg, src, def.bytes());
        Ok(Some(if def.rc.is_linear_vgpr() {
            copy.linear()
        } else {
            copy
        }))
    }

    fn is_used(&self) -> u64 {
        u64::from_le_bytes(self.uses)
    }

    fn is_constant(&self) -> bool {
        matches!(self.src, CopySource::Constant(_))
    }

    fn release(&mut self, byte: u32) {
        let uses = &mut self.uses[byte as usize];
        assert!(*uses > 0, "{}: reader count of byte {byte} underflows", self.def);
        *uses -= 1;
    }
}

/// Where a parallel copy is lowered and what the allocator left for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopySite {
    pub block: BlockId,
    pub scratch_sgpr: Option<PhysReg>,
    /// SCC holds a live value that the copies must not clobber.
    pub tmp_in_scc: bool,
}

impl CopySite {
    pub fn new(block: BlockId) -> Self {
        Self {
            block,
            scratch_sgpr: None,
            tmp_in_scc: false,
        }
    }

    pub fn for_instruction(block: BlockId, instr: &Instruction) -> Self {
        let (scratch_sgpr, tmp_in_scc) = instr.copy_scratch();
        Self {
            block,
            scratch_sgpr,
            tmp_in_scc,
        }
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn byte_mask(bytes: u32) -> u64 {
    if bytes >= 8 {
        u64::MAX
    } else {
        (1u64 << (bytes * 8)) - 1
    }
}

fn bit_range(start: i32, count: i32) -> u32 {
    (((1u64 << count) - 1) << start) as u32
}

fn bank(reg: PhysReg) -> RegType {
    if reg.is_vgpr() {
        RegType::Vgpr
    } else {
        RegType::Sgpr
    }
}

fn class(reg: PhysReg, bytes: u32, linear_vgpr: bool) -> RegClass {
    let rc = RegClass::new(bank(reg), bytes as u8);
    if linear_vgpr { rc.as_linear() } else { rc }
}

fn reg_operand(reg: PhysReg, bytes: u32) -> Operand {
    Operand::fixed(reg, class(reg, bytes, false))
}

fn first_key(map: &CopyMap) -> Option<PhysReg> {
    map.keys().next().copied()
}

fn key_after(map: &CopyMap, key: PhysReg) -> Option<PhysReg> {
    map.range((Bound::Excluded(key), Bound::Unbounded))
        .next()
        .map(|(k, _)| *k)
}

/// Bytes of `[a_start, a_start + a_size)` that `[b_start, b_start + b_size)` covers.
fn intersection_mask(a_start: u16, a_size: u32, b_start: u16, b_size: u32) -> u32 {
    let (a_start, a_size) = (a_start as i32, a_size as i32);
    let (b_start, b_size) = (b_start as i32, b_size as i32);
    let start = (b_start - a_start).max(0);
    let end = (b_start + b_size - a_start).max(0);
    if start >= a_size || end == 0 {
        return 0;
    }
    bit_range(start, end - start) & bit_range(0, a_size)
}

fn is_inline_u32(value: u32) -> bool {
    value <= 64
        || value >= 0xffff_fff0
        || matches!(
            value,
            0x3f00_0000
                | 0xbf00_0000
                | 0x3f80_0000
                | 0xbf80_0000
                | 0x4000_0000
                | 0xc000_0000
                | 0x4080_0000
                | 0xc080_0000
                | 0x3e22_f983
        )
}

fn is_inline_u64(value: u64) -> bool {
    value <= 64
        || value >= (-16i64) as u64
        || matches!(
            value,
            0x3fe0_0000_0000_0000
                | 0xbfe0_0000_0000_0000
                | 0x3ff0_0000_0000_0000
                | 0xbff0_0000_0000_0000
                | 0x4000_0000_0000_0000
                | 0xc000_0000_0000_0000
                | 0x4010_0000_0000_0000
                | 0xc010_0000_0000_0000
                | 0x3fc4_5f30_6dc9_c882
        )
}

fn is_inline_u16(value: u16) -> bool {
    value <= 64
        || value >= 0xfff0
        || matches!(
            value,
            0x3800 | 0xb800 | 0x3c00 | 0xbc00 | 0x4000 | 0xc000 | 0x4400 | 0xc400 | 0x3118
        )
}

fn is_literal_half(src: CopySource) -> bool {
    match src {
        CopySource::Constant(value) => !is_inline_u16(value as u16),
        CopySource::Reg(_) => false,
    }
}

/// Whether an 8-byte constant fits a 64-bit move.
fn constant_representable(value: u64, bytes: u32, sign_extend: bool) -> bool {
    if bytes <= 4 || value >> 32 == 0 {
        return true;
    }
    let upper33 = value & 0xffff_ffff_8000_0000;
    (sign_extend && upper33 == 0xffff_ffff_8000_0000) || is_inline_u64(value)
}

fn sdwa_sel(op: &Operand) -> SdwaSel {
    match (op.value, op.reg) {
        (OperandValue::Constant(_), _) | (_, None) => SdwaSel::DWORD,
        (_, Some(reg)) => SdwaSel::new(reg.byte(), op.bytes()),
    }
}

/// A power-of-two slice of a copy.
#[derive(Debug, Clone, Copy)]
struct Piece {
    def: PhysReg,
    src: CopySource,
    bytes: u32,
}

// ─── Emission ───────────────────────────────────────────────────────────────

struct Emitter<'a> {
    config: TargetConfig,
    site: CopySite,
    out: &'a mut Vec<Instruction>,
}

impl Emitter<'_> {
    fn emit(
        &mut self,
        opcode: Opcode,
        definitions: impl IntoIterator<Item = Definition>,
        operands: impl IntoIterator<Item = Operand>,
    ) -> &mut Instruction {
        self.out.push(Instruction::new(opcode, definitions, operands));
        let last = self.out.len() - 1;
        &mut self.out[last]
    }

    fn emit_sdwa(&mut self, opcode: Opcode, def: Definition, operands: &[Operand]) {
        let dst_sel = SdwaSel::new(def.reg.map_or(0, PhysReg::byte), def.bytes());
        let src_sel = [
            operands.first().map_or(SdwaSel::DWORD, sdwa_sel),
            operands.get(1).map_or(SdwaSel::DWORD, sdwa_sel),
        ];
        self.emit(opcode, [def], operands.iter().copied())
            .data = InstrData::Sdwa { dst_sel, src_sel };
    }

    fn scratch(&self, what: &str) -> Result<PhysReg, CompileError> {
        self.site
            .scratch_sgpr
            .ok_or_else(|| CompileError::NotImplemented {
                block: self.site.block,
                what: format!("{what} without a scratch SGPR"),
            })
    }

    fn unsupported(&self, what: String) -> CompileError {
        CompileError::NotImplemented {
            block: self.site.block,
            what,
        }
    }

    fn save_scc(&mut self, scratch: PhysReg) {
        self.emit(
            Opcode::SMovB32,
            [Definition::fixed(scratch, RegClass::S1)],
            [Operand::scc()],
        );
    }

    fn restore_scc(&mut self, scratch: PhysReg) {
        self.emit(
            Opcode::SCmpLgU32,
            [Definition::scc()],
            [reg_operand(scratch, 4), Operand::c32(0)],
        );
    }

    fn invert_exec(&mut self) {
        let lm = self.config.lane_mask();
        let opcode = WaveOp::Not.opcode(self.config.wave64());
        self.emit(
            opcode,
            [Definition::exec(lm), Definition::scc()],
            [Operand::exec(lm)],
        );
    }

    /// The largest aligned power-of-two piece of `copy` at `offset`.
    ///
    /// Unless `ignore_uses` is set, a piece never mixes bytes that are still
    /// read with bytes that are not.
    fn split_copy(&self, offset: u32, copy: &CopyOperation, ignore_uses: bool, max_size: u32) -> Piece {
        let def = copy.def.advance(offset as i32);
        let src = match copy.src {
            CopySource::Reg(reg) => CopySource::Reg(reg.advance(offset as i32)),
            CopySource::Constant(value) => CopySource::Constant(value >> (offset * 8)),
        };
        let vgpr = copy.def.is_vgpr();
        let max_size = if vgpr {
            max_size.min(self.config.max_vgpr_copy_bytes() as u32)
        } else {
            max_size
        };
        let max_align = if vgpr { 4 } else { 16 };

        let mut bytes = 1;
        loop {
            let next = bytes * 2;
            let align = next.min(max_align);
            let mut can_increase =
                next <= max_size && offset + next <= copy.bytes && def.reg_b() as u32 % align == 0;
            if let CopySource::Reg(reg) = src {
                can_increase &= reg.reg_b() as u32 % align == 0;
            }
            if can_increase && !ignore_uses {
                let first_unused = copy.uses[offset as usize] == 0;
                can_increase = (0..bytes)
                    .all(|i| (copy.uses[(offset + bytes + i) as usize] == 0) == first_unused);
            }
            if !can_increase {
                break;
            }
            bytes = next;
        }

        let src = match src {
            CopySource::Constant(value) => CopySource::Constant(value & byte_mask(bytes)),
            reg => reg,
        };
        Piece { def, src, bytes }
    }

    // ── Constants ───────────────────────────────────────────────────

    fn copy_constant(&mut self, def_reg: PhysReg, value: u64, bytes: u32, linear: bool) -> Result<(), CompileError> {
        let rc = class(def_reg, bytes, linear);
        let def = Definition::fixed(def_reg, rc);

        if bytes == 4 && !is_inline_u32(value as u32) {
            let imm = value as u32;
            if rc == RegClass::S1 && (imm >= 0xffff_8000 || imm <= 0x7fff) {
                self.emit(Opcode::SMovkI32, [def], [Operand::c32(imm & 0xffff)]);
                return Ok(());
            }
            let rev = imm.reverse_bits();
            if rev <= 64 || rev >= 0xffff_fff0 {
                let opcode = if rc == RegClass::S1 {
                    Opcode::SBrevB32
                } else {
                    Opcode::VBfrevB32
                };
                self.emit(opcode, [def], [Operand::c32(rev)]);
                return Ok(());
            }
            if rc == RegClass::S1 {
                let start = imm.trailing_zeros() & 0x1f;
                let size = imm.count_ones() & 0x1f;
                if bit_range(start as i32, size as i32) == imm {
                    self.emit(
                        Opcode::SBfmB32,
                        [def],
                        [Operand::c32(size), Operand::c32(start)],
                    );
                    return Ok(());
                }
                if self.config.gfx_level >= GfxLevel::Gfx9 {
                    let lo = imm as u16 as i16 as i32 as u32;
                    let hi = (imm >> 16) as u16 as i16 as i32 as u32;
                    if is_inline_u32(lo) && is_inline_u32(hi) {
                        self.emit(
                            Opcode::SPackLlB32B16,
                            [def],
                            [Operand::c32(lo), Operand::c32(hi)],
                        );
                        return Ok(());
                    }
                }
            }
        }

        match (rc.ty(), bytes) {
            (RegType::Sgpr, 4) => {
                self.emit(Opcode::SMovB32, [def], [Operand::c32(value as u32)]);
            }
            (RegType::Sgpr, 8) => {
                if !is_inline_u64(value) {
                    let start = value.trailing_zeros() & 0x3f;
                    let size = value.count_ones() & 0x3f;
                    let range = ((1u128 << size) - 1) << start;
                    if range as u64 == value {
                        self.emit(
                            Opcode::SBfmB64,
                            [def],
                            [Operand::c32(size), Operand::c32(start)],
                        );
                        return Ok(());
                    }
                }
                self.emit(Opcode::SMovB64, [def], [Operand::c64(value)]);
            }
            (RegType::Vgpr, 8) => {
                self.emit(
                    Opcode::VLshrrevB64,
                    [def],
                    [Operand::c32(0), Operand::c64(value)],
                );
            }
            (RegType::Vgpr, 4) => {
                self.emit(Opcode::VMovB32, [def], [Operand::c32(value as u32)]);
            }
            (RegType::Vgpr, 1 | 2) => self.copy_subdword_constant(def_reg, value, bytes),
            _ => return Err(self.unsupported(format!("constant copy into {rc}"))),
        }
        Ok(())
    }

    fn copy_subdword_constant(&mut self, def_reg: PhysReg, value: u64, bytes: u32) {
        let def = Definition::fixed(def_reg, class(def_reg, bytes, false));
        let use_sdwa = self.config.gfx_level >= GfxLevel::Gfx9;

        if bytes == 1 && use_sdwa {
            let op32 = value as u8 as i8 as i32 as u32;
            if is_inline_u32(op32) {
                self.emit_sdwa(Opcode::VMovB32, def, &[Operand::c32(op32)]);
                return;
            }
        }
        if bytes == 2 && use_sdwa && is_inline_u16(value as u16) {
            let half = value as u16;
            if half >= 0xfff0 || half <= 64 {
                let op32 = half as i16 as i32 as u32;
                self.emit_sdwa(Opcode::VMovB32, def, &[Operand::c32(op32)]);
            } else {
                self.emit_sdwa(
                    Opcode::VAddF16,
                    def,
                    &[Operand::constant(half as u64, 2), Operand::c32(0)],
                );
            }
            return;
        }

        // mask into the full register
        let shift = def_reg.byte() * 8;
        let mask = ((byte_mask(bytes) << shift) & 0xffff_ffff) as u32;
        let val = ((value << shift) & 0xffff_ffff) as u32 & mask;
        let full = PhysReg::new(def_reg.reg());
        let dst = Definition::fixed(full, RegClass::V1);
        let cur = Operand::fixed(full, RegClass::V1);
        if val != mask {
            self.emit(Opcode::VAndB32, [dst], [Operand::c32(!mask), cur]);
        }
        if val != 0 {
            self.emit(Opcode::VOrB32, [dst], [Operand::c32(val), cur]);
        }
    }

    // ── Copies ──────────────────────────────────────────────────────

    fn copy_linear_vgpr(&mut self, def: Definition, op: Operand, preserve_scc: bool) -> Result<(), CompileError> {
        let scratch = if preserve_scc {
            let scratch = self.scratch("linear VGPR copy preserving scc")?;
            self.save_scc(scratch);
            Some(scratch)
        } else {
            None
        };
        for _ in 0..2 {
            if def.size() == 2 {
                self.emit(Opcode::VLshrrevB64, [def], [Operand::c32(0), op]);
            } else {
                self.emit(Opcode::VMovB32, [def], [op]);
            }
            self.invert_exec();
        }
        if let Some(scratch) = scratch {
            self.restore_scc(scratch);
        }
        Ok(())
    }

    fn copy_register(
        &mut self,
        def_reg: PhysReg,
        src: PhysReg,
        bytes: u32,
        linear: bool,
        preserve_scc: bool,
    ) -> Result<(), CompileError> {
        let rc = class(def_reg, bytes, linear);
        let def = Definition::fixed(def_reg, rc);
        let op = Operand::fixed(src, class(src, bytes, linear));

        if rc.is_linear_vgpr() {
            return self.copy_linear_vgpr(def, op, preserve_scc);
        }
        match (rc.ty(), bytes) {
            (RegType::Vgpr, 4) => {
                self.emit(Opcode::VMovB32, [def], [op]);
            }
            (RegType::Vgpr, 8) => {
                self.emit(Opcode::VLshrrevB64, [def], [Operand::c32(0), op]);
            }
            (RegType::Sgpr, 4) => {
                self.emit(Opcode::SMovB32, [def], [op]);
            }
            (RegType::Sgpr, 8) => {
                self.emit(Opcode::SMovB64, [def], [op]);
            }
            (RegType::Vgpr, 1 | 2) => self.emit_sdwa(Opcode::VMovB32, def, &[op]),
            _ => return Err(self.unsupported(format!("copy of {rc} from {src}"))),
        }
        Ok(())
    }

    /// Copy the bytes of `copy` nobody reads any more. Returns whether anything was emitted.
    fn do_copy(&mut self, copy: &CopyOperation, preserve_scc: &mut bool) -> Result<bool, CompileError> {
        let mut did_copy = false;
        let mut offset = 0;
        while offset < copy.bytes {
            if copy.uses[offset as usize] != 0 {
                offset += 1;
                continue;
            }
            let piece = self.split_copy(offset, copy, false, 8);

            match piece.src {
                src if piece.def == PhysReg::SCC => {
                    let op = match src {
                        CopySource::Reg(reg) => reg_operand(reg, piece.bytes),
                        CopySource::Constant(value) => Operand::constant(value, piece.bytes),
                    };
                    self.emit(Opcode::SCmpLgU32, [Definition::scc()], [op, Operand::c32(0)]);
                    *preserve_scc = true;
                }
                CopySource::Constant(value) => {
                    self.copy_constant(piece.def, value, piece.bytes, copy.linear_vgpr)?
                }
                CopySource::Reg(src) => self.copy_register(
                    piece.def,
                    src,
                    piece.bytes,
                    copy.linear_vgpr,
                    *preserve_scc,
                )?,
            }

            did_copy = true;
            offset += piece.bytes;
        }
        Ok(did_copy)
    }

    // ── Swaps ───────────────────────────────────────────────────────

    fn xor_swap(&mut self, opcode: Opcode, def: Definition, op: Operand, scc: bool, sdwa: bool) {
        let (Some(def_reg), Some(op_reg)) = (def.reg, op.reg) else {
            panic!("swap operands without registers");
        };
        let def_as_op = Operand::fixed(def_reg, def.rc);
        let op_as_def = Definition::fixed(op_reg, op.rc);
        for dst in [op_as_def, def, op_as_def] {
            if sdwa {
                self.emit_sdwa(opcode, dst, &[op, def_as_op]);
            } else if scc {
                self.emit(opcode, [dst, Definition::scc()], [op, def_as_op]);
            } else {
                self.emit(opcode, [dst], [op, def_as_op]);
            }
        }
    }

    fn swap_v1(&mut self, def: Definition, op: Operand) {
        if self.config.has_native_swap() {
            let (Some(def_reg), Some(op_reg)) = (def.reg, op.reg) else {
                panic!("swap operands without registers");
            };
            self.emit(
                Opcode::VSwapB32,
                [def, Definition::fixed(op_reg, op.rc)],
                [op, Operand::fixed(def_reg, def.rc)],
            );
        } else {
            self.xor_swap(Opcode::VXorB32, def, op, false, false);
        }
    }

    fn swap_linear_vgpr(&mut self, def: Definition, op: Operand, preserve_scc: bool) -> Result<(), CompileError> {
        let scratch = if preserve_scc {
            let scratch = self.scratch("linear VGPR swap preserving scc")?;
            self.save_scc(scratch);
            Some(scratch)
        } else {
            None
        };
        for _ in 0..2 {
            self.swap_v1(def, op);
            self.invert_exec();
        }
        if let Some(scratch) = scratch {
            self.restore_scc(scratch);
        }
        Ok(())
    }

    fn do_swap(&mut self, copy: &CopyOperation, preserve_scc: bool) -> Result<(), CompileError> {
        let CopySource::Reg(src) = copy.src else {
            panic!("{}: swap with a constant source", copy.def);
        };
        let mut offset = 0;

        let def_misalign = copy.def.reg_b() % 4;
        if copy.bytes == 3 && def_misalign <= 1 && def_misalign == src.reg_b() % 4 {
            // a dword swap, then swap back the byte that was not part of the copy
            let op = PhysReg::from_byte(src.reg_b() & !3);
            let def = PhysReg::from_byte(copy.def.reg_b() & !3);
            let mut dword = CopyOperation::new(def, CopySource::Reg(op), 4);
            dword.linear_vgpr = copy.linear_vgpr;
            dword.uses[..4].fill(1);
            self.do_swap(&dword, preserve_scc)?;

            let fixup = if def_misalign == 0 { 3 } else { 0 };
            let mut byte = CopyOperation::new(def.advance(fixup), CopySource::Reg(op.advance(fixup)), 1);
            byte.linear_vgpr = copy.linear_vgpr;
            byte.uses[0] = 1;
            self.do_swap(&byte, preserve_scc)?;

            offset = copy.bytes;
        }

        while offset < copy.bytes {
            let max_size = if copy.def.is_vgpr() { 4 } else { 8 };
            let piece = self.split_copy(offset, copy, true, max_size);
            let CopySource::Reg(op_reg) = piece.src else {
                unreachable!("register copy split into a constant piece");
            };
            let rc = class(piece.def, piece.bytes, copy.linear_vgpr);
            let def = Definition::fixed(piece.def, rc);
            let op = Operand::fixed(op_reg, rc);

            if copy.linear_vgpr {
                self.swap_linear_vgpr(def, op, preserve_scc)?;
            } else if rc == RegClass::V1 {
                self.swap_v1(def, op);
            } else if op_reg == PhysReg::SCC || piece.def == PhysReg::SCC {
                assert!(!preserve_scc, "swap with scc while scc is preserved");
                let other = if op_reg == PhysReg::SCC { piece.def } else { op_reg };
                let scratch = self.scratch("swap with scc")?;
                self.save_scc(scratch);
                self.emit(
                    Opcode::SCmpLgU32,
                    [Definition::scc()],
                    [reg_operand(other, 4), Operand::c32(0)],
                );
                self.emit(
                    Opcode::SMovB32,
                    [Definition::fixed(other, RegClass::S1)],
                    [reg_operand(scratch, 4)],
                );
            } else if rc == RegClass::S1 {
                if preserve_scc {
                    let scratch = self.scratch("scalar swap preserving scc")?;
                    self.emit(
                        Opcode::SMovB32,
                        [Definition::fixed(scratch, RegClass::S1)],
                        [op],
                    );
                    self.emit(
                        Opcode::SMovB32,
                        [Definition::fixed(op_reg, rc)],
                        [Operand::fixed(piece.def, rc)],
                    );
                    self.emit(Opcode::SMovB32, [def], [reg_operand(scratch, 4)]);
                } else {
                    self.xor_swap(Opcode::SXorB32, def, op, true, false);
                }
            } else if rc == RegClass::S2 {
                let scratch = if preserve_scc {
                    let scratch = self.scratch("64-bit scalar swap preserving scc")?;
                    self.save_scc(scratch);
                    Some(scratch)
                } else {
                    None
                };
                self.xor_swap(Opcode::SXorB64, def, op, true, false);
                if let Some(scratch) = scratch {
                    self.restore_scc(scratch);
                }
            } else if piece.bytes == 2 && piece.def.reg() == op_reg.reg() {
                // both halves of one register
                self.emit(
                    Opcode::VAlignbyteB32,
                    [Definition::fixed(PhysReg::new(piece.def.reg()), RegClass::V1)],
                    [Operand::fixed(piece.def, rc), op, Operand::c32(2)],
                );
            } else if rc.is_subdword() {
                self.xor_swap(Opcode::VXorB32, def, op, false, true);
            } else {
                return Err(self.unsupported(format!("swap of {rc}")));
            }

            offset += piece.bytes;
        }

        // restore swapped bytes that nobody reads
        let mut back = *copy;
        back.src = CopySource::Reg(copy.def);
        back.def = src;
        let mut preserve_scc = preserve_scc;
        self.do_copy(&back, &mut preserve_scc)?;
        Ok(())
    }

    /// Write two 16-bit halves into one VGPR.
    fn pack_2x16(&mut self, def_reg: PhysReg, lo: CopySource, hi: CopySource) -> Result<(), CompileError> {
        if let (CopySource::Constant(lo), CopySource::Constant(hi)) = (lo, hi) {
            return self.copy_constant(def_reg, (lo & 0xffff) | ((hi & 0xffff) << 16), 4, false);
        }

        let half = |src: CopySource| match src {
            CopySource::Reg(reg) => Operand::fixed(reg, RegClass::V2B),
            CopySource::Constant(value) => Operand::constant(value & 0xffff, 2),
        };
        let byte = |src: CopySource| match src {
            CopySource::Reg(reg) => reg.byte(),
            CopySource::Constant(_) => 0,
        };
        let def = Definition::fixed(def_reg, RegClass::V1);
        let def_op = Operand::fixed(def_reg, RegClass::V1);

        let can_use_pack = self.config.gfx_level >= GfxLevel::Gfx10
            || (self.config.has_pack_f16() && !is_literal_half(lo) && !is_literal_half(hi));
        if can_use_pack {
            let opsel = (byte(hi) | (byte(lo) >> 1)) as u8;
            self.emit(Opcode::VPackB32F16, [def], [half(lo), half(hi)])
                .data = InstrData::Vop3 { opsel };
            return Ok(());
        }

        // a single alignbyte when lo sits in a high half
        if let CopySource::Reg(lo_reg) = lo
            && lo_reg.byte() == 2
        {
            let hi_op = match hi {
                CopySource::Reg(hi_reg) if hi_reg.byte() == 0 => Some(half(hi)),
                CopySource::Constant(value)
                    if value != 0
                        && (is_inline_u32(value as u32)
                            || self.config.gfx_level >= GfxLevel::Gfx10) =>
                {
                    Some(Operand::c32(value as u32))
                }
                _ => None,
            };
            if let Some(hi_op) = hi_op {
                self.emit(
                    Opcode::VAlignbyteB32,
                    [def],
                    [hi_op, half(lo), Operand::c32(2)],
                );
                return Ok(());
            }
        }

        let def_lo = Definition::fixed(def_reg, RegClass::V2B);
        let def_hi = Definition::fixed(def_reg.advance(2), RegClass::V2B);

        match (lo, hi) {
            (CopySource::Constant(lo_value), CopySource::Reg(hi_reg)) => {
                if hi_reg.byte() == 0 {
                    self.emit(Opcode::VLshlrevB32, [def_hi], [Operand::c32(16), half(hi)]);
                } else {
                    self.emit(Opcode::VAndB32, [def_hi], [Operand::c32(!0xffff), half(hi)]);
                }
                if lo_value != 0 {
                    self.emit(Opcode::VOrB32, [def], [Operand::c32(lo_value as u32), def_op]);
                }
            }
            (CopySource::Reg(lo_reg), CopySource::Constant(hi_value)) => {
                if lo_reg.byte() == 2 {
                    self.emit(Opcode::VLshrrevB32, [def_lo], [Operand::c32(16), half(lo)]);
                } else {
                    self.emit(Opcode::VAndB32, [def_lo], [Operand::c32(0xffff), half(lo)]);
                }
                if hi_value != 0 {
                    self.emit(
                        Opcode::VOrB32,
                        [def],
                        [Operand::c32((hi_value as u32) << 16), def_op],
                    );
                }
            }
            (CopySource::Reg(mut lo_reg), CopySource::Reg(mut hi_reg)) => {
                if lo_reg.reg() == def_reg.reg() {
                    assert_eq!(lo_reg.byte(), 2, "low half already in place");
                    self.emit(Opcode::VLshrrevB32, [def_lo], [Operand::c32(16), half(lo)]);
                    lo_reg = def_reg;
                } else if hi_reg == def_reg {
                    self.emit(Opcode::VLshlrevB32, [def_hi], [Operand::c32(16), half(hi)]);
                    hi_reg = def_reg.advance(2);
                } else if lo_reg.byte() == 0 {
                    // the other half is overwritten below
                    self.emit(Opcode::VMovB32, [def_lo], [half(lo)]);
                    lo_reg = def_reg;
                } else {
                    assert_eq!(hi_reg.byte(), 2, "no half of the pack is placeable");
                    self.emit(Opcode::VMovB32, [def_hi], [half(hi)]);
                    hi_reg = def_reg.advance(2);
                }

                if lo_reg.reg() == def_reg.reg() {
                    self.emit_sdwa(
                        Opcode::VMovB32,
                        def_hi,
                        &[Operand::fixed(hi_reg, RegClass::V2B)],
                    );
                } else {
                    self.emit_sdwa(
                        Opcode::VMovB32,
                        def_lo,
                        &[Operand::fixed(lo_reg, RegClass::V2B)],
                    );
                }
            }
            (CopySource::Constant(_), CopySource::Constant(_)) => unreachable!("handled above"),
        }
        Ok(())
    }

    fn try_coalesce(&self, copy_map: &mut CopyMap, copy: &mut CopyOperation) {
        let mut next_def_align = (copy.bytes + 1).next_power_of_two();
        let mut next_op_align = next_def_align;
        if copy.def.is_vgpr() {
            next_def_align = next_def_align.min(4);
        }
        if let CopySource::Reg(src) = copy.src
            && src.is_vgpr()
        {
            next_op_align = next_op_align.min(4);
        }

        if copy.bytes >= 8 || copy.def.reg_b() as u32 % next_def_align != 0 {
            return;
        }
        if let CopySource::Reg(src) = copy.src
            && src.reg_b() as u32 % next_op_align != 0
        {
            return;
        }

        let other_key = copy.def.advance(copy.bytes as i32);
        let Some(&other) = copy_map.get(&other_key) else {
            return;
        };
        if copy.bytes + other.bytes > 8
            || copy.is_constant() != other.is_constant()
            || copy.linear_vgpr != other.linear_vgpr
        {
            return;
        }
        // no 64-bit VGPR moves below gfx10
        if copy.bytes >= 4 && copy.def.is_vgpr() && self.config.gfx_level < GfxLevel::Gfx10 {
            return;
        }

        let new_size = copy.bytes + other.bytes;
        match (copy.src, other.src) {
            (CopySource::Constant(lo), CopySource::Constant(hi)) => {
                let value = lo | (hi << (copy.bytes * 8));
                if !new_size.is_power_of_two()
                    || !constant_representable(value, new_size, copy.def.is_vgpr())
                {
                    return;
                }
                copy.src = CopySource::Constant(value);
            }
            (CopySource::Reg(lo), CopySource::Reg(hi)) => {
                if hi != lo.advance(copy.bytes as i32) {
                    return;
                }
            }
            _ => return,
        }

        copy.bytes = new_size;
        copy_map.remove(&other_key);
    }
}

/// Readers of each byte of `copy`'s destination among all pending entries.
fn count_uses(copy_map: &CopyMap, copy: &CopyOperation) -> [u8; 8] {
    let mut uses = [0u8; 8];
    for other in copy_map.values() {
        let CopySource::Reg(src) = other.src else {
            continue;
        };
        for i in 0..copy.bytes {
            let distance = (copy.def.reg_b() as u32 + i).wrapping_sub(src.reg_b() as u32);
            if distance < other.bytes {
                uses[i as usize] += 1;
            }
        }
    }
    uses
}

/// Point pending readers of `swap.def` at `src`, where its old value now lives.
fn redirect_readers(copy_map: &mut CopyMap, swap: &CopyOperation, src: PhysReg) {
    let mut bytes_left = bit_range(0, swap.bytes as i32);
    let keys: Vec<PhysReg> = copy_map.keys().copied().collect();

    for key in keys {
        let Some(&target) = copy_map.get(&key) else {
            continue;
        };
        let CopySource::Reg(target_src) = target.src else {
            continue;
        };
        if target_src == swap.def && target.bytes == swap.bytes {
            if let Some(entry) = copy_map.get_mut(&key) {
                entry.src = CopySource::Reg(src);
            }
            break;
        }

        let imask = intersection_mask(swap.def.reg_b(), swap.bytes, target_src.reg_b(), target.bytes);
        if imask == 0 {
            continue;
        }

        // split into the part before, inside and after the swapped range
        let offset = target_src.reg_b() as i32 - swap.def.reg_b() as i32;
        let target_end = target_src.reg_b() as i32 + target.bytes as i32;
        let swap_end = swap.def.reg_b() as i32 + swap.bytes as i32;
        let before = (-offset).max(0) as u32;
        let after = (target_end - swap_end).max(0) as u32;
        let middle = target.bytes - before - after;

        let sub = |start: u32, len: u32, src: CopySource| {
            let mut piece = CopyOperation {
                src,
                def: target.def.advance(start as i32),
                bytes: len,
                linear_vgpr: target.linear_vgpr,
                uses: [0; 8],
            };
            piece.uses[..len as usize]
                .copy_from_slice(&target.uses[start as usize..(start + len) as usize]);
            piece
        };

        if after > 0 {
            let start = before + middle;
            let piece = sub(start, after, CopySource::Reg(target_src.advance(start as i32)));
            copy_map.insert(piece.def, piece);
        }
        if middle > 0 {
            let piece = sub(before, middle, CopySource::Reg(src.advance(offset.max(0))));
            copy_map.insert(piece.def, piece);
        }
        if before > 0
            && let Some(entry) = copy_map.get_mut(&key)
        {
            entry.bytes = before;
            entry.uses[before as usize..].fill(0);
        }

        bytes_left &= !imask;
        if bytes_left == 0 {
            break;
        }
    }
}

// ─── Resolver ───────────────────────────────────────────────────────────────

/// Emit a sequence of moves and swaps with the effect of the parallel copy
/// `copy_map`, appending to `out`. Returns the number of instructions emitted.
pub fn handle_operands(
    mut copy_map: CopyMap,
    config: TargetConfig,
    site: CopySite,
    out: &mut Vec<Instruction>,
) -> Result<usize, CompileError> {
    let before = out.len();
    let mut emitter = Emitter { config, site, out };
    trace!("parallel copy in {}: {} entries", site.block, copy_map.len());

    // ── Set up ──────────────────────────────────────────────────────
    let mut writes_scc = false;
    let mut cursor = first_key(&copy_map);
    while let Some(key) = cursor {
        let mut copy = copy_map[&key];
        if copy.def == PhysReg::SCC {
            writes_scc = true;
        }
        assert!(
            !site.tmp_in_scc || Some(copy.def) != site.scratch_sgpr,
            "copy into the scratch SGPR"
        );

        if copy.src == CopySource::Reg(key) {
            copy_map.remove(&key);
            cursor = key_after(&copy_map, key);
            continue;
        }

        if copy.bytes > 8 {
            let CopySource::Reg(src) = copy.src else {
                panic!("{key}: constant copy wider than 8 bytes");
            };
            assert!(key.byte() == 0 && src.byte() == 0, "{key}: misaligned wide copy");
            let mut hi = CopyOperation::new(key.advance(8), CopySource::Reg(src.advance(8)), copy.bytes - 8);
            hi.linear_vgpr = copy.linear_vgpr;
            copy_map.insert(hi.def, hi);
            copy.bytes = 8;
        }

        emitter.try_coalesce(&mut copy_map, &mut copy);
        copy_map.insert(key, copy);
        let uses = count_uses(&copy_map, &copy);
        if let Some(entry) = copy_map.get_mut(&key) {
            entry.uses = uses;
        }
        cursor = key_after(&copy_map, key);
    }

    // ── Paths ───────────────────────────────────────────────────────
    let mut preserve_scc = site.tmp_in_scc && !writes_scc;
    let mut skip_partial_copies = true;
    let mut cursor = first_key(&copy_map);
    loop {
        if copy_map.is_empty() {
            return Ok(emitter.out.len() - before);
        }
        let key = match cursor {
            Some(key) => key,
            None => {
                if !skip_partial_copies {
                    break;
                }
                skip_partial_copies = false;
                match first_key(&copy_map) {
                    Some(key) => key,
                    None => break,
                }
            }
        };
        let copy = copy_map[&key];

        // both halves of a VGPR at once
        if key.is_vgpr() && key.byte() == 0 && copy.bytes == 2 {
            let hi_key = key.advance(2);
            if let Some(&other) = copy_map.get(&hi_key)
                && other.bytes == 2
            {
                let unused_lo = copy.is_used() == 0
                    || (copy.is_used() == 0x0101 && other.src == CopySource::Reg(key));
                let unused_hi = other.is_used() == 0
                    || (other.is_used() == 0x0101 && copy.src == CopySource::Reg(hi_key));
                // opsel only selects the low or high half of a source
                let half_aligned = |src: CopySource| match src {
                    CopySource::Reg(reg) => reg.byte() % 2 == 0,
                    CopySource::Constant(_) => true,
                };
                if unused_lo && unused_hi && half_aligned(copy.src) && half_aligned(other.src) {
                    emitter.pack_2x16(key, copy.src, other.src)?;
                    copy_map.remove(&key);
                    copy_map.remove(&hi_key);

                    let reads = |src: CopySource, byte: u32| match src {
                        CopySource::Reg(reg) => byte.wrapping_sub(reg.reg_b() as u32) < 2,
                        CopySource::Constant(_) => false,
                    };
                    for entry in copy_map.values_mut() {
                        for i in 0..entry.bytes {
                            let byte = entry.def.reg_b() as u32 + i;
                            // each half counted as its own reader
                            let readers = reads(copy.src, byte) as u8 + reads(other.src, byte) as u8;
                            for _ in 0..readers {
                                entry.release(i);
                            }
                        }
                    }
                    cursor = first_key(&copy_map);
                    continue;
                }
            }
        }

        if copy.is_used() != 0 {
            // constants wait for a free destination; partial copies wait for
            // the second sweep
            if copy.is_constant() || skip_partial_copies {
                cursor = key_after(&copy_map, key);
                continue;
            }

            let has_zero_use_bytes = (0..copy.bytes)
                .filter(|&i| copy.uses[i as usize] == 0)
                .fold(0u32, |mask, i| mask | 1 << i);
            if has_zero_use_bytes == 0 {
                // needs a swap
                cursor = key_after(&copy_map, key);
                continue;
            }

            let mut partial_copy = has_zero_use_bytes == 0xf || has_zero_use_bytes == 0xf0;
            if !partial_copy && let CopySource::Reg(src) = copy.src {
                // worth it only if it frees another entry
                partial_copy = copy_map.values().any(|other| {
                    (0..other.bytes).any(|i| {
                        let distance =
                            (other.def.reg_b() as u32 + i).wrapping_sub(src.reg_b() as u32);
                        distance < copy.bytes
                            && other.uses[i as usize] == 1
                            && copy.uses[distance as usize] == 0
                    })
                });
            }
            if !partial_copy {
                cursor = key_after(&copy_map, key);
                continue;
            }
        }

        let did_copy = emitter.do_copy(&copy, &mut preserve_scc)?;
        skip_partial_copies = did_copy;
        copy_map.remove(&key);

        if copy.is_used() != 0 {
            // keep the portions that are still read
            let mut offset = 0;
            while offset < copy.bytes {
                if copy.uses[offset as usize] == 0 {
                    offset += 1;
                    continue;
                }
                let piece = emitter.split_copy(offset, &copy, false, 8);
                let mut rest = CopyOperation::new(piece.def, piece.src, piece.bytes);
                rest.linear_vgpr = copy.linear_vgpr;
                rest.uses[..piece.bytes as usize].copy_from_slice(
                    &copy.uses[offset as usize..(offset + piece.bytes) as usize],
                );
                copy_map.insert(piece.def, rest);
                offset += piece.bytes;
            }
        }
        cursor = first_key(&copy_map);

        // after the split, in case the copy overwrote part of its own source
        if did_copy && let CopySource::Reg(src) = copy.src {
            for other in copy_map.values_mut() {
                for i in 0..other.bytes {
                    let distance = (other.def.reg_b() as u32 + i).wrapping_sub(src.reg_b() as u32);
                    if distance < copy.bytes && copy.uses[distance as usize] == 0 {
                        other.release(i);
                    }
                }
            }
        }
    }

    // ── Cycles ──────────────────────────────────────────────────────
    let largest = copy_map.values().map(|c| c.bytes).max().unwrap_or(0);
    while let Some(first) = first_key(&copy_map) {
        // larger swaps first: they can make smaller ones unnecessary
        let mut key = first;
        let mut size = copy_map[&first].bytes;
        for (k, c) in &copy_map {
            if c.bytes > size {
                key = *k;
                size = c.bytes;
                if size == largest {
                    break;
                }
            }
        }

        let copy = copy_map[&key];
        let CopySource::Reg(src) = copy.src else {
            panic!("{key}: constant left in a copy cycle");
        };
        if src == key {
            copy_map.remove(&key);
            continue;
        }

        let mut swap = copy;
        let distance = (src.reg_b() as i32 - key.reg_b() as i32).unsigned_abs();
        if distance < swap.bytes {
            // self-intersecting: swap the leading part, keep the rest pending
            let mut remaining = CopyOperation::new(
                key.advance(distance as i32),
                CopySource::Reg(src.advance(distance as i32)),
                swap.bytes - distance,
            );
            remaining.linear_vgpr = swap.linear_vgpr;
            remaining.uses[..remaining.bytes as usize]
                .copy_from_slice(&swap.uses[distance as usize..swap.bytes as usize]);
            copy_map.insert(remaining.def, remaining);
            swap.uses[distance as usize..swap.bytes as usize].fill(0);
            swap.bytes = distance;
        }

        trace!("swap {} <-> {} ({} bytes)", swap.def, src, swap.bytes);
        emitter.do_swap(&swap, preserve_scc)?;
        copy_map.remove(&key);
        redirect_readers(&mut copy_map, &swap, src);
    }

    Ok(emitter.out.len() - before)
}
