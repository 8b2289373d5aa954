//! Program model for the SIMT backend core.
//!
//! A program is a dense vector of basic blocks addressed by [`BlockId`].
//! Each block carries two edge sets: *logical* edges follow source-level
//! control flow, *linear* edges follow what the hardware actually executes
//! once divergent branches are serialized. Instructions are near-machine
//! operations over SSA temps; after register allocation every operand and
//! definition also carries a byte-addressed [`PhysReg`].

use std::fmt;
use std::ops::{Add, AddAssign, BitAnd, BitOr, BitOrAssign, Sub, SubAssign};

use smallvec::SmallVec;

use crate::config::TargetConfig;

// ─── Register classes ───────────────────────────────────────────────────────

/// The two register banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegType {
    /// Scalar registers, one value per wave.
    Sgpr,
    /// Vector registers, one value per lane.
    Vgpr,
}

/// Bank, byte size and linearity of a value.
///
/// SGPR classes are always linear: they are live along linear edges.
/// A linear VGPR must survive inactive lanes and is also live along
/// linear edges.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegClass {
    ty: RegType,
    bytes: u8,
    linear: bool,
}

impl RegClass {
    pub const S1: RegClass = RegClass::new(RegType::Sgpr, 4);
    pub const S2: RegClass = RegClass::new(RegType::Sgpr, 8);
    pub const S3: RegClass = RegClass::new(RegType::Sgpr, 12);
    pub const S4: RegClass = RegClass::new(RegType::Sgpr, 16);
    pub const S8: RegClass = RegClass::new(RegType::Sgpr, 32);
    pub const V1: RegClass = RegClass::new(RegType::Vgpr, 4);
    pub const V2: RegClass = RegClass::new(RegType::Vgpr, 8);
    pub const V3: RegClass = RegClass::new(RegType::Vgpr, 12);
    pub const V4: RegClass = RegClass::new(RegType::Vgpr, 16);
    pub const V1B: RegClass = RegClass::new(RegType::Vgpr, 1);
    pub const V2B: RegClass = RegClass::new(RegType::Vgpr, 2);
    pub const V3B: RegClass = RegClass::new(RegType::Vgpr, 3);

    pub const fn new(ty: RegType, bytes: u8) -> Self {
        Self {
            ty,
            bytes,
            linear: matches!(ty, RegType::Sgpr),
        }
    }

    /// A class of `dwords` full registers.
    pub const fn dwords(ty: RegType, dwords: u8) -> Self {
        Self::new(ty, dwords * 4)
    }

    pub fn ty(self) -> RegType {
        self.ty
    }

    pub fn bytes(self) -> u32 {
        self.bytes as u32
    }

    /// Size in dwords, rounded up.
    pub fn size(self) -> u32 {
        (self.bytes as u32).div_ceil(4)
    }

    pub fn is_subdword(self) -> bool {
        self.bytes % 4 != 0
    }

    pub fn is_linear(self) -> bool {
        self.linear
    }

    pub fn is_linear_vgpr(self) -> bool {
        self.linear && self.ty == RegType::Vgpr
    }

    pub fn as_linear(self) -> Self {
        Self {
            linear: true,
            ..self
        }
    }

    /// Same bank and linearity, different size.
    pub fn resize(self, bytes: u32) -> Self {
        Self {
            bytes: bytes as u8,
            ..self
        }
    }
}

impl fmt::Debug for RegClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for RegClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_linear_vgpr() {
            write!(f, "l")?;
        }
        let bank = match self.ty {
            RegType::Sgpr => 's',
            RegType::Vgpr => 'v',
        };
        if self.is_subdword() {
            write!(f, "{bank}{}b", self.bytes)
        } else {
            write!(f, "{bank}{}", self.bytes / 4)
        }
    }
}

// ─── Physical registers ─────────────────────────────────────────────────────

/// A byte-addressed physical register slot: `reg * 4 + byte`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysReg(u16);

impl PhysReg {
    pub const VCC: PhysReg = PhysReg::new(106);
    pub const M0: PhysReg = PhysReg::new(124);
    pub const EXEC: PhysReg = PhysReg::new(126);
    pub const EXEC_HI: PhysReg = PhysReg::new(127);
    pub const SCC: PhysReg = PhysReg::new(253);
    /// First VGPR register number.
    pub const VGPR_BASE: u16 = 256;

    /// Register `reg`, byte 0.
    pub const fn new(reg: u16) -> Self {
        Self(reg * 4)
    }

    pub const fn from_byte(reg_b: u16) -> Self {
        Self(reg_b)
    }

    pub const fn sgpr(n: u16) -> Self {
        Self::new(n)
    }

    pub const fn vgpr(n: u16) -> Self {
        Self::new(Self::VGPR_BASE + n)
    }

    pub fn reg(self) -> u16 {
        self.0 / 4
    }

    pub fn byte(self) -> u32 {
        (self.0 % 4) as u32
    }

    pub fn reg_b(self) -> u16 {
        self.0
    }

    pub fn is_vgpr(self) -> bool {
        self.reg() >= Self::VGPR_BASE
    }

    /// The slot `bytes` bytes further along.
    pub fn advance(self, bytes: i32) -> Self {
        Self((self.0 as i32 + bytes) as u16)
    }

    /// The slot `n` whole registers further along, keeping the byte offset.
    pub fn offset(self, n: u16) -> Self {
        Self(self.0 + n * 4)
    }
}

impl fmt::Debug for PhysReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for PhysReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reg = self.reg();
        match reg {
            106 => write!(f, "vcc")?,
            124 => write!(f, "m0")?,
            126 => write!(f, "exec")?,
            253 => write!(f, "scc")?,
            r if r >= Self::VGPR_BASE => write!(f, "v{}", r - Self::VGPR_BASE)?,
            r if r < 106 => write!(f, "s{r}")?,
            r => write!(f, "r{r}")?,
        }
        if self.byte() != 0 {
            write!(f, ".b{}", self.byte())?;
        }
        Ok(())
    }
}

// ─── Temps, operands, definitions ───────────────────────────────────────────

/// An SSA value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Temp {
    id: u32,
    rc: RegClass,
}

impl Temp {
    pub fn new(id: u32, rc: RegClass) -> Self {
        Self { id, rc }
    }

    pub fn id(self) -> u32 {
        self.id
    }

    pub fn rc(self) -> RegClass {
        self.rc
    }

    pub fn ty(self) -> RegType {
        self.rc.ty()
    }

    pub fn bytes(self) -> u32 {
        self.rc.bytes()
    }

    pub fn size(self) -> u32 {
        self.rc.size()
    }
}

impl fmt::Debug for Temp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}:{}", self.id, self.rc)
    }
}

/// What an operand reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandValue {
    Temp(Temp),
    Constant(u64),
    /// Any value of the operand's class will do.
    Undef,
    /// A register read by location only, such as `exec` or `scc`.
    Fixed,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Operand {
    pub value: OperandValue,
    pub rc: RegClass,
    pub reg: Option<PhysReg>,
    /// Last use of the temp.
    pub kill: bool,
    /// First operand slot of this instruction holding the killed temp.
    pub first_kill: bool,
    /// The temp stays occupied until the instruction's definitions are written.
    pub late_kill: bool,
}

impl Operand {
    fn with_value(value: OperandValue, rc: RegClass) -> Self {
        Self {
            value,
            rc,
            reg: None,
            kill: false,
            first_kill: false,
            late_kill: false,
        }
    }

    pub fn temp(temp: Temp) -> Self {
        Self::with_value(OperandValue::Temp(temp), temp.rc())
    }

    pub fn temp_fixed(temp: Temp, reg: PhysReg) -> Self {
        Self {
            reg: Some(reg),
            ..Self::temp(temp)
        }
    }

    /// A register read by location.
    pub fn fixed(reg: PhysReg, rc: RegClass) -> Self {
        Self {
            reg: Some(reg),
            ..Self::with_value(OperandValue::Fixed, rc)
        }
    }

    pub fn exec(lane_mask: RegClass) -> Self {
        Self::fixed(PhysReg::EXEC, lane_mask)
    }

    pub fn scc() -> Self {
        Self::fixed(PhysReg::SCC, RegClass::S1)
    }

    pub fn constant(value: u64, bytes: u32) -> Self {
        Self::with_value(
            OperandValue::Constant(value),
            RegClass::new(RegType::Sgpr, bytes as u8),
        )
    }

    pub fn c32(value: u32) -> Self {
        Self::constant(value as u64, 4)
    }

    pub fn c64(value: u64) -> Self {
        Self::constant(value, 8)
    }

    /// All-zero or all-one lane mask constant for the given mask class.
    pub fn lane_mask_constant(all_ones: bool, lane_mask: RegClass) -> Self {
        let value = match (all_ones, lane_mask.bytes()) {
            (false, _) => 0,
            (true, 8) => u64::MAX,
            (true, _) => u32::MAX as u64,
        };
        Self::constant(value, lane_mask.bytes())
    }

    pub fn undef(rc: RegClass) -> Self {
        Self::with_value(OperandValue::Undef, rc)
    }

    pub fn is_temp(&self) -> bool {
        matches!(self.value, OperandValue::Temp(_))
    }

    pub fn temp_value(&self) -> Option<Temp> {
        match self.value {
            OperandValue::Temp(t) => Some(t),
            _ => None,
        }
    }

    pub fn temp_id(&self) -> Option<u32> {
        self.temp_value().map(Temp::id)
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.value, OperandValue::Constant(_))
    }

    pub fn constant_value(&self) -> Option<u64> {
        match self.value {
            OperandValue::Constant(v) => Some(v),
            _ => None,
        }
    }

    pub fn constant_equals(&self, value: u64) -> bool {
        self.constant_value() == Some(value)
    }

    pub fn is_undef(&self) -> bool {
        matches!(self.value, OperandValue::Undef)
    }

    pub fn is_fixed_to(&self, reg: PhysReg) -> bool {
        self.reg == Some(reg)
    }

    pub fn bytes(&self) -> u32 {
        self.rc.bytes()
    }

    pub fn size(&self) -> u32 {
        self.rc.size()
    }
}

impl fmt::Debug for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value {
            OperandValue::Temp(t) => write!(f, "%{}:{}", t.id(), t.rc())?,
            OperandValue::Constant(v) => write!(f, "#{v:#x}:{}", self.rc)?,
            OperandValue::Undef => write!(f, "undef:{}", self.rc)?,
            OperandValue::Fixed => write!(f, "{}", self.rc)?,
        }
        if let Some(reg) = self.reg {
            write!(f, "@{reg}")?;
        }
        if self.first_kill {
            write!(f, "(first-kill)")?;
        } else if self.kill {
            write!(f, "(kill)")?;
        }
        if self.late_kill {
            write!(f, "(late-kill)")?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Definition {
    pub temp: Option<Temp>,
    pub rc: RegClass,
    pub reg: Option<PhysReg>,
    /// The defined value is never read.
    pub kill: bool,
}

impl Definition {
    pub fn temp(temp: Temp) -> Self {
        Self {
            temp: Some(temp),
            rc: temp.rc(),
            reg: None,
            kill: false,
        }
    }

    pub fn temp_fixed(temp: Temp, reg: PhysReg) -> Self {
        Self {
            reg: Some(reg),
            ..Self::temp(temp)
        }
    }

    /// A write to a register location without an SSA value.
    pub fn fixed(reg: PhysReg, rc: RegClass) -> Self {
        Self {
            temp: None,
            rc,
            reg: Some(reg),
            kill: false,
        }
    }

    pub fn exec(lane_mask: RegClass) -> Self {
        Self::fixed(PhysReg::EXEC, lane_mask)
    }

    pub fn scc() -> Self {
        Self::fixed(PhysReg::SCC, RegClass::S1)
    }

    pub fn temp_id(&self) -> Option<u32> {
        self.temp.map(Temp::id)
    }

    pub fn is_fixed_to(&self, reg: PhysReg) -> bool {
        self.reg == Some(reg)
    }

    pub fn bytes(&self) -> u32 {
        self.rc.bytes()
    }

    pub fn size(&self) -> u32 {
        self.rc.size()
    }
}

impl fmt::Debug for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.temp {
            Some(t) => write!(f, "%{}:{}", t.id(), t.rc())?,
            None => write!(f, "{}", self.rc)?,
        }
        if let Some(reg) = self.reg {
            write!(f, "@{reg}")?;
        }
        if self.kill {
            write!(f, "(dead)")?;
        }
        Ok(())
    }
}

// ─── Opcodes ────────────────────────────────────────────────────────────────

/// Encoding family of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Pseudo,
    PseudoBranch,
    Sop1,
    Sop2,
    Sopk,
    Sopc,
    Sopp,
    Vop1,
    Vop2,
    Vop3,
    Vopc,
    Mubuf,
    Mimg,
    Exp,
}

impl Format {
    pub fn is_salu(self) -> bool {
        matches!(
            self,
            Self::Sop1 | Self::Sop2 | Self::Sopk | Self::Sopc | Self::Sopp
        )
    }

    pub fn is_valu(self) -> bool {
        matches!(self, Self::Vop1 | Self::Vop2 | Self::Vop3 | Self::Vopc)
    }

    pub fn is_vmem(self) -> bool {
        matches!(self, Self::Mubuf | Self::Mimg)
    }
}

macro_rules! opcodes {
    ($($variant:ident => $name:literal, $format:ident;)*) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $($variant,)*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$variant,)*];

            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$variant => $name,)*
                }
            }

            pub fn format(self) -> Format {
                match self {
                    $(Opcode::$variant => Format::$format,)*
                }
            }
        }
    };
}

opcodes! {
    // pseudo
    PStartpgm => "p_startpgm", Pseudo;
    PPhi => "p_phi", Pseudo;
    PLinearPhi => "p_linear_phi", Pseudo;
    PParallelcopy => "p_parallelcopy", Pseudo;
    PLogicalStart => "p_logical_start", Pseudo;
    PLogicalEnd => "p_logical_end", Pseudo;
    PCreateVector => "p_create_vector", Pseudo;
    PExtractVector => "p_extract_vector", Pseudo;
    PSplitVector => "p_split_vector", Pseudo;
    PAsUniform => "p_as_uniform", Pseudo;
    PStartLinearVgpr => "p_start_linear_vgpr", Pseudo;
    PEndLinearVgpr => "p_end_linear_vgpr", Pseudo;
    PDiscardIf => "p_discard_if", Pseudo;
    PDemoteToHelper => "p_demote_to_helper", Pseudo;
    PIsHelper => "p_is_helper", Pseudo;
    PElect => "p_elect", Pseudo;
    PEndWqm => "p_end_wqm", Pseudo;
    PExitEarlyIf => "p_exit_early_if", Pseudo;
    PCall => "p_call", Pseudo;
    PBranch => "p_branch", PseudoBranch;
    PCbranchZ => "p_cbranch_z", PseudoBranch;
    PCbranchNz => "p_cbranch_nz", PseudoBranch;
    // scalar
    SMovB32 => "s_mov_b32", Sop1;
    SMovB64 => "s_mov_b64", Sop1;
    SNotB32 => "s_not_b32", Sop1;
    SNotB64 => "s_not_b64", Sop1;
    SWqmB32 => "s_wqm_b32", Sop1;
    SWqmB64 => "s_wqm_b64", Sop1;
    SAndSaveexecB32 => "s_and_saveexec_b32", Sop1;
    SAndSaveexecB64 => "s_and_saveexec_b64", Sop1;
    SFf1I32B32 => "s_ff1_i32_b32", Sop1;
    SFf1I32B64 => "s_ff1_i32_b64", Sop1;
    SBrevB32 => "s_brev_b32", Sop1;
    SSwappcB64 => "s_swappc_b64", Sop1;
    SAndB32 => "s_and_b32", Sop2;
    SAndB64 => "s_and_b64", Sop2;
    SAndn2B32 => "s_andn2_b32", Sop2;
    SAndn2B64 => "s_andn2_b64", Sop2;
    SOrB32 => "s_or_b32", Sop2;
    SOrB64 => "s_or_b64", Sop2;
    SOrn2B32 => "s_orn2_b32", Sop2;
    SOrn2B64 => "s_orn2_b64", Sop2;
    SXorB32 => "s_xor_b32", Sop2;
    SXorB64 => "s_xor_b64", Sop2;
    SLshlB32 => "s_lshl_b32", Sop2;
    SLshlB64 => "s_lshl_b64", Sop2;
    SBfmB32 => "s_bfm_b32", Sop2;
    SBfmB64 => "s_bfm_b64", Sop2;
    SCselectB32 => "s_cselect_b32", Sop2;
    SCselectB64 => "s_cselect_b64", Sop2;
    SPackLlB32B16 => "s_pack_ll_b32_b16", Sop2;
    SAddU32 => "s_add_u32", Sop2;
    SMovkI32 => "s_movk_i32", Sopk;
    SCmpLgU32 => "s_cmp_lg_u32", Sopc;
    SCmpLgU64 => "s_cmp_lg_u64", Sopc;
    SCmpEqU32 => "s_cmp_eq_u32", Sopc;
    SBranch => "s_branch", Sopp;
    SCbranchScc0 => "s_cbranch_scc0", Sopp;
    SCbranchScc1 => "s_cbranch_scc1", Sopp;
    SCbranchExecz => "s_cbranch_execz", Sopp;
    SCbranchExecnz => "s_cbranch_execnz", Sopp;
    SCbranchVccz => "s_cbranch_vccz", Sopp;
    SCbranchVccnz => "s_cbranch_vccnz", Sopp;
    SEndpgm => "s_endpgm", Sopp;
    SNop => "s_nop", Sopp;
    // vector
    VMovB32 => "v_mov_b32", Vop1;
    VSwapB32 => "v_swap_b32", Vop1;
    VReadfirstlaneB32 => "v_readfirstlane_b32", Vop1;
    VBfrevB32 => "v_bfrev_b32", Vop1;
    VCvtF32U32 => "v_cvt_f32_u32", Vop1;
    VXorB32 => "v_xor_b32", Vop2;
    VAndB32 => "v_and_b32", Vop2;
    VOrB32 => "v_or_b32", Vop2;
    VAddF32 => "v_add_f32", Vop2;
    VMulF32 => "v_mul_f32", Vop2;
    VAddF16 => "v_add_f16", Vop2;
    VLshlrevB32 => "v_lshlrev_b32", Vop2;
    VLshrrevB32 => "v_lshrrev_b32", Vop2;
    VMacF32 => "v_mac_f32", Vop2;
    VFmacF32 => "v_fmac_f32", Vop2;
    VCndmaskB32 => "v_cndmask_b32", Vop2;
    VLshrrevB64 => "v_lshrrev_b64", Vop3;
    VAlignbyteB32 => "v_alignbyte_b32", Vop3;
    VPackB32F16 => "v_pack_b32_f16", Vop3;
    VFmaF32 => "v_fma_f32", Vop3;
    VCmpLtF32 => "v_cmp_lt_f32", Vopc;
    VCmpEqU32 => "v_cmp_eq_u32", Vopc;
    VCmpLgU32 => "v_cmp_lg_u32", Vopc;
    VCmpGtU32 => "v_cmp_gt_u32", Vopc;
    // memory and export
    BufferLoadDword => "buffer_load_dword", Mubuf;
    BufferStoreDword => "buffer_store_dword", Mubuf;
    ImageSample => "image_sample", Mimg;
    Exp => "exp", Exp;
}

impl Opcode {
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| op.name() == name)
    }

    pub fn is_phi(self) -> bool {
        matches!(self, Self::PPhi | Self::PLinearPhi)
    }

    pub fn is_branch(self) -> bool {
        self.format() == Format::PseudoBranch
    }

    /// Index of the operand that a definition is tied to, if any.
    ///
    /// The accumulating multiply-adds overwrite their addend in place.
    pub fn tied_operand(self) -> Option<(usize, usize)> {
        match self {
            Self::VMacF32 | Self::VFmacF32 => Some((0, 2)),
            _ => None,
        }
    }
}

impl fmt::Debug for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ─── Instructions ───────────────────────────────────────────────────────────

/// Byte selector of an SDWA operand or destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdwaSel {
    pub offset: u8,
    pub size: u8,
}

impl SdwaSel {
    pub const DWORD: SdwaSel = SdwaSel { offset: 0, size: 4 };

    pub fn new(offset: u32, size: u32) -> Self {
        Self {
            offset: offset as u8,
            size: size as u8,
        }
    }
}

impl fmt::Display for SdwaSel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}w{}", self.offset, self.size)
    }
}

/// Format-specific payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstrData {
    None,
    /// `targets[0]` is the taken target; `targets[1]` is the fallthrough of a
    /// conditional branch.
    Branch {
        targets: [BlockId; 2],
        selection_remove: bool,
    },
    Sopp {
        block: Option<BlockId>,
        imm: u16,
    },
    Sdwa {
        dst_sel: SdwaSel,
        src_sel: [SdwaSel; 2],
    },
    Vop3 {
        opsel: u8,
    },
    Mem {
        offset: u16,
        disable_wqm: bool,
    },
    Export {
        target: u8,
        enabled_mask: u8,
        done: bool,
        valid_mask: bool,
    },
    /// ABI register for each argument operand (operands after the callee).
    Call {
        arg_regs: SmallVec<[PhysReg; 4]>,
    },
    /// Scratch resources the allocator leaves to copy-lowering sites.
    Pseudo {
        scratch_sgpr: Option<PhysReg>,
        tmp_in_scc: bool,
    },
}

pub type Operands = SmallVec<[Operand; 4]>;
pub type Definitions = SmallVec<[Definition; 2]>;

#[derive(Clone, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operands: Operands,
    pub definitions: Definitions,
    pub data: InstrData,
}

impl Instruction {
    pub fn new(
        opcode: Opcode,
        definitions: impl IntoIterator<Item = Definition>,
        operands: impl IntoIterator<Item = Operand>,
    ) -> Self {
        let data = match opcode.format() {
            Format::PseudoBranch => InstrData::Branch {
                targets: [BlockId(0); 2],
                selection_remove: false,
            },
            Format::Sopp => InstrData::Sopp {
                block: None,
                imm: 0,
            },
            _ => InstrData::None,
        };
        Self {
            opcode,
            operands: operands.into_iter().collect(),
            definitions: definitions.into_iter().collect(),
            data,
        }
    }

    pub fn with_data(mut self, data: InstrData) -> Self {
        self.data = data;
        self
    }

    pub fn format(&self) -> Format {
        self.opcode.format()
    }

    pub fn is_phi(&self) -> bool {
        self.opcode.is_phi()
    }

    /// Branch targets, for pseudo branches.
    pub fn targets(&self) -> Option<[BlockId; 2]> {
        match self.data {
            InstrData::Branch { targets, .. } => Some(targets),
            _ => None,
        }
    }

    pub fn set_targets(&mut self, new_targets: [BlockId; 2]) {
        match &mut self.data {
            InstrData::Branch { targets, .. } => *targets = new_targets,
            other => panic!("{}: not a branch payload: {other:?}", self.opcode),
        }
    }

    /// The SOPP branch target, if any.
    pub fn sopp_block(&self) -> Option<BlockId> {
        match self.data {
            InstrData::Sopp { block, .. } => block,
            _ => None,
        }
    }

    pub fn disables_wqm(&self) -> bool {
        matches!(
            self.data,
            InstrData::Mem {
                disable_wqm: true,
                ..
            }
        )
    }

    /// Scratch SGPR and whether SCC must be preserved, for copy-lowering sites.
    pub fn copy_scratch(&self) -> (Option<PhysReg>, bool) {
        match self.data {
            InstrData::Pseudo {
                scratch_sgpr,
                tmp_in_scc,
            } => (scratch_sgpr, tmp_in_scc),
            _ => (None, false),
        }
    }

    /// Whether the instruction reads or writes the hardware mask through its
    /// lanes, i.e. only active lanes are affected.
    pub fn is_exec_predicated(&self) -> bool {
        let format = self.format();
        format.is_valu()
            || format.is_vmem()
            || format == Format::Exp
            || self.opcode == Opcode::PLogicalEnd
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, def) in self.definitions.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{def}")?;
        }
        if !self.definitions.is_empty() {
            write!(f, " = ")?;
        }
        write!(f, "{}", self.opcode)?;
        for (i, op) in self.operands.iter().enumerate() {
            if i == 0 {
                write!(f, " ")?;
            } else {
                write!(f, ", ")?;
            }
            write!(f, "{op}")?;
        }
        match &self.data {
            InstrData::None => {}
            InstrData::Branch {
                targets,
                selection_remove,
            } => {
                if self.opcode == Opcode::PBranch {
                    write!(f, " -> {}", targets[0])?;
                } else {
                    write!(f, " -> {}, {}", targets[0], targets[1])?;
                }
                if *selection_remove {
                    write!(f, " remove")?;
                }
            }
            InstrData::Sopp { block, imm } => {
                if let Some(block) = block {
                    write!(f, " -> {block}")?;
                }
                if *imm != 0 {
                    write!(f, " imm:{imm}")?;
                }
            }
            InstrData::Sdwa { dst_sel, src_sel } => {
                write!(f, " sdwa({dst_sel}, {}, {})", src_sel[0], src_sel[1])?;
            }
            InstrData::Vop3 { opsel } => write!(f, " opsel:{opsel}")?,
            InstrData::Mem {
                offset,
                disable_wqm,
            } => {
                write!(f, " offset:{offset}")?;
                if *disable_wqm {
                    write!(f, " disable_wqm")?;
                }
            }
            InstrData::Export {
                target,
                enabled_mask,
                done,
                valid_mask,
            } => {
                write!(f, " target:{target} en:{enabled_mask}")?;
                if *done {
                    write!(f, " done")?;
                }
                if *valid_mask {
                    write!(f, " vm")?;
                }
            }
            InstrData::Call { arg_regs } => {
                write!(f, " args(")?;
                for (i, reg) in arg_regs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{reg}")?;
                }
                write!(f, ")")?;
            }
            InstrData::Pseudo {
                scratch_sgpr,
                tmp_in_scc,
            } => {
                if let Some(reg) = scratch_sgpr {
                    write!(f, " scratch:{reg}")?;
                }
                if *tmp_in_scc {
                    write!(f, " tmp_in_scc")?;
                }
            }
        }
        Ok(())
    }
}

// ─── Blocks ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// Structural role flags of a block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BlockKind(u16);

impl BlockKind {
    pub const UNIFORM: BlockKind = BlockKind(1 << 0);
    pub const TOP_LEVEL: BlockKind = BlockKind(1 << 1);
    pub const LOOP_PREHEADER: BlockKind = BlockKind(1 << 2);
    pub const LOOP_HEADER: BlockKind = BlockKind(1 << 3);
    pub const LOOP_EXIT: BlockKind = BlockKind(1 << 4);
    pub const CONTINUE: BlockKind = BlockKind(1 << 5);
    pub const BREAK: BlockKind = BlockKind(1 << 6);
    pub const CONTINUE_OR_BREAK: BlockKind = BlockKind(1 << 7);
    pub const BRANCH: BlockKind = BlockKind(1 << 8);
    pub const MERGE: BlockKind = BlockKind(1 << 9);
    pub const INVERT: BlockKind = BlockKind(1 << 10);
    pub const USES_DISCARD: BlockKind = BlockKind(1 << 11);
    pub const DISCARD_EARLY_EXIT: BlockKind = BlockKind(1 << 12);

    pub const NAMES: &'static [(BlockKind, &'static str)] = &[
        (Self::UNIFORM, "uniform"),
        (Self::TOP_LEVEL, "top-level"),
        (Self::LOOP_PREHEADER, "loop-preheader"),
        (Self::LOOP_HEADER, "loop-header"),
        (Self::LOOP_EXIT, "loop-exit"),
        (Self::CONTINUE, "continue"),
        (Self::BREAK, "break"),
        (Self::CONTINUE_OR_BREAK, "continue-or-break"),
        (Self::BRANCH, "branch"),
        (Self::MERGE, "merge"),
        (Self::INVERT, "invert"),
        (Self::USES_DISCARD, "uses-discard"),
        (Self::DISCARD_EARLY_EXIT, "discard-early-exit"),
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(kind, _)| *kind)
    }

    /// Whether any flag of `other` is set.
    pub fn contains(self, other: BlockKind) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: BlockKind) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: BlockKind) {
        self.0 &= !other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for BlockKind {
    type Output = BlockKind;
    fn bitor(self, rhs: BlockKind) -> BlockKind {
        BlockKind(self.0 | rhs.0)
    }
}

impl BitAnd for BlockKind {
    type Output = BlockKind;
    fn bitand(self, rhs: BlockKind) -> BlockKind {
        BlockKind(self.0 & rhs.0)
    }
}

impl BitOrAssign for BlockKind {
    fn bitor_assign(&mut self, rhs: BlockKind) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (kind, name) in Self::NAMES {
            if self.contains(*kind) {
                if !first {
                    write!(f, ", ")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Register pressure in dwords, per bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegisterDemand {
    pub sgpr: i16,
    pub vgpr: i16,
}

impl RegisterDemand {
    pub const fn new(sgpr: i16, vgpr: i16) -> Self {
        Self { sgpr, vgpr }
    }

    pub fn of_class(rc: RegClass) -> Self {
        let size = rc.size() as i16;
        match rc.ty() {
            RegType::Sgpr => Self::new(size, 0),
            RegType::Vgpr => Self::new(0, size),
        }
    }

    /// Raise each bank to at least `other`'s count.
    pub fn update(&mut self, other: RegisterDemand) {
        self.sgpr = self.sgpr.max(other.sgpr);
        self.vgpr = self.vgpr.max(other.vgpr);
    }

    pub fn exceeds(self, other: RegisterDemand) -> bool {
        self.sgpr > other.sgpr || self.vgpr > other.vgpr
    }
}

impl Add for RegisterDemand {
    type Output = RegisterDemand;
    fn add(self, rhs: RegisterDemand) -> RegisterDemand {
        RegisterDemand::new(self.sgpr + rhs.sgpr, self.vgpr + rhs.vgpr)
    }
}

impl Sub for RegisterDemand {
    type Output = RegisterDemand;
    fn sub(self, rhs: RegisterDemand) -> RegisterDemand {
        RegisterDemand::new(self.sgpr - rhs.sgpr, self.vgpr - rhs.vgpr)
    }
}

impl AddAssign for RegisterDemand {
    fn add_assign(&mut self, rhs: RegisterDemand) {
        *self = *self + rhs;
    }
}

impl SubAssign for RegisterDemand {
    fn sub_assign(&mut self, rhs: RegisterDemand) {
        *self = *self - rhs;
    }
}

impl AddAssign<Temp> for RegisterDemand {
    fn add_assign(&mut self, rhs: Temp) {
        *self += RegisterDemand::of_class(rhs.rc());
    }
}

impl SubAssign<Temp> for RegisterDemand {
    fn sub_assign(&mut self, rhs: Temp) {
        *self -= RegisterDemand::of_class(rhs.rc());
    }
}

impl fmt::Display for RegisterDemand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(s: {}, v: {})", self.sgpr, self.vgpr)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub index: BlockId,
    pub kind: BlockKind,
    pub loop_nest_depth: u32,
    pub instructions: Vec<Instruction>,
    pub logical_preds: Vec<BlockId>,
    pub linear_preds: Vec<BlockId>,
    pub logical_succs: Vec<BlockId>,
    pub linear_succs: Vec<BlockId>,
    pub logical_idom: Option<BlockId>,
    pub linear_idom: Option<BlockId>,
    /// Highest demand of any instruction in the block.
    pub register_demand: RegisterDemand,
}

impl Block {
    pub fn new(index: BlockId) -> Self {
        Self {
            index,
            kind: BlockKind::empty(),
            loop_nest_depth: 0,
            instructions: Vec::new(),
            logical_preds: Vec::new(),
            linear_preds: Vec::new(),
            logical_succs: Vec::new(),
            linear_succs: Vec::new(),
            logical_idom: None,
            linear_idom: None,
            register_demand: RegisterDemand::default(),
        }
    }

    /// Index of the first non-phi instruction.
    pub fn first_non_phi(&self) -> usize {
        self.instructions
            .iter()
            .position(|instr| !instr.is_phi())
            .unwrap_or(self.instructions.len())
    }

    /// Index of the `p_logical_end` marker, if present.
    pub fn logical_end(&self) -> Option<usize> {
        self.instructions
            .iter()
            .rposition(|instr| instr.opcode == Opcode::PLogicalEnd)
    }
}

// ─── Program ────────────────────────────────────────────────────────────────

/// Shader stage being compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Fragment,
    Compute,
    Vertex,
    /// Vertex and geometry stages merged into one hardware shader.
    VertexGeometry,
}

impl Stage {
    pub const ALL: &'static [(Stage, &'static str)] = &[
        (Stage::Fragment, "fragment"),
        (Stage::Compute, "compute"),
        (Stage::Vertex, "vertex"),
        (Stage::VertexGeometry, "vertex-geometry"),
    ];

    pub fn name(self) -> &'static str {
        Self::ALL
            .iter()
            .find(|(stage, _)| *stage == self)
            .map_or("unknown", |(_, name)| name)
    }

    pub fn is_merged(self) -> bool {
        self == Stage::VertexGeometry
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Dense table of temp classes. Id 0 is reserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Temps {
    classes: Vec<RegClass>,
}

impl Default for Temps {
    fn default() -> Self {
        Self {
            classes: vec![RegClass::S1],
        }
    }
}

impl Temps {
    pub fn alloc(&mut self, rc: RegClass) -> Temp {
        let id = self.classes.len() as u32;
        self.classes.push(rc);
        Temp::new(id, rc)
    }

    /// Make sure `temp` has a slot, for programs built from text.
    pub fn declare(&mut self, temp: Temp) {
        let id = temp.id() as usize;
        if self.classes.len() <= id {
            self.classes.resize(id + 1, RegClass::V1);
        }
        self.classes[id] = temp.rc();
    }

    pub fn rc(&self, id: u32) -> RegClass {
        self.classes[id as usize]
    }

    pub fn get(&self, id: u32) -> Temp {
        Temp::new(id, self.rc(id))
    }

    /// Number of ids handed out, including the reserved id 0.
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.len() <= 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Statistics {
    /// Instructions emitted by the copy resolver.
    pub copies: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub blocks: Vec<Block>,
    pub temps: Temps,
    pub config: TargetConfig,
    pub stage: Stage,
    pub needs_wqm: bool,
    pub needs_exact: bool,
    pub needs_vcc: bool,
    pub max_reg_demand: RegisterDemand,
    /// Waves per SIMD the demand allows; 0 when it exceeds the register file.
    pub num_waves: u16,
    pub statistics: Statistics,
}

impl Program {
    pub fn new(config: TargetConfig, stage: Stage) -> Self {
        Self {
            blocks: Vec::new(),
            temps: Temps::default(),
            config,
            stage,
            needs_wqm: false,
            needs_exact: false,
            needs_vcc: false,
            max_reg_demand: RegisterDemand::default(),
            num_waves: 0,
            statistics: Statistics::default(),
        }
    }

    pub fn lane_mask(&self) -> RegClass {
        self.config.lane_mask()
    }

    pub fn allocate_tmp(&mut self, rc: RegClass) -> Temp {
        self.temps.alloc(rc)
    }

    pub fn create_and_insert_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block::new(id));
        id
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    pub fn add_logical_edge(&mut self, from: BlockId, to: BlockId) {
        self.block_mut(from).logical_succs.push(to);
        self.block_mut(to).logical_preds.push(from);
    }

    pub fn add_linear_edge(&mut self, from: BlockId, to: BlockId) {
        self.block_mut(from).linear_succs.push(to);
        self.block_mut(to).linear_preds.push(from);
    }

    /// A logical edge that is also a linear edge.
    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        self.add_logical_edge(from, to);
        self.add_linear_edge(from, to);
    }

    pub fn num_instructions(&self) -> usize {
        self.blocks.iter().map(|b| b.instructions.len()).sum()
    }

    /// Recompute both immediate-dominator fields.
    ///
    /// Blocks are laid out so that every forward predecessor has a smaller
    /// index, which lets a single pass intersect along the index order.
    pub fn compute_dominators(&mut self) {
        for kind in [EdgeKind::Logical, EdgeKind::Linear] {
            let mut idom: Vec<Option<BlockId>> = vec![None; self.blocks.len()];
            for i in 0..self.blocks.len() {
                let block = &self.blocks[i];
                let preds = match kind {
                    EdgeKind::Logical => &block.logical_preds,
                    EdgeKind::Linear => &block.linear_preds,
                };
                let mut dom: Option<BlockId> = None;
                for &pred in preds {
                    if pred.index() >= i {
                        continue;
                    }
                    dom = Some(match dom {
                        None => pred,
                        Some(mut a) => {
                            let mut b = pred;
                            while a != b {
                                if a.0 > b.0 {
                                    a = idom[a.index()].unwrap_or(BlockId(0));
                                } else {
                                    b = idom[b.index()].unwrap_or(BlockId(0));
                                }
                            }
                            a
                        }
                    });
                }
                idom[i] = dom;
            }
            for (block, dom) in self.blocks.iter_mut().zip(idom) {
                match kind {
                    EdgeKind::Logical => block.logical_idom = dom,
                    EdgeKind::Linear => block.linear_idom = dom,
                }
            }
        }
    }
}

#[derive(Clone, Copy)]
enum EdgeKind {
    Logical,
    Linear,
}

fn fmt_block_list(f: &mut fmt::Formatter<'_>, blocks: &[BlockId]) -> fmt::Result {
    write!(f, "[")?;
    for (i, b) in blocks.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{b}")?;
    }
    write!(f, "]")
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "  block {} [{}] depth {}:",
            self.index, self.kind, self.loop_nest_depth
        )?;
        write!(f, "    preds: logical ")?;
        fmt_block_list(f, &self.logical_preds)?;
        write!(f, " linear ")?;
        fmt_block_list(f, &self.linear_preds)?;
        writeln!(f)?;
        for instr in &self.instructions {
            writeln!(f, "    {instr}")?;
        }
        write!(f, "    succs: logical ")?;
        fmt_block_list(f, &self.logical_succs)?;
        write!(f, " linear ")?;
        fmt_block_list(f, &self.linear_succs)?;
        writeln!(f)
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "program wave{} {} {}",
            self.config.wave_size, self.config.gfx_level, self.stage
        )?;
        let needs: Vec<&str> = [(self.needs_wqm, "wqm"), (self.needs_exact, "exact")]
            .into_iter()
            .filter_map(|(set, name)| set.then_some(name))
            .collect();
        if !needs.is_empty() {
            write!(f, " needs({})", needs.join(", "))?;
        }
        writeln!(f, " {{")?;
        for block in &self.blocks {
            write!(f, "{block}")?;
        }
        writeln!(f, "}}")
    }
}
