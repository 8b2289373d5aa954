//! Target configuration: hardware generation, wave size and register-file limits.

use std::fmt;

use log::warn;

use crate::ir::RegClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GfxLevel {
    Gfx8,
    Gfx9,
    Gfx10,
}

impl GfxLevel {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "gfx8" => Some(Self::Gfx8),
            "gfx9" => Some(Self::Gfx9),
            "gfx10" => Some(Self::Gfx10),
            _ => None,
        }
    }
}

impl fmt::Display for GfxLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gfx8 => write!(f, "gfx8"),
            Self::Gfx9 => write!(f, "gfx9"),
            Self::Gfx10 => write!(f, "gfx10"),
        }
    }
}

/// Everything the core needs to know about the hardware it compiles for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetConfig {
    pub gfx_level: GfxLevel,
    /// Lanes per wave: 32 or 64. Wave32 exists from GFX10 on.
    pub wave_size: u8,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            gfx_level: GfxLevel::Gfx10,
            wave_size: 64,
        }
    }
}

impl TargetConfig {
    pub fn new(gfx_level: GfxLevel, wave_size: u8) -> Self {
        assert!(
            wave_size == 64 || (wave_size == 32 && gfx_level >= GfxLevel::Gfx10),
            "unsupported wave size {wave_size} on {gfx_level}"
        );
        Self {
            gfx_level,
            wave_size,
        }
    }

    /// Default configuration with `SIMTC_GFX_LEVEL` and `SIMTC_WAVE_SIZE` applied.
    ///
    /// Unknown or inconsistent values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(level) = var("SIMTC_GFX_LEVEL") {
            match GfxLevel::from_name(level.trim()) {
                Some(gfx_level) => config.gfx_level = gfx_level,
                None => warn!("ignoring unknown SIMTC_GFX_LEVEL={level:?}"),
            }
        }
        if let Some(size) = var("SIMTC_WAVE_SIZE") {
            match size.trim() {
                "64" => config.wave_size = 64,
                "32" if config.gfx_level >= GfxLevel::Gfx10 => config.wave_size = 32,
                _ => warn!("ignoring SIMTC_WAVE_SIZE={size:?} for {}", config.gfx_level),
            }
        }
        if config.gfx_level < GfxLevel::Gfx10 {
            config.wave_size = 64;
        }
        config
    }

    pub fn wave64(&self) -> bool {
        self.wave_size == 64
    }

    /// Register class of a one-bit-per-lane value.
    pub fn lane_mask(&self) -> RegClass {
        if self.wave64() { RegClass::S2 } else { RegClass::S1 }
    }

    pub fn has_native_swap(&self) -> bool {
        self.gfx_level >= GfxLevel::Gfx9
    }

    pub fn has_pack_f16(&self) -> bool {
        self.gfx_level >= GfxLevel::Gfx9
    }

    /// Largest VGPR chunk a single move may cover, in bytes.
    pub fn max_vgpr_copy_bytes(&self) -> u8 {
        if self.gfx_level >= GfxLevel::Gfx10 { 8 } else { 4 }
    }

    // ─── Register file ──────────────────────────────────────────────────────

    pub fn physical_sgprs(&self) -> u16 {
        if self.gfx_level >= GfxLevel::Gfx10 { 5120 } else { 800 }
    }

    pub fn physical_vgprs(&self) -> u16 {
        match (self.gfx_level, self.wave_size) {
            (GfxLevel::Gfx10, 32) => 1024,
            (GfxLevel::Gfx10, _) => 512,
            _ => 256,
        }
    }

    pub fn sgpr_alloc_granule(&self) -> u16 {
        if self.gfx_level >= GfxLevel::Gfx10 { 128 } else { 16 }
    }

    pub fn vgpr_alloc_granule(&self) -> u16 {
        match (self.gfx_level, self.wave_size) {
            (GfxLevel::Gfx10, 32) => 16,
            (GfxLevel::Gfx10, _) => 8,
            _ => 4,
        }
    }

    /// Addressable SGPRs per wave, excluding vcc and other specials.
    pub fn sgpr_limit(&self) -> u16 {
        if self.gfx_level >= GfxLevel::Gfx10 { 106 } else { 102 }
    }

    pub fn vgpr_limit(&self) -> u16 {
        256
    }

    pub fn max_waves_per_simd(&self) -> u16 {
        if self.gfx_level >= GfxLevel::Gfx10 { 20 } else { 10 }
    }

    /// SGPRs reserved on top of the addressable ones.
    pub fn extra_sgprs(&self, needs_vcc: bool) -> u16 {
        if self.gfx_level >= GfxLevel::Gfx10 || !needs_vcc {
            0
        } else {
            2
        }
    }
}
