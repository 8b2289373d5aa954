//! Backend core of a shader compiler for SIMT GPUs.
//!
//! [`run_core`] takes a structured program over virtual registers, lowers its
//! divergent phis and makes per-lane predication explicit through `exec`
//! mask code. After register allocation, [`lower_program`] removes the
//! remaining SSA and pseudo-operations.

pub mod builder;
pub mod cfg_builder;
pub mod config;
pub mod copy_resolver;
pub mod error;
pub mod exec_mask;
pub mod ir;
pub mod ir_parse;
pub mod liveness;
pub mod lower_phis;
pub mod lower_to_hw;
pub mod ssa_elimination;
pub mod validate;

use log::debug;

pub use config::{GfxLevel, TargetConfig};
pub use error::CompileError;
pub use exec_mask::ExecMaskTrace;
pub use ir::Program;
pub use liveness::Liveness;

/// Results of [`run_core`] handed to the register allocator.
#[derive(Debug)]
pub struct CoreOutput {
    /// Liveness of the final program, with kill flags already set on it.
    pub liveness: Liveness,
    pub exec_mask: ExecMaskTrace,
}

/// Run the passes that precede register allocation.
pub fn run_core(program: &mut Program) -> Result<CoreOutput, CompileError> {
    validate::validate_ir(program)?;
    debug!("run_core: input\n{program}");

    lower_phis::lower_phis(program)?;
    debug!("run_core: after lower_phis\n{program}");

    // use-before-def is reported here, before any mask code exists
    liveness::live_var_analysis(program)?;

    let exec_mask = exec_mask::insert_exec_mask(program)?;
    debug!("run_core: after exec_mask\n{program}");

    let liveness = liveness::live_var_analysis(program)?;
    debug!(
        "run_core: max demand {}, {} waves",
        program.max_reg_demand, program.num_waves
    );
    Ok(CoreOutput {
        liveness,
        exec_mask,
    })
}

/// Lower an allocated program to hardware instructions.
pub fn lower_program(program: &mut Program) -> Result<(), CompileError> {
    ssa_elimination::ssa_elimination(program)?;
    debug!("lower_program: after ssa_elimination\n{program}");

    lower_to_hw::lower_to_hw_instr(program)?;
    debug!("lower_program: after lower_to_hw\n{program}");

    validate::validate_lowered(program)
}
