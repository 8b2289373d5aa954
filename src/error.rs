//! Fatal compile errors.
//!
//! Every variant is either an input-contract violation (the upstream
//! instruction selector handed over a malformed program), an unsupported
//! construct, or a broken output contract. Register pressure above the
//! hardware limit is not an error; it is reported as data.

use std::fmt;

use crate::ir::{BlockId, Opcode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// Temps that are live into the entry block, i.e. read without a reaching definition.
    UseBeforeDef { temps: Vec<u32> },
    PhiOperandCount {
        block: BlockId,
        instr: usize,
        expected: usize,
        found: usize,
    },
    ModeUnsatisfiable {
        block: BlockId,
        instr: usize,
        opcode: Opcode,
        reason: &'static str,
    },
    InvalidCfg { block: BlockId, reason: String },
    NotImplemented { block: BlockId, what: String },
    MissingPhysReg { block: BlockId, instr: usize },
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UseBeforeDef { temps } => {
                write!(f, "temps used before definition:")?;
                for id in temps {
                    write!(f, " %{id}")?;
                }
                Ok(())
            }
            Self::PhiOperandCount {
                block,
                instr,
                expected,
                found,
            } => write!(
                f,
                "{block}[{instr}]: phi has {found} operands but the block has {expected} predecessors"
            ),
            Self::ModeUnsatisfiable {
                block,
                instr,
                opcode,
                reason,
            } => write!(f, "{block}[{instr}]: {opcode} cannot be satisfied: {reason}"),
            Self::InvalidCfg { block, reason } => write!(f, "{block}: invalid control flow: {reason}"),
            Self::NotImplemented { block, what } => write!(f, "{block}: not implemented: {what}"),
            Self::MissingPhysReg { block, instr } => {
                write!(f, "{block}[{instr}]: operand or definition without a physical register")
            }
        }
    }
}

impl std::error::Error for CompileError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_block_and_instruction() {
        let err = CompileError::PhiOperandCount {
            block: BlockId(3),
            instr: 1,
            expected: 2,
            found: 1,
        };
        assert_eq!(
            err.to_string(),
            "b3[1]: phi has 1 operands but the block has 2 predecessors"
        );

        let err = CompileError::UseBeforeDef { temps: vec![4, 9] };
        assert_eq!(err.to_string(), "temps used before definition: %4 %9");
    }
}
