//! Textual parser for the program format.
//!
//! Parses the text produced by `Program`'s `Display` impl back into a
//! [`Program`]. Intended for tests and for replaying debug dumps.

use chumsky::prelude::*;
use smallvec::SmallVec;

use crate::config::{GfxLevel, TargetConfig};
use crate::ir::{
    Block, BlockId, BlockKind, Definition, InstrData, Instruction, Opcode, Operand, OperandValue,
    PhysReg, Program, RegClass, RegType, SdwaSel, Stage, Temp,
};

type Extra<'src> = extra::Err<Rich<'src, char>>;

fn ws<'src>() -> impl Parser<'src, &'src str, (), Extra<'src>> + Clone {
    any()
        .filter(|c: &char| c.is_whitespace())
        .repeated()
        .ignored()
}

/// Horizontal whitespace only (spaces and tabs, not newlines).
fn hws<'src>() -> impl Parser<'src, &'src str, (), Extra<'src>> + Clone {
    any()
        .filter(|c: &char| *c == ' ' || *c == '\t')
        .repeated()
        .ignored()
}

fn uint32<'src>() -> impl Parser<'src, &'src str, u32, Extra<'src>> + Clone {
    text::int::<_, Extra<'_>>(10).try_map(|s: &str, span| {
        s.parse::<u32>()
            .map_err(|e| Rich::custom(span, format!("bad integer {s}: {e}")))
    })
}

fn uint64<'src>() -> impl Parser<'src, &'src str, u64, Extra<'src>> + Clone {
    let hex = just("0x")
        .ignore_then(text::int::<_, Extra<'_>>(16))
        .try_map(|s: &str, span| {
            u64::from_str_radix(s, 16)
                .map_err(|e| Rich::custom(span, format!("bad hex constant {s}: {e}")))
        });
    let dec = text::int::<_, Extra<'_>>(10).try_map(|s: &str, span| {
        s.parse::<u64>()
            .map_err(|e| Rich::custom(span, format!("bad integer {s}: {e}")))
    });
    hex.or(dec)
}

/// A dash-separated lowercase word, as used for stages and block kinds.
fn word<'src>() -> impl Parser<'src, &'src str, &'src str, Extra<'src>> + Clone {
    any()
        .filter(|c: &char| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .repeated()
        .at_least(1)
        .to_slice()
}

fn block_id<'src>() -> impl Parser<'src, &'src str, BlockId, Extra<'src>> + Clone {
    just("b").ignore_then(uint32()).map(BlockId)
}

fn block_list<'src>() -> impl Parser<'src, &'src str, Vec<BlockId>, Extra<'src>> + Clone {
    block_id()
        .separated_by(just(",").padded_by(hws()))
        .collect::<Vec<_>>()
        .delimited_by(just("["), just("]"))
}

/// `s2`, `v1`, `v2b`, `lv1`, and `s2b` for sub-dword constants.
fn reg_class<'src>() -> impl Parser<'src, &'src str, RegClass, Extra<'src>> + Clone {
    just("l")
        .or_not()
        .then(choice((just('s').to(RegType::Sgpr), just('v').to(RegType::Vgpr))))
        .then(uint32())
        .then(just("b").or_not())
        .try_map(|(((linear, ty), n), subdword), span| {
            let bytes = if subdword.is_some() { n } else { n * 4 };
            if bytes == 0 || bytes > 255 {
                return Err(Rich::custom(span, format!("bad register class size {n}")));
            }
            let rc = RegClass::new(ty, bytes as u8);
            Ok(if linear.is_some() { rc.as_linear() } else { rc })
        })
}

fn phys_reg<'src>() -> impl Parser<'src, &'src str, PhysReg, Extra<'src>> + Clone {
    let named = choice((
        just("vcc").to(PhysReg::VCC),
        just("m0").to(PhysReg::M0),
        just("exec").to(PhysReg::EXEC),
        just("scc").to(PhysReg::SCC),
    ));
    let numbered = choice((
        just("s").ignore_then(uint32()).map(|n| PhysReg::sgpr(n as u16)),
        just("v").ignore_then(uint32()).map(|n| PhysReg::vgpr(n as u16)),
        just("r").ignore_then(uint32()).map(|n| PhysReg::new(n as u16)),
    ));
    named
        .or(numbered)
        .then(just(".b").ignore_then(uint32()).or_not())
        .map(|(reg, byte)| reg.advance(byte.unwrap_or(0) as i32))
}

fn operand<'src>() -> impl Parser<'src, &'src str, Operand, Extra<'src>> + Clone {
    let temp = just("%")
        .ignore_then(uint32())
        .then_ignore(just(":"))
        .then(reg_class())
        .map(|(id, rc)| Operand::temp(Temp::new(id, rc)));
    let constant = just("#")
        .ignore_then(uint64())
        .then_ignore(just(":"))
        .then(reg_class())
        .map(|(value, rc)| {
            let mut op = Operand::constant(value, rc.bytes());
            op.rc = rc;
            op
        });
    let undef = just("undef:").ignore_then(reg_class()).map(Operand::undef);
    let fixed = reg_class().map(|rc| {
        let mut op = Operand::undef(rc);
        op.value = OperandValue::Fixed;
        op
    });

    choice((temp, constant, undef, fixed))
        .then(just("@").ignore_then(phys_reg()).or_not())
        .then(
            choice((
                just("(first-kill)").to((true, true)),
                just("(kill)").to((true, false)),
            ))
            .or_not(),
        )
        .then(just("(late-kill)").or_not())
        .map(|(((mut op, reg), kill), late)| {
            op.reg = reg;
            if let Some((kill, first_kill)) = kill {
                op.kill = kill;
                op.first_kill = first_kill;
            }
            op.late_kill = late.is_some();
            op
        })
}

fn definition<'src>() -> impl Parser<'src, &'src str, Definition, Extra<'src>> + Clone {
    let temp = just("%")
        .ignore_then(uint32())
        .then_ignore(just(":"))
        .then(reg_class())
        .map(|(id, rc)| Definition::temp(Temp::new(id, rc)));
    let bare = reg_class().map(|rc| Definition {
        temp: None,
        rc,
        reg: None,
        kill: false,
    });
    temp.or(bare)
        .then(just("@").ignore_then(phys_reg()).or_not())
        .then(just("(dead)").or_not())
        .map(|((mut def, reg), dead)| {
            def.reg = reg;
            def.kill = dead.is_some();
            def
        })
}

fn opcode<'src>() -> impl Parser<'src, &'src str, Opcode, Extra<'src>> + Clone {
    text::ident::<_, Extra<'_>>().try_map(|name: &str, span| {
        Opcode::from_name(name).ok_or_else(|| Rich::custom(span, format!("unknown opcode {name}")))
    })
}

fn sdwa_sel<'src>() -> impl Parser<'src, &'src str, SdwaSel, Extra<'src>> + Clone {
    just("b")
        .ignore_then(uint32())
        .then_ignore(just("w"))
        .then(uint32())
        .map(|(offset, size)| SdwaSel::new(offset, size))
}

/// Trailing payload words after the operand list.
#[derive(Debug, Clone)]
enum AstAttr {
    Targets(Vec<BlockId>),
    Remove,
    Imm(u16),
    Sdwa([SdwaSel; 3]),
    Opsel(u8),
    Offset(u16),
    DisableWqm,
    Target(u8),
    Enabled(u8),
    Done,
    ValidMask,
    Args(Vec<PhysReg>),
    Scratch(PhysReg),
    TmpInScc,
}

fn attr<'src>() -> impl Parser<'src, &'src str, AstAttr, Extra<'src>> + Clone {
    let targets = just("->")
        .ignore_then(hws())
        .ignore_then(
            block_id()
                .separated_by(just(",").padded_by(hws()))
                .at_least(1)
                .collect::<Vec<_>>(),
        )
        .map(AstAttr::Targets);
    let sdwa = just("sdwa(")
        .ignore_then(sdwa_sel())
        .then_ignore(just(",").padded_by(hws()))
        .then(sdwa_sel())
        .then_ignore(just(",").padded_by(hws()))
        .then(sdwa_sel())
        .then_ignore(just(")"))
        .map(|((dst, s0), s1)| AstAttr::Sdwa([dst, s0, s1]));
    let args = just("args(")
        .ignore_then(
            phys_reg()
                .separated_by(just(",").padded_by(hws()))
                .collect::<Vec<_>>(),
        )
        .then_ignore(just(")"))
        .map(AstAttr::Args);

    choice((
        targets,
        just("remove").to(AstAttr::Remove),
        just("imm:").ignore_then(uint32()).map(|v| AstAttr::Imm(v as u16)),
        sdwa,
        just("opsel:").ignore_then(uint32()).map(|v| AstAttr::Opsel(v as u8)),
        just("offset:").ignore_then(uint32()).map(|v| AstAttr::Offset(v as u16)),
        just("disable_wqm").to(AstAttr::DisableWqm),
        just("target:").ignore_then(uint32()).map(|v| AstAttr::Target(v as u8)),
        just("en:").ignore_then(uint32()).map(|v| AstAttr::Enabled(v as u8)),
        just("done").to(AstAttr::Done),
        just("vm").to(AstAttr::ValidMask),
        args,
        just("scratch:").ignore_then(phys_reg()).map(AstAttr::Scratch),
        just("tmp_in_scc").to(AstAttr::TmpInScc),
    ))
}

#[derive(Debug, Clone)]
struct AstInst {
    defs: Vec<Definition>,
    opcode: Opcode,
    ops: Vec<Operand>,
    attrs: Vec<AstAttr>,
}

/// Parse an instruction line.
/// Format: `[defs =] opcode [operands] [payload...]`
fn instruction<'src>() -> impl Parser<'src, &'src str, AstInst, Extra<'src>> + Clone {
    // Use hws() so instructions don't span across lines.
    let def_part = definition()
        .separated_by(just(",").padded_by(hws()))
        .at_least(1)
        .collect::<Vec<_>>()
        .then_ignore(hws().then(just("=")).then(hws()));

    let op_part = hws()
        .ignore_then(
            operand()
                .separated_by(just(",").padded_by(hws()))
                .at_least(1)
                .collect::<Vec<_>>(),
        )
        .or_not();

    let attrs = hws().ignore_then(attr()).repeated().collect::<Vec<_>>();

    def_part
        .or_not()
        .then(opcode())
        .then(op_part)
        .then(attrs)
        .map(|(((defs, opcode), ops), attrs)| AstInst {
            defs: defs.unwrap_or_default(),
            opcode,
            ops: ops.unwrap_or_default(),
            attrs,
        })
}

#[derive(Debug, Clone)]
struct AstBlock {
    id: BlockId,
    kind: Vec<&'static str>,
    depth: u32,
    logical_preds: Vec<BlockId>,
    linear_preds: Vec<BlockId>,
    insts: Vec<AstInst>,
    logical_succs: Vec<BlockId>,
    linear_succs: Vec<BlockId>,
}

fn block_kind_name<'src>() -> impl Parser<'src, &'src str, &'static str, Extra<'src>> + Clone {
    word().try_map(|name: &str, span| {
        BlockKind::NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(_, n)| *n)
            .ok_or_else(|| Rich::custom(span, format!("unknown block kind {name}")))
    })
}

fn edges<'src>(
    label: &'static str,
) -> impl Parser<'src, &'src str, (Vec<BlockId>, Vec<BlockId>), Extra<'src>> + Clone {
    just(label)
        .then(hws())
        .ignore_then(just("logical").then(hws()))
        .ignore_then(block_list())
        .then_ignore(hws().then(just("linear")).then(hws()))
        .then(block_list())
}

fn block<'src>() -> impl Parser<'src, &'src str, AstBlock, Extra<'src>> + Clone {
    let kinds = block_kind_name()
        .separated_by(just(",").padded_by(hws()))
        .collect::<Vec<_>>()
        .delimited_by(just("["), just("]"));

    just("block")
        .padded_by(ws())
        .ignore_then(block_id())
        .then_ignore(hws())
        .then(kinds)
        .then_ignore(hws().then(just("depth")).then(hws()))
        .then(uint32())
        .then_ignore(just(":").then(ws()))
        .then(edges("preds:"))
        .then(instruction().padded_by(ws()).repeated().collect::<Vec<_>>())
        .then_ignore(ws())
        .then(edges("succs:"))
        .map(
            |(((((id, kind), depth), (logical_preds, linear_preds)), insts), succs)| AstBlock {
                id,
                kind,
                depth,
                logical_preds,
                linear_preds,
                insts,
                logical_succs: succs.0,
                linear_succs: succs.1,
            },
        )
}

#[derive(Debug, Clone)]
struct AstProgram {
    wave_size: u32,
    gfx_level: GfxLevel,
    stage: Stage,
    needs: Vec<&'static str>,
    blocks: Vec<AstBlock>,
}

fn program<'src>() -> impl Parser<'src, &'src str, AstProgram, Extra<'src>> + Clone {
    let gfx = word().try_map(|name: &str, span| {
        GfxLevel::from_name(name)
            .ok_or_else(|| Rich::custom(span, format!("unknown hardware generation {name}")))
    });
    let stage = word().try_map(|name: &str, span| {
        Stage::ALL
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(stage, _)| *stage)
            .ok_or_else(|| Rich::custom(span, format!("unknown stage {name}")))
    });
    let needs = just("needs(")
        .ignore_then(
            choice((just("wqm").to("wqm"), just("exact").to("exact")))
                .separated_by(just(",").padded_by(hws()))
                .collect::<Vec<_>>(),
        )
        .then_ignore(just(")"));

    just("program")
        .padded_by(ws())
        .ignore_then(just("wave"))
        .ignore_then(uint32())
        .then_ignore(hws())
        .then(gfx)
        .then_ignore(hws())
        .then(stage)
        .then(hws().ignore_then(needs).or_not())
        .then_ignore(hws().then(just("{")).then(ws()))
        .then(block().padded_by(ws()).repeated().collect::<Vec<_>>())
        .then_ignore(ws().then(just("}")).then(ws()))
        .then_ignore(end())
        .map(|((((wave_size, gfx_level), stage), needs), blocks)| AstProgram {
            wave_size,
            gfx_level,
            stage,
            needs: needs.unwrap_or_default(),
            blocks,
        })
}

// ─── Resolution ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ParseError {
    pub message: String,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseError {}

/// Parse the program text format into a [`Program`].
pub fn parse_program(input: &str) -> Result<Program, ParseError> {
    let result = program().parse(input);
    let ast = result.into_result().map_err(|errs| {
        let msgs: Vec<String> = errs.into_iter().map(|e| format!("{e}")).collect();
        ParseError {
            message: msgs.join("\n"),
        }
    })?;

    resolve(ast)
}

fn resolve(ast: AstProgram) -> Result<Program, ParseError> {
    let wave_size = match ast.wave_size {
        64 => 64,
        32 if ast.gfx_level >= GfxLevel::Gfx10 => 32,
        other => {
            return Err(ParseError {
                message: format!("unsupported wave size {other} on {}", ast.gfx_level),
            });
        }
    };
    let mut program = Program::new(TargetConfig::new(ast.gfx_level, wave_size), ast.stage);
    program.needs_wqm = ast.needs.contains(&"wqm");
    program.needs_exact = ast.needs.contains(&"exact");

    for (position, ast_block) in ast.blocks.into_iter().enumerate() {
        if ast_block.id.index() != position {
            return Err(ParseError {
                message: format!("block {} listed at position {position}", ast_block.id),
            });
        }
        let mut block = Block::new(ast_block.id);
        for name in ast_block.kind {
            if let Some(kind) = BlockKind::from_name(name) {
                block.kind |= kind;
            }
        }
        block.loop_nest_depth = ast_block.depth;
        block.logical_preds = ast_block.logical_preds;
        block.linear_preds = ast_block.linear_preds;
        block.logical_succs = ast_block.logical_succs;
        block.linear_succs = ast_block.linear_succs;

        for ast_inst in ast_block.insts {
            for def in &ast_inst.defs {
                if let Some(temp) = def.temp {
                    program.temps.declare(temp);
                }
            }
            for op in &ast_inst.ops {
                if let Some(temp) = op.temp_value() {
                    program.temps.declare(temp);
                }
            }
            block.instructions.push(resolve_inst(ast_inst)?);
        }
        program.blocks.push(block);
    }

    let num_blocks = program.blocks.len();
    for block in &program.blocks {
        let edges = block
            .logical_preds
            .iter()
            .chain(&block.linear_preds)
            .chain(&block.logical_succs)
            .chain(&block.linear_succs);
        for other in edges {
            if other.index() >= num_blocks {
                return Err(ParseError {
                    message: format!("{} refers to missing block {other}", block.index),
                });
            }
        }
    }

    program.compute_dominators();
    Ok(program)
}

fn resolve_inst(ast: AstInst) -> Result<Instruction, ParseError> {
    let mut targets = Vec::new();
    let mut selection_remove = false;
    let mut imm = 0u16;
    let mut data = InstrData::None;
    let mut mem: Option<(u16, bool)> = None;
    let mut export: Option<(u8, u8, bool, bool)> = None;
    let mut scratch: Option<(Option<PhysReg>, bool)> = None;

    for attr in ast.attrs {
        match attr {
            AstAttr::Targets(blocks) => targets = blocks,
            AstAttr::Remove => selection_remove = true,
            AstAttr::Imm(v) => imm = v,
            AstAttr::Sdwa([dst_sel, s0, s1]) => {
                data = InstrData::Sdwa {
                    dst_sel,
                    src_sel: [s0, s1],
                }
            }
            AstAttr::Opsel(opsel) => data = InstrData::Vop3 { opsel },
            AstAttr::Offset(offset) => mem = Some((offset, mem.is_some_and(|m| m.1))),
            AstAttr::DisableWqm => {
                let offset = mem.map_or(0, |m| m.0);
                mem = Some((offset, true));
            }
            AstAttr::Target(target) => export = Some((target, 0, false, false)),
            AstAttr::Enabled(mask) => {
                if let Some(e) = export.as_mut() {
                    e.1 = mask;
                }
            }
            AstAttr::Done => {
                if let Some(e) = export.as_mut() {
                    e.2 = true;
                }
            }
            AstAttr::ValidMask => {
                if let Some(e) = export.as_mut() {
                    e.3 = true;
                }
            }
            AstAttr::Args(regs) => {
                data = InstrData::Call {
                    arg_regs: SmallVec::from_vec(regs),
                }
            }
            AstAttr::Scratch(reg) => scratch = Some((Some(reg), scratch.is_some_and(|s| s.1))),
            AstAttr::TmpInScc => scratch = Some((scratch.and_then(|s| s.0), true)),
        }
    }

    let mut instr = Instruction::new(ast.opcode, ast.defs, ast.ops);
    if ast.opcode.is_branch() {
        let Some(&first) = targets.first() else {
            return Err(ParseError {
                message: format!("{} without a target", ast.opcode),
            });
        };
        let second = targets.get(1).copied().unwrap_or_default();
        instr.data = InstrData::Branch {
            targets: [first, second],
            selection_remove,
        };
        return Ok(instr);
    }
    if let InstrData::Sopp { .. } = instr.data {
        instr.data = InstrData::Sopp {
            block: targets.first().copied(),
            imm,
        };
        return Ok(instr);
    }
    if let Some((offset, disable_wqm)) = mem {
        data = InstrData::Mem {
            offset,
            disable_wqm,
        };
    }
    if let Some((target, enabled_mask, done, valid_mask)) = export {
        data = InstrData::Export {
            target,
            enabled_mask,
            done,
            valid_mask,
        };
    }
    if let Some((scratch_sgpr, tmp_in_scc)) = scratch {
        data = InstrData::Pseudo {
            scratch_sgpr,
            tmp_in_scc,
        };
    }
    instr.data = data;
    Ok(instr)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIAMOND: &str = r#"
program wave64 gfx10 fragment needs(wqm, exact) {
  block b0 [top-level, branch] depth 0:
    preds: logical [] linear []
    %1:s2 = p_startpgm
    p_logical_start
    %2:v1 = v_mov_b32 #0x2a:s1
    %3:s2@vcc = v_cmp_lt_f32 #0x0:s1, %2:v1
    p_logical_end
    p_cbranch_z %3:s2 -> b0, b0
    succs: logical [b1, b2] linear [b1, b2]
  block b1 [uniform] depth 0:
    preds: logical [b0] linear [b0]
    p_logical_start
    %4:v1 = buffer_load_dword %1:s2 offset:16 disable_wqm
    p_logical_end
    p_branch -> b2
    succs: logical [b2] linear [b2]
  block b2 [top-level, merge] depth 0:
    preds: logical [b0, b1] linear [b0, b1]
    %5:v1 = p_phi %2:v1, %4:v1(kill)
    p_logical_start
    exp undef:v1, %5:v1(first-kill) target:9 en:1 done vm
    s_endpgm
    succs: logical [] linear []
}
"#;

    #[test]
    fn parse_small_program() {
        let program = parse_program(DIAMOND).unwrap();
        assert_eq!(program.blocks.len(), 3);
        assert!(program.needs_wqm && program.needs_exact);
        assert_eq!(program.stage, Stage::Fragment);
        let b0 = &program.blocks[0];
        assert_eq!(b0.instructions.len(), 6);
        assert!(b0.kind.contains(BlockKind::BRANCH));
        assert_eq!(b0.instructions[3].definitions[0].reg, Some(PhysReg::VCC));
        assert_eq!(b0.instructions[2].operands[0].constant_value(), Some(42));
        assert!(program.blocks[1].instructions[1].disables_wqm());
        assert_eq!(program.temps.rc(5), RegClass::V1);
        assert_eq!(program.blocks[2].logical_idom, Some(BlockId(0)));
    }

    #[test]
    fn round_trip_program() {
        let program = parse_program(DIAMOND).unwrap();
        let text1 = format!("{program}");
        let reparsed = parse_program(&text1).unwrap();
        let text2 = format!("{reparsed}");

        assert_eq!(
            text1, text2,
            "round trip failed:\n--- original ---\n{text1}\n--- reparsed ---\n{text2}"
        );
        assert_eq!(program.blocks, reparsed.blocks);
    }

    #[test]
    fn round_trip_registers_and_payloads() {
        let input = r#"
program wave32 gfx9 compute {
  block b0 [top-level] depth 0:
    preds: logical [] linear []
    lv1@v3 = p_parallelcopy v1@v7.b2(late-kill) scratch:s5 tmp_in_scc
    v2b@v0.b2 = v_mov_b32 v2b@v1(kill) sdwa(b2w2, b0w2, b0w4)
    s2@s0 = s_swappc_b64 s2@s4, v1@v9 args(v0)
    s_cbranch_scc0 -> b0 imm:3
    s_endpgm
    succs: logical [] linear []
}
"#;
        let err = parse_program(input).unwrap_err();
        assert!(err.message.contains("wave size"), "{err}");

        let input = input.replace("wave32 gfx9", "wave32 gfx10");
        let program = parse_program(&input).unwrap();
        let text1 = format!("{program}");
        let text2 = format!("{}", parse_program(&text1).unwrap());
        assert_eq!(
            text1, text2,
            "round trip failed:\n--- original ---\n{text1}\n--- reparsed ---\n{text2}"
        );

        let copy = &program.blocks[0].instructions[0];
        assert!(copy.definitions[0].rc.is_linear_vgpr());
        assert_eq!(copy.operands[0].reg, Some(PhysReg::vgpr(7).advance(2)));
        assert_eq!(copy.copy_scratch(), (Some(PhysReg::sgpr(5)), true));
        assert_eq!(
            program.blocks[0].instructions[3].sopp_block(),
            Some(BlockId(0))
        );
    }

    #[test]
    fn parse_error_unknown_opcode() {
        let input = r#"
program wave64 gfx10 compute {
  block b0 [] depth 0:
    preds: logical [] linear []
    s_frobnicate
    succs: logical [] linear []
}
"#;
        assert!(parse_program(input).is_err());
    }

    #[test]
    fn parse_error_malformed_program() {
        assert!(parse_program("not a program").is_err());
    }
}
