//! Per-opcode clock-cycle estimation for the 8086/8088.
//!
//! Every case in [`estimate_instruction_clocks`] computes its answer
//! and returns; there is no fallthrough between `match` arms the way
//! a C `switch` permits, which is precisely the bug class this module
//! exists to avoid.

use std::fmt;

use crate::catalog::Op;
use crate::instr::{Instruction, InstructionFlags};
use crate::operand::Operand;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcType {
    I8086,
    I8088,
}

/// The dynamic facts about one executed (or about-to-execute)
/// instruction that the cost model needs beyond what's in the
/// `Instruction` itself.
#[derive(Debug, Clone, Copy)]
pub struct InstructionMetadata {
    pub instr: Instruction,
    pub op0_val: u32,
    pub op1_val: u32,
    pub cond_action_happened: bool,
    pub rep_count: u32,
    pub wait_n: u32,
    pub wide_transfer_cnt: u32,
    pub wide_odd_transfer_cnt: u32,
}

impl InstructionMetadata {
    pub fn new(instr: Instruction) -> Self {
        InstructionMetadata {
            instr,
            op0_val: 0,
            op1_val: 0,
            cond_action_happened: false,
            rep_count: 0,
            wait_n: 0,
            wide_transfer_cnt: 0,
            wide_odd_transfer_cnt: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockError {
    /// Asked for the cost of a raw, unabsorbed prefix instruction.
    RawPrefix,
    /// No cost rule is registered for this opcode yet.
    Unimplemented(Op),
}

impl fmt::Display for ClockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClockError::RawPrefix => write!(f, "cannot estimate clocks for a raw prefix instruction"),
            ClockError::Unimplemented(op) => write!(f, "no clock cost rule for {op}"),
        }
    }
}

impl std::error::Error for ClockError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Reg,
    Mem,
    Imm,
    CsIp,
    None,
}

fn shape(op: &Operand) -> Shape {
    match op {
        Operand::None => Shape::None,
        Operand::Reg(_) => Shape::Reg,
        Operand::Mem(_) => Shape::Mem,
        Operand::Imm(_) => Shape::Imm,
        Operand::CsIp(_) => Shape::CsIp,
    }
}

/// Effective-address computation cost for a memory operand; zero for
/// any other operand shape.
pub fn estimate_ea_clocks(op: &Operand) -> u32 {
    let Operand::Mem(mem) = op else { return 0 };
    use crate::operand::EaBase::*;
    let base_cost: u32 = match mem.base {
        Direct => 6,
        BpDi | BxSi => 7,
        BpSi | BxDi => 8,
        Si | Di | Bp | Bx => 5,
    };
    base_cost.saturating_add(if mem.disp != 0 && mem.base != Direct { 4 } else { 0 })
}

/// A per-opcode cost rule, looked up by `Op` and resolved against the
/// instruction's actual operand shapes. Every rule variant resolves
/// independently — there is no shared fallthrough between cases, the
/// bug class `4.6` calls out in the original timing table.
#[derive(Debug, Clone, Copy)]
enum CostRule {
    /// Fixed cost regardless of operands.
    Const(u32),
    /// The common `reg,reg` / `reg,imm` / `reg,mem` / `mem,reg` /
    /// `mem,imm` family shared by MOV and the ALU group.
    RegRegOrRegImmOrRegMem {
        reg_reg: u32,
        reg_imm: u32,
        reg_mem: u32,
        mem_reg: u32,
        mem_imm: u32,
    },
    /// `PUSH`/`POP`: distinct costs for segment registers, general
    /// registers, and memory.
    PushPop { segreg: u32, reg: u32, mem: u32 },
    /// Shift/rotate group: fixed count of 1 vs. count in `CL`, each
    /// with a register and a memory form.
    ShiftGroup { reg_by1: u32, reg_by_cl: u32, mem_by1: u32, mem_by_cl: u32 },
    /// `base + per_iter * rep_count` under `REP`, else a fixed
    /// single-iteration cost.
    RepLinear { base: u32, per_iter: u32, single: u32 },
    /// Conditional branch/loop: taken vs. not-taken cost.
    CondPair { taken: u32, not_taken: u32 },
}

fn resolve_reg_reg_family(rule: CostRule, s0: Shape, s1: Shape, ea: u32) -> u32 {
    let CostRule::RegRegOrRegImmOrRegMem { reg_reg, reg_imm, reg_mem, mem_reg, mem_imm } = rule
    else {
        unreachable!("resolve_reg_reg_family called with a non-matching rule")
    };
    match (s0, s1) {
        (Shape::Reg, Shape::Reg) => reg_reg,
        (Shape::Reg, Shape::Imm) => reg_imm,
        (Shape::Reg, Shape::Mem) => reg_mem + ea,
        (Shape::Mem, Shape::Reg) => mem_reg + ea,
        (Shape::Mem, Shape::Imm) => mem_imm + ea,
        _ => reg_imm,
    }
}

const ALU_RULE: CostRule = CostRule::RegRegOrRegImmOrRegMem {
    reg_reg: 3,
    reg_imm: 4,
    reg_mem: 9,
    mem_reg: 16,
    mem_imm: 17,
};

/// Computes the clock cost of one instruction. `meta.instr` must be a
/// fully-resolved (non-prefix) instruction; raw `Lock`/`Rep`/`Segment`
/// instructions are a usage error, not a zero-cost answer.
pub fn estimate_instruction_clocks(
    meta: &InstructionMetadata,
    proc: ProcType,
) -> Result<u32, ClockError> {
    let instr = &meta.instr;
    if instr.op.is_prefix() {
        return Err(ClockError::RawPrefix);
    }

    let s0 = shape(&instr.operands[0]);
    let s1 = shape(&instr.operands[1]);
    let ea0 = estimate_ea_clocks(&instr.operands[0]);
    let ea1 = estimate_ea_clocks(&instr.operands[1]);
    let ea = ea0.max(ea1);

    let base = match instr.op {
        Op::Mov => {
            if matches!((s0, s1), (Shape::Reg, Shape::Mem) | (Shape::Mem, Shape::Reg)) && ea == 0 {
                10 // acc,mem direct-address form carries no EA cost
            } else {
                resolve_reg_reg_family(
                    CostRule::RegRegOrRegImmOrRegMem {
                        reg_reg: 2,
                        reg_imm: 4,
                        reg_mem: 8,
                        mem_reg: 9,
                        mem_imm: 10,
                    },
                    s0,
                    s1,
                    ea,
                )
            }
        }
        Op::Push => resolve_push_pop(
            CostRule::PushPop { segreg: 10, reg: 11, mem: 16 },
            &instr.operands[0],
            ea,
        ),
        Op::Pop => resolve_push_pop(
            CostRule::PushPop { segreg: 8, reg: 8, mem: 17 },
            &instr.operands[0],
            ea,
        ),
        Op::Xchg => match (s0, s1) {
            (Shape::Reg, Shape::Reg) => {
                let is_acc = matches!(instr.operands[0], Operand::Reg(ra) if ra.reg == crate::reg::Reg::A && ra.size == 2)
                    || matches!(instr.operands[1], Operand::Reg(ra) if ra.reg == crate::reg::Reg::A && ra.size == 2);
                if is_acc {
                    3
                } else {
                    4
                }
            }
            _ => 17 + ea,
        },
        Op::Add | Op::Adc | Op::Sub | Op::Sbb | Op::And | Op::Or | Op::Xor | Op::Cmp => {
            resolve_reg_reg_family(ALU_RULE, s0, s1, ea)
        }
        Op::Test => match (s0, s1) {
            (Shape::Reg, Shape::Reg) => 3,
            (Shape::Reg, Shape::Imm) => 5,
            (Shape::Mem, Shape::Imm) => 11 + ea,
            _ => 9 + ea,
        },
        Op::Not | Op::Neg => match s0 {
            Shape::Reg => 3,
            _ => 16 + ea,
        },
        Op::Mul => match s0 {
            Shape::Reg => 118,
            _ => 134 + ea,
        },
        Op::Imul => match s0 {
            Shape::Reg => 154,
            _ => 170 + ea,
        },
        Op::Div => match s0 {
            Shape::Reg => 162,
            _ => 175 + ea,
        },
        Op::Idiv => match s0 {
            Shape::Reg => 184,
            _ => 190 + ea,
        },
        Op::Inc | Op::Dec => match s0 {
            Shape::Reg => 3,
            _ => 15 + ea,
        },
        Op::Rol | Op::Ror | Op::Rcl | Op::Rcr | Op::Shl | Op::Shr | Op::Sar => {
            let by_cl = matches!(instr.operands[1], Operand::Reg(_));
            resolve_shift(
                CostRule::ShiftGroup { reg_by1: 2, reg_by_cl: 8, mem_by1: 15, mem_by_cl: 20 },
                s0,
                by_cl,
                meta.op1_val,
                ea,
            )
        }
        Op::Movs => resolve_rep(CostRule::RepLinear { base: 9, per_iter: 17, single: 17 }, meta),
        Op::Cmps => resolve_rep(CostRule::RepLinear { base: 9, per_iter: 22, single: 22 }, meta),
        Op::Scas => resolve_rep(CostRule::RepLinear { base: 9, per_iter: 15, single: 15 }, meta),
        Op::Lods => resolve_rep(CostRule::RepLinear { base: 9, per_iter: 13, single: 13 }, meta),
        Op::Stos => resolve_rep(CostRule::RepLinear { base: 9, per_iter: 10, single: 10 }, meta),
        Op::Call => match instr.operands[0] {
            _ if instr.flags.contains(InstructionFlags::FAR) => 28 + ea,
            Operand::Mem(_) | Operand::Reg(_) => 16 + ea,
            _ => 19,
        },
        Op::Jmp => match instr.operands[0] {
            _ if instr.flags.contains(InstructionFlags::FAR) => 15 + ea,
            Operand::Mem(_) | Operand::Reg(_) => 11 + ea,
            _ => 15,
        },
        Op::Ret | Op::Retf => 20,
        Op::Jo | Op::Jno | Op::Jb | Op::Jnb | Op::Jz | Op::Jnz | Op::Jbe | Op::Ja | Op::Js
        | Op::Jns | Op::Jp | Op::Jnp | Op::Jl | Op::Jnl | Op::Jle | Op::Jg => {
            resolve_cond(CostRule::CondPair { taken: 16, not_taken: 4 }, meta)
        }
        Op::Loop => resolve_cond(CostRule::CondPair { taken: 17, not_taken: 5 }, meta),
        Op::Loopz | Op::Loopnz => resolve_cond(CostRule::CondPair { taken: 18, not_taken: 5 }, meta),
        Op::Jcxz => resolve_cond(CostRule::CondPair { taken: 18, not_taken: 6 }, meta),
        Op::Int3 => resolve_const(CostRule::Const(52)),
        Op::Int => resolve_const(CostRule::Const(51)),
        Op::Into => resolve_cond(CostRule::CondPair { taken: 53, not_taken: 4 }, meta),
        Op::Iret => resolve_const(CostRule::Const(24)),
        Op::Clc | Op::Stc | Op::Cmc | Op::Cld | Op::Std | Op::Cli | Op::Sti => {
            resolve_const(CostRule::Const(2))
        }
        Op::Lahf | Op::Sahf => resolve_const(CostRule::Const(4)),
        Op::Daa | Op::Das | Op::Aaa | Op::Aas => resolve_const(CostRule::Const(4)),
        Op::Aam | Op::Aad => resolve_const(CostRule::Const(83)),
        Op::Cbw | Op::Cwd => resolve_const(CostRule::Const(2)),
        Op::Hlt => resolve_const(CostRule::Const(2)),
        Op::Nop => resolve_const(CostRule::Const(3)),
        Op::Lea => 2 + ea,
        Op::Lds | Op::Les => 16 + ea,
        Op::Xlat => 11,
        Op::In => match s1 {
            Shape::Imm => 10,
            _ => 8,
        },
        Op::Out => match s0 {
            Shape::Imm => 10,
            _ => 8,
        },
        Op::Esc => 8 + ea,
        Op::Wait => 3 + 5 * meta.wait_n,
        Op::Lock | Op::Rep | Op::Segment | Op::Invalid => {
            return Err(ClockError::Unimplemented(instr.op));
        }
    };

    let mut total = base;
    if instr.flags.contains(InstructionFlags::REP) {
        total += 2;
    }
    if instr.flags.contains(InstructionFlags::LOCK) {
        total += 2;
    }
    if instr.flags.contains(InstructionFlags::SEG_OVERRIDE) {
        total += 2;
    }
    total += match proc {
        ProcType::I8086 => 4 * meta.wide_odd_transfer_cnt,
        ProcType::I8088 => 4 * meta.wide_transfer_cnt,
    };

    Ok(total)
}

fn resolve_const(rule: CostRule) -> u32 {
    let CostRule::Const(v) = rule else { unreachable!("resolve_const called with a non-matching rule") };
    v
}

fn resolve_push_pop(rule: CostRule, op0: &Operand, ea: u32) -> u32 {
    let CostRule::PushPop { segreg, reg, mem } = rule else {
        unreachable!("resolve_push_pop called with a non-matching rule")
    };
    match op0 {
        Operand::Mem(_) => mem + ea,
        Operand::Reg(ra)
            if matches!(
                ra.reg,
                crate::reg::Reg::Es | crate::reg::Reg::Cs | crate::reg::Reg::Ss | crate::reg::Reg::Ds
            ) =>
        {
            segreg
        }
        _ => reg,
    }
}

fn resolve_shift(rule: CostRule, s0: Shape, by_cl: bool, count: u32, ea: u32) -> u32 {
    let CostRule::ShiftGroup { reg_by1, reg_by_cl, mem_by1, mem_by_cl } = rule else {
        unreachable!("resolve_shift called with a non-matching rule")
    };
    match (s0, by_cl) {
        (Shape::Reg, false) => reg_by1,
        (Shape::Reg, true) => reg_by_cl + 4 * count,
        (_, false) => mem_by1 + ea,
        (_, true) => mem_by_cl + ea + 4 * count,
    }
}

fn resolve_rep(rule: CostRule, meta: &InstructionMetadata) -> u32 {
    let CostRule::RepLinear { base, per_iter, single } = rule else {
        unreachable!("resolve_rep called with a non-matching rule")
    };
    if meta.instr.flags.contains(InstructionFlags::REP) {
        base + per_iter * meta.rep_count
    } else {
        single
    }
}

fn resolve_cond(rule: CostRule, meta: &InstructionMetadata) -> u32 {
    let CostRule::CondPair { taken, not_taken } = rule else {
        unreachable!("resolve_cond called with a non-matching rule")
    };
    if meta.cond_action_happened {
        taken
    } else {
        not_taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::Instruction;
    use crate::reg::RegAccess;

    fn meta_for(instr: Instruction) -> InstructionMetadata {
        InstructionMetadata::new(instr)
    }

    #[test]
    fn mov_reg_reg_is_two_clocks() {
        let mut instr = Instruction::invalid();
        instr.op = Op::Mov;
        instr.operand_cnt = 2;
        instr.operands = [
            Operand::Reg(RegAccess::word(crate::reg::Reg::B)),
            Operand::Reg(RegAccess::word(crate::reg::Reg::A)),
        ];
        let meta = meta_for(instr);
        assert_eq!(estimate_instruction_clocks(&meta, ProcType::I8086).unwrap(), 2);
    }

    #[test]
    fn raw_prefix_is_an_error() {
        let mut instr = Instruction::invalid();
        instr.op = Op::Lock;
        let meta = meta_for(instr);
        assert_eq!(
            estimate_instruction_clocks(&meta, ProcType::I8086),
            Err(ClockError::RawPrefix)
        );
    }

    #[test]
    fn movs_rep_scales_with_count() {
        let mut instr = Instruction::invalid();
        instr.op = Op::Movs;
        instr.flags = InstructionFlags::REP;
        let mut meta = meta_for(instr);
        meta.rep_count = 3;
        // base + per_iter * count, plus the flat +2 the REP prefix itself adds.
        assert_eq!(estimate_instruction_clocks(&meta, ProcType::I8086).unwrap(), 9 + 17 * 3 + 2);
    }
}
