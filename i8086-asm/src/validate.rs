//! Structural checks on a decoded [`Instruction`] (and, separately,
//! on its [`InstructionMetadata`]) applied before Simulator or Clocks
//! sees it. A failed check returns `false`; callers decide whether
//! that's fatal.

use crate::catalog::Op;
use crate::clocks::InstructionMetadata;
use crate::instr::{Instruction, InstructionFlags};
use crate::operand::Operand;
use crate::reg::Reg;

fn is_reg_or_mem(op: &Operand) -> bool {
    matches!(op, Operand::Reg(_) | Operand::Mem(_))
}

fn is_shift_count(op: &Operand) -> bool {
    matches!(op, Operand::Imm(1)) || matches!(op, Operand::Reg(ra) if ra.reg == Reg::C && ra.size == 1)
}

/// Checks the structural invariants `4.5` describes for a decoded
/// instruction. Returns `false` on the first violation found.
pub fn validate_instruction(instr: &Instruction) -> bool {
    if instr.flags.contains(InstructionFlags::SEG_OVERRIDE) {
        if !matches!(instr.segment_override, Some(Reg::Es | Reg::Ss | Reg::Ds)) {
            return false;
        }
    } else if instr.segment_override.is_some() {
        return false;
    }

    for slot in instr.operand_cnt..2 {
        if !matches!(instr.operands[slot as usize], Operand::None) {
            return false;
        }
    }

    match instr.op {
        Op::Mov => {
            instr.operand_cnt == 2
                && is_reg_or_mem(&instr.operands[0])
                && !matches!(instr.operands[1], Operand::CsIp(_))
        }
        Op::Push => {
            instr.operand_cnt == 1
                && instr.flags.contains(InstructionFlags::W)
                && !instr.flags.intersects(
                    InstructionFlags::S
                        | InstructionFlags::Z
                        | InstructionFlags::REP
                        | InstructionFlags::IMM_IS_REL_DISP
                        | InstructionFlags::FAR,
                )
        }
        Op::Rol | Op::Ror | Op::Rcl | Op::Rcr | Op::Shl | Op::Shr | Op::Sar => {
            instr.operand_cnt == 2 && is_shift_count(&instr.operands[1])
        }
        Op::Movs | Op::Cmps | Op::Scas | Op::Lods | Op::Stos => instr.operand_cnt == 0,
        Op::Int => instr.operand_cnt == 1 && matches!(instr.operands[0], Operand::Imm(_)),
        _ if instr.op.is_conditional_branch() => {
            instr.operand_cnt == 1
                && matches!(instr.operands[0], Operand::Imm(_))
                && instr.flags.contains(InstructionFlags::IMM_IS_REL_DISP)
        }
        _ => true,
    }
}

/// Checks the dynamic facts recorded on [`InstructionMetadata`]
/// before handing it to [`crate::clocks::estimate_instruction_clocks`].
pub fn validate_instruction_metadata(meta: &InstructionMetadata) -> bool {
    let wide = meta.instr.flags.contains(InstructionFlags::W);
    let bound = if wide { 1u32 << 16 } else { 1u32 << 8 };
    if meta.op0_val >= bound || meta.op1_val >= bound {
        return false;
    }

    match meta.instr.op {
        Op::Movs | Op::Cmps | Op::Scas | Op::Lods | Op::Stos => {
            if meta.instr.flags.contains(InstructionFlags::REP) && meta.rep_count == 0 {
                return false;
            }
            if meta.cond_action_happened {
                return false;
            }
        }
        _ => {}
    }

    if !meta.instr.op.is_conditional_branch() && meta.instr.op != Op::Into {
        if meta.cond_action_happened {
            return false;
        }
    }

    if meta.instr.op != Op::Wait && meta.wait_n != 0 {
        return false;
    }

    if meta.wide_odd_transfer_cnt > meta.wide_transfer_cnt {
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reg::RegAccess;

    #[test]
    fn mov_csip_source_is_rejected() {
        let mut instr = Instruction::invalid();
        instr.op = Op::Mov;
        instr.operand_cnt = 2;
        instr.operands = [
            Operand::Reg(RegAccess::word(Reg::A)),
            Operand::CsIp(crate::operand::CsIp { cs: 0, ip: 0 }),
        ];
        assert!(!validate_instruction(&instr));
    }

    #[test]
    fn push_without_w_is_rejected() {
        let mut instr = Instruction::invalid();
        instr.op = Op::Push;
        instr.operand_cnt = 1;
        instr.operands = [Operand::Reg(RegAccess::word(Reg::A)), Operand::None];
        assert!(!validate_instruction(&instr));
    }

    #[test]
    fn shift_by_imm_one_is_valid() {
        let mut instr = Instruction::invalid();
        instr.op = Op::Shl;
        instr.operand_cnt = 2;
        instr.operands = [Operand::Reg(RegAccess::word(Reg::A)), Operand::Imm(1)];
        assert!(validate_instruction(&instr));
    }

    #[test]
    fn string_op_with_stray_operand_is_rejected() {
        let mut instr = Instruction::invalid();
        instr.op = Op::Movs;
        instr.operand_cnt = 1;
        instr.operands = [Operand::Imm(0), Operand::None];
        assert!(!validate_instruction(&instr));
    }

    #[test]
    fn metadata_with_oversized_byte_operand_is_rejected() {
        let mut instr = Instruction::invalid();
        instr.op = Op::Rol;
        let mut meta = InstructionMetadata::new(instr);
        meta.op1_val = 300;
        assert!(!validate_instruction_metadata(&meta));
    }

    #[test]
    fn cs_segment_override_is_rejected() {
        let mut instr = Instruction::invalid();
        instr.op = Op::Mov;
        instr.operand_cnt = 2;
        instr.operands = [Operand::Reg(RegAccess::word(Reg::B)), Operand::Imm(1)];
        instr.flags = InstructionFlags::SEG_OVERRIDE;
        instr.segment_override = Some(Reg::Cs);
        assert!(!validate_instruction(&instr));
    }
}
