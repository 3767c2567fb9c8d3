//! The decoded [`Instruction`] record and its flag bitset.

use bitflags::bitflags;

use crate::catalog::Op;
use crate::operand::Operand;
use crate::reg::Reg;

bitflags! {
    /// Per-instruction flag bits. Several are only meaningful for
    /// particular opcodes (e.g. `S` only applies to ALU-immediate
    /// forms); decoder and validator agree on which.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InstructionFlags: u8 {
        /// Operand size is word, not byte.
        const W = 1 << 0;
        /// 8-bit immediate is sign-extended to 16 bits.
        const S = 1 << 1;
        /// REP/REPNE selector bit (distinguishes `REP` from `REPNE`).
        const Z = 1 << 2;
        /// Carries a `LOCK` prefix.
        const LOCK = 1 << 3;
        /// Carries a `REP`/`REPNE` prefix.
        const REP = 1 << 4;
        /// A segment-override prefix applies to this instruction's memory operand.
        const SEG_OVERRIDE = 1 << 5;
        /// The immediate operand is a PC-relative jump displacement.
        const IMM_IS_REL_DISP = 1 << 6;
        /// Far (intersegment) form of CALL/JMP.
        const FAR = 1 << 7;
    }
}

/// A fully decoded 8086 instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub op: Op,
    pub flags: InstructionFlags,
    pub operands: [Operand; 2],
    pub operand_cnt: u8,
    pub size_bytes: u8,
    pub segment_override: Option<Reg>,
}

impl Instruction {
    pub fn invalid() -> Self {
        Instruction {
            op: Op::Invalid,
            flags: InstructionFlags::empty(),
            operands: [Operand::None, Operand::None],
            operand_cnt: 0,
            size_bytes: 0,
            segment_override: None,
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.op == Op::Invalid
    }
}
