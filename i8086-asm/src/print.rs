//! NASM-compatible text rendering of a decoded [`Instruction`].
//! Consumes only the structured type — no access to the byte stream,
//! the table, or the decoder context.

use std::fmt;

use crate::catalog::Op;
use crate::instr::{Instruction, InstructionFlags};
use crate::operand::{EaBase, Operand};
use crate::reg::Reg;

/// Wraps a destination writer so tests can render into a `String` and
/// the CLI can render into stdout or a file through the same path.
pub struct Printer<W: fmt::Write> {
    out: W,
}

impl<W: fmt::Write> Printer<W> {
    pub fn new(out: W) -> Self {
        Printer { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    /// Writes a raw line to the underlying writer, for header/footer
    /// text that isn't itself a decoded instruction.
    pub fn write_line(&mut self, line: &str) -> fmt::Result {
        self.out.write_str(line)?;
        self.out.write_str("\n")
    }

    pub fn write_instruction(&mut self, instr: &Instruction) -> fmt::Result {
        if instr.flags.contains(InstructionFlags::LOCK) {
            self.out.write_str("lock ")?;
        }
        if instr.flags.contains(InstructionFlags::REP) {
            if instr.flags.contains(InstructionFlags::Z) {
                self.out.write_str("rep ")?;
            } else {
                self.out.write_str("repnz ")?;
            }
        }

        self.out.write_str(&mnemonic(instr))?;

        if instr.operand_cnt == 0 {
            return Ok(());
        }

        self.out.write_str(" ")?;

        let mut operands: Vec<usize> = (0..instr.operand_cnt as usize).collect();
        if instr.op == Op::Xchg
            && instr.flags.contains(InstructionFlags::LOCK)
            && matches!(instr.operands[0], Operand::Reg(_))
        {
            operands.swap(0, 1);
        }

        for (i, &slot) in operands.iter().enumerate() {
            if i > 0 {
                self.out.write_str(", ")?;
            }
            self.write_operand(instr, &instr.operands[slot])?;
        }
        Ok(())
    }

    fn write_operand(&mut self, instr: &Instruction, op: &Operand) -> fmt::Result {
        match op {
            Operand::None => Ok(()),
            Operand::Reg(ra) => write!(self.out, "{ra}"),
            Operand::Mem(mem) => {
                if instr.flags.contains(InstructionFlags::FAR) {
                    self.out.write_str("far ")?;
                }
                if !has_register_sibling(instr) {
                    let size_word = instr.flags.contains(InstructionFlags::W);
                    self.out.write_str(if size_word { "word " } else { "byte " })?;
                }
                if let Some(seg) = instr.segment_override {
                    write!(self.out, "{}:", segment_prefix(seg))?;
                }
                self.out.write_str("[")?;
                match mem.base {
                    EaBase::Direct => write!(self.out, "{}", mem.disp as u16)?,
                    base => {
                        self.out.write_str(base_str(base))?;
                        if mem.disp != 0 {
                            if mem.disp > 0 {
                                write!(self.out, "+{}", mem.disp)?;
                            } else {
                                write!(self.out, "-{}", -(mem.disp as i32))?;
                            }
                        }
                    }
                }
                self.out.write_str("]")
            }
            Operand::Imm(v) => {
                if instr.flags.contains(InstructionFlags::IMM_IS_REL_DISP) {
                    write!(self.out, "$+{}+{}", *v as i16, instr.size_bytes)
                } else {
                    write!(self.out, "{v}")
                }
            }
            Operand::CsIp(cs_ip) => write!(self.out, "0x{:04x}:0x{:04x}", cs_ip.cs, cs_ip.ip),
        }
    }
}

fn has_register_sibling(instr: &Instruction) -> bool {
    instr.operands[0..instr.operand_cnt as usize]
        .iter()
        .any(|o| matches!(o, Operand::Reg(_)))
}

fn segment_prefix(reg: Reg) -> &'static str {
    match reg {
        Reg::Es => "es",
        Reg::Cs => "cs",
        Reg::Ss => "ss",
        Reg::Ds => "ds",
        _ => "??",
    }
}

fn base_str(base: EaBase) -> &'static str {
    match base {
        EaBase::BxSi => "bx+si",
        EaBase::BxDi => "bx+di",
        EaBase::BpSi => "bp+si",
        EaBase::BpDi => "bp+di",
        EaBase::Si => "si",
        EaBase::Di => "di",
        EaBase::Bp => "bp",
        EaBase::Bx => "bx",
        EaBase::Direct => "",
    }
}

fn mnemonic(instr: &Instruction) -> String {
    let base = instr.op.mnemonic();
    if matches!(instr.op, Op::Movs | Op::Cmps | Op::Scas | Op::Lods | Op::Stos) {
        let suffix = if instr.flags.contains(InstructionFlags::W) { "w" } else { "b" };
        format!("{base}{suffix}")
    } else {
        base.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operand::EaMem;
    use crate::reg::RegAccess;

    fn render(instr: &Instruction) -> String {
        let mut p = Printer::new(String::new());
        p.write_instruction(instr).unwrap();
        p.into_inner()
    }

    #[test]
    fn mov_reg_reg() {
        let mut instr = Instruction::invalid();
        instr.op = Op::Mov;
        instr.operand_cnt = 2;
        instr.flags = InstructionFlags::W;
        instr.operands = [
            Operand::Reg(RegAccess::word(Reg::B)),
            Operand::Reg(RegAccess::word(Reg::C)),
        ];
        assert_eq!(render(&instr), "mov bx, cx");
    }

    #[test]
    fn mov_mem_needs_size_prefix() {
        let mut instr = Instruction::invalid();
        instr.op = Op::Mov;
        instr.operand_cnt = 2;
        instr.flags = InstructionFlags::S;
        instr.operands = [
            Operand::Mem(EaMem { base: EaBase::Bx, disp: 0 }),
            Operand::Imm(5),
        ];
        assert_eq!(render(&instr), "mov byte [bx], 5");
    }

    #[test]
    fn string_op_gets_w_suffix() {
        let mut instr = Instruction::invalid();
        instr.op = Op::Movs;
        instr.flags = InstructionFlags::W | InstructionFlags::REP | InstructionFlags::Z;
        assert_eq!(render(&instr), "rep movsw");
    }

    #[test]
    fn rel_disp_immediate_uses_dollar_notation() {
        let mut instr = Instruction::invalid();
        instr.op = Op::Jnz;
        instr.operand_cnt = 1;
        instr.size_bytes = 2;
        instr.flags = InstructionFlags::IMM_IS_REL_DISP;
        instr.operands = [Operand::Imm(2u16), Operand::None];
        assert_eq!(render(&instr), "jnz $+2+2");
    }
}
