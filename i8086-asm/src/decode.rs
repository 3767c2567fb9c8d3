//! Consumes bytes from a [`ByteWindow`], resolves an
//! [`InstructionEncoding`] via the [`InstructionTable`], and builds a
//! structured [`Instruction`]. Prefixes are absorbed into the
//! following instruction through a mutable [`DecoderContext`].

use crate::bytesrc::ByteWindow;
use crate::catalog::{FieldKind, Op};
use crate::instr::{Instruction, InstructionFlags};
use crate::operand::{rm_operand, segreg, Operand};
use crate::reg::{Reg, RegAccess};
use crate::table::InstructionTable;

/// Carries prefix state between successive [`decode_next`] calls on
/// the same instruction stream.
#[derive(Debug, Clone, Default)]
pub struct DecoderContext {
    pub last_prefix_flags: InstructionFlags,
    pub segment_override: Option<Reg>,
}

impl DecoderContext {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Reads bits MSB-first from a [`ByteWindow`] starting at a given
/// byte offset, tracking how many bytes were actually consumed.
struct BitCursor<'a> {
    window: &'a ByteWindow<'a>,
    start_offset: usize,
    byte_pos: usize,
    bit_pos: u8, // bits already consumed from the current byte, 0..8
    ok: bool,
}

impl<'a> BitCursor<'a> {
    fn new(window: &'a ByteWindow<'a>, start_offset: usize) -> Self {
        BitCursor { window, start_offset, byte_pos: start_offset, bit_pos: 0, ok: true }
    }

    fn current_byte(&self) -> Option<u8> {
        self.window.get(self.byte_pos)
    }

    fn read_bits(&mut self, n: u8) -> u32 {
        let mut result: u32 = 0;
        let mut remaining = n;
        while remaining > 0 {
            let Some(byte) = self.current_byte() else {
                self.ok = false;
                return result << remaining;
            };
            let avail = 8 - self.bit_pos;
            let take = remaining.min(avail);
            let shift = avail - take;
            let mask = ((1u16 << take) - 1) as u8;
            let bits = (byte >> shift) & mask;
            result = (result << take) | bits as u32;
            self.bit_pos += take;
            remaining -= take;
            if self.bit_pos == 8 {
                self.bit_pos = 0;
                self.byte_pos += 1;
            }
        }
        result
    }

    /// Advances to the next whole byte boundary (for fields that are
    /// declared byte-aligned, e.g. displacement/immediate payloads).
    fn align_to_byte(&mut self) {
        if self.bit_pos != 0 {
            self.bit_pos = 0;
            self.byte_pos += 1;
        }
    }

    fn read_byte(&mut self) -> u8 {
        self.align_to_byte();
        match self.current_byte() {
            Some(b) => {
                self.byte_pos += 1;
                b
            }
            None => {
                self.ok = false;
                0
            }
        }
    }

    fn read_word_le(&mut self) -> u16 {
        let lo = self.read_byte();
        let hi = self.read_byte();
        (lo as u16) | ((hi as u16) << 8)
    }

    fn bytes_consumed(&self) -> usize {
        self.byte_pos - self.start_offset
    }
}

enum DataWidth {
    None,
    Byte,
    Word,
}

/// Decodes one instruction starting at `source[offset]`. Returns
/// `Instruction::invalid()` on an unrecognized opcode or truncated
/// input; the caller is expected to stop the stream on an invalid
/// result. `offset` is always honored, independent of where
/// `source`'s own window begins.
pub fn decode_next(
    source: &ByteWindow,
    offset: usize,
    table: &InstructionTable,
    ctx: &DecoderContext,
) -> Instruction {
    let Some(byte0) = source.get(offset) else {
        return Instruction::invalid();
    };
    let byte1 = source.get(offset + 1).unwrap_or(0);

    let Some(enc) = table.lookup(byte0, byte1) else {
        return Instruction::invalid();
    };

    let mut cur = BitCursor::new(source, offset);

    let mut w = false;
    let mut d = false;
    let mut s = false;
    let mut z = false;
    let mut v = false;
    let mut mod_val: u8 = 0;
    let mut reg_val: u8 = 0;
    let mut rm_val: u8 = 0;
    let mut sr_val: u8 = 0;
    let mut ext_lo: u8 = 0;
    let mut ext_hi: u8 = 0;
    let mut has_modrm = false;
    let mut has_reg = false;
    let mut has_sr = false;
    let mut has_ext = false;
    let mut rm_always_w = false;
    let mut disp_present_marker = false;
    let mut disp_always_w_marker = false;
    let mut data_width = DataWidth::None;
    let mut jmp_rel = false;
    let mut far_marker = false;

    for field in enc.fields {
        match field.kind {
            FieldKind::End => break,
            FieldKind::Literal => {
                cur.read_bits(field.bits);
            }
            FieldKind::W => {
                w = if field.bits == 0 { field.val != 0 } else { cur.read_bits(1) != 0 };
            }
            FieldKind::D => {
                d = if field.bits == 0 { field.val != 0 } else { cur.read_bits(1) != 0 };
            }
            FieldKind::S => {
                s = if field.bits == 0 { field.val != 0 } else { cur.read_bits(1) != 0 };
            }
            FieldKind::Z => {
                z = cur.read_bits(1) != 0;
            }
            FieldKind::V => {
                v = cur.read_bits(1) != 0;
            }
            FieldKind::Mod => {
                mod_val = cur.read_bits(2) as u8;
                has_modrm = true;
            }
            FieldKind::Reg => {
                reg_val = cur.read_bits(3) as u8;
                has_reg = true;
            }
            FieldKind::Rm => {
                rm_val = cur.read_bits(3) as u8;
            }
            FieldKind::Sr => {
                sr_val = cur.read_bits(2) as u8;
                has_sr = true;
            }
            FieldKind::ExtOpcodeLo => {
                ext_lo = cur.read_bits(field.bits) as u8;
                has_ext = true;
            }
            FieldKind::ExtOpcodeHi => {
                ext_hi = cur.read_bits(field.bits) as u8;
                has_ext = true;
            }
            FieldKind::Disp => disp_present_marker = true,
            FieldKind::DispAlwaysW => disp_always_w_marker = true,
            FieldKind::Data => data_width = DataWidth::Byte,
            FieldKind::DataWIfW => data_width = DataWidth::Word,
            FieldKind::RmAlwaysW => rm_always_w = true,
            FieldKind::JmpRelDisp => jmp_rel = true,
            FieldKind::Far => far_marker = true,
        }
        if !cur.ok {
            return Instruction::invalid();
        }
    }

    // Displacement.
    let mut disp: i16 = 0;
    if has_modrm && disp_present_marker {
        if mod_val == 0b00 && rm_val == 0b110 {
            disp = cur.read_word_le() as i16;
        } else if mod_val == 0b01 {
            disp = (cur.read_byte() as i8) as i16;
        } else if mod_val == 0b10 {
            disp = cur.read_word_le() as i16;
        }
    } else if !has_modrm && disp_always_w_marker {
        disp = cur.read_word_le() as i16;
    }
    if !cur.ok {
        return Instruction::invalid();
    }

    // Immediate data.
    let mut imm: u16 = 0;
    match data_width {
        DataWidth::None => {}
        DataWidth::Byte => {
            let b = cur.read_byte();
            imm = if s { (b as i8) as i16 as u16 } else { b as u16 };
        }
        DataWidth::Word => {
            if w {
                imm = cur.read_word_le();
            } else {
                let b = cur.read_byte();
                imm = if s { (b as i8) as i16 as u16 } else { b as u16 };
            }
        }
    }
    if !cur.ok {
        return Instruction::invalid();
    }

    // PC-relative jump displacement, sharing the data cursor when the
    // catalog entry paired `jmp_rel_disp` with a data-width marker
    // (CALL/JMP near direct); otherwise it is always a single
    // sign-extended byte (short conditional jumps and LOOP family).
    let rel: i16 = if jmp_rel {
        match data_width {
            DataWidth::None => (cur.read_byte() as i8) as i16,
            _ => imm as i16,
        }
    } else {
        0
    };
    if !cur.ok {
        return Instruction::invalid();
    }

    // Absolute far pointer: offset then segment, 16 bits each. Only
    // the direct far forms (9A/EA) carry this inline; the indirect
    // forms (FF /3, FF /5) just flag FAR and fetch the pointer from
    // the r/m memory operand at run time.
    let far_ptr = if far_marker && !has_modrm {
        let ip = cur.read_word_le();
        let cs = cur.read_word_le();
        Some((cs, ip))
    } else {
        None
    };
    if !cur.ok {
        return Instruction::invalid();
    }

    let mut flags = InstructionFlags::empty();
    flags.set(InstructionFlags::W, w);
    flags.set(InstructionFlags::S, s);
    if far_marker {
        flags.insert(InstructionFlags::FAR);
    }

    let rm_wide = w || rm_always_w;
    let rm_op = if has_modrm { Some(rm_operand(mod_val, rm_val, rm_wide, disp)) } else { None };
    let reg_op = if has_reg { Some(crate::operand::reg_operand(reg_val, w)) } else { None };
    let sr_op = if has_sr { Some(crate::operand::segreg_operand(sr_val)) } else { None };

    let mut operands = [Operand::None, Operand::None];
    let operand_cnt: u8;

    use Op::*;
    match enc.op {
        Mov | Add | Or | Adc | Sbb | And | Sub | Xor | Cmp | Test
            if has_modrm && (has_reg || has_sr) =>
        {
            let second = reg_op.or(sr_op).unwrap();
            let (a, b) = if d { (second, rm_op.unwrap()) } else { (rm_op.unwrap(), second) };
            operands = [a, b];
            operand_cnt = 2;
        }
        Mov if !has_modrm && disp_always_w_marker => {
            let acc = crate::operand::reg_operand(0, w);
            let mem = rm_op.unwrap_or(Operand::Mem(crate::operand::EaMem {
                base: crate::operand::EaBase::Direct,
                disp,
            }));
            let (a, b) = if d { (acc, mem) } else { (mem, acc) };
            operands = [a, b];
            operand_cnt = 2;
        }
        Mov if has_reg && !has_modrm => {
            // MOV reg,imm
            operands = [reg_op.unwrap(), Operand::Imm(imm)];
            operand_cnt = 2;
        }
        Mov | Add | Or | Adc | Sbb | And | Sub | Xor | Cmp | Test if has_modrm && !has_reg => {
            // MOV imm-to-rm and ALU/Test immediate-to-rm forms.
            operands = [rm_op.unwrap(), Operand::Imm(imm)];
            operand_cnt = 2;
        }
        Add | Or | Adc | Sbb | And | Sub | Xor | Cmp | Test if !has_modrm => {
            // acc,imm forms.
            operands = [crate::operand::reg_operand(0, w), Operand::Imm(imm)];
            operand_cnt = 2;
        }
        Not | Neg | Mul | Imul | Div | Idiv => {
            operands = [rm_op.unwrap(), Operand::None];
            operand_cnt = 1;
        }
        Rol | Ror | Rcl | Rcr | Shl | Shr | Sar => {
            let count = if v { Operand::Reg(RegAccess::low_byte(Reg::C)) } else { Operand::Imm(1) };
            operands = [rm_op.unwrap(), count];
            operand_cnt = 2;
        }
        Inc | Dec if has_modrm => {
            operands = [rm_op.unwrap(), Operand::None];
            operand_cnt = 1;
        }
        Inc | Dec => {
            operands = [crate::operand::reg_operand(rm_val, true), Operand::None];
            operand_cnt = 1;
        }
        Push | Pop if has_sr => {
            operands = [sr_op.unwrap(), Operand::None];
            operand_cnt = 1;
        }
        Push | Pop if has_modrm => {
            operands = [rm_op.unwrap(), Operand::None];
            operand_cnt = 1;
        }
        Push | Pop => {
            operands = [crate::operand::reg_operand(rm_val, true), Operand::None];
            operand_cnt = 1;
        }
        Call | Jmp if has_modrm => {
            operands = [rm_op.unwrap(), Operand::None];
            operand_cnt = 1;
        }
        Xchg if has_modrm => {
            operands = [rm_op.unwrap(), reg_op.unwrap()];
            operand_cnt = 2;
        }
        Xchg => {
            let other = crate::operand::reg_operand(rm_val, true);
            operands = [crate::operand::reg_operand(0, true), other];
            operand_cnt = 2;
        }
        Lea | Lds | Les => {
            operands = [reg_op.unwrap(), rm_op.unwrap()];
            operand_cnt = 2;
        }
        Movs | Cmps | Scas | Lods | Stos => {
            operand_cnt = 0;
        }
        Call if far_ptr.is_some() => {
            let (cs, ip) = far_ptr.unwrap();
            operands = [Operand::CsIp(crate::operand::CsIp { cs, ip }), Operand::None];
            operand_cnt = 1;
        }
        Jmp if far_ptr.is_some() => {
            let (cs, ip) = far_ptr.unwrap();
            operands = [Operand::CsIp(crate::operand::CsIp { cs, ip }), Operand::None];
            operand_cnt = 1;
        }
        Call | Jmp if jmp_rel => {
            operands = [Operand::Imm(rel as u16), Operand::None];
            operand_cnt = 1;
            flags.insert(InstructionFlags::IMM_IS_REL_DISP);
        }
        Ret | Retf => {
            if matches!(data_width, DataWidth::None) {
                operand_cnt = 0;
            } else {
                operands = [Operand::Imm(imm), Operand::None];
                operand_cnt = 1;
            }
        }
        Jo | Jno | Jb | Jnb | Jz | Jnz | Jbe | Ja | Js | Jns | Jp | Jnp | Jl | Jnl | Jle | Jg
        | Loopnz | Loopz | Loop | Jcxz => {
            operands = [Operand::Imm(rel as u16), Operand::None];
            operand_cnt = 1;
            flags.insert(InstructionFlags::IMM_IS_REL_DISP);
        }
        Int => {
            operands = [Operand::Imm(imm), Operand::None];
            operand_cnt = 1;
        }
        In if matches!(data_width, DataWidth::Byte) => {
            operands = [crate::operand::reg_operand(0, w), Operand::Imm(imm)];
            operand_cnt = 2;
        }
        In => {
            operands = [
                crate::operand::reg_operand(0, w),
                Operand::Reg(RegAccess::word(Reg::D)),
            ];
            operand_cnt = 2;
        }
        Out if matches!(data_width, DataWidth::Byte) => {
            operands = [Operand::Imm(imm), crate::operand::reg_operand(0, w)];
            operand_cnt = 2;
        }
        Out => {
            operands = [
                Operand::Reg(RegAccess::word(Reg::D)),
                crate::operand::reg_operand(0, w),
            ];
            operand_cnt = 2;
        }
        Esc => {
            let code = ((ext_lo << 3) | ext_hi) & 0x3F;
            operands = [Operand::Imm(code as u16), rm_op.unwrap()];
            operand_cnt = 2;
        }
        Segment => {
            operands = [Operand::Reg(RegAccess::word(segreg(sr_val))), Operand::None];
            operand_cnt = 1;
        }
        _ => {
            // LOCK, REP, INT3, INTO, IRET, flag ops, CBW/CWD, HLT, NOP,
            // AAM/AAD/DAA/DAS/AAA/AAS, XLAT, WAIT: zero operands.
            operand_cnt = 0;
            let _ = has_ext;
        }
    }

    let size_bytes = cur.bytes_consumed() as u8;

    let mut instr = Instruction {
        op: enc.op,
        flags,
        operands,
        operand_cnt,
        size_bytes,
        segment_override: None,
    };

    // XCHG AX,AX (opcode 0x90, rm field = 0) is architecturally NOP.
    if instr.op == Op::Xchg && !has_modrm && rm_val == 0 {
        instr.op = Op::Nop;
        instr.operands = [Operand::None, Operand::None];
        instr.operand_cnt = 0;
    }

    if matches!(instr.op, Rep) {
        flags_set_z(&mut instr, z);
    }

    // Fold in pending prefix state from the context.
    if !instr.op.is_prefix() {
        instr.flags |= ctx.last_prefix_flags;
        if ctx.last_prefix_flags.contains(InstructionFlags::SEG_OVERRIDE) {
            instr.segment_override = ctx.segment_override;
        }
    }

    instr
}

fn flags_set_z(instr: &mut Instruction, z: bool) {
    instr.flags.set(InstructionFlags::Z, z);
}

/// Updates prefix-carry state after a decode call. Must be called
/// exactly once per decoded instruction, in stream order.
///
/// `Lock`/`Rep` and `Segment` clear and set disjoint bits rather than
/// replacing `last_prefix_flags` wholesale, so a segment override ahead
/// of (or behind) a `LOCK`/`REP` prefix survives into the instruction
/// both apply to (e.g. `ES: REP MOVSB`).
pub fn update_ctx(instr: &Instruction, ctx: &mut DecoderContext) {
    match instr.op {
        Op::Lock => {
            ctx.last_prefix_flags
                .remove(InstructionFlags::LOCK | InstructionFlags::REP | InstructionFlags::Z);
            ctx.last_prefix_flags.insert(InstructionFlags::LOCK);
        }
        Op::Rep => {
            ctx.last_prefix_flags
                .remove(InstructionFlags::LOCK | InstructionFlags::REP | InstructionFlags::Z);
            ctx.last_prefix_flags.insert(InstructionFlags::REP);
            ctx.last_prefix_flags.set(InstructionFlags::Z, instr.flags.contains(InstructionFlags::Z));
        }
        Op::Segment => {
            ctx.last_prefix_flags.insert(InstructionFlags::SEG_OVERRIDE);
            ctx.segment_override = match instr.operands[0] {
                Operand::Reg(ra) => Some(ra.reg),
                _ => None,
            };
        }
        _ => {
            ctx.last_prefix_flags = InstructionFlags::empty();
            ctx.segment_override = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clocks::{estimate_instruction_clocks, InstructionMetadata, ProcType};
    use crate::operand::{EaBase, EaMem};
    use crate::reg::RegAccess;

    fn decode_all(bytes: &[u8]) -> Vec<Instruction> {
        let table = InstructionTable::build();
        let window = ByteWindow::new(bytes);
        let mut ctx = DecoderContext::new();
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            let instr = decode_next(&window, offset, &table, &ctx);
            assert!(!instr.is_invalid(), "unexpected invalid opcode at {offset}");
            offset += instr.size_bytes as usize;
            update_ctx(&instr, &mut ctx);
            out.push(instr);
        }
        out
    }

    #[test]
    fn mov_reg_reg() {
        let instrs = decode_all(&[0x89, 0xD9]);
        assert_eq!(instrs.len(), 1);
        let instr = instrs[0];
        assert_eq!(instr.op, Op::Mov);
        assert_eq!(instr.size_bytes, 2);
        assert_eq!(instr.flags, InstructionFlags::W);
        assert_eq!(instr.operand_cnt, 2);
        assert_eq!(instr.operands[0], Operand::Reg(RegAccess::word(Reg::C)));
        assert_eq!(instr.operands[1], Operand::Reg(RegAccess::word(Reg::B)));
    }

    #[test]
    fn mov_imm_to_reg() {
        let instrs = decode_all(&[0xB8, 0x39, 0x05]);
        assert_eq!(instrs.len(), 1);
        let instr = instrs[0];
        assert_eq!(instr.op, Op::Mov);
        assert_eq!(instr.size_bytes, 3);
        assert_eq!(instr.flags, InstructionFlags::W);
        assert_eq!(instr.operands[0], Operand::Reg(RegAccess::word(Reg::A)));
        assert_eq!(instr.operands[1], Operand::Imm(1337));
    }

    #[test]
    fn add_mem_imm_with_disp() {
        let instrs = decode_all(&[0x83, 0x06, 0x50, 0x01, 0x05]);
        assert_eq!(instrs.len(), 1);
        let instr = instrs[0];
        assert_eq!(instr.op, Op::Add);
        assert_eq!(instr.size_bytes, 5);
        assert_eq!(instr.flags, InstructionFlags::W | InstructionFlags::S);
        assert_eq!(instr.operands[0], Operand::Mem(EaMem { base: EaBase::Direct, disp: 0x0150 }));
        assert_eq!(instr.operands[1], Operand::Imm(5));

        let meta = InstructionMetadata::new(instr);
        assert_eq!(estimate_instruction_clocks(&meta, ProcType::I8086).unwrap(), 23);
    }

    #[test]
    fn rep_movsw() {
        let instrs = decode_all(&[0xF3, 0xA5]);
        assert_eq!(instrs.len(), 2);
        assert_eq!(instrs[0].op, Op::Rep);
        assert_eq!(instrs[0].size_bytes, 1);

        let movs = instrs[1];
        assert_eq!(movs.op, Op::Movs);
        assert_eq!(movs.size_bytes, 1);
        assert_eq!(movs.operand_cnt, 0);
        assert_eq!(movs.flags, InstructionFlags::REP | InstructionFlags::Z | InstructionFlags::W);

        let mut meta = InstructionMetadata::new(movs);
        meta.rep_count = 3;
        assert_eq!(estimate_instruction_clocks(&meta, ProcType::I8086).unwrap(), 2 + 9 + 17 * 3);
    }

    #[test]
    fn segment_override_mov() {
        let instrs = decode_all(&[0x26, 0x8B, 0x1E, 0x00, 0x00]);
        assert_eq!(instrs.len(), 2);
        assert_eq!(instrs[0].op, Op::Segment);

        let mov = instrs[1];
        assert_eq!(mov.op, Op::Mov);
        assert_eq!(mov.size_bytes, 4);
        assert_eq!(mov.flags, InstructionFlags::W | InstructionFlags::SEG_OVERRIDE);
        assert_eq!(mov.segment_override, Some(Reg::Es));
        assert_eq!(mov.operands[0], Operand::Reg(RegAccess::word(Reg::B)));
        assert_eq!(mov.operands[1], Operand::Mem(EaMem { base: EaBase::Direct, disp: 0 }));
    }

    #[test]
    fn conditional_jump_taken_vs_not_taken() {
        let instrs = decode_all(&[0x75, 0x02]);
        assert_eq!(instrs.len(), 1);
        let instr = instrs[0];
        assert_eq!(instr.op, Op::Jnz);
        assert!(instr.flags.contains(InstructionFlags::IMM_IS_REL_DISP));
        assert_eq!(instr.operands[0], Operand::Imm(2));

        let mut meta = InstructionMetadata::new(instr);
        meta.cond_action_happened = true;
        assert_eq!(estimate_instruction_clocks(&meta, ProcType::I8086).unwrap(), 16);
        meta.cond_action_happened = false;
        assert_eq!(estimate_instruction_clocks(&meta, ProcType::I8086).unwrap(), 4);
    }

    /// A segment override ahead of a REP prefix must survive into the
    /// string instruction both apply to (`ES: REP MOVSB`): regression
    /// test for `update_ctx` clobbering `SEG_OVERRIDE` when it
    /// reassigned `last_prefix_flags` wholesale on a later `REP`.
    #[test]
    fn combined_segment_and_rep_prefix() {
        let instrs = decode_all(&[0x26, 0xF3, 0xA4]);
        assert_eq!(instrs.len(), 3);
        assert_eq!(instrs[0].op, Op::Segment);
        assert_eq!(instrs[1].op, Op::Rep);

        let movs = instrs[2];
        assert_eq!(movs.op, Op::Movs);
        assert!(!movs.flags.contains(InstructionFlags::W));
        assert!(movs.flags.contains(InstructionFlags::REP));
        assert!(movs.flags.contains(InstructionFlags::Z));
        assert!(movs.flags.contains(InstructionFlags::SEG_OVERRIDE));
        assert_eq!(movs.segment_override, Some(Reg::Es));
    }
}
