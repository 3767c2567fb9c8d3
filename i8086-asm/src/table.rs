//! Compiles the [`EncodingCatalog`](crate::catalog::ENCODINGS) into an
//! O(1) dispatch table keyed on the first two bytes of an instruction.

use std::fmt;

use crate::catalog::{BitField, FieldKind, InstructionEncoding, ENCODINGS};

/// Number of bits considered for dispatch: the first two input bytes,
/// read as a single MSB-first 16-bit value.
const KEY_BITS: u32 = 16;

/// O(1) lookup from the literal bits of the first two instruction
/// bytes to the [`InstructionEncoding`] that matches them.
pub struct InstructionTable {
    mask: u16,
    slots: Vec<Option<&'static InstructionEncoding>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeTableError {
    pub index: usize,
}

impl fmt::Display for DecodeTableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "two encodings in the catalog claim the same dispatch slot near index {}",
            self.index
        )
    }
}

impl std::error::Error for DecodeTableError {}

/// Walks an encoding's field list and accumulates the literal bits it
/// pins down within the first two bytes, in MSB-first order across
/// the 16-bit key (i.e. already bit-order-normalized: field lists are
/// written high-to-low within each byte, which is also the order a
/// 16-bit MSB-first key expects, so no reversal is actually needed
/// once we walk bit-position explicitly rather than building bytes).
fn literal_mask_and_value(fields: &[BitField]) -> (u16, u16) {
    let mut mask: u16 = 0;
    let mut value: u16 = 0;
    let mut bit_pos = KEY_BITS; // bits remaining before the current field, MSB-first

    for field in fields {
        if field.kind == FieldKind::End {
            break;
        }
        if field.bits == 0 {
            continue;
        }
        if bit_pos < field.bits as u32 {
            // Field extends past the first two bytes (e.g. a segment
            // selector byte for PushSeg/PopSeg/Segment falls entirely
            // within byte 0, so this only triggers for fields beyond
            // byte 1 such as disp/data payloads, which never carry
            // `bits > 0` in this catalog).
            break;
        }
        bit_pos -= field.bits as u32;
        if field.kind == FieldKind::Literal {
            let shift = bit_pos;
            mask |= ((1u16 << field.bits) - 1) << shift;
            value |= (field.val as u16) << shift;
        }
    }

    (mask, value)
}

impl InstructionTable {
    /// Builds the table from the built-in static catalog. Panics if
    /// the catalog contains two encodings that would occupy the same
    /// dispatch slot: that is a static authoring bug, never a
    /// consequence of untrusted input, so it is caught at the one
    /// point in the program's life where the catalog is compiled.
    pub fn build() -> Self {
        Self::build_from(ENCODINGS).expect("built-in instruction catalog has a dispatch conflict")
    }

    /// Builds a table from an arbitrary encoding slice, returning an
    /// error instead of panicking. Used by tests that want to exercise
    /// the conflict-detection path without crashing the test process.
    pub fn build_from(
        encodings: &'static [InstructionEncoding],
    ) -> Result<Self, DecodeTableError> {
        let mut mask: u16 = 0;
        for enc in encodings {
            mask |= literal_mask_and_value(enc.fields).0;
        }

        let bit_positions: Vec<u32> = (0..KEY_BITS).rev().filter(|b| mask & (1 << b) != 0).collect();
        let k = bit_positions.len();
        let slot_count = 1usize << k;
        let mut slots: Vec<Option<&'static InstructionEncoding>> = vec![None; slot_count];

        for (idx, enc) in encodings.iter().enumerate() {
            let (lit_mask, lit_val) = literal_mask_and_value(enc.fields);
            debug_assert_eq!(lit_mask & !mask, 0);

            // Project this encoding's literal bits onto the compressed
            // k-bit id space, and find which compressed bits are free
            // (wildcards) because this encoding leaves them
            // unconstrained relative to the global mask.
            let mut id_mask: usize = 0;
            let mut id_val: usize = 0;
            let mut free_bits: Vec<usize> = Vec::new();
            for (compressed_bit, &src_bit) in bit_positions.iter().enumerate() {
                let compressed_shift = k - 1 - compressed_bit;
                if lit_mask & (1 << src_bit) != 0 {
                    id_mask |= 1 << compressed_shift;
                    if lit_val & (1 << src_bit) != 0 {
                        id_val |= 1 << compressed_shift;
                    }
                } else {
                    free_bits.push(compressed_shift);
                }
            }

            let free_count = free_bits.len();
            for combo in 0..(1usize << free_count) {
                let mut key = id_val;
                for (i, &shift) in free_bits.iter().enumerate() {
                    if combo & (1 << i) != 0 {
                        key |= 1 << shift;
                    }
                }
                debug_assert_eq!(key & id_mask, id_val & id_mask);
                if slots[key].is_some() {
                    return Err(DecodeTableError { index: idx });
                }
                slots[key] = Some(enc);
            }
        }

        Ok(InstructionTable { mask, slots })
    }

    /// Compresses the first two input bytes by `self.mask` and looks
    /// up the matching encoding, if any.
    pub fn lookup(&self, byte0: u8, byte1: u8) -> Option<&'static InstructionEncoding> {
        let key16 = ((byte0 as u16) << 8) | byte1 as u16;
        let mut compressed: usize = 0;
        let mut written = 0usize;
        for bit in (0..KEY_BITS).rev() {
            if self.mask & (1 << bit) != 0 {
                compressed <<= 1;
                if key16 & (1 << bit) != 0 {
                    compressed |= 1;
                }
                written += 1;
            }
        }
        debug_assert_eq!(1usize << written, self.slots.len().max(1));
        self.slots.get(compressed).copied().flatten()
    }
}

lazy_static::lazy_static! {
    /// Process-wide default table built from the built-in catalog.
    pub static ref DEFAULT_TABLE: InstructionTable = InstructionTable::build();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_dispatch_conflicts_in_builtin_catalog() {
        InstructionTable::build_from(ENCODINGS).expect("catalog must be conflict-free");
    }

    #[test]
    fn mov_reg_reg_dispatches() {
        let table = InstructionTable::build();
        let enc = table.lookup(0x89, 0xD9).expect("0x89 must decode");
        assert_eq!(enc.op, crate::catalog::Op::Mov);
    }

    #[test]
    fn alu_imm_group_dispatches_to_add() {
        let table = InstructionTable::build();
        let enc = table.lookup(0x83, 0x06).expect("0x83 /0 must decode");
        assert_eq!(enc.op, crate::catalog::Op::Add);
    }

    #[test]
    fn unknown_byte_sequence_has_no_encoding() {
        let table = InstructionTable::build();
        // 0x0F is not a valid 8086 opcode in this subset (two-byte
        // escape introduced on the 80286).
        assert!(table.lookup(0x0F, 0x00).is_none());
    }
}
