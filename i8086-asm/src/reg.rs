//! Architectural register identifiers and sub-register access.

use std::fmt;

/// One of the 14 architectural registers of the 8086.
///
/// Order matches the `reg`/`r/m` field encoding for 16-bit operands
/// (`A, C, D, B, SP, BP, SI, DI`), not declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    A,
    B,
    C,
    D,
    Sp,
    Bp,
    Si,
    Di,
    Es,
    Cs,
    Ss,
    Ds,
    Ip,
    Flags,
}

impl Reg {
    pub const COUNT: usize = 14;

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Reg::A => "ax",
            Reg::B => "bx",
            Reg::C => "cx",
            Reg::D => "dx",
            Reg::Sp => "sp",
            Reg::Bp => "bp",
            Reg::Si => "si",
            Reg::Di => "di",
            Reg::Es => "es",
            Reg::Cs => "cs",
            Reg::Ss => "ss",
            Reg::Ds => "ds",
            Reg::Ip => "ip",
            Reg::Flags => "flags",
        };
        f.write_str(s)
    }
}

/// A register access: which register, which half, how wide.
///
/// Invariant: `size == 2 ⇒ offset == 0`. `size == 1` is only valid for
/// `A, B, C, D` (the byte-addressable accumulator-class registers).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegAccess {
    pub reg: Reg,
    pub offset: u8,
    pub size: u8,
}

impl RegAccess {
    pub fn word(reg: Reg) -> Self {
        RegAccess {
            reg,
            offset: 0,
            size: 2,
        }
    }

    pub fn low_byte(reg: Reg) -> Self {
        RegAccess {
            reg,
            offset: 0,
            size: 1,
        }
    }

    pub fn high_byte(reg: Reg) -> Self {
        RegAccess {
            reg,
            offset: 1,
            size: 1,
        }
    }

    /// NASM-style display name, e.g. `al`, `ah`, `ax`, `cx`.
    pub fn display_name(self) -> String {
        if self.size == 2 {
            self.reg.to_string()
        } else {
            let base = match self.reg {
                Reg::A => 'a',
                Reg::B => 'b',
                Reg::C => 'c',
                Reg::D => 'd',
                _ => unreachable!("byte access on non-accumulator-class register"),
            };
            let half = if self.offset == 0 { 'l' } else { 'h' };
            format!("{base}{half}")
        }
    }
}

impl fmt::Display for RegAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name())
    }
}
