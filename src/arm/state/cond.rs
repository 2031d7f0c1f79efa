use std::fmt::Display;

use super::{C, N, V, Z};

/// 4-bit ARM condition field
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Cond {
    EQ = 0x0,
    NE = 0x1,
    HS = 0x2,
    LO = 0x3,
    MI = 0x4,
    PL = 0x5,
    VS = 0x6,
    VC = 0x7,
    HI = 0x8,
    LS = 0x9,
    GE = 0xa,
    LT = 0xb,
    GT = 0xc,
    LE = 0xd,
    AL = 0xe,
    NV = 0xf,
}

const CONDS: [Cond; 16] = [
    Cond::EQ,
    Cond::NE,
    Cond::HS,
    Cond::LO,
    Cond::MI,
    Cond::PL,
    Cond::VS,
    Cond::VC,
    Cond::HI,
    Cond::LS,
    Cond::GE,
    Cond::LT,
    Cond::GT,
    Cond::LE,
    Cond::AL,
    Cond::NV,
];

impl Cond {
    pub fn from_bits(bits: u32) -> Cond { CONDS[(bits & 0xf) as usize] }

    /// Evaluate against the flags in `cpsr`. NV never passes.
    pub fn passes(self, cpsr: u32) -> bool {
        let n = cpsr & N.0 != 0;
        let z = cpsr & Z.0 != 0;
        let c = cpsr & C.0 != 0;
        let v = cpsr & V.0 != 0;
        match self {
            Cond::EQ => z,
            Cond::NE => !z,
            Cond::HS => c,
            Cond::LO => !c,
            Cond::MI => n,
            Cond::PL => !n,
            Cond::VS => v,
            Cond::VC => !v,
            Cond::HI => c && !z,
            Cond::LS => !c || z,
            Cond::GE => n == v,
            Cond::LT => n != v,
            Cond::GT => !z && n == v,
            Cond::LE => z || n != v,
            Cond::AL => true,
            Cond::NV => false,
        }
    }

    /// Bit i is set when the condition passes with NZCV == i. Lets generated code evaluate a
    /// condition with a single shift of this mask.
    pub fn pass_mask(self) -> u16 {
        (0..16u32)
            .filter(|nzcv| self.passes(nzcv << 28))
            .fold(0, |mask, nzcv| mask | (1 << nzcv))
    }
}

impl Display for Cond {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Cond::EQ => "eq",
            Cond::NE => "ne",
            Cond::HS => "hs",
            Cond::LO => "lo",
            Cond::MI => "mi",
            Cond::PL => "pl",
            Cond::VS => "vs",
            Cond::VC => "vc",
            Cond::HI => "hi",
            Cond::LS => "ls",
            Cond::GE => "ge",
            Cond::LT => "lt",
            Cond::GT => "gt",
            Cond::LE => "le",
            Cond::AL => "",
            Cond::NV => "nv",
        };
        write!(f, "{}", s)
    }
}
