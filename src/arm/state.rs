pub mod cond;

use std::fmt::{self, Display};
use std::ops::{Index, IndexMut};

pub use cond::Cond;

/// Emulated CPU register file and status registers. The layout is fixed since translated code
/// addresses the registers and CPSR by byte offset.
#[repr(C)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CpuState {
    pub regs: [u32; NUM_REGS],
    pub cpsr: u32,
    pub spsr: u32,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reg {
    R0 = 0,
    R1 = 1,
    R2 = 2,
    R3 = 3,
    R4 = 4,
    R5 = 5,
    R6 = 6,
    R7 = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    IP = 12,
    SP = 13,
    LR = 14,
    PC = 15,
}

pub const NUM_REGS: usize = 16;

pub const REG_ITEMS: [Reg; NUM_REGS] = [
    Reg::R0,
    Reg::R1,
    Reg::R2,
    Reg::R3,
    Reg::R4,
    Reg::R5,
    Reg::R6,
    Reg::R7,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
    Reg::IP,
    Reg::SP,
    Reg::LR,
    Reg::PC,
];

// A bitmask for a flag, and its name
#[derive(Copy, Clone, Debug)]
pub struct Flag(pub u32, pub &'static str);

pub const V: Flag = Flag(1 << 28, "v");
pub const C: Flag = Flag(1 << 29, "c");
pub const Z: Flag = Flag(1 << 30, "z");
pub const N: Flag = Flag(1 << 31, "n");

pub const FLAGS_MASK: u32 = 0xf000_0000;
pub const IRQ_DISABLE: u32 = 1 << 7;
pub const FIQ_DISABLE: u32 = 1 << 6;
pub const MODE_MASK: u32 = 0x1f;

/// Processor mode held in CPSR[4:0]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    User = 0x10,
    Fiq = 0x11,
    Irq = 0x12,
    Supervisor = 0x13,
    Abort = 0x17,
    Undefined = 0x1b,
    System = 0x1f,
}

impl Mode {
    pub fn from_bits(bits: u32) -> Option<Self> {
        Some(match bits & MODE_MASK {
            0x10 => Mode::User,
            0x11 => Mode::Fiq,
            0x12 => Mode::Irq,
            0x13 => Mode::Supervisor,
            0x17 => Mode::Abort,
            0x1b => Mode::Undefined,
            0x1f => Mode::System,
            _ => return None,
        })
    }
}

impl Reg {
    pub fn from_index(i: u32) -> Reg { REG_ITEMS[(i & 0xf) as usize] }

    pub fn index(self) -> usize { self as usize }
}

impl Index<Reg> for [u32] {
    type Output = u32;

    fn index(&self, index: Reg) -> &Self::Output { &self[index as usize] }
}

impl IndexMut<Reg> for [u32] {
    fn index_mut(&mut self, index: Reg) -> &mut Self::Output { &mut self[index as usize] }
}

impl Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match *self {
                Reg::R0 => "r0",
                Reg::R1 => "r1",
                Reg::R2 => "r2",
                Reg::R3 => "r3",
                Reg::R4 => "r4",
                Reg::R5 => "r5",
                Reg::R6 => "r6",
                Reg::R7 => "r7",
                Reg::R8 => "r8",
                Reg::R9 => "r9",
                Reg::R10 => "r10",
                Reg::R11 => "r11",
                Reg::IP => "ip",
                Reg::SP => "sp",
                Reg::LR => "lr",
                Reg::PC => "pc",
            }
        )
    }
}

impl fmt::Debug for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self) }
}

impl Default for CpuState {
    fn default() -> Self {
        Self {
            regs: [0; NUM_REGS],
            cpsr: Mode::Supervisor as u32 | IRQ_DISABLE | FIQ_DISABLE,
            spsr: 0,
        }
    }
}

impl CpuState {
    pub fn new() -> Self { Self::default() }

    /// Zeroes the register file, then points the PC at `entry` and the stack pointer at
    /// `stack_top`. Status registers return to the reset state (supervisor, interrupts masked).
    pub fn reset(&mut self, entry: u32, stack_top: u32) {
        *self = Self::default();
        self.regs[Reg::PC] = entry;
        self.regs[Reg::SP] = stack_top;
    }

    pub fn pc(&self) -> u32 { self.regs[Reg::PC] }

    pub fn set_pc(&mut self, addr: u32) { self.regs[Reg::PC] = addr; }

    /// Out of range indices read as zero
    pub fn get_register(&self, i: usize) -> u32 { self.regs.get(i).copied().unwrap_or(0) }

    pub fn set_register(&mut self, i: usize, value: u32) {
        if let Some(r) = self.regs.get_mut(i) {
            *r = value;
        }
    }

    pub fn mode(&self) -> Option<Mode> { Mode::from_bits(self.cpsr) }

    pub fn flag(&self, flag: Flag) -> bool { self.cpsr & flag.0 != 0 }

    pub fn set_flag(&mut self, flag: Flag, set: bool) {
        if set {
            self.cpsr |= flag.0;
        } else {
            self.cpsr &= !flag.0;
        }
    }

    /// NZCV as the low 4 bits
    pub fn nzcv(&self) -> u32 { self.cpsr >> 28 }

    pub fn evaluate_condition(&self, cond: u32) -> bool { Cond::from_bits(cond).passes(self.cpsr) }

    /// Clears NZCV, then sets N and Z from `result` and C from `carry_out`. V is left clear.
    pub fn update_flags(&mut self, result: u32, carry_out: bool) {
        self.cpsr &= !FLAGS_MASK;
        self.set_flag(N, result & (1 << 31) != 0);
        self.set_flag(Z, result == 0);
        self.set_flag(C, carry_out);
    }

    /// Flag update for arithmetic results, where V reflects signed overflow
    pub fn update_flags_arith(&mut self, result: u32, carry_out: bool, overflow: bool) {
        self.update_flags(result, carry_out);
        self.set_flag(V, overflow);
    }
}

impl Display for CpuState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for r in REG_ITEMS {
            let rs = format!("{}", r);
            let padding: String = vec![" "; 5 - rs.len()].concat();
            writeln!(f, "{}:{}0x{:08x}", rs, padding, self.regs[r])?;
        }
        let flags: String = [N, Z, C, V]
            .iter()
            .map(|fl| {
                if self.flag(*fl) {
                    fl.1.to_uppercase()
                } else {
                    fl.1.to_string()
                }
            })
            .collect();
        writeln!(f, "cpsr: 0x{:08x} [{}]", self.cpsr, flags)?;
        match self.mode() {
            Some(m) => writeln!(f, "mode: {:?}", m),
            None => writeln!(f, "mode: invalid ({:#04x})", self.cpsr & MODE_MASK),
        }
    }
}
