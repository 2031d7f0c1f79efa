use std::fmt::Display;

use super::state::{Cond, Reg};

/// Data-processing opcode, bits 24-21
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AluOp {
    And = 0x0,
    Eor = 0x1,
    Sub = 0x2,
    Rsb = 0x3,
    Add = 0x4,
    Adc = 0x5,
    Sbc = 0x6,
    Rsc = 0x7,
    Tst = 0x8,
    Teq = 0x9,
    Cmp = 0xa,
    Cmn = 0xb,
    Orr = 0xc,
    Mov = 0xd,
    Bic = 0xe,
    Mvn = 0xf,
}

const ALU_OPS: [AluOp; 16] = [
    AluOp::And,
    AluOp::Eor,
    AluOp::Sub,
    AluOp::Rsb,
    AluOp::Add,
    AluOp::Adc,
    AluOp::Sbc,
    AluOp::Rsc,
    AluOp::Tst,
    AluOp::Teq,
    AluOp::Cmp,
    AluOp::Cmn,
    AluOp::Orr,
    AluOp::Mov,
    AluOp::Bic,
    AluOp::Mvn,
];

impl AluOp {
    pub fn from_bits(bits: u32) -> Self { ALU_OPS[(bits & 0xf) as usize] }

    /// Comparison ops only set flags and never write Rd
    pub fn is_test(self) -> bool { matches!(self, AluOp::Tst | AluOp::Teq | AluOp::Cmp | AluOp::Cmn) }

    /// Ops that ignore Rn
    pub fn is_move(self) -> bool { matches!(self, AluOp::Mov | AluOp::Mvn) }
}

impl Display for AluOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", format!("{:?}", self).to_lowercase())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShiftType {
    Lsl = 0,
    Lsr = 1,
    Asr = 2,
    Ror = 3,
}

impl ShiftType {
    pub fn from_bits(bits: u32) -> Self {
        match bits & 3 {
            0 => ShiftType::Lsl,
            1 => ShiftType::Lsr,
            2 => ShiftType::Asr,
            _ => ShiftType::Ror,
        }
    }
}

/// Second operand of a data-processing instruction
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operand2 {
    /// `imm8` rotated right by `rotate * 2`
    Imm { imm8: u32, rotate: u32 },
    /// Register shifted by a 5-bit immediate
    Reg {
        rm: Reg,
        shift: ShiftType,
        amount: u32,
    },
    /// Register shifted by the bottom byte of another register
    RegShiftReg { rm: Reg, shift: ShiftType, rs: Reg },
}

impl Operand2 {
    pub fn imm_value(imm8: u32, rotate: u32) -> u32 { imm8.rotate_right(rotate * 2) }

    /// Plain unshifted register operand
    pub fn plain_reg(&self) -> Option<Reg> {
        match *self {
            Operand2::Reg {
                rm,
                shift: ShiftType::Lsl,
                amount: 0,
            } => Some(rm),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DataProcessing {
    pub cond: Cond,
    pub op: AluOp,
    pub set_flags: bool,
    pub rn: Reg,
    pub rd: Reg,
    pub operand2: Operand2,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemOffset {
    Imm(u32),
    Reg {
        rm: Reg,
        shift: ShiftType,
        amount: u32,
    },
}

/// Single register transfer (LDR/STR/LDRB/STRB)
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LoadStore {
    pub cond: Cond,
    pub load: bool,
    pub byte: bool,
    /// Apply the offset before the access (P)
    pub pre_index: bool,
    /// Offset is added rather than subtracted (U)
    pub add: bool,
    /// W bit. Post-indexed accesses always write back.
    pub writeback: bool,
    pub rn: Reg,
    pub rd: Reg,
    pub offset: MemOffset,
}

impl LoadStore {
    pub fn writes_back(&self) -> bool { !self.pre_index || self.writeback }
}

/// LDM/STM
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LoadStoreMultiple {
    pub cond: Cond,
    pub load: bool,
    pub pre_index: bool,
    pub add: bool,
    pub writeback: bool,
    /// S bit: user bank transfer, or CPSR restore when loading the PC
    pub psr: bool,
    pub rn: Reg,
    pub reg_list: u16,
}

impl LoadStoreMultiple {
    pub fn len(&self) -> u32 { self.reg_list.count_ones() }

    pub fn is_empty(&self) -> bool { self.reg_list == 0 }

    pub fn contains(&self, reg: Reg) -> bool { self.reg_list & (1 << reg.index()) != 0 }

    /// Listed registers, lowest first
    pub fn regs(&self) -> impl Iterator<Item = Reg> + '_ {
        (0..16u32)
            .filter(|i| self.reg_list & (1 << i) != 0)
            .map(Reg::from_index)
    }

    /// Address of the lowest listed register for a given base
    pub fn start_address(&self, base: u32) -> u32 {
        let size = 4 * self.len();
        match (self.pre_index, self.add) {
            (false, true) => base,
            (true, true) => base.wrapping_add(4),
            (false, false) => base.wrapping_sub(size).wrapping_add(4),
            (true, false) => base.wrapping_sub(size),
        }
    }

    pub fn final_base(&self, base: u32) -> u32 {
        let size = 4 * self.len();
        if self.add {
            base.wrapping_add(size)
        } else {
            base.wrapping_sub(size)
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BranchTarget {
    /// Byte offset relative to the instruction address plus 8
    Offset(i32),
    /// BX: target held in a register
    Reg(Reg),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Branch {
    pub cond: Cond,
    pub link: bool,
    pub target: BranchTarget,
}

impl Branch {
    /// Static target for an instruction at `addr`
    pub fn target_address(&self, addr: u32) -> Option<u32> {
        match self.target {
            BranchTarget::Offset(off) => Some(addr.wrapping_add(8).wrapping_add(off as u32)),
            BranchTarget::Reg(_) => None,
        }
    }
}

/// MRS / MSR
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StatusTransfer {
    Mrs {
        cond: Cond,
        rd: Reg,
        spsr: bool,
    },
    Msr {
        cond: Cond,
        spsr: bool,
        /// Field mask bits 19-16 (f, s, x, c)
        fields: u32,
        operand: Operand2,
    },
}

impl StatusTransfer {
    /// Byte mask selected by the MSR field bits
    pub fn field_mask(fields: u32) -> u32 {
        (0..4)
            .filter(|i| fields & (1 << i) != 0)
            .fold(0, |mask, i| mask | (0xff << (8 * i)))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Instruction {
    DataProcessing(DataProcessing),
    LoadStore(LoadStore),
    LoadStoreMultiple(LoadStoreMultiple),
    Branch(Branch),
    StatusTransfer(StatusTransfer),
    /// Coprocessor transfers and data operations, executed as no-ops
    Coprocessor { cond: Cond },
    Unknown { cond: Cond, word: u32 },
}

fn reg(word: u32, lsb: u32) -> Reg { Reg::from_index(word >> lsb) }

fn bit(word: u32, n: u32) -> bool { word & (1 << n) != 0 }

fn shifted_reg(word: u32) -> (Reg, ShiftType, u32) {
    (
        reg(word, 0),
        ShiftType::from_bits(word >> 5),
        (word >> 7) & 0x1f,
    )
}

/// Classify a 32-bit ARM word
pub fn decode(word: u32) -> Instruction {
    let cond = Cond::from_bits(word >> 28);
    let unknown = Instruction::Unknown { cond, word };

    match (word >> 25) & 0b111 {
        0b000 | 0b001 => decode_data_processing(word, cond).unwrap_or(unknown),
        0b010 => Instruction::LoadStore(decode_load_store(word, cond, MemOffset::Imm(word & 0xfff))),
        0b011 => {
            if bit(word, 4) {
                // Media instructions and the architecturally undefined space
                return unknown;
            }
            let (rm, shift, amount) = shifted_reg(word);
            let offset = MemOffset::Reg { rm, shift, amount };
            Instruction::LoadStore(decode_load_store(word, cond, offset))
        }
        0b100 => Instruction::LoadStoreMultiple(LoadStoreMultiple {
            cond,
            load: bit(word, 20),
            pre_index: bit(word, 24),
            add: bit(word, 23),
            writeback: bit(word, 21),
            psr: bit(word, 22),
            rn: reg(word, 16),
            reg_list: word as u16,
        }),
        0b101 => {
            // Sign extend the 24-bit word offset, then scale to bytes
            let offset = ((word << 8) as i32) >> 6;
            Instruction::Branch(Branch {
                cond,
                link: bit(word, 24),
                target: BranchTarget::Offset(offset),
            })
        }
        0b110 => Instruction::Coprocessor { cond },
        _ => {
            if bit(word, 24) {
                // SWI
                unknown
            } else {
                Instruction::Coprocessor { cond }
            }
        }
    }
}

fn decode_data_processing(word: u32, cond: Cond) -> Option<Instruction> {
    let immediate = bit(word, 25);
    if !immediate {
        if word & 0x0fff_fff0 == 0x012f_ff10 {
            return Some(Instruction::Branch(Branch {
                cond,
                link: false,
                target: BranchTarget::Reg(reg(word, 0)),
            }));
        }
        if bit(word, 7) && bit(word, 4) {
            // Multiplies, swaps and halfword transfers
            return None;
        }
    }

    let op = AluOp::from_bits(word >> 21);
    let set_flags = bit(word, 20);
    let operand2 = if immediate {
        Operand2::Imm {
            imm8: word & 0xff,
            rotate: (word >> 8) & 0xf,
        }
    } else if bit(word, 4) {
        Operand2::RegShiftReg {
            rm: reg(word, 0),
            shift: ShiftType::from_bits(word >> 5),
            rs: reg(word, 8),
        }
    } else {
        let (rm, shift, amount) = shifted_reg(word);
        Operand2::Reg { rm, shift, amount }
    };

    if op.is_test() && !set_flags {
        return decode_status_transfer(word, cond, operand2);
    }

    Some(Instruction::DataProcessing(DataProcessing {
        cond,
        op,
        set_flags,
        rn: reg(word, 16),
        rd: reg(word, 12),
        operand2,
    }))
}

fn decode_status_transfer(word: u32, cond: Cond, operand: Operand2) -> Option<Instruction> {
    let spsr = bit(word, 22);
    if word & 0x0fbf_0fff == 0x010f_0000 {
        Some(Instruction::StatusTransfer(StatusTransfer::Mrs {
            cond,
            rd: reg(word, 12),
            spsr,
        }))
    } else if word & 0x0fb0_f000 == 0x0320_f000 || word & 0x0fb0_fff0 == 0x0120_f000 {
        Some(Instruction::StatusTransfer(StatusTransfer::Msr {
            cond,
            spsr,
            fields: (word >> 16) & 0xf,
            operand,
        }))
    } else {
        None
    }
}

fn decode_load_store(word: u32, cond: Cond, offset: MemOffset) -> LoadStore {
    LoadStore {
        cond,
        load: bit(word, 20),
        byte: bit(word, 22),
        pre_index: bit(word, 24),
        add: bit(word, 23),
        writeback: bit(word, 21),
        rn: reg(word, 16),
        rd: reg(word, 12),
        offset,
    }
}

impl Instruction {
    pub fn cond(&self) -> Cond {
        match *self {
            Instruction::DataProcessing(DataProcessing { cond, .. })
            | Instruction::LoadStore(LoadStore { cond, .. })
            | Instruction::LoadStoreMultiple(LoadStoreMultiple { cond, .. })
            | Instruction::Branch(Branch { cond, .. })
            | Instruction::StatusTransfer(StatusTransfer::Mrs { cond, .. })
            | Instruction::StatusTransfer(StatusTransfer::Msr { cond, .. })
            | Instruction::Coprocessor { cond }
            | Instruction::Unknown { cond, .. } => cond,
        }
    }

    /// True if executing this may move the PC anywhere other than the next word
    pub fn writes_pc(&self) -> bool {
        match self {
            Instruction::DataProcessing(dp) => !dp.op.is_test() && dp.rd == Reg::PC,
            Instruction::LoadStore(ls) => {
                (ls.load && ls.rd == Reg::PC) || (ls.writes_back() && ls.rn == Reg::PC)
            }
            Instruction::LoadStoreMultiple(m) => {
                (m.load && m.contains(Reg::PC)) || (m.writeback && m.rn == Reg::PC)
            }
            Instruction::Branch(_) => true,
            Instruction::StatusTransfer(StatusTransfer::Mrs { rd, .. }) => *rd == Reg::PC,
            Instruction::StatusTransfer(StatusTransfer::Msr { .. })
            | Instruction::Coprocessor { .. }
            | Instruction::Unknown { .. } => false,
        }
    }
}
