//! Tiny ARM encoder for building test programs without an external assembler. Only the forms
//! the tests use are covered; every function returns an always-executed instruction, use `cond`
//! to change that.

pub const AL: u32 = 0xe;
pub const EQ: u32 = 0x0;
pub const NE: u32 = 0x1;
pub const HS: u32 = 0x2;
pub const LO: u32 = 0x3;
pub const GE: u32 = 0xa;
pub const LT: u32 = 0xb;
pub const GT: u32 = 0xc;
pub const LE: u32 = 0xd;

pub const SP: u32 = 13;
pub const LR: u32 = 14;
pub const PC: u32 = 15;

/// Data-processing opcodes
#[derive(Copy, Clone, Debug)]
pub enum Op {
    And = 0x0,
    Eor = 0x1,
    Sub = 0x2,
    Rsb = 0x3,
    Add = 0x4,
    Tst = 0x8,
    Teq = 0x9,
    Cmp = 0xa,
    Cmn = 0xb,
    Orr = 0xc,
    Mov = 0xd,
    Bic = 0xe,
    Mvn = 0xf,
}

impl Op {
    fn is_test(self) -> bool { matches!(self, Op::Tst | Op::Teq | Op::Cmp | Op::Cmn) }
}

/// Replace the condition field
pub fn cond(c: u32, word: u32) -> u32 { (word & 0x0fff_ffff) | (c << 28) }

/// Set the S bit
pub fn s(word: u32) -> u32 { word | 1 << 20 }

/// Encode `value` as an ARM rotated immediate, if it has one
pub fn encode_imm(value: u32) -> Option<u32> {
    (0..16).find_map(|rot| {
        let imm8 = value.rotate_left(2 * rot);
        (imm8 <= 0xff).then_some(rot << 8 | imm8)
    })
}

fn dp(op: Op, rd: u32, rn: u32, operand2: u32) -> u32 {
    let set_flags = if op.is_test() { 1 << 20 } else { 0 };
    AL << 28 | (op as u32) << 21 | set_flags | rn << 16 | rd << 12 | operand2
}

/// `op rd, rn, #imm`. Panics if `imm` can't be encoded.
pub fn dp_imm(op: Op, rd: u32, rn: u32, imm: u32) -> u32 {
    let operand2 = encode_imm(imm).unwrap_or_else(|| panic!("{:#x} is not an immediate", imm));
    dp(op, rd, rn, 1 << 25 | operand2)
}

/// `op rd, rn, rm, <shift> #amount` with shift 0-3 = lsl, lsr, asr, ror
pub fn dp_reg(op: Op, rd: u32, rn: u32, rm: u32, shift: u32, amount: u32) -> u32 {
    dp(op, rd, rn, (amount & 0x1f) << 7 | (shift & 3) << 5 | rm)
}

pub fn mov_imm(rd: u32, imm: u32) -> u32 { dp_imm(Op::Mov, rd, 0, imm) }

pub fn mov(rd: u32, rm: u32) -> u32 { dp_reg(Op::Mov, rd, 0, rm, 0, 0) }

pub fn add(rd: u32, rn: u32, rm: u32) -> u32 { dp_reg(Op::Add, rd, rn, rm, 0, 0) }

pub fn sub_imm(rd: u32, rn: u32, imm: u32) -> u32 { dp_imm(Op::Sub, rd, rn, imm) }

pub fn add_imm(rd: u32, rn: u32, imm: u32) -> u32 { dp_imm(Op::Add, rd, rn, imm) }

pub fn cmp_imm(rn: u32, imm: u32) -> u32 { dp_imm(Op::Cmp, 0, rn, imm) }

/// Single register transfer with an immediate offset. `pre` selects pre-indexing, `wb` the W bit.
pub fn transfer(load: bool, byte: bool, rd: u32, rn: u32, offset: i32, pre: bool, wb: bool) -> u32 {
    let up = offset >= 0;
    AL << 28
        | 1 << 26
        | (pre as u32) << 24
        | (up as u32) << 23
        | (byte as u32) << 22
        | (wb as u32) << 21
        | (load as u32) << 20
        | rn << 16
        | rd << 12
        | (offset.unsigned_abs() & 0xfff)
}

/// `ldr rd, [rn, #offset]`
pub fn ldr(rd: u32, rn: u32, offset: i32) -> u32 { transfer(true, false, rd, rn, offset, true, false) }

/// `str rd, [rn, #offset]`
pub fn str(rd: u32, rn: u32, offset: i32) -> u32 { transfer(false, false, rd, rn, offset, true, false) }

/// `ldrb rd, [rn], #offset`
pub fn ldrb_post(rd: u32, rn: u32, offset: i32) -> u32 {
    transfer(true, true, rd, rn, offset, false, false)
}

/// `strb rd, [rn], #offset`
pub fn strb_post(rd: u32, rn: u32, offset: i32) -> u32 {
    transfer(false, true, rd, rn, offset, false, false)
}

fn multiple(load: bool, pre: bool, up: bool, wb: bool, rn: u32, regs: &[u32]) -> u32 {
    let list = regs.iter().fold(0u32, |l, &r| l | 1 << r);
    AL << 28
        | 0b100 << 25
        | (pre as u32) << 24
        | (up as u32) << 23
        | (wb as u32) << 21
        | (load as u32) << 20
        | rn << 16
        | list
}

/// `ldmia rn!, {regs}`
pub fn ldmia(rn: u32, regs: &[u32]) -> u32 { multiple(true, false, true, true, rn, regs) }

/// `stmia rn!, {regs}`
pub fn stmia(rn: u32, regs: &[u32]) -> u32 { multiple(false, false, true, true, rn, regs) }

/// `push {regs}`
pub fn push(regs: &[u32]) -> u32 { multiple(false, true, false, true, SP, regs) }

/// `pop {regs}`
pub fn pop(regs: &[u32]) -> u32 { multiple(true, false, true, true, SP, regs) }

/// Branch from `from` to `to`
pub fn b(from: u32, to: u32) -> u32 { branch(false, from, to) }

pub fn bl(from: u32, to: u32) -> u32 { branch(true, from, to) }

fn branch(link: bool, from: u32, to: u32) -> u32 {
    let offset = to.wrapping_sub(from.wrapping_add(8)) as i32 >> 2;
    AL << 28 | 0b101 << 25 | (link as u32) << 24 | (offset as u32 & 0x00ff_ffff)
}

pub fn bx(rm: u32) -> u32 { AL << 28 | 0x012f_ff10 | rm }

/// `b .`
pub const HALT: u32 = 0xeafffffe;

/// Little-endian image of `words`
pub fn assemble(words: &[u32]) -> Vec<u8> { words.iter().flat_map(|w| w.to_le_bytes()).collect() }
