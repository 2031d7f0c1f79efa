//! Minimal x86-64 assembler covering the instruction forms the block builder needs. All
//! arithmetic is 32-bit unless the method name says otherwise.

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HostReg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl HostReg {
    fn code(self) -> u8 { self as u8 }

    fn low(self) -> u8 { self as u8 & 7 }
}

/// Legacy 8-bit registers, encodable without a REX prefix
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ByteReg {
    Al = 0,
    Cl = 1,
    Dl = 2,
    Ah = 4,
    Dh = 6,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Cc {
    O = 0x0,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    S = 0x8,
}

/// Two-operand integer ops sharing the 0x01/0x81 encoding family
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Alu {
    Add,
    Or,
    And,
    Sub,
    Xor,
    Cmp,
}

impl Alu {
    fn rr_opcode(self) -> u8 {
        match self {
            Alu::Add => 0x01,
            Alu::Or => 0x09,
            Alu::And => 0x21,
            Alu::Sub => 0x29,
            Alu::Xor => 0x31,
            Alu::Cmp => 0x39,
        }
    }

    /// ModRM reg field for the immediate form
    fn ext(self) -> u8 {
        match self {
            Alu::Add => 0,
            Alu::Or => 1,
            Alu::And => 4,
            Alu::Sub => 5,
            Alu::Xor => 6,
            Alu::Cmp => 7,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Default)]
pub struct Assembler {
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    /// (position of rel32 field, target)
    fixups: Vec<(usize, Label)>,
    /// Temporaries pushed on top of the block frame
    depth: u32,
}

impl Assembler {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.code.len() }

    pub fn is_empty(&self) -> bool { self.code.is_empty() }

    /// Bytes pushed since the frame was set up
    pub fn stack_depth(&self) -> i32 { 8 * self.depth as i32 }

    /// Resolve jumps. None if a label was never bound.
    pub fn finish(mut self) -> Option<Vec<u8>> {
        for (pos, label) in std::mem::take(&mut self.fixups) {
            let target = self.labels[label.0]?;
            let rel = target as i64 - (pos as i64 + 4);
            self.code[pos..pos + 4].copy_from_slice(&(rel as i32).to_le_bytes());
        }
        Some(self.code)
    }

    #[cfg(test)]
    pub fn code(&self) -> &[u8] { &self.code }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: Label) { self.labels[label.0] = Some(self.code.len()); }

    fn byte(&mut self, b: u8) { self.code.push(b); }

    fn imm32(&mut self, imm: u32) { self.code.extend_from_slice(&imm.to_le_bytes()); }

    fn rex(&mut self, w: bool, reg: u8, rm: u8) {
        let rex = 0x40 | ((w as u8) << 3) | (((reg >> 3) & 1) << 2) | ((rm >> 3) & 1);
        if rex != 0x40 {
            self.byte(rex);
        }
    }

    fn modrm_reg(&mut self, reg: u8, rm: u8) { self.byte(0xc0 | ((reg & 7) << 3) | (rm & 7)); }

    /// `[base + disp32]`
    fn modrm_mem(&mut self, reg: u8, base: HostReg, disp: i32) {
        self.byte(0x80 | ((reg & 7) << 3) | base.low());
        if base.low() == 4 {
            // rsp and r12 need a SIB byte
            self.byte(0x24);
        }
        self.imm32(disp as u32);
    }

    fn rel32(&mut self, label: Label) {
        self.fixups.push((self.code.len(), label));
        self.imm32(0);
    }

    pub fn mov_rr(&mut self, dst: HostReg, src: HostReg) {
        self.rex(false, src.code(), dst.code());
        self.byte(0x89);
        self.modrm_reg(src.code(), dst.code());
    }

    pub fn mov_ri(&mut self, dst: HostReg, imm: u32) {
        self.rex(false, 0, dst.code());
        self.byte(0xb8 + dst.low());
        self.imm32(imm);
    }

    pub fn mov64_ri(&mut self, dst: HostReg, imm: u64) {
        self.rex(true, 0, dst.code());
        self.byte(0xb8 + dst.low());
        self.code.extend_from_slice(&imm.to_le_bytes());
    }

    pub fn alu_rr(&mut self, op: Alu, dst: HostReg, src: HostReg) {
        self.rex(false, src.code(), dst.code());
        self.byte(op.rr_opcode());
        self.modrm_reg(src.code(), dst.code());
    }

    pub fn alu_ri(&mut self, op: Alu, dst: HostReg, imm: u32) {
        self.rex(false, 0, dst.code());
        self.byte(0x81);
        self.modrm_reg(op.ext(), dst.code());
        self.imm32(imm);
    }

    pub fn test_rr(&mut self, a: HostReg, b: HostReg) {
        self.rex(false, b.code(), a.code());
        self.byte(0x85);
        self.modrm_reg(b.code(), a.code());
    }

    pub fn test_ri(&mut self, a: HostReg, imm: u32) {
        self.rex(false, 0, a.code());
        self.byte(0xf7);
        self.modrm_reg(0, a.code());
        self.imm32(imm);
    }

    pub fn not(&mut self, r: HostReg) {
        self.rex(false, 0, r.code());
        self.byte(0xf7);
        self.modrm_reg(2, r.code());
    }

    pub fn shl_ri(&mut self, r: HostReg, n: u8) {
        self.rex(false, 0, r.code());
        self.byte(0xc1);
        self.modrm_reg(4, r.code());
        self.byte(n);
    }

    pub fn shr_ri(&mut self, r: HostReg, n: u8) {
        self.rex(false, 0, r.code());
        self.byte(0xc1);
        self.modrm_reg(5, r.code());
        self.byte(n);
    }

    pub fn shr_cl(&mut self, r: HostReg) {
        self.rex(false, 0, r.code());
        self.byte(0xd3);
        self.modrm_reg(5, r.code());
    }

    pub fn load32(&mut self, dst: HostReg, base: HostReg, disp: i32) {
        self.rex(false, dst.code(), base.code());
        self.byte(0x8b);
        self.modrm_mem(dst.code(), base, disp);
    }

    pub fn store32(&mut self, base: HostReg, disp: i32, src: HostReg) {
        self.rex(false, src.code(), base.code());
        self.byte(0x89);
        self.modrm_mem(src.code(), base, disp);
    }

    pub fn store32_imm(&mut self, base: HostReg, disp: i32, imm: u32) {
        self.rex(false, 0, base.code());
        self.byte(0xc7);
        self.modrm_mem(0, base, disp);
        self.imm32(imm);
    }

    pub fn load64(&mut self, dst: HostReg, base: HostReg, disp: i32) {
        self.rex(true, dst.code(), base.code());
        self.byte(0x8b);
        self.modrm_mem(dst.code(), base, disp);
    }

    pub fn store64(&mut self, base: HostReg, disp: i32, src: HostReg) {
        self.rex(true, src.code(), base.code());
        self.byte(0x89);
        self.modrm_mem(src.code(), base, disp);
    }

    pub fn xchg64_mem(&mut self, reg: HostReg, base: HostReg, disp: i32) {
        self.rex(true, reg.code(), base.code());
        self.byte(0x87);
        self.modrm_mem(reg.code(), base, disp);
    }

    pub fn and32_mem_imm(&mut self, base: HostReg, disp: i32, imm: u32) {
        self.rex(false, 0, base.code());
        self.byte(0x81);
        self.modrm_mem(4, base, disp);
        self.imm32(imm);
    }

    pub fn or32_mem_reg(&mut self, base: HostReg, disp: i32, src: HostReg) {
        self.rex(false, src.code(), base.code());
        self.byte(0x09);
        self.modrm_mem(src.code(), base, disp);
    }

    pub fn setcc(&mut self, cc: Cc, dst: ByteReg) {
        self.byte(0x0f);
        self.byte(0x90 + cc as u8);
        self.modrm_reg(0, dst as u8);
    }

    pub fn mov_r8_imm(&mut self, dst: ByteReg, imm: u8) {
        self.byte(0xb0 + dst as u8);
        self.byte(imm);
    }

    pub fn or_r8(&mut self, dst: ByteReg, src: ByteReg) {
        self.byte(0x08);
        self.modrm_reg(src as u8, dst as u8);
    }

    /// `movzx dst, src`. `dst` must be one of the first eight registers.
    pub fn movzx_r8(&mut self, dst: HostReg, src: ByteReg) {
        debug_assert!(dst.code() < 8);
        self.byte(0x0f);
        self.byte(0xb6);
        self.modrm_reg(dst.code(), src as u8);
    }

    /// Save a callee-saved register as part of the frame
    pub fn push(&mut self, r: HostReg) {
        self.rex(false, 0, r.code());
        self.byte(0x50 + r.low());
    }

    pub fn pop(&mut self, r: HostReg) {
        self.rex(false, 0, r.code());
        self.byte(0x58 + r.low());
    }

    /// Push a temporary. Frame slots move up by 8 until the matching `pop_temp`.
    pub fn push_temp(&mut self, r: HostReg) {
        self.push(r);
        self.depth += 1;
    }

    pub fn pop_temp(&mut self, r: HostReg) {
        self.pop(r);
        self.depth -= 1;
    }

    pub fn sub_rsp(&mut self, n: u8) { self.code.extend_from_slice(&[0x48, 0x83, 0xec, n]); }

    pub fn add_rsp(&mut self, n: u8) { self.code.extend_from_slice(&[0x48, 0x83, 0xc4, n]); }

    pub fn call_r(&mut self, r: HostReg) {
        self.rex(false, 0, r.code());
        self.byte(0xff);
        self.modrm_reg(2, r.code());
    }

    pub fn ret(&mut self) { self.byte(0xc3); }

    pub fn jcc(&mut self, cc: Cc, label: Label) {
        self.byte(0x0f);
        self.byte(0x80 + cc as u8);
        self.rel32(label);
    }
}
