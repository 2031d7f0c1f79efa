use super::{BlockBuilder, CPSR_OFFSET, CPU_SLOT};
use crate::arm::state::Cond;
use crate::jit::emitter::{Alu, ByteReg, Cc, HostReg, Label};

/// Source of the C flag after a flag-setting op
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CarryOut {
    /// Read from the host carry flag. Unsigned add carries on CF; ARM subtraction carries when
    /// there is no borrow.
    Host(Cc),
    /// Known at translation time, e.g. bit 31 of a rotated immediate
    Const(bool),
    /// Left unchanged
    Keep,
}

impl<'h> BlockBuilder<'h> {
    /// Run `body` only if `cond` passes against the guest flags
    pub(super) fn conditional(&mut self, cond: Cond, body: impl FnOnce(&mut Self)) {
        if cond == Cond::AL {
            body(self);
            return;
        }
        let skip = self.cond_skip(cond);
        body(self);
        self.asm.bind(skip);
    }

    /// Emit a jump to the returned label when `cond` fails. Host flags and all guest registers
    /// are preserved on both paths.
    pub(super) fn cond_skip(&mut self, cond: Cond) -> Label {
        let skip = self.asm.new_label();
        self.asm.push_temp(HostReg::Rax);
        self.asm.push_temp(HostReg::Rcx);
        let cpu_slot = self.slot(CPU_SLOT);
        self.asm.load64(HostReg::Rax, HostReg::Rsp, cpu_slot);
        self.asm.load32(HostReg::Rcx, HostReg::Rax, CPSR_OFFSET);
        self.asm.shr_ri(HostReg::Rcx, 28);
        self.asm.mov_ri(HostReg::Rax, cond.pass_mask() as u32);
        self.asm.shr_cl(HostReg::Rax);
        self.asm.alu_ri(Alu::And, HostReg::Rax, 1);
        self.asm.pop_temp(HostReg::Rcx);
        self.asm.pop_temp(HostReg::Rax);
        self.asm.jcc(Cc::E, skip);
        skip
    }

    /// Copy the host flags left by the previous op into the guest NZCV bits. N and Z come from
    /// SF and ZF; V from OF when `overflow` is set and cleared otherwise.
    pub(super) fn capture_flags(&mut self, carry: CarryOut, overflow: bool) {
        self.asm.push_temp(HostReg::Rax);
        self.asm.push_temp(HostReg::Rcx);
        self.asm.push_temp(HostReg::Rdx);

        self.asm.setcc(Cc::S, ByteReg::Al);
        self.asm.setcc(Cc::E, ByteReg::Ah);
        match carry {
            CarryOut::Host(cc) => self.asm.setcc(cc, ByteReg::Dl),
            CarryOut::Const(c) => self.asm.mov_r8_imm(ByteReg::Dl, c as u8),
            CarryOut::Keep => self.asm.mov_r8_imm(ByteReg::Dl, 0),
        }
        if overflow {
            self.asm.setcc(Cc::O, ByteReg::Dh);
        } else {
            self.asm.mov_r8_imm(ByteReg::Dh, 0);
        }

        // ecx = NZCV << 28
        self.asm.movzx_r8(HostReg::Rcx, ByteReg::Al);
        for b in [ByteReg::Ah, ByteReg::Dl, ByteReg::Dh] {
            self.asm.shl_ri(HostReg::Rcx, 1);
            self.asm.or_r8(ByteReg::Cl, b);
        }
        self.asm.shl_ri(HostReg::Rcx, 28);

        let keep = if carry == CarryOut::Keep { 0x2fff_ffff } else { 0x0fff_ffff };
        let cpu_slot = self.slot(CPU_SLOT);
        self.asm.load64(HostReg::Rax, HostReg::Rsp, cpu_slot);
        self.asm.and32_mem_imm(HostReg::Rax, CPSR_OFFSET, keep);
        self.asm.or32_mem_reg(HostReg::Rax, CPSR_OFFSET, HostReg::Rcx);

        self.asm.pop_temp(HostReg::Rdx);
        self.asm.pop_temp(HostReg::Rcx);
        self.asm.pop_temp(HostReg::Rax);
    }
}
