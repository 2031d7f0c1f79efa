use crate::arm::state::Reg;
use crate::jit::emitter::HostReg;

/// Where an ARM register lives while translated code runs
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Loc {
    Host(HostReg),
    /// The PC is never held in a register: every instruction's address is known at translation
    /// time, so reads of it become immediates.
    Pc,
}

/// R0-R14 each own a host register for the whole block. rsp is the only register left over.
pub const GUEST_REGS: [(Reg, HostReg); 15] = [
    (Reg::R0, HostReg::Rax),
    (Reg::R1, HostReg::Rcx),
    (Reg::R2, HostReg::Rdx),
    (Reg::R3, HostReg::Rbx),
    (Reg::R4, HostReg::Rbp),
    (Reg::R5, HostReg::Rsi),
    (Reg::R6, HostReg::Rdi),
    (Reg::R7, HostReg::R8),
    (Reg::R8, HostReg::R9),
    (Reg::R9, HostReg::R10),
    (Reg::R10, HostReg::R11),
    (Reg::R11, HostReg::R12),
    (Reg::IP, HostReg::R13),
    (Reg::SP, HostReg::R14),
    (Reg::LR, HostReg::R15),
];

pub fn loc(reg: Reg) -> Loc {
    match reg {
        Reg::PC => Loc::Pc,
        r => Loc::Host(GUEST_REGS[r.index()].1),
    }
}

/// Host register for anything but the PC
pub fn host(reg: Reg) -> Option<HostReg> {
    match loc(reg) {
        Loc::Host(h) => Some(h),
        Loc::Pc => None,
    }
}

/// Byte offset of a register in `CpuState`
pub fn state_offset(reg: Reg) -> i32 { 4 * reg.index() as i32 }
