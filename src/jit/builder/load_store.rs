use super::reg_map::state_offset;
use super::{BlockBuilder, BYTE_ACCESS, CPU_SLOT, SCRATCH_SLOT};
use crate::arm::decode::{LoadStore, LoadStoreMultiple, MemOffset, ShiftType};
use crate::arm::state::Reg;
use crate::jit::emitter::{Alu, HostReg};

impl<'h> BlockBuilder<'h> {
    /// Address arithmetic is native; the access itself goes through the bus helpers so MMIO and
    /// unmapped accesses behave as in the interpreter.
    pub(super) fn load_store(&mut self, ls: &LoadStore, addr: u32) -> bool {
        let writes_back = ls.writes_back();
        let supported = ls.rd != Reg::PC
            && !(writes_back && ls.rn == Reg::PC)
            && !(!ls.load && writes_back && ls.rd == ls.rn)
            && match ls.offset {
                MemOffset::Imm(_) => true,
                MemOffset::Reg { rm, shift, .. } => rm != Reg::PC && shift == ShiftType::Lsl,
            };
        if !supported {
            return false;
        }
        let ls = *ls;
        self.conditional(ls.cond, |bb| bb.load_store_body(&ls, addr));
        true
    }

    fn load_store_body(&mut self, ls: &LoadStore, addr: u32) {
        let op = if ls.add { Alu::Add } else { Alu::Sub };
        self.spill();

        // edx = base, esi = base +/- offset
        if ls.rn == Reg::PC {
            self.asm.mov_ri(HostReg::Rdx, addr.wrapping_add(8));
        } else {
            self.asm.load32(HostReg::Rdx, HostReg::Rax, state_offset(ls.rn));
        }
        self.asm.mov_rr(HostReg::Rsi, HostReg::Rdx);
        match ls.offset {
            MemOffset::Imm(imm) => self.asm.alu_ri(op, HostReg::Rsi, imm),
            MemOffset::Reg { rm, amount, .. } => {
                self.asm.load32(HostReg::Rcx, HostReg::Rax, state_offset(rm));
                if amount > 0 {
                    self.asm.shl_ri(HostReg::Rcx, amount as u8);
                }
                self.asm.alu_rr(op, HostReg::Rsi, HostReg::Rcx);
            }
        }
        if ls.writes_back() {
            self.asm.store32(HostReg::Rax, state_offset(ls.rn), HostReg::Rsi);
        }
        if ls.pre_index {
            self.asm.mov_rr(HostReg::Rdx, HostReg::Rsi);
        }

        let access = ls.rd.index() as u32 | if ls.byte { BYTE_ACCESS } else { 0 };
        self.asm.mov_ri(HostReg::Rcx, access);
        self.call_helper(if ls.load { self.helpers.load } else { self.helpers.store });
        self.reload();
    }

    /// LDM/STM without the PC. One helper call per listed register.
    pub(super) fn load_store_multiple(&mut self, m: &LoadStoreMultiple) -> bool {
        if m.is_empty() || m.psr || m.rn == Reg::PC || m.contains(Reg::PC) {
            return false;
        }
        let m = *m;
        self.conditional(m.cond, |bb| bb.load_store_multiple_body(&m));
        true
    }

    fn load_store_multiple_body(&mut self, m: &LoadStoreMultiple) {
        // Both depend only on the base, so they reduce to constant deltas
        let start_delta = m.start_address(0);
        let final_delta = m.final_base(0);
        let helper = if m.load { self.helpers.load } else { self.helpers.store };

        let scratch = self.slot(SCRATCH_SLOT);

        self.spill();
        self.asm.load32(HostReg::Rdx, HostReg::Rax, state_offset(m.rn));
        if start_delta != 0 {
            self.asm.alu_ri(Alu::Add, HostReg::Rdx, start_delta);
        }
        self.asm.store32(HostReg::Rsp, scratch, HostReg::Rdx);

        // Loads write back first so a loaded base wins
        if m.writeback && m.load {
            self.write_back_base(m.rn, final_delta);
        }
        for (k, r) in m.regs().enumerate() {
            self.asm.load32(HostReg::Rdx, HostReg::Rsp, scratch);
            if k > 0 {
                self.asm.alu_ri(Alu::Add, HostReg::Rdx, 4 * k as u32);
            }
            self.asm.mov_ri(HostReg::Rcx, r.index() as u32);
            self.call_helper(helper);
        }
        if m.writeback && !m.load {
            self.write_back_base(m.rn, final_delta);
        }
        self.reload();
    }

    /// rn += delta in the spilled state
    fn write_back_base(&mut self, rn: Reg, delta: u32) {
        let cpu_slot = self.slot(CPU_SLOT);
        self.asm.load64(HostReg::Rax, HostReg::Rsp, cpu_slot);
        self.asm.load32(HostReg::Rcx, HostReg::Rax, state_offset(rn));
        self.asm.alu_ri(Alu::Add, HostReg::Rcx, delta);
        self.asm.store32(HostReg::Rax, state_offset(rn), HostReg::Rcx);
    }
}
