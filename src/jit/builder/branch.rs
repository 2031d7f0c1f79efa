use super::reg_map::{host, state_offset};
use super::BlockBuilder;
use crate::arm::decode::{Branch, BranchTarget};
use crate::arm::state::{Cond, Reg};
use crate::jit::emitter::{Alu, HostReg};

impl<'h> BlockBuilder<'h> {
    /// Branches end the block. A failed condition exits to the next instruction.
    pub(super) fn branch(&mut self, b: &Branch, addr: u32) -> bool {
        let next = addr.wrapping_add(4);
        if b.target == BranchTarget::Reg(Reg::PC) {
            return false;
        }
        let skip = (b.cond != Cond::AL).then(|| self.cond_skip(b.cond));

        match b.target {
            BranchTarget::Reg(rm) => {
                self.spill();
                self.asm.load32(HostReg::Rcx, HostReg::Rax, state_offset(rm));
                self.asm.alu_ri(Alu::And, HostReg::Rcx, !1);
                self.asm.store32(HostReg::Rax, state_offset(Reg::PC), HostReg::Rcx);
                self.return_ok();
            }
            BranchTarget::Offset(off) => {
                if b.link {
                    if let Some(lr) = host(Reg::LR) {
                        self.asm.mov_ri(lr, next);
                    }
                }
                self.exit_to(addr.wrapping_add(8).wrapping_add(off as u32));
            }
        }

        if let Some(skip) = skip {
            self.asm.bind(skip);
            self.exit_to(next);
        }
        true
    }
}
