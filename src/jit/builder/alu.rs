use super::flags::CarryOut;
use super::reg_map::{host, loc, Loc};
use super::BlockBuilder;
use crate::arm::decode::{AluOp, DataProcessing, Operand2};
use crate::arm::state::Reg;
use crate::jit::emitter::{Alu, Cc, HostReg};

/// A data-processing input after register mapping
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Src {
    Reg(HostReg),
    Imm(u32),
}

impl Src {
    fn of(reg: Reg, addr: u32) -> Self {
        match loc(reg) {
            Loc::Host(h) => Src::Reg(h),
            Loc::Pc => Src::Imm(addr.wrapping_add(8)),
        }
    }

    fn is(self, r: HostReg) -> bool { self == Src::Reg(r) }
}

const SCRATCH: [HostReg; 4] = [HostReg::Rax, HostReg::Rcx, HostReg::Rdx, HostReg::Rbx];

/// A register not used by any of `srcs`, to be saved around its use
fn scratch(srcs: &[Src]) -> HostReg {
    SCRATCH
        .into_iter()
        .find(|r| !srcs.iter().any(|s| s.is(*r)))
        .unwrap_or(HostReg::Rbx)
}

impl<'h> BlockBuilder<'h> {
    /// Lower a data-processing instruction to host ALU ops. Returns false, with nothing
    /// emitted, for forms that go through the interpreter: shifted operands, carry-in ops,
    /// and writes to the PC.
    pub(super) fn data_processing(&mut self, dp: &DataProcessing, addr: u32) -> bool {
        use AluOp::*;
        if !matches!(dp.op, And | Eor | Orr | Sub | Add | Cmp | Cmn | Tst | Teq | Mov | Mvn) {
            return false;
        }
        let (b, carry) = match dp.operand2 {
            Operand2::Imm { imm8, rotate } => {
                let value = Operand2::imm_value(imm8, rotate);
                let carry = if rotate == 0 {
                    CarryOut::Keep
                } else {
                    CarryOut::Const(value >> 31 != 0)
                };
                (Src::Imm(value), carry)
            }
            op2 => match op2.plain_reg() {
                Some(rm) => (Src::of(rm, addr), CarryOut::Keep),
                None => return false,
            },
        };
        let dst = if dp.op.is_test() {
            None
        } else {
            match host(dp.rd) {
                Some(h) => Some(h),
                None => return false,
            }
        };
        let a = Src::of(dp.rn, addr);
        let (op, s) = (dp.op, dp.set_flags);
        self.conditional(dp.cond, |bb| bb.alu_body(op, s, dst, a, b, carry));
        true
    }

    fn alu_body(
        &mut self,
        op: AluOp,
        s: bool,
        dst: Option<HostReg>,
        a: Src,
        b: Src,
        carry: CarryOut,
    ) {
        match (op, dst) {
            (AluOp::Mov, Some(d)) | (AluOp::Mvn, Some(d)) => {
                self.mov_src(d, b);
                if op == AluOp::Mvn {
                    self.asm.not(d);
                }
                if s {
                    self.asm.test_rr(d, d);
                    self.capture_flags(carry, false);
                }
            }
            (AluOp::And, Some(d)) | (AluOp::Eor, Some(d)) | (AluOp::Orr, Some(d)) => {
                let x86 = match op {
                    AluOp::And => Alu::And,
                    AluOp::Eor => Alu::Xor,
                    _ => Alu::Or,
                };
                self.commutative(x86, d, a, b);
                if s {
                    self.capture_flags(carry, false);
                }
            }
            (AluOp::Add, Some(d)) => {
                self.commutative(Alu::Add, d, a, b);
                if s {
                    self.capture_flags(CarryOut::Host(Cc::B), true);
                }
            }
            (AluOp::Sub, Some(d)) => {
                self.subtract(d, a, b);
                if s {
                    self.capture_flags(CarryOut::Host(Cc::Ae), true);
                }
            }
            (AluOp::Cmp, _) => {
                match a {
                    Src::Reg(r) => self.op_src(Alu::Cmp, r, b),
                    Src::Imm(_) => self.scratch_op(Alu::Cmp, a, b),
                }
                self.capture_flags(CarryOut::Host(Cc::Ae), true);
            }
            (AluOp::Cmn, _) => {
                self.scratch_op(Alu::Add, a, b);
                self.capture_flags(CarryOut::Host(Cc::B), true);
            }
            (AluOp::Teq, _) => {
                self.scratch_op(Alu::Xor, a, b);
                self.capture_flags(carry, false);
            }
            (AluOp::Tst, _) => {
                self.test(a, b);
                self.capture_flags(carry, false);
            }
            _ => unreachable!("{} has no native lowering", op),
        }
    }

    fn mov_src(&mut self, dst: HostReg, src: Src) {
        match src {
            Src::Reg(r) if r == dst => {}
            Src::Reg(r) => self.asm.mov_rr(dst, r),
            Src::Imm(v) => self.asm.mov_ri(dst, v),
        }
    }

    fn op_src(&mut self, op: Alu, dst: HostReg, src: Src) {
        match src {
            Src::Reg(r) => self.asm.alu_rr(op, dst, r),
            Src::Imm(v) => self.asm.alu_ri(op, dst, v),
        }
    }

    /// dst = a op b, for ops where operand order doesn't matter
    fn commutative(&mut self, op: Alu, dst: HostReg, a: Src, b: Src) {
        if b.is(dst) {
            self.op_src(op, dst, a);
        } else {
            self.mov_src(dst, a);
            self.op_src(op, dst, b);
        }
    }

    fn subtract(&mut self, dst: HostReg, a: Src, b: Src) {
        if b.is(dst) && !a.is(dst) {
            let s = scratch(&[a, b]);
            self.asm.push_temp(s);
            self.mov_src(s, a);
            self.op_src(Alu::Sub, s, b);
            self.asm.mov_rr(dst, s);
            self.asm.pop_temp(s);
        } else {
            self.mov_src(dst, a);
            self.op_src(Alu::Sub, dst, b);
        }
    }

    /// Compute a op b into a saved temporary for its flags only
    fn scratch_op(&mut self, op: Alu, a: Src, b: Src) {
        let s = scratch(&[a, b]);
        self.asm.push_temp(s);
        self.mov_src(s, a);
        self.op_src(op, s, b);
        self.asm.pop_temp(s);
    }

    fn test(&mut self, a: Src, b: Src) {
        match (a, b) {
            (Src::Reg(x), Src::Reg(y)) => self.asm.test_rr(x, y),
            (Src::Reg(x), Src::Imm(v)) | (Src::Imm(v), Src::Reg(x)) => self.asm.test_ri(x, v),
            (Src::Imm(_), Src::Imm(v)) => {
                let s = scratch(&[]);
                self.asm.push_temp(s);
                self.mov_src(s, a);
                self.asm.test_ri(s, v);
                self.asm.pop_temp(s);
            }
        }
    }
}
