use log::{trace, warn};

use super::bus::Bus;
use super::decode::{
    decode, AluOp, Branch, BranchTarget, DataProcessing, Instruction, LoadStore,
    LoadStoreMultiple, MemOffset, Operand2, ShiftType, StatusTransfer,
};
use super::disasm;
use super::state::{CpuState, Reg, C};

/// Result of executing a single instruction
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Executed,
    /// Condition failed
    Skipped,
    /// Decoded but not implemented. The PC still advances.
    Unhandled { addr: u32, word: u32 },
    /// Unconditional branch to itself
    SelfLoop { addr: u32 },
}

/// Fetch, decode and execute the instruction at the PC
pub fn step(cpu: &mut CpuState, bus: &mut Bus) -> StepOutcome {
    let addr = cpu.pc();
    let word = bus.read32(addr);
    execute(cpu, bus, &decode(word), addr, word)
}

/// Execute an already fetched instruction as if it were at `addr`. Leaves the PC at the next
/// instruction to run.
pub fn execute(
    cpu: &mut CpuState,
    bus: &mut Bus,
    instr: &Instruction,
    addr: u32,
    word: u32,
) -> StepOutcome {
    if !instr.cond().passes(cpu.cpsr) {
        cpu.set_pc(addr.wrapping_add(4));
        return StepOutcome::Skipped;
    }
    let mut exec = Exec {
        cpu: &mut *cpu,
        bus: &mut *bus,
        addr,
    };
    let outcome = match instr {
        Instruction::DataProcessing(dp) => exec.data_processing(dp),
        Instruction::LoadStore(ls) => exec.load_store(ls),
        Instruction::LoadStoreMultiple(m) => exec.load_store_multiple(m),
        Instruction::Branch(b) => exec.branch(b),
        Instruction::StatusTransfer(st) => exec.status_transfer(st),
        Instruction::Coprocessor { .. } => {
            trace!("coprocessor op {:#010x} at {:#010x} ignored", word, addr);
            exec.advance()
        }
        Instruction::Unknown { .. } => None,
    };
    outcome.unwrap_or_else(|| {
        warn!(
            "unhandled instruction {:#010x} at {:#010x}: {}",
            word,
            addr,
            disasm::describe(word, addr)
        );
        cpu.set_pc(addr.wrapping_add(4));
        StepOutcome::Unhandled { addr, word }
    })
}

/// Barrel shifter with an immediate amount. Returns the value and carry out.
pub fn shift_imm(value: u32, shift: ShiftType, amount: u32, carry_in: bool) -> (u32, bool) {
    match (shift, amount) {
        (ShiftType::Lsl, 0) => (value, carry_in),
        (ShiftType::Lsl, n) => (value << n, value & (1 << (32 - n)) != 0),
        // Amount 0 encodes a shift by 32
        (ShiftType::Lsr, 0) => (0, value & (1 << 31) != 0),
        (ShiftType::Lsr, n) => (value >> n, value & (1 << (n - 1)) != 0),
        (ShiftType::Asr, 0) => {
            let sign = value & (1 << 31) != 0;
            (if sign { u32::MAX } else { 0 }, sign)
        }
        (ShiftType::Asr, n) => (((value as i32) >> n) as u32, value & (1 << (n - 1)) != 0),
        // RRX
        (ShiftType::Ror, 0) => (((carry_in as u32) << 31) | (value >> 1), value & 1 != 0),
        (ShiftType::Ror, n) => (value.rotate_right(n), value & (1 << (n - 1)) != 0),
    }
}

struct Exec<'a> {
    cpu: &'a mut CpuState,
    bus: &'a mut Bus,
    addr: u32,
}

impl Exec<'_> {
    /// Register read as seen by the instruction: the PC reads 8 ahead
    fn reg(&self, r: Reg) -> u32 {
        if r == Reg::PC {
            self.addr.wrapping_add(8)
        } else {
            self.cpu.regs[r]
        }
    }

    fn advance(&mut self) -> Option<StepOutcome> {
        self.cpu.set_pc(self.addr.wrapping_add(4));
        Some(StepOutcome::Executed)
    }

    fn jump(&mut self, target: u32) -> Option<StepOutcome> {
        self.cpu.set_pc(target & !3);
        Some(StepOutcome::Executed)
    }

    /// Operand 2 value and shifter carry out. None for register-specified shifts.
    fn operand2(&self, op2: &Operand2) -> Option<(u32, bool)> {
        let carry = self.cpu.flag(C);
        match *op2 {
            Operand2::Imm { imm8, rotate } => {
                let value = Operand2::imm_value(imm8, rotate);
                let carry_out = if rotate == 0 { carry } else { value & (1 << 31) != 0 };
                Some((value, carry_out))
            }
            Operand2::Reg { rm, shift, amount } => Some(shift_imm(self.reg(rm), shift, amount, carry)),
            Operand2::RegShiftReg { .. } => None,
        }
    }

    fn data_processing(&mut self, dp: &DataProcessing) -> Option<StepOutcome> {
        let (op2, shifter_carry) = self.operand2(&dp.operand2)?;
        let rn = self.reg(dp.rn);

        // (result, carry, Some(overflow) for arithmetic ops)
        let (result, carry, overflow) = match dp.op {
            AluOp::And | AluOp::Tst => (rn & op2, shifter_carry, None),
            AluOp::Eor | AluOp::Teq => (rn ^ op2, shifter_carry, None),
            AluOp::Orr => (rn | op2, shifter_carry, None),
            AluOp::Bic => (rn & !op2, shifter_carry, None),
            AluOp::Mov => (op2, shifter_carry, None),
            AluOp::Mvn => (!op2, shifter_carry, None),
            AluOp::Sub | AluOp::Cmp => {
                let (res, v) = sub_with_flags(rn, op2);
                (res, rn >= op2, Some(v))
            }
            AluOp::Rsb => {
                let (res, v) = sub_with_flags(op2, rn);
                (res, op2 >= rn, Some(v))
            }
            AluOp::Add | AluOp::Cmn => {
                let (res, c) = rn.overflowing_add(op2);
                let v = (!(rn ^ op2) & (rn ^ res)) >> 31 != 0;
                (res, c, Some(v))
            }
            AluOp::Adc | AluOp::Sbc | AluOp::Rsc => return None,
        };

        if dp.op.is_test() {
            self.set_flags(result, carry, overflow);
            return self.advance();
        }

        if dp.rd == Reg::PC {
            if dp.set_flags {
                // Exception return
                self.cpu.cpsr = self.cpu.spsr;
            }
            return self.jump(result);
        }

        self.cpu.regs[dp.rd] = result;
        if dp.set_flags {
            self.set_flags(result, carry, overflow);
        }
        self.advance()
    }

    fn set_flags(&mut self, result: u32, carry: bool, overflow: Option<bool>) {
        match overflow {
            Some(v) => self.cpu.update_flags_arith(result, carry, v),
            None => self.cpu.update_flags(result, carry),
        }
    }

    fn load_store(&mut self, ls: &LoadStore) -> Option<StepOutcome> {
        let base = self.reg(ls.rn);
        let offset = match ls.offset {
            MemOffset::Imm(imm) => imm,
            MemOffset::Reg { rm, shift, amount } => {
                shift_imm(self.reg(rm), shift, amount, self.cpu.flag(C)).0
            }
        };
        let offset_addr = if ls.add {
            base.wrapping_add(offset)
        } else {
            base.wrapping_sub(offset)
        };
        let ea = if ls.pre_index { offset_addr } else { base };

        if ls.load {
            let value = if ls.byte {
                self.bus.read8(ea) as u32
            } else {
                self.bus.read32(ea)
            };
            // Write back first so a load into the base register wins
            if ls.writes_back() {
                self.write_reg(ls.rn, offset_addr);
            }
            if ls.rd == Reg::PC {
                return self.jump(value);
            }
            self.cpu.regs[ls.rd] = value;
        } else {
            let value = self.reg(ls.rd);
            if ls.byte {
                self.bus.write8(ea, value as u8);
            } else {
                self.bus.write32(ea, value);
            }
            if ls.writes_back() {
                self.write_reg(ls.rn, offset_addr);
            }
        }
        if ls.writes_back() && ls.rn == Reg::PC {
            return Some(StepOutcome::Executed);
        }
        self.advance()
    }

    fn write_reg(&mut self, r: Reg, value: u32) { self.cpu.regs[r] = value; }

    fn load_store_multiple(&mut self, m: &LoadStoreMultiple) -> Option<StepOutcome> {
        let base = self.reg(m.rn);
        let mut addr = m.start_address(base);
        let final_base = m.final_base(base);

        if m.load {
            let values: Vec<(Reg, u32)> = m
                .regs()
                .map(|r| {
                    let value = self.bus.read32(addr);
                    addr = addr.wrapping_add(4);
                    (r, value)
                })
                .collect();
            if m.writeback {
                self.write_reg(m.rn, final_base);
            }
            let mut target = None;
            for (r, value) in values {
                if r == Reg::PC {
                    target = Some(value);
                } else {
                    self.cpu.regs[r] = value;
                }
            }
            if let Some(target) = target {
                if m.psr {
                    self.cpu.cpsr = self.cpu.spsr;
                }
                return self.jump(target);
            }
        } else {
            for r in m.regs() {
                let value = self.reg(r);
                self.bus.write32(addr, value);
                addr = addr.wrapping_add(4);
            }
            if m.writeback {
                self.write_reg(m.rn, final_base);
            }
        }
        if m.writeback && m.rn == Reg::PC {
            return Some(StepOutcome::Executed);
        }
        self.advance()
    }

    fn branch(&mut self, b: &Branch) -> Option<StepOutcome> {
        let target = match b.target {
            BranchTarget::Offset(_) => b.target_address(self.addr)?,
            BranchTarget::Reg(rm) => {
                let target = self.reg(rm);
                if target & 1 != 0 {
                    warn!(
                        "bx to thumb address {:#010x} at {:#010x}, continuing in arm state",
                        target, self.addr
                    );
                }
                target & !1
            }
        };
        if b.link {
            self.cpu.regs[Reg::LR] = self.addr.wrapping_add(4);
        }
        self.cpu.set_pc(target);
        if target == self.addr && !b.link {
            return Some(StepOutcome::SelfLoop { addr: self.addr });
        }
        Some(StepOutcome::Executed)
    }

    fn status_transfer(&mut self, st: &StatusTransfer) -> Option<StepOutcome> {
        match *st {
            StatusTransfer::Mrs { rd, spsr, .. } => {
                let value = if spsr { self.cpu.spsr } else { self.cpu.cpsr };
                if rd == Reg::PC {
                    return self.jump(value);
                }
                self.cpu.regs[rd] = value;
            }
            StatusTransfer::Msr {
                spsr,
                fields,
                operand,
                ..
            } => {
                let (value, _) = self.operand2(&operand)?;
                let mask = StatusTransfer::field_mask(fields);
                let psr = if spsr { &mut self.cpu.spsr } else { &mut self.cpu.cpsr };
                *psr = (*psr & !mask) | (value & mask);
            }
        }
        self.advance()
    }
}

/// Returns the difference and signed overflow of `a - b`
fn sub_with_flags(a: u32, b: u32) -> (u32, bool) {
    let res = a.wrapping_sub(b);
    (res, ((a ^ b) & (a ^ res)) >> 31 != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm::memory::Memory;
    use crate::arm::state::{Mode, V};

    fn setup() -> (CpuState, Bus) {
        let mut cpu = CpuState::new();
        cpu.reset(0, 0x1000);
        (cpu, Bus::new(Memory::new(0, 0x1000)))
    }

    /// Runs `program` from address 0 for one step per instruction
    fn run(cpu: &mut CpuState, bus: &mut Bus, program: &[u32]) -> Vec<StepOutcome> {
        for (i, w) in program.iter().enumerate() {
            bus.ram.write32(4 * i as u32, *w);
        }
        (0..program.len()).map(|_| step(cpu, bus)).collect()
    }

    #[test]
    fn test_mov_imm() {
        let (mut cpu, mut bus) = setup();
        // mov r1, #1
        assert_eq!(run(&mut cpu, &mut bus, &[0xe3a01001]), [StepOutcome::Executed]);
        assert_eq!(cpu.regs[Reg::R1], 1);
        assert_eq!(cpu.pc(), 4);
    }

    #[test]
    fn test_add_reg() {
        let (mut cpu, mut bus) = setup();
        cpu.regs[Reg::R1] = 1;
        cpu.regs[Reg::R0] = 5;
        // add r3, r1, r0
        run(&mut cpu, &mut bus, &[0xe0813000]);
        assert_eq!(cpu.regs[Reg::R3], 6);
        assert_eq!(cpu.pc(), 4);
    }

    #[test]
    fn test_condition_skip() {
        let (mut cpu, mut bus) = setup();
        // moveq r1, #1
        assert_eq!(run(&mut cpu, &mut bus, &[0x03a01001]), [StepOutcome::Skipped]);
        assert_eq!(cpu.regs[Reg::R1], 0);
        assert_eq!(cpu.pc(), 4);
    }

    #[test]
    fn test_never_condition_skips() {
        let (mut cpu, mut bus) = setup();
        cpu.cpsr |= 0xf000_0000;
        // mov r1, #1 with the NV condition
        assert_eq!(run(&mut cpu, &mut bus, &[0xf3a01001]), [StepOutcome::Skipped]);
        assert_eq!(cpu.regs[Reg::R1], 0);
    }

    fn cmp_test_case(n: u32) -> u32 {
        let (mut cpu, mut bus) = setup();
        cpu.regs[Reg::R0] = n;
        // cmp r0, #1
        run(&mut cpu, &mut bus, &[0xe3500001]);
        cpu.nzcv()
    }

    #[test]
    fn test_cmp_flags() {
        // Positive result
        assert_eq!(cmp_test_case(2), 0b0010); // nzcv
        // 0 result
        assert_eq!(cmp_test_case(1), 0b0110); // nzcv
        // negative result (unsigned underflow)
        assert_eq!(cmp_test_case(0), 0b1000); // nzcv
        // negative result (no underflow)
        assert_eq!(cmp_test_case(-1i32 as u32), 0b1010); // nzcv
        // signed underflow only (positive result)
        assert_eq!(cmp_test_case(i32::MIN as u32), 0b0011); // nzcv
    }

    #[test]
    fn test_adds_overflow_sets_v() {
        let (mut cpu, mut bus) = setup();
        cpu.regs[Reg::R1] = i32::MAX as u32;
        cpu.regs[Reg::R2] = 1;
        // adds r0, r1, r2
        run(&mut cpu, &mut bus, &[0xe0910002]);
        assert_eq!(cpu.regs[Reg::R0], 0x8000_0000);
        assert_eq!(cpu.nzcv(), 0b1001);
        assert!(cpu.flag(V));
    }

    #[test]
    fn test_logical_flags_use_shifter_carry() {
        let (mut cpu, mut bus) = setup();
        cpu.regs[Reg::R1] = 0x8000_0001;
        cpu.cpsr |= V.0;
        // movs r0, r1, lsr #1
        run(&mut cpu, &mut bus, &[0xe1b000a1]);
        assert_eq!(cpu.regs[Reg::R0], 0x4000_0000);
        // C from the bit shifted out, V cleared by the flag update
        assert_eq!(cpu.nzcv(), 0b0010);
    }

    #[test]
    fn test_write_pc() {
        let (mut cpu, mut bus) = setup();
        cpu.regs[Reg::R1] = 0x203;
        // mov pc, r1
        run(&mut cpu, &mut bus, &[0xe1a0f001]);
        assert_eq!(cpu.pc(), 0x200);
    }

    #[test]
    fn test_exception_return() {
        let (mut cpu, mut bus) = setup();
        cpu.regs[Reg::LR] = 0x100;
        cpu.spsr = 0x6000_0010;
        // movs pc, lr
        run(&mut cpu, &mut bus, &[0xe1b0f00e]);
        assert_eq!(cpu.pc(), 0x100);
        assert_eq!(cpu.cpsr, 0x6000_0010);
        assert_eq!(cpu.mode(), Some(Mode::User));
    }

    #[test]
    fn test_unhandled_advances() {
        let (mut cpu, mut bus) = setup();
        // mul r0, r1, r2; adc r0, r1, r2; mov r0, r1, lsl r2
        let outcomes = run(&mut cpu, &mut bus, &[0xe0000291, 0xe0a10002, 0xe1a00211]);
        assert_eq!(
            outcomes,
            [
                StepOutcome::Unhandled {
                    addr: 0,
                    word: 0xe0000291
                },
                StepOutcome::Unhandled {
                    addr: 4,
                    word: 0xe0a10002
                },
                StepOutcome::Unhandled {
                    addr: 8,
                    word: 0xe1a00211
                },
            ]
        );
        assert_eq!(cpu.pc(), 12);
    }

    #[test]
    fn test_coprocessor_is_noop() {
        let (mut cpu, mut bus) = setup();
        // mcr p15, 0, r0, c7, c5, 0
        assert_eq!(run(&mut cpu, &mut bus, &[0xee070f15]), [StepOutcome::Executed]);
        assert_eq!(cpu.pc(), 4);
    }

    #[test]
    fn test_branch_to_self() {
        let (mut cpu, mut bus) = setup();
        cpu.set_pc(0x40);
        bus.ram.write32(0x40, 0xeafffffe);
        assert_eq!(step(&mut cpu, &mut bus), StepOutcome::SelfLoop { addr: 0x40 });
        assert_eq!(cpu.pc(), 0x40);
    }

    #[test]
    fn test_branch_link() {
        let (mut cpu, mut bus) = setup();
        cpu.set_pc(0x40);
        // bl +0x100
        bus.ram.write32(0x40, 0xeb00003e);
        step(&mut cpu, &mut bus);
        assert_eq!(cpu.pc(), 0x140);
        assert_eq!(cpu.regs[Reg::LR], 0x44);
    }

    #[test]
    fn test_branch_backwards() {
        let (mut cpu, mut bus) = setup();
        cpu.set_pc(0x40);
        // b 0x20
        bus.ram.write32(0x40, 0xeafffff6);
        step(&mut cpu, &mut bus);
        assert_eq!(cpu.pc(), 0x20);
    }

    #[test]
    fn test_bx() {
        let (mut cpu, mut bus) = setup();
        cpu.regs[Reg::LR] = 0x81;
        // bx lr
        run(&mut cpu, &mut bus, &[0xe12fff1e]);
        assert_eq!(cpu.pc(), 0x80);
    }

    #[test]
    fn test_load_store() {
        let (mut cpu, mut bus) = setup();
        cpu.regs[Reg::R0] = 0x800;
        cpu.regs[Reg::R9] = 0xcafe_f00d;
        // str r9, [r0, #4]; ldrb r1, [r0, #5]; ldr r2, [r0, #4]!
        run(&mut cpu, &mut bus, &[0xe5809004, 0xe5d01005, 0xe5b02004]);
        assert_eq!(bus.ram.read32(0x804), 0xcafe_f00d);
        assert_eq!(cpu.regs[Reg::R1], 0xf0);
        assert_eq!(cpu.regs[Reg::R2], 0xcafe_f00d);
        assert_eq!(cpu.regs[Reg::R0], 0x804);
    }

    #[test]
    fn test_post_index_and_register_offset() {
        let (mut cpu, mut bus) = setup();
        bus.ram.write32(0x800, 11);
        bus.ram.write32(0x810, 22);
        cpu.regs[Reg::R0] = 0x800;
        cpu.regs[Reg::R3] = 4;
        // ldr r1, [r0], #-4; ldr r2, [r0, r3, lsl #2]
        run(&mut cpu, &mut bus, &[0xe4101004, 0xe7902103]);
        assert_eq!(cpu.regs[Reg::R1], 11);
        assert_eq!(cpu.regs[Reg::R0], 0x7fc);
        // 0x7fc + 16
        assert_eq!(cpu.regs[Reg::R2], 0);
        cpu.regs[Reg::R0] = 0x800;
        cpu.set_pc(4);
        step(&mut cpu, &mut bus);
        assert_eq!(cpu.regs[Reg::R2], 22);
    }

    #[test]
    fn test_pc_relative_load() {
        let (mut cpu, mut bus) = setup();
        bus.ram.write32(0x10, 0x1234_5678);
        // ldr r0, [pc, #8]
        run(&mut cpu, &mut bus, &[0xe59f0008]);
        assert_eq!(cpu.regs[Reg::R0], 0x1234_5678);
    }

    #[test]
    fn test_store_unmapped_is_silent() {
        let (mut cpu, mut bus) = setup();
        cpu.regs[Reg::R0] = 0x9000_0000;
        cpu.regs[Reg::R1] = 7;
        // str r1, [r0]; ldr r2, [r0]
        run(&mut cpu, &mut bus, &[0xe5801000, 0xe5902000]);
        assert_eq!(cpu.regs[Reg::R2], 0);
        assert_eq!(cpu.pc(), 8);
    }

    macro_rules! multiple_tests {
        ($($name:ident: $value:expr,)*) => {
            $(
                #[test]
                fn $name() {
                    let (word, expected_sp) = $value;
                    let (mut cpu, mut bus) = setup();
                    cpu.regs[Reg::SP] = 0x800;
                    let values = [1, 2, 3, 5, 7, 11, 13, 17];
                    for (i, v) in values.iter().enumerate() {
                        cpu.regs[i] = *v;
                    }
                    run(&mut cpu, &mut bus, &[word]);

                    assert_eq!(cpu.regs[Reg::SP], expected_sp);
                    let start = if expected_sp < 0x800 { expected_sp } else { 0x800 - 32 };
                    let stored: Vec<u32> = bus.ram.iter_word(start).take(8).collect();
                    assert_eq!(stored, values);
                }
            )*
        };
    }

    multiple_tests! {
        // stmdb sp!, {r0-r7}
        test_stmdb_writeback: (0xe92d00ff, 0x800 - 32),
        // stmdb sp, {r0-r7}
        test_stmdb_no_writeback: (0xe90d00ff, 0x800),
    }

    #[test]
    fn test_push_pop() {
        let (mut cpu, mut bus) = setup();
        cpu.regs[Reg::SP] = 0x800;
        cpu.regs[Reg::R4] = 44;
        cpu.regs[Reg::LR] = 0x100;
        // push {r4, lr}; mov r4, #0; pop {r4, pc}
        run(&mut cpu, &mut bus, &[0xe92d4010, 0xe3a04000, 0xe8bd8010]);
        assert_eq!(cpu.regs[Reg::R4], 44);
        assert_eq!(cpu.regs[Reg::SP], 0x800);
        assert_eq!(cpu.pc(), 0x100);
        assert_eq!(bus.ram.read32(0x7f8), 44);
        assert_eq!(bus.ram.read32(0x7fc), 0x100);
    }

    #[test]
    fn test_ldm_base_in_list() {
        let (mut cpu, mut bus) = setup();
        bus.ram.write32(0x800, 9);
        bus.ram.write32(0x804, 0x1234);
        cpu.regs[Reg::R0] = 0x800;
        // ldmia r0!, {r0, r1}
        run(&mut cpu, &mut bus, &[0xe8b00003]);
        assert_eq!(cpu.regs[Reg::R0], 9);
        assert_eq!(cpu.regs[Reg::R1], 0x1234);
    }

    #[test]
    fn test_status_transfer() {
        let (mut cpu, mut bus) = setup();
        cpu.regs[Reg::R1] = 0xf000_0000;
        // mrs r0, cpsr; msr cpsr_f, r1; msr cpsr_c, #0x1f
        run(&mut cpu, &mut bus, &[0xe10f0000, 0xe128f001, 0xe321f01f]);
        assert_eq!(cpu.regs[Reg::R0], 0xd3);
        assert_eq!(cpu.nzcv(), 0b1111);
        assert_eq!(cpu.mode(), Some(Mode::System));
    }

    #[test]
    fn test_shift_imm() {
        assert_eq!(shift_imm(0x8000_0001, ShiftType::Lsl, 1, false), (2, true));
        assert_eq!(shift_imm(0x8000_0001, ShiftType::Lsr, 0, false), (0, true));
        assert_eq!(shift_imm(0x8000_0000, ShiftType::Asr, 4, false), (0xf800_0000, false));
        assert_eq!(shift_imm(0x8000_0000, ShiftType::Asr, 0, false), (u32::MAX, true));
        assert_eq!(shift_imm(0x0000_0003, ShiftType::Ror, 1, false), (0x8000_0001, true));
        assert_eq!(shift_imm(0x0000_0003, ShiftType::Ror, 0, true), (0x8000_0001, true));
    }
}
