mod alu;
mod branch;
mod flags;
mod load_store;
pub mod reg_map;

use reg_map::{state_offset, GUEST_REGS};

use crate::arm::decode::Instruction;
use crate::arm::state::Reg;
use crate::jit::emitter::{Assembler, Cc, HostReg, Label};

/// Addresses of the runtime functions generated code calls into. Each has the signature
/// `extern "sysv64" fn(*mut CpuState, *mut JitEnv, u32, u32) -> u32` and returns non-zero on
/// fault.
#[derive(Copy, Clone, Debug, Default)]
pub struct Helpers {
    /// (addr, word): run one instruction through the interpreter
    pub interpret: u64,
    /// (addr, rd | byte << 8)
    pub load: u64,
    /// (addr, rd | byte << 8)
    pub store: u64,
}

pub const BYTE_ACCESS: u32 = 1 << 8;

pub const CPSR_OFFSET: i32 = 64;

// Frame slots above rsp, below any temporaries
const CPU_SLOT: i32 = 0;
const ENV_SLOT: i32 = 8;
const SCRATCH_SLOT: i32 = 16;
const FRAME_SIZE: u8 = 24;

const CALLEE_SAVED: [HostReg; 6] = [
    HostReg::Rbx,
    HostReg::Rbp,
    HostReg::R12,
    HostReg::R13,
    HostReg::R14,
    HostReg::R15,
];

/// Emits the native code for one block. Generated code is a System V function taking the CPU
/// state and runtime environment pointers, returning 0 on a normal exit with the next PC stored
/// in the state, or 1 on fault. Guest registers live in host registers between instructions; the
/// state struct is only current at exits and around helper calls.
pub struct BlockBuilder<'h> {
    asm: Assembler,
    helpers: &'h Helpers,
    fault: Label,
}

impl<'h> BlockBuilder<'h> {
    pub fn new(helpers: &'h Helpers) -> Self {
        let mut asm = Assembler::new();
        let fault = asm.new_label();
        let mut builder = Self {
            asm,
            helpers,
            fault,
        };
        builder.prologue();
        builder
    }

    /// Current size of the emitted code
    pub fn len(&self) -> usize { self.asm.len() }

    pub fn is_empty(&self) -> bool { self.asm.is_empty() }

    /// Emit code for `instr` at `addr`. Instructions with no native lowering call back into the
    /// interpreter, so translation always makes progress.
    pub fn translate(&mut self, instr: &Instruction, addr: u32, word: u32) {
        let native = match instr {
            Instruction::DataProcessing(dp) => self.data_processing(dp, addr),
            Instruction::LoadStore(ls) => self.load_store(ls, addr),
            Instruction::LoadStoreMultiple(m) => self.load_store_multiple(m),
            Instruction::Branch(b) => self.branch(b, addr),
            Instruction::Coprocessor { .. } => true,
            Instruction::StatusTransfer(_) | Instruction::Unknown { .. } => false,
        };
        if !native {
            self.fallback(addr, word, instr.writes_pc());
        }
    }

    /// Close the block. `next` is the fall-through PC if the last instruction didn't exit.
    pub fn finish(mut self, next: Option<u32>) -> Option<Vec<u8>> {
        if let Some(pc) = next {
            self.exit_to(pc);
        }
        self.asm.bind(self.fault);
        self.asm.mov_ri(HostReg::Rax, 1);
        self.epilogue();
        self.asm.finish()
    }

    fn slot(&self, slot: i32) -> i32 { slot + self.asm.stack_depth() }

    fn prologue(&mut self) {
        for r in CALLEE_SAVED {
            self.asm.push(r);
        }
        self.asm.sub_rsp(FRAME_SIZE);
        self.asm.store64(HostReg::Rsp, CPU_SLOT, HostReg::Rdi);
        self.asm.store64(HostReg::Rsp, ENV_SLOT, HostReg::Rsi);
        self.reload();
    }

    fn epilogue(&mut self) {
        self.asm.add_rsp(FRAME_SIZE);
        for r in CALLEE_SAVED.into_iter().rev() {
            self.asm.pop(r);
        }
        self.asm.ret();
    }

    /// Load every guest register from the state struct. R0 shares rax with the state pointer, so
    /// it goes last.
    fn reload(&mut self) {
        let cpu_slot = self.slot(CPU_SLOT);
        self.asm.load64(HostReg::Rax, HostReg::Rsp, cpu_slot);
        for (r, h) in GUEST_REGS.into_iter().skip(1) {
            self.asm.load32(h, HostReg::Rax, state_offset(r));
        }
        self.asm.load32(HostReg::Rax, HostReg::Rax, state_offset(Reg::R0));
    }

    /// Write every guest register back to the state struct. Leaves the state pointer in rax; all
    /// other host registers are free until the next `reload`.
    fn spill(&mut self) {
        let cpu_slot = self.slot(CPU_SLOT);
        // Park R0 in the pointer's slot while rax holds the pointer
        self.asm.xchg64_mem(HostReg::Rax, HostReg::Rsp, cpu_slot);
        for (r, h) in GUEST_REGS.into_iter().skip(1) {
            self.asm.store32(HostReg::Rax, state_offset(r), h);
        }
        self.asm.load32(HostReg::Rcx, HostReg::Rsp, cpu_slot);
        self.asm.store32(HostReg::Rax, state_offset(Reg::R0), HostReg::Rcx);
        self.asm.store64(HostReg::Rsp, cpu_slot, HostReg::Rax);
    }

    /// Leave the block with `pc` as the next instruction
    fn exit_to(&mut self, pc: u32) {
        self.spill();
        self.asm
            .store32_imm(HostReg::Rax, state_offset(Reg::PC), pc);
        self.return_ok();
    }

    /// Return with whatever PC the state already holds. Guest registers must be spilled.
    fn return_ok(&mut self) {
        self.asm.mov_ri(HostReg::Rax, 0);
        self.epilogue();
    }

    /// Call a helper with guest state spilled. The caller has put the two u32 arguments in edx
    /// and ecx. Jumps to the fault exit if the helper reports failure.
    fn call_helper(&mut self, func: u64) {
        let cpu_slot = self.slot(CPU_SLOT);
        let env_slot = self.slot(ENV_SLOT);
        self.asm.load64(HostReg::Rdi, HostReg::Rsp, cpu_slot);
        self.asm.load64(HostReg::Rsi, HostReg::Rsp, env_slot);
        self.asm.mov64_ri(HostReg::Rax, func);
        self.asm.call_r(HostReg::Rax);
        self.asm.test_rr(HostReg::Rax, HostReg::Rax);
        self.asm.jcc(Cc::Ne, self.fault);
    }

    /// Run the instruction through the interpreter
    fn fallback(&mut self, addr: u32, word: u32, exits: bool) {
        self.spill();
        self.asm.mov_ri(HostReg::Rdx, addr);
        self.asm.mov_ri(HostReg::Rcx, word);
        self.call_helper(self.helpers.interpret);
        if exits {
            self.return_ok();
        } else {
            self.reload();
        }
    }
}
