//! Runtime entry points called from generated code

use crate::arm::bus::Bus;
use crate::jit::builder::Helpers;

/// Per-run environment handed to a block alongside the CPU state
pub struct JitEnv<'a> {
    pub bus: &'a mut Bus,
    /// Set by a helper that caught a panic
    pub fault: Option<(u32, String)>,
    /// Instructions the interpreter fallback could not execute
    pub unhandled: u64,
}

impl<'a> JitEnv<'a> {
    pub fn new(bus: &'a mut Bus) -> Self {
        Self {
            bus,
            fault: None,
            unhandled: 0,
        }
    }
}

#[cfg(target_arch = "x86_64")]
mod native {
    use std::panic::{self, AssertUnwindSafe};

    use super::JitEnv;
    use crate::arm::decode::decode;
    use crate::arm::interp::{self, StepOutcome};
    use crate::arm::state::{CpuState, Reg};
    use crate::error::panic_message;
    use crate::jit::builder::BYTE_ACCESS;

    /// Unwinding out of an `extern` fn aborts, so every helper body runs under `catch_unwind`
    /// and reports a panic as a fault instead.
    ///
    /// # Safety
    /// `cpu` and `env` must be the live pointers the block was entered with.
    unsafe fn guarded(
        cpu: *mut CpuState,
        env: *mut JitEnv<'_>,
        addr: u32,
        f: impl FnOnce(&mut CpuState, &mut JitEnv<'_>),
    ) -> u32 {
        let (cpu, env) = (&mut *cpu, &mut *env);
        match panic::catch_unwind(AssertUnwindSafe(|| f(&mut *cpu, &mut *env))) {
            Ok(()) => 0,
            Err(payload) => {
                env.fault = Some((addr, panic_message(payload.as_ref())));
                1
            }
        }
    }

    pub unsafe extern "sysv64" fn jit_interpret(
        cpu: *mut CpuState,
        env: *mut JitEnv<'_>,
        addr: u32,
        word: u32,
    ) -> u32 {
        guarded(cpu, env, addr, |cpu, env| {
            let outcome = interp::execute(cpu, env.bus, &decode(word), addr, word);
            if let StepOutcome::Unhandled { .. } = outcome {
                env.unhandled += 1;
            }
        })
    }

    pub unsafe extern "sysv64" fn jit_load(
        cpu: *mut CpuState,
        env: *mut JitEnv<'_>,
        addr: u32,
        access: u32,
    ) -> u32 {
        guarded(cpu, env, addr, |cpu, env| {
            let value = if access & BYTE_ACCESS != 0 {
                env.bus.read8(addr) as u32
            } else {
                env.bus.read32(addr)
            };
            cpu.regs[Reg::from_index(access)] = value;
        })
    }

    pub unsafe extern "sysv64" fn jit_store(
        cpu: *mut CpuState,
        env: *mut JitEnv<'_>,
        addr: u32,
        access: u32,
    ) -> u32 {
        guarded(cpu, env, addr, |cpu, env| {
            let value = cpu.regs[Reg::from_index(access)];
            if access & BYTE_ACCESS != 0 {
                env.bus.write8(addr, value as u8);
            } else {
                env.bus.write32(addr, value);
            }
        })
    }
}

/// Helper addresses for the block builder
#[cfg(target_arch = "x86_64")]
pub fn table() -> Helpers {
    Helpers {
        interpret: native::jit_interpret as usize as u64,
        load: native::jit_load as usize as u64,
        store: native::jit_store as usize as u64,
    }
}

#[cfg(not(target_arch = "x86_64"))]
pub fn table() -> Helpers { Helpers::default() }
