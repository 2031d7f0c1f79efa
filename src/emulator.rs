use std::fs;
use std::ops::RangeInclusive;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use log::{debug, info, trace};

use crate::arm::bus::{Bus, DisplayEvent};
use crate::arm::disasm;
use crate::arm::interp::{self, StepOutcome};
use crate::arm::memory::Memory;
use crate::arm::mmio::MmioHandler;
use crate::arm::state::CpuState;
use crate::config::{EmulatorConfig, ExecMode};
use crate::error::{panic_message, ConfigError, LoadError, RunError, TranslateError};
use crate::jit::Translator;

/// Why a run ended. None of these are failures.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    StopRequested,
    /// Hit the configured instruction limit
    BudgetExhausted,
    /// Reached an unconditional branch to itself
    SelfLoop { addr: u32 },
    ExitCondition,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RunSummary {
    pub reason: StopReason,
    /// Instructions executed by this run
    pub instructions: u64,
}

/// Requests a running emulator to stop at the next step boundary. Can be sent to another thread.
#[derive(Clone, Debug)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) { self.0.store(true, Ordering::SeqCst); }
}

pub struct Emulator {
    pub cpu: CpuState,
    pub bus: Bus,
    config: EmulatorConfig,
    /// Created on the first translated step
    translator: Option<Translator>,
    mode: ExecMode,
    stop: Arc<AtomicBool>,
    instructions: u64,
    unhandled: u64,
}

impl Emulator {
    pub fn new(config: EmulatorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut cpu = CpuState::new();
        cpu.reset(config.default_entry, config.stack_top());
        let bus = Bus::new(Memory::new(config.ram_base, config.ram_size));
        Ok(Self {
            cpu,
            bus,
            config,
            translator: None,
            mode: ExecMode::Interpreted,
            stop: Arc::new(AtomicBool::new(false)),
            instructions: 0,
            unhandled: 0,
        })
    }

    /// Copy a raw image into RAM at `addr` (or the configured default entry) and reset the CPU to
    /// start there. Nothing is modified if the image is rejected.
    pub fn load_image(&mut self, image: &[u8], addr: Option<u32>) -> Result<(), LoadError> {
        if image.is_empty() {
            return Err(LoadError::Empty);
        }
        let addr = addr.unwrap_or(self.config.default_entry);
        if !self.bus.ram.contains(addr, image.len()) {
            return Err(LoadError::OutOfRange {
                addr,
                len: image.len(),
                ram_base: self.bus.ram.base(),
                ram_end: self.bus.ram.end(),
            });
        }
        self.bus.ram.load(addr, image);
        info!("loaded {:#x} bytes at {:#010x}", image.len(), addr);
        self.reset(addr);
        Ok(())
    }

    pub fn load_rom(&mut self, path: impl AsRef<Path>, addr: Option<u32>) -> Result<()> {
        let path = path.as_ref();
        let image = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        self.load_image(&image, addr)
            .with_context(|| format!("failed to load {}", path.display()))
    }

    /// Reset the CPU to `entry` and drop all translated code. RAM is left alone.
    pub fn reset(&mut self, entry: u32) {
        self.cpu.reset(entry, self.config.stack_top());
        self.instructions = 0;
        self.unhandled = 0;
        self.mode = ExecMode::Interpreted;
        if let Some(translator) = self.translator.as_mut() {
            if let Err(e) = translator.reset() {
                debug!("dropping translator: {}", e);
                self.translator = None;
            }
        }
    }

    pub fn register_mmio(
        &mut self,
        name: &str,
        range: RangeInclusive<u32>,
        priority: i32,
        handler: impl MmioHandler + 'static,
    ) {
        self.bus.mmio.register(name, range, priority, handler);
    }

    /// Receive every store that lands in `range`
    pub fn watch_display(&mut self, range: RangeInclusive<u32>) -> Receiver<DisplayEvent> {
        self.bus.watch(range)
    }

    pub fn stop_handle(&self) -> StopHandle { StopHandle(self.stop.clone()) }

    /// Interpret a single instruction regardless of the configured mode
    pub fn step(&mut self) -> StepOutcome {
        let pc = self.cpu.pc();
        if self.config.trace {
            let word = self.bus.ram.read::<u32>(pc).unwrap_or(0);
            trace!("{:#010x}: {:08x}  {}", pc, word, disasm::describe(word, pc));
        }
        let outcome = interp::step(&mut self.cpu, &mut self.bus);
        self.instructions += 1;
        if let StepOutcome::Unhandled { .. } = outcome {
            self.unhandled += 1;
        }
        outcome
    }

    pub fn run(&mut self) -> Result<RunSummary, RunError> { self.run_until(|_| false) }

    /// Run until `exit` returns true for the state before a step, a stop is requested, the
    /// instruction limit is reached or the program branches to itself. In translated mode the
    /// exit condition and limit are checked between blocks.
    pub fn run_until<F>(&mut self, mut exit: F) -> Result<RunSummary, RunError>
    where
        F: FnMut(&CpuState) -> bool,
    {
        let start = self.instructions;
        let reason = loop {
            if self.stop.swap(false, Ordering::SeqCst) {
                break StopReason::StopRequested;
            }
            if exit(&self.cpu) {
                break StopReason::ExitCondition;
            }
            let executed = self.instructions - start;
            if self
                .config
                .instruction_limit
                .is_some_and(|limit| executed >= limit)
            {
                break StopReason::BudgetExhausted;
            }
            let halted = match self.config.mode {
                ExecMode::Interpreted => self.step_interpreted()?,
                ExecMode::Translated => self.step_translated()?,
            };
            if let Some(addr) = halted {
                break StopReason::SelfLoop { addr };
            }
        };
        let summary = RunSummary {
            reason,
            instructions: self.instructions - start,
        };
        debug!("run ended: {:?}", summary);
        Ok(summary)
    }

    /// A panicking peripheral ends the run with a fault instead of unwinding into the caller
    fn step_interpreted(&mut self) -> Result<Option<u32>, RunError> {
        let pc = self.cpu.pc();
        match panic::catch_unwind(AssertUnwindSafe(|| self.step())) {
            Ok(StepOutcome::SelfLoop { addr }) => Ok(Some(addr)),
            Ok(_) => Ok(None),
            Err(payload) => Err(RunError::Fault {
                pc,
                instructions: self.instructions,
                reason: panic_message(payload.as_ref()),
            }),
        }
    }

    /// Run one translated block, translating a new region first if needed. Code outside RAM is
    /// interpreted.
    fn step_translated(&mut self) -> Result<Option<u32>, RunError> {
        let pc = self.cpu.pc();
        if !self.bus.ram.contains(pc, 4) {
            return self.step_interpreted();
        }
        if !self.translator.as_ref().is_some_and(|t| t.contains(pc)) {
            self.retranslate(pc).map_err(|source| RunError::Translate {
                pc,
                instructions: self.instructions,
                source,
            })?;
        }
        let Some(translator) = self.translator.as_ref() else {
            return self.step_interpreted();
        };
        match translator.execute(pc, &mut self.cpu, &mut self.bus) {
            Ok(Some(run)) => {
                if self.config.trace {
                    trace!("block {:#010x}: {} instructions", pc, run.instructions);
                }
                self.instructions += run.instructions;
                self.unhandled += run.unhandled;
                Ok(run.self_loop)
            }
            Ok(None) => self.step_interpreted(),
            Err(source) => Err(RunError::Execute {
                block: pc,
                instructions: self.instructions,
                source,
            }),
        }
    }

    /// Start a new cache generation holding the region around `pc` plus everything that was
    /// translated before
    fn retranslate(&mut self, pc: u32) -> Result<(), TranslateError> {
        let translator = match self.translator.take() {
            Some(t) => t,
            None => Translator::new(&self.config)?,
        };
        let translator = self.translator.insert(translator);
        let mut seeds = vec![pc];
        seeds.extend(translator.block_starts());
        translator.reset()?;
        let blocks = translator.translate_region(&seeds, &self.bus.ram)?;
        translator.finalize()?;
        debug!(
            "generation {}: {} blocks, {} bytes of code",
            translator.generation(),
            blocks,
            translator.cache_used()
        );
        self.mode = ExecMode::Translated;
        Ok(())
    }

    pub fn get_register(&self, i: usize) -> u32 { self.cpu.get_register(i) }

    pub fn set_register(&mut self, i: usize, value: u32) { self.cpu.set_register(i, value); }

    pub fn get_pc(&self) -> u32 { self.cpu.pc() }

    pub fn get_cpsr(&self) -> u32 { self.cpu.cpsr }

    /// Instructions executed since the last reset
    pub fn get_instruction_count(&self) -> u64 { self.instructions }

    /// Instructions that were decoded but not implemented since the last reset
    pub fn unhandled_count(&self) -> u64 { self.unhandled }

    /// Current execution state. Starts interpreted and only becomes translated once a region
    /// has been finalized.
    pub fn mode(&self) -> ExecMode { self.mode }

    pub fn config(&self) -> &EmulatorConfig { &self.config }

    pub fn translator(&self) -> Option<&Translator> { self.translator.as_ref() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm::state::Reg;

    fn emulator(program: &[u32]) -> Emulator {
        let mut emu = Emulator::new(EmulatorConfig {
            ram_size: 0x10000,
            ..Default::default()
        })
        .unwrap();
        let image: Vec<u8> = program.iter().flat_map(|w| w.to_le_bytes()).collect();
        emu.load_image(&image, None).unwrap();
        emu
    }

    #[test]
    fn test_load_image() {
        let emu = emulator(&[0xe3a01001]);
        assert_eq!(emu.get_pc(), 0x8000);
        assert_eq!(emu.get_register(Reg::SP as usize), 0xf000);
        assert_eq!(emu.bus.ram.read32(0x8000), 0xe3a01001);
    }

    #[test]
    fn test_load_rejects_bad_images() {
        let mut emu = emulator(&[0xe3a01001]);
        emu.set_register(0, 7);
        assert_eq!(emu.load_image(&[], Some(0)), Err(LoadError::Empty));
        assert!(matches!(
            emu.load_image(&[0; 8], Some(0xfffc)),
            Err(LoadError::OutOfRange { addr: 0xfffc, len: 8, .. })
        ));
        // Nothing was touched
        assert_eq!(emu.get_register(0), 7);
        assert_eq!(emu.get_pc(), 0x8000);
    }

    #[test]
    fn test_load_rom_missing_file() {
        let mut emu = emulator(&[0xe3a01001]);
        let err = emu.load_rom("does/not/exist.bin", None).unwrap_err();
        assert!(err.to_string().contains("does/not/exist.bin"));
    }

    #[test]
    fn test_step() {
        let mut emu = emulator(&[0xe3a01001]);
        assert_eq!(emu.step(), StepOutcome::Executed);
        assert_eq!(emu.get_register(1), 1);
        assert_eq!(emu.get_pc(), 0x8004);
        assert_eq!(emu.get_instruction_count(), 1);
    }

    #[test]
    fn test_run_to_self_loop() {
        let mut emu = emulator(&[0xe3a00005, 0xe2800001, 0xeafffffe]);
        let summary = emu.run().unwrap();
        assert_eq!(summary.reason, StopReason::SelfLoop { addr: 0x8008 });
        assert_eq!(summary.instructions, 3);
        assert_eq!(emu.get_register(0), 6);
    }

    #[test]
    fn test_budget() {
        // loop: add r0, r0, #1; b loop
        let mut emu = emulator(&[0xe2800001, 0xeafffffd]);
        emu.config.instruction_limit = Some(10);
        let summary = emu.run().unwrap();
        assert_eq!(summary.reason, StopReason::BudgetExhausted);
        assert_eq!(summary.instructions, 10);
        assert_eq!(emu.get_register(0), 5);
    }

    #[test]
    fn test_stop_handle() {
        let mut emu = emulator(&[0xe2800001, 0xeafffffd]);
        let handle = emu.stop_handle();
        let mut n = 0;
        let summary = emu
            .run_until(|_| {
                n += 1;
                if n == 4 {
                    handle.stop();
                }
                false
            })
            .unwrap();
        assert_eq!(summary.reason, StopReason::StopRequested);
        assert_eq!(summary.instructions, 4);
        // The request is consumed
        assert_eq!(emu.run_until(|cpu| cpu.pc() == 0x8004).unwrap().instructions, 1);
    }

    #[test]
    fn test_exit_condition() {
        let mut emu = emulator(&[0xe2800001, 0xeafffffd]);
        let summary = emu.run_until(|cpu| cpu.regs[Reg::R0] == 3).unwrap();
        assert_eq!(summary.reason, StopReason::ExitCondition);
        assert_eq!(summary.instructions, 5);
    }

    #[test]
    fn test_unhandled_is_not_fatal() {
        // swi #0; b .
        let mut emu = emulator(&[0xef000000, 0xeafffffe]);
        let summary = emu.run().unwrap();
        assert_eq!(summary.reason, StopReason::SelfLoop { addr: 0x8004 });
        assert_eq!(emu.unhandled_count(), 1);
    }

    struct Faulty;

    impl MmioHandler for Faulty {
        fn on_read(&mut self, _addr: u32) -> u32 { panic!("device on fire") }

        fn on_write(&mut self, _addr: u32, _value: u32) {}
    }

    #[test]
    fn test_interpreted_fault_is_reported() {
        // mov r0, #0x10000000; ldr r1, [r0]; b .
        let mut emu = emulator(&[0xe3a00201, 0xe5901000, 0xeafffffe]);
        emu.register_mmio("faulty", 0x1000_0000..=0x1000_0fff, 0, Faulty);
        match emu.run() {
            Err(RunError::Fault {
                pc,
                instructions,
                reason,
            }) => {
                assert_eq!(pc, 0x8004);
                assert_eq!(instructions, 1);
                assert_eq!(reason, "device on fire");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[cfg(all(target_arch = "x86_64", unix))]
    #[test]
    fn test_translated_run() {
        let mut emu = emulator(&[0xe3a00005, 0xe2800001, 0xeafffffe]);
        emu.config.mode = ExecMode::Translated;
        assert_eq!(emu.mode(), ExecMode::Interpreted);
        let summary = emu.run().unwrap();
        assert_eq!(summary.reason, StopReason::SelfLoop { addr: 0x8008 });
        assert_eq!(emu.mode(), ExecMode::Translated);
        assert_eq!(emu.get_register(0), 6);
        assert!(emu.translator().unwrap().is_finalized());

        emu.reset(0x8000);
        assert_eq!(emu.mode(), ExecMode::Interpreted);
        assert!(emu.translator().unwrap().is_empty());
    }
}
