use std::sync::{Arc, Mutex};

use armbox::arm::bus::DisplayEvent;
use armbox::arm::mmio::MmioHandler;
use armbox::{Emulator, EmulatorConfig, ExecError, ExecMode, RunError, StopReason, TranslateError};
use test_utils::*;

const BASE: u32 = 0x8000;

fn at(i: usize) -> u32 { BASE + 4 * i as u32 }

fn emulator(mode: ExecMode, program: &[u32]) -> Emulator {
    let mut emu = Emulator::new(EmulatorConfig {
        ram_size: 0x20000,
        mode,
        ..Default::default()
    })
    .unwrap();
    emu.load_image(&assemble(program), None).unwrap();
    emu
}

fn modes() -> Vec<ExecMode> {
    if cfg!(all(target_arch = "x86_64", unix)) {
        vec![ExecMode::Interpreted, ExecMode::Translated]
    } else {
        vec![ExecMode::Interpreted]
    }
}

/// r1 = r0! using repeated addition
fn factorial() -> Vec<u32> {
    vec![
        mov_imm(1, 1),
        cmp_imm(0, 1),
        cond(LE, b(at(2), at(10))),
        mov(2, 1),
        sub_imm(3, 0, 1),
        add(1, 1, 2),
        s(sub_imm(3, 3, 1)),
        cond(NE, b(at(7), at(5))),
        sub_imm(0, 0, 1),
        b(at(9), at(1)),
        HALT,
    ]
}

#[test]
fn test_factorial() {
    for mode in modes() {
        for (n, expected) in [(0, 1), (1, 1), (5, 120), (10, 3_628_800), (12, 479_001_600)] {
            let mut emu = emulator(mode, &factorial());
            emu.set_register(0, n);
            let summary = emu.run().unwrap();
            assert_eq!(summary.reason, StopReason::SelfLoop { addr: at(10) }, "{:?}", mode);
            assert_eq!(emu.get_register(1), expected, "{}! in {:?}", n, mode);
            assert_eq!(emu.get_register(0), n.min(1));
        }
    }
}

#[test]
fn test_factorial_instruction_count_matches() {
    let counts: Vec<u64> = modes()
        .into_iter()
        .map(|mode| {
            let mut emu = emulator(mode, &factorial());
            emu.set_register(0, 6);
            emu.run().unwrap();
            emu.get_instruction_count()
        })
        .collect();
    assert!(counts.windows(2).all(|w| w[0] == w[1]), "{:?}", counts);
}

/// Copies 32 bytes from 0xa000 to 0x9000 with a byte loop, then the same bytes on to 0x9100 a
/// word block at a time. Both copies are subroutines.
fn memcpy() -> Vec<u32> {
    vec![
        // main
        mov_imm(0, 0x9000),
        mov_imm(1, 0xa000),
        mov_imm(2, 32),
        bl(at(3), at(10)),
        mov_imm(0, 0x9100),
        mov_imm(1, 0x9000),
        mov_imm(2, 32),
        bl(at(7), at(15)),
        mov_imm(7, 0x55),
        HALT,
        // byte copy
        ldrb_post(3, 1, 1),
        strb_post(3, 0, 1),
        s(sub_imm(2, 2, 1)),
        cond(NE, b(at(13), at(10))),
        bx(LR),
        // word copy, saves its scratch registers
        push(&[4, 5, 6, LR]),
        ldmia(1, &[3, 4, 5, 6]),
        stmia(0, &[3, 4, 5, 6]),
        s(sub_imm(2, 2, 16)),
        cond(NE, b(at(19), at(16))),
        pop(&[4, 5, 6, PC]),
    ]
}

#[test]
fn test_memcpy_calls() {
    let data: Vec<u8> = (0..32u8).map(|i| i.wrapping_mul(37) ^ 0x5a).collect();
    for mode in modes() {
        let mut emu = emulator(mode, &memcpy());
        assert!(emu.bus.ram.load(0xa000, &data));
        emu.set_register(4, 0x4444);
        let sp = emu.get_register(SP as usize);

        let summary = emu.run().unwrap();
        assert_eq!(summary.reason, StopReason::SelfLoop { addr: at(9) }, "{:?}", mode);
        for (i, byte) in data.iter().enumerate() {
            assert_eq!(emu.bus.ram.read8(0x9000 + i as u32), *byte, "{:?}", mode);
            assert_eq!(emu.bus.ram.read8(0x9100 + i as u32), *byte, "{:?}", mode);
        }
        assert_eq!(emu.get_register(0), 0x9120);
        assert_eq!(emu.get_register(1), 0x9020);
        assert_eq!(emu.get_register(4), 0x4444);
        assert_eq!(emu.get_register(7), 0x55);
        assert_eq!(emu.get_register(SP as usize), sp);
        assert_eq!(emu.get_register(LR as usize), at(8));
    }
}

#[test]
fn test_unsupported_instructions_are_skipped() {
    let program = [
        mov_imm(1, 3),
        // mul r0, r1, r1
        0xe0000191,
        // mcr p15, 0, r0, c1, c0, 0
        0xee010f10,
        // swi #0
        0xef000000,
        add_imm(1, 1, 1),
        HALT,
    ];
    for mode in modes() {
        let mut emu = emulator(mode, &program);
        let summary = emu.run().unwrap();
        assert_eq!(summary.reason, StopReason::SelfLoop { addr: at(5) });
        assert_eq!(summary.instructions, 6);
        assert_eq!(emu.get_register(1), 4, "{:?}", mode);
        assert_eq!(emu.get_register(0), 0);
        assert!(emu.unhandled_count() >= 2, "{:?}", mode);
    }
}

struct Uart {
    sent: Arc<Mutex<Vec<u32>>>,
}

impl MmioHandler for Uart {
    fn on_read(&mut self, addr: u32) -> u32 {
        match addr & 0xff {
            // status: always ready
            0x04 => 0x20,
            _ => 0,
        }
    }

    fn on_write(&mut self, _addr: u32, value: u32) { self.sent.lock().unwrap().push(value); }
}

#[test]
fn test_peripherals_and_display() {
    let program = [
        mov_imm(0, 0x1000_0000),
        mov_imm(1, 0x48),
        str(1, 0, 0),
        mov_imm(1, 0x69),
        str(1, 0, 0),
        ldr(2, 0, 4),
        mov_imm(3, 0x9000),
        mov_imm(4, 0xff),
        str(4, 3, 8),
        HALT,
    ];
    for mode in modes() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut emu = emulator(mode, &program);
        emu.register_mmio("uart", 0x1000_0000..=0x1000_00ff, 0, Uart { sent: sent.clone() });
        let display = emu.watch_display(0x9000..=0x90ff);

        emu.run().unwrap();
        assert_eq!(*sent.lock().unwrap(), [0x48, 0x69], "{:?}", mode);
        assert_eq!(emu.get_register(2), 0x20);
        assert_eq!(emu.bus.ram.read32(0x9008), 0xff);
        let events: Vec<DisplayEvent> = display.try_iter().collect();
        assert_eq!(
            events,
            [DisplayEvent {
                addr: 0x9008,
                value: 0xff
            }]
        );
        assert_eq!(emu.bus.unmapped_accesses(), 0);
    }
}

#[test]
fn test_budget_in_both_modes() {
    // add r0, r0, #1; b loop
    let program = [add_imm(0, 0, 1), b(at(1), at(0))];
    for mode in modes() {
        let mut emu = Emulator::new(EmulatorConfig {
            ram_size: 0x20000,
            mode,
            instruction_limit: Some(1000),
            ..Default::default()
        })
        .unwrap();
        emu.load_image(&assemble(&program), None).unwrap();
        let summary = emu.run().unwrap();
        assert_eq!(summary.reason, StopReason::BudgetExhausted);
        assert_eq!(summary.instructions, 1000);
        assert_eq!(emu.get_register(0), 500);
    }
}

struct Faulty;

impl MmioHandler for Faulty {
    fn on_read(&mut self, _addr: u32) -> u32 { panic!("device on fire") }

    fn on_write(&mut self, _addr: u32, _value: u32) {}
}

#[test]
fn test_peripheral_fault_ends_run() {
    let program = [mov_imm(0, 0x1000_0000), ldr(1, 0, 0), HALT];
    for mode in modes() {
        let mut emu = emulator(mode, &program);
        emu.register_mmio("faulty", 0x1000_0000..=0x1000_00ff, 0, Faulty);
        match (mode, emu.run()) {
            (
                ExecMode::Interpreted,
                Err(RunError::Fault {
                    pc,
                    instructions,
                    reason,
                }),
            ) => {
                assert_eq!((pc, instructions), (at(1), 1));
                assert_eq!(reason, "device on fire");
            }
            (
                ExecMode::Translated,
                Err(RunError::Execute {
                    block,
                    instructions,
                    source: ExecError::Fault { reason, .. },
                }),
            ) => {
                assert_eq!((block, instructions), (at(0), 0));
                assert_eq!(reason, "device on fire");
            }
            (mode, other) => panic!("{:?}: unexpected {:?}", mode, other),
        }
    }
}

#[cfg(all(target_arch = "x86_64", unix))]
#[test]
fn test_code_cache_exhaustion_stops_run() {
    // A small block jumps through a register to a long run of 13-register loads that can't
    // fit in the smallest allowed cache
    let mut program = vec![mov_imm(2, 0x8100), bx(2)];
    program.resize(0x40, 0);
    program.extend(std::iter::repeat(ldmia(SP, &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12])).take(200));
    program.push(HALT);

    let mut emu = Emulator::new(EmulatorConfig {
        ram_size: 0x20000,
        mode: ExecMode::Translated,
        code_cache_size: 4096,
        ..Default::default()
    })
    .unwrap();
    emu.load_image(&assemble(&program), None).unwrap();
    match emu.run() {
        Err(RunError::Translate {
            pc,
            instructions,
            source: TranslateError::CacheExhausted { addr, capacity, .. },
        }) => {
            assert_eq!(pc, 0x8100);
            assert_eq!(instructions, 2);
            assert_eq!(addr, 0x8100);
            assert!(capacity >= 4096);
        }
        other => panic!("unexpected {:?}", other),
    }
}

/// Translated blocks are not invalidated by stores into code, so a block that rewrites its own
/// next instruction keeps running the stale copy
#[cfg(all(target_arch = "x86_64", unix))]
#[test]
fn test_self_modifying_code_is_not_detected() {
    let program = [
        // r1 = word at 0x8010
        ldr(1, PC, 8),
        // overwrite the instruction at 0x8008
        str(1, PC, -4),
        mov_imm(2, 1),
        HALT,
        mov_imm(2, 2),
    ];
    let mut interpreted = emulator(ExecMode::Interpreted, &program);
    interpreted.run().unwrap();
    assert_eq!(interpreted.get_register(2), 2);

    let mut translated = emulator(ExecMode::Translated, &program);
    translated.run().unwrap();
    assert_eq!(translated.bus.ram.read32(at(2)), mov_imm(2, 2));
    assert_eq!(translated.get_register(2), 1);
}
