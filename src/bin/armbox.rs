use std::path::PathBuf;

use anyhow::{Context as _, Result};
use armbox::arm::disasm;
use armbox::{Emulator, EmulatorConfig, ExecMode};
use clap::{Parser, ValueEnum};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Mode {
    Interpret,
    Translate,
}

#[derive(Parser, Debug)]
#[command(version, about, long_about=None)]
struct Args {
    /// Raw firmware image
    rom: PathBuf,

    /// Load address, also used as the entry point
    #[arg(short, long, value_parser = parse_u32)]
    load_address: Option<u32>,

    #[arg(short, long, value_enum, default_value_t = Mode::Interpret)]
    mode: Mode,

    /// RAM base address
    #[arg(long, value_parser = parse_u32, default_value = "0")]
    ram_base: u32,

    /// RAM size in bytes
    #[arg(long, value_parser = parse_u32, default_value = "0x1000000")]
    ram_size: u32,

    /// Stop after this many instructions (0 for no limit)
    #[arg(short = 'n', long, default_value_t = 100_000_000)]
    limit: u64,

    /// Log every executed instruction (needs -vvv)
    #[arg(short, long, default_value_t = false)]
    trace: bool,

    /// Print this many instructions from the entry point before running
    #[arg(short, long, default_value_t = 0)]
    disassemble: usize,

    /// Raise the log level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Accepts decimal or 0x-prefixed hex
fn parse_u32(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("invalid number {}: {}", s, e))
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = EmulatorConfig {
        ram_base: args.ram_base,
        ram_size: args.ram_size as usize,
        default_entry: args.load_address.unwrap_or(args.ram_base),
        instruction_limit: (args.limit > 0).then_some(args.limit),
        mode: match args.mode {
            Mode::Interpret => ExecMode::Interpreted,
            Mode::Translate => ExecMode::Translated,
        },
        trace: args.trace,
        ..Default::default()
    };
    let mut emulator = Emulator::new(config).context("invalid configuration")?;
    emulator.load_rom(&args.rom, args.load_address)?;

    if args.disassemble > 0 {
        for line in disasm::listing(&emulator.bus.ram, emulator.get_pc(), args.disassemble) {
            println!("{}", line);
        }
        println!();
    }

    let summary = emulator.run()?;
    println!(
        "stopped after {} instructions: {:?}",
        summary.instructions, summary.reason
    );
    if emulator.unhandled_count() > 0 {
        println!("{} unhandled instructions", emulator.unhandled_count());
    }
    if emulator.bus.unmapped_accesses() > 0 {
        println!("{} unmapped accesses", emulator.bus.unmapped_accesses());
    }
    print!("{}", emulator.cpu);
    Ok(())
}
