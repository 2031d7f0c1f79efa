//! Dynamic binary translation of ARM blocks to x86-64.
//!
//! Blocks are straight-line runs of guest code ending at the first instruction that can write
//! the PC. Each block is a native function that runs with the guest registers in host registers
//! and returns to the driver with the next PC in the state struct, so blocks are never chained
//! to each other directly. Translation happens a region at a time into a writable cache, which is
//! then made executable; translating more code needs a `reset` and a fresh generation.

pub mod builder;
pub mod code_cache;
pub mod emitter;
pub mod helpers;

use std::collections::{BTreeMap, HashMap, VecDeque};

use log::debug;

use crate::arm::bus::Bus;
use crate::arm::decode::{decode, Branch, BranchTarget, Instruction};
use crate::arm::memory::Memory;
use crate::arm::state::{Cond, CpuState};
use crate::config::EmulatorConfig;
use crate::error::{ExecError, TranslateError};
use builder::{BlockBuilder, Helpers};
use code_cache::CodeCache;
use helpers::JitEnv;

#[derive(Clone, Debug)]
pub struct CompiledBlock {
    pub start_address: u32,
    pub host_entry_offset: usize,
    pub host_len: usize,
    pub instruction_count: u32,
    /// Address of a trailing unconditional branch to itself
    pub self_loop: Option<u32>,
    /// Statically known next blocks
    pub successors: Vec<u32>,
}

/// What one native block run did
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockRun {
    pub instructions: u64,
    pub self_loop: Option<u32>,
    pub unhandled: u64,
}

pub struct Translator {
    cache: CodeCache,
    helpers: Helpers,
    blocks: BTreeMap<u32, CompiledBlock>,
    /// Guest instruction address to host code offset
    offsets: HashMap<u32, usize>,
    max_block_len: usize,
    region_block_limit: usize,
    generation: u64,
}

impl Translator {
    pub fn new(config: &EmulatorConfig) -> Result<Self, TranslateError> {
        if !cfg!(all(target_arch = "x86_64", unix)) {
            return Err(TranslateError::UnsupportedHost);
        }
        Ok(Self {
            cache: CodeCache::new(config.code_cache_size)?,
            helpers: helpers::table(),
            blocks: BTreeMap::new(),
            offsets: HashMap::new(),
            max_block_len: config.max_block_len,
            region_block_limit: config.region_block_limit,
            generation: 0,
        })
    }

    pub fn contains(&self, addr: u32) -> bool { self.blocks.contains_key(&addr) }

    pub fn block_starts(&self) -> impl Iterator<Item = u32> + '_ { self.blocks.keys().copied() }

    pub fn len(&self) -> usize { self.blocks.len() }

    pub fn is_empty(&self) -> bool { self.blocks.is_empty() }

    /// Host code offset of the most recently translated copy of the instruction at `addr`
    pub fn host_offset(&self, addr: u32) -> Option<usize> { self.offsets.get(&addr).copied() }

    pub fn is_finalized(&self) -> bool { self.cache.is_executable() }

    pub fn generation(&self) -> u64 { self.generation }

    /// Bytes of emitted code in use
    pub fn cache_used(&self) -> usize { self.cache.len() }

    /// Native code of a translated block, for inspection
    pub fn host_code(&self, addr: u32) -> Option<Vec<u8>> {
        let block = self.blocks.get(&addr)?;
        self.cache.bytes(block.host_entry_offset, block.host_len)
    }

    /// Translate the block starting at `start`. Only code in RAM is translated.
    pub fn translate_block(
        &mut self,
        start: u32,
        mem: &Memory,
    ) -> Result<&CompiledBlock, TranslateError> {
        if self.cache.is_executable() {
            return Err(TranslateError::Finalized { addr: start });
        }
        if self.blocks.contains_key(&start) {
            return Ok(&self.blocks[&start]);
        }

        let mut builder = BlockBuilder::new(&self.helpers);
        let mut offsets = Vec::new();
        let mut last = None;
        let mut addr = start;
        while offsets.len() < self.max_block_len {
            let Some(word) = mem.read::<u32>(addr) else {
                break;
            };
            let instr = decode(word);
            offsets.push((addr, builder.len()));
            builder.translate(&instr, addr, word);
            last = Some((addr, instr));
            if instr.writes_pc() {
                break;
            }
            addr = addr.wrapping_add(4);
        }
        let Some((last_addr, last_instr)) = last else {
            return Err(TranslateError::NotMapped { addr: start });
        };

        let ends_block = last_instr.writes_pc();
        let next = last_addr.wrapping_add(4);
        let code = builder
            .finish((!ends_block).then_some(next))
            .ok_or(TranslateError::UnboundLabel { addr: start })?;
        let base = self.cache.append(start, &code)?;
        for (addr, offset) in offsets.iter() {
            self.offsets.insert(*addr, base + offset);
        }

        let block = CompiledBlock {
            start_address: start,
            host_entry_offset: base,
            host_len: code.len(),
            instruction_count: offsets.len() as u32,
            self_loop: self_loop(&last_instr, last_addr),
            successors: successors(&last_instr, last_addr, ends_block),
        };
        debug!(
            "translated block {:#010x}..={:#010x}: {} instructions, {} bytes at +{:#x}",
            start,
            last_addr,
            block.instruction_count,
            code.len(),
            base
        );
        Ok(self.blocks.entry(start).or_insert(block))
    }

    /// Translate the blocks reachable from `seeds` through static successors, up to the region
    /// limit. Running out of cache ends the region early unless not even the first block fit.
    /// Returns the number of blocks translated.
    pub fn translate_region(&mut self, seeds: &[u32], mem: &Memory) -> Result<usize, TranslateError> {
        let mut work: VecDeque<u32> = seeds.iter().copied().collect();
        let mut translated = 0;
        while let Some(addr) = work.pop_front() {
            if self.blocks.len() >= self.region_block_limit {
                debug!("region limit of {} blocks reached", self.region_block_limit);
                break;
            }
            if self.blocks.contains_key(&addr) {
                continue;
            }
            match self.translate_block(addr, mem) {
                Ok(block) => {
                    work.extend(block.successors.iter().copied());
                    translated += 1;
                }
                Err(TranslateError::NotMapped { addr }) => {
                    debug!("skipping successor {:#010x} outside ram", addr);
                }
                Err(e @ TranslateError::CacheExhausted { .. }) if translated > 0 => {
                    debug!("ending region early: {}", e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(translated)
    }

    /// Make the translated code executable. Nothing more can be translated until `reset`.
    pub fn finalize(&mut self) -> Result<(), TranslateError> { self.cache.make_executable() }

    /// Discard every block and start a new, writable generation
    pub fn reset(&mut self) -> Result<(), TranslateError> {
        self.cache.reset()?;
        self.blocks.clear();
        self.offsets.clear();
        self.generation += 1;
        debug!("code cache generation {}", self.generation);
        Ok(())
    }

    /// Run the block at `addr`. A miss runs nothing and returns `None`.
    pub fn execute(
        &self,
        addr: u32,
        cpu: &mut CpuState,
        bus: &mut Bus,
    ) -> Result<Option<BlockRun>, ExecError> {
        let Some(block) = self.blocks.get(&addr) else {
            debug!("no translated block at {:#010x}", addr);
            return Ok(None);
        };
        let entry = self
            .cache
            .entry(block.host_entry_offset)
            .ok_or(ExecError::NotFinalized)?;

        let mut env = JitEnv::new(bus);
        let status = run_native(entry, cpu, &mut env)?;
        if let Some((addr, reason)) = env.fault.take() {
            return Err(ExecError::Fault { addr, reason });
        }
        if status != 0 {
            return Err(ExecError::Fault {
                addr,
                reason: format!("block returned status {}", status),
            });
        }
        Ok(Some(BlockRun {
            instructions: block.instruction_count as u64,
            self_loop: block.self_loop,
            unhandled: env.unhandled,
        }))
    }
}

#[cfg(target_arch = "x86_64")]
fn run_native(entry: *const u8, cpu: &mut CpuState, env: &mut JitEnv<'_>) -> Result<u32, ExecError> {
    type BlockFn = unsafe extern "sysv64" fn(*mut CpuState, *mut JitEnv<'_>) -> u32;
    // SAFETY: `entry` is the start of a block emitted by `BlockBuilder` in an executable cache.
    // Blocks follow the System V ABI and only touch memory through the two pointers.
    let status = unsafe {
        let block = std::mem::transmute::<*const u8, BlockFn>(entry);
        block(cpu, env)
    };
    Ok(status)
}

#[cfg(not(target_arch = "x86_64"))]
fn run_native(_entry: *const u8, cpu: &mut CpuState, _env: &mut JitEnv<'_>) -> Result<u32, ExecError> {
    Err(ExecError::Fault {
        addr: cpu.pc(),
        reason: "native blocks need an x86-64 host".to_string(),
    })
}

fn self_loop(instr: &Instruction, addr: u32) -> Option<u32> {
    match instr {
        Instruction::Branch(Branch {
            cond: Cond::AL,
            link: false,
            target: BranchTarget::Offset(-8),
        }) => Some(addr),
        _ => None,
    }
}

fn successors(last: &Instruction, addr: u32, ends_block: bool) -> Vec<u32> {
    let next = addr.wrapping_add(4);
    if !ends_block {
        return vec![next];
    }
    let mut out = Vec::new();
    if let Instruction::Branch(b) = last {
        if let Some(target) = b.target_address(addr) {
            out.push(target);
        }
        if b.link {
            out.push(next);
        }
    }
    if last.cond() != Cond::AL && !out.contains(&next) {
        out.push(next);
    }
    out
}
