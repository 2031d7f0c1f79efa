use std::any::Any;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("ram size must be non-zero")]
    EmptyRam,
    #[error("ram at {base:#010x} with size {size:#x} runs past the end of the address space")]
    RamOverflow { base: u32, size: usize },
    #[error("stack guard of {guard:#x} bytes leaves no stack in {size:#x} bytes of ram")]
    StackGuard { guard: u32, size: usize },
    #[error("code cache of {0} bytes is too small to hold a block")]
    CodeCacheTooSmall(usize),
    #[error("blocks must be allowed at least one instruction")]
    ZeroBlockLen,
    #[error("regions must be allowed at least one block")]
    ZeroRegionLimit,
}

/// Firmware images are rejected before any state is touched
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoadError {
    #[error("firmware image is empty")]
    Empty,
    #[error(
        "image of {len:#x} bytes at {addr:#010x} does not fit in ram {ram_base:#010x}..{ram_end:#x}"
    )]
    OutOfRange {
        addr: u32,
        len: usize,
        ram_base: u32,
        ram_end: u64,
    },
}

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("native translation needs an x86-64 unix host")]
    UnsupportedHost,
    #[error(
        "code cache exhausted translating {addr:#010x}: {needed} bytes needed, {used} of {capacity} used"
    )]
    CacheExhausted {
        addr: u32,
        needed: usize,
        used: usize,
        capacity: usize,
    },
    #[error("code cache is finalized, reset it before translating {addr:#010x}")]
    Finalized { addr: u32 },
    #[error("nothing to translate at {addr:#010x}")]
    NotMapped { addr: u32 },
    #[error("block at {addr:#010x} left a jump unresolved")]
    UnboundLabel { addr: u32 },
    #[error("{op} failed on the code cache")]
    Os {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecError {
    #[error("code cache is still writable")]
    NotFinalized,
    #[error("fault at {addr:#010x}: {reason}")]
    Fault { addr: u32, reason: String },
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("translation failed at {pc:#010x} after {instructions} instructions")]
    Translate {
        pc: u32,
        instructions: u64,
        #[source]
        source: TranslateError,
    },
    #[error("fault at {pc:#010x} after {instructions} instructions: {reason}")]
    Fault {
        pc: u32,
        instructions: u64,
        reason: String,
    },
    #[error("translated block at {block:#010x} failed after {instructions} instructions")]
    Execute {
        block: u32,
        instructions: u64,
        #[source]
        source: ExecError,
    },
}

/// Text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panicked".to_string())
}
