use crate::error::ConfigError;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum ExecMode {
    #[default]
    Interpreted,
    Translated,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmulatorConfig {
    /// Physical address of the first RAM byte
    pub ram_base: u32,
    pub ram_size: usize,
    /// Entry point used when an image is loaded without an explicit address
    pub default_entry: u32,
    /// Bytes reserved above the initial stack pointer at the top of RAM
    pub stack_guard: u32,
    /// Per-run ceiling on executed instructions
    pub instruction_limit: Option<u64>,
    pub mode: ExecMode,
    pub code_cache_size: usize,
    /// Longest block the translator will build
    pub max_block_len: usize,
    /// Blocks translated per cache generation
    pub region_block_limit: usize,
    /// Log every executed instruction at trace level
    pub trace: bool,
}

/// Smallest cache accepted, one page. It is not sized for a worst-case block: a block that
/// doesn't fit is reported as `TranslateError::CacheExhausted` when it is translated.
const MIN_CODE_CACHE: usize = 4096;

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            ram_base: 0,
            ram_size: 16 << 20,
            default_entry: 0x8000,
            stack_guard: 0x1000,
            instruction_limit: Some(100_000_000),
            mode: ExecMode::Interpreted,
            code_cache_size: 4 << 20,
            max_block_len: 64,
            region_block_limit: 256,
            trace: false,
        }
    }
}

impl EmulatorConfig {
    pub fn ram_end(&self) -> u64 { self.ram_base as u64 + self.ram_size as u64 }

    /// Initial stack pointer after reset
    pub fn stack_top(&self) -> u32 { (self.ram_end() - self.stack_guard as u64) as u32 }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ram_size == 0 {
            return Err(ConfigError::EmptyRam);
        }
        if self.ram_end() > 1 << 32 {
            return Err(ConfigError::RamOverflow {
                base: self.ram_base,
                size: self.ram_size,
            });
        }
        if self.stack_guard as u64 >= self.ram_size as u64
            || self.ram_end() - self.stack_guard as u64 > u32::MAX as u64
        {
            return Err(ConfigError::StackGuard {
                guard: self.stack_guard,
                size: self.ram_size,
            });
        }
        if self.code_cache_size < MIN_CODE_CACHE {
            return Err(ConfigError::CodeCacheTooSmall(self.code_cache_size));
        }
        if self.max_block_len == 0 {
            return Err(ConfigError::ZeroBlockLen);
        }
        if self.region_block_limit == 0 {
            return Err(ConfigError::ZeroRegionLimit);
        }
        Ok(())
    }
}
