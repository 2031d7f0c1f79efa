pub mod arm;
pub mod config;
pub mod emulator;
pub mod error;
pub mod jit;

pub use config::{EmulatorConfig, ExecMode};
pub use emulator::{Emulator, RunSummary, StopHandle, StopReason};
pub use error::{ConfigError, ExecError, LoadError, RunError, TranslateError};
