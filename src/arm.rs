pub mod bus;
pub mod decode;
pub mod disasm;
pub mod interp;
pub mod memory;
pub mod mmio;
pub mod state;
