use std::collections::HashMap;
use std::ops::RangeInclusive;

use log::debug;

/// A peripheral that answers memory-mapped register accesses. Calls are synchronous and must not
/// fail; unknown registers should read as some default value.
pub trait MmioHandler: Send {
    fn on_read(&mut self, addr: u32) -> u32;

    fn on_write(&mut self, addr: u32, value: u32);
}

struct Region {
    name: String,
    range: RangeInclusive<u32>,
    priority: i32,
    handler: Box<dyn MmioHandler>,
}

/// Routes physical addresses to registered peripheral handlers. Overlapping ranges are resolved
/// by priority (highest first), then by registration order.
#[derive(Default)]
pub struct MmioDispatcher {
    regions: Vec<Region>,
}

impl MmioDispatcher {
    pub fn new() -> Self { Self::default() }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        range: RangeInclusive<u32>,
        priority: i32,
        handler: impl MmioHandler + 'static,
    ) {
        let name = name.into();
        debug!(
            "mmio: registered {} at {:#010x}..={:#010x} (priority {})",
            name,
            range.start(),
            range.end(),
            priority
        );
        // Insert after every region of equal or higher priority
        let pos = self
            .regions
            .iter()
            .position(|r| r.priority < priority)
            .unwrap_or(self.regions.len());
        self.regions.insert(
            pos,
            Region {
                name,
                range,
                priority,
                handler: Box::new(handler),
            },
        );
    }

    fn lookup(&mut self, addr: u32) -> Option<&mut Region> {
        self.regions.iter_mut().find(|r| r.range.contains(&addr))
    }

    pub fn claims(&self, addr: u32) -> bool { self.regions.iter().any(|r| r.range.contains(&addr)) }

    /// Name of the peripheral that would answer `addr`
    pub fn owner(&self, addr: u32) -> Option<&str> {
        self.regions
            .iter()
            .find(|r| r.range.contains(&addr))
            .map(|r| r.name.as_str())
    }

    pub fn try_read(&mut self, addr: u32) -> Option<u32> {
        self.lookup(addr).map(|r| r.handler.on_read(addr))
    }

    pub fn try_write(&mut self, addr: u32, value: u32) -> bool {
        match self.lookup(addr) {
            Some(r) => {
                r.handler.on_write(addr, value);
                true
            }
            None => false,
        }
    }
}

impl MmioHandler for MmioDispatcher {
    fn on_read(&mut self, addr: u32) -> u32 {
        self.try_read(addr).unwrap_or_else(|| {
            debug!("mmio: unmapped read at {:#010x}", addr);
            0
        })
    }

    fn on_write(&mut self, addr: u32, value: u32) {
        if !self.try_write(addr, value) {
            debug!("mmio: dropped write of {:#010x} to {:#010x}", value, addr);
        }
    }
}

/// Register bank with canned values. Writes are latched and read back; registers never written
/// read as their preset or `default`.
#[derive(Clone, Debug, Default)]
pub struct CannedRegisters {
    values: HashMap<u32, u32>,
    default: u32,
    writes: Vec<(u32, u32)>,
}

impl CannedRegisters {
    pub fn new(default: u32) -> Self {
        Self {
            default,
            ..Default::default()
        }
    }

    pub fn with_value(mut self, addr: u32, value: u32) -> Self {
        self.values.insert(addr, value);
        self
    }

    /// Every write seen, oldest first
    pub fn writes(&self) -> &[(u32, u32)] { &self.writes }
}

impl MmioHandler for CannedRegisters {
    fn on_read(&mut self, addr: u32) -> u32 { self.values.get(&addr).copied().unwrap_or(self.default) }

    fn on_write(&mut self, addr: u32, value: u32) {
        self.writes.push((addr, value));
        self.values.insert(addr, value);
    }
}
