use std::ops::RangeInclusive;
use std::sync::mpsc::{self, Receiver, Sender};

use log::debug;

use super::memory::Memory;
use super::mmio::{MmioDispatcher, MmioHandler};

/// A store that landed inside a watched display range
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DisplayEvent {
    pub addr: u32,
    pub value: u32,
}

struct DisplayWatch {
    range: RangeInclusive<u32>,
    tx: Sender<DisplayEvent>,
}

/// Everything the core can address. Registered peripherals are consulted first, then RAM. Any
/// address claimed by neither reads as 0 and drops writes.
pub struct Bus {
    pub ram: Memory,
    pub mmio: MmioDispatcher,
    watches: Vec<DisplayWatch>,
    unmapped: u64,
}

impl Bus {
    pub fn new(ram: Memory) -> Self {
        Self {
            ram,
            mmio: MmioDispatcher::new(),
            watches: Vec::new(),
            unmapped: 0,
        }
    }

    /// Subscribe to stores in `range`. Events are queued without blocking and the watch is dropped
    /// once the receiver goes away.
    pub fn watch(&mut self, range: RangeInclusive<u32>) -> Receiver<DisplayEvent> {
        let (tx, rx) = mpsc::channel();
        self.watches.push(DisplayWatch { range, tx });
        rx
    }

    /// Number of accesses that hit neither a peripheral nor RAM
    pub fn unmapped_accesses(&self) -> u64 { self.unmapped }

    pub fn read32(&mut self, addr: u32) -> u32 {
        if let Some(value) = self.mmio.try_read(addr) {
            return value;
        }
        match self.ram.read::<u32>(addr) {
            Some(value) => value,
            None => self.unmapped_read(addr),
        }
    }

    pub fn read8(&mut self, addr: u32) -> u8 {
        if let Some(value) = self.mmio.try_read(addr) {
            return value as u8;
        }
        match self.ram.read::<u8>(addr) {
            Some(value) => value,
            None => self.unmapped_read(addr) as u8,
        }
    }

    pub fn write32(&mut self, addr: u32, value: u32) {
        if !self.mmio.try_write(addr, value) && !self.ram.write(addr, value) {
            self.unmapped_write(addr, value);
        }
        self.notify(addr, value);
    }

    pub fn write8(&mut self, addr: u32, value: u8) {
        if !self.mmio.try_write(addr, value as u32) && !self.ram.write(addr, value) {
            self.unmapped_write(addr, value as u32);
        }
        self.notify(addr, value as u32);
    }

    fn unmapped_read(&mut self, addr: u32) -> u32 {
        self.unmapped += 1;
        self.mmio.on_read(addr)
    }

    fn unmapped_write(&mut self, addr: u32, value: u32) {
        self.unmapped += 1;
        self.mmio.on_write(addr, value);
    }

    fn notify(&mut self, addr: u32, value: u32) {
        if self.watches.is_empty() {
            return;
        }
        self.watches.retain(|w| {
            if !w.range.contains(&addr) {
                return true;
            }
            let alive = w.tx.send(DisplayEvent { addr, value }).is_ok();
            if !alive {
                debug!(
                    "bus: display watch {:#010x}..={:#010x} closed",
                    w.range.start(),
                    w.range.end()
                );
            }
            alive
        });
    }
}
