use std::mem::size_of;

use num::traits::{FromBytes, ToBytes};

/// Flat little-endian RAM window starting at `base`. Accesses that fall (even partly) outside
/// the window read as zero and drop writes; routing those addresses elsewhere is the bus's job.
#[derive(Clone, Debug)]
pub struct Memory {
    base: u32,
    bytes: Vec<u8>,
}

impl Memory {
    pub fn new(base: u32, size: usize) -> Self {
        Self {
            base,
            bytes: vec![0; size],
        }
    }

    pub fn base(&self) -> u32 { self.base }

    pub fn len(&self) -> usize { self.bytes.len() }

    pub fn is_empty(&self) -> bool { self.bytes.is_empty() }

    /// One past the last mapped address (may be 2^32)
    pub fn end(&self) -> u64 { self.base as u64 + self.bytes.len() as u64 }

    /// Index into the backing buffer for an access of `width` bytes, if it lies fully inside
    fn offset(&self, addr: u32, width: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.base)? as usize;
        let end = offset.checked_add(width)?;
        (end <= self.bytes.len()).then_some(offset)
    }

    pub fn contains(&self, addr: u32, width: usize) -> bool { self.offset(addr, width).is_some() }

    pub fn read<T>(&self, addr: u32) -> Option<T>
    where
        T: FromBytes,
        T::Bytes: Sized + for<'a> TryFrom<&'a [u8]>,
    {
        let width = size_of::<T>();
        let i = self.offset(addr, width)?;
        let bytes = T::Bytes::try_from(&self.bytes[i..i + width]).ok()?;
        Some(T::from_le_bytes(&bytes))
    }

    /// Returns false if the write fell outside the window and was dropped
    pub fn write<T: ToBytes>(&mut self, addr: u32, value: T) -> bool {
        let bytes = value.to_le_bytes();
        let bytes = bytes.as_ref();
        match self.offset(addr, bytes.len()) {
            Some(i) => {
                self.bytes[i..i + bytes.len()].copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    pub fn read32(&self, addr: u32) -> u32 { self.read::<u32>(addr).unwrap_or(0) }

    pub fn read8(&self, addr: u32) -> u8 { self.read::<u8>(addr).unwrap_or(0) }

    pub fn write32(&mut self, addr: u32, value: u32) { self.write(addr, value); }

    pub fn write8(&mut self, addr: u32, value: u8) { self.write(addr, value); }

    /// Copy `data` in at `addr`. All or nothing: returns false without touching memory if any
    /// byte would land outside the window.
    pub fn load(&mut self, addr: u32, data: &[u8]) -> bool {
        match self.offset(addr, data.len()) {
            Some(i) => {
                self.bytes[i..i + data.len()].copy_from_slice(data);
                true
            }
            None => false,
        }
    }

    pub fn as_slice(&self) -> &[u8] { &self.bytes }

    pub fn iter_word(&self, start_addr: u32) -> impl Iterator<Item = u32> + '_ {
        let start = self.offset(start_addr, 0).unwrap_or(self.bytes.len());
        self.bytes[start..]
            .chunks_exact(4)
            .filter_map(|word| <[u8; 4]>::try_from(word).ok())
            .map(u32::from_le_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! read_tests {
        ($bytes:expr, $($name:ident: $T:ty, $data:expr,)*) => {
            $(
                #[test]
                fn $name() {
                    let (read_addr, expected) = $data;
                    let mut mem = Memory::new(0x1000, 0);
                    mem.bytes = $bytes;
                    assert_eq!(mem.read::<$T>(read_addr), expected);
                }
            )*
        };
    }

    read_tests! {
        vec![0x34, 0xff, 0xbe, 0x70, 0xf1],
        test_read_u8_0: u8, (0x1000, Some(0x34)),
        test_read_u8_1: u8, (0x1001, Some(0xff)),
        test_read_u8_4: u8, (0x1004, Some(0xf1)),
        test_read_u16_0: u16, (0x1000, Some(0xff34)),
        test_read_u16_unaligned: u16, (0x1001, Some(0xbeff)),
        test_read_u32_0: u32, (0x1000, Some(0x70beff34)),
        test_read_u32_unaligned: u32, (0x1001, Some(0xf170beff)),
        test_read_u32_past_end: u32, (0x1002, None),
        test_read_below_base: u8, (0x0fff, None),
        test_read_u8_past_end: u8, (0x1005, None),
    }

    #[test]
    fn test_write() {
        let mut mem = Memory::new(0, 4);
        mem.write(0, 0x12345678u32);
        assert_eq!(mem.as_slice(), [0x78, 0x56, 0x34, 0x12]);
        mem.write(0, 0u8);
        assert_eq!(mem.as_slice(), [0x00, 0x56, 0x34, 0x12]);
        mem.write(1, 0u16);
        assert_eq!(mem.as_slice(), [0x00, 0x00, 0x00, 0x12]);
        mem.write(2, 0xabu8);
        assert_eq!(mem.as_slice(), [0x00, 0x00, 0xab, 0x12]);
    }

    #[test]
    fn test_out_of_range_is_silent() {
        let mut mem = Memory::new(0x8000_0000, 16);
        assert!(!mem.write(0x8000_000e, 0xffff_ffffu32));
        assert!(!mem.write(0x7fff_fffc, 1u32));
        assert!(!mem.write(0xffff_fffe, 1u32));
        assert!(mem.as_slice().iter().all(|b| *b == 0));
        assert_eq!(mem.read32(0x8000_0010), 0);
        assert_eq!(mem.read8(0x1234), 0);
    }

    #[test]
    fn test_store_then_load() {
        let mut mem = Memory::new(0x100, 0x100);
        mem.write32(0x1f0, 0xcafe_f00d);
        assert_eq!(mem.read32(0x1f0), 0xcafe_f00d);
        mem.write8(0x1ff, 0x5a);
        assert_eq!(mem.read8(0x1ff), 0x5a);
    }

    #[test]
    fn test_load_all_or_nothing() {
        let mut mem = Memory::new(0x100, 8);
        assert!(!mem.load(0x104, &[1, 2, 3, 4, 5]));
        assert!(mem.as_slice().iter().all(|b| *b == 0));
        assert!(mem.load(0x104, &[1, 2, 3, 4]));
        assert_eq!(mem.read32(0x104), 0x04030201);
    }

    #[test]
    fn test_iter_word() {
        let mut mem = Memory::new(0x100, 12);
        mem.load(0x100, &[1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0]);
        assert_eq!(mem.iter_word(0x104).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(mem.iter_word(0x200).count(), 0);
    }
}
