use std::io;
use std::ptr;

use log::debug;

use crate::error::TranslateError;

/// A single anonymous mapping holding every block of one translation generation. Writable while
/// blocks are appended, then flipped to read+execute by `make_executable`. Never both.
pub struct CodeCache {
    ptr: *mut u8,
    capacity: usize,
    len: usize,
    executable: bool,
}

// The mapping is owned exclusively and only reachable through `&mut self` while writable
unsafe impl Send for CodeCache {}

fn os_error(op: &'static str) -> TranslateError {
    TranslateError::Os {
        op,
        source: io::Error::last_os_error(),
    }
}

#[cfg(unix)]
fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    }
}

#[cfg(unix)]
impl CodeCache {
    pub fn new(size: usize) -> Result<Self, TranslateError> {
        let page = page_size();
        let capacity = size.div_ceil(page).max(1) * page;
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(os_error("mmap"));
        }
        debug!("code cache: mapped {:#x} bytes", capacity);
        Ok(Self {
            ptr: ptr as *mut u8,
            capacity,
            len: 0,
            executable: false,
        })
    }

    /// Copy a block in, returning its offset. `addr` names the guest block for errors.
    pub fn append(&mut self, addr: u32, code: &[u8]) -> Result<usize, TranslateError> {
        if self.executable {
            return Err(TranslateError::Finalized { addr });
        }
        if code.len() > self.capacity - self.len {
            return Err(TranslateError::CacheExhausted {
                addr,
                needed: code.len(),
                used: self.len,
                capacity: self.capacity,
            });
        }
        let offset = self.len;
        // SAFETY: the range was checked against the mapping above and the mapping is writable
        unsafe { ptr::copy_nonoverlapping(code.as_ptr(), self.ptr.add(offset), code.len()) };
        self.len += code.len();
        Ok(offset)
    }

    pub fn make_executable(&mut self) -> Result<(), TranslateError> {
        if self.executable {
            return Ok(());
        }
        self.protect(libc::PROT_READ | libc::PROT_EXEC, "mprotect(rx)")?;
        self.executable = true;
        debug!("code cache: finalized {} of {} bytes", self.len, self.capacity);
        Ok(())
    }

    /// Drop every block and make the cache writable again
    pub fn reset(&mut self) -> Result<(), TranslateError> {
        if self.executable {
            self.protect(libc::PROT_READ | libc::PROT_WRITE, "mprotect(rw)")?;
            self.executable = false;
        }
        self.len = 0;
        Ok(())
    }

    fn protect(&mut self, prot: libc::c_int, op: &'static str) -> Result<(), TranslateError> {
        let rc = unsafe { libc::mprotect(self.ptr as *mut libc::c_void, self.capacity, prot) };
        if rc != 0 {
            return Err(os_error(op));
        }
        Ok(())
    }
}

#[cfg(unix)]
impl Drop for CodeCache {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.capacity) };
        if rc != 0 {
            debug!("code cache: munmap failed: {}", io::Error::last_os_error());
        }
    }
}

#[cfg(not(unix))]
impl CodeCache {
    pub fn new(_size: usize) -> Result<Self, TranslateError> {
        Err(TranslateError::UnsupportedHost)
    }

    pub fn append(&mut self, addr: u32, _code: &[u8]) -> Result<usize, TranslateError> {
        Err(TranslateError::Finalized { addr })
    }

    pub fn make_executable(&mut self) -> Result<(), TranslateError> {
        Err(TranslateError::UnsupportedHost)
    }

    pub fn reset(&mut self) -> Result<(), TranslateError> { Ok(()) }
}

impl CodeCache {
    pub fn len(&self) -> usize { self.len }

    pub fn is_empty(&self) -> bool { self.len == 0 }

    pub fn capacity(&self) -> usize { self.capacity }

    pub fn is_executable(&self) -> bool { self.executable }

    /// Entry point at `offset`, only once the cache is executable
    pub fn entry(&self, offset: usize) -> Option<*const u8> {
        if !self.executable || offset >= self.len {
            return None;
        }
        // SAFETY: offset is inside the written part of the mapping
        Some(unsafe { self.ptr.add(offset) } as *const u8)
    }

    /// Copy of the bytes written so far
    pub fn bytes(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        // SAFETY: the range lies inside the written, readable part of the mapping
        Some(unsafe { std::slice::from_raw_parts(self.ptr.add(offset), len) }.to_vec())
    }
}
