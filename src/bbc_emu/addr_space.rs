//! Guest address space: one flat 64 KiB mapping, flanked by inaccessible
//! guard regions.
//!
//! The translator emits direct host loads/stores against this memory, so
//! it has to live at a stable address for the machine's lifetime and any
//! stray access computed from a mis-wrapped 16-bit offset should fault
//! immediately rather than corrupt the heap.  A full 64 KiB guard on
//! each side covers every reachable scaled offset.
//!
//! The MMIO window is not special here: routing reads/writes in
//! 0xFC00-0xFEFF to peripherals is the machine's job.  This type is the
//! raw backing store.

use std::io;
use std::ptr;

pub const ADDR_SPACE_SIZE: usize = 0x10000;
const GUARD_SIZE: usize = 0x10000;

pub struct AddrSpace {
    /// Start of the accessible 64 KiB.
    base: *mut u8,
    /// Start of the whole mapping, guards included.
    map_start: *mut u8,
    map_len: usize,
}

// The mapping is plain memory owned by this struct; the raw pointers are
// an address-stability requirement, not shared state.
unsafe impl Send for AddrSpace {}

impl AddrSpace {
    pub fn new() -> io::Result<Self> {
        let map_len = GUARD_SIZE + ADDR_SPACE_SIZE + GUARD_SIZE;
        unsafe {
            let map_start = libc::mmap(
                ptr::null_mut(),
                map_len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if map_start == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            let base = (map_start as *mut u8).add(GUARD_SIZE);
            if libc::mprotect(
                base as *mut libc::c_void,
                ADDR_SPACE_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                let err = io::Error::last_os_error();
                libc::munmap(map_start, map_len);
                return Err(err);
            }
            Ok(Self {
                base,
                map_start: map_start as *mut u8,
                map_len,
            })
        }
    }

    /// Stable base pointer, for the translator's direct addressing.
    pub fn base_ptr(&self) -> *mut u8 {
        self.base
    }

    #[inline]
    pub fn read(&self, addr: u16) -> u8 {
        unsafe { *self.base.add(addr as usize) }
    }

    #[inline]
    pub fn write(&mut self, addr: u16, val: u8) {
        unsafe { *self.base.add(addr as usize) = val }
    }

    pub fn read_u16(&self, addr: u16) -> u16 {
        let lo = self.read(addr) as u16;
        let hi = self.read(addr.wrapping_add(1)) as u16;
        (hi << 8) | lo
    }

    /// Copy a block in (ROM banking, test fixtures).
    pub fn load(&mut self, addr: u16, bytes: &[u8]) {
        assert!(addr as usize + bytes.len() <= ADDR_SPACE_SIZE);
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(addr as usize), bytes.len());
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base, ADDR_SPACE_SIZE) }
    }
}

impl Drop for AddrSpace {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.map_start as *mut libc::c_void, self.map_len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_roundtrip() {
        let mut m = AddrSpace::new().unwrap();
        m.write(0x0070, 0x42);
        assert_eq!(m.read(0x0070), 0x42);
        m.write(0xFFFF, 0xAB);
        assert_eq!(m.read(0xFFFF), 0xAB);
    }

    #[test]
    fn loads_little_endian_words() {
        let mut m = AddrSpace::new().unwrap();
        m.load(0xFFFC, &[0x34, 0x12]);
        assert_eq!(m.read_u16(0xFFFC), 0x1234);
    }

    #[test]
    fn fresh_space_is_zeroed() {
        let m = AddrSpace::new().unwrap();
        assert!(m.as_slice().iter().all(|&b| b == 0));
    }
}
