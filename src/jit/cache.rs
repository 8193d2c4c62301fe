//! The translation cache: one RWX mapping holding a small thunk area and
//! a fixed-width slot per guest byte.
//!
//! Because slots never move or change size, re-emission happens in place
//! and incoming branches need no fixups.  Invalidation is a 4-byte write
//! (`SLOT_TRAP`) over the head of the owning slot; the pattern re-enters
//! the dispatcher, which re-translates.
//!
//! Writers and executors are the same thread, so the pages stay
//! read-write-execute for the whole run and no protection toggling is
//! needed.

use std::io;
use std::ptr;

use log::debug;

use super::asm::Asm;
use super::{NUM_SLOTS, SLOT_SHIFT, SLOT_TRAP, SLOT_WIDTH};

/// Bytes reserved ahead of the slots for runtime-assembled thunks
/// (enter/exit trampolines, helper-call shims).
const THUNK_AREA: usize = 4096;

pub struct CodeCache {
    map_start: *mut u8,
    map_len: usize,
    thunk_cursor: usize,
    /// Per guest byte: host address of the slot whose translation covers
    /// that byte.  Untranslated bytes point at their own slot, which is
    /// trap-filled, so blind invalidation through the table is harmless.
    jit_ptrs: Box<[u64]>,
}

unsafe impl Send for CodeCache {}

impl CodeCache {
    pub fn new() -> io::Result<Self> {
        let map_len = THUNK_AREA + NUM_SLOTS * SLOT_WIDTH;
        let map_start = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if map_start == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let mut cache = Self {
            map_start: map_start as *mut u8,
            map_len,
            thunk_cursor: 0,
            jit_ptrs: vec![0u64; NUM_SLOTS].into_boxed_slice(),
        };
        for pc in 0..NUM_SLOTS {
            cache.reset_slot(pc as u16);
        }
        debug!("code cache mapped: {} MiB", map_len >> 20);
        Ok(cache)
    }

    pub fn slot_base(&self) -> u64 {
        self.map_start as u64 + THUNK_AREA as u64
    }

    pub fn slot_addr(&self, pc: u16) -> u64 {
        self.slot_base() + ((pc as u64) << SLOT_SHIFT)
    }

    pub fn ptrs_base(&self) -> u64 {
        self.jit_ptrs.as_ptr() as u64
    }

    // ── Thunks ────────────────────────────────────────────────

    /// Reserve space in the thunk area and return the address the next
    /// thunk will be emitted at.
    pub fn next_thunk_addr(&self) -> u64 {
        self.map_start as u64 + self.thunk_cursor as u64
    }

    /// Copy a finished thunk into the area and return its entry address.
    pub fn commit_thunk(&mut self, asm: &Asm) -> u64 {
        let bytes = asm.bytes();
        assert!(self.thunk_cursor + bytes.len() <= THUNK_AREA);
        let addr = self.map_start as u64 + self.thunk_cursor as u64;
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
        }
        self.thunk_cursor += bytes.len();
        addr
    }

    // ── Slots ─────────────────────────────────────────────────

    /// Install a finished translation for the instruction at `pc`
    /// covering `insn_len` guest bytes.  All covered bytes now route
    /// store-invalidation at this slot.
    pub fn install(&mut self, pc: u16, insn_len: u16, asm: &Asm) {
        let bytes = asm.bytes();
        assert!(
            bytes.len() <= SLOT_WIDTH,
            "translation of pc {pc:#06x} overflows its slot: {} bytes",
            bytes.len()
        );
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.slot_addr(pc) as *mut u8, bytes.len());
        }
        for i in 0..insn_len {
            let byte = pc.wrapping_add(i);
            self.jit_ptrs[byte as usize] = self.slot_addr(pc);
        }
    }

    /// Return a slot (and its byte's ownership) to the untranslated
    /// state: the trap pattern followed by no-op fill.
    pub fn reset_slot(&mut self, pc: u16) {
        let addr = self.slot_addr(pc) as *mut u8;
        unsafe {
            ptr::copy_nonoverlapping(SLOT_TRAP.as_ptr(), addr, SLOT_TRAP.len());
            ptr::write_bytes(addr.add(SLOT_TRAP.len()), 0x90, SLOT_WIDTH - SLOT_TRAP.len());
        }
        self.jit_ptrs[pc as usize] = self.slot_addr(pc);
    }

    /// Host-side invalidation of a single guest byte (sideways RAM
    /// writes through the bus take this path; translated stores plant
    /// the same bytes through the pointer table themselves).
    pub fn invalidate_byte(&mut self, addr: u16) {
        let slot = self.jit_ptrs[addr as usize];
        unsafe {
            ptr::copy_nonoverlapping(SLOT_TRAP.as_ptr(), slot as *mut u8, SLOT_TRAP.len());
        }
    }

    /// Wholesale invalidation, e.g. a sideways ROM bank switch.
    pub fn invalidate_range(&mut self, start: u16, end_inclusive: u16) {
        for addr in start..=end_inclusive {
            self.reset_slot(addr);
        }
    }

    /// First bytes of the slot for `pc` — staleness inspection.
    pub fn slot_head(&self, pc: u16) -> [u8; 4] {
        let mut head = [0u8; 4];
        unsafe {
            ptr::copy_nonoverlapping(self.slot_addr(pc) as *const u8, head.as_mut_ptr(), 4);
        }
        head
    }

    /// Whether the slot currently begins with the trap pattern.
    pub fn is_trapped(&self, pc: u16) -> bool {
        self.slot_head(pc) == SLOT_TRAP
    }
}

impl Drop for CodeCache {
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
    fn fresh_slots_carry_the_trap_pattern() {
        let cache = CodeCache::new().unwrap();
        assert!(cache.is_trapped(0x0000));
        assert!(cache.is_trapped(0x1234));
        assert!(cache.is_trapped(0xFFFF));
    }

    #[test]
    fn pc_to_host_is_a_scaled_add() {
        let cache = CodeCache::new().unwrap();
        assert_eq!(
            cache.slot_addr(0x1234) - cache.slot_addr(0),
            0x1234 << SLOT_SHIFT
        );
    }

    #[test]
    fn install_then_invalidate_restores_the_trap() {
        let mut cache = CodeCache::new().unwrap();
        let mut asm = Asm::new(cache.slot_addr(0x2000));
        asm.mov_r_imm(crate::jit::asm::Reg8::Al, 0x42);
        cache.install(0x2000, 2, &asm);
        assert!(!cache.is_trapped(0x2000));

        // A write to the operand byte must take down the owning slot.
        cache.invalidate_byte(0x2001);
        assert!(cache.is_trapped(0x2000));
    }

    #[test]
    fn untranslated_bytes_own_their_own_slot() {
        let mut cache = CodeCache::new().unwrap();
        // Blind invalidation of a never-translated byte is a no-op.
        cache.invalidate_byte(0x3000);
        assert!(cache.is_trapped(0x3000));
    }
}
