//! Dynamic binary translation of 6502 code to host x86-64.
//!
//! Layout: one RWX mapping holds a short thunk area followed by 65,536
//! fixed-width slots, one per guest byte, so guest PC to host address is
//! `slot_base + pc * SLOT_WIDTH` and a computed jump is a shift and an
//! add.  The translator emits straight-line code per instruction; the
//! dispatcher owns the host register convention and re-enters on every
//! exit.

pub mod asm;
pub mod cache;
pub mod dispatch;
pub mod translate;

/// log2 of the slot width.
pub const SLOT_SHIFT: u32 = 7;

/// Host bytes per guest byte.  Power of two, wide enough for the widest
/// single translated instruction this encoder produces.
pub const SLOT_WIDTH: usize = 1 << SLOT_SHIFT;

pub const NUM_SLOTS: usize = 0x10000;

/// The 4-byte sequence `call [r14 + ctx.retranslate_thunk]`.  Written at
/// the head of a slot to invalidate it: executing the patch re-enters
/// the dispatcher, which derives the guest PC from the return address
/// and re-translates.  Also the fill pattern for untranslated slots.
pub const SLOT_TRAP: [u8; 4] = [0x41, 0xFF, 0x56, 0x08];

/// `SLOT_TRAP` as the little-endian immediate a translated store writes
/// through the slot-pointer table.
pub const SLOT_TRAP_IMM: u32 = u32::from_le_bytes(SLOT_TRAP);
