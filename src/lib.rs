//! Cycle-accurate BBC Micro emulator core.
//!
//! Three interlocking pieces: a dynamic binary translator compiling
//! 6502 code to x86-64 on the fly (`jit`), a deterministic timing wheel
//! driving CPU and peripherals in lockstep (`bbc_emu::timing`), and the
//! 6522 VIA pair exercising the timer/interrupt contract end to end
//! (`bbc_emu::via`).  The window, sound output, video raster and media
//! codecs are external collaborators behind small interfaces.

pub mod bbc_emu;
pub mod config;
pub mod errors;
pub mod jit;
pub mod messages;

pub use bbc_emu::machine::{Bus, Machine, MachineHandle};
pub use config::{Config, CpuMode, Options};
