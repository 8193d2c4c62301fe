//! BBC Micro machine emulation core.
//!
//! The CPU itself is the dynamic translator in `crate::jit`; everything
//! the CPU can observe — memory, the timing wheel, the two 6522 VIAs,
//! keyboard, sound strobe, vsync cadence — lives here.

pub mod addr_space;
pub mod keyboard;
pub mod machine;
pub mod roms;
pub mod sound;
pub mod state6502;
pub mod timing;
pub mod via;
pub mod video;
