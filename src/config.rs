//! Run configuration.
//!
//! The CLI surface follows the classic emulator front ends: ROM banks,
//! media, a CPU driver selector, and batch-mode controls.  Validation
//! happens here so the machine only ever sees a consistent config.

use std::path::PathBuf;

use clap::Parser;

use crate::errors::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    Jit,
    Interp,
    Inturbo,
}

#[derive(Parser, Debug)]
#[command(
    name = "proton",
    version,
    about = "BBC Micro emulator with an x86-64 dynamic translator"
)]
pub struct Options {
    /// CPU driver: jit, interp or inturbo.
    #[arg(long, default_value = "jit")]
    pub mode: String,

    /// OS ROM image (16 KiB) mapped at 0xC000.
    #[arg(long, default_value = "roms/os12.rom")]
    pub os: PathBuf,

    /// Load a ROM image into a sideways bank: --rom BANK FILE.
    #[arg(long, num_args = 2, value_names = ["BANK", "FILE"])]
    pub rom: Vec<String>,

    /// Mark a sideways bank (hex) as writeable RAM.
    #[arg(long)]
    pub swram: Vec<String>,

    /// Disc image for drive 0 (decoded by the disc collaborator).
    #[arg(long)]
    pub disc: Vec<PathBuf>,

    /// Tape image.
    #[arg(long)]
    pub tape: Vec<PathBuf>,

    /// Start at this hex address instead of the reset vector.
    #[arg(long)]
    pub pc: Option<String>,

    /// Stop after this many 2 MHz cycles.
    #[arg(long)]
    pub cycles: Option<u64>,

    /// Expected run result (hex) for batch mode.
    #[arg(long)]
    pub expect: Option<String>,

    /// Check timers and interrupts at every instruction.
    #[arg(long)]
    pub accurate: bool,

    /// Run as fast as the host allows; lowers accuracy.
    #[arg(long)]
    pub fast: bool,

    /// Emulate fast while the tape motor is on.
    #[arg(long)]
    pub fasttape: bool,

    /// No window; batch mode.
    #[arg(long)]
    pub headless: bool,

    /// Bridge guest serial to the host terminal.
    #[arg(long)]
    pub terminal: bool,

    /// Capture keyboard input to a timeline file.
    #[arg(long)]
    pub capture: Option<PathBuf>,

    /// Replay keyboard input from a timeline file.
    #[arg(long)]
    pub replay: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: CpuMode,
    pub accurate: bool,
    pub fast: bool,
    pub fasttape: bool,
    pub headless: bool,
    pub terminal: bool,
    pub stop_cycles: Option<u64>,
    pub expect: Option<u32>,
    pub pc: Option<u16>,
}

fn parse_hex_u16(text: &str) -> Result<u16, ConfigError> {
    u16::from_str_radix(text.trim_start_matches("0x"), 16)
        .map_err(|_| ConfigError::BadHex(text.to_string()))
}

fn parse_hex_u32(text: &str) -> Result<u32, ConfigError> {
    u32::from_str_radix(text.trim_start_matches("0x"), 16)
        .map_err(|_| ConfigError::BadHex(text.to_string()))
}

impl Config {
    pub fn from_options(opts: &Options) -> Result<Self, ConfigError> {
        let mode = match opts.mode.as_str() {
            "jit" => CpuMode::Jit,
            "interp" => CpuMode::Interp,
            "inturbo" => CpuMode::Inturbo,
            other => return Err(ConfigError::UnknownMode(other.to_string())),
        };
        // The interpreter drivers are separate collaborators; this build
        // links only the translator.
        match mode {
            CpuMode::Jit => {}
            CpuMode::Interp => return Err(ConfigError::UnsupportedMode("interp")),
            CpuMode::Inturbo => return Err(ConfigError::UnsupportedMode("inturbo")),
        }
        if opts.fast && opts.accurate {
            return Err(ConfigError::FastAndAccurate);
        }
        Ok(Self {
            mode,
            accurate: opts.accurate,
            fast: opts.fast,
            fasttape: opts.fasttape,
            headless: opts.headless,
            terminal: opts.terminal,
            stop_cycles: opts.cycles,
            expect: opts.expect.as_deref().map(parse_hex_u32).transpose()?,
            pc: opts.pc.as_deref().map(parse_hex_u16).transpose()?,
        })
    }
}
