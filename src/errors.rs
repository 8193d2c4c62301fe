//! Error types.
//!
//! Load-time and configuration problems are fatal and reported to the
//! user; emulation traps surface as `EmuError` so batch mode can turn
//! them into exit codes.  Nothing here is used for control flow inside
//! the core — recoveries go through explicit state transitions.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bad format in {path}: {detail}")]
    Format { path: PathBuf, detail: String },

    #[error("ROM image {path} is {len} bytes, expected {expected}")]
    RomSize {
        path: PathBuf,
        len: usize,
        expected: usize,
    },

    #[error("ROM bank {bank} out of range (0-15)")]
    BadBank { bank: i64 },

    #[error("cannot map guest memory: {0}")]
    Mmap(std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown CPU mode {0:?} (expected jit, interp or inturbo)")]
    UnknownMode(String),

    #[error("--fast and --accurate are mutually exclusive")]
    FastAndAccurate,

    #[error("mode {0} has no driver linked in this build")]
    UnsupportedMode(&'static str),

    #[error("bad hex value {0:?}")]
    BadHex(String),
}

#[derive(Debug, Error)]
pub enum EmuError {
    #[error("unimplemented opcode {opcode:#04x} at pc {pc:#06x}")]
    Unimplemented { opcode: u8, pc: u16 },

    #[error("invalid translation entered at pc {pc:#06x}")]
    InvalidTranslation { pc: u16 },

    #[error("run result {got:#010x} does not match expected {want:#010x}")]
    UnexpectedResult { got: u32, want: u32 },
}
