//! ROM image loading.
//!
//! The machine takes raw 16 KiB images: one OS ROM at 0xC000 and up to
//! sixteen sideways banks paged at 0x8000.  Bank images may be short
//! (language ROMs often are) and are zero-padded; a short OS image is a
//! fatal load error.

use std::fs;
use std::path::Path;

use log::info;

use crate::errors::LoadError;

pub const ROM_SIZE: usize = 0x4000;
pub const NUM_ROM_BANKS: usize = 16;

fn read_file(path: &Path) -> Result<Vec<u8>, LoadError> {
    fs::read(path).map_err(|source| LoadError::File {
        path: path.to_path_buf(),
        source,
    })
}

/// Load the OS ROM: exactly 16 KiB.
pub fn load_os_rom(path: &Path) -> Result<Vec<u8>, LoadError> {
    let bytes = read_file(path)?;
    if bytes.len() != ROM_SIZE {
        return Err(LoadError::RomSize {
            path: path.to_path_buf(),
            len: bytes.len(),
            expected: ROM_SIZE,
        });
    }
    info!("loaded OS ROM from {}", path.display());
    Ok(bytes)
}

/// Load a sideways bank image, zero-padded to 16 KiB.
pub fn load_bank_rom(path: &Path) -> Result<Vec<u8>, LoadError> {
    let mut bytes = read_file(path)?;
    if bytes.is_empty() || bytes.len() > ROM_SIZE {
        return Err(LoadError::RomSize {
            path: path.to_path_buf(),
            len: bytes.len(),
            expected: ROM_SIZE,
        });
    }
    bytes.resize(ROM_SIZE, 0);
    info!("loaded ROM bank image from {}", path.display());
    Ok(bytes)
}

pub fn parse_bank(text: &str) -> Result<usize, LoadError> {
    let bank = i64::from_str_radix(text, 16).map_err(|_| LoadError::BadBank { bank: -1 })?;
    if !(0..NUM_ROM_BANKS as i64).contains(&bank) {
        return Err(LoadError::BadBank { bank });
    }
    Ok(bank as usize)
}
