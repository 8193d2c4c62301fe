//! BBC keyboard matrix.
//!
//! The matrix is a grid of cells written only by the UI thread and read
//! lock-free by the emulation thread (the system VIA scans it through
//! the slow data bus).  Row 0 carries the keyboard DIP links, rows 1-7
//! the actual keys; there are 10 columns.
//!
//! Capture/replay records the matrix transitions against the master
//! tick counter, so a captured session replays deterministically.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::errors::LoadError;

pub const KEY_ROWS: usize = 8;
pub const KEY_COLS: usize = 10;

// ── Shared matrix ─────────────────────────────────────────────

/// The grid itself.  One byte per cell, 0 = up, 1 = down.
pub struct KeyGrid {
    cells: [[AtomicU8; KEY_COLS]; KEY_ROWS],
}

impl KeyGrid {
    fn new() -> Self {
        Self {
            cells: std::array::from_fn(|_| std::array::from_fn(|_| AtomicU8::new(0))),
        }
    }

    pub fn set(&self, row: u8, col: u8, down: bool) {
        if (row as usize) < KEY_ROWS && (col as usize) < KEY_COLS {
            self.cells[row as usize][col as usize].store(down as u8, Ordering::Relaxed);
        }
    }

    pub fn get(&self, row: u8, col: u8) -> bool {
        if (row as usize) < KEY_ROWS && (col as usize) < KEY_COLS {
            self.cells[row as usize][col as usize].load(Ordering::Relaxed) != 0
        } else {
            false
        }
    }
}

/// Writer handle for the UI thread.
#[derive(Clone)]
pub struct KeyboardHandle {
    grid: Arc<KeyGrid>,
}

impl KeyboardHandle {
    pub fn set_key(&self, row: u8, col: u8, down: bool) {
        self.grid.set(row, col, down);
    }
}

// ── Capture / replay timeline ─────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyEvent {
    pub tick: u64,
    pub row: u8,
    pub col: u8,
    pub down: bool,
}

// ── Emulation-side keyboard ───────────────────────────────────

pub struct Keyboard {
    grid: Arc<KeyGrid>,

    capture: Option<(PathBuf, Vec<KeyEvent>)>,
    /// Pending replay events, soonest last (popped from the back).
    replay: Vec<KeyEvent>,
    /// Snapshot of the last state we captured per cell, to record
    /// transitions rather than levels.
    captured_state: [[bool; KEY_COLS]; KEY_ROWS],
}

impl Keyboard {
    pub fn new() -> Self {
        Self {
            grid: Arc::new(KeyGrid::new()),
            capture: None,
            replay: Vec::new(),
            captured_state: [[false; KEY_COLS]; KEY_ROWS],
        }
    }

    pub fn handle(&self) -> KeyboardHandle {
        KeyboardHandle {
            grid: Arc::clone(&self.grid),
        }
    }

    // ── Matrix queries (system VIA port A scan) ───────────────

    pub fn is_key_pressed(&self, row: u8, col: u8) -> bool {
        self.grid.get(row, col)
    }

    /// Any key down in `col`, excluding the row-0 links.
    pub fn is_key_column_pressed(&self, col: u8) -> bool {
        (1..KEY_ROWS as u8).any(|row| self.grid.get(row, col))
    }

    pub fn is_any_key_pressed(&self) -> bool {
        (0..KEY_COLS as u8).any(|col| self.is_key_column_pressed(col))
    }

    // ── Capture / replay ──────────────────────────────────────

    pub fn set_capture_file(&mut self, path: &Path) {
        self.capture = Some((path.to_path_buf(), Vec::new()));
    }

    pub fn load_replay_file(&mut self, path: &Path) -> Result<(), LoadError> {
        let text = fs::read_to_string(path).map_err(|source| LoadError::File {
            path: path.to_path_buf(),
            source,
        })?;
        let mut events: Vec<KeyEvent> =
            serde_json::from_str(&text).map_err(|e| LoadError::Format {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
        events.sort_by_key(|e| e.tick);
        events.reverse();
        info!("loaded keyboard replay: {} events", events.len());
        self.replay = events;
        Ok(())
    }

    /// Called from the emulation loop: apply replay events that are due
    /// and record capture transitions, both keyed by the master tick.
    pub fn tick(&mut self, now: u64) {
        while self.replay.last().map_or(false, |ev| ev.tick <= now) {
            if let Some(ev) = self.replay.pop() {
                self.grid.set(ev.row, ev.col, ev.down);
            }
        }

        if let Some((_, events)) = self.capture.as_mut() {
            for row in 0..KEY_ROWS as u8 {
                for col in 0..KEY_COLS as u8 {
                    let down = self.grid.get(row, col);
                    if down != self.captured_state[row as usize][col as usize] {
                        self.captured_state[row as usize][col as usize] = down;
                        events.push(KeyEvent {
                            tick: now,
                            row,
                            col,
                            down,
                        });
                    }
                }
            }
        }
    }

    /// Flush the capture file, if capturing.
    pub fn finish(&mut self) {
        if let Some((path, events)) = self.capture.take() {
            match serde_json::to_string_pretty(&events) {
                Ok(text) => {
                    if let Err(e) = fs::write(&path, text) {
                        warn!("cannot write capture file {}: {e}", path.display());
                    } else {
                        info!("wrote {} keyboard events to {}", events.len(), path.display());
                    }
                }
                Err(e) => warn!("cannot serialize capture: {e}"),
            }
        }
    }
}

impl Default for Keyboard {
    fn default() -> Self {
        Self::new()
    }
}
