//! Top-level machine wiring.
//!
//! `Bus` owns everything the CPU can observe: the guest address space,
//! the timing wheel, both VIAs, keyboard, sound strobe, and the vsync
//! stub.  The dispatcher and the JIT helper calls route every MMIO
//! access through here.  `Machine` adds the CPU driver, ROM banking and
//! the emulation-thread entry points.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info, trace, warn};

use crate::config::{Config, CpuMode};
use crate::errors::{EmuError, LoadError};
use crate::jit::dispatch::{JitCpu, RunExit};
use crate::messages::{Message, MSG_RENDER_DONE};

use super::addr_space::AddrSpace;
use super::keyboard::{Keyboard, KeyboardHandle};
use super::roms::{ROM_SIZE, NUM_ROM_BANKS};
use super::sound::{DiscardSound, SoundChip};
use super::state6502::{IrqSource, State6502};
use super::timing::{Tick, TimerId, Timing};
use super::via::{Via, ViaKind, INT_CA1};
use super::video::Video;

// ── SHEILA address map ────────────────────────────────────────

const ROMSEL: u16 = 0xFE30;
const ROMSEL_END: u16 = 0xFE3F;
const SYS_VIA_START: u16 = 0xFE40;
const SYS_VIA_END: u16 = 0xFE5F;
const USER_VIA_START: u16 = 0xFE60;
const USER_VIA_END: u16 = 0xFE7F;

const SIDEWAYS_START: u16 = 0x8000;
const SIDEWAYS_END: u16 = 0xBFFF;

// ── Bus ───────────────────────────────────────────────────────

pub struct Bus {
    pub mem: AddrSpace,
    pub timing: Timing,
    pub state: State6502,
    pub via_sys: Via,
    pub via_usr: Via,
    pub keyboard: Keyboard,
    pub sound: Box<dyn SoundChip>,
    pub video: Video,

    roms: [Option<Vec<u8>>; NUM_ROM_BANKS],
    sideways_ram: [bool; NUM_ROM_BANKS],
    romsel: u8,
    /// Set when a bank switch rewrote the sideways window; the CPU
    /// driver must drop every translation in it.
    pending_invalidate: Option<(u16, u16)>,

    stop: Arc<AtomicBool>,
    to_ui: Option<Sender<Message>>,
    from_ui: Option<Receiver<Message>>,
    pub vsync_wait_for_render: bool,
}

impl Bus {
    pub fn new() -> Result<Self, LoadError> {
        let mem = AddrSpace::new().map_err(LoadError::Mmap)?;
        let mut timing = Timing::new();
        let via_sys = Via::new(ViaKind::System, &mut timing);
        let via_usr = Via::new(ViaKind::User, &mut timing);
        let video = Video::new(&mut timing);
        Ok(Self {
            mem,
            timing,
            state: State6502::new(),
            via_sys,
            via_usr,
            keyboard: Keyboard::new(),
            sound: Box::new(DiscardSound),
            video,
            roms: std::array::from_fn(|_| None),
            sideways_ram: [false; NUM_ROM_BANKS],
            romsel: 0,
            pending_invalidate: None,
            stop: Arc::new(AtomicBool::new(false)),
            to_ui: None,
            from_ui: None,
            vsync_wait_for_render: false,
        })
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub fn set_channels(&mut self, to_ui: Sender<Message>, from_ui: Receiver<Message>) {
        self.to_ui = Some(to_ui);
        self.from_ui = Some(from_ui);
    }

    pub fn take_pending_invalidate(&mut self) -> Option<(u16, u16)> {
        self.pending_invalidate.take()
    }

    // ── ROM banking ───────────────────────────────────────────

    pub fn load_os_rom(&mut self, image: &[u8]) {
        assert_eq!(image.len(), ROM_SIZE);
        self.mem.load(0xC000, image);
    }

    pub fn load_rom_bank(&mut self, bank: usize, image: Vec<u8>) {
        assert_eq!(image.len(), ROM_SIZE);
        self.roms[bank] = Some(image);
    }

    pub fn make_sideways_ram(&mut self, bank: usize) {
        if self.roms[bank].is_none() {
            self.roms[bank] = Some(vec![0; ROM_SIZE]);
        }
        self.sideways_ram[bank] = true;
    }

    /// Page a bank into 0x8000-0xBFFF.  Sideways RAM contents survive a
    /// switch-away; ROM contents are re-copied each time.
    pub fn select_rom(&mut self, bank: u8) {
        let bank = bank & 0x0F;
        if bank == self.romsel {
            return;
        }
        let old = self.romsel as usize;
        if self.sideways_ram[old] {
            let window: Vec<u8> =
                self.mem.as_slice()[SIDEWAYS_START as usize..][..ROM_SIZE].to_vec();
            self.roms[old] = Some(window);
        }
        self.romsel = bank;
        self.page_in_selected();
    }

    fn page_in_selected(&mut self) {
        let image = match &self.roms[self.romsel as usize] {
            Some(image) => image.clone(),
            None => vec![0u8; ROM_SIZE],
        };
        self.mem.load(SIDEWAYS_START, &image);
        self.pending_invalidate = Some((SIDEWAYS_START, SIDEWAYS_END));
        trace!("ROMSEL now bank {:x}", self.romsel);
    }

    pub fn selected_rom(&self) -> u8 {
        self.romsel
    }

    /// Power-on bank: the highest populated slot, the way a BASIC ROM in
    /// slot 15 wins on real hardware.
    pub fn reset_rom_selection(&mut self) {
        self.romsel = (0..NUM_ROM_BANKS)
            .rev()
            .find(|&b| self.roms[b].is_some())
            .unwrap_or(15) as u8;
        self.page_in_selected();
    }

    // ── CPU-visible accesses ──────────────────────────────────

    pub fn read_byte(&mut self, addr: u16) -> u8 {
        if (0xFC00..=0xFEFF).contains(&addr) {
            self.mmio_read(addr)
        } else {
            self.mem.read(addr)
        }
    }

    /// Returns true when guest memory actually changed (the caller owes
    /// the code cache an invalidation).
    pub fn write_byte(&mut self, addr: u16, val: u8) -> bool {
        match addr {
            0x0000..=0x7FFF => {
                self.mem.write(addr, val);
                true
            }
            0xFC00..=0xFEFF => {
                self.mmio_write(addr, val);
                false
            }
            SIDEWAYS_START..=SIDEWAYS_END => {
                if self.sideways_ram[self.romsel as usize] {
                    self.mem.write(addr, val);
                    true
                } else {
                    false
                }
            }
            _ => false, // OS ROM
        }
    }

    fn mmio_read(&mut self, addr: u16) -> u8 {
        let val = match addr {
            SYS_VIA_START..=SYS_VIA_END => {
                let v = self
                    .via_sys
                    .read((addr & 0x0F) as u8, &mut self.timing, &self.keyboard);
                self.sync_irq();
                v
            }
            USER_VIA_START..=USER_VIA_END => {
                let v = self
                    .via_usr
                    .read((addr & 0x0F) as u8, &mut self.timing, &self.keyboard);
                self.sync_irq();
                v
            }
            ROMSEL..=ROMSEL_END => self.romsel,
            _ => {
                trace!("unhandled MMIO read {addr:#06x}");
                0xFE
            }
        };
        val
    }

    fn mmio_write(&mut self, addr: u16, val: u8) {
        match addr {
            SYS_VIA_START..=SYS_VIA_END => {
                let strobe =
                    self.via_sys
                        .write((addr & 0x0F) as u8, val, &mut self.timing, &self.keyboard);
                if let Some(data) = strobe {
                    self.sound.sn_write(data);
                }
                self.sync_irq();
            }
            USER_VIA_START..=USER_VIA_END => {
                self.via_usr
                    .write((addr & 0x0F) as u8, val, &mut self.timing, &self.keyboard);
                self.sync_irq();
            }
            ROMSEL..=ROMSEL_END => self.select_rom(val),
            _ => trace!("unhandled MMIO write {addr:#06x} = {val:#04x}"),
        }
    }

    // ── Timer routing ─────────────────────────────────────────

    /// Advance the wheel and route underflows to their owners; every
    /// wheel movement in the system funnels through here so the firing
    /// order is the registration order.
    pub fn advance_and_dispatch(&mut self, n: Tick) {
        let fired = self.timing.advance(n);
        for id in fired {
            self.dispatch_timer(id);
        }
        if !self.timing.advance(0).is_empty() {
            // A handler left a due firing timer behind; that's an
            // arming bug in a peripheral.
            panic!("timer still due after dispatch");
        }
        self.sync_irq();
    }

    fn dispatch_timer(&mut self, id: TimerId) {
        if id == self.via_sys.t1_timer() {
            self.via_sys.t1_fired(&mut self.timing);
        } else if id == self.via_sys.t2_timer() {
            self.via_sys.t2_fired(&mut self.timing);
        } else if id == self.via_usr.t1_timer() {
            self.via_usr.t1_fired(&mut self.timing);
        } else if id == self.via_usr.t2_timer() {
            self.via_usr.t2_fired(&mut self.timing);
        } else if id == self.video.timer() {
            self.vsync_fired();
        } else {
            warn!("unrouted timer {id:?}");
        }
    }

    fn vsync_fired(&mut self) {
        let (full_render, framing_changed) = self.video.vsync_fired(&mut self.timing);
        // Vsync is wired to the system VIA's CA1.
        self.via_sys.raise_interrupt(INT_CA1);
        self.keyboard.tick(self.timing.total_ticks());

        if let Some(tx) = &self.to_ui {
            // The UI may drop repeated vsyncs; never block on it here.
            let _ = tx.try_send(Message::vsync(full_render, framing_changed));
            if self.vsync_wait_for_render {
                if let Some(rx) = &self.from_ui {
                    loop {
                        match rx.recv() {
                            Ok(m) if m.kind() == MSG_RENDER_DONE => break,
                            Ok(_) => continue,
                            Err(_) => {
                                self.stop.store(true, Ordering::Relaxed);
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    fn sync_irq(&mut self) {
        self.state
            .set_irq_level(IrqSource::SystemVia, self.via_sys.irq_asserted());
        self.state
            .set_irq_level(IrqSource::UserVia, self.via_usr.irq_asserted());
    }
}

// ── Machine ───────────────────────────────────────────────────

pub struct Machine {
    pub bus: Bus,
    pub cpu: JitCpu,
    stop_ticks: Option<u64>,
    exit_value: Arc<AtomicU32>,
    discs: Vec<PathBuf>,
    tapes: Vec<PathBuf>,
}

impl Machine {
    /// Mode validation happened at configuration time; all that can
    /// fail here is the host mappings.
    pub fn new(config: &Config) -> Result<Self, LoadError> {
        debug_assert_eq!(config.mode, CpuMode::Jit);
        let bus = Bus::new()?;
        let cpu = JitCpu::new(config.accurate).map_err(LoadError::Mmap)?;
        Ok(Self {
            bus,
            cpu,
            stop_ticks: config.stop_cycles,
            exit_value: Arc::new(AtomicU32::new(0)),
            discs: Vec::new(),
            tapes: Vec::new(),
        })
    }

    // ── External collaborator handles ─────────────────────────

    pub fn add_disc(&mut self, path: &Path) {
        // Image decoding lives in the disc subsystem; the core only
        // tracks what is inserted.
        info!("disc inserted: {}", path.display());
        self.discs.push(path.to_path_buf());
    }

    pub fn add_tape(&mut self, path: &Path) {
        info!("tape inserted: {}", path.display());
        self.tapes.push(path.to_path_buf());
    }

    pub fn discs(&self) -> &[PathBuf] {
        &self.discs
    }

    pub fn tapes(&self) -> &[PathBuf] {
        &self.tapes
    }

    pub fn set_sound(&mut self, sound: Box<dyn SoundChip>) {
        self.bus.sound = sound;
    }

    pub fn keyboard_handle(&self) -> KeyboardHandle {
        self.bus.keyboard.handle()
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.bus.stop_flag()
    }

    pub fn exit_value_handle(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.exit_value)
    }

    pub fn set_pc(&mut self, pc: u16) {
        self.bus.state.pc = pc;
    }

    pub fn set_stop_cycles(&mut self, cycles: u64) {
        self.stop_ticks = Some(cycles);
    }

    // ── Reset and run ─────────────────────────────────────────

    pub fn reset(&mut self) {
        self.bus.reset_rom_selection();
        self.apply_pending_invalidate();
        self.cpu.reset(&mut self.bus);
    }

    fn apply_pending_invalidate(&mut self) {
        if let Some((start, end)) = self.bus.take_pending_invalidate() {
            self.cpu.cache.invalidate_range(start, end);
        }
    }

    pub fn run(&mut self) -> Result<RunExit, EmuError> {
        debug!(
            "running from pc {:#06x}, stop at {:?} ticks",
            self.bus.state.pc, self.stop_ticks
        );
        self.apply_pending_invalidate();
        let exit = self.cpu.run(&mut self.bus, self.stop_ticks)?;
        self.bus.keyboard.finish();
        Ok(exit)
    }

    /// Final result for batch/test mode: an explicit exit value if one
    /// was set (e.g. window closed), else the accumulator.
    pub fn run_result(&self) -> u32 {
        match self.exit_value.load(Ordering::Relaxed) {
            0 => self.bus.state.a as u32,
            v => v,
        }
    }

    /// Spawn the emulation thread.  The returned handle carries the UI
    /// side of both channels plus the lock-free keyboard writer.
    pub fn run_async(mut self) -> MachineHandle {
        let (to_ui, ui_rx) = bounded::<Message>(32);
        let (ui_tx, from_ui) = bounded::<Message>(4);
        self.bus.set_channels(to_ui.clone(), from_ui);

        let keyboard = self.keyboard_handle();
        let stop = self.stop_flag();
        let exit_value = self.exit_value_handle();

        let thread = thread::spawn(move || {
            let result = self.run();
            match &result {
                Ok(exit) => info!("emulation thread finished: {exit:?}"),
                Err(e) => warn!("emulation thread aborted: {e}"),
            }
            let _ = to_ui.send(Message::exited());
            result.map(|_| self.run_result())
        });

        MachineHandle {
            thread,
            messages: ui_rx,
            render_done: ui_tx,
            keyboard,
            stop,
            exit_value,
        }
    }
}

/// UI-thread side of a running machine.
pub struct MachineHandle {
    pub thread: thread::JoinHandle<Result<u32, EmuError>>,
    pub messages: Receiver<Message>,
    pub render_done: Sender<Message>,
    pub keyboard: KeyboardHandle,
    pub stop: Arc<AtomicBool>,
    pub exit_value: Arc<AtomicU32>,
}

impl MachineHandle {
    /// Window-closed path: set the exit value and let the emulation
    /// thread observe the flag at its next dispatcher exit.
    pub fn request_exit(&self, value: u32) {
        self.exit_value.store(value, Ordering::Relaxed);
        self.stop.store(true, Ordering::Relaxed);
    }
}
