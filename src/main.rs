//! Command-line front end: headless runner for the emulation core.
//!
//! Loads ROMs and media, spins up the emulation thread, then sits on
//! the message channel the way a windowed front end would — except the
//! render step is a no-op.  Batch mode compares the run result against
//! `--expect` and turns mismatches into a nonzero exit code.

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use log::{info, warn};

use proton::bbc_emu::roms;
use proton::errors::EmuError;
use proton::messages::{MSG_EXITED, MSG_VSYNC};
use proton::{Config, Machine, Options};

fn main() -> ExitCode {
    env_logger::init();
    let opts = Options::parse();
    match run(&opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("proton: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(opts: &Options) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_options(opts)?;

    let mut machine = Machine::new(&config)?;

    let os = roms::load_os_rom(&opts.os)?;
    machine.bus.load_os_rom(&os);

    for pair in opts.rom.chunks(2) {
        let bank = roms::parse_bank(&pair[0])?;
        let image = roms::load_bank_rom(Path::new(&pair[1]))?;
        machine.bus.load_rom_bank(bank, image);
    }
    for bank in &opts.swram {
        machine.bus.make_sideways_ram(roms::parse_bank(bank)?);
    }
    for disc in &opts.disc {
        machine.add_disc(disc);
    }
    for tape in &opts.tape {
        machine.add_tape(tape);
    }

    if let Some(path) = &opts.capture {
        machine.bus.keyboard.set_capture_file(path);
    }
    if let Some(path) = &opts.replay {
        machine.bus.keyboard.load_replay_file(path)?;
    }
    if config.terminal {
        warn!("--terminal needs the serial collaborator; ignoring");
    }
    if config.fasttape {
        warn!("--fasttape needs the tape collaborator; ignoring");
    }

    machine.reset();
    if let Some(pc) = config.pc {
        machine.set_pc(pc);
    }

    let handle = machine.run_async();

    // The UI loop, minus the UI: consume vsyncs (a windowed front end
    // would render here), stop on EXITED.
    let mut frames: u64 = 0;
    while let Ok(msg) = handle.messages.recv() {
        match msg.kind() {
            MSG_VSYNC => frames += 1,
            MSG_EXITED => break,
            other => warn!("unexpected message kind {other}"),
        }
    }

    let result = handle
        .thread
        .join()
        .map_err(|_| "emulation thread panicked")??;
    info!("run finished: result {result:#010x} after {frames} frames");

    if let Some(want) = config.expect {
        if result != want {
            return Err(Box::new(EmuError::UnexpectedResult { got: result, want }));
        }
    }
    Ok(())
}
