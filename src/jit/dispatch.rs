//! The dispatcher: owns the host register convention, enters translated
//! code, and arbitrates between execution and the timing wheel.
//!
//! The trampolines are assembled at startup with the same encoder the
//! translator uses, into the cache's thunk area, and entered through a
//! function-pointer transmute.  Exit thunks derive the guest PC from the
//! host return address (`(ret - slot_base) >> SLOT_SHIFT`) so slot code
//! never has to carry its own PC.
//!
//! Helper calls out of translated code (MMIO and high-memory stores)
//! first sync the timing wheel by the cycles consumed so far, so a timer
//! read always observes wall-clock-correct peripheral state, and stretch
//! to an even tick the way the CPU stalls for the 1 MHz bus.

use std::io;

use log::{debug, trace};

use crate::bbc_emu::machine::Bus;
use crate::bbc_emu::state6502::{
    State6502, FLAG_B, FLAG_D, FLAG_I, VECTOR_IRQ, VECTOR_NMI, VECTOR_RESET,
};
use crate::errors::EmuError;

use super::asm::{Asm, Reg8, CC_E, CC_NE};
use super::cache::CodeCache;
use super::translate::{Translator, MMIO_END, MMIO_START};
use super::{SLOT_SHIFT, SLOT_TRAP};

// ── Context layout (shared with emitted code) ─────────────────

pub const OFF_EXIT: u8 = 0;
pub const OFF_RETRANSLATE: u8 = 8;
pub const OFF_READ_FN: u8 = 16;
pub const OFF_WRITE_FN: u8 = 24;
pub const OFF_HOST_RSP: u8 = 32;
pub const OFF_COUNTDOWN: u8 = 40;
pub const OFF_MEM_BASE: u8 = 48;
pub const OFF_JIT_PTRS: u8 = 56;
pub const OFF_SLOT_BASE: u8 = 64;
pub const OFF_REASON: u8 = 72;
pub const OFF_RESUME_PC: u8 = 76;
pub const OFF_TRAP_OPCODE: u8 = 80;
pub const OFF_IRQ_PENDING: u8 = 84;
pub const OFF_A: u8 = 88;
pub const OFF_CARRY: u8 = 89;
pub const OFF_X: u8 = 90;
pub const OFF_Y: u8 = 91;
pub const OFF_Z: u8 = 92;
pub const OFF_N: u8 = 93;
pub const OFF_S: u8 = 94;
pub const OFF_P_REST: u8 = 95;

/// Exit reasons, as left in `reason` by the exit thunks.
pub const REASON_COUNTDOWN: u32 = 1;
pub const REASON_TRANSLATE: u32 = 2;
pub const REASON_TRAP: u32 = 3;
pub const REASON_BRK: u32 = 4;
pub const REASON_IRQ: u32 = 5;

/// Shared state between the dispatcher and translated code.  Field
/// order is load-bearing: emitted code addresses everything below with
/// r14-relative disp8 at the offsets above.
#[repr(C)]
pub struct JitContext {
    pub exit_thunk: u64,
    pub retranslate_thunk: u64,
    pub read_fn: u64,
    pub write_fn: u64,
    pub host_rsp: u64,
    pub countdown: i64,
    pub mem_base: u64,
    pub jit_ptrs: u64,
    pub slot_base: u64,
    pub reason: u32,
    pub resume_pc: u32,
    pub trap_opcode: u32,
    pub irq_pending: u32,
    pub a: u8,
    pub carry: u8,
    pub x: u8,
    pub y: u8,
    pub z: u8,
    pub n: u8,
    pub s: u8,
    pub p_rest: u8,

    // Rust-side only from here down.
    pub bus: *mut Bus,
    pub synced_countdown: i64,
}

// `bus` is only ever set for the duration of `JitCpu::run`, called by
// whichever thread currently owns the enclosing `Machine`; it is never
// accessed concurrently from more than one thread at a time.
unsafe impl Send for JitContext {}

/// Addresses of the shared thunks the translator plants calls to.
#[derive(Debug, Clone, Copy)]
pub struct Thunks {
    pub countdown: u64,
    pub irq_check: u64,
    pub trap: u64,
    pub bcd: u64,
    pub brk: u64,
    pub read_mem: u64,
    pub write_mem: u64,
}

type EnterFn = unsafe extern "C" fn(*mut JitContext, u64) -> u32;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// The stop flag was observed at a dispatcher exit.
    Stopped,
    /// The configured cycle budget ran out.
    CycleLimit,
}

/// External peer that can execute single instructions when the JIT
/// traps (decimal mode, undocumented opcodes).  The reference
/// interpreter is a separate collaborator; none ships here.
pub trait InterpreterFallback: Send {
    /// Execute one instruction at `bus.state.pc`; returns consumed
    /// 2 MHz ticks.
    fn step(&mut self, bus: &mut Bus) -> u32;
}

// ── Helper functions called from translated code ──────────────

/// Catch the wheel up to the cycles translated code has consumed since
/// the last sync, and stall to an even tick for the 1 MHz bus.
unsafe fn sync_time(ctx: &mut JitContext, stretch: bool) {
    let bus = &mut *ctx.bus;
    let consumed = ctx.synced_countdown - ctx.countdown;
    debug_assert!(consumed >= 0);
    bus.advance_and_dispatch(consumed);
    ctx.synced_countdown = ctx.countdown;
    if stretch && bus.timing.total_ticks() & 1 == 1 {
        bus.advance_and_dispatch(1);
        ctx.countdown -= 1;
        ctx.synced_countdown -= 1;
    }
}

fn is_mmio(addr: u16) -> bool {
    (MMIO_START..=MMIO_END).contains(&addr)
}

/// A register access may have re-armed a timer to fire sooner than the
/// countdown the dispatcher handed out; shrink the live countdown so
/// the new deadline still preempts.  The helper thunk reloads r15 from
/// the context after the call, so the clamp takes effect immediately.
unsafe fn clamp_countdown(ctx: &mut JitContext) {
    let bus = &mut *ctx.bus;
    let deadline = bus.timing.next_deadline();
    if deadline < ctx.countdown {
        ctx.countdown = deadline;
        ctx.synced_countdown = deadline;
    }
}

extern "C" fn jit_read_mem(ctx: *mut JitContext, addr: u32) -> u8 {
    let addr = addr as u16;
    unsafe {
        let ctx = &mut *ctx;
        sync_time(ctx, is_mmio(addr));
        let bus = &mut *ctx.bus;
        let val = bus.read_byte(addr);
        ctx.irq_pending = bus.state.irq_asserted() as u32;
        clamp_countdown(ctx);
        val
    }
}

extern "C" fn jit_write_mem(ctx: *mut JitContext, addr: u32, val: u32) {
    let addr = addr as u16;
    unsafe {
        let ctx = &mut *ctx;
        sync_time(ctx, is_mmio(addr));
        let bus = &mut *ctx.bus;
        if bus.write_byte(addr, val as u8) {
            // Guest memory changed under a possible translation.
            let entry = *(ctx.jit_ptrs as *const u64).add(addr as usize);
            std::ptr::copy_nonoverlapping(SLOT_TRAP.as_ptr(), entry as *mut u8, SLOT_TRAP.len());
        }
        if let Some((start, end)) = bus.take_pending_invalidate() {
            // A bank switch rewrote the whole sideways window.  Only the
            // heads of the affected slots need trapping; the code that
            // is executing right now is already past its own head.
            for a in start..=end {
                let slot = ctx.slot_base + ((a as u64) << SLOT_SHIFT);
                std::ptr::copy_nonoverlapping(SLOT_TRAP.as_ptr(), slot as *mut u8, SLOT_TRAP.len());
                *(ctx.jit_ptrs as *mut u64).add(a as usize) = slot;
            }
        }
        ctx.irq_pending = bus.state.irq_asserted() as u32;
        clamp_countdown(ctx);
    }
}

// ── The CPU driver ────────────────────────────────────────────

pub struct JitCpu {
    pub cache: CodeCache,
    translator: Translator,
    ctx: Box<JitContext>,
    enter: EnterFn,
    pub fallback: Option<Box<dyn InterpreterFallback>>,
}

impl JitCpu {
    pub fn new(accurate: bool) -> io::Result<Self> {
        let mut cache = CodeCache::new()?;

        let exit_thunk = Self::build_exit_thunk(&mut cache);
        let retranslate = Self::build_pc_exit_thunk(&mut cache, REASON_TRANSLATE, None);
        let thunks = Thunks {
            countdown: Self::build_pc_exit_thunk(&mut cache, REASON_COUNTDOWN, None),
            // Exit for a pending IRQ, unless the I flag masks it.
            irq_check: Self::build_pc_exit_thunk(&mut cache, REASON_IRQ, Some((FLAG_I, false))),
            trap: Self::build_pc_exit_thunk(&mut cache, REASON_TRAP, None),
            // ADC/SBC call this unconditionally; it only traps with the
            // decimal flag set.
            bcd: Self::build_pc_exit_thunk(&mut cache, REASON_TRAP, Some((FLAG_D, true))),
            brk: Self::build_pc_exit_thunk(&mut cache, REASON_BRK, None),
            read_mem: Self::build_helper_thunk(&mut cache, OFF_READ_FN, false),
            write_mem: Self::build_helper_thunk(&mut cache, OFF_WRITE_FN, true),
        };
        let enter_addr = Self::build_enter_thunk(&mut cache);

        let ctx = Box::new(JitContext {
            exit_thunk,
            retranslate_thunk: retranslate,
            read_fn: jit_read_mem as usize as u64,
            write_fn: jit_write_mem as usize as u64,
            host_rsp: 0,
            countdown: 0,
            mem_base: 0,
            jit_ptrs: cache.ptrs_base(),
            slot_base: cache.slot_base(),
            reason: 0,
            resume_pc: 0,
            trap_opcode: 0,
            irq_pending: 0,
            a: 0,
            carry: 0,
            x: 0,
            y: 0,
            z: 0,
            n: 0,
            s: 0,
            p_rest: 0,
            bus: std::ptr::null_mut(),
            synced_countdown: 0,
        });

        debug!("jit thunks assembled, accurate={accurate}");
        Ok(Self {
            cache,
            translator: Translator::new(accurate, thunks),
            ctx,
            enter: unsafe { std::mem::transmute::<*const u8, EnterFn>(enter_addr as *const u8) },
            fallback: None,
        })
    }

    // ── Thunk assembly ────────────────────────────────────────

    /// Save the split state back into the context, restore the host
    /// stack and callee-saved registers, return the exit reason.
    fn build_exit_thunk(cache: &mut CodeCache) -> u64 {
        let mut asm = Asm::new(cache.next_thunk_addr());
        asm.mov_ctx_r(OFF_A, Reg8::Al);
        asm.mov_r_r(Reg8::Cl, Reg8::Ah);
        asm.mov_ctx_r(OFF_CARRY, Reg8::Cl);
        asm.mov_ctx_r(OFF_X, Reg8::Bl);
        asm.mov_r_r(Reg8::Cl, Reg8::Bh);
        asm.mov_ctx_r(OFF_Y, Reg8::Cl);
        asm.mov_ctx_r(OFF_Z, Reg8::Dl);
        asm.mov_r_r(Reg8::Cl, Reg8::Dh);
        asm.mov_ctx_r(OFF_N, Reg8::Cl);
        asm.mov_ctx_sil(OFF_S);
        asm.mov_ctx_r8b(OFF_P_REST);
        asm.mov_ctx_r15(OFF_COUNTDOWN);
        asm.mov_rsp_ctx(OFF_HOST_RSP);
        asm.mov_eax_ctx(OFF_REASON);
        asm.pop_r15();
        asm.pop_r14();
        asm.pop_r13();
        asm.pop_r12();
        asm.pop_rbp();
        asm.pop_rbx();
        asm.ret();
        cache.commit_thunk(&asm)
    }

    /// The `extern "C" fn(ctx, entry) -> reason` entry trampoline.
    fn build_enter_thunk(cache: &mut CodeCache) -> u64 {
        let mut asm = Asm::new(cache.next_thunk_addr());
        asm.push_rbx();
        asm.push_rbp();
        asm.push_r12();
        asm.push_r13();
        asm.push_r14();
        asm.push_r15();
        asm.mov_rdi_off_rsp(OFF_HOST_RSP);
        asm.mov_r10_rsi();
        asm.mov_r14_rdi();
        asm.movzx_eax_ctx(OFF_A);
        asm.mov_r_ctx(Reg8::Cl, OFF_CARRY);
        asm.mov_r_r(Reg8::Ah, Reg8::Cl);
        asm.mov_r_ctx(Reg8::Bl, OFF_X);
        asm.mov_r_ctx(Reg8::Cl, OFF_Y);
        asm.mov_r_r(Reg8::Bh, Reg8::Cl);
        asm.mov_r_ctx(Reg8::Dl, OFF_Z);
        asm.mov_r_ctx(Reg8::Cl, OFF_N);
        asm.mov_r_r(Reg8::Dh, Reg8::Cl);
        // S rides in sil with the stack-page 0x01 pinned above it.
        asm.mov_esi_imm(0x0100);
        asm.mov_sil_ctx(OFF_S);
        asm.mov_r8b_ctx(OFF_P_REST);
        asm.mov_rbp_ctx(OFF_MEM_BASE);
        asm.mov_r12_ctx(OFF_JIT_PTRS);
        asm.mov_r13_ctx(OFF_SLOT_BASE);
        asm.mov_r15_ctx(OFF_COUNTDOWN);
        asm.jmp_r10();
        cache.commit_thunk(&asm)
    }

    /// An exit thunk entered by `call`: derives the guest PC from the
    /// return address, records it with `reason`, and leaves.  `gate`
    /// makes the exit conditional on a P-remainder bit: the thunk
    /// returns straight to the slot unless the masked test matches
    /// `take_when_set`.
    fn build_pc_exit_thunk(cache: &mut CodeCache, reason: u32, gate: Option<(u8, bool)>) -> u64 {
        let mut asm = Asm::new(cache.next_thunk_addr());
        if let Some((mask, take_when_set)) = gate {
            asm.test_r8b_imm(mask);
            let take = asm.label();
            asm.jcc(if take_when_set { CC_NE } else { CC_E }, take);
            asm.ret();
            asm.bind(take);
        }
        asm.pop_r9();
        asm.sub_r9_r13();
        asm.shr_r9_imm(SLOT_SHIFT as u8);
        asm.mov_ctx_r9d(OFF_RESUME_PC);
        asm.mov_ctx_imm32(OFF_REASON, reason);
        asm.jmp_ctx(OFF_EXIT);
        cache.commit_thunk(&asm)
    }

    /// Shim between slot code and the Rust bus helpers: preserves the
    /// pinned caller-saved registers, syncs the countdown register
    /// through the context, makes the SysV call.  Read results come
    /// back in cl.
    fn build_helper_thunk(cache: &mut CodeCache, fn_off: u8, is_write: bool) -> u64 {
        let mut asm = Asm::new(cache.next_thunk_addr());
        asm.push_rax();
        asm.push_rdx();
        asm.push_rsi();
        asm.push_r8();
        asm.push_r9();
        asm.mov_ctx_r15(OFF_COUNTDOWN);
        asm.sub_rsp_8();
        if is_write {
            asm.movzx_edx_cl();
        }
        asm.mov_rdi_r14();
        asm.movzx_esi_r9w();
        asm.call_ctx(fn_off);
        asm.add_rsp_8();
        asm.mov_r15_ctx(OFF_COUNTDOWN);
        if !is_write {
            asm.mov_r_r(Reg8::Cl, Reg8::Al);
        }
        asm.pop_r9();
        asm.pop_r8();
        asm.pop_rsi();
        asm.pop_rdx();
        asm.pop_rax();
        asm.ret();
        cache.commit_thunk(&asm)
    }

    // ── State shuffling ───────────────────────────────────────

    fn sync_in(&mut self, state: &State6502) {
        let ctx = &mut self.ctx;
        ctx.a = state.a;
        ctx.x = state.x;
        ctx.y = state.y;
        ctx.s = state.s;
        ctx.carry = state.p & 0x01;
        ctx.z = (state.p >> 1) & 0x01;
        ctx.n = (state.p >> 7) & 0x01;
        ctx.p_rest = (state.p & 0x4C) | 0x20;
    }

    fn sync_out(&self, state: &mut State6502) {
        let ctx = &self.ctx;
        state.a = ctx.a;
        state.x = ctx.x;
        state.y = ctx.y;
        state.s = ctx.s;
        state.p = (ctx.p_rest & 0x4C)
            | 0x20
            | (ctx.carry & 1)
            | ((ctx.z & 1) << 1)
            | ((ctx.n & 1) << 7);
        state.pc = ctx.resume_pc as u16;
    }

    // ── Interrupt delivery ────────────────────────────────────

    /// Push PC and P, set I, load the vector.  Interrupt sequencing is
    /// a dispatcher job, never a translated-code job.
    fn deliver_interrupt(&mut self, bus: &mut Bus, vector: u16, is_brk: bool) {
        let ret = if is_brk {
            bus.state.pc.wrapping_add(2)
        } else {
            bus.state.pc
        };
        let push = |bus: &mut Bus, cache: &mut CodeCache, s: &mut u8, v: u8| {
            let addr = 0x0100 | *s as u16;
            bus.mem.write(addr, v);
            cache.invalidate_byte(addr);
            *s = s.wrapping_sub(1);
        };
        let mut s = bus.state.s;
        push(bus, &mut self.cache, &mut s, (ret >> 8) as u8);
        push(bus, &mut self.cache, &mut s, ret as u8);
        let p = (bus.state.p & !FLAG_B) | 0x20 | if is_brk { FLAG_B } else { 0 };
        push(bus, &mut self.cache, &mut s, p);
        bus.state.s = s;
        bus.state.p |= FLAG_I;
        bus.state.pc = bus.mem.read_u16(vector);
        // The 6502 interrupt sequence is seven cycles.
        bus.advance_and_dispatch(7);
        trace!("interrupt taken to {:#06x} (brk={is_brk})", bus.state.pc);
    }

    /// Cold-start entry: documented register state, PC from the reset
    /// vector.
    pub fn reset(&mut self, bus: &mut Bus) {
        bus.state.reset();
        bus.state.pc = bus.mem.read_u16(VECTOR_RESET);
        debug!("reset vector -> {:#06x}", bus.state.pc);
    }

    // ── Main loop ─────────────────────────────────────────────

    pub fn run(&mut self, bus: &mut Bus, stop_ticks: Option<u64>) -> Result<RunExit, EmuError> {
        assert!(
            cfg!(target_arch = "x86_64"),
            "translated execution requires an x86-64 host"
        );
        self.ctx.bus = bus as *mut Bus;
        self.ctx.mem_base = bus.mem.base_ptr() as u64;

        let exit = loop {
            if bus.stop_requested() {
                break RunExit::Stopped;
            }
            if let Some(limit) = stop_ticks {
                if bus.timing.total_ticks() >= limit {
                    break RunExit::CycleLimit;
                }
            }

            // Fire everything due before running ahead.
            let mut deadline = bus.timing.next_deadline();
            while deadline == 0 {
                bus.advance_and_dispatch(0);
                deadline = bus.timing.next_deadline();
            }

            if bus.state.take_nmi_edge() {
                self.deliver_interrupt(bus, VECTOR_NMI, false);
                continue;
            }
            if bus.state.irq_asserted() && bus.state.p & FLAG_I == 0 {
                self.deliver_interrupt(bus, VECTOR_IRQ, false);
                continue;
            }

            if let Some(limit) = stop_ticks {
                let remaining = limit.saturating_sub(bus.timing.total_ticks()) as i64;
                deadline = deadline.min(remaining.max(1));
            }

            let pc = bus.state.pc;
            if self.cache.is_trapped(pc) {
                self.translator
                    .translate_block(&mut self.cache, bus.mem.as_slice(), pc);
            }

            self.sync_in(&bus.state);
            self.ctx.countdown = deadline;
            self.ctx.synced_countdown = deadline;
            self.ctx.irq_pending = bus.state.irq_asserted() as u32;

            let reason = unsafe { (self.enter)(self.ctx.as_mut() as *mut JitContext, self.cache.slot_addr(pc)) };

            self.sync_out(&mut bus.state);
            let consumed = self.ctx.synced_countdown - self.ctx.countdown;
            bus.advance_and_dispatch(consumed);

            match reason {
                REASON_COUNTDOWN | REASON_IRQ => {
                    // Delivery happens at the top of the loop.
                }
                REASON_TRANSLATE => {
                    self.translator.translate_block(
                        &mut self.cache,
                        bus.mem.as_slice(),
                        bus.state.pc,
                    );
                }
                REASON_BRK => {
                    self.deliver_interrupt(bus, VECTOR_IRQ, true);
                }
                REASON_TRAP => {
                    let opcode = self.ctx.trap_opcode as u8;
                    let pc = bus.state.pc;
                    if let Some(fallback) = self.fallback.as_mut() {
                        let ticks = fallback.step(bus);
                        bus.advance_and_dispatch(ticks as i64);
                    } else {
                        return Err(EmuError::Unimplemented { opcode, pc });
                    }
                }
                _ => {
                    // No thunk leaves any other reason: control ran
                    // through a slot whose contents are not a
                    // translation.
                    return Err(EmuError::InvalidTranslation { pc: bus.state.pc });
                }
            }
        };

        self.ctx.bus = std::ptr::null_mut();
        Ok(exit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    /// Emitted code addresses the context by these offsets; the struct
    /// must not drift.
    #[test]
    fn context_layout_matches_emitted_offsets() {
        assert_eq!(offset_of!(JitContext, exit_thunk), OFF_EXIT as usize);
        assert_eq!(offset_of!(JitContext, retranslate_thunk), OFF_RETRANSLATE as usize);
        assert_eq!(offset_of!(JitContext, read_fn), OFF_READ_FN as usize);
        assert_eq!(offset_of!(JitContext, write_fn), OFF_WRITE_FN as usize);
        assert_eq!(offset_of!(JitContext, host_rsp), OFF_HOST_RSP as usize);
        assert_eq!(offset_of!(JitContext, countdown), OFF_COUNTDOWN as usize);
        assert_eq!(offset_of!(JitContext, mem_base), OFF_MEM_BASE as usize);
        assert_eq!(offset_of!(JitContext, jit_ptrs), OFF_JIT_PTRS as usize);
        assert_eq!(offset_of!(JitContext, slot_base), OFF_SLOT_BASE as usize);
        assert_eq!(offset_of!(JitContext, reason), OFF_REASON as usize);
        assert_eq!(offset_of!(JitContext, resume_pc), OFF_RESUME_PC as usize);
        assert_eq!(offset_of!(JitContext, trap_opcode), OFF_TRAP_OPCODE as usize);
        assert_eq!(offset_of!(JitContext, irq_pending), OFF_IRQ_PENDING as usize);
        assert_eq!(offset_of!(JitContext, a), OFF_A as usize);
        assert_eq!(offset_of!(JitContext, p_rest), OFF_P_REST as usize);
    }

    #[test]
    fn trap_pattern_is_the_retranslate_call() {
        // call [r14 + OFF_RETRANSLATE]
        assert_eq!(SLOT_TRAP, [0x41, 0xFF, 0x56, OFF_RETRANSLATE]);
    }
}
