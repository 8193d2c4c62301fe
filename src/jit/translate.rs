//! Per-opcode translation of 6502 instructions into slot code.
//!
//! Every documented opcode/addressing-mode pair has an emitter, built
//! from two halves: a mode prologue that leaves the effective address in
//! r9d (or resolves it at translation time), and an operation body.
//! Flag state is kept normalized — Z and N are 0/1 bytes recomputed with
//! `test; sete; sets`, carry is a 0/1 byte captured with `setb`/`setae`
//! — so no host EFLAGS survive between guest instructions.
//!
//! Stores additionally plant the slot trap over the owning slot of the
//! written byte, through the pointer table pinned in r12; that is the
//! whole of the self-modifying-code story, and it works even when a
//! store rewrites the very next instruction, because the fall-through
//! lands on the freshly trapped slot.

use super::asm::{Alu, Asm, Reg8, Shift, CC_AE, CC_B, CC_E, CC_G, CC_NE, CC_O, CC_S};
use super::cache::CodeCache;
use super::dispatch::{Thunks, OFF_IRQ_PENDING, OFF_TRAP_OPCODE};
use super::{SLOT_SHIFT, SLOT_TRAP_IMM};

pub const MMIO_START: u16 = 0xFC00;
pub const MMIO_END: u16 = 0xFEFF;

/// Most instructions a basic block may span.
const MAX_BLOCK: usize = 48;

const FLAG_I: u8 = 0x04;
const FLAG_D: u8 = 0x08;

// ── Instruction set tables ────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Imp,
    Acc,
    Imm,
    Zp,
    Zpx,
    Zpy,
    Abs,
    Abx,
    Aby,
    Idx,
    Idy,
    Ind,
    Rel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[rustfmt::skip]
pub enum Op {
    Adc, And, Asl, Bcc, Bcs, Beq, Bit, Bmi, Bne, Bpl, Brk, Bvc, Bvs,
    Clc, Cld, Cli, Clv, Cmp, Cpx, Cpy, Dec, Dex, Dey, Eor, Inc, Inx,
    Iny, Jmp, Jsr, Lda, Ldx, Ldy, Lsr, Nop, Ora, Pha, Php, Pla, Plp,
    Rol, Ror, Rti, Rts, Sbc, Sec, Sed, Sei, Sta, Stx, Sty, Tax, Tay,
    Tsx, Txa, Txs, Tya,
}

pub fn insn_len(mode: Mode) -> u16 {
    match mode {
        Mode::Imp | Mode::Acc => 1,
        Mode::Imm | Mode::Zp | Mode::Zpx | Mode::Zpy | Mode::Idx | Mode::Idy | Mode::Rel => 2,
        Mode::Abs | Mode::Abx | Mode::Aby | Mode::Ind => 3,
    }
}

/// No fall-through after these.
pub fn ends_block(op: Op) -> bool {
    matches!(op, Op::Jmp | Op::Jsr | Op::Rts | Op::Rti | Op::Brk)
}

/// The documented instruction set: (operation, mode, base cycles).
#[rustfmt::skip]
pub fn decode(opcode: u8) -> Option<(Op, Mode, u8)> {
    use Mode::*;
    use Op::*;
    Some(match opcode {
        0x00 => (Brk, Imp, 7), 0x01 => (Ora, Idx, 6), 0x05 => (Ora, Zp, 3),
        0x06 => (Asl, Zp, 5),  0x08 => (Php, Imp, 3), 0x09 => (Ora, Imm, 2),
        0x0A => (Asl, Acc, 2), 0x0D => (Ora, Abs, 4), 0x0E => (Asl, Abs, 6),
        0x10 => (Bpl, Rel, 2), 0x11 => (Ora, Idy, 5), 0x15 => (Ora, Zpx, 4),
        0x16 => (Asl, Zpx, 6), 0x18 => (Clc, Imp, 2), 0x19 => (Ora, Aby, 4),
        0x1D => (Ora, Abx, 4), 0x1E => (Asl, Abx, 7),
        0x20 => (Jsr, Abs, 6), 0x21 => (And, Idx, 6), 0x24 => (Bit, Zp, 3),
        0x25 => (And, Zp, 3),  0x26 => (Rol, Zp, 5),  0x28 => (Plp, Imp, 4),
        0x29 => (And, Imm, 2), 0x2A => (Rol, Acc, 2), 0x2C => (Bit, Abs, 4),
        0x2D => (And, Abs, 4), 0x2E => (Rol, Abs, 6),
        0x30 => (Bmi, Rel, 2), 0x31 => (And, Idy, 5), 0x35 => (And, Zpx, 4),
        0x36 => (Rol, Zpx, 6), 0x38 => (Sec, Imp, 2), 0x39 => (And, Aby, 4),
        0x3D => (And, Abx, 4), 0x3E => (Rol, Abx, 7),
        0x40 => (Rti, Imp, 6), 0x41 => (Eor, Idx, 6), 0x45 => (Eor, Zp, 3),
        0x46 => (Lsr, Zp, 5),  0x48 => (Pha, Imp, 3), 0x49 => (Eor, Imm, 2),
        0x4A => (Lsr, Acc, 2), 0x4C => (Jmp, Abs, 3), 0x4D => (Eor, Abs, 4),
        0x4E => (Lsr, Abs, 6),
        0x50 => (Bvc, Rel, 2), 0x51 => (Eor, Idy, 5), 0x55 => (Eor, Zpx, 4),
        0x56 => (Lsr, Zpx, 6), 0x58 => (Cli, Imp, 2), 0x59 => (Eor, Aby, 4),
        0x5D => (Eor, Abx, 4), 0x5E => (Lsr, Abx, 7),
        0x60 => (Rts, Imp, 6), 0x61 => (Adc, Idx, 6), 0x65 => (Adc, Zp, 3),
        0x66 => (Ror, Zp, 5),  0x68 => (Pla, Imp, 4), 0x69 => (Adc, Imm, 2),
        0x6A => (Ror, Acc, 2), 0x6C => (Jmp, Ind, 5), 0x6D => (Adc, Abs, 4),
        0x6E => (Ror, Abs, 6),
        0x70 => (Bvs, Rel, 2), 0x71 => (Adc, Idy, 5), 0x75 => (Adc, Zpx, 4),
        0x76 => (Ror, Zpx, 6), 0x78 => (Sei, Imp, 2), 0x79 => (Adc, Aby, 4),
        0x7D => (Adc, Abx, 4), 0x7E => (Ror, Abx, 7),
        0x81 => (Sta, Idx, 6), 0x84 => (Sty, Zp, 3),  0x85 => (Sta, Zp, 3),
        0x86 => (Stx, Zp, 3),  0x88 => (Dey, Imp, 2), 0x8A => (Txa, Imp, 2),
        0x8C => (Sty, Abs, 4), 0x8D => (Sta, Abs, 4), 0x8E => (Stx, Abs, 4),
        0x90 => (Bcc, Rel, 2), 0x91 => (Sta, Idy, 6), 0x94 => (Sty, Zpx, 4),
        0x95 => (Sta, Zpx, 4), 0x96 => (Stx, Zpy, 4), 0x98 => (Tya, Imp, 2),
        0x99 => (Sta, Aby, 5), 0x9A => (Txs, Imp, 2), 0x9D => (Sta, Abx, 5),
        0xA0 => (Ldy, Imm, 2), 0xA1 => (Lda, Idx, 6), 0xA2 => (Ldx, Imm, 2),
        0xA4 => (Ldy, Zp, 3),  0xA5 => (Lda, Zp, 3),  0xA6 => (Ldx, Zp, 3),
        0xA8 => (Tay, Imp, 2), 0xA9 => (Lda, Imm, 2), 0xAA => (Tax, Imp, 2),
        0xAC => (Ldy, Abs, 4), 0xAD => (Lda, Abs, 4), 0xAE => (Ldx, Abs, 4),
        0xB0 => (Bcs, Rel, 2), 0xB1 => (Lda, Idy, 5), 0xB4 => (Ldy, Zpx, 4),
        0xB5 => (Lda, Zpx, 4), 0xB6 => (Ldx, Zpy, 4), 0xB8 => (Clv, Imp, 2),
        0xB9 => (Lda, Aby, 4), 0xBA => (Tsx, Imp, 2), 0xBC => (Ldy, Abx, 4),
        0xBD => (Lda, Abx, 4), 0xBE => (Ldx, Aby, 4),
        0xC0 => (Cpy, Imm, 2), 0xC1 => (Cmp, Idx, 6), 0xC4 => (Cpy, Zp, 3),
        0xC5 => (Cmp, Zp, 3),  0xC6 => (Dec, Zp, 5),  0xC8 => (Iny, Imp, 2),
        0xC9 => (Cmp, Imm, 2), 0xCA => (Dex, Imp, 2), 0xCC => (Cpy, Abs, 4),
        0xCD => (Cmp, Abs, 4), 0xCE => (Dec, Abs, 6),
        0xD0 => (Bne, Rel, 2), 0xD1 => (Cmp, Idy, 5), 0xD5 => (Cmp, Zpx, 4),
        0xD6 => (Dec, Zpx, 6), 0xD8 => (Cld, Imp, 2), 0xD9 => (Cmp, Aby, 4),
        0xDD => (Cmp, Abx, 4), 0xDE => (Dec, Abx, 7),
        0xE0 => (Cpx, Imm, 2), 0xE1 => (Sbc, Idx, 6), 0xE4 => (Cpx, Zp, 3),
        0xE5 => (Sbc, Zp, 3),  0xE6 => (Inc, Zp, 5),  0xE8 => (Inx, Imp, 2),
        0xE9 => (Sbc, Imm, 2), 0xEA => (Nop, Imp, 2), 0xEC => (Cpx, Abs, 4),
        0xED => (Sbc, Abs, 4), 0xEE => (Inc, Abs, 6),
        0xF0 => (Beq, Rel, 2), 0xF1 => (Sbc, Idy, 5), 0xF5 => (Sbc, Zpx, 4),
        0xF6 => (Inc, Zpx, 6), 0xF8 => (Sed, Imp, 2), 0xF9 => (Sbc, Aby, 4),
        0xFD => (Sbc, Abx, 4), 0xFE => (Inc, Abx, 7),
        _ => return None,
    })
}

fn is_mmio(addr: u16) -> bool {
    (MMIO_START..=MMIO_END).contains(&addr)
}

/// Where the operand ended up after the mode prologue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ea {
    /// Immediate operand byte.
    Imm(u8),
    /// Address known at translation time.
    Fixed(u16),
    /// Address computed into r9d; `checked` means it can reach ROM or
    /// the MMIO window and needs runtime routing.
    Dyn { checked: bool },
}

// ── Translator ────────────────────────────────────────────────

pub struct Translator {
    pub accurate: bool,
    thunks: Thunks,
}

impl Translator {
    pub fn new(accurate: bool, thunks: Thunks) -> Self {
        Self { accurate, thunks }
    }

    /// Translate the basic block starting at `start_pc` into its slots.
    /// `mem` is the full guest address space.
    pub fn translate_block(&self, cache: &mut CodeCache, mem: &[u8], start_pc: u16) {
        let mut pcs: Vec<u16> = Vec::new();
        let mut total_cycles: u32 = 0;
        let mut pc = start_pc;
        loop {
            pcs.push(pc);
            let Some((op, mode, cycles)) = decode(mem[pc as usize]) else {
                break;
            };
            total_cycles += cycles as u32;
            if ends_block(op) || pcs.len() >= MAX_BLOCK {
                break;
            }
            let next = pc.wrapping_add(insn_len(mode));
            if next < pc {
                break;
            }
            pc = next;
        }

        for (i, &insn_pc) in pcs.iter().enumerate() {
            self.translate_insn(cache, mem, insn_pc, i == 0, total_cycles as i32);
        }
    }

    /// Emit one instruction into its slot.  Returns the emitted length
    /// in host bytes.
    pub fn translate_insn(
        &self,
        cache: &mut CodeCache,
        mem: &[u8],
        pc: u16,
        block_head: bool,
        block_cycles: i32,
    ) -> usize {
        let opcode = mem[pc as usize];
        let op1 = mem[pc.wrapping_add(1) as usize];
        let op2 = mem[pc.wrapping_add(2) as usize];
        let mut asm = Asm::new(cache.slot_addr(pc));

        let decoded = decode(opcode);
        // Jumps and branches can re-enter mid-block, where no block
        // charge was paid; they always pay their own way so that every
        // cyclic path makes countdown progress.
        let control = decoded
            .map(|(op, mode, _)| ends_block(op) || mode == Mode::Rel)
            .unwrap_or(false);
        self.emit_countdown(
            &mut asm,
            decoded.map(|d| d.2).unwrap_or(0),
            block_head,
            block_cycles,
            control,
        );

        let Some((op, mode, _)) = decoded else {
            // Undocumented opcode: record it and trap out; the
            // dispatcher falls back to the interpreter hook or aborts.
            asm.mov_ctx_imm8(OFF_TRAP_OPCODE, opcode);
            asm.call_to(self.thunks.trap);
            cache.install(pc, 1, &asm);
            return asm.len();
        };

        let len = insn_len(mode);
        self.emit_body(&mut asm, cache, op, mode, opcode, op1, op2, pc);

        if !ends_block(op) {
            asm.jmp_to(cache.slot_addr(pc.wrapping_add(len)));
        }
        cache.install(pc, len, &asm);
        asm.len()
    }

    /// Countdown check (every slot), pending-IRQ check (accurate mode),
    /// and the cycle charge.
    fn emit_countdown(
        &self,
        asm: &mut Asm,
        cycles: u8,
        block_head: bool,
        block_cycles: i32,
        control: bool,
    ) {
        asm.test_r15_r15();
        let run = asm.label();
        asm.jcc(CC_G, run);
        asm.call_to(self.thunks.countdown);
        asm.bind(run);

        if self.accurate {
            asm.cmp_ctx_byte_zero(OFF_IRQ_PENDING);
            let no_irq = asm.label();
            asm.jcc(CC_E, no_irq);
            // The thunk itself tests the I flag and returns if masked.
            asm.call_to(self.thunks.irq_check);
            asm.bind(no_irq);
            asm.sub_r15_imm(cycles as i32);
        } else if block_head {
            asm.sub_r15_imm(block_cycles);
        } else if control {
            asm.sub_r15_imm(cycles as i32);
        }
    }

    // ── Mode prologues ────────────────────────────────────────

    /// Returns where the operand is, emitting address arithmetic for the
    /// dynamic modes.  `read_penalty` adds the page-crossing cycle for
    /// the read-type opcodes in accurate mode.
    fn emit_mode(&self, asm: &mut Asm, mode: Mode, op1: u8, op2: u8, read_penalty: bool) -> Ea {
        let abs = u16::from_le_bytes([op1, op2]);
        match mode {
            Mode::Imp | Mode::Acc | Mode::Rel | Mode::Ind => unreachable!(),
            Mode::Imm => Ea::Imm(op1),
            Mode::Zp => Ea::Fixed(op1 as u16),
            Mode::Abs => Ea::Fixed(abs),
            Mode::Zpx | Mode::Zpy => {
                if mode == Mode::Zpx {
                    asm.movzx_ecx_bl();
                } else {
                    asm.movzx_ecx_bh();
                }
                // The add wraps in cl: zero-page indexing never leaves
                // the page.
                asm.add_cl_imm(op1);
                asm.mov_r9d_ecx();
                Ea::Dyn { checked: false }
            }
            Mode::Abx | Mode::Aby => {
                if mode == Mode::Abx {
                    asm.movzx_ecx_bl();
                } else {
                    asm.movzx_ecx_bh();
                }
                asm.mov_r9d_imm(abs as u32);
                asm.add_r9d_ecx();
                if read_penalty && self.accurate {
                    self.emit_cross_penalty_fixed(asm, abs);
                }
                asm.movzx_r9d_r9w();
                Ea::Dyn { checked: true }
            }
            Mode::Idx => {
                asm.movzx_ecx_bl();
                asm.add_cl_imm(op1);
                asm.movzx_r9d_mem_rcx();
                asm.inc_cl();
                asm.movzx_r10d_mem_rcx();
                asm.shl_r10d_8();
                asm.or_r9d_r10d();
                Ea::Dyn { checked: true }
            }
            Mode::Idy => {
                let hi = (op1 as u16 + 1) & 0xFF;
                // Low byte plus Y first: bit 8 of the partial sum is the
                // page-crossing carry.
                asm.movzx_r9d_mem(op1 as u16);
                asm.movzx_ecx_bh();
                asm.add_r9d_ecx();
                if read_penalty && self.accurate {
                    asm.bt_r9d_imm(8);
                    let no_cross = asm.label();
                    asm.jcc(CC_AE, no_cross);
                    asm.sub_r15_imm(1);
                    asm.bind(no_cross);
                }
                asm.movzx_r10d_mem(hi);
                asm.shl_r10d_8();
                asm.add_r9d_r10d();
                asm.movzx_r9d_r9w();
                Ea::Dyn { checked: true }
            }
        }
    }

    /// Charge one extra cycle when `base + index` crossed a page; the
    /// base is a translation-time constant here.
    fn emit_cross_penalty_fixed(&self, asm: &mut Asm, base: u16) {
        asm.mov_r10d_r9d();
        asm.xor_r10d_imm(base as u32);
        asm.bt_r10d_imm(8);
        let no_cross = asm.label();
        asm.jcc(CC_AE, no_cross);
        asm.sub_r15_imm(1);
        asm.bind(no_cross);
    }

    // ── Operand plumbing ──────────────────────────────────────

    /// Load the operand byte into `dest`.  MMIO reads go through the
    /// helper thunk (which syncs the wheel first) and come back in cl.
    fn emit_read_into(&self, asm: &mut Asm, ea: Ea, dest: Reg8) {
        match ea {
            Ea::Imm(v) => asm.mov_r_imm(dest, v),
            Ea::Fixed(addr) => {
                if is_mmio(addr) {
                    asm.mov_r9d_imm(addr as u32);
                    asm.call_to(self.thunks.read_mem);
                    if dest != Reg8::Cl {
                        asm.mov_r_r(dest, Reg8::Cl);
                    }
                } else {
                    asm.mov_r_mem(dest, addr);
                }
            }
            Ea::Dyn { checked: false } => self.emit_dyn_load(asm, dest),
            Ea::Dyn { checked: true } => {
                asm.cmp_r9d_imm(MMIO_START as u32);
                let direct = asm.label();
                asm.jcc(CC_B, direct);
                asm.cmp_r9d_imm(MMIO_END as u32 + 1);
                asm.jcc(CC_AE, direct);
                asm.call_to(self.thunks.read_mem);
                if dest != Reg8::Cl {
                    asm.mov_r_r(dest, Reg8::Cl);
                }
                let done = asm.label();
                asm.jmp(done);
                asm.bind(direct);
                self.emit_dyn_load(asm, dest);
                asm.bind(done);
            }
        }
    }

    fn emit_dyn_load(&self, asm: &mut Asm, dest: Reg8) {
        // High-byte registers can't ride the REX-prefixed indexed form.
        if matches!(dest, Reg8::Bh | Reg8::Dh | Reg8::Ah) {
            asm.mov_r_mem_r9(Reg8::Cl);
            asm.mov_r_r(dest, Reg8::Cl);
        } else {
            asm.mov_r_mem_r9(dest);
        }
    }

    /// Store `src` at the operand address, keeping the code cache
    /// coherent: RAM stores plant the slot trap through the pointer
    /// table, everything at or above 0x8000 goes through the write
    /// helper (ROM, sideways RAM, MMIO).
    fn emit_write_from(&self, asm: &mut Asm, ea: Ea, src: Reg8) {
        match ea {
            Ea::Imm(_) => unreachable!(),
            Ea::Fixed(addr) => {
                if addr < 0x8000 {
                    asm.mov_mem_r(src, addr);
                    asm.mov_r10_ptrs_disp(addr);
                    asm.mov_r10_mem_imm32(SLOT_TRAP_IMM);
                } else {
                    asm.mov_r9d_imm(addr as u32);
                    if src != Reg8::Cl {
                        asm.mov_r_r(Reg8::Cl, src);
                    }
                    asm.call_to(self.thunks.write_mem);
                }
            }
            Ea::Dyn { checked: false } => {
                self.emit_dyn_store(asm, src);
                asm.mov_r10_ptrs_r9();
                asm.mov_r10_mem_imm32(SLOT_TRAP_IMM);
            }
            Ea::Dyn { checked: true } => {
                asm.cmp_r9d_imm(0x8000);
                let helper = asm.label();
                asm.jcc(CC_AE, helper);
                self.emit_dyn_store(asm, src);
                asm.mov_r10_ptrs_r9();
                asm.mov_r10_mem_imm32(SLOT_TRAP_IMM);
                let done = asm.label();
                asm.jmp(done);
                asm.bind(helper);
                if src != Reg8::Cl {
                    asm.mov_r_r(Reg8::Cl, src);
                }
                asm.call_to(self.thunks.write_mem);
                asm.bind(done);
            }
        }
    }

    fn emit_dyn_store(&self, asm: &mut Asm, src: Reg8) {
        if matches!(src, Reg8::Bh | Reg8::Dh | Reg8::Ah) {
            asm.mov_r_r(Reg8::Cl, src);
            asm.mov_mem_r9_r(Reg8::Cl);
        } else {
            asm.mov_mem_r9_r(src);
        }
    }

    /// Move the stored carry byte into CF, inverted for subtraction
    /// (the 6502 borrows on carry clear, x86 on carry set).
    fn emit_carry_in(&self, asm: &mut Asm, invert: bool) {
        asm.load_carry();
        if invert {
            asm.cmc();
        }
    }

    /// Even pushes invalidate: nothing stops a guest from running code
    /// out of the stack page.
    fn emit_stack_invalidate(&self, asm: &mut Asm) {
        asm.mov_r10_ptrs_rsi();
        asm.mov_r10_mem_imm32(SLOT_TRAP_IMM);
    }

    /// Z and N from a register value.
    fn emit_zn(&self, asm: &mut Asm, r: Reg8) {
        asm.test_r_r(r);
        asm.setcc(CC_E, Reg8::Dl);
        asm.setcc(CC_S, Reg8::Dh);
    }

    /// Capture OF into bit 6 of the P-remainder register.  Must follow
    /// the arithmetic op immediately.
    fn emit_save_overflow(&self, asm: &mut Asm) {
        asm.setcc_r10b(CC_O);
        asm.shl_r10b_imm(6);
        asm.and_r8b_imm(0xBF);
        asm.or_r8b_r10b();
    }

    /// Decimal mode is interpreter territory: the shared thunk traps
    /// out when D is set and falls straight back otherwise.
    fn emit_bcd_check(&self, asm: &mut Asm, opcode: u8) {
        asm.mov_ctx_imm8(OFF_TRAP_OPCODE, opcode);
        asm.call_to(self.thunks.bcd);
    }

    /// Operand fetch through the bus helper, unconditionally.  Costs a
    /// call but almost no slot bytes; the fat emitters use it for their
    /// dynamic addressing modes.
    fn emit_read_via_helper(&self, asm: &mut Asm) {
        asm.call_to(self.thunks.read_mem);
    }

    fn emit_write_via_helper(&self, asm: &mut Asm, src: Reg8) {
        if src != Reg8::Cl {
            asm.mov_r_r(Reg8::Cl, src);
        }
        asm.call_to(self.thunks.write_mem);
    }

    // ── Operation bodies ──────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn emit_body(
        &self,
        asm: &mut Asm,
        cache: &CodeCache,
        op: Op,
        mode: Mode,
        opcode: u8,
        op1: u8,
        op2: u8,
        pc: u16,
    ) {
        use Op::*;
        match op {
            Lda => {
                let ea = self.emit_mode(asm, mode, op1, op2, true);
                self.emit_read_into(asm, ea, Reg8::Al);
                self.emit_zn(asm, Reg8::Al);
            }
            Ldx => {
                let ea = self.emit_mode(asm, mode, op1, op2, true);
                self.emit_read_into(asm, ea, Reg8::Bl);
                self.emit_zn(asm, Reg8::Bl);
            }
            Ldy => {
                let ea = self.emit_mode(asm, mode, op1, op2, true);
                self.emit_read_into(asm, ea, Reg8::Bh);
                self.emit_zn(asm, Reg8::Bh);
            }
            Sta | Stx | Sty => {
                let src = match op {
                    Sta => Reg8::Al,
                    Stx => Reg8::Bl,
                    _ => Reg8::Bh,
                };
                let ea = self.emit_mode(asm, mode, op1, op2, false);
                self.emit_write_from(asm, ea, src);
            }
            Adc | Sbc => {
                self.emit_bcd_check(asm, opcode);
                let ea = self.emit_mode(asm, mode, op1, op2, true);
                let alu = if op == Adc { Alu::Adc } else { Alu::Sbb };
                // The carry byte must reach CF after every other piece
                // of address arithmetic is done with the flags.
                match ea {
                    Ea::Imm(v) => {
                        self.emit_carry_in(asm, op == Sbc);
                        asm.alu_al_imm(alu, v);
                    }
                    Ea::Fixed(addr) if !is_mmio(addr) => {
                        self.emit_carry_in(asm, op == Sbc);
                        asm.alu_r_mem(alu, Reg8::Al, addr);
                    }
                    Ea::Dyn { checked: true } => {
                        // Helper fetch keeps the widest emissions inside
                        // the slot.
                        self.emit_read_via_helper(asm);
                        self.emit_carry_in(asm, op == Sbc);
                        asm.alu_r_cl(alu, Reg8::Al);
                    }
                    _ => {
                        self.emit_read_into(asm, ea, Reg8::Cl);
                        self.emit_carry_in(asm, op == Sbc);
                        asm.alu_r_cl(alu, Reg8::Al);
                    }
                }
                if op == Adc {
                    asm.setcc(CC_B, Reg8::Ah);
                } else {
                    asm.setcc(CC_AE, Reg8::Ah);
                }
                self.emit_save_overflow(asm);
                self.emit_zn(asm, Reg8::Al);
            }
            And | Ora | Eor => {
                let alu = match op {
                    And => Alu::And,
                    Ora => Alu::Or,
                    _ => Alu::Xor,
                };
                let ea = self.emit_mode(asm, mode, op1, op2, true);
                self.emit_alu_operand(asm, alu, ea);
                self.emit_zn(asm, Reg8::Al);
            }
            Cmp | Cpx | Cpy => {
                let reg = match op {
                    Cmp => Reg8::Al,
                    Cpx => Reg8::Bl,
                    _ => Reg8::Bh,
                };
                let ea = self.emit_mode(asm, mode, op1, op2, true);
                match ea {
                    Ea::Imm(v) => {
                        if reg == Reg8::Al {
                            asm.alu_al_imm(Alu::Cmp, v);
                        } else {
                            asm.alu_r_imm(Alu::Cmp, reg, v);
                        }
                    }
                    Ea::Fixed(addr) if !is_mmio(addr) => asm.alu_r_mem(Alu::Cmp, reg, addr),
                    _ => {
                        self.emit_read_into(asm, ea, Reg8::Cl);
                        asm.alu_r_cl(Alu::Cmp, reg);
                    }
                }
                asm.setcc(CC_AE, Reg8::Ah);
                asm.setcc(CC_E, Reg8::Dl);
                asm.setcc(CC_S, Reg8::Dh);
            }
            Bit => {
                let ea = self.emit_mode(asm, mode, op1, op2, true);
                self.emit_read_into(asm, ea, Reg8::Cl);
                asm.test_cl_al();
                asm.setcc(CC_E, Reg8::Dl);
                asm.test_r_r(Reg8::Cl);
                asm.setcc(CC_S, Reg8::Dh);
                asm.bt_ecx_imm(6);
                asm.setcc_r10b(CC_B);
                asm.shl_r10b_imm(6);
                asm.and_r8b_imm(0xBF);
                asm.or_r8b_r10b();
            }
            Asl | Lsr | Rol | Ror => {
                let shift = match op {
                    Asl => Shift::Shl,
                    Lsr => Shift::Shr,
                    Rol => Shift::Rcl,
                    _ => Shift::Rcr,
                };
                if mode == Mode::Acc {
                    if matches!(op, Rol | Ror) {
                        asm.load_carry();
                    }
                    asm.shift_r(shift, Reg8::Al);
                    asm.setcc(CC_B, Reg8::Ah);
                    self.emit_zn(asm, Reg8::Al);
                } else {
                    let ea = self.emit_mode(asm, mode, op1, op2, false);
                    self.emit_rmw_read(asm, ea);
                    if matches!(op, Rol | Ror) {
                        asm.load_carry();
                    }
                    asm.shift_r(shift, Reg8::Cl);
                    asm.setcc(CC_B, Reg8::Ah);
                    self.emit_zn(asm, Reg8::Cl);
                    self.emit_rmw_write(asm, ea);
                }
            }
            Inc | Dec => {
                let ea = self.emit_mode(asm, mode, op1, op2, false);
                self.emit_rmw_read(asm, ea);
                if op == Inc {
                    asm.inc_r(Reg8::Cl);
                } else {
                    asm.dec_r(Reg8::Cl);
                }
                asm.setcc(CC_E, Reg8::Dl);
                asm.setcc(CC_S, Reg8::Dh);
                self.emit_rmw_write(asm, ea);
            }
            Inx => {
                asm.inc_r(Reg8::Bl);
                asm.setcc(CC_E, Reg8::Dl);
                asm.setcc(CC_S, Reg8::Dh);
            }
            Iny => {
                asm.inc_r(Reg8::Bh);
                asm.setcc(CC_E, Reg8::Dl);
                asm.setcc(CC_S, Reg8::Dh);
            }
            Dex => {
                asm.dec_r(Reg8::Bl);
                asm.setcc(CC_E, Reg8::Dl);
                asm.setcc(CC_S, Reg8::Dh);
            }
            Dey => {
                asm.dec_r(Reg8::Bh);
                asm.setcc(CC_E, Reg8::Dl);
                asm.setcc(CC_S, Reg8::Dh);
            }
            Tax => {
                asm.mov_r_r(Reg8::Bl, Reg8::Al);
                self.emit_zn(asm, Reg8::Bl);
            }
            Tay => {
                asm.mov_r_r(Reg8::Bh, Reg8::Al);
                self.emit_zn(asm, Reg8::Bh);
            }
            Txa => {
                asm.mov_r_r(Reg8::Al, Reg8::Bl);
                self.emit_zn(asm, Reg8::Al);
            }
            Tya => {
                asm.mov_r_r(Reg8::Al, Reg8::Bh);
                self.emit_zn(asm, Reg8::Al);
            }
            Tsx => {
                asm.mov_bl_sil();
                self.emit_zn(asm, Reg8::Bl);
            }
            Txs => asm.mov_sil_bl(),
            Clc => asm.mov_r_imm(Reg8::Ah, 0),
            Sec => asm.mov_r_imm(Reg8::Ah, 1),
            Cli => asm.and_r8b_imm(!FLAG_I),
            Sei => asm.or_r8b_imm(FLAG_I),
            Clv => asm.and_r8b_imm(0xBF),
            Cld => asm.and_r8b_imm(!FLAG_D),
            Sed => asm.or_r8b_imm(FLAG_D),
            Pha => {
                asm.mov_stack_r(Reg8::Al);
                self.emit_stack_invalidate(asm);
                asm.dec_sil();
            }
            Pla => {
                asm.inc_sil();
                asm.mov_r_stack(Reg8::Al);
                self.emit_zn(asm, Reg8::Al);
            }
            Php => {
                // Serialize the split flags into one P byte, B and the
                // always-set bit forced on as the 6502 pushes them.
                asm.mov_cl_r8b();
                asm.alu_r_imm(Alu::Or, Reg8::Cl, 0x30);
                asm.or_cl_ah();
                asm.mov_r10b_dl();
                asm.shl_r10b_imm(1);
                asm.or_cl_r10b();
                asm.mov_r10d_edx();
                asm.shr_r10d_imm(8);
                asm.shl_r10b_imm(7);
                asm.or_cl_r10b();
                asm.mov_stack_r(Reg8::Cl);
                self.emit_stack_invalidate(asm);
                asm.dec_sil();
            }
            Plp => {
                asm.inc_sil();
                asm.mov_r_stack(Reg8::Cl);
                self.emit_unpack_p(asm);
            }
            Jmp => {
                if mode == Mode::Abs {
                    let target = u16::from_le_bytes([op1, op2]);
                    asm.jmp_to(cache.slot_addr(target));
                } else {
                    // Indirect, with the page-wrap fetch quirk: the high
                    // byte of a ($xxFF) pointer comes from $xx00.
                    let ptr = u16::from_le_bytes([op1, op2]);
                    let hi = (ptr & 0xFF00) | (ptr.wrapping_add(1) & 0x00FF);
                    asm.movzx_r9d_mem(ptr);
                    asm.movzx_r10d_mem(hi);
                    asm.shl_r10d_8();
                    asm.or_r9d_r10d();
                    self.emit_jump_r9(asm);
                }
            }
            Jsr => {
                let target = u16::from_le_bytes([op1, op2]);
                let ret = pc.wrapping_add(2); // return address minus one
                asm.mov_stack_imm((ret >> 8) as u8);
                self.emit_stack_invalidate(asm);
                asm.dec_sil();
                asm.mov_stack_imm(ret as u8);
                self.emit_stack_invalidate(asm);
                asm.dec_sil();
                asm.jmp_to(cache.slot_addr(target));
            }
            Rts => {
                asm.inc_sil();
                asm.movzx_r9d_stack();
                asm.inc_sil();
                asm.movzx_r10d_stack();
                asm.shl_r10d_8();
                asm.or_r9d_r10d();
                asm.inc_r9d();
                asm.movzx_r9d_r9w();
                self.emit_jump_r9(asm);
            }
            Rti => {
                asm.inc_sil();
                asm.mov_r_stack(Reg8::Cl);
                self.emit_unpack_p(asm);
                asm.inc_sil();
                asm.movzx_r9d_stack();
                asm.inc_sil();
                asm.movzx_r10d_stack();
                asm.shl_r10d_8();
                asm.or_r9d_r10d();
                self.emit_jump_r9(asm);
            }
            Brk => {
                asm.mov_ctx_imm8(OFF_TRAP_OPCODE, 0x00);
                asm.call_to(self.thunks.brk);
            }
            Nop => {}
            Bpl | Bmi | Bvc | Bvs | Bcc | Bcs | Bne | Beq => {
                self.emit_branch(asm, cache, op, op1, pc);
            }
        }
    }

    /// Read-modify-write operand fetch into cl: the runtime-routed
    /// modes go through the helper both ways, so the emission stays
    /// narrow and MMIO read-modify-writes behave.
    fn emit_rmw_read(&self, asm: &mut Asm, ea: Ea) {
        match ea {
            Ea::Dyn { checked: true } => self.emit_read_via_helper(asm),
            _ => self.emit_read_into(asm, ea, Reg8::Cl),
        }
    }

    fn emit_rmw_write(&self, asm: &mut Asm, ea: Ea) {
        match ea {
            Ea::Dyn { checked: true } => self.emit_write_via_helper(asm, Reg8::Cl),
            _ => self.emit_write_from(asm, ea, Reg8::Cl),
        }
    }

    /// `op al, operand` for the accumulator ALU group.
    fn emit_alu_operand(&self, asm: &mut Asm, alu: Alu, ea: Ea) {
        match ea {
            Ea::Imm(v) => asm.alu_al_imm(alu, v),
            Ea::Fixed(addr) if !is_mmio(addr) => asm.alu_r_mem(alu, Reg8::Al, addr),
            _ => {
                self.emit_read_into(asm, ea, Reg8::Cl);
                asm.alu_r_cl(alu, Reg8::Al);
            }
        }
    }

    /// Unpack a pulled P byte in cl into the split representation.
    /// B is dropped; the always-set bit is forced.
    fn emit_unpack_p(&self, asm: &mut Asm) {
        asm.bt_ecx_imm(0);
        asm.setcc(CC_B, Reg8::Ah);
        asm.bt_ecx_imm(1);
        asm.setcc(CC_B, Reg8::Dl);
        asm.bt_ecx_imm(7);
        asm.setcc(CC_B, Reg8::Dh);
        asm.alu_r_imm(Alu::And, Reg8::Cl, 0x4C);
        asm.alu_r_imm(Alu::Or, Reg8::Cl, 0x20);
        asm.mov_r8b_cl();
    }

    /// Jump to the slot whose guest PC is in r9d.
    fn emit_jump_r9(&self, asm: &mut Asm) {
        asm.shl_r9_imm(SLOT_SHIFT as u8);
        asm.add_r9_r13();
        asm.jmp_r9();
    }

    fn emit_branch(&self, asm: &mut Asm, cache: &CodeCache, op: Op, offset: u8, pc: u16) {
        use Op::*;
        // Taken when the tested byte is non-zero (flag set) or zero
        // (flag clear), depending on the mnemonic.
        let (taken_cc, test_v) = match op {
            Bcs => (CC_NE, 0),
            Bcc => (CC_E, 0),
            Beq => (CC_NE, 1),
            Bne => (CC_E, 1),
            Bmi => (CC_NE, 2),
            Bpl => (CC_E, 2),
            Bvs => (CC_NE, 3),
            _ => (CC_E, 3),
        };
        match test_v {
            0 => asm.test_r_r(Reg8::Ah),
            1 => asm.test_r_r(Reg8::Dl),
            2 => asm.test_r_r(Reg8::Dh),
            _ => asm.test_r8b_imm(0x40),
        }

        let next = pc.wrapping_add(2);
        let target = next.wrapping_add(offset as i8 as u16);
        if self.accurate {
            // Taken branches cost one extra cycle, two if the target is
            // on another page.
            let penalty = if next & 0xFF00 != target & 0xFF00 { 2 } else { 1 };
            let not_taken = asm.label();
            asm.jcc(taken_cc ^ 1, not_taken);
            asm.sub_r15_imm(penalty);
            asm.jmp_to(cache.slot_addr(target));
            asm.bind(not_taken);
        } else {
            asm.jcc_to(taken_cc, cache.slot_addr(target));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::dispatch::Thunks;
    use crate::jit::SLOT_WIDTH;

    fn test_translator(accurate: bool, cache: &CodeCache) -> Translator {
        // Targets inside the mapping so every rel32 is in range.
        let t = cache.slot_base();
        Translator::new(
            accurate,
            Thunks {
                countdown: t,
                irq_check: t,
                trap: t,
                bcd: t,
                brk: t,
                read_mem: t,
                write_mem: t,
            },
        )
    }

    /// Every documented opcode's emission, with worst-case operands,
    /// fits its slot with room for the fall-through jump.
    #[test]
    fn slot_width_safety() {
        let mut cache = CodeCache::new().unwrap();
        for accurate in [false, true] {
            let translator = test_translator(accurate, &cache);
            let mut mem = vec![0u8; 0x10000];
            for opcode in 0..=255u8 {
                let pc = 0x4000u16;
                mem[pc as usize] = opcode;
                // 0xFFFF stresses the indexed and indirect paths.
                mem[pc as usize + 1] = 0xFF;
                mem[pc as usize + 2] = 0xFF;
                let used = translator.translate_insn(&mut cache, &mem, pc, true, 7);
                assert!(
                    used <= SLOT_WIDTH - 2,
                    "opcode {opcode:#04x} accurate={accurate} uses {used} bytes"
                );
                cache.reset_slot(pc);
            }
        }
    }

    #[test]
    fn decode_covers_the_documented_set() {
        let count = (0..=255u8).filter(|&op| decode(op).is_some()).count();
        assert_eq!(count, 151);
    }

    #[test]
    fn block_scan_stops_at_control_transfer() {
        let mut cache = CodeCache::new().unwrap();
        let translator = test_translator(false, &cache);
        let mut mem = vec![0u8; 0x10000];
        // LDA #$42; STA $70; RTS; then untouched bytes.
        mem[0x2000] = 0xA9;
        mem[0x2001] = 0x42;
        mem[0x2002] = 0x85;
        mem[0x2003] = 0x70;
        mem[0x2004] = 0x60;
        translator.translate_block(&mut cache, &mem, 0x2000);
        assert!(!cache.is_trapped(0x2000));
        assert!(!cache.is_trapped(0x2002));
        assert!(!cache.is_trapped(0x2004));
        // The byte after RTS is not part of the block.
        assert!(cache.is_trapped(0x2005));
        // Operand bytes keep their own trap fill.
        assert!(cache.is_trapped(0x2001));
    }
}
