//! x86-64 instruction emission.
//!
//! Each `put_*` method assembles one instruction into an [`Enc`] scratch
//! record and flushes it through the cursor. Memory operands pick the
//! shortest displacement form that fits, so emitted code is not
//! byte-stable across operand ranges; anything that backpatches (frame
//! immediates, branch displacements) must use the fixed-width forms and
//! record positions via [`X86_64Writer::code_ptr`].

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    RAX = 0,
    RCX = 1,
    RDX = 2,
    RBX = 3,
    RSP = 4,
    RBP = 5,
    RSI = 6,
    RDI = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Xmm {
    XMM0 = 0,
    XMM1 = 1,
    XMM2 = 2,
    XMM3 = 3,
    XMM4 = 4,
    XMM5 = 5,
    XMM6 = 6,
    XMM7 = 7,
    XMM8 = 8,
    XMM9 = 9,
    XMM10 = 10,
    XMM11 = 11,
    XMM12 = 12,
    XMM13 = 13,
    XMM14 = 14,
    XMM15 = 15,
}

/// One instruction under construction. At most 16 bytes (the longest form
/// we emit is the absolute-jump gadget).
#[derive(Clone, Copy)]
struct Enc {
    bytes: [u8; 16],
    len: usize,
}

impl Enc {
    fn new() -> Self {
        Self {
            bytes: [0; 16],
            len: 0,
        }
    }

    fn op(mut self, byte: u8) -> Self {
        self.bytes[self.len] = byte;
        self.len += 1;
        self
    }

    /// Mandatory REX with W set; R/B picked up from the high bit of the
    /// two register numbers (ModRM reg field, then rm/base field).
    fn rex_w(self, reg: u8, rm: u8) -> Self {
        self.op(0x48 | ((reg >> 3) << 2) | (rm >> 3))
    }

    /// REX only when an extended register forces one.
    fn rex_if(self, reg: u8, rm: u8) -> Self {
        let bits = ((reg >> 3) << 2) | (rm >> 3);
        if bits != 0 {
            self.op(0x40 | bits)
        } else {
            self
        }
    }

    /// Register-direct ModRM (mod=11).
    fn reg_rm(self, reg: u8, rm: u8) -> Self {
        self.op(0xC0 | ((reg & 7) << 3) | (rm & 7))
    }

    /// `[base + disp]` operand: disp8 when the offset fits a signed byte,
    /// disp32 otherwise, with the SIB byte RSP-class bases require. mod=00
    /// is never used, so RBP/R13 need no carve-out.
    fn mem(mut self, reg: u8, base: u8, disp: i32) -> Self {
        let rm = base & 7;
        let short = i8::try_from(disp).is_ok();
        let mode = if short { 0x40 } else { 0x80 };
        self = self.op(mode | ((reg & 7) << 3) | rm);
        if rm == 4 {
            self = self.op(0x24);
        }
        if short {
            self.op(disp as u8)
        } else {
            self.i32(disp)
        }
    }

    fn i32(mut self, value: i32) -> Self {
        self.bytes[self.len..self.len + 4].copy_from_slice(&value.to_le_bytes());
        self.len += 4;
        self
    }

    fn i64(mut self, value: u64) -> Self {
        self.bytes[self.len..self.len + 8].copy_from_slice(&value.to_le_bytes());
        self.len += 8;
        self
    }
}

/// Cursor over a fixed code buffer.
///
/// `org` is the address the buffer executes at; it may differ from the
/// buffer address while a trampoline or stub is being assembled elsewhere.
#[derive(Debug)]
pub struct X86_64Writer {
    buf: *mut u8,
    cap: usize,
    at: usize,
    org: u64,
}

impl X86_64Writer {
    pub unsafe fn new(buffer: *mut u8, size: usize, pc: u64) -> Self {
        Self {
            buf: buffer,
            cap: size,
            at: 0,
            org: pc,
        }
    }

    pub fn pc(&self) -> u64 {
        self.org + self.at as u64
    }

    pub fn offset(&self) -> usize {
        self.at
    }

    pub fn code_ptr(&self) -> *mut u8 {
        unsafe { self.buf.add(self.at) }
    }

    pub fn remaining(&self) -> usize {
        self.cap - self.at
    }

    unsafe fn push(&mut self, enc: Enc) {
        debug_assert!(self.at + enc.len <= self.cap);
        core::ptr::copy_nonoverlapping(enc.bytes.as_ptr(), self.buf.add(self.at), enc.len);
        self.at += enc.len;
    }

    /// Copy raw, pre-encoded bytes.
    pub unsafe fn put_bytes(&mut self, bytes: &[u8]) {
        debug_assert!(self.at + bytes.len() <= self.cap);
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.buf.add(self.at), bytes.len());
        self.at += bytes.len();
    }

    // ── Stack ────────────────────────────────────────────────────────

    pub unsafe fn put_push_reg(&mut self, reg: Reg) {
        let n = reg as u8;
        self.push(Enc::new().rex_if(0, n).op(0x50 | (n & 7)));
    }

    // ── Moves ────────────────────────────────────────────────────────

    /// `mov r64, imm64`
    pub unsafe fn put_mov_reg_imm64(&mut self, reg: Reg, imm: u64) {
        let n = reg as u8;
        self.push(Enc::new().rex_w(0, n).op(0xB8 | (n & 7)).i64(imm));
    }

    /// `mov r32, imm32` — writes through to the full register as zeros.
    pub unsafe fn put_mov_reg32_imm32(&mut self, reg: Reg, imm: u32) {
        let n = reg as u8;
        self.push(Enc::new().rex_if(0, n).op(0xB8 | (n & 7)).i32(imm as i32));
    }

    /// `mov r64, [base + disp]`
    pub unsafe fn put_mov_reg_mem(&mut self, dst: Reg, base: Reg, offset: i32) {
        let (d, b) = (dst as u8, base as u8);
        self.push(Enc::new().rex_w(d, b).op(0x8B).mem(d, b, offset));
    }

    /// `mov r32, [base + disp]` — zero-extending load.
    pub unsafe fn put_mov_reg32_mem(&mut self, dst: Reg, base: Reg, offset: i32) {
        let (d, b) = (dst as u8, base as u8);
        self.push(Enc::new().rex_if(d, b).op(0x8B).mem(d, b, offset));
    }

    /// `mov [base + disp], r64`
    pub unsafe fn put_mov_mem_reg(&mut self, base: Reg, offset: i32, src: Reg) {
        let (s, b) = (src as u8, base as u8);
        self.push(Enc::new().rex_w(s, b).op(0x89).mem(s, b, offset));
    }

    /// `movq xmm, m64` — the low quad through an XMM register.
    pub unsafe fn put_movq_xmm_mem(&mut self, dst: Xmm, base: Reg, offset: i32) {
        let (d, b) = (dst as u8, base as u8);
        self.push(
            Enc::new()
                .op(0xF3)
                .rex_if(d, b)
                .op(0x0F)
                .op(0x7E)
                .mem(d, b, offset),
        );
    }

    /// `movq m64, xmm`
    pub unsafe fn put_movq_mem_xmm(&mut self, base: Reg, offset: i32, src: Xmm) {
        let (s, b) = (src as u8, base as u8);
        self.push(
            Enc::new()
                .op(0x66)
                .rex_if(s, b)
                .op(0x0F)
                .op(0xD6)
                .mem(s, b, offset),
        );
    }

    /// `lea r64, [base + disp]`
    pub unsafe fn put_lea_reg_mem(&mut self, dst: Reg, base: Reg, offset: i32) {
        let (d, b) = (dst as u8, base as u8);
        self.push(Enc::new().rex_w(d, b).op(0x8D).mem(d, b, offset));
    }

    // ── Arithmetic / test ────────────────────────────────────────────

    /// `sub r64, imm32` — always the imm32 form so the immediate can be
    /// backpatched in place.
    pub unsafe fn put_sub_reg_imm32(&mut self, reg: Reg, imm: u32) {
        let n = reg as u8;
        self.push(Enc::new().rex_w(0, n).op(0x81).reg_rm(5, n).i32(imm as i32));
    }

    /// `add r64, imm32` — fixed-width like `sub`.
    pub unsafe fn put_add_reg_imm32(&mut self, reg: Reg, imm: u32) {
        let n = reg as u8;
        self.push(Enc::new().rex_w(0, n).op(0x81).reg_rm(0, n).i32(imm as i32));
    }

    /// `test r32, imm32`
    pub unsafe fn put_test_reg32_imm32(&mut self, reg: Reg, imm: u32) {
        let n = reg as u8;
        self.push(Enc::new().rex_if(0, n).op(0xF7).reg_rm(0, n).i32(imm as i32));
    }

    // ── Control flow ─────────────────────────────────────────────────

    /// `jmp rel32` to an absolute `target`.
    pub unsafe fn put_jmp_near(&mut self, target: u64) {
        let rel = target.wrapping_sub(self.pc() + 5) as i64 as i32;
        self.push(Enc::new().op(0xE9).i32(rel));
    }

    /// Range-free jump: `jmp [rip]` over an inline 8-byte literal, with a
    /// UD2 plugging the two bytes between the load and the literal.
    pub unsafe fn put_jmp_far(&mut self, target: u64) {
        self.push(
            Enc::new()
                .op(0xFF)
                .op(0x25)
                .i32(2)
                .op(0x0F)
                .op(0x0B)
                .i64(target),
        );
    }

    /// Near jump when `target` is in rel32 range of here, the 16-byte
    /// indirect form otherwise.
    pub unsafe fn put_jmp_address(&mut self, target: u64) {
        let rel = target as i64 - (self.pc() as i64 + 5);
        if i32::try_from(rel).is_ok() {
            self.put_jmp_near(target);
        } else {
            self.put_jmp_far(target);
        }
    }

    /// `call r64`
    pub unsafe fn put_call_reg(&mut self, reg: Reg) {
        let n = reg as u8;
        self.push(Enc::new().rex_if(0, n).op(0xFF).reg_rm(2, n));
    }

    /// `jnz rel32` to an absolute `target`.
    pub unsafe fn put_jnz_rel32(&mut self, target: u64) {
        let rel = target.wrapping_sub(self.pc() + 6) as i64 as i32;
        self.push(Enc::new().op(0x0F).op(0x85).i32(rel));
    }

    pub unsafe fn put_ret(&mut self) {
        self.push(Enc::new().op(0xC3));
    }

    // ── Padding ──────────────────────────────────────────────────────

    /// NOP out `n` bytes using the canonical multi-byte forms, longest
    /// first.
    pub unsafe fn put_nop_n(&mut self, n: usize) {
        const FORMS: [&[u8]; 9] = [
            &[0x90],
            &[0x66, 0x90],
            &[0x0F, 0x1F, 0x00],
            &[0x0F, 0x1F, 0x40, 0x00],
            &[0x0F, 0x1F, 0x44, 0x00, 0x00],
            &[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00],
            &[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00],
            &[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
            &[0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
        ];

        let mut left = n;
        while left > 0 {
            let take = left.min(FORMS.len());
            self.put_bytes(FORMS[take - 1]);
            left -= take;
        }
    }
}
