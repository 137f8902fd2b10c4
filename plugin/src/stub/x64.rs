//! x86-64 System V backend for the stub emitter.
//!
//! Lowering is deliberately allocator-free: arguments stay in their ABI
//! registers between spills and fills, R10 is the flag-test scratch and R11
//! the call scratch. The frame is a single `sub rsp, imm32` whose immediate
//! is backpatched once every region has been handed out.

use crate::stub::emitter::{EmitError, Emitter, Label, Mem, StackSlot};
use crate::types::Signature;
use std::sync::Arc;
use waylay_intercept::arch::x86_64::writer::{Reg, X86_64Writer, Xmm};
use waylay_intercept::{CodeArena, CodeSlice};

/// Integer-class argument registers, in order.
const GP_ARGS: [Reg; 6] = [Reg::RDI, Reg::RSI, Reg::RDX, Reg::RCX, Reg::R8, Reg::R9];

/// Float-class argument registers, in order.
const FP_ARGS: [Xmm; 8] = [
    Xmm::XMM0,
    Xmm::XMM1,
    Xmm::XMM2,
    Xmm::XMM3,
    Xmm::XMM4,
    Xmm::XMM5,
    Xmm::XMM6,
    Xmm::XMM7,
];

/// One stub never comes close to a page; the slack doubles as headroom for
/// the per-op capacity check.
const STUB_CAPACITY: usize = 4096;
const OP_HEADROOM: usize = 64;

#[derive(Debug, Clone, Copy)]
enum ArgLoc {
    Gp(Reg),
    Fp(Xmm),
}

enum LabelState {
    /// Pending JNZ rel32 fixups: (disp32 location, pc after the branch).
    Unbound(Vec<(*mut u8, u64)>),
    Bound(u64),
}

pub struct X64Emitter {
    arena: Arc<CodeArena>,
    slice: CodeSlice,
    w: X86_64Writer,
    sig: Option<Signature>,
    locs: Vec<ArgLoc>,
    float_count: u32,
    frame_top: u32,
    /// imm32 positions of `sub rsp` / `add rsp` awaiting the final frame size.
    frame_sites: Vec<*mut u8>,
    labels: Vec<LabelState>,
    committed: bool,
}

impl X64Emitter {
    pub fn new(arena: Arc<CodeArena>) -> Result<Self, EmitError> {
        let slice = arena.alloc(STUB_CAPACITY).map_err(|_| EmitError::OutOfMemory)?;
        let w = unsafe { X86_64Writer::new(slice.data, slice.size, slice.data as u64) };
        Ok(Self {
            arena,
            slice,
            w,
            sig: None,
            locs: Vec::new(),
            float_count: 0,
            frame_top: 0,
            frame_sites: Vec::new(),
            labels: Vec::new(),
            committed: false,
        })
    }

    fn sig(&self) -> &Signature {
        self.sig.as_ref().expect("begin() not called")
    }

    fn check_headroom(&self) -> Result<(), EmitError> {
        if self.w.remaining() < OP_HEADROOM {
            return Err(EmitError::Overflow);
        }
        Ok(())
    }

    fn mem_offset(m: Mem) -> i32 {
        (m.slot.0 + m.offset) as i32
    }

    /// Emit `sub`/`add rsp, imm32` with a placeholder immediate and remember
    /// where to patch it.
    unsafe fn frame_adjust(&mut self, grow: bool) {
        if grow {
            self.w.put_sub_reg_imm32(Reg::RSP, 0);
        } else {
            self.w.put_add_reg_imm32(Reg::RSP, 0);
        }
        // REX.W 81 /r id — the immediate is the trailing four bytes.
        self.frame_sites.push(self.w.code_ptr().sub(4));
    }
}

impl Emitter for X64Emitter {
    fn begin(&mut self, sig: &Signature) -> Result<(), EmitError> {
        let mut gp = 0usize;
        let mut fp = 0usize;
        let mut locs = Vec::with_capacity(sig.args.len());

        for &ty in &sig.args {
            if ty.is_float() {
                if fp == FP_ARGS.len() {
                    return Err(EmitError::TooManyArguments {
                        ints: gp as u32,
                        floats: fp as u32 + 1,
                    });
                }
                locs.push(ArgLoc::Fp(FP_ARGS[fp]));
                fp += 1;
            } else if ty.is_int() {
                if gp == GP_ARGS.len() {
                    return Err(EmitError::TooManyArguments {
                        ints: gp as u32 + 1,
                        floats: fp as u32,
                    });
                }
                locs.push(ArgLoc::Gp(GP_ARGS[gp]));
                gp += 1;
            } else {
                return Err(EmitError::WideParameter);
            }
        }
        if !(sig.ret.is_void() || sig.ret.is_int() || sig.ret.is_float()) {
            return Err(EmitError::WideParameter);
        }

        self.sig = Some(sig.clone());
        self.locs = locs;
        self.float_count = fp as u32;
        unsafe {
            self.frame_adjust(true);
        }
        Ok(())
    }

    fn new_stack(&mut self, size: u32, align: u32) -> Result<StackSlot, EmitError> {
        let align = align.max(1);
        debug_assert!(align.is_power_of_two());
        self.frame_top = (self.frame_top + align - 1) & !(align - 1);
        let slot = StackSlot(self.frame_top);
        self.frame_top += size;
        Ok(slot)
    }

    fn new_label(&mut self) -> Label {
        self.labels.push(LabelState::Unbound(Vec::new()));
        Label(self.labels.len() - 1)
    }

    fn bind(&mut self, label: Label) -> Result<(), EmitError> {
        let pc = self.w.pc();
        match core::mem::replace(&mut self.labels[label.0], LabelState::Bound(pc)) {
            LabelState::Unbound(sites) => {
                for (disp_ptr, end_pc) in sites {
                    let rel = pc as i64 - end_pc as i64;
                    unsafe {
                        (disp_ptr as *mut i32).write_unaligned(rel as i32);
                    }
                }
                Ok(())
            }
            LabelState::Bound(_) => Err(EmitError::UnboundLabel),
        }
    }

    fn spill_arg(&mut self, index: u32, dst: Mem) -> Result<(), EmitError> {
        self.check_headroom()?;
        let off = Self::mem_offset(dst);
        unsafe {
            match self.locs[index as usize] {
                ArgLoc::Gp(r) => self.w.put_mov_mem_reg(Reg::RSP, off, r),
                ArgLoc::Fp(x) => self.w.put_movq_mem_xmm(Reg::RSP, off, x),
            }
        }
        Ok(())
    }

    fn fill_arg(&mut self, index: u32, src: Mem) -> Result<(), EmitError> {
        self.check_headroom()?;
        let off = Self::mem_offset(src);
        unsafe {
            match self.locs[index as usize] {
                ArgLoc::Gp(r) => self.w.put_mov_reg_mem(r, Reg::RSP, off),
                ArgLoc::Fp(x) => self.w.put_movq_xmm_mem(x, Reg::RSP, off),
            }
        }
        Ok(())
    }

    fn store_imm64(&mut self, dst: Mem, value: u64) -> Result<(), EmitError> {
        self.check_headroom()?;
        let off = Self::mem_offset(dst);
        unsafe {
            self.w.put_mov_reg_imm64(Reg::R10, value);
            self.w.put_mov_mem_reg(Reg::RSP, off, Reg::R10);
        }
        Ok(())
    }

    fn test_flag_jnz(&mut self, flag: Mem, mask: u32, target: Label) -> Result<(), EmitError> {
        self.check_headroom()?;
        let off = Self::mem_offset(flag);
        unsafe {
            self.w.put_mov_reg32_mem(Reg::R10, Reg::RSP, off);
            self.w.put_test_reg32_imm32(Reg::R10, mask);
        }
        match self.labels[target.0] {
            LabelState::Bound(pc) => unsafe {
                self.w.put_jnz_rel32(pc);
            },
            LabelState::Unbound(ref mut sites) => unsafe {
                self.w.put_bytes(&[0x0F, 0x85, 0x00, 0x00, 0x00, 0x00]);
                sites.push((self.w.code_ptr().sub(4), self.w.pc()));
            },
        }
        Ok(())
    }

    fn invoke_observer(
        &mut self,
        entry: u64,
        context: u64,
        params: StackSlot,
        prop: StackSlot,
        ret: StackSlot,
    ) -> Result<(), EmitError> {
        self.check_headroom()?;
        unsafe {
            self.w.put_mov_reg_imm64(Reg::RDI, context);
            self.w.put_lea_reg_mem(Reg::RSI, Reg::RSP, params.0 as i32);
            self.w.put_lea_reg_mem(Reg::RDX, Reg::RSP, prop.0 as i32);
            self.w.put_lea_reg_mem(Reg::RCX, Reg::RSP, ret.0 as i32);
            self.w.put_mov_reg_imm64(Reg::R11, entry);
            self.w.put_call_reg(Reg::R11);
        }
        Ok(())
    }

    fn invoke_original(&mut self, holder: u64, ret: Option<Mem>) -> Result<(), EmitError> {
        self.check_headroom()?;
        let variadic = self.sig().va_index.is_some();
        let ret_is_float = self.sig().ret.is_float();
        unsafe {
            // The holder cell is dereferenced on every invocation so the
            // detour engine may retarget the trampoline underneath us.
            self.w.put_mov_reg_imm64(Reg::R11, holder);
            self.w.put_mov_reg_mem(Reg::R11, Reg::R11, 0);
            if variadic {
                // Variadic callees expect AL = number of XMM registers used.
                self.w.put_mov_reg32_imm32(Reg::RAX, self.float_count);
            }
            self.w.put_call_reg(Reg::R11);
            if let Some(mem) = ret {
                let off = Self::mem_offset(mem);
                if ret_is_float {
                    self.w.put_movq_mem_xmm(Reg::RSP, off, Xmm::XMM0);
                } else {
                    self.w.put_mov_mem_reg(Reg::RSP, off, Reg::RAX);
                }
            }
        }
        Ok(())
    }

    fn ret_from(&mut self, src: Option<Mem>) -> Result<(), EmitError> {
        self.check_headroom()?;
        let ret_is_float = self.sig().ret.is_float();
        unsafe {
            if let Some(mem) = src {
                let off = Self::mem_offset(mem);
                if ret_is_float {
                    self.w.put_movq_xmm_mem(Xmm::XMM0, Reg::RSP, off);
                } else {
                    self.w.put_mov_reg_mem(Reg::RAX, Reg::RSP, off);
                }
            }
            self.frame_adjust(false);
            self.w.put_ret();
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<u64, EmitError> {
        if self
            .labels
            .iter()
            .any(|l| matches!(l, LabelState::Unbound(_)))
        {
            return Err(EmitError::UnboundLabel);
        }
        if self.w.remaining() == 0 {
            return Err(EmitError::Overflow);
        }

        // The frame keeps RSP 16-byte aligned at every call site: entry RSP
        // is 8 mod 16, so the adjustment must be 8 mod 16 as well.
        let frame = ((self.frame_top + 15) & !15) + 8;
        for &site in &self.frame_sites {
            unsafe {
                (site as *mut u32).write_unaligned(frame);
            }
        }

        unsafe {
            self.arena
                .commit(&self.slice)
                .map_err(|_| EmitError::Protect)?;
        }
        self.committed = true;
        Ok(self.slice.pc as u64)
    }
}

impl Drop for X64Emitter {
    fn drop(&mut self) {
        if !self.committed {
            self.arena.release(self.slice.pc as u64);
        }
    }
}
