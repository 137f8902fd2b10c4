use crate::arch::x86_64::relocator::{can_relocate, is_endbr64, PrologueRelocator};
use crate::arch::x86_64::writer::X86_64Writer;
use crate::code::arena::CodeArena;
use crate::code::patcher::patch_code;
use crate::types::HookError;
use core::ffi::c_void;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Near JMP (E9 rel32): 5 bytes.
const NEAR_JMP_SIZE: usize = 5;

/// Far JMP (FF 25 02 00 00 00; 0F 0B; .quad addr): 16 bytes.
const FAR_JMP_SIZE: usize = 16;

/// Maximum relative distance for a near JMP rel32 (±2GB).
const NEAR_RANGE: usize = 0x7FFF_FFFF;

/// Longest prologue patch we are prepared to restore.
const MAX_PATCH: usize = 32;

/// Inline detour over a free function.
///
/// `hook()` overwrites the target prologue with a jump to the redirect stub,
/// assembles a trampoline out of the displaced prologue bytes, and publishes
/// the trampoline's address through the holder cell so the stub can keep
/// calling the original. `unhook()` puts the prologue back.
pub struct Detour {
    arena: Arc<CodeArena>,
    target: usize,
    stub: u64,
    holder: *const AtomicU64,
    saved: [u8; MAX_PATCH],
    patch_len: usize,
    trampoline: u64,
    hooked: bool,
}

// Raw pointers here are addresses of code and of the owning Callback's
// holder cell; the registry serializes all mutation behind its mutex.
unsafe impl Send for Detour {}

impl Detour {
    pub fn new(
        arena: Arc<CodeArena>,
        target: *mut c_void,
        stub: u64,
        holder: *const AtomicU64,
    ) -> Self {
        Self {
            arena,
            target: target as usize,
            stub,
            holder,
            saved: [0; MAX_PATCH],
            patch_len: 0,
            trampoline: 0,
            hooked: false,
        }
    }

    pub fn trampoline(&self) -> u64 {
        self.trampoline
    }

    pub fn is_hooked(&self) -> bool {
        self.hooked
    }

    pub fn hook(&mut self) -> Result<(), HookError> {
        if self.hooked {
            return Ok(());
        }

        let mut patch_addr = self.target as *mut u8;
        let mut patch_pc = self.target as u64;
        if is_endbr64(patch_addr) {
            patch_addr = unsafe { patch_addr.add(4) };
            patch_pc += 4;
        }

        let tramp = self.arena.alloc_near(patch_addr, 4096)?;

        let page_is_near =
            ((tramp.data as i64) - (patch_pc as i64)).unsigned_abs() as usize <= NEAR_RANGE;
        let stub_is_near = ((self.stub as i64) - (patch_pc as i64 + NEAR_JMP_SIZE as i64))
            .unsigned_abs() as usize
            <= NEAR_RANGE;

        let redirect_size = if stub_is_near || page_is_near {
            NEAR_JMP_SIZE
        } else {
            FAR_JMP_SIZE
        };

        if can_relocate(patch_addr, redirect_size) < redirect_size {
            self.arena.release(tramp.pc as u64);
            return Err(HookError::RelocationFailed);
        }

        // Trampoline: displaced prologue + jump back, then an optional relay
        // when the stub is out of near range but the trampoline page is not.
        let relocated;
        let redirect_target;
        unsafe {
            let mut w = X86_64Writer::new(tramp.data, tramp.size, tramp.data as u64);
            let mut r = PrologueRelocator::new(patch_addr, patch_pc);
            relocated = match r.relocate_bytes(&mut w, redirect_size) {
                Ok(n) => n,
                Err(e) => {
                    self.arena.release(tramp.pc as u64);
                    return Err(e);
                }
            };
            w.put_jmp_address(patch_pc + relocated as u64);

            if stub_is_near || !page_is_near {
                redirect_target = self.stub;
            } else {
                redirect_target = w.pc();
                w.put_jmp_far(self.stub);
            }

            if let Err(e) = self.arena.commit(&tramp) {
                self.arena.release(tramp.pc as u64);
                return Err(e);
            }
        }

        if relocated > MAX_PATCH {
            self.arena.release(tramp.pc as u64);
            return Err(HookError::RelocationFailed);
        }

        self.saved = unsafe { core::ptr::read_unaligned(patch_addr as *const [u8; MAX_PATCH]) };

        // Redirect: jump + NOP padding out to the displaced length.
        let mut redirect = [0u8; MAX_PATCH];
        unsafe {
            let mut w = X86_64Writer::new(redirect.as_mut_ptr(), redirect.len(), patch_pc);
            if redirect_size == NEAR_JMP_SIZE {
                w.put_jmp_near(redirect_target);
            } else {
                w.put_jmp_far(redirect_target);
            }
            let written = w.offset();
            if written < relocated {
                w.put_nop_n(relocated - written);
            }
        }

        if let Err(e) = unsafe {
            patch_code(patch_addr, relocated, |p| {
                core::ptr::copy_nonoverlapping(redirect.as_ptr(), p, relocated);
            })
        } {
            self.arena.release(tramp.pc as u64);
            return Err(e);
        }

        self.trampoline = tramp.pc as u64;
        self.patch_len = relocated;
        self.hooked = true;
        unsafe {
            (*self.holder).store(self.trampoline, Ordering::Release);
        }
        Ok(())
    }

    pub fn unhook(&mut self) -> bool {
        if !self.hooked {
            return false;
        }

        // The saved bytes were captured at the patch site, past any ENDBR64
        // left intact at the function entry.
        let mut patch_addr = self.target as *mut u8;
        if is_endbr64(patch_addr) {
            patch_addr = unsafe { patch_addr.add(4) };
        }

        let saved = self.saved;
        let len = self.patch_len;
        let ok = unsafe {
            patch_code(patch_addr, len, |p| {
                core::ptr::copy_nonoverlapping(saved.as_ptr(), p, len);
            })
        }
        .is_ok();

        self.hooked = !ok;
        ok
    }
}

impl Drop for Detour {
    fn drop(&mut self) {
        if self.hooked {
            self.unhook();
        }
        if self.trampoline != 0 {
            self.arena.release(self.trampoline);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::arena::CodeSlice;

    type UnaryFn = extern "C" fn(i64) -> i64;

    /// JIT a function computing `x * 2` with a relocatable prologue.
    fn make_double(arena: &Arc<CodeArena>) -> (CodeSlice, UnaryFn) {
        let slice = arena.alloc(64).expect("alloc");
        unsafe {
            let mut w = X86_64Writer::new(slice.data, slice.size, slice.data as u64);
            w.put_bytes(&[0x48, 0x89, 0xF8]); // mov rax, rdi
            w.put_bytes(&[0x48, 0x01, 0xF8]); // add rax, rdi
            w.put_nop_n(18);
            w.put_ret();
            arena.commit(&slice).expect("commit");
        }
        let f: UnaryFn = unsafe { core::mem::transmute(slice.pc) };
        (slice, f)
    }

    /// JIT a function computing `x + 100`.
    fn make_add_100(arena: &Arc<CodeArena>) -> (CodeSlice, UnaryFn) {
        let slice = arena.alloc(64).expect("alloc");
        unsafe {
            let mut w = X86_64Writer::new(slice.data, slice.size, slice.data as u64);
            w.put_bytes(&[0x48, 0x8D, 0x47, 0x64]); // lea rax, [rdi+0x64]
            w.put_nop_n(18);
            w.put_ret();
            arena.commit(&slice).expect("commit");
        }
        let f: UnaryFn = unsafe { core::mem::transmute(slice.pc) };
        (slice, f)
    }

    #[test]
    fn hook_redirects_and_trampoline_calls_original() {
        let _g = crate::lock_hook_tests();
        let arena = Arc::new(CodeArena::new());

        let (_f_mem, f) = make_double(&arena);
        let (_r_mem, r) = make_add_100(&arena);
        assert_eq!(f(7), 14);

        let holder = AtomicU64::new(0);
        let mut det = Detour::new(arena.clone(), f as *mut c_void, r as usize as u64, &holder);
        det.hook().expect("hook");

        // Target now runs the redirect.
        let f = std::hint::black_box(f);
        assert_eq!(f(7), 107);

        // The holder cell names a trampoline with the original behavior.
        let tramp = holder.load(Ordering::Acquire);
        assert_ne!(tramp, 0);
        let orig: UnaryFn = unsafe { core::mem::transmute(tramp as usize) };
        assert_eq!(orig(7), 14);

        assert!(det.unhook());
        let f = std::hint::black_box(f);
        assert_eq!(f(7), 14);
    }

    #[test]
    fn drop_restores_the_prologue() {
        let _g = crate::lock_hook_tests();
        let arena = Arc::new(CodeArena::new());

        let (_f_mem, f) = make_double(&arena);
        let (_r_mem, r) = make_add_100(&arena);
        let holder = AtomicU64::new(0);

        {
            let mut det =
                Detour::new(arena.clone(), f as *mut c_void, r as usize as u64, &holder);
            det.hook().expect("hook");
            let f = std::hint::black_box(f);
            assert_eq!(f(1), 101);
        }

        let f = std::hint::black_box(f);
        assert_eq!(f(1), 2);
    }

    #[test]
    fn unhook_without_hook_reports_false() {
        let arena = Arc::new(CodeArena::new());
        let (_f_mem, f) = make_double(&arena);
        let holder = AtomicU64::new(0);
        let mut det = Detour::new(arena, f as *mut c_void, 0x1000, &holder);
        assert!(!det.unhook());
    }

    #[test]
    fn hook_survives_many_calls() {
        let _g = crate::lock_hook_tests();
        let arena = Arc::new(CodeArena::new());

        let (_f_mem, f) = make_double(&arena);
        let (_r_mem, r) = make_add_100(&arena);
        let holder = AtomicU64::new(0);
        let mut det = Detour::new(arena.clone(), f as *mut c_void, r as usize as u64, &holder);
        det.hook().expect("hook");

        let f = std::hint::black_box(f);
        for n in 0..2000i64 {
            assert_eq!(f(n), n + 100, "redirect must stay active on call #{n}");
        }

        assert!(det.unhook());
        assert_eq!(f(3), 6);
    }
}
