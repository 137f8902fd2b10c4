//! waylay-plugin: runtime function interception for native x86-64 code.
//!
//! A caller registers interest in a free function (by address) or a virtual
//! method (by instance and slot); the plugin JIT-synthesizes an adapter stub
//! matching the target's signature and installs it through the detour or
//! vtable-swap engine. The stub funnels every invocation through ordered
//! pre/post observer lists that may inspect and mutate arguments and the
//! return value, skip the original call, or suppress the post pass.

#[cfg(not(target_arch = "x86_64"))]
compile_error!("waylay-plugin targets x86-64 hosts");

pub mod api;
pub mod callback;
pub mod dispatch;
pub mod probe;
pub mod registry;
pub mod stub;
pub mod types;

pub use callback::{Callback, CallbackHandler};
pub use registry::HookRegistry;
pub use types::{CallbackType, DataType, Property, ReturnAction, ReturnFlag};

/// Process-global lock for tests that patch executable code.
#[cfg(test)]
pub(crate) fn lock_hook_tests() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

/// JIT-built hook targets with known, relocatable prologues.
#[cfg(test)]
pub(crate) mod test_targets {
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;
    use waylay_intercept::arch::x86_64::writer::X86_64Writer;
    use waylay_intercept::{CodeArena, CodeSlice};

    pub type I64Fn = extern "C" fn(i64) -> i64;
    pub type F64Fn = extern "C" fn(f64) -> f64;
    pub type StrFn = extern "C" fn(*const core::ffi::c_char) -> *const core::ffi::c_char;

    /// Emit `body`, NOP padding, and a RET. The padding guarantees enough
    /// relocatable bytes for either redirect size.
    pub fn jit(arena: &Arc<CodeArena>, body: &[u8]) -> CodeSlice {
        let slice = arena.alloc(64).expect("alloc");
        unsafe {
            let mut w = X86_64Writer::new(slice.data, slice.size, slice.data as u64);
            w.put_bytes(body);
            w.put_nop_n(24);
            w.put_ret();
            arena.commit(&slice).expect("commit");
        }
        slice
    }

    /// `f(x) = x * 2`
    pub fn make_double(arena: &Arc<CodeArena>) -> (CodeSlice, I64Fn) {
        let slice = jit(
            arena,
            &[
                0x48, 0x89, 0xF8, // mov rax, rdi
                0x48, 0x01, 0xF8, // add rax, rdi
            ],
        );
        let f = unsafe { core::mem::transmute::<*const u8, I64Fn>(slice.pc) };
        (slice, f)
    }

    /// `f(p) = p` — used for pointer/string identity targets.
    pub fn make_identity(arena: &Arc<CodeArena>) -> (CodeSlice, StrFn) {
        let slice = jit(arena, &[0x48, 0x89, 0xF8]); // mov rax, rdi
        let f = unsafe { core::mem::transmute::<*const u8, StrFn>(slice.pc) };
        (slice, f)
    }

    /// `f(x) = x * 2`, bumping `counter` on every entry.
    pub fn make_counting_double(
        arena: &Arc<CodeArena>,
        counter: &'static AtomicU64,
    ) -> (CodeSlice, I64Fn) {
        let addr = (counter as *const AtomicU64 as u64).to_le_bytes();
        let mut body = vec![0x49, 0xBB]; // mov r11, imm64
        body.extend_from_slice(&addr);
        body.extend_from_slice(&[0xF0, 0x49, 0xFF, 0x03]); // lock inc qword [r11]
        body.extend_from_slice(&[0x48, 0x89, 0xF8, 0x48, 0x01, 0xF8]); // rax = rdi*2
        let slice = jit(arena, &body);
        let f = unsafe { core::mem::transmute::<*const u8, I64Fn>(slice.pc) };
        (slice, f)
    }

    /// `f(x) = x + x` over f64.
    pub fn make_double_f64(arena: &Arc<CodeArena>) -> (CodeSlice, F64Fn) {
        let slice = jit(arena, &[0xF2, 0x0F, 0x58, 0xC0]); // addsd xmm0, xmm0
        let f = unsafe { core::mem::transmute::<*const u8, F64Fn>(slice.pc) };
        (slice, f)
    }
}
