//! waylay-intercept: low-level interception engines for the waylay plugin.
//!
//! This crate owns everything that touches raw machine code: the x86-64
//! instruction writer and prologue relocator, the executable-memory arena,
//! code patching, the inline detour engine and the vtable-swap engine.
//! Policy (which functions to hook, what the adapter stubs look like) lives
//! in `waylay-plugin`.

pub mod arch;
pub mod code;
#[cfg(target_arch = "x86_64")]
pub mod detour;
pub mod types;
pub mod vtable;

pub use code::arena::{CodeArena, CodeSlice};
#[cfg(target_arch = "x86_64")]
pub use detour::Detour;
pub use types::HookError;
pub use vtable::VTableSwap;

/// Process-global lock for tests that modify executable code.
///
/// Tests that patch function prologues must hold this lock so concurrent
/// patching of the same page cannot fault a sibling test.
#[cfg(test)]
pub(crate) fn lock_hook_tests() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}
