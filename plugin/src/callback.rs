use crate::stub;
use crate::types::{CallbackType, Parameters, Property, Return, ReturnAction, Signature};
use std::collections::HashMap;
use std::ffi::{c_char, CStr, CString};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock, RwLockReadGuard, Weak};
use std::thread::{self, ThreadId};
use waylay_intercept::CodeArena;

/// Observer routine registered against a Callback.
pub type CallbackHandler = unsafe extern "C" fn(
    *mut Callback,
    *const Parameters,
    i32,
    *const Return,
    CallbackType,
) -> ReturnAction;

/// Dispatcher entry baked into a stub: `(callback, params, property, ret)`.
pub type CallbackEntry =
    unsafe extern "C" fn(*mut Callback, *const Parameters, *mut Property, *const Return);

#[inline]
fn handler_eq(a: CallbackHandler, b: CallbackHandler) -> bool {
    core::ptr::fn_addr_eq(a, b)
}

/// Per-target interception state.
///
/// Owns the adapter stub(s), the ordered pre/post observer lists, the
/// trampoline-holder cell the stub reads the original through, a per-thread
/// string store, and the stub compiler's error string. Stub memory is
/// released back to the arena on drop, if the arena is still alive.
pub struct Callback {
    arena: Weak<CodeArena>,
    entry: AtomicU64,
    secondary: AtomicU64,
    trampoline: AtomicU64,
    error: Mutex<Option<String>>,
    lists: RwLock<[Vec<CallbackHandler>; 2]>,
    storage: Mutex<HashMap<ThreadId, Vec<CString>>>,
}

/// Observer list plus the shared-lock token keeping it stable.
///
/// Dispatchers hold this for the whole iteration; add/remove block until it
/// is released.
pub struct Snapshot<'a> {
    guard: RwLockReadGuard<'a, [Vec<CallbackHandler>; 2]>,
    which: usize,
}

impl Snapshot<'_> {
    pub fn handlers(&self) -> &[CallbackHandler] {
        &self.guard[self.which]
    }
}

impl Callback {
    pub fn new(arena: Weak<CodeArena>) -> Box<Self> {
        Box::new(Self {
            arena,
            entry: AtomicU64::new(0),
            secondary: AtomicU64::new(0),
            trampoline: AtomicU64::new(0),
            error: Mutex::new(None),
            lists: RwLock::new([Vec::new(), Vec::new()]),
            storage: Mutex::new(HashMap::new()),
        })
    }

    // ── Stub compilation ─────────────────────────────────────────────

    /// Compile the single-stub shape, caching the entry across calls.
    ///
    /// Returns 0 on failure with the diagnostic captured in the error
    /// string; the Callback is then only usable for reporting it.
    pub fn compile(&self, sig: &Signature, pre: CallbackEntry, post: CallbackEntry) -> u64 {
        let cached = self.entry.load(Ordering::Acquire);
        if cached != 0 {
            return cached;
        }

        let jit = self.emit(|e| {
            stub::compile(
                e,
                sig,
                pre as usize as u64,
                post as usize as u64,
                self as *const Self as u64,
                self.trampoline_holder() as *const AtomicU64 as u64,
            )
        });
        if jit != 0 {
            self.entry.store(jit, Ordering::Release);
        }
        jit
    }

    /// Compile the paired shape: an independent stub per role, each driving
    /// a single observer entry with the role tag preloaded into the property.
    pub fn compile_pair(
        &self,
        sig: &Signature,
        pre: CallbackEntry,
        post: CallbackEntry,
    ) -> (u64, u64) {
        let context = self as *const Self as u64;

        let first = match self.entry.load(Ordering::Acquire) {
            0 => {
                let jit = self.emit(|e| {
                    stub::compile_role(e, sig, pre as usize as u64, context, CallbackType::Pre)
                });
                if jit != 0 {
                    self.entry.store(jit, Ordering::Release);
                }
                jit
            }
            cached => cached,
        };

        let second = match self.secondary.load(Ordering::Acquire) {
            0 => {
                let jit = self.emit(|e| {
                    stub::compile_role(e, sig, post as usize as u64, context, CallbackType::Post)
                });
                if jit != 0 {
                    self.secondary.store(jit, Ordering::Release);
                }
                jit
            }
            cached => cached,
        };

        (first, second)
    }

    fn emit(
        &self,
        run: impl FnOnce(&mut stub::x64::X64Emitter) -> Result<u64, stub::EmitError>,
    ) -> u64 {
        let Some(arena) = self.arena.upgrade() else {
            self.set_error("executable arena released".into());
            return 0;
        };
        let mut emitter = match stub::x64::X64Emitter::new(arena) {
            Ok(e) => e,
            Err(err) => {
                self.set_error(err.to_string());
                return 0;
            }
        };
        match run(&mut emitter) {
            Ok(entry) => entry,
            Err(err) => {
                self.set_error(err.to_string());
                0
            }
        }
    }

    // ── Observer lists ───────────────────────────────────────────────

    /// Append `handler` to the `ty` list unless already present (identity
    /// by address). Returns whether the list changed.
    pub fn add(&self, ty: CallbackType, handler: CallbackHandler) -> bool {
        let mut lists = self.lists.write().unwrap_or_else(|e| e.into_inner());
        let list = &mut lists[ty as usize];
        if list.iter().any(|&h| handler_eq(h, handler)) {
            return false;
        }
        list.push(handler);
        true
    }

    /// Remove the first identity match. Returns whether the list changed.
    pub fn remove(&self, ty: CallbackType, handler: CallbackHandler) -> bool {
        let mut lists = self.lists.write().unwrap_or_else(|e| e.into_inner());
        let list = &mut lists[ty as usize];
        match list.iter().position(|&h| handler_eq(h, handler)) {
            Some(at) => {
                list.remove(at);
                true
            }
            None => false,
        }
    }

    pub fn has(&self, ty: CallbackType, handler: CallbackHandler) -> bool {
        let lists = self.lists.read().unwrap_or_else(|e| e.into_inner());
        lists[ty as usize].iter().any(|&h| handler_eq(h, handler))
    }

    pub fn any(&self, ty: CallbackType) -> bool {
        let lists = self.lists.read().unwrap_or_else(|e| e.into_inner());
        !lists[ty as usize].is_empty()
    }

    pub fn any_registered(&self) -> bool {
        self.any(CallbackType::Pre) || self.any(CallbackType::Post)
    }

    /// The sole way dispatchers reach the observer callables.
    pub fn snapshot(&self, ty: CallbackType) -> Snapshot<'_> {
        Snapshot {
            guard: self.lists.read().unwrap_or_else(|e| e.into_inner()),
            which: ty as usize,
        }
    }

    // ── Per-thread string store ──────────────────────────────────────

    /// Copy `value` into the calling thread's bucket and return a pointer
    /// that stays valid until the next pre-dispatch on this thread.
    pub fn store(&self, value: &CStr) -> *const c_char {
        let mut storage = self.storage.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = storage.entry(thread::current().id()).or_default();
        bucket.push(CString::from(value));
        bucket.last().unwrap().as_ptr()
    }

    /// Empty the calling thread's bucket; runs at every pre-dispatch entry.
    pub fn cleanup(&self) {
        let mut storage = self.storage.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(bucket) = storage.get_mut(&thread::current().id()) {
            bucket.clear();
        }
    }

    // ── Cells and diagnostics ────────────────────────────────────────

    /// The one-word cell holding the current address of the original
    /// implementation; stubs read it indirectly on every invocation.
    pub fn trampoline_holder(&self) -> &AtomicU64 {
        &self.trampoline
    }

    pub fn entry(&self) -> u64 {
        self.entry.load(Ordering::Acquire)
    }

    pub fn secondary(&self) -> u64 {
        self.secondary.load(Ordering::Acquire)
    }

    fn set_error(&self, message: String) {
        *self.error.lock().unwrap_or_else(|e| e.into_inner()) = Some(message);
    }

    /// The compile diagnostic, reported only while no stub exists.
    pub fn error(&self) -> Option<String> {
        if self.entry.load(Ordering::Acquire) != 0 {
            return None;
        }
        self.error.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Drop for Callback {
    fn drop(&mut self) {
        if let Some(arena) = self.arena.upgrade() {
            let entry = self.entry.load(Ordering::Acquire);
            if entry != 0 {
                arena.release(entry);
            }
            let secondary = self.secondary.load(Ordering::Acquire);
            if secondary != 0 {
                arena.release(secondary);
            }
        }
    }
}
