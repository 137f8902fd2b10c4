//! The target registry: singleton owner of every interception.
//!
//! Four indices live behind one mutex: `detours` and `vhooks` hold the
//! installed engines, `tables` the per-instance redirect/original maps, and
//! `callbacks` the owning Callback keyed by `(address, slot)` with slot −1
//! for free-function hooks. A stub observable through a lookup is always
//! fully installed; the stubs themselves never touch the registry.

use crate::callback::Callback;
use crate::dispatch;
use crate::probe;
use crate::types::{DataType, Signature};
use core::ffi::c_void;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use waylay_intercept::{CodeArena, Detour, VTableSwap};

/// Synthetic slot keying a free-function hook, distinct from any vtable slot.
const DETOUR_SLOT: i32 = -1;

#[derive(Default)]
struct VTableState {
    /// slot → adapter stub; the source of truth for building the shadow table.
    redirect: BTreeMap<i32, u64>,
    /// slot → function pointer previously at that slot.
    originals: BTreeMap<i32, u64>,
}

#[derive(Default)]
struct Inner {
    detours: BTreeMap<usize, Detour>,
    vhooks: BTreeMap<usize, VTableSwap>,
    tables: BTreeMap<usize, VTableState>,
    callbacks: BTreeMap<(usize, i32), Box<Callback>>,
}

pub struct HookRegistry {
    arena: Arc<CodeArena>,
    inner: Mutex<Inner>,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            arena: Arc::new(CodeArena::new()),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// The process-wide registry the C surface dispatches through.
    pub fn obtain() -> &'static HookRegistry {
        static INSTANCE: OnceLock<HookRegistry> = OnceLock::new();
        INSTANCE.get_or_init(HookRegistry::new)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn expose(cb: &Callback) -> *mut Callback {
        cb as *const Callback as *mut Callback
    }

    fn fresh_callback(&self, ret: DataType, args: &[DataType]) -> (Box<Callback>, u64) {
        let callback = Callback::new(Arc::downgrade(&self.arena));
        let sig = Signature::from_data(ret, args);
        let jit = callback.compile(&sig, dispatch::pre_dispatch, dispatch::post_dispatch);
        (callback, jit)
    }

    // ── Free-function hooks ──────────────────────────────────────────

    pub fn hook_detour(
        &self,
        func: *mut c_void,
        ret: DataType,
        args: &[DataType],
    ) -> *mut Callback {
        if func.is_null() {
            return core::ptr::null_mut();
        }
        let key = func as usize;
        let mut inner = self.lock();

        if inner.detours.contains_key(&key) {
            if let Some(cb) = inner.callbacks.get(&(key, DETOUR_SLOT)) {
                return Self::expose(cb);
            }
        }

        let (callback, jit) = self.fresh_callback(ret, args);
        if jit == 0 {
            warn!(
                "detour refused at {func:p}: {}",
                callback.error().unwrap_or_default()
            );
            return core::ptr::null_mut();
        }

        let mut detour = Detour::new(
            self.arena.clone(),
            func,
            jit,
            callback.trampoline_holder(),
        );
        if let Err(err) = detour.hook() {
            warn!("detour install failed at {func:p}: {err:?}");
            return core::ptr::null_mut();
        }

        debug!("detour installed at {func:p}");
        inner.detours.insert(key, detour);
        let exposed = Self::expose(&callback);
        inner.callbacks.insert((key, DETOUR_SLOT), callback);
        exposed
    }

    pub fn unhook_detour(&self, func: *mut c_void) -> bool {
        if func.is_null() {
            return false;
        }
        let key = func as usize;
        let mut inner = self.lock();

        let Some(mut detour) = inner.detours.remove(&key) else {
            return false;
        };
        detour.unhook();
        inner.callbacks.remove(&(key, DETOUR_SLOT));
        debug!("detour removed at {func:p}");
        true
    }

    pub fn find_detour(&self, func: *mut c_void) -> *mut Callback {
        let key = func as usize;
        let inner = self.lock();
        if !inner.detours.contains_key(&key) {
            return core::ptr::null_mut();
        }
        inner
            .callbacks
            .get(&(key, DETOUR_SLOT))
            .map_or(core::ptr::null_mut(), |cb| Self::expose(cb))
    }

    // ── Virtual hooks ────────────────────────────────────────────────

    pub fn hook_virtual(
        &self,
        class: *mut c_void,
        index: i32,
        ret: DataType,
        args: &[DataType],
    ) -> *mut Callback {
        if class.is_null() || index == DETOUR_SLOT {
            return core::ptr::null_mut();
        }
        let key = class as usize;
        let mut inner = self.lock();

        if inner.vhooks.contains_key(&key) {
            if let Some(cb) = inner.callbacks.get(&(key, index)) {
                return Self::expose(cb);
            }
        }

        // Compile before touching the live swap so a refused signature
        // leaves the instance fully hooked as it was.
        let (callback, jit) = self.fresh_callback(ret, args);
        if jit == 0 {
            warn!(
                "virtual hook refused at {class:p} slot {index}: {}",
                callback.error().unwrap_or_default()
            );
            return core::ptr::null_mut();
        }

        // Drop any live swap; it is rebuilt over the enlarged redirect map.
        inner.vhooks.remove(&key);

        let mut swap = VTableSwap::new(class);
        let (installed, original) = {
            let state = inner.tables.entry(key).or_default();
            state.redirect.insert(index, jit);
            let installed =
                unsafe { swap.hook(&state.redirect, &mut state.originals) }.is_ok();
            (installed, state.originals.get(&index).copied())
        };

        if !installed {
            self.rollback_vtable(&mut inner, class, key, index);
            warn!("vtable swap failed at {class:p} slot {index}");
            return core::ptr::null_mut();
        }

        callback
            .trampoline_holder()
            .store(original.unwrap_or(0), Ordering::Release);

        debug!("virtual hook installed at {class:p} slot {index}");
        inner.vhooks.insert(key, swap);
        let exposed = Self::expose(&callback);
        inner.callbacks.insert((key, index), callback);
        exposed
    }

    /// Undo a failed slot insertion, reinstating the previous redirect set.
    fn rollback_vtable(&self, inner: &mut Inner, class: *mut c_void, key: usize, index: i32) {
        let emptied = match inner.tables.get_mut(&key) {
            Some(state) => {
                state.redirect.remove(&index);
                state.redirect.is_empty()
            }
            None => return,
        };
        if emptied {
            inner.tables.remove(&key);
            return;
        }
        let mut previous = VTableSwap::new(class);
        let restored = {
            let state = inner.tables.get_mut(&key).unwrap();
            unsafe { previous.hook(&state.redirect, &mut state.originals) }.is_ok()
        };
        if restored {
            inner.vhooks.insert(key, previous);
        }
    }

    pub fn hook_virtual_by_func(
        &self,
        class: *mut c_void,
        func: *mut c_void,
        ret: DataType,
        args: &[DataType],
    ) -> *mut Callback {
        self.hook_virtual(class, probe::vtable_index(func), ret, args)
    }

    pub fn unhook_virtual(&self, class: *mut c_void, index: i32) -> bool {
        if class.is_null() || index == DETOUR_SLOT {
            return false;
        }
        let key = class as usize;
        let mut inner = self.lock();

        let Some(mut swap) = inner.vhooks.remove(&key) else {
            return false;
        };
        swap.unhook();
        inner.callbacks.remove(&(key, index));

        if inner.tables.contains_key(&key) {
            let emptied = {
                let state = inner.tables.get_mut(&key).unwrap();
                state.redirect.remove(&index);
                state.redirect.is_empty()
            };
            if emptied {
                inner.tables.remove(&key);
                debug!("last virtual hook removed at {class:p}");
                return true;
            }

            // Rebuild the swap over the remaining redirects.
            let mut next = VTableSwap::new(class);
            let rebuilt = {
                let state = inner.tables.get_mut(&key).unwrap();
                unsafe { next.hook(&state.redirect, &mut state.originals) }.is_ok()
            };
            if !rebuilt {
                warn!("vtable rebuild failed at {class:p}");
                return false;
            }
            inner.vhooks.insert(key, next);
        }

        debug!("virtual hook removed at {class:p} slot {index}");
        true
    }

    pub fn unhook_virtual_by_func(&self, class: *mut c_void, func: *mut c_void) -> bool {
        self.unhook_virtual(class, probe::vtable_index(func))
    }

    pub fn find_virtual(&self, class: *mut c_void, index: i32) -> *mut Callback {
        let key = class as usize;
        let inner = self.lock();
        if !inner.vhooks.contains_key(&key) {
            return core::ptr::null_mut();
        }
        inner
            .callbacks
            .get(&(key, index))
            .map_or(core::ptr::null_mut(), |cb| Self::expose(cb))
    }

    pub fn find_virtual_by_func(&self, class: *mut c_void, func: *mut c_void) -> *mut Callback {
        self.find_virtual(class, probe::vtable_index(func))
    }

    // ── Bulk removal and lookups ─────────────────────────────────────

    pub fn unhook_all(&self) {
        let mut inner = self.lock();
        inner.detours.clear();
        inner.vhooks.clear();
        inner.tables.clear();
        inner.callbacks.clear();
    }

    pub fn unhook_all_virtual(&self, class: *mut c_void) {
        let key = class as usize;
        let mut inner = self.lock();

        if let Some(mut swap) = inner.vhooks.remove(&key) {
            swap.unhook();
            if let Some(state) = inner.tables.remove(&key) {
                for &slot in state.redirect.keys() {
                    inner.callbacks.remove(&(key, slot));
                }
            }
        }
    }

    /// Map an adapter-stub address back to the original it displaced.
    ///
    /// Unrelated addresses pass through unchanged while the instance has any
    /// redirects; an unknown instance yields null.
    pub fn find_original_addr(&self, class: *mut c_void, addr: *mut c_void) -> *mut c_void {
        let inner = self.lock();
        let Some(state) = inner.tables.get(&(class as usize)) else {
            return core::ptr::null_mut();
        };
        for (&slot, &stub) in &state.redirect {
            if stub as usize == addr as usize {
                return state.originals.get(&slot).copied().unwrap_or(0) as *mut c_void;
            }
        }
        addr
    }

    pub fn vtable_index(&self, func: *mut c_void) -> i32 {
        probe::vtable_index(func)
    }
}
