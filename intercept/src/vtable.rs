use crate::types::HookError;
use core::ffi::c_void;
use std::collections::BTreeMap;

/// Upper bound on scanned vtable entries; tables end well before this, the
/// cap only bounds the scan when the terminator heuristic misses.
const MAX_VFUNCS: usize = 512;

/// Shadow-vtable swap over a single class instance.
///
/// `hook()` copies the instance's live vtable into an owned shadow table,
/// replaces the redirected slots, and rewrites the instance's vtable pointer
/// to the shadow. Only this instance is affected; other instances of the
/// class keep the original table. `unhook()` restores the saved pointer.
pub struct VTableSwap {
    object: *mut *const usize,
    original_vptr: *const usize,
    shadow: Vec<usize>,
    hooked: bool,
}

// The object pointer is caller-supplied; the registry serializes access.
unsafe impl Send for VTableSwap {}

impl VTableSwap {
    pub fn new(object: *mut c_void) -> Self {
        Self {
            object: object as *mut *const usize,
            original_vptr: core::ptr::null(),
            shadow: Vec::new(),
            hooked: false,
        }
    }

    /// Number of entries in the table at `vptr`, scanning to the first null.
    unsafe fn count_vfuncs(vptr: *const usize) -> usize {
        let mut count = 0;
        while count < MAX_VFUNCS && vptr.add(count).read() != 0 {
            count += 1;
        }
        count
    }

    /// Install the swap.
    ///
    /// Records the original function pointer of every redirected slot into
    /// `originals` before replacing it in the shadow.
    ///
    /// # Safety
    /// `object` must point to a live instance whose first word is a vtable
    /// pointer, and every redirected slot must be a valid index into it.
    pub unsafe fn hook(
        &mut self,
        redirects: &BTreeMap<i32, u64>,
        originals: &mut BTreeMap<i32, u64>,
    ) -> Result<(), HookError> {
        if self.hooked {
            return Ok(());
        }

        let vptr = self.object.read();
        if vptr.is_null() {
            return Err(HookError::Unsupported);
        }

        let count = Self::count_vfuncs(vptr);
        let mut shadow: Vec<usize> = (0..count).map(|i| vptr.add(i).read()).collect();

        for (&slot, &stub) in redirects {
            let idx = usize::try_from(slot).map_err(|_| HookError::SlotOutOfRange)?;
            if idx >= shadow.len() {
                return Err(HookError::SlotOutOfRange);
            }
            originals.insert(slot, shadow[idx] as u64);
            shadow[idx] = stub as usize;
        }

        self.original_vptr = vptr;
        self.shadow = shadow;
        self.object.write(self.shadow.as_ptr());
        self.hooked = true;
        Ok(())
    }

    pub fn unhook(&mut self) -> bool {
        if !self.hooked {
            return false;
        }
        unsafe {
            self.object.write(self.original_vptr);
        }
        self.hooked = false;
        true
    }

    pub fn is_hooked(&self) -> bool {
        self.hooked
    }
}

impl Drop for VTableSwap {
    fn drop(&mut self) {
        if self.hooked {
            self.unhook();
        }
    }
}
