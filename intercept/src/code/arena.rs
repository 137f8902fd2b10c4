use crate::types::HookError;
use std::collections::HashMap;
use std::sync::Mutex;

/// A span of arena memory holding emitted code.
///
/// `data` is the writable address during emission; `pc` is the address the
/// code executes at. They are equal for this arena but kept distinct so
/// callers never conflate the two roles.
#[derive(Debug)]
pub struct CodeSlice {
    pub data: *mut u8,
    pub pc: *const u8,
    pub size: usize,
}

unsafe impl Send for CodeSlice {}
unsafe impl Sync for CodeSlice {}

/// Process-wide executable-memory arena.
///
/// Each allocation gets its own page-rounded mapping: emitted as RW, flipped
/// to RX by `commit`, and returned with `release`. Entries are tracked by
/// address so owners holding only the entry address can release it later.
#[derive(Debug)]
pub struct CodeArena {
    entries: Mutex<HashMap<usize, usize>>,
}

impl Default for CodeArena {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeArena {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    /// Allocate a fresh RW mapping of at least `len` bytes.
    pub fn alloc(&self, len: usize) -> Result<CodeSlice, HookError> {
        self.alloc_at(core::ptr::null(), len)
    }

    /// Allocate, hinting the kernel to place the mapping near `near`.
    ///
    /// The hint is best-effort (no MAP_FIXED); callers must measure the
    /// actual distance before choosing a near-jump encoding.
    pub fn alloc_near(&self, near: *const u8, len: usize) -> Result<CodeSlice, HookError> {
        self.alloc_at(near, len)
    }

    fn alloc_at(&self, hint: *const u8, len: usize) -> Result<CodeSlice, HookError> {
        let page = Self::page_size();
        let size = len.div_ceil(page).max(1) * page;
        let hint = (hint as usize) & !(page - 1);

        let ptr = unsafe {
            libc::mmap(
                hint as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(HookError::AllocationFailed);
        }

        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(ptr as usize, size);

        Ok(CodeSlice {
            data: ptr as *mut u8,
            pc: ptr as *const u8,
            size,
        })
    }

    /// Flip a slice to RX once emission is done.
    ///
    /// # Safety
    /// The slice must have come from this arena and hold valid instructions.
    pub unsafe fn commit(&self, slice: &CodeSlice) -> Result<(), HookError> {
        if libc::mprotect(
            slice.data as *mut libc::c_void,
            slice.size,
            libc::PROT_READ | libc::PROT_EXEC,
        ) != 0
        {
            return Err(HookError::ProtectionFailed);
        }
        Ok(())
    }

    /// Return an entry's pages to the system. Unknown addresses are ignored.
    pub fn release(&self, addr: u64) {
        let size = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(addr as usize));
        if let Some(size) = size {
            unsafe {
                libc::munmap(addr as usize as *mut libc::c_void, size);
            }
        }
    }
}

impl Drop for CodeArena {
    fn drop(&mut self) {
        let entries = self.entries.get_mut().unwrap_or_else(|e| e.into_inner());
        for (&addr, &size) in entries.iter() {
            unsafe {
                libc::munmap(addr as *mut libc::c_void, size);
            }
        }
    }
}
