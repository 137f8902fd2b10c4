use crate::types::HookError;

/// Page-granular span covering `len` bytes at `addr`: (first page, span
/// length in bytes). Shared with the probe's protection guard.
pub(crate) fn page_span(addr: usize, len: usize) -> (usize, usize) {
    debug_assert!(len > 0);
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
    let first = addr - addr % page;
    let last = (addr + len - 1) - (addr + len - 1) % page;
    (first, last - first + page)
}

unsafe fn set_prot(start: usize, len: usize, prot: libc::c_int) -> bool {
    libc::mprotect(start as *mut libc::c_void, len, prot) == 0
}

/// Rewrite `size` bytes of live code at `addr`.
///
/// Opens the covering pages as RWX — code sharing a page keeps executing
/// while `apply` writes — then drops write access again. x86-64 keeps data
/// and instruction caches coherent, so the new bytes are fetchable as soon
/// as the write lands.
///
/// # Safety
/// `addr` must point to `size` bytes of executable memory and `apply` must
/// write only within that range.
pub unsafe fn patch_code(
    addr: *mut u8,
    size: usize,
    apply: impl FnOnce(*mut u8),
) -> Result<(), HookError> {
    if size == 0 {
        return Ok(());
    }

    let (start, len) = page_span(addr as usize, size);
    if !set_prot(start, len, libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC) {
        return Err(HookError::ProtectionFailed);
    }

    apply(addr);

    set_prot(start, len, libc::PROT_READ | libc::PROT_EXEC);
    Ok(())
}
