use crate::code::patcher::page_span;
use crate::types::HookError;

/// Scoped read permission over an address range.
///
/// Records the range's current protection, adds read access, and restores
/// the recorded protection on drop. Used by code that must inspect bytes it
/// does not own (e.g. decoding a virtual-call thunk) without leaving the
/// mapping more permissive than it found it.
#[derive(Debug)]
pub struct ReadGuard {
    page_start: usize,
    map_size: usize,
    prior: libc::c_int,
}

/// Current protection bits of the page containing `addr`, as PROT_* flags.
fn query_protection(addr: usize) -> Result<libc::c_int, HookError> {
    #[cfg(target_os = "linux")]
    {
        let maps = std::fs::read_to_string("/proc/self/maps")
            .map_err(|_| HookError::ProtectionFailed)?;
        for line in maps.lines() {
            let mut fields = line.split_whitespace();
            let Some(range) = fields.next() else { continue };
            let Some(perms) = fields.next() else { continue };
            let Some((start_s, end_s)) = range.split_once('-') else { continue };
            let Ok(start) = usize::from_str_radix(start_s, 16) else { continue };
            let Ok(end) = usize::from_str_radix(end_s, 16) else { continue };
            if addr >= start && addr < end {
                let perms = perms.as_bytes();
                let mut prot = 0;
                if perms[0] == b'r' {
                    prot |= libc::PROT_READ;
                }
                if perms[1] == b'w' {
                    prot |= libc::PROT_WRITE;
                }
                if perms[2] == b'x' {
                    prot |= libc::PROT_EXEC;
                }
                return Ok(prot);
            }
        }
        Err(HookError::ProtectionFailed)
    }

    #[cfg(target_os = "macos")]
    unsafe {
        use mach2::kern_return::KERN_SUCCESS;
        use mach2::traps::mach_task_self;
        use mach2::vm_region::{vm_region_basic_info_64, VM_REGION_BASIC_INFO_64};
        use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};

        let mut region_addr: mach_vm_address_t = addr as u64;
        let mut region_size: mach_vm_size_t = 0;
        let mut info: vm_region_basic_info_64 = core::mem::zeroed();
        let mut info_count = vm_region_basic_info_64::count();
        let mut object_name: u32 = 0;

        let kr = mach2::vm::mach_vm_region(
            mach_task_self(),
            &mut region_addr,
            &mut region_size,
            VM_REGION_BASIC_INFO_64,
            (&mut info as *mut _) as mach2::vm_region::vm_region_info_t,
            &mut info_count,
            &mut object_name,
        );
        if kr != KERN_SUCCESS || (addr as u64) < region_addr {
            return Err(HookError::ProtectionFailed);
        }

        // VM_PROT_{READ,WRITE,EXECUTE} share the PROT_* bit values.
        Ok(info.protection as libc::c_int & (libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = addr;
        Err(HookError::Unsupported)
    }
}

impl ReadGuard {
    /// Grant read access to `[addr, addr + len)`, remembering what to restore.
    ///
    /// # Safety
    /// `addr` must lie within a mapped region of at least `len` bytes.
    pub unsafe fn new(addr: *const u8, len: usize) -> Result<Self, HookError> {
        let (page_start, map_size) = page_span(addr as usize, len);

        let prior = query_protection(addr as usize)?;

        if prior & libc::PROT_READ == 0
            && libc::mprotect(
                page_start as *mut libc::c_void,
                map_size,
                prior | libc::PROT_READ,
            ) != 0
        {
            return Err(HookError::ProtectionFailed);
        }

        Ok(Self {
            page_start,
            map_size,
            prior,
        })
    }
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        if self.prior & libc::PROT_READ == 0 {
            unsafe {
                libc::mprotect(
                    self.page_start as *mut libc::c_void,
                    self.map_size,
                    self.prior,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_over_readable_code_is_transparent() {
        let anchor = guard_over_readable_code_is_transparent as *const u8;
        unsafe {
            let _g = ReadGuard::new(anchor, 12).expect("guard");
            // The probe-sized window must be readable while guarded.
            let _bytes = core::ptr::read_unaligned(anchor as *const [u8; 12]);
        }
    }

    #[test]
    fn query_reports_exec_for_code_and_write_for_data() {
        let code = query_reports_exec_for_code_and_write_for_data as *const u8 as usize;
        let prot = query_protection(code).expect("query code");
        assert_ne!(prot & libc::PROT_EXEC, 0);

        let data = Box::new(0u64);
        let prot = query_protection(&*data as *const u64 as usize).expect("query heap");
        assert_ne!(prot & libc::PROT_WRITE, 0);
    }
}
