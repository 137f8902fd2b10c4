//! Virtual-call probe: recover a vtable slot index from a pointer-to-member
//! captured as a raw address.
//!
//! Two representations exist in the wild. Itanium-ABI compilers encode the
//! slot arithmetically inside the member pointer itself; MSVC hands out the
//! address of a small thunk that loads the vtable and jumps through it. The
//! thunk matcher is pure byte logic parameterized on word size so it stays
//! testable on any host.

use core::ffi::c_void;
use waylay_intercept::code::protect::ReadGuard;

/// Bytes the probe examines at a thunk address.
const PROBE_LEN: usize = 12;

/// Slot index for a member pointer on the running platform, or −1 when the
/// function is not a virtual call.
pub fn vtable_index(func: *const c_void) -> i32 {
    if func.is_null() {
        return -1;
    }

    #[cfg(windows)]
    {
        msvc_thunk_index(func as *const u8)
    }

    #[cfg(not(windows))]
    {
        // Itanium member pointer: { addr_or_vtoff+1, delta }. An odd first
        // word marks a virtual member; the slot is the vtable byte offset
        // divided by the word size.
        let word = core::mem::size_of::<usize>();
        let raw = func as usize;
        if raw & 1 == 1 {
            ((raw - 1) / word) as i32
        } else {
            -1
        }
    }
}

/// Decode an MSVC virtual-call thunk prologue.
///
/// Recognized shapes, per word size:
/// - x64:          `48 8B 01` (mov rax, [rcx])
/// - x86:          `8B 01` (mov eax, [ecx])
/// - x86 variadic: `8B 44 24 04 8B 00` (this passed on the stack)
///
/// each followed by `FF 60 imm8`, `FF A0 imm32`, or `FF 20` jumping through
/// the table. Returns the slot index, or −1 when nothing matches.
pub fn decode_thunk(bytes: &[u8; PROBE_LEN], word: usize) -> i32 {
    let mut at = if word == 8 && bytes[..3] == [0x48, 0x8B, 0x01] {
        3
    } else if bytes[..2] == [0x8B, 0x01] {
        2
    } else if bytes[..6] == [0x8B, 0x44, 0x24, 0x04, 0x8B, 0x00] {
        6
    } else {
        return -1;
    };

    if bytes[at] != 0xFF {
        return -1;
    }
    at += 1;

    match bytes[at] {
        0x60 => bytes[at + 1] as i32 / word as i32,
        0xA0 => i32::from_le_bytes(bytes[at + 1..at + 5].try_into().unwrap()) / word as i32,
        0x20 => 0,
        _ => -1,
    }
}

/// Follow an optional leading near-jump and decode the thunk at `addr`.
///
/// Takes read permission over the examined window and restores the prior
/// protection on exit; never writes.
pub fn msvc_thunk_index(addr: *const u8) -> i32 {
    let Some(bytes) = read_probe_window(addr) else {
        return -1;
    };

    if bytes[0] == 0xE9 {
        let disp = i32::from_le_bytes(bytes[1..5].try_into().unwrap());
        let target = (addr as usize)
            .wrapping_add(5)
            .wrapping_add(disp as isize as usize) as *const u8;
        let Some(bytes) = read_probe_window(target) else {
            return -1;
        };
        return decode_thunk(&bytes, core::mem::size_of::<usize>());
    }

    decode_thunk(&bytes, core::mem::size_of::<usize>())
}

fn read_probe_window(addr: *const u8) -> Option<[u8; PROBE_LEN]> {
    unsafe {
        let _guard = ReadGuard::new(addr, PROBE_LEN).ok()?;
        Some(core::ptr::read_unaligned(addr as *const [u8; PROBE_LEN]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thunk(bytes: &[u8]) -> [u8; PROBE_LEN] {
        let mut buf = [0u8; PROBE_LEN];
        buf[..bytes.len()].copy_from_slice(bytes);
        buf
    }

    #[test]
    fn x64_thunk_with_imm8() {
        // mov rax, [rcx]; jmp [rax+0x20]
        let t = thunk(&[0x48, 0x8B, 0x01, 0xFF, 0x60, 0x20]);
        assert_eq!(decode_thunk(&t, 8), 4);
    }

    #[test]
    fn x64_thunk_with_imm32() {
        // mov rax, [rcx]; jmp [rax+0x318]
        let t = thunk(&[0x48, 0x8B, 0x01, 0xFF, 0xA0, 0x18, 0x03, 0x00, 0x00]);
        assert_eq!(decode_thunk(&t, 8), 0x318 / 8);
    }

    #[test]
    fn slot_zero_uses_the_bare_indirect_jump() {
        // mov rax, [rcx]; jmp [rax]
        let t = thunk(&[0x48, 0x8B, 0x01, 0xFF, 0x20]);
        assert_eq!(decode_thunk(&t, 8), 0);
    }

    #[test]
    fn x86_thunk_with_imm8() {
        // mov eax, [ecx]; jmp [eax+0x8]
        let t = thunk(&[0x8B, 0x01, 0xFF, 0x60, 0x08]);
        assert_eq!(decode_thunk(&t, 4), 2);
    }

    #[test]
    fn x86_variadic_thunk() {
        // mov eax, [esp+4]; mov eax, [eax]; jmp [eax+0x318]
        let t = thunk(&[0x8B, 0x44, 0x24, 0x04, 0x8B, 0x00, 0xFF, 0xA0, 0x18, 0x03, 0x00, 0x00]);
        assert_eq!(decode_thunk(&t, 4), 0x318 / 4);
    }

    #[test]
    fn unknown_prologue_is_not_a_virtual_call() {
        let t = thunk(&[0x55, 0x48, 0x89, 0xE5]); // push rbp; mov rbp, rsp
        assert_eq!(decode_thunk(&t, 8), -1);
        // Right load, wrong jump.
        let t = thunk(&[0x48, 0x8B, 0x01, 0xC3]);
        assert_eq!(decode_thunk(&t, 8), -1);
        let t = thunk(&[0x48, 0x8B, 0x01, 0xFF, 0x61, 0x20]);
        assert_eq!(decode_thunk(&t, 8), -1);
    }

    #[test]
    #[cfg(not(windows))]
    fn itanium_rule_uses_parity() {
        let word = core::mem::size_of::<usize>();
        // Virtual members carry vtable offset + 1.
        assert_eq!(vtable_index((0 * word + 1) as *const c_void), 0);
        assert_eq!(vtable_index((2 * word + 1) as *const c_void), 2);
        assert_eq!(vtable_index((7 * word + 1) as *const c_void), 7);
        // Even values are plain function addresses.
        assert_eq!(vtable_index(0x4010 as *const c_void), -1);
        assert_eq!(vtable_index(core::ptr::null()), -1);
    }

    #[test]
    #[cfg(all(target_arch = "x86_64", not(windows)))]
    fn msvc_probe_follows_a_leading_near_jump() {
        // Lay a relay and a thunk out in one executable-ish buffer; the
        // probe only needs read access, a plain allocation suffices.
        let mut buf = vec![0u8; 64];
        // buf[0..5]: E9 <rel32 to buf[16]>
        buf[0] = 0xE9;
        buf[1..5].copy_from_slice(&11i32.to_le_bytes()); // 16 - (0 + 5)
        // buf[16..]: mov rax,[rcx]; jmp [rax+0x10]
        buf[16..22].copy_from_slice(&[0x48, 0x8B, 0x01, 0xFF, 0x60, 0x10]);

        assert_eq!(msvc_thunk_index(buf.as_ptr()), 2);
        // And without the relay.
        assert_eq!(msvc_thunk_index(buf[16..].as_ptr()), 2);
    }
}
