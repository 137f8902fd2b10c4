use crate::arch::x86_64::writer::{Reg, X86_64Writer};
use crate::types::HookError;

// ── Decoded instruction ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    /// Position-independent, copy verbatim.
    Plain,
    /// ModRM with mod=0, rm=5; `disp_at` is the byte offset of the disp32.
    RipRel { disp_at: usize },
    /// EB rel8 / E9 rel32; `target_off` relative to the end of the instruction.
    Jmp { target_off: i64 },
    /// 70-7F rel8 / 0F 80-8F rel32.
    Jcc { cc: u8, target_off: i64 },
    /// E8 rel32.
    Call { target_off: i64 },
    /// RET / RET imm16 / INT3 / UD2 / HLT — relocation cannot continue past these.
    Stop,
}

#[derive(Debug, Clone, Copy)]
struct Insn {
    len: usize,
    op: Op,
}

// ── Opcode facts ─────────────────────────────────────────────────────

/// One-byte opcodes (after prefixes and REX) that carry a ModRM byte.
fn one_byte_has_modrm(opcode: u8) -> bool {
    matches!(opcode,
        0x00..=0x03 | 0x08..=0x0B | 0x10..=0x13 | 0x18..=0x1B
        | 0x20..=0x23 | 0x28..=0x2B | 0x30..=0x33 | 0x38..=0x3B
        | 0x62..=0x63 | 0x69 | 0x6B
        | 0x80..=0x8F
        | 0xC0..=0xC1 | 0xC4..=0xC7
        | 0xD0..=0xD3 | 0xD8..=0xDF
        | 0xF6..=0xF7 | 0xFE..=0xFF)
}

/// Immediate width for a one-byte opcode (common cases; 0 otherwise).
fn one_byte_imm_size(opcode: u8, has_66: bool, has_rexw: bool) -> usize {
    let w32 = if has_66 { 2 } else { 4 };
    match opcode {
        0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => 1, // ALU AL, imm8
        0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => w32, // ALU eAX, imm
        0x68 | 0x69 => w32,       // PUSH imm / IMUL imm
        0x6A | 0x6B => 1,         // PUSH imm8 / IMUL imm8
        0x80 | 0x82 | 0x83 => 1,  // group1 imm8
        0x81 => w32,              // group1 imm32
        0xA0..=0xA3 => if has_rexw { 8 } else { 4 }, // MOV moffs
        0xA8 => 1,                // TEST AL, imm8
        0xA9 => w32,              // TEST eAX, imm
        0xB0..=0xB7 => 1,         // MOV r8, imm8
        0xB8..=0xBF => if has_rexw { 8 } else { w32 }, // MOV r, imm
        0xC0..=0xC1 => 1,         // shift imm8
        0xC6 => 1,                // MOV r/m8, imm8
        0xC7 => w32,              // MOV r/m, imm
        0xC8 => 3,                // ENTER
        0xCD => 1,                // INT imm8
        0xE0..=0xE7 => 1,         // LOOPcc/JCXZ/IN/OUT
        _ => 0,
    }
}

/// Two-byte opcodes (0F xx) that carry a ModRM byte.
fn two_byte_has_modrm(opcode2: u8) -> bool {
    !matches!(opcode2,
        0x05..=0x09 | 0x0B | 0x0E | 0x30..=0x37 | 0x77
        | 0x80..=0x8F | 0xA0..=0xA1 | 0xA8..=0xA9)
}

/// Immediate width for a two-byte opcode.
fn two_byte_imm_size(opcode2: u8) -> usize {
    match opcode2 {
        0x70..=0x73 => 1,        // SSE shuffles/compares imm8
        0xA4 | 0xAC => 1,        // SHLD/SHRD imm8
        0xBA => 1,               // BT group imm8
        0xC2 | 0xC4..=0xC6 => 1, // CMPPS/PINSRW/PEXTRW/SHUFPS imm8
        _ => 0,
    }
}

/// ModRM + SIB + displacement span. Returns (bytes consumed, RIP disp32 offset
/// relative to the ModRM byte).
unsafe fn modrm_span(p: *const u8) -> (usize, Option<usize>) {
    let modrm = p.read();
    let mod_ = modrm >> 6;
    let rm = modrm & 7;
    let mut n = 1usize;
    if mod_ == 0 && rm == 5 {
        // RIP-relative
        let at = n;
        return (n + 4, Some(at));
    }
    if mod_ != 3 {
        if rm == 4 {
            let sib = p.add(1).read();
            n += 1;
            if mod_ == 0 && (sib & 7) == 5 {
                n += 4; // SIB with base=101 and mod=0 carries a disp32
            }
        }
        match mod_ {
            1 => n += 1,
            2 => n += 4,
            _ => {}
        }
    }
    (n, None)
}

/// Decode one instruction at `input`.
///
/// A minimal decoder: it knows prologue-typical instructions, every branch
/// form that needs rewriting, and enough ModRM/SIB structure to measure the
/// rest. It does not validate semantics.
unsafe fn decode(input: *const u8) -> Insn {
    let mut pos = 0usize;
    let mut has_66 = false;

    // Legacy prefixes.
    loop {
        match input.add(pos).read() {
            0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 | 0x67 | 0xF0 | 0xF2 | 0xF3 => pos += 1,
            0x66 => {
                has_66 = true;
                pos += 1;
            }
            _ => break,
        }
    }

    // REX.
    let mut has_rexw = false;
    if input.add(pos).read() & 0xF0 == 0x40 {
        has_rexw = input.add(pos).read() & 0x08 != 0;
        pos += 1;
    }

    let opcode = input.add(pos).read();
    pos += 1;

    let read_i8 = |at: usize| input.add(at).read() as i8 as i64;
    let read_i32 = |at: usize| (input.add(at) as *const i32).read_unaligned() as i64;

    match opcode {
        0xC3 => return Insn { len: pos, op: Op::Stop },
        0xC2 => return Insn { len: pos + 2, op: Op::Stop },
        0xCC | 0xF4 => return Insn { len: pos, op: Op::Stop },
        0xEB => {
            let off = read_i8(pos);
            return Insn { len: pos + 1, op: Op::Jmp { target_off: off } };
        }
        0xE9 => {
            let off = read_i32(pos);
            return Insn { len: pos + 4, op: Op::Jmp { target_off: off } };
        }
        0xE8 => {
            let off = read_i32(pos);
            return Insn { len: pos + 4, op: Op::Call { target_off: off } };
        }
        0x70..=0x7F => {
            let off = read_i8(pos);
            return Insn { len: pos + 1, op: Op::Jcc { cc: opcode & 0x0F, target_off: off } };
        }
        0x0F => {
            let opcode2 = input.add(pos).read();
            pos += 1;
            if opcode2 == 0x0B {
                return Insn { len: pos, op: Op::Stop }; // UD2
            }
            if let 0x80..=0x8F = opcode2 {
                let off = read_i32(pos);
                return Insn { len: pos + 4, op: Op::Jcc { cc: opcode2 & 0x0F, target_off: off } };
            }
            let mut rip = None;
            if two_byte_has_modrm(opcode2) {
                let (n, r) = modrm_span(input.add(pos));
                rip = r.map(|at| pos + at);
                pos += n;
            }
            pos += two_byte_imm_size(opcode2);
            let op = match rip {
                Some(disp_at) => Op::RipRel { disp_at },
                None => Op::Plain,
            };
            return Insn { len: pos, op };
        }
        _ => {}
    }

    let mut rip = None;
    if one_byte_has_modrm(opcode) {
        let modrm = input.add(pos).read();
        let (n, r) = modrm_span(input.add(pos));
        rip = r.map(|at| pos + at);
        pos += n;
        // F6/F7 group: only /0 and /1 (TEST) carry an immediate.
        if opcode == 0xF6 || opcode == 0xF7 {
            if (modrm >> 3) & 7 <= 1 {
                pos += if opcode == 0xF6 {
                    1
                } else if has_66 {
                    2
                } else {
                    4
                };
            }
            return Insn { len: pos, op: rip.map_or(Op::Plain, |disp_at| Op::RipRel { disp_at }) };
        }
    }
    pos += one_byte_imm_size(opcode, has_66, has_rexw);

    Insn { len: pos, op: rip.map_or(Op::Plain, |disp_at| Op::RipRel { disp_at }) }
}

// ── ENDBR64 detection ────────────────────────────────────────────────

/// Returns true if the bytes at `p` are ENDBR64 (F3 0F 1E FA).
pub fn is_endbr64(p: *const u8) -> bool {
    unsafe {
        p.read() == 0xF3
            && p.add(1).read() == 0x0F
            && p.add(2).read() == 0x1E
            && p.add(3).read() == 0xFA
    }
}

// ── Public API ───────────────────────────────────────────────────────

/// Copies instructions from a function prologue into a trampoline buffer,
/// rewriting anything position-dependent for the new program counter.
pub struct PrologueRelocator {
    input: *const u8,
    input_pc: u64,
}

impl PrologueRelocator {
    pub fn new(input: *const u8, input_pc: u64) -> Self {
        Self { input, input_pc }
    }

    /// Relocate at least `min_bytes` of instructions into `writer`.
    /// Returns the number of source bytes consumed.
    pub unsafe fn relocate_bytes(
        &mut self,
        writer: &mut X86_64Writer,
        min_bytes: usize,
    ) -> Result<usize, HookError> {
        let mut consumed = 0usize;

        while consumed < min_bytes {
            let src = self.input.add(consumed);
            let src_pc = self.input_pc + consumed as u64;
            let insn = decode(src);
            let end_pc = src_pc as i64 + insn.len as i64;

            match insn.op {
                Op::Stop => return Err(HookError::RelocationFailed),
                Op::Plain => {
                    writer.put_bytes(core::slice::from_raw_parts(src, insn.len));
                }
                Op::RipRel { disp_at } => {
                    // Rebase the disp32 so the operand still names the same
                    // absolute address from the trampoline's PC.
                    let old_disp = (src.add(disp_at) as *const i32).read_unaligned() as i64;
                    let abs_target = end_pc + old_disp;
                    let new_disp = abs_target - (writer.pc() as i64 + insn.len as i64);
                    if new_disp < i32::MIN as i64 || new_disp > i32::MAX as i64 {
                        return Err(HookError::RelocationFailed);
                    }
                    let mut patched = core::slice::from_raw_parts(src, insn.len).to_vec();
                    patched[disp_at..disp_at + 4]
                        .copy_from_slice(&(new_disp as i32).to_le_bytes());
                    writer.put_bytes(&patched);
                }
                Op::Jmp { target_off } => {
                    writer.put_jmp_address((end_pc + target_off) as u64);
                }
                Op::Jcc { cc, target_off } => {
                    // Inverted Jcc rel8 over a 16-byte far jump to the target.
                    writer.put_bytes(&[0x70 | (cc ^ 1), 16]);
                    writer.put_jmp_far((end_pc + target_off) as u64);
                }
                Op::Call { target_off } => {
                    if target_off == 0 {
                        // CALL $+0 PIC idiom: materialize the original return
                        // address instead of calling anywhere.
                        writer.put_mov_reg_imm64(Reg::R11, end_pc as u64);
                        writer.put_push_reg(Reg::R11);
                    } else {
                        writer.put_mov_reg_imm64(Reg::R11, (end_pc + target_off) as u64);
                        writer.put_call_reg(Reg::R11);
                    }
                }
            }

            consumed += insn.len;
        }

        Ok(consumed)
    }
}

/// How many prologue bytes can be relocated, stopping at RET/INT3/UD2/HLT or
/// once `min_bytes` is reached.
pub fn can_relocate(input: *const u8, min_bytes: usize) -> usize {
    let mut offset = 0usize;
    while offset < min_bytes {
        let insn = unsafe { decode(input.add(offset)) };
        if insn.op == Op::Stop {
            break;
        }
        offset += insn.len;
    }
    offset
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe fn decode_slice(code: &[u8]) -> Insn {
        decode(code.as_ptr())
    }

    #[test]
    fn decode_plain_prologue() {
        unsafe {
            // push rbp
            let i = decode_slice(&[0x55]);
            assert_eq!((i.len, i.op), (1, Op::Plain));
            // mov rbp, rsp
            let i = decode_slice(&[0x48, 0x89, 0xE5]);
            assert_eq!((i.len, i.op), (3, Op::Plain));
            // sub rsp, 0x80
            let i = decode_slice(&[0x48, 0x81, 0xEC, 0x80, 0x00, 0x00, 0x00]);
            assert_eq!((i.len, i.op), (7, Op::Plain));
            // movabs rax, imm64
            let i = decode_slice(&[0x48, 0xB8, 0, 0, 0, 0, 0, 0, 0, 0]);
            assert_eq!((i.len, i.op), (10, Op::Plain));
        }
    }

    #[test]
    fn decode_stoppers() {
        unsafe {
            assert_eq!(decode_slice(&[0xC3]).op, Op::Stop);
            assert_eq!(decode_slice(&[0xC2, 0x08, 0x00]).op, Op::Stop);
            assert_eq!(decode_slice(&[0xCC]).op, Op::Stop);
            assert_eq!(decode_slice(&[0x0F, 0x0B]).op, Op::Stop);
        }
    }

    #[test]
    fn decode_branches() {
        unsafe {
            let i = decode_slice(&[0xEB, 0x10]);
            assert_eq!((i.len, i.op), (2, Op::Jmp { target_off: 0x10 }));

            let i = decode_slice(&[0xE9, 0xFB, 0x00, 0x00, 0x00]);
            assert_eq!((i.len, i.op), (5, Op::Jmp { target_off: 0xFB }));

            let i = decode_slice(&[0xE8, 0xFB, 0x0F, 0x00, 0x00]);
            assert_eq!((i.len, i.op), (5, Op::Call { target_off: 0xFFB }));

            let i = decode_slice(&[0x74, 0x10]);
            assert_eq!((i.len, i.op), (2, Op::Jcc { cc: 4, target_off: 0x10 }));

            let i = decode_slice(&[0x0F, 0x84, 0xFB, 0x0F, 0x00, 0x00]);
            assert_eq!((i.len, i.op), (6, Op::Jcc { cc: 4, target_off: 0xFFB }));
        }
    }

    #[test]
    fn decode_rip_relative() {
        unsafe {
            // mov rax, [rip+0x10]
            let i = decode_slice(&[0x48, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00]);
            assert_eq!((i.len, i.op), (7, Op::RipRel { disp_at: 3 }));
            // lea rax, [rip+0x10]
            let i = decode_slice(&[0x48, 0x8D, 0x05, 0x10, 0x00, 0x00, 0x00]);
            assert_eq!((i.len, i.op), (7, Op::RipRel { disp_at: 3 }));
        }
    }

    #[test]
    fn decode_endbr64_as_plain() {
        unsafe {
            let i = decode_slice(&[0xF3, 0x0F, 0x1E, 0xFA]);
            assert_eq!((i.len, i.op), (4, Op::Plain));
        }
        assert!(is_endbr64([0xF3u8, 0x0F, 0x1E, 0xFA].as_ptr()));
        assert!(!is_endbr64([0x55u8, 0x48, 0x89, 0xE5].as_ptr()));
    }

    #[test]
    fn can_relocate_stops_before_ret() {
        let code = [
            0x55u8, // push rbp
            0x48, 0x89, 0xE5, // mov rbp, rsp
            0x48, 0x81, 0xEC, 0x80, 0x00, 0x00, 0x00, // sub rsp, 0x80
            0xC3, // ret
        ];
        assert_eq!(can_relocate(code.as_ptr(), 5), 11);
        // A bare RET yields nothing.
        assert_eq!(can_relocate([0xC3u8].as_ptr(), 5), 0);
    }

    #[test]
    fn relocate_plain_copies_verbatim() {
        let code = [0x55u8, 0x48, 0x89, 0xE5];
        let mut buf = [0u8; 64];
        unsafe {
            let mut w = X86_64Writer::new(buf.as_mut_ptr(), buf.len(), 0x2000);
            let mut r = PrologueRelocator::new(code.as_ptr(), 0x1000);
            assert_eq!(r.relocate_bytes(&mut w, 4).unwrap(), 4);
            assert_eq!(&buf[..4], &code);
        }
    }

    #[test]
    fn relocate_rip_relative_rebases_disp() {
        // mov rax, [rip+0x100] at PC=0x1000 → absolute 0x1107.
        let code = [0x48u8, 0x8B, 0x05, 0x00, 0x01, 0x00, 0x00];
        let mut buf = [0u8; 64];
        unsafe {
            let mut w = X86_64Writer::new(buf.as_mut_ptr(), buf.len(), 0x2000);
            let mut r = PrologueRelocator::new(code.as_ptr(), 0x1000);
            assert_eq!(r.relocate_bytes(&mut w, 7).unwrap(), 7);
            // New disp = 0x1107 - 0x2007 = -0xF00.
            let disp = i32::from_le_bytes(buf[3..7].try_into().unwrap());
            assert_eq!(disp, -0xF00);
        }
    }

    #[test]
    fn relocate_jmp_emits_absolute_branch() {
        // jmp +0x100 at PC=0x1000 → target 0x1105, near from 0x2000.
        let code = [0xE9u8, 0x00, 0x01, 0x00, 0x00];
        let mut buf = [0u8; 64];
        unsafe {
            let mut w = X86_64Writer::new(buf.as_mut_ptr(), buf.len(), 0x2000);
            let mut r = PrologueRelocator::new(code.as_ptr(), 0x1000);
            assert_eq!(r.relocate_bytes(&mut w, 5).unwrap(), 5);
            assert_eq!(buf[0], 0xE9);
            let rel = i32::from_le_bytes(buf[1..5].try_into().unwrap());
            assert_eq!(0x2005i64 + rel as i64, 0x1105);
        }
    }

    #[test]
    fn relocate_jcc_inverts_and_jumps_far() {
        // je +0x10 at PC=0x1000 → target 0x1012.
        let code = [0x74u8, 0x10];
        let mut buf = [0u8; 64];
        unsafe {
            let mut w = X86_64Writer::new(buf.as_mut_ptr(), buf.len(), 0x2000);
            let mut r = PrologueRelocator::new(code.as_ptr(), 0x1000);
            assert_eq!(r.relocate_bytes(&mut w, 2).unwrap(), 2);
            assert_eq!(buf[0], 0x75); // JNE over the far jump
            assert_eq!(buf[1], 16);
            let target = u64::from_le_bytes(buf[10..18].try_into().unwrap());
            assert_eq!(target, 0x1012);
        }
    }

    #[test]
    fn relocate_call_goes_through_register() {
        // call +0x100 at PC=0x1000 → target 0x1105.
        let code = [0xE8u8, 0x00, 0x01, 0x00, 0x00];
        let mut buf = [0u8; 64];
        unsafe {
            let mut w = X86_64Writer::new(buf.as_mut_ptr(), buf.len(), 0x2000);
            let mut r = PrologueRelocator::new(code.as_ptr(), 0x1000);
            assert_eq!(r.relocate_bytes(&mut w, 5).unwrap(), 5);
            // mov r11, 0x1105; call r11
            assert_eq!(&buf[..2], &[0x49, 0xBB]);
            assert_eq!(u64::from_le_bytes(buf[2..10].try_into().unwrap()), 0x1105);
            assert_eq!(&buf[10..13], &[0x41, 0xFF, 0xD3]);
        }
    }

    #[test]
    fn relocate_pic_call_pushes_return_address() {
        // call $+0 at PC=0x1000.
        let code = [0xE8u8, 0x00, 0x00, 0x00, 0x00];
        let mut buf = [0u8; 64];
        unsafe {
            let mut w = X86_64Writer::new(buf.as_mut_ptr(), buf.len(), 0x2000);
            let mut r = PrologueRelocator::new(code.as_ptr(), 0x1000);
            assert_eq!(r.relocate_bytes(&mut w, 5).unwrap(), 5);
            // mov r11, 0x1005; push r11
            assert_eq!(&buf[..2], &[0x49, 0xBB]);
            assert_eq!(u64::from_le_bytes(buf[2..10].try_into().unwrap()), 0x1005);
            assert_eq!(&buf[10..12], &[0x41, 0x53]);
        }
    }

    #[test]
    fn relocate_refuses_ret_inside_window() {
        let code = [0x90u8, 0xC3];
        let mut buf = [0u8; 64];
        unsafe {
            let mut w = X86_64Writer::new(buf.as_mut_ptr(), buf.len(), 0x2000);
            let mut r = PrologueRelocator::new(code.as_ptr(), 0x1000);
            assert_eq!(r.relocate_bytes(&mut w, 5), Err(HookError::RelocationFailed));
        }
    }
}
