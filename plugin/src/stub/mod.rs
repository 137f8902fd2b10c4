//! The adapter-stub compiler.
//!
//! [`compile`] walks the single-stub protocol against an [`Emitter`]: spill
//! every argument into the parameters buffer, seed the property, run the
//! pre-observers, conditionally invoke the original through the trampoline
//! holder, conditionally run the post-observers, and return the (possibly
//! rewritten) return slot. [`compile_role`] emits the paired shape: one
//! observer call, no original, the property flag preloaded with the role tag.

pub mod emitter;

#[cfg(target_arch = "x86_64")]
pub mod x64;

pub use emitter::{EmitError, Emitter, Label, Mem, StackSlot};

use crate::types::{CallbackType, Property, ReturnFlag, Signature};

/// Synthesize the single-stub shape.
///
/// `context` is the Callback address handed to both observer entries and
/// `holder` the address of its trampoline cell.
pub fn compile<E: Emitter>(
    e: &mut E,
    sig: &Signature,
    pre: u64,
    post: u64,
    context: u64,
    holder: u64,
) -> Result<u64, EmitError> {
    let argc = sig.arg_count() as u32;

    e.begin(sig)?;
    let params = e.new_stack(8 * argc.max(1), 16)?;
    let prop = e.new_stack(8, 16)?;
    let ret = e.new_stack(8, 16)?;

    for i in 0..argc {
        e.spill_arg(i, Mem::at(params, 8 * i))?;
    }

    e.store_imm64(
        Mem::at(prop, 0),
        Property {
            count: argc as i32,
            flag: ReturnFlag::DEFAULT,
        }
        .to_bits(),
    )?;

    e.invoke_observer(pre, context, params, prop, ret)?;

    let supercede = e.new_label();
    let no_post = e.new_label();
    let flag = Mem::at(prop, 4);

    e.test_flag_jnz(flag, ReturnFlag::SUPERCEDE.bits(), supercede)?;
    for i in 0..argc {
        e.fill_arg(i, Mem::at(params, 8 * i))?;
    }
    e.invoke_original(holder, sig.has_ret().then_some(Mem::at(ret, 0)))?;

    e.bind(supercede)?;
    e.test_flag_jnz(flag, ReturnFlag::NOPOST.bits(), no_post)?;
    e.invoke_observer(post, context, params, prop, ret)?;
    // Mirror the argument registers one last time; nothing in the return ABI
    // reads them, but debuggers chained behind the stub do.
    for i in 0..argc {
        e.fill_arg(i, Mem::at(params, 8 * i))?;
    }

    e.bind(no_post)?;
    e.ret_from(sig.has_ret().then_some(Mem::at(ret, 0)))?;
    e.finish()
}

/// Synthesize one half of the paired shape.
///
/// The property flag is preloaded with the role tag so the single observer
/// can branch on which pass it is running; the role values coincide with the
/// `ReturnFlag` bits by the invariant asserted in `types`.
pub fn compile_role<E: Emitter>(
    e: &mut E,
    sig: &Signature,
    observer: u64,
    context: u64,
    role: CallbackType,
) -> Result<u64, EmitError> {
    let argc = sig.arg_count() as u32;

    e.begin(sig)?;
    let params = e.new_stack(8 * argc.max(1), 16)?;
    let prop = e.new_stack(8, 16)?;
    let ret = e.new_stack(8, 16)?;

    for i in 0..argc {
        e.spill_arg(i, Mem::at(params, 8 * i))?;
    }

    e.store_imm64(
        Mem::at(prop, 0),
        Property {
            count: argc as i32,
            flag: ReturnFlag::from_bits(role as u32),
        }
        .to_bits(),
    )?;

    e.invoke_observer(observer, context, params, prop, ret)?;
    e.ret_from(sig.has_ret().then_some(Mem::at(ret, 0)))?;
    e.finish()
}
