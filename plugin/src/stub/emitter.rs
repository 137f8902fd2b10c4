use crate::types::Signature;
use thiserror::Error;

/// Failure while synthesizing an adapter stub. The rendered message is what
/// lands in the owning Callback's error string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EmitError {
    #[error("Parameters wider than 64bits not supported")]
    WideParameter,

    #[error("signature needs stack-passed arguments ({ints} integer, {floats} float)")]
    TooManyArguments { ints: u32, floats: u32 },

    #[error("executable arena allocation failed")]
    OutOfMemory,

    #[error("emitted stub exceeds its code buffer")]
    Overflow,

    #[error("stub control-flow label left unbound")]
    UnboundLabel,

    #[error("could not make the stub executable")]
    Protect,
}

/// A frame region handed out by [`Emitter::new_stack`]; offsets are opaque
/// to the protocol walker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackSlot(pub(crate) u32);

/// A byte location within a frame region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem {
    pub slot: StackSlot,
    pub offset: u32,
}

impl Mem {
    pub fn at(slot: StackSlot, offset: u32) -> Self {
        Self { slot, offset }
    }
}

/// A forward-referencable code position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(pub(crate) usize);

/// The operations the stub protocol is written against.
///
/// A concrete backend lowers these onto real instructions; the recording
/// emitter used in tests captures the op stream instead. Argument moves are
/// expressed by positional index so the backend owns the ABI mapping: an
/// integer-class argument spills through its general-purpose register, a
/// float-class argument through its XMM register's low quad.
pub trait Emitter {
    /// Bind the signature, validate its representability, open the frame.
    fn begin(&mut self, sig: &Signature) -> Result<(), EmitError>;

    /// Reserve `size` bytes of frame with the given alignment.
    fn new_stack(&mut self, size: u32, align: u32) -> Result<StackSlot, EmitError>;

    fn new_label(&mut self) -> Label;

    /// Bind a label to the current position, resolving forward branches.
    fn bind(&mut self, label: Label) -> Result<(), EmitError>;

    /// Store argument `index` from its ABI register into `dst`.
    fn spill_arg(&mut self, index: u32, dst: Mem) -> Result<(), EmitError>;

    /// Reload argument `index` from `src` back into its ABI register.
    fn fill_arg(&mut self, index: u32, src: Mem) -> Result<(), EmitError>;

    /// One 64-bit store of an immediate into the frame.
    fn store_imm64(&mut self, dst: Mem, value: u64) -> Result<(), EmitError>;

    /// 32-bit load of `flag`, test against `mask`, branch to `target` if any
    /// bit is set.
    fn test_flag_jnz(&mut self, flag: Mem, mask: u32, target: Label) -> Result<(), EmitError>;

    /// Call an observer entry with the host C ABI:
    /// `(context, &params, &property, &return)`.
    fn invoke_observer(
        &mut self,
        entry: u64,
        context: u64,
        params: StackSlot,
        prop: StackSlot,
        ret: StackSlot,
    ) -> Result<(), EmitError>;

    /// Call the original through the trampoline-holder cell at `holder`,
    /// with the bound signature's arguments already in their registers.
    /// When `ret` is set, store the call's result there.
    fn invoke_original(&mut self, holder: u64, ret: Option<Mem>) -> Result<(), EmitError>;

    /// Load the declared return value (if any) into the return register and
    /// return to the caller.
    fn ret_from(&mut self, src: Option<Mem>) -> Result<(), EmitError>;

    /// Finalize: resolve the frame size, make the code executable, and hand
    /// back the entry address.
    fn finish(&mut self) -> Result<u64, EmitError>;
}
