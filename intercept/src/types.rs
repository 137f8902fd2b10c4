#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookError {
    AllocationFailed,
    ProtectionFailed,
    RelocationFailed,
    SlotOutOfRange,
    Unsupported,
}
