use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstmemError {
    #[error("Out of address space (size 0x{size:x}, align 0x{align:x})")]
    OutOfAddressSpace { size: u64, align: u64 },

    #[error("Out of memory")]
    OutOfMemory,

    #[error("Platform allocation failed: {0}")]
    PlatformAllocationFailed(String),

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Device busy")]
    Busy,

    #[error("Cannot {op} while {state}")]
    InvalidState { op: &'static str, state: &'static str },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

// A convenient alias
pub type InstmemResult<T> = Result<T, InstmemError>;
