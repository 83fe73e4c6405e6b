use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, VmError>;

pub const ERROR_NONE: u8 = 0x00;
pub const ERROR_RESET: u8 = 0x01;
pub const ERROR_DIVIDE_ZERO: u8 = 0x02;
pub const ERROR_UNSUPPORTED_OPERAND: u8 = 0x03;
pub const ERROR_UNSUPPORTED_OPERATION: u8 = 0x04;
pub const ERROR_MEMORY_EXCEPTION: u8 = 0x05;
pub const ERROR_ID_UNAVAILABLE: u8 = 0x06;
pub const ERROR_PID_INIT: u8 = 0x07;

/// Mask selecting the error code from a VM status word.
pub const ERROR_CODE_MASK: u32 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Pid,
    Mapping,
}

impl fmt::Display for IdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdKind::Pid => f.write_str("pid"),
            IdKind::Mapping => f.write_str("mapping"),
        }
    }
}

/// Every fault an instruction can raise. The VM folds these into its flags and
/// status word; nothing here aborts the host.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    #[error("memory access violation ({op}) at 0x{address:04X}, width {width}")]
    MemoryAccessViolation {
        op: &'static str,
        address: u32,
        width: usize,
    },
    #[error("stack overflow (capacity {capacity})")]
    StackOverflow { capacity: usize },
    #[error("stack underflow")]
    StackUnderflow,
    #[error("division by zero")]
    DivideByZero,
    #[error("unsupported operand type 0x{optype:02X} for {mnemonic}")]
    UnsupportedOperand { mnemonic: &'static str, optype: u8 },
    #[error("unsupported operation 0x{0:02X}")]
    UnsupportedOperation(u8),
    #[error("{kind} id {id} unavailable")]
    IdUnavailable { kind: IdKind, id: u8 },
    #[error("pid controller {0} already initialized")]
    PidAlreadyInitialized(u8),
    #[error("reset requested")]
    ResetRequested,
}

impl VmError {
    /// Error code folded into the low byte of the status word.
    pub fn code(&self) -> u8 {
        match self {
            VmError::MemoryAccessViolation { .. }
            | VmError::StackOverflow { .. }
            | VmError::StackUnderflow => ERROR_MEMORY_EXCEPTION,
            VmError::DivideByZero => ERROR_DIVIDE_ZERO,
            VmError::UnsupportedOperand { .. } => ERROR_UNSUPPORTED_OPERAND,
            VmError::UnsupportedOperation(_) => ERROR_UNSUPPORTED_OPERATION,
            VmError::IdUnavailable { .. } => ERROR_ID_UNAVAILABLE,
            VmError::PidAlreadyInitialized(_) => ERROR_PID_INIT,
            VmError::ResetRequested => ERROR_RESET,
        }
    }
}

/// Failures of the network-facing value codecs.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Vm(#[from] VmError),
    #[error("mapping {0} is not active")]
    NoMapping(u8),
    #[error("mapping optype 0x{0:02X} has no value type")]
    UnsupportedType(u8),
    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("invalid hex program: {0}")]
    InvalidHex(String),
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to spawn {0} thread: {1}")]
    Spawn(&'static str, std::io::Error),
    #[error("{0} thread is no longer running")]
    Disconnected(&'static str),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
