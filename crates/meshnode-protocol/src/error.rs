//! Error types for codec operations

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CodecError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("Buffer overflow: need {needed} bytes, {available} available")]
    BufferOverflow { needed: usize, available: usize },

    #[error("Truncated payload: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Invalid payload length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Invalid opcode: 0x{0:06X}")]
    InvalidOpcode(u32),

    #[error("Invalid on/off value: {0}")]
    InvalidOnOff(u8),

    #[error("Invalid battery level: {0}")]
    InvalidBatteryLevel(u8),

    #[error("Property value too long for {format:?} format: {len} bytes")]
    ValueTooLong { format: crate::sensor::PropertyFormat, len: usize },

    #[error("Value out of range: {0}")]
    OutOfRange(String),
}
