//! Node error types

use thiserror::Error;

use crate::alloc::AllocStage;
use crate::descriptor::ModelKind;
use crate::stack::StackError;
use meshnode_protocol::{CodecError, VendorOpcode};

/// Errors raised while building or driving a node
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Too many models: {count} (max {max})")]
    CapacityExceeded { count: usize, max: usize },

    #[error("Out of memory allocating {stage} ({requested} bytes)")]
    OutOfMemory { stage: AllocStage, requested: usize },

    #[error("No {kind} model with index {index}")]
    NotFound { kind: ModelKind, index: usize },

    #[error("Property 0x{0:04X} not found")]
    PropertyNotFound(u16),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Opcode {0} not in the model's allow-list")]
    OpcodeNotAllowed(VendorOpcode),

    #[error("Sensor read failed for property 0x{property_id:04X}: {reason}")]
    SensorRead { property_id: u16, reason: String },

    #[error("Stack error: {0}")]
    Stack(#[from] StackError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Result type for node operations
pub type Result<T> = std::result::Result<T, NodeError>;
