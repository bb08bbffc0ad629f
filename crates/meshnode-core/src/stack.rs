//! Mesh stack interface
//!
//! The node never talks to a radio. Everything below the access layer
//! (provisioning, keys, segmentation, relay, encryption) belongs to a
//! [`MeshStack`] implementation supplied by the host.

use std::sync::Arc;
use thiserror::Error;

use crate::composition::{Composition, SlotRef};
use meshnode_protocol::{Address, Opcode};

/// Errors reported by the stack
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StackError {
    #[error("No network buffers available")]
    NoBuffers,

    #[error("Composition not registered")]
    NotRegistered,

    #[error("Composition already registered")]
    AlreadyRegistered,

    #[error("Unknown model slot: {0}")]
    UnknownSlot(SlotRef),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Addressing and key selection for one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageContext {
    pub net_idx: u16,
    pub app_idx: u16,
    /// Destination when sending, source when receiving
    pub addr: Address,
    /// Destination the message was received on (inbound only)
    pub recv_dst: Address,
    pub ttl: u8,
    /// Ask the stack for acknowledged transport
    pub reliable: bool,
}

impl MessageContext {
    pub const DEFAULT_TTL: u8 = 7;

    /// Unreliable send on the primary subnet and application key
    pub fn to(addr: Address) -> Self {
        MessageContext {
            net_idx: 0,
            app_idx: 0,
            addr,
            recv_dst: Address::UNASSIGNED,
            ttl: Self::DEFAULT_TTL,
            reliable: false,
        }
    }

    /// Inbound context as the stack would report it
    pub fn received(src: Address, dst: Address) -> Self {
        MessageContext {
            recv_dst: dst,
            ..Self::to(src)
        }
    }

    /// Context for answering the sender of an inbound message
    pub fn reply(&self) -> Self {
        MessageContext {
            net_idx: self.net_idx,
            app_idx: self.app_idx,
            addr: self.addr,
            recv_dst: Address::UNASSIGNED,
            ttl: Self::DEFAULT_TTL,
            reliable: false,
        }
    }
}

/// The mesh stack as seen by the node.
///
/// `send` must not call back into the node synchronously: the node may hold a
/// model's state lock while sending its publication buffer.
pub trait MeshStack: Send + Sync {
    /// Hand the finished composition to the stack
    fn register(&self, composition: &Composition) -> Result<(), StackError>;

    /// Send `payload` with `opcode` as the model in `slot`
    fn send(
        &self,
        slot: SlotRef,
        ctx: &MessageContext,
        opcode: Opcode,
        payload: &[u8],
    ) -> Result<(), StackError>;
}

impl<S: MeshStack + ?Sized> MeshStack for Arc<S> {
    fn register(&self, composition: &Composition) -> Result<(), StackError> {
        (**self).register(composition)
    }

    fn send(
        &self,
        slot: SlotRef,
        ctx: &MessageContext,
        opcode: Opcode,
        payload: &[u8],
    ) -> Result<(), StackError> {
        (**self).send(slot, ctx, opcode, payload)
    }
}
