//! Inbound stack events
//!
//! The stack reports everything that happens below or at the access layer as
//! a [`StackEvent`]. Model events carry the composition slot that received
//! the message.

use crate::composition::SlotRef;
use crate::stack::{MessageContext, StackError};
use meshnode_protocol::{Address, Opcode};

#[derive(Debug, Clone, PartialEq)]
pub enum StackEvent {
    Provisioning(ProvisioningEvent),
    Config(ConfigEvent),
    Generic(GenericEvent),
    Sensor(SensorEvent),
    Vendor(VendorEvent),
    /// A previous send finished, successfully or not
    SendComplete {
        slot: SlotRef,
        opcode: Opcode,
        result: Result<(), StackError>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProvisioningEvent {
    /// Composition accepted by the stack
    Registered { result: Result<(), StackError> },
    LinkOpen,
    LinkClose,
    Complete {
        net_idx: u16,
        unicast: Address,
        iv_index: u32,
    },
    Reset,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigEvent {
    AppKeyAdd { net_idx: u16, app_idx: u16 },
    ModelAppBind { slot: SlotRef, app_idx: u16 },
    /// The configuration client set a model's publish address
    ModelPubSet { slot: SlotRef, publish_address: Address },
}

/// Value carried by a generic server state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenericValue {
    OnOff(bool),
    Level(i16),
    Delta(i32),
    Move(i16),
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenericEvent {
    /// The stack applied a set message to its server state
    StateChange {
        slot: SlotRef,
        opcode: Opcode,
        ctx: MessageContext,
        value: GenericValue,
    },
    Get {
        slot: SlotRef,
        opcode: Opcode,
        ctx: MessageContext,
    },
    Set {
        slot: SlotRef,
        opcode: Opcode,
        ctx: MessageContext,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SensorEvent {
    /// Sensor Get; `None` asks for every property
    Get {
        slot: SlotRef,
        ctx: MessageContext,
        property_id: Option<u16>,
    },
    DescriptorGet {
        slot: SlotRef,
        ctx: MessageContext,
        property_id: Option<u16>,
    },
}

/// Vendor model operation
#[derive(Debug, Clone, PartialEq)]
pub struct VendorEvent {
    pub slot: SlotRef,
    pub opcode: Opcode,
    pub ctx: MessageContext,
    pub payload: Vec<u8>,
}
