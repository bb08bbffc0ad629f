//! MeshNode Core
//!
//! Turns a declarative list of model descriptors into a running mesh node:
//!
//! - [`descriptor`]: validated model descriptors
//! - [`alloc`]: allocation arena with a live ledger and rollback on drop
//! - [`state`]: per-model runtime state
//! - [`registry`]: ordered lookup by kind and within-kind index
//! - [`composition`]: slot arrays, element and the composition builder
//! - [`dispatch`]: inbound stack events routed to their model
//! - [`node`]: the node context and application accessors
//!
//! The mesh stack itself is a collaborator behind [`stack::MeshStack`].

pub mod alloc;
pub mod composition;
pub mod descriptor;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod node;
pub mod observer;
pub mod registry;
pub mod stack;
pub mod state;

pub use alloc::{AllocPolicy, AllocStage, Arena, LedgerStats, Tracked};
pub use composition::{
    Composition, CompositionBuilder, CompositionHeader, ModelRecord, SlotCounts, SlotKind, SlotRef,
};
pub use descriptor::{
    DescriptorTable, ModelDescriptor, ModelKind, ModelParams, SensorChannel, MAX_MODELS,
};
pub use error::{NodeError, Result};
pub use event::{
    ConfigEvent, GenericEvent, GenericValue, ProvisioningEvent, SensorEvent, StackEvent,
    VendorEvent,
};
pub use node::{DeviceIdentity, NodeContext, NodeSetup, ProvisioningState};
pub use observer::{
    BatteryReader, DimmerObserver, NodeObserver, ReadError, SensorReader, SwitchObserver,
    VendorHandler, VendorMessage,
};
pub use registry::{ModelHandle, Registry, RegistryEntry};
pub use stack::{MeshStack, MessageContext, StackError};
