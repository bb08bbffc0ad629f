//! Node context
//!
//! [`NodeContext`] owns everything a running node needs: its identity, the
//! composition handed to the stack, the model registry and the stack handle.
//! Application accessors address models by kind and within-kind index.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::alloc::{Arena, LedgerStats};
use crate::composition::{Composition, CompositionBuilder, CompositionHeader, ModelRecord, SlotRef};
use crate::descriptor::{DescriptorTable, ModelDescriptor, ModelKind};
use crate::error::{NodeError, Result};
use crate::observer::NodeObserver;
use crate::registry::{Registry, RegistryEntry};
use crate::stack::{MeshStack, MessageContext};
use crate::state::{lock, BatteryState, DimmerState, RuntimeState, SensorState, SwitchState, VendorState};
use meshnode_protocol::{status, Address, BatteryStatus, MarshalledProperty, Opcode, VendorOpcode};

pub const DEFAULT_DEVICE_NAME: &str = "ESP-Mesh-Node";
pub const MAX_DEVICE_NAME_LEN: usize = 29;

/// Device UUID and advertised name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    uuid: [u8; 16],
    name: String,
}

impl DeviceIdentity {
    /// UUID = 2-byte prefix, 6-byte radio MAC, zero padding
    pub fn new(prefix: [u8; 2], mac: [u8; 6]) -> Self {
        let mut uuid = [0u8; 16];
        uuid[..2].copy_from_slice(&prefix);
        uuid[2..8].copy_from_slice(&mac);
        DeviceIdentity {
            uuid,
            name: DEFAULT_DEVICE_NAME.to_string(),
        }
    }

    pub fn with_name(mut self, name: &str) -> Result<Self> {
        if name.is_empty() || name.len() > MAX_DEVICE_NAME_LEN {
            return Err(NodeError::InvalidArgument(format!(
                "device name must be 1-{} bytes, got {}",
                MAX_DEVICE_NAME_LEN,
                name.len()
            )));
        }
        self.name = name.to_string();
        Ok(self)
    }

    pub fn uuid(&self) -> &[u8; 16] {
        &self.uuid
    }

    pub fn uuid_hex(&self) -> String {
        hex::encode(self.uuid)
    }

    pub fn prefix(&self) -> [u8; 2] {
        [self.uuid[0], self.uuid[1]]
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.uuid_hex())
    }
}

/// Provisioning data reported by the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProvisioningState {
    pub provisioned: bool,
    pub unicast: Address,
    pub net_idx: u16,
    pub iv_index: u32,
    /// Last application key added by the configuration client
    pub app_idx: Option<u16>,
}

/// Everything a node needs besides its models and stack
pub struct NodeSetup {
    pub identity: DeviceIdentity,
    pub header: CompositionHeader,
    pub arena: Arena,
    pub observer: Option<Arc<dyn NodeObserver>>,
}

impl NodeSetup {
    pub fn new(identity: DeviceIdentity) -> Self {
        NodeSetup {
            identity,
            header: CompositionHeader::default(),
            arena: Arena::unbounded(),
            observer: None,
        }
    }

    pub fn with_header(mut self, header: CompositionHeader) -> Self {
        self.header = header;
        self
    }

    pub fn with_arena(mut self, arena: Arena) -> Self {
        self.arena = arena;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn NodeObserver>) -> Self {
        self.observer = Some(observer);
        self
    }
}

pub struct NodeContext {
    identity: DeviceIdentity,
    composition: Composition,
    registry: Registry,
    stack: Arc<dyn MeshStack>,
    observer: Option<Arc<dyn NodeObserver>>,
    provisioning: Mutex<ProvisioningState>,
    started: AtomicBool,
    arena: Arena,
}

impl NodeContext {
    /// Validate the descriptors and build the composition and registry.
    ///
    /// Nothing is handed to the stack until [`NodeContext::start`].
    pub fn build(
        setup: NodeSetup,
        descriptors: &[ModelDescriptor],
        stack: Arc<dyn MeshStack>,
    ) -> Result<Self> {
        log::info!("Initializing node {}", setup.identity);

        let table = DescriptorTable::new(descriptors)?;
        let (composition, registry) =
            CompositionBuilder::build(&setup.arena, setup.header, &table)?;

        log::info!(
            "Node built: {} models, {} bytes allocated",
            registry.len(),
            setup.arena.stats().live_bytes
        );

        Ok(NodeContext {
            identity: setup.identity,
            composition,
            registry,
            stack,
            observer: setup.observer,
            provisioning: Mutex::new(ProvisioningState::default()),
            started: AtomicBool::new(false),
            arena: setup.arena,
        })
    }

    /// Register the composition with the stack
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(NodeError::InvalidState("node already started".to_string()));
        }
        if let Err(e) = self.stack.register(&self.composition) {
            self.started.store(false, Ordering::SeqCst);
            log::error!("Stack rejected composition: {}", e);
            return Err(e.into());
        }
        log::info!("Node started, waiting for provisioning");
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn composition(&self) -> &Composition {
        &self.composition
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn memory(&self) -> LedgerStats {
        self.arena.stats()
    }

    pub fn provisioning(&self) -> ProvisioningState {
        *lock(&self.provisioning)
    }

    pub fn is_provisioned(&self) -> bool {
        lock(&self.provisioning).provisioned
    }

    pub fn unicast_address(&self) -> Address {
        lock(&self.provisioning).unicast
    }

    pub(crate) fn observer(&self) -> Option<&Arc<dyn NodeObserver>> {
        self.observer.as_ref()
    }

    pub(crate) fn update_provisioning<F>(&self, update: F) -> ProvisioningState
    where
        F: FnOnce(&mut ProvisioningState),
    {
        let mut state = lock(&self.provisioning);
        update(&mut state);
        *state
    }

    // Lookups

    fn entry(&self, kind: ModelKind, index: usize) -> Result<&RegistryEntry> {
        self.registry
            .find(kind, index)
            .ok_or(NodeError::NotFound { kind, index })
    }

    pub(crate) fn record(&self, slot: SlotRef) -> Result<&ModelRecord> {
        self.composition
            .record(slot)
            .ok_or_else(|| NodeError::InvalidState(format!("no model record at {}", slot)))
    }

    fn switch_entry(&self, index: usize) -> Result<(&RegistryEntry, &SwitchState)> {
        let entry = self.entry(ModelKind::Switch, index)?;
        match entry.state() {
            RuntimeState::Switch(state) => Ok((entry, state)),
            _ => Err(mismatched(entry)),
        }
    }

    fn dimmer_entry(&self, index: usize) -> Result<(&RegistryEntry, &DimmerState)> {
        let entry = self.entry(ModelKind::Dimmer, index)?;
        match entry.state() {
            RuntimeState::Dimmer(state) => Ok((entry, state)),
            _ => Err(mismatched(entry)),
        }
    }

    fn battery_entry(&self, index: usize) -> Result<(&RegistryEntry, &BatteryState)> {
        let entry = self.entry(ModelKind::Battery, index)?;
        match entry.state() {
            RuntimeState::Battery(state) => Ok((entry, state)),
            _ => Err(mismatched(entry)),
        }
    }

    fn sensor_entry(&self, index: usize) -> Result<(&RegistryEntry, &SensorState)> {
        let entry = self.entry(ModelKind::Sensor, index)?;
        match entry.state() {
            RuntimeState::Sensor(state) => Ok((entry, state)),
            _ => Err(mismatched(entry)),
        }
    }

    fn vendor_entry(&self, index: usize) -> Result<(&RegistryEntry, &VendorState)> {
        let entry = self.entry(ModelKind::Vendor, index)?;
        match entry.state() {
            RuntimeState::Vendor(state) => Ok((entry, state)),
            _ => Err(mismatched(entry)),
        }
    }

    /// Publication context for a model, refusing an unbound publish address
    fn publish_context(&self, slot: SlotRef) -> Result<MessageContext> {
        let address = self.record(slot)?.publish_address();
        if address.is_unassigned() {
            log::warn!("Publish address of {} not configured", slot);
            return Err(NodeError::InvalidState(format!(
                "publish address of {} not configured",
                slot
            )));
        }
        Ok(MessageContext::to(address))
    }

    pub(crate) fn send(
        &self,
        slot: SlotRef,
        ctx: &MessageContext,
        opcode: Opcode,
        payload: &[u8],
    ) -> Result<()> {
        log::debug!(
            "Send {} opcode={} len={} to {}",
            slot,
            opcode,
            payload.len(),
            ctx.addr
        );
        self.stack.send(slot, ctx, opcode, payload).map_err(|e| {
            log::error!("Send failed from {} (opcode {}): {}", slot, opcode, e);
            NodeError::Stack(e)
        })
    }

    // Switch

    pub fn switch(&self, index: usize) -> Result<bool> {
        Ok(self.switch_entry(index)?.1.value())
    }

    /// Store a new switch state, notify the observer and optionally publish
    pub fn set_switch(&self, index: usize, on: bool, publish: bool) -> Result<()> {
        let (_, state) = self.switch_entry(index)?;
        state.set(on);
        log::info!("Switch #{} set to {}", index, if on { "ON" } else { "OFF" });
        state.notify(index, on);

        if publish {
            self.publish_switch(index)?;
        }
        Ok(())
    }

    pub fn publish_switch(&self, index: usize) -> Result<()> {
        let (entry, state) = self.switch_entry(index)?;
        let ctx = self.publish_context(entry.slot())?;
        state.publish(status::encode_onoff, |payload| {
            self.send(entry.slot(), &ctx, Opcode::GENERIC_ONOFF_STATUS, payload)
        })?;
        log::info!("Switch #{} published to {}", index, ctx.addr);
        Ok(())
    }

    /// Switch 0
    pub fn onoff_state(&self) -> Result<bool> {
        self.switch(0)
    }

    /// Set and publish switch 0
    pub fn set_onoff_state(&self, on: bool) -> Result<()> {
        self.set_switch(0, on, true)
    }

    // Dimmer

    pub fn dimmer(&self, index: usize) -> Result<i16> {
        Ok(self.dimmer_entry(index)?.1.value())
    }

    pub fn set_dimmer(&self, index: usize, level: i16, publish: bool) -> Result<()> {
        let (_, state) = self.dimmer_entry(index)?;
        state.set(level);
        log::info!("Dimmer #{} set to {}", index, level);
        state.notify(index, level);

        if publish {
            self.publish_dimmer(index)?;
        }
        Ok(())
    }

    pub fn publish_dimmer(&self, index: usize) -> Result<()> {
        let (entry, state) = self.dimmer_entry(index)?;
        let ctx = self.publish_context(entry.slot())?;
        state.publish(status::encode_level, |payload| {
            self.send(entry.slot(), &ctx, Opcode::GENERIC_LEVEL_STATUS, payload)
        })?;
        log::info!("Dimmer #{} published to {}", index, ctx.addr);
        Ok(())
    }

    // Battery

    /// Current level, refreshed through the reader when there is one
    pub fn battery(&self, index: usize) -> Result<u8> {
        let (_, state) = self.battery_entry(index)?;
        Ok(state.refresh(index))
    }

    /// Store a level (clamped to 100) and optionally publish it
    pub fn set_battery(&self, index: usize, level: u8, publish: bool) -> Result<()> {
        let (_, state) = self.battery_entry(index)?;
        let level = state.set_level(level);
        log::info!("Battery #{} set to {}%", index, level);

        if publish {
            self.publish_battery(index)?;
        }
        Ok(())
    }

    pub fn publish_battery(&self, index: usize) -> Result<()> {
        let (entry, state) = self.battery_entry(index)?;
        let ctx = self.publish_context(entry.slot())?;
        let level = state.refresh(index);
        state.publish(
            |buf, level| BatteryStatus::from_level(level).encode(buf),
            |payload| self.send(entry.slot(), &ctx, Opcode::GENERIC_BATTERY_STATUS, payload),
        )?;
        log::info!("Battery #{} published: {}%", index, level);
        Ok(())
    }

    // Sensor

    /// Read one property through its reader and keep the value
    pub fn read_sensor(&self, index: usize, property_id: u16) -> Result<i32> {
        let (_, state) = self.sensor_entry(index)?;
        let value = state.read(property_id)?;
        state.store_raw(property_id, value)?;
        Ok(value)
    }

    /// Read one property and publish it as a Sensor Status
    pub fn publish_sensor(&self, index: usize, property_id: u16) -> Result<()> {
        let (entry, state) = self.sensor_entry(index)?;
        let value = state.read(property_id)?;
        state.store_raw(property_id, value)?;

        let ctx = self.publish_context(entry.slot())?;
        state.publish(
            |buf| MarshalledProperty::from_i32(property_id, value).encode(buf),
            |payload| self.send(entry.slot(), &ctx, Opcode::SENSOR_STATUS, payload),
        )?;
        log::info!(
            "Sensor #{} published 0x{:04X} = {}",
            index,
            property_id,
            value
        );
        Ok(())
    }

    // Vendor

    fn check_opcode(&self, entry: &RegistryEntry, opcode: VendorOpcode) -> Result<()> {
        if self.record(entry.slot())?.allows(opcode.into()) {
            Ok(())
        } else {
            Err(NodeError::OpcodeNotAllowed(opcode))
        }
    }

    /// Send a vendor message to an explicit destination
    pub fn send_vendor(
        &self,
        index: usize,
        opcode: VendorOpcode,
        payload: &[u8],
        destination: Address,
    ) -> Result<()> {
        let (entry, state) = self.vendor_entry(index)?;
        self.check_opcode(entry, opcode)?;
        if destination.is_unassigned() {
            return Err(NodeError::InvalidArgument(
                "vendor destination is unassigned".to_string(),
            ));
        }

        log::debug!(
            "Vendor #{} (CID=0x{:04X}, MID=0x{:04X}) sending {} len={} to {}",
            index,
            state.company_id,
            state.model_id,
            opcode,
            payload.len(),
            destination
        );
        self.send(
            entry.slot(),
            &MessageContext::to(destination),
            opcode.into(),
            payload,
        )
    }

    /// Send a vendor message to the model's publish address
    pub fn publish_vendor(&self, index: usize, opcode: VendorOpcode, payload: &[u8]) -> Result<()> {
        let (entry, _) = self.vendor_entry(index)?;
        self.check_opcode(entry, opcode)?;
        if !self.record(entry.slot())?.has_publication() {
            return Err(NodeError::InvalidState(format!(
                "vendor #{} has publication disabled",
                index
            )));
        }
        let ctx = self.publish_context(entry.slot())?;
        self.send(entry.slot(), &ctx, opcode.into(), payload)
    }
}

fn mismatched(entry: &RegistryEntry) -> NodeError {
    NodeError::InvalidState(format!(
        "{} #{} holds mismatched runtime state",
        entry.kind(),
        entry.index()
    ))
}

impl fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeContext")
            .field("identity", &self.identity)
            .field("models", &self.registry.len())
            .field("started", &self.is_started())
            .field("provisioning", &self.provisioning())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::StackError;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(SlotRef, Address, Opcode, Vec<u8>)>>,
    }

    impl MeshStack for Recorder {
        fn register(&self, _composition: &Composition) -> std::result::Result<(), StackError> {
            Ok(())
        }

        fn send(
            &self,
            slot: SlotRef,
            ctx: &MessageContext,
            opcode: Opcode,
            payload: &[u8],
        ) -> std::result::Result<(), StackError> {
            self.sent
                .lock()
                .unwrap()
                .push((slot, ctx.addr, opcode, payload.to_vec()));
            Ok(())
        }
    }

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new([0xDD, 0xDD], [1, 2, 3, 4, 5, 6])
    }

    #[test]
    fn test_identity_uuid() {
        let id = identity();
        assert_eq!(
            id.uuid(),
            &[0xDD, 0xDD, 1, 2, 3, 4, 5, 6, 0, 0, 0, 0, 0, 0, 0, 0]
        );
        assert_eq!(id.name(), DEFAULT_DEVICE_NAME);
        assert_eq!(id.prefix(), [0xDD, 0xDD]);
        assert_eq!(id.uuid_hex(), "dddd0102030405060000000000000000");
    }

    #[test]
    fn test_identity_name_limits() {
        assert!(identity().with_name("Kitchen").is_ok());
        assert!(identity().with_name("").is_err());
        assert!(identity().with_name(&"x".repeat(MAX_DEVICE_NAME_LEN)).is_ok());
        assert!(identity().with_name(&"x".repeat(MAX_DEVICE_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_switch_publish_flow() {
        let stack = Arc::new(Recorder::default());
        let node = NodeContext::build(
            NodeSetup::new(identity()),
            &[ModelDescriptor::switch(None)],
            stack.clone(),
        )
        .unwrap();

        let err = node.set_onoff_state(true).unwrap_err();
        assert!(matches!(err, NodeError::InvalidState(_)));
        assert!(node.onoff_state().unwrap());
        assert!(stack.sent.lock().unwrap().is_empty());

        node.record(SlotRef::sig(1))
            .unwrap()
            .set_publish_address(Address::new(0xC000));
        node.publish_switch(0).unwrap();

        let sent = stack.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0],
            (
                SlotRef::sig(1),
                Address::new(0xC000),
                Opcode::GENERIC_ONOFF_STATUS,
                vec![1]
            )
        );
    }

    #[test]
    fn test_accessor_not_found() {
        let node = NodeContext::build(
            NodeSetup::new(identity()),
            &[ModelDescriptor::switch(None)],
            Arc::new(Recorder::default()),
        )
        .unwrap();

        assert_eq!(
            node.dimmer(0),
            Err(NodeError::NotFound {
                kind: ModelKind::Dimmer,
                index: 0
            })
        );
        assert!(matches!(node.switch(1), Err(NodeError::NotFound { .. })));
        assert!(matches!(node.battery(0), Err(NodeError::NotFound { .. })));
        assert!(matches!(
            node.read_sensor(0, 0x5001),
            Err(NodeError::NotFound { .. })
        ));
        assert!(matches!(
            node.publish_vendor(0, VendorOpcode::IMU_DATA, &[]),
            Err(NodeError::NotFound { .. })
        ));
    }

    #[test]
    fn test_start_only_once() {
        let node = NodeContext::build(
            NodeSetup::new(identity()),
            &[],
            Arc::new(Recorder::default()),
        )
        .unwrap();

        assert!(!node.is_started());
        node.start().unwrap();
        assert!(node.is_started());
        assert!(matches!(node.start(), Err(NodeError::InvalidState(_))));
    }
}
