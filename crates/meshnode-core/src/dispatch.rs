//! Inbound event dispatch
//!
//! Routes stack events to the registry entry they concern. A lookup miss is
//! logged and dropped; nothing here can fail the node.
//!
//! Generic state changes (OnOff Set, Level Set) go to the *first* model of
//! the matching kind, whichever slot received them. Vendor operations are
//! matched by slot and do tell instances apart. With several switches or
//! dimmers the generic path therefore always lands on instance 0; a slot
//! mismatch is logged so it shows up in traces.

use crate::composition::SlotRef;
use crate::descriptor::ModelKind;
use crate::event::{
    ConfigEvent, GenericEvent, GenericValue, ProvisioningEvent, SensorEvent, StackEvent,
    VendorEvent,
};
use crate::node::{NodeContext, ProvisioningState};
use crate::observer::VendorMessage;
use crate::registry::RegistryEntry;
use crate::stack::MessageContext;
use crate::state::{RuntimeState, SensorState};
use crate::NodeError;
use meshnode_protocol::{MarshalledProperty, Opcode, PubBuffer, SensorDescriptor, VendorOpcode};

impl NodeContext {
    /// Handle one event delivered by the stack
    pub fn dispatch(&self, event: StackEvent) {
        match event {
            StackEvent::Provisioning(event) => self.on_provisioning(event),
            StackEvent::Config(event) => self.on_config(event),
            StackEvent::Generic(event) => self.on_generic(event),
            StackEvent::Sensor(event) => self.on_sensor(event),
            StackEvent::Vendor(event) => self.on_vendor(event),
            StackEvent::SendComplete {
                slot,
                opcode,
                result,
            } => match result {
                Ok(()) => log::debug!("Send complete: {} opcode {}", slot, opcode),
                Err(e) => log::warn!("Send failed: {} opcode {}: {}", slot, opcode, e),
            },
        }
    }

    fn on_provisioning(&self, event: ProvisioningEvent) {
        match event {
            ProvisioningEvent::Registered { result } => match result {
                Ok(()) => log::info!("Provisioning registered"),
                Err(e) => log::error!("Provisioning registration failed: {}", e),
            },
            ProvisioningEvent::LinkOpen => log::info!("Provisioning link opened"),
            ProvisioningEvent::LinkClose => log::info!("Provisioning link closed"),
            ProvisioningEvent::Complete {
                net_idx,
                unicast,
                iv_index,
            } => {
                self.update_provisioning(|state| {
                    state.provisioned = true;
                    state.unicast = unicast;
                    state.net_idx = net_idx;
                    state.iv_index = iv_index;
                });
                log::info!(
                    "Provisioning complete: unicast={} net_idx=0x{:03X} iv_index=0x{:08X}",
                    unicast,
                    net_idx,
                    iv_index
                );
                if let Some(observer) = self.observer() {
                    observer.provisioned(unicast);
                }
            }
            ProvisioningEvent::Reset => {
                self.update_provisioning(|state| *state = ProvisioningState::default());
                log::warn!("Node reset, provisioning data cleared");
                if let Some(observer) = self.observer() {
                    observer.reset();
                }
            }
        }
    }

    fn on_config(&self, event: ConfigEvent) {
        match event {
            ConfigEvent::AppKeyAdd { net_idx, app_idx } => {
                self.update_provisioning(|state| state.app_idx = Some(app_idx));
                log::info!(
                    "AppKey added: net_idx=0x{:03X} app_idx=0x{:03X}",
                    net_idx,
                    app_idx
                );
                if let Some(observer) = self.observer() {
                    observer.config_complete(app_idx);
                }
            }
            ConfigEvent::ModelAppBind { slot, app_idx } => match self.record(slot) {
                Ok(record) => log::info!(
                    "Model bound: {} {} app_idx=0x{:03X}",
                    slot,
                    record.model_id(),
                    app_idx
                ),
                Err(e) => log::warn!("App bind for {}: {}", slot, e),
            },
            ConfigEvent::ModelPubSet {
                slot,
                publish_address,
            } => match self.record(slot) {
                Ok(record) => {
                    record.set_publish_address(publish_address);
                    log::info!("Publication set: {} -> {}", slot, publish_address);
                }
                Err(e) => log::warn!("Publication set for {}: {}", slot, e),
            },
        }
    }

    fn on_generic(&self, event: GenericEvent) {
        match event {
            GenericEvent::StateChange {
                slot,
                opcode,
                ctx,
                value,
            } => self.on_state_change(slot, opcode, &ctx, value),
            GenericEvent::Get { slot, opcode, ctx } => {
                log::debug!("Generic get {} at {} from {}", opcode, slot, ctx.addr)
            }
            GenericEvent::Set { slot, opcode, ctx } => {
                log::debug!("Generic set {} at {} from {}", opcode, slot, ctx.addr)
            }
        }
    }

    fn first_of(&self, kind: ModelKind, slot: SlotRef) -> Option<&RegistryEntry> {
        let Some(entry) = self.registry().find(kind, 0) else {
            log::warn!("State change at {} but no {} model registered", slot, kind);
            return None;
        };
        if entry.slot() != slot {
            log::warn!(
                "State change received at {} applied to {} #0 at {} (dispatch by kind)",
                slot,
                kind,
                entry.slot()
            );
        }
        Some(entry)
    }

    fn on_state_change(
        &self,
        slot: SlotRef,
        opcode: Opcode,
        ctx: &MessageContext,
        value: GenericValue,
    ) {
        match (opcode, value) {
            (
                Opcode::GENERIC_ONOFF_SET | Opcode::GENERIC_ONOFF_SET_UNACK,
                GenericValue::OnOff(on),
            ) => {
                if let Some(entry) = self.first_of(ModelKind::Switch, slot) {
                    if let RuntimeState::Switch(state) = entry.state() {
                        state.set(on);
                        log::info!(
                            "Switch #{} -> {} (from {})",
                            entry.index(),
                            if on { "ON" } else { "OFF" },
                            ctx.addr
                        );
                        state.notify(entry.index(), on);
                    }
                }
            }
            (
                Opcode::GENERIC_LEVEL_SET | Opcode::GENERIC_LEVEL_SET_UNACK,
                GenericValue::Level(level),
            ) => {
                if let Some(entry) = self.first_of(ModelKind::Dimmer, slot) {
                    if let RuntimeState::Dimmer(state) = entry.state() {
                        state.set(level);
                        log::info!("Dimmer #{} -> {} (from {})", entry.index(), level, ctx.addr);
                        state.notify(entry.index(), level);
                    }
                }
            }
            (
                Opcode::GENERIC_DELTA_SET
                | Opcode::GENERIC_DELTA_SET_UNACK
                | Opcode::GENERIC_MOVE_SET
                | Opcode::GENERIC_MOVE_SET_UNACK,
                _,
            ) => log::debug!("Level transition {} at {}: {:?}", opcode, slot, value),
            _ => log::warn!("Unhandled state change {} at {}: {:?}", opcode, slot, value),
        }
    }

    /// Sensor owning `slot`, or the first sensor
    fn sensor_for(&self, slot: SlotRef) -> Option<(&RegistryEntry, &SensorState)> {
        let entry = self
            .registry()
            .find_by_slot(slot)
            .filter(|entry| entry.kind() == ModelKind::Sensor)
            .or_else(|| self.registry().find(ModelKind::Sensor, 0))?;
        match entry.state() {
            RuntimeState::Sensor(state) => Some((entry, state)),
            _ => None,
        }
    }

    fn on_sensor(&self, event: SensorEvent) {
        match event {
            SensorEvent::Get {
                slot,
                ctx,
                property_id,
            } => {
                let Some((entry, state)) = self.sensor_for(slot) else {
                    log::warn!("Sensor get at {} but no sensor model registered", slot);
                    return;
                };
                let payload = sensor_status(entry.index(), state, property_id);
                self.reply(entry.slot(), &ctx, Opcode::SENSOR_STATUS, &payload);
            }
            SensorEvent::DescriptorGet {
                slot,
                ctx,
                property_id,
            } => {
                let Some((entry, state)) = self.sensor_for(slot) else {
                    log::warn!("Sensor descriptor get at {} but no sensor model registered", slot);
                    return;
                };
                let payload = descriptor_status(state, property_id);
                self.reply(entry.slot(), &ctx, Opcode::SENSOR_DESCRIPTOR_STATUS, &payload);
            }
        }
    }

    fn reply(&self, slot: SlotRef, ctx: &MessageContext, opcode: Opcode, payload: &[u8]) {
        // send() already logs failures
        let _ = self.send(slot, &ctx.reply(), opcode, payload);
    }

    fn on_vendor(&self, event: VendorEvent) {
        let Some(entry) = self
            .registry()
            .iter()
            .find(|entry| entry.kind() == ModelKind::Vendor && entry.slot() == event.slot)
        else {
            log::warn!("Vendor message {} at {} matches no vendor model", event.opcode, event.slot);
            return;
        };

        let opcode = match VendorOpcode::try_from(event.opcode) {
            Ok(opcode) => opcode,
            Err(_) => {
                log::warn!("Non-vendor opcode {} at {}", event.opcode, event.slot);
                return;
            }
        };

        match self.record(entry.slot()) {
            Ok(record) if record.allows(event.opcode) => {}
            Ok(_) => {
                log::warn!(
                    "Vendor #{} dropped opcode {}: not in allow-list",
                    entry.index(),
                    opcode
                );
                return;
            }
            Err(e) => {
                log::warn!("Vendor #{}: {}", entry.index(), e);
                return;
            }
        }

        let RuntimeState::Vendor(state) = entry.state() else {
            return;
        };
        match state.handler() {
            Some(handler) => {
                log::debug!(
                    "Vendor #{} opcode {} len={} from {}",
                    entry.index(),
                    opcode,
                    event.payload.len(),
                    event.ctx.addr
                );
                handler.handle(&VendorMessage {
                    index: entry.index(),
                    opcode,
                    payload: &event.payload,
                    ctx: &event.ctx,
                });
            }
            None => log::warn!(
                "No handler registered for vendor model CID=0x{:04X} MID=0x{:04X}",
                state.company_id,
                state.model_id
            ),
        }
    }
}

/// Sensor Status for one property or all of them. Unknown properties and
/// failed reads are answered with the property id and an empty value.
///
/// The reply is sized from the properties it carries, not from the
/// publication buffer, so a Get for all channels answers every channel.
fn sensor_status(index: usize, state: &SensorState, property_id: Option<u16>) -> Vec<u8> {
    let ids: Vec<u16> = match property_id {
        Some(id) => vec![id],
        None => state.channels().iter().map(|c| c.property_id).collect(),
    };

    let properties: Vec<MarshalledProperty> = ids
        .into_iter()
        .map(|id| match state.read(id) {
            Ok(value) => {
                // read() found the channel, so storing cannot miss
                let _ = state.store_raw(id, value);
                MarshalledProperty::from_i32(id, value)
            }
            Err(NodeError::PropertyNotFound(_)) => {
                log::debug!("Sensor #{} has no property 0x{:04X}", index, id);
                MarshalledProperty::new(id, Vec::<u8>::new())
            }
            Err(e) => {
                log::warn!("Sensor #{}: {}", index, e);
                MarshalledProperty::new(id, Vec::<u8>::new())
            }
        })
        .collect();

    let size = properties.iter().map(MarshalledProperty::encoded_len).sum();
    let mut buf = PubBuffer::with_capacity(size);
    for property in &properties {
        if let Err(e) = property.encode(&mut buf) {
            log::warn!(
                "Sensor #{} property 0x{:04X} not encoded: {}",
                index,
                property.property_id,
                e
            );
        }
    }
    buf.as_slice().to_vec()
}

/// Sensor Descriptor Status. An unknown property is answered with its id only.
fn descriptor_status(state: &SensorState, property_id: Option<u16>) -> Vec<u8> {
    let descriptors: Vec<SensorDescriptor> = match property_id {
        Some(id) => match state.channel(id) {
            Some(channel) => vec![channel.descriptor],
            None => return id.to_le_bytes().to_vec(),
        },
        None => state.descriptors(),
    };

    let mut buf = PubBuffer::with_capacity(descriptors.len() * SensorDescriptor::SIZE);
    for descriptor in &descriptors {
        if let Err(e) = descriptor.encode(&mut buf) {
            log::warn!("Descriptor 0x{:04X} not encoded: {}", descriptor.property_id, e);
        }
    }
    buf.as_slice().to_vec()
}
