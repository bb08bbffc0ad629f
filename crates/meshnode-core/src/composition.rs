//! Composition layout
//!
//! The node has a single element holding two flat model arrays, one for SIG
//! models and one for vendor models. Both arrays are sized once from the
//! descriptor table and never grow, so a [`SlotRef`] stays valid for the
//! lifetime of the node. The Configuration Server always sits in SIG slot 0.
//!
//! Layout of composition data page 0:
//! ```text
//! CID(2) PID(2) VID(2) CRPL(2) Features(2)
//! Loc(2) NumS(1) NumV(1) SIG model ids (2 each) vendor model ids (4 each)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};

use crate::alloc::{AllocStage, Arena, Tracked};
use crate::descriptor::{DescriptorTable, ModelDescriptor, ModelParams, MAX_MODELS};
use crate::error::{NodeError, Result};
use crate::registry::{ModelHandle, Registry, RegistryEntry};
use crate::state::{BatteryState, DimmerState, RuntimeState, SensorState, SwitchState, VendorState};
use meshnode_protocol::{Address, ModelId, Opcode, VendorOpcode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    Sig,
    Vendor,
}

/// Position of a model record in one of the two arrays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotRef {
    pub kind: SlotKind,
    pub index: usize,
}

impl SlotRef {
    pub const CONFIG_SERVER: SlotRef = SlotRef::sig(0);

    pub const fn sig(index: usize) -> Self {
        SlotRef {
            kind: SlotKind::Sig,
            index,
        }
    }

    pub const fn vendor(index: usize) -> Self {
        SlotRef {
            kind: SlotKind::Vendor,
            index,
        }
    }
}

impl fmt::Display for SlotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SlotKind::Sig => write!(f, "sig[{}]", self.index),
            SlotKind::Vendor => write!(f, "vendor[{}]", self.index),
        }
    }
}

/// One model as the stack sees it
pub struct ModelRecord {
    model_id: ModelId,
    publication: bool,
    publish_address: AtomicU16,
    opcodes: Box<[VendorOpcode]>,
}

impl ModelRecord {
    pub fn sig(model_id: ModelId, publication: bool) -> Self {
        ModelRecord {
            model_id,
            publication,
            publish_address: AtomicU16::new(Address::UNASSIGNED.as_u16()),
            opcodes: Box::new([]),
        }
    }

    pub fn vendor(
        company_id: u16,
        model_id: u16,
        opcodes: &[VendorOpcode],
        publication: bool,
    ) -> Self {
        ModelRecord {
            model_id: ModelId::Vendor {
                company_id,
                model_id,
            },
            publication,
            publish_address: AtomicU16::new(Address::UNASSIGNED.as_u16()),
            opcodes: opcodes.into(),
        }
    }

    pub fn model_id(&self) -> ModelId {
        self.model_id
    }

    /// Whether the model has a publication context
    pub fn has_publication(&self) -> bool {
        self.publication
    }

    pub fn publish_address(&self) -> Address {
        Address::new(self.publish_address.load(Ordering::Acquire))
    }

    pub fn set_publish_address(&self, address: Address) {
        self.publish_address
            .store(address.as_u16(), Ordering::Release);
    }

    /// Opcode allow-list (vendor models only)
    pub fn opcodes(&self) -> &[VendorOpcode] {
        &self.opcodes
    }

    pub fn allows(&self, opcode: Opcode) -> bool {
        self.opcodes.iter().any(|op| Opcode::from(*op) == opcode)
    }
}

impl fmt::Debug for ModelRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRecord")
            .field("model_id", &self.model_id)
            .field("publication", &self.publication)
            .field("publish_address", &self.publish_address())
            .field("opcodes", &self.opcodes)
            .finish()
    }
}

/// Fixed-capacity array of model records
#[derive(Debug)]
pub struct SlotArray {
    kind: SlotKind,
    capacity: usize,
    records: Tracked<Vec<ModelRecord>>,
}

impl SlotArray {
    fn new_in(arena: &Arena, kind: SlotKind, capacity: usize) -> Result<Self> {
        let stage = match kind {
            SlotKind::Sig => AllocStage::SigSlots,
            SlotKind::Vendor => AllocStage::VendorSlots,
        };
        Ok(SlotArray {
            kind,
            capacity,
            records: arena.array(stage, capacity)?,
        })
    }

    /// Write the record into the next free slot
    pub fn push(&mut self, record: ModelRecord) -> Result<SlotRef> {
        if self.records.len() >= self.capacity {
            return Err(NodeError::InvalidState(format!(
                "{:?} model array full ({} slots)",
                self.kind, self.capacity
            )));
        }
        let slot = SlotRef {
            kind: self.kind,
            index: self.records.len(),
        };
        self.records.push(record);
        Ok(slot)
    }

    pub fn get(&self, index: usize) -> Option<&ModelRecord> {
        self.records.get(index)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.records.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelRecord> {
        self.records.iter()
    }
}

/// Node-wide fields of composition data page 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositionHeader {
    pub company_id: u16,
    pub product_id: u16,
    pub version_id: u16,
    /// Minimum replay protection list size
    pub replay_list_size: u16,
    pub features: u16,
}

impl CompositionHeader {
    pub const FEATURE_RELAY: u16 = 0x0001;
    pub const FEATURE_PROXY: u16 = 0x0002;
    pub const FEATURE_FRIEND: u16 = 0x0004;
    pub const FEATURE_LOW_POWER: u16 = 0x0008;
}

impl Default for CompositionHeader {
    fn default() -> Self {
        CompositionHeader {
            company_id: 0xFFFF,
            product_id: 0x0000,
            version_id: 0x0000,
            replay_list_size: 10,
            features: 0,
        }
    }
}

/// The single element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Element {
    pub location: u16,
    pub sig_count: usize,
    pub vendor_count: usize,
}

/// Slots needed for a descriptor table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotCounts {
    pub sig: usize,
    pub vendor: usize,
}

impl SlotCounts {
    /// Configuration Server plus the slots of every descriptor
    pub fn for_descriptors<'a>(descriptors: impl IntoIterator<Item = &'a ModelDescriptor>) -> Self {
        descriptors.into_iter().fold(
            SlotCounts { sig: 1, vendor: 0 },
            |counts, descriptor| SlotCounts {
                sig: counts.sig + descriptor.kind().sig_slots(),
                vendor: counts.vendor + descriptor.kind().vendor_slots(),
            },
        )
    }

    pub fn of(table: &DescriptorTable) -> Self {
        Self::for_descriptors(table.iter())
    }
}

#[derive(Debug)]
pub struct Composition {
    header: CompositionHeader,
    element: Element,
    sig: SlotArray,
    vendor: SlotArray,
}

impl Composition {
    pub fn header(&self) -> &CompositionHeader {
        &self.header
    }

    pub fn element(&self) -> &Element {
        &self.element
    }

    pub fn sig_models(&self) -> &SlotArray {
        &self.sig
    }

    pub fn vendor_models(&self) -> &SlotArray {
        &self.vendor
    }

    pub fn record(&self, slot: SlotRef) -> Option<&ModelRecord> {
        match slot.kind {
            SlotKind::Sig => self.sig.get(slot.index),
            SlotKind::Vendor => self.vendor.get(slot.index),
        }
    }

    pub fn model_count(&self) -> usize {
        self.sig.len() + self.vendor.len()
    }

    /// Composition data page 0
    pub fn page0(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(14 + 2 * self.sig.len() + 4 * self.vendor.len());
        for field in [
            self.header.company_id,
            self.header.product_id,
            self.header.version_id,
            self.header.replay_list_size,
            self.header.features,
            self.element.location,
        ] {
            out.extend_from_slice(&field.to_le_bytes());
        }
        out.push(self.sig.len() as u8);
        out.push(self.vendor.len() as u8);
        for record in self.sig.iter().chain(self.vendor.iter()) {
            record.model_id().write_to(&mut out);
        }
        out
    }
}

/// Step-wise composition builder.
///
/// `new` sizes both arrays and places the Configuration Server, `place`
/// allocates one model and writes its records, `finish` checks every slot
/// was filled. A failed `place` leaves nothing behind for that descriptor;
/// earlier models stay in place.
pub struct CompositionBuilder {
    arena: Arena,
    header: CompositionHeader,
    counts: SlotCounts,
    sig: SlotArray,
    vendor: SlotArray,
    registry: Registry,
}

impl CompositionBuilder {
    pub fn new(arena: &Arena, header: CompositionHeader, counts: SlotCounts) -> Result<Self> {
        let mut sig = SlotArray::new_in(arena, SlotKind::Sig, counts.sig)?;
        let vendor = SlotArray::new_in(arena, SlotKind::Vendor, counts.vendor)?;
        sig.push(ModelRecord::sig(ModelId::CONFIG_SERVER, false))?;

        Ok(CompositionBuilder {
            arena: arena.clone(),
            header,
            counts,
            sig,
            vendor,
            registry: Registry::new(),
        })
    }

    pub fn counts(&self) -> SlotCounts {
        self.counts
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Allocate runtime state for `descriptor` and place its records
    pub fn place(&mut self, descriptor: &ModelDescriptor) -> Result<ModelHandle> {
        descriptor.validate()?;
        let kind = descriptor.kind();

        if self.registry.len() >= MAX_MODELS {
            return Err(NodeError::CapacityExceeded {
                count: self.registry.len() + 1,
                max: MAX_MODELS,
            });
        }
        if self.sig.remaining() < kind.sig_slots() || self.vendor.remaining() < kind.vendor_slots() {
            return Err(NodeError::InvalidState(format!(
                "{} model does not fit the composition ({} SIG, {} vendor slots left)",
                kind,
                self.sig.remaining(),
                self.vendor.remaining()
            )));
        }

        let index = self.registry.count(kind);
        let publication = descriptor.publication;
        let arena = &self.arena;

        // Allocate first: a failure here has not touched the arrays yet
        let (state, records) = match &descriptor.params {
            ModelParams::Switch { observer, initial } => (
                RuntimeState::Switch(SwitchState::new_in(
                    arena,
                    observer.clone(),
                    *initial,
                    publication,
                )?),
                vec![ModelRecord::sig(ModelId::GENERIC_ONOFF_SERVER, publication)],
            ),
            ModelParams::Dimmer { observer, initial } => (
                RuntimeState::Dimmer(DimmerState::new_in(
                    arena,
                    observer.clone(),
                    *initial,
                    publication,
                )?),
                vec![ModelRecord::sig(ModelId::GENERIC_LEVEL_SERVER, publication)],
            ),
            ModelParams::Sensor { channels } => (
                RuntimeState::Sensor(SensorState::new_in(arena, channels, publication)?),
                vec![
                    ModelRecord::sig(ModelId::SENSOR_SERVER, publication),
                    ModelRecord::sig(ModelId::SENSOR_SETUP_SERVER, true),
                ],
            ),
            ModelParams::Battery {
                reader,
                publish_period_ms,
            } => (
                RuntimeState::Battery(BatteryState::new_in(
                    arena,
                    reader.clone(),
                    *publish_period_ms,
                    publication,
                )?),
                vec![ModelRecord::sig(ModelId::GENERIC_BATTERY_SERVER, publication)],
            ),
            ModelParams::Vendor {
                company_id,
                model_id,
                opcodes,
                handler,
            } => (
                RuntimeState::Vendor(VendorState::new_in(
                    arena,
                    *company_id,
                    *model_id,
                    handler.clone(),
                )?),
                vec![ModelRecord::vendor(*company_id, *model_id, opcodes, publication)],
            ),
        };

        let mut slots = Vec::with_capacity(records.len());
        for record in records {
            let slot = if record.model_id().is_vendor() {
                self.vendor.push(record)?
            } else {
                self.sig.push(record)?
            };
            slots.push(slot);
        }

        let handle = self.registry.register(RegistryEntry::new(
            index,
            descriptor.clone(),
            slots[0],
            slots.get(1).copied(),
            state,
        ))?;

        log::info!("Added {} model #{} at {}", kind, index, slots[0]);
        Ok(handle)
    }

    pub fn finish(self) -> Result<(Composition, Registry)> {
        if self.sig.remaining() != 0 || self.vendor.remaining() != 0 {
            return Err(NodeError::InvalidState(format!(
                "composition incomplete: {}/{} SIG and {}/{} vendor slots placed",
                self.sig.len(),
                self.sig.capacity(),
                self.vendor.len(),
                self.vendor.capacity()
            )));
        }

        let element = Element {
            location: 0x0000,
            sig_count: self.sig.len(),
            vendor_count: self.vendor.len(),
        };
        log::info!(
            "Composition built: {} SIG models, {} vendor models",
            element.sig_count,
            element.vendor_count
        );

        Ok((
            Composition {
                header: self.header,
                element,
                sig: self.sig,
                vendor: self.vendor,
            },
            self.registry,
        ))
    }

    /// Build the whole composition from a validated table
    pub fn build(
        arena: &Arena,
        header: CompositionHeader,
        table: &DescriptorTable,
    ) -> Result<(Composition, Registry)> {
        let counts = SlotCounts::of(table);
        log::info!(
            "Building composition: {} descriptors, {} SIG slots, {} vendor slots",
            table.len(),
            counts.sig,
            counts.vendor
        );

        let mut builder = CompositionBuilder::new(arena, header, counts)?;
        for (position, descriptor) in table.iter().enumerate() {
            if let Err(e) = builder.place(descriptor) {
                log::error!(
                    "Failed to place descriptor {} ({}): {}",
                    position,
                    descriptor.kind(),
                    e
                );
                return Err(e);
            }
        }
        builder.finish()
    }
}

impl fmt::Debug for CompositionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositionBuilder")
            .field("counts", &self.counts)
            .field("sig_placed", &self.sig.len())
            .field("vendor_placed", &self.vendor.len())
            .field("models", &self.registry.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::AllocPolicy;
    use crate::descriptor::{ModelKind, SensorChannel};
    use crate::observer::{ReadError, SensorReader};
    use std::sync::Arc;

    fn sensor(ids: &[u16]) -> ModelDescriptor {
        let reader: Arc<dyn SensorReader> =
            Arc::new(|_: u16| -> std::result::Result<i32, ReadError> { Ok(0) });
        ModelDescriptor::sensor(ids.iter().map(|&id| SensorChannel::new(id, reader.clone())).collect())
    }

    fn vendor() -> ModelDescriptor {
        ModelDescriptor::vendor(0x0001, 0x0001, vec![VendorOpcode::IMU_DATA], None)
    }

    #[test]
    fn test_slot_counts() {
        let table = DescriptorTable::new(&[
            ModelDescriptor::switch(None),
            sensor(&[0x5001]),
            ModelDescriptor::battery(None, 0),
            vendor(),
            sensor(&[0x5002]),
        ])
        .unwrap();

        // n = 5, s = 2, v = 1: SIG = 1 + (5 - 2 - 1) + 2 * 2
        assert_eq!(SlotCounts::of(&table), SlotCounts { sig: 7, vendor: 1 });
        assert_eq!(
            SlotCounts::of(&DescriptorTable::new(&[]).unwrap()),
            SlotCounts { sig: 1, vendor: 0 }
        );
    }

    #[test]
    fn test_build_layout() {
        let arena = Arena::unbounded();
        let table = DescriptorTable::new(&[
            ModelDescriptor::switch(None),
            vendor(),
            sensor(&[0x5001, 0x5002]),
            ModelDescriptor::dimmer(None),
        ])
        .unwrap();

        let (composition, registry) =
            CompositionBuilder::build(&arena, CompositionHeader::default(), &table).unwrap();

        let ids: Vec<_> = composition.sig_models().iter().map(|r| r.model_id()).collect();
        assert_eq!(
            ids,
            vec![
                ModelId::CONFIG_SERVER,
                ModelId::GENERIC_ONOFF_SERVER,
                ModelId::SENSOR_SERVER,
                ModelId::SENSOR_SETUP_SERVER,
                ModelId::GENERIC_LEVEL_SERVER,
            ]
        );
        assert_eq!(composition.vendor_models().len(), 1);
        assert_eq!(composition.element().sig_count, 5);
        assert_eq!(composition.element().vendor_count, 1);

        let sensor = registry.find(ModelKind::Sensor, 0).unwrap();
        assert_eq!(sensor.slot(), SlotRef::sig(2));
        assert_eq!(sensor.setup_slot(), Some(SlotRef::sig(3)));
        assert_eq!(registry.find(ModelKind::Vendor, 0).unwrap().slot(), SlotRef::vendor(0));
        assert_eq!(registry.find(ModelKind::Dimmer, 0).unwrap().slot(), SlotRef::sig(4));
    }

    #[test]
    fn test_setup_server_always_publishes() {
        let arena = Arena::unbounded();
        let table = DescriptorTable::new(&[sensor(&[0x5001]).with_publication(false)]).unwrap();
        let (composition, _) =
            CompositionBuilder::build(&arena, CompositionHeader::default(), &table).unwrap();

        assert!(!composition.record(SlotRef::sig(1)).unwrap().has_publication());
        assert!(composition.record(SlotRef::sig(2)).unwrap().has_publication());
    }

    #[test]
    fn test_page0_encoding() {
        let arena = Arena::unbounded();
        let table = DescriptorTable::new(&[ModelDescriptor::switch(None), vendor()]).unwrap();
        let header = CompositionHeader {
            company_id: 0x02E5,
            product_id: 0x0001,
            version_id: 0x0002,
            replay_list_size: 10,
            features: CompositionHeader::FEATURE_PROXY,
        };
        let (composition, _) = CompositionBuilder::build(&arena, header, &table).unwrap();

        assert_eq!(
            composition.page0(),
            vec![
                0xE5, 0x02, 0x01, 0x00, 0x02, 0x00, 0x0A, 0x00, 0x02, 0x00, // header
                0x00, 0x00, 0x02, 0x01, // element
                0x00, 0x00, 0x00, 0x10, // config + onoff
                0x01, 0x00, 0x01, 0x00, // vendor
            ]
        );
    }

    #[test]
    fn test_publish_address_defaults_unassigned() {
        let record = ModelRecord::sig(ModelId::GENERIC_ONOFF_SERVER, true);
        assert!(record.publish_address().is_unassigned());
        record.set_publish_address(Address::new(0xC000));
        assert_eq!(record.publish_address(), Address::new(0xC000));
    }

    #[test]
    fn test_vendor_allow_list() {
        let record = ModelRecord::vendor(0x0001, 0x0001, &[VendorOpcode::IMU_DATA], true);
        assert!(record.allows(VendorOpcode::IMU_DATA.into()));
        assert!(!record.allows(VendorOpcode::IMU_GYRO.into()));
        assert!(!record.allows(Opcode::GENERIC_ONOFF_SET));
    }

    #[test]
    fn test_slot_array_never_grows() {
        let arena = Arena::unbounded();
        let mut array = SlotArray::new_in(&arena, SlotKind::Sig, 1).unwrap();
        array.push(ModelRecord::sig(ModelId::CONFIG_SERVER, false)).unwrap();
        assert!(array.push(ModelRecord::sig(ModelId::GENERIC_ONOFF_SERVER, false)).is_err());
        assert_eq!(array.len(), 1);
    }

    #[test]
    fn test_place_rejects_unplanned_descriptor() {
        let arena = Arena::unbounded();
        let counts = SlotCounts::for_descriptors(&[ModelDescriptor::switch(None)]);
        let mut builder = CompositionBuilder::new(&arena, CompositionHeader::default(), counts).unwrap();

        builder.place(&ModelDescriptor::switch(None)).unwrap();
        let before = arena.stats();
        assert!(builder.place(&sensor(&[0x5001])).is_err());
        assert_eq!(arena.stats().live_count, before.live_count);
    }

    #[test]
    fn test_finish_requires_every_slot() {
        let arena = Arena::unbounded();
        let counts = SlotCounts::for_descriptors(&[ModelDescriptor::switch(None)]);
        let builder = CompositionBuilder::new(&arena, CompositionHeader::default(), counts).unwrap();
        assert!(matches!(builder.finish(), Err(NodeError::InvalidState(_))));
    }

    #[test]
    fn test_failed_place_keeps_earlier_models() {
        let arena = Arena::new(AllocPolicy::FailOnStage(AllocStage::SensorSetupBuffer));
        let descriptors = [ModelDescriptor::switch(None), sensor(&[0x5001, 0x5002])];
        let counts = SlotCounts::for_descriptors(&descriptors);
        let mut builder = CompositionBuilder::new(&arena, CompositionHeader::default(), counts).unwrap();

        builder.place(&descriptors[0]).unwrap();
        let before = arena.stats();

        let err = builder.place(&descriptors[1]).unwrap_err();
        assert!(matches!(
            err,
            NodeError::OutOfMemory {
                stage: AllocStage::SensorSetupBuffer,
                ..
            }
        ));
        assert_eq!(arena.stats().live_count, before.live_count);
        assert_eq!(arena.stats().live_bytes, before.live_bytes);
        assert_eq!(builder.registry().len(), 1);
        assert!(builder.registry().find(ModelKind::Switch, 0).is_some());
    }
}
