//! Model registry
//!
//! Ordered, append-only list of the node's models. Lookups go by
//! `(kind, within-kind index)` for the application and by composition slot
//! for the stack.

use std::fmt;

use crate::composition::SlotRef;
use crate::descriptor::{ModelDescriptor, ModelKind, MAX_MODELS};
use crate::error::{NodeError, Result};
use crate::state::RuntimeState;

/// Stable handle to a registry entry (its registration position)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelHandle(usize);

impl ModelHandle {
    pub fn position(&self) -> usize {
        self.0
    }
}

impl fmt::Display for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
pub struct RegistryEntry {
    kind: ModelKind,
    index: usize,
    descriptor: ModelDescriptor,
    slot: SlotRef,
    setup_slot: Option<SlotRef>,
    state: RuntimeState,
}

impl RegistryEntry {
    pub(crate) fn new(
        index: usize,
        descriptor: ModelDescriptor,
        slot: SlotRef,
        setup_slot: Option<SlotRef>,
        state: RuntimeState,
    ) -> Self {
        RegistryEntry {
            kind: descriptor.kind(),
            index,
            descriptor,
            slot,
            setup_slot,
            state,
        }
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    /// Within-kind index
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    /// Primary composition slot
    pub fn slot(&self) -> SlotRef {
        self.slot
    }

    /// Sensor Setup Server slot, for sensors
    pub fn setup_slot(&self) -> Option<SlotRef> {
        self.setup_slot
    }

    pub fn owns(&self, slot: SlotRef) -> bool {
        self.slot == slot || self.setup_slot == Some(slot)
    }

    pub fn state(&self) -> &RuntimeState {
        &self.state
    }
}

#[derive(Debug)]
pub struct Registry {
    entries: Vec<RegistryEntry>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            entries: Vec::with_capacity(MAX_MODELS),
        }
    }

    pub(crate) fn register(&mut self, entry: RegistryEntry) -> Result<ModelHandle> {
        if self.entries.len() >= MAX_MODELS {
            return Err(NodeError::CapacityExceeded {
                count: self.entries.len() + 1,
                max: MAX_MODELS,
            });
        }
        let handle = ModelHandle(self.entries.len());
        log::debug!(
            "Registered {} #{} at {} as {}",
            entry.kind,
            entry.index,
            entry.slot,
            handle
        );
        self.entries.push(entry);
        Ok(handle)
    }

    /// The `index`-th registered model of `kind`
    pub fn find(&self, kind: ModelKind, index: usize) -> Option<&RegistryEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.kind == kind)
            .nth(index)
    }

    pub fn find_handle(&self, kind: ModelKind, index: usize) -> Option<ModelHandle> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.kind == kind)
            .nth(index)
            .map(|(position, _)| ModelHandle(position))
    }

    /// The model that owns a composition slot
    pub fn find_by_slot(&self, slot: SlotRef) -> Option<&RegistryEntry> {
        self.entries.iter().find(|entry| entry.owns(slot))
    }

    pub fn get(&self, handle: ModelHandle) -> Option<&RegistryEntry> {
        self.entries.get(handle.0)
    }

    pub fn count(&self, kind: ModelKind) -> usize {
        self.entries.iter().filter(|entry| entry.kind == kind).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.iter()
    }
}
