//! Per-model runtime state
//!
//! Each model instance owns one state block allocated from the arena. The
//! mutable part sits behind a per-instance mutex so the stack dispatcher and
//! application threads are serialized per model. Observers, readers and
//! handlers live outside the lock and are only invoked with it released.

use std::fmt;
use std::mem::size_of;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::alloc::{AllocStage, Allocation, Arena, Tracked};
use crate::descriptor::SensorChannel;
use crate::error::{NodeError, Result};
use crate::observer::{BatteryReader, DimmerObserver, SensorReader, SwitchObserver, VendorHandler};
use meshnode_protocol::sensor::SENSOR_STATUS_BUFFER_SIZE;
use meshnode_protocol::status::{BATTERY_STATUS_SIZE, LEVEL_STATUS_SIZE, ONOFF_STATUS_SIZE};
use meshnode_protocol::{CodecError, PubBuffer, SensorDescriptor};

/// Size of one sensor raw-value buffer
pub const RAW_VALUE_SIZE: usize = 4;

/// Battery level reported before the first reading
pub const DEFAULT_BATTERY_LEVEL: u8 = 100;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Switch/dimmer update cycle. There is no pending state: the last write wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    Idle,
    Updating,
}

fn publication_buffer(
    arena: &Arena,
    stage: AllocStage,
    enabled: bool,
    size: usize,
) -> Result<Option<Tracked<PubBuffer>>> {
    if enabled {
        Ok(Some(arena.buffer(stage, size)?))
    } else {
        Ok(None)
    }
}

/// Reset `buffer`, fill it with `encode` and hand the payload to `send`
fn publish_into<E, S>(buffer: &mut PubBuffer, encode: E, send: S) -> Result<()>
where
    E: FnOnce(&mut PubBuffer) -> std::result::Result<(), CodecError>,
    S: FnOnce(&[u8]) -> Result<()>,
{
    buffer.reset();
    encode(buffer)?;
    send(buffer.as_slice())
}

/// Value, phase and publication buffer of a switch or dimmer
pub(crate) struct ScalarInner<V> {
    value: V,
    phase: UpdatePhase,
    publication: Option<Tracked<PubBuffer>>,
}

/// State shared by the generic on/off and level servers
pub struct ScalarState<V, O: ?Sized> {
    _block: Allocation,
    observer: Option<Arc<O>>,
    inner: Mutex<ScalarInner<V>>,
}

pub type SwitchState = ScalarState<bool, dyn SwitchObserver>;
pub type DimmerState = ScalarState<i16, dyn DimmerObserver>;

impl<V: Copy, O: ?Sized> ScalarState<V, O> {
    fn allocate(
        arena: &Arena,
        stage: AllocStage,
        observer: Option<Arc<O>>,
        publication: Option<usize>,
        initial: V,
    ) -> Result<Self> {
        let block = arena.reserve(stage, size_of::<Self>())?;
        let publication = publication_buffer(
            arena,
            AllocStage::PublicationBuffer,
            publication.is_some(),
            publication.unwrap_or(0),
        )?;

        Ok(ScalarState {
            _block: block,
            observer,
            inner: Mutex::new(ScalarInner {
                value: initial,
                phase: UpdatePhase::Idle,
                publication,
            }),
        })
    }

    pub fn value(&self) -> V {
        lock(&self.inner).value
    }

    pub fn phase(&self) -> UpdatePhase {
        lock(&self.inner).phase
    }

    pub fn has_publication(&self) -> bool {
        lock(&self.inner).publication.is_some()
    }

    pub(crate) fn set(&self, value: V) {
        lock(&self.inner).value = value;
    }

    /// Encode the current value into the publication buffer and send it
    pub(crate) fn publish<E, S>(&self, encode: E, send: S) -> Result<()>
    where
        E: FnOnce(&mut PubBuffer, V) -> std::result::Result<(), CodecError>,
        S: FnOnce(&[u8]) -> Result<()>,
    {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        let value = inner.value;
        let buffer = inner
            .publication
            .as_mut()
            .ok_or_else(|| NodeError::InvalidState("publication disabled".to_string()))?;

        inner.phase = UpdatePhase::Updating;
        let result = publish_into(buffer, |buf| encode(buf, value), send);
        inner.phase = UpdatePhase::Idle;
        result
    }
}

impl SwitchState {
    pub(crate) fn new_in(
        arena: &Arena,
        observer: Option<Arc<dyn SwitchObserver>>,
        initial: bool,
        publication: bool,
    ) -> Result<Self> {
        Self::allocate(
            arena,
            AllocStage::SwitchState,
            observer,
            publication.then_some(ONOFF_STATUS_SIZE),
            initial,
        )
    }

    pub(crate) fn notify(&self, index: usize, on: bool) {
        if let Some(observer) = &self.observer {
            observer.on_change(index, on);
        }
    }
}

impl DimmerState {
    pub(crate) fn new_in(
        arena: &Arena,
        observer: Option<Arc<dyn DimmerObserver>>,
        initial: i16,
        publication: bool,
    ) -> Result<Self> {
        Self::allocate(
            arena,
            AllocStage::DimmerState,
            observer,
            publication.then_some(LEVEL_STATUS_SIZE),
            initial,
        )
    }

    pub(crate) fn notify(&self, index: usize, level: i16) {
        if let Some(observer) = &self.observer {
            observer.on_change(index, level);
        }
    }
}

impl<V: fmt::Debug + Copy, O: ?Sized> fmt::Debug for ScalarState<V, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("ScalarState")
            .field("value", &inner.value)
            .field("phase", &inner.phase)
            .field("publication", &inner.publication.is_some())
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

/// One configured sensor property
pub struct SensorChannelState {
    pub property_id: u16,
    pub publish_period_ms: u32,
    pub descriptor: SensorDescriptor,
    reader: Arc<dyn SensorReader>,
}

impl SensorChannelState {
    pub(crate) fn reader(&self) -> &Arc<dyn SensorReader> {
        &self.reader
    }
}

impl fmt::Debug for SensorChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SensorChannelState")
            .field("property_id", &format_args!("0x{:04X}", self.property_id))
            .field("publish_period_ms", &self.publish_period_ms)
            .finish_non_exhaustive()
    }
}

struct SensorInner {
    raw: Vec<Tracked<[u8; RAW_VALUE_SIZE]>>,
    status: Option<Tracked<PubBuffer>>,
    /// Publication context of the Sensor Setup Server
    setup: Tracked<PubBuffer>,
}

pub struct SensorState {
    _block: Allocation,
    channels: Tracked<Vec<SensorChannelState>>,
    inner: Mutex<SensorInner>,
}

impl SensorState {
    /// Allocate in order: state block, property descriptors, one raw buffer
    /// per channel, status buffer (with publication), setup buffer. A failing
    /// stage drops every earlier one.
    pub(crate) fn new_in(
        arena: &Arena,
        channels: &[SensorChannel],
        publication: bool,
    ) -> Result<Self> {
        let block = arena.reserve(AllocStage::SensorState, size_of::<Self>())?;

        let mut states = arena.array(AllocStage::SensorDescriptors, channels.len())?;
        states.extend(channels.iter().map(|channel| SensorChannelState {
            property_id: channel.property_id,
            publish_period_ms: channel.publish_period_ms,
            descriptor: SensorDescriptor::unspecified(channel.property_id),
            reader: channel.reader.clone(),
        }));

        let mut raw = Vec::with_capacity(channels.len());
        for _ in channels {
            raw.push(arena.alloc(AllocStage::SensorRawBuffer, RAW_VALUE_SIZE, [0u8; RAW_VALUE_SIZE])?);
        }

        let status = publication_buffer(
            arena,
            AllocStage::SensorStatusBuffer,
            publication,
            SENSOR_STATUS_BUFFER_SIZE,
        )?;
        let setup = arena.buffer(AllocStage::SensorSetupBuffer, SENSOR_STATUS_BUFFER_SIZE)?;

        Ok(SensorState {
            _block: block,
            channels: states,
            inner: Mutex::new(SensorInner { raw, status, setup }),
        })
    }

    pub fn channels(&self) -> &[SensorChannelState] {
        &self.channels
    }

    pub fn channel(&self, property_id: u16) -> Option<&SensorChannelState> {
        self.channels.iter().find(|c| c.property_id == property_id)
    }

    fn position(&self, property_id: u16) -> Result<usize> {
        self.channels
            .iter()
            .position(|c| c.property_id == property_id)
            .ok_or(NodeError::PropertyNotFound(property_id))
    }

    pub fn descriptors(&self) -> Vec<SensorDescriptor> {
        self.channels.iter().map(|c| c.descriptor).collect()
    }

    /// Last value stored for `property_id`
    pub fn raw_value(&self, property_id: u16) -> Result<i32> {
        let position = self.position(property_id)?;
        Ok(i32::from_le_bytes(*lock(&self.inner).raw[position]))
    }

    pub(crate) fn store_raw(&self, property_id: u16, value: i32) -> Result<()> {
        let position = self.position(property_id)?;
        *lock(&self.inner).raw[position] = value.to_le_bytes();
        Ok(())
    }

    pub fn has_publication(&self) -> bool {
        lock(&self.inner).status.is_some()
    }

    pub fn setup_capacity(&self) -> usize {
        lock(&self.inner).setup.capacity()
    }

    /// Read one property through its reader. Runs without the state lock.
    pub(crate) fn read(&self, property_id: u16) -> Result<i32> {
        let channel = self
            .channel(property_id)
            .ok_or(NodeError::PropertyNotFound(property_id))?;
        channel
            .reader()
            .read(property_id)
            .map_err(|e| NodeError::SensorRead {
                property_id,
                reason: e.to_string(),
            })
    }

    pub(crate) fn publish<E, S>(&self, encode: E, send: S) -> Result<()>
    where
        E: FnOnce(&mut PubBuffer) -> std::result::Result<(), CodecError>,
        S: FnOnce(&[u8]) -> Result<()>,
    {
        let mut inner = lock(&self.inner);
        let buffer = inner
            .status
            .as_mut()
            .ok_or_else(|| NodeError::InvalidState("publication disabled".to_string()))?;
        publish_into(buffer, encode, send)
    }
}

impl fmt::Debug for SensorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SensorState")
            .field("channels", &*self.channels)
            .field("publication", &self.has_publication())
            .finish()
    }
}

struct BatteryInner {
    level: u8,
    publication: Option<Tracked<PubBuffer>>,
}

pub struct BatteryState {
    _block: Allocation,
    reader: Option<Arc<dyn BatteryReader>>,
    publish_period_ms: u32,
    inner: Mutex<BatteryInner>,
}

impl BatteryState {
    pub(crate) fn new_in(
        arena: &Arena,
        reader: Option<Arc<dyn BatteryReader>>,
        publish_period_ms: u32,
        publication: bool,
    ) -> Result<Self> {
        let block = arena.reserve(AllocStage::BatteryState, size_of::<Self>())?;
        let publication = publication_buffer(
            arena,
            AllocStage::PublicationBuffer,
            publication,
            BATTERY_STATUS_SIZE,
        )?;

        Ok(BatteryState {
            _block: block,
            reader,
            publish_period_ms,
            inner: Mutex::new(BatteryInner {
                level: DEFAULT_BATTERY_LEVEL,
                publication,
            }),
        })
    }

    pub fn level(&self) -> u8 {
        lock(&self.inner).level
    }

    pub fn publish_period_ms(&self) -> u32 {
        self.publish_period_ms
    }

    pub fn has_publication(&self) -> bool {
        lock(&self.inner).publication.is_some()
    }

    /// Store a new level, clamped to 100
    pub(crate) fn set_level(&self, level: u8) -> u8 {
        let level = level.min(meshnode_protocol::BatteryStatus::MAX_LEVEL);
        lock(&self.inner).level = level;
        level
    }

    /// Refresh the cached level from the reader, if there is one.
    ///
    /// A failed read keeps the cached level.
    pub(crate) fn refresh(&self, index: usize) -> u8 {
        if let Some(reader) = &self.reader {
            match reader.read_level() {
                Ok(level) => return self.set_level(level),
                Err(e) => log::warn!("Battery #{} read failed: {}", index, e),
            }
        }
        self.level()
    }

    pub(crate) fn publish<E, S>(&self, encode: E, send: S) -> Result<()>
    where
        E: FnOnce(&mut PubBuffer, u8) -> std::result::Result<(), CodecError>,
        S: FnOnce(&[u8]) -> Result<()>,
    {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        let level = inner.level;
        let buffer = inner
            .publication
            .as_mut()
            .ok_or_else(|| NodeError::InvalidState("publication disabled".to_string()))?;
        publish_into(buffer, |buf| encode(buf, level), send)
    }
}

impl fmt::Debug for BatteryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatteryState")
            .field("level", &self.level())
            .field("publish_period_ms", &self.publish_period_ms)
            .field("reader", &self.reader.is_some())
            .finish()
    }
}

/// Vendor model state. Immutable after build; the opcode allow-list lives
/// on the composition record.
pub struct VendorState {
    _block: Allocation,
    pub company_id: u16,
    pub model_id: u16,
    handler: Option<Arc<dyn VendorHandler>>,
}

impl VendorState {
    pub(crate) fn new_in(
        arena: &Arena,
        company_id: u16,
        model_id: u16,
        handler: Option<Arc<dyn VendorHandler>>,
    ) -> Result<Self> {
        let block = arena.reserve(AllocStage::VendorState, size_of::<Self>())?;
        Ok(VendorState {
            _block: block,
            company_id,
            model_id,
            handler,
        })
    }

    pub(crate) fn handler(&self) -> Option<&Arc<dyn VendorHandler>> {
        self.handler.as_ref()
    }
}

impl fmt::Debug for VendorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VendorState")
            .field("company_id", &format_args!("0x{:04X}", self.company_id))
            .field("model_id", &format_args!("0x{:04X}", self.model_id))
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

/// Runtime state of one registered model
#[derive(Debug)]
pub enum RuntimeState {
    Switch(SwitchState),
    Dimmer(DimmerState),
    Sensor(SensorState),
    Battery(BatteryState),
    Vendor(VendorState),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::AllocPolicy;
    use crate::observer::ReadError;
    use meshnode_protocol::status;

    fn channels(ids: &[u16]) -> Vec<SensorChannel> {
        ids.iter()
            .map(|&id| {
                let reader: Arc<dyn SensorReader> =
                    Arc::new(move |p: u16| -> std::result::Result<i32, ReadError> { Ok(p as i32) });
                SensorChannel::new(id, reader)
            })
            .collect()
    }

    #[test]
    fn test_switch_publication_buffer() {
        let arena = Arena::unbounded();
        let state = SwitchState::new_in(&arena, None, false, true).unwrap();
        assert_eq!(arena.stats().live_bytes, size_of::<SwitchState>() + 1);

        state.set(true);
        let mut sent = Vec::new();
        state
            .publish(status::encode_onoff, |payload| {
                sent.extend_from_slice(payload);
                Ok(())
            })
            .unwrap();
        assert_eq!(sent, vec![1]);
        assert_eq!(state.phase(), UpdatePhase::Idle);
    }

    #[test]
    fn test_publication_disabled() {
        let arena = Arena::unbounded();
        let state = DimmerState::new_in(&arena, None, 0, false).unwrap();
        assert_eq!(arena.stats().live_count, 1);
        assert!(!state.has_publication());

        let err = state
            .publish(status::encode_level, |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, NodeError::InvalidState(_)));
    }

    #[test]
    fn test_publish_resets_buffer() {
        let arena = Arena::unbounded();
        let state = DimmerState::new_in(&arena, None, 0, true).unwrap();

        for level in [100i16, -100] {
            state.set(level);
            let mut sent = Vec::new();
            state
                .publish(status::encode_level, |payload| {
                    sent = payload.to_vec();
                    Ok(())
                })
                .unwrap();
            assert_eq!(sent, level.to_le_bytes().to_vec());
        }
    }

    #[test]
    fn test_initial_values() {
        let arena = Arena::unbounded();
        let switch = SwitchState::new_in(&arena, None, true, false).unwrap();
        let dimmer = DimmerState::new_in(&arena, None, -1200, false).unwrap();
        assert!(switch.value());
        assert_eq!(dimmer.value(), -1200);
    }

    #[test]
    fn test_failed_send_returns_to_idle() {
        let arena = Arena::unbounded();
        let state = SwitchState::new_in(&arena, None, false, true).unwrap();

        state.set(true);
        assert_eq!(state.phase(), UpdatePhase::Idle);
        let err = state
            .publish(status::encode_onoff, |_| {
                Err(NodeError::InvalidState("link down".to_string()))
            })
            .unwrap_err();
        assert!(matches!(err, NodeError::InvalidState(_)));
        assert_eq!(state.phase(), UpdatePhase::Idle);
        assert!(state.value());
    }

    #[test]
    fn test_sensor_allocation_layout() {
        let arena = Arena::unbounded();
        let state = SensorState::new_in(&arena, &channels(&[0x5001, 0x5002]), false).unwrap();

        // block + descriptors + 2 raw buffers + setup buffer
        assert_eq!(arena.stats().live_count, 5);
        assert!(!state.has_publication());
        assert_eq!(state.setup_capacity(), SENSOR_STATUS_BUFFER_SIZE);

        drop(state);
        assert_eq!(arena.stats().live_count, 0);
    }

    #[test]
    fn test_sensor_stage_failure_unwinds() {
        for stage in [
            AllocStage::SensorState,
            AllocStage::SensorDescriptors,
            AllocStage::SensorRawBuffer,
            AllocStage::SensorStatusBuffer,
            AllocStage::SensorSetupBuffer,
        ] {
            let arena = Arena::new(AllocPolicy::FailOnStage(stage));
            let err = SensorState::new_in(&arena, &channels(&[0x5001, 0x5002]), true).unwrap_err();
            assert!(matches!(err, NodeError::OutOfMemory { stage: s, .. } if s == stage));
            assert_eq!(arena.stats().live_count, 0, "stage {}", stage);
            assert_eq!(arena.stats().live_bytes, 0, "stage {}", stage);
        }
    }

    #[test]
    fn test_sensor_raw_values() {
        let arena = Arena::unbounded();
        let state = SensorState::new_in(&arena, &channels(&[0x5001]), true).unwrap();

        assert_eq!(state.read(0x5001).unwrap(), 0x5001);
        state.store_raw(0x5001, -7).unwrap();
        assert_eq!(state.raw_value(0x5001).unwrap(), -7);
        assert_eq!(
            state.store_raw(0x5002, 1),
            Err(NodeError::PropertyNotFound(0x5002))
        );
    }

    #[test]
    fn test_battery_clamp_and_refresh() {
        let arena = Arena::unbounded();
        let state = BatteryState::new_in(&arena, None, 0, true).unwrap();
        assert_eq!(state.level(), DEFAULT_BATTERY_LEVEL);
        assert_eq!(state.set_level(150), 100);
        assert_eq!(state.refresh(0), 100);

        let reader: Arc<dyn BatteryReader> =
            Arc::new(|| -> std::result::Result<u8, ReadError> { Err(ReadError::new("adc busy")) });
        let failing = BatteryState::new_in(&arena, Some(reader), 0, false).unwrap();
        failing.set_level(42);
        assert_eq!(failing.refresh(0), 42);
    }
}
