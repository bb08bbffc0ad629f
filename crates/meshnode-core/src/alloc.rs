//! Allocation arena
//!
//! Every block the composition builder needs (slot arrays, model state,
//! publication buffers) is taken from an [`Arena`]. The arena keeps a ledger
//! of live allocations and enforces a policy, which lets a host model the
//! device heap or inject failures at a chosen point.
//!
//! Allocations come back as [`Tracked`] values that return their bytes to the
//! ledger when dropped. Unwinding a half-built model is therefore just
//! dropping whatever was allocated for it so far.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{NodeError, Result};
use meshnode_protocol::PubBuffer;

/// What an allocation is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocStage {
    SigSlots,
    VendorSlots,
    SwitchState,
    DimmerState,
    BatteryState,
    VendorState,
    SensorState,
    SensorDescriptors,
    SensorRawBuffer,
    SensorStatusBuffer,
    SensorSetupBuffer,
    PublicationBuffer,
}

impl fmt::Display for AllocStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AllocStage::SigSlots => "SIG model array",
            AllocStage::VendorSlots => "vendor model array",
            AllocStage::SwitchState => "switch state",
            AllocStage::DimmerState => "dimmer state",
            AllocStage::BatteryState => "battery state",
            AllocStage::VendorState => "vendor state",
            AllocStage::SensorState => "sensor state",
            AllocStage::SensorDescriptors => "sensor property descriptors",
            AllocStage::SensorRawBuffer => "sensor raw value buffer",
            AllocStage::SensorStatusBuffer => "sensor status buffer",
            AllocStage::SensorSetupBuffer => "sensor setup buffer",
            AllocStage::PublicationBuffer => "publication buffer",
        };
        write!(f, "{}", name)
    }
}

/// When allocations are refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocPolicy {
    /// Never refuse
    Unbounded,
    /// Refuse once live bytes would exceed the budget
    Budget(usize),
    /// Refuse the n-th allocation attempt (0-based)
    FailAt(usize),
    /// Refuse the first attempt made for this stage
    FailOnStage(AllocStage),
}

impl Default for AllocPolicy {
    fn default() -> Self {
        AllocPolicy::Unbounded
    }
}

/// Snapshot of the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LedgerStats {
    pub live_count: usize,
    pub live_bytes: usize,
    pub peak_bytes: usize,
    pub attempts: usize,
    pub failures: usize,
}

#[derive(Debug, Default)]
struct Ledger {
    live_count: AtomicUsize,
    live_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
    attempts: AtomicUsize,
    failures: AtomicUsize,
    stage_failed: AtomicUsize,
}

impl Ledger {
    fn release(&self, bytes: usize) {
        self.live_count.fetch_sub(1, Ordering::SeqCst);
        self.live_bytes.fetch_sub(bytes, Ordering::SeqCst);
    }
}

/// Shared allocation arena. Clones share one ledger.
#[derive(Debug, Clone, Default)]
pub struct Arena {
    policy: AllocPolicy,
    ledger: Arc<Ledger>,
}

impl Arena {
    pub fn new(policy: AllocPolicy) -> Self {
        Arena {
            policy,
            ledger: Arc::new(Ledger::default()),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(AllocPolicy::Unbounded)
    }

    pub fn policy(&self) -> AllocPolicy {
        self.policy
    }

    pub fn stats(&self) -> LedgerStats {
        LedgerStats {
            live_count: self.ledger.live_count.load(Ordering::SeqCst),
            live_bytes: self.ledger.live_bytes.load(Ordering::SeqCst),
            peak_bytes: self.ledger.peak_bytes.load(Ordering::SeqCst),
            attempts: self.ledger.attempts.load(Ordering::SeqCst),
            failures: self.ledger.failures.load(Ordering::SeqCst),
        }
    }

    fn refuse(&self, stage: AllocStage, requested: usize) -> NodeError {
        self.ledger.failures.fetch_add(1, Ordering::SeqCst);
        log::warn!("Allocation refused: {} ({} bytes)", stage, requested);
        NodeError::OutOfMemory { stage, requested }
    }

    fn charge(&self, stage: AllocStage, bytes: usize) -> Result<()> {
        let attempt = self.ledger.attempts.fetch_add(1, Ordering::SeqCst);

        match self.policy {
            AllocPolicy::Unbounded => {
                self.ledger.live_bytes.fetch_add(bytes, Ordering::SeqCst);
            }
            AllocPolicy::Budget(budget) => {
                self.ledger
                    .live_bytes
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                        live.checked_add(bytes).filter(|next| *next <= budget)
                    })
                    .map_err(|_| self.refuse(stage, bytes))?;
            }
            AllocPolicy::FailAt(n) => {
                if attempt == n {
                    return Err(self.refuse(stage, bytes));
                }
                self.ledger.live_bytes.fetch_add(bytes, Ordering::SeqCst);
            }
            AllocPolicy::FailOnStage(target) => {
                if target == stage && self.ledger.stage_failed.swap(1, Ordering::SeqCst) == 0 {
                    return Err(self.refuse(stage, bytes));
                }
                self.ledger.live_bytes.fetch_add(bytes, Ordering::SeqCst);
            }
        }

        self.ledger.live_count.fetch_add(1, Ordering::SeqCst);
        let live = self.ledger.live_bytes.load(Ordering::SeqCst);
        self.ledger.peak_bytes.fetch_max(live, Ordering::SeqCst);
        Ok(())
    }

    /// Allocate `value`, charging `bytes` against the ledger
    pub fn alloc<T>(&self, stage: AllocStage, bytes: usize, value: T) -> Result<Tracked<T>> {
        self.charge(stage, bytes)?;
        Ok(Tracked {
            value,
            bytes,
            stage,
            ledger: self.ledger.clone(),
        })
    }

    /// Reserve a block with no payload of its own
    pub fn reserve(&self, stage: AllocStage, bytes: usize) -> Result<Allocation> {
        self.alloc(stage, bytes, ())
    }

    /// Fixed-capacity publication buffer
    pub fn buffer(&self, stage: AllocStage, capacity: usize) -> Result<Tracked<PubBuffer>> {
        self.alloc(stage, capacity, PubBuffer::with_capacity(capacity))
    }

    /// Empty vector with room for exactly `capacity` items
    pub fn array<T>(&self, stage: AllocStage, capacity: usize) -> Result<Tracked<Vec<T>>> {
        let bytes = capacity.saturating_mul(std::mem::size_of::<T>());
        self.alloc(stage, bytes, Vec::with_capacity(capacity))
    }
}

/// A value whose bytes are charged to an arena until it is dropped
pub struct Tracked<T> {
    value: T,
    bytes: usize,
    stage: AllocStage,
    ledger: Arc<Ledger>,
}

/// A tracked block with no payload
pub type Allocation = Tracked<()>;

impl<T> Tracked<T> {
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn stage(&self) -> AllocStage {
        self.stage
    }
}

impl<T> Deref for Tracked<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for Tracked<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T> Drop for Tracked<T> {
    fn drop(&mut self) {
        self.ledger.release(self.bytes);
    }
}

impl<T: fmt::Debug> fmt::Debug for Tracked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracked")
            .field("stage", &self.stage)
            .field("bytes", &self.bytes)
            .field("value", &self.value)
            .finish()
    }
}
