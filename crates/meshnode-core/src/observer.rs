//! Application capability traits
//!
//! Each model kind talks to the application through one narrow trait. The
//! node holds them as shared `Arc` handles, so application state outlives the
//! node without any raw context pointers. Plain closures implement the
//! single-method traits.
//!
//! Observers and handlers are invoked after the model's state lock has been
//! released, so they may call back into the node.

use thiserror::Error;

use crate::stack::MessageContext;
use meshnode_protocol::{Address, VendorOpcode};

/// Failure reported by a sensor or battery reader
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ReadError(pub String);

impl ReadError {
    pub fn new(reason: impl Into<String>) -> Self {
        ReadError(reason.into())
    }
}

/// Notified when a switch changes state
pub trait SwitchObserver: Send + Sync {
    fn on_change(&self, index: usize, on: bool);
}

impl<F> SwitchObserver for F
where
    F: Fn(usize, bool) + Send + Sync,
{
    fn on_change(&self, index: usize, on: bool) {
        self(index, on)
    }
}

/// Notified when a dimmer level changes
pub trait DimmerObserver: Send + Sync {
    fn on_change(&self, index: usize, level: i16);
}

impl<F> DimmerObserver for F
where
    F: Fn(usize, i16) + Send + Sync,
{
    fn on_change(&self, index: usize, level: i16) {
        self(index, level)
    }
}

/// Reads the current value of one sensor property
pub trait SensorReader: Send + Sync {
    fn read(&self, property_id: u16) -> Result<i32, ReadError>;
}

impl<F> SensorReader for F
where
    F: Fn(u16) -> Result<i32, ReadError> + Send + Sync,
{
    fn read(&self, property_id: u16) -> Result<i32, ReadError> {
        self(property_id)
    }
}

/// Reads the battery percentage (0-100)
pub trait BatteryReader: Send + Sync {
    fn read_level(&self) -> Result<u8, ReadError>;
}

impl<F> BatteryReader for F
where
    F: Fn() -> Result<u8, ReadError> + Send + Sync,
{
    fn read_level(&self) -> Result<u8, ReadError> {
        self()
    }
}

/// An inbound vendor message that passed the opcode allow-list
#[derive(Debug)]
pub struct VendorMessage<'a> {
    /// Within-kind index of the receiving vendor model
    pub index: usize,
    pub opcode: VendorOpcode,
    pub payload: &'a [u8],
    pub ctx: &'a MessageContext,
}

impl VendorMessage<'_> {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn sender(&self) -> Address {
        self.ctx.addr
    }
}

pub trait VendorHandler: Send + Sync {
    fn handle(&self, message: &VendorMessage<'_>);
}

impl<F> VendorHandler for F
where
    F: Fn(&VendorMessage<'_>) + Send + Sync,
{
    fn handle(&self, message: &VendorMessage<'_>) {
        self(message)
    }
}

/// Node lifecycle notifications. Every method defaults to a no-op.
pub trait NodeObserver: Send + Sync {
    /// Provisioning finished and the node owns `unicast`
    fn provisioned(&self, _unicast: Address) {}

    /// The node was reset and its credentials erased
    fn reset(&self) {}

    /// An application key was added; models can now be bound
    fn config_complete(&self, _app_idx: u16) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_closures_implement_observers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let observer: Arc<dyn SwitchObserver> = Arc::new(move |index: usize, on: bool| {
            assert_eq!(index, 1);
            assert!(on);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        observer.on_change(1, true);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reader_closure() {
        let reader: Arc<dyn SensorReader> = Arc::new(|id: u16| {
            if id == 0x5001 {
                Ok(-42)
            } else {
                Err(ReadError::new("no such axis"))
            }
        });

        assert_eq!(reader.read(0x5001), Ok(-42));
        assert_eq!(reader.read(0x5009).unwrap_err().to_string(), "no such axis");
    }

    #[test]
    fn test_node_observer_defaults() {
        struct Quiet;
        impl NodeObserver for Quiet {}

        let observer = Quiet;
        observer.provisioned(Address::new(0x0005));
        observer.reset();
        observer.config_complete(0);
    }
}
