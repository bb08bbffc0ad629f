//! MeshNode Protocol Module
//!
//! Wire-level building blocks for the mesh model layer: addresses, opcodes,
//! publication buffers and the per-model status encodings (generic on/off,
//! generic level, generic battery, sensor marshalled properties and the
//! compact vendor IMU payload).
//!
//! Everything on the wire is little-endian.

pub mod buffer;
pub mod compact;
pub mod error;
pub mod opcode;
pub mod sensor;
pub mod status;
pub mod types;

pub use buffer::PubBuffer;
pub use compact::CompactImuSample;
pub use error::{CodecError, Result};
pub use opcode::{Opcode, VendorOpcode};
pub use sensor::{MarshalledProperty, PropertyFormat, SensorDescriptor};
pub use status::{BatteryFlags, BatteryStatus};
pub use types::{Address, ModelId};

/// Largest access payload that fits in a single unsegmented transport PDU.
///
/// Anything larger is split by the stack into segments, each of which holds a
/// network buffer until the whole message has gone out.
pub const MAX_UNSEGMENTED_PAYLOAD: usize = 11;

/// Returns true when a payload of `len` bytes has to be segmented.
pub fn requires_segmentation(len: usize) -> bool {
    len > MAX_UNSEGMENTED_PAYLOAD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segmentation_ceiling() {
        assert!(!requires_segmentation(0));
        assert!(!requires_segmentation(CompactImuSample::SIZE));
        assert!(!requires_segmentation(MAX_UNSEGMENTED_PAYLOAD));
        assert!(requires_segmentation(MAX_UNSEGMENTED_PAYLOAD + 1));
        // Six i16 readings plus a 2 byte timestamp
        assert!(requires_segmentation(14));
    }
}
