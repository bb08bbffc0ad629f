//! Access-layer opcodes
//!
//! Opcodes come in three sizes on the wire:
//! - 1 byte: `0x00..=0x7E` (0x7F is reserved)
//! - 2 bytes: `0x8000..=0xBFFF`, sent most significant byte first
//! - 3 bytes: `0xC00000..=0xFFFFFF`, vendor opcodes; the first byte is the
//!   vendor op, followed by the 16-bit company identifier in little-endian

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CodecError, Result};

/// Any access-layer opcode
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Opcode(u32);

impl Opcode {
    // Configuration Server
    pub const CONFIG_APPKEY_ADD: Opcode = Opcode(0x00);
    pub const CONFIG_MODEL_PUB_SET: Opcode = Opcode(0x03);
    pub const CONFIG_MODEL_APP_BIND: Opcode = Opcode(0x803D);

    // Generic OnOff
    pub const GENERIC_ONOFF_GET: Opcode = Opcode(0x8201);
    pub const GENERIC_ONOFF_SET: Opcode = Opcode(0x8202);
    pub const GENERIC_ONOFF_SET_UNACK: Opcode = Opcode(0x8203);
    pub const GENERIC_ONOFF_STATUS: Opcode = Opcode(0x8204);

    // Generic Level
    pub const GENERIC_LEVEL_GET: Opcode = Opcode(0x8205);
    pub const GENERIC_LEVEL_SET: Opcode = Opcode(0x8206);
    pub const GENERIC_LEVEL_SET_UNACK: Opcode = Opcode(0x8207);
    pub const GENERIC_LEVEL_STATUS: Opcode = Opcode(0x8208);
    pub const GENERIC_DELTA_SET: Opcode = Opcode(0x8209);
    pub const GENERIC_DELTA_SET_UNACK: Opcode = Opcode(0x820A);
    pub const GENERIC_MOVE_SET: Opcode = Opcode(0x820B);
    pub const GENERIC_MOVE_SET_UNACK: Opcode = Opcode(0x820C);

    // Generic Battery
    pub const GENERIC_BATTERY_GET: Opcode = Opcode(0x8223);
    pub const GENERIC_BATTERY_STATUS: Opcode = Opcode(0x8224);

    // Sensor
    pub const SENSOR_DESCRIPTOR_GET: Opcode = Opcode(0x8230);
    pub const SENSOR_DESCRIPTOR_STATUS: Opcode = Opcode(0x51);
    pub const SENSOR_GET: Opcode = Opcode(0x8231);
    pub const SENSOR_STATUS: Opcode = Opcode(0x52);

    /// Validate and wrap a raw opcode value
    pub fn from_u32(raw: u32) -> Result<Self> {
        match raw {
            0x00..=0x7E | 0x8000..=0xBFFF | 0xC0_0000..=0xFF_FFFF => Ok(Opcode(raw)),
            _ => Err(CodecError::InvalidOpcode(raw)),
        }
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Number of bytes on the wire
    pub fn len(&self) -> usize {
        match self.0 {
            0x00..=0x7E => 1,
            0x8000..=0xBFFF => 2,
            _ => 3,
        }
    }

    pub fn is_vendor(&self) -> bool {
        self.len() == 3
    }

    /// Append the wire form of this opcode
    pub fn write_to(&self, out: &mut Vec<u8>) {
        match self.len() {
            1 => out.push(self.0 as u8),
            2 => out.extend_from_slice(&(self.0 as u16).to_be_bytes()),
            _ => {
                out.push((self.0 >> 16) as u8);
                out.extend_from_slice(&(self.0 as u16).to_le_bytes());
            }
        }
    }

    /// Parse an opcode from the start of an access payload.
    ///
    /// Returns the opcode and the number of bytes it occupied.
    pub fn parse(bytes: &[u8]) -> Result<(Opcode, usize)> {
        let first = *bytes.first().ok_or(CodecError::Truncated {
            expected: 1,
            actual: 0,
        })?;

        match first {
            0x7F => Err(CodecError::InvalidOpcode(0x7F)),
            0x00..=0x7E => Ok((Opcode(first as u32), 1)),
            0x80..=0xBF => {
                if bytes.len() < 2 {
                    return Err(CodecError::Truncated {
                        expected: 2,
                        actual: bytes.len(),
                    });
                }
                Ok((Opcode(u16::from_be_bytes([bytes[0], bytes[1]]) as u32), 2))
            }
            _ => {
                if bytes.len() < 3 {
                    return Err(CodecError::Truncated {
                        expected: 3,
                        actual: bytes.len(),
                    });
                }
                let company = u16::from_le_bytes([bytes[1], bytes[2]]) as u32;
                Ok((Opcode(((first as u32) << 16) | company), 3))
            }
        }
    }
}

impl fmt::Debug for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Opcode({})", self)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.len() {
            1 => write!(f, "0x{:02X}", self.0),
            2 => write!(f, "0x{:04X}", self.0),
            _ => write!(f, "0x{:06X}", self.0),
        }
    }
}

/// A 3-byte vendor opcode (`0xC00000..=0xFFFFFF`)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct VendorOpcode(u32);

impl VendorOpcode {
    /// Compact IMU sample (accelerometer + gyroscope)
    pub const IMU_DATA: VendorOpcode = VendorOpcode(0xC0_0001);

    /// Gyroscope-only sample
    pub const IMU_GYRO: VendorOpcode = VendorOpcode(0xC0_0002);

    /// Build a vendor opcode from its first byte and the company identifier.
    ///
    /// The two vendor-range bits are always set on the first byte.
    pub const fn new(op: u8, company_id: u16) -> Self {
        VendorOpcode((((op | 0xC0) as u32) << 16) | company_id as u32)
    }

    pub fn from_u32(raw: u32) -> Result<Self> {
        if (0xC0_0000..=0xFF_FFFF).contains(&raw) {
            Ok(VendorOpcode(raw))
        } else {
            Err(CodecError::InvalidOpcode(raw))
        }
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// First byte on the wire
    pub fn op_byte(&self) -> u8 {
        (self.0 >> 16) as u8
    }

    /// Company identifier carried in the low 16 bits
    pub fn company_id(&self) -> u16 {
        self.0 as u16
    }
}

impl TryFrom<u32> for VendorOpcode {
    type Error = CodecError;

    fn try_from(raw: u32) -> Result<Self> {
        VendorOpcode::from_u32(raw)
    }
}

impl From<VendorOpcode> for u32 {
    fn from(op: VendorOpcode) -> u32 {
        op.0
    }
}

impl From<VendorOpcode> for Opcode {
    fn from(op: VendorOpcode) -> Opcode {
        Opcode(op.0)
    }
}

impl TryFrom<Opcode> for VendorOpcode {
    type Error = CodecError;

    fn try_from(op: Opcode) -> Result<Self> {
        VendorOpcode::from_u32(op.0)
    }
}

impl fmt::Debug for VendorOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VendorOpcode(0x{:06X})", self.0)
    }
}

impl fmt::Display for VendorOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:06X}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_lengths() {
        assert_eq!(Opcode::SENSOR_STATUS.len(), 1);
        assert_eq!(Opcode::GENERIC_ONOFF_STATUS.len(), 2);
        assert_eq!(Opcode::from(VendorOpcode::IMU_DATA).len(), 3);
        assert!(Opcode::from(VendorOpcode::IMU_DATA).is_vendor());
        assert!(!Opcode::GENERIC_LEVEL_STATUS.is_vendor());
    }

    #[test]
    fn test_opcode_validation() {
        assert!(Opcode::from_u32(0x52).is_ok());
        assert!(Opcode::from_u32(0x8204).is_ok());
        assert!(Opcode::from_u32(0xC0_0001).is_ok());

        assert_eq!(Opcode::from_u32(0x7F), Err(CodecError::InvalidOpcode(0x7F)));
        assert!(Opcode::from_u32(0x0100).is_err());
        assert!(Opcode::from_u32(0x100_0000).is_err());
    }

    #[test]
    fn test_opcode_wire_form() {
        let mut out = Vec::new();
        Opcode::GENERIC_ONOFF_STATUS.write_to(&mut out);
        assert_eq!(out, vec![0x82, 0x04]);

        out.clear();
        Opcode::SENSOR_STATUS.write_to(&mut out);
        assert_eq!(out, vec![0x52]);

        out.clear();
        Opcode::from(VendorOpcode::new(0x01, 0x02E5)).write_to(&mut out);
        assert_eq!(out, vec![0xC1, 0xE5, 0x02]);
    }

    #[test]
    fn test_opcode_parse() {
        let (op, used) = Opcode::parse(&[0x82, 0x02, 0x01, 0x00]).unwrap();
        assert_eq!(op, Opcode::GENERIC_ONOFF_SET);
        assert_eq!(used, 2);

        let (op, used) = Opcode::parse(&[0xC0, 0x01, 0x00, 0xAA]).unwrap();
        assert_eq!(op, Opcode::from(VendorOpcode::IMU_DATA));
        assert_eq!(used, 3);

        assert!(Opcode::parse(&[]).is_err());
        assert!(Opcode::parse(&[0x82]).is_err());
        assert!(Opcode::parse(&[0xC0, 0x01]).is_err());
        assert!(Opcode::parse(&[0x7F]).is_err());
    }

    #[test]
    fn test_vendor_opcode_construction() {
        assert_eq!(VendorOpcode::new(0xC0, 0x0001), VendorOpcode::IMU_DATA);
        assert_eq!(VendorOpcode::new(0x00, 0x0002), VendorOpcode::IMU_GYRO);
        assert_eq!(VendorOpcode::IMU_DATA.op_byte(), 0xC0);
        assert_eq!(VendorOpcode::IMU_DATA.company_id(), 0x0001);
    }

    #[test]
    fn test_vendor_opcode_range() {
        assert!(VendorOpcode::from_u32(0xC0_0000).is_ok());
        assert!(VendorOpcode::from_u32(0xFF_FFFF).is_ok());
        assert!(VendorOpcode::from_u32(0xBF_FFFF).is_err());
        assert!(VendorOpcode::try_from(Opcode::GENERIC_ONOFF_SET).is_err());
    }

    #[test]
    fn test_opcode_display() {
        assert_eq!(Opcode::SENSOR_STATUS.to_string(), "0x52");
        assert_eq!(Opcode::GENERIC_BATTERY_STATUS.to_string(), "0x8224");
        assert_eq!(VendorOpcode::IMU_DATA.to_string(), "0xC00001");
    }
}
