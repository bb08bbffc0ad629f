//! Generic server status encodings
//!
//! Generic OnOff Status: 1 byte (0 or 1)
//! Generic Level Status: 2 bytes, signed little-endian
//! Generic Battery Status: 8 bytes
//!
//! ```text
//! +-------+--------------------+-----------------+-------+
//! | level | time to discharge  | time to charge  | flags |
//! |  1 B  |        3 B         |       3 B       |  1 B  |
//! +-------+--------------------+-----------------+-------+
//! ```

use bitflags::bitflags;

use crate::buffer::PubBuffer;
use crate::error::{CodecError, Result};

pub const ONOFF_STATUS_SIZE: usize = 1;
pub const LEVEL_STATUS_SIZE: usize = 2;
pub const BATTERY_STATUS_SIZE: usize = 8;

pub fn encode_onoff(buf: &mut PubBuffer, on: bool) -> Result<()> {
    buf.put_u8(on as u8)
}

pub fn decode_onoff(bytes: &[u8]) -> Result<bool> {
    if bytes.len() != ONOFF_STATUS_SIZE {
        return Err(CodecError::InvalidLength {
            expected: ONOFF_STATUS_SIZE,
            actual: bytes.len(),
        });
    }
    match bytes[0] {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(CodecError::InvalidOnOff(other)),
    }
}

pub fn encode_level(buf: &mut PubBuffer, level: i16) -> Result<()> {
    buf.put_slice(&level.to_le_bytes())
}

pub fn decode_level(bytes: &[u8]) -> Result<i16> {
    if bytes.len() != LEVEL_STATUS_SIZE {
        return Err(CodecError::InvalidLength {
            expected: LEVEL_STATUS_SIZE,
            actual: bytes.len(),
        });
    }
    Ok(i16::from_le_bytes([bytes[0], bytes[1]]))
}

bitflags! {
    /// Battery flags byte. Each field is two bits wide.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BatteryFlags: u8 {
        const PRESENCE = 0b0000_0011;
        const INDICATOR = 0b0000_1100;
        const CHARGING = 0b0011_0000;
        const SERVICEABILITY = 0b1100_0000;
    }
}

impl Default for BatteryFlags {
    fn default() -> Self {
        BatteryFlags::empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryStatus {
    pub level: u8,
    pub time_to_discharge: u32,
    pub time_to_charge: u32,
    pub flags: BatteryFlags,
}

impl BatteryStatus {
    pub const UNKNOWN_LEVEL: u8 = 0xFF;
    pub const UNKNOWN_TIME: u32 = 0xFF_FFFF;
    pub const MAX_LEVEL: u8 = 100;

    /// Status carrying only a level; both times unknown, flags zero
    pub fn from_level(level: u8) -> Self {
        BatteryStatus {
            level,
            time_to_discharge: Self::UNKNOWN_TIME,
            time_to_charge: Self::UNKNOWN_TIME,
            flags: BatteryFlags::empty(),
        }
    }

    pub fn is_level_known(&self) -> bool {
        self.level != Self::UNKNOWN_LEVEL
    }

    fn validate(&self) -> Result<()> {
        if self.level > Self::MAX_LEVEL && self.level != Self::UNKNOWN_LEVEL {
            return Err(CodecError::InvalidBatteryLevel(self.level));
        }
        for time in [self.time_to_discharge, self.time_to_charge] {
            if time > Self::UNKNOWN_TIME {
                return Err(CodecError::OutOfRange(format!(
                    "battery time 0x{:X} exceeds 24 bits",
                    time
                )));
            }
        }
        Ok(())
    }

    pub fn encode(&self, buf: &mut PubBuffer) -> Result<()> {
        self.validate()?;
        if buf.remaining() < BATTERY_STATUS_SIZE {
            return Err(CodecError::BufferOverflow {
                needed: BATTERY_STATUS_SIZE,
                available: buf.remaining(),
            });
        }
        buf.put_u8(self.level)?;
        buf.put_le24(self.time_to_discharge)?;
        buf.put_le24(self.time_to_charge)?;
        buf.put_u8(self.flags.bits())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != BATTERY_STATUS_SIZE {
            return Err(CodecError::InvalidLength {
                expected: BATTERY_STATUS_SIZE,
                actual: bytes.len(),
            });
        }
        let le24 = |b: &[u8]| u32::from_le_bytes([b[0], b[1], b[2], 0]);

        let status = BatteryStatus {
            level: bytes[0],
            time_to_discharge: le24(&bytes[1..4]),
            time_to_charge: le24(&bytes[4..7]),
            flags: BatteryFlags::from_bits_retain(bytes[7]),
        };
        status.validate()?;
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_onoff_values() {
        for on in [false, true] {
            let mut buf = PubBuffer::with_capacity(ONOFF_STATUS_SIZE);
            encode_onoff(&mut buf, on).unwrap();
            assert_eq!(buf.as_slice(), &[on as u8]);
            assert_eq!(decode_onoff(buf.as_slice()).unwrap(), on);
        }
    }

    #[test]
    fn test_onoff_rejects_other_values() {
        assert_eq!(decode_onoff(&[2]), Err(CodecError::InvalidOnOff(2)));
        assert!(decode_onoff(&[]).is_err());
        assert!(decode_onoff(&[1, 0]).is_err());
    }

    #[test]
    fn test_level_extremes() {
        for level in [i16::MIN, -1, 0, 1, i16::MAX] {
            let mut buf = PubBuffer::with_capacity(LEVEL_STATUS_SIZE);
            encode_level(&mut buf, level).unwrap();
            assert_eq!(decode_level(buf.as_slice()).unwrap(), level);
        }

        let mut buf = PubBuffer::with_capacity(LEVEL_STATUS_SIZE);
        encode_level(&mut buf, -2).unwrap();
        assert_eq!(buf.as_slice(), &[0xFE, 0xFF]);
    }

    #[test]
    fn test_battery_layout() {
        let mut buf = PubBuffer::with_capacity(BATTERY_STATUS_SIZE);
        BatteryStatus::from_level(75).encode(&mut buf).unwrap();
        assert_eq!(
            buf.as_slice(),
            &[75, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00]
        );
    }

    #[test]
    fn test_battery_decode() {
        let status = BatteryStatus::decode(&[50, 0x10, 0x00, 0x00, 0xFF, 0xFF, 0xFF, 0x05]).unwrap();
        assert_eq!(status.level, 50);
        assert_eq!(status.time_to_discharge, 0x10);
        assert_eq!(status.time_to_charge, BatteryStatus::UNKNOWN_TIME);
        assert_eq!(status.flags.bits(), 0x05);
    }

    #[test]
    fn test_battery_level_validation() {
        let mut buf = PubBuffer::with_capacity(BATTERY_STATUS_SIZE);
        assert_eq!(
            BatteryStatus::from_level(101).encode(&mut buf),
            Err(CodecError::InvalidBatteryLevel(101))
        );
        assert!(buf.is_empty());

        let unknown = BatteryStatus::from_level(BatteryStatus::UNKNOWN_LEVEL);
        assert!(!unknown.is_level_known());
        unknown.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), BATTERY_STATUS_SIZE);
    }

    #[test]
    fn test_battery_needs_full_buffer() {
        let mut buf = PubBuffer::with_capacity(4);
        let err = BatteryStatus::from_level(10).encode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::BufferOverflow { needed: 8, .. }));
        assert!(buf.is_empty());
    }
}
