//! Compact IMU payload for vendor telemetry
//!
//! Six 16-bit readings plus a timestamp would take 14 bytes and force the
//! stack to segment. Scaling every axis down to one signed byte keeps the
//! whole sample at 8 bytes:
//!
//! ```text
//! +------------+----+----+----+----+----+----+
//! | ts (LE16)  | ax | ay | az | gx | gy | gz |
//! +------------+----+----+----+----+----+----+
//! ```
//!
//! - `ts`: milliseconds, wrapping at 65536
//! - `ax..az`: acceleration in milli-g divided by 100
//! - `gx..gz`: angular rate in degrees per second divided by 10
//!
//! Scaled values outside `i8` saturate at the bounds.

use crate::error::{CodecError, Result};

pub const ACCEL_SCALE: i32 = 100;
pub const GYRO_SCALE: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompactImuSample {
    pub timestamp: u16,
    pub accel: [i8; 3],
    pub gyro: [i8; 3],
}

fn saturate(value: i32, scale: i32) -> i8 {
    (value / scale).clamp(i8::MIN as i32, i8::MAX as i32) as i8
}

impl CompactImuSample {
    pub const SIZE: usize = 8;

    /// Scale raw readings down to the compact form.
    ///
    /// `timestamp_ms` is truncated to its low 16 bits.
    pub fn from_raw(timestamp_ms: u64, accel_mg: [i32; 3], gyro_dps: [i32; 3]) -> Self {
        CompactImuSample {
            timestamp: timestamp_ms as u16,
            accel: accel_mg.map(|v| saturate(v, ACCEL_SCALE)),
            gyro: gyro_dps.map(|v| saturate(v, GYRO_SCALE)),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let ts = self.timestamp.to_le_bytes();
        [
            ts[0],
            ts[1],
            self.accel[0] as u8,
            self.accel[1] as u8,
            self.accel[2] as u8,
            self.gyro[0] as u8,
            self.gyro[1] as u8,
            self.gyro[2] as u8,
        ]
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::SIZE {
            return Err(CodecError::InvalidLength {
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }
        Ok(CompactImuSample {
            timestamp: u16::from_le_bytes([bytes[0], bytes[1]]),
            accel: [bytes[2] as i8, bytes[3] as i8, bytes[4] as i8],
            gyro: [bytes[5] as i8, bytes[6] as i8, bytes[7] as i8],
        })
    }

    /// Acceleration back in milli-g (precision lost to scaling)
    pub fn accel_mg(&self) -> [i32; 3] {
        self.accel.map(|v| v as i32 * ACCEL_SCALE)
    }

    pub fn gyro_dps(&self) -> [i32; 3] {
        self.gyro.map(|v| v as i32 * GYRO_SCALE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_scaling() {
        let sample = CompactImuSample::from_raw(0, [1500, -1500, 0], [250, -250, 0]);
        assert_eq!(sample.accel, [15, -15, 0]);
        assert_eq!(sample.gyro, [25, -25, 0]);
    }

    #[test]
    fn test_compact_layout() {
        let sample = CompactImuSample::from_raw(0x1_2345, [1000, -100, 980], [10, 0, -20]);
        let bytes = sample.to_bytes();
        assert_eq!(bytes.len(), CompactImuSample::SIZE);
        assert_eq!(bytes, [0x45, 0x23, 10, 0xFF, 9, 1, 0, 0xFE]);
    }

    #[test]
    fn test_compact_saturation() {
        let sample = CompactImuSample::from_raw(0, [16_000, -16_000, 12_700], [2000, -2000, 1270]);
        assert_eq!(sample.accel, [127, -128, 127]);
        assert_eq!(sample.gyro, [127, -128, 127]);
    }

    #[test]
    fn test_compact_timestamp_wraps() {
        assert_eq!(CompactImuSample::from_raw(65_536, [0; 3], [0; 3]).timestamp, 0);
        assert_eq!(CompactImuSample::from_raw(65_537, [0; 3], [0; 3]).timestamp, 1);
    }

    #[test]
    fn test_compact_from_bytes() {
        let sample = CompactImuSample::from_raw(500, [-1500, 200, 1000], [250, 0, -30]);
        let parsed = CompactImuSample::from_bytes(&sample.to_bytes()).unwrap();
        assert_eq!(parsed, sample);
        assert_eq!(parsed.accel_mg(), [-1500, 200, 1000]);
        assert_eq!(parsed.gyro_dps(), [250, 0, -30]);

        assert!(CompactImuSample::from_bytes(&[0; 7]).is_err());
    }
}
