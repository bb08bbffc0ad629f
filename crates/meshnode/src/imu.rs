//! Synthetic IMU and its sensor bindings
//!
//! Accelerometer axes map to properties 0x5001..=0x5003 (milli-g), gyroscope
//! axes to 0x5004..=0x5006 (degrees per second).

use meshnode_core::{ReadError, SensorChannel, SensorReader};
use meshnode_protocol::CompactImuSample;
use rand::Rng;
use std::sync::Arc;
use std::time::Instant;

pub const ACCEL_X: u16 = 0x5001;
pub const ACCEL_Y: u16 = 0x5002;
pub const ACCEL_Z: u16 = 0x5003;
pub const GYRO_X: u16 = 0x5004;
pub const GYRO_Y: u16 = 0x5005;
pub const GYRO_Z: u16 = 0x5006;

pub const PROPERTIES: [u16; 6] = [ACCEL_X, ACCEL_Y, ACCEL_Z, GYRO_X, GYRO_Y, GYRO_Z];

/// One raw reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImuReading {
    pub timestamp_ms: u64,
    pub accel_mg: [i32; 3],
    pub gyro_dps: [i32; 3],
}

impl ImuReading {
    /// Value of one IMU property
    pub fn property(&self, property_id: u16) -> Option<i32> {
        match property_id {
            ACCEL_X..=ACCEL_Z => Some(self.accel_mg[usize::from(property_id - ACCEL_X)]),
            GYRO_X..=GYRO_Z => Some(self.gyro_dps[usize::from(property_id - GYRO_X)]),
            _ => None,
        }
    }

    pub fn compact(&self) -> CompactImuSample {
        CompactImuSample::from_raw(self.timestamp_ms, self.accel_mg, self.gyro_dps)
    }
}

/// A device slowly rocking on a table: gravity on Z plus a sine sway and noise
#[derive(Debug)]
pub struct SyntheticImu {
    started: Instant,
    noise: i32,
}

impl Default for SyntheticImu {
    fn default() -> Self {
        Self::new(20)
    }
}

impl SyntheticImu {
    pub fn new(noise: i32) -> Self {
        Self {
            started: Instant::now(),
            noise: noise.max(0),
        }
    }

    pub fn sample(&self) -> ImuReading {
        let timestamp_ms = self.started.elapsed().as_millis() as u64;
        let phase = timestamp_ms as f64 / 1000.0;
        let mut rng = rand::thread_rng();
        let mut jitter = || {
            if self.noise == 0 {
                0
            } else {
                rng.gen_range(-self.noise..=self.noise)
            }
        };

        let sway = (phase * std::f64::consts::TAU * 0.5).sin();
        ImuReading {
            timestamp_ms,
            accel_mg: [
                (sway * 150.0) as i32 + jitter(),
                (sway * 80.0) as i32 + jitter(),
                1000 + jitter(),
            ],
            gyro_dps: [
                (sway * 30.0) as i32 + jitter() / 10,
                jitter() / 10,
                (sway * 5.0) as i32,
            ],
        }
    }
}

/// Reads IMU properties for a sensor model
pub struct ImuReader {
    imu: Arc<SyntheticImu>,
}

impl ImuReader {
    pub fn new(imu: Arc<SyntheticImu>) -> Self {
        Self { imu }
    }
}

impl SensorReader for ImuReader {
    fn read(&self, property_id: u16) -> Result<i32, ReadError> {
        self.imu
            .sample()
            .property(property_id)
            .ok_or_else(|| ReadError::new(format!("no IMU property 0x{:04X}", property_id)))
    }
}

/// Sensor channels for the given properties, all served by one IMU
pub fn channels(
    imu: &Arc<SyntheticImu>,
    properties: &[u16],
    publish_period_ms: u32,
) -> Vec<SensorChannel> {
    let reader: Arc<dyn SensorReader> = Arc::new(ImuReader::new(imu.clone()));
    properties
        .iter()
        .map(|&id| SensorChannel::new(id, reader.clone()).with_period(publish_period_ms))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_mapping() {
        let reading = ImuReading {
            timestamp_ms: 0,
            accel_mg: [1, 2, 3],
            gyro_dps: [4, 5, 6],
        };
        let values: Vec<_> = PROPERTIES
            .iter()
            .map(|&id| reading.property(id).unwrap())
            .collect();
        assert_eq!(values, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(reading.property(0x5007), None);
        assert_eq!(reading.property(0x5000), None);
    }

    #[test]
    fn test_noiseless_rest() {
        let imu = SyntheticImu::new(0);
        let reading = imu.sample();
        assert!((950..=1050).contains(&reading.accel_mg[2]));
    }

    #[test]
    fn test_reader_unknown_property() {
        let reader = ImuReader::new(Arc::new(SyntheticImu::default()));
        assert!(reader.read(ACCEL_Z).is_ok());
        assert!(reader.read(0x0042).is_err());
    }

    #[test]
    fn test_compact_sample() {
        let reading = ImuReading {
            timestamp_ms: 70_000,
            accel_mg: [1500, -1500, 1000],
            gyro_dps: [250, -250, 0],
        };
        let sample = reading.compact();
        assert_eq!(sample.accel, [15, -15, 10]);
        assert_eq!(sample.gyro, [25, -25, 0]);
        assert_eq!(sample.to_bytes().len(), CompactImuSample::SIZE);
    }

    #[test]
    fn test_channels() {
        let imu = Arc::new(SyntheticImu::default());
        let channels = channels(&imu, &PROPERTIES, 500);
        assert_eq!(channels.len(), 6);
        assert_eq!(channels[3].property_id, GYRO_X);
        assert_eq!(channels[3].publish_period_ms, 500);
    }
}
