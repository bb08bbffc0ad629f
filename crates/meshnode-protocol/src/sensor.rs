//! Sensor server payloads
//!
//! Sensor Status carries one or more marshalled properties back to back.
//! Each property is a small header followed by the raw value bytes:
//!
//! Short form (property id <= 0x07FF), 2 byte little-endian header:
//! ```text
//!  15                      5 4       1   0
//! +-------------------------+---------+---+
//! |       property id       | length  | 0 |
//! +-------------------------+---------+---+
//! ```
//!
//! Long form (property id > 0x07FF), 3 byte header:
//! ```text
//! +---------------------+-------------------+
//! | (length << 1) | 1   | property id (LE)  |
//! +---------------------+-------------------+
//! ```
//!
//! Both forms store the value length as-is (no minus-one offset).

use crate::buffer::PubBuffer;
use crate::error::{CodecError, Result};

/// Largest property id that fits the short header
pub const SHORT_FORM_MAX_ID: u16 = 0x07FF;

pub const SHORT_FORM_MAX_LEN: usize = 0x0F;
pub const LONG_FORM_MAX_LEN: usize = 0x7F;

/// Buffer size for a sensor status or setup publication
pub const SENSOR_STATUS_BUFFER_SIZE: usize = 34;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyFormat {
    Short,
    Long,
}

impl PropertyFormat {
    pub fn for_property(property_id: u16) -> Self {
        if property_id > SHORT_FORM_MAX_ID {
            PropertyFormat::Long
        } else {
            PropertyFormat::Short
        }
    }

    pub fn header_len(&self) -> usize {
        match self {
            PropertyFormat::Short => 2,
            PropertyFormat::Long => 3,
        }
    }

    pub fn max_value_len(&self) -> usize {
        match self {
            PropertyFormat::Short => SHORT_FORM_MAX_LEN,
            PropertyFormat::Long => LONG_FORM_MAX_LEN,
        }
    }
}

/// One property id with its raw value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarshalledProperty {
    pub property_id: u16,
    pub value: Vec<u8>,
}

impl MarshalledProperty {
    pub fn new(property_id: u16, value: impl Into<Vec<u8>>) -> Self {
        MarshalledProperty {
            property_id,
            value: value.into(),
        }
    }

    /// Property carrying a 32-bit signed reading
    pub fn from_i32(property_id: u16, value: i32) -> Self {
        Self::new(property_id, value.to_le_bytes())
    }

    pub fn format(&self) -> PropertyFormat {
        PropertyFormat::for_property(self.property_id)
    }

    pub fn encoded_len(&self) -> usize {
        self.format().header_len() + self.value.len()
    }

    pub fn encode(&self, buf: &mut PubBuffer) -> Result<()> {
        let format = self.format();
        let len = self.value.len();
        if len > format.max_value_len() {
            return Err(CodecError::ValueTooLong { format, len });
        }
        if self.encoded_len() > buf.remaining() {
            return Err(CodecError::BufferOverflow {
                needed: self.encoded_len(),
                available: buf.remaining(),
            });
        }

        match format {
            PropertyFormat::Short => {
                let header = (self.property_id << 5) | ((len as u16) << 1);
                buf.put_le16(header)?;
            }
            PropertyFormat::Long => {
                buf.put_u8(((len as u8) << 1) | 1)?;
                buf.put_le16(self.property_id)?;
            }
        }
        buf.put_slice(&self.value)
    }

    /// Decode one property from the front of `bytes`.
    ///
    /// Returns the property and the number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let first = *bytes.first().ok_or(CodecError::Truncated {
            expected: 2,
            actual: 0,
        })?;

        let (property_id, len, header_len) = if first & 1 == 0 {
            if bytes.len() < 2 {
                return Err(CodecError::Truncated {
                    expected: 2,
                    actual: bytes.len(),
                });
            }
            let header = u16::from_le_bytes([bytes[0], bytes[1]]);
            (header >> 5, ((header >> 1) & 0x0F) as usize, 2)
        } else {
            if bytes.len() < 3 {
                return Err(CodecError::Truncated {
                    expected: 3,
                    actual: bytes.len(),
                });
            }
            let id = u16::from_le_bytes([bytes[1], bytes[2]]);
            (id, (first >> 1) as usize, 3)
        };

        let end = header_len + len;
        if bytes.len() < end {
            return Err(CodecError::Truncated {
                expected: end,
                actual: bytes.len(),
            });
        }

        Ok((
            MarshalledProperty::new(property_id, &bytes[header_len..end]),
            end,
        ))
    }

    /// Decode a sensor status made of several properties
    pub fn decode_all(mut bytes: &[u8]) -> Result<Vec<Self>> {
        let mut properties = Vec::new();
        while !bytes.is_empty() {
            let (property, used) = Self::decode(bytes)?;
            properties.push(property);
            bytes = &bytes[used..];
        }
        Ok(properties)
    }

    /// Interpret the value as a little-endian i32 reading
    pub fn as_i32(&self) -> Option<i32> {
        let raw: [u8; 4] = self.value.as_slice().try_into().ok()?;
        Some(i32::from_le_bytes(raw))
    }
}

/// Sensor descriptor record, 8 bytes on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorDescriptor {
    pub property_id: u16,
    /// 12-bit value
    pub positive_tolerance: u16,
    /// 12-bit value
    pub negative_tolerance: u16,
    pub sampling_function: u8,
    pub measure_period: u8,
    pub update_interval: u8,
}

impl SensorDescriptor {
    pub const SIZE: usize = 8;
    pub const MAX_TOLERANCE: u16 = 0x0FFF;
    pub const SAMPLING_UNSPECIFIED: u8 = 0x00;

    /// Descriptor with zero tolerances and no sampling information
    pub fn unspecified(property_id: u16) -> Self {
        SensorDescriptor {
            property_id,
            positive_tolerance: 0,
            negative_tolerance: 0,
            sampling_function: Self::SAMPLING_UNSPECIFIED,
            measure_period: 0,
            update_interval: 0,
        }
    }

    pub fn encode(&self, buf: &mut PubBuffer) -> Result<()> {
        if self.positive_tolerance > Self::MAX_TOLERANCE
            || self.negative_tolerance > Self::MAX_TOLERANCE
        {
            return Err(CodecError::OutOfRange(format!(
                "tolerance exceeds 12 bits (+0x{:X}/-0x{:X})",
                self.positive_tolerance, self.negative_tolerance
            )));
        }
        if buf.remaining() < Self::SIZE {
            return Err(CodecError::BufferOverflow {
                needed: Self::SIZE,
                available: buf.remaining(),
            });
        }

        let pos = self.positive_tolerance;
        let neg = self.negative_tolerance;
        buf.put_le16(self.property_id)?;
        buf.put_u8(pos as u8)?;
        buf.put_u8(((pos >> 8) as u8 & 0x0F) | (((neg & 0x0F) as u8) << 4))?;
        buf.put_u8((neg >> 4) as u8)?;
        buf.put_u8(self.sampling_function)?;
        buf.put_u8(self.measure_period)?;
        buf.put_u8(self.update_interval)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(CodecError::Truncated {
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }
        Ok(SensorDescriptor {
            property_id: u16::from_le_bytes([bytes[0], bytes[1]]),
            positive_tolerance: bytes[2] as u16 | (((bytes[3] & 0x0F) as u16) << 8),
            negative_tolerance: ((bytes[3] >> 4) as u16) | ((bytes[4] as u16) << 4),
            sampling_function: bytes[5],
            measure_period: bytes[6],
            update_interval: bytes[7],
        })
    }
}
