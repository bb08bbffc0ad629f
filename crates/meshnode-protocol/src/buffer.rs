//! Fixed-capacity publication buffer
//!
//! A `PubBuffer` is sized once for the largest payload its model can publish
//! and then reset before each message. It never grows.

use crate::error::{CodecError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl PubBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        PubBuffer {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Drop the previous payload, keeping the allocation
    pub fn reset(&mut self) {
        self.data.clear();
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn reserve(&self, needed: usize) -> Result<()> {
        if needed > self.remaining() {
            return Err(CodecError::BufferOverflow {
                needed,
                available: self.remaining(),
            });
        }
        Ok(())
    }

    pub fn put_u8(&mut self, value: u8) -> Result<()> {
        self.reserve(1)?;
        self.data.push(value);
        Ok(())
    }

    pub fn put_le16(&mut self, value: u16) -> Result<()> {
        self.put_slice(&value.to_le_bytes())
    }

    /// Low three bytes of `value`, little-endian
    pub fn put_le24(&mut self, value: u32) -> Result<()> {
        self.put_slice(&value.to_le_bytes()[..3])
    }

    pub fn put_le32(&mut self, value: u32) -> Result<()> {
        self.put_slice(&value.to_le_bytes())
    }

    pub fn put_slice(&mut self, bytes: &[u8]) -> Result<()> {
        self.reserve(bytes.len())?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }
}
