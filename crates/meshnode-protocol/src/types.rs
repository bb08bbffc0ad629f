//! Core protocol types

use serde::{Deserialize, Serialize};
use std::fmt;

/// A 16-bit mesh address
///
/// Address ranges:
/// - 0x0000: unassigned
/// - 0x0001-0x7FFF: unicast
/// - 0x8000-0xBFFF: virtual
/// - 0xC000-0xFFFF: group (0xFFFF = all nodes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(u16);

impl Address {
    /// The "no destination bound" sentinel
    pub const UNASSIGNED: Address = Address(0x0000);

    /// Broadcast to every node
    pub const ALL_NODES: Address = Address(0xFFFF);

    pub const fn new(raw: u16) -> Self {
        Address(raw)
    }

    pub const fn as_u16(&self) -> u16 {
        self.0
    }

    pub fn is_unassigned(&self) -> bool {
        self.0 == 0x0000
    }

    pub fn is_unicast(&self) -> bool {
        (0x0001..=0x7FFF).contains(&self.0)
    }

    pub fn is_virtual(&self) -> bool {
        (0x8000..=0xBFFF).contains(&self.0)
    }

    pub fn is_group(&self) -> bool {
        self.0 >= 0xC000
    }
}

impl Default for Address {
    fn default() -> Self {
        Address::UNASSIGNED
    }
}

impl From<u16> for Address {
    fn from(raw: u16) -> Self {
        Address(raw)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address(0x{:04X})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// Identifier of a model as it appears in composition data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelId {
    /// Bluetooth SIG defined model
    Sig(u16),
    /// Vendor model, qualified by the company identifier
    Vendor { company_id: u16, model_id: u16 },
}

impl ModelId {
    pub const CONFIG_SERVER: ModelId = ModelId::Sig(0x0000);
    pub const GENERIC_ONOFF_SERVER: ModelId = ModelId::Sig(0x1000);
    pub const GENERIC_LEVEL_SERVER: ModelId = ModelId::Sig(0x1002);
    pub const GENERIC_BATTERY_SERVER: ModelId = ModelId::Sig(0x100C);
    pub const SENSOR_SERVER: ModelId = ModelId::Sig(0x1100);
    pub const SENSOR_SETUP_SERVER: ModelId = ModelId::Sig(0x1101);

    pub fn is_vendor(&self) -> bool {
        matches!(self, ModelId::Vendor { .. })
    }

    /// Number of bytes this id occupies in composition data
    pub fn encoded_len(&self) -> usize {
        match self {
            ModelId::Sig(_) => 2,
            ModelId::Vendor { .. } => 4,
        }
    }

    /// Append the composition-data form (company id first for vendor models)
    pub fn write_to(&self, out: &mut Vec<u8>) {
        match *self {
            ModelId::Sig(id) => out.extend_from_slice(&id.to_le_bytes()),
            ModelId::Vendor {
                company_id,
                model_id,
            } => {
                out.extend_from_slice(&company_id.to_le_bytes());
                out.extend_from_slice(&model_id.to_le_bytes());
            }
        }
    }

    /// Human-readable model name
    pub fn name(&self) -> &'static str {
        match *self {
            ModelId::CONFIG_SERVER => "Configuration Server",
            ModelId::GENERIC_ONOFF_SERVER => "Generic OnOff Server",
            ModelId::GENERIC_LEVEL_SERVER => "Generic Level Server",
            ModelId::GENERIC_BATTERY_SERVER => "Generic Battery Server",
            ModelId::SENSOR_SERVER => "Sensor Server",
            ModelId::SENSOR_SETUP_SERVER => "Sensor Setup Server",
            ModelId::Sig(_) => "SIG Model",
            ModelId::Vendor { .. } => "Vendor Model",
        }
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelId::Sig(id) => write!(f, "{} (0x{:04X})", self.name(), id),
            ModelId::Vendor {
                company_id,
                model_id,
            } => write!(f, "Vendor (CID=0x{:04X}, MID=0x{:04X})", company_id, model_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_ranges() {
        assert!(Address::UNASSIGNED.is_unassigned());
        assert!(!Address::UNASSIGNED.is_unicast());

        assert!(Address::new(0x0001).is_unicast());
        assert!(Address::new(0x7FFF).is_unicast());
        assert!(Address::new(0x8000).is_virtual());
        assert!(Address::new(0xC000).is_group());
        assert!(Address::ALL_NODES.is_group());
    }

    #[test]
    fn test_address_display() {
        assert_eq!(Address::new(0x0001).to_string(), "0x0001");
        assert_eq!(format!("{:?}", Address::new(0xC001)), "Address(0xC001)");
        assert_eq!(Address::default(), Address::UNASSIGNED);
    }

    #[test]
    fn test_model_id_encoding() {
        let mut out = Vec::new();
        ModelId::SENSOR_SERVER.write_to(&mut out);
        assert_eq!(out, vec![0x00, 0x11]);

        out.clear();
        ModelId::Vendor {
            company_id: 0x0001,
            model_id: 0x0002,
        }
        .write_to(&mut out);
        assert_eq!(out, vec![0x01, 0x00, 0x02, 0x00]);
    }

    #[test]
    fn test_model_id_lengths() {
        assert_eq!(ModelId::CONFIG_SERVER.encoded_len(), 2);
        assert!(!ModelId::CONFIG_SERVER.is_vendor());

        let vendor = ModelId::Vendor {
            company_id: 0xFFFF,
            model_id: 0x0001,
        };
        assert_eq!(vendor.encoded_len(), 4);
        assert!(vendor.is_vendor());
    }

    #[test]
    fn test_model_id_name() {
        assert_eq!(ModelId::GENERIC_ONOFF_SERVER.name(), "Generic OnOff Server");
        assert_eq!(ModelId::Sig(0x1234).name(), "SIG Model");
    }
}
