//! Model descriptors
//!
//! A descriptor says which model the application wants and carries the
//! per-kind parameters. The order of the table fixes every model's
//! within-kind index.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{NodeError, Result};
use crate::observer::{BatteryReader, DimmerObserver, SensorReader, SwitchObserver, VendorHandler};
use meshnode_protocol::VendorOpcode;

/// Most models one node can carry
pub const MAX_MODELS: usize = 8;

/// Model kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// Generic OnOff Server
    Switch = 0,
    /// Generic Level Server
    Dimmer = 1,
    /// Sensor Server + Sensor Setup Server
    Sensor = 2,
    /// Generic Battery Server
    Battery = 3,
    /// Vendor model
    Vendor = 4,
}

impl ModelKind {
    pub const ALL: [ModelKind; 5] = [
        ModelKind::Switch,
        ModelKind::Dimmer,
        ModelKind::Sensor,
        ModelKind::Battery,
        ModelKind::Vendor,
    ];

    /// Decode a raw kind tag
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(ModelKind::Switch),
            1 => Ok(ModelKind::Dimmer),
            2 => Ok(ModelKind::Sensor),
            3 => Ok(ModelKind::Battery),
            4 => Ok(ModelKind::Vendor),
            _ => Err(NodeError::InvalidArgument(format!(
                "unknown model kind tag {}",
                tag
            ))),
        }
    }

    pub fn tag(&self) -> u8 {
        *self as u8
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::Switch => "switch",
            ModelKind::Dimmer => "dimmer",
            ModelKind::Sensor => "sensor",
            ModelKind::Battery => "battery",
            ModelKind::Vendor => "vendor",
        }
    }

    /// SIG composition slots one model of this kind occupies
    pub fn sig_slots(&self) -> usize {
        match self {
            ModelKind::Switch | ModelKind::Dimmer | ModelKind::Battery => 1,
            ModelKind::Sensor => 2,
            ModelKind::Vendor => 0,
        }
    }

    /// Vendor composition slots one model of this kind occupies
    pub fn vendor_slots(&self) -> usize {
        match self {
            ModelKind::Vendor => 1,
            _ => 0,
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ModelKind {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self> {
        ModelKind::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| NodeError::InvalidArgument(format!("unknown model kind '{}'", s)))
    }
}

/// One sensor property exposed by a sensor model
#[derive(Clone)]
pub struct SensorChannel {
    pub property_id: u16,
    pub reader: Arc<dyn SensorReader>,
    pub publish_period_ms: u32,
}

impl SensorChannel {
    pub fn new(property_id: u16, reader: Arc<dyn SensorReader>) -> Self {
        SensorChannel {
            property_id,
            reader,
            publish_period_ms: 0,
        }
    }

    pub fn with_period(mut self, publish_period_ms: u32) -> Self {
        self.publish_period_ms = publish_period_ms;
        self
    }
}

impl fmt::Debug for SensorChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SensorChannel")
            .field("property_id", &format_args!("0x{:04X}", self.property_id))
            .field("publish_period_ms", &self.publish_period_ms)
            .finish_non_exhaustive()
    }
}

/// Per-kind parameters
#[derive(Clone)]
pub enum ModelParams {
    Switch {
        observer: Option<Arc<dyn SwitchObserver>>,
        initial: bool,
    },
    Dimmer {
        observer: Option<Arc<dyn DimmerObserver>>,
        initial: i16,
    },
    Sensor {
        channels: Vec<SensorChannel>,
    },
    Battery {
        reader: Option<Arc<dyn BatteryReader>>,
        publish_period_ms: u32,
    },
    Vendor {
        company_id: u16,
        model_id: u16,
        opcodes: Vec<VendorOpcode>,
        handler: Option<Arc<dyn VendorHandler>>,
    },
}

impl ModelParams {
    pub fn kind(&self) -> ModelKind {
        match self {
            ModelParams::Switch { .. } => ModelKind::Switch,
            ModelParams::Dimmer { .. } => ModelKind::Dimmer,
            ModelParams::Sensor { .. } => ModelKind::Sensor,
            ModelParams::Battery { .. } => ModelKind::Battery,
            ModelParams::Vendor { .. } => ModelKind::Vendor,
        }
    }
}

impl fmt::Debug for ModelParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelParams::Switch { observer, initial } => f
                .debug_struct("Switch")
                .field("observer", &observer.is_some())
                .field("initial", initial)
                .finish(),
            ModelParams::Dimmer { observer, initial } => f
                .debug_struct("Dimmer")
                .field("observer", &observer.is_some())
                .field("initial", initial)
                .finish(),
            ModelParams::Sensor { channels } => {
                f.debug_struct("Sensor").field("channels", channels).finish()
            }
            ModelParams::Battery {
                reader,
                publish_period_ms,
            } => f
                .debug_struct("Battery")
                .field("reader", &reader.is_some())
                .field("publish_period_ms", publish_period_ms)
                .finish(),
            ModelParams::Vendor {
                company_id,
                model_id,
                opcodes,
                handler,
            } => f
                .debug_struct("Vendor")
                .field("company_id", &format_args!("0x{:04X}", company_id))
                .field("model_id", &format_args!("0x{:04X}", model_id))
                .field("opcodes", opcodes)
                .field("handler", &handler.is_some())
                .finish(),
        }
    }
}

/// A requested model
#[derive(Debug, Clone)]
pub struct ModelDescriptor {
    pub publication: bool,
    pub params: ModelParams,
}

impl ModelDescriptor {
    pub fn new(params: ModelParams) -> Self {
        ModelDescriptor {
            publication: true,
            params,
        }
    }

    pub fn switch(observer: Option<Arc<dyn SwitchObserver>>) -> Self {
        Self::new(ModelParams::Switch {
            observer,
            initial: false,
        })
    }

    pub fn dimmer(observer: Option<Arc<dyn DimmerObserver>>) -> Self {
        Self::new(ModelParams::Dimmer {
            observer,
            initial: 0,
        })
    }

    pub fn sensor(channels: Vec<SensorChannel>) -> Self {
        Self::new(ModelParams::Sensor { channels })
    }

    pub fn battery(reader: Option<Arc<dyn BatteryReader>>, publish_period_ms: u32) -> Self {
        Self::new(ModelParams::Battery {
            reader,
            publish_period_ms,
        })
    }

    pub fn vendor(
        company_id: u16,
        model_id: u16,
        opcodes: Vec<VendorOpcode>,
        handler: Option<Arc<dyn VendorHandler>>,
    ) -> Self {
        Self::new(ModelParams::Vendor {
            company_id,
            model_id,
            opcodes,
            handler,
        })
    }

    /// Enable or disable the model's publication context
    pub fn with_publication(mut self, publication: bool) -> Self {
        self.publication = publication;
        self
    }

    /// Boot-time on/off state. Only switches use it.
    pub fn with_initial_on(mut self, on: bool) -> Self {
        if let ModelParams::Switch { initial, .. } = &mut self.params {
            *initial = on;
        }
        self
    }

    /// Boot-time level. Only dimmers use it.
    pub fn with_initial_level(mut self, level: i16) -> Self {
        if let ModelParams::Dimmer { initial, .. } = &mut self.params {
            *initial = level;
        }
        self
    }

    pub fn kind(&self) -> ModelKind {
        self.params.kind()
    }

    /// Check per-kind parameter rules
    pub fn validate(&self) -> Result<()> {
        match &self.params {
            ModelParams::Sensor { channels } => {
                if channels.is_empty() {
                    return Err(NodeError::InvalidArgument(
                        "sensor model needs at least one channel".to_string(),
                    ));
                }
                let mut seen = HashSet::new();
                for channel in channels {
                    if !seen.insert(channel.property_id) {
                        return Err(NodeError::InvalidArgument(format!(
                            "duplicate sensor property 0x{:04X}",
                            channel.property_id
                        )));
                    }
                }
            }
            ModelParams::Vendor { opcodes, .. } => {
                if opcodes.is_empty() {
                    return Err(NodeError::InvalidArgument(
                        "vendor model needs at least one opcode".to_string(),
                    ));
                }
                // VendorOpcode can only hold the vendor range, but one built
                // through deserialization is checked again here
                for op in opcodes {
                    VendorOpcode::from_u32(op.as_u32()).map_err(|_| {
                        NodeError::InvalidArgument(format!("opcode {} outside vendor range", op))
                    })?;
                }
            }
            ModelParams::Switch { .. } | ModelParams::Dimmer { .. } | ModelParams::Battery { .. } => {}
        }
        Ok(())
    }
}

/// Validated, ordered list of descriptors
#[derive(Debug, Clone, Default)]
pub struct DescriptorTable {
    descriptors: Vec<ModelDescriptor>,
}

impl DescriptorTable {
    /// Copy and validate the caller's descriptors
    pub fn new(descriptors: &[ModelDescriptor]) -> Result<Self> {
        if descriptors.len() > MAX_MODELS {
            return Err(NodeError::CapacityExceeded {
                count: descriptors.len(),
                max: MAX_MODELS,
            });
        }
        for descriptor in descriptors {
            descriptor.validate()?;
        }
        Ok(DescriptorTable {
            descriptors: descriptors.to_vec(),
        })
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.descriptors.iter()
    }

    pub fn get(&self, position: usize) -> Option<&ModelDescriptor> {
        self.descriptors.get(position)
    }

    pub fn count(&self, kind: ModelKind) -> usize {
        self.descriptors.iter().filter(|d| d.kind() == kind).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::ReadError;

    fn reader() -> Arc<dyn SensorReader> {
        Arc::new(|_: u16| -> std::result::Result<i32, ReadError> { Ok(0) })
    }

    #[test]
    fn test_kind_tags() {
        for kind in ModelKind::ALL {
            assert_eq!(ModelKind::from_tag(kind.tag()).unwrap(), kind);
        }
        assert!(matches!(
            ModelKind::from_tag(5),
            Err(NodeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("sensor".parse::<ModelKind>().unwrap(), ModelKind::Sensor);
        assert_eq!("Vendor".parse::<ModelKind>().unwrap(), ModelKind::Vendor);
        assert!("thermostat".parse::<ModelKind>().is_err());
    }

    #[test]
    fn test_kind_slots() {
        assert_eq!(ModelKind::Sensor.sig_slots(), 2);
        assert_eq!(ModelKind::Switch.sig_slots(), 1);
        assert_eq!(ModelKind::Vendor.sig_slots(), 0);
        assert_eq!(ModelKind::Vendor.vendor_slots(), 1);
    }

    #[test]
    fn test_sensor_requires_channels() {
        let err = DescriptorTable::new(&[ModelDescriptor::sensor(vec![])]).unwrap_err();
        assert!(matches!(err, NodeError::InvalidArgument(_)));
    }

    #[test]
    fn test_sensor_duplicate_property() {
        let desc = ModelDescriptor::sensor(vec![
            SensorChannel::new(0x5001, reader()),
            SensorChannel::new(0x5001, reader()),
        ]);
        assert!(DescriptorTable::new(&[desc]).is_err());
    }

    #[test]
    fn test_vendor_requires_opcodes() {
        let desc = ModelDescriptor::vendor(0x0001, 0x0001, vec![], None);
        assert!(DescriptorTable::new(&[desc]).is_err());

        let desc = ModelDescriptor::vendor(0x0001, 0x0001, vec![VendorOpcode::IMU_DATA], None);
        assert!(DescriptorTable::new(&[desc]).is_ok());
    }

    #[test]
    fn test_table_capacity() {
        let descriptors: Vec<_> = (0..MAX_MODELS + 1)
            .map(|_| ModelDescriptor::switch(None))
            .collect();
        assert_eq!(
            DescriptorTable::new(&descriptors).unwrap_err(),
            NodeError::CapacityExceeded {
                count: MAX_MODELS + 1,
                max: MAX_MODELS
            }
        );

        let table = DescriptorTable::new(&descriptors[..MAX_MODELS]).unwrap();
        assert_eq!(table.len(), MAX_MODELS);
        assert_eq!(table.count(ModelKind::Switch), MAX_MODELS);
    }

    #[test]
    fn test_table_preserves_order() {
        let table = DescriptorTable::new(&[
            ModelDescriptor::dimmer(None),
            ModelDescriptor::switch(None).with_publication(false),
            ModelDescriptor::battery(None, 60_000),
        ])
        .unwrap();

        let kinds: Vec<_> = table.iter().map(|d| d.kind()).collect();
        assert_eq!(
            kinds,
            vec![ModelKind::Dimmer, ModelKind::Switch, ModelKind::Battery]
        );
        assert!(!table.get(1).unwrap().publication);
    }
}
