use anyhow::{bail, ensure, Context, Result};
use meshnode_core::{CompositionHeader, ModelKind, MAX_MODELS};
use meshnode_protocol::{Address, VendorOpcode};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub provisioning: ProvisioningConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(skip)]
    config_file_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    /// First two bytes of the device UUID
    #[serde(with = "hex_bytes")]
    pub uuid_prefix: Vec<u8>,
    /// Radio MAC, bytes 2..8 of the device UUID
    #[serde(with = "hex_bytes")]
    pub mac: Vec<u8>,
    #[serde(default)]
    pub composition: CompositionHeader,
    /// Byte budget for model state; unbounded when absent
    #[serde(default)]
    pub heap_budget: Option<usize>,
}

/// One model descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ModelConfig {
    Switch {
        /// On/off state at boot
        #[serde(default)]
        initial: bool,
        #[serde(default = "default_true")]
        publication: bool,
    },
    Dimmer {
        /// Level at boot
        #[serde(default)]
        initial: i16,
        #[serde(default = "default_true")]
        publication: bool,
    },
    Sensor {
        properties: Vec<u16>,
        #[serde(default)]
        publish_period_ms: u32,
        #[serde(default = "default_true")]
        publication: bool,
    },
    Battery {
        #[serde(default)]
        publish_period_ms: u32,
        #[serde(default = "default_true")]
        publication: bool,
    },
    Vendor {
        company_id: u16,
        model_id: u16,
        opcodes: Vec<VendorOpcode>,
        #[serde(default = "default_true")]
        publication: bool,
    },
}

fn default_true() -> bool {
    true
}

impl ModelConfig {
    pub fn kind(&self) -> ModelKind {
        match self {
            ModelConfig::Switch { .. } => ModelKind::Switch,
            ModelConfig::Dimmer { .. } => ModelKind::Dimmer,
            ModelConfig::Sensor { .. } => ModelKind::Sensor,
            ModelConfig::Battery { .. } => ModelKind::Battery,
            ModelConfig::Vendor { .. } => ModelKind::Vendor,
        }
    }

    pub fn publication(&self) -> bool {
        match self {
            ModelConfig::Switch { publication, .. }
            | ModelConfig::Dimmer { publication, .. }
            | ModelConfig::Sensor { publication, .. }
            | ModelConfig::Battery { publication, .. }
            | ModelConfig::Vendor { publication, .. } => *publication,
        }
    }
}

/// Loopback transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Advertising buffers available between drains
    pub buffer_pool: usize,
    pub drain_interval_ms: u64,
    /// Sent messages kept for inspection
    #[serde(default = "default_sent_log")]
    pub sent_log: usize,
}

fn default_sent_log() -> usize {
    256
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            buffer_pool: 20,
            drain_interval_ms: 100,
            sent_log: default_sent_log(),
        }
    }
}

/// Simulated provisioner and configuration client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    pub enabled: bool,
    /// Delay before the simulated provisioner connects
    pub delay_ms: u64,
    pub unicast: Address,
    pub net_idx: u16,
    pub app_idx: u16,
    pub iv_index: u32,
    /// Publish address given to every model with publication
    pub publish_address: Address,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_ms: 1000,
            unicast: Address::new(0x0005),
            net_idx: 0,
            app_idx: 0,
            iv_index: 0,
            publish_address: Address::new(0xC000),
        }
    }
}

/// IMU telemetry over a vendor model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub enabled: bool,
    /// Within-kind index of the vendor model used for telemetry
    pub vendor_index: usize,
    pub opcode: VendorOpcode,
    pub destination: Address,
    pub interval_ms: u64,
    /// Also publish every property of sensor 0 on each tick
    #[serde(default)]
    pub publish_sensors: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            vendor_index: 0,
            opcode: VendorOpcode::IMU_DATA,
            destination: Address::new(0x0001),
            interval_ms: 100,
            publish_sensors: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let config_path = config_path.unwrap_or_else(Self::default_config_path);

        if !config_path.exists() {
            bail!(
                "Configuration file not found: {}\nRun `meshnode init-config` to create one",
                config_path.display()
            );
        }

        let contents =
            fs::read_to_string(&config_path).context("Failed to read configuration file")?;
        let mut config = Self::from_yaml(&contents)?;
        config.config_file_path = config_path;

        Ok(config)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(contents).context("Failed to parse configuration file")?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default configuration and return it
    pub fn create_default(config_path: Option<PathBuf>) -> Result<Self> {
        let config_path = config_path.unwrap_or_else(Self::default_config_path);

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create configuration directory {}", parent.display())
            })?;
        }

        let mut config = Self::default();
        config.config_file_path = config_path.clone();

        let yaml = serde_yaml::to_string(&config)?;
        fs::write(&config_path, yaml).with_context(|| {
            format!("Failed to write configuration file {}", config_path.display())
        })?;

        Ok(config)
    }

    /// Reject configurations the node could never build
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.node.uuid_prefix.len() == 2,
            "node.uuid_prefix must be 2 bytes, got {}",
            self.node.uuid_prefix.len()
        );
        ensure!(
            self.node.mac.len() == 6,
            "node.mac must be 6 bytes, got {}",
            self.node.mac.len()
        );
        ensure!(
            self.models.len() <= MAX_MODELS,
            "{} models configured, at most {} supported",
            self.models.len(),
            MAX_MODELS
        );
        ensure!(
            self.transport.buffer_pool > 0,
            "transport.buffer_pool must be at least 1"
        );
        ensure!(
            self.transport.drain_interval_ms > 0,
            "transport.drain_interval_ms must be positive"
        );

        for (position, model) in self.models.iter().enumerate() {
            match model {
                ModelConfig::Sensor { properties, .. } if properties.is_empty() => {
                    bail!("models[{}]: sensor needs at least one property", position)
                }
                ModelConfig::Vendor { opcodes, .. } if opcodes.is_empty() => {
                    bail!("models[{}]: vendor needs at least one opcode", position)
                }
                _ => {}
            }
        }

        if self.telemetry.enabled {
            ensure!(
                self.telemetry.interval_ms > 0,
                "telemetry.interval_ms must be positive"
            );
            let vendor = self
                .models
                .iter()
                .filter(|model| model.kind() == ModelKind::Vendor)
                .nth(self.telemetry.vendor_index);
            match vendor {
                Some(ModelConfig::Vendor { opcodes, .. }) => ensure!(
                    opcodes.contains(&self.telemetry.opcode),
                    "telemetry opcode {} is not in vendor #{}'s opcode list",
                    self.telemetry.opcode,
                    self.telemetry.vendor_index
                ),
                _ => bail!(
                    "telemetry.vendor_index {} has no matching vendor model",
                    self.telemetry.vendor_index
                ),
            }
        }

        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_file_path
    }

    pub fn uuid_prefix(&self) -> Result<[u8; 2]> {
        self.node.uuid_prefix.as_slice().try_into().with_context(|| {
            format!(
                "node.uuid_prefix must be 2 bytes, got {}",
                self.node.uuid_prefix.len()
            )
        })
    }

    pub fn mac(&self) -> Result<[u8; 6]> {
        self.node
            .mac
            .as_slice()
            .try_into()
            .with_context(|| format!("node.mac must be 6 bytes, got {}", self.node.mac.len()))
    }

    fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("meshnode")
            .join("config.yaml")
    }
}

impl Default for Config {
    /// The IMU demo node: two switches, six IMU properties, one vendor model
    fn default() -> Self {
        Self {
            node: NodeConfig {
                name: meshnode_core::node::DEFAULT_DEVICE_NAME.to_string(),
                uuid_prefix: vec![0xDD, 0xDD],
                mac: vec![0x24, 0x6F, 0x28, 0x00, 0x00, 0x01],
                composition: CompositionHeader::default(),
                heap_budget: None,
            },
            models: vec![
                ModelConfig::Switch {
                    initial: false,
                    publication: true,
                },
                ModelConfig::Switch {
                    initial: false,
                    publication: true,
                },
                ModelConfig::Sensor {
                    properties: crate::imu::PROPERTIES.to_vec(),
                    publish_period_ms: 0,
                    publication: true,
                },
                ModelConfig::Battery {
                    publish_period_ms: 60_000,
                    publication: true,
                },
                ModelConfig::Vendor {
                    company_id: 0x0001,
                    model_id: 0x0001,
                    opcodes: vec![VendorOpcode::IMU_DATA, VendorOpcode::IMU_GYRO],
                    publication: true,
                },
            ],
            transport: TransportConfig::default(),
            provisioning: ProvisioningConfig::default(),
            telemetry: TelemetryConfig::default(),
            logging: LoggingConfig::default(),
            config_file_path: PathBuf::new(),
        }
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
