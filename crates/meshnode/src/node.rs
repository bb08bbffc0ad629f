use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration};
use tracing::{debug, info, warn};

use crate::config::{Config, ModelConfig, ProvisioningConfig, TelemetryConfig};
use crate::imu::{self, SyntheticImu};
use crate::stack::LoopbackStack;

use meshnode_core::{
    AllocPolicy, Arena, ConfigEvent, DeviceIdentity, DimmerObserver, ModelDescriptor, NodeContext,
    NodeObserver, NodeSetup, ProvisioningEvent, SlotRef, StackEvent, SwitchObserver, VendorHandler,
    VendorMessage,
};
use meshnode_protocol::{Address, CompactImuSample};

/// Main node orchestrator
pub struct MeshNode {
    config: Config,
    context: Arc<NodeContext>,
    stack: Arc<LoopbackStack>,
    imu: Arc<SyntheticImu>,
    tasks: Vec<JoinHandle<()>>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl MeshNode {
    /// Build the composition. Nothing reaches the stack until [`MeshNode::start`].
    pub fn new(config: Config) -> Result<Self> {
        info!("Initializing node components...");
        config.validate().context("Invalid configuration")?;

        let identity = DeviceIdentity::new(config.uuid_prefix()?, config.mac()?)
            .with_name(&config.node.name)
            .context("Invalid device name")?;

        let arena = match config.node.heap_budget {
            Some(budget) => Arena::new(AllocPolicy::Budget(budget)),
            None => Arena::unbounded(),
        };

        let stack = Arc::new(LoopbackStack::new(
            config.transport.buffer_pool,
            config.transport.sent_log,
        ));
        info!(
            "✓ Loopback transport ready ({} buffers)",
            config.transport.buffer_pool
        );

        let imu = Arc::new(SyntheticImu::default());
        let descriptors = build_descriptors(&config.models, &imu);

        let setup = NodeSetup::new(identity)
            .with_header(config.node.composition)
            .with_arena(arena)
            .with_observer(Arc::new(NodeLogger));
        let context = NodeContext::build(setup, &descriptors, stack.clone())
            .context("Failed to build composition")?;
        info!(
            "✓ Composition built: {} models, {} bytes of model state",
            context.composition().model_count(),
            context.memory().live_bytes
        );

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        Ok(Self {
            config,
            context: Arc::new(context),
            stack,
            imu,
            tasks: Vec::new(),
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.context
    }

    pub fn stack(&self) -> &Arc<LoopbackStack> {
        &self.stack
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register with the stack and spawn the background tasks
    pub fn start(&mut self) -> Result<()> {
        self.context
            .start()
            .context("Stack rejected the composition")?;
        info!("✓ Composition registered with the stack");

        let stack = self.stack.clone();
        let drain_every = Duration::from_millis(self.config.transport.drain_interval_ms);
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = interval(drain_every);
            loop {
                ticker.tick().await;
                stack.drain();
            }
        }));
        debug!("Transport drain started (interval: {:?})", drain_every);

        if self.config.provisioning.enabled {
            let context = self.context.clone();
            let provisioning = self.config.provisioning.clone();
            self.tasks.push(tokio::spawn(async move {
                sleep(Duration::from_millis(provisioning.delay_ms)).await;
                provision(&context, &provisioning);
            }));
            info!(
                "✓ Simulated provisioner connects in {} ms",
                self.config.provisioning.delay_ms
            );
        } else {
            info!("Provisioning simulation disabled, waiting for a real provisioner");
        }

        if self.config.telemetry.enabled {
            let context = self.context.clone();
            let imu = self.imu.clone();
            let telemetry = self.config.telemetry.clone();
            let sensor_properties = first_sensor_properties(&self.config.models);
            self.tasks.push(tokio::spawn(async move {
                let mut ticker = interval(Duration::from_millis(telemetry.interval_ms));
                loop {
                    ticker.tick().await;
                    if let Err(e) = telemetry_tick(&context, &imu, &telemetry, &sensor_properties) {
                        warn!("Telemetry send failed: {}", e);
                    }
                }
            }));
            info!(
                "✓ IMU telemetry every {} ms to {}",
                self.config.telemetry.interval_ms, self.config.telemetry.destination
            );
        }

        Ok(())
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("Starting MeshNode services...");
        self.start()?;

        let identity = self.context.identity();
        info!("═══════════════════════════════════════════════");
        info!("  MeshNode is now running");
        info!("═══════════════════════════════════════════════");
        info!("  Device: {}", identity.name());
        info!("  UUID: {}", identity.uuid_hex());
        info!("  Models: {}", self.context.composition().model_count());
        if !self.config.config_path().as_os_str().is_empty() {
            info!("  Config: {}", self.config.config_path().display());
        }
        info!("═══════════════════════════════════════════════");

        self.wait_for_shutdown().await;

        info!("Shutting down MeshNode...");
        self.shutdown().await
    }

    async fn wait_for_shutdown(&mut self) {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C signal");
            }
            _ = self.shutdown_rx.recv() => {
                info!("Received shutdown signal");
            }
        }
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Stopping background tasks...");
        for task in self.tasks.drain(..) {
            task.abort();
        }

        let stats = self.stack.stats();
        info!(
            "Transport: {} sent, {} segmented, {} dropped",
            stats.sent, stats.segmented, stats.dropped
        );
        info!("Shutdown complete");
        Ok(())
    }

    pub fn shutdown_handle(&self) -> mpsc::Sender<()> {
        self.shutdown_tx.clone()
    }
}

/// Turn configured models into descriptors with logging observers attached
pub fn build_descriptors(models: &[ModelConfig], imu: &Arc<SyntheticImu>) -> Vec<ModelDescriptor> {
    models
        .iter()
        .map(|model| {
            let descriptor = match model {
                ModelConfig::Switch { initial, .. } => {
                    let observer = |index: usize, on: bool| {
                        info!("Switch #{} is now {}", index, if on { "ON" } else { "OFF" })
                    };
                    ModelDescriptor::switch(Some(Arc::new(observer) as Arc<dyn SwitchObserver>))
                        .with_initial_on(*initial)
                }
                ModelConfig::Dimmer { initial, .. } => {
                    let observer =
                        |index: usize, level: i16| info!("Dimmer #{} level {}", index, level);
                    ModelDescriptor::dimmer(Some(Arc::new(observer) as Arc<dyn DimmerObserver>))
                        .with_initial_level(*initial)
                }
                ModelConfig::Sensor {
                    properties,
                    publish_period_ms,
                    ..
                } => ModelDescriptor::sensor(imu::channels(imu, properties, *publish_period_ms)),
                ModelConfig::Battery {
                    publish_period_ms, ..
                } => ModelDescriptor::battery(None, *publish_period_ms),
                ModelConfig::Vendor {
                    company_id,
                    model_id,
                    opcodes,
                    ..
                } => ModelDescriptor::vendor(
                    *company_id,
                    *model_id,
                    opcodes.clone(),
                    Some(Arc::new(TelemetryLogger) as Arc<dyn VendorHandler>),
                ),
            };
            descriptor.with_publication(model.publication())
        })
        .collect()
}

fn first_sensor_properties(models: &[ModelConfig]) -> Vec<u16> {
    models
        .iter()
        .find_map(|model| match model {
            ModelConfig::Sensor { properties, .. } => Some(properties.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

/// Play the provisioner and configuration client: provision the node, add
/// an application key, bind every model and give each model with
/// publication the configured publish address.
pub fn provision(context: &NodeContext, provisioning: &ProvisioningConfig) {
    let dispatch = |event| context.dispatch(event);

    dispatch(StackEvent::Provisioning(ProvisioningEvent::LinkOpen));
    dispatch(StackEvent::Provisioning(ProvisioningEvent::Complete {
        net_idx: provisioning.net_idx,
        unicast: provisioning.unicast,
        iv_index: provisioning.iv_index,
    }));
    dispatch(StackEvent::Provisioning(ProvisioningEvent::LinkClose));
    dispatch(StackEvent::Config(ConfigEvent::AppKeyAdd {
        net_idx: provisioning.net_idx,
        app_idx: provisioning.app_idx,
    }));

    let composition = context.composition();
    let sig = composition
        .sig_models()
        .iter()
        .enumerate()
        .skip(1)
        .map(|(index, record)| (SlotRef::sig(index), record.has_publication()));
    let vendor = composition
        .vendor_models()
        .iter()
        .enumerate()
        .map(|(index, record)| (SlotRef::vendor(index), record.has_publication()));

    for (slot, publication) in sig.chain(vendor) {
        dispatch(StackEvent::Config(ConfigEvent::ModelAppBind {
            slot,
            app_idx: provisioning.app_idx,
        }));
        if publication {
            dispatch(StackEvent::Config(ConfigEvent::ModelPubSet {
                slot,
                publish_address: provisioning.publish_address,
            }));
        }
    }
}

/// One telemetry period. Returns `false` while the node is unprovisioned.
pub fn telemetry_tick(
    context: &NodeContext,
    imu: &SyntheticImu,
    telemetry: &TelemetryConfig,
    sensor_properties: &[u16],
) -> Result<bool> {
    if !context.is_provisioned() {
        return Ok(false);
    }

    let reading = imu.sample();
    context.send_vendor(
        telemetry.vendor_index,
        telemetry.opcode,
        &reading.compact().to_bytes(),
        telemetry.destination,
    )?;

    if telemetry.publish_sensors {
        for &property_id in sensor_properties {
            if let Err(e) = context.publish_sensor(0, property_id) {
                debug!("Sensor 0x{:04X} not published: {}", property_id, e);
            }
        }
    }

    Ok(true)
}

struct NodeLogger;

impl NodeObserver for NodeLogger {
    fn provisioned(&self, unicast: Address) {
        info!("Node provisioned with unicast address {}", unicast);
    }

    fn reset(&self) {
        warn!("Node reset, waiting to be provisioned again");
    }

    fn config_complete(&self, app_idx: u16) {
        info!("Configuration complete (app_idx 0x{:03X})", app_idx);
    }
}

/// Logs inbound vendor messages, decoding compact IMU samples
struct TelemetryLogger;

impl VendorHandler for TelemetryLogger {
    fn handle(&self, message: &VendorMessage<'_>) {
        match CompactImuSample::from_bytes(message.payload) {
            Ok(sample) => info!(
                "IMU from {}: t={} accel={:?} mg gyro={:?} dps",
                message.sender(),
                sample.timestamp,
                sample.accel_mg(),
                sample.gyro_dps()
            ),
            Err(_) => info!(
                "Vendor #{} {} from {}: {}",
                message.index,
                message.opcode,
                message.sender(),
                hex::encode(message.payload)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_descriptors_matches_config() {
        let config = Config::default();
        let imu = Arc::new(SyntheticImu::default());
        let descriptors = build_descriptors(&config.models, &imu);

        let kinds: Vec<_> = descriptors.iter().map(|d| d.kind()).collect();
        let expected: Vec<_> = config.models.iter().map(|m| m.kind()).collect();
        assert_eq!(kinds, expected);
    }

    #[test]
    fn test_first_sensor_properties() {
        let config = Config::default();
        assert_eq!(first_sensor_properties(&config.models), imu::PROPERTIES.to_vec());
        let switch = ModelConfig::Switch {
            initial: false,
            publication: true,
        };
        assert!(first_sensor_properties(&[switch]).is_empty());
    }

    #[test]
    fn test_invalid_name_is_rejected() {
        let mut config = Config::default();
        config.node.name = "x".repeat(40);
        assert!(MeshNode::new(config).is_err());
    }

    #[test]
    fn test_short_uuid_prefix_is_an_error() {
        let mut config = Config::default();
        config.node.uuid_prefix = vec![0xDD];
        assert!(MeshNode::new(config).is_err());

        let mut config = Config::default();
        config.node.mac = vec![0x24, 0x6F, 0x28];
        assert!(MeshNode::new(config).is_err());
    }

    #[test]
    fn test_initial_values_reach_the_node() {
        let mut config = Config::default();
        config.telemetry.enabled = false;
        config.models = vec![
            ModelConfig::Switch {
                initial: true,
                publication: true,
            },
            ModelConfig::Dimmer {
                initial: 1500,
                publication: true,
            },
        ];
        let node = MeshNode::new(config).unwrap();
        assert!(node.context().switch(0).unwrap());
        assert_eq!(node.context().dimmer(0).unwrap(), 1500);
    }

    #[test]
    fn test_heap_budget_too_small() {
        let mut config = Config::default();
        config.node.heap_budget = Some(16);
        assert!(MeshNode::new(config).is_err());
    }

    #[test]
    fn test_unprovisioned_tick_is_skipped() {
        let config = Config::default();
        let node = MeshNode::new(config.clone()).unwrap();
        let sent = telemetry_tick(
            node.context(),
            &SyntheticImu::default(),
            &config.telemetry,
            &[],
        )
        .unwrap();
        assert!(!sent);
    }
}
