/**
 * Integration tests for the meshnode daemon
 *
 * These tests exercise the daemon end to end:
 * - Configuration files on disk
 * - Simulated provisioning and publication binding
 * - IMU telemetry over the loopback transport
 * - Transport buffer exhaustion and shutdown
 */
use anyhow::Result;
use meshnode::config::{Config, ModelConfig};
use meshnode::node::{provision, telemetry_tick};
use meshnode::{imu, MeshNode};
use meshnode_core::{ModelKind, NodeError, StackError};
use meshnode_protocol::{Address, CompactImuSample, Opcode, VendorOpcode};
use std::time::Duration;
use tempfile::TempDir;

fn fast_config() -> Config {
    let mut config = Config::default();
    config.provisioning.delay_ms = 10;
    config.telemetry.interval_ms = 20;
    config.transport.drain_interval_ms = 5;
    config
}

// ====================
// Configuration
// ====================

#[test]
fn test_init_then_load_config() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("nested").join("config.yaml");

    let written = Config::create_default(Some(path.clone()))?;
    assert!(path.exists());
    assert_eq!(written.config_path(), path.as_path());

    let loaded = Config::load(Some(path.clone()))?;
    assert_eq!(loaded.models, written.models);
    assert_eq!(loaded.config_path(), path.as_path());
    Ok(())
}

#[test]
fn test_missing_config_file() {
    let dir = TempDir::new().unwrap();
    let result = Config::load(Some(dir.path().join("absent.yaml")));
    assert!(result.is_err());
}

#[test]
fn test_invalid_config_file() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("config.yaml");
    std::fs::write(
        &path,
        "node:\n  name: n\n  uuid_prefix: \"dd\"\n  mac: \"246f28000001\"\nmodels: []\n",
    )?;

    assert!(Config::load(Some(path)).is_err());
    Ok(())
}

// ====================
// Provisioning
// ====================

#[test]
fn test_provision_binds_publication() -> Result<()> {
    let config = fast_config();
    let mut node_config = config.clone();
    node_config.telemetry.enabled = false;
    let node = MeshNode::new(node_config)?;
    node.context().start()?;

    let context = node.context();
    assert!(context.publish_switch(0).is_err());

    provision(context, &config.provisioning);
    assert!(context.is_provisioned());
    assert_eq!(context.unicast_address(), config.provisioning.unicast);
    assert_eq!(context.provisioning().app_idx, Some(config.provisioning.app_idx));

    context.set_switch(1, true, true)?;
    context.publish_sensor(0, imu::ACCEL_Z)?;
    context.publish_battery(0)?;

    let sent = node.stack().sent_messages();
    assert_eq!(sent.len(), 3);
    assert!(sent
        .iter()
        .all(|message| message.destination == config.provisioning.publish_address));
    assert_eq!(sent[0].opcode, Opcode::GENERIC_ONOFF_STATUS);
    assert_eq!(sent[0].payload, vec![1]);
    assert_eq!(sent[1].opcode, Opcode::SENSOR_STATUS);
    assert_eq!(sent[2].opcode, Opcode::GENERIC_BATTERY_STATUS);
    Ok(())
}

#[test]
fn test_models_without_publication_stay_unbound() -> Result<()> {
    let mut config = fast_config();
    config.telemetry.enabled = false;
    config.models = vec![
        ModelConfig::Switch {
            initial: false,
            publication: false,
        },
        ModelConfig::Switch {
            initial: false,
            publication: true,
        },
    ];
    let node = MeshNode::new(config.clone())?;
    node.context().start()?;
    provision(node.context(), &config.provisioning);

    assert!(node.context().publish_switch(0).is_err());
    assert!(node.context().publish_switch(1).is_ok());
    Ok(())
}

// ====================
// Telemetry
// ====================

#[test]
fn test_telemetry_tick_sends_compact_sample() -> Result<()> {
    let config = fast_config();
    let node = MeshNode::new(config.clone())?;
    node.context().start()?;
    let source = imu::SyntheticImu::new(0);

    assert!(!telemetry_tick(node.context(), &source, &config.telemetry, &[])?);
    provision(node.context(), &config.provisioning);
    assert!(telemetry_tick(node.context(), &source, &config.telemetry, &[])?);

    let sent = node.stack().sent_messages();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].opcode, Opcode::from(VendorOpcode::IMU_DATA));
    assert_eq!(sent[0].destination, Address::new(0x0001));
    assert_eq!(sent[0].payload.len(), CompactImuSample::SIZE);
    // 3 byte opcode + 8 bytes fits one unsegmented message
    assert!(!sent[0].segmented);

    let sample = CompactImuSample::from_bytes(&sent[0].payload)?;
    assert_eq!(sample.accel[2], 10);
    Ok(())
}

#[test]
fn test_telemetry_publishes_sensors() -> Result<()> {
    let mut config = fast_config();
    config.telemetry.publish_sensors = true;
    let node = MeshNode::new(config.clone())?;
    node.context().start()?;
    provision(node.context(), &config.provisioning);

    telemetry_tick(
        node.context(),
        &imu::SyntheticImu::default(),
        &config.telemetry,
        &imu::PROPERTIES,
    )?;

    let sent = node.stack().sent_messages();
    assert_eq!(sent.len(), 1 + imu::PROPERTIES.len());
    assert!(sent[1..]
        .iter()
        .all(|message| message.opcode == Opcode::SENSOR_STATUS));
    Ok(())
}

#[tokio::test]
async fn test_running_node_provisions_and_streams() -> Result<()> {
    let mut node = MeshNode::new(fast_config())?;
    node.start()?;

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(node.context().is_provisioned());
    let stats = node.stack().stats();
    assert!(stats.sent >= 2, "sent {}", stats.sent);
    assert!(node
        .stack()
        .sent_messages()
        .iter()
        .any(|message| message.opcode == Opcode::from(VendorOpcode::IMU_DATA)));

    node.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_shutdown_handle_stops_run() -> Result<()> {
    let mut config = fast_config();
    config.provisioning.enabled = false;
    let mut node = MeshNode::new(config)?;

    node.shutdown_handle().send(()).await?;
    tokio::time::timeout(Duration::from_secs(5), node.run()).await??;
    Ok(())
}

// ====================
// Transport
// ====================

#[test]
fn test_buffer_pool_exhaustion_reaches_caller() -> Result<()> {
    let mut config = fast_config();
    config.transport.buffer_pool = 1;
    let node = MeshNode::new(config.clone())?;
    node.context().start()?;
    provision(node.context(), &config.provisioning);

    node.context().publish_switch(0)?;
    let err = node.context().publish_switch(0).unwrap_err();
    assert_eq!(err, NodeError::Stack(StackError::NoBuffers));
    assert_eq!(node.stack().stats().dropped, 1);

    node.stack().drain();
    node.context().publish_switch(0)?;
    Ok(())
}

#[test]
fn test_registry_follows_config_order() -> Result<()> {
    let node = MeshNode::new(fast_config())?;
    let registry = node.context().registry();

    assert_eq!(registry.count(ModelKind::Switch), 2);
    assert_eq!(registry.count(ModelKind::Sensor), 1);
    assert_eq!(registry.count(ModelKind::Vendor), 1);
    // Configuration Server, two switches, sensor + setup, battery
    assert_eq!(node.context().composition().sig_models().len(), 6);
    Ok(())
}
