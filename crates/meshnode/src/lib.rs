//! MeshNode daemon
//!
//! Runs a mesh node built from a YAML model list against a loopback stack,
//! with a simulated provisioner and an IMU telemetry task.

pub mod config;
pub mod imu;
pub mod node;
pub mod stack;

pub use config::{Config, ModelConfig};
pub use node::MeshNode;
pub use stack::{LoopbackStack, SentMessage, TransportStats};
