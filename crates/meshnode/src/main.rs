//! MeshNode - mesh node daemon
//!
//! # Usage
//!
//! ```bash
//! # Write the default configuration
//! meshnode init-config
//!
//! # Show the composition the configuration produces
//! meshnode composition
//!
//! # Run the node
//! meshnode --log-level debug run
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use meshnode::{Config, MeshNode};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "meshnode")]
#[command(about = "Mesh node with a dynamically composed model set")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "MESHNODE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the node (default)
    Run,
    /// Print the composition built from the configuration
    Composition,
    /// Write a default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command.unwrap_or(Commands::Run) {
        Commands::InitConfig { force } => {
            init_logging(args.log_level.as_deref().unwrap_or("info"));
            if let Some(path) = &args.config {
                if path.exists() && !force {
                    anyhow::bail!(
                        "{} already exists, pass --force to overwrite",
                        path.display()
                    );
                }
            }
            let config = Config::create_default(args.config)?;
            info!("Configuration written to {}", config.config_path().display());
        }
        Commands::Composition => {
            let config = Config::load(args.config)?;
            init_logging(args.log_level.as_deref().unwrap_or("warn"));
            let node = MeshNode::new(config)?;
            print_composition(&node);
        }
        Commands::Run => {
            let config = Config::load(args.config)?;
            init_logging(
                args.log_level
                    .as_deref()
                    .unwrap_or(config.logging.level.as_str()),
            );
            info!("Loaded configuration from {}", config.config_path().display());

            let mut node = MeshNode::new(config).context("Failed to initialize node")?;
            node.run().await?;
        }
    }

    Ok(())
}

fn print_composition(node: &MeshNode) {
    let context = node.context();
    let composition = context.composition();
    let header = composition.header();

    println!("Device:   {}", context.identity());
    println!(
        "Company:  0x{:04X}  Product: 0x{:04X}  Version: 0x{:04X}",
        header.company_id, header.product_id, header.version_id
    );
    println!();
    println!("SIG models ({}):", composition.sig_models().len());
    for (index, record) in composition.sig_models().iter().enumerate() {
        println!(
            "  [{}] {}{}",
            index,
            record.model_id(),
            if record.has_publication() { " pub" } else { "" }
        );
    }
    println!("Vendor models ({}):", composition.vendor_models().len());
    for (index, record) in composition.vendor_models().iter().enumerate() {
        let opcodes: Vec<String> = record.opcodes().iter().map(|op| op.to_string()).collect();
        println!(
            "  [{}] {} opcodes [{}]",
            index,
            record.model_id(),
            opcodes.join(", ")
        );
    }
    println!();
    println!("Registry:");
    for entry in context.registry().iter() {
        println!("  {} #{} at {}", entry.kind(), entry.index(), entry.slot());
    }
    println!();
    println!("Page 0:   {}", hex::encode(composition.page0()));
    println!("State:    {} bytes", context.memory().live_bytes);
}
