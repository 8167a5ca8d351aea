//! Labnode - Command line client for Labnode laboratory devices
//!
//! Diagnostics front end: identify a device, send raw operations, and manage
//! the configuration file.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use labnode::config::{self, Config};
use labnode::network::{ConnectionManager, SerialOptions, TransportConfig};
use labnode::protocol::{self, Framing, OperationId, OperationMap};
use labnode::Value;

/// Labnode - Talk to Labnode devices
#[derive(Parser)]
#[command(name = "labnode")]
#[command(version)]
#[command(about = "Talk to Labnode devices over TCP or serial", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Device host name or address (overrides the configured transport)
    #[arg(long, global = true, conflicts_with = "serial")]
    host: Option<String>,

    /// Device TCP port
    #[arg(short, long, global = true, default_value_t = protocol::DEFAULT_PORT)]
    port: u16,

    /// Serial device path (overrides the configured transport)
    #[arg(long, global = true)]
    serial: Option<String>,

    /// Serial baud rate
    #[arg(long, global = true, default_value_t = 115_200)]
    baud: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the device type and API version
    Identify,

    /// Send raw operations with null arguments
    Query {
        /// Operation id to include (repeatable)
        #[arg(long = "op", value_name = "ID", required = true)]
        ops: Vec<u8>,

        /// Don't wait for a reply
        #[arg(long)]
        no_reply: bool,

        /// Print the reply as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show protocol information
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let (mut config, load_error) = if let Some(config_path) = &cli.config {
        (Config::load(config_path)?, None)
    } else {
        match Config::load_default() {
            Ok(config) => (config, None),
            Err(e) => (Config::default(), Some(e)),
        }
    };

    init_logging(cli.verbose || config.general.verbose, config.general.log_file.as_deref())?;

    if let Some(e) = load_error {
        tracing::warn!("Ignoring configuration file: {}", e);
    }

    if let Some(transport) = transport_override(&cli) {
        config.transport = transport;
    }

    match cli.command {
        Commands::Identify => run_identify(&config).await?,
        Commands::Query { ops, no_reply, json } => run_query(&config, ops, !no_reply, json).await?,
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => print_protocol_info(&config),
    }

    Ok(())
}

/// Log to stderr, and additionally to `log_file` when configured.
///
/// `RUST_LOG` wins over `verbose`.
fn init_logging(verbose: bool, log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let file_layer = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    Ok(())
}

/// Transport selected on the command line, if any
fn transport_override(cli: &Cli) -> Option<TransportConfig> {
    if let Some(device) = &cli.serial {
        let options = SerialOptions::default().with_baud_rate(cli.baud);
        return Some(TransportConfig::serial(device.clone(), options));
    }
    cli.host
        .as_ref()
        .map(|host| TransportConfig::tcp(host.clone(), cli.port))
}

async fn connect(config: &Config) -> anyhow::Result<ConnectionManager> {
    let manager = ConnectionManager::new(config.connection_options());
    manager
        .connect(&config.transport)
        .await
        .with_context(|| format!("Failed to connect to {:?}", config.transport))?;
    Ok(manager)
}

async fn run_identify(config: &Config) -> anyhow::Result<()> {
    let manager = connect(config).await?;
    let result = manager.identify().await;
    manager.close().await;

    let identity = result?;
    let (major, minor, patch) = identity.api_version;
    println!("Device type: {}", identity.device_type);
    println!("API version: {}.{}.{}", major, minor, patch);
    Ok(())
}

async fn run_query(config: &Config, ops: Vec<u8>, response_expected: bool, json: bool) -> anyhow::Result<()> {
    let operations: OperationMap = ops
        .into_iter()
        .map(|id| (OperationId(id), Value::Null))
        .collect();

    let manager = connect(config).await?;
    let result = manager.send_request(operations, response_expected, None).await;
    let stats = manager.stats();
    manager.close().await;

    let reply = result?;
    tracing::debug!("Connection stats: {:?}", stats);

    if !response_expected {
        println!("Request sent");
        return Ok(());
    }

    if json {
        let object: serde_json::Map<String, serde_json::Value> = reply
            .iter()
            .map(|(id, value)| Ok::<_, serde_json::Error>((id.to_string(), serde_json::to_value(value)?)))
            .collect::<Result<_, _>>()?;
        println!("{}", serde_json::to_string_pretty(&object)?);
    } else {
        for (id, value) in reply.iter() {
            println!("{:>3}: {:?}", id, value);
        }
    }
    Ok(())
}

/// Print protocol information
fn print_protocol_info(config: &Config) {
    println!("Labnode Protocol Information");
    println!("============================\n");

    println!("Default Port: {}", protocol::DEFAULT_PORT);
    println!("Correlation Key: {}", protocol::function::REQUEST_ID);
    println!("Default Id Space: {}", protocol::DEFAULT_ID_SPACE);
    println!("Max Payload: {} bytes", protocol::DEFAULT_MAX_PAYLOAD);
    println!(
        "Framing: {} (serial), {} (tcp)",
        Framing::Cobs,
        Framing::LengthPrefixed
    );

    println!("\nConfigured Transport: {:?}", config.transport);
    println!("Config Search Path:");
    for path in Config::default_paths() {
        println!("  - {}", path.display());
    }
}
