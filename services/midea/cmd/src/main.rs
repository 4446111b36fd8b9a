//! `midea` command-line client.
//!
//! Discovers appliances on the local network, runs long-lived sessions for
//! configured devices and decodes captured envelopes.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use midea_devices::create_device;
use midea_discovery::{Discoverer, DiscoveryConfig};
use midea_session::{DeviceSession, MessageSerial};
use midea_wire::{udp_id, verify, MessageResponse, UdpIdMethod};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::MideaConfig;
use logging::MideaLogFormatter;

/// Local-network client for smart appliances
#[derive(Parser, Debug)]
#[command(name = "midea", version, about = "Local-network client for smart appliances")]
struct Args {
    /// Configuration file path
    #[arg(long, global = true, default_value = "midea.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); defaults to the config value
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Broadcast a probe and print the appliances that answer
    Discover {
        /// Probe a single address instead of every local broadcast address
        #[arg(long)]
        address: Option<Ipv4Addr>,

        /// Only keep this family code, hex (repeatable), e.g. --type a1
        #[arg(long = "type", value_parser = parse_hex_u8)]
        types: Vec<u8>,

        /// Idle timeout, e.g. 5s
        #[arg(long)]
        timeout: Option<humantime::Duration>,
    },

    /// Run sessions for every configured device and log attribute changes
    Run,

    /// Decode a hex envelope and run the family codec over it
    Decode {
        /// Envelope bytes as hex
        message: String,

        /// Family code, hex; taken from the header when absent
        #[arg(long = "type", value_parser = parse_hex_u8)]
        device_type: Option<u8>,
    },

    /// Print the UDP ids of an appliance
    Udpid {
        /// Appliance id
        device_id: u64,
    },
}

fn parse_hex_u8(value: &str) -> Result<u8, String> {
    let digits = value.trim_start_matches("0x").trim_start_matches("0X");
    u8::from_str_radix(digits, 16).map_err(|e| format!("invalid family code {}: {}", value, e))
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = MideaConfig::load_from_file(&args.config)?;
    let log_level = args.log_level.clone().unwrap_or_else(|| config.log_level.clone());

    let mut env_filter = EnvFilter::new("warn");
    for target in [
        "midea",
        "midea_wire",
        "midea_session",
        "midea_devices",
        "midea_discovery",
    ] {
        env_filter = env_filter.add_directive(format!("{}={}", target, log_level).parse()?);
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(true)
        .event_format(MideaLogFormatter::new("midea"))
        .init();

    info!("Starting midea v{}", env!("CARGO_PKG_VERSION"));
    config.log_notices();

    match args.command {
        Command::Discover {
            address,
            types,
            timeout,
        } => {
            let discovery = DiscoveryConfig {
                timeout: timeout.map(Into::into).unwrap_or_else(|| config.discovery_timeout()),
                ..DiscoveryConfig::default()
            };
            discover(discovery, &types, address).await
        }
        Command::Run => run(&config).await,
        Command::Decode {
            message,
            device_type,
        } => decode(&message, device_type),
        Command::Udpid { device_id } => {
            for method in [UdpIdMethod::ReversedBig, UdpIdMethod::Big, UdpIdMethod::Little] {
                println!("{:?}: {}", method, udp_id(device_id, method));
            }
            Ok(())
        }
    }
}

async fn discover(config: DiscoveryConfig, types: &[u8], address: Option<Ipv4Addr>) -> Result<()> {
    component_info!("discovery", "Probing for {:?}", config.timeout);
    let devices = Discoverer::new(config)
        .discover(types, address)
        .await
        .context("discovery failed")?;

    component_info!("discovery", "Found {} device(s)", devices.len());
    let devices: Vec<_> = devices.values().collect();
    println!("{}", serde_json::to_string_pretty(&devices)?);
    Ok(())
}

async fn run(config: &MideaConfig) -> Result<()> {
    if config.devices.is_empty() {
        bail!("no devices configured");
    }

    let session_config = config.session_config();
    let mut handles = Vec::new();
    let mut tasks = Vec::new();

    for device in &config.devices {
        let info = device.device_info();
        let device_id = info.device_id;
        let Some(codec) = create_device(
            info.device_type,
            Arc::new(MessageSerial::new()),
            device.customize.as_deref(),
        ) else {
            component_warn!(
                "run",
                "Device {} has unsupported type {:#04x}, skipping",
                device_id,
                info.device_type
            );
            continue;
        };

        let credentials = device.credentials()?;
        component_debug!(
            "run",
            "Device {} at {}:{} speaks {:?}",
            device_id,
            info.ip,
            info.port,
            info.protocol
        );
        let (session, handle) =
            DeviceSession::new(info, credentials, codec, session_config.clone());
        handle.register_update(move |changes| match serde_json::to_string(changes) {
            Ok(json) => component_info!("device", "[{}] {}", device_id, json),
            Err(e) => component_error!("device", "[{}] unprintable update: {}", device_id, e),
        });

        component_info!("run", "Starting session for device {}", device_id);
        handles.push(handle);
        tasks.push(session.spawn());
    }

    if tasks.is_empty() {
        bail!("none of the configured devices is supported");
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    component_info!("run", "Shutting down {} session(s)", handles.len());

    for handle in &handles {
        handle.stop();
    }
    for task in tasks {
        if let Err(e) = task.await {
            component_error!("run", "Session task failed: {}", e);
        }
    }
    Ok(())
}

fn decode(message: &str, device_type: Option<u8>) -> Result<()> {
    let cleaned: String = message.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = hex::decode(&cleaned).context("message is not valid hex")?;
    if let Err(e) = verify(&bytes) {
        component_warn!("decode", "Envelope does not verify: {}", e);
    }

    let response = MessageResponse::parse(&bytes).context("cannot parse envelope")?;
    let header = &response.header;
    println!(
        "type={:#04x} message={:#04x} device_protocol={} body={}",
        header.device_type,
        header.message_type,
        header.device_protocol_version,
        hex::encode(&response.body)
    );

    let device_type = device_type.unwrap_or(header.device_type);
    let Some(mut codec) = create_device(device_type, Arc::new(MessageSerial::new()), None) else {
        bail!("no codec for type {:#04x}", device_type);
    };
    let changes = codec
        .process_message(&response)
        .context("codec rejected the message")?;
    println!("{}", serde_json::to_string_pretty(&changes)?);
    Ok(())
}
