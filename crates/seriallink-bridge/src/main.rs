//! `seriallink-bridge` – relay a serial device onto an MQTT topic pair.
//!
//! Messages on the inbound topic are written to the serial port verbatim;
//! whatever the port delivers per read is published on the outbound topic.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: /dev/ttyAMA0 @ 1 Mbaud, broker localhost:1883, robot/tx -> robot/rx
//! seriallink-bridge
//!
//! # Explicit device and broker, verbose
//! seriallink-bridge --serial_port /dev/ttyUSB0 --broker 192.168.0.209 --loglevel debug
//!
//! # Show the effective configuration and exit
//! seriallink-bridge --config bridge.toml --print-config
//! ```
//!
//! Exits with status 1 when the configuration is invalid, the serial device
//! cannot be opened, or the broker cannot be reached at startup.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use seriallink_bridge::config::{self, BridgeConfig};
use seriallink_bridge::daemon::{BridgeDaemon, BridgeSettings, StatsSnapshot};
use seriallink_bridge::telemetry;
use seriallink_hal::NativeSerial;
use seriallink_middleware::{MqttLink, MqttLinkOptions};
use seriallink_types::{LinkError, QoS};
use tracing::{error, info, warn};

/// Serial <-> MQTT bridge
#[derive(Parser, Debug)]
#[command(name = "seriallink-bridge")]
#[command(about = "Relay a serial device onto an MQTT topic pair")]
#[command(version)]
struct Args {
    /// Log level
    #[arg(
        long,
        default_value = "info",
        value_parser = ["trace", "debug", "info", "warning", "warn", "error", "critical"]
    )]
    loglevel: String,

    /// Serial device path
    #[arg(long = "serial_port", alias = "serial-port")]
    serial_port: Option<String>,

    /// Serial line speed in baud
    #[arg(long)]
    baud: Option<u32>,

    /// MQTT broker as host or host:port
    #[arg(long)]
    broker: Option<String>,

    /// MQTT broker port
    #[arg(long)]
    broker_port: Option<u16>,

    /// Topic written to the serial device
    #[arg(long)]
    inbound_topic: Option<String>,

    /// Topic receiving serial reads
    #[arg(long)]
    outbound_topic: Option<String>,

    /// Delivery quality (0, 1, 2)
    #[arg(long)]
    qos: Option<QoS>,

    /// Sleep between serial polls, in microseconds
    #[arg(long)]
    poll_interval_us: Option<u64>,

    /// Configuration file path (default: ~/.seriallink/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let guard =
        telemetry::init_tracing("seriallink-bridge", telemetry::level_directive(&args.loglevel));

    let code = match resolve_config(&args) {
        Ok(cfg) if args.print_config => print_config(&cfg),
        Ok(cfg) => serve(&cfg),
        Err(e) => {
            error!(error = %e, "invalid configuration");
            ExitCode::FAILURE
        }
    };

    drop(guard);
    code
}

fn serve(cfg: &BridgeConfig) -> ExitCode {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    match run_bridge(cfg, &shutdown) {
        Ok(stats) => {
            info!(
                to_serial = stats.messages_to_serial,
                to_broker = stats.messages_to_broker,
                "exiting"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "bridge failed to start");
            ExitCode::FAILURE
        }
    }
}

fn run_bridge(cfg: &BridgeConfig, shutdown: &AtomicBool) -> Result<StatsSnapshot, LinkError> {
    let device = NativeSerial::open(&cfg.serial_port, cfg.baud_rate, cfg.serial_timeout())?;
    let link = MqttLink::new(
        &cfg.broker(),
        MqttLinkOptions {
            keep_alive: cfg.keep_alive(),
            ..MqttLinkOptions::default()
        },
    );
    info!(broker = %cfg.broker(), "connecting to broker");
    let daemon = BridgeDaemon::start(device, Box::new(link), BridgeSettings::from(cfg))?;
    daemon.run(shutdown);
    Ok(daemon.shutdown())
}

/// Defaults, then the config file, then `SERIALLINK_*` variables, then flags.
fn resolve_config(args: &Args) -> Result<BridgeConfig, LinkError> {
    let mut cfg = match &args.config {
        Some(path) => config::load_from(path)?.ok_or_else(|| {
            LinkError::Config(format!("config file {} not found", path.display()))
        })?,
        None => config::load()?.unwrap_or_default(),
    };
    config::apply_env_overrides(&mut cfg);
    apply_args(&mut cfg, args)?;
    cfg.validate()?;
    Ok(cfg)
}

fn apply_args(cfg: &mut BridgeConfig, args: &Args) -> Result<(), LinkError> {
    if let Some(port) = &args.serial_port {
        cfg.serial_port = port.clone();
    }
    if let Some(baud) = args.baud {
        cfg.baud_rate = baud;
    }
    if let Some(broker) = &args.broker {
        cfg.set_broker(broker)?;
    }
    if let Some(port) = args.broker_port {
        cfg.broker_port = port;
    }
    if let Some(topic) = &args.inbound_topic {
        cfg.inbound_topic = topic.clone();
    }
    if let Some(topic) = &args.outbound_topic {
        cfg.outbound_topic = topic.clone();
    }
    if let Some(qos) = args.qos {
        cfg.qos = qos;
    }
    if let Some(us) = args.poll_interval_us {
        cfg.poll_interval_us = us;
    }
    Ok(())
}

fn print_config(cfg: &BridgeConfig) -> ExitCode {
    match toml::to_string_pretty(cfg) {
        Ok(raw) => {
            print!("{raw}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "cannot render configuration");
            ExitCode::FAILURE
        }
    }
}
