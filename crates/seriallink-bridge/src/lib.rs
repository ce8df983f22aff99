//! `seriallink-bridge` – bidirectional serial ↔ MQTT relay daemon.
//!
//! # Modules
//!
//! - [`config`] – layered [`BridgeConfig`](config::BridgeConfig): defaults,
//!   `~/.seriallink/config.toml`, `SERIALLINK_*` environment variables.
//! - [`daemon`] – [`BridgeDaemon`](daemon::BridgeDaemon), the relay itself.
//! - [`telemetry`] – `tracing` subscriber and optional OTLP export.

pub mod config;
pub mod daemon;
pub mod telemetry;

pub use config::BridgeConfig;
pub use daemon::{BridgeDaemon, BridgeSettings, StatsSnapshot};
