//! Bridge configuration – reads `~/.seriallink/config.toml`.
//!
//! Values are layered: built-in defaults, then the TOML file, then
//! `SERIALLINK_*` environment variables, then command-line flags (applied by
//! the binary).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use seriallink_types::{BrokerAddr, LinkError, QoS};
use tracing::warn;

/// Everything the bridge daemon needs to know at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Path of the serial device.
    #[serde(default = "default_serial_port")]
    pub serial_port: String,

    /// Line speed in baud.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Per-read timeout on the serial device, in milliseconds.
    #[serde(default = "default_serial_timeout_ms")]
    pub serial_timeout_ms: u64,

    /// MQTT broker host name or address.
    #[serde(default = "default_broker_host")]
    pub broker_host: String,

    #[serde(default = "default_broker_port")]
    pub broker_port: u16,

    /// MQTT keep-alive interval, in seconds.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// Topic whose messages are written to the serial device.
    #[serde(default = "default_inbound_topic")]
    pub inbound_topic: String,

    /// Topic that receives bytes read from the serial device.
    #[serde(default = "default_outbound_topic")]
    pub outbound_topic: String,

    #[serde(default)]
    pub qos: QoS,

    /// Sleep between serial polls, in microseconds.
    #[serde(default = "default_poll_interval_us")]
    pub poll_interval_us: u64,

    /// How long startup waits for the broker to accept the connection.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_serial_port() -> String {
    "/dev/ttyAMA0".to_string()
}
fn default_baud_rate() -> u32 {
    1_000_000
}
fn default_serial_timeout_ms() -> u64 {
    10
}
fn default_broker_host() -> String {
    "localhost".to_string()
}
fn default_broker_port() -> u16 {
    seriallink_types::DEFAULT_BROKER_PORT
}
fn default_keep_alive_secs() -> u64 {
    60
}
fn default_inbound_topic() -> String {
    "robot/tx".to_string()
}
fn default_outbound_topic() -> String {
    "robot/rx".to_string()
}
fn default_poll_interval_us() -> u64 {
    1_000
}
fn default_connect_timeout_secs() -> u64 {
    5
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            serial_port: default_serial_port(),
            baud_rate: default_baud_rate(),
            serial_timeout_ms: default_serial_timeout_ms(),
            broker_host: default_broker_host(),
            broker_port: default_broker_port(),
            keep_alive_secs: default_keep_alive_secs(),
            inbound_topic: default_inbound_topic(),
            outbound_topic: default_outbound_topic(),
            qos: QoS::default(),
            poll_interval_us: default_poll_interval_us(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl BridgeConfig {
    pub fn broker(&self) -> BrokerAddr {
        BrokerAddr::new(self.broker_host.clone(), self.broker_port)
    }

    /// Set host and port from a `host` or `host:port` string.
    pub fn set_broker(&mut self, spec: &str) -> Result<(), LinkError> {
        let addr: BrokerAddr = spec.parse()?;
        let explicit_port = spec
            .trim()
            .rsplit_once(':')
            .is_some_and(|(host, _)| !host.is_empty() && !host.contains(':'));
        self.broker_host = addr.host;
        if explicit_port {
            self.broker_port = addr.port;
        }
        Ok(())
    }

    pub fn serial_timeout(&self) -> Duration {
        Duration::from_millis(self.serial_timeout_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Reject settings the daemon cannot run with.
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.serial_port.trim().is_empty() {
            return Err(LinkError::Config("serial_port is empty".to_string()));
        }
        if self.baud_rate == 0 {
            return Err(LinkError::Config("baud_rate must be positive".to_string()));
        }
        if self.broker_host.trim().is_empty() {
            return Err(LinkError::Config("broker_host is empty".to_string()));
        }
        if self.inbound_topic.is_empty() || self.outbound_topic.is_empty() {
            return Err(LinkError::Config("topics must not be empty".to_string()));
        }
        // Equal topics would feed every serial read straight back to the port.
        if self.inbound_topic == self.outbound_topic {
            return Err(LinkError::Config(format!(
                "inbound and outbound topic are both '{}'",
                self.inbound_topic
            )));
        }
        Ok(())
    }
}

/// Return the path to `~/.seriallink/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".seriallink").join("config.toml")
}

/// Load the default config file.  Returns `None` if it does not exist.
pub fn load() -> Result<Option<BridgeConfig>, LinkError> {
    load_from(&config_path())
}

/// Load a config file.  Returns `None` if it does not exist; fields missing
/// from the file keep their defaults.
pub fn load_from(path: &Path) -> Result<Option<BridgeConfig>, LinkError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        LinkError::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;
    let cfg: BridgeConfig = toml::from_str(&raw).map_err(|e| {
        LinkError::Config(format!("failed to parse config at {}: {e}", path.display()))
    })?;
    Ok(Some(cfg))
}

/// Apply `SERIALLINK_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `SERIALLINK_SERIAL_PORT` | `serial_port` |
/// | `SERIALLINK_BAUD` | `baud_rate` |
/// | `SERIALLINK_BROKER` | `broker_host` (and `broker_port` when given as `host:port`) |
/// | `SERIALLINK_BROKER_PORT` | `broker_port` |
/// | `SERIALLINK_QOS` | `qos` |
///
/// Unparsable values are logged at `warn` and leave the field unchanged.
pub fn apply_env_overrides(cfg: &mut BridgeConfig) {
    if let Ok(v) = std::env::var("SERIALLINK_SERIAL_PORT") {
        cfg.serial_port = v;
    }
    if let Ok(v) = std::env::var("SERIALLINK_BAUD") {
        match v.parse::<u32>() {
            Ok(baud) => cfg.baud_rate = baud,
            Err(e) => warn!(value = %v, error = %e, "ignoring SERIALLINK_BAUD"),
        }
    }
    if let Ok(v) = std::env::var("SERIALLINK_BROKER")
        && let Err(e) = cfg.set_broker(&v)
    {
        warn!(value = %v, error = %e, "ignoring SERIALLINK_BROKER");
    }
    if let Ok(v) = std::env::var("SERIALLINK_BROKER_PORT") {
        match v.parse::<u16>() {
            Ok(port) => cfg.broker_port = port,
            Err(e) => warn!(value = %v, error = %e, "ignoring SERIALLINK_BROKER_PORT"),
        }
    }
    if let Ok(v) = std::env::var("SERIALLINK_QOS") {
        match v.parse::<QoS>() {
            Ok(qos) => cfg.qos = qos,
            Err(e) => warn!(value = %v, error = %e, "ignoring SERIALLINK_QOS"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_motor_bus_setup() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.serial_port, "/dev/ttyAMA0");
        assert_eq!(cfg.baud_rate, 1_000_000);
        assert_eq!(cfg.serial_timeout(), Duration::from_millis(10));
        assert_eq!(cfg.broker(), BrokerAddr::new("localhost", 1883));
        assert_eq!(cfg.inbound_topic, "robot/tx");
        assert_eq!(cfg.outbound_topic, "robot/rx");
        assert_eq!(cfg.qos, QoS::AtLeastOnce);
        assert_eq!(cfg.poll_interval(), Duration::from_micros(1_000));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn config_path_points_to_seriallink_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".seriallink"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("bridge.toml");
        std::fs::write(
            &path,
            "serial_port = \"/dev/ttyUSB0\"\nbroker_host = \"10.0.0.7\"\nqos = \"at-most-once\"\n",
        )
        .expect("write");

        let cfg = load_from(&path).expect("load ok").expect("some");
        assert_eq!(cfg.serial_port, "/dev/ttyUSB0");
        assert_eq!(cfg.broker_host, "10.0.0.7");
        assert_eq!(cfg.qos, QoS::AtMostOnce);
        assert_eq!(cfg.baud_rate, 1_000_000);
        assert_eq!(cfg.inbound_topic, "robot/tx");
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("bridge.toml");
        std::fs::write(&path, "baud_rate = \"fast\"\n").expect("write");
        assert!(matches!(load_from(&path), Err(LinkError::Config(_))));
    }

    #[test]
    fn toml_roundtrip_preserves_every_field() {
        let mut cfg = BridgeConfig::default();
        cfg.outbound_topic = "arm/rx".to_string();
        cfg.qos = QoS::ExactlyOnce;
        let raw = toml::to_string_pretty(&cfg).expect("serialize");
        let back: BridgeConfig = toml::from_str(&raw).expect("parse");
        assert_eq!(back, cfg);
    }

    #[test]
    fn set_broker_keeps_port_unless_given() {
        let mut cfg = BridgeConfig::default();
        cfg.broker_port = 8883;
        cfg.set_broker("broker.lan").unwrap();
        assert_eq!(cfg.broker(), BrokerAddr::new("broker.lan", 8883));
        cfg.set_broker("10.0.0.2:1884").unwrap();
        assert_eq!(cfg.broker(), BrokerAddr::new("10.0.0.2", 1884));
        assert!(cfg.set_broker("").is_err());
    }

    #[test]
    fn validate_rejects_looping_topics() {
        let mut cfg = BridgeConfig::default();
        cfg.outbound_topic = cfg.inbound_topic.clone();
        assert!(matches!(cfg.validate(), Err(LinkError::Config(_))));
    }

    #[test]
    fn validate_rejects_zero_baud() {
        let mut cfg = BridgeConfig::default();
        cfg.baud_rate = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn apply_env_overrides_changes_serial_port() {
        // SAFETY: each env test in this module owns a distinct variable.
        unsafe { std::env::set_var("SERIALLINK_SERIAL_PORT", "/dev/ttyS3") };
        let mut cfg = BridgeConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.serial_port, "/dev/ttyS3");
        unsafe { std::env::remove_var("SERIALLINK_SERIAL_PORT") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_baud() {
        // SAFETY: each env test in this module owns a distinct variable.
        unsafe { std::env::set_var("SERIALLINK_BAUD", "fast") };
        let mut cfg = BridgeConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.baud_rate, 1_000_000);
        unsafe { std::env::remove_var("SERIALLINK_BAUD") };
    }

    #[test]
    fn apply_env_overrides_changes_broker_host_unless_malformed() {
        // SAFETY: each env test in this module owns a distinct variable.
        unsafe { std::env::set_var("SERIALLINK_BROKER", "broker.lan:notaport") };
        let mut cfg = BridgeConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.broker(), BrokerAddr::new("localhost", 1883));

        unsafe { std::env::set_var("SERIALLINK_BROKER", "192.168.0.209") };
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.broker_host, "192.168.0.209");
        unsafe { std::env::remove_var("SERIALLINK_BROKER") };
    }

    #[test]
    fn apply_env_overrides_changes_qos() {
        // SAFETY: each env test in this module owns a distinct variable.
        unsafe { std::env::set_var("SERIALLINK_QOS", "0") };
        let mut cfg = BridgeConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.qos, QoS::AtMostOnce);
        unsafe { std::env::remove_var("SERIALLINK_QOS") };
    }
}
