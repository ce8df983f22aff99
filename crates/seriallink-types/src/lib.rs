use std::fmt;
use std::str::FromStr;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default TCP port of an MQTT broker.
pub const DEFAULT_BROKER_PORT: u16 = 1883;

/// Delivery quality requested for a publish or subscription.
///
/// Mirrors the three MQTT QoS levels; the transport defaults to
/// [`QoS::AtLeastOnce`] so that a flaky link never loses a motor command
/// silently (duplicates are possible and are not filtered).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QoS {
    /// Fire-and-forget (QoS 0).
    AtMostOnce,
    /// Acknowledged delivery, may duplicate (QoS 1).
    #[default]
    AtLeastOnce,
    /// Four-way handshake delivery (QoS 2).
    ExactlyOnce,
}

impl FromStr for QoS {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "0" | "at-most-once" | "atmostonce" => Ok(QoS::AtMostOnce),
            "1" | "at-least-once" | "atleastonce" => Ok(QoS::AtLeastOnce),
            "2" | "exactly-once" | "exactlyonce" => Ok(QoS::ExactlyOnce),
            other => Err(LinkError::Config(format!("unknown QoS level '{other}'"))),
        }
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QoS::AtMostOnce => write!(f, "at-most-once"),
            QoS::AtLeastOnce => write!(f, "at-least-once"),
            QoS::ExactlyOnce => write!(f, "exactly-once"),
        }
    }
}

/// Lifecycle of a transport's broker connection.
///
/// `Subscribed` is only reached once the broker has acknowledged the
/// connection *and* granted the receive-topic subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Subscribed,
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Subscribed => "connected+subscribed",
            LinkState::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// A broker endpoint, parsed from `host` or `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerAddr {
    pub host: String,
    pub port: u16,
}

impl BrokerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for BrokerAddr {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(LinkError::Config("broker address is empty".to_string()));
        }
        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && !host.contains(':') => {
                let port = port.parse::<u16>().map_err(|e| {
                    LinkError::Config(format!("invalid broker port in '{s}': {e}"))
                })?;
                Ok(Self::new(host, port))
            }
            _ => Ok(Self::new(s, DEFAULT_BROKER_PORT)),
        }
    }
}

impl fmt::Display for BrokerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The accepted shapes of a `write` payload.
///
/// Every variant normalises to one immutable byte sequence via
/// [`WritePayload::into_bytes`].  Integer lists must hold values in
/// `0..=255`; anything else is rejected with
/// [`LinkError::UnsupportedPayloadType`] before anything is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePayload {
    /// An immutable byte sequence.
    Bytes(Bytes),
    /// A list of small integers, one per byte.
    Integers(Vec<i64>),
    /// A mutable byte buffer, frozen on normalisation.
    Buffer(BytesMut),
}

impl WritePayload {
    /// Normalise into the byte sequence that goes out as one message.
    pub fn into_bytes(self) -> Result<Bytes, LinkError> {
        match self {
            WritePayload::Bytes(b) => Ok(b),
            WritePayload::Buffer(buf) => Ok(buf.freeze()),
            WritePayload::Integers(values) => values
                .into_iter()
                .enumerate()
                .map(|(idx, v)| {
                    u8::try_from(v).map_err(|_| {
                        LinkError::UnsupportedPayloadType(format!(
                            "integer {v} at index {idx} is outside 0..=255"
                        ))
                    })
                })
                .collect::<Result<Vec<u8>, _>>()
                .map(Bytes::from),
        }
    }
}

impl From<Bytes> for WritePayload {
    fn from(b: Bytes) -> Self {
        WritePayload::Bytes(b)
    }
}

impl From<Vec<u8>> for WritePayload {
    fn from(v: Vec<u8>) -> Self {
        WritePayload::Bytes(Bytes::from(v))
    }
}

impl From<&[u8]> for WritePayload {
    fn from(v: &[u8]) -> Self {
        WritePayload::Bytes(Bytes::copy_from_slice(v))
    }
}

impl<const N: usize> From<&[u8; N]> for WritePayload {
    fn from(v: &[u8; N]) -> Self {
        WritePayload::Bytes(Bytes::copy_from_slice(v))
    }
}

impl From<Vec<i64>> for WritePayload {
    fn from(v: Vec<i64>) -> Self {
        WritePayload::Integers(v)
    }
}

impl From<BytesMut> for WritePayload {
    fn from(buf: BytesMut) -> Self {
        WritePayload::Buffer(buf)
    }
}

/// Conversion for callers holding dynamically typed values (scripts, JSON
/// control channels).  Only arrays of integers are writable.
impl TryFrom<&serde_json::Value> for WritePayload {
    type Error = LinkError;

    fn try_from(value: &serde_json::Value) -> Result<Self, Self::Error> {
        use serde_json::Value;

        let kind = match value {
            Value::Array(items) => {
                let ints = items
                    .iter()
                    .map(|item| {
                        item.as_i64().ok_or_else(|| {
                            LinkError::UnsupportedPayloadType(format!(
                                "array element {item} is not an integer"
                            ))
                        })
                    })
                    .collect::<Result<Vec<i64>, _>>()?;
                return Ok(WritePayload::Integers(ints));
            }
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Object(_) => "object",
        };
        Err(LinkError::UnsupportedPayloadType(format!(
            "cannot write a {kind} value; expected bytes or a list of integers"
        )))
    }
}

/// Error taxonomy shared by the transport, the HAL, and the bridge daemon.
#[derive(Error, Debug)]
pub enum LinkError {
    /// Broker unreachable or connection rejected.
    #[error("Connection Failure: {0}")]
    ConnectionFailure(String),

    /// Serial device missing, busy, or misconfigured.
    #[error("Device Open Failure on {device}: {details}")]
    DeviceOpenFailure { device: String, details: String },

    /// A `write` payload that cannot be normalised into bytes.
    #[error("Unsupported Payload Type: {0}")]
    UnsupportedPayloadType(String),

    /// One serial or publish operation failed; the session survives.
    #[error("Transient I/O Failure on {component}: {details}")]
    TransientIo { component: String, details: String },

    /// Invalid configuration value or file.
    #[error("Configuration Error: {0}")]
    Config(String),
}

impl LinkError {
    /// `true` for errors that only spoil a single operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, LinkError::TransientIo { .. })
    }
}

/// Render `bytes` as space-separated lowercase hex pairs for log lines,
/// e.g. `ff ff 01 02`.
pub fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}
