//! `seriallink-middleware` – serial-port semantics over publish/subscribe.
//!
//! Moves opaque byte payloads between a topic pair and presents them to
//! protocol code as an ordered, timeout-bounded byte stream.
//!
//! # Modules
//!
//! - [`link`] – the [`PubSubLink`] seam every broker client implements, and
//!   the [`LinkHandler`] callbacks it drives from its delivery thread.
//! - [`bus`] – in-process broker ([`LocalBus`]) for tests and loopback use.
//! - [`mqtt`] – [`MqttLink`], the production client built on `rumqttc`.
//! - [`transport`] – [`SerialTransport`], the serial-port-shaped adapter.

pub mod bus;
pub mod link;
pub mod mqtt;
pub mod transport;

pub use bus::{LocalBus, LocalLink, TopicReceiver};
pub use link::{LinkHandler, PubSubLink, Publisher};
pub use mqtt::{MqttLink, MqttLinkOptions};
pub use transport::{SerialTransport, TransportConfig};
