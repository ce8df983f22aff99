//! The pub/sub link seam.
//!
//! Neither the transport nor the bridge daemon speaks to a broker directly.
//! They own a [`PubSubLink`] and hand it a [`LinkHandler`]; the link runs its
//! own background delivery loop and calls the handler from there.
//!
//! # Overview
//!
//! - [`Publisher`] – the operations a handler may call back into while it is
//!   being driven (publish, subscribe).
//! - [`PubSubLink`] – a [`Publisher`] that can also start and stop its
//!   delivery loop.
//! - [`MqttLink`][crate::mqtt::MqttLink] – a real MQTT broker connection.
//! - [`LocalLink`][crate::bus::LocalLink] – an in-process link on a
//!   [`LocalBus`][crate::bus::LocalBus].

use std::sync::Arc;

use bytes::Bytes;
use seriallink_types::{LinkError, QoS};

/// Outbound operations of a broker connection.
///
/// Both calls are fire-and-forget: they queue the request and return without
/// waiting for the broker.
pub trait Publisher: Send + Sync {
    /// Publish `payload` as a single message on `topic`.
    fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<(), LinkError>;

    /// Request a subscription to `topic`.  The outcome arrives later through
    /// [`LinkHandler::on_subscribe`].
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), LinkError>;
}

/// Callbacks invoked from a link's delivery thread.
///
/// Handlers must return quickly; the delivery loop is blocked while they run.
pub trait LinkHandler: Send + Sync {
    /// The broker accepted (`Ok`) or refused / could not be reached (`Err`).
    /// `publisher` is the link itself, for subscribing on success.
    fn on_connect(&self, publisher: &dyn Publisher, outcome: Result<(), LinkError>);

    /// A subscription request was granted or rejected.
    fn on_subscribe(&self, _granted: bool) {}

    /// A message arrived on a subscribed topic.
    fn on_message(&self, topic: &str, payload: Bytes);

    /// An established connection dropped.
    fn on_disconnect(&self, _reason: &str) {}
}

/// A broker connection with its own background delivery loop.
pub trait PubSubLink: Publisher {
    /// Spawn the delivery loop, which drives `handler` until [`stop`].
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Config`] if the link was already started.
    /// Broker reachability is *not* reported here; it arrives through
    /// [`LinkHandler::on_connect`].
    ///
    /// [`stop`]: PubSubLink::stop
    fn start(&self, handler: Arc<dyn LinkHandler>) -> Result<(), LinkError>;

    /// Stop the delivery loop and disconnect.  Safe to call repeatedly.
    fn stop(&self) -> Result<(), LinkError>;
}

/// MQTT topic filter matching with `+` (one level) and `#` (remaining
/// levels) wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
