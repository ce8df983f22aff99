//! In-process publish/subscribe broker.
//!
//! [`LocalBus`] routes byte payloads between [`LocalLink`]s and test taps
//! without a network.  Each link owns one unbounded inbox, drained in order
//! by its delivery thread, so messages on one topic arrive in publish order
//! and are never dropped for slow consumers.
//!
//! Delivery follows the MQTT shape: a link's connection result and
//! subscription grants travel through the same inbox as its messages, so a
//! handler observes `on_connect → on_subscribe → on_message` in order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use seriallink_types::{LinkError, QoS};
use tracing::{debug, warn};

use crate::link::{LinkHandler, PubSubLink, Publisher, topic_matches};

enum Delivery {
    ConnAck(bool),
    SubAck(bool),
    Message { topic: String, payload: Bytes },
    Shutdown,
}

struct Route {
    filter: String,
    inbox: Sender<Delivery>,
}

struct BusInner {
    routes: Mutex<Vec<Route>>,
    online: AtomicBool,
}

/// Shared in-process broker.  Clone it cheaply – all clones share the same
/// routing table.
#[derive(Clone)]
pub struct LocalBus {
    inner: Arc<BusInner>,
}

impl LocalBus {
    /// Create an empty, reachable broker.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                routes: Mutex::new(Vec::new()),
                online: AtomicBool::new(true),
            }),
        }
    }

    /// Simulate the broker becoming (un)reachable.  Links started while
    /// offline report a connection failure; publishes are refused.
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Create a new client link attached to this broker.
    pub fn link(&self) -> LocalLink {
        let (inbox_tx, inbox_rx) = channel::unbounded();
        LocalLink {
            publisher: LocalPublisher {
                bus: self.clone(),
                inbox: inbox_tx,
            },
            inbox: inbox_rx,
            worker: Mutex::new(None),
        }
    }

    /// Publish `payload` on `topic` from outside any link.
    ///
    /// Returns the number of subscriptions the message was routed to; `0` is
    /// a normal condition, not an error.
    pub fn publish_to(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        let payload = payload.into();
        let mut delivered = 0;
        self.routes().retain(|route| {
            if !topic_matches(&route.filter, topic) {
                return true;
            }
            // A closed inbox belongs to a dropped link or tap; prune it.
            let sent = route
                .inbox
                .send(Delivery::Message {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                })
                .is_ok();
            if sent {
                delivered += 1;
            }
            sent
        });
        delivered
    }

    /// Observe every message published on topics matching `filter`.
    pub fn subscribe_to(&self, filter: &str) -> TopicReceiver {
        let (tx, rx) = channel::unbounded();
        self.add_route(filter, tx);
        TopicReceiver {
            filter: filter.to_string(),
            receiver: rx,
        }
    }

    fn add_route(&self, filter: &str, inbox: Sender<Delivery>) {
        self.routes().push(Route {
            filter: filter.to_string(),
            inbox,
        });
    }

    fn remove_routes(&self, inbox: &Sender<Delivery>) {
        self.routes().retain(|route| !route.inbox.same_channel(inbox));
    }

    fn routes(&self) -> MutexGuard<'_, Vec<Route>> {
        self.inner
            .routes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test tap
// ─────────────────────────────────────────────────────────────────────────────

/// A tap receiving raw messages for one topic filter.
///
/// Obtained via [`LocalBus::subscribe_to`].
pub struct TopicReceiver {
    filter: String,
    receiver: Receiver<Delivery>,
}

impl TopicReceiver {
    /// Wait up to `timeout` for the next message.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<(String, Bytes)> {
        match self.receiver.recv_timeout(timeout) {
            Ok(Delivery::Message { topic, payload }) => Some((topic, payload)),
            _ => None,
        }
    }

    /// Take the next message if one is already queued.
    pub fn try_recv(&self) -> Option<(String, Bytes)> {
        match self.receiver.try_recv() {
            Ok(Delivery::Message { topic, payload }) => Some((topic, payload)),
            _ => None,
        }
    }

    /// The filter this tap is bound to.
    pub fn filter(&self) -> &str {
        &self.filter
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Link
// ─────────────────────────────────────────────────────────────────────────────

struct LocalPublisher {
    bus: LocalBus,
    inbox: Sender<Delivery>,
}

impl Publisher for LocalPublisher {
    fn publish(&self, topic: &str, _qos: QoS, payload: Bytes) -> Result<(), LinkError> {
        if !self.bus.is_online() {
            return Err(LinkError::ConnectionFailure(format!(
                "local bus offline; dropped publish on '{topic}'"
            )));
        }
        let routed = self.bus.publish_to(topic, payload);
        debug!(topic = %topic, routed, "local publish");
        Ok(())
    }

    fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), LinkError> {
        let granted = self.bus.is_online();
        if granted {
            self.bus.add_route(topic, self.inbox.clone());
        }
        let _ = self.inbox.send(Delivery::SubAck(granted));
        Ok(())
    }
}

/// A client link on a [`LocalBus`], with its own delivery thread.
pub struct LocalLink {
    publisher: LocalPublisher,
    inbox: Receiver<Delivery>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Publisher for LocalLink {
    fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<(), LinkError> {
        self.publisher.publish(topic, qos, payload)
    }

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), LinkError> {
        self.publisher.subscribe(topic, qos)
    }
}

impl PubSubLink for LocalLink {
    fn start(&self, handler: Arc<dyn LinkHandler>) -> Result<(), LinkError> {
        let mut worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if worker.is_some() {
            return Err(LinkError::Config("local link already started".to_string()));
        }

        let _ = self
            .publisher
            .inbox
            .send(Delivery::ConnAck(self.publisher.bus.is_online()));

        let inbox = self.inbox.clone();
        let publisher = LocalPublisher {
            bus: self.publisher.bus.clone(),
            inbox: self.publisher.inbox.clone(),
        };
        let handle = std::thread::Builder::new()
            .name("seriallink-local-delivery".to_string())
            .spawn(move || {
                while let Ok(delivery) = inbox.recv() {
                    match delivery {
                        Delivery::ConnAck(true) => handler.on_connect(&publisher, Ok(())),
                        Delivery::ConnAck(false) => handler.on_connect(
                            &publisher,
                            Err(LinkError::ConnectionFailure(
                                "local bus is offline".to_string(),
                            )),
                        ),
                        Delivery::SubAck(granted) => handler.on_subscribe(granted),
                        Delivery::Message { topic, payload } => {
                            handler.on_message(&topic, payload)
                        }
                        Delivery::Shutdown => {
                            handler.on_disconnect("client requested disconnect");
                            break;
                        }
                    }
                }
            })
            .map_err(|e| LinkError::ConnectionFailure(format!("spawn delivery thread: {e}")))?;
        *worker = Some(handle);
        Ok(())
    }

    fn stop(&self) -> Result<(), LinkError> {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(handle) = handle else {
            return Ok(());
        };
        let _ = self.publisher.inbox.send(Delivery::Shutdown);
        if handle.join().is_err() {
            warn!("local delivery thread panicked");
        }
        self.publisher.bus.remove_routes(&self.publisher.inbox);
        Ok(())
    }
}

impl Drop for LocalLink {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(2);

    /// Handler that subscribes on connect and records everything it sees.
    struct Recorder {
        topic: String,
        events: Mutex<Vec<String>>,
        messages: crossbeam::channel::Sender<(String, Bytes)>,
    }

    impl LinkHandler for Recorder {
        fn on_connect(&self, publisher: &dyn Publisher, outcome: Result<(), LinkError>) {
            let ok = outcome.is_ok();
            self.events.lock().unwrap().push(format!("connect:{ok}"));
            if ok {
                publisher.subscribe(&self.topic, QoS::AtLeastOnce).unwrap();
            }
        }

        fn on_subscribe(&self, granted: bool) {
            self.events.lock().unwrap().push(format!("subscribe:{granted}"));
        }

        fn on_message(&self, topic: &str, payload: Bytes) {
            self.messages.send((topic.to_string(), payload)).unwrap();
        }

        fn on_disconnect(&self, _reason: &str) {
            self.events.lock().unwrap().push("disconnect".to_string());
        }
    }

    fn recorder(topic: &str) -> (Arc<Recorder>, crossbeam::channel::Receiver<(String, Bytes)>) {
        let (tx, rx) = crossbeam::channel::unbounded();
        let rec = Arc::new(Recorder {
            topic: topic.to_string(),
            events: Mutex::new(Vec::new()),
            messages: tx,
        });
        (rec, rx)
    }

    #[test]
    fn link_receives_messages_in_publish_order() {
        let bus = LocalBus::new();
        let link = bus.link();
        let (rec, rx) = recorder("robot/rx");
        link.start(rec.clone()).unwrap();

        // Wait for the subscription to be granted before publishing.
        let deadline = std::time::Instant::now() + WAIT;
        while !rec.events.lock().unwrap().contains(&"subscribe:true".to_string()) {
            assert!(std::time::Instant::now() < deadline, "subscription never granted");
            std::thread::sleep(Duration::from_millis(1));
        }

        for i in 0..20u8 {
            bus.publish_to("robot/rx", vec![i]);
        }
        for i in 0..20u8 {
            let (topic, payload) = rx.recv_timeout(WAIT).unwrap();
            assert_eq!(topic, "robot/rx");
            assert_eq!(&payload[..], &[i]);
        }
        link.stop().unwrap();
    }

    #[test]
    fn tap_sees_link_publishes_and_not_other_topics() {
        let bus = LocalBus::new();
        let tap = bus.subscribe_to("robot/tx");
        let link = bus.link();

        link.publish("robot/tx", QoS::AtMostOnce, Bytes::from_static(b"\x01\x02"))
            .unwrap();
        link.publish("robot/other", QoS::AtMostOnce, Bytes::from_static(b"\x03"))
            .unwrap();

        let (topic, payload) = tap.recv_timeout(WAIT).unwrap();
        assert_eq!(topic, "robot/tx");
        assert_eq!(&payload[..], b"\x01\x02");
        assert!(tap.try_recv().is_none());
        assert_eq!(tap.filter(), "robot/tx");
    }

    #[test]
    fn offline_bus_reports_connection_failure_through_handler() {
        let bus = LocalBus::new();
        bus.set_online(false);
        let link = bus.link();
        let (rec, _rx) = recorder("robot/rx");

        // start() itself succeeds; the failure arrives asynchronously.
        link.start(rec.clone()).unwrap();
        let deadline = std::time::Instant::now() + WAIT;
        while rec.events.lock().unwrap().is_empty() {
            assert!(std::time::Instant::now() < deadline, "no connect callback");
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(rec.events.lock().unwrap()[0], "connect:false");
        assert!(link.publish("robot/tx", QoS::AtMostOnce, Bytes::new()).is_err());
    }

    #[test]
    fn starting_twice_is_rejected_and_stop_is_idempotent() {
        let bus = LocalBus::new();
        let link = bus.link();
        let (rec, _rx) = recorder("robot/rx");
        link.start(rec.clone()).unwrap();
        assert!(matches!(link.start(rec.clone()), Err(LinkError::Config(_))));

        link.stop().unwrap();
        link.stop().unwrap();
        assert!(rec.events.lock().unwrap().contains(&"disconnect".to_string()));
    }

    #[test]
    fn stopped_link_no_longer_receives() {
        let bus = LocalBus::new();
        let link = bus.link();
        let (rec, _rx) = recorder("robot/rx");
        link.start(rec).unwrap();
        link.stop().unwrap();
        assert_eq!(bus.publish_to("robot/rx", Bytes::from_static(b"x")), 0);
    }
}
