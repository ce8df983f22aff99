//! MQTT broker link built on `rumqttc`.
//!
//! [`MqttLink`] wraps the synchronous `rumqttc` client.  [`PubSubLink::start`]
//! moves the client's [`Connection`] onto a dedicated delivery thread that
//! iterates its event stream and translates broker packets into
//! [`LinkHandler`] callbacks:
//!
//! | Packet / event | Callback |
//! |---|---|
//! | `CONNACK` success | `on_connect(Ok)` |
//! | `CONNACK` refusal, or network error before the first `CONNACK` | `on_connect(Err)` |
//! | `SUBACK` | `on_subscribe` |
//! | `PUBLISH` | `on_message` |
//! | network error after a `CONNACK` | `on_disconnect` |
//!
//! Reconnection is left to `rumqttc`: polling the event stream again after an
//! error starts a fresh connection attempt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use rumqttc::{
    Client, ConnectReturnCode, Connection, ConnectionError, Event, MqttOptions, Outgoing, Packet,
    SubscribeReasonCode,
};
use seriallink_types::{BrokerAddr, LinkError, QoS};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::link::{LinkHandler, PubSubLink, Publisher};

/// Pause between reconnection attempts after a network error.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Tunables for an [`MqttLink`].
#[derive(Debug, Clone)]
pub struct MqttLinkOptions {
    /// Client identifier; a random `seriallink-…` id when `None`.
    pub client_id: Option<String>,
    /// MQTT keep-alive interval.
    pub keep_alive: Duration,
    /// Capacity of the request queue between callers and the event loop.
    pub request_capacity: usize,
}

impl Default for MqttLinkOptions {
    fn default() -> Self {
        Self {
            client_id: None,
            keep_alive: Duration::from_secs(60),
            request_capacity: 256,
        }
    }
}

fn to_rumqttc(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

fn random_client_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("seriallink-{}", &id[..12])
}

#[derive(Clone)]
struct MqttPublisher {
    client: Client,
}

impl Publisher for MqttPublisher {
    fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<(), LinkError> {
        self.client
            .try_publish(topic, to_rumqttc(qos), false, payload.to_vec())
            .map_err(|e| LinkError::TransientIo {
                component: format!("mqtt publish '{topic}'"),
                details: e.to_string(),
            })
    }

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), LinkError> {
        self.client
            .try_subscribe(topic, to_rumqttc(qos))
            .map_err(|e| LinkError::TransientIo {
                component: format!("mqtt subscribe '{topic}'"),
                details: e.to_string(),
            })
    }
}

/// A connection to an MQTT broker.
pub struct MqttLink {
    broker: BrokerAddr,
    publisher: MqttPublisher,
    connection: Mutex<Option<Connection>>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MqttLink {
    /// Prepare a link to `broker`.  Nothing touches the network until
    /// [`PubSubLink::start`].
    pub fn new(broker: &BrokerAddr, options: MqttLinkOptions) -> Self {
        let client_id = options.client_id.unwrap_or_else(random_client_id);
        let mut mqtt_options = MqttOptions::new(client_id, broker.host.clone(), broker.port);
        mqtt_options.set_keep_alive(options.keep_alive);
        mqtt_options.set_clean_session(true);
        let (client, connection) = Client::new(mqtt_options, options.request_capacity);
        Self {
            broker: broker.clone(),
            publisher: MqttPublisher { client },
            connection: Mutex::new(Some(connection)),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    pub fn broker(&self) -> &BrokerAddr {
        &self.broker
    }
}

impl Publisher for MqttLink {
    fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<(), LinkError> {
        self.publisher.publish(topic, qos, payload)
    }

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), LinkError> {
        self.publisher.subscribe(topic, qos)
    }
}

impl PubSubLink for MqttLink {
    fn start(&self, handler: Arc<dyn LinkHandler>) -> Result<(), LinkError> {
        let connection = self
            .connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(connection) = connection else {
            return Err(LinkError::Config(format!(
                "mqtt link to {} already started",
                self.broker
            )));
        };

        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let publisher = self.publisher.clone();
        let broker = self.broker.clone();
        let handle = std::thread::Builder::new()
            .name("seriallink-mqtt-delivery".to_string())
            .spawn(move || delivery_loop(connection, publisher, handler, running, broker))
            .map_err(|e| LinkError::ConnectionFailure(format!("spawn delivery thread: {e}")))?;

        *self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
        info!(broker = %self.broker, "mqtt delivery loop started");
        Ok(())
    }

    fn stop(&self) -> Result<(), LinkError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.publisher.client.try_disconnect() {
            debug!(error = %e, "mqtt disconnect request not queued");
        }
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("mqtt delivery thread panicked");
            }
        }
        info!(broker = %self.broker, "mqtt link stopped");
        Ok(())
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// What the delivery loop does after one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    /// Network error; pause before `rumqttc` tries again.
    Backoff,
    /// Our own DISCONNECT went out.
    Stop,
}

fn delivery_loop(
    mut connection: Connection,
    publisher: MqttPublisher,
    handler: Arc<dyn LinkHandler>,
    running: Arc<AtomicBool>,
    broker: BrokerAddr,
) {
    let mut connected = false;
    for notification in connection.iter() {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        match dispatch(notification, &mut connected, &publisher, handler.as_ref(), &broker) {
            Step::Continue => {}
            Step::Backoff => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                std::thread::sleep(RECONNECT_DELAY);
            }
            Step::Stop => break,
        }
    }
    debug!(broker = %broker, "mqtt delivery loop exited");
}

/// Translate one event-loop notification into handler callbacks.
///
/// `connected` tracks whether a CONNACK has been seen since the last network
/// error; it decides whether an error is a failed connect or a dropped link.
fn dispatch(
    notification: Result<Event, ConnectionError>,
    connected: &mut bool,
    publisher: &dyn Publisher,
    handler: &dyn LinkHandler,
    broker: &BrokerAddr,
) -> Step {
    match notification {
        Ok(Event::Incoming(Packet::ConnAck(ack))) => {
            if ack.code == ConnectReturnCode::Success {
                *connected = true;
                info!(broker = %broker, "connected to mqtt broker");
                handler.on_connect(publisher, Ok(()));
            } else {
                handler.on_connect(
                    publisher,
                    Err(LinkError::ConnectionFailure(format!(
                        "broker {broker} refused connection: {:?}",
                        ack.code
                    ))),
                );
            }
            Step::Continue
        }
        Ok(Event::Incoming(Packet::SubAck(ack))) => {
            let granted = ack
                .return_codes
                .iter()
                .all(|code| !matches!(code, SubscribeReasonCode::Failure));
            handler.on_subscribe(granted);
            Step::Continue
        }
        Ok(Event::Incoming(Packet::Publish(publish))) => {
            handler.on_message(&publish.topic, publish.payload);
            Step::Continue
        }
        Ok(Event::Incoming(Packet::Disconnect)) => {
            *connected = false;
            handler.on_disconnect("broker sent DISCONNECT");
            Step::Continue
        }
        Ok(Event::Outgoing(Outgoing::Disconnect)) => Step::Stop,
        Ok(_) => Step::Continue,
        Err(e) => {
            if *connected {
                *connected = false;
                warn!(broker = %broker, error = %e, "mqtt connection lost");
                handler.on_disconnect(&e.to_string());
            } else {
                let reason = match e {
                    ConnectionError::ConnectionRefused(code) => {
                        format!("broker {broker} refused connection: {code:?}")
                    }
                    other => format!("cannot reach broker {broker}: {other}"),
                };
                error!(reason = %reason, "mqtt connect failed");
                handler.on_connect(publisher, Err(LinkError::ConnectionFailure(reason)));
            }
            Step::Backoff
        }
    }
}
