//! [`BridgeDaemon`] – relays bytes between a serial device and a topic pair.
//!
//! Two independent paths share one device:
//!
//! - **inbound** (broker → serial): every message on the inbound topic is
//!   written verbatim to the device from the link's delivery thread.
//! - **outbound** (serial → broker): [`BridgeDaemon::run`] polls the device;
//!   whatever one read returns goes out as exactly one message on the
//!   outbound topic.
//!
//! The daemon owns both resources.  Dropping it (or calling
//! [`BridgeDaemon::shutdown`]) stops the broker link first and then closes
//! the device, also when startup fails halfway.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{Sender, bounded};
use seriallink_hal::SerialDevice;
use seriallink_middleware::link::topic_matches;
use seriallink_middleware::{LinkHandler, PubSubLink, Publisher};
use seriallink_types::{LinkError, QoS, hex_dump};
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;

// ─────────────────────────────────────────────────────────────────────────────
// Settings & statistics
// ─────────────────────────────────────────────────────────────────────────────

/// Runtime knobs of a [`BridgeDaemon`].
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeSettings {
    pub inbound_topic: String,
    pub outbound_topic: String,
    pub qos: QoS,
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self::from(&BridgeConfig::default())
    }
}

impl From<&BridgeConfig> for BridgeSettings {
    fn from(cfg: &BridgeConfig) -> Self {
        Self {
            inbound_topic: cfg.inbound_topic.clone(),
            outbound_topic: cfg.outbound_topic.clone(),
            qos: cfg.qos,
            poll_interval: cfg.poll_interval(),
            connect_timeout: cfg.connect_timeout(),
        }
    }
}

#[derive(Default)]
struct BridgeStats {
    messages_to_serial: AtomicU64,
    bytes_to_serial: AtomicU64,
    serial_write_failures: AtomicU64,
    messages_to_broker: AtomicU64,
    bytes_to_broker: AtomicU64,
    publish_failures: AtomicU64,
    serial_read_failures: AtomicU64,
}

impl BridgeStats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_to_serial: self.messages_to_serial.load(Ordering::Relaxed),
            bytes_to_serial: self.bytes_to_serial.load(Ordering::Relaxed),
            serial_write_failures: self.serial_write_failures.load(Ordering::Relaxed),
            messages_to_broker: self.messages_to_broker.load(Ordering::Relaxed),
            bytes_to_broker: self.bytes_to_broker.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            serial_read_failures: self.serial_read_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time traffic counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub messages_to_serial: u64,
    pub bytes_to_serial: u64,
    pub serial_write_failures: u64,
    pub messages_to_broker: u64,
    pub bytes_to_broker: u64,
    pub publish_failures: u64,
    pub serial_read_failures: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound path
// ─────────────────────────────────────────────────────────────────────────────

/// Link handler that writes inbound messages to the device.
struct InboundWriter<D: SerialDevice> {
    device: Arc<Mutex<D>>,
    inbound_topic: String,
    qos: QoS,
    stats: Arc<BridgeStats>,
    connected: Sender<Result<(), LinkError>>,
}

impl<D: SerialDevice> LinkHandler for InboundWriter<D> {
    fn on_connect(&self, publisher: &dyn Publisher, outcome: Result<(), LinkError>) {
        let outcome = outcome.and_then(|()| publisher.subscribe(&self.inbound_topic, self.qos));
        match &outcome {
            Ok(()) => info!(topic = %self.inbound_topic, "connected; subscribing to inbound topic"),
            Err(e) => error!(error = %e, "broker connection failed"),
        }
        // Only startup listens; later reconnect outcomes are dropped.
        let _ = self.connected.try_send(outcome);
    }

    fn on_subscribe(&self, granted: bool) {
        if granted {
            debug!(topic = %self.inbound_topic, "inbound subscription granted");
        } else {
            error!(topic = %self.inbound_topic, "broker rejected inbound subscription");
        }
    }

    fn on_message(&self, topic: &str, payload: Bytes) {
        if !topic_matches(&self.inbound_topic, topic) {
            return;
        }
        debug!(bytes = payload.len(), hex = %hex_dump(&payload), "broker -> serial");
        let result = lock(&self.device).write_all(&payload);
        match result {
            Ok(()) => {
                self.stats.messages_to_serial.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .bytes_to_serial
                    .fetch_add(payload.len() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.serial_write_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, bytes = payload.len(), "serial write failed; message dropped");
            }
        }
    }

    fn on_disconnect(&self, reason: &str) {
        warn!(reason = %reason, "broker connection dropped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Daemon
// ─────────────────────────────────────────────────────────────────────────────

/// A running serial ↔ broker bridge.
pub struct BridgeDaemon<D: SerialDevice + 'static> {
    device: Arc<Mutex<D>>,
    device_name: String,
    link: Box<dyn PubSubLink>,
    settings: BridgeSettings,
    stats: Arc<BridgeStats>,
    released: bool,
}

impl<D: SerialDevice + 'static> BridgeDaemon<D> {
    /// Take ownership of an open `device` and `link`, start the link and wait
    /// up to `settings.connect_timeout` for the broker to accept.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::ConnectionFailure`] when the broker refuses,
    /// cannot be reached, or does not answer in time.  Both resources are
    /// released before the error is returned.
    pub fn start(
        device: D,
        link: Box<dyn PubSubLink>,
        settings: BridgeSettings,
    ) -> Result<Self, LinkError> {
        let device_name = device.name().to_string();
        let device = Arc::new(Mutex::new(device));
        let stats = Arc::new(BridgeStats::default());
        let (connected_tx, connected_rx) = bounded(1);

        let handler = Arc::new(InboundWriter {
            device: Arc::clone(&device),
            inbound_topic: settings.inbound_topic.clone(),
            qos: settings.qos,
            stats: Arc::clone(&stats),
            connected: connected_tx,
        });

        let daemon = Self {
            device,
            device_name,
            link,
            settings,
            stats,
            released: false,
        };
        daemon.link.start(handler)?;

        match connected_rx.recv_timeout(daemon.settings.connect_timeout) {
            Ok(Ok(())) => {
                info!(
                    device = %daemon.device_name,
                    inbound = %daemon.settings.inbound_topic,
                    outbound = %daemon.settings.outbound_topic,
                    qos = %daemon.settings.qos,
                    "bridge online"
                );
                Ok(daemon)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(LinkError::ConnectionFailure(format!(
                "no answer from broker within {:?}",
                daemon.settings.connect_timeout
            ))),
        }
    }

    /// One pass of the outbound path: if the device has bytes waiting, read
    /// them and publish them as a single message.  Returns the number of
    /// bytes relayed.
    ///
    /// # Errors
    ///
    /// Propagates device failures ([`LinkError::TransientIo`]).  A failed
    /// publish is logged and counted, not returned.
    pub fn poll_once(&self) -> Result<usize, LinkError> {
        let chunk = {
            let mut device = lock(&self.device);
            let waiting = device.bytes_waiting()?;
            if waiting == 0 {
                return Ok(0);
            }
            device.read_available(waiting)?
        };
        if chunk.is_empty() {
            return Ok(0);
        }

        let len = chunk.len();
        debug!(bytes = len, hex = %hex_dump(&chunk), "serial -> broker");
        match self
            .link
            .publish(&self.settings.outbound_topic, self.settings.qos, Bytes::from(chunk))
        {
            Ok(()) => {
                self.stats.messages_to_broker.fetch_add(1, Ordering::Relaxed);
                self.stats.bytes_to_broker.fetch_add(len as u64, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, bytes = len, "publish failed; serial data dropped");
            }
        }
        Ok(len)
    }

    /// Poll the device until `shutdown` is set, sleeping
    /// `settings.poll_interval` between passes.
    ///
    /// Device errors are counted and logged once per failure streak; the loop
    /// keeps polling.
    pub fn run(&self, shutdown: &AtomicBool) {
        let mut failing = false;
        while !shutdown.load(Ordering::SeqCst) {
            match self.poll_once() {
                Ok(_) if failing => {
                    failing = false;
                    info!(device = %self.device_name, "serial reads recovered");
                }
                Ok(_) => {}
                Err(e) => {
                    self.stats.serial_read_failures.fetch_add(1, Ordering::Relaxed);
                    if !failing {
                        failing = true;
                        warn!(device = %self.device_name, error = %e, "serial read failed");
                    }
                }
            }
            std::thread::sleep(self.settings.poll_interval);
        }
        info!("shutdown requested; leaving poll loop");
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop the link, close the device and return the final counters.
    pub fn shutdown(mut self) -> StatsSnapshot {
        self.release();
        self.stats.snapshot()
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Err(e) = self.link.stop() {
            warn!(error = %e, "broker link did not stop cleanly");
        }
        if let Err(e) = lock(&self.device).close() {
            warn!(device = %self.device_name, error = %e, "serial device did not close cleanly");
        }

        let s = self.stats.snapshot();
        info!(
            to_serial = s.messages_to_serial,
            to_serial_bytes = s.bytes_to_serial,
            serial_write_failures = s.serial_write_failures,
            to_broker = s.messages_to_broker,
            to_broker_bytes = s.bytes_to_broker,
            publish_failures = s.publish_failures,
            serial_read_failures = s.serial_read_failures,
            "bridge stopped"
        );
    }
}

impl<D: SerialDevice + 'static> Drop for BridgeDaemon<D> {
    fn drop(&mut self) {
        self.release();
    }
}

fn lock<D>(device: &Mutex<D>) -> MutexGuard<'_, D> {
    device.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
