//! Serial-port semantics over a publish/subscribe topic pair.
//!
//! [`SerialTransport`] lets protocol code written against a UART (blocking
//! `write`, timeout-bounded `read(n)`, an `in_waiting` query) run unchanged
//! over a broker:
//!
//! * **Transmit** – every `write` publishes exactly one message on the
//!   transmit topic and returns immediately.  There is no batching, no local
//!   echo, and no delivery confirmation, just like a physical serial line.
//!
//! * **Receive** – the link's delivery thread pushes each payload from the
//!   receive topic onto an unbounded queue.  `read(n)` drains that queue
//!   under a per-call deadline.  When one payload holds more bytes than the
//!   caller asked for, the surplus goes to a carry-over buffer that the next
//!   `read` serves first, so fixed-size header reads never lose or reorder
//!   bytes.
//!
//! Broker-level duplicates (possible at QoS 1) are passed through unchanged.

use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use crossbeam::channel::{self, Receiver, Sender};
use seriallink_types::{BrokerAddr, LinkError, LinkState, QoS, WritePayload, hex_dump};
use tracing::{debug, error, info, trace, warn};

use crate::link::{LinkHandler, PubSubLink, Publisher, topic_matches};
use crate::mqtt::{MqttLink, MqttLinkOptions};

/// Per-call read timeout used when none is configured.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Topic pair and timing for a [`SerialTransport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Topic every `write` publishes to.
    pub tx_topic: String,
    /// Topic whose payloads feed `read`.
    pub rx_topic: String,
    /// Upper bound on how long one `read` call waits.
    pub timeout: Duration,
    /// Delivery quality for publishes and the receive subscription.
    pub qos: QoS,
}

impl TransportConfig {
    pub fn new(tx_topic: impl Into<String>, rx_topic: impl Into<String>) -> Self {
        Self {
            tx_topic: tx_topic.into(),
            rx_topic: rx_topic.into(),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tx_topic: "robot/tx".to_string(),
            rx_topic: "robot/rx".to_string(),
            timeout: DEFAULT_READ_TIMEOUT,
            qos: QoS::default(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handler state shared with the delivery thread
// ─────────────────────────────────────────────────────────────────────────────

struct Shared {
    rx_topic: String,
    qos: QoS,
    inbox: Sender<Bytes>,
    state: Mutex<LinkState>,
    state_changed: Condvar,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> LinkState {
        *self.lock_state()
    }

    /// Move to `next`.  `Closed` is terminal.
    fn set_state(&self, next: LinkState) {
        let mut state = self.lock_state();
        if *state == LinkState::Closed || *state == next {
            return;
        }
        let from = *state;
        debug!(from = %from, to = %next, "transport state change");
        *state = next;
        self.state_changed.notify_all();
    }
}

impl LinkHandler for Shared {
    fn on_connect(&self, publisher: &dyn Publisher, outcome: Result<(), LinkError>) {
        match outcome {
            Ok(()) => {
                self.set_state(LinkState::Connecting);
                // Renewed on every CONNACK; a clean session keeps none.
                if let Err(e) = publisher.subscribe(&self.rx_topic, self.qos) {
                    error!(topic = %self.rx_topic, error = %e, "receive subscription not sent");
                }
            }
            Err(e) => {
                error!(error = %e, "transport connection failed");
                self.set_state(LinkState::Disconnected);
            }
        }
    }

    fn on_subscribe(&self, granted: bool) {
        if granted {
            info!(topic = %self.rx_topic, "transport subscribed");
            self.set_state(LinkState::Subscribed);
        } else {
            error!(topic = %self.rx_topic, "broker rejected receive subscription");
            self.set_state(LinkState::Disconnected);
        }
    }

    fn on_message(&self, topic: &str, payload: Bytes) {
        if !topic_matches(&self.rx_topic, topic) {
            debug!(topic = %topic, "ignoring message on foreign topic");
            return;
        }
        trace!(topic = %topic, bytes = payload.len(), "payload queued");
        // The receiver lives as long as the transport; a send error means the
        // transport is being torn down.
        let _ = self.inbox.send(payload);
    }

    fn on_disconnect(&self, reason: &str) {
        warn!(reason = %reason, "transport link dropped");
        self.set_state(LinkState::Disconnected);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SerialTransport
// ─────────────────────────────────────────────────────────────────────────────

/// A serial-port-shaped byte stream backed by a pub/sub topic pair.
///
/// Owns its link and both receive buffers.  Reads take `&mut self`, so the
/// queue has exactly one consumer; the link's delivery thread is the only
/// producer.
pub struct SerialTransport {
    link: Box<dyn PubSubLink>,
    shared: Arc<Shared>,
    inbox: Receiver<Bytes>,
    carry: BytesMut,
    tx_topic: String,
    qos: QoS,
    timeout: Duration,
}

impl SerialTransport {
    /// Attach a transport to `link` and start its delivery loop.
    ///
    /// Returns as soon as the loop is running.  Broker reachability is
    /// reported asynchronously (logged, and visible through [`state`]); use
    /// [`wait_ready`] to block until the receive subscription is live.
    ///
    /// # Errors
    ///
    /// Only when the link refuses to start (e.g. it was started before).
    ///
    /// [`state`]: SerialTransport::state
    /// [`wait_ready`]: SerialTransport::wait_ready
    pub fn open(link: Box<dyn PubSubLink>, config: TransportConfig) -> Result<Self, LinkError> {
        let (inbox_tx, inbox_rx) = channel::unbounded();
        let shared = Arc::new(Shared {
            rx_topic: config.rx_topic.clone(),
            qos: config.qos,
            inbox: inbox_tx,
            state: Mutex::new(LinkState::Disconnected),
            state_changed: Condvar::new(),
        });

        shared.set_state(LinkState::Connecting);
        link.start(Arc::clone(&shared) as Arc<dyn LinkHandler>)?;
        info!(
            tx_topic = %config.tx_topic,
            rx_topic = %config.rx_topic,
            timeout_ms = config.timeout.as_millis() as u64,
            "serial transport opened"
        );

        Ok(Self {
            link,
            shared,
            inbox: inbox_rx,
            carry: BytesMut::new(),
            tx_topic: config.tx_topic,
            qos: config.qos,
            timeout: config.timeout,
        })
    }

    /// Open a transport over an MQTT connection to `broker`.
    pub fn connect_mqtt(broker: &BrokerAddr, config: TransportConfig) -> Result<Self, LinkError> {
        let link = MqttLink::new(broker, MqttLinkOptions::default());
        Self::open(Box::new(link), config)
    }

    /// Publish `payload` as one message on the transmit topic.
    ///
    /// Returns the number of bytes handed to the link.  Delivery is not
    /// awaited; a publish the link cannot queue is logged and still counts as
    /// written, as bytes lost on a physical line would.
    ///
    /// # Errors
    ///
    /// [`LinkError::UnsupportedPayloadType`] when the payload cannot be
    /// normalised; nothing is published in that case.
    pub fn write(&self, payload: impl Into<WritePayload>) -> Result<usize, LinkError> {
        let bytes = payload.into().into_bytes()?;
        Ok(self.publish_bytes(bytes))
    }

    /// [`write`](SerialTransport::write) for dynamically typed callers.
    pub fn write_value(&self, value: &serde_json::Value) -> Result<usize, LinkError> {
        let payload = WritePayload::try_from(value)?;
        self.write(payload)
    }

    fn publish_bytes(&self, bytes: Bytes) -> usize {
        let len = bytes.len();
        trace!(topic = %self.tx_topic, bytes = len, hex = %hex_dump(&bytes), "publishing");
        if let Err(e) = self.link.publish(&self.tx_topic, self.qos, bytes) {
            warn!(topic = %self.tx_topic, error = %e, "publish failed; bytes dropped");
        }
        len
    }

    /// Read up to `n` bytes, waiting at most the configured timeout.
    ///
    /// Returns early once `n` bytes are available; otherwise returns whatever
    /// arrived before the deadline (possibly nothing).  Never returns more
    /// than `n` bytes.
    pub fn read(&mut self, n: usize) -> Vec<u8> {
        self.fill(n)
    }

    fn fill(&mut self, n: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(n);
        if n == 0 {
            return out;
        }

        let from_carry = n.min(self.carry.len());
        out.extend_from_slice(&self.carry.split_to(from_carry));

        let deadline = Instant::now() + self.timeout;
        while out.len() < n {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Ok(chunk) = self.inbox.recv_timeout(remaining) else {
                break;
            };
            let wanted = n - out.len();
            if chunk.len() > wanted {
                out.extend_from_slice(&chunk[..wanted]);
                self.carry.extend_from_slice(&chunk[wanted..]);
            } else {
                out.extend_from_slice(&chunk);
            }
        }
        out
    }

    /// Best-effort count of readable bytes: exact for the carry-over buffer,
    /// one per queued message otherwise.
    pub fn in_waiting(&self) -> usize {
        self.carry.len() + self.inbox.len()
    }

    /// No-op: writes are never buffered locally.
    pub fn flush(&self) {}

    /// Discard the carry-over buffer and every queued message.
    pub fn reset_input_buffer(&mut self) {
        let mut dropped = self.carry.len();
        self.carry.clear();
        while let Ok(chunk) = self.inbox.try_recv() {
            dropped += chunk.len();
        }
        debug!(bytes = dropped, "input buffer reset");
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Current connection state.
    pub fn state(&self) -> LinkState {
        self.shared.state()
    }

    /// Block until the receive subscription is live, the transport is
    /// closed, or `timeout` elapses.  Returns `true` when subscribed.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        let state = self.shared.lock_state();
        let (state, _) = self
            .shared
            .state_changed
            .wait_timeout_while(state, timeout, |s| {
                *s != LinkState::Subscribed && *s != LinkState::Closed
            })
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *state == LinkState::Subscribed
    }

    /// Stop the delivery loop and disconnect.  Calling it again is a no-op.
    pub fn close(&mut self) {
        if self.shared.state() == LinkState::Closed {
            return;
        }
        self.shared.set_state(LinkState::Closed);
        if let Err(e) = self.link.stop() {
            warn!(error = %e, "error while stopping transport link");
        }
        info!(tx_topic = %self.tx_topic, "serial transport closed");
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}

impl io::Read for SerialTransport {
    /// Fails with [`io::ErrorKind::TimedOut`] when nothing arrives before the
    /// deadline, matching the `serialport` crate.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let data = self.fill(buf.len());
        if data.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "no data before read timeout",
            ));
        }
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}

impl io::Write for SerialTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.publish_bytes(Bytes::copy_from_slice(buf)))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;

    const READY: Duration = Duration::from_secs(2);

    fn open_on(bus: &LocalBus, timeout: Duration) -> SerialTransport {
        let config = TransportConfig::new("robot/tx", "robot/rx").with_timeout(timeout);
        SerialTransport::open(Box::new(bus.link()), config).unwrap()
    }

    fn ready_transport(timeout: Duration) -> (LocalBus, SerialTransport) {
        let bus = LocalBus::new();
        let transport = open_on(&bus, timeout);
        assert!(transport.wait_ready(READY), "transport never subscribed");
        (bus, transport)
    }

    /// Wait until the delivery thread has queued `count` messages.
    fn wait_queued(transport: &SerialTransport, count: usize) {
        let deadline = Instant::now() + READY;
        while transport.inbox.len() < count {
            assert!(Instant::now() < deadline, "messages never queued");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn header_then_remainder_then_timeout() {
        let (bus, mut transport) = ready_transport(Duration::from_millis(200));
        bus.publish_to("robot/rx", &b"AB"[..]);
        bus.publish_to("robot/rx", &b"CDE"[..]);

        assert_eq!(transport.read(4), b"ABCD");
        assert_eq!(transport.read(1), b"E");

        let started = Instant::now();
        assert!(transport.read(1).is_empty());
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn any_read_split_reconstructs_the_stream() {
        let (bus, mut transport) = ready_transport(Duration::from_millis(500));
        let messages: Vec<Vec<u8>> = vec![
            vec![0xFF, 0xFF, 0x01, 0x02],
            vec![0x00],
            (0u8..37).collect(),
            vec![0xAA; 9],
            vec![0x10, 0x20, 0x30],
        ];
        let expected: Vec<u8> = messages.concat();
        for m in &messages {
            bus.publish_to("robot/rx", m.clone());
        }

        let splits = [1usize, 3, 7, 2, 11, 5, 13, 4, 8];
        let mut got = Vec::new();
        let mut i = 0;
        while got.len() < expected.len() {
            let want = splits[i % splits.len()].min(expected.len() - got.len());
            let chunk = transport.read(want);
            assert_eq!(chunk.len(), want, "read({want}) came back short");
            got.extend(chunk);
            i += 1;
        }
        assert_eq!(got, expected);
        assert_eq!(transport.in_waiting(), 0);
    }

    #[test]
    fn read_never_exceeds_request_and_keeps_surplus() {
        let (bus, mut transport) = ready_transport(Duration::from_millis(200));
        bus.publish_to("robot/rx", &b"0123456789"[..]);

        let first = transport.read(3);
        assert_eq!(first, b"012");
        assert_eq!(transport.in_waiting(), 7);
        assert_eq!(transport.read(100), b"3456789");
    }

    #[test]
    fn empty_read_returns_after_timeout() {
        let timeout = Duration::from_millis(50);
        let (_bus, mut transport) = ready_transport(timeout);

        let started = Instant::now();
        let data = transport.read(8);
        let elapsed = started.elapsed();
        assert!(data.is_empty());
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(500), "took {elapsed:?}");
    }

    #[test]
    fn zero_length_read_returns_immediately() {
        let (_bus, mut transport) = ready_transport(Duration::from_secs(5));
        let started = Instant::now();
        assert!(transport.read(0).is_empty());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn integer_list_and_bytes_publish_identical_payloads() {
        let (bus, transport) = ready_transport(DEFAULT_READ_TIMEOUT);
        let tap = bus.subscribe_to("robot/tx");

        assert_eq!(transport.write(vec![1i64, 2, 3]).unwrap(), 3);
        assert_eq!(transport.write(&[1u8, 2, 3]).unwrap(), 3);

        let (_, a) = tap.recv_timeout(READY).unwrap();
        let (_, b) = tap.recv_timeout(READY).unwrap();
        assert_eq!(a, b);
        assert_eq!(&a[..], &[1, 2, 3]);
    }

    #[test]
    fn unsupported_payload_fails_and_publishes_nothing() {
        let (bus, transport) = ready_transport(DEFAULT_READ_TIMEOUT);
        let tap = bus.subscribe_to("robot/tx");

        let err = transport.write_value(&serde_json::json!(7)).unwrap_err();
        assert!(matches!(err, LinkError::UnsupportedPayloadType(_)));
        let err = transport.write(vec![1i64, 300]).unwrap_err();
        assert!(matches!(err, LinkError::UnsupportedPayloadType(_)));

        assert!(tap.recv_timeout(Duration::from_millis(100)).is_none());
    }

    #[test]
    fn write_does_not_echo_into_receive_buffer() {
        let (_bus, mut transport) = ready_transport(Duration::from_millis(50));
        transport.write(&b"ping"[..]).unwrap();
        assert_eq!(transport.in_waiting(), 0);
        assert!(transport.read(4).is_empty());
    }

    #[test]
    fn close_twice_leaves_transport_closed() {
        let (_bus, mut transport) = ready_transport(DEFAULT_READ_TIMEOUT);
        transport.close();
        transport.close();
        assert_eq!(transport.state(), LinkState::Closed);
        assert!(!transport.wait_ready(Duration::from_millis(10)));
    }

    #[test]
    fn unreachable_broker_is_not_a_constructor_error() {
        let bus = LocalBus::new();
        bus.set_online(false);
        let transport = open_on(&bus, Duration::from_millis(20));

        assert!(!transport.wait_ready(Duration::from_millis(200)));
        assert_eq!(transport.state(), LinkState::Disconnected);
        // Writes are still attempted and reported as sent.
        assert_eq!(transport.write(&b"\x01\x02"[..]).unwrap(), 2);
    }

    #[test]
    fn in_waiting_counts_carry_bytes_plus_queued_messages() {
        let (bus, mut transport) = ready_transport(Duration::from_millis(200));
        bus.publish_to("robot/rx", &b"AB"[..]);
        bus.publish_to("robot/rx", &b"CDE"[..]);
        wait_queued(&transport, 2);

        // Two queued messages, not five bytes.
        assert_eq!(transport.in_waiting(), 2);

        assert_eq!(transport.read(1), b"A");
        // One carried byte plus one queued message.
        assert_eq!(transport.in_waiting(), 2);
    }

    #[test]
    fn reset_input_buffer_discards_everything_pending() {
        let (bus, mut transport) = ready_transport(Duration::from_millis(50));
        bus.publish_to("robot/rx", &b"stale"[..]);
        bus.publish_to("robot/rx", &b"junk"[..]);
        wait_queued(&transport, 2);
        assert_eq!(transport.read(2), b"st");

        transport.reset_input_buffer();
        assert_eq!(transport.in_waiting(), 0);
        assert!(transport.read(1).is_empty());
    }

    #[test]
    fn io_traits_speak_the_stream_contract() {
        use std::io::{Read, Write};

        let (bus, mut transport) = ready_transport(Duration::from_millis(100));
        let tap = bus.subscribe_to("robot/tx");

        transport.write_all(&[0xFF, 0xFF, 0xFE, 0x02, 0x01, 0xFE]).unwrap();
        Write::flush(&mut transport).unwrap();
        let (_, sent) = tap.recv_timeout(READY).unwrap();
        assert_eq!(&sent[..], &[0xFF, 0xFF, 0xFE, 0x02, 0x01, 0xFE]);

        bus.publish_to("robot/rx", Bytes::from_static(&[0xFF, 0xFF, 0x01]));
        bus.publish_to("robot/rx", Bytes::from_static(&[0x02, 0x00, 0xFC]));
        let mut header = [0u8; 4];
        transport.read_exact(&mut header).unwrap();
        assert_eq!(header, [0xFF, 0xFF, 0x01, 0x02]);
        let mut rest = [0u8; 2];
        transport.read_exact(&mut rest).unwrap();
        assert_eq!(rest, [0x00, 0xFC]);

        let mut empty = [0u8; 1];
        let err = Read::read(&mut transport, &mut empty).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn set_timeout_applies_to_next_read() {
        let (_bus, mut transport) = ready_transport(Duration::from_secs(5));
        transport.set_timeout(Duration::from_millis(10));
        assert_eq!(transport.timeout(), Duration::from_millis(10));
        let started = Instant::now();
        assert!(transport.read(1).is_empty());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn wildcard_receive_topic_delivers_matching_messages() {
        let bus = LocalBus::new();
        let config =
            TransportConfig::new("robot/tx", "robot/+").with_timeout(Duration::from_secs(2));
        let mut transport = SerialTransport::open(Box::new(bus.link()), config).unwrap();
        assert!(transport.wait_ready(READY));

        assert_eq!(bus.publish_to("robot/rx", &b"AB"[..]), 1);
        assert_eq!(transport.read(2), b"AB");
    }
}
