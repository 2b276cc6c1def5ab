//! Reliable delivery over unreliable datagrams.
//!
//! [`ReliableChannel`] layers three deliverability modes on top of a
//! [`DatagramSocket`]:
//!
//! - **unacked**: fire-and-forget ([`SendPriority::None`]),
//! - **acked**: retransmitted with exponential back-off until the receiver
//!   confirms, or until the total timeout drops the endpoint,
//! - **control**: ping/pong RTT probes the channel sends on its own.
//!
//! Receipt handling follows the consume-to-ack rule: an acked payload is
//! handed to the upstream handler exactly once; only if the handler consumes
//! it is an ack returned, and later duplicates are re-acked without being
//! redelivered. All time flows in through method parameters, so tests can
//! drive timeouts and retransmits deterministically.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::SocketAddr;

use tracing::{debug, trace, warn};
use web_time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::network::messages::{WireMessage, DEFAULT_MAGIC};
use crate::network::udp_socket::DatagramSocket;
use crate::packet::Packet;
use crate::sampler::SampleWindow;

/// Send priority, mapping to the initial retransmit poll interval.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SendPriority {
    /// Fire-and-forget; the message is never retransmitted.
    None,
    /// Acked, first retransmit after 5000 ms.
    Lowest,
    /// Acked, first retransmit after 500 ms.
    Low,
    /// Acked, first retransmit after 100 ms.
    Medium,
    /// Acked, first retransmit after 50 ms.
    High,
}

impl SendPriority {
    /// The initial retransmit interval; `None` for fire-and-forget.
    #[must_use]
    pub fn initial_poll(self) -> Option<Duration> {
        match self {
            SendPriority::None => None,
            SendPriority::Lowest => Some(Duration::from_millis(5000)),
            SendPriority::Low => Some(Duration::from_millis(500)),
            SendPriority::Medium => Some(Duration::from_millis(100)),
            SendPriority::High => Some(Duration::from_millis(50)),
        }
    }
}

/// Connection-level notifications drained by the session each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolEvent {
    /// An acked message exhausted its deadline (or the OS refused to send);
    /// all state for the endpoint has been purged.
    MessageTimeout {
        /// The endpoint that was dropped.
        addr: SocketAddr,
    },
}

/// Upstream consumer of delivered payloads.
///
/// Returning `true` consumes the message (the sender receives an ack);
/// returning `false` refuses it (the sender will retransmit).
pub trait MessageHandler {
    /// Called once per deliverable payload.
    fn on_message(&mut self, from: SocketAddr, payload: &mut Packet) -> bool;
}

impl<F> MessageHandler for F
where
    F: FnMut(SocketAddr, &mut Packet) -> bool,
{
    fn on_message(&mut self, from: SocketAddr, payload: &mut Packet) -> bool {
        self(from, payload)
    }
}

#[derive(Debug)]
struct PendingMessage {
    datagram: Vec<u8>,
    first_sent: Instant,
    next_resend: Instant,
    poll_interval: Duration,
}

#[derive(Debug)]
struct RemoteState {
    last_received: Instant,
    last_ping_sent: Option<Instant>,
    /// Message numbers already delivered upstream (duplicate suppression).
    handled: BTreeSet<i32>,
    /// Half-RTT samples in milliseconds.
    ping: SampleWindow,
    /// Awaiting-ack table, keyed by message number.
    pending: BTreeMap<i32, PendingMessage>,
}

impl RemoteState {
    fn new(now: Instant, sampler_size: usize) -> Self {
        RemoteState {
            last_received: now,
            last_ping_sent: None,
            handled: BTreeSet::new(),
            ping: SampleWindow::new(sampler_size),
            pending: BTreeMap::new(),
        }
    }
}

/// A reliable multi-endpoint channel over one datagram socket.
pub struct ReliableChannel {
    socket: Box<dyn DatagramSocket>,
    start: Instant,
    next_message_number: i32,
    remotes: BTreeMap<SocketAddr, RemoteState>,
    ping_interval: Duration,
    total_timeout: Duration,
    sampler_size: usize,
    invalid_packets: u64,
    events: VecDeque<ProtocolEvent>,
}

impl ReliableChannel {
    /// Wraps a socket with the timing options from `config`.
    #[must_use]
    pub fn new(socket: Box<dyn DatagramSocket>, config: &EngineConfig) -> Self {
        ReliableChannel {
            socket,
            start: Instant::now(),
            next_message_number: 1,
            remotes: BTreeMap::new(),
            ping_interval: config.ping_interval,
            total_timeout: config.total_timeout,
            sampler_size: config.sampler_size,
            invalid_packets: 0,
            events: VecDeque::new(),
        }
    }

    /// The address peers reach this channel at.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    /// Registers an endpoint (idempotent). Endpoints are also registered
    /// implicitly by the first datagram in either direction.
    pub fn add_remote(&mut self, addr: SocketAddr, now: Instant) {
        let sampler_size = self.sampler_size;
        self.remotes
            .entry(addr)
            .or_insert_with(|| RemoteState::new(now, sampler_size));
    }

    /// Forgets an endpoint and everything pending for it.
    pub fn remove_remote(&mut self, addr: SocketAddr) {
        self.remotes.remove(&addr);
    }

    /// Currently known endpoints.
    #[must_use]
    pub fn remotes(&self) -> Vec<SocketAddr> {
        self.remotes.keys().copied().collect()
    }

    /// Whether the endpoint is known.
    #[must_use]
    pub fn has_remote(&self, addr: SocketAddr) -> bool {
        self.remotes.contains_key(&addr)
    }

    /// Mean half-RTT to the endpoint in milliseconds, if measured.
    #[must_use]
    pub fn ping_ms(&self, addr: SocketAddr) -> Option<i64> {
        let remote = self.remotes.get(&addr)?;
        if remote.ping.is_empty() {
            return None;
        }
        Some(remote.ping.mean())
    }

    /// Messages awaiting acknowledgement from the endpoint.
    #[must_use]
    pub fn pending_count(&self, addr: SocketAddr) -> usize {
        self.remotes.get(&addr).map_or(0, |r| r.pending.len())
    }

    /// Datagrams dropped as undecryptable or misframed.
    #[must_use]
    pub fn invalid_packet_count(&self) -> u64 {
        self.invalid_packets
    }

    /// Drains connection-level events.
    pub fn events(&mut self) -> std::collections::vec_deque::Drain<'_, ProtocolEvent> {
        self.events.drain(..)
    }

    fn now_ticks(&self, now: Instant) -> i64 {
        now.saturating_duration_since(self.start).as_millis() as i64
    }

    /// Sends a payload at the given priority.
    ///
    /// `None` priority transmits once and forgets. Any other priority
    /// allocates a message number, stores the encoded datagram in the
    /// awaiting-ack table and retransmits it with doubling intervals until
    /// acked or timed out.
    pub fn send(&mut self, addr: SocketAddr, payload: Packet, priority: SendPriority, now: Instant) {
        self.add_remote(addr, now);
        match priority.initial_poll() {
            None => {
                let datagram = WireMessage::Unacked { payload }.encode_datagram(&DEFAULT_MAGIC);
                if !self.socket.send_to(&datagram, addr) {
                    self.fail_remote(addr);
                }
            },
            Some(poll_interval) => {
                let message_number = self.next_message_number;
                self.next_message_number += 1;
                let datagram = WireMessage::Acked {
                    message_number,
                    payload,
                }
                .encode_datagram(&DEFAULT_MAGIC);
                let sent = self.socket.send_to(&datagram, addr);
                if !sent {
                    self.fail_remote(addr);
                    return;
                }
                if let Some(remote) = self.remotes.get_mut(&addr) {
                    remote.pending.insert(
                        message_number,
                        PendingMessage {
                            datagram,
                            first_sent: now,
                            next_resend: now + poll_interval,
                            poll_interval,
                        },
                    );
                }
            },
        }
    }

    /// Sends a payload to every known endpoint, optionally excluding one.
    pub fn broadcast(
        &mut self,
        payload: &Packet,
        priority: SendPriority,
        exclude: Option<SocketAddr>,
        now: Instant,
    ) {
        let targets: Vec<SocketAddr> = self
            .remotes
            .keys()
            .copied()
            .filter(|addr| Some(*addr) != exclude)
            .collect();
        for addr in targets {
            self.send(addr, payload.clone(), priority, now);
        }
    }

    /// Drives the channel: drains the socket and dispatches inbound
    /// messages, retransmits due messages, drops timed-out endpoints and
    /// sends RTT probes.
    pub fn poll(&mut self, now: Instant, handler: &mut dyn MessageHandler) {
        self.receive(now, handler);
        self.retransmit(now);
        self.send_pings(now);
    }

    fn receive(&mut self, now: Instant, handler: &mut dyn MessageHandler) {
        for (from, datagram) in self.socket.receive_all() {
            let message = match WireMessage::decode_datagram(&datagram, &DEFAULT_MAGIC) {
                Ok(message) => message,
                Err(err) => {
                    self.invalid_packets += 1;
                    trace!(%from, error = %err, "dropping invalid datagram");
                    continue;
                },
            };
            self.add_remote(from, now);
            if let Some(remote) = self.remotes.get_mut(&from) {
                remote.last_received = now;
            }
            match message {
                WireMessage::Ack { message_number } => {
                    if let Some(remote) = self.remotes.get_mut(&from) {
                        remote.pending.remove(&message_number);
                    }
                },
                WireMessage::Acked {
                    message_number,
                    mut payload,
                } => {
                    let already_handled = self
                        .remotes
                        .get(&from)
                        .is_some_and(|r| r.handled.contains(&message_number));
                    if already_handled {
                        // the ack was lost; re-ack without redelivering
                        self.send_control(from, &WireMessage::Ack { message_number });
                    } else if handler.on_message(from, &mut payload) {
                        if let Some(remote) = self.remotes.get_mut(&from) {
                            remote.handled.insert(message_number);
                        }
                        self.send_control(from, &WireMessage::Ack { message_number });
                    } else {
                        // refused: no ack, the sender will retry
                        debug!(%from, message_number, "handler refused acked payload");
                    }
                },
                WireMessage::Unacked { mut payload } => {
                    let _ = handler.on_message(from, &mut payload);
                },
                WireMessage::Ping { timestamp } => {
                    self.send_control(from, &WireMessage::Pong { timestamp });
                },
                WireMessage::Pong { timestamp } => {
                    let half_rtt = (self.now_ticks(now) - timestamp).max(0) / 2;
                    if let Some(remote) = self.remotes.get_mut(&from) {
                        remote.ping.push(half_rtt);
                    }
                },
            }
        }
    }

    fn retransmit(&mut self, now: Instant) {
        let mut failed: Vec<SocketAddr> = Vec::new();
        for (addr, remote) in &mut self.remotes {
            let expired = remote
                .pending
                .values()
                .any(|p| now.saturating_duration_since(p.first_sent) >= self.total_timeout);
            if expired {
                failed.push(*addr);
                continue;
            }
            for pending in remote.pending.values_mut() {
                if pending.next_resend <= now {
                    if self.socket.send_to(&pending.datagram, *addr) {
                        // incremental back-off
                        pending.poll_interval *= 2;
                        pending.next_resend = now + pending.poll_interval;
                    } else {
                        failed.push(*addr);
                        break;
                    }
                }
            }
        }
        for addr in failed {
            self.fail_remote(addr);
        }
    }

    fn send_pings(&mut self, now: Instant) {
        let ticks = self.now_ticks(now);
        let mut to_ping: Vec<SocketAddr> = Vec::new();
        for (addr, remote) in &self.remotes {
            // a remote that has gone quiet is not worth probing
            let silent =
                now.saturating_duration_since(remote.last_received) > self.ping_interval * 2;
            if silent {
                continue;
            }
            let due = remote
                .last_ping_sent
                .map_or(true, |last| {
                    now.saturating_duration_since(last) >= self.ping_interval
                });
            if due {
                to_ping.push(*addr);
            }
        }
        for addr in to_ping {
            let datagram =
                WireMessage::Ping { timestamp: ticks }.encode_datagram(&DEFAULT_MAGIC);
            let sent = self.socket.send_to(&datagram, addr);
            if let Some(remote) = self.remotes.get_mut(&addr) {
                remote.last_ping_sent = Some(now);
            }
            if !sent {
                self.fail_remote(addr);
            }
        }
    }

    fn send_control(&mut self, addr: SocketAddr, message: &WireMessage) {
        let datagram = message.encode_datagram(&DEFAULT_MAGIC);
        if !self.socket.send_to(&datagram, addr) {
            self.fail_remote(addr);
        }
    }

    /// Purges an endpoint after a send failure or timeout and notifies
    /// upstream.
    fn fail_remote(&mut self, addr: SocketAddr) {
        if self.remotes.remove(&addr).is_some() {
            warn!(%addr, "dropping endpoint (timeout or send failure)");
            self.events.push_back(ProtocolEvent::MessageTimeout { addr });
        }
    }
}

impl std::fmt::Debug for ReliableChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliableChannel")
            .field("local_addr", &self.socket.local_addr())
            .field("remotes", &self.remotes.keys().collect::<Vec<_>>())
            .field("invalid_packets", &self.invalid_packets)
            .finish_non_exhaustive()
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::network::loopback::LoopbackSocket;

    fn channel() -> ReliableChannel {
        ReliableChannel::new(
            Box::new(LoopbackSocket::bind_auto()),
            &EngineConfig::default(),
        )
    }

    fn text_payload(text: &str) -> Packet {
        let mut payload = Packet::new();
        payload.write_string(text);
        payload
    }

    /// Collects consumed payload strings.
    struct Collector {
        received: Vec<String>,
        consume: bool,
    }

    impl Collector {
        fn consuming() -> Self {
            Collector {
                received: Vec::new(),
                consume: true,
            }
        }

        fn refusing() -> Self {
            Collector {
                received: Vec::new(),
                consume: false,
            }
        }
    }

    impl MessageHandler for Collector {
        fn on_message(&mut self, _from: SocketAddr, payload: &mut Packet) -> bool {
            if let Ok(text) = payload.read_string() {
                self.received.push(text);
            }
            self.consume
        }
    }

    #[test]
    fn acked_round_trip_clears_pending() {
        let mut a = channel();
        let mut b = channel();
        let now = Instant::now();

        a.send(b.local_addr(), text_payload("hello"), SendPriority::High, now);
        assert_eq!(a.pending_count(b.local_addr()), 1);

        let mut sink = Collector::consuming();
        b.poll(now, &mut sink);
        assert_eq!(sink.received, vec!["hello".to_owned()]);

        let mut none = Collector::consuming();
        a.poll(now, &mut none);
        assert_eq!(a.pending_count(b.local_addr()), 0);
        assert!(none.received.is_empty());
    }

    #[test]
    fn duplicate_delivery_is_suppressed() {
        let mut a = channel();
        let mut b = channel();
        let now = Instant::now();

        a.send(b.local_addr(), text_payload("hi"), SendPriority::High, now);

        // B consumes the first copy and acks, but the ack is lost
        let mut sink = Collector::consuming();
        b.poll(now, &mut sink);
        let _ = a.socket.receive_all(); // drop the ack on the floor

        // past the poll interval, A retransmits the same message number
        let later = now + Duration::from_millis(60);
        let mut none = Collector::consuming();
        a.poll(later, &mut none);

        let mut sink2 = Collector::consuming();
        b.poll(later, &mut sink2);
        assert!(sink2.received.is_empty(), "duplicate must not be redelivered");
        assert_eq!(sink.received, vec!["hi".to_owned()]);

        // the re-ack clears A's table
        a.poll(later, &mut none);
        assert_eq!(a.pending_count(b.local_addr()), 0);
    }

    #[test]
    fn refused_payload_is_not_acked() {
        let mut a = channel();
        let mut b = channel();
        let now = Instant::now();

        a.send(b.local_addr(), text_payload("later"), SendPriority::High, now);
        let mut refuser = Collector::refusing();
        b.poll(now, &mut refuser);
        assert_eq!(refuser.received, vec!["later".to_owned()]);

        let mut none = Collector::consuming();
        a.poll(now, &mut none);
        // no ack came back; the message is still pending
        assert_eq!(a.pending_count(b.local_addr()), 1);

        // after a retransmit the receiver may consume it after all
        let later = now + Duration::from_millis(60);
        a.poll(later, &mut none);
        let mut sink = Collector::consuming();
        b.poll(later, &mut sink);
        assert_eq!(sink.received, vec!["later".to_owned()]);
        a.poll(later, &mut none);
        assert_eq!(a.pending_count(b.local_addr()), 0);
    }

    #[test]
    fn unacked_is_fire_and_forget() {
        let mut a = channel();
        let mut b = channel();
        let now = Instant::now();

        a.send(b.local_addr(), text_payload("once"), SendPriority::None, now);
        assert_eq!(a.pending_count(b.local_addr()), 0);

        let mut sink = Collector::consuming();
        b.poll(now, &mut sink);
        assert_eq!(sink.received, vec!["once".to_owned()]);

        // no retransmit ever happens
        let later = now + Duration::from_secs(60);
        let mut none = Collector::consuming();
        a.poll(later, &mut none);
        let mut empty = Collector::consuming();
        b.poll(later, &mut empty);
        assert!(empty.received.is_empty());
    }

    #[test]
    fn retransmit_doubles_interval() {
        let mut a = channel();
        let b = LoopbackSocket::bind_auto(); // bound but never polled
        let now = Instant::now();

        a.send(b.local_addr(), text_payload("x"), SendPriority::High, now);
        // first retransmit due at +50ms, second at +150ms, third at +350ms
        let mut none = Collector::consuming();
        a.poll(now + Duration::from_millis(60), &mut none);
        a.poll(now + Duration::from_millis(160), &mut none);
        a.poll(now + Duration::from_millis(360), &mut none);
        assert_eq!(a.pending_count(b.local_addr()), 1);
        // the silent receiver accumulated original + 3 retransmits
        // (plus possibly a ping probe, which is not an Acked message)
        let mut b = b;
        let acked = b
            .receive_all()
            .iter()
            .filter(|(_, datagram)| {
                matches!(
                    WireMessage::decode_datagram(datagram, &DEFAULT_MAGIC),
                    Ok(WireMessage::Acked { .. })
                )
            })
            .count();
        assert_eq!(acked, 4);
    }

    #[test]
    fn total_timeout_drops_endpoint() {
        let mut a = channel();
        let b = LoopbackSocket::bind_auto(); // never replies
        let now = Instant::now();

        a.send(b.local_addr(), text_payload("void"), SendPriority::High, now);
        assert!(a.has_remote(b.local_addr()));

        let mut none = Collector::consuming();
        a.poll(now + Duration::from_secs(10), &mut none);

        assert!(!a.has_remote(b.local_addr()));
        assert_eq!(a.pending_count(b.local_addr()), 0);
        let events: Vec<ProtocolEvent> = a.events().collect();
        assert_eq!(
            events,
            vec![ProtocolEvent::MessageTimeout {
                addr: b.local_addr()
            }]
        );
    }

    #[test]
    fn os_send_failure_drops_endpoint() {
        let mut a = channel();
        // loopback port 1 is never bound; send_to reports failure
        let dead = LoopbackSocket::addr_for(1);
        let now = Instant::now();
        a.send(dead, text_payload("x"), SendPriority::Medium, now);
        assert!(!a.has_remote(dead));
        let events: Vec<ProtocolEvent> = a.events().collect();
        assert_eq!(events, vec![ProtocolEvent::MessageTimeout { addr: dead }]);
    }

    #[test]
    fn ping_pong_measures_rtt() {
        let mut a = channel();
        let mut b = channel();
        let now = Instant::now();

        a.add_remote(b.local_addr(), now);
        let mut none = Collector::consuming();
        a.poll(now, &mut none); // sends ping
        b.poll(now, &mut none); // replies pong
        a.poll(now, &mut none); // ingests pong

        assert!(a.ping_ms(b.local_addr()).is_some());
        assert!(a.ping_ms(b.local_addr()).unwrap() >= 0);
    }

    #[test]
    fn silent_remote_is_not_pinged() {
        let mut a = channel();
        let b = LoopbackSocket::bind_auto();
        let now = Instant::now();

        a.add_remote(b.local_addr(), now);
        let mut none = Collector::consuming();
        // well past 2x ping interval with nothing received from b
        let later = now + Duration::from_secs(5);
        a.poll(later, &mut none);

        let mut b = b;
        assert!(b.receive_all().is_empty(), "silent remote must not be pinged");
    }

    #[test]
    fn invalid_datagrams_are_counted_and_dropped() {
        let mut a = channel();
        let mut raw = LoopbackSocket::bind_auto();
        let a_addr = a.local_addr();

        assert!(raw.send_to(b"garbage", a_addr));
        let mut none = Collector::consuming();
        a.poll(Instant::now(), &mut none);

        assert_eq!(a.invalid_packet_count(), 1);
        assert!(none.received.is_empty());
    }

    #[test]
    fn broadcast_excludes_one_endpoint() {
        let mut host = channel();
        let mut peer1 = channel();
        let mut peer2 = channel();
        let now = Instant::now();

        host.add_remote(peer1.local_addr(), now);
        host.add_remote(peer2.local_addr(), now);
        host.broadcast(
            &text_payload("all"),
            SendPriority::Medium,
            Some(peer1.local_addr()),
            now,
        );

        let mut sink1 = Collector::consuming();
        peer1.poll(now, &mut sink1);
        let mut sink2 = Collector::consuming();
        peer2.poll(now, &mut sink2);
        assert!(sink1.received.is_empty());
        assert_eq!(sink2.received, vec!["all".to_owned()]);
    }
}
