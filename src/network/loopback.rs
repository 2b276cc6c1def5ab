//! In-process loopback transport.
//!
//! A process-wide registry maps virtual ports to inboxes so two protocol
//! endpoints can talk without a real network. This is how the integration
//! tests drive full protocol and session exchanges deterministically. The
//! registry is the one shared-mutable singleton in the crate; a socket
//! unregisters itself on drop.

use std::collections::{BTreeMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::network::udp_socket::DatagramSocket;

type Inbox = Arc<Mutex<VecDeque<(SocketAddr, Vec<u8>)>>>;

fn registry() -> &'static Mutex<BTreeMap<u16, Inbox>> {
    static REGISTRY: OnceLock<Mutex<BTreeMap<u16, Inbox>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(BTreeMap::new()))
}

/// Ports handed out by [`LoopbackSocket::bind_auto`]; kept away from
/// commonly hard-coded test ports.
static NEXT_AUTO_PORT: AtomicU16 = AtomicU16::new(40_000);

/// An in-process datagram endpoint identified by a virtual port.
///
/// Datagrams sent to a port that is not currently bound are reported as
/// send failures, mirroring an OS error on a real socket.
#[derive(Debug)]
pub struct LoopbackSocket {
    port: u16,
    inbox: Inbox,
}

impl LoopbackSocket {
    /// Binds a specific virtual port. Returns `None` if it is taken.
    #[must_use]
    pub fn bind(port: u16) -> Option<Self> {
        let mut ports = registry().lock();
        if ports.contains_key(&port) {
            return None;
        }
        let inbox: Inbox = Arc::new(Mutex::new(VecDeque::new()));
        ports.insert(port, inbox.clone());
        Some(LoopbackSocket { port, inbox })
    }

    /// Binds a fresh, unused virtual port.
    #[must_use]
    pub fn bind_auto() -> Self {
        loop {
            let port = NEXT_AUTO_PORT.fetch_add(1, Ordering::Relaxed);
            if let Some(socket) = Self::bind(port) {
                return socket;
            }
        }
    }

    /// The virtual port this socket is bound to.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The loopback address for a virtual port.
    #[must_use]
    pub fn addr_for(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }
}

impl DatagramSocket for LoopbackSocket {
    fn send_to(&mut self, datagram: &[u8], addr: SocketAddr) -> bool {
        let target = {
            let ports = registry().lock();
            ports.get(&addr.port()).cloned()
        };
        match target {
            Some(inbox) => {
                inbox
                    .lock()
                    .push_back((Self::addr_for(self.port), datagram.to_vec()));
                true
            },
            None => false,
        }
    }

    fn receive_all(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.inbox.lock().drain(..).collect()
    }

    fn local_addr(&self) -> SocketAddr {
        Self::addr_for(self.port)
    }
}

impl Drop for LoopbackSocket {
    fn drop(&mut self) {
        registry().lock().remove(&self.port);
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn two_endpoints_exchange_datagrams() {
        let mut a = LoopbackSocket::bind_auto();
        let mut b = LoopbackSocket::bind_auto();

        assert!(a.send_to(b"ping", b.local_addr()));
        let received = b.receive_all();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, a.local_addr());
        assert_eq!(received[0].1, b"ping");

        assert!(b.send_to(b"pong", a.local_addr()));
        assert_eq!(a.receive_all()[0].1, b"pong");
    }

    #[test]
    fn sending_to_unbound_port_fails() {
        let mut a = LoopbackSocket::bind_auto();
        assert!(!a.send_to(b"void", LoopbackSocket::addr_for(1)));
    }

    #[test]
    fn double_bind_is_refused() {
        let a = LoopbackSocket::bind_auto();
        assert!(LoopbackSocket::bind(a.port()).is_none());
    }

    #[test]
    fn drop_unregisters() {
        let port = {
            let socket = LoopbackSocket::bind_auto();
            socket.port()
        };
        // rebinding the dropped port succeeds
        let rebound = LoopbackSocket::bind(port);
        assert!(rebound.is_some());
    }

    #[test]
    fn receive_drains() {
        let mut a = LoopbackSocket::bind_auto();
        let mut b = LoopbackSocket::bind_auto();
        for i in 0..3u8 {
            assert!(a.send_to(&[i], b.local_addr()));
        }
        assert_eq!(b.receive_all().len(), 3);
        assert!(b.receive_all().is_empty());
    }
}
