//! The datagram socket seam and the real UDP implementation.
//!
//! The reliable channel talks to the OS only through [`DatagramSocket`]:
//! unordered, unreliable, non-blocking send/receive of raw byte datagrams.
//! [`UdpDatagramSocket`] is the production implementation;
//! [`LoopbackSocket`](crate::network::loopback::LoopbackSocket) is the
//! in-process one used by tests.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use tracing::warn;

/// Receive buffer size; larger datagrams are truncated by the OS and will
/// fail framing validation downstream.
const RECV_BUFFER_SIZE: usize = 4096;

/// Unordered, unreliable datagram transport.
///
/// Implementations must never block: `receive_all` returns whatever has
/// arrived since the last call, and `send_to` reports failure instead of
/// waiting. The reliable channel layers acknowledgement and retry on top.
pub trait DatagramSocket {
    /// Sends one datagram; returns `false` on an OS-level send failure.
    fn send_to(&mut self, datagram: &[u8], addr: SocketAddr) -> bool;

    /// Drains everything received since the last call.
    fn receive_all(&mut self) -> Vec<(SocketAddr, Vec<u8>)>;

    /// The address peers reach this socket at.
    fn local_addr(&self) -> SocketAddr;
}

/// A non-blocking UDP socket bound to `0.0.0.0:port`.
#[derive(Debug)]
pub struct UdpDatagramSocket {
    socket: UdpSocket,
    /// Reused across receive calls to avoid per-datagram allocation.
    recv_buffer: [u8; RECV_BUFFER_SIZE],
}

impl UdpDatagramSocket {
    /// Binds to the given port (0 lets the OS choose) in non-blocking mode.
    pub fn bind_to_port(port: u16) -> Result<Self, std::io::Error> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            recv_buffer: [0; RECV_BUFFER_SIZE],
        })
    }
}

impl DatagramSocket for UdpDatagramSocket {
    fn send_to(&mut self, datagram: &[u8], addr: SocketAddr) -> bool {
        match self.socket.send_to(datagram, addr) {
            Ok(_) => true,
            Err(err) => {
                warn!(%addr, error = %err, "UDP send failed");
                false
            },
        }
    }

    fn receive_all(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
        let mut received = Vec::with_capacity(4);
        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((len, from)) => {
                    if let Some(bytes) = self.recv_buffer.get(..len) {
                        received.push((from, bytes.to_vec()));
                    }
                },
                // no more queued datagrams
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return received,
                // datagram sockets surface this after send_to to a dead peer
                Err(ref err) if err.kind() == ErrorKind::ConnectionReset => continue,
                Err(err) => {
                    warn!(error = %err, "unexpected UDP receive error");
                    return received;
                },
            }
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.socket
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
    }
}

// #########
// # TESTS #
// #########
