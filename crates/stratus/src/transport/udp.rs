// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stratus contributors

//! Default UDP transport adapter.
//!
//! A connected, non-blocking UDP socket with a short read timeout. Suitable
//! for POSIX-style hosts; embedded targets implement [`Transport`] over
//! their own stack instead.

use super::{Transport, TransportStatus};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

/// Read timeout: the driving loop must never stall on an empty socket.
const READ_TIMEOUT: Duration = Duration::from_millis(1);

/// UDP transport for the broker session.
///
/// The socket is connected to the resolved broker address so that `send`
/// and `recv` apply and stray datagrams from other peers are filtered by
/// the kernel.
pub struct UdpTransport {
    socket: Option<UdpSocket>,
    peer: Option<SocketAddr>,
}

impl UdpTransport {
    /// Create an unconnected transport.
    #[must_use]
    pub fn new() -> Self {
        Self {
            socket: None,
            peer: None,
        }
    }

    /// Address of the currently connected broker, if any.
    #[must_use]
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn open_socket(peer: SocketAddr) -> std::io::Result<UdpSocket> {
        let domain = if peer.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket2 = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket2.set_nonblocking(false)?;
        socket2.set_read_timeout(Some(READ_TIMEOUT))?;
        let socket: UdpSocket = socket2.into();
        socket.connect(peer)?;
        Ok(socket)
    }
}

impl Default for UdpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for UdpTransport {
    fn connect(&mut self, host: &str, port: u16) -> bool {
        self.disconnect();
        let addrs = match (host, port).to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(err) => {
                log::warn!("[UDP] resolve failed host={} err={}", host, err);
                return false;
            }
        };
        for peer in addrs {
            match Self::open_socket(peer) {
                Ok(socket) => {
                    log::debug!("[UDP] connected peer={}", peer);
                    self.socket = Some(socket);
                    self.peer = Some(peer);
                    return true;
                }
                Err(err) => {
                    log::debug!("[UDP] connect failed peer={} err={}", peer, err);
                }
            }
        }
        false
    }

    fn disconnect(&mut self) {
        if self.socket.take().is_some() {
            log::debug!("[UDP] disconnected peer={:?}", self.peer);
        }
        self.peer = None;
    }

    fn send(&mut self, data: &[u8]) -> TransportStatus {
        let Some(socket) = self.socket.as_ref() else {
            return TransportStatus::Fatal;
        };
        match socket.send(data) {
            Ok(n) => TransportStatus::Done(n),
            Err(err) if err.kind() == ErrorKind::WouldBlock => TransportStatus::Idle,
            Err(err) => {
                log::warn!("[UDP] send error={} len={}", err, data.len());
                TransportStatus::Fatal
            }
        }
    }

    fn receive(&mut self, buf: &mut [u8]) -> TransportStatus {
        let Some(socket) = self.socket.as_ref() else {
            return TransportStatus::Fatal;
        };
        match socket.recv(buf) {
            Ok(n) => TransportStatus::Done(n),
            Err(err)
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
            {
                TransportStatus::Idle
            }
            // A connected UDP socket surfaces ICMP unreachable as
            // ConnectionRefused; treat it as transient, the retransmit layer
            // recovers or the supervisor times out.
            Err(err) if err.kind() == ErrorKind::ConnectionRefused => TransportStatus::Idle,
            Err(err) => {
                log::warn!("[UDP] receive error={}", err);
                TransportStatus::Fatal
            }
        }
    }
}
