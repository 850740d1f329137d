// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! UDP transport: a process-global cache of client sockets keyed by
//! destination, and a simple blocking server socket for the receiver side.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::{Mutex, OnceLock};

use crate::constants::MAX_PACKET_SIZE;
use crate::errors::TransportError;

/// A cached outbound connection to one collectd-compatible endpoint.
///
/// Holds the socket behind a mutex both to serialize sends from multiple
/// threads and to guard the fork check: after a `fork()`, the child inherits
/// the parent's file descriptor, and reusing it would interleave writes from
/// two processes on the same socket. We detect this by recording the pid the
/// socket was created under and re-creating it if the current pid differs.
pub struct ClientConnection {
    addr: SocketAddr,
    socket: Mutex<Option<(UdpSocket, u32)>>,
}

impl ClientConnection {
    fn new(addr: SocketAddr) -> Self {
        ClientConnection {
            addr,
            socket: Mutex::new(None),
        }
    }

    fn current_pid() -> u32 {
        std::process::id()
    }

    fn ensure_connected<'a>(
        guard: &'a mut Option<(UdpSocket, u32)>,
        addr: SocketAddr,
    ) -> Result<&'a UdpSocket, TransportError> {
        let pid = Self::current_pid();
        let needs_new = match guard.as_ref() {
            Some((_, created_pid)) => *created_pid != pid,
            None => true,
        };
        if needs_new {
            let bind_addr: SocketAddr = if addr.is_ipv4() {
                "0.0.0.0:0".parse().unwrap()
            } else {
                "[::]:0".parse().unwrap()
            };
            let socket = UdpSocket::bind(bind_addr).map_err(|source| TransportError::Bind {
                addr: bind_addr,
                source,
            })?;
            *guard = Some((socket, pid));
        }
        Ok(&guard.as_ref().unwrap().0)
    }

    /// Send one already-encoded packet to this endpoint. Failures are
    /// returned to the caller (the worker logs and continues) rather than
    /// panicking — a single unreachable collectd endpoint must never bring
    /// down metric collection for the rest of the process.
    pub fn send(&self, packet: &[u8]) -> Result<(), TransportError> {
        if packet.len() > MAX_PACKET_SIZE {
            return Err(TransportError::PacketTooLarge(packet.len(), MAX_PACKET_SIZE));
        }
        let mut guard = self.socket.lock().expect("client connection lock poisoned");
        let socket = Self::ensure_connected(&mut guard, self.addr)?;
        socket
            .send_to(packet, self.addr)
            .map(|_| ())
            .map_err(|source| TransportError::Send {
                addr: self.addr,
                source,
            })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Process-global cache of `ClientConnection`s keyed by destination, the way
/// a single process sends to the same collectd endpoint from many senders
/// without opening a socket per sender.
#[derive(Default)]
pub struct ClientConnectionRegistry {
    connections: Mutex<HashMap<SocketAddr, std::sync::Arc<ClientConnection>>>,
}

impl ClientConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_host_port(
        &self,
        host: &str,
        port: u16,
    ) -> std::io::Result<std::sync::Arc<ClientConnection>> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no address"))?;
        let mut connections = self.connections.lock().expect("registry lock poisoned");
        let conn = connections
            .entry(addr)
            .or_insert_with(|| std::sync::Arc::new(ClientConnection::new(addr)));
        Ok(conn.clone())
    }
}

static GLOBAL_CLIENT_CONNECTIONS: OnceLock<ClientConnectionRegistry> = OnceLock::new();

/// Thin module-level accessor over the process-global connection cache,
/// for call sites that don't already have a registry threaded through.
pub fn global_client_connections() -> &'static ClientConnectionRegistry {
    GLOBAL_CLIENT_CONNECTIONS.get_or_init(ClientConnectionRegistry::new)
}

/// The receiver side: a single bound UDP socket read with blocking
/// `recv_from` calls, one packet at a time.
pub struct ServerConnection {
    socket: UdpSocket,
}

impl ServerConnection {
    pub fn bind(host: &str, port: u16) -> Result<Self, TransportError> {
        let addr = (host, port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut it| it.next())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], port)));
        let socket = UdpSocket::bind(addr).map_err(|source| TransportError::Bind { addr, source })?;
        Ok(ServerConnection { socket })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Block until one datagram arrives, returning its bytes and the sender's
    /// address. Datagrams larger than `MAX_PACKET_SIZE` are truncated by the
    /// kernel the same way collectd's own C implementation tolerates them.
    pub fn receive(&self) -> Result<(Vec<u8>, SocketAddr), TransportError> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let (n, from) = self
            .socket
            .recv_from(&mut buf)
            .map_err(TransportError::Receive)?;
        buf.truncate(n);
        Ok((buf, from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_connection_round_trips_a_packet() {
        let server = ServerConnection::bind("127.0.0.1", 0).unwrap();
        let addr = server.local_addr().unwrap();
        let client = ClientConnection::new(addr);
        client.send(b"hello").unwrap();
        let (data, _from) = server.receive().unwrap();
        assert_eq!(data, b"hello");
    }

    #[test]
    fn oversized_packet_is_rejected_before_sending() {
        let client = ClientConnection::new("127.0.0.1:0".parse().unwrap());
        let big = vec![0u8; MAX_PACKET_SIZE + 1];
        let err = client.send(&big).unwrap_err();
        assert!(matches!(err, TransportError::PacketTooLarge(_, _)));
    }

    #[test]
    fn registry_reuses_the_same_connection_for_repeat_lookups() {
        let registry = ClientConnectionRegistry::new();
        let a = registry.for_host_port("127.0.0.1", 12345).unwrap();
        let b = registry.for_host_port("127.0.0.1", 12345).unwrap();
        assert!(std::sync::Arc::ptr_eq(&a, &b));
    }
}
