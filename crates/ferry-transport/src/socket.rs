//! # Datagram Sockets
//!
//! The driver talks to the network through [`DatagramSocket`], created by a
//! [`SocketBinder`]. Two implementations ship with the crate:
//!
//! - [`UdpBinder`] — non-blocking `std::net::UdpSocket`.
//! - [`MemoryNetwork`] — an in-process datagram switch keyed by port, for
//!   deterministic tests and for embedding client and server in one process.
//!   It can also invalidate a socket's allocation, the way a relay service
//!   revokes one.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;

/// Health of the socket's underlying allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketStatus {
    Ok,
    /// The allocation backing this socket was revoked; the session is over.
    AllocationInvalid,
}

/// A bound, non-blocking datagram socket.
pub trait DatagramSocket: Send {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn send_to(&mut self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Read one datagram. `Ok(None)` when nothing is waiting.
    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    fn status(&self) -> SocketStatus {
        SocketStatus::Ok
    }
}

/// Creates sockets bound to a local endpoint.
pub trait SocketBinder: Send {
    fn bind(&mut self, addr: SocketAddr) -> io::Result<Box<dyn DatagramSocket>>;
}

// ─── UDP ─────────────────────────────────────────────────────────────────────

/// Binds real, non-blocking UDP sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpBinder;

impl SocketBinder for UdpBinder {
    fn bind(&mut self, addr: SocketAddr) -> io::Result<Box<dyn DatagramSocket>> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Box::new(UdpDatagramSocket { socket }))
    }
}

#[derive(Debug)]
pub struct UdpDatagramSocket {
    socket: UdpSocket,
}

impl DatagramSocket for UdpDatagramSocket {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn send_to(&mut self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, target)
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        loop {
            match self.socket.recv_from(buf) {
                Ok(v) => return Ok(Some(v)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                // ICMP port unreachable from an earlier send surfaces here on
                // some platforms; it says nothing about the next datagram.
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

// ─── In-memory network ───────────────────────────────────────────────────────

/// First port handed out for binds to port 0.
const EPHEMERAL_PORT_START: u16 = 49152;

#[derive(Debug, Default)]
struct Switch {
    mailboxes: HashMap<u16, VecDeque<(Bytes, SocketAddr)>>,
    invalid: HashSet<u16>,
    next_ephemeral: u16,
}

/// In-process datagram network. Cheap to clone; clones share the switch.
///
/// Sockets are addressed by port only; every socket reports a loopback
/// local address.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    switch: Arc<Mutex<Switch>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Switch> {
        self.switch.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Revoke the allocation of the socket bound to `addr`'s port.
    pub fn invalidate(&self, addr: SocketAddr) {
        self.lock().invalid.insert(addr.port());
    }

    /// Datagrams waiting to be read by the socket on `addr`'s port.
    pub fn pending(&self, addr: SocketAddr) -> usize {
        self.lock()
            .mailboxes
            .get(&addr.port())
            .map_or(0, VecDeque::len)
    }

    /// Throw away everything waiting for `addr`'s port, as if lost in
    /// transit. Returns the number of datagrams discarded.
    pub fn discard(&self, addr: SocketAddr) -> usize {
        self.lock()
            .mailboxes
            .get_mut(&addr.port())
            .map_or(0, |mailbox| mailbox.drain(..).count())
    }

    /// Whether a socket is bound to `addr`'s port.
    pub fn is_bound(&self, addr: SocketAddr) -> bool {
        self.lock().mailboxes.contains_key(&addr.port())
    }
}

impl SocketBinder for MemoryNetwork {
    fn bind(&mut self, addr: SocketAddr) -> io::Result<Box<dyn DatagramSocket>> {
        let mut switch = self.lock();
        let port = if addr.port() == 0 {
            let mut candidate = switch.next_ephemeral.max(EPHEMERAL_PORT_START);
            while switch.mailboxes.contains_key(&candidate) {
                candidate = candidate.checked_add(1).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::AddrNotAvailable, "no ephemeral ports left")
                })?;
            }
            switch.next_ephemeral = candidate.saturating_add(1);
            candidate
        } else {
            addr.port()
        };
        if switch.mailboxes.contains_key(&port) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("port {port} already bound"),
            ));
        }
        switch.mailboxes.insert(port, VecDeque::new());
        switch.invalid.remove(&port);
        Ok(Box::new(MemorySocket {
            network: self.clone(),
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
        }))
    }
}

/// Socket bound on a [`MemoryNetwork`]. Unbinds on drop.
#[derive(Debug)]
pub struct MemorySocket {
    network: MemoryNetwork,
    addr: SocketAddr,
}

impl DatagramSocket for MemorySocket {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }

    fn send_to(&mut self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        let mut switch = self.network.lock();
        // Nobody listening: the datagram vanishes, as with UDP.
        if let Some(mailbox) = switch.mailboxes.get_mut(&target.port()) {
            mailbox.push_back((Bytes::copy_from_slice(buf), self.addr));
        }
        Ok(buf.len())
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let mut switch = self.network.lock();
        let Some((data, from)) = switch
            .mailboxes
            .get_mut(&self.addr.port())
            .and_then(VecDeque::pop_front)
        else {
            return Ok(None);
        };
        // Truncate like a real socket would.
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(Some((n, from)))
    }

    fn status(&self) -> SocketStatus {
        if self.network.lock().invalid.contains(&self.addr.port()) {
            SocketStatus::AllocationInvalid
        } else {
            SocketStatus::Ok
        }
    }
}

impl Drop for MemorySocket {
    fn drop(&mut self) {
        let mut switch = self.network.lock();
        switch.mailboxes.remove(&self.addr.port());
        switch.invalid.remove(&self.addr.port());
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
