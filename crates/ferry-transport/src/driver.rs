//! # Network Driver
//!
//! A small connection engine over a [`DatagramSocket`]. One `update()` call:
//!
//! 1. reads up to `max_packet_queue_size` inbound datagrams and dispatches
//!    them (handshake, ACKs, data through the pipeline stages);
//! 2. advances every session (connect retries, heartbeats, timeouts) and
//!    queues reliable retransmissions and ACKs;
//! 3. flushes the outbox onto the socket, through the network simulator
//!    when one is active.
//!
//! Connections are addressed by generation-tagged [`ConnectionId`]s, so a
//! recycled slot never aliases a dead connection.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use quanta::{Clock, Instant};
use rand::rngs::SmallRng;
use rand::{RngExt as _, SeedableRng};
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::error::{error_to_string, StatusCode};
use crate::pipeline::fragment::{FragmentAssembler, Fragmenter};
use crate::pipeline::reliable::{ReliableReceiver, ReliableSender};
use crate::pipeline::sequenced::SequencedFilter;
use crate::pipeline::Pipeline;
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::session::{
    ConnectionState, DisconnectReason, RttTracker, Session, SessionAction, SessionTimeouts,
};
use crate::simulator::{simulator_available, NetworkSimulator};
use crate::socket::{DatagramSocket, SocketBinder, SocketStatus};
use crate::stats::ConnectionStats;
use crate::wire::{Body, DataPacket, Datagram, MAX_DATAGRAM_PAYLOAD};

/// Receive buffer size. Anything longer than the MTU is truncated and then
/// rejected by the decoder.
const RECV_BUFFER_SIZE: usize = 2048;

/// Event produced by [`NetworkDriver::update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// An outgoing connection completed its handshake.
    Connect(ConnectionId),
    /// A connection was torn down by the peer or by a timeout.
    Disconnect {
        connection: ConnectionId,
        reason: DisconnectReason,
    },
    /// A complete message arrived on `pipeline`.
    Data {
        connection: ConnectionId,
        pipeline: Pipeline,
        payload: Bytes,
    },
}

// ─── Connection ──────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Connection {
    session: Session,
    unreliable_tx: Fragmenter,
    unreliable_rx: FragmentAssembler,
    sequenced_tx: Fragmenter,
    sequenced_rx: FragmentAssembler,
    sequenced_filter: SequencedFilter,
    reliable_tx: ReliableSender,
    reliable_rx: ReliableReceiver,
    rtt: RttTracker,
    datagrams_sent: u64,
    datagrams_received: u64,
    bytes_sent: u64,
    bytes_received: u64,
}

impl Connection {
    fn new(session: Session, max_message: usize) -> Self {
        Connection {
            session,
            unreliable_tx: Fragmenter::new(Pipeline::UnreliableFragmented),
            unreliable_rx: FragmentAssembler::new(max_message),
            sequenced_tx: Fragmenter::new(Pipeline::UnreliableSequencedFragmented),
            sequenced_rx: FragmentAssembler::new(max_message),
            sequenced_filter: SequencedFilter::new(),
            reliable_tx: ReliableSender::new(),
            reliable_rx: ReliableReceiver::new(),
            rtt: RttTracker::new(),
            datagrams_sent: 0,
            datagrams_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    /// Run an inbound data packet through its pipeline's receive stages.
    fn deliver(&mut self, pkt: DataPacket) -> Vec<Bytes> {
        match pkt.pipeline {
            Pipeline::UnreliableFragmented => self
                .unreliable_rx
                .process(pkt)
                .map(|m| m.payload)
                .into_iter()
                .collect(),
            Pipeline::UnreliableSequencedFragmented => self
                .sequenced_rx
                .process(pkt)
                .filter(|m| self.sequenced_filter.accept(m.sequence))
                .map(|m| m.payload)
                .into_iter()
                .collect(),
            Pipeline::ReliableSequenced => {
                self.reliable_rx.receive(pkt.sequence.value(), pkt.payload)
            }
        }
    }

    fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            datagrams_sent: self.datagrams_sent,
            datagrams_received: self.datagrams_received,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            reliable_sent: self.reliable_tx.packets_sent(),
            reliable_acked: self.reliable_tx.packets_acked(),
            retransmissions: self.reliable_tx.retransmissions(),
            in_flight: self.reliable_tx.in_flight() as u64,
            duplicates: self.reliable_rx.duplicates(),
            stale_dropped: self.sequenced_filter.dropped(),
            srtt_us: self.rtt.srtt_us() as u64,
            last_rtt_us: self.rtt.last_rtt_us() as u64,
            min_rtt_us: self.rtt.min_rtt_us() as u64,
            rto_us: self.rtt.rto().as_micros() as u64,
        }
    }
}

/// Encode `body` for `conn`'s peer and append it to the outbox.
fn enqueue(
    outbox: &mut VecDeque<(Bytes, SocketAddr)>,
    conn: &mut Connection,
    body: Body,
    now: Instant,
) {
    // ConnectRequest travels before the peer's token is known.
    let token = match body {
        Body::ConnectRequest { .. } => 0,
        _ => conn.session.remote_token,
    };
    let datagram = Datagram::new(token, body).to_bytes();
    conn.datagrams_sent += 1;
    conn.session.touch_sent(now);
    outbox.push_back((datagram, conn.session.remote));
}

// ─── Driver ──────────────────────────────────────────────────────────────────

/// Connection engine owned by the transport.
pub struct NetworkDriver {
    socket: Option<Box<dyn DatagramSocket>>,
    clock: Clock,
    listening: bool,
    registry: ConnectionRegistry<Connection>,
    by_addr: HashMap<SocketAddr, ConnectionId>,
    pending_accept: VecDeque<ConnectionId>,
    events: VecDeque<DriverEvent>,
    outbox: VecDeque<(Bytes, SocketAddr)>,
    simulator: Option<NetworkSimulator>,
    token_rng: SmallRng,
    recv_buf: Vec<u8>,
    timeouts: SessionTimeouts,
    max_packet_queue_size: usize,
    fragmentation_capacity: usize,
}

impl NetworkDriver {
    pub fn new(config: &TransportConfig, clock: Clock) -> Self {
        let simulator = if config.simulator.is_active() {
            if simulator_available() {
                info!(
                    delay_ms = config.simulator.packet_delay_ms,
                    jitter_ms = config.simulator.packet_jitter_ms,
                    drop_rate = config.simulator.packet_drop_rate,
                    "network simulator enabled"
                );
                Some(NetworkSimulator::new(config.simulator))
            } else {
                warn!("network simulator parameters ignored in this build");
                None
            }
        } else {
            None
        };

        NetworkDriver {
            socket: None,
            clock,
            listening: false,
            registry: ConnectionRegistry::new(),
            by_addr: HashMap::new(),
            pending_accept: VecDeque::new(),
            events: VecDeque::new(),
            outbox: VecDeque::new(),
            simulator,
            token_rng: SmallRng::seed_from_u64(rand::random()),
            recv_buf: vec![0u8; RECV_BUFFER_SIZE],
            timeouts: config.session_timeouts(),
            max_packet_queue_size: config.max_packet_queue_size,
            fragmentation_capacity: config.fragmentation_capacity(),
        }
    }

    /// Bind the driver's socket. Returns the bound local address.
    pub fn bind(
        &mut self,
        binder: &mut dyn SocketBinder,
        addr: SocketAddr,
    ) -> io::Result<SocketAddr> {
        let socket = binder.bind(addr)?;
        let local = socket.local_addr()?;
        debug!(%local, "socket bound");
        self.socket = Some(socket);
        Ok(local)
    }

    /// Accept inbound connection requests from now on.
    pub fn listen(&mut self) -> Result<(), StatusCode> {
        if self.socket.is_none() {
            return Err(StatusCode::NetworkStateMismatch);
        }
        self.listening = true;
        Ok(())
    }

    /// Start connecting to `remote`. The first ConnectRequest goes out on
    /// the next [`update`](Self::update).
    pub fn connect(&mut self, remote: SocketAddr) -> Result<ConnectionId, StatusCode> {
        if self.socket.is_none() {
            return Err(StatusCode::NetworkStateMismatch);
        }
        if remote.ip().is_unspecified() || remote.port() == 0 {
            return Err(StatusCode::NetworkArgumentMismatch);
        }
        let token = self.next_token();
        let session = Session::outgoing(remote, token, self.timeouts, self.clock.now());
        let id = self
            .registry
            .insert(Connection::new(session, self.fragmentation_capacity));
        self.by_addr.insert(remote, id);
        debug!(connection = %id, %remote, "connecting");
        Ok(id)
    }

    /// Next inbound connection not yet handed to the caller.
    pub fn accept(&mut self) -> Option<ConnectionId> {
        while let Some(id) = self.pending_accept.pop_front() {
            if self.registry.contains(id) {
                return Some(id);
            }
        }
        None
    }

    /// Close a connection locally. Notifies the peer when possible; raises
    /// no event.
    pub fn disconnect(&mut self, id: ConnectionId) -> Result<(), StatusCode> {
        let Some(mut conn) = self.registry.remove(id) else {
            return Err(StatusCode::NetworkSendHandleInvalid);
        };
        self.forget(id, conn.session.remote);
        if conn.session.remote_token != 0 {
            let now = self.clock.now();
            enqueue(&mut self.outbox, &mut conn, Body::Disconnect, now);
            self.flush_send();
        }
        debug!(connection = %id, "disconnected locally");
        Ok(())
    }

    /// Driver-level state of `id`. Unknown and stale ids are `Disconnected`.
    pub fn connection_state(&self, id: ConnectionId) -> ConnectionState {
        self.registry
            .get(id)
            .map_or(ConnectionState::Disconnected, |c| c.session.state)
    }

    /// Largest payload a single [`send`](Self::send) accepts on `pipeline`.
    pub fn payload_capacity(&self, pipeline: Pipeline) -> usize {
        if pipeline.is_reliable() {
            MAX_DATAGRAM_PAYLOAD
        } else {
            self.fragmentation_capacity
        }
    }

    /// Hand one payload to `pipeline`. Returns the number of payload bytes
    /// accepted, which is always the whole payload on success.
    pub fn send(
        &mut self,
        pipeline: Pipeline,
        id: ConnectionId,
        payload: &[u8],
    ) -> Result<usize, StatusCode> {
        let capacity = self.payload_capacity(pipeline);
        let queued = self.outbox.len();
        let max_queued = self.max_packet_queue_size;
        let Some(conn) = self.registry.get_mut(id) else {
            return Err(StatusCode::NetworkSendHandleInvalid);
        };
        if conn.session.state != ConnectionState::Connected {
            return Err(StatusCode::NetworkStateMismatch);
        }
        if payload.len() > capacity {
            return Err(StatusCode::NetworkPacketOverflow);
        }

        let datagrams = payload.len().div_ceil(MAX_DATAGRAM_PAYLOAD).max(1);
        if queued + datagrams > max_queued {
            return Err(StatusCode::NetworkSendQueueFull);
        }

        let now = self.clock.now();
        let payload_bytes = Bytes::copy_from_slice(payload);
        let packets = match pipeline {
            Pipeline::UnreliableFragmented => conn.unreliable_tx.split(payload_bytes),
            Pipeline::UnreliableSequencedFragmented => conn.sequenced_tx.split(payload_bytes),
            Pipeline::ReliableSequenced => vec![conn.reliable_tx.send(payload_bytes, now)?],
        };
        for pkt in packets {
            enqueue(&mut self.outbox, conn, Body::Data(pkt), now);
        }
        conn.bytes_sent += payload.len() as u64;
        Ok(payload.len())
    }

    /// Put queued datagrams on the wire.
    pub fn flush_send(&mut self) {
        let Some(socket) = self.socket.as_mut() else {
            self.outbox.clear();
            return;
        };
        let ready: Vec<(Bytes, SocketAddr)> = match self.simulator.as_mut() {
            Some(sim) => {
                let now = self.clock.now();
                for (datagram, target) in self.outbox.drain(..) {
                    sim.submit(datagram, target, now);
                }
                sim.drain_ready(now)
            }
            None => self.outbox.drain(..).collect(),
        };
        for (datagram, target) in ready {
            if let Err(e) = socket.send_to(&datagram, target) {
                warn!(%target, error = %e, "datagram send failed");
            }
        }
    }

    /// Run one driver step.
    pub fn update(&mut self) {
        let now = self.clock.now();
        self.receive(now);
        self.advance(now);
        self.flush_send();
    }

    pub fn pop_event(&mut self) -> Option<DriverEvent> {
        self.events.pop_front()
    }

    /// Health of the socket allocation. `Ok` while unbound.
    pub fn socket_status(&self) -> SocketStatus {
        self.socket
            .as_ref()
            .map_or(SocketStatus::Ok, |s| s.status())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn is_bound(&self) -> bool {
        self.socket.is_some()
    }

    /// Every live connection, in slot order.
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.registry.ids()
    }

    pub fn stats(&self, id: ConnectionId) -> Option<ConnectionStats> {
        self.registry.get(id).map(Connection::stats)
    }

    /// Most recent RTT sample for `id`, zero before the first one.
    pub fn current_rtt(&self, id: ConnectionId) -> Option<Duration> {
        self.registry
            .get(id)
            .map(|c| Duration::from_micros(c.rtt.last_rtt_us() as u64))
    }

    /// Release the socket and every connection without notifying peers.
    pub fn dispose(&mut self) {
        self.socket = None;
        self.listening = false;
        self.registry.clear();
        self.by_addr.clear();
        self.pending_accept.clear();
        self.events.clear();
        self.outbox.clear();
        if let Some(sim) = self.simulator.as_mut() {
            *sim = NetworkSimulator::new(sim.params());
        }
    }

    // ─── Internals ───────────────────────────────────────────────────────

    fn next_token(&mut self) -> u32 {
        self.token_rng.random_range(1..=u32::MAX)
    }

    fn receive(&mut self, now: Instant) {
        for _ in 0..self.max_packet_queue_size {
            let result = match self.socket.as_mut() {
                Some(socket) => socket.recv_from(&mut self.recv_buf),
                None => return,
            };
            let (len, from) = match result {
                Ok(Some(v)) => v,
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "socket receive failed");
                    return;
                }
            };
            let mut buf = Bytes::copy_from_slice(&self.recv_buf[..len]);
            match Datagram::decode(&mut buf) {
                Ok(datagram) => self.handle_datagram(datagram, from, now),
                Err(code) => debug!(%from, error = %code, "dropping undecodable datagram"),
            }
        }
    }

    fn handle_datagram(&mut self, datagram: Datagram, from: SocketAddr, now: Instant) {
        if let Body::ConnectRequest { client_token } = datagram.body {
            self.handle_connect_request(client_token, from, now);
            return;
        }

        let Some(&id) = self.by_addr.get(&from) else {
            debug!(%from, kind = ?datagram.body.kind(), "datagram from unknown peer");
            return;
        };
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        if datagram.token != conn.session.local_token {
            debug!(
                error = %error_to_string(StatusCode::NetworkIdMismatch.code(), id),
                "dropping stale datagram"
            );
            return;
        }
        conn.session.touch_received(now);
        conn.datagrams_received += 1;

        match datagram.body {
            Body::ConnectAccept { server_token } => {
                if conn.session.on_accept(server_token, now) {
                    info!(connection = %id, remote = %from, "connected");
                    self.events.push_back(DriverEvent::Connect(id));
                }
            }
            Body::Disconnect => {
                self.drop_connection(id, DisconnectReason::ClosedByRemote);
            }
            Body::Ack(ack) => {
                if let Some(sample) = conn.reliable_tx.on_ack(&ack, now) {
                    conn.rtt.on_sample(sample);
                }
            }
            Body::Data(pkt) => {
                if conn.session.state != ConnectionState::Connected {
                    return;
                }
                let pipeline = pkt.pipeline;
                for payload in conn.deliver(pkt) {
                    conn.bytes_received += payload.len() as u64;
                    self.events.push_back(DriverEvent::Data {
                        connection: id,
                        pipeline,
                        payload,
                    });
                }
            }
            Body::Heartbeat | Body::ConnectRequest { .. } => {}
        }
    }

    fn handle_connect_request(&mut self, client_token: u32, from: SocketAddr, now: Instant) {
        if !self.listening {
            return;
        }
        if let Some(&existing) = self.by_addr.get(&from) {
            if let Some(conn) = self.registry.get_mut(existing) {
                if conn.session.remote_token == client_token {
                    // Our accept was lost; answer again.
                    conn.session.touch_received(now);
                    let accept = Body::ConnectAccept {
                        server_token: conn.session.local_token,
                    };
                    enqueue(&mut self.outbox, conn, accept, now);
                    return;
                }
            }
            // Same address, new token: the peer restarted.
            self.drop_connection(existing, DisconnectReason::ClosedByRemote);
        }

        let local_token = self.next_token();
        let session = Session::incoming(from, local_token, client_token, self.timeouts, now);
        let mut conn = Connection::new(session, self.fragmentation_capacity);
        let accept = Body::ConnectAccept {
            server_token: local_token,
        };
        enqueue(&mut self.outbox, &mut conn, accept, now);
        let id = self.registry.insert(conn);
        self.by_addr.insert(from, id);
        self.pending_accept.push_back(id);
        info!(connection = %id, remote = %from, "connection request accepted");
    }

    /// Session timers, retransmissions and ACKs for every connection.
    fn advance(&mut self, now: Instant) {
        let mut drops = Vec::new();
        for (id, conn) in self.registry.iter_mut() {
            match conn.session.poll(now) {
                SessionAction::None => {}
                SessionAction::SendConnectRequest => {
                    let request = Body::ConnectRequest {
                        client_token: conn.session.local_token,
                    };
                    enqueue(&mut self.outbox, conn, request, now);
                }
                SessionAction::SendHeartbeat => {
                    enqueue(&mut self.outbox, conn, Body::Heartbeat, now);
                }
                SessionAction::Drop(reason) => {
                    drops.push((id, reason));
                    continue;
                }
            }
            if conn.session.state != ConnectionState::Connected {
                continue;
            }
            let rto = conn.rtt.rto();
            for pkt in conn.reliable_tx.poll_retransmits(now, rto) {
                enqueue(&mut self.outbox, conn, Body::Data(pkt), now);
            }
            if let Some(ack) = conn.reliable_rx.take_ack() {
                enqueue(&mut self.outbox, conn, Body::Ack(ack), now);
            }
        }
        for (id, reason) in drops {
            warn!(connection = %id, ?reason, "connection dropped");
            self.drop_connection(id, reason);
        }
    }

    /// Remove a connection and report it, unless the caller never saw it.
    fn drop_connection(&mut self, id: ConnectionId, reason: DisconnectReason) {
        let Some(conn) = self.registry.remove(id) else {
            return;
        };
        let was_pending = self.pending_accept.contains(&id);
        self.forget(id, conn.session.remote);
        if !was_pending {
            self.events.push_back(DriverEvent::Disconnect {
                connection: id,
                reason,
            });
        }
    }

    fn forget(&mut self, id: ConnectionId, remote: SocketAddr) {
        if self.by_addr.get(&remote) == Some(&id) {
            self.by_addr.remove(&remote);
        }
        self.pending_accept.retain(|&p| p != id);
    }
}

impl std::fmt::Debug for NetworkDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkDriver")
            .field("bound", &self.socket.is_some())
            .field("listening", &self.listening)
            .field("connections", &self.registry.len())
            .field("outbox", &self.outbox.len())
            .finish()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::MemoryNetwork;
    use std::sync::Arc;

    fn config() -> TransportConfig {
        TransportConfig::default()
    }

    struct Pair {
        net: MemoryNetwork,
        mock: Arc<quanta::Mock>,
        server: NetworkDriver,
        client: NetworkDriver,
        server_addr: SocketAddr,
    }

    fn pair_with(config: TransportConfig) -> Pair {
        let (clock, mock) = Clock::mock();
        let mut net = MemoryNetwork::new();
        let mut server = NetworkDriver::new(&config, clock.clone());
        let server_addr = server
            .bind(&mut net, "127.0.0.1:7777".parse().unwrap())
            .unwrap();
        server.listen().unwrap();
        let mut client = NetworkDriver::new(&config, clock);
        client
            .bind(&mut net, "0.0.0.0:0".parse().unwrap())
            .unwrap();
        Pair {
            net,
            mock,
            server,
            client,
            server_addr,
        }
    }

    fn tick(p: &mut Pair) {
        p.client.update();
        p.server.update();
        p.mock.increment(Duration::from_millis(10));
    }

    /// Connect and return `(client-side id, server-side id)`.
    fn handshake(p: &mut Pair) -> (ConnectionId, ConnectionId) {
        let cid = p.client.connect(p.server_addr).unwrap();
        let mut sid = None;
        for _ in 0..5 {
            tick(p);
            if sid.is_none() {
                sid = p.server.accept();
            }
        }
        assert_eq!(p.client.pop_event(), Some(DriverEvent::Connect(cid)));
        (cid, sid.expect("server never accepted"))
    }

    #[test]
    fn handshake_connects_both_sides() {
        let mut p = pair_with(config());
        let (cid, sid) = handshake(&mut p);
        assert_eq!(p.client.connection_state(cid), ConnectionState::Connected);
        assert_eq!(p.server.connection_state(sid), ConnectionState::Connected);
        assert_eq!(p.server.accept(), None);
    }

    #[test]
    fn connect_rejects_unspecified_endpoint() {
        let mut p = pair_with(config());
        assert_eq!(
            p.client.connect("0.0.0.0:7777".parse().unwrap()),
            Err(StatusCode::NetworkArgumentMismatch)
        );
        assert_eq!(
            p.client.connect("127.0.0.1:0".parse().unwrap()),
            Err(StatusCode::NetworkArgumentMismatch)
        );
    }

    #[test]
    fn send_before_connected_is_a_state_mismatch() {
        let mut p = pair_with(config());
        let cid = p.client.connect(p.server_addr).unwrap();
        assert_eq!(
            p.client.send(Pipeline::ReliableSequenced, cid, b"x"),
            Err(StatusCode::NetworkStateMismatch)
        );
        let stale = ConnectionId::from_raw(u64::MAX);
        assert_eq!(
            p.client.send(Pipeline::ReliableSequenced, stale, b"x"),
            Err(StatusCode::NetworkSendHandleInvalid)
        );
    }

    #[test]
    fn data_flows_on_every_pipeline() {
        let mut p = pair_with(config());
        let (cid, sid) = handshake(&mut p);
        for pipeline in Pipeline::ALL {
            p.client.send(pipeline, cid, b"hello").unwrap();
        }
        tick(&mut p);
        let mut got = Vec::new();
        while let Some(ev) = p.server.pop_event() {
            if let DriverEvent::Data {
                connection,
                pipeline,
                payload,
            } = ev
            {
                assert_eq!(connection, sid);
                assert_eq!(payload.as_ref(), b"hello");
                got.push(pipeline);
            }
        }
        assert_eq!(got.len(), 3);
    }

    #[test]
    fn unreliable_payload_is_fragmented_and_reassembled() {
        let mut p = pair_with(config());
        let (cid, _) = handshake(&mut p);
        let big: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        p.client
            .send(Pipeline::UnreliableFragmented, cid, &big)
            .unwrap();
        tick(&mut p);
        match p.server.pop_event() {
            Some(DriverEvent::Data { payload, .. }) => assert_eq!(payload.as_ref(), &big[..]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn oversized_payload_overflows() {
        let mut p = pair_with(config());
        let (cid, _) = handshake(&mut p);
        let big = vec![0u8; MAX_DATAGRAM_PAYLOAD + 1];
        assert_eq!(
            p.client.send(Pipeline::ReliableSequenced, cid, &big),
            Err(StatusCode::NetworkPacketOverflow)
        );
    }

    #[test]
    fn outbox_bound_reports_queue_full() {
        let mut cfg = config();
        cfg.max_packet_queue_size = 4;
        let mut p = pair_with(cfg);
        let (cid, _) = handshake(&mut p);
        for _ in 0..4 {
            p.client
                .send(Pipeline::UnreliableFragmented, cid, b"x")
                .unwrap();
        }
        assert_eq!(
            p.client.send(Pipeline::UnreliableFragmented, cid, b"x"),
            Err(StatusCode::NetworkSendQueueFull)
        );
    }

    #[test]
    fn reliable_retransmits_after_loss() {
        let mut p = pair_with(config());
        let (cid, sid) = handshake(&mut p);
        p.client
            .send(Pipeline::ReliableSequenced, cid, b"must arrive")
            .unwrap();
        p.client.flush_send();
        assert_eq!(p.net.discard(p.server_addr), 1);

        p.mock.increment(Duration::from_millis(300));
        for _ in 0..3 {
            tick(&mut p);
        }
        let stats = p.client.stats(cid).unwrap();
        assert!(stats.retransmissions >= 1);
        assert_eq!(stats.in_flight, 0);
        assert!(p.server.stats(sid).is_some());
    }

    #[test]
    fn peer_disconnect_is_reported() {
        let mut p = pair_with(config());
        let (cid, sid) = handshake(&mut p);
        p.client.disconnect(cid).unwrap();
        assert_eq!(p.client.connection_state(cid), ConnectionState::Disconnected);
        assert_eq!(p.client.pop_event(), None);
        tick(&mut p);
        assert_eq!(
            p.server.pop_event(),
            Some(DriverEvent::Disconnect {
                connection: sid,
                reason: DisconnectReason::ClosedByRemote
            })
        );
    }

    #[test]
    fn silent_peer_times_out() {
        let mut cfg = config();
        cfg.disconnect_timeout = Duration::from_millis(200);
        let mut p = pair_with(cfg);
        let (_, sid) = handshake(&mut p);
        p.client.dispose();
        for _ in 0..30 {
            p.server.update();
            p.mock.increment(Duration::from_millis(10));
        }
        assert_eq!(
            p.server.pop_event(),
            Some(DriverEvent::Disconnect {
                connection: sid,
                reason: DisconnectReason::Timeout
            })
        );
    }

    #[test]
    fn unanswered_connect_gives_up() {
        let mut cfg = config();
        cfg.connect_timeout = Duration::from_millis(10);
        cfg.max_connect_attempts = 3;
        let (clock, mock) = Clock::mock();
        let mut net = MemoryNetwork::new();
        let mut client = NetworkDriver::new(&cfg, clock);
        client.bind(&mut net, "0.0.0.0:0".parse().unwrap()).unwrap();
        let cid = client.connect("127.0.0.1:9999".parse().unwrap()).unwrap();
        for _ in 0..10 {
            client.update();
            mock.increment(Duration::from_millis(10));
        }
        assert_eq!(
            client.pop_event(),
            Some(DriverEvent::Disconnect {
                connection: cid,
                reason: DisconnectReason::MaxConnectionAttempts
            })
        );
    }

    #[test]
    fn invalidated_allocation_surfaces_in_status() {
        let mut p = pair_with(config());
        assert_eq!(p.server.socket_status(), SocketStatus::Ok);
        p.net.invalidate(p.server_addr);
        assert_eq!(p.server.socket_status(), SocketStatus::AllocationInvalid);
    }
}
