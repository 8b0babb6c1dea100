//! # Transport
//!
//! The application-facing side: batches outbound messages per
//! `(connection, pipeline)` send target, drives the [`NetworkDriver`] once
//! per [`Transport::update`] and turns driver events into [`NetworkEvent`]s.
//!
//! Outbound messages sit in a [`BatchedSendQueue`] until the next update
//! flushes them. The reliable pipeline carries the queue as a raw byte
//! stream; each connection's [`BatchedReceiveQueue`] recovers the message
//! boundaries on the far side. Unreliable pipelines carry whole
//! length-prefixed messages per packet.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use quanta::{Clock, Instant};
use tracing::{debug, error, info};

use crate::config::{SimulatorParameters, TransportConfig};
use crate::driver::{DriverEvent, NetworkDriver};
use crate::error::{error_to_string, StatusCode, TransportError};
use crate::pipeline::{select_send_pipeline, DeliveryGuarantee, Pipeline};
use crate::queue::{BatchedReceiveQueue, BatchedSendQueue, PacketWriter};
use crate::registry::ConnectionId;
use crate::session::ConnectionState;
use crate::socket::{SocketBinder, SocketStatus, UdpBinder};
use crate::stats::ConnectionStats;

// ─── Public Types ────────────────────────────────────────────────────────────

/// Transport-level lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    /// Server started and accepting connections.
    Listening,
    /// Client connected to its server.
    Connected,
}

/// What happened, as seen by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    Connect(ConnectionId),
    Disconnect(ConnectionId),
    Data(ConnectionId, Bytes),
    /// The socket allocation is gone; every connection with it.
    TransportFailure,
}

/// A [`NetworkEvent`] stamped with the time since the transport was created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub event: NetworkEvent,
    pub receive_time: Duration,
}

/// Key of a batched send queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SendTarget {
    pub connection: ConnectionId,
    pub pipeline: Pipeline,
}

#[derive(Debug, Clone, Copy, Default)]
struct LossSample {
    reliable_sent: u64,
    retransmissions: u64,
    loss: f32,
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Reliable-messaging UDP transport. Poll it with [`update`](Self::update)
/// once per tick, then drain [`poll_event`](Self::poll_event).
pub struct Transport {
    config: TransportConfig,
    binder: Box<dyn SocketBinder>,
    clock: Clock,
    started_at: Instant,
    driver: Option<NetworkDriver>,
    state: TransportState,
    server_connection: Option<ConnectionId>,
    send_queues: HashMap<SendTarget, BatchedSendQueue>,
    receive_queues: HashMap<ConnectionId, BatchedReceiveQueue>,
    events: VecDeque<TransportEvent>,
    loss_cache: HashMap<ConnectionId, LossSample>,
}

impl Transport {
    /// A transport over real UDP sockets.
    pub fn new(config: TransportConfig) -> Self {
        Self::with_parts(config, Box::new(UdpBinder), Clock::new())
    }

    /// A transport over any socket binder, on the given clock.
    pub fn with_parts(config: TransportConfig, binder: Box<dyn SocketBinder>, clock: Clock) -> Self {
        let started_at = clock.now();
        Transport {
            config,
            binder,
            clock,
            started_at,
            driver: None,
            state: TransportState::Disconnected,
            server_connection: None,
            send_queues: HashMap::new(),
            receive_queues: HashMap::new(),
            events: VecDeque::new(),
            loss_cache: HashMap::new(),
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Bind an ephemeral local endpoint and start connecting to the
    /// configured server. `Connected` follows with the `Connect` event.
    pub fn start_client(&mut self) -> Result<(), TransportError> {
        if self.driver.is_some() {
            return Err(TransportError::AlreadyStarted);
        }
        let result = self.client_bind_and_connect();
        if let Err(e) = &result {
            error!(error = %e, "failed to start client");
            self.shutdown();
        }
        result
    }

    /// Bind the listen endpoint and start accepting connections.
    pub fn start_server(&mut self) -> Result<(), TransportError> {
        if self.driver.is_some() {
            return Err(TransportError::AlreadyStarted);
        }
        let result = self.server_bind_and_listen();
        if let Err(e) = &result {
            error!(error = %e, "failed to start server");
            self.shutdown();
        }
        result
    }

    fn client_bind_and_connect(&mut self) -> Result<(), TransportError> {
        self.config.validate()?;
        let server = self.config.connection.server_endpoint()?;
        let local = match server.ip() {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let driver = self
            .driver
            .insert(NetworkDriver::new(&self.config, self.clock.clone()));
        let bound = driver.bind(self.binder.as_mut(), local)?;
        let id = driver.connect(server).map_err(TransportError::Status)?;
        self.server_connection = Some(id);
        info!(local = %bound, %server, connection = %id, "client connecting");
        Ok(())
    }

    fn server_bind_and_listen(&mut self) -> Result<(), TransportError> {
        self.config.validate()?;
        let listen = self.config.connection.listen_endpoint()?;
        let driver = self
            .driver
            .insert(NetworkDriver::new(&self.config, self.clock.clone()));
        let bound = driver.bind(self.binder.as_mut(), listen)?;
        driver.listen().map_err(TransportError::Status)?;
        self.state = TransportState::Listening;
        info!(local = %bound, "server listening");
        Ok(())
    }

    /// Flush everything, notify every peer and release the driver.
    pub fn shutdown(&mut self) {
        if self.driver.is_none() {
            return;
        }
        self.flush_all_send_queues();
        if let Some(driver) = self.driver.as_mut() {
            for id in driver.connections() {
                let _ = driver.disconnect(id);
            }
            driver.update();
            driver.dispose();
        }
        self.driver = None;
        self.send_queues.clear();
        self.receive_queues.clear();
        self.loss_cache.clear();
        self.server_connection = None;
        self.state = TransportState::Disconnected;
        debug!("transport shut down");
    }

    /// Client only: close the connection to the server and raise a local
    /// `Disconnect` event.
    pub fn disconnect_local_client(&mut self) {
        if self.state != TransportState::Connected {
            return;
        }
        let Some(server) = self.server_connection else {
            return;
        };
        self.flush_send_queues_for(server);
        let disconnected = self
            .driver
            .as_mut()
            .is_some_and(|d| d.disconnect(server).is_ok());
        if disconnected {
            self.state = TransportState::Disconnected;
            self.teardown_queues(server);
            self.push_event(NetworkEvent::Disconnect(server));
        }
    }

    /// Client only: abandon the server connection whether or not the
    /// handshake has finished, and report it as a `Disconnect`.
    fn drop_server_connection(&mut self, server: ConnectionId) {
        self.flush_send_queues_for(server);
        if let Some(driver) = self.driver.as_mut() {
            let _ = driver.disconnect(server);
        }
        self.teardown_queues(server);
        self.server_connection = None;
        self.state = TransportState::Disconnected;
        self.push_event(NetworkEvent::Disconnect(server));
    }

    /// Server only: close one client's connection. Raises no event.
    pub fn disconnect_remote_client(&mut self, connection: ConnectionId) {
        if self.state != TransportState::Listening {
            debug!(%connection, "disconnect_remote_client called while not listening");
            return;
        }
        self.flush_send_queues_for(connection);
        self.teardown_queues(connection);
        if let Some(driver) = self.driver.as_mut() {
            if driver.connection_state(connection) != ConnectionState::Disconnected {
                let _ = driver.disconnect(connection);
            }
        }
    }

    // ─── Sending ─────────────────────────────────────────────────────────

    /// Queue `payload` for `connection`. Transmission happens on the next
    /// [`update`](Self::update).
    ///
    /// Overflowing a reliable queue drops the connection: its stream can no
    /// longer be delivered intact. An overflowing unreliable queue is
    /// flushed once and the message silently lost if it still does not fit.
    pub fn send(
        &mut self,
        connection: ConnectionId,
        payload: &[u8],
        delivery: DeliveryGuarantee,
    ) -> Result<(), TransportError> {
        let Some(driver) = self.driver.as_ref() else {
            return Err(TransportError::NotStarted);
        };
        if driver.connection_state(connection) == ConnectionState::Disconnected {
            return Err(TransportError::UnknownConnection(connection));
        }

        let pipeline = select_send_pipeline(delivery);
        let max_payload = self.config.max_payload_size;
        if !pipeline.is_reliable() && payload.len() > max_payload {
            error!(
                size = payload.len(),
                max_payload_size = max_payload,
                "unreliable payload larger than the configured maximum payload size"
            );
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                max: max_payload,
            });
        }

        let target = SendTarget {
            connection,
            pipeline,
        };
        let capacity = self.config.send_queue_capacity();
        let queue = self
            .send_queues
            .entry(target)
            .or_insert_with(|| BatchedSendQueue::new(capacity));
        if queue.push_message(payload) {
            return Ok(());
        }

        if pipeline.is_reliable() {
            error!(
                %connection,
                size = payload.len(),
                max_send_queue_size = self.config.max_send_queue_size,
                "reliable send queue full; closing connection as reliability can't be maintained"
            );
            if self.server_connection == Some(connection) {
                self.drop_server_connection(connection);
            } else {
                self.disconnect_remote_client(connection);
                self.push_event(NetworkEvent::Disconnect(connection));
            }
            return Err(TransportError::SendQueueOverflow(connection));
        }

        // Make room by pushing everything out now, then try once more.
        if let Some(driver) = self.driver.as_mut() {
            driver.flush_send();
        }
        self.send_batched_messages(target);
        if let Some(queue) = self.send_queues.get_mut(&target) {
            if !queue.push_message(payload) {
                debug!(%connection, size = payload.len(), "unreliable message dropped");
            }
        }
        Ok(())
    }

    /// Drain one send queue into the driver until it is empty or the driver
    /// pushes back.
    fn send_batched_messages(&mut self, target: SendTarget) {
        let (Some(driver), Some(queue)) =
            (self.driver.as_mut(), self.send_queues.get_mut(&target))
        else {
            return;
        };
        // Sends made while the handshake is running wait here.
        if driver.connection_state(target.connection) != ConnectionState::Connected {
            return;
        }

        let mut writer = PacketWriter::new(driver.payload_capacity(target.pipeline));
        while !queue.is_empty() {
            writer.clear();
            let written = if target.pipeline.is_reliable() {
                queue.fill_writer_with_bytes(&mut writer)
            } else {
                queue.fill_writer_with_messages(&mut writer)
            };
            if written == 0 {
                break;
            }
            match driver.send(target.pipeline, target.connection, writer.as_slice()) {
                Ok(_) => queue.consume(written),
                Err(StatusCode::NetworkSendQueueFull) => return,
                Err(code) => {
                    error!(
                        error = %error_to_string(code.code(), target.connection),
                        pipeline = %target.pipeline,
                        "error sending batched messages"
                    );
                    queue.consume(written);
                }
            }
        }
    }

    fn flush_all_send_queues(&mut self) {
        let targets: Vec<SendTarget> = self.send_queues.keys().copied().collect();
        for target in targets {
            self.send_batched_messages(target);
        }
    }

    fn flush_send_queues_for(&mut self, connection: ConnectionId) {
        let targets: Vec<SendTarget> = self
            .send_queues
            .keys()
            .filter(|t| t.connection == connection)
            .copied()
            .collect();
        for target in targets {
            self.send_batched_messages(target);
        }
    }

    fn teardown_queues(&mut self, connection: ConnectionId) {
        self.receive_queues.remove(&connection);
        self.send_queues.retain(|t, _| t.connection != connection);
        self.loss_cache.remove(&connection);
    }

    // ─── Update Loop ─────────────────────────────────────────────────────

    /// Run one tick: flush send queues, step the driver, then collect
    /// connects, disconnects and data as events.
    pub fn update(&mut self) {
        if self.driver.is_none() {
            return;
        }
        self.flush_all_send_queues();

        let receive_time = self.receive_time();
        let Some(driver) = self.driver.as_mut() else {
            return;
        };
        driver.update();

        if driver.socket_status() == SocketStatus::AllocationInvalid {
            error!("transport failure: the socket allocation is no longer valid");
            self.events.push_back(TransportEvent {
                event: NetworkEvent::TransportFailure,
                receive_time,
            });
            return;
        }

        while let Some(id) = driver.accept() {
            self.events.push_back(TransportEvent {
                event: NetworkEvent::Connect(id),
                receive_time,
            });
        }

        let mut pending = Vec::new();
        while let Some(event) = driver.pop_event() {
            pending.push(event);
        }
        for event in pending {
            self.process_event(event);
        }
    }

    fn process_event(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::Connect(id) => {
                if self.state != TransportState::Listening {
                    self.state = TransportState::Connected;
                }
                self.push_event(NetworkEvent::Connect(id));
            }
            DriverEvent::Disconnect { connection, reason } => {
                match self.state {
                    TransportState::Connected => {
                        self.state = TransportState::Disconnected;
                        self.server_connection = None;
                    }
                    TransportState::Disconnected => {
                        error!(?reason, "failed to connect to server");
                        self.server_connection = None;
                    }
                    TransportState::Listening => {
                        debug!(%connection, ?reason, "client disconnected");
                    }
                }
                self.teardown_queues(connection);
                self.push_event(NetworkEvent::Disconnect(connection));
            }
            DriverEvent::Data {
                connection,
                pipeline,
                payload,
            } => self.receive_messages(connection, pipeline, &payload),
        }
    }

    fn receive_messages(&mut self, connection: ConnectionId, pipeline: Pipeline, chunk: &[u8]) {
        let mut messages = Vec::new();
        if pipeline.is_reliable() {
            let queue = self.receive_queues.entry(connection).or_default();
            queue.push_reader(chunk);
            while let Some(message) = queue.pop_message() {
                messages.push(message);
            }
        } else {
            let mut queue = BatchedReceiveQueue::new(chunk);
            while let Some(message) = queue.pop_message() {
                messages.push(message);
            }
        }
        for message in messages {
            self.push_event(NetworkEvent::Data(connection, message));
        }
    }

    fn receive_time(&self) -> Duration {
        self.clock.now().saturating_duration_since(self.started_at)
    }

    fn push_event(&mut self, event: NetworkEvent) {
        let receive_time = self.receive_time();
        self.events.push_back(TransportEvent {
            event,
            receive_time,
        });
    }

    /// Next event, or `None` when nothing happened.
    pub fn poll_event(&mut self) -> Option<TransportEvent> {
        self.events.pop_front()
    }

    /// Every pending event, oldest first.
    pub fn drain_events(&mut self) -> Vec<TransportEvent> {
        self.events.drain(..).collect()
    }

    // ─── Accessors ───────────────────────────────────────────────────────

    pub fn state(&self) -> TransportState {
        self.state
    }

    /// Client only: the connection to the server, once started.
    pub fn server_connection(&self) -> Option<ConnectionId> {
        self.server_connection
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Local socket address while started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.driver.as_ref().and_then(NetworkDriver::local_addr)
    }

    /// Driver-level state of one connection.
    pub fn connection_state(&self, connection: ConnectionId) -> ConnectionState {
        self.driver
            .as_ref()
            .map_or(ConnectionState::Disconnected, |d| d.connection_state(connection))
    }

    /// Most recent RTT sample, zero for unknown or not yet measured
    /// connections.
    pub fn current_rtt(&self, connection: ConnectionId) -> Duration {
        self.driver
            .as_ref()
            .and_then(|d| d.current_rtt(connection))
            .unwrap_or(Duration::ZERO)
    }

    /// Share of reliable transmissions that were retransmissions since the
    /// previous call. Repeats the previous value when nothing was sent in
    /// between.
    pub fn packet_loss(&mut self, connection: ConnectionId) -> f32 {
        let Some(stats) = self.connection_stats(connection) else {
            return 0.0;
        };
        let cache = self.loss_cache.entry(connection).or_default();
        let sent_delta = stats.reliable_sent.saturating_sub(cache.reliable_sent);
        let retx_delta = stats.retransmissions.saturating_sub(cache.retransmissions);
        if sent_delta == 0 && retx_delta == 0 {
            return cache.loss;
        }
        cache.reliable_sent = stats.reliable_sent;
        cache.retransmissions = stats.retransmissions;
        cache.loss = retx_delta as f32 / (sent_delta + retx_delta) as f32;
        cache.loss
    }

    pub fn connection_stats(&self, connection: ConnectionId) -> Option<ConnectionStats> {
        self.driver.as_ref().and_then(|d| d.stats(connection))
    }

    /// Number of live send queues.
    pub fn send_queue_count(&self) -> usize {
        self.send_queues.len()
    }

    /// Number of live reliable receive queues.
    pub fn receive_queue_count(&self) -> usize {
        self.receive_queues.len()
    }

    /// Whether any send or receive queue exists for `connection`.
    pub fn has_queues_for(&self, connection: ConnectionId) -> bool {
        self.receive_queues.contains_key(&connection)
            || self.send_queues.keys().any(|t| t.connection == connection)
    }

    /// Bytes waiting in `target`'s send queue.
    pub fn queued_bytes(&self, target: SendTarget) -> usize {
        self.send_queues.get(&target).map_or(0, BatchedSendQueue::len)
    }

    // ─── Configuration ───────────────────────────────────────────────────

    /// Set the server address and port, plus an optional listen address for
    /// the server side. Takes effect on the next start.
    pub fn set_connection_data(
        &mut self,
        address: impl Into<String>,
        port: u16,
        listen_address: Option<String>,
    ) {
        self.config.set_connection_data(address, port, listen_address);
    }

    /// Endpoint flavour of [`set_connection_data`](Self::set_connection_data).
    pub fn set_connection_endpoints(&mut self, server: SocketAddr, listen: Option<SocketAddr>) {
        self.config.set_connection_endpoints(server, listen);
    }

    /// Configure the network simulator. Only possible before start.
    pub fn set_debug_simulator_parameters(
        &mut self,
        params: SimulatorParameters,
    ) -> Result<(), TransportError> {
        if self.driver.is_some() {
            error!("simulator parameters can't be changed while the transport is running");
            return Err(TransportError::AlreadyStarted);
        }
        if params.packet_drop_rate > 100 {
            return Err(TransportError::Config(format!(
                "packet_drop_rate {} is not a percentage",
                params.packet_drop_rate
            )));
        }
        self.config.simulator = params;
        Ok(())
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("state", &self.state)
            .field("server_connection", &self.server_connection)
            .field("driver", &self.driver)
            .field("send_queues", &self.send_queues.len())
            .field("receive_queues", &self.receive_queues.len())
            .finish()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::MemoryNetwork;

    fn transport(net: &MemoryNetwork, clock: Clock) -> Transport {
        Transport::with_parts(TransportConfig::default(), Box::new(net.clone()), clock)
    }

    #[test]
    fn send_before_start_is_rejected() {
        let (clock, _mock) = Clock::mock();
        let mut t = transport(&MemoryNetwork::new(), clock);
        let err = t
            .send(ConnectionId::from_raw(1), b"x", DeliveryGuarantee::Reliable)
            .unwrap_err();
        assert!(matches!(err, TransportError::NotStarted));
    }

    #[test]
    fn starting_twice_fails() {
        let (clock, _mock) = Clock::mock();
        let net = MemoryNetwork::new();
        let mut t = transport(&net, clock);
        t.start_server().unwrap();
        assert_eq!(t.state(), TransportState::Listening);
        assert!(matches!(t.start_server(), Err(TransportError::AlreadyStarted)));
        assert!(matches!(t.start_client(), Err(TransportError::AlreadyStarted)));
        assert_eq!(t.state(), TransportState::Listening);
    }

    #[test]
    fn failed_start_leaves_transport_disconnected() {
        let (clock, _mock) = Clock::mock();
        let net = MemoryNetwork::new();
        let mut first = transport(&net, clock.clone());
        first.start_server().unwrap();

        let mut second = transport(&net, clock);
        assert!(matches!(second.start_server(), Err(TransportError::Io(_))));
        assert_eq!(second.state(), TransportState::Disconnected);
        assert!(second.local_addr().is_none());
    }

    #[test]
    fn invalid_address_fails_client_start() {
        let (clock, _mock) = Clock::mock();
        let mut t = transport(&MemoryNetwork::new(), clock);
        t.set_connection_data("not an address", 7777, None);
        assert!(matches!(
            t.start_client(),
            Err(TransportError::InvalidEndpoint { .. })
        ));
        assert_eq!(t.server_connection(), None);
    }

    #[test]
    fn client_becomes_connected_on_connect_event() {
        let (clock, mock) = Clock::mock();
        let net = MemoryNetwork::new();
        let mut server = transport(&net, clock.clone());
        let mut client = transport(&net, clock);
        server.start_server().unwrap();
        client.start_client().unwrap();
        assert_eq!(client.state(), TransportState::Disconnected);
        let server_id = client.server_connection().unwrap();

        for _ in 0..4 {
            client.update();
            server.update();
            mock.increment(Duration::from_millis(5));
        }
        assert_eq!(client.state(), TransportState::Connected);
        let ev = client.poll_event().unwrap();
        assert_eq!(ev.event, NetworkEvent::Connect(server_id));
        assert!(matches!(
            server.poll_event().map(|e| e.event),
            Some(NetworkEvent::Connect(_))
        ));
    }

    #[test]
    fn simulator_parameters_locked_after_start() {
        let (clock, _mock) = Clock::mock();
        let mut t = transport(&MemoryNetwork::new(), clock);
        let params = SimulatorParameters {
            packet_delay_ms: 20,
            ..Default::default()
        };
        t.set_debug_simulator_parameters(params).unwrap();
        assert_eq!(t.config().simulator, params);
        t.start_server().unwrap();
        assert!(t.set_debug_simulator_parameters(params).is_err());
    }

    #[test]
    fn invalid_config_fails_start() {
        let (clock, _mock) = Clock::mock();
        let net = MemoryNetwork::new();
        let mut config = TransportConfig::default();
        config.max_packet_queue_size = 0;

        let mut server = Transport::with_parts(config.clone(), Box::new(net.clone()), clock.clone());
        assert!(matches!(server.start_server(), Err(TransportError::Config(_))));
        assert_eq!(server.state(), TransportState::Disconnected);
        assert!(server.local_addr().is_none());

        let mut client = Transport::with_parts(config, Box::new(net), clock);
        assert!(matches!(client.start_client(), Err(TransportError::Config(_))));
        assert_eq!(client.server_connection(), None);
    }

    #[test]
    fn drop_rate_above_hundred_is_rejected() {
        let (clock, _mock) = Clock::mock();
        let mut t = transport(&MemoryNetwork::new(), clock);
        let params = SimulatorParameters {
            packet_drop_rate: 101,
            ..Default::default()
        };
        assert!(matches!(
            t.set_debug_simulator_parameters(params),
            Err(TransportError::Config(_))
        ));
        assert_eq!(t.config().simulator, SimulatorParameters::default());
    }

    #[test]
    fn receive_time_counts_from_creation() {
        let (clock, mock) = Clock::mock();
        let mut t = transport(&MemoryNetwork::new(), clock);
        mock.increment(Duration::from_millis(250));
        t.push_event(NetworkEvent::TransportFailure);
        assert_eq!(
            t.poll_event().unwrap().receive_time,
            Duration::from_millis(250)
        );
        assert!(t.poll_event().is_none());
    }
}
