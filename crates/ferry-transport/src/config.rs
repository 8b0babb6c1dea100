//! # Transport Configuration
//!
//! [`TransportConfig`] is the resolved, validated configuration. It is
//! usually built from defaults or from TOML through [`TransportConfigInput`],
//! where every field is optional:
//!
//! ```toml
//! max_payload_size = 6144
//! disconnect_timeout_ms = 30000
//!
//! [connection]
//! address = "127.0.0.1"
//! port = 7777
//! server_listen_address = "0.0.0.0"
//!
//! [simulator]
//! packet_delay_ms = 40
//! packet_jitter_ms = 5
//! packet_drop_rate = 2
//! ```

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::Deserialize;

use crate::error::TransportError;
use crate::queue::PER_MESSAGE_OVERHEAD;
use crate::session::SessionTimeouts;

pub const DEFAULT_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 7777;
pub const DEFAULT_MAX_PACKET_QUEUE_SIZE: usize = 128;
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 6 * 1024;
pub const DEFAULT_MAX_SEND_QUEUE_SIZE: usize = 16 * DEFAULT_MAX_PAYLOAD_SIZE;

// ─── Input (TOML) ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransportConfigInput {
    pub connection: ConnectionInput,
    pub max_packet_queue_size: Option<usize>,
    pub max_payload_size: Option<usize>,
    pub max_send_queue_size: Option<usize>,
    pub heartbeat_timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub max_connect_attempts: Option<u32>,
    pub disconnect_timeout_ms: Option<u64>,
    pub simulator: SimulatorInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConnectionInput {
    pub address: Option<String>,
    pub port: Option<u16>,
    pub server_listen_address: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SimulatorInput {
    pub packet_delay_ms: Option<u32>,
    pub packet_jitter_ms: Option<u32>,
    pub packet_drop_rate: Option<u32>,
}

// ─── Resolved ────────────────────────────────────────────────────────────────

/// Where clients connect and where the server binds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionAddressData {
    /// IP address of the server (address clients connect to).
    pub address: String,
    /// UDP port of the server.
    pub port: u16,
    /// Address the server binds to, if different from `address`.
    pub server_listen_address: Option<String>,
}

impl ConnectionAddressData {
    /// Endpoint clients connect to.
    pub fn server_endpoint(&self) -> Result<SocketAddr, TransportError> {
        parse_endpoint(&self.address, self.port)
    }

    /// Endpoint the server binds and listens on.
    pub fn listen_endpoint(&self) -> Result<SocketAddr, TransportError> {
        let address = self
            .server_listen_address
            .as_deref()
            .unwrap_or(&self.address);
        parse_endpoint(address, self.port)
    }
}

impl Default for ConnectionAddressData {
    fn default() -> Self {
        ConnectionAddressData {
            address: DEFAULT_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            server_listen_address: None,
        }
    }
}

fn parse_endpoint(address: &str, port: u16) -> Result<SocketAddr, TransportError> {
    address
        .trim()
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, port))
        .map_err(|_| TransportError::InvalidEndpoint {
            address: address.to_string(),
            port,
        })
}

/// Network condition simulator settings. Only honoured in debug builds or
/// with the `simulator` feature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulatorParameters {
    /// Delay added to every sent datagram, in milliseconds.
    pub packet_delay_ms: u32,
    /// Random variation of the delay, in milliseconds.
    pub packet_jitter_ms: u32,
    /// Percentage of datagrams to drop (0-100).
    pub packet_drop_rate: u32,
}

impl SimulatorParameters {
    /// Whether any impairment is configured.
    pub fn is_active(&self) -> bool {
        self.packet_delay_ms > 0 || self.packet_jitter_ms > 0 || self.packet_drop_rate > 0
    }
}

/// Fully resolved transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connection: ConnectionAddressData,
    /// Maximum datagrams queued in the driver per step, in each direction.
    pub max_packet_queue_size: usize,
    /// Maximum size of one unreliable message.
    pub max_payload_size: usize,
    /// Byte capacity of each batched send queue.
    pub max_send_queue_size: usize,
    /// Send silence after which a heartbeat goes out.
    pub heartbeat_timeout: Duration,
    /// Interval between connection attempts.
    pub connect_timeout: Duration,
    pub max_connect_attempts: u32,
    /// Receive silence after which a connection is dropped.
    pub disconnect_timeout: Duration,
    pub simulator: SimulatorParameters,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            connection: ConnectionAddressData::default(),
            max_packet_queue_size: DEFAULT_MAX_PACKET_QUEUE_SIZE,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            max_send_queue_size: DEFAULT_MAX_SEND_QUEUE_SIZE,
            heartbeat_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_millis(1000),
            max_connect_attempts: 60,
            disconnect_timeout: Duration::from_millis(30_000),
            simulator: SimulatorParameters::default(),
        }
    }
}

impl TransportConfigInput {
    pub fn resolve(self) -> Result<TransportConfig, TransportError> {
        let defaults = TransportConfig::default();
        let connection = ConnectionAddressData {
            address: self
                .connection
                .address
                .map(|a| a.trim().to_string())
                .unwrap_or(defaults.connection.address),
            port: self.connection.port.unwrap_or(defaults.connection.port),
            server_listen_address: self
                .connection
                .server_listen_address
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty()),
        };

        let config = TransportConfig {
            connection,
            max_packet_queue_size: self
                .max_packet_queue_size
                .unwrap_or(defaults.max_packet_queue_size),
            max_payload_size: self.max_payload_size.unwrap_or(defaults.max_payload_size),
            max_send_queue_size: self
                .max_send_queue_size
                .unwrap_or(defaults.max_send_queue_size),
            heartbeat_timeout: self
                .heartbeat_timeout_ms
                .map_or(defaults.heartbeat_timeout, Duration::from_millis),
            connect_timeout: self
                .connect_timeout_ms
                .map_or(defaults.connect_timeout, Duration::from_millis),
            max_connect_attempts: self
                .max_connect_attempts
                .unwrap_or(defaults.max_connect_attempts),
            disconnect_timeout: self
                .disconnect_timeout_ms
                .map_or(defaults.disconnect_timeout, Duration::from_millis),
            simulator: SimulatorParameters {
                packet_delay_ms: self.simulator.packet_delay_ms.unwrap_or(0),
                packet_jitter_ms: self.simulator.packet_jitter_ms.unwrap_or(0),
                packet_drop_rate: self.simulator.packet_drop_rate.unwrap_or(0),
            },
        };
        config.validate()?;
        Ok(config)
    }
}

impl TransportConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, TransportError> {
        if input.trim().is_empty() {
            return Ok(TransportConfig::default());
        }
        let parsed: TransportConfigInput = toml::from_str(input)
            .map_err(|e| TransportError::Config(format!("invalid config TOML: {e}")))?;
        parsed.resolve()
    }

    /// Reject settings the transport cannot run with.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.max_payload_size == 0 {
            return Err(TransportError::Config("max_payload_size must be > 0".into()));
        }
        if self.max_payload_size > u32::MAX as usize {
            return Err(TransportError::Config(
                "max_payload_size must fit in a 32-bit length prefix".into(),
            ));
        }
        if self.max_packet_queue_size == 0 {
            return Err(TransportError::Config(
                "max_packet_queue_size must be > 0".into(),
            ));
        }
        if self.max_connect_attempts == 0 {
            return Err(TransportError::Config(
                "max_connect_attempts must be > 0".into(),
            ));
        }
        if self.heartbeat_timeout.is_zero()
            || self.connect_timeout.is_zero()
            || self.disconnect_timeout.is_zero()
        {
            return Err(TransportError::Config("timeouts must be non-zero".into()));
        }
        if self.simulator.packet_drop_rate > 100 {
            return Err(TransportError::Config(format!(
                "packet_drop_rate {} is not a percentage",
                self.simulator.packet_drop_rate
            )));
        }
        Ok(())
    }

    /// Capacity of each batched send queue. Never smaller than one payload.
    pub fn send_queue_capacity(&self) -> usize {
        self.max_send_queue_size.max(self.max_payload_size)
    }

    /// Largest framed message the unreliable pipelines fragment.
    pub fn fragmentation_capacity(&self) -> usize {
        self.max_payload_size + PER_MESSAGE_OVERHEAD
    }

    pub fn session_timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            heartbeat: self.heartbeat_timeout,
            connect: self.connect_timeout,
            max_connect_attempts: self.max_connect_attempts,
            disconnect: self.disconnect_timeout,
        }
    }

    /// Replace the connection address data.
    pub fn set_connection_data(
        &mut self,
        address: impl Into<String>,
        port: u16,
        listen_address: Option<String>,
    ) {
        self.connection = ConnectionAddressData {
            address: address.into(),
            port,
            server_listen_address: listen_address.filter(|a| !a.is_empty()),
        };
    }

    /// Replace the connection address data from endpoints.
    ///
    /// The listen endpoint only contributes its address; a port that differs
    /// from the server endpoint's is logged and ignored.
    pub fn set_connection_endpoints(&mut self, server: SocketAddr, listen: Option<SocketAddr>) {
        if let Some(listen) = listen {
            if listen.port() != server.port() {
                tracing::error!(
                    server_port = server.port(),
                    listen_port = listen.port(),
                    "port mismatch between server and listen endpoints"
                );
            }
        }
        self.set_connection_data(
            server.ip().to_string(),
            server.port(),
            listen.map(|l| l.ip().to_string()),
        );
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
