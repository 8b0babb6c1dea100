//! # Errors and Diagnostics
//!
//! Two layers of failure reporting:
//!
//! - [`StatusCode`] — low-level result codes produced by the network driver
//!   and its pipelines. These are values, not faults: the transport inspects
//!   them, logs them through [`error_to_string`], and decides whether the
//!   affected connection survives.
//! - [`TransportError`] — the application-facing error returned by the
//!   [`Transport`](crate::transport::Transport) operations.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::registry::ConnectionId;

// ─── Status Codes ────────────────────────────────────────────────────────────

/// Result codes reported by the network driver.
///
/// The numeric values are stable and may cross an FFI or logging boundary,
/// so [`StatusCode::from_code`] accepts arbitrary integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StatusCode {
    Success = 0,
    /// Datagram carried a connection token that does not match.
    NetworkIdMismatch = -1,
    /// Datagram carried an unsupported protocol version.
    NetworkVersionMismatch = -2,
    /// Operation not valid in the connection's current state.
    NetworkStateMismatch = -3,
    /// Payload does not fit in the pipeline's packet capacity.
    NetworkPacketOverflow = -4,
    /// Too many datagrams or reliable packets in flight.
    NetworkSendQueueFull = -5,
    /// Datagram header could not be parsed.
    NetworkHeaderInvalid = -6,
    /// Connection handle does not refer to a live connection.
    NetworkSendHandleInvalid = -8,
    /// Endpoint or argument rejected.
    NetworkArgumentMismatch = -9,
}

impl StatusCode {
    /// Numeric value of this code.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map a raw integer back to a known code.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(StatusCode::Success),
            -1 => Some(StatusCode::NetworkIdMismatch),
            -2 => Some(StatusCode::NetworkVersionMismatch),
            -3 => Some(StatusCode::NetworkStateMismatch),
            -4 => Some(StatusCode::NetworkPacketOverflow),
            -5 => Some(StatusCode::NetworkSendQueueFull),
            -6 => Some(StatusCode::NetworkHeaderInvalid),
            -8 => Some(StatusCode::NetworkSendHandleInvalid),
            -9 => Some(StatusCode::NetworkArgumentMismatch),
            _ => None,
        }
    }

    /// Human-readable description of this code in the context of `connection`.
    pub fn describe(self, connection: ConnectionId) -> String {
        match self {
            StatusCode::Success => "Success".to_string(),
            StatusCode::NetworkIdMismatch => format!(
                "Connection token is invalid, likely caused by stale connection {connection}."
            ),
            StatusCode::NetworkVersionMismatch => format!(
                "Protocol version is invalid, likely caused by stale connection {connection}."
            ),
            StatusCode::NetworkStateMismatch => format!(
                "Sending data while connecting on connection {connection} is not allowed."
            ),
            StatusCode::NetworkPacketOverflow => {
                "Unable to allocate packet due to buffer overflow.".to_string()
            }
            StatusCode::NetworkSendQueueFull => "Currently unable to queue packet as there are \
                too many in-flight packets. This could be because the send queue size \
                ('max_send_queue_size') is too small."
                .to_string(),
            StatusCode::NetworkHeaderInvalid => "Invalid transport protocol header.".to_string(),
            StatusCode::NetworkSendHandleInvalid => {
                "Invalid send handle. Likely caused by pipeline send data corruption.".to_string()
            }
            StatusCode::NetworkArgumentMismatch => "Invalid endpoint arguments.".to_string(),
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

/// Translate a raw driver result into a log-ready message.
///
/// Unknown codes are reported as such rather than rejected.
pub fn error_to_string(code: i32, connection: ConnectionId) -> String {
    match StatusCode::from_code(code) {
        Some(status) => status.describe(connection),
        None => format!("Unknown error code {code}"),
    }
}

// ─── Transport Errors ────────────────────────────────────────────────────────

/// Errors surfaced by [`Transport`](crate::transport::Transport) operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid network endpoint {address}:{port}")]
    InvalidEndpoint { address: String, port: u16 },

    #[error("transport already started")]
    AlreadyStarted,

    #[error("transport not started")]
    NotStarted,

    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("payload of {size} bytes exceeds the maximum payload size of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("unknown delivery guarantee code {0}")]
    UnknownDelivery(u8),

    #[error("reliable send queue overflow on connection {0}; connection dropped")]
    SendQueueOverflow(ConnectionId),

    #[error("network I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("network driver error: {0}")]
    Status(StatusCode),
}

// ─── Tests ───────────────────────────────────────────────────────────────────
