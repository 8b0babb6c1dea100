//! # ferry-transport
//!
//! Reliable-messaging transport over UDP for real-time multiplayer hosts.
//!
//! Application messages are batched per connection and delivery category,
//! carried over one of three pipelines (unreliable, unreliable sequenced,
//! reliable sequenced) and surfaced back as polled events. A small
//! connection engine handles the handshake, heartbeats, timeouts and the
//! reliable stream's ARQ.
//!
//! ## Crate structure
//!
//! - [`transport`] — Application-facing transport and update loop
//! - [`driver`] — Connection engine: handshake, pipelines, socket I/O
//! - [`queue`] — Batched send and receive queues
//! - [`pipeline`] — Delivery guarantees, pipeline selection and stages
//! - [`session`] — Connection lifecycle timers and RTT estimation
//! - [`registry`] — Generation-tagged connection ids
//! - [`wire`] — Datagram serialization, VarInt
//! - [`socket`] — UDP and in-memory datagram sockets
//! - [`simulator`] — Delay, jitter and loss for debug builds
//! - [`config`] — TOML configuration
//! - [`stats`] — Per-connection statistics
//! - [`error`] — Status codes and transport errors

pub mod config;
pub mod driver;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod session;
pub mod simulator;
pub mod socket;
pub mod stats;
pub mod transport;
pub mod wire;

pub use config::TransportConfig;
pub use error::{error_to_string, StatusCode, TransportError};
pub use pipeline::{select_send_pipeline, DeliveryGuarantee, Pipeline};
pub use registry::ConnectionId;
pub use transport::{NetworkEvent, SendTarget, Transport, TransportEvent, TransportState};
