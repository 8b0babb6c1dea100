//! # Connection Statistics
//!
//! Per-connection counters gathered by the network driver. Serializable for
//! JSON export by the host application.

use serde::Serialize;

/// Snapshot of one connection's counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionStats {
    /// Datagrams sent, including handshake, heartbeats, ACKs and retransmissions.
    pub datagrams_sent: u64,
    /// Datagrams received and accepted for this connection.
    pub datagrams_received: u64,
    /// Payload bytes handed to the driver.
    pub bytes_sent: u64,
    /// Payload bytes delivered by the driver.
    pub bytes_received: u64,
    /// Reliable packets sent for the first time.
    pub reliable_sent: u64,
    /// Reliable packets acknowledged by the peer.
    pub reliable_acked: u64,
    /// Reliable packets resent after an RTO.
    pub retransmissions: u64,
    /// Reliable packets currently unacknowledged.
    pub in_flight: u64,
    /// Reliable packets received as duplicates or outside the window.
    pub duplicates: u64,
    /// Unreliable-sequenced messages dropped as stale.
    pub stale_dropped: u64,
    /// Smoothed RTT in µs.
    pub srtt_us: u64,
    /// Most recent RTT sample in µs.
    pub last_rtt_us: u64,
    /// Minimum RTT observed in µs.
    pub min_rtt_us: u64,
    /// Current retransmission timeout in µs.
    pub rto_us: u64,
}

impl ConnectionStats {
    /// Fraction of reliable packets that needed retransmission.
    pub fn loss_rate(&self) -> f64 {
        if self.reliable_sent == 0 {
            0.0
        } else {
            self.retransmissions as f64 / self.reliable_sent as f64
        }
    }
}
