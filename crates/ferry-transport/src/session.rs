//! # Session Management
//!
//! Per-connection lifecycle: handshake retries, heartbeats and the
//! inactivity timeout. The state machine is:
//!
//! ```text
//!   Connecting ──ConnectAccept──▶ Connected ──Disconnect / timeout──▶ (removed)
//!       │
//!   attempts exhausted
//! ```
//!
//! A server-side session starts directly in `Connected` when the
//! `ConnectRequest` arrives. All timing takes an explicit `now` so the
//! driver can run on a mocked clock.

use std::net::SocketAddr;
use std::time::Duration;

use quanta::Instant;

// ─── Connection State ────────────────────────────────────────────────────────

/// Driver-level connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No such connection, or torn down.
    Disconnected,
    /// ConnectRequest sent, waiting for ConnectAccept.
    Connecting,
    /// Handshake complete.
    Connected,
}

/// Why the driver dropped a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// No datagram from the peer within the disconnect timeout.
    Timeout,
    /// ConnectRequest retries exhausted without an answer.
    MaxConnectionAttempts,
    /// The peer sent a Disconnect.
    ClosedByRemote,
}

// ─── Timeouts ────────────────────────────────────────────────────────────────

/// Session timing parameters, resolved from the transport configuration.
#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    pub heartbeat: Duration,
    pub connect: Duration,
    pub max_connect_attempts: u32,
    pub disconnect: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        SessionTimeouts {
            heartbeat: Duration::from_millis(500),
            connect: Duration::from_millis(1000),
            max_connect_attempts: 60,
            disconnect: Duration::from_millis(30_000),
        }
    }
}

/// What the driver should do for a session on this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    None,
    SendConnectRequest,
    SendHeartbeat,
    Drop(DisconnectReason),
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// Lifecycle state of one connection.
#[derive(Debug)]
pub struct Session {
    pub state: ConnectionState,
    pub remote: SocketAddr,
    /// Token the peer stamps on datagrams addressed to us.
    pub local_token: u32,
    /// Token we stamp on datagrams addressed to the peer. 0 until known.
    pub remote_token: u32,
    connect_attempts: u32,
    last_connect_sent: Option<Instant>,
    last_sent: Instant,
    last_received: Instant,
    timeouts: SessionTimeouts,
}

impl Session {
    /// Client side: a session waiting for the peer to accept.
    pub fn outgoing(
        remote: SocketAddr,
        local_token: u32,
        timeouts: SessionTimeouts,
        now: Instant,
    ) -> Self {
        Session {
            state: ConnectionState::Connecting,
            remote,
            local_token,
            remote_token: 0,
            connect_attempts: 0,
            last_connect_sent: None,
            last_sent: now,
            last_received: now,
            timeouts,
        }
    }

    /// Server side: a session created from an inbound ConnectRequest.
    pub fn incoming(
        remote: SocketAddr,
        local_token: u32,
        remote_token: u32,
        timeouts: SessionTimeouts,
        now: Instant,
    ) -> Self {
        Session {
            state: ConnectionState::Connected,
            remote,
            local_token,
            remote_token,
            connect_attempts: 0,
            last_connect_sent: None,
            last_sent: now,
            last_received: now,
            timeouts,
        }
    }

    /// Handle ConnectAccept. Returns `true` if this completed the handshake.
    pub fn on_accept(&mut self, server_token: u32, now: Instant) -> bool {
        self.last_received = now;
        if self.state != ConnectionState::Connecting {
            return false;
        }
        self.remote_token = server_token;
        self.state = ConnectionState::Connected;
        true
    }

    /// Record inbound traffic.
    pub fn touch_received(&mut self, now: Instant) {
        self.last_received = now;
    }

    /// Record outbound traffic.
    pub fn touch_sent(&mut self, now: Instant) {
        self.last_sent = now;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts
    }

    /// Advance timers. Call once per driver step.
    pub fn poll(&mut self, now: Instant) -> SessionAction {
        match self.state {
            ConnectionState::Connecting => {
                let due = self.last_connect_sent.is_none_or(|t| {
                    now.saturating_duration_since(t) >= self.timeouts.connect
                });
                if !due {
                    return SessionAction::None;
                }
                if self.connect_attempts >= self.timeouts.max_connect_attempts {
                    return SessionAction::Drop(DisconnectReason::MaxConnectionAttempts);
                }
                self.connect_attempts += 1;
                self.last_connect_sent = Some(now);
                self.last_sent = now;
                SessionAction::SendConnectRequest
            }
            ConnectionState::Connected => {
                if now.saturating_duration_since(self.last_received) >= self.timeouts.disconnect {
                    SessionAction::Drop(DisconnectReason::Timeout)
                } else if now.saturating_duration_since(self.last_sent) >= self.timeouts.heartbeat
                {
                    self.last_sent = now;
                    SessionAction::SendHeartbeat
                } else {
                    SessionAction::None
                }
            }
            ConnectionState::Disconnected => SessionAction::None,
        }
    }
}

// ─── RTT Tracker ─────────────────────────────────────────────────────────────

/// Lower bound on the retransmission timeout.
pub const MIN_RTO: Duration = Duration::from_millis(50);
/// Upper bound on the retransmission timeout.
pub const MAX_RTO: Duration = Duration::from_secs(10);
/// RTO before the first sample.
pub const INITIAL_RTO: Duration = Duration::from_millis(250);

/// Smoothed RTT estimation from reliable ACK samples (RFC 6298).
#[derive(Debug, Clone)]
pub struct RttTracker {
    /// Smoothed RTT (SRTT) in µs.
    srtt_us: f64,
    /// RTT variation (RTTVAR) in µs.
    rttvar_us: f64,
    min_rtt_us: f64,
    last_rtt_us: f64,
    sample_count: u64,
}

impl RttTracker {
    pub fn new() -> Self {
        RttTracker {
            srtt_us: 0.0,
            rttvar_us: 0.0,
            min_rtt_us: f64::MAX,
            last_rtt_us: 0.0,
            sample_count: 0,
        }
    }

    /// Fold one RTT measurement into the estimate.
    pub fn on_sample(&mut self, rtt: Duration) {
        let rtt_us = rtt.as_micros() as f64;
        self.sample_count += 1;
        self.last_rtt_us = rtt_us;
        if rtt_us < self.min_rtt_us {
            self.min_rtt_us = rtt_us;
        }

        if self.sample_count == 1 {
            self.srtt_us = rtt_us;
            self.rttvar_us = rtt_us / 2.0;
        } else {
            // α = 1/8, β = 1/4
            self.rttvar_us = 0.75 * self.rttvar_us + 0.25 * (self.srtt_us - rtt_us).abs();
            self.srtt_us = 0.875 * self.srtt_us + 0.125 * rtt_us;
        }
    }

    pub fn srtt_us(&self) -> f64 {
        self.srtt_us
    }

    pub fn rttvar_us(&self) -> f64 {
        self.rttvar_us
    }

    /// Minimum RTT observed, 0 before the first sample.
    pub fn min_rtt_us(&self) -> f64 {
        if self.sample_count == 0 {
            0.0
        } else {
            self.min_rtt_us
        }
    }

    pub fn last_rtt_us(&self) -> f64 {
        self.last_rtt_us
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    /// RTO = SRTT + 4·RTTVAR, clamped to [`MIN_RTO`, `MAX_RTO`].
    pub fn rto(&self) -> Duration {
        if self.sample_count == 0 {
            return INITIAL_RTO;
        }
        let rto_us = self.srtt_us + 4.0 * self.rttvar_us;
        Duration::from_micros(rto_us as u64).clamp(MIN_RTO, MAX_RTO)
    }
}

impl Default for RttTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use quanta::Clock;

    fn addr() -> SocketAddr {
        "127.0.0.1:7777".parse().unwrap()
    }

    fn timeouts() -> SessionTimeouts {
        SessionTimeouts {
            heartbeat: Duration::from_millis(100),
            connect: Duration::from_millis(200),
            max_connect_attempts: 3,
            disconnect: Duration::from_millis(1000),
        }
    }

    #[test]
    fn handshake_flow() {
        let (clock, _mock) = Clock::mock();
        let mut client = Session::outgoing(addr(), 7, timeouts(), clock.now());
        assert_eq!(client.poll(clock.now()), SessionAction::SendConnectRequest);
        assert_eq!(client.state, ConnectionState::Connecting);

        assert!(client.on_accept(99, clock.now()));
        assert_eq!(client.state, ConnectionState::Connected);
        assert_eq!(client.remote_token, 99);
        // A duplicate accept is not a second transition.
        assert!(!client.on_accept(99, clock.now()));
    }

    #[test]
    fn connect_retries_then_gives_up() {
        let (clock, mock) = Clock::mock();
        let mut s = Session::outgoing(addr(), 1, timeouts(), clock.now());
        assert_eq!(s.poll(clock.now()), SessionAction::SendConnectRequest);
        assert_eq!(s.poll(clock.now()), SessionAction::None);

        mock.increment(Duration::from_millis(200));
        assert_eq!(s.poll(clock.now()), SessionAction::SendConnectRequest);
        mock.increment(Duration::from_millis(200));
        assert_eq!(s.poll(clock.now()), SessionAction::SendConnectRequest);
        assert_eq!(s.connect_attempts(), 3);

        mock.increment(Duration::from_millis(200));
        assert_eq!(
            s.poll(clock.now()),
            SessionAction::Drop(DisconnectReason::MaxConnectionAttempts)
        );
    }

    #[test]
    fn heartbeat_and_inactivity_timeout() {
        let (clock, mock) = Clock::mock();
        let mut s = Session::incoming(addr(), 1, 2, timeouts(), clock.now());
        assert_eq!(s.poll(clock.now()), SessionAction::None);

        mock.increment(Duration::from_millis(100));
        assert_eq!(s.poll(clock.now()), SessionAction::SendHeartbeat);
        assert_eq!(s.poll(clock.now()), SessionAction::None);

        s.touch_received(clock.now());
        mock.increment(Duration::from_millis(999));
        assert_ne!(
            s.poll(clock.now()),
            SessionAction::Drop(DisconnectReason::Timeout)
        );
        mock.increment(Duration::from_millis(1));
        assert_eq!(
            s.poll(clock.now()),
            SessionAction::Drop(DisconnectReason::Timeout)
        );
    }

    #[test]
    fn rtt_first_sample_and_smoothing() {
        let mut rtt = RttTracker::new();
        assert_eq!(rtt.rto(), INITIAL_RTO);
        assert_eq!(rtt.min_rtt_us(), 0.0);

        rtt.on_sample(Duration::from_millis(100));
        assert_eq!(rtt.srtt_us(), 100_000.0);
        assert_eq!(rtt.rttvar_us(), 50_000.0);
        assert_eq!(rtt.rto(), Duration::from_millis(300));

        rtt.on_sample(Duration::from_millis(60));
        assert_eq!(rtt.srtt_us(), 95_000.0);
        assert_eq!(rtt.rttvar_us(), 47_500.0);
        assert_eq!(rtt.min_rtt_us(), 60_000.0);
        assert_eq!(rtt.last_rtt_us(), 60_000.0);
    }

    #[test]
    fn rto_is_clamped() {
        let mut rtt = RttTracker::new();
        rtt.on_sample(Duration::from_micros(10));
        assert_eq!(rtt.rto(), MIN_RTO);
        let mut rtt = RttTracker::new();
        rtt.on_sample(Duration::from_secs(30));
        assert_eq!(rtt.rto(), MAX_RTO);
    }
}
