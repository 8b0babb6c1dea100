//! # Network Condition Simulator
//!
//! Applies artificial delay, jitter and loss to outbound datagrams. Only
//! compiled into the send path for debug builds or with the `simulator`
//! feature; release builds log a warning and ignore the parameters.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use quanta::Instant;
use rand::rngs::SmallRng;
use rand::{RngExt as _, SeedableRng};

use crate::config::SimulatorParameters;

/// Datagrams the simulator holds back at most. Extra ones are dropped.
pub const MAX_DELAYED_PACKETS: usize = 300;

/// Whether simulator parameters take effect in this build.
pub const fn simulator_available() -> bool {
    cfg!(any(debug_assertions, feature = "simulator"))
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Delayed {
    due: Instant,
    /// Tie-breaker keeping equal deadlines in submission order.
    order: u64,
    target: SocketAddr,
    datagram: Bytes,
}

/// Delay line with random loss.
#[derive(Debug)]
pub struct NetworkSimulator {
    params: SimulatorParameters,
    rng: SmallRng,
    queue: BinaryHeap<Reverse<Delayed>>,
    next_order: u64,
    dropped: u64,
}

impl NetworkSimulator {
    pub fn new(params: SimulatorParameters) -> Self {
        Self::with_seed(params, 0x5EED_F3E7)
    }

    pub fn with_seed(params: SimulatorParameters, seed: u64) -> Self {
        NetworkSimulator {
            params,
            rng: SmallRng::seed_from_u64(seed),
            queue: BinaryHeap::new(),
            next_order: 0,
            dropped: 0,
        }
    }

    pub fn params(&self) -> SimulatorParameters {
        self.params
    }

    /// Offer a datagram. Returns `false` if it was dropped.
    pub fn submit(&mut self, datagram: Bytes, target: SocketAddr, now: Instant) -> bool {
        if self.params.packet_drop_rate > 0
            && self.rng.random_range(0..100u32) < self.params.packet_drop_rate
        {
            self.dropped += 1;
            return false;
        }
        if self.queue.len() >= MAX_DELAYED_PACKETS {
            self.dropped += 1;
            return false;
        }

        let base = self.params.packet_delay_ms as i64;
        let jitter = self.params.packet_jitter_ms as i64;
        let delay_ms = if jitter > 0 {
            (base + self.rng.random_range(-jitter..=jitter)).max(0)
        } else {
            base
        };
        let due = now + Duration::from_millis(delay_ms as u64);

        self.queue.push(Reverse(Delayed {
            due,
            order: self.next_order,
            target,
            datagram,
        }));
        self.next_order += 1;
        true
    }

    /// Remove every datagram whose delay has elapsed, earliest first.
    pub fn drain_ready(&mut self, now: Instant) -> Vec<(Bytes, SocketAddr)> {
        let mut out = Vec::new();
        while let Some(Reverse(head)) = self.queue.peek() {
            if head.due > now {
                break;
            }
            if let Some(Reverse(ready)) = self.queue.pop() {
                out.push((ready.datagram, ready.target));
            }
        }
        out
    }

    /// Datagrams still held back.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Datagrams discarded by the loss model or the queue bound.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
