//! # Reliable Sequenced Stage
//!
//! Windowed ARQ carrying the reliable byte stream of one connection.
//!
//! - Sequence numbers start at 1; an ACK with `cumulative_seq = 0` means
//!   nothing has been received yet.
//! - At most [`WINDOW`] packets are unacknowledged at any time. A full
//!   window is reported as [`StatusCode::NetworkSendQueueFull`] and the
//!   bytes stay in the batched send queue until the next tick.
//! - The receiver buffers out-of-order packets within the window and
//!   releases them strictly in order.
//! - Unacknowledged packets are resent after an RTO that doubles with each
//!   retransmission. RTT samples only come from packets sent once (Karn).

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use quanta::Instant;

use crate::error::StatusCode;
use crate::pipeline::Pipeline;
use crate::wire::{AckPacket, DataPacket, Fragment, VarInt};

/// Maximum unacknowledged packets per connection.
pub const WINDOW: u64 = 32;

/// Cap on the RTO backoff exponent.
const MAX_BACKOFF_SHIFT: u32 = 5;

// ─── Sender ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct InFlight {
    payload: Bytes,
    sent_at: Instant,
    retransmits: u32,
}

/// Send half of the reliable stage.
#[derive(Debug)]
pub struct ReliableSender {
    next_seq: u64,
    in_flight: BTreeMap<u64, InFlight>,
    packets_sent: u64,
    packets_acked: u64,
    retransmissions: u64,
}

impl ReliableSender {
    pub fn new() -> Self {
        ReliableSender {
            next_seq: 1,
            in_flight: BTreeMap::new(),
            packets_sent: 0,
            packets_acked: 0,
            retransmissions: 0,
        }
    }

    /// Whether another packet fits in the window.
    pub fn can_send(&self) -> bool {
        let base = self
            .in_flight
            .first_key_value()
            .map_or(self.next_seq, |(&seq, _)| seq);
        self.next_seq - base < WINDOW
    }

    /// Assign the next sequence number to `payload` and track it until acked.
    pub fn send(&mut self, payload: Bytes, now: Instant) -> Result<DataPacket, StatusCode> {
        if !self.can_send() {
            return Err(StatusCode::NetworkSendQueueFull);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.packets_sent += 1;
        self.in_flight.insert(
            seq,
            InFlight {
                payload: payload.clone(),
                sent_at: now,
                retransmits: 0,
            },
        );
        Ok(Self::packet(seq, payload))
    }

    /// Apply an ACK. Returns an RTT sample if the newest newly-acked packet
    /// was never retransmitted.
    pub fn on_ack(&mut self, ack: &AckPacket, now: Instant) -> Option<Duration> {
        let cumulative = ack.cumulative_seq.value();
        let mut newest: Option<InFlight> = None;

        let still_pending = self.in_flight.split_off(&(cumulative + 1));
        let acked = std::mem::replace(&mut self.in_flight, still_pending);
        for (_, entry) in acked {
            self.packets_acked += 1;
            newest = Some(entry);
        }
        for seq in ack.sacked_sequences() {
            if let Some(entry) = self.in_flight.remove(&seq) {
                self.packets_acked += 1;
                newest = Some(entry);
            }
        }

        newest
            .filter(|e| e.retransmits == 0)
            .map(|e| now.saturating_duration_since(e.sent_at))
    }

    /// Packets whose backed-off RTO has expired, re-stamped as sent `now`.
    pub fn poll_retransmits(&mut self, now: Instant, rto: Duration) -> Vec<DataPacket> {
        let mut out = Vec::new();
        for (&seq, entry) in self.in_flight.iter_mut() {
            let backoff = rto.saturating_mul(1 << entry.retransmits.min(MAX_BACKOFF_SHIFT));
            if now.saturating_duration_since(entry.sent_at) >= backoff {
                entry.sent_at = now;
                entry.retransmits += 1;
                self.retransmissions += 1;
                out.push(Self::packet(seq, entry.payload.clone()));
            }
        }
        out
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    pub fn packets_acked(&self) -> u64 {
        self.packets_acked
    }

    pub fn retransmissions(&self) -> u64 {
        self.retransmissions
    }

    fn packet(seq: u64, payload: Bytes) -> DataPacket {
        DataPacket {
            pipeline: Pipeline::ReliableSequenced,
            fragment: Fragment::Complete,
            sequence: VarInt::saturating(seq),
            payload,
        }
    }
}

impl Default for ReliableSender {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Receiver ────────────────────────────────────────────────────────────────

/// Receive half of the reliable stage.
#[derive(Debug)]
pub struct ReliableReceiver {
    next_expected: u64,
    reorder: BTreeMap<u64, Bytes>,
    ack_pending: bool,
    packets_received: u64,
    duplicates: u64,
}

impl ReliableReceiver {
    pub fn new() -> Self {
        ReliableReceiver {
            next_expected: 1,
            reorder: BTreeMap::new(),
            ack_pending: false,
            packets_received: 0,
            duplicates: 0,
        }
    }

    /// Accept one packet and return every payload that is now deliverable,
    /// in order. Duplicates and packets beyond the window are discarded.
    pub fn receive(&mut self, sequence: u64, payload: Bytes) -> Vec<Bytes> {
        self.packets_received += 1;
        // Always re-ack so a sender whose ACK was lost stops retransmitting.
        self.ack_pending = true;

        if sequence < self.next_expected
            || sequence >= self.next_expected + WINDOW
            || self.reorder.contains_key(&sequence)
        {
            self.duplicates += 1;
            return Vec::new();
        }
        self.reorder.insert(sequence, payload);

        let mut delivered = Vec::new();
        while let Some(payload) = self.reorder.remove(&self.next_expected) {
            delivered.push(payload);
            self.next_expected += 1;
        }
        delivered
    }

    /// Build an ACK if any packet arrived since the last one.
    pub fn take_ack(&mut self) -> Option<AckPacket> {
        if !self.ack_pending {
            return None;
        }
        self.ack_pending = false;
        let cumulative = self.next_expected - 1;
        let sack_bitmap = self
            .reorder
            .keys()
            .map(|&seq| seq - cumulative - 1)
            .filter(|&bit| bit < 64)
            .fold(0u64, |acc, bit| acc | (1u64 << bit));
        Some(AckPacket {
            cumulative_seq: VarInt::saturating(cumulative),
            sack_bitmap,
        })
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received
    }

    /// Packets discarded as already received or outside the window.
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    /// Packets waiting for a gap to fill.
    pub fn buffered(&self) -> usize {
        self.reorder.len()
    }
}

impl Default for ReliableReceiver {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
