//! # Delivery Pipelines
//!
//! Maps the application's requested [`DeliveryGuarantee`] onto one of the
//! three wire [`Pipeline`]s, and hosts the per-connection pipeline stages:
//!
//! - [`fragment`] — split payloads into MTU-sized datagrams and reassemble them
//! - [`sequenced`] — drop unreliable messages that arrive after a newer one
//! - [`reliable`] — windowed, acknowledged, in-order delivery with retransmission

pub mod fragment;
pub mod reliable;
pub mod sequenced;

use std::fmt;

use crate::error::TransportError;

// ─── Delivery Guarantee ──────────────────────────────────────────────────────

/// Reliability and ordering class requested for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeliveryGuarantee {
    /// Best effort, unordered.
    Unreliable = 0,
    /// Best effort; late messages are dropped rather than delivered out of order.
    UnreliableSequenced = 1,
    /// Guaranteed delivery.
    Reliable = 2,
    /// Guaranteed, in-order delivery.
    ReliableSequenced = 3,
    /// Guaranteed, in-order delivery of payloads of any size.
    ReliableFragmentedSequenced = 4,
}

impl DeliveryGuarantee {
    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            DeliveryGuarantee::Reliable
                | DeliveryGuarantee::ReliableSequenced
                | DeliveryGuarantee::ReliableFragmentedSequenced
        )
    }
}

impl TryFrom<u8> for DeliveryGuarantee {
    type Error = TransportError;

    /// Unknown codes are a configuration error, never silently defaulted.
    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(DeliveryGuarantee::Unreliable),
            1 => Ok(DeliveryGuarantee::UnreliableSequenced),
            2 => Ok(DeliveryGuarantee::Reliable),
            3 => Ok(DeliveryGuarantee::ReliableSequenced),
            4 => Ok(DeliveryGuarantee::ReliableFragmentedSequenced),
            other => Err(TransportError::UnknownDelivery(other)),
        }
    }
}

// ─── Pipeline ────────────────────────────────────────────────────────────────

/// Concrete wire-level processing chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Pipeline {
    UnreliableFragmented = 0,
    UnreliableSequencedFragmented = 1,
    ReliableSequenced = 2,
}

impl Pipeline {
    pub const ALL: [Pipeline; 3] = [
        Pipeline::UnreliableFragmented,
        Pipeline::UnreliableSequencedFragmented,
        Pipeline::ReliableSequenced,
    ];

    /// Identifier carried in data packet headers.
    pub fn wire_id(self) -> u8 {
        self as u8
    }

    pub fn from_wire_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Pipeline::UnreliableFragmented),
            1 => Some(Pipeline::UnreliableSequencedFragmented),
            2 => Some(Pipeline::ReliableSequenced),
            _ => None,
        }
    }

    pub fn is_reliable(self) -> bool {
        self == Pipeline::ReliableSequenced
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Pipeline::UnreliableFragmented => "unreliable-fragmented",
            Pipeline::UnreliableSequencedFragmented => "unreliable-sequenced-fragmented",
            Pipeline::ReliableSequenced => "reliable-sequenced",
        };
        f.write_str(name)
    }
}

/// Pick the wire pipeline for a delivery guarantee.
pub fn select_send_pipeline(delivery: DeliveryGuarantee) -> Pipeline {
    match delivery {
        DeliveryGuarantee::Unreliable => Pipeline::UnreliableFragmented,
        DeliveryGuarantee::UnreliableSequenced => Pipeline::UnreliableSequencedFragmented,
        DeliveryGuarantee::Reliable
        | DeliveryGuarantee::ReliableSequenced
        | DeliveryGuarantee::ReliableFragmentedSequenced => Pipeline::ReliableSequenced,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
