//! # Fragmentation Stage
//!
//! Splits a payload into MTU-sized data packets with consecutive sequence
//! numbers (`Start`, `Middle`..., `End`, or a single `Complete`) and glues
//! them back together on receipt. A chain with a missing or out-of-order
//! fragment is dropped: this stage sits under the unreliable pipelines.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::pipeline::Pipeline;
use crate::wire::{DataPacket, Fragment, VarInt, MAX_DATAGRAM_PAYLOAD};

/// Upper bound on concurrently assembling chains per connection and pipeline.
pub const MAX_PENDING_CHAINS: usize = 16;

// ─── Sender Side ─────────────────────────────────────────────────────────────

/// Assigns sequence numbers and splits payloads for one pipeline.
#[derive(Debug)]
pub struct Fragmenter {
    pipeline: Pipeline,
    next_seq: u64,
    max_fragment: usize,
}

impl Fragmenter {
    pub fn new(pipeline: Pipeline) -> Self {
        Self::with_fragment_size(pipeline, MAX_DATAGRAM_PAYLOAD)
    }

    pub fn with_fragment_size(pipeline: Pipeline, max_fragment: usize) -> Self {
        Fragmenter {
            pipeline,
            next_seq: 1,
            max_fragment: max_fragment.max(1),
        }
    }

    /// Split `payload` into one or more data packets.
    pub fn split(&mut self, payload: Bytes) -> Vec<DataPacket> {
        if payload.len() <= self.max_fragment {
            return vec![self.packet(Fragment::Complete, payload)];
        }

        let count = payload.len().div_ceil(self.max_fragment);
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let start = i * self.max_fragment;
            let end = (start + self.max_fragment).min(payload.len());
            let fragment = match i {
                0 => Fragment::Start,
                n if n + 1 == count => Fragment::End,
                _ => Fragment::Middle,
            };
            out.push(self.packet(fragment, payload.slice(start..end)));
        }
        out
    }

    fn packet(&mut self, fragment: Fragment, payload: Bytes) -> DataPacket {
        let sequence = VarInt::saturating(self.next_seq);
        self.next_seq += 1;
        DataPacket {
            pipeline: self.pipeline,
            fragment,
            sequence,
            payload,
        }
    }
}

// ─── Receiver Side ───────────────────────────────────────────────────────────

/// A reassembled message and the sequence number of its first fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembled {
    pub sequence: u64,
    pub payload: Bytes,
}

#[derive(Debug)]
struct FragmentChain {
    data: BytesMut,
    expected_next_seq: u64,
}

/// Reassembles fragment chains. Bounded in chain count and message size.
#[derive(Debug)]
pub struct FragmentAssembler {
    /// In-progress chains keyed by the sequence of their `Start` fragment.
    in_progress: BTreeMap<u64, FragmentChain>,
    max_message: usize,
}

impl FragmentAssembler {
    /// `max_message` caps the reassembled size; longer chains are discarded.
    pub fn new(max_message: usize) -> Self {
        FragmentAssembler {
            in_progress: BTreeMap::new(),
            max_message,
        }
    }

    /// Feed one packet. Returns a message when the packet is unfragmented or
    /// completes a chain.
    pub fn process(&mut self, pkt: DataPacket) -> Option<Assembled> {
        let seq = pkt.sequence.value();

        match pkt.fragment {
            Fragment::Complete => Some(Assembled {
                sequence: seq,
                payload: pkt.payload,
            }),
            Fragment::Start => {
                if self.in_progress.len() >= MAX_PENDING_CHAINS {
                    // Evict the oldest chain; it is almost certainly lost.
                    self.in_progress.pop_first();
                }
                let mut data = BytesMut::with_capacity(pkt.payload.len() * 4);
                data.put(pkt.payload);
                self.in_progress.insert(
                    seq,
                    FragmentChain {
                        data,
                        expected_next_seq: seq + 1,
                    },
                );
                None
            }
            Fragment::Middle => {
                let start = self.find_chain_for(seq)?;
                let chain = self.in_progress.get_mut(&start)?;
                if chain.data.len() + pkt.payload.len() > self.max_message {
                    self.in_progress.remove(&start);
                    return None;
                }
                chain.data.put(pkt.payload);
                chain.expected_next_seq = seq + 1;
                None
            }
            Fragment::End => {
                let start = self.find_chain_for(seq)?;
                let mut chain = self.in_progress.remove(&start)?;
                if chain.data.len() + pkt.payload.len() > self.max_message {
                    return None;
                }
                chain.data.put(pkt.payload);
                Some(Assembled {
                    sequence: start,
                    payload: chain.data.freeze(),
                })
            }
        }
    }

    /// Number of chains waiting for more fragments.
    pub fn pending(&self) -> usize {
        self.in_progress.len()
    }

    /// Find the chain start seq that this seq continues.
    fn find_chain_for(&self, seq: u64) -> Option<u64> {
        self.in_progress
            .iter()
            .rev()
            .find(|(_, chain)| chain.expected_next_seq == seq)
            .map(|(&start, _)| start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>())
    }

    #[test]
    fn small_payload_is_complete() {
        let mut f = Fragmenter::new(Pipeline::UnreliableFragmented);
        let pkts = f.split(Bytes::from_static(b"tiny"));
        assert_eq!(pkts.len(), 1);
        assert_eq!(pkts[0].fragment, Fragment::Complete);
        assert_eq!(pkts[0].sequence.value(), 1);
    }

    #[test]
    fn split_and_reassemble() {
        let mut f = Fragmenter::with_fragment_size(Pipeline::UnreliableFragmented, 100);
        let original = payload(350);
        let pkts = f.split(original.clone());
        let kinds: Vec<Fragment> = pkts.iter().map(|p| p.fragment).collect();
        assert_eq!(
            kinds,
            vec![Fragment::Start, Fragment::Middle, Fragment::Middle, Fragment::End]
        );

        let mut a = FragmentAssembler::new(10_000);
        let mut out = None;
        for p in pkts {
            out = a.process(p);
        }
        let msg = out.unwrap();
        assert_eq!(msg.sequence, 1);
        assert_eq!(msg.payload, original);
        assert_eq!(a.pending(), 0);
    }

    #[test]
    fn missing_middle_drops_chain() {
        let mut f = Fragmenter::with_fragment_size(Pipeline::UnreliableFragmented, 10);
        let mut pkts = f.split(payload(35));
        pkts.remove(1);

        let mut a = FragmentAssembler::new(1000);
        let results: Vec<_> = pkts.into_iter().filter_map(|p| a.process(p)).collect();
        assert!(results.is_empty());
    }

    #[test]
    fn oversized_chain_is_discarded() {
        let mut f = Fragmenter::with_fragment_size(Pipeline::UnreliableFragmented, 10);
        let pkts = f.split(payload(40));
        let mut a = FragmentAssembler::new(25);
        let results: Vec<_> = pkts.into_iter().filter_map(|p| a.process(p)).collect();
        assert!(results.is_empty());
        assert_eq!(a.pending(), 0);
    }

    #[test]
    fn pending_chains_are_bounded() {
        let mut f = Fragmenter::with_fragment_size(Pipeline::UnreliableFragmented, 10);
        let mut a = FragmentAssembler::new(1000);
        for _ in 0..(MAX_PENDING_CHAINS + 4) {
            let start = f.split(payload(25)).remove(0);
            a.process(start);
        }
        assert_eq!(a.pending(), MAX_PENDING_CHAINS);
    }
}
