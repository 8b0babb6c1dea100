//! # Ferry Wire Format
//!
//! Every datagram starts with a 5-byte base header:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=1| Kind|  0  |          Connection Token (32, receiver's)    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  ...  |
//! +-+-+-+-+
//! ```
//!
//! The token identifies the receiving side's connection so that datagrams
//! from a previous incarnation of a peer are recognised as stale. A
//! `ConnectRequest` carries token 0.
//!
//! ## Data body
//!
//! ```text
//! | Pipeline (6) | Frag (2) | Sequence (VarInt, 1-8) | Length (16) | Payload |
//! ```
//!
//! ## Ack body (reliable pipeline only)
//!
//! ```text
//! | Cumulative Sequence (VarInt) | SACK bitmap (64) |
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::error::StatusCode;
use crate::pipeline::Pipeline;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest datagram the driver puts on the wire.
pub const MTU: usize = 1400;

/// Flags byte + connection token.
pub const BASE_HEADER_SIZE: usize = 5;

/// Worst-case data header: base + pipeline/fragment byte + 8-byte VarInt + length.
pub const DATA_HEADER_MAX: usize = BASE_HEADER_SIZE + 1 + 8 + 2;

/// Largest payload carried by a single data datagram.
pub const MAX_DATAGRAM_PAYLOAD: usize = MTU - DATA_HEADER_MAX;

// ─── VarInt (QUIC-style, RFC 9000 §16) ──────────────────────────────────────

/// A 62-bit variable-length integer encoded in 1, 2, 4, or 8 bytes.
///
/// Encoding:
/// - `0x00..0x3F` → 1 byte  (6 bits)
/// - `0x40..0x3FFF` → 2 bytes (14 bits), prefix `01`
/// - `0x4000..0x3FFF_FFFF` → 4 bytes (30 bits), prefix `10`
/// - `0x4000_0000..0x3FFF_FFFF_FFFF_FFFF` → 8 bytes (62 bits), prefix `11`
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarInt(u64);

impl VarInt {
    /// Maximum representable value: 2^62 - 1.
    pub const MAX: u64 = (1 << 62) - 1;

    /// Create a VarInt, returning `None` if the value exceeds 62 bits.
    #[inline]
    pub fn new(val: u64) -> Option<Self> {
        (val <= Self::MAX).then_some(VarInt(val))
    }

    /// Create a VarInt from a u64, saturating at [`VarInt::MAX`].
    #[inline]
    pub fn saturating(val: u64) -> Self {
        VarInt(val.min(Self::MAX))
    }

    #[inline]
    pub fn value(self) -> u64 {
        self.0
    }

    /// Number of bytes this value encodes to.
    #[inline]
    pub fn encoded_len(self) -> usize {
        if self.0 < 0x40 {
            1
        } else if self.0 < 0x4000 {
            2
        } else if self.0 < 0x4000_0000 {
            4
        } else {
            8
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        match self.encoded_len() {
            1 => buf.put_u8(self.0 as u8),
            2 => buf.put_u16(0x4000 | self.0 as u16),
            4 => buf.put_u32(0x8000_0000 | self.0 as u32),
            _ => buf.put_u64(0xC000_0000_0000_0000 | self.0),
        }
    }

    /// Decode from a buffer. Returns `None` if the buffer is too short.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if !buf.has_remaining() {
            return None;
        }
        let first = buf.chunk()[0];
        let len = 1usize << (first >> 6);
        if buf.remaining() < len {
            return None;
        }

        let val = match len {
            1 => (buf.get_u8() & 0x3F) as u64,
            2 => (buf.get_u16() & 0x3FFF) as u64,
            4 => (buf.get_u32() & 0x3FFF_FFFF) as u64,
            _ => buf.get_u64() & 0x3FFF_FFFF_FFFF_FFFF,
        };
        Some(VarInt(val))
    }
}

impl fmt::Debug for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VarInt({})", self.0)
    }
}

impl fmt::Display for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u32> for VarInt {
    fn from(v: u32) -> Self {
        VarInt(v as u64)
    }
}

// ─── Packet Kind ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    ConnectRequest = 0,
    ConnectAccept = 1,
    Disconnect = 2,
    Heartbeat = 3,
    Data = 4,
    Ack = 5,
}

impl PacketKind {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(PacketKind::ConnectRequest),
            1 => Some(PacketKind::ConnectAccept),
            2 => Some(PacketKind::Disconnect),
            3 => Some(PacketKind::Heartbeat),
            4 => Some(PacketKind::Data),
            5 => Some(PacketKind::Ack),
            _ => None,
        }
    }
}

// ─── Fragment Flags ──────────────────────────────────────────────────────────

/// Fragmentation status of a data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Fragment {
    /// Complete message (not fragmented).
    Complete = 0b00,
    /// First fragment.
    Start = 0b01,
    /// Middle fragment.
    Middle = 0b10,
    /// Last fragment.
    End = 0b11,
}

impl Fragment {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => Fragment::Complete,
            0b01 => Fragment::Start,
            0b10 => Fragment::Middle,
            _ => Fragment::End,
        }
    }
}

// ─── Bodies ──────────────────────────────────────────────────────────────────

/// One pipeline packet: a whole message or one fragment of it, or for the
/// reliable pipeline a slice of the connection's byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub pipeline: Pipeline,
    pub fragment: Fragment,
    pub sequence: VarInt,
    pub payload: Bytes,
}

impl DataPacket {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8((self.pipeline.wire_id() << 2) | self.fragment as u8);
        self.sequence.encode(buf);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
    }

    fn decode(buf: &mut impl Buf) -> Option<Self> {
        if !buf.has_remaining() {
            return None;
        }
        let b = buf.get_u8();
        let pipeline = Pipeline::from_wire_id(b >> 2)?;
        let fragment = Fragment::from_bits(b);
        let sequence = VarInt::decode(buf)?;
        if buf.remaining() < 2 {
            return None;
        }
        let len = buf.get_u16() as usize;
        if buf.remaining() < len {
            return None;
        }
        let payload = buf.copy_to_bytes(len);
        Some(DataPacket {
            pipeline,
            fragment,
            sequence,
            payload,
        })
    }

    pub fn encoded_len(&self) -> usize {
        BASE_HEADER_SIZE + 1 + self.sequence.encoded_len() + 2 + self.payload.len()
    }
}

/// ACK packet: cumulative acknowledgment + selective ACK bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckPacket {
    /// Highest contiguously received sequence number (0 = none yet).
    pub cumulative_seq: VarInt,
    /// Bitmap of received packets beyond cumulative_seq.
    /// Bit 0 = cumulative_seq + 1, Bit 1 = cumulative_seq + 2, etc.
    pub sack_bitmap: u64,
}

impl AckPacket {
    fn encode(&self, buf: &mut BytesMut) {
        self.cumulative_seq.encode(buf);
        buf.put_u64(self.sack_bitmap);
    }

    fn decode(buf: &mut impl Buf) -> Option<Self> {
        let cumulative_seq = VarInt::decode(buf)?;
        if buf.remaining() < 8 {
            return None;
        }
        let sack_bitmap = buf.get_u64();
        Some(AckPacket {
            cumulative_seq,
            sack_bitmap,
        })
    }

    /// Iterate the specific sequence numbers acknowledged by the SACK bitmap.
    pub fn sacked_sequences(&self) -> impl Iterator<Item = u64> + '_ {
        (0..64).filter_map(move |i| {
            if self.sack_bitmap & (1u64 << i) != 0 {
                Some(self.cumulative_seq.value() + 1 + i)
            } else {
                None
            }
        })
    }
}

/// Datagram body, one per packet kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    ConnectRequest { client_token: u32 },
    ConnectAccept { server_token: u32 },
    Disconnect,
    Heartbeat,
    Data(DataPacket),
    Ack(AckPacket),
}

impl Body {
    pub fn kind(&self) -> PacketKind {
        match self {
            Body::ConnectRequest { .. } => PacketKind::ConnectRequest,
            Body::ConnectAccept { .. } => PacketKind::ConnectAccept,
            Body::Disconnect => PacketKind::Disconnect,
            Body::Heartbeat => PacketKind::Heartbeat,
            Body::Data(_) => PacketKind::Data,
            Body::Ack(_) => PacketKind::Ack,
        }
    }
}

// ─── Datagram ────────────────────────────────────────────────────────────────

/// A complete wire datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Token of the receiving side's connection.
    pub token: u32,
    pub body: Body,
}

impl Datagram {
    pub fn new(token: u32, body: Body) -> Self {
        Datagram { token, body }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let flags = ((PROTOCOL_VERSION & 0x03) << 6) | ((self.body.kind() as u8 & 0x07) << 3);
        buf.put_u8(flags);
        buf.put_u32(self.token);
        match &self.body {
            Body::ConnectRequest { client_token } => buf.put_u32(*client_token),
            Body::ConnectAccept { server_token } => buf.put_u32(*server_token),
            Body::Disconnect | Body::Heartbeat => {}
            Body::Data(data) => data.encode(buf),
            Body::Ack(ack) => ack.encode(buf),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MTU);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode a datagram.
    ///
    /// Fails with [`StatusCode::NetworkVersionMismatch`] for a foreign
    /// protocol version and [`StatusCode::NetworkHeaderInvalid`] for anything
    /// truncated or unrecognised.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, StatusCode> {
        if buf.remaining() < BASE_HEADER_SIZE {
            return Err(StatusCode::NetworkHeaderInvalid);
        }
        let flags = buf.get_u8();
        if (flags >> 6) & 0x03 != PROTOCOL_VERSION {
            return Err(StatusCode::NetworkVersionMismatch);
        }
        let kind =
            PacketKind::from_bits((flags >> 3) & 0x07).ok_or(StatusCode::NetworkHeaderInvalid)?;
        let token = buf.get_u32();

        let body = match kind {
            PacketKind::ConnectRequest | PacketKind::ConnectAccept => {
                if buf.remaining() < 4 {
                    return Err(StatusCode::NetworkHeaderInvalid);
                }
                let peer_token = buf.get_u32();
                if kind == PacketKind::ConnectRequest {
                    Body::ConnectRequest {
                        client_token: peer_token,
                    }
                } else {
                    Body::ConnectAccept {
                        server_token: peer_token,
                    }
                }
            }
            PacketKind::Disconnect => Body::Disconnect,
            PacketKind::Heartbeat => Body::Heartbeat,
            PacketKind::Data => {
                Body::Data(DataPacket::decode(buf).ok_or(StatusCode::NetworkHeaderInvalid)?)
            }
            PacketKind::Ack => {
                Body::Ack(AckPacket::decode(buf).ok_or(StatusCode::NetworkHeaderInvalid)?)
            }
        };
        Ok(Datagram { token, body })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn varint_boundary_strategy() -> impl Strategy<Value = u64> {
        prop_oneof![
            Just(0u64),
            Just(0x3F),
            Just(0x40),
            Just(0x3FFF),
            Just(0x4000),
            Just(0x3FFF_FFFF),
            Just(0x4000_0000),
            Just(VarInt::MAX),
            0u64..=VarInt::MAX,
        ]
    }

    proptest! {
        #[test]
        fn proptest_varint_roundtrip(val in varint_boundary_strategy()) {
            let v = VarInt::new(val).unwrap();
            let mut buf = BytesMut::new();
            v.encode(&mut buf);
            prop_assert_eq!(buf.len(), v.encoded_len());
            prop_assert_eq!(VarInt::decode(&mut buf.freeze()).unwrap().value(), val);
        }

        #[test]
        fn proptest_decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = Datagram::decode(&mut Bytes::from(data));
        }
    }

    #[test]
    fn varint_out_of_range() {
        assert!(VarInt::new(VarInt::MAX + 1).is_none());
        assert_eq!(VarInt::saturating(u64::MAX).value(), VarInt::MAX);
    }

    #[test]
    fn data_datagram_roundtrip() {
        let dgram = Datagram::new(
            0xDEAD_BEEF,
            Body::Data(DataPacket {
                pipeline: Pipeline::ReliableSequenced,
                fragment: Fragment::Middle,
                sequence: VarInt::from(300u32),
                payload: Bytes::from_static(b"hello"),
            }),
        );
        let mut bytes = dgram.to_bytes();
        let len = bytes.len();
        if let Body::Data(d) = &dgram.body {
            assert_eq!(d.encoded_len(), len);
        }
        assert_eq!(Datagram::decode(&mut bytes).unwrap(), dgram);
    }

    #[test]
    fn control_datagrams_roundtrip() {
        for body in [
            Body::ConnectRequest { client_token: 7 },
            Body::ConnectAccept { server_token: 9 },
            Body::Disconnect,
            Body::Heartbeat,
            Body::Ack(AckPacket {
                cumulative_seq: VarInt::from(41u32),
                sack_bitmap: 0b101,
            }),
        ] {
            let dgram = Datagram::new(11, body);
            assert_eq!(Datagram::decode(&mut dgram.to_bytes()).unwrap(), dgram);
        }
    }

    #[test]
    fn worst_case_data_header_fits_mtu() {
        let data = DataPacket {
            pipeline: Pipeline::UnreliableFragmented,
            fragment: Fragment::Start,
            sequence: VarInt::saturating(VarInt::MAX),
            payload: Bytes::from(vec![0u8; MAX_DATAGRAM_PAYLOAD]),
        };
        assert_eq!(data.encoded_len(), MTU);
    }

    #[test]
    fn wrong_version_is_reported() {
        let mut raw = Datagram::new(1, Body::Heartbeat).to_bytes().to_vec();
        raw[0] = (raw[0] & 0x3F) | (2 << 6);
        assert_eq!(
            Datagram::decode(&mut Bytes::from(raw)),
            Err(StatusCode::NetworkVersionMismatch)
        );
    }

    #[test]
    fn truncated_and_unknown_are_header_invalid() {
        assert_eq!(
            Datagram::decode(&mut Bytes::from_static(&[0x40, 0, 0])),
            Err(StatusCode::NetworkHeaderInvalid)
        );
        // kind 7 is unassigned
        let raw = [(1u8 << 6) | (7 << 3), 0, 0, 0, 1];
        assert_eq!(
            Datagram::decode(&mut Bytes::copy_from_slice(&raw)),
            Err(StatusCode::NetworkHeaderInvalid)
        );
        // data length longer than what follows
        let mut raw = Datagram::new(
            1,
            Body::Data(DataPacket {
                pipeline: Pipeline::UnreliableFragmented,
                fragment: Fragment::Complete,
                sequence: VarInt::from(1u32),
                payload: Bytes::from_static(b"abcdef"),
            }),
        )
        .to_bytes()
        .to_vec();
        raw.truncate(raw.len() - 2);
        assert_eq!(
            Datagram::decode(&mut Bytes::from(raw)),
            Err(StatusCode::NetworkHeaderInvalid)
        );
    }

    #[test]
    fn sack_iterator() {
        let ack = AckPacket {
            cumulative_seq: VarInt::from(10u32),
            sack_bitmap: 0b1001,
        };
        let seqs: Vec<u64> = ack.sacked_sequences().collect();
        assert_eq!(seqs, vec![11, 14]);
    }
}
