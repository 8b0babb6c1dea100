//! # Batched Message Queues
//!
//! Application messages are batched to amortize per-datagram overhead.
//! Every message is framed with a little-endian `u32` length prefix:
//!
//! ```text
//! | len (u32 LE) | message bytes | len (u32 LE) | message bytes | ...
//! ```
//!
//! - [`BatchedSendQueue`] accumulates framed messages for one
//!   (connection, pipeline) pair and hands the driver as much as fits in one
//!   packet.
//! - [`BatchedReceiveQueue`] turns a stream of framed bytes back into
//!   discrete messages, tolerating arbitrary chunk boundaries.

mod receive;
mod send;

pub use receive::BatchedReceiveQueue;
pub use send::BatchedSendQueue;

use bytes::{BufMut, Bytes, BytesMut};

/// Bytes added to every message by the length prefix.
pub const PER_MESSAGE_OVERHEAD: usize = 4;

// ─── PacketWriter ────────────────────────────────────────────────────────────

/// Fixed-capacity destination buffer filled from a send queue.
#[derive(Debug)]
pub struct PacketWriter {
    buf: BytesMut,
    capacity: usize,
}

impl PacketWriter {
    pub fn new(capacity: usize) -> Self {
        PacketWriter {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Space left before the writer is full.
    pub fn remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// Append `bytes` if they fit entirely. Returns whether they were written.
    pub fn put_slice(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.remaining() {
            return false;
        }
        self.buf.put_slice(bytes);
        true
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }

    /// Empty the writer for reuse, keeping its capacity.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
