use bytes::{Buf, BufMut, BytesMut};

use super::{PacketWriter, PER_MESSAGE_OVERHEAD};

/// Outbound message batch for one (connection, pipeline) pair.
///
/// Holds only unconsumed bytes: [`consume`](Self::consume) drops a prefix
/// permanently, so nothing is ever resent from here. Retransmission belongs
/// to the reliable pipeline below.
#[derive(Debug)]
pub struct BatchedSendQueue {
    data: BytesMut,
    capacity: usize,
}

impl BatchedSendQueue {
    /// Create a queue bounded to `capacity` bytes of framed messages.
    pub fn new(capacity: usize) -> Self {
        BatchedSendQueue {
            data: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Unconsumed bytes, length prefixes included.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append one framed message.
    ///
    /// Returns `false`, leaving the queue untouched, if the framed message
    /// would push the queue past its capacity.
    pub fn push_message(&mut self, message: &[u8]) -> bool {
        let framed = PER_MESSAGE_OVERHEAD + message.len();
        if message.len() > u32::MAX as usize || self.data.len() + framed > self.capacity {
            return false;
        }
        self.data.put_u32_le(message.len() as u32);
        self.data.put_slice(message);
        true
    }

    /// Copy as many whole framed messages as fit into `writer`, never
    /// splitting one. Returns the number of bytes written.
    ///
    /// Used for the unreliable pipelines, where each packet is decoded on
    /// its own at the receiver.
    pub fn fill_writer_with_messages(&self, writer: &mut PacketWriter) -> usize {
        let mut offset = 0;
        while let Some(framed) = self.framed_len_at(offset) {
            if framed > writer.remaining() {
                break;
            }
            writer.put_slice(&self.data[offset..offset + framed]);
            offset += framed;
        }
        offset
    }

    /// Copy a raw run of bytes into `writer`, splitting messages if needed.
    /// Returns the number of bytes written.
    ///
    /// Only valid for the reliable stream; the receiver reassembles with a
    /// [`BatchedReceiveQueue`](super::BatchedReceiveQueue).
    pub fn fill_writer_with_bytes(&self, writer: &mut PacketWriter) -> usize {
        let n = self.data.len().min(writer.remaining());
        writer.put_slice(&self.data[..n]);
        n
    }

    /// Discard the first `n` bytes, previously returned by a fill call.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data.advance(n);
    }

    /// Drop everything, e.g. when the owning connection goes away.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    fn framed_len_at(&self, offset: usize) -> Option<usize> {
        let rest = self.data.get(offset..)?;
        if rest.len() < PER_MESSAGE_OVERHEAD {
            return None;
        }
        let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        let framed = PER_MESSAGE_OVERHEAD + len;
        (rest.len() >= framed).then_some(framed)
    }
}
