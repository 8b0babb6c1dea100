use bytes::{Buf, Bytes, BytesMut};

use super::PER_MESSAGE_OVERHEAD;

/// Reassembles framed messages from a byte stream.
///
/// Chunks may split a message (or even its length prefix) anywhere; a
/// message is only returned once all of its bytes have arrived.
#[derive(Debug, Default)]
pub struct BatchedReceiveQueue {
    data: BytesMut,
}

impl BatchedReceiveQueue {
    /// Start a queue from the first received chunk.
    pub fn new(chunk: &[u8]) -> Self {
        BatchedReceiveQueue {
            data: BytesMut::from(chunk),
        }
    }

    /// Append the next chunk of the stream.
    pub fn push_reader(&mut self, chunk: &[u8]) {
        self.data.extend_from_slice(chunk);
    }

    /// Remove and return the oldest complete message, or `None` if only a
    /// partial message is buffered.
    pub fn pop_message(&mut self) -> Option<Bytes> {
        let len = self.next_message_len()?;
        if self.data.len() < PER_MESSAGE_OVERHEAD + len {
            return None;
        }
        self.data.advance(PER_MESSAGE_OVERHEAD);
        Some(self.data.split_to(len).freeze())
    }

    /// True when no complete message can currently be popped.
    pub fn is_empty(&self) -> bool {
        match self.next_message_len() {
            Some(len) => self.data.len() < PER_MESSAGE_OVERHEAD + len,
            None => true,
        }
    }

    /// Raw bytes held, including any partial message.
    pub fn buffered_len(&self) -> usize {
        self.data.len()
    }

    fn next_message_len(&self) -> Option<usize> {
        let prefix = self.data.get(..PER_MESSAGE_OVERHEAD)?;
        Some(u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(messages: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for m in messages {
            out.extend_from_slice(&(m.len() as u32).to_le_bytes());
            out.extend_from_slice(m);
        }
        out
    }

    #[test]
    fn pops_in_stream_order() {
        let mut q = BatchedReceiveQueue::new(&framed(&[b"one", b"two", b""]));
        assert!(!q.is_empty());
        assert_eq!(q.pop_message().unwrap(), "one");
        assert_eq!(q.pop_message().unwrap(), "two");
        assert_eq!(q.pop_message().unwrap(), "");
        assert!(q.pop_message().is_none());
        assert!(q.is_empty());
        assert_eq!(q.buffered_len(), 0);
    }

    #[test]
    fn split_length_prefix_waits() {
        let stream = framed(&[b"hello world"]);
        let mut q = BatchedReceiveQueue::new(&stream[..2]);
        assert!(q.is_empty());
        assert!(q.pop_message().is_none());

        q.push_reader(&stream[2..6]);
        assert!(q.pop_message().is_none());
        assert_eq!(q.buffered_len(), 6);

        q.push_reader(&stream[6..]);
        assert_eq!(q.pop_message().unwrap(), "hello world");
    }

    #[test]
    fn partial_tail_survives_pops() {
        let stream = framed(&[b"a", b"bbbb"]);
        let mut q = BatchedReceiveQueue::new(&stream[..7]);
        assert_eq!(q.pop_message().unwrap(), "a");
        assert!(q.pop_message().is_none());
        assert_eq!(q.buffered_len(), 2);
        q.push_reader(&stream[7..]);
        assert_eq!(q.pop_message().unwrap(), "bbbb");
    }
}
