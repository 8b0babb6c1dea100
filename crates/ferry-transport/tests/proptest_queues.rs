//! # Property tests: batched send and receive queues
//!
//! - Fill/consume cycles reproduce the framed messages in push order
//! - Receive-queue output does not depend on how the stream is chunked
//! - A rejected push leaves the send queue untouched
//! - Byte fills through a receive queue yield the original messages

use proptest::prelude::*;

use ferry_transport::queue::{
    BatchedReceiveQueue, BatchedSendQueue, PacketWriter, PER_MESSAGE_OVERHEAD,
};

fn messages() -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(prop::collection::vec(any::<u8>(), 0..200), 0..40)
}

fn framed(messages: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for m in messages {
        out.extend_from_slice(&(m.len() as u32).to_le_bytes());
        out.extend_from_slice(m);
    }
    out
}

/// Cut `data` at the given points, taken modulo its length.
fn chunked<'a>(data: &'a [u8], cuts: &[usize]) -> Vec<&'a [u8]> {
    let mut points: Vec<usize> = cuts.iter().map(|c| c % (data.len() + 1)).collect();
    points.sort_unstable();
    points.dedup();
    let mut out = Vec::new();
    let mut start = 0;
    for p in points {
        out.push(&data[start..p]);
        start = p;
    }
    out.push(&data[start..]);
    out
}

proptest! {
    #[test]
    fn proptest_message_fills_concatenate_in_push_order(
        msgs in messages(),
        writer_cap in 204usize..2000,
    ) {
        let mut queue = BatchedSendQueue::new(1 << 20);
        for m in &msgs {
            prop_assert!(queue.push_message(m));
        }

        let mut wire = Vec::new();
        let mut writer = PacketWriter::new(writer_cap);
        while !queue.is_empty() {
            writer.clear();
            let n = queue.fill_writer_with_messages(&mut writer);
            prop_assert!(n > 0);
            prop_assert_eq!(n, writer.len());
            wire.extend_from_slice(writer.as_slice());
            queue.consume(n);
        }
        prop_assert_eq!(wire, framed(&msgs));
    }

    #[test]
    fn proptest_receive_chunking_is_irrelevant(
        msgs in messages(),
        cuts in prop::collection::vec(any::<usize>(), 0..30),
    ) {
        let stream = framed(&msgs);
        let mut queue = BatchedReceiveQueue::default();
        let mut got = Vec::new();
        for chunk in chunked(&stream, &cuts) {
            queue.push_reader(chunk);
            while let Some(m) = queue.pop_message() {
                got.push(m.to_vec());
            }
        }
        prop_assert_eq!(got, msgs);
        prop_assert_eq!(queue.buffered_len(), 0);
        prop_assert!(queue.is_empty());
    }

    #[test]
    fn proptest_rejected_push_leaves_queue_unchanged(
        msgs in messages(),
        capacity in 0usize..2000,
    ) {
        let mut queue = BatchedSendQueue::new(capacity);
        for m in &msgs {
            let before = queue.len();
            let fits = before + PER_MESSAGE_OVERHEAD + m.len() <= capacity;
            prop_assert_eq!(queue.push_message(m), fits);
            if !fits {
                prop_assert_eq!(queue.len(), before);
            }
            prop_assert!(queue.len() <= capacity);
        }
    }

    #[test]
    fn proptest_byte_fills_reassemble_through_receive_queue(
        msgs in messages(),
        writer_cap in 1usize..300,
    ) {
        let mut queue = BatchedSendQueue::new(1 << 20);
        for m in &msgs {
            prop_assert!(queue.push_message(m));
        }

        let mut receiver = BatchedReceiveQueue::default();
        let mut got = Vec::new();
        let mut writer = PacketWriter::new(writer_cap);
        while !queue.is_empty() {
            writer.clear();
            let n = queue.fill_writer_with_bytes(&mut writer);
            receiver.push_reader(writer.as_slice());
            queue.consume(n);
            while let Some(m) = receiver.pop_message() {
                got.push(m.to_vec());
            }
        }
        prop_assert_eq!(got, msgs);
    }
}

#[test]
fn ten_small_messages_fill_one_packet() {
    // Capacity counts framed bytes: 10 * (4 + 10) = 140, plus 5 spare.
    let mut queue = BatchedSendQueue::new(145);
    for i in 0..10u8 {
        assert!(queue.push_message(&[i; 10]));
    }
    assert!(!queue.push_message(&[0xFF; 10]));
    assert_eq!(queue.len(), 140);

    let mut writer = PacketWriter::new(1400);
    assert_eq!(queue.fill_writer_with_messages(&mut writer), 140);
    queue.consume(140);
    assert!(queue.is_empty());

    let mut receiver = BatchedReceiveQueue::new(writer.as_slice());
    let mut count = 0;
    while let Some(m) = receiver.pop_message() {
        assert_eq!(m.as_ref(), &[count as u8; 10]);
        count += 1;
    }
    assert_eq!(count, 10);
}
