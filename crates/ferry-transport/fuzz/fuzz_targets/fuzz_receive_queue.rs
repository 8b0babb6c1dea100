#![no_main]

use libfuzzer_sys::fuzz_target;
use ferry_transport::queue::BatchedReceiveQueue;

/// Feed arbitrary chunks (first byte picks the split point) and pop until
/// empty. Must never panic or return more bytes than were pushed.
fuzz_target!(|data: &[u8]| {
    let Some((&split, rest)) = data.split_first() else {
        return;
    };
    let cut = (split as usize).min(rest.len());
    let mut queue = BatchedReceiveQueue::new(&rest[..cut]);
    queue.push_reader(&rest[cut..]);
    let mut popped = 0;
    while let Some(message) = queue.pop_message() {
        popped += message.len();
    }
    assert!(popped <= rest.len());
    assert!(queue.is_empty());
});
