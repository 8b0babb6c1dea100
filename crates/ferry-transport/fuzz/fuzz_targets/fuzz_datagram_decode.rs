#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use ferry_transport::wire::Datagram;

/// Arbitrary bytes must decode or fail cleanly, and anything that decodes
/// must re-encode to something that decodes to the same datagram.
fuzz_target!(|data: &[u8]| {
    let mut buf = Bytes::copy_from_slice(data);
    if let Ok(datagram) = Datagram::decode(&mut buf) {
        let mut again = datagram.to_bytes();
        assert_eq!(Datagram::decode(&mut again).ok(), Some(datagram));
    }
});
