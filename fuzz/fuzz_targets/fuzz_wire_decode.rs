//! Fuzz the wire decoder: arbitrary bytes must never panic, only yield
//! `None` or a well-formed message.

#![no_main]

use bytes::Bytes;
use lattice_mesh::{GSet, Message, WireVersion};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let payload = Bytes::copy_from_slice(data);
    if let Some(message) = Message::<GSet<u64>>::decode(WireVersion::V1, payload) {
        // A decoded message re-encodes to something decodable.
        let reencoded = message.encode(WireVersion::V1);
        assert!(Message::<GSet<u64>>::decode(WireVersion::V1, reencoded).is_some());
    }
});
