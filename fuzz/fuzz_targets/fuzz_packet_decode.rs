//! Fuzz target: `Packet::decode`
//!
//! Drives arbitrary byte sequences into the packet decoder and asserts
//! that it never panics, never yields an out-of-limit payload, and that
//! anything it accepts re-encodes to an equivalent packet.
//!
//! cargo fuzz run fuzz_packet_decode

#![no_main]

use embrpc::rpc::packet::{MAX_PAYLOAD_LEN, Packet};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(packet) = Packet::decode(data) else {
        return;
    };
    assert!(packet.payload.len() <= MAX_PAYLOAD_LEN, "payload exceeds limit");

    // Unknown fields are dropped on re-encode, so compare decoded values.
    let buf = packet.encode_to_buffer().expect("decoded packet must re-encode");
    let again = Packet::decode(&buf).expect("re-encoded packet must decode");
    assert_eq!(packet, again);
});
