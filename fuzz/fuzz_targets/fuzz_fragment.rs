#![no_main]
use libfuzzer_sys::fuzz_target;
use tlsmith_engine::fragment::{reassemble, split, OverlapPolicy};
use tlsmith_engine::handshake::HandshakeType;

fuzz_target!(|data: &[u8]| {
    let Some((&max, bytes)) = data.split_first() else {
        return;
    };
    let max = usize::from(max).max(1);
    let mut fragments = split(HandshakeType::CERTIFICATE.kind(), 0, bytes, max);
    fragments.reverse();
    let Ok(reassembled) = reassemble(&fragments, OverlapPolicy::Strict) else {
        panic!("reassembly of a complete split failed");
    };
    assert_eq!(reassembled.bytes, bytes);
});
