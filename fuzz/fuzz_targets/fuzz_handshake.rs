#![no_main]
use libfuzzer_sys::fuzz_target;
use tlsmith_engine::handshake;
use tlsmith_engine::{ConnectionState, EngineConfig, Origin, ProtocolUnit};

fuzz_target!(|data: &[u8]| {
    let Some(kind) = handshake::kind_of(data) else {
        return;
    };
    let mut state = ConnectionState::new(EngineConfig::default());
    let unit = state.registry().decode_or_opaque(kind, data, &state);
    let _ = unit.encode();
    let _ = unit.apply(&mut state, Origin::Received);
});
