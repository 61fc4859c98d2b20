#![no_main]
use libfuzzer_sys::fuzz_target;
use tlsmith_engine::record::Record;
use tlsmith_engine::unit::{Reader, RegisteredUnit};
use tlsmith_engine::{ConnectionState, EngineConfig};

fuzz_target!(|data: &[u8]| {
    let state = ConnectionState::new(EngineConfig::default());
    let mut reader = Reader::new("Record", data);
    while !reader.is_empty() {
        if state
            .registry()
            .decode_from(Record::KIND, &mut reader, &state)
            .is_err()
        {
            break;
        }
    }
});
