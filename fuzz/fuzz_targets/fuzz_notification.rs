#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use voltage_ble_modbus::{FrameCodec, LinkFraming, Response};

#[derive(Debug, Arbitrary)]
struct Input {
    slave_id: u8,
    headerless: bool,
    status_rejects: bool,
    data: Vec<u8>,
}

// Any notification the radio delivers must decode or fail, never panic.
fuzz_target!(|input: Input| {
    let framing = if input.headerless {
        LinkFraming::bare()
    } else {
        LinkFraming::default()
    }
    .with_status_sentinel_rejects(input.status_rejects);
    let mut codec = FrameCodec::new(input.slave_id, framing);

    if let Ok(Response::Registers(words)) = codec.decode(&input.data) {
        assert!(words.len() * 2 <= input.data.len());
    }
});
