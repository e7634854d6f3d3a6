#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use voltage_ble_modbus::{Access, DataType, RegisterSpec};

#[derive(Debug, Arbitrary)]
struct Input {
    kind: u8,
    scale: f64,
    offset: i64,
    words: Vec<u16>,
    value: f64,
}

fuzz_target!(|input: Input| {
    let data_type = match input.kind % 4 {
        0 => DataType::U16,
        1 => DataType::I16,
        2 => DataType::U32,
        _ => DataType::I32,
    };
    let spec = RegisterSpec::new("fuzz", 0x0100u16)
        .with_type(data_type)
        .with_scale(input.scale)
        .with_offset(input.offset)
        .with_access(Access::ReadWrite);

    let _ = spec.decode(&input.words);
    let _ = spec.encode(input.value);
});
