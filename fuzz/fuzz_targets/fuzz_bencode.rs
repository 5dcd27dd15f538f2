#![no_main]
use libfuzzer_sys::fuzz_target;
use tidal::bencode::BencodeValue;

fuzz_target!(|data: &[u8]| {
    // Parsing must never panic on arbitrary input
    let _ = BencodeValue::parse(data);
    let _ = BencodeValue::parse_exact(data);
});
