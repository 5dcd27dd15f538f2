#![no_main]
use libfuzzer_sys::fuzz_target;
use tidal::MagnetUri;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        // Parsing must never panic on arbitrary URIs
        let _ = MagnetUri::parse(s);
    }
});
