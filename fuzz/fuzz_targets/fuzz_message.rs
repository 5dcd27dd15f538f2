#![no_main]
use libfuzzer_sys::fuzz_target;
use tidal::peer::PeerMessage;

fuzz_target!(|data: &[u8]| {
    // Decoding must never panic; well-formed frames must re-encode
    if let Ok(msg) = PeerMessage::decode(data) {
        let _ = msg.encode();
    }
});
