//! The streaming parser must survive arbitrary wire noise: no panics,
//! and it must stay re-entrant (a valid frame parses after any trash).

#![no_main]

use ferrolink_proto::{Frame, FrameParser};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut parser = FrameParser::new();
    for &byte in data {
        let _ = parser.push(byte);
    }

    // Whatever happened, a clean frame must still parse.
    let frame = Frame::new(0x60, data.iter().copied().take(64).collect::<Vec<u8>>())
        .expect("payload within bounds");
    let mut parsed = None;
    // A leading delimiter flushes any partial garbage.
    let _ = parser.push(0x00);
    for &byte in &frame.encode_wire() {
        if let Ok(Some(f)) = parser.push(byte) {
            parsed = Some(f);
        }
    }
    assert_eq!(parsed, Some(frame));
});
