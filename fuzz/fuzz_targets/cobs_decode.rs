//! COBS decode must reject malformed bodies without panicking, and
//! encode/decode must stay inverse for every input.

#![no_main]

use ferrolink_proto::cobs;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes as an encoded body: decode may fail, not panic.
    let _ = cobs::decode(data, 4096);

    // The round trip holds for arbitrary source bytes.
    let encoded = cobs::encode(data);
    assert!(!encoded.contains(&0x00));
    assert!(encoded.len() <= cobs::max_encoded_len(data.len()));
    let decoded = cobs::decode(&encoded, data.len().max(1)).expect("own encoding decodes");
    assert_eq!(decoded, data);
});
