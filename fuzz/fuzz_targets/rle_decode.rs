//! RLE decode must reject truncated escapes without panicking, and the
//! encoder's output must always decode back to the source.

#![no_main]

use ferrolink_proto::rle;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = rle::decode(data);

    let encoded = rle::encode(data);
    assert_eq!(rle::encoded_len(data), encoded.len());
    assert_eq!(rle::decode(&encoded).expect("own encoding decodes"), data);
});
