//! Run-length encoding for repetitive payloads.
//!
//! `0xFF` is the escape byte. A run is encoded as `0xFF count byte`
//! where `count ∈ 0..=254` means `count + 2` repeats (runs of 2..=256);
//! `count == 255` is the marker for a single literal `0xFF`. Runs
//! longer than [`RLE_MAX_RUN_LENGTH`] are split.
//!
//! Compression is opt-in per payload: the frame header carries no
//! compression flag, so both service layers must agree on which
//! payloads are encoded. [`should_compress`] is the sender-side
//! heuristic.

use crate::errors::RleError;

/// Escape byte introducing a run (or an escaped literal `0xFF`).
pub const RLE_ESCAPE: u8 = 0xFF;

/// Shortest run worth encoding for non-escape bytes; below this the
/// three-byte run sequence loses to plain literals.
pub const RLE_MIN_RUN_LENGTH: usize = 4;

/// Longest run a single escape sequence can express.
pub const RLE_MAX_RUN_LENGTH: usize = 256;

/// Encode `data`. Always reversible by [`decode`]; not guaranteed to
/// shrink (see [`should_compress`]).
#[must_use]
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;

    while i < data.len() {
        let byte = data[i];
        let run = run_length(&data[i..], byte);

        if byte == RLE_ESCAPE {
            if run >= 2 {
                out.extend_from_slice(&[RLE_ESCAPE, (run - 2) as u8, RLE_ESCAPE]);
            } else {
                out.extend_from_slice(&[RLE_ESCAPE, 0xFF]);
            }
        } else if run >= RLE_MIN_RUN_LENGTH {
            out.extend_from_slice(&[RLE_ESCAPE, (run - 2) as u8, byte]);
        } else {
            for _ in 0..run {
                out.push(byte);
            }
        }

        i += run;
    }

    out
}

/// Decode an RLE stream.
///
/// # Errors
///
/// [`RleError::Truncated`] when the input ends inside an escape
/// sequence.
pub fn decode(data: &[u8]) -> Result<Vec<u8>, RleError> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;

    while i < data.len() {
        let byte = data[i];
        if byte != RLE_ESCAPE {
            out.push(byte);
            i += 1;
            continue;
        }

        let Some(&count) = data.get(i + 1) else {
            return Err(RleError::Truncated { offset: i });
        };
        if count == 0xFF {
            out.push(RLE_ESCAPE);
            i += 2;
            continue;
        }

        let Some(&value) = data.get(i + 2) else {
            return Err(RleError::Truncated { offset: i });
        };
        for _ in 0..(count as usize + 2) {
            out.push(value);
        }
        i += 3;
    }

    Ok(out)
}

/// Sender-side heuristic: worth compressing only when the longest run
/// clears the break-even threshold and the encoded form is actually
/// shorter.
#[must_use]
pub fn should_compress(data: &[u8]) -> bool {
    longest_run(data) > RLE_MIN_RUN_LENGTH && encoded_len(data) < data.len()
}

/// Length [`encode`] would produce, without allocating.
#[must_use]
pub fn encoded_len(data: &[u8]) -> usize {
    let mut len = 0;
    let mut i = 0;
    while i < data.len() {
        let byte = data[i];
        let run = run_length(&data[i..], byte);
        len += if byte == RLE_ESCAPE {
            if run >= 2 { 3 } else { 2 }
        } else if run >= RLE_MIN_RUN_LENGTH {
            3
        } else {
            run
        };
        i += run;
    }
    len
}

fn longest_run(data: &[u8]) -> usize {
    let mut longest = 0;
    let mut i = 0;
    while i < data.len() {
        let run = run_length(&data[i..], data[i]);
        longest = longest.max(run);
        i += run;
    }
    longest
}

/// Length of the run of `byte` at the start of `data`, capped at
/// [`RLE_MAX_RUN_LENGTH`] so overlong runs split into several escapes.
fn run_length(data: &[u8], byte: u8) -> usize {
    data.iter().take(RLE_MAX_RUN_LENGTH).take_while(|&&b| b == byte).count()
}
