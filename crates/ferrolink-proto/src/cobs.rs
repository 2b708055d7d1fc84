//! Consistent Overhead Byte Stuffing.
//!
//! COBS removes every `0x00` from a byte sequence so that a single
//! zero byte can unambiguously delimit frames on the wire. Each block
//! starts with a code byte: the distance to the next (removed) zero,
//! or `0xFF` for a maximal 254-byte run with no zero.
//!
//! # Invariants
//!
//! - The encoded output never contains `0x00`.
//! - `decode(encode(src)) == src` for every `src`.
//! - Encoded length is at most `src.len() + src.len() / 254 + 2`.

use crate::errors::CobsError;

/// Worst-case encoded length for `src_len` input bytes.
#[must_use]
pub const fn max_encoded_len(src_len: usize) -> usize {
    src_len + src_len / 254 + 2
}

/// COBS-encode `src`. The output contains no `0x00` byte and no
/// trailing delimiter; the caller appends the delimiter.
#[must_use]
pub fn encode(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(max_encoded_len(src.len()));

    // Index of the pending code byte; patched when the block closes.
    let mut code_idx = 0;
    let mut code: u8 = 1;
    out.push(0);

    for &byte in src {
        if byte == 0 {
            out[code_idx] = code;
            code = 1;
            code_idx = out.len();
            out.push(0);
        } else {
            out.push(byte);
            code += 1;
            if code == 0xFF {
                out[code_idx] = code;
                code = 1;
                code_idx = out.len();
                out.push(0);
            }
        }
    }

    out[code_idx] = code;
    out
}

/// COBS-decode `src` (a complete body between delimiters, without the
/// trailing `0x00`). `max_len` caps the decoded output.
///
/// # Errors
///
/// - [`CobsError::UnexpectedZero`] if a code or data byte is `0x00`
/// - [`CobsError::Truncated`] if a code points past the end of `src`
/// - [`CobsError::TooLong`] if the decoded output would exceed `max_len`
pub fn decode(src: &[u8], max_len: usize) -> Result<Vec<u8>, CobsError> {
    let mut out = Vec::with_capacity(src.len());
    let mut i = 0;

    while i < src.len() {
        let code = src[i];
        if code == 0 {
            return Err(CobsError::UnexpectedZero { offset: i });
        }

        let block_end = i + code as usize;
        if block_end > src.len() {
            return Err(CobsError::Truncated { expected: block_end, actual: src.len() });
        }

        for (j, &byte) in src[i + 1..block_end].iter().enumerate() {
            if byte == 0 {
                return Err(CobsError::UnexpectedZero { offset: i + 1 + j });
            }
            out.push(byte);
        }

        i = block_end;

        // A 0xFF code carries no implicit zero; shorter codes do,
        // unless the block is the last one in the body.
        if i < src.len() && code != 0xFF {
            out.push(0);
        }

        if out.len() > max_len {
            return Err(CobsError::TooLong { max: max_len });
        }
    }

    Ok(out)
}
