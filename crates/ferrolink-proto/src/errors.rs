//! Typed errors for the wire codec.
//!
//! Every decode failure is discriminated so the link layer can answer
//! with the matching status frame (`Malformed`, `CrcMismatch`,
//! `Overflow`) and the caller can tell a corrupt wire from a local
//! misuse (`PayloadTooLarge`). We avoid `std::io::Error` entirely; the
//! codec never touches I/O.

use thiserror::Error;

/// Errors surfaced by COBS decoding.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CobsError {
    /// A code byte (or a stuffed data byte) was `0x00`, which cannot
    /// appear inside a COBS body.
    #[error("unexpected zero byte inside COBS body at offset {offset}")]
    UnexpectedZero {
        /// Offset of the offending byte within the encoded input.
        offset: usize,
    },

    /// A code byte pointed past the end of the encoded input.
    #[error("COBS code overruns input: block ends at {expected}, input is {actual} bytes")]
    Truncated {
        /// Where the current block claimed to end.
        expected: usize,
        /// Actual input length.
        actual: usize,
    },

    /// The decoded output would exceed the caller's length cap.
    #[error("decoded length exceeds cap of {max} bytes")]
    TooLong {
        /// Maximum decoded length allowed by the caller.
        max: usize,
    },
}

/// Errors surfaced by frame building and parsing.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// The COBS body between delimiters did not decode.
    #[error("cobs decode failed: {0}")]
    CobsDecode(#[from] CobsError),

    /// The CRC trailer did not match the frame contents.
    #[error("crc mismatch: computed {computed:#010x}, frame carries {stored:#010x}")]
    CrcMismatch {
        /// CRC-32 recomputed over the received header and payload.
        computed: u32,
        /// CRC-32 carried in the frame trailer.
        stored: u32,
    },

    /// The decoded frame violated a structural rule (size, version,
    /// or length-field consistency).
    #[error("malformed frame: {reason}")]
    Malformed {
        /// Which structural rule failed.
        reason: &'static str,
    },

    /// The caller asked to build a frame with an oversized payload.
    /// Nothing is written to the wire.
    #[error("payload too large: {size} bytes exceeds {max}")]
    PayloadTooLarge {
        /// Requested payload size.
        size: usize,
        /// Protocol maximum ([`crate::MAX_PAYLOAD_SIZE`]).
        max: usize,
    },

    /// The parser accumulator filled up before a delimiter arrived.
    /// Distinct from [`ProtocolError::Malformed`]: the peer is sending
    /// something that cannot be a frame at all.
    #[error("cobs body overflow: accumulator cap is {max} bytes")]
    Overflow {
        /// Accumulator capacity ([`crate::COBS_BUFFER_SIZE`]).
        max: usize,
    },
}

/// Errors surfaced by the RLE decoder.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RleError {
    /// The input ended in the middle of an escape sequence.
    #[error("truncated RLE escape at offset {offset}")]
    Truncated {
        /// Offset of the incomplete escape byte.
        offset: usize,
    },
}

/// Convenience alias used throughout the codec.
pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;
