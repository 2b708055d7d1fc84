//! Frame building and streaming parsing.
//!
//! A raw frame is `version || payload_length || command_id || payload
//! || crc32`, all multi-byte fields big-endian. On the wire the raw
//! frame is COBS-encoded and terminated by a single `0x00` delimiter.
//!
//! # Invariants
//!
//! - The CRC trailer is always recomputed and verified; a frame with a
//!   mismatching CRC is never surfaced to the caller.
//! - The parser is re-entrant after every outcome, success or error,
//!   and resynchronizes on the next `0x00` without external help.
//! - A partial frame is silently discarded when a delimiter arrives
//!   early; a lone delimiter between frames is a no-op.

use bytes::Bytes;

use crate::{
    COBS_BUFFER_SIZE, CRC_SIZE, FRAME_DELIMITER, HEADER_SIZE, MAX_PAYLOAD_SIZE, PROTO_VERSION,
    cobs, crc,
    errors::{ProtocolError, Result},
};

/// A validated frame: command id, payload, and the CRC that covered
/// them on the wire.
///
/// The command id is kept raw (`u16`) on purpose: CRC validity does not
/// imply the id is in the taxonomy. Classification is the dispatcher's
/// job and unknown ids must still be answerable with a status frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Wire command id (not yet classified).
    pub command_id: u16,
    /// Owned payload bytes.
    pub payload: Bytes,
    /// CRC-32 over header and payload, as carried on the wire.
    crc: u32,
}

impl Frame {
    /// Build a frame, computing the CRC trailer.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::PayloadTooLarge`] if the payload exceeds
    /// [`MAX_PAYLOAD_SIZE`]; nothing is written anywhere.
    pub fn new(command_id: u16, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let header = header_bytes(command_id, payload.len() as u16);
        let crc = crc::checksum_parts(&[&header, &payload]);
        Ok(Self { command_id, payload, crc })
    }

    /// The CRC-32 of the raw frame, used as the retransmission
    /// fingerprint by the link layer.
    #[must_use]
    pub fn fingerprint(&self) -> u32 {
        self.crc
    }

    /// Serialize to raw (pre-COBS) bytes.
    #[must_use]
    pub fn encode_raw(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len() + CRC_SIZE);
        out.extend_from_slice(&header_bytes(self.command_id, self.payload.len() as u16));
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&self.crc.to_be_bytes());
        out
    }

    /// Serialize to wire bytes: COBS body plus the `0x00` delimiter.
    #[must_use]
    pub fn encode_wire(&self) -> Vec<u8> {
        let mut wire = cobs::encode(&self.encode_raw());
        wire.push(FRAME_DELIMITER);
        wire
    }

    /// Validate raw (COBS-decoded) bytes into a frame.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::Malformed`] on size, version, or
    ///   length-field violations
    /// - [`ProtocolError::CrcMismatch`] when the trailer does not match
    pub fn decode_raw(raw: &[u8]) -> Result<Self> {
        if raw.len() < HEADER_SIZE + CRC_SIZE {
            return Err(ProtocolError::Malformed { reason: "shorter than header plus crc" });
        }
        if raw[0] != PROTO_VERSION {
            return Err(ProtocolError::Malformed { reason: "unsupported protocol version" });
        }

        let payload_len = u16::from_be_bytes([raw[1], raw[2]]) as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::Malformed { reason: "declared payload length too large" });
        }
        if HEADER_SIZE + payload_len + CRC_SIZE != raw.len() {
            return Err(ProtocolError::Malformed { reason: "length field disagrees with frame" });
        }

        let command_id = u16::from_be_bytes([raw[3], raw[4]]);
        let crc_offset = HEADER_SIZE + payload_len;

        // INVARIANT: crc_offset + CRC_SIZE == raw.len(), checked above.
        let stored = u32::from_be_bytes([
            raw[crc_offset],
            raw[crc_offset + 1],
            raw[crc_offset + 2],
            raw[crc_offset + 3],
        ]);
        let computed = crc::checksum(&raw[..crc_offset]);
        if computed != stored {
            return Err(ProtocolError::CrcMismatch { computed, stored });
        }

        Ok(Self {
            command_id,
            payload: Bytes::copy_from_slice(&raw[HEADER_SIZE..crc_offset]),
            crc: stored,
        })
    }
}

fn header_bytes(command_id: u16, payload_len: u16) -> [u8; HEADER_SIZE] {
    let len = payload_len.to_be_bytes();
    let cmd = command_id.to_be_bytes();
    [PROTO_VERSION, len[0], len[1], cmd[0], cmd[1]]
}

/// Streaming frame parser.
///
/// Feed received bytes one at a time with [`FrameParser::push`]; a
/// completed frame is returned when its `0x00` delimiter arrives. The
/// accumulator is owned by the parser and bounded by
/// [`COBS_BUFFER_SIZE`]; once it fills, the parser reports `Overflow`
/// and swallows bytes until the next delimiter resynchronizes it.
#[derive(Debug, Default)]
pub struct FrameParser {
    acc: Vec<u8>,
    discarding: bool,
}

impl FrameParser {
    /// A parser with an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self { acc: Vec::with_capacity(COBS_BUFFER_SIZE), discarding: false }
    }

    /// Bytes currently buffered (flow-control watermark input).
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.acc.len()
    }

    /// Drop any partial frame and leave the parser ready.
    pub fn reset(&mut self) {
        self.acc.clear();
        self.discarding = false;
    }

    /// Consume one received byte.
    ///
    /// Returns `Ok(Some(frame))` when a delimiter completes a valid
    /// frame, `Ok(None)` otherwise.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::Overflow`] when the accumulator fills before
    ///   a delimiter
    /// - [`ProtocolError::CobsDecode`], [`ProtocolError::Malformed`],
    ///   [`ProtocolError::CrcMismatch`] when a completed body fails
    ///   validation
    pub fn push(&mut self, byte: u8) -> Result<Option<Frame>> {
        if byte == FRAME_DELIMITER {
            self.discarding = false;
            if self.acc.is_empty() {
                // Idle separator between frames.
                return Ok(None);
            }
            let body = std::mem::replace(&mut self.acc, Vec::with_capacity(COBS_BUFFER_SIZE));
            let raw = cobs::decode(&body, crate::MAX_RAW_FRAME_SIZE)?;
            return Frame::decode_raw(&raw).map(Some);
        }

        if self.discarding {
            return Ok(None);
        }

        if self.acc.len() >= COBS_BUFFER_SIZE {
            self.acc.clear();
            self.discarding = true;
            return Err(ProtocolError::Overflow { max: COBS_BUFFER_SIZE });
        }

        self.acc.push(byte);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn parse_all(parser: &mut FrameParser, wire: &[u8]) -> Vec<Result<Option<Frame>>> {
        wire.iter().map(|&b| parser.push(b)).collect()
    }

    #[test]
    fn build_and_parse() {
        let frame = Frame::new(0x51, &b"\x0D\x01"[..]).unwrap();
        let wire = frame.encode_wire();
        assert_eq!(*wire.last().unwrap(), 0x00);
        assert!(!wire[..wire.len() - 1].contains(&0x00));

        let mut parser = FrameParser::new();
        let mut frames = Vec::new();
        for &byte in &wire {
            if let Some(frame) = parser.push(byte).unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn oversized_payload_rejected_at_builder() {
        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        let err = Frame::new(0x60, payload).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::PayloadTooLarge { size: MAX_PAYLOAD_SIZE + 1, max: MAX_PAYLOAD_SIZE }
        );
    }

    #[test]
    fn boundary_payload_sizes_accepted() {
        for len in [0, 1, MAX_PAYLOAD_SIZE] {
            let frame = Frame::new(0x60, vec![0xAB; len]).unwrap();
            let raw = frame.encode_raw();
            assert_eq!(Frame::decode_raw(&raw).unwrap(), frame);
        }
    }

    #[test]
    fn oversized_length_field_is_malformed() {
        // Hand-build a raw frame claiming MAX_PAYLOAD_SIZE + 1 bytes.
        let payload_len = (MAX_PAYLOAD_SIZE + 1) as u16;
        let mut raw = vec![PROTO_VERSION];
        raw.extend_from_slice(&payload_len.to_be_bytes());
        raw.extend_from_slice(&0x60u16.to_be_bytes());
        raw.extend_from_slice(&vec![0u8; MAX_PAYLOAD_SIZE + 1]);
        let crc = crc::checksum(&raw);
        raw.extend_from_slice(&crc.to_be_bytes());

        assert!(matches!(Frame::decode_raw(&raw), Err(ProtocolError::Malformed { .. })));
    }

    #[test]
    fn crc_corruption_detected() {
        let frame = Frame::new(0x51, &b"\x0D\x01"[..]).unwrap();
        let mut raw = frame.encode_raw();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        assert!(matches!(Frame::decode_raw(&raw), Err(ProtocolError::CrcMismatch { .. })));
    }

    #[test]
    fn crc_corruption_on_the_wire() {
        let frame = Frame::new(0x51, &b"\x0D\x01"[..]).unwrap();
        let mut raw = frame.encode_raw();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let mut wire = cobs::encode(&raw);
        wire.push(FRAME_DELIMITER);

        let mut parser = FrameParser::new();
        let outcomes = parse_all(&mut parser, &wire);
        assert!(matches!(
            outcomes.last().unwrap(),
            Err(ProtocolError::CrcMismatch { .. })
        ));

        // Parser recovered: the same frame, uncorrupted, parses next.
        let mut parsed = None;
        for &byte in &frame.encode_wire() {
            if let Some(f) = parser.push(byte).unwrap() {
                parsed = Some(f);
            }
        }
        assert_eq!(parsed, Some(frame));
    }

    #[test]
    fn lone_delimiter_is_noop() {
        let mut parser = FrameParser::new();
        assert_eq!(parser.push(0x00).unwrap(), None);
        assert_eq!(parser.push(0x00).unwrap(), None);
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn early_delimiter_discards_partial_frame() {
        let frame = Frame::new(0x60, &b"hello"[..]).unwrap();
        let wire = frame.encode_wire();

        let mut parser = FrameParser::new();
        // Half a frame, then a delimiter: the fragment must not parse.
        for &byte in &wire[..wire.len() / 2] {
            let _ = parser.push(byte);
        }
        assert!(parser.push(0x00).is_err());

        // And the parser is clean afterwards.
        let mut parsed = None;
        for &byte in &wire {
            if let Some(f) = parser.push(byte).unwrap() {
                parsed = Some(f);
            }
        }
        assert_eq!(parsed, Some(frame));
    }

    #[test]
    fn accumulator_overflow_surfaces_overflow_then_resyncs() {
        let mut parser = FrameParser::new();
        let mut saw_overflow = false;
        for _ in 0..COBS_BUFFER_SIZE + 10 {
            match parser.push(0x55) {
                Err(ProtocolError::Overflow { .. }) => saw_overflow = true,
                Err(other) => panic!("unexpected error: {other}"),
                Ok(None) => {},
                Ok(Some(_)) => panic!("no frame expected"),
            }
        }
        assert!(saw_overflow);

        // Delimiter resynchronizes; a valid frame parses afterwards.
        assert_eq!(parser.push(0x00).unwrap(), None);
        let frame = Frame::new(0x60, &b"ok"[..]).unwrap();
        let mut parsed = None;
        for &byte in &frame.encode_wire() {
            if let Some(f) = parser.push(byte).unwrap() {
                parsed = Some(f);
            }
        }
        assert_eq!(parsed, Some(frame));
    }

    proptest! {
        #[test]
        fn wire_round_trip(
            command_id in any::<u16>(),
            payload in prop::collection::vec(any::<u8>(), 0..=MAX_PAYLOAD_SIZE),
        ) {
            let frame = Frame::new(command_id, payload).unwrap();
            let mut parser = FrameParser::new();
            let mut parsed = None;
            for &byte in &frame.encode_wire() {
                if let Some(f) = parser.push(byte).unwrap() {
                    parsed = Some(f);
                }
            }
            prop_assert_eq!(parsed, Some(frame));
        }

        #[test]
        fn crc_is_deterministic(
            command_id in any::<u16>(),
            payload in prop::collection::vec(any::<u8>(), 0..=MAX_PAYLOAD_SIZE),
        ) {
            let frame = Frame::new(command_id, payload).unwrap();
            let raw = frame.encode_raw();
            let trailer = &raw[raw.len() - CRC_SIZE..];
            let recomputed = crc::checksum(&raw[..raw.len() - CRC_SIZE]);
            prop_assert_eq!(trailer, recomputed.to_be_bytes());
            prop_assert_eq!(frame.fingerprint(), recomputed);
        }

        #[test]
        fn garbage_never_panics(noise in prop::collection::vec(any::<u8>(), 0..4096)) {
            let mut parser = FrameParser::new();
            for &byte in &noise {
                let _ = parser.push(byte);
            }
        }
    }
}
