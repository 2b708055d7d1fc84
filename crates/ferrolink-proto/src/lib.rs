//! Ferrolink wire protocol: framing, integrity, and command taxonomy.
//!
//! The MCU firmware and the host daemon must stay bit-compatible; this
//! crate is the single source of truth for everything that crosses the
//! UART. A frame is
//!
//! ```text
//! COBS(version || payload_length || command_id || payload || crc32) || 0x00
//! ```
//!
//! with all multi-byte integers big-endian and the CRC-32/IEEE-802.3
//! trailer covering header and payload. Payloads are capped at
//! [`MAX_PAYLOAD_SIZE`]; there is no fragmentation.
//!
//! The crate is pure computation: no I/O, no clocks, no logging on the
//! encode/decode paths. Link behavior (ACK/retry, handshake, flow
//! control) lives in `ferrolink-core`.

pub mod cobs;
pub mod command;
pub mod crc;
pub mod errors;
pub mod frame;
pub mod rle;
pub mod status;
pub mod wire;

pub use command::{
    CommandId, CommandMeta, Direction, GENERIC_ACK_TARGET, ReplyKind, SERVICE_RANGE_START,
    SYSTEM_RANGE_END, SYSTEM_RANGE_START,
};
pub use errors::{CobsError, ProtocolError, Result, RleError};
pub use frame::{Frame, FrameParser};
pub use status::{STATUS_RANGE_END, STATUS_RANGE_START, StatusCode};

/// Protocol version byte carried in every frame header.
pub const PROTO_VERSION: u8 = 0x02;

/// Maximum payload length in bytes. Larger payloads are rejected at the
/// sender; there is no fragmentation.
pub const MAX_PAYLOAD_SIZE: usize = 128;

/// Header length: version (1) + payload_length (2) + command_id (2).
pub const HEADER_SIZE: usize = 5;

/// CRC trailer length.
pub const CRC_SIZE: usize = 4;

/// Largest raw (pre-COBS) frame.
pub const MAX_RAW_FRAME_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE + CRC_SIZE;

/// Parser accumulator bound: worst-case COBS expansion of a maximal
/// raw frame.
pub const COBS_BUFFER_SIZE: usize = cobs::max_encoded_len(MAX_RAW_FRAME_SIZE);

/// Wire frame delimiter. COBS guarantees it never appears in a body.
pub const FRAME_DELIMITER: u8 = 0x00;
