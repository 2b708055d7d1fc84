//! Error taxonomy for transport, link engine, and dispatcher.
//!
//! Every kind is typed and discriminated so the propagation policy can
//! be mechanical: codec and dispatcher failures answer with a status
//! frame and the RPC continues; link-layer failures surface locally;
//! crypto failures route to the fail-safe state. `std::io::Error` is
//! converted only at the async-I/O boundary, never used internally.

use thiserror::Error;

use ferrolink_crypto::{CryptoError, SecretError};
use ferrolink_proto::{ProtocolError, StatusCode};

/// UART-adapter failures.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// A write delivered only part of its bytes.
    #[error("short write: {written} of {total} bytes")]
    WriteShortfall {
        /// Bytes actually written.
        written: usize,
        /// Bytes requested.
        total: usize,
    },

    /// The write deadline elapsed with bytes remaining.
    #[error("write timed out with bytes remaining")]
    WriteTimeout,

    /// The receive path overran its buffer.
    #[error("receive buffer overflow: {buffered} bytes against a capacity of {capacity}")]
    RxOverflow {
        /// Bytes pending in the RX path.
        buffered: usize,
        /// Configured capacity.
        capacity: usize,
    },
}

/// Why the engine entered the fail-safe state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultReason {
    /// A startup known-answer test failed. Terminal.
    KatFailure,
    /// Handshake authentication failed past the retry budget.
    HandshakeAuthFailed,
    /// The parser could not be resynchronized.
    ParserDesync,
    /// The service layer requested the safe state explicitly.
    External,
}

/// Link-engine failures surfaced to callers of `send_frame` and the
/// status handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Outbound non-system frame before the handshake completed.
    #[error("link not synchronized; refusing command {command_id:#06x}")]
    NotSynchronized {
        /// The refused command id.
        command_id: u16,
    },

    /// The pending-TX queue is full; the frame was not accepted.
    #[error("pending queue full ({depth} frames)")]
    QueueFull {
        /// Configured queue depth.
        depth: usize,
    },

    /// A correlation FIFO (datastore GET / process POLL) is full.
    #[error("request correlation queue full ({depth} entries)")]
    RequestQueueFull {
        /// Configured FIFO depth.
        depth: usize,
    },

    /// All retries exhausted without an ACK.
    #[error("ack timeout for command {command_id:#06x} after {retries} retries")]
    AckTimeout {
        /// The abandoned command.
        command_id: u16,
        /// Retries performed.
        retries: u8,
    },

    /// An ACK frame arrived whose payload named no in-flight command.
    #[error("ack target {target:#06x} does not match in-flight command")]
    MalformedAckTarget {
        /// The id carried in the ACK payload.
        target: u16,
    },

    /// A retransmitted frame was recognized and its handler skipped.
    /// Informational only.
    #[error("duplicate frame suppressed (fingerprint {fingerprint:#010x})")]
    DuplicateSuppressed {
        /// CRC-32 fingerprint of the duplicate.
        fingerprint: u32,
    },

    /// The engine is in the fail-safe state.
    #[error("link faulted: {reason:?}")]
    Faulted {
        /// What drove the engine into the safe state.
        reason: FaultReason,
    },

    /// Wire-format failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// UART-adapter failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Classification failure for an outbound frame.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Handshake or self-test failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Dispatcher-side classification failures.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// Id not in the command taxonomy.
    #[error("unknown command {command_id:#06x}")]
    UnknownCommand {
        /// The unrecognized id.
        command_id: u16,
    },

    /// Command arrived from (or was sent toward) the wrong side.
    #[error("command {command_id:#06x} travelling in the wrong direction")]
    WrongDirection {
        /// The misdirected command.
        command_id: u16,
    },

    /// Payload did not match the command's declared layout.
    #[error("invalid payload for command {command_id:#06x}: {reason}")]
    PayloadShapeInvalid {
        /// The offending command.
        command_id: u16,
        /// Violated rule.
        reason: &'static str,
    },
}

/// Configuration failures at link construction.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Rejected secret material.
    #[error(transparent)]
    Secret(#[from] SecretError),

    /// Watermarks do not satisfy `low < high <= capacity`.
    #[error("flow-control watermarks invalid: low {low}, high {high}, capacity {capacity}")]
    InvalidWatermarks {
        /// Low watermark.
        low: usize,
        /// High watermark.
        high: usize,
        /// RX capacity.
        capacity: usize,
    },
}

/// Terminal resolution of a caller-initiated request at the service
/// boundary. There is no silent-drop path: every request ends in
/// exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The peer answered; response payload attached.
    Ok(Vec<u8>),
    /// No answer within the response timeout.
    Timeout,
    /// The peer answered with an error status.
    PeerError {
        /// Status code the peer sent.
        status: StatusCode,
        /// Human-readable context.
        message: String,
    },
    /// The request never left this side.
    LocalError(LinkError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_render_with_context() {
        let err = LinkError::NotSynchronized { command_id: 0x51 };
        assert!(err.to_string().contains("0x0051"));

        let err = LinkError::QueueFull { depth: 8 };
        assert!(err.to_string().contains('8'));

        let err = DispatchError::PayloadShapeInvalid { command_id: 0x50, reason: "mode" };
        assert!(err.to_string().contains("mode"));
    }

    #[test]
    fn protocol_errors_convert() {
        let err: LinkError = ProtocolError::Overflow { max: 139 }.into();
        assert!(matches!(err, LinkError::Protocol(_)));
    }
}
