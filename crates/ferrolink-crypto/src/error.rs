//! Crypto-layer error kinds.

use thiserror::Error;

/// Failures from the handshake and self-test primitives.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// A startup known-answer test produced the wrong digest. Terminal:
    /// the link must enter the fail-safe state and stay there.
    #[error("known-answer test failed for {primitive}")]
    KatFailure {
        /// Which primitive failed its vector.
        primitive: &'static str,
    },

    /// The peer's handshake tag (or echoed nonce) did not verify.
    #[error("handshake authentication failed")]
    HandshakeAuthFailed,

    /// The initiator reused a nonce the responder has already accepted.
    #[error("handshake nonce replayed")]
    NonceReplay,
}
