//! Ferrolink cryptographic primitives.
//!
//! The link guarantees authenticity, not confidentiality: payloads
//! travel in plaintext over the UART, and the handshake proves that the
//! responder holds the shared secret. Everything here is a pure
//! function over caller-provided bytes; randomness (the handshake
//! nonce) is generated by the caller's environment.
//!
//! # Key lifecycle
//!
//! ```text
//! Shared secret (>= 8 bytes, provisioned out of band)
//!        │
//!        ├── standard profile: HMAC-SHA256 key used directly
//!        │
//!        └── hardened profile: HKDF-SHA256 → per-purpose link key
//!               │
//!               ▼
//!        HMAC-SHA256(key, nonce)[0..16] → handshake tag
//! ```
//!
//! # Security
//!
//! - Tag verification is constant-time (`Mac::verify_truncated_left`);
//!   byte-wise comparison of secret-derived material never happens.
//! - The secret is zeroized on drop and the placeholder value shipped
//!   in old installer images is refused outright.
//! - A known-answer test for both primitives runs at startup; a
//!   mismatch is terminal for the link (fail-safe state).

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod error;
pub mod handshake;
pub mod kat;
pub mod secret;

pub use error::CryptoError;
pub use handshake::{NONCE_SIZE, TAG_SIZE, derive_link_key, handshake_tag, verify_handshake_tag};
pub use kat::run_startup_kat;
pub use secret::{MIN_SECRET_LEN, SecretError, SharedSecret};
