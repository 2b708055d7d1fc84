//! Handshake tag computation and verification.
//!
//! The initiator sends a fresh 16-byte random nonce; the responder
//! proves possession of the shared secret by returning
//! `HMAC-SHA256(key, nonce)` truncated to its first 16 bytes. The
//! hardened profile does not use the secret directly but an
//! HKDF-derived subkey, so the raw secret never keys a MAC.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::{error::CryptoError, secret::SharedSecret};

type HmacSha256 = Hmac<Sha256>;

/// Handshake nonce length in bytes.
pub const NONCE_SIZE: usize = 16;

/// Truncated tag length in bytes.
pub const TAG_SIZE: usize = 16;

/// Domain-separation label for the hardened-profile link key.
const LINK_KEY_LABEL: &[u8] = b"ferrolink link key v1";

/// Derive the hardened-profile MAC key from the shared secret.
///
/// Deterministic: both peers derive the same key from the same secret.
#[must_use]
pub fn derive_link_key(secret: &SharedSecret) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, secret.as_bytes());

    let mut key = [0u8; 32];
    let Ok(()) = hkdf.expand(LINK_KEY_LABEL, &mut key) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };

    key
}

/// Compute the handshake tag for a nonce.
#[must_use]
pub fn handshake_tag(key: &[u8], nonce: &[u8; NONCE_SIZE]) -> [u8; TAG_SIZE] {
    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&mac_over_nonce(key, nonce).finalize().into_bytes()[..TAG_SIZE]);
    tag
}

/// Constant-time verification of a peer's truncated tag.
///
/// # Errors
///
/// [`CryptoError::HandshakeAuthFailed`] when the tag does not match.
pub fn verify_handshake_tag(
    key: &[u8],
    nonce: &[u8; NONCE_SIZE],
    tag: &[u8],
) -> Result<(), CryptoError> {
    if tag.len() != TAG_SIZE {
        return Err(CryptoError::HandshakeAuthFailed);
    }
    mac_over_nonce(key, nonce)
        .verify_truncated_left(tag)
        .map_err(|_| CryptoError::HandshakeAuthFailed)
}

fn mac_over_nonce(key: &[u8], nonce: &[u8; NONCE_SIZE]) -> HmacSha256 {
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        unreachable!("HMAC accepts keys of any length");
    };
    mac.update(nonce);
    mac
}
