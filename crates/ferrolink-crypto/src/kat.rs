//! Startup known-answer tests.
//!
//! Before the link engine accepts any traffic it proves that the
//! hashing and MAC primitives compute the published vectors. A
//! mismatch means a miscompiled or substituted primitive; the only
//! safe response is the terminal fail-safe state, and the caller is
//! expected to route [`CryptoError::KatFailure`] there.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// FIPS 180-4 vector: SHA-256("abc").
const SHA256_ABC: [u8; 32] = [
    0xba, 0x78, 0x16, 0xbf, 0x8f, 0x01, 0xcf, 0xea, 0x41, 0x41, 0x40, 0xde, 0x5d, 0xae, 0x22,
    0x23, 0xb0, 0x03, 0x61, 0xa3, 0x96, 0x17, 0x7a, 0x9c, 0xb4, 0x10, 0xff, 0x61, 0xf2, 0x00,
    0x15, 0xad,
];

/// RFC 4231 test case 2: HMAC-SHA256("Jefe", "what do ya want for nothing?").
const HMAC_JEFE: [u8; 32] = [
    0x5b, 0xdc, 0xc1, 0x46, 0xbf, 0x60, 0x75, 0x4e, 0x6a, 0x04, 0x24, 0x26, 0x08, 0x95, 0x75,
    0xc7, 0x5a, 0x00, 0x3f, 0x08, 0x9d, 0x27, 0x39, 0x83, 0x9d, 0xec, 0x58, 0xb9, 0x64, 0xec,
    0x38, 0x43,
];

/// Run the startup known-answer tests.
///
/// # Errors
///
/// [`CryptoError::KatFailure`] naming the primitive that failed.
pub fn run_startup_kat() -> Result<(), CryptoError> {
    let digest = Sha256::digest(b"abc");
    if digest[..] != SHA256_ABC {
        return Err(CryptoError::KatFailure { primitive: "sha256" });
    }

    let Ok(mut mac) = HmacSha256::new_from_slice(b"Jefe") else {
        unreachable!("HMAC accepts keys of any length");
    };
    mac.update(b"what do ya want for nothing?");
    if mac.verify_slice(&HMAC_JEFE).is_err() {
        return Err(CryptoError::KatFailure { primitive: "hmac-sha256" });
    }

    Ok(())
}
