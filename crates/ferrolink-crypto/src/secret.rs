//! Shared-secret hygiene.
//!
//! The secret is an opaque byte string provisioned out of band on both
//! peers (production: 32 bytes of strong entropy). Weak or placeholder
//! values are refused at startup rather than silently accepted.

use thiserror::Error;
use zeroize::Zeroize;

/// Minimum accepted secret length in bytes.
pub const MIN_SECRET_LEN: usize = 8;

/// The literal the stock configuration template ships with. A link
/// "authenticated" by it is not authenticated at all.
const PLACEHOLDER: &[u8] = b"changeme123";

/// Rejected secret material.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretError {
    /// Secret shorter than [`MIN_SECRET_LEN`].
    #[error("shared secret too short: {len} bytes, need at least {MIN_SECRET_LEN}")]
    WeakSecret {
        /// Length of the rejected secret.
        len: usize,
    },

    /// The configuration still carries the template placeholder.
    #[error("shared secret is the placeholder value; provision a real secret")]
    PlaceholderSecret,
}

/// A validated shared secret, zeroized on drop.
pub struct SharedSecret {
    bytes: Vec<u8>,
}

impl SharedSecret {
    /// Validate and take ownership of secret material.
    ///
    /// # Errors
    ///
    /// - [`SecretError::WeakSecret`] for secrets under
    ///   [`MIN_SECRET_LEN`] bytes
    /// - [`SecretError::PlaceholderSecret`] for the literal template
    ///   value
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, SecretError> {
        let bytes = bytes.into();
        if bytes == PLACEHOLDER {
            return Err(SecretError::PlaceholderSecret);
        }
        if bytes.len() < MIN_SECRET_LEN {
            return Err(SecretError::WeakSecret { len: bytes.len() });
        }
        Ok(Self { bytes })
    }

    /// The raw key material.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for SharedSecret {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

// Key material stays out of logs and panic messages.
impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecret").field("len", &self.bytes.len()).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_strong_secret() {
        let secret = SharedSecret::new(*b"testsecret12345").unwrap();
        assert_eq!(secret.as_bytes(), b"testsecret12345");
    }

    #[test]
    fn rejects_placeholder() {
        assert_eq!(SharedSecret::new(*b"changeme123").unwrap_err(), SecretError::PlaceholderSecret);
    }

    #[test]
    fn rejects_short_secret() {
        assert_eq!(
            SharedSecret::new(*b"short")
                .unwrap_err(),
            SecretError::WeakSecret { len: 5 }
        );
    }

    #[test]
    fn eight_bytes_is_the_floor() {
        assert!(SharedSecret::new(*b"8bytes!!").is_ok());
        assert!(SharedSecret::new(*b"7bytes!").is_err());
    }

    #[test]
    fn debug_does_not_leak() {
        let secret = SharedSecret::new(*b"testsecret12345").unwrap();
        let printed = format!("{secret:?}");
        assert!(!printed.contains("testsecret"));
    }
}
