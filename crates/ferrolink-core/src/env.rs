//! Environment abstraction for deterministic testing.
//!
//! Decouples link logic from system resources (time, randomness). The
//! engine is a pure state machine over `Environment::Instant`; the
//! production host uses real time and OS entropy, the harness a
//! virtual clock and a seeded RNG.

use std::time::Duration;

use ferrolink_crypto::NONCE_SIZE;

/// Abstract environment providing time, randomness, and the single
/// async primitive the host driver needs.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards within one execution context
/// - `random_bytes()` uses cryptographically secure entropy in
///   production (handshake nonces come from it)
pub trait Environment: Clone + Send + Sync + 'static {
    /// The instant type used by this environment.
    ///
    /// Production environments use `std::time::Instant`; simulation
    /// environments use virtual time.
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>;

    /// Current time (monotonic).
    fn now(&self) -> Self::Instant;

    /// Sleep for the specified duration.
    ///
    /// The only async method in the trait; used by driver code, never
    /// by the engine itself.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fill the buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// A fresh handshake nonce.
    fn random_nonce(&self) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        self.random_bytes(&mut nonce);
        nonce
    }
}
