//! Production environment: real clock, tokio timers, OS entropy.

use std::time::{Duration, Instant};

use ferrolink_core::Environment;
use rand::RngCore;

/// The host-side [`Environment`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl Environment for SystemEnv {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        rand::rngs::OsRng.fill_bytes(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let env = SystemEnv;
        let a = env.now();
        let b = env.now();
        assert!(b >= a);
    }

    #[test]
    fn nonces_differ() {
        let env = SystemEnv;
        assert_ne!(env.random_nonce(), env.random_nonce());
    }
}
