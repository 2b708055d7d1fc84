//! Virtual clock and seeded randomness.
//!
//! Every scenario runs against a clock the test advances by hand and a
//! `ChaCha8`-seeded RNG, so a failing run replays byte-for-byte from
//! its seed.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use ferrolink_core::{Environment, InstantArithmetic};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Virtual instant, millisecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SimInstant(u64);

impl SimInstant {
    /// Milliseconds since the simulated epoch.
    #[must_use]
    pub fn millis(self) -> u64 {
        self.0
    }
}

impl std::ops::Sub for SimInstant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        Duration::from_millis(self.0 - rhs.0)
    }
}

impl InstantArithmetic for SimInstant {
    fn forward(self, delta: Duration) -> Self {
        Self(self.0 + delta.as_millis() as u64)
    }
}

/// Deterministic [`Environment`] shared by both simulated peers.
#[derive(Clone)]
pub struct SimEnv {
    clock: Arc<AtomicU64>,
    rng: Arc<Mutex<ChaCha8Rng>>,
}

impl SimEnv {
    /// A fresh environment at t=0 with a seeded RNG.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            clock: Arc::new(AtomicU64::new(0)),
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
        }
    }

    /// Advance the shared clock.
    pub fn advance(&self, delta: Duration) {
        self.clock.fetch_add(delta.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Environment for SimEnv {
    type Instant = SimInstant;

    fn now(&self) -> SimInstant {
        SimInstant(self.clock.load(Ordering::SeqCst))
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        let env = self.clone();
        async move {
            env.advance(duration);
        }
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        if let Ok(mut rng) = self.rng.lock() {
            rng.fill_bytes(buffer);
        }
    }
}
