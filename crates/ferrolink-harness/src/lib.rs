//! Deterministic simulation harness for the Ferrolink link.
//!
//! Builds a host/MCU [`Link`] pair over a simulated UART with a shared
//! virtual clock and a seeded RNG, plus the invariant checks the
//! scenario tests assert between steps. Everything is synchronous and
//! single-threaded; a failing scenario replays exactly from its seed.

pub mod env;
pub mod invariants;
pub mod wire;

use ferrolink_core::{Link, LinkConfig, Role};
use ferrolink_crypto::SharedSecret;

pub use env::{SimEnv, SimInstant};
pub use wire::{SimUart, sim_pair};

/// The shared secret every scenario provisions on both ends.
pub const TEST_SECRET: &[u8; 15] = b"testsecret12345";

/// A simulated link end.
pub type SimLink = Link<SimUart, SimEnv>;

/// Build an authenticated host/MCU pair over a fresh wire, sharing one
/// virtual clock.
///
/// # Panics
///
/// Panics on configuration errors; the harness config is fixed.
#[must_use]
pub fn link_pair(seed: u64) -> (SimLink, SimLink, SimEnv) {
    let env = SimEnv::new(seed);
    let (host_uart, mcu_uart) = sim_pair();

    let mut host_config = LinkConfig::new(Role::Host);
    host_config.shared_secret = Some(secret());
    #[allow(clippy::unwrap_used)]
    let host = Link::new(host_uart, env.clone(), host_config).unwrap();

    let mut mcu_config = LinkConfig::new(Role::Mcu);
    mcu_config.shared_secret = Some(secret());
    #[allow(clippy::unwrap_used)]
    let mcu = Link::new(mcu_uart, env.clone(), mcu_config).unwrap();

    (host, mcu, env)
}

/// The harness secret as a validated [`SharedSecret`].
///
/// # Panics
///
/// Never: the constant satisfies the secret policy.
#[must_use]
pub fn secret() -> SharedSecret {
    #[allow(clippy::unwrap_used)]
    SharedSecret::new(*TEST_SECRET).unwrap()
}

/// Run both ends for a fixed number of cooperative iterations.
///
/// # Panics
///
/// Panics if either end reports a transport failure; the simulated
/// wire never fails, so any error is a harness bug.
pub fn pump(host: &mut SimLink, mcu: &mut SimLink, iterations: usize) {
    for _ in 0..iterations {
        #[allow(clippy::unwrap_used)]
        {
            host.process().unwrap();
            mcu.process().unwrap();
        }
    }
}

/// Complete the handshake and assert both ends came up.
///
/// # Panics
///
/// Panics when the handshake does not complete within the pump budget.
pub fn synchronize(host: &mut SimLink, mcu: &mut SimLink) {
    #[allow(clippy::unwrap_used)]
    host.begin_handshake().unwrap();
    pump(host, mcu, 8);
    assert!(host.is_synchronized(), "host failed to synchronize");
    assert!(mcu.is_synchronized(), "mcu failed to synchronize");
}
