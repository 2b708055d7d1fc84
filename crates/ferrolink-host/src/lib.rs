//! Host-side runtime for the Ferrolink UART RPC link.
//!
//! The MCU runs the polling `Link` from `ferrolink-core`; this crate
//! runs the same engine cooperatively under tokio. [`HostDriver`] is
//! the link task (serial reads, timers, command mailbox), and
//! [`HostHandle`] is what the service layer holds: `send`, `request`,
//! `reset_link`, `snapshot`, `shutdown`.
//!
//! The `ferrolink-hostd` binary wires the driver to a serial device
//! with `tokio-serial` and installs the default host handlers.

pub mod driver;
pub mod env;

pub use driver::{HostDriver, HostError, HostHandle};
pub use env::SystemEnv;
