//! Ferrolink link core: transport adapter, link engine, dispatcher.
//!
//! This crate turns the pure wire codec of `ferrolink-proto` into a
//! reliable, authenticated, flow-controlled RPC link:
//!
//! - [`engine::LinkEngine`] - handshake (nonce + truncated
//!   HMAC-SHA256 tag), ACK/retry with a bounded pending queue,
//!   duplicate suppression by frame fingerprint, XON/XOFF gating, and
//!   terminal fail-safe entry. A pure state machine in the action
//!   pattern: no I/O, time passed in, effects returned as
//!   [`engine::LinkAction`]s.
//! - [`dispatch::Dispatcher`] - direction and payload-shape checks,
//!   ACK obligation, handler registry.
//! - [`transport::Transport`] - exclusive owner of the UART behind the
//!   [`transport::Uart`] trait, plus the retransmit cache.
//! - [`link::Link`] - the composed polling driver: `process()` once
//!   per main-loop iteration on the MCU; the async host driver in
//!   `ferrolink-host` wraps the same engine.
//!
//! Nothing here persists state; every structure is rebuilt on boot.

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod env;
pub mod error;
pub mod flow;
pub mod fsm;
pub mod link;
pub mod queue;
pub mod transport;

pub use config::{LinkConfig, Role, TimingConfig};
pub use dispatch::{DispatchOutcome, Dispatcher, HandlerReply};
pub use engine::{
    InstantArithmetic, LinkAction, LinkEngine, LinkSnapshot, RequestContext, SendStatus,
    StatusEvent,
};
pub use env::Environment;
pub use error::{
    ConfigError, DispatchError, FaultReason, LinkError, RequestOutcome, TransportError,
};
pub use flow::{FlowControl, FlowSignal};
pub use fsm::{LinkEvent, LinkFsm, LinkState};
pub use link::Link;
pub use transport::{Transport, Uart};
