//! Explicit link state machine.
//!
//! ```text
//! Unsynchronized --HandshakeComplete--> Idle
//! Idle --SendCritical--> AwaitingAck
//! AwaitingAck --AckReceived|Timeout--> Idle
//! any --Reset--> Unsynchronized
//! any --CryptoFault--> Fault (terminal)
//! ```
//!
//! The FSM is a tracing and assurance aid: the `synchronized` and
//! awaiting-ack flags gate behavior directly, and the FSM mirrors them
//! for telemetry. A `CryptoFault` latches; no event leaves `Fault`.

/// Observable link states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    /// No completed handshake.
    Unsynchronized = 0,
    /// Synchronized, nothing in flight.
    Idle = 1,
    /// An ACK-required frame is holding the line.
    AwaitingAck = 2,
    /// Fail-safe state.
    Fault = 3,
}

/// Events driving the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Handshake verified on this side.
    HandshakeComplete,
    /// An ACK-required frame went out.
    SendCritical,
    /// The in-flight frame was acknowledged.
    AckReceived,
    /// The in-flight frame timed out past its retry budget.
    Timeout,
    /// Link reset (local or peer-initiated).
    Reset,
    /// Unrecoverable cryptographic or integrity failure.
    CryptoFault,
}

/// The machine itself.
#[derive(Debug, Clone)]
pub struct LinkFsm {
    state: LinkState,
}

impl Default for LinkFsm {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkFsm {
    /// A machine in `Unsynchronized`.
    #[must_use]
    pub fn new() -> Self {
        Self { state: LinkState::Unsynchronized }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Apply an event; returns the resulting state.
    ///
    /// Events that have no transition from the current state leave it
    /// unchanged (traced, not an error): the flags that gate behavior
    /// are maintained by the engine, and the FSM must never disagree
    /// with them by rejecting an event.
    pub fn apply(&mut self, event: LinkEvent) -> LinkState {
        use LinkEvent as E;
        use LinkState as S;

        let next = match (self.state, event) {
            (S::Fault, _) => S::Fault,
            (_, E::CryptoFault) => S::Fault,
            (_, E::Reset) => S::Unsynchronized,
            (S::Unsynchronized, E::HandshakeComplete) => S::Idle,
            (S::Idle, E::SendCritical) => S::AwaitingAck,
            (S::AwaitingAck, E::AckReceived | E::Timeout) => S::Idle,
            (state, _) => state,
        };

        if next != self.state {
            tracing::trace!(from = ?self.state, ?event, to = ?next, "link state transition");
        }
        self.state = next;
        next
    }

    /// Out-of-band reset that leaves even `Fault`.
    ///
    /// Ordinary events never exit `Fault`; the engine calls this only
    /// on a fresh `LinkReset`/`LinkSync` round when the fault cause was
    /// recoverable (never after a failed KAT).
    pub fn force_reset(&mut self) {
        if self.state != LinkState::Unsynchronized {
            tracing::trace!(from = ?self.state, "link state force reset");
        }
        self.state = LinkState::Unsynchronized;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let mut fsm = LinkFsm::new();
        assert_eq!(fsm.state(), LinkState::Unsynchronized);
        assert_eq!(fsm.apply(LinkEvent::HandshakeComplete), LinkState::Idle);
        assert_eq!(fsm.apply(LinkEvent::SendCritical), LinkState::AwaitingAck);
        assert_eq!(fsm.apply(LinkEvent::AckReceived), LinkState::Idle);
        assert_eq!(fsm.apply(LinkEvent::SendCritical), LinkState::AwaitingAck);
        assert_eq!(fsm.apply(LinkEvent::Timeout), LinkState::Idle);
    }

    #[test]
    fn reset_from_any_state() {
        for setup in [
            vec![],
            vec![LinkEvent::HandshakeComplete],
            vec![LinkEvent::HandshakeComplete, LinkEvent::SendCritical],
        ] {
            let mut fsm = LinkFsm::new();
            for event in setup {
                fsm.apply(event);
            }
            assert_eq!(fsm.apply(LinkEvent::Reset), LinkState::Unsynchronized);
        }
    }

    #[test]
    fn fault_is_terminal() {
        let mut fsm = LinkFsm::new();
        fsm.apply(LinkEvent::HandshakeComplete);
        assert_eq!(fsm.apply(LinkEvent::CryptoFault), LinkState::Fault);
        for event in [
            LinkEvent::Reset,
            LinkEvent::HandshakeComplete,
            LinkEvent::SendCritical,
            LinkEvent::AckReceived,
        ] {
            assert_eq!(fsm.apply(event), LinkState::Fault);
        }
    }

    #[test]
    fn unmatched_events_keep_state() {
        let mut fsm = LinkFsm::new();
        assert_eq!(fsm.apply(LinkEvent::AckReceived), LinkState::Unsynchronized);
        assert_eq!(fsm.apply(LinkEvent::SendCritical), LinkState::Unsynchronized);
    }
}
