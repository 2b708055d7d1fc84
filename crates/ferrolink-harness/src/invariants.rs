//! Invariant checks asserted between scenario steps.

use ferrolink_core::{LinkSnapshot, LinkState};

/// After `enter_safe_state`: queues drained, gate cleared, FSM in
/// `Fault`, link unsynchronized.
#[must_use]
pub fn safe_state_clean<I>(snapshot: &LinkSnapshot<I>) -> bool {
    snapshot.pending_tx == 0
        && snapshot.pending_requests == 0
        && !snapshot.synchronized
        && !snapshot.tx_gated
        && snapshot.state == LinkState::Fault
}

/// The FSM never disagrees with the flags that gate behavior.
#[must_use]
pub fn fsm_consistent<I>(snapshot: &LinkSnapshot<I>) -> bool {
    match snapshot.state {
        LinkState::AwaitingAck => snapshot.awaiting_ack && snapshot.synchronized,
        LinkState::Idle => snapshot.synchronized,
        LinkState::Unsynchronized => !snapshot.synchronized,
        LinkState::Fault => !snapshot.synchronized,
    }
}

/// While one ACK-required frame is in flight, nothing else may hold
/// the line: the retry counter stays within the configured budget and
/// later ACK-required frames sit in the pending queue.
#[must_use]
pub fn line_discipline<I>(snapshot: &LinkSnapshot<I>, retry_limit: u8) -> bool {
    snapshot.retry_count <= retry_limit && (snapshot.awaiting_ack || snapshot.retry_count == 0)
}
