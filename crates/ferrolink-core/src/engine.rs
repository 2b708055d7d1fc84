//! The link engine: handshake, ACK/retry, duplicate suppression,
//! transmission gating, and fail-safe entry.
//!
//! The engine is a pure state machine. It performs no I/O and reads no
//! clock: methods take the current instant as a parameter and return
//! [`LinkAction`]s for the driver to execute. This keeps every link
//! rule testable against a virtual clock and makes the same engine run
//! under the MCU polling loop and the host async driver.
//!
//! Received frames enter through [`LinkEngine::handle_frame`], which
//! classifies them (status? link control? regular command?), updates
//! ACK/retry state and the duplicate fingerprint, and either answers
//! directly or emits a [`LinkAction::Dispatch`] for the command
//! dispatcher. Outbound frames enter through
//! [`LinkEngine::send_frame`] and are sent, enqueued, or rejected.

use std::{collections::BTreeSet, time::Duration};

use ferrolink_crypto::{
    NONCE_SIZE, SharedSecret, TAG_SIZE, derive_link_key, handshake_tag, run_startup_kat,
    verify_handshake_tag,
};
use ferrolink_proto::{
    CommandId, Frame, GENERIC_ACK_TARGET, ReplyKind, StatusCode, wire::put_u16,
};

use crate::{
    config::{Role, TimingConfig},
    dispatch::DispatchOutcome,
    env::Environment,
    error::{DispatchError, FaultReason, LinkError},
    flow::FlowSignal,
    fsm::{LinkEvent, LinkFsm, LinkState},
    queue::{PENDING_TX_DEPTH, PendingTx, QueuedFrame, REQUEST_FIFO_DEPTH, RequestFifo},
};

/// Consecutive handshake rejections before the initiator gives up and
/// enters the fail-safe state.
pub const HANDSHAKE_MAX_REJECTIONS: u8 = 5;

/// Handshake retry backoff base.
const HANDSHAKE_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Handshake retry backoff cap.
const HANDSHAKE_BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Instruction from the engine to its driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    /// Write these wire bytes. With `cache` set, the transport stores
    /// them for byte-for-byte retransmission.
    Transmit {
        /// Complete wire frame including the delimiter.
        wire: Vec<u8>,
        /// Store in the retransmit cache.
        cache: bool,
    },

    /// Replay the retransmit cache.
    Retransmit,

    /// Drop the retransmit cache.
    ClearCache,

    /// Hand a received command to the dispatcher.
    Dispatch {
        /// The validated frame.
        frame: Frame,
        /// Correlation state popped for a `*Resp` frame, if any.
        context: Option<RequestContext>,
    },

    /// Surface a status event to the local status handler.
    Notify(StatusEvent),

    /// Reset the receive path (parser accumulator and flow state).
    ResetRx,

    /// Return these GPIO pins to high-impedance input (safe state).
    ResetPins(Vec<u8>),
}

/// Correlation for responses that do not echo their request key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestContext {
    /// The key of the oldest in-flight datastore GET.
    DatastoreKey(Vec<u8>),
    /// The PID of the oldest in-flight process POLL.
    ProcessPid(u16),
}

/// A status surfaced to the local status handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusEvent {
    /// The status code.
    pub code: StatusCode,
    /// The command it refers to, or [`GENERIC_ACK_TARGET`].
    pub command_id: u16,
}

/// How `send_frame` disposed of an accepted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Written to the wire (actions carry the bytes).
    Sent,
    /// Parked on the pending-TX queue.
    Enqueued,
}

/// Result of an accepted `send_frame`.
#[derive(Debug)]
pub struct SendResult {
    /// Sent or enqueued.
    pub status: SendStatus,
    /// Actions for the driver.
    pub actions: Vec<LinkAction>,
}

/// Telemetry snapshot of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSnapshot<I> {
    /// Frames on the pending-TX queue.
    pub pending_tx: usize,
    /// In-flight correlation entries (GETs plus POLLs).
    pub pending_requests: usize,
    /// An ACK-required frame is holding the line.
    pub awaiting_ack: bool,
    /// Command id of the last frame written to the wire.
    pub last_command_id: Option<u16>,
    /// When the last frame was written.
    pub last_send_at: Option<I>,
    /// Retries performed for the in-flight frame.
    pub retry_count: u8,
    /// Handshake completed.
    pub synchronized: bool,
    /// Peer has XOFF'd us.
    pub tx_gated: bool,
    /// FSM state.
    pub state: LinkState,
}

#[derive(Debug, Clone, Copy)]
struct InFlight<I> {
    command_id: u16,
    sent_at: I,
    retries: u8,
}

#[derive(Debug, Clone, Copy)]
enum Handshake<I> {
    Inactive,
    Awaiting { nonce: [u8; NONCE_SIZE], sent_at: I, rejections: u8, retry_at: Option<I> },
}

/// The link engine. See the module docs for the control flow.
pub struct LinkEngine<I> {
    role: Role,
    timing: TimingConfig,
    secret: Option<SharedSecret>,
    hardened: bool,

    fsm: LinkFsm,
    synchronized: bool,
    fault: Option<FaultReason>,

    awaiting: Option<InFlight<I>>,
    pending: PendingTx,
    pending_gets: RequestFifo<Vec<u8>>,
    pending_polls: RequestFifo<u16>,
    tx_gated: bool,

    last_rx: Option<(u32, I)>,
    handshake: Handshake<I>,
    last_accepted_nonce: Option<[u8; NONCE_SIZE]>,
    configured_pins: BTreeSet<u8>,

    last_command_id: Option<u16>,
    last_send_at: Option<I>,
}

impl<I> LinkEngine<I>
where
    I: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration> + InstantArithmetic,
{
    /// Build an engine and run the startup known-answer tests.
    ///
    /// A KAT failure does not prevent construction: the engine comes up
    /// already in the terminal fail-safe state so that `send_frame`
    /// callers see the typed error and telemetry sees `Fault`.
    pub fn new(
        role: Role,
        timing: TimingConfig,
        secret: Option<SharedSecret>,
        hardened: bool,
    ) -> Self {
        let mut fsm = LinkFsm::new();
        let fault = match run_startup_kat() {
            Ok(()) => None,
            Err(err) => {
                tracing::error!(%err, "startup KAT failed; link is fail-safe");
                fsm.apply(LinkEvent::CryptoFault);
                Some(FaultReason::KatFailure)
            },
        };

        Self {
            role,
            timing,
            secret,
            hardened,
            fsm,
            synchronized: false,
            fault,
            awaiting: None,
            pending: PendingTx::new(),
            pending_gets: RequestFifo::new(),
            pending_polls: RequestFifo::new(),
            tx_gated: false,
            last_rx: None,
            handshake: Handshake::Inactive,
            last_accepted_nonce: None,
            configured_pins: BTreeSet::new(),
            last_command_id: None,
            last_send_at: None,
        }
    }

    /// Handshake completed and the link not reset since.
    #[must_use]
    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    /// Current FSM state.
    #[must_use]
    pub fn state(&self) -> LinkState {
        self.fsm.state()
    }

    /// The active timing knobs.
    #[must_use]
    pub fn timing(&self) -> TimingConfig {
        self.timing
    }

    /// Telemetry snapshot.
    #[must_use]
    pub fn snapshot(&self) -> LinkSnapshot<I> {
        LinkSnapshot {
            pending_tx: self.pending.len(),
            pending_requests: self.pending_gets.len() + self.pending_polls.len(),
            awaiting_ack: self.awaiting.is_some(),
            last_command_id: self.last_command_id,
            last_send_at: self.last_send_at,
            retry_count: self.awaiting.map_or(0, |inflight| inflight.retries),
            synchronized: self.synchronized,
            tx_gated: self.tx_gated,
            state: self.fsm.state(),
        }
    }

    /// Initiate the handshake (host side).
    ///
    /// # Errors
    ///
    /// - [`LinkError::Faulted`] in the fail-safe state
    /// - [`DispatchError::WrongDirection`] when called on the MCU role
    pub fn begin_handshake<E>(&mut self, env: &E, now: I) -> Result<Vec<LinkAction>, LinkError>
    where
        E: Environment<Instant = I>,
    {
        if let Some(reason) = self.fault {
            return Err(LinkError::Faulted { reason });
        }
        if self.role != Role::Host {
            return Err(DispatchError::WrongDirection {
                command_id: CommandId::LinkSync.to_u16(),
            }
            .into());
        }

        let nonce = env.random_nonce();
        self.handshake = Handshake::Awaiting { nonce, sent_at: now, rejections: 0, retry_at: None };
        self.synchronized = false;

        let mut actions = Vec::new();
        self.transmit_raw(CommandId::LinkSync.to_u16(), &nonce, false, now, &mut actions);
        tracing::debug!("handshake initiated");
        Ok(actions)
    }

    /// Queue or send an outbound frame on behalf of the service layer.
    ///
    /// # Errors
    ///
    /// Every rejection is typed: unknown command, wrong direction,
    /// invalid payload shape, oversized payload, unsynchronized link,
    /// full queue, or fail-safe state. Nothing reaches the wire on an
    /// error.
    pub fn send_frame(
        &mut self,
        command_id: u16,
        payload: &[u8],
        now: I,
    ) -> Result<SendResult, LinkError> {
        if let Some(reason) = self.fault {
            return Err(LinkError::Faulted { reason });
        }
        if payload.len() > ferrolink_proto::MAX_PAYLOAD_SIZE {
            return Err(ferrolink_proto::ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: ferrolink_proto::MAX_PAYLOAD_SIZE,
            }
            .into());
        }

        // Flow-control frames bypass every gate, including their own.
        if command_id == CommandId::Xoff.to_u16() || command_id == CommandId::Xon.to_u16() {
            let mut actions = Vec::new();
            self.transmit_raw(command_id, payload, false, now, &mut actions);
            return Ok(SendResult { status: SendStatus::Sent, actions });
        }

        let requires_ack = if StatusCode::in_range(command_id) {
            false
        } else {
            let command = CommandId::from_u16(command_id)
                .ok_or(DispatchError::UnknownCommand { command_id })?;
            let meta = command.meta();
            if !meta.direction.valid_inbound(self.role == Role::Host) {
                return Err(DispatchError::WrongDirection { command_id }.into());
            }
            command
                .validate_payload(payload)
                .map_err(|reason| DispatchError::PayloadShapeInvalid { command_id, reason })?;
            if !self.synchronized && !command.is_system() {
                return Err(LinkError::NotSynchronized { command_id });
            }
            meta.reply == ReplyKind::Ack
        };

        let must_queue = self.tx_gated || (self.awaiting.is_some() && requires_ack);
        if must_queue && self.pending.len() >= PENDING_TX_DEPTH {
            return Err(LinkError::QueueFull { depth: PENDING_TX_DEPTH });
        }

        // Correlation bookkeeping happens only once the frame is
        // certain to leave (now or from the queue).
        self.record_correlation(command_id, payload)?;

        if must_queue {
            // The entry owns its payload copy.
            let frame = QueuedFrame { command_id, payload: payload.to_vec() };
            let Ok(()) = self.pending.push(frame) else {
                // Capacity checked above.
                unreachable!("pending queue capacity checked before push");
            };
            tracing::debug!(command_id, depth = self.pending.len(), "frame enqueued");
            return Ok(SendResult { status: SendStatus::Enqueued, actions: Vec::new() });
        }

        let mut actions = Vec::new();
        self.transmit_command(command_id, payload, requires_ack, now, &mut actions);
        Ok(SendResult { status: SendStatus::Sent, actions })
    }

    /// Drive timers: ACK retransmission and handshake retry/backoff.
    pub fn tick<E>(&mut self, env: &E, now: I) -> Vec<LinkAction>
    where
        E: Environment<Instant = I>,
    {
        let mut actions = Vec::new();
        if self.fault.is_some() {
            return actions;
        }

        if let Some(mut inflight) = self.awaiting {
            if now - inflight.sent_at >= self.timing.ack_timeout() {
                if inflight.retries < self.timing.retry_limit {
                    inflight.retries += 1;
                    inflight.sent_at = now;
                    self.awaiting = Some(inflight);
                    tracing::debug!(
                        command_id = inflight.command_id,
                        retry = inflight.retries,
                        "ack timeout, retransmitting"
                    );
                    actions.push(LinkAction::Retransmit);
                } else {
                    tracing::warn!(
                        command_id = inflight.command_id,
                        retries = inflight.retries,
                        "ack never arrived; abandoning frame"
                    );
                    self.awaiting = None;
                    self.fsm.apply(LinkEvent::Timeout);
                    actions.push(LinkAction::ClearCache);
                    actions.push(LinkAction::Notify(StatusEvent {
                        code: StatusCode::Timeout,
                        command_id: inflight.command_id,
                    }));
                    self.flush_pending(now, &mut actions);
                }
            }
        }

        self.tick_handshake(env, now, &mut actions);
        actions
    }

    /// Process one received, CRC-valid frame.
    pub fn handle_frame(&mut self, frame: &Frame, now: I) -> Vec<LinkAction> {
        let mut actions = Vec::new();
        let id = frame.command_id;

        if self.fault == Some(FaultReason::KatFailure) {
            tracing::error!(command_id = id, "frame ignored: crypto is fail-safe");
            return actions;
        }

        if let Some(status) = StatusCode::from_u16(id) {
            self.handle_status(status, frame, now, &mut actions);
            return actions;
        }
        if StatusCode::in_range(id) {
            tracing::warn!(command_id = id, "unassigned status id ignored");
            return actions;
        }

        match CommandId::from_u16(id) {
            Some(CommandId::Xoff) => {
                if frame.payload.is_empty() {
                    tracing::debug!("peer XOFF: gating all transmissions");
                    self.tx_gated = true;
                } else {
                    self.send_status(StatusCode::Malformed, id, now, &mut actions);
                }
            },
            Some(CommandId::Xon) => {
                if frame.payload.is_empty() {
                    tracing::debug!("peer XON: transmissions resume");
                    self.tx_gated = false;
                    self.flush_pending(now, &mut actions);
                } else {
                    self.send_status(StatusCode::Malformed, id, now, &mut actions);
                }
            },
            Some(CommandId::LinkSync) => self.handle_link_sync(frame, now, &mut actions),
            Some(CommandId::LinkSyncResp) => self.handle_link_sync_resp(frame, now, &mut actions),
            Some(CommandId::LinkReset) => self.handle_link_reset(frame, now, &mut actions),
            Some(command) => self.handle_service_frame(command, frame, now, &mut actions),
            None => {
                if self.recoverable_fault_active() {
                    return actions;
                }
                if !self.synchronized {
                    tracing::warn!(command_id = id, "unknown command before handshake; discarded");
                    return actions;
                }
                self.send_status(StatusCode::CmdUnknown, id, now, &mut actions);
            },
        }
        actions
    }

    /// Fold a dispatch outcome back into link state and put its
    /// replies on the wire.
    pub fn complete_dispatch(
        &mut self,
        frame: &Frame,
        outcome: &DispatchOutcome,
        now: I,
    ) -> Vec<LinkAction> {
        let mut actions = Vec::new();

        if outcome.executed {
            if let Some(command) = CommandId::from_u16(frame.command_id) {
                if command.meta().side_effecting {
                    self.last_rx = Some((frame.fingerprint(), now));
                }
                if command == CommandId::SetPinMode {
                    if let Some(&pin) = frame.payload.first() {
                        self.configured_pins.insert(pin);
                    }
                }
            }
        }

        if let Some((code, target)) = outcome.status {
            self.send_status(code, target, now, &mut actions);
        }
        if let Some((resp_id, payload)) = &outcome.reply {
            if self.tx_gated {
                tracing::warn!(command_id = resp_id, "response dropped: peer XOFF in effect");
            } else {
                self.transmit_raw(*resp_id, payload, false, now, &mut actions);
            }
        }
        actions
    }

    /// Answer a receive-path codec failure with the matching status
    /// frame and a local notification. The parser has already reset
    /// itself; the RPC continues.
    pub fn handle_parse_error(
        &mut self,
        err: &ferrolink_proto::ProtocolError,
        now: I,
    ) -> Vec<LinkAction> {
        use ferrolink_proto::ProtocolError as P;

        let mut actions = Vec::new();
        if self.fault == Some(FaultReason::KatFailure) {
            return actions;
        }

        let code = match err {
            P::CrcMismatch { .. } => StatusCode::CrcMismatch,
            P::Overflow { .. } => StatusCode::Overflow,
            P::CobsDecode(_) | P::Malformed { .. } | P::PayloadTooLarge { .. } => {
                StatusCode::Malformed
            },
        };
        tracing::debug!(%err, ?code, "receive path rejected a frame");
        self.send_status(code, GENERIC_ACK_TARGET, now, &mut actions);
        actions
    }

    /// Locally force a link reset: apply new timing, drop link state,
    /// and tell the peer. Recovery path out of a non-terminal fault.
    ///
    /// # Errors
    ///
    /// [`LinkError::Faulted`] when the KAT failed (terminal).
    pub fn reset_link(
        &mut self,
        timing: Option<TimingConfig>,
        now: I,
    ) -> Result<SendResult, LinkError> {
        if self.fault == Some(FaultReason::KatFailure) {
            return Err(LinkError::Faulted { reason: FaultReason::KatFailure });
        }

        let payload = match timing {
            Some(requested) => {
                self.apply_timing(requested);
                self.timing.encode()
            },
            None => Vec::new(),
        };

        let mut actions = self.clear_link_state();
        self.fault = None;
        self.fsm.force_reset();

        self.transmit_command(CommandId::LinkReset.to_u16(), &payload, true, now, &mut actions);
        Ok(SendResult { status: SendStatus::Sent, actions })
    }

    /// Cooperative-cancellation cleanup: mark unsynchronized, clear the
    /// gate, and drain every queue. No handler runs afterwards.
    pub fn shutdown(&mut self) -> Vec<LinkAction> {
        let actions = self.clear_link_state();
        self.fsm.apply(LinkEvent::Reset);
        tracing::debug!("link shut down");
        actions
    }

    /// Enter the fail-safe state: drain first, notify last.
    pub fn enter_safe_state(&mut self, reason: FaultReason) -> Vec<LinkAction> {
        tracing::error!(?reason, "entering fail-safe state");

        let mut actions = self.clear_link_state();
        self.fault = Some(reason);
        self.fsm.apply(LinkEvent::CryptoFault);

        if !self.configured_pins.is_empty() {
            let pins: Vec<u8> = std::mem::take(&mut self.configured_pins).into_iter().collect();
            actions.push(LinkAction::ResetPins(pins));
        }
        actions.push(LinkAction::Notify(StatusEvent {
            code: StatusCode::Error,
            command_id: GENERIC_ACK_TARGET,
        }));
        actions
    }

    // Shared teardown: everything except fault/FSM disposition.
    fn clear_link_state(&mut self) -> Vec<LinkAction> {
        self.synchronized = false;
        self.awaiting = None;
        self.pending.clear();
        self.pending_gets.clear();
        self.pending_polls.clear();
        self.tx_gated = false;
        self.last_rx = None;
        self.handshake = Handshake::Inactive;
        vec![LinkAction::ClearCache, LinkAction::ResetRx]
    }

    fn recoverable_fault_active(&self) -> bool {
        matches!(
            self.fault,
            Some(FaultReason::HandshakeAuthFailed | FaultReason::ParserDesync | FaultReason::External)
        )
    }

    fn handle_status(&mut self, status: StatusCode, frame: &Frame, now: I, actions: &mut Vec<LinkAction>) {
        let target = match frame.payload.len() {
            2 => u16::from_be_bytes([frame.payload[0], frame.payload[1]]),
            _ => GENERIC_ACK_TARGET,
        };
        actions.push(LinkAction::Notify(StatusEvent { code: status, command_id: target }));

        match status {
            StatusCode::Ack => {
                let Some(inflight) = self.awaiting else {
                    tracing::debug!(ack_target = target, "spurious ACK ignored");
                    return;
                };
                if frame.payload.len() != 2 {
                    tracing::warn!(
                        "ACK payload malformed: {} bytes, expected the command id",
                        frame.payload.len()
                    );
                    return;
                }
                if target != inflight.command_id && target != GENERIC_ACK_TARGET {
                    tracing::warn!(
                        ack_target = target,
                        in_flight = inflight.command_id,
                        "ACK names a different command"
                    );
                    return;
                }
                self.awaiting = None;
                self.fsm.apply(LinkEvent::AckReceived);
                actions.push(LinkAction::ClearCache);
                self.flush_pending(now, actions);
            },
            StatusCode::Malformed => {
                // The peer saw our frame but could not parse it.
                // Replay immediately; the regular timer handles limits.
                if let Some(mut inflight) = self.awaiting {
                    if target == inflight.command_id || target == GENERIC_ACK_TARGET {
                        // Costs one retry slot at most, however often
                        // the peer complains.
                        inflight.retries =
                            inflight.retries.saturating_add(1).min(self.timing.retry_limit);
                        inflight.sent_at = now;
                        self.awaiting = Some(inflight);
                        actions.push(LinkAction::Retransmit);
                    }
                }
            },
            _ => {},
        }
    }

    fn handle_link_sync(&mut self, frame: &Frame, now: I, actions: &mut Vec<LinkAction>) {
        if self.role == Role::Host {
            self.send_status(StatusCode::CmdUnknown, frame.command_id, now, actions);
            return;
        }
        if frame.payload.len() != NONCE_SIZE {
            self.send_status(StatusCode::Malformed, frame.command_id, now, actions);
            return;
        }

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&frame.payload);

        if self.last_accepted_nonce == Some(nonce) {
            tracing::warn!("handshake nonce replayed; refusing");
            self.send_status(StatusCode::Error, frame.command_id, now, actions);
            return;
        }
        self.last_accepted_nonce = Some(nonce);

        // A sync wipes whatever link state the previous session left.
        let cleanup = self.clear_link_state();
        actions.extend(cleanup);
        self.fault = None;
        self.fsm.force_reset();

        let mut payload = Vec::with_capacity(NONCE_SIZE + TAG_SIZE);
        payload.extend_from_slice(&nonce);
        if let Some(key) = self.mac_key() {
            payload.extend_from_slice(&handshake_tag(&key, &nonce));
        }

        self.synchronized = true;
        self.fsm.apply(LinkEvent::HandshakeComplete);
        self.transmit_raw(CommandId::LinkSyncResp.to_u16(), &payload, false, now, actions);
        tracing::info!("handshake answered; link synchronized");
    }

    fn handle_link_sync_resp(&mut self, frame: &Frame, now: I, actions: &mut Vec<LinkAction>) {
        if self.role == Role::Mcu {
            self.send_status(StatusCode::CmdUnknown, frame.command_id, now, actions);
            return;
        }
        let Handshake::Awaiting { nonce, rejections, .. } = self.handshake else {
            tracing::debug!("unsolicited sync response ignored");
            return;
        };

        let verified = match frame.payload.len() {
            NONCE_SIZE => self.secret.is_none() && frame.payload[..] == nonce[..],
            len if len == NONCE_SIZE + TAG_SIZE => {
                frame.payload[..NONCE_SIZE] == nonce[..]
                    && match self.mac_key() {
                        Some(key) => {
                            verify_handshake_tag(&key, &nonce, &frame.payload[NONCE_SIZE..])
                                .is_ok()
                        },
                        // Peer is authenticated, we are not configured:
                        // accept on nonce equality alone.
                        None => true,
                    }
            },
            _ => false,
        };

        if verified {
            self.handshake = Handshake::Inactive;
            self.synchronized = true;
            self.fsm.apply(LinkEvent::HandshakeComplete);
            actions.push(LinkAction::Notify(StatusEvent {
                code: StatusCode::Ok,
                command_id: CommandId::LinkSync.to_u16(),
            }));
            tracing::info!("handshake verified; link synchronized");
        } else {
            tracing::warn!(rejections = rejections + 1, "handshake response failed verification");
            self.handshake_rejected(now, actions);
        }
    }

    fn handle_link_reset(&mut self, frame: &Frame, now: I, actions: &mut Vec<LinkAction>) {
        match frame.payload.len() {
            0 => {},
            7 => {
                if let Some(requested) = TimingConfig::decode(&frame.payload) {
                    self.apply_timing(requested);
                }
            },
            _ => {
                self.send_status(StatusCode::Malformed, frame.command_id, now, actions);
                return;
            },
        }

        let cleanup = self.clear_link_state();
        actions.extend(cleanup);
        self.fault = None;
        self.fsm.force_reset();
        self.send_status(StatusCode::Ack, frame.command_id, now, actions);
        tracing::info!("link reset by peer");
    }

    fn handle_service_frame(
        &mut self,
        command: CommandId,
        frame: &Frame,
        now: I,
        actions: &mut Vec<LinkAction>,
    ) {
        if self.recoverable_fault_active() {
            tracing::warn!(command_id = frame.command_id, "frame ignored in fail-safe state");
            return;
        }
        if !self.synchronized && !command.is_system() {
            tracing::warn!(
                command_id = frame.command_id,
                "non-system command before handshake; discarded"
            );
            return;
        }

        // Retransmission of a side-effecting frame whose ACK was lost:
        // re-ACK without re-executing.
        if command.meta().side_effecting {
            if let Some((fingerprint, seen_at)) = self.last_rx {
                let elapsed = now - seen_at;
                if fingerprint == frame.fingerprint()
                    && elapsed >= self.timing.ack_timeout()
                    && elapsed <= self.timing.dedup_window_end()
                {
                    tracing::debug!(fingerprint, "duplicate suppressed; re-sending ACK");
                    self.send_status(StatusCode::Ack, frame.command_id, now, actions);
                    return;
                }
            }
        }

        let context = match command {
            CommandId::DatastoreGetResp => {
                self.pending_gets.pop().map(RequestContext::DatastoreKey)
            },
            CommandId::ProcessPollResp => self.pending_polls.pop().map(RequestContext::ProcessPid),
            _ => None,
        };

        actions.push(LinkAction::Dispatch { frame: frame.clone(), context });
    }

    fn handshake_rejected(&mut self, now: I, actions: &mut Vec<LinkAction>) {
        let Handshake::Awaiting { nonce, sent_at, rejections, .. } = self.handshake else {
            return;
        };
        let rejections = rejections + 1;

        if rejections >= HANDSHAKE_MAX_REJECTIONS {
            tracing::error!(rejections, "handshake rejected too many times");
            let safe = self.enter_safe_state(FaultReason::HandshakeAuthFailed);
            actions.extend(safe);
            return;
        }

        // Exponential backoff: 1s, 2s, 4s, ... capped at 60s.
        let backoff = HANDSHAKE_BACKOFF_BASE
            .saturating_mul(1u32 << (rejections - 1).min(6))
            .min(HANDSHAKE_BACKOFF_CAP);
        self.handshake = Handshake::Awaiting {
            nonce,
            sent_at,
            rejections,
            retry_at: Some(now.forward(backoff)),
        };
    }

    fn tick_handshake<E>(&mut self, env: &E, now: I, actions: &mut Vec<LinkAction>)
    where
        E: Environment<Instant = I>,
    {
        let Handshake::Awaiting { sent_at, rejections, retry_at, .. } = self.handshake else {
            return;
        };

        match retry_at {
            Some(at) if now >= at => {
                let nonce = env.random_nonce();
                self.handshake =
                    Handshake::Awaiting { nonce, sent_at: now, rejections, retry_at: None };
                self.transmit_raw(CommandId::LinkSync.to_u16(), &nonce, false, now, actions);
                tracing::debug!(attempt = rejections + 1, "handshake retry");
            },
            Some(_) => {},
            None => {
                if now - sent_at >= self.timing.response_timeout() {
                    tracing::warn!("handshake response timed out");
                    self.handshake_rejected(now, actions);
                }
            },
        }
    }

    fn record_correlation(&mut self, command_id: u16, payload: &[u8]) -> Result<(), LinkError> {
        if command_id == CommandId::DatastoreGet.to_u16() {
            // Shape already validated: key_len:u8 then key.
            let key = payload.get(1..).unwrap_or_default().to_vec();
            if !self.pending_gets.push(key) {
                return Err(LinkError::RequestQueueFull { depth: REQUEST_FIFO_DEPTH });
            }
        } else if command_id == CommandId::ProcessPoll.to_u16() {
            let pid = u16::from_be_bytes([
                payload.first().copied().unwrap_or_default(),
                payload.get(1).copied().unwrap_or_default(),
            ]);
            if !self.pending_polls.push(pid) {
                return Err(LinkError::RequestQueueFull { depth: REQUEST_FIFO_DEPTH });
            }
        }
        Ok(())
    }

    fn apply_timing(&mut self, requested: TimingConfig) {
        let (validated, adjusted) = requested.validated();
        if adjusted {
            tracing::warn!(?validated, "peer timing out of range; snapped to defaults");
        }
        self.timing = validated;
    }

    fn mac_key(&self) -> Option<Vec<u8>> {
        let secret = self.secret.as_ref()?;
        Some(if self.hardened {
            derive_link_key(secret).to_vec()
        } else {
            secret.as_bytes().to_vec()
        })
    }

    /// Emit a status frame. Status frames bypass the pending queue but
    /// respect an XOFF from the peer (dropped with a warning; the
    /// peer's retry recovers the exchange).
    fn send_status(&mut self, code: StatusCode, target: u16, now: I, actions: &mut Vec<LinkAction>) {
        if self.tx_gated {
            tracing::warn!(?code, command_id = target, "status frame dropped: peer XOFF in effect");
            return;
        }
        let mut payload = Vec::with_capacity(2);
        put_u16(&mut payload, target);
        self.transmit_raw(code.to_u16(), &payload, false, now, actions);
    }

    /// Send one frame now, wiring up ACK bookkeeping when required.
    fn transmit_command(
        &mut self,
        command_id: u16,
        payload: &[u8],
        requires_ack: bool,
        now: I,
        actions: &mut Vec<LinkAction>,
    ) {
        if requires_ack {
            self.awaiting = Some(InFlight { command_id, sent_at: now, retries: 0 });
            self.fsm.apply(LinkEvent::SendCritical);
        }
        self.transmit_raw(command_id, payload, requires_ack, now, actions);
    }

    fn transmit_raw(
        &mut self,
        command_id: u16,
        payload: &[u8],
        cache: bool,
        now: I,
        actions: &mut Vec<LinkAction>,
    ) {
        let Ok(frame) = Frame::new(command_id, payload.to_vec()) else {
            // Payload sizes are checked before every call.
            unreachable!("oversized payload past the send_frame guard");
        };
        self.last_command_id = Some(command_id);
        self.last_send_at = Some(now);
        actions.push(LinkAction::Transmit { wire: frame.encode_wire(), cache });
    }

    /// Send queued frames until one holds the line (ACK-required) or
    /// the queue drains.
    fn flush_pending(&mut self, now: I, actions: &mut Vec<LinkAction>) {
        while !self.tx_gated && self.awaiting.is_none() {
            let Some(entry) = self.pending.pop() else {
                return;
            };
            let requires_ack = CommandId::from_u16(entry.command_id)
                .map(CommandId::requires_ack)
                .unwrap_or_default();
            self.transmit_command(entry.command_id, &entry.payload, requires_ack, now, actions);
        }
    }
}

/// Wire bytes for an XON/XOFF control frame.
///
/// Flow signals originate in the transport's watermark tracker, bypass
/// the engine entirely, and are never cached for retransmission.
#[must_use]
pub fn flow_wire(signal: FlowSignal) -> Vec<u8> {
    let command = match signal {
        FlowSignal::Xoff => CommandId::Xoff,
        FlowSignal::Xon => CommandId::Xon,
    };
    let Ok(frame) = Frame::new(command.to_u16(), Vec::new()) else {
        unreachable!("flow frames carry no payload");
    };
    frame.encode_wire()
}

/// Minimal forward arithmetic for instants.
///
/// The engine schedules handshake retries at `now + backoff`, which
/// `Sub` alone cannot express. `std::time::Instant` is covered here;
/// virtual instants implement the trait themselves.
pub trait InstantArithmetic: Sized {
    /// `self + delta`.
    fn forward(self, delta: Duration) -> Self;
}

impl InstantArithmetic for std::time::Instant {
    fn forward(self, delta: Duration) -> Self {
        self + delta
    }
}

#[cfg(test)]
mod tests {
    use ferrolink_proto::FrameParser;

    use super::*;

    /// Virtual instant in milliseconds.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    struct T(u64);

    impl std::ops::Sub for T {
        type Output = Duration;
        fn sub(self, rhs: Self) -> Duration {
            Duration::from_millis(self.0 - rhs.0)
        }
    }

    impl InstantArithmetic for T {
        fn forward(self, delta: Duration) -> Self {
            T(self.0 + delta.as_millis() as u64)
        }
    }

    #[derive(Clone)]
    struct TestEnv;

    impl Environment for TestEnv {
        type Instant = T;

        fn now(&self) -> T {
            T(0)
        }

        fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            async {}
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            for (i, byte) in buffer.iter_mut().enumerate() {
                *byte = 0x2A ^ (i as u8);
            }
        }
    }

    fn secret() -> SharedSecret {
        SharedSecret::new(*b"testsecret12345").unwrap()
    }

    fn host() -> LinkEngine<T> {
        LinkEngine::new(Role::Host, TimingConfig::default(), Some(secret()), false)
    }

    fn mcu() -> LinkEngine<T> {
        LinkEngine::new(Role::Mcu, TimingConfig::default(), Some(secret()), false)
    }

    /// Frames carried by Transmit actions.
    fn frames_of(actions: &[LinkAction]) -> Vec<Frame> {
        let mut parser = FrameParser::new();
        let mut frames = Vec::new();
        for action in actions {
            if let LinkAction::Transmit { wire, .. } = action {
                for &byte in wire {
                    if let Some(frame) = parser.push(byte).unwrap() {
                        frames.push(frame);
                    }
                }
            }
        }
        frames
    }

    /// Feed every transmitted frame to the peer engine.
    fn deliver(actions: &[LinkAction], peer: &mut LinkEngine<T>, now: T) -> Vec<LinkAction> {
        let mut out = Vec::new();
        for frame in frames_of(actions) {
            out.extend(peer.handle_frame(&frame, now));
        }
        out
    }

    /// Complete the handshake between a host/MCU pair.
    fn synchronize(host: &mut LinkEngine<T>, mcu: &mut LinkEngine<T>, now: T) {
        let sync = host.begin_handshake(&TestEnv, now).unwrap();
        let resp = deliver(&sync, mcu, now);
        deliver(&resp, host, now);
        assert!(host.is_synchronized());
        assert!(mcu.is_synchronized());
    }

    fn outcome_ack(frame: &Frame) -> DispatchOutcome {
        DispatchOutcome {
            status: Some((StatusCode::Ack, frame.command_id)),
            reply: None,
            executed: true,
        }
    }

    #[test]
    fn handshake_completes_with_authentication() {
        let mut host = host();
        let mut mcu = mcu();
        let now = T(0);

        let sync = host.begin_handshake(&TestEnv, now).unwrap();
        let sync_frames = frames_of(&sync);
        assert_eq!(sync_frames.len(), 1);
        assert_eq!(sync_frames[0].command_id, CommandId::LinkSync.to_u16());
        assert_eq!(sync_frames[0].payload.len(), NONCE_SIZE);
        assert!(!host.is_synchronized());

        let resp = deliver(&sync, &mut mcu, now);
        assert!(mcu.is_synchronized());
        let resp_frames = frames_of(&resp);
        assert_eq!(resp_frames.len(), 1);
        assert_eq!(resp_frames[0].command_id, CommandId::LinkSyncResp.to_u16());
        // nonce || tag
        assert_eq!(resp_frames[0].payload.len(), NONCE_SIZE + TAG_SIZE);
        assert_eq!(resp_frames[0].payload[..NONCE_SIZE], sync_frames[0].payload[..]);
        let expected = handshake_tag(secret().as_bytes(), &{
            let mut nonce = [0u8; NONCE_SIZE];
            nonce.copy_from_slice(&sync_frames[0].payload);
            nonce
        });
        assert_eq!(resp_frames[0].payload[NONCE_SIZE..], expected[..]);

        deliver(&resp, &mut host, now);
        assert!(host.is_synchronized());
        assert_eq!(host.state(), LinkState::Idle);
    }

    #[test]
    fn tampered_handshake_tag_rejected() {
        let mut host = host();
        let mut mcu = mcu();
        let now = T(0);

        let sync = host.begin_handshake(&TestEnv, now).unwrap();
        let resp = deliver(&sync, &mut mcu, now);
        let mut resp_frame = frames_of(&resp).remove(0);
        let mut tampered = resp_frame.payload.to_vec();
        tampered[NONCE_SIZE] ^= 0x01;
        resp_frame = Frame::new(resp_frame.command_id, tampered).unwrap();

        host.handle_frame(&resp_frame, now);
        assert!(!host.is_synchronized());
    }

    #[test]
    fn nonce_replay_refused_by_responder() {
        let mut mcu = mcu();
        let now = T(0);

        let nonce = [9u8; NONCE_SIZE];
        let sync = Frame::new(CommandId::LinkSync.to_u16(), nonce.to_vec()).unwrap();
        let first = mcu.handle_frame(&sync, now);
        assert_eq!(frames_of(&first)[0].command_id, CommandId::LinkSyncResp.to_u16());

        let second = mcu.handle_frame(&sync, T(10));
        let replies = frames_of(&second);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].command_id, StatusCode::Error.to_u16());
    }

    #[test]
    fn non_system_sends_rejected_before_handshake() {
        let mut host = host();
        let err = host.send_frame(CommandId::DigitalWrite.to_u16(), &[13, 1], T(0)).unwrap_err();
        assert_eq!(err, LinkError::NotSynchronized { command_id: 0x51 });
    }

    #[test]
    fn inbound_service_frames_discarded_before_handshake() {
        let mut mcu = mcu();
        let frame = Frame::new(CommandId::DigitalWrite.to_u16(), vec![13, 1]).unwrap();
        let actions = mcu.handle_frame(&frame, T(0));
        assert!(actions.is_empty());
    }

    #[test]
    fn oversized_payload_rejected_without_state_change() {
        let mut host = host();
        let before = host.snapshot();
        let payload = vec![0u8; 200];
        let err = host.send_frame(CommandId::ProcessRun.to_u16(), &payload, T(0)).unwrap_err();
        assert!(matches!(
            err,
            LinkError::Protocol(ferrolink_proto::ProtocolError::PayloadTooLarge { size: 200, .. })
        ));
        assert_eq!(host.snapshot(), before);
    }

    #[test]
    fn ack_releases_the_line_and_flushes_the_queue() {
        let mut host = host();
        let mut mcu = mcu();
        let now = T(0);
        synchronize(&mut host, &mut mcu, now);

        let first = host.send_frame(CommandId::DigitalWrite.to_u16(), &[13, 1], now).unwrap();
        assert_eq!(first.status, SendStatus::Sent);
        assert!(matches!(first.actions[0], LinkAction::Transmit { cache: true, .. }));
        assert!(host.snapshot().awaiting_ack);

        // The line is held: the next ACK-required frame queues.
        let second = host.send_frame(CommandId::DigitalWrite.to_u16(), &[13, 0], now).unwrap();
        assert_eq!(second.status, SendStatus::Enqueued);
        assert_eq!(host.snapshot().pending_tx, 1);

        // MCU executes and ACKs.
        let mcu_actions = deliver(&first.actions, &mut mcu, now);
        let dispatched = mcu_actions.iter().find_map(|action| match action {
            LinkAction::Dispatch { frame, .. } => Some(frame.clone()),
            _ => None,
        });
        let frame = dispatched.expect("command reaches the dispatcher");
        let ack = mcu.complete_dispatch(&frame, &outcome_ack(&frame), now);

        let host_actions = deliver(&ack, &mut host, now);
        assert!(!host.snapshot().awaiting_ack);
        // The queued frame went out and holds the line again.
        let flushed = frames_of(&host_actions);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].payload[..], [13, 0]);
        assert!(host.snapshot().awaiting_ack);
    }

    #[test]
    fn generic_ack_target_matches() {
        let mut host = host();
        let mut mcu = mcu();
        let now = T(0);
        synchronize(&mut host, &mut mcu, now);

        host.send_frame(CommandId::DigitalWrite.to_u16(), &[13, 1], now).unwrap();
        let ack = Frame::new(
            StatusCode::Ack.to_u16(),
            GENERIC_ACK_TARGET.to_be_bytes().to_vec(),
        )
        .unwrap();
        host.handle_frame(&ack, now);
        assert!(!host.snapshot().awaiting_ack);
    }

    #[test]
    fn mismatched_ack_target_ignored() {
        let mut host = host();
        let mut mcu = mcu();
        let now = T(0);
        synchronize(&mut host, &mut mcu, now);

        host.send_frame(CommandId::DigitalWrite.to_u16(), &[13, 1], now).unwrap();
        let ack = Frame::new(
            StatusCode::Ack.to_u16(),
            CommandId::ConsoleWrite.to_u16().to_be_bytes().to_vec(),
        )
        .unwrap();
        host.handle_frame(&ack, now);
        assert!(host.snapshot().awaiting_ack);
    }

    #[test]
    fn queue_overflow_is_a_typed_error() {
        let mut host = host();
        let mut mcu = mcu();
        let now = T(0);
        synchronize(&mut host, &mut mcu, now);

        host.send_frame(CommandId::DigitalWrite.to_u16(), &[13, 1], now).unwrap();
        for _ in 0..PENDING_TX_DEPTH {
            host.send_frame(CommandId::DigitalWrite.to_u16(), &[13, 0], now).unwrap();
        }
        let err = host.send_frame(CommandId::DigitalWrite.to_u16(), &[13, 0], now).unwrap_err();
        assert_eq!(err, LinkError::QueueFull { depth: PENDING_TX_DEPTH });
    }

    #[test]
    fn retries_then_local_timeout() {
        let mut host = host();
        let mut mcu = mcu();
        let now = T(0);
        synchronize(&mut host, &mut mcu, now);
        let timing = host.timing();

        host.send_frame(CommandId::DigitalWrite.to_u16(), &[13, 1], now).unwrap();

        let mut clock = 0u64;
        for retry in 1..=timing.retry_limit {
            clock += u64::from(timing.ack_timeout_ms);
            let actions = host.tick(&TestEnv, T(clock));
            assert!(actions.contains(&LinkAction::Retransmit), "retry {retry} retransmits");
            assert_eq!(host.snapshot().retry_count, retry);
        }

        clock += u64::from(timing.ack_timeout_ms);
        let actions = host.tick(&TestEnv, T(clock));
        assert!(actions.contains(&LinkAction::ClearCache));
        assert!(actions.contains(&LinkAction::Notify(StatusEvent {
            code: StatusCode::Timeout,
            command_id: CommandId::DigitalWrite.to_u16(),
        })));
        assert!(!host.snapshot().awaiting_ack);
        assert_eq!(host.state(), LinkState::Idle);
    }

    #[test]
    fn peer_malformed_triggers_immediate_retransmit() {
        let mut host = host();
        let mut mcu = mcu();
        let now = T(0);
        synchronize(&mut host, &mut mcu, now);

        host.send_frame(CommandId::DigitalWrite.to_u16(), &[13, 1], now).unwrap();
        let nack = Frame::new(
            StatusCode::Malformed.to_u16(),
            CommandId::DigitalWrite.to_u16().to_be_bytes().to_vec(),
        )
        .unwrap();
        let actions = host.handle_frame(&nack, T(5));
        assert!(actions.contains(&LinkAction::Retransmit));
        assert!(host.snapshot().awaiting_ack);
    }

    #[test]
    fn duplicate_within_window_suppressed() {
        let mut host = host();
        let mut mcu = mcu();
        let now = T(0);
        synchronize(&mut host, &mut mcu, now);
        let timing = mcu.timing();

        let sent = host.send_frame(CommandId::DigitalWrite.to_u16(), &[13, 1], now).unwrap();
        let frame = frames_of(&sent.actions).remove(0);

        // First delivery executes.
        let actions = mcu.handle_frame(&frame, now);
        assert!(actions.iter().any(|a| matches!(a, LinkAction::Dispatch { .. })));
        mcu.complete_dispatch(&frame, &outcome_ack(&frame), now);

        // Retransmission one ACK-timeout later: re-ACK, no dispatch.
        let at_retry = T(u64::from(timing.ack_timeout_ms));
        let actions = mcu.handle_frame(&frame, at_retry);
        assert!(!actions.iter().any(|a| matches!(a, LinkAction::Dispatch { .. })));
        let replies = frames_of(&actions);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].command_id, StatusCode::Ack.to_u16());
    }

    #[test]
    fn rapid_legitimate_repeat_executes() {
        let mut host = host();
        let mut mcu = mcu();
        let now = T(0);
        synchronize(&mut host, &mut mcu, now);

        let sent = host.send_frame(CommandId::DigitalWrite.to_u16(), &[13, 1], now).unwrap();
        let frame = frames_of(&sent.actions).remove(0);

        mcu.handle_frame(&frame, now);
        mcu.complete_dispatch(&frame, &outcome_ack(&frame), now);

        // Sooner than the ACK timeout: a high-frequency repeat.
        let actions = mcu.handle_frame(&frame, T(5));
        assert!(actions.iter().any(|a| matches!(a, LinkAction::Dispatch { .. })));
    }

    #[test]
    fn stale_duplicate_outside_window_executes() {
        let mut host = host();
        let mut mcu = mcu();
        let now = T(0);
        synchronize(&mut host, &mut mcu, now);
        let timing = mcu.timing();

        let sent = host.send_frame(CommandId::DigitalWrite.to_u16(), &[13, 1], now).unwrap();
        let frame = frames_of(&sent.actions).remove(0);

        mcu.handle_frame(&frame, now);
        mcu.complete_dispatch(&frame, &outcome_ack(&frame), now);

        let past_window = T(timing.dedup_window_end().as_millis() as u64 + 1);
        let actions = mcu.handle_frame(&frame, past_window);
        assert!(actions.iter().any(|a| matches!(a, LinkAction::Dispatch { .. })));
    }

    #[test]
    fn xoff_gates_and_xon_drains_in_order() {
        let mut host = host();
        let mut mcu = mcu();
        let now = T(0);
        synchronize(&mut host, &mut mcu, now);

        let xoff = Frame::new(CommandId::Xoff.to_u16(), Vec::new()).unwrap();
        host.handle_frame(&xoff, now);
        assert!(host.snapshot().tx_gated);

        // Everything caller-initiated queues, in order.
        for value in [1u8, 0, 1] {
            let result =
                host.send_frame(CommandId::DigitalWrite.to_u16(), &[13, value], now).unwrap();
            assert_eq!(result.status, SendStatus::Enqueued);
        }
        assert_eq!(host.snapshot().pending_tx, 3);

        let xon = Frame::new(CommandId::Xon.to_u16(), Vec::new()).unwrap();
        let actions = host.handle_frame(&xon, now);
        assert!(!host.snapshot().tx_gated);

        // Only the first goes out; it holds the line again.
        let sent = frames_of(&actions);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload[..], [13, 1]);
        assert_eq!(host.snapshot().pending_tx, 2);
    }

    #[test]
    fn flow_frames_bypass_the_gate() {
        let mut host = host();
        let mut mcu = mcu();
        let now = T(0);
        synchronize(&mut host, &mut mcu, now);

        let xoff = Frame::new(CommandId::Xoff.to_u16(), Vec::new()).unwrap();
        host.handle_frame(&xoff, now);

        let result = host.send_frame(CommandId::Xoff.to_u16(), &[], now).unwrap();
        assert_eq!(result.status, SendStatus::Sent);
        assert!(matches!(result.actions[0], LinkAction::Transmit { cache: false, .. }));
    }

    #[test]
    fn correlation_contexts_pop_in_fifo_order() {
        let mut host = host();
        let mut mcu = mcu();
        let now = T(0);
        synchronize(&mut host, &mut mcu, now);

        for key in [&b"alpha"[..], &b"beta"[..]] {
            let mut payload = vec![key.len() as u8];
            payload.extend_from_slice(key);
            host.send_frame(CommandId::DatastoreGet.to_u16(), &payload, now).unwrap();
        }
        assert_eq!(host.snapshot().pending_requests, 2);

        let resp = Frame::new(CommandId::DatastoreGetResp.to_u16(), vec![1, b'x']).unwrap();
        let actions = host.handle_frame(&resp, now);
        let context = actions.iter().find_map(|action| match action {
            LinkAction::Dispatch { context, .. } => context.clone(),
            _ => None,
        });
        assert_eq!(context, Some(RequestContext::DatastoreKey(b"alpha".to_vec())));
        assert_eq!(host.snapshot().pending_requests, 1);
    }

    #[test]
    fn correlation_fifo_overflow_rejects_the_request() {
        let mut host = host();
        let mut mcu = mcu();
        let now = T(0);
        synchronize(&mut host, &mut mcu, now);

        for _ in 0..REQUEST_FIFO_DEPTH {
            host.send_frame(CommandId::ProcessPoll.to_u16(), &[0, 7], now).unwrap();
        }
        let err = host.send_frame(CommandId::ProcessPoll.to_u16(), &[0, 7], now).unwrap_err();
        assert_eq!(err, LinkError::RequestQueueFull { depth: REQUEST_FIFO_DEPTH });
    }

    #[test]
    fn safe_state_drains_everything_and_latches() {
        let mut host = host();
        let mut mcu = mcu();
        let now = T(0);
        synchronize(&mut host, &mut mcu, now);

        // Configure a pin so the safe state has something to neutralize.
        let sent = host.send_frame(CommandId::SetPinMode.to_u16(), &[13, 1], now).unwrap();
        let frame = frames_of(&sent.actions).remove(0);
        mcu.handle_frame(&frame, now);
        mcu.complete_dispatch(
            &frame,
            &DispatchOutcome {
                status: Some((StatusCode::Ack, frame.command_id)),
                reply: None,
                executed: true,
            },
            now,
        );

        // Park some state on the MCU side too.
        mcu.send_frame(CommandId::ConsoleWrite.to_u16(), b"boot", now).unwrap();
        mcu.send_frame(CommandId::ConsoleWrite.to_u16(), b"log", now).unwrap();

        let actions = mcu.enter_safe_state(FaultReason::External);
        let snapshot = mcu.snapshot();
        assert_eq!(snapshot.pending_tx, 0);
        assert_eq!(snapshot.pending_requests, 0);
        assert!(!snapshot.synchronized);
        assert!(!snapshot.tx_gated);
        assert_eq!(snapshot.state, LinkState::Fault);

        assert!(actions.contains(&LinkAction::ResetPins(vec![13])));
        // Drain first, notify last.
        assert!(matches!(actions.last(), Some(LinkAction::Notify(_))));
    }

    #[test]
    fn kat_fault_is_terminal() {
        let mut mcu = mcu();
        mcu.enter_safe_state(FaultReason::KatFailure);

        let err = mcu.send_frame(CommandId::ConsoleWrite.to_u16(), b"x", T(0)).unwrap_err();
        assert_eq!(err, LinkError::Faulted { reason: FaultReason::KatFailure });

        assert!(matches!(mcu.reset_link(None, T(0)), Err(LinkError::Faulted { .. })));

        // Even a fresh handshake is ignored.
        let sync = Frame::new(CommandId::LinkSync.to_u16(), vec![1u8; NONCE_SIZE]).unwrap();
        let actions = mcu.handle_frame(&sync, T(0));
        assert!(actions.is_empty());
        assert!(!mcu.is_synchronized());
    }

    #[test]
    fn recoverable_fault_clears_on_link_reset() {
        let mut mcu = mcu();
        mcu.enter_safe_state(FaultReason::External);
        assert_eq!(mcu.state(), LinkState::Fault);

        let reset = Frame::new(CommandId::LinkReset.to_u16(), Vec::new()).unwrap();
        let actions = mcu.handle_frame(&reset, T(0));
        let replies = frames_of(&actions);
        assert_eq!(replies.last().unwrap().command_id, StatusCode::Ack.to_u16());
        assert_eq!(mcu.state(), LinkState::Unsynchronized);
    }

    #[test]
    fn link_reset_applies_clamped_timing() {
        let mut mcu = mcu();
        let mut payload = Vec::new();
        // ack_timeout 2 ms: out of range, snaps to the default.
        put_u16(&mut payload, 2);
        payload.push(5);
        payload.extend_from_slice(&2000u32.to_be_bytes());

        let reset = Frame::new(CommandId::LinkReset.to_u16(), payload).unwrap();
        mcu.handle_frame(&reset, T(0));

        let timing = mcu.timing();
        assert_eq!(timing.ack_timeout_ms, crate::config::DEFAULT_ACK_TIMEOUT_MS);
        assert_eq!(timing.retry_limit, 5);
        assert_eq!(timing.response_timeout_ms, 2000);
    }

    #[test]
    fn handshake_times_out_then_retries_with_fresh_nonce() {
        let mut host = host();
        let now = T(0);
        let sync = host.begin_handshake(&TestEnv, now).unwrap();
        let first_nonce = frames_of(&sync)[0].payload.clone();
        let timing = host.timing();

        // No response: first rejection schedules a 1 s backoff.
        let at_timeout = T(u64::from(timing.response_timeout_ms));
        assert!(host.tick(&TestEnv, at_timeout).is_empty());

        // Before the backoff elapses nothing happens.
        let early = T(u64::from(timing.response_timeout_ms) + 500);
        assert!(host.tick(&TestEnv, early).is_empty());

        let due = T(u64::from(timing.response_timeout_ms) + 1000);
        let retry = host.tick(&TestEnv, due);
        let retry_frames = frames_of(&retry);
        assert_eq!(retry_frames.len(), 1);
        assert_eq!(retry_frames[0].command_id, CommandId::LinkSync.to_u16());
        // The deterministic test environment regenerates the same
        // nonce bytes; what matters is that a fresh sync went out.
        assert_eq!(retry_frames[0].payload, first_nonce);
    }

    #[test]
    fn handshake_exhaustion_enters_safe_state() {
        let mut host = host();
        let now = T(0);
        let sync = host.begin_handshake(&TestEnv, now).unwrap();
        let nonce = frames_of(&sync)[0].payload.clone();

        // A respondent that always fails verification.
        let mut bogus = nonce.to_vec();
        bogus.extend_from_slice(&[0u8; TAG_SIZE]);
        let resp = Frame::new(CommandId::LinkSyncResp.to_u16(), bogus).unwrap();

        let mut clock = 0u64;
        for _ in 0..HANDSHAKE_MAX_REJECTIONS {
            host.handle_frame(&resp, T(clock));
            // Walk past whatever backoff was scheduled.
            clock += 120_000;
            host.tick(&TestEnv, T(clock));
        }

        assert_eq!(host.state(), LinkState::Fault);
        assert!(!host.is_synchronized());
    }

    #[test]
    fn snapshot_reflects_last_send() {
        let mut host = host();
        let mut mcu = mcu();
        let now = T(0);
        synchronize(&mut host, &mut mcu, now);

        host.send_frame(CommandId::DigitalWrite.to_u16(), &[13, 1], T(42)).unwrap();
        let snapshot = host.snapshot();
        assert_eq!(snapshot.last_command_id, Some(CommandId::DigitalWrite.to_u16()));
        assert_eq!(snapshot.last_send_at, Some(T(42)));
        assert_eq!(snapshot.retry_count, 0);
        assert_eq!(snapshot.state, LinkState::AwaitingAck);
    }

    #[test]
    fn shutdown_clears_link_without_fault() {
        let mut host = host();
        let mut mcu = mcu();
        let now = T(0);
        synchronize(&mut host, &mut mcu, now);
        host.send_frame(CommandId::DigitalWrite.to_u16(), &[13, 1], now).unwrap();
        host.send_frame(CommandId::DigitalWrite.to_u16(), &[13, 0], now).unwrap();

        let actions = host.shutdown();
        assert!(actions.contains(&LinkAction::ClearCache));
        let snapshot = host.snapshot();
        assert!(!snapshot.synchronized);
        assert_eq!(snapshot.pending_tx, 0);
        assert_eq!(snapshot.state, LinkState::Unsynchronized);
    }
}
