//! The `Link`: one UART, one secret, one queue.
//!
//! Composes the parser, the engine, the dispatcher and the transport
//! behind the narrow surface the service layer sees: `process()`,
//! `send_frame`, `reset_link`, `is_synchronized`, `take_snapshot`, and
//! handler registration. On the MCU this is the main-loop entry point
//! (one `process()` per iteration, every operation a bounded
//! non-blocking poll); the host async driver wraps the same engine in
//! `ferrolink-host`.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use ferrolink_proto::{CommandId, FrameParser, wire::ByteReader};

use crate::{
    config::LinkConfig,
    dispatch::{Dispatcher, HandlerReply},
    engine::{
        InstantArithmetic, LinkAction, LinkEngine, LinkSnapshot, RequestContext, SendStatus,
        StatusEvent, flow_wire,
    },
    env::Environment,
    error::{ConfigError, FaultReason, LinkError},
    flow::FlowControl,
    transport::{Transport, Uart},
};

/// Bytes pulled from the UART per `process()` call. Keeps each main
/// loop iteration bounded on the MCU.
const RX_BURST: usize = 32;

/// Capability bit: the peer understands the RLE helper.
pub const CAP_RLE: u16 = 1 << 0;
/// Capability bit: the handshake is HMAC-authenticated.
pub const CAP_AUTH: u16 = 1 << 1;

/// Callback invoked for every inbound status code.
pub type StatusHandler = Box<dyn FnMut(StatusEvent) + Send>;

/// Callback invoked on safe-state entry with the pins to neutralize.
pub type PinResetHook = Box<dyn FnMut(&[u8]) + Send>;

/// One end of the RPC link. See the module docs.
pub struct Link<U: Uart, E: Environment>
where
    E::Instant: InstantArithmetic,
{
    env: E,
    transport: Transport<U>,
    parser: FrameParser,
    flow: FlowControl,
    engine: LinkEngine<E::Instant>,
    dispatcher: Dispatcher,
    status_handler: Option<StatusHandler>,
    pin_reset: Option<PinResetHook>,
    pending_baudrate: Arc<Mutex<Option<u32>>>,
}

impl<U: Uart, E: Environment> Link<U, E>
where
    E::Instant: InstantArithmetic,
{
    /// Build a link over a UART.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] for invalid watermarks or rejected secrets (the
    /// secret is validated by [`ferrolink_crypto::SharedSecret`]
    /// before it reaches the config).
    pub fn new(uart: U, env: E, config: LinkConfig) -> Result<Self, ConfigError> {
        let config = config.validated()?;
        let authenticated = config.shared_secret.is_some();
        let flow = FlowControl::new(config.rx_high_water, config.rx_low_water);
        let engine =
            LinkEngine::new(config.role, config.timing, config.shared_secret, config.hardened);
        let mut dispatcher = Dispatcher::new(config.role);

        let pending_baudrate = Arc::new(Mutex::new(None));
        if config.role.is_mcu() {
            register_system_handlers(
                &mut dispatcher,
                config.enable_rle,
                authenticated,
                &pending_baudrate,
            );
        }

        Ok(Self {
            env,
            transport: Transport::new(uart),
            parser: FrameParser::new(),
            flow,
            engine,
            dispatcher,
            status_handler: None,
            pin_reset: None,
            pending_baudrate,
        })
    }

    /// One cooperative iteration: pump received bytes, update flow
    /// control, drive timers.
    ///
    /// # Errors
    ///
    /// Transport failures only; protocol failures are answered on the
    /// wire and surfaced through the status handler.
    pub fn process(&mut self) -> Result<(), LinkError> {
        let now = self.env.now();

        for _ in 0..RX_BURST {
            let Some(byte) = self.transport.try_read() else {
                break;
            };
            match self.parser.push(byte) {
                Ok(Some(frame)) => {
                    let actions = self.engine.handle_frame(&frame, now);
                    self.run_actions(actions)?;
                },
                Ok(None) => {},
                Err(err) => {
                    let actions = self.engine.handle_parse_error(&err, now);
                    self.run_actions(actions)?;
                },
            }
        }

        let buffered = self.transport.rx_backlog() + self.parser.buffered();
        if let Some(signal) = self.flow.update(buffered) {
            self.transport.send(&flow_wire(signal), false)?;
        }

        let actions = self.engine.tick(&self.env, now);
        self.run_actions(actions)
    }

    /// Send a frame on behalf of the service layer.
    ///
    /// # Errors
    ///
    /// Typed rejection ([`LinkError`]) or transport failure; on a
    /// rejection nothing reaches the wire.
    pub fn send_frame(&mut self, command_id: u16, payload: &[u8]) -> Result<SendStatus, LinkError> {
        let now = self.env.now();
        let result = self.engine.send_frame(command_id, payload, now)?;
        let status = result.status;
        self.run_actions(result.actions)?;
        Ok(status)
    }

    /// Initiate the handshake (host role).
    ///
    /// # Errors
    ///
    /// As [`LinkEngine::begin_handshake`], plus transport failures.
    pub fn begin_handshake(&mut self) -> Result<(), LinkError> {
        let now = self.env.now();
        let actions = self.engine.begin_handshake(&self.env, now)?;
        self.run_actions(actions)
    }

    /// Force a re-handshake, optionally renegotiating timing.
    ///
    /// # Errors
    ///
    /// [`LinkError::Faulted`] after a KAT failure; transport failures.
    pub fn reset_link(
        &mut self,
        timing: Option<crate::config::TimingConfig>,
    ) -> Result<(), LinkError> {
        let now = self.env.now();
        let result = self.engine.reset_link(timing, now)?;
        self.run_actions(result.actions)
    }

    /// Enter the fail-safe state on behalf of the service layer.
    pub fn enter_safe_state(&mut self) {
        let actions = self.engine.enter_safe_state(FaultReason::External);
        // Safe-state actions perform no wire writes; the transport
        // cannot fail executing them.
        let _ = self.run_actions(actions);
    }

    /// Handshake completed and the link not reset since.
    #[must_use]
    pub fn is_synchronized(&self) -> bool {
        self.engine.is_synchronized()
    }

    /// Telemetry snapshot.
    #[must_use]
    pub fn take_snapshot(&self) -> LinkSnapshot<E::Instant> {
        self.engine.snapshot()
    }

    /// Register (or replace) a command handler.
    pub fn register_handler<F>(&mut self, command: CommandId, handler: F)
    where
        F: FnMut(
                &ferrolink_proto::Frame,
                Option<&RequestContext>,
            ) -> Result<HandlerReply, ferrolink_proto::StatusCode>
            + Send
            + 'static,
    {
        self.dispatcher.register(command, handler);
    }

    /// Install the status-handler callback.
    pub fn set_status_handler(&mut self, handler: StatusHandler) {
        self.status_handler = Some(handler);
    }

    /// Install the safe-state GPIO hook.
    pub fn set_pin_reset_hook(&mut self, hook: PinResetHook) {
        self.pin_reset = Some(hook);
    }

    /// A baudrate accepted from the peer and not yet applied. The
    /// service layer polls this after `process()` and reconfigures the
    /// UART once the ACK has flushed.
    pub fn take_pending_baudrate(&mut self) -> Option<u32> {
        self.pending_baudrate.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Direct access to the engine, for invariant checks in tests and
    /// the simulation harness.
    #[must_use]
    pub fn engine(&self) -> &LinkEngine<E::Instant> {
        &self.engine
    }

    /// The transport, for cache inspection in tests and the harness.
    #[must_use]
    pub fn transport(&self) -> &Transport<U> {
        &self.transport
    }

    fn run_actions(&mut self, actions: Vec<LinkAction>) -> Result<(), LinkError> {
        let mut work: VecDeque<LinkAction> = actions.into();
        while let Some(action) = work.pop_front() {
            match action {
                LinkAction::Transmit { wire, cache } => self.transport.send(&wire, cache)?,
                LinkAction::Retransmit => {
                    self.transport.retransmit()?;
                },
                LinkAction::ClearCache => self.transport.clear_cache(),
                LinkAction::ResetRx => {
                    self.parser.reset();
                    self.flow.reset();
                },
                LinkAction::ResetPins(pins) => {
                    if let Some(hook) = &mut self.pin_reset {
                        hook(&pins);
                    }
                },
                LinkAction::Notify(event) => {
                    if let Some(handler) = &mut self.status_handler {
                        handler(event);
                    }
                },
                LinkAction::Dispatch { frame, context } => {
                    let outcome = self.dispatcher.dispatch(&frame, context.as_ref());
                    let now = self.env.now();
                    let more = self.engine.complete_dispatch(&frame, &outcome, now);
                    work.extend(more);
                },
            }
        }
        Ok(())
    }
}

/// Default MCU-side handlers for the system commands the engine does
/// not intercept. The service layer may replace any of them.
fn register_system_handlers(
    dispatcher: &mut Dispatcher,
    enable_rle: bool,
    authenticated: bool,
    pending_baudrate: &Arc<Mutex<Option<u32>>>,
) {
    dispatcher.register(CommandId::Version, |_, _| {
        Ok(HandlerReply::Response(env!("CARGO_PKG_VERSION").as_bytes().to_vec()))
    });

    // Overridden by firmware that can actually measure its heap.
    dispatcher.register(CommandId::FreeMemory, |_, _| {
        Ok(HandlerReply::Response(0u32.to_be_bytes().to_vec()))
    });

    dispatcher.register(CommandId::GetCapabilities, move |_, _| {
        let mut features = 0u16;
        if enable_rle {
            features |= CAP_RLE;
        }
        if authenticated {
            features |= CAP_AUTH;
        }
        let mut payload = Vec::with_capacity(5);
        payload.push(ferrolink_proto::PROTO_VERSION);
        payload.extend_from_slice(&(ferrolink_proto::MAX_PAYLOAD_SIZE as u16).to_be_bytes());
        payload.extend_from_slice(&features.to_be_bytes());
        Ok(HandlerReply::Response(payload))
    });

    let slot = Arc::clone(pending_baudrate);
    dispatcher.register(CommandId::SetBaudrate, move |frame, _| {
        let mut reader = ByteReader::new(&frame.payload);
        let baud = reader.read_u32().unwrap_or_default();
        if baud == 0 {
            return Err(ferrolink_proto::StatusCode::Error);
        }
        if let Ok(mut pending) = slot.lock() {
            *pending = Some(baud);
        }
        Ok(HandlerReply::None)
    });
}
