//! Cooperative-async host driver.
//!
//! Wraps the pure [`LinkEngine`] in a tokio task: one loop selecting
//! over serial reads, a timer tick, and a command mailbox. Suspension
//! points are exactly the awaited reads, writes and timers; there is
//! no shared state across threads - service calls travel through the
//! mailbox and resolve through oneshot channels.
//!
//! Every caller-initiated request terminates in a
//! [`RequestOutcome`]: `ok(payload)`, `timeout`, `peer_error`, or
//! `local_error`. There is no silent-drop path.

use std::time::{Duration, Instant};

use ferrolink_core::{
    ConfigError, Dispatcher, Environment, FaultReason, HandlerReply, LinkConfig, LinkError,
    LinkSnapshot, RequestOutcome, StatusEvent, TimingConfig, TransportError,
    engine::{LinkAction, LinkEngine, RequestContext, SendStatus},
};
use ferrolink_proto::{CommandId, Frame, FrameParser, StatusCode};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot},
};

use crate::env::SystemEnv;

/// Mailbox depth between service callers and the driver task.
const COMMAND_DEPTH: usize = 32;

/// Driver tick period: frequent enough to hit ACK deadlines promptly.
const TICK_PERIOD: Duration = Duration::from_millis(25);

/// Failures surfaced by the driver and its handle.
#[derive(Error, Debug)]
pub enum HostError {
    /// The driver task has exited; the handle is dangling.
    #[error("driver task is gone")]
    DriverGone,

    /// Link-layer rejection.
    #[error(transparent)]
    Link(#[from] LinkError),

    /// Serial I/O failure.
    #[error("serial I/O: {0}")]
    Io(#[from] std::io::Error),
}

enum HostCommand {
    Handshake { reply: oneshot::Sender<Result<(), LinkError>> },
    Send { command_id: u16, payload: Vec<u8>, reply: oneshot::Sender<Result<SendStatus, LinkError>> },
    Request { command_id: u16, payload: Vec<u8>, reply: oneshot::Sender<RequestOutcome> },
    Reset { timing: Option<TimingConfig>, reply: oneshot::Sender<Result<(), LinkError>> },
    Snapshot { reply: oneshot::Sender<LinkSnapshot<Instant>> },
    Shutdown,
}

/// Cloneable handle for talking to a running driver.
#[derive(Clone)]
pub struct HostHandle {
    tx: mpsc::Sender<HostCommand>,
}

impl HostHandle {
    /// Initiate the handshake.
    ///
    /// # Errors
    ///
    /// [`HostError::DriverGone`] or the engine's rejection.
    pub async fn handshake(&self) -> Result<(), HostError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(HostCommand::Handshake { reply }).await.map_err(|_| HostError::DriverGone)?;
        rx.await.map_err(|_| HostError::DriverGone)?.map_err(HostError::from)
    }

    /// Fire-and-forget send (ACK handling stays inside the link).
    ///
    /// # Errors
    ///
    /// [`HostError::DriverGone`] or the engine's rejection.
    pub async fn send(&self, command_id: u16, payload: Vec<u8>) -> Result<SendStatus, HostError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HostCommand::Send { command_id, payload, reply })
            .await
            .map_err(|_| HostError::DriverGone)?;
        rx.await.map_err(|_| HostError::DriverGone)?.map_err(HostError::from)
    }

    /// Send and await the terminal [`RequestOutcome`].
    pub async fn request(&self, command_id: u16, payload: Vec<u8>) -> RequestOutcome {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(HostCommand::Request { command_id, payload, reply })
            .await
            .is_err()
        {
            return RequestOutcome::LocalError(LinkError::Faulted {
                reason: FaultReason::External,
            });
        }
        rx.await.unwrap_or(RequestOutcome::LocalError(LinkError::Faulted {
            reason: FaultReason::External,
        }))
    }

    /// Force a re-handshake, optionally renegotiating timing.
    ///
    /// # Errors
    ///
    /// [`HostError::DriverGone`] or the engine's rejection.
    pub async fn reset_link(&self, timing: Option<TimingConfig>) -> Result<(), HostError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HostCommand::Reset { timing, reply })
            .await
            .map_err(|_| HostError::DriverGone)?;
        rx.await.map_err(|_| HostError::DriverGone)?.map_err(HostError::from)
    }

    /// Telemetry snapshot.
    ///
    /// # Errors
    ///
    /// [`HostError::DriverGone`].
    pub async fn snapshot(&self) -> Result<LinkSnapshot<Instant>, HostError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(HostCommand::Snapshot { reply }).await.map_err(|_| HostError::DriverGone)?;
        rx.await.map_err(|_| HostError::DriverGone)
    }

    /// Ask the driver to wind down cooperatively.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(HostCommand::Shutdown).await;
    }
}

struct Waiter {
    request_id: u16,
    response_id: Option<u16>,
    deadline: Instant,
    reply: oneshot::Sender<RequestOutcome>,
}

/// Everything the select-loop handlers mutate; kept apart from the
/// reader and the mailbox so the select arms borrow disjoint parts.
struct Core<W> {
    writer: W,
    env: SystemEnv,
    parser: FrameParser,
    engine: LinkEngine<Instant>,
    dispatcher: Dispatcher,
    cache: Option<Vec<u8>>,
    status_handler: Option<Box<dyn FnMut(StatusEvent) + Send>>,
    waiting: Vec<Waiter>,
    response_timeout: Duration,
}

/// The host end of the link as a tokio task.
pub struct HostDriver<R, W> {
    reader: R,
    commands: mpsc::Receiver<HostCommand>,
    core: Core<W>,
}

impl<R, W> HostDriver<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Build a driver over split serial halves.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] for invalid watermarks.
    pub fn new(reader: R, writer: W, config: LinkConfig) -> Result<(Self, HostHandle), ConfigError> {
        let config = config.validated()?;
        let response_timeout = config.timing.response_timeout();
        let engine =
            LinkEngine::new(config.role, config.timing, config.shared_secret, config.hardened);
        let dispatcher = Dispatcher::new(config.role);

        let (tx, commands) = mpsc::channel(COMMAND_DEPTH);
        let driver = Self {
            reader,
            commands,
            core: Core {
                writer,
                env: SystemEnv,
                parser: FrameParser::new(),
                engine,
                dispatcher,
                cache: None,
                status_handler: None,
                waiting: Vec::new(),
                response_timeout,
            },
        };
        Ok((driver, HostHandle { tx }))
    }

    /// Register (or replace) a command handler before starting.
    pub fn register_handler<F>(&mut self, command: CommandId, handler: F)
    where
        F: FnMut(&Frame, Option<&RequestContext>) -> Result<HandlerReply, StatusCode>
            + Send
            + 'static,
    {
        self.core.dispatcher.register(command, handler);
    }

    /// Install the status-handler callback before starting.
    pub fn set_status_handler(&mut self, handler: Box<dyn FnMut(StatusEvent) + Send>) {
        self.core.status_handler = Some(handler);
    }

    /// Run until the serial port closes or a shutdown is requested.
    ///
    /// # Errors
    ///
    /// [`HostError::Io`] on unrecoverable serial failures.
    pub async fn run(self) -> Result<(), HostError> {
        let Self { mut reader, mut commands, mut core } = self;
        let mut tick = tokio::time::interval(TICK_PERIOD);
        let mut buf = [0u8; 256];

        loop {
            tokio::select! {
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        tracing::warn!("serial port closed; shutting the link down");
                        core.shutdown();
                        return Ok(());
                    },
                    Ok(n) => core.feed(&buf[..n]).await?,
                    Err(err) => {
                        core.shutdown();
                        return Err(err.into());
                    },
                },
                _ = tick.tick() => core.tick().await?,
                command = commands.recv() => match command {
                    Some(HostCommand::Shutdown) | None => {
                        core.shutdown();
                        return Ok(());
                    },
                    Some(command) => core.handle_command(command).await?,
                },
            }
        }
    }
}

impl<W> Core<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn feed(&mut self, bytes: &[u8]) -> Result<(), HostError> {
        let now = self.env.now();
        for &byte in bytes {
            match self.parser.push(byte) {
                Ok(Some(frame)) => {
                    let actions = self.engine.handle_frame(&frame, now);
                    self.run_actions(actions).await?;
                },
                Ok(None) => {},
                Err(err) => {
                    let actions = self.engine.handle_parse_error(&err, now);
                    self.run_actions(actions).await?;
                },
            }
        }
        Ok(())
    }

    async fn tick(&mut self) -> Result<(), HostError> {
        let now = self.env.now();
        let actions = self.engine.tick(&self.env, now);
        self.run_actions(actions).await?;

        // Requests that outlived the response timeout resolve Timeout.
        let expired: Vec<Waiter> = {
            let (expired, alive) =
                std::mem::take(&mut self.waiting).into_iter().partition(|w| w.deadline <= now);
            self.waiting = alive;
            expired
        };
        for waiter in expired {
            tracing::debug!(command_id = waiter.request_id, "request timed out");
            let _ = waiter.reply.send(RequestOutcome::Timeout);
        }
        Ok(())
    }

    async fn handle_command(&mut self, command: HostCommand) -> Result<(), HostError> {
        let now = self.env.now();
        match command {
            HostCommand::Handshake { reply } => {
                match self.engine.begin_handshake(&self.env, now) {
                    Ok(actions) => {
                        self.run_actions(actions).await?;
                        let _ = reply.send(Ok(()));
                    },
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    },
                }
            },
            HostCommand::Send { command_id, payload, reply } => {
                match self.engine.send_frame(command_id, &payload, now) {
                    Ok(result) => {
                        self.run_actions(result.actions).await?;
                        let _ = reply.send(Ok(result.status));
                    },
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    },
                }
            },
            HostCommand::Request { command_id, payload, reply } => {
                match self.engine.send_frame(command_id, &payload, now) {
                    Ok(result) => {
                        self.run_actions(result.actions).await?;
                        let response_id =
                            CommandId::from_u16(command_id).and_then(CommandId::response);
                        self.waiting.push(Waiter {
                            request_id: command_id,
                            response_id: response_id.map(CommandId::to_u16),
                            deadline: now + self.response_timeout,
                            reply,
                        });
                    },
                    Err(err) => {
                        let _ = reply.send(RequestOutcome::LocalError(err));
                    },
                }
            },
            HostCommand::Reset { timing, reply } => match self.engine.reset_link(timing, now) {
                Ok(result) => {
                    self.run_actions(result.actions).await?;
                    let _ = reply.send(Ok(()));
                },
                Err(err) => {
                    let _ = reply.send(Err(err));
                },
            },
            HostCommand::Snapshot { reply } => {
                let _ = reply.send(self.engine.snapshot());
            },
            HostCommand::Shutdown => {},
        }
        Ok(())
    }

    async fn run_actions(&mut self, actions: Vec<LinkAction>) -> Result<(), HostError> {
        let mut work: std::collections::VecDeque<LinkAction> = actions.into();
        while let Some(action) = work.pop_front() {
            match action {
                LinkAction::Transmit { wire, cache } => {
                    self.write_wire(&wire).await?;
                    if cache {
                        self.cache = Some(wire);
                    }
                },
                LinkAction::Retransmit => {
                    if let Some(wire) = self.cache.clone() {
                        self.write_wire(&wire).await?;
                    }
                },
                LinkAction::ClearCache => self.cache = None,
                LinkAction::ResetRx => self.parser.reset(),
                LinkAction::ResetPins(pins) => {
                    // The host drives no GPIO; the pins burned into the
                    // action belong to the MCU role.
                    tracing::debug!(?pins, "pin reset ignored on the host role");
                },
                LinkAction::Notify(event) => self.notify(event),
                LinkAction::Dispatch { frame, context } => {
                    self.resolve_response(&frame);
                    let outcome = self.dispatcher.dispatch(&frame, context.as_ref());
                    let now = self.env.now();
                    let more = self.engine.complete_dispatch(&frame, &outcome, now);
                    work.extend(more);
                },
            }
        }
        Ok(())
    }

    async fn write_wire(&mut self, wire: &[u8]) -> Result<(), HostError> {
        match tokio::time::timeout(self.response_timeout, self.writer.write_all(wire)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.into()),
            Err(_elapsed) => Err(LinkError::Transport(TransportError::WriteTimeout).into()),
        }
    }

    fn notify(&mut self, event: StatusEvent) {
        // Status codes resolve requests before the user callback runs,
        // so a callback that drops the handle cannot orphan a waiter.
        match event.code {
            StatusCode::Ack => {
                self.resolve_first(
                    |w| w.response_id.is_none() && w.request_id == event.command_id,
                    RequestOutcome::Ok(Vec::new()),
                );
            },
            StatusCode::Timeout => {
                self.resolve_first(|w| w.request_id == event.command_id, RequestOutcome::Timeout);
            },
            StatusCode::Error
            | StatusCode::CmdUnknown
            | StatusCode::Malformed
            | StatusCode::Overflow
            | StatusCode::CrcMismatch
            | StatusCode::NotImplemented => {
                self.resolve_first(
                    |w| w.request_id == event.command_id,
                    RequestOutcome::PeerError {
                        status: event.code,
                        message: format!("peer answered {:?}", event.code),
                    },
                );
            },
            StatusCode::Ok => {},
        }

        if let Some(handler) = &mut self.status_handler {
            handler(event);
        }
    }

    fn resolve_response(&mut self, frame: &Frame) {
        let payload = frame.payload.to_vec();
        self.resolve_first(
            |w| w.response_id == Some(frame.command_id),
            RequestOutcome::Ok(payload),
        );
    }

    fn resolve_first<P>(&mut self, predicate: P, outcome: RequestOutcome)
    where
        P: Fn(&Waiter) -> bool,
    {
        if let Some(index) = self.waiting.iter().position(predicate) {
            let waiter = self.waiting.remove(index);
            let _ = waiter.reply.send(outcome);
        }
    }

    /// Cooperative cancellation: drain queues, mark unsynchronized,
    /// resolve outstanding requests. No handler runs afterwards.
    fn shutdown(&mut self) {
        let actions = self.engine.shutdown();
        for action in actions {
            match action {
                LinkAction::ClearCache => self.cache = None,
                LinkAction::ResetRx => self.parser.reset(),
                _ => {},
            }
        }
        for waiter in self.waiting.drain(..) {
            let _ = waiter
                .reply
                .send(RequestOutcome::LocalError(LinkError::Faulted {
                    reason: FaultReason::External,
                }));
        }
    }
}
