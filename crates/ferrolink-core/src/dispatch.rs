//! Command dispatcher: classification, direction and shape checks, ACK
//! obligation, and handler routing.
//!
//! For each received, CRC-valid frame the dispatcher decides what the
//! peer is owed (`STATUS_ACK`, a `*Resp` frame, a rejection status, or
//! nothing) and which registered handler runs. Handlers return
//! synchronously; long work belongs to the service layer behind them.
//!
//! The dispatcher is deliberately free of link state: gating, duplicate
//! suppression and the handshake happen in the engine before a frame
//! gets here. Its outcome is folded back into the engine with
//! [`crate::engine::LinkEngine::complete_dispatch`].

use std::collections::HashMap;

use ferrolink_proto::{CommandId, Frame, MAX_PAYLOAD_SIZE, ReplyKind, StatusCode};

use crate::{config::Role, engine::RequestContext};

/// What a handler produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerReply {
    /// Nothing to send back (ACK-only commands, responses).
    None,
    /// Response payload for a request/response command.
    Response(Vec<u8>),
}

/// A registered command handler.
///
/// Returning `Err(status)` answers the frame with that status code
/// instead of an ACK or response.
pub type CommandHandler =
    Box<dyn FnMut(&Frame, Option<&RequestContext>) -> Result<HandlerReply, StatusCode> + Send>;

/// What the engine must put on the wire for a dispatched frame.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Status frame to emit: `(code, original command id)`.
    pub status: Option<(StatusCode, u16)>,
    /// Response frame to emit: `(response id, payload)`.
    pub reply: Option<(u16, Vec<u8>)>,
    /// A handler ran to completion (drives the duplicate fingerprint).
    pub executed: bool,
}

/// Handler registry plus the checks of the dispatch pipeline.
pub struct Dispatcher {
    role: Role,
    handlers: HashMap<u16, CommandHandler>,
}

impl Dispatcher {
    /// An empty registry for one side of the link.
    #[must_use]
    pub fn new(role: Role) -> Self {
        Self { role, handlers: HashMap::new() }
    }

    /// Register (or replace) the handler for a command.
    pub fn register<F>(&mut self, command: CommandId, handler: F)
    where
        F: FnMut(&Frame, Option<&RequestContext>) -> Result<HandlerReply, StatusCode>
            + Send
            + 'static,
    {
        self.handlers.insert(command.to_u16(), Box::new(handler));
    }

    /// True if a handler is registered for the command.
    #[must_use]
    pub fn is_registered(&self, command: CommandId) -> bool {
        self.handlers.contains_key(&command.to_u16())
    }

    /// Run the dispatch pipeline for one frame.
    pub fn dispatch(&mut self, frame: &Frame, context: Option<&RequestContext>) -> DispatchOutcome {
        let id = frame.command_id;
        debug_assert!(!StatusCode::in_range(id), "status frames are the engine's business");

        let Some(command) = CommandId::from_u16(id) else {
            tracing::debug!(command_id = id, "unknown command");
            return DispatchOutcome {
                status: Some((StatusCode::CmdUnknown, id)),
                ..DispatchOutcome::default()
            };
        };

        let meta = command.meta();
        if !meta.direction.valid_inbound(self.role.is_mcu()) {
            tracing::debug!(command_id = id, "command from the wrong direction");
            return DispatchOutcome {
                status: Some((StatusCode::CmdUnknown, id)),
                ..DispatchOutcome::default()
            };
        }

        if let Err(reason) = command.validate_payload(&frame.payload) {
            tracing::debug!(command_id = id, reason, "payload shape rejected");
            return DispatchOutcome {
                status: Some((StatusCode::Malformed, id)),
                ..DispatchOutcome::default()
            };
        }

        let Some(handler) = self.handlers.get_mut(&id) else {
            return match meta.reply {
                // Nobody consumes this response; that is not an error.
                ReplyKind::None => DispatchOutcome::default(),
                ReplyKind::Ack | ReplyKind::Response(_) => {
                    tracing::debug!(command_id = id, "no handler registered");
                    DispatchOutcome {
                        status: Some((StatusCode::NotImplemented, id)),
                        ..DispatchOutcome::default()
                    }
                },
            };
        };

        match handler(frame, context) {
            Ok(reply) => self.settle(command, meta.reply, reply),
            Err(code) => DispatchOutcome {
                status: Some((code, id)),
                ..DispatchOutcome::default()
            },
        }
    }

    fn settle(
        &self,
        command: CommandId,
        obligation: ReplyKind,
        reply: HandlerReply,
    ) -> DispatchOutcome {
        let id = command.to_u16();
        match obligation {
            ReplyKind::Ack => DispatchOutcome {
                status: Some((StatusCode::Ack, id)),
                reply: None,
                executed: true,
            },
            ReplyKind::Response(resp) => match reply {
                HandlerReply::Response(payload) => DispatchOutcome {
                    status: None,
                    reply: Some((resp.to_u16(), truncate_reply(resp, payload))),
                    executed: true,
                },
                HandlerReply::None => DispatchOutcome {
                    status: Some((StatusCode::NotImplemented, id)),
                    reply: None,
                    executed: false,
                },
            },
            ReplyKind::None => DispatchOutcome { status: None, reply: None, executed: true },
        }
    }
}

/// Cap a response payload at the wire limit. Inner length fields keep
/// their declared values; receivers tolerate the truncated tail.
fn truncate_reply(resp: CommandId, mut payload: Vec<u8>) -> Vec<u8> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        tracing::warn!(
            command_id = resp.to_u16(),
            size = payload.len(),
            "response truncated to {MAX_PAYLOAD_SIZE} bytes"
        );
        payload.truncate(MAX_PAYLOAD_SIZE);
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(command: CommandId, payload: &[u8]) -> Frame {
        Frame::new(command.to_u16(), payload.to_vec()).unwrap()
    }

    #[test]
    fn ack_only_command_acks_and_executes() {
        let mut dispatcher = Dispatcher::new(Role::Mcu);
        let mut writes = Vec::new();
        let log = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = log.clone();
        dispatcher.register(CommandId::DigitalWrite, move |frame, _| {
            sink.lock().unwrap().push((frame.payload[0], frame.payload[1]));
            Ok(HandlerReply::None)
        });

        let outcome = dispatcher.dispatch(&frame(CommandId::DigitalWrite, &[13, 1]), None);
        writes.extend(log.lock().unwrap().iter().copied());
        assert_eq!(writes, vec![(13, 1)]);
        assert_eq!(outcome.status, Some((StatusCode::Ack, 0x51)));
        assert_eq!(outcome.reply, None);
        assert!(outcome.executed);
    }

    #[test]
    fn request_response_command_replies() {
        let mut dispatcher = Dispatcher::new(Role::Mcu);
        dispatcher.register(CommandId::AnalogRead, |_, _| {
            Ok(HandlerReply::Response(vec![0x03, 0xFF]))
        });

        let outcome = dispatcher.dispatch(&frame(CommandId::AnalogRead, &[5]), None);
        assert_eq!(outcome.status, None);
        assert_eq!(outcome.reply, Some((CommandId::AnalogReadResp.to_u16(), vec![0x03, 0xFF])));
        assert!(outcome.executed);
    }

    #[test]
    fn unknown_command_answered() {
        let mut dispatcher = Dispatcher::new(Role::Mcu);
        let unknown = Frame::new(0x5F, Vec::new()).unwrap();
        let outcome = dispatcher.dispatch(&unknown, None);
        assert_eq!(outcome.status, Some((StatusCode::CmdUnknown, 0x5F)));
        assert!(!outcome.executed);
    }

    #[test]
    fn wrong_direction_answered_as_unknown() {
        // FileWrite runs on the host; an MCU-bound FileWrite is a
        // protocol violation.
        let mut dispatcher = Dispatcher::new(Role::Mcu);
        dispatcher.register(CommandId::FileWrite, |_, _| Ok(HandlerReply::None));

        let payload = [1, b'p', 0, 1, b'x'];
        let outcome = dispatcher.dispatch(&frame(CommandId::FileWrite, &payload), None);
        assert_eq!(outcome.status, Some((StatusCode::CmdUnknown, 0x90)));
        assert!(!outcome.executed);
    }

    #[test]
    fn bad_shape_answered_malformed_and_handler_skipped() {
        let mut dispatcher = Dispatcher::new(Role::Mcu);
        let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = ran.clone();
        dispatcher.register(CommandId::DigitalWrite, move |_, _| {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(HandlerReply::None)
        });

        let outcome = dispatcher.dispatch(&frame(CommandId::DigitalWrite, &[13, 9]), None);
        assert_eq!(outcome.status, Some((StatusCode::Malformed, 0x51)));
        assert!(!outcome.executed);
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn unregistered_command_not_implemented() {
        let mut dispatcher = Dispatcher::new(Role::Mcu);
        let outcome = dispatcher.dispatch(&frame(CommandId::DigitalWrite, &[13, 1]), None);
        assert_eq!(outcome.status, Some((StatusCode::NotImplemented, 0x51)));
        assert!(!outcome.executed);
    }

    #[test]
    fn unconsumed_response_is_silently_fine() {
        let mut dispatcher = Dispatcher::new(Role::Host);
        let outcome = dispatcher.dispatch(&frame(CommandId::DigitalReadResp, &[1]), None);
        assert_eq!(outcome, DispatchOutcome::default());
    }

    #[test]
    fn handler_error_becomes_status() {
        let mut dispatcher = Dispatcher::new(Role::Host);
        dispatcher.register(CommandId::FileRead, |_, _| Err(StatusCode::Error));

        let outcome = dispatcher.dispatch(&frame(CommandId::FileRead, &[1, b'p']), None);
        assert_eq!(outcome.status, Some((StatusCode::Error, 0x91)));
        assert!(!outcome.executed);
    }

    #[test]
    fn oversized_reply_truncated() {
        let mut dispatcher = Dispatcher::new(Role::Host);
        dispatcher.register(CommandId::ProcessRun, |_, _| {
            // status + stdout_len + 300 bytes of stdout
            let mut payload = vec![0u8, 0x01, 0x2C];
            payload.extend_from_slice(&[b'y'; 300]);
            Ok(HandlerReply::Response(payload))
        });

        let outcome = dispatcher.dispatch(&frame(CommandId::ProcessRun, b"yes"), None);
        let (_, payload) = outcome.reply.unwrap();
        assert_eq!(payload.len(), MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn context_reaches_handler() {
        let mut dispatcher = Dispatcher::new(Role::Host);
        let seen = std::sync::Arc::new(std::sync::Mutex::new(None));
        let sink = seen.clone();
        dispatcher.register(CommandId::DatastoreGetResp, move |_, context| {
            *sink.lock().unwrap() = context.cloned();
            Ok(HandlerReply::None)
        });

        let context = RequestContext::DatastoreKey(b"brightness".to_vec());
        dispatcher.dispatch(&frame(CommandId::DatastoreGetResp, &[1, b'7']), Some(&context));
        assert_eq!(*seen.lock().unwrap(), Some(context));
    }
}
