//! Command taxonomy: the closed id enumeration and per-command metadata.
//!
//! Command ids are partitioned into disjoint ranges: status 0x30–0x3F,
//! system 0x40–0x4F, GPIO 0x50–0x5F, console 0x60, datastore 0x70–0x7F,
//! mailbox 0x80–0x8F, filesystem 0x90–0x9F, process 0xA0–0xAF. Each
//! command carries three metadata facets: its direction, its reply kind
//! (fire-and-forget ACK vs. a paired `*Resp` frame), and whether it has
//! side effects (the duplicate-suppression set).
//!
//! The numeric values are part of the wire contract and asserted by a
//! unit test; reordering variants must not change them.

use crate::wire::ByteReader;

/// First id of the system range. Ids below [`SERVICE_RANGE_START`] and
/// at or above this value may be sent before the link is synchronized.
pub const SYSTEM_RANGE_START: u16 = 0x40;
/// One past the last id of the system range.
pub const SYSTEM_RANGE_END: u16 = 0x50;
/// First id of the service ranges (GPIO and up).
pub const SERVICE_RANGE_START: u16 = 0x50;

/// ACK payload sentinel meaning "acknowledges whatever is in flight".
pub const GENERIC_ACK_TARGET: u16 = 0xFFFF;

/// Which way a command may travel over the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host to MCU only.
    ToMcu,
    /// MCU to host only.
    ToHost,
    /// Either direction.
    Both,
}

impl Direction {
    /// True if a peer of the given kind may receive this command.
    #[must_use]
    pub fn valid_inbound(self, receiver_is_mcu: bool) -> bool {
        match self {
            Self::ToMcu => receiver_is_mcu,
            Self::ToHost => !receiver_is_mcu,
            Self::Both => true,
        }
    }
}

/// What the receiver owes the sender for a given command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// No reply at all (responses, XON/XOFF).
    None,
    /// `STATUS_ACK` carrying the original command id.
    Ack,
    /// A paired response frame.
    Response(CommandId),
}

/// Static facts about a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandMeta {
    /// Allowed direction of travel.
    pub direction: Direction,
    /// Reply obligation of the receiver.
    pub reply: ReplyKind,
    /// True for commands whose re-execution must be suppressed when a
    /// retransmission is detected.
    pub side_effecting: bool,
}

/// The closed command enumeration (excluding the status range, which is
/// modeled by [`crate::StatusCode`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
#[allow(missing_docs)] // names mirror the wire protocol table
pub enum CommandId {
    Version = 0x40,
    VersionResp = 0x41,
    FreeMemory = 0x42,
    FreeMemoryResp = 0x43,
    LinkSync = 0x44,
    LinkSyncResp = 0x45,
    LinkReset = 0x46,
    SetBaudrate = 0x47,
    GetCapabilities = 0x48,
    GetCapabilitiesResp = 0x49,
    Xoff = 0x4A,
    Xon = 0x4B,

    SetPinMode = 0x50,
    DigitalWrite = 0x51,
    DigitalRead = 0x52,
    DigitalReadResp = 0x53,
    AnalogWrite = 0x54,
    AnalogRead = 0x55,
    AnalogReadResp = 0x56,

    ConsoleWrite = 0x60,

    DatastorePut = 0x70,
    DatastoreGet = 0x71,
    DatastoreGetResp = 0x72,

    MailboxPush = 0x80,
    MailboxRead = 0x81,
    MailboxReadResp = 0x82,
    MailboxAvailable = 0x83,
    MailboxAvailableResp = 0x84,

    FileWrite = 0x90,
    FileRead = 0x91,
    FileReadResp = 0x92,
    FileRemove = 0x93,

    ProcessRun = 0xA0,
    ProcessRunResp = 0xA1,
    ProcessRunAsync = 0xA2,
    ProcessRunAsyncResp = 0xA3,
    ProcessPoll = 0xA4,
    ProcessPollResp = 0xA5,
    ProcessKill = 0xA6,
}

impl CommandId {
    /// Map a wire id to the enumeration. `None` for unassigned ids.
    #[must_use]
    pub fn from_u16(id: u16) -> Option<Self> {
        match id {
            0x40 => Some(Self::Version),
            0x41 => Some(Self::VersionResp),
            0x42 => Some(Self::FreeMemory),
            0x43 => Some(Self::FreeMemoryResp),
            0x44 => Some(Self::LinkSync),
            0x45 => Some(Self::LinkSyncResp),
            0x46 => Some(Self::LinkReset),
            0x47 => Some(Self::SetBaudrate),
            0x48 => Some(Self::GetCapabilities),
            0x49 => Some(Self::GetCapabilitiesResp),
            0x4A => Some(Self::Xoff),
            0x4B => Some(Self::Xon),
            0x50 => Some(Self::SetPinMode),
            0x51 => Some(Self::DigitalWrite),
            0x52 => Some(Self::DigitalRead),
            0x53 => Some(Self::DigitalReadResp),
            0x54 => Some(Self::AnalogWrite),
            0x55 => Some(Self::AnalogRead),
            0x56 => Some(Self::AnalogReadResp),
            0x60 => Some(Self::ConsoleWrite),
            0x70 => Some(Self::DatastorePut),
            0x71 => Some(Self::DatastoreGet),
            0x72 => Some(Self::DatastoreGetResp),
            0x80 => Some(Self::MailboxPush),
            0x81 => Some(Self::MailboxRead),
            0x82 => Some(Self::MailboxReadResp),
            0x83 => Some(Self::MailboxAvailable),
            0x84 => Some(Self::MailboxAvailableResp),
            0x90 => Some(Self::FileWrite),
            0x91 => Some(Self::FileRead),
            0x92 => Some(Self::FileReadResp),
            0x93 => Some(Self::FileRemove),
            0xA0 => Some(Self::ProcessRun),
            0xA1 => Some(Self::ProcessRunResp),
            0xA2 => Some(Self::ProcessRunAsync),
            0xA3 => Some(Self::ProcessRunAsyncResp),
            0xA4 => Some(Self::ProcessPoll),
            0xA5 => Some(Self::ProcessPollResp),
            0xA6 => Some(Self::ProcessKill),
            _ => None,
        }
    }

    /// The wire id.
    #[must_use]
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// True for ids in the system range (allowed before handshake).
    #[must_use]
    pub fn is_system(self) -> bool {
        (SYSTEM_RANGE_START..SYSTEM_RANGE_END).contains(&self.to_u16())
    }

    /// Static metadata for this command.
    #[must_use]
    pub fn meta(self) -> CommandMeta {
        use Direction::{Both, ToHost, ToMcu};
        let meta = |direction, reply, side_effecting| CommandMeta { direction, reply, side_effecting };

        match self {
            Self::Version => meta(ToMcu, ReplyKind::Response(Self::VersionResp), false),
            Self::FreeMemory => meta(ToMcu, ReplyKind::Response(Self::FreeMemoryResp), false),
            Self::LinkSync => meta(ToMcu, ReplyKind::Response(Self::LinkSyncResp), false),
            Self::LinkReset => meta(Both, ReplyKind::Ack, false),
            Self::SetBaudrate => meta(ToMcu, ReplyKind::Ack, false),
            Self::GetCapabilities => {
                meta(ToMcu, ReplyKind::Response(Self::GetCapabilitiesResp), false)
            },
            Self::Xoff | Self::Xon => meta(Both, ReplyKind::None, false),

            Self::SetPinMode => meta(ToMcu, ReplyKind::Ack, true),
            Self::DigitalWrite => meta(ToMcu, ReplyKind::Ack, true),
            Self::DigitalRead => meta(ToMcu, ReplyKind::Response(Self::DigitalReadResp), false),
            Self::AnalogWrite => meta(ToMcu, ReplyKind::Ack, true),
            Self::AnalogRead => meta(ToMcu, ReplyKind::Response(Self::AnalogReadResp), false),

            Self::ConsoleWrite => meta(Both, ReplyKind::Ack, true),

            Self::DatastorePut => meta(Both, ReplyKind::Ack, true),
            Self::DatastoreGet => meta(Both, ReplyKind::Response(Self::DatastoreGetResp), false),

            Self::MailboxPush => meta(Both, ReplyKind::Ack, true),
            Self::MailboxRead => meta(ToMcu, ReplyKind::Response(Self::MailboxReadResp), false),
            Self::MailboxAvailable => {
                meta(ToMcu, ReplyKind::Response(Self::MailboxAvailableResp), false)
            },

            Self::FileWrite => meta(ToHost, ReplyKind::Ack, true),
            Self::FileRead => meta(ToHost, ReplyKind::Response(Self::FileReadResp), false),
            Self::FileRemove => meta(ToHost, ReplyKind::Ack, true),

            Self::ProcessRun => meta(ToHost, ReplyKind::Response(Self::ProcessRunResp), false),
            Self::ProcessRunAsync => {
                meta(ToHost, ReplyKind::Response(Self::ProcessRunAsyncResp), false)
            },
            Self::ProcessPoll => meta(ToHost, ReplyKind::Response(Self::ProcessPollResp), false),
            Self::ProcessKill => meta(ToHost, ReplyKind::Ack, true),

            Self::VersionResp => meta(ToHost, ReplyKind::None, false),
            Self::FreeMemoryResp => meta(ToHost, ReplyKind::None, false),
            Self::LinkSyncResp => meta(ToHost, ReplyKind::None, false),
            Self::GetCapabilitiesResp => meta(ToHost, ReplyKind::None, false),
            Self::DigitalReadResp => meta(ToHost, ReplyKind::None, false),
            Self::AnalogReadResp => meta(ToHost, ReplyKind::None, false),
            Self::DatastoreGetResp => meta(Both, ReplyKind::None, false),
            Self::MailboxReadResp => meta(ToHost, ReplyKind::None, false),
            Self::MailboxAvailableResp => meta(ToHost, ReplyKind::None, false),
            Self::FileReadResp => meta(ToMcu, ReplyKind::None, false),
            Self::ProcessRunResp => meta(ToMcu, ReplyKind::None, false),
            Self::ProcessRunAsyncResp => meta(ToMcu, ReplyKind::None, false),
            Self::ProcessPollResp => meta(ToMcu, ReplyKind::None, false),
        }
    }

    /// True if the receiver must answer with `STATUS_ACK`.
    #[must_use]
    pub fn requires_ack(self) -> bool {
        self.meta().reply == ReplyKind::Ack
    }

    /// The paired response command, if any.
    #[must_use]
    pub fn response(self) -> Option<CommandId> {
        match self.meta().reply {
            ReplyKind::Response(resp) => Some(resp),
            ReplyKind::None | ReplyKind::Ack => None,
        }
    }

    /// Validate a payload against this command's declared layout.
    ///
    /// Request shapes validate exactly. Response shapes with inner
    /// length fields tolerate a truncated tail (the sender may have cut
    /// the payload at [`crate::MAX_PAYLOAD_SIZE`]), but never trailing
    /// garbage.
    ///
    /// # Errors
    ///
    /// Returns the violated rule as a static string, suitable for the
    /// `Malformed` status path.
    pub fn validate_payload(self, payload: &[u8]) -> Result<(), &'static str> {
        let mut r = ByteReader::new(payload);
        match self {
            Self::Version
            | Self::FreeMemory
            | Self::GetCapabilities
            | Self::MailboxRead
            | Self::MailboxAvailable
            | Self::Xoff
            | Self::Xon => expect_empty(&r, "expected empty payload"),

            Self::VersionResp | Self::ConsoleWrite => Ok(()),

            Self::FreeMemoryResp => expect_len(payload, 4, "expected free:u32"),
            Self::SetBaudrate => expect_len(payload, 4, "expected baud:u32"),
            Self::GetCapabilitiesResp => {
                expect_len(payload, 5, "expected version:u8 max_payload:u16 features:u16")
            },

            Self::LinkSync => expect_len(payload, 16, "expected nonce[16]"),
            Self::LinkSyncResp => {
                if payload.len() == 16 || payload.len() == 32 {
                    Ok(())
                } else {
                    Err("expected nonce[16] or nonce[16] || tag[16]")
                }
            },
            Self::LinkReset => {
                if payload.is_empty() || payload.len() == 7 {
                    Ok(())
                } else {
                    Err("expected empty or ack:u16 retry:u8 response:u32")
                }
            },

            Self::SetPinMode => {
                let (Some(_), Some(mode)) = (r.read_u8(), r.read_u8()) else {
                    return Err("expected pin:u8 mode:u8");
                };
                if mode > 2 {
                    return Err("mode out of range");
                }
                expect_empty(&r, "trailing bytes after mode")
            },
            Self::DigitalWrite => {
                let (Some(_), Some(value)) = (r.read_u8(), r.read_u8()) else {
                    return Err("expected pin:u8 value:u8");
                };
                if value > 1 {
                    return Err("value out of range");
                }
                expect_empty(&r, "trailing bytes after value")
            },
            Self::AnalogWrite => expect_len(payload, 2, "expected pin:u8 value:u8"),
            Self::DigitalRead | Self::AnalogRead => expect_len(payload, 1, "expected pin:u8"),
            Self::DigitalReadResp => expect_len(payload, 1, "expected value:u8"),
            Self::AnalogReadResp => expect_len(payload, 2, "expected value:u16"),

            Self::DatastorePut => {
                take_chunk8(&mut r, true)?;
                take_chunk8(&mut r, false)?;
                expect_empty(&r, "trailing bytes after value")
            },
            Self::DatastoreGet => {
                take_chunk8(&mut r, true)?;
                expect_empty(&r, "trailing bytes after key")
            },
            Self::DatastoreGetResp => {
                lenient_chunk8(&mut r);
                expect_empty(&r, "trailing bytes after value")
            },

            Self::MailboxPush => {
                take_chunk16(&mut r)?;
                expect_empty(&r, "trailing bytes after message")
            },
            Self::MailboxReadResp => {
                lenient_chunk16(&mut r);
                expect_empty(&r, "trailing bytes after message")
            },
            Self::MailboxAvailableResp => expect_len(payload, 1, "expected count:u8"),

            Self::FileWrite => {
                take_chunk8(&mut r, true)?;
                take_chunk16(&mut r)?;
                expect_empty(&r, "trailing bytes after data")
            },
            Self::FileRead | Self::FileRemove => {
                take_chunk8(&mut r, true)?;
                expect_empty(&r, "trailing bytes after path")
            },
            Self::FileReadResp => {
                lenient_chunk16(&mut r);
                expect_empty(&r, "trailing bytes after data")
            },

            Self::ProcessRun | Self::ProcessRunAsync => {
                if payload.is_empty() { Err("empty command line") } else { Ok(()) }
            },
            Self::ProcessRunResp => {
                if r.read_u8().is_none() {
                    return Err("expected status:u8");
                }
                lenient_chunk16(&mut r);
                lenient_chunk16(&mut r);
                expect_empty(&r, "trailing bytes after stderr")
            },
            Self::ProcessRunAsyncResp => expect_len(payload, 2, "expected pid:u16"),
            Self::ProcessPoll | Self::ProcessKill => expect_len(payload, 2, "expected pid:u16"),
            Self::ProcessPollResp => {
                let (Some(_), Some(_)) = (r.read_u8(), r.read_u8()) else {
                    return Err("expected status:u8 exit_code:u8");
                };
                lenient_chunk16(&mut r);
                lenient_chunk16(&mut r);
                expect_empty(&r, "trailing bytes after stderr")
            },
        }
    }
}

fn expect_empty(reader: &ByteReader<'_>, reason: &'static str) -> Result<(), &'static str> {
    if reader.is_empty() { Ok(()) } else { Err(reason) }
}

fn expect_len(payload: &[u8], len: usize, reason: &'static str) -> Result<(), &'static str> {
    if payload.len() == len { Ok(()) } else { Err(reason) }
}

/// Exact `len:u8` + bytes chunk. `nonempty` additionally requires a
/// nonzero length (keys and paths).
fn take_chunk8(reader: &mut ByteReader<'_>, nonempty: bool) -> Result<(), &'static str> {
    let Some(len) = reader.read_u8() else {
        return Err("missing length byte");
    };
    if nonempty && len == 0 {
        return Err("empty key or path");
    }
    if reader.take(len as usize).is_none() {
        return Err("length byte overruns payload");
    }
    Ok(())
}

/// Exact `len:u16` + bytes chunk.
fn take_chunk16(reader: &mut ByteReader<'_>) -> Result<(), &'static str> {
    let Some(len) = reader.read_u16() else {
        return Err("missing length field");
    };
    if reader.take(len as usize).is_none() {
        return Err("length field overruns payload");
    }
    Ok(())
}

/// Truncation-tolerant `len:u8` chunk: a missing field or a short tail
/// drains the reader instead of failing.
fn lenient_chunk8(reader: &mut ByteReader<'_>) {
    let Some(len) = reader.read_u8() else {
        return;
    };
    if reader.take(len as usize).is_none() {
        reader.take_rest();
    }
}

/// Truncation-tolerant `len:u16` chunk.
fn lenient_chunk16(reader: &mut ByteReader<'_>) {
    if reader.remaining() < 2 {
        reader.take_rest();
        return;
    }
    let Some(len) = reader.read_u16() else {
        return;
    };
    if reader.take(len as usize).is_none() {
        reader.take_rest();
    }
}
