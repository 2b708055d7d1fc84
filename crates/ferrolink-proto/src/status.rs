//! Status codes (command range 0x30–0x3F).
//!
//! Status frames report the outcome of a received frame. They never
//! require an ACK and never carry side effects; their payload, when
//! present, is the big-endian command id they refer to.

/// First id of the status range.
pub const STATUS_RANGE_START: u16 = 0x30;
/// One past the last id of the status range.
pub const STATUS_RANGE_END: u16 = 0x40;

/// Outcome codes carried in status frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum StatusCode {
    /// Request completed.
    Ok = 0x30,
    /// Request failed for a reason with no dedicated code.
    Error = 0x31,
    /// Command id not in the peer's taxonomy (or wrong direction).
    CmdUnknown = 0x32,
    /// Payload shape did not match the command's declared layout.
    Malformed = 0x33,
    /// Receive path ran out of buffer space.
    Overflow = 0x34,
    /// CRC trailer mismatch on a received frame.
    CrcMismatch = 0x35,
    /// ACK deadline elapsed after all retries.
    Timeout = 0x36,
    /// Command recognized but no handler is registered.
    NotImplemented = 0x37,
    /// Positive acknowledgement of an ACK-only command.
    Ack = 0x38,
}

impl StatusCode {
    /// True if `id` falls in the status command range.
    #[must_use]
    pub fn in_range(id: u16) -> bool {
        (STATUS_RANGE_START..STATUS_RANGE_END).contains(&id)
    }

    /// Map a wire command id to a status code.
    #[must_use]
    pub fn from_u16(id: u16) -> Option<Self> {
        match id {
            0x30 => Some(Self::Ok),
            0x31 => Some(Self::Error),
            0x32 => Some(Self::CmdUnknown),
            0x33 => Some(Self::Malformed),
            0x34 => Some(Self::Overflow),
            0x35 => Some(Self::CrcMismatch),
            0x36 => Some(Self::Timeout),
            0x37 => Some(Self::NotImplemented),
            0x38 => Some(Self::Ack),
            _ => None,
        }
    }

    /// The wire command id for this status.
    #[must_use]
    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_codes() {
        for id in STATUS_RANGE_START..STATUS_RANGE_END {
            if let Some(code) = StatusCode::from_u16(id) {
                assert_eq!(code.to_u16(), id);
            }
        }
    }

    #[test]
    fn range_check() {
        assert!(StatusCode::in_range(0x30));
        assert!(StatusCode::in_range(0x3F));
        assert!(!StatusCode::in_range(0x2F));
        assert!(!StatusCode::in_range(0x40));
    }

    #[test]
    fn unassigned_ids_have_no_code() {
        assert_eq!(StatusCode::from_u16(0x39), None);
        assert_eq!(StatusCode::from_u16(0x3F), None);
    }
}
