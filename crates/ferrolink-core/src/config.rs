//! Link configuration and the timing triple exchanged in `LinkReset`.
//!
//! Every knob has a documented default and an allowed range. A value
//! outside its range snaps back to the default (not to the nearest
//! bound) with a warning; only secret validation is a hard failure.

use std::time::Duration;

use ferrolink_crypto::SharedSecret;
use ferrolink_proto::wire::{ByteReader, put_u16, put_u32};

use crate::error::ConfigError;

/// Default UART line rate.
pub const DEFAULT_BAUDRATE: u32 = 115_200;

/// Allowed per-frame ACK deadlines, milliseconds.
pub const ACK_TIMEOUT_RANGE_MS: std::ops::RangeInclusive<u16> = 20..=5000;
/// Default per-frame ACK deadline.
pub const DEFAULT_ACK_TIMEOUT_MS: u16 = 100;

/// Allowed retransmit budgets.
pub const RETRY_LIMIT_RANGE: std::ops::RangeInclusive<u8> = 1..=10;
/// Default retransmit budget.
pub const DEFAULT_RETRY_LIMIT: u8 = 3;

/// Allowed session-wide response deadlines, milliseconds.
pub const RESPONSE_TIMEOUT_RANGE_MS: std::ops::RangeInclusive<u32> = 100..=60_000;
/// Default response deadline.
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u32 = 1000;

/// Default RX buffer capacity used for the flow-control watermarks.
pub const DEFAULT_RX_CAPACITY: usize = 512;

/// Which peer this instance is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The Linux process; usually the initiator.
    Host,
    /// The microcontroller; usually the responder.
    Mcu,
}

impl Role {
    /// True for the MCU side.
    #[must_use]
    pub fn is_mcu(self) -> bool {
        matches!(self, Self::Mcu)
    }
}

/// The bounded timing triple. Exchanged on the wire in `LinkReset` as
/// `ack_timeout:u16 retry_limit:u8 response_timeout:u32` (7 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingConfig {
    /// Per-frame ACK deadline, milliseconds.
    pub ack_timeout_ms: u16,
    /// Retransmit attempts before a timeout surfaces.
    pub retry_limit: u8,
    /// Write-all and handshake-response deadline, milliseconds.
    pub response_timeout_ms: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            retry_limit: DEFAULT_RETRY_LIMIT,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
        }
    }
}

impl TimingConfig {
    /// Snap out-of-range knobs back to their defaults. Returns the
    /// validated triple and whether anything was adjusted.
    #[must_use]
    pub fn validated(self) -> (Self, bool) {
        let defaults = Self::default();
        let mut adjusted = false;

        let mut snap_u16 = |value: u16, range: std::ops::RangeInclusive<u16>, default: u16| {
            if range.contains(&value) {
                value
            } else {
                adjusted = true;
                default
            }
        };
        let ack_timeout_ms =
            snap_u16(self.ack_timeout_ms, ACK_TIMEOUT_RANGE_MS, defaults.ack_timeout_ms);

        let retry_limit = if RETRY_LIMIT_RANGE.contains(&self.retry_limit) {
            self.retry_limit
        } else {
            adjusted = true;
            defaults.retry_limit
        };

        let response_timeout_ms = if RESPONSE_TIMEOUT_RANGE_MS.contains(&self.response_timeout_ms) {
            self.response_timeout_ms
        } else {
            adjusted = true;
            defaults.response_timeout_ms
        };

        (Self { ack_timeout_ms, retry_limit, response_timeout_ms }, adjusted)
    }

    /// The ACK deadline as a `Duration`.
    #[must_use]
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.ack_timeout_ms))
    }

    /// The response deadline as a `Duration`.
    #[must_use]
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.response_timeout_ms))
    }

    /// Upper edge of the duplicate-suppression window:
    /// `ack_timeout * (retry_limit + 1)`.
    #[must_use]
    pub fn dedup_window_end(&self) -> Duration {
        self.ack_timeout() * (u32::from(self.retry_limit) + 1)
    }

    /// Serialize as the 7-byte `LinkReset` payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(7);
        put_u16(&mut out, self.ack_timeout_ms);
        out.push(self.retry_limit);
        put_u32(&mut out, self.response_timeout_ms);
        out
    }

    /// Parse a 7-byte `LinkReset` payload.
    #[must_use]
    pub fn decode(payload: &[u8]) -> Option<Self> {
        let mut reader = ByteReader::new(payload);
        let ack_timeout_ms = reader.read_u16()?;
        let retry_limit = reader.read_u8()?;
        let response_timeout_ms = reader.read_u32()?;
        reader.is_empty().then_some(Self { ack_timeout_ms, retry_limit, response_timeout_ms })
    }
}

/// The configuration envelope for one end of the link.
#[derive(Debug)]
pub struct LinkConfig {
    /// Which peer this instance is.
    pub role: Role,
    /// UART line rate.
    pub baudrate: u32,
    /// Handshake secret. `None` runs the link unauthenticated (the
    /// sync response carries the bare nonce).
    pub shared_secret: Option<SharedSecret>,
    /// Hardened profile: key the handshake MAC with an HKDF-derived
    /// subkey instead of the raw secret.
    pub hardened: bool,
    /// Timing knobs (validated on construction and on `LinkReset`).
    pub timing: TimingConfig,
    /// RX buffer capacity backing the watermarks.
    pub rx_capacity: usize,
    /// XOFF threshold in bytes.
    pub rx_high_water: usize,
    /// XON threshold in bytes.
    pub rx_low_water: usize,
    /// Advertise and use the RLE helper for repetitive payloads.
    pub enable_rle: bool,
}

impl LinkConfig {
    /// A configuration with every knob at its default.
    #[must_use]
    pub fn new(role: Role) -> Self {
        Self {
            role,
            baudrate: DEFAULT_BAUDRATE,
            shared_secret: None,
            hardened: false,
            timing: TimingConfig::default(),
            rx_capacity: DEFAULT_RX_CAPACITY,
            rx_high_water: DEFAULT_RX_CAPACITY * 3 / 4,
            rx_low_water: DEFAULT_RX_CAPACITY / 4,
            enable_rle: false,
        }
    }

    /// Validate watermarks and snap timing knobs into range.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidWatermarks`] when the thresholds are not
    /// ordered `low < high <= capacity`.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        if self.rx_low_water >= self.rx_high_water || self.rx_high_water > self.rx_capacity {
            return Err(ConfigError::InvalidWatermarks {
                low: self.rx_low_water,
                high: self.rx_high_water,
                capacity: self.rx_capacity,
            });
        }

        let (timing, adjusted) = self.timing.validated();
        if adjusted {
            tracing::warn!(?timing, "timing knobs out of range; snapped to defaults");
        }
        self.timing = timing;
        Ok(self)
    }
}
