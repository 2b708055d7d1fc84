//! UART adapter: the `Uart` seam, the retransmit cache, and flow
//! signaling.
//!
//! The UART is exclusively owned by the transport; every read and
//! write funnels through it. The retransmit cache holds the exact wire
//! bytes of the last ACK-required frame so a retransmission is a
//! byte-for-byte replay; control frames never overwrite it.

use crate::error::TransportError;

/// The serial device behind two operations.
///
/// `write_all` is best-effort all-or-none with a time budget equal to
/// the configured response timeout; it returns `false` if the deadline
/// elapses with bytes remaining.
pub trait Uart {
    /// Non-blocking read of one byte; `None` when nothing is pending.
    fn try_read(&mut self) -> Option<u8>;

    /// Write every byte or report failure. Must not block past the
    /// response-timeout budget.
    fn write_all(&mut self, bytes: &[u8]) -> bool;

    /// Bytes queued in the device's RX path beyond what `try_read`
    /// has handed out. Feeds the flow-control watermarks; `0` is a
    /// valid answer for devices that cannot report it.
    fn rx_backlog(&self) -> usize {
        0
    }
}

/// Owns the UART, the retransmit cache, and nothing else.
#[derive(Debug)]
pub struct Transport<U> {
    uart: U,
    cache: Option<Vec<u8>>,
}

impl<U: Uart> Transport<U> {
    /// Wrap a UART.
    pub fn new(uart: U) -> Self {
        Self { uart, cache: None }
    }

    /// Non-blocking read of one byte.
    pub fn try_read(&mut self) -> Option<u8> {
        self.uart.try_read()
    }

    /// RX occupancy hint from the device.
    #[must_use]
    pub fn rx_backlog(&self) -> usize {
        self.uart.rx_backlog()
    }

    /// Write a complete wire frame. With `cache` set the bytes are
    /// retained for byte-for-byte retransmission.
    ///
    /// # Errors
    ///
    /// [`TransportError::WriteTimeout`] when the UART could not take
    /// every byte within its budget.
    pub fn send(&mut self, wire: &[u8], cache: bool) -> Result<(), TransportError> {
        if !self.uart.write_all(wire) {
            return Err(TransportError::WriteTimeout);
        }
        if cache {
            self.cache = Some(wire.to_vec());
        }
        Ok(())
    }

    /// Replay the cached frame. Returns `false` when the cache is
    /// empty (nothing in flight).
    ///
    /// # Errors
    ///
    /// [`TransportError::WriteTimeout`] as for [`Transport::send`].
    pub fn retransmit(&mut self) -> Result<bool, TransportError> {
        let Some(wire) = self.cache.as_deref() else {
            return Ok(false);
        };
        if !self.uart.write_all(wire) {
            return Err(TransportError::WriteTimeout);
        }
        Ok(true)
    }

    /// Drop the cached frame (ACK received or command abandoned).
    pub fn clear_cache(&mut self) {
        self.cache = None;
    }

    /// The cached wire bytes, if any. Exposed for invariant checks.
    #[must_use]
    pub fn cached(&self) -> Option<&[u8]> {
        self.cache.as_deref()
    }

    /// Access the underlying device.
    pub fn uart_mut(&mut self) -> &mut U {
        &mut self.uart
    }
}
