//! Simulated UART pair with fault injection.
//!
//! Two byte queues crossed between the ends. Writes land in the peer's
//! RX queue unless a scheduled fault corrupts a byte or swallows the
//! frame first. Reads are non-blocking pops, exactly like a UART FIFO.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use ferrolink_core::Uart;

#[derive(Debug, Default)]
struct Faults {
    corrupt_next: bool,
    drop_next: bool,
}

#[derive(Debug, Default)]
struct Channel {
    bytes: VecDeque<u8>,
}

/// One end of the simulated wire.
///
/// Clones share the same queues and fault flags, so a test can keep a
/// handle for injection and inspection after moving the original into
/// a `Link`.
#[derive(Clone)]
pub struct SimUart {
    rx: Arc<Mutex<Channel>>,
    tx: Arc<Mutex<Channel>>,
    tx_faults: Arc<Mutex<Faults>>,
}

/// A crossed pair: bytes written on one end arrive at the other.
#[must_use]
pub fn sim_pair() -> (SimUart, SimUart) {
    let a = Arc::new(Mutex::new(Channel::default()));
    let b = Arc::new(Mutex::new(Channel::default()));
    (
        SimUart {
            rx: Arc::clone(&a),
            tx: Arc::clone(&b),
            tx_faults: Arc::new(Mutex::new(Faults::default())),
        },
        SimUart { rx: b, tx: a, tx_faults: Arc::new(Mutex::new(Faults::default())) },
    )
}

impl SimUart {
    /// Flip one CRC byte of the next written frame.
    pub fn corrupt_next_frame(&self) {
        if let Ok(mut faults) = self.tx_faults.lock() {
            faults.corrupt_next = true;
        }
    }

    /// Swallow the next written frame entirely (lost on the wire).
    pub fn drop_next_frame(&self) {
        if let Ok(mut faults) = self.tx_faults.lock() {
            faults.drop_next = true;
        }
    }

    /// Push raw bytes into this end's RX queue, as if the peer had
    /// written them.
    pub fn inject(&self, bytes: &[u8]) {
        if let Ok(mut rx) = self.rx.lock() {
            rx.bytes.extend(bytes.iter().copied());
        }
    }

    /// Bytes waiting in this end's RX queue.
    #[must_use]
    pub fn rx_len(&self) -> usize {
        self.rx.lock().map(|rx| rx.bytes.len()).unwrap_or_default()
    }
}

impl Uart for SimUart {
    fn try_read(&mut self) -> Option<u8> {
        self.rx.lock().ok()?.bytes.pop_front()
    }

    fn write_all(&mut self, bytes: &[u8]) -> bool {
        let mut owned = bytes.to_vec();
        if let Ok(mut faults) = self.tx_faults.lock() {
            if faults.drop_next {
                faults.drop_next = false;
                tracing::debug!(len = owned.len(), "sim wire dropped a frame");
                return true;
            }
            if faults.corrupt_next && owned.len() >= 2 {
                faults.corrupt_next = false;
                // Flip the last byte before the delimiter (the low CRC
                // byte): COBS still decodes, the CRC check must fail.
                let index = owned.len() - 2;
                owned[index] ^= 0x01;
                tracing::debug!(index, "sim wire corrupted a byte");
            }
        }
        if let Ok(mut tx) = self.tx.lock() {
            tx.bytes.extend(owned);
            true
        } else {
            false
        }
    }

    fn rx_backlog(&self) -> usize {
        self.rx_len()
    }
}
