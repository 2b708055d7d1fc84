//! Edge-triggered XON/XOFF watermark tracking.
//!
//! The transport reports how many bytes sit in the RX path; crossing
//! the high watermark emits exactly one XOFF, dropping below the low
//! watermark exactly one XON. Repeated updates on the same side of a
//! watermark are silent.

/// Flow-control signal to put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSignal {
    /// Ask the peer to resume sending.
    Xon,
    /// Ask the peer to stop sending.
    Xoff,
}

/// Watermark tracker for the local RX path.
#[derive(Debug, Clone)]
pub struct FlowControl {
    high: usize,
    low: usize,
    /// True between an emitted XOFF and the matching XON.
    throttled: bool,
}

impl FlowControl {
    /// Tracker with the given thresholds (`low < high`).
    #[must_use]
    pub fn new(high: usize, low: usize) -> Self {
        debug_assert!(low < high);
        Self { high, low, throttled: false }
    }

    /// Report the current RX occupancy; returns a signal on a
    /// watermark crossing.
    pub fn update(&mut self, buffered: usize) -> Option<FlowSignal> {
        if !self.throttled && buffered > self.high {
            self.throttled = true;
            tracing::debug!(buffered, high = self.high, "rx above high water, emitting XOFF");
            return Some(FlowSignal::Xoff);
        }
        if self.throttled && buffered < self.low {
            self.throttled = false;
            tracing::debug!(buffered, low = self.low, "rx below low water, emitting XON");
            return Some(FlowSignal::Xon);
        }
        None
    }

    /// True between an emitted XOFF and the matching XON.
    #[must_use]
    pub fn throttled(&self) -> bool {
        self.throttled
    }

    /// Forget any outstanding XOFF (link reset or disconnect).
    pub fn reset(&mut self) {
        self.throttled = false;
    }
}
