//! The link engine must hold its invariants under arbitrary frame
//! sequences: no panics, no second in-flight ACK-required frame, and
//! a bounded pending queue.

#![no_main]

use arbitrary::Arbitrary;
use ferrolink_core::{
    Role, TimingConfig,
    engine::{InstantArithmetic, LinkEngine},
};
use ferrolink_crypto::SharedSecret;
use ferrolink_proto::Frame;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct FuzzInstant(u64);

impl std::ops::Sub for FuzzInstant {
    type Output = std::time::Duration;
    fn sub(self, rhs: Self) -> std::time::Duration {
        std::time::Duration::from_millis(self.0 - rhs.0)
    }
}

impl InstantArithmetic for FuzzInstant {
    fn forward(self, delta: std::time::Duration) -> Self {
        Self(self.0 + delta.as_millis() as u64)
    }
}

#[derive(Debug, Arbitrary)]
enum Step {
    Receive { command_id: u16, payload: Vec<u8> },
    Send { command_id: u16, payload: Vec<u8> },
    Advance { millis: u16 },
}

fuzz_target!(|steps: Vec<Step>| {
    let secret = SharedSecret::new(*b"fuzzsecret123456").expect("valid secret");
    let mut engine: LinkEngine<FuzzInstant> =
        LinkEngine::new(Role::Mcu, TimingConfig::default(), Some(secret), false);
    let mut now = FuzzInstant(0);

    for step in steps {
        match step {
            Step::Receive { command_id, payload } => {
                let Ok(frame) = Frame::new(command_id, payload) else {
                    continue;
                };
                let _ = engine.handle_frame(&frame, now);
            },
            Step::Send { command_id, payload } => {
                let _ = engine.send_frame(command_id, &payload, now);
            },
            Step::Advance { millis } => {
                now = FuzzInstant(now.0 + u64::from(millis));
            },
        }

        let snapshot = engine.snapshot();
        assert!(snapshot.pending_tx <= 8);
        assert!(snapshot.retry_count <= engine.timing().retry_limit);
    }
});
