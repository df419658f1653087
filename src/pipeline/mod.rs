pub mod accumulator;
pub mod permits;
pub mod ringbuf;
pub mod watchdog;
pub mod worker;

pub use accumulator::{
    AccumulatorState, AccumulatorStatus, CaptureEvent, CaptureListener, EncodedResult,
    FailureReason, FrameAccumulator, Notice,
};
pub use permits::{Permit, Permits};
pub use ringbuf::{RingEntry, ZslListener, ZslRingBuffer};
pub use watchdog::Watchdog;
pub use worker::Worker;
